use super::*;
use stackscan_ir::{InstData, MdNode, TypeData};

const SIMPLE: &str = r#"
; ModuleID = 'demo.c'
source_filename = "demo.c"
target datalayout = "e-m:e-p270:32:32-p271:32:32-p272:64:64-i64:64-i128:128-f80:128-n8:16:32:64-S128"
target triple = "x86_64-unknown-linux-gnu"

@g = dso_local global i32 0, align 4

define dso_local i32 @sum(i32 noundef %a, i32 noundef %b) #0 !dbg !7 {
entry:
  %a.addr = alloca i32, align 4
  %b.addr = alloca i32, align 4
  store i32 %a, ptr %a.addr, align 4
  store i32 %b, ptr %b.addr, align 4
  %0 = load i32, ptr %a.addr, align 4, !dbg !12
  %1 = load i32, ptr %b.addr, align 4, !dbg !13
  %add = add nsw i32 %0, %1, !dbg !14
  ret i32 %add, !dbg !15
}

attributes #0 = { noinline nounwind optnone "frame-pointer"="all" }

!llvm.dbg.cu = !{!0}
!llvm.module.flags = !{!2, !3}

!0 = distinct !DICompileUnit(language: DW_LANG_C11, file: !1, producer: "clang")
!1 = !DIFile(filename: "demo.c", directory: "/src")
!2 = !{i32 7, !"Dwarf Version", i32 5}
!3 = !{i32 2, !"Debug Info Version", i32 3}
!7 = distinct !DISubprogram(name: "sum", scope: !1, file: !1, line: 1, type: !8, unit: !0)
!8 = !DISubroutineType(types: !9)
!9 = !{!10, !10, !10}
!10 = !DIBasicType(name: "int", size: 32, encoding: DW_ATE_signed)
!12 = !DILocation(line: 2, column: 10, scope: !7)
!13 = !DILocation(line: 2, column: 14, scope: !7)
!14 = !DILocation(line: 2, column: 12, scope: !7)
!15 = !DILocation(line: 2, column: 3, scope: !7)
"#;

#[test]
fn parses_simple_function() {
    let module = parse_module(SIMPLE).expect("parse");
    assert_eq!(module.source_filename, "demo.c");
    assert_eq!(module.data_layout.stack_align_bytes(), 16);

    let f = module.func_by_name("sum").expect("sum exists");
    let func = &module.functions[f];
    assert!(!func.is_declaration);
    assert_eq!(func.params.len(), 2);
    assert!(func.attrs.contains(stackscan_ir::FnAttrs::NOUNWIND));
    assert!(func.subprogram.is_some());

    let entry = func.entry_block().unwrap();
    assert_eq!(func.blocks[entry].name, "entry");
    assert_eq!(func.blocks[entry].insts.len(), 8);

    // First instruction: an alloca of i32 with a named result.
    let first = func.blocks[entry].insts[0];
    match &func.insts[first] {
        InstData::Alloca { allocated_ty, .. } => {
            assert!(matches!(module.types.data(*allocated_ty), TypeData::Int(32)));
        }
        other => panic!("expected alloca, got {other:?}"),
    }
    let result = func.inst_result(first).unwrap();
    assert_eq!(func.value_name(result), Some("a.addr"));

    // The add has a !dbg attachment resolving to line 2.
    let add = func.blocks[entry].insts[6];
    assert!(matches!(func.insts[add], InstData::Binary { .. }));
    let loc = func.debug_loc(add).expect("dbg on add");
    assert_eq!(module.metadata.location(loc), Some((2, 12)));

    // Subprogram file path resolves through the metadata.
    let sp = func.subprogram.unwrap();
    assert_eq!(
        module.metadata.scope_path(sp),
        Some("/src/demo.c".to_string())
    );
}

const CONTROL_FLOW: &str = r#"
define dso_local void @f(i32 noundef %n) {
entry:
  %n.addr = alloca i32, align 4
  %t = alloca [10 x i8], align 1
  store i32 %n, ptr %n.addr, align 4
  br label %for.cond

for.cond:
  %i.0 = phi i32 [ 0, %entry ], [ %inc, %for.inc ]
  %cmp = icmp slt i32 %i.0, 20
  br i1 %cmp, label %for.body, label %for.end

for.body:
  %idxprom = sext i32 %i.0 to i64
  %arrayidx = getelementptr inbounds [10 x i8], ptr %t, i64 0, i64 %idxprom
  store i8 97, ptr %arrayidx, align 1
  br label %for.inc

for.inc:
  %inc = add nsw i32 %i.0, 1
  br label %for.cond

for.end:
  ret void
}
"#;

#[test]
fn parses_loops_and_phis() {
    let module = parse_module(CONTROL_FLOW).expect("parse");
    let f = module.func_by_name("f").unwrap();
    let func = &module.functions[f];
    assert_eq!(func.blocks.len(), 5);

    // The phi has two incoming edges; the forward reference to %inc
    // resolved to the add in for.inc.
    let for_cond = func
        .blocks
        .iter()
        .find(|(_, b)| b.name == "for.cond")
        .map(|(b, _)| b)
        .unwrap();
    let phi = func.blocks[for_cond].insts[0];
    match &func.insts[phi] {
        InstData::Phi { incoming, .. } => {
            assert_eq!(incoming.len(), 2);
            let inc = incoming[1].0.as_value().expect("value operand");
            let def = func.value_inst(inc).expect("resolved");
            assert!(matches!(func.insts[def], InstData::Binary { .. }));
        }
        other => panic!("expected phi, got {other:?}"),
    }

    // getelementptr kept its source element type and both indices.
    let body = func
        .blocks
        .iter()
        .find(|(_, b)| b.name == "for.body")
        .map(|(b, _)| b)
        .unwrap();
    let gep = func.blocks[body].insts[1];
    match &func.insts[gep] {
        InstData::GetElementPtr {
            source_ty, indices, ..
        } => {
            assert!(matches!(
                module.types.data(*source_ty),
                TypeData::Array { len: 10, .. }
            ));
            assert_eq!(indices.len(), 2);
        }
        other => panic!("expected gep, got {other:?}"),
    }
}

const CALLS_AND_TYPES: &str = r#"
%struct.A = type { i32, i32, i32, i32 }

declare void @sink(ptr noundef)
declare i32 @printf(ptr noundef, ...) #1

define dso_local void @caller() {
entry:
  %obj = alloca %struct.A, align 4
  call void @sink(ptr noundef %obj)
  %call = call i32 (ptr, ...) @printf(ptr noundef @.str, i32 noundef 7)
  unreachable
}

@.str = private unnamed_addr constant [3 x i8] c"%d\00", align 1

attributes #1 = { nounwind }
"#;

#[test]
fn parses_calls_and_named_types() {
    let module = parse_module(CALLS_AND_TYPES).expect("parse");
    let caller = module.func_by_name("caller").unwrap();
    let func = &module.functions[caller];
    let entry = func.entry_block().unwrap();

    let alloca = func.blocks[entry].insts[0];
    match &func.insts[alloca] {
        InstData::Alloca { allocated_ty, .. } => {
            // The named struct resolves to its four-field body.
            match module.types.resolved(*allocated_ty) {
                TypeData::Struct { fields, .. } => assert_eq!(fields.len(), 4),
                other => panic!("expected struct body, got {other:?}"),
            }
        }
        other => panic!("expected alloca, got {other:?}"),
    }

    let call = func.blocks[entry].insts[1];
    match &func.insts[call] {
        InstData::Call { callee, args, .. } => {
            let sink = callee.as_func().expect("direct callee");
            assert_eq!(module.functions[sink].name, "sink");
            assert!(module.functions[sink].is_declaration);
            assert_eq!(args.len(), 1);
        }
        other => panic!("expected call, got {other:?}"),
    }

    // Vararg printf call with a function type in callee position.
    let printf_call = func.blocks[entry].insts[2];
    match &func.insts[printf_call] {
        InstData::Call { callee, args, .. } => {
            let printf = callee.as_func().expect("direct callee");
            assert_eq!(module.functions[printf].name, "printf");
            assert_eq!(args.len(), 2);
            assert!(args[0].value.as_global().is_some());
        }
        other => panic!("expected call, got {other:?}"),
    }

    // The declaration picked up its attribute group.
    let printf = module.func_by_name("printf").unwrap();
    assert!(module.functions[printf]
        .attrs
        .contains(stackscan_ir::FnAttrs::NOUNWIND));
}

const DBG_RECORDS: &str = r#"
define dso_local void @f() !dbg !4 {
entry:
  %buf = alloca [8 x i8], align 1
    #dbg_declare(ptr %buf, !10, !DIExpression(), !12)
  ret void
}

!4 = distinct !DISubprogram(name: "f", file: !5, line: 3, retainedNodes: !9)
!5 = !DIFile(filename: "t.c", directory: "/tmp")
!9 = !{!10}
!10 = !DILocalVariable(name: "buf", scope: !4, file: !5, line: 4, type: !11)
!11 = !DIBasicType(name: "char", size: 8)
!12 = !DILocation(line: 4, column: 8, scope: !4)
"#;

#[test]
fn parses_debug_records() {
    let module = parse_module(DBG_RECORDS).expect("parse");
    let f = module.func_by_name("f").unwrap();
    let func = &module.functions[f];
    let entry = func.entry_block().unwrap();
    let record = func.blocks[entry].insts[1];
    match &func.insts[record] {
        InstData::DebugRecord { kind, variable, .. } => {
            assert_eq!(*kind, DebugRecordKind::Declare);
            let var = variable.expect("variable ref");
            match module.metadata.node(var) {
                MdNode::LocalVariable { name, .. } => assert_eq!(name, "buf"),
                other => panic!("expected local variable, got {other:?}"),
            }
        }
        other => panic!("expected debug record, got {other:?}"),
    }
}

#[test]
fn unknown_instructions_are_opaque() {
    let text = r#"
define void @f() personality ptr @__gxx_personality_v0 {
entry:
  %x = landingpad { ptr, i32 } cleanup
  fence seq_cst
  ret void
}

declare i32 @__gxx_personality_v0(...)
"#;
    let module = parse_module(text).expect("parse");
    let f = module.func_by_name("f").unwrap();
    let func = &module.functions[f];
    let entry = func.entry_block().unwrap();
    assert!(matches!(
        func.insts[func.blocks[entry].insts[0]],
        InstData::Unknown { .. }
    ));
    assert!(matches!(
        func.insts[func.blocks[entry].insts[1]],
        InstData::Unknown { .. }
    ));
    assert!(matches!(
        func.insts[func.blocks[entry].insts[2]],
        InstData::Ret { .. }
    ));
}

#[test]
fn parse_error_carries_line_number() {
    let text = "define i32 @f(\n";
    let err = parse_module(text).unwrap_err();
    assert!(err.location.line_number >= 1);
}
