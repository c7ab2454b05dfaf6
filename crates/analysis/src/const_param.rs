//! Pointer/reference parameters that are never written through, with a
//! suggested `const`-qualified signature recovered from debug-info types.

use crate::filter::FunctionFilter;
use crate::value_utils::{as_alloca, strip_pointer_casts};
use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use stackscan_ir::{
    DwTag, FuncId, Function, InstData, MdId, MdNode, Module, Operand, ParamAttrs, Value,
};

#[derive(Clone, Debug)]
pub struct ConstParamIssue {
    pub func: FuncId,
    pub func_name: String,
    pub param_name: String,
    pub line: u32,
    pub column: u32,
    pub current_type: String,
    pub suggested_type: String,
    /// For rvalue references: the pass-by-`const&` alternative.
    pub suggested_type_alt: Option<String>,
    pub is_reference: bool,
    pub is_rvalue_ref: bool,
    /// The pointer itself is `const` but the pointee is not.
    pub pointer_const_only: bool,
    /// The pointee is a basic (cheap-to-copy) type.
    pub pointee_is_basic: bool,
}

#[derive(Default)]
struct ParamTypeInfo {
    pointee: Option<MdId>,
    /// Qualifier-stripped but typedef-preserving pointee, for display.
    pointee_display: Option<MdId>,
    is_pointer: bool,
    is_reference: bool,
    is_rvalue_reference: bool,
    pointer_const: bool,
    pointer_volatile: bool,
    pointer_restrict: bool,
    pointee_const: bool,
    pointee_volatile: bool,
    pointee_restrict: bool,
    is_double_pointer: bool,
    is_void: bool,
    is_function_pointer: bool,
}

fn build_param_type_info(module: &Module, ty: MdId) -> Option<ParamTypeInfo> {
    let md = &module.metadata;
    let mut info = ParamTypeInfo::default();

    let (top, top_quals) = md.strip_qualifiers(Some(ty));
    info.pointer_const = top_quals.is_const;
    info.pointer_volatile = top_quals.is_volatile;
    info.pointer_restrict = top_quals.is_restrict;

    let top = md.strip_typedefs(top?);
    let MdNode::DerivedType { tag, base, .. } = md.node(top) else {
        return None;
    };
    match tag {
        DwTag::PointerType => info.is_pointer = true,
        DwTag::ReferenceType => info.is_reference = true,
        DwTag::RvalueReferenceType => {
            info.is_reference = true;
            info.is_rvalue_reference = true;
        }
        _ => return None,
    }

    let (pointee, quals) = md.strip_qualifiers(*base);
    info.pointee_const = quals.is_const;
    info.pointee_volatile = quals.is_volatile;
    info.pointee_restrict = quals.is_restrict;
    info.pointee_display = pointee.or(*base);

    let Some(pointee) = pointee else {
        // Pointer with no pointee type: `void*`.
        info.is_void = true;
        return Some(info);
    };
    let pointee = md.strip_typedefs(pointee);
    info.pointee = Some(pointee);

    match md.node(pointee) {
        MdNode::DerivedType { tag, .. } => {
            if matches!(
                tag,
                DwTag::PointerType | DwTag::ReferenceType | DwTag::RvalueReferenceType
            ) {
                info.is_double_pointer = true;
            }
        }
        MdNode::SubroutineType { .. } => info.is_function_pointer = true,
        MdNode::BasicType { name } => {
            if name == "void" {
                info.is_void = true;
            }
        }
        _ => {}
    }

    Some(info)
}

struct ParamDebugInfo {
    name: String,
    ty: Option<MdId>,
    line: u32,
}

fn param_debug_info(module: &Module, func: &Function, index: usize) -> ParamDebugInfo {
    let mut info = ParamDebugInfo {
        name: func
            .value_name(func.params[index].value)
            .unwrap_or("")
            .to_string(),
        ty: None,
        line: 0,
    };
    let Some(sp) = func.subprogram else {
        return info;
    };
    let argno = index as u32 + 1;
    if let Some(var) = module.metadata.param_variable(sp, argno) {
        if let MdNode::LocalVariable { name, line, ty, .. } = module.metadata.node(var) {
            if !name.is_empty() {
                info.name = name.clone();
            }
            info.ty = *ty;
            if *line != 0 {
                info.line = *line;
            }
        }
    }
    if info.ty.is_none() {
        info.ty = module.metadata.param_type(sp, argno);
    }
    if info.line == 0 {
        info.line = module.metadata.subprogram_line(sp);
    }
    info
}

fn callee_param_is_readonly(module: &Module, callee: FuncId, arg_idx: usize) -> bool {
    let func = &module.functions[callee];
    if arg_idx >= func.params.len() {
        return false;
    }
    let dbg = param_debug_info(module, func, arg_idx);
    let Some(ty) = dbg.ty else { return false };
    let Some(info) = build_param_type_info(module, ty) else {
        return false;
    };
    if info.is_double_pointer || info.is_void || info.is_function_pointer {
        return false;
    }
    if !info.is_pointer && !info.is_reference {
        return false;
    }
    info.pointee_const
}

fn call_arg_may_write_through(
    module: &Module,
    callee: Option<FuncId>,
    arg_attrs: ParamAttrs,
    arg_idx: usize,
) -> bool {
    let Some(callee) = callee else {
        // Indirect call: assume the worst.
        return true;
    };
    let callee_fn = &module.functions[callee];
    let name = &callee_fn.name;

    if name.contains("memset") || name.contains("memcpy") || name.contains("memmove") {
        return arg_idx == 0;
    }
    if name.starts_with("llvm.dbg.")
        || name.starts_with("llvm.lifetime.")
        || name.starts_with("llvm.invariant.")
        || name.starts_with("llvm.assume")
    {
        return false;
    }
    if callee_fn.attrs.does_not_access_memory() || callee_fn.attrs.only_reads_memory() {
        return false;
    }
    if arg_idx >= callee_fn.params.len() {
        // Varargs or mismatched prototype.
        return true;
    }
    let attrs = arg_attrs | callee_fn.params[arg_idx].attrs;
    if attrs.intersects(ParamAttrs::READONLY | ParamAttrs::READNONE) {
        return false;
    }
    if attrs.contains(ParamAttrs::WRITEONLY) {
        return true;
    }
    if callee_param_is_readonly(module, callee, arg_idx) {
        return false;
    }
    true
}

/// Does any use of the parameter (transitively through address-preserving
/// operations) write through the pointer?
fn value_may_be_written_through(module: &Module, func: &Function, root: Value) -> bool {
    let mut visited: FxHashSet<Value> = FxHashSet::default();
    let mut worklist: SmallVec<[Value; 8]> = SmallVec::new();
    worklist.push(root);

    while let Some(v) = worklist.pop() {
        if !visited.insert(v) {
            continue;
        }
        for &user in func.uses_of(v) {
            match &func.insts[user] {
                InstData::Store { value, ptr } => {
                    if ptr.as_value() == Some(v) {
                        return true;
                    }
                    if value.as_value() == Some(v) {
                        let dst = strip_pointer_casts(func, ptr);
                        match as_alloca(func, &dst) {
                            Some(slot) => {
                                // Spilled to a slot: anything loaded back
                                // carries the pointer.
                                if let Some(slot_val) = func.inst_result(slot) {
                                    for &slot_user in func.uses_of(slot_val) {
                                        if let InstData::Load { ptr, .. } =
                                            &func.insts[slot_user]
                                        {
                                            if strip_pointer_casts(func, ptr)
                                                == Operand::Value(slot_val)
                                            {
                                                if let Some(loaded) =
                                                    func.inst_result(slot_user)
                                                {
                                                    worklist.push(loaded);
                                                }
                                            }
                                        }
                                    }
                                }
                            }
                            None => return true,
                        }
                    }
                }
                InstData::AtomicRmw { ptr, .. } | InstData::CmpXchg { ptr, .. } => {
                    if ptr.as_value() == Some(v) {
                        return true;
                    }
                }
                InstData::Call { callee, args, .. } | InstData::Invoke { callee, args, .. } => {
                    let direct = callee
                        .as_func()
                        .or_else(|| strip_pointer_casts(func, callee).as_func());
                    for (idx, arg) in args.iter().enumerate() {
                        if arg.value.as_value() != Some(v) {
                            continue;
                        }
                        if call_arg_may_write_through(module, direct, arg.attrs, idx) {
                            return true;
                        }
                    }
                }
                InstData::GetElementPtr { .. } => {
                    if let Some(result) = func.inst_result(user) {
                        worklist.push(result);
                    }
                }
                InstData::Cast { op, .. } => {
                    if op.preserves_pointer() {
                        if let Some(result) = func.inst_result(user) {
                            worklist.push(result);
                        }
                    } else if matches!(op, stackscan_ir::CastOp::PtrToInt) {
                        // Address taken as an integer: unknown aliasing.
                        return true;
                    } else if let Some(result) = func.inst_result(user) {
                        if module.types.is_ptr(func.value_type(result)) {
                            worklist.push(result);
                        }
                    }
                }
                InstData::Phi { .. } | InstData::Select { .. } => {
                    if let Some(result) = func.inst_result(user) {
                        if module.types.is_ptr(func.value_type(result)) {
                            worklist.push(result);
                        }
                    }
                }
                _ => {}
            }
        }
    }
    false
}

fn qual_prefix(info: &ParamTypeInfo, add_const: bool) -> String {
    let mut out = String::new();
    if add_const {
        out.push_str("const ");
    }
    if info.pointee_volatile {
        out.push_str("volatile ");
    }
    if info.pointee_restrict {
        out.push_str("restrict ");
    }
    out
}

fn build_type_string(
    info: &ParamTypeInfo,
    base_name: &str,
    add_pointee_const: bool,
    include_pointer_const: bool,
    param_name: &str,
) -> String {
    let mut out = String::new();
    if info.pointee_const || add_pointee_const {
        out.push_str("const ");
    }
    if info.pointee_volatile {
        out.push_str("volatile ");
    }
    out.push_str(if base_name.is_empty() {
        "<unknown type>"
    } else {
        base_name
    });

    if info.is_reference {
        out.push_str(if info.is_rvalue_reference { " &&" } else { " &" });
        out.push_str(param_name);
        return out;
    }

    if info.is_pointer {
        out.push_str(" *");
        if include_pointer_const && info.pointer_const {
            out.push_str(" const");
        }
        if info.pointer_volatile {
            out.push_str(" volatile");
        }
        if info.pointer_restrict {
            out.push_str(" restrict");
        }
    }

    if !param_name.is_empty() {
        if out.ends_with('*') || out.ends_with('&') {
            out.push_str(param_name);
        } else {
            out.push(' ');
            out.push_str(param_name);
        }
    }
    out
}

pub fn analyze(module: &Module, filter: &FunctionFilter) -> Vec<ConstParamIssue> {
    let mut out = Vec::new();

    for func_id in module.defined_functions() {
        if !filter.should_analyze(module, func_id) {
            continue;
        }
        let func = &module.functions[func_id];

        for index in 0..func.params.len() {
            let dbg = param_debug_info(module, func, index);
            let Some(ty) = dbg.ty else { continue };
            let Some(info) = build_param_type_info(module, ty) else {
                continue;
            };
            if !info.is_pointer && !info.is_reference {
                continue;
            }
            if info.is_double_pointer || info.is_void || info.is_function_pointer {
                continue;
            }
            if info.pointee_const {
                continue;
            }
            if value_may_be_written_through(module, func, func.params[index].value) {
                continue;
            }

            let param_name = if dbg.name.is_empty() {
                func.value_name(func.params[index].value)
                    .unwrap_or("")
                    .to_string()
            } else {
                dbg.name.clone()
            };
            let base_name = module.metadata.type_name(info.pointee_display);
            let pointee_is_basic = info
                .pointee
                .map(|p| matches!(module.metadata.node(p), MdNode::BasicType { .. }))
                .unwrap_or(false);

            let current_type = build_type_string(&info, &base_name, false, true, &param_name);
            let (suggested_type, suggested_type_alt) = if info.is_rvalue_reference {
                let by_value = format!("{}{} {}", qual_prefix(&info, false), base_name, param_name);
                let const_ref = format!("{}{} &{}", qual_prefix(&info, true), base_name, param_name);
                (by_value, Some(const_ref))
            } else {
                (
                    build_type_string(&info, &base_name, true, false, &param_name),
                    None,
                )
            };

            out.push(ConstParamIssue {
                func: func_id,
                func_name: func.name.clone(),
                param_name,
                line: dbg.line,
                column: 0,
                current_type,
                suggested_type,
                suggested_type_alt,
                is_reference: info.is_reference,
                is_rvalue_ref: info.is_rvalue_reference,
                pointer_const_only: info.is_pointer && info.pointer_const && !info.pointee_const,
                pointee_is_basic,
            });
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::AnalysisConfig;
    use stackscan_reader::parse_module;

    const READ_ONLY_PTR: &str = r#"
declare i32 @printf(ptr noundef, ...)

@.str = private unnamed_addr constant [3 x i8] c"%d\00", align 1

define void @show(ptr noundef %p) !dbg !4 {
entry:
  %p.addr = alloca ptr, align 8
  store ptr %p, ptr %p.addr, align 8
  %0 = load ptr, ptr %p.addr, align 8
  %1 = load i32, ptr %0, align 4
  %call = call i32 (ptr, ...) @printf(ptr noundef @.str, i32 noundef %1)
  ret void
}

define void @mutate(ptr noundef %p) !dbg !14 {
entry:
  %p.addr = alloca ptr, align 8
  store ptr %p, ptr %p.addr, align 8
  %0 = load ptr, ptr %p.addr, align 8
  store i32 7, ptr %0, align 4
  ret void
}

!1 = !DIFile(filename: "t.c", directory: "/src")
!4 = distinct !DISubprogram(name: "show", file: !1, line: 3, retainedNodes: !5)
!5 = !{!6}
!6 = !DILocalVariable(name: "p", arg: 1, scope: !4, file: !1, line: 3, type: !7)
!7 = !DIDerivedType(tag: DW_TAG_pointer_type, baseType: !8, size: 64)
!8 = !DIBasicType(name: "int", size: 32, encoding: DW_ATE_signed)
!14 = distinct !DISubprogram(name: "mutate", file: !1, line: 9, retainedNodes: !15)
!15 = !{!16}
!16 = !DILocalVariable(name: "p", arg: 1, scope: !14, file: !1, line: 9, type: !7)
"#;

    #[test]
    fn read_only_pointer_suggested_const() {
        let module = parse_module(READ_ONLY_PTR).unwrap();
        let config = AnalysisConfig::default();
        let filter = FunctionFilter::new(&module, &config);
        let issues = analyze(&module, &filter);
        assert_eq!(issues.len(), 1);
        let issue = &issues[0];
        assert_eq!(issue.func_name, "show");
        assert_eq!(issue.param_name, "p");
        assert_eq!(issue.current_type, "int *p");
        assert_eq!(issue.suggested_type, "const int *p");
        assert!(!issue.pointer_const_only);
        assert!(!issue.is_reference);
        assert_eq!(issue.line, 3);
    }

    #[test]
    fn const_pointee_is_skipped() {
        let text = r#"
define void @f(ptr noundef %p) !dbg !4 {
entry:
  %0 = load i32, ptr %p, align 4
  ret void
}

!1 = !DIFile(filename: "t.c", directory: "/src")
!4 = distinct !DISubprogram(name: "f", file: !1, line: 1, retainedNodes: !5)
!5 = !{!6}
!6 = !DILocalVariable(name: "p", arg: 1, scope: !4, file: !1, line: 1, type: !7)
!7 = !DIDerivedType(tag: DW_TAG_pointer_type, baseType: !8, size: 64)
!8 = !DIDerivedType(tag: DW_TAG_const_type, baseType: !9)
!9 = !DIBasicType(name: "int", size: 32, encoding: DW_ATE_signed)
"#;
        let module = parse_module(text).unwrap();
        let config = AnalysisConfig::default();
        let filter = FunctionFilter::new(&module, &config);
        assert!(analyze(&module, &filter).is_empty());
    }

    #[test]
    fn const_pointer_to_mutable_pointee() {
        // `int* const p`, never written through: PointerConstOnly.
        let text = r#"
define void @f(ptr noundef %p) !dbg !4 {
entry:
  %0 = load i32, ptr %p, align 4
  ret void
}

!1 = !DIFile(filename: "t.c", directory: "/src")
!4 = distinct !DISubprogram(name: "f", file: !1, line: 1, retainedNodes: !5)
!5 = !{!6}
!6 = !DILocalVariable(name: "p", arg: 1, scope: !4, file: !1, line: 1, type: !7)
!7 = !DIDerivedType(tag: DW_TAG_const_type, baseType: !8)
!8 = !DIDerivedType(tag: DW_TAG_pointer_type, baseType: !9, size: 64)
!9 = !DIBasicType(name: "int", size: 32, encoding: DW_ATE_signed)
"#;
        let module = parse_module(text).unwrap();
        let config = AnalysisConfig::default();
        let filter = FunctionFilter::new(&module, &config);
        let issues = analyze(&module, &filter);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].pointer_const_only);
        assert_eq!(issues[0].current_type, "int * const p");
    }

    #[test]
    fn rvalue_reference_gets_alternatives() {
        let text = r#"
define void @_Z4takeOi(ptr noundef %v) !dbg !4 {
entry:
  %0 = load i32, ptr %v, align 4
  ret void
}

!1 = !DIFile(filename: "t.cpp", directory: "/src")
!4 = distinct !DISubprogram(name: "take", linkageName: "_Z4takeOi", file: !1, line: 2, retainedNodes: !5)
!5 = !{!6}
!6 = !DILocalVariable(name: "v", arg: 1, scope: !4, file: !1, line: 2, type: !7)
!7 = !DIDerivedType(tag: DW_TAG_rvalue_reference_type, baseType: !8, size: 64)
!8 = !DIBasicType(name: "int", size: 32, encoding: DW_ATE_signed)
"#;
        let module = parse_module(text).unwrap();
        let config = AnalysisConfig::default();
        let filter = FunctionFilter::new(&module, &config);
        let issues = analyze(&module, &filter);
        assert_eq!(issues.len(), 1);
        let issue = &issues[0];
        assert!(issue.is_rvalue_ref);
        assert_eq!(issue.suggested_type, "int v");
        assert_eq!(issue.suggested_type_alt.as_deref(), Some("const int &v"));
        assert!(issue.pointee_is_basic);
    }

    #[test]
    fn double_pointer_skipped() {
        let text = r#"
define void @f(ptr noundef %pp) !dbg !4 {
entry:
  ret void
}

!1 = !DIFile(filename: "t.c", directory: "/src")
!4 = distinct !DISubprogram(name: "f", file: !1, line: 1, retainedNodes: !5)
!5 = !{!6}
!6 = !DILocalVariable(name: "pp", arg: 1, scope: !4, file: !1, line: 1, type: !7)
!7 = !DIDerivedType(tag: DW_TAG_pointer_type, baseType: !8, size: 64)
!8 = !DIDerivedType(tag: DW_TAG_pointer_type, baseType: !9, size: 64)
!9 = !DIBasicType(name: "int", size: 32, encoding: DW_ATE_signed)
"#;
        let module = parse_module(text).unwrap();
        let config = AnalysisConfig::default();
        let filter = FunctionFilter::new(&module, &config);
        assert!(analyze(&module, &filter).is_empty());
    }
}
