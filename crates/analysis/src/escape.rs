//! Stack-address escape analysis: allocations whose address leaves the
//! frame by return, store, or call.

use crate::filter::FunctionFilter;
use crate::value_utils::{as_alloca, strip_pointer_casts};
use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use stackscan_ir::{FuncId, Inst, InstData, Module, ParamAttrs, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EscapeKind {
    Return,
    StoreGlobal,
    StoreUnknown,
    CallArg,
    CallCallback,
}

#[derive(Clone, Debug)]
pub struct EscapeIssue {
    pub func: FuncId,
    pub func_name: String,
    pub var_name: String,
    pub kind: EscapeKind,
    pub target_name: String,
    pub inst: Inst,
}

/// Standard-library helpers whose capture of a stack address is benign:
/// Itanium prefixes of namespace `std` plus the C++ runtime.
fn is_std_callee_name(name: &str) -> bool {
    name.starts_with("_ZNSt3__1")
        || name.starts_with("_ZSt")
        || name.starts_with("_ZNSt")
        || name.starts_with("__cxx")
}

pub fn analyze(
    module: &Module,
    filter: &FunctionFilter,
    report_call_args: bool,
) -> Vec<EscapeIssue> {
    let mut out = Vec::new();

    for func_id in module.defined_functions() {
        if !filter.should_analyze(module, func_id) {
            continue;
        }
        let func = &module.functions[func_id];

        for (_, alloca) in func.insts_in_order() {
            if !matches!(func.insts[alloca], InstData::Alloca { .. }) {
                continue;
            }
            let Some(root) = func.inst_result(alloca) else {
                continue;
            };
            let var_name = func
                .value_name(root)
                .filter(|n| !n.is_empty())
                .map(|n| n.to_string())
                .unwrap_or_else(|| "<unnamed>".to_string());

            let mut visited: FxHashSet<Value> = FxHashSet::default();
            let mut worklist: SmallVec<[Value; 8]> = SmallVec::new();
            worklist.push(root);

            while let Some(v) = worklist.pop() {
                if !visited.insert(v) {
                    continue;
                }
                for &user in func.uses_of(v) {
                    match &func.insts[user] {
                        InstData::Ret { value: Some(value) } => {
                            if value.as_value() == Some(v) {
                                out.push(EscapeIssue {
                                    func: func_id,
                                    func_name: func.name.clone(),
                                    var_name: var_name.clone(),
                                    kind: EscapeKind::Return,
                                    target_name: String::new(),
                                    inst: user,
                                });
                            }
                        }
                        InstData::Store { value, ptr } => {
                            if value.as_value() != Some(v) {
                                continue;
                            }
                            let dst = strip_pointer_casts(func, ptr);
                            if let Some(global) = dst.as_global() {
                                out.push(EscapeIssue {
                                    func: func_id,
                                    func_name: func.name.clone(),
                                    var_name: var_name.clone(),
                                    kind: EscapeKind::StoreGlobal,
                                    target_name: module.globals[global].name.clone(),
                                    inst: user,
                                });
                                continue;
                            }
                            match as_alloca(func, &dst) {
                                Some(slot) => {
                                    // A local pointer slot: keep tracking
                                    // the slot itself.
                                    if let Some(slot_val) = func.inst_result(slot) {
                                        worklist.push(slot_val);
                                    }
                                }
                                None => {
                                    let target_name = dst
                                        .as_value()
                                        .and_then(|dv| func.value_name(dv))
                                        .unwrap_or("")
                                        .to_string();
                                    out.push(EscapeIssue {
                                        func: func_id,
                                        func_name: func.name.clone(),
                                        var_name: var_name.clone(),
                                        kind: EscapeKind::StoreUnknown,
                                        target_name,
                                        inst: user,
                                    });
                                }
                            }
                        }
                        InstData::Call { callee, args, .. }
                        | InstData::Invoke { callee, args, .. } => {
                            let direct = callee.as_func();
                            for (idx, arg) in args.iter().enumerate() {
                                if arg.value.as_value() != Some(v) {
                                    continue;
                                }
                                let mut attrs = arg.attrs;
                                if let Some(f) = direct {
                                    if let Some(param) = module.functions[f].params.get(idx) {
                                        attrs |= param.attrs;
                                    }
                                }
                                if attrs.intersects(
                                    ParamAttrs::NOCAPTURE
                                        | ParamAttrs::BYVAL
                                        | ParamAttrs::BYREF,
                                ) {
                                    continue;
                                }
                                match direct {
                                    Some(f) => {
                                        let callee_name = &module.functions[f].name;
                                        if callee_name.contains("unique_ptr")
                                            || callee_name.contains("make_unique")
                                            || is_std_callee_name(callee_name)
                                            || callee_name.starts_with("llvm.")
                                        {
                                            continue;
                                        }
                                        if report_call_args {
                                            out.push(EscapeIssue {
                                                func: func_id,
                                                func_name: func.name.clone(),
                                                var_name: var_name.clone(),
                                                kind: EscapeKind::CallArg,
                                                target_name: callee_name.clone(),
                                                inst: user,
                                            });
                                        }
                                    }
                                    None => {
                                        out.push(EscapeIssue {
                                            func: func_id,
                                            func_name: func.name.clone(),
                                            var_name: var_name.clone(),
                                            kind: EscapeKind::CallCallback,
                                            target_name: String::new(),
                                            inst: user,
                                        });
                                    }
                                }
                            }
                        }
                        InstData::Cast { op, .. } if op.preserves_pointer() => {
                            if let Some(result) = func.inst_result(user) {
                                if module.types.is_ptr(func.value_type(result)) {
                                    worklist.push(result);
                                }
                            }
                        }
                        InstData::GetElementPtr { .. } => {
                            if let Some(result) = func.inst_result(user) {
                                worklist.push(result);
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
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::AnalysisConfig;
    use stackscan_reader::parse_module;

    fn run(text: &str, call_args: bool) -> Vec<EscapeIssue> {
        let module = parse_module(text).unwrap();
        let config = AnalysisConfig::default();
        let filter = FunctionFilter::new(&module, &config);
        analyze(&module, &filter, call_args)
    }

    #[test]
    fn store_to_global() {
        let text = r#"
@g = global ptr null

define void @s() {
entry:
  %buf = alloca [10 x i8], align 1
  %decay = getelementptr inbounds [10 x i8], ptr %buf, i64 0, i64 0
  store ptr %decay, ptr @g, align 8
  ret void
}
"#;
        let issues = run(text, false);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, EscapeKind::StoreGlobal);
        assert_eq!(issues[0].target_name, "g");
        assert_eq!(issues[0].var_name, "buf");
    }

    #[test]
    fn returned_address() {
        let text = r#"
define ptr @leak() {
entry:
  %x = alloca i32, align 4
  ret ptr %x
}
"#;
        let issues = run(text, false);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, EscapeKind::Return);
        assert_eq!(issues[0].var_name, "x");
    }

    #[test]
    fn call_arg_gated_by_flag() {
        let text = r#"
declare void @sink(ptr noundef)
declare void @keeps(ptr nocapture noundef)

define void @f() {
entry:
  %buf = alloca [10 x i8], align 1
  call void @sink(ptr noundef %buf)
  call void @keeps(ptr noundef %buf)
  ret void
}
"#;
        let issues = run(text, false);
        assert!(issues.is_empty());

        let issues = run(text, true);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, EscapeKind::CallArg);
        assert_eq!(issues[0].target_name, "sink");
    }

    #[test]
    fn indirect_call_always_reported() {
        let text = r#"
define void @f(ptr noundef %cb) {
entry:
  %buf = alloca [4 x i8], align 1
  call void %cb(ptr noundef %buf)
  ret void
}
"#;
        let issues = run(text, false);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, EscapeKind::CallCallback);
    }

    #[test]
    fn store_into_local_slot_is_tracked_not_reported() {
        let text = r#"
define void @f() {
entry:
  %buf = alloca [4 x i8], align 1
  %p = alloca ptr, align 8
  store ptr %buf, ptr %p, align 8
  ret void
}
"#;
        let issues = run(text, false);
        assert!(issues.is_empty());
    }
}
