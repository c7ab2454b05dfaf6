//! Pre-analysis module pass: infer `nocapture`/`readonly` on pointer
//! parameters of defined functions.
//!
//! This is the only mutation of the module and must run before any detector
//! that inspects argument attributes.

use crate::value_utils::strip_pointer_casts;
use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use stackscan_ir::{FuncId, Function, InstData, Module, Operand, ParamAttrs, Value};

/// What a pointer-use walk observed about a value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PointerUse {
    pub captured: bool,
    pub written: bool,
}

fn is_mem_intrinsic_name(name: &str) -> bool {
    name.contains("memcpy") || name.contains("memmove") || name.contains("memset")
}

fn is_side_effect_free_intrinsic(name: &str) -> bool {
    name.starts_with("llvm.dbg.")
        || name.starts_with("llvm.lifetime.")
        || name.starts_with("llvm.invariant.")
        || name.starts_with("llvm.assume")
        || name.starts_with("llvm.experimental.noalias")
}

/// Walk every transitive use of `root` through address-preserving
/// operations and record whether the pointer is captured or written
/// through.
pub fn analyze_pointer_uses(module: &Module, func: &Function, root: Value) -> PointerUse {
    let mut out = PointerUse::default();
    let mut visited: FxHashSet<Value> = FxHashSet::default();
    let mut worklist: SmallVec<[Value; 8]> = SmallVec::new();
    worklist.push(root);

    while let Some(v) = worklist.pop() {
        if !visited.insert(v) {
            continue;
        }
        if out.captured && out.written {
            return out;
        }
        for &user in func.uses_of(v) {
            match &func.insts[user] {
                InstData::Load { .. } | InstData::ICmp { .. } | InstData::DebugRecord { .. } => {}
                InstData::Store { value, ptr } => {
                    if ptr.as_value() == Some(v) {
                        out.written = true;
                    }
                    if value.as_value() == Some(v) {
                        out.captured = true;
                    }
                }
                InstData::AtomicRmw { ptr, .. } | InstData::CmpXchg { ptr, .. } => {
                    if ptr.as_value() == Some(v) {
                        out.written = true;
                        out.captured = true;
                    }
                }
                InstData::Ret { .. } => out.captured = true,
                InstData::GetElementPtr { base, .. } => {
                    if base.as_value() == Some(v) {
                        if let Some(result) = func.inst_result(user) {
                            worklist.push(result);
                        }
                    }
                }
                InstData::Cast { op, .. } => {
                    if op.preserves_pointer() {
                        if let Some(result) = func.inst_result(user) {
                            worklist.push(result);
                        }
                    } else {
                        // ptrtoint and friends: lose track, stay safe.
                        out.captured = true;
                        out.written = true;
                    }
                }
                InstData::Phi { .. } | InstData::Select { .. } => {
                    if let Some(result) = func.inst_result(user) {
                        if module.types.is_ptr(func.value_type(result)) {
                            worklist.push(result);
                        }
                    }
                }
                InstData::Call { callee, args, .. }
                | InstData::Invoke { callee, args, .. } => {
                    let callee_fn = callee.as_func();
                    let callee_name = callee_fn.map(|f| module.functions[f].name.as_str());
                    if let Some(name) = callee_name {
                        if is_side_effect_free_intrinsic(name) {
                            continue;
                        }
                    }
                    for (idx, arg) in args.iter().enumerate() {
                        if arg.value.as_value() != Some(v) {
                            continue;
                        }
                        let mut attrs = arg.attrs;
                        if let Some(f) = callee_fn {
                            if let Some(param) = module.functions[f].params.get(idx) {
                                attrs |= param.attrs;
                            }
                        }
                        if let Some(name) = callee_name {
                            if is_mem_intrinsic_name(name) {
                                if idx == 0 {
                                    out.written = true;
                                }
                                continue;
                            }
                        }
                        if !attrs.contains(ParamAttrs::NOCAPTURE) {
                            out.captured = true;
                        }
                        let callee_readonly = callee_fn
                            .map(|f| module.functions[f].attrs.only_reads_memory())
                            .unwrap_or(false);
                        if !callee_readonly
                            && !attrs.intersects(ParamAttrs::READONLY | ParamAttrs::READNONE)
                        {
                            out.written = true;
                        }
                    }
                }
                InstData::Unknown { .. } => {
                    out.captured = true;
                    out.written = true;
                }
                _ => {}
            }
        }
    }

    out
}

/// Is the address of this local allocation captured anywhere?
pub fn pointer_is_captured(module: &Module, func: &Function, root: Value) -> bool {
    analyze_pointer_uses(module, func, root).captured
}

/// Infer `nocapture`/`readonly` for pointer parameters of every defined
/// function and write them into the parameter attribute sets.
pub fn infer_function_attrs(module: &mut Module) {
    let mut inferred: Vec<(FuncId, usize, ParamAttrs)> = Vec::new();

    for func_id in module.defined_functions() {
        let func = &module.functions[func_id];
        for (idx, param) in func.params.iter().enumerate() {
            if !module.types.is_ptr(param.ty) {
                continue;
            }
            let uses = analyze_pointer_uses(module, func, param.value);
            let mut add = ParamAttrs::default();
            if !uses.captured {
                add |= ParamAttrs::NOCAPTURE;
            }
            if !uses.written {
                add |= ParamAttrs::READONLY;
            }
            if !add.is_empty() {
                inferred.push((func_id, idx, add));
            }
        }
    }

    for (func_id, idx, add) in inferred {
        let before = module.functions[func_id].params[idx].attrs;
        module.functions[func_id].params[idx].attrs = before | add;
        if !before.contains(add) {
            log::debug!(
                "inferred {:?} for {} arg#{}",
                add,
                module.functions[func_id].name,
                idx
            );
        }
    }
}

/// Is the address of a value only used in ways the walk recognizes as
/// non-escaping? Convenience wrapper used by the duplicate-condition
/// analyzer to decide whether a slot's stores are all visible.
pub fn alloca_address_is_private(module: &Module, func: &Function, op: &Operand) -> bool {
    let base = strip_pointer_casts(func, op);
    let Some(v) = base.as_value() else {
        return false;
    };
    let Some(def) = func.value_inst(v) else {
        return false;
    };
    if !matches!(func.insts[def], InstData::Alloca { .. }) {
        return false;
    }
    !pointer_is_captured(module, func, v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackscan_reader::parse_module;

    #[test]
    fn readonly_pointer_param_is_inferred() {
        let text = r#"
define i32 @get(ptr noundef %p) {
entry:
  %v = load i32, ptr %p, align 4
  ret i32 %v
}

define void @set(ptr noundef %p) {
entry:
  store i32 1, ptr %p, align 4
  ret void
}
"#;
        let mut module = parse_module(text).unwrap();
        infer_function_attrs(&mut module);

        let get = module.func_by_name("get").unwrap();
        let attrs = module.functions[get].params[0].attrs;
        assert!(attrs.contains(ParamAttrs::READONLY));
        assert!(attrs.contains(ParamAttrs::NOCAPTURE));

        let set = module.func_by_name("set").unwrap();
        let attrs = module.functions[set].params[0].attrs;
        assert!(!attrs.contains(ParamAttrs::READONLY));
        assert!(attrs.contains(ParamAttrs::NOCAPTURE));
    }

    #[test]
    fn stored_pointer_is_captured() {
        let text = r#"
@keep = global ptr null

define void @capture(ptr noundef %p) {
entry:
  store ptr %p, ptr @keep, align 8
  ret void
}
"#;
        let mut module = parse_module(text).unwrap();
        infer_function_attrs(&mut module);
        let f = module.func_by_name("capture").unwrap();
        let attrs = module.functions[f].params[0].attrs;
        assert!(!attrs.contains(ParamAttrs::NOCAPTURE));
    }

    #[test]
    fn private_alloca_detection() {
        let text = r#"
declare void @sink(ptr noundef)

define void @f() {
entry:
  %kept = alloca i32, align 4
  %leaked = alloca i32, align 4
  store i32 0, ptr %kept, align 4
  call void @sink(ptr noundef %leaked)
  ret void
}
"#;
        let module = parse_module(text).unwrap();
        let f = module.func_by_name("f").unwrap();
        let func = &module.functions[f];
        let entry = func.entry_block().unwrap();
        let kept = func.inst_result(func.blocks[entry].insts[0]).unwrap();
        let leaked = func.inst_result(func.blocks[entry].insts[1]).unwrap();
        assert!(alloca_address_is_private(
            &module,
            func,
            &Operand::Value(kept)
        ));
        assert!(!alloca_address_is_private(
            &module,
            func,
            &Operand::Value(leaked)
        ));
    }
}
