//! Shared value-chasing helpers: cast stripping, allocation naming, and
//! constant recovery through local slots.

use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use stackscan_ir::{ConstExpr, Constant, Function, Inst, InstData, MdNode, Module, Operand};

/// Strip any cast chain (value and constant-expression casts alike).
pub fn strip_casts(func: &Function, op: &Operand) -> Operand {
    let mut cur = op.clone();
    for _ in 0..64 {
        match &cur {
            Operand::Value(v) => {
                let Some(def) = func.value_inst(*v) else { break };
                match &func.insts[def] {
                    InstData::Cast { value, .. } => cur = value.clone(),
                    _ => break,
                }
            }
            Operand::Const(Constant::Expr(expr)) => match expr.as_ref() {
                ConstExpr::Cast { value, .. } => cur = value.clone(),
                _ => break,
            },
            _ => break,
        }
    }
    cur
}

/// Strip only integer-to-integer casts.
pub fn strip_int_casts(func: &Function, op: &Operand) -> Operand {
    let mut cur = op.clone();
    for _ in 0..64 {
        match &cur {
            Operand::Value(v) => {
                let Some(def) = func.value_inst(*v) else { break };
                match &func.insts[def] {
                    InstData::Cast { op, value, .. } if op.is_int_cast() => {
                        cur = value.clone();
                    }
                    _ => break,
                }
            }
            Operand::Const(Constant::Expr(expr)) => match expr.as_ref() {
                ConstExpr::Cast { op, value, .. } if op.is_int_cast() => {
                    cur = value.clone();
                }
                _ => break,
            },
            _ => break,
        }
    }
    cur
}

/// Is this GEP a no-op (every index a constant zero)?
fn gep_is_zero(indices: &[Operand]) -> bool {
    indices.iter().all(|idx| idx.const_sext() == Some(0))
}

/// Strip pointer-preserving casts and zero-offset GEPs, like LLVM's
/// `stripPointerCasts`.
pub fn strip_pointer_casts(func: &Function, op: &Operand) -> Operand {
    let mut cur = op.clone();
    for _ in 0..64 {
        match &cur {
            Operand::Value(v) => {
                let Some(def) = func.value_inst(*v) else { break };
                match &func.insts[def] {
                    InstData::Cast { op, value, .. } if op.preserves_pointer() => {
                        cur = value.clone();
                    }
                    InstData::GetElementPtr { base, indices, .. } if gep_is_zero(indices) => {
                        cur = base.clone();
                    }
                    _ => break,
                }
            }
            Operand::Const(Constant::Expr(expr)) => match expr.as_ref() {
                ConstExpr::Cast { op, value, .. } if op.preserves_pointer() => {
                    cur = value.clone();
                }
                ConstExpr::GetElementPtr { base, indices, .. } if gep_is_zero(indices) => {
                    cur = base.clone();
                }
                _ => break,
            },
            _ => break,
        }
    }
    cur
}

/// The alloca instruction behind an operand, if the operand is directly an
/// allocation result (no stripping).
pub fn as_alloca(func: &Function, op: &Operand) -> Option<Inst> {
    let v = op.as_value()?;
    let def = func.value_inst(v)?;
    match func.insts[def] {
        InstData::Alloca { .. } => Some(def),
        _ => None,
    }
}

/// Like `as_alloca`, after stripping pointer casts.
pub fn as_alloca_stripped(func: &Function, op: &Operand) -> Option<Inst> {
    as_alloca(func, &strip_pointer_casts(func, op))
}

fn is_dbg_declare_callee(module: &Module, callee: &Operand) -> bool {
    match callee.as_func() {
        Some(f) => {
            let name = &module.functions[f].name;
            name == "llvm.dbg.declare" || name == "llvm.dbg.value"
        }
        None => false,
    }
}

/// Recover a printable name for an allocation: the IR value name when it
/// has one, else the first debug-record variable naming it, else the name
/// of a slot it is stored into.
pub fn derive_alloca_name(module: &Module, func: &Function, alloca: Inst) -> String {
    let Some(root) = func.inst_result(alloca) else {
        return "<unnamed>".to_string();
    };
    if let Some(name) = func.value_name(root) {
        if !name.is_empty() && !name.chars().all(|c| c.is_ascii_digit()) {
            return name.to_string();
        }
    }

    let mut visited: FxHashSet<stackscan_ir::Value> = FxHashSet::default();
    let mut worklist: SmallVec<[stackscan_ir::Value; 8]> = SmallVec::new();
    worklist.push(root);

    while let Some(v) = worklist.pop() {
        if !visited.insert(v) {
            continue;
        }
        for &user in func.uses_of(v) {
            match &func.insts[user] {
                InstData::DebugRecord {
                    value, variable, ..
                } => {
                    if value.as_value() == Some(v) {
                        if let Some(var) = variable {
                            if let MdNode::LocalVariable { name, .. } = module.metadata.node(*var)
                            {
                                if !name.is_empty() {
                                    return name.clone();
                                }
                            }
                        }
                    }
                }
                InstData::Call { callee, args, .. } if is_dbg_declare_callee(module, callee) => {
                    if args.first().and_then(|a| a.value.as_value()) == Some(v) {
                        if let Some(Operand::Metadata(var)) = args.get(1).map(|a| &a.value) {
                            if let MdNode::LocalVariable { name, .. } = module.metadata.node(*var)
                            {
                                if !name.is_empty() {
                                    return name.clone();
                                }
                            }
                        }
                    }
                }
                InstData::Store { value, ptr } => {
                    if value.as_value() != Some(v) {
                        continue;
                    }
                    let dst = strip_pointer_casts(func, ptr);
                    if let Some(slot) = as_alloca(func, &dst) {
                        if let Some(slot_val) = func.inst_result(slot) {
                            if let Some(name) = func.value_name(slot_val) {
                                if !name.is_empty() && !name.chars().all(|c| c.is_ascii_digit()) {
                                    return name.to_string();
                                }
                            }
                        }
                    }
                    if let Some(dst_v) = dst.as_value() {
                        worklist.push(dst_v);
                    }
                }
                InstData::Cast { op, .. } if op.preserves_pointer() => {
                    if let Some(result) = func.inst_result(user) {
                        worklist.push(result);
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

    "<unnamed>".to_string()
}

/// Recover a compile-time constant for a value: strip casts; a direct
/// constant wins; a load from a local slot falls back to scanning the
/// function for stores of constants into that slot.
///
/// The scan keeps the *last* constant store in iteration order, with no
/// dominance check; branch-dependent initialization can misreport.
pub fn const_from_value(func: &Function, op: &Operand) -> Option<u64> {
    let cur = strip_casts(func, op);
    if let Some(c) = cur.const_zext() {
        return Some(c);
    }

    let v = cur.as_value()?;
    let def = func.value_inst(v)?;
    let InstData::Load { ptr, .. } = &func.insts[def] else {
        return None;
    };

    let mut found = None;
    for (_, inst) in func.insts_in_order() {
        let InstData::Store { value, ptr: dst } = &func.insts[inst] else {
            continue;
        };
        if dst != ptr {
            continue;
        }
        if let Some(c) = value.const_zext() {
            found = Some(c);
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackscan_reader::parse_module;

    #[test]
    fn const_through_local_slot() {
        let text = r#"
define void @f() {
entry:
  %n = alloca i32, align 4
  store i32 6, ptr %n, align 4
  %v = load i32, ptr %n, align 4
  %conv = sext i32 %v to i64
  %buf = alloca i8, i64 %conv, align 1
  ret void
}
"#;
        let module = parse_module(text).unwrap();
        let f = module.func_by_name("f").unwrap();
        let func = &module.functions[f];
        let entry = func.entry_block().unwrap();
        let buf = func.blocks[entry].insts[4];
        let InstData::Alloca { count, .. } = &func.insts[buf] else {
            panic!("expected alloca");
        };
        assert_eq!(const_from_value(func, count), Some(6));
    }

    #[test]
    fn last_store_wins() {
        let text = r#"
define void @f() {
entry:
  %n = alloca i32, align 4
  store i32 6, ptr %n, align 4
  store i32 9, ptr %n, align 4
  %v = load i32, ptr %n, align 4
  ret void
}
"#;
        let module = parse_module(text).unwrap();
        let f = module.func_by_name("f").unwrap();
        let func = &module.functions[f];
        let entry = func.entry_block().unwrap();
        let load = func.blocks[entry].insts[3];
        let loaded = func.inst_result(load).unwrap();
        assert_eq!(
            const_from_value(func, &Operand::Value(loaded)),
            Some(9)
        );
    }

    #[test]
    fn named_alloca_uses_ir_name() {
        let text = r#"
define void @f() {
entry:
  %buf = alloca [8 x i8], align 1
  ret void
}
"#;
        let module = parse_module(text).unwrap();
        let f = module.func_by_name("f").unwrap();
        let func = &module.functions[f];
        let entry = func.entry_block().unwrap();
        let alloca = func.blocks[entry].insts[0];
        assert_eq!(derive_alloca_name(&module, func, alloca), "buf");
    }
}
