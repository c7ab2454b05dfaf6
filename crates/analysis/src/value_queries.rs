//! Flow-aware value facts at a program point: non-nullness and lower
//! bounds, recovered from attributes and dominating branch conditions.
//!
//! This is the stand-in for LLVM's `LazyValueInfo` used by the `size - k`
//! emission policy.

use crate::value_utils::{as_alloca, strip_casts, strip_pointer_casts};
use stackscan_ir::{
    Constant, ControlFlowGraph, DominatorTree, Function, Inst, InstData, IntPredicate, Module,
    Operand, ParamAttrs,
};

pub struct ValueQueries<'a> {
    module: &'a Module,
    func: &'a Function,
    domtree: DominatorTree,
}

/// Canonical representation for "same quantity" checks: casts stripped,
/// loads keyed by their (cast-stripped) slot pointer.
fn canonical(func: &Function, op: &Operand) -> Operand {
    let stripped = strip_casts(func, op);
    if let Some(v) = stripped.as_value() {
        if let Some(def) = func.value_inst(v) {
            if let InstData::Load { ptr, .. } = &func.insts[def] {
                return strip_casts(func, ptr);
            }
        }
    }
    stripped
}

impl<'a> ValueQueries<'a> {
    pub fn new(module: &'a Module, func: &'a Function) -> Self {
        let cfg = ControlFlowGraph::with_function(func);
        let domtree = DominatorTree::with_function(func, &cfg);
        Self {
            module,
            func,
            domtree,
        }
    }

    /// Can `op` be proven non-null at `at`?
    pub fn is_nonnull_at(&self, op: &Operand, at: Inst) -> bool {
        let base = strip_pointer_casts(self.func, op);
        match &base {
            Operand::Global(_) | Operand::Func(_) => return true,
            Operand::Value(v) => {
                if as_alloca(self.func, &base).is_some() {
                    return true;
                }
                if let Some(idx) = self.func.value_param_index(*v) {
                    if self.func.params[idx].attrs.contains(ParamAttrs::NONNULL) {
                        return true;
                    }
                }
            }
            _ => {}
        }

        let key = canonical(self.func, op);
        let Some(at_block) = self.func.inst_block(at) else {
            return false;
        };

        for (block, _) in self.func.blocks.iter() {
            let Some(term) = self.func.block_terminator(block) else {
                continue;
            };
            let InstData::CondBr {
                cond,
                then_dest,
                else_dest,
            } = &self.func.insts[term]
            else {
                continue;
            };
            let Some(cond_v) = cond.as_value() else { continue };
            let Some(cmp) = self.func.value_inst(cond_v) else {
                continue;
            };
            let InstData::ICmp { pred, lhs, rhs } = &self.func.insts[cmp] else {
                continue;
            };

            let ptr_side = if matches!(rhs.as_const(), Some(Constant::Null)) {
                lhs
            } else if matches!(lhs.as_const(), Some(Constant::Null)) {
                rhs
            } else {
                continue;
            };
            if canonical(self.func, ptr_side) != key {
                continue;
            }
            let nonnull_edge = match pred {
                IntPredicate::Ne => *then_dest,
                IntPredicate::Eq => *else_dest,
                _ => continue,
            };
            if self.domtree.dominates(nonnull_edge, at_block) {
                return true;
            }
        }
        false
    }

    /// Can `op` be proven strictly greater than `bound` at `at`?
    pub fn is_greater_than_at(&self, op: &Operand, bound: i64, at: Inst) -> bool {
        if let Some(c) = strip_casts(self.func, op).const_sext() {
            return c > bound;
        }
        let key = canonical(self.func, op);
        let Some(at_block) = self.func.inst_block(at) else {
            return false;
        };

        for (block, _) in self.func.blocks.iter() {
            let Some(term) = self.func.block_terminator(block) else {
                continue;
            };
            let InstData::CondBr {
                cond,
                then_dest,
                else_dest,
            } = &self.func.insts[term]
            else {
                continue;
            };
            let Some(cond_v) = cond.as_value() else { continue };
            let Some(cmp) = self.func.value_inst(cond_v) else {
                continue;
            };
            let InstData::ICmp { pred, lhs, rhs } = &self.func.insts[cmp] else {
                continue;
            };

            let (pred, constant) = match (lhs.const_sext(), rhs.const_sext()) {
                (None, Some(c)) if canonical(self.func, lhs) == key => (*pred, c),
                (Some(c), None) if canonical(self.func, rhs) == key => (pred.swapped(), c),
                _ => continue,
            };

            // Lower bound implied on each edge of `value pred constant`.
            let (then_lower, else_lower) = match pred {
                IntPredicate::Sgt | IntPredicate::Ugt => {
                    (Some(constant.saturating_add(1)), None)
                }
                IntPredicate::Sge | IntPredicate::Uge => (Some(constant), None),
                IntPredicate::Slt | IntPredicate::Ult => (None, Some(constant)),
                IntPredicate::Sle | IntPredicate::Ule => {
                    (None, Some(constant.saturating_add(1)))
                }
                IntPredicate::Eq => (Some(constant), None),
                IntPredicate::Ne => (None, Some(constant)),
            };

            if let Some(lower) = then_lower {
                if lower > bound && self.domtree.dominates(*then_dest, at_block) {
                    return true;
                }
            }
            if let Some(lower) = else_lower {
                if lower > bound && self.domtree.dominates(*else_dest, at_block) {
                    return true;
                }
            }
        }
        false
    }

    pub fn module(&self) -> &Module {
        self.module
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackscan_reader::parse_module;

    #[test]
    fn branch_guard_proves_lower_bound() {
        let text = r#"
define void @f(i64 noundef %n, ptr noundef %p) {
entry:
  %cmp = icmp sgt i64 %n, 4
  br i1 %cmp, label %big, label %small

big:
  %use = add i64 %n, 0
  ret void

small:
  %use2 = add i64 %n, 0
  ret void
}
"#;
        let module = parse_module(text).unwrap();
        let f = module.func_by_name("f").unwrap();
        let func = &module.functions[f];
        let queries = ValueQueries::new(&module, func);

        let n = Operand::Value(func.params[0].value);
        let big_block = func
            .blocks
            .iter()
            .find(|(_, b)| b.name == "big")
            .map(|(b, _)| b)
            .unwrap();
        let small_block = func
            .blocks
            .iter()
            .find(|(_, b)| b.name == "small")
            .map(|(b, _)| b)
            .unwrap();
        let in_big = func.blocks[big_block].insts[0];
        let in_small = func.blocks[small_block].insts[0];

        assert!(queries.is_greater_than_at(&n, 1, in_big));
        assert!(queries.is_greater_than_at(&n, 4, in_big));
        assert!(!queries.is_greater_than_at(&n, 5, in_big));
        assert!(!queries.is_greater_than_at(&n, 1, in_small));
    }

    #[test]
    fn null_check_proves_nonnull() {
        let text = r#"
define void @f(ptr noundef %p) {
entry:
  %buf = alloca [4 x i8], align 1
  %cmp = icmp ne ptr %p, null
  br i1 %cmp, label %ok, label %bail

ok:
  %use = load i8, ptr %p, align 1
  ret void

bail:
  ret void
}
"#;
        let module = parse_module(text).unwrap();
        let f = module.func_by_name("f").unwrap();
        let func = &module.functions[f];
        let queries = ValueQueries::new(&module, func);

        let p = Operand::Value(func.params[0].value);
        let entry = func.entry_block().unwrap();
        let buf = Operand::Value(func.inst_result(func.blocks[entry].insts[0]).unwrap());
        let ok_block = func
            .blocks
            .iter()
            .find(|(_, b)| b.name == "ok")
            .map(|(b, _)| b)
            .unwrap();
        let in_ok = func.blocks[ok_block].insts[0];
        let in_entry = func.blocks[entry].insts[1];

        assert!(queries.is_nonnull_at(&p, in_ok));
        assert!(!queries.is_nonnull_at(&p, in_entry));
        // A stack address is trivially non-null anywhere.
        assert!(queries.is_nonnull_at(&buf, in_entry));
    }
}
