//! A control flow graph represented as mappings of basic blocks to their
//! predecessors and successors.

use crate::entities::Block;
use crate::function::Function;
use cranelift_entity::SecondaryMap;

#[derive(Clone, Default)]
struct CfgNode {
    predecessors: Vec<Block>,
    successors: Vec<Block>,
}

/// Predecessor and successor lists per block. Successors keep IR operand
/// order; both lists are deduplicated.
pub struct ControlFlowGraph {
    data: SecondaryMap<Block, CfgNode>,
    valid: bool,
}

impl ControlFlowGraph {
    pub fn new() -> Self {
        Self {
            data: SecondaryMap::new(),
            valid: false,
        }
    }

    /// Allocate and compute the control flow graph for `func`.
    pub fn with_function(func: &Function) -> Self {
        let mut cfg = Self::new();
        cfg.compute(func);
        cfg
    }

    pub fn compute(&mut self, func: &Function) {
        self.data.clear();
        self.data.resize(func.blocks.len());

        for (block, _) in func.blocks.iter() {
            let Some(term) = func.block_terminator(block) else {
                continue;
            };
            for dest in func.insts[term].branch_targets() {
                self.add_edge(block, dest);
            }
        }
        self.valid = true;
    }

    fn add_edge(&mut self, from: Block, to: Block) {
        if !self.data[from].successors.contains(&to) {
            self.data[from].successors.push(to);
        }
        if !self.data[to].predecessors.contains(&from) {
            self.data[to].predecessors.push(from);
        }
    }

    pub fn preds(&self, block: Block) -> &[Block] {
        &self.data[block].predecessors
    }

    pub fn succs(&self, block: Block) -> &[Block] {
        &self.data[block].successors
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Is `to` reachable from `from` by following CFG edges? A block is
    /// considered reachable from itself.
    pub fn is_reachable(&self, from: Block, to: Block) -> bool {
        if from == to {
            return true;
        }
        let mut seen: SecondaryMap<Block, bool> = SecondaryMap::new();
        let mut stack = vec![from];
        seen[from] = true;
        while let Some(block) = stack.pop() {
            for &succ in self.succs(block) {
                if succ == to {
                    return true;
                }
                if !seen[succ] {
                    seen[succ] = true;
                    stack.push(succ);
                }
            }
        }
        false
    }
}

impl Default for ControlFlowGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constant::Constant;
    use crate::instructions::{InstData, Operand};
    use crate::types::TypeStore;

    fn cond() -> Operand {
        Operand::Const(Constant::int(1, 1))
    }

    #[test]
    fn branches_and_joins() {
        let mut types = TypeStore::new();
        let void = types.void();
        let mut func = crate::function::Function::new("f".to_string(), void);
        func.is_declaration = false;

        let b0 = func.make_block("entry".to_string());
        let b1 = func.make_block("then".to_string());
        let b2 = func.make_block("exit".to_string());

        func.append_inst(
            b0,
            InstData::CondBr {
                cond: cond(),
                then_dest: b1,
                else_dest: b2,
            },
            None,
            None,
        );
        func.append_inst(b1, InstData::Br { dest: b2 }, None, None);
        func.append_inst(b2, InstData::Ret { value: None }, None, None);
        func.finish();

        let cfg = ControlFlowGraph::with_function(&func);
        assert_eq!(cfg.succs(b0), &[b1, b2]);
        assert_eq!(cfg.succs(b1), &[b2]);
        assert_eq!(cfg.preds(b2), &[b0, b1]);
        assert!(cfg.is_reachable(b0, b2));
        assert!(!cfg.is_reachable(b2, b0));
    }
}
