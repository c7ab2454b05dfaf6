//! A dominator tree represented as mappings of blocks to their immediate
//! dominator, built with Cooper et al.'s "Simple, Fast Dominance" algorithm
//! over a DFS post-order of the control flow graph.

use crate::entities::{Block, Inst};
use crate::flowgraph::ControlFlowGraph;
use crate::function::Function;
use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::SecondaryMap;
use core::cmp::Ordering;

/// Special RPO numbers used during `compute_postorder`. `DONE` doubles as
/// the "reachable but not yet numbered" marker afterwards, which is why it
/// must stay below the entry block's final RPO number of 2.
const DONE: u32 = 1;
const SEEN: u32 = 2;

/// Dominator tree node. We keep one of these per block.
#[derive(Clone, Default)]
struct DomNode {
    /// Number of this node in a reverse post-order traversal of the CFG,
    /// starting from 2. Unreachable nodes get number 0, the entry gets 2.
    rpo_number: u32,

    /// The immediate dominator of this block. `None` for unreachable blocks
    /// and for the entry block, which has no immediate dominator.
    idom: PackedOption<Block>,
}

/// The dominator tree for a single function.
pub struct DominatorTree {
    nodes: SecondaryMap<Block, DomNode>,

    /// CFG post-order of all reachable blocks.
    postorder: Vec<Block>,

    valid: bool,
}

impl DominatorTree {
    pub fn new() -> Self {
        Self {
            nodes: SecondaryMap::new(),
            postorder: Vec::new(),
            valid: false,
        }
    }

    /// Allocate and compute a dominator tree.
    pub fn with_function(func: &Function, cfg: &ControlFlowGraph) -> Self {
        let mut domtree = Self::new();
        domtree.compute(func, cfg);
        domtree
    }

    /// Reset and compute a CFG post-order and dominator tree.
    pub fn compute(&mut self, func: &Function, cfg: &ControlFlowGraph) {
        debug_assert!(cfg.is_valid());
        self.compute_postorder(func, cfg);
        self.compute_domtree(cfg);
        self.valid = true;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Is `block` reachable from the entry block?
    pub fn is_reachable(&self, block: Block) -> bool {
        self.nodes[block].rpo_number != 0
    }

    /// The CFG post-order used to compute this tree.
    pub fn cfg_postorder(&self) -> &[Block] {
        debug_assert!(self.valid);
        &self.postorder
    }

    /// Returns the immediate dominator of `block`, or `None` for the entry
    /// block and unreachable blocks.
    pub fn idom(&self, block: Block) -> Option<Block> {
        self.nodes[block].idom.expand()
    }

    /// Returns `true` if `a` dominates `b`: every control-flow path from the
    /// entry to `b` passes through `a`. A block dominates itself. Returns
    /// `false` when either block is unreachable.
    pub fn dominates(&self, a: Block, b: Block) -> bool {
        if !self.is_reachable(a) || !self.is_reachable(b) {
            return false;
        }
        let rpo_a = self.nodes[a].rpo_number;
        let mut cur = b;
        // Run a finger up the dominator tree from b until we reach a's RPO
        // level.
        while self.nodes[cur].rpo_number > rpo_a {
            match self.idom(cur) {
                Some(idom) => cur = idom,
                None => return false,
            }
        }
        cur == a
    }

    /// Instruction-granularity dominance: same-block queries compare layout
    /// positions; an instruction dominates itself.
    pub fn dominates_inst(&self, func: &Function, a: Inst, b: Inst) -> bool {
        let (Some(block_a), Some(block_b)) = (func.inst_block(a), func.inst_block(b)) else {
            return false;
        };
        if block_a == block_b {
            return func.inst_position(a) <= func.inst_position(b);
        }
        self.dominates(block_a, block_b)
    }

    /// Walk from `block` up through successive immediate dominators.
    pub fn idom_chain<'a>(&'a self, block: Block) -> impl Iterator<Item = Block> + 'a {
        let mut cur = self.idom(block);
        core::iter::from_fn(move || {
            let next = cur?;
            cur = self.idom(next);
            Some(next)
        })
    }

    /// Reset all internal data structures and compute a post-order of the
    /// control flow graph, using `rpo_number` to track DFS state.
    fn compute_postorder(&mut self, func: &Function, cfg: &ControlFlowGraph) {
        self.nodes.clear();
        self.postorder.clear();
        self.valid = false;
        self.nodes.resize(func.blocks.len());

        let Some(entry) = func.entry_block() else {
            return;
        };

        let mut stack = vec![entry];
        self.nodes[entry].rpo_number = SEEN;

        while let Some(block) = stack.pop() {
            match self.nodes[block].rpo_number {
                SEEN => {
                    // First pop: push the block back and scan successors.
                    self.nodes[block].rpo_number = DONE;
                    stack.push(block);
                    for &succ in cfg.succs(block) {
                        if self.nodes[succ].rpo_number == 0 {
                            self.nodes[succ].rpo_number = SEEN;
                            stack.push(succ);
                        }
                    }
                }
                DONE => self.postorder.push(block),
                _ => unreachable!(),
            }
        }
    }

    /// Build the dominator tree by iterating immediate-dominator estimates
    /// to a fixed point over the reverse post-order.
    fn compute_domtree(&mut self, cfg: &ControlFlowGraph) {
        let (entry, rest) = match self.postorder.split_last() {
            Some((&entry, rest)) => (entry, rest),
            None => return,
        };

        // Assign RPO numbers. Reachable-but-unnumbered blocks still hold
        // DONE (1) from the post-order pass; `compute_idom` only considers
        // predecessors with a number >= 2, i.e. the entry and previously
        // numbered blocks.
        self.nodes[entry].rpo_number = 2;
        let postorder = rest.to_vec();
        for (i, &block) in postorder.iter().rev().enumerate() {
            self.nodes[block].rpo_number = i as u32 + 3;
            self.nodes[block].idom = self.compute_idom(block, cfg).into();
        }

        // Iterate until convergence; a single pass suffices for reducible
        // control flow.
        let mut changed = true;
        while changed {
            changed = false;
            for &block in postorder.iter().rev() {
                let idom = self.compute_idom(block, cfg).into();
                if self.nodes[block].idom != idom {
                    self.nodes[block].idom = idom;
                    changed = true;
                }
            }
        }
    }

    /// Compute the immediate dominator for `block` from the already-visited
    /// predecessors' current estimates.
    fn compute_idom(&self, block: Block, cfg: &ControlFlowGraph) -> Block {
        let mut visited_preds = cfg
            .preds(block)
            .iter()
            .copied()
            .filter(|&pred| self.nodes[pred].rpo_number >= 2);

        let mut idom = visited_preds
            .next()
            .expect("RPO visits at least one predecessor first");

        for pred in visited_preds {
            idom = self.common_dominator(idom, pred);
        }
        idom
    }

    /// Compute the common dominator of two reachable blocks.
    fn common_dominator(&self, mut a: Block, mut b: Block) -> Block {
        loop {
            match self.nodes[a].rpo_number.cmp(&self.nodes[b].rpo_number) {
                Ordering::Less => {
                    b = self.nodes[b].idom.expand().expect("unreachable block");
                }
                Ordering::Greater => {
                    a = self.nodes[a].idom.expand().expect("unreachable block");
                }
                Ordering::Equal => return a,
            }
        }
    }
}

impl Default for DominatorTree {
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
    fn empty_function() {
        let mut types = TypeStore::new();
        let void = types.void();
        let func = Function::new("f".to_string(), void);
        let cfg = ControlFlowGraph::with_function(&func);
        let dt = DominatorTree::with_function(&func, &cfg);
        assert!(dt.cfg_postorder().is_empty());
    }

    #[test]
    fn diamond() {
        let mut types = TypeStore::new();
        let void = types.void();
        let mut func = Function::new("f".to_string(), void);
        func.is_declaration = false;

        let b0 = func.make_block("entry".to_string());
        let b1 = func.make_block("then".to_string());
        let b2 = func.make_block("else".to_string());
        let b3 = func.make_block("join".to_string());

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
        func.append_inst(b1, InstData::Br { dest: b3 }, None, None);
        func.append_inst(b2, InstData::Br { dest: b3 }, None, None);
        func.append_inst(b3, InstData::Ret { value: None }, None, None);
        func.finish();

        let cfg = ControlFlowGraph::with_function(&func);
        let dt = DominatorTree::with_function(&func, &cfg);

        assert_eq!(dt.idom(b0), None);
        assert_eq!(dt.idom(b1), Some(b0));
        assert_eq!(dt.idom(b2), Some(b0));
        assert_eq!(dt.idom(b3), Some(b0));

        assert!(dt.dominates(b0, b3));
        assert!(dt.dominates(b0, b0));
        assert!(!dt.dominates(b1, b3));
        assert!(!dt.dominates(b3, b0));
    }

    #[test]
    fn unreachable_block() {
        let mut types = TypeStore::new();
        let void = types.void();
        let mut func = Function::new("f".to_string(), void);
        func.is_declaration = false;

        let b0 = func.make_block("entry".to_string());
        let b1 = func.make_block("dead".to_string());
        let b2 = func.make_block("exit".to_string());

        func.append_inst(b0, InstData::Br { dest: b2 }, None, None);
        func.append_inst(b1, InstData::Br { dest: b2 }, None, None);
        func.append_inst(b2, InstData::Ret { value: None }, None, None);
        func.finish();

        let cfg = ControlFlowGraph::with_function(&func);
        let dt = DominatorTree::with_function(&func, &cfg);

        assert!(dt.is_reachable(b0));
        assert!(!dt.is_reachable(b1));
        assert_eq!(dt.idom(b2), Some(b0));
        assert!(!dt.dominates(b1, b2));
    }

    #[test]
    fn loop_back_edge() {
        let mut types = TypeStore::new();
        let void = types.void();
        let mut func = Function::new("f".to_string(), void);
        func.is_declaration = false;

        let b0 = func.make_block("entry".to_string());
        let b1 = func.make_block("header".to_string());
        let b2 = func.make_block("body".to_string());
        let b3 = func.make_block("exit".to_string());

        func.append_inst(b0, InstData::Br { dest: b1 }, None, None);
        func.append_inst(
            b1,
            InstData::CondBr {
                cond: cond(),
                then_dest: b2,
                else_dest: b3,
            },
            None,
            None,
        );
        func.append_inst(b2, InstData::Br { dest: b1 }, None, None);
        func.append_inst(b3, InstData::Ret { value: None }, None, None);
        func.finish();

        let cfg = ControlFlowGraph::with_function(&func);
        let dt = DominatorTree::with_function(&func, &cfg);

        assert_eq!(dt.idom(b1), Some(b0));
        assert_eq!(dt.idom(b2), Some(b1));
        assert_eq!(dt.idom(b3), Some(b1));
        assert!(dt.dominates(b1, b2));
        assert!(dt.dominates(b1, b3));
        assert!(!dt.dominates(b2, b3));
        let chain: Vec<_> = dt.idom_chain(b2).collect();
        assert_eq!(chain, vec![b1, b0]);
    }
}
