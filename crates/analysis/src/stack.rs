//! Frame-size computation, transitive stack usage, and recursion
//! classification.

use crate::callgraph::{has_non_self_call, CallGraph};
use crate::result::{AnalysisConfig, AnalysisMode, DEFAULT_STACK_LIMIT};
use crate::value_utils::{const_from_value, derive_alloca_name};
use rustc_hash::{FxHashMap, FxHashSet};
use stackscan_ir::datalayout::align_to;
use stackscan_ir::{ControlFlowGraph, DominatorTree, FuncId, InstData, Module};

/// The local frame of one function.
#[derive(Clone, Debug, Default)]
pub struct LocalStackInfo {
    pub bytes: u64,
    /// Set when some allocation size could not be determined; `bytes` is a
    /// lower bound then.
    pub unknown: bool,
    pub has_dynamic_alloca: bool,
    /// Named allocations with their byte sizes, for messages.
    pub allocas: Vec<(String, u64)>,
}

/// A possibly-unknown transitive byte count.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StackEstimate {
    pub bytes: u64,
    pub unknown: bool,
}

fn compute_local_stack_base(module: &Module, func_id: FuncId) -> LocalStackInfo {
    let func = &module.functions[func_id];
    let mut info = LocalStackInfo::default();

    for (_, inst) in func.insts_in_order() {
        let InstData::Alloca {
            allocated_ty,
            count,
            ..
        } = &func.insts[inst]
        else {
            continue;
        };

        let count = match count.const_zext() {
            Some(c) => c,
            None => match const_from_value(func, count) {
                Some(c) => c,
                None => {
                    info.has_dynamic_alloca = true;
                    info.unknown = true;
                    continue;
                }
            },
        };

        let size = module
            .data_layout
            .alloc_size(&module.types, *allocated_ty)
            .saturating_mul(count);
        info.bytes += size;
        info.allocas
            .push((derive_alloca_name(module, func, inst), size));
    }

    info
}

/// Local frame size under the configured mode.
pub fn compute_local_stack(
    module: &Module,
    func_id: FuncId,
    mode: AnalysisMode,
) -> LocalStackInfo {
    let mut info = compute_local_stack_base(module, func_id);
    let stack_align = module.data_layout.stack_align_bytes();

    match mode {
        AnalysisMode::Ir => {
            if info.bytes > 0 && stack_align > 1 {
                info.bytes = align_to(info.bytes, stack_align);
            }
        }
        AnalysisMode::Abi => {
            let mut frame = info.bytes;
            if stack_align > 1 {
                frame = align_to(frame, stack_align);
            }
            let defined = !module.functions[func_id].is_declaration;
            if defined && stack_align > 1 && frame < stack_align {
                frame = stack_align;
            }
            if stack_align > 1 && has_non_self_call(module, func_id) {
                frame = align_to(frame + stack_align, stack_align);
            }
            info.bytes = frame;
        }
    }

    info
}

/// Transitive stack totals plus the set of functions on call-graph cycles.
#[derive(Default)]
pub struct GlobalStackUsage {
    pub totals: FxHashMap<FuncId, StackEstimate>,
    pub recursive: FxHashSet<FuncId>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum VisitState {
    NotVisited,
    Visiting,
    Visited,
}

/// DFS over the call graph combining local frames into worst-case totals.
/// A back edge marks every function on the current DFS stack as recursive
/// and contributes the cycle head's local frame as a lower bound.
pub fn compute_global_stack(
    cg: &CallGraph,
    locals: &FxHashMap<FuncId, LocalStackInfo>,
) -> GlobalStackUsage {
    let mut usage = GlobalStackUsage::default();
    let mut state: FxHashMap<FuncId, VisitState> = FxHashMap::default();

    struct Frame {
        func: FuncId,
        next_callee: usize,
        max_callee: StackEstimate,
    }

    let local_estimate = |f: FuncId| -> StackEstimate {
        match locals.get(&f) {
            Some(info) => StackEstimate {
                bytes: info.bytes,
                unknown: info.unknown,
            },
            None => StackEstimate::default(),
        }
    };

    let mut roots: Vec<FuncId> = locals.keys().copied().collect();
    roots.sort();

    for root in roots {
        if state.get(&root).copied().unwrap_or(VisitState::NotVisited) != VisitState::NotVisited {
            continue;
        }
        let mut stack = vec![Frame {
            func: root,
            next_callee: 0,
            max_callee: StackEstimate::default(),
        }];
        state.insert(root, VisitState::Visiting);

        loop {
            let Some(top) = stack.last() else { break };
            let func = top.func;
            let next = top.next_callee;
            let callees = cg.callees(func);

            if next < callees.len() {
                stack.last_mut().unwrap().next_callee += 1;
                let callee = callees[next];

                let callee_total = match state
                    .get(&callee)
                    .copied()
                    .unwrap_or(VisitState::NotVisited)
                {
                    VisitState::Visiting => {
                        // Cycle: everything currently on the DFS stack is
                        // recursive; the callee contributes its local frame
                        // as the cycle's floor.
                        for (f, s) in &state {
                            if *s == VisitState::Visiting {
                                usage.recursive.insert(*f);
                            }
                        }
                        Some(local_estimate(callee))
                    }
                    VisitState::Visited => {
                        Some(usage.totals.get(&callee).copied().unwrap_or_default())
                    }
                    VisitState::NotVisited => {
                        state.insert(callee, VisitState::Visiting);
                        stack.push(Frame {
                            func: callee,
                            next_callee: 0,
                            max_callee: StackEstimate::default(),
                        });
                        None
                    }
                };

                if let Some(est) = callee_total {
                    let frame = stack.last_mut().unwrap();
                    if est.bytes > frame.max_callee.bytes {
                        frame.max_callee.bytes = est.bytes;
                    }
                    frame.max_callee.unknown |= est.unknown;
                }
                continue;
            }

            // All callees done: finalize this function.
            let max_callee = top.max_callee;
            let local = local_estimate(func);
            let total = StackEstimate {
                bytes: local.bytes + max_callee.bytes,
                unknown: local.unknown || max_callee.unknown,
            };
            usage.totals.insert(func, total);
            state.insert(func, VisitState::Visited);
            stack.pop();

            if let Some(parent) = stack.last_mut() {
                if total.bytes > parent.max_callee.bytes {
                    parent.max_callee.bytes = total.bytes;
                }
                parent.max_callee.unknown |= total.unknown;
            }
        }
    }

    usage
}

/// Every return of the function is dominated by a self-call block (or the
/// function has a self-call and no return at all).
pub fn has_infinite_self_recursion(module: &Module, func_id: FuncId) -> bool {
    let func = &module.functions[func_id];
    if func.is_declaration {
        return false;
    }

    let mut self_call_blocks = Vec::new();
    for (block, inst) in func.insts_in_order() {
        if func.insts[inst].direct_callee() == Some(func_id)
            && !self_call_blocks.contains(&block)
        {
            self_call_blocks.push(block);
        }
    }
    if self_call_blocks.is_empty() {
        return false;
    }

    let cfg = ControlFlowGraph::with_function(func);
    let domtree = DominatorTree::with_function(func, &cfg);

    // Every return must sit below a self-call; a function with no return at
    // all spins forever once the self-call is reachable.
    for (block, inst) in func.insts_in_order() {
        if !matches!(func.insts[inst], InstData::Ret { .. }) {
            continue;
        }
        let dominated = self_call_blocks
            .iter()
            .any(|&scb| domtree.dominates(scb, block));
        if !dominated {
            return false;
        }
    }
    true
}

/// Size above which a single constant allocation is flagged as oversized:
/// an eighth of the stack budget, floored at 64 KiB.
pub fn alloca_large_threshold(config: &AnalysisConfig) -> u64 {
    let base = if config.stack_limit != 0 {
        config.stack_limit
    } else {
        DEFAULT_STACK_LIMIT
    };
    (base / 8).max(64 * 1024)
}

/// Human-readable worst-case call chain starting at `func`, following the
/// heaviest callee at every step.
pub fn build_max_stack_call_path(
    module: &Module,
    cg: &CallGraph,
    usage: &GlobalStackUsage,
    func: FuncId,
) -> String {
    let mut path = String::new();
    let mut visited: FxHashSet<FuncId> = FxHashSet::default();
    let mut current = func;

    loop {
        if !visited.insert(current) {
            break;
        }
        if !path.is_empty() {
            path.push_str(" -> ");
        }
        path.push_str(&module.functions[current].name);

        let mut best: Option<(FuncId, StackEstimate)> = None;
        for &callee in cg.callees(current) {
            let est = usage.totals.get(&callee).copied().unwrap_or_default();
            match best {
                Some((_, best_est)) if est.bytes <= best_est.bytes => {}
                _ => best = Some((callee, est)),
            }
        }
        match best {
            Some((callee, est)) if est.bytes > 0 => current = callee,
            _ => break,
        }
    }

    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackscan_reader::parse_module;

    const DL: &str = "target datalayout = \"e-m:e-i64:64-i128:128-f80:128-n8:16:32:64-S128\"\n";

    fn locals_for(
        module: &Module,
        mode: AnalysisMode,
    ) -> FxHashMap<FuncId, LocalStackInfo> {
        module
            .defined_functions()
            .map(|f| (f, compute_local_stack(module, f, mode)))
            .collect()
    }

    #[test]
    fn ir_mode_rounds_to_stack_alignment() {
        let text = format!(
            "{DL}
define void @f() {{
entry:
  %buf = alloca [10 x i8], align 1
  %n = alloca i32, align 4
  ret void
}}
"
        );
        let module = parse_module(&text).unwrap();
        let f = module.func_by_name("f").unwrap();
        let info = compute_local_stack(&module, f, AnalysisMode::Ir);
        // 10 + 4 = 14, rounded up to the 16-byte stack alignment.
        assert_eq!(info.bytes, 16);
        assert!(!info.unknown);
        assert_eq!(info.allocas.len(), 2);
        assert_eq!(info.allocas[0], ("buf".to_string(), 10));
    }

    #[test]
    fn abi_mode_charges_call_slot() {
        let text = format!(
            "{DL}
define void @leaf() {{
entry:
  ret void
}}

define void @caller() {{
entry:
  call void @leaf()
  ret void
}}
"
        );
        let module = parse_module(&text).unwrap();
        let leaf = module.func_by_name("leaf").unwrap();
        let caller = module.func_by_name("caller").unwrap();
        // A defined leaf with no locals still gets a minimum frame.
        assert_eq!(compute_local_stack(&module, leaf, AnalysisMode::Abi).bytes, 16);
        // The caller adds a caller-save slot on top of the minimum.
        assert_eq!(
            compute_local_stack(&module, caller, AnalysisMode::Abi).bytes,
            32
        );
    }

    #[test]
    fn dynamic_alloca_marks_unknown() {
        let text = format!(
            "{DL}
define void @f(i64 noundef %n) {{
entry:
  %buf = alloca i8, i64 %n, align 1
  ret void
}}
"
        );
        let module = parse_module(&text).unwrap();
        let f = module.func_by_name("f").unwrap();
        let info = compute_local_stack(&module, f, AnalysisMode::Ir);
        assert!(info.unknown);
        assert!(info.has_dynamic_alloca);
        assert_eq!(info.bytes, 0);
    }

    #[test]
    fn transitive_totals_and_recursion() {
        let text = format!(
            "{DL}
define void @leaf() {{
entry:
  %buf = alloca [32 x i8], align 1
  ret void
}}

define void @mid() {{
entry:
  %buf = alloca [16 x i8], align 1
  call void @leaf()
  ret void
}}

define void @spin() {{
entry:
  call void @spin()
  ret void
}}
"
        );
        let module = parse_module(&text).unwrap();
        let cg = CallGraph::build(&module);
        let locals = locals_for(&module, AnalysisMode::Ir);
        let usage = compute_global_stack(&cg, &locals);

        let leaf = module.func_by_name("leaf").unwrap();
        let mid = module.func_by_name("mid").unwrap();
        let spin = module.func_by_name("spin").unwrap();

        assert_eq!(usage.totals[&leaf].bytes, 32);
        assert_eq!(usage.totals[&mid].bytes, 48);
        assert!(usage.recursive.contains(&spin));
        assert!(!usage.recursive.contains(&mid));
        // max >= local for everything.
        for (f, info) in &locals {
            assert!(usage.totals[f].bytes >= info.bytes);
        }

        let path = build_max_stack_call_path(&module, &cg, &usage, mid);
        assert_eq!(path, "mid -> leaf");
    }

    #[test]
    fn mutual_recursion_marks_both() {
        let text = format!(
            "{DL}
define void @a() {{
entry:
  call void @b()
  ret void
}}

define void @b() {{
entry:
  call void @a()
  ret void
}}
"
        );
        let module = parse_module(&text).unwrap();
        let cg = CallGraph::build(&module);
        let locals = locals_for(&module, AnalysisMode::Ir);
        let usage = compute_global_stack(&cg, &locals);
        let a = module.func_by_name("a").unwrap();
        let b = module.func_by_name("b").unwrap();
        assert!(usage.recursive.contains(&a));
        assert!(usage.recursive.contains(&b));
    }

    #[test]
    fn infinite_self_recursion_detection() {
        let text = format!(
            "{DL}
define void @always(i32 noundef %n) {{
entry:
  call void @always(i32 noundef %n)
  ret void
}}

define void @guarded(i32 noundef %n) {{
entry:
  %cmp = icmp sgt i32 %n, 0
  br i1 %cmp, label %rec, label %done

rec:
  %sub = sub nsw i32 %n, 1
  call void @guarded(i32 noundef %sub)
  br label %done

done:
  ret void
}}
"
        );
        let module = parse_module(&text).unwrap();
        let always = module.func_by_name("always").unwrap();
        let guarded = module.func_by_name("guarded").unwrap();
        assert!(has_infinite_self_recursion(&module, always));
        assert!(!has_infinite_self_recursion(&module, guarded));
    }

    #[test]
    fn threshold_floor() {
        let config = AnalysisConfig::default();
        assert_eq!(alloca_large_threshold(&config), 1024 * 1024);
        let small = AnalysisConfig {
            stack_limit: 64 * 1024,
            ..AnalysisConfig::default()
        };
        assert_eq!(alloca_large_threshold(&small), 64 * 1024);
    }
}
