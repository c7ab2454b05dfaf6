//! Duplicate `else if` conditions: a conditional branch whose condition is
//! equivalent to a dominating branch's condition on the not-taken path,
//! with a textual `else` between the two and no interfering write.

use crate::filter::FunctionFilter;
use crate::passes::alloca_address_is_private;
use crate::value_utils::{strip_casts, strip_pointer_casts};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use stackscan_ir::{
    ControlFlowGraph, DominatorTree, FuncId, Function, Inst, InstData, IntPredicate, Module,
    Operand,
};

#[derive(Clone, Debug)]
pub struct DuplicateConditionIssue {
    pub func: FuncId,
    pub func_name: String,
    pub inst: Inst,
}

/// Per-call cache of source files, keyed by absolute path.
type SourceCache = FxHashMap<String, Option<Vec<String>>>;

fn source_lines<'c>(cache: &'c mut SourceCache, path: &str) -> Option<&'c [String]> {
    if path.is_empty() {
        return None;
    }
    let entry = cache.entry(path.to_string()).or_insert_with(|| {
        std::fs::read_to_string(path)
            .ok()
            .map(|text| text.lines().map(|l| l.to_string()).collect())
    });
    entry.as_deref()
}

fn is_word_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

/// Drop a trailing `//` comment, honoring double-quoted strings.
fn strip_line_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    let mut in_string = false;
    let mut escape = false;
    let mut i = 0;
    while i + 1 < bytes.len() {
        let c = bytes[i];
        if escape {
            escape = false;
            i += 1;
            continue;
        }
        if c == b'\\' && in_string {
            escape = true;
            i += 1;
            continue;
        }
        if c == b'"' {
            in_string = !in_string;
            i += 1;
            continue;
        }
        if !in_string && c == b'/' && bytes[i + 1] == b'/' {
            return &line[..i];
        }
        i += 1;
    }
    line
}

fn line_has_else_token(line: &str) -> bool {
    let bytes = line.as_bytes();
    let mut pos = 0;
    while let Some(found) = line[pos..].find("else") {
        let at = pos + found;
        let left_ok = at == 0 || !is_word_char(bytes[at - 1]);
        let right_ok = at + 4 >= bytes.len() || !is_word_char(bytes[at + 4]);
        if left_ok && right_ok {
            return true;
        }
        pos = at + 4;
    }
    false
}

/// Does the source range `[start_line, end_line:end_column]` contain a
/// whole-word `else`, skipping line comments and string contents?
fn has_else_between(
    lines: &[String],
    mut start_line: u32,
    mut end_line: u32,
    end_column: u32,
) -> bool {
    if lines.is_empty() || start_line == 0 || end_line == 0 {
        return false;
    }
    if start_line > end_line {
        std::mem::swap(&mut start_line, &mut end_line);
    }
    let end_line = end_line.min(lines.len() as u32);
    let start_line = start_line.min(end_line);

    for line_no in start_line..=end_line {
        let mut view = strip_line_comment(&lines[(line_no - 1) as usize]);
        if line_no == end_line && end_column > 0 {
            let cut = (end_column - 1) as usize;
            if cut < view.len() {
                view = &view[..cut];
            }
        }
        if line_has_else_token(view) {
            return true;
        }
    }
    false
}

fn inst_source_location(
    module: &Module,
    func: &Function,
    inst: Inst,
) -> Option<(String, u32, u32)> {
    if let Some(loc) = func.debug_loc(inst) {
        if let Some((line, column)) = module.metadata.location(loc) {
            let path = module
                .metadata
                .scope_path(loc)
                .or_else(|| func.subprogram.and_then(|sp| module.metadata.scope_path(sp)));
            if let Some(path) = path {
                if line != 0 {
                    return Some((path, line, column));
                }
            }
        }
    }
    None
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ConditionKind {
    ICmp,
    BoolValue,
}

struct MemoryOperand {
    ptr: Operand,
    /// True when the slot's address is provably uncaptured, so only direct
    /// stores can change the loaded value.
    precise: bool,
}

struct ConditionKey {
    kind: ConditionKind,
    pred: IntPredicate,
    lhs: Operand,
    rhs: Operand,
    bool_value: Operand,
    memory_operands: SmallVec<[MemoryOperand; 2]>,
}

fn canonicalize_operand(
    module: &Module,
    func: &Function,
    op: &Operand,
    mem: &mut SmallVec<[MemoryOperand; 2]>,
) -> Operand {
    let stripped = strip_casts(func, op);
    if let Some(v) = stripped.as_value() {
        if let Some(def) = func.value_inst(v) {
            if let InstData::Load { ptr, .. } = &func.insts[def] {
                let ptr = strip_pointer_casts(func, ptr);
                let precise = alloca_address_is_private(module, func, &ptr);
                mem.push(MemoryOperand {
                    ptr: ptr.clone(),
                    precise,
                });
                return ptr;
            }
        }
    }
    stripped
}

fn dedupe_memory_operands(key: &mut ConditionKey) {
    let mut seen: SmallVec<[Operand; 4]> = SmallVec::new();
    key.memory_operands.retain(|mem| {
        if seen.contains(&mem.ptr) {
            false
        } else {
            seen.push(mem.ptr.clone());
            true
        }
    });
}

fn build_condition_key(module: &Module, func: &Function, cond: &Operand) -> Option<ConditionKey> {
    let mut mem = SmallVec::new();
    if let Some(v) = cond.as_value() {
        if let Some(def) = func.value_inst(v) {
            if let InstData::ICmp { pred, lhs, rhs } = &func.insts[def] {
                let mut key = ConditionKey {
                    kind: ConditionKind::ICmp,
                    pred: *pred,
                    lhs: canonicalize_operand(module, func, lhs, &mut mem),
                    rhs: canonicalize_operand(module, func, rhs, &mut mem),
                    bool_value: Operand::Const(stackscan_ir::Constant::Null),
                    memory_operands: mem,
                };
                // Order the operand pair so equivalent compares agree.
                if key.rhs < key.lhs {
                    key.pred = key.pred.swapped();
                    std::mem::swap(&mut key.lhs, &mut key.rhs);
                }
                dedupe_memory_operands(&mut key);
                return Some(key);
            }
        }
    }

    let raw = strip_casts(func, cond);
    let is_int = match &raw {
        Operand::Value(v) => module.types.is_int(func.value_type(*v)),
        Operand::Const(c) => c.sext_value().is_some(),
        _ => false,
    };
    if !is_int {
        return None;
    }
    let mut key = ConditionKey {
        kind: ConditionKind::BoolValue,
        pred: IntPredicate::Eq,
        lhs: Operand::Const(stackscan_ir::Constant::Null),
        rhs: Operand::Const(stackscan_ir::Constant::Null),
        bool_value: canonicalize_operand(module, func, &raw, &mut mem),
        memory_operands: mem,
    };
    dedupe_memory_operands(&mut key);
    Some(key)
}

fn keys_equivalent(a: &ConditionKey, b: &ConditionKey) -> bool {
    if a.kind != b.kind {
        return false;
    }
    match a.kind {
        ConditionKind::ICmp => a.pred == b.pred && a.lhs == b.lhs && a.rhs == b.rhs,
        ConditionKind::BoolValue => a.bool_value == b.bool_value,
    }
}

fn may_write_to_memory(module: &Module, data: &InstData) -> bool {
    match data {
        InstData::Store { .. } | InstData::AtomicRmw { .. } | InstData::CmpXchg { .. } => true,
        InstData::Call { callee, .. } | InstData::Invoke { callee, .. } => {
            match callee.as_func() {
                Some(f) => {
                    let callee_fn = &module.functions[f];
                    let name = &callee_fn.name;
                    if name.starts_with("llvm.dbg.")
                        || name.starts_with("llvm.lifetime.")
                        || name.starts_with("llvm.assume")
                    {
                        return false;
                    }
                    !callee_fn.attrs.only_reads_memory()
                }
                None => true,
            }
        }
        InstData::Unknown { .. } => true,
        _ => false,
    }
}

fn is_interfering_write(
    module: &Module,
    func: &Function,
    inst: Inst,
    mem: &MemoryOperand,
) -> bool {
    let data = &func.insts[inst];
    if !may_write_to_memory(module, data) {
        return false;
    }
    match data {
        InstData::Store { ptr, .. }
        | InstData::AtomicRmw { ptr, .. }
        | InstData::CmpXchg { ptr, .. } => strip_pointer_casts(func, ptr) == mem.ptr,
        InstData::Call { callee, args, .. } | InstData::Invoke { callee, args, .. } => {
            if let Some(f) = callee.as_func() {
                let name = &module.functions[f].name;
                if name.contains("memcpy") || name.contains("memmove") || name.contains("memset")
                {
                    return args
                        .first()
                        .map(|a| strip_pointer_casts(func, &a.value) == mem.ptr)
                        .unwrap_or(false);
                }
            }
            if !mem.precise {
                return true;
            }
            args.iter()
                .any(|a| strip_pointer_casts(func, &a.value) == mem.ptr)
        }
        _ => !mem.precise,
    }
}

fn has_intervening_writes(
    module: &Module,
    func: &Function,
    domtree: &DominatorTree,
    cfg: &ControlFlowGraph,
    path_block: stackscan_ir::Block,
    at: Inst,
    memory_operands: &[MemoryOperand],
) -> bool {
    if memory_operands.is_empty() {
        return false;
    }
    let Some(at_block) = func.inst_block(at) else {
        return false;
    };

    for (block, block_data) in func.blocks.iter() {
        if !domtree.dominates(path_block, block) {
            continue;
        }
        for &inst in &block_data.insts {
            if block == at_block && inst == at {
                break;
            }
            if matches!(func.insts[inst], InstData::DebugRecord { .. }) {
                continue;
            }
            if !may_write_to_memory(module, &func.insts[inst]) {
                continue;
            }
            // The write must be able to happen before the flagged branch.
            let reachable = if block == at_block {
                func.inst_position(inst) < func.inst_position(at)
            } else {
                cfg.is_reachable(block, at_block)
            };
            if !reachable {
                continue;
            }
            for mem in memory_operands {
                if is_interfering_write(module, func, inst, mem) {
                    return true;
                }
            }
        }
    }
    false
}

fn find_duplicate(
    module: &Module,
    func: &Function,
    func_id: FuncId,
    domtree: &DominatorTree,
    cfg: &ControlFlowGraph,
    cache: &mut SourceCache,
    branch: Inst,
) -> Option<DuplicateConditionIssue> {
    let InstData::CondBr { cond, .. } = &func.insts[branch] else {
        return None;
    };
    let cur_block = func.inst_block(branch)?;
    let cur_key = build_condition_key(module, func, cond)?;
    let (cur_path, cur_line, cur_col) = inst_source_location(module, func, branch)?;

    for dom_block in domtree.idom_chain(cur_block) {
        let dom_term = func.block_terminator(dom_block)?;
        let InstData::CondBr {
            cond: dom_cond,
            else_dest,
            ..
        } = &func.insts[dom_term]
        else {
            continue;
        };
        if !domtree.dominates(*else_dest, cur_block) {
            continue;
        }
        let Some(dom_key) = build_condition_key(module, func, dom_cond) else {
            continue;
        };
        if !keys_equivalent(&dom_key, &cur_key) {
            continue;
        }
        let Some((dom_path, dom_line, _)) = inst_source_location(module, func, dom_term) else {
            continue;
        };
        if dom_path != cur_path {
            continue;
        }
        let Some(lines) = source_lines(cache, &cur_path) else {
            continue;
        };
        if !has_else_between(lines, dom_line, cur_line, cur_col) {
            continue;
        }
        if has_intervening_writes(
            module,
            func,
            domtree,
            cfg,
            *else_dest,
            branch,
            &cur_key.memory_operands,
        ) {
            continue;
        }
        return Some(DuplicateConditionIssue {
            func: func_id,
            func_name: func.name.clone(),
            inst: branch,
        });
    }
    None
}

pub fn analyze(module: &Module, filter: &FunctionFilter) -> Vec<DuplicateConditionIssue> {
    let mut out = Vec::new();
    let mut cache: SourceCache = FxHashMap::default();

    for func_id in module.defined_functions() {
        if !filter.should_analyze(module, func_id) {
            continue;
        }
        let func = &module.functions[func_id];
        let cfg = ControlFlowGraph::with_function(func);
        let domtree = DominatorTree::with_function(func, &cfg);

        for (block, _) in func.blocks.iter() {
            let Some(term) = func.block_terminator(block) else {
                continue;
            };
            if !matches!(func.insts[term], InstData::CondBr { .. }) {
                continue;
            }
            if let Some(issue) =
                find_duplicate(module, func, func_id, &domtree, &cfg, &mut cache, term)
            {
                out.push(issue);
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn else_token_scan() {
        assert!(line_has_else_token("} else if (x) {"));
        assert!(line_has_else_token("}else{"));
        assert!(!line_has_else_token("int elsewhere = 0;"));
        assert!(!line_has_else_token(""));
    }

    #[test]
    fn comment_stripping() {
        assert_eq!(strip_line_comment("x = 1; // else"), "x = 1; ");
        assert_eq!(strip_line_comment("s = \"// else\";"), "s = \"// else\";");
    }

    #[test]
    fn else_between_lines() {
        let lines: Vec<String> = vec![
            "if (cond) {".to_string(),
            "  work();".to_string(),
            "} else if (cond) {".to_string(),
        ];
        assert!(has_else_between(&lines, 1, 3, 12));
        // The window ends before the `else` column.
        assert!(!has_else_between(&lines, 1, 3, 2));
        let no_else: Vec<String> = vec![
            "if (a) { }".to_string(),
            "if (a) { }".to_string(),
        ];
        assert!(!has_else_between(&no_else, 1, 2, 10));
    }
}
