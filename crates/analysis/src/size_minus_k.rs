//! Writes whose length has the shape `size - k`: known library sinks,
//! GEP-indexed stores, and calls to user wrappers discovered by an
//! interprocedural summary fixed point.

use crate::filter::FunctionFilter;
use crate::value_queries::ValueQueries;
use crate::value_utils::{as_alloca, strip_casts};
use rustc_hash::FxHashMap;
use stackscan_ir::{
    BinOp, FuncId, Function, Inst, InstData, Module, Operand, Value,
};

#[derive(Clone, Debug)]
pub struct SizeMinusKIssue {
    pub func: FuncId,
    pub func_name: String,
    pub sink_name: String,
    pub k: i64,
    pub ptr_non_null: bool,
    pub size_above_k: bool,
    pub inst: Inst,
}

/// `(dst argument index, len argument index)` positions of a sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SinkSignature {
    pub dst_idx: usize,
    pub len_idx: usize,
}

pub type SummaryMap = FxHashMap<FuncId, Vec<SinkSignature>>;

/// Entry-block mapping from argument spill slots back to the arguments
/// stored into them (the usual -O0 prologue pattern).
fn build_arg_slots(func: &Function) -> FxHashMap<Value, Value> {
    let mut slots = FxHashMap::default();
    let Some(entry) = func.entry_block() else {
        return slots;
    };
    for &inst in &func.blocks[entry].insts {
        let InstData::Store { value, ptr } = &func.insts[inst] else {
            continue;
        };
        let Some(arg) = strip_casts(func, value).as_value() else {
            continue;
        };
        if func.value_param_index(arg).is_none() {
            continue;
        }
        let Some(slot) = as_alloca(func, &strip_casts(func, ptr)) else {
            continue;
        };
        if let Some(slot_val) = func.inst_result(slot) {
            slots.insert(slot_val, arg);
        }
    }
    slots
}

/// Strip casts; substitute a load from an argument spill slot by the
/// argument itself.
fn canonicalize(func: &Function, slots: &FxHashMap<Value, Value>, op: &Operand) -> Operand {
    let stripped = strip_casts(func, op);
    if let Some(v) = stripped.as_value() {
        if let Some(def) = func.value_inst(v) {
            if let InstData::Load { ptr, .. } = &func.insts[def] {
                if let Some(slot) = as_alloca(func, &strip_casts(func, ptr)) {
                    if let Some(slot_val) = func.inst_result(slot) {
                        if let Some(&arg) = slots.get(&slot_val) {
                            return Operand::Value(arg);
                        }
                    }
                }
            }
        }
    }
    stripped
}

/// Match `base - k` / `base + (-k)` for positive `k` on the canonicalized
/// value.
fn match_size_minus_k(
    func: &Function,
    slots: &FxHashMap<Value, Value>,
    op: &Operand,
) -> Option<(Operand, i64)> {
    let canon = canonicalize(func, slots, op);
    let v = canon.as_value()?;
    let def = func.value_inst(v)?;
    let InstData::Binary { op: bin, lhs, rhs } = &func.insts[def] else {
        return None;
    };
    let lhs = canonicalize(func, slots, lhs);
    let rhs = canonicalize(func, slots, rhs);
    match bin {
        BinOp::Sub => {
            let c = rhs.const_sext()?;
            if c > 0 {
                return Some((lhs, c));
            }
            None
        }
        BinOp::Add => {
            let c = rhs.const_sext()?;
            if c < 0 {
                return Some((lhs, -c));
            }
            None
        }
        _ => None,
    }
}

/// Known library/intrinsic sinks by name.
fn known_sink(module: &Module, callee: FuncId) -> Option<(SinkSignature, String)> {
    let name = &module.functions[callee].name;
    let matched = name.contains("memcpy")
        || name.contains("memmove")
        || name.contains("memset")
        || name.contains("strncpy")
        || name.contains("strncat")
        || name.contains("stpncpy");
    if !matched {
        return None;
    }
    Some((
        SinkSignature {
            dst_idx: 0,
            len_idx: 2,
        },
        name.clone(),
    ))
}

fn arg_index(
    func: &Function,
    slots: &FxHashMap<Value, Value>,
    op: &Operand,
) -> Option<usize> {
    let canon = canonicalize(func, slots, op);
    let v = canon.as_value()?;
    func.value_param_index(v)
}

fn add_summary_sink(sinks: &mut Vec<SinkSignature>, sig: SinkSignature) -> bool {
    if sinks.contains(&sig) {
        return false;
    }
    sinks.push(sig);
    true
}

/// Two-pass summary construction: seed with direct sinks whose destination
/// and length both canonicalize to parameters, then propagate through
/// wrappers until no summary grows.
pub fn build_summaries(module: &Module) -> SummaryMap {
    let mut summaries: SummaryMap = FxHashMap::default();

    // Pass 1: seed.
    for func_id in module.defined_functions() {
        let func = &module.functions[func_id];
        let slots = build_arg_slots(func);
        for (_, inst) in func.insts_in_order() {
            let (callee, args) = match &func.insts[inst] {
                InstData::Call { callee, args, .. } | InstData::Invoke { callee, args, .. } => {
                    (callee, args)
                }
                _ => continue,
            };
            let Some(callee_fn) = callee.as_func() else {
                continue;
            };
            let Some((sig, _)) = known_sink(module, callee_fn) else {
                continue;
            };
            if args.len() <= sig.len_idx {
                continue;
            }
            let dst = arg_index(func, &slots, &args[sig.dst_idx].value);
            let len = arg_index(func, &slots, &args[sig.len_idx].value);
            if let (Some(dst), Some(len)) = (dst, len) {
                add_summary_sink(
                    summaries.entry(func_id).or_default(),
                    SinkSignature {
                        dst_idx: dst,
                        len_idx: len,
                    },
                );
            }
        }
    }

    // Pass 2: propagate until fixed point. Termination: each iteration
    // strictly grows some summary, and summaries are bounded by pairs of
    // parameter indices.
    let mut changed = true;
    while changed {
        changed = false;
        for func_id in module.defined_functions() {
            let func = &module.functions[func_id];
            let slots = build_arg_slots(func);
            let mut added: Vec<SinkSignature> = Vec::new();
            for (_, inst) in func.insts_in_order() {
                let (callee, args) = match &func.insts[inst] {
                    InstData::Call { callee, args, .. }
                    | InstData::Invoke { callee, args, .. } => (callee, args),
                    _ => continue,
                };
                let Some(callee_fn) = callee.as_func() else {
                    continue;
                };
                if module.functions[callee_fn].is_declaration {
                    continue;
                }
                let Some(callee_sinks) = summaries.get(&callee_fn) else {
                    continue;
                };
                for sig in callee_sinks {
                    if args.len() <= sig.dst_idx || args.len() <= sig.len_idx {
                        continue;
                    }
                    let dst = arg_index(func, &slots, &args[sig.dst_idx].value);
                    let len = arg_index(func, &slots, &args[sig.len_idx].value);
                    if let (Some(dst), Some(len)) = (dst, len) {
                        added.push(SinkSignature {
                            dst_idx: dst,
                            len_idx: len,
                        });
                    }
                }
            }
            for sig in added {
                if add_summary_sink(summaries.entry(func_id).or_default(), sig) {
                    changed = true;
                }
            }
        }
    }

    summaries
}

fn analyze_function(
    module: &Module,
    func_id: FuncId,
    summaries: &SummaryMap,
    out: &mut Vec<SizeMinusKIssue>,
) {
    let func = &module.functions[func_id];
    let slots = build_arg_slots(func);
    let queries = ValueQueries::new(module, func);

    let mut emit = |at: Inst, dest: &Operand, base: &Operand, sink_name: String, k: i64| {
        let ptr_non_null = queries.is_nonnull_at(dest, at);
        let size_above_k = queries.is_greater_than_at(base, k, at);
        // Either proof suppresses the finding.
        if ptr_non_null || size_above_k {
            return;
        }
        out.push(SizeMinusKIssue {
            func: func_id,
            func_name: func.name.clone(),
            sink_name,
            k,
            ptr_non_null,
            size_above_k,
            inst: at,
        });
    };

    for (_, inst) in func.insts_in_order() {
        match &func.insts[inst] {
            InstData::Call { callee, args, .. } | InstData::Invoke { callee, args, .. } => {
                let Some(callee_fn) = callee.as_func() else {
                    continue;
                };
                if let Some((sig, name)) = known_sink(module, callee_fn) {
                    if args.len() > sig.len_idx {
                        if let Some((base, k)) =
                            match_size_minus_k(func, &slots, &args[sig.len_idx].value)
                        {
                            let label = format!("{name} (len = size-k)");
                            let dest = canonicalize(func, &slots, &args[sig.dst_idx].value);
                            emit(inst, &dest, &base, label, k);
                        }
                    }
                    continue;
                }
                if let Some(callee_sinks) = summaries.get(&callee_fn) {
                    for sig in callee_sinks {
                        if args.len() <= sig.dst_idx || args.len() <= sig.len_idx {
                            continue;
                        }
                        let Some((base, k)) =
                            match_size_minus_k(func, &slots, &args[sig.len_idx].value)
                        else {
                            continue;
                        };
                        let dest = canonicalize(func, &slots, &args[sig.dst_idx].value);
                        emit(
                            inst,
                            &dest,
                            &base,
                            module.functions[callee_fn].name.clone(),
                            k,
                        );
                    }
                }
            }
            InstData::Store { ptr, .. } => {
                let Some(gep) = ptr
                    .as_value()
                    .and_then(|v| func.value_inst(v))
                    .filter(|&def| matches!(func.insts[def], InstData::GetElementPtr { .. }))
                else {
                    continue;
                };
                let InstData::GetElementPtr { base, indices, .. } = &func.insts[gep] else {
                    unreachable!()
                };
                let mut matched = None;
                for idx in indices {
                    if let Some(m) = match_size_minus_k(func, &slots, idx) {
                        matched = Some(m);
                        break;
                    }
                }
                let Some((size_base, k)) = matched else { continue };
                let dest = canonicalize(func, &slots, base);
                emit(inst, &dest, &size_base, "store (idx = size-k)".to_string(), k);
            }
            _ => {}
        }
    }
}

pub fn analyze(module: &Module, filter: &FunctionFilter) -> Vec<SizeMinusKIssue> {
    let summaries = build_summaries(module);
    let mut out = Vec::new();
    for func_id in module.defined_functions() {
        if !filter.should_analyze(module, func_id) {
            continue;
        }
        analyze_function(module, func_id, &summaries, &mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::AnalysisConfig;
    use stackscan_reader::parse_module;

    const WRAPPER: &str = r#"
declare ptr @strncpy(ptr noundef, ptr noundef, i64 noundef)

define void @copy(ptr noundef %dst, ptr noundef %src, i64 noundef %n) {
entry:
  %dst.addr = alloca ptr, align 8
  %src.addr = alloca ptr, align 8
  %n.addr = alloca i64, align 8
  store ptr %dst, ptr %dst.addr, align 8
  store ptr %src, ptr %src.addr, align 8
  store i64 %n, ptr %n.addr, align 8
  %0 = load ptr, ptr %dst.addr, align 8
  %1 = load ptr, ptr %src.addr, align 8
  %2 = load i64, ptr %n.addr, align 8
  %sub = sub i64 %2, 1
  %call = call ptr @strncpy(ptr noundef %0, ptr noundef %1, i64 noundef %sub)
  ret void
}

define void @direct(ptr noundef %dst, ptr noundef %src, i64 noundef %n) {
entry:
  %call = call ptr @strncpy(ptr noundef %dst, ptr noundef %src, i64 noundef %n)
  ret void
}

define void @outer(ptr noundef %d, ptr noundef %s, i64 noundef %len) {
entry:
  %sub = sub i64 %len, 1
  call void @direct(ptr noundef %d, ptr noundef %s, i64 noundef %sub)
  ret void
}
"#;

    #[test]
    fn summaries_reach_fixed_point() {
        let module = parse_module(WRAPPER).unwrap();
        let summaries = build_summaries(&module);
        let direct = module.func_by_name("direct").unwrap();
        let outer = module.func_by_name("outer").unwrap();
        // `direct` forwards (dst, len) = (0, 2) straight into strncpy.
        assert_eq!(
            summaries.get(&direct).map(Vec::as_slice),
            Some(
                &[SinkSignature {
                    dst_idx: 0,
                    len_idx: 2
                }][..]
            )
        );
        // `outer` does not itself forward parameters into a sink position
        // with a parameter length (its length is `%len - 1`).
        assert!(summaries.get(&outer).is_none());
        // `copy` forwards through its spill slots.
        let copy = module.func_by_name("copy").unwrap();
        assert!(summaries.get(&copy).is_none(), "copy's len arg is n-1");
    }

    #[test]
    fn strncpy_with_n_minus_one_is_flagged() {
        let module = parse_module(WRAPPER).unwrap();
        let config = AnalysisConfig::default();
        let filter = FunctionFilter::new(&module, &config);
        let issues = analyze(&module, &filter);

        // Direct sink in `copy`, and the wrapper call in `outer` through
        // `direct`'s summary.
        assert_eq!(issues.len(), 2);
        let copy_issue = issues.iter().find(|i| i.func_name == "copy").unwrap();
        assert_eq!(copy_issue.k, 1);
        assert!(!copy_issue.ptr_non_null);
        assert!(!copy_issue.size_above_k);
        assert!(copy_issue.sink_name.contains("strncpy"));

        let outer_issue = issues.iter().find(|i| i.func_name == "outer").unwrap();
        assert_eq!(outer_issue.sink_name, "direct");
        assert_eq!(outer_issue.k, 1);
    }

    #[test]
    fn guarded_size_is_suppressed() {
        let text = r#"
declare ptr @strncpy(ptr noundef, ptr noundef, i64 noundef)

define void @guarded(ptr noundef %dst, ptr noundef %src, i64 noundef %n) {
entry:
  %cmp = icmp sgt i64 %n, 1
  br i1 %cmp, label %do, label %done

do:
  %sub = sub i64 %n, 1
  %call = call ptr @strncpy(ptr noundef %dst, ptr noundef %src, i64 noundef %sub)
  br label %done

done:
  ret void
}
"#;
        let module = parse_module(text).unwrap();
        let config = AnalysisConfig::default();
        let filter = FunctionFilter::new(&module, &config);
        let issues = analyze(&module, &filter);
        assert!(issues.is_empty());
    }

    #[test]
    fn store_with_size_minus_k_index() {
        let text = r#"
define void @f(ptr noundef %buf, i64 noundef %size) {
entry:
  %sub = sub i64 %size, 2
  %p = getelementptr inbounds i8, ptr %buf, i64 %sub
  store i8 0, ptr %p, align 1
  ret void
}
"#;
        let module = parse_module(text).unwrap();
        let config = AnalysisConfig::default();
        let filter = FunctionFilter::new(&module, &config);
        let issues = analyze(&module, &filter);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].k, 2);
        assert_eq!(issues[0].sink_name, "store (idx = size-k)");
    }
}
