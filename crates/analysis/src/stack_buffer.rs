//! Stack-buffer index-range analysis: resolve every indexed pointer back
//! to its base allocation, classify the index against the buffer arity,
//! and report out-of-range accesses. Also counts repeated stores into the
//! same buffer.

use crate::filter::FunctionFilter;
use crate::int_ranges::{self, IntRanges};
use crate::value_utils::strip_casts;
use rustc_hash::{FxHashMap, FxHashSet};
use stackscan_ir::{FuncId, Function, Inst, InstData, Module, Operand, TypeData, TypeId};

#[derive(Clone, Debug)]
pub struct StackBufferIssue {
    pub func: FuncId,
    pub func_name: String,
    pub var_name: String,
    pub array_size: u64,
    /// Offending constant index or inferred upper bound.
    pub index_or_upper_bound: i64,
    pub is_write: bool,
    pub index_is_constant: bool,
    pub is_lower_bound_violation: bool,
    pub lower_bound: i64,
    /// Allocation-first chain of names leading to the indexed pointer.
    pub alias_path: Vec<String>,
    pub inst: Inst,
}

#[derive(Clone, Debug)]
pub struct MultipleStoreIssue {
    pub func: FuncId,
    pub func_name: String,
    pub var_name: String,
    pub store_count: usize,
    pub distinct_index_count: usize,
    pub alloca: Inst,
}

/// Is this allocation a stack buffer worth tracking: a true array, an
/// `alloca T, n` array allocation, or a struct with an array field?
fn is_array_alloca(module: &Module, allocated_ty: TypeId, count: &Operand) -> bool {
    if count.const_zext() != Some(1) {
        return true;
    }
    match module.types.resolved(allocated_ty) {
        TypeData::Array { .. } => true,
        TypeData::Struct { fields, .. } => fields
            .iter()
            .any(|&f| matches!(module.types.resolved(f), TypeData::Array { .. })),
        _ => false,
    }
}

/// Total element count of the allocation, folding one layer of array type
/// and a constant allocation count.
fn alloca_element_count(module: &Module, func: &Function, alloca: Inst) -> Option<u64> {
    let InstData::Alloca {
        allocated_ty,
        count,
        ..
    } = &func.insts[alloca]
    else {
        return None;
    };
    let mut n = 1u64;
    if let TypeData::Array { len, .. } = module.types.resolved(*allocated_ty) {
        n *= len;
    }
    match count.const_zext() {
        Some(c) => n = n.saturating_mul(c),
        None => return None,
    }
    Some(n)
}

/// Resolve the base allocation behind a pointer, walking casts, GEPs,
/// loads of local pointer slots (through the stores that feed them), and
/// phi nodes whose incoming pointers agree. Named steps along the way are
/// collected into `path`.
fn resolve_array_alloca(
    module: &Module,
    func: &Function,
    start: &Operand,
    path: &mut Vec<String>,
    recursion: &mut FxHashSet<Operand>,
    depth: u32,
) -> Option<Inst> {
    if depth > 64 {
        return None;
    }
    if recursion.contains(start) {
        return None;
    }
    recursion.insert(start.clone());
    let result = resolve_inner(module, func, start, path, recursion, depth);
    recursion.remove(start);
    result
}

fn resolve_inner(
    module: &Module,
    func: &Function,
    start: &Operand,
    path: &mut Vec<String>,
    recursion: &mut FxHashSet<Operand>,
    depth: u32,
) -> Option<Inst> {
    let mut visited: FxHashSet<Operand> = FxHashSet::default();
    let mut cur = start.clone();

    loop {
        if !visited.insert(cur.clone()) {
            return None;
        }
        if let Some(v) = cur.as_value() {
            if let Some(name) = func.value_name(v) {
                // Skip the numeric names of unnamed temporaries.
                if !name.is_empty() && !name.chars().all(|c| c.is_ascii_digit()) {
                    path.push(name.to_string());
                }
            }
        }

        let Some(v) = cur.as_value() else { return None };
        let Some(def) = func.value_inst(v) else {
            return None;
        };
        match &func.insts[def] {
            InstData::Alloca {
                allocated_ty,
                count,
                ..
            } => {
                if is_array_alloca(module, *allocated_ty, count) {
                    return Some(def);
                }
                // A pointer-typed local: chase every store into the slot
                // and require a single base.
                let slot_val = func.inst_result(def);
                let mut found: Option<Inst> = None;
                for (_, inst) in func.insts_in_order() {
                    let InstData::Store { value, ptr } = &func.insts[inst] else {
                        continue;
                    };
                    if ptr.as_value() != slot_val {
                        continue;
                    }
                    let mut sub_path = Vec::new();
                    let Some(cand) =
                        resolve_array_alloca(module, func, value, &mut sub_path, recursion, depth + 1)
                    else {
                        continue;
                    };
                    match found {
                        None => {
                            found = Some(cand);
                            path.extend(sub_path);
                        }
                        Some(prev) if prev != cand => {
                            // Ambiguous aliasing: give up rather than guess.
                            return None;
                        }
                        Some(_) => {}
                    }
                }
                return found;
            }
            InstData::Cast { op, value, .. } if op.preserves_pointer() => {
                cur = value.clone();
            }
            InstData::GetElementPtr { base, .. } => {
                cur = base.clone();
            }
            InstData::Load { ptr, .. } => {
                cur = ptr.clone();
            }
            InstData::Phi { incoming, .. } => {
                let values: Vec<Operand> = incoming.iter().map(|(v, _)| v.clone()).collect();
                return resolve_merge(module, func, &values, path, recursion, depth);
            }
            InstData::Select {
                if_true, if_false, ..
            } => {
                let values = vec![if_true.clone(), if_false.clone()];
                return resolve_merge(module, func, &values, path, recursion, depth);
            }
            _ => return None,
        }
    }
}

/// Resolve every incoming pointer of a phi or select; they must all agree
/// on one base.
fn resolve_merge(
    module: &Module,
    func: &Function,
    values: &[Operand],
    path: &mut Vec<String>,
    recursion: &mut FxHashSet<Operand>,
    depth: u32,
) -> Option<Inst> {
    let mut found: Option<Inst> = None;
    let mut merged_path = Vec::new();
    for value in values {
        let mut sub_path = Vec::new();
        let Some(cand) =
            resolve_array_alloca(module, func, value, &mut sub_path, recursion, depth + 1)
        else {
            continue;
        };
        match found {
            None => {
                found = Some(cand);
                merged_path = sub_path;
            }
            Some(prev) if prev != cand => return None,
            Some(_) => {}
        }
    }
    path.extend(merged_path);
    found
}

/// Resolve the base allocation, returning the alias path alongside.
pub fn resolve_base_alloca(
    module: &Module,
    func: &Function,
    ptr: &Operand,
) -> Option<(Inst, Vec<String>)> {
    let mut path = Vec::new();
    let mut recursion = FxHashSet::default();
    let alloca = resolve_array_alloca(module, func, ptr, &mut path, &mut recursion, 0)?;
    Some((alloca, path))
}

/// Determine the relevant array arity and index operand for a GEP.
fn array_size_and_index<'f>(
    module: &Module,
    func: &'f Function,
    gep: Inst,
    alloca: Inst,
) -> Option<(u64, &'f Operand)> {
    let InstData::GetElementPtr {
        source_ty, indices, ..
    } = &func.insts[gep]
    else {
        return None;
    };

    match module.types.resolved(*source_ty) {
        TypeData::Array { len, .. } => {
            // `[N x T]* -> [0, i]`.
            if indices.len() >= 2 {
                return Some((*len, &indices[1]));
            }
            None
        }
        TypeData::Struct { fields, .. } => {
            // `struct S* -> [0, field, i]` where the field is an array.
            if indices.len() >= 3 {
                let first = indices[0].const_zext();
                let field_idx = indices[1].const_zext();
                if let (Some(_), Some(field_idx)) = (first, field_idx) {
                    if let Some(&field_ty) = fields.get(field_idx as usize) {
                        if let TypeData::Array { len, .. } = module.types.resolved(field_ty) {
                            return Some((*len, &indices[2]));
                        }
                    }
                }
            }
            None
        }
        _ => {
            // `T* -> [i]`: fall back to the allocation's own element count.
            let n = alloca_element_count(module, func, alloca)?;
            if n == 0 {
                return None;
            }
            let idx = indices.first()?;
            Some((n, idx))
        }
    }
}

/// Users of the GEP that actually read or write through it.
fn gep_access_users(func: &Function, gep: Inst) -> Vec<(Inst, bool)> {
    let mut out = Vec::new();
    let Some(gep_val) = func.inst_result(gep) else {
        return out;
    };
    for &user in func.uses_of(gep_val) {
        match &func.insts[user] {
            InstData::Store { ptr, .. } if ptr.as_value() == Some(gep_val) => {
                out.push((user, true));
            }
            InstData::Load { ptr, .. } if ptr.as_value() == Some(gep_val) => {
                out.push((user, false));
            }
            _ => {}
        }
    }
    out
}

fn var_name_of(func: &Function, alloca: Inst) -> String {
    func.inst_result(alloca)
        .and_then(|v| func.value_name(v))
        .filter(|n| !n.is_empty())
        .map(|n| n.to_string())
        .unwrap_or_else(|| "<unnamed>".to_string())
}

fn analyze_function(
    module: &Module,
    func_id: FuncId,
    out: &mut Vec<StackBufferIssue>,
) {
    let func = &module.functions[func_id];
    let ranges = int_ranges::compute(func);

    for (_, gep) in func.insts_in_order() {
        if !matches!(func.insts[gep], InstData::GetElementPtr { .. }) {
            continue;
        }
        let InstData::GetElementPtr { base, .. } = &func.insts[gep] else {
            unreachable!()
        };

        let Some((alloca, mut alias_path)) = resolve_base_alloca(module, func, base) else {
            continue;
        };
        let Some((array_size, idx_val)) = array_size_and_index(module, func, gep, alloca) else {
            continue;
        };
        let var_name = var_name_of(func, alloca);
        // Printed order is allocation -> ... -> indexed pointer.
        alias_path.reverse();

        let base_idx = strip_casts(func, idx_val);

        if let Some(idx) = idx_val.const_sext() {
            if idx < 0 || idx as u64 >= array_size {
                for (user, is_write) in gep_access_users(func, gep) {
                    out.push(StackBufferIssue {
                        func: func_id,
                        func_name: func.name.clone(),
                        var_name: var_name.clone(),
                        array_size,
                        index_or_upper_bound: idx,
                        is_write,
                        index_is_constant: true,
                        is_lower_bound_violation: false,
                        lower_bound: 0,
                        alias_path: alias_path.clone(),
                        inst: user,
                    });
                }
            }
            continue;
        }

        // Non-constant index: consult the range facts, keyed on the
        // cast-stripped index or, for loads, the loaded slot.
        let key = match base_idx.as_value().and_then(|v| func.value_inst(v)) {
            Some(def) => match &func.insts[def] {
                InstData::Load { ptr, .. } => ptr.clone(),
                _ => base_idx.clone(),
            },
            None => base_idx.clone(),
        };
        let Some(range) = ranges.get(&key).or_else(|| ranges.get(&base_idx)) else {
            continue;
        };

        if let Some(upper) = range.upper {
            if upper >= 0 && upper as u64 >= array_size {
                for (user, is_write) in gep_access_users(func, gep) {
                    out.push(StackBufferIssue {
                        func: func_id,
                        func_name: func.name.clone(),
                        var_name: var_name.clone(),
                        array_size,
                        index_or_upper_bound: upper,
                        is_write,
                        index_is_constant: false,
                        is_lower_bound_violation: false,
                        lower_bound: 0,
                        alias_path: alias_path.clone(),
                        inst: user,
                    });
                }
            }
        }
        if let Some(lower) = range.lower {
            if lower < 0 {
                for (user, is_write) in gep_access_users(func, gep) {
                    out.push(StackBufferIssue {
                        func: func_id,
                        func_name: func.name.clone(),
                        var_name: var_name.clone(),
                        array_size,
                        index_or_upper_bound: 0,
                        is_write,
                        index_is_constant: false,
                        is_lower_bound_violation: true,
                        lower_bound: lower,
                        alias_path: alias_path.clone(),
                        inst: user,
                    });
                }
            }
        }
    }
}

pub fn analyze(module: &Module, filter: &FunctionFilter) -> Vec<StackBufferIssue> {
    let mut out = Vec::new();
    for func_id in module.defined_functions() {
        if !filter.should_analyze(module, func_id) {
            continue;
        }
        analyze_function(module, func_id, &mut out);
    }
    out
}

/// Count stores into each resolved stack buffer and the distinct index
/// expressions used, reporting buffers written more than once.
pub fn analyze_multiple_stores(
    module: &Module,
    filter: &FunctionFilter,
) -> Vec<MultipleStoreIssue> {
    let mut out = Vec::new();

    for func_id in module.defined_functions() {
        if !filter.should_analyze(module, func_id) {
            continue;
        }
        let func = &module.functions[func_id];

        struct Info {
            store_count: usize,
            index_keys: FxHashSet<Operand>,
        }
        let mut info_map: FxHashMap<Inst, Info> = FxHashMap::default();

        for (_, inst) in func.insts_in_order() {
            let InstData::Store { ptr, .. } = &func.insts[inst] else {
                continue;
            };
            let Some(gep) = ptr
                .as_value()
                .and_then(|v| func.value_inst(v))
                .filter(|&def| matches!(func.insts[def], InstData::GetElementPtr { .. }))
            else {
                continue;
            };
            let InstData::GetElementPtr {
                base,
                source_ty,
                indices,
                ..
            } = &func.insts[gep]
            else {
                unreachable!()
            };

            let Some((alloca, _)) = resolve_base_alloca(module, func, base) else {
                continue;
            };

            let idx_val = match module.types.resolved(*source_ty) {
                TypeData::Array { .. } => {
                    if indices.len() < 2 {
                        continue;
                    }
                    &indices[1]
                }
                _ => {
                    let Some(first) = indices.first() else { continue };
                    first
                }
            };
            let idx_key = strip_casts(func, idx_val);

            let entry = info_map.entry(alloca).or_insert_with(|| Info {
                store_count: 0,
                index_keys: FxHashSet::default(),
            });
            entry.store_count += 1;
            entry.index_keys.insert(idx_key);
        }

        let mut flagged: Vec<_> = info_map
            .into_iter()
            .filter(|(_, info)| info.store_count > 1)
            .collect();
        flagged.sort_by_key(|(alloca, _)| *alloca);
        for (alloca, info) in flagged {
            out.push(MultipleStoreIssue {
                func: func_id,
                func_name: func.name.clone(),
                var_name: var_name_of(func, alloca),
                store_count: info.store_count,
                distinct_index_count: info.index_keys.len(),
                alloca,
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

    fn run(text: &str) -> Vec<StackBufferIssue> {
        let module = parse_module(text).unwrap();
        let config = AnalysisConfig::default();
        let filter = FunctionFilter::new(&module, &config);
        analyze(&module, &filter)
    }

    const LOOP_OVERRUN: &str = r#"
define void @f() {
entry:
  %t = alloca [10 x i8], align 1
  %i = alloca i32, align 4
  store i32 0, ptr %i, align 4
  br label %for.cond

for.cond:
  %0 = load i32, ptr %i, align 4
  %cmp = icmp slt i32 %0, 20
  br i1 %cmp, label %for.body, label %for.end

for.body:
  %1 = load i32, ptr %i, align 4
  %idxprom = sext i32 %1 to i64
  %arrayidx = getelementptr inbounds [10 x i8], ptr %t, i64 0, i64 %idxprom
  store i8 97, ptr %arrayidx, align 1
  %2 = load i32, ptr %i, align 4
  %inc = add nsw i32 %2, 1
  store i32 %inc, ptr %i, align 4
  br label %for.cond

for.end:
  ret void
}
"#;

    #[test]
    fn loop_bound_past_end_is_flagged() {
        let issues = run(LOOP_OVERRUN);
        let writes: Vec<_> = issues.iter().filter(|i| i.is_write).collect();
        assert_eq!(writes.len(), 1);
        let issue = writes[0];
        assert_eq!(issue.array_size, 10);
        assert_eq!(issue.index_or_upper_bound, 19);
        assert!(!issue.index_is_constant);
        assert!(!issue.is_lower_bound_violation);
        assert_eq!(issue.alias_path, vec!["t".to_string()]);
    }

    #[test]
    fn constant_index_boundaries() {
        // Index size-1 is fine, size overflows, -1 underflows.
        let text = r#"
define void @f() {
entry:
  %t = alloca [10 x i8], align 1
  %ok = getelementptr inbounds [10 x i8], ptr %t, i64 0, i64 9
  store i8 1, ptr %ok, align 1
  %over = getelementptr inbounds [10 x i8], ptr %t, i64 0, i64 10
  store i8 1, ptr %over, align 1
  %under = getelementptr inbounds [10 x i8], ptr %t, i64 0, i64 -1
  store i8 1, ptr %under, align 1
  ret void
}
"#;
        let issues = run(text);
        assert_eq!(issues.len(), 2);
        assert!(issues.iter().all(|i| i.index_is_constant));
        assert!(issues.iter().any(|i| i.index_or_upper_bound == 10));
        assert!(issues.iter().any(|i| i.index_or_upper_bound == -1));
    }

    #[test]
    fn in_range_loop_is_silent() {
        let text = r#"
define void @f() {
entry:
  %t = alloca [10 x i8], align 1
  %i = alloca i32, align 4
  store i32 0, ptr %i, align 4
  br label %for.cond

for.cond:
  %0 = load i32, ptr %i, align 4
  %cmp = icmp slt i32 %0, 10
  br i1 %cmp, label %for.body, label %for.end

for.body:
  %1 = load i32, ptr %i, align 4
  %idxprom = sext i32 %1 to i64
  %arrayidx = getelementptr inbounds [10 x i8], ptr %t, i64 0, i64 %idxprom
  store i8 97, ptr %arrayidx, align 1
  br label %for.end

for.end:
  ret void
}
"#;
        assert!(run(text).is_empty());
    }

    #[test]
    fn alias_through_pointer_slot() {
        let text = r#"
define void @f() {
entry:
  %t = alloca [10 x i8], align 1
  %p = alloca ptr, align 8
  %i = alloca i32, align 4
  %decay = getelementptr inbounds [10 x i8], ptr %t, i64 0, i64 0
  store ptr %decay, ptr %p, align 8
  %0 = load i32, ptr %i, align 4
  %cmp = icmp slt i32 %0, 20
  %1 = load ptr, ptr %p, align 8
  %2 = load i32, ptr %i, align 4
  %idxprom = sext i32 %2 to i64
  %arrayidx = getelementptr inbounds i8, ptr %1, i64 %idxprom
  store i8 97, ptr %arrayidx, align 1
  ret void
}
"#;
        let issues = run(text);
        assert_eq!(issues.len(), 1);
        let issue = &issues[0];
        assert_eq!(issue.var_name, "t");
        // Allocation first, then the intermediate pointer steps.
        assert_eq!(issue.alias_path.first().map(String::as_str), Some("t"));
        assert!(issue.alias_path.contains(&"p".to_string()));
        assert_eq!(issue.index_or_upper_bound, 19);
    }

    #[test]
    fn struct_array_field() {
        let text = r#"
%struct.S = type { i32, [10 x i8] }

define void @f() {
entry:
  %s = alloca %struct.S, align 4
  %field = getelementptr inbounds %struct.S, ptr %s, i32 0, i32 1, i64 12
  store i8 1, ptr %field, align 1
  ret void
}
"#;
        let issues = run(text);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].array_size, 10);
        assert_eq!(issues[0].index_or_upper_bound, 12);
        assert!(issues[0].index_is_constant);
    }

    #[test]
    fn multiple_stores_info() {
        let module = parse_module(LOOP_OVERRUN).unwrap();
        let config = AnalysisConfig::default();
        let filter = FunctionFilter::new(&module, &config);
        let issues = analyze_multiple_stores(&module, &filter);
        // Only one store targets %t through a GEP, so nothing is flagged.
        assert!(issues.is_empty());

        let text = r#"
define void @g() {
entry:
  %t = alloca [10 x i8], align 1
  %a = getelementptr inbounds [10 x i8], ptr %t, i64 0, i64 0
  store i8 1, ptr %a, align 1
  %b = getelementptr inbounds [10 x i8], ptr %t, i64 0, i64 1
  store i8 2, ptr %b, align 1
  ret void
}
"#;
        let module = parse_module(text).unwrap();
        let filter = FunctionFilter::new(&module, &config);
        let issues = analyze_multiple_stores(&module, &filter);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].store_count, 2);
        assert_eq!(issues[0].distinct_index_count, 2);
        assert_eq!(issues[0].var_name, "t");
    }
}
