//! Detection of ill-formed "container_of" base reconstructions: pointers
//! rebuilt from a member address by integer arithmetic (`inttoptr` of
//! `ptrtoint ± k`) or by constant-offset GEPs, checked against the bounds
//! of the allocation they originated from.

use crate::filter::FunctionFilter;
use crate::value_utils::{as_alloca_stripped, strip_int_casts, strip_pointer_casts};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use stackscan_ir::{
    CastOp, ConstExpr, Constant, BinOp, FuncId, Function, Inst, InstData, Module, Operand,
    TypeData, TypeId,
};
use std::collections::BTreeSet;

#[derive(Clone, Debug)]
pub struct BaseReconstructionIssue {
    pub func: FuncId,
    pub func_name: String,
    pub var_name: String,
    /// Member offsets the pointer was traced back to, printed form.
    pub source_member: String,
    /// The constant offset the reconstruction applies.
    pub offset_used: i64,
    pub target_type: String,
    pub out_of_bounds: bool,
    pub inst: Inst,
}

/// One `ptrtoint(P) + offset` candidate found under an `inttoptr`.
struct PtrIntMatch {
    ptr: Operand,
    offset: i64,
    saw_offset: bool,
}

fn is_load_from_alloca(func: &Function, op: &Operand, alloca_val: Operand) -> bool {
    let Some(v) = op.as_value() else { return false };
    let Some(def) = func.value_inst(v) else {
        return false;
    };
    let InstData::Load { ptr, .. } = &func.insts[def] else {
        return false;
    };
    strip_pointer_casts(func, ptr) == alloca_val
}

fn value_depends_on_alloca(
    func: &Function,
    op: &Operand,
    alloca_val: &Operand,
    visited: &mut FxHashSet<Operand>,
) -> bool {
    if !visited.insert(op.clone()) {
        return false;
    }
    if is_load_from_alloca(func, op, alloca_val.clone()) {
        return true;
    }
    if let Some(v) = op.as_value() {
        if let Some(def) = func.value_inst(v) {
            for operand in func.insts[def].operands() {
                if value_depends_on_alloca(func, operand, alloca_val, visited) {
                    return true;
                }
            }
        }
    }
    false
}

/// Match `load(slot) ± C` and return the delta.
fn match_slot_load_add_sub(
    func: &Function,
    op: &Operand,
    alloca_val: &Operand,
) -> Option<i64> {
    let (bin_op, lhs, rhs) = match op {
        Operand::Value(v) => {
            let def = func.value_inst(*v)?;
            match &func.insts[def] {
                InstData::Binary { op, lhs, rhs } => (*op, lhs.clone(), rhs.clone()),
                _ => return None,
            }
        }
        Operand::Const(Constant::Expr(expr)) => match expr.as_ref() {
            ConstExpr::Binary { op, lhs, rhs } => (*op, lhs.clone(), rhs.clone()),
            _ => return None,
        },
        _ => return None,
    };
    if bin_op != BinOp::Add && bin_op != BinOp::Sub {
        return None;
    }

    let lhs_const = lhs.const_sext();
    let rhs_const = rhs.const_sext();
    let lhs_is_load = is_load_from_alloca(func, &lhs, alloca_val.clone());
    let rhs_is_load = is_load_from_alloca(func, &rhs, alloca_val.clone());

    match bin_op {
        BinOp::Add => {
            if lhs_is_load {
                if let Some(c) = rhs_const {
                    return Some(c);
                }
            }
            if rhs_is_load {
                if let Some(c) = lhs_const {
                    return Some(c);
                }
            }
            None
        }
        BinOp::Sub => {
            // `C - ptrtoint(P)` is not a reconstruction; only the
            // load-minus-constant shape counts.
            if lhs_is_load {
                if let Some(c) = rhs_const {
                    return Some(-c);
                }
            }
            None
        }
        _ => None,
    }
}

fn ptr_to_int_operand(func: &Function, op: &Operand) -> Option<Operand> {
    match op {
        Operand::Value(v) => {
            let def = func.value_inst(*v)?;
            match &func.insts[def] {
                InstData::Cast {
                    op: CastOp::PtrToInt,
                    value,
                    ..
                } => Some(value.clone()),
                _ => None,
            }
        }
        Operand::Const(Constant::Expr(expr)) => match expr.as_ref() {
            ConstExpr::Cast {
                op: CastOp::PtrToInt,
                value,
                ..
            } => Some(value.clone()),
            _ => None,
        },
        _ => None,
    }
}

fn binary_parts(func: &Function, op: &Operand) -> Option<(BinOp, Operand, Operand)> {
    match op {
        Operand::Value(v) => {
            let def = func.value_inst(*v)?;
            match &func.insts[def] {
                InstData::Binary { op, lhs, rhs } => Some((*op, lhs.clone(), rhs.clone())),
                _ => None,
            }
        }
        Operand::Const(Constant::Expr(expr)) => match expr.as_ref() {
            ConstExpr::Binary { op, lhs, rhs } => Some((*op, lhs.clone(), rhs.clone())),
            _ => None,
        },
        _ => None,
    }
}

/// Expand the integer value feeding an `inttoptr`, collecting every
/// `(ptrtoint(P), accumulated offset)` tuple. Loads from integer slots
/// follow the stores feeding the slot; a stored `load(slot) ± C` becomes a
/// delta applied on top of each non-dependent seed value.
fn collect_ptr_to_int_matches(
    module: &Module,
    func: &Function,
    start: &Operand,
) -> Vec<PtrIntMatch> {
    struct WorkItem {
        value: Operand,
        offset: i64,
        saw_offset: bool,
    }

    let mut out = Vec::new();
    let mut visited: FxHashMap<(Operand, i64), u8> = FxHashMap::default();
    let mut record = |visited: &mut FxHashMap<(Operand, i64), u8>,
                      value: &Operand,
                      offset: i64,
                      saw: bool|
     -> bool {
        let bit = if saw { 2u8 } else { 1u8 };
        let flags = visited.entry((value.clone(), offset)).or_insert(0);
        if *flags & bit != 0 {
            return false;
        }
        *flags |= bit;
        true
    };

    let mut worklist: Vec<WorkItem> = Vec::new();
    record(&mut visited, start, 0, false);
    worklist.push(WorkItem {
        value: start.clone(),
        offset: 0,
        saw_offset: false,
    });

    while let Some(item) = worklist.pop() {
        let cur = strip_int_casts(func, &item.value);

        if let Some(ptr) = ptr_to_int_operand(func, &cur) {
            out.push(PtrIntMatch {
                ptr,
                offset: item.offset,
                saw_offset: item.saw_offset,
            });
            continue;
        }

        if let Some((op, lhs, rhs)) = binary_parts(func, &cur) {
            if op == BinOp::Add || op == BinOp::Sub {
                if let Some(c) = rhs.const_sext() {
                    let delta = if op == BinOp::Sub { -c } else { c };
                    let offset = item.offset + delta;
                    if record(&mut visited, &lhs, offset, true) {
                        worklist.push(WorkItem {
                            value: lhs,
                            offset,
                            saw_offset: true,
                        });
                    }
                    continue;
                }
                if op == BinOp::Add {
                    if let Some(c) = lhs.const_sext() {
                        let offset = item.offset + c;
                        if record(&mut visited, &rhs, offset, true) {
                            worklist.push(WorkItem {
                                value: rhs,
                                offset,
                                saw_offset: true,
                            });
                        }
                        continue;
                    }
                }
            }
        }

        let Some(v) = cur.as_value() else { continue };
        let Some(def) = func.value_inst(v) else { continue };
        match &func.insts[def] {
            InstData::Phi { incoming, .. } => {
                for (value, _) in incoming {
                    if record(&mut visited, value, item.offset, item.saw_offset) {
                        worklist.push(WorkItem {
                            value: value.clone(),
                            offset: item.offset,
                            saw_offset: item.saw_offset,
                        });
                    }
                }
            }
            InstData::Select {
                if_true, if_false, ..
            } => {
                for value in [if_true, if_false] {
                    if record(&mut visited, value, item.offset, item.saw_offset) {
                        worklist.push(WorkItem {
                            value: value.clone(),
                            offset: item.offset,
                            saw_offset: item.saw_offset,
                        });
                    }
                }
            }
            InstData::Load { ptr, .. } => {
                let Some(slot) = as_alloca_stripped(func, ptr) else {
                    continue;
                };
                let InstData::Alloca { allocated_ty, .. } = &func.insts[slot] else {
                    continue;
                };
                if !module.types.is_int(*allocated_ty) {
                    continue;
                }
                let Some(slot_val) = func.inst_result(slot) else {
                    continue;
                };
                let slot_op = Operand::Value(slot_val);

                let mut seeds: SmallVec<[Operand; 8]> = SmallVec::new();
                let mut deltas: SmallVec<[i64; 8]> = SmallVec::new();
                let mut all_stores: SmallVec<[Operand; 8]> = SmallVec::new();
                for &user in func.uses_of(slot_val) {
                    let InstData::Store { value, ptr: dst } = &func.insts[user] else {
                        continue;
                    };
                    if strip_pointer_casts(func, dst) != slot_op {
                        continue;
                    }
                    all_stores.push(value.clone());
                    if let Some(delta) = match_slot_load_add_sub(func, value, &slot_op) {
                        deltas.push(delta);
                        continue;
                    }
                    let mut dep_visited = FxHashSet::default();
                    if !value_depends_on_alloca(func, value, &slot_op, &mut dep_visited) {
                        seeds.push(value.clone());
                    }
                }

                if !seeds.is_empty() {
                    for seed in &seeds {
                        if record(&mut visited, seed, item.offset, item.saw_offset) {
                            worklist.push(WorkItem {
                                value: seed.clone(),
                                offset: item.offset,
                                saw_offset: item.saw_offset,
                            });
                        }
                        for &delta in &deltas {
                            let offset = item.offset + delta;
                            if record(&mut visited, seed, offset, true) {
                                worklist.push(WorkItem {
                                    value: seed.clone(),
                                    offset,
                                    saw_offset: true,
                                });
                            }
                        }
                    }
                } else {
                    for stored in &all_stores {
                        if record(&mut visited, stored, item.offset, item.saw_offset) {
                            worklist.push(WorkItem {
                                value: stored.clone(),
                                offset: item.offset,
                                saw_offset: item.saw_offset,
                            });
                        }
                    }
                }
            }
            _ => {}
        }
    }

    out
}

/// Accumulated constant byte offset of a GEP, walking the indexed types.
pub fn gep_constant_offset(
    module: &Module,
    source_ty: TypeId,
    indices: &[Operand],
) -> Option<i64> {
    let mut offset: i64 = 0;
    let mut cur_ty = source_ty;

    for (pos, idx) in indices.iter().enumerate() {
        let idx = idx.const_sext()?;
        if pos == 0 {
            let size = module.data_layout.alloc_size(&module.types, cur_ty) as i64;
            offset += size * idx;
            continue;
        }
        match module.types.resolved(cur_ty) {
            TypeData::Array { elem, .. } | TypeData::Vector { elem, .. } => {
                let elem = *elem;
                let size = module.data_layout.alloc_size(&module.types, elem) as i64;
                offset += size * idx;
                cur_ty = elem;
            }
            TypeData::Struct { fields, .. } => {
                let field = usize::try_from(idx).ok()?;
                let field_ty = *fields.get(field)?;
                let (offsets, _) = module
                    .data_layout
                    .struct_layout(&module.types, cur_ty)?;
                offset += *offsets.get(field)? as i64;
                cur_ty = field_ty;
            }
            _ => return None,
        }
    }
    Some(offset)
}

/// A GEP (instruction or constant expression) with a fully-constant
/// offset: `(offset, base pointer)`.
fn gep_offset_and_base(
    module: &Module,
    func: &Function,
    op: &Operand,
) -> Option<(i64, Operand)> {
    match op {
        Operand::Value(v) => {
            let def = func.value_inst(*v)?;
            match &func.insts[def] {
                InstData::GetElementPtr {
                    source_ty,
                    base,
                    indices,
                    ..
                } => {
                    let offset = gep_constant_offset(module, *source_ty, indices)?;
                    Some((offset, base.clone()))
                }
                _ => None,
            }
        }
        Operand::Const(Constant::Expr(expr)) => match expr.as_ref() {
            ConstExpr::GetElementPtr {
                source_ty,
                base,
                indices,
                ..
            } => {
                let offset = gep_constant_offset(module, *source_ty, indices)?;
                Some((offset, base.clone()))
            }
            _ => None,
        },
        _ => None,
    }
}

/// Resolve a pointer to `(allocation, member offset)` origins by walking
/// casts, constant-offset GEPs, loads of pointer slots (through their
/// stores), and phi/select fan-out.
fn collect_pointer_origins(
    module: &Module,
    func: &Function,
    start: &Operand,
) -> Vec<(Inst, i64)> {
    let mut out = Vec::new();
    let mut visited: FxHashSet<(Operand, i64)> = FxHashSet::default();
    let mut worklist: Vec<(Operand, i64)> = Vec::new();

    visited.insert((start.clone(), 0));
    worklist.push((start.clone(), 0));

    while let Some((cur, offset)) = worklist.pop() {
        if let Some(alloca) = crate::value_utils::as_alloca(func, &cur) {
            let InstData::Alloca { allocated_ty, .. } = &func.insts[alloca] else {
                continue;
            };
            if matches!(module.types.resolved(*allocated_ty), TypeData::Ptr) {
                // A pointer slot: chase the stores feeding it.
                let Some(slot_val) = func.inst_result(alloca) else {
                    continue;
                };
                for &user in func.uses_of(slot_val) {
                    let InstData::Store { value, ptr } = &func.insts[user] else {
                        continue;
                    };
                    if ptr.as_value() != Some(slot_val) {
                        continue;
                    }
                    if visited.insert((value.clone(), offset)) {
                        worklist.push((value.clone(), offset));
                    }
                }
                continue;
            }
            out.push((alloca, offset));
            continue;
        }

        if let Some((gep_offset, base)) = gep_offset_and_base(module, func, &cur) {
            let new_offset = offset + gep_offset;
            if visited.insert((base.clone(), new_offset)) {
                worklist.push((base, new_offset));
            }
            continue;
        }

        let next: SmallVec<[Operand; 4]> = match &cur {
            Operand::Value(v) => match func.value_inst(*v) {
                Some(def) => match &func.insts[def] {
                    InstData::Cast { op, value, .. } if op.preserves_pointer() => {
                        SmallVec::from_iter([value.clone()])
                    }
                    InstData::Load { ptr, .. } => SmallVec::from_iter([ptr.clone()]),
                    InstData::Phi { incoming, .. } => {
                        incoming.iter().map(|(v, _)| v.clone()).collect()
                    }
                    InstData::Select {
                        if_true, if_false, ..
                    } => SmallVec::from_iter([if_true.clone(), if_false.clone()]),
                    _ => SmallVec::new(),
                },
                None => SmallVec::new(),
            },
            Operand::Const(Constant::Expr(expr)) => match expr.as_ref() {
                ConstExpr::Cast { op, value, .. } if op.preserves_pointer() => {
                    SmallVec::from_iter([value.clone()])
                }
                _ => SmallVec::new(),
            },
            _ => SmallVec::new(),
        };
        for value in next {
            if visited.insert((value.clone(), offset)) {
                worklist.push((value, offset));
            }
        }
    }

    out
}

/// Is the pointer value ever dereferenced (load, store destination,
/// atomic, or memory-intrinsic operand) through address-preserving uses?
fn is_pointer_dereferenced(module: &Module, func: &Function, root: Inst) -> bool {
    let Some(root_val) = func.inst_result(root) else {
        return false;
    };
    let mut visited: FxHashSet<stackscan_ir::Value> = FxHashSet::default();
    let mut worklist = vec![root_val];

    while let Some(v) = worklist.pop() {
        if !visited.insert(v) {
            continue;
        }
        for &user in func.uses_of(v) {
            match &func.insts[user] {
                InstData::Load { ptr, .. } => {
                    if ptr.as_value() == Some(v) {
                        return true;
                    }
                }
                InstData::Store { value, ptr } => {
                    if ptr.as_value() == Some(v) {
                        return true;
                    }
                    if value.as_value() == Some(v) {
                        // Stored into a pointer slot: keep tracking its
                        // loads.
                        let dst = strip_pointer_casts(func, ptr);
                        if let Some(slot) = crate::value_utils::as_alloca(func, &dst) {
                            let InstData::Alloca { allocated_ty, .. } = &func.insts[slot]
                            else {
                                continue;
                            };
                            if !matches!(module.types.resolved(*allocated_ty), TypeData::Ptr) {
                                continue;
                            }
                            if let Some(slot_val) = func.inst_result(slot) {
                                for &slot_user in func.uses_of(slot_val) {
                                    if let InstData::Load { ptr, .. } = &func.insts[slot_user] {
                                        if strip_pointer_casts(func, ptr)
                                            == Operand::Value(slot_val)
                                        {
                                            if let Some(loaded) = func.inst_result(slot_user) {
                                                worklist.push(loaded);
                                            }
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
                InstData::AtomicRmw { ptr, .. } | InstData::CmpXchg { ptr, .. } => {
                    if ptr.as_value() == Some(v) {
                        return true;
                    }
                }
                InstData::Call { callee, args, .. } => {
                    if let Some(f) = callee.as_func() {
                        let name = &module.functions[f].name;
                        if name.contains("memcpy")
                            || name.contains("memmove")
                            || name.contains("memset")
                        {
                            if args.first().and_then(|a| a.value.as_value()) == Some(v) {
                                return true;
                            }
                            if (name.contains("memcpy") || name.contains("memmove"))
                                && args.get(1).and_then(|a| a.value.as_value()) == Some(v)
                            {
                                return true;
                            }
                        }
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
                        worklist.push(result);
                    }
                }
                _ => {}
            }
        }
    }
    false
}

fn alloca_total_size(module: &Module, func: &Function, alloca: Inst) -> Option<u64> {
    let InstData::Alloca {
        allocated_ty,
        count,
        ..
    } = &func.insts[alloca]
    else {
        return None;
    };
    let size = module.data_layout.alloc_size(&module.types, *allocated_ty);
    let count = count.const_zext()?;
    Some(size.saturating_mul(count))
}

fn member_string(offsets: &BTreeSet<i64>) -> String {
    if offsets.len() == 1 {
        let off = *offsets.iter().next().unwrap();
        if off != 0 {
            format!("offset +{off}")
        } else {
            "base".to_string()
        }
    } else {
        let parts: Vec<String> = offsets
            .iter()
            .map(|off| {
                if *off != 0 {
                    format!("+{off}")
                } else {
                    "base".to_string()
                }
            })
            .collect();
        format!("offsets {}", parts.join(", "))
    }
}

#[derive(Default)]
struct AggEntry {
    member_offsets: BTreeSet<i64>,
    any_out_of_bounds: bool,
    any_nonzero_result: bool,
    var_name: String,
    target_type: String,
}

fn analyze_function(
    module: &Module,
    func_id: FuncId,
    out: &mut Vec<BaseReconstructionIssue>,
) {
    let func = &module.functions[func_id];

    // Allocation ledger: name and total size per alloca.
    let mut alloca_info: FxHashMap<Inst, (String, u64)> = FxHashMap::default();
    for (_, inst) in func.insts_in_order() {
        if !matches!(func.insts[inst], InstData::Alloca { .. }) {
            continue;
        }
        let Some(size) = alloca_total_size(module, func, inst) else {
            continue;
        };
        let name = func
            .inst_result(inst)
            .and_then(|v| func.value_name(v))
            .filter(|n| !n.is_empty())
            .map(|n| n.to_string())
            .unwrap_or_else(|| "<unnamed>".to_string());
        alloca_info.insert(inst, (name, size));
    }

    for (_, inst) in func.insts_in_order() {
        match &func.insts[inst] {
            InstData::Cast {
                op: CastOp::IntToPtr,
                value,
                to_ty,
            } => {
                if !is_pointer_dereferenced(module, func, inst) {
                    continue;
                }
                let matches = collect_ptr_to_int_matches(module, func, value);
                if matches.is_empty() {
                    continue;
                }

                let mut agg: FxHashMap<(Inst, i64), AggEntry> = FxHashMap::default();
                for m in &matches {
                    if !m.saw_offset {
                        continue;
                    }
                    let origins = collect_pointer_origins(module, func, &m.ptr);
                    for (alloca, member_offset) in origins {
                        let Some((var_name, size)) = alloca_info.get(&alloca) else {
                            continue;
                        };
                        let result_offset = member_offset + m.offset;
                        let oob = result_offset < 0 || result_offset as u64 >= *size;
                        let entry = agg.entry((alloca, m.offset)).or_default();
                        entry.member_offsets.insert(member_offset);
                        entry.any_out_of_bounds |= oob;
                        if result_offset != 0 {
                            entry.any_nonzero_result = true;
                        }
                        entry.var_name = var_name.clone();
                        entry.target_type = module.types.display(*to_ty);
                    }
                }

                let mut entries: Vec<_> = agg.into_iter().collect();
                entries.sort_by_key(|((alloca, offset), _)| (*alloca, *offset));
                for ((_, offset), entry) in entries {
                    if entry.member_offsets.is_empty() {
                        continue;
                    }
                    if !entry.any_out_of_bounds && !entry.any_nonzero_result {
                        continue;
                    }
                    out.push(BaseReconstructionIssue {
                        func: func_id,
                        func_name: func.name.clone(),
                        var_name: entry.var_name.clone(),
                        source_member: member_string(&entry.member_offsets),
                        offset_used: offset,
                        target_type: entry.target_type.clone(),
                        out_of_bounds: entry.any_out_of_bounds,
                        inst,
                    });
                }
            }
            InstData::GetElementPtr {
                source_ty, indices, base, ..
            } => {
                if !is_pointer_dereferenced(module, func, inst) {
                    continue;
                }
                let Some(gep_offset) = gep_constant_offset(module, *source_ty, indices)
                else {
                    continue;
                };
                let origins = collect_pointer_origins(module, func, base);
                if origins.is_empty() {
                    continue;
                }

                let mut agg: FxHashMap<Inst, AggEntry> = FxHashMap::default();
                for (alloca, member_offset) in origins {
                    // A zero-based origin with a forward offset is ordinary
                    // member addressing, not a reconstruction.
                    if member_offset == 0 && gep_offset >= 0 {
                        continue;
                    }
                    let Some((var_name, size)) = alloca_info.get(&alloca) else {
                        continue;
                    };
                    let result_offset = member_offset + gep_offset;
                    let oob = result_offset < 0 || result_offset as u64 >= *size;
                    let entry = agg.entry(alloca).or_default();
                    entry.member_offsets.insert(member_offset);
                    entry.any_out_of_bounds |= oob;
                    if result_offset != 0 {
                        entry.any_nonzero_result = true;
                    }
                    entry.var_name = var_name.clone();
                    entry.target_type = "ptr".to_string();
                }

                let mut entries: Vec<_> = agg.into_iter().collect();
                entries.sort_by_key(|(alloca, _)| *alloca);
                for (_, entry) in entries {
                    if entry.member_offsets.is_empty() {
                        continue;
                    }
                    if !entry.any_out_of_bounds && !entry.any_nonzero_result {
                        continue;
                    }
                    out.push(BaseReconstructionIssue {
                        func: func_id,
                        func_name: func.name.clone(),
                        var_name: entry.var_name.clone(),
                        source_member: member_string(&entry.member_offsets),
                        offset_used: gep_offset,
                        target_type: entry.target_type.clone(),
                        out_of_bounds: entry.any_out_of_bounds,
                        inst,
                    });
                }
            }
            _ => {}
        }
    }
}

pub fn analyze(module: &Module, filter: &FunctionFilter) -> Vec<BaseReconstructionIssue> {
    let mut out = Vec::new();
    for func_id in module.defined_functions() {
        if !filter.should_analyze(module, func_id) {
            continue;
        }
        analyze_function(module, func_id, &mut out);
    }
    out
}
