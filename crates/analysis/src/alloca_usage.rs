//! Usage analysis of array-typed stack allocations: size provenance,
//! user-controlled sizes, and recursion context.

use crate::filter::FunctionFilter;
use crate::int_ranges::{self, IntRanges};
use crate::value_utils::{as_alloca, const_from_value, derive_alloca_name, strip_pointer_casts};
use rustc_hash::FxHashSet;
use stackscan_ir::{FuncId, Function, Inst, InstData, Module, Operand};

#[derive(Clone, Debug)]
pub struct AllocaUsageIssue {
    pub func: FuncId,
    pub func_name: String,
    pub var_name: String,
    pub inst: Inst,
    pub size_is_const: bool,
    pub size_bytes: u64,
    pub has_upper_bound: bool,
    pub upper_bound_bytes: u64,
    pub user_controlled: bool,
    pub is_recursive: bool,
    pub is_infinite_recursive: bool,
}

/// Bounded recursive walk deciding whether a value's data-flow
/// predecessors include external input: a function argument, a load of
/// non-local memory, or a call result.
fn is_user_controlled(
    func: &Function,
    op: &Operand,
    visited: &mut FxHashSet<Operand>,
    depth: u32,
) -> bool {
    if depth > 20 {
        return false;
    }
    if !visited.insert(op.clone()) {
        return false;
    }

    match op {
        Operand::Const(_) | Operand::Global(_) | Operand::Func(_) | Operand::Metadata(_) => false,
        Operand::Value(v) => {
            if func.value_param_index(*v).is_some() {
                return true;
            }
            let Some(def) = func.value_inst(*v) else {
                return false;
            };
            match &func.insts[def] {
                InstData::Load { ptr, .. } => {
                    let base = strip_pointer_casts(func, ptr);
                    if let Some(pv) = base.as_value() {
                        if func.value_param_index(pv).is_some() {
                            return true;
                        }
                    }
                    let Some(slot) = as_alloca(func, &base) else {
                        // Non-local memory: global, heap, or unknown.
                        return true;
                    };
                    let slot_val = func.inst_result(slot);
                    for (_, inst) in func.insts_in_order() {
                        if let InstData::Store { value, ptr: dst } = &func.insts[inst] {
                            if strip_pointer_casts(func, dst).as_value() != slot_val {
                                continue;
                            }
                            if is_user_controlled(func, value, visited, depth + 1) {
                                return true;
                            }
                        }
                    }
                    false
                }
                InstData::Call { .. } | InstData::Invoke { .. } => true,
                data => {
                    let operands = data.operands();
                    operands
                        .into_iter()
                        .any(|operand| is_user_controlled(func, operand, visited, depth + 1))
                }
            }
        }
    }
}

fn is_array_allocation(count: &Operand) -> bool {
    count.const_zext() != Some(1)
}

fn upper_bound_bytes(
    func: &Function,
    ranges: &IntRanges,
    count: &Operand,
    elem_size: u64,
) -> Option<u64> {
    let range = ranges.get(count).or_else(|| {
        let v = count.as_value()?;
        let def = func.value_inst(v)?;
        match &func.insts[def] {
            InstData::Load { ptr, .. } => ranges.get(ptr),
            _ => None,
        }
    })?;
    match range.upper {
        Some(upper) if upper > 0 => Some(upper as u64 * elem_size),
        _ => None,
    }
}

fn analyze_function(
    module: &Module,
    func_id: FuncId,
    is_recursive: bool,
    is_infinite: bool,
    out: &mut Vec<AllocaUsageIssue>,
) {
    let func = &module.functions[func_id];
    let ranges = int_ranges::compute(func);

    for (_, inst) in func.insts_in_order() {
        let InstData::Alloca {
            allocated_ty,
            count,
            ..
        } = &func.insts[inst]
        else {
            continue;
        };
        // Only `alloca T, <n>` forms: fixed single-object slots are the
        // stack-buffer analyzer's business.
        if !is_array_allocation(count) {
            continue;
        }

        let elem_size = module.data_layout.alloc_size(&module.types, *allocated_ty);
        let mut visited = FxHashSet::default();

        let mut issue = AllocaUsageIssue {
            func: func_id,
            func_name: func.name.clone(),
            var_name: derive_alloca_name(module, func, inst),
            inst,
            size_is_const: false,
            size_bytes: 0,
            has_upper_bound: false,
            upper_bound_bytes: 0,
            user_controlled: is_user_controlled(func, count, &mut visited, 0),
            is_recursive,
            is_infinite_recursive: is_infinite,
        };

        if let Some(c) = count.const_zext() {
            issue.size_is_const = true;
            issue.size_bytes = c * elem_size;
        } else if let Some(c) = const_from_value(func, count) {
            issue.size_is_const = true;
            issue.size_bytes = c * elem_size;
        } else if let Some(upper) = upper_bound_bytes(func, &ranges, count, elem_size) {
            issue.has_upper_bound = true;
            issue.upper_bound_bytes = upper;
        }

        out.push(issue);
    }
}

pub fn analyze(
    module: &Module,
    recursive: &FxHashSet<FuncId>,
    infinite: &FxHashSet<FuncId>,
    filter: &FunctionFilter,
) -> Vec<AllocaUsageIssue> {
    let mut out = Vec::new();
    for func_id in module.defined_functions() {
        if !filter.should_analyze(module, func_id) {
            continue;
        }
        analyze_function(
            module,
            func_id,
            recursive.contains(&func_id),
            infinite.contains(&func_id),
            &mut out,
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::AnalysisConfig;
    use stackscan_reader::parse_module;

    fn run(text: &str) -> (Module, Vec<AllocaUsageIssue>) {
        let module = parse_module(text).unwrap();
        let config = AnalysisConfig::default();
        let filter = FunctionFilter::new(&module, &config);
        let issues = analyze(
            &module,
            &FxHashSet::default(),
            &FxHashSet::default(),
            &filter,
        );
        (module, issues)
    }

    #[test]
    fn user_controlled_from_argument() {
        let text = r#"
define void @f(i64 noundef %n) {
entry:
  %n.addr = alloca i64, align 8
  store i64 %n, ptr %n.addr, align 8
  %sz = load i64, ptr %n.addr, align 8
  %buf = alloca i8, i64 %sz, align 1
  ret void
}
"#;
        let (_, issues) = run(text);
        assert_eq!(issues.len(), 1);
        let issue = &issues[0];
        assert!(issue.user_controlled);
        assert!(!issue.size_is_const);
        assert_eq!(issue.var_name, "buf");
    }

    #[test]
    fn constant_through_slot_is_not_user_controlled() {
        let text = r#"
define void @f() {
entry:
  %n = alloca i64, align 8
  store i64 8, ptr %n, align 8
  %sz = load i64, ptr %n, align 8
  %buf = alloca i8, i64 %sz, align 1
  ret void
}
"#;
        let (_, issues) = run(text);
        assert_eq!(issues.len(), 1);
        let issue = &issues[0];
        assert!(!issue.user_controlled);
        assert!(issue.size_is_const);
        assert_eq!(issue.size_bytes, 8);
    }

    #[test]
    fn range_gives_upper_bound() {
        let text = r#"
define void @f() {
entry:
  %n = alloca i64, align 8
  %sz = load i64, ptr %n, align 8
  %cmp = icmp slt i64 %sz, 32
  %buf = alloca i8, i64 %sz, align 1
  ret void
}
"#;
        let (_, issues) = run(text);
        assert_eq!(issues.len(), 1);
        let issue = &issues[0];
        assert!(!issue.size_is_const);
        assert!(issue.has_upper_bound);
        assert_eq!(issue.upper_bound_bytes, 31);
    }

    #[test]
    fn call_result_is_user_controlled() {
        let text = r#"
declare i64 @outside()

define void @f() {
entry:
  %sz = call i64 @outside()
  %buf = alloca i8, i64 %sz, align 1
  ret void
}
"#;
        let (_, issues) = run(text);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].user_controlled);
    }
}
