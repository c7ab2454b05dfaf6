//! Integer range facts inferred from comparison instructions.
//!
//! These are hints, not path-sensitive facts: a bound recorded here holds at
//! the comparison site, and consumers treat it as the value's plausible
//! range anywhere in the function.

use rustc_hash::FxHashMap;
use stackscan_ir::{Function, InstData, IntPredicate, Operand};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IntRange {
    pub lower: Option<i64>,
    pub upper: Option<i64>,
}

/// Range facts keyed by the compared value and, for loads, by the loaded
/// slot's pointer.
pub struct IntRanges {
    map: FxHashMap<Operand, IntRange>,
}

impl IntRanges {
    pub fn get(&self, key: &Operand) -> Option<&IntRange> {
        self.map.get(key)
    }

    fn apply(&mut self, key: Operand, lower: Option<i64>, upper: Option<i64>) {
        let entry = self.map.entry(key).or_default();
        if let Some(lb) = lower {
            entry.lower = Some(match entry.lower {
                Some(cur) => cur.max(lb),
                None => lb,
            });
        }
        if let Some(ub) = upper {
            entry.upper = Some(match entry.upper {
                Some(cur) => cur.min(ub),
                None => ub,
            });
        }
    }
}

/// Bounds implied on the value operand of `value pred constant`.
/// `value_is_lhs` is false when the constant is the first operand.
fn bounds_for(
    pred: IntPredicate,
    c: i64,
    value_is_lhs: bool,
) -> (Option<i64>, Option<i64>) {
    use IntPredicate::*;
    let pred = if value_is_lhs { pred } else { pred.swapped() };
    match pred {
        Slt | Ult => (None, Some(c.saturating_sub(1))),
        Sle | Ule => (None, Some(c)),
        Sgt | Ugt => (Some(c.saturating_add(1)), None),
        Sge | Uge => (Some(c), None),
        Eq => (Some(c), Some(c)),
        // Deliberately over-approximated: `v != c` records only `v <= c`.
        Ne => (None, Some(c)),
    }
}

/// Scan every integer compare in `func` and collect interval facts.
pub fn compute(func: &Function) -> IntRanges {
    let mut ranges = IntRanges {
        map: FxHashMap::default(),
    };

    for (_, inst) in func.insts_in_order() {
        let InstData::ICmp { pred, lhs, rhs } = &func.insts[inst] else {
            continue;
        };

        let (value, constant, value_is_lhs) = match (lhs.const_sext(), rhs.const_sext()) {
            (None, Some(c)) => (lhs, c, true),
            (Some(c), None) => (rhs, c, false),
            _ => continue,
        };

        let (lower, upper) = bounds_for(*pred, constant, value_is_lhs);
        if lower.is_none() && upper.is_none() {
            continue;
        }

        ranges.apply(value.clone(), lower, upper);

        // A load's fact also sticks to the slot it was loaded from.
        if let Some(v) = value.as_value() {
            if let Some(def) = func.value_inst(v) {
                if let InstData::Load { ptr, .. } = &func.insts[def] {
                    ranges.apply(ptr.clone(), lower, upper);
                }
            }
        }
    }

    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackscan_reader::parse_module;

    #[test]
    fn bounds_tables() {
        use IntPredicate::*;
        assert_eq!(bounds_for(Slt, 20, true), (None, Some(19)));
        assert_eq!(bounds_for(Sle, 20, true), (None, Some(20)));
        assert_eq!(bounds_for(Sgt, 3, true), (Some(4), None));
        assert_eq!(bounds_for(Sge, 3, true), (Some(3), None));
        assert_eq!(bounds_for(Eq, 7, true), (Some(7), Some(7)));
        assert_eq!(bounds_for(Ne, 7, true), (None, Some(7)));
        // `20 > v` means `v < 20`.
        assert_eq!(bounds_for(Sgt, 20, false), (None, Some(19)));
        assert_eq!(bounds_for(Ult, 5, false), (Some(6), None));
    }

    #[test]
    fn load_fact_attaches_to_slot() {
        let text = r#"
define void @f() {
entry:
  %i = alloca i32, align 4
  %v = load i32, ptr %i, align 4
  %cmp = icmp slt i32 %v, 20
  ret void
}
"#;
        let module = parse_module(text).unwrap();
        let f = module.func_by_name("f").unwrap();
        let func = &module.functions[f];
        let ranges = compute(func);

        let entry = func.entry_block().unwrap();
        let slot = func.inst_result(func.blocks[entry].insts[0]).unwrap();
        let loaded = func.inst_result(func.blocks[entry].insts[1]).unwrap();

        let slot_range = ranges.get(&Operand::Value(slot)).expect("slot fact");
        assert_eq!(slot_range.upper, Some(19));
        assert_eq!(slot_range.lower, None);
        let val_range = ranges.get(&Operand::Value(loaded)).expect("value fact");
        assert_eq!(val_range.upper, Some(19));
    }

    #[test]
    fn merged_bounds_tighten() {
        let text = r#"
define void @f(i32 noundef %n) {
entry:
  %c1 = icmp slt i32 %n, 100
  %c2 = icmp slt i32 %n, 20
  %c3 = icmp sgt i32 %n, 0
  ret void
}
"#;
        let module = parse_module(text).unwrap();
        let f = module.func_by_name("f").unwrap();
        let func = &module.functions[f];
        let ranges = compute(func);
        let n = func.params[0].value;
        let r = ranges.get(&Operand::Value(n)).expect("fact for %n");
        assert_eq!(r.upper, Some(19));
        assert_eq!(r.lower, Some(1));
    }
}
