//! Report of allocations whose element count is genuinely dynamic (true
//! VLAs), as opposed to counts that fold to a constant through a local
//! slot.

use crate::filter::FunctionFilter;
use crate::value_utils::{const_from_value, derive_alloca_name};
use stackscan_ir::{FuncId, Inst, InstData, Module};

#[derive(Clone, Debug)]
pub struct DynamicAllocaIssue {
    pub func: FuncId,
    pub func_name: String,
    pub var_name: String,
    pub type_name: String,
    pub inst: Inst,
}

pub fn analyze(module: &Module, filter: &FunctionFilter) -> Vec<DynamicAllocaIssue> {
    let mut out = Vec::new();

    for func_id in module.defined_functions() {
        if !filter.should_analyze(module, func_id) {
            continue;
        }
        let func = &module.functions[func_id];
        for (_, inst) in func.insts_in_order() {
            let InstData::Alloca {
                allocated_ty,
                count,
                ..
            } = &func.insts[inst]
            else {
                continue;
            };
            // A count that is an immediate constant, or foldable to one
            // through a single local slot, is not a VLA.
            if count.const_zext().is_some() {
                continue;
            }
            if const_from_value(func, count).is_some() {
                continue;
            }
            out.push(DynamicAllocaIssue {
                func: func_id,
                func_name: func.name.clone(),
                var_name: derive_alloca_name(module, func, inst),
                type_name: module.types.display(*allocated_ty),
                inst,
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

    #[test]
    fn folded_counts_are_not_vlas() {
        let text = r#"
define void @f(i64 noundef %n) {
entry:
  %fixed = alloca [4 x i32], align 16
  %cst = alloca i32, align 4
  store i32 6, ptr %cst, align 4
  %c = load i32, ptr %cst, align 4
  %conv = sext i32 %c to i64
  %folded = alloca i8, i64 %conv, align 1
  %vla = alloca i8, i64 %n, align 1
  ret void
}
"#;
        let module = parse_module(text).unwrap();
        let config = AnalysisConfig::default();
        let filter = FunctionFilter::new(&module, &config);
        let issues = analyze(&module, &filter);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].var_name, "vla");
        assert_eq!(issues[0].type_name, "i8");
    }
}
