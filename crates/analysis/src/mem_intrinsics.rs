//! Fixed-buffer overflows by `memcpy`/`memset`/`memmove` with a constant
//! length larger than the destination allocation.

use crate::filter::FunctionFilter;
use crate::value_utils::strip_pointer_casts;
use stackscan_ir::{FuncId, Function, Inst, InstData, Module};

#[derive(Clone, Debug)]
pub struct MemIntrinsicIssue {
    pub func: FuncId,
    pub func_name: String,
    pub var_name: String,
    pub intrinsic_name: &'static str,
    pub dest_size_bytes: u64,
    pub length_bytes: u64,
    pub inst: Inst,
}

fn intrinsic_kind(name: &str) -> Option<&'static str> {
    if name.contains("memcpy") {
        Some("memcpy")
    } else if name.contains("memset") {
        Some("memset")
    } else if name.contains("memmove") {
        Some("memmove")
    } else {
        None
    }
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

pub fn analyze(module: &Module, filter: &FunctionFilter) -> Vec<MemIntrinsicIssue> {
    let mut out = Vec::new();

    for func_id in module.defined_functions() {
        if !filter.should_analyze(module, func_id) {
            continue;
        }
        let func = &module.functions[func_id];

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
            let Some(kind) = intrinsic_kind(&module.functions[callee_fn].name) else {
                continue;
            };
            if args.len() < 3 {
                continue;
            }

            // Destination must strip to a local allocation of known size.
            let mut dest = strip_pointer_casts(func, &args[0].value);
            if let Some(v) = dest.as_value() {
                if let Some(def) = func.value_inst(v) {
                    if let InstData::GetElementPtr { base, .. } = &func.insts[def] {
                        dest = base.clone();
                    }
                }
            }
            let Some(alloca) = crate::value_utils::as_alloca(func, &dest) else {
                continue;
            };
            let Some(dest_bytes) = alloca_total_size(module, func, alloca) else {
                continue;
            };

            let Some(len) = args[2].value.const_zext() else {
                continue;
            };
            if len <= dest_bytes {
                continue;
            }

            let var_name = func
                .inst_result(alloca)
                .and_then(|v| func.value_name(v))
                .filter(|n| !n.is_empty())
                .map(|n| n.to_string())
                .unwrap_or_else(|| "<unnamed>".to_string());

            out.push(MemIntrinsicIssue {
                func: func_id,
                func_name: func.name.clone(),
                var_name,
                intrinsic_name: kind,
                dest_size_bytes: dest_bytes,
                length_bytes: len,
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

    const DL: &str = "target datalayout = \"e-m:e-i64:64-i128:128-f80:128-n8:16:32:64-S128\"\n";

    #[test]
    fn oversized_memcpy_flagged() {
        let text = format!(
            "{DL}
declare void @llvm.memcpy.p0.p0.i64(ptr noalias writeonly, ptr noalias readonly, i64, i1 immarg)

define void @f(ptr noundef %src) {{
entry:
  %buf = alloca [16 x i8], align 1
  call void @llvm.memcpy.p0.p0.i64(ptr align 1 %buf, ptr align 1 %src, i64 32, i1 false)
  ret void
}}

define void @ok(ptr noundef %src) {{
entry:
  %buf = alloca [16 x i8], align 1
  call void @llvm.memcpy.p0.p0.i64(ptr align 1 %buf, ptr align 1 %src, i64 16, i1 false)
  ret void
}}
"
        );
        let module = parse_module(&text).unwrap();
        let config = AnalysisConfig::default();
        let filter = FunctionFilter::new(&module, &config);
        let issues = analyze(&module, &filter);
        assert_eq!(issues.len(), 1);
        let issue = &issues[0];
        assert_eq!(issue.func_name, "f");
        assert_eq!(issue.intrinsic_name, "memcpy");
        assert_eq!(issue.dest_size_bytes, 16);
        assert_eq!(issue.length_bytes, 32);
        assert_eq!(issue.var_name, "buf");
    }

    #[test]
    fn memset_through_gep() {
        let text = format!(
            "{DL}
declare void @llvm.memset.p0.i64(ptr writeonly, i8, i64, i1 immarg)

define void @f() {{
entry:
  %buf = alloca [8 x i8], align 1
  %p = getelementptr inbounds [8 x i8], ptr %buf, i64 0, i64 0
  call void @llvm.memset.p0.i64(ptr align 1 %p, i8 0, i64 9, i1 false)
  ret void
}}
"
        );
        let module = parse_module(&text).unwrap();
        let config = AnalysisConfig::default();
        let filter = FunctionFilter::new(&module, &config);
        let issues = analyze(&module, &filter);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].intrinsic_name, "memset");
        assert_eq!(issues[0].dest_size_bytes, 8);
    }
}
