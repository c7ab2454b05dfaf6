//! The stackscan analysis engine: foundation passes, defect detectors, and
//! the aggregator that turns their findings into one report.

pub mod alloca_usage;
pub mod base_reconstruction;
pub mod callgraph;
pub mod compile_commands;
pub mod const_param;
pub mod demangle;
pub mod diagnostics;
pub mod duplicate_condition;
pub mod dynamic_alloca;
pub mod escape;
pub mod filter;
pub mod int_ranges;
pub mod mem_intrinsics;
pub mod passes;
pub mod pipeline;
pub mod report;
pub mod result;
pub mod size_minus_k;
pub mod stack;
pub mod stack_buffer;
pub mod value_queries;
pub mod value_utils;

pub use crate::diagnostics::{Diagnostic, RuleId, Severity};
pub use crate::pipeline::AnalysisError;
pub use crate::result::{AnalysisConfig, AnalysisMode, AnalysisResult, FunctionResult};

use crate::callgraph::CallGraph;
use crate::compile_commands::CompilationDatabase;
use crate::filter::FunctionFilter;
use rustc_hash::{FxHashMap, FxHashSet};
use stackscan_ir::{FuncId, Function, Inst, Module};

/// Source location of a function: the first instruction with a non-zero
/// debug line, else the subprogram's declared line.
fn function_source_location(module: &Module, func: &Function) -> (u32, u32) {
    for (_, inst) in func.insts_in_order() {
        let Some(loc) = func.debug_loc(inst) else {
            continue;
        };
        if let Some((line, column)) = module.metadata.location(loc) {
            if line != 0 {
                return (line, column.max(1));
            }
        }
    }
    if let Some(sp) = func.subprogram {
        let line = module.metadata.subprogram_line(sp);
        if line != 0 {
            return (line, 1);
        }
    }
    (0, 0)
}

fn function_source_path(module: &Module, func: &Function) -> String {
    func.subprogram
        .and_then(|sp| module.metadata.scope_path(sp))
        .unwrap_or_else(|| module.source_filename.clone())
}

/// Location of an instruction, falling back to the function's location.
fn inst_source_location(module: &Module, func: &Function, inst: Inst) -> (String, u32, u32) {
    if let Some(loc) = func.debug_loc(inst) {
        if let Some((line, column)) = module.metadata.location(loc) {
            if line != 0 {
                let path = module
                    .metadata
                    .scope_path(loc)
                    .unwrap_or_else(|| function_source_path(module, func));
                return (path, line, column.max(1));
            }
        }
    }
    let (line, column) = function_source_location(module, func);
    (function_source_path(module, func), line, column.max(1))
}

fn pretty_name(name: &str) -> String {
    if demangle::is_mangled(name) {
        demangle::demangle(name)
    } else {
        name.to_string()
    }
}

struct DiagnosticBuilder<'m> {
    module: &'m Module,
    diagnostics: Vec<Diagnostic>,
}

impl<'m> DiagnosticBuilder<'m> {
    fn push_at(
        &mut self,
        func_id: FuncId,
        inst: Option<Inst>,
        severity: Severity,
        rule_id: RuleId,
        message: String,
        alias_path: Vec<String>,
    ) {
        let func = &self.module.functions[func_id];
        let (file_path, line, column) = match inst {
            Some(inst) => inst_source_location(self.module, func, inst),
            None => {
                let (line, column) = function_source_location(self.module, func);
                (
                    function_source_path(self.module, func),
                    line,
                    column.max(1),
                )
            }
        };
        self.diagnostics.push(Diagnostic {
            severity,
            rule_id,
            file_path,
            func_name: func.name.clone(),
            line,
            column,
            end_line: line,
            end_column: column,
            message,
            alias_path,
        });
    }
}

/// Analyze one loaded module. The `function-attrs` inference pre-pass runs
/// first and is the only module mutation.
pub fn analyze_module(module: &mut Module, config: &AnalysisConfig) -> AnalysisResult {
    passes::infer_function_attrs(module);
    let module = &*module;

    let filter = FunctionFilter::new(module, config);

    // Foundation: local frames, call graph, transitive usage, recursion.
    let locals: FxHashMap<FuncId, stack::LocalStackInfo> = module
        .defined_functions()
        .map(|f| (f, stack::compute_local_stack(module, f, config.mode)))
        .collect();
    let cg = CallGraph::build(module);
    let usage = stack::compute_global_stack(&cg, &locals);
    let infinite: FxHashSet<FuncId> = module
        .defined_functions()
        .filter(|&f| stack::has_infinite_self_recursion(module, f))
        .collect();
    let threshold = stack::alloca_large_threshold(config);

    let mut functions = Vec::new();
    let mut builder = DiagnosticBuilder {
        module,
        diagnostics: Vec::new(),
    };

    for func_id in module.defined_functions() {
        if !filter.should_analyze(module, func_id) {
            continue;
        }
        let func = &module.functions[func_id];
        let local = &locals[&func_id];
        let total = usage.totals.get(&func_id).copied().unwrap_or_default();
        let is_recursive = usage.recursive.contains(&func_id);
        let is_infinite = is_recursive && infinite.contains(&func_id);
        let (line, column) = function_source_location(module, func);
        let exceeds = total.bytes > config.stack_limit;

        functions.push(FunctionResult {
            name: func.name.clone(),
            file_path: function_source_path(module, func),
            line,
            column,
            local_stack: local.bytes,
            local_stack_unknown: local.unknown,
            max_stack: total.bytes,
            max_stack_unknown: total.unknown,
            has_dynamic_alloca: local.has_dynamic_alloca,
            is_recursive,
            has_infinite_self_recursion: is_infinite,
            exceeds_limit: exceeds,
        });

        if exceeds {
            let path = stack::build_max_stack_call_path(module, &cg, &usage, func_id);
            builder.push_at(
                func_id,
                None,
                Severity::Error,
                RuleId::StackOverflow,
                format!(
                    "potential stack overflow in '{}': worst-case stack usage of {} bytes \
                     exceeds the limit of {} bytes (call path: {})",
                    pretty_name(&func.name),
                    total.bytes,
                    config.stack_limit,
                    path
                ),
                Vec::new(),
            );
        }
        if is_recursive {
            builder.push_at(
                func_id,
                None,
                Severity::Warning,
                RuleId::RecursiveFunction,
                format!(
                    "function '{}' lies on a call-graph cycle; its worst-case stack usage \
                     is only a lower bound",
                    pretty_name(&func.name)
                ),
                Vec::new(),
            );
        }
        if is_infinite {
            builder.push_at(
                func_id,
                None,
                Severity::Error,
                RuleId::InfiniteRecursion,
                format!(
                    "every return in '{}' is reached only after a recursive call to itself; \
                     stack growth is unbounded",
                    pretty_name(&func.name)
                ),
                Vec::new(),
            );
        }
    }

    // Detectors. Each is independent; imprecision means silence.
    for issue in alloca_usage::analyze(module, &usage.recursive, &infinite, &filter) {
        let size_note = if issue.size_is_const {
            format!("{} bytes", issue.size_bytes)
        } else if issue.has_upper_bound {
            format!("at most {} bytes (from comparisons)", issue.upper_bound_bytes)
        } else {
            "unbounded".to_string()
        };
        if issue.size_is_const && issue.size_bytes > threshold {
            builder.push_at(
                issue.func,
                Some(issue.inst),
                Severity::Warning,
                RuleId::AllocaOversizedConstant,
                format!(
                    "stack allocation '{}' in '{}' is {} bytes, above the large-allocation \
                     threshold of {} bytes",
                    issue.var_name,
                    pretty_name(&issue.func_name),
                    issue.size_bytes,
                    threshold
                ),
                vec![issue.var_name.clone()],
            );
        }
        if issue.user_controlled {
            builder.push_at(
                issue.func,
                Some(issue.inst),
                Severity::Warning,
                RuleId::AllocaUserControlled,
                format!(
                    "size of stack allocation '{}' in '{}' is controlled by external input \
                     ({})",
                    issue.var_name,
                    pretty_name(&issue.func_name),
                    size_note
                ),
                vec![issue.var_name.clone()],
            );
            if issue.is_infinite_recursive {
                builder.push_at(
                    issue.func,
                    Some(issue.inst),
                    Severity::Error,
                    RuleId::AllocaInfiniteRecursive,
                    format!(
                        "externally-sized stack allocation '{}' sits in '{}', whose every \
                         path recurses; stack growth is unbounded",
                        issue.var_name,
                        pretty_name(&issue.func_name)
                    ),
                    vec![issue.var_name.clone()],
                );
            } else if issue.is_recursive {
                builder.push_at(
                    issue.func,
                    Some(issue.inst),
                    Severity::Error,
                    RuleId::AllocaRecursiveControlled,
                    format!(
                        "externally-sized stack allocation '{}' sits in recursive function \
                         '{}'",
                        issue.var_name,
                        pretty_name(&issue.func_name)
                    ),
                    vec![issue.var_name.clone()],
                );
            }
        }
    }

    for issue in dynamic_alloca::analyze(module, &filter) {
        builder.push_at(
            issue.func,
            Some(issue.inst),
            Severity::Warning,
            RuleId::DynamicAlloca,
            format!(
                "variable-length stack allocation '{}' of element type {} in '{}'",
                issue.var_name,
                issue.type_name,
                pretty_name(&issue.func_name)
            ),
            vec![issue.var_name.clone()],
        );
    }

    for issue in stack_buffer::analyze(module, &filter) {
        let access = if issue.is_write { "write" } else { "read" };
        if issue.index_is_constant {
            builder.push_at(
                issue.func,
                Some(issue.inst),
                Severity::Error,
                RuleId::StackBufferOverflowConstant,
                format!(
                    "{access} at constant index {} is outside stack buffer '{}' of {} \
                     elements",
                    issue.index_or_upper_bound, issue.var_name, issue.array_size
                ),
                issue.alias_path.clone(),
            );
        } else if issue.is_lower_bound_violation {
            builder.push_at(
                issue.func,
                Some(issue.inst),
                Severity::Warning,
                RuleId::StackBufferOverflowLower,
                format!(
                    "{access} index into stack buffer '{}' may be negative (lower bound \
                     {})",
                    issue.var_name, issue.lower_bound
                ),
                issue.alias_path.clone(),
            );
        } else {
            builder.push_at(
                issue.func,
                Some(issue.inst),
                Severity::Error,
                RuleId::StackBufferOverflowUpper,
                format!(
                    "{access} index into stack buffer '{}' may reach {} but the buffer has \
                     {} elements",
                    issue.var_name, issue.index_or_upper_bound, issue.array_size
                ),
                issue.alias_path.clone(),
            );
        }
    }

    for issue in stack_buffer::analyze_multiple_stores(module, &filter) {
        builder.push_at(
            issue.func,
            Some(issue.alloca),
            Severity::Info,
            RuleId::MultipleStoresInfo,
            format!(
                "{} stores through {} distinct index expressions write into stack buffer \
                 '{}'",
                issue.store_count, issue.distinct_index_count, issue.var_name
            ),
            vec![issue.var_name.clone()],
        );
    }

    for issue in base_reconstruction::analyze(module, &filter) {
        let (severity, rule_id, verdict) = if issue.out_of_bounds {
            (
                Severity::Error,
                RuleId::InvalidBaseReconstructionError,
                "resulting pointer is out of bounds",
            )
        } else {
            (
                Severity::Warning,
                RuleId::InvalidBaseReconstructionWarning,
                "resulting pointer cannot be verified",
            )
        };
        builder.push_at(
            issue.func,
            Some(issue.inst),
            severity,
            rule_id,
            format!(
                "base reconstruction from '{}' ({}, offset applied: {}) as {}: {}",
                issue.var_name, issue.source_member, issue.offset_used, issue.target_type,
                verdict
            ),
            vec![issue.var_name.clone()],
        );
    }

    for issue in mem_intrinsics::analyze(module, &filter) {
        builder.push_at(
            issue.func,
            Some(issue.inst),
            Severity::Error,
            RuleId::MemIntrinsicOverflow,
            format!(
                "{} writes {} bytes into stack buffer '{}' of {} bytes",
                issue.intrinsic_name, issue.length_bytes, issue.var_name, issue.dest_size_bytes
            ),
            vec![issue.var_name.clone()],
        );
    }

    for issue in size_minus_k::analyze(module, &filter) {
        builder.push_at(
            issue.func,
            Some(issue.inst),
            Severity::Warning,
            RuleId::SizeMinusKWrite,
            format!(
                "write length of the form size - k at '{}' (k = {}, ptrNonNull = {}, \
                 sizeAboveK = {})",
                issue.sink_name, issue.k, issue.ptr_non_null, issue.size_above_k
            ),
            Vec::new(),
        );
    }

    for issue in escape::analyze(module, &filter, config.escape_call_args) {
        let (severity, rule_id, message) = match issue.kind {
            escape::EscapeKind::Return => (
                Severity::Error,
                RuleId::StackPointerEscapeReturn,
                format!("address of stack variable '{}' is returned", issue.var_name),
            ),
            escape::EscapeKind::StoreGlobal => (
                Severity::Warning,
                RuleId::StackPointerEscapeStoreGlobal,
                format!(
                    "address of stack variable '{}' is stored into global '{}'",
                    issue.var_name, issue.target_name
                ),
            ),
            escape::EscapeKind::StoreUnknown => (
                Severity::Warning,
                RuleId::StackPointerEscapeStoreUnknown,
                format!(
                    "address of stack variable '{}' is stored through an unknown pointer",
                    issue.var_name
                ),
            ),
            escape::EscapeKind::CallArg => (
                Severity::Warning,
                RuleId::StackPointerEscapeCallArg,
                format!(
                    "address of stack variable '{}' is passed to '{}', which may capture it",
                    issue.var_name,
                    pretty_name(&issue.target_name)
                ),
            ),
            escape::EscapeKind::CallCallback => (
                Severity::Warning,
                RuleId::StackPointerEscapeCallCallback,
                format!(
                    "address of stack variable '{}' is passed to an indirect call",
                    issue.var_name
                ),
            ),
        };
        builder.push_at(
            issue.func,
            Some(issue.inst),
            severity,
            rule_id,
            message,
            vec![issue.var_name.clone()],
        );
    }

    for issue in const_param::analyze(module, &filter) {
        let rule_id = if issue.is_reference {
            if issue.is_rvalue_ref {
                if issue.pointee_is_basic {
                    RuleId::ConstParameterNotModifiedReferenceRvaluePreferValue
                } else {
                    RuleId::ConstParameterNotModifiedReferenceRvalue
                }
            } else {
                RuleId::ConstParameterNotModifiedReference
            }
        } else if issue.pointer_const_only {
            RuleId::ConstParameterNotModifiedPointerConstOnly
        } else {
            RuleId::ConstParameterNotModifiedPointer
        };
        let mut message = format!(
            "parameter '{}' of '{}' is never written through; consider '{}'",
            issue.param_name,
            pretty_name(&issue.func_name),
            issue.suggested_type
        );
        if let Some(alt) = &issue.suggested_type_alt {
            message.push_str(&format!(" or '{alt}'"));
        }
        builder.push_at(issue.func, None, Severity::Info, rule_id, message, Vec::new());
        // The parameter's declaration line from debug info is more precise
        // than the function fallback.
        if issue.line != 0 {
            if let Some(d) = builder.diagnostics.last_mut() {
                d.line = issue.line;
                d.end_line = issue.line;
            }
        }
    }

    for issue in duplicate_condition::analyze(module, &filter) {
        builder.push_at(
            issue.func,
            Some(issue.inst),
            Severity::Warning,
            RuleId::DuplicateIfCondition,
            format!(
                "condition of this 'else if' in '{}' repeats the condition of a dominating \
                 'if'; the branch cannot be taken",
                pretty_name(&issue.func_name)
            ),
            Vec::new(),
        );
    }

    let mut diagnostics = builder.diagnostics;
    diagnostics.sort_by(|a, b| {
        a.func_name
            .cmp(&b.func_name)
            .then(a.line.cmp(&b.line))
            .then(a.rule_id.as_str().cmp(b.rule_id.as_str()))
            .then(a.message.cmp(&b.message))
    });

    AnalysisResult {
        config: config.clone(),
        functions,
        diagnostics,
    }
}

/// Load one input (IR or source) and analyze it.
pub fn analyze_file(
    path: &str,
    config: &AnalysisConfig,
    compdb: Option<&CompilationDatabase>,
) -> Result<AnalysisResult, AnalysisError> {
    let mut module = pipeline::load_module_for_analysis(path, config, compdb)?;
    Ok(analyze_module(&mut module, config))
}
