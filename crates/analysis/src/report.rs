//! JSON and SARIF 2.1.0 report serialization.

use crate::result::AnalysisResult;
use serde_json::{json, Value as Json};

const TOOL_NAME: &str = "stackscan";

fn function_json(result: &AnalysisResult, fallback_file: Option<&str>) -> Vec<Json> {
    result
        .functions
        .iter()
        .map(|f| {
            let file = if f.file_path.is_empty() {
                fallback_file.unwrap_or("").to_string()
            } else {
                f.file_path.clone()
            };
            json!({
                "file": file,
                "name": f.name,
                "localStack": if f.local_stack_unknown { Json::Null } else { json!(f.local_stack) },
                "localStackLowerBound": if f.local_stack_unknown && f.local_stack > 0 {
                    json!(f.local_stack)
                } else {
                    Json::Null
                },
                "localStackUnknown": f.local_stack_unknown,
                "maxStack": if f.max_stack_unknown { Json::Null } else { json!(f.max_stack) },
                "maxStackLowerBound": if f.max_stack_unknown && f.max_stack > 0 {
                    json!(f.max_stack)
                } else {
                    Json::Null
                },
                "maxStackUnknown": f.max_stack_unknown,
                "hasDynamicAlloca": f.has_dynamic_alloca,
                "isRecursive": f.is_recursive,
                "hasInfiniteSelfRecursion": f.has_infinite_self_recursion,
                "exceedsLimit": f.exceeds_limit,
            })
        })
        .collect()
}

fn diagnostics_json(result: &AnalysisResult, fallback_file: Option<&str>) -> Vec<Json> {
    result
        .diagnostics
        .iter()
        .enumerate()
        .map(|(i, d)| {
            let file = if d.file_path.is_empty() {
                fallback_file.unwrap_or("").to_string()
            } else {
                d.file_path.clone()
            };
            json!({
                "id": format!("diag-{}", i + 1),
                "severity": d.severity.as_str(),
                "ruleId": d.rule_id.as_str(),
                "location": {
                    "file": file,
                    "function": d.func_name,
                    "startLine": d.line,
                    "startColumn": d.column,
                    "endLine": d.end_line,
                    "endColumn": d.end_column,
                },
                "details": {
                    "message": d.message,
                    "variableAliasing": d.alias_path,
                },
            })
        })
        .collect()
}

/// Serialize the result as the stackscan JSON report. With one input file
/// the meta block carries `inputFile`; with several, `inputFiles`.
pub fn to_json(result: &AnalysisResult, input_files: &[String]) -> String {
    let fallback = input_files.first().map(String::as_str);
    let mut meta = json!({
        "tool": TOOL_NAME,
        "mode": result.config.mode.as_str(),
        "stackLimit": result.config.stack_limit,
    });
    match input_files {
        [single] => {
            meta["inputFile"] = json!(single);
        }
        [] => {}
        many => {
            meta["inputFiles"] = json!(many);
        }
    }

    let report = json!({
        "meta": meta,
        "functions": function_json(result, fallback),
        "diagnostics": diagnostics_json(result, fallback),
    });
    serde_json::to_string_pretty(&report).unwrap_or_else(|_| "{}".to_string())
}

/// Serialize the diagnostics as a SARIF 2.1.0 run.
pub fn to_sarif(
    result: &AnalysisResult,
    input_file: &str,
    tool_name: &str,
    tool_version: &str,
) -> String {
    let results: Vec<Json> = result
        .diagnostics
        .iter()
        .map(|d| {
            let file = if d.file_path.is_empty() {
                input_file
            } else {
                d.file_path.as_str()
            };
            json!({
                "ruleId": d.rule_id.as_str(),
                "level": d.severity.sarif_level(),
                "message": { "text": d.message },
                "locations": [
                    {
                        "physicalLocation": {
                            "artifactLocation": { "uri": file },
                            "region": {
                                "startLine": d.line,
                                "startColumn": d.column,
                            },
                        },
                    }
                ],
            })
        })
        .collect();

    let sarif = json!({
        "version": "2.1.0",
        "$schema": "https://schemastore.azurewebsites.net/schemas/json/sarif-2.1.0.json",
        "runs": [
            {
                "tool": {
                    "driver": {
                        "name": tool_name,
                        "version": tool_version,
                    },
                },
                "results": results,
            }
        ],
    });
    serde_json::to_string_pretty(&sarif).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{Diagnostic, RuleId, Severity};
    use crate::result::{AnalysisConfig, FunctionResult};

    fn sample_result() -> AnalysisResult {
        AnalysisResult {
            config: AnalysisConfig::default(),
            functions: vec![
                FunctionResult {
                    name: "f".to_string(),
                    file_path: "/src/a.c".to_string(),
                    line: 3,
                    column: 1,
                    local_stack: 32,
                    max_stack: 48,
                    ..FunctionResult::default()
                },
                FunctionResult {
                    name: "vla".to_string(),
                    file_path: "/src/a.c".to_string(),
                    local_stack: 16,
                    local_stack_unknown: true,
                    max_stack: 16,
                    max_stack_unknown: true,
                    has_dynamic_alloca: true,
                    ..FunctionResult::default()
                },
            ],
            diagnostics: vec![
                Diagnostic {
                    severity: Severity::Error,
                    rule_id: RuleId::StackBufferOverflowUpper,
                    file_path: "/src/a.c".to_string(),
                    func_name: "f".to_string(),
                    line: 7,
                    column: 5,
                    end_line: 7,
                    end_column: 5,
                    message: "index may reach 19".to_string(),
                    alias_path: vec!["t".to_string()],
                },
                Diagnostic {
                    severity: Severity::Info,
                    rule_id: RuleId::MultipleStoresInfo,
                    file_path: "/src/a.c".to_string(),
                    func_name: "f".to_string(),
                    line: 6,
                    column: 3,
                    end_line: 6,
                    end_column: 3,
                    message: "2 stores".to_string(),
                    alias_path: Vec::new(),
                },
            ],
        }
    }

    #[test]
    fn json_round_trip_preserves_counts() {
        let result = sample_result();
        let text = to_json(&result, &["/src/a.c".to_string()]);
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();

        assert_eq!(parsed["meta"]["tool"], "stackscan");
        assert_eq!(parsed["meta"]["inputFile"], "/src/a.c");
        assert_eq!(parsed["meta"]["mode"], "IR");

        let functions = parsed["functions"].as_array().unwrap();
        assert_eq!(functions.len(), result.functions.len());
        // Unknown stacks serialize as null with a lower bound.
        assert!(functions[1]["localStack"].is_null());
        assert_eq!(functions[1]["localStackLowerBound"], 16);
        assert_eq!(functions[0]["localStack"], 32);
        assert!(functions[0]["localStackLowerBound"].is_null());

        let diagnostics = parsed["diagnostics"].as_array().unwrap();
        assert_eq!(diagnostics.len(), result.diagnostics.len());
        // The (function, line, ruleId) triple survives the round trip.
        let triples: Vec<(String, u64, String)> = diagnostics
            .iter()
            .map(|d| {
                (
                    d["location"]["function"].as_str().unwrap().to_string(),
                    d["location"]["startLine"].as_u64().unwrap(),
                    d["ruleId"].as_str().unwrap().to_string(),
                )
            })
            .collect();
        assert!(triples.contains(&(
            "f".to_string(),
            7,
            "StackBufferOverflow.Upper".to_string()
        )));
        assert!(triples.contains(&("f".to_string(), 6, "MultipleStoresInfo".to_string())));
        assert_eq!(
            diagnostics[0]["details"]["variableAliasing"],
            serde_json::json!(["t"])
        );
        assert_eq!(diagnostics[0]["id"], "diag-1");
    }

    #[test]
    fn multiple_inputs_use_input_files() {
        let result = sample_result();
        let files = vec!["/a.ll".to_string(), "/b.ll".to_string()];
        let text = to_json(&result, &files);
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert!(parsed["meta"].get("inputFile").is_none());
        assert_eq!(parsed["meta"]["inputFiles"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn sarif_levels() {
        let result = sample_result();
        let text = to_sarif(&result, "/src/a.c", "stackscan", "0.1.0");
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["version"], "2.1.0");
        let results = parsed["runs"][0]["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["level"], "error");
        // Info maps to the SARIF `note` level.
        assert_eq!(results[1]["level"], "note");
        assert_eq!(
            results[0]["locations"][0]["physicalLocation"]["artifactLocation"]["uri"],
            "/src/a.c"
        );
    }
}
