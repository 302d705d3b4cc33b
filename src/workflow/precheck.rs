//! executePython 的静态预检
//!
//! 规则：code 非空；数据集引用非空且只含 `[A-Za-z0-9._-]`；禁止直接访问 `/datasets` 路径；
//! 代码中使用 `{dataset_id}` 占位时必须先赋值 `dataset_id = ...`。

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Map, Value};

use crate::workflow::collaborators::{PrecheckResult, StaticPrecheck};

pub const STATIC_PRECHECK_FAILED: &str = "STATIC_PRECHECK_FAILED";

static DATASET_ID_RE: OnceLock<Regex> = OnceLock::new();
static PLACEHOLDER_IN_CODE_RE: OnceLock<Regex> = OnceLock::new();
static DATASET_ID_DEFINED_RE: OnceLock<Regex> = OnceLock::new();
static FORBIDDEN_DATASETS_PATH_RE: OnceLock<Regex> = OnceLock::new();

fn dataset_id_re() -> &'static Regex {
    DATASET_ID_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9._-]+$").unwrap())
}

/// 代码中的 `{dataset_id}` 占位
fn placeholder_in_code_re() -> &'static Regex {
    PLACEHOLDER_IN_CODE_RE.get_or_init(|| Regex::new(r"\{\s*dataset_id\s*\}").unwrap())
}

fn dataset_id_defined_re() -> &'static Regex {
    DATASET_ID_DEFINED_RE.get_or_init(|| Regex::new(r"\bdataset_id\s*=").unwrap())
}

fn forbidden_datasets_path_re() -> &'static Regex {
    FORBIDDEN_DATASETS_PATH_RE
        .get_or_init(|| Regex::new(r"(?i)(^|[^A-Za-z0-9_])/datasets(/|\b)").unwrap())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PythonStaticPrecheck;

impl PythonStaticPrecheck {
    pub fn new() -> Self {
        Self
    }
}

impl StaticPrecheck for PythonStaticPrecheck {
    fn check(&self, code: &str, dataset_refs: &str, params: &Map<String, Value>) -> PrecheckResult {
        let dataset_ref = first_dataset_ref(dataset_refs);
        let mut issues: Vec<String> = Vec::new();

        if code.trim().is_empty() {
            issues.push("code 不能为空".to_string());
        }
        if dataset_ref.is_empty() {
            issues.push("dataset_id 不能为空".to_string());
        } else if !dataset_id_re().is_match(&dataset_ref) {
            issues.push("dataset_id 格式非法，仅允许字母数字._-".to_string());
        }

        if !code.trim().is_empty() {
            if forbidden_datasets_path_re().is_match(code) {
                issues.push(
                    "禁止在代码中使用 /datasets 路径，请改用 /sandbox/input/<dataset_id>/... 或 /tmp 输出"
                        .to_string(),
                );
            }
            if placeholder_in_code_re().is_match(code) && !dataset_id_defined_re().is_match(code) {
                issues.push("代码引用了 dataset_id 变量但未定义，请先赋值后再使用".to_string());
            }
        }

        let report = json!({
            "code_length": code.chars().count(),
            "dataset_id": dataset_ref,
            "run_args": params,
            "issues": issues,
        });
        if issues.is_empty() {
            PrecheckResult::pass(report)
        } else {
            PrecheckResult::fail(STATIC_PRECHECK_FAILED, issues.join("; "), report)
        }
    }
}

/// 数据集引用可能是单个 id、逗号分隔列表或 JSON 数组文本，取第一个
fn first_dataset_ref(raw: &str) -> String {
    let raw = raw.trim();
    if raw.starts_with('[') {
        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(raw) {
            return items
                .iter()
                .filter_map(|v| v.as_str().map(str::trim).map(str::to_string))
                .find(|s| !s.is_empty())
                .unwrap_or_default();
        }
    }
    raw.split(',')
        .map(str::trim)
        .find(|s| !s.is_empty())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(code: &str, refs: &str) -> PrecheckResult {
        PythonStaticPrecheck::new().check(code, refs, &Map::new())
    }

    #[test]
    fn test_passes_valid_code() {
        let r = check("import pandas as pd\nprint(1)", "600000_SH_20240101");
        assert!(r.passed);
        assert!(r.category.is_none());
        assert_eq!(r.report["issues"], json!([]));
    }

    #[test]
    fn test_missing_code_and_dataset() {
        let r = check("  ", "");
        assert!(!r.passed);
        assert_eq!(r.error_code, STATIC_PRECHECK_FAILED);
        assert!(r.message.contains("code 不能为空"));
        assert!(r.message.contains("dataset_id 不能为空"));
    }

    #[test]
    fn test_invalid_dataset_id() {
        let r = check("print(1)", "../etc/passwd");
        assert!(!r.passed);
        assert!(r.message.contains("格式非法"));
    }

    #[test]
    fn test_forbidden_datasets_path() {
        let r = check("open('/datasets/x.csv')", "ds1");
        assert!(!r.passed);
        let ok = check("open('/sandbox/input/ds1/x.csv')", "ds1");
        assert!(ok.passed);
    }

    #[test]
    fn test_undefined_placeholder() {
        let bad = check("path = f'/sandbox/input/{dataset_id}/a.csv'", "ds1");
        assert!(!bad.passed);
        let good = check("dataset_id = 'ds1'\npath = f'/sandbox/input/{dataset_id}/a.csv'", "ds1");
        assert!(good.passed);
    }

    #[test]
    fn test_rule_patterns_compile() {
        assert!(dataset_id_re().is_match("600000_SH.v2-a"));
        assert!(placeholder_in_code_re().is_match("{ dataset_id }"));
        assert!(dataset_id_defined_re().is_match("dataset_id = 'x'"));
        assert!(forbidden_datasets_path_re().is_match("'/DATASETS/a.csv'"));
        assert!(!forbidden_datasets_path_re().is_match("/my_datasets/a.csv"));
    }

    #[test]
    fn test_dataset_refs_list_forms() {
        assert_eq!(first_dataset_ref(r#"["a1", "b2"]"#), "a1");
        assert_eq!(first_dataset_ref(" , b2,c3"), "b2");
        assert_eq!(first_dataset_ref(""), "");
    }
}
