//! 支持的工具表与参数别名解析
//!
//! 工具集合固定且可枚举（`ToolName`）。上游模型在不同 prompt 版本下可能输出不同的参数名，
//! 每个参数都有一张有序别名表（含位置参数 arg0、arg1...），取第一个非空值；
//! 解析结果立即转为强类型的 `ToolArgs`，业务逻辑不再接触原始 Map。

use std::fmt;

use serde_json::{json, Map, Value};

pub const KEYWORD_ALIASES: &[&str] = &["keyword", "query", "arg0"];
pub const STOCK_CODE_ALIASES: &[&str] = &["tsCode", "ts_code", "code", "stock_code", "arg0"];
pub const INDEX_CODE_ALIASES: &[&str] = &["tsCode", "ts_code", "code", "index_code", "arg0"];
/// 缓存 key 归一化使用的代码别名（股票与指数共用）
pub const ANY_CODE_ALIASES: &[&str] = &[
    "tsCode",
    "ts_code",
    "code",
    "stock_code",
    "index_code",
    "arg0",
];
pub const START_DATE_ALIASES: &[&str] = &["startDateStr", "startDate", "start_date", "arg1"];
pub const END_DATE_ALIASES: &[&str] = &["endDateStr", "endDate", "end_date", "arg2"];
pub const PYTHON_CODE_ALIASES: &[&str] = &["code", "arg0"];
pub const DATASET_ID_ALIASES: &[&str] = &["dataset_id", "datasetId", "arg1"];
pub const DATASET_IDS_ALIASES: &[&str] = &[
    "dataset_ids",
    "datasetIds",
    "datasets",
    "dataset_refs",
    "datasetRefs",
    "arg2",
];
pub const LIBRARIES_ALIASES: &[&str] = &["libraries", "arg3"];
pub const TIMEOUT_ALIASES: &[&str] = &["timeout_seconds", "timeoutSeconds", "arg4"];

/// 工具类别：决定缓存策略与 TTL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolClass {
    /// 关键词检索
    Search,
    /// 基础信息
    Info,
    /// 区间行情（产出数据集）
    Dataset,
    /// 沙箱代码执行
    Code,
}

/// 支持的工具
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolName {
    GetStockInfo,
    GetStockDaily,
    SearchStock,
    SearchFund,
    GetIndexInfo,
    GetIndexDaily,
    SearchIndex,
    ExecutePython,
}

impl ToolName {
    pub const ALL: [ToolName; 8] = [
        ToolName::GetStockInfo,
        ToolName::GetStockDaily,
        ToolName::SearchStock,
        ToolName::SearchFund,
        ToolName::GetIndexInfo,
        ToolName::GetIndexDaily,
        ToolName::SearchIndex,
        ToolName::ExecutePython,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::GetStockInfo => "getStockInfo",
            ToolName::GetStockDaily => "getStockDaily",
            ToolName::SearchStock => "searchStock",
            ToolName::SearchFund => "searchFund",
            ToolName::GetIndexInfo => "getIndexInfo",
            ToolName::GetIndexDaily => "getIndexDaily",
            ToolName::SearchIndex => "searchIndex",
            ToolName::ExecutePython => "executePython",
        }
    }

    /// 精确匹配工具名（大小写敏感）
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    pub fn class(&self) -> ToolClass {
        match self {
            ToolName::SearchStock | ToolName::SearchFund | ToolName::SearchIndex => ToolClass::Search,
            ToolName::GetStockInfo | ToolName::GetIndexInfo => ToolClass::Info,
            ToolName::GetStockDaily | ToolName::GetIndexDaily => ToolClass::Dataset,
            ToolName::ExecutePython => ToolClass::Code,
        }
    }

    /// 事件中展示给用户的名称
    pub fn display_name(&self) -> &'static str {
        match self {
            ToolName::SearchStock => "搜索股票代码",
            ToolName::SearchFund => "搜索基金代码",
            ToolName::SearchIndex => "搜索指数代码",
            ToolName::GetStockInfo => "查询股票基础信息",
            ToolName::GetStockDaily => "获取股票行情数据",
            ToolName::GetIndexInfo => "查询指数基础信息",
            ToolName::GetIndexDaily => "获取指数行情数据",
            ToolName::ExecutePython => "执行编程计算",
        }
    }

    pub fn description(&self) -> &'static str {
        match self.class() {
            ToolClass::Search => "根据关键词检索代码",
            ToolClass::Info => "读取资产基础信息",
            ToolClass::Dataset => "读取区间行情数据",
            ToolClass::Code => "在沙箱中执行 Python 计算",
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// executePython 的参数
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PythonArgs {
    pub code: String,
    pub dataset_id: String,
    pub dataset_ids: String,
    pub libraries: String,
    pub timeout_seconds: Option<u32>,
}

/// 归一化后的强类型工具参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolArgs {
    Search {
        keyword: String,
    },
    Info {
        ts_code: String,
    },
    Daily {
        ts_code: String,
        start_date: String,
        end_date: String,
    },
    Python(PythonArgs),
}

impl ToolArgs {
    pub fn from_params(tool: ToolName, params: &Map<String, Value>) -> Self {
        let get = |aliases: &[&str]| first_non_blank(params, aliases).unwrap_or_default();
        match tool {
            ToolName::SearchStock | ToolName::SearchFund | ToolName::SearchIndex => {
                ToolArgs::Search {
                    keyword: get(KEYWORD_ALIASES),
                }
            }
            ToolName::GetStockInfo => ToolArgs::Info {
                ts_code: get(STOCK_CODE_ALIASES),
            },
            ToolName::GetIndexInfo => ToolArgs::Info {
                ts_code: get(INDEX_CODE_ALIASES),
            },
            ToolName::GetStockDaily | ToolName::GetIndexDaily => {
                let codes = if tool == ToolName::GetStockDaily {
                    STOCK_CODE_ALIASES
                } else {
                    INDEX_CODE_ALIASES
                };
                ToolArgs::Daily {
                    ts_code: get(codes),
                    start_date: date_digits(&get(START_DATE_ALIASES)),
                    end_date: date_digits(&get(END_DATE_ALIASES)),
                }
            }
            ToolName::ExecutePython => ToolArgs::Python(PythonArgs {
                code: get(PYTHON_CODE_ALIASES),
                dataset_id: get(DATASET_ID_ALIASES),
                dataset_ids: get(DATASET_IDS_ALIASES),
                libraries: get(LIBRARIES_ALIASES),
                timeout_seconds: first_non_blank(params, TIMEOUT_ALIASES)
                    .and_then(|v| v.parse::<u32>().ok()),
            }),
        }
    }

    /// 归一化参数（用于观测记录）
    pub fn to_value(&self) -> Value {
        match self {
            ToolArgs::Search { keyword } => json!({ "keyword": keyword }),
            ToolArgs::Info { ts_code } => json!({ "tsCode": ts_code }),
            ToolArgs::Daily {
                ts_code,
                start_date,
                end_date,
            } => json!({
                "tsCode": ts_code,
                "startDateStr": start_date,
                "endDateStr": end_date,
            }),
            ToolArgs::Python(p) => json!({
                "code": p.code,
                "dataset_id": p.dataset_id,
                "dataset_ids": p.dataset_ids,
                "libraries": p.libraries,
                "timeout_seconds": p.timeout_seconds,
            }),
        }
    }
}

/// 按别名顺序取第一个非空值（字符串去首尾空白；数字 / 布尔 / 数组 / 对象转为文本）
pub fn first_non_blank(params: &Map<String, Value>, aliases: &[&str]) -> Option<String> {
    aliases
        .iter()
        .filter_map(|alias| params.get(*alias))
        .filter_map(value_text)
        .find(|text| !text.is_empty())
}

/// Value 转为去空白文本；null 返回 None
pub fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.trim().to_string()),
        other => Some(other.to_string().trim().to_string()),
    }
}

/// 路由层日期处理：只保留 8 位或 13 位数字形式，其它原样透传给后端
fn date_digits(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.len() == 8 || digits.len() == 13 {
        digits
    } else {
        raw.to_string()
    }
}
