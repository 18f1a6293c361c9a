//! Risk assessment for proposed tool calls.
//!
//! The effective level of a call is the higher of the tool's declared level
//! and what the arguments reveal: SQL statements, Kubernetes actions and
//! batch or wildcard targets.

use serde::Serialize;
use serde_json::Value;

use crate::tools::{RiskLevel, ToolConfig};

const DANGER_SQL: [&str; 4] = ["DROP", "TRUNCATE", "DELETE FROM", "ALTER TABLE"];

const WRITE_SQL: [&str; 10] = [
    "INSERT", "UPDATE", "DELETE", "MERGE", "CREATE", "ALTER", "GRANT", "REVOKE", "RENAME",
    "UPSERT",
];

/// Write keywords that only count as the leading keyword.
const LEADING_WRITE_SQL: [&str; 2] = ["REPLACE", "CALL"];

const READ_ONLY_PREFIXES: [&str; 6] = ["SELECT", "SHOW", "EXPLAIN", "DESC", "DESCRIBE", "WITH"];

const K8S_MUTATING: [&str; 5] = ["exec", "scale", "delete", "drain", "cordon"];
const K8S_LOGS: [&str; 2] = ["logs", "log"];
const K8S_READS: [&str; 3] = ["list", "get", "describe"];

/// Argument keys that may carry a SQL statement.
const SQL_KEYS: [&str; 3] = ["sql", "statement", "sql_query"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub reasons: Vec<String>,
}

impl RiskAssessment {
    fn low() -> Self {
        Self {
            level: RiskLevel::Low,
            reasons: Vec::new(),
        }
    }

    fn raise(&mut self, level: RiskLevel, reason: impl Into<String>) {
        self.level = self.level.max(level);
        self.reasons.push(reason.into());
    }

    pub fn is_high(&self) -> bool {
        self.level == RiskLevel::High
    }
}

pub struct RiskChecker {
    batch_threshold: usize,
}

impl RiskChecker {
    pub fn new(batch_threshold: usize) -> Self {
        Self { batch_threshold }
    }

    pub fn assess(&self, tool: &ToolConfig, args: &Value) -> RiskAssessment {
        let mut assessment = RiskAssessment::low();
        if tool.risk_level > RiskLevel::Low {
            assessment.raise(tool.risk_level, format!("tool declared {} risk", tool.risk_level));
        }

        if let Some(sql) = SQL_KEYS
            .iter()
            .find_map(|k| args.get(*k).and_then(Value::as_str))
        {
            let (level, reason) = check_sql(sql);
            if level > RiskLevel::Low {
                assessment.raise(level, reason);
            }
        }

        if let Some(action) = k8s_action(tool, args) {
            let (level, reason) = check_k8s(&action, args);
            if level > RiskLevel::Low {
                assessment.raise(level, reason);
            }
        }

        if let Some(reason) = self.check_batch(args) {
            assessment.raise(RiskLevel::High, reason);
        }
        assessment
    }

    fn check_batch(&self, args: &Value) -> Option<String> {
        let obj = args.as_object()?;
        for (key, value) in obj {
            match value {
                Value::Array(items) if items.len() > self.batch_threshold => {
                    return Some(format!(
                        "'{key}' targets {} items (threshold {})",
                        items.len(),
                        self.batch_threshold
                    ));
                }
                Value::String(s) if key.ends_with("name") && s.contains('*') => {
                    return Some(format!("wildcard target in '{key}'"));
                }
                _ => {}
            }
        }
        None
    }
}

// ─── SQL ─────────────────────────────────────────────────────────────────────

/// Replace the contents of quoted literals so keywords inside strings are ignored.
pub fn strip_sql_literals(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                if c == '\\' {
                    chars.next();
                } else if c == q {
                    // doubled quote is an escaped quote
                    if chars.peek() == Some(&q) {
                        chars.next();
                    } else {
                        quote = None;
                        out.push(c);
                    }
                }
            }
            None => {
                if c == '\'' || c == '"' || c == '`' {
                    quote = Some(c);
                }
                out.push(c);
            }
        }
    }
    out
}

/// Number of non-empty statements after literal stripping.
pub fn count_statements(sql: &str) -> usize {
    strip_sql_literals(sql)
        .split(';')
        .filter(|s| !s.trim().is_empty())
        .count()
}

fn contains_word(haystack: &str, word: &str) -> bool {
    let bytes = haystack.as_bytes();
    haystack.match_indices(word).any(|(i, _)| {
        let before = i == 0 || !is_ident(bytes[i - 1]);
        let end = i + word.len();
        let after = end >= bytes.len() || !is_ident(bytes[end]);
        before && after
    })
}

fn is_ident(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

pub fn check_sql(sql: &str) -> (RiskLevel, String) {
    let stripped = strip_sql_literals(sql);
    let normalized = stripped
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase();

    if count_statements(sql) > 1 {
        return (RiskLevel::High, "multiple SQL statements".into());
    }
    if let Some(kw) = DANGER_SQL.iter().find(|kw| contains_word(&normalized, kw)) {
        return (RiskLevel::High, format!("destructive SQL ({kw})"));
    }
    if let Some(kw) = WRITE_SQL.iter().find(|kw| contains_word(&normalized, kw)) {
        return (RiskLevel::High, format!("SQL write ({kw})"));
    }
    let first = normalized.split([' ', '(']).next().unwrap_or_default();
    if LEADING_WRITE_SQL.contains(&first) {
        return (RiskLevel::High, format!("SQL write ({first})"));
    }
    if first == "SELECT" && !contains_word(&normalized, "LIMIT") {
        return (RiskLevel::Medium, "SELECT without LIMIT".into());
    }
    if READ_ONLY_PREFIXES.contains(&first) {
        return (RiskLevel::Low, "read-only SQL".into());
    }
    (RiskLevel::Medium, "unrecognised SQL".into())
}

// ─── Kubernetes ──────────────────────────────────────────────────────────────

fn k8s_action(tool: &ToolConfig, args: &Value) -> Option<String> {
    let name = tool.name.to_lowercase();
    if !(name.contains("k8s") || name.contains("kube")) {
        return None;
    }
    args.get("action")
        .or_else(|| args.get("operation"))
        .and_then(Value::as_str)
        .map(str::to_lowercase)
}

fn non_empty(args: &Value, key: &str) -> Option<String> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub fn check_k8s(action: &str, args: &Value) -> (RiskLevel, String) {
    let namespace = non_empty(args, "namespace");
    if K8S_MUTATING.contains(&action) {
        let resource = non_empty(args, "name").or_else(|| non_empty(args, "resource_name"));
        if namespace.is_none() || resource.is_none() {
            return (
                RiskLevel::High,
                format!("k8s {action} requires namespace and resource name"),
            );
        }
        return (RiskLevel::High, format!("k8s {action}"));
    }
    if K8S_LOGS.contains(&action) {
        return (RiskLevel::Medium, "k8s log read".into());
    }
    if K8S_READS.contains(&action) {
        return match namespace.as_deref() {
            None | Some("all") => (RiskLevel::Medium, format!("k8s {action} across all namespaces")),
            Some(_) => (RiskLevel::Low, format!("k8s {action}")),
        };
    }
    (RiskLevel::Medium, format!("unrecognised k8s action '{action}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolImplementation;
    use serde_json::json;

    fn tool(name: &str) -> ToolConfig {
        ToolConfig::new(
            name,
            "",
            ToolImplementation::Native {
                handler: "noop".into(),
            },
        )
    }

    #[test]
    fn test_multi_statement_is_high() {
        assert_eq!(count_statements("SELECT 1; SELECT 2"), 2);
        assert_eq!(check_sql("SELECT 1; SELECT 2 LIMIT 1").0, RiskLevel::High);
        // semicolon inside a literal does not split
        assert_eq!(count_statements("SELECT ';' FROM t LIMIT 1;"), 1);
    }

    #[test]
    fn test_sql_levels() {
        assert_eq!(check_sql("DROP TABLE t;").0, RiskLevel::High);
        assert_eq!(check_sql("delete   from t where id=1").0, RiskLevel::High);
        assert_eq!(check_sql("UPDATE t SET a=1").0, RiskLevel::High);
        assert_eq!(check_sql("SELECT * FROM t").0, RiskLevel::Medium);
        assert_eq!(check_sql("SELECT * FROM t LIMIT 10").0, RiskLevel::Low);
        assert_eq!(check_sql("SHOW PROCESSLIST").0, RiskLevel::Low);
    }

    #[test]
    fn test_keywords_in_literals_and_identifiers_ignored() {
        assert_eq!(
            check_sql("SELECT * FROM t WHERE note = 'drop table x' LIMIT 5").0,
            RiskLevel::Low
        );
        assert_eq!(check_sql("SELECT updated_at FROM t LIMIT 1").0, RiskLevel::Low);
    }

    #[test]
    fn test_replace_and_call_only_as_leading_keyword() {
        assert_eq!(
            check_sql("SELECT REPLACE(name,'a','b') FROM t LIMIT 5").0,
            RiskLevel::Low
        );
        assert_eq!(check_sql("REPLACE INTO t VALUES (1)").0, RiskLevel::High);
        assert_eq!(check_sql("call purge_logs()").0, RiskLevel::High);
    }

    #[test]
    fn test_k8s_levels() {
        assert_eq!(
            check_k8s("delete", &json!({"namespace": "prod", "name": "api"})).0,
            RiskLevel::High
        );
        let (level, reason) = check_k8s("scale", &json!({"namespace": "prod"}));
        assert_eq!(level, RiskLevel::High);
        assert!(reason.contains("requires"));
        assert_eq!(check_k8s("logs", &json!({})).0, RiskLevel::Medium);
        assert_eq!(check_k8s("list", &json!({"namespace": "all"})).0, RiskLevel::Medium);
        assert_eq!(check_k8s("get", &json!({"namespace": "prod"})).0, RiskLevel::Low);
    }

    #[test]
    fn test_assess_combines_declared_and_detected() {
        let checker = RiskChecker::new(3);
        let t = tool("run_sql");
        assert!(checker.assess(&t, &json!({"sql": "DROP TABLE t;"})).is_high());
        assert_eq!(
            checker
                .assess(&t, &json!({"sql": "SELECT 1 LIMIT 1"}))
                .level,
            RiskLevel::Low
        );

        let mut declared = tool("restart");
        declared.risk_level = RiskLevel::High;
        assert!(checker.assess(&declared, &json!({})).is_high());

        let k8s = tool("k8s_ops");
        assert!(checker
            .assess(&k8s, &json!({"action": "drain", "namespace": "p", "name": "n1"}))
            .is_high());
    }

    #[test]
    fn test_batch_and_wildcard() {
        let checker = RiskChecker::new(3);
        let t = tool("bulk");
        assert!(checker.assess(&t, &json!({"ids": [1, 2, 3, 4]})).is_high());
        assert!(!checker.assess(&t, &json!({"ids": [1, 2, 3]})).is_high());
        assert!(checker.assess(&t, &json!({"pod_name": "api-*"})).is_high());
    }
}
