//! Job lines in, result lines out.

use serde::Deserialize;
use serde_json::{json, Value};

/// One line of input.
#[derive(Debug, Deserialize, PartialEq)]
pub struct Job {
    pub label: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

pub fn parse_job(line: &str) -> Result<Job, String> {
    serde_json::from_str(line).map_err(|e| format!("invalid job: {e}"))
}

pub fn ok_line(line: usize, value: Value) -> String {
    json!({ "line": line, "ok": value }).to_string()
}

pub fn error_line(line: usize, error: &str) -> String {
    json!({ "line": line, "error": error }).to_string()
}
