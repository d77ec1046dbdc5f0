use serde_json::{json, Value};

/// Turns one line of tool output into a structured payload.
///
/// JSON lines (httpx, nuclei) are kept as decoded; anything else is wrapped
/// as `{"value": <trimmed line>}`.
pub fn parse_line(raw: &str) -> Value {
    let line = raw.trim();
    serde_json::from_str(line).unwrap_or_else(|_| json!({ "value": line }))
}

/// Non-blank lines of captured stdout, in source order.
pub fn output_lines(stdout: &str) -> impl Iterator<Item = &str> {
    stdout.lines().filter(|line| !line.trim().is_empty())
}
