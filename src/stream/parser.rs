//! Turns agent output lines into normalized log entries.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::stream::entry::{LogKind, NewLogEntry, truncate_content};
use crate::stream::heuristics;
use crate::stream::protocol::{
    ActivityEvent, Content, ContentBlock, Delta, MessageEvent, ResultEvent, StreamEvent,
    SystemEvent, ToolResultBlock,
};

/// Tool results starting with this marker report a redirected fetch.
pub const REDIRECT_SENTINEL: &str = "REDIRECT DETECTED";

static REDIRECT_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)redirect(?:ed)?\s+url:\s*(https?://\S+)").expect("valid regex")
});

static ANY_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://[^\s)\]>]+").expect("valid regex"));

/// Keys in a tool's input that make a better summary than the raw object,
/// in priority order.
const SUMMARY_KEYS: &[&str] = &[
    "query",
    "url",
    "file_path",
    "path",
    "command",
    "pattern",
    "prompt",
];

/// Per-job parser. Remembers tool-use ids so results can name their tool.
pub struct EventStreamParser {
    content_cap: usize,
    tool_names: HashMap<String, String>,
}

impl EventStreamParser {
    pub fn new(content_cap: usize) -> Self {
        Self {
            content_cap,
            tool_names: HashMap::new(),
        }
    }

    /// Parse one output line into zero or more entries. Never fails.
    pub fn parse_line(&mut self, line: &str) -> Vec<NewLogEntry> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        if !trimmed.starts_with('{') {
            return heuristics::categorize(trimmed, self.content_cap)
                .into_iter()
                .collect();
        }

        let value: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, line = %truncate_content(trimmed, 120), "Malformed JSON line from agent");
                return Vec::new();
            }
        };
        let event_type = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        let event: StreamEvent = match serde_json::from_value(value) {
            Ok(e) => e,
            Err(e) => {
                warn!(event_type = %event_type, error = %e, "Unreadable agent event");
                return Vec::new();
            }
        };

        match event {
            StreamEvent::System(ev) => self.on_system(ev),
            StreamEvent::Assistant(ev) => self.on_assistant(ev),
            StreamEvent::User(ev) => self.on_user(ev),
            StreamEvent::ToolResult(block) => self.on_tool_result(block).into_iter().collect(),
            StreamEvent::ContentBlockStart(ev) => match ev.content_block {
                Some(ContentBlock::ToolUse { id, name, input }) => {
                    vec![self.tool_use_entry(id, &name, &input)]
                }
                Some(ContentBlock::Text { text }) if !text.trim().is_empty() => {
                    vec![self.text_entry(LogKind::Assistant, &text)]
                }
                _ => Vec::new(),
            },
            StreamEvent::ContentBlockDelta(ev) => match ev.delta {
                Some(Delta::TextDelta { text }) if !text.trim().is_empty() => {
                    vec![self.text_entry(LogKind::Assistant, &text)]
                }
                _ => Vec::new(),
            },
            StreamEvent::Result(ev) => self.on_result(ev),
            StreamEvent::Error(ev) => vec![self.text_entry(LogKind::Error, &ev.message())],
            StreamEvent::Mcp(ev) | StreamEvent::Browser(ev) => vec![self.on_activity(ev)],
            StreamEvent::Unknown => {
                debug!(event_type = %event_type, "Ignoring unrecognized agent event");
                Vec::new()
            }
        }
    }

    fn text_entry(&self, kind: LogKind, text: &str) -> NewLogEntry {
        NewLogEntry::new(kind, truncate_content(text.trim(), self.content_cap))
    }

    fn on_system(&self, ev: SystemEvent) -> Vec<NewLogEntry> {
        let subtype = ev.subtype.as_deref().unwrap_or("init");
        if subtype != "init" {
            return vec![self.text_entry(LogKind::System, &format!("System event: {subtype}"))];
        }

        let mut parts = Vec::new();
        if let Some(model) = &ev.model {
            parts.push(format!("model {model}"));
        }
        parts.push(format!("{} tools", ev.tools.len()));
        if !ev.mcp_servers.is_empty() {
            parts.push(format!("{} MCP servers", ev.mcp_servers.len()));
        }
        if let Some(cwd) = &ev.cwd {
            parts.push(format!("cwd {cwd}"));
        }
        let content = format!("Session started ({})", parts.join(", "));

        let mut entry = self.text_entry(LogKind::System, &content);
        if let Some(session_id) = ev.session_id {
            entry = entry.with_metadata(json!({ "session_id": session_id }));
        }
        vec![entry]
    }

    fn on_assistant(&mut self, ev: MessageEvent) -> Vec<NewLogEntry> {
        let mut entries = match ev.message.content {
            Content::Text(text) if !text.trim().is_empty() => {
                vec![self.text_entry(LogKind::Assistant, &text)]
            }
            Content::Text(_) => Vec::new(),
            Content::Blocks(blocks) => blocks
                .into_iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } if !text.trim().is_empty() => {
                        Some(self.text_entry(LogKind::Assistant, &text))
                    }
                    ContentBlock::ToolUse { id, name, input } => {
                        Some(self.tool_use_entry(id, &name, &input))
                    }
                    _ => None,
                })
                .collect(),
        };

        if let (Some(usage), Some(last)) = (ev.message.usage, entries.last_mut()) {
            let mut metadata = last.metadata.take().unwrap_or_else(|| json!({}));
            metadata["usage"] = usage;
            last.metadata = Some(metadata);
        }
        entries
    }

    fn on_user(&mut self, ev: MessageEvent) -> Vec<NewLogEntry> {
        match ev.message.content {
            Content::Text(text) if !text.trim().is_empty() => {
                vec![self.classify_result(&text, false, None)]
            }
            Content::Text(_) => Vec::new(),
            Content::Blocks(blocks) => blocks
                .into_iter()
                .filter_map(|block| match block {
                    ContentBlock::ToolResult(result) => self.on_tool_result(result),
                    _ => None,
                })
                .collect(),
        }
    }

    fn on_tool_result(&mut self, block: ToolResultBlock) -> Option<NewLogEntry> {
        let text = block.content.as_ref().map(Content::text).unwrap_or_default();
        if text.trim().is_empty() {
            return None;
        }
        let tool_name = block
            .tool_use_id
            .as_ref()
            .and_then(|id| self.tool_names.get(id).cloned());
        Some(self.classify_result(&text, block.is_error, tool_name))
    }

    fn classify_result(&self, text: &str, is_error: bool, tool_name: Option<String>) -> NewLogEntry {
        let trimmed = text.trim();
        let mut entry = if is_error {
            self.text_entry(LogKind::Error, trimmed)
        } else if let Some(url) = redirect_url(trimmed) {
            self.text_entry(LogKind::Redirect, trimmed)
                .with_metadata(json!({ "redirect_url": url }))
        } else {
            self.text_entry(LogKind::ToolResult, trimmed)
        };
        entry.tool_name = tool_name;
        entry
    }

    fn tool_use_entry(&mut self, id: Option<String>, name: &str, input: &Value) -> NewLogEntry {
        let display = display_tool_name(name);
        if let Some(id) = id {
            self.tool_names.insert(id, display.clone());
        }
        let summary = summarize_input(input);
        let content = if summary.is_empty() {
            display.clone()
        } else {
            format!("{display}: {summary}")
        };
        let mut entry = self.text_entry(LogKind::ToolUse, &content).with_tool_name(display);
        if !input.is_null() {
            entry = entry.with_metadata(json!({ "input": input }));
        }
        entry
    }

    fn on_result(&self, ev: ResultEvent) -> Vec<NewLogEntry> {
        let subtype = ev.subtype.as_deref().unwrap_or("success");
        let failed = ev.is_error || subtype != "success";

        let mut stats = Vec::new();
        if let Some(ms) = ev.duration_ms {
            stats.push(format!("{:.1}s", ms as f64 / 1000.0));
        }
        if let Some(turns) = ev.num_turns {
            stats.push(format!("{turns} turns"));
        }
        let stats = if stats.is_empty() {
            String::new()
        } else {
            format!(" ({})", stats.join(", "))
        };
        let content = if failed {
            format!("Research failed: {subtype}{stats}")
        } else {
            format!("Research finished{stats}")
        };

        let kind = if failed { LogKind::Error } else { LogKind::Info };
        let metadata = json!({
            "duration_ms": ev.duration_ms,
            "num_turns": ev.num_turns,
            "total_cost_usd": ev.total_cost_usd,
            "subtype": subtype,
        });
        let mut entries = vec![self.text_entry(kind, &content).with_metadata(metadata)];

        for denial in &ev.permission_denials {
            entries.push(self.text_entry(
                LogKind::Error,
                &format!("Permission denied: {}", denial.describe()),
            ));
        }
        entries
    }

    fn on_activity(&self, ev: ActivityEvent) -> NewLogEntry {
        let mut entry = self.text_entry(LogKind::Browser, &ev.describe());
        if let Some(server) = ev.server {
            entry = entry.with_tool_name(server);
        }
        entry
    }
}

/// `mcp__server__tool` becomes `server/tool`; other names pass through.
pub fn display_tool_name(name: &str) -> String {
    match name.strip_prefix("mcp__") {
        Some(rest) => match rest.split_once("__") {
            Some((server, tool)) => format!("{server}/{tool}"),
            None => rest.to_string(),
        },
        None => name.to_string(),
    }
}

/// A short human-readable summary of a tool's input.
pub fn summarize_input(input: &Value) -> String {
    let Some(map) = input.as_object() else {
        return match input {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
    };
    for key in SUMMARY_KEYS {
        if let Some(value) = map.get(*key).and_then(Value::as_str)
            && !value.trim().is_empty()
        {
            return value.trim().to_string();
        }
    }
    if map.is_empty() {
        String::new()
    } else {
        input.to_string()
    }
}

/// The target URL if `text` is a redirect notice.
fn redirect_url(text: &str) -> Option<String> {
    if !text.starts_with(REDIRECT_SENTINEL) {
        return None;
    }
    REDIRECT_URL
        .captures(text)
        .and_then(|c| c.get(1))
        .or_else(|| ANY_URL.find(text))
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';']).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(parser: &mut EventStreamParser, lines: &[&str]) -> Vec<NewLogEntry> {
        lines.iter().flat_map(|l| parser.parse_line(l)).collect()
    }

    #[test]
    fn fixture_stream_yields_expected_entries() {
        let long_result = "r".repeat(530);
        let lines = vec![
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Looking into Acme Corp."}]}}"#.to_string(),
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"tu_1","name":"WebSearch","input":{"query":"Acme Corp funding"}}]}}"#.to_string(),
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"tu_1","content":[{"type":"text","text":"Series B, 2023"},{"type":"image","source":{}}]},{"type":"tool_result","tool_use_id":"tu_1","is_error":true,"content":[{"type":"text","text":"rate limited"}]}]}}"#.to_string(),
            r#"{"type":"user","message":{"content":[{"type":"tool_result","content":"REDIRECT DETECTED: The URL redirects to a different host. Redirect URL: https://acme.example/about"}]}}"#.to_string(),
            r#"{"type":"assistant","message":{"content":[{"type":"text""#.to_string(),
            "Fetching https://acme.example".to_string(),
            format!(r#"{{"type":"user","message":{{"content":[{{"type":"tool_result","content":"{long_result}"}}]}}}}"#),
        ];
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();

        let mut parser = EventStreamParser::new(500);
        let entries = parse_all(&mut parser, &refs);

        let kinds: Vec<LogKind> = entries.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                LogKind::Assistant,
                LogKind::ToolUse,
                LogKind::ToolResult,
                LogKind::Error,
                LogKind::Redirect,
                LogKind::Progress,
                LogKind::ToolResult,
            ]
        );

        assert_eq!(entries[0].content, "Looking into Acme Corp.");
        assert_eq!(entries[1].content, "WebSearch: Acme Corp funding");
        assert_eq!(entries[1].tool_name.as_deref(), Some("WebSearch"));
        assert_eq!(entries[2].content, "Series B, 2023");
        assert_eq!(entries[2].tool_name.as_deref(), Some("WebSearch"));
        assert_eq!(entries[3].content, "rate limited");
        assert_eq!(
            entries[4].metadata,
            Some(json!({ "redirect_url": "https://acme.example/about" }))
        );
        assert_eq!(entries[5].content, "Fetching https://acme.example");
        assert_eq!(
            entries[6].content,
            format!("{}... [30 chars truncated]", "r".repeat(500))
        );
    }

    #[test]
    fn system_init_describes_session() {
        let mut parser = EventStreamParser::new(500);
        let entries = parser.parse_line(
            r#"{"type":"system","subtype":"init","session_id":"s1","model":"sonnet","tools":["WebSearch","WebFetch"],"cwd":"/tmp"}"#,
        );
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, LogKind::System);
        assert_eq!(
            entries[0].content,
            "Session started (model sonnet, 2 tools, cwd /tmp)"
        );
        assert_eq!(entries[0].metadata, Some(json!({ "session_id": "s1" })));
    }

    #[test]
    fn mcp_tool_names_are_shortened() {
        assert_eq!(
            display_tool_name("mcp__playwright__browser_navigate"),
            "playwright/browser_navigate"
        );
        assert_eq!(display_tool_name("WebFetch"), "WebFetch");
    }

    #[test]
    fn input_summary_prefers_known_keys() {
        assert_eq!(
            summarize_input(&json!({ "url": "https://a.example", "prompt": "x" })),
            "https://a.example"
        );
        assert_eq!(summarize_input(&json!({ "file_path": "/tmp/a" })), "/tmp/a");
        assert_eq!(summarize_input(&json!({ "n": 3 })), r#"{"n":3}"#);
        assert_eq!(summarize_input(&json!({})), "");
        assert_eq!(summarize_input(&Value::Null), "");
    }

    #[test]
    fn usage_lands_in_metadata() {
        let mut parser = EventStreamParser::new(500);
        let entries = parser.parse_line(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}],"usage":{"input_tokens":10,"output_tokens":2}}}"#,
        );
        assert_eq!(
            entries[0].metadata,
            Some(json!({ "usage": { "input_tokens": 10, "output_tokens": 2 } }))
        );
    }

    #[test]
    fn deltas_and_block_starts() {
        let mut parser = EventStreamParser::new(500);
        let entries = parse_all(
            &mut parser,
            &[
                r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"partial "}}"#,
                r#"{"type":"content_block_delta","delta":{"type":"input_json_delta","partial_json":"{"}}"#,
                r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"  "}}"#,
                r#"{"type":"content_block_start","content_block":{"type":"tool_use","id":"t","name":"mcp__search__web","input":{}}}"#,
            ],
        );
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, LogKind::Assistant);
        assert_eq!(entries[0].content, "partial");
        assert_eq!(entries[1].kind, LogKind::ToolUse);
        assert_eq!(entries[1].content, "search/web");
    }

    #[test]
    fn result_event_with_denials() {
        let mut parser = EventStreamParser::new(500);
        let entries = parser.parse_line(
            r#"{"type":"result","subtype":"success","is_error":false,"duration_ms":12345,"num_turns":4,"permission_denials":[{"tool_name":"Bash"},"write outside workspace"]}"#,
        );
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].kind, LogKind::Info);
        assert_eq!(entries[0].content, "Research finished (12.3s, 4 turns)");
        assert_eq!(entries[1].kind, LogKind::Error);
        assert_eq!(entries[1].content, "Permission denied: Bash");
        assert_eq!(entries[2].content, "Permission denied: write outside workspace");
    }

    #[test]
    fn failed_result_is_error() {
        let mut parser = EventStreamParser::new(500);
        let entries =
            parser.parse_line(r#"{"type":"result","subtype":"error_max_turns","is_error":true}"#);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, LogKind::Error);
        assert_eq!(entries[0].content, "Research failed: error_max_turns");
    }

    #[test]
    fn error_and_browser_events() {
        let mut parser = EventStreamParser::new(500);
        let entries = parse_all(
            &mut parser,
            &[
                r#"{"type":"error","error":{"message":"overloaded"}}"#,
                r#"{"type":"browser","action":"navigate","url":"https://acme.example"}"#,
                r#"{"type":"mcp","server":"playwright","message":"Clicked Contact"}"#,
            ],
        );
        assert_eq!(entries[0].kind, LogKind::Error);
        assert_eq!(entries[0].content, "overloaded");
        assert_eq!(entries[1].kind, LogKind::Browser);
        assert_eq!(entries[1].content, "navigate https://acme.example");
        assert_eq!(entries[2].tool_name.as_deref(), Some("playwright"));
    }

    #[test]
    fn unknown_and_malformed_lines_are_dropped() {
        let mut parser = EventStreamParser::new(500);
        assert!(parser.parse_line(r#"{"type":"telemetry","x":1}"#).is_empty());
        assert!(parser.parse_line(r#"{"no_type":true}"#).is_empty());
        assert!(parser.parse_line("{not json").is_empty());
        assert!(parser.parse_line("").is_empty());
        // Parser keeps working afterwards.
        assert_eq!(parser.parse_line("done").len(), 1);
    }

    #[test]
    fn redirect_needs_sentinel_prefix() {
        assert_eq!(
            redirect_url("REDIRECT DETECTED: moved to https://b.example/x."),
            Some("https://b.example/x".to_string())
        );
        assert!(redirect_url("See https://b.example").is_none());
        assert!(redirect_url("REDIRECT DETECTED but no link").is_none());
    }
}
