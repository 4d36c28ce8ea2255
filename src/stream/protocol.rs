//! Wire types for the agent's line-delimited JSON output.
//!
//! Every field is optional or defaulted; the agent adds fields between
//! releases and the parser must keep working on what it recognizes.

use serde::Deserialize;
use serde_json::Value;

/// One line of agent output, discriminated by `type`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    System(SystemEvent),
    Assistant(MessageEvent),
    User(MessageEvent),
    ToolResult(ToolResultBlock),
    ContentBlockStart(ContentBlockStart),
    ContentBlockDelta(ContentBlockDelta),
    Result(ResultEvent),
    Error(ErrorEvent),
    Mcp(ActivityEvent),
    Browser(ActivityEvent),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SystemEvent {
    pub subtype: Option<String>,
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub cwd: Option<String>,
    pub tools: Vec<String>,
    pub mcp_servers: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct MessageEvent {
    pub message: Message,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Message {
    pub content: Content,
    pub usage: Option<Value>,
}

/// Message content: either a bare string or a list of typed blocks.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for Content {
    fn default() -> Self {
        Self::Blocks(Vec::new())
    }
}

impl Content {
    /// Concatenated text of all text blocks; other block types are ignored.
    pub fn text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult(ToolResultBlock),
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ToolResultBlock {
    pub tool_use_id: Option<String>,
    pub content: Option<Content>,
    pub is_error: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ContentBlockStart {
    pub content_block: Option<ContentBlock>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ContentBlockDelta {
    pub delta: Option<Delta>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delta {
    TextDelta {
        #[serde(default)]
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ResultEvent {
    pub subtype: Option<String>,
    pub is_error: bool,
    pub duration_ms: Option<u64>,
    pub num_turns: Option<u64>,
    pub total_cost_usd: Option<f64>,
    pub result: Option<String>,
    pub permission_denials: Vec<PermissionDenial>,
}

/// A denial is either a bare reason or an object naming the tool.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum PermissionDenial {
    Reason(String),
    Detail {
        #[serde(default)]
        tool_name: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    },
}

impl PermissionDenial {
    pub fn describe(&self) -> String {
        match self {
            Self::Reason(reason) => reason.clone(),
            Self::Detail { tool_name, reason } => match (tool_name, reason) {
                (Some(tool), Some(reason)) => format!("{tool}: {reason}"),
                (Some(tool), None) => tool.clone(),
                (None, Some(reason)) => reason.clone(),
                (None, None) => "unspecified".to_string(),
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ErrorEvent {
    pub error: Option<Value>,
    pub message: Option<String>,
}

impl ErrorEvent {
    pub fn message(&self) -> String {
        if let Some(msg) = &self.message {
            return msg.clone();
        }
        match &self.error {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Object(map)) => map
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| Value::Object(map.clone()).to_string()),
            Some(other) => other.to_string(),
            None => "unknown error".to_string(),
        }
    }
}

/// Browser automation or MCP server activity.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ActivityEvent {
    pub action: Option<String>,
    pub url: Option<String>,
    pub message: Option<String>,
    pub server: Option<String>,
}

impl ActivityEvent {
    pub fn describe(&self) -> String {
        let head = self
            .message
            .clone()
            .or_else(|| self.action.clone())
            .unwrap_or_else(|| "activity".to_string());
        match &self.url {
            Some(url) => format!("{head} {url}"),
            None => head,
        }
    }
}
