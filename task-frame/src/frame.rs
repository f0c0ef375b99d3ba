//! Inbound task response frames and outbound tool answers.
//!
//! A [`TaskResponse`] is one JSON payload received over the session transport.
//! The control tag lives in `data.tool` and is matched case-insensitively;
//! anything that is not a known control tag is a tool invocation against the
//! server named in `data.serverName`. Unknown JSON fields are ignored so the
//! peer can extend its frames without breaking older runtimes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frame type identifying a structured-output chunk; their `toolArgs` values
/// concatenate (in arrival order) into the session's structured output.
pub const STRUCTURED_OUTPUT_TYPE: &str = "structured_output";

/// Tool payload of a frame. Field names follow the peer's camelCase wire form.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ToolData {
    /// Control tag (READY, ENDNODE, ...) or tool name for invocations.
    #[serde(default)]
    pub tool: Option<String>,
    /// Tool server that owns `tool`; absent on control frames.
    #[serde(rename = "serverName", default)]
    pub server_name: Option<String>,
    /// Correlates a tool invocation with its answer frame.
    #[serde(default)]
    pub identifier: Option<String>,
    /// Invocation arguments, or a structured-output chunk.
    #[serde(rename = "toolArgs", default)]
    pub tool_args: Option<Value>,
    /// Server-assigned resume token, present on READY frames.
    #[serde(rename = "checkpointId", default)]
    pub checkpoint_id: Option<String>,
}

/// One frame received over the session transport.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TaskResponse {
    /// Lowercase frame type, e.g. `"tool_use"` or `"structured_output"`.
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub data: Option<ToolData>,
    #[serde(default)]
    pub error: Option<String>,
}

impl TaskResponse {
    /// Classifies this frame by its `data.tool` tag (case-insensitive).
    pub fn tag(&self) -> FrameTag {
        let tool = self.data.as_ref().and_then(|d| d.tool.as_deref());
        let Some(tool) = tool else {
            return FrameTag::Empty;
        };
        match tool.to_ascii_uppercase().as_str() {
            "READY" => FrameTag::Ready,
            "USERRESPONSE" => FrameTag::UserResponse,
            "THINKING" => FrameTag::Thinking,
            "REVIEWER_NOTES" => FrameTag::ReviewerNotes,
            "ENDNODE" => FrameTag::EndNode,
            _ => FrameTag::ToolCall(tool.to_string()),
        }
    }

    /// True when this frame carries a structured-output chunk.
    pub fn is_structured_output(&self) -> bool {
        self.kind.as_deref() == Some(STRUCTURED_OUTPUT_TYPE)
    }

    /// The structured-output chunk carried by this frame, stringified.
    ///
    /// String chunks are taken verbatim; non-string values are serialized so
    /// concatenation always appends valid JSON text.
    pub fn structured_chunk(&self) -> Option<String> {
        if !self.is_structured_output() {
            return None;
        }
        let args = self.data.as_ref()?.tool_args.as_ref()?;
        Some(match args {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// Checkpoint id carried by this frame, if any.
    pub fn checkpoint_id(&self) -> Option<&str> {
        self.data.as_ref()?.checkpoint_id.as_deref()
    }
}

/// Dispatch classification of one frame, derived from `data.tool`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameTag {
    Ready,
    UserResponse,
    Thinking,
    ReviewerNotes,
    EndNode,
    /// Anything else: a tool invocation with the original (non-uppercased) name.
    ToolCall(String),
    /// Frame without a `data.tool` tag; logged and skipped by the runtime.
    Empty,
}

/// Result of one tool invocation, sent back inside an `IDERetrievalAnswer`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolAnswer {
    /// Text content blocks, `[{"type": "text", "text": ...}]` on the wire.
    pub content: Vec<Value>,
    #[serde(rename = "isError")]
    pub is_error: bool,
}

impl ToolAnswer {
    /// Successful answer wrapping the given text blocks.
    pub fn success(texts: Vec<String>) -> Self {
        Self {
            content: texts
                .into_iter()
                .map(|t| serde_json::json!({"type": "text", "text": t}))
                .collect(),
            is_error: false,
        }
    }

    /// Failed answer with no content.
    pub fn failure() -> Self {
        Self {
            content: Vec::new(),
            is_error: true,
        }
    }

    /// Failed answer carrying a single explanatory text block.
    pub fn failure_with_text(text: impl Into<String>) -> Self {
        Self {
            content: vec![serde_json::json!({"type": "text", "text": text.into()})],
            is_error: true,
        }
    }
}

/// Tool as advertised to the agent alongside each answer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// Body of an outbound `IDERetrievalAnswer` frame: the answer for one tool
/// invocation plus the owning server's current tool list.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdeRetrievalAnswer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    pub answer: ToolAnswer,
    pub tools: Vec<ToolDescriptor>,
}
