//! Messages 方言：请求转换、非流式响应映射与 SSE 状态机。

use crate::error::RelayError;
use crate::streaming::Frame;
use crate::types::{
    unix_now, ChatRequest, ChatResponse, ChatStreamChunk, Choice, Delta, MessageContent,
    ResponseMessage, StreamChoice, Usage,
};
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

pub const API_VERSION: &str = "2023-06-01";

/// 厂商请求体中允许出现的键
pub const SUPPORTED_PARAMETERS: &[&str] = &[
    "model",
    "messages",
    "system",
    "max_tokens",
    "stop_sequences",
    "temperature",
    "top_p",
    "stream",
];

const DEFAULT_MAX_TOKENS: u64 = 1024;

/// Messages API 请求格式
#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    messages: Vec<VendorMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    max_tokens: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<Value>,
}

#[derive(Debug, Serialize)]
struct VendorMessage {
    role: String,
    content: VendorContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum VendorContent {
    Text(String),
    Blocks(Vec<TextBlock>),
}

#[derive(Debug, Serialize)]
struct TextBlock {
    #[serde(rename = "type")]
    kind: &'static str,
    text: String,
}

/// 转换 OpenAI 请求为 Messages 格式
pub fn convert_request(req: &ChatRequest) -> Result<Value> {
    let mut system_parts = Vec::new();
    let mut messages = Vec::new();

    for msg in &req.messages {
        match msg.role.as_str() {
            "system" | "developer" => system_parts.push(msg.text()),
            "user" | "assistant" => {
                if msg.extra.get("tool_calls").is_some_and(|v| !v.is_null())
                    || msg.extra.get("function_call").is_some_and(|v| !v.is_null())
                {
                    return Err(RelayError::unsupported("assistant tool calls"));
                }
                messages.push(VendorMessage {
                    role: msg.role.clone(),
                    content: convert_content(msg.content.as_ref())?,
                });
            }
            "tool" | "function" => {
                return Err(RelayError::unsupported(format!("{} role message", msg.role)));
            }
            other => {
                return Err(RelayError::unsupported(format!("message role '{}'", other)));
            }
        }
    }

    let max_tokens = req
        .param("max_tokens")
        .or_else(|| req.param("max_completion_tokens"))
        .cloned()
        .unwrap_or_else(|| json!(DEFAULT_MAX_TOKENS));

    let stop_sequences = req.param("stop").and_then(|stop| match stop {
        Value::String(s) => Some(vec![Value::String(s.clone())]),
        Value::Array(items) => Some(items.clone()),
        _ => None,
    });

    let body = MessagesRequest {
        model: req.model.clone(),
        messages,
        system: (!system_parts.is_empty()).then(|| system_parts.join("\n")),
        max_tokens,
        stop_sequences,
        temperature: req.param("temperature").cloned(),
        top_p: req.param("top_p").cloned(),
        stream: req.param("stream").cloned(),
    };

    Ok(serde_json::to_value(body)?)
}

fn convert_content(content: Option<&MessageContent>) -> Result<VendorContent> {
    match content {
        None => Ok(VendorContent::Text(String::new())),
        Some(MessageContent::Text(text)) => Ok(VendorContent::Text(text.clone())),
        Some(MessageContent::Parts(parts)) => parts
            .iter()
            .map(|part| match part.kind.as_str() {
                "text" => Ok(TextBlock {
                    kind: "text",
                    text: part.text_value().unwrap_or_default().to_string(),
                }),
                other => Err(RelayError::unsupported(format!("{} content block", other))),
            })
            .collect::<Result<Vec<_>>>()
            .map(VendorContent::Blocks),
    }
}

/// stop_reason -> finish_reason
pub fn map_finish_reason(reason: Option<&str>) -> &'static str {
    match reason {
        Some("end_turn") => "stop",
        Some("max_tokens") => "length",
        Some("stop_sequence") => "stop",
        Some("tool_use") => "tool_calls",
        _ => "content_filter",
    }
}

/// Messages API 响应格式
#[derive(Debug, Deserialize)]
pub struct MessagesResponse {
    id: String,
    model: String,
    #[serde(default)]
    content: Vec<ResponseBlock>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: MessagesUsage,
}

#[derive(Debug, Deserialize)]
struct ResponseBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MessagesUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
}

impl MessagesUsage {
    fn to_openai(&self) -> Usage {
        let mut usage = Usage::from_counts(self.input_tokens, self.output_tokens);
        usage.prompt_tokens_details.cached_tokens = self.cache_read_input_tokens.unwrap_or(0);
        usage
    }
}

/// 转换 Messages 响应为 OpenAI 格式
pub fn convert_response(resp: MessagesResponse) -> Result<ChatResponse> {
    let mut content = String::new();
    for block in &resp.content {
        match block.kind.as_str() {
            "text" => content.push_str(block.text.as_deref().unwrap_or_default()),
            "tool_use" => return Err(RelayError::unsupported("tool_use response block")),
            _ => {}
        }
    }

    Ok(ChatResponse {
        id: resp.id,
        object: "chat.completion".to_string(),
        created: unix_now(),
        model: resp.model,
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage::assistant(content),
            logprobs: None,
            finish_reason: Some(map_finish_reason(resp.stop_reason.as_deref()).to_string()),
        }],
        usage: resp.usage.to_openai(),
    })
}

/// Messages SSE 事件，按 data 中的 type 分派
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: StartMessage,
    },
    ContentBlockStart {
        content_block: StartBlock,
    },
    ContentBlockDelta {
        delta: BlockDelta,
    },
    ContentBlockStop,
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<MessagesUsage>,
    },
    MessageStop,
    Ping,
    Error {
        #[serde(default)]
        error: Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct StartMessage {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<MessagesUsage>,
}

#[derive(Debug, Deserialize)]
struct StartBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BlockDelta {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

/// 单条流的转码状态
#[derive(Debug)]
pub struct MessagesTranscoder {
    id: String,
    model: String,
    created: u64,
    input_tokens: u64,
    cached_tokens: u64,
}

impl MessagesTranscoder {
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", Uuid::new_v4()),
            model: model.to_string(),
            created: unix_now(),
            input_tokens: 0,
            cached_tokens: 0,
        }
    }

    pub fn on_event(&mut self, _event: &str, data: &str) -> Result<Option<Frame>> {
        let event: StreamEvent = serde_json::from_str(data)
            .map_err(|e| RelayError::StreamError(format!("无法解析 Messages 事件: {}", e)))?;

        match event {
            StreamEvent::MessageStart { message } => {
                if let Some(id) = message.id.filter(|id| !id.is_empty()) {
                    self.id = id;
                }
                if let Some(model) = message.model.filter(|m| !m.is_empty()) {
                    self.model = model;
                }
                if let Some(usage) = message.usage {
                    self.input_tokens = usage.input_tokens;
                    self.cached_tokens = usage.cache_read_input_tokens.unwrap_or(0);
                }
                Ok(Some(self.chunk(
                    Delta {
                        role: Some("assistant".to_string()),
                        content: Some(String::new()),
                    },
                    None,
                    None,
                )))
            }
            StreamEvent::ContentBlockStart { content_block } => {
                if content_block.kind.contains("tool") || content_block.kind.contains("function") {
                    return Err(RelayError::unsupported(format!(
                        "{} content block",
                        content_block.kind
                    )));
                }
                match (content_block.kind.as_str(), content_block.text) {
                    ("text", Some(text)) if !text.is_empty() => Ok(Some(self.text_chunk(text))),
                    _ => Ok(None),
                }
            }
            StreamEvent::ContentBlockDelta { delta } => match delta.kind.as_str() {
                "text_delta" => Ok(Some(self.text_chunk(delta.text.unwrap_or_default()))),
                "input_json_delta" => Err(RelayError::unsupported("tool call arguments")),
                _ => Ok(None),
            },
            StreamEvent::ContentBlockStop => Ok(None),
            StreamEvent::MessageDelta { delta, usage } => {
                let output_tokens = usage.map(|u| u.output_tokens).unwrap_or(0);
                let mut total = Usage::from_counts(self.input_tokens, output_tokens);
                total.prompt_tokens_details.cached_tokens = self.cached_tokens;
                Ok(Some(self.chunk(
                    Delta::default(),
                    Some(map_finish_reason(delta.stop_reason.as_deref()).to_string()),
                    Some(total),
                )))
            }
            StreamEvent::MessageStop => Ok(Some(Frame::Done)),
            StreamEvent::Ping | StreamEvent::Unknown => Ok(None),
            StreamEvent::Error { error } => {
                warn!("Messages 流返回错误事件: {}", error);
                Ok(None)
            }
        }
    }

    fn text_chunk(&self, text: String) -> Frame {
        self.chunk(
            Delta {
                role: None,
                content: Some(text),
            },
            None,
            None,
        )
    }

    fn chunk(&self, delta: Delta, finish_reason: Option<String>, usage: Option<Usage>) -> Frame {
        Frame::Chunk(ChatStreamChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![StreamChoice {
                index: 0,
                delta,
                logprobs: None,
                finish_reason,
            }],
            usage,
        })
    }
}
