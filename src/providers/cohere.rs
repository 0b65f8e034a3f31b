//! v2 chat 方言。请求只做白名单过滤，响应与流事件需要映射。

use crate::error::RelayError;
use crate::providers::openai::filter_request;
use crate::streaming::Frame;
use crate::types::{
    unix_now, ChatRequest, ChatResponse, ChatStreamChunk, Choice, Delta, ResponseMessage,
    StreamChoice, Usage,
};
use crate::Result;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

pub const SUPPORTED_PARAMETERS: &[&str] = &[
    "messages",
    "model",
    "response_format",
    "max_tokens",
    "max_completion_tokens",
    "stop",
    "temperature",
    "seed",
    "frequency_penalty",
    "presence_penalty",
    "stream",
];

pub fn convert_request(req: &ChatRequest) -> Result<Value> {
    filter_request(req, SUPPORTED_PARAMETERS)
}

pub fn map_finish_reason(reason: Option<&str>) -> &'static str {
    match reason {
        Some("MAX_TOKENS") => "length",
        Some("TOOL_CALL") => "tool_calls",
        _ => "stop",
    }
}

#[derive(Debug, Default, Deserialize)]
struct TokenCounts {
    #[serde(default)]
    input_tokens: f64,
    #[serde(default)]
    output_tokens: f64,
}

#[derive(Debug, Default, Deserialize)]
struct V2Usage {
    #[serde(default)]
    billed_units: Option<TokenCounts>,
    #[serde(default)]
    tokens: Option<TokenCounts>,
}

impl V2Usage {
    /// 优先使用计费单位
    fn to_openai(&self) -> Usage {
        let counts = self.billed_units.as_ref().or(self.tokens.as_ref());
        match counts {
            Some(c) => Usage::from_counts(c.input_tokens as u64, c.output_tokens as u64),
            None => Usage::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct V2Message {
    #[serde(default)]
    content: Vec<V2ContentBlock>,
    #[serde(default)]
    tool_calls: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct V2ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// v2 chat 非流式响应
#[derive(Debug, Deserialize)]
pub struct V2ChatResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    message: V2Message,
    #[serde(default)]
    usage: V2Usage,
}

/// 响应中没有模型名，使用请求的模型
pub fn convert_response(resp: V2ChatResponse, model: &str) -> Result<ChatResponse> {
    if resp.message.tool_calls.as_ref().is_some_and(|calls| !calls.is_empty()) {
        return Err(RelayError::unsupported("tool calls in response"));
    }

    let content = resp
        .message
        .content
        .iter()
        .filter(|block| block.kind == "text")
        .filter_map(|block| block.text.as_deref())
        .collect::<String>();

    Ok(ChatResponse {
        id: resp
            .id
            .unwrap_or_else(|| format!("chatcmpl-{}", Uuid::new_v4())),
        object: "chat.completion".to_string(),
        created: unix_now(),
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage::assistant(content),
            logprobs: None,
            finish_reason: Some(map_finish_reason(resp.finish_reason.as_deref()).to_string()),
        }],
        usage: resp.usage.to_openai(),
    })
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    message: Option<StreamDeltaMessage>,
    #[serde(default)]
    usage: Option<V2Usage>,
}

#[derive(Debug, Deserialize)]
struct StreamDeltaMessage {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<StreamDeltaContent>,
}

#[derive(Debug, Deserialize)]
struct StreamDeltaContent {
    #[serde(default)]
    text: Option<String>,
}

/// 单条 v2 chat 流的转码状态
#[derive(Debug)]
pub struct V2ChatTranscoder {
    id: String,
    model: String,
    created: u64,
    role: String,
}

impl V2ChatTranscoder {
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", Uuid::new_v4()),
            model: model.to_string(),
            created: unix_now(),
            role: "assistant".to_string(),
        }
    }

    pub fn on_event(&mut self, _event: &str, data: &str) -> Result<Option<Frame>> {
        if data.trim() == "[DONE]" {
            return Ok(Some(Frame::Done));
        }

        let event: StreamEvent = serde_json::from_str(data)
            .map_err(|e| RelayError::StreamError(format!("无法解析 v2 chat 事件: {}", e)))?;

        match event.kind.as_str() {
            "message-start" => {
                if let Some(id) = event.id.filter(|id| !id.is_empty()) {
                    self.id = id;
                }
                if let Some(role) = event
                    .delta
                    .and_then(|d| d.message)
                    .and_then(|m| m.role)
                {
                    self.role = role;
                }
                Ok(None)
            }
            "content-start" | "content-delta" => {
                let text = event
                    .delta
                    .and_then(|d| d.message)
                    .and_then(|m| m.content)
                    .and_then(|c| c.text)
                    .unwrap_or_default();
                Ok(Some(self.chunk(
                    Delta {
                        role: Some(self.role.clone()),
                        content: Some(text),
                    },
                    None,
                    None,
                )))
            }
            "message-end" => {
                let usage = event
                    .delta
                    .and_then(|d| d.usage)
                    .map(|u| u.to_openai())
                    .unwrap_or_default();
                Ok(Some(self.chunk(
                    Delta::default(),
                    Some("stop".to_string()),
                    Some(usage),
                )))
            }
            // content-end, tool-*, citation-*, debug 暂不映射
            _ => Ok(None),
        }
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
