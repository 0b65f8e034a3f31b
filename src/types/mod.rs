use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 请求中的生成参数集合（未知键原样保留，由各适配器按白名单过滤）
pub type ParameterBag = Map<String, Value>;

/// OpenAI 兼容的聊天请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(flatten)]
    pub params: ParameterBag,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            params: ParameterBag::new(),
        }
    }

    /// 设置生成参数
    pub fn with_param(mut self, key: &str, value: Value) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key).filter(|v| !v.is_null())
    }

    pub fn is_stream(&self) -> bool {
        self.param("stream").and_then(Value::as_bool).unwrap_or(false)
    }

    /// 转为扁平 JSON 对象
    pub fn to_bag(&self) -> crate::Result<ParameterBag> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Err(crate::RelayError::internal("请求未序列化为 JSON 对象")),
        }
    }

    /// 验证请求参数范围
    pub fn validate(&self) -> Result<(), String> {
        if let Some(temp) = self.param("temperature").and_then(Value::as_f64) {
            if !(0.0..=2.0).contains(&temp) {
                return Err(format!(
                    "temperature 必须在 0.0 到 2.0 之间，当前值: {}",
                    temp
                ));
            }
        }

        if let Some(top_p) = self.param("top_p").and_then(Value::as_f64) {
            if !(0.0..=1.0).contains(&top_p) {
                return Err(format!(
                    "top_p 必须在 0.0 到 1.0 之间，当前值: {}",
                    top_p
                ));
            }
        }

        if self.messages.is_empty() {
            return Err("messages 不能为空".to_string());
        }

        Ok(())
    }
}

/// 聊天消息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: String,
    #[serde(default)]
    pub content: Option<MessageContent>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// 消息内容：纯文本或结构化块列表
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// 结构化内容块，只解析 type，其余字段保留
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert("text".to_string(), Value::String(text.into()));
        Self {
            kind: "text".to_string(),
            fields,
        }
    }

    pub fn text_value(&self) -> Option<&str> {
        self.fields.get("text").and_then(Value::as_str)
    }
}

impl Message {
    fn with_text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(MessageContent::Text(content.into())),
            extra: Map::new(),
        }
    }

    /// 创建用户消息
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_text("user", content)
    }

    /// 创建助手消息
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_text("assistant", content)
    }

    /// 创建系统消息
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_text("system", content)
    }

    /// 文本内容（纯文本或全部 text 块拼接）
    pub fn text(&self) -> String {
        match &self.content {
            Some(MessageContent::Text(text)) => text.clone(),
            Some(MessageContent::Parts(parts)) => parts
                .iter()
                .filter_map(ContentPart::text_value)
                .collect::<Vec<_>>()
                .join(""),
            None => String::new(),
        }
    }
}

/// OpenAI 兼容的聊天响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

/// 响应选择
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: ResponseMessage,
    pub logprobs: Option<Value>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseMessage {
    pub role: String,
    pub content: Option<String>,
    pub refusal: Option<String>,
}

impl ResponseMessage {
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: Some(content.into()),
            refusal: None,
        }
    }
}

/// Token 使用统计，明细字段始终输出
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(default)]
    pub prompt_tokens_details: PromptTokensDetails,
    #[serde(default)]
    pub completion_tokens_details: CompletionTokensDetails,
}

impl Usage {
    /// 由输入输出计数重新计算 total
    pub fn from_counts(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PromptTokensDetails {
    #[serde(default)]
    pub cached_tokens: u64,
    #[serde(default)]
    pub audio_tokens: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompletionTokensDetails {
    #[serde(default)]
    pub reasoning_tokens: u64,
    #[serde(default)]
    pub audio_tokens: u64,
    #[serde(default)]
    pub accepted_prediction_tokens: u64,
    #[serde(default)]
    pub rejected_prediction_tokens: u64,
}

/// 流式响应数据块
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatStreamChunk {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<StreamChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// 流式响应选择
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChoice {
    pub index: u32,
    pub delta: Delta,
    pub logprobs: Option<Value>,
    pub finish_reason: Option<String>,
}

/// 流式响应增量
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// OpenAI 模型列表
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<Model>,
}

impl ModelList {
    pub fn new(data: Vec<Model>) -> Self {
        Self {
            object: "list".to_string(),
            data,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Model {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
    /// 厂商返回的原始模型对象
    #[serde(rename = "_", default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<Value>,
}

impl Model {
    pub fn new(id: impl Into<String>, created: i64, owned_by: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            object: "model".to_string(),
            created,
            owned_by: owned_by.into(),
            vendor: None,
        }
    }

    pub fn with_vendor(mut self, vendor: Value) -> Self {
        self.vendor = Some(vendor);
        self
    }
}

/// 当前 Unix 时间戳（秒）
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_constructors() {
        let user_msg = Message::user("Hello");
        assert_eq!(user_msg.role, "user");
        assert_eq!(user_msg.text(), "Hello");

        let system_msg = Message::system("You are helpful");
        assert_eq!(system_msg.role, "system");
    }

    #[test]
    fn test_chat_request_keeps_unknown_parameters() {
        let json = r#"{
            "model": "openai/gpt-4",
            "messages": [{"role": "user", "content": "Hello"}],
            "temperature": 0.8,
            "logit_bias": {"50256": -100},
            "made_up": true
        }"#;

        let req: ChatRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.model, "openai/gpt-4");
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.param("temperature"), Some(&json!(0.8)));
        assert_eq!(req.param("made_up"), Some(&json!(true)));

        let bag = req.to_bag().unwrap();
        assert!(bag.contains_key("logit_bias"));
        assert_eq!(bag["messages"], json!([{"role": "user", "content": "Hello"}]));
    }

    #[test]
    fn test_structured_content_round_trip() {
        let value = json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "describe"},
                {"type": "image_url", "image_url": {"url": "https://x/y.png"}}
            ]
        });
        let msg: Message = serde_json::from_value(value.clone()).unwrap();
        match &msg.content {
            Some(MessageContent::Parts(parts)) => {
                assert_eq!(parts.len(), 2);
                assert_eq!(parts[1].kind, "image_url");
            }
            other => panic!("unexpected content: {:?}", other),
        }
        assert_eq!(msg.text(), "describe");
        assert_eq!(serde_json::to_value(&msg).unwrap(), value);
    }

    #[test]
    fn test_usage_details_always_serialized() {
        let usage = Usage::from_counts(3, 4);
        let value = serde_json::to_value(&usage).unwrap();
        assert_eq!(value["total_tokens"], 7);
        assert_eq!(value["prompt_tokens_details"]["cached_tokens"], 0);
        assert_eq!(value["completion_tokens_details"]["reasoning_tokens"], 0);
    }

    #[test]
    fn test_response_refusal_is_null() {
        let resp = ChatResponse {
            id: "id".into(),
            object: "chat.completion".into(),
            created: 1,
            model: "m".into(),
            choices: vec![Choice {
                index: 0,
                message: ResponseMessage::assistant("hi"),
                logprobs: None,
                finish_reason: Some("stop".into()),
            }],
            usage: Usage::default(),
        };
        let value = serde_json::to_value(&resp).unwrap();
        assert!(value["choices"][0]["message"]["refusal"].is_null());
        assert!(value["choices"][0]
            .as_object()
            .unwrap()
            .contains_key("logprobs"));
    }

    #[test]
    fn test_stream_chunk_serialization() {
        let chunk = ChatStreamChunk {
            id: "chunk-1".to_string(),
            object: "chat.completion.chunk".to_string(),
            created: 1234567890,
            model: "gpt-4".to_string(),
            choices: vec![StreamChoice {
                index: 0,
                delta: Delta {
                    role: None,
                    content: Some("Hello".to_string()),
                },
                logprobs: None,
                finish_reason: None,
            }],
            usage: None,
        };

        let json = serde_json::to_string(&chunk).unwrap();
        assert!(json.contains("\"content\":\"Hello\""));
        assert!(!json.contains("\"role\""));
        assert!(!json.contains("\"usage\""));
    }

    #[test]
    fn test_validate() {
        let ok = ChatRequest::new("openai/gpt-4", vec![Message::user("t")])
            .with_param("temperature", json!(1.0));
        assert!(ok.validate().is_ok());

        let hot = ok.clone().with_param("temperature", json!(3.0));
        assert!(hot.validate().is_err());

        let top_p = ok.clone().with_param("top_p", json!(1.5));
        assert!(top_p.validate().is_err());

        let empty = ChatRequest::new("openai/gpt-4", vec![]);
        assert!(empty.validate().is_err());
    }
}
