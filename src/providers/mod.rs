pub mod anthropic;
pub mod cohere;
pub mod models;
pub mod openai;
pub mod registry;
pub mod routing;

use crate::credentials::CredentialPool;
use crate::error::RelayError;
use crate::streaming::Transcoder;
use crate::transport::{merge_headers, Headers, RequestDescriptor};
use crate::types::{ChatRequest, ModelList};
use crate::Result;
use serde_json::Value;
use std::sync::Arc;

/// OpenAI Chat Completions 全量参数
pub const DEFAULT_SUPPORTED_PARAMETERS: &[&str] = &[
    "messages",
    "model",
    "store",
    "metadata",
    "frequency_penalty",
    "logit_bias",
    "logprobs",
    "max_tokens",
    "max_completion_tokens",
    "n",
    "modalities",
    "prediction",
    "audio",
    "presence_penalty",
    "response_format",
    "seed",
    "service_tier",
    "stop",
    "stream",
    "stream_options",
    "suffix",
    "temperature",
    "top_p",
    "tools",
    "tool_choice",
    "parallel_tool_calls",
    "user",
    "function_call",
    "functions",
];

const CEREBRAS_SUPPORTED_PARAMETERS: &[&str] = &[
    "messages",
    "model",
    "store",
    "metadata",
    "max_tokens",
    "max_completion_tokens",
    "n",
    "modalities",
    "prediction",
    "audio",
    "response_format",
    "seed",
    "stop",
    "stream",
    "stream_options",
    "suffix",
    "temperature",
    "top_p",
    "tools",
    "tool_choice",
    "user",
    "function_call",
    "functions",
];

const GOOGLE_AI_STUDIO_SUPPORTED_PARAMETERS: &[&str] = &[
    "messages",
    "model",
    "max_tokens",
    "max_completion_tokens",
    "n",
    "response_format",
    "stop",
    "stream",
    "stream_options",
    "temperature",
    "top_p",
    "tools",
    "tool_choice",
];

/// 请求体的方言
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// 原生 OpenAI 线格式，只做参数过滤
    OpenAi,
    /// Messages 风格（system 顶层字段、内容块、SSE 事件名）
    Messages,
    /// v2 chat 风格
    V2Chat,
}

/// 鉴权头的构造方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Bearer,
    /// x-api-key + anthropic-version
    ApiKeyHeader,
    /// Authorization: Token
    Token,
}

/// 模型列表的厂商格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelListFormat {
    OpenAi,
    Anthropic,
    Cohere,
    GoogleAiStudio,
    WorkersAi,
}

/// 在上游聚合网关中的接入方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorRoute {
    /// 通过 compat 提供商走 OpenAI 兼容接口
    Compat,
    /// 使用厂商自己的 slug 与路径
    Native,
}

/// 自定义 OpenAI 兼容端点
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomEndpoint {
    pub name: String,
    pub base_url: String,
    pub credential: String,
}

/// 已知厂商（封闭集合），默认行为由 OpenAI 兼容分支提供，各厂商只覆盖差异
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Vendor {
    OpenAi,
    Anthropic,
    Cerebras,
    Cohere,
    DeepSeek,
    GoogleAiStudio,
    Grok,
    Groq,
    HuggingFace,
    Mistral,
    OpenRouter,
    PerplexityAi,
    Replicate,
    WorkersAi { account_id: String },
    Custom(CustomEndpoint),
}

impl Vendor {
    pub fn name(&self) -> &str {
        match self {
            Vendor::OpenAi => "openai",
            Vendor::Anthropic => "anthropic",
            Vendor::Cerebras => "cerebras",
            Vendor::Cohere => "cohere",
            Vendor::DeepSeek => "deepseek",
            Vendor::GoogleAiStudio => "google-ai-studio",
            Vendor::Grok => "grok",
            Vendor::Groq => "groq",
            Vendor::HuggingFace => "huggingface",
            Vendor::Mistral => "mistral",
            Vendor::OpenRouter => "openrouter",
            Vendor::PerplexityAi => "perplexity-ai",
            Vendor::Replicate => "replicate",
            Vendor::WorkersAi { .. } => "workers-ai",
            Vendor::Custom(custom) => &custom.name,
        }
    }

    /// 凭据源中的名字
    pub fn credential_name(&self) -> String {
        match self {
            Vendor::PerplexityAi => "PERPLEXITYAI_API_KEY".to_string(),
            Vendor::Custom(custom) => custom.credential.clone(),
            other => format!("{}_API_KEY", other.name().to_uppercase().replace('-', "_")),
        }
    }

    pub fn default_base_url(&self) -> String {
        match self {
            Vendor::OpenAi => "https://api.openai.com/v1".into(),
            Vendor::Anthropic => "https://api.anthropic.com".into(),
            Vendor::Cerebras => "https://api.cerebras.ai/v1".into(),
            Vendor::Cohere => "https://api.cohere.com".into(),
            Vendor::DeepSeek => "https://api.deepseek.com".into(),
            Vendor::GoogleAiStudio => "https://generativelanguage.googleapis.com".into(),
            Vendor::Grok => "https://api.x.ai".into(),
            Vendor::Groq => "https://api.groq.com/openai/v1".into(),
            Vendor::HuggingFace => "https://router.huggingface.co/v1".into(),
            Vendor::Mistral => "https://api.mistral.ai".into(),
            Vendor::OpenRouter => "https://openrouter.ai/api".into(),
            Vendor::PerplexityAi => "https://api.perplexity.ai".into(),
            Vendor::Replicate => "https://api.replicate.com/v1".into(),
            Vendor::WorkersAi { account_id } => format!(
                "https://api.cloudflare.com/client/v4/accounts/{}/ai",
                account_id
            ),
            Vendor::Custom(custom) => custom.base_url.clone(),
        }
    }

    /// 聊天补全路径，None 表示不支持
    pub fn chat_path(&self) -> Option<&'static str> {
        match self {
            Vendor::Anthropic => Some("/v1/messages"),
            Vendor::Cohere => Some("/v2/chat"),
            Vendor::GoogleAiStudio => Some("/v1beta/openai/chat/completions"),
            Vendor::Grok | Vendor::Mistral | Vendor::OpenRouter | Vendor::WorkersAi { .. } => {
                Some("/v1/chat/completions")
            }
            Vendor::Replicate => None,
            _ => Some("/chat/completions"),
        }
    }

    /// 模型列表路径，None 表示不支持
    pub fn models_path(&self) -> Option<&'static str> {
        match self {
            Vendor::Anthropic | Vendor::Grok | Vendor::Mistral | Vendor::OpenRouter => {
                Some("/v1/models")
            }
            Vendor::Cohere => Some("/v1/models?page_size=100&endpoint=chat"),
            Vendor::GoogleAiStudio => Some("/v1beta/openai/models"),
            Vendor::WorkersAi { .. } => Some("/models/search?task=Text%20Generation"),
            Vendor::HuggingFace | Vendor::PerplexityAi | Vendor::Replicate => None,
            _ => Some("/models"),
        }
    }

    pub fn supported_parameters(&self) -> &'static [&'static str] {
        match self {
            Vendor::Anthropic => anthropic::SUPPORTED_PARAMETERS,
            Vendor::Cohere => cohere::SUPPORTED_PARAMETERS,
            Vendor::Cerebras => CEREBRAS_SUPPORTED_PARAMETERS,
            Vendor::GoogleAiStudio => GOOGLE_AI_STUDIO_SUPPORTED_PARAMETERS,
            _ => DEFAULT_SUPPORTED_PARAMETERS,
        }
    }

    pub fn dialect(&self) -> Dialect {
        match self {
            Vendor::Anthropic => Dialect::Messages,
            Vendor::Cohere => Dialect::V2Chat,
            _ => Dialect::OpenAi,
        }
    }

    pub fn auth_scheme(&self) -> AuthScheme {
        match self {
            Vendor::Anthropic => AuthScheme::ApiKeyHeader,
            Vendor::Replicate => AuthScheme::Token,
            _ => AuthScheme::Bearer,
        }
    }

    pub fn model_format(&self) -> ModelListFormat {
        match self {
            Vendor::Anthropic => ModelListFormat::Anthropic,
            Vendor::Cohere => ModelListFormat::Cohere,
            Vendor::GoogleAiStudio => ModelListFormat::GoogleAiStudio,
            Vendor::WorkersAi { .. } => ModelListFormat::WorkersAi,
            _ => ModelListFormat::OpenAi,
        }
    }

    /// 上游聚合网关是否支持该厂商
    pub fn aggregator_route(&self) -> Option<AggregatorRoute> {
        match self {
            Vendor::OpenAi
            | Vendor::Cerebras
            | Vendor::DeepSeek
            | Vendor::GoogleAiStudio
            | Vendor::Grok
            | Vendor::Groq
            | Vendor::Mistral
            | Vendor::OpenRouter
            | Vendor::WorkersAi { .. } => Some(AggregatorRoute::Compat),
            Vendor::Anthropic
            | Vendor::Cohere
            | Vendor::HuggingFace
            | Vendor::PerplexityAi
            | Vendor::Replicate => Some(AggregatorRoute::Native),
            Vendor::Custom(_) => None,
        }
    }

    /// 自定义端点不配置密钥也可用
    pub fn credential_optional(&self) -> bool {
        matches!(self, Vendor::Custom(_))
    }
}

/// 单个厂商的适配器：厂商描述 + base URL + 共享凭据池
#[derive(Clone)]
pub struct ProviderAdapter {
    vendor: Vendor,
    base_url: String,
    pool: Arc<CredentialPool>,
}

impl std::fmt::Debug for ProviderAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderAdapter")
            .field("vendor", &self.vendor)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ProviderAdapter {
    pub fn new(vendor: Vendor, pool: Arc<CredentialPool>) -> Self {
        let base_url = vendor.default_base_url();
        Self {
            vendor,
            base_url,
            pool,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn vendor(&self) -> &Vendor {
        &self.vendor
    }

    pub fn name(&self) -> &str {
        self.vendor.name()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn credential_name(&self) -> String {
        self.vendor.credential_name()
    }

    pub fn supported_parameters(&self) -> &'static [&'static str] {
        self.vendor.supported_parameters()
    }

    pub fn available(&self) -> bool {
        self.vendor.credential_optional() || self.pool.is_available(&self.credential_name())
    }

    /// 由凭据值构造鉴权头
    pub fn auth_headers(&self, credential: &str) -> Headers {
        let mut headers = Headers::new();
        headers.insert("content-type".into(), "application/json".into());
        if credential.is_empty() {
            return headers;
        }
        match self.vendor.auth_scheme() {
            AuthScheme::Bearer => {
                headers.insert("authorization".into(), format!("Bearer {}", credential));
            }
            AuthScheme::ApiKeyHeader => {
                headers.insert("x-api-key".into(), credential.to_string());
                headers.insert("anthropic-version".into(), anthropic::API_VERSION.into());
            }
            AuthScheme::Token => {
                headers.insert("authorization".into(), format!("Token {}", credential));
            }
        }
        headers
    }

    /// 解析凭据并构造请求头：指定索引时确定性取值，否则按轮换策略
    pub async fn headers(&self, credential_index: Option<usize>) -> Result<Headers> {
        let name = self.credential_name();
        if self.vendor.credential_optional() && !self.pool.is_available(&name) {
            return Ok(self.auth_headers(""));
        }
        let credential = match credential_index {
            Some(index) => self.pool.get(&name, index)?,
            None => self.pool.resolve(&name).await?,
        };
        Ok(self.auth_headers(&credential))
    }

    /// 把 OpenAI 请求体转换为厂商请求体
    pub fn translate_request(&self, request: &ChatRequest) -> Result<Value> {
        match self.vendor.dialect() {
            Dialect::OpenAi => openai::filter_request(request, self.supported_parameters()),
            Dialect::Messages => anthropic::convert_request(request),
            Dialect::V2Chat => cohere::convert_request(request),
        }
    }

    pub async fn build_chat_completions_request(
        &self,
        request: &ChatRequest,
        extra_headers: Headers,
        credential_index: Option<usize>,
    ) -> Result<(String, RequestDescriptor)> {
        let path = self
            .vendor
            .chat_path()
            .ok_or_else(|| RelayError::not_supported(self.name(), "chat completions"))?;
        let body = self.translate_request(request)?;
        let headers = merge_headers(extra_headers, self.headers(credential_index).await?);
        Ok((path.to_string(), RequestDescriptor::post(headers, body)))
    }

    pub async fn build_models_request(
        &self,
        credential_index: Option<usize>,
    ) -> Result<(String, RequestDescriptor)> {
        let path = self
            .vendor
            .models_path()
            .ok_or_else(|| RelayError::not_supported(self.name(), "models"))?;
        let headers = self.headers(credential_index).await?;
        Ok((path.to_string(), RequestDescriptor::get(headers)))
    }

    /// 以指定凭据值构造模型列表请求（状态检查逐个探测密钥）
    pub fn build_models_request_with(&self, credential: &str) -> Result<(String, RequestDescriptor)> {
        let path = self
            .vendor
            .models_path()
            .ok_or_else(|| RelayError::not_supported(self.name(), "models"))?;
        Ok((path.to_string(), RequestDescriptor::get(self.auth_headers(credential))))
    }

    pub fn models_to_openai_format(&self, data: Value) -> Result<ModelList> {
        models::to_openai_format(self.vendor.model_format(), self.name(), data)
    }

    /// 非流式响应映射；OpenAI 方言原样返回
    pub fn map_chat_response(&self, data: Value, model: &str) -> Result<Value> {
        match self.vendor.dialect() {
            Dialect::OpenAi => Ok(data),
            Dialect::Messages => Ok(serde_json::to_value(anthropic::convert_response(
                serde_json::from_value(data)?,
            )?)?),
            Dialect::V2Chat => Ok(serde_json::to_value(cohere::convert_response(
                serde_json::from_value(data)?,
                model,
            )?)?),
        }
    }

    /// 流式转码器；OpenAI 方言不需要转码
    pub fn transcoder(&self, model: &str) -> Option<Transcoder> {
        match self.vendor.dialect() {
            Dialect::OpenAi => None,
            Dialect::Messages => Some(Transcoder::Messages(anthropic::MessagesTranscoder::new(
                model,
            ))),
            Dialect::V2Chat => Some(Transcoder::V2Chat(cohere::V2ChatTranscoder::new(model))),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}
