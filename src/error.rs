use hyper::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("YAML 解析错误: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("JSON 解析错误: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP 请求错误: {0}")]
    HttpError(#[from] reqwest::Error),

    /// 提供商有意不提供该能力（预期情况，不是故障）
    #[error("提供商 {provider} 不支持 {capability}")]
    ProviderNotSupported { provider: String, capability: String },

    /// 请求使用了无法转换的特性（工具调用、多模态等）
    #[error("不支持的特性: {0}")]
    UnsupportedFeature(String),

    #[error("凭据池为空: {0}")]
    EmptyPool(String),

    #[error("未知的提供商: {0}")]
    UnknownProvider(String),

    #[error("无效的模型字符串: {0}")]
    InvalidModelString(String),

    #[error("上游 API 错误: {status} - {message}")]
    UpstreamError { status: u16, message: String },

    #[error("流处理错误: {0}")]
    StreamError(String),

    #[error("轮换协调器错误: {0}")]
    CoordinatorError(String),

    #[error("内部错误: {0}")]
    InternalError(String),
}

impl RelayError {
    pub fn config(msg: impl Into<String>) -> Self {
        RelayError::ConfigError(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        RelayError::InternalError(msg.into())
    }

    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        RelayError::UpstreamError {
            status,
            message: message.into(),
        }
    }

    pub fn not_supported(provider: impl Into<String>, capability: impl Into<String>) -> Self {
        RelayError::ProviderNotSupported {
            provider: provider.into(),
            capability: capability.into(),
        }
    }

    pub fn unsupported(feature: impl Into<String>) -> Self {
        RelayError::UnsupportedFeature(feature.into())
    }

    /// 直接调用方看到的 HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::ProviderNotSupported { .. }
            | RelayError::UnsupportedFeature(_)
            | RelayError::UnknownProvider(_)
            | RelayError::InvalidModelString(_)
            | RelayError::JsonError(_) => StatusCode::BAD_REQUEST,
            RelayError::EmptyPool(_) => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::UpstreamError { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            RelayError::HttpError(_) | RelayError::StreamError(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// OpenAI 风格错误体中的 type 字段
    pub fn error_type(&self) -> &'static str {
        match self {
            RelayError::ProviderNotSupported { .. } => "provider_not_supported",
            RelayError::UnsupportedFeature(_) => "unsupported_feature",
            RelayError::EmptyPool(_) => "credentials_unavailable",
            RelayError::UnknownProvider(_)
            | RelayError::InvalidModelString(_)
            | RelayError::JsonError(_) => "invalid_request_error",
            RelayError::UpstreamError { .. } => "upstream_error",
            _ => "relay_error",
        }
    }
}
