//! 出站 HTTP 传输：`fetch(url, request) -> response`

use crate::error::RelayError;
use crate::Result;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt, TryStreamExt};
use hyper::body::Bytes;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::time::Duration;

/// 请求头（按名称排序，便于断言）
pub type Headers = BTreeMap<String, String>;

/// 上游响应体字节流
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// 两次读取之间的最长空闲时间
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// 错误响应体最多保留的字符数
pub const ERROR_BODY_LIMIT: usize = 4096;

/// 出站请求体
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Json(Value),
    /// 透传代理原样转发的字节
    Raw(Bytes),
}

impl RequestBody {
    pub fn into_json(self) -> Option<Value> {
        match self {
            RequestBody::Json(value) => Some(value),
            RequestBody::Raw(_) => None,
        }
    }
}

/// 出站请求描述
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    pub method: Method,
    pub headers: Headers,
    pub body: Option<RequestBody>,
}

impl RequestDescriptor {
    pub fn get(headers: Headers) -> Self {
        Self {
            method: Method::GET,
            headers,
            body: None,
        }
    }

    pub fn post(headers: Headers, body: Value) -> Self {
        Self {
            method: Method::POST,
            headers,
            body: Some(RequestBody::Json(body)),
        }
    }

    /// 任意方法，请求体为空时不发送
    pub fn raw(method: Method, headers: Headers, body: Bytes) -> Self {
        Self {
            method,
            headers,
            body: (!body.is_empty()).then_some(RequestBody::Raw(body)),
        }
    }
}

/// 上游响应描述
pub struct ResponseDescriptor {
    pub status: u16,
    pub headers: Headers,
    pub body: ByteStream,
}

impl std::fmt::Debug for ResponseDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseDescriptor")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl ResponseDescriptor {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 读取完整响应体
    pub async fn bytes(self) -> Result<Bytes> {
        let chunks: Vec<Bytes> = self.body.try_collect().await?;
        Ok(Bytes::from(chunks.concat()))
    }

    pub async fn json<T: DeserializeOwned>(self) -> Result<T> {
        let bytes = self.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// 读取响应体文本，限制长度
    pub async fn text_limited(self, limit: usize) -> String {
        match self.bytes().await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).chars().take(limit).collect(),
            Err(_) => String::new(),
        }
    }

    /// 非 2xx 时转为 UpstreamError
    pub async fn error_for_status(self, provider: &str) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        let status = self.status;
        let body = self.text_limited(ERROR_BODY_LIMIT).await;
        Err(RelayError::upstream(status, format!("{} API 错误: {}", provider, body)))
    }
}

/// 出站传输能力
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, url: &str, request: RequestDescriptor) -> Result<ResponseDescriptor>;
}

/// 基于 reqwest 的传输（连接池复用）
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        Self::with_timeouts(CONNECT_TIMEOUT, READ_TIMEOUT)
    }

    /// 不设整体超时：流式响应可以持续任意时长，只要两次读取间隔不超过 `read`
    pub fn with_timeouts(connect: Duration, read: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect)
            .read_timeout(read)
            .pool_max_idle_per_host(10)
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, url: &str, request: RequestDescriptor) -> Result<ResponseDescriptor> {
        let mut builder = self.client.request(request.method, url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        match request.body {
            Some(RequestBody::Json(body)) => builder = builder.json(&body),
            Some(RequestBody::Raw(body)) => builder = builder.body(body),
            None => {}
        }

        let response = builder.send().await?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes_stream().map_err(RelayError::HttpError).boxed();

        Ok(ResponseDescriptor {
            status,
            headers,
            body,
        })
    }
}

/// 合并请求头，后者覆盖前者
pub fn merge_headers(base: Headers, overrides: Headers) -> Headers {
    let mut merged = base;
    merged.extend(overrides);
    merged
}
