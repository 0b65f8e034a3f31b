use crate::aggregator::UniversalItem;
use crate::credentials::coordinator::{NextIndexRequest, NextIndexResponse};
use crate::error::RelayError;
use crate::metrics;
use crate::providers::routing::{ChatReply, Gateway};
use crate::proxy::ProxyRequest;
use crate::server::streaming::{error_body, into_frames};
use crate::streaming::SseStream;
use crate::transport::{Headers, ResponseDescriptor};
use crate::types::ChatRequest;
use futures_util::TryStreamExt;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

// 统一的 Body 类型，可以处理普通响应和流式响应
type BoxError = Box<dyn std::error::Error + Send + Sync>;
type BoxBody = http_body_util::combinators::UnsyncBoxBody<Bytes, BoxError>;

/// 不转发给上游的入站请求头
const DROPPED_HEADERS: &[&str] = &[
    "authorization",
    "x-api-key",
    "host",
    "content-length",
    "content-type",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "accept-encoding",
    "cookie",
];

/// 不回传给调用方的上游响应头
const HOP_BY_HOP_HEADERS: &[&str] = &["connection", "keep-alive", "transfer-encoding", "content-length"];

/// 处理 HTTP 请求的主路由
pub async fn handle_request(
    req: Request<hyper::body::Incoming>,
    gateway: Arc<Gateway>,
) -> Result<Response<BoxBody>, BoxError> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => Ok(health_check()),
        (&Method::GET, "/ping") => Ok(text(StatusCode::OK, "Pong")),
        (&Method::GET, "/models") | (&Method::GET, "/v1/models") => Ok(list_models(&gateway).await),
        (&Method::GET, "/status") => Ok(status(&gateway).await),
        (&Method::GET, "/metrics") => Ok(metrics_endpoint()),
        (&Method::POST, "/chat/completions") | (&Method::POST, "/v1/chat/completions") => {
            chat_completions(req, gateway).await
        }
        (&Method::POST, "/rotation/next-index") => next_index(req, gateway).await,
        (&Method::POST, "/") => universal(req, gateway).await,
        (_, path) => match proxy_provider(&gateway, path) {
            Some(provider) => proxy(req, gateway, provider).await,
            None => Ok(not_found()),
        },
    }
}

fn full(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<BoxBody> {
    let mut response = Response::new(
        Full::new(body.into())
            .map_err(|e| Box::new(e) as BoxError)
            .boxed_unsync(),
    );
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<BoxBody> {
    match serde_json::to_vec(value) {
        Ok(body) => full(status, "application/json", body),
        Err(e) => error_response(&RelayError::from(e)),
    }
}

fn text(status: StatusCode, body: &'static str) -> Response<BoxBody> {
    full(status, "text/plain", body)
}

fn error_response(err: &RelayError) -> Response<BoxBody> {
    full(
        err.status_code(),
        "application/json",
        error_body(err).to_string(),
    )
}

/// 健康检查端点
fn health_check() -> Response<BoxBody> {
    json_response(
        StatusCode::OK,
        &json!({
            "status": "ok",
            "service": "llm-relay"
        }),
    )
}

/// 合并所有提供商的模型
async fn list_models(gateway: &Gateway) -> Response<BoxBody> {
    let report = gateway.list_models().await;
    json_response(StatusCode::OK, &report.models)
}

async fn status(gateway: &Gateway) -> Response<BoxBody> {
    json_response(StatusCode::OK, &gateway.status().await)
}

/// 指标端点
fn metrics_endpoint() -> Response<BoxBody> {
    let body = metrics::global_metrics().export_prometheus();
    full(StatusCode::OK, "text/plain", body)
}

/// 可转发给上游的入站请求头
fn forwardable_headers(headers: &HeaderMap) -> Headers {
    headers
        .iter()
        .filter(|(name, _)| !DROPPED_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// 聊天完成端点
async fn chat_completions(
    req: Request<hyper::body::Incoming>,
    gateway: Arc<Gateway>,
) -> Result<Response<BoxBody>, BoxError> {
    let metrics = metrics::global_metrics();
    let headers = forwardable_headers(req.headers());

    // 读取请求体
    let whole_body = req.collect().await?.to_bytes();
    let chat_req: ChatRequest = match serde_json::from_slice(&whole_body) {
        Ok(chat_req) => chat_req,
        Err(e) => {
            metrics.record_failure();
            return Ok(error_response(&RelayError::from(e)));
        }
    };

    // 验证请求参数
    if let Err(e) = chat_req.validate() {
        metrics.record_failure();
        return Ok(json_response(
            StatusCode::BAD_REQUEST,
            &json!({
                "error": {
                    "message": e,
                    "type": "invalid_request_error"
                }
            }),
        ));
    }

    match gateway.chat_completions(chat_req, headers).await {
        Ok(ChatReply::Json(value)) => {
            metrics.record_success();
            Ok(json_response(StatusCode::OK, &value))
        }
        Ok(ChatReply::Stream(stream)) => {
            metrics.record_success();
            metrics.record_stream();
            Ok(sse_response(stream))
        }
        Err(e) => {
            metrics.record_failure();
            tracing::warn!("聊天请求失败: {}", e);
            Ok(error_response(&e))
        }
    }
}

/// SSE 响应；SseStream 只实现 Send，body 不要求 Sync
fn sse_response(stream: SseStream) -> Response<BoxBody> {
    let body = BodyExt::map_err(StreamBody::new(into_frames(stream)), |never: std::convert::Infallible| -> BoxError {
        match never {}
    })
    .boxed_unsync();

    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no")); // 禁用 Nginx 缓冲
    response
}

/// 路径首段是已注册的提供商时走透传
fn proxy_provider(gateway: &Gateway, path: &str) -> Option<String> {
    let name = path.strip_prefix('/')?.split('/').next()?;
    gateway
        .registry()
        .get(name)
        .ok()
        .map(|adapter| adapter.name().to_string())
}

/// 按提供商透传端点
async fn proxy(
    req: Request<hyper::body::Incoming>,
    gateway: Arc<Gateway>,
    provider: String,
) -> Result<Response<BoxBody>, BoxError> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    let headers = forwardable_headers(req.headers());
    let body = req.collect().await?.to_bytes();

    let request = ProxyRequest {
        method,
        path,
        query,
        headers,
        body,
    };
    match gateway.proxy(&provider, request).await {
        Ok(upstream) => Ok(relay_response(upstream)),
        Err(e) => {
            tracing::warn!("透传 {} 失败: {}", provider, e);
            Ok(error_response(&e))
        }
    }
}

/// 通用端点；未配置聚合网关时不存在
async fn universal(
    req: Request<hyper::body::Incoming>,
    gateway: Arc<Gateway>,
) -> Result<Response<BoxBody>, BoxError> {
    if gateway.aggregator().is_none() {
        return Ok(not_found());
    }

    let whole_body = req.collect().await?.to_bytes();
    let items: Vec<UniversalItem> = match serde_json::from_slice(&whole_body) {
        Ok(items) => items,
        Err(e) => return Ok(error_response(&RelayError::from(e))),
    };

    match gateway.universal(items).await {
        Ok(upstream) => Ok(relay_response(upstream)),
        Err(e) => {
            tracing::warn!("通用端点请求失败: {}", e);
            Ok(error_response(&e))
        }
    }
}

/// 上游响应原样回传：状态码、响应头（除逐跳头）与流式响应体
fn relay_response(upstream: ResponseDescriptor) -> Response<BoxBody> {
    let ResponseDescriptor {
        status,
        headers,
        body,
    } = upstream;

    let body = StreamBody::new(body.map_ok(Frame::data).map_err(|e| -> BoxError { Box::new(e) }))
        .boxed_unsync();
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);

    for (name, value) in &headers {
        if HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}

/// 分布式轮询协调器端点
async fn next_index(
    req: Request<hyper::body::Incoming>,
    gateway: Arc<Gateway>,
) -> Result<Response<BoxBody>, BoxError> {
    let Some(coordinator) = gateway.served_coordinator() else {
        return Ok(not_found());
    };

    let whole_body = req.collect().await?.to_bytes();
    let request: NextIndexRequest = match serde_json::from_slice(&whole_body) {
        Ok(request) => request,
        Err(e) => return Ok(error_response(&RelayError::from(e))),
    };

    match coordinator.get_next_index(&request.name, request.length).await {
        Ok(index) => Ok(json_response(StatusCode::OK, &NextIndexResponse { index })),
        Err(e) => Ok(error_response(&e)),
    }
}

/// 404 响应
fn not_found() -> Response<BoxBody> {
    text(StatusCode::NOT_FOUND, "Not Found")
}
