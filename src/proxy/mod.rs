//! 按提供商透传：`/<provider>/<path>` 原样转发到厂商（或聚合网关上的该厂商），
//! 只替换鉴权头，不做任何请求或响应转换。

use crate::aggregator::Aggregator;
use crate::providers::ProviderAdapter;
use crate::transport::{merge_headers, Headers, RequestDescriptor};
use crate::Result;
use hyper::body::Bytes;
use reqwest::{Method, Url};

/// 入站透传请求
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// 含 `/<provider>` 前缀的入站路径
    pub path: String,
    pub query: Option<String>,
    pub headers: Headers,
    pub body: Bytes,
}

/// 去掉 `/<provider>` 前缀；路径以基础路径重复两次开头时去掉一份
pub fn target_path(provider: &str, path: &str, base_url: &str) -> String {
    let target = match path.strip_prefix('/').and_then(|p| p.strip_prefix(provider)) {
        Some("") => "/".to_string(),
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        _ => path.to_string(),
    };

    let base_path = Url::parse(base_url)
        .map(|url| url.path().trim_end_matches('/').to_string())
        .unwrap_or_default();
    if !base_path.is_empty() && target.starts_with(&base_path.repeat(2)) {
        return target[base_path.len()..].to_string();
    }
    target
}

/// 构造出站请求：入站头在下，厂商鉴权头覆盖其上
pub async fn build_request(
    adapter: &ProviderAdapter,
    aggregator: Option<&Aggregator>,
    request: ProxyRequest,
) -> Result<(String, RequestDescriptor)> {
    let mut headers = adapter.headers(None).await?;
    let base_url = match aggregator.filter(|a| a.supports(adapter)) {
        Some(aggregator) => {
            headers.extend(aggregator.auth_headers());
            aggregator.provider_url(adapter.name())
        }
        None => adapter.base_url().to_string(),
    };

    let mut url = format!(
        "{}{}",
        base_url,
        target_path(adapter.name(), &request.path, &base_url)
    );
    if let Some(query) = request.query.as_deref().filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }

    let headers = merge_headers(request.headers, headers);
    Ok((url, RequestDescriptor::raw(request.method, headers, request.body)))
}
