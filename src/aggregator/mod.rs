//! 上游聚合网关的 fan-out 批次。
//!
//! 一次提交携带 1 + retry_count 个请求变体，每个变体使用不同轮换索引的凭据，
//! 由聚合网关按顺序重试。本模块只负责构造确定性的批次。

use crate::config::AggregatorConfig;
use crate::error::RelayError;
use crate::providers::registry::ProviderRegistry;
use crate::providers::{AggregatorRoute, ProviderAdapter};
use crate::transport::{Headers, RequestBody, RequestDescriptor};
use crate::types::ChatRequest;
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const COMPAT_PROVIDER: &str = "compat";
const COMPAT_ENDPOINT: &str = "chat/completions";

/// 批次中的一个变体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanOutDescriptor {
    pub provider: String,
    pub endpoint: String,
    pub headers: Headers,
    pub query: Value,
}

/// 调用方自带批次中的一项（通用端点 `POST /`）
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UniversalItem {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub headers: Option<Headers>,
    #[serde(default)]
    pub query: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct Aggregator {
    config: AggregatorConfig,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self { config }
    }

    pub fn retry_count(&self) -> usize {
        self.config.retry_count
    }

    /// 通用端点地址
    pub fn url(&self) -> String {
        format!(
            "{}/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.account_id,
            self.config.gateway_id
        )
    }

    /// 聚合网关上某个厂商的基础地址
    pub fn provider_url(&self, provider: &str) -> String {
        format!("{}/{}", self.url(), provider)
    }

    /// 聚合网关自身的鉴权头，未配置 token 时为空
    pub fn auth_headers(&self) -> Headers {
        let mut headers = Headers::new();
        if let Some(token) = self.config.token.as_deref().filter(|t| !t.is_empty()) {
            headers.insert("cf-aig-authorization".into(), format!("Bearer {}", token));
        }
        headers
    }

    pub fn supports(&self, adapter: &ProviderAdapter) -> bool {
        adapter.vendor().aggregator_route().is_some()
    }

    /// 构造批次：变体 i 使用凭据索引 start + i，start 来自 get_next
    pub async fn build_batch(
        &self,
        adapter: &ProviderAdapter,
        request: &ChatRequest,
        extra_headers: Headers,
    ) -> Result<Vec<FanOutDescriptor>> {
        let route = adapter
            .vendor()
            .aggregator_route()
            .ok_or_else(|| RelayError::not_supported(adapter.name(), "aggregator"))?;

        let start = adapter.pool().get_next(&adapter.credential_name()).await?;

        let mut batch = Vec::with_capacity(self.config.retry_count + 1);
        for offset in 0..=self.config.retry_count {
            let (path, descriptor) = adapter
                .build_chat_completions_request(request, extra_headers.clone(), Some(start + offset))
                .await?;
            let query = descriptor
                .body
                .and_then(RequestBody::into_json)
                .unwrap_or(Value::Null);

            batch.push(match route {
                AggregatorRoute::Compat => FanOutDescriptor {
                    provider: COMPAT_PROVIDER.to_string(),
                    endpoint: COMPAT_ENDPOINT.to_string(),
                    headers: descriptor.headers,
                    query: compat_query(query, adapter.name(), &request.model),
                },
                AggregatorRoute::Native => FanOutDescriptor {
                    provider: adapter.name().to_string(),
                    endpoint: path.trim_start_matches('/').to_string(),
                    headers: descriptor.headers,
                    query,
                },
            });
        }

        Ok(batch)
    }

    /// 批次 -> 通用端点请求
    pub fn build_request<T: Serialize>(&self, batch: &[T]) -> Result<(String, RequestDescriptor)> {
        let mut headers = self.auth_headers();
        headers.insert("content-type".into(), "application/json".into());
        Ok((
            self.url(),
            RequestDescriptor::post(headers, serde_json::to_value(batch)?),
        ))
    }
}

/// 补全通用端点批次中的一项。
///
/// 指定了 `provider` 时模型名原样保留；否则从 `query.model` 拆出 `provider/model`，
/// 拆出的提供商未注册时该项变为 `{}`，交由聚合网关拒绝。
/// `endpoint` 缺省为厂商的聊天路径（去掉开头的 `/`），`headers` 缺省为厂商鉴权头。
pub async fn rewrite_universal_item(registry: &ProviderRegistry, item: UniversalItem) -> Result<Value> {
    let model = item
        .query
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let (adapter, model) = match item.provider.as_deref() {
        Some(provider) => (registry.get(provider)?, model),
        None => {
            let (provider, rest) = model.split_once('/').unwrap_or((model.as_str(), ""));
            match registry.get(provider) {
                Ok(adapter) => (adapter, rest.to_string()),
                Err(_) => return Ok(Value::Object(Map::new())),
            }
        }
    };

    let endpoint = match item.endpoint {
        Some(endpoint) => endpoint,
        None => adapter
            .vendor()
            .chat_path()
            .map(|path| path.strip_prefix('/').unwrap_or(path))
            .unwrap_or(COMPAT_ENDPOINT)
            .to_string(),
    };
    let headers = match item.headers {
        Some(headers) => headers,
        None => adapter.headers(None).await?,
    };

    let mut query = item.query;
    query.insert("model".to_string(), Value::String(model));

    Ok(serde_json::to_value(FanOutDescriptor {
        provider: adapter.name().to_string(),
        endpoint,
        headers,
        query: Value::Object(query),
    })?)
}

fn compat_query(mut query: Value, provider: &str, model: &str) -> Value {
    if let Value::Object(map) = &mut query {
        map.insert(
            "model".to_string(),
            Value::String(format!("{}/{}", provider, model)),
        );
    }
    query
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialPool;
    use crate::providers::Vendor;
    use crate::types::Message;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn aggregator(retry_count: usize, token: Option<&str>) -> Aggregator {
        Aggregator::new(AggregatorConfig {
            account_id: "acc".into(),
            gateway_id: "gw".into(),
            token: token.map(str::to_string),
            base_url: "https://gateway.example/v1/".into(),
            retry_count,
        })
    }

    fn adapter(vendor: Vendor, name: &str, keys: &str) -> ProviderAdapter {
        let map: HashMap<String, String> = [(name.to_string(), keys.to_string())].into_iter().collect();
        ProviderAdapter::new(vendor, Arc::new(CredentialPool::from_map(map)))
    }

    fn bearer(descriptor: &FanOutDescriptor) -> &str {
        descriptor.headers["authorization"].as_str()
    }

    #[tokio::test]
    async fn test_compat_batch_rotates_credentials() {
        let groq = adapter(Vendor::Groq, "GROQ_API_KEY", "k1,k2,k3");
        let request = ChatRequest::new("llama3-8b", vec![Message::user("hi")]);

        let batch = aggregator(2, None)
            .build_batch(&groq, &request, Headers::new())
            .await
            .unwrap();

        assert_eq!(batch.len(), 3);
        let keys: std::collections::HashSet<&str> = batch.iter().map(bearer).collect();
        assert_eq!(keys.len(), 3);

        for descriptor in &batch {
            assert_eq!(descriptor.provider, "compat");
            assert_eq!(descriptor.endpoint, "chat/completions");
            assert_eq!(descriptor.query["model"], "groq/llama3-8b");
        }
    }

    #[tokio::test]
    async fn test_native_batch_uses_vendor_slug() {
        let anthropic = adapter(Vendor::Anthropic, "ANTHROPIC_API_KEY", "only");
        let request = ChatRequest::new("claude-3-opus", vec![Message::user("hi")]);

        let batch = aggregator(1, None)
            .build_batch(&anthropic, &request, Headers::new())
            .await
            .unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].provider, "anthropic");
        assert_eq!(batch[0].endpoint, "v1/messages");
        assert_eq!(batch[0].query["model"], "claude-3-opus");
        assert_eq!(batch[0].query["max_tokens"], 1024);
        assert_eq!(batch[1].headers["x-api-key"], "only");
    }

    #[tokio::test]
    async fn test_custom_provider_not_routed() {
        let custom = adapter(
            Vendor::Custom(crate::providers::CustomEndpoint {
                name: "local".into(),
                base_url: "http://localhost".into(),
                credential: "CUSTOM_LOCAL_API_KEY".into(),
            }),
            "CUSTOM_LOCAL_API_KEY",
            "x",
        );
        let agg = aggregator(0, None);
        assert!(!agg.supports(&custom));
    }

    fn registry() -> ProviderRegistry {
        let map: HashMap<String, String> = [
            ("ANTHROPIC_API_KEY".to_string(), "sk-ant".to_string()),
            ("GROQ_API_KEY".to_string(), "gsk".to_string()),
            ("REPLICATE_API_KEY".to_string(), "r8".to_string()),
        ]
        .into_iter()
        .collect();
        let pool = Arc::new(CredentialPool::from_map(map));
        ProviderRegistry::new()
            .with(ProviderAdapter::new(Vendor::Anthropic, pool.clone()))
            .unwrap()
            .with(ProviderAdapter::new(Vendor::Groq, pool.clone()))
            .unwrap()
            .with(ProviderAdapter::new(Vendor::Replicate, pool))
            .unwrap()
    }

    fn item(value: serde_json::Value) -> UniversalItem {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_universal_item_with_model_prefix() {
        let rewritten = rewrite_universal_item(
            &registry(),
            item(serde_json::json!({"query": {"model": "groq/meta/llama-3", "messages": []}})),
        )
        .await
        .unwrap();

        assert_eq!(rewritten["provider"], "groq");
        assert_eq!(rewritten["endpoint"], "chat/completions");
        assert_eq!(rewritten["headers"]["authorization"], "Bearer gsk");
        // 只去掉第一段
        assert_eq!(rewritten["query"]["model"], "meta/llama-3");
        assert_eq!(rewritten["query"]["messages"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_universal_item_with_explicit_provider() {
        let rewritten = rewrite_universal_item(
            &registry(),
            item(serde_json::json!({
                "provider": "anthropic",
                "headers": {"x-api-key": "caller-key"},
                "query": {"model": "claude-3-haiku", "max_tokens": 5}
            })),
        )
        .await
        .unwrap();

        assert_eq!(rewritten["provider"], "anthropic");
        assert_eq!(rewritten["endpoint"], "v1/messages");
        // 调用方自带的头不被替换
        assert_eq!(rewritten["headers"], serde_json::json!({"x-api-key": "caller-key"}));
        assert_eq!(rewritten["query"]["model"], "claude-3-haiku");
        assert_eq!(rewritten["query"]["max_tokens"], 5);
    }

    #[tokio::test]
    async fn test_universal_item_defaults() {
        let registry = registry();

        let rewritten = rewrite_universal_item(
            &registry,
            item(serde_json::json!({"provider": "replicate", "endpoint": "predictions", "query": {}})),
        )
        .await
        .unwrap();
        assert_eq!(rewritten["endpoint"], "predictions");
        assert_eq!(rewritten["query"]["model"], "");

        let rewritten = rewrite_universal_item(
            &registry,
            item(serde_json::json!({"provider": "replicate", "query": {}})),
        )
        .await
        .unwrap();
        assert_eq!(rewritten["endpoint"], "chat/completions");
    }

    #[tokio::test]
    async fn test_universal_item_unknown_provider() {
        let registry = registry();

        let rewritten = rewrite_universal_item(
            &registry,
            item(serde_json::json!({"query": {"model": "nope/x"}})),
        )
        .await
        .unwrap();
        assert_eq!(rewritten, serde_json::json!({}));

        let rewritten = rewrite_universal_item(&registry, item(serde_json::json!({"query": {}})))
            .await
            .unwrap();
        assert_eq!(rewritten, serde_json::json!({}));

        let err = rewrite_universal_item(
            &registry,
            item(serde_json::json!({"provider": "nope", "query": {}})),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RelayError::UnknownProvider(_)));
    }

    #[test]
    fn test_provider_url_and_auth_headers() {
        let agg = aggregator(0, Some("cf-token"));
        assert_eq!(agg.provider_url("anthropic"), "https://gateway.example/v1/acc/gw/anthropic");
        assert_eq!(agg.auth_headers()["cf-aig-authorization"], "Bearer cf-token");
        assert!(aggregator(0, Some("")).auth_headers().is_empty());
    }

    #[test]
    fn test_build_request_headers_and_url() {
        let agg = aggregator(0, Some("cf-token"));
        let batch = vec![FanOutDescriptor {
            provider: "compat".into(),
            endpoint: "chat/completions".into(),
            headers: Headers::new(),
            query: serde_json::json!({"model": "openai/gpt-4o"}),
        }];

        let (url, descriptor) = agg.build_request(&batch).unwrap();
        assert_eq!(url, "https://gateway.example/v1/acc/gw");
        assert_eq!(descriptor.headers["cf-aig-authorization"], "Bearer cf-token");
        let body = descriptor.body.and_then(RequestBody::into_json).unwrap();
        assert_eq!(body[0]["provider"], "compat");

        let (_, descriptor) = aggregator(0, None).build_request(&batch).unwrap();
        assert!(!descriptor.headers.contains_key("cf-aig-authorization"));
    }
}
