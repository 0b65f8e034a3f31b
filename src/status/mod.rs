//! 状态报告：配置开关 + 每个提供商的可用性与逐个密钥的连通性探测。

use crate::credentials::mask_key;
use crate::providers::registry::ProviderRegistry;
use crate::providers::ProviderAdapter;
use crate::transport::Transport;
use futures_util::future::join_all;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyState {
    Valid,
    Invalid,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyStatus {
    pub key: String,
    pub status: KeyState,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub name: String,
    pub available: bool,
    pub keys: Vec<KeyStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusFlags {
    pub default_model: Option<String>,
    pub aggregator: bool,
    pub global_round_robin: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub config: StatusFlags,
    pub providers: Vec<ProviderStatus>,
}

/// 用单个密钥请求模型列表：2xx 有效，401/403 无效，其余未知，传输失败视为无效
pub async fn check_key(adapter: &ProviderAdapter, transport: &dyn Transport, key: &str) -> KeyState {
    let (path, request) = match adapter.build_models_request_with(key) {
        Ok(built) => built,
        Err(_) => return KeyState::Unknown,
    };

    match transport.fetch(&adapter.url(&path), request).await {
        Ok(response) if response.is_success() => KeyState::Valid,
        Ok(response) if response.status == 401 || response.status == 403 => KeyState::Invalid,
        Ok(_) => KeyState::Unknown,
        Err(e) => {
            debug!("{} 连通性检查失败: {}", adapter.name(), e);
            KeyState::Invalid
        }
    }
}

async fn provider_status(adapter: &ProviderAdapter, transport: &dyn Transport) -> ProviderStatus {
    let keys = adapter.pool().get_all(&adapter.credential_name());
    let states = join_all(keys.iter().map(|key| check_key(adapter, transport, key))).await;

    ProviderStatus {
        name: adapter.name().to_string(),
        available: adapter.available(),
        keys: keys
            .iter()
            .zip(states)
            .map(|(key, status)| KeyStatus {
                key: mask_key(key),
                status,
            })
            .collect(),
    }
}

pub async fn build_report(
    flags: StatusFlags,
    registry: &ProviderRegistry,
    transport: &dyn Transport,
) -> StatusReport {
    let providers = join_all(registry.iter().map(|adapter| provider_status(adapter, transport))).await;
    StatusReport {
        config: flags,
        providers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialPool;
    use crate::providers::{CustomEndpoint, Vendor};
    use crate::transport::HttpTransport;
    use mockito::{Matcher, Server};
    use std::collections::HashMap;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_key_states() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/models")
            .match_header("authorization", "Bearer good-key")
            .with_status(200)
            .with_body(r#"{"data":[]}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/models")
            .match_header("authorization", "Bearer bad-key")
            .with_status(401)
            .create_async()
            .await;
        server
            .mock("GET", "/models")
            .match_header("authorization", Matcher::Exact("Bearer flaky-key".into()))
            .with_status(500)
            .create_async()
            .await;

        let map: HashMap<String, String> = [(
            "DEEPSEEK_API_KEY".to_string(),
            "good-key,bad-key,flaky-key".to_string(),
        )]
        .into_iter()
        .collect();
        let pool = Arc::new(CredentialPool::from_map(map));
        let registry = ProviderRegistry::new()
            .with(ProviderAdapter::new(Vendor::DeepSeek, pool.clone()).with_base_url(server.url()))
            .unwrap()
            .with(ProviderAdapter::new(Vendor::Replicate, pool.clone()))
            .unwrap()
            .with(ProviderAdapter::new(
                Vendor::Custom(CustomEndpoint {
                    name: "down".into(),
                    base_url: "http://127.0.0.1:1".into(),
                    credential: "DEEPSEEK_API_KEY".into(),
                }),
                pool,
            ))
            .unwrap();

        let report = build_report(
            StatusFlags {
                default_model: None,
                aggregator: false,
                global_round_robin: false,
            },
            &registry,
            &HttpTransport::new().unwrap(),
        )
        .await;

        let deepseek = &report.providers[0];
        assert!(deepseek.available);
        let states: Vec<KeyState> = deepseek.keys.iter().map(|k| k.status).collect();
        assert_eq!(states, vec![KeyState::Valid, KeyState::Invalid, KeyState::Unknown]);
        assert_eq!(deepseek.keys[0].key, "*****key");

        let replicate = &report.providers[1];
        assert!(!replicate.available);
        assert!(replicate.keys.is_empty());

        let down = &report.providers[2];
        assert!(down.keys.iter().all(|k| k.status == KeyState::Invalid));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["providers"][0]["keys"][1]["status"], "invalid");
    }
}
