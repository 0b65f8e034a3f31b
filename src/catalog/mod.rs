//! 模型目录：并发拉取所有提供商的模型列表并合并。

use crate::error::RelayError;
use crate::metrics::global_metrics;
use crate::providers::registry::ProviderRegistry;
use crate::providers::ProviderAdapter;
use crate::transport::Transport;
use crate::types::{Model, ModelList};
use crate::Result;
use futures_util::future::join_all;
use serde_json::Value;
use tracing::error;

/// 单个提供商的失败记录
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogFailure {
    pub provider: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct CatalogReport {
    pub models: ModelList,
    pub failures: Vec<CatalogFailure>,
}

async fn fetch_models(adapter: &ProviderAdapter, transport: &dyn Transport) -> Result<ModelList> {
    let (path, request) = adapter.build_models_request(None).await?;
    let response = transport
        .fetch(&adapter.url(&path), request)
        .await?
        .error_for_status(adapter.name())
        .await?;
    let data: Value = response.json().await?;
    adapter.models_to_openai_format(data)
}

/// 按注册顺序合并，个别失败只贡献空列表
pub async fn list_models(registry: &ProviderRegistry, transport: &dyn Transport) -> CatalogReport {
    let results = join_all(registry.iter().map(|adapter| async move {
        if !adapter.available() {
            return Ok(ModelList::new(Vec::new()));
        }
        fetch_models(adapter, transport).await
    }))
    .await;

    let mut models = Vec::new();
    let mut failures = Vec::new();

    for (adapter, result) in registry.iter().zip(results) {
        match result {
            Ok(list) => models.extend(list.data.into_iter().map(|model| Model {
                id: format!("{}/{}", adapter.name(), model.id),
                ..model
            })),
            Err(RelayError::ProviderNotSupported { .. }) => {}
            Err(e) => {
                error!("获取 {} 模型列表失败: {}", adapter.name(), e);
                global_metrics().record_catalog_failure();
                failures.push(CatalogFailure {
                    provider: adapter.name().to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    CatalogReport {
        models: ModelList::new(models),
        failures,
    }
}
