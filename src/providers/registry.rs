//! 提供商注册表：名称 -> 适配器，按注册顺序保存。

use crate::config::Config;
use crate::credentials::coordinator::{
    CounterCoordinator, FileCounterStore, HttpCoordinator, MemoryCounterStore, RotationCoordinator,
};
use crate::credentials::{CredentialPool, CredentialSource, EnvSource, LayeredSource};
use crate::error::RelayError;
use crate::providers::{CustomEndpoint, ProviderAdapter, Vendor};
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

const WORKERS_AI_ACCOUNT_ID: &str = "WORKERS_AI_ACCOUNT_ID";

/// 内置厂商，按注册顺序
pub fn builtin_vendors(workers_ai_account_id: &str) -> Vec<Vendor> {
    vec![
        Vendor::OpenAi,
        Vendor::Anthropic,
        Vendor::Cerebras,
        Vendor::Cohere,
        Vendor::DeepSeek,
        Vendor::GoogleAiStudio,
        Vendor::Grok,
        Vendor::Groq,
        Vendor::HuggingFace,
        Vendor::Mistral,
        Vendor::OpenRouter,
        Vendor::PerplexityAi,
        Vendor::Replicate,
        Vendor::WorkersAi {
            account_id: workers_ai_account_id.to_string(),
        },
    ]
}

#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    adapters: Vec<ProviderAdapter>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册适配器，名称必须唯一
    pub fn register(&mut self, adapter: ProviderAdapter) -> Result<()> {
        if self.adapters.iter().any(|a| a.name() == adapter.name()) {
            return Err(RelayError::config(format!(
                "提供商名称重复: {}",
                adapter.name()
            )));
        }
        self.adapters.push(adapter);
        Ok(())
    }

    pub fn with(mut self, adapter: ProviderAdapter) -> Result<Self> {
        self.register(adapter)?;
        Ok(self)
    }

    /// 从配置构建：内置厂商 + 自定义端点
    pub fn from_config(config: &Config, pool: Arc<CredentialPool>) -> Result<Self> {
        let account_id = config
            .workers_ai_account_id
            .clone()
            .or_else(|| EnvSource.raw(WORKERS_AI_ACCOUNT_ID))
            .unwrap_or_default();

        let mut registry = Self::new();
        for vendor in builtin_vendors(&account_id) {
            let mut adapter = ProviderAdapter::new(vendor, pool.clone());
            if let Some(base_url) = config.base_urls.get(adapter.name()) {
                adapter = adapter.with_base_url(base_url.clone());
            }
            registry.register(adapter)?;
        }

        for custom in &config.custom_providers {
            let vendor = Vendor::Custom(CustomEndpoint {
                name: custom.name.clone(),
                base_url: custom.base_url.trim_end_matches('/').to_string(),
                credential: custom.credential_name(),
            });
            registry.register(ProviderAdapter::new(vendor, pool.clone()))?;
        }

        info!("已注册 {} 个提供商", registry.len());
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Result<&ProviderAdapter> {
        self.adapters
            .iter()
            .find(|a| a.name() == name)
            .ok_or_else(|| RelayError::UnknownProvider(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProviderAdapter> {
        self.adapters.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.adapters.iter().map(ProviderAdapter::name).collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// 本进程内的计数器协调器：配置了计数文件则持久化，否则在内存中
pub fn local_coordinator(config: &Config) -> Arc<dyn RotationCoordinator> {
    match &config.rotation.counter_file {
        Some(path) => Arc::new(CounterCoordinator::new(FileCounterStore::new(path.clone()))),
        None => Arc::new(CounterCoordinator::new(MemoryCounterStore::default())),
    }
}

/// 凭据池使用的协调器：未开启全局轮询时为 None
pub fn pool_coordinator(
    config: &Config,
    served: Option<&Arc<dyn RotationCoordinator>>,
) -> Option<Arc<dyn RotationCoordinator>> {
    if !config.rotation.global_round_robin {
        return None;
    }
    match &config.rotation.coordinator_url {
        Some(url) => Some(Arc::new(HttpCoordinator::new(url.clone()))),
        None => Some(
            served
                .cloned()
                .unwrap_or_else(|| local_coordinator(config)),
        ),
    }
}

/// 凭据源：配置文件中的值优先，缺失时查环境变量
pub fn credential_source(config: &Config) -> Arc<dyn CredentialSource> {
    let mut values: HashMap<String, String> = config
        .credentials
        .iter()
        .map(|(name, value)| (name.clone(), value.to_raw()))
        .collect();

    for custom in &config.custom_providers {
        if let Some(keys) = &custom.api_keys {
            values.insert(custom.credential_name(), keys.to_raw());
        }
    }

    Arc::new(LayeredSource::new(values, EnvSource))
}
