//! 聊天请求路由：解析 provider/model，走直连或聚合网关，再映射或转码响应。

use crate::aggregator::{rewrite_universal_item, Aggregator, UniversalItem};
use crate::catalog::{self, CatalogReport};
use crate::config::{parse_model_string, Config};
use crate::credentials::coordinator::RotationCoordinator;
use crate::credentials::CredentialPool;
use crate::providers::registry::{self, ProviderRegistry};
use crate::providers::ProviderAdapter;
use crate::proxy::{self, ProxyRequest};
use crate::status::{self, StatusFlags, StatusReport};
use crate::streaming::{pipe, SseStream};
use crate::transport::{Headers, HttpTransport, ResponseDescriptor, Transport};
use crate::types::ChatRequest;
use crate::{RelayError, Result};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// 聊天请求的结果
pub enum ChatReply {
    Json(Value),
    Stream(SseStream),
}

impl std::fmt::Debug for ChatReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatReply::Json(value) => f.debug_tuple("Json").field(value).finish(),
            ChatReply::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// 路由入口，持有注册表、出站传输与可选的聚合网关
pub struct Gateway {
    registry: ProviderRegistry,
    transport: Arc<dyn Transport>,
    aggregator: Option<Aggregator>,
    default_model: Option<String>,
    global_round_robin: bool,
    served_coordinator: Option<Arc<dyn RotationCoordinator>>,
}

impl Gateway {
    pub fn new(registry: ProviderRegistry, transport: Arc<dyn Transport>) -> Self {
        Self {
            registry,
            transport,
            aggregator: None,
            default_model: None,
            global_round_robin: false,
            served_coordinator: None,
        }
    }

    /// 由配置装配：凭据源、协调器、注册表、传输与聚合网关
    pub fn from_config(config: &Config) -> Result<Self> {
        let served = config
            .rotation
            .serve_coordinator
            .then(|| registry::local_coordinator(config));

        let mut pool = CredentialPool::new(registry::credential_source(config));
        if let Some(coordinator) = registry::pool_coordinator(config, served.as_ref()) {
            pool = pool.with_coordinator(coordinator);
        }
        let pool = Arc::new(pool);

        let registry = ProviderRegistry::from_config(config, pool.clone())?;
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new()?);

        let mut gateway = Self::new(registry, transport)
            .with_default_model(config.default_model.clone());
        gateway.global_round_robin = pool.is_distributed();
        gateway.served_coordinator = served;
        if let Some(aggregator) = &config.aggregator {
            gateway = gateway.with_aggregator(Aggregator::new(aggregator.clone()));
        }
        Ok(gateway)
    }

    pub fn with_aggregator(mut self, aggregator: Aggregator) -> Self {
        self.aggregator = Some(aggregator);
        self
    }

    pub fn with_default_model(mut self, default_model: Option<String>) -> Self {
        self.default_model = default_model;
        self
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn aggregator(&self) -> Option<&Aggregator> {
        self.aggregator.as_ref()
    }

    /// 对外提供 /rotation/next-index 时使用的协调器
    pub fn served_coordinator(&self) -> Option<&Arc<dyn RotationCoordinator>> {
        self.served_coordinator.as_ref()
    }

    /// "default" 解析为默认模型
    pub fn resolve_model(&self, model: &str) -> Result<(String, String)> {
        if model == "default" {
            let default_model = self
                .default_model
                .as_deref()
                .ok_or_else(|| RelayError::InvalidModelString("未配置 default_model".into()))?;
            return parse_model_string(default_model);
        }
        parse_model_string(model)
    }

    pub async fn chat_completions(&self, mut request: ChatRequest, headers: Headers) -> Result<ChatReply> {
        let (provider, model) = self.resolve_model(&request.model)?;
        let adapter = self.registry.get(&provider)?;
        request.model = model.clone();
        let stream = request.is_stream();

        let response = match &self.aggregator {
            Some(aggregator) if aggregator.supports(adapter) => {
                self.send_via_aggregator(aggregator, adapter, &request, headers).await?
            }
            _ => self.send_direct(adapter, &request, headers).await?,
        };
        let response = response.error_for_status(adapter.name()).await?;

        if stream {
            return Ok(ChatReply::Stream(pipe(response.body, adapter.transcoder(&model))));
        }

        let data = response
            .json::<Value>()
            .await
            .and_then(|data| adapter.map_chat_response(data, &model))
            .map_err(|e| vendor_body_error(adapter.name(), e))?;
        Ok(ChatReply::Json(data))
    }

    async fn send_direct(
        &self,
        adapter: &ProviderAdapter,
        request: &ChatRequest,
        headers: Headers,
    ) -> Result<ResponseDescriptor> {
        let (path, descriptor) = adapter
            .build_chat_completions_request(request, headers, None)
            .await?;
        let url = adapter.url(&path);
        debug!("直连 {}: {}", adapter.name(), url);
        self.transport.fetch(&url, descriptor).await
    }

    async fn send_via_aggregator(
        &self,
        aggregator: &Aggregator,
        adapter: &ProviderAdapter,
        request: &ChatRequest,
        headers: Headers,
    ) -> Result<ResponseDescriptor> {
        let batch = aggregator.build_batch(adapter, request, headers).await?;
        let (url, descriptor) = aggregator.build_request(&batch)?;
        debug!("经聚合网关发送 {} 个变体: {}", batch.len(), adapter.name());
        self.transport.fetch(&url, descriptor).await
    }

    /// 透传到单个提供商，上游响应（含非 2xx）原样返回
    pub async fn proxy(&self, provider: &str, request: ProxyRequest) -> Result<ResponseDescriptor> {
        let adapter = self.registry.get(provider)?;
        let (url, descriptor) =
            proxy::build_request(adapter, self.aggregator.as_ref(), request).await?;
        debug!("透传 {} {}: {}", descriptor.method, adapter.name(), url);
        self.transport.fetch(&url, descriptor).await
    }

    /// 通用端点：补全调用方的批次后提交给聚合网关
    pub async fn universal(&self, items: Vec<UniversalItem>) -> Result<ResponseDescriptor> {
        let aggregator = self
            .aggregator
            .as_ref()
            .ok_or_else(|| RelayError::config("未配置聚合网关"))?;

        let mut batch = Vec::with_capacity(items.len());
        for item in items {
            batch.push(rewrite_universal_item(&self.registry, item).await?);
        }

        let (url, descriptor) = aggregator.build_request(&batch)?;
        debug!("通用端点提交 {} 项", batch.len());
        self.transport.fetch(&url, descriptor).await
    }

    pub async fn list_models(&self) -> CatalogReport {
        catalog::list_models(&self.registry, self.transport.as_ref()).await
    }

    pub async fn status(&self) -> StatusReport {
        let flags = StatusFlags {
            default_model: self.default_model.clone(),
            aggregator: self.aggregator.is_some(),
            global_round_robin: self.global_round_robin,
        };
        status::build_report(flags, &self.registry, self.transport.as_ref()).await
    }
}

/// 厂商响应体无法解析属于上游故障，不是调用方请求错误
fn vendor_body_error(provider: &str, err: RelayError) -> RelayError {
    match err {
        RelayError::JsonError(e) => RelayError::upstream(
            502,
            format!("{} 返回了无法解析的响应: {}", provider, e),
        ),
        other => other,
    }
}
