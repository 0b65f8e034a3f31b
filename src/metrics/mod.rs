use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// 进程级计数器
#[derive(Debug, Default)]
pub struct Metrics {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    streams_started: AtomicU64,
    catalog_failures: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录成功请求
    pub fn record_success(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录失败请求
    pub fn record_failure(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stream(&self) {
        self.streams_started.fetch_add(1, Ordering::Relaxed);
    }

    /// 模型目录中单个提供商失败
    pub fn record_catalog_failure(&self) {
        self.catalog_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// 导出 Prometheus 格式
    pub fn export_prometheus(&self) -> String {
        let counters = [
            ("llm_relay_requests_total", "Total number of chat requests", &self.total_requests),
            ("llm_relay_requests_successful", "Successful chat requests", &self.successful_requests),
            ("llm_relay_requests_failed", "Failed chat requests", &self.failed_requests),
            ("llm_relay_streams_started", "Streaming responses started", &self.streams_started),
            ("llm_relay_catalog_failures", "Provider model list failures", &self.catalog_failures),
        ];

        counters
            .iter()
            .map(|(name, help, value)| {
                format!(
                    "# HELP {name} {help}\n# TYPE {name} counter\n{name} {}\n",
                    value.load(Ordering::Relaxed)
                )
            })
            .collect()
    }
}

/// 获取全局指标实例
pub fn global_metrics() -> &'static Arc<Metrics> {
    use once_cell::sync::Lazy;
    static METRICS: Lazy<Arc<Metrics>> = Lazy::new(|| Arc::new(Metrics::new()));
    &METRICS
}
