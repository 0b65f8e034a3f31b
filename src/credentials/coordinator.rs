//! 分布式轮询协调器：按凭据名维护严格有序的计数器。

use crate::error::RelayError;
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;
use tokio::sync::Mutex;

/// getNextIndex(name, length) -> index
#[async_trait]
pub trait RotationCoordinator: Send + Sync {
    async fn get_next_index(&self, name: &str, length: usize) -> Result<usize>;
}

/// 计数器存储
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<usize>>;
    async fn store(&self, key: &str, value: usize) -> Result<()>;
}

/// 内存计数器
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: StdMutex<HashMap<String, usize>>,
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn load(&self, key: &str) -> Result<Option<usize>> {
        let counters = self
            .counters
            .lock()
            .map_err(|_| RelayError::CoordinatorError("计数器锁已中毒".into()))?;
        Ok(counters.get(key).copied())
    }

    async fn store(&self, key: &str, value: usize) -> Result<()> {
        let mut counters = self
            .counters
            .lock()
            .map_err(|_| RelayError::CoordinatorError("计数器锁已中毒".into()))?;
        counters.insert(key.to_string(), value);
        Ok(())
    }
}

/// JSON 文件持久化计数器，写入经临时文件 rename 保证原子
#[derive(Debug)]
pub struct FileCounterStore {
    path: PathBuf,
}

impl FileCounterStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read_all(&self) -> Result<HashMap<String, usize>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(HashMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl CounterStore for FileCounterStore {
    async fn load(&self, key: &str) -> Result<Option<usize>> {
        Ok(self.read_all().await?.get(key).copied())
    }

    async fn store(&self, key: &str, value: usize) -> Result<()> {
        let mut all = self.read_all().await?;
        all.insert(key.to_string(), value);
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(&all)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// 在计数器存储之上实现协调器，所有调用串行执行
pub struct CounterCoordinator<S> {
    store: S,
    lock: Mutex<()>,
}

impl<S: CounterStore> CounterCoordinator<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }
}

fn counter_key(name: &str) -> String {
    format!("counter:{}", name)
}

#[async_trait]
impl<S: CounterStore> RotationCoordinator for CounterCoordinator<S> {
    async fn get_next_index(&self, name: &str, length: usize) -> Result<usize> {
        if length <= 1 {
            return Ok(0);
        }

        let _guard = self.lock.lock().await;
        let key = counter_key(name);

        let mut index = self.store.load(&key).await?.unwrap_or(0);
        // 池缩小后从头开始
        if index >= length {
            index = 0;
        }

        let next = (index + 1) % length;
        self.store.store(&key, next).await?;

        Ok(index)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NextIndexRequest {
    pub name: String,
    pub length: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NextIndexResponse {
    pub index: usize,
}

/// 远程协调器客户端
#[derive(Debug, Clone)]
pub struct HttpCoordinator {
    url: String,
    client: Client,
}

impl HttpCoordinator {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl RotationCoordinator for HttpCoordinator {
    async fn get_next_index(&self, name: &str, length: usize) -> Result<usize> {
        let response = self
            .client
            .post(&self.url)
            .json(&NextIndexRequest {
                name: name.to_string(),
                length,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::CoordinatorError(format!(
                "协调器返回 {}",
                status.as_u16()
            )));
        }

        let body: NextIndexResponse = response.json().await?;
        Ok(body.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_counter_sequence_and_wrap() {
        let coordinator = CounterCoordinator::new(MemoryCounterStore::default());
        let mut got = Vec::new();
        for _ in 0..5 {
            got.push(coordinator.get_next_index("KEY", 3).await.unwrap());
        }
        assert_eq!(got, vec![0, 1, 2, 0, 1]);
    }

    #[tokio::test]
    async fn test_counter_resets_when_pool_shrinks() {
        let coordinator = CounterCoordinator::new(MemoryCounterStore::default());
        for _ in 0..3 {
            coordinator.get_next_index("KEY", 4).await.unwrap();
        }
        // 存储中的下一个索引是 3，池缩到 2 后应从 0 开始
        assert_eq!(coordinator.get_next_index("KEY", 2).await.unwrap(), 0);
        assert_eq!(coordinator.get_next_index("KEY", 2).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_single_key_short_circuits() {
        let coordinator = CounterCoordinator::new(MemoryCounterStore::default());
        assert_eq!(coordinator.get_next_index("KEY", 1).await.unwrap(), 0);
        assert_eq!(coordinator.store.load("counter:KEY").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_counters_are_keyed_by_name() {
        let coordinator = CounterCoordinator::new(MemoryCounterStore::default());
        assert_eq!(coordinator.get_next_index("A", 3).await.unwrap(), 0);
        assert_eq!(coordinator.get_next_index("B", 3).await.unwrap(), 0);
        assert_eq!(coordinator.get_next_index("A", 3).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_get_each_index_once_per_cycle() {
        let coordinator = Arc::new(CounterCoordinator::new(MemoryCounterStore::default()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.get_next_index("KEY", 8).await.unwrap() })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            seen.insert(handle.await.unwrap());
        }
        assert_eq!(seen.len(), 8);
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counters.json");

        let first = CounterCoordinator::new(FileCounterStore::new(&path));
        assert_eq!(first.get_next_index("KEY", 3).await.unwrap(), 0);
        assert_eq!(first.get_next_index("KEY", 3).await.unwrap(), 1);

        let second = CounterCoordinator::new(FileCounterStore::new(&path));
        assert_eq!(second.get_next_index("KEY", 3).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_http_coordinator_client() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/rotation/next-index")
            .match_body(mockito::Matcher::Json(
                serde_json::json!({"name": "KEY", "length": 3}),
            ))
            .with_status(200)
            .with_body(r#"{"index":2}"#)
            .create_async()
            .await;

        let client = HttpCoordinator::new(format!("{}/rotation/next-index", server.url()));
        assert_eq!(client.get_next_index("KEY", 3).await.unwrap(), 2);
        mock.assert_async().await;
    }
}
