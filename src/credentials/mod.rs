//! 凭据池：按名称解析一个或多个密钥，支持本地轮询与分布式轮询。

pub mod coordinator;

use crate::error::RelayError;
use crate::Result;
use coordinator::RotationCoordinator;
use rand::seq::SliceRandom;
use rand::RngCore;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// 凭据名 -> 原始配置值
pub trait CredentialSource: Send + Sync {
    fn raw(&self, name: &str) -> Option<String>;
}

impl CredentialSource for HashMap<String, String> {
    fn raw(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// 从进程环境变量读取
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSource;

impl CredentialSource for EnvSource {
    fn raw(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// 先查主源，缺失时回落到次源
pub struct LayeredSource<A, B> {
    primary: A,
    fallback: B,
}

impl<A, B> LayeredSource<A, B> {
    pub fn new(primary: A, fallback: B) -> Self {
        Self { primary, fallback }
    }
}

impl<A: CredentialSource, B: CredentialSource> CredentialSource for LayeredSource<A, B> {
    fn raw(&self, name: &str) -> Option<String> {
        self.primary.raw(name).or_else(|| self.fallback.raw(name))
    }
}

/// 随机源（需为密码学强度）
pub trait RandomSource: Send {
    fn next_u32(&mut self) -> u32;
}

/// 线程本地 CSPRNG
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRandom;

impl RandomSource for SystemRandom {
    fn next_u32(&mut self) -> u32 {
        rand::rng().next_u32()
    }
}

/// 拒绝采样得到 [0, len) 内的均匀索引，避免取模偏差
pub fn uniform_index(source: &mut dyn RandomSource, len: usize) -> usize {
    debug_assert!(len > 0);
    let len = len as u64;
    let range = 1u64 << 32;
    let limit = range - range % len;
    loop {
        let sample = u64::from(source.next_u32());
        if sample < limit {
            return (sample % len) as usize;
        }
    }
}

/// 解析原始配置值：JSON 数组、JSON 字符串、逗号分隔或单值
pub fn parse_credentials(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(serde_json::Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                serde_json::Value::String(s) => Some(s),
                serde_json::Value::Null => None,
                other => Some(other.to_string()),
            })
            .filter(|s| !s.is_empty())
            .collect(),
        Ok(serde_json::Value::String(s)) if !s.is_empty() => vec![s],
        _ => trimmed
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    }
}

/// 凭据池
///
/// 本地轮询游标按凭据名惰性创建：首次使用时打乱一次，之后每次读取把队首移到队尾。
/// 游标由互斥锁保护，锁内不做任何 IO。跨进程的严格顺序只由协调器保证，
/// 本地轮询在多实例部署下只是尽力而为的公平。
pub struct CredentialPool {
    source: Arc<dyn CredentialSource>,
    cursors: Mutex<HashMap<String, VecDeque<String>>>,
    coordinator: Option<Arc<dyn RotationCoordinator>>,
    random: Mutex<Box<dyn RandomSource>>,
}

impl CredentialPool {
    pub fn new(source: Arc<dyn CredentialSource>) -> Self {
        Self {
            source,
            cursors: Mutex::new(HashMap::new()),
            coordinator: None,
            random: Mutex::new(Box::new(SystemRandom)),
        }
    }

    pub fn from_map(values: HashMap<String, String>) -> Self {
        Self::new(Arc::new(values))
    }

    /// 挂接分布式协调器（启用全局轮询）
    pub fn with_coordinator(mut self, coordinator: Arc<dyn RotationCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn with_random(mut self, random: Box<dyn RandomSource>) -> Self {
        self.random = Mutex::new(random);
        self
    }

    pub fn is_distributed(&self) -> bool {
        self.coordinator.is_some()
    }

    /// 全部凭据，未配置时为空
    pub fn get_all(&self, name: &str) -> Vec<String> {
        self.source
            .raw(name)
            .map(|raw| parse_credentials(&raw))
            .unwrap_or_default()
    }

    pub fn is_available(&self, name: &str) -> bool {
        !self.get_all(name).is_empty()
    }

    /// 按索引取值：list[index mod len]，无内部状态
    pub fn get(&self, name: &str, index: usize) -> Result<String> {
        let all = self.get_all(name);
        if all.is_empty() {
            return Err(RelayError::EmptyPool(name.to_string()));
        }
        Ok(all[index % all.len()].clone())
    }

    /// 本地轮询：取队首并移到队尾
    pub fn rotate(&self, name: &str) -> Result<String> {
        let mut cursors = self
            .cursors
            .lock()
            .map_err(|_| RelayError::internal("凭据游标锁已中毒"))?;

        if !cursors.contains_key(name) {
            let mut all = self.get_all(name);
            if all.is_empty() {
                return Err(RelayError::EmptyPool(name.to_string()));
            }
            all.shuffle(&mut rand::rng());
            cursors.insert(name.to_string(), VecDeque::from(all));
        }

        let queue = cursors
            .get_mut(name)
            .ok_or_else(|| RelayError::EmptyPool(name.to_string()))?;
        let head = queue
            .pop_front()
            .ok_or_else(|| RelayError::EmptyPool(name.to_string()))?;
        queue.push_back(head.clone());
        Ok(head)
    }

    /// 下一个索引：有协调器时委托，否则均匀随机
    pub async fn get_next(&self, name: &str) -> Result<usize> {
        let len = self.get_all(name).len();
        if len == 0 {
            return Err(RelayError::EmptyPool(name.to_string()));
        }
        if len == 1 {
            return Ok(0);
        }

        if let Some(coordinator) = &self.coordinator {
            let index = coordinator.get_next_index(name, len).await?;
            return Ok(index % len);
        }

        let mut random = self
            .random
            .lock()
            .map_err(|_| RelayError::internal("随机源锁已中毒"))?;
        Ok(uniform_index(random.as_mut(), len))
    }

    /// 解析一次调用使用的凭据：全局轮询时经协调器，否则本地轮询
    pub async fn resolve(&self, name: &str) -> Result<String> {
        if self.coordinator.is_some() {
            let index = self.get_next(name).await?;
            return self.get(name, index);
        }
        self.rotate(name)
    }
}

/// 掩码显示密钥，只保留末三位
pub fn mask_key(key: &str) -> String {
    let len = key.chars().count();
    if len <= 3 {
        return "***".to_string();
    }
    let tail: String = key.chars().skip(len - 3).collect();
    format!("{}{}", "*".repeat((len - 3).min(10)), tail)
}
