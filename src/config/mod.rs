use crate::error::RelayError;
use crate::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// 主配置结构
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// 请求 model 为 "default" 时使用的 provider/model
    #[serde(default)]
    pub default_model: Option<String>,

    /// 凭据名 -> 原始配置值（字符串、JSON 数组、逗号分隔或 YAML 列表）
    #[serde(default)]
    pub credentials: HashMap<String, CredentialValue>,

    /// 按提供商覆盖 base URL
    #[serde(default)]
    pub base_urls: HashMap<String, String>,

    #[serde(default)]
    pub workers_ai_account_id: Option<String>,

    #[serde(default)]
    pub custom_providers: Vec<CustomProviderConfig>,

    #[serde(default)]
    pub rotation: RotationConfig,

    #[serde(default)]
    pub aggregator: Option<AggregatorConfig>,
}

/// 凭据值：YAML 中既可以写字符串也可以写列表
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CredentialValue {
    Raw(String),
    List(Vec<String>),
}

impl CredentialValue {
    /// 还原为单个原始配置字符串，列表编码为 JSON 数组
    pub fn to_raw(&self) -> String {
        match self {
            CredentialValue::Raw(s) => s.clone(),
            CredentialValue::List(items) => {
                serde_json::to_string(items).unwrap_or_default()
            }
        }
    }
}

/// 自定义 OpenAI 兼容端点
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CustomProviderConfig {
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub api_keys: Option<CredentialValue>,
}

impl CustomProviderConfig {
    /// 自定义端点在凭据源中使用的名字
    pub fn credential_name(&self) -> String {
        format!("CUSTOM_{}_API_KEY", self.name.to_uppercase().replace('-', "_"))
    }
}

/// 凭据轮换配置
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RotationConfig {
    /// 启用全局轮询（经由协调器）
    #[serde(default)]
    pub global_round_robin: bool,
    /// 远程协调器地址，未设置时使用进程内协调器
    #[serde(default)]
    pub coordinator_url: Option<String>,
    /// 进程内协调器的持久化计数文件
    #[serde(default)]
    pub counter_file: Option<PathBuf>,
    /// 对外暴露 /rotation/next-index
    #[serde(default)]
    pub serve_coordinator: bool,
}

/// 上游聚合网关配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AggregatorConfig {
    pub account_id: String,
    pub gateway_id: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_aggregator_base")]
    pub base_url: String,
    #[serde(default)]
    pub retry_count: usize,
}

fn default_aggregator_base() -> String {
    "https://gateway.ai.cloudflare.com/v1".to_string()
}

impl Config {
    /// 从 YAML 文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let content = Self::replace_env_vars(content)?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// 替换配置中的环境变量 ${VAR}
    fn replace_env_vars(content: &str) -> Result<String> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")
            .map_err(|e| RelayError::internal(e.to_string()))?;
        let mut result = content.to_string();

        for cap in re.captures_iter(content) {
            let var_name = &cap[1];
            let var_value = std::env::var(var_name).map_err(|_| {
                RelayError::config(format!("环境变量未找到: {}", var_name))
            })?;
            result = result.replace(&cap[0], &var_value);
        }

        Ok(result)
    }

    /// 验证配置
    fn validate(&self) -> Result<()> {
        if let Some(default_model) = &self.default_model {
            parse_model_string(default_model)?;
        }

        let mut seen = std::collections::HashSet::new();
        for custom in &self.custom_providers {
            if custom.name.is_empty() || custom.name.contains('/') {
                return Err(RelayError::config(format!(
                    "自定义提供商名称无效: '{}'",
                    custom.name
                )));
            }
            if custom.base_url.is_empty() {
                return Err(RelayError::config(format!(
                    "自定义提供商 {} 缺少 base_url",
                    custom.name
                )));
            }
            if !seen.insert(custom.name.as_str()) {
                return Err(RelayError::config(format!(
                    "自定义提供商重复: {}",
                    custom.name
                )));
            }
        }

        if let Some(aggregator) = &self.aggregator {
            if aggregator.account_id.is_empty() || aggregator.gateway_id.is_empty() {
                return Err(RelayError::config("aggregator 需要 account_id 和 gateway_id"));
            }
        }

        Ok(())
    }
}

/// 解析模型字符串 (provider/model-id)，model-id 自身可以包含 '/'
pub fn parse_model_string(model: &str) -> Result<(String, String)> {
    let (provider, model_id) = model.split_once('/').ok_or_else(|| {
        RelayError::InvalidModelString(format!(
            "期望格式 'provider/model-id'，得到: {}",
            model
        ))
    })?;

    if provider.is_empty() || model_id.is_empty() {
        return Err(RelayError::InvalidModelString(format!(
            "提供商和模型 ID 不能为空: {}",
            model
        )));
    }

    Ok((provider.to_string(), model_id.to_string()))
}
