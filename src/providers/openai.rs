//! OpenAI 线格式：透传并按白名单过滤参数。

use crate::types::ChatRequest;
use crate::Result;
use serde_json::Value;

/// 只保留白名单中的顶层键，未知键静默丢弃
pub fn filter_request(req: &ChatRequest, allowed: &[&str]) -> Result<Value> {
    let mut bag = req.to_bag()?;
    bag.retain(|key, _| allowed.contains(&key.as_str()));
    Ok(Value::Object(bag))
}
