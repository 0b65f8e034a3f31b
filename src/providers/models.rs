//! 各厂商模型列表 -> OpenAI 模型列表
use crate::providers::ModelListFormat;
use crate::types::{Model, ModelList};
use crate::Result;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Debug, Deserialize)]
struct DataList {
    data: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct CohereModels {
    models: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct WorkersAiModels {
    result: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct OpenAiModel {
    id: String,
    #[serde(default)]
    created: Option<i64>,
    #[serde(default)]
    owned_by: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicModel {
    id: String,
    #[serde(default)]
    created_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedModel {
    name: String,
}

fn parse_created_at(value: Option<&str>) -> i64 {
    value
        .and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok())
        .map(OffsetDateTime::unix_timestamp)
        .unwrap_or(0)
}

/// 逐项解析，原始对象保留在 `_` 下
fn convert_each<T: DeserializeOwned>(items: Vec<Value>, convert: impl Fn(T) -> Model) -> Result<Vec<Model>> {
    items
        .into_iter()
        .map(|item| {
            let parsed: T = serde_json::from_value(item.clone())?;
            Ok(convert(parsed).with_vendor(item))
        })
        .collect()
}

/// 形状不符时返回解析错误
pub fn to_openai_format(format: ModelListFormat, owner: &str, data: Value) -> Result<ModelList> {
    let models = match format {
        ModelListFormat::OpenAi => convert_each(
            serde_json::from_value::<DataList>(data)?.data,
            |m: OpenAiModel| {
                Model::new(
                    m.id,
                    m.created.unwrap_or(0),
                    m.owned_by.unwrap_or_else(|| owner.to_string()),
                )
            },
        )?,
        ModelListFormat::GoogleAiStudio => convert_each(
            serde_json::from_value::<DataList>(data)?.data,
            |m: OpenAiModel| {
                let id = m.id.strip_prefix("models/").unwrap_or(&m.id).to_string();
                Model::new(id, m.created.unwrap_or(0), owner)
            },
        )?,
        ModelListFormat::Anthropic => convert_each(
            serde_json::from_value::<DataList>(data)?.data,
            |m: AnthropicModel| Model::new(m.id, parse_created_at(m.created_at.as_deref()), owner),
        )?,
        ModelListFormat::Cohere => convert_each(
            serde_json::from_value::<CohereModels>(data)?.models,
            |m: NamedModel| Model::new(m.name, 0, owner),
        )?,
        ModelListFormat::WorkersAi => convert_each(
            serde_json::from_value::<WorkersAiModels>(data)?.result,
            |m: NamedModel| Model::new(m.name, 0, owner),
        )?,
    };
    Ok(ModelList::new(models))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_openai_format_keeps_owner() {
        let list = to_openai_format(
            ModelListFormat::OpenAi,
            "groq",
            json!({"object": "list", "data": [
                {"id": "llama3-8b", "object": "model", "created": 1700000000, "owned_by": "Meta"},
                {"id": "mixtral"}
            ]}),
        )
        .unwrap();
        assert_eq!(list.data.len(), 2);
        assert_eq!(list.data[0].owned_by, "Meta");
        assert_eq!(list.data[1].owned_by, "groq");
        assert_eq!(list.data[1].created, 0);
    }

    #[test]
    fn test_anthropic_created_at() {
        let list = to_openai_format(
            ModelListFormat::Anthropic,
            "anthropic",
            json!({"data": [{"id": "claude-3-opus", "type": "model", "created_at": "2024-02-29T00:00:00Z"}]}),
        )
        .unwrap();
        assert_eq!(list.data[0].created, 1709164800);
        assert_eq!(list.data[0].owned_by, "anthropic");
    }

    #[test]
    fn test_named_formats() {
        let cohere = to_openai_format(
            ModelListFormat::Cohere,
            "cohere",
            json!({"models": [{"name": "command-r", "endpoints": ["chat"]}]}),
        )
        .unwrap();
        assert_eq!(cohere.data[0].id, "command-r");

        let workers = to_openai_format(
            ModelListFormat::WorkersAi,
            "workers-ai",
            json!({"success": true, "result": [{"name": "@cf/meta/llama-3-8b-instruct"}]}),
        )
        .unwrap();
        assert_eq!(workers.data[0].id, "@cf/meta/llama-3-8b-instruct");
    }

    #[test]
    fn test_vendor_fields_kept_under_underscore() {
        let raw = json!({
            "name": "command-r",
            "endpoints": ["chat"],
            "context_length": 128000
        });
        let list = to_openai_format(ModelListFormat::Cohere, "cohere", json!({"models": [raw.clone()]}))
            .unwrap();
        assert_eq!(list.data[0].vendor.as_ref(), Some(&raw));

        let value = serde_json::to_value(&list).unwrap();
        assert_eq!(value["data"][0]["_"]["context_length"], 128000);
        assert_eq!(value["data"][0]["id"], "command-r");
    }

    #[test]
    fn test_model_without_vendor_omits_underscore() {
        let value = serde_json::to_value(Model::new("m", 0, "me")).unwrap();
        assert!(value.get("_").is_none());
    }

    #[test]
    fn test_google_strips_prefix() {
        let list = to_openai_format(
            ModelListFormat::GoogleAiStudio,
            "google-ai-studio",
            json!({"data": [{"id": "models/gemini-1.5-flash"}]}),
        )
        .unwrap();
        assert_eq!(list.data[0].id, "gemini-1.5-flash");
    }

    #[test]
    fn test_malformed_shape_is_error() {
        assert!(to_openai_format(ModelListFormat::OpenAi, "x", json!({"models": []})).is_err());
        assert!(to_openai_format(ModelListFormat::Cohere, "x", json!([])).is_err());
    }
}
