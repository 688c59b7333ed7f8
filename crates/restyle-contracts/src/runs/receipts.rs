use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::assets::GenerationResult;

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;

/// What a finished generation was made from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationReceipt {
    pub style_id: String,
    /// Style actually uploaded; differs from `style_id` after a fallback.
    pub effective_style_id: String,
    /// Resolver tier that produced the style file.
    pub resolution_tier: String,
    pub subject_path: PathBuf,
    pub subject_url: String,
    pub style_url: String,
    pub attempts: u32,
    pub provider: String,
    pub started_at: String,
    pub finished_at: String,
}

pub fn build_receipt(
    receipt: &GenerationReceipt,
    result: &GenerationResult,
    receipt_path: &Path,
    provider_request: &Map<String, Value>,
) -> Value {
    let mut root = Map::new();
    root.insert(
        "schema_version".to_string(),
        Value::Number(RECEIPT_SCHEMA_VERSION.into()),
    );
    root.insert(
        "generation".to_string(),
        serde_json::to_value(receipt).unwrap_or(Value::Null),
    );
    root.insert(
        "provider_request".to_string(),
        sanitize_payload(&Value::Object(provider_request.clone())),
    );

    let mut artifacts = Map::new();
    artifacts.insert(
        "remote_output_url".to_string(),
        Value::String(result.remote_output_url.clone()),
    );
    artifacts.insert(
        "image_path".to_string(),
        Value::String(result.local_result_path.to_string_lossy().to_string()),
    );
    artifacts.insert(
        "receipt_path".to_string(),
        Value::String(receipt_path.to_string_lossy().to_string()),
    );
    root.insert("artifacts".to_string(), Value::Object(artifacts));
    Value::Object(root)
}

pub fn write_receipt(path: &Path, payload: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(payload)?)?;
    Ok(())
}

/// Receipt path for a result: same directory and stem, `.json` extension.
pub fn receipt_path_for(result_path: &Path) -> PathBuf {
    result_path.with_extension("json")
}

fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Bool(_) | Value::Number(_) | Value::String(_) => value.clone(),
        Value::Array(rows) => Value::Array(rows.iter().map(sanitize_payload).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, row) in map {
                let lowered = key.to_ascii_lowercase();
                if matches!(
                    lowered.as_str(),
                    "authorization" | "api_token" | "api_key" | "token"
                ) {
                    out.insert(key.clone(), Value::String("<omitted>".to_string()));
                    continue;
                }
                out.insert(key.clone(), sanitize_payload(row));
            }
            Value::Object(out)
        }
    }
}
