use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::format_number;
use crate::error::{ConvertError, ConvertResult};

pub const MAIN_MODEL_ROLE: &str = "model";
pub const LORA_ROLE: &str = "loras";
pub const DEFAULT_SCHEDULER: &str = "Normal";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "param", default)]
    pub role: String,
    #[serde(default)]
    pub hash: Option<String>,
}

impl ModelEntry {
    pub fn is_main_model(&self) -> bool {
        self.role == MAIN_MODEL_ROLE
    }

    pub fn is_lora(&self) -> bool {
        self.role == LORA_ROLE
    }
}

/// LoRA weights arrive either as JSON numbers or as numeric strings; `null`
/// stands in for an unset weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LoraWeight {
    Number(f64),
    Text(String),
    Missing,
}

impl LoraWeight {
    pub fn render(&self) -> String {
        match self {
            Self::Number(value) => format_number(*value),
            Self::Text(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    "1".to_string()
                } else {
                    trimmed.to_string()
                }
            }
            Self::Missing => "1".to_string(),
        }
    }
}

/// Generation parameters recovered from a SwarmUI comment.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceMetadata {
    pub prompt: String,
    pub negative_prompt: String,
    pub sampler: Option<String>,
    pub scheduler: String,
    pub steps: Option<i64>,
    pub cfg_scale: Option<f64>,
    pub seed: Option<i64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub model_name: Option<String>,
    pub swarm_version: Option<String>,
    pub lora_names: Vec<String>,
    pub lora_weights: Vec<LoraWeight>,
    pub model_entries: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    sui_image_params: Option<RawParams>,
    sui_models: Option<Vec<ModelEntry>>,
}

#[derive(Debug, Deserialize)]
struct RawParams {
    prompt: Option<String>,
    negativeprompt: Option<String>,
    sampler: Option<String>,
    scheduler: Option<String>,
    steps: Option<i64>,
    cfgscale: Option<f64>,
    seed: Option<i64>,
    width: Option<u32>,
    height: Option<u32>,
    model: Option<String>,
    swarm_version: Option<String>,
    loras: Option<Vec<String>>,
    loraweights: Option<Vec<LoraWeight>>,
}

impl SourceMetadata {
    pub fn from_json(raw: &str) -> ConvertResult<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|err| ConvertError::Schema(format!("invalid metadata JSON: {err}")))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> ConvertResult<Self> {
        let document: RawDocument = serde_json::from_value(value)
            .map_err(|err| ConvertError::Schema(format!("unexpected field type: {err}")))?;
        let params = document
            .sui_image_params
            .ok_or_else(|| ConvertError::Schema("missing sui_image_params".to_string()))?;
        let model_entries = document
            .sui_models
            .ok_or_else(|| ConvertError::Schema("missing sui_models".to_string()))?;
        let prompt = params
            .prompt
            .ok_or_else(|| ConvertError::Schema("missing prompt".to_string()))?;

        Ok(Self {
            prompt,
            negative_prompt: params.negativeprompt.unwrap_or_default(),
            sampler: params.sampler,
            scheduler: params
                .scheduler
                .unwrap_or_else(|| DEFAULT_SCHEDULER.to_string()),
            steps: params.steps,
            cfg_scale: params.cfgscale,
            seed: params.seed,
            width: params.width,
            height: params.height,
            model_name: params.model,
            swarm_version: params.swarm_version,
            lora_names: params.loras.unwrap_or_default(),
            lora_weights: params.loraweights.unwrap_or_default(),
            model_entries,
        })
    }

    pub fn main_model(&self) -> Option<&ModelEntry> {
        self.model_entries.iter().find(|entry| entry.is_main_model())
    }

    pub fn lora_models(&self) -> impl Iterator<Item = &ModelEntry> {
        self.model_entries.iter().filter(|entry| entry.is_lora())
    }

    /// Weight for the LoRA at `index`, defaulting to 1 when the weights list is shorter.
    pub fn lora_weight(&self, index: usize) -> String {
        self.lora_weights
            .get(index)
            .map(LoraWeight::render)
            .unwrap_or_else(|| "1".to_string())
    }
}
