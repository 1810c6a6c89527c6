mod samplers;
mod source;

pub use samplers::{sampler_display_name, DEFAULT_SAMPLER, SAMPLER_TABLE};
pub use source::{
    LoraWeight, ModelEntry, SourceMetadata, DEFAULT_SCHEDULER, LORA_ROLE, MAIN_MODEL_ROLE,
};

/// Renders a JSON number at full precision with no trailing `.0`.
pub fn format_number(value: f64) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    value.to_string()
}
