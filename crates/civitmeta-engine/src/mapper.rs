use civitmeta_contracts::metadata::{format_number, sampler_display_name, SourceMetadata};
use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::resolver::{shorten_hash, HashResolver, UNKNOWN_HASH};

/// Character-code header written in front of the UTF-16LE comment text.
pub const USER_COMMENT_PREFIX: &[u8; 9] = b"UNICODE\0\0";

/// Comment text in the CivitAI / A1111 parameters layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetComment {
    text: String,
}

impl TargetComment {
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Header followed by the text as little-endian UTF-16 code units.
    pub fn to_user_comment(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(USER_COMMENT_PREFIX.len() + self.text.len() * 2);
        bytes.extend_from_slice(USER_COMMENT_PREFIX);
        bytes.extend(self.text.encode_utf16().flat_map(u16::to_le_bytes));
        bytes
    }
}

/// Resolves the main model hash and renders the target comment.
///
/// A `SourceMetadata` only exists once the required fields were present, so the
/// mapping itself cannot fail.
pub fn map_metadata(meta: &SourceMetadata, resolver: &mut HashResolver) -> TargetComment {
    let model_hash = resolve_main_model_hash(meta, resolver);
    render_target_comment(meta, &model_hash)
}

pub fn resolve_main_model_hash(meta: &SourceMetadata, resolver: &mut HashResolver) -> String {
    let Some(entry) = meta.main_model() else {
        warn!("Could not find main model entry in metadata");
        return UNKNOWN_HASH.to_string();
    };
    let Some(hash) = entry.hash.as_deref().filter(|hash| !hash.trim().is_empty()) else {
        warn!(model = %entry.name, "main model carries no hash");
        return UNKNOWN_HASH.to_string();
    };
    let model_name = meta.model_name.as_deref().unwrap_or(&entry.name);
    resolver
        .resolve(hash, &format!("model: {model_name}"))
        .to_string()
}

/// Pure rendering step: identical inputs always give byte-identical text.
pub fn render_target_comment(meta: &SourceMetadata, model_hash: &str) -> TargetComment {
    let prompt = collapse_newlines(&meta.prompt);
    let negative = collapse_newlines(&meta.negative_prompt);
    let negative = negative.trim_end_matches(',');

    let mut params = vec![
        format!("Steps: {}", or_unknown(meta.steps)),
        format!("Sampler: {}", sampler_display_name(meta.sampler.as_deref())),
        format!("Schedule type: {}", meta.scheduler),
        format!(
            "CFG scale: {}",
            meta.cfg_scale
                .map(format_number)
                .unwrap_or_else(|| UNKNOWN_HASH.to_string())
        ),
        format!("Seed: {}", or_unknown(meta.seed)),
        format!("Size: {}x{}", or_unknown(meta.width), or_unknown(meta.height)),
        format!("Model hash: {model_hash}"),
        format!("Model: {}", meta.model_name.as_deref().unwrap_or(UNKNOWN_HASH)),
        format!("Version: {}", meta.swarm_version.as_deref().unwrap_or(UNKNOWN_HASH)),
    ];
    let loras = lora_list(meta);
    if !loras.is_empty() {
        params.push(format!("Loras: {loras}"));
    }
    params.push(format!("Hashes: {}", hash_manifest(meta)));

    let text = format!(
        "{prompt}\nNegative prompt: {negative}\n{}",
        params.join(", ")
    );
    debug!(length = text.len(), "rendered target comment");
    TargetComment { text }
}

fn lora_list(meta: &SourceMetadata) -> String {
    meta.lora_names
        .iter()
        .enumerate()
        .map(|(index, name)| format!("{name}:{}", meta.lora_weight(index)))
        .collect::<Vec<_>>()
        .join(",")
}

/// `{"model": <short>, <lora stem>: <short>, ...}` in source order. Always the
/// local short form, never the resolved identifier.
fn hash_manifest(meta: &SourceMetadata) -> String {
    let mut manifest: IndexMap<String, String> = IndexMap::new();
    let model_short = meta
        .main_model()
        .and_then(|entry| entry.hash.as_deref())
        .map(shorten_hash)
        .unwrap_or_else(|| UNKNOWN_HASH.to_string());
    manifest.insert("model".to_string(), model_short);
    for entry in meta.lora_models() {
        let short = entry
            .hash
            .as_deref()
            .map(shorten_hash)
            .unwrap_or_else(|| UNKNOWN_HASH.to_string());
        manifest.insert(lora_key(&entry.name), short);
    }
    serde_json::to_string(&manifest).unwrap_or_else(|_| "{}".to_string())
}

fn lora_key(name: &str) -> String {
    let file_name = name.rsplit(['/', '\\']).next().unwrap_or(name);
    match file_name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => file_name.to_string(),
    }
}

fn collapse_newlines(text: &str) -> String {
    text.replace('\n', " ").trim().to_string()
}

fn or_unknown<T: ToString>(value: Option<T>) -> String {
    value
        .map(|value| value.to_string())
        .unwrap_or_else(|| UNKNOWN_HASH.to_string())
}
