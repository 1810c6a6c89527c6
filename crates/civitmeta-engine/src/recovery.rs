use civitmeta_contracts::error::{ConvertError, ConvertResult};
use serde_json::Value;
use tracing::debug;

/// EXIF UserComment character-code headers. Each is exactly 8 bytes.
pub const UNICODE_MARKER: &[u8; 8] = b"UNICODE\0";
pub const ASCII_MARKER: &[u8; 8] = b"ASCII\0\0\0";
pub const UNDEFINED_MARKER: &[u8; 8] = &[0; 8];

const UTF16_BE_BOM: [u8; 2] = [0xFE, 0xFF];
const UTF16_LE_BOM: [u8; 2] = [0xFF, 0xFE];

/// UserComment payload exactly as stored in the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawComment(Vec<u8>);

impl RawComment {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Pulls the JSON object out of a noisy comment and returns it as compact text.
///
/// The comment may start with a character-code header, may be UTF-16 with
/// stray NUL bytes in odd places, and may carry control bytes or padding around
/// the object. Anything outside the first `{` and last `}` is discarded.
pub fn recover_json(raw: &RawComment) -> ConvertResult<String> {
    let text = decode_comment_text(raw.as_bytes());
    let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) else {
        return Err(ConvertError::Recovery(
            "no JSON object delimiters in comment".to_string(),
        ));
    };
    if end < start {
        return Err(ConvertError::Recovery(
            "closing brace precedes opening brace".to_string(),
        ));
    }

    let extracted = &text[start..=end];
    debug!(length = extracted.len(), "extracted JSON candidate");

    let without_controls: String = extracted.chars().filter(|c| !c.is_control()).collect();
    let cleaned = collapse_whitespace(&without_controls.replace("\\n", " "));

    let parsed: Value = serde_json::from_str(&cleaned)
        .map_err(|err| ConvertError::Recovery(format!("invalid JSON after cleanup: {err}")))?;
    if !parsed.is_object() {
        return Err(ConvertError::Recovery(
            "recovered JSON is not an object".to_string(),
        ));
    }
    Ok(cleaned)
}

/// Strips a known character-code header and decodes the remainder to text.
pub fn decode_comment_text(raw: &[u8]) -> String {
    if let Some(body) = raw.strip_prefix(UNICODE_MARKER.as_slice()) {
        return decode_utf16_payload(body);
    }
    if let Some(body) = raw
        .strip_prefix(ASCII_MARKER.as_slice())
        .or_else(|| raw.strip_prefix(UNDEFINED_MARKER.as_slice()))
    {
        return decode_bytes(body);
    }
    decode_bytes(raw)
}

fn decode_utf16_payload(body: &[u8]) -> String {
    if let Some(rest) = body.strip_prefix(UTF16_BE_BOM.as_slice()) {
        return decode_utf16(rest, u16::from_be_bytes);
    }
    if let Some(rest) = body.strip_prefix(UTF16_LE_BOM.as_slice()) {
        return decode_utf16(rest, u16::from_le_bytes);
    }
    // The header written by some tools is one NUL longer than the standard
    // 8 bytes, so align the code units on the opening brace.
    let start = match body.iter().position(|byte| *byte == b'{') {
        Some(brace) if body.get(brace + 1) == Some(&0) => brace % 2,
        Some(_) => return decode_bytes(body),
        None => body.len() % 2,
    };
    decode_utf16(&body[start..], u16::from_le_bytes)
}

fn decode_utf16(bytes: &[u8], unit: fn([u8; 2]) -> u16) -> String {
    let units = bytes.chunks_exact(2).map(|pair| unit([pair[0], pair[1]]));
    char::decode_utf16(units)
        .map(|decoded| decoded.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

fn decode_bytes(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        // Latin-1 view keeps every byte addressable.
        Err(_) => bytes.iter().map(|byte| char::from(*byte)).collect(),
    }
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_run = false;
    for ch in text.chars() {
        if ch.is_whitespace() {
            if !in_run {
                out.push(' ');
                in_run = true;
            }
        } else {
            out.push(ch);
            in_run = false;
        }
    }
    out
}
