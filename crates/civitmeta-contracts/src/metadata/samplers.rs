/// Display name used when the source record carries no sampler at all.
pub const DEFAULT_SAMPLER: &str = "Euler";

/// Source sampler identifiers and the display names the target parser expects.
/// Names not listed here are passed through untouched.
pub const SAMPLER_TABLE: &[(&str, &str)] = &[
    ("dpmpp_2m", "DPM++ 2M"),
    ("euler_a", "Euler a"),
    ("ddim", "DDIM"),
    ("k_dpm_2_a", "DPM2 a"),
    ("k_dpm_2", "DPM2"),
    ("k_dpmpp_2_a", "DPM++ 2M a"),
    ("k_dpmpp_2", "DPM++ 2M"),
];

pub fn sampler_display_name(sampler: Option<&str>) -> String {
    let Some(sampler) = sampler else {
        return DEFAULT_SAMPLER.to_string();
    };
    SAMPLER_TABLE
        .iter()
        .find(|(source, _)| *source == sampler)
        .map(|(_, display)| (*display).to_string())
        .unwrap_or_else(|| sampler.to_string())
}
