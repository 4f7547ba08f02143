//! Application configuration loading for CLI defaults.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use scandl_core::item::Quality;
use scandl_core::scan::GapTable;

/// File configuration for scandl defaults.
#[derive(Debug, Clone, Default)]
pub struct FileConfig {
    /// Default output directory for downloads.
    pub output_dir: Option<PathBuf>,
    /// Default concurrency (same range as CLI).
    pub concurrency: Option<u8>,
    /// Attempts per request.
    pub max_retries: Option<u32>,
    /// Highest quality tier to download.
    pub quality: Option<Quality>,
    /// Throttle floor in KB/s.
    pub throttle_kbps: Option<f64>,
    /// Adapt the throttle floor.
    pub throttle_auto: Option<bool>,
    /// Metadata endpoint with an `{id}` placeholder.
    pub metadata_url: Option<String>,
    /// Tags that exclude an item.
    pub excluded_tags: Option<Vec<String>>,
    /// Gap prediction block sizes, `first_id:block` pairs.
    pub gap_table: Option<GapTable>,
    /// Checkpoint file.
    pub checkpoint: Option<PathBuf>,
    /// Write JSON sidecar files alongside downloads.
    pub sidecar: Option<bool>,
}

impl FileConfig {
    /// Validates config values against runtime and CLI constraints.
    pub fn validate(&self) -> Result<()> {
        if let Some(concurrency) = self.concurrency
            && !(1..=32).contains(&concurrency)
        {
            bail!("Invalid config value for `concurrency`: {concurrency}. Expected range: 1..=32");
        }
        if let Some(max_retries) = self.max_retries
            && !(1..=20).contains(&max_retries)
        {
            bail!("Invalid config value for `max_retries`: {max_retries}. Expected range: 1..=20");
        }
        if let Some(kbps) = self.throttle_kbps
            && !(kbps.is_finite() && kbps >= 0.0)
        {
            bail!("Invalid config value for `throttle_kbps`: {kbps}. Expected a non-negative number");
        }
        if let Some(url) = self.metadata_url.as_deref()
            && !url.contains("{id}")
        {
            bail!("Invalid config value for `metadata_url`: '{url}' lacks the {{id}} placeholder");
        }
        Ok(())
    }
}

/// Loaded config metadata.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Resolved config path if a base directory is known.
    pub path: Option<PathBuf>,
    /// Parsed file config when a config file exists and was valid.
    pub config: Option<FileConfig>,
}

/// Resolves default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/scandl/config.toml`
/// 2. `$HOME/.config/scandl/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("scandl")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("scandl")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads config from the default path if present.
pub fn load_default_file_config() -> Result<LoadedConfig> {
    let path = resolve_default_config_path();
    let config = match path.as_deref() {
        Some(path_ref) if path_ref.exists() => Some(load_file_config(path_ref)?),
        _ => None,
    };
    Ok(LoadedConfig { path, config })
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let line_no = line_index + 1;

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!("Invalid config syntax on line {line_no}: expected key = value");
        };

        let key = raw_key.trim();
        let value = raw_value.trim();
        let invalid = || format!("Invalid `{key}` value on line {line_no}");

        match key {
            "output_dir" => {
                let parsed = parse_string_literal(value).with_context(invalid)?;
                cfg.output_dir = Some(PathBuf::from(parsed));
            }
            "concurrency" => {
                cfg.concurrency = Some(parse_integer_u8(value).with_context(invalid)?);
            }
            "max_retries" => {
                let parsed = parse_integer_u64(value).with_context(invalid)?;
                let n = u32::try_from(parsed)
                    .map_err(|_| anyhow::anyhow!("max_retries out of range for u32"))?;
                cfg.max_retries = Some(n);
            }
            "quality" => {
                let parsed = parse_string_literal(value).with_context(invalid)?;
                let quality = parsed
                    .parse::<Quality>()
                    .map_err(anyhow::Error::msg)
                    .with_context(invalid)?;
                cfg.quality = Some(quality);
            }
            "throttle_kbps" => {
                let parsed = value.parse::<f64>().with_context(invalid)?;
                cfg.throttle_kbps = Some(parsed);
            }
            "throttle_auto" => {
                cfg.throttle_auto = Some(parse_boolean(value).with_context(invalid)?);
            }
            "metadata_url" => {
                cfg.metadata_url = Some(parse_string_literal(value).with_context(invalid)?);
            }
            "excluded_tags" => {
                let parsed = parse_string_literal(value).with_context(invalid)?;
                cfg.excluded_tags = Some(split_list(&parsed));
            }
            "gap_table" => {
                let parsed = parse_string_literal(value).with_context(invalid)?;
                let table = parsed
                    .parse::<GapTable>()
                    .map_err(anyhow::Error::msg)
                    .with_context(invalid)?;
                cfg.gap_table = Some(table);
            }
            "checkpoint" => {
                let parsed = parse_string_literal(value).with_context(invalid)?;
                cfg.checkpoint = Some(PathBuf::from(parsed));
            }
            "sidecar" => {
                cfg.sidecar = Some(parse_boolean(value).with_context(invalid)?);
            }
            unknown => {
                bail!("Unknown configuration key: '{unknown}' on line {line_no}");
            }
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

/// Splits a comma-separated list, dropping blanks.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_integer_u8(raw_value: &str) -> Result<u8> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<u16>()?;
    u8::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u8"))
}

fn parse_integer_u64(raw_value: &str) -> Result<u64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    u64::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u64"))
}

fn parse_boolean(raw_value: &str) -> Result<bool> {
    match raw_value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => bail!("Expected 'true' or 'false'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_partial_fields() {
        let cfg = parse_config_str(
            r#"
concurrency = 8
quality = "720p"
"#,
        )
        .expect("partial config should parse");
        assert_eq!(cfg.concurrency, Some(8));
        assert_eq!(cfg.quality, Some(Quality::P720));
        assert!(cfg.output_dir.is_none());
    }

    #[test]
    fn test_parse_config_all_fields() {
        let cfg = parse_config_str(
            r#"
output_dir = "/data/media"
concurrency = 4
max_retries = 3
throttle_kbps = 48.5
throttle_auto = true
metadata_url = "https://api.example.com/items/{id}"
excluded_tags = "spam, ads ,"
gap_table = "0:2, 5000:3"
checkpoint = "/tmp/scandl.resume" # rewritten every 30s
sidecar = false
"#,
        )
        .expect("full config should parse");
        assert_eq!(cfg.output_dir, Some(PathBuf::from("/data/media")));
        assert_eq!(cfg.max_retries, Some(3));
        assert_eq!(cfg.throttle_kbps, Some(48.5));
        assert_eq!(cfg.throttle_auto, Some(true));
        assert_eq!(
            cfg.excluded_tags,
            Some(vec!["spam".to_string(), "ads".to_string()])
        );
        assert_eq!(cfg.gap_table.as_ref().and_then(|t| t.block_size(6000)), Some(3));
        assert_eq!(cfg.checkpoint, Some(PathBuf::from("/tmp/scandl.resume")));
        assert_eq!(cfg.sidecar, Some(false));
    }

    #[test]
    fn test_parse_config_rejects_invalid_concurrency() {
        let err = parse_config_str("concurrency = 33").expect_err("invalid concurrency expected");
        assert!(err.to_string().contains("concurrency"));
    }

    #[test]
    fn test_parse_config_rejects_numeric_values_with_trailing_tokens() {
        let err = parse_config_str("concurrency = 4 trailing")
            .expect_err("expected trailing token error");
        assert!(err.to_string().contains("concurrency"));
    }

    #[test]
    fn test_parse_config_rejects_negative_throttle() {
        let err = parse_config_str("throttle_kbps = -1").expect_err("negative floor expected");
        assert!(err.to_string().contains("throttle_kbps"));
    }

    #[test]
    fn test_parse_config_rejects_template_without_placeholder() {
        let err = parse_config_str(r#"metadata_url = "https://api.example.com/items""#)
            .expect_err("missing placeholder expected");
        assert!(err.to_string().contains("metadata_url"));
    }

    #[test]
    fn test_parse_config_rejects_bad_gap_table() {
        let err = parse_config_str(r#"gap_table = "0:9""#).expect_err("bad block size expected");
        assert!(format!("{err:#}").contains("gap_table"));
    }

    #[test]
    fn test_parse_config_rejects_invalid_boolean() {
        let err = parse_config_str("sidecar = yes").expect_err("invalid boolean expected");
        assert!(err.to_string().contains("sidecar"));
    }

    #[test]
    fn test_parse_config_supports_inline_comments() {
        let cfg = parse_config_str("concurrency = 4 # workers\n# full line\n")
            .expect("config with comments should parse");
        assert_eq!(cfg.concurrency, Some(4));
    }

    #[test]
    fn test_parse_config_rejects_unknown_keys() {
        let err = parse_config_str("unknown_key = 123").expect_err("unknown key error expected");
        assert!(err.to_string().contains("Unknown configuration key"));
        assert!(err.to_string().contains("unknown_key"));
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list(" a,b ,, c"), ["a", "b", "c"]);
        assert!(split_list("").is_empty());
    }
}
