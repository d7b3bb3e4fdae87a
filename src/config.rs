//! Layered configuration (A1): built-in defaults, an optional TOML file,
//! then CLI overrides, merged field-by-field with CLI taking precedence.
//!
//! Layering follows `resolve_default_config_path` → `load_default_file_config`
//! → `apply_config_defaults`, parsing the file with the `toml` crate and
//! resolving the platform config directory with `dirs` rather than reading
//! `XDG_CONFIG_HOME` directly.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::error::EngineError;

/// Fully resolved configuration used to construct an [`crate::engine::Engine`].
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub download_path: PathBuf,
    pub preserve_structure: bool,
    pub max_parallel_downloads: u8,
    pub max_chunk_concurrency: u8,
    pub target_chunk_size: u64,
    pub min_chunk_threshold: u64,
    pub max_chunks: u32,
    pub chunk_max_retries: u32,
    pub retry_base_backoff_ms: u64,
    pub circuit_threshold: u32,
    pub circuit_open_ms: u64,
    pub circuit_half_open_probes: u32,
    pub connect_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub progress_flush_ms: u64,
    pub rate_limit_max_concurrent: usize,
    pub rate_limit_min_time_ms: u64,
    pub max_history_in_memory: usize,
    pub max_completed_in_memory: usize,
    pub max_failed_in_memory: usize,
    pub auto_resume_downloads: bool,
    pub queue_admission_limit: usize,
    pub overwrite_size_tolerance_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_path: PathBuf::from("."),
            preserve_structure: true,
            max_parallel_downloads: 3,
            max_chunk_concurrency: 4,
            target_chunk_size: 8 * 1024 * 1024,
            min_chunk_threshold: 16 * 1024 * 1024,
            max_chunks: 16,
            chunk_max_retries: 3,
            retry_base_backoff_ms: 1000,
            circuit_threshold: 3,
            circuit_open_ms: 30_000,
            circuit_half_open_probes: 1,
            connect_timeout_ms: 30_000,
            idle_timeout_ms: 300_000,
            progress_flush_ms: 100,
            rate_limit_max_concurrent: 4,
            rate_limit_min_time_ms: 0,
            max_history_in_memory: 500,
            max_completed_in_memory: 200,
            max_failed_in_memory: 200,
            auto_resume_downloads: true,
            queue_admission_limit: 1000,
            overwrite_size_tolerance_bytes: 0,
        }
    }
}

impl EngineConfig {
    /// Validates range constraints, bailing with a descriptive error on the
    /// first field found out of range.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] describing the first field out of range.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(1..=3).contains(&self.max_parallel_downloads) {
            return Err(EngineError::Config(format!(
                "max_parallel_downloads must be in 1..=3, got {}",
                self.max_parallel_downloads
            )));
        }
        if self.max_chunk_concurrency == 0 {
            return Err(EngineError::Config(
                "max_chunk_concurrency must be at least 1".to_string(),
            ));
        }
        if self.max_chunks < 2 {
            return Err(EngineError::Config(
                "max_chunks must be at least 2".to_string(),
            ));
        }
        if self.target_chunk_size == 0 {
            return Err(EngineError::Config(
                "target_chunk_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// TOML-backed file configuration. Every field is optional; absent fields
/// fall back to [`EngineConfig::default`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    pub download_path: Option<PathBuf>,
    pub preserve_structure: Option<bool>,
    pub max_parallel_downloads: Option<u8>,
    pub max_chunk_concurrency: Option<u8>,
    pub target_chunk_size: Option<u64>,
    pub min_chunk_threshold: Option<u64>,
    pub max_chunks: Option<u32>,
    pub chunk_max_retries: Option<u32>,
    pub retry_base_backoff_ms: Option<u64>,
    pub circuit_threshold: Option<u32>,
    pub circuit_open_ms: Option<u64>,
    pub circuit_half_open_probes: Option<u32>,
    pub connect_timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
    pub progress_flush_ms: Option<u64>,
    pub rate_limit_max_concurrent: Option<usize>,
    pub rate_limit_min_time_ms: Option<u64>,
    pub max_history_in_memory: Option<usize>,
    pub max_completed_in_memory: Option<usize>,
    pub max_failed_in_memory: Option<usize>,
    pub auto_resume_downloads: Option<bool>,
    pub queue_admission_limit: Option<usize>,
    pub overwrite_size_tolerance_bytes: Option<u64>,
}

/// CLI-sourced overrides. Only the fields a user would plausibly want to
/// flip per-invocation are exposed here; the rest are file/default only.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub download_path: Option<PathBuf>,
    pub max_parallel_downloads: Option<u8>,
    pub max_chunk_concurrency: Option<u8>,
    pub rate_limit_min_time_ms: Option<u64>,
    pub auto_resume_downloads: Option<bool>,
}

/// Resolves the default config file path.
///
/// Priority: `$XDG_CONFIG_HOME/download-engine/config.toml`, else the
/// platform config directory resolved by `dirs::config_dir()`.
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(xdg).join("download-engine").join("config.toml"));
    }
    dirs::config_dir().map(|dir| dir.join("download-engine").join("config.toml"))
}

/// Loads and parses the config file at `path`, if it exists.
///
/// # Errors
///
/// Returns [`EngineError::Config`] if the file exists but cannot be read or
/// parsed as TOML.
#[instrument]
pub fn load_file_config(path: &Path) -> Result<Option<FileConfig>, EngineError> {
    if !path.exists() {
        debug!(path = %path.display(), "no config file present, using defaults");
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|e| EngineError::Config(format!("failed to read {}: {e}", path.display())))?;
    let parsed: FileConfig = toml::from_str(&raw)
        .map_err(|e| EngineError::Config(format!("failed to parse {}: {e}", path.display())))?;
    Ok(Some(parsed))
}

/// Loads the config file from the default resolved path, if any.
///
/// # Errors
///
/// Returns [`EngineError::Config`] if a config file is found but invalid.
pub fn load_default_file_config() -> Result<Option<FileConfig>, EngineError> {
    let Some(path) = resolve_default_config_path() else {
        return Ok(None);
    };
    load_file_config(&path)
}

/// Merges built-in defaults, an optional file config, and CLI overrides (in
/// that precedence order, CLI winning), then validates the result.
///
/// # Errors
///
/// Returns [`EngineError::Config`] if the merged configuration fails
/// validation.
pub fn resolve_config(
    file: Option<&FileConfig>,
    overrides: &ConfigOverrides,
) -> Result<EngineConfig, EngineError> {
    let mut cfg = EngineConfig::default();

    if let Some(file) = file {
        macro_rules! apply {
            ($field:ident) => {
                if let Some(value) = file.$field.clone() {
                    cfg.$field = value;
                }
            };
        }
        apply!(download_path);
        apply!(preserve_structure);
        apply!(max_parallel_downloads);
        apply!(max_chunk_concurrency);
        apply!(target_chunk_size);
        apply!(min_chunk_threshold);
        apply!(max_chunks);
        apply!(chunk_max_retries);
        apply!(retry_base_backoff_ms);
        apply!(circuit_threshold);
        apply!(circuit_open_ms);
        apply!(circuit_half_open_probes);
        apply!(connect_timeout_ms);
        apply!(idle_timeout_ms);
        apply!(progress_flush_ms);
        apply!(rate_limit_max_concurrent);
        apply!(rate_limit_min_time_ms);
        apply!(max_history_in_memory);
        apply!(max_completed_in_memory);
        apply!(max_failed_in_memory);
        apply!(auto_resume_downloads);
        apply!(queue_admission_limit);
        apply!(overwrite_size_tolerance_bytes);
    }

    if let Some(v) = overrides.download_path.clone() {
        cfg.download_path = v;
    }
    if let Some(v) = overrides.max_parallel_downloads {
        cfg.max_parallel_downloads = v;
    }
    if let Some(v) = overrides.max_chunk_concurrency {
        cfg.max_chunk_concurrency = v;
    }
    if let Some(v) = overrides.rate_limit_min_time_ms {
        cfg.rate_limit_min_time_ms = v;
    }
    if let Some(v) = overrides.auto_resume_downloads {
        cfg.auto_resume_downloads = v;
    }

    if let Err(e) = cfg.validate() {
        warn!(error = %e, "resolved configuration failed validation");
        return Err(e);
    }
    Ok(cfg)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_chunk_concurrency() {
        let mut cfg = EngineConfig::default();
        cfg.max_chunk_concurrency = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_parallel_downloads() {
        let mut cfg = EngineConfig::default();
        cfg.max_parallel_downloads = 10;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_resolve_config_with_no_file_or_overrides_is_default() {
        let resolved = resolve_config(None, &ConfigOverrides::default()).unwrap();
        assert_eq!(resolved, EngineConfig::default());
    }

    #[test]
    fn test_file_config_overrides_default() {
        let file = FileConfig {
            max_parallel_downloads: Some(2),
            ..FileConfig::default()
        };
        let resolved = resolve_config(Some(&file), &ConfigOverrides::default()).unwrap();
        assert_eq!(resolved.max_parallel_downloads, 2);
    }

    #[test]
    fn test_cli_override_wins_over_file() {
        let file = FileConfig {
            max_parallel_downloads: Some(2),
            ..FileConfig::default()
        };
        let overrides = ConfigOverrides {
            max_parallel_downloads: Some(3),
            ..ConfigOverrides::default()
        };
        let resolved = resolve_config(Some(&file), &overrides).unwrap();
        assert_eq!(resolved.max_parallel_downloads, 3);
    }

    #[test]
    fn test_parse_toml_file_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "max_parallel_downloads = 2\nmax_chunk_concurrency = 6\n",
        )
        .unwrap();

        let file = load_file_config(&path).unwrap().unwrap();
        assert_eq!(file.max_parallel_downloads, Some(2));
        assert_eq!(file.max_chunk_concurrency, Some(6));
    }

    #[test]
    fn test_missing_config_file_returns_none() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("missing.toml");
        assert!(load_file_config(&path).unwrap().is_none());
    }

    #[test]
    fn test_invalid_toml_returns_config_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "not valid toml {{{").unwrap();
        assert!(matches!(
            load_file_config(&path),
            Err(EngineError::Config(_))
        ));
    }
}
