use anyhow::{Context, Result};
use entropy_search_core::peaks::CleaningParams;
use entropy_search_core::search::SearchParams;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub preprocess: PreprocessConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Reject submissions while a job is active instead of superseding it.
    #[serde(default)]
    pub reject_when_busy: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            reject_when_busy: false,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8711".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_ms1_tolerance")]
    pub ms1_tolerance_in_da: f64,
    #[serde(default = "default_ms2_tolerance")]
    pub ms2_tolerance_in_da: f64,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default)]
    pub score_min: f64,
    #[serde(default = "default_cores")]
    pub cores: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            ms1_tolerance_in_da: default_ms1_tolerance(),
            ms2_tolerance_in_da: default_ms2_tolerance(),
            top_n: default_top_n(),
            score_min: 0.0,
            cores: default_cores(),
        }
    }
}

fn default_ms1_tolerance() -> f64 {
    0.01
}
fn default_ms2_tolerance() -> f64 {
    0.02
}
fn default_top_n() -> usize {
    100
}
fn default_cores() -> usize {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct PreprocessConfig {
    #[serde(default = "default_precursor_removal")]
    pub precursor_removal_da: f64,
    #[serde(default = "default_noise_threshold")]
    pub noise_threshold: f64,
    /// Skip malformed records instead of failing the whole file.
    #[serde(default)]
    pub skip_invalid_records: bool,
    /// Keep a `<library>.esi` copy next to text libraries and reuse it while
    /// it is newer than the source.
    #[serde(default)]
    pub cache_library: bool,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            precursor_removal_da: default_precursor_removal(),
            noise_threshold: default_noise_threshold(),
            skip_invalid_records: false,
            cache_library: false,
        }
    }
}

fn default_precursor_removal() -> f64 {
    CleaningParams::DEFAULT_PRECURSOR_REMOVAL_DA
}
fn default_noise_threshold() -> f64 {
    CleaningParams::DEFAULT_NOISE_THRESHOLD
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

impl Config {
    /// Search parameters with per-request overrides for the tolerances and
    /// ranking knobs.
    pub fn search_params(&self, ms1_tolerance: f64, ms2_tolerance: f64, top_n: usize, score_min: f64) -> SearchParams {
        SearchParams {
            ms1_tolerance,
            ms2_tolerance,
            top_n,
            score_min,
            cleaning: CleaningParams {
                precursor_removal_da: self.preprocess.precursor_removal_da,
                noise_threshold: self.preprocess.noise_threshold,
                min_peak_distance: 2.0 * ms2_tolerance,
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_tolerances(self.search.ms1_tolerance_in_da, self.search.ms2_tolerance_in_da)?;
        validate_ranking(self.search.top_n, self.search.score_min)?;

        if self.search.cores == 0 {
            anyhow::bail!("search.cores must be >= 1");
        }

        if self.preprocess.precursor_removal_da < 0.0 {
            anyhow::bail!("preprocess.precursor_removal_da must be >= 0");
        }

        if !(0.0..1.0).contains(&self.preprocess.noise_threshold) {
            anyhow::bail!("preprocess.noise_threshold must be in [0.0, 1.0)");
        }

        Ok(())
    }
}

pub fn validate_tolerances(ms1: f64, ms2: f64) -> Result<()> {
    if !(ms1.is_finite() && ms1 > 0.0) {
        anyhow::bail!("ms1_tolerance_in_da must be > 0");
    }
    if !(ms2.is_finite() && ms2 > 0.0) {
        anyhow::bail!("ms2_tolerance_in_da must be > 0");
    }
    Ok(())
}

pub fn validate_ranking(top_n: usize, score_min: f64) -> Result<()> {
    if top_n < 1 {
        anyhow::bail!("top_n must be >= 1");
    }
    if !(0.0..=1.0).contains(&score_min) {
        anyhow::bail!("score_min must be in [0.0, 1.0]");
    }
    Ok(())
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn empty_file_uses_defaults() {
        let file = write_config("");
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:8711");
        assert!(!config.server.reject_when_busy);
        assert_eq!(config.search.ms1_tolerance_in_da, 0.01);
        assert_eq!(config.search.ms2_tolerance_in_da, 0.02);
        assert_eq!(config.search.top_n, 100);
        assert_eq!(config.search.cores, 1);
        assert_eq!(config.preprocess.precursor_removal_da, 1.6);
        assert!(!config.preprocess.skip_invalid_records);
        assert!(!config.preprocess.cache_library);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn partial_sections_override() {
        let file = write_config(
            r#"
[server]
reject_when_busy = true

[search]
top_n = 5
cores = 4

[preprocess]
cache_library = true
"#,
        );
        let config = load_config(file.path()).unwrap();
        assert!(config.server.reject_when_busy);
        assert!(config.preprocess.cache_library);
        assert_eq!(config.server.bind, "127.0.0.1:8711");
        assert_eq!(config.search.top_n, 5);
        assert_eq!(config.search.cores, 4);
        assert_eq!(config.search.ms2_tolerance_in_da, 0.02);
    }

    #[test]
    fn rejects_invalid_values() {
        for bad in [
            "[search]\nms1_tolerance_in_da = 0.0",
            "[search]\nms2_tolerance_in_da = -1.0",
            "[search]\ntop_n = 0",
            "[search]\nscore_min = 1.5",
            "[search]\ncores = 0",
            "[preprocess]\nnoise_threshold = 1.0",
        ] {
            let file = write_config(bad);
            assert!(load_config(file.path()).is_err(), "accepted: {}", bad);
        }
    }

    #[test]
    fn search_params_follow_tolerance() {
        let config = Config::default();
        let params = config.search_params(0.01, 0.05, 10, 0.2);
        assert_eq!(params.cleaning.min_peak_distance, 0.1);
        assert_eq!(params.top_n, 10);
        assert_eq!(params.score_min, 0.2);
    }
}
