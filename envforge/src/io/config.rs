//! envforge configuration stored in `envforge.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::heuristics::Heuristics;
use crate::core::usage::{ModelPrice, default_pricing};

pub const DEFAULT_CONFIG_FILE: &str = "envforge.toml";

/// envforge configuration (TOML).
///
/// Intended to be edited by humans. Missing fields fall back to the
/// defaults below, so an empty file is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EnvforgeConfig {
    /// Oracle steps before the run is declared incomplete.
    pub max_steps: u32,

    /// Leave the final container running for manual inspection.
    pub keep_container: bool,

    /// Host directory the repository is cloned into (wiped on every run).
    pub workplace: PathBuf,

    /// Root of run artifacts (`<output_dir>/runs/<run-id>/`).
    pub output_dir: PathBuf,

    pub sandbox: SandboxConfig,
    pub oracle: OracleConfig,
    pub heuristics: Heuristics,

    /// USD per one million tokens, keyed by model name.
    pub pricing: BTreeMap<String, ModelPrice>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Image every run starts from; also the `FROM` line of the Dockerfile.
    pub base_image: String,
    /// Mount point of the workplace and working directory of every command.
    pub workdir: String,
    pub docker_bin: String,
    /// Wall-clock limit for one command; a timed-out command is a failure.
    pub command_timeout_secs: u64,
    /// Truncate command output beyond this many bytes.
    pub output_limit_bytes: usize,
    pub snapshot_repository: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            base_image: "python:3.10".to_string(),
            workdir: "/app".to_string(),
            docker_bin: "docker".to_string(),
            command_timeout_secs: 30 * 60,
            output_limit_bytes: 200_000,
            snapshot_repository: "envforge-snapshot".to_string(),
        }
    }
}

impl SandboxConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OracleBackend {
    /// `codex exec` with a structured reply schema.
    Codex,
    /// Any command reading the prompt on stdin and answering in ReAct text.
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OracleConfig {
    pub backend: OracleBackend,
    pub model: String,
    pub codex_bin: String,
    /// Argv for the `command` backend (e.g. `["llm", "-m", "gpt-4o"]`).
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// Bytes of each observation shown back to the oracle (tail kept).
    pub observation_limit_bytes: usize,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            backend: OracleBackend::Codex,
            model: "gpt-4o".to_string(),
            codex_bin: "codex".to_string(),
            command: Vec::new(),
            timeout_secs: 600,
            observation_limit_bytes: 8_000,
        }
    }
}

impl OracleConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for EnvforgeConfig {
    fn default() -> Self {
        Self {
            max_steps: 30,
            keep_container: false,
            workplace: PathBuf::from("workplace"),
            output_dir: PathBuf::from(".envforge"),
            sandbox: SandboxConfig::default(),
            oracle: OracleConfig::default(),
            heuristics: Heuristics::default(),
            pricing: default_pricing(),
        }
    }
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub base_image: Option<String>,
    pub model: Option<String>,
    pub max_steps: Option<u32>,
    pub keep_container: bool,
    pub workplace: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
}

impl EnvforgeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(anyhow!("max_steps must be > 0"));
        }
        if self.workplace.as_os_str().is_empty() {
            return Err(anyhow!("workplace must be a non-empty path"));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(anyhow!("output_dir must be a non-empty path"));
        }
        if self.sandbox.base_image.trim().is_empty() {
            return Err(anyhow!("sandbox.base_image must be non-empty"));
        }
        if !self.sandbox.workdir.starts_with('/') {
            return Err(anyhow!("sandbox.workdir must be an absolute path"));
        }
        if self.sandbox.docker_bin.trim().is_empty() {
            return Err(anyhow!("sandbox.docker_bin must be non-empty"));
        }
        if self.sandbox.command_timeout_secs == 0 {
            return Err(anyhow!("sandbox.command_timeout_secs must be > 0"));
        }
        if self.sandbox.output_limit_bytes == 0 {
            return Err(anyhow!("sandbox.output_limit_bytes must be > 0"));
        }
        if self.sandbox.snapshot_repository.trim().is_empty() {
            return Err(anyhow!("sandbox.snapshot_repository must be non-empty"));
        }
        if self.oracle.model.trim().is_empty() {
            return Err(anyhow!("oracle.model must be non-empty"));
        }
        if self.oracle.timeout_secs == 0 {
            return Err(anyhow!("oracle.timeout_secs must be > 0"));
        }
        if self.oracle.observation_limit_bytes == 0 {
            return Err(anyhow!("oracle.observation_limit_bytes must be > 0"));
        }
        match self.oracle.backend {
            OracleBackend::Codex if self.oracle.codex_bin.trim().is_empty() => {
                return Err(anyhow!("oracle.codex_bin must be non-empty"));
            }
            OracleBackend::Command
                if self.oracle.command.first().is_none_or(|p| p.trim().is_empty()) =>
            {
                return Err(anyhow!(
                    "oracle.command must be a non-empty array for the command backend"
                ));
            }
            _ => {}
        }
        for (model, price) in &self.pricing {
            if price.input < 0.0 || price.output < 0.0 {
                return Err(anyhow!("pricing.{model} must not be negative"));
            }
        }
        self.heuristics
            .validate()
            .map_err(|err| anyhow!("heuristics: {err}"))?;
        Ok(())
    }

    /// Apply command-line overrides, then re-validate.
    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) -> Result<()> {
        if let Some(image) = overrides.base_image {
            self.sandbox.base_image = image;
        }
        if let Some(model) = overrides.model {
            self.oracle.model = model;
        }
        if let Some(steps) = overrides.max_steps {
            self.max_steps = steps;
        }
        if overrides.keep_container {
            self.keep_container = true;
        }
        if let Some(workplace) = overrides.workplace {
            self.workplace = workplace;
        }
        if let Some(output_dir) = overrides.output_dir {
            self.output_dir = output_dir;
        }
        self.validate()
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EnvforgeConfig::default()`.
pub fn load_config(path: &Path) -> Result<EnvforgeConfig> {
    if !path.exists() {
        let cfg = EnvforgeConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut cfg: EnvforgeConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.pricing = merged_pricing(cfg.pricing);
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Layer file entries over the built-in table so unknown models keep a fallback row.
fn merged_pricing(overrides: BTreeMap<String, ModelPrice>) -> BTreeMap<String, ModelPrice> {
    let mut pricing = default_pricing();
    pricing.extend(overrides);
    pricing
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EnvforgeConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write `contents` next to `path` and rename it into place.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
