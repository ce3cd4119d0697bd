//! CLI configuration: JSON file, then environment, then flags

use serde::{Deserialize, Serialize};
use shellcraft_agent::AgentConfig;
use shellcraft_core::context::{DEFAULT_BUDGET_CHARS, DEFAULT_MAX_OUTPUT_CHARS};
use shellcraft_core::{ContextConfig, Error, ProviderConfig, Result, ShellConfig};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Config file looked up in the current directory
pub const LOCAL_CONFIG_FILE: &str = ".shellcraft.json";

pub const DEFAULT_MODEL: &str = "qwen3-max";

/// OpenAI-compatible endpoint that serves `DEFAULT_MODEL`
pub const DEFAULT_BASE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShellcraftConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    /// Extra HTTP headers sent with every model request
    pub headers: BTreeMap<String, String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<usize>,
    pub request_timeout_secs: u64,
    pub stream: bool,
    pub max_iterations: usize,
    pub command_timeout_secs: u64,
    pub session_timeout_secs: Option<u64>,
    pub context_budget_chars: usize,
    pub max_output_chars: usize,
    pub max_malformed_replies: usize,
    pub max_consecutive_timeouts: usize,
    pub model_retries: u32,
    pub model_retry_delay_ms: u64,
    pub shell: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
    pub posix_paths: bool,
}

impl Default for ShellcraftConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            headers: BTreeMap::new(),
            temperature: None,
            max_tokens: None,
            request_timeout_secs: 300,
            stream: true,
            max_iterations: 20,
            command_timeout_secs: 30,
            session_timeout_secs: None,
            context_budget_chars: DEFAULT_BUDGET_CHARS,
            max_output_chars: DEFAULT_MAX_OUTPUT_CHARS,
            max_malformed_replies: 3,
            max_consecutive_timeouts: 3,
            model_retries: 2,
            model_retry_delay_ms: 1000,
            shell: None,
            working_dir: None,
            posix_paths: cfg!(windows),
        }
    }
}

impl ShellcraftConfig {
    /// Load the config file, if any.
    ///
    /// An explicit path must exist. Otherwise `SHELLCRAFT_CONFIG` is tried,
    /// then `.shellcraft.json` in the current directory, then defaults.
    pub fn load<F>(explicit: Option<&Path>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        if let Some(path) = lookup("SHELLCRAFT_CONFIG").filter(|p| !p.is_empty()) {
            return Self::from_file(Path::new(&path));
        }
        let local = Path::new(LOCAL_CONFIG_FILE);
        if local.is_file() {
            return Self::from_file(local);
        }
        Ok(Self::default())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::from(e)
                .with_operation("config::from_file")
                .with_context("path", path.display().to_string())
        })?;

        serde_json::from_str(&text).map_err(|e| {
            Error::config_invalid(format!("invalid config file: {}", e))
                .with_operation("config::from_file")
                .with_context("path", path.display().to_string())
                .set_source(e)
        })
    }

    /// Apply environment overrides through `lookup` (normally `std::env::var`)
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = get("SHELLCRAFT_API_KEY").or_else(|| get("OPENAI_API_KEY")) {
            self.api_key = Some(key);
        }
        if let Some(url) = get("SHELLCRAFT_BASE_URL") {
            self.base_url = url;
        }
        if let Some(model) = get("SHELLCRAFT_MODEL") {
            self.model = model;
        }
        if let Some(v) = get("SHELLCRAFT_MAX_ITERATIONS") {
            self.max_iterations = parse_env("SHELLCRAFT_MAX_ITERATIONS", &v)?;
        }
        if let Some(v) = get("SHELLCRAFT_COMMAND_TIMEOUT_SECS") {
            self.command_timeout_secs = parse_env("SHELLCRAFT_COMMAND_TIMEOUT_SECS", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::config_invalid(msg).with_operation("config::validate"));

        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return invalid(format!("base_url must be an http(s) URL, got '{}'", self.base_url));
        }
        if self.model.trim().is_empty() {
            return invalid("model must not be empty".to_string());
        }
        if self.max_iterations == 0 {
            return invalid("max_iterations must be at least 1".to_string());
        }
        if self.command_timeout_secs == 0 {
            return invalid("command_timeout_secs must be at least 1".to_string());
        }
        if self.session_timeout_secs == Some(0) {
            return invalid("session_timeout_secs must be at least 1".to_string());
        }
        if self.max_output_chars == 0 || self.context_budget_chars == 0 {
            return invalid("context sizes must be greater than zero".to_string());
        }
        if let Some(dir) = &self.working_dir {
            if !dir.is_dir() {
                return invalid(format!("working_dir '{}' is not a directory", dir.display()));
            }
        }
        Ok(())
    }

    pub fn provider_config(&self) -> ProviderConfig {
        let mut config = ProviderConfig::compatible(&self.base_url, &self.model)
            .with_timeout(self.request_timeout_secs);
        if let Some(key) = &self.api_key {
            config = config.with_api_key(key);
        }
        for (name, value) in &self.headers {
            config = config.with_header(name, value);
        }
        config
    }

    pub fn agent_config(&self) -> AgentConfig {
        let mut shell = ShellConfig::default();
        if let Some(program) = &self.shell {
            shell.program = program.clone();
        }
        shell.working_dir = self.working_dir.clone();

        AgentConfig {
            model: Some(self.model.clone()),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: self.stream,
            max_iterations: self.max_iterations,
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            session_timeout: self.session_timeout_secs.map(Duration::from_secs),
            max_malformed_replies: self.max_malformed_replies,
            max_consecutive_timeouts: self.max_consecutive_timeouts,
            model_retries: self.model_retries,
            model_retry_delay: Duration::from_millis(self.model_retry_delay_ms),
            posix_paths: self.posix_paths,
            context: ContextConfig {
                budget_chars: self.context_budget_chars,
                max_output_chars: self.max_output_chars,
                ..ContextConfig::default()
            },
            shell,
        }
    }

    /// Copy safe to print
    pub fn redacted(&self) -> Self {
        Self {
            api_key: self.api_key.as_ref().map(|_| "***".to_string()),
            ..self.clone()
        }
    }
}

fn parse_env<T: FromStr>(key: &'static str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| {
        Error::config_invalid(format!("{}: cannot parse '{}': {}", key, value, e))
            .with_operation("config::apply_env")
            .with_context("variable", key)
    })
}
