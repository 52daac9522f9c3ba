/// `load_config` module: loads the connection settings file, applies environment overrides
/// and adapts the result into the core `SynchroniseConfig`.
///
/// This module is the only place where user-supplied configuration is parsed.
///
/// # Responsibilities
/// - Parse the YAML (or JSON) config file into [`CliConfig`]
/// - Apply `OWUI_*` / `CF_ACCESS_*` environment overrides, so secrets can stay out of the file
/// - Normalise the base URL and validate that credentials are present
/// - Build the retry policy and [`SynchroniseConfig`] the reconciler runs with
///
/// # Errors
/// All errors use `anyhow::Error` and are surfaced at the CLI boundary.
use anyhow::{bail, Result};
use knowledge_sync_core::config::{RetryPolicy, SynchroniseConfig};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info};

pub const ENV_BASE_URL: &str = "OWUI_BASE_URL";
pub const ENV_API_KEY: &str = "OWUI_API_KEY";
pub const ENV_JWT_TOKEN: &str = "OWUI_JWT_TOKEN";
pub const ENV_CF_CLIENT_ID: &str = "CF_ACCESS_CLIENT_ID";
pub const ENV_CF_CLIENT_SECRET: &str = "CF_ACCESS_CLIENT_SECRET";

#[derive(Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub jwt_token: Option<String>,
    #[serde(default)]
    pub cf_client_id: Option<String>,
    #[serde(default)]
    pub cf_client_secret: Option<String>,
    /// Where the sync state lives; defaults to a hidden file in the base directory.
    #[serde(default)]
    pub state_file: Option<PathBuf>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: Vec<u64>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_concurrency() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    4
}

fn default_backoff_ms() -> Vec<u64> {
    vec![500, 1000, 2000]
}

fn default_timeout_secs() -> u64 {
    30
}

// Secrets stay out of logs.
impl std::fmt::Debug for CliConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CliConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("jwt_token", &self.jwt_token.as_ref().map(|_| "<redacted>"))
            .field("cf_client_id", &self.cf_client_id)
            .field(
                "cf_client_secret",
                &self.cf_client_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("state_file", &self.state_file)
            .field("concurrency", &self.concurrency)
            .field("max_attempts", &self.max_attempts)
            .field("backoff_ms", &self.backoff_ms)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl CliConfig {
    /// Token for the `Authorization: Bearer` header: the JWT when set, else the API key.
    pub fn bearer_token(&self) -> Result<&str> {
        match (&self.jwt_token, &self.api_key) {
            (Some(jwt), _) => Ok(jwt.as_str()),
            (None, Some(key)) => Ok(key.as_str()),
            (None, None) => bail!(
                "either jwt_token or api_key is required (config file, {ENV_JWT_TOKEN} or {ENV_API_KEY})"
            ),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff_ms.iter().copied().map(Duration::from_millis).collect(),
            attempt_timeout: self.request_timeout(),
        }
    }

    pub fn synchronise_config(&self, base_dir: impl Into<PathBuf>) -> SynchroniseConfig {
        let mut config = SynchroniseConfig::new(base_dir);
        config.state_file = self.state_file.clone();
        config.concurrency = self.concurrency;
        config.retry = self.retry_policy();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Some(url) = env_value(ENV_BASE_URL) {
            self.base_url = url;
        }
        for (name, field) in [
            (ENV_API_KEY, &mut self.api_key),
            (ENV_JWT_TOKEN, &mut self.jwt_token),
            (ENV_CF_CLIENT_ID, &mut self.cf_client_id),
            (ENV_CF_CLIENT_SECRET, &mut self.cf_client_secret),
        ] {
            if let Some(value) = env_value(name) {
                debug!(variable = name, "Config value overridden from environment");
                *field = Some(value);
            }
        }
        // An empty string in the file means "not set".
        for field in [
            &mut self.api_key,
            &mut self.jwt_token,
            &mut self.cf_client_id,
            &mut self.cf_client_secret,
        ] {
            if field.as_deref().map(str::trim).is_some_and(str::is_empty) {
                *field = None;
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.base_url.is_empty() {
            bail!("base_url is required (config file or {ENV_BASE_URL})");
        }
        self.bearer_token()?;
        if self.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        if self.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        if self.timeout_secs == 0 {
            bail!("timeout_secs must be at least 1");
        }
        Ok(())
    }
}

fn env_value(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Adds `https://` when no scheme is given and drops trailing slashes.
pub fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

/// Loads the config file and applies environment overrides.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<CliConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => {
            info!(config_path = ?path_ref, "Config file read successfully");
            content
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow::anyhow!(
                "Failed to read config file {:?}: {}",
                path_ref,
                e
            ));
        }
    };

    let mut config: CliConfig = match serde_yaml::from_str(&config_content) {
        Ok(conf) => {
            info!(config_path = ?path_ref, "Parsed config successfully");
            conf
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config");
            return Err(anyhow::anyhow!("Failed to parse config {:?}: {e}", path_ref));
        }
    };

    config.apply_env_overrides();
    config.base_url = normalize_base_url(&config.base_url);

    if let Err(e) = config.validate() {
        error!(error = %e, config_path = ?path_ref, "Invalid configuration");
        return Err(e);
    }
    debug!(?config, "Configuration loaded (full debug)");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("chat.example.com"), "https://chat.example.com");
        assert_eq!(normalize_base_url("http://localhost:8080/"), "http://localhost:8080");
        assert_eq!(normalize_base_url(" https://x.io// "), "https://x.io");
        assert_eq!(normalize_base_url(""), "");
    }

    #[test]
    fn test_debug_output_redacts_secrets() {
        let config: CliConfig =
            serde_yaml::from_str("base_url: https://x.io\napi_key: sk-secret\n").unwrap();
        let printed = format!("{config:?}");
        assert!(!printed.contains("sk-secret"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn test_bearer_prefers_jwt() {
        let config: CliConfig =
            serde_yaml::from_str("base_url: x\napi_key: key\njwt_token: jwt\n").unwrap();
        assert_eq!(config.bearer_token().unwrap(), "jwt");
    }
}
