use std::{env, fs, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::models::ToolType;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub jwt_secret: String,
    pub cors_origin: Option<String>,
    /// Empty means every target is in scope.
    pub scope_allowlist: Vec<String>,
    /// Binary used as `<runtime> exec <container> ...`; `none` runs tools on the host.
    pub container_runtime: String,
    pub container_prefix: String,
    pub disabled_tools: Vec<ToolType>,
    pub scan_timeout_secs: u64,
    pub max_output_bytes: usize,
    pub max_concurrent_scans: usize,
    pub queue_capacity: usize,
    pub submissions_per_minute: usize,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = env::var("ASMHAWK_CONFIG").unwrap_or_else(|_| "config.json".to_string());
        let file_cfg: Option<AppConfig> = fs::read_to_string(&path)
            .ok()
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .with_context(|| format!("failed to parse {path}"))?;

        let mut cfg = file_cfg.unwrap_or_default();
        cfg.apply_env(|key| env::var(key).ok())?;
        Ok(cfg)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(v) = var("ASMHAWK_HOST") {
            self.host = v;
        }
        if let Some(v) = var("ASMHAWK_PORT") {
            self.port = v.parse().context("ASMHAWK_PORT must be a port number")?;
        }
        if let Some(v) = var("ASMHAWK_DATABASE_URL") {
            self.database_url = v;
        }
        if let Some(v) = var("ASMHAWK_JWT_SECRET") {
            self.jwt_secret = v;
        }
        if let Some(v) = var("ASMHAWK_CORS_ORIGIN") {
            self.cors_origin = Some(v);
        }
        if let Some(v) = var("ASMHAWK_SCOPE_ALLOWLIST") {
            self.scope_allowlist = split_list(&v);
        }
        if let Some(v) = var("ASMHAWK_CONTAINER_RUNTIME") {
            self.container_runtime = v;
        }
        if let Some(v) = var("ASMHAWK_CONTAINER_PREFIX") {
            self.container_prefix = v;
        }
        if let Some(v) = var("ASMHAWK_DISABLED_TOOLS") {
            self.disabled_tools = split_list(&v)
                .iter()
                .map(|name| name.parse::<ToolType>())
                .collect::<Result<_, _>>()
                .context("ASMHAWK_DISABLED_TOOLS lists an unknown tool")?;
        }
        if let Some(v) = var("ASMHAWK_SCAN_TIMEOUT_SECS") {
            self.scan_timeout_secs = v.parse().context("ASMHAWK_SCAN_TIMEOUT_SECS")?;
        }
        if let Some(v) = var("ASMHAWK_MAX_OUTPUT_BYTES") {
            self.max_output_bytes = v.parse().context("ASMHAWK_MAX_OUTPUT_BYTES")?;
        }
        if let Some(v) = var("ASMHAWK_MAX_CONCURRENT_SCANS") {
            self.max_concurrent_scans = v.parse().context("ASMHAWK_MAX_CONCURRENT_SCANS")?;
        }
        if let Some(v) = var("ASMHAWK_QUEUE_CAPACITY") {
            self.queue_capacity = v.parse().context("ASMHAWK_QUEUE_CAPACITY")?;
        }
        if let Some(v) = var("ASMHAWK_SUBMISSIONS_PER_MINUTE") {
            self.submissions_per_minute = v.parse().context("ASMHAWK_SUBMISSIONS_PER_MINUTE")?;
        }
        Ok(())
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3100,
            database_url: "sqlite://asmhawk.db".to_string(),
            jwt_secret: "change-me".to_string(),
            cors_origin: None,
            scope_allowlist: Vec::new(),
            container_runtime: "docker".to_string(),
            container_prefix: "asm-hawk-".to_string(),
            disabled_tools: Vec::new(),
            scan_timeout_secs: 300,
            max_output_bytes: 50 * 1024 * 1024,
            max_concurrent_scans: 4,
            queue_capacity: 128,
            submissions_per_minute: 30,
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
