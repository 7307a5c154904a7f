//! Server configuration from environment variables.
//!
//! | Variable | Default |
//! |---|---|
//! | `HOST` | `127.0.0.1` |
//! | `PORT` | `8000` |
//! | `ARTIFACT_DIR` | `./code_artifacts` |
//! | `LLM_MODEL` | unset (role defaults) |
//! | `MAX_WORKER_STEPS` | `25` |
//! | `BROWSER_MAX_STEPS` | `10` |
//! | `BROWSER_HEADLESS` | `true` |
//! | `BROWSER_WINDOW` | `1280x720` |
//! | `BROWSER_KEEP_ALIVE` | `true` |
//! | `PYTHON_BIN` | `python3` |
//! | `TOOL_TIMEOUT_SECS` | `120` |
//! | `DELEGATION_TIMEOUT_SECS` | `900` |
//! | `SUPERVISOR_STAGES` | `full` (`collect` skips the analyst) |
//! | `STAGE_ATTEMPTS` | `2` |
//!
//! Provider credentials (`OPENAI_API_KEY`, `GOOGLE_API_KEY`, ...) are read
//! by the model resolver, not here.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::browser::BrowserOptions;

/// Which stages the supervisor runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorStages {
    /// Navigator, coder, analyst.
    Full,
    /// Navigator and coder only.
    Collect,
}

impl SupervisorStages {
    fn parse(value: &str) -> anyhow::Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "collect" => Ok(Self::Collect),
            other => Err(anyhow::anyhow!(
                "Invalid SUPERVISOR_STAGES '{other}'. Expected 'full' or 'collect'"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Directory every worker reads and writes artifacts in.
    pub artifact_dir: PathBuf,
    /// `provider:model` override for every role.
    pub llm_model: Option<String>,
    /// Reasoning steps per worker turn.
    pub max_worker_steps: usize,
    /// Browser actions per `browse_web` call.
    pub browser_max_steps: usize,
    pub browser: BrowserOptions,
    pub python_bin: String,
    /// Wall-clock budget of one code execution.
    pub tool_timeout: Duration,
    /// Wall-clock budget of one delegated worker turn.
    pub delegation_timeout: Duration,
    pub stages: SupervisorStages,
    /// Attempts per pipeline stage before the supervisor gives up.
    pub stage_attempts: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            artifact_dir: PathBuf::from("./code_artifacts"),
            llm_model: None,
            max_worker_steps: 25,
            browser_max_steps: 10,
            browser: BrowserOptions::default(),
            python_bin: "python3".to_string(),
            tool_timeout: Duration::from_secs(120),
            delegation_timeout: Duration::from_secs(900),
            stages: SupervisorStages::Full,
            stage_attempts: 2,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(std::env::vars().collect())
    }

    /// Build from an explicit variable map.
    pub fn from_vars(vars: HashMap<String, String>) -> anyhow::Result<Self> {
        let env = Vars(vars);
        let defaults = Config::default();

        let browser = BrowserOptions {
            headless: env.parse_bool("BROWSER_HEADLESS", defaults.browser.headless)?,
            window_size: match env.get("BROWSER_WINDOW") {
                Some(raw) => parse_window(raw)?,
                None => defaults.browser.window_size,
            },
            keep_alive: env.parse_bool("BROWSER_KEEP_ALIVE", defaults.browser.keep_alive)?,
        };

        Ok(Self {
            host: env.string("HOST", &defaults.host),
            port: env.parse("PORT", defaults.port)?,
            artifact_dir: env
                .get("ARTIFACT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifact_dir),
            llm_model: env.get("LLM_MODEL").map(str::to_string),
            max_worker_steps: env.parse_positive("MAX_WORKER_STEPS", defaults.max_worker_steps)?,
            browser_max_steps: env.parse_positive("BROWSER_MAX_STEPS", defaults.browser_max_steps)?,
            browser,
            python_bin: env.string("PYTHON_BIN", &defaults.python_bin),
            tool_timeout: Duration::from_secs(env.parse_positive("TOOL_TIMEOUT_SECS", 120u64)?),
            delegation_timeout: Duration::from_secs(
                env.parse_positive("DELEGATION_TIMEOUT_SECS", 900u64)?,
            ),
            stages: match env.get("SUPERVISOR_STAGES") {
                Some(raw) => SupervisorStages::parse(raw)?,
                None => defaults.stages,
            },
            stage_attempts: env.parse_positive("STAGE_ATTEMPTS", defaults.stage_attempts)?,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Variable lookup treating empty values as unset.
struct Vars(HashMap<String, String>);

impl Vars {
    fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> anyhow::Result<T>
    where
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(val) => val
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
            None => Ok(default),
        }
    }

    fn parse_positive<T>(&self, key: &str, default: T) -> anyhow::Result<T>
    where
        T: std::str::FromStr + PartialOrd + Default,
        T::Err: std::fmt::Display,
    {
        let value = self.parse(key, default)?;
        if value <= T::default() {
            anyhow::bail!("Env var {key} must be greater than zero");
        }
        Ok(value)
    }

    fn parse_bool(&self, key: &str, default: bool) -> anyhow::Result<bool> {
        match self.get(key).map(str::to_ascii_lowercase).as_deref() {
            None => Ok(default),
            Some("1" | "true" | "yes" | "on") => Ok(true),
            Some("0" | "false" | "no" | "off") => Ok(false),
            Some(other) => Err(anyhow::anyhow!("Failed to parse env var {key}={other}: expected a boolean")),
        }
    }
}

fn parse_window(raw: &str) -> anyhow::Result<(u32, u32)> {
    let (w, h) = raw
        .split_once(['x', 'X'])
        .ok_or_else(|| anyhow::anyhow!("Invalid BROWSER_WINDOW '{raw}'. Expected WIDTHxHEIGHT"))?;
    let w: u32 = w
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid BROWSER_WINDOW width '{w}': {e}"))?;
    let h: u32 = h
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid BROWSER_WINDOW height '{h}': {e}"))?;
    if w == 0 || h == 0 {
        anyhow::bail!("Invalid BROWSER_WINDOW '{raw}': dimensions must be non-zero");
    }
    Ok((w, h))
}
