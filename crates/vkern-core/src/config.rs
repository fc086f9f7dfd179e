#![forbid(unsafe_code)]

//! Runtime configuration: run mode, cull timeout, and nesting bound.
//!
//! A process-wide [`RuntimeConfig`] is held in an [`ArcSwap`] so readers on
//! any thread see a consistent snapshot without locking. Tests (and embedders
//! that host several independent servers) can override the run mode for the
//! current thread only with [`with_mode`] / [`push_mode`]; overrides stack
//! and are removed by RAII guards, in the same way capability overrides are.
//!
//! # Sources
//!
//! | Source | Entry point |
//! |--------|-------------|
//! | Defaults | [`RuntimeConfig::default`] |
//! | Environment | [`RuntimeConfig::from_env`] (`VKERN_MODE`, `VKERN_CULL_TIMEOUT_MS`, `VKERN_MAX_CONTEXT_DEPTH`) |
//! | TOML | [`RuntimeConfig::from_toml_str`] |

use std::cell::RefCell;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Deserialize;

/// Default time a disconnected session survives before it is culled.
pub const DEFAULT_CULL_TIMEOUT: Duration = Duration::from_secs(60);

/// Default bound on nested `enter` calls per thread.
pub const DEFAULT_MAX_CONTEXT_DEPTH: usize = 64;

/// Development surfaces misuse loudly; production logs and keeps serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[serde(alias = "dev")]
    Development,
    #[serde(alias = "prod")]
    Production,
}

impl RunMode {
    /// The misuse policy implied by this mode.
    #[must_use]
    pub const fn misuse_policy(self) -> MisusePolicy {
        match self {
            Self::Development => MisusePolicy::Panic,
            Self::Production => MisusePolicy::Log,
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "dev" | "development" => Some(Self::Development),
            "prod" | "production" => Some(Self::Production),
            _ => None,
        }
    }
}

impl Default for RunMode {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::Development
        } else {
            Self::Production
        }
    }
}

/// What to do when a [`ContextMisuseError`](crate::error::ContextMisuseError) is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MisusePolicy {
    /// Abort the current operation with a panic carrying the full error.
    Panic,
    /// Log at `error` level and recover.
    Log,
}

/// Tunables for the session layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub mode: RunMode,
    /// How long a disconnected session waits for a reconnect before closing.
    pub cull_timeout: Duration,
    /// Maximum nested `enter` depth per thread.
    pub max_context_depth: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::default(),
            cull_timeout: DEFAULT_CULL_TIMEOUT,
            max_context_depth: DEFAULT_MAX_CONTEXT_DEPTH,
        }
    }
}

/// Failure to load configuration from TOML or the environment.
#[derive(Debug)]
pub enum ConfigError {
    Toml(toml::de::Error),
    InvalidValue { key: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Toml(err) => write!(f, "invalid config file: {err}"),
            Self::InvalidValue { key, value } => write!(f, "invalid value {value:?} for {key}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Toml(err) => Some(err),
            Self::InvalidValue { .. } => None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    mode: Option<RunMode>,
    cull_timeout_ms: Option<u64>,
    max_context_depth: Option<usize>,
}

impl RuntimeConfig {
    /// Builder-style cull timeout override.
    #[must_use]
    pub fn with_cull_timeout(mut self, timeout: Duration) -> Self {
        self.cull_timeout = timeout;
        self
    }

    /// Builder-style run mode override.
    #[must_use]
    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    /// Builder-style nesting bound override.
    #[must_use]
    pub fn with_max_context_depth(mut self, depth: usize) -> Self {
        self.max_context_depth = depth;
        self
    }

    /// Parse a TOML document. Missing keys keep their defaults.
    ///
    /// ```
    /// use vkern_core::config::{RuntimeConfig, RunMode};
    ///
    /// let cfg = RuntimeConfig::from_toml_str("mode = \"production\"\ncull_timeout_ms = 250").unwrap();
    /// assert_eq!(cfg.mode, RunMode::Production);
    /// assert_eq!(cfg.cull_timeout.as_millis(), 250);
    /// ```
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(source).map_err(ConfigError::Toml)?;
        let mut cfg = Self::default();
        if let Some(mode) = file.mode {
            cfg.mode = mode;
        }
        if let Some(ms) = file.cull_timeout_ms {
            cfg.cull_timeout = Duration::from_millis(ms);
        }
        if let Some(depth) = file.max_context_depth {
            cfg.max_context_depth = depth;
        }
        Ok(cfg)
    }

    /// Read overrides from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Read overrides through an arbitrary lookup function.
    pub fn from_env_with<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(raw) = lookup("VKERN_MODE") {
            cfg.mode = RunMode::parse(&raw).ok_or(ConfigError::InvalidValue {
                key: "VKERN_MODE",
                value: raw,
            })?;
        }
        if let Some(raw) = lookup("VKERN_CULL_TIMEOUT_MS") {
            let ms = raw.trim().parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                key: "VKERN_CULL_TIMEOUT_MS",
                value: raw.clone(),
            })?;
            cfg.cull_timeout = Duration::from_millis(ms);
        }
        if let Some(raw) = lookup("VKERN_MAX_CONTEXT_DEPTH") {
            cfg.max_context_depth =
                raw.trim()
                    .parse::<usize>()
                    .map_err(|_| ConfigError::InvalidValue {
                        key: "VKERN_MAX_CONTEXT_DEPTH",
                        value: raw.clone(),
                    })?;
        }
        Ok(cfg)
    }
}

// ============================================================================
// Process-wide active config
// ============================================================================

fn active() -> &'static ArcSwap<RuntimeConfig> {
    static ACTIVE: OnceLock<ArcSwap<RuntimeConfig>> = OnceLock::new();
    ACTIVE.get_or_init(|| ArcSwap::from_pointee(RuntimeConfig::default()))
}

/// Snapshot of the process-wide configuration.
#[must_use]
pub fn current() -> Arc<RuntimeConfig> {
    active().load_full()
}

/// Replace the process-wide configuration.
pub fn install(cfg: RuntimeConfig) {
    tracing::debug!(mode = ?cfg.mode, cull_timeout_ms = cfg.cull_timeout.as_millis() as u64, "runtime config installed");
    active().store(Arc::new(cfg));
}

// ============================================================================
// Thread-local run mode overrides
// ============================================================================

thread_local! {
    static MODE_OVERRIDES: RefCell<Vec<RunMode>> = const { RefCell::new(Vec::new()) };
}

/// RAII guard returned by [`push_mode`].
#[must_use = "the mode override is removed when the guard is dropped"]
pub struct ModeGuard {
    _marker: std::marker::PhantomData<*const ()>,
}

impl Drop for ModeGuard {
    fn drop(&mut self) {
        MODE_OVERRIDES.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Override the run mode for the current thread until the guard drops.
pub fn push_mode(mode: RunMode) -> ModeGuard {
    MODE_OVERRIDES.with(|stack| stack.borrow_mut().push(mode));
    ModeGuard {
        _marker: std::marker::PhantomData,
    }
}

/// Run `f` with `mode` active on this thread.
pub fn with_mode<F, R>(mode: RunMode, f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = push_mode(mode);
    f()
}

/// Effective run mode on this thread.
#[must_use]
pub fn run_mode() -> RunMode {
    MODE_OVERRIDES
        .with(|stack| stack.borrow().last().copied())
        .unwrap_or_else(|| current().mode)
}

/// Effective misuse policy on this thread.
#[must_use]
pub fn misuse_policy() -> MisusePolicy {
    run_mode().misuse_policy()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.cull_timeout, Duration::from_secs(60));
        assert_eq!(cfg.max_context_depth, 64);
    }

    #[test]
    fn env_overrides_all_fields() {
        let cfg = RuntimeConfig::from_env_with(lookup(&[
            ("VKERN_MODE", "prod"),
            ("VKERN_CULL_TIMEOUT_MS", "200"),
            ("VKERN_MAX_CONTEXT_DEPTH", "8"),
        ]))
        .unwrap();
        assert_eq!(cfg.mode, RunMode::Production);
        assert_eq!(cfg.cull_timeout, Duration::from_millis(200));
        assert_eq!(cfg.max_context_depth, 8);
    }

    #[test]
    fn env_rejects_garbage() {
        let err = RuntimeConfig::from_env_with(lookup(&[("VKERN_CULL_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "VKERN_CULL_TIMEOUT_MS",
                ..
            }
        ));
    }

    #[test]
    fn toml_partial_keeps_defaults() {
        let cfg = RuntimeConfig::from_toml_str("max_context_depth = 4").unwrap();
        assert_eq!(cfg.max_context_depth, 4);
        assert_eq!(cfg.cull_timeout, DEFAULT_CULL_TIMEOUT);
    }

    #[test]
    fn toml_unknown_key_is_error() {
        assert!(RuntimeConfig::from_toml_str("cull = 3").is_err());
    }

    #[test]
    fn mode_override_is_scoped_and_lifo() {
        let base = run_mode();
        {
            let _outer = push_mode(RunMode::Production);
            assert_eq!(run_mode(), RunMode::Production);
            {
                let _inner = push_mode(RunMode::Development);
                assert_eq!(misuse_policy(), MisusePolicy::Panic);
            }
            assert_eq!(misuse_policy(), MisusePolicy::Log);
        }
        assert_eq!(run_mode(), base);
    }
}
