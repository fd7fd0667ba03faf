//! Remote model policy.
//!
//! Whether remote repositories may be used is decided by the first source
//! that has an opinion, in this order:
//!
//! 1. `offline_mode = true` denies.
//! 2. An explicit `allow_remote_models` setting decides.
//! 3. The `TRIDENT_ALLOW_REMOTE_MODELS` environment flag decides.
//! 4. Otherwise remote use is denied.

use std::fmt;

use crate::config::{parse_flag, EngineConfig, ENV_ALLOW_REMOTE_MODELS};

/// Which rule decided the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicySource {
    OfflineMode,
    Explicit,
    Environment,
    Default,
}

impl fmt::Display for PolicySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicySource::OfflineMode => f.write_str("offline_mode"),
            PolicySource::Explicit => f.write_str("allow_remote_models"),
            PolicySource::Environment => write!(f, "{}", ENV_ALLOW_REMOTE_MODELS),
            PolicySource::Default => f.write_str("default"),
        }
    }
}

/// Resolved remote-model policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemotePolicy {
    pub allow_remote: bool,
    pub decided_by: PolicySource,
}

impl RemotePolicy {
    /// Applies the precedence rules to the given inputs. `env_value` is
    /// the raw value of `TRIDENT_ALLOW_REMOTE_MODELS`, if set.
    pub fn resolve(
        offline_mode: bool,
        allow_remote_models: Option<bool>,
        env_value: Option<&str>,
    ) -> Self {
        if offline_mode {
            return Self::decided(false, PolicySource::OfflineMode);
        }
        if let Some(allow) = allow_remote_models {
            return Self::decided(allow, PolicySource::Explicit);
        }
        if let Some(raw) = env_value {
            match parse_flag(raw) {
                Some(allow) => return Self::decided(allow, PolicySource::Environment),
                None => tracing::warn!(
                    variable = ENV_ALLOW_REMOTE_MODELS,
                    value = raw,
                    "ignoring unrecognised flag value"
                ),
            }
        }
        Self::decided(false, PolicySource::Default)
    }

    /// Resolves from a config and the process environment.
    pub fn from_config(config: &EngineConfig) -> Self {
        let env = std::env::var(ENV_ALLOW_REMOTE_MODELS).ok();
        Self::resolve(config.offline_mode, config.allow_remote_models, env.as_deref())
    }

    /// Explicitly permits remote repositories.
    pub fn allow() -> Self {
        Self::decided(true, PolicySource::Explicit)
    }

    /// Explicitly forbids remote repositories.
    pub fn deny() -> Self {
        Self::decided(false, PolicySource::Explicit)
    }

    /// Forbids remote repositories because the engine is offline.
    pub fn offline() -> Self {
        Self::decided(false, PolicySource::OfflineMode)
    }

    fn decided(allow_remote: bool, decided_by: PolicySource) -> Self {
        Self {
            allow_remote,
            decided_by,
        }
    }
}

impl Default for RemotePolicy {
    fn default() -> Self {
        Self::decided(false, PolicySource::Default)
    }
}
