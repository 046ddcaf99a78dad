//! Ambient coordinator configuration (C12): the state directory, the
//! deployment's profile name, an optional client-interface override and the
//! global transfer concurrency budget.
//!
//! Grounded on the teacher's layered config-loading convention
//! (`shipcat_definitions::config::Config::read`, which overlays a master
//! YAML file with region-specific settings before CLI/env overrides are
//! applied). The coordinator has no region axis, so the layering collapses
//! to defaults < file < environment < explicit caller override, in that
//! order -- each later layer only touches the fields it actually sets.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::{ErrorKind, Result};

fn default_profile() -> String {
    "default".to_string()
}

fn default_max_concurrent_transfers() -> u32 {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Coordinator-wide settings, loaded by layering defaults < config file <
/// environment < explicit overrides (§4.12).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Base directory for the coordinator-profile symlink directory.
    /// `None` means "use the compiled-in default" (`default_state_dir`).
    pub localstate_dir: Option<PathBuf>,
    /// Deployment name -- the symlink this run commits/reads inside the
    /// coordinator-profile directory.
    pub profile: String,
    /// Overrides the `clientInterface` named on each target, if set.
    pub client_interface: Option<String>,
    /// Global bound on concurrent `copy_closure_{to,from}` subprocesses.
    pub max_concurrent_transfers: u32,
    /// Verbosity passed through to the `log`/`loggerv` setup in the CLI.
    pub log_level: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            localstate_dir: None,
            profile: default_profile(),
            client_interface: None,
            max_concurrent_transfers: default_max_concurrent_transfers(),
            log_level: default_log_level(),
        }
    }
}

/// Explicit overrides passed in by the thin CLI (C14). Only `Some` fields
/// are applied; this always wins over file and environment layers.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub localstate_dir: Option<PathBuf>,
    pub profile: Option<String>,
    pub client_interface: Option<String>,
    pub max_concurrent_transfers: Option<u32>,
    pub log_level: Option<String>,
}

impl CoordinatorConfig {
    /// The compiled-in default base directory for the coordinator-profile
    /// directory: `$LOCALSTATEDIR/nix/profiles/per-user/<user>/disnix-coordinator/`.
    pub fn default_state_dir() -> PathBuf {
        let user = env::var("USER").unwrap_or_else(|_| "default".to_string());
        PathBuf::from("/nix/var/nix/profiles/per-user")
            .join(user)
            .join("disnix-coordinator")
    }

    /// The directory this config actually points at: the explicit
    /// `localstate_dir` if set, otherwise the compiled-in default.
    pub fn state_dir(&self) -> PathBuf {
        self.localstate_dir
            .clone()
            .unwrap_or_else(Self::default_state_dir)
    }

    /// Loads a config file (YAML) if `path` is given and exists; returns
    /// built-in defaults otherwise. A `path` that is given but unreadable
    /// is a `ConfigError`, not a silent fallback.
    pub fn from_file(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p,
            None => return Ok(Self::default()),
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(path).map_err(|e| {
            ErrorKind::ConfigError(format!("cannot read config file '{}': {}", path.display(), e))
        })?;
        serde_yaml::from_str(&data)
            .map_err(|e| ErrorKind::ConfigError(format!("cannot parse config file '{}': {}", path.display(), e)).into())
    }

    /// Overlays environment variables onto `self`. Recognizes
    /// `DISNIX_STATE_DIR`, `DISNIX_PROFILE`, `DISNIX_CLIENT_INTERFACE`,
    /// `DISNIX_MAX_CONCURRENT_TRANSFERS` and `DISNIX_LOG_LEVEL`; absent
    /// variables leave the corresponding field untouched.
    pub fn overlay_env(mut self) -> Result<Self> {
        if let Ok(v) = env::var("DISNIX_STATE_DIR") {
            self.localstate_dir = Some(PathBuf::from(v));
        }
        if let Ok(v) = env::var("DISNIX_PROFILE") {
            self.profile = v;
        }
        if let Ok(v) = env::var("DISNIX_CLIENT_INTERFACE") {
            self.client_interface = Some(v);
        }
        if let Ok(v) = env::var("DISNIX_MAX_CONCURRENT_TRANSFERS") {
            let parsed: u32 = v.parse().map_err(|_| {
                ErrorKind::ConfigError(format!(
                    "DISNIX_MAX_CONCURRENT_TRANSFERS must be a positive integer, got '{}'",
                    v
                ))
            })?;
            self.max_concurrent_transfers = parsed;
        }
        if let Ok(v) = env::var("DISNIX_LOG_LEVEL") {
            self.log_level = v;
        }
        Ok(self)
    }

    /// Applies the CLI's explicit overrides last, so they always win over
    /// file and environment layers.
    pub fn merge_cli_overrides(mut self, overrides: CliOverrides) -> Self {
        if let Some(v) = overrides.localstate_dir {
            self.localstate_dir = Some(v);
        }
        if let Some(v) = overrides.profile {
            self.profile = v;
        }
        if let Some(v) = overrides.client_interface {
            self.client_interface = Some(v);
        }
        if let Some(v) = overrides.max_concurrent_transfers {
            self.max_concurrent_transfers = v;
        }
        if let Some(v) = overrides.log_level {
            self.log_level = v;
        }
        self
    }

    /// Loads the full layered config: defaults < `config_path` (if given)
    /// < environment < `overrides`. Validates the result before returning.
    pub fn load(config_path: Option<&Path>, overrides: CliOverrides) -> Result<Self> {
        let cfg = Self::from_file(config_path)?
            .overlay_env()?
            .merge_cli_overrides(overrides);
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_transfers < 1 {
            return Err(ErrorKind::ConfigError(
                "max_concurrent_transfers must be at least 1".into(),
            )
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = CoordinatorConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.profile, "default");
        assert_eq!(cfg.max_concurrent_transfers, 2);
    }

    #[test]
    fn validate_rejects_zero_transfers() {
        let mut cfg = CoordinatorConfig::default();
        cfg.max_concurrent_transfers = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn cli_overrides_win_over_defaults() {
        let cfg = CoordinatorConfig::default();
        let overrides = CliOverrides {
            profile: Some("staging".into()),
            max_concurrent_transfers: Some(5),
            ..Default::default()
        };
        let merged = cfg.merge_cli_overrides(overrides);
        assert_eq!(merged.profile, "staging");
        assert_eq!(merged.max_concurrent_transfers, 5);
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let cfg = CoordinatorConfig::from_file(Some(Path::new("/nonexistent/disnix.yaml"))).unwrap();
        assert_eq!(cfg, CoordinatorConfig::default());
    }

    #[test]
    fn state_dir_uses_override_when_set() {
        let mut cfg = CoordinatorConfig::default();
        cfg.localstate_dir = Some(PathBuf::from("/srv/disnix"));
        assert_eq!(cfg.state_dir(), PathBuf::from("/srv/disnix"));
    }
}
