//! Configuration management for system-builder.
//!
//! Reads configuration from the environment. `.env` in the current directory
//! and `~/.system_builder.env` are loaded into the environment first (see
//! [`load_env_files`]); variables already set take precedence over both.

use std::path::PathBuf;
use tracing::debug;

use crate::release::ReleaseNumber;
use crate::target::DEFAULT_MIRROR;

/// Per-user env file, looked up in the home directory.
pub const USER_ENV_FILE: &str = ".system_builder.env";

/// system-builder configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    /// Skip apt index refresh (OFFLINE=true)
    pub offline: bool,
    /// Release number imposed by the caller (BOX_RELEASE_NUMBER)
    pub release_number: Option<ReleaseNumber>,
    /// Shared secret exported to provisioning (SYSTEM_BUILDER_SECRET)
    pub secret: Option<String>,
    /// Root the build/ and dist/ directories are linked into (WORKING_DIR)
    pub working_dir: Option<PathBuf>,
    /// Where `dist` collects artifacts (DIST)
    pub dist: Option<PathBuf>,
    /// Timeout in seconds for long running tools (TIMEOUT)
    pub timeout: Option<u64>,
    /// Verbose provisioning (PUPPET_DEBUG=true)
    pub puppet_debug: bool,
    /// HTTP proxy for debootstrap and apt (APT_PROXY)
    pub apt_proxy: Option<String>,
    /// Live mirror for non-archived releases (DEBIAN_MIRROR)
    pub debian_mirror: Option<String>,
    /// Base URL of published releases (RELEASE_BASE_URL)
    pub release_base_url: Option<String>,
    /// Owner of generated files (USER)
    pub user: Option<String>,
}

impl Config {
    /// Configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        // Blank values count as unset
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let flag = |key: &str| get(key).map(|v| v == "true" || v == "1").unwrap_or(false);

        let release_number = get("BOX_RELEASE_NUMBER").and_then(|value| {
            let parsed = ReleaseNumber::parse(&value);
            if parsed.is_none() {
                debug!("Ignoring malformed BOX_RELEASE_NUMBER '{}'", value);
            }
            parsed
        });

        let timeout = get("TIMEOUT").and_then(|value| value.parse().ok());

        Self {
            offline: flag("OFFLINE"),
            release_number,
            secret: get("SYSTEM_BUILDER_SECRET"),
            working_dir: get("WORKING_DIR").map(PathBuf::from),
            dist: get("DIST").map(PathBuf::from),
            timeout,
            puppet_debug: flag("PUPPET_DEBUG"),
            apt_proxy: get("APT_PROXY"),
            debian_mirror: get("DEBIAN_MIRROR"),
            release_base_url: get("RELEASE_BASE_URL"),
            user: get("USER"),
        }
    }

    /// Live mirror to use when the target has none of its own.
    pub fn default_mirror(&self) -> &str {
        self.debian_mirror.as_deref().unwrap_or(DEFAULT_MIRROR)
    }

    /// Print configuration for debugging.
    pub fn print(&self) {
        fn show<T: std::fmt::Display>(value: &Option<T>) -> String {
            value
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "(unset)".to_string())
        }

        println!("Configuration:");
        println!("  OFFLINE: {}", self.offline);
        println!("  BOX_RELEASE_NUMBER: {}", show(&self.release_number));
        println!(
            "  SYSTEM_BUILDER_SECRET: {}",
            if self.secret.is_some() { "(set)" } else { "(unset)" }
        );
        println!(
            "  WORKING_DIR: {}",
            show(&self.working_dir.as_ref().map(|p| p.display()))
        );
        println!("  DIST: {}", show(&self.dist.as_ref().map(|p| p.display())));
        println!("  TIMEOUT: {}", show(&self.timeout));
        println!("  PUPPET_DEBUG: {}", self.puppet_debug);
        println!("  APT_PROXY: {}", show(&self.apt_proxy));
        println!("  DEBIAN_MIRROR: {}", self.default_mirror());
        println!("  RELEASE_BASE_URL: {}", show(&self.release_base_url));
        println!("  USER: {}", show(&self.user));
    }
}

/// Load `.env` and `~/.system_builder.env` into the process environment.
///
/// Missing or unreadable files are skipped. Variables that are already set
/// win. Returns the files loaded; this runs before logging is set up, so
/// the caller reports them.
pub fn load_env_files() -> Vec<PathBuf> {
    let mut loaded = Vec::new();
    if let Ok(path) = dotenvy::dotenv() {
        loaded.push(path);
    }
    if let Some(home) = dirs::home_dir() {
        let user_env = home.join(USER_ENV_FILE);
        if user_env.exists() && dotenvy::from_path(&user_env).is_ok() {
            loaded.push(user_env);
        }
    }
    loaded
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = config(&[]);
        assert_eq!(config, Config::default());
        assert_eq!(config.default_mirror(), DEFAULT_MIRROR);
    }

    #[test]
    fn flags_and_values() {
        let config = config(&[
            ("OFFLINE", "true"),
            ("PUPPET_DEBUG", "1"),
            ("APT_PROXY", "http://localhost:3142"),
            ("DEBIAN_MIRROR", "http://mirror.local/debian"),
            ("TIMEOUT", "900"),
            ("DIST", "/srv/dist"),
        ]);
        assert!(config.offline);
        assert!(config.puppet_debug);
        assert_eq!(config.apt_proxy.as_deref(), Some("http://localhost:3142"));
        assert_eq!(config.default_mirror(), "http://mirror.local/debian");
        assert_eq!(config.timeout, Some(900));
        assert_eq!(config.dist, Some(PathBuf::from("/srv/dist")));
    }

    #[test]
    fn offline_requires_true() {
        assert!(!config(&[("OFFLINE", "no")]).offline);
    }

    #[test]
    fn blank_values_are_unset() {
        let config = config(&[("APT_PROXY", "  "), ("USER", "")]);
        assert_eq!(config.apt_proxy, None);
        assert_eq!(config.user, None);
    }

    #[test]
    fn release_number_is_validated() {
        let good = config(&[("BOX_RELEASE_NUMBER", "20240101-0930")]);
        assert_eq!(
            good.release_number.map(|n| n.to_string()).as_deref(),
            Some("20240101-0930")
        );

        let bad = config(&[("BOX_RELEASE_NUMBER", "tomorrow")]);
        assert_eq!(bad.release_number, None);
    }
}
