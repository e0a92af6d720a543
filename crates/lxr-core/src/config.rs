//! Configuration management for lxr
//!
//! Static provisioning defaults live in a TOML file (`/etc/lxr/config.toml`
//! unless overridden). Everything here is data: package lists, runner
//! download locations, probe hosts and timing policies. Per-run identity
//! (scope, owner, credential) comes from the command line instead.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::types::{RetryPolicy, SandboxShape};
use crate::{LxrError, Result};

/// Default config file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/lxr/config.toml";

/// Top-level lxr configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LxrConfig {
    #[serde(default)]
    pub sandbox: SandboxDefaults,

    #[serde(default)]
    pub packages: PackageConfig,

    #[serde(default)]
    pub runner: RunnerConfig,

    #[serde(default)]
    pub timing: TimingConfig,

    #[serde(default)]
    pub probe: ProbeConfig,
}

/// Sandbox sizing and host placement defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxDefaults {
    pub template: String,
    pub cores: u32,
    pub memory_mb: u32,
    pub swap_mb: u32,
    pub bootstrap_disk_gb: u32,
    pub disk_gb: u32,
    pub unprivileged: bool,
    pub nesting: bool,
    pub storage: String,
    pub bridge: String,
    pub dns_server: String,
}

/// Packages installed inside the sandbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageConfig {
    /// Installed under the retry policy right after the network comes up
    #[serde(default = "default_base_packages")]
    pub base: Vec<String>,

    /// Installed once, without retries
    #[serde(default = "default_dependency_packages")]
    pub dependencies: Vec<String>,
}

/// In-sandbox agent settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub version: String,
    /// Release download root; `/v{version}/actions-runner-linux-x64-{version}.tar.gz` is appended
    pub download_base_url: String,
    pub user: String,
    pub install_dir: String,
    pub labels: Vec<String>,
    pub name_prefix: String,
    /// Control-plane REST API root
    pub api_url: String,
    /// Control-plane web root, used for the agent's registration URL
    pub web_url: String,
    pub request_timeout_secs: u64,
}

/// Retry and polling policies
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Pause between first boot and the DHCP reboot
    pub dhcp_settle_secs: u64,
    pub network_probe: RetryPolicy,
    pub package_install: RetryPolicy,
}

/// Hosts used for network readiness checks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Pinged by address, proves routing
    pub reachability_host: String,
    /// Pinged by name, proves DNS
    pub resolution_host: String,
}

fn default_base_packages() -> Vec<String> {
    ["curl", "ca-certificates", "git", "jq", "tar", "sudo"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_dependency_packages() -> Vec<String> {
    [
        "build-essential",
        "unzip",
        "zip",
        "libicu-dev",
        "libssl-dev",
        "docker.io",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for SandboxDefaults {
    fn default() -> Self {
        let shape = SandboxShape::default();
        Self {
            template: shape.template,
            cores: shape.cores,
            memory_mb: shape.memory_mb,
            swap_mb: shape.swap_mb,
            bootstrap_disk_gb: shape.bootstrap_disk_gb,
            disk_gb: shape.disk_gb,
            unprivileged: shape.unprivileged,
            nesting: shape.nesting,
            storage: "local-lvm".to_string(),
            bridge: "vmbr0".to_string(),
            dns_server: "1.1.1.1".to_string(),
        }
    }
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            base: default_base_packages(),
            dependencies: default_dependency_packages(),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            version: "2.321.0".to_string(),
            download_base_url: "https://github.com/actions/runner/releases/download".to_string(),
            user: "runner".to_string(),
            install_dir: "/home/runner/actions-runner".to_string(),
            labels: vec!["self-hosted".to_string(), "linux".to_string(), "x64".to_string()],
            name_prefix: "lxr-runner".to_string(),
            api_url: "https://api.github.com".to_string(),
            web_url: "https://github.com".to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            dhcp_settle_secs: 10,
            network_probe: RetryPolicy::NETWORK_PROBE,
            package_install: RetryPolicy::PACKAGE_INSTALL,
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            reachability_host: "1.1.1.1".to_string(),
            resolution_host: "github.com".to_string(),
        }
    }
}

impl SandboxDefaults {
    pub fn shape(&self) -> SandboxShape {
        SandboxShape {
            template: self.template.clone(),
            cores: self.cores,
            memory_mb: self.memory_mb,
            swap_mb: self.swap_mb,
            bootstrap_disk_gb: self.bootstrap_disk_gb,
            disk_gb: self.disk_gb,
            unprivileged: self.unprivileged,
            nesting: self.nesting,
        }
    }
}

impl RunnerConfig {
    /// Download URL of the runner release tarball
    pub fn download_url(&self) -> String {
        format!(
            "{}/v{}/actions-runner-linux-x64-{}.tar.gz",
            self.download_base_url.trim_end_matches('/'),
            self.version,
            self.version
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl TimingConfig {
    pub fn dhcp_settle_delay(&self) -> Duration {
        Duration::from_secs(self.dhcp_settle_secs)
    }
}

impl LxrConfig {
    /// Load configuration from `path`, or use defaults if it does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Write default configuration to `path`, creating parent directories
    pub fn write_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| LxrError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values that would make a run meaningless
    pub fn validate(&self) -> Result<()> {
        for (name, policy) in [
            ("timing.network_probe", &self.timing.network_probe),
            ("timing.package_install", &self.timing.package_install),
        ] {
            if policy.max_attempts == 0 {
                return Err(LxrError::Config(format!("{}.max_attempts must be >= 1", name)));
            }
        }
        if self.sandbox.template.trim().is_empty() {
            return Err(LxrError::Config("sandbox.template must not be empty".to_string()));
        }
        if self.sandbox.disk_gb <= self.sandbox.bootstrap_disk_gb {
            return Err(LxrError::Config(format!(
                "sandbox.disk_gb ({}) must exceed sandbox.bootstrap_disk_gb ({})",
                self.sandbox.disk_gb, self.sandbox.bootstrap_disk_gb
            )));
        }
        if self.runner.user.trim().is_empty() || self.runner.install_dir.trim().is_empty() {
            return Err(LxrError::Config(
                "runner.user and runner.install_dir must be set".to_string(),
            ));
        }
        if self.packages.base.is_empty() {
            return Err(LxrError::Config("packages.base must not be empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = LxrConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.timing.network_probe, RetryPolicy::NETWORK_PROBE);
        assert_eq!(config.timing.package_install, RetryPolicy::PACKAGE_INSTALL);
        assert_eq!(config.runner.user, "runner");
    }

    #[test]
    fn test_write_default_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lxr/config.toml");
        LxrConfig::write_default(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("delay_secs = 2"));

        let config = LxrConfig::load_or_default(&path).unwrap();
        assert_eq!(config.sandbox.bridge, "vmbr0");
        assert_eq!(config.packages.base, default_base_packages());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[sandbox]
cores = 8

[timing.package_install]
max_attempts = 5
delay_secs = 1
"#,
        )
        .unwrap();

        let config = LxrConfig::load_or_default(&path).unwrap();
        assert_eq!(config.sandbox.cores, 8);
        assert_eq!(config.sandbox.memory_mb, 4096);
        assert_eq!(
            config.timing.package_install,
            RetryPolicy::new(5, Duration::from_secs(1))
        );
        assert_eq!(config.timing.network_probe, RetryPolicy::NETWORK_PROBE);
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[timing.network_probe]\nmax_attempts = 0\ndelay_secs = 2\n",
        )
        .unwrap();
        assert!(matches!(
            LxrConfig::load_or_default(&path),
            Err(LxrError::Config(_))
        ));
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sandbox\ncores = ").unwrap();
        assert!(matches!(
            LxrConfig::load_or_default(&path),
            Err(LxrError::ConfigParse(_))
        ));
    }

    #[test]
    fn test_download_url() {
        let runner = RunnerConfig::default();
        assert_eq!(
            runner.download_url(),
            "https://github.com/actions/runner/releases/download/v2.321.0/actions-runner-linux-x64-2.321.0.tar.gz"
        );
    }
}
