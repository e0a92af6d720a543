//! Core type definitions for lxr provisioning

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use uuid::Uuid;

use crate::{LxrError, Result};

/// Lowest id the container host hands out
pub const MIN_SANDBOX_ID: u32 = 100;

/// Registration scope of the runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Repository,
    Organization,
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Repository => write!(f, "repository"),
            Self::Organization => write!(f, "organization"),
        }
    }
}

impl std::str::FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "repository" | "repo" => Ok(Self::Repository),
            "organization" | "organisation" | "org" => Ok(Self::Organization),
            _ => Err(format!("Invalid scope: {}", s)),
        }
    }
}

/// How the sandbox obtains its address
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    #[default]
    Dhcp,
    Static,
}

impl std::fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dhcp => write!(f, "dhcp"),
            Self::Static => write!(f, "static"),
        }
    }
}

impl std::str::FromStr for NetworkMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dhcp" => Ok(Self::Dhcp),
            "static" => Ok(Self::Static),
            _ => Err(format!("Invalid network mode: {}", s)),
        }
    }
}

/// Host-assigned container id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SandboxId(pub u32);

impl std::fmt::Display for SandboxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SandboxId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let id: u32 = s
            .trim()
            .parse()
            .map_err(|_| format!("Invalid sandbox id: {}", s))?;
        if id < MIN_SANDBOX_ID {
            return Err(format!("Sandbox id must be >= {}: {}", MIN_SANDBOX_ID, id));
        }
        Ok(Self(id))
    }
}

/// Provisioning stages, in the only order they may be reached
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    #[default]
    Uninitialized,
    Allocated,
    Sized,
    Booted,
    NetworkReady,
    BaseToolsInstalled,
    DependenciesInstalled,
    TokenObtained,
    AgentRegistered,
    Complete,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 10] = [
        Self::Uninitialized,
        Self::Allocated,
        Self::Sized,
        Self::Booted,
        Self::NetworkReady,
        Self::BaseToolsInstalled,
        Self::DependenciesInstalled,
        Self::TokenObtained,
        Self::AgentRegistered,
        Self::Complete,
    ];

    /// The state directly after this one, `None` for `Complete`
    pub fn next(self) -> Option<Self> {
        let idx = Self::ALL.iter().position(|s| *s == self)?;
        Self::ALL.get(idx + 1).copied()
    }

    /// True between `Allocated` (inclusive) and `Complete` (exclusive)
    pub fn requires_cleanup(self) -> bool {
        self >= Self::Allocated && self != Self::Complete
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Allocated => "allocated",
            Self::Sized => "sized",
            Self::Booted => "booted",
            Self::NetworkReady => "network_ready",
            Self::BaseToolsInstalled => "base_tools_installed",
            Self::DependenciesInstalled => "dependencies_installed",
            Self::TokenObtained => "token_obtained",
            Self::AgentRegistered => "agent_registered",
            Self::Complete => "complete",
        };
        write!(f, "{}", name)
    }
}

/// Bounded fixed-delay policy for retries and polling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(rename = "delay_secs", with = "duration_secs")]
    pub delay: Duration,
}

impl RetryPolicy {
    /// Network readiness: 30 polls, 2s apart
    pub const NETWORK_PROBE: RetryPolicy = RetryPolicy::new(30, Duration::from_secs(2));

    /// Base package installation: 3 attempts, 5s apart
    pub const PACKAGE_INSTALL: RetryPolicy = RetryPolicy::new(3, Duration::from_secs(5));

    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Attempt bound, never below one
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Long-lived control-plane credential. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credential(***)")
    }
}

/// Repository- or organization-scoped registration target
///
/// Built only through request validation, so a repository target always
/// carries a repository and an organization target never does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationTarget {
    Repository { owner: String, repository: String },
    Organization { owner: String },
}

impl RegistrationTarget {
    pub fn scope(&self) -> Scope {
        match self {
            Self::Repository { .. } => Scope::Repository,
            Self::Organization { .. } => Scope::Organization,
        }
    }

    pub fn owner(&self) -> &str {
        match self {
            Self::Repository { owner, .. } | Self::Organization { owner } => owner,
        }
    }

    pub fn repository(&self) -> Option<&str> {
        match self {
            Self::Repository { repository, .. } => Some(repository),
            Self::Organization { .. } => None,
        }
    }

    /// URL the in-sandbox agent registers against
    pub fn runner_url(&self, web_base: &str) -> String {
        let base = web_base.trim_end_matches('/');
        match self {
            Self::Repository { owner, repository } => format!("{}/{}/{}", base, owner, repository),
            Self::Organization { owner } => format!("{}/{}", base, owner),
        }
    }
}

/// Address assignment on the sandbox's primary interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkAssignment {
    Dhcp,
    Static { address: String, gateway: Ipv4Addr },
}

/// Network settings derived from the request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    pub bridge: String,
    pub dns_server: IpAddr,
    pub assignment: NetworkAssignment,
}

impl NetworkConfig {
    pub fn mode(&self) -> NetworkMode {
        match self.assignment {
            NetworkAssignment::Dhcp => NetworkMode::Dhcp,
            NetworkAssignment::Static { .. } => NetworkMode::Static,
        }
    }
}

/// Compute and storage sizing for a new sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxShape {
    /// Container template volume id, e.g. `local:vztmpl/ubuntu-24.04-standard_24.04-2_amd64.tar.zst`
    pub template: String,
    pub cores: u32,
    pub memory_mb: u32,
    pub swap_mb: u32,
    /// Root disk size at allocation time
    pub bootstrap_disk_gb: u32,
    /// Root disk size after the resize stage
    pub disk_gb: u32,
    pub unprivileged: bool,
    pub nesting: bool,
}

impl Default for SandboxShape {
    fn default() -> Self {
        Self {
            template: "local:vztmpl/ubuntu-24.04-standard_24.04-2_amd64.tar.zst".to_string(),
            cores: 2,
            memory_mb: 4096,
            swap_mb: 512,
            bootstrap_disk_gb: 4,
            disk_gb: 20,
            unprivileged: true,
            nesting: true,
        }
    }
}

impl SandboxShape {
    fn validate(&self) -> Result<()> {
        if self.template.trim().is_empty() {
            return Err(LxrError::Validation("template must not be empty".to_string()));
        }
        if self.cores == 0 {
            return Err(LxrError::Validation("cores must be at least 1".to_string()));
        }
        if self.memory_mb < 128 {
            return Err(LxrError::Validation(format!(
                "memory_mb must be at least 128, got {}",
                self.memory_mb
            )));
        }
        if self.disk_gb <= self.bootstrap_disk_gb {
            return Err(LxrError::Validation(format!(
                "disk_gb ({}) must exceed bootstrap_disk_gb ({})",
                self.disk_gb, self.bootstrap_disk_gb
            )));
        }
        Ok(())
    }
}

/// Unvalidated request as assembled from flags and config
#[derive(Debug, Clone)]
pub struct RequestDraft {
    pub scope: Scope,
    pub owner: String,
    pub repository: Option<String>,
    pub credential: Credential,
    pub storage: String,
    pub bridge: String,
    pub dns_server: String,
    pub network_mode: NetworkMode,
    pub static_address: Option<String>,
    pub gateway: Option<String>,
    pub sandbox_id: Option<SandboxId>,
    pub runner_name: String,
    pub labels: Vec<String>,
    pub shape: SandboxShape,
}

impl RequestDraft {
    /// Check every invariant once and freeze the request
    pub fn validate(self) -> Result<ProvisioningRequest> {
        validate_name("owner", &self.owner)?;

        let repository = self
            .repository
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());
        let target = match (self.scope, repository) {
            (Scope::Repository, Some(repository)) => {
                validate_name("repository", &repository)?;
                RegistrationTarget::Repository {
                    owner: self.owner,
                    repository,
                }
            }
            (Scope::Repository, None) => {
                return Err(LxrError::Validation(
                    "repository scope requires a repository".to_string(),
                ))
            }
            (Scope::Organization, Some(repository)) => {
                return Err(LxrError::Validation(format!(
                    "organization scope must not name a repository (got '{}')",
                    repository
                )))
            }
            (Scope::Organization, None) => RegistrationTarget::Organization { owner: self.owner },
        };

        if self.credential.expose().trim().is_empty() {
            return Err(LxrError::Validation("credential must not be empty".to_string()));
        }
        if self.storage.trim().is_empty() {
            return Err(LxrError::Validation("storage backend must not be empty".to_string()));
        }
        if self.bridge.trim().is_empty() {
            return Err(LxrError::Validation("network bridge must not be empty".to_string()));
        }

        let dns_server: IpAddr = self.dns_server.trim().parse().map_err(|_| {
            LxrError::Validation(format!("invalid DNS server address: {}", self.dns_server))
        })?;

        let assignment = match self.network_mode {
            NetworkMode::Dhcp => {
                if self.static_address.is_some() || self.gateway.is_some() {
                    return Err(LxrError::Validation(
                        "static address and gateway are only valid in static mode".to_string(),
                    ));
                }
                NetworkAssignment::Dhcp
            }
            NetworkMode::Static => {
                let address = self.static_address.ok_or_else(|| {
                    LxrError::Validation("static mode requires an address".to_string())
                })?;
                validate_cidr(&address)?;
                let gateway = self.gateway.ok_or_else(|| {
                    LxrError::Validation("static mode requires a gateway".to_string())
                })?;
                let gateway: Ipv4Addr = gateway.trim().parse().map_err(|_| {
                    LxrError::Validation(format!("invalid gateway address: {}", gateway))
                })?;
                NetworkAssignment::Static {
                    address: address.trim().to_string(),
                    gateway,
                }
            }
        };

        if let Some(id) = self.sandbox_id {
            if id.0 < MIN_SANDBOX_ID {
                return Err(LxrError::Validation(format!(
                    "sandbox id must be >= {}, got {}",
                    MIN_SANDBOX_ID, id
                )));
            }
        }

        validate_hostname(&self.runner_name)?;
        for label in &self.labels {
            if label.trim().is_empty() || label.contains(',') {
                return Err(LxrError::Validation(format!("invalid runner label: '{}'", label)));
            }
        }
        self.shape.validate()?;

        Ok(ProvisioningRequest {
            target,
            credential: self.credential,
            storage: self.storage.trim().to_string(),
            network: NetworkConfig {
                bridge: self.bridge.trim().to_string(),
                dns_server,
                assignment,
            },
            sandbox_id: self.sandbox_id,
            runner_name: self.runner_name,
            labels: self.labels,
            shape: self.shape,
        })
    }
}

fn validate_name(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(LxrError::Validation(format!("{} must not be empty", field)));
    }
    let ok = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !ok || value.starts_with('.') {
        return Err(LxrError::Validation(format!("invalid {}: '{}'", field, value)));
    }
    Ok(())
}

fn validate_hostname(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 63
        && !name.starts_with('-')
        && !name.ends_with('-')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    if ok {
        Ok(())
    } else {
        Err(LxrError::Validation(format!(
            "runner name must be a valid hostname: '{}'",
            name
        )))
    }
}

fn validate_cidr(value: &str) -> Result<()> {
    let invalid = || LxrError::Validation(format!("static address must be IPv4 CIDR: '{}'", value));
    let (addr, prefix) = value.trim().split_once('/').ok_or_else(invalid)?;
    addr.parse::<Ipv4Addr>().map_err(|_| invalid())?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
    if prefix == 0 || prefix > 32 {
        return Err(invalid());
    }
    Ok(())
}

/// Fully validated, immutable provisioning request
#[derive(Debug, Clone)]
pub struct ProvisioningRequest {
    target: RegistrationTarget,
    credential: Credential,
    storage: String,
    network: NetworkConfig,
    sandbox_id: Option<SandboxId>,
    runner_name: String,
    labels: Vec<String>,
    shape: SandboxShape,
}

impl ProvisioningRequest {
    pub fn scope(&self) -> Scope {
        self.target.scope()
    }

    pub fn owner(&self) -> &str {
        self.target.owner()
    }

    pub fn repository(&self) -> Option<&str> {
        self.target.repository()
    }

    pub fn target(&self) -> &RegistrationTarget {
        &self.target
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn storage_backend(&self) -> &str {
        &self.storage
    }

    pub fn network(&self) -> &NetworkConfig {
        &self.network
    }

    /// Explicit id requested by the operator, if any
    pub fn sandbox_id(&self) -> Option<SandboxId> {
        self.sandbox_id
    }

    /// Runner name, also used as the sandbox hostname
    pub fn runner_name(&self) -> &str {
        &self.runner_name
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn shape(&self) -> &SandboxShape {
        &self.shape
    }
}

/// Generate a runner name such as `lxr-runner-1a2b3c4d`
pub fn generate_runner_name(prefix: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix.trim_end_matches('-'), &suffix[..8])
}

/// The sandbox being built by one provisioning run
#[derive(Debug, Clone)]
pub struct SandboxResource {
    /// Assigned by the host on allocation
    pub id: Option<SandboxId>,
    pub state: LifecycleState,
    pub network: NetworkConfig,
}

impl SandboxResource {
    pub fn new(network: NetworkConfig) -> Self {
        Self {
            id: None,
            state: LifecycleState::Uninitialized,
            network,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> RequestDraft {
        RequestDraft {
            scope: Scope::Repository,
            owner: "acme".to_string(),
            repository: Some("widgets".to_string()),
            credential: Credential::new("tok"),
            storage: "local-lvm".to_string(),
            bridge: "vmbr0".to_string(),
            dns_server: "1.1.1.1".to_string(),
            network_mode: NetworkMode::Dhcp,
            static_address: None,
            gateway: None,
            sandbox_id: None,
            runner_name: "lxr-runner-0001".to_string(),
            labels: vec!["self-hosted".to_string()],
            shape: SandboxShape::default(),
        }
    }

    #[test]
    fn test_valid_repository_request() {
        let request = draft().validate().unwrap();
        assert_eq!(request.scope(), Scope::Repository);
        assert_eq!(request.owner(), "acme");
        assert_eq!(request.repository(), Some("widgets"));
        assert_eq!(request.network().mode(), NetworkMode::Dhcp);
    }

    #[test]
    fn test_repository_scope_requires_repository() {
        let mut d = draft();
        d.repository = Some("  ".to_string());
        assert!(matches!(d.validate(), Err(LxrError::Validation(_))));
    }

    #[test]
    fn test_organization_scope_rejects_repository() {
        let mut d = draft();
        d.scope = Scope::Organization;
        assert!(matches!(d.validate(), Err(LxrError::Validation(_))));

        let mut d = draft();
        d.scope = Scope::Organization;
        d.repository = None;
        let request = d.validate().unwrap();
        assert_eq!(request.repository(), None);
        assert_eq!(request.scope(), Scope::Organization);
    }

    #[test]
    fn test_static_mode_requires_address_and_gateway() {
        let mut d = draft();
        d.network_mode = NetworkMode::Static;
        assert!(d.validate().is_err());

        let mut d = draft();
        d.network_mode = NetworkMode::Static;
        d.static_address = Some("10.0.0.5/24".to_string());
        d.gateway = Some("10.0.0.1".to_string());
        let request = d.validate().unwrap();
        assert_eq!(
            request.network().assignment,
            NetworkAssignment::Static {
                address: "10.0.0.5/24".to_string(),
                gateway: Ipv4Addr::new(10, 0, 0, 1),
            }
        );
    }

    #[test]
    fn test_static_address_must_be_cidr() {
        let mut d = draft();
        d.network_mode = NetworkMode::Static;
        d.static_address = Some("10.0.0.5".to_string());
        d.gateway = Some("10.0.0.1".to_string());
        assert!(d.validate().is_err());
    }

    #[test]
    fn test_dhcp_rejects_static_fields() {
        let mut d = draft();
        d.gateway = Some("10.0.0.1".to_string());
        assert!(d.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_names_and_dns() {
        let mut d = draft();
        d.owner = "acme/evil".to_string();
        assert!(d.validate().is_err());

        let mut d = draft();
        d.dns_server = "not-an-ip".to_string();
        assert!(d.validate().is_err());

        let mut d = draft();
        d.runner_name = "-bad".to_string();
        assert!(d.validate().is_err());

        let mut d = draft();
        d.credential = Credential::new(" ");
        assert!(d.validate().is_err());
    }

    #[test]
    fn test_shape_disk_must_grow() {
        let mut d = draft();
        d.shape.disk_gb = d.shape.bootstrap_disk_gb;
        assert!(d.validate().is_err());
    }

    #[test]
    fn test_lifecycle_order() {
        assert_eq!(LifecycleState::Uninitialized.next(), Some(LifecycleState::Allocated));
        assert_eq!(LifecycleState::AgentRegistered.next(), Some(LifecycleState::Complete));
        assert_eq!(LifecycleState::Complete.next(), None);

        assert!(!LifecycleState::Uninitialized.requires_cleanup());
        assert!(LifecycleState::Allocated.requires_cleanup());
        assert!(LifecycleState::AgentRegistered.requires_cleanup());
        assert!(!LifecycleState::Complete.requires_cleanup());
    }

    #[test]
    fn test_runner_url() {
        let repo = RegistrationTarget::Repository {
            owner: "acme".to_string(),
            repository: "widgets".to_string(),
        };
        assert_eq!(repo.runner_url("https://github.com/"), "https://github.com/acme/widgets");

        let org = RegistrationTarget::Organization {
            owner: "acme".to_string(),
        };
        assert_eq!(org.runner_url("https://github.com"), "https://github.com/acme");
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let cred = Credential::new("ghp_supersecret");
        assert!(!format!("{:?}", cred).contains("supersecret"));
        assert!(!format!("{:?}", draft()).contains("tok\""));
    }

    #[test]
    fn test_generate_runner_name() {
        let name = generate_runner_name("lxr-runner-");
        assert!(name.starts_with("lxr-runner-"));
        assert_eq!(name.len(), "lxr-runner-".len() + 8);
        assert!(validate_hostname(&name).is_ok());
    }

    #[test]
    fn test_sandbox_id_parse() {
        assert_eq!("105".parse::<SandboxId>().unwrap(), SandboxId(105));
        assert!("99".parse::<SandboxId>().is_err());
        assert!("abc".parse::<SandboxId>().is_err());
    }
}
