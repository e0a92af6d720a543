//! Container host abstraction and the `pct` backed implementation

use async_trait::async_trait;
use lxr_core::{LxrError, NetworkAssignment, NetworkConfig, Result, SandboxId, SandboxShape};
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::exec::{ExecOutput, ExecRequest};

/// Everything the host needs to create a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationSpec {
    pub id: SandboxId,
    pub hostname: String,
    pub storage: String,
    pub shape: SandboxShape,
    pub network: NetworkConfig,
}

impl AllocationSpec {
    /// `net0` option value for the primary interface
    pub fn net0(&self) -> String {
        let mut value = format!("name=eth0,bridge={}", self.network.bridge);
        match &self.network.assignment {
            NetworkAssignment::Dhcp => value.push_str(",ip=dhcp"),
            NetworkAssignment::Static { address, gateway } => {
                value.push_str(&format!(",ip={},gw={}", address, gateway));
            }
        }
        value
    }

    /// Arguments to `pct create`
    pub fn create_args(&self) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            self.id.to_string(),
            self.shape.template.clone(),
            "--hostname".to_string(),
            self.hostname.clone(),
            "--cores".to_string(),
            self.shape.cores.to_string(),
            "--memory".to_string(),
            self.shape.memory_mb.to_string(),
            "--swap".to_string(),
            self.shape.swap_mb.to_string(),
            "--rootfs".to_string(),
            format!("{}:{}", self.storage, self.shape.bootstrap_disk_gb),
            "--net0".to_string(),
            self.net0(),
            "--nameserver".to_string(),
            self.network.dns_server.to_string(),
            "--unprivileged".to_string(),
            if self.shape.unprivileged { "1" } else { "0" }.to_string(),
            "--onboot".to_string(),
            "0".to_string(),
        ];
        if self.shape.nesting {
            args.push("--features".to_string());
            args.push("nesting=1".to_string());
        }
        args
    }
}

/// A storage backend as reported by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageInfo {
    pub name: String,
    pub kind: String,
}

/// Operations consumed from the virtualization host (allows mocking in tests)
///
/// Every operation may fail. `exec` only fails when the command could not be
/// run at all; a non-zero exit inside the container is reported through
/// [`ExecOutput::exit_code`].
#[async_trait]
pub trait HostApi: Send + Sync {
    /// Next free container id
    async fn next_id(&self) -> Result<SandboxId>;

    async fn list_storage(&self) -> Result<Vec<StorageInfo>>;

    async fn list_bridges(&self) -> Result<Vec<String>>;

    /// Create the container; returns the id it was created under
    async fn allocate(&self, spec: &AllocationSpec) -> Result<SandboxId>;

    /// Grow the root disk to `size_gb`
    async fn resize(&self, id: SandboxId, size_gb: u32) -> Result<()>;

    async fn start(&self, id: SandboxId) -> Result<()>;

    async fn reboot(&self, id: SandboxId) -> Result<()>;

    async fn stop(&self, id: SandboxId) -> Result<()>;

    /// Remove the container and its volumes
    async fn destroy(&self, id: SandboxId) -> Result<()>;

    async fn exec(&self, id: SandboxId, request: &ExecRequest) -> Result<ExecOutput>;

    /// Like `exec`, but a non-zero exit becomes [`LxrError::Exec`]
    async fn exec_checked(&self, id: SandboxId, request: &ExecRequest) -> Result<ExecOutput> {
        self.exec(id, request).await?.check(request)
    }
}

/// Proxmox VE host driven through `pct`, `pvesh` and `pvesm`
///
/// Host tools are resolved through `PATH`.
#[derive(Debug, Clone, Default)]
pub struct PctHost;

impl PctHost {
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<ExecOutput> {
        debug!("Executing {} {:?}", program, args);

        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| LxrError::Host(format!("Failed to execute {}: {}", program, e)))?;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Run a host tool and fail on non-zero exit
    async fn run_checked(&self, program: &str, args: &[String]) -> Result<String> {
        let output = self.run(program, args).await?;
        if !output.success() {
            let action = args.first().map(String::as_str).unwrap_or("");
            return Err(LxrError::Host(format!(
                "{} {} exited with {}: {}",
                program,
                action,
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(output.stdout)
    }

    async fn pct(&self, args: Vec<String>) -> Result<String> {
        self.run_checked("pct", &args).await
    }
}

#[async_trait]
impl HostApi for PctHost {
    #[instrument(skip(self))]
    async fn next_id(&self) -> Result<SandboxId> {
        let stdout = self
            .run_checked("pvesh", &["get".to_string(), "/cluster/nextid".to_string()])
            .await?;
        parse_next_id(&stdout)
    }

    #[instrument(skip(self))]
    async fn list_storage(&self) -> Result<Vec<StorageInfo>> {
        let stdout = self.run_checked("pvesm", &["status".to_string()]).await?;
        Ok(parse_storage_status(&stdout))
    }

    #[instrument(skip(self))]
    async fn list_bridges(&self) -> Result<Vec<String>> {
        let args: Vec<String> = ["-o", "link", "show", "type", "bridge"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let stdout = self.run_checked("ip", &args).await?;
        Ok(parse_bridges(&stdout))
    }

    #[instrument(skip(self, spec), fields(id = %spec.id))]
    async fn allocate(&self, spec: &AllocationSpec) -> Result<SandboxId> {
        self.pct(spec.create_args()).await?;
        Ok(spec.id)
    }

    #[instrument(skip(self), fields(id = %id))]
    async fn resize(&self, id: SandboxId, size_gb: u32) -> Result<()> {
        self.pct(vec![
            "resize".to_string(),
            id.to_string(),
            "rootfs".to_string(),
            format!("{}G", size_gb),
        ])
        .await
        .map(|_| ())
    }

    #[instrument(skip(self), fields(id = %id))]
    async fn start(&self, id: SandboxId) -> Result<()> {
        self.pct(vec!["start".to_string(), id.to_string()]).await.map(|_| ())
    }

    #[instrument(skip(self), fields(id = %id))]
    async fn reboot(&self, id: SandboxId) -> Result<()> {
        self.pct(vec!["reboot".to_string(), id.to_string()]).await.map(|_| ())
    }

    #[instrument(skip(self), fields(id = %id))]
    async fn stop(&self, id: SandboxId) -> Result<()> {
        self.pct(vec!["stop".to_string(), id.to_string()]).await.map(|_| ())
    }

    #[instrument(skip(self), fields(id = %id))]
    async fn destroy(&self, id: SandboxId) -> Result<()> {
        self.pct(vec![
            "destroy".to_string(),
            id.to_string(),
            "--purge".to_string(),
        ])
        .await
        .map(|_| ())
    }

    #[instrument(skip(self, request), fields(id = %id))]
    async fn exec(&self, id: SandboxId, request: &ExecRequest) -> Result<ExecOutput> {
        debug!("pct exec {}: {}", id, request.describe());
        let mut args = vec!["exec".to_string(), id.to_string(), "--".to_string()];
        args.extend(request.to_argv());
        self.run("pct", &args).await
    }
}

/// Parse `pvesh get /cluster/nextid` output (a bare or quoted number)
pub fn parse_next_id(stdout: &str) -> Result<SandboxId> {
    stdout
        .trim()
        .trim_matches('"')
        .parse::<SandboxId>()
        .map_err(|e| {
            LxrError::Host(format!("Unexpected next id output '{}': {}", stdout.trim(), e))
        })
}

/// Parse the table printed by `pvesm status`
pub fn parse_storage_status(stdout: &str) -> Vec<StorageInfo> {
    stdout
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("Name"))
        .skip(1)
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let name = cols.next()?;
            let kind = cols.next()?;
            Some(StorageInfo {
                name: name.to_string(),
                kind: kind.to_string(),
            })
        })
        .collect()
}

/// Parse `ip -o link show type bridge` output into bridge names
pub fn parse_bridges(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| {
            let name = line.split(':').nth(1)?.trim();
            let name = name.split('@').next().unwrap_or(name);
            if name.is_empty() {
                None
            } else {
                Some(name.to_string())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn spec(assignment: NetworkAssignment) -> AllocationSpec {
        AllocationSpec {
            id: SandboxId(123),
            hostname: "lxr-runner-ab12cd34".to_string(),
            storage: "local-lvm".to_string(),
            shape: SandboxShape::default(),
            network: NetworkConfig {
                bridge: "vmbr0".to_string(),
                dns_server: IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
                assignment,
            },
        }
    }

    #[test]
    fn test_net0_dhcp() {
        assert_eq!(spec(NetworkAssignment::Dhcp).net0(), "name=eth0,bridge=vmbr0,ip=dhcp");
    }

    #[test]
    fn test_net0_static() {
        let s = spec(NetworkAssignment::Static {
            address: "10.0.0.5/24".to_string(),
            gateway: Ipv4Addr::new(10, 0, 0, 1),
        });
        assert_eq!(s.net0(), "name=eth0,bridge=vmbr0,ip=10.0.0.5/24,gw=10.0.0.1");
    }

    #[test]
    fn test_create_args() {
        let args = spec(NetworkAssignment::Dhcp).create_args();
        assert_eq!(args[0], "create");
        assert_eq!(args[1], "123");
        let joined = args.join(" ");
        assert!(joined.contains("--rootfs local-lvm:4"));
        assert!(joined.contains("--nameserver 1.1.1.1"));
        assert!(joined.contains("--features nesting=1"));
        assert!(joined.contains("--hostname lxr-runner-ab12cd34"));
    }

    #[test]
    fn test_parse_next_id() {
        assert_eq!(parse_next_id("105\n").unwrap(), SandboxId(105));
        assert_eq!(parse_next_id("\"106\"").unwrap(), SandboxId(106));
        assert!(parse_next_id("garbage").is_err());
    }

    #[test]
    fn test_parse_storage_status() {
        let out = "\
Name             Type     Status           Total            Used       Available        %
local             dir     active        98497780        11442752        82005480   11.62%
local-lvm     lvmthin     active       832888832       118587047       714301784   14.24%
";
        let storage = parse_storage_status(out);
        assert_eq!(storage.len(), 2);
        assert_eq!(storage[1].name, "local-lvm");
        assert_eq!(storage[1].kind, "lvmthin");
    }

    #[test]
    fn test_parse_bridges() {
        let out = "\
4: vmbr0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc noqueue state UP mode DEFAULT
7: vmbr1.20@vmbr1: <BROADCAST,MULTICAST> mtu 1500 qdisc noop state DOWN mode DEFAULT
";
        assert_eq!(parse_bridges(out), vec!["vmbr0", "vmbr1.20"]);
    }
}
