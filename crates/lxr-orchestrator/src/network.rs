//! Network readiness check run inside the sandbox

use lxr_core::config::ProbeConfig;
use lxr_core::{Readiness, SandboxId};
use lxr_host::{ExecRequest, HostApi};
use tracing::debug;

/// Checks outbound reachability and name resolution from inside a sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkProbe {
    reachability_host: String,
    resolution_host: String,
}

/// Result of one probe evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkStatus {
    pub reachable: bool,
    pub resolvable: bool,
}

impl NetworkProbe {
    pub fn new(reachability_host: impl Into<String>, resolution_host: impl Into<String>) -> Self {
        Self {
            reachability_host: reachability_host.into(),
            resolution_host: resolution_host.into(),
        }
    }

    /// Ping a well-known address, no DNS involved
    pub fn reachability_request(&self) -> ExecRequest {
        ping(&self.reachability_host)
    }

    /// Ping a well-known name, which needs working DNS
    pub fn resolution_request(&self) -> ExecRequest {
        ping(&self.resolution_host)
    }

    /// Run both checks once
    ///
    /// Both are always evaluated so the pending status tells the two failure
    /// modes apart. A host error counts as a failed check.
    pub async fn check<H: HostApi + ?Sized>(&self, host: &H, id: SandboxId) -> NetworkStatus {
        let reachable = succeeds(host, id, &self.reachability_request()).await;
        let resolvable = succeeds(host, id, &self.resolution_request()).await;
        NetworkStatus {
            reachable,
            resolvable,
        }
    }

    /// One probe evaluation for the readiness prober
    pub async fn poll<H: HostApi + ?Sized>(&self, host: &H, id: SandboxId) -> Readiness {
        self.check(host, id).await.readiness(self)
    }
}

impl From<&ProbeConfig> for NetworkProbe {
    fn from(config: &ProbeConfig) -> Self {
        Self::new(&config.reachability_host, &config.resolution_host)
    }
}

impl NetworkStatus {
    pub fn readiness(&self, probe: &NetworkProbe) -> Readiness {
        match (self.reachable, self.resolvable) {
            (true, true) => Readiness::Ready,
            (true, false) => Readiness::Pending(format!(
                "{} reachable but cannot resolve {}",
                probe.reachability_host, probe.resolution_host
            )),
            (false, true) => Readiness::Pending(format!(
                "{} resolves but {} is unreachable",
                probe.resolution_host, probe.reachability_host
            )),
            (false, false) => Readiness::Pending(format!(
                "no route to {} and cannot resolve {}",
                probe.reachability_host, probe.resolution_host
            )),
        }
    }
}

fn ping(target: &str) -> ExecRequest {
    ExecRequest::new(["ping", "-c", "1", "-W", "2", target])
}

async fn succeeds<H: HostApi + ?Sized>(host: &H, id: SandboxId, request: &ExecRequest) -> bool {
    match host.exec(id, request).await {
        Ok(output) => output.success(),
        Err(e) => {
            debug!("`{}` could not run in sandbox {}: {}", request.describe(), id, e);
            false
        }
    }
}
