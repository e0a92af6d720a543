//! Scoped cleanup of partially provisioned sandboxes

use lxr_core::{LifecycleState, SandboxId, SandboxResource};
use lxr_host::HostApi;
use tracing::{error, info, warn};

use crate::error::CleanupOutcome;

/// Owns the right to destroy a sandbox until it is handed over
///
/// Armed once the sandbox exists, disarmed when the run completes. Only the
/// sandbox id and the lifecycle state are read. [`CleanupGuard::release`]
/// tears down in place. Dropping a guard that is still armed (the run future
/// was cancelled, or a panic) spawns the teardown on the current runtime.
pub struct CleanupGuard<H: HostApi + Clone + 'static> {
    host: H,
    id: Option<SandboxId>,
    state: LifecycleState,
    armed: bool,
}

impl<H: HostApi + Clone + 'static> CleanupGuard<H> {
    pub fn new(host: H) -> Self {
        Self {
            host,
            id: None,
            state: LifecycleState::Uninitialized,
            armed: false,
        }
    }

    /// Track the resource's id and state
    pub fn observe(&mut self, resource: &SandboxResource) {
        self.id = resource.id;
        self.state = resource.state;
    }

    /// Arm for the observed sandbox; false if no sandbox exists yet
    pub fn arm(&mut self) -> bool {
        self.armed = self.id.is_some();
        self.armed
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }

    pub fn id(&self) -> Option<SandboxId> {
        self.id
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Tear the sandbox down if armed, exactly once
    pub async fn release(&mut self) -> CleanupOutcome {
        let id = match (self.armed, self.id) {
            (true, Some(id)) => id,
            _ => return CleanupOutcome::NotRequired,
        };
        self.armed = false;
        info!("Cleaning up sandbox {} (reached {})", id, self.state);
        teardown(&self.host, id).await
    }
}

impl<H: HostApi + Clone + 'static> Drop for CleanupGuard<H> {
    fn drop(&mut self) {
        let id = match (self.armed, self.id) {
            (true, Some(id)) => id,
            _ => return,
        };
        self.armed = false;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(
                    "Run abandoned at {}; cleaning up sandbox {} in the background",
                    self.state, id
                );
                let host = self.host.clone();
                runtime.spawn(async move {
                    teardown(&host, id).await;
                });
            }
            Err(_) => error!(
                "Sandbox {} left behind at {}; remove it with `lxr destroy {}`",
                id, self.state, id
            ),
        }
    }
}

/// Stop then destroy `id`
///
/// A failed stop is logged and the destroy still goes ahead; neither error
/// is propagated.
pub async fn teardown<H: HostApi + ?Sized>(host: &H, id: SandboxId) -> CleanupOutcome {
    if let Err(e) = host.stop(id).await {
        warn!("Stopping sandbox {} failed, destroying anyway: {}", id, e);
    }
    match host.destroy(id).await {
        Ok(()) => {
            info!("Sandbox {} destroyed", id);
            CleanupOutcome::Destroyed
        }
        Err(e) => {
            error!("Destroying sandbox {} failed: {}", id, e);
            CleanupOutcome::Failed(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lxr_core::{NetworkAssignment, NetworkConfig};
    use lxr_host::{HostCall, HostOp, MockHost};

    fn resource(id: u32, state: LifecycleState) -> SandboxResource {
        let mut r = SandboxResource::new(NetworkConfig {
            bridge: "vmbr0".to_string(),
            dns_server: "1.1.1.1".parse().unwrap(),
            assignment: NetworkAssignment::Dhcp,
        });
        r.id = Some(SandboxId(id));
        r.state = state;
        r
    }

    #[tokio::test]
    async fn test_unarmed_guard_does_nothing() {
        let host = MockHost::new();
        let mut guard = CleanupGuard::new(host.clone());
        assert!(!guard.arm());
        assert_eq!(guard.release().await, CleanupOutcome::NotRequired);
        assert!(host.calls().is_empty());
    }

    #[tokio::test]
    async fn test_release_stops_then_destroys_once() {
        let host = MockHost::new();
        let mut guard = CleanupGuard::new(host.clone());
        guard.observe(&resource(104, LifecycleState::Booted));
        assert!(guard.arm());

        assert_eq!(guard.release().await, CleanupOutcome::Destroyed);
        assert_eq!(guard.release().await, CleanupOutcome::NotRequired);
        assert_eq!(
            host.calls(),
            vec![HostCall::Stop(SandboxId(104)), HostCall::Destroy(SandboxId(104))]
        );
    }

    #[tokio::test]
    async fn test_stop_failure_still_destroys() {
        let host = MockHost::new().fail_on(HostOp::Stop);
        let mut guard = CleanupGuard::new(host.clone());
        guard.observe(&resource(101, LifecycleState::Sized));
        guard.arm();

        assert_eq!(guard.release().await, CleanupOutcome::Destroyed);
        assert_eq!(host.destroyed(), vec![SandboxId(101)]);
    }

    #[tokio::test]
    async fn test_destroy_failure_is_reported_not_raised() {
        let host = MockHost::new().fail_on(HostOp::Destroy);
        let mut guard = CleanupGuard::new(host.clone());
        guard.observe(&resource(102, LifecycleState::NetworkReady));
        guard.arm();

        assert!(matches!(guard.release().await, CleanupOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_disarmed_guard_leaves_sandbox() {
        let host = MockHost::new();
        let mut guard = CleanupGuard::new(host.clone());
        guard.observe(&resource(103, LifecycleState::Complete));
        guard.arm();
        guard.disarm();

        assert_eq!(guard.release().await, CleanupOutcome::NotRequired);
        assert!(host.destroyed().is_empty());
    }

    #[tokio::test]
    async fn test_dropping_armed_guard_destroys_in_background() {
        let host = MockHost::new();
        let mut guard = CleanupGuard::new(host.clone());
        guard.observe(&resource(105, LifecycleState::NetworkReady));
        guard.arm();
        drop(guard);

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            host.calls(),
            vec![HostCall::Stop(SandboxId(105)), HostCall::Destroy(SandboxId(105))]
        );
    }

    #[tokio::test]
    async fn test_dropping_released_guard_destroys_nothing_more() {
        let host = MockHost::new();
        let mut guard = CleanupGuard::new(host.clone());
        guard.observe(&resource(106, LifecycleState::Booted));
        guard.arm();
        guard.release().await;
        drop(guard);

        tokio::task::yield_now().await;
        assert_eq!(host.destroyed(), vec![SandboxId(106)]);
    }

    #[test]
    fn test_dropping_armed_guard_outside_runtime_only_logs() {
        let host = MockHost::new();
        let mut guard = CleanupGuard::new(host.clone());
        guard.observe(&resource(107, LifecycleState::Sized));
        guard.arm();
        drop(guard);

        assert!(host.calls().is_empty());
    }
}
