//! Resource lifecycle controller
//!
//! Drives one sandbox from nothing to a registered, running CI agent. Each
//! stage gates the next; the state machine decides when cleanup is armed and
//! when a failure has to destroy the sandbox, the [`CleanupGuard`] carries it
//! out.

use chrono::Utc;
use lxr_core::{
    run_with_retry, wait_until_ready, LifecycleState, LxrConfig, LxrError, NetworkMode,
    ProvisioningRequest, RequestDraft, Result, SandboxId, SandboxResource,
};
use lxr_host::{AllocationSpec, ExecOutput, ExecRequest, HostApi};
use lxr_registration::{RegistrationClient, RegistrationToken};
use std::future::Future;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::commands::{service_running, CommandPlan};
use crate::error::{CleanupOutcome, ProvisionError};
use crate::guard::CleanupGuard;
use crate::network::NetworkProbe;
use crate::state_machine::{transition, Action, Event, RunState};

/// Time spent reaching one lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTiming {
    pub stage: LifecycleState,
    pub duration: Duration,
}

/// Everything the operator needs about a finished sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionReport {
    pub sandbox_id: SandboxId,
    pub address: Ipv4Addr,
    pub runner_name: String,
    /// URL the agent registered against
    pub runner_url: String,
    pub stages: Vec<StageTiming>,
    pub elapsed: Duration,
}

/// Provisions sandboxes on a host
pub struct Provisioner<H: HostApi> {
    host: H,
    registration: RegistrationClient,
    config: LxrConfig,
    commands: CommandPlan,
    network: NetworkProbe,
}

impl<H: HostApi + Clone + 'static> Provisioner<H> {
    pub fn new(host: H, registration: RegistrationClient, config: LxrConfig) -> Self {
        let commands = CommandPlan::new(config.runner.clone());
        let network = NetworkProbe::from(&config.probe);
        Self {
            host,
            registration,
            config,
            commands,
            network,
        }
    }

    /// Validate `draft`, then [`Provisioner::provision`] it
    pub async fn provision_draft<S>(
        &self,
        draft: RequestDraft,
        shutdown: S,
    ) -> std::result::Result<ProvisionReport, ProvisionError>
    where
        S: Future<Output = ()>,
    {
        let request = draft.validate().map_err(ProvisionError::Validation)?;
        self.provision(&request, shutdown).await
    }

    /// Run every stage for `request`
    ///
    /// If `shutdown` resolves first the run is abandoned and treated like a
    /// failure of the stage in progress. Any failure after allocation
    /// destroys the sandbox before returning. Dropping the returned future
    /// mid-run leaves the teardown to the guard, which spawns it.
    #[instrument(skip_all, fields(runner = %request.runner_name()))]
    pub async fn provision<S>(
        &self,
        request: &ProvisioningRequest,
        shutdown: S,
    ) -> std::result::Result<ProvisionReport, ProvisionError>
    where
        S: Future<Output = ()>,
    {
        let started = Instant::now();
        let mut guard = CleanupGuard::new(self.host.clone());

        let outcome = tokio::select! {
            biased;
            _ = shutdown => None,
            result = self.drive(request, &mut guard) => Some(result),
        };

        let error = match outcome {
            Some(Ok(mut report)) => {
                report.elapsed = started.elapsed();
                info!(
                    "Sandbox {} ready at {} as runner {} ({:?})",
                    report.sandbox_id, report.address, report.runner_name, report.elapsed
                );
                return Ok(report);
            }
            Some(Err(e)) => e,
            None => {
                warn!("Interrupted after reaching {}", guard.state());
                LxrError::Interrupted
            }
        };

        Err(self.abort(&mut guard, error).await)
    }

    async fn abort(&self, guard: &mut CleanupGuard<H>, error: LxrError) -> ProvisionError {
        let reached = guard.state();
        let event = if matches!(error, LxrError::Interrupted) {
            Event::Interrupted
        } else {
            Event::StageFailed {
                error: error.to_string(),
            }
        };

        let (state, actions) = transition(RunState::Active(reached), event);
        let mut cleanup = CleanupOutcome::NotRequired;
        for action in actions {
            match action {
                Action::DestroySandbox => cleanup = guard.release().await,
                Action::LogActivity { message } => error!("{}", message),
                Action::ArmCleanup | Action::DisarmCleanup => {}
            }
        }

        if reached == LifecycleState::Uninitialized {
            return ProvisionError::Allocation(error);
        }
        let stage = match state {
            RunState::Failed { stage, .. } => stage,
            RunState::Active(current) => current,
        };
        ProvisionError::Stage {
            stage,
            source: error,
            cleanup,
        }
    }

    async fn drive(
        &self,
        request: &ProvisioningRequest,
        guard: &mut CleanupGuard<H>,
    ) -> Result<ProvisionReport> {
        let mut run = RunTracker::new(guard, SandboxResource::new(request.network().clone()));

        let id = self.allocate(request).await?;
        run.resource.id = Some(id);
        run.reach(LifecycleState::Allocated)?;

        self.host.resize(id, request.shape().disk_gb).await?;
        run.reach(LifecycleState::Sized)?;

        self.boot(id, request.network().mode()).await?;
        run.reach(LifecycleState::Booted)?;

        let (network, host) = (&self.network, &self.host);
        let probe = wait_until_ready(
            &format!("network of sandbox {}", id),
            &self.config.timing.network_probe,
            move || network.poll(host, id),
        )
        .await?;
        debug!("Network probe took {} poll(s)", probe.polls);
        run.reach(LifecycleState::NetworkReady)?;

        self.install_base_tools(id).await?;
        run.reach(LifecycleState::BaseToolsInstalled)?;

        self.install_dependencies(id).await?;
        run.reach(LifecycleState::DependenciesInstalled)?;

        let token = self
            .registration
            .fetch_registration_token(request.target(), request.credential())
            .await?;
        run.reach(LifecycleState::TokenObtained)?;

        let runner_url = request.target().runner_url(&self.config.runner.web_url);
        self.register_agent(id, request, &runner_url, token).await?;
        run.reach(LifecycleState::AgentRegistered)?;

        let address = self.verify(id).await?;
        run.reach(LifecycleState::Complete)?;

        Ok(ProvisionReport {
            sandbox_id: id,
            address,
            runner_name: request.runner_name().to_string(),
            runner_url,
            stages: run.stages,
            elapsed: Duration::ZERO,
        })
    }

    /// Pre-flight checks, id selection and `pct create`
    async fn allocate(&self, request: &ProvisioningRequest) -> Result<SandboxId> {
        let storage = self.host.list_storage().await?;
        if !storage.iter().any(|s| s.name == request.storage_backend()) {
            return Err(LxrError::Host(format!(
                "storage '{}' not found on host (available: {})",
                request.storage_backend(),
                storage.iter().map(|s| s.name.as_str()).collect::<Vec<_>>().join(", ")
            )));
        }

        let bridge = &request.network().bridge;
        let bridges = self.host.list_bridges().await?;
        if !bridges.iter().any(|b| b == bridge) {
            return Err(LxrError::Host(format!(
                "bridge '{}' not found on host (available: {})",
                bridge,
                bridges.join(", ")
            )));
        }

        let id = match request.sandbox_id() {
            Some(id) => id,
            None => self.host.next_id().await?,
        };

        let spec = AllocationSpec {
            id,
            hostname: request.runner_name().to_string(),
            storage: request.storage_backend().to_string(),
            shape: request.shape().clone(),
            network: request.network().clone(),
        };
        info!("Allocating sandbox {} on {}", id, spec.storage);
        self.host.allocate(&spec).await
    }

    /// Start, and for DHCP reboot once after the lease had time to settle
    async fn boot(&self, id: SandboxId, mode: NetworkMode) -> Result<()> {
        self.host.start(id).await?;
        if mode == NetworkMode::Dhcp {
            let settle = self.config.timing.dhcp_settle_delay();
            debug!("Waiting {:?} for DHCP before reboot", settle);
            tokio::time::sleep(settle).await;
            self.host.reboot(id).await?;
        }
        Ok(())
    }

    async fn install_base_tools(&self, id: SandboxId) -> Result<()> {
        let update = &self.commands.package_index_update();
        let install = &self.commands.package_install(&self.config.packages.base);
        run_with_retry(
            "base package installation",
            &self.config.timing.package_install,
            move || async move {
                self.exec(id, update).await?;
                self.exec(id, install).await
            },
        )
        .await?;
        Ok(())
    }

    async fn install_dependencies(&self, id: SandboxId) -> Result<()> {
        let mut steps = Vec::new();
        if !self.config.packages.dependencies.is_empty() {
            steps.push(self.commands.package_install(&self.config.packages.dependencies));
        }
        steps.extend([
            self.commands.create_runner_user(),
            self.commands.ensure_docker_group(),
            self.commands.add_runner_to_docker_group(),
            self.commands.create_install_dir(),
            self.commands.download_agent(),
            self.commands.extract_agent(),
            self.commands.remove_agent_archive(),
            self.commands.install_agent_dependencies(),
        ]);
        for step in &steps {
            self.exec(id, step).await?;
        }
        Ok(())
    }

    /// Configure the agent with `token` and install it as a service
    ///
    /// Takes the token by value: a failed configuration cannot reuse it.
    async fn register_agent(
        &self,
        id: SandboxId,
        request: &ProvisioningRequest,
        runner_url: &str,
        token: RegistrationToken,
    ) -> Result<()> {
        if token.is_expired_at(Utc::now()) {
            return Err(LxrError::Auth {
                message: format!(
                    "registration token expired at {:?} before use",
                    token.expires_at()
                ),
                body: String::new(),
            });
        }

        let secret = token.into_secret();
        let configure = self.commands.configure_agent(
            runner_url,
            &secret,
            request.runner_name(),
            request.labels(),
        );
        info!("Registering runner {} against {}", request.runner_name(), runner_url);
        self.exec(id, &configure).await?;
        self.exec(id, &self.commands.install_service()).await?;
        self.exec(id, &self.commands.start_service()).await?;
        Ok(())
    }

    /// Check the service runs and resolve the sandbox address
    async fn verify(&self, id: SandboxId) -> Result<Ipv4Addr> {
        let status = self.exec(id, &self.commands.service_status()).await?;
        if !service_running(&status.stdout) {
            return Err(LxrError::Host(format!(
                "runner service in sandbox {} is not running: {}",
                id,
                status.stdout.trim()
            )));
        }

        let addresses = self.exec(id, &self.commands.list_addresses()).await?;
        addresses
            .stdout
            .split_whitespace()
            .find_map(|a| a.parse::<Ipv4Addr>().ok())
            .ok_or_else(|| {
                LxrError::Host(format!(
                    "sandbox {} reported no IPv4 address: '{}'",
                    id,
                    addresses.stdout.trim()
                ))
            })
    }

    async fn exec(&self, id: SandboxId, request: &ExecRequest) -> Result<ExecOutput> {
        debug!("[{}] {}", id, request.describe());
        self.host.exec_checked(id, request).await
    }
}

/// Tracks the single mutable resource of a run and keeps the guard in step
struct RunTracker<'g, H: HostApi + Clone + 'static> {
    guard: &'g mut CleanupGuard<H>,
    resource: SandboxResource,
    stages: Vec<StageTiming>,
    clock: Instant,
}

impl<'g, H: HostApi + Clone + 'static> RunTracker<'g, H> {
    fn new(guard: &'g mut CleanupGuard<H>, resource: SandboxResource) -> Self {
        Self {
            guard,
            resource,
            stages: Vec::new(),
            clock: Instant::now(),
        }
    }

    /// Record that `target` was reached and apply the resulting actions
    fn reach(&mut self, target: LifecycleState) -> Result<()> {
        let (state, actions) = transition(
            RunState::Active(self.resource.state),
            Event::StageSucceeded(target),
        );
        match state {
            RunState::Active(reached) => self.resource.state = reached,
            RunState::Failed { error, .. } => return Err(LxrError::Other(error)),
        }
        self.guard.observe(&self.resource);

        for action in actions {
            match action {
                Action::ArmCleanup => {
                    if !self.guard.arm() {
                        return Err(LxrError::Other(
                            "allocated sandbox has no id to guard".to_string(),
                        ));
                    }
                }
                Action::DisarmCleanup => self.guard.disarm(),
                Action::LogActivity { message } => match self.resource.id {
                    Some(id) => info!("[{}] {}", id, message),
                    None => info!("{}", message),
                },
                Action::DestroySandbox => {}
            }
        }

        let now = Instant::now();
        self.stages.push(StageTiming {
            stage: target,
            duration: now.duration_since(self.clock),
        });
        self.clock = now;
        Ok(())
    }
}
