//! lxr CLI - ephemeral CI runner provisioning
//!
//! Usage:
//!   lxr provision --owner <owner> --repo <repo>   Provision a repository runner
//!   lxr provision --scope org --owner <org>       Provision an organization runner
//!   lxr destroy <id>                              Stop and destroy a sandbox
//!   lxr config init                               Write the default config file
//!   lxr config show                               Print the effective config

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use lxr_core::config::DEFAULT_CONFIG_PATH;
use lxr_core::{
    generate_runner_name, Credential, LxrConfig, NetworkMode, RequestDraft, SandboxId, Scope,
};
use lxr_host::PctHost;
use lxr_orchestrator::{teardown, CleanupOutcome, ProvisionReport, Provisioner};
use lxr_registration::RegistrationClient;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "lxr")]
#[command(author, version, about = "Provision ephemeral CI runners in LXC sandboxes")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a sandbox and register it as a CI runner
    Provision(ProvisionArgs),

    /// Stop and destroy a sandbox
    Destroy {
        /// Sandbox id
        id: SandboxId,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write the default configuration
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration
    Show,
}

#[derive(clap::Args)]
struct ProvisionArgs {
    /// Registration scope
    #[arg(long, value_enum, default_value = "repo")]
    scope: CliScope,

    /// Repository owner or organization
    #[arg(long)]
    owner: String,

    /// Repository name (repository scope only)
    #[arg(long)]
    repo: Option<String>,

    /// API credential used to request the registration token
    #[arg(long, env = "LXR_GITHUB_TOKEN", hide_env_values = true)]
    token: String,

    /// Storage backend (defaults to config)
    #[arg(long)]
    storage: Option<String>,

    /// Network bridge (defaults to config)
    #[arg(long)]
    bridge: Option<String>,

    /// DNS server (defaults to config)
    #[arg(long)]
    dns: Option<String>,

    /// Address assignment
    #[arg(long, value_enum, default_value = "dhcp")]
    network: CliNetwork,

    /// Static address in CIDR notation
    #[arg(long, value_name = "CIDR")]
    ip: Option<String>,

    /// Static gateway
    #[arg(long)]
    gateway: Option<String>,

    /// Sandbox id (defaults to the next free id)
    #[arg(long)]
    id: Option<SandboxId>,

    /// Runner name, also the sandbox hostname
    #[arg(long)]
    name: Option<String>,

    /// Runner labels (defaults to config)
    #[arg(long, value_delimiter = ',')]
    labels: Vec<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliScope {
    Repo,
    Org,
}

impl From<CliScope> for Scope {
    fn from(s: CliScope) -> Self {
        match s {
            CliScope::Repo => Scope::Repository,
            CliScope::Org => Scope::Organization,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliNetwork {
    Dhcp,
    Static,
}

impl From<CliNetwork> for NetworkMode {
    fn from(n: CliNetwork) -> Self {
        match n {
            CliNetwork::Dhcp => NetworkMode::Dhcp,
            CliNetwork::Static => NetworkMode::Static,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Provision(args) => cmd_provision(&cli.config, args).await,
        Commands::Destroy { id } => cmd_destroy(id).await,
        Commands::Config { action } => cmd_config(&cli.config, action),
    }
}

async fn cmd_provision(config_path: &Path, args: ProvisionArgs) -> Result<()> {
    let config = LxrConfig::load_or_default(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let draft = build_draft(&config, args);
    let request = draft.validate().context("Invalid provisioning request")?;

    let client = RegistrationClient::new(&config.runner.api_url, config.runner.request_timeout())?;
    let provisioner = Provisioner::new(PctHost::new(), client, config);

    info!(
        "Provisioning runner {} for {} {}",
        request.runner_name(),
        request.scope(),
        request.target().owner()
    );
    let report = provisioner.provision(&request, interrupt()).await?;
    print_report(&report);
    Ok(())
}

/// Merge flags over config defaults
fn build_draft(config: &LxrConfig, args: ProvisionArgs) -> RequestDraft {
    let labels = if args.labels.is_empty() {
        config.runner.labels.clone()
    } else {
        args.labels
    };
    RequestDraft {
        scope: args.scope.into(),
        owner: args.owner,
        repository: args.repo,
        credential: Credential::new(args.token),
        storage: args.storage.unwrap_or_else(|| config.sandbox.storage.clone()),
        bridge: args.bridge.unwrap_or_else(|| config.sandbox.bridge.clone()),
        dns_server: args.dns.unwrap_or_else(|| config.sandbox.dns_server.clone()),
        network_mode: args.network.into(),
        static_address: args.ip,
        gateway: args.gateway,
        sandbox_id: args.id,
        runner_name: args
            .name
            .unwrap_or_else(|| generate_runner_name(&config.runner.name_prefix)),
        labels,
        shape: config.sandbox.shape(),
    }
}

/// Resolves on Ctrl-C, SIGTERM or SIGHUP
///
/// A signal whose handler cannot be installed is logged and ignored.
async fn interrupt() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::SignalKind;

        tokio::select! {
            _ = ctrl_c() => {}
            _ = unix_signal(SignalKind::terminate(), "SIGTERM") => {}
            _ = unix_signal(SignalKind::hangup(), "SIGHUP") => {}
        }
    }
    #[cfg(not(unix))]
    ctrl_c().await;
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => warn!("Received Ctrl-C"),
        Err(e) => {
            warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(unix)]
async fn unix_signal(kind: tokio::signal::unix::SignalKind, name: &str) {
    match tokio::signal::unix::signal(kind) {
        Ok(mut stream) => {
            stream.recv().await;
            warn!("Received {}", name);
        }
        Err(e) => {
            warn!("Cannot listen for {}: {}", name, e);
            std::future::pending::<()>().await;
        }
    }
}

fn print_report(report: &ProvisionReport) {
    println!("Runner ready");
    println!("  sandbox:  {}", report.sandbox_id);
    println!("  address:  {}", report.address);
    println!("  runner:   {}", report.runner_name);
    println!("  url:      {}", report.runner_url);
    println!("  elapsed:  {:.1}s", report.elapsed.as_secs_f64());
    for timing in &report.stages {
        println!("    {:<24} {:>7.1}s", timing.stage.to_string(), timing.duration.as_secs_f64());
    }
}

async fn cmd_destroy(id: SandboxId) -> Result<()> {
    match teardown(&PctHost::new(), id).await {
        CleanupOutcome::Failed(reason) => bail!("Failed to destroy sandbox {}: {}", id, reason),
        _ => {
            println!("Sandbox {} destroyed", id);
            Ok(())
        }
    }
}

fn cmd_config(config_path: &Path, action: ConfigCommands) -> Result<()> {
    match action {
        ConfigCommands::Init { force } => {
            if config_path.exists() && !force {
                bail!(
                    "{} already exists (use --force to overwrite)",
                    config_path.display()
                );
            }
            LxrConfig::write_default(config_path)
                .with_context(|| format!("Failed to write {}", config_path.display()))?;
            println!("Wrote default configuration to {}", config_path.display());
        }
        ConfigCommands::Show => {
            let config = LxrConfig::load_or_default(config_path)?;
            println!("{:#?}", config);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("lxr").chain(args.iter().copied())).unwrap()
    }

    fn provision_args(args: &[&str]) -> ProvisionArgs {
        match parse(args).command {
            Commands::Provision(a) => a,
            _ => panic!("expected provision"),
        }
    }

    #[test]
    fn test_flags_override_config() {
        let args = provision_args(&[
            "provision", "--owner", "acme", "--repo", "widgets", "--token", "tok", "--bridge",
            "vmbr1", "--labels", "gpu,linux", "--id", "120", "--name", "ci-1",
        ]);
        let request = build_draft(&LxrConfig::default(), args).validate().unwrap();
        assert_eq!(request.network().bridge, "vmbr1");
        assert_eq!(request.storage_backend(), "local-lvm");
        assert_eq!(request.labels(), ["gpu".to_string(), "linux".to_string()]);
        assert_eq!(request.sandbox_id(), Some(SandboxId(120)));
        assert_eq!(request.runner_name(), "ci-1");
    }

    #[test]
    fn test_defaults_come_from_config() {
        let args =
            provision_args(&["provision", "--scope", "org", "--owner", "acme", "--token", "t"]);
        let config = LxrConfig::default();
        let request = build_draft(&config, args).validate().unwrap();
        assert_eq!(request.scope(), Scope::Organization);
        assert_eq!(request.labels(), config.runner.labels.as_slice());
        assert!(request.runner_name().starts_with("lxr-runner-"));
        assert_eq!(request.network().mode(), NetworkMode::Dhcp);
    }

    #[test]
    fn test_sandbox_id_below_minimum_is_rejected() {
        let result = Cli::try_parse_from([
            "lxr", "provision", "--owner", "acme", "--repo", "w", "--token", "t", "--id", "42",
        ]);
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hangup_counts_as_interrupt() {
        let mut pending_interrupt = Box::pin(interrupt());
        let early = tokio::time::timeout(Duration::from_millis(50), &mut pending_interrupt).await;
        assert!(early.is_err());

        let status = std::process::Command::new("kill")
            .args(["-HUP", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        let fired = tokio::time::timeout(Duration::from_secs(5), pending_interrupt).await;
        assert!(fired.is_ok());
    }

    #[test]
    fn test_static_requires_address() {
        let args = provision_args(&[
            "provision", "--owner", "acme", "--repo", "w", "--token", "t", "--network", "static",
        ]);
        assert!(build_draft(&LxrConfig::default(), args).validate().is_err());
    }
}
