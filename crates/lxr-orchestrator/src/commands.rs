//! Commands run inside the sandbox during provisioning
//!
//! Each method builds one [`ExecRequest`]; nothing here touches the host.

use lxr_core::config::RunnerConfig;
use lxr_host::ExecRequest;

const RUNNER_ARCHIVE: &str = "actions-runner.tar.gz";

/// Builds the in-sandbox commands for package installation and agent setup
#[derive(Debug, Clone)]
pub struct CommandPlan {
    runner: RunnerConfig,
}

impl CommandPlan {
    pub fn new(runner: RunnerConfig) -> Self {
        Self { runner }
    }

    fn home(&self) -> String {
        format!("/home/{}", self.runner.user)
    }

    fn apt(args: &[&str]) -> ExecRequest {
        ExecRequest::new(std::iter::once("apt-get").chain(args.iter().copied()))
            .env("DEBIAN_FRONTEND", "noninteractive")
    }

    pub fn package_index_update(&self) -> ExecRequest {
        Self::apt(&["update", "-q"])
    }

    pub fn package_install(&self, packages: &[String]) -> ExecRequest {
        let mut args = vec!["install", "-y", "-q", "--no-install-recommends"];
        args.extend(packages.iter().map(String::as_str));
        Self::apt(&args)
    }

    /// Unprivileged account the agent runs as
    pub fn create_runner_user(&self) -> ExecRequest {
        ExecRequest::new([
            "useradd",
            "--create-home",
            "--shell",
            "/bin/bash",
            self.runner.user.as_str(),
        ])
    }

    /// Container workloads need the docker group
    pub fn ensure_docker_group(&self) -> ExecRequest {
        ExecRequest::new(["groupadd", "--force", "docker"])
    }

    pub fn add_runner_to_docker_group(&self) -> ExecRequest {
        ExecRequest::new(["usermod", "--append", "--groups", "docker", self.runner.user.as_str()])
    }

    pub fn create_install_dir(&self) -> ExecRequest {
        ExecRequest::new([
            "install",
            "-d",
            "-o",
            self.runner.user.as_str(),
            "-g",
            self.runner.user.as_str(),
            self.runner.install_dir.as_str(),
        ])
    }

    pub fn download_agent(&self) -> ExecRequest {
        let url = self.runner.download_url();
        ExecRequest::new(["curl", "-fsSL", "--retry", "3", "-o", RUNNER_ARCHIVE, url.as_str()])
            .as_user(&self.runner.user)
            .in_dir(&self.runner.install_dir)
    }

    pub fn extract_agent(&self) -> ExecRequest {
        ExecRequest::new(["tar", "-xzf", RUNNER_ARCHIVE])
            .as_user(&self.runner.user)
            .in_dir(&self.runner.install_dir)
    }

    pub fn remove_agent_archive(&self) -> ExecRequest {
        ExecRequest::new(["rm", "-f", RUNNER_ARCHIVE]).in_dir(&self.runner.install_dir)
    }

    /// Libraries the agent itself needs, via its bundled script
    pub fn install_agent_dependencies(&self) -> ExecRequest {
        ExecRequest::new(["./bin/installdependencies.sh"])
            .in_dir(&self.runner.install_dir)
            .env("DEBIAN_FRONTEND", "noninteractive")
    }

    /// Register the agent; `token` is masked in logs and errors
    pub fn configure_agent(
        &self,
        url: &str,
        token: &str,
        name: &str,
        labels: &[String],
    ) -> ExecRequest {
        let mut argv = vec![
            "./config.sh".to_string(),
            "--unattended".to_string(),
            "--url".to_string(),
            url.to_string(),
            "--token".to_string(),
            token.to_string(),
            "--name".to_string(),
            name.to_string(),
            "--replace".to_string(),
        ];
        if !labels.is_empty() {
            argv.push("--labels".to_string());
            argv.push(labels.join(","));
        }
        ExecRequest::new(argv)
            .as_user(&self.runner.user)
            .in_dir(&self.runner.install_dir)
            .env("HOME", self.home())
            .mask(token)
    }

    pub fn install_service(&self) -> ExecRequest {
        ExecRequest::new(["./svc.sh", "install", self.runner.user.as_str()])
            .in_dir(&self.runner.install_dir)
    }

    pub fn start_service(&self) -> ExecRequest {
        ExecRequest::new(["./svc.sh", "start"]).in_dir(&self.runner.install_dir)
    }

    pub fn service_status(&self) -> ExecRequest {
        ExecRequest::new(["./svc.sh", "status"]).in_dir(&self.runner.install_dir)
    }

    pub fn list_addresses(&self) -> ExecRequest {
        ExecRequest::new(["hostname", "-I"])
    }
}

/// Whether `svc.sh status` output shows a running service
pub fn service_running(stdout: &str) -> bool {
    stdout.contains("active (running)")
}
