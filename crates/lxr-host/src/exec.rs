//! Structured in-sandbox command execution
//!
//! Commands run inside the container are described as an argv plus the user,
//! working directory and environment to run them with. Nothing is passed
//! through a shell, so arguments never need quoting.

use lxr_core::{LxrError, Result};
use std::collections::BTreeMap;

/// A command to run inside a sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub argv: Vec<String>,
    /// Run as this user instead of root
    pub user: Option<String>,
    pub workdir: Option<String>,
    pub env: BTreeMap<String, String>,
    masked: Vec<String>,
}

impl ExecRequest {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            user: None,
            workdir: None,
            env: BTreeMap::new(),
            masked: Vec::new(),
        }
    }

    pub fn as_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn in_dir(mut self, dir: impl Into<String>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Hide `secret` wherever it appears in [`ExecRequest::describe`]
    pub fn mask(mut self, secret: impl Into<String>) -> Self {
        self.masked.push(secret.into());
        self
    }

    /// The full argv executed inside the container
    ///
    /// User switching goes through `runuser`, directory and environment
    /// through `env`, so the effective command is
    /// `runuser -u USER -- env --chdir=DIR K=V ... ARGV`.
    pub fn to_argv(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.argv.len() + 6);
        if let Some(user) = &self.user {
            out.extend(["runuser".to_string(), "-u".to_string(), user.clone(), "--".to_string()]);
        }
        if self.workdir.is_some() || !self.env.is_empty() {
            out.push("env".to_string());
            if let Some(dir) = &self.workdir {
                out.push(format!("--chdir={}", dir));
            }
            for (key, value) in &self.env {
                out.push(format!("{}={}", key, value));
            }
        }
        out.extend(self.argv.iter().cloned());
        out
    }

    /// Human-readable command line with masked values replaced
    pub fn describe(&self) -> String {
        let mut line = self.to_argv().join(" ");
        for secret in self.masked.iter().filter(|s| !s.is_empty()) {
            line = line.replace(secret.as_str(), "***");
        }
        line
    }
}

/// Result of an in-sandbox command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into [`LxrError::Exec`]
    pub fn check(self, request: &ExecRequest) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(LxrError::Exec {
                command: request.describe(),
                exit_code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}
