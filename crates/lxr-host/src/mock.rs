//! In-memory host for testing

use async_trait::async_trait;
use lxr_core::{LxrError, Result, SandboxId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::command::{AllocationSpec, HostApi, StorageInfo};
use crate::exec::{ExecOutput, ExecRequest};

/// Host operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostOp {
    NextId,
    ListStorage,
    ListBridges,
    Allocate,
    Resize,
    Start,
    Reboot,
    Stop,
    Destroy,
}

/// A recorded call against the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    NextId,
    ListStorage,
    ListBridges,
    Allocate(SandboxId),
    Resize(SandboxId, u32),
    Start(SandboxId),
    Reboot(SandboxId),
    Stop(SandboxId),
    Destroy(SandboxId),
    /// Container id and the full in-container command line
    Exec(SandboxId, String),
}

struct MockState {
    next_id: u32,
    calls: Vec<HostCall>,
    failures: HashSet<HostOp>,
    scripts: HashMap<String, VecDeque<ExecOutput>>,
    defaults: HashMap<String, ExecOutput>,
    storage: Vec<StorageInfo>,
    bridges: Vec<String>,
}

/// Scriptable host with a call log
///
/// Clones share state, so a test can hand one clone to the code under test
/// and inspect the calls through another. Exec responses are keyed by the
/// full in-container command line ([`ExecRequest::to_argv`] joined by
/// spaces): scripted outputs are consumed first, then the per-command
/// default, then a successful empty output.
#[derive(Clone)]
pub struct MockHost {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHost {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                next_id: 100,
                calls: Vec::new(),
                failures: HashSet::new(),
                scripts: HashMap::new(),
                defaults: HashMap::new(),
                storage: vec![
                    StorageInfo {
                        name: "local".to_string(),
                        kind: "dir".to_string(),
                    },
                    StorageInfo {
                        name: "local-lvm".to_string(),
                        kind: "lvmthin".to_string(),
                    },
                ],
                bridges: vec!["vmbr0".to_string()],
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the call log from others
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every call of `op` fail
    pub fn fail_on(self, op: HostOp) -> Self {
        self.lock().failures.insert(op);
        self
    }

    /// Queue outputs returned, in order, for `command`
    pub fn with_exec_script(self, command: &str, outputs: Vec<ExecOutput>) -> Self {
        self.lock()
            .scripts
            .entry(command.to_string())
            .or_default()
            .extend(outputs);
        self
    }

    /// Output for `command` once its script is exhausted
    pub fn with_exec_default(self, command: &str, output: ExecOutput) -> Self {
        self.lock().defaults.insert(command.to_string(), output);
        self
    }

    pub fn with_bridges(self, bridges: Vec<String>) -> Self {
        self.lock().bridges = bridges;
        self
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.lock().calls.clone()
    }

    /// Ids passed to `destroy`
    pub fn destroyed(&self) -> Vec<SandboxId> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                HostCall::Destroy(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    /// Ids passed to `allocate`
    pub fn allocated(&self) -> Vec<SandboxId> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                HostCall::Allocate(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    /// How often `command` was executed
    pub fn exec_count(&self, command: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, HostCall::Exec(_, line) if line == command))
            .count()
    }

    fn record(&self, call: HostCall, op: HostOp) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(call);
        if state.failures.contains(&op) {
            return Err(LxrError::Host(format!("mock failure for {:?}", op)));
        }
        Ok(())
    }
}

#[async_trait]
impl HostApi for MockHost {
    async fn next_id(&self) -> Result<SandboxId> {
        self.record(HostCall::NextId, HostOp::NextId)?;
        let mut state = self.lock();
        let id = SandboxId(state.next_id);
        state.next_id += 1;
        Ok(id)
    }

    async fn list_storage(&self) -> Result<Vec<StorageInfo>> {
        self.record(HostCall::ListStorage, HostOp::ListStorage)?;
        Ok(self.lock().storage.clone())
    }

    async fn list_bridges(&self) -> Result<Vec<String>> {
        self.record(HostCall::ListBridges, HostOp::ListBridges)?;
        Ok(self.lock().bridges.clone())
    }

    async fn allocate(&self, spec: &AllocationSpec) -> Result<SandboxId> {
        self.record(HostCall::Allocate(spec.id), HostOp::Allocate)?;
        Ok(spec.id)
    }

    async fn resize(&self, id: SandboxId, size_gb: u32) -> Result<()> {
        self.record(HostCall::Resize(id, size_gb), HostOp::Resize)
    }

    async fn start(&self, id: SandboxId) -> Result<()> {
        self.record(HostCall::Start(id), HostOp::Start)
    }

    async fn reboot(&self, id: SandboxId) -> Result<()> {
        self.record(HostCall::Reboot(id), HostOp::Reboot)
    }

    async fn stop(&self, id: SandboxId) -> Result<()> {
        self.record(HostCall::Stop(id), HostOp::Stop)
    }

    async fn destroy(&self, id: SandboxId) -> Result<()> {
        self.record(HostCall::Destroy(id), HostOp::Destroy)
    }

    async fn exec(&self, id: SandboxId, request: &ExecRequest) -> Result<ExecOutput> {
        let key = request.to_argv().join(" ");
        let mut state = self.lock();
        state.calls.push(HostCall::Exec(id, key.clone()));
        if let Some(output) = state.scripts.get_mut(&key).and_then(VecDeque::pop_front) {
            return Ok(output);
        }
        Ok(state
            .defaults
            .get(&key)
            .cloned()
            .unwrap_or_else(|| ExecOutput::ok("")))
    }
}
