#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tailcontrol::*;

/// Ordered record of shell commands and process-table kills.
pub type Journal = Arc<Mutex<Vec<String>>>;

/// Executor answering by command prefix.
#[derive(Default)]
pub struct FakeShell {
    replies: Mutex<Vec<(String, String)>>,
    delays: Mutex<Vec<(String, Duration)>>,
    log: Mutex<Vec<String>>,
    journal: Journal,
}

impl FakeShell {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn journaled(journal: Journal) -> Arc<Self> {
        Arc::new(FakeShell {
            journal,
            ..Self::default()
        })
    }

    /// Commands starting with `prefix` take `delay` to answer.
    pub fn delay(&self, prefix: &str, delay: Duration) {
        self.delays.lock().unwrap().push((prefix.to_string(), delay));
    }

    pub fn reply(&self, prefix: &str, output: &str) {
        let mut replies = self.replies.lock().unwrap();
        replies.retain(|(p, _)| p != prefix);
        replies.push((prefix.to_string(), output.to_string()));
    }

    pub fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.commands().iter().filter(|c| c.starts_with(prefix)).count()
    }
}

#[async_trait]
impl CommandExecutor for FakeShell {
    async fn run(&self, command: &str) -> ExecOutput {
        self.log.lock().unwrap().push(command.to_string());
        self.journal.lock().unwrap().push(command.to_string());
        let delay = self
            .delays
            .lock()
            .unwrap()
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, delay)| *delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let stdout = self
            .replies
            .lock()
            .unwrap()
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default();
        ExecOutput {
            stdout,
            stderr: String::new(),
            code: Some(0),
        }
    }
}

/// In-memory process table. Resolving a child makes it alive.
#[derive(Default)]
pub struct FakeProcs {
    alive: Mutex<BTreeSet<ProcessId>>,
    children: Mutex<HashMap<ProcessId, ProcessId>>,
    instances: Mutex<usize>,
    terminated: Mutex<Vec<ProcessId>>,
    kill_all_calls: Mutex<usize>,
    kill_all_error: Mutex<Option<String>>,
    count_delay: Mutex<Option<Duration>>,
    journal: Journal,
}

impl FakeProcs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn journaled(journal: Journal) -> Arc<Self> {
        Arc::new(FakeProcs {
            journal,
            ..Self::default()
        })
    }

    pub fn slow_count(&self, delay: Duration) {
        *self.count_delay.lock().unwrap() = Some(delay);
    }

    pub fn spawn(&self, pid: ProcessId) {
        self.alive.lock().unwrap().insert(pid);
    }

    pub fn child(&self, wrapper: ProcessId, pid: ProcessId) {
        self.children.lock().unwrap().insert(wrapper, pid);
    }

    pub fn set_instances(&self, count: usize) {
        *self.instances.lock().unwrap() = count;
    }

    pub fn fail_kill_all(&self, error: &str) {
        *self.kill_all_error.lock().unwrap() = Some(error.to_string());
    }

    pub fn is_running(&self, pid: ProcessId) -> bool {
        self.alive.lock().unwrap().contains(&pid)
    }

    pub fn terminated(&self) -> Vec<ProcessId> {
        self.terminated.lock().unwrap().clone()
    }

    pub fn kill_all_calls(&self) -> usize {
        *self.kill_all_calls.lock().unwrap()
    }
}

#[async_trait]
impl ProcessTable for FakeProcs {
    async fn is_alive(&self, pid: ProcessId) -> bool {
        self.is_running(pid)
    }

    async fn terminate(&self, pid: ProcessId) -> Result<()> {
        self.alive.lock().unwrap().remove(&pid);
        self.terminated.lock().unwrap().push(pid);
        Ok(())
    }

    async fn count_instances(&self, _name: &str) -> usize {
        let delay = *self.count_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        *self.instances.lock().unwrap()
    }

    async fn kill_all(&self, _name: &str) -> Result<()> {
        *self.kill_all_calls.lock().unwrap() += 1;
        self.journal.lock().unwrap().push("kill_all".to_string());
        if let Some(error) = self.kill_all_error.lock().unwrap().clone() {
            return Err(TailcontrolError::Process(error));
        }
        *self.instances.lock().unwrap() = 0;
        self.alive.lock().unwrap().clear();
        Ok(())
    }

    async fn resolve_child(&self, parent: ProcessId, _name: &str) -> Option<ProcessId> {
        let pid = self.children.lock().unwrap().get(&parent).copied()?;
        self.spawn(pid);
        Some(pid)
    }
}

pub const RUNNING: &str = r#"{"BackendState":"Running","Peer":{}}"#;
pub const STOPPED: &str = r#"{"BackendState":"Stopped"}"#;

pub struct Rig {
    pub journal: Journal,
    pub shell: Arc<FakeShell>,
    pub procs: Arc<FakeProcs>,
    pub state: DropState,
    pub supervisor: DropSupervisor,
}

pub fn rig() -> Rig {
    rig_with_store(Arc::new(MemoryStore::new()))
}

pub fn rig_with_store(store: Arc<dyn StateStore>) -> Rig {
    let journal = Journal::default();
    let shell = FakeShell::journaled(journal.clone());
    let procs = FakeProcs::journaled(journal.clone());
    let state = DropState::new(store);
    let supervisor = DropSupervisor::new(
        shell.clone(),
        procs.clone(),
        state.clone(),
        Diagnostics::new(),
        SupervisorConfig::default(),
    );
    Rig {
        journal,
        shell,
        procs,
        state,
        supervisor,
    }
}
