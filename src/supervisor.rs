use crate::error::{Result, RotationError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use sysinfo::{Pid, Process, System};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const LEAF_LOOKUP_ATTEMPTS: u32 = 20;
const LEAF_LOOKUP_DELAY: Duration = Duration::from_millis(50);

/// A launched sync session. `pid` is the `sh` wrapper; `leaf_pid` the sync
/// binary itself, resolved once at launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: u32,
    pub leaf_pid: Option<u32>,
}

#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    async fn launch(&self, command: &str) -> Result<ProcessHandle>;
    /// `Some(success)` once the launched process has exited, `None` while it runs.
    async fn exit_status(&self, handle: &ProcessHandle) -> Option<bool>;
    /// Force-kills the session. Safe to call on an already dead session.
    async fn kill(&self, handle: &ProcessHandle);
    /// Force-kills every child of `pid` named like the sync binary, or `pid`
    /// itself when it is one of our exec'd sync processes. No-op if `pid` is gone.
    async fn kill_tree(&self, pid: u32);
}

struct Session {
    child: Child,
    handle: ProcessHandle,
}

/// Runs sync commands through `sh -c` and kills them with SIGKILL.
pub struct ShellSupervisor {
    binary_name: String,
    session_marker: Option<String>,
    sessions: Mutex<HashMap<u32, Session>>,
}

impl ShellSupervisor {
    pub fn new(binary_name: impl Into<String>) -> Self {
        Self {
            binary_name: binary_name.into(),
            session_marker: None,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Text every command line of our sync processes carries, e.g. the
    /// `--rc-addr` flag. Processes without it are never killed by
    /// `kill_tree` once a marker is set.
    pub fn with_session_marker(mut self, marker: impl Into<String>) -> Self {
        self.session_marker = Some(marker.into());
        self
    }

    fn is_sync_binary(&self, process: &Process) -> bool {
        process.name().contains(&self.binary_name)
    }

    fn carries_marker(&self, process: &Process) -> bool {
        match &self.session_marker {
            Some(marker) => process.cmd().join(" ").contains(marker.as_str()),
            None => false,
        }
    }

    /// The leaf is still the binary we launched: same name, and either the
    /// shell itself or a direct child of it.
    fn is_session_leaf(&self, sys: &System, leaf: u32, shell_pid: u32) -> bool {
        sys.process(Pid::from_u32(leaf))
            .map(|p| {
                self.is_sync_binary(p)
                    && (leaf == shell_pid || p.parent() == Some(Pid::from_u32(shell_pid)))
            })
            .unwrap_or(false)
    }

    fn matching_children(&self, sys: &System, parent: u32) -> Vec<Pid> {
        let parent = Pid::from_u32(parent);
        let mut pids: Vec<Pid> = sys
            .processes()
            .iter()
            .filter(|(_, p)| {
                p.parent() == Some(parent)
                    && self.is_sync_binary(p)
                    && (self.session_marker.is_none() || self.carries_marker(p))
            })
            .map(|(pid, _)| *pid)
            .collect();
        pids.sort();
        pids
    }

    async fn resolve_leaf(&self, shell_pid: u32) -> Option<u32> {
        for _ in 0..LEAF_LOOKUP_ATTEMPTS {
            let sys = process_table();
            if let Some(process) = sys.process(Pid::from_u32(shell_pid)) {
                // Shells exec a lone command in place.
                if self.is_sync_binary(process) {
                    return Some(shell_pid);
                }
            } else {
                return None;
            }
            if let Some(child) = self.matching_children(&sys, shell_pid).first() {
                return Some(child.as_u32());
            }
            tokio::time::sleep(LEAF_LOOKUP_DELAY).await;
        }
        None
    }

    /// Handles of every session launched and not yet killed.
    pub async fn live_sessions(&self) -> Vec<ProcessHandle> {
        let mut handles: Vec<ProcessHandle> =
            self.sessions.lock().await.values().map(|s| s.handle).collect();
        handles.sort_by_key(|h| h.pid);
        handles
    }

    /// Kills every live session, used on shutdown.
    pub async fn kill_live_sessions(&self) {
        for handle in self.live_sessions().await {
            self.kill(&handle).await;
        }
    }
}

#[async_trait]
impl ProcessSupervisor for ShellSupervisor {
    async fn launch(&self, command: &str) -> Result<ProcessHandle> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .spawn()
            .map_err(|source| RotationError::Launch {
                command: command.to_string(),
                source,
            })?;
        let pid = child.id().ok_or_else(|| RotationError::Launch {
            command: command.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "process exited immediately"),
        })?;
        let mut handle = ProcessHandle {
            pid,
            leaf_pid: None,
        };
        self.sessions
            .lock()
            .await
            .insert(pid, Session { child, handle });

        handle.leaf_pid = self.resolve_leaf(pid).await;
        match handle.leaf_pid {
            Some(leaf) => debug!(pid, leaf, "Resolved sync process"),
            None => warn!(pid, "Could not find {} under the launched shell", self.binary_name),
        }
        if let Some(session) = self.sessions.lock().await.get_mut(&pid) {
            session.handle = handle;
        }
        Ok(handle)
    }

    async fn exit_status(&self, handle: &ProcessHandle) -> Option<bool> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(&handle.pid)?;
        match session.child.try_wait() {
            Ok(Some(status)) => Some(status.success()),
            Ok(None) => None,
            Err(e) => {
                warn!(pid = handle.pid, "Failed to query process status: {}", e);
                None
            }
        }
    }

    async fn kill(&self, handle: &ProcessHandle) {
        let verified_leaf = handle.leaf_pid.filter(|leaf| {
            let ok = self.is_session_leaf(&process_table(), *leaf, handle.pid);
            if !ok {
                debug!(
                    pid = handle.pid,
                    leaf, "Leaf is no longer our sync process, not killing it"
                );
            }
            ok
        });
        match verified_leaf {
            Some(leaf) => {
                if let Some(process) = process_table().process(Pid::from_u32(leaf)) {
                    info!("Force killed {} process which pid: {}", self.binary_name, leaf);
                    process.kill();
                }
            }
            None => self.kill_tree(handle.pid).await,
        }

        let session = self.sessions.lock().await.remove(&handle.pid);
        if let Some(mut session) = session {
            if let Err(e) = session.child.start_kill() {
                debug!(pid = handle.pid, "Shell already gone: {}", e);
            }
            if let Err(e) = session.child.wait().await {
                warn!(pid = handle.pid, "Failed to reap shell: {}", e);
            }
        }
    }

    async fn kill_tree(&self, pid: u32) {
        let sys = process_table();
        let Some(parent) = sys.process(Pid::from_u32(pid)) else {
            debug!(pid, "Process not found, nothing to kill");
            return;
        };
        info!(
            "Get the process information - pid: {}, name: {}",
            pid,
            parent.name()
        );
        if self.is_sync_binary(parent) {
            // `sh -c` may have exec'd the binary in place of itself; only
            // our own command lines qualify.
            if self.carries_marker(parent) {
                info!("Force killed {} process which pid: {}", self.binary_name, pid);
                parent.kill();
            } else {
                warn!(pid, "Process is a {} we did not start, leaving it", self.binary_name);
            }
            return;
        }
        for child in self.matching_children(&sys, pid) {
            if let Some(process) = sys.process(child) {
                info!("Force killed {} process which pid: {}", self.binary_name, child);
                process.kill();
            }
        }
    }
}

fn process_table() -> System {
    let mut sys = System::new();
    sys.refresh_processes();
    sys
}
