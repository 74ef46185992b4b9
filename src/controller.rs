use crate::command::SyncCommand;
use crate::config::{Config, SwitchWay};
use crate::credentials::{Credential, CredentialPool};
use crate::error::{Result, RotationError};
use crate::monitor::{decide, PollTracker, RotationDecision, RotationPolicy, SessionHistory, StatsSource};
use crate::rclone_conf;
use crate::state::{InstanceState, InstanceStateStore, ProcessLock};
use crate::supervisor::{ProcessHandle, ProcessSupervisor};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    PickCredential,
    Launch,
    WarmupWait,
    MonitorLoop,
    Rotate,
    Fatal,
}

/// How one session ended without an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Rotate(RotationDecision),
    /// The sync process exited successfully on its own.
    Completed,
}

pub struct RotationController {
    config: Config,
    command: SyncCommand,
    policy: RotationPolicy,
    supervisor: Arc<dyn ProcessSupervisor>,
    stats: Arc<dyn StatsSource>,
    store: Arc<dyn InstanceStateStore>,
    phase: Phase,
}

impl RotationController {
    pub fn new(
        config: Config,
        command: SyncCommand,
        supervisor: Arc<dyn ProcessSupervisor>,
        stats: Arc<dyn StatsSource>,
        store: Arc<dyn InstanceStateStore>,
    ) -> Self {
        let policy = RotationPolicy::from_config(&config);
        Self {
            config,
            command,
            policy,
            supervisor,
            stats,
            store,
            phase: Phase::PickCredential,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn enter(&mut self, phase: Phase) {
        debug!(from = ?self.phase, to = ?phase, "Phase change");
        self.phase = phase;
    }

    /// Holds `lock` for the whole run and rotates credentials until the sync
    /// completes or a session fails fatally.
    pub async fn run(&mut self, lock: &mut dyn ProcessLock) -> Result<()> {
        if !lock.try_acquire()? {
            self.enter(Phase::Fatal);
            return Err(RotationError::LockHeld {
                path: self.config.lock_path.clone(),
                reason: "lock is held by another process".to_string(),
            });
        }
        let result = self.run_locked().await;
        lock.release();
        if result.is_err() {
            self.enter(Phase::Fatal);
        }
        result
    }

    async fn run_locked(&mut self) -> Result<()> {
        self.config.validate()?;
        let pool = match CredentialPool::discover(&self.config.credential_dir) {
            Ok(pool) => pool,
            Err(e) => {
                error!("No Service Account Credentials JSON file exists: {}", e);
                return Err(e);
            }
        };
        info!("Loaded {} service accounts", pool.len());

        let mut state = self.store.load()?;
        if let Some(pid) = state.last_pid {
            debug!(pid, "Last PID exists, checking whether it is still alive");
            self.supervisor.kill_tree(pid).await;
        }

        let pool = if pool.credentials().iter().any(|c| c.id() == state.last_sa) {
            info!("Got last_sa {} from state, resorting the pool", state.last_sa);
            pool.resume_order(&state.last_sa)
        } else {
            pool
        };

        let mut last_sa = state.last_sa.clone();
        loop {
            self.enter(Phase::PickCredential);
            info!("Switch to next SA..........");
            let credential = pool.next(&last_sa).clone();
            last_sa = credential.id();
            state.last_sa = last_sa.clone();
            self.store.save(&state)?;
            log_credential(&credential);

            self.enter(Phase::Launch);
            let handle = self.launch(&credential, &mut state).await?;

            self.enter(Phase::WarmupWait);
            info!(
                "Wait {:?} for rclone to come up (pid {})",
                self.config.warmup, handle.pid
            );
            tokio::time::sleep(self.config.warmup).await;

            self.enter(Phase::MonitorLoop);
            match self.monitor_session(&handle).await? {
                SessionOutcome::Rotate(decision) => {
                    self.enter(Phase::Rotate);
                    info!(
                        "Transfer limit may be hit ({}), try to switch..........",
                        decision.reason()
                    );
                    self.supervisor.kill(&handle).await;
                }
                SessionOutcome::Completed => {
                    info!("Rclone finished, no more rotation needed");
                    return Ok(());
                }
            }
        }
    }

    async fn launch(
        &mut self,
        credential: &Credential,
        state: &mut InstanceState,
    ) -> Result<ProcessHandle> {
        if let SwitchWay::Config {
            rclone_config_path,
            dest_name,
        } = &self.config.switch_way
        {
            let previous =
                rclone_conf::set_service_account_file(rclone_config_path, dest_name, credential.path())?;
            info!(
                "Changed rclone.conf SA of [{}] from {:?} to {}",
                dest_name,
                previous,
                credential.id()
            );
        }

        let cmd = self.command.for_credential(credential, &self.config.switch_way);
        info!("Run rclone command: {}", cmd);
        let handle = self.supervisor.launch(&cmd).await?;
        state.last_pid = Some(handle.pid);
        self.store.save(state)?;
        info!("Run rclone command success in pid {}", handle.leaf_pid.unwrap_or(handle.pid));
        Ok(handle)
    }

    /// Polls until a rotation decision fires, the sync completes, or polling
    /// fails `max_poll_failures` times in a row.
    pub async fn monitor_session(&self, handle: &ProcessHandle) -> Result<SessionOutcome> {
        let mut tracker = PollTracker::new(self.config.max_poll_failures);
        let mut history = SessionHistory::default();

        loop {
            let snapshot = match self.stats.poll().await {
                Ok(snapshot) => {
                    tracker.record_success();
                    snapshot
                }
                Err(e) => {
                    if self.supervisor.exit_status(handle).await == Some(true) {
                        return Ok(SessionOutcome::Completed);
                    }
                    let fatal = tracker.record_failure();
                    if fatal {
                        error!(
                            "Check core/stats failed for {} times ({}). Force kill rclone process {}.",
                            tracker.failures(),
                            e,
                            handle.pid
                        );
                        self.supervisor.kill(handle).await;
                        return Err(RotationError::SessionFatal {
                            failures: tracker.failures(),
                            pid: handle.pid,
                        });
                    }
                    warn!(
                        "Check core/stats failed for {} times ({}). Wait {:?} to recheck.",
                        tracker.failures(),
                        e,
                        self.config.poll_interval
                    );
                    tokio::time::sleep(self.config.poll_interval).await;
                    continue;
                }
            };

            snapshot.log_status();
            let decision = decide(&snapshot, &mut history, &self.policy);
            if decision.should_rotate {
                return Ok(SessionOutcome::Rotate(decision));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

fn log_credential(credential: &Credential) {
    match credential.client_email() {
        Ok(email) => info!(
            "Get SA information, file: {}, email: {}",
            credential.id(),
            email
        ),
        Err(e) => warn!("Using SA {} without a readable email: {}", credential.id(), e),
    }
}
