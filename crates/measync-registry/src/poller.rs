//! The polling loop.
//!
//! [`Poller::spawn`] moves a [`SourceRegistry`] into a tokio task that ticks
//! it on the configured interval. All mutations go through the
//! [`PollerHandle`] command queue and are applied between ticks, so the
//! handle map and layout set are only ever touched by the poller task.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use measync_core::RegistryConfig;

use crate::error::{PollerError, RegistryError};
use crate::registry::{SourceRegistry, TickReport};
use crate::source::SourceId;

const COMMAND_QUEUE_DEPTH: usize = 64;

enum Command {
    AddSource(SourceId, oneshot::Sender<bool>),
    RemoveSource(SourceId, oneshot::Sender<bool>),
    UpdateConfig(RegistryConfig, oneshot::Sender<Result<(), RegistryError>>),
    TickNow(oneshot::Sender<TickReport>),
}

/// Spawns the polling task.
pub struct Poller;

impl Poller {
    /// Start ticking `registry`. The first tick runs immediately.
    pub fn spawn(registry: SourceRegistry) -> PollerHandle {
        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run(registry, command_rx, shutdown_rx));

        PollerHandle {
            commands,
            shutdown,
            task,
        }
    }
}

/// Handle to a running poller. Dropping it stops the poller.
pub struct PollerHandle {
    commands: mpsc::Sender<Command>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<SourceRegistry>,
}

impl PollerHandle {
    /// Queue [`SourceRegistry::add_source`].
    pub async fn add_source(&self, id: SourceId) -> Result<bool, PollerError> {
        self.call(|reply| Command::AddSource(id, reply)).await
    }

    /// Queue [`SourceRegistry::remove_source`].
    pub async fn remove_source(&self, id: SourceId) -> Result<bool, PollerError> {
        self.call(|reply| Command::RemoveSource(id, reply)).await
    }

    /// Replace the configuration and restart the interval with the new period.
    pub async fn update_config(&self, config: RegistryConfig) -> Result<(), PollerError> {
        self.call(|reply| Command::UpdateConfig(config, reply)).await??;
        Ok(())
    }

    /// Run a tick now, outside the regular schedule.
    pub async fn tick_now(&self) -> Result<TickReport, PollerError> {
        self.call(Command::TickNow).await
    }

    /// Whether the poller task is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the poller, interrupting an in-flight tick, and return the
    /// registry.
    pub async fn stop(self) -> Result<SourceRegistry, PollerError> {
        let _ = self.shutdown.send(());
        self.task.await.map_err(|e| PollerError::Task(e.to_string()))
    }

    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, PollerError> {
        let (reply, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| PollerError::Stopped)?;
        reply_rx.await.map_err(|_| PollerError::Stopped)
    }
}

fn make_interval(period_ms: u64) -> Interval {
    let mut interval = tokio::time::interval(Duration::from_millis(period_ms.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

fn log_report(report: &TickReport) {
    for id in &report.discovered {
        debug!("Discovered {}", id);
    }
    for id in &report.evicted {
        info!("Evicted {}", id);
    }
    if !report.is_clean() {
        debug!("Tick finished with {} error(s)", report.errors.len());
    }
}

async fn run(
    mut registry: SourceRegistry,
    mut commands: mpsc::Receiver<Command>,
    mut shutdown: oneshot::Receiver<()>,
) -> SourceRegistry {
    let mut interval = make_interval(registry.config().poll_interval_ms);
    info!(
        "Poller started with {} source(s), every {} ms",
        registry.len(),
        registry.config().poll_interval_ms
    );

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => break,

            // Ticks win over queued commands. The reset leaves a full period
            // for commands after each tick.
            _ = interval.tick() => {
                tokio::select! {
                    biased;
                    _ = &mut shutdown => break,
                    report = registry.tick() => log_report(&report),
                }
                interval.reset();
            }

            command = commands.recv() => {
                let Some(command) = command else { break };
                match command {
                    Command::AddSource(id, reply) => {
                        let _ = reply.send(registry.add_source(id));
                    }
                    Command::RemoveSource(id, reply) => {
                        let _ = reply.send(registry.remove_source(&id));
                    }
                    Command::UpdateConfig(config, reply) => {
                        let period = config.poll_interval_ms;
                        let result = registry.apply_config(config);
                        if result.is_ok() {
                            interval = make_interval(period);
                        } else {
                            warn!("Rejected configuration update");
                        }
                        let _ = reply.send(result);
                    }
                    Command::TickNow(reply) => {
                        tokio::select! {
                            biased;
                            _ = &mut shutdown => break,
                            report = registry.tick() => {
                                log_report(&report);
                                let _ = reply.send(report);
                            }
                        }
                    }
                }
            }
        }
    }

    info!("Poller stopped after {} tick(s)", registry.ticks());
    registry
}
