//! Worker supervisor: lifecycle, restart decisions and the command channel.
//!
//! One task owns all state. Every event (control message, reply line, output
//! line, child exit, heartbeat timer, reply timeout, restart timer) is handled
//! to completion from a single `select!`, so no locks are involved. Handlers
//! never wait on the worker: request lines are queued to the incarnation's
//! writer task.
//! `SupervisorHandle` is the cloneable front door.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::bridge::protocol::{ProtocolError, Reply, Request};
use crate::config::ManagerConfig;
use crate::health::{DesiredState, ManagerStatus};
use crate::heartbeat::Heartbeat;
use crate::multiplexer::Multiplexer;
use crate::orchestrator::{
    self, ChannelLimits, SpawnError, WorkerEvent, WorkerProcess, sleep_until_opt,
};
use crate::queue::{PendingCommand, ReplyCallback};
use crate::version::CACHEMGR_VERSION;

const CONTROL_CAPACITY: usize = 64;
/// Floor for relaunch attempts after a failed spawn.
const SPAWN_RETRY_DELAY: Duration = Duration::from_secs(1);
/// How long shutdown waits for a killed worker to be reaped.
const SHUTDOWN_REAP_TIMEOUT: Duration = Duration::from_secs(5);
/// How long a worker may outlive its closed command channel before SIGKILL.
const CHANNEL_CLOSED_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("worker is not running")]
    NotRunning,
    #[error("supervisor has shut down")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

enum Control {
    Start(oneshot::Sender<Result<(), SupervisorError>>),
    Stop(oneshot::Sender<()>),
    Kill(oneshot::Sender<()>),
    Submit {
        request: Request,
        callback: ReplyCallback,
        ack: oneshot::Sender<Result<(), SupervisorError>>,
    },
    Status(oneshot::Sender<ManagerStatus>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle to a running supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<Control>,
}

impl SupervisorHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Control,
    ) -> Result<T, SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| SupervisorError::Closed)?;
        rx.await.map_err(|_| SupervisorError::Closed)
    }

    /// Want the worker running. No-op if already wanted.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        self.call(Control::Start).await?
    }

    /// Stop wanting the worker. A running worker is left alone.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        self.call(Control::Stop).await
    }

    /// Stop wanting the worker and SIGKILL it.
    pub async fn kill(&self) -> Result<(), SupervisorError> {
        self.call(Control::Kill).await
    }

    /// Queue a command for the worker.
    ///
    /// Returns once the command is queued; `callback` runs later on the
    /// supervisor task with the reply, exactly once.
    pub async fn submit<I, A, F>(
        &self,
        verb: &str,
        args: I,
        callback: F,
    ) -> Result<(), SupervisorError>
    where
        I: IntoIterator<Item = A>,
        A: Into<Vec<u8>>,
        F: FnOnce(Reply) + Send + 'static,
    {
        let request = Request::new(verb, args)?;
        self.call(|ack| Control::Submit {
            request,
            callback: Box::new(callback),
            ack,
        })
        .await?
    }

    /// Submit a command and wait for its reply.
    pub async fn request<I, A>(&self, verb: &str, args: I) -> Result<Reply, SupervisorError>
    where
        I: IntoIterator<Item = A>,
        A: Into<Vec<u8>>,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(verb, args, move |reply| {
            let _ = tx.send(reply);
        })
        .await?;
        rx.await.map_err(|_| SupervisorError::Closed)
    }

    pub async fn status(&self) -> Result<ManagerStatus, SupervisorError> {
        self.call(Control::Status).await
    }

    /// Kill the worker, fail all queued commands and end the event loop.
    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        self.call(Control::Shutdown).await
    }
}

async fn next_worker_event(worker: Option<&mut WorkerProcess>) -> WorkerEvent {
    match worker {
        Some(worker) => worker.next_event().await,
        None => std::future::pending().await,
    }
}

pub struct Supervisor {
    config: ManagerConfig,
    desired: DesiredState,
    worker: Option<WorkerProcess>,
    mux: Multiplexer,
    heartbeat: Heartbeat,
    incarnations: u64,
    restarts: u64,
    /// Consecutive incarnations that died young.
    crashes: u32,
    restart_at: Option<Instant>,
    reply_deadline: Option<Instant>,
    /// Set when the worker closed its end of the command channel.
    kill_at: Option<Instant>,
    last_exit: Option<String>,
}

impl Supervisor {
    pub fn new(config: ManagerConfig) -> Self {
        let heartbeat = Heartbeat::new(config.ping_interval);
        Self {
            config,
            desired: DesiredState::Stopped,
            worker: None,
            mux: Multiplexer::new(),
            heartbeat,
            incarnations: 0,
            restarts: 0,
            crashes: 0,
            restart_at: None,
            reply_deadline: None,
            kill_at: None,
            last_exit: None,
        }
    }

    /// Run the event loop on a new task.
    ///
    /// The loop ends on `shutdown()` or when every handle is dropped.
    pub fn spawn(config: ManagerConfig) -> (SupervisorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(CONTROL_CAPACITY);
        let task = tokio::spawn(Self::new(config).run(rx));
        (SupervisorHandle { tx }, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Control>) {
        tracing::debug!(config = ?self.config, "Supervisor event loop starting");
        loop {
            let heartbeat_at = self.heartbeat.deadline();
            let reply_deadline = self.reply_deadline;
            let restart_at = self.restart_at;
            let kill_at = self.kill_at;

            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(Control::Shutdown(ack)) => {
                        self.shutdown().await;
                        let _ = ack.send(());
                        break;
                    }
                    Some(msg) => self.handle_control(msg),
                    None => {
                        tracing::debug!("All supervisor handles dropped");
                        self.shutdown().await;
                        break;
                    }
                },

                event = next_worker_event(self.worker.as_mut()) => {
                    self.handle_worker_event(event);
                }

                _ = sleep_until_opt(heartbeat_at) => self.send_heartbeat(),

                _ = sleep_until_opt(reply_deadline) => {
                    self.reply_deadline = None;
                    self.fault(&"no reply within cli_timeout");
                }

                _ = sleep_until_opt(restart_at) => {
                    self.restart_at = None;
                    self.relaunch();
                }

                _ = sleep_until_opt(kill_at) => {
                    self.kill_at = None;
                    if let Some(worker) = &self.worker {
                        tracing::warn!(pid = worker.pid(), "Worker outlived its command channel, killing");
                        if let Err(e) = worker.kill() {
                            tracing::warn!(pid = worker.pid(), error = %e, "Failed to signal worker");
                        }
                    }
                }
            }
        }
        tracing::debug!("Supervisor event loop exited");
    }

    fn handle_control(&mut self, msg: Control) {
        match msg {
            Control::Start(ack) => {
                let result = self.start();
                let _ = ack.send(result);
            }
            Control::Stop(ack) => {
                self.stop();
                let _ = ack.send(());
            }
            Control::Kill(ack) => {
                self.kill();
                let _ = ack.send(());
            }
            Control::Submit {
                request,
                callback,
                ack,
            } => {
                let result = self.submit(request, callback);
                let _ = ack.send(result);
            }
            Control::Status(ack) => {
                let _ = ack.send(self.status());
            }
            // Handled by the loop, which has to exit afterwards.
            Control::Shutdown(ack) => {
                let _ = ack.send(());
            }
        }
    }

    fn start(&mut self) -> Result<(), SupervisorError> {
        if self.desired == DesiredState::Running {
            return Ok(());
        }
        self.desired = DesiredState::Running;
        tracing::info!("Worker start requested");

        // A worker left running by an earlier stop is simply kept.
        if self.worker.is_some() {
            return Ok(());
        }
        if let Err(e) = self.launch() {
            tracing::error!(error = %e, "Failed to start worker");
            self.desired = DesiredState::Stopped;
            return Err(e.into());
        }
        Ok(())
    }

    fn stop(&mut self) {
        tracing::info!("Worker stop requested");
        self.desired = DesiredState::Stopped;
        self.restart_at = None;
    }

    fn kill(&mut self) {
        self.stop();
        if let Some(worker) = &self.worker {
            tracing::info!(pid = worker.pid(), "Killing worker");
            if let Err(e) = worker.kill() {
                tracing::warn!(pid = worker.pid(), error = %e, "Failed to signal worker");
            }
        }
    }

    fn submit(&mut self, request: Request, callback: ReplyCallback) -> Result<(), SupervisorError> {
        if self.worker.is_none() && self.desired == DesiredState::Stopped {
            return Err(SupervisorError::NotRunning);
        }
        if let Some(request) = self.mux.submit(PendingCommand::new(request, callback)) {
            self.transmit(request);
        }
        Ok(())
    }

    fn status(&self) -> ManagerStatus {
        ManagerStatus {
            version: CACHEMGR_VERSION.to_string(),
            desired: self.desired,
            pid: self.worker.as_ref().map(WorkerProcess::pid),
            incarnation: self.worker.as_ref().map(WorkerProcess::incarnation),
            restarts: self.restarts,
            queued: self.mux.queued(),
            in_flight: self.mux.in_flight(),
            last_heartbeat_secs: self
                .heartbeat
                .last_ack_age(Instant::now())
                .map(|age| age.as_secs()),
            last_exit: self.last_exit.clone(),
        }
    }

    fn launch(&mut self) -> Result<(), SpawnError> {
        let limits = ChannelLimits {
            request_line: self.config.cli_buffer,
            reply_message: self.config.cli_limit,
        };
        let incarnation = self.incarnations + 1;
        let worker = orchestrator::launch(self.config.spawner.as_ref(), incarnation, limits)?;
        self.incarnations = incarnation;
        self.worker = Some(worker);

        if let Some(request) = self.mux.attach() {
            self.transmit(request);
        }
        self.heartbeat.arm_now(Instant::now());
        Ok(())
    }

    fn relaunch(&mut self) {
        if self.desired != DesiredState::Running || self.worker.is_some() {
            return;
        }
        if let Err(e) = self.launch() {
            self.crashes = self.crashes.saturating_add(1);
            let delay = self
                .config
                .backoff
                .delay(self.crashes)
                .max(SPAWN_RETRY_DELAY);
            tracing::error!(
                error = %e,
                retry_in_ms = delay.as_millis() as u64,
                "Failed to relaunch worker"
            );
            self.restart_at = Some(Instant::now() + delay);
        }
    }

    /// Hand a request to the worker's writer and start its reply timer.
    ///
    /// A write that stalls is covered by the same timer.
    fn transmit(&mut self, request: Request) {
        let Some(worker) = self.worker.as_ref() else {
            return;
        };
        tracing::trace!(pid = worker.pid(), request = %request, "Sending request");
        self.reply_deadline = self.config.cli_timeout.map(|t| Instant::now() + t);
        if let Err(e) = worker.send(request) {
            self.fault(&e);
        }
    }

    fn send_heartbeat(&mut self) {
        let request = self.heartbeat.fire();
        if let Some(request) = self.mux.submit(PendingCommand::heartbeat(request)) {
            self.transmit(request);
        }
    }

    fn on_reply(&mut self, reply: Reply) {
        match self.mux.on_reply(reply) {
            Ok(advance) => {
                self.reply_deadline = None;
                if let Some(ack) = advance.heartbeat {
                    self.heartbeat.on_ack(&ack, Instant::now());
                }
                if let Some(next) = advance.next {
                    self.transmit(next);
                }
            }
            Err(e) => self.fault(&e),
        }
    }

    fn handle_worker_event(&mut self, event: WorkerEvent) {
        let Some(pid) = self.worker.as_ref().map(WorkerProcess::pid) else {
            return;
        };
        match event {
            WorkerEvent::Reply(Ok(reply)) => self.on_reply(reply),
            WorkerEvent::Reply(Err(e)) => self.fault(&e),
            WorkerEvent::ReplyClosed => self.channel_closed(pid, "reply"),
            WorkerEvent::WriteFailed(ProtocolError::Io(e))
                if e.kind() == io::ErrorKind::BrokenPipe =>
            {
                self.channel_closed(pid, "request");
            }
            WorkerEvent::WriteFailed(e) => self.fault(&e),
            WorkerEvent::Output(line) => {
                tracing::info!(target: "cachemgr::worker", pid, "{line}");
            }
            WorkerEvent::OutputClosed => {
                tracing::debug!(pid, "Worker output closed");
            }
            WorkerEvent::Exited(status) => self.on_exit(pid, status),
        }
    }

    /// Tear down the command channel of the current incarnation and kill it.
    ///
    /// The restart decision happens when the exit is observed.
    fn fault(&mut self, reason: &dyn std::fmt::Display) {
        if let Some(worker) = self.worker.as_mut() {
            if worker.is_attached() && !worker.has_exited() {
                tracing::error!(
                    pid = worker.pid(),
                    incarnation = worker.incarnation(),
                    error = %reason,
                    "Command channel fault, killing worker"
                );
            }
            worker.detach_channel();
            if let Err(e) = worker.kill() {
                tracing::warn!(pid = worker.pid(), error = %e, "Failed to signal worker");
            }
        }
        self.release_channel();
    }

    /// The worker closed its end of the command channel, usually because it
    /// is exiting. The exit path decides what happens next; a worker still
    /// alive after `CHANNEL_CLOSED_GRACE` is killed.
    fn channel_closed(&mut self, pid: u32, side: &str) {
        let Some(worker) = self.worker.as_mut() else {
            return;
        };
        tracing::debug!(pid, side, "Worker closed its command channel");
        worker.detach_channel();
        if !worker.has_exited() {
            self.kill_at = Some(Instant::now() + CHANNEL_CLOSED_GRACE);
        }
        self.release_channel();
    }

    /// Commands queued at this moment are failed. Later submissions wait
    /// for the next incarnation.
    fn release_channel(&mut self) {
        self.reply_deadline = None;
        self.heartbeat.disarm();
        if self.mux.is_attached() {
            self.fail_queued();
        }
    }

    fn fail_queued(&mut self) {
        let failed = self.mux.detach();
        if failed > 0 {
            tracing::warn!(failed, "Failed queued commands with channel reset");
        }
    }

    fn on_exit(&mut self, pid: u32, status: io::Result<ExitStatus>) {
        let Some(worker) = self.worker.take() else {
            panic!("exit reported for pid {pid} with no worker tracked");
        };
        assert_eq!(
            worker.pid(),
            pid,
            "exit reported for pid {pid}, tracked worker is {}",
            worker.pid()
        );
        let lived = worker.launched_at().elapsed();
        let incarnation = worker.incarnation();
        drop(worker);
        self.kill_at = None;

        match &status {
            Ok(s) if self.desired == DesiredState::Running => {
                tracing::warn!(pid, incarnation, status = %s, "Worker exited unexpectedly");
            }
            Ok(s) => tracing::info!(pid, incarnation, status = %s, "Worker exited"),
            Err(e) => tracing::error!(pid, incarnation, error = %e, "Failed to wait for worker"),
        }
        self.last_exit = Some(match &status {
            Ok(s) => s.to_string(),
            Err(e) => format!("unknown: {e}"),
        });
        self.release_channel();

        if self.desired == DesiredState::Running && !self.config.auto_restart {
            tracing::info!("auto_restart is off, worker stays down");
            self.desired = DesiredState::Stopped;
        }
        if self.desired != DesiredState::Running {
            // Nothing will ever attach to take these.
            self.fail_queued();
            return;
        }

        if lived >= self.config.backoff.reset_after {
            self.crashes = 0;
        }
        self.crashes = self.crashes.saturating_add(1);
        let delay = self.config.backoff.delay(self.crashes);
        self.restarts += 1;
        self.restart_at = Some(Instant::now() + delay);
        tracing::info!(
            restarts = self.restarts,
            delay_ms = delay.as_millis() as u64,
            "Scheduling worker restart"
        );
    }

    async fn shutdown(&mut self) {
        tracing::info!("Supervisor shutting down");
        self.kill();
        if let Some(worker) = self.worker.as_mut() {
            let pid = worker.pid();
            let reaped = tokio::time::timeout(SHUTDOWN_REAP_TIMEOUT, async {
                loop {
                    match worker.next_event().await {
                        WorkerEvent::Exited(status) => return status,
                        WorkerEvent::Output(line) => {
                            tracing::info!(target: "cachemgr::worker", pid, "{line}");
                        }
                        _ => {}
                    }
                }
            })
            .await;
            match reaped {
                Ok(status) => self.on_exit(pid, status),
                Err(_) => {
                    tracing::warn!(pid, "Worker not reaped before shutdown deadline");
                    self.worker = None;
                }
            }
        }
        self.release_channel();
        self.fail_queued();
    }
}
