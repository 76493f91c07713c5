//! Worker launch and per-incarnation I/O.
//!
//! Flow for one incarnation:
//! 1. Create drain/request/reply pipes
//! 2. Spawn the worker: stdin from /dev/null, stdout+stderr into the drain
//!    pipe, command pipe ends at fixed descriptors
//! 3. Frame the parent ends and hand them to the supervisor as a
//!    `WorkerProcess`; request writes go through a writer task so a worker
//!    that stops reading never blocks the caller
//! 4. Surface replies, output lines, write failures and the exit status as
//!    `WorkerEvent`s

use std::ffi::OsString;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use futures::{SinkExt, Stream, StreamExt};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{DrainCodec, LineCodec};
use crate::bridge::protocol::{ProtocolError, Reply, Request};
use crate::bridge::transport::{
    CLI_BUFFER_ENV, CLI_FDS_ENV, CLI_LIMIT_ENV, ParentChannels, REPLY_FD, REQUEST_FD,
    create_pipes, install_command_fds, reply_line_limit,
};

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// How long pipes are still read after the worker has been reaped.
const EXIT_GRACE: Duration = Duration::from_millis(50);

/// Extension point for how the worker program is invoked.
///
/// The returned command is completed by `launch`, which owns stdio and the
/// command channel descriptors.
pub trait WorkerSpawner: Send + Sync {
    fn command(&self) -> Command;
}

/// Runs a fixed program with fixed arguments.
#[derive(Debug, Clone)]
pub struct ProgramSpawner {
    program: OsString,
    args: Vec<OsString>,
}

impl ProgramSpawner {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Re-invoke the running executable with `args` (worker mode).
    pub fn current_exe<I, S>(args: I) -> io::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Ok(Self::new(std::env::current_exe()?).with_args(args))
    }
}

impl WorkerSpawner for ProgramSpawner {
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

/// Size limits handed to a new incarnation.
#[derive(Debug, Clone, Copy)]
pub struct ChannelLimits {
    /// Longest request line the worker accepts (`cli_buffer`).
    pub request_line: usize,
    /// Longest reply message before the worker truncates (`cli_limit`).
    pub reply_message: usize,
}

/// Something that happened on a live worker.
#[derive(Debug)]
pub enum WorkerEvent {
    Reply(Result<Reply, ProtocolError>),
    /// Reply pipe hit EOF; the worker closed it or died.
    ReplyClosed,
    /// A request could not be written to the worker.
    WriteFailed(ProtocolError),
    Output(String),
    OutputClosed,
    Exited(io::Result<ExitStatus>),
}

type RequestSink = FramedWrite<pipe::Sender, LineCodec<Request>>;

/// Writer task: forwards queued requests to the request pipe.
async fn write_requests(
    mut sink: RequestSink,
    mut rx: mpsc::UnboundedReceiver<Request>,
) -> Result<(), ProtocolError> {
    while let Some(request) = rx.recv().await {
        sink.send(request).await?;
    }
    Ok(())
}

/// One worker incarnation, valid from launch until its exit is observed.
pub struct WorkerProcess {
    pid: u32,
    incarnation: u64,
    launched_at: Instant,
    child: Child,
    exit: Option<io::Result<ExitStatus>>,
    exited_at: Option<Instant>,
    drain: Option<FramedRead<pipe::Receiver, DrainCodec>>,
    requests: Option<mpsc::UnboundedSender<Request>>,
    writer: Option<JoinHandle<Result<(), ProtocolError>>>,
    replies: Option<FramedRead<pipe::Receiver, LineCodec<Reply>>>,
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

/// Sleep until `deadline`, or forever when there is none.
pub(crate) async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_or_pending<S>(stream: Option<&mut S>) -> Option<S::Item>
where
    S: Stream + Unpin,
{
    match stream {
        Some(s) => s.next().await,
        None => std::future::pending().await,
    }
}

async fn join_or_pending<T>(task: Option<&mut JoinHandle<T>>) -> Result<T, JoinError> {
    match task {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

impl WorkerProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn incarnation(&self) -> u64 {
        self.incarnation
    }

    pub fn launched_at(&self) -> Instant {
        self.launched_at
    }

    /// True while the command channel can carry requests.
    pub fn is_attached(&self) -> bool {
        self.requests.is_some() && self.replies.is_some()
    }

    /// Wait for the next event. Cancel safe.
    ///
    /// Once the process has exited, replies and output already in the pipes
    /// are still surfaced for up to `EXIT_GRACE` before `Exited` is returned,
    /// so nothing the worker wrote before dying is lost. The grace period
    /// bounds the wait when a grandchild inherited the pipes.
    pub async fn next_event(&mut self) -> WorkerEvent {
        loop {
            if self.exit.is_some() && self.replies.is_none() && self.drain.is_none() {
                return self.take_exit();
            }
            let grace = self.exited_at.map(|t| t + EXIT_GRACE);

            tokio::select! {
                biased;

                reply = next_or_pending(self.replies.as_mut()) => return match reply {
                    Some(result) => WorkerEvent::Reply(result),
                    None => {
                        self.replies = None;
                        WorkerEvent::ReplyClosed
                    }
                },

                line = next_or_pending(self.drain.as_mut()) => return match line {
                    Some(Ok(line)) => WorkerEvent::Output(line),
                    Some(Err(e)) => {
                        tracing::warn!(pid = self.pid, error = %e, "Worker output pipe error");
                        self.drain = None;
                        WorkerEvent::OutputClosed
                    }
                    None => {
                        self.drain = None;
                        WorkerEvent::OutputClosed
                    }
                },

                written = join_or_pending(self.writer.as_mut()) => {
                    self.writer = None;
                    match written {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => return WorkerEvent::WriteFailed(e),
                        Err(e) if e.is_cancelled() => {}
                        Err(e) => return WorkerEvent::WriteFailed(ProtocolError::Io(io::Error::other(e))),
                    }
                }

                status = self.child.wait(), if self.exit.is_none() => {
                    tracing::trace!(pid = self.pid, "Worker reaped, draining pipes");
                    self.exit = Some(status);
                    self.exited_at = Some(Instant::now());
                }

                _ = sleep_until_opt(grace) => return self.take_exit(),
            }
        }
    }

    fn take_exit(&mut self) -> WorkerEvent {
        WorkerEvent::Exited(
            self.exit
                .take()
                .unwrap_or_else(|| Err(io::Error::other("exit status already reported"))),
        )
    }

    /// Queue one request line for the writer task. Never waits on the pipe;
    /// a failed write surfaces later as `WorkerEvent::WriteFailed`.
    pub fn send(&self, request: Request) -> Result<(), ProtocolError> {
        let closed = || {
            ProtocolError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "request channel closed",
            ))
        };
        let requests = self.requests.as_ref().ok_or_else(closed)?;
        requests.send(request).map_err(|_| closed())
    }

    /// Drop the command channel after a protocol fault.
    ///
    /// The drain stays open so the worker's last words still get logged.
    pub fn detach_channel(&mut self) {
        self.requests = None;
        self.replies = None;
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }

    /// True once the process has been reaped.
    pub fn has_exited(&self) -> bool {
        self.exited_at.is_some()
    }

    /// Send SIGKILL to the worker. No-op once it has been reaped, since the
    /// pid may already belong to someone else.
    pub fn kill(&self) -> io::Result<()> {
        if self.has_exited() {
            return Ok(());
        }
        let pid = i32::try_from(self.pid)
            .map_err(|_| io::Error::other(format!("pid {} out of range", self.pid)))?;
        kill(Pid::from_raw(pid), Signal::SIGKILL).map_err(io::Error::from)
    }
}

/// Spawn a new worker incarnation and wire its pipes.
pub fn launch(
    spawner: &dyn WorkerSpawner,
    incarnation: u64,
    limits: ChannelLimits,
) -> Result<WorkerProcess, SpawnError> {
    let (parent, child_pipes) = create_pipes()?;
    let (request_rx, reply_tx) = child_pipes.command_fds();

    let mut cmd = spawner.command();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::from(child_pipes.drain_tx.try_clone()?))
        .stderr(Stdio::from(child_pipes.drain_tx.try_clone()?))
        .env(CLI_FDS_ENV, format!("{REQUEST_FD},{REPLY_FD}"))
        .env(CLI_BUFFER_ENV, limits.request_line.to_string())
        .env(CLI_LIMIT_ENV, limits.reply_message.to_string())
        .kill_on_drop(true);

    // SAFETY: the hook only performs async-signal-safe descriptor syscalls.
    unsafe {
        cmd.pre_exec(move || install_command_fds(request_rx, reply_tx));
    }

    tracing::debug!(incarnation, "Spawning worker subprocess");
    let child = cmd.spawn()?;
    let pid = child
        .id()
        .ok_or_else(|| SpawnError::Other("worker exited before its pid was read".to_string()))?;

    // Our copies of the worker's ends must go, or EOF never arrives.
    drop(cmd);
    drop(child_pipes);

    let ParentChannels {
        drain,
        requests,
        replies,
    } = parent.into_channels(reply_line_limit(limits.reply_message))?;

    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_requests(requests, request_rx));

    tracing::info!(pid, incarnation, "Worker started");

    Ok(WorkerProcess {
        pid,
        incarnation,
        launched_at: Instant::now(),
        child,
        exit: None,
        exited_at: None,
        drain: Some(drain),
        requests: Some(request_tx),
        writer: Some(writer),
        replies: Some(replies),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: ChannelLimits = ChannelLimits {
        request_line: 4096,
        reply_message: 1024,
    };

    /// bash, not sh: dash cannot redirect descriptors above 9.
    fn bash(script: &str) -> ProgramSpawner {
        ProgramSpawner::new("/bin/bash").with_args(["-c", script])
    }

    async fn collect_until_exit(worker: &mut WorkerProcess) -> (Vec<WorkerEvent>, ExitStatus) {
        let mut events = Vec::new();
        loop {
            match worker.next_event().await {
                WorkerEvent::Exited(status) => return (events, status.unwrap()),
                other => events.push(other),
            }
        }
    }

    #[tokio::test]
    async fn stdout_and_stderr_reach_the_drain() {
        let spawner = bash("echo to-stdout; echo to-stderr >&2; read line; exit 3");
        let mut worker = launch(&spawner, 1, LIMITS).unwrap();
        assert!(worker.pid() > 0);
        assert_eq!(worker.incarnation(), 1);

        let (events, status) = collect_until_exit(&mut worker).await;
        assert_eq!(status.code(), Some(3));

        let output: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                WorkerEvent::Output(line) => Some(line.as_str()),
                _ => None,
            })
            .collect();
        assert!(output.contains(&"to-stdout"));
        assert!(output.contains(&"to-stderr"));
    }

    #[tokio::test]
    async fn command_channel_uses_fixed_descriptors() {
        let spawner = bash(r#"
            [ "$CACHEMGR_CLI_FDS" = "99,100" ] || exit 9
            read -r verb arg <&99
            echo "200 $verb:$arg" >&100
        "#);
        let mut worker = launch(&spawner, 7, LIMITS).unwrap();
        assert!(worker.is_attached());

        worker.send(Request::new("ping", ["42"]).unwrap()).unwrap();

        let (events, status) = collect_until_exit(&mut worker).await;
        assert!(status.success(), "worker exited with {status}");
        let reply = events.into_iter().find_map(|e| match e {
            WorkerEvent::Reply(r) => Some(r.unwrap()),
            _ => None,
        });
        assert_eq!(reply, Some(Reply::ok("ping:42")));
    }

    #[tokio::test]
    async fn kill_terminates_the_worker() {
        let spawner = bash("while :; do sleep 1; done");
        let mut worker = launch(&spawner, 1, LIMITS).unwrap();
        worker.kill().unwrap();

        let (_, status) = collect_until_exit(&mut worker).await;
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(status.signal(), Some(libc::SIGKILL));
    }

    #[tokio::test]
    async fn detached_channel_refuses_requests() {
        let spawner = bash("sleep 5");
        let mut worker = launch(&spawner, 1, LIMITS).unwrap();
        worker.detach_channel();
        assert!(!worker.is_attached());
        assert!(matches!(
            worker.send(Request::new("ping", ["1"]).unwrap()),
            Err(ProtocolError::Io(_))
        ));
        worker.kill().unwrap();
        let _ = collect_until_exit(&mut worker).await;
    }

    #[tokio::test]
    async fn limits_reach_the_worker_environment() {
        let spawner = bash(r#"echo "$CACHEMGR_CLI_BUFFER/$CACHEMGR_CLI_LIMIT""#);
        let mut worker = launch(&spawner, 1, LIMITS).unwrap();
        let (events, _) = collect_until_exit(&mut worker).await;
        assert!(events.iter().any(|e| matches!(e, WorkerEvent::Output(l) if l == "4096/1024")));
    }

    #[tokio::test]
    async fn send_does_not_wait_for_a_worker_that_never_reads() {
        let spawner = bash("sleep 30");
        let mut worker = launch(&spawner, 1, LIMITS).unwrap();

        // Far more than a pipe buffer holds.
        let big = "z".repeat(256 * 1024);
        for _ in 0..4 {
            worker
                .send(Request::new("echo", [big.as_str()]).unwrap())
                .unwrap();
        }

        worker.kill().unwrap();
        let (_, status) = tokio::time::timeout(Duration::from_secs(5), collect_until_exit(&mut worker))
            .await
            .expect("worker exit observed while a write was stuck");
        assert!(!status.success());
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let spawner = ProgramSpawner::new("/nonexistent/cachemgr-worker");
            assert!(matches!(
                launch(&spawner, 1, LIMITS),
                Err(SpawnError::Spawn(_))
            ));
        });
    }
}
