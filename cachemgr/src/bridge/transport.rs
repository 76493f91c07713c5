//! Pipe transport between the manager and one worker incarnation.
//!
//! Three anonymous pipes per incarnation:
//! - **drain**: worker stdout+stderr -> manager (log lines)
//! - **request**: manager -> worker, command lines
//! - **reply**: worker -> manager, reply lines
//!
//! The worker finds its command pipe ends at fixed descriptor numbers
//! (`REQUEST_FD`, `REPLY_FD`), announced in `CLI_FDS_ENV`. Its request line
//! and reply message limits arrive in `CLI_BUFFER_ENV` and `CLI_LIMIT_ENV`.
//! All pipe ends are created close-on-exec; only the descriptors installed
//! in the child survive the exec.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use tokio::net::unix::pipe;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::{DrainCodec, LineCodec};
use super::protocol::{IncomingRequest, Reply, Request};
use crate::config::{DEFAULT_CLI_BUFFER, DEFAULT_CLI_LIMIT};

/// Chosen well above the range libraries normally use.
pub const REQUEST_FD: RawFd = 99;
pub const REPLY_FD: RawFd = 100;

/// Environment variable carrying `"<request fd>,<reply fd>"` to the worker.
pub const CLI_FDS_ENV: &str = "CACHEMGR_CLI_FDS";
/// Longest request line the worker accepts, in bytes.
pub const CLI_BUFFER_ENV: &str = "CACHEMGR_CLI_BUFFER";
/// Longest reply message the worker sends before truncating, in bytes.
pub const CLI_LIMIT_ENV: &str = "CACHEMGR_CLI_LIMIT";

/// Worker output lines longer than this are split.
pub const DRAIN_LINE_MAX: usize = 8 * 1024;

/// Longest reply line the manager reads for a given `cli_limit`.
///
/// Escaping can grow each message byte to four (`\ooo`), plus quotes and
/// the status.
pub fn reply_line_limit(cli_limit: usize) -> usize {
    cli_limit.saturating_mul(4).saturating_add(16)
}

/// Manager-side pipe ends, not yet registered with the runtime.
pub struct ParentPipes {
    drain_rx: OwnedFd,
    request_tx: OwnedFd,
    reply_rx: OwnedFd,
}

/// Worker-side pipe ends, installed into the child at spawn.
pub struct ChildPipes {
    pub drain_tx: OwnedFd,
    pub request_rx: OwnedFd,
    pub reply_tx: OwnedFd,
}

impl ChildPipes {
    /// Raw descriptors the child must install at `REQUEST_FD`/`REPLY_FD`.
    pub fn command_fds(&self) -> (RawFd, RawFd) {
        (self.request_rx.as_raw_fd(), self.reply_tx.as_raw_fd())
    }
}

/// Create the three pipe pairs for one worker incarnation.
pub fn create_pipes() -> io::Result<(ParentPipes, ChildPipes)> {
    let (drain_rx, drain_tx) = pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?;
    let (request_rx, request_tx) = pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?;
    let (reply_rx, reply_tx) = pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?;

    tracing::trace!(
        drain_rx = drain_rx.as_raw_fd(),
        request_tx = request_tx.as_raw_fd(),
        reply_rx = reply_rx.as_raw_fd(),
        "Created worker pipes"
    );

    Ok((
        ParentPipes {
            drain_rx,
            request_tx,
            reply_rx,
        },
        ChildPipes {
            drain_tx,
            request_rx,
            reply_tx,
        },
    ))
}

/// Install `src` at descriptor `target` without close-on-exec.
///
/// Runs between fork and exec, so it only makes async-signal-safe calls.
fn install_fd(src: RawFd, target: RawFd) -> io::Result<()> {
    // SAFETY: plain descriptor syscalls on descriptors owned by this process.
    let rc = unsafe {
        if src == target {
            libc::fcntl(src, libc::F_SETFD, 0)
        } else {
            libc::dup2(src, target)
        }
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Place the command pipe ends at their fixed numbers in the child.
///
/// Must only be called from a `pre_exec` hook.
pub fn install_command_fds(request_rx: RawFd, reply_tx: RawFd) -> io::Result<()> {
    let mut reply_tx = reply_tx;
    if reply_tx == REQUEST_FD {
        // Would be clobbered by the first dup2.
        // SAFETY: dup of an open descriptor.
        reply_tx = unsafe { libc::dup(reply_tx) };
        if reply_tx == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    install_fd(request_rx, REQUEST_FD)?;
    install_fd(reply_tx, REPLY_FD)
}

/// Manager-side framed channels for one incarnation.
pub struct ParentChannels {
    pub drain: FramedRead<pipe::Receiver, DrainCodec>,
    pub requests: FramedWrite<pipe::Sender, LineCodec<Request>>,
    pub replies: FramedRead<pipe::Receiver, LineCodec<Reply>>,
}

impl ParentPipes {
    /// Register the parent ends with the tokio reactor and frame them.
    ///
    /// Request length is policed by the worker, so only reply lines are
    /// bounded here. Must be called from within a tokio runtime.
    pub fn into_channels(self, reply_line_max: usize) -> io::Result<ParentChannels> {
        let drain = pipe::Receiver::from_owned_fd(self.drain_rx)?;
        let requests = pipe::Sender::from_owned_fd(self.request_tx)?;
        let replies = pipe::Receiver::from_owned_fd(self.reply_rx)?;

        Ok(ParentChannels {
            drain: FramedRead::new(drain, DrainCodec::new(DRAIN_LINE_MAX)),
            requests: FramedWrite::new(requests, LineCodec::new(usize::MAX)),
            replies: FramedRead::new(replies, LineCodec::new(reply_line_max)),
        })
    }
}

/// Size limits the worker side enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerLimits {
    /// Longest request line; longer lines are answered with status 100.
    pub request_line: usize,
    /// Longest reply message; longer ones are cut and sent with status 201.
    pub reply_message: usize,
}

impl Default for WorkerLimits {
    fn default() -> Self {
        Self {
            request_line: DEFAULT_CLI_BUFFER,
            reply_message: DEFAULT_CLI_LIMIT,
        }
    }
}

fn parse_limit(name: &str, value: Option<String>, default: usize) -> io::Result<usize> {
    let Some(value) = value else {
        return Ok(default);
    };
    value.trim().parse().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{name} must be a byte count, got {value:?}"),
        )
    })
}

impl WorkerLimits {
    /// Read the limits the manager announced. Unset variables keep defaults.
    pub fn from_env() -> io::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            request_line: parse_limit(
                CLI_BUFFER_ENV,
                std::env::var(CLI_BUFFER_ENV).ok(),
                defaults.request_line,
            )?,
            reply_message: parse_limit(
                CLI_LIMIT_ENV,
                std::env::var(CLI_LIMIT_ENV).ok(),
                defaults.reply_message,
            )?,
        })
    }
}

/// Worker-side framed channels.
pub struct WorkerChannels {
    pub requests: FramedRead<pipe::Receiver, LineCodec<IncomingRequest>>,
    pub replies: FramedWrite<pipe::Sender, LineCodec<Reply>>,
    pub reply_limit: usize,
}

impl WorkerChannels {
    /// Frame the worker's request-read and reply-write pipe ends.
    pub fn from_fds(request_rx: OwnedFd, reply_tx: OwnedFd, limits: WorkerLimits) -> io::Result<Self> {
        Ok(Self {
            requests: FramedRead::new(
                pipe::Receiver::from_owned_fd(request_rx)?,
                LineCodec::new(limits.request_line),
            ),
            replies: FramedWrite::new(
                pipe::Sender::from_owned_fd(reply_tx)?,
                LineCodec::new(usize::MAX),
            ),
            reply_limit: limits.reply_message,
        })
    }
}

fn parse_cli_fds(value: &str) -> io::Result<(RawFd, RawFd)> {
    let invalid = || {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{CLI_FDS_ENV} must be \"<request fd>,<reply fd>\", got {value:?}"),
        )
    };
    let (req, rep) = value.split_once(',').ok_or_else(invalid)?;
    let req: RawFd = req.trim().parse().map_err(|_| invalid())?;
    let rep: RawFd = rep.trim().parse().map_err(|_| invalid())?;
    if req < 0 || rep < 0 || req == rep {
        return Err(invalid());
    }
    Ok((req, rep))
}

/// Connect from the worker side using the descriptors named in `CLI_FDS_ENV`
/// and the limits in `CLI_BUFFER_ENV`/`CLI_LIMIT_ENV`.
///
/// Must be called at most once per process, from within a tokio runtime.
pub fn connect_from_env() -> io::Result<WorkerChannels> {
    let limits = WorkerLimits::from_env()?;
    let value = std::env::var(CLI_FDS_ENV).map_err(|_| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{CLI_FDS_ENV} not set; not started by cachemgr?"),
        )
    })?;
    let (req, rep) = parse_cli_fds(&value)?;

    tracing::trace!(request_fd = req, reply_fd = rep, "Connecting command channel");

    // SAFETY: the manager installed these descriptors for us before exec and
    // nothing else in this process owns them.
    let (req, rep) = unsafe { (OwnedFd::from_raw_fd(req), OwnedFd::from_raw_fd(rep)) };

    WorkerChannels::from_fds(req, rep, limits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::Status;
    use futures::{SinkExt, StreamExt};

    #[test]
    fn cli_fds_parse() {
        assert_eq!(parse_cli_fds("99,100").unwrap(), (99, 100));
        assert_eq!(parse_cli_fds(" 3 , 4 ").unwrap(), (3, 4));
        assert!(parse_cli_fds("99").is_err());
        assert!(parse_cli_fds("a,b").is_err());
        assert!(parse_cli_fds("5,5").is_err());
        assert!(parse_cli_fds("-1,4").is_err());
    }

    #[test]
    fn worker_limits_fall_back_to_defaults() {
        assert_eq!(parse_limit(CLI_BUFFER_ENV, None, 8192).unwrap(), 8192);
        assert_eq!(
            parse_limit(CLI_BUFFER_ENV, Some("65536".to_string()), 8192).unwrap(),
            65536
        );
        assert!(parse_limit(CLI_LIMIT_ENV, Some("48k".to_string()), 1).is_err());
    }

    #[test]
    fn reply_line_limit_leaves_room_for_escaping() {
        let cli_limit = 128;
        let mut line = tokio_util::bytes::BytesMut::new();
        Reply::new(Status::TRUNCATED, "\x01".repeat(cli_limit))
            .encode(&mut line);
        // Trailing newline is not part of the line.
        assert!(line.len() - 1 <= reply_line_limit(cli_limit));
    }

    #[tokio::test]
    async fn parent_channels_carry_lines_both_ways() {
        let (parent, child) = create_pipes().unwrap();
        let mut channels = parent.into_channels(1024).unwrap();

        let ChildPipes {
            drain_tx,
            request_rx,
            reply_tx,
        } = child;
        let WorkerChannels {
            requests: mut worker_requests,
            replies: mut worker_replies,
            ..
        } = WorkerChannels::from_fds(request_rx, reply_tx, WorkerLimits::default()).unwrap();
        let mut worker_stdout = pipe::Sender::from_owned_fd(drain_tx).unwrap();

        channels
            .requests
            .send(Request::new("ping", ["1700000000"]).unwrap())
            .await
            .unwrap();
        let req = match worker_requests.next().await.unwrap().unwrap() {
            IncomingRequest::Request(req) => req,
            IncomingRequest::Malformed(e) => panic!("malformed request: {e}"),
        };
        assert_eq!(req.verb(), "ping");
        assert_eq!(req.args(), &[b"1700000000".to_vec()]);

        worker_replies
            .send(Reply::ok("PONG 1700000000"))
            .await
            .unwrap();
        let reply = channels.replies.next().await.unwrap().unwrap();
        assert_eq!(reply, Reply::ok("PONG 1700000000"));

        tokio::io::AsyncWriteExt::write_all(&mut worker_stdout, b"hello from worker\n")
            .await
            .unwrap();
        drop(worker_stdout);
        assert_eq!(
            channels.drain.next().await.unwrap().unwrap(),
            "hello from worker"
        );
        assert!(channels.drain.next().await.is_none());
    }
}
