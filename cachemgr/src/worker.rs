//! Worker side of the command channel.
//!
//! Runs inside the worker process. The manager side (spawning, queueing,
//! reply matching) lives in `supervisor` and `orchestrator`.
//!
//! Every request line gets exactly one reply line, malformed ones included,
//! so the manager's order-based matching never drifts.

use std::time::Instant;

use futures::{SinkExt, StreamExt};

use crate::bridge::protocol::{IncomingRequest, ProtocolError, Reply, Request, Status};
use crate::bridge::transport::{WorkerChannels, connect_from_env};

/// Answers the manager's commands. `ping` is answered before reaching it.
pub trait CommandHandler: Send {
    fn handle(&mut self, request: &Request) -> Reply;
}

fn pong(request: &Request) -> Reply {
    let ts = request
        .args()
        .first()
        .map(|arg| String::from_utf8_lossy(arg).into_owned())
        .unwrap_or_default();
    Reply::pong(ts)
}

/// Serve requests until the manager closes the request channel.
///
/// Reply messages longer than the channel's reply limit are cut and sent
/// with status 201.
pub async fn run_worker<H: CommandHandler>(
    channels: WorkerChannels,
    mut handler: H,
) -> Result<(), ProtocolError> {
    let WorkerChannels {
        mut requests,
        mut replies,
        reply_limit,
    } = channels;

    while let Some(incoming) = requests.next().await {
        let reply = match incoming? {
            IncomingRequest::Request(request) if request.verb() == "ping" => pong(&request),
            IncomingRequest::Request(request) => {
                tracing::debug!(verb = request.verb(), "Handling request");
                handler.handle(&request)
            }
            IncomingRequest::Malformed(e) => {
                tracing::warn!(error = %e, "Malformed request line");
                Reply::new(Status::SYNTAX, e.to_string())
            }
        };
        let reply = reply.truncate_to(reply_limit);
        if reply.status == Status::TRUNCATED {
            tracing::debug!(limit = reply_limit, "Reply truncated");
        }
        replies.send(reply).await?;
    }

    tracing::debug!("Request channel closed, worker loop done");
    Ok(())
}

/// Connect to the descriptors the manager installed and serve requests.
pub async fn run_worker_from_env<H: CommandHandler>(handler: H) -> Result<(), ProtocolError> {
    let channels = connect_from_env()?;
    tracing::info!(pid = std::process::id(), "Worker connected to command channel");
    run_worker(channels, handler).await
}

/// Minimal handler used when no external worker program is given.
#[derive(Debug)]
pub struct BuiltinHandler {
    started: Instant,
    served: u64,
}

impl Default for BuiltinHandler {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            served: 0,
        }
    }
}

impl BuiltinHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CommandHandler for BuiltinHandler {
    fn handle(&mut self, request: &Request) -> Reply {
        self.served += 1;
        match request.verb() {
            "echo" => {
                let words: Vec<String> = request
                    .args()
                    .iter()
                    .map(|arg| String::from_utf8_lossy(arg).into_owned())
                    .collect();
                Reply::ok(words.join(" "))
            }
            "status" if !request.args().is_empty() => {
                Reply::new(Status::TOO_MANY, "status takes no arguments")
            }
            "status" => Reply::ok(format!(
                "Child in state running, pid {}, uptime {}s, served {}",
                std::process::id(),
                self.started.elapsed().as_secs(),
                self.served
            )),
            other => Reply::new(Status::UNKNOWN, format!("Unknown request: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::transport::{
        ChildPipes, ParentChannels, WorkerLimits, create_pipes, reply_line_limit,
    };
    use tokio::io::AsyncWriteExt;
    use tokio::task::JoinHandle;

    fn request(verb: &str, args: &[&str]) -> Request {
        Request::new(verb, args.iter().copied()).unwrap()
    }

    /// Wire a builtin worker loop to manager-side channels.
    fn serve(limits: WorkerLimits) -> (ParentChannels, JoinHandle<Result<(), ProtocolError>>) {
        let (parent, child) = create_pipes().unwrap();
        let manager = parent
            .into_channels(reply_line_limit(limits.reply_message))
            .unwrap();
        let ChildPipes {
            drain_tx,
            request_rx,
            reply_tx,
        } = child;
        drop(drain_tx);
        let channels = WorkerChannels::from_fds(request_rx, reply_tx, limits).unwrap();
        (manager, tokio::spawn(run_worker(channels, BuiltinHandler::new())))
    }

    #[test]
    fn builtin_echo_and_unknown() {
        let mut handler = BuiltinHandler::new();
        assert_eq!(
            handler.handle(&request("echo", &["hello", "world"])),
            Reply::ok("hello world")
        );
        let reply = handler.handle(&request("vcl.load", &["boot"]));
        assert_eq!(reply.status, Status::UNKNOWN);
        assert_eq!(
            handler.handle(&request("status", &["x"])).status,
            Status::TOO_MANY
        );
    }

    #[test]
    fn builtin_status_reports_running() {
        let mut handler = BuiltinHandler::new();
        let reply = handler.handle(&request("status", &[]));
        assert!(reply.status.is_ok());
        assert!(reply.message.starts_with("Child in state running"));
        assert!(reply.message.ends_with("served 1"));
    }

    #[tokio::test]
    async fn worker_loop_answers_in_order() {
        let (mut manager, worker) = serve(WorkerLimits::default());

        manager
            .requests
            .send(request("ping", &["1700000000"]))
            .await
            .unwrap();
        manager
            .requests
            .send(request("echo", &["a b", "c"]))
            .await
            .unwrap();
        manager
            .requests
            .get_mut()
            .write_all(b"echo \"unterminated\n")
            .await
            .unwrap();
        manager.requests.send(request("nope", &[])).await.unwrap();

        let mut replies = Vec::new();
        for _ in 0..4 {
            replies.push(manager.replies.next().await.unwrap().unwrap());
        }
        assert_eq!(replies[0], Reply::ok("PONG 1700000000"));
        assert_eq!(replies[1], Reply::ok("a b c"));
        assert_eq!(replies[2].status, Status::SYNTAX);
        assert_eq!(replies[3].status, Status::UNKNOWN);

        drop(manager);
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn overlong_request_is_answered_and_loop_continues() {
        let (mut manager, worker) = serve(WorkerLimits {
            request_line: 1024,
            reply_message: 1024,
        });

        let mut line = b"echo ".to_vec();
        line.extend(std::iter::repeat_n(b'x', 2000));
        line.push(b'\n');
        manager.requests.get_mut().write_all(&line).await.unwrap();
        manager.requests.send(request("echo", &["after"])).await.unwrap();

        let first = manager.replies.next().await.unwrap().unwrap();
        assert_eq!(first.status, Status::SYNTAX);
        let second = manager.replies.next().await.unwrap().unwrap();
        assert_eq!(second, Reply::ok("after"));

        drop(manager);
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn long_reply_is_truncated_with_201() {
        let (mut manager, worker) = serve(WorkerLimits {
            request_line: 64 * 1024,
            reply_message: 128,
        });

        let word = "y".repeat(1000);
        manager
            .requests
            .send(request("echo", &[word.as_str()]))
            .await
            .unwrap();
        manager.requests.send(request("echo", &["short"])).await.unwrap();

        let first = manager.replies.next().await.unwrap().unwrap();
        assert_eq!(first, Reply::new(Status::TRUNCATED, "y".repeat(128)));
        let second = manager.replies.next().await.unwrap().unwrap();
        assert_eq!(second, Reply::ok("short"));

        drop(manager);
        worker.await.unwrap().unwrap();
    }
}
