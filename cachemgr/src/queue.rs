//! Pending administrative commands, in submission order.

use std::collections::VecDeque;

use crate::bridge::protocol::{Reply, Request};

/// Caller-supplied completion, invoked exactly once with the reply.
pub type ReplyCallback = Box<dyn FnOnce(Reply) + Send + 'static>;

enum Completion {
    Caller(ReplyCallback),
    /// Heartbeat ping; the reply goes back to the supervisor.
    Heartbeat,
}

/// One queued command and whoever is waiting for its reply.
pub struct PendingCommand {
    request: Request,
    completion: Completion,
}

impl PendingCommand {
    pub fn new<F>(request: Request, callback: F) -> Self
    where
        F: FnOnce(Reply) + Send + 'static,
    {
        Self {
            request,
            completion: Completion::Caller(Box::new(callback)),
        }
    }

    pub(crate) fn heartbeat(request: Request) -> Self {
        Self {
            request,
            completion: Completion::Heartbeat,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self.completion, Completion::Heartbeat)
    }

    /// Deliver the reply. Heartbeat replies are handed back instead.
    pub fn complete(self, reply: Reply) -> Option<Reply> {
        match self.completion {
            Completion::Caller(callback) => {
                callback(reply);
                None
            }
            Completion::Heartbeat => Some(reply),
        }
    }
}

impl std::fmt::Debug for PendingCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCommand")
            .field("request", &self.request)
            .field("heartbeat", &self.is_heartbeat())
            .finish()
    }
}

/// FIFO of pending commands. Never reordered.
#[derive(Debug, Default)]
pub struct RequestQueue {
    commands: VecDeque<PendingCommand>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, command: PendingCommand) {
        self.commands.push_back(command);
    }

    pub fn front(&self) -> Option<&PendingCommand> {
        self.commands.front()
    }

    pub fn pop_front(&mut self) -> Option<PendingCommand> {
        self.commands.pop_front()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Remove every command, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = PendingCommand> + '_ {
        self.commands.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn request(verb: &str) -> Request {
        Request::new(verb, Vec::<String>::new()).unwrap()
    }

    #[test]
    fn callback_receives_the_reply() {
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let cmd = PendingCommand::new(request("status"), move |reply| {
            *sink.lock().unwrap() = Some(reply);
        });
        assert!(!cmd.is_heartbeat());
        assert_eq!(cmd.complete(Reply::ok("running")), None);
        assert_eq!(*seen.lock().unwrap(), Some(Reply::ok("running")));
    }

    #[test]
    fn heartbeat_hands_the_reply_back() {
        let cmd = PendingCommand::heartbeat(Request::ping(1));
        assert!(cmd.is_heartbeat());
        assert_eq!(cmd.complete(Reply::pong("1")), Some(Reply::pong("1")));
    }

    #[test]
    fn queue_is_fifo() {
        let mut queue = RequestQueue::new();
        for verb in ["a", "b", "c"] {
            queue.push_back(PendingCommand::new(request(verb), |_| {}));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.front().map(|c| c.request().verb()), Some("a"));

        let order: Vec<String> = queue.drain().map(|c| c.request().verb().to_string()).collect();
        assert_eq!(order, ["a", "b", "c"]);
        assert!(queue.is_empty());
    }
}
