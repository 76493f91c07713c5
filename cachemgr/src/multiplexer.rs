//! Serializes queued commands onto the single request channel.
//!
//! The multiplexer performs no I/O. Each operation returns the request the
//! caller must write next, if any, so the wire never carries more than one
//! unanswered command. Replies carry no id: a reply always belongs to the
//! queue head.

use crate::bridge::protocol::{ProtocolError, Reply, Request};
use crate::queue::{PendingCommand, RequestQueue};

/// Outcome of consuming one reply.
#[derive(Debug, Default, PartialEq)]
pub struct Advance {
    /// Reply to a heartbeat ping, for the heartbeat monitor.
    pub heartbeat: Option<Reply>,
    /// Request to transmit now that the channel is free.
    pub next: Option<Request>,
}

#[derive(Debug, Default)]
pub struct Multiplexer {
    queue: RequestQueue,
    attached: bool,
    in_flight: bool,
}

impl Multiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a command. Returns it for transmission if the channel is idle.
    pub fn submit(&mut self, command: PendingCommand) -> Option<Request> {
        tracing::trace!(
            verb = command.request().verb(),
            queued = self.queue.len(),
            "Command queued"
        );
        self.queue.push_back(command);
        self.transmit_head()
    }

    /// Match a reply to the in-flight command and release the channel.
    pub fn on_reply(&mut self, reply: Reply) -> Result<Advance, ProtocolError> {
        if !self.in_flight {
            return Err(ProtocolError::UnmatchedReply);
        }
        let command = self
            .queue
            .pop_front()
            .ok_or(ProtocolError::UnmatchedReply)?;
        self.in_flight = false;

        tracing::debug!(
            verb = command.request().verb(),
            status = %reply.status,
            "Reply matched"
        );
        let heartbeat = command.complete(reply);
        Ok(Advance {
            heartbeat,
            next: self.transmit_head(),
        })
    }

    /// A fresh channel is available. Returns the queue head to transmit.
    pub fn attach(&mut self) -> Option<Request> {
        self.attached = true;
        self.in_flight = false;
        self.transmit_head()
    }

    /// The channel is gone. Every queued command, the in-flight one
    /// included, completes with a channel-reset reply, oldest first.
    ///
    /// Returns how many caller commands were failed.
    pub fn detach(&mut self) -> usize {
        self.attached = false;
        self.in_flight = false;
        let mut failed = 0;
        for command in self.queue.drain() {
            if command.complete(Reply::channel_reset()).is_none() {
                failed += 1;
            }
        }
        failed
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Commands waiting, the in-flight one included.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    fn transmit_head(&mut self) -> Option<Request> {
        if !self.attached || self.in_flight {
            return None;
        }
        let head = self.queue.front()?.request().clone();
        self.in_flight = true;
        Some(head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<(String, Reply)>>>;

    fn command(log: &Log, verb: &str, args: &[&str]) -> PendingCommand {
        let log = Arc::clone(log);
        let tag = verb.to_string();
        PendingCommand::new(
            Request::new(verb, args.iter().copied()).unwrap(),
            move |reply| log.lock().unwrap().push((tag, reply)),
        )
    }

    #[test]
    fn ping_round_trip_empties_the_queue() {
        let log = Log::default();
        let mut mux = Multiplexer::new();
        assert_eq!(mux.attach(), None);

        let sent = mux.submit(command(&log, "ping", &["1700000000"])).unwrap();
        assert_eq!(sent.to_string(), "ping 1700000000");
        assert!(mux.in_flight());

        let advance = mux.on_reply(Reply::ok("PONG 1700000000")).unwrap();
        assert_eq!(advance, Advance::default());
        assert_eq!(mux.queued(), 0);
        assert!(!mux.in_flight());
        assert_eq!(
            log.lock().unwrap().as_slice(),
            &[("ping".to_string(), Reply::ok("PONG 1700000000"))]
        );
    }

    #[test]
    fn back_to_back_submits_wait_for_the_first_reply() {
        let log = Log::default();
        let mut mux = Multiplexer::new();
        mux.attach();

        let first = mux.submit(command(&log, "a", &[]));
        let second = mux.submit(command(&log, "b", &[]));
        assert_eq!(first.map(|r| r.verb().to_string()), Some("a".into()));
        assert_eq!(second, None);

        let advance = mux.on_reply(Reply::ok("one")).unwrap();
        assert_eq!(advance.next.map(|r| r.verb().to_string()), Some("b".into()));
        let advance = mux.on_reply(Reply::ok("two")).unwrap();
        assert_eq!(advance.next, None);
    }

    #[test]
    fn replies_complete_commands_in_submission_order() {
        let log = Log::default();
        let mut mux = Multiplexer::new();
        mux.attach();

        for i in 0..5 {
            mux.submit(command(&log, &format!("cmd{i}"), &[]));
        }
        for i in 0..5 {
            mux.on_reply(Reply::ok(format!("reply{i}"))).unwrap();
        }

        let log = log.lock().unwrap();
        let pairs: Vec<(&str, &str)> = log
            .iter()
            .map(|(verb, reply)| (verb.as_str(), reply.message.as_str()))
            .collect();
        assert_eq!(
            pairs,
            [
                ("cmd0", "reply0"),
                ("cmd1", "reply1"),
                ("cmd2", "reply2"),
                ("cmd3", "reply3"),
                ("cmd4", "reply4"),
            ]
        );
    }

    #[test]
    fn commands_wait_for_attach() {
        let log = Log::default();
        let mut mux = Multiplexer::new();
        assert_eq!(mux.submit(command(&log, "status", &[])), None);
        assert_eq!(mux.queued(), 1);
        assert!(!mux.in_flight());

        let head = mux.attach().unwrap();
        assert_eq!(head.verb(), "status");
        assert!(mux.in_flight());
    }

    #[test]
    fn unmatched_reply_is_a_protocol_error() {
        let mut mux = Multiplexer::new();
        mux.attach();
        assert!(matches!(
            mux.on_reply(Reply::ok("stray")),
            Err(ProtocolError::UnmatchedReply)
        ));
    }

    #[test]
    fn detach_fails_everything_with_channel_reset() {
        let log = Log::default();
        let mut mux = Multiplexer::new();
        mux.attach();
        mux.submit(command(&log, "a", &[]));
        mux.submit(PendingCommand::heartbeat(Request::ping(5)));
        mux.submit(command(&log, "b", &[]));

        assert_eq!(mux.detach(), 2);
        assert_eq!(mux.queued(), 0);
        assert!(!mux.is_attached());
        assert_eq!(
            log.lock().unwrap().as_slice(),
            &[
                ("a".to_string(), Reply::channel_reset()),
                ("b".to_string(), Reply::channel_reset()),
            ]
        );

        // Nothing is re-sent on the next incarnation.
        assert_eq!(mux.attach(), None);
    }

    #[test]
    fn heartbeat_replies_are_handed_back() {
        let mut mux = Multiplexer::new();
        mux.attach();
        mux.submit(PendingCommand::heartbeat(Request::ping(42)));
        let advance = mux.on_reply(Reply::pong("42")).unwrap();
        assert_eq!(advance.heartbeat, Some(Reply::pong("42")));
    }
}
