//! Liveness probing of the worker over the command channel.
//!
//! The timer is disarmed when a ping fires and re-armed only by its reply,
//! so at most one ping exists at any time. A worker that stops answering
//! simply stops producing acknowledgements; staleness shows up as a growing
//! `last_ack_age`.

use std::time::Duration;

use tokio::time::Instant;

use crate::bridge::protocol::{Reply, Request};

#[derive(Debug)]
pub struct Heartbeat {
    interval: Option<Duration>,
    deadline: Option<Instant>,
    /// Last acknowledgement from the current incarnation.
    last_ack: Option<Instant>,
}

impl Heartbeat {
    /// `None` disables probing.
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            interval,
            deadline: None,
            last_ack: None,
        }
    }

    /// Schedule the first ping of a new incarnation for `now`. Acks from
    /// earlier incarnations are forgotten.
    pub fn arm_now(&mut self, now: Instant) {
        self.last_ack = None;
        self.deadline = self.interval.map(|_| now);
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Timer expired: build the ping and leave the timer disarmed.
    pub fn fire(&mut self) -> Request {
        self.deadline = None;
        Request::ping(chrono::Utc::now().timestamp())
    }

    /// The ping came back; record it and re-arm.
    pub fn on_ack(&mut self, reply: &Reply, now: Instant) {
        if !reply.status.is_ok() {
            tracing::warn!(
                status = %reply.status,
                message = %reply.message,
                "Unexpected heartbeat reply"
            );
        } else {
            tracing::trace!(message = %reply.message, "Heartbeat acknowledged");
        }
        self.last_ack = Some(now);
        self.deadline = self.interval.map(|interval| now + interval);
    }

    pub fn last_ack_age(&self, now: Instant) -> Option<Duration> {
        self.last_ack.map(|at| now.saturating_duration_since(at))
    }
}
