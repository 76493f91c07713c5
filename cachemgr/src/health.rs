//! Manager state as reported to operators.

use serde::{Deserialize, Serialize};

/// What the manager wants, independent of whether a worker process exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    #[default]
    Stopped,
    Running,
}

/// Point-in-time snapshot of the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerStatus {
    pub version: String,
    pub desired: DesiredState,
    /// Pid of the current incarnation, if a worker exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incarnation: Option<u64>,
    /// Relaunches after unexpected exits.
    pub restarts: u64,
    /// Commands waiting, the in-flight one included.
    pub queued: usize,
    pub in_flight: bool,
    /// Seconds since the last heartbeat acknowledgement.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_secs: Option<u64>,
    /// How the previous incarnation ended, e.g. `exit status: 1`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_exit: Option<String>,
}

impl ManagerStatus {
    pub fn is_running(&self) -> bool {
        self.pid.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desired_state_default_is_stopped() {
        assert_eq!(DesiredState::default(), DesiredState::Stopped);
    }

    #[test]
    fn desired_state_serializes_lowercase() {
        insta::assert_json_snapshot!(
            [DesiredState::Stopped, DesiredState::Running],
            @r###"
        [
          "stopped",
          "running"
        ]
        "###
        );
    }

    #[test]
    fn status_serializes_running() {
        let status = ManagerStatus {
            version: "0.3.0".to_string(),
            desired: DesiredState::Running,
            pid: Some(4242),
            incarnation: Some(3),
            restarts: 2,
            queued: 1,
            in_flight: true,
            last_heartbeat_secs: Some(1),
            last_exit: Some("signal: 9 (SIGKILL)".to_string()),
        };
        assert!(status.is_running());
        insta::assert_json_snapshot!(status, @r###"
        {
          "version": "0.3.0",
          "desired": "running",
          "pid": 4242,
          "incarnation": 3,
          "restarts": 2,
          "queued": 1,
          "in_flight": true,
          "last_heartbeat_secs": 1,
          "last_exit": "signal: 9 (SIGKILL)"
        }
        "###);
    }

    #[test]
    fn status_serializes_stopped_minimal() {
        let status = ManagerStatus {
            version: "0.3.0".to_string(),
            desired: DesiredState::Stopped,
            pid: None,
            incarnation: None,
            restarts: 0,
            queued: 0,
            in_flight: false,
            last_heartbeat_secs: None,
            last_exit: None,
        };
        assert!(!status.is_running());
        insta::assert_json_snapshot!(status, @r###"
        {
          "version": "0.3.0",
          "desired": "stopped",
          "restarts": 0,
          "queued": 0,
          "in_flight": false
        }
        "###);
    }
}
