//! cachemgr: supervisor and command channel for a cache server worker.

mod health;
mod heartbeat;
mod multiplexer;
mod queue;
mod supervisor;
mod version;

pub mod bridge;
pub mod config;
pub mod orchestrator;
pub mod worker;

pub use bridge::protocol::{ProtocolError, Reply, Request, Status};
pub use config::{ConfigError, ManagerConfig, RestartBackoff};
pub use health::{DesiredState, ManagerStatus};
pub use heartbeat::Heartbeat;
pub use multiplexer::{Advance, Multiplexer};
pub use orchestrator::{ProgramSpawner, SpawnError, WorkerSpawner};
pub use queue::{PendingCommand, ReplyCallback, RequestQueue};
pub use supervisor::{Supervisor, SupervisorError, SupervisorHandle};
pub use version::CACHEMGR_VERSION;
pub use worker::{BuiltinHandler, CommandHandler, run_worker, run_worker_from_env};
