//! Command channel between the manager and its worker process.
//!
//! # Architecture
//!
//! - **escape**: reversible quoting of individual tokens
//! - **protocol**: Request/Reply line types and status codes
//! - **codec**: newline framing for tokio-util FramedRead/FramedWrite
//! - **transport**: pipe creation, fixed child descriptors, framed channel ends

pub mod codec;
pub mod escape;
pub mod protocol;
pub mod transport;
