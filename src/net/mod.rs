//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Upstream address
//!     → heartbeat.rs (TCP connect, PING/PONG framing, reply dispatch)
//!     → connection.rs (connection ID, application stream counter)
//!     → Handed to the keepalive engine as its transport
//!
//! Transport States:
//!     Open → Closing → Closed
//! ```
//!
//! # Design Decisions
//! - One reader task per connection; probes wait on oneshot replies
//! - Connection closure is observable without locking (atomic state)

pub mod connection;
pub mod heartbeat;
