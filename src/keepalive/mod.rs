//! Upstream connection keepalive.
//!
//! # Data Flow
//! ```text
//! schedule loop / manual trigger
//!     → engine.rs (tick counting, mode, close guard)
//!     → policy.rs (fresh snapshot every tick)
//!     → transport.rs (heartbeat probe on the pooled connection)
//!     → callback.rs (Success / Timeout to observers)
//!     → timer.rs (next tick: interval or fast-fail interval)
//!
//! Close triggers (first one wins):
//!     failure threshold | idle ceiling (idle.rs) | stop() | transport closed
//!     → force-close transport → stop signal
//! ```
//!
//! # Design Decisions
//! - Policy is process-wide and hot-swappable; engines never cache it
//! - Mode (healthy / failing / fast-failing) is computed, never stored
//! - Timers are injected so schedule tests step time by hand
//! - Keepalive failures never surface as errors; they evict the connection

pub mod callback;
pub mod engine;
pub mod idle;
pub mod policy;
pub mod timer;
pub mod transport;

pub use callback::{CallbackRegistry, KeepaliveCallback, KeepaliveStatus};
pub use engine::{CloseReason, EngineState, KeepAlive, KeepAliveBuilder, KeepAliveConfig, Mode, StopSignal};
pub use policy::{keepalive_policy, refresh_keepalive_policy, KeepalivePolicy, PolicyError, PolicyStore};
pub use timer::{ManualTimer, Timer, TimerHandle, TokioTimer};
pub use transport::{AtomicTransportState, HeartbeatTransport, ProbeOutcome, TransportState};
