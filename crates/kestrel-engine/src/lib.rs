//! # kestrel-engine
//!
//! Runtime for long-lived, tool-using agent sessions.
//!
//! - **Session**: history, step loop, interrupt, crash-sealing resume, fork
//! - **Event bus**: cursor-ordered envelopes on progress/control/monitor channels
//! - **Permissions and hooks**: policy modes, approval pauses, pre/post hooks
//! - **Tool runner**: bounded concurrency with timeouts and panic isolation
//! - **Scheduler / time bridge**: step-driven and wall-clock tasks
//! - **Todos, message queue, breakpoints**: per-session bookkeeping
//! - **Pool / room**: bounded multi-session management and group messaging
//!
//! ## Crate Position
//!
//! Depends on: kestrel-core, kestrel-settings, kestrel-store.
//! Depended on by: the `kestrel` binary.

#![deny(unsafe_code)]

pub mod breakpoints;
pub mod bus;
pub mod error;
pub mod hooks;
pub mod limiter;
pub mod message_queue;
pub mod permissions;
pub mod pool;
pub mod registry;
pub mod room;
pub mod sandbox;
pub mod scheduler;
pub mod session;
pub mod time_bridge;
pub mod todo;
pub mod tools;

#[cfg(test)]
mod testing;

pub use bus::{EventBus, EventStream, SubscribeOptions};
pub use error::{EngineError, Result};
pub use permissions::{ModeRegistry, PermissionConfig};
pub use pool::{PoolOptions, SessionPool};
pub use room::Room;
pub use sandbox::{LocalSandbox, LocalSandboxOptions};
pub use session::{
    AskOptions, ResumeOptions, ResumeStrategy, Session, SessionConfig, SessionDeps, SessionInfo, SessionStatus,
};
