//! # Session Management
//!
//! Sessions are logical voice conversations, independent of any transport
//! connection. This module holds the persistent-store seam and the
//! lifecycle manager that ties store records to live connections.
//!
//! ## Key Components:
//! - **Store**: `SessionStore` trait + in-memory reference implementation
//! - **Lifecycle**: `pending → active → ended/errored` state machine and
//!   the connection registry used to detach live connections on termination

pub mod lifecycle;
pub mod store;

pub use lifecycle::{DetachConnection, LifecycleManager};
pub use store::{ConversationTurn, InMemorySessionStore, SessionRecord, SessionState, SessionStore};
