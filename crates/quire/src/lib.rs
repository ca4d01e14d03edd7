//! # Quire - collaborative plain-text editing
//!
//! Quire is the server core of a collaborative editor: many clients edit the
//! same document at once and see each other's edits and cursors live.
//!
//! Concurrent edits are merged with operational transform ([`ot`]). Each open
//! document is owned by one [`session`] task that serializes every edit,
//! keeps a bounded history for late edits and saves the text through a
//! [`storage::DocumentStorage`] backend. The [`manager`] starts sessions on
//! demand and reclaims idle ones, and the optional [`axum`](crate::axum)
//! module exposes documents over WebSockets.

pub mod config;
pub mod error;
pub mod manager;
pub mod ot;
pub mod protocol;
pub mod session;
pub mod storage;

#[cfg(feature = "axum")]
pub mod axum;

// Re-exports for convenience
pub use config::{CollabConfig, Framing, ViolationPolicy};
pub use error::{QuireError, QuireResult, TransformError};
pub use manager::{spawn_manager, SessionManagerHandle};
pub use ot::{Operation, OperationSeq};
pub use protocol::{ClientId, ClientMessage, Selection, ServerMessage};
pub use session::{spawn_session, ClientConnection, SessionHandle, SessionStatus};
pub use storage::{DocumentStorage, MemoryStorage, Permission, Profile, StoredDocument};

#[cfg(feature = "axum")]
pub use axum::{router_with_collab, CollabState, TrustedHeaderAdmission, WebSocketHandler};

#[cfg(feature = "persistence")]
pub use storage::FileStorage;
