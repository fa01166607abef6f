//! Session state management: the durable `Session` row, its sidecar
//! documents, and the Session Store abstraction over them.

pub mod config;
pub mod model;
pub mod persistence;
pub mod store;

pub use config::{StartOptions, WorkerConfig};
pub use model::{
    ContextEvent, ContextEventKind, IterationRecord, IterationStatus, ResetState, Session,
    SessionId, SessionMetadata, SessionStatus, SessionType,
};
pub use store::{SessionPatch, SessionStats, SessionStore, SessionsWithChecksum, SqliteSessionStore};

#[cfg(test)]
pub use store::InMemorySessionStore;
