//! Tamper-evident audit trail (BLAKE3 hash chain), trimmed from
//! `acton-service`'s audit subsystem down to what this gateway needs: no
//! actor runtime, no syslog/OTLP export, no route globs — just a sequenced,
//! hash-chained event log queryable through `audit.query`.

pub mod chain;
pub mod event;
pub mod logger;

pub use chain::{verify_chain, AuditChain};
pub use event::{AuditEvent, AuditEventKind};
pub use logger::AuditLogger;
