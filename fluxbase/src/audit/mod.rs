//! Audit trail
//!
//! Append-only record of auth and admin events. Emission is asynchronous:
//! handlers push onto a bounded channel and a drainer task writes batches
//! to `auth.audit_log`. When the channel stays full past a grace period the
//! oldest entries are dropped and counted.

pub mod entry;
pub mod logger;
pub mod storage;

pub use entry::{ActorType, AuditEntry, AuditOutcome};
pub use logger::{AuditLogger, AuditWriter};
pub use storage::PgAuditStorage;
