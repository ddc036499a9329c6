//! Fixture handoff between independently scheduled setup and run roles.
//!
//! The protocol is a two-state file semaphore with atomic transitions:
//!
//! - `publish` — setup writes the complete record, then renames it into
//!   the run-scoped location (record present = "setup is ready")
//! - `await_and_read` — run polls for the record, bounded by timeout and
//!   cancellation
//! - `release` — run deletes the record (absence = "run is done"),
//!   idempotently
//! - `await_release` — setup polls for absence, same bounds
//!
//! One writer, one reader, never simultaneous; atomic create/rename/delete
//! is the only locking required.

pub mod error;
pub mod record;
pub mod store;

pub use error::HandoffError;
pub use record::AttachmentRef;
pub use record::FixtureRecord;
pub use record::ResourceRef;
pub use record::RuleRef;
pub use store::scrub_stale;
pub use store::FixtureStore;
pub use store::ReleaseGuard;
pub use store::StoreConfig;
