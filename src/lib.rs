//! Multi-tenant isolation checks coordinated through a fixture handoff
//! store.
//!
//! Two independently scheduled roles verify that one cloud account cannot
//! read, modify, or delete another account's resources:
//!
//! - the setup role ([`roles::Producer`]) provisions servers, images,
//!   keypairs, security groups, volumes, snapshots, and an attachment
//!   under account A, publishes their identifiers as a [`handoff::FixtureRecord`],
//!   and blocks (bounded) until release
//! - the run role ([`roles::Consumer`]) awaits the record, issues one API
//!   call per isolation check under account B, asserts the per-operation
//!   contract exactly, and releases the store
//!
//! Coordination is a two-state file semaphore ([`handoff::FixtureStore`]):
//! record present means "setup is ready", record absent after readiness
//! means "run is done". Publication is atomic and every wait is a bounded,
//! cancellable poll.
//!
//! The cloud API surface is an async trait family ([`cloud`]) with a
//! deterministic in-memory implementation, so the whole protocol runs
//! hermetically in tests and in the `pair` subcommand.

pub mod checks;
pub mod cloud;
pub mod config;
pub mod handoff;
pub mod roles;

pub use checks::CheckReport;
pub use checks::Expectation;
pub use cloud::DeterministicCloud;
pub use config::Config;
pub use handoff::FixtureRecord;
pub use handoff::FixtureStore;
pub use roles::run_pair;
pub use roles::Consumer;
pub use roles::Producer;
