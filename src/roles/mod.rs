//! The two independently scheduled roles of the handoff protocol.
//!
//! The setup role ([`Producer`]) provisions the fixture set under account
//! A, publishes the record, and blocks (bounded) until release before
//! tearing everything down. The run role ([`Consumer`]) awaits the record,
//! runs the isolation catalog under account B, and releases the store no
//! matter how the checks went.
//!
//! [`run_pair`] drives both roles concurrently in one process, coordinating
//! only through the real on-disk store, which preserves the protocol's
//! observable behavior while keeping tests hermetic.

use snafu::Snafu;
use tokio_util::sync::CancellationToken;

use crate::checks::CheckReport;
use crate::cloud::waiters::WaitError;
use crate::cloud::ApiError;
use crate::handoff::FixtureRecord;
use crate::handoff::HandoffError;

pub mod consumer;
pub mod producer;

pub use consumer::Consumer;
pub use producer::Producer;
pub use producer::ProducerOutcome;

/// Errors that abort a role's run.
///
/// Cleanup failures are deliberately absent: teardown is best-effort,
/// logged per resource, and never escalated.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RoleError {
    /// A resource-creation call failed during provisioning.
    #[snafu(display("provisioning {resource} failed: {source}"))]
    Provisioning {
        /// The resource being created.
        resource: String,
        /// The underlying error.
        source: ApiError,
    },

    /// A status wait failed during provisioning.
    #[snafu(display("provisioning wait failed: {source}"))]
    ProvisionWait {
        /// The underlying error.
        source: WaitError,
    },

    /// The fixture store failed or timed out.
    #[snafu(display("handoff failed: {source}"))]
    Handoff {
        /// The underlying error.
        source: HandoffError,
    },
}

impl RoleError {
    /// True when the role gave up waiting on the store.
    pub fn is_handoff_timeout(&self) -> bool {
        matches!(self, RoleError::Handoff { source } if source.is_timeout())
    }
}

/// Result of one producer/consumer pairing.
#[derive(Debug)]
pub struct PairOutcome {
    /// What the setup role published and how it finished.
    pub producer: ProducerOutcome,
    /// The run role's check outcomes.
    pub report: CheckReport,
}

impl PairOutcome {
    /// The record the pairing coordinated through.
    pub fn record(&self) -> &FixtureRecord {
        &self.producer.record
    }
}

/// Run both roles to completion concurrently.
///
/// The futures share one task, so cancellation and panics propagate
/// without detached work. Both roles see the same cancellation token.
pub async fn run_pair(
    producer: Producer,
    consumer: Consumer,
    cancel: &CancellationToken,
) -> Result<PairOutcome, RoleError> {
    let (produced, report) = futures::future::join(producer.run(cancel), consumer.run(cancel)).await;
    Ok(PairOutcome {
        producer: produced?,
        report: report?,
    })
}
