//! Check machinery shared by the isolation catalog, the smoke suite, and
//! the scenario walk.
//!
//! An [`Expectation`] is the per-operation contract an isolation check
//! asserts: the original APIs disagreed about which error a foreign-account
//! call must produce, so the expected kind is data, not code. Outcomes are
//! gathered into a [`CheckReport`]; a run fails if any outcome failed, but
//! reporting never short-circuits the remaining checks.

use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::cloud::ApiErrorKind;

pub mod catalog;
pub mod scenario;
pub mod smoke;

pub use catalog::run_catalog;
pub use catalog::LocalResources;
pub use scenario::run_scenario;
pub use smoke::run_smoke;

/// The contract a single check asserts.
///
/// `ErrorAnyOf` exists because the volume subsystem of the original APIs
/// genuinely varied between hiding foreign resources (`NotFound`) and
/// refusing to act on them (`Forbidden`) across versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Expectation {
    /// The call must succeed (the operation is cross-account readable).
    Succeeds,
    /// The call must fail with exactly this kind.
    Error(ApiErrorKind),
    /// The call must fail with one of these kinds.
    ErrorAnyOf(Vec<ApiErrorKind>),
}

impl Expectation {
    /// Judge an observed call outcome against this contract.
    ///
    /// Exact: a check expecting `Forbidden` fails on `NotFound`, on
    /// success, and on every other kind.
    pub fn judge(&self, observed: Result<(), ApiErrorKind>) -> CheckOutcome {
        match (self, observed) {
            (Expectation::Succeeds, Ok(())) => CheckOutcome::Passed,
            (Expectation::Succeeds, Err(kind)) => CheckOutcome::Failed {
                got: kind.to_string(),
            },
            (Expectation::Error(_), Ok(())) | (Expectation::ErrorAnyOf(_), Ok(())) => CheckOutcome::Failed {
                got: "succeeded".to_string(),
            },
            (Expectation::Error(expected), Err(kind)) => {
                if kind == *expected {
                    CheckOutcome::Passed
                } else {
                    CheckOutcome::Failed {
                        got: kind.to_string(),
                    }
                }
            }
            (Expectation::ErrorAnyOf(expected), Err(kind)) => {
                if expected.contains(&kind) {
                    CheckOutcome::Passed
                } else {
                    CheckOutcome::Failed {
                        got: kind.to_string(),
                    }
                }
            }
        }
    }
}

fn kind_from_name(name: &str) -> Result<ApiErrorKind, String> {
    match name {
        "forbidden" => Ok(ApiErrorKind::Forbidden),
        "not_found" => Ok(ApiErrorKind::NotFound),
        "bad_request" => Ok(ApiErrorKind::BadRequest),
        "conflict" => Ok(ApiErrorKind::Conflict),
        "server_fault" => Ok(ApiErrorKind::ServerFault),
        other => Err(format!("unknown error kind '{other}'")),
    }
}

impl FromStr for Expectation {
    type Err = String;

    /// Parse the configuration spelling: `"succeeds"`, a kind name such as
    /// `"forbidden"`, or kinds joined with `_or_` such as
    /// `"forbidden_or_not_found"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "succeeds" {
            return Ok(Expectation::Succeeds);
        }
        let kinds: Vec<ApiErrorKind> = s
            .split("_or_")
            .map(kind_from_name)
            .collect::<Result<_, _>>()?;
        match kinds.as_slice() {
            [] => Err("empty expectation".to_string()),
            [single] => Ok(Expectation::Error(*single)),
            _ => Ok(Expectation::ErrorAnyOf(kinds)),
        }
    }
}

impl std::fmt::Display for Expectation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expectation::Succeeds => write!(f, "succeeds"),
            Expectation::Error(kind) => write!(f, "{kind}"),
            Expectation::ErrorAnyOf(kinds) => {
                let joined: Vec<String> = kinds.iter().map(|k| k.to_string()).collect();
                write!(f, "{}", joined.join("_or_"))
            }
        }
    }
}

impl TryFrom<String> for Expectation {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

impl From<Expectation> for String {
    fn from(value: Expectation) -> Self {
        value.to_string()
    }
}

/// Outcome of a single check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Passed,
    /// The observed outcome did not match the contract.
    Failed { got: String },
    /// The check's prerequisite feature or fixture field was absent.
    Skipped { reason: String },
}

/// A named check outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub name: String,
    pub outcome: CheckOutcome,
}

/// Collected outcomes of one suite run.
#[derive(Debug, Clone, Default)]
pub struct CheckReport {
    results: Vec<CheckResult>,
}

impl CheckReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one outcome, logging it at a level matching its severity.
    pub fn record(&mut self, name: impl Into<String>, outcome: CheckOutcome) {
        let name = name.into();
        match &outcome {
            CheckOutcome::Passed => debug!(check = %name, "check passed"),
            CheckOutcome::Failed { got } => error!(check = %name, got = %got, "check failed"),
            CheckOutcome::Skipped { reason } => info!(check = %name, reason = %reason, "check skipped"),
        }
        self.results.push(CheckResult { name, outcome });
    }

    pub fn skip(&mut self, name: impl Into<String>, reason: impl Into<String>) {
        self.record(
            name,
            CheckOutcome::Skipped {
                reason: reason.into(),
            },
        );
    }

    pub fn results(&self) -> &[CheckResult] {
        &self.results
    }

    /// The outcome recorded for `name`, if any.
    pub fn outcome_of(&self, name: &str) -> Option<&CheckOutcome> {
        self.results.iter().find(|r| r.name == name).map(|r| &r.outcome)
    }

    pub fn passed(&self) -> usize {
        self.count(|o| matches!(o, CheckOutcome::Passed))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, CheckOutcome::Failed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, CheckOutcome::Skipped { .. }))
    }

    /// True when nothing failed. Skips do not fail a run.
    pub fn ok(&self) -> bool {
        self.failed() == 0
    }

    /// Log a one-line summary at a level matching the overall outcome.
    pub fn log_summary(&self, suite: &str) {
        if self.ok() {
            info!(
                suite = %suite,
                passed = self.passed(),
                skipped = self.skipped(),
                "all checks passed"
            );
        } else {
            error!(
                suite = %suite,
                passed = self.passed(),
                failed = self.failed(),
                skipped = self.skipped(),
                "checks failed"
            );
        }
    }

    fn count(&self, pred: impl Fn(&CheckOutcome) -> bool) -> usize {
        self.results.iter().filter(|r| pred(&r.outcome)).count()
    }
}

impl std::fmt::Display for CheckReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for result in &self.results {
            match &result.outcome {
                CheckOutcome::Passed => writeln!(f, "PASS  {}", result.name)?,
                CheckOutcome::Failed { got } => writeln!(f, "FAIL  {} (got: {got})", result.name)?,
                CheckOutcome::Skipped { reason } => writeln!(f, "SKIP  {} ({reason})", result.name)?,
            }
        }
        write!(
            f,
            "{} passed, {} failed, {} skipped",
            self.passed(),
            self.failed(),
            self.skipped()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn judging_is_exact() {
        let forbidden = Expectation::Error(ApiErrorKind::Forbidden);
        assert_eq!(forbidden.judge(Err(ApiErrorKind::Forbidden)), CheckOutcome::Passed);
        assert!(matches!(
            forbidden.judge(Err(ApiErrorKind::NotFound)),
            CheckOutcome::Failed { .. }
        ));
        assert!(matches!(forbidden.judge(Ok(())), CheckOutcome::Failed { .. }));

        let succeeds = Expectation::Succeeds;
        assert_eq!(succeeds.judge(Ok(())), CheckOutcome::Passed);
        assert!(matches!(
            succeeds.judge(Err(ApiErrorKind::NotFound)),
            CheckOutcome::Failed { .. }
        ));

        let either = Expectation::ErrorAnyOf(vec![ApiErrorKind::Forbidden, ApiErrorKind::NotFound]);
        assert_eq!(either.judge(Err(ApiErrorKind::NotFound)), CheckOutcome::Passed);
        assert_eq!(either.judge(Err(ApiErrorKind::Forbidden)), CheckOutcome::Passed);
        assert!(matches!(
            either.judge(Err(ApiErrorKind::Conflict)),
            CheckOutcome::Failed { .. }
        ));
    }

    #[test]
    fn expectation_spellings_round_trip() {
        for spelling in [
            "succeeds",
            "forbidden",
            "not_found",
            "bad_request",
            "conflict",
            "server_fault",
            "forbidden_or_not_found",
        ] {
            let parsed: Expectation = spelling.parse().unwrap();
            assert_eq!(parsed.to_string(), spelling);
        }
        assert!("sometimes_works".parse::<Expectation>().is_err());
    }

    #[test]
    fn report_counts_and_overall_outcome() {
        let mut report = CheckReport::new();
        report.record("a", CheckOutcome::Passed);
        report.record("b", CheckOutcome::Failed { got: "succeeded".into() });
        report.skip("c", "feature disabled");

        assert_eq!(report.passed(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.skipped(), 1);
        assert!(!report.ok());
        assert!(matches!(report.outcome_of("b"), Some(CheckOutcome::Failed { .. })));

        let mut clean = CheckReport::new();
        clean.record("a", CheckOutcome::Passed);
        clean.skip("b", "feature disabled");
        assert!(clean.ok());
    }
}
