//! Basic-values smoke suite.
//!
//! Exercises the logging and assertion plumbing with no cloud access: one
//! log line per level, then a fixed arithmetic expectation table evaluated
//! through the same [`CheckReport`] machinery the isolation catalog uses.
//! Rows that compare unequal values are marked as such, so the suite
//! itself passes while demonstrating how failures are reported.

use tracing::error;
use tracing::info;
use tracing::warn;

use super::CheckOutcome;
use super::CheckReport;

struct ValueRow {
    name: &'static str,
    left: i64,
    right: i64,
    expect_equal: bool,
}

const VALUE_TABLE: &[ValueRow] = &[
    ValueRow {
        name: "two_times_two_is_four",
        left: 2 * 2,
        right: 4,
        expect_equal: true,
    },
    ValueRow {
        name: "addition_commutes",
        left: 3 + 4,
        right: 4 + 3,
        expect_equal: true,
    },
    ValueRow {
        name: "integer_division_truncates",
        left: 7 / 2,
        right: 3,
        expect_equal: true,
    },
    ValueRow {
        name: "two_plus_two_is_not_five",
        left: 2 + 2,
        right: 5,
        expect_equal: false,
    },
    ValueRow {
        name: "negation_changes_sign",
        left: -42,
        right: 42,
        expect_equal: false,
    },
];

/// Run the smoke suite and return its report.
pub fn run_smoke() -> CheckReport {
    info!("smoke: info-level logging is wired");
    warn!("smoke: warn-level logging is wired");
    error!("smoke: error-level logging is wired (this line is expected)");

    let mut report = CheckReport::new();
    for row in VALUE_TABLE {
        let equal = row.left == row.right;
        let outcome = if equal == row.expect_equal {
            CheckOutcome::Passed
        } else {
            CheckOutcome::Failed {
                got: format!("{} vs {}", row.left, row.right),
            }
        };
        report.record(row.name, outcome);
    }

    report.log_summary("smoke");
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smoke_suite_passes() {
        let report = run_smoke();
        assert!(report.ok(), "smoke must pass:\n{report}");
        assert_eq!(report.passed(), VALUE_TABLE.len());
        assert_eq!(report.skipped(), 0);
    }

    #[test]
    fn table_contains_expected_inequalities() {
        // The deliberately-unequal rows demonstrate failure reporting
        // without failing the suite.
        assert!(VALUE_TABLE.iter().any(|r| !r.expect_equal));
    }
}
