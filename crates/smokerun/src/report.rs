//! End-of-run summaries.

use std::fmt::Write;

use crate::ledger::RetrySummary;
use crate::replication::ReplicationDigestReport;
use crate::sequencer::SuiteResult;

fn missing(out: &mut String, names: &[String], src: &str, dst: &str) {
    if names.is_empty() {
        return;
    }
    let _ = writeln!(
        out,
        "The following collections were present in the {src} but not the {dst}\nat the end of testing:"
    );
    for name in names {
        let _ = writeln!(out, "{name}");
    }
}

fn replication_section(out: &mut String, report: &ReplicationDigestReport) {
    missing(out, &report.lost_in_secondary, "primary", "secondary");
    missing(out, &report.lost_in_primary, "secondary", "primary");

    if !report.mismatched.is_empty() {
        let _ = writeln!(
            out,
            "The following collections have different hashes in primary and secondary\nat the end of testing:"
        );
        for (name, (primary, secondary)) in &report.mismatched {
            let _ = writeln!(out, "{name}\t {primary}/{secondary}");
        }
    }

    if report.is_consistent() {
        let _ = writeln!(
            out,
            "replication ok for {} collections",
            report.replicated_collections()
        );
    }
}

/// Summary of a suite run.
#[must_use]
pub fn render(result: &SuiteResult) -> String {
    let mut out = String::new();
    let ledger = &result.ledger;

    let _ = writeln!(out, "{} tests succeeded", ledger.succeeded.len());
    if !ledger.skipped.is_empty() {
        let _ = writeln!(out, "{} tests skipped", ledger.skipped.len());
    }
    let not_run = result.not_run();
    if not_run > 0 {
        let _ = writeln!(out, "{not_run} tests didn't get run");
    }
    if !ledger.failed.is_empty() {
        let _ = writeln!(out, "The following tests failed (with exit code):");
        for (unit, status) in &ledger.failed {
            let _ = writeln!(out, "{}\t{}", unit.path, status);
        }
    }
    if !ledger.in_flight.is_empty() {
        let _ = writeln!(out, "The following tests were running when the run was aborted:");
        for unit in &ledger.in_flight {
            let _ = writeln!(out, "{}", unit.path);
        }
    }
    if let Some(report) = &result.replication {
        replication_section(&mut out, report);
    }
    if let Some(error) = &result.error {
        let _ = writeln!(out, "run aborted: {error}");
    }
    out
}

/// Summary of a `--only-old-fails` replay.
#[must_use]
pub fn render_retry(summary: &RetrySummary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} tests succeeded", summary.passed.len());
    if !summary.kept.is_empty() {
        let _ = writeln!(out, "{} tests were not replayed", summary.kept.len());
    }
    if !summary.failed.is_empty() {
        let _ = writeln!(out, "The following tests failed:");
        for unit in &summary.failed {
            let _ = writeln!(out, "{}", unit.path);
        }
    }
    out
}

/// Exit code of a replay: 1 when anything failed again.
#[must_use]
pub fn retry_exit_code(summary: &RetrySummary) -> i32 {
    i32::from(!summary.failed.is_empty())
}
