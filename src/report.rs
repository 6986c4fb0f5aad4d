use std::fmt::Write;

use chrono::NaiveDate;

use crate::alerts::BatchSummary;
use crate::models::{LocaleKind, OutcomeStatus, PairOutcome, SkipReason};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OutcomeTotals {
    pub modeled: usize,
    pub alerted: usize,
    pub skipped: usize,
}

pub fn summarize_outcomes(outcomes: &[PairOutcome]) -> OutcomeTotals {
    let mut totals = OutcomeTotals::default();
    for outcome in outcomes {
        match &outcome.status {
            OutcomeStatus::Modeled { terminal_alert, .. } => {
                totals.modeled += 1;
                if *terminal_alert {
                    totals.alerted += 1;
                }
            }
            OutcomeStatus::Skipped(_) => totals.skipped += 1,
        }
    }
    totals
}

pub fn build_report(
    locale_kind: LocaleKind,
    cutoff: NaiveDate,
    summary: Option<&BatchSummary>,
    outcomes: &[PairOutcome],
) -> String {
    let totals = summarize_outcomes(outcomes);
    let mut output = String::new();

    let _ = writeln!(output, "# Species Activity Early Warning Report");
    let _ = writeln!(
        output,
        "Locale kind: {} (evaluation year starting {})",
        locale_kind, cutoff
    );
    let _ = writeln!(output);

    if let Some(summary) = summary {
        let _ = writeln!(output, "## Latest Run");
        let _ = writeln!(output, "- run id: {}", summary.run_id);
        let _ = writeln!(output, "- data through: {}", summary.scope.data_end);
        let _ = writeln!(output, "- queued: {}", summary.queued);
        let _ = writeln!(output, "- resumed from earlier runs: {}", summary.resumed);
        let _ = writeln!(output, "- modeled: {}", summary.modeled);
        let _ = writeln!(output, "- alerted: {}", summary.alerted);
        let _ = writeln!(
            output,
            "- skipped (insufficient history): {}",
            summary.skipped_insufficient
        );
        let _ = writeln!(output, "- skipped (fit failure): {}", summary.skipped_fit_failure);
        let _ = writeln!(
            output,
            "- skipped (no evaluation data): {}",
            summary.skipped_no_evaluation
        );
        if !summary.diagnostics.is_empty() {
            let _ = writeln!(output);
            let _ = writeln!(output, "### Skipped This Run");
            for (key, reason) in &summary.diagnostics {
                let _ = writeln!(output, "- {} ({}): {}", key.entity, key.locale, reason);
            }
        }
        let _ = writeln!(output);
    }

    let _ = writeln!(output, "## All Recorded Pairs");
    let _ = writeln!(
        output,
        "{} modeled, {} alerted, {} skipped",
        totals.modeled, totals.alerted, totals.skipped
    );
    let _ = writeln!(output);

    let mut alerted: Vec<&PairOutcome> = outcomes
        .iter()
        .filter(|outcome| {
            matches!(
                outcome.status,
                OutcomeStatus::Modeled {
                    terminal_alert: true,
                    ..
                }
            )
        })
        .collect();
    alerted.sort_by(|a, b| a.key.cmp(&b.key));

    let _ = writeln!(output, "## Alerted Pairs");
    if alerted.is_empty() {
        let _ = writeln!(output, "No pair is above its historical envelope.");
    } else {
        for outcome in alerted {
            if let OutcomeStatus::Modeled {
                alert_days,
                last_date,
                ..
            } = &outcome.status
            {
                let _ = writeln!(
                    output,
                    "- {} ({}): {} alert days, still alerting on {}",
                    outcome.key.entity, outcome.key.locale, alert_days, last_date
                );
            }
        }
    }

    let mut skipped: Vec<(&PairOutcome, &SkipReason)> = outcomes
        .iter()
        .filter_map(|outcome| match &outcome.status {
            OutcomeStatus::Skipped(reason) => Some((outcome, reason)),
            OutcomeStatus::Modeled { .. } => None,
        })
        .collect();
    skipped.sort_by(|a, b| a.0.key.cmp(&b.0.key));

    let _ = writeln!(output);
    let _ = writeln!(output, "## Skipped Pairs");
    if skipped.is_empty() {
        let _ = writeln!(output, "No pairs were skipped.");
    } else {
        for (outcome, reason) in skipped {
            let _ = writeln!(
                output,
                "- {} ({}): {}",
                outcome.key.entity, outcome.key.locale, reason
            );
        }
    }

    output
}
