use std::collections::HashMap;
use std::fmt::Write;

use chrono::NaiveDate;
use serde::Serialize;

use crate::models::{DailyRisk, GaugeThresholds, ScoredEvent, Severity};
use crate::risk::OTHER_LABEL;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelSummary {
    pub label: String,
    pub count: usize,
    pub strongest: Severity,
}

/// Counts contributing events per label, most frequent first.
pub fn summarize_by_label(events: &[ScoredEvent]) -> Vec<LabelSummary> {
    let mut map: HashMap<String, (usize, Severity)> = HashMap::new();

    for event in events {
        if !event.active || event.severity == Severity::None {
            continue;
        }
        let label = if event.known {
            event.label.clone()
        } else {
            OTHER_LABEL.to_string()
        };
        let entry = map.entry(label).or_insert((0, Severity::None));
        entry.0 += 1;
        entry.1 = entry.1.max(event.severity);
    }

    let mut summaries: Vec<LabelSummary> = map
        .into_iter()
        .map(|(label, (count, strongest))| LabelSummary {
            label,
            count,
            strongest,
        })
        .collect();

    summaries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.label.cmp(&b.label)));
    summaries
}

pub fn build_forecast_report(
    today: NaiveDate,
    cutoff: NaiveDate,
    events: &[ScoredEvent],
    forecast: &[DailyRisk],
    thresholds: &GaugeThresholds,
) -> String {
    let summaries = summarize_by_label(events);
    let mut output = String::new();

    let _ = writeln!(output, "# Migraine Risk Forecast");
    let _ = writeln!(output, "Generated {} (events since {})", today, cutoff);
    let _ = writeln!(output);

    match forecast.first() {
        Some(current) => {
            let _ = writeln!(
                output,
                "Today: **{}** (score {:.1})",
                current.zone, current.score
            );
        }
        None => {
            let _ = writeln!(output, "No forecast days requested.");
        }
    }
    let _ = writeln!(
        output,
        "Zones: LOW from {:.1}, MILD from {:.1}, HIGH from {:.1}",
        thresholds.low, thresholds.mild, thresholds.high
    );

    let _ = writeln!(output);
    let _ = writeln!(output, "## Forecast");
    let _ = writeln!(output, "| Date | Score | Zone | Top contributors |");
    let _ = writeln!(output, "| --- | ---: | --- | --- |");
    for day in forecast {
        let top = if day.contributors.is_empty() {
            "-".to_string()
        } else {
            day.contributors
                .iter()
                .take(3)
                .map(|contributor| format!("{} ({:.1})", contributor.label, contributor.points))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let _ = writeln!(
            output,
            "| {} | {:.1} | {} | {} |",
            day.date, day.score, day.zone, top
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Logged Triggers and Prodromes");
    if summaries.is_empty() {
        let _ = writeln!(output, "Nothing logged in this window.");
    } else {
        for summary in summaries.iter().take(10) {
            let _ = writeln!(
                output,
                "- {}: {} events (strongest {})",
                summary.label, summary.count, summary.strongest
            );
        }
    }

    output
}
