use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use tracing::debug;

use crate::models::{
    find_label, Contributor, DailyRisk, DailyScore, DecayTable, Direction, Event, GaugeThresholds,
    ItemKind, MetricReading, ScoredEvent, Severity, SettingsPool, Zone,
};

pub const DEFAULT_LOOKBACK_DAYS: i64 = 6;
pub const DEFAULT_FORECAST_DAYS: usize = 7;
/// Breakdown bucket for labels that are not in any settings pool.
pub const OTHER_LABEL: &str = "Other";

/// Attaches a severity to every event.
///
/// An explicit event severity wins; otherwise the label's setting decides. Labels
/// missing from both pools still count (as LOW) so unrecognised logs never hide risk.
pub fn resolve_events(
    events: &[Event],
    triggers: &SettingsPool,
    prodromes: &SettingsPool,
) -> Vec<ScoredEvent> {
    events
        .iter()
        .map(|event| {
            let pool = match event.kind {
                ItemKind::Trigger => triggers,
                ItemKind::Prodrome => prodromes,
            };
            let setting = find_label(pool, &event.label).and_then(|key| pool.get(key));
            let severity = match (event.severity, setting) {
                (Some(explicit), _) => explicit,
                (None, Some(setting)) => setting.severity,
                (None, None) => Severity::Low,
            };
            ScoredEvent {
                label: setting
                    .map(|setting| setting.label.clone())
                    .unwrap_or_else(|| event.label.clone()),
                occurred_at: event.occurred_at,
                severity,
                active: event.active,
                known: setting.is_some(),
            }
        })
        .collect()
}

/// Sums the still-decaying contributions of every event within the lookback
/// window ending on `day`.
///
/// Events dated after `day` are ignored. Contributors are sorted by points
/// descending, then by the earliest event for that label, then alphabetically.
pub fn compute_daily_score(
    day: NaiveDate,
    events: &[ScoredEvent],
    decay: &DecayTable,
    lookback_days: i64,
) -> DailyScore {
    let mut score = 0.0;
    let mut totals: HashMap<String, (f64, DateTime<Utc>)> = HashMap::new();

    for event in events {
        if !event.active || event.severity == Severity::None {
            continue;
        }

        let age = (day - event.day()).num_days();
        if age < 0 || age > lookback_days {
            continue;
        }

        let points = decay.weight(event.severity, age);
        if points <= 0.0 {
            continue;
        }

        score += points;
        let bucket = if event.known {
            event.label.clone()
        } else {
            OTHER_LABEL.to_string()
        };
        let entry = totals.entry(bucket).or_insert((0.0, event.occurred_at));
        entry.0 += points;
        if event.occurred_at < entry.1 {
            entry.1 = event.occurred_at;
        }
    }

    let mut ranked: Vec<(String, f64, DateTime<Utc>)> = totals
        .into_iter()
        .map(|(label, (points, first_logged))| (label, points, first_logged))
        .collect();
    ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.2.cmp(&b.2))
            .then_with(|| a.0.cmp(&b.0))
    });

    DailyScore {
        score,
        contributors: ranked
            .into_iter()
            .map(|(label, points, _)| Contributor { label, points })
            .collect(),
    }
}

/// Highest zone whose minimum is at or below `score`; NONE otherwise.
pub fn classify_zone(score: f64, thresholds: &GaugeThresholds) -> Zone {
    for zone in [Zone::High, Zone::Mild, Zone::Low] {
        if score >= thresholds.min_for(zone) {
            return zone;
        }
    }
    Zone::None
}

/// Scores `today` and the following `days - 1` days.
///
/// Each day only sees events dated on or before it, so later days show the decay
/// of what has already been logged and nothing else.
pub fn forecast(
    today: NaiveDate,
    events: &[ScoredEvent],
    decay: &DecayTable,
    thresholds: &GaugeThresholds,
    days: usize,
    lookback_days: i64,
) -> Vec<DailyRisk> {
    (0..days)
        .map(|offset| {
            let date = today + Duration::days(offset as i64);
            let daily = compute_daily_score(date, events, decay, lookback_days);
            DailyRisk {
                date,
                score: daily.score,
                zone: classify_zone(daily.score, thresholds),
                contributors: daily.contributors,
            }
        })
        .collect()
}

/// Earliest event day that can still contribute to `today`.
pub fn cutoff_date(today: NaiveDate, lookback_days: i64) -> NaiveDate {
    today - Duration::days(lookback_days.max(0))
}

/// True when `value` crosses `threshold` in `direction` (inclusive).
pub fn crosses(value: f64, direction: Direction, threshold: f64) -> bool {
    match direction {
        Direction::High => value >= threshold,
        Direction::Low => value <= threshold,
    }
}

/// Turns metric readings into events for every automated setting whose
/// effective threshold is crossed.
pub fn detect_threshold_events(
    readings: &[MetricReading],
    settings: &SettingsPool,
    kind: ItemKind,
) -> Vec<Event> {
    let mut detected = Vec::new();

    for reading in readings {
        let Some(setting) = find_label(settings, &reading.label).and_then(|key| settings.get(key))
        else {
            continue;
        };
        if !setting.is_automated || setting.severity == Severity::None {
            continue;
        }
        let (Some(direction), Some(threshold)) = (setting.direction, setting.effective_threshold())
        else {
            debug!(label = %setting.label, "automated setting has no direction or threshold");
            continue;
        };
        if !reading.value.is_finite() || !crosses(reading.value, direction, threshold) {
            continue;
        }

        let mut event = Event::manual(
            setting.label.clone(),
            kind,
            reading.day.and_time(NaiveTime::MIN).and_utc(),
        );
        event.source = reading.source.clone();
        detected.push(event);
    }

    detected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ItemSetting;

    fn day(offset: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 10).unwrap() + Duration::days(offset)
    }

    fn at(offset: i64, hour: u32) -> DateTime<Utc> {
        day(offset).and_hms_opt(hour, 0, 0).unwrap().and_utc()
    }

    fn stress_table() -> DecayTable {
        DecayTable::new(
            [10.0, 5.0, 2.5, 0.0, 0.0, 0.0, 0.0],
            [4.0, 2.0, 1.0, 0.0, 0.0, 0.0, 0.0],
            [2.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        )
    }

    fn flat_table() -> DecayTable {
        DecayTable::new([7.0, 6.0, 5.0, 4.0, 3.0, 2.0, 1.0], [0.0; 7], [0.0; 7])
    }

    #[test]
    fn single_high_trigger_decays_over_days() {
        let events = vec![ScoredEvent::new("Stress", at(0, 9), Severity::High)];
        let thresholds = GaugeThresholds::new(3.0, 5.0, 10.0);
        let days = forecast(day(0), &events, &stress_table(), &thresholds, 4, 6);

        let scores: Vec<f64> = days.iter().map(|d| d.score).collect();
        assert_eq!(scores, vec![10.0, 5.0, 2.5, 0.0]);
        let zones: Vec<Zone> = days.iter().map(|d| d.zone).collect();
        assert_eq!(zones, vec![Zone::High, Zone::Mild, Zone::None, Zone::None]);
        assert_eq!(days[0].contributors[0].label, "Stress");
        assert!(days[3].contributors.is_empty());
    }

    #[test]
    fn zone_boundaries_are_inclusive() {
        let thresholds = GaugeThresholds::new(3.0, 5.0, 10.0);
        assert_eq!(classify_zone(0.0, &thresholds), Zone::None);
        assert_eq!(classify_zone(2.999, &thresholds), Zone::None);
        assert_eq!(classify_zone(3.0, &thresholds), Zone::Low);
        assert_eq!(classify_zone(4.999, &thresholds), Zone::Low);
        assert_eq!(classify_zone(5.0, &thresholds), Zone::Mild);
        assert_eq!(classify_zone(10.0, &thresholds), Zone::High);
        assert_eq!(classify_zone(250.0, &thresholds), Zone::High);
    }

    #[test]
    fn classify_walks_from_highest_zone_even_when_unordered() {
        let thresholds = GaugeThresholds::new(6.0, 4.0, 10.0);
        assert_eq!(classify_zone(5.0, &thresholds), Zone::Mild);
        assert_eq!(classify_zone(3.0, &thresholds), Zone::None);
    }

    #[test]
    fn decay_boundary_at_lookback() {
        let events = vec![ScoredEvent::new("Stress", at(0, 8), Severity::High)];
        let table = flat_table();

        let at_edge = compute_daily_score(day(6), &events, &table, 6);
        assert_eq!(at_edge.score, 1.0);

        let past_edge = compute_daily_score(day(7), &events, &table, 6);
        assert_eq!(past_edge.score, 0.0);

        let shorter = compute_daily_score(day(3), &events, &table, 2);
        assert_eq!(shorter.score, 0.0);
    }

    #[test]
    fn forecast_never_sees_future_events() {
        let events = vec![
            ScoredEvent::new("Stress", at(0, 8), Severity::High),
            ScoredEvent::new("Alcohol", at(4, 20), Severity::High),
        ];
        let table = flat_table();

        let day_three = compute_daily_score(day(3), &events, &table, 6);
        assert_eq!(day_three.score, 4.0);
        assert!(day_three.contributors.iter().all(|c| c.label != "Alcohol"));

        let days = forecast(day(0), &events, &table, &GaugeThresholds::fallback(), 7, 6);
        assert_eq!(days[4].score, 3.0 + 7.0);
    }

    #[test]
    fn inactive_and_none_events_are_skipped() {
        let mut disabled = ScoredEvent::new("Stress", at(0, 8), Severity::High);
        disabled.active = false;
        let events = vec![
            disabled,
            ScoredEvent::new("Noise", at(0, 9), Severity::None),
            ScoredEvent::new("Caffeine", at(0, 10), Severity::Low),
        ];
        let daily = compute_daily_score(day(0), &events, &stress_table(), 6);
        assert_eq!(daily.score, 2.0);
        assert_eq!(daily.contributors.len(), 1);
        assert_eq!(daily.contributors[0].label, "Caffeine");
    }

    #[test]
    fn missing_decay_rows_contribute_nothing() {
        let table = DecayTable {
            high: vec![5.0],
            mild: vec![],
            low: vec![],
        };
        let events = vec![
            ScoredEvent::new("Stress", at(0, 8), Severity::High),
            ScoredEvent::new("Caffeine", at(0, 9), Severity::Mild),
        ];
        let daily = compute_daily_score(day(0), &events, &table, 6);
        assert_eq!(daily.score, 5.0);
        assert_eq!(compute_daily_score(day(1), &events, &table, 6).score, 0.0);
    }

    #[test]
    fn contributors_accumulate_per_label_and_break_ties() {
        let events = vec![
            ScoredEvent::new("Stress", at(0, 12), Severity::Mild),
            ScoredEvent::new("Caffeine", at(0, 7), Severity::Mild),
            ScoredEvent::new("Bright light", at(0, 12), Severity::Mild),
            ScoredEvent::new("Weather", at(-1, 9), Severity::High),
            ScoredEvent::new("Weather", at(0, 9), Severity::Low),
        ];
        let daily = compute_daily_score(day(0), &events, &stress_table(), 6);
        let order: Vec<&str> = daily.contributors.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(order, vec!["Weather", "Caffeine", "Bright light", "Stress"]);
        assert_eq!(daily.contributors[0].points, 7.0);
        assert_eq!(daily.score, 4.0 * 3.0 + 7.0);
    }

    #[test]
    fn unknown_labels_score_under_other() {
        let mut triggers = SettingsPool::new();
        triggers.insert("Stress".to_string(), ItemSetting::new("Stress", Severity::High));
        let events = vec![
            Event::manual("stress", ItemKind::Trigger, at(0, 8)),
            Event::manual("Mystery smell", ItemKind::Trigger, at(0, 9)),
            Event::manual("Odd food", ItemKind::Trigger, at(0, 10)).with_severity(Severity::Mild),
        ];

        let scored = resolve_events(&events, &triggers, &SettingsPool::new());
        assert_eq!(scored[0].label, "Stress");
        assert_eq!(scored[0].severity, Severity::High);
        assert!(scored[0].known);
        assert_eq!(scored[1].severity, Severity::Low);
        assert!(!scored[1].known);
        assert_eq!(scored[2].severity, Severity::Mild);

        let daily = compute_daily_score(day(0), &scored, &stress_table(), 6);
        assert_eq!(daily.score, 10.0 + 2.0 + 4.0);
        assert_eq!(daily.contributors.len(), 2);
        assert_eq!(daily.contributors[1].label, OTHER_LABEL);
        assert_eq!(daily.contributors[1].points, 6.0);
    }

    #[test]
    fn explicit_event_severity_overrides_setting() {
        let mut triggers = SettingsPool::new();
        triggers.insert("Stress".to_string(), ItemSetting::new("Stress", Severity::High));
        let events =
            vec![Event::manual("Stress", ItemKind::Trigger, at(0, 8)).with_severity(Severity::Low)];
        let scored = resolve_events(&events, &triggers, &SettingsPool::new());
        assert_eq!(scored[0].severity, Severity::Low);
    }

    #[test]
    fn daily_score_is_repeatable() {
        let events = vec![
            ScoredEvent::new("Stress", at(-2, 8), Severity::High),
            ScoredEvent::new("Caffeine", at(-1, 8), Severity::Mild),
        ];
        let first = compute_daily_score(day(0), &events, &stress_table(), 6);
        let second = compute_daily_score(day(0), &events, &stress_table(), 6);
        assert_eq!(first, second);
    }

    #[test]
    fn cutoff_date_respects_lookback() {
        assert_eq!(cutoff_date(day(0), 6), day(-6));
        assert_eq!(cutoff_date(day(0), -3), day(0));
    }

    #[test]
    fn detection_respects_direction_and_user_threshold() {
        let mut sleep = ItemSetting::new("Sleep duration low", Severity::High);
        sleep.is_automatable = true;
        sleep.is_automated = true;
        sleep.direction = Some(Direction::Low);
        sleep.default_threshold = Some(7.0);
        sleep.user_threshold = Some(6.0);

        let mut heat = ItemSetting::new("High temperature", Severity::Mild);
        heat.is_automatable = true;
        heat.direction = Some(Direction::High);
        heat.default_threshold = Some(30.0);

        let mut settings = SettingsPool::new();
        settings.insert(sleep.label.clone(), sleep);
        settings.insert(heat.label.clone(), heat);

        let readings = vec![
            MetricReading {
                label: "sleep duration low".to_string(),
                day: day(0),
                value: 6.0,
                source: "whoop".to_string(),
            },
            MetricReading {
                label: "Sleep duration low".to_string(),
                day: day(1),
                value: 6.5,
                source: "whoop".to_string(),
            },
            MetricReading {
                label: "High temperature".to_string(),
                day: day(0),
                value: 35.0,
                source: "weather".to_string(),
            },
        ];

        let events = detect_threshold_events(&readings, &settings, ItemKind::Trigger);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].label, "Sleep duration low");
        assert_eq!(events[0].source, "whoop");
        assert_eq!(events[0].day(), day(0));
        assert_eq!(events[0].severity, None);
    }
}
