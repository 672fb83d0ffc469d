use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{find_label, ItemKind, ItemSetting, Severity, SettingsPool};

/// A proposed severity change from the clinical pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adjustment {
    pub kind: ItemKind,
    pub label: String,
    /// What the advisor believed the current rating was. Informational only.
    pub from: Option<Severity>,
    pub to: Severity,
    pub reasoning: String,
}

/// An adjustment that raised (or activated) a label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedAdjustment {
    pub kind: ItemKind,
    pub label: String,
    pub from: Severity,
    pub to: Severity,
    pub reasoning: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    /// The target is at or below the current rating.
    NotAnElevation,
    /// An unknown label proposed at NONE has nothing to activate.
    InactiveNewLabel,
    EmptyLabel,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub merged: SettingsPool,
    pub applied: Vec<AppliedAdjustment>,
    pub discarded: Vec<(Adjustment, DiscardReason)>,
}

/// Elevation-only merge of advisor adjustments onto the floor.
///
/// Adjustments are applied in order, each compared against the rating the label
/// holds at that point, so no sequence can end below the floor. Lowering
/// attempts are dropped and reported in [`MergeOutcome::discarded`].
pub fn apply_adjustments(floor: &SettingsPool, adjustments: &[Adjustment]) -> MergeOutcome {
    let mut merged = floor.clone();
    let mut applied = Vec::new();
    let mut discarded = Vec::new();

    for adjustment in adjustments {
        let label = adjustment.label.trim();
        if label.is_empty() {
            discarded.push((adjustment.clone(), DiscardReason::EmptyLabel));
            continue;
        }

        match find_label(&merged, label).map(str::to_string) {
            Some(key) => {
                let Some(setting) = merged.get_mut(&key) else {
                    continue;
                };
                if adjustment.to.rank() > setting.severity.rank() {
                    applied.push(AppliedAdjustment {
                        kind: adjustment.kind,
                        label: key.clone(),
                        from: setting.severity,
                        to: adjustment.to,
                        reasoning: adjustment.reasoning.clone(),
                    });
                    setting.severity = adjustment.to;
                } else {
                    debug!(
                        label = %key,
                        current = %setting.severity,
                        proposed = %adjustment.to,
                        "discarding non-elevating adjustment"
                    );
                    discarded.push((adjustment.clone(), DiscardReason::NotAnElevation));
                }
            }
            None if adjustment.to != Severity::None => {
                applied.push(AppliedAdjustment {
                    kind: adjustment.kind,
                    label: label.to_string(),
                    from: Severity::None,
                    to: adjustment.to,
                    reasoning: adjustment.reasoning.clone(),
                });
                merged.insert(label.to_string(), ItemSetting::new(label, adjustment.to));
            }
            None => {
                debug!(label, "ignoring NONE adjustment for unknown label");
                discarded.push((adjustment.clone(), DiscardReason::InactiveNewLabel));
            }
        }
    }

    MergeOutcome {
        merged,
        applied,
        discarded,
    }
}

/// Active triggers split by detection mode and severity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerBuckets {
    pub auto_high: Vec<String>,
    pub auto_mild: Vec<String>,
    pub auto_low: Vec<String>,
    pub manual_high: Vec<String>,
    pub manual_mild: Vec<String>,
    pub manual_low: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketCounts {
    pub auto_high: usize,
    pub auto_mild: usize,
    pub auto_low: usize,
    pub manual_high: usize,
    pub manual_mild: usize,
    pub manual_low: usize,
}

impl TriggerBuckets {
    pub fn counts(&self) -> BucketCounts {
        BucketCounts {
            auto_high: self.auto_high.len(),
            auto_mild: self.auto_mild.len(),
            auto_low: self.auto_low.len(),
            manual_high: self.manual_high.len(),
            manual_mild: self.manual_mild.len(),
            manual_low: self.manual_low.len(),
        }
    }

    pub fn total(&self) -> usize {
        let counts = self.counts();
        counts.auto_high
            + counts.auto_mild
            + counts.auto_low
            + counts.manual_high
            + counts.manual_mild
            + counts.manual_low
    }
}

/// Places every non-NONE trigger into exactly one bucket.
///
/// Auto-detection is a case-insensitive membership test against
/// `auto_detectable`; nothing else is consulted.
pub fn classify(merged: &SettingsPool, auto_detectable: &BTreeSet<String>) -> TriggerBuckets {
    let auto: BTreeSet<String> = auto_detectable
        .iter()
        .map(|label| label.trim().to_lowercase())
        .collect();
    let mut buckets = TriggerBuckets::default();

    for setting in merged.values() {
        let is_auto = auto.contains(&setting.label.trim().to_lowercase());
        let bucket = match (is_auto, setting.severity) {
            (_, Severity::None) => continue,
            (true, Severity::High) => &mut buckets.auto_high,
            (true, Severity::Mild) => &mut buckets.auto_mild,
            (true, Severity::Low) => &mut buckets.auto_low,
            (false, Severity::High) => &mut buckets.manual_high,
            (false, Severity::Mild) => &mut buckets.manual_mild,
            (false, Severity::Low) => &mut buckets.manual_low,
        };
        bucket.push(setting.label.clone());
    }

    buckets
}

/// Labels the pool itself marks as automatable.
pub fn auto_detectable_labels(pool: &SettingsPool) -> BTreeSet<String> {
    pool.values()
        .filter(|setting| setting.is_automatable)
        .map(|setting| setting.label.clone())
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub high: usize,
    pub mild: usize,
    pub low: usize,
    pub none: usize,
}

pub fn severity_counts(pool: &SettingsPool) -> SeverityCounts {
    let mut counts = SeverityCounts::default();
    for setting in pool.values() {
        match setting.severity {
            Severity::High => counts.high += 1,
            Severity::Mild => counts.mild += 1,
            Severity::Low => counts.low += 1,
            Severity::None => counts.none += 1,
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(entries: &[(&str, Severity)]) -> SettingsPool {
        entries
            .iter()
            .map(|(label, severity)| (label.to_string(), ItemSetting::new(*label, *severity)))
            .collect()
    }

    fn adjust(label: &str, to: Severity) -> Adjustment {
        Adjustment {
            kind: ItemKind::Trigger,
            label: label.to_string(),
            from: None,
            to,
            reasoning: "reason".to_string(),
        }
    }

    #[test]
    fn every_rank_pair_respects_elevation_only() {
        for existing in Severity::ALL {
            for proposed in Severity::ALL {
                let floor = pool(&[("Caffeine", existing)]);
                let outcome = apply_adjustments(&floor, &[adjust("Caffeine", proposed)]);
                let merged = outcome.merged["Caffeine"].severity;

                if proposed > existing {
                    assert_eq!(merged, proposed, "{existing} -> {proposed} should raise");
                    assert_eq!(outcome.applied.len(), 1);
                    assert_eq!(outcome.applied[0].from, existing);
                    assert!(outcome.discarded.is_empty());
                } else {
                    assert_eq!(merged, existing, "{existing} -> {proposed} should be kept");
                    assert!(outcome.applied.is_empty());
                    assert_eq!(outcome.discarded[0].1, DiscardReason::NotAnElevation);
                }
            }
        }
    }

    #[test]
    fn caffeine_scenario() {
        let floor = pool(&[("Caffeine", Severity::Mild)]);

        let lowered = apply_adjustments(&floor, &[adjust("Caffeine", Severity::Low)]);
        assert_eq!(lowered.merged["Caffeine"].severity, Severity::Mild);

        let raised = apply_adjustments(&floor, &[adjust("Caffeine", Severity::High)]);
        assert_eq!(raised.merged["Caffeine"].severity, Severity::High);
    }

    #[test]
    fn sequences_never_drop_below_floor() {
        let floor = pool(&[
            ("Stress", Severity::High),
            ("Caffeine", Severity::Mild),
            ("Alcohol", Severity::Low),
            ("Light", Severity::None),
        ]);
        let labels = ["Stress", "caffeine", "ALCOHOL", "Light", "Noise"];
        let mut adjustments = Vec::new();
        for (i, label) in labels.iter().enumerate() {
            for step in 0..4u8 {
                let rank = (i as u8 + step * 3) % 4;
                adjustments.push(adjust(label, Severity::from_rank(rank).unwrap()));
            }
        }

        let outcome = apply_adjustments(&floor, &adjustments);
        for (label, setting) in &floor {
            assert!(outcome.merged[label].severity >= setting.severity);
        }
        for window in outcome.applied.windows(2) {
            if window[0].label == window[1].label {
                assert!(window[1].to > window[0].to);
            }
        }
    }

    #[test]
    fn unknown_labels_activate_unless_none() {
        let floor = pool(&[("Stress", Severity::Low)]);
        let outcome = apply_adjustments(
            &floor,
            &[
                adjust("Weather", Severity::Mild),
                adjust("Perfume", Severity::None),
                adjust("  ", Severity::High),
            ],
        );
        assert_eq!(outcome.merged["Weather"].severity, Severity::Mild);
        assert!(!outcome.merged.contains_key("Perfume"));
        assert_eq!(outcome.applied.len(), 1);
        assert_eq!(outcome.applied[0].from, Severity::None);
        let reasons: Vec<DiscardReason> = outcome.discarded.iter().map(|(_, r)| *r).collect();
        assert_eq!(
            reasons,
            vec![DiscardReason::InactiveNewLabel, DiscardReason::EmptyLabel]
        );
    }

    #[test]
    fn matching_is_case_insensitive_and_keeps_stored_label() {
        let floor = pool(&[("Caffeine", Severity::Low)]);
        let outcome = apply_adjustments(&floor, &[adjust("CAFFEINE", Severity::High)]);
        assert_eq!(outcome.merged.len(), 1);
        assert_eq!(outcome.applied[0].label, "Caffeine");
    }

    #[test]
    fn classify_buckets_each_active_trigger_once() {
        let merged = pool(&[
            ("Sleep duration low", Severity::High),
            ("HRV low", Severity::Low),
            ("Stress", Severity::High),
            ("Caffeine", Severity::Mild),
            ("Alcohol", Severity::Low),
            ("Light", Severity::None),
        ]);
        let auto: BTreeSet<String> = ["sleep duration low", "HRV LOW", "Light"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let buckets = classify(&merged, &auto);
        assert_eq!(buckets.auto_high, vec!["Sleep duration low"]);
        assert_eq!(buckets.auto_low, vec!["HRV low"]);
        assert!(buckets.auto_mild.is_empty());
        assert_eq!(buckets.manual_high, vec!["Stress"]);
        assert_eq!(buckets.manual_mild, vec!["Caffeine"]);
        assert_eq!(buckets.manual_low, vec!["Alcohol"]);
        assert_eq!(buckets.total(), 5);

        assert_eq!(classify(&merged, &auto), buckets);
    }

    #[test]
    fn counts_cover_all_severities() {
        let prodromes = pool(&[
            ("Yawning", Severity::High),
            ("Aura", Severity::High),
            ("Neck stiffness", Severity::Low),
            ("Irritability", Severity::None),
        ]);
        let counts = severity_counts(&prodromes);
        assert_eq!(
            counts,
            SeverityCounts {
                high: 2,
                mild: 0,
                low: 1,
                none: 1
            }
        );
    }

    #[test]
    fn auto_detectable_reads_pool_flags() {
        let mut merged = pool(&[
            ("Sleep duration low", Severity::High),
            ("Stress", Severity::Mild),
        ]);
        merged
            .get_mut("Sleep duration low")
            .unwrap()
            .is_automatable = true;
        let auto = auto_detectable_labels(&merged);
        assert_eq!(auto.len(), 1);
        assert!(auto.contains("Sleep duration low"));
    }
}
