use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RiskError;

/// Number of days a single event keeps contributing, including the day it was logged.
pub const DECAY_DAYS: usize = 7;

/// Ordinal rating of how strongly a trigger or prodrome drives migraine risk.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[default]
    #[serde(alias = "none")]
    None,
    #[serde(alias = "low")]
    Low,
    #[serde(alias = "mild", alias = "medium", alias = "MEDIUM")]
    Mild,
    #[serde(alias = "high")]
    High,
}

impl Severity {
    pub const ALL: [Severity; 4] = [Severity::None, Severity::Low, Severity::Mild, Severity::High];
    /// Severities that carry a decay row, strongest first.
    pub const CONTRIBUTING: [Severity; 3] = [Severity::High, Severity::Mild, Severity::Low];

    pub fn rank(self) -> u8 {
        self as u8
    }

    pub fn from_rank(rank: u8) -> Option<Severity> {
        Severity::ALL.get(rank as usize).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::None => "NONE",
            Severity::Low => "LOW",
            Severity::Mild => "MILD",
            Severity::High => "HIGH",
        }
    }

    /// Case-insensitive parse that also accepts the "medium"/"moderate" spellings
    /// advisory responses tend to use.
    pub fn parse_lenient(value: &str) -> Option<Severity> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" | "off" | "" => Some(Severity::None),
            "low" => Some(Severity::Low),
            "mild" | "medium" | "moderate" => Some(Severity::Mild),
            "high" | "severe" => Some(Severity::High),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = RiskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Severity::parse_lenient(s).ok_or_else(|| RiskError::UnknownSeverity(s.to_string()))
    }
}

/// Gauge bucket a cumulative score falls into.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Zone {
    #[default]
    None,
    Low,
    Mild,
    High,
}

impl Zone {
    pub const ALL: [Zone; 4] = [Zone::None, Zone::Low, Zone::Mild, Zone::High];

    pub fn as_str(self) -> &'static str {
        match self {
            Zone::None => "NONE",
            Zone::Low => "LOW",
            Zone::Mild => "MILD",
            Zone::High => "HIGH",
        }
    }

    pub fn parse_lenient(value: &str) -> Option<Zone> {
        Severity::parse_lenient(value).map(Zone::from)
    }
}

impl From<Severity> for Zone {
    fn from(value: Severity) -> Self {
        match value {
            Severity::None => Zone::None,
            Severity::Low => Zone::Low,
            Severity::Mild => Zone::Mild,
            Severity::High => Zone::High,
        }
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Trigger,
    Prodrome,
}

impl ItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemKind::Trigger => "trigger",
            ItemKind::Prodrome => "prodrome",
        }
    }
}

impl FromStr for ItemKind {
    type Err = RiskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trigger" => Ok(ItemKind::Trigger),
            "prodrome" => Ok(ItemKind::Prodrome),
            other => Err(RiskError::InvalidInput(format!("unknown item kind '{other}'"))),
        }
    }
}

/// Which way a metric has to move to count as a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    High,
    Low,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::High => "high",
            Direction::Low => "low",
        }
    }

    pub fn parse_lenient(value: &str) -> Option<Direction> {
        match value.trim().to_ascii_lowercase().as_str() {
            "high" | "above" => Some(Direction::High),
            "low" | "below" => Some(Direction::Low),
            _ => None,
        }
    }
}

/// Per-user settings for one trigger or prodrome label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSetting {
    pub label: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub favorite: bool,
    #[serde(default)]
    pub is_automatable: bool,
    #[serde(default)]
    pub is_automated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl ItemSetting {
    pub fn new(label: impl Into<String>, severity: Severity) -> Self {
        Self {
            label: label.into(),
            severity,
            favorite: false,
            is_automatable: false,
            is_automated: false,
            direction: None,
            default_threshold: None,
            user_threshold: None,
            unit: None,
        }
    }

    /// The user's own threshold wins over the pool default.
    pub fn effective_threshold(&self) -> Option<f64> {
        self.user_threshold.or(self.default_threshold)
    }
}

pub type TriggerSetting = ItemSetting;
pub type ProdromeSetting = ItemSetting;

/// Settings keyed by label.
pub type SettingsPool = BTreeMap<String, ItemSetting>;

/// Case-insensitive lookup of a label in a pool, returning the stored key.
pub fn find_label<'a>(pool: &'a SettingsPool, label: &str) -> Option<&'a str> {
    let needle = label.trim();
    if let Some((key, _)) = pool.get_key_value(needle) {
        return Some(key.as_str());
    }
    pool.keys()
        .find(|key| key.eq_ignore_ascii_case(needle))
        .map(String::as_str)
}

/// A logged or detected trigger/prodrome occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub label: String,
    pub kind: ItemKind,
    pub occurred_at: DateTime<Utc>,
    /// Explicit severity; when absent it is taken from the label's setting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_migraine_id: Option<Uuid>,
    pub source: String,
    pub active: bool,
}

impl Event {
    pub fn manual(label: impl Into<String>, kind: ItemKind, occurred_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: label.into(),
            kind,
            occurred_at,
            severity: None,
            linked_migraine_id: None,
            source: "manual".to_string(),
            active: true,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn day(&self) -> NaiveDate {
        self.occurred_at.date_naive()
    }
}

/// An event whose severity has been resolved against the settings pools.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredEvent {
    pub label: String,
    pub occurred_at: DateTime<Utc>,
    pub severity: Severity,
    pub active: bool,
    /// False when the label is missing from every settings pool.
    pub known: bool,
}

impl ScoredEvent {
    pub fn new(label: impl Into<String>, occurred_at: DateTime<Utc>, severity: Severity) -> Self {
        Self {
            label: label.into(),
            occurred_at,
            severity,
            active: true,
            known: true,
        }
    }

    pub fn day(&self) -> NaiveDate {
        self.occurred_at.date_naive()
    }
}

/// One day's reading of an automatable metric (sleep hours, HRV, pressure drop, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricReading {
    pub label: String,
    pub day: NaiveDate,
    pub value: f64,
    pub source: String,
}

/// Points contributed by one event of each severity, by age in days.
///
/// Rows shorter than [`DECAY_DAYS`] and missing rows contribute zero for the
/// absent cells.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecayTable {
    #[serde(default, alias = "HIGH")]
    pub high: Vec<f64>,
    #[serde(default, alias = "MILD")]
    pub mild: Vec<f64>,
    #[serde(default, alias = "LOW")]
    pub low: Vec<f64>,
}

impl DecayTable {
    pub fn new(high: [f64; DECAY_DAYS], mild: [f64; DECAY_DAYS], low: [f64; DECAY_DAYS]) -> Self {
        Self {
            high: high.to_vec(),
            mild: mild.to_vec(),
            low: low.to_vec(),
        }
    }

    /// Built-in curve used whenever calibration is unavailable.
    pub fn fallback() -> Self {
        Self::new(
            [10.0, 5.0, 2.5, 1.0, 0.0, 0.0, 0.0],
            [6.0, 3.0, 1.5, 0.5, 0.0, 0.0, 0.0],
            [3.0, 1.5, 0.5, 0.0, 0.0, 0.0, 0.0],
        )
    }

    pub fn row(&self, severity: Severity) -> &[f64] {
        match severity {
            Severity::High => &self.high,
            Severity::Mild => &self.mild,
            Severity::Low => &self.low,
            Severity::None => &[],
        }
    }

    fn row_mut(&mut self, severity: Severity) -> Option<&mut Vec<f64>> {
        match severity {
            Severity::High => Some(&mut self.high),
            Severity::Mild => Some(&mut self.mild),
            Severity::Low => Some(&mut self.low),
            Severity::None => None,
        }
    }

    /// Contribution of an event of `severity` that is `age_days` old.
    pub fn weight(&self, severity: Severity, age_days: i64) -> f64 {
        if age_days < 0 {
            return 0.0;
        }
        self.row(severity)
            .get(age_days as usize)
            .copied()
            .filter(|value| value.is_finite())
            .unwrap_or(0.0)
    }

    /// Sets one cell, growing the row with zeros when needed. NONE has no row.
    pub fn set(&mut self, severity: Severity, day: usize, value: f64) -> bool {
        if day >= DECAY_DAYS {
            return false;
        }
        let Some(row) = self.row_mut(severity) else {
            return false;
        };
        if row.len() <= day {
            row.resize(day + 1, 0.0);
        }
        row[day] = value;
        true
    }

    /// Pads or truncates every row to [`DECAY_DAYS`] and clamps cells to finite,
    /// non-negative values.
    pub fn normalized(&self) -> Self {
        let fix = |row: &[f64]| -> Vec<f64> {
            (0..DECAY_DAYS)
                .map(|day| {
                    row.get(day)
                        .copied()
                        .filter(|value| value.is_finite())
                        .unwrap_or(0.0)
                        .max(0.0)
                })
                .collect()
        };
        Self {
            high: fix(&self.high),
            mild: fix(&self.mild),
            low: fix(&self.low),
        }
    }

    /// Rows that grow with age instead of decaying. Reported, never corrected.
    pub fn monotonicity_issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        for severity in Severity::CONTRIBUTING {
            let row = self.row(severity);
            for day in 1..row.len() {
                if row[day] > row[day - 1] {
                    issues.push(format!(
                        "{severity} decay rises from {} on day {} to {} on day {day}",
                        row[day - 1],
                        day - 1,
                        row[day]
                    ));
                }
            }
        }
        issues
    }
}

/// Minimum cumulative score for each gauge zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaugeThresholds {
    #[serde(default, alias = "NONE")]
    pub none: f64,
    #[serde(alias = "LOW")]
    pub low: f64,
    #[serde(alias = "MILD")]
    pub mild: f64,
    #[serde(alias = "HIGH")]
    pub high: f64,
}

impl GaugeThresholds {
    pub fn new(low: f64, mild: f64, high: f64) -> Self {
        Self {
            none: 0.0,
            low,
            mild,
            high,
        }
    }

    pub fn fallback() -> Self {
        Self::new(3.0, 8.0, 15.0)
    }

    pub fn min_for(&self, zone: Zone) -> f64 {
        match zone {
            Zone::None => self.none,
            Zone::Low => self.low,
            Zone::Mild => self.mild,
            Zone::High => self.high,
        }
    }

    pub fn set(&mut self, zone: Zone, value: f64) {
        match zone {
            Zone::None => self.none = value,
            Zone::Low => self.low = value,
            Zone::Mild => self.mild = value,
            Zone::High => self.high = value,
        }
    }

    /// Pairs of adjacent zones whose minimums are not strictly increasing.
    pub fn ordering_issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        for pair in Zone::ALL.windows(2) {
            let (lower, upper) = (pair[0], pair[1]);
            if self.min_for(upper) <= self.min_for(lower) {
                issues.push(format!(
                    "{upper} threshold {} is not above {lower} threshold {}",
                    self.min_for(upper),
                    self.min_for(lower)
                ));
            }
        }
        issues
    }
}

impl Default for GaugeThresholds {
    fn default() -> Self {
        Self::fallback()
    }
}

/// Points a single label contributed to a day's score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contributor {
    pub label: String,
    pub points: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyScore {
    pub score: f64,
    pub contributors: Vec<Contributor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyRisk {
    pub date: NaiveDate,
    pub score: f64,
    pub zone: Zone,
    pub contributors: Vec<Contributor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalKind {
    Trigger,
    Prodrome,
    GaugeThreshold,
    GaugeDecay,
    ClinicalAssessment,
    DataWarning,
    CalibrationNotes,
}

/// What an accepted proposal writes back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum ProposalTarget {
    Item { kind: ItemKind, label: String },
    Threshold { zone: Zone },
    DecayCell { severity: Severity, day: usize },
    /// Informational; nothing is written.
    Note,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalValue {
    Severity(Severity),
    Number(f64),
    Text(String),
    Empty,
}

impl fmt::Display for ProposalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProposalValue::Severity(severity) => write!(f, "{severity}"),
            ProposalValue::Number(value) => write!(f, "{value:.2}"),
            ProposalValue::Text(text) => f.write_str(text),
            ProposalValue::Empty => f.write_str("-"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationProposal {
    pub id: String,
    pub kind: ProposalKind,
    pub label: String,
    pub target: ProposalTarget,
    pub from_value: ProposalValue,
    pub to_value: ProposalValue,
    pub reasoning: String,
    #[serde(default = "default_accepted")]
    pub accepted: bool,
}

fn default_accepted() -> bool {
    true
}

/// Deterministic floor produced from the onboarding questionnaire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MappingResult {
    pub triggers: SettingsPool,
    pub prodromes: SettingsPool,
    pub profile_context: Vec<String>,
}

/// Final calibrated configuration plus the changes awaiting review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiConfig {
    pub triggers: SettingsPool,
    pub prodromes: SettingsPool,
    pub thresholds: GaugeThresholds,
    pub decay: DecayTable,
    pub clinical_assessment: String,
    pub calibration_notes: String,
    pub summary: String,
    pub data_warnings: Vec<String>,
    pub proposals: Vec<CalibrationProposal>,
    pub used_fallback: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_order_is_total() {
        assert!(Severity::None < Severity::Low);
        assert!(Severity::Low < Severity::Mild);
        assert!(Severity::Mild < Severity::High);
        for severity in Severity::ALL {
            assert_eq!(Severity::from_rank(severity.rank()), Some(severity));
        }
        assert_eq!(Severity::from_rank(4), None);
    }

    #[test]
    fn severity_parses_leniently() {
        assert_eq!("high".parse::<Severity>().unwrap(), Severity::High);
        assert_eq!(" Moderate ".parse::<Severity>().unwrap(), Severity::Mild);
        assert_eq!(Severity::parse_lenient("LOW"), Some(Severity::Low));
        assert!("extreme".parse::<Severity>().is_err());
    }

    #[test]
    fn severity_serde_accepts_lowercase() {
        let parsed: Severity = serde_json::from_str("\"mild\"").unwrap();
        assert_eq!(parsed, Severity::Mild);
        assert_eq!(serde_json::to_string(&Severity::High).unwrap(), "\"HIGH\"");
    }

    #[test]
    fn effective_threshold_prefers_user_value() {
        let mut setting = ItemSetting::new("Sleep duration low", Severity::Mild);
        setting.default_threshold = Some(7.0);
        assert_eq!(setting.effective_threshold(), Some(7.0));
        setting.user_threshold = Some(6.0);
        assert_eq!(setting.effective_threshold(), Some(6.0));
    }

    #[test]
    fn find_label_is_case_insensitive() {
        let mut pool = SettingsPool::new();
        pool.insert("Caffeine".to_string(), ItemSetting::new("Caffeine", Severity::Low));
        assert_eq!(find_label(&pool, "caffeine"), Some("Caffeine"));
        assert_eq!(find_label(&pool, " CAFFEINE "), Some("Caffeine"));
        assert_eq!(find_label(&pool, "Alcohol"), None);
    }

    #[test]
    fn decay_weight_defaults_to_zero() {
        let table = DecayTable {
            high: vec![10.0, 5.0],
            mild: vec![],
            low: vec![1.0, f64::NAN],
        };
        assert_eq!(table.weight(Severity::High, 0), 10.0);
        assert_eq!(table.weight(Severity::High, 2), 0.0);
        assert_eq!(table.weight(Severity::Mild, 0), 0.0);
        assert_eq!(table.weight(Severity::Low, 1), 0.0);
        assert_eq!(table.weight(Severity::None, 0), 0.0);
        assert_eq!(table.weight(Severity::High, -1), 0.0);
    }

    #[test]
    fn decay_set_grows_rows_and_rejects_none() {
        let mut table = DecayTable::default();
        assert!(table.set(Severity::Mild, 3, 1.5));
        assert_eq!(table.mild, vec![0.0, 0.0, 0.0, 1.5]);
        assert!(!table.set(Severity::None, 0, 1.0));
        assert!(!table.set(Severity::High, DECAY_DAYS, 1.0));
    }

    #[test]
    fn normalized_pads_and_clamps() {
        let table = DecayTable {
            high: vec![4.0, -1.0],
            mild: vec![1.0; 9],
            low: vec![],
        };
        let fixed = table.normalized();
        assert_eq!(fixed.high, vec![4.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(fixed.mild.len(), DECAY_DAYS);
        assert_eq!(fixed.low, vec![0.0; DECAY_DAYS]);
    }

    #[test]
    fn fallback_decay_is_non_increasing() {
        assert!(DecayTable::fallback().monotonicity_issues().is_empty());
        let rising = DecayTable::new([1.0, 2.0, 0.0, 0.0, 0.0, 0.0, 0.0], [0.0; 7], [0.0; 7]);
        assert_eq!(rising.monotonicity_issues().len(), 1);
    }

    #[test]
    fn threshold_ordering_issues_are_reported() {
        assert!(GaugeThresholds::fallback().ordering_issues().is_empty());
        let swapped = GaugeThresholds::new(6.0, 4.0, 10.0);
        let issues = swapped.ordering_issues();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].starts_with("MILD"));
    }

    #[test]
    fn thresholds_deserialize_uppercase_keys() {
        let parsed: GaugeThresholds =
            serde_json::from_str(r#"{"LOW": 3, "MILD": 5, "HIGH": 10}"#).unwrap();
        assert_eq!(parsed, GaugeThresholds::new(3.0, 5.0, 10.0));
    }
}
