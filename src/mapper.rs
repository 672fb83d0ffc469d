//! Rule-based first pass over the onboarding questionnaire.
//!
//! The ratings produced here are the floor that calibration may raise but
//! never lower.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{
    find_label, Direction, ItemKind, ItemSetting, MappingResult, Severity, SettingsPool,
};

pub mod labels {
    pub const SLEEP_LOW: &str = "Sleep duration low";
    pub const STRESS: &str = "Stress";
    pub const CAFFEINE: &str = "Caffeine";
    pub const CAFFEINE_WITHDRAWAL: &str = "Caffeine withdrawal";
    pub const ALCOHOL: &str = "Alcohol";
    pub const DEHYDRATION: &str = "Dehydration";
    pub const SCREEN_TIME: &str = "Screen time";
    pub const SKIPPED_MEAL: &str = "Skipped meal";
    pub const EXERTION: &str = "Physical exertion";
    pub const PRESSURE_CHANGE: &str = "Pressure change";
    pub const MENSTRUATION: &str = "Menstruation";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Never,
    Rarely,
    Sometimes,
    Often,
    Always,
}

impl Frequency {
    pub fn severity(self) -> Severity {
        match self {
            Frequency::Never => Severity::None,
            Frequency::Rarely => Severity::Low,
            Frequency::Sometimes => Severity::Mild,
            Frequency::Often | Frequency::Always => Severity::High,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaffeinePattern {
    None,
    Light,
    Moderate,
    Heavy,
    /// Intake swings day to day, which points at withdrawal rather than excess.
    Irregular,
}

/// A single questionnaire answer as fed to the direct rule family.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Answer {
    Hours(f64),
    /// 1 (lowest) to 5 (highest).
    Scale(u8),
    Count(f64),
    Frequency(Frequency),
    Flag(bool),
    Caffeine(CaffeinePattern),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuestionnaireAnswers {
    pub sleep_hours: Option<f64>,
    pub stress_level: Option<u8>,
    pub caffeine: Option<CaffeinePattern>,
    pub alcohol_drinks_per_week: Option<f64>,
    pub water_glasses_per_day: Option<f64>,
    pub screen_hours_per_day: Option<f64>,
    pub skips_meals: Option<Frequency>,
    pub exercise_triggers: Option<Frequency>,
    pub weather_sensitive: Option<bool>,
    pub menstrual_related: Option<bool>,
    /// "How often does this precede an attack?" per trigger label.
    pub trigger_frequency: BTreeMap<String, Frequency>,
    pub prodrome_frequency: BTreeMap<String, Frequency>,
    /// Typical values for auto-detectable metrics, keyed by label.
    pub baselines: BTreeMap<String, f64>,
    pub migraine_days_per_month: Option<u32>,
    pub typical_duration_hours: Option<f64>,
    pub diagnosis: Option<String>,
    pub medications: Vec<String>,
    pub notes: Option<String>,
}

/// One entry of an available trigger/prodrome pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDefinition {
    pub label: String,
    #[serde(default)]
    pub automatable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl ItemDefinition {
    pub fn manual(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            automatable: false,
            direction: None,
            default_threshold: None,
            unit: None,
        }
    }

    fn to_setting(&self) -> ItemSetting {
        let mut setting = ItemSetting::new(self.label.trim(), Severity::None);
        setting.is_automatable = self.automatable;
        setting.direction = self.direction;
        setting.default_threshold = self.default_threshold;
        setting.unit = self.unit.clone();
        setting
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvailableItems {
    pub triggers: Vec<ItemDefinition>,
    pub prodromes: Vec<ItemDefinition>,
}

/// Direct lookup rules. Label-specific numeric rules come first; generic answer
/// shapes apply to any label.
pub fn rating_from_direct_answer(label: &str, answer: Answer) -> Severity {
    let key = label.trim().to_ascii_lowercase();
    match (key.as_str(), answer) {
        ("sleep duration low", Answer::Hours(hours)) => match hours {
            h if h < 6.0 => Severity::High,
            h if h < 7.0 => Severity::Mild,
            _ => Severity::None,
        },
        ("screen time", Answer::Hours(hours)) => match hours {
            h if h >= 10.0 => Severity::High,
            h if h >= 8.0 => Severity::Mild,
            h if h >= 6.0 => Severity::Low,
            _ => Severity::None,
        },
        ("alcohol", Answer::Count(drinks)) => match drinks {
            d if d >= 14.0 => Severity::High,
            d if d >= 7.0 => Severity::Mild,
            d if d >= 3.0 => Severity::Low,
            _ => Severity::None,
        },
        ("dehydration", Answer::Count(glasses)) => match glasses {
            g if g < 4.0 => Severity::High,
            g if g < 6.0 => Severity::Mild,
            _ => Severity::None,
        },
        ("caffeine", Answer::Caffeine(pattern)) => match pattern {
            CaffeinePattern::Heavy => Severity::High,
            CaffeinePattern::Moderate => Severity::Mild,
            CaffeinePattern::Light | CaffeinePattern::Irregular => Severity::Low,
            CaffeinePattern::None => Severity::None,
        },
        ("caffeine withdrawal", Answer::Caffeine(pattern)) => match pattern {
            CaffeinePattern::Irregular => Severity::Mild,
            CaffeinePattern::Heavy => Severity::Low,
            _ => Severity::None,
        },
        (_, Answer::Scale(level)) => match level {
            0..=2 => Severity::None,
            3 => Severity::Low,
            4 => Severity::Mild,
            _ => Severity::High,
        },
        (_, Answer::Frequency(frequency)) => frequency.severity(),
        (_, Answer::Flag(true)) => Severity::Mild,
        _ => Severity::None,
    }
}

/// Rates a reported baseline for an auto-detectable metric.
///
/// Anything on the safe side of the threshold is NONE; past it, the relative
/// distance decides: under 10% LOW, under 25% MILD, beyond that HIGH.
pub fn rating_from_numeric_threshold(
    label: &str,
    value: f64,
    direction: Direction,
    threshold: f64,
) -> Severity {
    if !value.is_finite() || !threshold.is_finite() {
        debug!(label, value, threshold, "non-finite baseline ignored");
        return Severity::None;
    }

    let past = match direction {
        Direction::High => value - threshold,
        Direction::Low => threshold - value,
    };
    if past < 0.0 {
        return Severity::None;
    }
    if threshold == 0.0 {
        return Severity::Low;
    }

    match past / threshold.abs() {
        r if r >= 0.25 => Severity::High,
        r if r >= 0.10 => Severity::Mild,
        _ => Severity::Low,
    }
}

/// Builds the Layer-1 floor from questionnaire answers.
///
/// Every available label appears in the result; labels no rule touches stay
/// NONE. When several rules hit one label the strongest rating wins. Rules that
/// name labels absent from the pools are dropped.
pub fn map_questionnaire(
    answers: &QuestionnaireAnswers,
    available: &AvailableItems,
) -> MappingResult {
    let mut triggers = build_pool(&available.triggers);
    let mut prodromes = build_pool(&available.prodromes);

    let mut ratings: Vec<(ItemKind, String, Severity)> = Vec::new();
    let mut direct = |label: &str, answer: Answer| {
        ratings.push((
            ItemKind::Trigger,
            label.to_string(),
            rating_from_direct_answer(label, answer),
        ));
    };

    if let Some(hours) = answers.sleep_hours {
        direct(labels::SLEEP_LOW, Answer::Hours(hours));
    }
    if let Some(level) = answers.stress_level {
        direct(labels::STRESS, Answer::Scale(level));
    }
    if let Some(pattern) = answers.caffeine {
        direct(labels::CAFFEINE, Answer::Caffeine(pattern));
        direct(labels::CAFFEINE_WITHDRAWAL, Answer::Caffeine(pattern));
    }
    if let Some(drinks) = answers.alcohol_drinks_per_week {
        direct(labels::ALCOHOL, Answer::Count(drinks));
    }
    if let Some(glasses) = answers.water_glasses_per_day {
        direct(labels::DEHYDRATION, Answer::Count(glasses));
    }
    if let Some(hours) = answers.screen_hours_per_day {
        direct(labels::SCREEN_TIME, Answer::Hours(hours));
    }
    if let Some(frequency) = answers.skips_meals {
        direct(labels::SKIPPED_MEAL, Answer::Frequency(frequency));
    }
    if let Some(frequency) = answers.exercise_triggers {
        direct(labels::EXERTION, Answer::Frequency(frequency));
    }
    if let Some(flag) = answers.weather_sensitive {
        direct(labels::PRESSURE_CHANGE, Answer::Flag(flag));
    }
    if answers.menstrual_related == Some(true) {
        ratings.push((ItemKind::Trigger, labels::MENSTRUATION.to_string(), Severity::High));
    }

    for (label, frequency) in &answers.trigger_frequency {
        ratings.push((
            ItemKind::Trigger,
            label.clone(),
            rating_from_direct_answer(label, Answer::Frequency(*frequency)),
        ));
    }
    for (label, frequency) in &answers.prodrome_frequency {
        ratings.push((
            ItemKind::Prodrome,
            label.clone(),
            rating_from_direct_answer(label, Answer::Frequency(*frequency)),
        ));
    }

    for (label, value) in &answers.baselines {
        for (kind, pool) in [(ItemKind::Trigger, &triggers), (ItemKind::Prodrome, &prodromes)] {
            let Some(setting) = find_label(pool, label).and_then(|key| pool.get(key)) else {
                continue;
            };
            if let (Some(direction), Some(threshold)) =
                (setting.direction, setting.effective_threshold())
            {
                ratings.push((
                    kind,
                    setting.label.clone(),
                    rating_from_numeric_threshold(label, *value, direction, threshold),
                ));
            }
        }
    }

    for (kind, label, severity) in ratings {
        if severity == Severity::None {
            continue;
        }
        let pool = match kind {
            ItemKind::Trigger => &mut triggers,
            ItemKind::Prodrome => &mut prodromes,
        };
        let Some(key) = find_label(pool, &label).map(str::to_string) else {
            debug!(kind = kind.as_str(), label = %label, "rule names a label outside the pool");
            continue;
        };
        if let Some(setting) = pool.get_mut(&key) {
            setting.severity = setting.severity.max(severity);
        }
    }

    MappingResult {
        triggers,
        prodromes,
        profile_context: profile_context(answers),
    }
}

fn build_pool(definitions: &[ItemDefinition]) -> SettingsPool {
    let mut pool = SettingsPool::new();
    for definition in definitions {
        let label = definition.label.trim();
        if label.is_empty() || find_label(&pool, label).is_some() {
            continue;
        }
        pool.insert(label.to_string(), definition.to_setting());
    }
    pool
}

/// Narrative facts handed to the clinical pass verbatim.
pub fn profile_context(answers: &QuestionnaireAnswers) -> Vec<String> {
    let mut facts = Vec::new();
    if let Some(days) = answers.migraine_days_per_month {
        facts.push(format!("Migraine days per month: {days}"));
    }
    if let Some(hours) = answers.typical_duration_hours {
        facts.push(format!("Typical attack duration: {hours:.1} hours"));
    }
    if let Some(diagnosis) = answers.diagnosis.as_deref().filter(|d| !d.trim().is_empty()) {
        facts.push(format!("Diagnosis: {}", diagnosis.trim()));
    }
    if !answers.medications.is_empty() {
        facts.push(format!("Medications: {}", answers.medications.join(", ")));
    }
    if let Some(hours) = answers.sleep_hours {
        facts.push(format!("Usual sleep: {hours:.1} hours"));
    }
    if let Some(level) = answers.stress_level {
        facts.push(format!("Self-rated stress: {level}/5"));
    }
    if let Some(notes) = answers.notes.as_deref().filter(|n| !n.trim().is_empty()) {
        facts.push(format!("Notes: {}", notes.trim()));
    }
    facts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn available() -> AvailableItems {
        let mut sleep = ItemDefinition::manual(labels::SLEEP_LOW);
        sleep.automatable = true;
        sleep.direction = Some(Direction::Low);
        sleep.default_threshold = Some(7.0);
        sleep.unit = Some("h".to_string());

        let mut hrv = ItemDefinition::manual("HRV low");
        hrv.automatable = true;
        hrv.direction = Some(Direction::Low);
        hrv.default_threshold = Some(40.0);

        AvailableItems {
            triggers: vec![
                sleep,
                hrv,
                ItemDefinition::manual("Stress"),
                ItemDefinition::manual("Caffeine"),
                ItemDefinition::manual("Alcohol"),
                ItemDefinition::manual("Bright light"),
                ItemDefinition::manual("Menstruation"),
            ],
            prodromes: vec![
                ItemDefinition::manual("Yawning"),
                ItemDefinition::manual("Neck stiffness"),
            ],
        }
    }

    #[test]
    fn direct_rules_follow_table() {
        let sleep = |hours| rating_from_direct_answer(labels::SLEEP_LOW, Answer::Hours(hours));
        assert_eq!(sleep(5.5), Severity::High);
        assert_eq!(sleep(6.5), Severity::Mild);
        assert_eq!(sleep(8.0), Severity::None);
        assert_eq!(rating_from_direct_answer("stress", Answer::Scale(5)), Severity::High);
        assert_eq!(rating_from_direct_answer("Stress", Answer::Scale(2)), Severity::None);
        assert_eq!(
            rating_from_direct_answer("Caffeine", Answer::Caffeine(CaffeinePattern::Heavy)),
            Severity::High
        );
        assert_eq!(
            rating_from_direct_answer(
                labels::CAFFEINE_WITHDRAWAL,
                Answer::Caffeine(CaffeinePattern::Irregular)
            ),
            Severity::Mild
        );
        assert_eq!(rating_from_direct_answer("Alcohol", Answer::Count(8.0)), Severity::Mild);
        assert_eq!(
            rating_from_direct_answer("Anything", Answer::Frequency(Frequency::Rarely)),
            Severity::Low
        );
        assert_eq!(rating_from_direct_answer("Anything", Answer::Flag(false)), Severity::None);
        assert_eq!(rating_from_direct_answer("Anything", Answer::Hours(3.0)), Severity::None);
    }

    #[test]
    fn numeric_threshold_respects_direction() {
        assert_eq!(
            rating_from_numeric_threshold("HRV low", 45.0, Direction::Low, 40.0),
            Severity::None
        );
        assert_eq!(
            rating_from_numeric_threshold("HRV low", 40.0, Direction::Low, 40.0),
            Severity::Low
        );
        assert_eq!(
            rating_from_numeric_threshold("HRV low", 35.0, Direction::Low, 40.0),
            Severity::Mild
        );
        assert_eq!(
            rating_from_numeric_threshold("HRV low", 20.0, Direction::Low, 40.0),
            Severity::High
        );
        assert_eq!(
            rating_from_numeric_threshold("Heart rate", 110.0, Direction::High, 100.0),
            Severity::Mild
        );
        assert_eq!(
            rating_from_numeric_threshold("Heart rate", 90.0, Direction::High, 100.0),
            Severity::None
        );
        assert_eq!(
            rating_from_numeric_threshold("Pressure drop", 0.0, Direction::High, 0.0),
            Severity::Low
        );
        assert_eq!(
            rating_from_numeric_threshold("Heart rate", f64::NAN, Direction::High, 100.0),
            Severity::None
        );
    }

    #[test]
    fn mapping_covers_every_available_label() {
        let result = map_questionnaire(&QuestionnaireAnswers::default(), &available());
        assert_eq!(result.triggers.len(), 7);
        assert_eq!(result.prodromes.len(), 2);
        assert!(result
            .triggers
            .values()
            .chain(result.prodromes.values())
            .all(|setting| setting.severity == Severity::None));
        assert!(result.profile_context.is_empty());
    }

    #[test]
    fn mapping_applies_rules_and_keeps_strongest() {
        let mut answers = QuestionnaireAnswers {
            sleep_hours: Some(6.5),
            stress_level: Some(4),
            caffeine: Some(CaffeinePattern::Light),
            alcohol_drinks_per_week: Some(1.0),
            menstrual_related: Some(true),
            migraine_days_per_month: Some(6),
            ..Default::default()
        };
        answers
            .trigger_frequency
            .insert("caffeine".to_string(), Frequency::Often);
        answers
            .prodrome_frequency
            .insert("Yawning".to_string(), Frequency::Sometimes);
        answers.baselines.insert("HRV low".to_string(), 28.0);
        answers.baselines.insert(labels::SLEEP_LOW.to_string(), 5.0);

        let result = map_questionnaire(&answers, &available());
        let severity = |label: &str| result.triggers[label].severity;

        assert_eq!(severity(labels::SLEEP_LOW), Severity::High);
        assert_eq!(severity("Stress"), Severity::Mild);
        assert_eq!(severity("Caffeine"), Severity::High);
        assert_eq!(severity("Alcohol"), Severity::None);
        assert_eq!(severity("Menstruation"), Severity::High);
        assert_eq!(severity("HRV low"), Severity::High);
        assert_eq!(severity("Bright light"), Severity::None);
        assert_eq!(result.prodromes["Yawning"].severity, Severity::Mild);
        assert_eq!(result.prodromes["Neck stiffness"].severity, Severity::None);
        assert!(result.triggers[labels::SLEEP_LOW].is_automatable);
        assert_eq!(result.profile_context[0], "Migraine days per month: 6");
    }

    #[test]
    fn rules_for_missing_labels_are_dropped() {
        let answers = QuestionnaireAnswers {
            screen_hours_per_day: Some(11.0),
            weather_sensitive: Some(true),
            ..Default::default()
        };
        let result = map_questionnaire(&answers, &available());
        assert!(!result.triggers.contains_key(labels::SCREEN_TIME));
        assert!(!result.triggers.contains_key(labels::PRESSURE_CHANGE));
    }

    #[test]
    fn duplicate_pool_labels_collapse() {
        let items = AvailableItems {
            triggers: vec![
                ItemDefinition::manual("Stress"),
                ItemDefinition::manual("stress "),
                ItemDefinition::manual("  "),
            ],
            prodromes: vec![],
        };
        let result = map_questionnaire(&QuestionnaireAnswers::default(), &items);
        assert_eq!(result.triggers.len(), 1);
    }

    #[test]
    fn answers_deserialize_with_defaults() {
        let answers: QuestionnaireAnswers = serde_json::from_str(
            r#"{"sleep_hours": 5.0, "caffeine": "irregular",
                "trigger_frequency": {"Stress": "always"}}"#,
        )
        .unwrap();
        assert_eq!(answers.caffeine, Some(CaffeinePattern::Irregular));
        assert_eq!(answers.trigger_frequency["Stress"], Frequency::Always);
        assert!(answers.medications.is_empty());
    }
}
