//! Accept/reject review of calibration proposals and the all-or-nothing write
//! of accepted changes.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::RiskError;
use crate::models::{
    find_label, AiConfig, CalibrationProposal, DecayTable, GaugeThresholds, ItemKind, ItemSetting,
    ProposalTarget, ProposalValue, Severity, SettingsPool, Zone,
};

/// A single write against persisted settings. Writes set absolute values, so
/// sending the same change twice leaves the same state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum SettingChange {
    ItemSeverity {
        kind: ItemKind,
        label: String,
        severity: Severity,
    },
    Threshold {
        zone: Zone,
        value: f64,
    },
    DecayCell {
        severity: Severity,
        day: usize,
        value: f64,
    },
    /// Removes a label's setting; restores a label that did not exist before.
    ClearItem {
        kind: ItemKind,
        label: String,
    },
}

impl SettingChange {
    fn from_target(target: &ProposalTarget, value: &ProposalValue) -> Option<SettingChange> {
        match (target, value) {
            (ProposalTarget::Item { kind, label }, ProposalValue::Severity(severity)) => {
                Some(SettingChange::ItemSeverity {
                    kind: *kind,
                    label: label.clone(),
                    severity: *severity,
                })
            }
            (ProposalTarget::Threshold { zone }, ProposalValue::Number(value)) => {
                Some(SettingChange::Threshold {
                    zone: *zone,
                    value: *value,
                })
            }
            (ProposalTarget::DecayCell { severity, day }, ProposalValue::Number(value)) => {
                Some(SettingChange::DecayCell {
                    severity: *severity,
                    day: *day,
                    value: *value,
                })
            }
            _ => None,
        }
    }

    /// The write an accepted proposal performs; notes have none.
    pub fn forward(proposal: &CalibrationProposal) -> Option<SettingChange> {
        Self::from_target(&proposal.target, &proposal.to_value)
    }

    /// The write that restores the value the proposal was computed against.
    /// Stores may have moved on since; rollback reads the live value instead.
    pub fn revert(proposal: &CalibrationProposal) -> Option<SettingChange> {
        Self::from_target(&proposal.target, &proposal.from_value)
    }

    /// True when both changes write the same setting.
    pub fn same_target(&self, other: &SettingChange) -> bool {
        if let (Some((kind, label)), Some((other_kind, other_label))) =
            (self.item_target(), other.item_target())
        {
            return kind == other_kind && label.trim().eq_ignore_ascii_case(other_label.trim());
        }
        match (self, other) {
            (
                SettingChange::Threshold { zone, .. },
                SettingChange::Threshold {
                    zone: other_zone, ..
                },
            ) => zone == other_zone,
            (
                SettingChange::DecayCell { severity, day, .. },
                SettingChange::DecayCell {
                    severity: other_severity,
                    day: other_day,
                    ..
                },
            ) => severity == other_severity && day == other_day,
            _ => false,
        }
    }

    fn item_target(&self) -> Option<(ItemKind, &str)> {
        match self {
            SettingChange::ItemSeverity { kind, label, .. }
            | SettingChange::ClearItem { kind, label } => Some((*kind, label.as_str())),
            _ => None,
        }
    }
}

/// Settings persistence used by the review.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn batch_applied(&self, batch_id: Uuid) -> Result<bool, RiskError>;
    /// The change that puts `change`'s target back to what is stored now.
    async fn read_current(&self, change: &SettingChange) -> Result<SettingChange, RiskError>;
    async fn write_change(&self, change: &SettingChange) -> Result<(), RiskError>;
    async fn mark_batch_applied(&self, batch_id: Uuid) -> Result<(), RiskError>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredSettings {
    pub triggers: SettingsPool,
    pub prodromes: SettingsPool,
    pub thresholds: GaugeThresholds,
    pub decay: DecayTable,
}

impl StoredSettings {
    pub fn from_config(config: &AiConfig) -> Self {
        Self {
            triggers: config.triggers.clone(),
            prodromes: config.prodromes.clone(),
            thresholds: config.thresholds.clone(),
            decay: config.decay.clone(),
        }
    }

    /// The change that restores whatever `change`'s target holds now.
    pub fn current_value(&self, change: &SettingChange) -> SettingChange {
        match change {
            SettingChange::ItemSeverity { kind, label, .. }
            | SettingChange::ClearItem { kind, label } => {
                let pool = match kind {
                    ItemKind::Trigger => &self.triggers,
                    ItemKind::Prodrome => &self.prodromes,
                };
                match find_label(pool, label).and_then(|key| pool.get(key)) {
                    Some(setting) => SettingChange::ItemSeverity {
                        kind: *kind,
                        label: setting.label.clone(),
                        severity: setting.severity,
                    },
                    None => SettingChange::ClearItem {
                        kind: *kind,
                        label: label.clone(),
                    },
                }
            }
            SettingChange::Threshold { zone, .. } => SettingChange::Threshold {
                zone: *zone,
                value: self.thresholds.min_for(*zone),
            },
            SettingChange::DecayCell { severity, day, .. } => SettingChange::DecayCell {
                severity: *severity,
                day: *day,
                value: self.decay.weight(*severity, *day as i64),
            },
        }
    }

    pub fn apply(&mut self, change: &SettingChange) {
        match change {
            SettingChange::ItemSeverity {
                kind,
                label,
                severity,
            } => {
                let pool = match kind {
                    ItemKind::Trigger => &mut self.triggers,
                    ItemKind::Prodrome => &mut self.prodromes,
                };
                match find_label(pool, label).map(str::to_string) {
                    Some(key) => {
                        if let Some(setting) = pool.get_mut(&key) {
                            setting.severity = *severity;
                        }
                    }
                    None => {
                        pool.insert(label.clone(), ItemSetting::new(label.as_str(), *severity));
                    }
                }
            }
            SettingChange::Threshold { zone, value } => self.thresholds.set(*zone, *value),
            SettingChange::DecayCell {
                severity,
                day,
                value,
            } => {
                self.decay.set(*severity, *day, *value);
            }
            SettingChange::ClearItem { kind, label } => {
                let pool = match kind {
                    ItemKind::Trigger => &mut self.triggers,
                    ItemKind::Prodrome => &mut self.prodromes,
                };
                if let Some(key) = find_label(pool, label).map(str::to_string) {
                    pool.remove(&key);
                }
            }
        }
    }
}

/// In-process store, used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    settings: StoredSettings,
    applied_batches: HashSet<Uuid>,
}

impl MemoryStore {
    pub fn new(settings: StoredSettings) -> Self {
        Self {
            inner: Mutex::new(MemoryState {
                settings,
                applied_batches: HashSet::new(),
            }),
        }
    }

    pub fn snapshot(&self) -> StoredSettings {
        self.lock().settings.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn batch_applied(&self, batch_id: Uuid) -> Result<bool, RiskError> {
        Ok(self.lock().applied_batches.contains(&batch_id))
    }

    async fn read_current(&self, change: &SettingChange) -> Result<SettingChange, RiskError> {
        Ok(self.lock().settings.current_value(change))
    }

    async fn write_change(&self, change: &SettingChange) -> Result<(), RiskError> {
        self.lock().settings.apply(change);
        Ok(())
    }

    async fn mark_batch_applied(&self, batch_id: Uuid) -> Result<(), RiskError> {
        self.lock().applied_batches.insert(batch_id);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub batch_id: Uuid,
    /// Proposal ids whose change was written.
    pub written: Vec<String>,
    pub rejected: usize,
    /// The batch had been applied before; nothing was written.
    pub already_applied: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReviewState {
    Loading,
    Ready {
        proposals: Vec<CalibrationProposal>,
        /// Message from the last failed apply, if any.
        error: Option<String>,
    },
    Applying {
        proposals: Vec<CalibrationProposal>,
    },
    Applied(ApplyReport),
    Error(String),
}

impl ReviewState {
    pub fn name(&self) -> &'static str {
        match self {
            ReviewState::Loading => "loading",
            ReviewState::Ready { .. } => "ready",
            ReviewState::Applying { .. } => "applying",
            ReviewState::Applied(_) => "applied",
            ReviewState::Error(_) => "error",
        }
    }
}

/// Review session for one calibration batch.
#[derive(Debug, Clone)]
pub struct RecalibrationReview {
    batch_id: Uuid,
    state: ReviewState,
}

impl RecalibrationReview {
    pub fn new(batch_id: Uuid) -> Self {
        Self {
            batch_id,
            state: ReviewState::Loading,
        }
    }

    pub fn batch_id(&self) -> Uuid {
        self.batch_id
    }

    pub fn state(&self) -> &ReviewState {
        &self.state
    }

    pub fn proposals(&self) -> &[CalibrationProposal] {
        match &self.state {
            ReviewState::Ready { proposals, .. } | ReviewState::Applying { proposals } => proposals,
            _ => &[],
        }
    }

    pub fn load(&mut self, proposals: Vec<CalibrationProposal>) {
        self.state = ReviewState::Ready {
            proposals,
            error: None,
        };
    }

    pub fn load_failed(&mut self, message: impl Into<String>) {
        self.state = ReviewState::Error(message.into());
    }

    /// Flips one proposal. Returns false when the id is unknown or the review is
    /// not ready.
    pub fn toggle_proposal(&mut self, id: &str) -> bool {
        let ReviewState::Ready { proposals, .. } = &mut self.state else {
            return false;
        };
        match proposals.iter_mut().find(|proposal| proposal.id == id) {
            Some(proposal) => {
                proposal.accepted = !proposal.accepted;
                true
            }
            None => false,
        }
    }

    pub fn accept_all(&mut self) {
        self.set_all(true);
    }

    pub fn reject_all(&mut self) {
        self.set_all(false);
    }

    fn set_all(&mut self, accepted: bool) {
        if let ReviewState::Ready { proposals, .. } = &mut self.state {
            for proposal in proposals.iter_mut() {
                proposal.accepted = accepted;
            }
        }
    }

    /// Writes every accepted proposal, or none of them.
    ///
    /// When a write fails the changes already written are reverted, the review
    /// returns to `Ready` with the same selections and the error recorded, and
    /// the caller gets [`RiskError::PartialApply`]. A batch the store already
    /// marks as applied is a no-op.
    pub async fn apply_decisions(
        &mut self,
        store: &dyn SettingsStore,
    ) -> Result<ApplyReport, RiskError> {
        let proposals = match &self.state {
            ReviewState::Ready { proposals, .. } => proposals.clone(),
            ReviewState::Applied(report) => return Ok(report.clone()),
            other => {
                return Err(RiskError::InvalidState {
                    expected: "ready",
                    found: other.name(),
                })
            }
        };
        self.state = ReviewState::Applying {
            proposals: proposals.clone(),
        };

        match store.batch_applied(self.batch_id).await {
            Ok(true) => {
                info!(batch_id = %self.batch_id, "batch already applied");
                let report = ApplyReport {
                    batch_id: self.batch_id,
                    written: Vec::new(),
                    rejected: 0,
                    already_applied: true,
                };
                self.state = ReviewState::Applied(report.clone());
                return Ok(report);
            }
            Ok(false) => {}
            Err(err) => return Err(self.back_to_ready(proposals, 0, 0, err)),
        }

        let accepted: Vec<&CalibrationProposal> =
            proposals.iter().filter(|proposal| proposal.accepted).collect();
        let rejected = proposals.len() - accepted.len();
        let writes: Vec<(&CalibrationProposal, SettingChange)> = accepted
            .iter()
            .filter_map(|proposal| {
                SettingChange::forward(proposal).map(|change| (*proposal, change))
            })
            .collect();
        let total = writes.len();

        // Live value of every target, captured before its first write.
        let mut undo: Vec<SettingChange> = Vec::new();
        let mut written: Vec<&CalibrationProposal> = Vec::new();
        for (proposal, change) in &writes {
            if !undo.iter().any(|prior| prior.same_target(change)) {
                match store.read_current(change).await {
                    Ok(current) => undo.push(current),
                    Err(err) => {
                        rollback(store, &undo).await;
                        let count = written.len();
                        return Err(self.back_to_ready(proposals.clone(), count, total, err));
                    }
                }
            }
            if let Err(err) = store.write_change(change).await {
                rollback(store, &undo).await;
                let count = written.len();
                return Err(self.back_to_ready(proposals.clone(), count, total, err));
            }
            written.push(*proposal);
        }

        if let Err(err) = store.mark_batch_applied(self.batch_id).await {
            rollback(store, &undo).await;
            let count = written.len();
            return Err(self.back_to_ready(proposals.clone(), count, total, err));
        }

        let report = ApplyReport {
            batch_id: self.batch_id,
            written: written.iter().map(|proposal| proposal.id.clone()).collect(),
            rejected,
            already_applied: false,
        };
        info!(
            batch_id = %self.batch_id,
            written = report.written.len(),
            rejected,
            "recalibration applied"
        );
        self.state = ReviewState::Applied(report.clone());
        Ok(report)
    }

    fn back_to_ready(
        &mut self,
        proposals: Vec<CalibrationProposal>,
        written: usize,
        total: usize,
        err: RiskError,
    ) -> RiskError {
        let failure = RiskError::PartialApply {
            written,
            total,
            reason: err.to_string(),
        };
        warn!(batch_id = %self.batch_id, error = %failure, "recalibration apply failed");
        self.state = ReviewState::Ready {
            proposals,
            error: Some(failure.to_string()),
        };
        failure
    }
}

async fn rollback(store: &dyn SettingsStore, undo: &[SettingChange]) {
    for change in undo.iter().rev() {
        if let Err(err) = store.write_change(change).await {
            error!(change = ?change, error = %err, "rollback write failed");
        }
    }
}
