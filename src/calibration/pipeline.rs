use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::advisor::{
    clinical_request, parse_call1, parse_call2, statistical_request, Advisor, AdvisoryRequest,
    Call1Request, Call1Result, Call2Request, Call2Result,
};
use super::cancel::CancelToken;
use super::merge::{
    apply_adjustments, auto_detectable_labels, classify, severity_counts, Adjustment,
    DiscardReason, MergeOutcome,
};
use super::proposals::{
    decay_proposals, narrative_proposals, severity_proposals, threshold_proposals,
};
use crate::error::RiskError;
use crate::models::{find_label, AiConfig, DecayTable, GaugeThresholds, ItemKind, MappingResult};

pub const DEFAULT_ADVISOR_TIMEOUT: Duration = Duration::from_secs(60);

const FALLBACK_SUMMARY: &str =
    "Calibration was unavailable; your own ratings are in use with the default gauge settings.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Call1Running,
    Call1Done,
    Call2Running,
    Done,
    /// An advisory stage failed; the run still returns the fallback config.
    Failed,
}

/// Inputs for one calibration run. The mapping is the floor and is only read.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationInput {
    pub mapping: MappingResult,
    pub auto_detectable: BTreeSet<String>,
    pub connected_data: Vec<String>,
    pub current_thresholds: GaugeThresholds,
    pub current_decay: DecayTable,
}

impl CalibrationInput {
    /// Onboarding defaults: automatable labels come from the trigger pool and
    /// the current gauge is the built-in one.
    pub fn new(mapping: MappingResult) -> Self {
        Self {
            auto_detectable: auto_detectable_labels(&mapping.triggers),
            mapping,
            connected_data: Vec::new(),
            current_thresholds: GaugeThresholds::fallback(),
            current_decay: DecayTable::fallback(),
        }
    }

    /// Compares the statistical pass against a stored gauge instead of the
    /// built-in one.
    pub fn with_gauge(mut self, thresholds: GaugeThresholds, decay: DecayTable) -> Self {
        self.current_thresholds = thresholds;
        self.current_decay = decay.normalized();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRun {
    pub run_id: Uuid,
    pub state: PipelineState,
    pub transitions: Vec<PipelineState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    pub config: AiConfig,
    /// Clinical-pass adjustments dropped by the elevation-only merge.
    #[serde(default)]
    pub discarded: Vec<DiscardedAdjustment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscardedAdjustment {
    #[serde(flatten)]
    pub adjustment: Adjustment,
    pub reason: DiscardReason,
}

/// The deterministic result used whenever an advisory stage fails.
pub fn build_fallback_config(mapping: &MappingResult) -> AiConfig {
    AiConfig {
        triggers: mapping.triggers.clone(),
        prodromes: mapping.prodromes.clone(),
        thresholds: GaugeThresholds::fallback(),
        decay: DecayTable::fallback(),
        clinical_assessment: String::new(),
        calibration_notes: String::new(),
        summary: FALLBACK_SUMMARY.to_string(),
        data_warnings: Vec::new(),
        proposals: Vec::new(),
        used_fallback: true,
    }
}

struct Transitions(Vec<PipelineState>);

impl Transitions {
    fn enter(&mut self, state: PipelineState) {
        self.0.push(state);
    }

    fn current(&self) -> PipelineState {
        self.0.last().copied().unwrap_or(PipelineState::Idle)
    }
}

/// Two-stage calibration: clinical pass, then statistical pass.
pub struct CalibrationPipeline<A> {
    advisor: A,
    timeout: Duration,
}

impl<A: Advisor> CalibrationPipeline<A> {
    pub fn new(advisor: A, timeout: Duration) -> Self {
        Self { advisor, timeout }
    }

    /// Runs both stages in order. Never fails: any advisory error, timeout or
    /// cancellation ends in [`PipelineState::Failed`] with the fallback config.
    pub async fn run(&self, input: &CalibrationInput, cancel: &CancelToken) -> CalibrationRun {
        let run_id = Uuid::new_v4();
        let mut transitions = Transitions(vec![PipelineState::Idle]);

        transitions.enter(PipelineState::Call1Running);
        let call1 = match self.clinical_pass(input, cancel).await {
            Ok(result) => result,
            Err(err) => return self.fallback(run_id, transitions, input, err),
        };
        transitions.enter(PipelineState::Call1Done);

        let (trigger_adjustments, prodrome_adjustments): (Vec<Adjustment>, Vec<Adjustment>) =
            call1
                .adjustments
                .iter()
                .cloned()
                .partition(|adjustment| adjustment.kind == ItemKind::Trigger);
        let triggers = apply_adjustments(&input.mapping.triggers, &trigger_adjustments);
        let prodromes = apply_adjustments(&input.mapping.prodromes, &prodrome_adjustments);
        info!(
            run_id = %run_id,
            applied = triggers.applied.len() + prodromes.applied.len(),
            discarded = triggers.discarded.len() + prodromes.discarded.len(),
            "clinical pass merged"
        );

        let buckets = classify(&triggers.merged, &input.auto_detectable);
        let call2_request = Call2Request {
            bucket_counts: buckets.counts(),
            buckets,
            prodrome_counts: severity_counts(&prodromes.merged),
            clinical_assessment: call1.clinical_assessment.clone(),
        };

        transitions.enter(PipelineState::Call2Running);
        let call2 = match self.statistical_pass(&call2_request, input, cancel).await {
            Ok(result) => result,
            Err(err) => return self.fallback(run_id, transitions, input, err),
        };
        transitions.enter(PipelineState::Done);
        info!(run_id = %run_id, "statistical pass complete");

        let discarded = triggers
            .discarded
            .iter()
            .chain(&prodromes.discarded)
            .map(|(adjustment, reason)| DiscardedAdjustment {
                adjustment: adjustment.clone(),
                reason: *reason,
            })
            .collect();
        CalibrationRun {
            run_id,
            state: transitions.current(),
            transitions: transitions.0,
            fallback_reason: None,
            config: final_config(input, call1, call2, triggers, prodromes),
            discarded,
        }
    }

    async fn clinical_pass(
        &self,
        input: &CalibrationInput,
        cancel: &CancelToken,
    ) -> Result<Call1Result, RiskError> {
        let request = Call1Request::new(
            &input.mapping.profile_context,
            &input.mapping.triggers,
            &input.mapping.prodromes,
            &input.connected_data,
        );
        let reply = self.call(clinical_request(&request)?, cancel).await?;
        parse_call1(&reply, |label| {
            find_label(&input.mapping.prodromes, label).is_some()
                && find_label(&input.mapping.triggers, label).is_none()
        })
    }

    async fn statistical_pass(
        &self,
        request: &Call2Request,
        input: &CalibrationInput,
        cancel: &CancelToken,
    ) -> Result<Call2Result, RiskError> {
        let reply = self.call(statistical_request(request)?, cancel).await?;
        parse_call2(&reply, &input.current_thresholds, &input.current_decay)
    }

    async fn call(
        &self,
        request: AdvisoryRequest,
        cancel: &CancelToken,
    ) -> Result<String, RiskError> {
        if cancel.is_cancelled() {
            return Err(RiskError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RiskError::Cancelled),
            reply = tokio::time::timeout(self.timeout, self.advisor.complete(&request)) => {
                reply.map_err(|_| RiskError::Timeout(self.timeout))?
            }
        }
    }

    fn fallback(
        &self,
        run_id: Uuid,
        mut transitions: Transitions,
        input: &CalibrationInput,
        err: RiskError,
    ) -> CalibrationRun {
        warn!(
            run_id = %run_id,
            stage = ?transitions.current(),
            error = %err,
            "calibration failed, using deterministic ratings"
        );
        transitions.enter(PipelineState::Failed);
        CalibrationRun {
            run_id,
            state: transitions.current(),
            transitions: transitions.0,
            fallback_reason: Some(err.to_string()),
            config: build_fallback_config(&input.mapping),
            discarded: Vec::new(),
        }
    }
}

fn final_config(
    input: &CalibrationInput,
    call1: Call1Result,
    call2: Call2Result,
    triggers: MergeOutcome,
    prodromes: MergeOutcome,
) -> AiConfig {
    let mut data_warnings = call1.data_warnings;
    for issue in call2
        .thresholds
        .ordering_issues()
        .into_iter()
        .chain(call2.decay.monotonicity_issues())
    {
        warn!(issue = %issue, "calibrated gauge looks inconsistent");
        data_warnings.push(issue);
    }

    let mut proposals = severity_proposals(&triggers.applied);
    proposals.extend(severity_proposals(&prodromes.applied));
    proposals.extend(threshold_proposals(
        &input.current_thresholds,
        &call2.thresholds,
        &call2.calibration_notes,
    ));
    proposals.extend(decay_proposals(
        &input.current_decay,
        &call2.decay,
        &call2.calibration_notes,
    ));
    proposals.extend(narrative_proposals(
        &call1.clinical_assessment,
        &data_warnings,
        &call2.calibration_notes,
    ));

    AiConfig {
        triggers: triggers.merged,
        prodromes: prodromes.merged,
        thresholds: call2.thresholds,
        decay: call2.decay,
        clinical_assessment: call1.clinical_assessment,
        calibration_notes: call2.calibration_notes,
        summary: call2.summary,
        data_warnings,
        proposals,
        used_fallback: false,
    }
}
