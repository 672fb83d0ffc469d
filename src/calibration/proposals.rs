use super::merge::AppliedAdjustment;
use crate::models::{
    CalibrationProposal, DecayTable, GaugeThresholds, ItemKind, ProposalKind, ProposalTarget,
    ProposalValue, Severity, Zone, DECAY_DAYS,
};

const EPSILON: f64 = 1e-9;

/// One proposal per severity elevation, in the order they were applied.
pub fn severity_proposals(applied: &[AppliedAdjustment]) -> Vec<CalibrationProposal> {
    applied
        .iter()
        .map(|adjustment| {
            let kind = match adjustment.kind {
                ItemKind::Trigger => ProposalKind::Trigger,
                ItemKind::Prodrome => ProposalKind::Prodrome,
            };
            CalibrationProposal {
                id: format!(
                    "{}:{}:{}",
                    adjustment.kind.as_str(),
                    adjustment.label,
                    adjustment.to
                ),
                kind,
                label: adjustment.label.clone(),
                target: ProposalTarget::Item {
                    kind: adjustment.kind,
                    label: adjustment.label.clone(),
                },
                from_value: ProposalValue::Severity(adjustment.from),
                to_value: ProposalValue::Severity(adjustment.to),
                reasoning: adjustment.reasoning.clone(),
                accepted: true,
            }
        })
        .collect()
}

pub fn threshold_proposals(
    current: &GaugeThresholds,
    proposed: &GaugeThresholds,
    reasoning: &str,
) -> Vec<CalibrationProposal> {
    Zone::ALL
        .iter()
        .filter(|zone| (current.min_for(**zone) - proposed.min_for(**zone)).abs() > EPSILON)
        .map(|zone| CalibrationProposal {
            id: format!("threshold:{zone}"),
            kind: ProposalKind::GaugeThreshold,
            label: format!("{zone} zone minimum"),
            target: ProposalTarget::Threshold { zone: *zone },
            from_value: ProposalValue::Number(current.min_for(*zone)),
            to_value: ProposalValue::Number(proposed.min_for(*zone)),
            reasoning: reasoning.to_string(),
            accepted: true,
        })
        .collect()
}

/// One proposal per decay cell that changes.
pub fn decay_proposals(
    current: &DecayTable,
    proposed: &DecayTable,
    reasoning: &str,
) -> Vec<CalibrationProposal> {
    let mut proposals = Vec::new();
    for severity in Severity::CONTRIBUTING {
        for day in 0..DECAY_DAYS {
            let from = current.weight(severity, day as i64);
            let to = proposed.weight(severity, day as i64);
            if (from - to).abs() <= EPSILON {
                continue;
            }
            proposals.push(CalibrationProposal {
                id: format!("decay:{severity}:{day}"),
                kind: ProposalKind::GaugeDecay,
                label: format!("{severity} day {day}"),
                target: ProposalTarget::DecayCell { severity, day },
                from_value: ProposalValue::Number(from),
                to_value: ProposalValue::Number(to),
                reasoning: reasoning.to_string(),
                accepted: true,
            });
        }
    }
    proposals
}

pub fn note_proposal(
    kind: ProposalKind,
    id: String,
    label: &str,
    text: &str,
) -> CalibrationProposal {
    CalibrationProposal {
        id,
        kind,
        label: label.to_string(),
        target: ProposalTarget::Note,
        from_value: ProposalValue::Empty,
        to_value: ProposalValue::Text(text.to_string()),
        reasoning: String::new(),
        accepted: true,
    }
}

/// Narrative and warning entries shown alongside the changes.
pub fn narrative_proposals(
    clinical_assessment: &str,
    data_warnings: &[String],
    calibration_notes: &str,
) -> Vec<CalibrationProposal> {
    let mut proposals = Vec::new();
    if !clinical_assessment.is_empty() {
        proposals.push(note_proposal(
            ProposalKind::ClinicalAssessment,
            "clinical_assessment".to_string(),
            "Clinical assessment",
            clinical_assessment,
        ));
    }
    for (index, warning) in data_warnings.iter().enumerate() {
        proposals.push(note_proposal(
            ProposalKind::DataWarning,
            format!("data_warning:{index}"),
            "Data warning",
            warning,
        ));
    }
    if !calibration_notes.is_empty() {
        proposals.push(note_proposal(
            ProposalKind::CalibrationNotes,
            "calibration_notes".to_string(),
            "Calibration notes",
            calibration_notes,
        ));
    }
    proposals
}
