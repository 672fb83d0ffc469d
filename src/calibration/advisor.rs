//! Advisory text-generation calls and tolerant parsing of their replies.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::merge::{Adjustment, BucketCounts, SeverityCounts, TriggerBuckets};
use crate::error::RiskError;
use crate::models::{
    DecayTable, GaugeThresholds, ItemKind, Severity, SettingsPool, Zone, DECAY_DAYS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvisoryStage {
    Clinical,
    Statistical,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdvisoryRequest {
    pub stage: AdvisoryStage,
    pub system_prompt: String,
    pub user_prompt: String,
}

/// Text-generation backend used by both calibration stages.
#[async_trait]
pub trait Advisor: Send + Sync {
    async fn complete(&self, request: &AdvisoryRequest) -> Result<String, RiskError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockedRating {
    pub label: String,
    pub severity: Severity,
}

/// Everything the clinical pass sees.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Call1Request {
    pub profile_context: Vec<String>,
    pub locked_triggers: Vec<LockedRating>,
    pub locked_prodromes: Vec<LockedRating>,
    pub available_triggers: Vec<String>,
    pub available_prodromes: Vec<String>,
    pub connected_data: Vec<String>,
}

impl Call1Request {
    pub fn new(
        profile_context: &[String],
        triggers: &SettingsPool,
        prodromes: &SettingsPool,
        connected_data: &[String],
    ) -> Self {
        let locked = |pool: &SettingsPool| -> Vec<LockedRating> {
            pool.values()
                .filter(|setting| setting.severity != Severity::None)
                .map(|setting| LockedRating {
                    label: setting.label.clone(),
                    severity: setting.severity,
                })
                .collect()
        };
        Self {
            profile_context: profile_context.to_vec(),
            locked_triggers: locked(triggers),
            locked_prodromes: locked(prodromes),
            available_triggers: triggers.keys().cloned().collect(),
            available_prodromes: prodromes.keys().cloned().collect(),
            connected_data: connected_data.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Call1Result {
    pub clinical_assessment: String,
    pub adjustments: Vec<Adjustment>,
    pub data_warnings: Vec<String>,
}

/// Everything the statistical pass sees.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Call2Request {
    pub buckets: TriggerBuckets,
    pub bucket_counts: BucketCounts,
    pub prodrome_counts: SeverityCounts,
    pub clinical_assessment: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call2Result {
    pub thresholds: GaugeThresholds,
    pub decay: DecayTable,
    pub calibration_notes: String,
    pub summary: String,
}

const CLINICAL_SYSTEM_PROMPT: &str = "You review a migraine patient's trigger and prodrome \
ratings. Ratings listed as locked are floors reported by the patient: you may raise them or \
activate unrated items from the available lists, never lower them. Reply with one JSON object: \
{\"clinical_assessment\": string, \"adjustments\": [{\"type\": \"trigger\"|\"prodrome\", \
\"label\": string, \"from\": \"NONE\"|\"LOW\"|\"MILD\"|\"HIGH\", \"to\": same, \"reasoning\": \
string}], \"data_warnings\": [string]}.";

const STATISTICAL_SYSTEM_PROMPT: &str = "You calibrate a daily migraine risk gauge. Each logged \
event adds points by severity and age in days (index 0 = day of event, 7 values). The gauge \
zones need increasing minimum scores. Automatically detected triggers fire more often than \
manually logged ones. Reply with one JSON object: {\"gauge_thresholds\": {\"low\": number, \
\"mild\": number, \"high\": number}, \"decay_weights\": {\"high\": [7 numbers], \"mild\": [7 \
numbers], \"low\": [7 numbers]}, \"calibration_notes\": string, \"summary\": string}.";

pub fn clinical_request(request: &Call1Request) -> Result<AdvisoryRequest, RiskError> {
    Ok(AdvisoryRequest {
        stage: AdvisoryStage::Clinical,
        system_prompt: CLINICAL_SYSTEM_PROMPT.to_string(),
        user_prompt: serde_json::to_string_pretty(request)
            .map_err(|err| RiskError::InvalidInput(err.to_string()))?,
    })
}

pub fn statistical_request(request: &Call2Request) -> Result<AdvisoryRequest, RiskError> {
    Ok(AdvisoryRequest {
        stage: AdvisoryStage::Statistical,
        system_prompt: STATISTICAL_SYSTEM_PROMPT.to_string(),
        user_prompt: serde_json::to_string_pretty(request)
            .map_err(|err| RiskError::InvalidInput(err.to_string()))?,
    })
}

/// Chat-completions client for an OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct HttpAdvisor {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl HttpAdvisor {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Advisor for HttpAdvisor {
    async fn complete(&self, request: &AdvisoryRequest) -> Result<String, RiskError> {
        let body = json!({
            "model": self.model,
            "temperature": 0.2,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": request.system_prompt },
                { "role": "user", "content": request.user_prompt },
            ],
        });

        let mut builder = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let resp = builder.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RiskError::AdvisorStatus {
                status: status.as_u16(),
                body,
            });
        }

        let payload: Value = resp.json().await?;
        payload
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RiskError::MalformedResponse("no message content in reply".to_string()))
    }
}

/// Used when no advisory endpoint is configured; every call fails, which
/// routes calibration to the deterministic fallback.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineAdvisor;

#[async_trait]
impl Advisor for OfflineAdvisor {
    async fn complete(&self, _request: &AdvisoryRequest) -> Result<String, RiskError> {
        Err(RiskError::AdvisorTransport(
            "no advisory endpoint configured".to_string(),
        ))
    }
}

/// Cuts the JSON object out of a reply that may be wrapped in prose or a
/// markdown fence.
fn extract_json_object(text: &str) -> Result<Value, RiskError> {
    let start = text.find('{');
    let end = text.rfind('}');
    let (Some(start), Some(end)) = (start, end) else {
        return Err(RiskError::MalformedResponse(
            "reply contains no JSON object".to_string(),
        ));
    };
    if end < start {
        return Err(RiskError::MalformedResponse(
            "reply contains no JSON object".to_string(),
        ));
    }
    let value: Value = serde_json::from_str(&text[start..=end])?;
    if !value.is_object() {
        return Err(RiskError::MalformedResponse(
            "reply is not a JSON object".to_string(),
        ));
    }
    Ok(value)
}

fn text_field(value: &Value, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .unwrap_or_default()
        .trim()
        .to_string()
}

fn severity_value(value: Option<&Value>) -> Option<Severity> {
    match value? {
        Value::String(text) => Severity::parse_lenient(text),
        Value::Number(number) => number
            .as_u64()
            .and_then(|rank| u8::try_from(rank).ok())
            .and_then(Severity::from_rank),
        _ => None,
    }
}

fn number_value(value: Option<&Value>) -> Option<f64> {
    let number = match value? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|number| number.is_finite())
}

/// Parses a clinical-pass reply. Missing fields default to empty; individual
/// adjustments without a label or a readable target severity are skipped.
///
/// `is_prodrome` decides the kind of adjustments that do not state one.
pub fn parse_call1(
    text: &str,
    is_prodrome: impl Fn(&str) -> bool,
) -> Result<Call1Result, RiskError> {
    let root = extract_json_object(text)?;

    let mut adjustments = Vec::new();
    for raw in root
        .get("adjustments")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
    {
        let label = text_field(raw, &["label", "name"]);
        let Some(to) = severity_value(raw.get("to").or_else(|| raw.get("to_severity"))) else {
            debug!(label = %label, "skipping adjustment without a target severity");
            continue;
        };
        if label.is_empty() {
            debug!("skipping adjustment without a label");
            continue;
        }
        let kind = match text_field(raw, &["type", "kind"]).parse::<ItemKind>() {
            Ok(kind) => kind,
            Err(_) if is_prodrome(&label) => ItemKind::Prodrome,
            Err(_) => ItemKind::Trigger,
        };
        adjustments.push(Adjustment {
            kind,
            label,
            from: severity_value(raw.get("from").or_else(|| raw.get("from_severity"))),
            to,
            reasoning: text_field(raw, &["reasoning", "reason"]),
        });
    }

    let data_warnings = root
        .get("data_warnings")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    Value::String(text) => Some(text.trim().to_string()),
                    other => other
                        .get("message")
                        .and_then(Value::as_str)
                        .map(|text| text.trim().to_string()),
                })
                .filter(|text| !text.is_empty())
                .collect()
        })
        .unwrap_or_default();

    Ok(Call1Result {
        clinical_assessment: text_field(&root, &["clinical_assessment", "assessment"]),
        adjustments,
        data_warnings,
    })
}

/// Parses a statistical-pass reply.
///
/// Threshold and decay cells the reply leaves out keep the `base` values, so a
/// partial answer only changes what it states. Negative or non-finite cells are
/// clamped to zero.
pub fn parse_call2(
    text: &str,
    base_thresholds: &GaugeThresholds,
    base_decay: &DecayTable,
) -> Result<Call2Result, RiskError> {
    let root = extract_json_object(text)?;

    let mut thresholds = base_thresholds.clone();
    if let Some(raw) = root
        .get("gauge_thresholds")
        .or_else(|| root.get("thresholds"))
    {
        for zone in Zone::ALL {
            let value = raw
                .get(zone.as_str().to_ascii_lowercase())
                .or_else(|| raw.get(zone.as_str()));
            if let Some(number) = number_value(value) {
                thresholds.set(zone, number.max(0.0));
            }
        }
    } else {
        warn!("statistical reply has no gauge thresholds; keeping current values");
    }

    let mut decay = base_decay.normalized();
    if let Some(raw) = root.get("decay_weights").or_else(|| root.get("decay")) {
        for severity in Severity::CONTRIBUTING {
            let row = raw
                .get(severity.as_str().to_ascii_lowercase())
                .or_else(|| raw.get(severity.as_str()))
                .and_then(Value::as_array);
            let Some(row) = row else {
                continue;
            };
            for (day, cell) in row.iter().take(DECAY_DAYS).enumerate() {
                if let Some(number) = number_value(Some(cell)) {
                    decay.set(severity, day, number.max(0.0));
                }
            }
        }
    } else {
        warn!("statistical reply has no decay weights; keeping current values");
    }

    Ok(Call2Result {
        thresholds,
        decay,
        calibration_notes: text_field(&root, &["calibration_notes", "notes"]),
        summary: text_field(&root, &["summary"]),
    })
}
