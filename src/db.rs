use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::error::RiskError;
use crate::models::{
    AiConfig, DecayTable, Direction, Event, GaugeThresholds, ItemKind, ItemSetting, MetricReading,
    Severity, SettingsPool, Zone, DECAY_DAYS,
};
use crate::review::{SettingChange, SettingsStore};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Active and inactive events whose day falls in `since..=until`.
pub async fn fetch_events(
    pool: &PgPool,
    since: NaiveDate,
    until: NaiveDate,
) -> anyhow::Result<Vec<Event>> {
    let start = since.and_time(NaiveTime::MIN).and_utc();
    let end = (until + Duration::days(1)).and_time(NaiveTime::MIN).and_utc();

    let rows = sqlx::query(
        r#"
        SELECT id, label, kind, occurred_at, severity, linked_migraine_id, source, active
        FROM migraine_risk.events
        WHERE occurred_at >= $1 AND occurred_at < $2
        ORDER BY occurred_at
        "#,
    )
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await?;

    let mut events = Vec::with_capacity(rows.len());
    for row in rows {
        let kind: String = row.get("kind");
        let severity: Option<String> = row.get("severity");
        events.push(Event {
            id: row.get("id"),
            label: row.get("label"),
            kind: kind.parse()?,
            occurred_at: row.get("occurred_at"),
            severity: severity.as_deref().map(str::parse).transpose()?,
            linked_migraine_id: row.get("linked_migraine_id"),
            source: row.get("source"),
            active: row.get("active"),
        });
    }

    Ok(events)
}

pub async fn load_settings(pool: &PgPool, kind: ItemKind) -> anyhow::Result<SettingsPool> {
    let rows = sqlx::query(
        r#"
        SELECT label, severity, favorite, is_automatable, is_automated, direction,
               default_threshold, user_threshold, unit
        FROM migraine_risk.item_settings
        WHERE kind = $1
        ORDER BY label
        "#,
    )
    .bind(kind.as_str())
    .fetch_all(pool)
    .await?;

    let mut settings = SettingsPool::new();
    for row in rows {
        let label: String = row.get("label");
        let severity: String = row.get("severity");
        let direction: Option<String> = row.get("direction");
        let setting = ItemSetting {
            label: label.clone(),
            severity: severity
                .parse()
                .with_context(|| format!("bad severity stored for {label}"))?,
            favorite: row.get("favorite"),
            is_automatable: row.get("is_automatable"),
            is_automated: row.get("is_automated"),
            direction: direction.as_deref().and_then(Direction::parse_lenient),
            default_threshold: row.get("default_threshold"),
            user_threshold: row.get("user_threshold"),
            unit: row.get("unit"),
        };
        settings.insert(label, setting);
    }

    Ok(settings)
}

/// Stored gauge configuration. An empty table falls back to the built-in
/// values; otherwise missing cells read as zero.
pub async fn load_gauge(pool: &PgPool) -> anyhow::Result<(GaugeThresholds, DecayTable)> {
    let threshold_rows =
        sqlx::query("SELECT zone, min_score FROM migraine_risk.gauge_thresholds")
            .fetch_all(pool)
            .await?;
    let mut thresholds = GaugeThresholds::fallback();
    for row in threshold_rows {
        let zone: String = row.get("zone");
        let zone = Zone::parse_lenient(&zone).ok_or_else(|| anyhow!("unknown zone '{zone}'"))?;
        thresholds.set(zone, row.get("min_score"));
    }

    let (_, decay) = stored_decay(pool).await?;

    Ok((thresholds, decay))
}

/// The decay table as scoring sees it, and whether any cell is stored at all.
async fn stored_decay<'e, E>(executor: E) -> Result<(bool, DecayTable), RiskError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let rows = sqlx::query("SELECT severity, day, weight FROM migraine_risk.decay_weights")
        .fetch_all(executor)
        .await?;
    if rows.is_empty() {
        return Ok((false, DecayTable::fallback()));
    }

    let mut decay = DecayTable::default();
    for row in rows {
        let severity: String = row.get("severity");
        let day: i32 = row.get("day");
        let severity: Severity = severity.parse()?;
        let day = usize::try_from(day)
            .map_err(|_| RiskError::Store(format!("negative decay day {day}")))?;
        decay.set(severity, day, row.get("weight"));
    }
    Ok((true, decay.normalized()))
}

/// Persists a whole configuration in one transaction.
pub async fn save_config(pool: &PgPool, config: &AiConfig) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;

    for (kind, settings) in [
        (ItemKind::Trigger, &config.triggers),
        (ItemKind::Prodrome, &config.prodromes),
    ] {
        for setting in settings.values() {
            upsert_setting(&mut tx, kind, setting).await?;
        }
    }

    for zone in Zone::ALL {
        upsert_threshold(&mut tx, zone, config.thresholds.min_for(zone)).await?;
    }

    let decay = config.decay.normalized();
    for severity in Severity::CONTRIBUTING {
        for day in 0..DECAY_DAYS {
            upsert_decay(&mut tx, severity, day, decay.weight(severity, day as i64)).await?;
        }
    }

    tx.commit().await.context("failed to commit configuration")?;
    Ok(())
}

async fn upsert_setting(
    tx: &mut Transaction<'_, Postgres>,
    kind: ItemKind,
    setting: &ItemSetting,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO migraine_risk.item_settings
        (kind, label, severity, favorite, is_automatable, is_automated, direction,
         default_threshold, user_threshold, unit)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (kind, label) DO UPDATE
        SET severity = EXCLUDED.severity,
            favorite = EXCLUDED.favorite,
            is_automatable = EXCLUDED.is_automatable,
            is_automated = EXCLUDED.is_automated,
            direction = EXCLUDED.direction,
            default_threshold = EXCLUDED.default_threshold,
            user_threshold = EXCLUDED.user_threshold,
            unit = EXCLUDED.unit,
            updated_at = NOW()
        "#,
    )
    .bind(kind.as_str())
    .bind(&setting.label)
    .bind(setting.severity.as_str())
    .bind(setting.favorite)
    .bind(setting.is_automatable)
    .bind(setting.is_automated)
    .bind(setting.direction.map(Direction::as_str))
    .bind(setting.default_threshold)
    .bind(setting.user_threshold)
    .bind(&setting.unit)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn upsert_threshold(
    tx: &mut Transaction<'_, Postgres>,
    zone: Zone,
    value: f64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO migraine_risk.gauge_thresholds (zone, min_score)
        VALUES ($1, $2)
        ON CONFLICT (zone) DO UPDATE SET min_score = EXCLUDED.min_score
        "#,
    )
    .bind(zone.as_str())
    .bind(value)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn upsert_decay(
    tx: &mut Transaction<'_, Postgres>,
    severity: Severity,
    day: usize,
    value: f64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO migraine_risk.decay_weights (severity, day, weight)
        VALUES ($1, $2, $3)
        ON CONFLICT (severity, day) DO UPDATE SET weight = EXCLUDED.weight
        "#,
    )
    .bind(severity.as_str())
    .bind(day as i32)
    .bind(value)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Imports events from CSV, skipping rows whose source key was seen before.
pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        label: String,
        kind: String,
        occurred_at: DateTime<Utc>,
        severity: Option<String>,
        source: Option<String>,
        source_key: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut inserted = 0usize;

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        let kind: ItemKind = row.kind.parse()?;
        let severity = row
            .severity
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .map(str::parse::<Severity>)
            .transpose()?;
        let source = row.source.unwrap_or_else(|| "import".to_string());
        let source_key = row.source_key.unwrap_or_else(|| {
            format!(
                "{source}:{}:{}:{}",
                kind.as_str(),
                row.label.to_lowercase(),
                row.occurred_at.to_rfc3339()
            )
        });

        let result = sqlx::query(
            r#"
            INSERT INTO migraine_risk.events
            (id, label, kind, occurred_at, severity, source, active, source_key)
            VALUES ($1, $2, $3, $4, $5, $6, TRUE, $7)
            ON CONFLICT (source_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(row.label.trim())
        .bind(kind.as_str())
        .bind(row.occurred_at)
        .bind(severity.map(Severity::as_str))
        .bind(&source)
        .bind(source_key)
        .execute(pool)
        .await?;

        if result.rows_affected() > 0 {
            inserted += 1;
        }
    }

    Ok(inserted)
}

/// Daily metric readings (`label,day,value,source`) for threshold detection.
pub fn read_readings_csv(csv_path: &std::path::Path) -> anyhow::Result<Vec<MetricReading>> {
    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut readings = Vec::new();
    for result in reader.deserialize::<MetricReading>() {
        readings.push(result?);
    }
    Ok(readings)
}

/// Postgres-backed settings writes used by the recalibration review.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettingsStore for PgStore {
    async fn batch_applied(&self, batch_id: Uuid) -> Result<bool, RiskError> {
        let row = sqlx::query(
            "SELECT 1 AS found FROM migraine_risk.applied_batches WHERE batch_id = $1",
        )
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn read_current(&self, change: &SettingChange) -> Result<SettingChange, RiskError> {
        match change {
            SettingChange::ItemSeverity { kind, label, .. }
            | SettingChange::ClearItem { kind, label } => {
                let row = sqlx::query(
                    r#"
                    SELECT label, severity FROM migraine_risk.item_settings
                    WHERE kind = $1 AND lower(label) = lower($2)
                    "#,
                )
                .bind(kind.as_str())
                .bind(label.trim())
                .fetch_optional(&self.pool)
                .await?;
                match row {
                    Some(row) => {
                        let severity: String = row.get("severity");
                        Ok(SettingChange::ItemSeverity {
                            kind: *kind,
                            label: row.get("label"),
                            severity: severity.parse()?,
                        })
                    }
                    None => Ok(SettingChange::ClearItem {
                        kind: *kind,
                        label: label.trim().to_string(),
                    }),
                }
            }
            SettingChange::Threshold { zone, .. } => {
                let value: Option<f64> = sqlx::query_scalar(
                    "SELECT min_score FROM migraine_risk.gauge_thresholds WHERE zone = $1",
                )
                .bind(zone.as_str())
                .fetch_optional(&self.pool)
                .await?;
                Ok(SettingChange::Threshold {
                    zone: *zone,
                    value: value.unwrap_or_else(|| GaugeThresholds::fallback().min_for(*zone)),
                })
            }
            SettingChange::DecayCell { severity, day, .. } => {
                let (_, decay) = stored_decay(&self.pool).await?;
                Ok(SettingChange::DecayCell {
                    severity: *severity,
                    day: *day,
                    value: decay.weight(*severity, *day as i64),
                })
            }
        }
    }

    async fn write_change(&self, change: &SettingChange) -> Result<(), RiskError> {
        let mut tx = self.pool.begin().await?;
        match change {
            SettingChange::ItemSeverity {
                kind,
                label,
                severity,
            } => {
                let updated = sqlx::query(
                    r#"
                    UPDATE migraine_risk.item_settings
                    SET severity = $3, updated_at = NOW()
                    WHERE kind = $1 AND lower(label) = lower($2)
                    "#,
                )
                .bind(kind.as_str())
                .bind(label.trim())
                .bind(severity.as_str())
                .execute(&mut *tx)
                .await?;
                if updated.rows_affected() == 0 {
                    upsert_setting(&mut tx, *kind, &ItemSetting::new(label.trim(), *severity))
                        .await?;
                }
            }
            SettingChange::Threshold { zone, value } => {
                upsert_threshold(&mut tx, *zone, *value).await?;
            }
            SettingChange::DecayCell {
                severity,
                day,
                value,
            } => {
                if *severity == Severity::None || *day >= DECAY_DAYS {
                    return Err(RiskError::InvalidInput(format!(
                        "no decay cell {severity} day {day}"
                    )));
                }
                let (seeded, _) = stored_decay(&mut *tx).await?;
                if !seeded {
                    // Writing one cell into an empty table would zero the rest.
                    let fallback = DecayTable::fallback();
                    for row_severity in Severity::CONTRIBUTING {
                        for cell in 0..DECAY_DAYS {
                            let weight = fallback.weight(row_severity, cell as i64);
                            upsert_decay(&mut tx, row_severity, cell, weight).await?;
                        }
                    }
                }
                upsert_decay(&mut tx, *severity, *day, *value).await?;
            }
            SettingChange::ClearItem { kind, label } => {
                sqlx::query(
                    r#"
                    DELETE FROM migraine_risk.item_settings
                    WHERE kind = $1 AND lower(label) = lower($2)
                    "#,
                )
                .bind(kind.as_str())
                .bind(label.trim())
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn mark_batch_applied(&self, batch_id: Uuid) -> Result<(), RiskError> {
        sqlx::query(
            r#"
            INSERT INTO migraine_risk.applied_batches (batch_id)
            VALUES ($1)
            ON CONFLICT (batch_id) DO NOTHING
            "#,
        )
        .bind(batch_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
