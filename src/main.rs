use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};

use migraine_risk::calibration::{
    build_fallback_config, Advisor, CalibrationInput, CalibrationPipeline, CalibrationRun,
    CancelToken, HttpAdvisor, OfflineAdvisor,
};
use migraine_risk::config::{Config, LogFormat};
use migraine_risk::db::{self, PgStore};
use migraine_risk::mapper::{self, AvailableItems, QuestionnaireAnswers};
use migraine_risk::models::{DecayTable, Event, GaugeThresholds, ItemKind, ScoredEvent};
use migraine_risk::report;
use migraine_risk::review::{
    MemoryStore, RecalibrationReview, ReviewState, SettingChange, SettingsStore, StoredSettings,
};
use migraine_risk::risk;

#[derive(Parser)]
#[command(name = "migraine-risk")]
#[command(about = "Decay-weighted migraine risk scoring and calibration", long_about = None)]
struct Cli {
    /// Postgres connection string
    #[arg(long, global = true, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,
    /// Days an event keeps contributing after the day it happened
    #[arg(long, global = true, env = "RISK_LOOKBACK_DAYS")]
    lookback_days: Option<i64>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Import trigger and prodrome events from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Score a single day and list its contributors
    Score {
        /// Day to score (defaults to today, UTC)
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Daily metric readings to run threshold detection on
        #[arg(long)]
        readings: Option<PathBuf>,
    },
    /// Print the risk forecast starting today
    Forecast {
        #[arg(long)]
        today: Option<NaiveDate>,
        #[arg(long, env = "RISK_FORECAST_DAYS")]
        days: Option<usize>,
        #[arg(long)]
        readings: Option<PathBuf>,
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Generate a markdown forecast report
    Report {
        #[arg(long)]
        today: Option<NaiveDate>,
        #[arg(long, env = "RISK_FORECAST_DAYS")]
        days: Option<usize>,
        #[arg(long)]
        readings: Option<PathBuf>,
        #[arg(long, default_value = "forecast.md")]
        out: PathBuf,
    },
    /// Map questionnaire answers to a floor and run the two-stage calibration
    Calibrate {
        /// Questionnaire answers (JSON)
        #[arg(long)]
        answers: PathBuf,
        /// Available trigger and prodrome pools (JSON)
        #[arg(long)]
        items: PathBuf,
        /// Connected data sources, e.g. "whoop"
        #[arg(long = "connected")]
        connected: Vec<String>,
        #[arg(long, default_value = "calibration.json")]
        out: PathBuf,
        /// Store the questionnaire floor with the default gauge as the baseline
        #[arg(long)]
        save_baseline: bool,
    },
    /// Apply the accepted proposals of a calibration run
    Apply {
        /// Calibration run written by `calibrate`
        #[arg(long)]
        run: PathBuf,
        /// Proposal ids to reject; everything else is accepted
        #[arg(long = "reject")]
        reject: Vec<String>,
        /// Reject everything not listed with --accept
        #[arg(long = "accept", conflicts_with = "reject")]
        accept: Vec<String>,
        /// Apply against an in-memory copy of the run's baseline instead of Postgres
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mut config = Config::from_env().context("invalid environment configuration")?;
    init_tracing(config.log_format);

    let cli = Cli::parse();
    if cli.database_url.is_some() {
        config.database_url = cli.database_url.clone();
    }
    if let Some(lookback_days) = cli.lookback_days {
        anyhow::ensure!(lookback_days >= 0, "lookback days must not be negative");
        config.lookback_days = lookback_days;
    }

    match cli.command {
        Commands::InitDb => {
            let pool = connect(&config).await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Import { csv } => {
            let pool = connect(&config).await?;
            let inserted = db::import_csv(&pool, &csv).await?;
            println!("Inserted {inserted} events from {}.", csv.display());
        }
        Commands::Score { date, readings } => {
            let pool = connect(&config).await?;
            let day = date.unwrap_or_else(|| Utc::now().date_naive());
            let gauge = load_scoring_inputs(&pool, day, config.lookback_days, readings.as_deref())
                .await?;
            let daily =
                risk::compute_daily_score(day, &gauge.events, &gauge.decay, config.lookback_days);
            let zone = risk::classify_zone(daily.score, &gauge.thresholds);

            println!("{day}: score {:.2} ({zone})", daily.score);
            if daily.contributors.is_empty() {
                println!("No contributing events in the last {} days.", config.lookback_days);
            }
            for contributor in &daily.contributors {
                println!("- {} {:.2}", contributor.label, contributor.points);
            }
        }
        Commands::Forecast {
            today,
            days,
            readings,
            json,
        } => {
            let pool = connect(&config).await?;
            let today = today.unwrap_or_else(|| Utc::now().date_naive());
            let days = days.unwrap_or(config.forecast_days);
            let gauge =
                load_scoring_inputs(&pool, today, config.lookback_days, readings.as_deref())
                    .await?;
            let forecast = risk::forecast(
                today,
                &gauge.events,
                &gauge.decay,
                &gauge.thresholds,
                days,
                config.lookback_days,
            );

            if json {
                println!("{}", serde_json::to_string_pretty(&forecast)?);
            } else {
                for day in &forecast {
                    let top = day
                        .contributors
                        .first()
                        .map(|contributor| format!(" led by {}", contributor.label))
                        .unwrap_or_default();
                    println!("{} {:>6.2} {}{}", day.date, day.score, day.zone, top);
                }
            }
        }
        Commands::Report {
            today,
            days,
            readings,
            out,
        } => {
            let pool = connect(&config).await?;
            let today = today.unwrap_or_else(|| Utc::now().date_naive());
            let days = days.unwrap_or(config.forecast_days);
            let gauge =
                load_scoring_inputs(&pool, today, config.lookback_days, readings.as_deref())
                    .await?;
            let forecast = risk::forecast(
                today,
                &gauge.events,
                &gauge.decay,
                &gauge.thresholds,
                days,
                config.lookback_days,
            );
            let report = report::build_forecast_report(
                today,
                risk::cutoff_date(today, config.lookback_days),
                &gauge.events,
                &forecast,
                &gauge.thresholds,
            );
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Calibrate {
            answers,
            items,
            connected,
            out,
            save_baseline,
        } => {
            let answers: QuestionnaireAnswers = read_json(&answers)?;
            let available: AvailableItems = read_json(&items)?;
            let mapping = mapper::map_questionnaire(&answers, &available);

            let gauge = if save_baseline || config.database_url.is_some() {
                let pool = connect(&config).await?;
                if save_baseline {
                    db::save_config(&pool, &build_fallback_config(&mapping)).await?;
                    info!("baseline configuration stored");
                }
                Some(db::load_gauge(&pool).await?)
            } else {
                warn!("DATABASE_URL not set, comparing against the built-in gauge");
                None
            };

            let mut input = CalibrationInput::new(mapping);
            if let Some((thresholds, decay)) = gauge {
                input = input.with_gauge(thresholds, decay);
            }
            input.connected_data = connected;

            let run = match &config.advisor_url {
                Some(url) => {
                    let advisor = HttpAdvisor::new(
                        url.as_str(),
                        config.advisor_api_key.clone(),
                        config.advisor_model.as_str(),
                    );
                    calibrate(advisor, &config, &input).await
                }
                None => {
                    warn!("ADVISOR_URL not set, calibrating offline");
                    calibrate(OfflineAdvisor, &config, &input).await
                }
            };

            std::fs::write(&out, serde_json::to_string_pretty(&run)?)?;
            println!(
                "Calibration {} finished as {:?} with {} proposals{}.",
                run.run_id,
                run.state,
                run.config.proposals.len(),
                if run.config.used_fallback {
                    " (fallback)"
                } else {
                    ""
                }
            );
            println!("{}", run.config.summary);
            if !run.discarded.is_empty() {
                println!(
                    "{} suggested change(s) would have lowered your ratings and were dropped.",
                    run.discarded.len()
                );
            }
            println!("Run written to {}.", out.display());
        }
        Commands::Apply {
            run,
            reject,
            accept,
            dry_run,
        } => {
            let run: CalibrationRun = read_json(&run)?;
            let mut review = RecalibrationReview::new(run.run_id);
            review.load(run.config.proposals.clone());

            if !accept.is_empty() {
                review.reject_all();
                for id in &accept {
                    if !review.toggle_proposal(id) {
                        warn!(proposal = %id, "unknown proposal id");
                    }
                }
            }
            for id in &reject {
                if !review.toggle_proposal(id) {
                    warn!(proposal = %id, "unknown proposal id");
                }
            }

            if dry_run {
                let store = MemoryStore::new(baseline_settings(&run));
                apply_review(&mut review, &store).await?;
                let settings = store.snapshot();
                println!("{}", serde_json::to_string_pretty(&settings.thresholds)?);
                println!("{}", serde_json::to_string_pretty(&settings.decay)?);
            } else {
                let pool = connect(&config).await?;
                apply_review(&mut review, &PgStore::new(pool)).await?;
            }
        }
    }

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "migraine_risk=info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn connect(config: &Config) -> anyhow::Result<PgPool> {
    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set to a Postgres instance")?;

    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")
}

fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

struct ScoringInputs {
    events: Vec<ScoredEvent>,
    thresholds: GaugeThresholds,
    decay: DecayTable,
}

async fn load_scoring_inputs(
    pool: &PgPool,
    today: NaiveDate,
    lookback_days: i64,
    readings: Option<&Path>,
) -> anyhow::Result<ScoringInputs> {
    let triggers = db::load_settings(pool, ItemKind::Trigger).await?;
    let prodromes = db::load_settings(pool, ItemKind::Prodrome).await?;
    let (thresholds, decay) = db::load_gauge(pool).await?;

    let mut events: Vec<Event> =
        db::fetch_events(pool, risk::cutoff_date(today, lookback_days), today).await?;
    if let Some(path) = readings {
        let readings = db::read_readings_csv(path)?;
        let detected_triggers =
            risk::detect_threshold_events(&readings, &triggers, ItemKind::Trigger);
        let detected_prodromes =
            risk::detect_threshold_events(&readings, &prodromes, ItemKind::Prodrome);
        info!(
            triggers = detected_triggers.len(),
            prodromes = detected_prodromes.len(),
            "threshold detection"
        );
        events.extend(detected_triggers);
        events.extend(detected_prodromes);
    }

    Ok(ScoringInputs {
        events: risk::resolve_events(&events, &triggers, &prodromes),
        thresholds,
        decay,
    })
}

async fn calibrate<A: Advisor>(
    advisor: A,
    config: &Config,
    input: &CalibrationInput,
) -> CalibrationRun {
    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling calibration");
            on_interrupt.cancel();
        }
    });

    let run = CalibrationPipeline::new(advisor, config.advisor_timeout)
        .run(input, &cancel)
        .await;
    watcher.abort();
    run
}

/// Values the run's proposals were computed against.
fn baseline_settings(run: &CalibrationRun) -> StoredSettings {
    let mut settings = StoredSettings::from_config(&run.config);
    for proposal in run.config.proposals.iter().rev() {
        if let Some(change) = SettingChange::revert(proposal) {
            settings.apply(&change);
        }
    }
    settings
}

async fn apply_review(
    review: &mut RecalibrationReview,
    store: &dyn SettingsStore,
) -> anyhow::Result<()> {
    let report = review.apply_decisions(store).await;
    match (report, review.state()) {
        (Ok(report), _) if report.already_applied => {
            println!("Batch {} was already applied; nothing written.", report.batch_id);
            Ok(())
        }
        (Ok(report), _) => {
            println!(
                "Applied {} changes, rejected {} proposals.",
                report.written.len(),
                report.rejected
            );
            for id in &report.written {
                println!("- {id}");
            }
            Ok(())
        }
        (Err(err), ReviewState::Ready { .. }) => {
            Err(err).context("apply failed; no changes kept, retry to apply again")
        }
        (Err(err), _) => Err(err.into()),
    }
}
