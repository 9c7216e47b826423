//! Aegis operator CLI
//!
//! The `aegis` command is the human surface of the pipeline:
//!
//! - `inject`: publish sample domain events onto the bus
//! - `review`: approve or reject a fix awaiting human review
//! - `autonomy`: set the operator autonomy level
//! - `events`: query the event store by topic and window
//!
//! Connection settings come from the same environment variables the daemon
//! uses (`AEGIS_BUS_BACKEND`, `AEGIS_STORE_URL`, ...).

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::Level;

use aegis_bus::{create_bus, MessageBus, RetryPolicy};
use aegis_core::{AutonomyLevel, EngineConfig};
use aegis_domain::{topics, Envelope, Severity};
use aegis_state::surreal::{self, SurrealEventStore};
use aegis_state::{EventQuery, EventStore};

#[derive(Parser)]
#[command(name = "aegis")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Operator CLI for the Aegis crisis-management pipeline", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish a sample domain event onto the bus
    Inject {
        #[command(subcommand)]
        event: InjectEvent,
    },

    /// Approve or reject a fix awaiting human review
    Review {
        /// Fix identifier (FIX-YYYYMMDD-XXXXXXXX)
        fix_id: String,

        /// Approve the fix (mutually exclusive with --reject)
        #[arg(long, conflicts_with = "reject")]
        approve: bool,

        /// Reject the fix
        #[arg(long)]
        reject: bool,

        /// Reviewer identity recorded on the decision
        #[arg(long, default_value = "operator")]
        reviewer: String,

        /// Free-form review notes
        #[arg(long)]
        notes: Option<String>,
    },

    /// Set the operator autonomy level (NORMAL or HIGH)
    Autonomy {
        level: AutonomyLevel,

        /// Operator identity carried on the status event
        #[arg(long, default_value = "operator")]
        operator_id: String,
    },

    /// Query logged events by topic within a recent window
    Events {
        /// Full topic name (e.g. aegis.events.fix.proposed)
        #[arg(long)]
        topic: String,

        /// Window size in minutes, ending now
        #[arg(long, default_value_t = 60)]
        last_mins: i64,

        /// Filter by correlation id
        #[arg(long)]
        correlation: Option<String>,
    },
}

#[derive(Subcommand)]
enum InjectEvent {
    /// Critical power failure in a sector
    PowerFailure {
        #[arg(long, default_value = "sector-1")]
        sector: String,

        #[arg(long, default_value_t = 0.0)]
        voltage: f64,
    },

    /// Transit disruption with accumulated delay
    TransitDisruption {
        #[arg(long, default_value = "ROUTE-95")]
        route: String,

        #[arg(long, default_value_t = 18.0)]
        delay: f64,

        #[arg(long, default_value = "sector-1")]
        sector: String,
    },

    /// Located environmental risk reading
    RiskArea {
        #[arg(long, default_value_t = 45.42)]
        lat: f64,

        #[arg(long, default_value_t = -75.69)]
        lon: f64,

        #[arg(long, default_value_t = 0.85)]
        score: f64,

        #[arg(long, default_value = "sector-1")]
        sector: String,
    },
}

async fn connect_bus(config: &EngineConfig) -> Result<Arc<dyn MessageBus>> {
    create_bus(config.bus_backend, &config.nats_url, RetryPolicy::default())
        .await
        .context("bus unreachable")
}

async fn run_inject(config: &EngineConfig, event: InjectEvent) -> Result<()> {
    let bus = connect_bus(config).await?;
    let (topic, envelope) = match event {
        InjectEvent::PowerFailure { sector, voltage } => (
            topics::POWER_FAILURE,
            Envelope::new(
                "aegis-cli",
                Severity::Critical,
                sector,
                "Injected power failure",
            )
            .with_details(json!({"voltage": voltage, "load": 100, "phase": "all"})),
        ),
        InjectEvent::TransitDisruption {
            route,
            delay,
            sector,
        } => (
            topics::TRANSIT_DISRUPTION_RISK,
            Envelope::new(
                "aegis-cli",
                Severity::Critical,
                sector,
                format!("Injected disruption on {route}"),
            )
            .with_details(json!({"route_id": route, "delay": delay})),
        ),
        InjectEvent::RiskArea {
            lat,
            lon,
            score,
            sector,
        } => (
            topics::GEO_RISK_AREA,
            Envelope::new(
                "aegis-cli",
                Severity::Moderate,
                sector,
                "Injected environmental risk",
            )
            .with_details(json!({
                "risk_score": score,
                "location": {"lat": lat, "lon": lon},
            })),
        ),
    };

    bus.publish(topic, &envelope).await?;
    println!("published {topic} ({})", envelope.event_id);
    Ok(())
}

async fn run_review(
    config: &EngineConfig,
    fix_id: String,
    approve: bool,
    reject: bool,
    reviewer: String,
    notes: Option<String>,
) -> Result<()> {
    if !approve && !reject {
        anyhow::bail!("pass either --approve or --reject");
    }
    let bus = connect_bus(config).await?;
    let decision = Envelope::new(
        "aegis-cli",
        Severity::Info,
        "control-plane",
        format!(
            "{} fix {fix_id}",
            if approve { "Approve" } else { "Reject" }
        ),
    )
    .with_details(json!({
        "fix_id": fix_id,
        "approve": approve,
        "reviewer": reviewer,
        "notes": notes,
    }));
    bus.publish(topics::FIX_REVIEW_DECISION, &decision).await?;
    println!(
        "review decision submitted for {fix_id}: {}",
        if approve { "approve" } else { "reject" }
    );
    Ok(())
}

async fn run_autonomy(
    config: &EngineConfig,
    level: AutonomyLevel,
    operator_id: String,
) -> Result<()> {
    let bus = connect_bus(config).await?;
    let status = Envelope::new(
        "aegis-cli",
        Severity::Info,
        "control-plane",
        format!("Autonomy level set to {level}"),
    )
    .with_details(json!({
        "autonomy_level": level.as_str(),
        "operator_id": operator_id,
    }));
    bus.publish(topics::OPERATOR_STATUS, &status).await?;
    println!("autonomy level set to {level}");
    Ok(())
}

async fn run_events(
    config: &EngineConfig,
    topic: String,
    last_mins: i64,
    correlation: Option<String>,
) -> Result<()> {
    let db = surreal::connect(&config.store_url)
        .await
        .context("event store unreachable")?;
    let store = SurrealEventStore::new(db);

    let now = Utc::now();
    let mut query = EventQuery::new(vec![topic], now - Duration::minutes(last_mins), now);
    if let Some(correlation) = correlation {
        query = query.with_field_eq("correlation_id", json!(correlation));
    }

    let events = store.query(&query).await?;
    println!("{} event(s)", events.len());
    for event in events {
        println!(
            "{}  {}  [{}]  {}",
            event.received_at.format("%H:%M:%S"),
            event.envelope.event_id,
            event.envelope.severity,
            event.envelope.summary
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    aegis_core::init_tracing(false, level);

    let config = EngineConfig::from_env().context("configuration")?;

    match cli.command {
        Commands::Inject { event } => run_inject(&config, event).await,
        Commands::Review {
            fix_id,
            approve,
            reject,
            reviewer,
            notes,
        } => run_review(&config, fix_id, approve, reject, reviewer, notes).await,
        Commands::Autonomy { level, operator_id } => {
            run_autonomy(&config, level, operator_id).await
        }
        Commands::Events {
            topic,
            last_mins,
            correlation,
        } => run_events(&config, topic, last_mins, correlation).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
