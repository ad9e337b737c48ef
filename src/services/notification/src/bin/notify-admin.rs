//! Operations CLI for the notification dispatcher
//!
//! Works against a JSON directory snapshot (`--state`) and the same config
//! layering as the server. Prints JSON on stdout and exits non-zero on
//! error.

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use notification_service::directory::Person;
use notification_service::dispatch::Recorder;
use notification_service::{DispatcherConfig, MemoryDirectory, NotificationService};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use telehealth_shared::events::{
    CaseAssigned, NewMessagePosted, RefillRequestCreated, RxTransmissionError,
    TreatmentPlanActivated, VisitRouted, VisitSubmitted,
};
use telehealth_shared::{AccountId, Channel, DomainEvent, EventKind, PersonRef, Role};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "notify-admin", version, about = "Notification dispatcher operations")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// JSON directory snapshot; updated in place after the command
    #[arg(short, long, value_name = "FILE", env = "NOTIFICATION_STATE_FILE")]
    state: Option<PathBuf>,

    /// Seconds to wait for the campaign lock
    #[arg(long, default_value_t = 10)]
    lock_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Make push the preferred channel for an account
    Enablepush { account: AccountId },
    /// Notify an account as if `event` had happened to them
    Sendtest { account: AccountId, event: EventKind },
    /// Campaign operations
    Campaign {
        #[command(subcommand)]
        command: CampaignCommands,
    },
}

#[derive(Subcommand, Debug)]
enum CampaignCommands {
    /// Run one campaign immediately, holding the campaign lock
    RunOnce { key: String },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(output) => println!("{}", output),
        Err(e) => {
            eprintln!("{}", json!({ "error": format!("{:#}", e) }));
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<Value> {
    let mut config = DispatcherConfig::load(cli.config.as_deref())
        .context("Failed to load configuration")?;
    // Handlers must finish before the state file is written
    config.dispatch.synchronous = true;
    config
        .validate()
        .map_err(|e| anyhow!("Configuration validation failed: {}", e))?;

    let directory = Arc::new(match &cli.state {
        Some(path) => MemoryDirectory::load(path)
            .await
            .with_context(|| format!("Failed to load state from {}", path.display()))?,
        None => MemoryDirectory::new(),
    });

    let cancel = CancellationToken::new();
    let service = NotificationService::new(config, directory.clone(), cancel.clone())
        .await
        .context("Failed to initialize notification service")?;

    let output = match cli.command {
        Commands::Enablepush { account } => enable_push(&service, account).await?,
        Commands::Sendtest { account, event } => send_test(&service, account, event).await?,
        Commands::Campaign {
            command: CampaignCommands::RunOnce { key },
        } => run_campaign(&service, &key, Duration::from_secs(cli.lock_timeout)).await?,
    };

    if let Some(path) = &cli.state {
        directory
            .save(path)
            .await
            .with_context(|| format!("Failed to save state to {}", path.display()))?;
    }
    Ok(output)
}

async fn enable_push(service: &NotificationService, account: AccountId) -> Result<Value> {
    let directory = service.directory();
    if directory.person_for_account(account).await?.is_none() {
        bail!("unknown account {}", account);
    }
    directory
        .set_communication_preference(account, Channel::Push)
        .await?;
    let devices = directory.push_configs_for_account(account).await?;
    Ok(json!({
        "account_id": account,
        "preferences": directory.communication_preferences(account).await?,
        "devices": devices.len(),
    }))
}

async fn send_test(
    service: &NotificationService,
    account: AccountId,
    kind: EventKind,
) -> Result<Value> {
    let person = service
        .directory()
        .person_for_account(account)
        .await?
        .ok_or_else(|| anyhow!("unknown account {}", account))?;
    let event = test_event(kind, &person)?;

    let sends = Recorder::new();
    service.dispatcher().subscribe(EventKind::Send, sends.clone());

    let delivery = service
        .manager()
        .handle_event(&event)
        .await?
        .ok_or_else(|| anyhow!("no notification view for {}", kind))?;

    Ok(json!({
        "event": event,
        "delivery": delivery,
        "sends": sends.events(),
        "metrics": service.metrics().snapshot(),
    }))
}

/// Event of `kind` addressed to `person`, with zero ids for everything else.
fn test_event(kind: EventKind, person: &Person) -> Result<DomainEvent> {
    let id = person.person_id;
    let provider = person.role.is_provider();
    let event = match kind {
        EventKind::VisitSubmitted if provider => DomainEvent::VisitSubmitted(VisitSubmitted {
            patient_id: 0,
            doctor_id: id,
            visit_id: 0,
            case_id: 0,
        }),
        EventKind::VisitRouted if provider => DomainEvent::VisitRouted(VisitRouted {
            patient_id: 0,
            doctor_id: id,
            visit_id: 0,
        }),
        EventKind::CaseAssigned if provider => DomainEvent::CaseAssigned(CaseAssigned {
            case_id: 0,
            doctor_id: id,
        }),
        EventKind::RefillRequestCreated if provider => {
            DomainEvent::RefillRequestCreated(RefillRequestCreated {
                refill_request_id: 0,
                patient_id: 0,
                doctor_id: id,
            })
        }
        EventKind::RxTransmissionError if provider => {
            DomainEvent::RxTransmissionError(RxTransmissionError {
                item_id: 0,
                patient_id: 0,
                doctor_id: id,
            })
        }
        EventKind::TreatmentPlanActivated if person.role == Role::Patient => {
            DomainEvent::TreatmentPlanActivated(TreatmentPlanActivated {
                patient_id: id,
                doctor_id: 0,
                treatment_plan_id: 0,
            })
        }
        EventKind::NewMessagePosted => DomainEvent::NewMessagePosted(NewMessagePosted {
            case_id: 0,
            message_id: 0,
            sender: PersonRef::doctor(0),
            recipient: person.person_ref(),
        }),
        _ => bail!(
            "cannot send a test {} to a {} account",
            kind,
            person.role.as_str()
        ),
    };
    Ok(event)
}

async fn run_campaign(
    service: &NotificationService,
    key: &str,
    lock_timeout: Duration,
) -> Result<Value> {
    let runner = service.campaigns();
    let lock = runner.lock();
    match tokio::time::timeout(lock_timeout, lock.wait()).await {
        Ok(true) => {}
        Ok(false) => bail!("campaign lock was released"),
        Err(_) => bail!("campaign lock is held elsewhere"),
    }

    let result = runner.run_campaign(key, Utc::now()).await;
    lock.release().await;
    let report = result?;
    if let Some(error) = &report.error {
        bail!("campaign {} failed: {}", key, error);
    }

    Ok(json!({
        "report": report,
        "metrics": service.metrics().snapshot(),
    }))
}
