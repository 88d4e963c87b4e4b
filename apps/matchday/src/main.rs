use anyhow::{Context, Result, anyhow};
use clap::Parser;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

use matchday_client_core::auth::{StaticToken, TokenSource};
use matchday_client_core::cli::{Cli, Command, SpeechArgs};
use matchday_client_core::commands::{CommandAck, CommandError};
use matchday_client_core::config::{self, ClientConfig};
use matchday_client_core::events::EventLog;
use matchday_client_core::fallback::{FallbackLoader, ReqwestMatchApi};
use matchday_client_core::model::{MatchId, MatchState};
use matchday_client_core::normalize::{MatchSnapshot, Normalizer};
use matchday_client_core::reconcile::StateReconciler;
use matchday_client_core::session::{MatchSession, SessionDeps, Settled};
use matchday_client_core::telemetry::logging;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logging::init(&log_config).context("configuring logging")?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let config = client_config(&cli)?;
    match cli.command {
        Command::Watch(args) => watch(&config, args.match_id.into()).await,
        Command::Pause(args) => control(&config, args.match_id.into(), Action::Pause).await,
        Command::Resume(args) => control(&config, args.match_id.into(), Action::Resume).await,
        Command::Speech(args) => {
            let match_id = MatchId::new(args.match_id.clone());
            control(&config, match_id, Action::Speech(args)).await
        }
        Command::Snapshot(args) => rest_only(&config, args.match_id.into(), false).await,
        Command::Simulate(args) => rest_only(&config, args.match_id.into(), true).await,
    }
}

fn client_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = ClientConfig::from_env()?;
    if let Some(hub) = cli.hub_url.as_deref() {
        config.hub_url = config::hub_url(hub)?;
    }
    if let Some(api) = cli.api_url.as_deref() {
        config.api_url = config::api_url(api)?;
    }
    if cli.token.is_some() {
        config.token = cli.token.clone();
    }
    Ok(config)
}

async fn watch(config: &ClientConfig, match_id: MatchId) -> Result<()> {
    let session = MatchSession::open(SessionDeps::from_config(config)?, match_id).await?;
    info!(
        session = %session.id(),
        match_id = %session.match_id(),
        live = session.is_live(),
        "watching match"
    );

    let mut states = session.subscribe_state();
    let mut printed = 0;
    report(&session, &mut printed);

    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                report(&session, &mut printed);
            }
            settled = session.settled() => {
                if let Settled::Offline { reason } = settled {
                    warn!(
                        match_id = %session.match_id(),
                        reason = %reason,
                        "push channel offline; showing last known state"
                    );
                }
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    report(&session, &mut printed);
    if !session.is_live() {
        warn!(match_id = %session.match_id(), "no live channel; showing snapshot");
    }
    if let Some(message) = session.last_error() {
        warn!(error = %message, "hub reported an error during the session");
    }
    session.close().await;
    println!("{}", summary(&session.state()));
    Ok(())
}

fn report(session: &MatchSession, printed: &mut usize) {
    let state = session.state();
    debug!(
        tick = state.tick,
        score = %state.score_line(),
        status = ?state.status,
        possession = state.possession.label(),
        "state"
    );
    session.with_events(|log| {
        for event in log.iter().skip(*printed) {
            info!(
                minute = event.minute,
                kind = ?event.kind,
                side = event.side.label(),
                key = event.is_key_event(),
                "{}",
                event.description
            );
        }
        *printed = log.len();
    });
}

fn summary(state: &MatchState) -> String {
    format!(
        "tick {} | {} | {:?}",
        state.tick,
        state.score_line(),
        state.status
    )
}

enum Action {
    Pause,
    Resume,
    Speech(SpeechArgs),
}

async fn control(config: &ClientConfig, match_id: MatchId, action: Action) -> Result<()> {
    let session = MatchSession::open(SessionDeps::from_config(config)?, match_id).await?;
    let outcome: Result<CommandAck, CommandError> = match session.commands() {
        Some(commands) => match action {
            Action::Pause => commands.pause().await,
            Action::Resume => commands.resume().await,
            Action::Speech(args) => {
                commands
                    .give_speech(args.side.into(), args.kind, args.player)
                    .await
            }
        },
        None => Err(CommandError::NotConnected),
    };
    session.close().await;

    let ack = outcome.map_err(|err| anyhow!("{err}"))?;
    println!("{} acknowledged", ack.kind);
    Ok(())
}

async fn rest_only(config: &ClientConfig, match_id: MatchId, simulate: bool) -> Result<()> {
    let tokens: Arc<dyn TokenSource> = Arc::new(StaticToken::from(config.token.clone()));
    let api = ReqwestMatchApi::new(config.api_url.clone(), tokens)?;
    let loader = FallbackLoader::new(Arc::new(api), Normalizer::new(config.ticks_per_minute));
    let reconciler = StateReconciler::new();
    let events = Mutex::new(EventLog::new());

    let snapshot: MatchSnapshot = if simulate {
        loader
            .simulate_remainder(&match_id, &reconciler, &events)
            .await?
    } else {
        loader.load(&match_id, &reconciler, &events).await?
    };

    if !snapshot.info.is_empty() {
        println!("{} vs {}", snapshot.info.home.name, snapshot.info.away.name);
    }
    for event in events.lock().iter() {
        println!("{:>3}' {:?} {}", event.minute, event.kind, event.description);
    }
    println!("{}", summary(&reconciler.snapshot()));
    Ok(())
}
