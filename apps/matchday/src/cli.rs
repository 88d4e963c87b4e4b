use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::commands::SpeechKind;
use crate::model::Side;
use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "matchday",
    about = "Follow and control a live match simulation",
    version
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "MATCHDAY_HUB_URL",
        help = "Push hub url (bare hosts get ws:// or wss://)"
    )]
    pub hub_url: Option<String>,

    #[arg(
        long,
        global = true,
        env = "MATCHDAY_API_URL",
        help = "Base url of the match REST api"
    )]
    pub api_url: Option<String>,

    #[arg(
        long,
        global = true,
        env = "MATCHDAY_TOKEN",
        hide_env_values = true,
        help = "Bearer token for the hub and api"
    )]
    pub token: Option<String>,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "MATCHDAY_LOG_LEVEL",
        default_value_t = LogLevel::Info,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "MATCHDAY_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Follow a match, logging state changes and events until it ends
    Watch(MatchArgs),
    /// Pause a running match
    Pause(MatchArgs),
    /// Resume a paused match
    Resume(MatchArgs),
    /// Deliver a team talk
    Speech(SpeechArgs),
    /// Fetch the current snapshot over the REST api only
    Snapshot(MatchArgs),
    /// Play out the rest of the match on the server
    Simulate(MatchArgs),
}

#[derive(Args, Debug, Clone)]
pub struct MatchArgs {
    #[arg(value_name = "MATCH_ID", help = "Match identifier")]
    pub match_id: String,
}

#[derive(Args, Debug, Clone)]
pub struct SpeechArgs {
    #[arg(value_name = "MATCH_ID", help = "Match identifier")]
    pub match_id: String,

    #[arg(long, value_enum, default_value_t = CliSide::Home)]
    pub side: CliSide,

    #[arg(long, value_enum)]
    pub kind: SpeechKind,

    #[arg(long, value_name = "PLAYER", help = "Address a single player")]
    pub player: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliSide {
    Home,
    Away,
}

impl From<CliSide> for Side {
    fn from(side: CliSide) -> Self {
        match side {
            CliSide::Home => Side::Home,
            CliSide::Away => Side::Away,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_speech_command() {
        let cli = Cli::try_parse_from([
            "matchday",
            "speech",
            "m-1",
            "--side",
            "away",
            "--kind",
            "focus-attack",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(cli.logging.level, LogLevel::Debug);
        match cli.command {
            Command::Speech(args) => {
                assert_eq!(args.match_id, "m-1");
                assert_eq!(Side::from(args.side), Side::Away);
                assert_eq!(args.kind, SpeechKind::FocusAttack);
                assert_eq!(args.player, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn watch_requires_match_id() {
        assert!(Cli::try_parse_from(["matchday", "watch"]).is_err());
    }
}
