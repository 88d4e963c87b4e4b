use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::connection::{ConnectionManager, InvokeError};
use crate::model::{MatchId, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Pause,
    Resume,
    StartMatch,
    GiveSpeech,
    ChangeTactics,
}

impl CommandKind {
    /// Hub method the command invokes.
    pub fn method(self) -> &'static str {
        match self {
            CommandKind::Pause => "PauseMatch",
            CommandKind::Resume => "ResumeMatch",
            CommandKind::StartMatch => "StartMatch",
            CommandKind::GiveSpeech => "GiveSpeech",
            CommandKind::ChangeTactics => "ChangeTactics",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum SpeechKind {
    Encourage,
    Praise,
    Calm,
    Demand,
    Criticise,
    FocusDefence,
    FocusAttack,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMatchRequest {
    pub match_id: MatchId,
    pub home_team_id: String,
    pub away_team_id: String,
    pub speed_multiplier: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GiveSpeechRequest {
    pub match_id: MatchId,
    pub side: Side,
    pub speech: SpeechKind,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub target_player: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeTacticsRequest {
    pub match_id: MatchId,
    pub side: Side,
    pub formation: String,
    pub mentality: String,
    pub pressing: String,
    pub tempo: String,
}

/// The simulation accepted the command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandAck {
    pub kind: CommandKind,
    pub result: Option<Value>,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CommandError {
    #[error("not connected to the match hub")]
    NotConnected,
    #[error("{kind} rejected: {reason}")]
    Rejected { kind: CommandKind, reason: String },
    #[error("{kind} not acknowledged within {after:?}")]
    Timeout { kind: CommandKind, after: Duration },
    #[error("connection lost before {kind} was acknowledged")]
    ConnectionLost { kind: CommandKind },
    #[error("invalid {kind} request: {reason}")]
    Invalid { kind: CommandKind, reason: String },
}

impl CommandError {
    fn from_invoke(kind: CommandKind, err: InvokeError) -> Self {
        match err {
            InvokeError::NotConnected => CommandError::NotConnected,
            InvokeError::Rejected(reason) => CommandError::Rejected { kind, reason },
            InvokeError::Timeout(after) => CommandError::Timeout { kind, after },
            InvokeError::ConnectionLost => CommandError::ConnectionLost { kind },
            InvokeError::Encode(reason) => CommandError::Invalid { kind, reason },
        }
    }
}

/// Named control actions for one match. Each call is a single invocation
/// with no retry; a disconnected channel fails immediately.
#[derive(Clone)]
pub struct CommandDispatcher {
    connection: Arc<ConnectionManager>,
    match_id: MatchId,
}

impl fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("match_id", &self.match_id)
            .finish()
    }
}

impl CommandDispatcher {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        let match_id = connection.match_id().clone();
        Self {
            connection,
            match_id,
        }
    }

    pub fn match_id(&self) -> &MatchId {
        &self.match_id
    }

    pub async fn pause(&self) -> Result<CommandAck, CommandError> {
        self.send(CommandKind::Pause, json!(self.match_id)).await
    }

    pub async fn resume(&self) -> Result<CommandAck, CommandError> {
        self.send(CommandKind::Resume, json!(self.match_id)).await
    }

    pub async fn start(
        &self,
        home_team_id: impl Into<String>,
        away_team_id: impl Into<String>,
        speed_multiplier: f64,
    ) -> Result<CommandAck, CommandError> {
        let kind = CommandKind::StartMatch;
        if !(speed_multiplier.is_finite() && speed_multiplier > 0.0) {
            return Err(CommandError::Invalid {
                kind,
                reason: format!("speed multiplier must be positive, got {speed_multiplier}"),
            });
        }
        let request = StartMatchRequest {
            match_id: self.match_id.clone(),
            home_team_id: home_team_id.into(),
            away_team_id: away_team_id.into(),
            speed_multiplier,
        };
        self.send_dto(kind, &request).await
    }

    pub async fn give_speech(
        &self,
        side: Side,
        speech: SpeechKind,
        target_player: Option<String>,
    ) -> Result<CommandAck, CommandError> {
        let request = GiveSpeechRequest {
            match_id: self.match_id.clone(),
            side,
            speech,
            target_player,
        };
        self.send_dto(CommandKind::GiveSpeech, &request).await
    }

    pub async fn change_tactics(
        &self,
        side: Side,
        formation: impl Into<String>,
        mentality: impl Into<String>,
        pressing: impl Into<String>,
        tempo: impl Into<String>,
    ) -> Result<CommandAck, CommandError> {
        let kind = CommandKind::ChangeTactics;
        let formation = formation.into();
        if formation.trim().is_empty() {
            return Err(CommandError::Invalid {
                kind,
                reason: "formation is required".into(),
            });
        }
        let request = ChangeTacticsRequest {
            match_id: self.match_id.clone(),
            side,
            formation,
            mentality: mentality.into(),
            pressing: pressing.into(),
            tempo: tempo.into(),
        };
        self.send_dto(kind, &request).await
    }

    async fn send_dto<T: Serialize>(
        &self,
        kind: CommandKind,
        dto: &T,
    ) -> Result<CommandAck, CommandError> {
        let payload = serde_json::to_value(dto).map_err(|err| CommandError::Invalid {
            kind,
            reason: err.to_string(),
        })?;
        self.send(kind, payload).await
    }

    async fn send(&self, kind: CommandKind, argument: Value) -> Result<CommandAck, CommandError> {
        match self.connection.invoke(kind.method(), vec![argument]).await {
            Ok(result) => {
                debug!(
                    target = "matchday::commands",
                    match_id = %self.match_id,
                    command = %kind,
                    "command acknowledged"
                );
                Ok(CommandAck { kind, result })
            }
            Err(err) => {
                let err = CommandError::from_invoke(kind, err);
                warn!(
                    target = "matchday::commands",
                    match_id = %self.match_id,
                    command = %kind,
                    error = %err,
                    "command failed"
                );
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionConfig, ReconnectPolicy};
    use crate::transport::{HubEndpoint, MockHub, MockPeer, MockTransport};

    async fn connected() -> (CommandDispatcher, MockHub, MockPeer) {
        let (transport, mut hub) = MockTransport::pair();
        let config = ConnectionConfig::new(HubEndpoint::new(
            url::Url::parse("ws://mock/hubs/match").unwrap(),
            None,
        ))
        .with_invoke_timeout(Duration::from_millis(300))
        .with_reconnect(ReconnectPolicy::disabled());
        let connection = Arc::new(ConnectionManager::new(
            MatchId::new("m-7"),
            Arc::new(transport),
            config,
        ));
        let hub_side = tokio::spawn(async move {
            let mut peer = hub.next_peer().await.expect("peer");
            peer.accept_join().await.expect("join");
            (hub, peer)
        });
        connection.connect().await.expect("connect");
        let (hub, peer) = hub_side.await.unwrap();
        (CommandDispatcher::new(connection), hub, peer)
    }

    #[test]
    fn speech_request_uses_camel_case() {
        let request = GiveSpeechRequest {
            match_id: MatchId::new("m-1"),
            side: Side::Away,
            speech: SpeechKind::FocusDefence,
            target_player: None,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"matchId": "m-1", "side": "away", "speech": "FocusDefence"})
        );
    }

    #[tokio::test]
    async fn pause_sends_match_id_and_returns_ack() {
        let (commands, _hub, mut peer) = connected().await;
        let pending = {
            let commands = commands.clone();
            tokio::spawn(async move { commands.pause().await })
        };
        let call = peer.expect_call().await.expect("pause");
        assert_eq!(call.target, "PauseMatch");
        assert_eq!(call.arguments, vec![json!("m-7")]);
        peer.complete(&call, None);
        let ack = pending.await.unwrap().unwrap();
        assert_eq!(ack.kind, CommandKind::Pause);
    }

    #[tokio::test]
    async fn rejected_command_reports_reason() {
        let (commands, _hub, mut peer) = connected().await;
        let pending = {
            let commands = commands.clone();
            tokio::spawn(async move {
                commands
                    .change_tactics(Side::Home, "4-4-2", "Attacking", "High", "Fast")
                    .await
            })
        };
        let call = peer.expect_call().await.expect("tactics");
        assert_eq!(call.arguments[0]["formation"], "4-4-2");
        assert_eq!(call.arguments[0]["side"], "home");
        peer.reject(&call, "match finished");
        assert_eq!(
            pending.await.unwrap(),
            Err(CommandError::Rejected {
                kind: CommandKind::ChangeTactics,
                reason: "match finished".into()
            })
        );
    }

    #[tokio::test]
    async fn invalid_requests_never_reach_the_hub() {
        let (commands, _hub, _peer) = connected().await;
        assert!(matches!(
            commands.start("a", "b", 0.0).await,
            Err(CommandError::Invalid { kind: CommandKind::StartMatch, .. })
        ));
        assert!(matches!(
            commands.change_tactics(Side::Away, " ", "", "", "").await,
            Err(CommandError::Invalid { .. })
        ));
    }

    #[tokio::test]
    async fn commands_after_disconnect_fail_fast() {
        let (commands, hub, _peer) = connected().await;
        commands.connection.disconnect().await;
        let opens = hub.opens();
        assert_eq!(commands.resume().await, Err(CommandError::NotConnected));
        assert_eq!(
            commands
                .give_speech(Side::Home, SpeechKind::Encourage, None)
                .await,
            Err(CommandError::NotConnected)
        );
        assert_eq!(hub.opens(), opens);
    }
}
