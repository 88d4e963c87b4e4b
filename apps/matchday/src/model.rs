use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a match on the simulation server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchId(String);

impl MatchId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MatchId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for MatchId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    #[default]
    Home,
    Away,
}

impl Side {
    pub fn label(self) -> &'static str {
        match self {
            Side::Home => "home",
            Side::Away => "away",
        }
    }

    pub fn is_home(self) -> bool {
        matches!(self, Side::Home)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    #[default]
    InProgress,
    HalfTime,
    Paused,
    Finished,
}

impl MatchStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, MatchStatus::Finished)
    }

    /// `Finished` absorbs every later status; the other states move freely
    /// (half time resumes into play, pause toggles both ways).
    pub fn can_transition_to(self, next: MatchStatus) -> bool {
        !self.is_finished() || next.is_finished()
    }
}

/// Ball location in the normalized pitch space, both axes in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BallPosition {
    pub x: f64,
    pub y: f64,
}

impl BallPosition {
    pub const CENTER: BallPosition = BallPosition { x: 0.5, y: 0.5 };

    pub fn clamped(x: f64, y: f64) -> Self {
        Self {
            x: x.clamp(0.0, 1.0),
            y: y.clamp(0.0, 1.0),
        }
    }
}

impl Default for BallPosition {
    fn default() -> Self {
        Self::CENTER
    }
}

pub const MOMENTUM_MIN: f64 = 0.0;
pub const MOMENTUM_MAX: f64 = 100.0;
pub const MOMENTUM_NEUTRAL: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Momentum {
    pub home: f64,
    pub away: f64,
}

impl Momentum {
    pub fn clamped(home: f64, away: f64) -> Self {
        Self {
            home: home.clamp(MOMENTUM_MIN, MOMENTUM_MAX),
            away: away.clamp(MOMENTUM_MIN, MOMENTUM_MAX),
        }
    }
}

impl Default for Momentum {
    fn default() -> Self {
        Self {
            home: MOMENTUM_NEUTRAL,
            away: MOMENTUM_NEUTRAL,
        }
    }
}

/// Continuous match state, one instance per session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchState {
    pub tick: u64,
    pub ball: BallPosition,
    pub home_score: u32,
    pub away_score: u32,
    pub status: MatchStatus,
    pub possession: Side,
    pub momentum: Momentum,
}

impl MatchState {
    pub fn score_line(&self) -> String {
        format!("{}-{}", self.home_score, self.away_score)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identity for events delivered without a server id. Deterministic so a
    /// redelivered event collapses onto the first copy.
    pub fn synthesize(tick: u64, description: &str) -> Self {
        Self(format!("{tick}:{description}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Goal,
    OwnGoal,
    YellowCard,
    RedCard,
    Substitution,
    Shot,
    Save,
    Foul,
    Corner,
    Offside,
    Injury,
    KickOff,
    HalfTime,
    FullTime,
    Commentary,
    Other(String),
}

impl EventKind {
    pub fn from_wire(raw: &str) -> Self {
        let folded: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match folded.as_str() {
            "goal" => EventKind::Goal,
            "owngoal" => EventKind::OwnGoal,
            "yellowcard" | "yellow" | "card" | "booking" => EventKind::YellowCard,
            "redcard" | "red" | "sendingoff" => EventKind::RedCard,
            "substitution" | "sub" => EventKind::Substitution,
            "shot" | "shotontarget" | "shotofftarget" => EventKind::Shot,
            "save" => EventKind::Save,
            "foul" => EventKind::Foul,
            "corner" => EventKind::Corner,
            "offside" => EventKind::Offside,
            "injury" => EventKind::Injury,
            "kickoff" => EventKind::KickOff,
            "halftime" => EventKind::HalfTime,
            "fulltime" => EventKind::FullTime,
            "" | "commentary" | "comment" | "info" => EventKind::Commentary,
            _ => EventKind::Other(raw.to_string()),
        }
    }

    pub fn is_goal(&self) -> bool {
        matches!(self, EventKind::Goal | EventKind::OwnGoal)
    }

    pub fn is_card(&self) -> bool {
        matches!(self, EventKind::YellowCard | EventKind::RedCard)
    }
}

/// Discrete match event; write-once after it enters the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchEvent {
    pub id: EventId,
    pub tick: u64,
    pub minute: u32,
    pub kind: EventKind,
    pub side: Side,
    pub description: String,
    pub primary_player: Option<String>,
    pub secondary_player: Option<String>,
    pub is_key: bool,
    pub is_important: bool,
}

impl MatchEvent {
    /// Key events drive the condensed timeline. Goals and cards always count
    /// even when the server forgets to flag them.
    pub fn is_key_event(&self) -> bool {
        self.is_key || self.kind.is_goal() || self.kind.is_card()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TeamSheet {
    pub name: String,
    pub formation: Option<String>,
    pub roster: Vec<String>,
}

/// Static session metadata, set once per session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchInfo {
    pub home: TeamSheet,
    pub away: TeamSheet,
    /// Clock rate announced at kickoff; overrides the client default for
    /// minute derivation.
    pub ticks_per_minute: Option<u32>,
}

impl MatchInfo {
    pub fn team(&self, side: Side) -> &TeamSheet {
        match side {
            Side::Home => &self.home,
            Side::Away => &self.away,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.home.name.is_empty() && self.away.name.is_empty() && self.ticks_per_minute.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finished_is_absorbing() {
        assert!(MatchStatus::InProgress.can_transition_to(MatchStatus::Paused));
        assert!(MatchStatus::Paused.can_transition_to(MatchStatus::InProgress));
        assert!(MatchStatus::HalfTime.can_transition_to(MatchStatus::InProgress));
        assert!(MatchStatus::Finished.can_transition_to(MatchStatus::Finished));
        assert!(!MatchStatus::Finished.can_transition_to(MatchStatus::InProgress));
        assert!(!MatchStatus::Finished.can_transition_to(MatchStatus::Paused));
    }

    #[test]
    fn event_kind_parsing_is_case_and_separator_tolerant() {
        assert_eq!(EventKind::from_wire("Goal"), EventKind::Goal);
        assert_eq!(EventKind::from_wire("YELLOW_CARD"), EventKind::YellowCard);
        assert_eq!(EventKind::from_wire("red-card"), EventKind::RedCard);
        assert_eq!(EventKind::from_wire("kickOff"), EventKind::KickOff);
        assert_eq!(EventKind::from_wire(""), EventKind::Commentary);
        assert_eq!(
            EventKind::from_wire("VarReview"),
            EventKind::Other("VarReview".into())
        );
    }

    #[test]
    fn goals_and_cards_are_key_events_without_flag() {
        let mut event = MatchEvent {
            id: EventId::new("e1"),
            tick: 10,
            minute: 0,
            kind: EventKind::Commentary,
            side: Side::Home,
            description: "Pass".into(),
            primary_player: None,
            secondary_player: None,
            is_key: false,
            is_important: false,
        };
        assert!(!event.is_key_event());
        event.kind = EventKind::RedCard;
        assert!(event.is_key_event());
        event.kind = EventKind::Commentary;
        event.is_key = true;
        assert!(event.is_key_event());
    }

    #[test]
    fn synthesized_ids_are_deterministic() {
        assert_eq!(
            EventId::synthesize(42, "Corner to the home side"),
            EventId::synthesize(42, "Corner to the home side")
        );
        assert_ne!(EventId::synthesize(42, "a"), EventId::synthesize(43, "a"));
    }
}
