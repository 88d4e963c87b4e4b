//! Canonical records from loosely-typed wire payloads.
//!
//! The simulation server serializes with its runtime's PascalCase while the
//! client contract is camelCase, and older endpoints leak snake_case. Every
//! canonical field owns an alias list; lookup walks that list once and falls
//! back to the field's documented default. Nothing here returns an error:
//! malformed or missing values degrade to defaults and unknown keys are
//! ignored.

use serde_json::{Map, Value};

use crate::model::{
    BallPosition, EventId, EventKind, MOMENTUM_NEUTRAL, MatchEvent, MatchInfo, MatchState,
    MatchStatus, Momentum, Side, TeamSheet,
};

pub const DEFAULT_TICKS_PER_MINUTE: u32 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Tick,
    Ball,
    BallX,
    BallY,
    X,
    Y,
    HomeScore,
    AwayScore,
    Status,
    HomePossession,
    Possession,
    Momentum,
    HomeMomentum,
    AwayMomentum,
    Home,
    Away,
    EventId,
    Minute,
    EventType,
    IsHomeTeam,
    Team,
    Description,
    PlayerName,
    SecondaryPlayerName,
    IsKeyEvent,
    IsImportant,
    HomeTeam,
    AwayTeam,
    HomeTeamName,
    AwayTeamName,
    HomeFormation,
    AwayFormation,
    Name,
    Formation,
    Players,
    TicksPerMinute,
    Events,
    Data,
}

impl Field {
    pub const ALL: &'static [Field] = &[
        Field::Tick,
        Field::Ball,
        Field::BallX,
        Field::BallY,
        Field::X,
        Field::Y,
        Field::HomeScore,
        Field::AwayScore,
        Field::Status,
        Field::HomePossession,
        Field::Possession,
        Field::Momentum,
        Field::HomeMomentum,
        Field::AwayMomentum,
        Field::Home,
        Field::Away,
        Field::EventId,
        Field::Minute,
        Field::EventType,
        Field::IsHomeTeam,
        Field::Team,
        Field::Description,
        Field::PlayerName,
        Field::SecondaryPlayerName,
        Field::IsKeyEvent,
        Field::IsImportant,
        Field::HomeTeam,
        Field::AwayTeam,
        Field::HomeTeamName,
        Field::AwayTeamName,
        Field::HomeFormation,
        Field::AwayFormation,
        Field::Name,
        Field::Formation,
        Field::Players,
        Field::TicksPerMinute,
        Field::Events,
        Field::Data,
    ];

    /// Accepted spellings, client convention first.
    pub const fn aliases(self) -> &'static [&'static str] {
        match self {
            Field::Tick => &["tick", "Tick", "currentTick", "CurrentTick"],
            Field::Ball => &["ball", "Ball", "ballPosition", "BallPosition"],
            Field::BallX => &["ballX", "BallX", "ball_x"],
            Field::BallY => &["ballY", "BallY", "ball_y"],
            Field::X => &["x", "X"],
            Field::Y => &["y", "Y"],
            Field::HomeScore => &["homeScore", "HomeScore", "home_score"],
            Field::AwayScore => &["awayScore", "AwayScore", "away_score"],
            Field::Status => &["status", "Status", "matchStatus", "MatchStatus"],
            Field::HomePossession => &[
                "homePossession",
                "HomePossession",
                "isHomePossession",
                "IsHomePossession",
                "home_possession",
            ],
            Field::Possession => &["possession", "Possession"],
            Field::Momentum => &["momentum", "Momentum"],
            Field::HomeMomentum => &["homeMomentum", "HomeMomentum", "home_momentum"],
            Field::AwayMomentum => &["awayMomentum", "AwayMomentum", "away_momentum"],
            Field::Home => &["home", "Home"],
            Field::Away => &["away", "Away"],
            Field::EventId => &["id", "Id", "eventId", "EventId", "event_id"],
            Field::Minute => &["minute", "Minute"],
            Field::EventType => &["type", "Type", "eventType", "EventType", "event_type"],
            Field::IsHomeTeam => &["isHomeTeam", "IsHomeTeam", "is_home_team"],
            Field::Team => &["team", "Team", "side", "Side"],
            Field::Description => &["description", "Description", "text", "Text"],
            Field::PlayerName => &["playerName", "PlayerName", "player_name"],
            Field::SecondaryPlayerName => &[
                "secondaryPlayerName",
                "SecondaryPlayerName",
                "assistPlayerName",
                "AssistPlayerName",
                "secondary_player_name",
            ],
            Field::IsKeyEvent => &["isKeyEvent", "IsKeyEvent", "is_key_event"],
            Field::IsImportant => &["isImportant", "IsImportant", "is_important"],
            Field::HomeTeam => &["homeTeam", "HomeTeam", "home_team"],
            Field::AwayTeam => &["awayTeam", "AwayTeam", "away_team"],
            Field::HomeTeamName => &["homeTeamName", "HomeTeamName", "home_team_name"],
            Field::AwayTeamName => &["awayTeamName", "AwayTeamName", "away_team_name"],
            Field::HomeFormation => &["homeFormation", "HomeFormation", "home_formation"],
            Field::AwayFormation => &["awayFormation", "AwayFormation", "away_formation"],
            Field::Name => &["name", "Name", "teamName", "TeamName"],
            Field::Formation => &["formation", "Formation"],
            Field::Players => &["players", "Players", "roster", "Roster", "lineup", "Lineup"],
            Field::TicksPerMinute => &["ticksPerMinute", "TicksPerMinute", "ticks_per_minute"],
            Field::Events => &["events", "Events", "matchEvents", "MatchEvents"],
            Field::Data => &["data", "Data"],
        }
    }
}

/// Read-only view over one JSON object. Non-object values behave as an empty
/// object, so every lookup yields its default.
#[derive(Debug, Clone, Copy)]
pub struct Payload<'a> {
    map: Option<&'a Map<String, Value>>,
}

impl<'a> Payload<'a> {
    pub fn new(value: &'a Value) -> Self {
        Self {
            map: value.as_object(),
        }
    }

    pub fn get(&self, field: Field) -> Option<&'a Value> {
        let map = self.map?;
        field
            .aliases()
            .iter()
            .find_map(|alias| map.get(*alias))
            .filter(|value| !value.is_null())
    }

    pub fn object(&self, field: Field) -> Option<Payload<'a>> {
        self.get(field)
            .filter(|value| value.is_object())
            .map(Payload::new)
    }

    pub fn f64(&self, field: Field) -> Option<f64> {
        self.get(field).and_then(as_f64)
    }

    pub fn f64_or(&self, field: Field, default: f64) -> f64 {
        self.f64(field).unwrap_or(default)
    }

    pub fn u64(&self, field: Field) -> Option<u64> {
        self.f64(field).map(|v| v.max(0.0) as u64)
    }

    pub fn u64_or(&self, field: Field, default: u64) -> u64 {
        self.u64(field).unwrap_or(default)
    }

    pub fn u32_or(&self, field: Field, default: u32) -> u32 {
        self.f64(field)
            .map(|v| v.clamp(0.0, u32::MAX as f64) as u32)
            .unwrap_or(default)
    }

    pub fn bool(&self, field: Field) -> Option<bool> {
        self.get(field).and_then(as_bool)
    }

    pub fn bool_or(&self, field: Field, default: bool) -> bool {
        self.bool(field).unwrap_or(default)
    }

    pub fn string(&self, field: Field) -> Option<String> {
        match self.get(field)? {
            Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn array(&self, field: Field) -> &'a [Value] {
        self.get(field)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite())
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|v| v != 0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn parse_side(value: &Value) -> Option<Side> {
    match value {
        Value::Bool(true) => Some(Side::Home),
        Value::Bool(false) => Some(Side::Away),
        Value::Number(n) => match n.as_i64()? {
            0 => Some(Side::Home),
            1 => Some(Side::Away),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "home" | "h" => Some(Side::Home),
            "away" | "a" => Some(Side::Away),
            _ => None,
        },
        _ => None,
    }
}

/// Accepts status names in any casing/separator style or the server's enum
/// ordinal.
pub fn parse_status(value: &Value) -> Option<MatchStatus> {
    match value {
        Value::Number(n) => match n.as_i64()? {
            0 => Some(MatchStatus::InProgress),
            1 => Some(MatchStatus::HalfTime),
            2 => Some(MatchStatus::Paused),
            3 => Some(MatchStatus::Finished),
            _ => None,
        },
        Value::String(s) => {
            let folded: String = s
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .map(|c| c.to_ascii_lowercase())
                .collect();
            match folded.as_str() {
                "inprogress" | "live" | "playing" | "running" | "firsthalf" | "secondhalf" => {
                    Some(MatchStatus::InProgress)
                }
                "halftime" => Some(MatchStatus::HalfTime),
                "paused" => Some(MatchStatus::Paused),
                "finished" | "fulltime" | "completed" | "ended" => Some(MatchStatus::Finished),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Fallback snapshot: everything needed to seed a session without a push
/// channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchSnapshot {
    pub state: MatchState,
    pub info: MatchInfo,
    pub events: Vec<MatchEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Normalizer {
    ticks_per_minute: u32,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(DEFAULT_TICKS_PER_MINUTE)
    }
}

impl Normalizer {
    pub fn new(ticks_per_minute: u32) -> Self {
        Self {
            ticks_per_minute: ticks_per_minute.max(1),
        }
    }

    pub fn ticks_per_minute(&self) -> u32 {
        self.ticks_per_minute
    }

    /// Same normalizer, clocked at the rate the match announced if it did.
    pub fn for_info(self, info: &MatchInfo) -> Self {
        match info.ticks_per_minute {
            Some(rate) => Self::new(rate),
            None => self,
        }
    }

    /// Tick carried by a state payload. Result-only pushes omit it.
    pub fn tick(&self, value: &Value) -> Option<u64> {
        Payload::new(value).u64(Field::Tick)
    }

    pub fn snapshot_tick(&self, value: &Value) -> Option<u64> {
        self.tick(envelope(value))
    }

    pub fn state(&self, value: &Value) -> MatchState {
        let payload = Payload::new(value);

        let ball = match payload.object(Field::Ball) {
            Some(nested) => BallPosition::clamped(
                nested.f64_or(Field::X, BallPosition::CENTER.x),
                nested.f64_or(Field::Y, BallPosition::CENTER.y),
            ),
            None => BallPosition::clamped(
                payload.f64_or(Field::BallX, BallPosition::CENTER.x),
                payload.f64_or(Field::BallY, BallPosition::CENTER.y),
            ),
        };

        let possession = payload
            .bool(Field::HomePossession)
            .map(|home| if home { Side::Home } else { Side::Away })
            .or_else(|| payload.get(Field::Possession).and_then(parse_side))
            .unwrap_or_default();

        let momentum = match payload.object(Field::Momentum) {
            Some(nested) => Momentum::clamped(
                nested.f64_or(Field::Home, MOMENTUM_NEUTRAL),
                nested.f64_or(Field::Away, MOMENTUM_NEUTRAL),
            ),
            None => Momentum::clamped(
                payload.f64_or(Field::HomeMomentum, MOMENTUM_NEUTRAL),
                payload.f64_or(Field::AwayMomentum, MOMENTUM_NEUTRAL),
            ),
        };

        MatchState {
            tick: payload.u64_or(Field::Tick, 0),
            ball,
            home_score: payload.u32_or(Field::HomeScore, 0),
            away_score: payload.u32_or(Field::AwayScore, 0),
            status: payload
                .get(Field::Status)
                .and_then(parse_status)
                .unwrap_or_default(),
            possession,
            momentum,
        }
    }

    pub fn event(&self, value: &Value) -> MatchEvent {
        let payload = Payload::new(value);
        let tick = payload.u64_or(Field::Tick, 0);
        let description = payload.string(Field::Description).unwrap_or_default();
        let id = payload
            .string(Field::EventId)
            .map(EventId::new)
            .unwrap_or_else(|| EventId::synthesize(tick, &description));
        let minute = payload
            .f64(Field::Minute)
            .map(|m| m.max(0.0) as u32)
            .unwrap_or_else(|| self.minute_for(tick));
        let side = payload
            .bool(Field::IsHomeTeam)
            .map(|home| if home { Side::Home } else { Side::Away })
            .or_else(|| payload.get(Field::Team).and_then(parse_side))
            .unwrap_or_default();

        MatchEvent {
            id,
            tick,
            minute,
            kind: EventKind::from_wire(&payload.string(Field::EventType).unwrap_or_default()),
            side,
            description,
            primary_player: payload.string(Field::PlayerName),
            secondary_player: payload.string(Field::SecondaryPlayerName),
            is_key: payload.bool_or(Field::IsKeyEvent, false),
            is_important: payload.bool_or(Field::IsImportant, false),
        }
    }

    pub fn info(&self, value: &Value) -> MatchInfo {
        let payload = Payload::new(value);
        MatchInfo {
            home: team_sheet(
                &payload,
                Field::HomeTeam,
                Field::HomeTeamName,
                Field::HomeFormation,
            ),
            away: team_sheet(
                &payload,
                Field::AwayTeam,
                Field::AwayTeamName,
                Field::AwayFormation,
            ),
            ticks_per_minute: payload
                .u64(Field::TicksPerMinute)
                .filter(|rate| *rate > 0)
                .map(|rate| rate.min(u64::from(u32::MAX)) as u32),
        }
    }

    /// Request/response match representation, optionally wrapped in a `data`
    /// envelope.
    pub fn snapshot(&self, value: &Value) -> MatchSnapshot {
        let body = envelope(value);
        let payload = Payload::new(body);
        let info = self.info(body);
        let clock = self.for_info(&info);
        MatchSnapshot {
            state: self.state(body),
            events: payload
                .array(Field::Events)
                .iter()
                .map(|event| clock.event(event))
                .collect(),
            info,
        }
    }

    pub fn minute_for(&self, tick: u64) -> u32 {
        (tick / u64::from(self.ticks_per_minute)).min(u64::from(u32::MAX)) as u32
    }
}

fn envelope(value: &Value) -> &Value {
    Payload::new(value)
        .get(Field::Data)
        .filter(|inner| inner.is_object())
        .unwrap_or(value)
}

fn team_sheet(
    payload: &Payload<'_>,
    nested: Field,
    flat_name: Field,
    flat_formation: Field,
) -> TeamSheet {
    let team = payload.object(nested);
    let name = team
        .and_then(|t| t.string(Field::Name))
        .or_else(|| payload.string(flat_name))
        .unwrap_or_default();
    let formation = team
        .and_then(|t| t.string(Field::Formation))
        .or_else(|| payload.string(flat_formation));
    let roster = team
        .map(|t| {
            t.array(Field::Players)
                .iter()
                .filter_map(|player| match player {
                    Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
                    Value::Object(_) => Payload::new(player)
                        .string(Field::Name)
                        .or_else(|| Payload::new(player).string(Field::PlayerName)),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    TeamSheet {
        name,
        formation,
        roster,
    }
}
