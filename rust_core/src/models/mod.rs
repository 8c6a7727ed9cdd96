// Shared models for the scoreboard relay
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::RelayError;

/// Longest identifier accepted for clients and channels
pub const MAX_ID_LEN: usize = 64;

fn is_valid_id(raw: &str) -> bool {
    !raw.is_empty()
        && raw.len() <= MAX_ID_LEN
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

// ============================================================================
// Identifiers
// ============================================================================

/// Identifier assigned to a viewer connection by the gateway.
///
/// Lives exactly as long as the underlying connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Generate a fresh random id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Validate a caller supplied id (e.g. a reconnect hint)
    pub fn parse(raw: &str) -> Result<Self, RelayError> {
        let trimmed = raw.trim();
        if is_valid_id(trimmed) {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(RelayError::InvalidClientId(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a watchable game (one scoreboard feed).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn parse(raw: &str) -> Result<Self, RelayError> {
        let trimmed = raw.trim();
        if is_valid_id(trimmed) {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(RelayError::InvalidChannelId(raw.to_string()))
        }
    }

    /// Channel for a gamesheet within a division: `{division}-{gamesheet}`
    pub fn from_gamesheet(division_id: &str, gamesheet_id: &str) -> Result<Self, RelayError> {
        Self::parse(&format!("{}-{}", division_id.trim(), gamesheet_id.trim()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Game state and updates
// ============================================================================

/// Opaque game state as last reported by a producer.
pub type GameSnapshot = Map<String, Value>;

/// Partial state update emitted by a producer for one channel.
///
/// Immutable once created; consumed by the broadcaster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEnvelope {
    pub channel_id: ChannelId,
    pub changed_fields: GameSnapshot,
    pub produced_at: DateTime<Utc>,
    /// Session generation that produced this envelope
    #[serde(skip)]
    pub session_epoch: u64,
    /// Set for a snapshot meant for one newly joined client only
    #[serde(skip)]
    pub recipient: Option<ClientId>,
}

impl UpdateEnvelope {
    pub fn new(channel_id: ChannelId, changed_fields: GameSnapshot, session_epoch: u64) -> Self {
        Self {
            channel_id,
            changed_fields,
            produced_at: Utc::now(),
            session_epoch,
            recipient: None,
        }
    }

    /// Full state addressed to a single client
    pub fn snapshot(
        channel_id: ChannelId,
        state: GameSnapshot,
        session_epoch: u64,
        recipient: ClientId,
    ) -> Self {
        Self {
            recipient: Some(recipient),
            ..Self::new(channel_id, state, session_epoch)
        }
    }

    /// Serialized form written to client transports
    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Compute the fields of `current` that differ from `previous`.
///
/// Values are compared deeply. With no previous state every field counts as changed.
pub fn changed_fields(previous: Option<&GameSnapshot>, current: &GameSnapshot) -> GameSnapshot {
    match previous {
        None => current.clone(),
        Some(prev) => current
            .iter()
            .filter(|(key, value)| prev.get(key.as_str()) != Some(*value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
    }
}

// ============================================================================
// Lifecycle states
// ============================================================================

/// Run state of an upstream session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Starting,
    Running,
    Stopping,
}

impl SessionStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, SessionStatus::Starting | SessionStatus::Running)
    }
}

/// Lifecycle of a single viewer connection. No transition back from `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

// ============================================================================
// Gamesheet record
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlayerGoal {
    pub team_name: Option<String>,
    pub team_id: Option<String>,
    pub time: Option<String>,
    pub period: Option<u8>,
    pub scorer_name: Option<String>,
    pub scorer_id: Option<String>,
    pub first_assister_name: Option<String>,
    pub first_assister_id: Option<String>,
    pub second_assister_name: Option<String>,
    pub second_assister_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlayerPenalty {
    pub team_name: Option<String>,
    pub team_id: Option<String>,
    pub time: Option<String>,
    pub period: Option<u8>,
    pub player_name: Option<String>,
    pub player_id: Option<String>,
    pub penalty_description: Option<String>,
}

/// Scoreboard record published by the gamesheet feed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GameData {
    pub scoreboard_id: Option<String>,
    pub division_id: Option<String>,
    pub game_sheet_id: Option<String>,
    pub game_number: Option<String>,
    pub game_location: Option<String>,
    pub home_team_goals: Option<u16>,
    pub away_team_goals: Option<u16>,
    pub home_team_shots: Option<u16>,
    pub away_team_shots: Option<u16>,
    pub period: Option<u8>,
    pub time_remaining: Option<String>,
    pub home_team_name: Option<String>,
    pub home_team_bg_color: Option<String>,
    pub home_team_fg_color: Option<String>,
    pub away_team_name: Option<String>,
    pub away_team_bg_color: Option<String>,
    pub away_team_fg_color: Option<String>,
    pub goals: Vec<PlayerGoal>,
    pub penalties: Vec<PlayerPenalty>,
}

impl GameData {
    /// Flatten into the snapshot shape carried by envelopes
    pub fn to_snapshot(&self) -> Result<GameSnapshot, serde_json::Error> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(serde::ser::Error::custom(format!(
                "game data serialized to non-object: {}",
                other
            ))),
        }
    }
}
