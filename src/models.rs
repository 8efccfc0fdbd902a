use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

/// Lock state cache keyed by actuator uid
pub type LockMap = HashMap<String, LockAttributes>;

/// Credential payload sent to the token endpoint
#[derive(Debug, Serialize)]
pub struct TokenRequest {
    pub grant_type: String,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub client_secret: String,
}

impl TokenRequest {
    pub fn password_grant(
        username: &str,
        password: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Self {
        Self {
            grant_type: "password".to_string(),
            username: username.to_string(),
            password: password.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    /// Lifetime in seconds as reported by the server
    pub expires_in: u64,
    pub token_type: Option<String>,
    pub refresh_token: Option<String>,
}

/// An issued access token.
///
/// Never mutated: every successful exchange produces a new `Token`.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub access_token: String,
    /// Monotonic expiry, used for validity checks
    pub expires_at: Instant,
    /// Wall-clock issue time, used for logging
    pub issued_at: DateTime<Utc>,
    pub lifetime: Duration,
    /// HTTP status of the exchange that produced this token
    pub status: u16,
}

/// Longest lifetime accepted from the token endpoint (one year)
pub const MAX_TOKEN_LIFETIME: Duration = Duration::from_secs(365 * 24 * 60 * 60);

impl Token {
    /// Build a token from an exchange response, capping the reported lifetime
    /// at [`MAX_TOKEN_LIFETIME`].
    pub fn issue(response: TokenResponse, status: u16) -> Self {
        let lifetime = Duration::from_secs(response.expires_in).min(MAX_TOKEN_LIFETIME);
        Self {
            access_token: response.access_token,
            expires_at: Instant::now() + lifetime,
            issued_at: Utc::now(),
            lifetime,
            status,
        }
    }

    /// A token is valid while its expiry lies strictly beyond `now + margin`.
    pub fn is_valid(&self, margin: Duration) -> bool {
        match Instant::now().checked_add(margin) {
            Some(deadline) => self.expires_at > deadline,
            None => false,
        }
    }

    pub fn expires_at_utc(&self) -> DateTime<Utc> {
        let lifetime = chrono::Duration::from_std(self.lifetime).unwrap_or(chrono::Duration::zero());
        self.issued_at + lifetime
    }
}

/// One flag reported by an actuator. A lock can report several at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockState {
    Locked,
    Unlocked,
    Jammed,
    Open,
    Closed,
    Unknown,
}

impl LockState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockState::Locked => "LOCKED",
            LockState::Unlocked => "UNLOCKED",
            LockState::Jammed => "JAMMED",
            LockState::Open => "OPEN",
            LockState::Closed => "CLOSED",
            LockState::Unknown => "UNKNOWN",
        }
    }
}

impl FromStr for LockState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "LOCKED" => LockState::Locked,
            "UNLOCKED" => LockState::Unlocked,
            "JAMMED" => LockState::Jammed,
            "OPEN" => LockState::Open,
            "CLOSED" => LockState::Closed,
            _ => LockState::Unknown,
        })
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for LockState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for LockState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(raw.parse().unwrap_or(LockState::Unknown))
    }
}

/// Servers report either a single state string or a list of flags
#[derive(Deserialize)]
#[serde(untagged)]
enum StateField {
    One(LockState),
    Many(Vec<LockState>),
}

fn deserialize_states<'de, D>(deserializer: D) -> Result<BTreeSet<LockState>, D::Error>
where
    D: Deserializer<'de>,
{
    let states = match Option::<StateField>::deserialize(deserializer)? {
        Some(StateField::One(state)) => BTreeSet::from([state]),
        Some(StateField::Many(states)) => states.into_iter().collect(),
        None => BTreeSet::new(),
    };
    if states.is_empty() {
        return Ok(unknown_state());
    }
    Ok(states)
}

fn unknown_state() -> BTreeSet<LockState> {
    BTreeSet::from([LockState::Unknown])
}

/// Latest known attributes of a single actuator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockAttributes {
    pub uid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "unknown_state", deserialize_with = "deserialize_states")]
    pub state: BTreeSet<LockState>,
}

impl LockAttributes {
    pub fn is_locked(&self) -> bool {
        self.state.contains(&LockState::Locked)
    }

    pub fn state_string(&self) -> String {
        self.state
            .iter()
            .map(LockState::as_str)
            .collect::<Vec<_>>()
            .join("+")
    }
}

#[derive(Debug, Deserialize)]
pub struct ActuatorsResponse {
    pub actuators: Vec<LockAttributes>,
}

/// Intent sent to the actuator endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockActionType {
    Lock,
    Unlock,
    Open,
}

impl fmt::Display for LockActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockActionType::Lock => f.write_str("LOCK"),
            LockActionType::Unlock => f.write_str("UNLOCK"),
            LockActionType::Open => f.write_str("OPEN"),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LockActionRequest {
    pub action: LockActionType,
}
