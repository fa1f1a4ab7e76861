use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use tracing::warn;

use crate::error::{PanelError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UserStatus {
    #[default]
    Active,
    Disabled,
    Limited,
    Expired,
}

impl UserStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UserStatus::Active => "ACTIVE",
            UserStatus::Disabled => "DISABLED",
            UserStatus::Limited => "LIMITED",
            UserStatus::Expired => "EXPIRED",
        }
    }

    /// Unknown values degrade to `Active` instead of failing the response.
    pub fn from_wire(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "ACTIVE" => UserStatus::Active,
            "DISABLED" => UserStatus::Disabled,
            "LIMITED" => UserStatus::Limited,
            "EXPIRED" => UserStatus::Expired,
            other => {
                warn!("Unknown panel user status '{}', treating as ACTIVE", other);
                UserStatus::Active
            }
        }
    }
}

impl fmt::Display for UserStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for UserStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for UserStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().map(UserStatus::from_wire).unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrafficResetStrategy {
    #[default]
    NoReset,
    Daily,
    Weekly,
    Monthly,
}

impl TrafficResetStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            TrafficResetStrategy::NoReset => "NO_RESET",
            TrafficResetStrategy::Daily => "DAY",
            TrafficResetStrategy::Weekly => "WEEK",
            TrafficResetStrategy::Monthly => "MONTH",
        }
    }

    /// Accepts wire names as well as the long forms used in settings.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "NO_RESET" | "NONE" | "NEVER" => Some(TrafficResetStrategy::NoReset),
            "DAY" | "DAILY" => Some(TrafficResetStrategy::Daily),
            "WEEK" | "WEEKLY" => Some(TrafficResetStrategy::Weekly),
            "MONTH" | "MONTHLY" => Some(TrafficResetStrategy::Monthly),
            _ => None,
        }
    }

    pub fn from_wire(raw: &str) -> Self {
        Self::parse(raw).unwrap_or_else(|| {
            warn!("Unknown traffic reset strategy '{}', treating as NO_RESET", raw);
            TrafficResetStrategy::NoReset
        })
    }
}

impl fmt::Display for TrafficResetStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for TrafficResetStrategy {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TrafficResetStrategy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw
            .as_deref()
            .map(TrafficResetStrategy::from_wire)
            .unwrap_or_default())
    }
}

/// Remote account as the rest of the workspace sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct PanelUser {
    pub uuid: String,
    pub short_uuid: String,
    pub username: String,
    pub status: UserStatus,
    pub traffic_limit_bytes: i64,
    pub traffic_limit_strategy: TrafficResetStrategy,
    pub expire_at: DateTime<Utc>,
    pub telegram_id: Option<i64>,
    pub email: Option<String>,
    pub hwid_device_limit: Option<i32>,
    pub description: Option<String>,
    pub tag: Option<String>,
    pub subscription_url: Option<String>,
    pub crypto_link: Option<String>,
    pub server_groups: Vec<String>,
    pub used_traffic_bytes: i64,
    pub lifetime_used_traffic_bytes: i64,
    pub online_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl PanelUser {
    pub fn used_traffic_gb(&self) -> f64 {
        self.used_traffic_bytes.max(0) as f64 / GIB as f64
    }
}

pub const GIB: i64 = 1024 * 1024 * 1024;

/// Numbers arrive as integers, floats or strings depending on panel version.
#[derive(Deserialize)]
#[serde(untagged)]
enum Lenient {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Lenient {
    fn as_i64(&self) -> Option<i64> {
        match self {
            Lenient::Int(v) => Some(*v),
            Lenient::Float(v) => Some(*v as i64),
            Lenient::Text(v) => v
                .trim()
                .parse::<i64>()
                .ok()
                .or_else(|| v.trim().parse::<f64>().ok().map(|f| f as i64)),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SquadRef {
    Uuid(String),
    Object { uuid: String },
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct WireTraffic {
    used_traffic_bytes: Option<Lenient>,
    lifetime_used_traffic_bytes: Option<Lenient>,
    online_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Default)]
struct WireHapp {
    #[serde(alias = "cryptoLink")]
    crypto_link: Option<String>,
    #[serde(alias = "url")]
    link: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireUser {
    uuid: String,
    #[serde(default)]
    short_uuid: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    status: UserStatus,
    #[serde(default)]
    traffic_limit_bytes: Option<Lenient>,
    #[serde(default)]
    traffic_limit_strategy: TrafficResetStrategy,
    expire_at: DateTime<Utc>,
    #[serde(default)]
    telegram_id: Option<Lenient>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    hwid_device_limit: Option<Lenient>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    tag: Option<String>,
    #[serde(default)]
    subscription_url: Option<String>,
    #[serde(default)]
    active_internal_squads: Option<Vec<SquadRef>>,
    #[serde(default)]
    user_traffic: Option<WireTraffic>,
    // Older panels report usage at the top level.
    #[serde(default)]
    used_traffic_bytes: Option<Lenient>,
    #[serde(default)]
    lifetime_used_traffic_bytes: Option<Lenient>,
    #[serde(default)]
    online_at: Option<DateTime<Utc>>,
    #[serde(default)]
    happ: Option<WireHapp>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl From<WireUser> for PanelUser {
    fn from(wire: WireUser) -> Self {
        let traffic = wire.user_traffic.unwrap_or_default();
        let used = traffic
            .used_traffic_bytes
            .or(wire.used_traffic_bytes)
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let lifetime = traffic
            .lifetime_used_traffic_bytes
            .or(wire.lifetime_used_traffic_bytes)
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let happ = wire.happ.unwrap_or_default();

        PanelUser {
            short_uuid: wire.short_uuid.unwrap_or_default(),
            username: wire.username.unwrap_or_default(),
            status: wire.status,
            traffic_limit_bytes: wire
                .traffic_limit_bytes
                .and_then(|v| v.as_i64())
                .unwrap_or(0),
            traffic_limit_strategy: wire.traffic_limit_strategy,
            expire_at: wire.expire_at,
            telegram_id: wire.telegram_id.and_then(|v| v.as_i64()),
            email: non_empty(wire.email),
            hwid_device_limit: wire
                .hwid_device_limit
                .and_then(|v| v.as_i64())
                .and_then(|v| i32::try_from(v).ok()),
            description: non_empty(wire.description),
            tag: non_empty(wire.tag),
            subscription_url: non_empty(wire.subscription_url),
            crypto_link: non_empty(happ.crypto_link),
            server_groups: wire
                .active_internal_squads
                .unwrap_or_default()
                .into_iter()
                .map(|squad| match squad {
                    SquadRef::Uuid(uuid) | SquadRef::Object { uuid } => uuid,
                })
                .collect(),
            used_traffic_bytes: used,
            lifetime_used_traffic_bytes: lifetime,
            online_at: traffic.online_at.or(wire.online_at),
            created_at: wire.created_at,
            updated_at: wire.updated_at,
            uuid: wire.uuid,
        }
    }
}

pub(crate) fn parse_user(value: Value) -> Result<PanelUser> {
    serde_json::from_value::<WireUser>(value)
        .map(PanelUser::from)
        .map_err(|e| PanelError::Decode(format!("user: {}", e)))
}

/// Lookup endpoints answer with a list, a single object or nothing.
pub(crate) fn parse_user_list(value: Value) -> Result<Vec<PanelUser>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items.into_iter().map(parse_user).collect(),
        Value::Object(ref map) if map.contains_key("users") => {
            parse_user_list(map.get("users").cloned().unwrap_or(Value::Null))
        }
        Value::Object(ref map) if map.is_empty() => Ok(Vec::new()),
        other => Ok(vec![parse_user(other)?]),
    }
}

/// Strips the `{ "response": ... }` envelope every panel endpoint uses.
pub(crate) fn unwrap_envelope(value: Value) -> Result<Value> {
    match value {
        Value::Object(mut map) => map
            .remove("response")
            .ok_or_else(|| PanelError::Decode("missing 'response' envelope".into())),
        _ => Err(PanelError::Decode("response is not a JSON object".into())),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserPage {
    pub users: Vec<PanelUser>,
    pub total: u64,
}

#[derive(Deserialize)]
struct WirePage {
    #[serde(default)]
    users: Vec<Value>,
    #[serde(default)]
    total: Option<Lenient>,
}

pub(crate) fn parse_page(value: Value) -> Result<UserPage> {
    let page: WirePage =
        serde_json::from_value(value).map_err(|e| PanelError::Decode(format!("users page: {}", e)))?;
    let users = page
        .users
        .into_iter()
        .map(parse_user)
        .collect::<Result<Vec<_>>>()?;
    let total = page
        .total
        .and_then(|t| t.as_i64())
        .map(|t| t.max(0) as u64)
        .unwrap_or(users.len() as u64);
    Ok(UserPage { users, total })
}

/// Internal squad in panel terms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerGroup {
    pub uuid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub info: ServerGroupInfo,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerGroupInfo {
    #[serde(default)]
    pub members_count: u64,
    #[serde(default)]
    pub inbounds_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HwidDevice {
    pub hwid: String,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub os_version: Option<String>,
    #[serde(default)]
    pub device_model: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserRequest {
    pub username: String,
    pub status: UserStatus,
    pub expire_at: DateTime<Utc>,
    pub traffic_limit_bytes: i64,
    pub traffic_limit_strategy: TrafficResetStrategy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telegram_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hwid_device_limit: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub active_internal_squads: Vec<String>,
}

/// Partial update. `None` fields are left untouched by the panel.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateUserRequest {
    pub uuid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<UserStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traffic_limit_bytes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traffic_limit_strategy: Option<TrafficResetStrategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telegram_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hwid_device_limit: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_internal_squads: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoke_only_passwords: Option<bool>,
}
