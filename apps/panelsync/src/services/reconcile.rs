//! Pure reconciliation rules: linkage classification, status projection and
//! the desired remote account derived from local records. Nothing in here
//! touches the network or the database.

use chrono::{DateTime, Utc};
use panelsync_db::models::catalog::Tariff;
use panelsync_db::models::subscription::{Subscription, SubscriptionStatus};
use panelsync_db::models::user::User;
use panelsync_panel::models::GIB;
use panelsync_panel::{
    CreateUserRequest, PanelUser, TrafficResetStrategy, UpdateUserRequest, UserStatus,
};
use tracing::warn;

use crate::config::SyncSettings;

const MAX_TAG_LEN: usize = 16;

/// Linkage of a local subscription relative to the remote panel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkageState {
    Unlinked,
    LinkedConsistent,
    LinkedDrifted(Vec<&'static str>),
    LinkedOrphaned(OrphanReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrphanReason {
    RemoteMissing,
    IdentityMismatch { local: i64, remote: i64 },
    /// A short id survived locally without the account id it belongs to.
    DanglingShortId,
    Requested,
}

impl std::fmt::Display for OrphanReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrphanReason::RemoteMissing => f.write_str("remote account not found"),
            OrphanReason::IdentityMismatch { local, remote } => write!(
                f,
                "remote account belongs to telegram id {} instead of {}",
                remote, local
            ),
            OrphanReason::DanglingShortId => f.write_str("short id without account id"),
            OrphanReason::Requested => f.write_str("repair requested"),
        }
    }
}

/// What a lookup by linkage id returned.
#[derive(Debug, Clone, Copy)]
pub enum RemoteLookup<'a> {
    NotChecked,
    Missing,
    Found(&'a PanelUser),
}

/// Classifies the linkage. The identity cross-check only fires when both
/// sides carry a telegram id.
pub fn classify_linkage(
    subscription: &Subscription,
    user: &User,
    remote: RemoteLookup<'_>,
    desired: Option<&DesiredAccount>,
) -> LinkageState {
    if user.panel_uuid.is_none() {
        return if subscription.panel_short_id.is_some() {
            LinkageState::LinkedOrphaned(OrphanReason::DanglingShortId)
        } else {
            LinkageState::Unlinked
        };
    }

    let remote = match remote {
        RemoteLookup::NotChecked => return LinkageState::LinkedConsistent,
        RemoteLookup::Missing => return LinkageState::LinkedOrphaned(OrphanReason::RemoteMissing),
        RemoteLookup::Found(remote) => remote,
    };

    if let (Some(local), Some(remote_id)) = (user.telegram_id, remote.telegram_id) {
        if local != remote_id {
            return LinkageState::LinkedOrphaned(OrphanReason::IdentityMismatch {
                local,
                remote: remote_id,
            });
        }
    }

    match desired.map(|d| d.drift(remote)) {
        Some(fields) if !fields.is_empty() => LinkageState::LinkedDrifted(fields),
        _ => LinkageState::LinkedConsistent,
    }
}

/// ACTIVE only while the local subscription is active and not yet past its
/// end date. Everything else is EXPIRED.
pub fn project_status(
    status: SubscriptionStatus,
    end_date: DateTime<Utc>,
    now: DateTime<Utc>,
) -> UserStatus {
    if status == SubscriptionStatus::Active && end_date > now {
        UserStatus::Active
    } else {
        UserStatus::Expired
    }
}

/// Tariff override first, then the configured default. A tariff mode that
/// does not parse disables resets instead of falling through.
pub fn resolve_traffic_strategy(tariff: Option<&Tariff>, default: &str) -> TrafficResetStrategy {
    let from_tariff = tariff
        .and_then(|t| t.traffic_reset_mode.as_deref())
        .filter(|mode| !mode.trim().is_empty());

    if let Some(mode) = from_tariff {
        return TrafficResetStrategy::parse(mode).unwrap_or_else(|| {
            warn!("Unknown tariff traffic reset mode '{}', using NO_RESET", mode);
            TrafficResetStrategy::NoReset
        });
    }

    TrafficResetStrategy::parse(default).unwrap_or_else(|| {
        warn!("Unknown default traffic reset strategy '{}', using NO_RESET", default);
        TrafficResetStrategy::NoReset
    })
}

/// Trimmed, upper-cased, at most 16 characters of `[A-Z0-9_]`.
pub fn normalize_tag(raw: Option<&str>) -> Option<String> {
    let tag = raw?.trim().to_ascii_uppercase();
    if tag.is_empty() {
        return None;
    }
    if tag.len() > MAX_TAG_LEN
        || !tag
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
    {
        warn!("Ignoring invalid panel tag '{}'", tag);
        return None;
    }
    Some(tag)
}

fn identifier(user: &User) -> String {
    if let Some(telegram_id) = user.telegram_id {
        return telegram_id.to_string();
    }
    if let Some(email) = user.email.as_deref().filter(|e| !e.is_empty()) {
        let prefix: String = email
            .split('@')
            .next()
            .unwrap_or_default()
            .chars()
            .take(10)
            .collect();
        return format!("email_{}_{}", prefix, user.id);
    }
    format!("id_{}", user.id)
}

/// Replaces `{name}` placeholders. Unknown names become empty strings.
fn render(template: &str, values: &[(&str, String)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let key = &after[..close];
                if let Some((_, value)) = values.iter().find(|(k, _)| *k == key) {
                    out.push_str(value);
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn sanitize_username(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        let c = if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            c
        } else {
            '_'
        };
        if c == '_' && out.ends_with('_') {
            continue;
        }
        out.push(c);
    }
    out.trim_matches(|c| c == '_' || c == '-').to_string()
}

/// Remote username from the configured template.
pub fn format_username(template: &str, user: &User) -> String {
    let identifier = identifier(user);
    let values = [
        (
            "telegram_id",
            user.telegram_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| identifier.clone()),
        ),
        ("username", user.username.clone().unwrap_or_default()),
        ("full_name", user.full_name.clone().unwrap_or_default()),
        ("user_id", user.id.to_string()),
        ("identifier", identifier.clone()),
    ];
    let sanitized = sanitize_username(&render(template, &values));
    if sanitized.is_empty() {
        format!("user_{}", sanitize_username(&identifier))
    } else {
        sanitized
    }
}

/// Free-text description shown in the panel.
pub fn format_description(template: &str, user: &User) -> String {
    let username = user
        .username
        .as_deref()
        .map(|u| u.trim().trim_start_matches('@'))
        .filter(|u| !u.is_empty())
        .map(|u| format!("@{}", u))
        .unwrap_or_default();
    let mut contact = Vec::new();
    if let Some(id) = user.telegram_id {
        contact.push(format!("TG: {}", id));
    }
    if let Some(email) = user.email.as_deref().filter(|e| !e.is_empty()) {
        contact.push(format!("Email: {}", email));
    }
    let values = [
        ("full_name", user.display_name()),
        ("username", username.clone()),
        (
            "telegram_id",
            user.telegram_id.map(|id| id.to_string()).unwrap_or_default(),
        ),
        ("email", user.email.clone().unwrap_or_default()),
        ("user_id", user.id.to_string()),
        ("identifier", contact.join(" | ")),
    ];

    let rendered = render(&template.replace("@{username}", "{username}"), &values);
    let cleaned = if username.is_empty() {
        rendered.replace("()", "")
    } else {
        rendered
    };
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn gb_to_bytes(gb: i32) -> i64 {
    i64::from(gb.max(0)) * GIB
}

/// Inputs that stay fixed for the lifetime of a service.
#[derive(Debug, Clone)]
pub struct AccountPolicy {
    pub default_traffic_strategy: String,
    pub trial_tag: Option<String>,
    pub paid_tag: Option<String>,
    pub username_template: String,
    pub description_template: String,
}

impl From<&SyncSettings> for AccountPolicy {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            default_traffic_strategy: settings.default_traffic_strategy.clone(),
            trial_tag: normalize_tag(settings.trial_tag.as_deref()),
            paid_tag: normalize_tag(settings.paid_tag.as_deref()),
            username_template: settings.username_template.clone(),
            description_template: settings.description_template.clone(),
        }
    }
}

/// The remote account state the local records call for.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredAccount {
    pub status: UserStatus,
    pub expire_at: DateTime<Utc>,
    pub traffic_limit_bytes: i64,
    pub traffic_strategy: TrafficResetStrategy,
    pub device_limit: Option<i32>,
    pub server_groups: Vec<String>,
    pub tag: Option<String>,
    pub description: String,
    pub telegram_id: Option<i64>,
    pub email: Option<String>,
}

pub fn desired_account(
    subscription: &Subscription,
    user: &User,
    tariff: Option<&Tariff>,
    policy: &AccountPolicy,
    now: DateTime<Utc>,
) -> DesiredAccount {
    let tag = if subscription.is_trial {
        policy.trial_tag.clone()
    } else {
        policy.paid_tag.clone()
    };

    let mut server_groups = subscription.server_groups.clone();
    server_groups.sort();
    server_groups.dedup();

    DesiredAccount {
        status: project_status(subscription.status(), subscription.end_date, now),
        expire_at: subscription.end_date,
        traffic_limit_bytes: gb_to_bytes(subscription.traffic_limit_gb),
        traffic_strategy: resolve_traffic_strategy(tariff, &policy.default_traffic_strategy),
        device_limit: (subscription.device_limit > 0).then_some(subscription.device_limit),
        server_groups,
        tag,
        description: format_description(&policy.description_template, user),
        telegram_id: user.telegram_id,
        email: user.email.clone().filter(|e| !e.is_empty()),
    }
}

impl DesiredAccount {
    pub fn to_create(&self, username: String) -> CreateUserRequest {
        CreateUserRequest {
            username,
            status: self.status,
            expire_at: self.expire_at,
            traffic_limit_bytes: self.traffic_limit_bytes,
            traffic_limit_strategy: self.traffic_strategy,
            telegram_id: self.telegram_id,
            email: self.email.clone(),
            hwid_device_limit: self.device_limit,
            description: Some(self.description.clone()),
            tag: self.tag.clone(),
            active_internal_squads: self.server_groups.clone(),
        }
    }

    pub fn to_update(&self, uuid: &str) -> UpdateUserRequest {
        UpdateUserRequest {
            uuid: uuid.to_string(),
            status: Some(self.status),
            expire_at: Some(self.expire_at),
            traffic_limit_bytes: Some(self.traffic_limit_bytes),
            traffic_limit_strategy: Some(self.traffic_strategy),
            telegram_id: self.telegram_id,
            email: self.email.clone(),
            hwid_device_limit: self.device_limit,
            description: Some(self.description.clone()),
            tag: self.tag.clone(),
            active_internal_squads: Some(self.server_groups.clone()),
        }
    }

    /// Names of the fields where `remote` disagrees.
    pub fn drift(&self, remote: &PanelUser) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if remote.status != self.status {
            fields.push("status");
        }
        if remote.expire_at != self.expire_at {
            fields.push("expire_at");
        }
        if remote.traffic_limit_bytes != self.traffic_limit_bytes {
            fields.push("traffic_limit_bytes");
        }
        if remote.traffic_limit_strategy != self.traffic_strategy {
            fields.push("traffic_limit_strategy");
        }
        if self.device_limit.is_some() && remote.hwid_device_limit != self.device_limit {
            fields.push("hwid_device_limit");
        }
        let mut remote_groups = remote.server_groups.clone();
        remote_groups.sort();
        remote_groups.dedup();
        if remote_groups != self.server_groups {
            fields.push("server_groups");
        }
        if self.tag.is_some() && remote.tag != self.tag {
            fields.push("tag");
        }
        fields
    }
}
