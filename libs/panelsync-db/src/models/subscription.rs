use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    Expired,
    Disabled,
    Pending,
}

impl SubscriptionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Disabled => "disabled",
            SubscriptionStatus::Pending => "pending",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trial" => Ok(SubscriptionStatus::Trial),
            "active" => Ok(SubscriptionStatus::Active),
            "expired" => Ok(SubscriptionStatus::Expired),
            "disabled" => Ok(SubscriptionStatus::Disabled),
            "pending" => Ok(SubscriptionStatus::Pending),
            other => Err(format!("unknown subscription status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub id: i64,
    pub user_id: i64,
    pub status: String,
    pub is_trial: bool,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    /// 0 means unlimited.
    pub traffic_limit_gb: i32,
    pub traffic_used_gb: f64,
    pub device_limit: i32,
    /// Panel internal squad UUIDs.
    pub server_groups: Vec<String>,
    pub panel_short_id: Option<String>,
    pub subscription_url: Option<String>,
    pub crypto_link: Option<String>,
    pub tariff_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Unparseable values are treated as disabled so they never project to an
    /// active remote account.
    pub fn status(&self) -> SubscriptionStatus {
        self.status.parse().unwrap_or_else(|e: String| {
            tracing::warn!("Subscription {}: {}", self.id, e);
            SubscriptionStatus::Disabled
        })
    }
}
