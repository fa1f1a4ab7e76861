use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub telegram_id: Option<i64>,
    pub email: Option<String>,
    pub username: Option<String>,
    pub full_name: Option<String>,
    /// Remote panel account this user is linked to.
    pub panel_uuid: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn display_name(&self) -> String {
        self.full_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .or_else(|| self.username.clone())
            .unwrap_or_else(|| format!("User {}", self.id))
    }
}
