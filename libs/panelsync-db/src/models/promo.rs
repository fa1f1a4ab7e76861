use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PromoGroup {
    pub id: i64,
    pub name: String,
    pub priority: i32,
    pub server_discount_percent: i32,
    pub traffic_discount_percent: i32,
    pub device_discount_percent: i32,
    /// Period length in days mapped to a discount percent.
    pub period_discounts: Json<BTreeMap<i32, i32>>,
    pub apply_discounts_to_addons: bool,
    pub is_default: bool,
}

/// Per-user override for one discount category. Replaces the group value.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserDiscountOverride {
    pub user_id: i64,
    /// `period`, `traffic`, `servers` or `devices`.
    pub category: String,
    pub percent: i32,
}
