use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Tariff {
    pub id: i64,
    pub name: String,
    pub traffic_reset_mode: Option<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct TrafficPackage {
    /// 0 is the unlimited package.
    pub gb: i32,
    /// Minor currency units.
    pub price: i64,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct PeriodPrice {
    pub days: i32,
    pub price: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ServerGroupPrice {
    pub uuid: String,
    pub name: String,
    /// Monthly price in minor units.
    pub price: i64,
    pub is_available: bool,
}
