use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::catalog::{PeriodPrice, ServerGroupPrice, TrafficPackage};
use crate::models::promo::{PromoGroup, UserDiscountOverride};

#[derive(Debug, Clone)]
pub struct CatalogRepository {
    pool: PgPool,
}

impl CatalogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn period_prices(&self) -> Result<Vec<PeriodPrice>> {
        sqlx::query_as::<_, PeriodPrice>("SELECT days, price FROM period_prices ORDER BY days")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch period prices")
    }

    pub async fn traffic_packages(&self) -> Result<Vec<TrafficPackage>> {
        sqlx::query_as::<_, TrafficPackage>(
            "SELECT gb, price, enabled FROM traffic_packages ORDER BY gb",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch traffic packages")
    }

    pub async fn server_group_prices(&self) -> Result<Vec<ServerGroupPrice>> {
        sqlx::query_as::<_, ServerGroupPrice>(
            "SELECT uuid, name, price, is_available FROM server_group_prices",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch server group prices")
    }

    /// Groups the user belongs to, plus the default group when flagged.
    pub async fn promo_groups_for_user(&self, user_id: i64) -> Result<Vec<PromoGroup>> {
        sqlx::query_as::<_, PromoGroup>(
            r#"
            SELECT g.* FROM promo_groups g
            WHERE g.is_default
               OR g.id IN (SELECT promo_group_id FROM user_promo_groups WHERE user_id = $1)
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch promo groups for user")
    }

    pub async fn discount_overrides(&self, user_id: i64) -> Result<Vec<UserDiscountOverride>> {
        sqlx::query_as::<_, UserDiscountOverride>(
            "SELECT user_id, category, percent FROM user_discount_overrides WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch discount overrides")
    }
}
