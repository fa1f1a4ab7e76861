use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::catalog::Tariff;
use crate::models::subscription::Subscription;

/// Remote identifiers and links that make up a subscription's linkage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkageRecord<'a> {
    pub panel_uuid: &'a str,
    pub short_id: &'a str,
    pub subscription_url: Option<&'a str>,
    pub crypto_link: Option<&'a str>,
    pub reset_traffic_used: bool,
}

#[derive(Debug, Clone)]
pub struct SubscriptionRepository {
    pool: PgPool,
}

impl SubscriptionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<Subscription>> {
        sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch subscription by ID")
    }

    pub async fn get_tariff(&self, tariff_id: i64) -> Result<Option<Tariff>> {
        sqlx::query_as::<_, Tariff>("SELECT * FROM tariffs WHERE id = $1")
            .bind(tariff_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch tariff")
    }

    /// Writes the subscription and user halves of a linkage in one transaction.
    pub async fn commit_linkage(
        &self,
        subscription_id: i64,
        user_id: i64,
        linkage: &LinkageRecord<'_>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE subscriptions SET panel_short_id = $1, subscription_url = $2, crypto_link = $3, traffic_used_gb = CASE WHEN $4 THEN 0 ELSE traffic_used_gb END, updated_at = NOW() WHERE id = $5",
        )
        .bind(linkage.short_id)
        .bind(linkage.subscription_url)
        .bind(linkage.crypto_link)
        .bind(linkage.reset_traffic_used)
        .bind(subscription_id)
        .execute(&mut *tx)
        .await
        .context("Failed to store subscription linkage")?;

        sqlx::query("UPDATE users SET panel_uuid = $1 WHERE id = $2")
            .bind(linkage.panel_uuid)
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .context("Failed to store user panel UUID")?;

        tx.commit().await?;
        Ok(())
    }

    /// Drops the linkage and every remote-derived link in one transaction.
    pub async fn clear_linkage(&self, subscription_id: i64, user_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE subscriptions SET panel_short_id = NULL, subscription_url = NULL, crypto_link = NULL, updated_at = NOW() WHERE id = $1",
        )
        .bind(subscription_id)
        .execute(&mut *tx)
        .await
        .context("Failed to clear subscription linkage")?;

        sqlx::query("UPDATE users SET panel_uuid = NULL WHERE id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .context("Failed to clear user panel UUID")?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn update_links(
        &self,
        subscription_id: i64,
        subscription_url: Option<&str>,
        crypto_link: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE subscriptions SET subscription_url = $1, crypto_link = $2, updated_at = NOW() WHERE id = $3",
        )
        .bind(subscription_url)
        .bind(crypto_link)
        .bind(subscription_id)
        .execute(&self.pool)
        .await
        .context("Failed to update subscription links")?;
        Ok(())
    }

    /// Usage only ever grows between explicit resets.
    pub async fn record_traffic_used(&self, subscription_id: i64, used_gb: f64) -> Result<()> {
        sqlx::query(
            "UPDATE subscriptions SET traffic_used_gb = GREATEST(traffic_used_gb, $1), updated_at = NOW() WHERE id = $2",
        )
        .bind(used_gb)
        .bind(subscription_id)
        .execute(&self.pool)
        .await
        .context("Failed to record traffic usage")?;
        Ok(())
    }

    pub async fn reset_traffic_used(&self, subscription_id: i64) -> Result<()> {
        sqlx::query("UPDATE subscriptions SET traffic_used_gb = 0, updated_at = NOW() WHERE id = $1")
            .bind(subscription_id)
            .execute(&self.pool)
            .await
            .context("Failed to reset traffic usage")?;
        Ok(())
    }
}
