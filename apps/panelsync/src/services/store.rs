use anyhow::{Context, Result};
use async_trait::async_trait;
use panelsync_db::models::catalog::Tariff;
use panelsync_db::models::subscription::Subscription;
use panelsync_db::models::user::User;
use panelsync_db::repositories::subscription_repo::{LinkageRecord, SubscriptionRepository};
use panelsync_db::repositories::user_repo::UserRepository;
use sqlx::PgPool;

/// Everything the engine needs to know about one subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionContext {
    pub subscription: Subscription,
    pub user: User,
    pub tariff: Option<Tariff>,
}

/// Remote identifiers persisted once the panel has confirmed a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelLinkage {
    pub panel_uuid: String,
    pub short_id: String,
    pub subscription_url: Option<String>,
    pub crypto_link: Option<String>,
    /// Zero the local usage counter in the same write.
    pub reset_traffic_used: bool,
}

/// Local persistence used by the reconciliation engine.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn load(&self, subscription_id: i64) -> Result<Option<SubscriptionContext>>;

    /// Subscription and user halves (and an optional usage reset) are written atomically.
    async fn commit_linkage(
        &self,
        subscription_id: i64,
        user_id: i64,
        linkage: &PanelLinkage,
    ) -> Result<()>;

    async fn clear_linkage(&self, subscription_id: i64, user_id: i64) -> Result<()>;

    async fn update_links(
        &self,
        subscription_id: i64,
        subscription_url: Option<&str>,
        crypto_link: Option<&str>,
    ) -> Result<()>;

    /// Never lowers the stored value.
    async fn record_traffic_used(&self, subscription_id: i64, used_gb: f64) -> Result<()>;

    async fn reset_traffic_used(&self, subscription_id: i64) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct PgSubscriptionStore {
    subscriptions: SubscriptionRepository,
    users: UserRepository,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            subscriptions: SubscriptionRepository::new(pool.clone()),
            users: UserRepository::new(pool),
        }
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn load(&self, subscription_id: i64) -> Result<Option<SubscriptionContext>> {
        let Some(subscription) = self.subscriptions.get_by_id(subscription_id).await? else {
            return Ok(None);
        };
        let user = self
            .users
            .get_by_id(subscription.user_id)
            .await?
            .with_context(|| {
                format!(
                    "User {} of subscription {} does not exist",
                    subscription.user_id, subscription_id
                )
            })?;
        let tariff = match subscription.tariff_id {
            Some(tariff_id) => self.subscriptions.get_tariff(tariff_id).await?,
            None => None,
        };

        Ok(Some(SubscriptionContext {
            subscription,
            user,
            tariff,
        }))
    }

    async fn commit_linkage(
        &self,
        subscription_id: i64,
        user_id: i64,
        linkage: &PanelLinkage,
    ) -> Result<()> {
        let record = LinkageRecord {
            panel_uuid: &linkage.panel_uuid,
            short_id: &linkage.short_id,
            subscription_url: linkage.subscription_url.as_deref(),
            crypto_link: linkage.crypto_link.as_deref(),
            reset_traffic_used: linkage.reset_traffic_used,
        };
        self.subscriptions
            .commit_linkage(subscription_id, user_id, &record)
            .await
    }

    async fn clear_linkage(&self, subscription_id: i64, user_id: i64) -> Result<()> {
        self.subscriptions
            .clear_linkage(subscription_id, user_id)
            .await
    }

    async fn update_links(
        &self,
        subscription_id: i64,
        subscription_url: Option<&str>,
        crypto_link: Option<&str>,
    ) -> Result<()> {
        self.subscriptions
            .update_links(subscription_id, subscription_url, crypto_link)
            .await
    }

    async fn record_traffic_used(&self, subscription_id: i64, used_gb: f64) -> Result<()> {
        self.subscriptions
            .record_traffic_used(subscription_id, used_gb)
            .await
    }

    async fn reset_traffic_used(&self, subscription_id: i64) -> Result<()> {
        self.subscriptions.reset_traffic_used(subscription_id).await
    }
}
