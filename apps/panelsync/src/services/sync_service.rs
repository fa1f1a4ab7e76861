use chrono::Utc;
use panelsync_panel::{PanelApi, PanelError, PanelGateway, PanelUser, RevokeRequest};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::{DeleteMode, SyncSettings};
use crate::services::reconcile::{
    self, AccountPolicy, DesiredAccount, LinkageState, OrphanReason, RemoteLookup,
};
use crate::services::store::{PanelLinkage, SubscriptionContext, SubscriptionStore};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("panel sync is not configured: {0}")]
    Configuration(String),
    #[error("subscription {0} does not exist")]
    MissingRecord(i64),
    #[error("subscription {0} is not linked to a panel account")]
    NotLinked(i64),
    #[error(transparent)]
    Panel(#[from] PanelError),
    #[error("inconsistent panel state for subscription {subscription_id}: {reason}")]
    Consistency { subscription_id: i64, reason: String },
    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Created,
    Adopted,
    Updated,
    Unchanged,
    Enabled,
    Disabled,
    TrafficReset,
    LinksRevoked,
    Removed,
    UsageSynced,
}

/// Outcome handed back to callers for logging and link rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub subscription_id: i64,
    pub action: SyncAction,
    /// The linkage was cleared and rebuilt during this call.
    pub repaired: bool,
    pub panel_uuid: Option<String>,
    pub subscription_url: Option<String>,
    pub crypto_link: Option<String>,
    pub drifted_fields: Vec<&'static str>,
    pub used_traffic_gb: Option<f64>,
}

impl SyncReport {
    fn new(subscription_id: i64, action: SyncAction) -> Self {
        Self {
            subscription_id,
            action,
            repaired: false,
            panel_uuid: None,
            subscription_url: None,
            crypto_link: None,
            drifted_fields: Vec::new(),
            used_traffic_gb: None,
        }
    }

    fn with_account(mut self, account: &PanelUser) -> Self {
        self.panel_uuid = Some(account.uuid.clone());
        self.subscription_url = account.subscription_url.clone();
        self.crypto_link = account.crypto_link.clone();
        self
    }

    fn with_local(mut self, ctx: &SubscriptionContext) -> Self {
        self.panel_uuid = ctx.user.panel_uuid.clone();
        self.subscription_url = ctx.subscription.subscription_url.clone();
        self.crypto_link = ctx.subscription.crypto_link.clone();
        self
    }
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub delete_mode: DeleteMode,
    pub reset_devices_on_adopt: bool,
    pub page_size: u32,
}

impl From<&SyncSettings> for SyncOptions {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            delete_mode: settings.delete_mode,
            reset_devices_on_adopt: settings.reset_devices_on_adopt,
            page_size: 100,
        }
    }
}

impl SyncOptions {
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProvisionOptions {
    /// Reset remote traffic counters once the account is in place.
    pub reset_traffic: bool,
    pub reset_reason: Option<String>,
}

fn logged<T>(operation: &str, subscription_id: i64, result: Result<T, SyncError>) -> Result<T, SyncError> {
    if let Err(e) = &result {
        error!("{} failed for subscription {}: {}", operation, subscription_id, e);
    }
    result
}

fn linkage_of(subscription_id: i64, account: &PanelUser) -> Result<PanelLinkage, SyncError> {
    if account.uuid.is_empty() || account.short_uuid.is_empty() {
        return Err(SyncError::Consistency {
            subscription_id,
            reason: "panel returned an account without identifiers".into(),
        });
    }
    Ok(PanelLinkage {
        panel_uuid: account.uuid.clone(),
        short_id: account.short_uuid.clone(),
        subscription_url: account.subscription_url.clone(),
        crypto_link: account.crypto_link.clone(),
        reset_traffic_used: false,
    })
}

/// Accounts found by a secondary identity must not belong to someone else.
fn same_owner(ctx: &SubscriptionContext, account: &PanelUser) -> bool {
    match (ctx.user.telegram_id, account.telegram_id) {
        (Some(local), Some(remote)) => local == remote,
        _ => true,
    }
}

/// Keeps local subscriptions and remote panel accounts consistent.
///
/// Local state is written only after the panel has confirmed the
/// corresponding mutation. The single exception is clearing a linkage whose
/// remote account is confirmed gone or owned by someone else.
pub struct SyncService<G: PanelGateway, S: SubscriptionStore> {
    gateway: Result<G, String>,
    store: S,
    policy: AccountPolicy,
    options: SyncOptions,
}

impl<G: PanelGateway, S: SubscriptionStore> SyncService<G, S> {
    pub fn new(
        gateway: Result<G, PanelError>,
        store: S,
        policy: AccountPolicy,
        options: SyncOptions,
    ) -> Self {
        let gateway = gateway.map_err(|e| {
            warn!("Panel sync disabled: {}", e);
            e.to_string()
        });
        Self {
            gateway,
            store,
            policy,
            options,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.gateway.is_ok()
    }

    fn open(&self) -> Result<G::Session, SyncError> {
        let gateway = self
            .gateway
            .as_ref()
            .map_err(|e| SyncError::Configuration(e.clone()))?;
        gateway.open_session().map_err(|e| match e {
            PanelError::Configuration(message) => SyncError::Configuration(message),
            other => SyncError::Panel(other),
        })
    }

    async fn load(&self, subscription_id: i64) -> Result<SubscriptionContext, SyncError> {
        self.store
            .load(subscription_id)
            .await?
            .ok_or(SyncError::MissingRecord(subscription_id))
    }

    fn desired(&self, ctx: &SubscriptionContext) -> DesiredAccount {
        reconcile::desired_account(
            &ctx.subscription,
            &ctx.user,
            ctx.tariff.as_ref(),
            &self.policy,
            Utc::now(),
        )
    }

    fn linked_uuid(ctx: &SubscriptionContext) -> Result<String, SyncError> {
        ctx.user
            .panel_uuid
            .clone()
            .ok_or(SyncError::NotLinked(ctx.subscription.id))
    }

    /// Creates or adopts the remote account and records the linkage.
    pub async fn provision(&self, subscription_id: i64) -> Result<SyncReport, SyncError> {
        self.provision_with(subscription_id, ProvisionOptions::default())
            .await
    }

    pub async fn provision_with(
        &self,
        subscription_id: i64,
        options: ProvisionOptions,
    ) -> Result<SyncReport, SyncError> {
        let result = self.run_provision(subscription_id, &options).await;
        logged("provision", subscription_id, result)
    }

    /// Pushes the local projection to the linked account, provisioning or
    /// repairing first when needed.
    pub async fn resync(&self, subscription_id: i64) -> Result<SyncReport, SyncError> {
        let result = self.run_resync(subscription_id).await;
        logged("resync", subscription_id, result)
    }

    /// Drops the local linkage and provisions again.
    pub async fn repair(&self, subscription_id: i64) -> Result<SyncReport, SyncError> {
        let result = self.run_repair(subscription_id).await;
        logged("repair", subscription_id, result)
    }

    /// Cheap check before links are shown: no-op when linked and the remote
    /// account still exists.
    pub async fn ensure_synced(&self, subscription_id: i64) -> Result<SyncReport, SyncError> {
        let result = self.run_ensure_synced(subscription_id).await;
        logged("ensure_synced", subscription_id, result)
    }

    pub async fn enable(&self, subscription_id: i64) -> Result<SyncReport, SyncError> {
        let result = self.set_enabled(subscription_id, true).await;
        logged("enable", subscription_id, result)
    }

    pub async fn disable(&self, subscription_id: i64) -> Result<SyncReport, SyncError> {
        let result = self.set_enabled(subscription_id, false).await;
        logged("disable", subscription_id, result)
    }

    /// Explicit traffic reset. Local usage drops to zero only after the
    /// panel confirms.
    pub async fn reset_traffic(
        &self,
        subscription_id: i64,
        reason: Option<&str>,
    ) -> Result<SyncReport, SyncError> {
        let result = self.run_reset_traffic(subscription_id, reason).await;
        logged("reset_traffic", subscription_id, result)
    }

    /// Rotates the subscription link and stores the new identifiers.
    pub async fn revoke_links(&self, subscription_id: i64) -> Result<SyncReport, SyncError> {
        let result = self.run_revoke_links(subscription_id).await;
        logged("revoke_links", subscription_id, result)
    }

    /// Deletes (or disables, per configuration) the remote account, then
    /// forgets the linkage.
    pub async fn remove(&self, subscription_id: i64) -> Result<SyncReport, SyncError> {
        let result = self.run_remove(subscription_id).await;
        logged("remove", subscription_id, result)
    }

    /// Copies remote usage into the local record. Usage never decreases.
    pub async fn sync_usage(&self, subscription_id: i64) -> Result<SyncReport, SyncError> {
        let result = self.run_sync_usage(subscription_id).await;
        logged("sync_usage", subscription_id, result)
    }

    pub async fn list_remote_accounts(&self) -> Result<Vec<PanelUser>, SyncError> {
        let api = self.open()?;
        let users = api.list_all_users(self.options.page_size).await?;
        info!("Panel reports {} accounts", users.len());
        Ok(users)
    }

    async fn run_provision(
        &self,
        subscription_id: i64,
        options: &ProvisionOptions,
    ) -> Result<SyncReport, SyncError> {
        let api = self.open()?;
        let ctx = self.load(subscription_id).await?;
        self.provision_in(&api, ctx, options).await
    }

    async fn run_resync(&self, subscription_id: i64) -> Result<SyncReport, SyncError> {
        let api = self.open()?;
        let ctx = self.load(subscription_id).await?;
        self.resync_in(&api, ctx).await
    }

    async fn run_repair(&self, subscription_id: i64) -> Result<SyncReport, SyncError> {
        let api = self.open()?;
        let ctx = self.load(subscription_id).await?;
        self.repair_in(&api, ctx, &OrphanReason::Requested).await
    }

    async fn run_ensure_synced(&self, subscription_id: i64) -> Result<SyncReport, SyncError> {
        let api = self.open()?;
        let ctx = self.load(subscription_id).await?;
        let uuid = match ctx.user.panel_uuid.clone() {
            Some(uuid) if ctx.subscription.subscription_url.is_some() => uuid,
            _ => {
                info!("Subscription {} has no panel links, provisioning", subscription_id);
                return self
                    .provision_in(&api, ctx, &ProvisionOptions::default())
                    .await;
            }
        };

        match api.get_user(&uuid).await {
            Ok(Some(remote)) => {
                let state = reconcile::classify_linkage(
                    &ctx.subscription,
                    &ctx.user,
                    RemoteLookup::Found(&remote),
                    None,
                );
                match state {
                    LinkageState::LinkedOrphaned(reason) => {
                        self.repair_in(&api, ctx, &reason).await
                    }
                    _ => Ok(SyncReport::new(subscription_id, SyncAction::Unchanged).with_local(&ctx)),
                }
            }
            Ok(None) => {
                self.repair_in(&api, ctx, &OrphanReason::RemoteMissing)
                    .await
            }
            Err(e) if e.is_transient() => {
                warn!(
                    "Could not verify panel account of subscription {}: {}",
                    subscription_id, e
                );
                Ok(SyncReport::new(subscription_id, SyncAction::Unchanged).with_local(&ctx))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn set_enabled(&self, subscription_id: i64, enable: bool) -> Result<SyncReport, SyncError> {
        let api = self.open()?;
        let ctx = self.load(subscription_id).await?;
        let uuid = Self::linked_uuid(&ctx)?;
        let (state, action) = if enable {
            ("enabled", SyncAction::Enabled)
        } else {
            ("disabled", SyncAction::Disabled)
        };

        let outcome = if enable {
            api.enable_user(&uuid).await
        } else {
            api.disable_user(&uuid).await
        };
        match outcome {
            Ok(_) => info!("Panel account {} {}", uuid, state),
            Err(e) if e.is_already_in_state(state) => {
                info!("Panel account {} already {}", uuid, state)
            }
            Err(e) => return Err(e.into()),
        }

        Ok(SyncReport::new(subscription_id, action).with_local(&ctx))
    }

    async fn run_reset_traffic(
        &self,
        subscription_id: i64,
        reason: Option<&str>,
    ) -> Result<SyncReport, SyncError> {
        let api = self.open()?;
        let ctx = self.load(subscription_id).await?;
        let uuid = Self::linked_uuid(&ctx)?;

        let account = api.reset_traffic(&uuid).await?;
        self.store.reset_traffic_used(subscription_id).await?;
        info!(
            "Traffic reset for subscription {} ({})",
            subscription_id,
            reason.unwrap_or("no reason given")
        );

        let mut report = SyncReport::new(subscription_id, SyncAction::TrafficReset).with_local(&ctx);
        report.used_traffic_gb = Some(account.used_traffic_gb());
        Ok(report)
    }

    async fn run_revoke_links(&self, subscription_id: i64) -> Result<SyncReport, SyncError> {
        let api = self.open()?;
        let ctx = self.load(subscription_id).await?;
        let uuid = Self::linked_uuid(&ctx)?;

        let account = api
            .revoke_subscription(&uuid, RevokeRequest::default())
            .await?;
        let linkage = linkage_of(subscription_id, &account)?;
        self.store
            .commit_linkage(subscription_id, ctx.user.id, &linkage)
            .await?;
        info!("Subscription {} links revoked", subscription_id);

        Ok(SyncReport::new(subscription_id, SyncAction::LinksRevoked).with_account(&account))
    }

    async fn run_remove(&self, subscription_id: i64) -> Result<SyncReport, SyncError> {
        let api = self.open()?;
        let ctx = self.load(subscription_id).await?;
        let uuid = Self::linked_uuid(&ctx)?;

        match self.options.delete_mode {
            DeleteMode::Delete => match api.delete_user(&uuid).await {
                Ok(true) => info!("Panel account {} deleted", uuid),
                Ok(false) => {
                    return Err(SyncError::Consistency {
                        subscription_id,
                        reason: format!("panel refused to delete account {}", uuid),
                    });
                }
                Err(e) if e.is_not_found() => info!("Panel account {} was already gone", uuid),
                Err(e) => return Err(e.into()),
            },
            DeleteMode::Disable => match api.disable_user(&uuid).await {
                Ok(_) => info!("Panel account {} disabled instead of deleted", uuid),
                Err(e) if e.is_already_in_state("disabled") || e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            },
        }

        self.store
            .clear_linkage(subscription_id, ctx.user.id)
            .await?;
        let mut report = SyncReport::new(subscription_id, SyncAction::Removed);
        report.panel_uuid = Some(uuid);
        Ok(report)
    }

    async fn run_sync_usage(&self, subscription_id: i64) -> Result<SyncReport, SyncError> {
        let api = self.open()?;
        let ctx = self.load(subscription_id).await?;
        let uuid = Self::linked_uuid(&ctx)?;

        let Some(account) = api.get_user(&uuid).await? else {
            return self
                .repair_in(&api, ctx, &OrphanReason::RemoteMissing)
                .await;
        };
        let used_gb = account.used_traffic_gb();
        self.store
            .record_traffic_used(subscription_id, used_gb)
            .await?;

        let mut report =
            SyncReport::new(subscription_id, SyncAction::UsageSynced).with_account(&account);
        report.used_traffic_gb = Some(used_gb.max(ctx.subscription.traffic_used_gb));
        Ok(report)
    }

    async fn inspect(
        &self,
        api: &G::Session,
        ctx: &SubscriptionContext,
        desired: &DesiredAccount,
    ) -> Result<(LinkageState, Option<PanelUser>), SyncError> {
        let remote = match ctx.user.panel_uuid.as_deref() {
            Some(uuid) => api.get_user(uuid).await?,
            None => None,
        };
        let lookup = match (&ctx.user.panel_uuid, &remote) {
            (None, _) => RemoteLookup::NotChecked,
            (Some(_), Some(account)) => RemoteLookup::Found(account),
            (Some(_), None) => RemoteLookup::Missing,
        };
        let state =
            reconcile::classify_linkage(&ctx.subscription, &ctx.user, lookup, Some(desired));
        Ok((state, remote))
    }

    async fn clear(
        &self,
        ctx: &mut SubscriptionContext,
        reason: &OrphanReason,
    ) -> Result<(), SyncError> {
        warn!(
            "Subscription {}: {}, clearing panel linkage {:?}",
            ctx.subscription.id, reason, ctx.user.panel_uuid
        );
        self.store
            .clear_linkage(ctx.subscription.id, ctx.user.id)
            .await?;
        ctx.user.panel_uuid = None;
        ctx.subscription.panel_short_id = None;
        ctx.subscription.subscription_url = None;
        ctx.subscription.crypto_link = None;
        Ok(())
    }

    async fn repair_in(
        &self,
        api: &G::Session,
        mut ctx: SubscriptionContext,
        reason: &OrphanReason,
    ) -> Result<SyncReport, SyncError> {
        self.clear(&mut ctx, reason).await?;
        let mut report = self
            .provision_in(api, ctx, &ProvisionOptions::default())
            .await?;
        report.repaired = true;
        Ok(report)
    }

    /// Lookup order: telegram id, email, then the templated username.
    async fn find_existing(
        &self,
        api: &G::Session,
        ctx: &SubscriptionContext,
    ) -> Result<Option<PanelUser>, SyncError> {
        if let Some(telegram_id) = ctx.user.telegram_id {
            if let Some(found) = api.find_by_telegram_id(telegram_id).await?.into_iter().next() {
                return Ok(Some(found));
            }
        }

        if let Some(email) = ctx.user.email.as_deref().filter(|e| !e.is_empty()) {
            let found = api
                .find_by_email(email)
                .await?
                .into_iter()
                .find(|account| same_owner(ctx, account));
            if found.is_some() {
                return Ok(found);
            }
        }

        let username = reconcile::format_username(&self.policy.username_template, &ctx.user);
        Ok(api
            .find_by_username(&username)
            .await?
            .filter(|account| same_owner(ctx, account)))
    }

    async fn provision_in(
        &self,
        api: &G::Session,
        mut ctx: SubscriptionContext,
        options: &ProvisionOptions,
    ) -> Result<SyncReport, SyncError> {
        let subscription_id = ctx.subscription.id;
        let desired = self.desired(&ctx);
        let (state, remote) = self.inspect(api, &ctx, &desired).await?;

        let mut repaired = false;
        let linked = match state {
            LinkageState::LinkedOrphaned(reason) => {
                self.clear(&mut ctx, &reason).await?;
                repaired = true;
                None
            }
            LinkageState::Unlinked => None,
            LinkageState::LinkedConsistent | LinkageState::LinkedDrifted(_) => remote,
        };

        let (existing, action) = match linked {
            Some(account) => (Some(account), SyncAction::Updated),
            None => (self.find_existing(api, &ctx).await?, SyncAction::Adopted),
        };

        let (account, action) = match existing {
            Some(found) => {
                info!(
                    "Subscription {}: updating panel account {} in place",
                    subscription_id, found.uuid
                );
                let updated = api.update_user(desired.to_update(&found.uuid)).await?;
                if action == SyncAction::Adopted && self.options.reset_devices_on_adopt {
                    match api.reset_user_devices(&updated.uuid).await {
                        Ok(removed) => info!("Removed {} devices of {}", removed, updated.uuid),
                        Err(e) => warn!("Failed to reset devices of {}: {}", updated.uuid, e),
                    }
                }
                (updated, action)
            }
            None => {
                let username =
                    reconcile::format_username(&self.policy.username_template, &ctx.user);
                info!(
                    "Subscription {}: creating panel account {}",
                    subscription_id, username
                );
                (
                    api.create_user(desired.to_create(username)).await?,
                    SyncAction::Created,
                )
            }
        };

        let mut traffic_reset = false;
        if options.reset_traffic {
            match api.reset_traffic(&account.uuid).await {
                Ok(_) => {
                    traffic_reset = true;
                    info!(
                        "Traffic reset for {} ({})",
                        account.uuid,
                        options.reset_reason.as_deref().unwrap_or("provision")
                    );
                }
                Err(e) => warn!("Failed to reset traffic of {}: {}", account.uuid, e),
            }
        }

        let linkage = PanelLinkage {
            reset_traffic_used: traffic_reset,
            ..linkage_of(subscription_id, &account)?
        };
        self.store
            .commit_linkage(subscription_id, ctx.user.id, &linkage)
            .await?;

        let mut report = SyncReport::new(subscription_id, action).with_account(&account);
        report.repaired = repaired;
        Ok(report)
    }

    async fn resync_in(
        &self,
        api: &G::Session,
        ctx: SubscriptionContext,
    ) -> Result<SyncReport, SyncError> {
        let subscription_id = ctx.subscription.id;
        if ctx.user.panel_uuid.is_none() {
            info!("Subscription {} is not linked yet, provisioning", subscription_id);
            return self
                .provision_in(api, ctx, &ProvisionOptions::default())
                .await;
        }

        let desired = self.desired(&ctx);
        let (state, remote) = self.inspect(api, &ctx, &desired).await?;
        let drifted = match state {
            LinkageState::LinkedOrphaned(reason) => {
                return self.repair_in(api, ctx, &reason).await;
            }
            LinkageState::LinkedDrifted(fields) => {
                info!(
                    "Subscription {} drifted on {}",
                    subscription_id,
                    fields.join(", ")
                );
                fields
            }
            LinkageState::LinkedConsistent | LinkageState::Unlinked => Vec::new(),
        };
        let Some(remote) = remote else {
            return self
                .repair_in(api, ctx, &OrphanReason::RemoteMissing)
                .await;
        };

        let updated = match api.update_user(desired.to_update(&remote.uuid)).await {
            Ok(updated) => updated,
            Err(e) if e.is_not_found() => {
                return self
                    .repair_in(api, ctx, &OrphanReason::RemoteMissing)
                    .await;
            }
            Err(e) => return Err(e.into()),
        };
        if updated.uuid != remote.uuid {
            return Err(SyncError::Consistency {
                subscription_id,
                reason: format!(
                    "update of {} answered with account {}",
                    remote.uuid, updated.uuid
                ),
            });
        }

        let linkage = linkage_of(subscription_id, &updated)?;
        let subscription = &ctx.subscription;
        if subscription.panel_short_id.as_deref() != Some(linkage.short_id.as_str()) {
            self.store
                .commit_linkage(subscription_id, ctx.user.id, &linkage)
                .await?;
        } else if subscription.subscription_url != linkage.subscription_url
            || subscription.crypto_link != linkage.crypto_link
        {
            self.store
                .update_links(
                    subscription_id,
                    linkage.subscription_url.as_deref(),
                    linkage.crypto_link.as_deref(),
                )
                .await?;
        }

        let mut report = SyncReport::new(subscription_id, SyncAction::Updated).with_account(&updated);
        report.drifted_fields = drifted;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::fakes::{FakePanel, MemoryStore, transient};
    use crate::services::reconcile::tests::{subscription, user};
    use chrono::{DateTime, Duration};
    use panelsync_panel::models::GIB;
    use panelsync_panel::UserStatus;

    fn context(telegram_id: Option<i64>, end_date: DateTime<Utc>) -> SubscriptionContext {
        SubscriptionContext {
            subscription: subscription(1, 1, end_date),
            user: user(1, telegram_id),
            tariff: None,
        }
    }

    fn service_with(
        panel: &FakePanel,
        store: &MemoryStore,
        settings: SyncSettings,
    ) -> SyncService<FakePanel, MemoryStore> {
        SyncService::new(
            Ok(panel.clone()),
            store.clone(),
            AccountPolicy::from(&settings),
            SyncOptions::from(&settings),
        )
    }

    fn service(panel: &FakePanel, store: &MemoryStore) -> SyncService<FakePanel, MemoryStore> {
        service_with(panel, store, SyncSettings::default())
    }

    fn edit(store: &MemoryStore, f: impl FnOnce(&mut SubscriptionContext)) {
        let mut state = store.state.lock().unwrap();
        f(state.records.get_mut(&1).unwrap());
    }

    #[tokio::test]
    async fn provision_creates_account_and_persists_linkage() {
        let end = Utc::now() + Duration::days(30);
        let panel = FakePanel::default();
        let store = MemoryStore::with(context(Some(42), end));

        let report = service(&panel, &store).provision(1).await.unwrap();

        assert_eq!(report.action, SyncAction::Created);
        assert!(!report.repaired);
        let accounts = panel.accounts();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].username, "user_42");
        assert_eq!(accounts[0].expire_at, end);
        assert_eq!(accounts[0].status, UserStatus::Active);
        assert_eq!(accounts[0].traffic_limit_bytes, 50 * GIB);

        let stored = store.get(1);
        assert_eq!(stored.user.panel_uuid.as_deref(), Some("uuid-1"));
        assert_eq!(stored.subscription.panel_short_id.as_deref(), Some("short-uuid-1"));
        assert_eq!(stored.subscription.subscription_url, report.subscription_url);
        assert_eq!(stored.subscription.crypto_link.as_deref(), Some("happ://crypt/uuid-1"));
    }

    #[tokio::test]
    async fn second_provision_updates_instead_of_duplicating() {
        let panel = FakePanel::default();
        let store = MemoryStore::with(context(Some(42), Utc::now() + Duration::days(30)));
        let sync = service(&panel, &store);

        sync.provision(1).await.unwrap();
        let second = sync.provision(1).await.unwrap();

        assert_eq!(second.action, SyncAction::Updated);
        assert_eq!(panel.accounts().len(), 1);
        assert_eq!(panel.calls("create_user"), 1);
    }

    #[tokio::test]
    async fn provision_after_lost_commit_adopts_by_telegram_id() {
        let panel = FakePanel::default();
        panel.insert(FakePanel::account("existing", Some(42)));
        let store = MemoryStore::with(context(Some(42), Utc::now() + Duration::days(30)));

        let report = service(&panel, &store).provision(1).await.unwrap();

        assert_eq!(report.action, SyncAction::Adopted);
        assert_eq!(panel.accounts().len(), 1);
        assert_eq!(panel.calls("create_user"), 0);
        assert_eq!(store.get(1).user.panel_uuid.as_deref(), Some("existing"));
    }

    #[tokio::test]
    async fn username_is_the_last_lookup_before_create() {
        let panel = FakePanel::default();
        let mut earlier = FakePanel::account("earlier", None);
        earlier.username = "user_id_1".into();
        panel.insert(earlier);
        let store = MemoryStore::with(context(None, Utc::now() + Duration::days(30)));

        let report = service(&panel, &store).provision(1).await.unwrap();

        assert_eq!(report.action, SyncAction::Adopted);
        assert_eq!(report.panel_uuid.as_deref(), Some("earlier"));
        assert_eq!(panel.accounts().len(), 1);
    }

    #[tokio::test]
    async fn resync_projects_expiry_without_touching_local_status() {
        let panel = FakePanel::default();
        let store = MemoryStore::with(context(Some(42), Utc::now() + Duration::days(30)));
        let sync = service(&panel, &store);
        sync.provision(1).await.unwrap();

        let ended = Utc::now() - Duration::hours(2);
        edit(&store, |ctx| ctx.subscription.end_date = ended);
        let report = sync.resync(1).await.unwrap();

        assert_eq!(report.action, SyncAction::Updated);
        assert!(report.drifted_fields.contains(&"status"));
        assert!(report.drifted_fields.contains(&"expire_at"));
        let remote = &panel.accounts()[0];
        assert_eq!(remote.status, UserStatus::Expired);
        assert_eq!(remote.expire_at, ended);
        assert_eq!(store.get(1).subscription.status, "active");
    }

    #[tokio::test]
    async fn resync_repairs_missing_remote_account_in_one_call() {
        let panel = FakePanel::default();
        let mut ctx = context(Some(42), Utc::now() + Duration::days(30));
        ctx.user.panel_uuid = Some("gone".into());
        ctx.subscription.panel_short_id = Some("short-gone".into());
        ctx.subscription.subscription_url = Some("https://sub.example.com/short-gone".into());
        let store = MemoryStore::with(ctx);

        let report = service(&panel, &store).resync(1).await.unwrap();

        assert!(report.repaired);
        assert_eq!(report.action, SyncAction::Created);
        let stored = store.get(1);
        assert_eq!(stored.user.panel_uuid.as_deref(), Some("uuid-1"));
        assert_eq!(stored.subscription.panel_short_id.as_deref(), Some("short-uuid-1"));
        assert_eq!(panel.accounts().len(), 1);
    }

    #[tokio::test]
    async fn foreign_account_is_never_adopted() {
        let panel = FakePanel::default();
        panel.insert(FakePanel::account("foreign", Some(999)));
        let mut ctx = context(Some(42), Utc::now() + Duration::days(30));
        ctx.user.panel_uuid = Some("foreign".into());
        let store = MemoryStore::with(ctx);

        let report = service(&panel, &store).resync(1).await.unwrap();

        assert!(report.repaired);
        assert_eq!(report.panel_uuid.as_deref(), Some("uuid-1"));
        let accounts = panel.accounts();
        assert_eq!(accounts.len(), 2);
        let foreign = accounts.iter().find(|a| a.uuid == "foreign").unwrap();
        assert_eq!(foreign.telegram_id, Some(999));
    }

    #[tokio::test]
    async fn transient_failure_leaves_local_state_untouched() {
        let panel = FakePanel::default();
        let store = MemoryStore::with(context(Some(42), Utc::now() + Duration::days(30)));
        let sync = service(&panel, &store);
        sync.provision(1).await.unwrap();
        let writes = store.writes();

        panel.fail_once("get_user", transient("/api/users/uuid-1"));
        let err = sync.resync(1).await.unwrap_err();

        assert!(matches!(err, SyncError::Panel(ref e) if e.is_transient()));
        assert_eq!(store.writes(), writes);
        assert_eq!(store.get(1).user.panel_uuid.as_deref(), Some("uuid-1"));
    }

    #[tokio::test]
    async fn failed_update_is_not_committed() {
        let panel = FakePanel::default();
        panel.insert(FakePanel::account("existing", Some(42)));
        panel.fail_once(
            "update_user",
            PanelError::Api {
                status: 500,
                message: "HTTP 500".into(),
                body: serde_json::json!({}),
            },
        );
        let store = MemoryStore::with(context(Some(42), Utc::now() + Duration::days(30)));

        let err = service(&panel, &store).provision(1).await.unwrap_err();

        assert!(matches!(err, SyncError::Panel(ref e) if e.status() == Some(500)));
        assert_eq!(store.writes(), 0);
        assert_eq!(store.get(1).user.panel_uuid, None);
    }

    #[tokio::test]
    async fn enable_and_disable_tolerate_current_state() {
        let panel = FakePanel::default();
        let store = MemoryStore::with(context(Some(42), Utc::now() + Duration::days(30)));
        let sync = service(&panel, &store);
        sync.provision(1).await.unwrap();

        assert_eq!(sync.disable(1).await.unwrap().action, SyncAction::Disabled);
        assert_eq!(sync.disable(1).await.unwrap().action, SyncAction::Disabled);
        assert_eq!(sync.enable(1).await.unwrap().action, SyncAction::Enabled);
        assert_eq!(sync.enable(1).await.unwrap().action, SyncAction::Enabled);
        assert_eq!(panel.calls("disable_user"), 2);
        assert_eq!(panel.accounts()[0].status, UserStatus::Active);
    }

    #[tokio::test]
    async fn usage_never_decreases_until_reset() {
        let panel = FakePanel::default();
        let store = MemoryStore::with(context(Some(42), Utc::now() + Duration::days(30)));
        let sync = service(&panel, &store);
        sync.provision(1).await.unwrap();

        edit(&store, |ctx| ctx.subscription.traffic_used_gb = 5.0);
        panel.state.lock().unwrap().accounts[0].used_traffic_bytes = 2 * GIB;
        sync.sync_usage(1).await.unwrap();
        assert_eq!(store.get(1).subscription.traffic_used_gb, 5.0);

        panel.state.lock().unwrap().accounts[0].used_traffic_bytes = 7 * GIB;
        let report = sync.sync_usage(1).await.unwrap();
        assert_eq!(report.used_traffic_gb, Some(7.0));
        assert_eq!(store.get(1).subscription.traffic_used_gb, 7.0);

        sync.reset_traffic(1, Some("support request")).await.unwrap();
        assert_eq!(store.get(1).subscription.traffic_used_gb, 0.0);
        assert_eq!(panel.accounts()[0].used_traffic_bytes, 0);
    }

    #[tokio::test]
    async fn unconfigured_panel_short_circuits_every_operation() {
        let store = MemoryStore::with(context(Some(42), Utc::now() + Duration::days(30)));
        let sync: SyncService<FakePanel, MemoryStore> = SyncService::new(
            Err(PanelError::Configuration("panel base_url is empty".into())),
            store.clone(),
            AccountPolicy::from(&SyncSettings::default()),
            SyncOptions::from(&SyncSettings::default()),
        );

        assert!(!sync.is_configured());
        assert!(matches!(
            sync.provision(1).await,
            Err(SyncError::Configuration(_))
        ));
        assert!(matches!(sync.disable(1).await, Err(SyncError::Configuration(_))));
        assert!(matches!(
            sync.list_remote_accounts().await,
            Err(SyncError::Configuration(_))
        ));
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn remove_deletes_or_disables_and_forgets_linkage() {
        let panel = FakePanel::default();
        let store = MemoryStore::with(context(Some(42), Utc::now() + Duration::days(30)));
        let sync = service(&panel, &store);
        sync.provision(1).await.unwrap();

        sync.remove(1).await.unwrap();
        assert!(panel.accounts().is_empty());
        assert_eq!(store.get(1).user.panel_uuid, None);

        let settings = SyncSettings {
            delete_mode: DeleteMode::Disable,
            ..SyncSettings::default()
        };
        let sync = service_with(&panel, &store, settings);
        sync.provision(1).await.unwrap();
        sync.remove(1).await.unwrap();
        assert_eq!(panel.accounts().len(), 1);
        assert_eq!(panel.accounts()[0].status, UserStatus::Disabled);
        assert_eq!(store.get(1).subscription.subscription_url, None);
    }

    #[tokio::test]
    async fn revoked_links_are_stored() {
        let panel = FakePanel::default();
        let store = MemoryStore::with(context(Some(42), Utc::now() + Duration::days(30)));
        let sync = service(&panel, &store);
        sync.provision(1).await.unwrap();

        let report = sync.revoke_links(1).await.unwrap();

        let stored = store.get(1);
        assert_eq!(
            stored.subscription.panel_short_id.as_deref(),
            Some("short-uuid-1-rotated")
        );
        assert_eq!(stored.subscription.subscription_url, report.subscription_url);
    }

    #[tokio::test]
    async fn ensure_synced_is_cheap_when_linked() {
        let panel = FakePanel::default();
        let store = MemoryStore::with(context(Some(42), Utc::now() + Duration::days(30)));
        let sync = service(&panel, &store);
        sync.provision(1).await.unwrap();

        let report = sync.ensure_synced(1).await.unwrap();

        assert_eq!(report.action, SyncAction::Unchanged);
        assert_eq!(panel.calls("update_user"), 0);
        assert!(report.subscription_url.is_some());
    }

    #[tokio::test]
    async fn unlinked_and_unknown_subscriptions_are_reported() {
        let panel = FakePanel::default();
        let store = MemoryStore::with(context(Some(42), Utc::now() + Duration::days(30)));
        let sync = service(&panel, &store);

        assert!(matches!(sync.enable(1).await, Err(SyncError::NotLinked(1))));
        assert!(matches!(
            sync.resync(7).await,
            Err(SyncError::MissingRecord(7))
        ));
    }

    #[tokio::test]
    async fn provision_reset_lands_with_linkage_or_not_at_all() {
        let panel = FakePanel::default();
        let store = MemoryStore::with(context(Some(42), Utc::now() + Duration::days(30)));
        edit(&store, |ctx| ctx.subscription.traffic_used_gb = 12.5);
        let sync = service(&panel, &store);
        let options = ProvisionOptions {
            reset_traffic: true,
            reset_reason: Some("renewal".into()),
        };

        store.fail_next_write();
        let failed = sync.provision_with(1, options.clone()).await;
        assert!(matches!(failed, Err(SyncError::Storage(_))));
        assert_eq!(panel.calls("reset_traffic"), 1);
        let stored = store.get(1);
        assert_eq!(stored.user.panel_uuid, None);
        assert_eq!(stored.subscription.panel_short_id, None);
        assert_eq!(stored.subscription.traffic_used_gb, 12.5);
        assert_eq!(store.writes(), 0);

        let report = sync.provision_with(1, options).await.unwrap();
        assert_eq!(report.action, SyncAction::Adopted);
        let stored = store.get(1);
        assert_eq!(stored.user.panel_uuid.as_deref(), Some("uuid-1"));
        assert_eq!(stored.subscription.traffic_used_gb, 0.0);
        assert_eq!(store.writes(), 1);
    }
}
