//! In-memory stand-ins for the panel and the database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use panelsync_panel::{
    CreateUserRequest, HwidDevice, PanelApi, PanelError, PanelGateway, PanelUser, RevokeRequest,
    ServerGroup, TrafficResetStrategy, UpdateUserRequest, UserPage, UserStatus,
};
use serde_json::json;

use crate::services::store::{PanelLinkage, SubscriptionContext, SubscriptionStore};

#[derive(Default)]
pub struct PanelState {
    pub accounts: Vec<PanelUser>,
    pub calls: Vec<String>,
    /// Errors returned once by the named operation.
    pub failures: HashMap<&'static str, PanelError>,
    pub created: u32,
}

#[derive(Clone, Default)]
pub struct FakePanel {
    pub state: Arc<Mutex<PanelState>>,
}

pub fn not_found() -> PanelError {
    PanelError::Api {
        status: 404,
        message: "User not found".into(),
        body: json!({ "message": "User not found" }),
    }
}

pub fn transient(path: &str) -> PanelError {
    PanelError::Transport {
        method: "GET".into(),
        path: path.into(),
        attempts: 4,
        message: "connection reset by peer".into(),
    }
}

impl FakePanel {
    pub fn fail_once(&self, operation: &'static str, error: PanelError) {
        self.state.lock().unwrap().failures.insert(operation, error);
    }

    pub fn accounts(&self) -> Vec<PanelUser> {
        self.state.lock().unwrap().accounts.clone()
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.as_str() == operation)
            .count()
    }

    pub fn insert(&self, account: PanelUser) {
        self.state.lock().unwrap().accounts.push(account);
    }

    pub fn account(uuid: &str, telegram_id: Option<i64>) -> PanelUser {
        PanelUser {
            uuid: uuid.into(),
            short_uuid: format!("short-{}", uuid),
            username: format!("user_{}", uuid),
            status: UserStatus::Active,
            traffic_limit_bytes: 0,
            traffic_limit_strategy: TrafficResetStrategy::NoReset,
            expire_at: Utc::now(),
            telegram_id,
            email: None,
            hwid_device_limit: None,
            description: None,
            tag: None,
            subscription_url: Some(format!("https://sub.example.com/short-{}", uuid)),
            crypto_link: None,
            server_groups: Vec::new(),
            used_traffic_bytes: 0,
            lifetime_used_traffic_bytes: 0,
            online_at: None,
            created_at: None,
            updated_at: None,
        }
    }

    fn enter(&self, operation: &'static str) -> Result<(), PanelError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(operation.to_string());
        match state.failures.remove(operation) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn with_account<T>(
        &self,
        uuid: &str,
        f: impl FnOnce(&mut PanelUser) -> Result<T, PanelError>,
    ) -> Result<T, PanelError> {
        let mut state = self.state.lock().unwrap();
        match state.accounts.iter_mut().find(|a| a.uuid == uuid) {
            Some(account) => f(account),
            None => Err(not_found()),
        }
    }
}

impl PanelGateway for FakePanel {
    type Session = FakePanel;

    fn open_session(&self) -> Result<FakePanel, PanelError> {
        Ok(self.clone())
    }
}

#[async_trait]
impl PanelApi for FakePanel {
    async fn get_user(&self, uuid: &str) -> Result<Option<PanelUser>, PanelError> {
        self.enter("get_user")?;
        match self.with_account(uuid, |a| Ok(a.clone())) {
            Ok(account) => Ok(Some(account)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn find_by_telegram_id(&self, telegram_id: i64) -> Result<Vec<PanelUser>, PanelError> {
        self.enter("find_by_telegram_id")?;
        Ok(self
            .accounts()
            .into_iter()
            .filter(|a| a.telegram_id == Some(telegram_id))
            .collect())
    }

    async fn find_by_email(&self, email: &str) -> Result<Vec<PanelUser>, PanelError> {
        self.enter("find_by_email")?;
        Ok(self
            .accounts()
            .into_iter()
            .filter(|a| a.email.as_deref() == Some(email))
            .collect())
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<PanelUser>, PanelError> {
        self.enter("find_by_username")?;
        Ok(self.accounts().into_iter().find(|a| a.username == username))
    }

    async fn create_user(&self, request: CreateUserRequest) -> Result<PanelUser, PanelError> {
        self.enter("create_user")?;
        let mut state = self.state.lock().unwrap();
        state.created += 1;
        let uuid = format!("uuid-{}", state.created);
        let mut account = FakePanel::account(&uuid, request.telegram_id);
        account.username = request.username;
        account.status = request.status;
        account.expire_at = request.expire_at;
        account.traffic_limit_bytes = request.traffic_limit_bytes;
        account.traffic_limit_strategy = request.traffic_limit_strategy;
        account.email = request.email;
        account.hwid_device_limit = request.hwid_device_limit;
        account.description = request.description;
        account.tag = request.tag;
        account.server_groups = request.active_internal_squads;
        account.crypto_link = Some(format!("happ://crypt/{}", uuid));
        state.accounts.push(account.clone());
        Ok(account)
    }

    async fn update_user(&self, request: UpdateUserRequest) -> Result<PanelUser, PanelError> {
        self.enter("update_user")?;
        self.with_account(&request.uuid.clone(), move |a| {
            if let Some(status) = request.status {
                a.status = status;
            }
            if let Some(expire_at) = request.expire_at {
                a.expire_at = expire_at;
            }
            if let Some(bytes) = request.traffic_limit_bytes {
                a.traffic_limit_bytes = bytes;
            }
            if let Some(strategy) = request.traffic_limit_strategy {
                a.traffic_limit_strategy = strategy;
            }
            if request.telegram_id.is_some() {
                a.telegram_id = request.telegram_id;
            }
            if request.email.is_some() {
                a.email = request.email;
            }
            if request.hwid_device_limit.is_some() {
                a.hwid_device_limit = request.hwid_device_limit;
            }
            if request.description.is_some() {
                a.description = request.description;
            }
            a.tag = request.tag.or(a.tag.take());
            if let Some(groups) = request.active_internal_squads {
                a.server_groups = groups;
            }
            Ok(a.clone())
        })
    }

    async fn delete_user(&self, uuid: &str) -> Result<bool, PanelError> {
        self.enter("delete_user")?;
        let mut state = self.state.lock().unwrap();
        let before = state.accounts.len();
        state.accounts.retain(|a| a.uuid != uuid);
        if state.accounts.len() == before {
            return Err(not_found());
        }
        Ok(true)
    }

    async fn enable_user(&self, uuid: &str) -> Result<PanelUser, PanelError> {
        self.enter("enable_user")?;
        self.with_account(uuid, |a| set_status(a, UserStatus::Active, "enabled"))
    }

    async fn disable_user(&self, uuid: &str) -> Result<PanelUser, PanelError> {
        self.enter("disable_user")?;
        self.with_account(uuid, |a| set_status(a, UserStatus::Disabled, "disabled"))
    }

    async fn reset_traffic(&self, uuid: &str) -> Result<PanelUser, PanelError> {
        self.enter("reset_traffic")?;
        self.with_account(uuid, |a| {
            a.used_traffic_bytes = 0;
            Ok(a.clone())
        })
    }

    async fn revoke_subscription(
        &self,
        uuid: &str,
        _revoke: RevokeRequest,
    ) -> Result<PanelUser, PanelError> {
        self.enter("revoke_subscription")?;
        self.with_account(uuid, |a| {
            a.short_uuid = format!("{}-rotated", a.short_uuid);
            a.subscription_url = Some(format!("https://sub.example.com/{}", a.short_uuid));
            a.crypto_link = None;
            Ok(a.clone())
        })
    }

    async fn list_users(&self, start: u32, size: u32) -> Result<UserPage, PanelError> {
        self.enter("list_users")?;
        let accounts = self.accounts();
        let total = accounts.len() as u64;
        let users = accounts
            .into_iter()
            .skip(start as usize)
            .take(size as usize)
            .collect();
        Ok(UserPage { users, total })
    }

    async fn encrypt_link(&self, link: &str) -> Result<Option<String>, PanelError> {
        self.enter("encrypt_link")?;
        Ok(Some(format!("happ://crypt/{}", link)))
    }

    async fn list_server_groups(&self) -> Result<Vec<ServerGroup>, PanelError> {
        self.enter("list_server_groups")?;
        Ok(Vec::new())
    }

    async fn get_user_devices(&self, _uuid: &str) -> Result<Vec<HwidDevice>, PanelError> {
        self.enter("get_user_devices")?;
        Ok(Vec::new())
    }

    async fn delete_user_device(&self, _uuid: &str, _hwid: &str) -> Result<(), PanelError> {
        self.enter("delete_user_device")?;
        Ok(())
    }
}

fn set_status(
    account: &mut PanelUser,
    status: UserStatus,
    word: &str,
) -> Result<PanelUser, PanelError> {
    if account.status == status {
        let message = format!("User already {}", word);
        return Err(PanelError::Api {
            status: 400,
            body: json!({ "message": message }),
            message,
        });
    }
    account.status = status;
    Ok(account.clone())
}

#[derive(Default)]
pub struct StoreState {
    pub records: HashMap<i64, SubscriptionContext>,
    pub writes: usize,
    /// The next write is rejected without touching any record.
    pub fail_next_write: bool,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    pub state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    pub fn with(ctx: SubscriptionContext) -> Self {
        let store = MemoryStore::default();
        store
            .state
            .lock()
            .unwrap()
            .records
            .insert(ctx.subscription.id, ctx);
        store
    }

    pub fn get(&self, subscription_id: i64) -> SubscriptionContext {
        self.state.lock().unwrap().records[&subscription_id].clone()
    }

    pub fn writes(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    pub fn fail_next_write(&self) {
        self.state.lock().unwrap().fail_next_write = true;
    }

    fn update(&self, subscription_id: i64, f: impl FnOnce(&mut SubscriptionContext)) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if std::mem::take(&mut state.fail_next_write) {
            anyhow::bail!("write to subscription {} rejected", subscription_id);
        }
        state.writes += 1;
        let ctx = state
            .records
            .get_mut(&subscription_id)
            .ok_or_else(|| anyhow::anyhow!("no subscription {}", subscription_id))?;
        f(ctx);
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn load(&self, subscription_id: i64) -> anyhow::Result<Option<SubscriptionContext>> {
        Ok(self.state.lock().unwrap().records.get(&subscription_id).cloned())
    }

    async fn commit_linkage(
        &self,
        subscription_id: i64,
        _user_id: i64,
        linkage: &PanelLinkage,
    ) -> anyhow::Result<()> {
        self.update(subscription_id, |ctx| {
            ctx.user.panel_uuid = Some(linkage.panel_uuid.clone());
            ctx.subscription.panel_short_id = Some(linkage.short_id.clone());
            ctx.subscription.subscription_url = linkage.subscription_url.clone();
            ctx.subscription.crypto_link = linkage.crypto_link.clone();
            if linkage.reset_traffic_used {
                ctx.subscription.traffic_used_gb = 0.0;
            }
        })
    }

    async fn clear_linkage(&self, subscription_id: i64, _user_id: i64) -> anyhow::Result<()> {
        self.update(subscription_id, |ctx| {
            ctx.user.panel_uuid = None;
            ctx.subscription.panel_short_id = None;
            ctx.subscription.subscription_url = None;
            ctx.subscription.crypto_link = None;
        })
    }

    async fn update_links(
        &self,
        subscription_id: i64,
        subscription_url: Option<&str>,
        crypto_link: Option<&str>,
    ) -> anyhow::Result<()> {
        self.update(subscription_id, |ctx| {
            ctx.subscription.subscription_url = subscription_url.map(str::to_string);
            ctx.subscription.crypto_link = crypto_link.map(str::to_string);
        })
    }

    async fn record_traffic_used(&self, subscription_id: i64, used_gb: f64) -> anyhow::Result<()> {
        self.update(subscription_id, |ctx| {
            ctx.subscription.traffic_used_gb = ctx.subscription.traffic_used_gb.max(used_gb);
        })
    }

    async fn reset_traffic_used(&self, subscription_id: i64) -> anyhow::Result<()> {
        self.update(subscription_id, |ctx| ctx.subscription.traffic_used_gb = 0.0)
    }
}
