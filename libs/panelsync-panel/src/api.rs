use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::{
    CreateUserRequest, HwidDevice, PanelUser, RevokeRequest, ServerGroup, UpdateUserRequest,
    UserPage,
};

/// Typed operations against the remote panel.
#[async_trait]
pub trait PanelApi: Send + Sync {
    /// `None` when the panel reports the account as missing.
    async fn get_user(&self, uuid: &str) -> Result<Option<PanelUser>>;
    async fn find_by_telegram_id(&self, telegram_id: i64) -> Result<Vec<PanelUser>>;
    async fn find_by_email(&self, email: &str) -> Result<Vec<PanelUser>>;
    async fn find_by_username(&self, username: &str) -> Result<Option<PanelUser>>;
    async fn create_user(&self, request: CreateUserRequest) -> Result<PanelUser>;
    async fn update_user(&self, request: UpdateUserRequest) -> Result<PanelUser>;
    async fn delete_user(&self, uuid: &str) -> Result<bool>;
    async fn enable_user(&self, uuid: &str) -> Result<PanelUser>;
    async fn disable_user(&self, uuid: &str) -> Result<PanelUser>;
    async fn reset_traffic(&self, uuid: &str) -> Result<PanelUser>;
    async fn revoke_subscription(&self, uuid: &str, revoke: RevokeRequest) -> Result<PanelUser>;
    async fn list_users(&self, start: u32, size: u32) -> Result<UserPage>;
    /// Encrypted form of a subscription link, if the panel supports it.
    async fn encrypt_link(&self, link: &str) -> Result<Option<String>>;
    async fn list_server_groups(&self) -> Result<Vec<ServerGroup>>;
    async fn get_user_devices(&self, uuid: &str) -> Result<Vec<HwidDevice>>;
    async fn delete_user_device(&self, uuid: &str, hwid: &str) -> Result<()>;

    /// Walks `list_users` until the reported total is reached. An empty
    /// page also ends the walk.
    async fn list_all_users(&self, page_size: u32) -> Result<Vec<PanelUser>> {
        let size = page_size.max(1);
        let mut users = Vec::new();
        let mut start = 0u32;

        loop {
            let page = self.list_users(start, size).await?;
            if page.users.is_empty() {
                break;
            }
            let fetched = page.users.len() as u32;
            users.extend(page.users);
            start = start.saturating_add(fetched);
            debug!("Fetched {}/{} panel users", users.len(), page.total);
            if u64::from(start) >= page.total {
                break;
            }
        }

        Ok(users)
    }

    /// Removes every registered device. Returns how many were deleted.
    async fn reset_user_devices(&self, uuid: &str) -> Result<usize> {
        let devices = self.get_user_devices(uuid).await?;
        let mut removed = 0;
        for device in &devices {
            match self.delete_user_device(uuid, &device.hwid).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to delete device {} of {}: {}", device.hwid, uuid, e),
            }
        }
        Ok(removed)
    }
}

/// Hands out short-lived sessions. A session is dropped at the end of the
/// operation that opened it.
pub trait PanelGateway: Send + Sync {
    type Session: PanelApi;

    fn open_session(&self) -> Result<Self::Session>;
}
