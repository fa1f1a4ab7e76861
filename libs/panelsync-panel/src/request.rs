use reqwest::Method;
use serde_json::{Value, json};

use crate::error::{PanelError, Result};
use crate::models::{CreateUserRequest, RevokeRequest, UpdateUserRequest};

/// Every call the workspace makes to the panel.
#[derive(Debug, Clone, PartialEq)]
pub enum PanelRequest {
    GetUser { uuid: String },
    FindByTelegramId { telegram_id: i64 },
    FindByEmail { email: String },
    FindByUsername { username: String },
    CreateUser(CreateUserRequest),
    UpdateUser(UpdateUserRequest),
    DeleteUser { uuid: String },
    EnableUser { uuid: String },
    DisableUser { uuid: String },
    ResetTraffic { uuid: String },
    RevokeSubscription { uuid: String, revoke: RevokeRequest },
    ListUsers { start: u32, size: u32 },
    EncryptLink { link: String },
    ListServerGroups,
    GetUserDevices { uuid: String },
    DeleteUserDevice { user_uuid: String, hwid: String },
}

fn segment(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

impl PanelRequest {
    pub fn method(&self) -> Method {
        match self {
            PanelRequest::GetUser { .. }
            | PanelRequest::FindByTelegramId { .. }
            | PanelRequest::FindByEmail { .. }
            | PanelRequest::FindByUsername { .. }
            | PanelRequest::ListUsers { .. }
            | PanelRequest::ListServerGroups
            | PanelRequest::GetUserDevices { .. } => Method::GET,
            PanelRequest::CreateUser(_)
            | PanelRequest::EnableUser { .. }
            | PanelRequest::DisableUser { .. }
            | PanelRequest::ResetTraffic { .. }
            | PanelRequest::RevokeSubscription { .. }
            | PanelRequest::EncryptLink { .. }
            | PanelRequest::DeleteUserDevice { .. } => Method::POST,
            PanelRequest::UpdateUser(_) => Method::PATCH,
            PanelRequest::DeleteUser { .. } => Method::DELETE,
        }
    }

    pub fn path(&self) -> String {
        match self {
            PanelRequest::GetUser { uuid } | PanelRequest::DeleteUser { uuid } => {
                format!("/api/users/{}", segment(uuid))
            }
            PanelRequest::FindByTelegramId { telegram_id } => {
                format!("/api/users/by-telegram-id/{}", telegram_id)
            }
            PanelRequest::FindByEmail { email } => {
                format!("/api/users/by-email/{}", segment(email))
            }
            PanelRequest::FindByUsername { username } => {
                format!("/api/users/by-username/{}", segment(username))
            }
            PanelRequest::CreateUser(_)
            | PanelRequest::UpdateUser(_)
            | PanelRequest::ListUsers { .. } => "/api/users".to_string(),
            PanelRequest::EnableUser { uuid } => {
                format!("/api/users/{}/actions/enable", segment(uuid))
            }
            PanelRequest::DisableUser { uuid } => {
                format!("/api/users/{}/actions/disable", segment(uuid))
            }
            PanelRequest::ResetTraffic { uuid } => {
                format!("/api/users/{}/actions/reset-traffic", segment(uuid))
            }
            PanelRequest::RevokeSubscription { uuid, .. } => {
                format!("/api/users/{}/actions/revoke", segment(uuid))
            }
            PanelRequest::EncryptLink { .. } => "/api/system/tools/happ/encrypt".to_string(),
            PanelRequest::ListServerGroups => "/api/internal-squads".to_string(),
            PanelRequest::GetUserDevices { uuid } => {
                format!("/api/hwid/devices/{}", segment(uuid))
            }
            PanelRequest::DeleteUserDevice { .. } => "/api/hwid/devices/delete".to_string(),
        }
    }

    pub fn query(&self) -> Vec<(&'static str, String)> {
        match self {
            PanelRequest::ListUsers { start, size } => {
                vec![("start", start.to_string()), ("size", size.to_string())]
            }
            _ => Vec::new(),
        }
    }

    pub fn body(&self) -> Result<Option<Value>> {
        let body = match self {
            PanelRequest::CreateUser(create) => serde_json::to_value(create),
            PanelRequest::UpdateUser(update) => serde_json::to_value(update),
            PanelRequest::RevokeSubscription { revoke, .. } => serde_json::to_value(revoke),
            PanelRequest::EncryptLink { link } => Ok(json!({ "linkToEncrypt": link })),
            PanelRequest::DeleteUserDevice { user_uuid, hwid } => {
                Ok(json!({ "userUuid": user_uuid, "hwid": hwid }))
            }
            _ => return Ok(None),
        };
        body.map(Some)
            .map_err(|e| PanelError::Decode(format!("cannot encode request body: {}", e)))
    }

    /// Short name used in log lines.
    pub fn operation(&self) -> &'static str {
        match self {
            PanelRequest::GetUser { .. } => "get_user",
            PanelRequest::FindByTelegramId { .. } => "find_by_telegram_id",
            PanelRequest::FindByEmail { .. } => "find_by_email",
            PanelRequest::FindByUsername { .. } => "find_by_username",
            PanelRequest::CreateUser(_) => "create_user",
            PanelRequest::UpdateUser(_) => "update_user",
            PanelRequest::DeleteUser { .. } => "delete_user",
            PanelRequest::EnableUser { .. } => "enable_user",
            PanelRequest::DisableUser { .. } => "disable_user",
            PanelRequest::ResetTraffic { .. } => "reset_traffic",
            PanelRequest::RevokeSubscription { .. } => "revoke_subscription",
            PanelRequest::ListUsers { .. } => "list_users",
            PanelRequest::EncryptLink { .. } => "encrypt_link",
            PanelRequest::ListServerGroups => "list_server_groups",
            PanelRequest::GetUserDevices { .. } => "get_user_devices",
            PanelRequest::DeleteUserDevice { .. } => "delete_user_device",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_escape_path_segments() {
        let request = PanelRequest::FindByEmail {
            email: "a b@example.com".into(),
        };
        assert_eq!(request.method(), Method::GET);
        assert_eq!(request.path(), "/api/users/by-email/a%20b%40example.com");
    }

    #[test]
    fn revoke_without_options_sends_empty_object() {
        let request = PanelRequest::RevokeSubscription {
            uuid: "u1".into(),
            revoke: RevokeRequest::default(),
        };
        assert_eq!(request.path(), "/api/users/u1/actions/revoke");
        assert_eq!(request.body().unwrap(), Some(json!({})));
    }

    #[test]
    fn paging_goes_into_query() {
        let request = PanelRequest::ListUsers { start: 200, size: 100 };
        assert_eq!(request.path(), "/api/users");
        assert_eq!(
            request.query(),
            vec![("start", "200".to_string()), ("size", "100".to_string())]
        );
        assert_eq!(request.body().unwrap(), None);
    }
}
