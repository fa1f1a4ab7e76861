use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderValue, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::api::{PanelApi, PanelGateway};
use crate::auth::ConnectionKind;
use crate::config::PanelConfig;
use crate::error::{PanelError, Result, error_message, parse_body};
use crate::models::{
    self, CreateUserRequest, HwidDevice, PanelUser, RevokeRequest, ServerGroup,
    UpdateUserRequest, UserPage,
};
use crate::request::PanelRequest;
use crate::retry::{self, AttemptOutcome, RetryPolicy};

#[derive(Debug, Clone)]
pub struct PanelClient {
    config: Arc<PanelConfig>,
}

impl PanelClient {
    pub fn new(config: PanelConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &PanelConfig {
        &self.config
    }

    pub fn session(&self) -> Result<PanelSession> {
        PanelSession::open(&self.config)
    }
}

impl PanelGateway for PanelClient {
    type Session = PanelSession;

    fn open_session(&self) -> Result<PanelSession> {
        self.session()
    }
}

/// One HTTP connection pool scoped to a single engine operation.
pub struct PanelSession {
    http: Client,
    base_url: String,
    retry: RetryPolicy,
}

impl PanelSession {
    fn open(config: &PanelConfig) -> Result<Self> {
        let kind = config.connection_kind();
        let mut headers = config.credentials.headers()?;
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.extend(kind.forwarding_headers());

        let mut builder = Client::builder()
            .default_headers(headers)
            .user_agent(concat!("panelsync/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout);

        // Locally reached panels usually sit behind a self-signed proxy.
        if kind == ConnectionKind::Private && config.is_https() {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let http = builder
            .build()
            .map_err(|e| PanelError::Configuration(format!("cannot build HTTP client: {}", e)))?;

        debug!(
            "Opened panel session to {} ({:?})",
            config.base_url(),
            kind
        );

        Ok(Self {
            http,
            base_url: config.base_url().to_string(),
            retry: config.retry,
        })
    }

    /// Sends `request` with retries and returns the decoded JSON body.
    pub async fn dispatch(&self, request: &PanelRequest) -> Result<Value> {
        let body = request.body()?;
        let method = request.method();
        let path = request.path();
        debug!("Panel {} {} ({})", method, path, request.operation());

        retry::run(
            &self.retry,
            method.as_str(),
            &path,
            |_| self.attempt(request, &path, body.as_ref()),
            tokio::time::sleep,
        )
        .await
    }

    async fn attempt(
        &self,
        request: &PanelRequest,
        path: &str,
        body: Option<&Value>,
    ) -> AttemptOutcome<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.http.request(request.method(), &url);
        let query = request.query();
        if !query.is_empty() {
            builder = builder.query(&query);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => return AttemptOutcome::TransportError(e.to_string()),
        };

        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(retry::parse_retry_after);

        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => return AttemptOutcome::TransportError(e.to_string()),
        };

        if status == StatusCode::TOO_MANY_REQUESTS {
            return AttemptOutcome::RateLimited { retry_after };
        }

        let parsed = parse_body(&text);
        if status.is_client_error() || status.is_server_error() {
            let message = error_message(status.as_u16(), &parsed);
            if matches!(status.as_u16(), 502..=504) {
                warn!(
                    "Panel {} {} unavailable ({}): {}",
                    request.method(),
                    path,
                    status,
                    message
                );
            } else if status == StatusCode::NOT_FOUND {
                debug!("Panel {} {} returned 404", request.method(), path);
            } else {
                error!(
                    "Panel {} {} failed ({}): {}",
                    request.method(),
                    path,
                    status,
                    message
                );
            }
            return AttemptOutcome::Finished(Err(PanelError::Api {
                status: status.as_u16(),
                message,
                body: parsed,
            }));
        }

        AttemptOutcome::Finished(Ok(parsed))
    }

    async fn fetch(&self, request: PanelRequest) -> Result<Value> {
        let value = self.dispatch(&request).await?;
        models::unwrap_envelope(value)
    }

    async fn fetch_user(&self, request: PanelRequest) -> Result<PanelUser> {
        let user = models::parse_user(self.fetch(request).await?)?;
        Ok(self.with_crypto_link(user).await)
    }

    /// Best effort: a failed encryption never fails the surrounding call.
    async fn with_crypto_link(&self, mut user: PanelUser) -> PanelUser {
        if user.crypto_link.is_some() {
            return user;
        }
        let Some(link) = user.subscription_url.clone() else {
            return user;
        };
        match self.encrypt_link(&link).await {
            Ok(encrypted) => user.crypto_link = encrypted,
            Err(e) => warn!("Failed to encrypt subscription link for {}: {}", user.uuid, e),
        }
        user
    }
}

fn not_found_as<T>(result: Result<T>, fallback: T) -> Result<T> {
    match result {
        Err(e) if e.is_not_found() => Ok(fallback),
        other => other,
    }
}

#[async_trait]
impl PanelApi for PanelSession {
    async fn get_user(&self, uuid: &str) -> Result<Option<PanelUser>> {
        let result = self
            .fetch_user(PanelRequest::GetUser {
                uuid: uuid.to_string(),
            })
            .await
            .map(Some);
        not_found_as(result, None)
    }

    async fn find_by_telegram_id(&self, telegram_id: i64) -> Result<Vec<PanelUser>> {
        let result = self
            .fetch(PanelRequest::FindByTelegramId { telegram_id })
            .await
            .and_then(models::parse_user_list);
        not_found_as(result, Vec::new())
    }

    async fn find_by_email(&self, email: &str) -> Result<Vec<PanelUser>> {
        let result = self
            .fetch(PanelRequest::FindByEmail {
                email: email.to_string(),
            })
            .await
            .and_then(models::parse_user_list);
        not_found_as(result, Vec::new())
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<PanelUser>> {
        let result = self
            .fetch(PanelRequest::FindByUsername {
                username: username.to_string(),
            })
            .await
            .and_then(models::parse_user_list)
            .map(|users| users.into_iter().next());
        not_found_as(result, None)
    }

    async fn create_user(&self, request: CreateUserRequest) -> Result<PanelUser> {
        self.fetch_user(PanelRequest::CreateUser(request)).await
    }

    async fn update_user(&self, request: UpdateUserRequest) -> Result<PanelUser> {
        self.fetch_user(PanelRequest::UpdateUser(request)).await
    }

    async fn delete_user(&self, uuid: &str) -> Result<bool> {
        let value = self
            .fetch(PanelRequest::DeleteUser {
                uuid: uuid.to_string(),
            })
            .await?;
        Ok(value
            .get("isDeleted")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    async fn enable_user(&self, uuid: &str) -> Result<PanelUser> {
        let value = self
            .fetch(PanelRequest::EnableUser {
                uuid: uuid.to_string(),
            })
            .await?;
        models::parse_user(value)
    }

    async fn disable_user(&self, uuid: &str) -> Result<PanelUser> {
        let value = self
            .fetch(PanelRequest::DisableUser {
                uuid: uuid.to_string(),
            })
            .await?;
        models::parse_user(value)
    }

    async fn reset_traffic(&self, uuid: &str) -> Result<PanelUser> {
        let value = self
            .fetch(PanelRequest::ResetTraffic {
                uuid: uuid.to_string(),
            })
            .await?;
        models::parse_user(value)
    }

    async fn revoke_subscription(&self, uuid: &str, revoke: RevokeRequest) -> Result<PanelUser> {
        self.fetch_user(PanelRequest::RevokeSubscription {
            uuid: uuid.to_string(),
            revoke,
        })
        .await
    }

    async fn list_users(&self, start: u32, size: u32) -> Result<UserPage> {
        let value = self.fetch(PanelRequest::ListUsers { start, size }).await?;
        models::parse_page(value)
    }

    async fn encrypt_link(&self, link: &str) -> Result<Option<String>> {
        let value = self
            .fetch(PanelRequest::EncryptLink {
                link: link.to_string(),
            })
            .await?;
        Ok(value
            .get("encryptedLink")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string))
    }

    async fn list_server_groups(&self) -> Result<Vec<ServerGroup>> {
        let value = self.fetch(PanelRequest::ListServerGroups).await?;
        let groups = value.get("internalSquads").cloned().unwrap_or(value);
        serde_json::from_value(groups)
            .map_err(|e| PanelError::Decode(format!("internal squads: {}", e)))
    }

    async fn get_user_devices(&self, uuid: &str) -> Result<Vec<HwidDevice>> {
        let result = self
            .fetch(PanelRequest::GetUserDevices {
                uuid: uuid.to_string(),
            })
            .await;
        let value = match not_found_as(result.map(Some), None)? {
            Some(value) => value,
            None => return Ok(Vec::new()),
        };
        let devices = value.get("devices").cloned().unwrap_or(value);
        serde_json::from_value(devices).map_err(|e| PanelError::Decode(format!("devices: {}", e)))
    }

    async fn delete_user_device(&self, uuid: &str, hwid: &str) -> Result<()> {
        self.fetch(PanelRequest::DeleteUserDevice {
            user_uuid: uuid.to_string(),
            hwid: hwid.to_string(),
        })
        .await
        .map(|_| ())
    }
}
