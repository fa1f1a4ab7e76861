//! Typed client for the remote provisioning panel.
//!
//! Every remote call goes through [`PanelSession::dispatch`], which owns
//! authentication headers, retry/backoff and response decoding. Callers
//! work against the [`PanelApi`] trait so the reconciliation engine can be
//! exercised without a live panel.

pub mod api;
pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod models;
pub mod request;
pub mod retry;

pub use api::{PanelApi, PanelGateway};
pub use auth::{AuthScheme, ConnectionKind, Credentials};
pub use client::{PanelClient, PanelSession};
pub use config::PanelConfig;
pub use error::{PanelError, Result};
pub use models::{
    CreateUserRequest, HwidDevice, PanelUser, RevokeRequest, ServerGroup, TrafficResetStrategy,
    UpdateUserRequest, UserPage, UserStatus,
};
pub use request::PanelRequest;
pub use retry::RetryPolicy;
