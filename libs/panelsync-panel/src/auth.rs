use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::header::{AUTHORIZATION, COOKIE, HOST, HeaderMap, HeaderName, HeaderValue};
use url::{Host, Url};

use crate::error::{PanelError, Result};

const X_API_KEY: HeaderName = HeaderName::from_static("x-api-key");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthScheme {
    #[default]
    ApiKey,
    Basic,
    Bearer,
    Cookie,
    /// Only the reverse-proxy gateway token is sent.
    Gateway,
}

impl FromStr for AuthScheme {
    type Err = PanelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "api_key" | "api-key" | "apikey" => Ok(AuthScheme::ApiKey),
            "basic" | "basic_auth" => Ok(AuthScheme::Basic),
            "bearer" => Ok(AuthScheme::Bearer),
            "cookie" | "cookies" => Ok(AuthScheme::Cookie),
            "gateway" | "caddy" => Ok(AuthScheme::Gateway),
            other => Err(PanelError::Configuration(format!(
                "unknown auth type '{}'",
                other
            ))),
        }
    }
}

/// Panel credentials. Secrets never show up in `Debug` output.
#[derive(Clone, Default)]
pub struct Credentials {
    pub scheme: AuthScheme,
    pub api_key: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// `name:value`, or a bare name used as both.
    pub secret_cookie: Option<String>,
    /// Sent as `Authorization: Basic <token>` in front of any other scheme.
    pub gateway_token: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn mask(v: &Option<String>) -> &'static str {
            if v.as_deref().is_some_and(|s| !s.is_empty()) {
                "<redacted>"
            } else {
                "<none>"
            }
        }
        f.debug_struct("Credentials")
            .field("scheme", &self.scheme)
            .field("api_key", &mask(&self.api_key))
            .field("username", &self.username)
            .field("password", &mask(&self.password))
            .field("secret_cookie", &mask(&self.secret_cookie))
            .field("gateway_token", &mask(&self.gateway_token))
            .finish()
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn secret_header(value: &str) -> Result<HeaderValue> {
    let mut header = HeaderValue::from_str(value).map_err(|_| {
        PanelError::Configuration("credential contains characters not allowed in headers".into())
    })?;
    header.set_sensitive(true);
    Ok(header)
}

impl Credentials {
    pub fn api_key(key: impl Into<String>) -> Self {
        Self {
            scheme: AuthScheme::ApiKey,
            api_key: Some(key.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_gateway_token(mut self, token: impl Into<String>) -> Self {
        self.gateway_token = Some(token.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        let missing = |what: &str| {
            Err(PanelError::Configuration(format!(
                "{} is required for {:?} auth",
                what, self.scheme
            )))
        };
        match self.scheme {
            AuthScheme::ApiKey | AuthScheme::Bearer if present(&self.api_key).is_none() => {
                missing("api_key")
            }
            AuthScheme::Basic
                if present(&self.username).is_none() || present(&self.password).is_none() =>
            {
                missing("username and password")
            }
            AuthScheme::Cookie if present(&self.secret_cookie).is_none() => {
                missing("secret_cookie")
            }
            AuthScheme::Gateway if present(&self.gateway_token).is_none() => {
                missing("gateway_token")
            }
            _ => Ok(()),
        }
    }

    /// `(name, value)` of the secret cookie, if one is configured.
    pub fn cookie(&self) -> Option<(String, String)> {
        let raw = present(&self.secret_cookie)?;
        match raw.split_once(':') {
            Some((name, value)) => Some((name.trim().to_string(), value.trim().to_string())),
            None => Some((raw.to_string(), raw.to_string())),
        }
    }

    /// Authentication headers for every request of a session.
    pub fn headers(&self) -> Result<HeaderMap> {
        self.validate()?;
        let mut headers = HeaderMap::new();
        let gateway = present(&self.gateway_token);

        if let Some(token) = gateway {
            headers.insert(AUTHORIZATION, secret_header(&format!("Basic {}", token))?);
        }

        match self.scheme {
            AuthScheme::ApiKey | AuthScheme::Gateway => {
                if let Some(key) = present(&self.api_key) {
                    headers.insert(X_API_KEY, secret_header(key)?);
                }
            }
            AuthScheme::Basic => {
                let user = present(&self.username).unwrap_or_default();
                let pass = present(&self.password).unwrap_or_default();
                let encoded = STANDARD.encode(format!("{}:{}", user, pass));
                headers.insert(X_API_KEY, secret_header(&format!("Basic {}", encoded))?);
            }
            AuthScheme::Bearer => {
                let token = present(&self.api_key).unwrap_or_default();
                headers.insert(X_API_KEY, secret_header(token)?);
                if gateway.is_none() {
                    headers.insert(AUTHORIZATION, secret_header(&format!("Bearer {}", token))?);
                }
            }
            AuthScheme::Cookie => {
                if let Some((name, value)) = self.cookie() {
                    headers.insert(COOKIE, secret_header(&format!("{}={}", name, value))?);
                }
                if let Some(key) = present(&self.api_key) {
                    headers.insert(X_API_KEY, secret_header(key)?);
                }
            }
        }

        Ok(headers)
    }
}

/// Whether the panel is reached directly on a private network or through
/// the public internet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Private,
    Public,
}

impl ConnectionKind {
    pub fn detect(url: &Url) -> Self {
        let private = match url.host() {
            Some(Host::Ipv4(ip)) => is_private_v4(ip),
            Some(Host::Ipv6(ip)) => is_private_v6(ip),
            Some(Host::Domain(domain)) => {
                let domain = domain.trim_end_matches('.').to_ascii_lowercase();
                match domain.parse::<IpAddr>() {
                    Ok(IpAddr::V4(ip)) => is_private_v4(ip),
                    Ok(IpAddr::V6(ip)) => is_private_v6(ip),
                    Err(_) => {
                        domain == "localhost"
                            || domain.ends_with(".localhost")
                            || domain.ends_with(".local")
                            || !domain.contains('.')
                    }
                }
            }
            None => false,
        };
        if private {
            ConnectionKind::Private
        } else {
            ConnectionKind::Public
        }
    }

    /// Headers a reverse proxy in front of a locally reached panel expects.
    pub fn forwarding_headers(self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if self == ConnectionKind::Private {
            headers.insert(HOST, HeaderValue::from_static("localhost"));
            headers.insert(
                HeaderName::from_static("x-forwarded-host"),
                HeaderValue::from_static("localhost"),
            );
            headers.insert(
                HeaderName::from_static("x-forwarded-proto"),
                HeaderValue::from_static("https"),
            );
            headers.insert(
                HeaderName::from_static("x-forwarded-for"),
                HeaderValue::from_static("127.0.0.1"),
            );
            headers.insert(
                HeaderName::from_static("x-real-ip"),
                HeaderValue::from_static("127.0.0.1"),
            );
        }
        headers
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_link_local()
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    // fc00::/7 unique local, fe80::/10 link local
    ip.is_loopback()
        || (ip.segments()[0] & 0xfe00) == 0xfc00
        || (ip.segments()[0] & 0xffc0) == 0xfe80
}
