//! Main Robofleet client with builder pattern.
//!
//! The client holds configuration (relay URL, identity token, codec,
//! connection options) and hands out live [`Connection`]s. It also wraps
//! the relay's HTTP side-channel: the `check-auth` authorization check and
//! the `echo-ip` helper.

use crate::codec::FramedCodec;
use crate::connection::{AuthToken, ConnectConfig, Connection};
use crate::envelope::EnvelopeCodec;
use crate::error::{RobofleetLinkError, Result};
use crate::event_handlers::EventHandlers;
use crate::options::ConnectionOptions;
use reqwest::Url;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Operation checked against the relay's authorization rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthOp {
    Send,
    Receive,
}

#[derive(Debug, Serialize)]
struct CheckAuthRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id_token: Option<&'a str>,
    op: AuthOp,
    topic: &'a str,
}

/// Client for the Robofleet relay.
///
/// # Examples
///
/// ```rust,no_run
/// use robofleet_link::{RobofleetLinkClient, TopicPattern};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = RobofleetLinkClient::builder()
///     .server_url("ws://localhost:8080")
///     .build()?;
///
/// let conn = client.connect().await?;
/// let _guard = conn
///     .listen(TopicPattern::any_topic_under("robot1")?, |msg, m| {
///         println!("{} ({} bytes)", m.topic(), msg.bytes().len());
///     })
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RobofleetLinkClient {
    server_url: String,
    http_base: Url,
    http_client: reqwest::Client,
    id_token: Option<String>,
    codec: Arc<dyn EnvelopeCodec>,
    options: ConnectionOptions,
    event_handlers: EventHandlers,
}

impl RobofleetLinkClient {
    /// Create a new builder for configuring the client.
    pub fn builder() -> RobofleetLinkClientBuilder {
        RobofleetLinkClientBuilder::new()
    }

    /// Open a connection to the relay.
    ///
    /// The returned handle is live immediately; if the initial attempt
    /// fails, the connection keeps retrying on the fixed reconnect delay
    /// and the failure is reported through the event handlers.
    pub async fn connect(&self) -> Result<Connection> {
        Connection::open(ConnectConfig {
            url: self.server_url.clone(),
            codec: self.codec.clone(),
            options: self.options.clone(),
            event_handlers: self.event_handlers.clone(),
            auth: match &self.id_token {
                Some(token) => AuthToken::Token(token.clone()),
                None => AuthToken::Unset,
            },
        })
        .await
    }

    /// Ask the relay whether this client may perform `op` on `topic`.
    ///
    /// Pure pass-through of the configured identity token; the decision is
    /// entirely server-side.
    pub async fn check_auth(&self, op: AuthOp, topic: &str) -> Result<bool> {
        let url = self.side_channel_url("check-auth")?;
        let body = CheckAuthRequest {
            id_token: self.id_token.as_deref(),
            op,
            topic,
        };
        let response = self.http_client.post(url).json(&body).send().await?;
        let authorized = response.error_for_status()?.json::<bool>().await?;
        log::debug!("check-auth {:?} '{}' -> {}", op, topic, authorized);
        Ok(authorized)
    }

    /// This client's IP address as seen by the relay.
    pub async fn echo_ip(&self) -> Result<String> {
        let url = self.side_channel_url("echo-ip")?;
        let response = self.http_client.get(url).send().await?;
        Ok(response.error_for_status()?.text().await?)
    }

    /// The configured WebSocket URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// The configured identity token, if any.
    pub fn id_token(&self) -> Option<&str> {
        self.id_token.as_deref()
    }

    fn side_channel_url(&self, endpoint: &str) -> Result<Url> {
        self.http_base.join(endpoint).map_err(|e| {
            RobofleetLinkError::Configuration(format!(
                "Failed to build {} URL from '{}': {}",
                endpoint, self.http_base, e
            ))
        })
    }
}

impl std::fmt::Debug for RobofleetLinkClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RobofleetLinkClient")
            .field("server_url", &self.server_url)
            .field("id_token", &self.id_token.is_some())
            .field("options", &self.options)
            .finish()
    }
}

/// Derive the HTTP base URL for the side-channel from the WebSocket URL.
fn derive_http_base(ws_url: &Url) -> Result<Url> {
    let mut base = ws_url.clone();
    let scheme = match ws_url.scheme() {
        "ws" => "http",
        "wss" => "https",
        other => {
            return Err(RobofleetLinkError::Configuration(format!(
                "Unsupported server_url scheme '{}'; expected ws:// or wss://",
                other
            )))
        }
    };
    base.set_scheme(scheme).map_err(|_| {
        RobofleetLinkError::Configuration("Failed to derive HTTP base URL".to_string())
    })?;
    base.set_fragment(None);
    Ok(base)
}

/// Builder for configuring [`RobofleetLinkClient`] instances.
pub struct RobofleetLinkClientBuilder {
    server_url: Option<String>,
    id_token: Option<String>,
    codec: Arc<dyn EnvelopeCodec>,
    options: ConnectionOptions,
    event_handlers: EventHandlers,
    http_timeout: Duration,
}

impl RobofleetLinkClientBuilder {
    fn new() -> Self {
        Self {
            server_url: None,
            id_token: None,
            codec: Arc::new(FramedCodec),
            options: ConnectionOptions::default(),
            event_handlers: EventHandlers::default(),
            http_timeout: Duration::from_secs(30),
        }
    }

    /// Set the relay WebSocket URL (`ws://` or `wss://`). Required.
    pub fn server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = Some(url.into());
        self
    }

    /// Set the identity token sent to the relay after every connect.
    pub fn id_token(mut self, token: impl Into<String>) -> Self {
        self.id_token = Some(token.into());
        self
    }

    /// Replace the default length-prefixed codec with a schema-compiled
    /// one.
    pub fn codec(mut self, codec: Arc<dyn EnvelopeCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Set connection options (reconnect delay, time-travel capacity...).
    pub fn options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Register connection lifecycle event handlers.
    pub fn event_handlers(mut self, handlers: EventHandlers) -> Self {
        self.event_handlers = handlers;
        self
    }

    /// Set the timeout for HTTP side-channel requests.
    pub fn http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    /// Build the client.
    pub fn build(self) -> Result<RobofleetLinkClient> {
        let server_url = self
            .server_url
            .ok_or_else(|| RobofleetLinkError::Configuration("server_url is required".into()))?;

        let parsed = Url::parse(server_url.trim()).map_err(|e| {
            RobofleetLinkError::Configuration(format!("Invalid server_url '{}': {}", server_url, e))
        })?;
        if parsed.host_str().is_none() {
            return Err(RobofleetLinkError::Configuration(
                "server_url must include a host".to_string(),
            ));
        }
        let http_base = derive_http_base(&parsed)?;

        let http_client = reqwest::Client::builder()
            .timeout(self.http_timeout)
            .connect_timeout(self.options.connect_timeout())
            .build()
            .map_err(|e| RobofleetLinkError::Configuration(e.to_string()))?;

        Ok(RobofleetLinkClient {
            server_url: parsed.to_string(),
            http_base,
            http_client,
            id_token: self.id_token,
            codec: self.codec,
            options: self.options,
            event_handlers: self.event_handlers,
        })
    }
}
