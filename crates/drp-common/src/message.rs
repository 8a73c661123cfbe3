//! Typed shapes of the JSON bodies carried by `FRAME` opcodes.

use crate::frame::Frame;
use crate::types::{command, event, Ref};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One RPC body: an outbound command, its response, or a peer dispatch.
///
/// Requests carry `cmd`, `args`, optional `evt` and a unique `nonce`.
/// Responses echo `cmd` and `nonce` and put the result in `data`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcMessage {
    /// Command name, see [`command`].
    pub cmd: String,
    /// Command arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    /// Event name; `ERROR` on failed responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evt: Option<String>,
    /// Correlation token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Response or dispatch payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Body of an `ERROR` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcErrorBody {
    /// Peer error code, see [`crate::types::error_code`].
    #[serde(default)]
    pub code: i64,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
}

impl RpcMessage {
    /// Builds an outbound request.
    #[must_use]
    pub fn request(cmd: &str, args: Value, evt: Option<&str>, nonce: String) -> Self {
        Self {
            cmd: cmd.to_string(),
            args: Some(args),
            evt: evt.map(str::to_string),
            nonce: Some(nonce),
            data: None,
        }
    }

    /// Whether this is the peer's `DISPATCH`/`READY` notification.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.cmd == command::DISPATCH && self.evt.as_deref() == Some(event::READY)
    }

    /// Whether the peer flagged this message as a failure.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.evt.as_deref() == Some(event::ERROR)
    }

    /// Extracts the error body, tolerating missing fields.
    #[must_use]
    pub fn error_body(&self) -> RpcErrorBody {
        self.data
            .as_ref()
            .and_then(|d| serde_json::from_value(d.clone()).ok())
            .unwrap_or_default()
    }

    /// Wraps this message in a data frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be represented as JSON.
    pub fn to_frame(&self) -> Result<Frame, serde_json::Error> {
        Ok(Frame::data(serde_json::to_value(self)?))
    }

    /// Parses a data frame body.
    ///
    /// # Errors
    ///
    /// Returns an error if the body does not have the RPC shape.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// The user announced in `READY` or returned by `AUTHENTICATE`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Snowflake id.
    pub id: String,
    /// Account name.
    #[serde(default)]
    pub username: String,
    /// Legacy discriminator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discriminator: Option<String>,
    /// Display name, if the account set one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_name: Option<String>,
    /// Avatar hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    /// Whether the account is a bot.
    #[serde(default)]
    pub bot: bool,
    /// Public account flags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<u64>,
    /// Subscription tier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub premium_type: Option<u8>,
}

impl User {
    /// Display name, falling back to the account name.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.global_name.as_deref().unwrap_or(&self.username)
    }

    /// CDN URL of the avatar, if one is set.
    #[must_use]
    pub fn avatar_url(&self) -> Option<String> {
        self.avatar
            .as_ref()
            .map(|hash| format!("https://cdn.discordapp.com/avatars/{}/{hash}.png", self.id))
    }
}

impl From<&User> for Ref {
    fn from(user: &User) -> Self {
        Self::Handle {
            id: user.id.clone(),
            name: Some(user.username.clone()),
        }
    }
}

/// `data` of the `READY` dispatch.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ReadyData {
    /// Protocol version the peer speaks.
    #[serde(default)]
    pub v: Option<u32>,
    /// Logged-in user, if the peer shares it.
    #[serde(default)]
    pub user: Option<User>,
    /// Peer configuration blob.
    #[serde(default)]
    pub config: Option<Value>,
}

/// `data` of a successful `AUTHENTICATE` response.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AuthenticateData {
    /// Authenticated user.
    #[serde(default)]
    pub user: Option<User>,
    /// Application the token belongs to.
    #[serde(default)]
    pub application: Option<Value>,
    /// Granted scopes.
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Token expiry (ISO 8601).
    #[serde(default)]
    pub expires: Option<String>,
}
