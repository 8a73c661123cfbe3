//! Protocol constants and small shared types.

/// Protocol version asserted in the `HANDSHAKE` frame.
pub const PROTOCOL_VERSION: u32 = 1;

/// Number of numbered IPC channel candidates probed during discovery.
pub const IPC_CANDIDATES: u32 = 10;

/// Base name of the peer's local channels (`discord-ipc-0` .. `discord-ipc-9`).
pub const IPC_BASE_NAME: &str = "discord-ipc";

/// RPC command names carried in the `cmd` field.
pub mod command {
    /// Peer-initiated event delivery.
    pub const DISPATCH: &str = "DISPATCH";
    /// Request a one-time authorization code.
    pub const AUTHORIZE: &str = "AUTHORIZE";
    /// Authenticate the channel with an access token.
    pub const AUTHENTICATE: &str = "AUTHENTICATE";
    /// Set or clear the user's activity.
    pub const SET_ACTIVITY: &str = "SET_ACTIVITY";
    /// Subscribe to a named event.
    pub const SUBSCRIBE: &str = "SUBSCRIBE";
    /// Cancel a subscription.
    pub const UNSUBSCRIBE: &str = "UNSUBSCRIBE";
    /// Invite a user to join the current activity.
    pub const SEND_ACTIVITY_JOIN_INVITE: &str = "SEND_ACTIVITY_JOIN_INVITE";
    /// Accept a user's request to join.
    pub const SEND_ACTIVITY_JOIN_REQUEST: &str = "SEND_ACTIVITY_JOIN_REQUEST";
    /// Reject a user's request to join.
    pub const CLOSE_ACTIVITY_JOIN_REQUEST: &str = "CLOSE_ACTIVITY_JOIN_REQUEST";
}

/// Event names carried in the `evt` field.
pub mod event {
    /// Readiness notification sent after a successful handshake.
    pub const READY: &str = "READY";
    /// Marks a response as a failure.
    pub const ERROR: &str = "ERROR";
    /// Someone joined through the activity.
    pub const ACTIVITY_JOIN: &str = "ACTIVITY_JOIN";
    /// Someone started spectating through the activity.
    pub const ACTIVITY_SPECTATE: &str = "ACTIVITY_SPECTATE";
    /// Someone asked to join the activity.
    pub const ACTIVITY_JOIN_REQUEST: &str = "ACTIVITY_JOIN_REQUEST";
}

/// Error codes the peer reports in `data.code` of an `ERROR` response.
#[allow(missing_docs)]
pub mod error_code {
    pub const UNKNOWN_ERROR: i64 = 1000;
    pub const SERVICE_UNAVAILABLE: i64 = 1001;
    pub const TRANSACTION_ABORTED: i64 = 1002;
    pub const INVALID_PAYLOAD: i64 = 4000;
    pub const INVALID_COMMAND: i64 = 4002;
    pub const INVALID_EVENT: i64 = 4004;
    pub const INVALID_PERMISSIONS: i64 = 4006;
    pub const INVALID_CLIENTID: i64 = 4007;
    pub const INVALID_ORIGIN: i64 = 4008;
    pub const INVALID_TOKEN: i64 = 4009;
    pub const INVALID_USER: i64 = 4010;
    pub const OAUTH2_ERROR: i64 = 5000;
    pub const RATE_LIMITED: i64 = 5011;
}

/// Close codes the peer reports in the body of a `CLOSE` frame.
#[allow(missing_docs)]
pub mod close_code {
    pub const CLOSE_NORMAL: i64 = 1000;
    pub const CLOSE_UNSUPPORTED: i64 = 1003;
    pub const CLOSE_ABNORMAL: i64 = 1006;
    pub const INVALID_CLIENTID: i64 = 4000;
    pub const INVALID_ORIGIN: i64 = 4001;
    pub const RATELIMITED: i64 = 4002;
    pub const TOKEN_REVOKED: i64 = 4003;
    pub const INVALID_VERSION: i64 = 4004;
    pub const INVALID_ENCODING: i64 = 4005;
}

/// A reference to a remote entity: either its bare id or a handle that
/// carries the id alongside other fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ref {
    /// Bare identifier.
    Id(String),
    /// Entity handle with an id and an optional display name.
    Handle {
        /// Entity identifier.
        id: String,
        /// Display name, if known.
        name: Option<String>,
    },
}

impl Ref {
    /// Returns the identifier regardless of variant.
    ///
    /// # Examples
    ///
    /// ```
    /// use drp_common::types::Ref;
    /// assert_eq!(Ref::from("42").id(), "42");
    /// let handle = Ref::Handle { id: "7".into(), name: Some("alice".into()) };
    /// assert_eq!(handle.id(), "7");
    /// ```
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Id(id) | Self::Handle { id, .. } => id,
        }
    }
}

impl From<&str> for Ref {
    fn from(id: &str) -> Self {
        Self::Id(id.to_string())
    }
}

impl From<String> for Ref {
    fn from(id: String) -> Self {
        Self::Id(id)
    }
}
