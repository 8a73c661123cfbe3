//! Remote status (rich presence) model and its `SET_ACTIVITY` encoding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Largest timestamp the peer accepts, in milliseconds.
pub const MAX_TIMESTAMP_MS: i64 = 2_147_483_647_000;

/// A link button shown under the activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    /// Button caption.
    pub label: String,
    /// Target URL.
    pub url: String,
}

/// User-facing activity fields.
///
/// Field names follow the host-facing camelCase convention; the wire
/// mapping happens in [`Presence::activity_args`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    /// Primary line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Secondary line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Large image asset key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub large_image_key: Option<String>,
    /// Large image hover text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub large_image_text: Option<String>,
    /// Small image asset key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub small_image_key: Option<String>,
    /// Small image hover text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub small_image_text: Option<String>,
    /// Activity start, unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<i64>,
    /// Activity end, unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<i64>,
    /// Action links.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buttons: Vec<Button>,
    /// Whether the activity is an instanced game session.
    #[serde(default)]
    pub instance: bool,
}

/// Errors raised when mapping a presence onto command arguments.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PresenceError {
    /// A timestamp does not fit in a 32-bit unix time.
    #[error("{field} must fit into a unix timestamp, got {value}")]
    TimestampOutOfRange {
        /// Offending field name.
        field: &'static str,
        /// Offending value in milliseconds.
        value: i64,
    },
}

impl Presence {
    /// Creates a presence with only the primary line set.
    #[must_use]
    pub fn with_details(details: impl Into<String>) -> Self {
        Self {
            details: Some(details.into()),
            ..Self::default()
        }
    }

    /// Sets the start time from a wall-clock instant.
    #[must_use]
    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.start_timestamp = Some(at.timestamp_millis());
        self
    }

    /// Compares the six displayed fields: both lines and both image
    /// key/text pairs. Timestamps and buttons are ignored.
    #[must_use]
    pub fn same_display(&self, other: &Self) -> bool {
        self.details == other.details
            && self.state == other.state
            && self.large_image_key == other.large_image_key
            && self.large_image_text == other.large_image_text
            && self.small_image_key == other.small_image_key
            && self.small_image_text == other.small_image_text
    }

    /// Builds the `SET_ACTIVITY` arguments for process `pid`.
    ///
    /// `timestamps` and `assets` are omitted when none of their fields are
    /// set.
    ///
    /// # Errors
    ///
    /// Returns [`PresenceError::TimestampOutOfRange`] if a timestamp exceeds
    /// [`MAX_TIMESTAMP_MS`].
    ///
    /// # Examples
    ///
    /// ```
    /// use drp_common::presence::Presence;
    /// let args = Presence::with_details("Ready").activity_args(7).unwrap();
    /// assert_eq!(args["pid"], 7);
    /// assert_eq!(args["activity"]["details"], "Ready");
    /// ```
    pub fn activity_args(&self, pid: u32) -> Result<Value, PresenceError> {
        let mut activity = Map::new();
        insert_opt(&mut activity, "state", self.state.as_deref());
        insert_opt(&mut activity, "details", self.details.as_deref());

        if self.start_timestamp.is_some() || self.end_timestamp.is_some() {
            let mut timestamps = Map::new();
            if let Some(start) = self.start_timestamp {
                check_timestamp("timestamps.start", start)?;
                timestamps.insert("start".into(), start.into());
            }
            if let Some(end) = self.end_timestamp {
                check_timestamp("timestamps.end", end)?;
                timestamps.insert("end".into(), end.into());
            }
            activity.insert("timestamps".into(), Value::Object(timestamps));
        }

        if self.large_image_key.is_some()
            || self.large_image_text.is_some()
            || self.small_image_key.is_some()
            || self.small_image_text.is_some()
        {
            let mut assets = Map::new();
            insert_opt(&mut assets, "large_image", self.large_image_key.as_deref());
            insert_opt(&mut assets, "large_text", self.large_image_text.as_deref());
            insert_opt(&mut assets, "small_image", self.small_image_key.as_deref());
            insert_opt(&mut assets, "small_text", self.small_image_text.as_deref());
            activity.insert("assets".into(), Value::Object(assets));
        }

        if !self.buttons.is_empty() {
            activity.insert("buttons".into(), json!(self.buttons));
        }
        activity.insert("instance".into(), Value::Bool(self.instance));

        Ok(json!({ "pid": pid, "activity": activity }))
    }
}

fn insert_opt(map: &mut Map<String, Value>, key: &str, value: Option<&str>) {
    if let Some(v) = value {
        map.insert(key.to_string(), Value::String(v.to_string()));
    }
}

const fn check_timestamp(field: &'static str, value: i64) -> Result<(), PresenceError> {
    if value > MAX_TIMESTAMP_MS {
        return Err(PresenceError::TimestampOutOfRange { field, value });
    }
    Ok(())
}

/// What the peer should display: nothing, or a presence.
#[derive(Debug, Clone, Default)]
pub enum RemoteStatus {
    /// No activity shown.
    #[default]
    Empty,
    /// The given activity is shown.
    Shown(Presence),
}

impl PartialEq for RemoteStatus {
    /// Two statuses are equal when both are empty, or both are shown with
    /// the same displayed fields (see [`Presence::same_display`]).
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Empty, Self::Empty) => true,
            (Self::Shown(a), Self::Shown(b)) => a.same_display(b),
            _ => false,
        }
    }
}

impl From<Option<Presence>> for RemoteStatus {
    fn from(value: Option<Presence>) -> Self {
        value.map_or(Self::Empty, Self::Shown)
    }
}

impl RemoteStatus {
    /// Returns the shown presence, if any.
    #[must_use]
    pub const fn presence(&self) -> Option<&Presence> {
        match self {
            Self::Empty => None,
            Self::Shown(p) => Some(p),
        }
    }

    /// Builds `SET_ACTIVITY` arguments; an empty status sends only `pid`.
    ///
    /// # Errors
    ///
    /// See [`Presence::activity_args`].
    pub fn activity_args(&self, pid: u32) -> Result<Value, PresenceError> {
        match self {
            Self::Empty => Ok(json!({ "pid": pid })),
            Self::Shown(p) => p.activity_args(pid),
        }
    }
}
