//! Composes the displayed status from host application events.

use crate::config::PresenceSettings;
use drp_common::presence::Button;
use drp_common::{Presence, RemoteStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Art used when a game has no catalog entry.
pub const DEFAULT_LARGE_IMAGE: &str = "vortexlogo512";
const DEFAULT_LARGE_TEXT: &str = "Vortex";
const BRAND_SMALL_IMAGE: &str = "nexuslogo";
const BRAND_SMALL_TEXT: &str = "Nexus Mods";
const APP_SMALL_TEXT: &str = "Vortex by Nexus Mods";

/// Primary line of the idle status.
pub const DEFAULT_DETAILS: &str = "Vortex Mod Manager";
/// Secondary line of the idle status.
pub const DEFAULT_STATE: &str = "Ready to start modding!";

/// Maps a game id to its large image key.
pub trait ArtCatalog {
    /// Image key for `game_id`, if the catalog has one.
    fn large_image(&self, game_id: &str) -> Option<&str>;
}

impl ArtCatalog for HashMap<String, String> {
    fn large_image(&self, game_id: &str) -> Option<&str> {
        self.get(game_id).map(String::as_str)
    }
}

/// The managed game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameInfo {
    /// Game id, also the art catalog key.
    pub id: String,
    /// Display name.
    pub name: String,
}

/// The active profile of the managed game.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileInfo {
    /// Profile id.
    pub id: String,
    /// Number of enabled mods.
    #[serde(default)]
    pub enabled_mods: usize,
    /// When the profile was activated, unix milliseconds.
    #[serde(default)]
    pub last_activated: Option<i64>,
}

/// A game or tool the host launched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInfo {
    /// Display name.
    pub name: String,
    /// Whether this is the game's primary executable.
    #[serde(default)]
    pub primary: bool,
    /// Launch time, unix milliseconds.
    pub started: i64,
}

/// Progress of a collection install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionProgress {
    /// Game the collection is for.
    pub game: GameInfo,
    /// Collection display name.
    pub name: String,
    /// Collection revision.
    pub revision: String,
    /// URL slug of the collection.
    pub slug: String,
    /// Mods installed so far.
    pub installed: u32,
    /// Required plus optional mods.
    pub total: u32,
    /// Install start, unix milliseconds.
    #[serde(default)]
    pub install_time: Option<i64>,
}

/// Host application notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HostEvent {
    /// The managed game, its profile, or its deployment changed.
    GameActive {
        /// Active game; `None` when no game is managed.
        game: Option<GameInfo>,
        /// Active profile.
        profile: Option<ProfileInfo>,
    },
    /// A game or tool started.
    ToolStarted {
        /// The launched executable.
        tool: ToolInfo,
    },
    /// Every running game and tool exited.
    ToolsStopped,
    /// A collection install made progress.
    CollectionProgress {
        /// Current progress.
        progress: CollectionProgress,
    },
}

/// Large/small art for a game, falling back to app branding.
fn art_for(game: &GameInfo, art: &dyn ArtCatalog) -> (String, String, String, String) {
    match art.large_image(&game.id) {
        Some(key) => (
            key.to_string(),
            game.name.clone(),
            DEFAULT_LARGE_IMAGE.to_string(),
            APP_SMALL_TEXT.to_string(),
        ),
        None => (
            DEFAULT_LARGE_IMAGE.to_string(),
            DEFAULT_LARGE_TEXT.to_string(),
            BRAND_SMALL_IMAGE.to_string(),
            BRAND_SMALL_TEXT.to_string(),
        ),
    }
}

fn with_art(mut presence: Presence, game: &GameInfo, art: &dyn ArtCatalog) -> Presence {
    let (large, large_text, small, small_text) = art_for(game, art);
    presence.large_image_key = Some(large);
    presence.large_image_text = Some(large_text);
    presence.small_image_key = Some(small);
    presence.small_image_text = Some(small_text);
    presence
}

/// The idle status shown when no game is managed.
#[must_use]
pub fn default_presence() -> Presence {
    Presence {
        details: Some(DEFAULT_DETAILS.to_string()),
        state: Some(DEFAULT_STATE.to_string()),
        large_image_key: Some(DEFAULT_LARGE_IMAGE.to_string()),
        large_image_text: Some(DEFAULT_LARGE_TEXT.to_string()),
        small_image_key: Some(BRAND_SMALL_IMAGE.to_string()),
        small_image_text: Some(BRAND_SMALL_TEXT.to_string()),
        ..Presence::default()
    }
}

/// Status for a managed game with its mod count.
#[must_use]
pub fn game_presence(
    game: &GameInfo,
    profile: Option<&ProfileInfo>,
    settings: &PresenceSettings,
    art: &dyn ArtCatalog,
) -> Presence {
    let mods = profile.map_or(0, |p| p.enabled_mods);
    let state = if mods == 1 {
        "1 mod installed".to_string()
    } else {
        format!("{mods} mods installed")
    };
    let presence = Presence {
        details: Some(game.name.clone()),
        state: settings.show_mods.then_some(state),
        start_timestamp: profile.and_then(|p| p.last_activated),
        ..Presence::default()
    };
    with_art(presence, game, art)
}

/// Status for a running tool, layered over `current`.
#[must_use]
pub fn tool_presence(game: &GameInfo, tool: &ToolInfo, current: Option<&Presence>) -> Presence {
    let mut presence = current.cloned().unwrap_or_default();
    if tool.primary {
        presence.details = Some(format!("Playing {}", game.name));
    } else {
        presence.details = Some(format!("Using {}", tool.name));
        presence.state = Some(game.name.clone());
    }
    presence.start_timestamp = Some(tool.started);
    presence
}

/// Status for a collection install in progress.
#[must_use]
pub fn collection_presence(progress: &CollectionProgress, art: &dyn ArtCatalog) -> Presence {
    let presence = Presence {
        details: Some(format!("Installing collection \"{}\"...", progress.name)),
        state: Some(format!(
            "Revision {} ({}/{})",
            progress.revision, progress.installed, progress.total
        )),
        start_timestamp: progress.install_time,
        buttons: vec![Button {
            label: "Get Collection".to_string(),
            url: format!(
                "https://www.nexusmods.com/games/{}/collections/{}",
                progress.game.id, progress.slug
            ),
        }],
        ..Presence::default()
    };
    with_art(presence, &progress.game, art)
}

/// Host state the composer remembers between events.
#[derive(Debug, Clone, Default)]
pub struct ActivityState {
    game: Option<GameInfo>,
    profile: Option<ProfileInfo>,
    collection_installed: Option<u32>,
}

impl ActivityState {
    /// Creates an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Game or idle status for the current host state.
    #[must_use]
    pub fn refresh(&self, settings: &PresenceSettings, art: &dyn ArtCatalog) -> RemoteStatus {
        match &self.game {
            Some(game) => {
                if self.profile.is_none() {
                    warn!(game = %game.id, "no active profile, showing zero mods");
                }
                RemoteStatus::Shown(game_presence(game, self.profile.as_ref(), settings, art))
            }
            None => RemoteStatus::Shown(default_presence()),
        }
    }

    /// Records `event` and returns the status it calls for, if any.
    pub fn apply(
        &mut self,
        event: HostEvent,
        settings: &PresenceSettings,
        art: &dyn ArtCatalog,
        current: &RemoteStatus,
    ) -> Option<RemoteStatus> {
        match event {
            HostEvent::GameActive { game, profile } => {
                self.game = game;
                self.profile = profile;
                Some(self.refresh(settings, art))
            }
            HostEvent::ToolsStopped => Some(self.refresh(settings, art)),
            HostEvent::ToolStarted { tool } => {
                if settings.hide_on_game_launch {
                    return Some(RemoteStatus::Empty);
                }
                let Some(game) = &self.game else {
                    debug!(tool = %tool.name, "tool started without an active game");
                    return None;
                };
                Some(RemoteStatus::Shown(tool_presence(
                    game,
                    &tool,
                    current.presence(),
                )))
            }
            HostEvent::CollectionProgress { progress } => {
                if !settings.show_collections {
                    return None;
                }
                if self.collection_installed == Some(progress.installed) {
                    return None;
                }
                self.collection_installed = Some(progress.installed);
                Some(RemoteStatus::Shown(collection_presence(&progress, art)))
            }
        }
    }
}
