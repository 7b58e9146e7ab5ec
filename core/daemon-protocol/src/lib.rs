//! Message and IPC protocol types for chat-notifier.
//!
//! This crate is shared by the daemon, the CLI, and the page monitor to prevent
//! schema drift. The daemon remains the authority on validation, but clients can
//! reuse the same types to construct valid requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_ACTIVE_CONNECTIONS: usize = 64;
pub const ERROR_TOO_MANY_CONNECTIONS: &str = "too_many_connections";

// -----------------------------------------------------------------------------
// Extension messages (page context <-> background)
// -----------------------------------------------------------------------------

/// Messages exchanged between the page monitor, the background process and
/// status consumers. Serialized as `{"type": "generation-started", ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ExtensionMessage {
    GenerationStarted { url: String },
    GenerationFinished { url: String },
    GetStatus,
    PlayNotificationSound,
}

impl ExtensionMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ExtensionMessage::GenerationStarted { .. } => "generation-started",
            ExtensionMessage::GenerationFinished { .. } => "generation-finished",
            ExtensionMessage::GetStatus => "get-status",
            ExtensionMessage::PlayNotificationSound => "play-notification-sound",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    #[default]
    Idle,
    InProgress,
    Done,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::InProgress => "in-progress",
            SessionStatus::Done => "done",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(SessionStatus::Idle),
            "in-progress" => Some(SessionStatus::InProgress),
            "done" => Some(SessionStatus::Done),
            _ => None,
        }
    }

    /// Human label shown by status consumers.
    pub fn label(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "Idle",
            SessionStatus::InProgress => "In progress",
            SessionStatus::Done => "Done",
        }
    }
}

/// Response payload for `get-status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusData {
    pub tracked_tab_id: Option<i64>,
    pub status: SessionStatus,
    pub tracked_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_title: Option<String>,
}

// -----------------------------------------------------------------------------
// Daemon IPC envelopes
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    GetHealth,
    Message,
    TabEvent,
    NotificationClicked,
    GetStatus,
    WatchStatus,
    DrainCommands,
    SetPreference,
    GetPreferences,
    /// Bring the tracked tab to the front, as a notification click would.
    FocusTracked,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

// -----------------------------------------------------------------------------
// Method params
// -----------------------------------------------------------------------------

/// Params for [`Method::Message`]. `tab_id` identifies the sender tab and is
/// required for page-originated messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessageParams {
    #[serde(default)]
    pub tab_id: Option<i64>,
    pub message: ExtensionMessage,
}

impl MessageParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        match &self.message {
            ExtensionMessage::GenerationStarted { url }
            | ExtensionMessage::GenerationFinished { url } => {
                match self.tab_id {
                    Some(tab_id) => require_tab_id(tab_id)?,
                    None => {
                        return Err(ErrorInfo::new(
                            "missing_field",
                            "tab_id is required for page messages",
                        ))
                    }
                }
                require_url(url)?;
            }
            ExtensionMessage::GetStatus => {}
            ExtensionMessage::PlayNotificationSound => {
                return Err(ErrorInfo::new(
                    "unsupported_message",
                    "play-notification-sound is sent by the background process",
                ));
            }
        }
        Ok(())
    }
}

/// Browser tab lifecycle events forwarded by the extension bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TabEvent {
    Activated {
        tab_id: i64,
        #[serde(default)]
        window_id: Option<i64>,
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        title: Option<String>,
    },
    Updated {
        tab_id: i64,
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        title: Option<String>,
    },
    Removed {
        tab_id: i64,
    },
}

impl TabEvent {
    pub fn tab_id(&self) -> i64 {
        match self {
            TabEvent::Activated { tab_id, .. }
            | TabEvent::Updated { tab_id, .. }
            | TabEvent::Removed { tab_id } => *tab_id,
        }
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_tab_id(self.tab_id())?;
        if let TabEvent::Updated {
            url: None,
            title: None,
            ..
        } = self
        {
            return Err(ErrorInfo::new(
                "missing_field",
                "updated events need a url or a title",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotificationClickParams {
    pub notification_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PreferenceKey {
    ImageHidden,
    SoundEnabled,
}

impl PreferenceKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            PreferenceKey::ImageHidden => "imageHidden",
            PreferenceKey::SoundEnabled => "soundEnabled",
        }
    }
}

/// Response payload for `get_preferences`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    pub image_hidden: bool,
    pub sound_enabled: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Preferences {
            image_hidden: false,
            sound_enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PreferenceParams {
    pub key: PreferenceKey,
    pub value: bool,
}

/// Work the extension bridge must perform against the real browser APIs.
/// Queued by the daemon and collected with [`Method::DrainCommands`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum BrowserCommand {
    CreateNotification {
        notification_id: String,
        title: String,
        message: String,
        silent: bool,
    },
    ClearNotifications,
    ActivateTab {
        tab_id: i64,
    },
    FocusWindow {
        window_id: i64,
    },
    SendToTab {
        tab_id: i64,
        message: ExtensionMessage,
    },
}

pub fn parse_message(params: Value) -> Result<MessageParams, ErrorInfo> {
    let parsed: MessageParams = parse_params(params, "message")?;
    parsed.validate()?;
    Ok(parsed)
}

pub fn parse_tab_event(params: Value) -> Result<TabEvent, ErrorInfo> {
    let parsed: TabEvent = parse_params(params, "tab event")?;
    parsed.validate()?;
    Ok(parsed)
}

pub fn parse_notification_click(params: Value) -> Result<NotificationClickParams, ErrorInfo> {
    let parsed: NotificationClickParams = parse_params(params, "notification click")?;
    if parsed.notification_id.trim().is_empty() {
        return Err(ErrorInfo::new(
            "missing_field",
            "notification_id is required",
        ));
    }
    Ok(parsed)
}

pub fn parse_preference(params: Value) -> Result<PreferenceParams, ErrorInfo> {
    parse_params(params, "preference")
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Value, label: &str) -> Result<T, ErrorInfo> {
    serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("{} payload is invalid: {}", label, err),
        )
    })
}

fn require_tab_id(tab_id: i64) -> Result<(), ErrorInfo> {
    if tab_id < 0 {
        return Err(ErrorInfo::new(
            "invalid_tab_id",
            "tab_id must be non-negative",
        ));
    }
    Ok(())
}

fn require_url(url: &str) -> Result<(), ErrorInfo> {
    if url.trim().is_empty() {
        return Err(ErrorInfo::new("missing_field", "url is required"));
    }
    Ok(())
}
