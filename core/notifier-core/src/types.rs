//! Session and chat-service types shared by the monitor and the reconciler.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

pub use chat_notifier_protocol::{Preferences, SessionStatus, StatusData};

static CHATGPT_TITLE_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+-\s+ChatGPT$").expect("valid ChatGPT suffix regex"));
static CLAUDE_TITLE_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+-\s+Claude$").expect("valid Claude suffix regex"));

/// Remote chat services we know how to watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatService {
    ChatGpt,
    Claude,
}

impl ChatService {
    pub const ALL: [ChatService; 2] = [ChatService::ChatGpt, ChatService::Claude];

    /// Classifies a URL by host. Subdomains of a service host match too.
    pub fn from_url(url: &str) -> Option<Self> {
        let host = url_host(url)?;
        Self::ALL.into_iter().find(|service| {
            service
                .hosts()
                .iter()
                .any(|known| host == *known || host.ends_with(&format!(".{}", known)))
        })
    }

    pub fn hosts(&self) -> &'static [&'static str] {
        match self {
            ChatService::ChatGpt => &["chatgpt.com", "chat.openai.com"],
            ChatService::Claude => &["claude.ai"],
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ChatService::ChatGpt => "ChatGPT",
            ChatService::Claude => "Claude",
        }
    }

    pub fn fallback_notification_title(&self) -> String {
        format!("{} Response Complete", self.display_name())
    }

    /// Strips the " - ChatGPT" / " - Claude" suffix browsers show in tab titles.
    pub fn clean_title(&self, title: &str) -> String {
        let suffix = match self {
            ChatService::ChatGpt => &*CHATGPT_TITLE_SUFFIX,
            ChatService::Claude => &*CLAUDE_TITLE_SUFFIX,
        };
        suffix.replace(title.trim(), "").trim().to_string()
    }

    /// A title that carries no conversation label yet: empty, or just the
    /// service name the page shows before the conversation gets a name.
    pub fn is_placeholder_title(&self, title: &str) -> bool {
        let cleaned = self.clean_title(title);
        cleaned.is_empty() || cleaned.eq_ignore_ascii_case(self.display_name())
    }
}

/// True when both URLs classify as the same known service.
pub fn same_service(a: &str, b: &str) -> bool {
    match (ChatService::from_url(a), ChatService::from_url(b)) {
        (Some(left), Some(right)) => left == right,
        _ => false,
    }
}

/// Lowercased host of an absolute URL, as a WHATWG parser sees it.
pub fn url_host(url: &str) -> Option<String> {
    let parsed = Url::parse(url.trim()).ok()?;
    parsed
        .host_str()
        .filter(|host| !host.is_empty())
        .map(str::to_ascii_lowercase)
}

/// The single tracked chat session held by the status store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackedSession {
    pub tracked_tab_id: Option<i64>,
    pub status: SessionStatus,
    pub tracked_url: String,
    pub tab_title: Option<String>,
}

impl TrackedSession {
    pub fn is_tracking(&self) -> bool {
        self.tracked_tab_id.is_some()
    }

    pub fn is_tracking_tab(&self, tab_id: i64) -> bool {
        self.tracked_tab_id == Some(tab_id)
    }

    pub fn service(&self) -> Option<ChatService> {
        ChatService::from_url(&self.tracked_url)
    }

    /// Enforces "no tab means idle with no url".
    pub fn normalized(self) -> Self {
        if self.tracked_tab_id.is_none() {
            TrackedSession::default()
        } else {
            self
        }
    }

    pub fn to_status_data(&self) -> StatusData {
        StatusData {
            tracked_tab_id: self.tracked_tab_id,
            status: self.status,
            tracked_url: self.tracked_url.clone(),
            tab_title: self.tab_title.clone(),
        }
    }
}

impl From<StatusData> for TrackedSession {
    fn from(data: StatusData) -> Self {
        TrackedSession {
            tracked_tab_id: data.tracked_tab_id,
            status: data.status,
            tracked_url: data.tracked_url,
            tab_title: data.tab_title,
        }
        .normalized()
    }
}
