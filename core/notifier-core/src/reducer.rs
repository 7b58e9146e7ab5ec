//! Pure tracking rules: `(current session, event) -> update + effects`.
//!
//! The reducer never touches storage or the browser. [`crate::reconciler`]
//! applies the [`SessionUpdate`] to the status store and carries out the
//! [`Effect`]s.
//!
//! Policy: the most recent `generation-started` wins, and tab activation never
//! steals an in-flight session from another tab that is still open.

use chat_notifier_protocol::{ExtensionMessage, TabEvent};

use crate::types::{same_service, ChatService, SessionStatus, TrackedSession};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackgroundEvent {
    GenerationStarted {
        tab_id: i64,
        url: String,
    },
    GenerationFinished {
        tab_id: i64,
        url: String,
    },
    TabActivated {
        tab_id: i64,
        window_id: Option<i64>,
        url: Option<String>,
        title: Option<String>,
    },
    TabUpdated {
        tab_id: i64,
        url: Option<String>,
        title: Option<String>,
    },
    TabRemoved {
        tab_id: i64,
    },
    NotificationClicked {
        notification_id: String,
    },
    /// "Go to chat": bring the tracked tab forward.
    FocusTracked,
    /// Scheduled retry of title resolution for a deferred completion notification.
    TitleRetry {
        dispatch_id: u64,
        attempt: usize,
    },
}

impl BackgroundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BackgroundEvent::GenerationStarted { .. } => "generation_started",
            BackgroundEvent::GenerationFinished { .. } => "generation_finished",
            BackgroundEvent::TabActivated { .. } => "tab_activated",
            BackgroundEvent::TabUpdated { .. } => "tab_updated",
            BackgroundEvent::TabRemoved { .. } => "tab_removed",
            BackgroundEvent::NotificationClicked { .. } => "notification_clicked",
            BackgroundEvent::FocusTracked => "focus_tracked",
            BackgroundEvent::TitleRetry { .. } => "title_retry",
        }
    }

    /// Maps a page-context message from `tab_id` to its event. Messages that
    /// don't drive tracking (status queries, sound requests) map to `None`.
    pub fn from_page_message(tab_id: i64, message: &ExtensionMessage) -> Option<Self> {
        match message {
            ExtensionMessage::GenerationStarted { url } => Some(BackgroundEvent::GenerationStarted {
                tab_id,
                url: url.clone(),
            }),
            ExtensionMessage::GenerationFinished { url } => {
                Some(BackgroundEvent::GenerationFinished {
                    tab_id,
                    url: url.clone(),
                })
            }
            ExtensionMessage::GetStatus | ExtensionMessage::PlayNotificationSound => None,
        }
    }
}

impl From<TabEvent> for BackgroundEvent {
    fn from(event: TabEvent) -> Self {
        match event {
            TabEvent::Activated {
                tab_id,
                window_id,
                url,
                title,
            } => BackgroundEvent::TabActivated {
                tab_id,
                window_id,
                url,
                title,
            },
            TabEvent::Updated { tab_id, url, title } => {
                BackgroundEvent::TabUpdated { tab_id, url, title }
            }
            TabEvent::Removed { tab_id } => BackgroundEvent::TabRemoved { tab_id },
        }
    }
}

/// Browser facts the rules need but can't derive from the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReduceContext {
    /// Whether the currently tracked tab still exists.
    pub tracked_tab_open: bool,
}

impl Default for ReduceContext {
    fn default() -> Self {
        ReduceContext {
            tracked_tab_open: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    Set(TrackedSession),
    Reset,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Resolve the title of `tab_id` and raise the completion notification.
    DispatchCompletion { tab_id: i64 },
    ClearNotifications,
    AbandonPendingNotification,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reduction {
    pub update: SessionUpdate,
    pub effects: Vec<Effect>,
}

impl Reduction {
    fn skip() -> Self {
        Reduction {
            update: SessionUpdate::Skip,
            effects: Vec::new(),
        }
    }

    fn set(session: TrackedSession) -> Self {
        Reduction {
            update: SessionUpdate::Set(session),
            effects: Vec::new(),
        }
    }

    fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }
}

pub fn reduce(current: &TrackedSession, event: &BackgroundEvent, ctx: ReduceContext) -> Reduction {
    match event {
        BackgroundEvent::GenerationStarted { tab_id, url } => {
            let tab_title = if current.is_tracking_tab(*tab_id) {
                current.tab_title.clone()
            } else {
                None
            };
            Reduction::set(TrackedSession {
                tracked_tab_id: Some(*tab_id),
                status: SessionStatus::InProgress,
                tracked_url: url.clone(),
                tab_title,
            })
            .with_effect(Effect::AbandonPendingNotification)
        }
        BackgroundEvent::GenerationFinished { tab_id, url } => {
            if !accepts_completion(current, *tab_id, url) {
                return Reduction::skip();
            }
            let tracked_tab_id = current.tracked_tab_id.unwrap_or(*tab_id);
            Reduction::set(TrackedSession {
                tracked_tab_id: Some(tracked_tab_id),
                status: SessionStatus::Done,
                tracked_url: url.clone(),
                tab_title: current.tab_title.clone(),
            })
            .with_effect(Effect::DispatchCompletion {
                tab_id: tracked_tab_id,
            })
        }
        BackgroundEvent::TabActivated {
            tab_id, url, title, ..
        } => reduce_activation(current, *tab_id, url.as_deref(), title.as_deref(), ctx),
        BackgroundEvent::TabUpdated { tab_id, url, title } => {
            reduce_update(current, *tab_id, url.as_deref(), title.as_deref())
        }
        BackgroundEvent::TabRemoved { tab_id } => {
            if current.is_tracking_tab(*tab_id) {
                Reduction {
                    update: SessionUpdate::Reset,
                    effects: vec![Effect::ClearNotifications, Effect::AbandonPendingNotification],
                }
            } else {
                Reduction::skip()
            }
        }
        BackgroundEvent::NotificationClicked { .. }
        | BackgroundEvent::FocusTracked
        | BackgroundEvent::TitleRetry { .. } => {
            Reduction::skip()
        }
    }
}

/// Completion from the tracked tab, from any tab when nothing is tracked, or
/// from the same service as the tracked URL (tab ids can drift across reloads).
fn accepts_completion(current: &TrackedSession, tab_id: i64, url: &str) -> bool {
    match current.tracked_tab_id {
        None => true,
        Some(tracked) if tracked == tab_id => true,
        Some(_) => same_service(url, &current.tracked_url),
    }
}

fn reduce_activation(
    current: &TrackedSession,
    tab_id: i64,
    url: Option<&str>,
    title: Option<&str>,
    ctx: ReduceContext,
) -> Reduction {
    let Some(url) = url.filter(|url| ChatService::from_url(url).is_some()) else {
        return Reduction::skip();
    };

    if current.is_tracking() && url == current.tracked_url {
        return match title {
            Some(title) if current.is_tracking_tab(tab_id) => retitle(current, title),
            _ => Reduction::skip(),
        };
    }

    let foreign_in_flight = current.status == SessionStatus::InProgress
        && !current.is_tracking_tab(tab_id)
        && ctx.tracked_tab_open;
    if foreign_in_flight {
        return Reduction::skip();
    }

    Reduction::set(TrackedSession {
        tracked_tab_id: Some(tab_id),
        status: SessionStatus::Idle,
        tracked_url: url.to_string(),
        tab_title: title.map(str::to_string),
    })
}

fn reduce_update(
    current: &TrackedSession,
    tab_id: i64,
    url: Option<&str>,
    title: Option<&str>,
) -> Reduction {
    let owns_tab = !current.is_tracking() || current.is_tracking_tab(tab_id);

    if let Some(url) = url {
        let navigated = url != current.tracked_url;
        if navigated && owns_tab && ChatService::from_url(url).is_some() {
            return Reduction::set(TrackedSession {
                tracked_tab_id: Some(tab_id),
                status: SessionStatus::Idle,
                tracked_url: url.to_string(),
                tab_title: title.map(str::to_string),
            });
        }
        if navigated {
            return Reduction::skip();
        }
    }

    match title {
        Some(title) if current.is_tracking_tab(tab_id) => retitle(current, title),
        _ => Reduction::skip(),
    }
}

fn retitle(current: &TrackedSession, title: &str) -> Reduction {
    if current.tab_title.as_deref() == Some(title) {
        return Reduction::skip();
    }
    let mut next = current.clone();
    next.tab_title = Some(title.to_string());
    Reduction::set(next)
}
