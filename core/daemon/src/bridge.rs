//! Browser and notification seams backed by the extension bridge.
//!
//! The daemon can't call browser APIs itself. Side effects are queued as
//! [`BrowserCommand`]s in a shared [`CommandOutbox`]; the bridge drains them
//! via `drain_commands` and executes them. Tab facts come from the tab events
//! the bridge forwards.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chat_notifier_core::{
    BackgroundEvent, Browser, Notification, Notifier, NotifierError, Result, TabInfo,
};
use chat_notifier_protocol::{BrowserCommand, ExtensionMessage};
use tracing::{debug, warn};

/// Oldest commands are dropped past this depth.
const MAX_QUEUED_COMMANDS: usize = 256;
/// Least recently seen tabs are forgotten past this size, except the tab
/// that last started a generation.
const MAX_KNOWN_TABS: usize = 128;

#[derive(Debug, Clone, Default)]
pub struct CommandOutbox {
    queue: Arc<Mutex<VecDeque<BrowserCommand>>>,
}

impl CommandOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, command: BrowserCommand) -> Result<()> {
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| NotifierError::CommandFailed {
                command: "queue".to_string(),
                details: "command outbox poisoned".to_string(),
            })?;
        if queue.len() >= MAX_QUEUED_COMMANDS {
            if let Some(dropped) = queue.pop_front() {
                warn!(command = ?dropped, "Command outbox full; dropping oldest command");
            }
        }
        queue.push_back(command);
        Ok(())
    }

    pub fn drain(&self) -> Vec<BrowserCommand> {
        match self.queue.lock() {
            Ok(mut queue) => queue.drain(..).collect(),
            Err(_) => {
                warn!("Command outbox poisoned; nothing drained");
                Vec::new()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().map(|queue| queue.len()).unwrap_or(0)
    }
}

struct KnownTab {
    info: TabInfo,
    last_seen: u64,
}

/// [`Browser`] whose tab knowledge is learned from forwarded events.
///
/// Removals can be lost on the way from the bridge, so the registry is
/// bounded instead of trusting `TabRemoved` to keep it small.
pub struct BridgeBrowser {
    outbox: CommandOutbox,
    tabs: HashMap<i64, KnownTab>,
    clock: u64,
    pinned: Option<i64>,
}

impl BridgeBrowser {
    pub fn new(outbox: CommandOutbox) -> Self {
        BridgeBrowser {
            outbox,
            tabs: HashMap::new(),
            clock: 0,
            pinned: None,
        }
    }

    /// Registers a tab known from elsewhere, e.g. the persisted session.
    /// The tab is kept until it is removed.
    pub fn remember(&mut self, tab: TabInfo) {
        let tab_id = tab.tab_id;
        self.pinned = Some(tab_id);
        *self.entry(tab_id) = tab;
    }

    fn entry(&mut self, tab_id: i64) -> &mut TabInfo {
        self.clock += 1;
        if !self.tabs.contains_key(&tab_id) && self.tabs.len() >= MAX_KNOWN_TABS {
            self.forget_least_recent();
        }
        let clock = self.clock;
        let known = self.tabs.entry(tab_id).or_insert_with(|| KnownTab {
            info: TabInfo {
                tab_id,
                window_id: None,
                url: None,
                title: None,
            },
            last_seen: clock,
        });
        known.last_seen = clock;
        &mut known.info
    }

    fn forget_least_recent(&mut self) {
        let pinned = self.pinned;
        let oldest = self
            .tabs
            .iter()
            .filter(|(tab_id, _)| Some(**tab_id) != pinned)
            .min_by_key(|(_, known)| known.last_seen)
            .map(|(tab_id, _)| *tab_id);
        if let Some(tab_id) = oldest {
            self.tabs.remove(&tab_id);
            debug!(tab_id, "Tab registry full; forgetting least recently seen tab");
        }
    }
}

impl Browser for BridgeBrowser {
    fn observe(&mut self, event: &BackgroundEvent) {
        match event {
            BackgroundEvent::GenerationStarted { tab_id, url } => {
                self.pinned = Some(*tab_id);
                self.entry(*tab_id).url = Some(url.clone());
            }
            BackgroundEvent::GenerationFinished { tab_id, url } => {
                self.entry(*tab_id).url = Some(url.clone());
            }
            BackgroundEvent::TabActivated {
                tab_id,
                window_id,
                url,
                title,
            } => {
                let tab = self.entry(*tab_id);
                if window_id.is_some() {
                    tab.window_id = *window_id;
                }
                if url.is_some() {
                    tab.url = url.clone();
                }
                if title.is_some() {
                    tab.title = title.clone();
                }
            }
            BackgroundEvent::TabUpdated { tab_id, url, title } => {
                let tab = self.entry(*tab_id);
                if url.is_some() {
                    tab.url = url.clone();
                }
                if title.is_some() {
                    tab.title = title.clone();
                }
            }
            BackgroundEvent::TabRemoved { tab_id } => {
                self.tabs.remove(tab_id);
                if self.pinned == Some(*tab_id) {
                    self.pinned = None;
                }
            }
            BackgroundEvent::NotificationClicked { .. }
            | BackgroundEvent::FocusTracked
            | BackgroundEvent::TitleRetry { .. } => {}
        }
    }

    fn tab(&self, tab_id: i64) -> Result<TabInfo> {
        self.tabs
            .get(&tab_id)
            .map(|known| known.info.clone())
            .ok_or(NotifierError::TabNotFound(tab_id))
    }

    fn activate_tab(&mut self, tab_id: i64) -> Result<()> {
        self.tab(tab_id)?;
        self.outbox.push(BrowserCommand::ActivateTab { tab_id })
    }

    fn focus_window(&mut self, window_id: i64) -> Result<()> {
        self.outbox.push(BrowserCommand::FocusWindow { window_id })
    }

    fn send_to_tab(&mut self, tab_id: i64, message: ExtensionMessage) -> Result<()> {
        self.tab(tab_id)?;
        self.outbox.push(BrowserCommand::SendToTab { tab_id, message })
    }
}

pub struct BridgeNotifier {
    outbox: CommandOutbox,
}

impl BridgeNotifier {
    pub fn new(outbox: CommandOutbox) -> Self {
        BridgeNotifier { outbox }
    }
}

impl Notifier for BridgeNotifier {
    fn clear_all(&mut self) -> Result<()> {
        self.outbox.push(BrowserCommand::ClearNotifications)
    }

    fn create(&mut self, notification: Notification) -> Result<()> {
        self.outbox.push(BrowserCommand::CreateNotification {
            notification_id: notification.id,
            title: notification.title,
            message: notification.message,
            silent: notification.silent,
        })
    }
}
