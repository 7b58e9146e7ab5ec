//! The daemon's single writer.
//!
//! One thread owns the [`Reconciler`] (and with it the status store). Connection
//! threads talk to it only through [`EventLoopHandle`], so events are applied
//! strictly in arrival order.

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use chat_notifier_core::{
    BackgroundEvent, Browser, KeyValueStore, NotificationConfig, Notifier, Preferences, Reconciler,
    Scheduler, StatusData, StatusStore, StorageChange,
};
use chat_notifier_protocol::PreferenceKey;
use tracing::{debug, warn};

pub enum DaemonCommand {
    Event(BackgroundEvent),
    GetStatus {
        reply: Sender<StatusData>,
    },
    GetPreferences {
        reply: Sender<Preferences>,
    },
    SetPreference {
        key: PreferenceKey,
        value: bool,
        reply: Sender<Result<(), String>>,
    },
    Subscribe {
        reply: Sender<Receiver<Vec<StorageChange>>>,
    },
}

/// [`Scheduler`] that sleeps on a helper thread, then posts the event back
/// onto the loop.
pub struct ChannelScheduler {
    sender: Sender<DaemonCommand>,
}

impl Scheduler for ChannelScheduler {
    fn schedule(&mut self, delay: Duration, event: BackgroundEvent) {
        let sender = self.sender.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            if sender.send(DaemonCommand::Event(event)).is_err() {
                debug!("Event loop gone; dropping scheduled event");
            }
        });
    }
}

#[derive(Clone)]
pub struct EventLoopHandle {
    sender: Sender<DaemonCommand>,
    reply_timeout: Duration,
}

impl EventLoopHandle {
    pub fn post(&self, event: BackgroundEvent) -> Result<(), String> {
        self.sender
            .send(DaemonCommand::Event(event))
            .map_err(|_| "event loop is not running".to_string())
    }

    /// Current status. Falls back to the idle defaults when the loop doesn't
    /// answer in time.
    pub fn status(&self) -> StatusData {
        let (reply, response) = mpsc::channel();
        if self.sender.send(DaemonCommand::GetStatus { reply }).is_err() {
            warn!("Event loop is not running; reporting idle");
            return StatusData::default();
        }
        match response.recv_timeout(self.reply_timeout) {
            Ok(status) => status,
            Err(err) => {
                warn!(error = %err, "Status request timed out; reporting idle");
                StatusData::default()
            }
        }
    }

    pub fn preferences(&self) -> Result<Preferences, String> {
        let (reply, response) = mpsc::channel();
        self.sender
            .send(DaemonCommand::GetPreferences { reply })
            .map_err(|_| "event loop is not running".to_string())?;
        response
            .recv_timeout(self.reply_timeout)
            .map_err(|err| format!("preferences request timed out: {}", err))
    }

    pub fn set_preference(&self, key: PreferenceKey, value: bool) -> Result<(), String> {
        let (reply, response) = mpsc::channel();
        self.sender
            .send(DaemonCommand::SetPreference { key, value, reply })
            .map_err(|_| "event loop is not running".to_string())?;
        response
            .recv_timeout(self.reply_timeout)
            .map_err(|err| format!("preference update timed out: {}", err))?
    }

    pub fn subscribe(&self) -> Result<Receiver<Vec<StorageChange>>, String> {
        let (reply, response) = mpsc::channel();
        self.sender
            .send(DaemonCommand::Subscribe { reply })
            .map_err(|_| "event loop is not running".to_string())?;
        response
            .recv_timeout(self.reply_timeout)
            .map_err(|err| format!("subscribe timed out: {}", err))
    }
}

/// Starts the writer thread. The store is expected to hold the persisted
/// session already, so nothing is handled before it is loaded.
pub fn spawn<K, B, N>(
    store: StatusStore<K>,
    browser: B,
    notifier: N,
    config: NotificationConfig,
    reply_timeout: Duration,
) -> EventLoopHandle
where
    K: KeyValueStore + Send + 'static,
    B: Browser + Send + 'static,
    N: Notifier + Send + 'static,
{
    let (sender, receiver) = mpsc::channel();
    let scheduler = ChannelScheduler {
        sender: sender.clone(),
    };
    let reconciler = Reconciler::new(store, browser, notifier, scheduler, config);
    thread::spawn(move || run(reconciler, receiver));
    EventLoopHandle {
        sender,
        reply_timeout,
    }
}

fn run<K, B, N>(
    mut reconciler: Reconciler<K, B, N, ChannelScheduler>,
    receiver: Receiver<DaemonCommand>,
) where
    K: KeyValueStore,
    B: Browser,
    N: Notifier,
{
    for command in receiver {
        match command {
            DaemonCommand::Event(event) => reconciler.handle(event),
            DaemonCommand::GetStatus { reply } => {
                let _ = reply.send(reconciler.status());
            }
            DaemonCommand::GetPreferences { reply } => {
                let _ = reply.send(reconciler.preferences());
            }
            DaemonCommand::SetPreference { key, value, reply } => {
                let result = reconciler
                    .set_preference(key, value)
                    .map_err(String::from);
                let _ = reply.send(result);
            }
            DaemonCommand::Subscribe { reply } => {
                let _ = reply.send(reconciler.subscribe());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BridgeBrowser, BridgeNotifier, CommandOutbox};
    use chat_notifier_core::{MemoryKvStore, SessionStatus};
    use chat_notifier_protocol::BrowserCommand;
    use std::time::Instant;

    fn start(config: NotificationConfig) -> (EventLoopHandle, CommandOutbox) {
        let outbox = CommandOutbox::new();
        let handle = spawn(
            StatusStore::load(MemoryKvStore::new()),
            BridgeBrowser::new(outbox.clone()),
            BridgeNotifier::new(outbox.clone()),
            config,
            Duration::from_secs(1),
        );
        (handle, outbox)
    }

    #[test]
    fn events_apply_in_order() {
        let (handle, _outbox) = start(NotificationConfig::default());
        let url = "https://chatgpt.com/c/1".to_string();
        handle
            .post(BackgroundEvent::GenerationStarted {
                tab_id: 7,
                url: url.clone(),
            })
            .unwrap();
        handle
            .post(BackgroundEvent::GenerationStarted { tab_id: 9, url })
            .unwrap();

        let status = handle.status();
        assert_eq!(status.tracked_tab_id, Some(9));
        assert_eq!(status.status, SessionStatus::InProgress);
    }

    #[test]
    fn preferences_reflect_updates() {
        let (handle, _outbox) = start(NotificationConfig::default());
        assert_eq!(handle.preferences().unwrap(), Preferences::default());

        handle
            .set_preference(PreferenceKey::SoundEnabled, false)
            .unwrap();
        let preferences = handle.preferences().unwrap();
        assert!(!preferences.sound_enabled);
        assert!(!preferences.image_hidden);
    }

    #[test]
    fn subscribers_see_store_changes() {
        let (handle, _outbox) = start(NotificationConfig::default());
        let changes = handle.subscribe().unwrap();
        handle
            .post(BackgroundEvent::GenerationStarted {
                tab_id: 1,
                url: "https://claude.ai/chat/1".to_string(),
            })
            .unwrap();
        let batch = changes.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(batch.iter().any(|change| change.key == "status"));
    }

    #[test]
    fn scheduled_title_retry_falls_back_to_service_title() {
        let config = NotificationConfig {
            title_retry_delays_ms: vec![10],
            ..NotificationConfig::default()
        };
        let (handle, outbox) = start(config);
        let url = "https://claude.ai/chat/1".to_string();
        handle
            .post(BackgroundEvent::GenerationStarted {
                tab_id: 4,
                url: url.clone(),
            })
            .unwrap();
        handle
            .post(BackgroundEvent::GenerationFinished { tab_id: 4, url })
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut commands = Vec::new();
        while Instant::now() < deadline {
            commands.extend(outbox.drain());
            if commands
                .iter()
                .any(|command| matches!(command, BrowserCommand::CreateNotification { .. }))
            {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        let title = commands.iter().find_map(|command| match command {
            BrowserCommand::CreateNotification { title, .. } => Some(title.clone()),
            _ => None,
        });
        assert_eq!(title.as_deref(), Some("Claude Response Complete"));
    }
}
