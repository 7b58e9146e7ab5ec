//! Background reconciler: the single writer of the status store.
//!
//! Each [`BackgroundEvent`] is reduced against the current session, the result
//! is written through the [`StatusStore`], and the resulting effects are carried
//! out against the browser seams.
//!
//! Completion notifications are deferred until the tracked tab has a real
//! title. Resolution is retried on the configured backoff via the
//! [`Scheduler`]; a `TitleRetry` that no longer matches the pending dispatch is
//! stale and ignored.

use std::sync::mpsc::Receiver;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use chat_notifier_protocol::{ExtensionMessage, PreferenceKey};

use crate::config::NotificationConfig;
use crate::error::Result;
use crate::reducer::{reduce, BackgroundEvent, Effect, ReduceContext, SessionUpdate};
use crate::store::{KeyValueStore, StatusStore, StorageChange};
use crate::types::{ChatService, Preferences, SessionStatus, StatusData, TrackedSession};

pub const NOTIFICATION_PREFIX: &str = "chat-complete-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabInfo {
    pub tab_id: i64,
    pub window_id: Option<i64>,
    pub url: Option<String>,
    pub title: Option<String>,
}

pub trait Browser {
    /// Sees every event before it is reduced, so a bridge can keep its tab
    /// registry current.
    fn observe(&mut self, _event: &BackgroundEvent) {}

    /// Looks up a live tab. Closed or unknown tabs are `TabNotFound`.
    fn tab(&self, tab_id: i64) -> Result<TabInfo>;
    fn activate_tab(&mut self, tab_id: i64) -> Result<()>;
    fn focus_window(&mut self, window_id: i64) -> Result<()>;
    fn send_to_tab(&mut self, tab_id: i64, message: ExtensionMessage) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: String,
    pub title: String,
    pub message: String,
    /// Suppresses the system sound; set when the page plays its own.
    pub silent: bool,
}

pub trait Notifier {
    fn clear_all(&mut self) -> Result<()>;
    fn create(&mut self, notification: Notification) -> Result<()>;
}

pub trait Scheduler {
    /// Delivers `event` back to the reconciler after `delay`.
    fn schedule(&mut self, delay: Duration, event: BackgroundEvent);
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingCompletion {
    dispatch_id: u64,
    tab_id: i64,
    url: String,
    attempt: usize,
}

pub struct Reconciler<K, B, N, S> {
    store: StatusStore<K>,
    browser: B,
    notifier: N,
    scheduler: S,
    config: NotificationConfig,
    pending: Option<PendingCompletion>,
    last_dispatch_id: u64,
}

impl<K, B, N, S> Reconciler<K, B, N, S>
where
    K: KeyValueStore,
    B: Browser,
    N: Notifier,
    S: Scheduler,
{
    /// The store must already hold the last-persisted session.
    pub fn new(
        store: StatusStore<K>,
        browser: B,
        notifier: N,
        scheduler: S,
        config: NotificationConfig,
    ) -> Self {
        Reconciler {
            store,
            browser,
            notifier,
            scheduler,
            config,
            pending: None,
            last_dispatch_id: 0,
        }
    }

    pub fn handle(&mut self, event: BackgroundEvent) {
        debug!(event = event.name(), "Handling background event");
        self.browser.observe(&event);

        match &event {
            BackgroundEvent::NotificationClicked { notification_id } => {
                self.handle_click(notification_id);
                return;
            }
            BackgroundEvent::FocusTracked => {
                self.focus_tracked();
                return;
            }
            BackgroundEvent::TitleRetry {
                dispatch_id,
                attempt,
            } => {
                self.retry_title(*dispatch_id, *attempt);
                return;
            }
            _ => {}
        }

        let ctx = self.context();
        let reduction = reduce(self.store.session(), &event, ctx);
        self.apply(reduction.update);
        for effect in reduction.effects {
            self.run(effect);
        }

        if let BackgroundEvent::TabUpdated {
            tab_id,
            title: Some(_),
            ..
        } = &event
        {
            if self.pending.as_ref().map(|pending| pending.tab_id) == Some(*tab_id) {
                self.try_resolve_pending();
            }
        }
    }

    pub fn status(&self) -> StatusData {
        self.store.session().to_status_data()
    }

    pub fn session(&self) -> &TrackedSession {
        self.store.session()
    }

    pub fn store(&self) -> &StatusStore<K> {
        &self.store
    }

    pub fn set_preference(&mut self, key: PreferenceKey, value: bool) -> Result<()> {
        info!(key = key.as_str(), value, "Preference updated");
        self.store.set_preference(key, value)
    }

    pub fn preferences(&self) -> Preferences {
        self.store.preferences()
    }

    pub fn subscribe(&mut self) -> Receiver<Vec<StorageChange>> {
        self.store.subscribe()
    }

    pub fn browser(&self) -> &B {
        &self.browser
    }

    pub fn browser_mut(&mut self) -> &mut B {
        &mut self.browser
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    pub fn notifier_mut(&mut self) -> &mut N {
        &mut self.notifier
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    /// Dispatch id of the completion notification still waiting on a title.
    pub fn pending_dispatch(&self) -> Option<u64> {
        self.pending.as_ref().map(|pending| pending.dispatch_id)
    }

    fn context(&self) -> ReduceContext {
        let tracked_tab_open = self
            .store
            .session()
            .tracked_tab_id
            .map(|tab_id| self.browser.tab(tab_id).is_ok())
            .unwrap_or(false);
        ReduceContext { tracked_tab_open }
    }

    fn apply(&mut self, update: SessionUpdate) {
        let result = match update {
            SessionUpdate::Skip => return,
            SessionUpdate::Set(next) => {
                if &next == self.store.session() {
                    return;
                }
                if next.status != self.store.session().status {
                    info!(
                        tab_id = ?next.tracked_tab_id,
                        status = next.status.as_str(),
                        url = %next.tracked_url,
                        "Status changed"
                    );
                }
                self.store.write(next)
            }
            SessionUpdate::Reset => {
                info!(
                    tab_id = ?self.store.session().tracked_tab_id,
                    "Tracked tab gone; resetting session"
                );
                self.store.reset()
            }
        };
        if let Err(err) = result {
            warn!(error = %err, "Failed to persist session");
        }
    }

    fn run(&mut self, effect: Effect) {
        match effect {
            Effect::DispatchCompletion { tab_id } => self.begin_dispatch(tab_id),
            Effect::ClearNotifications => self.clear_notifications(),
            Effect::AbandonPendingNotification => {
                if let Some(pending) = self.pending.take() {
                    debug!(
                        dispatch_id = pending.dispatch_id,
                        tab_id = pending.tab_id,
                        "Abandoned pending completion notification"
                    );
                }
            }
        }
    }

    fn begin_dispatch(&mut self, tab_id: i64) {
        self.last_dispatch_id += 1;
        let dispatch_id = self.last_dispatch_id;
        self.pending = Some(PendingCompletion {
            dispatch_id,
            tab_id,
            url: self.store.session().tracked_url.clone(),
            attempt: 0,
        });
        if !self.try_resolve_pending() {
            self.schedule_retry();
        }
    }

    fn retry_title(&mut self, dispatch_id: u64, attempt: usize) {
        let current = self.pending.as_ref().map(|p| (p.dispatch_id, p.attempt));
        if current != Some((dispatch_id, attempt)) {
            debug!(dispatch_id, attempt, "Ignoring stale title retry");
            return;
        }
        if self.try_resolve_pending() {
            return;
        }
        if let Some(pending) = self.pending.as_mut() {
            pending.attempt += 1;
        }
        self.schedule_retry();
    }

    fn schedule_retry(&mut self) {
        let Some(pending) = self.pending.as_ref() else {
            return;
        };
        match self.config.retry_delay(pending.attempt) {
            Some(delay) => {
                debug!(
                    dispatch_id = pending.dispatch_id,
                    attempt = pending.attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Tab title not ready; retrying"
                );
                self.scheduler.schedule(
                    delay,
                    BackgroundEvent::TitleRetry {
                        dispatch_id: pending.dispatch_id,
                        attempt: pending.attempt,
                    },
                );
            }
            None => {
                let service = ChatService::from_url(&pending.url);
                self.deliver(None, fallback_title(service));
            }
        }
    }

    /// Delivers the pending notification if the tab title has resolved.
    fn try_resolve_pending(&mut self) -> bool {
        let Some(pending) = self.pending.as_ref() else {
            return false;
        };
        let service = ChatService::from_url(&pending.url);
        let live_title = match self.browser.tab(pending.tab_id) {
            Ok(tab) => tab.title,
            Err(err) => {
                debug!(tab_id = pending.tab_id, error = %err, "Tab lookup failed");
                None
            }
        };
        let candidate = live_title.or_else(|| self.store.session().tab_title.clone());

        match candidate.and_then(|raw| usable_title(service, &raw).map(|clean| (raw, clean))) {
            Some((raw, clean)) => {
                self.deliver(Some(raw), clean);
                true
            }
            None => false,
        }
    }

    fn deliver(&mut self, raw_title: Option<String>, title: String) {
        let Some(pending) = self.pending.take() else {
            return;
        };

        if let Some(raw) = raw_title {
            let session = self.store.session();
            let still_done = session.status == SessionStatus::Done
                && session.tracked_url == pending.url;
            if still_done && session.tab_title.as_deref() != Some(raw.as_str()) {
                let mut next = session.clone();
                next.tab_title = Some(raw);
                if let Err(err) = self.store.write(next) {
                    warn!(error = %err, "Failed to persist tab title");
                }
            }
        }

        self.clear_notifications();

        let silent = if self.store.sound_enabled() {
            match self
                .browser
                .send_to_tab(pending.tab_id, ExtensionMessage::PlayNotificationSound)
            {
                Ok(()) => true,
                Err(err) => {
                    warn!(tab_id = pending.tab_id, error = %err, "Page sound unavailable; using system sound");
                    false
                }
            }
        } else {
            true
        };

        let notification = Notification {
            id: format!(
                "{}{}-{}",
                NOTIFICATION_PREFIX,
                pending.dispatch_id,
                Utc::now().timestamp_millis()
            ),
            title,
            message: self.config.message.clone(),
            silent,
        };
        info!(
            tab_id = pending.tab_id,
            notification_id = %notification.id,
            title = %notification.title,
            "Raising completion notification"
        );
        if let Err(err) = self.notifier.create(notification) {
            warn!(error = %err, "Failed to create notification");
        }
    }

    fn clear_notifications(&mut self) {
        if let Err(err) = self.notifier.clear_all() {
            warn!(error = %err, "Failed to clear notifications");
        }
    }

    fn handle_click(&mut self, notification_id: &str) {
        if !notification_id.starts_with(NOTIFICATION_PREFIX) {
            debug!(notification_id, "Ignoring click on foreign notification");
            return;
        }
        self.focus_tracked();
    }

    /// Activates the tracked tab and focuses its window. A closed or unknown
    /// tab is a logged no-op.
    fn focus_tracked(&mut self) {
        let Some(tab_id) = self.store.session().tracked_tab_id else {
            debug!("Focus requested with nothing tracked");
            return;
        };
        let tab = match self.browser.tab(tab_id) {
            Ok(tab) => tab,
            Err(err) => {
                info!(tab_id, error = %err, "Focus requested for a closed tab");
                return;
            }
        };
        if let Err(err) = self.browser.activate_tab(tab_id) {
            warn!(tab_id, error = %err, "Failed to activate tab");
            return;
        }
        if let Some(window_id) = tab.window_id {
            if let Err(err) = self.browser.focus_window(window_id) {
                warn!(window_id, error = %err, "Failed to focus window");
            }
        }
    }
}

/// Cleaned title when it names the conversation, `None` for placeholders.
fn usable_title(service: Option<ChatService>, raw: &str) -> Option<String> {
    let cleaned = match service {
        Some(service) if service.is_placeholder_title(raw) => return None,
        Some(service) => service.clean_title(raw),
        None => raw.trim().to_string(),
    };
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

fn fallback_title(service: Option<ChatService>) -> String {
    match service {
        Some(service) => service.fallback_notification_title(),
        None => "Chat Response Complete".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NotifierError;
    use crate::store::MemoryKvStore;
    use std::collections::HashMap;

    const CHATGPT: &str = "https://chatgpt.com/c/1";

    #[derive(Default)]
    struct FakeBrowser {
        tabs: HashMap<i64, TabInfo>,
        activated: Vec<i64>,
        focused: Vec<i64>,
        sent: Vec<(i64, ExtensionMessage)>,
        fail_send: bool,
    }

    impl FakeBrowser {
        fn open(&mut self, tab_id: i64, url: &str, title: Option<&str>) {
            self.tabs.insert(
                tab_id,
                TabInfo {
                    tab_id,
                    window_id: Some(100 + tab_id),
                    url: Some(url.to_string()),
                    title: title.map(str::to_string),
                },
            );
        }

        fn retitle(&mut self, tab_id: i64, title: &str) {
            if let Some(tab) = self.tabs.get_mut(&tab_id) {
                tab.title = Some(title.to_string());
            }
        }
    }

    impl Browser for FakeBrowser {
        fn tab(&self, tab_id: i64) -> Result<TabInfo> {
            self.tabs
                .get(&tab_id)
                .cloned()
                .ok_or(NotifierError::TabNotFound(tab_id))
        }

        fn activate_tab(&mut self, tab_id: i64) -> Result<()> {
            self.activated.push(tab_id);
            Ok(())
        }

        fn focus_window(&mut self, window_id: i64) -> Result<()> {
            self.focused.push(window_id);
            Ok(())
        }

        fn send_to_tab(&mut self, tab_id: i64, message: ExtensionMessage) -> Result<()> {
            if self.fail_send {
                return Err(NotifierError::TabNotFound(tab_id));
            }
            self.sent.push((tab_id, message));
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeNotifier {
        created: Vec<Notification>,
        clears: usize,
        fail: bool,
    }

    impl Notifier for FakeNotifier {
        fn clear_all(&mut self) -> Result<()> {
            self.clears += 1;
            Ok(())
        }

        fn create(&mut self, notification: Notification) -> Result<()> {
            if self.fail {
                return Err(NotifierError::NotificationFailed("denied".to_string()));
            }
            self.created.push(notification);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeScheduler {
        scheduled: Vec<(Duration, BackgroundEvent)>,
    }

    impl Scheduler for FakeScheduler {
        fn schedule(&mut self, delay: Duration, event: BackgroundEvent) {
            self.scheduled.push((delay, event));
        }
    }

    type TestReconciler = Reconciler<MemoryKvStore, FakeBrowser, FakeNotifier, FakeScheduler>;

    fn reconciler() -> TestReconciler {
        Reconciler::new(
            StatusStore::load(MemoryKvStore::new()),
            FakeBrowser::default(),
            FakeNotifier::default(),
            FakeScheduler::default(),
            NotificationConfig::default(),
        )
    }

    fn started(tab_id: i64, url: &str) -> BackgroundEvent {
        BackgroundEvent::GenerationStarted {
            tab_id,
            url: url.to_string(),
        }
    }

    fn finished(tab_id: i64, url: &str) -> BackgroundEvent {
        BackgroundEvent::GenerationFinished {
            tab_id,
            url: url.to_string(),
        }
    }

    /// Runs the most recently scheduled retry.
    fn fire_last_retry(reconciler: &mut TestReconciler) {
        let event = reconciler
            .scheduler()
            .scheduled
            .last()
            .map(|(_, event)| event.clone())
            .expect("a retry is scheduled");
        reconciler.handle(event);
    }

    #[test]
    fn submit_then_complete_raises_one_notification() {
        let mut reconciler = reconciler();
        reconciler
            .browser_mut()
            .open(7, CHATGPT, Some("Trip ideas - ChatGPT"));

        reconciler.handle(started(7, CHATGPT));
        assert_eq!(reconciler.status().status, SessionStatus::InProgress);
        assert_eq!(reconciler.status().tracked_tab_id, Some(7));

        reconciler.handle(finished(7, CHATGPT));
        let status = reconciler.status();
        assert_eq!(status.status, SessionStatus::Done);
        assert_eq!(status.tracked_url, CHATGPT);
        assert_eq!(status.tab_title.as_deref(), Some("Trip ideas - ChatGPT"));

        let created = &reconciler.notifier().created;
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].title, "Trip ideas");
        assert_eq!(created[0].message, "Your AI response is ready.");
        assert!(created[0].id.starts_with("chat-complete-1-"));
        assert!(created[0].silent);
        assert_eq!(reconciler.notifier().clears, 1);
        assert_eq!(
            reconciler.browser().sent,
            vec![(7, ExtensionMessage::PlayNotificationSound)]
        );
        assert!(reconciler.scheduler().scheduled.is_empty());
    }

    #[test]
    fn placeholder_title_is_retried_then_resolved() {
        let mut reconciler = reconciler();
        reconciler.browser_mut().open(7, CHATGPT, Some("ChatGPT"));
        reconciler.handle(started(7, CHATGPT));
        reconciler.handle(finished(7, CHATGPT));

        assert!(reconciler.notifier().created.is_empty());
        assert_eq!(
            reconciler.scheduler().scheduled,
            vec![(
                Duration::from_millis(250),
                BackgroundEvent::TitleRetry {
                    dispatch_id: 1,
                    attempt: 0
                }
            )]
        );

        reconciler.browser_mut().retitle(7, "Packing list - ChatGPT");
        fire_last_retry(&mut reconciler);
        assert_eq!(reconciler.notifier().created.len(), 1);
        assert_eq!(reconciler.notifier().created[0].title, "Packing list");
        assert_eq!(
            reconciler.status().tab_title.as_deref(),
            Some("Packing list - ChatGPT")
        );
        assert_eq!(reconciler.pending_dispatch(), None);
    }

    #[test]
    fn exhausted_retries_use_fallback_title() {
        let mut reconciler = reconciler();
        reconciler.browser_mut().open(7, CHATGPT, None);
        reconciler.handle(started(7, CHATGPT));
        reconciler.handle(finished(7, CHATGPT));

        for _ in 0..3 {
            assert!(reconciler.notifier().created.is_empty());
            fire_last_retry(&mut reconciler);
        }

        let delays: Vec<Duration> = reconciler
            .scheduler()
            .scheduled
            .iter()
            .map(|(delay, _)| *delay)
            .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(250),
                Duration::from_millis(500),
                Duration::from_millis(1000)
            ]
        );
        assert_eq!(reconciler.notifier().created.len(), 1);
        assert_eq!(
            reconciler.notifier().created[0].title,
            "ChatGPT Response Complete"
        );
        assert_eq!(reconciler.status().status, SessionStatus::Done);
    }

    #[test]
    fn title_update_resolves_pending_notification_immediately() {
        let mut reconciler = reconciler();
        reconciler.browser_mut().open(7, CHATGPT, None);
        reconciler.handle(started(7, CHATGPT));
        reconciler.handle(finished(7, CHATGPT));

        reconciler.browser_mut().retitle(7, "Rust lifetimes - ChatGPT");
        reconciler.handle(BackgroundEvent::TabUpdated {
            tab_id: 7,
            url: None,
            title: Some("Rust lifetimes - ChatGPT".to_string()),
        });
        assert_eq!(reconciler.notifier().created.len(), 1);
        assert_eq!(reconciler.notifier().created[0].title, "Rust lifetimes");

        // The retry that was already scheduled is now stale.
        fire_last_retry(&mut reconciler);
        assert_eq!(reconciler.notifier().created.len(), 1);
    }

    #[test]
    fn new_generation_abandons_pending_notification() {
        let mut reconciler = reconciler();
        reconciler.browser_mut().open(7, CHATGPT, None);
        reconciler.handle(started(7, CHATGPT));
        reconciler.handle(finished(7, CHATGPT));
        assert_eq!(reconciler.pending_dispatch(), Some(1));

        reconciler.handle(started(7, CHATGPT));
        assert_eq!(reconciler.pending_dispatch(), None);
        fire_last_retry(&mut reconciler);
        assert!(reconciler.notifier().created.is_empty());
        assert_eq!(reconciler.status().status, SessionStatus::InProgress);
    }

    #[test]
    fn sound_disabled_creates_silent_notification_without_page_sound() {
        let mut reconciler = reconciler();
        reconciler
            .set_preference(PreferenceKey::SoundEnabled, false)
            .unwrap();
        reconciler.browser_mut().open(7, CHATGPT, Some("Notes - ChatGPT"));
        reconciler.handle(started(7, CHATGPT));
        reconciler.handle(finished(7, CHATGPT));

        assert!(reconciler.browser().sent.is_empty());
        assert!(reconciler.notifier().created[0].silent);
    }

    #[test]
    fn failed_page_sound_uses_system_sound() {
        let mut reconciler = reconciler();
        reconciler.browser_mut().open(7, CHATGPT, Some("Notes - ChatGPT"));
        reconciler.browser_mut().fail_send = true;
        reconciler.handle(started(7, CHATGPT));
        reconciler.handle(finished(7, CHATGPT));

        assert!(!reconciler.notifier().created[0].silent);
    }

    #[test]
    fn notification_failure_keeps_done() {
        let mut reconciler = reconciler();
        reconciler.browser_mut().open(7, CHATGPT, Some("Notes - ChatGPT"));
        reconciler.notifier_mut().fail = true;
        reconciler.handle(started(7, CHATGPT));
        reconciler.handle(finished(7, CHATGPT));

        assert_eq!(reconciler.status().status, SessionStatus::Done);
    }

    #[test]
    fn click_activates_tab_and_focuses_window() {
        let mut reconciler = reconciler();
        reconciler.browser_mut().open(7, CHATGPT, Some("Notes - ChatGPT"));
        reconciler.handle(started(7, CHATGPT));
        reconciler.handle(finished(7, CHATGPT));
        let id = reconciler.notifier().created[0].id.clone();

        reconciler.handle(BackgroundEvent::NotificationClicked {
            notification_id: id,
        });
        assert_eq!(reconciler.browser().activated, vec![7]);
        assert_eq!(reconciler.browser().focused, vec![107]);
    }

    #[test]
    fn click_on_closed_tab_is_silent() {
        let mut reconciler = reconciler();
        reconciler.browser_mut().open(7, CHATGPT, Some("Notes - ChatGPT"));
        reconciler.handle(started(7, CHATGPT));
        reconciler.handle(finished(7, CHATGPT));
        let id = reconciler.notifier().created[0].id.clone();
        reconciler.browser_mut().tabs.remove(&7);

        reconciler.handle(BackgroundEvent::NotificationClicked {
            notification_id: id,
        });
        assert!(reconciler.browser().activated.is_empty());
        assert_eq!(reconciler.status().status, SessionStatus::Done);
    }

    #[test]
    fn focus_request_brings_tracked_tab_forward() {
        let mut reconciler = reconciler();
        reconciler.handle(BackgroundEvent::FocusTracked);
        assert!(reconciler.browser().activated.is_empty());

        reconciler.browser_mut().open(7, CHATGPT, Some("Notes - ChatGPT"));
        reconciler.handle(started(7, CHATGPT));
        reconciler.handle(BackgroundEvent::FocusTracked);

        assert_eq!(reconciler.browser().activated, vec![7]);
        assert_eq!(reconciler.browser().focused, vec![107]);
        assert_eq!(reconciler.status().status, SessionStatus::InProgress);
        assert!(reconciler.notifier().created.is_empty());
    }

    #[test]
    fn closing_tracked_tab_resets_and_keeps_preferences() {
        let mut reconciler = reconciler();
        reconciler
            .set_preference(PreferenceKey::ImageHidden, true)
            .unwrap();
        reconciler.browser_mut().open(7, CHATGPT, None);
        reconciler.handle(started(7, CHATGPT));

        reconciler.browser_mut().tabs.remove(&7);
        reconciler.handle(BackgroundEvent::TabRemoved { tab_id: 7 });

        assert_eq!(reconciler.status(), StatusData::default());
        assert_eq!(reconciler.notifier().clears, 1);
        let items = reconciler.store().kv().items();
        assert_eq!(items.get("imageHidden"), Some(&serde_json::Value::Bool(true)));
        assert!(reconciler.preferences().image_hidden);
    }

    #[test]
    fn other_tab_on_same_service_does_not_reset_in_flight_session() {
        let mut reconciler = reconciler();
        reconciler.browser_mut().open(7, CHATGPT, None);
        reconciler.browser_mut().open(9, "https://chatgpt.com/", None);
        reconciler.handle(started(7, CHATGPT));

        reconciler.handle(BackgroundEvent::TabActivated {
            tab_id: 9,
            window_id: Some(109),
            url: Some("https://chatgpt.com/".to_string()),
            title: None,
        });
        reconciler.handle(BackgroundEvent::TabUpdated {
            tab_id: 9,
            url: Some("https://chatgpt.com/c/9".to_string()),
            title: None,
        });

        let status = reconciler.status();
        assert_eq!(status.tracked_tab_id, Some(7));
        assert_eq!(status.status, SessionStatus::InProgress);
        assert_eq!(status.tracked_url, CHATGPT);
    }

    #[test]
    fn unrelated_completion_does_not_touch_store() {
        let mut reconciler = reconciler();
        reconciler.browser_mut().open(7, CHATGPT, None);
        reconciler.handle(started(7, CHATGPT));
        let feed = reconciler.subscribe();

        reconciler.handle(finished(9, "https://claude.ai/chat/1"));
        assert!(feed.try_recv().is_err());
        assert_eq!(reconciler.status().status, SessionStatus::InProgress);
        assert!(reconciler.notifier().created.is_empty());
    }

    #[test]
    fn startup_restores_persisted_session() {
        let mut kv = MemoryKvStore::new();
        {
            let mut store = StatusStore::load(MemoryKvStore::new());
            store
                .write(TrackedSession {
                    tracked_tab_id: Some(3),
                    status: SessionStatus::Done,
                    tracked_url: CHATGPT.to_string(),
                    tab_title: None,
                })
                .unwrap();
            kv.set(store.kv().items().clone()).unwrap();
        }
        let reconciler = Reconciler::new(
            StatusStore::load(kv),
            FakeBrowser::default(),
            FakeNotifier::default(),
            FakeScheduler::default(),
            NotificationConfig::default(),
        );
        assert_eq!(reconciler.status().tracked_tab_id, Some(3));
        assert_eq!(reconciler.status().status, SessionStatus::Done);
    }
}
