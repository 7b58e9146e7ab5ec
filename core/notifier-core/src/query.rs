//! Read side: status snapshots for consumers, plus the change-or-repoll watcher.

use std::ops::ControlFlow;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::store::{read_session, KeyValueStore, StorageChange, SESSION_KEYS};
use crate::types::{ChatService, StatusData};

/// Current snapshot from storage. Never fails: storage errors yield the idle
/// defaults.
pub fn get_status<K: KeyValueStore + ?Sized>(kv: &K) -> StatusData {
    match read_session(kv) {
        Ok(session) => session.to_status_data(),
        Err(err) => {
            warn!(error = %err, "Status read failed; reporting idle");
            StatusData::default()
        }
    }
}

/// Human label for the tracked conversation: the cleaned tab title, else the
/// service name, else "Chat".
pub fn display_title(status: &StatusData) -> String {
    let service = ChatService::from_url(&status.tracked_url);
    let title = status.tab_title.as_deref().map(str::trim).unwrap_or("");
    match service {
        Some(service) if !service.is_placeholder_title(title) => service.clean_title(title),
        Some(service) => service.display_name().to_string(),
        None if !title.is_empty() => title.to_string(),
        None => "Chat".to_string(),
    }
}

pub fn status_label(status: &StatusData) -> &'static str {
    status.status.label()
}

/// Whether a change batch touched any session key.
pub fn is_session_change(changes: &[StorageChange]) -> bool {
    changes
        .iter()
        .any(|change| SESSION_KEYS.contains(&change.key.as_str()))
}

/// Tracks the last status a consumer has shown.
#[derive(Debug, Clone)]
pub struct StatusWatcher {
    current: Option<StatusData>,
    repoll_interval: Duration,
}

impl StatusWatcher {
    pub fn new(repoll_interval: Duration) -> Self {
        StatusWatcher {
            current: None,
            repoll_interval,
        }
    }

    pub fn current(&self) -> Option<&StatusData> {
        self.current.as_ref()
    }

    /// Records `status`, returning whether it differs from what was shown.
    pub fn apply(&mut self, status: StatusData) -> bool {
        if self.current.as_ref() == Some(&status) {
            return false;
        }
        self.current = Some(status);
        true
    }

    /// Fetches on every wake-up and at least once per repoll interval, calling
    /// `on_change` for each distinct status until it breaks.
    ///
    /// A disconnected wake channel degrades to plain polling.
    pub fn drive<T, F, G>(&mut self, wake: &Receiver<T>, mut fetch: F, mut on_change: G)
    where
        F: FnMut() -> StatusData,
        G: FnMut(&StatusData) -> ControlFlow<()>,
    {
        let mut feed_open = true;
        loop {
            let status = fetch();
            if self.apply(status.clone()) && on_change(&status).is_break() {
                return;
            }

            if !feed_open {
                thread::sleep(self.repoll_interval);
                continue;
            }
            match wake.recv_timeout(self.repoll_interval) {
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => debug!("Status repoll"),
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("Change feed closed; polling only");
                    feed_open = false;
                }
            }
        }
    }
}
