//! Durable key/value storage and the status store built on top of it.
//!
//! The persisted record is flat, camelCase keyed, and shared with user
//! preferences:
//!
//! ```json
//! {
//!   "trackedTabId": 7,
//!   "status": "in-progress",
//!   "trackedUrl": "https://chatgpt.com/c/1",
//!   "tabTitle": "Trip ideas - ChatGPT",
//!   "imageHidden": false,
//!   "soundEnabled": true
//! }
//! ```
//!
//! Session writes are merges. Nothing here ever replaces the whole record, so
//! preferences written by other consumers survive.
//!
//! # Defensive Design
//!
//! [`FileKvStore`] treats an empty or corrupt file as an empty store (logged),
//! and writes through a temp file + rename so a crash can't leave a partial file.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};

use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use tracing::warn;

use chat_notifier_protocol::{PreferenceKey, Preferences, SessionStatus};

use crate::error::{NotifierError, Result};
use crate::types::TrackedSession;

pub const KEY_TRACKED_TAB_ID: &str = "trackedTabId";
pub const KEY_STATUS: &str = "status";
pub const KEY_TRACKED_URL: &str = "trackedUrl";
pub const KEY_TAB_TITLE: &str = "tabTitle";
pub const SESSION_KEYS: [&str; 4] = [KEY_TRACKED_TAB_ID, KEY_STATUS, KEY_TRACKED_URL, KEY_TAB_TITLE];

pub type StorageItems = Map<String, Value>;

/// One changed key, in the style of `chrome.storage.onChanged`.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageChange {
    pub key: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

pub trait KeyValueStore {
    /// Returns the present subset of `keys`. Missing keys are simply absent.
    fn get(&self, keys: &[&str]) -> Result<StorageItems>;
    /// Merges `items` into the store.
    fn set(&mut self, items: StorageItems) -> Result<()>;
    fn remove(&mut self, keys: &[&str]) -> Result<()>;
    /// Change feed. Every successful write that changes a value is published.
    fn subscribe(&mut self) -> Receiver<Vec<StorageChange>>;
}

/// Fan-out of change batches to subscribers; disconnected receivers are pruned.
#[derive(Debug, Default)]
pub struct ChangeFeed {
    subscribers: Vec<Sender<Vec<StorageChange>>>,
}

impl ChangeFeed {
    pub fn subscribe(&mut self) -> Receiver<Vec<StorageChange>> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn publish(&mut self, changes: Vec<StorageChange>) {
        if changes.is_empty() {
            return;
        }
        self.subscribers
            .retain(|subscriber| subscriber.send(changes.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

fn diff_set(current: &StorageItems, updates: &StorageItems) -> Vec<StorageChange> {
    updates
        .iter()
        .filter(|(key, value)| current.get(*key) != Some(*value))
        .map(|(key, value)| StorageChange {
            key: key.clone(),
            old_value: current.get(key).cloned(),
            new_value: Some(value.clone()),
        })
        .collect()
}

fn diff_remove(current: &StorageItems, keys: &[&str]) -> Vec<StorageChange> {
    keys.iter()
        .filter_map(|key| {
            current.get(*key).map(|old| StorageChange {
                key: key.to_string(),
                old_value: Some(old.clone()),
                new_value: None,
            })
        })
        .collect()
}

fn select(items: &StorageItems, keys: &[&str]) -> StorageItems {
    keys.iter()
        .filter_map(|key| items.get(*key).map(|value| (key.to_string(), value.clone())))
        .collect()
}

/// In-memory store for tests and ephemeral hosts.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    items: StorageItems,
    feed: ChangeFeed,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: StorageItems) -> Self {
        MemoryKvStore {
            items,
            feed: ChangeFeed::default(),
        }
    }

    pub fn items(&self) -> &StorageItems {
        &self.items
    }
}

impl KeyValueStore for MemoryKvStore {
    fn get(&self, keys: &[&str]) -> Result<StorageItems> {
        Ok(select(&self.items, keys))
    }

    fn set(&mut self, items: StorageItems) -> Result<()> {
        let changes = diff_set(&self.items, &items);
        self.items.extend(items);
        self.feed.publish(changes);
        Ok(())
    }

    fn remove(&mut self, keys: &[&str]) -> Result<()> {
        let changes = diff_remove(&self.items, keys);
        for key in keys {
            self.items.remove(*key);
        }
        self.feed.publish(changes);
        Ok(())
    }

    fn subscribe(&mut self) -> Receiver<Vec<StorageChange>> {
        self.feed.subscribe()
    }
}

/// JSON-file backed store. Reads are served from an in-memory copy; every write
/// persists the full file atomically before the copy is updated.
#[derive(Debug)]
pub struct FileKvStore {
    path: PathBuf,
    items: StorageItems,
    feed: ChangeFeed,
}

impl FileKvStore {
    pub fn open(path: &Path) -> Result<Self> {
        let items = load_items(path)?;
        Ok(FileKvStore {
            path: path.to_path_buf(),
            items,
            feed: ChangeFeed::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, items: &StorageItems) -> Result<()> {
        let content = serde_json::to_string_pretty(items).map_err(|source| NotifierError::Json {
            context: "serializing storage".to_string(),
            source,
        })?;

        let parent_dir = self
            .path
            .parent()
            .ok_or_else(|| NotifierError::StorageUnavailable("storage path has no parent".to_string()))?;
        fs_err::create_dir_all(parent_dir).map_err(|source| NotifierError::Io {
            context: "creating storage directory".to_string(),
            source,
        })?;

        let io_err = |context: &str| {
            let context = context.to_string();
            move |source: std::io::Error| NotifierError::Io { context, source }
        };
        let mut temp_file = NamedTempFile::new_in(parent_dir).map_err(io_err("creating temp storage file"))?;
        temp_file
            .write_all(content.as_bytes())
            .map_err(io_err("writing temp storage file"))?;
        temp_file.flush().map_err(io_err("flushing temp storage file"))?;
        temp_file
            .persist(&self.path)
            .map_err(|err| NotifierError::Io {
                context: format!("replacing {}", self.path.display()),
                source: err.error,
            })?;
        Ok(())
    }
}

fn load_items(path: &Path) -> Result<StorageItems> {
    if !path.exists() {
        return Ok(StorageItems::new());
    }

    let content = fs_err::read_to_string(path).map_err(|source| NotifierError::Io {
        context: "reading storage".to_string(),
        source,
    })?;

    if content.trim().is_empty() {
        warn!(path = %path.display(), "Empty storage file, starting empty");
        return Ok(StorageItems::new());
    }

    match serde_json::from_str::<Value>(&content) {
        Ok(Value::Object(items)) => Ok(items),
        Ok(_) => {
            warn!(path = %path.display(), "Storage file is not an object, starting empty");
            Ok(StorageItems::new())
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Corrupt storage file, starting empty");
            Ok(StorageItems::new())
        }
    }
}

impl KeyValueStore for FileKvStore {
    fn get(&self, keys: &[&str]) -> Result<StorageItems> {
        Ok(select(&self.items, keys))
    }

    fn set(&mut self, items: StorageItems) -> Result<()> {
        let changes = diff_set(&self.items, &items);
        if changes.is_empty() {
            return Ok(());
        }
        let mut next = self.items.clone();
        next.extend(items);
        self.persist(&next)?;
        self.items = next;
        self.feed.publish(changes);
        Ok(())
    }

    fn remove(&mut self, keys: &[&str]) -> Result<()> {
        let changes = diff_remove(&self.items, keys);
        if changes.is_empty() {
            return Ok(());
        }
        let mut next = self.items.clone();
        for key in keys {
            next.remove(*key);
        }
        self.persist(&next)?;
        self.items = next;
        self.feed.publish(changes);
        Ok(())
    }

    fn subscribe(&mut self) -> Receiver<Vec<StorageChange>> {
        self.feed.subscribe()
    }
}

/// Reads the session fields leniently: missing or mistyped values fall back to
/// the idle defaults.
pub fn read_session<K: KeyValueStore + ?Sized>(kv: &K) -> Result<TrackedSession> {
    let items = kv.get(&SESSION_KEYS)?;
    let session = TrackedSession {
        tracked_tab_id: items.get(KEY_TRACKED_TAB_ID).and_then(Value::as_i64),
        status: items
            .get(KEY_STATUS)
            .and_then(Value::as_str)
            .and_then(SessionStatus::parse)
            .unwrap_or_default(),
        tracked_url: items
            .get(KEY_TRACKED_URL)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        tab_title: items
            .get(KEY_TAB_TITLE)
            .and_then(Value::as_str)
            .map(str::to_string),
    };
    Ok(session.normalized())
}

pub fn read_preference<K: KeyValueStore + ?Sized>(kv: &K, key: PreferenceKey) -> Result<Option<bool>> {
    let items = kv.get(&[key.as_str()])?;
    Ok(items.get(key.as_str()).and_then(Value::as_bool))
}

/// The canonical tracked session: an owned in-memory mirror, loaded once at
/// startup and written through to the backing store on every mutation.
pub struct StatusStore<K> {
    kv: K,
    session: TrackedSession,
}

impl<K: KeyValueStore> StatusStore<K> {
    pub fn load(kv: K) -> Self {
        let session = match read_session(&kv) {
            Ok(session) => session,
            Err(err) => {
                warn!(error = %err, "Failed to load persisted session; starting idle");
                TrackedSession::default()
            }
        };
        StatusStore { kv, session }
    }

    pub fn session(&self) -> &TrackedSession {
        &self.session
    }

    pub fn kv(&self) -> &K {
        &self.kv
    }

    pub fn kv_mut(&mut self) -> &mut K {
        &mut self.kv
    }

    /// Replaces the session. The in-memory mirror is updated even when the
    /// backing write fails; the error is returned for logging.
    pub fn write(&mut self, next: TrackedSession) -> Result<()> {
        let next = next.normalized();
        let drop_title = next.tab_title.is_none() && self.session.tab_title.is_some();
        self.session = next;

        let mut items = StorageItems::new();
        items.insert(
            KEY_TRACKED_TAB_ID.to_string(),
            self.session
                .tracked_tab_id
                .map(Value::from)
                .unwrap_or(Value::Null),
        );
        items.insert(
            KEY_STATUS.to_string(),
            Value::from(self.session.status.as_str()),
        );
        items.insert(
            KEY_TRACKED_URL.to_string(),
            Value::from(self.session.tracked_url.clone()),
        );
        if let Some(title) = &self.session.tab_title {
            items.insert(KEY_TAB_TITLE.to_string(), Value::from(title.clone()));
        }

        self.kv.set(items)?;
        if drop_title {
            self.kv.remove(&[KEY_TAB_TITLE])?;
        }
        Ok(())
    }

    /// Destroys the session, leaving preferences untouched.
    pub fn reset(&mut self) -> Result<()> {
        self.write(TrackedSession::default())
    }

    pub fn sound_enabled(&self) -> bool {
        match read_preference(&self.kv, PreferenceKey::SoundEnabled) {
            Ok(value) => value.unwrap_or(true),
            Err(err) => {
                warn!(error = %err, "Failed to read sound preference");
                true
            }
        }
    }

    /// Stored preferences, defaulted per key when missing or unreadable.
    pub fn preferences(&self) -> Preferences {
        let defaults = Preferences::default();
        let read = |key: PreferenceKey, default: bool| match read_preference(&self.kv, key) {
            Ok(value) => value.unwrap_or(default),
            Err(err) => {
                warn!(error = %err, key = key.as_str(), "Failed to read preference");
                default
            }
        };
        Preferences {
            image_hidden: read(PreferenceKey::ImageHidden, defaults.image_hidden),
            sound_enabled: read(PreferenceKey::SoundEnabled, defaults.sound_enabled),
        }
    }

    pub fn set_preference(&mut self, key: PreferenceKey, value: bool) -> Result<()> {
        let mut items = StorageItems::new();
        items.insert(key.as_str().to_string(), Value::Bool(value));
        self.kv.set(items)
    }

    pub fn subscribe(&mut self) -> Receiver<Vec<StorageChange>> {
        self.kv.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn in_progress(tab_id: i64) -> TrackedSession {
        TrackedSession {
            tracked_tab_id: Some(tab_id),
            status: SessionStatus::InProgress,
            tracked_url: "https://chatgpt.com/c/1".to_string(),
            tab_title: None,
        }
    }

    #[test]
    fn session_write_preserves_preferences() {
        let mut kv = MemoryKvStore::new();
        kv.set(
            json!({"soundEnabled": false, "imageHidden": true})
                .as_object()
                .cloned()
                .unwrap(),
        )
        .unwrap();
        let mut store = StatusStore::load(kv);

        store.write(in_progress(7)).unwrap();
        store.reset().unwrap();

        let items = store.kv().items();
        assert_eq!(items.get("soundEnabled"), Some(&json!(false)));
        assert_eq!(items.get("imageHidden"), Some(&json!(true)));
        assert_eq!(items.get("trackedTabId"), Some(&Value::Null));
        assert_eq!(items.get("status"), Some(&json!("idle")));
        assert_eq!(items.get("trackedUrl"), Some(&json!("")));
        assert!(!store.sound_enabled());
        assert_eq!(
            store.preferences(),
            Preferences {
                image_hidden: true,
                sound_enabled: false,
            }
        );
    }

    #[test]
    fn missing_or_mistyped_preferences_use_defaults() {
        let kv = MemoryKvStore::with_items(
            json!({"soundEnabled": "loud"}).as_object().cloned().unwrap(),
        );
        let store = StatusStore::load(kv);
        assert_eq!(store.preferences(), Preferences::default());
    }

    #[test]
    fn clearing_title_removes_key() {
        let mut store = StatusStore::load(MemoryKvStore::new());
        let mut session = in_progress(7);
        session.tab_title = Some("Trip ideas - ChatGPT".to_string());
        store.write(session.clone()).unwrap();
        assert!(store.kv().items().contains_key("tabTitle"));

        session.tab_title = None;
        store.write(session).unwrap();
        assert!(!store.kv().items().contains_key("tabTitle"));
    }

    #[test]
    fn change_feed_reports_only_changed_keys() {
        let mut store = StatusStore::load(MemoryKvStore::new());
        let feed = store.subscribe();
        store.write(in_progress(7)).unwrap();
        let first = feed.try_recv().unwrap();
        assert_eq!(first.len(), 3);

        store.write(in_progress(7)).unwrap();
        assert!(feed.try_recv().is_err());

        let mut done = in_progress(7);
        done.status = SessionStatus::Done;
        store.write(done).unwrap();
        let changes = feed.try_recv().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].key, "status");
        assert_eq!(changes[0].old_value, Some(json!("in-progress")));
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let mut feed = ChangeFeed::default();
        let kept = feed.subscribe();
        drop(feed.subscribe());
        feed.publish(vec![StorageChange {
            key: "status".to_string(),
            old_value: None,
            new_value: Some(json!("done")),
        }]);
        assert_eq!(feed.subscriber_count(), 1);
        assert!(kept.try_recv().is_ok());
    }

    #[test]
    fn read_session_tolerates_bad_values() {
        let kv = MemoryKvStore::with_items(
            json!({"trackedTabId": "seven", "status": "working", "trackedUrl": 3})
                .as_object()
                .cloned()
                .unwrap(),
        );
        assert_eq!(read_session(&kv).unwrap(), TrackedSession::default());
    }

    #[test]
    fn file_store_survives_restart() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("storage.json");

        {
            let mut store = StatusStore::load(FileKvStore::open(&path).unwrap());
            store.set_preference(PreferenceKey::ImageHidden, true).unwrap();
            store.write(in_progress(11)).unwrap();
        }

        let reopened = StatusStore::load(FileKvStore::open(&path).unwrap());
        assert_eq!(reopened.session(), &in_progress(11));
        assert_eq!(
            read_preference(reopened.kv(), PreferenceKey::ImageHidden).unwrap(),
            Some(true)
        );
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("storage.json");
        fs_err::write(&path, "{not json").unwrap();

        let store = StatusStore::load(FileKvStore::open(&path).unwrap());
        assert_eq!(store.session(), &TrackedSession::default());
    }

    #[test]
    fn empty_file_starts_empty() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("storage.json");
        fs_err::write(&path, "   ").unwrap();

        let kv = FileKvStore::open(&path).unwrap();
        assert!(kv.get(&SESSION_KEYS).unwrap().is_empty());
    }
}
