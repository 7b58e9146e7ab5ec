//! # chat-notifier-core
//!
//! Detects when an AI chat tab finishes generating a response and keeps one
//! canonical status for the tab being watched.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime dependency. Hosts drive everything through
//!   `handle(event)` calls and their own timers.
//! - **Seams, not platforms**: the DOM, the browser, notifications and timers sit
//!   behind traits (`Document`, `PageHost`, `Browser`, `Notifier`, `Scheduler`).
//! - **Graceful degradation**: evidence ambiguity, stale tabs and failed
//!   notifications are logged and absorbed; nothing here is fatal.
//! - **Single writer**: only the [`Reconciler`] mutates the status store.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use chat_notifier_core::{BackgroundEvent, FileKvStore, Reconciler, StatusStore};
//!
//! let store = StatusStore::load(FileKvStore::open(&storage_path()?)?);
//! let mut reconciler = Reconciler::new(store, browser, notifier, scheduler, config.notifications);
//! reconciler.handle(BackgroundEvent::GenerationStarted { tab_id: 7, url });
//! let status = reconciler.status();
//! ```

pub mod config;
pub mod error;
pub mod monitor;
pub mod probe;
pub mod query;
pub mod reconciler;
pub mod reducer;
pub mod store;
pub mod types;

pub use config::*;
pub use error::{NotifierError, Result};
pub use monitor::{CompletionMonitor, GenerationCycle, KeyInput, PageEvent, PageHost};
pub use probe::{Document, Element, Evidence, EvidenceProbe, SelectorProbe, ServiceProfile};
pub use query::{display_title, get_status, is_session_change, status_label, StatusWatcher};
pub use reconciler::{Browser, Notification, Notifier, Reconciler, Scheduler, TabInfo};
pub use reducer::{reduce, BackgroundEvent, Effect, ReduceContext, Reduction, SessionUpdate};
pub use store::{
    FileKvStore, KeyValueStore, MemoryKvStore, StatusStore, StorageChange, StorageItems,
};
pub use types::*;
