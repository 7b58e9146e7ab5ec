//! `notifier-ctl watch`: live status display.
//!
//! The daemon's `watch_status` stream only wakes us up; every wake-up (and every
//! repoll tick) re-fetches with `get_status`, so a dropped stream degrades to
//! plain polling instead of a frozen display.

use std::io::BufRead;
use std::ops::ControlFlow;
use std::sync::mpsc;
use std::thread;

use chat_notifier_core::{
    display_title, status_label, Preferences, SessionStatus, StatusData, StatusWatcher,
};
use tracing::{debug, warn};

use crate::daemon_client;

pub struct WatchOptions {
    pub until_done: bool,
    pub json: bool,
}

pub fn run(options: WatchOptions) -> Result<(), String> {
    let config = chat_notifier_core::load_config(None).unwrap_or_else(|err| {
        warn!(error = %err, "Failed to load config; using defaults");
        Default::default()
    });

    let (wake, feed) = mpsc::channel::<()>();
    thread::spawn(move || match daemon_client::open_watch() {
        Ok(reader) => {
            for line in reader.lines() {
                if line.is_err() || wake.send(()).is_err() {
                    break;
                }
            }
            debug!("Status stream ended");
        }
        Err(err) => warn!(error = %err, "Status stream unavailable; polling only"),
    });

    let mut watcher = StatusWatcher::new(config.query.repoll_interval());
    watcher.drive(&feed, fetch_status, |status| {
        println!("{}", render(status, options.json));
        if options.until_done && status.status == SessionStatus::Done {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    });
    Ok(())
}

fn fetch_status() -> StatusData {
    daemon_client::get_status().unwrap_or_else(|err| {
        debug!(error = %err, "Status query failed; reporting idle");
        StatusData::default()
    })
}

/// One line per status: JSON for scripts, `Label: title` for people.
pub fn render(status: &StatusData, json: bool) -> String {
    if json {
        return serde_json::to_string(status).unwrap_or_else(|_| "{}".to_string());
    }
    match status.status {
        SessionStatus::Idle if status.tracked_tab_id.is_none() => status_label(status).to_string(),
        _ => format!("{}: {}", status_label(status), display_title(status)),
    }
}

/// Stored preference flags, in the same two formats as [`render`].
pub fn render_preferences(preferences: &Preferences, json: bool) -> String {
    if json {
        return serde_json::to_string(preferences).unwrap_or_else(|_| "{}".to_string());
    }
    format!(
        "Sound: {}, image: {}",
        if preferences.sound_enabled { "on" } else { "off" },
        if preferences.image_hidden { "hidden" } else { "shown" }
    )
}
