//! chat-notifier daemon entrypoint.
//!
//! A small, single-writer service that plays the background role: it owns the
//! tracked session, accepts page messages and tab events from the extension
//! bridge over a Unix socket, and queues browser commands for the bridge to
//! execute.

use fs_err as fs;
use std::env;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use chat_notifier_core::{
    config, is_session_change, BackgroundEvent, FileKvStore, NotifierConfig, StatusStore, TabInfo,
};
use chat_notifier_protocol::{
    parse_message, parse_notification_click, parse_preference, parse_tab_event, ErrorInfo,
    ExtensionMessage, Method, Request, Response, ERROR_TOO_MANY_CONNECTIONS,
    MAX_ACTIVE_CONNECTIONS, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use serde_json::Value;

mod bridge;
mod event_loop;

use bridge::{BridgeBrowser, BridgeNotifier, CommandOutbox};
use event_loop::EventLoopHandle;

const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;

struct DaemonState {
    events: EventLoopHandle,
    outbox: CommandOutbox,
    repoll_interval: Duration,
    connections: ConnectionLimiter,
}

#[derive(Default)]
struct ConnectionLimiter {
    active: AtomicUsize,
    rejected: AtomicU64,
}

impl ConnectionLimiter {
    fn try_acquire(&self) -> bool {
        let previous = self.active.fetch_add(1, Ordering::SeqCst);
        if previous >= MAX_ACTIVE_CONNECTIONS {
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    fn release(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

fn main() {
    init_logging();

    let notifier_config = match config::load_config(None) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config; using defaults");
            NotifierConfig::default()
        }
    };

    let socket_path = match config::socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon socket path");
            std::process::exit(1);
        }
    };

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let storage_path = match config::storage_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve storage path");
            std::process::exit(1);
        }
    };

    let kv = match FileKvStore::open(&storage_path) {
        Ok(kv) => kv,
        Err(err) => {
            error!(error = %err, path = %storage_path.display(), "Failed to open storage");
            std::process::exit(1);
        }
    };
    let store = StatusStore::load(kv);
    info!(
        tab_id = ?store.session().tracked_tab_id,
        status = store.session().status.as_str(),
        url = %store.session().tracked_url,
        "Restored tracked session"
    );

    let outbox = CommandOutbox::new();
    let mut browser = BridgeBrowser::new(outbox.clone());
    if let Some(tab_id) = store.session().tracked_tab_id {
        browser.remember(TabInfo {
            tab_id,
            window_id: None,
            url: Some(store.session().tracked_url.clone()),
            title: store.session().tab_title.clone(),
        });
    }
    let events = event_loop::spawn(
        store,
        browser,
        BridgeNotifier::new(outbox.clone()),
        notifier_config.notifications.clone(),
        notifier_config.query.reply_timeout(),
    );

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    info!(path = %socket_path.display(), "chat-notifier daemon started");

    let shared_state = Arc::new(DaemonState {
        events,
        outbox,
        repoll_interval: notifier_config.query.repoll_interval(),
        connections: ConnectionLimiter::default(),
    });

    for stream in listener.incoming() {
        match stream {
            Ok(mut stream) => {
                if !shared_state.connections.try_acquire() {
                    warn!("Connection limit reached; rejecting client");
                    let response = Response::error(
                        None,
                        ERROR_TOO_MANY_CONNECTIONS,
                        "too many active connections",
                    );
                    let _ = write_response(&mut stream, &response);
                    continue;
                }
                let state = Arc::clone(&shared_state);
                thread::spawn(move || {
                    handle_connection(stream, &state);
                    state.connections.release();
                });
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

fn init_logging() {
    let debug_enabled = env::var("CHAT_NOTIFIER_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, state: &DaemonState) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, &response);
            return;
        }
    };

    debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    if request.protocol_version == PROTOCOL_VERSION && request.method == Method::WatchStatus {
        watch_status(stream, request.id, state);
        return;
    }
    let response = handle_request(request, state);
    let _ = write_response(&mut stream, &response);
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    if buffer.is_empty() {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let request_bytes = match newline_index {
        Some(index) => {
            if buffer.len() > index + 1 {
                let trailing = &buffer[index + 1..];
                if trailing.iter().any(|b| !b.is_ascii_whitespace()) {
                    warn!("Extra bytes detected after newline; ignoring trailing data");
                }
            }
            &buffer[..index]
        }
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, state: &DaemonState) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    match request.method {
        Method::GetHealth => Response::ok(
            request.id,
            serde_json::json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
                "queued_commands": state.outbox.len(),
                "security": {
                    "active_connections": state.connections.active.load(Ordering::SeqCst),
                    "rejected_connections": state.connections.rejected.load(Ordering::SeqCst),
                },
            }),
        ),
        Method::Message => handle_message(request, state),
        Method::TabEvent => {
            let params = match require_params(&request, "tab event payload is required") {
                Ok(params) => params,
                Err(response) => return response,
            };
            let event = match parse_tab_event(params) {
                Ok(event) => event,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            info!(tab_id = event.tab_id(), event = ?event, "Received tab event");
            accept(request.id, state.events.post(BackgroundEvent::from(event)))
        }
        Method::NotificationClicked => {
            let params = match require_params(&request, "notification_id is required") {
                Ok(params) => params,
                Err(response) => return response,
            };
            let click = match parse_notification_click(params) {
                Ok(click) => click,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            info!(notification_id = %click.notification_id, "Notification clicked");
            accept(
                request.id,
                state.events.post(BackgroundEvent::NotificationClicked {
                    notification_id: click.notification_id,
                }),
            )
        }
        Method::GetStatus => status_response(request.id, state),
        // Streaming; dispatched from `handle_connection` before we get here.
        Method::WatchStatus => Response::error(
            request.id,
            "invalid_method",
            "watch_status must be the only request on its connection",
        ),
        Method::DrainCommands => {
            let commands = state.outbox.drain();
            debug!(commands = commands.len(), "Drained browser commands");
            match serde_json::to_value(&commands) {
                Ok(value) => Response::ok(request.id, value),
                Err(err) => Response::error(
                    request.id,
                    "serialization_error",
                    format!("Failed to serialize commands: {}", err),
                ),
            }
        }
        Method::GetPreferences => match state.events.preferences() {
            Ok(preferences) => match serde_json::to_value(preferences) {
                Ok(value) => Response::ok(request.id, value),
                Err(err) => Response::error(
                    request.id,
                    "serialization_error",
                    format!("Failed to serialize preferences: {}", err),
                ),
            },
            Err(err) => Response::error(request.id, "unavailable", err),
        },
        Method::FocusTracked => {
            info!("Focus requested for tracked tab");
            accept(request.id, state.events.post(BackgroundEvent::FocusTracked))
        }
        Method::SetPreference => {
            let params = match require_params(&request, "key and value are required") {
                Ok(params) => params,
                Err(response) => return response,
            };
            let preference = match parse_preference(params) {
                Ok(preference) => preference,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            match state
                .events
                .set_preference(preference.key, preference.value)
            {
                Ok(()) => Response::ok(
                    request.id,
                    serde_json::json!({
                        "key": preference.key.as_str(),
                        "value": preference.value,
                    }),
                ),
                Err(err) => Response::error(request.id, "preference_error", err),
            }
        }
    }
}

fn handle_message(request: Request, state: &DaemonState) -> Response {
    let params = match require_params(&request, "message payload is required") {
        Ok(params) => params,
        Err(response) => return response,
    };
    let parsed = match parse_message(params) {
        Ok(parsed) => parsed,
        Err(err) => return Response::error_with_info(request.id, err),
    };

    if parsed.message == ExtensionMessage::GetStatus {
        return status_response(request.id, state);
    }

    let event = parsed
        .tab_id
        .and_then(|tab_id| BackgroundEvent::from_page_message(tab_id, &parsed.message));
    let Some(event) = event else {
        return Response::error(
            request.id,
            "unsupported_message",
            format!("{} is not handled by the daemon", parsed.message.name()),
        );
    };

    info!(
        message = parsed.message.name(),
        tab_id = ?parsed.tab_id,
        "Received page message"
    );
    accept(request.id, state.events.post(event))
}

fn require_params(request: &Request, missing: &str) -> Result<Value, Response> {
    request
        .params
        .clone()
        .ok_or_else(|| Response::error(request.id.clone(), "invalid_params", missing))
}

fn accept(id: Option<String>, posted: Result<(), String>) -> Response {
    match posted {
        Ok(()) => Response::ok(id, serde_json::json!({"accepted": true})),
        Err(err) => Response::error(id, "unavailable", err),
    }
}

fn status_response(id: Option<String>, state: &DaemonState) -> Response {
    match serde_json::to_value(state.events.status()) {
        Ok(value) => Response::ok(id, value),
        Err(err) => Response::error(
            id,
            "serialization_error",
            format!("Failed to serialize status: {}", err),
        ),
    }
}

/// Streams one status line now and one per session change after, until the
/// client goes away. The repoll interval doubles as the disconnect check.
fn watch_status(mut stream: UnixStream, id: Option<String>, state: &DaemonState) {
    let changes = match state.events.subscribe() {
        Ok(changes) => changes,
        Err(err) => {
            let _ = write_response(&mut stream, &Response::error(id, "unavailable", err));
            return;
        }
    };
    if write_response(&mut stream, &status_response(id.clone(), state)).is_err() {
        return;
    }
    debug!("Status watcher attached");

    loop {
        match changes.recv_timeout(state.repoll_interval) {
            Ok(batch) => {
                if !is_session_change(&batch) {
                    continue;
                }
                if write_response(&mut stream, &status_response(id.clone(), state)).is_err() {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if peer_closed(&stream) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("Status watcher detached");
}

fn peer_closed(stream: &UnixStream) -> bool {
    if stream.set_nonblocking(true).is_err() {
        return true;
    }
    let mut probe = [0u8; 64];
    let mut reader = stream;
    let closed = match reader.read(&mut probe) {
        Ok(0) => true,
        Ok(_) => false,
        Err(err) if err.kind() == ErrorKind::WouldBlock => false,
        Err(_) => true,
    };
    let _ = stream.set_nonblocking(false);
    closed
}

fn write_response(stream: &mut UnixStream, response: &Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
