//! Client helper for talking to the chat-notifier daemon.
//!
//! The daemon owns the status record. Every call here is a single
//! request/response exchange, except [`open_watch`] which keeps the stream.

use chat_notifier_core::config;
use chat_notifier_protocol::{
    BrowserCommand, ExtensionMessage, Method, PreferenceKey, Preferences, Request, Response,
    StatusData, TabEvent, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use chrono::Utc;
use rand::RngCore;
use serde_json::{json, Value};
use std::io::{BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

const READ_TIMEOUT_MS: u64 = 600;
const WRITE_TIMEOUT_MS: u64 = 600;
const RETRY_DELAY_MS: u64 = 50;

/// How an attempt failed. Only attempts that never reached the daemon are
/// safe to resend for calls that change state.
enum AttemptError {
    Unreachable(String),
    Exchange(String),
}

impl AttemptError {
    fn into_message(self) -> String {
        match self {
            AttemptError::Unreachable(message) | AttemptError::Exchange(message) => message,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Retry {
    /// Reads: resend after any failure.
    Always,
    /// Writes: resend only when the first attempt could not connect.
    Unreachable,
}

pub fn daemon_health() -> Result<Value, String> {
    call(Method::GetHealth, None, Retry::Always, "health check")
}

pub fn get_status() -> Result<StatusData, String> {
    let data = call(Method::GetStatus, None, Retry::Always, "status query")?;
    serde_json::from_value(data).map_err(|err| format!("Failed to parse status: {}", err))
}

pub fn send_page_message(tab_id: i64, message: ExtensionMessage) -> Result<(), String> {
    let label = message.name();
    call(
        Method::Message,
        Some(json!({ "tab_id": tab_id, "message": message })),
        Retry::Unreachable,
        label,
    )
    .map(|_| ())
}

pub fn send_tab_event(event: &TabEvent) -> Result<(), String> {
    let params = serde_json::to_value(event)
        .map_err(|err| format!("Failed to serialize tab event: {}", err))?;
    call(Method::TabEvent, Some(params), Retry::Unreachable, "tab event").map(|_| ())
}

pub fn notification_clicked(notification_id: &str) -> Result<(), String> {
    call(
        Method::NotificationClicked,
        Some(json!({ "notification_id": notification_id })),
        Retry::Unreachable,
        "notification click",
    )
    .map(|_| ())
}

pub fn focus_tracked() -> Result<(), String> {
    call(Method::FocusTracked, None, Retry::Unreachable, "focus request").map(|_| ())
}

pub fn drain_commands() -> Result<Vec<BrowserCommand>, String> {
    let data = call(Method::DrainCommands, None, Retry::Unreachable, "command drain")?;
    serde_json::from_value(data).map_err(|err| format!("Failed to parse commands: {}", err))
}

pub fn set_preference(key: PreferenceKey, value: bool) -> Result<(), String> {
    call(
        Method::SetPreference,
        Some(json!({ "key": key, "value": value })),
        Retry::Always,
        "preference update",
    )
    .map(|_| ())
}

pub fn get_preferences() -> Result<Preferences, String> {
    let data = call(Method::GetPreferences, None, Retry::Always, "preferences query")?;
    serde_json::from_value(data).map_err(|err| format!("Failed to parse preferences: {}", err))
}

/// Opens a `watch_status` stream. Each line is one status snapshot; the
/// stream ends when the daemon goes away.
pub fn open_watch() -> Result<BufReader<UnixStream>, String> {
    let request = build_request(Method::WatchStatus, None, make_request_id());
    let mut stream = connect().map_err(AttemptError::into_message)?;
    write_request(&mut stream, &request).map_err(AttemptError::into_message)?;
    let _ = stream.set_read_timeout(None);
    Ok(BufReader::new(stream))
}

fn call(method: Method, params: Option<Value>, retry: Retry, label: &str) -> Result<Value, String> {
    let request_id = make_request_id();
    let attempt = || send_request(build_request(method, params.clone(), request_id.clone()));

    let first = match attempt() {
        Ok(response) => return into_data(response),
        Err(err) => err,
    };
    if retry == Retry::Unreachable && matches!(first, AttemptError::Exchange(_)) {
        let message = first.into_message();
        tracing::warn!(error = %message, "Failed to send {} to daemon", label);
        return Err(message);
    }

    tracing::warn!(error = %first.into_message(), "Failed to send {} to daemon", label);
    std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
    match attempt() {
        Ok(response) => into_data(response),
        Err(err) => {
            let message = err.into_message();
            tracing::warn!(error = %message, "Retry failed sending {} to daemon", label);
            Err(message)
        }
    }
}

fn into_data(response: Response) -> Result<Value, String> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(response
            .error
            .map(|err| format!("{}: {}", err.code, err.message))
            .unwrap_or_else(|| "Unknown daemon error".to_string()))
    }
}

fn build_request(method: Method, params: Option<Value>, id: String) -> Request {
    Request {
        protocol_version: PROTOCOL_VERSION,
        method,
        id: Some(id),
        params,
    }
}

fn connect() -> Result<UnixStream, AttemptError> {
    let socket = config::socket_path().map_err(|err| AttemptError::Unreachable(err.to_string()))?;
    let stream = UnixStream::connect(&socket).map_err(|err| {
        AttemptError::Unreachable(format!("Failed to connect to daemon socket: {}", err))
    })?;
    let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));
    Ok(stream)
}

fn write_request(stream: &mut UnixStream, request: &Request) -> Result<(), AttemptError> {
    serde_json::to_writer(&mut *stream, request)
        .map_err(|err| AttemptError::Exchange(format!("Failed to write request: {}", err)))?;
    stream
        .write_all(b"\n")
        .map_err(|err| AttemptError::Exchange(format!("Failed to flush request: {}", err)))?;
    stream.flush().ok();
    Ok(())
}

fn send_request(request: Request) -> Result<Response, AttemptError> {
    let mut stream = connect()?;
    write_request(&mut stream, &request)?;
    read_response(&mut stream).map_err(AttemptError::Exchange)
}

fn read_response(stream: &mut UnixStream) -> Result<Response, String> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err("Response exceeded maximum size".to_string());
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err("Timed out waiting for daemon response".to_string());
            }
            Err(err) => return Err(format!("Failed to read response: {}", err)),
        }
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let response_bytes = match newline_index {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if response_bytes.is_empty() {
        return Err("Daemon response was empty".to_string());
    }

    serde_json::from_slice(response_bytes)
        .map_err(|err| format!("Failed to parse response JSON: {}", err))
}

fn make_request_id() -> String {
    let mut random = rand::thread_rng();
    format!("ctl-{}-{:x}", Utc::now().timestamp_millis(), random.next_u64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_notifier_core::config::SOCKET_ENV;
    use chat_notifier_protocol::SessionStatus;
    use std::os::unix::net::UnixListener;
    use std::path::PathBuf;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, OnceLock,
    };
    use std::thread::JoinHandle;
    use std::time::Instant;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    struct EnvGuard {
        key: &'static str,
        prior: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prior = std::env::var(key).ok();
            std::env::set_var(key, value);
            Self { key, prior }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(value) = &self.prior {
                std::env::set_var(self.key, value);
            } else {
                std::env::remove_var(self.key);
            }
        }
    }

    fn env_lock() -> std::sync::MutexGuard<'static, ()> {
        ENV_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_request(stream: &mut UnixStream) -> Option<Request> {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    buffer.extend_from_slice(&chunk[..n]);
                    if buffer.contains(&b'\n') {
                        break;
                    }
                }
                Err(_) => return None,
            }
        }

        let newline_index = buffer.iter().position(|b| *b == b'\n');
        let request_bytes = match newline_index {
            Some(index) => &buffer[..index],
            None => buffer.as_slice(),
        };
        serde_json::from_slice(request_bytes).ok()
    }

    /// Fake daemon that hands each accepted connection to `respond` and stops
    /// after `limit` connections or `window`.
    fn fake_daemon<F>(
        limit: usize,
        window: Duration,
        mut respond: F,
    ) -> (tempfile::TempDir, PathBuf, JoinHandle<()>)
    where
        F: FnMut(usize, Option<Request>) -> Option<Response> + Send + 'static,
    {
        let socket_dir = tempfile::Builder::new()
            .prefix("nc-")
            .tempdir_in("/tmp")
            .unwrap();
        let socket_path = socket_dir.path().join("daemon.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();
        listener.set_nonblocking(true).unwrap();

        let server = std::thread::spawn(move || {
            let start = Instant::now();
            let mut handled = 0;
            while handled < limit && start.elapsed() < window {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        handled += 1;
                        stream.set_nonblocking(false).unwrap();
                        let request = read_request(&mut stream);
                        if let Some(response) = respond(handled, request) {
                            let mut payload = serde_json::to_vec(&response).unwrap();
                            payload.push(b'\n');
                            let _ = stream.write_all(&payload);
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    Err(_) => break,
                }
            }
        });

        (socket_dir, socket_path, server)
    }

    #[test]
    fn status_query_retries_after_daemon_error() {
        let _guard = env_lock();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);

        let (_dir, socket_path, server) =
            fake_daemon(2, Duration::from_secs(5), move |handled, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Some(if handled == 1 {
                    Response::error(None, "test_error", "simulated")
                } else {
                    Response::ok(
                        None,
                        json!({"trackedTabId": 7, "status": "done", "trackedUrl": "https://chatgpt.com/c/1"}),
                    )
                })
            });
        let _socket_guard = EnvGuard::set(SOCKET_ENV, socket_path.to_str().unwrap());

        let status = get_status().unwrap();
        server.join().unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(status.tracked_tab_id, Some(7));
        assert_eq!(status.status, SessionStatus::Done);
    }

    #[test]
    fn retry_reuses_same_request_id_after_lost_response() {
        let _guard = env_lock();
        let ids: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&ids);

        let (_dir, socket_path, server) =
            fake_daemon(2, Duration::from_secs(5), move |handled, request| {
                seen.lock()
                    .unwrap()
                    .push(request.and_then(|request| request.id));
                (handled == 2).then(|| Response::ok(None, json!({"status": "ok"})))
            });
        let _socket_guard = EnvGuard::set(SOCKET_ENV, socket_path.to_str().unwrap());

        let health = daemon_health().unwrap();
        server.join().unwrap();

        assert_eq!(health["status"], json!("ok"));
        let ids = ids.lock().unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids[0].as_deref().is_some_and(|id| id.starts_with("ctl-")));
        assert_eq!(ids[0], ids[1], "retry must reuse the same request id");
    }

    #[test]
    fn page_message_is_not_resent_after_lost_response() {
        let _guard = env_lock();
        let requests: Arc<Mutex<Vec<Request>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);

        let (_dir, socket_path, server) =
            fake_daemon(2, Duration::from_millis(1500), move |_, request| {
                seen.lock().unwrap().extend(request);
                None
            });
        let _socket_guard = EnvGuard::set(SOCKET_ENV, socket_path.to_str().unwrap());

        let result = send_page_message(
            7,
            ExtensionMessage::GenerationFinished {
                url: "https://chatgpt.com/c/1".to_string(),
            },
        );
        server.join().unwrap();

        assert!(result.is_err());
        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, Method::Message);
        assert_eq!(
            requests[0].params.as_ref().map(|params| params["message"]["type"].clone()),
            Some(json!("generation-finished"))
        );
    }

    #[test]
    fn unreachable_daemon_reports_connect_error() {
        let _guard = env_lock();
        let dir = tempfile::Builder::new()
            .prefix("nc-")
            .tempdir_in("/tmp")
            .unwrap();
        let missing = dir.path().join("daemon.sock");
        let _socket_guard = EnvGuard::set(SOCKET_ENV, missing.to_str().unwrap());

        let err = notification_clicked("chat-complete-1-2").unwrap_err();
        assert!(err.contains("Failed to connect"), "unexpected error: {}", err);
    }

    #[test]
    fn preferences_query_decodes_flags() {
        let _guard = env_lock();
        let (_dir, socket_path, server) = fake_daemon(1, Duration::from_secs(5), |_, request| {
            assert_eq!(request.map(|request| request.method), Some(Method::GetPreferences));
            Some(Response::ok(
                None,
                json!({"imageHidden": true, "soundEnabled": false}),
            ))
        });
        let _socket_guard = EnvGuard::set(SOCKET_ENV, socket_path.to_str().unwrap());

        let preferences = get_preferences().unwrap();
        server.join().unwrap();

        assert_eq!(
            preferences,
            Preferences {
                image_hidden: true,
                sound_enabled: false,
            }
        );
    }

    #[test]
    fn focus_request_is_not_resent_after_lost_response() {
        let _guard = env_lock();
        let methods: Arc<Mutex<Vec<Method>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&methods);

        let (_dir, socket_path, server) =
            fake_daemon(2, Duration::from_millis(1500), move |_, request| {
                seen.lock()
                    .unwrap()
                    .extend(request.map(|request| request.method));
                None
            });
        let _socket_guard = EnvGuard::set(SOCKET_ENV, socket_path.to_str().unwrap());

        assert!(focus_tracked().is_err());
        server.join().unwrap();

        assert_eq!(*methods.lock().unwrap(), vec![Method::FocusTracked]);
    }

    #[test]
    fn drain_decodes_browser_commands() {
        let _guard = env_lock();
        let (_dir, socket_path, server) = fake_daemon(1, Duration::from_secs(5), |_, request| {
            assert_eq!(request.map(|request| request.method), Some(Method::DrainCommands));
            Some(Response::ok(
                None,
                json!([
                    {"command": "clear_notifications"},
                    {"command": "activate_tab", "tab_id": 7}
                ]),
            ))
        });
        let _socket_guard = EnvGuard::set(SOCKET_ENV, socket_path.to_str().unwrap());

        let commands = drain_commands().unwrap();
        server.join().unwrap();

        assert_eq!(
            commands,
            vec![
                BrowserCommand::ClearNotifications,
                BrowserCommand::ActivateTab { tab_id: 7 }
            ]
        );
    }
}
