//! Local completion monitor (runs in the chat page).
//!
//! Drives one [`GenerationCycle`] per user submission:
//!
//! ```text
//! NotStarted ──submit/Enter──▶ Polling ──probe: Complete──▶ Fired
//!     ▲                          │                            │
//!     └──────── url change ──────┘◀──────── next submit ──────┘
//! ```
//!
//! Poll ticks and DOM-mutation callbacks both enter through
//! [`CompletionMonitor::handle`]; every transition checks the current cycle
//! first, so the two paths can never emit `generation-finished` twice.

use std::time::Duration;

use chat_notifier_protocol::ExtensionMessage;
use tracing::{debug, warn};

use crate::config::MonitorConfig;
use crate::error::Result;
use crate::probe::{Document, Evidence, EvidenceProbe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Page-side capabilities the monitor needs: messaging, timers, listeners, audio.
pub trait PageHost {
    fn send(&mut self, message: ExtensionMessage) -> Result<()>;
    fn start_interval(&mut self, period: Duration) -> TimerId;
    fn start_timeout(&mut self, delay: Duration) -> TimerId;
    fn cancel_timer(&mut self, id: TimerId);
    fn attach_click_listener(&mut self, node_id: u64) -> Result<ListenerId>;
    fn detach_listener(&mut self, id: ListenerId);
    fn play_sound(&mut self) -> Result<()>;
    fn play_fallback_tone(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputTarget {
    TextArea,
    TextInput,
    ContentEditable,
    Other,
}

impl InputTarget {
    pub fn is_text_like(&self) -> bool {
        !matches!(self, InputTarget::Other)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInput {
    pub key: String,
    pub shift: bool,
    pub target: InputTarget,
}

impl KeyInput {
    pub fn is_submit(&self) -> bool {
        self.key == "Enter" && !self.shift && self.target.is_text_like()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageEvent {
    /// Script injected into the page.
    Init,
    SubmitClicked { node_id: u64 },
    KeyDown(KeyInput),
    DomMutated,
    VisibilityChanged { visible: bool },
    UrlChanged { url: String },
    Timer(TimerId),
    Message(ExtensionMessage),
    Teardown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationCycle {
    NotStarted,
    /// `armed` is false until the cycle has seen `Generating` or sat through
    /// one poll tick; until then `Complete` may be the previous turn's page.
    Polling { timer: TimerId, armed: bool },
    Fired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SubmitBinding {
    node_id: u64,
    listener: ListenerId,
}

pub struct CompletionMonitor<P> {
    probe: P,
    cycle: GenerationCycle,
    url: String,
    binding: Option<SubmitBinding>,
    grace_timer: Option<TimerId>,
    poll_interval: Duration,
    startup_grace: Duration,
}

impl<P: EvidenceProbe> CompletionMonitor<P> {
    pub fn new(probe: P, url: impl Into<String>, config: &MonitorConfig) -> Self {
        CompletionMonitor {
            probe,
            cycle: GenerationCycle::NotStarted,
            url: url.into(),
            binding: None,
            grace_timer: None,
            poll_interval: config.poll_interval(),
            startup_grace: config.startup_grace(),
        }
    }

    pub fn cycle(&self) -> GenerationCycle {
        self.cycle
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Node the submit listener is attached to, if any.
    pub fn bound_submit(&self) -> Option<u64> {
        self.binding.map(|binding| binding.node_id)
    }

    pub fn handle(&mut self, event: PageEvent, doc: &dyn Document, host: &mut dyn PageHost) {
        match event {
            PageEvent::Init => {
                if let Some(timer) = self.grace_timer.take() {
                    host.cancel_timer(timer);
                }
                self.grace_timer = Some(host.start_timeout(self.startup_grace));
                self.rearm(doc, host);
            }
            PageEvent::SubmitClicked { node_id } => {
                if self.bound_submit() == Some(node_id) {
                    self.begin_cycle(host, "submit click", false);
                } else {
                    debug!(node_id, "Ignoring click from stale submit listener");
                }
            }
            PageEvent::KeyDown(input) => {
                if input.is_submit() {
                    self.begin_cycle(host, "enter key", false);
                }
            }
            PageEvent::DomMutated => {
                self.rearm(doc, host);
                self.check_completion(doc, host, false);
            }
            PageEvent::VisibilityChanged { visible } => {
                if visible {
                    self.rearm(doc, host);
                }
            }
            PageEvent::UrlChanged { url } => {
                if url == self.url {
                    return;
                }
                self.abort(host);
                debug!(from = %self.url, to = %url, "Page navigated");
                self.url = url;
                self.rearm(doc, host);
            }
            PageEvent::Timer(id) => {
                if self.grace_timer == Some(id) {
                    self.grace_timer = None;
                    self.rearm(doc, host);
                } else if matches!(self.cycle, GenerationCycle::Polling { timer, .. } if timer == id) {
                    self.check_completion(doc, host, true);
                } else {
                    debug!(timer = id.0, "Ignoring stale timer");
                }
            }
            PageEvent::Message(ExtensionMessage::PlayNotificationSound) => {
                play_completion_sound(host);
            }
            PageEvent::Message(other) => {
                debug!(message = other.name(), "Ignoring message not meant for the page");
            }
            PageEvent::Teardown => self.teardown(host),
        }
    }

    /// Rebinds the submit control and recovers a response that is already streaming.
    fn rearm(&mut self, doc: &dyn Document, host: &mut dyn PageHost) {
        self.bind_submit(doc, host);
        if !matches!(self.cycle, GenerationCycle::Polling { .. }) && self.probe.in_progress(doc) {
            self.begin_cycle(host, "already streaming", true);
        }
    }

    fn bind_submit(&mut self, doc: &dyn Document, host: &mut dyn PageHost) {
        let found = self.probe.find_submit(doc).map(|element| element.node_id);
        if found.is_some() && found == self.bound_submit() {
            return;
        }

        if let Some(previous) = self.binding.take() {
            host.detach_listener(previous.listener);
        }

        let Some(node_id) = found else {
            return;
        };
        match host.attach_click_listener(node_id) {
            Ok(listener) => {
                debug!(node_id, "Bound submit control");
                self.binding = Some(SubmitBinding { node_id, listener });
            }
            Err(err) => warn!(error = %err, node_id, "Failed to bind submit control"),
        }
    }

    fn begin_cycle(&mut self, host: &mut dyn PageHost, reason: &str, streaming: bool) {
        if matches!(self.cycle, GenerationCycle::Polling { .. }) {
            debug!(reason, "Generation already being tracked");
            return;
        }

        debug!(reason, url = %self.url, "Generation started");
        if let Err(err) = host.send(ExtensionMessage::GenerationStarted {
            url: self.url.clone(),
        }) {
            warn!(error = %err, "Failed to report generation start");
        }
        let timer = host.start_interval(self.poll_interval);
        self.cycle = GenerationCycle::Polling {
            timer,
            armed: streaming,
        };
    }

    fn check_completion(&mut self, doc: &dyn Document, host: &mut dyn PageHost, from_tick: bool) {
        let GenerationCycle::Polling { timer, armed } = self.cycle else {
            return;
        };
        let evidence = self.probe.classify(doc);
        if evidence != Evidence::Complete || !armed {
            if evidence == Evidence::Complete {
                debug!(url = %self.url, "Ignoring completion evidence from before the response started");
            }
            if !armed && (from_tick || evidence == Evidence::Generating) {
                self.cycle = GenerationCycle::Polling { timer, armed: true };
            }
            return;
        }

        host.cancel_timer(timer);
        self.cycle = GenerationCycle::Fired;
        debug!(url = %self.url, "Generation finished");
        if let Err(err) = host.send(ExtensionMessage::GenerationFinished {
            url: self.url.clone(),
        }) {
            warn!(error = %err, "Failed to report generation finish");
        }
    }

    fn abort(&mut self, host: &mut dyn PageHost) {
        if let GenerationCycle::Polling { timer, .. } = self.cycle {
            host.cancel_timer(timer);
            debug!(url = %self.url, "Abandoning generation after navigation");
        }
        self.cycle = GenerationCycle::NotStarted;
    }

    fn teardown(&mut self, host: &mut dyn PageHost) {
        self.abort(host);
        if let Some(timer) = self.grace_timer.take() {
            host.cancel_timer(timer);
        }
        if let Some(binding) = self.binding.take() {
            host.detach_listener(binding.listener);
        }
    }
}

fn play_completion_sound(host: &mut dyn PageHost) {
    if let Err(err) = host.play_sound() {
        debug!(error = %err, "Notification sound failed; using fallback tone");
        if let Err(err) = host.play_fallback_tone() {
            warn!(error = %err, "Fallback tone failed");
        }
    }
}
