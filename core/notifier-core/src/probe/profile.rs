//! Site-specific DOM heuristics.
//!
//! A [`ServiceProfile`] lists the structural matchers for one chat service.
//! Matchers are plain data so a profile can be swapped or extended without
//! touching the monitor.

use super::Element;
use crate::types::ChatService;

/// One structural test against a single element. Hidden elements never match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    /// `data-testid` equals the value.
    TestId(String),
    /// Arbitrary attribute equals the value.
    Attr { name: String, value: String },
    /// `type` attribute equals the value (e.g. `submit`).
    InputType(String),
    /// `aria-label` contains the needle, case-insensitive.
    AriaLabel(String),
    /// Trimmed visible text equals the value, case-insensitive.
    Text(String),
    /// `class` attribute contains the token.
    ClassToken(String),
}

impl Matcher {
    pub fn test_id(value: &str) -> Self {
        Matcher::TestId(value.to_string())
    }

    pub fn attr(name: &str, value: &str) -> Self {
        Matcher::Attr {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    pub fn input_type(value: &str) -> Self {
        Matcher::InputType(value.to_string())
    }

    pub fn aria_label(needle: &str) -> Self {
        Matcher::AriaLabel(needle.to_lowercase())
    }

    pub fn text(value: &str) -> Self {
        Matcher::Text(value.to_string())
    }

    pub fn class_token(token: &str) -> Self {
        Matcher::ClassToken(token.to_string())
    }

    pub fn matches(&self, element: &Element) -> bool {
        if !element.visible {
            return false;
        }
        match self {
            Matcher::TestId(value) => element.attr("data-testid") == Some(value.as_str()),
            Matcher::Attr { name, value } => element.attr(name) == Some(value.as_str()),
            Matcher::InputType(value) => element
                .attr("type")
                .map(|kind| kind.eq_ignore_ascii_case(value))
                .unwrap_or(false),
            Matcher::AriaLabel(needle) => element
                .attr("aria-label")
                .map(|label| label.to_lowercase().contains(needle.as_str()))
                .unwrap_or(false),
            Matcher::Text(value) => element.text.trim().eq_ignore_ascii_case(value),
            Matcher::ClassToken(token) => element
                .attr("class")
                .map(|classes| classes.split_whitespace().any(|class| class == token))
                .unwrap_or(false),
        }
    }
}

/// DOM heuristics for one chat service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceProfile {
    /// Submit control matchers in priority order.
    pub submit: Vec<Matcher>,
    /// Retry / regenerate affordance shown after a response completes.
    pub retry: Vec<Matcher>,
    /// Stop-generating affordance shown while streaming.
    pub stop: Vec<Matcher>,
    /// Streaming or typing indicators.
    pub streaming: Vec<Matcher>,
}

impl ServiceProfile {
    pub fn chatgpt() -> Self {
        ServiceProfile {
            submit: vec![
                Matcher::test_id("send-button"),
                Matcher::input_type("submit"),
                Matcher::aria_label("send prompt"),
                Matcher::aria_label("send message"),
                Matcher::text("Send"),
                Matcher::text("Submit"),
            ],
            retry: vec![
                Matcher::test_id("regenerate-button"),
                Matcher::aria_label("regenerate"),
                Matcher::aria_label("try again"),
                Matcher::text("Regenerate"),
            ],
            stop: vec![
                Matcher::test_id("stop-button"),
                Matcher::aria_label("stop generating"),
                Matcher::aria_label("stop streaming"),
                Matcher::text("Stop generating"),
            ],
            streaming: vec![
                Matcher::class_token("result-streaming"),
                Matcher::class_token("typing-indicator"),
            ],
        }
    }

    pub fn claude() -> Self {
        ServiceProfile {
            submit: vec![
                Matcher::test_id("send-button"),
                Matcher::input_type("submit"),
                Matcher::aria_label("send message"),
                Matcher::text("Send"),
            ],
            retry: vec![
                Matcher::test_id("action-bar-retry"),
                Matcher::aria_label("retry"),
                Matcher::text("Retry"),
            ],
            stop: vec![
                Matcher::test_id("stop-button"),
                Matcher::aria_label("stop response"),
                Matcher::text("Stop"),
            ],
            streaming: vec![
                Matcher::attr("data-is-streaming", "true"),
                Matcher::class_token("typing-indicator"),
            ],
        }
    }

    /// Union of every known profile, used for pages we can't classify.
    pub fn generic() -> Self {
        let mut merged = ServiceProfile {
            submit: Vec::new(),
            retry: Vec::new(),
            stop: Vec::new(),
            streaming: Vec::new(),
        };
        for profile in [Self::chatgpt(), Self::claude()] {
            extend_unique(&mut merged.submit, profile.submit);
            extend_unique(&mut merged.retry, profile.retry);
            extend_unique(&mut merged.stop, profile.stop);
            extend_unique(&mut merged.streaming, profile.streaming);
        }
        merged
    }

    pub fn for_service(service: Option<ChatService>) -> Self {
        match service {
            Some(ChatService::ChatGpt) => Self::chatgpt(),
            Some(ChatService::Claude) => Self::claude(),
            None => Self::generic(),
        }
    }
}

fn extend_unique(into: &mut Vec<Matcher>, from: Vec<Matcher>) {
    for matcher in from {
        if !into.contains(&matcher) {
            into.push(matcher);
        }
    }
}
