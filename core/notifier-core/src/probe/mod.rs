//! Evidence probe: classifies generation state from the live DOM.
//!
//! The probe holds no node references. Every call takes a fresh snapshot from
//! the [`Document`], so SPA re-renders that replace elements are harmless.
//!
//! Completion is a conjunction, not a single signal:
//! 1. a retry/regenerate affordance is present, AND
//! 2. no stop-generating affordance is present, AND
//! 3. no streaming/typing indicator is present.
//!
//! A retry control can exist in the page skeleton before the first response
//! finishes, and the stop control alone flickers when token streaming pauses.

mod profile;

pub use profile::{Matcher, ServiceProfile};

use std::collections::BTreeMap;

use crate::types::ChatService;

/// A point-in-time view of one DOM element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    /// Stable identity of the underlying node for as long as it stays mounted.
    pub node_id: u64,
    pub tag: String,
    pub attributes: BTreeMap<String, String>,
    pub text: String,
    pub visible: bool,
}

impl Element {
    pub fn new(node_id: u64, tag: &str) -> Self {
        Element {
            node_id,
            tag: tag.to_ascii_lowercase(),
            attributes: BTreeMap::new(),
            text: String::new(),
            visible: true,
        }
    }

    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.attributes.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Buttons and button-like controls.
    pub fn is_control(&self) -> bool {
        matches!(self.tag.as_str(), "button" | "input") || self.attr("role") == Some("button")
    }
}

/// Source of DOM snapshots. Implemented by the page binding; tests use fixtures.
pub trait Document {
    fn elements(&self) -> Vec<Element>;
}

impl Document for Vec<Element> {
    fn elements(&self) -> Vec<Element> {
        self.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evidence {
    Generating,
    Complete,
    Unknown,
}

pub trait EvidenceProbe {
    /// The submit control, if any matcher finds one.
    fn find_submit(&self, doc: &dyn Document) -> Option<Element>;

    fn classify(&self, doc: &dyn Document) -> Evidence;

    /// Stop affordance or streaming indicator present.
    fn in_progress(&self, doc: &dyn Document) -> bool {
        self.classify(doc) == Evidence::Generating
    }
}

/// [`EvidenceProbe`] driven by a [`ServiceProfile`].
#[derive(Debug, Clone)]
pub struct SelectorProbe {
    profile: ServiceProfile,
}

impl SelectorProbe {
    pub fn new(profile: ServiceProfile) -> Self {
        SelectorProbe { profile }
    }

    pub fn for_url(url: &str) -> Self {
        Self::new(ServiceProfile::for_service(ChatService::from_url(url)))
    }

    pub fn profile(&self) -> &ServiceProfile {
        &self.profile
    }
}

fn any_control(elements: &[Element], matchers: &[Matcher]) -> bool {
    elements
        .iter()
        .filter(|element| element.is_control())
        .any(|element| matchers.iter().any(|matcher| matcher.matches(element)))
}

fn any_element(elements: &[Element], matchers: &[Matcher]) -> bool {
    elements
        .iter()
        .any(|element| matchers.iter().any(|matcher| matcher.matches(element)))
}

impl EvidenceProbe for SelectorProbe {
    fn find_submit(&self, doc: &dyn Document) -> Option<Element> {
        let elements = doc.elements();
        self.profile.submit.iter().find_map(|matcher| {
            elements
                .iter()
                .find(|element| element.is_control() && matcher.matches(element))
                .cloned()
        })
    }

    fn classify(&self, doc: &dyn Document) -> Evidence {
        let elements = doc.elements();
        let stop = any_control(&elements, &self.profile.stop);
        let streaming = any_element(&elements, &self.profile.streaming);
        if stop || streaming {
            return Evidence::Generating;
        }
        if any_control(&elements, &self.profile.retry) {
            Evidence::Complete
        } else {
            Evidence::Unknown
        }
    }
}
