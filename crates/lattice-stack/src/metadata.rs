//! Call metadata
//!
//! An ordered list of key/value entries plus a typed status slot.
//! Trailing metadata carries the call's final status; peer-only receive
//! errors are surfaced by synthesizing trailing metadata from the error.

use lattice_core::error::{Status, StatusCode};
use std::sync::Arc;

/// Ordered call metadata with a typed status entry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(Arc<str>, Arc<str>)>,
    status: Option<StatusCode>,
    status_message: Option<Arc<str>>,
}

impl Metadata {
    pub fn new() -> Self {
        Metadata::default()
    }

    /// Append an entry; duplicate keys are allowed and keep their order
    pub fn append(&mut self, key: impl Into<Arc<str>>, value: impl Into<Arc<str>>) {
        self.entries.push((key.into(), value.into()));
    }

    /// First value for `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_ref() == key)
            .map(|(_, v)| v.as_ref())
    }

    /// All values for `key`, in insertion order
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k.as_ref() == key)
            .map(|(_, v)| v.as_ref())
    }

    /// Remove every entry for `key`
    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|(k, _)| k.as_ref() != key);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_ref(), v.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.status.is_none()
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn set_status_message(&mut self, message: impl Into<Arc<str>>) {
        self.status_message = Some(message.into());
    }

    pub fn status_message(&self) -> Option<&str> {
        self.status_message.as_deref()
    }

    /// Trailing metadata synthesized from an error
    pub fn from_status(status: &Status) -> Metadata {
        let mut md = Metadata::new();
        md.set_status(status.code());
        md.set_status_message(status.message());
        md
    }

    /// Read this metadata's status slot back as a `Status`
    ///
    /// `default_code` applies when no status entry is present.
    pub fn to_status(&self, default_code: StatusCode) -> Status {
        Status::new(
            self.status.unwrap_or(default_code),
            self.status_message.as_deref().unwrap_or(""),
        )
    }
}
