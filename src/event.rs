//! Minimal data shapes exchanged with relays and stored in the cache.
//!
//! Only the fields the relay and cache layers need for routing and
//! indexing are modelled. Application-level interpretation of event
//! content is left to callers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Metadata (profile) event kind.
pub const KIND_METADATA: u16 = 0;
/// Short text note kind.
pub const KIND_TEXT_NOTE: u16 = 1;
/// Relay list metadata kind.
pub const KIND_RELAY_LIST: u16 = 10002;

/// A signed event as received from a relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Event id (32-byte hex).
    pub id: String,
    /// Author public key (32-byte hex).
    pub pubkey: String,
    /// Creation time (Unix seconds).
    pub created_at: u64,
    /// Event kind.
    pub kind: u16,
    /// Tags, each a list of strings.
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    /// Content.
    #[serde(default)]
    pub content: String,
    /// Signature (64-byte hex).
    #[serde(default)]
    pub sig: String,
}

impl Event {
    /// Decode and shape-check an event received from a relay.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let event: Event = serde_json::from_value(value)
            .map_err(|e| Error::Malformed(format!("Invalid event: {}", e)))?;
        event.validate()?;
        Ok(event)
    }

    /// Check that the identity fields look like 32-byte hex strings.
    pub fn validate(&self) -> Result<()> {
        if !is_hex_key(&self.id) {
            return Err(Error::Malformed(format!("Invalid event id: {}", self.id)));
        }
        if !is_hex_key(&self.pubkey) {
            return Err(Error::Malformed(format!(
                "Invalid event pubkey: {}",
                self.pubkey
            )));
        }
        Ok(())
    }

    /// Lowercased hashtags from `t` tags.
    pub fn hashtags(&self) -> impl Iterator<Item = String> + '_ {
        self.tags
            .iter()
            .filter(|t| t.len() >= 2 && t[0] == "t")
            .map(|t| t[1].to_lowercase())
    }

    /// Whether the event carries the given hashtag (case-insensitive).
    pub fn has_hashtag(&self, tag: &str) -> bool {
        let wanted = tag.trim_start_matches('#').to_lowercase();
        self.hashtags().any(|t| t == wanted)
    }

    /// Ids referenced by `e` tags.
    pub fn referenced_events(&self) -> impl Iterator<Item = &str> + '_ {
        self.tags
            .iter()
            .filter(|t| t.len() >= 2 && t[0] == "e")
            .map(|t| t[1].as_str())
    }
}

/// Whether `s` is a 64-character lowercase or uppercase hex string.
pub fn is_hex_key(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Profile metadata for a public key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Public key the profile belongs to.
    pub pubkey: String,
    /// Short name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Avatar URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    /// Biography.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    /// NIP-05 identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nip05: Option<String>,
    /// Banner URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,
    /// Website.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    /// Lightning address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lud16: Option<String>,
    /// Creation time of the metadata event (Unix seconds).
    #[serde(default)]
    pub created_at: u64,
    /// Last time the profile was refreshed (Unix seconds).
    #[serde(default)]
    pub updated_at: u64,
}

impl Profile {
    /// Build a profile from a kind-0 metadata event.
    pub fn from_metadata_event(event: &Event) -> Result<Self> {
        if event.kind != KIND_METADATA {
            return Err(Error::Malformed(format!(
                "Expected metadata event, got kind {}",
                event.kind
            )));
        }

        let mut profile: Profile = serde_json::from_str(&event.content)
            .map_err(|e| Error::Malformed(format!("Invalid profile content: {}", e)))?;
        profile.pubkey = event.pubkey.clone();
        profile.created_at = event.created_at;
        profile.updated_at = event.created_at;
        Ok(profile)
    }

    /// Copy holding only the fields needed to render the author.
    pub fn essential(&self) -> Self {
        Self {
            pubkey: self.pubkey.clone(),
            name: self.name.clone(),
            picture: self.picture.clone(),
            nip05: self.nip05.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            ..Default::default()
        }
    }
}

/// A root event together with its replies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadData {
    /// Id of the thread root.
    pub root_id: String,
    /// Root and reply events.
    pub events: Vec<Event>,
}

/// Subscription filter (NIP-01).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Event ids.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    /// Author public keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    /// Event kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,
    /// Lower creation-time bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    /// Upper creation-time bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    /// Maximum number of events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    /// Tag filters keyed `#<letter>`.
    #[serde(flatten)]
    pub tags: BTreeMap<String, Vec<String>>,
}

impl Filter {
    /// Create an empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to event ids.
    pub fn ids(mut self, ids: Vec<String>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Restrict to authors.
    pub fn authors(mut self, authors: Vec<String>) -> Self {
        self.authors = Some(authors);
        self
    }

    /// Restrict to kinds.
    pub fn kinds(mut self, kinds: Vec<u16>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    /// Lower time bound.
    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    /// Upper time bound.
    pub fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    /// Maximum number of events.
    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    /// Restrict to a hashtag (`#t`).
    pub fn hashtag(mut self, tag: impl Into<String>) -> Self {
        self.tags
            .entry("#t".to_string())
            .or_default()
            .push(tag.into().to_lowercase());
        self
    }

    /// Whether a cached event satisfies this filter.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == &event.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| a == &event.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if self.since.is_some_and(|since| event.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.created_at > until) {
            return false;
        }
        if let Some(tags) = self.tags.get("#t") {
            if !tags.iter().any(|t| event.has_hashtag(t)) {
                return false;
            }
        }
        true
    }
}
