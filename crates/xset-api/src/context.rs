//! The ResourceContext ID table
//!
//! A ResourceContext is the sidecar object persisting the instance-ID table
//! for one or more parents. Each entry is a [`ContextDetail`]: a
//! non-negative ID plus an opaque string-to-string data bag. The engine
//! never touches raw bag keys; every access goes through the
//! [`ContextKey`] enum so concrete controllers can rename keys without
//! touching allocator logic.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// One entry in a ResourceContext: a stable instance ID and its data bag
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
pub struct ContextDetail {
    /// The instance ID. Non-negative, unique within one ResourceContext.
    pub id: i32,

    /// Opaque data attached to this ID (owner, birth revision, lifecycle
    /// markers). String-valued for wire compatibility.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,
}

impl ContextDetail {
    /// Create a detail with the given ID and an empty bag
    pub fn new(id: i32) -> Self {
        Self {
            id,
            data: BTreeMap::new(),
        }
    }

    /// Read a bag value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    /// Check that a bag entry exists with exactly the given value
    pub fn contains(&self, key: &str, value: &str) -> bool {
        self.data.get(key).is_some_and(|v| v == value)
    }

    /// Write a bag value
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data.insert(key.into(), value.into());
    }

    /// Drop a bag entry
    pub fn remove(&mut self, key: &str) {
        self.data.remove(key);
    }
}

/// Wire-level spec of a ResourceContext object
///
/// The contexts sequence is kept sorted ascending by ID on every write.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
pub struct ResourceContextSpec {
    /// The ID table, sorted ascending by ID
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contexts: Vec<ContextDetail>,
}

impl ResourceContextSpec {
    /// Build a spec from a detail map, sorted ascending by ID
    pub fn from_details<'a>(details: impl IntoIterator<Item = &'a ContextDetail>) -> Self {
        let mut contexts: Vec<ContextDetail> = details.into_iter().cloned().collect();
        contexts.sort_by_key(|d| d.id);
        Self { contexts }
    }
}

/// Symbolic names for the well-known bag keys
///
/// Concrete controllers may remap every variant to their own string key
/// via [`crate::adapter::ResourceContextAdapter::context_keys`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContextKey {
    /// Name of the parent that owns this ID
    Owner,
    /// Revision the corresponding target was (or will be) born at
    Revision,
    /// Set to "true" while the target has not yet been created successfully
    JustCreate,
    /// Set to "true" while the target is upgraded by delete-and-recreate
    RecreateUpdate,
    /// Back-pointer to the ID of the target this one replaces
    ReplaceOriginTargetId,
    /// Revision of the decoration overlay attached to the target
    TargetDecorationRevision,
}

impl ContextKey {
    /// Every key, for table-completeness validation
    pub const ALL: [ContextKey; 6] = [
        ContextKey::Owner,
        ContextKey::Revision,
        ContextKey::JustCreate,
        ContextKey::RecreateUpdate,
        ContextKey::ReplaceOriginTargetId,
        ContextKey::TargetDecorationRevision,
    ];

    /// The default string key for this entry
    pub fn default_key(&self) -> &'static str {
        match self {
            ContextKey::Owner => "Owner",
            ContextKey::Revision => "Revision",
            ContextKey::JustCreate => "TargetJustCreate",
            ContextKey::RecreateUpdate => "TargetRecreateUpdating",
            ContextKey::ReplaceOriginTargetId => "ReplaceOriginTargetID",
            ContextKey::TargetDecorationRevision => "TargetDecorationRevision",
        }
    }
}

/// A resolved enum-to-string key table
pub type ContextKeys = HashMap<ContextKey, String>;

/// The default key table used when an adapter provides none
pub fn default_context_keys() -> ContextKeys {
    ContextKey::ALL
        .iter()
        .map(|key| (*key, key.default_key().to_string()))
        .collect()
}
