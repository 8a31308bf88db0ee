//! The fact data model.
//!
//! A [`Fact`] is the immutable unit on the upstream log: a globally unique
//! id, coordinates (namespace, kind, version), optional aggregate identity,
//! a small string-to-string header map, and an opaque payload. A
//! [`FactSpec`] is the filter shape projections use to declare which slice
//! of the log they consume.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique identifier of a fact on the log.
///
/// Fact ids double as projection cursors: a projection's state cursor is
/// the id of the last fact it applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FactId(Uuid);

impl FactId {
    /// Generate a fresh random id.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for FactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An immutable, ordered event on the upstream log.
///
/// Facts are created through [`Fact::builder`] (or the
/// [`EventConverter`](crate::event::EventConverter)) and never mutated
/// afterwards. Ordering within the log is assigned by the store, not
/// carried on the fact itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fact {
    id: FactId,
    ns: String,
    kind: String,
    version: u32,
    aggregate_id: Option<Uuid>,
    meta: BTreeMap<String, String>,
    payload: Vec<u8>,
}

impl Fact {
    /// Start building a fact in the given namespace with the given kind.
    ///
    /// The fact id is generated when [`FactBuilder::build`] is called.
    #[must_use]
    pub fn builder(ns: impl Into<String>, kind: impl Into<String>) -> FactBuilder {
        FactBuilder {
            ns: ns.into(),
            kind: kind.into(),
            version: 1,
            aggregate_id: None,
            meta: BTreeMap::new(),
            payload: Vec::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> FactId {
        self.id
    }

    #[must_use]
    pub fn ns(&self) -> &str {
        &self.ns
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    #[must_use]
    pub const fn version(&self) -> u32 {
        self.version
    }

    #[must_use]
    pub const fn aggregate_id(&self) -> Option<Uuid> {
        self.aggregate_id
    }

    /// Look up a single header entry.
    #[must_use]
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(String::as_str)
    }

    #[must_use]
    pub const fn headers(&self) -> &BTreeMap<String, String> {
        &self.meta
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Builder for [`Fact`].
#[derive(Clone, Debug)]
pub struct FactBuilder {
    ns: String,
    kind: String,
    version: u32,
    aggregate_id: Option<Uuid>,
    meta: BTreeMap<String, String>,
    payload: Vec<u8>,
}

impl FactBuilder {
    #[must_use]
    pub const fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    #[must_use]
    pub const fn aggregate_id(mut self, id: Uuid) -> Self {
        self.aggregate_id = Some(id);
        self
    }

    /// Add a header entry. Later entries with the same key win.
    #[must_use]
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Finalize the fact, assigning it a fresh id.
    #[must_use]
    pub fn build(self) -> Fact {
        Fact {
            id: FactId::random(),
            ns: self.ns,
            kind: self.kind,
            version: self.version,
            aggregate_id: self.aggregate_id,
            meta: self.meta,
            payload: self.payload,
        }
    }
}

/// The versions a [`FactSpec`] or a dispatch route accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionRange {
    /// Any version.
    Any,
    /// Exactly this version.
    Exact(u32),
    /// This version or newer.
    From(u32),
    /// Inclusive range.
    Between(u32, u32),
}

impl VersionRange {
    #[must_use]
    pub const fn contains(&self, version: u32) -> bool {
        match *self {
            Self::Any => true,
            Self::Exact(v) => version == v,
            Self::From(lo) => version >= lo,
            Self::Between(lo, hi) => version >= lo && version <= hi,
        }
    }

    #[must_use]
    pub const fn is_exact(&self) -> bool {
        matches!(self, Self::Exact(_))
    }
}

/// Filter describing a subset of the fact stream.
///
/// A projection declares one or more specs; their union determines the
/// fact set routed into it. Namespace and kind match exactly, the version
/// constraint via [`VersionRange`], and the optional aggregate id and
/// header entries must all be satisfied.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactSpec {
    ns: String,
    kind: String,
    versions: VersionRange,
    aggregate_id: Option<Uuid>,
    meta: BTreeMap<String, String>,
}

impl FactSpec {
    /// A spec matching every version of `ns`/`kind`.
    #[must_use]
    pub fn new(ns: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            ns: ns.into(),
            kind: kind.into(),
            versions: VersionRange::Any,
            aggregate_id: None,
            meta: BTreeMap::new(),
        }
    }

    #[must_use]
    pub const fn versions(mut self, versions: VersionRange) -> Self {
        self.versions = versions;
        self
    }

    /// Narrow the spec to facts carrying the given aggregate id.
    #[must_use]
    pub const fn aggregate(mut self, id: Uuid) -> Self {
        self.aggregate_id = Some(id);
        self
    }

    /// Require a header entry with this exact value.
    #[must_use]
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn ns(&self) -> &str {
        &self.ns
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    #[must_use]
    pub const fn version_range(&self) -> VersionRange {
        self.versions
    }

    #[must_use]
    pub const fn aggregate_id(&self) -> Option<Uuid> {
        self.aggregate_id
    }

    /// Whether this spec selects the given fact.
    #[must_use]
    pub fn matches(&self, fact: &Fact) -> bool {
        if self.ns != fact.ns() || self.kind != fact.kind() {
            return false;
        }
        if !self.versions.contains(fact.version()) {
            return false;
        }
        if let Some(id) = self.aggregate_id
            && fact.aggregate_id() != Some(id)
        {
            return false;
        }
        self.meta
            .iter()
            .all(|(key, value)| fact.meta(key) == Some(value.as_str()))
    }
}
