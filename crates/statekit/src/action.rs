//! Actions flowing through the middleware dispatch pipeline.
//!
//! Every public store operation is reified as an [`Action`] before it
//! reaches the backend, so interceptors can transform, hold, mirror, or
//! short-circuit it. Actions are immutable once dispatched; a middleware
//! that needs to change one forwards a modified copy but must preserve the
//! kind's semantics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use serde_json::Value;

/// The operation an [`Action`] performs against the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Get,
    Set,
    Update,
    Delete,
    Clear,
    Keys,
    Init,
}

impl ActionKind {
    /// Whether this kind mutates backend state.
    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            Self::Set | Self::Update | Self::Delete | Self::Clear
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Clear => "clear",
            Self::Keys => "keys",
            Self::Init => "init",
        }
    }
}

/// One changed top-level key inside an `Update` action.
///
/// `value: None` means the key was removed by the mutator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateEntry {
    pub key: String,
    pub value: Option<Value>,
}

/// Dispatch metadata attached to every action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionMeta {
    /// Unique, time-ordered action identity.
    pub id: Uuid,
    /// Poison flag: set the first time the action enters the chain, so a
    /// middleware re-dispatching it is routed straight to the base
    /// executor instead of being re-wrapped.
    pub processed: bool,
    /// When the action was created.
    pub timestamp: DateTime<Utc>,
}

impl ActionMeta {
    fn new() -> Self {
        Self {
            id: Uuid::now_v7(),
            processed: false,
            timestamp: Utc::now(),
        }
    }
}

/// A single operation travelling through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    /// Target key for `Get`/`Set`/`Delete`; `""` denotes the whole tree.
    pub key: Option<String>,
    /// Payload for `Set`.
    pub value: Option<Value>,
    /// Changed top-level keys for `Update`.
    pub entries: Vec<UpdateEntry>,
    pub meta: ActionMeta,
}

impl Action {
    pub fn get(key: impl Into<String>) -> Self {
        Self::with_kind(ActionKind::Get, Some(key.into()), None, Vec::new())
    }

    pub fn set(key: impl Into<String>, value: Value) -> Self {
        Self::with_kind(ActionKind::Set, Some(key.into()), Some(value), Vec::new())
    }

    pub fn update(entries: Vec<UpdateEntry>) -> Self {
        Self::with_kind(ActionKind::Update, None, None, entries)
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::with_kind(ActionKind::Delete, Some(key.into()), None, Vec::new())
    }

    pub fn clear() -> Self {
        Self::with_kind(ActionKind::Clear, None, None, Vec::new())
    }

    pub fn keys() -> Self {
        Self::with_kind(ActionKind::Keys, None, None, Vec::new())
    }

    pub fn init() -> Self {
        Self::with_kind(ActionKind::Init, None, None, Vec::new())
    }

    fn with_kind(
        kind: ActionKind,
        key: Option<String>,
        value: Option<Value>,
        entries: Vec<UpdateEntry>,
    ) -> Self {
        Self {
            kind,
            key,
            value,
            entries,
            meta: ActionMeta::new(),
        }
    }

    /// The coarse-grained grouping key used by the batching middleware:
    /// action kind plus target key. `Update` actions group under the
    /// reserved whole-tree key because they already carry their own
    /// per-key entries.
    pub fn segment(&self) -> String {
        format!("{}_{}", self.kind.as_str(), self.key.as_deref().unwrap_or(""))
    }
}

/// The result of executing an action against the backend, as seen by the
/// caller of `dispatch`.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    /// Value produced by `Get`/`Set`/`Update` (the whole tree for `""`).
    Value(Option<Value>),
    /// Key listing produced by `Keys`.
    Keys(Vec<String>),
    /// Whether `Delete` removed an existing key.
    Deleted(bool),
    /// `Clear`/`Init` completed.
    Done,
    /// A middleware determined the write was redundant and short-circuited
    /// it; carries the previously stored value.
    Unchanged(Option<Value>),
}

impl ActionOutcome {
    /// Extract the carried value, if this outcome has one.
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Value(value) | Self::Unchanged(value) => value,
            _ => None,
        }
    }

    /// Whether a middleware suppressed the write as redundant.
    pub fn is_unchanged(&self) -> bool {
        matches!(self, Self::Unchanged(_))
    }
}

// ── tests ────────────────────────────────────────────────────────────
