//! The CRDT contract and the two reference constructions.
//!
//! A [`CrdtFunction`] supplies the algebra the storage layers rely on:
//! `merge` must be commutative, associative, and idempotent, and
//! `extract` cuts a state down to the portion visible at or after a
//! timestamp (`None` means the key is fully tombstoned and must not be
//! observed). Session ordering, WAL replay, and anti-entropy all lean on
//! those laws instead of coordination.

use crate::record::Timestamp;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::hash::Hash;
use std::marker::PhantomData;

/// Bounds a key must satisfy: total order, hashing, and a codec encoding.
pub trait CrdtKey:
    Ord + Hash + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> CrdtKey for T where
    T: Ord + Hash + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Bounds a state must satisfy. States are opaque outside the CRDT
/// function itself.
pub trait CrdtState: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> CrdtState for T where T: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{}

/// A commutative, associative, idempotent merge plus timestamp extraction.
pub trait CrdtFunction: Clone + Send + Sync + 'static {
    /// Key type, opaque to the core.
    type Key: CrdtKey;
    /// State type, opaque to the core.
    type State: CrdtState;

    /// Merge two states for the same key.
    fn merge(&self, a: Self::State, b: Self::State) -> Self::State;

    /// The portion of `state` visible at or after `cutoff`, or `None` if
    /// nothing remains.
    fn extract(&self, state: Self::State, cutoff: Timestamp) -> Option<Self::State>;
}

// ---------------------------------------------------------------------------
// G-Set
// ---------------------------------------------------------------------------

/// A grow-only set. Merge is union; extraction is identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GSet<T: Ord>(BTreeSet<T>);

impl<T: Ord> Default for GSet<T> {
    fn default() -> Self {
        GSet(BTreeSet::new())
    }
}

impl<T: Ord> GSet<T> {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set holding the given elements.
    pub fn of(elems: impl IntoIterator<Item = T>) -> Self {
        GSet(elems.into_iter().collect())
    }

    /// Add one element.
    pub fn insert(&mut self, elem: T) {
        self.0.insert(elem);
    }

    /// Membership test.
    pub fn contains(&self, elem: &T) -> bool {
        self.0.contains(elem)
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no element has ever been added.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate elements in order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.0.iter()
    }
}

impl<T: Ord> FromIterator<T> for GSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        GSet(iter.into_iter().collect())
    }
}

/// [`CrdtFunction`] over [`GSet`] states.
pub struct GSetCrdt<K, T>(PhantomData<fn() -> (K, T)>);

impl<K, T> GSetCrdt<K, T> {
    /// Create the function object.
    pub fn new() -> Self {
        GSetCrdt(PhantomData)
    }
}

impl<K, T> Default for GSetCrdt<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> Clone for GSetCrdt<K, T> {
    fn clone(&self) -> Self {
        GSetCrdt(PhantomData)
    }
}

impl<K, T> CrdtFunction for GSetCrdt<K, T>
where
    K: CrdtKey,
    T: Ord + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Key = K;
    type State = GSet<T>;

    fn merge(&self, mut a: GSet<T>, b: GSet<T>) -> GSet<T> {
        a.0.extend(b.0);
        a
    }

    fn extract(&self, state: GSet<T>, _cutoff: Timestamp) -> Option<GSet<T>> {
        Some(state)
    }
}

// ---------------------------------------------------------------------------
// Timestamp-wrapped value
// ---------------------------------------------------------------------------

/// A last-writer-wins value: the state carries its own update time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lww<T> {
    /// The wrapped value.
    pub value: T,
    /// When the value was written.
    pub updated_at: Timestamp,
}

impl<T> Lww<T> {
    /// Wrap a value with its update time.
    pub fn new(value: T, updated_at: Timestamp) -> Self {
        Lww { value, updated_at }
    }
}

/// [`CrdtFunction`] over [`Lww`] states.
///
/// The larger `updated_at` wins; equal timestamps break ties with a
/// value-level merge (max), keeping the merge commutative. Extraction
/// drops values older than the cutoff.
pub struct LwwCrdt<K, T>(PhantomData<fn() -> (K, T)>);

impl<K, T> LwwCrdt<K, T> {
    /// Create the function object.
    pub fn new() -> Self {
        LwwCrdt(PhantomData)
    }
}

impl<K, T> Default for LwwCrdt<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> Clone for LwwCrdt<K, T> {
    fn clone(&self) -> Self {
        LwwCrdt(PhantomData)
    }
}

impl<K, T> CrdtFunction for LwwCrdt<K, T>
where
    K: CrdtKey,
    T: Ord + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Key = K;
    type State = Lww<T>;

    fn merge(&self, a: Lww<T>, b: Lww<T>) -> Lww<T> {
        match a.updated_at.cmp(&b.updated_at) {
            std::cmp::Ordering::Greater => a,
            std::cmp::Ordering::Less => b,
            std::cmp::Ordering::Equal => Lww {
                value: a.value.max(b.value),
                updated_at: a.updated_at,
            },
        }
    }

    fn extract(&self, state: Lww<T>, cutoff: Timestamp) -> Option<Lww<T>> {
        if state.updated_at < cutoff {
            None
        } else {
            Some(state)
        }
    }
}
