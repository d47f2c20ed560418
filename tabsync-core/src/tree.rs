//! The stamp tree, generic over depth.
//!
//! A [`Leaf`] holds one cell or value. A [`Node`] holds children of any
//! [`StampTree`] type, so rows, tables, the tables root and the values root
//! all share one implementation of merging and hashing.
//!
//! A node's hash is the XOR of `hash_id_and_hash(child_id, child_hash)` over
//! its children. Node timestamps never shrink and do not feed into hashes.

use std::collections::BTreeMap;

use crate::hash::{hash_id_and_hash, hash_leaf, Hash};
use crate::stamp::{CellStamp, CellValue, Id, Stamp, Time};

/// Result of merging an incoming stamp into a tree.
#[derive(Debug)]
pub struct Merged<S> {
    /// The accepted part of the incoming stamp, without hashes.
    pub changes: Option<S>,
    /// Latest timestamp seen while merging.
    pub latest: Time,
}

pub trait StampTree: Default {
    type Stamp;

    fn time(&self) -> &str;

    fn hash(&self) -> Hash;

    fn to_stamp(&self, with_hashes: bool) -> Self::Stamp;

    /// Merges an incoming stamp by last-writer-wins.
    ///
    /// With `is_content` the incoming hashes are trusted as-is; otherwise
    /// they are recomputed from accepted leaves.
    fn merge(&mut self, incoming: &Self::Stamp, is_content: bool) -> Merged<Self::Stamp>;

    /// Stamps for the paths named by `changes`, read back from this tree.
    fn touched(&self, changes: &Self::Stamp, with_hashes: bool) -> Self::Stamp;

    /// Checks a full-content stamp: every hash present, every value primitive.
    fn validate(stamp: &Self::Stamp) -> bool;
}

pub(crate) fn latest_time(a: &str, b: &str) -> Time {
    let latest = if a > b { a } else { b };
    latest.to_string()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Leaf {
    pub value: Option<CellValue>,
    pub time: Time,
    pub hash: Hash,
}

impl StampTree for Leaf {
    type Stamp = CellStamp;

    fn time(&self) -> &str {
        &self.time
    }

    fn hash(&self) -> Hash {
        self.hash
    }

    fn to_stamp(&self, with_hashes: bool) -> CellStamp {
        Stamp {
            value: self.value.clone(),
            time: self.time.clone(),
            hash: with_hashes.then_some(self.hash),
        }
    }

    fn merge(&mut self, incoming: &CellStamp, is_content: bool) -> Merged<CellStamp> {
        if !self.time.is_empty() && incoming.time <= self.time {
            return Merged {
                changes: None,
                latest: Time::new(),
            };
        }
        self.hash = match incoming.hash {
            Some(hash) if is_content => hash,
            _ => hash_leaf(&CellValue::to_json(incoming.value.as_ref()), &incoming.time),
        };
        self.value = incoming.value.clone();
        self.time = incoming.time.clone();
        Merged {
            changes: Some(Stamp::new(self.value.clone(), self.time.clone())),
            latest: self.time.clone(),
        }
    }

    fn touched(&self, _changes: &CellStamp, with_hashes: bool) -> CellStamp {
        self.to_stamp(with_hashes)
    }

    fn validate(stamp: &CellStamp) -> bool {
        stamp.hash.is_some() && stamp.value.as_ref().map_or(true, CellValue::is_valid)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node<C> {
    pub children: BTreeMap<Id, C>,
    pub time: Time,
    pub hash: Hash,
}

impl<C> Default for Node<C> {
    fn default() -> Self {
        Self {
            children: BTreeMap::new(),
            time: Time::new(),
            hash: 0,
        }
    }
}

impl<C: StampTree> StampTree for Node<C> {
    type Stamp = Stamp<BTreeMap<Id, C::Stamp>>;

    fn time(&self) -> &str {
        &self.time
    }

    fn hash(&self) -> Hash {
        self.hash
    }

    fn to_stamp(&self, with_hashes: bool) -> Self::Stamp {
        Stamp {
            value: self
                .children
                .iter()
                .map(|(id, child)| (id.clone(), child.to_stamp(with_hashes)))
                .collect(),
            time: self.time.clone(),
            hash: with_hashes.then_some(self.hash),
        }
    }

    fn merge(&mut self, incoming: &Self::Stamp, is_content: bool) -> Merged<Self::Stamp> {
        let mut changes = BTreeMap::new();
        let mut seen = incoming.time.clone();
        let mut hash = self.hash;

        for (id, child_stamp) in &incoming.value {
            let existed = self.children.contains_key(id);
            let child = self.children.entry(id.clone()).or_default();
            let old_hash = child.hash();
            let merged = child.merge(child_stamp, is_content);

            match merged.changes {
                Some(child_changes) => {
                    if existed {
                        hash ^= hash_id_and_hash(id, old_hash);
                    }
                    hash ^= hash_id_and_hash(id, child.hash());
                    seen = latest_time(&seen, &merged.latest);
                    changes.insert(id.clone(), child_changes);
                }
                None if !existed => {
                    self.children.remove(id);
                }
                None => {}
            }
        }

        self.hash = match incoming.hash {
            Some(incoming_hash) if is_content => incoming_hash,
            _ => hash,
        };
        self.time = latest_time(&self.time, &seen);

        Merged {
            changes: (!changes.is_empty()).then(|| Stamp::new(changes, self.time.clone())),
            latest: seen,
        }
    }

    fn touched(&self, changes: &Self::Stamp, with_hashes: bool) -> Self::Stamp {
        Stamp {
            value: changes
                .value
                .iter()
                .filter_map(|(id, child_changes)| {
                    self.children
                        .get(id)
                        .map(|child| (id.clone(), child.touched(child_changes, with_hashes)))
                })
                .collect(),
            time: self.time.clone(),
            hash: with_hashes.then_some(self.hash),
        }
    }

    fn validate(stamp: &Self::Stamp) -> bool {
        stamp.hash.is_some() && stamp.value.values().all(C::validate)
    }
}

impl<C: StampTree> Node<C> {
    /// Hash of every child, keyed by id.
    pub fn hashes(&self) -> BTreeMap<Id, Hash> {
        self.children
            .iter()
            .map(|(id, child)| (id.clone(), child.hash()))
            .collect()
    }

    /// Splits children against another replica's hashes: whole stamps for
    /// children the other side lacks, and hashes of shared children that differ.
    pub fn diff(&self, other: &BTreeMap<Id, Hash>) -> (Stamp<BTreeMap<Id, C::Stamp>>, BTreeMap<Id, Hash>) {
        let mut new = BTreeMap::new();
        let mut differing = BTreeMap::new();
        for (id, child) in &self.children {
            match other.get(id) {
                Some(hash) if *hash != child.hash() => {
                    differing.insert(id.clone(), child.hash());
                }
                Some(_) => {}
                None => {
                    new.insert(id.clone(), child.to_stamp(false));
                }
            }
        }
        (Stamp::new(new, self.time.clone()), differing)
    }

    /// Stamps of every child whose hash is absent from or unlike `other`.
    pub fn stamps_unlike(&self, other: &BTreeMap<Id, Hash>) -> Stamp<BTreeMap<Id, C::Stamp>> {
        Stamp::new(
            self.children
                .iter()
                .filter(|(id, child)| other.get(*id) != Some(&child.hash()))
                .map(|(id, child)| (id.clone(), child.to_stamp(false)))
                .collect(),
            self.time.clone(),
        )
    }

    /// Recomputes the aggregate hash from the children.
    pub fn recompute_hash(&self) -> Hash {
        self.children
            .iter()
            .fold(0, |hash, (id, child)| hash ^ hash_id_and_hash(id, child.hash()))
    }
}

pub type RowNode = Node<Leaf>;
pub type TableNode = Node<RowNode>;
pub type TablesNode = Node<TableNode>;
pub type ValuesNode = Node<Leaf>;
