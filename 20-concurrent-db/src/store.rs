//! Concurrent ordered key-value storage.
//!
//! The store is an unbalanced binary search tree in which every entry carries
//! its own reader-writer lock. Operations walk the tree with lock coupling
//! (hand-over-hand locking): the lock on the next entry is acquired before the
//! lock on the current entry is released, so no thread ever observes an edge
//! between two entries while another thread is rewriting it.
//!
//! # Locking order
//!
//! Locks are only ever requested top-down. A thread holding a lock on an entry
//! may request a lock on one of that entry's descendants, never on an
//! ancestor. Two operations that touch overlapping regions therefore
//! serialize at their deepest shared ancestor, while operations on disjoint
//! subtrees proceed in parallel.
//!
//! # Sentinel
//!
//! The tree hangs off a permanent sentinel entry with an empty key. Every real
//! key compares greater than the empty key, so the actual root always lives in
//! the sentinel's right link. Write operations lock the sentinel first, which
//! orders all structural changes near the top of the tree.
//!
//! Guards are `parking_lot` "arc" guards: they own a clone of the entry's
//! `Arc`, so a guard can outlive the borrow of the parent it was reached
//! through. An entry is freed when the last guard or link referencing it is
//! dropped, which is always after it has been unlinked under its own write
//! lock.

use std::io::{self, Write};
use std::mem;
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};
use thiserror::Error;

/// Longest key or value, in bytes, the store accepts.
pub const MAX_FIELD_LEN: usize = 255;

type Node = Arc<RwLock<Entry>>;
type Link = Option<Node>;
type ReadGuard = ArcRwLockReadGuard<RawRwLock, Entry>;
type WriteGuard = ArcRwLockWriteGuard<RawRwLock, Entry>;

/// Reasons an entry cannot be constructed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EntryError {
    #[error("key must not be empty")]
    EmptyKey,
    #[error("key is {0} bytes long, limit is {max}", max = MAX_FIELD_LEN)]
    KeyTooLong(usize),
    #[error("value is {0} bytes long, limit is {max}", max = MAX_FIELD_LEN)]
    ValueTooLong(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyPresent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Removed,
    NotFound,
}

/// A tree node. Only reachable through its parent's link while that parent
/// is locked, or through a guard obtained by coupling down from it.
struct Entry {
    key: String,
    value: String,
    left: Link,
    right: Link,
}

impl Entry {
    fn sentinel() -> Self {
        Self {
            key: String::new(),
            value: String::new(),
            left: None,
            right: None,
        }
    }

    fn new(key: &str, value: &str) -> Result<Self, EntryError> {
        check_key(key)?;
        if value.len() > MAX_FIELD_LEN {
            return Err(EntryError::ValueTooLong(value.len()));
        }
        Ok(Self {
            key: key.to_owned(),
            value: value.to_owned(),
            left: None,
            right: None,
        })
    }

    /// The link a search for `key` continues through.
    fn slot(&self, key: &str) -> &Link {
        if key < self.key.as_str() {
            &self.left
        } else {
            &self.right
        }
    }

    fn slot_mut(&mut self, key: &str) -> &mut Link {
        if key < self.key.as_str() {
            &mut self.left
        } else {
            &mut self.right
        }
    }

    fn child(&self, key: &str) -> Option<Node> {
        self.slot(key).clone()
    }
}

fn check_key(key: &str) -> Result<(), EntryError> {
    if key.is_empty() {
        return Err(EntryError::EmptyKey);
    }
    if key.len() > MAX_FIELD_LEN {
        return Err(EntryError::KeyTooLong(key.len()));
    }
    Ok(())
}

/// Result of a write-mode descent. `parent` is always held; `target` is the
/// matched entry, also write-locked, when the key is present.
struct WriteDescent {
    parent: WriteGuard,
    target: Option<WriteGuard>,
}

/// The shared, lock-coupled binary search tree.
pub struct OrderedStore {
    root: Node,
}

impl Default for OrderedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderedStore {
    pub fn new() -> Self {
        Self {
            root: Arc::new(RwLock::new(Entry::sentinel())),
        }
    }

    /// Looks up `key`, returning a copy of its value.
    ///
    /// Descends in read mode. The parent's read lock is dropped as soon as
    /// the child's is held.
    pub fn query(&self, key: &str) -> Option<String> {
        let mut current: ReadGuard = self.root.read_arc();
        loop {
            let next = current.child(key)?;
            let next = next.read_arc();
            current = next;
            if current.key == key {
                return Some(current.value.clone());
            }
        }
    }

    /// Inserts `key` with `value` unless the key is already present, in
    /// which case the existing value is left untouched.
    ///
    /// An invalid key is rejected before locking anything. The value is only
    /// checked once the key is known to be absent, so a present key reports
    /// `AlreadyPresent` whatever the value.
    pub fn insert(&self, key: &str, value: &str) -> Result<InsertOutcome, EntryError> {
        check_key(key)?;
        let WriteDescent { mut parent, target } = self.descend_for_write(key);
        if target.is_some() {
            return Ok(InsertOutcome::AlreadyPresent);
        }
        let entry = Entry::new(key, value)?;
        *parent.slot_mut(key) = Some(Arc::new(RwLock::new(entry)));
        Ok(InsertOutcome::Inserted)
    }

    /// Removes `key`.
    ///
    /// With at most one child the entry is replaced in its parent by that
    /// child. With two children the entry takes over the key and value of its
    /// in-order successor, which is then spliced out of the right subtree.
    pub fn delete(&self, key: &str) -> DeleteOutcome {
        let WriteDescent { mut parent, target } = self.descend_for_write(key);
        let Some(mut doomed) = target else {
            return DeleteOutcome::NotFound;
        };

        let has_left = doomed.left.is_some();
        match (has_left, doomed.right.clone()) {
            (_, None) => *parent.slot_mut(key) = doomed.left.take(),
            (false, Some(_)) => *parent.slot_mut(key) = doomed.right.take(),
            (true, Some(right)) => splice_successor(&mut doomed, &right),
        }

        drop(doomed);
        drop(parent);
        DeleteOutcome::Removed
    }

    /// Write-locks the sentinel and couples down toward `key`.
    ///
    /// On return the last entry visited (`parent`) is locked and, when the
    /// key exists, so is the matched entry. Every other lock taken along the
    /// way has been released.
    fn descend_for_write(&self, key: &str) -> WriteDescent {
        let mut parent = self.root.write_arc();
        loop {
            let Some(child) = parent.child(key) else {
                return WriteDescent {
                    parent,
                    target: None,
                };
            };
            let child = child.write_arc();
            if child.key == key {
                return WriteDescent {
                    parent,
                    target: Some(child),
                };
            }
            parent = child;
        }
    }

    /// Destroys every entry except the sentinel and returns how many were
    /// dropped.
    ///
    /// Meant for teardown once no session can reach the store; it still
    /// takes each lock so a stray reader cannot observe a half-dismantled
    /// entry.
    pub fn clear(&self) -> usize {
        let mut pending: Vec<Node> = Vec::new();
        {
            let mut root = self.root.write();
            pending.extend(root.left.take());
            pending.extend(root.right.take());
        }

        let mut destroyed = 0;
        while let Some(node) = pending.pop() {
            let mut entry = node.write();
            pending.extend(entry.left.take());
            pending.extend(entry.right.take());
            destroyed += 1;
        }
        destroyed
    }

    /// Keys in ascending order.
    ///
    /// Entries are locked one at a time, so under concurrent writes the
    /// result is not a point-in-time view.
    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        let mut stack: Vec<Node> = Vec::new();
        let mut cursor = self.root.read().right.clone();
        loop {
            while let Some(node) = cursor {
                cursor = node.read().left.clone();
                stack.push(node);
            }
            let Some(node) = stack.pop() else {
                break;
            };
            let entry = node.read();
            keys.push(entry.key.clone());
            cursor = entry.right.clone();
        }
        keys
    }

    pub fn len(&self) -> usize {
        let mut count = 0;
        let mut stack: Vec<Node> = self.root.read().right.iter().cloned().collect();
        while let Some(node) = stack.pop() {
            let entry = node.read();
            stack.extend(entry.left.clone());
            stack.extend(entry.right.clone());
            count += 1;
        }
        count
    }

    pub fn is_empty(&self) -> bool {
        self.root.read().right.is_none()
    }

    /// Writes a pre-order dump of the tree.
    ///
    /// The first line is `(root)`. Every following line is indented by one
    /// space per level and holds either `<key> <value>` or `(null)` for an
    /// absent child.
    pub fn dump<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "(root)")?;
        let (left, right) = {
            let root = self.root.read();
            (root.left.clone(), root.right.clone())
        };

        let mut stack: Vec<(Link, usize)> = vec![(right, 1), (left, 1)];
        while let Some((link, depth)) = stack.pop() {
            let Some(node) = link else {
                writeln!(out, "{:depth$}(null)", "")?;
                continue;
            };
            let (key, value) = {
                let entry = node.read();
                stack.push((entry.right.clone(), depth + 1));
                stack.push((entry.left.clone(), depth + 1));
                (entry.key.clone(), entry.value.clone())
            };
            writeln!(out, "{:depth$}{key} {value}", "")?;
        }
        Ok(())
    }
}

impl Drop for OrderedStore {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Moves the in-order successor of `doomed` into it and unlinks the
/// successor's old entry.
///
/// `right` is `doomed`'s right child. The descent write-locks it and then
/// couples down the left spine. The successor's parent stays locked until the
/// splice so its left link is rewritten under its own lock.
fn splice_successor(doomed: &mut Entry, right: &Node) {
    let mut successor = right.write_arc();
    match successor.left.clone() {
        None => doomed.right = successor.right.take(),
        Some(left) => {
            let mut successor_parent = mem::replace(&mut successor, left.write_arc());
            while let Some(next) = successor.left.clone() {
                successor_parent = mem::replace(&mut successor, next.write_arc());
            }
            successor_parent.left = successor.right.take();
        }
    }
    debug_assert!(successor.left.is_none(), "successor has a left child");

    doomed.key = mem::take(&mut successor.key);
    doomed.value = mem::take(&mut successor.value);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(keys: &[&str]) -> OrderedStore {
        let store = OrderedStore::new();
        for key in keys {
            let value = format!("v-{key}");
            assert_eq!(
                store.insert(key, &value).expect("valid entry"),
                InsertOutcome::Inserted
            );
        }
        store
    }

    fn dump_to_string(store: &OrderedStore) -> String {
        let mut out = Vec::new();
        store.dump(&mut out).expect("dump to memory");
        String::from_utf8(out).expect("utf8 dump")
    }

    #[test]
    fn add_query_delete_scenario() {
        let store = OrderedStore::new();
        assert_eq!(store.insert("alice", "1"), Ok(InsertOutcome::Inserted));
        assert_eq!(store.insert("bob", "2"), Ok(InsertOutcome::Inserted));
        assert_eq!(store.query("alice").as_deref(), Some("1"));
        assert_eq!(store.delete("alice"), DeleteOutcome::Removed);
        assert_eq!(store.query("alice"), None);
        assert_eq!(store.query("bob").as_deref(), Some("2"));
    }

    #[test]
    fn duplicate_insert_keeps_first_value() {
        let store = OrderedStore::new();
        assert_eq!(store.insert("a", "x"), Ok(InsertOutcome::Inserted));
        assert_eq!(store.insert("a", "y"), Ok(InsertOutcome::AlreadyPresent));
        assert_eq!(store.query("a").as_deref(), Some("x"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn deleting_absent_key_leaves_tree_alone() {
        let store = store_with(&["m", "f", "t"]);
        let before = store.keys();
        assert_eq!(store.delete("q"), DeleteOutcome::NotFound);
        assert_eq!(store.keys(), before);
    }

    #[test]
    fn empty_key_is_never_found() {
        let store = store_with(&["a"]);
        assert_eq!(store.query(""), None);
        assert_eq!(store.delete(""), DeleteOutcome::NotFound);
        assert_eq!(store.insert("", "v"), Err(EntryError::EmptyKey));
    }

    #[test]
    fn oversized_fields_are_rejected() {
        let store = OrderedStore::new();
        let long = "k".repeat(MAX_FIELD_LEN + 1);
        let limit = "k".repeat(MAX_FIELD_LEN);

        assert_eq!(
            store.insert(&long, "v"),
            Err(EntryError::KeyTooLong(MAX_FIELD_LEN + 1))
        );
        assert_eq!(
            store.insert("k", &long),
            Err(EntryError::ValueTooLong(MAX_FIELD_LEN + 1))
        );
        assert_eq!(store.insert(&limit, &limit), Ok(InsertOutcome::Inserted));
        assert!(store.query(&long).is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn present_key_wins_over_oversized_value() {
        let store = store_with(&["k"]);
        let long = "v".repeat(MAX_FIELD_LEN + 1);
        assert_eq!(store.insert("k", &long), Ok(InsertOutcome::AlreadyPresent));
        assert_eq!(store.query("k").as_deref(), Some("v-k"));
        assert_eq!(
            store.insert("absent", &long),
            Err(EntryError::ValueTooLong(MAX_FIELD_LEN + 1))
        );
    }

    #[test]
    fn delete_leaf_and_single_child_entries() {
        let store = store_with(&["m", "f", "c", "t", "x"]);

        // "c" is a leaf; "t" has only a right child.
        assert_eq!(store.delete("c"), DeleteOutcome::Removed);
        assert_eq!(store.delete("t"), DeleteOutcome::Removed);
        assert_eq!(store.keys(), vec!["f", "m", "x"]);
        assert_eq!(store.query("x").as_deref(), Some("v-x"));
    }

    #[test]
    fn delete_two_child_entry_uses_direct_right_child() {
        let store = store_with(&["m", "f", "t"]);
        assert_eq!(store.delete("m"), DeleteOutcome::Removed);
        assert_eq!(store.keys(), vec!["f", "t"]);
        assert_eq!(store.query("t").as_deref(), Some("v-t"));
        assert_eq!(store.query("m"), None);
    }

    #[test]
    fn delete_two_child_entry_walks_left_spine() {
        // Successor of "d" is "e", three levels down the left spine of "k".
        let store = store_with(&["d", "a", "k", "h", "f", "e", "g", "z"]);
        assert_eq!(store.delete("d"), DeleteOutcome::Removed);
        assert_eq!(store.keys(), vec!["a", "e", "f", "g", "h", "k", "z"]);
        for key in ["a", "e", "f", "g", "h", "k", "z"] {
            assert_eq!(store.query(key), Some(format!("v-{key}")));
        }
    }

    #[test]
    fn successor_with_right_subtree_is_reattached() {
        let store = store_with(&["d", "b", "k", "f", "g"]);
        // "f" is the successor of "d" and carries right child "g".
        assert_eq!(store.delete("d"), DeleteOutcome::Removed);
        assert_eq!(store.keys(), vec!["b", "f", "g", "k"]);
        assert_eq!(store.query("g").as_deref(), Some("v-g"));
    }

    #[test]
    fn deleting_every_key_empties_the_tree() {
        let keys = ["m", "f", "t", "c", "h", "p", "x", "a", "d"];
        let store = store_with(&keys);
        for key in keys {
            assert_eq!(store.delete(key), DeleteOutcome::Removed);
            let remaining = store.keys();
            assert!(remaining.windows(2).all(|pair| pair[0] < pair[1]));
        }
        assert!(store.is_empty());
    }

    #[test]
    fn dump_is_pre_order_with_null_children() {
        let store = store_with(&["m", "f"]);
        let expected = "(root)\n (null)\n m v-m\n  f v-f\n   (null)\n   (null)\n  (null)\n";
        assert_eq!(dump_to_string(&store), expected);
    }

    #[test]
    fn dump_of_empty_store() {
        let store = OrderedStore::new();
        assert_eq!(dump_to_string(&store), "(root)\n (null)\n (null)\n");
    }

    #[test]
    fn clear_destroys_all_entries() {
        let store = store_with(&["m", "f", "t", "a"]);
        assert_eq!(store.clear(), 4);
        assert!(store.is_empty());
        assert_eq!(store.query("m"), None);
        assert_eq!(store.insert("m", "again"), Ok(InsertOutcome::Inserted));
    }

    #[test]
    fn degenerate_tree_tears_down() {
        let store = OrderedStore::new();
        for i in 0..5_000 {
            store
                .insert(&format!("{i:08}"), "v")
                .expect("valid entry");
        }
        assert_eq!(store.len(), 5_000);
        drop(store);
    }
}
