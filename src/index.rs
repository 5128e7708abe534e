//! B+tree index mapping 64-bit keys to payload uids.
//!
//! Tree nodes are ordinary data items, so every structural change goes
//! through the write-ahead log under the super xid. The tree's stable
//! handle is its boot item: an 8-byte cell holding the current root uid.
//! Only a root split rewrites it, which is what lets the root migrate
//! without invalidating anything a caller holds.

pub mod node;

use crate::data::manager::DataItemHandle;
use crate::data::DataManager;
use crate::transaction::SUPER_XID;
use anyhow::{Context, Result};
use node::{InsertEffect, Node};
use parking_lot::Mutex;

pub use node::KEY_INF;

pub struct BPlusTree {
    dm: DataManager,
    boot_uid: u64,
    // Guards root-uid reads and re-roots; traversal itself takes no tree
    // level lock.
    boot: Mutex<DataItemHandle>,
}

impl BPlusTree {
    /// Builds an empty tree and returns its boot uid, the only handle a
    /// caller ever needs to persist.
    pub fn create(dm: &DataManager) -> Result<u64> {
        let root_uid = dm.insert(SUPER_XID, &node::nil_root_raw())?;
        dm.insert(SUPER_XID, &root_uid.to_le_bytes())
    }

    pub fn load(dm: &DataManager, boot_uid: u64) -> Result<Self> {
        let boot = dm
            .read(boot_uid)?
            .with_context(|| format!("B+tree boot item {} is missing", boot_uid))?;
        Ok(Self {
            dm: dm.clone(),
            boot_uid,
            boot: Mutex::new(boot),
        })
    }

    pub fn boot_uid(&self) -> u64 {
        self.boot_uid
    }

    fn root_uid(&self) -> u64 {
        let boot = self.boot.lock();
        let data = boot.read();
        u64::from_le_bytes(data[..8].try_into().unwrap())
    }

    /// Re-roots the tree after a root split: writes the new internal root,
    /// then atomically repoints the boot item at it.
    fn update_root_uid(&self, left: u64, right: u64, right_key: i64) -> Result<()> {
        let boot = self.boot.lock();
        let new_root = self
            .dm
            .insert(SUPER_XID, &node::root_raw(left, right, right_key))?;
        let mut guard = boot.write();
        guard.data_mut().copy_from_slice(&new_root.to_le_bytes());
        guard.commit(SUPER_XID)
    }

    pub fn search(&self, key: i64) -> Result<Vec<u64>> {
        self.search_range(key, key)
    }

    /// Payload uids of every key in [lo, hi], in key order.
    pub fn search_range(&self, lo: i64, hi: i64) -> Result<Vec<u64>> {
        let root = self.root_uid();
        let mut leaf_uid = self.search_leaf(root, lo)?;
        let mut uids = Vec::new();
        loop {
            let leaf = Node::load(&self.dm, leaf_uid)?;
            let (found, sibling) = leaf.leaf_search_range(lo, hi);
            uids.extend(found);
            if sibling == 0 {
                return Ok(uids);
            }
            leaf_uid = sibling;
        }
    }

    pub fn insert(&self, key: i64, uid: u64) -> Result<()> {
        let root = self.root_uid();
        if let Some((new_node, new_key)) = self.insert_into(root, uid, key)? {
            self.update_root_uid(root, new_node, new_key)?;
        }
        Ok(())
    }

    fn search_leaf(&self, uid: u64, key: i64) -> Result<u64> {
        let node = Node::load(&self.dm, uid)?;
        let is_leaf = node.is_leaf();
        drop(node);

        if is_leaf {
            Ok(uid)
        } else {
            let next = self.search_next(uid, key)?;
            self.search_leaf(next, key)
        }
    }

    // Chases siblings until some node covers `key`; a node that covers
    // nothing here is one that split under a concurrent insert.
    fn search_next(&self, mut uid: u64, key: i64) -> Result<u64> {
        loop {
            let node = Node::load(&self.dm, uid)?;
            let (child, sibling) = node.search_next(key);
            if child != 0 {
                return Ok(child);
            }
            uid = sibling;
        }
    }

    // Recursive insert; a Some return means this level split and the
    // parent must absorb (new_uid, new_key).
    fn insert_into(&self, node_uid: u64, uid: u64, key: i64) -> Result<Option<(u64, i64)>> {
        let node = Node::load(&self.dm, node_uid)?;
        let is_leaf = node.is_leaf();
        drop(node);

        if is_leaf {
            self.insert_and_split(node_uid, uid, key)
        } else {
            let next = self.search_next(node_uid, key)?;
            match self.insert_into(next, uid, key)? {
                Some((new_node, new_key)) => self.insert_and_split(node_uid, new_node, new_key),
                None => Ok(None),
            }
        }
    }

    fn insert_and_split(&self, mut node_uid: u64, uid: u64, key: i64) -> Result<Option<(u64, i64)>> {
        loop {
            let node = Node::load(&self.dm, node_uid)?;
            match node.insert_and_split(&self.dm, uid, key)? {
                InsertEffect::TrySibling(sibling) => node_uid = sibling,
                InsertEffect::Split { new_uid, new_key } => return Ok(Some((new_uid, new_key))),
                InsertEffect::Inserted => return Ok(None),
            }
        }
    }
}
