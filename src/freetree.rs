//! The allocator's internal free-space B-Tree, keyed on `(size, offset)`
//! (`SPEC_FULL.md` §4.4).
//!
//! Grounded on `examples/original_source/include/thekogans/util/FileAllocatorBTree.h`:
//! a nested B-Tree whose `Entry` holds only a key and a right-child pointer
//! (no value, unlike the user-facing `BTree2`), and whose nodes are
//! allocated through the *fixed*-block path of the owning allocator so the
//! free-list never recurses into itself (`SPEC_FULL.md` §4.5).
//!
//! Node writes go straight through [`crate::buffered_file::BufferedFile`]'s
//! page cache rather than through a separate deferred-write node cache: the
//! page cache already coalesces repeat writes and is what actually rolls
//! back on abort, so a second write-back cache on top of it would just
//! duplicate that job. The one piece of state genuinely kept in memory
//! across calls is `root_offset`, which is why `FreeTree` still needs to be
//! a transaction [`Participant`] (see the `flush`/`reload` impl below).

use std::cell::RefCell;
use std::rc::Rc;

use byteorder::{ReadBytesExt, WriteBytesExt, LE};

use crate::alloc::Core;
use crate::block;
use crate::buffered_file::Participant;
use crate::error::{Error, Result};

const MAGIC_FREETREE_HEADER: u32 = 0x4654_4845;
const MAGIC_FREETREE_NODE: u32 = 0x4654_4E44;

type Key = (u64, u64);

#[derive(Clone, Copy, Debug)]
struct Entry {
    key: Key,
    right_child_offset: u64,
}

struct Node {
    offset: u64,
    left_child_offset: u64,
    entries: Vec<Entry>,
}

impl Node {
    fn is_leaf(&self) -> bool {
        self.left_child_offset == 0 && self.entries.iter().all(|e| e.right_child_offset == 0)
    }

    fn child_at(&self, idx: usize) -> u64 {
        if idx == 0 {
            self.left_child_offset
        } else {
            self.entries[idx - 1].right_child_offset
        }
    }

    /// Returns the index of the first entry with a key `>=` the argument.
    fn partition_point(&self, key: Key) -> usize {
        self.entries.partition_point(|e| e.key < key)
    }
}

/// Payload size of one node's on-disk form: magic + count + left child +
/// `entries_per_node` entries of `{key: (u64,u64), right_child_offset: u64}`.
fn node_payload_size(entries_per_node: u32) -> u64 {
    4 + 4 + 8 + entries_per_node as u64 * 24
}

pub struct FreeTree {
    core: Rc<RefCell<Core>>,
    header_offset: u64,
    entries_per_node: u32,
    root_offset: u64,
}

impl FreeTree {
    pub fn node_file_size(entries_per_node: u32) -> u64 {
        node_payload_size(entries_per_node)
    }

    pub fn header_offset(&self) -> u64 {
        self.header_offset
    }

    pub fn create(core: Rc<RefCell<Core>>, entries_per_node: u32) -> Result<Self> {
        let header_block = core.borrow_mut().alloc_fixed_block()?;
        let root_block = core.borrow_mut().alloc_fixed_block()?;
        write_node(
            &core,
            &Node {
                offset: root_block.offset,
                left_child_offset: 0,
                entries: Vec::new(),
            },
            entries_per_node,
        )?;
        let tree = FreeTree {
            core,
            header_offset: header_block.offset,
            entries_per_node,
            root_offset: root_block.offset,
        };
        tree.write_header()?;
        Ok(tree)
    }

    pub fn open(core: Rc<RefCell<Core>>, header_offset: u64) -> Result<Self> {
        let mut buf = [0u8; 16];
        core.borrow_mut()
            .file
            .read_at(header_offset + block::HEADER_SIZE, &mut buf)?;
        let mut cur = &buf[..];
        let magic = cur.read_u32::<LE>().unwrap();
        if magic != MAGIC_FREETREE_HEADER {
            return Err(Error::BTreeCorruption {
                offset: header_offset,
                reason: "bad free-tree header magic",
            });
        }
        let entries_per_node = cur.read_u32::<LE>().unwrap();
        let root_offset = cur.read_u64::<LE>().unwrap();
        Ok(FreeTree {
            core,
            header_offset,
            entries_per_node,
            root_offset,
        })
    }

    fn write_header(&self) -> Result<()> {
        let mut buf = [0u8; 16];
        {
            let mut cur = &mut buf[..];
            cur.write_u32::<LE>(MAGIC_FREETREE_HEADER).unwrap();
            cur.write_u32::<LE>(self.entries_per_node).unwrap();
            cur.write_u64::<LE>(self.root_offset).unwrap();
        }
        self.core
            .borrow_mut()
            .file
            .write_at(self.header_offset + block::HEADER_SIZE, &buf)
    }

    fn read_node(&self, offset: u64) -> Result<Node> {
        read_node(&self.core, offset, self.entries_per_node)
    }

    fn write_node(&self, node: &Node) -> Result<()> {
        write_node(&self.core, node, self.entries_per_node)
    }

    /// Returns the exact key if present, else the least key strictly
    /// greater than `size` (what variable-block allocation uses).
    pub fn find_at_least(&self, size: u64) -> Result<Option<Key>> {
        let target = (size, 0);
        let mut best: Option<Key> = None;
        let mut offset = self.root_offset;
        while offset != 0 {
            let node = self.read_node(offset)?;
            let idx = node.partition_point(target);
            if idx < node.entries.len() {
                best = Some(node.entries[idx].key);
            }
            offset = node.child_at(idx);
        }
        Ok(best)
    }

    pub fn find_exact(&self, key: Key) -> Result<Option<Key>> {
        let mut offset = self.root_offset;
        while offset != 0 {
            let node = self.read_node(offset)?;
            let idx = node.partition_point(key);
            if idx < node.entries.len() && node.entries[idx].key == key {
                return Ok(Some(key));
            }
            offset = node.child_at(idx);
        }
        Ok(None)
    }

    pub fn insert(&mut self, key: Key) -> Result<()> {
        match self.insert_rec(self.root_offset, key)? {
            InsertOutcome::Done => {}
            InsertOutcome::Overflow(median, right_offset) => {
                let new_root = self.core.borrow_mut().alloc_fixed_block()?;
                self.write_node(&Node {
                    offset: new_root.offset,
                    left_child_offset: self.root_offset,
                    entries: vec![Entry {
                        key: median,
                        right_child_offset: right_offset,
                    }],
                })?;
                self.root_offset = new_root.offset;
                self.write_header()?;
            }
        }
        Ok(())
    }

    fn insert_rec(&mut self, offset: u64, key: Key) -> Result<InsertOutcome> {
        let mut node = self.read_node(offset)?;
        let idx = node.partition_point(key);
        if idx < node.entries.len() && node.entries[idx].key == key {
            return Ok(InsertOutcome::Done); // idempotent duplicate
        }
        let child = node.child_at(idx);
        if child == 0 {
            node.entries.insert(
                idx,
                Entry {
                    key,
                    right_child_offset: 0,
                },
            );
        } else {
            match self.insert_rec(child, key)? {
                InsertOutcome::Done => return Ok(InsertOutcome::Done),
                InsertOutcome::Overflow(median, right_offset) => {
                    node.entries.insert(
                        idx,
                        Entry {
                            key: median,
                            right_child_offset: right_offset,
                        },
                    );
                }
            }
        }

        if node.entries.len() as u32 > self.entries_per_node {
            let mid = node.entries.len() / 2;
            let median = node.entries[mid];
            let right_entries = node.entries.split_off(mid + 1);
            node.entries.truncate(mid);
            let right_block = self.core.borrow_mut().alloc_fixed_block()?;
            let right = Node {
                offset: right_block.offset,
                left_child_offset: median.right_child_offset,
                entries: right_entries,
            };
            self.write_node(&right)?;
            self.write_node(&node)?;
            Ok(InsertOutcome::Overflow(median.key, right.offset))
        } else {
            self.write_node(&node)?;
            Ok(InsertOutcome::Done)
        }
    }

    pub fn remove(&mut self, key: Key) -> Result<bool> {
        let (removed, _) = self.remove_rec(self.root_offset, key)?;
        if removed {
            let root = self.read_node(self.root_offset)?;
            if root.entries.is_empty() && root.left_child_offset != 0 {
                let old_root = self.root_offset;
                self.root_offset = root.left_child_offset;
                self.write_header()?;
                self.core.borrow_mut().free_fixed_block(old_root)?;
            }
        }
        Ok(removed)
    }

    fn remove_rec(&mut self, offset: u64, key: Key) -> Result<(bool, bool)> {
        let mut node = self.read_node(offset)?;
        let idx = node.partition_point(key);
        let found = idx < node.entries.len() && node.entries[idx].key == key;

        if found {
            if node.is_leaf() {
                node.entries.remove(idx);
                let poor = is_poor(node.entries.len(), self.entries_per_node) && offset != self.root_offset;
                self.write_node(&node)?;
                return Ok((true, poor));
            }
            // Replace with the in-order successor, then delete it from the
            // right subtree.
            let successor_subtree = node.entries[idx].right_child_offset;
            let successor = self.leftmost_key(successor_subtree)?;
            node.entries[idx].key = successor;
            self.write_node(&node)?;
            let (_, child_poor) = self.remove_rec(successor_subtree, successor)?;
            if child_poor {
                let child_idx = idx + 1;
                let poor = self.restore_balance(offset, child_idx)?;
                return Ok((true, poor));
            }
            return Ok((true, false));
        }

        if node.is_leaf() {
            return Ok((false, false));
        }
        let child = node.child_at(idx);
        let (removed, child_poor) = self.remove_rec(child, key)?;
        if !removed {
            return Ok((false, false));
        }
        if child_poor {
            let poor = self.restore_balance(offset, idx)?;
            return Ok((true, poor));
        }
        Ok((true, false))
    }

    fn leftmost_key(&self, mut offset: u64) -> Result<Key> {
        loop {
            let node = self.read_node(offset)?;
            if node.left_child_offset == 0 {
                return Ok(node.entries[0].key);
            }
            offset = node.left_child_offset;
        }
    }

    /// Rebalances the child at `child_idx` of the node at `parent_offset`,
    /// which has just become poor. Returns whether `parent` is now poor.
    fn restore_balance(&mut self, parent_offset: u64, child_idx: usize) -> Result<bool> {
        let mut parent = self.read_node(parent_offset)?;
        let child_offset = parent.child_at(child_idx);
        let mut child = self.read_node(child_offset)?;

        let left_sibling_idx = if child_idx > 0 { Some(child_idx - 1) } else { None };
        let right_sibling_idx = if child_idx < parent.entries.len() {
            Some(child_idx)
        } else {
            None
        };

        if let Some(lsi) = left_sibling_idx {
            let left_offset = parent.child_at(lsi);
            let left = self.read_node(left_offset)?;
            if is_plentiful(left.entries.len(), self.entries_per_node) {
                self.rotate_right(&mut parent, lsi, left_offset, left, child_offset, &mut child)?;
                self.write_node(&parent)?;
                return Ok(is_poor(parent.entries.len(), self.entries_per_node) && parent_offset != self.root_offset);
            }
        }
        if let Some(rsi) = right_sibling_idx {
            let right_offset = parent.child_at(rsi + 1);
            let right = self.read_node(right_offset)?;
            if is_plentiful(right.entries.len(), self.entries_per_node) {
                self.rotate_left(&mut parent, rsi, right_offset, right, child_offset, &mut child)?;
                self.write_node(&parent)?;
                return Ok(is_poor(parent.entries.len(), self.entries_per_node) && parent_offset != self.root_offset);
            }
        }

        if let Some(lsi) = left_sibling_idx {
            let left_offset = parent.child_at(lsi);
            let left = self.read_node(left_offset)?;
            self.merge(&mut parent, lsi, left_offset, left, child_offset, child)?;
        } else if let Some(rsi) = right_sibling_idx {
            let right_offset = parent.child_at(rsi + 1);
            let right = self.read_node(right_offset)?;
            self.merge(&mut parent, rsi, child_offset, child, right_offset, right)?;
        } else {
            // A lone root child with no siblings; nothing to do.
            return Ok(false);
        }
        self.write_node(&parent)?;
        Ok(is_poor(parent.entries.len(), self.entries_per_node) && parent_offset != self.root_offset)
    }

    #[allow(clippy::too_many_arguments)]
    fn rotate_right(
        &mut self,
        parent: &mut Node,
        separator_idx: usize,
        left_offset: u64,
        mut left: Node,
        child_offset: u64,
        child: &mut Node,
    ) -> Result<()> {
        let separator = parent.entries[separator_idx];
        let moved = left.entries.pop().unwrap();
        child.entries.insert(
            0,
            Entry {
                key: separator.key,
                right_child_offset: child.left_child_offset,
            },
        );
        child.left_child_offset = moved.right_child_offset;
        parent.entries[separator_idx].key = moved.key;
        self.write_node(&left)?;
        left.offset = left_offset;
        self.write_node(child)?;
        let _ = child_offset;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn rotate_left(
        &mut self,
        parent: &mut Node,
        separator_idx: usize,
        right_offset: u64,
        mut right: Node,
        child_offset: u64,
        child: &mut Node,
    ) -> Result<()> {
        let separator = parent.entries[separator_idx];
        let moved = right.entries.remove(0);
        child.entries.push(Entry {
            key: separator.key,
            right_child_offset: right.left_child_offset,
        });
        right.left_child_offset = moved.right_child_offset;
        parent.entries[separator_idx].key = moved.key;
        self.write_node(&right)?;
        right.offset = right_offset;
        self.write_node(child)?;
        let _ = child_offset;
        Ok(())
    }

    /// Merges `left | separator | right` into `left`, frees `right`, and
    /// removes the separator entry from `parent`.
    fn merge(
        &mut self,
        parent: &mut Node,
        separator_idx: usize,
        left_offset: u64,
        mut left: Node,
        right_offset: u64,
        right: Node,
    ) -> Result<()> {
        let separator = parent.entries.remove(separator_idx);
        left.entries.push(Entry {
            key: separator.key,
            right_child_offset: right.left_child_offset,
        });
        left.entries.extend(right.entries);
        left.offset = left_offset;
        self.write_node(&left)?;
        self.core.borrow_mut().free_fixed_block(right_offset)?;
        Ok(())
    }
}

enum InsertOutcome {
    Done,
    Overflow(Key, u64),
}

fn is_poor(count: usize, entries_per_node: u32) -> bool {
    (count as u32) < entries_per_node / 2
}

fn is_plentiful(count: usize, entries_per_node: u32) -> bool {
    (count as u32) > entries_per_node / 2
}

fn read_node(core: &Rc<RefCell<Core>>, offset: u64, entries_per_node: u32) -> Result<Node> {
    let payload_size = node_payload_size(entries_per_node) as usize;
    let mut buf = vec![0u8; payload_size];
    core.borrow_mut()
        .file
        .read_at(offset + block::HEADER_SIZE, &mut buf)?;
    let mut cur = &buf[..];
    let magic = cur.read_u32::<LE>().unwrap();
    if magic != MAGIC_FREETREE_NODE {
        return Err(Error::BTreeCorruption {
            offset,
            reason: "bad free-tree node magic",
        });
    }
    let count = cur.read_u32::<LE>().unwrap() as usize;
    let left_child_offset = cur.read_u64::<LE>().unwrap();
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let size = cur.read_u64::<LE>().unwrap();
        let key_offset = cur.read_u64::<LE>().unwrap();
        let right_child_offset = cur.read_u64::<LE>().unwrap();
        entries.push(Entry {
            key: (size, key_offset),
            right_child_offset,
        });
    }
    Ok(Node {
        offset,
        left_child_offset,
        entries,
    })
}

fn write_node(core: &Rc<RefCell<Core>>, node: &Node, entries_per_node: u32) -> Result<()> {
    if node.entries.len() as u32 > entries_per_node {
        return Err(Error::Logic("free-tree node overflowed its fixed capacity"));
    }
    let payload_size = node_payload_size(entries_per_node) as usize;
    let mut buf = vec![0u8; payload_size];
    {
        let mut cur = &mut buf[..];
        cur.write_u32::<LE>(MAGIC_FREETREE_NODE).unwrap();
        cur.write_u32::<LE>(node.entries.len() as u32).unwrap();
        cur.write_u64::<LE>(node.left_child_offset).unwrap();
        for e in &node.entries {
            cur.write_u64::<LE>(e.key.0).unwrap();
            cur.write_u64::<LE>(e.key.1).unwrap();
            cur.write_u64::<LE>(e.right_child_offset).unwrap();
        }
    }
    core.borrow_mut()
        .file
        .write_at(node.offset + block::HEADER_SIZE, &buf)
}

impl Participant for FreeTree {
    fn flush(&mut self) -> Result<()> {
        self.write_header()
    }

    fn reload(&mut self) -> Result<()> {
        let tree = FreeTree::open(self.core.clone(), self.header_offset)?;
        self.root_offset = tree.root_offset;
        self.entries_per_node = tree.entries_per_node;
        Ok(())
    }

    fn reset(&mut self) {}
}
