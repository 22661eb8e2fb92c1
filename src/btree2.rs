//! `BTree2`: the polymorphic, user-facing persistent B-Tree
//! (`SPEC_FULL.md` §3.2, §4.6, §6.3, §6.4).
//!
//! Grounded on `examples/original_source/include/thekogans/util/BTree2.h`:
//! `Header{keyType, valueType, entriesPerNode, rootOffset}`, `Node{count,
//! leftOffset, keyValueOffset, entries[...]}` with keys/values serialized
//! to a side block prefixed by `{version, size}`, and the
//! Insert/Delete/RestoreBalance/RotateLeft/RotateRight/Merge family of
//! node operations. Rust generics over `K: Key, V: Value` stand in for the
//! original's dynamic type-name registry, per the closed-set tagged-variant
//! design note in `SPEC_FULL.md` §9.
//!
//! Like [`crate::freetree::FreeTree`], node and side-block writes go
//! through the buffered-file page cache immediately rather than through a
//! second write-back cache; `root_offset` is the one piece of state kept in
//! Rust memory across calls, which is why `BTree2` is a transaction
//! [`Participant`].

use std::cell::RefCell;
use std::cmp::Ordering;
use std::io::Cursor;
use std::marker::PhantomData;
use std::rc::Rc;

use byteorder::{ReadBytesExt, WriteBytesExt, LE};

use crate::alloc::FileAllocator;
use crate::buffered_file::Participant;
use crate::error::{Error, Result};
use crate::key::Key;
use crate::serialize;
use crate::value::Value;

const MAGIC_BTREE2_HEADER: u32 = 0x4254_3248;
const MAGIC_BTREE2_NODE: u32 = 0x4254_324E;

pub const DEFAULT_ENTRIES_PER_NODE: u32 = 256;

struct Entry<K, V> {
    key: K,
    value: V,
    right_child_offset: u64,
}

impl<K: Clone, V: Clone> Clone for Entry<K, V> {
    fn clone(&self) -> Self {
        Entry {
            key: self.key.clone(),
            value: self.value.clone(),
            right_child_offset: self.right_child_offset,
        }
    }
}

struct Node<K, V> {
    offset: u64,
    left_child_offset: u64,
    key_value_offset: u64,
    entries: Vec<Entry<K, V>>,
}

impl<K: Key, V: Value> Node<K, V> {
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

    fn partition_point(&self, key: &K) -> usize {
        self.entries.partition_point(|e| e.key.compare(key) == Ordering::Less)
    }
}

fn node_fixed_payload_size(entries_per_node: u32) -> u64 {
    4 + 4 + 8 + 8 + entries_per_node as u64 * 8
}

enum InsertOutcome<K, V> {
    Done,
    Duplicate(V),
    Overflow(Entry<K, V>, u64),
}

/// A polymorphic persistent ordered map built on a [`FileAllocator`].
pub struct BTree2<K: Key, V: Value> {
    allocator: Rc<RefCell<FileAllocator>>,
    header_offset: u64,
    /// Byte offset of the trailing `root_offset` field within the header
    /// block, precomputed once: the key/value type names never change after
    /// creation, so this stays valid for the tree's lifetime even though the
    /// allocated header block may carry trailing slack past the payload.
    root_offset_pos: u64,
    entries_per_node: u32,
    root_offset: u64,
    _marker: PhantomData<(K, V)>,
}

impl<K: Key, V: Value> BTree2<K, V> {
    pub fn header_offset(&self) -> u64 {
        self.header_offset
    }

    /// The current root node's block offset. Exposed chiefly so callers can
    /// check the "empty tree still has an allocated root" invariant
    /// (`SPEC_FULL.md` §8).
    pub fn root_offset(&self) -> u64 {
        self.root_offset
    }

    /// Creates a new B-Tree (allocating a header and an empty root node)
    /// and wraps it for transaction-participant registration.
    pub fn create(
        allocator: Rc<RefCell<FileAllocator>>,
        key_type: &str,
        value_type: &str,
        entries_per_node: u32,
    ) -> Result<Rc<RefCell<Self>>> {
        let header_payload = header_payload_size(key_type, value_type);
        let header_offset = allocator.borrow_mut().alloc(header_payload)?;
        let node_payload = node_fixed_payload_size(entries_per_node);
        let root_offset = allocator.borrow_mut().alloc(node_payload)?;
        write_node::<K, V>(
            &allocator,
            &Node {
                offset: root_offset,
                left_child_offset: 0,
                key_value_offset: 0,
                entries: Vec::new(),
            },
            entries_per_node,
        )?;

        let root_offset_pos = header_payload.saturating_sub(8);
        let tree = BTree2 {
            allocator: allocator.clone(),
            header_offset,
            root_offset_pos,
            entries_per_node,
            root_offset,
            _marker: PhantomData,
        };
        tree.write_header(key_type, value_type)?;
        let tree = Rc::new(RefCell::new(tree));
        allocator.borrow_mut().subscribe(tree.clone());
        Ok(tree)
    }

    /// Opens an existing B-Tree whose header lives at `header_offset`.
    pub fn open(allocator: Rc<RefCell<FileAllocator>>, header_offset: u64) -> Result<Rc<RefCell<Self>>> {
        let (entries_per_node, root_offset, root_offset_pos) = read_header(&allocator, header_offset)?;
        let tree = BTree2 {
            allocator: allocator.clone(),
            header_offset,
            root_offset_pos,
            entries_per_node,
            root_offset,
            _marker: PhantomData,
        };
        let tree = Rc::new(RefCell::new(tree));
        allocator.borrow_mut().subscribe(tree.clone());
        Ok(tree)
    }

    fn write_header(&self, key_type: &str, value_type: &str) -> Result<()> {
        let mut buf = Vec::new();
        serialize::write_u32(&mut buf, MAGIC_BTREE2_HEADER).unwrap();
        serialize::write_sized_string(&mut buf, key_type).unwrap();
        serialize::write_sized_string(&mut buf, value_type).unwrap();
        serialize::write_u32(&mut buf, self.entries_per_node).unwrap();
        serialize::write_u64(&mut buf, self.root_offset).unwrap();
        self.allocator.borrow_mut().write_block(self.header_offset, &buf)
    }

    fn flush_root_offset(&self) -> Result<()> {
        let mut buf = [0u8; 8];
        {
            let mut cur = &mut buf[..];
            serialize::write_u64(&mut cur, self.root_offset).unwrap();
        }
        self.allocator
            .borrow_mut()
            .write_block(self.header_offset + self.root_offset_pos, &buf)
    }

    fn read_node(&self, offset: u64) -> Result<Node<K, V>> {
        read_node(&self.allocator, offset, self.entries_per_node)
    }

    fn write_node(&self, node: &Node<K, V>) -> Result<()> {
        write_node(&self.allocator, node, self.entries_per_node)
    }

    pub fn search(&self, key: &K) -> Result<Option<V>> {
        let mut offset = self.root_offset;
        while offset != 0 {
            let node = self.read_node(offset)?;
            let idx = node.partition_point(key);
            if idx < node.entries.len() && node.entries[idx].key.compare(key) == Ordering::Equal {
                return Ok(Some(node.entries[idx].value.clone()));
            }
            offset = node.child_at(idx);
        }
        Ok(None)
    }

    /// Inserts `key -> value`. Returns the prior value on a duplicate key
    /// (the tree is left unchanged in that case), matching the "caller
    /// retains ownership" rule in `SPEC_FULL.md` §9.
    pub fn add(&mut self, key: K, value: V) -> Result<Option<V>> {
        match self.insert_rec(self.root_offset, key, value)? {
            InsertOutcome::Done => Ok(None),
            InsertOutcome::Duplicate(existing) => Ok(Some(existing)),
            InsertOutcome::Overflow(median, right_offset) => {
                let new_root = self
                    .allocator
                    .borrow_mut()
                    .alloc(node_fixed_payload_size(self.entries_per_node))?;
                self.write_node(&Node {
                    offset: new_root,
                    left_child_offset: self.root_offset,
                    key_value_offset: 0,
                    entries: vec![Entry {
                        right_child_offset: right_offset,
                        ..median
                    }],
                })?;
                self.root_offset = new_root;
                self.flush_root_offset()?;
                Ok(None)
            }
        }
    }

    fn insert_rec(&mut self, offset: u64, key: K, value: V) -> Result<InsertOutcome<K, V>> {
        let mut node = self.read_node(offset)?;
        let idx = node.partition_point(&key);
        if idx < node.entries.len() && node.entries[idx].key.compare(&key) == Ordering::Equal {
            return Ok(InsertOutcome::Duplicate(node.entries[idx].value.clone()));
        }
        let child = node.child_at(idx);
        if child == 0 {
            node.entries.insert(
                idx,
                Entry {
                    key,
                    value,
                    right_child_offset: 0,
                },
            );
        } else {
            match self.insert_rec(child, key, value)? {
                InsertOutcome::Done => return Ok(InsertOutcome::Done),
                InsertOutcome::Duplicate(existing) => return Ok(InsertOutcome::Duplicate(existing)),
                InsertOutcome::Overflow(median, right_offset) => {
                    node.entries.insert(
                        idx,
                        Entry {
                            right_child_offset: right_offset,
                            ..median
                        },
                    );
                }
            }
        }

        if node.entries.len() as u32 > self.entries_per_node {
            let mid = node.entries.len() / 2;
            let right_entries = node.entries.split_off(mid + 1);
            let median = node.entries.pop().unwrap();
            let right_offset = self
                .allocator
                .borrow_mut()
                .alloc(node_fixed_payload_size(self.entries_per_node))?;
            let right = Node {
                offset: right_offset,
                left_child_offset: median.right_child_offset,
                key_value_offset: 0,
                entries: right_entries,
            };
            self.write_node(&right)?;
            self.write_node(&node)?;
            Ok(InsertOutcome::Overflow(
                Entry {
                    key: median.key,
                    value: median.value,
                    right_child_offset: 0,
                },
                right_offset,
            ))
        } else {
            self.write_node(&node)?;
            Ok(InsertOutcome::Done)
        }
    }

    pub fn delete(&mut self, key: &K) -> Result<bool> {
        let (removed, _) = self.remove_rec(self.root_offset, key)?;
        if removed {
            let root = self.read_node(self.root_offset)?;
            if root.entries.is_empty() && root.left_child_offset != 0 {
                let old_root = self.root_offset;
                self.root_offset = root.left_child_offset;
                self.flush_root_offset()?;
                self.allocator.borrow_mut().free(old_root)?;
            }
        }
        Ok(removed)
    }

    fn remove_rec(&mut self, offset: u64, key: &K) -> Result<(bool, bool)> {
        let mut node = self.read_node(offset)?;
        let idx = node.partition_point(key);
        let found = idx < node.entries.len() && node.entries[idx].key.compare(key) == Ordering::Equal;

        if found {
            if node.is_leaf() {
                node.entries.remove(idx);
                let poor = is_poor(node.entries.len(), self.entries_per_node) && offset != self.root_offset;
                self.write_node(&node)?;
                return Ok((true, poor));
            }
            let successor_subtree = node.entries[idx].right_child_offset;
            let (successor_key, successor_value) = self.leftmost_entry(successor_subtree)?;
            node.entries[idx].key = successor_key.clone();
            node.entries[idx].value = successor_value;
            self.write_node(&node)?;
            let (_, child_poor) = self.remove_rec(successor_subtree, &successor_key)?;
            if child_poor {
                let poor = self.restore_balance(offset, idx + 1)?;
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

    fn leftmost_entry(&self, mut offset: u64) -> Result<(K, V)> {
        loop {
            let node = self.read_node(offset)?;
            if node.left_child_offset == 0 {
                let e = &node.entries[0];
                return Ok((e.key.clone(), e.value.clone()));
            }
            offset = node.left_child_offset;
        }
    }

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
                self.rotate_right(&mut parent, lsi, left_offset, left, &mut child)?;
                self.write_node(&parent)?;
                return Ok(is_poor(parent.entries.len(), self.entries_per_node) && parent_offset != self.root_offset);
            }
        }
        if let Some(rsi) = right_sibling_idx {
            let right_offset = parent.child_at(rsi + 1);
            let right = self.read_node(right_offset)?;
            if is_plentiful(right.entries.len(), self.entries_per_node) {
                self.rotate_left(&mut parent, rsi, right_offset, right, &mut child)?;
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
            return Ok(false);
        }
        self.write_node(&parent)?;
        Ok(is_poor(parent.entries.len(), self.entries_per_node) && parent_offset != self.root_offset)
    }

    fn rotate_right(
        &mut self,
        parent: &mut Node<K, V>,
        separator_idx: usize,
        left_offset: u64,
        mut left: Node<K, V>,
        child: &mut Node<K, V>,
    ) -> Result<()> {
        let moved = left.entries.pop().unwrap();
        let separator_key = std::mem::replace(&mut parent.entries[separator_idx].key, moved.key.clone());
        let separator_value = std::mem::replace(&mut parent.entries[separator_idx].value, moved.value);
        child.entries.insert(
            0,
            Entry {
                key: separator_key,
                value: separator_value,
                right_child_offset: child.left_child_offset,
            },
        );
        child.left_child_offset = moved.right_child_offset;
        left.offset = left_offset;
        self.write_node(&left)?;
        self.write_node(child)?;
        Ok(())
    }

    fn rotate_left(
        &mut self,
        parent: &mut Node<K, V>,
        separator_idx: usize,
        right_offset: u64,
        mut right: Node<K, V>,
        child: &mut Node<K, V>,
    ) -> Result<()> {
        let moved = right.entries.remove(0);
        let separator_key = std::mem::replace(&mut parent.entries[separator_idx].key, moved.key.clone());
        let separator_value = std::mem::replace(&mut parent.entries[separator_idx].value, moved.value);
        child.entries.push(Entry {
            key: separator_key,
            value: separator_value,
            right_child_offset: right.left_child_offset,
        });
        right.left_child_offset = moved.right_child_offset;
        right.offset = right_offset;
        self.write_node(&right)?;
        self.write_node(child)?;
        Ok(())
    }

    fn merge(
        &mut self,
        parent: &mut Node<K, V>,
        separator_idx: usize,
        left_offset: u64,
        mut left: Node<K, V>,
        right_offset: u64,
        right: Node<K, V>,
    ) -> Result<()> {
        let separator = parent.entries.remove(separator_idx);
        left.entries.push(Entry {
            key: separator.key,
            value: separator.value,
            right_child_offset: right.left_child_offset,
        });
        left.entries.extend(right.entries);
        left.offset = left_offset;
        free_side_block(&self.allocator, &right)?;
        self.write_node(&left)?;
        self.allocator.borrow_mut().free(right_offset)?;
        Ok(())
    }

    /// Drops no in-memory node cache (there isn't one kept across calls);
    /// retained for API parity with the source's `Flush()`, which callers
    /// may still use to force a durable write of the root pointer.
    pub fn flush(&self) -> Result<()> {
        self.flush_root_offset()
    }

    pub fn iter(&self) -> Result<Iter<K, V>> {
        let mut it = Iter {
            allocator: self.allocator.clone(),
            entries_per_node: self.entries_per_node,
            stack: Vec::new(),
            prefix: None,
        };
        it.push_leftmost_initial(self.root_offset)?;
        Ok(it)
    }

    pub fn iter_prefix(&self, prefix: K) -> Result<Iter<K, V>> {
        let mut it = Iter {
            allocator: self.allocator.clone(),
            entries_per_node: self.entries_per_node,
            stack: Vec::new(),
            prefix: Some(prefix),
        };
        it.push_leftmost_initial(self.root_offset)?;
        Ok(it)
    }
}

fn is_poor(count: usize, entries_per_node: u32) -> bool {
    (count as u32) < entries_per_node / 2
}

fn is_plentiful(count: usize, entries_per_node: u32) -> bool {
    (count as u32) > entries_per_node / 2
}

fn header_payload_size(key_type: &str, value_type: &str) -> u64 {
    let mut buf = Vec::new();
    serialize::write_u32(&mut buf, 0).unwrap();
    serialize::write_sized_string(&mut buf, key_type).unwrap();
    serialize::write_sized_string(&mut buf, value_type).unwrap();
    serialize::write_u32(&mut buf, 0).unwrap();
    serialize::write_u64(&mut buf, 0).unwrap();
    buf.len() as u64
}

fn read_block_bytes(allocator: &Rc<RefCell<FileAllocator>>, offset: u64) -> Result<Vec<u8>> {
    let size = allocator.borrow_mut().get_block_size(offset)?;
    let mut buf = vec![0u8; size as usize];
    allocator.borrow_mut().read_block(offset, &mut buf)?;
    Ok(buf)
}

/// Returns `(entries_per_node, root_offset, root_offset_pos)`, where
/// `root_offset_pos` is the byte offset of the trailing root-offset field
/// within the header block (not necessarily the block's full capacity,
/// which may carry allocator slack).
fn read_header(allocator: &Rc<RefCell<FileAllocator>>, offset: u64) -> Result<(u32, u64, u64)> {
    let buf = read_block_bytes(allocator, offset)?;
    let mut cur = Cursor::new(&buf);
    let magic = serialize::read_u32(&mut cur)?;
    if magic != MAGIC_BTREE2_HEADER {
        return Err(Error::BTreeCorruption {
            offset,
            reason: "bad btree2 header magic",
        });
    }
    let _key_type = serialize::read_sized_string(&mut cur)?;
    let _value_type = serialize::read_sized_string(&mut cur)?;
    let entries_per_node = serialize::read_u32(&mut cur)?;
    let root_offset_pos = cur.position();
    let root_offset = serialize::read_u64(&mut cur)?;
    Ok((entries_per_node, root_offset, root_offset_pos))
}

fn read_node<K: Key, V: Value>(
    allocator: &Rc<RefCell<FileAllocator>>,
    offset: u64,
    entries_per_node: u32,
) -> Result<Node<K, V>> {
    let payload_size = node_fixed_payload_size(entries_per_node) as usize;
    let mut buf = vec![0u8; payload_size];
    allocator.borrow_mut().read_block(offset, &mut buf)?;
    let mut cur = &buf[..];
    let magic = cur.read_u32::<LE>().unwrap();
    if magic != MAGIC_BTREE2_NODE {
        return Err(Error::BTreeCorruption {
            offset,
            reason: "bad btree2 node magic",
        });
    }
    let count = cur.read_u32::<LE>().unwrap() as usize;
    let left_child_offset = cur.read_u64::<LE>().unwrap();
    let key_value_offset = cur.read_u64::<LE>().unwrap();
    let mut right_children = Vec::with_capacity(count);
    for _ in 0..count {
        right_children.push(cur.read_u64::<LE>().unwrap());
    }

    let mut entries = Vec::with_capacity(count);
    if count > 0 {
        let side_size = allocator.borrow_mut().get_block_size(key_value_offset)?;
        let mut side_buf = vec![0u8; side_size as usize];
        allocator.borrow_mut().read_block(key_value_offset, &mut side_buf)?;
        let mut side_cur = Cursor::new(&side_buf);
        for &right_child_offset in &right_children {
            let key_version = side_cur.read_u16::<LE>().unwrap();
            let _ = key_version;
            let key_bytes = serialize::read_sized_bytes(&mut side_cur)?;
            let key = K::read(&key_bytes)?;
            let value_version = side_cur.read_u16::<LE>().unwrap();
            let _ = value_version;
            let value_bytes = serialize::read_sized_bytes(&mut side_cur)?;
            let value = V::read(&value_bytes)?;
            entries.push(Entry {
                key,
                value,
                right_child_offset,
            });
        }
    }

    Ok(Node {
        offset,
        left_child_offset,
        key_value_offset,
        entries,
    })
}

fn serialize_side_block<K: Key, V: Value>(node: &Node<K, V>) -> Vec<u8> {
    let mut buf = Vec::new();
    for e in &node.entries {
        serialize::write_u16(&mut buf, K::version()).unwrap();
        let mut key_bytes = Vec::new();
        e.key.write(&mut key_bytes);
        serialize::write_sized_bytes(&mut buf, &key_bytes).unwrap();

        serialize::write_u16(&mut buf, V::version()).unwrap();
        let mut value_bytes = Vec::new();
        e.value.write(&mut value_bytes);
        serialize::write_sized_bytes(&mut buf, &value_bytes).unwrap();
    }
    buf
}

fn free_side_block<K: Key, V: Value>(allocator: &Rc<RefCell<FileAllocator>>, node: &Node<K, V>) -> Result<()> {
    if node.key_value_offset != 0 {
        allocator.borrow_mut().free(node.key_value_offset)?;
    }
    Ok(())
}

fn write_node<K: Key, V: Value>(
    allocator: &Rc<RefCell<FileAllocator>>,
    node: &Node<K, V>,
    entries_per_node: u32,
) -> Result<()> {
    if node.entries.len() as u32 > entries_per_node {
        return Err(Error::Logic("btree2 node overflowed its fixed capacity"));
    }

    let mut key_value_offset = node.key_value_offset;
    if node.entries.is_empty() {
        if key_value_offset != 0 {
            allocator.borrow_mut().free(key_value_offset)?;
            key_value_offset = 0;
        }
    } else {
        let side_bytes = serialize_side_block(node);
        let needed = side_bytes.len() as u64;
        let existing_cap = if key_value_offset != 0 {
            allocator.borrow_mut().get_block_size(key_value_offset)?
        } else {
            0
        };
        if key_value_offset == 0 || existing_cap < needed {
            if key_value_offset != 0 {
                allocator.borrow_mut().free(key_value_offset)?;
            }
            key_value_offset = allocator.borrow_mut().alloc(needed)?;
            let mut padded = side_bytes;
            allocator.borrow_mut().write_block(key_value_offset, &mut padded)?;
        } else {
            let mut padded = vec![0u8; existing_cap as usize];
            padded[..side_bytes.len()].copy_from_slice(&side_bytes);
            allocator.borrow_mut().write_block(key_value_offset, &padded)?;
        }
    }

    let payload_size = node_fixed_payload_size(entries_per_node) as usize;
    let mut buf = vec![0u8; payload_size];
    {
        let mut cur = &mut buf[..];
        cur.write_u32::<LE>(MAGIC_BTREE2_NODE).unwrap();
        cur.write_u32::<LE>(node.entries.len() as u32).unwrap();
        cur.write_u64::<LE>(node.left_child_offset).unwrap();
        cur.write_u64::<LE>(key_value_offset).unwrap();
        for e in &node.entries {
            cur.write_u64::<LE>(e.right_child_offset).unwrap();
        }
    }
    allocator.borrow_mut().write_block(node.offset, &buf)
}

/// In-order (optionally prefix-filtered) iterator. Holds a stack of
/// `(node, index)` frames per `SPEC_FULL.md` §4.6 / §9: it does not survive
/// a mutation of the underlying tree.
pub struct Iter<K: Key, V: Value> {
    allocator: Rc<RefCell<FileAllocator>>,
    entries_per_node: u32,
    stack: Vec<(Node<K, V>, usize)>,
    prefix: Option<K>,
}

impl<K: Key, V: Value> Iter<K, V> {
    fn read_node(&self, offset: u64) -> Result<Node<K, V>> {
        read_node(&self.allocator, offset, self.entries_per_node)
    }

    /// Descends to the first node whose entries could contain the leftmost
    /// match, narrowing by `prefix` at the initial call only: within each
    /// node the partition point on `prefix_compare` already accounts for
    /// all smaller keys, whether they live in this node's entries or in an
    /// earlier subtree.
    fn push_leftmost_initial(&mut self, mut offset: u64) -> Result<()> {
        while offset != 0 {
            let node = self.read_node(offset)?;
            let idx = match &self.prefix {
                None => 0,
                Some(p) => node.entries.partition_point(|e| p.prefix_compare(&e.key) == Ordering::Less),
            };
            let child = node.child_at(idx);
            offset = child;
            self.stack.push((node, idx));
        }
        Ok(())
    }

    fn push_leftmost(&mut self, mut offset: u64) -> Result<()> {
        while offset != 0 {
            let node = self.read_node(offset)?;
            let child = node.child_at(0);
            offset = child;
            self.stack.push((node, 0));
        }
        Ok(())
    }
}

impl<K: Key, V: Value> Iterator for Iter<K, V> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (idx, entries_len) = match self.stack.last() {
                None => return None,
                Some((node, idx)) => (*idx, node.entries.len()),
            };
            if idx >= entries_len {
                self.stack.pop();
                continue;
            }
            let (node, _) = self.stack.last().unwrap();
            let entry = node.entries[idx].clone();
            if let Some(p) = &self.prefix {
                if p.prefix_compare(&entry.key) != Ordering::Equal {
                    self.stack.clear();
                    return None;
                }
            }
            self.stack.last_mut().unwrap().1 += 1;
            let right_child = entry.right_child_offset;
            if let Err(e) = self.push_leftmost(right_child) {
                return Some(Err(e));
            }
            return Some(Ok((entry.key, entry.value)));
        }
    }
}

impl<K: Key, V: Value> Participant for BTree2<K, V> {
    fn flush(&mut self) -> Result<()> {
        self.flush_root_offset()
    }

    fn reload(&mut self) -> Result<()> {
        let (entries_per_node, root_offset, root_offset_pos) = read_header(&self.allocator, self.header_offset)?;
        self.entries_per_node = entries_per_node;
        self.root_offset = root_offset;
        self.root_offset_pos = root_offset_pos;
        Ok(())
    }

    fn reset(&mut self) {}
}
