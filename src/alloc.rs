//! `FileAllocator`: the block-level free-space allocator (`SPEC_FULL.md` §4.3, §4.5).
//!
//! Grounded on `examples/original_source/include/thekogans/util/FileAllocator.h`'s
//! `Header{flags, blockSize, freeBlockOffset, btreeOffset, rootOffset}`,
//! `Pool` (path-keyed singleton registry) and `Flusher` (RAII cache-flush
//! guard). Block offsets here are the offset of a block's *header* (a
//! simplification relative to the original, which hands callers a
//! user-data pointer and derives the header at `offset - HEADER_SIZE`; see
//! `DESIGN.md`).

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use log::debug;

use crate::block::{self, BlockInfo, BLOCK_OVERHEAD, FLAG_FIXED, FLAG_FREE, MIN_BLOCK_SIZE};
use crate::buffered_file::{BufferedFile, Participant};
use crate::error::{Error, Result};
use crate::freetree::FreeTree;

pub const MAGIC_HEADER: u32 = 0x464C_4143;
pub const HEADER_SIZE: u64 = 40;
pub const HEADER_FLAG_FIXED: u32 = 1;

/// First valid block offset: right past the 40-byte allocator header.
pub const FIRST_BLOCK_OFFSET: u64 = HEADER_SIZE;

pub const DEFAULT_ENTRIES_PER_NODE: u32 = 256;

#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub flags: u32,
    pub block_size: u64,
    pub free_block_offset: u64,
    pub btree_offset: u64,
    pub root_offset: u64,
}

impl Header {
    fn is_fixed(&self) -> bool {
        self.flags & HEADER_FLAG_FIXED != 0
    }

    fn read(file: &mut BufferedFile) -> Result<Self> {
        let mut buf = [0u8; HEADER_SIZE as usize];
        file.read_at(0, &mut buf)?;
        let mut cur = &buf[..];
        let magic = cur.read_u32::<LE>().unwrap();
        if magic != MAGIC_HEADER {
            return Err(Error::BlockCorruption {
                offset: 0,
                reason: "bad file allocator header magic",
            });
        }
        let flags = cur.read_u32::<LE>().unwrap();
        let block_size = cur.read_u64::<LE>().unwrap();
        let free_block_offset = cur.read_u64::<LE>().unwrap();
        let btree_offset = cur.read_u64::<LE>().unwrap();
        let root_offset = cur.read_u64::<LE>().unwrap();
        Ok(Header {
            flags,
            block_size,
            free_block_offset,
            btree_offset,
            root_offset,
        })
    }

    fn write(&self, file: &mut BufferedFile) -> Result<()> {
        let mut buf = [0u8; HEADER_SIZE as usize];
        {
            let mut cur = &mut buf[..];
            cur.write_u32::<LE>(MAGIC_HEADER).unwrap();
            cur.write_u32::<LE>(self.flags).unwrap();
            cur.write_u64::<LE>(self.block_size).unwrap();
            cur.write_u64::<LE>(self.free_block_offset).unwrap();
            cur.write_u64::<LE>(self.btree_offset).unwrap();
            cur.write_u64::<LE>(self.root_offset).unwrap();
        }
        file.write_at(0, &buf)?;
        Ok(())
    }
}

/// Shared state behind `FileAllocator` and its internal `FreeTree`, broken
/// out so the two can both reach the buffered file and the fixed-block
/// arena without a reference cycle.
pub(crate) struct Core {
    pub file: BufferedFile,
    pub header: Header,
}

impl Core {
    fn heap_size(&self) -> u64 {
        self.file.size()
    }

    fn write_header(&mut self) -> Result<()> {
        self.header.write(&mut self.file)
    }

    /// Pops the head of the free-fixed list, or extends the file by one
    /// block footprint. Never touches the free-space B-Tree.
    pub(crate) fn alloc_fixed_block(&mut self) -> Result<BlockInfo> {
        let block_size = self.header.block_size;
        if self.header.free_block_offset != 0 {
            let offset = self.header.free_block_offset;
            let block = block::read_block(&mut self.file, offset)?;
            if block.flags != FLAG_FREE | FLAG_FIXED {
                return Err(Error::BlockCorruption {
                    offset,
                    reason: "free-fixed list entry has unexpected flags",
                });
            }
            let next = block::read_next_pointer(&mut self.file, &block)?;
            self.header.free_block_offset = next;
            self.write_header()?;
            block::write_block(&mut self.file, offset, FLAG_FIXED, block.size)?;
            return Ok(BlockInfo {
                offset,
                size: block.size,
                flags: FLAG_FIXED,
            });
        }
        let offset = self.heap_size();
        block::write_block(&mut self.file, offset, FLAG_FIXED, block_size)?;
        debug!("alloc_fixed_block: extended heap, new block at 0x{:x}", offset);
        Ok(BlockInfo {
            offset,
            size: block_size,
            flags: FLAG_FIXED,
        })
    }

    /// Pushes `offset` onto the head of the free-fixed list.
    pub(crate) fn free_fixed_block(&mut self, offset: u64) -> Result<()> {
        let block = block::read_block(&mut self.file, offset)?;
        if block.is_free() {
            return Err(Error::Logic("double free of an already-free block"));
        }
        let head = self.header.free_block_offset;
        block::write_block(&mut self.file, offset, FLAG_FREE | FLAG_FIXED, block.size)?;
        block::write_next_pointer(
            &mut self.file,
            &BlockInfo {
                offset,
                size: block.size,
                flags: FLAG_FREE | FLAG_FIXED,
            },
            head,
        )?;
        self.header.free_block_offset = offset;
        self.write_header()
    }
}

/// The free-space allocator over a single host file.
pub struct FileAllocator {
    core: Rc<RefCell<Core>>,
    free_tree: Option<Rc<RefCell<FreeTree>>>,
}

impl FileAllocator {
    /// Opens or creates a variable-size heap at `path`: blocks of arbitrary
    /// size are tracked by an internal free-space B-Tree.
    pub fn open_variable(path: impl AsRef<Path>, entries_per_node: u32) -> Result<Self> {
        let mut file = BufferedFile::open(path)?;
        let is_new = file.size() == 0;
        let header = if is_new {
            let h = Header {
                flags: 0,
                block_size: 0,
                free_block_offset: 0,
                btree_offset: 0,
                root_offset: 0,
            };
            h.write(&mut file)?;
            h
        } else {
            Header::read(&mut file)?
        };
        if header.is_fixed() {
            return Err(Error::Logic("file was created as a fixed-size heap"));
        }
        let core = Rc::new(RefCell::new(Core { file, header }));

        let node_block_size = FreeTree::node_file_size(entries_per_node);
        {
            let mut c = core.borrow_mut();
            if c.header.block_size == 0 {
                c.header.block_size = node_block_size;
                c.write_header()?;
            }
        }

        let free_tree = if is_new {
            let ft = FreeTree::create(core.clone(), entries_per_node)?;
            let mut c = core.borrow_mut();
            c.header.btree_offset = ft.header_offset();
            c.write_header()?;
            ft
        } else {
            FreeTree::open(core.clone(), core.borrow().header.btree_offset)?
        };
        let free_tree = Rc::new(RefCell::new(free_tree));
        core.borrow_mut().file.subscribe(free_tree.clone());

        Ok(FileAllocator {
            core,
            free_tree: Some(free_tree),
        })
    }

    /// Opens or creates a fixed-size heap at `path`: every block has the
    /// same `block_size`, managed purely via the free-fixed linked list.
    pub fn open_fixed(path: impl AsRef<Path>, block_size: u64) -> Result<Self> {
        let mut file = BufferedFile::open(path)?;
        let is_new = file.size() == 0;
        let header = if is_new {
            let h = Header {
                flags: HEADER_FLAG_FIXED,
                block_size,
                free_block_offset: 0,
                btree_offset: 0,
                root_offset: 0,
            };
            h.write(&mut file)?;
            h
        } else {
            let h = Header::read(&mut file)?;
            if !h.is_fixed() {
                return Err(Error::Logic("file was created as a variable-size heap"));
            }
            h
        };
        let core = Rc::new(RefCell::new(Core { file, header }));
        Ok(FileAllocator {
            core,
            free_tree: None,
        })
    }

    pub fn path(&self) -> PathBuf {
        self.core.borrow().file.path().to_path_buf()
    }

    pub fn get_root_offset(&self) -> u64 {
        self.core.borrow().header.root_offset
    }

    pub fn set_root_offset(&mut self, offset: u64) -> Result<()> {
        let mut core = self.core.borrow_mut();
        core.header.root_offset = offset;
        core.write_header()
    }

    pub fn begin_transaction(&mut self) -> Result<()> {
        self.core.borrow_mut().file.begin_transaction()
    }

    pub fn commit(&mut self) -> Result<()> {
        self.core.borrow_mut().file.commit()
    }

    /// Aborting discards dirty pages (reverting the on-disk header), but the
    /// in-memory `Header` cached on `Core` is not itself a transaction
    /// participant (subscribing it would mean a `Core` reloading itself from
    /// inside its own `BufferedFile::abort`, a reentrant borrow of the same
    /// `RefCell`), so it is re-read explicitly here to restore §8's "abort
    /// leaves in-memory state equal to what it was at begin" invariant.
    pub fn abort(&mut self) -> Result<()> {
        let mut core = self.core.borrow_mut();
        core.file.abort()?;
        core.header = Header::read(&mut core.file)?;
        Ok(())
    }

    pub fn flush_btree(&mut self) -> Result<()> {
        if let Some(ft) = &self.free_tree {
            ft.borrow_mut().flush()?;
        }
        Ok(())
    }

    /// Registers a long-lived transaction participant (e.g. a
    /// [`crate::btree2::BTree2`] built on this heap) on the underlying file.
    pub fn subscribe(&mut self, participant: Rc<RefCell<dyn Participant>>) {
        self.core.borrow_mut().file.subscribe(participant);
    }

    /// Allocates a block of at least `size` usable bytes, returning its
    /// offset. Dispatches on whether this heap is fixed or variable.
    pub fn alloc(&mut self, size: u64) -> Result<u64> {
        if size == 0 {
            return Err(Error::Logic("cannot allocate zero bytes"));
        }
        let is_fixed = self.core.borrow().header.is_fixed();
        if is_fixed {
            Ok(self.core.borrow_mut().alloc_fixed_block()?.offset)
        } else {
            self.alloc_variable(size)
        }
    }

    pub fn free(&mut self, offset: u64) -> Result<()> {
        let is_fixed = self.core.borrow().header.is_fixed();
        if is_fixed {
            self.core.borrow_mut().free_fixed_block(offset)
        } else {
            self.free_variable(offset)
        }
    }

    pub fn get_block_info(&mut self, offset: u64) -> Result<BlockInfo> {
        block::read_block(&mut self.core.borrow_mut().file, offset)
    }

    pub fn get_block_size(&mut self, offset: u64) -> Result<u64> {
        let info = self.get_block_info(offset)?;
        Ok(if info.is_free() { 0 } else { info.size })
    }

    pub fn read_block(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut core = self.core.borrow_mut();
        core.file.read_at(offset + crate::block::HEADER_SIZE, buf)
    }

    pub fn write_block(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut core = self.core.borrow_mut();
        core.file.write_at(offset + crate::block::HEADER_SIZE, buf)
    }

    pub(crate) fn core(&self) -> Rc<RefCell<Core>> {
        self.core.clone()
    }

    fn alloc_variable(&mut self, size: u64) -> Result<u64> {
        let free_tree = self
            .free_tree
            .as_ref()
            .expect("variable heap always has a free tree")
            .clone();
        let found = free_tree.borrow_mut().find_at_least(size)?;
        if let Some((found_size, found_offset)) = found {
            free_tree.borrow_mut().remove((found_size, found_offset))?;
            let remaining = found_size - size;
            let mut core = self.core.borrow_mut();
            if remaining >= MIN_BLOCK_SIZE {
                let tail_offset = found_offset + crate::block::HEADER_SIZE + size + crate::block::FOOTER_SIZE;
                let tail_size = remaining - BLOCK_OVERHEAD;
                block::write_block(&mut core.file, found_offset, 0, size)?;
                block::write_block(&mut core.file, tail_offset, FLAG_FREE, tail_size)?;
                drop(core);
                free_tree.borrow_mut().insert((tail_size, tail_offset))?;
            } else {
                block::write_block(&mut core.file, found_offset, 0, found_size)?;
            }
            return Ok(found_offset);
        }
        let mut core = self.core.borrow_mut();
        let offset = core.heap_size();
        let block_size = size.max(crate::block::MIN_USER_DATA_SIZE);
        block::write_block(&mut core.file, offset, 0, block_size)?;
        debug!("alloc_variable: extended heap, new block at 0x{:x}", offset);
        Ok(offset)
    }

    fn free_variable(&mut self, offset: u64) -> Result<()> {
        let free_tree = self
            .free_tree
            .as_ref()
            .expect("variable heap always has a free tree")
            .clone();

        // A trailing free block's region is truncated away by a prior free
        // (see below), so a block whose header offset lands at or past the
        // current heap end can't be a live block to read header/footer
        // from: it's a double free of an already-reclaimed block, not an
        // I/O error.
        if offset >= self.core.borrow().heap_size() {
            return Err(Error::Logic("double free of an already-free block"));
        }

        let mut block = {
            let mut core = self.core.borrow_mut();
            block::read_block(&mut core.file, offset)?
        };
        if block.is_free() {
            return Err(Error::Logic("double free of an already-free block"));
        }

        let first_block_offset = FIRST_BLOCK_OFFSET;

        // Merge with the previous block if it is free.
        {
            let prev = {
                let mut core = self.core.borrow_mut();
                block::prev(&mut core.file, block.offset, first_block_offset)?
            };
            if let Some(p) = prev {
                if p.is_free() && !p.is_fixed() {
                    free_tree.borrow_mut().remove((p.size, p.offset))?;
                    let merged_size = p.size + BLOCK_OVERHEAD + block.size;
                    block = BlockInfo {
                        offset: p.offset,
                        size: merged_size,
                        flags: block.flags,
                    };
                }
            }
        }

        // Merge with the next block if it is free.
        loop {
            let heap_size = self.core.borrow().file.size();
            let next = {
                let mut core = self.core.borrow_mut();
                block::next(&mut core.file, &block, heap_size)?
            };
            match next {
                Some(n) if n.is_free() && !n.is_fixed() => {
                    free_tree.borrow_mut().remove((n.size, n.offset))?;
                    let merged_size = block.size + BLOCK_OVERHEAD + n.size;
                    block = BlockInfo {
                        offset: block.offset,
                        size: merged_size,
                        flags: block.flags,
                    };
                }
                _ => break,
            }
        }

        let mut core = self.core.borrow_mut();
        let heap_size = core.file.size();
        if block::is_last(&block, heap_size) {
            core.file.set_size(block.offset)?;
            debug!("free_variable: truncated trailing free block, heap now 0x{:x}", block.offset);
            return Ok(());
        }
        block::write_block(&mut core.file, block.offset, FLAG_FREE, block.size)?;
        drop(core);
        free_tree.borrow_mut().insert((block.size, block.offset))
    }
}

/// A process-wide registry of `FileAllocator`s keyed by absolute file path,
/// so repeated opens of the same database share one handle
/// (`SPEC_FULL.md` §5, "Shared-resource policy").
#[derive(Default)]
pub struct Pool {
    allocators: Mutex<HashMap<PathBuf, Arc<Mutex<FileAllocator>>>>,
}

impl Pool {
    pub fn new() -> Self {
        Pool {
            allocators: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_variable(&self, path: impl AsRef<Path>, entries_per_node: u32) -> Result<Arc<Mutex<FileAllocator>>> {
        let path = path.as_ref().to_path_buf();
        let mut map = self.allocators.lock().unwrap();
        if let Some(existing) = map.get(&path) {
            return Ok(existing.clone());
        }
        let allocator = Arc::new(Mutex::new(FileAllocator::open_variable(&path, entries_per_node)?));
        map.insert(path, allocator.clone());
        Ok(allocator)
    }

    pub fn flush(&self, path: Option<&Path>) -> Result<()> {
        let map = self.allocators.lock().unwrap();
        match path {
            Some(p) => {
                if let Some(a) = map.get(p) {
                    a.lock().unwrap().flush_btree()?;
                }
            }
            None => {
                for a in map.values() {
                    a.lock().unwrap().flush_btree()?;
                }
            }
        }
        Ok(())
    }
}

/// RAII guard that flushes an allocator's free-tree cache on drop, ensuring
/// dirty B-Tree state is committed even on an early return or error path.
pub struct Flusher<'a> {
    allocator: &'a mut FileAllocator,
}

impl<'a> Flusher<'a> {
    pub fn new(allocator: &'a mut FileAllocator) -> Self {
        Flusher { allocator }
    }
}

impl<'a> Drop for Flusher<'a> {
    fn drop(&mut self) {
        let _ = self.allocator.flush_btree();
    }
}

impl<'a> std::ops::Deref for Flusher<'a> {
    type Target = FileAllocator;
    fn deref(&self) -> &FileAllocator {
        self.allocator
    }
}

impl<'a> std::ops::DerefMut for Flusher<'a> {
    fn deref_mut(&mut self) -> &mut FileAllocator {
        self.allocator
    }
}
