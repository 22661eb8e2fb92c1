//! Block header/footer layout and linear navigation (`SPEC_FULL.md` §4.3, §6.2).
//!
//! Grounded on `examples/original_source/include/thekogans/util/FileAllocator.h`'s
//! private `BlockInfo::Header`/`Footer` (`{magic?, flags: Flags32, size: ui64}`,
//! `FLAGS_FREE = 1`, `FLAGS_FIXED = 2`) and `IsFirst`/`IsLast`/`Prev`/`Next`.

use byteorder::{ReadBytesExt, WriteBytesExt, LE};

use crate::buffered_file::BufferedFile;
use crate::error::{Error, Result};

pub const MAGIC_BLOCK: u32 = 0x4B4C_4231;

/// magic(4) + flags(4) + size(8).
pub const HEADER_SIZE: u64 = 16;
/// magic(4) + flags(4) + size(8).
pub const FOOTER_SIZE: u64 = 16;
pub const BLOCK_OVERHEAD: u64 = HEADER_SIZE + FOOTER_SIZE;

pub const MIN_USER_DATA_SIZE: u64 = 32;
pub const MIN_BLOCK_SIZE: u64 = BLOCK_OVERHEAD + MIN_USER_DATA_SIZE;

pub const FLAG_FREE: u32 = 1;
pub const FLAG_FIXED: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub offset: u64,
    pub size: u64,
    pub flags: u32,
}

impl BlockInfo {
    pub fn is_free(&self) -> bool {
        self.flags & FLAG_FREE != 0
    }

    pub fn is_fixed(&self) -> bool {
        self.flags & FLAG_FIXED != 0
    }

    pub fn user_data_offset(&self) -> u64 {
        self.offset + HEADER_SIZE
    }

    pub fn footer_offset(&self) -> u64 {
        self.offset + HEADER_SIZE + self.size
    }

    pub fn end_offset(&self) -> u64 {
        self.footer_offset() + FOOTER_SIZE
    }
}

fn encode(flags: u32, size: u64) -> [u8; 16] {
    let mut buf = [0u8; 16];
    {
        let mut cur = &mut buf[..];
        cur.write_u32::<LE>(MAGIC_BLOCK).unwrap();
        cur.write_u32::<LE>(flags).unwrap();
        cur.write_u64::<LE>(size).unwrap();
    }
    buf
}

fn decode(offset: u64, buf: &[u8; 16], what: &'static str) -> Result<(u32, u64)> {
    let mut cur = &buf[..];
    let magic = cur.read_u32::<LE>().unwrap();
    if magic != MAGIC_BLOCK {
        return Err(Error::BlockCorruption {
            offset,
            reason: what,
        });
    }
    let flags = cur.read_u32::<LE>().unwrap();
    let size = cur.read_u64::<LE>().unwrap();
    Ok((flags, size))
}

/// Writes header and footer for a block starting at `offset` with `size`
/// bytes of user data.
pub fn write_block(file: &mut BufferedFile, offset: u64, flags: u32, size: u64) -> Result<()> {
    let buf = encode(flags, size);
    file.write_at(offset, &buf)?;
    file.write_at(offset + HEADER_SIZE + size, &buf)?;
    Ok(())
}

/// Reads header and footer, checking they agree, and returns the resulting
/// `BlockInfo`.
pub fn read_block(file: &mut BufferedFile, offset: u64) -> Result<BlockInfo> {
    let mut hbuf = [0u8; 16];
    file.read_at(offset, &mut hbuf)?;
    let (hflags, hsize) = decode(offset, &hbuf, "bad block header magic")?;

    let mut fbuf = [0u8; 16];
    file.read_at(offset + HEADER_SIZE + hsize, &mut fbuf)?;
    let (fflags, fsize) = decode(offset, &fbuf, "bad block footer magic")?;

    if hflags != fflags || hsize != fsize {
        return Err(Error::BlockCorruption {
            offset,
            reason: "header and footer disagree",
        });
    }
    Ok(BlockInfo {
        offset,
        size: hsize,
        flags: hflags,
    })
}

/// Reads the free-fixed-list next pointer, stored in the first 8 bytes of
/// the user-data region (only meaningful while the block is `FREE|FIXED`).
pub fn read_next_pointer(file: &mut BufferedFile, block: &BlockInfo) -> Result<u64> {
    let mut buf = [0u8; 8];
    file.read_at(block.user_data_offset(), &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub fn write_next_pointer(file: &mut BufferedFile, block: &BlockInfo, next: u64) -> Result<()> {
    file.write_at(block.user_data_offset(), &next.to_le_bytes())?;
    Ok(())
}

pub fn is_first(offset: u64, first_block_offset: u64) -> bool {
    offset == first_block_offset
}

pub fn is_last(block: &BlockInfo, heap_size: u64) -> bool {
    block.end_offset() == heap_size
}

/// Locates the block immediately preceding `offset` by reading the 16-byte
/// footer directly before it. Returns `None` at the start of the heap.
pub fn prev(
    file: &mut BufferedFile,
    offset: u64,
    first_block_offset: u64,
) -> Result<Option<BlockInfo>> {
    if is_first(offset, first_block_offset) {
        return Ok(None);
    }
    let footer_off = offset - FOOTER_SIZE;
    let mut fbuf = [0u8; 16];
    file.read_at(footer_off, &mut fbuf)?;
    let (flags, size) = decode(footer_off, &fbuf, "bad footer magic reading prev block")?;
    let prev_offset = footer_off - size - HEADER_SIZE;
    Ok(Some(BlockInfo {
        offset: prev_offset,
        size,
        flags,
    }))
}

/// Locates the block immediately following `block`. Returns `None` if
/// `block` is the last block in the heap.
pub fn next(file: &mut BufferedFile, block: &BlockInfo, heap_size: u64) -> Result<Option<BlockInfo>> {
    if is_last(block, heap_size) {
        return Ok(None);
    }
    read_block(file, block.end_offset()).map(Some)
}
