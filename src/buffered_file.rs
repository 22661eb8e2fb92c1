//! A seekable byte stream over an OS file with a write-back page cache and
//! an explicit transaction protocol (`SPEC_FULL.md` §4.1).
//!
//! Grounded on `examples/original_source/include/thekogans/util/BufferedFile.h`:
//! `Buffer{offset, length, PAGE_SIZE=0x1000, data, dirty}`, an `OwnerMap`
//! keyed by page offset, and a `CommitLog` path derived from the database
//! path. The log format and recovery-on-open logic live in [`crate::txlog`].

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use fs4::fs_std::FileExt;
use log::{debug, warn};

use crate::error::{Error, Result};
use crate::txlog;

pub const PAGE_SIZE: u64 = 4096;

fn page_offset(offset: u64) -> u64 {
    (offset / PAGE_SIZE) * PAGE_SIZE
}

pub struct Page {
    pub offset: u64,
    pub length: u64,
    pub data: Box<[u8; PAGE_SIZE as usize]>,
    pub dirty: bool,
}

/// An object that caches state derived from a [`BufferedFile`] and knows how
/// to flush that state to it, reload it, or drop it outright.
pub trait Participant {
    fn flush(&mut self) -> Result<()>;
    fn reload(&mut self) -> Result<()>;
    fn reset(&mut self);
}

/// A bracketed sequence of buffered-file writes, made atomic by a side log.
///
/// Long-lived objects subscribe to every transaction on a file (see
/// [`BufferedFile::subscribe`]); objects created mid-transaction enlist only
/// with the transaction in progress via [`Transaction::add_participant`],
/// mirroring the "temporary transaction participant" constructor parameter
/// described in `BufferedFileTransactionParticipant.h`.
#[derive(Default)]
pub struct Transaction {
    participants: Vec<Rc<RefCell<dyn Participant>>>,
}

impl Transaction {
    fn new() -> Self {
        Transaction {
            participants: Vec::new(),
        }
    }

    pub fn add_participant(&mut self, participant: Rc<RefCell<dyn Participant>>) {
        self.participants.push(participant);
    }

    fn notify_flush(&self) -> Result<()> {
        for p in &self.participants {
            p.borrow_mut().flush()?;
        }
        Ok(())
    }

    fn notify_reload(&self) -> Result<()> {
        for p in &self.participants {
            p.borrow_mut().reload()?;
        }
        Ok(())
    }
}

pub struct BufferedFile {
    file: File,
    path: PathBuf,
    pages: BTreeMap<u64, Page>,
    size: u64,
    position: u64,
    subscribers: Vec<Rc<RefCell<dyn Participant>>>,
    transaction: Option<Transaction>,
}

impl BufferedFile {
    pub fn log_path_for(path: &Path) -> PathBuf {
        let mut s = path.as_os_str().to_owned();
        s.push(".log");
        PathBuf::from(s)
    }

    /// Opens (creating if absent) the database file at `path`, replaying or
    /// discarding any pending commit log first.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let log_path = Self::log_path_for(&path);
        match txlog::read_log(&log_path)? {
            Some(records) => {
                debug!("replaying {} page(s) from {}", records.len(), log_path.display());
                let mut main = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(&path)?;
                for record in &records {
                    main.seek(SeekFrom::Start(record.offset))?;
                    main.write_all(&record.bytes)?;
                }
                main.sync_all()?;
                std::fs::remove_file(&log_path)?;
            }
            None => {
                if log_path.exists() {
                    warn!("discarding incomplete commit log {}", log_path.display());
                    std::fs::remove_file(&log_path)?;
                }
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        file.try_lock_exclusive()
            .map_err(|_| Error::Lock { path: path.clone() })?;
        let size = file.metadata()?.len();

        Ok(BufferedFile {
            file,
            path,
            pages: BTreeMap::new(),
            size,
            position: 0,
            subscribers: Vec::new(),
            transaction: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn tell(&self) -> u64 {
        self.position
    }

    pub fn seek(&mut self, offset: i64, whence: SeekFrom) -> Result<u64> {
        let base = match whence {
            SeekFrom::Start(_) => 0,
            SeekFrom::Current(_) => self.position as i64,
            SeekFrom::End(_) => self.size as i64,
        };
        let new_pos = match whence {
            SeekFrom::Start(n) => n as i64,
            _ => base + offset,
        };
        if new_pos < 0 {
            return Err(Error::Logic("seek before start of file"));
        }
        self.position = new_pos as u64;
        Ok(self.position)
    }

    fn ensure_page(&mut self, poff: u64) -> Result<()> {
        if self.pages.contains_key(&poff) {
            return Ok(());
        }
        let mut data = Box::new([0u8; PAGE_SIZE as usize]);
        let length = if poff < self.size {
            let avail = ((self.size - poff).min(PAGE_SIZE)) as usize;
            self.file.seek(SeekFrom::Start(poff))?;
            self.file.read_exact(&mut data[..avail])?;
            avail as u64
        } else {
            0
        };
        self.pages.insert(
            poff,
            Page {
                offset: poff,
                length,
                data,
                dirty: false,
            },
        );
        Ok(())
    }

    /// Positional read, ignoring and not touching `tell()`.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut done = 0usize;
        while done < buf.len() {
            let cur = offset + done as u64;
            let poff = page_offset(cur);
            self.ensure_page(poff)?;
            let page = self.pages.get(&poff).unwrap();
            let in_page = (cur - poff) as usize;
            if in_page as u64 >= page.length {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "read past logical end of file",
                )));
            }
            let avail = (page.length as usize - in_page).min(buf.len() - done);
            buf[done..done + avail].copy_from_slice(&page.data[in_page..in_page + avail]);
            done += avail;
        }
        Ok(())
    }

    /// Positional write, ignoring and not touching `tell()`. Extends the
    /// logical size and allocates new pages as needed.
    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut done = 0usize;
        while done < buf.len() {
            let cur = offset + done as u64;
            let poff = page_offset(cur);
            self.ensure_page(poff)?;
            let page = self.pages.get_mut(&poff).unwrap();
            let in_page = (cur - poff) as usize;
            let avail = (PAGE_SIZE as usize - in_page).min(buf.len() - done);
            page.data[in_page..in_page + avail].copy_from_slice(&buf[done..done + avail]);
            page.dirty = true;
            page.length = page.length.max((in_page + avail) as u64);
            done += avail;
        }
        self.size = self.size.max(offset + buf.len() as u64);
        Ok(())
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        self.read_at(self.position, buf)?;
        self.position += buf.len() as u64;
        Ok(())
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.write_at(self.position, buf)?;
        self.position += buf.len() as u64;
        Ok(())
    }

    /// Truncates the underlying file and clips/evicts pages past `new_size`.
    pub fn set_size(&mut self, new_size: u64) -> Result<()> {
        self.pages.retain(|&poff, page| {
            if poff >= new_size {
                false
            } else {
                page.length = page.length.min(new_size - poff);
                true
            }
        });
        self.file.set_len(new_size)?;
        self.size = new_size;
        if self.position > new_size {
            self.position = new_size;
        }
        Ok(())
    }

    /// Writes all dirty pages directly to the file, bypassing the log. Used
    /// outside of a transaction; does not provide commit atomicity.
    pub fn flush(&mut self) -> Result<()> {
        for page in self.pages.values_mut() {
            if page.dirty {
                self.file.seek(SeekFrom::Start(page.offset))?;
                self.file.write_all(&page.data[..page.length as usize])?;
                page.dirty = false;
            }
        }
        self.file.sync_all()?;
        Ok(())
    }

    /// Registers a long-lived participant notified on every transaction on
    /// this file, for as long as the file lives.
    pub fn subscribe(&mut self, participant: Rc<RefCell<dyn Participant>>) {
        self.subscribers.push(participant);
    }

    pub fn has_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    pub fn begin_transaction(&mut self) -> Result<()> {
        if self.transaction.is_some() {
            return Err(Error::TransactionViolation(
                "a transaction is already active",
            ));
        }
        self.transaction = Some(Transaction::new());
        for p in self.subscribers.clone() {
            p.borrow_mut().flush()?;
        }
        debug!("transaction begin on {}", self.path.display());
        Ok(())
    }

    pub fn add_participant(&mut self, participant: Rc<RefCell<dyn Participant>>) -> Result<()> {
        self.transaction
            .as_mut()
            .ok_or(Error::TransactionViolation("no active transaction"))?
            .add_participant(participant);
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        let txn = self
            .transaction
            .take()
            .ok_or(Error::TransactionViolation("commit with no active transaction"))?;
        for p in self.subscribers.clone() {
            p.borrow_mut().flush()?;
        }
        txn.notify_flush()?;

        let records: Vec<(u64, &[u8])> = self
            .pages
            .values()
            .filter(|p| p.dirty)
            .map(|p| (p.offset, &p.data[..p.length as usize]))
            .collect();

        if !records.is_empty() {
            let log_path = Self::log_path_for(&self.path);
            txlog::write_log(&log_path, &records)?;
            for (offset, bytes) in &records {
                self.file.seek(SeekFrom::Start(*offset))?;
                self.file.write_all(bytes)?;
            }
            self.file.sync_all()?;
            std::fs::remove_file(&log_path)?;
        }

        for page in self.pages.values_mut() {
            page.dirty = false;
        }
        debug!("transaction commit on {}", self.path.display());
        Ok(())
    }

    pub fn abort(&mut self) -> Result<()> {
        let txn = self
            .transaction
            .take()
            .ok_or(Error::TransactionViolation("abort with no active transaction"))?;
        txn.notify_reload()?;
        for p in self.subscribers.clone() {
            p.borrow_mut().reload()?;
        }
        let dirty_offsets: Vec<u64> = self
            .pages
            .iter()
            .filter(|(_, p)| p.dirty)
            .map(|(&o, _)| o)
            .collect();
        for offset in dirty_offsets {
            self.pages.remove(&offset);
        }
        warn!("transaction abort on {}", self.path.display());
        Ok(())
    }
}
