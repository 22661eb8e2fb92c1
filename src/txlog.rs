//! On-disk commit log format and recovery (`SPEC_FULL.md` §6.5).
//!
//! The log is written once per commit, fsynced, applied to the main file,
//! then deleted. A log present at open time but missing its completion
//! marker is the trace of a crash between "log durable" and "log deleted";
//! it is replayed. A log that can't even be parsed that far is the trace of
//! a crash mid-write and is discarded unreplayed.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use byteorder::{ReadBytesExt, WriteBytesExt, LE};

const MAGIC_HEADER: u32 = 0x4754_474C; // arbitrary log-start sentinel
const MAGIC_COMPLETE: u32 = 0x4754_4345; // arbitrary log-end sentinel
const TAG_RECORD: u8 = 1;
const TAG_END: u8 = 0;

pub struct LogRecord {
    pub offset: u64,
    pub bytes: Vec<u8>,
}

pub fn write_log(path: &Path, records: &[(u64, &[u8])]) -> io::Result<()> {
    let mut f = File::create(path)?;
    f.write_u32::<LE>(MAGIC_HEADER)?;
    for (offset, bytes) in records {
        f.write_u8(TAG_RECORD)?;
        f.write_u64::<LE>(*offset)?;
        f.write_u32::<LE>(bytes.len() as u32)?;
        f.write_all(bytes)?;
    }
    f.write_u8(TAG_END)?;
    f.write_u32::<LE>(MAGIC_COMPLETE)?;
    f.sync_all()?;
    Ok(())
}

/// Returns `Ok(None)` if no log exists, or if it exists but cannot be parsed
/// all the way to a valid completion marker (caller should delete it
/// unreplayed in that case).
pub fn read_log(path: &Path) -> io::Result<Option<Vec<LogRecord>>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut f = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    match try_read_log(&mut f) {
        Ok(records) => Ok(Some(records)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof || e.kind() == io::ErrorKind::InvalidData => {
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn try_read_log(f: &mut File) -> io::Result<Vec<LogRecord>> {
    let magic = f.read_u32::<LE>()?;
    if magic != MAGIC_HEADER {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad log header magic"));
    }
    let mut records = Vec::new();
    loop {
        let tag = f.read_u8()?;
        if tag == TAG_END {
            let complete = f.read_u32::<LE>()?;
            if complete != MAGIC_COMPLETE {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "bad log completion marker"));
            }
            return Ok(records);
        } else if tag == TAG_RECORD {
            let offset = f.read_u64::<LE>()?;
            let length = f.read_u32::<LE>()? as usize;
            let mut bytes = vec![0u8; length];
            f.read_exact(&mut bytes)?;
            records.push(LogRecord { offset, bytes });
        } else {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad log record tag"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Seek;

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");
        let a = vec![1u8, 2, 3];
        let b = vec![4u8; 10];
        write_log(&path, &[(0, &a), (4096, &b)]).unwrap();
        let records = read_log(&path).unwrap().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].offset, 0);
        assert_eq!(records[0].bytes, a);
        assert_eq!(records[1].offset, 4096);
        assert_eq!(records[1].bytes, b);
    }

    #[test]
    fn truncated_log_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");
        write_log(&path, &[(0, &[1, 2, 3])]).unwrap();
        let mut f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        let len = f.metadata().unwrap().len();
        f.set_len(len - 2).unwrap();
        f.seek(std::io::SeekFrom::End(0)).unwrap();
        assert!(read_log(&path).unwrap().is_none());
    }

    #[test]
    fn missing_log_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.log");
        assert!(read_log(&path).unwrap().is_none());
    }
}
