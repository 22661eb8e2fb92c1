//! Primitive wire-format helpers.
//!
//! The on-disk formats in `SPEC_FULL.md` §6 are little-endian fixed-width
//! integers (via `byteorder`) plus LEB128 varints for length prefixes, the
//! one piece of framing left unspecified by the excluded `Serializer`
//! collaborator (§6.6, "the core assumes but does not specify their
//! framing").

use std::io::{self, Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt, LE};

pub fn write_varint<W: Write>(w: &mut W, mut v: u64) -> io::Result<()> {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            w.write_u8(byte | 0x80)?;
        } else {
            w.write_u8(byte)?;
            return Ok(());
        }
    }
}

pub fn read_varint<R: Read>(r: &mut R) -> io::Result<u64> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = r.read_u8()?;
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift >= 64 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "varint too long"));
        }
    }
}

pub fn write_sized_bytes<W: Write>(w: &mut W, bytes: &[u8]) -> io::Result<()> {
    write_varint(w, bytes.len() as u64)?;
    w.write_all(bytes)
}

pub fn read_sized_bytes<R: Read>(r: &mut R) -> io::Result<Vec<u8>> {
    let len = read_varint(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn write_sized_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    write_sized_bytes(w, s.as_bytes())
}

pub fn read_sized_string<R: Read>(r: &mut R) -> io::Result<String> {
    let bytes = read_sized_bytes(r)?;
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

pub fn write_u64<W: Write>(w: &mut W, v: u64) -> io::Result<()> {
    w.write_u64::<LE>(v)
}

pub fn read_u64<R: Read>(r: &mut R) -> io::Result<u64> {
    r.read_u64::<LE>()
}

pub fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_u32::<LE>(v)
}

pub fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    r.read_u32::<LE>()
}

pub fn write_u16<W: Write>(w: &mut W, v: u16) -> io::Result<()> {
    w.write_u16::<LE>(v)
}

pub fn read_u16<R: Read>(r: &mut R) -> io::Result<u16> {
    r.read_u16::<LE>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_round_trip() {
        for v in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, v).unwrap();
            let mut cur = &buf[..];
            assert_eq!(read_varint(&mut cur).unwrap(), v);
        }
    }

    #[test]
    fn sized_string_round_trip() {
        let mut buf = Vec::new();
        write_sized_string(&mut buf, "hello world").unwrap();
        let mut cur = &buf[..];
        assert_eq!(read_sized_string(&mut cur).unwrap(), "hello world");
    }
}
