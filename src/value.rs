//! Polymorphic value types for [`crate::btree2::BTree2`] (`SPEC_FULL.md` §4.6, §4.7).

use std::io;

pub trait Value: Clone {
    fn write(&self, buf: &mut Vec<u8>);
    fn read(buf: &[u8]) -> io::Result<Self>
    where
        Self: Sized;

    fn version() -> u16 {
        1
    }
}

/// An opaque byte payload. `SPEC_FULL.md` §4.7 carries `StringArrayValue`
/// (for the excluded `IgnoreList`) only to the extent BTree2 stores it
/// opaquely; `Bytes` is that opaque storage, usable directly or as the
/// backing representation for a richer value type layered on top.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bytes(pub Vec<u8>);

impl Bytes {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Bytes(bytes.into())
    }
}

impl Value for Bytes {
    fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.0);
    }

    fn read(buf: &[u8]) -> io::Result<Self> {
        Ok(Bytes(buf.to_vec()))
    }
}

/// An ordered, set-semantic list of strings
/// (`SPEC_FULL.md` §4.7's `StringArrayValue`, grounded on the out-of-scope
/// `IgnoreList`'s backing store: BTree2 only needs to serialize and
/// deserialize it, never interpret it).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringArrayValue(pub Vec<String>);

impl StringArrayValue {
    pub fn add(&mut self, s: impl Into<String>) -> bool {
        let s = s.into();
        if self.0.contains(&s) {
            false
        } else {
            self.0.push(s);
            true
        }
    }

    pub fn remove(&mut self, s: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|x| x != s);
        self.0.len() != before
    }

    pub fn contains(&self, s: &str) -> bool {
        self.0.iter().any(|x| x == s)
    }
}

impl Value for StringArrayValue {
    fn write(&self, buf: &mut Vec<u8>) {
        crate::serialize::write_varint(buf, self.0.len() as u64).expect("writing to Vec is infallible");
        for s in &self.0 {
            crate::serialize::write_sized_string(buf, s).expect("writing to Vec is infallible");
        }
    }

    fn read(buf: &[u8]) -> io::Result<Self> {
        let mut cur = buf;
        let count = crate::serialize::read_varint(&mut cur)?;
        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            items.push(crate::serialize::read_sized_string(&mut cur)?);
        }
        Ok(StringArrayValue(items))
    }
}

impl Value for () {
    fn write(&self, _buf: &mut Vec<u8>) {}
    fn read(_buf: &[u8]) -> io::Result<Self> {
        Ok(())
    }
}
