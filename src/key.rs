//! Polymorphic key types for [`crate::btree2::BTree2`] (`SPEC_FULL.md` §4.6, §4.7).
//!
//! Rust's generics give us a closed-set tagged variant "for free": each
//! `BTree2<K, V>` instantiation is closed over a single concrete `K`, which
//! is the idiomatic replacement the design notes call for in place of the
//! original's dynamic type-name registry (`SPEC_FULL.md` §9).

use std::cmp::Ordering;
use std::io;

pub trait Key: Clone + Ord {
    /// Total order used for tree descent and iteration.
    fn compare(&self, other: &Self) -> Ordering {
        self.cmp(other)
    }

    /// `Equal` iff `self` is a prefix of `candidate`.
    fn prefix_compare(&self, candidate: &Self) -> Ordering;

    fn write(&self, buf: &mut Vec<u8>);
    fn read(buf: &[u8]) -> io::Result<Self>
    where
        Self: Sized;

    fn version() -> u16 {
        1
    }
}

/// Ordered lexicographically; `ignore_case` is a per-query flag, never
/// persisted (`examples/original_source/include/thekogans/util/BTreeKeys.h`'s
/// `StringKey::ignoreCase`).
#[derive(Debug, Clone)]
pub struct StringKey {
    pub value: String,
    pub ignore_case: bool,
}

impl StringKey {
    pub fn new(value: impl Into<String>) -> Self {
        StringKey {
            value: value.into(),
            ignore_case: false,
        }
    }

    pub fn ignore_case(value: impl Into<String>) -> Self {
        StringKey {
            value: value.into(),
            ignore_case: true,
        }
    }

    fn cmp_str(&self, other: &str) -> Ordering {
        if self.ignore_case {
            self.value.to_lowercase().cmp(&other.to_lowercase())
        } else {
            self.value.as_str().cmp(other)
        }
    }
}

impl PartialEq for StringKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp_str(&other.value) == Ordering::Equal
    }
}
impl Eq for StringKey {}

impl PartialOrd for StringKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for StringKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_str(&other.value)
    }
}

impl Key for StringKey {
    fn prefix_compare(&self, candidate: &Self) -> Ordering {
        let prefix = if self.ignore_case {
            self.value.to_lowercase()
        } else {
            self.value.clone()
        };
        let target = if self.ignore_case {
            candidate.value.to_lowercase()
        } else {
            candidate.value.clone()
        };
        let prefix_bytes = prefix.as_bytes();
        let target_bytes = target.as_bytes();
        if target_bytes.len() < prefix_bytes.len() {
            return target_bytes.cmp(prefix_bytes);
        }
        target_bytes[..prefix_bytes.len()].cmp(prefix_bytes)
    }

    fn write(&self, buf: &mut Vec<u8>) {
        crate::serialize::write_sized_string(buf, &self.value).expect("writing to Vec is infallible");
    }

    fn read(buf: &[u8]) -> io::Result<Self> {
        let mut cur = buf;
        let value = crate::serialize::read_sized_string(&mut cur)?;
        Ok(StringKey {
            value,
            ignore_case: false,
        })
    }
}

/// A 16-byte identifier ordered by its hex encoding
/// (`BTreeKeys.h`'s `GUIDKey`, which precomputes `hexString` at construction
/// rather than re-deriving it on every comparison).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuidKey {
    pub bytes: [u8; 16],
    hex: String,
    pub prefix_len: usize,
}

impl GuidKey {
    pub fn new(bytes: [u8; 16]) -> Self {
        let hex = hex_encode(&bytes);
        let prefix_len = hex.len();
        GuidKey {
            bytes,
            hex,
            prefix_len,
        }
    }

    pub fn with_prefix_len(bytes: [u8; 16], prefix_len: usize) -> Self {
        let mut k = GuidKey::new(bytes);
        k.prefix_len = prefix_len.min(k.hex.len());
        k
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl PartialOrd for GuidKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for GuidKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.hex.cmp(&other.hex)
    }
}

impl Key for GuidKey {
    fn prefix_compare(&self, candidate: &Self) -> Ordering {
        let prefix = &self.hex[..self.prefix_len.min(self.hex.len())];
        let target_len = self.prefix_len.min(candidate.hex.len());
        candidate.hex[..target_len].cmp(prefix)
    }

    fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.bytes);
    }

    fn read(buf: &[u8]) -> io::Result<Self> {
        if buf.len() < 16 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "short GUID key"));
        }
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&buf[..16]);
        Ok(GuidKey::new(bytes))
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(s, "{:02x}", b).unwrap();
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_key_prefix_compare() {
        let prefix = StringKey::new("ban");
        assert_eq!(prefix.prefix_compare(&StringKey::new("banana")), Ordering::Equal);
        assert_eq!(prefix.prefix_compare(&StringKey::new("apple")), Ordering::Less);
    }

    #[test]
    fn string_key_ignore_case() {
        let a = StringKey::ignore_case("Alpha");
        let b = StringKey::new("alpha");
        assert_eq!(a.cmp_str(&b.value), Ordering::Equal);
    }

    #[test]
    fn guid_key_orders_by_hex() {
        let a = GuidKey::new([0u8; 16]);
        let mut bytes = [0u8; 16];
        bytes[15] = 1;
        let b = GuidKey::new(bytes);
        assert!(a < b);
    }
}
