//! Key/value metadata attached to a texture.
//!
//! Small values live inline in one compressed block; values over the inline
//! threshold are stored as individually compressed large-metadata bodies
//! and fetched lazily on first access. Edit records replay over the base
//! entries at open time, later keys overwriting earlier ones.

use crate::reader::PtexReader;
use byteorder::{ByteOrder, LittleEndian};
use ptex_core::MetaDataType;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::warn;

/// A decoded metadata value.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    /// String value.
    String(String),
    /// Array of i8.
    Int8(Vec<i8>),
    /// Array of i16.
    Int16(Vec<i16>),
    /// Array of i32.
    Int32(Vec<i32>),
    /// Array of f32.
    Float(Vec<f32>),
    /// Array of f64.
    Double(Vec<f64>),
}

pub(crate) struct LargeMeta {
    pub bytes: Vec<u8>,
    pub cache_id: AtomicU64,
}

impl LargeMeta {
    pub(crate) fn cache_id(&self) -> u64 {
        self.cache_id.load(Ordering::Acquire)
    }
}

enum EntryValue {
    Inline(Vec<u8>),
    Large { memsize: u32, zipsize: u32, pos: u64, slot: Mutex<Weak<LargeMeta>> },
}

struct Entry {
    key: String,
    mdt: MetaDataType,
    value: EntryValue,
}

/// All metadata of one texture.
///
/// Obtained from [`PtexReader::get_meta_data`]; values decode on access.
pub struct MetaData {
    reader: Weak<PtexReader>,
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
}

impl MetaData {
    pub(crate) fn new(reader: Weak<PtexReader>) -> Self {
        MetaData { reader, entries: Vec::new(), index: HashMap::new() }
    }

    /// Number of keys present.
    pub fn num_keys(&self) -> usize {
        self.entries.len()
    }

    /// Key and type by index, in file order.
    pub fn key(&self, n: usize) -> Option<(&str, MetaDataType)> {
        self.entries.get(n).map(|e| (e.key.as_str(), e.mdt))
    }

    /// Iterates over `(key, type)` pairs in file order.
    pub fn keys(&self) -> impl Iterator<Item = (&str, MetaDataType)> {
        self.entries.iter().map(|e| (e.key.as_str(), e.mdt))
    }

    /// Declared type of a key.
    pub fn data_type(&self, key: &str) -> Option<MetaDataType> {
        self.index.get(key).map(|&i| self.entries[i].mdt)
    }

    /// Raw value bytes of a key (large values load on demand).
    pub fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        let entry = &self.entries[*self.index.get(key)?];
        match &entry.value {
            EntryValue::Inline(bytes) => Some(bytes.clone()),
            EntryValue::Large { memsize, zipsize, pos, slot } => {
                let mut guard = slot.lock().unwrap();
                if let Some(large) = guard.upgrade() {
                    if let Some(reader) = self.reader.upgrade() {
                        reader.touch_large_meta(&large);
                    }
                    return Some(large.bytes.clone());
                }
                let reader = self.reader.upgrade()?;
                match reader.read_large_meta(*pos, *zipsize, *memsize) {
                    Some(large) => {
                        *guard = Arc::downgrade(&large);
                        Some(large.bytes.clone())
                    }
                    None => None,
                }
            }
        }
    }

    /// Decoded value of a key.
    pub fn get(&self, key: &str) -> Option<MetaValue> {
        let mdt = self.data_type(key)?;
        let bytes = self.get_bytes(key)?;
        Some(decode(mdt, &bytes))
    }

    /// String value of a key.
    pub fn get_string(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            MetaValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// i8 array value of a key.
    pub fn get_i8(&self, key: &str) -> Option<Vec<i8>> {
        match self.get(key)? {
            MetaValue::Int8(v) => Some(v),
            _ => None,
        }
    }

    /// i16 array value of a key.
    pub fn get_i16(&self, key: &str) -> Option<Vec<i16>> {
        match self.get(key)? {
            MetaValue::Int16(v) => Some(v),
            _ => None,
        }
    }

    /// i32 array value of a key.
    pub fn get_i32(&self, key: &str) -> Option<Vec<i32>> {
        match self.get(key)? {
            MetaValue::Int32(v) => Some(v),
            _ => None,
        }
    }

    /// f32 array value of a key.
    pub fn get_f32(&self, key: &str) -> Option<Vec<f32>> {
        match self.get(key)? {
            MetaValue::Float(v) => Some(v),
            _ => None,
        }
    }

    /// f64 array value of a key.
    pub fn get_f64(&self, key: &str) -> Option<Vec<f64>> {
        match self.get(key)? {
            MetaValue::Double(v) => Some(v),
            _ => None,
        }
    }

    fn upsert(&mut self, key: &str, mdt: MetaDataType, value: EntryValue) {
        match self.index.get(key) {
            Some(&i) => {
                self.entries[i].mdt = mdt;
                self.entries[i].value = value;
            }
            None => {
                self.index.insert(key.to_string(), self.entries.len());
                self.entries.push(Entry { key: key.to_string(), mdt, value });
            }
        }
    }

    /// Parses one uncompressed small-metadata block, overwriting existing
    /// keys.
    pub(crate) fn parse_block(&mut self, bytes: &[u8]) {
        let mut p = 0usize;
        while p < bytes.len() {
            let Some((key, mdt)) = parse_entry_head(bytes, &mut p) else { return };
            if p + 4 > bytes.len() {
                warn!("truncated metadata entry");
                return;
            }
            let datasize = LittleEndian::read_u32(&bytes[p..]) as usize;
            p += 4;
            if p + datasize > bytes.len() {
                warn!("truncated metadata value");
                return;
            }
            let data = bytes[p..p + datasize].to_vec();
            p += datasize;
            self.upsert(&key, mdt, EntryValue::Inline(data));
        }
    }

    /// Parses the large-metadata header block; bodies start at `data_pos`
    /// and follow in header order.
    pub(crate) fn parse_large_headers(&mut self, bytes: &[u8], data_pos: u64) {
        let mut p = 0usize;
        let mut pos = data_pos;
        while p < bytes.len() {
            let Some((key, mdt)) = parse_entry_head(bytes, &mut p) else { return };
            if p + 8 > bytes.len() {
                warn!("truncated large metadata header");
                return;
            }
            let memsize = LittleEndian::read_u32(&bytes[p..]);
            let zipsize = LittleEndian::read_u32(&bytes[p + 4..]);
            p += 8;
            self.upsert(
                &key,
                mdt,
                EntryValue::Large { memsize, zipsize, pos, slot: Mutex::new(Weak::new()) },
            );
            pos += zipsize as u64;
        }
    }
}

/// Parses `keysize | key(NUL) | type` and advances `p`; `None` on malformed
/// input.
fn parse_entry_head(bytes: &[u8], p: &mut usize) -> Option<(String, MetaDataType)> {
    if *p + 1 > bytes.len() {
        return None;
    }
    let keysize = bytes[*p] as usize;
    *p += 1;
    if keysize == 0 || *p + keysize + 1 > bytes.len() {
        warn!("malformed metadata key");
        return None;
    }
    // keysize includes the trailing NUL
    let key = String::from_utf8_lossy(&bytes[*p..*p + keysize - 1]).into_owned();
    *p += keysize;
    let mdt = MetaDataType::from_u8(bytes[*p]);
    *p += 1;
    let mdt = match mdt {
        Some(t) => t,
        None => {
            warn!("unknown metadata type tag");
            return None;
        }
    };
    Some((key, mdt))
}

fn decode(mdt: MetaDataType, bytes: &[u8]) -> MetaValue {
    match mdt {
        MetaDataType::String => {
            let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            MetaValue::String(String::from_utf8_lossy(&bytes[..end]).into_owned())
        }
        MetaDataType::Int8 => MetaValue::Int8(bytes.iter().map(|&b| b as i8).collect()),
        MetaDataType::Int16 => {
            MetaValue::Int16(bytes.chunks_exact(2).map(LittleEndian::read_i16).collect())
        }
        MetaDataType::Int32 => {
            MetaValue::Int32(bytes.chunks_exact(4).map(LittleEndian::read_i32).collect())
        }
        MetaDataType::Float => {
            MetaValue::Float(bytes.chunks_exact(4).map(LittleEndian::read_f32).collect())
        }
        MetaDataType::Double => {
            MetaValue::Double(bytes.chunks_exact(8).map(LittleEndian::read_f64).collect())
        }
    }
}

/// Serialises one small-metadata entry in its on-disk form.
pub(crate) fn encode_entry(out: &mut Vec<u8>, key: &str, mdt: MetaDataType, data: &[u8]) {
    out.push((key.len() + 1) as u8);
    out.extend_from_slice(key.as_bytes());
    out.push(0);
    out.push(mdt as u8);
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
}

/// Serialises one large-metadata header entry.
pub(crate) fn encode_large_header(out: &mut Vec<u8>, key: &str, mdt: MetaDataType, memsize: u32, zipsize: u32) {
    out.push((key.len() + 1) as u8);
    out.extend_from_slice(key.as_bytes());
    out.push(0);
    out.push(mdt as u8);
    out.extend_from_slice(&memsize.to_le_bytes());
    out.extend_from_slice(&zipsize.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_parse_and_overwrite() {
        let mut meta = MetaData::new(Weak::new());
        let mut block = Vec::new();
        encode_entry(&mut block, "name", MetaDataType::String, b"alpha\0");
        encode_entry(&mut block, "vals", MetaDataType::Int16, &[2, 0, 4, 0, 6, 0]);
        meta.parse_block(&block);

        assert_eq!(meta.num_keys(), 2);
        assert_eq!(meta.get_string("name").as_deref(), Some("alpha"));
        assert_eq!(meta.get_i16("vals"), Some(vec![2, 4, 6]));
        assert_eq!(meta.get_string("missing"), None);

        // a later block overwrites by key, preserving order
        let mut edit = Vec::new();
        encode_entry(&mut edit, "name", MetaDataType::String, b"beta\0");
        meta.parse_block(&edit);
        assert_eq!(meta.num_keys(), 2);
        assert_eq!(meta.key(0).unwrap().0, "name");
        assert_eq!(meta.get_string("name").as_deref(), Some("beta"));
    }

    #[test]
    fn typed_getters_check_type() {
        let mut meta = MetaData::new(Weak::new());
        let mut block = Vec::new();
        encode_entry(&mut block, "d", MetaDataType::Double, &1.5f64.to_le_bytes());
        meta.parse_block(&block);
        assert_eq!(meta.get_f64("d"), Some(vec![1.5]));
        assert_eq!(meta.get_i32("d"), None);
    }

    #[test]
    fn truncated_block_stops_cleanly() {
        let mut meta = MetaData::new(Weak::new());
        let mut block = Vec::new();
        encode_entry(&mut block, "ok", MetaDataType::Int8, &[1, 2, 3]);
        block.extend_from_slice(&[5, b'x']); // malformed trailer
        meta.parse_block(&block);
        assert_eq!(meta.num_keys(), 1);
        assert_eq!(meta.get_i8("ok"), Some(vec![1, 2, 3]));
    }
}
