//! CAR v1 archives and CID parsing.
//!
//! Commit frames embed the changed records as a content-addressed archive:
//!
//! ```text
//! varint(header_len) | header (CBOR {version: 1, roots: [...]})
//! varint(section_len) | CID | block bytes
//! varint(section_len) | CID | block bytes
//! ...
//! ```
//!
//! Blocks are keyed by the raw binary CID, which is also what a commit op's
//! tag-42 link resolves to once its multibase prefix byte is stripped.

use std::collections::HashMap;

use ciborium::Value;

use crate::{Error, Result};

/// Read an unsigned LEB128 varint, returning the value and bytes consumed.
pub fn read_varint(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, byte) in bytes.iter().enumerate().take(10) {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(Error::Decode("truncated or overlong varint".to_string()))
}

/// Length in bytes of the CID at the start of `bytes`.
///
/// Handles both CIDv0 (a bare sha2-256 multihash) and CIDv1
/// (`version | codec | multihash code | digest length | digest`).
pub fn cid_len(bytes: &[u8]) -> Result<usize> {
    if bytes.len() >= 34 && bytes[0] == 0x12 && bytes[1] == 0x20 {
        return Ok(34);
    }

    let mut offset = 0;
    let (version, n) = read_varint(bytes)?;
    offset += n;
    if version != 1 {
        return Err(Error::Decode(format!("unsupported CID version {}", version)));
    }
    let (_codec, n) = read_varint(&bytes[offset..])?;
    offset += n;
    let (_hash_code, n) = read_varint(&bytes[offset..])?;
    offset += n;
    let (digest_len, n) = read_varint(&bytes[offset..])?;
    offset += n;

    span_end(offset, digest_len, bytes.len(), "CID digest")
}

/// End offset of a `len`-byte span starting at `offset`, bounded by `total`.
fn span_end(offset: usize, len: u64, total: usize, what: &str) -> Result<usize> {
    usize::try_from(len)
        .ok()
        .and_then(|len| offset.checked_add(len))
        .filter(|end| *end <= total)
        .ok_or_else(|| Error::Decode(format!("{} exceeds buffer", what)))
}

/// Blocks of a CAR archive, keyed by binary CID.
#[derive(Debug, Default)]
pub struct BlockMap {
    blocks: HashMap<Vec<u8>, Vec<u8>>,
}

impl BlockMap {
    pub fn get(&self, cid: &[u8]) -> Option<&[u8]> {
        self.blocks.get(cid).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Parse a CAR v1 archive into its blocks.
pub fn read_car(bytes: &[u8]) -> Result<BlockMap> {
    let (header_len, n) = read_varint(bytes)?;
    let header_end = span_end(n, header_len, bytes.len(), "CAR header")?;

    let header: Value = ciborium::de::from_reader(&bytes[n..header_end])
        .map_err(|e| Error::Decode(format!("CAR header: {}", e)))?;
    let version = header
        .as_map()
        .and_then(|m| {
            m.iter()
                .find(|(k, _)| k.as_text() == Some("version"))
                .and_then(|(_, v)| v.as_integer())
        })
        .and_then(|v| i64::try_from(v).ok());
    if version != Some(1) {
        return Err(Error::Decode(format!(
            "unsupported CAR version {:?}",
            version
        )));
    }

    let mut blocks = HashMap::new();
    let mut offset = header_end;
    while offset < bytes.len() {
        let (section_len, n) = read_varint(&bytes[offset..])?;
        offset += n;
        let section_end = span_end(offset, section_len, bytes.len(), "CAR section")?;

        let section = &bytes[offset..section_end];
        let split = cid_len(section)?;
        blocks.insert(section[..split].to_vec(), section[split..].to_vec());
        offset = section_end;
    }

    Ok(BlockMap { blocks })
}
