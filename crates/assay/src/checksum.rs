//! Content checksums for chunks and fast checksums for lists of checksums.
//!
//! A chunk checksum never depends on ref numbering: refs contribute the
//! checksum of what they point at. Two structurally identical programs hash
//! the same regardless of where their chunks sit.

use std::fmt;
use std::hash::Hasher;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rustc_hash::FxHasher;
use sha2::{Digest, Sha256};

use crate::code::{Call, Chunk, Code, Ref};
use crate::error::Result;
use crate::types::Type;
use crate::wire::TypedValue;

const CALL_PRIMITIVE: u8 = 1;
const CALL_FUNCTION: u8 = 2;
const CALL_PROPERTY: u8 = 3;

pub fn chunk_checksum(code: &Code, chunk: &Chunk) -> Result<String> {
    let mut hasher = Sha256::new();
    write_bytes(&mut hasher, chunk.id.as_bytes());
    match &chunk.call {
        Call::Primitive(value) => {
            hasher.update([CALL_PRIMITIVE]);
            fold_value(&mut hasher, code, value)?;
        }
        Call::Function(func) => {
            hasher.update([CALL_FUNCTION]);
            write_bytes(&mut hasher, &func.typ.encode());
            match func.binding {
                Some(binding) => {
                    hasher.update([1]);
                    write_bytes(&mut hasher, code.checksum_of(binding)?.as_bytes());
                }
                None => hasher.update([0]),
            }
            write_len(&mut hasher, func.args.len());
            for arg in &func.args {
                fold_value(&mut hasher, code, arg)?;
            }
        }
        Call::Property(typ) => {
            hasher.update([CALL_PROPERTY]);
            write_bytes(&mut hasher, &typ.encode());
        }
    }
    Ok(STANDARD.encode(hasher.finalize()))
}

fn fold_value(hasher: &mut Sha256, code: &Code, value: &TypedValue) -> Result<()> {
    write_bytes(hasher, &value.typ.encode());
    hasher.update([u8::from(value.null)]);
    match &value.typ {
        Type::Ref => {
            let target = referenced(value)?;
            write_bytes(hasher, code.checksum_of(target)?.as_bytes());
        }
        Type::Function(_) => {
            let target = referenced(value)?;
            write_bytes(hasher, code.block_checksum(target)?.as_bytes());
        }
        _ => write_bytes(hasher, &value.value),
    }
    write_len(hasher, value.array.len());
    for item in &value.array {
        fold_value(hasher, code, item)?;
    }
    // BTreeMap iterates in sorted key order.
    write_len(hasher, value.map.len());
    for (key, item) in &value.map {
        write_bytes(hasher, key.as_bytes());
        fold_value(hasher, code, item)?;
    }
    Ok(())
}

fn referenced(value: &TypedValue) -> Result<Ref> {
    crate::wire::decode_uint(&value.value).map(Ref::from_raw)
}

fn write_len(hasher: &mut Sha256, len: usize) {
    hasher.update((len as u64).to_le_bytes());
}

fn write_bytes(hasher: &mut Sha256, bytes: &[u8]) {
    write_len(hasher, bytes.len());
    hasher.update(bytes);
}

/// Order-sensitive fold of strings into a 64-bit fast hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fast(u64);

impl Fast {
    pub fn new() -> Self {
        Fast(0x5bd1_e995_9e37_79b9)
    }

    pub fn add(self, part: &str) -> Self {
        let mut hasher = FxHasher::default();
        hasher.write_u64(self.0);
        hasher.write_usize(part.len());
        hasher.write(part.as_bytes());
        Fast(hasher.finish())
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl Default for Fast {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Fast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&STANDARD.encode(self.0.to_le_bytes()))
    }
}

/// Checksum of an unordered set of option strings.
pub fn option_set_checksum<'a>(options: impl IntoIterator<Item = &'a str>) -> String {
    let mut sorted: Vec<&str> = options.into_iter().collect();
    sorted.sort_unstable();
    sorted.dedup();
    sorted
        .into_iter()
        .fold(Fast::new(), |sum, option| sum.add(option))
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn literal_code(value: i64) -> (Code, Ref) {
        let mut code = Code::new();
        let block = code.add_block();
        let target = code
            .add_chunk(block, Chunk::primitive("", TypedValue::int(value)))
            .unwrap();
        (code, target)
    }

    #[test]
    fn checksums_are_base64_sha256() {
        let (code, target) = literal_code(1);
        let sum = code.checksum_of(target).unwrap();
        assert_eq!(STANDARD.decode(sum).unwrap().len(), 32);
    }

    #[test]
    fn literals_hash_by_content() {
        let (a, a_ref) = literal_code(1);
        let (b, b_ref) = literal_code(1);
        let (c, c_ref) = literal_code(2);
        assert_eq!(a.checksum_of(a_ref).unwrap(), b.checksum_of(b_ref).unwrap());
        assert_ne!(a.checksum_of(a_ref).unwrap(), c.checksum_of(c_ref).unwrap());
    }

    #[test]
    fn refs_hash_by_target_not_position() {
        let (mut shifted, _) = literal_code(9);
        let block = Ref::block(0);
        let one = shifted
            .add_chunk(block, Chunk::primitive("", TypedValue::int(1)))
            .unwrap();
        let pointer = shifted
            .add_chunk(block, Chunk::primitive("", TypedValue::reference(one)))
            .unwrap();

        let (mut plain, one) = literal_code(1);
        let plain_pointer = plain
            .add_chunk(block, Chunk::primitive("", TypedValue::reference(one)))
            .unwrap();

        assert_ne!(pointer, plain_pointer);
        assert_eq!(
            shifted.checksum_of(pointer).unwrap(),
            plain.checksum_of(plain_pointer).unwrap()
        );
    }

    #[test]
    fn missing_target_is_fatal() {
        let code = Code::new();
        let chunk = Chunk::primitive("", TypedValue::reference(Ref::new(4, 4)));
        let err = chunk_checksum(&code, &chunk).unwrap_err();
        assert!(err.is_structural(), "{err:?}");
    }

    #[test]
    fn fast_fold_is_order_sensitive() {
        let ab = Fast::new().add("a").add("b");
        let ba = Fast::new().add("b").add("a");
        assert_ne!(ab, ba);
        assert_eq!(ab, Fast::new().add("a").add("b"));
        assert_eq!(STANDARD.decode(ab.to_string()).unwrap().len(), 8);
    }

    #[test]
    fn option_sets_ignore_order() {
        assert_eq!(
            option_set_checksum(["x", "y"]),
            option_set_checksum(["y", "x", "x"])
        );
    }
}
