//! Chunk file format.
//!
//! A chunk is `CHUNK_MAGIC`, a little-endian `u16` version, then the
//! bincode encoding of the string table and the root prototype.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::assembler::{AsmError, AsmPrototype, Assembler, MAX_NESTED_LEVEL};
use crate::string_table::StringTable;

pub const CHUNK_MAGIC: &[u8; 4] = b"STRD";
pub const CHUNK_VERSION: u16 = 1;

const HEADER_LEN: usize = CHUNK_MAGIC.len() + 2;

#[derive(Serialize)]
struct ChunkBody<'a> {
    strings: &'a StringTable,
    root: &'a AsmPrototype,
}

#[derive(Deserialize)]
struct OwnedChunkBody {
    strings: StringTable,
    root: AsmPrototype,
}

impl Assembler {
    /// Encode the whole module, regardless of the cursor.
    pub fn save(&self) -> Result<Vec<u8>, AsmError> {
        let body = bincode::serialize(&ChunkBody {
            strings: &self.strings,
            root: &self.root,
        })?;
        let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
        bytes.extend_from_slice(CHUNK_MAGIC);
        bytes.extend_from_slice(&CHUNK_VERSION.to_le_bytes());
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    /// Decode a module. The cursor starts at the root.
    pub fn load(bytes: &[u8]) -> Result<Self, AsmError> {
        if bytes.len() < HEADER_LEN || &bytes[..CHUNK_MAGIC.len()] != CHUNK_MAGIC {
            return Err(AsmError::BadMagic);
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != CHUNK_VERSION {
            return Err(AsmError::UnsupportedVersion(version));
        }
        let body: OwnedChunkBody = bincode::deserialize(&bytes[HEADER_LEN..])?;
        if nesting_depth(&body.root) > MAX_NESTED_LEVEL {
            return Err(AsmError::NestingTooDeep {
                max: MAX_NESTED_LEVEL,
            });
        }
        Ok(Self::from_parts(body.strings, body.root))
    }

    /// Write the module to `path`, creating parent directories as needed.
    pub fn save_to(&self, path: &Path) -> Result<(), AsmError> {
        let bytes = self.save()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, &bytes)?;
        tracing::debug!(path = %path.display(), bytes = bytes.len(), "chunk saved");
        Ok(())
    }

    pub fn load_from(path: &Path) -> Result<Self, AsmError> {
        let bytes = fs::read(path)?;
        let assembler = Self::load(&bytes)?;
        tracing::debug!(path = %path.display(), bytes = bytes.len(), "chunk loaded");
        Ok(assembler)
    }
}

/// Depth of the deepest prototype below `root`, which is depth 0.
fn nesting_depth(root: &AsmPrototype) -> usize {
    let mut deepest = 0;
    let mut pending = vec![(root, 0)];
    while let Some((prototype, depth)) = pending.pop() {
        deepest = deepest.max(depth);
        pending.extend(prototype.nesteds.iter().map(|nested| (nested, depth + 1)));
    }
    deepest
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_vm::Instruction;

    #[test]
    fn test_header_layout() {
        let bytes = Assembler::new().save().unwrap();
        assert_eq!(&bytes[..4], CHUNK_MAGIC);
        assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), CHUNK_VERSION);
    }

    #[test]
    fn test_save_ignores_cursor() {
        let mut a = Assembler::new();
        a.set_symbol("root");
        a.push().unwrap();
        a.emit(Instruction::Ret);

        let loaded = Assembler::load(&a.save().unwrap()).unwrap();
        assert_eq!(loaded.depth(), 0);
        assert_eq!(loaded.strings().get(loaded.prototype().symbol), Some("root"));
        assert_eq!(loaded.prototype().nesteds[0].instructions, vec![Instruction::Ret]);
    }

    #[test]
    fn test_rejects_bad_header() {
        assert!(matches!(Assembler::load(b"STR"), Err(AsmError::BadMagic)));
        assert!(matches!(Assembler::load(b"XXXX\x01\x00"), Err(AsmError::BadMagic)));
        assert!(matches!(
            Assembler::load(b"STRD\x09\x00"),
            Err(AsmError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_truncated_body_is_codec_error() {
        let mut a = Assembler::new();
        a.emit(Instruction::Nop);
        let bytes = a.save().unwrap();
        let cut = &bytes[..bytes.len() - 1];
        assert!(matches!(Assembler::load(cut), Err(AsmError::Codec(_))));
    }

    fn nested_chain(depth: usize) -> AsmPrototype {
        let mut prototype = AsmPrototype::default();
        for _ in 0..depth {
            prototype = AsmPrototype {
                nesteds: vec![prototype],
                ..Default::default()
            };
        }
        prototype
    }

    #[test]
    fn test_load_rejects_excess_nesting() {
        let deepest = Assembler::from_parts(StringTable::default(), nested_chain(MAX_NESTED_LEVEL));
        let loaded = Assembler::load(&deepest.save().unwrap()).unwrap();
        assert_eq!(nesting_depth(&loaded.root), MAX_NESTED_LEVEL);

        let too_deep = Assembler::from_parts(StringTable::default(), nested_chain(MAX_NESTED_LEVEL + 12));
        assert!(matches!(
            Assembler::load(&too_deep.save().unwrap()),
            Err(AsmError::NestingTooDeep { max: MAX_NESTED_LEVEL })
        ));
    }
}
