//! Index key collation
//!
//! Every index names a collation rule in its root. The rule decides how two
//! raw keys compare; filename collation folds case through the volume's
//! `$UpCase` table.

use crate::error::{MftError, Result, StructureKind};
use crate::ntfs::field;
use crate::ntfs::structs::FileNameAttribute;
use byteorder::{ByteOrder, LittleEndian};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Number of UTF-16 code units covered by a full upcase table
pub const UPCASE_ENTRIES: usize = 0x10000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollationRule {
    Binary,
    Filename,
    UnicodeString,
    UnsignedLong,
    Sid,
    SecurityHash,
    MultipleUnsignedLongs,
}

impl CollationRule {
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            0x00 => Ok(Self::Binary),
            0x01 => Ok(Self::Filename),
            0x02 => Ok(Self::UnicodeString),
            0x10 => Ok(Self::UnsignedLong),
            0x11 => Ok(Self::Sid),
            0x12 => Ok(Self::SecurityHash),
            0x13 => Ok(Self::MultipleUnsignedLongs),
            other => Err(MftError::unsupported(format!("collation rule {:#x}", other))),
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Self::Binary => 0x00,
            Self::Filename => 0x01,
            Self::UnicodeString => 0x02,
            Self::UnsignedLong => 0x10,
            Self::Sid => 0x11,
            Self::SecurityHash => 0x12,
            Self::MultipleUnsignedLongs => 0x13,
        }
    }
}

impl fmt::Display for CollationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Total order over raw index keys
pub trait Collator: Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> Result<Ordering>;
}

// ============================================================================
// Upcase table
// ============================================================================

/// UTF-16 code unit to uppercase mapping (`$UpCase`)
#[derive(Clone)]
pub struct UpcaseTable {
    table: Vec<u16>,
}

impl fmt::Debug for UpcaseTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpcaseTable")
            .field("entries", &self.table.len())
            .finish()
    }
}

impl UpcaseTable {
    /// Decode the `$UpCase` file contents. Units past the end of a short
    /// table map to themselves.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.is_empty() || data.len() % 2 != 0 {
            return Err(MftError::format(
                StructureKind::UpcaseTable,
                0,
                format!("table of {} bytes is not a list of UTF-16 units", data.len()),
            ));
        }
        let table = data
            .chunks_exact(2)
            .take(UPCASE_ENTRIES)
            .map(LittleEndian::read_u16)
            .collect();
        Ok(Self { table })
    }

    /// Table derived from Unicode simple uppercase mappings, used when a
    /// volume's own table cannot be read
    pub fn builtin() -> Self {
        let table = (0..UPCASE_ENTRIES)
            .map(|unit| {
                let unit = unit as u16;
                char::from_u32(unit as u32)
                    .and_then(|c| {
                        let mut upper = c.to_uppercase();
                        match (upper.next(), upper.next()) {
                            (Some(u), None) if (u as u32) <= 0xFFFF => Some(u as u16),
                            _ => None,
                        }
                    })
                    .unwrap_or(unit)
            })
            .collect();
        Self { table }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    #[inline]
    pub fn upcase(&self, unit: u16) -> u16 {
        self.table.get(unit as usize).copied().unwrap_or(unit)
    }

    /// Ordinal comparison after folding both sides
    pub fn compare_units(&self, a: &[u16], b: &[u16]) -> Ordering {
        a.iter()
            .map(|&u| self.upcase(u))
            .cmp(b.iter().map(|&u| self.upcase(u)))
    }

    pub fn compare_names(&self, a: &str, b: &str) -> Ordering {
        a.encode_utf16()
            .map(|u| self.upcase(u))
            .cmp(b.encode_utf16().map(|u| self.upcase(u)))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.table.len() * 2];
        for (i, &unit) in self.table.iter().enumerate() {
            field::put_u16(&mut out, i * 2, unit);
        }
        out
    }
}

// ============================================================================
// Collators
// ============================================================================

/// Byte-wise comparison; also used for SID keys
pub struct BinaryCollator;

impl Collator for BinaryCollator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Result<Ordering> {
        Ok(a.cmp(b))
    }
}

/// `$FILE_NAME` keys, compared by name through the upcase table
pub struct FilenameCollator {
    upcase: Arc<UpcaseTable>,
}

impl FilenameCollator {
    pub fn new(upcase: Arc<UpcaseTable>) -> Self {
        Self { upcase }
    }

    fn name_units(key: &[u8]) -> Result<Vec<u16>> {
        let kind = StructureKind::IndexEntry;
        let length = field::u8_at(key, 0x40, kind)? as usize;
        field::utf16_units_at(key, FileNameAttribute::NAME_OFFSET, length, kind)
    }
}

impl Collator for FilenameCollator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Result<Ordering> {
        let a = Self::name_units(a)?;
        let b = Self::name_units(b)?;
        Ok(self.upcase.compare_units(&a, &b))
    }
}

/// Keys that are a bare UTF-16 string
pub struct UnicodeCollator {
    upcase: Arc<UpcaseTable>,
}

impl UnicodeCollator {
    pub fn new(upcase: Arc<UpcaseTable>) -> Self {
        Self { upcase }
    }
}

impl Collator for UnicodeCollator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Result<Ordering> {
        let units = |k: &[u8]| k.chunks_exact(2).map(LittleEndian::read_u16).collect::<Vec<_>>();
        Ok(self.upcase.compare_units(&units(a), &units(b)))
    }
}

fn u32_words(key: &[u8], count: usize) -> Result<Vec<u32>> {
    (0..count)
        .map(|i| field::u32_at(key, i * 4, StructureKind::IndexEntry))
        .collect()
}

pub struct UnsignedLongCollator;

impl Collator for UnsignedLongCollator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Result<Ordering> {
        Ok(u32_words(a, 1)?.cmp(&u32_words(b, 1)?))
    }
}

/// `$SDH` keys: security hash, then security id
pub struct SecurityHashCollator;

impl Collator for SecurityHashCollator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Result<Ordering> {
        Ok(u32_words(a, 2)?.cmp(&u32_words(b, 2)?))
    }
}

/// Keys made of consecutive u32 values, compared in order
pub struct MultipleUnsignedLongsCollator;

impl Collator for MultipleUnsignedLongsCollator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Result<Ordering> {
        let words = |k: &[u8]| u32_words(k, k.len() / 4);
        Ok(words(a)?.cmp(&words(b)?))
    }
}

pub fn collator_for(rule: CollationRule, upcase: &Arc<UpcaseTable>) -> Arc<dyn Collator> {
    match rule {
        CollationRule::Binary | CollationRule::Sid => Arc::new(BinaryCollator),
        CollationRule::Filename => Arc::new(FilenameCollator::new(Arc::clone(upcase))),
        CollationRule::UnicodeString => Arc::new(UnicodeCollator::new(Arc::clone(upcase))),
        CollationRule::UnsignedLong => Arc::new(UnsignedLongCollator),
        CollationRule::SecurityHash => Arc::new(SecurityHashCollator),
        CollationRule::MultipleUnsignedLongs => Arc::new(MultipleUnsignedLongsCollator),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntfs::structs::{FileReference, FilenameNamespace};

    fn name_key(name: &str) -> Vec<u8> {
        FileNameAttribute::new(FileReference::new(5, 5), name, FilenameNamespace::Win32).to_bytes()
    }

    #[test]
    fn builtin_table_folds_ascii_and_latin() {
        let table = UpcaseTable::builtin();
        assert_eq!(table.len(), UPCASE_ENTRIES);
        assert_eq!(table.upcase('a' as u16), 'A' as u16);
        assert_eq!(table.upcase('é' as u16), 'É' as u16);
        assert_eq!(table.upcase('1' as u16), '1' as u16);
        // ß uppercases to two characters and is left alone
        assert_eq!(table.upcase('ß' as u16), 'ß' as u16);
    }

    #[test]
    fn table_round_trips_and_short_tables_pass_through() {
        let table = UpcaseTable::from_bytes(&UpcaseTable::builtin().to_bytes()).unwrap();
        assert_eq!(table.upcase('z' as u16), 'Z' as u16);

        let short = UpcaseTable::from_bytes(&[0x41, 0x00]).unwrap();
        assert_eq!(short.upcase(0), 'A' as u16);
        assert_eq!(short.upcase('b' as u16), 'b' as u16);

        assert!(UpcaseTable::from_bytes(&[1, 2, 3]).unwrap_err().is_corruption());
    }

    #[test]
    fn filename_collation_ignores_case() {
        let collator = collator_for(CollationRule::Filename, &Arc::new(UpcaseTable::builtin()));
        assert_eq!(collator.compare(&name_key("readme.md"), &name_key("README.MD")).unwrap(), Ordering::Equal);
        assert_eq!(collator.compare(&name_key("a"), &name_key("B")).unwrap(), Ordering::Less);
        assert_eq!(collator.compare(&name_key("ab"), &name_key("a")).unwrap(), Ordering::Greater);
        // '_' (0x5F) sorts after upper-case letters
        assert_eq!(collator.compare(&name_key("_x"), &name_key("z")).unwrap(), Ordering::Greater);
        assert!(collator.compare(&[0u8; 8], &name_key("a")).is_err());
    }

    #[test]
    fn numeric_collations() {
        let upcase = Arc::new(UpcaseTable::builtin());
        let ulong = collator_for(CollationRule::UnsignedLong, &upcase);
        assert_eq!(ulong.compare(&256u32.to_le_bytes(), &2u32.to_le_bytes()).unwrap(), Ordering::Greater);

        let multi = collator_for(CollationRule::MultipleUnsignedLongs, &upcase);
        let key = |a: u32, b: u32| [a.to_le_bytes(), b.to_le_bytes()].concat();
        assert_eq!(multi.compare(&key(1, 9), &key(2, 0)).unwrap(), Ordering::Less);
        assert_eq!(multi.compare(&key(1, 9), &key(1, 9)).unwrap(), Ordering::Equal);

        let hash = collator_for(CollationRule::SecurityHash, &upcase);
        assert_eq!(hash.compare(&key(7, 1), &key(7, 3)).unwrap(), Ordering::Less);
        assert!(hash.compare(&[0u8; 4], &key(0, 0)).is_err());
    }

    #[test]
    fn unknown_rule_is_unsupported() {
        assert!(matches!(CollationRule::from_u32(0x7F), Err(MftError::UnsupportedFeature(_))));
        assert_eq!(CollationRule::from_u32(0x13).unwrap(), CollationRule::MultipleUnsignedLongs);
    }
}
