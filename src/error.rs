//! Error types for mftkit
//!
//! Every decoder in the crate fails fast with one of these variants. Format
//! errors always carry the kind of structure that was being decoded and the
//! offset it was found at, so a report can tell disk corruption apart from an
//! unsupported format variant.

use std::fmt;
use thiserror::Error;

/// The on-disk structure a format error was raised against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StructureKind {
    BootSector,
    FileRecord,
    IndexBlock,
    IndexRoot,
    IndexNode,
    IndexEntry,
    Attribute,
    RunList,
    AttributeList,
    FileName,
    StandardInformation,
    CompressionUnit,
    UpcaseTable,
    Stream,
}

impl StructureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StructureKind::BootSector => "boot sector",
            StructureKind::FileRecord => "MFT record",
            StructureKind::IndexBlock => "index block",
            StructureKind::IndexRoot => "index root",
            StructureKind::IndexNode => "index node",
            StructureKind::IndexEntry => "index entry",
            StructureKind::Attribute => "attribute record",
            StructureKind::RunList => "run list",
            StructureKind::AttributeList => "attribute list",
            StructureKind::FileName => "file name",
            StructureKind::StandardInformation => "standard information",
            StructureKind::CompressionUnit => "compression unit",
            StructureKind::UpcaseTable => "upcase table",
            StructureKind::Stream => "attribute stream",
        }
    }
}

impl fmt::Display for StructureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for mftkit operations
#[derive(Error, Debug)]
pub enum MftError {
    /// Malformed or inconsistent binary structure
    #[error("Malformed {kind} at offset {offset:#x}: {detail}")]
    Format {
        kind: StructureKind,
        offset: u64,
        detail: String,
    },

    /// Recognized on-disk feature that is not implemented
    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// Key, VCN or path not present
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type alias for mftkit operations
pub type Result<T> = std::result::Result<T, MftError>;

impl MftError {
    /// Build a format error for `kind` at a buffer-relative `offset`
    pub fn format(kind: StructureKind, offset: usize, detail: impl Into<String>) -> Self {
        MftError::Format {
            kind,
            offset: offset as u64,
            detail: detail.into(),
        }
    }

    pub fn unsupported(what: impl Into<String>) -> Self {
        MftError::UnsupportedFeature(what.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        MftError::NotFound(what.into())
    }

    /// Rebase the offset of a format error onto the absolute position of the
    /// buffer it was decoded from. Other variants pass through unchanged.
    pub fn at(self, base: u64) -> Self {
        match self {
            MftError::Format {
                kind,
                offset,
                detail,
            } => MftError::Format {
                kind,
                offset: base + offset,
                detail,
            },
            other => other,
        }
    }

    /// Check if this error reports damaged on-disk data
    pub fn is_corruption(&self) -> bool {
        matches!(self, MftError::Format { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, MftError::NotFound(_))
    }

    /// Check if a walk over many records can skip this error and continue
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MftError::Format { .. } | MftError::NotFound(_) | MftError::UnsupportedFeature(_)
        )
    }
}

impl From<MftError> for std::io::Error {
    fn from(err: MftError) -> Self {
        match err {
            MftError::IoError(e) => e,
            MftError::NotFound(msg) => std::io::Error::new(std::io::ErrorKind::NotFound, msg),
            MftError::UnsupportedFeature(msg) => {
                std::io::Error::new(std::io::ErrorKind::Unsupported, msg)
            }
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_error_names_structure_and_offset() {
        let err = MftError::format(StructureKind::RunList, 0x42, "truncated length field");
        assert_eq!(
            err.to_string(),
            "Malformed run list at offset 0x42: truncated length field"
        );
        assert!(err.is_corruption());
    }

    #[test]
    fn rebase_only_touches_format_errors() {
        let err = MftError::format(StructureKind::FileRecord, 0x1FE, "fixup mismatch").at(0x4000);
        match err {
            MftError::Format { offset, .. } => assert_eq!(offset, 0x41FE),
            other => panic!("unexpected {other:?}"),
        }

        let err = MftError::not_found("vcn 9").at(0x4000);
        assert!(err.is_not_found());
    }

    #[test]
    fn converts_into_io_error_kinds() {
        let io: std::io::Error = MftError::unsupported("write to sparse run").into();
        assert_eq!(io.kind(), std::io::ErrorKind::Unsupported);

        let io: std::io::Error = MftError::format(StructureKind::Stream, 0, "x").into();
        assert_eq!(io.kind(), std::io::ErrorKind::InvalidData);
    }
}
