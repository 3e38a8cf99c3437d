//! NTFS on-disk structures
//!
//! This module provides the storage engine layers, leaf first:
//! - Field readers, run lists and the LZNT1 codec
//! - Attribute records and their extents
//! - Fixup-protected records (MFT records, index blocks)
//! - Logical content buffers over cooked runs
//! - Index trees with collation
//! - The master file table and multi-record files

pub mod attr_list;
pub mod attribute;
pub mod cache;
pub mod collation;
pub mod context;
pub mod field;
pub mod file;
pub mod fixup;
pub mod index;
pub mod lznt1;
pub mod mft;
pub mod runs;
pub mod source;
pub mod stream;
pub mod structs;

// Re-export commonly used types
pub use attr_list::AttributeListEntry;
pub use attribute::{AttributeBody, AttributeRecord, NonResidentData, ResidentData};
pub use cache::{CacheStats, LruCache};
pub use collation::{CollationRule, Collator, UpcaseTable};
pub use context::NtfsContext;
pub use file::{AttributeKey, AttributeRef, NtfsFile};
pub use fixup::{FixupHeader, FixupRecord};
pub use index::{IndexBlock, IndexEntry, IndexNode, IndexRoot, IndexTree, NodeReader};
pub use lznt1::{BlockCompressor, CompressionResult, Lznt1};
pub use mft::{FileRecord, MasterFileTable, RecordStatus};
pub use runs::{CookedRun, CookedRuns, DataRun, ExtentId, LcnMapping, UnitLayout};
pub use source::{ByteSource, FileSource, MemorySource, MmapSource};
pub use stream::{pack_unit, ContentBuffer, ContentStream, NonResidentBuffer, PackedUnit};
pub use structs::{
    AttributeType, FileNameAttribute, FileReference, FilenameNamespace, MftRecordHeader,
    NtfsBootSector, StandardInformation,
};
