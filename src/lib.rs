//! mftkit - NTFS master file table engine
//!
//! Reads (and in places writes) NTFS structures from a raw volume image or
//! any other positioned byte source.
//!
//! # Features
//!
//! - **Attribute records**: resident and non-resident, parse and write
//! - **Run lists**: decode, encode, cook into VCN to LCN maps across extents
//! - **Compressed streams**: LZNT1 compression units, sparse regions
//! - **Fixup records**: update sequence protection of MFT records and index blocks
//! - **Index trees**: `$I30` and view indexes with pluggable collation
//!
//! # Example
//!
//! ```no_run
//! use mftkit::{NtfsVolume, VolumeConfig};
//! use mftkit::ntfs::source::FileSource;
//! use std::io::Read;
//! use std::sync::Arc;
//!
//! fn main() -> mftkit::Result<()> {
//!     let source = Arc::new(FileSource::open("disk.img", false)?);
//!     let volume = NtfsVolume::open(source, VolumeConfig::default())?;
//!
//!     for entry in volume.read_dir(&volume.root_directory()?)? {
//!         println!("{} {}", entry.name, entry.size);
//!     }
//!
//!     let file = volume.lookup_path("docs/readme.md")?;
//!     let mut text = String::new();
//!     volume.open_data(&file, None)?.read_to_string(&mut text)?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;
pub mod ntfs;
pub mod volume;

// Re-export main types
pub use error::{MftError, Result, StructureKind};
pub use volume::{DirEntry, NtfsVolume, VolumeConfig};

// Re-export NTFS types that users might need
pub use ntfs::{
    AttributeRecord, AttributeType, ContentBuffer, ContentStream, FileRecord, FileReference,
    IndexTree, MasterFileTable, NtfsFile,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Format bytes as human-readable string
pub fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

/// Format a Windows FILETIME as a human-readable date string
pub fn format_filetime(filetime: u64) -> String {
    use ntfs::structs::filetime_to_datetime;
    filetime_to_datetime(filetime).format("%Y-%m-%d %H:%M:%S").to_string()
}
