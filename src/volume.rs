//! Volume facade
//!
//! Opens an NTFS image from any byte source: boot sector, `$MFT` bootstrap,
//! `$UpCase`, then path resolution and directory listing through `$I30`
//! index trees.

use crate::error::{MftError, Result, StructureKind};
use crate::ntfs::collation::UpcaseTable;
use crate::ntfs::context::NtfsContext;
use crate::ntfs::file::NtfsFile;
use crate::ntfs::fixup::check_sector_size;
use crate::ntfs::index::{AllocationNodeReader, IndexRoot, IndexTree, NodeReader};
use crate::ntfs::mft::MasterFileTable;
use crate::ntfs::source::ByteSource;
use crate::ntfs::stream::ContentStream;
use crate::ntfs::structs::{
    filetime_to_datetime, system_records, AttributeType, FileNameAttribute, FileReference,
    FilenameNamespace, NtfsBootSector,
};
use serde::Serialize;
use std::sync::Arc;

/// Name of the directory index
pub const DIRECTORY_INDEX_NAME: &str = "$I30";

// ============================================================================
// Configuration
// ============================================================================

/// Volume open options
#[derive(Debug, Clone)]
pub struct VolumeConfig {
    /// Fixup stride; the boot sector's sector size when unset
    pub sector_size: Option<usize>,
    /// Clusters kept by the cluster cache (0 disables it)
    pub cluster_cache: usize,
    /// Parsed MFT records kept in memory
    pub record_cache: usize,
    /// Index nodes kept per directory index
    pub index_cache: usize,
    /// Read `$UpCase` from the volume instead of using the built-in table
    pub load_upcase: bool,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            sector_size: None,
            cluster_cache: 256,
            record_cache: 1024,
            index_cache: 64,
            load_upcase: true,
        }
    }
}

impl VolumeConfig {
    pub fn with_sector_size(mut self, sector_size: usize) -> Self {
        self.sector_size = Some(sector_size);
        self
    }

    pub fn with_upcase(mut self, load: bool) -> Self {
        self.load_upcase = load;
        self
    }
}

// ============================================================================
// Directory entries
// ============================================================================

/// One name in a directory listing, as cached in the index entry
#[derive(Debug, Clone, Serialize)]
pub struct DirEntry {
    pub name: String,
    pub reference: FileReference,
    pub is_directory: bool,
    pub size: u64,
    /// Modification time as FILETIME
    pub modified: u64,
}

impl DirEntry {
    fn from_file_name(name: FileNameAttribute, reference: FileReference) -> Self {
        Self {
            is_directory: name.is_directory(),
            size: name.data_size,
            modified: name.modification_time,
            reference,
            name: name.name,
        }
    }

    pub fn modified_time(&self) -> chrono::DateTime<chrono::Utc> {
        filetime_to_datetime(self.modified)
    }
}

// ============================================================================
// Volume
// ============================================================================

pub struct NtfsVolume {
    boot: NtfsBootSector,
    config: VolumeConfig,
    mft: MasterFileTable,
    upcase: Arc<UpcaseTable>,
}

impl NtfsVolume {
    pub fn open(source: Arc<dyn ByteSource>, config: VolumeConfig) -> Result<Self> {
        let mut raw = vec![0u8; NtfsBootSector::SIZE];
        source.read_at(0, &mut raw)?;
        let boot = NtfsBootSector::from_bytes(&raw)?;

        let sector_size = config
            .sector_size
            .unwrap_or(boot.bytes_per_sector as usize);
        check_sector_size(sector_size, StructureKind::BootSector)?;
        let ctx = Arc::new(
            NtfsContext::new(source, boot.bytes_per_cluster())
                .with_sector_size(sector_size)
                .with_cluster_cache(config.cluster_cache),
        );
        log::debug!(
            "boot sector: {} bytes/cluster, {} bytes/record, MFT at lcn {}",
            boot.bytes_per_cluster(),
            boot.bytes_per_mft_record(),
            boot.mft_cluster_number
        );

        let mft = MasterFileTable::open(
            ctx,
            boot.mft_byte_offset(),
            boot.bytes_per_mft_record() as usize,
            config.record_cache,
        )?;

        let mut volume = Self {
            boot,
            config,
            mft,
            upcase: Arc::new(UpcaseTable::builtin()),
        };
        if volume.config.load_upcase {
            match volume.read_upcase() {
                Ok(table) => volume.upcase = Arc::new(table),
                Err(e) if e.is_recoverable() => {
                    log::warn!("$UpCase unreadable, using built-in table: {}", e)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(volume)
    }

    fn read_upcase(&self) -> Result<UpcaseTable> {
        let file = self.open_file(system_records::UPCASE)?;
        UpcaseTable::from_bytes(&file.read_value(AttributeType::Data, None)?)
    }

    pub fn boot_sector(&self) -> &NtfsBootSector {
        &self.boot
    }

    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<NtfsContext> {
        self.mft.context()
    }

    pub fn mft(&self) -> &MasterFileTable {
        &self.mft
    }

    pub fn mft_mut(&mut self) -> &mut MasterFileTable {
        &mut self.mft
    }

    pub fn upcase(&self) -> &Arc<UpcaseTable> {
        &self.upcase
    }

    pub fn open_file(&self, record_number: u64) -> Result<NtfsFile> {
        NtfsFile::load(&self.mft, record_number)
    }

    pub fn root_directory(&self) -> Result<NtfsFile> {
        self.open_file(system_records::ROOT_DIRECTORY)
    }

    /// The `$I30` index of a directory
    pub fn directory_index(&self, dir: &NtfsFile) -> Result<IndexTree> {
        if !dir.is_directory() {
            return Err(MftError::not_found(format!(
                "record {} is not a directory",
                dir.record_number()
            )));
        }
        let root = IndexRoot::parse(&dir.read_value(AttributeType::IndexRoot, Some(DIRECTORY_INDEX_NAME))?)?;

        let reader: Option<Arc<dyn NodeReader>> =
            if dir.has_attribute(AttributeType::IndexAllocation, Some(DIRECTORY_INDEX_NAME)) {
                let data = dir.open_content(AttributeType::IndexAllocation, Some(DIRECTORY_INDEX_NAME))?;
                Some(Arc::new(AllocationNodeReader::new(
                    data,
                    &root,
                    self.context().bytes_per_cluster(),
                    self.context().sector_size(),
                    self.config.index_cache,
                )))
            } else {
                None
            };
        Ok(IndexTree::from_root(&root, &self.upcase, reader))
    }

    /// Resolve a `/` or `\` separated path from the root directory.
    /// Names compare case-insensitively through the volume's upcase table.
    pub fn lookup_path(&self, path: &str) -> Result<NtfsFile> {
        let mut current = self.root_directory()?;
        for component in path.split(['/', '\\']).filter(|c| !c.is_empty()) {
            let tree = self.directory_index(&current).map_err(|e| match e {
                MftError::NotFound(_) => MftError::not_found(format!("{}: not a directory", path)),
                other => other,
            })?;
            let key = FileNameAttribute::new(current.reference(), component, FilenameNamespace::Win32).to_bytes();
            let entry = tree
                .lookup(&key)?
                .ok_or_else(|| MftError::not_found(format!("{}: no entry named {:?}", path, component)))?;
            let reference = entry
                .file_reference()
                .ok_or_else(|| MftError::not_found(format!("{}: {:?} has no file reference", path, component)))?;

            let next = self.open_file(reference.record_number())?;
            if reference.sequence_number() != 0
                && reference.sequence_number() != next.reference().sequence_number()
            {
                return Err(MftError::not_found(format!(
                    "{}: {:?} points at stale record {}",
                    path, component, reference
                )));
            }
            log::trace!("{:?} -> record {}", component, reference.record_number());
            current = next;
        }
        Ok(current)
    }

    /// Entries of a directory in collation order, without DOS-only aliases
    pub fn read_dir(&self, dir: &NtfsFile) -> Result<Vec<DirEntry>> {
        let tree = self.directory_index(dir)?;
        let mut entries = Vec::new();
        for entry in tree.enumerate() {
            let entry = entry?;
            let Some(reference) = entry.file_reference() else {
                continue;
            };
            if reference.record_number() == dir.record_number() {
                continue;
            }
            let name = entry.file_name()?;
            if !name.namespace.is_displayable() {
                continue;
            }
            entries.push(DirEntry::from_file_name(name, reference));
        }
        Ok(entries)
    }

    /// A `$DATA` stream of a file; `None` is the unnamed stream
    pub fn open_data(&self, file: &NtfsFile, stream: Option<&str>) -> Result<ContentStream> {
        Ok(file.open_content(AttributeType::Data, stream)?.into_stream())
    }
}

impl std::fmt::Debug for NtfsVolume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NtfsVolume")
            .field("boot", &self.boot)
            .field("records", &self.mft.record_count())
            .finish()
    }
}
