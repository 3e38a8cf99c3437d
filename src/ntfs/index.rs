//! B+tree indexes
//!
//! Directory contents (and a few system views) are stored as a tree of
//! sorted entries. The root node lives in the resident `$INDEX_ROOT`
//! attribute; deeper nodes are fixup-protected `INDX` blocks inside
//! `$INDEX_ALLOCATION`, addressed by VCN.
//!
//! Index entry layout:
//! - 0x00: file reference, or data offset (u16) and data length (u16)
//! - 0x08: entry length (u16)
//! - 0x0A: key length (u16)
//! - 0x0C: flags (u16)
//! - 0x10: key, then inline data for view indexes
//! - last 8 bytes: child node VCN when the node flag is set

use crate::error::{MftError, Result, StructureKind};
use crate::ntfs::cache::LruCache;
use crate::ntfs::collation::{collator_for, CollationRule, Collator, UpcaseTable};
use crate::ntfs::field::{self, round_up};
use crate::ntfs::fixup::{FixupHeader, FixupRecord};
use crate::ntfs::stream::ContentBuffer;
use crate::ntfs::structs::{AttributeType, FileNameAttribute, FileReference, INDEX_BLOCK_SIGNATURE};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

/// Deepest descent accepted before a tree is treated as cyclic
pub const MAX_INDEX_DEPTH: usize = 64;

pub mod index_entry_flags {
    pub const NODE: u16 = 0x0001;
    pub const END: u16 = 0x0002;
}

pub mod index_node_flags {
    pub const HAS_CHILDREN: u8 = 0x01;
}

const ENTRY_HEADER_SIZE: usize = 0x10;
const NODE_HEADER_SIZE: usize = 0x10;
const ROOT_HEADER_SIZE: usize = 0x10;
const BLOCK_NODE_OFFSET: usize = 0x18;
const BLOCK_USA_OFFSET: u16 = 0x28;

/// How the first eight bytes of an entry are used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryLayout {
    /// `$FILE_NAME` indexes: a file reference
    FileName,
    /// View indexes: offset and length of inline data
    Data,
}

impl EntryLayout {
    pub fn for_indexed_type(attr_type: AttributeType) -> Self {
        match attr_type {
            AttributeType::FileName => EntryLayout::FileName,
            _ => EntryLayout::Data,
        }
    }
}

// ============================================================================
// Index Entry
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryValue {
    FileReference(FileReference),
    Data(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: Vec<u8>,
    pub value: EntryValue,
    /// VCN of the node holding keys that sort before this entry
    pub child: Option<u64>,
    /// Terminates a node; carries no key
    pub is_end: bool,
}

impl IndexEntry {
    pub fn file(key: Vec<u8>, reference: FileReference) -> Self {
        Self {
            key,
            value: EntryValue::FileReference(reference),
            child: None,
            is_end: false,
        }
    }

    /// Entry of a view index, carrying its value inline
    pub fn view(key: Vec<u8>, data: Vec<u8>) -> Self {
        Self {
            key,
            value: EntryValue::Data(data),
            child: None,
            is_end: false,
        }
    }

    pub fn end(layout: EntryLayout) -> Self {
        let value = match layout {
            EntryLayout::FileName => EntryValue::FileReference(FileReference::default()),
            EntryLayout::Data => EntryValue::Data(Vec::new()),
        };
        Self {
            key: Vec::new(),
            value,
            child: None,
            is_end: true,
        }
    }

    pub fn with_child(mut self, vcn: u64) -> Self {
        self.child = Some(vcn);
        self
    }

    pub fn parse(buf: &[u8], offset: usize, layout: EntryLayout) -> Result<(Self, usize)> {
        let kind = StructureKind::IndexEntry;
        let head = field::u64_at(buf, offset, kind)?;
        let length = field::u16_at(buf, offset + 0x08, kind)? as usize;
        let key_length = field::u16_at(buf, offset + 0x0A, kind)? as usize;
        let flags = field::u16_at(buf, offset + 0x0C, kind)?;

        let is_node = flags & index_entry_flags::NODE != 0;
        let is_end = flags & index_entry_flags::END != 0;
        let min_length = ENTRY_HEADER_SIZE + if is_node { 8 } else { 0 };
        if length < min_length {
            return Err(MftError::format(
                kind,
                offset + 0x08,
                format!("entry length {} is below the minimum {}", length, min_length),
            ));
        }
        let entry = field::slice_at(buf, offset, length, kind)?;
        let body_end = length - if is_node { 8 } else { 0 };

        let key = if is_end {
            Vec::new()
        } else {
            if ENTRY_HEADER_SIZE + key_length > body_end {
                return Err(MftError::format(
                    kind,
                    offset + 0x0A,
                    format!("key of {} bytes runs past entry length {}", key_length, length),
                ));
            }
            entry[ENTRY_HEADER_SIZE..ENTRY_HEADER_SIZE + key_length].to_vec()
        };

        let value = match layout {
            EntryLayout::FileName => EntryValue::FileReference(FileReference(head)),
            EntryLayout::Data if is_end => EntryValue::Data(Vec::new()),
            EntryLayout::Data => {
                let data_offset = (head & 0xFFFF) as usize;
                let data_length = ((head >> 16) & 0xFFFF) as usize;
                if data_offset + data_length > body_end {
                    return Err(MftError::format(
                        kind,
                        offset,
                        format!(
                            "data of {} bytes at {:#x} runs past entry length {}",
                            data_length, data_offset, length
                        ),
                    ));
                }
                EntryValue::Data(entry[data_offset..data_offset + data_length].to_vec())
            }
        };

        let child = if is_node {
            Some(field::u64_at(entry, length - 8, kind)?)
        } else {
            None
        };

        Ok((
            Self {
                key,
                value,
                child,
                is_end,
            },
            length,
        ))
    }

    pub fn size(&self) -> usize {
        let inline = match &self.value {
            EntryValue::Data(data) => data.len(),
            EntryValue::FileReference(_) => 0,
        };
        round_up(ENTRY_HEADER_SIZE + self.key.len() + inline, 8) + if self.child.is_some() { 8 } else { 0 }
    }

    pub fn write(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        let length = self.size();
        if offset + length > buf.len() {
            return Err(MftError::format(
                StructureKind::IndexEntry,
                offset,
                format!("{} byte entry does not fit in {}-byte buffer", length, buf.len()),
            ));
        }
        let entry = &mut buf[offset..offset + length];
        entry.fill(0);

        let key_end = ENTRY_HEADER_SIZE + self.key.len();
        match &self.value {
            EntryValue::FileReference(reference) => field::put_u64(entry, 0x00, reference.0),
            EntryValue::Data(data) => {
                if !data.is_empty() {
                    field::put_u16(entry, 0x00, key_end as u16);
                    field::put_u16(entry, 0x02, data.len() as u16);
                    entry[key_end..key_end + data.len()].copy_from_slice(data);
                }
            }
        }
        field::put_u16(entry, 0x08, length as u16);
        field::put_u16(entry, 0x0A, self.key.len() as u16);

        let mut flags = 0;
        if self.child.is_some() {
            flags |= index_entry_flags::NODE;
        }
        if self.is_end {
            flags |= index_entry_flags::END;
        }
        field::put_u16(entry, 0x0C, flags);
        entry[ENTRY_HEADER_SIZE..key_end].copy_from_slice(&self.key);
        if let Some(vcn) = self.child {
            field::put_u64(entry, length - 8, vcn);
        }
        Ok(length)
    }

    pub fn file_reference(&self) -> Option<FileReference> {
        match self.value {
            EntryValue::FileReference(reference) => Some(reference),
            EntryValue::Data(_) => None,
        }
    }

    pub fn data(&self) -> Option<&[u8]> {
        match &self.value {
            EntryValue::Data(data) => Some(data),
            EntryValue::FileReference(_) => None,
        }
    }

    /// Decode the key of a directory entry
    pub fn file_name(&self) -> Result<FileNameAttribute> {
        FileNameAttribute::from_bytes(&self.key)
    }
}

// ============================================================================
// Index Node
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexNode {
    /// Space reserved for entries, node header included
    pub allocated_size: u32,
    pub flags: u8,
    pub entries: Vec<IndexEntry>,
}

impl IndexNode {
    /// A node from `entries`, which must end with an end entry
    pub fn new(entries: Vec<IndexEntry>) -> Self {
        let flags = if entries.iter().any(|e| e.child.is_some()) {
            index_node_flags::HAS_CHILDREN
        } else {
            0
        };
        let mut node = Self {
            allocated_size: 0,
            flags,
            entries,
        };
        node.allocated_size = node.used_size(NODE_HEADER_SIZE) as u32;
        node
    }

    /// Parse the node whose header is at `offset`
    pub fn parse(buf: &[u8], offset: usize, layout: EntryLayout) -> Result<Self> {
        let kind = StructureKind::IndexNode;
        let first_entry = field::u32_at(buf, offset, kind)? as usize;
        let total_size = field::u32_at(buf, offset + 0x04, kind)? as usize;
        let allocated_size = field::u32_at(buf, offset + 0x08, kind)?;
        let flags = field::u8_at(buf, offset + 0x0C, kind)?;

        if first_entry < NODE_HEADER_SIZE || first_entry > total_size {
            return Err(MftError::format(
                kind,
                offset,
                format!("first entry at {:#x} outside node of {} bytes", first_entry, total_size),
            ));
        }
        let end = offset + total_size;
        if end > buf.len() {
            return Err(MftError::format(
                kind,
                offset + 0x04,
                format!("node of {} bytes runs past {}-byte buffer", total_size, buf.len()),
            ));
        }

        let node_bytes = &buf[..end];
        let mut entries = Vec::new();
        let mut pos = offset + first_entry;
        loop {
            if pos >= end {
                return Err(MftError::format(kind, offset, "node has no end entry"));
            }
            let (entry, length) = IndexEntry::parse(node_bytes, pos, layout)?;
            pos += length;
            let done = entry.is_end;
            entries.push(entry);
            if done {
                break;
            }
        }

        Ok(Self {
            allocated_size,
            flags,
            entries,
        })
    }

    fn used_size(&self, first_entry: usize) -> usize {
        first_entry + self.entries.iter().map(IndexEntry::size).sum::<usize>()
    }

    /// Write the node header at `offset` with entries starting
    /// `first_entry` bytes after it
    pub fn write(&self, buf: &mut [u8], offset: usize, first_entry: usize) -> Result<usize> {
        let total = self.used_size(first_entry);
        let allocated = (self.allocated_size as usize).max(total);
        if offset + total > buf.len() {
            return Err(MftError::format(
                StructureKind::IndexNode,
                offset,
                format!("node of {} bytes does not fit in {}-byte buffer", total, buf.len()),
            ));
        }
        field::put_u32(buf, offset, first_entry as u32);
        field::put_u32(buf, offset + 0x04, total as u32);
        field::put_u32(buf, offset + 0x08, allocated as u32);
        buf[offset + 0x0C] = self.flags;

        let mut pos = offset + first_entry;
        for entry in &self.entries {
            pos += entry.write(buf, pos)?;
        }
        Ok(total)
    }

    pub fn has_children(&self) -> bool {
        self.flags & index_node_flags::HAS_CHILDREN != 0
    }

    /// Entries carrying keys, the end entry excluded
    pub fn keyed_entries(&self) -> &[IndexEntry] {
        match self.entries.last() {
            Some(last) if last.is_end => &self.entries[..self.entries.len() - 1],
            _ => &self.entries,
        }
    }
}

// ============================================================================
// Index Root
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRoot {
    pub indexed_type: AttributeType,
    pub collation: CollationRule,
    pub block_size: u32,
    pub clusters_per_block: u8,
    pub node: IndexNode,
}

impl IndexRoot {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let kind = StructureKind::IndexRoot;
        let indexed_type = AttributeType::from_u32(field::u32_at(data, 0x00, kind)?);
        let collation = CollationRule::from_u32(field::u32_at(data, 0x04, kind)?)?;
        let block_size = field::u32_at(data, 0x08, kind)?;
        let clusters_per_block = field::u8_at(data, 0x0C, kind)?;
        let node = IndexNode::parse(data, ROOT_HEADER_SIZE, EntryLayout::for_indexed_type(indexed_type))?;

        Ok(Self {
            indexed_type,
            collation,
            block_size,
            clusters_per_block,
            node,
        })
    }

    pub fn layout(&self) -> EntryLayout {
        EntryLayout::for_indexed_type(self.indexed_type)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut node = self.node.clone();
        node.allocated_size = 0;
        let mut buf = vec![0u8; ROOT_HEADER_SIZE + node.used_size(NODE_HEADER_SIZE)];
        field::put_u32(&mut buf, 0x00, self.indexed_type.code());
        field::put_u32(&mut buf, 0x04, self.collation.code());
        field::put_u32(&mut buf, 0x08, self.block_size);
        buf[0x0C] = self.clusters_per_block;
        node.write(&mut buf, ROOT_HEADER_SIZE, NODE_HEADER_SIZE)?;
        Ok(buf)
    }
}

// ============================================================================
// Index Block (INDX)
// ============================================================================

#[derive(Debug, Clone)]
pub struct IndexBlock {
    pub fixup: FixupHeader,
    pub vcn: u64,
    pub node: IndexNode,
}

impl FixupRecord for IndexBlock {
    const MAGIC: [u8; 4] = INDEX_BLOCK_SIGNATURE;
    const KIND: StructureKind = StructureKind::IndexBlock;
    type Layout = EntryLayout;

    fn fixup(&self) -> &FixupHeader {
        &self.fixup
    }

    fn fixup_mut(&mut self) -> &mut FixupHeader {
        &mut self.fixup
    }

    fn parse_payload(fixup: FixupHeader, buf: &[u8], layout: EntryLayout) -> Result<Self> {
        let vcn = field::u64_at(buf, 0x10, StructureKind::IndexBlock)?;
        let node = IndexNode::parse(buf, BLOCK_NODE_OFFSET, layout)?;
        Ok(Self { fixup, vcn, node })
    }

    fn write_payload(&self, buf: &mut [u8]) -> Result<()> {
        buf.fill(0);
        field::put_u64(buf, 0x10, self.vcn);
        let first_entry = round_up(self.fixup.usa_end(), 8) - BLOCK_NODE_OFFSET;
        let mut node = self.node.clone();
        node.allocated_size = (buf.len() - BLOCK_NODE_OFFSET) as u32;
        node.write(buf, BLOCK_NODE_OFFSET, first_entry)?;
        Ok(())
    }
}

impl IndexBlock {
    pub fn new(vcn: u64, node: IndexNode, block_size: usize, sector_size: usize) -> Self {
        Self {
            fixup: FixupHeader::new(INDEX_BLOCK_SIGNATURE, BLOCK_USA_OFFSET, block_size, sector_size),
            vcn,
            node,
        }
    }

    pub fn from_bytes(data: &[u8], sector_size: usize, layout: EntryLayout) -> Result<Self> {
        Self::from_protected(data, sector_size, layout)
    }

    pub fn to_bytes(&mut self, block_size: usize, sector_size: usize) -> Result<Vec<u8>> {
        self.to_protected(block_size, sector_size)
    }
}

// ============================================================================
// Node readers
// ============================================================================

/// Source of non-root index nodes
pub trait NodeReader: Send + Sync {
    fn read_node(&self, vcn: u64) -> Result<Arc<IndexNode>>;
}

/// Reads `INDX` blocks out of an `$INDEX_ALLOCATION` stream
pub struct AllocationNodeReader {
    data: ContentBuffer,
    layout: EntryLayout,
    block_size: u32,
    clusters_per_block: u8,
    bytes_per_cluster: u32,
    sector_size: usize,
    cache: LruCache<u64, Arc<IndexNode>>,
}

impl AllocationNodeReader {
    pub fn new(
        data: ContentBuffer,
        root: &IndexRoot,
        bytes_per_cluster: u32,
        sector_size: usize,
        cache_capacity: usize,
    ) -> Self {
        Self {
            data,
            layout: root.layout(),
            block_size: root.block_size,
            clusters_per_block: root.clusters_per_block,
            bytes_per_cluster,
            sector_size,
            cache: LruCache::new(cache_capacity),
        }
    }

    /// Byte position of the block addressed by `vcn`
    pub fn block_position(&self, vcn: u64) -> Result<u64> {
        if self.bytes_per_cluster <= self.block_size {
            Ok(vcn * self.bytes_per_cluster as u64)
        } else if self.clusters_per_block == 0 {
            Err(MftError::format(
                StructureKind::IndexRoot,
                0x0C,
                "zero blocks per index block with clusters larger than blocks",
            ))
        } else {
            Ok(vcn / self.clusters_per_block as u64 * self.block_size as u64)
        }
    }

    fn load(&self, vcn: u64) -> Result<Arc<IndexNode>> {
        let pos = self.block_position(vcn)?;
        let mut raw = vec![0u8; self.block_size as usize];
        let n = self.data.read_at(pos, &mut raw)?;
        if n < raw.len() {
            return Err(MftError::not_found(format!(
                "index block vcn {} past the end of the allocation",
                vcn
            )));
        }
        let block = IndexBlock::from_bytes(&raw, self.sector_size, self.layout).map_err(|e| e.at(pos))?;
        if block.vcn != vcn {
            return Err(MftError::format(
                StructureKind::IndexBlock,
                (pos + 0x10) as usize,
                format!("block read for vcn {} claims vcn {}", vcn, block.vcn),
            ));
        }
        log::trace!("loaded index block vcn {} ({} entries)", vcn, block.node.entries.len());
        Ok(Arc::new(block.node))
    }
}

impl NodeReader for AllocationNodeReader {
    fn read_node(&self, vcn: u64) -> Result<Arc<IndexNode>> {
        self.cache.get_or_try_insert_with(vcn, || self.load(vcn))
    }
}

/// Nodes held in memory, keyed by VCN
#[derive(Default)]
pub struct MemoryNodeReader {
    nodes: HashMap<u64, Arc<IndexNode>>,
}

impl MemoryNodeReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, vcn: u64, node: IndexNode) {
        self.nodes.insert(vcn, Arc::new(node));
    }
}

impl NodeReader for MemoryNodeReader {
    fn read_node(&self, vcn: u64) -> Result<Arc<IndexNode>> {
        self.nodes
            .get(&vcn)
            .cloned()
            .ok_or_else(|| MftError::not_found(format!("index node vcn {}", vcn)))
    }
}

// ============================================================================
// Index Tree
// ============================================================================

pub struct IndexTree {
    root: Arc<IndexNode>,
    collator: Arc<dyn Collator>,
    reader: Option<Arc<dyn NodeReader>>,
}

impl IndexTree {
    pub fn new(root: IndexNode, collator: Arc<dyn Collator>, reader: Option<Arc<dyn NodeReader>>) -> Self {
        Self {
            root: Arc::new(root),
            collator,
            reader,
        }
    }

    pub fn from_root(root: &IndexRoot, upcase: &Arc<UpcaseTable>, reader: Option<Arc<dyn NodeReader>>) -> Self {
        Self::new(root.node.clone(), collator_for(root.collation, upcase), reader)
    }

    pub fn root(&self) -> &IndexNode {
        &self.root
    }

    pub fn collator(&self) -> &Arc<dyn Collator> {
        &self.collator
    }

    fn child(&self, vcn: u64) -> Result<Arc<IndexNode>> {
        match &self.reader {
            Some(reader) => reader.read_node(vcn),
            None => Err(MftError::format(
                StructureKind::IndexNode,
                0,
                format!("entry points at child vcn {} but the index has no allocation", vcn),
            )),
        }
    }

    fn too_deep() -> MftError {
        MftError::format(
            StructureKind::IndexNode,
            0,
            format!("index deeper than {} levels, assuming a cycle", MAX_INDEX_DEPTH),
        )
    }

    /// Index of the entry equal to `key`, or of the first greater entry
    /// (the end entry when none is greater)
    fn search(&self, node: &IndexNode, key: &[u8]) -> Result<(usize, bool)> {
        let keyed = node.keyed_entries();
        let (mut lo, mut hi) = (0usize, keyed.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.collator.compare(&keyed[mid].key, key)? {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok((mid, true)),
            }
        }
        Ok((lo, false))
    }

    pub fn lookup(&self, key: &[u8]) -> Result<Option<IndexEntry>> {
        let mut node = Arc::clone(&self.root);
        for _ in 0..=MAX_INDEX_DEPTH {
            let (idx, found) = self.search(&node, key)?;
            if found {
                return Ok(Some(node.entries[idx].clone()));
            }
            let child = node.entries.get(idx).and_then(|e| e.child);
            match child {
                Some(vcn) => node = self.child(vcn)?,
                None => return Ok(None),
            }
        }
        Err(Self::too_deep())
    }

    /// Every entry in collation order. Each call starts a fresh walk.
    pub fn enumerate(&self) -> IndexIter<'_> {
        IndexIter {
            tree: self,
            stack: vec![Frame {
                node: Arc::clone(&self.root),
                pos: 0,
                child_done: false,
            }],
        }
    }

    /// Entries for which `query` returns `Equal`. `query` reports where an
    /// entry sorts relative to the wanted range; subtrees wholly outside it
    /// are not read.
    pub fn find_all<F>(&self, query: F) -> Result<Vec<IndexEntry>>
    where
        F: Fn(&IndexEntry) -> Result<Ordering>,
    {
        let mut out = Vec::new();
        self.find_in(&self.root, &query, 0, &mut out)?;
        Ok(out)
    }

    fn find_in<F>(&self, node: &IndexNode, query: &F, depth: usize, out: &mut Vec<IndexEntry>) -> Result<()>
    where
        F: Fn(&IndexEntry) -> Result<Ordering>,
    {
        if depth > MAX_INDEX_DEPTH {
            return Err(Self::too_deep());
        }
        for entry in &node.entries {
            let order = if entry.is_end {
                Ordering::Greater
            } else {
                query(entry)?
            };
            if order == Ordering::Less {
                continue;
            }
            if let Some(vcn) = entry.child {
                let child = self.child(vcn)?;
                self.find_in(&child, query, depth + 1, out)?;
            }
            if order == Ordering::Greater {
                break;
            }
            out.push(entry.clone());
        }
        Ok(())
    }
}

struct Frame {
    node: Arc<IndexNode>,
    pos: usize,
    child_done: bool,
}

/// In-order walk over an [`IndexTree`]; child subtrees come before the
/// entry that points at them
pub struct IndexIter<'a> {
    tree: &'a IndexTree,
    stack: Vec<Frame>,
}

impl Iterator for IndexIter<'_> {
    type Item = Result<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let depth = self.stack.len();
            let frame = self.stack.last_mut()?;
            let Some(entry) = frame.node.entries.get(frame.pos) else {
                self.stack.pop();
                continue;
            };

            if !frame.child_done {
                frame.child_done = true;
                if let Some(vcn) = entry.child {
                    if depth > MAX_INDEX_DEPTH {
                        self.stack.clear();
                        return Some(Err(IndexTree::too_deep()));
                    }
                    match self.tree.child(vcn) {
                        Ok(node) => {
                            self.stack.push(Frame {
                                node,
                                pos: 0,
                                child_done: false,
                            });
                            continue;
                        }
                        Err(e) => {
                            self.stack.clear();
                            return Some(Err(e));
                        }
                    }
                }
            }

            let yielded = (!entry.is_end).then(|| entry.clone());
            frame.pos += 1;
            frame.child_done = false;
            if let Some(entry) = yielded {
                return Some(Ok(entry));
            }
        }
    }
}
