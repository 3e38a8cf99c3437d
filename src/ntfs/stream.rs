//! Logical content of an attribute
//!
//! A [`ContentBuffer`] presents the value of an attribute as one contiguous
//! byte range, whether it is embedded in the record or scattered across the
//! volume by the runs of several extents. [`ContentStream`] adapts a buffer to
//! `std::io::{Read, Write, Seek}`.

use crate::error::{MftError, Result, StructureKind};
use crate::ntfs::attribute::AttributeRecord;
use crate::ntfs::context::NtfsContext;
use crate::ntfs::lznt1::BlockCompressor;
use crate::ntfs::runs::{CookedRun, CookedRuns, ExtentId, UnitLayout};
use parking_lot::Mutex;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

const ZERO_FILL_CHUNK: usize = 64 * 1024;

/// One compression unit ready to be laid out on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedUnit {
    pub layout: UnitLayout,
    /// Exactly the clusters to store, zero padded; empty when sparse
    pub data: Vec<u8>,
}

/// Compress one unit of raw content and decide how much of it is stored.
pub fn pack_unit(compressor: &dyn BlockCompressor, raw: &[u8], bytes_per_cluster: u64) -> PackedUnit {
    let bpc = bytes_per_cluster.max(1);
    let unit_clusters = (raw.len() as u64).div_ceil(bpc);
    let mut out = vec![0u8; raw.len()];
    let result = compressor.compress(raw, &mut out);
    let layout = UnitLayout::from_compression(result, unit_clusters, bpc);

    let mut data = match layout {
        UnitLayout::Sparse => Vec::new(),
        UnitLayout::Compressed { .. } => out,
        UnitLayout::Uncompressed => raw.to_vec(),
    };
    data.resize((layout.stored_clusters(unit_clusters) * bpc) as usize, 0);
    PackedUnit { layout, data }
}

pub enum ContentBuffer {
    Resident(Vec<u8>),
    NonResident(NonResidentBuffer),
}

impl std::fmt::Debug for ContentBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentBuffer::Resident(data) => f.debug_tuple("Resident").field(&data.len()).finish(),
            ContentBuffer::NonResident(nr) => f.debug_tuple("NonResident").field(&nr.real_size).finish(),
        }
    }
}

impl ContentBuffer {
    /// Build from every extent of one attribute. A single resident record
    /// gives a resident buffer.
    pub fn from_extents(ctx: &Arc<NtfsContext>, extents: &[&AttributeRecord]) -> Result<Self> {
        if let [single] = extents {
            if let Some(r) = single.resident() {
                return Ok(ContentBuffer::Resident(r.data.clone()));
            }
        }
        Ok(ContentBuffer::NonResident(NonResidentBuffer::from_extents(ctx, extents)?))
    }

    /// Logical length (the real size for non-resident values)
    pub fn len(&self) -> u64 {
        match self {
            ContentBuffer::Resident(data) => data.len() as u64,
            ContentBuffer::NonResident(nr) => nr.real_size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_resident(&self) -> bool {
        matches!(self, ContentBuffer::Resident(_))
    }

    /// Read into `buf` from `pos`; returns 0 at or past the end
    pub fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        match self {
            ContentBuffer::Resident(data) => {
                if pos >= data.len() as u64 {
                    return Ok(0);
                }
                let start = pos as usize;
                let n = buf.len().min(data.len() - start);
                buf[..n].copy_from_slice(&data[start..start + n]);
                Ok(n)
            }
            ContentBuffer::NonResident(nr) => nr.read_at(pos, buf),
        }
    }

    pub fn write_at(&mut self, pos: u64, data: &[u8]) -> Result<usize> {
        match self {
            ContentBuffer::Resident(value) => {
                let end = pos as usize + data.len();
                if end > value.len() {
                    value.resize(end, 0);
                }
                value[pos as usize..end].copy_from_slice(data);
                Ok(data.len())
            }
            ContentBuffer::NonResident(nr) => nr.write_at(pos, data),
        }
    }

    pub fn read_all(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.len() as usize];
        let mut done = 0;
        while done < out.len() {
            let n = self.read_at(done as u64, &mut out[done..])?;
            if n == 0 {
                break;
            }
            done += n;
        }
        out.truncate(done);
        Ok(out)
    }

    pub fn into_stream(self) -> ContentStream {
        ContentStream::new(self)
    }
}

// ============================================================================
// NonResidentBuffer
// ============================================================================

pub struct NonResidentBuffer {
    ctx: Arc<NtfsContext>,
    runs: CookedRuns,
    extent_count: usize,
    real_size: u64,
    allocated_size: u64,
    initialized_size: u64,
    /// Clusters per compression unit when the attribute is compressed
    compression_unit: Option<u64>,
    /// Last decoded compression unit
    unit_cache: Mutex<Option<(u64, Arc<Vec<u8>>)>>,
}

impl NonResidentBuffer {
    /// Extents may be given in any order; sorted by start VCN they must begin
    /// at VCN 0 and follow each other without gaps.
    pub fn from_extents(ctx: &Arc<NtfsContext>, extents: &[&AttributeRecord]) -> Result<Self> {
        let mut sorted = extents.to_vec();
        sorted.sort_by_key(|attr| attr.start_vcn());

        let first = match sorted.first() {
            Some(first) => *first,
            None => return Err(MftError::format(StructureKind::Stream, 0, "attribute has no extents")),
        };
        let head = first.non_resident().ok_or_else(|| {
            MftError::format(
                StructureKind::Stream,
                0,
                format!("{} mixes resident and non-resident extents", first.attr_type),
            )
        })?;
        if head.start_vcn != 0 {
            return Err(MftError::format(
                StructureKind::Stream,
                0,
                format!("first extent of {} starts at vcn {}", first.attr_type, head.start_vcn),
            ));
        }
        if first.is_encrypted() {
            return Err(MftError::unsupported(format!("encrypted {}", first.attr_type)));
        }

        let mut runs = CookedRuns::new();
        for (i, extent) in sorted.iter().enumerate() {
            let nr = extent.non_resident().ok_or_else(|| {
                MftError::format(
                    StructureKind::Stream,
                    0,
                    format!("{} mixes resident and non-resident extents", extent.attr_type),
                )
            })?;
            runs.append_extent(&nr.runs, nr.start_vcn, ExtentId(i))?;
        }

        let compression_unit = if first.is_compressed() {
            if head.compression_unit_log2 == 0 {
                return Err(MftError::unsupported(format!(
                    "compressed {} without a compression unit",
                    first.attr_type
                )));
            }
            Some(head.compression_unit_clusters())
        } else {
            None
        };

        log::trace!(
            "cooked {} runs from {} extent(s), real size {}",
            runs.len(),
            sorted.len(),
            head.real_size
        );

        Ok(Self {
            ctx: Arc::clone(ctx),
            runs,
            extent_count: sorted.len(),
            real_size: head.real_size,
            allocated_size: head.allocated_size,
            initialized_size: head.initialized_size,
            compression_unit,
            unit_cache: Mutex::new(None),
        })
    }

    pub fn runs(&self) -> &CookedRuns {
        &self.runs
    }

    pub fn extent_count(&self) -> usize {
        self.extent_count
    }

    pub fn allocated_size(&self) -> u64 {
        self.allocated_size
    }

    pub fn initialized_size(&self) -> u64 {
        self.initialized_size
    }

    pub fn is_compressed(&self) -> bool {
        self.compression_unit.is_some()
    }

    fn bytes_per_cluster(&self) -> u64 {
        self.ctx.bytes_per_cluster() as u64
    }

    fn run_at(&self, vcn: u64) -> Result<&CookedRun> {
        let idx = self.runs.find_run(vcn).map_err(|_| {
            MftError::format(
                StructureKind::Stream,
                0,
                format!("vcn {} is inside the value but past the run list", vcn),
            )
        })?;
        Ok(&self.runs.runs()[idx])
    }

    pub fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        if pos >= self.real_size {
            return Ok(0);
        }
        let n = buf.len().min((self.real_size - pos) as usize);
        let buf = &mut buf[..n];

        let mut done = 0usize;
        while done < n {
            let at = pos + done as u64;
            if at >= self.initialized_size {
                buf[done..].fill(0);
                break;
            }
            let limit = (n - done).min((self.initialized_size - at) as usize);
            let out = &mut buf[done..done + limit];
            done += match self.compression_unit {
                Some(unit) => self.read_compressed(at, unit, out)?,
                None => self.read_plain(at, out)?,
            };
        }
        Ok(n)
    }

    fn read_plain(&self, pos: u64, out: &mut [u8]) -> Result<usize> {
        let bpc = self.bytes_per_cluster();
        let run = self.run_at(pos / bpc)?;
        let into_run = pos - run.start_vcn * bpc;
        let take = (out.len() as u64).min(run.length * bpc - into_run) as usize;

        if run.is_sparse {
            out[..take].fill(0);
        } else {
            self.ctx
                .read_physical(run.start_lcn * bpc + into_run, &mut out[..take])?;
        }
        Ok(take)
    }

    fn read_compressed(&self, pos: u64, unit_clusters: u64, out: &mut [u8]) -> Result<usize> {
        let unit_bytes = unit_clusters * self.bytes_per_cluster();
        let unit_index = pos / unit_bytes;
        let unit = self.load_unit(unit_index, unit_clusters)?;
        let within = (pos - unit_index * unit_bytes) as usize;
        let take = out.len().min(unit.len() - within);
        out[..take].copy_from_slice(&unit[within..within + take]);
        Ok(take)
    }

    fn load_unit(&self, unit_index: u64, unit_clusters: u64) -> Result<Arc<Vec<u8>>> {
        let mut cache = self.unit_cache.lock();
        if let Some((cached, data)) = cache.as_ref() {
            if *cached == unit_index {
                return Ok(Arc::clone(data));
            }
        }

        let bpc = self.bytes_per_cluster();
        let unit_bytes = (unit_clusters * bpc) as usize;
        let start_vcn = unit_index * unit_clusters;

        let data = match self.runs.compression_unit_layout(start_vcn, unit_clusters)? {
            UnitLayout::Sparse => vec![0u8; unit_bytes],
            UnitLayout::Uncompressed => self.read_stored(start_vcn, unit_clusters)?,
            UnitLayout::Compressed { stored_clusters } => {
                let packed = self.read_stored(start_vcn, stored_clusters)?;
                let mut unpacked = vec![0u8; unit_bytes];
                let produced = self.ctx.compressor().decompress(&packed, &mut unpacked)?;

                let unit_start = start_vcn * bpc;
                let expected = (self.real_size.saturating_sub(unit_start)).min(unit_bytes as u64);
                if (produced as u64) < expected {
                    return Err(MftError::format(
                        StructureKind::CompressionUnit,
                        0,
                        format!(
                            "unit at vcn {} decompressed to {} bytes, expected {}",
                            start_vcn, produced, expected
                        ),
                    ));
                }
                unpacked
            }
        };

        let data = Arc::new(data);
        *cache = Some((unit_index, Arc::clone(&data)));
        Ok(data)
    }

    /// Raw clusters `[start_vcn, start_vcn + clusters)`; sparse clusters read as zero
    fn read_stored(&self, start_vcn: u64, clusters: u64) -> Result<Vec<u8>> {
        let bpc = self.bytes_per_cluster();
        let mut out = vec![0u8; (clusters * bpc) as usize];
        let end = start_vcn + clusters;
        let mut vcn = start_vcn;

        while vcn < end {
            let run = self.run_at(vcn)?;
            let take = run.end_vcn().min(end) - vcn;
            if !run.is_sparse {
                let dst = ((vcn - start_vcn) * bpc) as usize;
                let lcn = run.start_lcn + (vcn - run.start_vcn);
                self.ctx
                    .read_physical(lcn * bpc, &mut out[dst..dst + (take * bpc) as usize])?;
            }
            vcn += take;
        }
        Ok(out)
    }

    /// Overwrite bytes inside the value. Only stored, uncompressed clusters
    /// can be written; allocation belongs to the caller.
    pub fn write_at(&mut self, pos: u64, data: &[u8]) -> Result<usize> {
        if self.compression_unit.is_some() {
            return Err(MftError::unsupported("writing to a compressed attribute"));
        }
        let end = pos
            .checked_add(data.len() as u64)
            .filter(|&end| end <= self.real_size)
            .ok_or_else(|| {
                MftError::unsupported(format!(
                    "write of {} bytes at {} extends past the {}-byte value",
                    data.len(),
                    pos,
                    self.real_size
                ))
            })?;
        if data.is_empty() {
            return Ok(0);
        }

        let gap_start = self.initialized_size.min(pos);
        self.check_stored(gap_start, end)?;

        if pos > self.initialized_size {
            let zeros = vec![0u8; ZERO_FILL_CHUNK];
            let mut at = self.initialized_size;
            while at < pos {
                let n = ((pos - at) as usize).min(ZERO_FILL_CHUNK);
                self.write_stored(at, &zeros[..n])?;
                at += n as u64;
            }
        }
        self.write_stored(pos, data)?;

        if end > self.initialized_size {
            self.initialized_size = end;
        }
        Ok(data.len())
    }

    fn check_stored(&self, start: u64, end: u64) -> Result<()> {
        let bpc = self.bytes_per_cluster();
        let mut vcn = start / bpc;
        let last = (end - 1) / bpc;
        while vcn <= last {
            let run = self.run_at(vcn)?;
            if run.is_sparse {
                return Err(MftError::unsupported(format!(
                    "writing into sparse clusters at vcn {}",
                    vcn
                )));
            }
            vcn = run.end_vcn();
        }
        Ok(())
    }

    fn write_stored(&self, pos: u64, data: &[u8]) -> Result<()> {
        let bpc = self.bytes_per_cluster();
        let mut done = 0usize;
        while done < data.len() {
            let at = pos + done as u64;
            let run = self.run_at(at / bpc)?;
            let into_run = at - run.start_vcn * bpc;
            let take = ((data.len() - done) as u64).min(run.length * bpc - into_run) as usize;
            self.ctx
                .write_physical(run.start_lcn * bpc + into_run, &data[done..done + take])?;
            done += take;
        }
        Ok(())
    }
}

// ============================================================================
// ContentStream
// ============================================================================

/// Cursor over a [`ContentBuffer`]
pub struct ContentStream {
    buffer: ContentBuffer,
    position: u64,
}

impl ContentStream {
    pub fn new(buffer: ContentBuffer) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn buffer(&self) -> &ContentBuffer {
        &self.buffer
    }

    pub fn into_inner(self) -> ContentBuffer {
        self.buffer
    }
}

impl Read for ContentStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.buffer.read_at(self.position, buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Write for ContentStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.buffer.write_at(self.position, buf)?;
        self.position += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for ContentStream {
    fn seek(&mut self, target: SeekFrom) -> io::Result<u64> {
        let next = match target {
            SeekFrom::Start(pos) => Some(pos),
            SeekFrom::End(delta) => self.buffer.len().checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        match next {
            Some(pos) => {
                self.position = pos;
                Ok(pos)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of stream",
            )),
        }
    }
}
