//! Shared volume context
//!
//! Everything a stream needs to turn cooked runs into bytes: the byte source,
//! cluster geometry, the codec for compressed attributes and an optional
//! cluster cache.

use crate::error::Result;
use crate::ntfs::cache::LruCache;
use crate::ntfs::lznt1::{BlockCompressor, Lznt1};
use crate::ntfs::source::ByteSource;
use crate::ntfs::stream::{pack_unit, PackedUnit};
use crate::ntfs::structs::SECTOR_SIZE;
use std::sync::Arc;

pub struct NtfsContext {
    source: Arc<dyn ByteSource>,
    bytes_per_cluster: u32,
    sector_size: usize,
    compressor: Arc<dyn BlockCompressor>,
    cluster_cache: Option<LruCache<u64, Arc<Vec<u8>>>>,
}

impl NtfsContext {
    pub fn new(source: Arc<dyn ByteSource>, bytes_per_cluster: u32) -> Self {
        Self {
            source,
            bytes_per_cluster,
            sector_size: SECTOR_SIZE as usize,
            compressor: Arc::new(Lznt1::new()),
            cluster_cache: None,
        }
    }

    /// Stride used for update sequence protection
    pub fn with_sector_size(mut self, sector_size: usize) -> Self {
        self.sector_size = sector_size;
        self
    }

    pub fn with_compressor(mut self, compressor: Arc<dyn BlockCompressor>) -> Self {
        self.compressor = compressor;
        self
    }

    /// Cache up to `clusters` whole clusters; zero disables the cache
    pub fn with_cluster_cache(mut self, clusters: usize) -> Self {
        self.cluster_cache = (clusters > 0).then(|| LruCache::new(clusters));
        self
    }

    pub fn source(&self) -> &Arc<dyn ByteSource> {
        &self.source
    }

    pub fn bytes_per_cluster(&self) -> u32 {
        self.bytes_per_cluster
    }

    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    pub fn compressor(&self) -> &dyn BlockCompressor {
        self.compressor.as_ref()
    }

    /// Compress one compression unit with this volume's codec and geometry
    pub fn pack_unit(&self, raw: &[u8]) -> PackedUnit {
        pack_unit(self.compressor(), raw, self.bytes_per_cluster as u64)
    }

    /// Read volume bytes at an absolute position
    pub fn read_physical(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        let cache = match &self.cluster_cache {
            Some(cache) => cache,
            None => return self.source.read_at(pos, buf),
        };

        let bpc = self.bytes_per_cluster as u64;
        let mut done = 0usize;
        while done < buf.len() {
            let at = pos + done as u64;
            let lcn = at / bpc;
            let within = (at % bpc) as usize;
            let cluster = cache.get_or_try_insert_with(lcn, || {
                let mut data = vec![0u8; bpc as usize];
                self.source.read_at(lcn * bpc, &mut data)?;
                Ok(Arc::new(data))
            })?;
            let take = (buf.len() - done).min(bpc as usize - within);
            buf[done..done + take].copy_from_slice(&cluster[within..within + take]);
            done += take;
        }
        Ok(())
    }

    /// Write volume bytes at an absolute position, dropping stale cached clusters
    pub fn write_physical(&self, pos: u64, data: &[u8]) -> Result<()> {
        self.source.write_at(pos, data)?;
        if let Some(cache) = &self.cluster_cache {
            if !data.is_empty() {
                let bpc = self.bytes_per_cluster as u64;
                let first = pos / bpc;
                let last = (pos + data.len() as u64 - 1) / bpc;
                for lcn in first..=last {
                    cache.remove(&lcn);
                }
            }
        }
        Ok(())
    }

    pub fn read_clusters(&self, lcn: u64, count: u64) -> Result<Vec<u8>> {
        let bpc = self.bytes_per_cluster as u64;
        let mut buf = vec![0u8; (count * bpc) as usize];
        self.read_physical(lcn * bpc, &mut buf)?;
        Ok(buf)
    }

    pub fn cluster_cache_len(&self) -> usize {
        self.cluster_cache.as_ref().map_or(0, LruCache::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntfs::source::MemorySource;

    fn image() -> Arc<MemorySource> {
        Arc::new(MemorySource::new((0..4096u32).map(|i| (i / 512) as u8).collect()))
    }

    #[test]
    fn cached_reads_span_clusters() {
        let ctx = NtfsContext::new(image(), 512).with_cluster_cache(4);
        let mut buf = [0u8; 4];
        ctx.read_physical(510, &mut buf).unwrap();
        assert_eq!(buf, [0, 0, 1, 1]);
        assert_eq!(ctx.cluster_cache_len(), 2);
        assert_eq!(ctx.read_clusters(3, 1).unwrap(), vec![3u8; 512]);
    }

    #[test]
    fn packs_units_with_volume_geometry() {
        use crate::ntfs::runs::UnitLayout;

        let ctx = NtfsContext::new(image(), 512);
        assert_eq!(ctx.pack_unit(&[0u8; 8192]).layout, UnitLayout::Sparse);
        let unit = ctx.pack_unit(&[b'n'; 8192]);
        assert_eq!(unit.layout, UnitLayout::Compressed { stored_clusters: 1 });
        assert_eq!(unit.data.len(), 512);
    }

    #[test]
    fn writes_invalidate_cached_clusters() {
        let ctx = NtfsContext::new(image(), 512).with_cluster_cache(8);
        ctx.read_clusters(0, 2).unwrap();
        ctx.write_physical(600, &[0xEE; 4]).unwrap();

        let mut buf = [0u8; 4];
        ctx.read_physical(600, &mut buf).unwrap();
        assert_eq!(buf, [0xEE; 4]);
    }
}
