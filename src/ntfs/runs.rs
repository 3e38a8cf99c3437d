//! Data runs for non-resident attributes
//!
//! A run list is the compact on-disk description of where an attribute's
//! clusters live. Each run is a header byte (low nibble = width of the length
//! field, high nibble = width of the offset field) followed by a little-endian
//! cluster count and a signed LCN delta relative to the previous run. A run
//! with no offset field is sparse. The list ends at a zero header byte.
//!
//! Decoded runs are "cooked" into absolute VCN -> LCN mappings. Every
//! attribute extent restarts the LCN baseline at zero, so cooked runs remember
//! the extent they came from through an [`ExtentId`].

use crate::error::{MftError, Result, StructureKind};
use crate::ntfs::field;
use crate::ntfs::lznt1::CompressionResult;
use serde::Serialize;

/// Widest length or offset field the encoding allows
pub const MAX_FIELD_WIDTH: usize = 8;

// ============================================================================
// Encoded Data Run
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DataRun {
    /// Cluster count
    pub length: u64,
    /// LCN delta from the previous non-sparse run (zero for sparse runs)
    pub offset: i64,
    pub is_sparse: bool,
}

impl DataRun {
    pub fn new(offset: i64, length: u64) -> Self {
        Self {
            length,
            offset,
            is_sparse: false,
        }
    }

    pub fn sparse(length: u64) -> Self {
        Self {
            length,
            offset: 0,
            is_sparse: true,
        }
    }

    /// Number of bytes this run occupies in a run list
    pub fn encoded_size(&self) -> usize {
        let offset_width = if self.is_sparse {
            0
        } else {
            signed_width(self.offset)
        };
        1 + unsigned_width(self.length) + offset_width
    }

    /// Encode at `offset`, returning the bytes written
    pub fn write(&self, buf: &mut [u8], offset: usize) -> usize {
        let length_width = unsigned_width(self.length);
        let offset_width = if self.is_sparse {
            0
        } else {
            signed_width(self.offset)
        };

        buf[offset] = ((offset_width << 4) | length_width) as u8;
        let mut pos = offset + 1;
        buf[pos..pos + length_width].copy_from_slice(&self.length.to_le_bytes()[..length_width]);
        pos += length_width;
        buf[pos..pos + offset_width].copy_from_slice(&self.offset.to_le_bytes()[..offset_width]);
        pos += offset_width;

        pos - offset
    }
}

impl std::fmt::Display for DataRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_sparse {
            write!(f, "{}:sparse", self.length)
        } else {
            write!(f, "{}:{:+}", self.length, self.offset)
        }
    }
}

fn unsigned_width(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(8).max(1)
}

fn signed_width(value: i64) -> usize {
    for width in 1..MAX_FIELD_WIDTH {
        let shift = 64 - 8 * width as u32;
        if (value << shift) >> shift == value {
            return width;
        }
    }
    MAX_FIELD_WIDTH
}

fn read_unsigned(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .rev()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

fn read_signed(bytes: &[u8]) -> i64 {
    let raw = read_unsigned(bytes) as i64;
    let bits = bytes.len() * 8;
    if bits == 0 || bits >= 64 {
        return raw;
    }
    let shift = (64 - bits) as u32;
    (raw << shift) >> shift
}

/// Decode a run list starting at `offset`.
///
/// Returns the runs and the number of bytes consumed, terminator included.
pub fn decode_run_list(buf: &[u8], offset: usize) -> Result<(Vec<DataRun>, usize)> {
    let mut runs = Vec::new();
    let mut pos = offset;

    loop {
        let header = match buf.get(pos) {
            Some(&h) => h,
            None => {
                return Err(MftError::format(
                    StructureKind::RunList,
                    pos,
                    "run list is not terminated",
                ))
            }
        };
        if header == 0 {
            pos += 1;
            break;
        }

        let length_width = (header & 0x0F) as usize;
        let offset_width = (header >> 4) as usize;
        if length_width == 0 || length_width > MAX_FIELD_WIDTH || offset_width > MAX_FIELD_WIDTH {
            return Err(MftError::format(
                StructureKind::RunList,
                pos,
                format!("invalid run header {:#04x}", header),
            ));
        }

        let length = read_unsigned(field::slice_at(
            buf,
            pos + 1,
            length_width,
            StructureKind::RunList,
        )?);
        if length == 0 {
            return Err(MftError::format(
                StructureKind::RunList,
                pos,
                "zero-length run",
            ));
        }

        let run = if offset_width == 0 {
            DataRun::sparse(length)
        } else {
            let delta = read_signed(field::slice_at(
                buf,
                pos + 1 + length_width,
                offset_width,
                StructureKind::RunList,
            )?);
            DataRun::new(delta, length)
        };

        runs.push(run);
        pos += 1 + length_width + offset_width;
    }

    Ok((runs, pos - offset))
}

/// Encode runs followed by the zero terminator
pub fn encode_run_list(runs: &[DataRun]) -> Vec<u8> {
    let size: usize = runs.iter().map(DataRun::encoded_size).sum::<usize>() + 1;
    let mut buf = vec![0u8; size];
    let mut pos = 0;
    for run in runs {
        pos += run.write(&mut buf, pos);
    }
    buf
}

// ============================================================================
// Cooked Data Runs
// ============================================================================

/// Position of an attribute extent in the table of the stream that cooked it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
pub struct ExtentId(pub usize);

/// A run resolved to absolute cluster numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CookedRun {
    pub start_vcn: u64,
    /// For sparse runs this is the LCN baseline carried forward, not storage
    pub start_lcn: u64,
    pub length: u64,
    pub is_sparse: bool,
    pub extent: ExtentId,
}

impl CookedRun {
    pub fn end_vcn(&self) -> u64 {
        self.start_vcn + self.length
    }

    pub fn contains(&self, vcn: u64) -> bool {
        vcn >= self.start_vcn && vcn < self.end_vcn()
    }
}

/// Where a virtual cluster lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LcnMapping {
    Physical(u64),
    /// No storage; content is all zero
    Sparse,
}

/// Storage shape of one compression unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitLayout {
    /// Every cluster of the unit is stored as-is
    Uncompressed,
    /// The first `stored_clusters` hold compressed data, the rest is sparse
    Compressed { stored_clusters: u64 },
    /// Nothing stored
    Sparse,
}

impl UnitLayout {
    /// Storage for a unit of `unit_clusters` given what the codec made of it.
    /// Compressed output is kept only when it frees at least one cluster.
    pub fn from_compression(result: CompressionResult, unit_clusters: u64, bytes_per_cluster: u64) -> Self {
        match result {
            CompressionResult::AllZeros => UnitLayout::Sparse,
            CompressionResult::Compressed(len) => {
                let stored_clusters = (len as u64).div_ceil(bytes_per_cluster.max(1));
                if stored_clusters < unit_clusters {
                    UnitLayout::Compressed { stored_clusters }
                } else {
                    UnitLayout::Uncompressed
                }
            }
            CompressionResult::Incompressible => UnitLayout::Uncompressed,
        }
    }

    /// Clusters the unit occupies on disk
    pub fn stored_clusters(&self, unit_clusters: u64) -> u64 {
        match *self {
            UnitLayout::Uncompressed => unit_clusters,
            UnitLayout::Compressed { stored_clusters } => stored_clusters,
            UnitLayout::Sparse => 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CookedRuns {
    runs: Vec<CookedRun>,
}

impl CookedRuns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cook a single extent's runs
    pub fn cook(runs: &[DataRun], start_vcn: u64, extent: ExtentId) -> Result<Self> {
        let mut cooked = Self::new();
        cooked.append_extent(runs, start_vcn, extent)?;
        Ok(cooked)
    }

    /// Append the runs of the next attribute extent. The extent must begin
    /// exactly where the already-cooked runs end.
    pub fn append_extent(&mut self, runs: &[DataRun], start_vcn: u64, extent: ExtentId) -> Result<()> {
        if !self.runs.is_empty() && start_vcn != self.next_vcn() {
            return Err(MftError::format(
                StructureKind::RunList,
                0,
                format!(
                    "extent {} starts at vcn {} but previous runs end at vcn {}",
                    extent.0,
                    start_vcn,
                    self.next_vcn()
                ),
            ));
        }

        let mut vcn = start_vcn;
        let mut lcn: i64 = 0;
        for (i, run) in runs.iter().enumerate() {
            if !run.is_sparse {
                lcn = lcn.checked_add(run.offset).ok_or_else(|| {
                    MftError::format(
                        StructureKind::RunList,
                        0,
                        format!("run {} of extent {} overflows the lcn range", i, extent.0),
                    )
                })?;
                if lcn < 0 {
                    return Err(MftError::format(
                        StructureKind::RunList,
                        0,
                        format!(
                            "run {} of extent {} resolves to negative lcn {}",
                            i, extent.0, lcn
                        ),
                    ));
                }
            }

            self.runs.push(CookedRun {
                start_vcn: vcn,
                start_lcn: lcn as u64,
                length: run.length,
                is_sparse: run.is_sparse,
                extent,
            });

            vcn = vcn.checked_add(run.length).ok_or_else(|| {
                MftError::format(
                    StructureKind::RunList,
                    0,
                    format!("run {} of extent {} overflows the vcn range", i, extent.0),
                )
            })?;
        }

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn runs(&self) -> &[CookedRun] {
        &self.runs
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CookedRun> {
        self.runs.iter()
    }

    pub fn get(&self, index: usize) -> Option<&CookedRun> {
        self.runs.get(index)
    }

    pub fn start_vcn(&self) -> u64 {
        self.runs.first().map(|r| r.start_vcn).unwrap_or(0)
    }

    /// First VCN after the cooked range
    pub fn next_vcn(&self) -> u64 {
        self.runs.last().map(CookedRun::end_vcn).unwrap_or(0)
    }

    /// Clusters backed by physical storage
    pub fn allocated_clusters(&self) -> u64 {
        self.runs
            .iter()
            .filter(|r| !r.is_sparse)
            .map(|r| r.length)
            .sum()
    }

    /// Index of the run containing `vcn`
    pub fn find_run(&self, vcn: u64) -> Result<usize> {
        let idx = self.runs.partition_point(|r| r.end_vcn() <= vcn);
        match self.runs.get(idx) {
            Some(run) if run.start_vcn <= vcn => Ok(idx),
            _ => Err(MftError::not_found(format!(
                "vcn {} outside cooked runs [{}, {})",
                vcn,
                self.start_vcn(),
                self.next_vcn()
            ))),
        }
    }

    pub fn map_vcn_to_lcn(&self, vcn: u64) -> Result<LcnMapping> {
        let run = &self.runs[self.find_run(vcn)?];
        if run.is_sparse {
            Ok(LcnMapping::Sparse)
        } else {
            Ok(LcnMapping::Physical(run.start_lcn + (vcn - run.start_vcn)))
        }
    }

    /// Classify the compression unit of `unit_clusters` clusters beginning at
    /// `unit_start`.
    pub fn compression_unit_layout(&self, unit_start: u64, unit_clusters: u64) -> Result<UnitLayout> {
        let end = unit_start + unit_clusters;
        let mut idx = self.find_run(unit_start)?;
        let mut focus = unit_start;
        let mut stored = 0u64;
        let mut seen_sparse = false;

        while focus < end {
            let run = self.runs.get(idx).ok_or_else(|| {
                MftError::not_found(format!(
                    "compression unit at vcn {} extends past cooked runs ending at vcn {}",
                    unit_start,
                    self.next_vcn()
                ))
            })?;
            let take = run.end_vcn().min(end) - focus;

            if run.is_sparse {
                seen_sparse = true;
            } else if seen_sparse {
                return Err(MftError::unsupported(format!(
                    "compression unit at vcn {} stores clusters after a sparse gap",
                    unit_start
                )));
            } else {
                stored += take;
            }

            focus += take;
            idx += 1;
        }

        Ok(match stored {
            0 => UnitLayout::Sparse,
            s if s == unit_clusters => UnitLayout::Uncompressed,
            s => UnitLayout::Compressed { stored_clusters: s },
        })
    }
}

impl<'a> IntoIterator for &'a CookedRuns {
    type Item = &'a CookedRun;
    type IntoIter = std::slice::Iter<'a, CookedRun>;

    fn into_iter(self) -> Self::IntoIter {
        self.runs.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn decodes_single_run_with_three_byte_offset() {
        let bytes = [0x31, 0x04, 0x10, 0x00, 0x00, 0x00];
        let (runs, consumed) = decode_run_list(&bytes, 0).unwrap();
        assert_eq!(consumed, 6);
        assert_eq!(runs, vec![DataRun::new(0x10, 4)]);

        let cooked = CookedRuns::cook(&runs, 0, ExtentId(0)).unwrap();
        assert_eq!(cooked.runs()[0].start_lcn, 0x10);
        assert_eq!(cooked.runs()[0].length, 4);
    }

    #[test]
    fn decodes_negative_delta_and_sparse_run() {
        // 8 clusters at +0x100, 4 sparse, 2 clusters at -0x20
        let bytes = [0x21, 0x08, 0x00, 0x01, 0x01, 0x04, 0x11, 0x02, 0xE0, 0x00];
        let (runs, consumed) = decode_run_list(&bytes, 0).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(
            runs,
            vec![DataRun::new(0x100, 8), DataRun::sparse(4), DataRun::new(-0x20, 2)]
        );

        let cooked = CookedRuns::cook(&runs, 0, ExtentId(0)).unwrap();
        let lcns: Vec<_> = cooked.iter().map(|r| (r.start_vcn, r.start_lcn, r.is_sparse)).collect();
        assert_eq!(lcns, vec![(0, 0x100, false), (8, 0x100, true), (12, 0xE0, false)]);
    }

    #[test]
    fn rejects_malformed_headers() {
        // length width 0
        assert!(decode_run_list(&[0x10, 0x05, 0x00], 0).unwrap_err().is_corruption());
        // length width 9
        assert!(decode_run_list(&[0x09, 0x00], 0).unwrap_err().is_corruption());
        // truncated offset field
        assert!(decode_run_list(&[0x31, 0x04, 0x10], 0).unwrap_err().is_corruption());
        // missing terminator
        assert!(decode_run_list(&[0x11, 0x04, 0x10], 0).unwrap_err().is_corruption());
        // zero-length run
        assert!(decode_run_list(&[0x11, 0x00, 0x10, 0x00], 0).unwrap_err().is_corruption());
    }

    #[test]
    fn cooking_rejects_negative_lcn() {
        let runs = [DataRun::new(0x10, 1), DataRun::new(-0x20, 1)];
        let err = CookedRuns::cook(&runs, 0, ExtentId(0)).unwrap_err();
        assert!(err.is_corruption());
        assert!(err.to_string().contains("negative lcn"));
    }

    #[test]
    fn extents_must_be_contiguous() {
        let mut cooked = CookedRuns::cook(&[DataRun::new(100, 4)], 0, ExtentId(0)).unwrap();
        assert!(cooked
            .append_extent(&[DataRun::new(200, 4)], 5, ExtentId(1))
            .is_err());
        cooked
            .append_extent(&[DataRun::new(200, 4)], 4, ExtentId(1))
            .unwrap();
        // second extent has its own zero baseline
        assert_eq!(cooked.map_vcn_to_lcn(5).unwrap(), LcnMapping::Physical(201));
        assert_eq!(cooked.runs()[1].extent, ExtentId(1));
    }

    #[test]
    fn maps_every_vcn_in_range_and_nothing_outside() {
        let runs = [DataRun::new(50, 3), DataRun::sparse(2), DataRun::new(10, 5)];
        let cooked = CookedRuns::cook(&runs, 20, ExtentId(0)).unwrap();
        let last_vcn = 20 + 3 + 2 + 5 - 1;

        for vcn in 20..=last_vcn {
            assert!(cooked.map_vcn_to_lcn(vcn).is_ok(), "vcn {}", vcn);
        }
        assert_eq!(cooked.map_vcn_to_lcn(20).unwrap(), LcnMapping::Physical(50));
        assert_eq!(cooked.map_vcn_to_lcn(23).unwrap(), LcnMapping::Sparse);
        assert_eq!(cooked.map_vcn_to_lcn(29).unwrap(), LcnMapping::Physical(64));
        assert!(cooked.map_vcn_to_lcn(19).unwrap_err().is_not_found());
        assert!(cooked.map_vcn_to_lcn(last_vcn + 1).unwrap_err().is_not_found());
        assert_eq!(cooked.allocated_clusters(), 8);
    }

    #[test]
    fn classifies_compression_units() {
        let runs = [
            // unit 0: 3 stored + 13 sparse => compressed
            DataRun::new(100, 3),
            DataRun::sparse(13),
            // unit 1: fully stored
            DataRun::new(50, 16),
            // unit 2: fully sparse
            DataRun::sparse(16),
            // unit 3: sparse then stored => unsupported
            DataRun::sparse(4),
            DataRun::new(10, 12),
        ];
        let cooked = CookedRuns::cook(&runs, 0, ExtentId(0)).unwrap();

        assert_eq!(
            cooked.compression_unit_layout(0, 16).unwrap(),
            UnitLayout::Compressed { stored_clusters: 3 }
        );
        assert_eq!(cooked.compression_unit_layout(16, 16).unwrap(), UnitLayout::Uncompressed);
        assert_eq!(cooked.compression_unit_layout(32, 16).unwrap(), UnitLayout::Sparse);
        assert!(matches!(
            cooked.compression_unit_layout(48, 16),
            Err(MftError::UnsupportedFeature(_))
        ));
        assert!(cooked.compression_unit_layout(64, 16).unwrap_err().is_not_found());
    }

    #[test]
    fn compression_outcome_picks_unit_storage() {
        let sparse = UnitLayout::from_compression(CompressionResult::AllZeros, 16, 512);
        assert_eq!(sparse, UnitLayout::Sparse);
        assert_eq!(sparse.stored_clusters(16), 0);

        let packed = UnitLayout::from_compression(CompressionResult::Compressed(1100), 16, 512);
        assert_eq!(packed, UnitLayout::Compressed { stored_clusters: 3 });
        assert_eq!(packed.stored_clusters(16), 3);

        // exactly one cluster saved still counts
        assert_eq!(
            UnitLayout::from_compression(CompressionResult::Compressed(15 * 512), 16, 512),
            UnitLayout::Compressed { stored_clusters: 15 }
        );
        // output spilling into the last cluster saves nothing
        assert_eq!(
            UnitLayout::from_compression(CompressionResult::Compressed(15 * 512 + 1), 16, 512),
            UnitLayout::Uncompressed
        );

        let plain = UnitLayout::from_compression(CompressionResult::Incompressible, 16, 512);
        assert_eq!(plain, UnitLayout::Uncompressed);
        assert_eq!(plain.stored_clusters(16), 16);
    }

    #[test]
    fn encodes_minimal_widths() {
        assert_eq!(encode_run_list(&[DataRun::new(0x10, 4)]), vec![0x11, 0x04, 0x10, 0x00]);
        assert_eq!(encode_run_list(&[DataRun::new(0, 1)]), vec![0x11, 0x01, 0x00, 0x00]);
        assert_eq!(encode_run_list(&[DataRun::new(0x80, 1)]), vec![0x21, 0x01, 0x80, 0x00, 0x00]);
        assert_eq!(encode_run_list(&[DataRun::new(-1, 1)]), vec![0x11, 0x01, 0xFF, 0x00]);
        assert_eq!(encode_run_list(&[DataRun::sparse(0x1234)]), vec![0x02, 0x34, 0x12, 0x00]);
        assert_eq!(encode_run_list(&[]), vec![0x00]);
    }

    fn run_strategy() -> impl Strategy<Value = DataRun> {
        prop_oneof![
            (1u64..=u64::from(u32::MAX), any::<i32>()).prop_map(|(len, off)| DataRun::new(i64::from(off), len)),
            (1u64..=0xFFFF_FFFF_FFFFu64, any::<i64>()).prop_map(|(len, off)| DataRun::new(off, len)),
            (1u64..100_000).prop_map(DataRun::sparse),
        ]
    }

    proptest! {
        #[test]
        fn run_list_round_trips(runs in proptest::collection::vec(run_strategy(), 0..40)) {
            let encoded = encode_run_list(&runs);
            let (decoded, consumed) = decode_run_list(&encoded, 0).unwrap();
            prop_assert_eq!(consumed, encoded.len());
            prop_assert_eq!(decoded, runs);
        }

        #[test]
        fn cooked_runs_are_gapless_and_increasing(
            start_vcn in 0u64..1_000_000,
            spans in proptest::collection::vec((1u64..5_000, 0u64..1_000_000, any::<bool>()), 1..40),
        ) {
            // Build deltas from absolute LCNs so the cooked result is never negative
            let mut prev_lcn = 0i64;
            let runs: Vec<DataRun> = spans
                .iter()
                .map(|&(len, lcn, sparse)| {
                    if sparse {
                        DataRun::sparse(len)
                    } else {
                        let delta = lcn as i64 - prev_lcn;
                        prev_lcn = lcn as i64;
                        DataRun::new(delta, len)
                    }
                })
                .collect();

            let cooked = CookedRuns::cook(&runs, start_vcn, ExtentId(0)).unwrap();
            prop_assert_eq!(cooked.start_vcn(), start_vcn);
            for pair in cooked.runs().windows(2) {
                prop_assert_eq!(pair[1].start_vcn, pair[0].start_vcn + pair[0].length);
                prop_assert!(pair[1].start_vcn > pair[0].start_vcn);
            }
            for (run, &(len, lcn, sparse)) in cooked.iter().zip(spans.iter()) {
                prop_assert_eq!(run.length, len);
                prop_assert_eq!(run.is_sparse, sparse);
                if !sparse {
                    prop_assert_eq!(run.start_lcn, lcn);
                }
            }
        }
    }
}
