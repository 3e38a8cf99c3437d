//! Multi-sector protection for FILE and INDX records
//!
//! Before a record is written, the last two bytes of every sector are saved
//! into the update sequence array and replaced by the update sequence number.
//! A torn write leaves at least one sector with a stale number, which the
//! reader detects before restoring the saved bytes.

use crate::error::{MftError, Result, StructureKind};
use crate::ntfs::field;
use crate::ntfs::structs::{BAD_RECORD_SIGNATURE, INDEX_BLOCK_SIGNATURE};

/// Smallest sector NTFS protects; larger strides are powers of two
pub const MIN_SECTOR_SIZE: usize = 256;

/// Reject a fixup stride that cannot divide a record into protected sectors
pub fn check_sector_size(sector_size: usize, kind: StructureKind) -> Result<()> {
    if sector_size < MIN_SECTOR_SIZE || !sector_size.is_power_of_two() {
        return Err(MftError::format(
            kind,
            0,
            format!("unusable sector size of {} bytes", sector_size),
        ));
    }
    Ok(())
}

/// Header shared by every fixup-protected record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixupHeader {
    pub magic: [u8; 4],
    /// Offset of the update sequence array
    pub usa_offset: u16,
    /// Entries in the array, the sequence number included
    pub usa_count: u16,
    pub lsn: u64,
    pub sequence_number: u16,
    /// Original trailing bytes of each sector
    pub saved: Vec<u16>,
}

impl FixupHeader {
    pub fn new(magic: [u8; 4], usa_offset: u16, record_size: usize, sector_size: usize) -> Self {
        let sectors = record_size.div_ceil(sector_size.max(MIN_SECTOR_SIZE));
        Self {
            magic,
            usa_offset,
            usa_count: (1 + sectors) as u16,
            lsn: 0,
            sequence_number: 1,
            saved: vec![0; sectors],
        }
    }

    pub fn sector_count(&self) -> usize {
        self.usa_count.saturating_sub(1) as usize
    }

    /// Bytes taken by the array, sequence number included
    pub fn usa_size(&self) -> usize {
        self.usa_count as usize * 2
    }

    pub fn usa_end(&self) -> usize {
        self.usa_offset as usize + self.usa_size()
    }

    fn kind(&self) -> StructureKind {
        match self.magic {
            INDEX_BLOCK_SIGNATURE => StructureKind::IndexBlock,
            _ => StructureKind::FileRecord,
        }
    }

    /// Verify every protected sector and restore the saved bytes in place.
    ///
    /// On a mismatch the buffer is left untouched.
    pub fn unprotect(buf: &mut [u8], magic: [u8; 4], sector_size: usize, kind: StructureKind) -> Result<Self> {
        check_sector_size(sector_size, kind)?;
        let disk_magic = field::slice_at(buf, 0, 4, kind)?;
        if disk_magic == BAD_RECORD_SIGNATURE {
            return Err(MftError::format(kind, 0, "record marked BAAD after a failed write"));
        }
        if disk_magic != magic {
            return Err(MftError::format(
                kind,
                0,
                format!(
                    "signature {:?} does not match {:?}",
                    String::from_utf8_lossy(disk_magic),
                    String::from_utf8_lossy(&magic)
                ),
            ));
        }

        let usa_offset = field::u16_at(buf, 0x04, kind)?;
        let usa_count = field::u16_at(buf, 0x06, kind)?;
        let lsn = field::u64_at(buf, 0x08, kind)?;

        if usa_count == 0 {
            return Err(MftError::format(kind, 0x06, "empty update sequence array"));
        }
        let sectors = usa_count as usize - 1;
        if sectors * sector_size > buf.len() {
            return Err(MftError::format(
                kind,
                0x06,
                format!(
                    "update sequence array covers {} sectors but the record is {} bytes",
                    sectors,
                    buf.len()
                ),
            ));
        }

        let base = usa_offset as usize;
        let sequence_number = field::u16_at(buf, base, kind)?;
        let saved = (0..sectors)
            .map(|i| field::u16_at(buf, base + 2 * (i + 1), kind))
            .collect::<Result<Vec<_>>>()?;

        for i in 0..sectors {
            let pos = (i + 1) * sector_size - 2;
            let stamped = field::u16_at(buf, pos, kind)?;
            if stamped != sequence_number {
                return Err(MftError::format(
                    kind,
                    pos,
                    format!(
                        "sector {} ends with {:#06x}, expected update sequence number {:#06x}",
                        i, stamped, sequence_number
                    ),
                ));
            }
        }

        for (i, &value) in saved.iter().enumerate() {
            field::put_u16(buf, (i + 1) * sector_size - 2, value);
        }

        Ok(Self {
            magic,
            usa_offset,
            usa_count,
            lsn,
            sequence_number,
            saved,
        })
    }

    /// Bump the sequence number, save and stamp every sector, then write the
    /// header and update sequence array.
    pub fn protect(&mut self, buf: &mut [u8], sector_size: usize) -> Result<()> {
        let kind = self.kind();
        check_sector_size(sector_size, kind)?;
        let sectors = self.sector_count();
        if self.usa_end() > buf.len() || sectors * sector_size > buf.len() {
            return Err(MftError::format(
                kind,
                0,
                format!(
                    "{}-byte buffer cannot hold {} protected sectors",
                    buf.len(),
                    sectors
                ),
            ));
        }

        self.sequence_number = match self.sequence_number.wrapping_add(1) {
            0 => 1,
            n => n,
        };

        self.saved = (0..sectors)
            .map(|i| field::u16_at(buf, (i + 1) * sector_size - 2, kind))
            .collect::<Result<Vec<_>>>()?;
        for i in 0..sectors {
            field::put_u16(buf, (i + 1) * sector_size - 2, self.sequence_number);
        }

        buf[0..4].copy_from_slice(&self.magic);
        field::put_u16(buf, 0x04, self.usa_offset);
        field::put_u16(buf, 0x06, self.usa_count);
        field::put_u64(buf, 0x08, self.lsn);

        let base = self.usa_offset as usize;
        field::put_u16(buf, base, self.sequence_number);
        for (i, &value) in self.saved.iter().enumerate() {
            field::put_u16(buf, base + 2 * (i + 1), value);
        }
        Ok(())
    }
}

/// A record whose on-disk form is fixup-protected
pub trait FixupRecord: Sized {
    const MAGIC: [u8; 4];
    const KIND: StructureKind;

    /// What the payload decoder needs to know beyond the bytes themselves
    type Layout: Copy;

    fn fixup(&self) -> &FixupHeader;

    fn fixup_mut(&mut self) -> &mut FixupHeader;

    /// Decode the payload of an already unprotected buffer
    fn parse_payload(fixup: FixupHeader, buf: &[u8], layout: Self::Layout) -> Result<Self>;

    /// Encode the payload; the fixup header is written afterwards
    fn write_payload(&self, buf: &mut [u8]) -> Result<()>;

    fn from_protected(data: &[u8], sector_size: usize, layout: Self::Layout) -> Result<Self> {
        let mut buf = data.to_vec();
        let fixup = FixupHeader::unprotect(&mut buf, Self::MAGIC, sector_size, Self::KIND)?;
        Self::parse_payload(fixup, &buf, layout)
    }

    fn to_protected(&mut self, record_size: usize, sector_size: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; record_size];
        self.write_payload(&mut buf)?;
        self.fixup_mut().protect(&mut buf, sector_size)?;
        Ok(buf)
    }
}
