//! LZNT1 compression
//!
//! NTFS compresses each compression unit as a sequence of 4 KiB chunks. A
//! chunk starts with a 16-bit header: bit 15 set means the chunk is
//! compressed, the low 12 bits hold the stored size minus one. Compressed
//! chunks are groups of one flag byte followed by up to eight items, each
//! either a literal byte or a 16-bit back-reference whose offset/length split
//! depends on how far into the chunk the decoder is.

use crate::error::{MftError, Result, StructureKind};
use byteorder::{ByteOrder, LittleEndian};

/// Decoded chunk size
pub const CHUNK_SIZE: usize = 0x1000;

const CHUNK_COMPRESSED: u16 = 0x8000;
const CHUNK_SIZE_MASK: u16 = 0x0FFF;
const COMPRESSED_HEADER: u16 = 0xB000;
const UNCOMPRESSED_HEADER: u16 = 0x3000;
const MIN_MATCH: usize = 3;

/// Number of offset bits in a back-reference emitted at each chunk position
static OFFSET_BITS: [u8; CHUNK_SIZE] = offset_bits_table();

const fn offset_bits_table() -> [u8; CHUNK_SIZE] {
    let mut table = [0u8; CHUNK_SIZE];
    let mut bits = 0u8;
    let mut threshold = 0x10usize;
    let mut pos = 0;
    while pos < CHUNK_SIZE {
        table[pos] = 4 + bits;
        if pos == threshold {
            threshold <<= 1;
            bits += 1;
        }
        pos += 1;
    }
    table
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionResult {
    /// Compressed form occupies this many bytes of the output
    Compressed(usize),
    /// Compressed form would not be smaller than the input
    Incompressible,
    /// Input is entirely zero; store nothing
    AllZeros,
}

/// Codec used for compression units of compressed attributes
pub trait BlockCompressor: Send + Sync {
    fn compress(&self, raw: &[u8], out: &mut [u8]) -> CompressionResult;

    /// Decode into `out`, returning the number of bytes produced
    fn decompress(&self, compressed: &[u8], out: &mut [u8]) -> Result<usize>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Lznt1;

impl Lznt1 {
    pub fn new() -> Self {
        Self
    }
}

impl BlockCompressor for Lznt1 {
    fn compress(&self, raw: &[u8], out: &mut [u8]) -> CompressionResult {
        if raw.iter().all(|&b| b == 0) {
            return CompressionResult::AllZeros;
        }

        let mut dst = 0usize;
        let mut scratch = Vec::with_capacity(CHUNK_SIZE + CHUNK_SIZE / 8 + 2);

        for chunk in raw.chunks(CHUNK_SIZE) {
            scratch.clear();
            compress_chunk(chunk, &mut scratch);

            let (header, body): (u16, &[u8]) = if scratch.len() >= chunk.len() {
                (UNCOMPRESSED_HEADER | (chunk.len() - 1) as u16, chunk)
            } else {
                (COMPRESSED_HEADER | (scratch.len() - 1) as u16, &scratch)
            };

            if dst + 2 + body.len() > out.len() {
                return CompressionResult::Incompressible;
            }
            LittleEndian::write_u16(&mut out[dst..dst + 2], header);
            out[dst + 2..dst + 2 + body.len()].copy_from_slice(body);
            dst += 2 + body.len();
        }

        if dst >= raw.len() {
            return CompressionResult::Incompressible;
        }
        CompressionResult::Compressed(dst)
    }

    fn decompress(&self, compressed: &[u8], out: &mut [u8]) -> Result<usize> {
        let mut src = 0usize;
        let mut dst = 0usize;

        while src + 2 <= compressed.len() {
            let header = LittleEndian::read_u16(&compressed[src..src + 2]);
            src += 2;
            if header == 0 {
                break;
            }

            let stored = (header & CHUNK_SIZE_MASK) as usize + 1;
            let chunk_end = src + stored;
            if chunk_end > compressed.len() {
                return Err(MftError::format(
                    StructureKind::CompressionUnit,
                    src - 2,
                    format!("chunk of {} bytes runs past end of compressed data", stored),
                ));
            }

            if header & CHUNK_COMPRESSED == 0 {
                if dst + stored > out.len() {
                    return Err(overflow(src - 2));
                }
                out[dst..dst + stored].copy_from_slice(&compressed[src..chunk_end]);
                src = chunk_end;
                dst += stored;
                continue;
            }

            let chunk_start = dst;
            while src < chunk_end {
                let mut flags = compressed[src];
                src += 1;

                for _ in 0..8 {
                    if src >= chunk_end {
                        break;
                    }

                    if flags & 1 == 0 {
                        if dst >= out.len() {
                            return Ok(dst);
                        }
                        out[dst] = compressed[src];
                        dst += 1;
                        src += 1;
                    } else {
                        if src + 2 > chunk_end {
                            return Err(MftError::format(
                                StructureKind::CompressionUnit,
                                src,
                                "back-reference truncated by end of chunk",
                            ));
                        }
                        let token = LittleEndian::read_u16(&compressed[src..src + 2]);
                        src += 2;

                        let pos = dst - chunk_start;
                        if pos == 0 || pos >= CHUNK_SIZE {
                            return Err(MftError::format(
                                StructureKind::CompressionUnit,
                                src - 2,
                                format!("back-reference at chunk position {}", pos),
                            ));
                        }
                        let length_bits = 16 - u32::from(OFFSET_BITS[pos]);
                        let length_mask = (1u16 << length_bits) - 1;
                        let distance = (token >> length_bits) as usize + 1;
                        let length = (token & length_mask) as usize + MIN_MATCH;

                        if distance > pos {
                            return Err(MftError::format(
                                StructureKind::CompressionUnit,
                                src - 2,
                                format!("back-reference distance {} exceeds chunk position {}", distance, pos),
                            ));
                        }
                        if dst + length > out.len() {
                            return Err(overflow(src - 2));
                        }

                        // Byte-wise copy; source and destination may overlap
                        for _ in 0..length {
                            out[dst] = out[dst - distance];
                            dst += 1;
                        }
                    }

                    flags >>= 1;
                }
            }

            // A short compressed chunk still decodes to a full 4 KiB, the tail
            // being zero, unless the output ends inside that chunk.
            if dst < chunk_start + CHUNK_SIZE {
                if chunk_start + CHUNK_SIZE > out.len() {
                    return Ok(dst);
                }
                out[dst..chunk_start + CHUNK_SIZE].fill(0);
                dst = chunk_start + CHUNK_SIZE;
            }
        }

        Ok(dst)
    }
}

fn overflow(offset: usize) -> MftError {
    MftError::format(
        StructureKind::CompressionUnit,
        offset,
        "decompressed data exceeds the compression unit",
    )
}

/// Greedy LZ77 over a single chunk
fn compress_chunk(chunk: &[u8], out: &mut Vec<u8>) {
    let mut pos = 0usize;

    while pos < chunk.len() {
        let flag_pos = out.len();
        out.push(0);
        let mut flags = 0u8;

        for bit in 0..8 {
            if pos >= chunk.len() {
                break;
            }

            match longest_match(chunk, pos) {
                Some((distance, length)) => {
                    let length_bits = 16 - u32::from(OFFSET_BITS[pos]);
                    let token = (((distance - 1) as u16) << length_bits) | (length - MIN_MATCH) as u16;
                    out.extend_from_slice(&token.to_le_bytes());
                    flags |= 1 << bit;
                    pos += length;
                }
                None => {
                    out.push(chunk[pos]);
                    pos += 1;
                }
            }
        }

        out[flag_pos] = flags;
    }
}

fn longest_match(chunk: &[u8], pos: usize) -> Option<(usize, usize)> {
    if pos == 0 {
        return None;
    }

    let offset_bits = u32::from(OFFSET_BITS[pos]);
    let length_bits = 16 - offset_bits;
    let max_distance = pos.min(1 << offset_bits);
    let max_length = ((1usize << length_bits) - 1 + MIN_MATCH).min(chunk.len() - pos);
    if max_length < MIN_MATCH {
        return None;
    }

    let mut best: Option<(usize, usize)> = None;
    for distance in 1..=max_distance {
        let start = pos - distance;
        let mut length = 0;
        while length < max_length && chunk[start + length] == chunk[pos + length] {
            length += 1;
        }
        if length >= MIN_MATCH && best.map_or(true, |(_, l)| length > l) {
            best = Some((distance, length));
            if length == max_length {
                break;
            }
        }
    }
    best
}
