//! WAV wrapping for raw PCM uploads.
//!
//! Transcription endpoints want a container, but browsers and native clients
//! usually stream bare 16-bit little-endian mono PCM. The header is written in
//! front of the untouched samples.

use byteorder::{LittleEndian, WriteBytesExt};
use std::io::{self, Write};

/// Sample rate assumed for `pcm16` payloads.
pub const PCM_SAMPLE_RATE: u32 = 16_000;
const CHANNELS: u16 = 1;
const BITS_PER_SAMPLE: u16 = 16;
const HEADER_LEN: usize = 44;

/// Sizes for the `data` chunk and the enclosing RIFF chunk. Both are `u32` on disk.
fn chunk_lengths(pcm_len: usize) -> io::Result<(u32, u32)> {
    let too_large = || io::Error::new(io::ErrorKind::InvalidInput, "PCM payload too large for WAV");
    let data_len = u32::try_from(pcm_len).map_err(|_| too_large())?;
    let riff_len = data_len.checked_add(36).ok_or_else(too_large)?;
    Ok((data_len, riff_len))
}

pub fn wrap_pcm16(pcm: &[u8], sample_rate: u32) -> io::Result<Vec<u8>> {
    let (data_len, riff_len) = chunk_lengths(pcm.len())?;
    let block_align = CHANNELS * BITS_PER_SAMPLE / 8;
    let byte_rate = sample_rate * u32::from(block_align);

    let mut out = Vec::with_capacity(HEADER_LEN + pcm.len());
    out.write_all(b"RIFF")?;
    out.write_u32::<LittleEndian>(riff_len)?;
    out.write_all(b"WAVE")?;

    out.write_all(b"fmt ")?;
    out.write_u32::<LittleEndian>(16)?;
    out.write_u16::<LittleEndian>(1)?; // PCM
    out.write_u16::<LittleEndian>(CHANNELS)?;
    out.write_u32::<LittleEndian>(sample_rate)?;
    out.write_u32::<LittleEndian>(byte_rate)?;
    out.write_u16::<LittleEndian>(block_align)?;
    out.write_u16::<LittleEndian>(BITS_PER_SAMPLE)?;

    out.write_all(b"data")?;
    out.write_u32::<LittleEndian>(data_len)?;
    out.write_all(pcm)?;
    Ok(out)
}
