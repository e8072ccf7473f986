//! # Compression Module
//!
//! Input payloads are sent as an XOR delta against the last input the peer acknowledged,
//! followed by a run-length encoding of zero bytes. Held buttons produce long zero runs, so a
//! packet carrying many redundant frames stays small.
//!
//! ## RLE format
//!
//! A sequence of chunks, each starting with a control byte:
//!
//! - `0x80 | (n - 1)`: a run of `n` zero bytes (`n` in `1..=128`), nothing follows.
//! - `n - 1`: `n` literal bytes follow (`n` in `1..=128`).
//!
//! ```
//! use rollback_netcode::__internal::{decode, encode};
//!
//! let reference = [0u8, 0];
//! let inputs = [vec![1u8, 0], vec![1, 0], vec![1, 2]];
//! let packed = encode(&reference, inputs.iter().map(|i| i.as_slice()));
//! assert_eq!(decode(&reference, &packed).unwrap(), inputs.to_vec());
//! ```
//!
//! # Note
//!
//! These functions are re-exported in [`__internal`](crate::__internal) for testing.
//! They are not part of the stable public API.

use std::error::Error;
use std::fmt;

use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};

/// Longest run or literal chunk a single control byte describes.
const MAX_CHUNK: usize = 128;
/// Control bit marking a zero run.
const RUN_FLAG: u8 = 0x80;

/// Error type for decompression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CompressionError {
    /// A literal chunk announces more bytes than the buffer holds.
    TruncatedData {
        /// Offset of the offending control byte.
        offset: usize,
        /// Length of the encoded buffer.
        buffer_len: usize,
    },
    /// The reference input is empty, so the payload cannot be split into inputs.
    EmptyReference,
    /// The decoded length is not a multiple of the reference length.
    DataLengthMismatch {
        /// Length of the decoded data.
        data_len: usize,
        /// Length of the reference input.
        reference_len: usize,
    },
}

impl fmt::Display for CompressionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TruncatedData { offset, buffer_len } => write!(
                f,
                "RLE chunk at offset {} runs past the end of the {} byte buffer",
                offset, buffer_len
            ),
            Self::EmptyReference => write!(f, "delta decode with empty reference"),
            Self::DataLengthMismatch {
                data_len,
                reference_len,
            } => write!(
                f,
                "decoded length {} is not a multiple of input size {}",
                data_len, reference_len
            ),
        }
    }
}

impl Error for CompressionError {}

/// Encodes inputs using XOR delta encoding followed by zero-run RLE.
pub fn encode<'a>(reference: &[u8], pending_input: impl Iterator<Item = &'a [u8]>) -> Vec<u8> {
    rle_encode(&delta_encode(reference, pending_input))
}

/// Performs XOR delta encoding against a reference.
///
/// Inputs whose length differs from the reference are skipped.
pub fn delta_encode<'a>(ref_bytes: &[u8], pending_input: impl Iterator<Item = &'a [u8]>) -> Vec<u8> {
    let (lower, upper) = pending_input.size_hint();
    let mut bytes = Vec::with_capacity(upper.unwrap_or(lower) * ref_bytes.len());

    for input in pending_input {
        if input.len() != ref_bytes.len() {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "delta_encode: input length {} doesn't match reference length {} - skipping",
                input.len(),
                ref_bytes.len()
            );
            continue;
        }
        bytes.extend(ref_bytes.iter().zip(input).map(|(r, i)| r ^ i));
    }
    bytes
}

/// Decodes RLE-compressed XOR delta-encoded data into one buffer per input.
///
/// # Errors
///
/// Returns a `CompressionError` if the RLE data is truncated, the reference is empty or the
/// decoded length does not split into whole inputs.
pub fn decode(reference: &[u8], data: &[u8]) -> Result<Vec<Vec<u8>>, CompressionError> {
    let buf = rle_decode(data)?;
    delta_decode(reference, &buf)
}

/// Decodes XOR delta-encoded data against a reference.
///
/// # Errors
///
/// Returns a `CompressionError` if the reference is empty or the data length is not a multiple
/// of the reference length.
pub fn delta_decode(ref_bytes: &[u8], data: &[u8]) -> Result<Vec<Vec<u8>>, CompressionError> {
    if ref_bytes.is_empty() {
        return Err(CompressionError::EmptyReference);
    }
    if data.len() % ref_bytes.len() != 0 {
        return Err(CompressionError::DataLengthMismatch {
            data_len: data.len(),
            reference_len: ref_bytes.len(),
        });
    }

    Ok(data
        .chunks_exact(ref_bytes.len())
        .map(|chunk| chunk.iter().zip(ref_bytes).map(|(d, r)| d ^ r).collect())
        .collect())
}

fn rle_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() / 2 + 2);
    let mut literal_start: Option<usize> = None;
    let mut i = 0;

    while i < data.len() {
        let run = data[i..]
            .iter()
            .take(MAX_CHUNK)
            .take_while(|byte| **byte == 0)
            .count();
        // a lone zero inside literals is cheaper as a literal
        if run >= 2 || (run == 1 && literal_start.is_none()) {
            if let Some(start) = literal_start.take() {
                push_literals(&mut out, &data[start..i]);
            }
            out.push(RUN_FLAG | (run - 1) as u8);
            i += run;
        } else {
            if literal_start.is_none() {
                literal_start = Some(i);
            }
            i += 1;
        }
    }
    if let Some(start) = literal_start {
        push_literals(&mut out, &data[start..]);
    }
    out
}

fn push_literals(out: &mut Vec<u8>, literals: &[u8]) {
    for chunk in literals.chunks(MAX_CHUNK) {
        out.push((chunk.len() - 1) as u8);
        out.extend_from_slice(chunk);
    }
}

fn rle_decode(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut out = Vec::with_capacity(data.len() * 2);
    let mut offset = 0;

    while let Some(&control) = data.get(offset) {
        let len = usize::from(control & !RUN_FLAG) + 1;
        if control & RUN_FLAG != 0 {
            out.resize(out.len() + len, 0);
            offset += 1;
        } else {
            let literals = data
                .get(offset + 1..offset + 1 + len)
                .ok_or(CompressionError::TruncatedData {
                    offset,
                    buffer_len: data.len(),
                })?;
            out.extend_from_slice(literals);
            offset += 1 + len;
        }
    }
    Ok(out)
}

// #########
// # TESTS #
// #########
