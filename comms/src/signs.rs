//! 1-bit sign compression with error feedback.
//!
//! A buffer is represented by one bit per element (set for non-negative values)
//! and a single scale, `||x|| / sqrt(n)`. Decompressing yields `±scale`.

/// A sign compressed chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct Compressed {
    pub bits: Vec<u8>,
    pub scale: f32,
}

/// Packs the sign of every element into bits, most significant bit first.
///
/// # Arguments
/// * `values` - The values to pack, trailing bits of a partial byte stay unset.
///
/// # Returns
/// `values.len().div_ceil(8)` bytes.
pub fn pack_signs(values: &[f32]) -> Vec<u8> {
    values
        .chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .filter(|(_, v)| **v >= 0.)
                .fold(0u8, |byte, (i, _)| byte | (0x80 >> i))
        })
        .collect()
}

/// Adds `±scale` to every element of `out` following the packed signs in `bits`.
pub fn accumulate_signs(bits: &[u8], scale: f32, out: &mut [f32]) {
    for (i, x) in out.iter_mut().enumerate() {
        *x += signed(bits, i, scale);
    }
}

/// Overwrites every element of `out` with `±scale` following the packed signs in `bits`.
pub fn unpack_signs(bits: &[u8], scale: f32, out: &mut [f32]) {
    for (i, x) in out.iter_mut().enumerate() {
        *x = signed(bits, i, scale);
    }
}

#[inline]
fn signed(bits: &[u8], i: usize, scale: f32) -> f32 {
    if bits[i / 8] & (0x80 >> (i % 8)) != 0 {
        scale
    } else {
        -scale
    }
}

/// Compresses `buffer` after adding the residual of the previous round.
///
/// On return `error` holds the new residual, `buffer + error_prev - decompressed`,
/// and `buffer` holds the compensated signal that was compressed.
///
/// # Arguments
/// * `buffer` - The signal to compress.
/// * `error` - The residual carried between rounds, same length as `buffer`.
///
/// # Returns
/// The compressed representation of the compensated signal.
pub fn compress_with_feedback(buffer: &mut [f32], error: &mut [f32]) -> Compressed {
    buffer.iter_mut().zip(error.iter()).for_each(|(x, e)| *x += e);

    let scale = if buffer.is_empty() {
        0.
    } else {
        let norm = buffer.iter().map(|x| x * x).sum::<f32>().sqrt();
        norm / (buffer.len() as f32).sqrt()
    };

    let bits = pack_signs(buffer);

    error
        .iter_mut()
        .zip(buffer.iter())
        .for_each(|(e, x)| *e = if *x >= 0. { x - scale } else { x + scale });

    Compressed { bits, scale }
}
