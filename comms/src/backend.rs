use crate::{CommErr, Result};

/// The quantized error-feedback all-reduce primitive.
///
/// Every rank calls `compressed_allreduce` the same number of times with buffers of
/// the same length. On return `buffer` holds the cross-worker quantized average, and
/// both error buffers carry the quantization residual into the next call.
#[allow(unused)]
#[trait_variant::make(CompressedBackend: Send)]
pub trait CompressedBackendTemplate {
    /// The amount of ranks taking part in every reduction.
    fn world_size(&self) -> usize;

    /// Averages `buffer` across every rank using 1-bit compression with error feedback.
    ///
    /// # Arguments
    /// * `buffer` - The local contribution, overwritten with the reduced values.
    /// * `worker_error` - The worker side residual, the same length as `buffer`.
    /// * `server_error` - The server side residual, `buffer.len() / world_size` long.
    /// * `local_rank` - The local device this rank runs on.
    ///
    /// # Returns
    /// A `CommErr` if the buffers violate the layout contract or a peer's contribution is missing.
    async fn compressed_allreduce(
        &mut self,
        buffer: &mut [f32],
        worker_error: &mut [f32],
        server_error: &mut [f32],
        local_rank: usize,
    ) -> Result<()>;
}

/// Checks the buffer layout every backend expects.
///
/// `buffer` must split into `world_size` chunks whose sign bits fill whole bytes.
pub fn check_layout(
    world_size: usize,
    buffer: &[f32],
    worker_error: &[f32],
    server_error: &[f32],
) -> Result<usize> {
    let alignment = world_size * 8;
    if buffer.len() % alignment != 0 {
        return Err(CommErr::Misaligned {
            len: buffer.len(),
            alignment,
        });
    }

    if worker_error.len() != buffer.len() {
        return Err(CommErr::SizeMismatch {
            what: "worker error",
            got: worker_error.len(),
            expected: buffer.len(),
        });
    }

    let chunk = buffer.len() / world_size;
    if server_error.len() != chunk {
        return Err(CommErr::SizeMismatch {
            what: "server error",
            got: server_error.len(),
            expected: chunk,
        });
    }

    Ok(chunk)
}
