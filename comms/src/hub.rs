use std::{num::NonZeroUsize, sync::Arc};

use log::debug;
use parking_lot::Mutex;
use tokio::sync::Barrier;

use crate::{
    CommErr, CompressedBackend, Result,
    backend::check_layout,
    signs::{self, Compressed},
};

/// The slots every rank exchanges its compressed chunks through.
#[derive(Debug)]
struct Exchange {
    /// Indexed by `[destination][source]`.
    worker_chunks: Vec<Vec<Option<Compressed>>>,
    server_chunks: Vec<Option<Compressed>>,
}

/// An in-process rendezvous for ranks living in the same process.
///
/// Each rank owns a `HubBackend` and runs on its own task, the reduction follows the
/// two stage scheme: every rank compresses its buffer and scatters one chunk to each
/// server rank, each server averages its chunk, compresses it again with its own
/// residual and finally every rank gathers all the server chunks.
#[derive(Debug)]
pub struct Hub {
    world_size: usize,
    barrier: Barrier,
    exchange: Mutex<Exchange>,
}

impl Hub {
    /// Creates a new `Hub` and returns one backend per rank.
    ///
    /// # Arguments
    /// * `world_size` - The amount of ranks that will take part in every reduction.
    ///
    /// # Returns
    /// The backends, ordered by rank.
    pub fn new(world_size: NonZeroUsize) -> Vec<HubBackend> {
        let world_size = world_size.get();

        let hub = Arc::new(Self {
            world_size,
            barrier: Barrier::new(world_size),
            exchange: Mutex::new(Exchange {
                worker_chunks: (0..world_size).map(|_| vec![None; world_size]).collect(),
                server_chunks: vec![None; world_size],
            }),
        });

        (0..world_size)
            .map(|rank| HubBackend {
                rank,
                hub: Arc::clone(&hub),
            })
            .collect()
    }
}

/// A single rank's handle on a `Hub`.
#[derive(Debug)]
pub struct HubBackend {
    rank: usize,
    hub: Arc<Hub>,
}

impl HubBackend {
    /// Returns the rank of this backend.
    pub fn rank(&self) -> usize {
        self.rank
    }

    fn scatter(&self, compressed: Compressed, chunk: usize) {
        let Self { rank, hub } = self;
        let chunk_bytes = chunk / 8;

        let mut exchange = hub.exchange.lock();
        for (dest, slots) in exchange.worker_chunks.iter_mut().enumerate() {
            let bits = compressed.bits[dest * chunk_bytes..(dest + 1) * chunk_bytes].to_vec();
            slots[*rank] = Some(Compressed {
                bits,
                scale: compressed.scale,
            });
        }
    }

    fn gather_server_chunk(&self, chunk: usize) -> Result<Vec<f32>> {
        let Self { rank, hub } = self;
        let world_size = hub.world_size as f32;
        let mut averaged = vec![0.; chunk];

        let mut exchange = hub.exchange.lock();
        for (source, slot) in exchange.worker_chunks[*rank].iter_mut().enumerate() {
            let part = slot
                .take()
                .ok_or(CommErr::MissingContribution { rank: source })?;
            signs::accumulate_signs(&part.bits, part.scale / world_size, &mut averaged);
        }

        Ok(averaged)
    }

    fn allgather(&self, buffer: &mut [f32], chunk: usize) -> Result<()> {
        let exchange = self.hub.exchange.lock();

        for (source, out) in buffer.chunks_mut(chunk).enumerate() {
            let part = exchange.server_chunks[source]
                .as_ref()
                .ok_or(CommErr::MissingContribution { rank: source })?;
            signs::unpack_signs(&part.bits, part.scale, out);
        }

        Ok(())
    }
}

impl CompressedBackend for HubBackend {
    fn world_size(&self) -> usize {
        self.hub.world_size
    }

    async fn compressed_allreduce(
        &mut self,
        buffer: &mut [f32],
        worker_error: &mut [f32],
        server_error: &mut [f32],
        _local_rank: usize,
    ) -> Result<()> {
        let chunk = check_layout(self.hub.world_size, buffer, worker_error, server_error)?;

        let compressed = signs::compress_with_feedback(buffer, worker_error);
        self.scatter(compressed, chunk);
        self.hub.barrier.wait().await;

        let mut averaged = self.gather_server_chunk(chunk)?;
        let compressed = signs::compress_with_feedback(&mut averaged, server_error);
        self.hub.exchange.lock().server_chunks[self.rank] = Some(compressed);
        self.hub.barrier.wait().await;

        self.allgather(buffer, chunk)?;
        debug!(rank = self.rank, elements = buffer.len(); "compressed allreduce finished");
        Ok(())
    }
}
