//! Fusion of every parameter's momentum into a single reduction buffer.
//!
//! The fused buffer is an arena: each parameter owns a fixed range of it, assigned in
//! group/parameter order, and reads or writes its momentum through a view over that
//! range. The tail is zero padding so the buffer splits evenly across ranks at byte
//! granularity once every element is packed into a single bit.

use std::{mem, ops::Range};

use log::info;
use ndarray::{ArrayD, ArrayView, ArrayViewD, ArrayViewMut, ArrayViewMutD, IxDyn};

use crate::Result;

/// Returns the per-rank alignment factor, `8 * world_size / gcd(world_size, 8)`.
pub fn divider(world_size: usize) -> usize {
    8 * world_size / gcd(world_size, 8)
}

/// Returns the element count the fused buffer must be a multiple of.
pub fn alignment(world_size: usize) -> usize {
    world_size * divider(world_size)
}

fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// The contiguous reduction buffer every momentum lives in once fused.
#[derive(Debug, Clone)]
pub struct FusedMomentum {
    flat: Vec<f32>,
    segments: Vec<Vec<Range<usize>>>,
    padding: usize,
    chunk_size: usize,
}

impl FusedMomentum {
    /// The length of the fused buffer, padding included.
    pub fn corrected_size(&self) -> usize {
        self.flat.len()
    }

    /// The length of the chunk each rank reduces as a server.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// The amount of trailing padding elements.
    pub fn padding(&self) -> usize {
        self.padding
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.flat
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.flat
    }

    /// Returns the range of the fused buffer backing a parameter's momentum.
    pub fn segment(&self, group: usize, param: usize) -> Range<usize> {
        self.segments[group][param].clone()
    }
}

/// Owns the momentum of every parameter, detached or fused.
#[derive(Debug, Clone)]
pub struct MomentumFlattener {
    world_size: usize,
    shapes: Vec<Vec<Vec<usize>>>,
    /// One buffer per parameter, empty while the momentum is fused.
    detached: Vec<Vec<ArrayD<f32>>>,
    fused: Option<FusedMomentum>,
}

impl MomentumFlattener {
    /// Creates a new `MomentumFlattener` holding zeroed, detached momentum.
    ///
    /// # Arguments
    /// * `shapes` - The shape of every parameter, by group.
    /// * `world_size` - The amount of ranks the fused buffer is split across.
    ///
    /// # Returns
    /// A new `MomentumFlattener` instance.
    pub fn new(shapes: Vec<Vec<Vec<usize>>>, world_size: usize) -> Self {
        let detached = zeros(&shapes);

        Self {
            world_size,
            shapes,
            detached,
            fused: None,
        }
    }

    pub fn shape(&self, group: usize, param: usize) -> &[usize] {
        &self.shapes[group][param]
    }

    pub fn shapes(&self) -> &[Vec<Vec<usize>>] {
        &self.shapes
    }

    pub fn is_fused(&self) -> bool {
        self.fused.is_some()
    }

    /// Returns the fused buffer, if the momentum is fused.
    pub fn fused(&self) -> Option<&FusedMomentum> {
        self.fused.as_ref()
    }

    /// Computes the fused layout sizes without fusing.
    ///
    /// # Returns
    /// The corrected buffer size and the per-rank chunk size.
    pub fn fused_sizes(&self) -> (usize, usize) {
        let numel: usize = self
            .shapes
            .iter()
            .flatten()
            .map(|shape| shape.iter().product::<usize>())
            .sum();

        let corrected = numel.next_multiple_of(alignment(self.world_size));
        (corrected, corrected / self.world_size)
    }

    /// Copies every detached momentum into a freshly allocated fused buffer.
    ///
    /// Does nothing if the momentum is already fused.
    ///
    /// # Returns
    /// The fused buffer.
    pub fn flatten(&mut self) -> &mut FusedMomentum {
        let (corrected, chunk_size) = self.fused_sizes();
        let Self { detached, fused, .. } = self;

        fused.get_or_insert_with(|| {
            let fused = fuse(&mem::take(detached), corrected, chunk_size);

            info!(
                elements = corrected,
                padding = fused.padding,
                chunk_size = chunk_size;
                "fused momentum buffer allocated"
            );

            fused
        })
    }

    /// Copies the fused momentum back into one buffer per parameter and drops the fused buffer.
    pub fn unflatten(&mut self) -> Result<()> {
        let Some(fused) = &self.fused else {
            return Ok(());
        };

        let detached = self
            .shapes
            .iter()
            .zip(&fused.segments)
            .map(|(shapes, segments)| {
                shapes
                    .iter()
                    .zip(segments)
                    .map(|(shape, range)| {
                        let view = ArrayView::from_shape(IxDyn(shape), &fused.flat[range.clone()])?;
                        Ok(view.to_owned())
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        self.detached = detached;
        self.fused = None;
        Ok(())
    }

    /// Replaces every momentum with the given detached buffers.
    ///
    /// # Arguments
    /// * `momentum` - One buffer per parameter, shaped like the parameters.
    pub fn replace(&mut self, momentum: Vec<Vec<ArrayD<f32>>>) {
        self.detached = momentum;
        self.fused = None;
    }

    /// Returns a view of a parameter's momentum.
    pub fn view(&self, group: usize, param: usize) -> Result<ArrayViewD<'_, f32>> {
        match &self.fused {
            None => Ok(self.detached[group][param].view()),
            Some(fused) => {
                let range = fused.segment(group, param);
                let shape = IxDyn(&self.shapes[group][param]);
                Ok(ArrayView::from_shape(shape, &fused.flat[range])?)
            }
        }
    }

    /// Returns a mutable view of a parameter's momentum.
    ///
    /// Once fused, writes through the view land in the fused buffer.
    pub fn view_mut(&mut self, group: usize, param: usize) -> Result<ArrayViewMutD<'_, f32>> {
        match &mut self.fused {
            None => Ok(self.detached[group][param].view_mut()),
            Some(fused) => {
                let range = fused.segment(group, param);
                let shape = IxDyn(&self.shapes[group][param]);
                Ok(ArrayViewMut::from_shape(shape, &mut fused.flat[range])?)
            }
        }
    }

    /// Copies every momentum out of the flattener.
    pub fn snapshot(&self) -> Result<Vec<Vec<ArrayD<f32>>>> {
        self.shapes
            .iter()
            .enumerate()
            .map(|(i, group)| {
                (0..group.len())
                    .map(|j| Ok(self.view(i, j)?.to_owned()))
                    .collect::<Result<Vec<_>>>()
            })
            .collect()
    }
}

fn fuse(detached: &[Vec<ArrayD<f32>>], corrected: usize, chunk_size: usize) -> FusedMomentum {
    let mut flat = Vec::with_capacity(corrected);

    let segments = detached
        .iter()
        .map(|group| {
            group
                .iter()
                .map(|momentum| {
                    let start = flat.len();
                    flat.extend(momentum.iter().copied());
                    start..flat.len()
                })
                .collect()
        })
        .collect();

    let padding = corrected - flat.len();
    flat.resize(corrected, 0.);

    FusedMomentum {
        flat,
        segments,
        padding,
        chunk_size,
    }
}

fn zeros(shapes: &[Vec<Vec<usize>>]) -> Vec<Vec<ArrayD<f32>>> {
    shapes
        .iter()
        .map(|group| {
            group
                .iter()
                .map(|shape| ArrayD::zeros(IxDyn(shape)))
                .collect()
        })
        .collect()
}
