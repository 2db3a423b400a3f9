//! The host execution paths.
//!
//! [`Sequential`] is the reference path. [`Parallel`] runs the same
//! per-location arithmetic on the rayon thread pool, so both paths produce
//! the same output bit for bit. Every sum is accumulated in `f64`.

pub mod accumulator;

pub use super::*;
pub use accumulator::*;

#[cfg(debug_assertions)]
use humansize::{format_size, BINARY};
use rayon::prelude::*;

/// The inputs of both passes in host memory.
#[derive(Clone, Copy, Debug)]
///
/// The lengths are checked by [`Inputs::new`].
pub struct Inputs<'a> {
    layout: Layout,
    /// `[C, P]`
    features: &'a [f32],
    /// `[N, K, H, W]`
    weights: &'a [f32],
    /// `[N, K, H, W]`
    candidates: &'a Candidates,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Gradients {
    /// `[C, P]`
    pub features_grad: Vec<f32>,
    /// `[N, K, H, W]`
    pub weights_grad: Vec<f32>,
}

/// A way to run both passes on the host.
pub trait Strategy {
    /// Returns the output `[N, C, H, W]`.
    fn forward(
        &self,
        inputs: &Inputs<'_>,
    ) -> Vec<f32>;

    /// Returns the gradients of the features and the weights.
    ///
    /// ## Arguments
    ///
    /// * `output_grad` - `[N, C, H, W]`
    ///
    /// ## Errors
    ///
    /// [`Error::ShapeMismatch`] if `output_grad` is not `N * C * H * W` long.
    fn backward(
        &self,
        inputs: &Inputs<'_>,
        output_grad: &[f32],
    ) -> Result<Gradients, Error>;
}

/// Visiting the locations one by one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Sequential;

/// Visiting the locations on the rayon thread pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Parallel {
    /// The number of partial gradient tables of the features.
    ///
    /// `0` means one per worker thread.
    pub partition_count: usize,
}

impl<'a> Inputs<'a> {
    pub fn new(
        layout: Layout,
        features: &'a [f32],
        weights: &'a [f32],
        candidates: &'a Candidates,
    ) -> Result<Self, Error> {
        ArrayView::new(features, layout.features_dims()).check("features")?;
        ArrayView::new(weights, layout.slots_dims()).check("weights")?;
        if candidates.len() != layout.slots_len() {
            return Err(Error::ShapeMismatch {
                name: "indices",
                expected: layout.slots_dims().to_vec(),
                actual: vec![candidates.len()],
            });
        }

        Ok(Self {
            layout,
            features,
            weights,
            candidates,
        })
    }

    #[inline]
    pub const fn layout(&self) -> &Layout {
        &self.layout
    }

    /// `[C, P]`
    #[inline]
    pub const fn features(&self) -> &'a [f32] {
        self.features
    }

    /// `[N, K, H, W]`
    #[inline]
    pub const fn weights(&self) -> &'a [f32] {
        self.weights
    }

    /// `[N, K, H, W]`
    #[inline]
    pub const fn candidates(&self) -> &'a Candidates {
        self.candidates
    }

    /// Checking the upstream gradient against the output dimensions.
    pub fn check_output_grad(
        &self,
        output_grad: &[f32],
    ) -> Result<(), Error> {
        ArrayView::new(output_grad, self.layout.output_dims())
            .check("output_grad")
    }

    /// The valid slots at a location as `(offset, point, weight)`.
    #[inline]
    fn contributors(
        &self,
        batch: usize,
        pixel: usize,
    ) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        (0..self.layout.slot_count).filter_map(move |slot| {
            let offset = self.layout.slot_offset(batch, slot, pixel);
            self.candidates.get(offset).map(|point| {
                (offset, point as usize, self.weights[offset] as f64)
            })
        })
    }

    /// `S`
    #[inline]
    fn weight_total(
        &self,
        batch: usize,
        pixel: usize,
    ) -> f64 {
        self.contributors(batch, pixel)
            .map(|(_, _, weight)| weight)
            .sum()
    }

    /// `Σ_k w_k * f_k[c] / S`, or `0` if `S <= 0`.
    #[inline]
    fn blend(
        &self,
        batch: usize,
        channel: usize,
        pixel: usize,
        weight_total: f64,
    ) -> f32 {
        if weight_total <= 0.0 {
            return 0.0;
        }

        let sum = self
            .contributors(batch, pixel)
            .map(|(_, point, weight)| {
                weight
                    * self.features[self.layout.feature_offset(channel, point)]
                        as f64
            })
            .sum::<f64>();

        (sum / weight_total) as f32
    }

    /// `d_k = Σ_c g[c] * f_k[c]`
    #[inline]
    fn feature_dot(
        &self,
        output_grad: &[f32],
        batch: usize,
        pixel: usize,
        point: usize,
    ) -> f64 {
        (0..self.layout.channel_count)
            .map(|channel| {
                output_grad[self.layout.output_offset(batch, channel, pixel)]
                    as f64
                    * self.features[self.layout.feature_offset(channel, point)]
                        as f64
            })
            .sum()
    }

    /// `dot(g, out) = Σ_k w_k * d_k / S`
    #[inline]
    fn output_dot(
        &self,
        output_grad: &[f32],
        batch: usize,
        pixel: usize,
        weight_total: f64,
    ) -> f64 {
        self.contributors(batch, pixel)
            .map(|(_, point, weight)| {
                weight * self.feature_dot(output_grad, batch, pixel, point)
            })
            .sum::<f64>()
            / weight_total
    }

    /// `(d_k - dot(g, out)) / S`
    #[inline]
    fn weight_grad(
        &self,
        output_grad: &[f32],
        batch: usize,
        pixel: usize,
        point: usize,
        weight_total: f64,
        output_dot: f64,
    ) -> f32 {
        ((self.feature_dot(output_grad, batch, pixel, point) - output_dot)
            / weight_total) as f32
    }

    /// Adding `w_k / S * g` to the gradient of every contributing point.
    #[inline]
    fn scatter<A: Accumulator>(
        &self,
        accumulator: &mut A,
        output_grad: &[f32],
        batch: usize,
        pixel: usize,
        weight_total: f64,
    ) {
        for (_, point, weight) in self.contributors(batch, pixel) {
            let scale = weight / weight_total;
            for channel in 0..self.layout.channel_count {
                let grad = output_grad
                    [self.layout.output_offset(batch, channel, pixel)]
                    as f64;
                accumulator.scatter_add(channel, point, scale * grad);
            }
        }
    }
}

impl Strategy for Sequential {
    fn forward(
        &self,
        inputs: &Inputs<'_>,
    ) -> Vec<f32> {
        let layout = &inputs.layout;
        let mut output = vec![0.0; layout.output_len()];

        for batch in 0..layout.batch_size {
            for pixel in 0..layout.pixel_count() {
                let weight_total = inputs.weight_total(batch, pixel);
                for channel in 0..layout.channel_count {
                    output[layout.output_offset(batch, channel, pixel)] =
                        inputs.blend(batch, channel, pixel, weight_total);
                }
            }
        }

        output
    }

    fn backward(
        &self,
        inputs: &Inputs<'_>,
        output_grad: &[f32],
    ) -> Result<Gradients, Error> {
        inputs.check_output_grad(output_grad)?;

        let layout = &inputs.layout;
        let mut features_grad =
            FeaturesGrad::zeros(layout.channel_count, layout.point_count);
        let mut weights_grad = vec![0.0; layout.slots_len()];

        for batch in 0..layout.batch_size {
            for pixel in 0..layout.pixel_count() {
                let weight_total = inputs.weight_total(batch, pixel);
                if weight_total <= 0.0 {
                    continue;
                }

                let output_dot =
                    inputs.output_dot(output_grad, batch, pixel, weight_total);
                for (offset, point, _) in inputs.contributors(batch, pixel) {
                    weights_grad[offset] = inputs.weight_grad(
                        output_grad,
                        batch,
                        pixel,
                        point,
                        weight_total,
                        output_dot,
                    );
                }

                inputs.scatter(
                    &mut features_grad,
                    output_grad,
                    batch,
                    pixel,
                    weight_total,
                );
            }
        }

        Ok(Gradients {
            features_grad: features_grad.into_values(),
            weights_grad,
        })
    }
}

impl Parallel {
    /// `S` of every location in `[N, H, W]`.
    fn weight_totals(inputs: &Inputs<'_>) -> Vec<f64> {
        let pixel_count = inputs.layout.pixel_count();

        (0..inputs.layout.location_count())
            .into_par_iter()
            .map(|location| {
                let batch = location / pixel_count;
                let pixel = location % pixel_count;
                inputs.weight_total(batch, pixel)
            })
            .collect()
    }
}

impl Strategy for Parallel {
    fn forward(
        &self,
        inputs: &Inputs<'_>,
    ) -> Vec<f32> {
        let layout = &inputs.layout;
        let pixel_count = layout.pixel_count();
        let mut output = vec![0.0; layout.output_len()];

        if output.is_empty() {
            return output;
        }

        let weight_totals = Self::weight_totals(inputs);

        // One writer per plane of [N, C]
        output.par_chunks_mut(pixel_count).enumerate().for_each(
            |(plane, output)| {
                let batch = plane / layout.channel_count;
                let channel = plane % layout.channel_count;
                output.iter_mut().enumerate().for_each(|(pixel, value)| {
                    let weight_total =
                        weight_totals[batch * pixel_count + pixel];
                    *value = inputs.blend(batch, channel, pixel, weight_total);
                });
            },
        );

        output
    }

    fn backward(
        &self,
        inputs: &Inputs<'_>,
        output_grad: &[f32],
    ) -> Result<Gradients, Error> {
        inputs.check_output_grad(output_grad)?;

        let layout = &inputs.layout;
        let location_count = layout.location_count();
        let pixel_count = layout.pixel_count();
        let mut weights_grad = vec![0.0; layout.slots_len()];

        if location_count == 0 {
            return Ok(Gradients {
                features_grad: vec![0.0; layout.features_len()],
                weights_grad,
            });
        }

        // (S, dot(g, out)) of every location in [N, H, W]
        let statistics = (0..location_count)
            .into_par_iter()
            .map(|location| {
                let batch = location / pixel_count;
                let pixel = location % pixel_count;
                let weight_total = inputs.weight_total(batch, pixel);
                let output_dot = if weight_total > 0.0 {
                    inputs.output_dot(output_grad, batch, pixel, weight_total)
                } else {
                    0.0
                };
                (weight_total, output_dot)
            })
            .collect::<Vec<_>>();

        // One writer per plane of [N, K]
        if !weights_grad.is_empty() {
            weights_grad.par_chunks_mut(pixel_count).enumerate().for_each(
                |(plane, weights_grad)| {
                    let batch = plane / layout.slot_count;
                    let slot = plane % layout.slot_count;
                    weights_grad.iter_mut().enumerate().for_each(
                        |(pixel, value)| {
                            let (weight_total, output_dot) =
                                statistics[batch * pixel_count + pixel];
                            if weight_total <= 0.0 {
                                return;
                            }

                            let offset = layout.slot_offset(batch, slot, pixel);
                            if let Some(point) = inputs.candidates.get(offset) {
                                *value = inputs.weight_grad(
                                    output_grad,
                                    batch,
                                    pixel,
                                    point as usize,
                                    weight_total,
                                    output_dot,
                                );
                            }
                        },
                    );
                },
            );
        }

        // Partitioning the locations, then reducing the partial tables in order
        let partition_count = match self.partition_count {
            0 => rayon::current_num_threads(),
            count => count,
        }
        .clamp(1, location_count);
        let partition_size = location_count.div_ceil(partition_count);

        #[cfg(debug_assertions)]
        log::debug!(
            target: "gausplat::compositor::host::backward",
            "scatter-add into {partition_count} partitions ({})",
            format_size(
                partition_count * layout.features_len() * size_of::<f64>(),
                BINARY,
            ),
        );

        let features_grad = (0..partition_count)
            .into_par_iter()
            .map(|partition| {
                let mut features_grad = FeaturesGrad::zeros(
                    layout.channel_count,
                    layout.point_count,
                );
                let start = partition * partition_size;
                let end = (start + partition_size).min(location_count);
                for location in start..end {
                    let batch = location / pixel_count;
                    let pixel = location % pixel_count;
                    let (weight_total, _) = statistics[location];
                    if weight_total > 0.0 {
                        inputs.scatter(
                            &mut features_grad,
                            output_grad,
                            batch,
                            pixel,
                            weight_total,
                        );
                    }
                }
                features_grad
            })
            .collect::<Vec<_>>()
            .into_iter()
            .reduce(|mut features_grad, other| {
                features_grad.merge(other);
                features_grad
            })
            .unwrap_or_else(|| {
                FeaturesGrad::zeros(layout.channel_count, layout.point_count)
            });

        Ok(Gradients {
            features_grad: features_grad.into_values(),
            weights_grad,
        })
    }
}

/// Running a host strategy on the forward inputs of any backend.
pub fn forward<B: Backend, S: Strategy>(
    strategy: &S,
    input: forward::CompositeInput<B>,
) -> Result<forward::CompositeOutput<B>, Error> {
    #[cfg(debug_assertions)]
    log::debug!(target: "gausplat::compositor::host::forward", "start");

    let features = Tensor::<B, 2>::new(TensorPrimitive::Float(input.features));
    let weights = Tensor::<B, 4>::new(TensorPrimitive::Float(input.weights));
    let indices = Tensor::<B, 4, Int>::new(input.indices);
    let device = features.device();
    let layout = Layout::new(features.dims(), weights.dims(), indices.dims())?;

    let features = features.into_data().iter::<f32>().collect::<Vec<_>>();
    let weights = weights.into_data().iter::<f32>().collect::<Vec<_>>();
    let candidates =
        Candidates::decode(&layout, indices.into_data().iter::<i64>())?;
    let inputs = Inputs::new(layout, &features, &weights, &candidates)?;

    let output = strategy.forward(&inputs);
    let output = Tensor::<B, 4>::from_data(
        TensorData::new(output, layout.output_dims()),
        &device,
    );

    #[cfg(debug_assertions)]
    log::debug!(target: "gausplat::compositor::host::forward", "output");

    Ok(forward::CompositeOutput {
        output: output.into_primitive().tensor(),
    })
}

/// Running a host strategy on the backward inputs of any backend.
pub fn backward<B: Backend, S: Strategy>(
    strategy: &S,
    input: backward::CompositeInput<B>,
) -> Result<backward::CompositeOutput<B>, Error> {
    #[cfg(debug_assertions)]
    log::debug!(target: "gausplat::compositor::host::backward", "start");

    let output_grad =
        Tensor::<B, 4>::new(TensorPrimitive::Float(input.output_grad));
    let features = Tensor::<B, 2>::new(TensorPrimitive::Float(input.features));
    let weights = Tensor::<B, 4>::new(TensorPrimitive::Float(input.weights));
    let indices = Tensor::<B, 4, Int>::new(input.indices);
    let device = features.device();
    let layout = Layout::new(features.dims(), weights.dims(), indices.dims())?;
    layout.check_output("output_grad", output_grad.dims())?;

    let output_grad = output_grad.into_data().iter::<f32>().collect::<Vec<_>>();
    let features = features.into_data().iter::<f32>().collect::<Vec<_>>();
    let weights = weights.into_data().iter::<f32>().collect::<Vec<_>>();
    let candidates =
        Candidates::decode(&layout, indices.into_data().iter::<i64>())?;
    let inputs = Inputs::new(layout, &features, &weights, &candidates)?;

    let Gradients {
        features_grad,
        weights_grad,
    } = strategy.backward(&inputs, &output_grad)?;
    let features_grad = Tensor::<B, 2>::from_data(
        TensorData::new(features_grad, layout.features_dims()),
        &device,
    );
    let weights_grad = Tensor::<B, 4>::from_data(
        TensorData::new(weights_grad, layout.slots_dims()),
        &device,
    );

    #[cfg(debug_assertions)]
    log::debug!(target: "gausplat::compositor::host::backward", "gradients");

    Ok(backward::CompositeOutput {
        features_grad: features_grad.into_primitive().tensor(),
        weights_grad: weights_grad.into_primitive().tensor(),
    })
}

impl NormWeightedSumBackend for NdArray {
    fn norm_weighted_sum_forward(
        input: forward::CompositeInput<Self>
    ) -> Result<forward::CompositeOutput<Self>, Error> {
        forward(&Parallel::default(), input)
    }

    fn norm_weighted_sum_backward(
        input: backward::CompositeInput<Self>
    ) -> Result<backward::CompositeOutput<Self>, Error> {
        backward(&Parallel::default(), input)
    }
}
