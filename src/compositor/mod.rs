//! Normalized weighted-sum compositing.
//!
//! For every location `(n, i, j)` with valid slots `k`:
//!
//! ```plaintext
//! output[n, c, i, j] = Σ_k weights[n, k, i, j] * features[c, indices[n, k, i, j]]
//!                    / Σ_k weights[n, k, i, j]
//! ```
//!
//! The output is `0` where the weight total is not positive.

pub mod backward;
pub mod config;
pub mod forward;
pub mod host;
#[cfg(feature = "wgpu")]
pub mod jit;
pub mod layout;

pub use crate::{
    backend::{Autodiff, Backend, NdArray},
    error::Error,
};
pub use burn::{
    config::Config,
    tensor::{Int, Tensor, TensorData, TensorPrimitive},
};
pub use config::{CompositeGrads, Compositor, CompositorConfig, ExecutionPath};
pub use layout::{Array, ArrayView, Candidates, Layout, SENTINEL};

use burn::{
    backend::autodiff::{
        checkpoint::{base::Checkpointer, strategy::NoCheckpointing},
        grads::Gradients,
        ops::{Backward, Ops, OpsKind},
    },
    tensor::backend::AutodiffBackend,
};
use std::marker;

/// The backends able to composite.
///
/// The inputs are validated by [`norm_weighted_sum`] and
/// [`norm_weighted_sum_backward`] before reaching the implementations.
pub trait NormWeightedSumBackend: Backend {
    fn norm_weighted_sum_forward(
        input: forward::CompositeInput<Self>
    ) -> Result<forward::CompositeOutput<Self>, Error>;

    fn norm_weighted_sum_backward(
        input: backward::CompositeInput<Self>
    ) -> Result<backward::CompositeOutput<Self>, Error>;
}

#[derive(Clone, Debug)]
pub struct NormWeightedSumGrads<B: Backend> {
    /// `[C, P]`
    pub features_grad: Tensor<B, 2>,
    /// `[N, K, H, W]`
    pub weights_grad: Tensor<B, 4>,
}

#[derive(Clone, Copy, Debug, Default)]
struct NormWeightedSumBackward<B: Backend> {
    __: marker::PhantomData<B>,
}

#[derive(Clone, Debug)]
struct NormWeightedSumBackwardState<B: Backend> {
    pub features: B::FloatTensorPrimitive,
    pub weights: B::FloatTensorPrimitive,
    pub indices: B::IntTensorPrimitive,
}

/// Compositing the features of the points referenced by every location.
///
/// ## Arguments
///
/// * `features` - `[C, P]`
/// * `weights` - `[N, K, H, W]`
/// * `indices` - `[N, K, H, W]`, in `0..P` or [`SENTINEL`]
///
/// ## Returns
///
/// * `output` - `[N, C, H, W]`
pub fn norm_weighted_sum<B: NormWeightedSumBackend>(
    features: Tensor<B, 2>,
    weights: Tensor<B, 4>,
    indices: Tensor<B, 4, Int>,
) -> Result<Tensor<B, 4>, Error> {
    Layout::new(features.dims(), weights.dims(), indices.dims())?;

    let output = B::norm_weighted_sum_forward(forward::CompositeInput {
        features: features.into_primitive().tensor(),
        weights: weights.into_primitive().tensor(),
        indices: indices.into_primitive(),
    })?;

    Ok(Tensor::new(TensorPrimitive::Float(output.output)))
}

/// Computing the gradients of [`norm_weighted_sum`].
///
/// ## Arguments
///
/// * `output_grad` - `[N, C, H, W]`
/// * `features` - `[C, P]`
/// * `weights` - `[N, K, H, W]`
/// * `indices` - `[N, K, H, W]`, in `0..P` or [`SENTINEL`]
pub fn norm_weighted_sum_backward<B: NormWeightedSumBackend>(
    output_grad: Tensor<B, 4>,
    features: Tensor<B, 2>,
    weights: Tensor<B, 4>,
    indices: Tensor<B, 4, Int>,
) -> Result<NormWeightedSumGrads<B>, Error> {
    let layout = Layout::new(features.dims(), weights.dims(), indices.dims())?;
    layout.check_output("output_grad", output_grad.dims())?;

    let output = B::norm_weighted_sum_backward(backward::CompositeInput {
        output_grad: output_grad.into_primitive().tensor(),
        features: features.into_primitive().tensor(),
        weights: weights.into_primitive().tensor(),
        indices: indices.into_primitive(),
    })?;

    Ok(NormWeightedSumGrads {
        features_grad: Tensor::new(TensorPrimitive::Float(
            output.features_grad,
        )),
        weights_grad: Tensor::new(TensorPrimitive::Float(output.weights_grad)),
    })
}

impl<B: NormWeightedSumBackend> NormWeightedSumBackend for Autodiff<B> {
    fn norm_weighted_sum_forward(
        input: forward::CompositeInput<Self>
    ) -> Result<forward::CompositeOutput<Self>, Error> {
        let features = input.features;
        let weights = input.weights;
        let indices = input.indices;

        let output = B::norm_weighted_sum_forward(forward::CompositeInput {
            features: features.primitive.to_owned(),
            weights: weights.primitive.to_owned(),
            indices: indices.to_owned(),
        })?
        .output;

        let output = match NormWeightedSumBackward::<B>::default()
            .prepare::<NoCheckpointing>([features.node, weights.node])
            .compute_bound()
            .stateful()
        {
            OpsKind::Tracked(prep) => prep.finish(
                NormWeightedSumBackwardState {
                    features: features.primitive,
                    weights: weights.primitive,
                    indices,
                },
                output,
            ),
            OpsKind::UnTracked(prep) => prep.finish(output),
        };

        Ok(forward::CompositeOutput { output })
    }

    fn norm_weighted_sum_backward(
        input: backward::CompositeInput<Self>
    ) -> Result<backward::CompositeOutput<Self>, Error> {
        let output = B::norm_weighted_sum_backward(backward::CompositeInput {
            output_grad: Self::inner(input.output_grad),
            features: Self::inner(input.features),
            weights: Self::inner(input.weights),
            indices: Self::int_inner(input.indices),
        })?;

        Ok(backward::CompositeOutput {
            features_grad: Self::from_inner(output.features_grad),
            weights_grad: Self::from_inner(output.weights_grad),
        })
    }
}

impl<B: NormWeightedSumBackend> Backward<B, 2> for NormWeightedSumBackward<B> {
    type State = NormWeightedSumBackwardState<B>;

    fn backward(
        self,
        ops: Ops<Self::State, 2>,
        grads: &mut Gradients,
        _checkpointer: &mut Checkpointer,
    ) {
        #[cfg(debug_assertions)]
        log::debug!(
            target: "gausplat::compositor::autodiff",
            "NormWeightedSumBackward::backward",
        );

        let output_grad = grads.consume::<B>(&ops.node);

        if ops.parents.iter().all(Option::is_none) {
            return;
        }

        // Checked in the forward pass
        let state = ops.state;
        let output = B::norm_weighted_sum_backward(backward::CompositeInput {
            output_grad,
            features: state.features,
            weights: state.weights,
            indices: state.indices,
        })
        .expect("The inputs of the backward pass should be valid");

        if let Some(node) = &ops.parents[0] {
            grads.register::<B>(node.id, output.features_grad);
        }
        if let Some(node) = &ops.parents[1] {
            grads.register::<B>(node.id, output.weights_grad);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    type B = NdArray<f32>;
    type AB = Autodiff<B>;

    #[test]
    fn two_slots_one_pixel() {
        let device = &Default::default();
        let features = Tensor::<B, 2>::from_data([[10.0, 20.0]], device);
        let weights = Tensor::<B, 4>::from_data([[[[2.0]], [[1.0]]]], device);
        let indices = Tensor::<B, 4, Int>::from_data([[[[0]], [[1]]]], device);

        let output = norm_weighted_sum(
            features.to_owned(),
            weights.to_owned(),
            indices.to_owned(),
        )
        .unwrap();
        output
            .into_data()
            .assert_approx_eq(&TensorData::from([[[[40.0_f32 / 3.0]]]]), 5);

        let output_grad = Tensor::<B, 4>::ones([1, 1, 1, 1], device);
        let grads =
            norm_weighted_sum_backward(output_grad, features, weights, indices)
                .unwrap();
        grads.features_grad.into_data().assert_approx_eq(
            &TensorData::from([[2.0_f32 / 3.0, 1.0 / 3.0]]),
            5,
        );
        grads.weights_grad.into_data().assert_approx_eq(
            &TensorData::from([[[[-10.0_f32 / 9.0]], [[20.0 / 9.0]]]]),
            5,
        );
    }

    #[test]
    fn zero_weights() {
        let device = &Default::default();
        let features = Tensor::<B, 2>::from_data([[10.0, 20.0]], device);
        let weights = Tensor::<B, 4>::zeros([1, 2, 1, 1], device);
        let indices = Tensor::<B, 4, Int>::from_data([[[[0]], [[1]]]], device);

        let output = norm_weighted_sum(
            features.to_owned(),
            weights.to_owned(),
            indices.to_owned(),
        )
        .unwrap();
        output
            .into_data()
            .assert_eq(&TensorData::from([[[[0.0_f32]]]]), true);

        let output_grad = Tensor::<B, 4>::ones([1, 1, 1, 1], device);
        let grads =
            norm_weighted_sum_backward(output_grad, features, weights, indices)
                .unwrap();
        grads
            .features_grad
            .into_data()
            .assert_eq(&TensorData::from([[0.0_f32, 0.0]]), true);
        grads
            .weights_grad
            .into_data()
            .assert_eq(&TensorData::from([[[[0.0_f32]], [[0.0]]]]), true);
    }

    #[test]
    fn invalid_inputs() {
        let device = &Default::default();
        let features = Tensor::<B, 2>::from_data([[10.0, 20.0]], device);
        let weights = Tensor::<B, 4>::from_data([[[[2.0]], [[1.0]]]], device);

        let indices = Tensor::<B, 4, Int>::from_data([[[[0]], [[2]]]], device);
        let error = norm_weighted_sum(
            features.to_owned(),
            weights.to_owned(),
            indices,
        )
        .err();
        assert!(
            matches!(
                error,
                Some(Error::IndexOutOfRange {
                    index: 2,
                    point_count: 2,
                    position: [0, 1, 0, 0],
                })
            ),
            "{error:?}",
        );

        let indices =
            Tensor::<B, 4, Int>::from_data([[[[0]], [[-1]], [[1]]]], device);
        let error = norm_weighted_sum(
            features.to_owned(),
            weights.to_owned(),
            indices,
        )
        .err();
        assert!(
            matches!(error, Some(Error::ShapeMismatch { name: "indices", .. })),
            "{error:?}",
        );

        let indices = Tensor::<B, 4, Int>::from_data([[[[0]], [[1]]]], device);
        let output_grad = Tensor::<B, 4>::ones([1, 2, 1, 1], device);
        let error =
            norm_weighted_sum_backward(output_grad, features, weights, indices)
                .err();
        assert!(
            matches!(
                error,
                Some(Error::ShapeMismatch {
                    name: "output_grad",
                    ..
                })
            ),
            "{error:?}",
        );
    }

    #[test]
    fn autodiff_matches_backward() {
        let device = &Default::default();
        let mut rng = StdRng::seed_from_u64(0x51DE);

        // [C, P]
        let features_dims = [3, 6];
        // [N, K, H, W]
        let slots_dims = [2, 4, 3, 5];
        // [N, C, H, W]
        let output_dims = [2, 3, 3, 5];

        let features = TensorData::new(
            (&mut rng)
                .sample_iter(rand_distr::Uniform::new(-1.0_f32, 1.0))
                .take(3 * 6)
                .collect(),
            features_dims,
        );
        let weights = TensorData::new(
            (&mut rng)
                .sample_iter(rand_distr::Uniform::new(0.0_f32, 1.0))
                .take(2 * 4 * 3 * 5)
                .collect(),
            slots_dims,
        );
        let indices = TensorData::new(
            (0..2 * 4 * 3 * 5)
                .map(|_| rng.gen_range(-1_i64..6))
                .collect::<Vec<_>>(),
            slots_dims,
        );
        let output_grad = TensorData::new(
            (&mut rng)
                .sample_iter(rand_distr::Uniform::new(-1.0_f32, 1.0))
                .take(2 * 3 * 3 * 5)
                .collect(),
            output_dims,
        );

        let features_ad =
            Tensor::<AB, 2>::from_data(features.to_owned(), device)
                .require_grad();
        let weights_ad =
            Tensor::<AB, 4>::from_data(weights.to_owned(), device)
                .require_grad();
        let indices_ad =
            Tensor::<AB, 4, Int>::from_data(indices.to_owned(), device);
        let output_grad_ad =
            Tensor::<AB, 4>::from_data(output_grad.to_owned(), device);

        let output_ad = norm_weighted_sum(
            features_ad.to_owned(),
            weights_ad.to_owned(),
            indices_ad,
        )
        .unwrap();
        let grads = (output_ad.to_owned() * output_grad_ad).sum().backward();
        let features_grad_ad = features_ad.grad(&grads).unwrap();
        let weights_grad_ad = weights_ad.grad(&grads).unwrap();

        let features = Tensor::<B, 2>::from_data(features, device);
        let weights = Tensor::<B, 4>::from_data(weights, device);
        let indices = Tensor::<B, 4, Int>::from_data(indices, device);
        let output_grad = Tensor::<B, 4>::from_data(output_grad, device);

        let output = norm_weighted_sum(
            features.to_owned(),
            weights.to_owned(),
            indices.to_owned(),
        )
        .unwrap();
        let grads =
            norm_weighted_sum_backward(output_grad, features, weights, indices)
                .unwrap();

        output_ad
            .inner()
            .into_data()
            .assert_approx_eq(&output.into_data(), 5);
        features_grad_ad
            .into_data()
            .assert_approx_eq(&grads.features_grad.into_data(), 5);
        weights_grad_ad
            .into_data()
            .assert_approx_eq(&grads.weights_grad.into_data(), 5);
    }

    #[test]
    fn autodiff_partially_tracked() {
        let device = &Default::default();
        let features = [[10.0, 20.0]];
        let weights = [[[[2.0]], [[1.0]]]];
        let indices = [[[[0]], [[1]]]];

        // Only the features
        let features_ad =
            Tensor::<AB, 2>::from_data(features, device).require_grad();
        let weights_ad = Tensor::<AB, 4>::from_data(weights, device);
        let output = norm_weighted_sum(
            features_ad.to_owned(),
            weights_ad.to_owned(),
            Tensor::<AB, 4, Int>::from_data(indices, device),
        )
        .unwrap();
        let grads = output.sum().backward();
        features_ad.grad(&grads).unwrap().into_data().assert_approx_eq(
            &TensorData::from([[2.0_f32 / 3.0, 1.0 / 3.0]]),
            5,
        );
        assert!(weights_ad.grad(&grads).is_none());

        // Only the weights
        let features_ad = Tensor::<AB, 2>::from_data(features, device);
        let weights_ad =
            Tensor::<AB, 4>::from_data(weights, device).require_grad();
        let output = norm_weighted_sum(
            features_ad.to_owned(),
            weights_ad.to_owned(),
            Tensor::<AB, 4, Int>::from_data(indices, device),
        )
        .unwrap();
        let grads = output.sum().backward();
        weights_ad.grad(&grads).unwrap().into_data().assert_approx_eq(
            &TensorData::from([[[[-10.0_f32 / 9.0]], [[20.0 / 9.0]]]]),
            5,
        );
        assert!(features_ad.grad(&grads).is_none());
    }

    #[test]
    fn autodiff_untracked() {
        let device = &Default::default();
        let features = Tensor::<AB, 2>::from_data([[1.0, -3.0, 5.0]], device);
        let weights = Tensor::<AB, 4>::from_data(
            [[[[0.5, 0.0]], [[0.5, 2.0]], [[1.0, 1.0]]]],
            device,
        );
        let indices = Tensor::<AB, 4, Int>::from_data(
            [[[[0, 2]], [[1, -1]], [[-1, 1]]]],
            device,
        );

        let output = norm_weighted_sum(features, weights, indices).unwrap();
        output
            .into_data()
            .assert_approx_eq(&TensorData::from([[[[-1.0_f32, -3.0]]]]), 5);
    }
}
