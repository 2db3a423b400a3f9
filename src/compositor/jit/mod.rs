//! The accelerated path on the runtimes of burn-jit.
//!
//! The indices are validated on the host before launching, so the kernels
//! only test for the sentinel.

pub mod kernel;

pub use super::*;
pub use crate::backend::{JitBackend, JitRuntime};

use burn::tensor::{ops::FloatTensorOps, Shape};
use burn_jit::kernel::into_contiguous;
#[cfg(debug_assertions)]
use humansize::{format_size, BINARY};
use kernel::*;

pub fn forward<R: JitRuntime>(
    input: forward::CompositeInput<JitBackend<R, f32, i32>>
) -> Result<forward::CompositeOutput<JitBackend<R, f32, i32>>, Error> {
    #[cfg(debug_assertions)]
    log::debug!(target: "gausplat::compositor::jit::forward", "start");

    // Specifying the inputs

    let features = into_contiguous(input.features);
    let weights = into_contiguous(input.weights);
    let indices = into_contiguous(input.indices);
    let device = features.device.to_owned();
    let layout = Layout::new(
        dims(&features.shape),
        dims(&weights.shape),
        dims(&indices.shape),
    )?;

    validate::<R>(&layout, indices.to_owned())?;

    if is_trivial(&layout) {
        return Ok(forward::CompositeOutput {
            output: JitBackend::<R, f32, i32>::float_zeros(
                layout.output_dims().into(),
                &device,
            ),
        });
    }

    // Launching the kernel

    let output = aggregate::main(
        Arguments::new(&layout)?,
        aggregate::Inputs {
            features,
            weights,
            indices,
        },
    )
    .output;

    #[cfg(debug_assertions)]
    log::debug!(
        target: "gausplat::compositor::jit::forward",
        "aggregate ({})",
        format_size(layout.output_len() * size_of::<f32>(), BINARY),
    );

    Ok(forward::CompositeOutput { output })
}

pub fn backward<R: JitRuntime>(
    input: backward::CompositeInput<JitBackend<R, f32, i32>>
) -> Result<backward::CompositeOutput<JitBackend<R, f32, i32>>, Error> {
    #[cfg(debug_assertions)]
    log::debug!(target: "gausplat::compositor::jit::backward", "start");

    // Specifying the inputs

    let output_grad = into_contiguous(input.output_grad);
    let features = into_contiguous(input.features);
    let weights = into_contiguous(input.weights);
    let indices = into_contiguous(input.indices);
    let device = features.device.to_owned();
    let layout = Layout::new(
        dims(&features.shape),
        dims(&weights.shape),
        dims(&indices.shape),
    )?;
    layout.check_output("output_grad", dims(&output_grad.shape))?;

    validate::<R>(&layout, indices.to_owned())?;

    if is_trivial(&layout) {
        return Ok(backward::CompositeOutput {
            features_grad: JitBackend::<R, f32, i32>::float_zeros(
                layout.features_dims().into(),
                &device,
            ),
            weights_grad: JitBackend::<R, f32, i32>::float_zeros(
                layout.slots_dims().into(),
                &device,
            ),
        });
    }

    // Launching the kernel

    let outputs = aggregate_backward::main(
        Arguments::new(&layout)?,
        aggregate_backward::Inputs {
            output_grad,
            features,
            weights,
            indices,
        },
    );

    #[cfg(debug_assertions)]
    log::debug!(
        target: "gausplat::compositor::jit::backward",
        "aggregate_backward ({})",
        format_size(
            (layout.features_len() + layout.slots_len()) * size_of::<f32>(),
            BINARY,
        ),
    );

    Ok(backward::CompositeOutput {
        features_grad: outputs.features_grad,
        weights_grad: outputs.weights_grad,
    })
}

#[inline]
fn dims<const D: usize>(shape: &Shape) -> [usize; D] {
    std::array::from_fn(|axis| shape.dims[axis])
}

/// Every value of the results is zero.
#[inline]
fn is_trivial(layout: &Layout) -> bool {
    layout.output_len() == 0
        || layout.slots_len() == 0
        || layout.features_len() == 0
}

/// Reading the indices back to reject the ones out of range.
fn validate<R: JitRuntime>(
    layout: &Layout,
    indices: JitTensor<R, i32>,
) -> Result<(), Error> {
    let indices =
        Tensor::<JitBackend<R, f32, i32>, 4, Int>::new(indices).into_data();
    Candidates::decode(layout, indices.iter::<i64>())?;

    #[cfg(debug_assertions)]
    log::debug!(
        target: "gausplat::compositor::jit",
        "validate ({})",
        format_size(layout.slots_len() * size_of::<i32>(), BINARY),
    );

    Ok(())
}

impl<R: JitRuntime> NormWeightedSumBackend for JitBackend<R, f32, i32> {
    fn norm_weighted_sum_forward(
        input: forward::CompositeInput<Self>
    ) -> Result<forward::CompositeOutput<Self>, Error> {
        forward(input)
    }

    fn norm_weighted_sum_backward(
        input: backward::CompositeInput<Self>
    ) -> Result<backward::CompositeOutput<Self>, Error> {
        backward(input)
    }
}
