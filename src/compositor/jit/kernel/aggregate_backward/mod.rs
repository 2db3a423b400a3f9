pub use super::*;

use burn::tensor::ops::FloatTensorOps;
use bytemuck::bytes_of;

#[derive(Clone, Debug)]
pub struct Inputs<R: JitRuntime> {
    /// `[N, C, H, W]`
    pub output_grad: JitTensor<R, f32>,
    /// `[C, P]`
    pub features: JitTensor<R, f32>,
    /// `[N, K, H, W]`
    pub weights: JitTensor<R, f32>,
    /// `[N, K, H, W]`
    pub indices: JitTensor<R, i32>,
}

#[derive(Clone, Debug)]
pub struct Outputs<R: JitRuntime> {
    /// `[C, P]`
    pub features_grad: JitTensor<R, f32>,
    /// `[N, K, H, W]`
    pub weights_grad: JitTensor<R, f32>,
}

/// Scattering the gradients of every location.
///
/// The gradients of the features are added atomically.
pub fn main<R: JitRuntime>(
    arguments: Arguments,
    inputs: Inputs<R>,
) -> Outputs<R> {
    impl_kernel_source!(Kernel, "kernel.wgsl");

    // Specifying the parameters

    let client = &inputs.output_grad.client;
    let device = &inputs.output_grad.device;
    // C
    let channel_count = arguments.channel_count as usize;
    // P
    let point_count = arguments.point_count as usize;

    let features_grad = JitBackend::<R, f32, i32>::float_zeros(
        [channel_count, point_count].into(),
        device,
    );
    let weights_grad = JitBackend::<R, f32, i32>::float_zeros(
        inputs.weights.shape.to_owned(),
        device,
    );

    // Launching the kernel

    client.execute(
        Box::new(SourceKernel::new(Kernel, arguments.cube_dim())),
        arguments.cube_count(),
        vec![
            client.create(bytes_of(&arguments)).binding(),
            inputs.output_grad.handle.binding(),
            inputs.features.handle.binding(),
            inputs.weights.handle.binding(),
            inputs.indices.handle.binding(),
            features_grad.handle.to_owned().binding(),
            weights_grad.handle.to_owned().binding(),
        ],
    );

    Outputs {
        features_grad,
        weights_grad,
    }
}
