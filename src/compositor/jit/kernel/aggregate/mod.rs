pub use super::*;

use burn::tensor::ops::FloatTensorOps;
use bytemuck::bytes_of;

#[derive(Clone, Debug)]
pub struct Inputs<R: JitRuntime> {
    /// `[C, P]`
    pub features: JitTensor<R, f32>,
    /// `[N, K, H, W]`
    pub weights: JitTensor<R, f32>,
    /// `[N, K, H, W]`
    pub indices: JitTensor<R, i32>,
}

#[derive(Clone, Debug)]
pub struct Outputs<R: JitRuntime> {
    /// `[N, C, H, W]`
    pub output: JitTensor<R, f32>,
}

/// Compositing the features at every location.
pub fn main<R: JitRuntime>(
    arguments: Arguments,
    inputs: Inputs<R>,
) -> Outputs<R> {
    impl_kernel_source!(Kernel, "kernel.wgsl");

    // Specifying the parameters

    let client = &inputs.features.client;
    let device = &inputs.features.device;
    // [N, C, H, W]
    let mut output_dims = inputs.weights.shape.dims.to_owned();
    output_dims[1] = arguments.channel_count as usize;

    let output =
        JitBackend::<R, f32, i32>::float_empty(output_dims.into(), device);

    // Launching the kernel

    client.execute(
        Box::new(SourceKernel::new(Kernel, arguments.cube_dim())),
        arguments.cube_count(),
        vec![
            client.create(bytes_of(&arguments)).binding(),
            inputs.features.handle.binding(),
            inputs.weights.handle.binding(),
            inputs.indices.handle.binding(),
            output.handle.to_owned().binding(),
        ],
    );

    Outputs { output }
}
