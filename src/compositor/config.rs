//! Configuration and the interface on host arrays.

pub use super::*;

use std::str::FromStr;

/// Where [`Compositor`] runs.
#[derive(Config, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionPath {
    /// Visiting the locations one by one on the host.
    Sequential,
    /// Visiting the locations on the rayon thread pool.
    Parallel,
    /// Running the WGSL kernels on the default wgpu device.
    Wgpu,
}

#[derive(Config, Debug, PartialEq)]
pub struct CompositorConfig {
    #[config(default = "ExecutionPath::Parallel")]
    pub execution_path: ExecutionPath,

    /// The number of partial gradient tables of the features.
    ///
    /// `0` means one per worker thread.
    #[config(default = 0)]
    pub partition_count: usize,
}

/// Compositing dense arrays in host memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Compositor {
    execution_path: ExecutionPath,
    partition_count: usize,
}

/// The gradients returned by [`Compositor::backward`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompositeGrads {
    /// `[C, P]`
    pub features_grad: Array<f32, 2>,
    /// `[N, K, H, W]`
    pub weights_grad: Array<f32, 4>,
}

impl FromStr for ExecutionPath {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "parallel" => Ok(Self::Parallel),
            "wgpu" => Ok(Self::Wgpu),
            _ => Err(Error::UnsupportedDevice(name.to_owned())),
        }
    }
}

impl CompositorConfig {
    pub fn init(&self) -> Result<Compositor, Error> {
        if self.execution_path == ExecutionPath::Wgpu && !cfg!(feature = "wgpu")
        {
            return Err(Error::UnsupportedDevice(
                "wgpu (the feature \"wgpu\" is disabled)".into(),
            ));
        }

        #[cfg(debug_assertions)]
        log::debug!(
            target: "gausplat::compositor::config",
            "Compositor::init ({:?})",
            self.execution_path,
        );

        Ok(Compositor {
            execution_path: self.execution_path,
            partition_count: self.partition_count,
        })
    }
}

impl Default for CompositorConfig {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Compositor {
    #[inline]
    pub const fn execution_path(&self) -> ExecutionPath {
        self.execution_path
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
    pub fn forward(
        &self,
        features: ArrayView<'_, f32, 2>,
        weights: ArrayView<'_, f32, 4>,
        indices: ArrayView<'_, i64, 4>,
    ) -> Result<Array<f32, 4>, Error> {
        features.check("features")?;
        weights.check("weights")?;
        indices.check("indices")?;
        let layout = Layout::new(features.dims, weights.dims, indices.dims)?;

        let output = match self.execution_path {
            ExecutionPath::Sequential => Self::forward_host(
                &host::Sequential,
                layout,
                features,
                weights,
                indices,
            )?,
            ExecutionPath::Parallel => Self::forward_host(
                &self.parallel(),
                layout,
                features,
                weights,
                indices,
            )?,
            ExecutionPath::Wgpu => {
                accelerated::forward(features, weights, indices)?
            },
        };

        Ok(Array {
            dims: layout.output_dims(),
            values: output,
        })
    }

    /// Computing the gradients of [`Compositor::forward`].
    ///
    /// ## Arguments
    ///
    /// * `output_grad` - `[N, C, H, W]`
    /// * `features` - `[C, P]`
    /// * `weights` - `[N, K, H, W]`
    /// * `indices` - `[N, K, H, W]`, in `0..P` or [`SENTINEL`]
    pub fn backward(
        &self,
        output_grad: ArrayView<'_, f32, 4>,
        features: ArrayView<'_, f32, 2>,
        weights: ArrayView<'_, f32, 4>,
        indices: ArrayView<'_, i64, 4>,
    ) -> Result<CompositeGrads, Error> {
        output_grad.check("output_grad")?;
        features.check("features")?;
        weights.check("weights")?;
        indices.check("indices")?;
        let layout = Layout::new(features.dims, weights.dims, indices.dims)?;
        layout.check_output("output_grad", output_grad.dims)?;

        let gradients = match self.execution_path {
            ExecutionPath::Sequential => Self::backward_host(
                &host::Sequential,
                layout,
                output_grad,
                features,
                weights,
                indices,
            )?,
            ExecutionPath::Parallel => Self::backward_host(
                &self.parallel(),
                layout,
                output_grad,
                features,
                weights,
                indices,
            )?,
            ExecutionPath::Wgpu => {
                accelerated::backward(output_grad, features, weights, indices)?
            },
        };

        Ok(CompositeGrads {
            features_grad: Array {
                dims: layout.features_dims(),
                values: gradients.features_grad,
            },
            weights_grad: Array {
                dims: layout.slots_dims(),
                values: gradients.weights_grad,
            },
        })
    }

    #[inline]
    fn parallel(&self) -> host::Parallel {
        host::Parallel {
            partition_count: self.partition_count,
        }
    }

    fn forward_host<S: host::Strategy>(
        strategy: &S,
        layout: Layout,
        features: ArrayView<'_, f32, 2>,
        weights: ArrayView<'_, f32, 4>,
        indices: ArrayView<'_, i64, 4>,
    ) -> Result<Vec<f32>, Error> {
        let candidates =
            Candidates::decode(&layout, indices.values.iter().copied())?;
        let inputs = host::Inputs::new(
            layout,
            features.values,
            weights.values,
            &candidates,
        )?;

        Ok(strategy.forward(&inputs))
    }

    fn backward_host<S: host::Strategy>(
        strategy: &S,
        layout: Layout,
        output_grad: ArrayView<'_, f32, 4>,
        features: ArrayView<'_, f32, 2>,
        weights: ArrayView<'_, f32, 4>,
        indices: ArrayView<'_, i64, 4>,
    ) -> Result<host::Gradients, Error> {
        let candidates =
            Candidates::decode(&layout, indices.values.iter().copied())?;
        let inputs = host::Inputs::new(
            layout,
            features.values,
            weights.values,
            &candidates,
        )?;

        strategy.backward(&inputs, output_grad.values)
    }
}

#[cfg(feature = "wgpu")]
mod accelerated {
    pub use super::*;
    pub use crate::backend::Wgpu;

    /// Uploading the arrays to the default wgpu device.
    fn upload<const D: usize, K, T>(
        array: ArrayView<'_, T, D>,
        device: &<Wgpu as Backend>::Device,
    ) -> Tensor<Wgpu, D, K>
    where
        K: burn::tensor::TensorKind<Wgpu> + burn::tensor::BasicOps<Wgpu>,
        T: burn::tensor::Element,
    {
        Tensor::from_data(
            TensorData::new(array.values.to_vec(), array.dims),
            device,
        )
    }

    fn download<const D: usize>(tensor: Tensor<Wgpu, D>) -> Vec<f32> {
        tensor.into_data().iter::<f32>().collect()
    }

    pub fn forward(
        features: ArrayView<'_, f32, 2>,
        weights: ArrayView<'_, f32, 4>,
        indices: ArrayView<'_, i64, 4>,
    ) -> Result<Vec<f32>, Error> {
        let device = Default::default();
        let output = norm_weighted_sum::<Wgpu>(
            upload(features, &device),
            upload(weights, &device),
            upload::<4, Int, _>(indices, &device),
        )?;

        Ok(download(output))
    }

    pub fn backward(
        output_grad: ArrayView<'_, f32, 4>,
        features: ArrayView<'_, f32, 2>,
        weights: ArrayView<'_, f32, 4>,
        indices: ArrayView<'_, i64, 4>,
    ) -> Result<host::Gradients, Error> {
        let device = Default::default();
        let grads = norm_weighted_sum_backward::<Wgpu>(
            upload(output_grad, &device),
            upload(features, &device),
            upload(weights, &device),
            upload::<4, Int, _>(indices, &device),
        )?;

        Ok(host::Gradients {
            features_grad: download(grads.features_grad),
            weights_grad: download(grads.weights_grad),
        })
    }
}

#[cfg(not(feature = "wgpu"))]
mod accelerated {
    pub use super::*;

    fn unsupported() -> Error {
        Error::UnsupportedDevice(
            "wgpu (the feature \"wgpu\" is disabled)".into(),
        )
    }

    pub fn forward(
        _features: ArrayView<'_, f32, 2>,
        _weights: ArrayView<'_, f32, 4>,
        _indices: ArrayView<'_, i64, 4>,
    ) -> Result<Vec<f32>, Error> {
        Err(unsupported())
    }

    pub fn backward(
        _output_grad: ArrayView<'_, f32, 4>,
        _features: ArrayView<'_, f32, 2>,
        _weights: ArrayView<'_, f32, 4>,
        _indices: ArrayView<'_, i64, 4>,
    ) -> Result<host::Gradients, Error> {
        Err(unsupported())
    }
}
