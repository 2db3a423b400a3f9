pub use burn::{backend::NdArray, tensor::backend::Backend};
#[cfg(feature = "wgpu")]
pub use burn::backend::wgpu::{WgpuDevice, WgpuRuntime};
#[cfg(feature = "wgpu")]
pub use burn_jit::{JitBackend, JitRuntime};

use burn::backend::autodiff;

pub type Autodiff<B> = autodiff::Autodiff<B>;
#[cfg(feature = "wgpu")]
pub type Wgpu = JitBackend<WgpuRuntime, f32, i32>;
