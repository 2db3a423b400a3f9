//! WGSL kernels.

pub mod aggregate;
pub mod aggregate_backward;

pub use super::*;
pub use burn_jit::{
    cubecl::KernelId,
    template::{KernelSource, SourceTemplate},
    tensor::JitTensor,
};
pub use bytemuck::{Pod, Zeroable};

use burn_jit::{
    cubecl::{CubeCount, CubeDim},
    template::SourceKernel,
};

/// The invocations of one workgroup.
pub const GROUP_SIZE: u32 = 256;

/// The maximum of workgroups along `x`.
pub const GROUP_COUNT_X_MAX: u32 = 65535;

/// The arguments shared by both kernels.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Arguments {
    /// `C`
    pub channel_count: u32,
    /// `N * H * W`
    pub location_count: u32,
    /// `H * W`
    pub pixel_count: u32,
    /// `P`
    pub point_count: u32,
    /// `K`
    pub slot_count: u32,
}

macro_rules! impl_kernel_source {
    ($kernel: ident, $source_path: expr) => {
        #[derive(Clone, Copy, Debug, Default)]
        pub struct $kernel;

        impl KernelSource for $kernel {
            fn source(&self) -> SourceTemplate {
                SourceTemplate::new(include_str!($source_path))
            }

            fn id(&self) -> KernelId {
                KernelId::new::<Self>()
            }
        }
    };
}

pub(crate) use impl_kernel_source;

impl Arguments {
    /// The offsets of every buffer should fit in `u32`.
    pub fn new(layout: &Layout) -> Result<Self, Error> {
        let len_max = layout
            .features_len()
            .max(layout.output_len())
            .max(layout.slots_len());
        if u32::try_from(len_max).is_err() {
            return Err(Error::UnsupportedDevice(format!(
                "wgpu (a buffer of {len_max} elements)"
            )));
        }

        Ok(Self {
            channel_count: layout.channel_count as u32,
            location_count: layout.location_count() as u32,
            pixel_count: layout.pixel_count() as u32,
            point_count: layout.point_count as u32,
            slot_count: layout.slot_count as u32,
        })
    }

    /// The workgroups covering every location.
    ///
    /// They wrap around along `y` beyond [`GROUP_COUNT_X_MAX`].
    pub fn group_count(&self) -> [u32; 2] {
        let group_count = self.location_count.div_ceil(GROUP_SIZE).max(1);
        let group_count_x = group_count.min(GROUP_COUNT_X_MAX);
        let group_count_y = group_count.div_ceil(group_count_x);
        [group_count_x, group_count_y]
    }

    #[inline]
    fn cube_count(&self) -> CubeCount {
        let [group_count_x, group_count_y] = self.group_count();
        CubeCount::Static(group_count_x, group_count_y, 1)
    }

    #[inline]
    fn cube_dim(&self) -> CubeDim {
        CubeDim {
            x: GROUP_SIZE,
            y: 1,
            z: 1,
        }
    }
}
