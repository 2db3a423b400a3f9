pub use super::*;

#[derive(Clone, Debug)]
pub struct CompositeInput<B: Backend> {
    /// `[C, P]`
    pub features: B::FloatTensorPrimitive,
    /// `[N, K, H, W]`
    pub weights: B::FloatTensorPrimitive,
    /// `[N, K, H, W]`
    pub indices: B::IntTensorPrimitive,
}

#[derive(Clone, Debug)]
pub struct CompositeOutput<B: Backend> {
    /// `[N, C, H, W]`
    pub output: B::FloatTensorPrimitive,
}
