//! Scatter-add of the gradients onto the features.

pub use super::*;

/// An additive sink for the gradients scattered onto the features.
///
/// Several locations may reference the same point, so every contribution is
/// added, and partial sinks are combined with [`Accumulator::merge`].
pub trait Accumulator: Sized {
    /// Adding `value` to the gradient at `[channel, point]`.
    fn scatter_add(
        &mut self,
        channel: usize,
        point: usize,
        value: f64,
    );

    /// Adding all contributions of `other`.
    fn merge(
        &mut self,
        other: Self,
    );
}

/// The gradient of the features `[C, P]` in double precision.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FeaturesGrad {
    /// `P`
    point_count: usize,
    /// `[C, P]`
    values: Vec<f64>,
}

impl FeaturesGrad {
    pub fn zeros(
        channel_count: usize,
        point_count: usize,
    ) -> Self {
        Self {
            point_count,
            values: vec![0.0; channel_count * point_count],
        }
    }

    /// `[C, P]`
    #[inline]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Rounding the values to the storage precision.
    pub fn into_values(self) -> Vec<f32> {
        self.values.into_iter().map(|value| value as f32).collect()
    }
}

impl Accumulator for FeaturesGrad {
    #[inline]
    fn scatter_add(
        &mut self,
        channel: usize,
        point: usize,
        value: f64,
    ) {
        self.values[channel * self.point_count + point] += value;
    }

    fn merge(
        &mut self,
        other: Self,
    ) {
        debug_assert_eq!(self.values.len(), other.values.len());

        self.values
            .iter_mut()
            .zip(other.values)
            .for_each(|(value, other)| *value += other);
    }
}
