//! Shapes, dense arrays and candidate slots.

pub use super::*;

/// The point index marking a slot without a contributor.
pub const SENTINEL: i64 = -1;

/// The dimensions shared by all tensors of one compositing call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Layout {
    /// `N`
    pub batch_size: usize,
    /// `C`
    pub channel_count: usize,
    /// `W`
    pub image_size_x: usize,
    /// `H`
    pub image_size_y: usize,
    /// `P`
    pub point_count: usize,
    /// `K`
    pub slot_count: usize,
}

/// A borrowed dense array in row-major order.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ArrayView<'a, T, const D: usize> {
    pub dims: [usize; D],
    pub values: &'a [T],
}

/// An owned dense array in row-major order.
#[derive(Clone, Debug, PartialEq)]
pub struct Array<T, const D: usize> {
    pub dims: [usize; D],
    pub values: Vec<T>,
}

/// The decoded point indices of every slot.
///
/// A slot is either a point index in `0..P` or [`None`] for the sentinel.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Candidates {
    /// `[N, K, H, W]`
    slots: Vec<Option<u32>>,
}

impl Layout {
    /// Infer the layout from the dimensions of the inputs.
    ///
    /// ## Arguments
    ///
    /// * `features` - `[C, P]`
    /// * `weights` - `[N, K, H, W]`
    /// * `indices` - `[N, K, H, W]`
    pub fn new(
        features: [usize; 2],
        weights: [usize; 4],
        indices: [usize; 4],
    ) -> Result<Self, Error> {
        if weights != indices {
            return Err(Error::ShapeMismatch {
                name: "indices",
                expected: weights.to_vec(),
                actual: indices.to_vec(),
            });
        }

        let [channel_count, point_count] = features;
        let [batch_size, slot_count, image_size_y, image_size_x] = weights;

        Ok(Self {
            batch_size,
            channel_count,
            image_size_x,
            image_size_y,
            point_count,
            slot_count,
        })
    }

    /// `[C, P]`
    #[inline]
    pub const fn features_dims(&self) -> [usize; 2] {
        [self.channel_count, self.point_count]
    }

    /// `[N, C, H, W]`
    #[inline]
    pub const fn output_dims(&self) -> [usize; 4] {
        [
            self.batch_size,
            self.channel_count,
            self.image_size_y,
            self.image_size_x,
        ]
    }

    /// `[N, K, H, W]`
    #[inline]
    pub const fn slots_dims(&self) -> [usize; 4] {
        [
            self.batch_size,
            self.slot_count,
            self.image_size_y,
            self.image_size_x,
        ]
    }

    /// `H * W`
    #[inline]
    pub const fn pixel_count(&self) -> usize {
        self.image_size_y * self.image_size_x
    }

    /// `N * H * W`
    #[inline]
    pub const fn location_count(&self) -> usize {
        self.batch_size * self.pixel_count()
    }

    /// `C * P`
    #[inline]
    pub const fn features_len(&self) -> usize {
        self.channel_count * self.point_count
    }

    /// `N * C * H * W`
    #[inline]
    pub const fn output_len(&self) -> usize {
        self.batch_size * self.channel_count * self.pixel_count()
    }

    /// `N * K * H * W`
    #[inline]
    pub const fn slots_len(&self) -> usize {
        self.batch_size * self.slot_count * self.pixel_count()
    }

    /// The offset of `[c, p]` in the features.
    #[inline]
    pub const fn feature_offset(
        &self,
        channel: usize,
        point: usize,
    ) -> usize {
        channel * self.point_count + point
    }

    /// The offset of `[n, c, i * W + j]` in the output.
    #[inline]
    pub const fn output_offset(
        &self,
        batch: usize,
        channel: usize,
        pixel: usize,
    ) -> usize {
        (batch * self.channel_count + channel) * self.pixel_count() + pixel
    }

    /// The offset of `[n, k, i * W + j]` in the weights or indices.
    #[inline]
    pub const fn slot_offset(
        &self,
        batch: usize,
        slot: usize,
        pixel: usize,
    ) -> usize {
        (batch * self.slot_count + slot) * self.pixel_count() + pixel
    }

    /// `[n, k, i, j]` of a slot offset.
    pub const fn slot_position(
        &self,
        offset: usize,
    ) -> [usize; 4] {
        let pixel_count = self.pixel_count();
        let pixel = offset % pixel_count;
        let slot = offset / pixel_count % self.slot_count;
        let batch = offset / pixel_count / self.slot_count;
        [
            batch,
            slot,
            pixel / self.image_size_x,
            pixel % self.image_size_x,
        ]
    }

    /// Checking the dimensions of a tensor shaped like the output.
    pub fn check_output(
        &self,
        name: &'static str,
        dims: [usize; 4],
    ) -> Result<(), Error> {
        let expected = self.output_dims();
        if dims != expected {
            return Err(Error::ShapeMismatch {
                name,
                expected: expected.to_vec(),
                actual: dims.to_vec(),
            });
        }
        Ok(())
    }
}

impl<'a, T, const D: usize> ArrayView<'a, T, D> {
    #[inline]
    pub const fn new(
        values: &'a [T],
        dims: [usize; D],
    ) -> Self {
        Self { dims, values }
    }

    /// Checking that the values fill the dimensions exactly.
    pub fn check(
        &self,
        name: &'static str,
    ) -> Result<(), Error> {
        let count = self.dims.iter().product::<usize>();
        if count != self.values.len() {
            return Err(Error::ShapeMismatch {
                name,
                expected: self.dims.to_vec(),
                actual: vec![self.values.len()],
            });
        }
        Ok(())
    }
}

impl<T, const D: usize> Array<T, D> {
    #[inline]
    pub fn view(&self) -> ArrayView<'_, T, D> {
        ArrayView::new(&self.values, self.dims)
    }
}

impl<T, const D: usize> Default for Array<T, D> {
    #[inline]
    fn default() -> Self {
        Self {
            dims: [0; D],
            values: vec![],
        }
    }
}

impl Candidates {
    /// Decoding the raw point indices in `[N, K, H, W]`.
    ///
    /// [`SENTINEL`] becomes [`None`], other indices outside `0..P` are
    /// rejected with [`Error::IndexOutOfRange`].
    pub fn decode<I: IntoIterator<Item = i64>>(
        layout: &Layout,
        indices: I,
    ) -> Result<Self, Error> {
        let point_count = layout.point_count;
        let slots_len = layout.slots_len();
        let mut slots = Vec::with_capacity(slots_len);
        let mut count = 0;

        for (offset, index) in indices.into_iter().enumerate() {
            count += 1;
            if offset >= slots_len {
                continue;
            }

            let slot = match index {
                SENTINEL => None,
                _ => Some(
                    u32::try_from(index)
                        .ok()
                        .filter(|&point| (point as usize) < point_count)
                        .ok_or_else(|| Error::IndexOutOfRange {
                            index,
                            point_count,
                            position: layout.slot_position(offset),
                        })?,
                ),
            };
            slots.push(slot);
        }

        if count != slots_len {
            return Err(Error::ShapeMismatch {
                name: "indices",
                expected: layout.slots_dims().to_vec(),
                actual: vec![count],
            });
        }

        Ok(Self { slots })
    }

    /// The point index of the slot at `offset`.
    #[inline]
    pub fn get(
        &self,
        offset: usize,
    ) -> Option<u32> {
        self.slots[offset]
    }

    #[inline]
    pub fn as_slice(&self) -> &[Option<u32>] {
        &self.slots
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
