#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(
        "Index Error: {index} at {position:?} should be -1 or in 0..{point_count}"
    )]
    IndexOutOfRange {
        /// The offending point index.
        index: i64,
        /// `P`
        point_count: usize,
        /// `[n, k, i, j]`
        position: [usize; 4],
    },

    #[error("Shape Error: {name} should be {expected:?}, but got {actual:?}")]
    ShapeMismatch {
        name: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Device Error: {0} is not available")]
    UnsupportedDevice(String),
}
