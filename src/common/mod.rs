pub mod frame;
pub mod geometry;
pub mod smoothing;

pub use frame::{Frame, encode_jpeg, mean_luma};
pub use geometry::{PixelRect, Point};
pub use smoothing::{KeyedEma, ScalarEma};
