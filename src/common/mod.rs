pub mod frame;

pub use frame::{ConversionResult, Frame, PixelFormat};
