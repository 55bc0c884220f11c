//! Scalar bounding box types in normalized image coordinates.
//!
//! Boxes follow the `(ymin, xmin, ymax, xmax)` convention, which maps to the
//! `(t, l, b, r)` accessors of [Rect].

mod common;

pub use rect::*;
pub mod rect;

pub use tlbr::*;
pub mod tlbr;

pub use cycxhw::*;
pub mod cycxhw;

pub mod prelude {
    pub use crate::rect::{Rect, RectFloat, RectNum};
}
