pub mod geometry;
pub mod locator;

pub use geometry::NormalizedBox;
pub use locator::{locate_face, parse_face_box, ParseResult};
