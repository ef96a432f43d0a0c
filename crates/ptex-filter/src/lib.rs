//! # ptex-filter
//!
//! Seam-aware filtering over per-face textures.
//!
//! Evaluating a texture near a face boundary must reach into the
//! neighbouring faces to stay continuous across the seam. The filters here
//! build a convolution kernel for a requested footprint, split it across
//! face edges using the mesh adjacency stored in the file, rotate the
//! pieces into each neighbour's frame (handling faces meeting at different
//! subdivision levels), and accumulate over whatever data resolution the
//! reader has resident.
//!
//! - [`PtexFilter::mitchell`] - separable Mitchell-Netravali, adjustable
//!   sharpness
//! - [`PtexFilter::box_filter`] - exact-footprint box
//! - [`PtexFilter::triangle`] - elliptical Gaussian for triangle meshes
//!
//! ## Example
//!
//! ```ignore
//! use ptex_filter::PtexFilter;
//!
//! let filter = PtexFilter::mitchell(1.0);
//! let mut rgb = [0.0f32; 3];
//! filter.eval(&mut rgb, 0, 3, &tx, faceid, u, v, uw, vw);
//! ```

#![warn(missing_docs)]

pub mod filters;
pub mod kernel;
mod separable;
mod triangle;

pub use filters::PtexFilter;
pub use kernel::SeparableKernel;
pub use triangle::TriangleOptions;
