//! # ptex-core
//!
//! Core types for per-face texturing. Each face of a quad or triangle mesh
//! owns its own texture image at an independent power-of-two resolution,
//! and records which face lies across each of its edges so that filtering
//! can cross seams.
//!
//! This crate provides the pieces shared by the file I/O and filtering
//! layers:
//!
//! - [`Res`], [`FaceInfo`] - per-face resolution and adjacency records
//! - [`MeshType`], [`DataType`], [`EdgeId`], [`MetaDataType`], [`BorderMode`]
//!   - format enumerations
//! - [`half`] - table-driven f16 conversion
//! - [`pixel`] - type-dispatched pixel buffer operations (reductions,
//!   interleave, difference coding, alpha handling)
//! - [`PtexError`] - the error type shared across the workspace
//!
//! ## Crate structure
//!
//! ```text
//! ptex-core (this crate)
//!    ^
//!    |
//!    +-- ptex-io (file format, reader, writer, cache)
//!    +-- ptex-filter (kernels and filter engine)
//! ```

#![warn(missing_docs)]

pub mod error;
pub mod half;
pub mod pixel;
pub mod res;
pub mod types;

pub use error::{PtexError, Result};
pub use res::{FaceInfo, Res};
pub use types::{BorderMode, DataType, EdgeId, MeshType, MetaDataType};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{PtexError, Result};
    pub use crate::res::{FaceInfo, Res};
    pub use crate::types::{BorderMode, DataType, EdgeId, MeshType, MetaDataType};
}
