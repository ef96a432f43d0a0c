//! # ptex-io
//!
//! Reader, writer and cache for per-face texture files.
//!
//! A file stores one image per mesh face at an independent power-of-two
//! resolution, a full set of 2:1 mipmap reductions, face adjacency, typed
//! metadata and optional appended edit records. This crate provides:
//!
//! - [`PtexReader`] - random access to faces, reductions, tiles, pixels and
//!   metadata, with lazy loading and sticky error handling
//! - [`PtexWriter`] - full-file and incremental (append-only) writing with
//!   mipmap generation and large-face tiling
//! - [`PtexCache`] - a shared LRU cache bounding open file handles and
//!   resident decoded bytes across many textures
//! - [`format`] - the on-disk layout itself
//!
//! ## Example
//!
//! ```ignore
//! use ptex_io::PtexCache;
//!
//! let cache = PtexCache::create(100, 256 * 1024 * 1024, false);
//! let tx = cache.get("model.ptx")?;
//! let info = tx.get_face_info(0);
//! let data = tx.get_data(0).unwrap();
//! ```

#![warn(missing_docs)]

pub mod cache;
pub mod facedata;
pub mod format;
pub mod handler;
pub mod lockfile;
pub mod metadata;
pub mod reader;
pub mod writer;

pub use cache::PtexCache;
pub use facedata::FaceData;
pub use handler::{DefaultInputHandler, InputHandler, InputSource};
pub use lockfile::LockFile;
pub use metadata::{MetaData, MetaValue};
pub use reader::PtexReader;
pub use writer::PtexWriter;
