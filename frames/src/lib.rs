//! Frame model and persistence for CCD reduction.
//!
//! This crate holds the types shared by every reduction stage: the in-memory
//! [`Frame`], its [`FrameHeader`] keywords, robust statistics, the
//! [`FrameStore`] persistence abstraction and [`FrameCollection`] discovery.

pub mod collection;
pub mod frame;
pub mod header;
pub mod io;
pub mod stats;
pub mod store;

pub use collection::{CollectionError, FrameCollection, FrameFilter, FrameRef};
pub use frame::{check_shape, Frame, ShapeMismatch};
pub use header::{FrameHeader, ImageType, Provenance};
pub use io::FitsStore;
pub use store::{FrameInfo, FrameStore, MemoryStore, StoreError};
