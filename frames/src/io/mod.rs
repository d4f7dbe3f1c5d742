//! On-disk frame formats

pub mod fits;

pub use fits::FitsStore;
