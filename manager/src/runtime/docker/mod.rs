//! Docker Runtime Module
//!
//! Container-engine implementation of the RuntimeAdapter trait, plus the
//! engine-only image operations (build, inspect, remove) the pipeline uses.

pub mod adapter;

pub use adapter::{DockerAdapter, ImageDetails};
