//! voltile - camera-driven streaming of volumetric image bricks

pub mod core;
pub mod math;
pub mod volume;
pub mod config;
pub mod streaming;
