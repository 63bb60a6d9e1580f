//! Volume datasets enumerated as fixed-size bricks per resolution level

pub mod brick;
pub mod brick_set;
pub mod source;
pub mod memory;
pub mod raw;

pub use brick::{BrickInfo, BrickKey, BrickPayload, FormatHint, LoadOptions};
pub use brick_set::BrickInfoSet;
pub use source::{BrickSource, StaticBrickSource};
pub use memory::MemoryBrick;
pub use raw::{
    LevelManifest, RawBrick, RawBrickSource, RawFormat, VolumeManifest,
    write_raw_volume, volume_center, MANIFEST_FILE,
};
