//! Camera-driven brick streaming: load scheduling, residency and display

pub mod lod;
pub mod load_queue;
pub mod ui_thread;
pub mod gpu_residency;
pub mod tile_cache;
pub mod camera_observer;

pub use lod::{micrometers_per_pixel, select_resolution};
pub use load_queue::{LoadPriority, PriorityLoadQueue, TaskHandle, TaskState};
pub use ui_thread::{UiDispatcher, UiJob, UiPoster, UiRunQueue, UiThread};
pub use gpu_residency::{DisplayDevice, DisplayObserver, GpuResidencySet, HeadlessDevice};
pub use tile_cache::{CacheStats, CameraState, VolumeTileCache, WeakTileCache};
pub use camera_observer::CacheCameraObserver;
