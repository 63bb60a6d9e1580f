//! Camera-driven brick cache with a host-memory tier and a display tier
//!
//! Each camera change picks the resolution level for the zoom, takes the
//! `ram_tile_count` bricks nearest the focus as the desired set and the
//! nearest `gpu_tile_count` of those as the display set. Missing display
//! bricks load at HIGH priority, the rest at LOW; bricks that fall out of
//! the desired set are dropped from memory and from the display.
//!
//! All bookkeeping sits behind one lock, so a camera update and a load
//! completion never interleave. Invariants after every public operation:
//! displayed bricks are resident, resident bricks are desired, and both
//! tiers stay within their budgets.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::config::{TileLoadingConfig, validate_budgets, validate_concurrency};
use crate::core::error::Error;
use crate::core::types::{Result, Vec3};
use crate::streaming::gpu_residency::{DisplayDevice, DisplayObserver, GpuResidencySet};
use crate::streaming::load_queue::{LoadPriority, PriorityLoadQueue};
use crate::streaming::lod::select_resolution;
use crate::streaming::ui_thread::UiDispatcher;
use crate::volume::{BrickInfo, BrickKey, BrickPayload, BrickSource, LoadOptions};

/// Camera parameters a working set was computed for
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraState {
    pub focus: Vec3,
    /// Scene units spanned by the viewport height
    pub zoom: f32,
}

impl CameraState {
    /// Exact comparison: any change at all, however small, is a new camera
    pub fn same_as(&self, other: &CameraState) -> bool {
        self.focus == other.focus && self.zoom == other.zoom
    }
}

/// Snapshot of the cache's tiers and counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub desired: usize,
    pub display_desired: usize,
    pub resident: usize,
    pub displayed: usize,
    /// Host memory held by resident payloads
    pub resident_bytes: usize,
    pub queued_loads: usize,
    pub running_loads: usize,
    pub loads_submitted: u64,
    pub loads_completed: u64,
    pub loads_failed: u64,
    /// Loads that finished after their brick stopped being wanted
    pub loads_discarded: u64,
    /// Camera updates ignored because nothing changed
    pub camera_updates_skipped: u64,
    /// Bricks the display device refused to take
    pub uploads_failed: u64,
}

#[derive(Clone, Debug)]
struct ResidentBrick {
    brick: Arc<dyn BrickInfo>,
    payload: Arc<BrickPayload>,
}

#[derive(Debug, Default)]
struct Counters {
    completed: u64,
    failed: u64,
    discarded: u64,
    skipped: u64,
    uploads_failed: u64,
}

struct CacheState {
    source: Option<Arc<dyn BrickSource>>,
    config: TileLoadingConfig,
    color_channel: u32,
    update_enabled: bool,
    /// Camera the current working set was computed for
    computed_for: Option<CameraState>,
    /// Most recent camera, recorded even while updates are paused
    latest_camera: Option<CameraState>,
    desired: HashMap<BrickKey, Arc<dyn BrickInfo>>,
    /// Nearest first
    display_desired: Vec<BrickKey>,
    resident: HashMap<BrickKey, ResidentBrick>,
    gpu: GpuResidencySet,
    counters: Counters,
}

impl CacheState {
    fn focus(&self) -> Vec3 {
        self.computed_for.map_or(Vec3::ZERO, |c| c.focus)
    }

    fn load_options(&self, source: &dyn BrickSource) -> LoadOptions {
        LoadOptions {
            max_edge_pad: self.config.max_edge_pad,
            channel: self.color_channel,
            format: source.format_hint(),
        }
    }

    /// Forget the computed camera so the next update recomputes
    fn invalidate(&mut self) {
        self.computed_for = None;
    }

    /// Stop counting bricks as displayed once their upload has failed
    fn reconcile_display(&mut self) {
        let dropped = self.gpu.reconcile_failed_uploads();
        self.counters.uploads_failed += dropped as u64;
    }
}

struct CacheInner {
    state: Mutex<CacheState>,
    queue: PriorityLoadQueue<BrickKey, BrickPayload>,
}

impl CacheInner {
    fn recompute(self: &Arc<Self>, state: &mut CacheState, camera: CameraState) {
        state.computed_for = Some(camera);
        state.reconcile_display();
        let Some(source) = state.source.clone() else {
            log::trace!("No source set; nothing to stream");
            return;
        };
        let resolutions = source.available_resolutions();
        let Some(resolution) =
            select_resolution(&resolutions, camera.zoom, state.config.viewport_height_px)
        else {
            log::debug!("Source has no resolution levels");
            return;
        };
        let Some(bricks) = source.brick_set_for_resolution(resolution) else {
            log::warn!("Source lists resolution {resolution} but has no bricks for it");
            return;
        };

        // The nearest gpu_tile_count of the nearest ram_tile_count are the
        // nearest gpu_tile_count overall
        let closest = bricks.closest(camera.focus, state.config.ram_tile_count);
        let display_count = state.config.gpu_tile_count.min(closest.len());
        let desired: HashMap<_, _> = closest
            .iter()
            .map(|b| (b.key().clone(), Arc::clone(b)))
            .collect();

        for key in state.desired.keys().filter(|k| !desired.contains_key(*k)) {
            self.queue.cancel(key);
        }
        state.desired = desired;
        state.display_desired = closest[..display_count]
            .iter()
            .map(|b| b.key().clone())
            .collect();

        let options = state.load_options(source.as_ref());
        let budget = state.config.gpu_tile_count;
        let focus = camera.focus;

        for brick in &closest[..display_count] {
            let key = brick.key();
            if state.gpu.contains(key) {
                continue;
            }
            match state.resident.get(key).cloned() {
                Some(resident) => {
                    state.gpu.promote(resident.brick, resident.payload, &state.display_desired, budget, focus);
                }
                None => self.enqueue(Arc::clone(brick), LoadPriority::High, options),
            }
        }
        for brick in &closest[display_count..] {
            if !state.resident.contains_key(brick.key()) {
                self.enqueue(Arc::clone(brick), LoadPriority::Low, options);
            }
        }

        let obsolete: Vec<BrickKey> = state
            .resident
            .keys()
            .filter(|k| !state.desired.contains_key(*k))
            .cloned()
            .collect();
        for key in &obsolete {
            state.resident.remove(key);
            state.gpu.evict(key);
        }
        state.gpu.trim(&state.display_desired, budget, focus);

        log::debug!(
            "Working set at {:.3} um/vx: {} desired, {} resident, {} displayed, {} evicted",
            resolution,
            state.desired.len(),
            state.resident.len(),
            state.gpu.len(),
            obsolete.len()
        );
    }

    fn enqueue(self: &Arc<Self>, brick: Arc<dyn BrickInfo>, priority: LoadPriority, options: LoadOptions) {
        let loader = Arc::clone(&brick);
        let cache = Arc::downgrade(self);
        self.queue.submit(
            brick.key().clone(),
            priority,
            move |cancel| loader.load(&options, cancel),
            move |key, result| Self::finish_load(&cache, key, brick, result),
        );
    }

    /// Runs on a load worker once a brick's payload is read
    fn finish_load(
        cache: &Weak<CacheInner>,
        key: BrickKey,
        brick: Arc<dyn BrickInfo>,
        result: Result<BrickPayload>,
    ) {
        let Some(inner) = cache.upgrade() else {
            return;
        };
        let mut guard = inner.state.lock();
        let state = &mut *guard;

        let payload = match result {
            Ok(payload) => payload,
            Err(error) => {
                state.counters.failed += 1;
                log::warn!("Failed to load brick {key}: {error}");
                return;
            }
        };
        if !state.update_enabled || !state.desired.contains_key(&key) {
            state.counters.discarded += 1;
            log::debug!("Discarding load of {key}; no longer wanted");
            return;
        }
        if !payload.matches(brick.as_ref()) {
            state.counters.failed += 1;
            log::warn!(
                "Brick {key} loaded with shape {} but declares {}",
                payload.shape,
                brick.voxel_shape()
            );
            return;
        }

        let payload = Arc::new(payload);
        state.counters.completed += 1;
        state.resident.insert(
            key.clone(),
            ResidentBrick {
                brick: Arc::clone(&brick),
                payload: Arc::clone(&payload),
            },
        );
        if state.display_desired.contains(&key) {
            let focus = state.focus();
            state
                .gpu
                .promote(brick, payload, &state.display_desired, state.config.gpu_tile_count, focus);
        }
    }
}

/// Streams the bricks around a camera into host memory and onto the display.
///
/// Cheap to clone; clones share one cache.
#[derive(Clone)]
pub struct VolumeTileCache {
    inner: Arc<CacheInner>,
}

/// Non-owning reference to a [`VolumeTileCache`]
#[derive(Clone)]
pub struct WeakTileCache {
    inner: Weak<CacheInner>,
}

impl WeakTileCache {
    pub fn upgrade(&self) -> Option<VolumeTileCache> {
        self.inner.upgrade().map(|inner| VolumeTileCache { inner })
    }
}

impl VolumeTileCache {
    /// Create a cache with its own load runtime
    pub fn new(
        config: TileLoadingConfig,
        dispatcher: Arc<dyn UiDispatcher>,
        device: Arc<dyn DisplayDevice>,
    ) -> Result<Self> {
        config.validate()?;
        let queue = PriorityLoadQueue::new(config.concurrent_loads)?;
        Ok(Self::build(config, queue, dispatcher, device))
    }

    /// Create a cache whose loads run on an existing runtime
    pub fn with_handle(
        config: TileLoadingConfig,
        handle: Handle,
        dispatcher: Arc<dyn UiDispatcher>,
        device: Arc<dyn DisplayDevice>,
    ) -> Result<Self> {
        config.validate()?;
        let queue = PriorityLoadQueue::with_handle(handle, config.concurrent_loads)?;
        Ok(Self::build(config, queue, dispatcher, device))
    }

    fn build(
        config: TileLoadingConfig,
        queue: PriorityLoadQueue<BrickKey, BrickPayload>,
        dispatcher: Arc<dyn UiDispatcher>,
        device: Arc<dyn DisplayDevice>,
    ) -> Self {
        log::info!(
            "Tile cache: {} RAM tiles, {} GPU tiles, {} concurrent loads",
            config.ram_tile_count,
            config.gpu_tile_count,
            config.concurrent_loads
        );
        let state = CacheState {
            source: None,
            config,
            color_channel: 0,
            update_enabled: true,
            computed_for: None,
            latest_camera: None,
            desired: HashMap::new(),
            display_desired: Vec::new(),
            resident: HashMap::new(),
            gpu: GpuResidencySet::new(device, dispatcher),
            counters: Counters::default(),
        };
        Self {
            inner: Arc::new(CacheInner {
                state: Mutex::new(state),
                queue,
            }),
        }
    }

    pub fn downgrade(&self) -> WeakTileCache {
        WeakTileCache {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Recompute the working set for a new focus and zoom.
    ///
    /// Ignored while updates are paused, when neither value changed since
    /// the last recomputation, and when either is not finite.
    pub fn on_camera_changed(&self, focus: Vec3, zoom: f32) {
        if !focus.is_finite() || !zoom.is_finite() {
            log::warn!("Ignoring camera with non-finite focus {focus} or zoom {zoom}");
            return;
        }
        let camera = CameraState { focus, zoom };
        let mut state = self.inner.state.lock();
        state.latest_camera = Some(camera);
        if !state.update_enabled {
            log::trace!("Cache updates paused; ignoring camera change");
            return;
        }
        if state.computed_for.is_some_and(|c| c.same_as(&camera)) {
            state.counters.skipped += 1;
            return;
        }
        self.inner.recompute(&mut state, camera);
    }

    /// Switch datasets. Nothing is evicted until the next camera update.
    pub fn set_source(&self, source: Option<Arc<dyn BrickSource>>) {
        let mut state = self.inner.state.lock();
        match &source {
            Some(s) => log::info!("Tile source set ({} resolution levels)", s.available_resolutions().len()),
            None => log::info!("Tile source cleared"),
        }
        state.source = source;
        state.invalidate();
    }

    pub fn source(&self) -> Option<Arc<dyn BrickSource>> {
        self.inner.state.lock().source.clone()
    }

    pub fn set_ram_tile_count(&self, count: usize) -> Result<()> {
        let mut state = self.inner.state.lock();
        validate_budgets(count, state.config.gpu_tile_count)?;
        state.config.ram_tile_count = count;
        state.invalidate();
        Ok(())
    }

    pub fn set_gpu_tile_count(&self, count: usize) -> Result<()> {
        let mut state = self.inner.state.lock();
        validate_budgets(state.config.ram_tile_count, count)?;
        state.config.gpu_tile_count = count;
        state.invalidate();
        Ok(())
    }

    /// Resize the load worker pool
    pub fn set_concurrency(&self, concurrent_loads: usize) -> Result<()> {
        validate_concurrency(concurrent_loads)?;
        let mut state = self.inner.state.lock();
        self.inner.queue.set_concurrency(concurrent_loads)?;
        state.config.concurrent_loads = concurrent_loads;
        Ok(())
    }

    /// Replace every tunable at once
    pub fn apply_config(&self, config: TileLoadingConfig) -> Result<()> {
        config.validate()?;
        let mut state = self.inner.state.lock();
        self.inner.queue.set_concurrency(config.concurrent_loads)?;
        state.config = config;
        state.invalidate();
        Ok(())
    }

    pub fn config(&self) -> TileLoadingConfig {
        self.inner.state.lock().config.clone()
    }

    pub fn ram_tile_count(&self) -> usize {
        self.inner.state.lock().config.ram_tile_count
    }

    pub fn gpu_tile_count(&self) -> usize {
        self.inner.state.lock().config.gpu_tile_count
    }

    pub fn concurrency(&self) -> usize {
        self.inner.queue.concurrency()
    }

    /// Channel read by subsequent loads; bricks already resident keep theirs
    pub fn set_color_channel(&self, channel: u32) {
        self.inner.state.lock().color_channel = channel;
    }

    pub fn color_channel(&self) -> u32 {
        self.inner.state.lock().color_channel
    }

    /// Show a single brick the caller already loaded, dropping everything else
    pub fn register_lone_displayed_tile(
        &self,
        brick: Arc<dyn BrickInfo>,
        payload: BrickPayload,
    ) -> Result<()> {
        let key = brick.key().clone();
        let mut guard = self.inner.state.lock();
        guard.reconcile_display();
        if guard.gpu.contains(&key) {
            return Ok(());
        }
        if !payload.matches(brick.as_ref()) {
            return Err(Error::load_decode(
                key.to_string(),
                format!("payload shape {} does not match brick", payload.shape),
            ));
        }

        self.inner.queue.cancel_all();
        let state = &mut *guard;
        let payload = Arc::new(payload);
        state.desired.clear();
        state.desired.insert(key.clone(), Arc::clone(&brick));
        state.display_desired = vec![key.clone()];
        state.resident.clear();
        state.resident.insert(
            key.clone(),
            ResidentBrick {
                brick: Arc::clone(&brick),
                payload: Arc::clone(&payload),
            },
        );
        state.gpu.show_only(brick, payload);
        log::info!("Displaying lone brick {key}");
        Ok(())
    }

    /// Drop every brick and cancel every load
    pub fn clear_all_tiles(&self) {
        let mut guard = self.inner.state.lock();
        self.inner.queue.cancel_all();
        let state = &mut *guard;
        state.desired.clear();
        state.display_desired.clear();
        state.resident.clear();
        state.gpu.clear();
        state.invalidate();
        log::debug!("Cleared all tiles");
    }

    /// Pause or resume reacting to camera changes.
    ///
    /// Resuming recomputes for the latest camera seen while paused. Loads
    /// that finish while paused are discarded.
    pub fn set_update_cache(&self, enabled: bool) {
        let mut state = self.inner.state.lock();
        if state.update_enabled == enabled {
            return;
        }
        state.update_enabled = enabled;
        log::info!("Tile cache updates {}", if enabled { "resumed" } else { "paused" });
        if enabled {
            state.invalidate();
            if let Some(camera) = state.latest_camera {
                self.inner.recompute(&mut state, camera);
            }
        }
    }

    pub fn is_update_cache(&self) -> bool {
        self.inner.state.lock().update_enabled
    }

    /// Flip the update flag; returns the new value
    pub fn toggle_update_cache(&self) -> bool {
        let enabled = !self.is_update_cache();
        self.set_update_cache(enabled);
        enabled
    }

    pub fn add_observer(&self, observer: Arc<dyn DisplayObserver>) {
        self.inner.state.lock().gpu.add_observer(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn DisplayObserver>) -> bool {
        self.inner.state.lock().gpu.remove_observer(observer)
    }

    pub fn clear_observers(&self) {
        self.inner.state.lock().gpu.clear_observers();
    }

    /// Desired keys in key order
    pub fn desired_keys(&self) -> Vec<BrickKey> {
        let mut keys: Vec<_> = self.inner.state.lock().desired.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Keys wanted on the display, nearest first
    pub fn display_desired_keys(&self) -> Vec<BrickKey> {
        self.inner.state.lock().display_desired.clone()
    }

    /// Resident keys in key order
    pub fn resident_keys(&self) -> Vec<BrickKey> {
        let mut keys: Vec<_> = self.inner.state.lock().resident.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Displayed keys in key order
    pub fn displayed_keys(&self) -> Vec<BrickKey> {
        let mut state = self.inner.state.lock();
        state.reconcile_display();
        state.gpu.keys()
    }

    pub fn is_resident(&self, key: &BrickKey) -> bool {
        self.inner.state.lock().resident.contains_key(key)
    }

    pub fn is_displayed(&self, key: &BrickKey) -> bool {
        let mut state = self.inner.state.lock();
        state.reconcile_display();
        state.gpu.contains(key)
    }

    pub fn resident_payload(&self, key: &BrickKey) -> Option<Arc<BrickPayload>> {
        self.inner
            .state
            .lock()
            .resident
            .get(key)
            .map(|r| Arc::clone(&r.payload))
    }

    /// No loads queued or running
    pub fn is_idle(&self) -> bool {
        self.inner.queue.is_idle()
    }

    pub fn stats(&self) -> CacheStats {
        let mut state = self.inner.state.lock();
        state.reconcile_display();
        CacheStats {
            desired: state.desired.len(),
            display_desired: state.display_desired.len(),
            resident: state.resident.len(),
            displayed: state.gpu.len(),
            resident_bytes: state.resident.values().map(|r| r.payload.byte_len()).sum(),
            queued_loads: self.inner.queue.queued_count(),
            running_loads: self.inner.queue.running_count(),
            loads_submitted: self.inner.queue.submitted_count(),
            loads_completed: state.counters.completed,
            loads_failed: state.counters.failed,
            loads_discarded: state.counters.discarded,
            camera_updates_skipped: state.counters.skipped,
            uploads_failed: state.counters.uploads_failed,
        }
    }
}
