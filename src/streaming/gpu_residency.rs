//! Bookkeeping for bricks uploaded to the display device
//!
//! Membership changes are decided under the cache lock on whatever thread
//! holds it. The device work and observer notifications they imply are
//! posted to the UI thread, in order, through a [`UiDispatcher`]. Uploads
//! the device rejects are reported back and dropped from the bookkeeping by
//! [`GpuResidencySet::reconcile_failed_uploads`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::core::error::Error;
use crate::core::types::{Result, Vec3};
use crate::streaming::ui_thread::{UiDispatcher, UiThread};
use crate::volume::{BrickInfo, BrickKey, BrickPayload};

/// Rendering backend that owns GPU copies of bricks
pub trait DisplayDevice: Send + Sync {
    /// Create the device-side resource for a brick
    fn upload(&self, ui: &UiThread, brick: &dyn BrickInfo, payload: &BrickPayload) -> Result<()>;

    /// Free the device-side resource for a brick
    fn release(&self, ui: &UiThread, key: &BrickKey);
}

/// Notified on the UI thread after the displayed set changes
pub trait DisplayObserver: Send + Sync {
    /// `added` is the brick just uploaded, if any; `displayed` is the full set
    fn display_set_changed(&self, ui: &UiThread, added: Option<&BrickKey>, displayed: &[BrickKey]);

    fn upload_failed(&self, _ui: &UiThread, _key: &BrickKey, _error: &Error) {}
}

type ObserverList = Arc<RwLock<Vec<Arc<dyn DisplayObserver>>>>;

/// Uploads the device rejected, tagged with the upload that failed
type FailedUploads = Arc<Mutex<Vec<(BrickKey, u64)>>>;

struct Upload {
    id: u64,
    brick: Arc<dyn BrickInfo>,
    payload: Arc<BrickPayload>,
}

/// Device work implied by one membership change
struct DisplayChange {
    released: Vec<BrickKey>,
    upload: Option<Upload>,
    added: Option<BrickKey>,
    displayed: Vec<BrickKey>,
}

impl DisplayChange {
    fn apply(
        self,
        ui: &UiThread,
        device: &dyn DisplayDevice,
        observers: &ObserverList,
        failed: &FailedUploads,
    ) {
        let observers: Vec<_> = observers.read().clone();

        for key in &self.released {
            device.release(ui, key);
        }

        let mut added = self.added;
        if let Some(upload) = &self.upload {
            let brick = upload.brick.as_ref();
            if let Err(error) = device.upload(ui, brick, &upload.payload) {
                log::error!("Failed to upload brick {}: {}", brick.key(), error);
                failed.lock().push((brick.key().clone(), upload.id));
                for observer in &observers {
                    observer.upload_failed(ui, brick.key(), &error);
                }
                added = None;
            }
        }

        if added.is_none() && self.released.is_empty() {
            return;
        }
        for observer in &observers {
            observer.display_set_changed(ui, added.as_ref(), &self.displayed);
        }
    }
}

struct DisplayedBrick {
    brick: Arc<dyn BrickInfo>,
    /// Upload that put the brick on the device
    upload_id: u64,
}

/// Bricks currently uploaded to the display device
pub struct GpuResidencySet {
    displayed: HashMap<BrickKey, DisplayedBrick>,
    next_upload_id: u64,
    failed: FailedUploads,
    device: Arc<dyn DisplayDevice>,
    dispatcher: Arc<dyn UiDispatcher>,
    observers: ObserverList,
}

impl GpuResidencySet {
    pub fn new(device: Arc<dyn DisplayDevice>, dispatcher: Arc<dyn UiDispatcher>) -> Self {
        Self {
            displayed: HashMap::new(),
            next_upload_id: 0,
            failed: Arc::new(Mutex::new(Vec::new())),
            device,
            dispatcher,
            observers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn len(&self) -> usize {
        self.displayed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.displayed.is_empty()
    }

    pub fn contains(&self, key: &BrickKey) -> bool {
        self.displayed.contains_key(key)
    }

    /// Displayed keys in key order
    pub fn keys(&self) -> Vec<BrickKey> {
        let mut keys: Vec<_> = self.displayed.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Register an observer (duplicates by identity are ignored)
    pub fn add_observer(&self, observer: Arc<dyn DisplayObserver>) {
        let mut observers = self.observers.write();
        if !observers.iter().any(|o| Arc::ptr_eq(o, &observer)) {
            observers.push(observer);
        }
    }

    pub fn remove_observer(&self, observer: &Arc<dyn DisplayObserver>) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|o| !Arc::ptr_eq(o, observer));
        observers.len() != before
    }

    pub fn clear_observers(&self) {
        self.observers.write().clear();
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    /// Display a resident brick, evicting others to stay within `budget`.
    ///
    /// Eviction prefers bricks outside `keep`, farthest from `focus` first.
    /// Returns false if the brick was already displayed or `budget` is zero.
    pub fn promote(
        &mut self,
        brick: Arc<dyn BrickInfo>,
        payload: Arc<BrickPayload>,
        keep: &[BrickKey],
        budget: usize,
        focus: Vec3,
    ) -> bool {
        let key = brick.key().clone();
        if budget == 0 || self.contains(&key) {
            return false;
        }
        let upload = self.track(brick, payload);
        let released = self.pick_victims(keep, budget, focus, Some(&key));
        for victim in &released {
            self.displayed.remove(victim);
        }
        log::trace!("Displaying {} ({} evicted)", key, released.len());
        self.publish(DisplayChange {
            released,
            upload: Some(upload),
            added: Some(key),
            displayed: Vec::new(),
        });
        true
    }

    /// Stop displaying a brick
    pub fn evict(&mut self, key: &BrickKey) -> bool {
        if self.displayed.remove(key).is_none() {
            return false;
        }
        self.publish(DisplayChange {
            released: vec![key.clone()],
            upload: None,
            added: None,
            displayed: Vec::new(),
        });
        true
    }

    /// Evict until at most `budget` bricks remain; returns how many went
    pub fn trim(&mut self, keep: &[BrickKey], budget: usize, focus: Vec3) -> usize {
        let released = self.pick_victims(keep, budget, focus, None);
        if released.is_empty() {
            return 0;
        }
        for victim in &released {
            self.displayed.remove(victim);
        }
        let count = released.len();
        self.publish(DisplayChange {
            released,
            upload: None,
            added: None,
            displayed: Vec::new(),
        });
        count
    }

    /// Stop displaying everything
    pub fn clear(&mut self) {
        if self.displayed.is_empty() {
            return;
        }
        let released = self.keys();
        self.displayed.clear();
        self.publish(DisplayChange {
            released,
            upload: None,
            added: None,
            displayed: Vec::new(),
        });
    }

    /// Replace everything displayed with a single brick
    pub fn show_only(&mut self, brick: Arc<dyn BrickInfo>, payload: Arc<BrickPayload>) {
        let key = brick.key().clone();
        let released: Vec<_> = self.keys().into_iter().filter(|k| *k != key).collect();
        self.displayed.retain(|k, _| *k == key);
        let upload = (!self.contains(&key)).then(|| self.track(brick, payload));
        self.publish(DisplayChange {
            released,
            added: upload.as_ref().map(|_| key),
            upload,
            displayed: Vec::new(),
        });
    }

    /// Drop bricks whose upload the device rejected; returns how many went.
    ///
    /// A failure only counts against the upload that caused it, so a brick
    /// evicted and promoted again since then stays displayed.
    pub fn reconcile_failed_uploads(&mut self) -> usize {
        let failed = std::mem::take(&mut *self.failed.lock());
        let mut dropped = 0;
        for (key, upload_id) in failed {
            if self.displayed.get(&key).is_some_and(|d| d.upload_id == upload_id) {
                self.displayed.remove(&key);
                dropped += 1;
                log::debug!("Brick {key} never reached the device; no longer displayed");
            }
        }
        dropped
    }

    fn track(&mut self, brick: Arc<dyn BrickInfo>, payload: Arc<BrickPayload>) -> Upload {
        self.next_upload_id += 1;
        let id = self.next_upload_id;
        self.displayed.insert(
            brick.key().clone(),
            DisplayedBrick {
                brick: Arc::clone(&brick),
                upload_id: id,
            },
        );
        Upload { id, brick, payload }
    }

    fn pick_victims(
        &self,
        keep: &[BrickKey],
        budget: usize,
        focus: Vec3,
        protect: Option<&BrickKey>,
    ) -> Vec<BrickKey> {
        let excess = self.displayed.len().saturating_sub(budget);
        if excess == 0 {
            return Vec::new();
        }
        let mut candidates: Vec<(bool, f32, &BrickKey)> = self
            .displayed
            .iter()
            .filter(|(key, _)| Some(*key) != protect)
            .map(|(key, displayed)| {
                let distance = displayed.brick.bounding_box().centroid_distance_squared(focus);
                (keep.contains(key), distance, key)
            })
            .collect();
        // Unwanted before wanted, then farthest first
        candidates.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| b.1.total_cmp(&a.1))
                .then_with(|| a.2.cmp(b.2))
        });
        candidates
            .into_iter()
            .take(excess)
            .map(|(_, _, key)| key.clone())
            .collect()
    }

    fn publish(&self, mut change: DisplayChange) {
        change.displayed = self.keys();
        let device = Arc::clone(&self.device);
        let observers = Arc::clone(&self.observers);
        let failed = Arc::clone(&self.failed);
        self.dispatcher.post(Box::new(move |ui: &UiThread| {
            change.apply(ui, device.as_ref(), &observers, &failed)
        }));
    }
}

/// Display device that only tracks what it holds; for headless runs
#[derive(Debug, Default)]
pub struct HeadlessDevice {
    resident: Mutex<HashMap<BrickKey, usize>>,
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently uploaded, in key order
    pub fn resident_keys(&self) -> Vec<BrickKey> {
        let mut keys: Vec<_> = self.resident.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Total payload bytes currently uploaded
    pub fn resident_bytes(&self) -> usize {
        self.resident.lock().values().sum()
    }
}

impl DisplayDevice for HeadlessDevice {
    fn upload(&self, _ui: &UiThread, brick: &dyn BrickInfo, payload: &BrickPayload) -> Result<()> {
        self.resident.lock().insert(brick.key().clone(), payload.byte_len());
        Ok(())
    }

    fn release(&self, _ui: &UiThread, key: &BrickKey) {
        self.resident.lock().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cancel::CancelToken;
    use crate::core::types::UVec3;
    use crate::streaming::ui_thread::{UiPoster, UiRunQueue};
    use crate::volume::{LoadOptions, MemoryBrick};

    /// Brick `i` spans x in [10i, 10i + 10)
    fn brick(i: u32) -> (Arc<dyn BrickInfo>, Arc<BrickPayload>) {
        let brick = MemoryBrick::filled(
            format!("b{i}"),
            Vec3::new(i as f32 * 10.0, 0.0, 0.0),
            UVec3::splat(10),
            1.0,
            i as u8,
        );
        let payload = brick.load(&LoadOptions::default(), &CancelToken::new()).unwrap();
        (Arc::new(brick), Arc::new(payload))
    }

    #[derive(Default)]
    struct Recorder {
        changes: Mutex<Vec<(Option<BrickKey>, Vec<BrickKey>)>>,
        failures: Mutex<Vec<BrickKey>>,
    }

    impl DisplayObserver for Recorder {
        fn display_set_changed(&self, _ui: &UiThread, added: Option<&BrickKey>, displayed: &[BrickKey]) {
            self.changes.lock().push((added.cloned(), displayed.to_vec()));
        }

        fn upload_failed(&self, _ui: &UiThread, key: &BrickKey, _error: &Error) {
            self.failures.lock().push(key.clone());
        }
    }

    struct BrokenDevice;

    impl DisplayDevice for BrokenDevice {
        fn upload(&self, _ui: &UiThread, brick: &dyn BrickInfo, _payload: &BrickPayload) -> Result<()> {
            Err(Error::Upload(format!("out of texture memory for {}", brick.key())))
        }

        fn release(&self, _ui: &UiThread, _key: &BrickKey) {}
    }

    fn setup(device: Arc<dyn DisplayDevice>) -> (GpuResidencySet, UiRunQueue, Arc<Recorder>) {
        let (poster, queue): (UiPoster, UiRunQueue) = UiRunQueue::new();
        let set = GpuResidencySet::new(device, Arc::new(poster));
        let recorder = Arc::new(Recorder::default());
        set.add_observer(recorder.clone());
        (set, queue, recorder)
    }

    #[test]
    fn test_promote_evicts_farthest_unwanted() {
        let device = Arc::new(HeadlessDevice::new());
        let (mut set, mut ui, recorder) = setup(device.clone());
        let (b0, p0) = brick(0);
        let (b1, p1) = brick(1);
        let (b2, p2) = brick(2);
        let k0 = b0.key().clone();
        let k2 = b2.key().clone();

        assert!(set.promote(b0.clone(), p0.clone(), &[k0.clone()], 2, Vec3::ZERO));
        assert!(!set.promote(b0, p0, &[k0.clone()], 2, Vec3::ZERO));
        assert!(set.promote(b1, p1, &[], 2, Vec3::ZERO));
        assert!(set.promote(b2, p2, &[k2.clone()], 2, Vec3::ZERO));

        assert_eq!(set.keys(), vec![k0.clone(), k2.clone()]);
        // Nothing touches the device until the UI thread drains
        assert!(device.resident_keys().is_empty());

        assert_eq!(ui.run_pending(), 3);
        assert_eq!(device.resident_keys(), vec![k0.clone(), k2.clone()]);
        assert_eq!(device.resident_bytes(), 2000);

        let changes = recorder.changes.lock();
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[2], (Some(k2.clone()), vec![k0, k2]));
    }

    #[test]
    fn test_trim_and_clear() {
        let device = Arc::new(HeadlessDevice::new());
        let (mut set, mut ui, recorder) = setup(device.clone());
        for i in 0..3 {
            let (b, p) = brick(i);
            set.promote(b, p, &[], 3, Vec3::ZERO);
        }
        let (near, _) = brick(0);

        assert_eq!(set.trim(&[], 1, Vec3::ZERO), 2);
        assert_eq!(set.keys(), vec![near.key().clone()]);
        assert_eq!(set.trim(&[], 1, Vec3::ZERO), 0);

        set.clear();
        assert!(set.is_empty());
        ui.run_pending();
        assert!(device.resident_keys().is_empty());
        assert_eq!(recorder.changes.lock().last().unwrap(), &(None, vec![]));
    }

    #[test]
    fn test_upload_failure_reported() {
        let (mut set, mut ui, recorder) = setup(Arc::new(BrokenDevice));
        let (b0, p0) = brick(0);
        let key = b0.key().clone();
        set.promote(b0, p0, &[], 1, Vec3::ZERO);

        ui.run_pending();
        assert_eq!(*recorder.failures.lock(), vec![key.clone()]);
        assert!(recorder.changes.lock().is_empty());

        assert!(set.contains(&key));
        assert_eq!(set.reconcile_failed_uploads(), 1);
        assert!(!set.contains(&key));
        assert_eq!(set.reconcile_failed_uploads(), 0);
    }

    #[test]
    fn test_stale_upload_failure_ignored_after_repromote() {
        let (mut set, mut ui, _recorder) = setup(Arc::new(BrokenDevice));
        let (b0, p0) = brick(0);
        let key = b0.key().clone();
        set.promote(b0.clone(), p0.clone(), &[], 1, Vec3::ZERO);
        ui.run_pending();

        // Evicted and shown again before the failure is reconciled
        set.evict(&key);
        set.promote(b0, p0, &[], 1, Vec3::ZERO);
        assert_eq!(set.reconcile_failed_uploads(), 0);
        assert!(set.contains(&key));

        ui.run_pending();
        assert_eq!(set.reconcile_failed_uploads(), 1);
        assert!(set.is_empty());
    }

    #[test]
    fn test_show_only_replaces_all() {
        let device = Arc::new(HeadlessDevice::new());
        let (mut set, mut ui, _recorder) = setup(device.clone());
        for i in 0..2 {
            let (b, p) = brick(i);
            set.promote(b, p, &[], 2, Vec3::ZERO);
        }
        let (lone, payload) = brick(5);
        set.show_only(lone.clone(), payload);

        ui.run_pending();
        assert_eq!(set.keys(), vec![lone.key().clone()]);
        assert_eq!(device.resident_keys(), vec![lone.key().clone()]);
    }

    #[test]
    fn test_observer_registration() {
        let (set, _ui, recorder) = setup(Arc::new(HeadlessDevice::new()));
        let observer: Arc<dyn DisplayObserver> = recorder;
        set.add_observer(observer.clone());
        assert_eq!(set.observer_count(), 1);
        assert!(set.remove_observer(&observer));
        assert!(!set.remove_observer(&observer));
        set.add_observer(observer);
        set.clear_observers();
        assert_eq!(set.observer_count(), 0);
    }
}
