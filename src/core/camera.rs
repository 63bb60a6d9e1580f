//! Camera vantage and change notification
//!
//! The full perspective camera lives with the renderer. The tile cache only
//! needs the vantage: where the camera is focused and how much of the scene
//! fits in the viewport.

use std::sync::Arc;

use crate::core::types::Vec3;

/// Focus point and zoom of a camera
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Vantage {
    /// Point the camera orbits, in micrometers
    pub focus: Vec3,
    /// Scene units (micrometers) spanned by the viewport height
    pub scene_units_per_viewport_height: f32,
}

impl Vantage {
    /// Create a vantage
    pub fn new(focus: Vec3, scene_units_per_viewport_height: f32) -> Self {
        Self { focus, scene_units_per_viewport_height }
    }
}

/// Receives vantage changes from an [`ObservableCamera`]
pub trait CameraObserver: Send + Sync {
    /// Called synchronously on the thread that moved the camera
    fn vantage_changed(&self, vantage: &Vantage);
}

/// Camera vantage that notifies observers whenever it changes
pub struct ObservableCamera {
    vantage: Vantage,
    observers: Vec<Arc<dyn CameraObserver>>,
}

impl ObservableCamera {
    /// Create a camera at the given vantage
    pub fn new(vantage: Vantage) -> Self {
        Self {
            vantage,
            observers: Vec::new(),
        }
    }

    /// Current vantage
    pub fn vantage(&self) -> Vantage {
        self.vantage
    }

    /// Move the focus point
    pub fn set_focus(&mut self, focus: Vec3) {
        self.set_vantage(Vantage { focus, ..self.vantage });
    }

    /// Change the zoom (scene units per viewport height)
    pub fn set_zoom(&mut self, scene_units_per_viewport_height: f32) {
        self.set_vantage(Vantage {
            scene_units_per_viewport_height,
            ..self.vantage
        });
    }

    /// Translate the focus point
    pub fn pan_by(&mut self, delta: Vec3) {
        self.set_focus(self.vantage.focus + delta);
    }

    /// Replace the whole vantage, notifying observers if it differs
    pub fn set_vantage(&mut self, vantage: Vantage) {
        if vantage == self.vantage {
            return;
        }
        self.vantage = vantage;
        for observer in &self.observers {
            observer.vantage_changed(&self.vantage);
        }
    }

    /// Register an observer (duplicates by identity are ignored)
    pub fn add_observer(&mut self, observer: Arc<dyn CameraObserver>) {
        if self.observers.iter().any(|o| Arc::ptr_eq(o, &observer)) {
            return;
        }
        self.observers.push(observer);
    }

    /// Unregister an observer
    pub fn remove_observer(&mut self, observer: &Arc<dyn CameraObserver>) {
        self.observers.retain(|o| !Arc::ptr_eq(o, observer));
    }

    /// Number of registered observers
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }
}
