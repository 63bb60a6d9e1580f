//! Explicit run queue for work that must happen on the UI/render thread
//!
//! GPU resources belong to a rendering context that is not thread-safe, so
//! uploads, releases and observer notifications are posted here from any
//! thread and executed when the UI thread drains the queue. Callbacks that
//! must only run on that thread take a [`UiThread`] token, which only the
//! draining [`UiRunQueue`] can create.

use std::marker::PhantomData;

use tokio::sync::mpsc;

/// Proof that the holder is running inside [`UiRunQueue::run_pending`].
///
/// Neither `Send` nor `Sync`, and not constructible outside this module.
pub struct UiThread {
    _not_send: PhantomData<*const ()>,
}

impl UiThread {
    fn new() -> Self {
        Self { _not_send: PhantomData }
    }
}

/// A unit of work for the UI thread
pub type UiJob = Box<dyn FnOnce(&UiThread) + Send>;

/// Posts jobs to the UI thread's run queue. Never blocks.
pub trait UiDispatcher: Send + Sync {
    fn post(&self, job: UiJob);
}

/// Sending half of a [`UiRunQueue`]; cheap to clone and share
#[derive(Clone)]
pub struct UiPoster {
    tx: mpsc::UnboundedSender<UiJob>,
}

impl UiDispatcher for UiPoster {
    fn post(&self, job: UiJob) {
        if self.tx.send(job).is_err() {
            log::debug!("UI run queue closed; dropping job");
        }
    }
}

/// Receiving half, owned by the UI thread
pub struct UiRunQueue {
    rx: mpsc::UnboundedReceiver<UiJob>,
}

impl UiRunQueue {
    /// Create a run queue and the poster that feeds it
    pub fn new() -> (UiPoster, UiRunQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (UiPoster { tx }, UiRunQueue { rx })
    }

    /// Run every job posted so far, in posting order. Returns how many ran.
    pub fn run_pending(&mut self) -> usize {
        let ui = UiThread::new();
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            job(&ui);
            ran += 1;
        }
        ran
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use parking_lot::Mutex;

    #[test]
    fn test_jobs_run_in_order_on_drain() {
        let (poster, mut queue) = UiRunQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let log = log.clone();
            poster.post(Box::new(move |_ui: &UiThread| log.lock().push(i)));
        }
        assert!(log.lock().is_empty());

        assert_eq!(queue.run_pending(), 3);
        assert_eq!(*log.lock(), vec![0, 1, 2]);
        assert_eq!(queue.run_pending(), 0);
    }

    #[test]
    fn test_post_from_other_thread() {
        let (poster, mut queue) = UiRunQueue::new();
        let hits = Arc::new(Mutex::new(0));
        let h = hits.clone();
        std::thread::spawn(move || {
            poster.post(Box::new(move |_ui: &UiThread| *h.lock() += 1));
        })
        .join()
        .unwrap();

        assert_eq!(queue.run_pending(), 1);
        assert_eq!(*hits.lock(), 1);
    }

    #[test]
    fn test_post_after_queue_dropped_is_ignored() {
        let (poster, queue) = UiRunQueue::new();
        drop(queue);
        poster.post(Box::new(|_ui: &UiThread| {}));
    }
}
