//! State shared between the tracking and local-mapping threads.
//!
//! The map itself sits behind one reader-writer lock; the control flags of
//! the pause/stop/finish/reset protocol are atomics and condvar-guarded
//! booleans so nothing ever spin-sleeps. A dedicated map-update mutex
//! serializes optimization write-backs against readers that need a
//! consistent multi-entity snapshot (trajectory export).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::features::ScalePyramid;
use crate::map::{KeyFrameIndex, Map};

#[derive(Default)]
struct StopFlags {
    stop_requested: bool,
    stopped: bool,
    /// Latch the tracker holds while inserting a keyframe; blocks stopping.
    not_stop: bool,
}

pub struct SharedState {
    /// The shared map graph.
    pub map: RwLock<Map>,
    /// Place-recognition index for relocalization.
    pub keyframe_index: Mutex<KeyFrameIndex>,
    /// Serializes optimization epochs against snapshot readers.
    pub map_update: Mutex<()>,

    abort_ba: AtomicBool,
    accept_keyframes: AtomicBool,
    finish_requested: AtomicBool,
    finished: AtomicBool,

    stop: Mutex<StopFlags>,
    stop_cv: Condvar,

    reset_requested: Mutex<bool>,
    reset_cv: Condvar,
}

impl SharedState {
    pub fn new(pyramid: ScalePyramid) -> Arc<Self> {
        Arc::new(Self {
            map: RwLock::new(Map::new(pyramid)),
            keyframe_index: Mutex::new(KeyFrameIndex::new()),
            map_update: Mutex::new(()),
            abort_ba: AtomicBool::new(false),
            accept_keyframes: AtomicBool::new(true),
            finish_requested: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            stop: Mutex::new(StopFlags::default()),
            stop_cv: Condvar::new(),
            reset_requested: Mutex::new(false),
            reset_cv: Condvar::new(),
        })
    }

    // ── BA abort ────────────────────────────────────────────────────────

    /// Ask the running local BA to stop at its next iteration boundary.
    pub fn interrupt_ba(&self) {
        self.abort_ba.store(true, Ordering::SeqCst);
    }

    pub fn should_abort_ba(&self) -> bool {
        self.abort_ba.load(Ordering::SeqCst)
    }

    pub fn clear_abort_ba(&self) {
        self.abort_ba.store(false, Ordering::SeqCst);
    }

    // ── Keyframe backpressure ───────────────────────────────────────────

    pub fn accept_keyframes(&self) -> bool {
        self.accept_keyframes.load(Ordering::SeqCst)
    }

    pub fn set_accept_keyframes(&self, value: bool) {
        self.accept_keyframes.store(value, Ordering::SeqCst);
    }

    // ── Stop protocol ───────────────────────────────────────────────────

    /// Ask the mapper to pause at its next safe boundary. Also aborts any
    /// in-flight BA so the pause is prompt.
    pub fn request_stop(&self) {
        {
            let mut stop = self.stop.lock();
            stop.stop_requested = true;
        }
        self.interrupt_ba();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.lock().stop_requested
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.lock().stopped
    }

    /// Mapper-side: enter the stopped state if a stop was requested and the
    /// tracker is not holding the not-stop latch.
    pub fn try_enter_stop(&self) -> bool {
        let mut stop = self.stop.lock();
        if stop.stop_requested && !stop.not_stop {
            stop.stopped = true;
            true
        } else {
            false
        }
    }

    /// Mapper-side: block until released or asked to finish.
    pub fn wait_while_stopped(&self) {
        let mut stop = self.stop.lock();
        while stop.stopped && !self.finish_requested.load(Ordering::SeqCst) {
            self.stop_cv.wait(&mut stop);
        }
    }

    /// Release a paused mapper.
    pub fn release(&self) {
        {
            let mut stop = self.stop.lock();
            stop.stopped = false;
            stop.stop_requested = false;
        }
        self.stop_cv.notify_all();
    }

    /// Tracker-side latch around keyframe insertion. Fails when the mapper
    /// is already stopped.
    pub fn set_not_stop(&self, flag: bool) -> bool {
        let mut stop = self.stop.lock();
        if flag && stop.stopped {
            return false;
        }
        stop.not_stop = flag;
        true
    }

    // ── Finish protocol ─────────────────────────────────────────────────

    pub fn request_finish(&self) {
        self.finish_requested.store(true, Ordering::SeqCst);
        // A paused mapper must wake up to observe the request.
        self.stop_cv.notify_all();
    }

    pub fn finish_requested(&self) -> bool {
        self.finish_requested.load(Ordering::SeqCst)
    }

    pub fn set_finished(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    // ── Reset protocol (request / acknowledge) ──────────────────────────

    /// Ask the mapper to drop its queues; blocks until acknowledged.
    pub fn request_reset_and_wait(&self) {
        let mut requested = self.reset_requested.lock();
        *requested = true;
        while *requested {
            self.reset_cv.wait(&mut requested);
        }
    }

    /// Mapper-side: run `f` and acknowledge if a reset is pending.
    pub fn reset_if_requested(&self, f: impl FnOnce()) {
        let mut requested = self.reset_requested.lock();
        if *requested {
            f();
            *requested = false;
            self.reset_cv.notify_all();
        }
    }
}
