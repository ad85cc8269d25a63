use std::sync::{Arc, Weak};

use crate::alloc_tracker::{AllocContext, AllocTracker, AllocUnit, TrackerStatistics};
use crate::driver::Driver;
use crate::gc::GcState;
use crate::heap::Heap;

pub struct GenerationParams {
    /// Usage cap enforced by the allocation tracker.
    pub max_size: usize,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_size: 128 * 1024 * 1024,
        }
    }
}

/// One generation: the allocation tracker, its collector state and the
/// driver that decides when the collector runs. Threads are joined on drop
/// in teardown order (driver, then GC thread, then the tracker).
pub struct Generation {
    tracker: Arc<AllocTracker>,
    gc: Arc<GcState>,
    driver: Driver,
}

impl Generation {
    pub(crate) fn new(params: &GenerationParams, heap: Weak<Heap>) -> Generation {
        let tracker = Arc::new(AllocTracker::new(params.max_size));
        let gc = GcState::new(heap, tracker.clone());
        let driver = Driver::new(gc.clone(), tracker.clone());
        Generation {
            tracker,
            gc,
            driver,
        }
    }

    pub fn tracker(&self) -> &AllocTracker {
        &self.tracker
    }

    pub fn gc(&self) -> &Arc<GcState> {
        &self.gc
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    pub fn get_statistics(&self) -> TrackerStatistics {
        self.tracker.get_statistics()
    }

    /// Allocates a raw block, applying the pacing throttle and stamping the
    /// unit's mark bit and owner. Null when the tracker refuses.
    ///
    /// # Safety
    /// Same contract as [`AllocTracker::alloc`].
    pub(crate) unsafe fn alloc(&self, ctx: *mut AllocContext, size: usize) -> *mut AllocUnit {
        self.gc.on_preallocate();
        let unit = self.tracker.alloc(ctx, size);
        if !unit.is_null() {
            self.gc.on_allocate(unit);
        }
        unit
    }
}

impl Drop for Generation {
    fn drop(&mut self) {
        self.driver.shutdown();
        self.gc.perform_shutdown();
    }
}
