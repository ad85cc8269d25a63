//! Heap façade: owns the generation and the registry of attached mutators.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::generation::{Generation, GenerationParams};
use crate::mutator::{Mutator, MutatorRef};
use crate::statistics::GcStats;

pub struct Heap {
    self_ref: Weak<Heap>,
    gen: Generation,
    /// Attached mutators. The GC thread walks this during the root
    /// snapshot and the residual remark drain, both under exclusive access.
    mutators: Mutex<Vec<*mut Mutator>>,
}

unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

impl Heap {
    pub fn new(params: GenerationParams) -> Arc<Heap> {
        Arc::new_cyclic(|weak| Heap {
            self_ref: weak.clone(),
            gen: Generation::new(&params, weak.clone()),
            mutators: Mutex::new(Vec::new()),
        })
    }

    pub fn generation(&self) -> &Generation {
        &self.gen
    }

    /// Attaches the calling thread. The returned handle is the thread's
    /// gateway to allocation and object access; dropping it detaches.
    pub fn attach_thread(&self) -> MutatorRef {
        let heap = self.self_ref.upgrade().expect("heap is being torn down");
        let ctx = self.gen.tracker().new_context();
        let mutator = Box::into_raw(Box::new(Mutator::new(heap, ctx)));
        self.mutators.lock().push(mutator);
        MutatorRef::from_raw(mutator)
    }

    pub(crate) fn detach_thread(&self, mutator: *mut Mutator) {
        let mut mutators = self.mutators.lock();
        let pos = mutators
            .iter()
            .position(|&m| m == mutator)
            .expect("mutator is not attached to this heap");
        mutators.swap_remove(pos);
    }

    pub(crate) fn iterate_mutators(&self, mut f: impl FnMut(*mut Mutator)) {
        let mutators = self.mutators.lock();
        for &mutator in mutators.iter() {
            f(mutator);
        }
    }

    pub fn attached_mutator_count(&self) -> usize {
        self.mutators.lock().len()
    }

    /// Starts automatic collection. The driver begins life paused so an
    /// empty heap does not burn warm-up cycles.
    pub fn unpause_driver(&self) {
        self.gen.driver().unpause();
    }

    pub fn stats(&self) -> GcStats {
        self.gen.gc().stats()
    }
}
