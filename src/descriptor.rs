use std::mem::size_of;

/// How strongly a reference field holds onto its target. The cycle engine
/// traces every declared field; strengths are metadata for reference
/// processing layered on top of the core.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReferenceStrength {
    Strong,
    Soft,
    Weak,
    Phantom,
}

/// Hook invoked on the payload of a dead object right before its memory is
/// released during sweep.
pub type Finalizer = fn(*mut u8);

/// One reference-typed slot in an object's payload.
#[derive(Clone, Copy, Debug)]
pub struct FieldDescriptor {
    pub offset: usize,
    pub strength: ReferenceStrength,
}

impl FieldDescriptor {
    pub fn strong(offset: usize) -> Self {
        Self {
            offset,
            strength: ReferenceStrength::Strong,
        }
    }
}

/// Describes the layout of a class of objects: payload size and where the
/// collector should read reference slots from. Immutable once published and
/// trusted; a descriptor that lies about offsets corrupts the heap.
pub struct Descriptor {
    object_size: usize,
    fields: Vec<FieldDescriptor>,
    has_trailing_ref_array: bool,
    finalizer: Option<Finalizer>,
}

impl Descriptor {
    pub fn new(object_size: usize, fields: Vec<FieldDescriptor>) -> Self {
        for field in &fields {
            debug_assert!(field.offset % size_of::<*const ()>() == 0);
            debug_assert!(field.offset + size_of::<*const ()>() <= object_size);
        }
        Self {
            object_size,
            fields,
            has_trailing_ref_array: false,
            finalizer: None,
        }
    }

    /// Marks the payload as carrying a reference array after the fixed part.
    /// The array length is implied by each object's allocation size.
    pub fn with_trailing_ref_array(mut self) -> Self {
        self.has_trailing_ref_array = true;
        self
    }

    pub fn with_finalizer(mut self, finalizer: Finalizer) -> Self {
        self.finalizer = Some(finalizer);
        self
    }

    pub fn object_size(&self) -> usize {
        self.object_size
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn has_trailing_ref_array(&self) -> bool {
        self.has_trailing_ref_array
    }

    pub fn finalizer(&self) -> Option<Finalizer> {
        self.finalizer
    }
}
