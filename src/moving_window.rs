/// Fixed-capacity circular buffer of samples. Appending past capacity
/// overwrites the oldest sample. Not thread safe; callers serialize access.
pub struct MovingWindow<T> {
    samples: Vec<T>,
    capacity: usize,
    next: usize,
}

impl<T: Copy> MovingWindow<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "moving window capacity must be nonzero");
        Self {
            samples: Vec::with_capacity(capacity),
            capacity,
            next: 0,
        }
    }

    pub fn append(&mut self, sample: T) {
        if self.samples.len() < self.capacity {
            self.samples.push(sample);
        } else {
            self.samples[self.next] = sample;
        }
        self.next = (self.next + 1) % self.capacity;
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Visits up to `capacity` valid samples in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.samples.iter()
    }
}

impl MovingWindow<f64> {
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }
}

impl MovingWindow<usize> {
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|&s| s as f64).sum::<f64>() / self.samples.len() as f64
    }
}
