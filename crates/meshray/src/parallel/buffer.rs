//! The rank-local work buffer.

use std::collections::VecDeque;

use crate::ray::Ray;
use crate::study::BufferPolicy;

/// Holds the rays waiting to be traced on this rank. Draining order is
/// configurable: LIFO chases the newest work (keeping the live set
/// small), circular drains oldest-first.
#[derive(Debug)]
pub struct WorkBuffer {
    policy: BufferPolicy,
    rays: VecDeque<Ray>,
}

impl WorkBuffer {
    pub fn new(policy: BufferPolicy) -> Self {
        Self {
            policy,
            rays: VecDeque::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rays.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rays.is_empty()
    }

    pub fn push(&mut self, ray: Ray) {
        self.rays.push_back(ray);
    }

    pub fn pop(&mut self) -> Option<Ray> {
        match self.policy {
            BufferPolicy::Lifo => self.rays.pop_back(),
            BufferPolicy::Circular => self.rays.pop_front(),
        }
    }

    /// Removes up to `n` rays in draining order.
    pub fn drain_chunk(&mut self, n: usize) -> Vec<Ray> {
        let take = n.min(self.rays.len());
        let mut out = Vec::with_capacity(take);
        for _ in 0..take {
            if let Some(ray) = self.pop() {
                out.push(ray);
            }
        }
        out
    }
}
