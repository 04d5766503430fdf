// Deferred destruction
//
// GPU handles can only be released once no submitted work references them.
// Owners push a release action when they create a resource and flush the
// queue once a fence (or a full idle wait) proves the GPU is done.
// Later resources may depend on earlier ones (a view on its image), so the
// queue always runs newest first.

/// A release action, run exactly once.
pub type Deletor = Box<dyn FnOnce()>;

/// Ordered registry of deferred release actions, flushed in reverse order.
#[derive(Default)]
pub struct DeletionQueue {
    deletors: Vec<Deletor>,
}

impl DeletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a release action.
    pub fn push<F>(&mut self, deletor: F)
    where
        F: FnOnce() + 'static,
    {
        self.deletors.push(Box::new(deletor));
    }

    /// Run every pending action, last registered first, and empty the queue.
    ///
    /// Calling this on an empty queue does nothing. The caller must ensure
    /// the GPU no longer uses any resource the actions release.
    pub fn flush(&mut self) {
        if self.deletors.is_empty() {
            return;
        }

        log::trace!("Flushing {} deferred deletions", self.deletors.len());
        while let Some(deletor) = self.deletors.pop() {
            deletor();
        }
    }

    pub fn len(&self) -> usize {
        self.deletors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deletors.is_empty()
    }
}

impl Drop for DeletionQueue {
    fn drop(&mut self) {
        // Running them here could free resources the GPU still reads
        if !self.deletors.is_empty() {
            log::warn!(
                "Deletion queue dropped with {} unflushed actions; GPU resources leaked",
                self.deletors.len()
            );
        }
    }
}

impl std::fmt::Debug for DeletionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeletionQueue")
            .field("pending", &self.deletors.len())
            .finish()
    }
}
