//! Cross-queue synchronization attached to values whose producer or consumer
//! runs on an asynchronous execution queue.

use std::sync::Arc;

use crate::spec::{DeviceMemoryInfo, ProviderId, QueueId, ValueId};

/// Synchronization hooks invoked around each use of a fenced value. The
/// semantics are opaque to the dispatcher; typical implementations record and
/// wait on device stream events.
pub trait FenceController: Send + Sync {
    fn before_using_as_input(&self, provider: &ProviderId, queue: QueueId);

    fn after_used_as_input(&self, queue: QueueId);

    fn before_using_as_output(&self, provider: &ProviderId, queue: QueueId);

    fn after_used_as_output(&self, queue: QueueId);
}

pub type FenceHandle = Arc<dyn FenceController>;

/// Creates fence controllers for values the plan marked as crossing an
/// asynchronous queue. Returning `None` leaves the value unfenced, which is
/// appropriate for providers without asynchronous semantics.
pub trait FenceFactory: Send + Sync {
    fn create_fence(&self, value: ValueId, placement: &DeviceMemoryInfo) -> Option<FenceHandle>;
}
