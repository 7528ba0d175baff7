//! Host-process lifecycle signals.
//!
//! A host that can be suspended (a mobile app going to the background, a
//! daemon being throttled) sends these to its [`EndpointService`] through
//! the channel given to [`EndpointService::with_lifecycle`]. The service
//! releases its listener on [`EnteringBackground`] and rebinds it on
//! [`BecameActive`]. Established sessions are left alone.
//!
//! [`EndpointService`]: crate::service::EndpointService
//! [`EndpointService::with_lifecycle`]: crate::service::EndpointService::with_lifecycle
//! [`EnteringBackground`]: LifecycleEvent::EnteringBackground
//! [`BecameActive`]: LifecycleEvent::BecameActive

use tokio::sync::mpsc;

/// A change in the host process's run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    EnteringBackground,
    BecameActive,
}

/// Create a lifecycle channel.
///
/// Keep the sender in the host; hand the receiver to the service.
pub fn channel(capacity: usize) -> (mpsc::Sender<LifecycleEvent>, mpsc::Receiver<LifecycleEvent>) {
    mpsc::channel(capacity.max(1))
}
