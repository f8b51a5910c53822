//! Delivery interface between the dispatcher and subscribers
//!
//! Observers are called from the dispatch pass and must return quickly.
//! Anything slow belongs behind a [`ChannelObserver`], which hands updates
//! to a bounded channel and reports `ChannelFull` instead of waiting.

use crate::{error::DeliveryError, types::FeedUpdate};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Receives updates for one subscription
pub trait FeedObserver: Send + Sync {
    /// Handles one delivered update
    fn on_update(&self, update: &FeedUpdate) -> Result<(), DeliveryError>;
}

/// Observer backed by a plain closure
pub struct FnObserver<F> {
    f: F,
}

impl<F> FeedObserver for FnObserver<F>
where
    F: Fn(&FeedUpdate) + Send + Sync,
{
    fn on_update(&self, update: &FeedUpdate) -> Result<(), DeliveryError> {
        (self.f)(update);
        Ok(())
    }
}

/// Wraps a closure as an observer
///
/// # Example
/// ```
/// use realtime_feed_sdk::observer;
///
/// let printer = observer::from_fn(|update| println!("{}: {}", update.feed, update.payload));
/// # drop(printer);
/// ```
pub fn from_fn<F>(f: F) -> Arc<dyn FeedObserver>
where
    F: Fn(&FeedUpdate) + Send + Sync + 'static,
{
    Arc::new(FnObserver { f })
}

/// Observer that forwards updates into a bounded channel
pub struct ChannelObserver {
    sender: mpsc::Sender<FeedUpdate>,
}

impl ChannelObserver {
    /// Creates an observer and the receiver its updates arrive on
    pub fn channel(capacity: usize) -> (Arc<Self>, mpsc::Receiver<FeedUpdate>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Arc::new(Self { sender }), receiver)
    }
}

impl FeedObserver for ChannelObserver {
    fn on_update(&self, update: &FeedUpdate) -> Result<(), DeliveryError> {
        self.sender.try_send(update.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::ChannelFull,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::ChannelClosed,
        })
    }
}
