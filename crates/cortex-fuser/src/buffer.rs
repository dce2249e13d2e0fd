//! Input Buffer.
//!
//! A single-slot holder of the most recent observation of one input plugin.
//! Every write replaces the whole [`Observation`] atomically through a
//! [`tokio::sync::watch`] channel, so a reader always sees either the previous
//! or the new value, never a mix of both.
//!
//! Handles are cheap to clone: the input task keeps one for writing, the
//! [`Fuser`](crate::Fuser) keeps another for reading.
//!
//! # Example
//!
//! ```rust
//! use cortex_fuser::InputBuffer;
//!
//! let buffer = InputBuffer::new("mic", "Voice");
//! assert!(buffer.snapshot().is_empty());
//!
//! buffer.write("hello");
//! buffer.write("hello again");
//! assert_eq!(buffer.snapshot().text, "hello again");
//! ```

use std::sync::Arc;

use cortex_types::Observation;
use tokio::sync::watch;
use tracing::trace;

struct Slot {
    name: String,
    descriptor: String,
    latest: watch::Sender<Arc<Observation>>,
}

/// Shared handle to one input's latest observation.
#[derive(Clone)]
pub struct InputBuffer {
    slot: Arc<Slot>,
}

impl InputBuffer {
    /// Create an empty buffer.
    ///
    /// `name` identifies the input inside its mode; `descriptor` is the
    /// human-readable label that prefixes the observation in the prompt.
    pub fn new(name: impl Into<String>, descriptor: impl Into<String>) -> Self {
        let (latest, _) = watch::channel(Arc::new(Observation::empty()));
        Self {
            slot: Arc::new(Slot {
                name: name.into(),
                descriptor: descriptor.into(),
                latest,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.slot.name
    }

    pub fn descriptor(&self) -> &str {
        &self.slot.descriptor
    }

    /// Replace the current observation.
    pub fn write(&self, text: impl Into<String>) {
        let observation = Observation::new(text);
        trace!(input = %self.slot.name, len = observation.text.len(), "buffer updated");
        self.slot.latest.send_replace(Arc::new(observation));
    }

    /// Reset the buffer to the empty observation.
    pub fn clear(&self) {
        self.slot.latest.send_replace(Arc::new(Observation::empty()));
    }

    /// The current observation.  Does not consume it.
    pub fn snapshot(&self) -> Arc<Observation> {
        self.slot.latest.borrow().clone()
    }

    /// Receiver notified on every write.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Observation>> {
        self.slot.latest.subscribe()
    }
}

impl std::fmt::Debug for InputBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputBuffer")
            .field("name", &self.slot.name)
            .field("descriptor", &self.slot.descriptor)
            .field("latest", &self.snapshot().text)
            .finish()
    }
}
