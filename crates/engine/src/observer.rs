use tokio::sync::mpsc;

use crate::engine::TurnOutcome;
use crate::turn::{GeneratedImage, LocalMessageId, ThreadId};

/// Notification seam between the engine and whatever renders turns.
///
/// Callbacks fire on the engine's read-loop task and must not block; the
/// channel implementation below is the expected shape for UI integrations.
pub trait TurnObserver: Send + Sync {
    /// Full accumulated content after a batched flush, not the delta.
    fn on_content_update(&self, thread_id: &ThreadId, message_id: LocalMessageId, content: &str);

    fn on_image_generated(&self, thread_id: &ThreadId, image: &GeneratedImage);

    /// Fired for both Finalized and Stopped terminal outcomes.
    fn on_turn_finalized(&self, thread_id: &ThreadId, outcome: &TurnOutcome);

    fn on_turn_errored(&self, thread_id: &ThreadId, message: &str);
}

/// Observer that drops every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl TurnObserver for NullObserver {
    fn on_content_update(&self, _: &ThreadId, _: LocalMessageId, _: &str) {}

    fn on_image_generated(&self, _: &ThreadId, _: &GeneratedImage) {}

    fn on_turn_finalized(&self, _: &ThreadId, _: &TurnOutcome) {}

    fn on_turn_errored(&self, _: &ThreadId, _: &str) {}
}

/// Owned snapshot of one observer callback, for channel consumers.
#[derive(Debug, Clone)]
pub enum ObserverEvent {
    ContentUpdate {
        thread_id: ThreadId,
        message_id: LocalMessageId,
        content: String,
    },
    ImageGenerated {
        thread_id: ThreadId,
        image: GeneratedImage,
    },
    TurnFinalized {
        thread_id: ThreadId,
        outcome: TurnOutcome,
    },
    TurnErrored {
        thread_id: ThreadId,
        message: String,
    },
}

/// Observer that forwards events over an unbounded channel.
///
/// Send failures mean the consumer hung up; the engine keeps running the turn
/// to completion regardless, so they are silently ignored.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    events: mpsc::UnboundedSender<ObserverEvent>,
}

impl ChannelObserver {
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<ObserverEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (Self { events }, receiver)
    }
}

impl TurnObserver for ChannelObserver {
    fn on_content_update(&self, thread_id: &ThreadId, message_id: LocalMessageId, content: &str) {
        let _ = self.events.send(ObserverEvent::ContentUpdate {
            thread_id: thread_id.clone(),
            message_id,
            content: content.to_string(),
        });
    }

    fn on_image_generated(&self, thread_id: &ThreadId, image: &GeneratedImage) {
        let _ = self.events.send(ObserverEvent::ImageGenerated {
            thread_id: thread_id.clone(),
            image: image.clone(),
        });
    }

    fn on_turn_finalized(&self, thread_id: &ThreadId, outcome: &TurnOutcome) {
        let _ = self.events.send(ObserverEvent::TurnFinalized {
            thread_id: thread_id.clone(),
            outcome: outcome.clone(),
        });
    }

    fn on_turn_errored(&self, thread_id: &ThreadId, message: &str) {
        let _ = self.events.send(ObserverEvent::TurnErrored {
            thread_id: thread_id.clone(),
            message: message.to_string(),
        });
    }
}
