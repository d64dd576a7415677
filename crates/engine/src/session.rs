use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{EngineResult, TurnAlreadyStreamingSnafu, TurnNotStreamingSnafu};
use crate::transport::CancelHandle;
use crate::turn::{LocalMessageId, ThreadId};

struct ActiveSession {
    local_message_id: LocalMessageId,
    cancel: CancelHandle,
}

/// Tracks the single in-flight turn permitted per thread.
///
/// Holding the cancel handle here lets `stop` fire it from any task without
/// touching the read loop directly.
#[derive(Default)]
pub struct SessionRegistry {
    active: Mutex<HashMap<ThreadId, ActiveSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new in-flight turn, rejecting a second submission while one
    /// is already streaming on the same thread.
    pub fn begin(
        &self,
        thread_id: &ThreadId,
        local_message_id: LocalMessageId,
        cancel: CancelHandle,
    ) -> EngineResult<()> {
        let mut active = self.lock();
        if active.contains_key(thread_id) {
            return TurnAlreadyStreamingSnafu {
                stage: "session-begin",
                thread_id: thread_id.to_string(),
            }
            .fail();
        }

        active.insert(
            thread_id.clone(),
            ActiveSession {
                local_message_id,
                cancel,
            },
        );
        Ok(())
    }

    /// Fires cancellation for the thread's in-flight turn, if any.
    pub fn stop(&self, thread_id: &ThreadId) -> EngineResult<()> {
        let mut active = self.lock();
        match active.get_mut(thread_id) {
            Some(session) => {
                session.cancel.cancel();
                Ok(())
            }
            None => TurnNotStreamingSnafu {
                stage: "session-stop",
                thread_id: thread_id.to_string(),
            }
            .fail(),
        }
    }

    /// Releases the thread once its turn reaches a terminal state.
    pub fn finish(&self, thread_id: &ThreadId) {
        self.lock().remove(thread_id);
    }

    pub fn is_streaming(&self, thread_id: &ThreadId) -> bool {
        self.lock().contains_key(thread_id)
    }

    pub fn streaming_message_id(&self, thread_id: &ThreadId) -> Option<LocalMessageId> {
        self.lock()
            .get(thread_id)
            .map(|session| session.local_message_id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ThreadId, ActiveSession>> {
        // Sessions stay usable even if a panicking task poisoned the lock.
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    #[test]
    fn second_begin_on_same_thread_is_rejected() {
        let registry = SessionRegistry::new();
        let thread = ThreadId::new("t-1");

        let (first, _first_rx) = CancelHandle::pair();
        registry
            .begin(&thread, LocalMessageId::new_v7(), first)
            .expect("first begin");

        let (second, _second_rx) = CancelHandle::pair();
        let error = registry
            .begin(&thread, LocalMessageId::new_v7(), second)
            .expect_err("second begin");
        assert!(matches!(error, EngineError::TurnAlreadyStreaming { .. }));
    }

    #[test]
    fn stop_without_active_turn_is_rejected() {
        let registry = SessionRegistry::new();
        let error = registry
            .stop(&ThreadId::new("t-1"))
            .expect_err("nothing streaming");
        assert!(matches!(error, EngineError::TurnNotStreaming { .. }));
    }

    #[test]
    fn stop_fires_the_cancel_signal() {
        let registry = SessionRegistry::new();
        let thread = ThreadId::new("t-1");

        let (handle, mut signal) = CancelHandle::pair();
        registry
            .begin(&thread, LocalMessageId::new_v7(), handle)
            .expect("begin");

        registry.stop(&thread).expect("stop");
        assert!(signal.try_recv().is_ok());

        // Repeated stops stay legal while the session is still registered.
        registry.stop(&thread).expect("stop again");
    }

    #[test]
    fn finish_releases_the_thread_for_a_new_turn() {
        let registry = SessionRegistry::new();
        let thread = ThreadId::new("t-1");

        let (first, _first_rx) = CancelHandle::pair();
        registry
            .begin(&thread, LocalMessageId::new_v7(), first)
            .expect("begin");
        assert!(registry.is_streaming(&thread));

        registry.finish(&thread);
        assert!(!registry.is_streaming(&thread));

        let (second, _second_rx) = CancelHandle::pair();
        registry
            .begin(&thread, LocalMessageId::new_v7(), second)
            .expect("begin after finish");
    }

    #[test]
    fn independent_threads_stream_concurrently() {
        let registry = SessionRegistry::new();

        let (first, _first_rx) = CancelHandle::pair();
        let (second, _second_rx) = CancelHandle::pair();
        registry
            .begin(&ThreadId::new("t-1"), LocalMessageId::new_v7(), first)
            .expect("begin t-1");
        registry
            .begin(&ThreadId::new("t-2"), LocalMessageId::new_v7(), second)
            .expect("begin t-2");

        assert!(registry.is_streaming(&ThreadId::new("t-1")));
        assert!(registry.is_streaming(&ThreadId::new("t-2")));
    }
}
