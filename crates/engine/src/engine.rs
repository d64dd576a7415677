use std::sync::Arc;

use futures::StreamExt;
use serde_json::json;
use tokio::time::Instant;

use rill_protocol::{DoneFrame, Frame, LineDecoder, MetadataFrame, parse_frame};

use crate::batcher::ContentBatcher;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::observer::TurnObserver;
use crate::request::{ChatMessage, ChatRequest, ChatRole, FileRef};
use crate::session::SessionRegistry;
use crate::store::{ErrorTurn, PersistedIds, PersistedTurn, TurnStore};
use crate::transport::{ByteStream, CancelHandle, CancelSignal, HttpTransport, Transport};
use crate::turn::{
    GeneratedImage, LocalMessageId, ServerMessageId, ThreadId, Turn, TurnLifecycle, TurnStats,
    TurnTransition,
};

/// User-facing copy shown when a frame fails to parse. The technical detail
/// goes to the log and the error record, never to the message body.
pub const PARSE_FAILURE_MESSAGE: &str = "The response could not be read. Please try again.";

/// User-facing copy shown when the stream ends without a done frame.
pub const STREAM_TRUNCATED_MESSAGE: &str = "The response ended unexpectedly. Please try again.";

/// Everything needed to run one turn against the chat endpoint.
#[derive(Debug, Clone)]
pub struct TurnSubmission {
    pub thread_id: ThreadId,
    pub history: Vec<ChatMessage>,
    pub user_content: String,
    pub model: String,
    pub files: Vec<FileRef>,
    pub search_grounding: bool,
}

/// Snapshot of a turn after it reached a terminal state.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub thread_id: ThreadId,
    pub local_message_id: LocalMessageId,
    pub server_message_id: Option<ServerMessageId>,
    pub lifecycle: TurnLifecycle,
    pub content: String,
    pub grounded: bool,
    pub grounding_sources: Vec<rill_protocol::GroundingSource>,
    pub generated_image: Option<GeneratedImage>,
    pub stopped_by_user: bool,
    pub persisted: Option<PersistedIds>,
    pub stats: TurnStats,
}

/// Drives streaming turns end to end: transport, framing, batching,
/// lifecycle, persistence, and observer notification.
///
/// In-stream failures are reported through the returned [`TurnOutcome`] with
/// an `Errored` lifecycle; `run_turn` returns `Err` only for caller mistakes
/// such as submitting to a thread that is already streaming.
pub struct StreamEngine {
    transport: Arc<dyn Transport>,
    store: Arc<dyn TurnStore>,
    observer: Arc<dyn TurnObserver>,
    sessions: SessionRegistry,
}

impl StreamEngine {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn TurnStore>,
        observer: Arc<dyn TurnObserver>,
    ) -> Self {
        Self {
            transport,
            store,
            observer,
            sessions: SessionRegistry::new(),
        }
    }

    pub fn with_http_transport(
        config: &EngineConfig,
        store: Arc<dyn TurnStore>,
        observer: Arc<dyn TurnObserver>,
    ) -> EngineResult<Self> {
        let transport = Arc::new(HttpTransport::new(config)?);
        Ok(Self::new(transport, store, observer))
    }

    /// Requests cancellation of the thread's in-flight turn. The read loop
    /// observes the signal and finishes the turn as `Stopped`.
    pub fn stop(&self, thread_id: &ThreadId) -> EngineResult<()> {
        self.sessions.stop(thread_id)
    }

    pub fn is_streaming(&self, thread_id: &ThreadId) -> bool {
        self.sessions.is_streaming(thread_id)
    }

    /// Runs one turn to a terminal state.
    pub async fn run_turn(&self, submission: TurnSubmission) -> EngineResult<TurnOutcome> {
        let mut turn = Turn::new(
            submission.thread_id.clone(),
            submission.model.clone(),
            submission.files.clone(),
        );
        let request = build_request(&submission);

        let (cancel, cancel_signal) = CancelHandle::pair();
        self.sessions
            .begin(&turn.thread_id, turn.local_message_id, cancel)?;

        let outcome = self
            .drive_turn(&mut turn, &submission, &request, cancel_signal)
            .await;
        self.sessions.finish(&turn.thread_id);

        Ok(outcome)
    }

    async fn drive_turn(
        &self,
        turn: &mut Turn,
        submission: &TurnSubmission,
        request: &ChatRequest,
        mut cancel_signal: CancelSignal,
    ) -> TurnOutcome {
        let started = Instant::now();

        let mut stream: ByteStream = match self.transport.open(request).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::warn!(
                    thread_id = %turn.thread_id,
                    error = %error,
                    "transport refused the turn"
                );
                return self
                    .fail_turn(turn, error.to_string(), json!({ "error": error.to_string() }))
                    .await;
            }
        };

        if let Err(rejection) = turn.apply_transition(TurnTransition::StartStreaming) {
            tracing::warn!(
                thread_id = %turn.thread_id,
                rejection = ?rejection,
                "turn refused to start streaming"
            );
        }

        let mut decoder = LineDecoder::new();
        let mut batcher = ContentBatcher::new(Instant::now());

        loop {
            tokio::select! {
                _ = &mut cancel_signal => {
                    return self.stop_turn(turn, submission, &mut batcher).await;
                }
                _ = sleep_until_deadline(batcher.deadline()) => {
                    self.flush_content(turn, &mut batcher, false);
                }
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        if turn.stats.chunk_count == 0 {
                            turn.stats.time_to_first_byte = Some(started.elapsed());
                        }
                        turn.stats.chunk_count += 1;
                        turn.stats.byte_count += bytes.len() as u64;

                        let lines = match decoder.push(&bytes) {
                            Ok(lines) => lines,
                            Err(error) => return self.fail_parse(turn, error).await,
                        };
                        for line in lines {
                            if let Some(outcome) = self
                                .apply_line(turn, submission, &mut batcher, &line)
                                .await
                            {
                                return outcome;
                            }
                        }
                    }
                    Some(Err(error)) => {
                        tracing::warn!(
                            thread_id = %turn.thread_id,
                            error = %error,
                            "stream read failed mid-turn"
                        );
                        return self
                            .fail_turn(
                                turn,
                                error.to_string(),
                                json!({ "error": error.to_string() }),
                            )
                            .await;
                    }
                    None => {
                        // A final line without a trailing newline still counts.
                        match decoder.finish() {
                            Ok(Some(line)) => {
                                if let Some(outcome) = self
                                    .apply_line(turn, submission, &mut batcher, &line)
                                    .await
                                {
                                    return outcome;
                                }
                            }
                            Ok(None) => {}
                            Err(error) => return self.fail_parse(turn, error).await,
                        }
                        return self
                            .fail_turn(
                                turn,
                                STREAM_TRUNCATED_MESSAGE.to_string(),
                                json!({ "error": "stream ended before a done frame" }),
                            )
                            .await;
                    }
                }
            }
        }
    }

    /// Applies one decoded line. `Some` means the turn reached a terminal
    /// state and any remaining buffered lines must be discarded.
    async fn apply_line(
        &self,
        turn: &mut Turn,
        submission: &TurnSubmission,
        batcher: &mut ContentBatcher,
        line: &str,
    ) -> Option<TurnOutcome> {
        let frame = match parse_frame(line) {
            Ok(frame) => frame,
            Err(error) => return Some(self.fail_parse(turn, error).await),
        };

        match frame {
            Frame::Metadata(metadata) => self.apply_metadata(turn, metadata).await,
            Frame::Content(delta) => {
                batcher.append(&delta, Instant::now());
                self.flush_content(turn, batcher, false);
                None
            }
            Frame::Done(done) => Some(self.finalize_turn(turn, submission, batcher, done).await),
        }
    }

    async fn apply_metadata(
        &self,
        turn: &mut Turn,
        metadata: MetadataFrame,
    ) -> Option<TurnOutcome> {
        if let Some(message) = metadata.error {
            return Some(
                self.fail_turn(turn, message.clone(), json!({ "error": message }))
                    .await,
            );
        }
        if let Some(message) = metadata.image_error {
            return Some(
                self.fail_turn(turn, message.clone(), json!({ "imageError": message }))
                    .await,
            );
        }

        if let Some(id) = metadata.message_id {
            turn.set_server_message_id(ServerMessageId::new(id));
        }

        if let Some(grounding) = metadata.grounding {
            if !turn.set_grounding(grounding.sources) {
                tracing::warn!(
                    thread_id = %turn.thread_id,
                    "ignored a second grounding metadata frame"
                );
            }
        }

        if metadata.image_generated.unwrap_or(false) {
            if let Some(url) = metadata.image_url {
                let image = GeneratedImage { url };
                if turn.set_generated_image(image.clone()) {
                    self.observer.on_image_generated(&turn.thread_id, &image);
                }
            } else {
                tracing::warn!(
                    thread_id = %turn.thread_id,
                    "imageGenerated frame carried no imageUrl"
                );
            }
        }

        None
    }

    fn flush_content(&self, turn: &mut Turn, batcher: &mut ContentBatcher, force: bool) {
        if let Some(chunk) = batcher.flush(force, Instant::now()) {
            if turn.append_content(&chunk).is_ok() {
                self.observer.on_content_update(
                    &turn.thread_id,
                    turn.local_message_id,
                    &turn.accumulated_content,
                );
            }
        }
    }

    async fn finalize_turn(
        &self,
        turn: &mut Turn,
        submission: &TurnSubmission,
        batcher: &mut ContentBatcher,
        done: DoneFrame,
    ) -> TurnOutcome {
        self.flush_content(turn, batcher, true);

        // Image-only turns stream no text; the done frame carries display
        // copy to use instead of an empty bubble.
        if turn.accumulated_content.is_empty() {
            if let Some(message) = done.message {
                if turn.append_content(&message).is_ok() {
                    self.observer.on_content_update(
                        &turn.thread_id,
                        turn.local_message_id,
                        &turn.accumulated_content,
                    );
                }
            }
        }

        if let Some(reported) = done.length {
            let actual = turn.accumulated_content.chars().count() as u64;
            if actual != reported {
                tracing::debug!(
                    thread_id = %turn.thread_id,
                    reported,
                    actual,
                    "done frame length differs from accumulated content"
                );
            }
        }

        let persisted = self.persist_turn(turn, submission, false).await;

        if let Err(rejection) = turn.apply_transition(TurnTransition::Finalize) {
            tracing::warn!(
                thread_id = %turn.thread_id,
                rejection = ?rejection,
                "turn refused to finalize"
            );
        }

        let outcome = self.outcome(turn, false, persisted);
        self.observer.on_turn_finalized(&turn.thread_id, &outcome);
        outcome
    }

    async fn stop_turn(
        &self,
        turn: &mut Turn,
        submission: &TurnSubmission,
        batcher: &mut ContentBatcher,
    ) -> TurnOutcome {
        tracing::info!(
            thread_id = %turn.thread_id,
            "stop requested, keeping partial content"
        );

        self.flush_content(turn, batcher, true);
        let persisted = self.persist_turn(turn, submission, true).await;

        if let Err(rejection) = turn.apply_transition(TurnTransition::Stop) {
            tracing::warn!(
                thread_id = %turn.thread_id,
                rejection = ?rejection,
                "turn refused to stop"
            );
        }

        let outcome = self.outcome(turn, true, persisted);
        self.observer.on_turn_finalized(&turn.thread_id, &outcome);
        outcome
    }

    async fn fail_parse(
        &self,
        turn: &mut Turn,
        error: rill_protocol::ProtocolError,
    ) -> TurnOutcome {
        let wrapped = EngineError::Protocol {
            stage: "parse-frame",
            source: error,
        };
        tracing::warn!(
            thread_id = %turn.thread_id,
            error = %wrapped,
            "malformed frame aborted the turn"
        );
        self.fail_turn(
            turn,
            PARSE_FAILURE_MESSAGE.to_string(),
            json!({ "error": wrapped.to_string() }),
        )
        .await
    }

    /// Fatal path for both pre-stream and mid-stream failures. Partial
    /// content is replaced with the error message so the turn renders as
    /// failed instead of half-answered.
    async fn fail_turn(
        &self,
        turn: &mut Turn,
        message: String,
        diagnostic: serde_json::Value,
    ) -> TurnOutcome {
        if let Err(rejection) = turn.apply_transition(TurnTransition::Fail {
            message: message.clone(),
        }) {
            tracing::warn!(
                thread_id = %turn.thread_id,
                rejection = ?rejection,
                "turn refused to enter the errored state"
            );
        }
        turn.replace_content_with_error(&message);
        self.observer.on_turn_errored(&turn.thread_id, &message);

        let record = ErrorTurn {
            thread_id: turn.thread_id.clone(),
            content: message,
            diagnostic,
        };
        if let Err(error) = self.store.save_error_turn(&record).await {
            tracing::warn!(
                thread_id = %turn.thread_id,
                error = %error,
                "failed to record the errored turn"
            );
        }

        self.outcome(turn, false, None)
    }

    /// Best-effort persistence; a store failure leaves the turn terminal with
    /// in-memory state only.
    async fn persist_turn(
        &self,
        turn: &Turn,
        submission: &TurnSubmission,
        stopped_by_user: bool,
    ) -> Option<PersistedIds> {
        let record = PersistedTurn {
            thread_id: turn.thread_id.clone(),
            user_content: submission.user_content.clone(),
            assistant_content: turn.accumulated_content.clone(),
            model: turn.model.clone(),
            attachments: turn.attachments.clone(),
            grounded: turn.grounded,
            sources: turn.grounding_sources.clone(),
            image: turn.generated_image.clone(),
            stopped_by_user,
        };

        let ids = match self.store.save_persisted_turn(&record).await {
            Ok(ids) => ids,
            Err(error) => {
                tracing::warn!(
                    thread_id = %turn.thread_id,
                    error = %error,
                    "failed to persist the completed turn"
                );
                return None;
            }
        };

        if !turn.attachments.is_empty() {
            let file_ids: Vec<String> = turn
                .attachments
                .iter()
                .map(|file| file.id.clone())
                .collect();
            if let Err(error) = self
                .store
                .link_attachments(&file_ids, &ids.assistant_message_id, &turn.thread_id)
                .await
            {
                tracing::warn!(
                    thread_id = %turn.thread_id,
                    error = %error,
                    "failed to link attachments to the persisted message"
                );
            }
        }

        if let Err(error) = self
            .store
            .update_thread_metadata(&turn.thread_id, &turn.model)
            .await
        {
            tracing::warn!(
                thread_id = %turn.thread_id,
                error = %error,
                "failed to update thread metadata"
            );
        }

        Some(ids)
    }

    fn outcome(
        &self,
        turn: &Turn,
        stopped_by_user: bool,
        persisted: Option<PersistedIds>,
    ) -> TurnOutcome {
        let server_message_id = turn.server_message_id.clone().or_else(|| {
            persisted
                .as_ref()
                .map(|ids| ids.assistant_message_id.clone())
        });

        TurnOutcome {
            thread_id: turn.thread_id.clone(),
            local_message_id: turn.local_message_id,
            server_message_id,
            lifecycle: turn.lifecycle.clone(),
            content: turn.accumulated_content.clone(),
            grounded: turn.grounded,
            grounding_sources: turn.grounding_sources.clone(),
            generated_image: turn.generated_image.clone(),
            stopped_by_user,
            persisted,
            stats: turn.stats.clone(),
        }
    }
}

fn build_request(submission: &TurnSubmission) -> ChatRequest {
    let mut messages = submission.history.clone();
    messages.push(ChatMessage::new(
        ChatRole::User,
        submission.user_content.clone(),
    ));

    let mut request = ChatRequest::new(messages, submission.model.clone())
        .with_thread_id(submission.thread_id.as_str())
        .with_search_grounding(submission.search_grounding);
    if !submission.files.is_empty() {
        request = request.with_files(submission.files.clone());
    }
    request
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use bytes::Bytes;
    use futures::StreamExt;

    use crate::error::TransportStatusSnafu;
    use crate::observer::{ChannelObserver, ObserverEvent};
    use crate::store::{StoreResult, RemoteSnafu};
    use crate::transport::BoxFuture;

    #[derive(Debug, Clone)]
    enum Step {
        Chunk { delay_ms: u64, bytes: &'static [u8] },
        Fail { message: &'static str },
        Hang,
    }

    struct ScriptedTransport {
        steps: Vec<Step>,
    }

    impl ScriptedTransport {
        fn new(steps: Vec<Step>) -> Self {
            Self { steps }
        }

        fn lines(lines: &[&'static [u8]]) -> Self {
            Self::new(
                lines
                    .iter()
                    .copied()
                    .map(|bytes| Step::Chunk { delay_ms: 1, bytes })
                    .collect(),
            )
        }
    }

    impl Transport for ScriptedTransport {
        fn open<'a>(&'a self, _request: &'a ChatRequest) -> BoxFuture<'a, EngineResult<ByteStream>> {
            let steps = self.steps.clone();
            Box::pin(async move {
                let stream = futures::stream::iter(steps).then(|step| async move {
                    match step {
                        Step::Chunk { delay_ms, bytes } => {
                            if delay_ms > 0 {
                                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                            }
                            Ok(Bytes::from_static(bytes))
                        }
                        Step::Fail { message } => TransportStatusSnafu {
                            stage: "scripted-step",
                            status: 502u16,
                            body: message.to_string(),
                        }
                        .fail(),
                        Step::Hang => std::future::pending().await,
                    }
                });
                Ok(Box::pin(stream) as ByteStream)
            })
        }
    }

    struct RefusingTransport;

    impl Transport for RefusingTransport {
        fn open<'a>(&'a self, _request: &'a ChatRequest) -> BoxFuture<'a, EngineResult<ByteStream>> {
            Box::pin(async move {
                TransportStatusSnafu {
                    stage: "scripted-open",
                    status: 503u16,
                    body: "service unavailable".to_string(),
                }
                .fail()
            })
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        fail_saves: bool,
        saved: Mutex<Vec<PersistedTurn>>,
        errors: Mutex<Vec<ErrorTurn>>,
        linked: Mutex<Vec<Vec<String>>>,
        metadata_updates: Mutex<usize>,
    }

    impl RecordingStore {
        fn failing() -> Self {
            Self {
                fail_saves: true,
                ..Self::default()
            }
        }
    }

    impl TurnStore for RecordingStore {
        fn save_persisted_turn<'a>(
            &'a self,
            turn: &'a PersistedTurn,
        ) -> BoxFuture<'a, StoreResult<PersistedIds>> {
            Box::pin(async move {
                if self.fail_saves {
                    return RemoteSnafu {
                        stage: "scripted-save",
                        operation: "save_persisted_turn",
                        message: "store offline".to_string(),
                    }
                    .fail();
                }
                self.saved.lock().unwrap().push(turn.clone());
                Ok(PersistedIds {
                    user_message_id: ServerMessageId::new("u1"),
                    assistant_message_id: ServerMessageId::new("a1"),
                })
            })
        }

        fn save_error_turn<'a>(&'a self, turn: &'a ErrorTurn) -> BoxFuture<'a, StoreResult<()>> {
            Box::pin(async move {
                self.errors.lock().unwrap().push(turn.clone());
                Ok(())
            })
        }

        fn link_attachments<'a>(
            &'a self,
            file_ids: &'a [String],
            _message_id: &'a ServerMessageId,
            _thread_id: &'a ThreadId,
        ) -> BoxFuture<'a, StoreResult<()>> {
            Box::pin(async move {
                self.linked.lock().unwrap().push(file_ids.to_vec());
                Ok(())
            })
        }

        fn update_thread_metadata<'a>(
            &'a self,
            _thread_id: &'a ThreadId,
            _last_model: &'a str,
        ) -> BoxFuture<'a, StoreResult<()>> {
            Box::pin(async move {
                *self.metadata_updates.lock().unwrap() += 1;
                Ok(())
            })
        }
    }

    struct Harness {
        engine: Arc<StreamEngine>,
        store: Arc<RecordingStore>,
        events: tokio::sync::mpsc::UnboundedReceiver<ObserverEvent>,
    }

    fn harness(transport: impl Transport + 'static) -> Harness {
        harness_with_store(transport, RecordingStore::default())
    }

    fn harness_with_store(transport: impl Transport + 'static, store: RecordingStore) -> Harness {
        let store = Arc::new(store);
        let (observer, events) = ChannelObserver::pair();
        let engine = Arc::new(StreamEngine::new(
            Arc::new(transport),
            store.clone(),
            Arc::new(observer),
        ));
        Harness {
            engine,
            store,
            events,
        }
    }

    fn submission(thread: &str) -> TurnSubmission {
        TurnSubmission {
            thread_id: ThreadId::new(thread),
            history: vec![ChatMessage::new(ChatRole::Assistant, "earlier reply")],
            user_content: "hello".to_string(),
            model: "gpt-4o-mini".to_string(),
            files: Vec::new(),
            search_grounding: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_finalizes_with_full_content() {
        let mut harness = harness(ScriptedTransport::lines(&[
            b"f:{\"messageId\":\"m1\"}\n",
            b"0:\"Hel\"\n",
            b"0:\"lo\"\n",
            b"d:{\"length\":5}\n",
        ]));

        let outcome = harness
            .engine
            .run_turn(submission("t-1"))
            .await
            .expect("run");

        assert_eq!(outcome.lifecycle, TurnLifecycle::Finalized);
        assert_eq!(outcome.content, "Hello");
        assert_eq!(
            outcome.server_message_id,
            Some(ServerMessageId::new("m1"))
        );
        assert!(!outcome.stopped_by_user);
        assert!(outcome.persisted.is_some());
        assert!(outcome.stats.chunk_count >= 4);

        let saved = harness.store.saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].assistant_content, "Hello");
        assert!(!saved[0].stopped_by_user);
        drop(saved);

        let mut final_content = None;
        while let Ok(event) = harness.events.try_recv() {
            match event {
                ObserverEvent::ContentUpdate { content, .. } => final_content = Some(content),
                ObserverEvent::TurnFinalized { outcome, .. } => {
                    assert_eq!(outcome.lifecycle, TurnLifecycle::Finalized);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(final_content.as_deref(), Some("Hello"));
    }

    #[tokio::test(start_paused = true)]
    async fn byte_at_a_time_delivery_reconstructs_the_same_content() {
        let script: &[u8] = b"f:{\"messageId\":\"m1\"}\n0:\"Hel\"\n0:\"lo\"\nd:{\"length\":5}\n";
        let steps = script
            .iter()
            .map(|byte| Step::Chunk {
                delay_ms: 0,
                bytes: std::slice::from_ref(byte),
            })
            .collect();
        let harness = harness(ScriptedTransport::new(steps));

        let outcome = harness
            .engine
            .run_turn(submission("t-1"))
            .await
            .expect("run");

        assert_eq!(outcome.lifecycle, TurnLifecycle::Finalized);
        assert_eq!(outcome.content, "Hello");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_keeps_partial_content() {
        let mut harness = harness(ScriptedTransport::new(vec![
            Step::Chunk {
                delay_ms: 1,
                bytes: b"0:\"Par\"\n",
            },
            Step::Hang,
        ]));

        let engine = harness.engine.clone();
        let task = tokio::spawn(async move { engine.run_turn(submission("t-1")).await });

        // The batched flush arrives once the interval elapses.
        loop {
            match harness.events.recv().await.expect("event") {
                ObserverEvent::ContentUpdate { content, .. } => {
                    assert_eq!(content, "Par");
                    break;
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }

        harness.engine.stop(&ThreadId::new("t-1")).expect("stop");

        let outcome = task.await.expect("join").expect("run");
        assert_eq!(outcome.lifecycle, TurnLifecycle::Stopped);
        assert_eq!(outcome.content, "Par");
        assert!(outcome.stopped_by_user);

        let saved = harness.store.saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert!(saved[0].stopped_by_user);
        assert_eq!(saved[0].assistant_content, "Par");
    }

    #[tokio::test(start_paused = true)]
    async fn upstream_error_frame_fails_the_turn_verbatim() {
        let harness = harness(ScriptedTransport::lines(&[
            b"0:\"partial\"\n",
            b"f:{\"error\":\"rate limited\"}\n",
            b"0:\"ignored\"\n",
            b"d:{}\n",
        ]));

        let outcome = harness
            .engine
            .run_turn(submission("t-1"))
            .await
            .expect("run");

        assert_eq!(
            outcome.lifecycle,
            TurnLifecycle::Errored {
                message: "rate limited".to_string()
            }
        );
        assert_eq!(outcome.content, "rate limited");
        assert!(outcome.persisted.is_none());

        assert!(harness.store.saved.lock().unwrap().is_empty());
        let errors = harness.store.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].content, "rate limited");
    }

    #[tokio::test(start_paused = true)]
    async fn transport_refusal_errors_the_turn_before_streaming() {
        let mut harness = harness(RefusingTransport);

        let outcome = harness
            .engine
            .run_turn(submission("t-1"))
            .await
            .expect("run");

        assert!(matches!(outcome.lifecycle, TurnLifecycle::Errored { .. }));
        assert!(outcome.content.contains("503"));
        assert!(outcome.persisted.is_none());
        assert_eq!(outcome.stats.chunk_count, 0);

        assert!(harness.store.saved.lock().unwrap().is_empty());
        assert_eq!(harness.store.errors.lock().unwrap().len(), 1);

        let mut saw_errored = false;
        while let Ok(event) = harness.events.try_recv() {
            if let ObserverEvent::TurnErrored { message, .. } = event {
                assert!(message.contains("503"));
                saw_errored = true;
            }
        }
        assert!(saw_errored);

        // The thread is released for a fresh submission.
        assert!(!harness.engine.is_streaming(&ThreadId::new("t-1")));
    }

    #[tokio::test(start_paused = true)]
    async fn image_error_frame_fails_the_turn_verbatim() {
        let harness = harness(ScriptedTransport::lines(&[
            b"0:\"partial\"\n",
            b"f:{\"imageError\":\"image generation failed\"}\n",
            b"d:{}\n",
        ]));

        let outcome = harness
            .engine
            .run_turn(submission("t-1"))
            .await
            .expect("run");

        assert_eq!(
            outcome.lifecycle,
            TurnLifecycle::Errored {
                message: "image generation failed".to_string()
            }
        );
        assert_eq!(outcome.content, "image generation failed");
        assert!(outcome.persisted.is_none());

        assert!(harness.store.saved.lock().unwrap().is_empty());
        let errors = harness.store.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].content, "image generation failed");
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frame_is_fatal_with_generic_copy() {
        let harness = harness(ScriptedTransport::lines(&[
            b"0:\"ok so far\"\n",
            b"0:not-a-json-string\n",
        ]));

        let outcome = harness
            .engine
            .run_turn(submission("t-1"))
            .await
            .expect("run");

        assert_eq!(
            outcome.lifecycle,
            TurnLifecycle::Errored {
                message: PARSE_FAILURE_MESSAGE.to_string()
            }
        );
        assert_eq!(outcome.content, PARSE_FAILURE_MESSAGE);
        assert_eq!(harness.store.errors.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn truncated_stream_errors_the_turn() {
        let harness = harness(ScriptedTransport::lines(&[b"0:\"Hi\"\n"]));

        let outcome = harness
            .engine
            .run_turn(submission("t-1"))
            .await
            .expect("run");

        assert_eq!(
            outcome.lifecycle,
            TurnLifecycle::Errored {
                message: STREAM_TRUNCATED_MESSAGE.to_string()
            }
        );
        assert!(harness.store.saved.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn done_frame_without_trailing_newline_still_finalizes() {
        let harness = harness(ScriptedTransport::lines(&[b"0:\"Hi\"\n", b"d:{}"]));

        let outcome = harness
            .engine
            .run_turn(submission("t-1"))
            .await
            .expect("run");

        assert_eq!(outcome.lifecycle, TurnLifecycle::Finalized);
        assert_eq!(outcome.content, "Hi");
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_done_frame_persists_once() {
        let harness = harness(ScriptedTransport::lines(&[
            b"0:\"Hi\"\n",
            b"d:{}\nd:{}\n0:\"late\"\n",
        ]));

        let outcome = harness
            .engine
            .run_turn(submission("t-1"))
            .await
            .expect("run");

        assert_eq!(outcome.lifecycle, TurnLifecycle::Finalized);
        assert_eq!(outcome.content, "Hi");
        assert_eq!(harness.store.saved.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_failure_mid_turn_errors_the_turn() {
        let harness = harness(ScriptedTransport::new(vec![
            Step::Chunk {
                delay_ms: 1,
                bytes: b"0:\"Hi\"\n",
            },
            Step::Fail {
                message: "upstream reset",
            },
        ]));

        let outcome = harness
            .engine
            .run_turn(submission("t-1"))
            .await
            .expect("run");

        assert!(matches!(outcome.lifecycle, TurnLifecycle::Errored { .. }));
        assert!(harness.store.saved.lock().unwrap().is_empty());
        assert_eq!(harness.store.errors.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn image_only_turn_uses_done_message_fallback() {
        let mut harness = harness(ScriptedTransport::lines(&[
            b"f:{\"imageGenerated\":true,\"imageUrl\":\"https://img/1\"}\n",
            b"d:{\"message\":\"Generated an image\"}\n",
        ]));

        let outcome = harness
            .engine
            .run_turn(submission("t-1"))
            .await
            .expect("run");

        assert_eq!(outcome.lifecycle, TurnLifecycle::Finalized);
        assert_eq!(outcome.content, "Generated an image");
        assert_eq!(
            outcome.generated_image,
            Some(GeneratedImage {
                url: "https://img/1".to_string()
            })
        );

        let mut saw_image = false;
        while let Ok(event) = harness.events.try_recv() {
            if let ObserverEvent::ImageGenerated { image, .. } = event {
                assert_eq!(image.url, "https://img/1");
                saw_image = true;
            }
        }
        assert!(saw_image);
    }

    #[tokio::test(start_paused = true)]
    async fn grounding_sources_reach_the_outcome_and_store() {
        let harness = harness(ScriptedTransport::lines(&[
            b"f:{\"grounding\":{\"sources\":[{\"title\":\"Doc\",\"url\":\"https://doc\"}]}}\n",
            b"0:\"Answer\"\n",
            b"d:{}\n",
        ]));

        let outcome = harness
            .engine
            .run_turn(submission("t-1"))
            .await
            .expect("run");

        assert!(outcome.grounded);
        assert_eq!(outcome.grounding_sources.len(), 1);
        assert_eq!(outcome.grounding_sources[0].title, "Doc");

        let saved = harness.store.saved.lock().unwrap();
        assert!(saved[0].grounded);
        assert_eq!(saved[0].sources.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn second_submission_on_a_streaming_thread_is_rejected() {
        let harness = harness(ScriptedTransport::new(vec![Step::Hang]));

        let engine = harness.engine.clone();
        let task = tokio::spawn(async move { engine.run_turn(submission("t-1")).await });

        // Wait for the first turn to register its session.
        while !harness.engine.is_streaming(&ThreadId::new("t-1")) {
            tokio::task::yield_now().await;
        }

        let error = harness
            .engine
            .run_turn(submission("t-1"))
            .await
            .expect_err("second submission");
        assert!(matches!(error, EngineError::TurnAlreadyStreaming { .. }));

        harness.engine.stop(&ThreadId::new("t-1")).expect("stop");
        let outcome = task.await.expect("join").expect("run");
        assert_eq!(outcome.lifecycle, TurnLifecycle::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_without_a_streaming_turn_is_rejected() {
        let harness = harness(ScriptedTransport::new(vec![]));
        let error = harness
            .engine
            .stop(&ThreadId::new("t-1"))
            .expect_err("nothing streaming");
        assert!(matches!(error, EngineError::TurnNotStreaming { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn persistence_failure_still_finalizes_the_turn() {
        let harness = harness_with_store(
            ScriptedTransport::lines(&[b"0:\"Hi\"\n", b"d:{}\n"]),
            RecordingStore::failing(),
        );

        let outcome = harness
            .engine
            .run_turn(submission("t-1"))
            .await
            .expect("run");

        assert_eq!(outcome.lifecycle, TurnLifecycle::Finalized);
        assert_eq!(outcome.content, "Hi");
        assert!(outcome.persisted.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn attachments_are_linked_after_persistence() {
        let harness = harness(ScriptedTransport::lines(&[b"0:\"Hi\"\n", b"d:{}\n"]));

        let mut submission = submission("t-1");
        submission.files = vec![FileRef {
            id: "file-1".to_string(),
            name: "notes.pdf".to_string(),
            kind: "application/pdf".to_string(),
            size: 2_048,
            url: None,
        }];

        let outcome = harness.engine.run_turn(submission).await.expect("run");
        assert_eq!(outcome.lifecycle, TurnLifecycle::Finalized);

        let linked = harness.store.linked.lock().unwrap();
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0], vec!["file-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn thread_is_free_for_a_new_turn_after_finalization() {
        let harness = harness(ScriptedTransport::lines(&[b"0:\"Hi\"\n", b"d:{}\n"]));

        harness
            .engine
            .run_turn(submission("t-1"))
            .await
            .expect("first run");
        assert!(!harness.engine.is_streaming(&ThreadId::new("t-1")));
    }
}
