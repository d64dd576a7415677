use std::env;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use snafu::{OptionExt, Snafu};

use rill_engine::{
    BoxFuture, ByteStream, ChannelObserver, ChatMessage, ChatRequest, ChatRole, EngineResult,
    ErrorTurn, PersistedIds, PersistedTurn, ServerMessageId, StoreResult, StreamEngine, ThreadId,
    Transport, TurnLifecycle, TurnOutcome, TurnStore, TurnSubmission,
};

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    PrepNoop,
    HappyPath,
    StopPartial,
    UpstreamError,
    SplitChunks,
    ImageFallback,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "prep_noop" => Some(Self::PrepNoop),
            "happy_path" => Some(Self::HappyPath),
            "stop_partial" => Some(Self::StopPartial),
            "upstream_error" => Some(Self::UpstreamError),
            "split_chunks" => Some(Self::SplitChunks),
            "image_fallback" => Some(Self::ImageFallback),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::PrepNoop => "prep_noop",
            Self::HappyPath => "happy_path",
            Self::StopPartial => "stop_partial",
            Self::UpstreamError => "upstream_error",
            Self::SplitChunks => "split_chunks",
            Self::ImageFallback => "image_fallback",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt::init();

    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    println!("scenario={}", args.scenario.name());

    match args.scenario {
        Scenario::PrepNoop => run_prep_noop(),
        Scenario::HappyPath => run_happy_path().await,
        Scenario::StopPartial => run_stop_partial().await,
        Scenario::UpstreamError => run_upstream_error().await,
        Scenario::SplitChunks => run_split_chunks().await,
        Scenario::ImageFallback => run_image_fallback().await,
        Scenario::All => run_all().await,
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--scenario" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-scenario-value",
                    arg: "--scenario",
                })?;

                let parsed = Scenario::parse(&value).context(UnknownScenarioSnafu {
                    stage: "parse-args-scenario",
                    raw: value,
                })?;
                scenario = Some(parsed);
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.context(MissingScenarioSnafu {
            stage: "parse-args-scenario-required",
        })?,
    })
}

fn run_prep_noop() -> RunnerResult<()> {
    println!("prep_noop=true");
    println!("runner_ok=true");
    Ok(())
}

async fn run_all() -> RunnerResult<()> {
    run_prep_noop()?;
    run_happy_path().await?;
    run_stop_partial().await?;
    run_upstream_error().await?;
    run_split_chunks().await?;
    run_image_fallback().await?;

    println!("all_passed=true");
    Ok(())
}

async fn run_happy_path() -> RunnerResult<()> {
    let fixture = Fixture::scripted(vec![
        chunk(b"f:{\"messageId\":\"m1\"}\n"),
        chunk(b"0:\"Hel\"\n"),
        chunk(b"0:\"lo\"\n"),
        chunk(b"d:{\"length\":5}\n"),
    ]);

    let outcome = fixture.run(submission("qa-happy")).await?;
    let finalized = outcome.lifecycle == TurnLifecycle::Finalized;
    let content_ok = outcome.content == "Hello";
    let persisted_count = fixture.store.saved.lock().unwrap_or_else(|p| p.into_inner()).len();

    println!("finalized={finalized}");
    println!("content_ok={content_ok}");
    println!("persisted_count={persisted_count}");

    if !(finalized && content_ok && persisted_count == 1) {
        return ScenarioFailedSnafu {
            stage: "scenario-happy-path-assert",
            scenario: "happy_path",
            reason: format!(
                "expected one finalized persisted turn with content 'Hello', got lifecycle={:?} content={:?}",
                outcome.lifecycle, outcome.content
            ),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_stop_partial() -> RunnerResult<()> {
    let fixture = Fixture::scripted(vec![chunk(b"0:\"Par\"\n"), hang()]);

    let engine = fixture.engine.clone();
    let task = tokio::spawn(async move { engine.run_turn(submission("qa-stop")).await });

    // Wait for the first batched flush before firing the stop.
    tokio::time::sleep(Duration::from_millis(120)).await;
    let stop_accepted = fixture.engine.stop(&ThreadId::new("qa-stop")).is_ok();

    let outcome = task
        .await
        .map_err(|error| RunnerError::ScenarioFailed {
            stage: "scenario-stop-partial-join",
            scenario: "stop_partial",
            reason: error.to_string(),
        })?
        .map_err(|error| RunnerError::ScenarioFailed {
            stage: "scenario-stop-partial-run",
            scenario: "stop_partial",
            reason: error.to_string(),
        })?;

    let stopped = outcome.lifecycle == TurnLifecycle::Stopped;
    let partial_kept = outcome.content == "Par";

    println!("stop_accepted={stop_accepted}");
    println!("stopped={stopped}");
    println!("partial_kept={partial_kept}");
    println!("stopped_by_user={}", outcome.stopped_by_user);

    if !(stop_accepted && stopped && partial_kept && outcome.stopped_by_user) {
        return ScenarioFailedSnafu {
            stage: "scenario-stop-partial-assert",
            scenario: "stop_partial",
            reason: format!(
                "expected a stopped turn keeping partial content, got lifecycle={:?} content={:?}",
                outcome.lifecycle, outcome.content
            ),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_upstream_error() -> RunnerResult<()> {
    let fixture = Fixture::scripted(vec![
        chunk(b"0:\"partial\"\n"),
        chunk(b"f:{\"error\":\"rate limited\"}\n"),
    ]);

    let outcome = fixture.run(submission("qa-error")).await?;
    let errored = matches!(outcome.lifecycle, TurnLifecycle::Errored { .. });
    let message_verbatim = outcome.content == "rate limited";
    let error_recorded = fixture
        .store
        .errors
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .len()
        == 1;
    let not_persisted = fixture
        .store
        .saved
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .is_empty();

    println!("errored={errored}");
    println!("message_verbatim={message_verbatim}");
    println!("error_recorded={error_recorded}");
    println!("not_persisted={not_persisted}");

    if !(errored && message_verbatim && error_recorded && not_persisted) {
        return ScenarioFailedSnafu {
            stage: "scenario-upstream-error-assert",
            scenario: "upstream_error",
            reason: format!(
                "expected a verbatim errored turn, got lifecycle={:?} content={:?}",
                outcome.lifecycle, outcome.content
            ),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_split_chunks() -> RunnerResult<()> {
    let script: &[u8] = b"f:{\"messageId\":\"m1\"}\n0:\"Hel\"\n0:\"lo\"\nd:{\"length\":5}\n";
    let steps = script
        .iter()
        .map(|byte| Step::Chunk {
            bytes: Bytes::copy_from_slice(std::slice::from_ref(byte)),
        })
        .collect();
    let fixture = Fixture::scripted(steps);

    let outcome = fixture.run(submission("qa-split")).await?;
    let split_equivalent =
        outcome.lifecycle == TurnLifecycle::Finalized && outcome.content == "Hello";

    println!("split_equivalent={split_equivalent}");

    if !split_equivalent {
        return ScenarioFailedSnafu {
            stage: "scenario-split-chunks-assert",
            scenario: "split_chunks",
            reason: format!(
                "byte-at-a-time delivery changed the result: lifecycle={:?} content={:?}",
                outcome.lifecycle, outcome.content
            ),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_image_fallback() -> RunnerResult<()> {
    let fixture = Fixture::scripted(vec![
        chunk(b"f:{\"imageGenerated\":true,\"imageUrl\":\"https://img/qa\"}\n"),
        chunk(b"d:{\"message\":\"Generated an image\"}\n"),
    ]);

    let outcome = fixture.run(submission("qa-image")).await?;
    let image_set = outcome
        .generated_image
        .as_ref()
        .map(|image| image.url == "https://img/qa")
        .unwrap_or(false);
    let fallback_applied = outcome.content == "Generated an image";

    println!("image_set={image_set}");
    println!("fallback_applied={fallback_applied}");

    if !(image_set && fallback_applied && outcome.lifecycle == TurnLifecycle::Finalized) {
        return ScenarioFailedSnafu {
            stage: "scenario-image-fallback-assert",
            scenario: "image_fallback",
            reason: format!(
                "expected an image turn with fallback copy, got lifecycle={:?} content={:?}",
                outcome.lifecycle, outcome.content
            ),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
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

fn chunk(bytes: &'static [u8]) -> Step {
    Step::Chunk {
        bytes: Bytes::from_static(bytes),
    }
}

fn hang() -> Step {
    Step::Hang
}

#[derive(Debug, Clone)]
enum Step {
    Chunk { bytes: Bytes },
    Hang,
}

struct ScriptedTransport {
    steps: Vec<Step>,
}

impl Transport for ScriptedTransport {
    fn open<'a>(&'a self, _request: &'a ChatRequest) -> BoxFuture<'a, EngineResult<ByteStream>> {
        let steps = self.steps.clone();
        Box::pin(async move {
            let stream = futures::stream::iter(steps).then(|step| async move {
                match step {
                    Step::Chunk { bytes } => {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        Ok(bytes)
                    }
                    Step::Hang => std::future::pending().await,
                }
            });
            Ok(Box::pin(stream) as ByteStream)
        })
    }
}

#[derive(Default)]
struct MemoryStore {
    saved: Mutex<Vec<PersistedTurn>>,
    errors: Mutex<Vec<ErrorTurn>>,
}

impl TurnStore for MemoryStore {
    fn save_persisted_turn<'a>(
        &'a self,
        turn: &'a PersistedTurn,
    ) -> BoxFuture<'a, StoreResult<PersistedIds>> {
        Box::pin(async move {
            self.saved
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(turn.clone());
            Ok(PersistedIds {
                user_message_id: ServerMessageId::new("qa-user"),
                assistant_message_id: ServerMessageId::new("qa-assistant"),
            })
        })
    }

    fn save_error_turn<'a>(&'a self, turn: &'a ErrorTurn) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            self.errors
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(turn.clone());
            Ok(())
        })
    }

    fn link_attachments<'a>(
        &'a self,
        _file_ids: &'a [String],
        _message_id: &'a ServerMessageId,
        _thread_id: &'a ThreadId,
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move { Ok(()) })
    }

    fn update_thread_metadata<'a>(
        &'a self,
        _thread_id: &'a ThreadId,
        _last_model: &'a str,
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move { Ok(()) })
    }
}

struct Fixture {
    engine: Arc<StreamEngine>,
    store: Arc<MemoryStore>,
}

impl Fixture {
    fn scripted(steps: Vec<Step>) -> Self {
        let store = Arc::new(MemoryStore::default());
        let (observer, mut events) = ChannelObserver::pair();
        // Drain observer events so the unbounded channel never accumulates.
        tokio::spawn(async move { while events.recv().await.is_some() {} });

        let engine = Arc::new(StreamEngine::new(
            Arc::new(ScriptedTransport { steps }),
            store.clone(),
            Arc::new(observer),
        ));
        Self { engine, store }
    }

    async fn run(&self, submission: TurnSubmission) -> RunnerResult<TurnOutcome> {
        self.engine
            .run_turn(submission)
            .await
            .map_err(|error| RunnerError::ScenarioFailed {
                stage: "scenario-run-turn",
                scenario: "run",
                reason: error.to_string(),
            })
    }
}
