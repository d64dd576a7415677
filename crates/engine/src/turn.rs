use std::fmt;
use std::time::Duration;

use uuid::Uuid;

use rill_protocol::GroundingSource;

use crate::request::FileRef;

/// Opaque conversation identifier owned by the external store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(String);

impl ThreadId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Client-minted identifier for the not-yet-persisted assistant message.
///
/// Lives in the UUID namespace so it can never collide with a server-assigned
/// message id; reconciliation replaces it outright instead of merging the two
/// records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalMessageId(pub Uuid);

impl LocalMessageId {
    pub fn new_v7() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for LocalMessageId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Identifier assigned by the server once a metadata frame reports it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerMessageId(String);

impl ServerMessageId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerMessageId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Image reference produced mid-stream by an image generation turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub url: String,
}

/// Diagnostic counters for one turn; never persisted as truth.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnStats {
    pub chunk_count: u64,
    pub byte_count: u64,
    pub time_to_first_byte: Option<Duration>,
}

/// Lifecycle for one request/response exchange.
///
/// `Optimistic` exists before any network I/O; the three terminal states are
/// immutable once entered and a turn reaches exactly one of them.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TurnLifecycle {
    #[default]
    Optimistic,
    Streaming,
    Finalized,
    Stopped,
    Errored {
        message: String,
    },
}

impl TurnLifecycle {
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized | Self::Stopped | Self::Errored { .. })
    }

    /// Applies one transition deterministically.
    ///
    /// `Fail` is additionally legal from `Optimistic` because the transport
    /// can refuse the request before streaming ever starts.
    pub fn apply(&self, transition: TurnTransition) -> TurnTransitionResult {
        match transition {
            TurnTransition::StartStreaming => match self {
                Self::Optimistic => Ok(Self::Streaming),
                _ => Err(TurnTransitionRejection::NotOptimistic {
                    state: self.clone(),
                }),
            },
            TurnTransition::Finalize => match self {
                Self::Streaming => Ok(Self::Finalized),
                _ => Err(TurnTransitionRejection::NotStreaming {
                    state: self.clone(),
                }),
            },
            TurnTransition::Stop => match self {
                Self::Streaming => Ok(Self::Stopped),
                _ => Err(TurnTransitionRejection::NotStreaming {
                    state: self.clone(),
                }),
            },
            TurnTransition::Fail { message } => match self {
                Self::Optimistic | Self::Streaming => Ok(Self::Errored { message }),
                _ => Err(TurnTransitionRejection::NotStreaming {
                    state: self.clone(),
                }),
            },
        }
    }
}

/// State transition input for the turn lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnTransition {
    StartStreaming,
    Finalize,
    Stop,
    Fail { message: String },
}

/// Rejection reason for illegal lifecycle transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnTransitionRejection {
    NotOptimistic { state: TurnLifecycle },
    NotStreaming { state: TurnLifecycle },
}

pub type TurnTransitionResult = Result<TurnLifecycle, TurnTransitionRejection>;

/// One request/response exchange for a thread.
#[derive(Debug, Clone)]
pub struct Turn {
    pub thread_id: ThreadId,
    pub local_message_id: LocalMessageId,
    pub server_message_id: Option<ServerMessageId>,
    pub accumulated_content: String,
    pub grounded: bool,
    pub grounding_sources: Vec<GroundingSource>,
    pub generated_image: Option<GeneratedImage>,
    pub model: String,
    pub attachments: Vec<FileRef>,
    pub lifecycle: TurnLifecycle,
    pub stats: TurnStats,
}

impl Turn {
    /// Created synchronously on user submission, before any network I/O.
    pub fn new(thread_id: ThreadId, model: impl Into<String>, attachments: Vec<FileRef>) -> Self {
        Self {
            thread_id,
            local_message_id: LocalMessageId::new_v7(),
            server_message_id: None,
            accumulated_content: String::new(),
            grounded: false,
            grounding_sources: Vec::new(),
            generated_image: None,
            model: model.into(),
            attachments,
            lifecycle: TurnLifecycle::Optimistic,
            stats: TurnStats::default(),
        }
    }

    /// Applies a deterministic lifecycle transition.
    pub fn apply_transition(&mut self, transition: TurnTransition) -> TurnTransitionResult {
        let next = self.lifecycle.apply(transition)?;
        self.lifecycle = next.clone();
        Ok(next)
    }

    /// Appends one flushed content chunk; legal only while streaming so the
    /// reconstruction stays monotonically append-only.
    pub fn append_content(&mut self, chunk: &str) -> Result<(), TurnTransitionRejection> {
        if !self.lifecycle.is_streaming() {
            return Err(TurnTransitionRejection::NotStreaming {
                state: self.lifecycle.clone(),
            });
        }
        self.accumulated_content.push_str(chunk);
        Ok(())
    }

    pub fn set_server_message_id(&mut self, id: ServerMessageId) {
        self.server_message_id = Some(id);
    }

    /// Records grounding sources. The first grounding frame wins; a repeat is
    /// reported back as `false` so the caller can log it.
    pub fn set_grounding(&mut self, sources: Vec<GroundingSource>) -> bool {
        if self.grounded {
            return false;
        }
        self.grounded = true;
        self.grounding_sources = sources;
        true
    }

    /// Records the generated image, at most once per turn.
    pub fn set_generated_image(&mut self, image: GeneratedImage) -> bool {
        if self.generated_image.is_some() {
            return false;
        }
        self.generated_image = Some(image);
        true
    }

    /// Replaces in-progress content with a terminal error annotation so the
    /// message renders immediately instead of looking like a loading turn.
    pub fn replace_content_with_error(&mut self, message: &str) {
        self.accumulated_content = message.to_string();
    }
}
