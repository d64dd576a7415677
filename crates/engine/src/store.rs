use serde_json::Value;
use snafu::Snafu;

use rill_protocol::GroundingSource;

use crate::request::FileRef;
use crate::transport::BoxFuture;
use crate::turn::{GeneratedImage, ServerMessageId, ThreadId};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(display("store operation {operation} failed at {stage}: {message}"))]
    Remote {
        stage: &'static str,
        operation: &'static str,
        message: String,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Completed turn as handed to the store for durable persistence.
#[derive(Debug, Clone)]
pub struct PersistedTurn {
    pub thread_id: ThreadId,
    pub user_content: String,
    pub assistant_content: String,
    pub model: String,
    pub attachments: Vec<FileRef>,
    pub grounded: bool,
    pub sources: Vec<GroundingSource>,
    pub image: Option<GeneratedImage>,
    pub stopped_by_user: bool,
}

/// Canonical ids assigned by the store, used to reconcile optimistic state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedIds {
    pub user_message_id: ServerMessageId,
    pub assistant_message_id: ServerMessageId,
}

/// Errored turn recorded for diagnostics rather than conversation history.
#[derive(Debug, Clone)]
pub struct ErrorTurn {
    pub thread_id: ThreadId,
    pub content: String,
    pub diagnostic: Value,
}

/// Persistence boundary for finished turns.
///
/// Every method is best-effort from the engine's perspective: a store failure
/// is logged and the turn still reaches its terminal state.
pub trait TurnStore: Send + Sync {
    /// Persists a finalized or stopped turn and returns the canonical ids.
    fn save_persisted_turn<'a>(
        &'a self,
        turn: &'a PersistedTurn,
    ) -> BoxFuture<'a, StoreResult<PersistedIds>>;

    /// Records an errored turn out-of-band.
    fn save_error_turn<'a>(&'a self, turn: &'a ErrorTurn) -> BoxFuture<'a, StoreResult<()>>;

    /// Associates uploaded files with the persisted assistant message.
    fn link_attachments<'a>(
        &'a self,
        file_ids: &'a [String],
        message_id: &'a ServerMessageId,
        thread_id: &'a ThreadId,
    ) -> BoxFuture<'a, StoreResult<()>>;

    /// Bumps thread bookkeeping after a completed turn.
    fn update_thread_metadata<'a>(
        &'a self,
        thread_id: &'a ThreadId,
        last_model: &'a str,
    ) -> BoxFuture<'a, StoreResult<()>>;
}
