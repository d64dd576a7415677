pub mod batcher;
pub mod config;
pub mod engine;
pub mod error;
pub mod observer;
pub mod request;
pub mod session;
pub mod store;
pub mod transport;
pub mod turn;

pub use batcher::{ContentBatcher, FLUSH_INTERVAL, FLUSH_THRESHOLD_CHARS};
pub use config::EngineConfig;
pub use engine::{StreamEngine, TurnOutcome, TurnSubmission};
pub use error::{EngineError, EngineResult};
pub use observer::{ChannelObserver, NullObserver, ObserverEvent, TurnObserver};
pub use request::{ChatMessage, ChatRequest, ChatRole, FileRef};
pub use session::SessionRegistry;
pub use store::{ErrorTurn, PersistedIds, PersistedTurn, StoreError, StoreResult, TurnStore};
pub use transport::{BoxFuture, ByteStream, CancelHandle, CancelSignal, HttpTransport, Transport};
pub use turn::{
    GeneratedImage, LocalMessageId, ServerMessageId, ThreadId, Turn, TurnLifecycle, TurnStats,
    TurnTransition, TurnTransitionRejection,
};
