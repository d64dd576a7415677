use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    #[snafu(display("failed to reach the chat endpoint on `{stage}`: {source}"))]
    TransportConnect {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("chat endpoint returned status {status}: {body}"))]
    TransportStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("response stream read failed: {source}"))]
    TransportRead {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("response stream could not be decoded: {source}"))]
    Protocol {
        stage: &'static str,
        source: rill_protocol::ProtocolError,
    },
    #[snafu(display("a turn is already streaming for thread '{thread_id}'"))]
    TurnAlreadyStreaming {
        stage: &'static str,
        thread_id: String,
    },
    #[snafu(display("no streaming turn to stop for thread '{thread_id}'"))]
    TurnNotStreaming {
        stage: &'static str,
        thread_id: String,
    },
}

pub type EngineResult<T> = Result<T, EngineError>;
