use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProtocolError {
    #[snafu(display("frame line is not valid UTF-8"))]
    LineEncoding {
        stage: &'static str,
        source: std::str::Utf8Error,
    },
    #[snafu(display("frame line does not start with a known tag: {line}"))]
    UnknownTag { stage: &'static str, line: String },
    #[snafu(display("`{tag}` payload failed the structural check: {line}"))]
    PayloadStructure {
        stage: &'static str,
        tag: &'static str,
        line: String,
    },
    #[snafu(display("`{tag}` payload is not valid JSON ({source}): {line}"))]
    PayloadJson {
        stage: &'static str,
        tag: &'static str,
        line: String,
        source: serde_json::Error,
    },
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
