use snafu::ResultExt;

use crate::error::{PayloadJsonSnafu, PayloadStructureSnafu, ProtocolResult, UnknownTagSnafu};
use crate::frame::{DoneFrame, Frame, MetadataFrame};

pub const METADATA_TAG: &str = "f:";
pub const CONTENT_TAG: &str = "0:";
pub const DONE_TAG: &str = "d:";

/// Parses one complete line into a typed frame.
///
/// Any failure here is fatal for the whole turn: a single malformed frame can
/// desynchronize the line boundary for everything that follows, so the stream
/// must not be trusted to self-heal. The offending line rides along in the
/// error for diagnostics.
pub fn parse_frame(line: &str) -> ProtocolResult<Frame> {
    if let Some(payload) = line.strip_prefix(METADATA_TAG) {
        let payload = check_structure(line, payload, METADATA_TAG, '{', '}')?;
        let metadata: MetadataFrame = serde_json::from_str(payload).context(PayloadJsonSnafu {
            stage: "parse-metadata-payload",
            tag: METADATA_TAG,
            line: line.to_string(),
        })?;
        return Ok(Frame::Metadata(metadata));
    }

    if let Some(payload) = line.strip_prefix(CONTENT_TAG) {
        let payload = check_structure(line, payload, CONTENT_TAG, '"', '"')?;
        let content: String = serde_json::from_str(payload).context(PayloadJsonSnafu {
            stage: "parse-content-payload",
            tag: CONTENT_TAG,
            line: line.to_string(),
        })?;
        return Ok(Frame::Content(content));
    }

    if let Some(payload) = line.strip_prefix(DONE_TAG) {
        let payload = check_structure(line, payload, DONE_TAG, '{', '}')?;
        let done: DoneFrame = serde_json::from_str(payload).context(PayloadJsonSnafu {
            stage: "parse-done-payload",
            tag: DONE_TAG,
            line: line.to_string(),
        })?;
        return Ok(Frame::Done(done));
    }

    UnknownTagSnafu {
        stage: "parse-frame-tag",
        line: line.to_string(),
    }
    .fail()
}

// Cheap structural gate before the JSON parser runs: the trimmed payload must
// open and close with the bracket/quote its tag demands.
fn check_structure<'a>(
    line: &str,
    payload: &'a str,
    tag: &'static str,
    open: char,
    close: char,
) -> ProtocolResult<&'a str> {
    let trimmed = payload.trim();
    if trimmed.len() >= 2 && trimmed.starts_with(open) && trimmed.ends_with(close) {
        Ok(trimmed)
    } else {
        PayloadStructureSnafu {
            stage: "check-payload-structure",
            tag,
            line: line.to_string(),
        }
        .fail()
    }
}
