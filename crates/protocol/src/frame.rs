use serde::Deserialize;

/// One citation record attached to a grounded answer.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroundingSource {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// Grounding block carried by a metadata frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Grounding {
    pub sources: Vec<GroundingSource>,
}

/// Payload of an `f:` frame.
///
/// Every key is optional and independently settable; the server may send
/// several metadata frames per turn, each updating a different field.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataFrame {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub grounding: Option<Grounding>,
    #[serde(default)]
    pub image_generated: Option<bool>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub image_error: Option<String>,
}

/// Payload of a `d:` frame signalling normal completion.
///
/// `message` is fallback display copy for image-only turns that streamed no
/// text content.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct DoneFrame {
    #[serde(default)]
    pub length: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
}

/// One decoded protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Metadata(MetadataFrame),
    Content(String),
    Done(DoneFrame),
}
