pub mod decoder;
pub mod error;
pub mod frame;
pub mod parser;

pub use decoder::LineDecoder;
pub use error::{ProtocolError, ProtocolResult};
pub use frame::{DoneFrame, Frame, Grounding, GroundingSource, MetadataFrame};
pub use parser::{CONTENT_TAG, DONE_TAG, METADATA_TAG, parse_frame};
