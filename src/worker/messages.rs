use serde::{Deserialize, Serialize};

use super::request::SharedFile;

/// Message posted from the page to the Request Interceptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    /// Claim the pending shared file. At most one caller receives it.
    GetSharedImage,
    /// Fetch `url` and store it in the Binary Cache.
    CacheBinary { url: String },
    /// Evict `url` from the Binary Cache.
    RemoveBinary { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerReply {
    SharedImage { file: SharedFile },
    NoSharedImage,
    /// The cache mutation was accepted; it completes in the background.
    Accepted,
    Rejected { reason: String },
}
