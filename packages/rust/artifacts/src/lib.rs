//! Destination side of the lanes: the object store and the files written to it.

mod export;
mod store;

pub use export::{
    CSV_CONTENT_TYPE, JSON_CONTENT_TYPE, MANIFEST_FILE, NORMALIZED_FILE, TOKEN_USAGE_FILE,
    encode_normalized, encode_token_usage, export_key, manifest,
};
pub use store::{LocalObjectStore, ObjectMeta, ObjectStore, content_etag};
