mod codec;
mod http_model;
mod jwt;
mod message;

pub use codec::{
    read_envelope, write_envelope, WireError, DEFAULT_MAX_FRAME_BYTES, MESSAGE_CHUNK_SIZE,
};
pub use http_model::{HttpRequestInfo, HttpResponseInfo};
pub use jwt::decode_bearer_claims;
pub use message::{
    Command, CommandRequest, CommandResponse, Envelope, MessageKind, PayloadError,
    STATUS_INTERNAL_ERROR, STATUS_NOT_FOUND, STATUS_NO_CONTENT, STATUS_OK,
};
