pub mod client;
pub mod codec;
pub mod errors;
pub mod rpc;

// Primary re-exports
pub use client::Client;
pub use codec::{MESSAGE_SIZE_MAX, decode_frame, encode_frame};
pub use errors::ProtoError;
pub use rpc::RpcMessage;

// The value model frames are built from.
pub use rmpv::Value;
