//! Wire protocol: frame shapes and the codec between JSON text and them.

pub mod codec;
pub mod messages;

pub use codec::{
    decode, encode_error, encode_error_code, encode_event_push, encode_ping,
    encode_result, encode_session_revoked, encode_shutdown, encode_subscription_push,
    encode_welcome, DecodeError,
};
pub use messages::{ClientFrame, ClientRequest, PushChannel, ServerFrame, SystemEvent};
