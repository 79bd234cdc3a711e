/// IRC protocol support: the wire message type and the line codec.
pub mod codec;
pub mod message;

pub use codec::{CodecError, IrcCodec};
pub use message::{Message, ParseError};
