//! Transaction protocol between the server and its clients.
//!
//! One TLS connection per client. Either side may start a transaction at any
//! time; the RTS/CTS handshake decides who talks first when both try at once.

/// Framing of envelopes on the byte stream.
pub mod codec;

/// Wire envelope and message types.
pub mod envelope;

/// TCP and TLS transports.
pub mod transport;

/// The RTS/CTS transaction channel.
pub mod channel;

pub use channel::{ChannelConfig, InboundRequest, TransactionChannel};
pub use codec::{FrameReader, MAX_FRAME_SIZE};
pub use envelope::{ControlPayload, Envelope, MessageType, ResponseResult};
pub use transport::{accept_tls, load_server_config, Transport};
