//! wsstory common library
//!
//! Wire protocol types and the transports used to reach a backend that speaks
//! the JSON request/response protocol.

pub mod error;
pub mod protocol;
pub mod transport;

pub use error::{Error, Result};
pub use protocol::{Greeting, Request, RequestState, Response, StateType, Verb};
pub use transport::{
    channel_pair, ChannelTransport, Connector, LineTransport, TcpConnector, Transport, WsConnector, WsTransport,
};

/// wsstory version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
