//! Regional broadcast channel
//!
//! Record format, the transport seam with its AMQP and in-process backends,
//! and the reconnecting client the engine talks to.

pub mod amqp;
pub mod client;
pub mod local;
pub mod messages;
pub mod transport;

pub use amqp::{AmqpBroadcastTransport, AmqpConfig};
pub use client::{BroadcastClient, ClientEvent, ReconnectPolicy};
pub use local::LocalBroadcastHub;
pub use messages::{ChannelMessage, MessageUtils};
pub use transport::{BroadcastLink, BroadcastTransport, TransportConnection, TransportFrame};
