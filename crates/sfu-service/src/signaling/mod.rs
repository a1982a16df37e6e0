//! Signaling protocol over WebSocket.
//!
//! | Method | Data in | Data out |
//! |--------|---------|----------|
//! | `createSource` | `{name, originUrl}` | `null` |
//! | `getRouterRtpCapabilities` | none | router RTP capabilities |
//! | `createConsumerTransport` | none | `{id, iceParameters, iceCandidates, dtlsParameters}` |
//! | `connectConsumerTransport` | `{transportId, dtlsParameters}` | `null` |
//! | `consume` | `{source, transportId, rtpCapabilities}` | `{producerId, id, kind, rtpParameters, type, producerPaused}` |
//! | `resume` | `{consumerId}` | `null` |
//!
//! Closing the socket disconnects the peer.

pub mod handler;
pub mod protocol;
pub mod server;

pub use handler::{SignalingContext, SignalingHandler};
pub use protocol::{Method, ReplyFrame, RequestFrame};
pub use server::SignalingServer;
