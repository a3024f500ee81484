//! Point-to-point session layer
//!
//! The engine only sees `SessionHandoff` and its handles; media capture and
//! link transport sit behind traits.

pub mod handoff;
pub mod local;
pub mod media;
pub mod transport;

pub use handoff::{SessionEvent, SessionHandle, SessionHandoff, SessionUpdate};
pub use local::{LocalSessionEndpoint, LocalSessionHub};
pub use media::{LocalMedia, MediaSource, StaticTracks, SyntheticMediaSource, TrackControl};
pub use transport::{Link, LinkControl, LinkEvent, LinkKind, SessionRequest, SessionTransport};
