//! The proxy entity and everything needed to speak to one directly: its
//! live state (`record`), the raw transport (`transport`), and the six
//! protocol handshakes (`negotiator`).

pub mod negotiator;
pub mod record;
pub mod transport;

pub use negotiator::NegotiatorKind;
pub use record::{AnonymityLevel, GeoData, JudgeScheme, Proxy, ProtocolTag};
pub use transport::Transport;
