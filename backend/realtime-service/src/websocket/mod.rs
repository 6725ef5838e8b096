pub mod messages;
pub mod registry;
pub mod session;

pub use messages::{InboundEnvelope, OutboundEnvelope};
pub use registry::{ConnectionRegistry, DeliveryReport, RegistryConfig};
pub use session::{CloseReason, Session, SessionId, SessionState, Transport};
