mod api;
mod local;

pub use api::InboundFrame;
pub use api::RemoteHandle;
pub use api::Transport;
pub use api::TransportError;
pub use local::LocalNetwork;
pub use local::LocalTransport;
