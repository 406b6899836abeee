//! Host-to-host transport abstraction and worker-group collectives.

pub mod flow;
pub mod transport;

pub use flow::{FlowControlChannel, FlowControlManager, ReduceOrder};
pub use transport::{build_mesh, MeshTransport, Transport};
