//! HTTP control plane served to simulators.
//!
//! One server instance runs per simulator, bound to an ephemeral port;
//! its base URL reaches the simulator as `HIVE_SIMULATOR`. Responses are
//! plain text for primitive results (ids, addresses, enode URLs) and JSON
//! for structured replies. Client errors map to 4xx without mutating any
//! state, backend errors to 5xx after rollback.

pub mod routes;
pub mod server;
pub mod types;

pub use server::ControlServer;
pub use types::RunContext;
