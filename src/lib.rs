//! Aggregating gateway that fronts many Model Context Protocol servers
//! behind a small set of category meta-tools.

pub mod batch;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod retry;
pub mod server;
pub mod transport;
pub mod upstream;

pub use config::GatewayConfig;
pub use dispatcher::{BridgeResult, Dispatcher, OperationRequest};
pub use error::{ConfigError, DispatchError, ErrorCode, UpstreamError};
pub use registry::{Category, OperationMapping, UpstreamName};
pub use upstream::{UpstreamClient, UpstreamDescriptor};
