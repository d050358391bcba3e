pub mod config;
pub mod error;
pub mod route;
pub mod router;
pub mod upstream;

pub use config::GatewayConfig;
pub use error::GatewayError;
pub use route::{Route, RouteConfig};
pub use router::{RouteMatch, Router};
pub use upstream::{ServerConfig, UpstreamConfig};
