//! Built-in middlewares. Each file is one concern; `register_all` wires
//! them into a registry with their injected collaborators.

pub mod auth;
pub mod compression;
pub mod cors;
pub mod headers;
pub mod logging;
pub mod rate_limit;

use auth::{AuthMiddleware, CredentialValidator};
use std::sync::Arc;
use torii_middleware::MiddlewareRegistry;
use torii_observability::Metrics;

pub fn register_all(
    registry: &mut MiddlewareRegistry,
    validator: Arc<dyn CredentialValidator>,
    metrics: Arc<Metrics>,
) {
    registry.register(Arc::new(cors::CorsMiddleware));
    registry.register(Arc::new(AuthMiddleware::new(validator)));
    registry.register(Arc::new(rate_limit::RateLimitMiddleware::new(metrics)));
    registry.register(Arc::new(headers::HeaderTransformMiddleware));
    registry.register(Arc::new(compression::CompressionMiddleware));
    registry.register(Arc::new(logging::LoggingMiddleware));
}
