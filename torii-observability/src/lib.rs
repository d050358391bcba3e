pub mod access;
pub mod metrics;

pub use access::AccessRecord;
pub use metrics::Metrics;
