//! Memory-resident HTTP response cache.
//!
//! Entries are keyed by a canonical fingerprint (method + URL + the
//! request's values of the response's `vary` headers). One index lock
//! guards the primary map, the tag index, the eviction ordering and the
//! byte budget; concurrent misses on one fingerprint collapse to a single
//! origin fetch via the `flight` coordinator.

pub mod entry;
pub mod fingerprint;
pub mod flight;
pub mod store;

pub use entry::StoredResponse;
pub use fingerprint::Fingerprint;
pub use flight::{FlightGuard, FlightResult, FlightRole};
pub use store::{CacheKey, CacheSettings, HttpCache, Lookup};
