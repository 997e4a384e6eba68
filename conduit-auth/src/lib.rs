//! Virtual-key service: authentication, model authorization, RPM/RPD
//! limits, and the single-writer budget ledger per group.

pub mod ledger;
pub mod limiter;
pub mod service;

pub use ledger::{GroupLedger, ReservationHandle, STALE_RESERVATION_TTL};
pub use limiter::RateLimiter;
pub use service::{VirtualKeyService, hash_token};
