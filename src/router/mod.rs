//! Outbound SMS routing.
//!
//! A single fixed policy: the longest matching destination prefix wins,
//! then the lowest cost per SMS, then the lowest slot identifier. The
//! prefix lists double as an allow-list of reachable numbers.

mod number;
mod router;

pub use number::normalize_number;
pub use router::{Route, RouteError, Router};
