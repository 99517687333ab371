//! Port discovery.
//!
//! Device nodes of USB modems move around across replugs and reboots. The
//! prober expands a slot's port pattern, asks each candidate for its IMEI
//! and attaches to the one that matches.

mod candidates;
mod claims;
mod hints;
mod prober;

pub use candidates::candidates;
pub use claims::{ClaimGuard, PortClaims};
pub use hints::PortHints;
pub use prober::{ProbeError, ProbedDevice, PortProber};
