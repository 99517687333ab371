//! Slot selection for outbound SMS.

use std::cmp::Ordering;

use thiserror::Error;
use tracing::{debug, trace};

use crate::config::ModemSlot;

/// Routing entry for one enabled slot.
#[derive(Debug, Clone)]
pub struct Route {
    /// Slot identifier
    pub slot: String,
    /// Destination prefixes in E.123 form
    pub prefixes: Vec<String>,
    /// Cost per SMS, currency-less
    pub cost: f64,
}

impl Route {
    /// Length of the longest prefix of this route matching `destination`
    fn match_len(&self, destination: &str) -> Option<usize> {
        self.prefixes
            .iter()
            .filter(|prefix| destination.starts_with(prefix.as_str()))
            .map(String::len)
            .max()
    }
}

/// Routing failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouteError {
    /// No configured prefix covers the destination
    #[error("no route to destination")]
    NoRoute,

    /// Prefixes match, but none of the matching slots is ready
    #[error("no modem available for destination")]
    Unavailable,
}

/// Static routing table built from the slot configuration.
///
/// Selection is a pure function of the table, the destination and the set
/// of ready slots.
#[derive(Debug, Clone, Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    /// Create a router from explicit routes
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    /// Build the routing table from enabled slots
    pub fn from_slots(slots: &[ModemSlot]) -> Self {
        let routes = slots
            .iter()
            .filter(|slot| slot.enabled)
            .map(|slot| Route {
                slot: slot.id.clone(),
                prefixes: slot.prefixes.clone(),
                cost: slot.cost_per_sms,
            })
            .collect();

        Self::new(routes)
    }

    /// Number of routes
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Check if the table is empty
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Whether any route covers `destination`, regardless of readiness
    pub fn is_routable(&self, destination: &str) -> bool {
        self.routes.iter().any(|r| r.match_len(destination).is_some())
    }

    /// Select the slot for `destination`.
    ///
    /// Only routes for which `is_ready` returns true take part. Among those,
    /// the longest matching prefix wins, then the lowest cost, then the
    /// lowest slot identifier.
    pub fn select<F>(&self, destination: &str, is_ready: F) -> Result<&str, RouteError>
    where
        F: Fn(&str) -> bool,
    {
        let mut best: Option<(&Route, usize)> = None;

        for route in &self.routes {
            let Some(len) = route.match_len(destination) else {
                continue;
            };

            if !is_ready(&route.slot) {
                trace!(slot = %route.slot, "route matches but slot is not ready");
                continue;
            }

            let better = match best {
                None => true,
                Some((current, current_len)) => rank(route, len, current, current_len) == Ordering::Less,
            };
            if better {
                best = Some((route, len));
            }
        }

        match best {
            Some((route, len)) => {
                debug!(slot = %route.slot, prefix_len = len, cost = route.cost, "route selected");
                Ok(route.slot.as_str())
            }
            None if self.is_routable(destination) => Err(RouteError::Unavailable),
            None => Err(RouteError::NoRoute),
        }
    }
}

/// Order candidates: longer prefix first, then cheaper, then lower slot id
fn rank(a: &Route, a_len: usize, b: &Route, b_len: usize) -> Ordering {
    b_len
        .cmp(&a_len)
        .then_with(|| a.cost.total_cmp(&b.cost))
        .then_with(|| a.slot.cmp(&b.slot))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(slot: &str, prefixes: &[&str], cost: f64) -> Route {
        Route {
            slot: slot.to_string(),
            prefixes: prefixes.iter().map(|p| p.to_string()).collect(),
            cost,
        }
    }

    fn example_router() -> Router {
        Router::new(vec![
            route("00", &["+49176", "+49"], 0.09),
            route("01", &["+49"], 0.05),
        ])
    }

    #[test]
    fn test_longest_prefix_beats_cost() {
        let router = example_router();
        assert_eq!(router.select("+491761234567", |_| true), Ok("00"));
    }

    #[test]
    fn test_cost_breaks_prefix_tie() {
        let router = example_router();
        assert_eq!(router.select("+4930000000", |_| true), Ok("01"));
    }

    #[test]
    fn test_slot_id_breaks_cost_tie() {
        let router = Router::new(vec![
            route("07", &["+43"], 0.05),
            route("03", &["+43"], 0.05),
            route("05", &["+43"], 0.05),
        ]);
        assert_eq!(router.select("+436601234567", |_| true), Ok("03"));
    }

    #[test]
    fn test_no_route_outside_prefixes() {
        let router = example_router();
        assert_eq!(router.select("+4412345678", |_| true), Err(RouteError::NoRoute));
        assert!(!router.is_routable("+4412345678"));
    }

    #[test]
    fn test_unready_slots_are_skipped() {
        let router = example_router();
        assert_eq!(router.select("+491761234567", |slot| slot != "00"), Ok("01"));
        assert_eq!(router.select("+491761234567", |_| false), Err(RouteError::Unavailable));
    }

    #[test]
    fn test_selection_is_order_independent() {
        let forward = example_router();
        let mut routes = forward.routes.clone();
        routes.reverse();
        let backward = Router::new(routes);

        for destination in ["+491761234567", "+4930000000", "+49176", "+4917"] {
            assert_eq!(
                forward.select(destination, |_| true),
                backward.select(destination, |_| true),
                "destination {destination}"
            );
        }
    }

    #[test]
    fn test_from_slots_skips_disabled() {
        let yaml = r#"
modems:
  - id: "00"
    port: /dev/ttyUSB0
    phone_number: "+491761234567"
    prefixes: "+49"
  - id: "01"
    enabled: false
    port: /dev/ttyUSB1
    phone_number: "+491761234568"
    prefixes: "+49"
"#;
        let config = crate::config::Config::from_yaml(yaml).unwrap();
        let router = Router::from_slots(&config.modems);

        assert_eq!(router.len(), 1);
        assert_eq!(router.select("+4930000000", |_| true), Ok("00"));
    }
}
