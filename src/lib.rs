//! SMS and USSD gateway for a pool of cellular modems.
//!
//! Each configured slot binds one modem and SIM card. The pool identifies
//! modems behind unstable serial paths, keeps one session per modem, routes
//! outbound SMS by destination prefix and cost, monitors registration and
//! prepaid balance, and forwards received SMS by mail. A token-gated HTTP
//! API exposes all of it.

pub mod api;
pub mod bootstrap;
pub mod config;
pub mod forwarder;
pub mod health;
pub mod modem;
pub mod pool;
pub mod prober;
pub mod router;
pub mod store;
pub mod telemetry;
