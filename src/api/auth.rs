//! Hashed access tokens.
//!
//! Every capability has its own list of argon2 PHC hashes. A presented token
//! is accepted when it verifies against any of them.

use std::collections::HashMap;
use std::fmt;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::error;

use crate::config::TokenConfig;

/// Random bytes in a generated token.
const TOKEN_BYTES: usize = 32;

/// An operation guarded by its own token list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    SendSms,
    SendUssd,
    GetHealthState,
    GetStats,
    /// Inbound fetch for one slot
    FetchSms(String),
}

impl Capability {
    /// Name used in logs and metrics. Never includes the slot.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SendSms => "send_sms",
            Self::SendUssd => "send_ussd",
            Self::GetHealthState => "get_health_state",
            Self::GetStats => "get_stats",
            Self::FetchSms(_) => "fetch_sms",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FetchSms(slot) => write!(f, "fetch_sms.{slot}"),
            other => f.write_str(other.name()),
        }
    }
}

/// PHC hashes accepted for one capability.
#[derive(Debug, Clone, Default)]
pub struct TokenSet {
    hashes: Vec<String>,
}

impl TokenSet {
    pub fn new(hashes: &[String]) -> Self {
        Self {
            hashes: hashes.to_vec(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Check `token` against every hash.
    pub fn verify(&self, token: &str) -> bool {
        let argon2 = Argon2::default();
        self.hashes.iter().any(|hash| match PasswordHash::new(hash) {
            Ok(parsed) => argon2.verify_password(token.as_bytes(), &parsed).is_ok(),
            Err(e) => {
                error!(error = %e, "unparsable token hash");
                false
            }
        })
    }
}

/// Token sets of all capabilities.
#[derive(Debug, Clone, Default)]
pub struct AccessControl {
    send_sms: TokenSet,
    send_ussd: TokenSet,
    get_health_state: TokenSet,
    get_stats: TokenSet,
    fetch_sms: HashMap<String, TokenSet>,
}

impl AccessControl {
    pub fn new(tokens: &TokenConfig) -> Self {
        Self {
            send_sms: TokenSet::new(&tokens.send_sms),
            send_ussd: TokenSet::new(&tokens.send_ussd),
            get_health_state: TokenSet::new(&tokens.get_health_state),
            get_stats: TokenSet::new(&tokens.get_stats),
            fetch_sms: tokens
                .fetch_sms
                .iter()
                .map(|(slot, hashes)| (slot.clone(), TokenSet::new(hashes)))
                .collect(),
        }
    }

    pub fn tokens(&self, capability: &Capability) -> Option<&TokenSet> {
        match capability {
            Capability::SendSms => Some(&self.send_sms),
            Capability::SendUssd => Some(&self.send_ussd),
            Capability::GetHealthState => Some(&self.get_health_state),
            Capability::GetStats => Some(&self.get_stats),
            Capability::FetchSms(slot) => self.fetch_sms.get(slot),
        }
    }

    /// Whether `token` grants `capability`. A capability without tokens
    /// grants nothing.
    pub fn allows(&self, capability: &Capability, token: &str) -> bool {
        self.tokens(capability).is_some_and(|set| set.verify(token))
    }
}

/// Hash `token` into a PHC string for the configuration.
pub fn hash_token(token: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default().hash_password(token.as_bytes(), &salt)?.to_string())
}

/// A new random token, URL-safe base64 without padding.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
