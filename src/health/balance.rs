//! Prepaid balance extraction and classification.

use regex::Regex;
use serde::Serialize;

/// Result of a balance check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BalanceStatus {
    Ok,
    Warning,
    Critical,
    /// Query failed or the answer could not be parsed
    Unknown,
}

/// Classify `value` against the thresholds.
///
/// Both thresholds at zero disable classification.
pub fn classify(value: f64, warning: f64, critical: f64) -> BalanceStatus {
    if warning == 0.0 && critical == 0.0 {
        return BalanceStatus::Ok;
    }
    if value <= critical {
        BalanceStatus::Critical
    } else if value <= warning {
        BalanceStatus::Warning
    } else {
        BalanceStatus::Ok
    }
}

/// Pull the balance out of a USSD answer.
///
/// Uses capture group 1 when the pattern has one, the whole match otherwise.
/// A comma is read as decimal separator.
pub fn extract_balance(text: &str, pattern: &Regex) -> Option<f64> {
    let captures = pattern.captures(text)?;
    let raw = captures.get(1).or_else(|| captures.get(0))?.as_str();
    raw.trim().replace(',', ".").parse().ok()
}
