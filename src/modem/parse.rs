//! Parsers for AT responses and text encoding helpers.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};

use crate::config::Encoding;

/// Final result of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalResult {
    Ok,
    Error(String),
}

/// Classify a line as a final result code.
pub fn final_result(line: &str) -> Option<FinalResult> {
    match line {
        "OK" => Some(FinalResult::Ok),
        "ERROR" | "NO CARRIER" => Some(FinalResult::Error(line.to_string())),
        _ if line.starts_with("+CME ERROR") || line.starts_with("+CMS ERROR") => {
            Some(FinalResult::Error(line.to_string()))
        }
        _ => None,
    }
}

/// Lines the modem may send at any time.
pub fn is_unsolicited(line: &str) -> bool {
    const PREFIXES: [&str; 6] = ["+CMTI:", "+CDS:", "+CDSI:", "+CUSD:", "RING", "+CLIP:"];
    PREFIXES.iter().any(|p| line.starts_with(p))
}

/// `+CME ERROR: 16` / `incorrect password`
pub fn is_incorrect_password(error: &str) -> bool {
    let lower = error.to_ascii_lowercase();
    lower.ends_with(": 16") || lower.contains("incorrect password")
}

/// Split a comma separated parameter list, honouring double quotes.
pub fn split_params(params: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    for c in params.chars() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut current).trim().to_string()),
            _ => current.push(c),
        }
    }
    fields.push(current.trim().to_string());
    fields
}

/// Parameters after `+TAG:` if the line carries that tag
pub fn tagged<'a>(line: &'a str, tag: &str) -> Option<&'a str> {
    line.strip_prefix(tag)
        .and_then(|rest| rest.strip_prefix(':'))
        .map(str::trim)
}

/// SIM lock state from `+CPIN:`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinState {
    Ready,
    SimPin,
    Other(String),
}

pub fn parse_cpin(lines: &[String]) -> Option<PinState> {
    lines.iter().find_map(|line| {
        tagged(line, "+CPIN").map(|state| match state {
            "READY" => PinState::Ready,
            "SIM PIN" => PinState::SimPin,
            other => PinState::Other(other.to_string()),
        })
    })
}

/// IMEI from `AT+CGSN`; some modems prefix it with `+CGSN:`.
pub fn parse_imei(lines: &[String]) -> Option<String> {
    lines.iter().find_map(|line| {
        let value = tagged(line, "+CGSN").unwrap_or(line).trim_matches('"').trim();
        (!value.is_empty() && value.bytes().all(|b| b.is_ascii_digit())).then(|| value.to_string())
    })
}

/// Registration status from `+CREG: <n>,<stat>`: (registered, roaming)
pub fn parse_creg(lines: &[String]) -> Option<(bool, bool)> {
    lines.iter().find_map(|line| {
        let params = split_params(tagged(line, "+CREG")?);
        let stat: u8 = params.get(1)?.parse().ok()?;
        Some((stat == 1 || stat == 5, stat == 5))
    })
}

/// Operator name from `+COPS: <mode>,<format>,"<oper>"[,<act>]`
pub fn parse_cops(lines: &[String]) -> Option<String> {
    lines.iter().find_map(|line| {
        let params = split_params(tagged(line, "+COPS")?);
        params.get(2).filter(|name| !name.is_empty()).cloned()
    })
}

/// RSSI from `+CSQ: <rssi>,<ber>`; 99 means unknown.
pub fn parse_csq(lines: &[String]) -> Option<u8> {
    lines.iter().find_map(|line| {
        let params = split_params(tagged(line, "+CSQ")?);
        let rssi: u8 = params.first()?.parse().ok()?;
        (rssi != 99).then_some(rssi)
    })
}

/// Convert a `+CSQ` RSSI index to dBm
pub fn rssi_to_dbm(rssi: u8) -> i32 {
    match rssi {
        2..=30 => -109 + (i32::from(rssi) - 2) * 2,
        31..=98 => -51,
        _ => -113,
    }
}

/// Message reference from `+CMGS: <mr>`
pub fn parse_cmgs(lines: &[String]) -> Option<u8> {
    lines.iter().find_map(|line| tagged(line, "+CMGS")?.parse().ok())
}

/// Storage index from `+CMTI: "SM",<index>`
pub fn parse_cmti(line: &str) -> Option<u32> {
    let params = split_params(tagged(line, "+CMTI")?);
    params.get(1)?.parse().ok()
}

/// Status report `+CDS: <fo>,<mr>,[<ra>],[<tora>],<scts>,<dt>,<st>`:
/// (reference, delivered). `None` while the network is still trying.
pub fn parse_cds(line: &str) -> Option<(u8, Option<bool>)> {
    let params = split_params(tagged(line, "+CDS")?);
    let reference: u8 = params.get(1)?.parse().ok()?;
    let status: u8 = params.last()?.parse().ok()?;

    let outcome = match status {
        0..=0x1f => Some(true),
        0x20..=0x3f => None,
        _ => Some(false),
    };
    Some((reference, outcome))
}

/// A message read from SIM storage.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSms {
    pub index: Option<u32>,
    pub sender: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub body: String,
}

/// Parse `+CMGR:` (single message) or `+CMGL:` (listing) responses.
///
/// Each header line is followed by the message text, which may span
/// several lines.
pub fn parse_messages(lines: &[String], encoding: Encoding) -> Vec<StoredSms> {
    let mut messages = Vec::new();
    let mut current: Option<(StoredSms, Vec<&str>)> = None;

    for line in lines {
        let header = tagged(line, "+CMGL")
            .map(|p| (p, true))
            .or_else(|| tagged(line, "+CMGR").map(|p| (p, false)));

        match header {
            Some((params, listing)) => {
                if let Some(done) = current.take() {
                    messages.push(finish(done, encoding));
                }
                let fields = split_params(params);
                // +CMGL: <index>,<stat>,<oa>,[<alpha>],[<scts>]
                // +CMGR: <stat>,<oa>,[<alpha>],[<scts>]
                let offset = usize::from(listing);
                let index = if listing { fields.first().and_then(|i| i.parse().ok()) } else { None };
                let sender = fields.get(1 + offset).cloned().unwrap_or_default();
                let scts = fields.get(3 + offset).map(String::as_str).unwrap_or("");

                current = Some((
                    StoredSms {
                        index,
                        sender: decode_text(&sender, encoding),
                        timestamp: parse_scts(scts),
                        body: String::new(),
                    },
                    Vec::new(),
                ));
            }
            None => {
                if let Some((_, body)) = current.as_mut() {
                    body.push(line);
                }
            }
        }
    }

    if let Some(done) = current.take() {
        messages.push(finish(done, encoding));
    }
    messages
}

fn finish((mut sms, body): (StoredSms, Vec<&str>), encoding: Encoding) -> StoredSms {
    sms.body = decode_text(&body.join("\n"), encoding);
    sms
}

/// Service centre timestamp `yy/MM/dd,hh:mm:ss±zz` (zz in quarter hours).
pub fn parse_scts(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim_matches('"');
    if raw.len() < 17 || !raw.is_char_boundary(17) {
        return None;
    }
    let (datetime, zone) = raw.split_at(17);
    let naive = NaiveDateTime::parse_from_str(datetime, "%y/%m/%d,%H:%M:%S").ok()?;

    let quarters: i32 = zone.parse().unwrap_or(0);
    let offset = FixedOffset::east_opt(quarters * 15 * 60)?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

/// USSD result `+CUSD: <m>[,<str>,<dcs>]`: (status, text, dcs)
pub fn parse_cusd(line: &str) -> Option<(u8, Option<String>, Option<u8>)> {
    let params = split_params(tagged(line, "+CUSD")?);
    let status: u8 = params.first()?.parse().ok()?;
    let text = params.get(1).cloned();
    let dcs = params.get(2).and_then(|d| d.parse().ok());
    Some((status, text, dcs))
}

/// Hex encoded UTF-16BE, as used with `AT+CSCS="UCS2"`
pub fn ucs2_encode(text: &str) -> String {
    let bytes: Vec<u8> = text.encode_utf16().flat_map(u16::to_be_bytes).collect();
    hex::encode_upper(bytes)
}

/// Decode hex encoded UTF-16BE; `None` if the input is not UCS2 hex.
pub fn ucs2_decode(hex_text: &str) -> Option<String> {
    let bytes = hex::decode(hex_text.trim()).ok()?;
    if bytes.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).ok()
}

/// Text for the wire in the session's character set
pub fn encode_text(text: &str, encoding: Encoding) -> String {
    match encoding {
        Encoding::Gsm => text.to_string(),
        Encoding::Ucs2 => ucs2_encode(text),
    }
}

/// Text from the wire; falls back to the raw string if it is not valid UCS2.
pub fn decode_text(text: &str, encoding: Encoding) -> String {
    match encoding {
        Encoding::Gsm => fix_gsm_escapes(text),
        Encoding::Ucs2 => ucs2_decode(text).unwrap_or_else(|| text.to_string()),
    }
}

/// Map the GSM extension escape `ESC e` to the euro sign.
pub fn fix_gsm_escapes(text: &str) -> String {
    text.replace("\u{1b}\u{65}", "€")
}

const GSM_BASIC: &str = "@£$¥èéùìòÇ\nØø\rÅåΔ_ΦΓΛΩΠΨΣΘΞÆæßÉ !\"#¤%&'()*+,-./0123456789:;<=>?¡ABCDEFGHIJKLMNOPQRSTUVWXYZÄÖÑÜ§¿abcdefghijklmnopqrstuvwxyzäöñüà";
/// Sent as `ESC` plus one septet.
const GSM_EXTENSION: &str = "^{}\\[~]|€\u{c}";

/// Whether `text` fits the GSM 03.38 basic and extension tables.
pub fn is_gsm_text(text: &str) -> bool {
    text.chars().all(|c| GSM_BASIC.contains(c) || GSM_EXTENSION.contains(c))
}

/// Length of `text` on the air: septets for GSM, UTF-16 code units for UCS2.
pub fn encoded_length(text: &str, encoding: Encoding) -> usize {
    match encoding {
        Encoding::Gsm => text
            .chars()
            .map(|c| if GSM_EXTENSION.contains(c) { 2 } else { 1 })
            .sum(),
        Encoding::Ucs2 => text.encode_utf16().count(),
    }
}

/// Maximum single-part length for `body` in `encoding`.
pub fn max_length(encoding: Encoding) -> usize {
    match encoding {
        Encoding::Gsm => 160,
        Encoding::Ucs2 => 70,
    }
}
