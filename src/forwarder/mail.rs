//! Rendering of received SMS as mail.

use chrono::{DateTime, Local, Utc};

use crate::pool::InboundNotice;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S  %z";

/// A mail ready for the SMTP DATA phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    /// Envelope and header sender
    pub from: String,
    pub to: String,
    pub subject: String,
    /// Headers and body with CRLF line ends, dot-stuffed
    pub data: String,
}

impl Email {
    /// Compose the mail for `notice`.
    pub fn compose(notice: &InboundNotice, from: &str, to: &str, date: DateTime<Local>) -> Self {
        let message = &notice.message;
        let subject = format!("SMS from {} to {}", message.peer, notice.recipient);
        let domain = from.rsplit_once('@').map_or("localhost", |(_, domain)| domain);

        let mut text = String::new();
        text.push_str(&format!("From: {from}\r\n"));
        text.push_str(&format!("To: {to}\r\n"));
        text.push_str(&format!("Subject: {}\r\n", single_line(&subject)));
        text.push_str(&format!("Date: {}\r\n", date.to_rfc2822()));
        text.push_str(&format!("Message-ID: <{}@{domain}>\r\n", message.id));
        text.push_str("MIME-Version: 1.0\r\n");
        text.push_str("Content-Type: text/plain; charset=utf-8\r\n");
        text.push_str("Content-Transfer-Encoding: 8bit\r\n");
        text.push_str("\r\n");
        text.push_str(&render_body(notice));

        Self {
            from: from.to_string(),
            to: to.to_string(),
            subject,
            data: dot_stuff(&text),
        }
    }
}

fn render_body(notice: &InboundNotice) -> String {
    let message = &notice.message;
    let timestamp = |ts: DateTime<Utc>| ts.with_timezone(&Local).format(TIMESTAMP_FORMAT).to_string();

    let mut body = String::new();
    body.push_str(&format!("SMS ID            : {}\n", message.id));
    body.push_str(&format!("Sender            : {}\n", single_line(&message.peer)));
    body.push_str(&format!("Recipient         : {}\n", single_line(&notice.recipient)));
    body.push_str(&format!("Message timestamp : {}\n", timestamp(message.timestamp)));
    body.push_str(&format!("Created timestamp : {}\n", timestamp(message.created_at)));
    body.push_str(&format!("Flash message     : {}\n", message.flash));
    body.push_str(&format!("Receiving slot    : {}\n", message.slot));
    if let Some(network) = &notice.network {
        body.push_str(&format!("Network           : {}\n", single_line(network)));
    }
    body.push('\n');
    body.push_str(&message.body);
    body.push('\n');
    body
}

/// Header values and the fields of the body summary must not carry line breaks.
fn single_line(value: &str) -> String {
    value.chars().filter(|c| !c.is_control()).collect()
}

/// Normalize line ends to CRLF and escape lines starting with a dot.
///
/// The result always ends with CRLF, so the terminating `.` can follow.
pub fn dot_stuff(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.starts_with('.') {
            out.push('.');
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    // split yields an empty tail after a final newline
    if text.ends_with('\n') {
        out.truncate(out.len() - 2);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Encoding;
    use crate::store::SmsMessage;
    use chrono::TimeZone;

    fn notice(body: &str) -> InboundNotice {
        InboundNotice {
            message: SmsMessage::inbound("00", "+4915199999999", body, Encoding::Gsm, None),
            recipient: "+4917000000".to_string(),
            email: None,
            network: Some("Simulated Net".to_string()),
        }
    }

    #[test]
    fn test_dot_stuffing() {
        assert_eq!(dot_stuff("a\n.b\n..c\n"), "a\r\n..b\r\n...c\r\n");
        assert_eq!(dot_stuff("a\r\nb"), "a\r\nb\r\n");
        assert_eq!(dot_stuff("."), "..\r\n");
    }

    #[test]
    fn test_compose() {
        let date = Local.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap();
        let notice = notice("Hello\n.\nbye");
        let mail = Email::compose(&notice, "gateway@example.org", "ops@example.org", date);

        assert_eq!(mail.subject, "SMS from +4915199999999 to +4917000000");
        assert!(mail.data.starts_with("From: gateway@example.org\r\nTo: ops@example.org\r\n"));
        assert!(mail.data.contains(&format!("Message-ID: <{}@example.org>\r\n", notice.message.id)));
        assert!(mail.data.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(mail.data.contains("Receiving slot    : 00\r\n"));
        assert!(mail.data.contains("Network           : Simulated Net\r\n"));
        // The lone dot in the text is escaped
        assert!(mail.data.contains("Hello\r\n..\r\nbye\r\n"));
        assert!(mail.data.ends_with("\r\n"));
    }

    #[test]
    fn test_subject_has_no_line_breaks() {
        let mut notice = notice("x");
        notice.message.peer = "evil\r\nBcc: someone@example.org".to_string();
        let mail = Email::compose(&notice, "gw@example.org", "ops@example.org", Local::now());
        assert!(!mail.data.contains("\r\nBcc:"));
    }
}
