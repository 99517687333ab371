//! SMTP client over implicit TLS.
//!
//! Only what mail delivery needs: EHLO, AUTH PLAIN, one transaction per
//! connection and NOOP for health probes. STARTTLS is not supported.

use std::fs::File;
use std::io::{self, BufReader};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use super::mail::Email;
use super::MailError;
use crate::config::MailConfig;

/// Longest accepted reply line.
const MAX_LINE: usize = 4096;

/// Delivers composed mail.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, mail: &Email) -> Result<(), MailError>;

    /// Connect, greet and disconnect without sending.
    async fn probe(&self) -> Result<(), MailError>;
}

/// SMTPS client for the configured server.
pub struct SmtpsTransport {
    server: String,
    port: u16,
    user: String,
    password: String,
    helo_name: String,
    timeout: Duration,
    connector: TlsConnector,
}

impl SmtpsTransport {
    pub fn new(config: &MailConfig) -> Result<Self, MailError> {
        let roots = load_roots(config)?;
        let tls = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            server: config.server.clone(),
            port: config.port,
            user: config.user.clone(),
            password: config.password.clone(),
            helo_name: config.helo_name.clone(),
            timeout: config.timeout,
            connector: TlsConnector::from(Arc::new(tls)),
        })
    }

    async fn connect(&self) -> Result<SmtpConnection<tokio_rustls::client::TlsStream<TcpStream>>, MailError> {
        let name = ServerName::try_from(self.server.clone())
            .map_err(|_| MailError::ServerName(self.server.clone()))?;
        let tcp = TcpStream::connect((self.server.as_str(), self.port)).await?;
        tcp.set_nodelay(true)?;
        let tls = self.connector.connect(name, tcp).await?;

        let mut connection = SmtpConnection::open(tls, &self.helo_name).await?;
        if !self.user.is_empty() {
            connection.auth_plain(&self.user, &self.password).await?;
        }
        Ok(connection)
    }
}

#[async_trait]
impl MailTransport for SmtpsTransport {
    async fn send(&self, mail: &Email) -> Result<(), MailError> {
        let exchange = async {
            let mut connection = self.connect().await?;
            connection.transaction(mail).await?;
            connection.quit().await;
            Ok::<_, MailError>(())
        };
        timeout(self.timeout, exchange).await.unwrap_or(Err(MailError::Timeout))
    }

    async fn probe(&self) -> Result<(), MailError> {
        let exchange = async {
            let mut connection = self.connect().await?;
            connection.noop().await?;
            connection.quit().await;
            Ok::<_, MailError>(())
        };
        timeout(self.timeout, exchange).await.unwrap_or(Err(MailError::Timeout))
    }
}

fn load_roots(config: &MailConfig) -> Result<RootCertStore, MailError> {
    let file = File::open(&config.ca_file).map_err(|e| MailError::Tls(format!(
        "cannot read CA bundle {}: {e}",
        config.ca_file.display()
    )))?;
    let mut reader = BufReader::new(file);

    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|e| MailError::Tls(e.to_string()))?;
        // Bundles often carry a few certificates rustls cannot parse
        let _ = roots.add(cert);
    }
    if roots.is_empty() {
        return Err(MailError::Tls(format!(
            "no usable certificates in {}",
            config.ca_file.display()
        )));
    }
    Ok(roots)
}

/// One SMTP conversation over an established stream.
pub(crate) struct SmtpConnection<S> {
    stream: BufStream<S>,
    /// EHLO keywords, upper case
    extensions: Vec<String>,
}

impl<S> SmtpConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Read the greeting and introduce ourselves.
    pub(crate) async fn open(stream: S, helo_name: &str) -> Result<Self, MailError> {
        let mut connection = Self {
            stream: BufStream::new(stream),
            extensions: Vec::new(),
        };
        connection.expect(&[220]).await?;

        let lines = connection.command(&format!("EHLO {helo_name}"), &[250]).await?;
        connection.extensions = lines
            .iter()
            .skip(1)
            .filter_map(|line| line.split_whitespace().next())
            .map(str::to_ascii_uppercase)
            .collect();
        Ok(connection)
    }

    fn supports(&self, extension: &str) -> bool {
        self.extensions.iter().any(|e| e == extension)
    }

    pub(crate) async fn auth_plain(&mut self, user: &str, password: &str) -> Result<(), MailError> {
        let token = BASE64.encode(format!("\0{user}\0{password}"));
        trace!("SMTP > AUTH PLAIN ***");
        self.write_line(&format!("AUTH PLAIN {token}")).await?;
        match self.read_reply().await? {
            (235, _) => Ok(()),
            (code, lines) => Err(MailError::Auth(format!("{code} {}", lines.join(" ")))),
        }
    }

    /// Send one mail.
    pub(crate) async fn transaction(&mut self, mail: &Email) -> Result<(), MailError> {
        let body = if self.supports("8BITMIME") { " BODY=8BITMIME" } else { "" };
        self.command(&format!("MAIL FROM:<{}>{body}", mail.from), &[250]).await?;
        self.command(&format!("RCPT TO:<{}>", mail.to), &[250, 251]).await?;
        self.command("DATA", &[354]).await?;

        self.stream.write_all(mail.data.as_bytes()).await?;
        self.stream.write_all(b".\r\n").await?;
        self.stream.flush().await?;
        self.expect(&[250]).await?;

        debug!(to = %mail.to, "mail accepted by server");
        Ok(())
    }

    pub(crate) async fn noop(&mut self) -> Result<(), MailError> {
        self.command("NOOP", &[250]).await.map(drop)
    }

    /// Say goodbye; the answer does not matter.
    pub(crate) async fn quit(&mut self) {
        if self.write_line("QUIT").await.is_ok() {
            let _ = self.read_reply().await;
        }
    }

    async fn command(&mut self, line: &str, expected: &[u16]) -> Result<Vec<String>, MailError> {
        trace!(command = line, "SMTP >");
        self.write_line(line).await?;
        self.expect(expected).await
    }

    async fn expect(&mut self, expected: &[u16]) -> Result<Vec<String>, MailError> {
        let (code, lines) = self.read_reply().await?;
        if expected.contains(&code) {
            Ok(lines)
        } else {
            Err(MailError::Rejected {
                code,
                message: lines.join(" "),
            })
        }
    }

    async fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await
    }

    /// Read a possibly multi-line reply. Returns the code and the text of
    /// each line.
    async fn read_reply(&mut self) -> Result<(u16, Vec<String>), MailError> {
        let mut lines = Vec::new();
        loop {
            let mut raw = String::new();
            let read = (&mut self.stream).take(MAX_LINE as u64).read_line(&mut raw).await?;
            if read == 0 {
                return Err(MailError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "server closed the connection",
                )));
            }

            let line = raw.trim_end_matches(['\r', '\n']);
            trace!(line, "SMTP <");
            if line.len() < 3 || !line.is_char_boundary(3) {
                return Err(MailError::Protocol(line.to_string()));
            }
            let code: u16 = line[..3]
                .parse()
                .map_err(|_| MailError::Protocol(line.to_string()))?;
            let rest = &line[3..];
            lines.push(rest.get(1..).unwrap_or("").to_string());

            if !rest.starts_with('-') {
                return Ok((code, lines));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};

    /// Plays the server side of a conversation: each entry is the line the
    /// client must send (or `None` for none) and the reply to write.
    async fn server(mut stream: DuplexStream, script: Vec<(Option<&'static str>, &'static str)>) -> String {
        let mut received = String::new();
        for (expect, reply) in script {
            if let Some(expect) = expect {
                let mut buf = Vec::new();
                while !buf.ends_with(b"\r\n") || !String::from_utf8_lossy(&buf).contains(expect) {
                    let mut byte = [0u8; 1];
                    if stream.read(&mut byte).await.unwrap() == 0 {
                        break;
                    }
                    buf.push(byte[0]);
                }
                received.push_str(&String::from_utf8_lossy(&buf));
            }
            stream.write_all(reply.as_bytes()).await.unwrap();
        }
        received
    }

    fn mail() -> Email {
        Email {
            from: "gw@example.org".into(),
            to: "ops@example.org".into(),
            subject: "SMS".into(),
            data: "Subject: SMS\r\n\r\n..dot\r\n".into(),
        }
    }

    #[tokio::test]
    async fn test_transaction() {
        let (client, remote) = duplex(4096);
        let script = vec![
            (None, "220 mail.example.org ESMTP\r\n"),
            (Some("EHLO gw"), "250-mail.example.org\r\n250-8BITMIME\r\n250 AUTH PLAIN\r\n"),
            (Some("AUTH PLAIN"), "235 ok\r\n"),
            (Some("MAIL FROM:<gw@example.org> BODY=8BITMIME"), "250 ok\r\n"),
            (Some("RCPT TO:<ops@example.org>"), "250 ok\r\n"),
            (Some("DATA"), "354 go ahead\r\n"),
            (Some("\r\n.\r\n"), "250 queued\r\n"),
            (Some("QUIT"), "221 bye\r\n"),
        ];
        let server = tokio::spawn(server(remote, script));

        let mut connection = SmtpConnection::open(client, "gw").await.unwrap();
        assert!(connection.supports("8BITMIME"));
        connection.auth_plain("gw@example.org", "secret").await.unwrap();
        connection.transaction(&mail()).await.unwrap();
        connection.quit().await;

        let received = server.await.unwrap();
        let token = BASE64.encode("\0gw@example.org\0secret");
        assert!(received.contains(&format!("AUTH PLAIN {token}\r\n")));
        assert!(received.contains("Subject: SMS\r\n\r\n..dot\r\n.\r\n"));
    }

    #[tokio::test]
    async fn test_rejected_recipient() {
        let (client, remote) = duplex(4096);
        let script = vec![
            (None, "220 hi\r\n"),
            (Some("EHLO"), "250 hi\r\n"),
            (Some("MAIL FROM:<gw@example.org>\r\n"), "250 ok\r\n"),
            (Some("RCPT TO"), "550 no such user\r\n"),
        ];
        tokio::spawn(server(remote, script));

        let mut connection = SmtpConnection::open(client, "gw").await.unwrap();
        let err = connection.transaction(&mail()).await.unwrap_err();
        assert!(matches!(err, MailError::Rejected { code: 550, .. }));
    }

    #[tokio::test]
    async fn test_auth_failure() {
        let (client, remote) = duplex(4096);
        let script = vec![
            (None, "220 hi\r\n"),
            (Some("EHLO"), "250 hi\r\n"),
            (Some("AUTH PLAIN"), "535 5.7.8 bad credentials\r\n"),
        ];
        tokio::spawn(server(remote, script));

        let mut connection = SmtpConnection::open(client, "gw").await.unwrap();
        let err = connection.auth_plain("gw", "wrong").await.unwrap_err();
        assert!(matches!(err, MailError::Auth(_)));
        assert!(!err.to_string().contains("wrong"));
    }

    #[tokio::test]
    async fn test_bad_greeting() {
        let stream = tokio_test::io::Builder::new().read(b"554 go away\r\n").build();

        let err = SmtpConnection::open(stream, "gw").await.err().unwrap();
        assert!(matches!(err, MailError::Rejected { code: 554, .. }));
    }

    #[test]
    fn test_missing_ca_bundle() {
        let config = MailConfig {
            ca_file: "/nonexistent/ca.pem".into(),
            ..Default::default()
        };
        assert!(matches!(SmtpsTransport::new(&config), Err(MailError::Tls(_))));
    }
}
