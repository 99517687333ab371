//! Simulated modems for testing without hardware.
//!
//! [`SimulatedModem`] answers the AT subset the gateway uses and can push
//! unsolicited indications. [`SimulatedPorts`] plays the device directory.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;

use super::codec::{AtFrame, AtOut};
use super::parse::{split_params, ucs2_decode, ucs2_encode};
use super::transport::{AtTransport, PortOpener};

const SCTS: &str = "26/10/18,12:00:00+08";

/// An SMS the simulated modem was asked to submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentSms {
    pub recipient: String,
    pub body: String,
    pub flash: bool,
    pub reference: u8,
}

#[derive(Debug)]
struct ModemState {
    imei: String,
    pin: Option<String>,
    unlocked: bool,
    registered: bool,
    roaming: bool,
    operator: Option<String>,
    rssi: Option<u8>,
    ussd: HashMap<String, String>,
    sent: Vec<SentSms>,
    stored: BTreeMap<u32, (String, String)>,
    next_index: u32,
    next_reference: u8,
    silent: bool,
    /// Send SMS but never answer the submission
    lose_submit_reply: bool,
    reject_sms: bool,
    ucs2: bool,
    dcs: u8,
    submit: Option<String>,
    commands: Vec<String>,
    latency: Duration,
    outbox: Vec<AtFrame>,
    generation: u64,
    push: Option<mpsc::UnboundedSender<AtFrame>>,
}

/// A modem simulated in memory.
#[derive(Debug, Clone)]
pub struct SimulatedModem {
    state: Arc<Mutex<ModemState>>,
}

impl SimulatedModem {
    /// Registered modem without PIN and good signal.
    pub fn new(imei: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(ModemState {
                imei: imei.to_string(),
                pin: None,
                unlocked: true,
                registered: true,
                roaming: false,
                operator: Some("Simulated Net".to_string()),
                rssi: Some(20),
                ussd: HashMap::new(),
                sent: Vec::new(),
                stored: BTreeMap::new(),
                next_index: 1,
                next_reference: 1,
                silent: false,
                lose_submit_reply: false,
                reject_sms: false,
                ucs2: false,
                dcs: 0,
                submit: None,
                commands: Vec::new(),
                latency: Duration::ZERO,
                outbox: Vec::new(),
                generation: 0,
                push: None,
            })),
        }
    }

    /// Require `pin` before the SIM is usable.
    pub fn with_pin(self, pin: &str) -> Self {
        {
            let mut state = self.lock();
            state.pin = Some(pin.to_string());
            state.unlocked = false;
        }
        self
    }

    /// Answer USSD `code` with `response`.
    pub fn with_ussd(self, code: &str, response: &str) -> Self {
        self.lock().ussd.insert(code.to_string(), response.to_string());
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ModemState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn imei(&self) -> String {
        self.lock().imei.clone()
    }

    pub fn set_registered(&self, registered: bool) {
        self.lock().registered = registered;
    }

    pub fn set_roaming(&self, roaming: bool) {
        self.lock().roaming = roaming;
    }

    /// RSSI index reported by `AT+CSQ`; `None` reports 99.
    pub fn set_rssi(&self, rssi: Option<u8>) {
        self.lock().rssi = rssi;
    }

    /// Delay every command response by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Stop answering anything, as a hung modem would.
    pub fn set_silent(&self, silent: bool) {
        self.lock().silent = silent;
    }

    /// Transmit submitted SMS without answering `+CMGS`.
    pub fn set_lose_submit_reply(&self, lose: bool) {
        self.lock().lose_submit_reply = lose;
    }

    /// Refuse SMS submission with a network error.
    pub fn set_reject_sms(&self, reject: bool) {
        self.lock().reject_sms = reject;
    }

    /// Submitted messages, oldest first.
    pub fn sent(&self) -> Vec<SentSms> {
        self.lock().sent.clone()
    }

    /// Every command line received, oldest first.
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    /// Messages still in SIM storage.
    pub fn stored_count(&self) -> usize {
        self.lock().stored.len()
    }

    /// Place a message in storage without notifying.
    pub fn store_sms(&self, sender: &str, body: &str) -> u32 {
        let mut state = self.lock();
        let index = state.next_index;
        state.next_index += 1;
        state.stored.insert(index, (sender.to_string(), body.to_string()));
        index
    }

    /// Receive a message from the network and announce it with `+CMTI`.
    pub fn deliver_sms(&self, sender: &str, body: &str) -> u32 {
        let index = self.store_sms(sender, body);
        self.lock().push_line(format!("+CMTI: \"SM\",{index}"));
        index
    }

    /// Push a `+CDS` status report for `reference`.
    pub fn report_delivery(&self, reference: u8, delivered: bool) {
        let status = if delivered { 0 } else { 70 };
        self.lock().push_line(format!(
            "+CDS: 6,{reference},\"+10000000\",145,\"{SCTS}\",\"{SCTS}\",{status}"
        ));
    }

    /// Drop the current connection, as if the device was unplugged.
    pub fn disconnect(&self) {
        let mut state = self.lock();
        state.generation += 1;
        state.push = None;
    }

    /// Open a new connection, replacing any previous one.
    pub fn connect(&self) -> Box<dyn AtTransport> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        state.generation += 1;
        state.push = Some(tx);
        state.unlocked = state.pin.is_none();
        state.ucs2 = false;
        state.submit = None;

        Box::new(SimTransport {
            modem: self.clone(),
            generation: state.generation,
            inbox: rx,
        })
    }
}

impl ModemState {
    /// Unsolicited line, sent right away.
    fn push_line(&self, line: String) {
        if let Some(tx) = &self.push {
            let _ = tx.send(AtFrame::Line(line));
        }
    }

    /// Response to the command being handled.
    fn respond(&mut self, frame: AtFrame) {
        self.outbox.push(frame);
    }

    fn respond_line(&mut self, line: String) {
        self.respond(AtFrame::Line(line));
    }

    fn reply(&mut self, lines: &[String]) {
        for line in lines {
            self.respond_line(line.clone());
        }
        self.respond_line("OK".to_string());
    }

    fn error(&mut self, error: &str) {
        self.respond_line(error.to_string());
    }

    fn decode(&self, text: &str) -> String {
        if self.ucs2 {
            ucs2_decode(text).unwrap_or_else(|| text.to_string())
        } else {
            text.to_string()
        }
    }

    fn encode(&self, text: &str) -> String {
        if self.ucs2 {
            ucs2_encode(text)
        } else {
            text.to_string()
        }
    }

    fn stored_entry(&self, index: u32, listing: bool) -> Vec<String> {
        let Some((sender, body)) = self.stored.get(&index) else {
            return Vec::new();
        };
        let header = if listing {
            format!("+CMGL: {index},\"REC UNREAD\",\"{}\",,\"{SCTS}\"", self.encode(sender))
        } else {
            format!("+CMGR: \"REC UNREAD\",\"{}\",,\"{SCTS}\"", self.encode(sender))
        };
        vec![header, self.encode(body)]
    }

    fn handle(&mut self, out: AtOut) {
        match out {
            AtOut::Command(command) => {
                self.commands.push(command.clone());
                if !self.silent {
                    self.command(&command);
                }
            }
            AtOut::Text(text) => {
                if self.silent {
                    return;
                }
                let Some(recipient) = self.submit.take() else {
                    self.error("ERROR");
                    return;
                };
                let reference = self.next_reference;
                self.next_reference = self.next_reference.wrapping_add(1);
                let sms = SentSms {
                    recipient: self.decode(&recipient),
                    body: self.decode(&text),
                    flash: self.dcs == 16 || self.dcs == 24,
                    reference,
                };
                self.sent.push(sms);
                if !self.lose_submit_reply {
                    self.reply(&[format!("+CMGS: {reference}")]);
                }
            }
        }
    }

    fn command(&mut self, command: &str) {
        let (name, args) = match command.find(['=', '?']) {
            Some(pos) => command.split_at(pos),
            None => (command, ""),
        };

        match (name, args) {
            ("AT" | "ATZ" | "ATE0" | "AT&F", _) => self.reply(&[]),
            ("AT+CGSN", _) => {
                let imei = self.imei.clone();
                self.reply(&[imei]);
            }
            ("AT+CPIN", "?") => {
                let state = if self.unlocked { "READY" } else { "SIM PIN" };
                self.reply(&[format!("+CPIN: {state}")]);
            }
            ("AT+CPIN", args) => {
                let given = args.trim_start_matches('=').trim_matches('"');
                if self.pin.as_deref() == Some(given) {
                    self.unlocked = true;
                    self.reply(&[]);
                } else {
                    self.error("+CME ERROR: incorrect password");
                }
            }
            _ if !self.unlocked => self.error("+CME ERROR: SIM PIN required"),
            ("AT+CMGF", _) | ("AT+CNMI", _) => self.reply(&[]),
            ("AT+CSCS", args) => {
                self.ucs2 = args.contains("UCS2");
                self.reply(&[]);
            }
            ("AT+CSMP", args) => {
                let params = split_params(args.trim_start_matches('='));
                self.dcs = params.get(3).and_then(|d| d.parse().ok()).unwrap_or(0);
                self.reply(&[]);
            }
            ("AT+CREG", "?") => {
                let stat = match (self.registered, self.roaming) {
                    (false, _) => 2,
                    (true, false) => 1,
                    (true, true) => 5,
                };
                self.reply(&[format!("+CREG: 0,{stat}")]);
            }
            ("AT+COPS", "?") => {
                let line = match &self.operator {
                    Some(name) if self.registered => format!("+COPS: 0,0,\"{name}\",2"),
                    _ => "+COPS: 0".to_string(),
                };
                self.reply(&[line]);
            }
            ("AT+CSQ", _) => {
                let rssi = self.rssi.unwrap_or(99);
                self.reply(&[format!("+CSQ: {rssi},99")]);
            }
            ("AT+CMGL", _) => {
                let lines: Vec<String> = self
                    .stored
                    .keys()
                    .flat_map(|index| self.stored_entry(*index, true))
                    .collect();
                self.reply(&lines);
            }
            ("AT+CMGR", args) => {
                let index = args.trim_start_matches('=').parse().unwrap_or(0);
                let lines = self.stored_entry(index, false);
                if lines.is_empty() {
                    self.error("+CMS ERROR: 321");
                } else {
                    self.reply(&lines);
                }
            }
            ("AT+CMGD", args) => {
                let params = split_params(args.trim_start_matches('='));
                // "1,2" deletes read and sent messages; nothing here is read
                if params.len() < 2 {
                    if let Some(index) = params.first().and_then(|i| i.parse().ok()) {
                        self.stored.remove(&index);
                    }
                }
                self.reply(&[]);
            }
            ("AT+CMGS", args) => {
                if self.reject_sms {
                    self.error("+CMS ERROR: 500");
                } else if !self.registered {
                    self.error("+CMS ERROR: 331");
                } else {
                    self.submit = Some(args.trim_start_matches('=').trim_matches('"').to_string());
                    self.respond(AtFrame::Prompt);
                }
            }
            ("AT+CUSD", args) => {
                let params = split_params(args.trim_start_matches('='));
                self.reply(&[]);
                if params.first().map(String::as_str) != Some("1") {
                    return;
                }
                let code = params.get(1).map(|c| self.decode(c)).unwrap_or_default();
                match self.ussd.get(&code) {
                    Some(response) if self.ucs2 => {
                        let line = format!("+CUSD: 0,\"{}\",72", ucs2_encode(response));
                        self.respond_line(line);
                    }
                    Some(response) => {
                        let line = format!("+CUSD: 0,\"{response}\",15");
                        self.respond_line(line);
                    }
                    None => self.respond_line("+CUSD: 4".to_string()),
                }
            }
            _ => self.error("ERROR"),
        }
    }
}

/// Connection to a [`SimulatedModem`].
pub struct SimTransport {
    modem: SimulatedModem,
    generation: u64,
    inbox: mpsc::UnboundedReceiver<AtFrame>,
}

#[async_trait]
impl AtTransport for SimTransport {
    async fn send(&mut self, out: AtOut) -> io::Result<()> {
        let (frames, latency, tx) = {
            let mut state = self.modem.lock();
            if state.generation != self.generation {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device gone"));
            }
            trace!(?out, "simulated modem <");
            state.handle(out);
            (std::mem::take(&mut state.outbox), state.latency, state.push.clone())
        };

        let Some(tx) = tx else {
            return Ok(());
        };
        if latency.is_zero() {
            for frame in frames {
                let _ = tx.send(frame);
            }
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(latency).await;
                for frame in frames {
                    let _ = tx.send(frame);
                }
            });
        }
        Ok(())
    }

    async fn next_frame(&mut self) -> io::Result<AtFrame> {
        self.inbox
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "device closed"))
    }
}

#[derive(Debug, Default)]
struct PortsState {
    devices: BTreeMap<PathBuf, SimulatedModem>,
    opened: Vec<PathBuf>,
}

/// Device directory populated with simulated modems.
#[derive(Debug, Clone, Default)]
pub struct SimulatedPorts {
    state: Arc<Mutex<PortsState>>,
}

impl SimulatedPorts {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PortsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach `modem` at `path`.
    pub fn plug(&self, path: impl Into<PathBuf>, modem: SimulatedModem) {
        self.lock().devices.insert(path.into(), modem);
    }

    /// Remove the device at `path`, closing any open connection.
    pub fn unplug(&self, path: impl AsRef<Path>) {
        if let Some(modem) = self.lock().devices.remove(path.as_ref()) {
            modem.disconnect();
        }
    }

    /// Paths opened so far, in order.
    pub fn opened(&self) -> Vec<PathBuf> {
        self.lock().opened.clone()
    }

    pub fn clear_opened(&self) {
        self.lock().opened.clear();
    }
}

#[async_trait]
impl PortOpener for SimulatedPorts {
    async fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let state = self.lock();
        // Reverse order, so callers cannot rely on enumeration order
        Ok(state
            .devices
            .keys()
            .rev()
            .filter(|path| path.parent() == Some(dir))
            .cloned()
            .collect())
    }

    async fn open(&self, path: &Path, _baud: u32) -> io::Result<Box<dyn AtTransport>> {
        let mut state = self.lock();
        state.opened.push(path.to_path_buf());
        match state.devices.get(path) {
            Some(modem) => Ok(modem.connect()),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "no such device")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(transport: &mut Box<dyn AtTransport>, command: &str) -> Vec<AtFrame> {
        transport.send(AtOut::Command(command.into())).await.unwrap();
        let mut frames = Vec::new();
        loop {
            let frame = transport.next_frame().await.unwrap();
            let done = matches!(&frame, AtFrame::Line(l) if l == "OK" || l.contains("ERROR"))
                || frame == AtFrame::Prompt;
            frames.push(frame);
            if done {
                return frames;
            }
        }
    }

    #[tokio::test]
    async fn test_pin_gates_commands() {
        let modem = SimulatedModem::new("1").with_pin("0000");
        let mut t = modem.connect();

        let frames = roundtrip(&mut t, "AT+CSQ").await;
        assert_eq!(frames, vec![AtFrame::Line("+CME ERROR: SIM PIN required".into())]);

        roundtrip(&mut t, "AT+CPIN=\"0000\"").await;
        let frames = roundtrip(&mut t, "AT+CSQ").await;
        assert_eq!(frames[0], AtFrame::Line("+CSQ: 20,99".into()));
    }

    #[tokio::test]
    async fn test_submit_records_message() {
        let modem = SimulatedModem::new("1");
        let mut t = modem.connect();

        let frames = roundtrip(&mut t, "AT+CMGS=\"+4912345\"").await;
        assert_eq!(frames, vec![AtFrame::Prompt]);
        t.send(AtOut::Text("hi".into())).await.unwrap();
        assert_eq!(t.next_frame().await.unwrap(), AtFrame::Line("+CMGS: 1".into()));

        assert_eq!(
            modem.sent(),
            vec![SentSms { recipient: "+4912345".into(), body: "hi".into(), flash: false, reference: 1 }]
        );
    }

    #[tokio::test]
    async fn test_disconnect_breaks_transport() {
        let modem = SimulatedModem::new("1");
        let mut t = modem.connect();
        modem.disconnect();

        assert!(t.send(AtOut::Command("AT".into())).await.is_err());
        assert!(t.next_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_ports_list_and_open() {
        let ports = SimulatedPorts::new();
        ports.plug("/dev/ttyUSB0", SimulatedModem::new("1"));
        ports.plug("/dev/ttyUSB1", SimulatedModem::new("2"));
        ports.plug("/dev/serial/by-id/x", SimulatedModem::new("3"));

        let listed = ports.list(Path::new("/dev")).await.unwrap();
        assert_eq!(listed.len(), 2);

        assert!(ports.open(Path::new("/dev/ttyUSB1"), 115200).await.is_ok());
        assert!(ports.open(Path::new("/dev/ttyUSB9"), 115200).await.is_err());
        assert_eq!(
            ports.opened(),
            vec![PathBuf::from("/dev/ttyUSB1"), PathBuf::from("/dev/ttyUSB9")]
        );
    }
}
