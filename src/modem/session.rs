//! Modem session state machine and command queue.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, trace, warn};

use super::link::AtLink;
use super::parse::{
    encode_text, fix_gsm_escapes, is_incorrect_password, parse_cds, parse_cmgs, parse_cmti,
    parse_cops, parse_cpin, parse_creg, parse_csq, parse_cusd, parse_messages, rssi_to_dbm,
    ucs2_decode, PinState, StoredSms,
};
use super::ModemError;
use crate::config::{Encoding, ModemSlot, PoolConfig};

/// Interval between registration polls.
const REGISTRATION_POLL: Duration = Duration::from_millis(500);

/// Data coding scheme for USSD text sent as UCS2.
const USSD_DCS_UCS2: u8 = 72;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    PinRequired,
    Unlocked,
    Registering,
    Ready,
    /// A command is executing
    Busy,
    /// Faulted; the device has been or is being released
    Error,
}

impl SessionState {
    /// Whether commands are accepted.
    pub fn accepts_commands(&self) -> bool {
        matches!(self, Self::Ready | Self::Busy)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::PinRequired => "pin_required",
            Self::Unlocked => "unlocked",
            Self::Registering => "registering",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-operation time limits.
#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    /// Plain commands
    pub command: Duration,
    /// SMS submission
    pub sms: Duration,
    /// Wait for a USSD answer
    pub ussd: Duration,
    /// Wait for network registration after connect
    pub registration: Duration,
    /// Wait for a place in the queue, and longest time a queued command may wait to start
    pub queue: Duration,
}

impl From<&PoolConfig> for SessionTimeouts {
    fn from(pool: &PoolConfig) -> Self {
        Self {
            command: pool.command_timeout,
            sms: pool.sms_timeout,
            ussd: pool.ussd_timeout,
            registration: pool.registration_timeout,
            queue: pool.queue_timeout,
        }
    }
}

/// What a session needs to know about its slot.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub slot: String,
    pub pin: Option<String>,
    pub encoding: Encoding,
    pub balance_code: Option<String>,
    pub timeouts: SessionTimeouts,
    pub queue_depth: usize,
}

impl SessionSettings {
    pub fn new(slot: &ModemSlot, pool: &PoolConfig) -> Self {
        Self {
            slot: slot.id.clone(),
            pin: slot.pin.clone(),
            encoding: slot.encoding,
            balance_code: slot.ussd_balance_code.clone(),
            timeouts: SessionTimeouts::from(pool),
            queue_depth: pool.queue_depth,
        }
    }
}

/// Network registration snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Registration {
    pub registered: bool,
    pub roaming: bool,
    pub operator: Option<String>,
    /// `+CSQ` RSSI index, `None` when unknown
    pub rssi: Option<u8>,
    pub signal_dbm: Option<i32>,
}

/// Pushed by a session to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Inbound(StoredSms),
    StatusReport { reference: u8, delivered: bool },
}

type Reply<T> = oneshot::Sender<Result<T, ModemError>>;

enum Command {
    SendSms {
        recipient: String,
        body: String,
        flash: bool,
        reply: Reply<u8>,
    },
    SendUssd {
        code: String,
        reply: Reply<String>,
    },
    QueryRegistration {
        reply: Reply<Registration>,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Self::SendSms { .. } => "send_sms",
            Self::SendUssd { .. } => "send_ussd",
            Self::QueryRegistration { .. } => "query_registration",
        }
    }

    fn reject(self, error: ModemError) {
        match self {
            Self::SendSms { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Self::SendUssd { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Self::QueryRegistration { reply } => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

struct Request {
    command: Command,
    /// Answered with `Busy` if not started by then
    deadline: Instant,
}

/// Handle to a modem session.
///
/// Cloning is cheap; all clones feed the same command queue.
#[derive(Clone)]
pub struct ModemSession {
    slot: Arc<str>,
    encoding: Encoding,
    balance_code: Option<Arc<str>>,
    queue_timeout: Duration,
    requests: mpsc::Sender<Request>,
    state: watch::Receiver<SessionState>,
}

impl fmt::Debug for ModemSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModemSession")
            .field("slot", &self.slot)
            .field("state", &self.state())
            .finish()
    }
}

impl ModemSession {
    pub fn slot(&self) -> &str {
        &self.slot
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state().accepts_commands()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Submit an SMS; returns the network message reference.
    pub async fn send_sms(&self, recipient: &str, body: &str, flash: bool) -> Result<u8, ModemError> {
        self.enqueue_sms(recipient, body, flash).await?.wait().await
    }

    /// Queue an SMS and return once it has a place in the queue.
    ///
    /// Callers that enqueue one after another are served in that order.
    pub async fn enqueue_sms(
        &self,
        recipient: &str,
        body: &str,
        flash: bool,
    ) -> Result<Pending<u8>, ModemError> {
        self.enqueue(|reply| Command::SendSms {
            recipient: recipient.to_string(),
            body: body.to_string(),
            flash,
            reply,
        })
        .await
    }

    /// Run a USSD request and return the decoded answer.
    pub async fn send_ussd(&self, code: &str) -> Result<String, ModemError> {
        self.enqueue(|reply| Command::SendUssd {
            code: code.to_string(),
            reply,
        })
        .await?
        .wait()
        .await
    }

    /// Run the slot's balance USSD code.
    pub async fn query_balance(&self) -> Result<String, ModemError> {
        match self.balance_code.clone() {
            Some(code) => self.send_ussd(&code).await,
            None => Err(ModemError::Rejected("no balance code configured".into())),
        }
    }

    pub async fn query_registration(&self) -> Result<Registration, ModemError> {
        self.enqueue(|reply| Command::QueryRegistration { reply })
            .await?
            .wait()
            .await
    }

    async fn enqueue<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<Pending<T>, ModemError> {
        if !self.is_ready() {
            return Err(ModemError::NotReady);
        }

        let (reply, response) = oneshot::channel();
        let request = Request {
            command: make(reply),
            deadline: Instant::now() + self.queue_timeout,
        };

        match timeout(self.queue_timeout, self.requests.send(request)).await {
            Err(_) => Err(ModemError::Busy),
            Ok(Err(_)) => Err(ModemError::Closed),
            Ok(Ok(())) => Ok(Pending { response }),
        }
    }
}

/// A queued command awaiting its result.
#[derive(Debug)]
pub struct Pending<T> {
    response: oneshot::Receiver<Result<T, ModemError>>,
}

impl<T> Pending<T> {
    /// Wait for the command to finish. Bounded by the command's own timeout.
    pub async fn wait(self) -> Result<T, ModemError> {
        self.response.await.unwrap_or(Err(ModemError::Closed))
    }
}

/// Owns the device and executes queued commands one at a time.
pub struct SessionDriver {
    settings: SessionSettings,
    link: AtLink,
    state: watch::Sender<SessionState>,
    requests: mpsc::Receiver<Request>,
    events: mpsc::Sender<SessionEvent>,
    /// Fault hit while serving a request that still got an answer
    fault: Option<ModemError>,
}

impl SessionDriver {
    /// Create the driver and its handle. Nothing is sent to the modem yet.
    pub fn new(
        settings: SessionSettings,
        link: AtLink,
        events: mpsc::Sender<SessionEvent>,
    ) -> (ModemSession, SessionDriver) {
        let (tx, rx) = mpsc::channel(settings.queue_depth.max(1));
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);

        let session = ModemSession {
            slot: Arc::from(settings.slot.as_str()),
            encoding: settings.encoding,
            balance_code: settings.balance_code.as_deref().map(Arc::from),
            queue_timeout: settings.timeouts.queue,
            requests: tx,
            state: state_rx,
        };

        let driver = SessionDriver {
            settings,
            link,
            state: state_tx,
            requests: rx,
            events,
            fault: None,
        };

        (session, driver)
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(slot = %self.settings.slot, from = %previous, to = %state, "session state");
        }
    }

    /// Reset, unlock, configure and register the modem.
    ///
    /// On error the session is left in `Error` and the driver should be
    /// dropped to release the device.
    pub async fn establish(&mut self) -> Result<(), ModemError> {
        let result = self.connect_sequence().await;
        if let Err(e) = &result {
            warn!(slot = %self.settings.slot, error = %e, "session setup failed");
            self.set_state(SessionState::Error);
        }
        result
    }

    async fn connect_sequence(&mut self) -> Result<(), ModemError> {
        let limit = self.settings.timeouts.command;
        self.set_state(SessionState::Connecting);

        self.link.command("ATZ", limit).await?;
        self.link.command("ATE0", limit).await?;
        self.unlock().await?;

        let encoding = self.settings.encoding;
        self.link.command("AT+CMGF=1", limit).await?;
        self.link
            .command(&format!("AT+CSCS=\"{}\"", encoding.as_str()), limit)
            .await?;
        self.optional(&submit_parameters(encoding, false)).await?;
        self.optional("AT+CNMI=2,1,0,1,0").await?;

        self.set_state(SessionState::Registering);
        self.await_registration().await?;

        self.set_state(SessionState::Ready);
        info!(slot = %self.settings.slot, "modem ready");

        self.optional("AT+CMGD=1,2").await?;
        self.collect_unread().await
    }

    async fn unlock(&mut self) -> Result<(), ModemError> {
        let limit = self.settings.timeouts.command;
        let lines = self.link.command("AT+CPIN?", limit).await?;

        match parse_cpin(&lines) {
            Some(PinState::Ready) => Ok(()),
            Some(PinState::SimPin) => {
                self.set_state(SessionState::PinRequired);
                let Some(pin) = self.settings.pin.clone() else {
                    return Err(ModemError::PinRequired);
                };
                match self.link.command(&format!("AT+CPIN=\"{pin}\""), limit).await {
                    Ok(_) => {
                        self.set_state(SessionState::Unlocked);
                        Ok(())
                    }
                    Err(ModemError::Rejected(error)) if is_incorrect_password(&error) => {
                        Err(ModemError::PinRejected)
                    }
                    Err(e) => Err(e),
                }
            }
            Some(PinState::Other(state)) if state.contains("PUK") => Err(ModemError::PinRejected),
            Some(PinState::Other(state)) => Err(ModemError::Rejected(format!("SIM state {state}"))),
            None => Err(ModemError::Rejected("no SIM state reported".into())),
        }
    }

    async fn await_registration(&mut self) -> Result<(), ModemError> {
        let deadline = Instant::now() + self.settings.timeouts.registration;
        loop {
            let lines = self.optional("AT+CREG?").await?;
            if let Some((true, roaming)) = parse_creg(&lines) {
                debug!(slot = %self.settings.slot, roaming, "registered");
                return Ok(());
            }
            if Instant::now() + REGISTRATION_POLL > deadline {
                return Err(ModemError::NotRegistered);
            }
            sleep(REGISTRATION_POLL).await;
        }
    }

    /// Run a command whose rejection is not an error.
    async fn optional(&mut self, command: &str) -> Result<Vec<String>, ModemError> {
        match self.link.command(command, self.settings.timeouts.command).await {
            Ok(lines) => Ok(lines),
            Err(ModemError::Rejected(error)) => {
                warn!(slot = %self.settings.slot, command, %error, "modem rejected command");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Publish and delete messages left in SIM storage.
    async fn collect_unread(&mut self) -> Result<(), ModemError> {
        let status = encode_text("REC UNREAD", self.settings.encoding);
        let lines = self.optional(&format!("AT+CMGL=\"{status}\"")).await?;

        for sms in parse_messages(&lines, self.settings.encoding) {
            let index = sms.index;
            self.emit(SessionEvent::Inbound(sms)).await;
            if let Some(index) = index {
                self.optional(&format!("AT+CMGD={index}")).await?;
            }
        }
        Ok(())
    }

    async fn emit(&self, event: SessionEvent) {
        if self.events.send(event).await.is_err() {
            debug!(slot = %self.settings.slot, "event receiver gone");
        }
    }

    /// Serve queued commands and unsolicited indications until shutdown or
    /// a fault. The device is released when this returns.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ModemError> {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!(slot = %self.settings.slot, "session closing");
                    self.set_state(SessionState::Disconnected);
                    return Ok(());
                }

                request = self.requests.recv() => {
                    let Some(request) = request else {
                        self.set_state(SessionState::Disconnected);
                        return Ok(());
                    };
                    self.serve(request).await;
                }

                line = self.link.next_unsolicited() => {
                    let result = match line {
                        Ok(line) => self.unsolicited(line).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = result {
                        self.fault.get_or_insert(e);
                    }
                }
            }

            if let Some(e) = self.fault.take() {
                warn!(slot = %self.settings.slot, error = %e, "session fault");
                self.set_state(SessionState::Error);
                return Err(e);
            }
        }
    }

    async fn serve(&mut self, request: Request) {
        let name = request.command.name();
        if Instant::now() > request.deadline {
            debug!(slot = %self.settings.slot, command = name, "queued past deadline");
            request.command.reject(ModemError::Busy);
            return;
        }

        trace!(slot = %self.settings.slot, command = name, "executing");
        self.set_state(SessionState::Busy);
        match request.command {
            Command::SendSms {
                recipient,
                body,
                flash,
                reply,
            } => {
                let result = self.submit_sms(&recipient, &body, flash).await;
                self.answer(reply, result);
            }
            Command::SendUssd { code, reply } => {
                let result = self.ussd(&code).await;
                self.answer(reply, result);
            }
            Command::QueryRegistration { reply } => {
                let result = self.registration().await;
                self.answer(reply, result);
            }
        }
        self.set_state(SessionState::Ready);
    }

    fn answer<T>(&mut self, reply: Reply<T>, result: Result<T, ModemError>) {
        if let Err(e) = &result {
            if e.is_fault() {
                self.fault.get_or_insert(e.clone());
            }
        }
        let _ = reply.send(result);
    }

    async fn submit_sms(&mut self, recipient: &str, body: &str, flash: bool) -> Result<u8, ModemError> {
        let encoding = self.settings.encoding;
        let limits = self.settings.timeouts;

        if flash {
            self.link
                .command(&submit_parameters(encoding, true), limits.command)
                .await?;
        }

        let header = format!("AT+CMGS=\"{}\"", encode_text(recipient, encoding));
        let result = self
            .link
            .submit_text(&header, &encode_text(body, encoding), limits.sms)
            .await;

        if flash {
            if let Err(e) = self.optional(&submit_parameters(encoding, false)).await {
                // The message itself went out; still drop the session
                self.fault.get_or_insert(e);
            }
        }

        let lines = result?;
        parse_cmgs(&lines).ok_or_else(|| ModemError::Rejected("no message reference".into()))
    }

    async fn ussd(&mut self, code: &str) -> Result<String, ModemError> {
        let encoding = self.settings.encoding;
        let limits = self.settings.timeouts;

        let command = format!("AT+CUSD=1,\"{}\",15", encode_text(code, encoding));
        self.link.command(&command, limits.command).await?;
        let line = self.link.wait_for("+CUSD:", limits.ussd).await?;

        let Some((status, text, dcs)) = parse_cusd(&line) else {
            return Err(ModemError::Rejected(format!("malformed USSD answer: {line}")));
        };

        match status {
            0 | 1 => {
                if status == 1 {
                    // Network expects more input; end the dialogue
                    self.optional("AT+CUSD=2").await?;
                }
                Ok(decode_ussd(&text.unwrap_or_default(), dcs, encoding))
            }
            2 => Err(ModemError::Rejected("USSD dialogue terminated by network".into())),
            4 => Err(ModemError::Rejected("USSD operation not supported".into())),
            5 => Err(ModemError::Rejected("USSD network time out".into())),
            other => Err(ModemError::Rejected(format!("USSD status {other}"))),
        }
    }

    async fn registration(&mut self) -> Result<Registration, ModemError> {
        let creg = self.optional("AT+CREG?").await?;
        let cops = self.optional("AT+COPS?").await?;
        let csq = self.optional("AT+CSQ").await?;

        let (registered, roaming) = parse_creg(&creg).unwrap_or_default();
        let rssi = parse_csq(&csq);
        Ok(Registration {
            registered,
            roaming,
            operator: parse_cops(&cops),
            rssi,
            signal_dbm: rssi.map(rssi_to_dbm),
        })
    }

    async fn unsolicited(&mut self, line: String) -> Result<(), ModemError> {
        if let Some(index) = parse_cmti(&line) {
            return self.read_stored(index).await;
        }

        if line.starts_with("+CDS:") {
            match parse_cds(&line) {
                Some((reference, Some(delivered))) => {
                    self.emit(SessionEvent::StatusReport { reference, delivered })
                        .await;
                }
                Some((reference, None)) => {
                    trace!(slot = %self.settings.slot, reference, "delivery still pending")
                }
                None => warn!(slot = %self.settings.slot, line = %line, "malformed status report"),
            }
            return Ok(());
        }

        trace!(slot = %self.settings.slot, line = %line, "ignoring unsolicited line");
        Ok(())
    }

    async fn read_stored(&mut self, index: u32) -> Result<(), ModemError> {
        let lines = self.optional(&format!("AT+CMGR={index}")).await?;
        for mut sms in parse_messages(&lines, self.settings.encoding) {
            sms.index = Some(index);
            self.emit(SessionEvent::Inbound(sms)).await;
        }
        self.optional(&format!("AT+CMGD={index}")).await?;
        Ok(())
    }
}

/// `AT+CSMP` with status report request and the data coding scheme for
/// `encoding`, class 0 when `flash`.
fn submit_parameters(encoding: Encoding, flash: bool) -> String {
    let dcs = match (encoding, flash) {
        (Encoding::Gsm, false) => 0,
        (Encoding::Gsm, true) => 16,
        (Encoding::Ucs2, false) => 8,
        (Encoding::Ucs2, true) => 24,
    };
    format!("AT+CSMP=49,167,0,{dcs}")
}

fn decode_ussd(text: &str, dcs: Option<u8>, encoding: Encoding) -> String {
    if dcs == Some(USSD_DCS_UCS2) || encoding == Encoding::Ucs2 {
        if let Some(decoded) = ucs2_decode(text) {
            return decoded;
        }
    }
    fix_gsm_escapes(text)
}
