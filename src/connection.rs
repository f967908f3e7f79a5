use crate::auth::AdbKeyPair;
use crate::config::AdbConfig;
use crate::protocol::{
    AdbError, AuthType, Command, ConnectionState, Message, ADB_VERSION, CONNECT_MAXDATA,
};
use crate::stream::{AdbStream, StreamSlot};
use crate::transport::{self, TcpTransport};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashMap;
use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Block on `cond` while `waiting` holds, or until `deadline` passes.
/// Callers re-inspect the guarded state afterwards to tell which happened.
pub(crate) fn wait_for<T, F>(
    cond: &Condvar,
    guard: &mut MutexGuard<'_, T>,
    deadline: Option<Instant>,
    waiting: F,
) where
    F: FnMut(&mut T) -> bool,
{
    match deadline {
        Some(deadline) => {
            cond.wait_while_until(guard, waiting, deadline);
        }
        None => cond.wait_while(guard, waiting),
    }
}

struct Session {
    state: ConnectionState,
    max_data: u32,
    signature_sent: bool,
    public_key_sent: bool,
    banner: String,
    failure: Option<String>,
}

enum AuthReply {
    Signature,
    PublicKey,
    Wait,
}

/// State shared by the connection handle, its streams and the receive loop.
pub(crate) struct Link {
    pub(crate) transport: TcpTransport,
    session: Mutex<Session>,
    session_cond: Condvar,
    streams: Mutex<HashMap<u32, Arc<StreamSlot>>>,
    keypair: Arc<AdbKeyPair>,
    key_label: String,
    dropped_frames: AtomicU64,
}

impl Link {
    pub(crate) fn max_data(&self) -> u32 {
        self.session.lock().max_data
    }

    fn receive_loop<R: Read>(&self, mut reader: R) {
        loop {
            let message = match Message::decode(&mut reader) {
                Ok(message) => message,
                Err(AdbError::TransportClosed) => {
                    log::debug!("adbd closed the connection");
                    self.record_failure("transport closed".to_string());
                    break;
                }
                Err(e) => {
                    log::debug!("Receive loop stopping: {}", e);
                    self.record_failure(e.to_string());
                    break;
                }
            };

            if !message.is_valid() {
                self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                log::debug!("Dropping malformed frame {}", message);
                continue;
            }

            log::trace!("<- {}", message);

            if let Err(e) = self.dispatch(message) {
                log::warn!("Receive loop stopping: {}", e);
                self.record_failure(e.to_string());
                break;
            }
        }

        self.teardown();
    }

    fn dispatch(&self, message: Message) -> Result<(), AdbError> {
        let Some(command) = message.kind() else {
            log::trace!("Ignoring unknown command {}", message);
            return Ok(());
        };

        match command {
            Command::Auth => self.on_auth(&message),
            Command::Cnxn => {
                self.on_connect(&message);
                Ok(())
            }
            Command::Okay | Command::Wrte | Command::Clse => self.on_stream_frame(command, message),
            Command::Open => {
                log::debug!("Ignoring OPEN from device");
                Ok(())
            }
        }
    }

    fn on_auth(&self, message: &Message) -> Result<(), AdbError> {
        if AuthType::from_u32(message.arg0) != Some(AuthType::Token) {
            log::debug!("Ignoring AUTH type {}", message.arg0);
            return Ok(());
        }

        let reply = {
            let mut session = self.session.lock();
            if session.state == ConnectionState::Connecting {
                session.state = ConnectionState::Authenticating;
            }
            if !session.signature_sent {
                session.signature_sent = true;
                AuthReply::Signature
            } else if !session.public_key_sent {
                session.public_key_sent = true;
                AuthReply::PublicKey
            } else {
                AuthReply::Wait
            }
        };

        match reply {
            AuthReply::Signature => {
                let signature = self.keypair.sign_token(&message.payload)?;
                log::debug!("Answering AUTH token with signature");
                self.transport
                    .send(Command::Auth, AuthType::Signature as u32, 0, &signature)
            }
            AuthReply::PublicKey => {
                let public_key = self.keypair.get_public_key(&self.key_label)?;
                log::info!("Signature not accepted, sending public key; confirm the prompt on the device");
                self.transport
                    .send(Command::Auth, AuthType::RsaPublicKey as u32, 0, &public_key)
            }
            AuthReply::Wait => {
                log::debug!("Still waiting for the device to authorize this key");
                Ok(())
            }
        }
    }

    fn on_connect(&self, message: &Message) {
        let mut session = self.session.lock();
        session.max_data = message.arg1;
        session.banner = String::from_utf8_lossy(&message.payload)
            .trim_end_matches('\0')
            .to_string();
        session.state = ConnectionState::Connected;
        log::info!(
            "ADB connected (max payload {}, device {:?})",
            session.max_data,
            session.banner
        );
        self.session_cond.notify_all();
    }

    fn on_stream_frame(&self, command: Command, message: Message) -> Result<(), AdbError> {
        if self.session.lock().state != ConnectionState::Connected {
            log::trace!("Ignoring {} before CNXN", message);
            return Ok(());
        }

        let slot = match self.streams.lock().get(&message.arg1) {
            Some(slot) => Arc::clone(slot),
            None => {
                log::trace!("No stream for {}", message);
                return Ok(());
            }
        };

        match command {
            Command::Okay => slot.on_okay(message.arg0),
            Command::Wrte => {
                slot.on_write(message.payload);
                self.transport
                    .send(Command::Okay, slot.local_id, message.arg0, &[])?;
            }
            Command::Clse => {
                self.streams.lock().remove(&message.arg1);
                slot.on_close();
            }
            _ => {}
        }
        Ok(())
    }

    /// Drop a locally closed stream so late frames for it are ignored
    pub(crate) fn forget_stream(&self, local_id: u32) {
        self.streams.lock().remove(&local_id);
    }

    fn record_failure(&self, reason: String) {
        let mut session = self.session.lock();
        if session.failure.is_none() {
            session.failure = Some(reason);
        }
    }

    /// Mark the session closed, then close every open stream. The order
    /// matters for `open`, which checks the state after registering.
    fn teardown(&self) {
        {
            let mut session = self.session.lock();
            session.state = ConnectionState::Closed;
            self.session_cond.notify_all();
        }

        let slots: Vec<Arc<StreamSlot>> = self.streams.lock().drain().map(|(_, s)| s).collect();
        for slot in slots {
            slot.on_close();
        }
    }
}

/// An authenticated ADB session over one TCP socket.
///
/// A background thread owns the read half for the life of the connection
/// and dispatches frames to streams by local id.
pub struct AdbConnection {
    link: Arc<Link>,
    connect_payload: Vec<u8>,
    handshake_timeout: Option<Duration>,
    open_timeout: Option<Duration>,
    next_local_id: AtomicU32,
    connect_attempted: AtomicBool,
    closed: AtomicBool,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl AdbConnection {
    /// Wrap an already connected socket. Nothing is sent until
    /// [`connect`](Self::connect).
    pub fn new(
        socket: TcpStream,
        keypair: Arc<AdbKeyPair>,
        config: &AdbConfig,
    ) -> Result<Self, AdbError> {
        let transport = TcpTransport::new(socket)?;

        let link = Link {
            transport,
            session: Mutex::new(Session {
                state: ConnectionState::Idle,
                max_data: CONNECT_MAXDATA,
                signature_sent: false,
                public_key_sent: false,
                banner: String::new(),
                failure: None,
            }),
            session_cond: Condvar::new(),
            streams: Mutex::new(HashMap::new()),
            keypair,
            key_label: config.key_label.clone(),
            dropped_frames: AtomicU64::new(0),
        };

        Ok(Self {
            link: Arc::new(link),
            connect_payload: config.connect_payload(),
            handshake_timeout: config.handshake_timeout(),
            open_timeout: config.open_timeout(),
            next_local_id: AtomicU32::new(1),
            connect_attempted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            receiver: Mutex::new(None),
        })
    }

    /// Dial `config.host:config.port` and wrap the socket
    pub fn dial(config: &AdbConfig, keypair: Arc<AdbKeyPair>) -> Result<Self, AdbError> {
        let socket = transport::dial(&config.host, config.port, config.connect_timeout())?;
        Self::new(socket, keypair, config)
    }

    /// Run the CNXN/AUTH handshake, waiting at most the configured
    /// handshake timeout.
    pub fn connect(&self) -> Result<(), AdbError> {
        let deadline = self.handshake_timeout.map(|t| Instant::now() + t);
        self.connect_with_deadline(deadline)
    }

    /// Send CNXN, start the receive loop and block until the device answers
    /// with CNXN. A second call only waits for the first handshake.
    pub fn connect_with_deadline(&self, deadline: Option<Instant>) -> Result<(), AdbError> {
        if !self.connect_attempted.swap(true, Ordering::SeqCst) {
            {
                let mut session = self.link.session.lock();
                if session.state == ConnectionState::Closed {
                    return Err(AdbError::ConnectionFailed("connection closed".to_string()));
                }
                session.state = ConnectionState::Connecting;
            }

            if let Some(addr) = self.link.transport.peer_addr() {
                log::debug!("Starting ADB handshake with {}", addr);
            }

            let started = self
                .link
                .transport
                .send(Command::Cnxn, ADB_VERSION, CONNECT_MAXDATA, &self.connect_payload)
                .and_then(|_| self.spawn_receiver());
            if let Err(e) = started {
                self.link.record_failure(e.to_string());
                self.link.teardown();
                return Err(e);
            }
        }

        self.wait_connected(deadline)
    }

    fn spawn_receiver(&self) -> Result<(), AdbError> {
        let reader = self.link.transport.reader()?;
        let link = Arc::clone(&self.link);
        let handle = thread::Builder::new()
            .name("adb-recv".to_string())
            .spawn(move || link.receive_loop(reader))?;
        *self.receiver.lock() = Some(handle);
        Ok(())
    }

    fn wait_connected(&self, deadline: Option<Instant>) -> Result<(), AdbError> {
        let mut session = self.link.session.lock();
        wait_for(&self.link.session_cond, &mut session, deadline, |s| {
            !matches!(s.state, ConnectionState::Connected | ConnectionState::Closed)
        });

        match session.state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Closed => Err(AdbError::ConnectionFailed(
                session
                    .failure
                    .clone()
                    .unwrap_or_else(|| "connection closed before CNXN".to_string()),
            )),
            _ => Err(AdbError::Timeout),
        }
    }

    /// Open a stream to `destination`, e.g. `shell:ls`, waiting at most the
    /// configured open timeout.
    pub fn open(&self, destination: &str) -> Result<AdbStream, AdbError> {
        let deadline = self.open_timeout.map(|t| Instant::now() + t);
        self.open_with_deadline(destination, deadline)
    }

    /// Open a stream, blocking until the peer answers OKAY (stream usable)
    /// or CLSE ([`AdbError::StreamRejected`]). The deadline covers both the
    /// wait for the handshake and the wait for the answer.
    pub fn open_with_deadline(
        &self,
        destination: &str,
        deadline: Option<Instant>,
    ) -> Result<AdbStream, AdbError> {
        if !self.connect_attempted.load(Ordering::SeqCst) {
            return Err(AdbError::NotConnected);
        }
        self.wait_connected(deadline)?;

        let local_id = self.next_local_id.fetch_add(1, Ordering::SeqCst);
        let slot = Arc::new(StreamSlot::new(local_id));
        self.link.streams.lock().insert(local_id, Arc::clone(&slot));

        if self.link.session.lock().state == ConnectionState::Closed {
            self.link.streams.lock().remove(&local_id);
            return Err(AdbError::ConnectionFailed("connection closed".to_string()));
        }

        let mut payload = destination.as_bytes().to_vec();
        payload.push(0);
        log::debug!("Opening stream {} to {:?}", local_id, destination);
        self.link.transport.send(Command::Open, local_id, 0, &payload)?;

        let mut state = slot.state.lock();
        wait_for(&slot.cond, &mut state, deadline, |s| !s.opened && !s.closed);

        if state.opened {
            drop(state);
            return Ok(AdbStream::new(slot, Arc::clone(&self.link)));
        }
        if state.closed {
            drop(state);
            if self.link.session.lock().state == ConnectionState::Closed {
                return Err(AdbError::ConnectionFailed("connection closed".to_string()));
            }
            return Err(AdbError::StreamRejected(destination.to_string()));
        }

        state.closed = true;
        drop(state);
        self.link.forget_stream(local_id);
        if let Err(e) = self.link.transport.send(Command::Clse, local_id, 0, &[]) {
            log::debug!("Abandoning stream {}: {}", local_id, e);
        }
        Err(AdbError::Timeout)
    }

    /// Close the socket and wait for the receive loop to finish. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.link.transport.shutdown();

        if let Some(handle) = self.receiver.lock().take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                log::error!("ADB receive thread panicked");
            }
        }

        self.link.teardown();
        log::debug!("ADB connection closed");
    }

    pub fn state(&self) -> ConnectionState {
        self.link.session.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Max payload the device advertised in its CNXN
    pub fn max_data(&self) -> u32 {
        self.link.max_data()
    }

    /// Device banner from CNXN, e.g. `device::ro.product.name=...`
    pub fn device_banner(&self) -> String {
        self.link.session.lock().banner.clone()
    }

    /// Frames discarded for a bad magic or checksum
    pub fn dropped_frames(&self) -> u64 {
        self.link.dropped_frames.load(Ordering::Relaxed)
    }

    pub fn open_stream_count(&self) -> usize {
        self.link.streams.lock().len()
    }
}

impl Drop for AdbConnection {
    fn drop(&mut self) {
        self.close();
    }
}
