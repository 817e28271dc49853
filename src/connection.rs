use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, info, trace, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};

use crate::channel::{Registration, SpecChannel};
use crate::data::SpecData;
use crate::dispatcher::{self, DispatchMode, SenderId, Slot, Subscription};
use crate::error::SpecError;
use crate::message::{self, DataType, Message, Opcode};
use crate::reply::{PendingReply, ReplyCallback, ReplyFuture};

/// Inclusive port range swept when the peer's port must be discovered.
pub const MIN_SCAN_PORT: u16 = 6510;
pub const MAX_SCAN_PORT: u16 = 6530;

const DEFAULT_PORT: u16 = 6789;
const DIAL_TIMEOUT: Duration = Duration::from_millis(200);
const SCAN_RETRY_SLEEP: Duration = Duration::from_millis(100);

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    PortScanning,
    WaitingForHello,
    Connected,
}

/// Handle to a connection to one server.
///
/// Handles are cheap to clone; the underlying link lives for as long as
/// at least one handle does. Dropping the last handle tears the socket
/// down and lets the background tasks exit.
///
/// Signals emitted through the dispatcher: `connected()`,
/// `disconnected()`, `error(message)`.
#[derive(Clone)]
pub struct SpecConnection {
    inner: Arc<ConnectionInner>,
}

pub(crate) struct ConnectionInner {
    host: String,
    fixed_port: Option<u16>,
    scan_name: Option<String>,
    address: String,
    sender: SenderId,
    state_tx: watch::Sender<ConnState>,
    shared: Mutex<Shared>,
    // Keeps the slots for the service channels ('error',
    // 'status/simulate') alive for the lifetime of the connection.
    service_slots: Mutex<Vec<Arc<Slot>>>,
}

struct Shared {
    server_version: Option<u32>,
    simulation_mode: bool,
    next_sn: u32,
    scan_port: u16,
    channels: HashMap<String, Arc<SpecChannel>>,
    replies: HashMap<u32, PendingReply>,
    outgoing: Option<mpsc::UnboundedSender<Outgoing>>,
}

struct Outgoing {
    bytes: Vec<u8>,
    drained: Option<oneshot::Sender<()>>,
}

pub(crate) fn parse_address(address: &str) -> (String, Option<u16>, Option<String>) {
    match address.split_once(':') {
        None => (address.to_string(), Some(DEFAULT_PORT), None),
        Some((host, port)) => match port.parse::<u16>() {
            Ok(p) => (host.to_string(), Some(p), None),
            Err(_) => (host.to_string(), None, Some(port.to_string())),
        },
    }
}

impl SpecConnection {
    pub(crate) fn from_inner(inner: Arc<ConnectionInner>) -> SpecConnection {
        SpecConnection { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<ConnectionInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn create(address: &str) -> SpecConnection {
        let (host, fixed_port, scan_name) = parse_address(address);
        let (state_tx, _) = watch::channel(ConnState::Disconnected);
        let inner = Arc::new(ConnectionInner {
            host,
            fixed_port,
            scan_name,
            address: address.to_string(),
            sender: dispatcher::next_sender_id(),
            state_tx,
            shared: Mutex::new(Shared {
                server_version: None,
                simulation_mode: false,
                next_sn: 0,
                scan_port: MIN_SCAN_PORT,
                channels: HashMap::new(),
                replies: HashMap::new(),
                outgoing: None,
            }),
            service_slots: Mutex::new(Vec::new()),
        });
        let conn = SpecConnection { inner };
        conn.register_service_channels();
        conn
    }

    pub(crate) fn spawn_link(&self) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(dial_loop(weak));
    }

    fn register_service_channels(&self) {
        let weak = Arc::downgrade(&self.inner);
        let error_slot: Arc<Slot> = Arc::new(move |args| {
            if let Some(err) = args.first() {
                log::error!("error from server: {err}");
            }
            if let Some(inner) = weak.upgrade() {
                dispatcher::emit(inner.sender, "error", args);
            }
        });
        self.register_channel("error", &error_slot, Registration::DoReg, DispatchMode::FireEvent);

        let weak = Arc::downgrade(&self.inner);
        let simulate_slot: Arc<Slot> = Arc::new(move |args| {
            if let (Some(inner), Some(value)) = (weak.upgrade(), args.first()) {
                inner.shared.lock().unwrap().simulation_mode = value.truthy();
            }
        });
        self.register_channel(
            "status/simulate",
            &simulate_slot,
            Registration::DoReg,
            DispatchMode::UpdateValue,
        );

        let mut slots = self.inner.service_slots.lock().unwrap();
        slots.push(error_slot);
        slots.push(simulate_slot);
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    /// The port currently in use: the fixed one, or where the scan
    /// cursor points.
    pub fn port(&self) -> u16 {
        self.inner
            .fixed_port
            .unwrap_or_else(|| self.inner.shared.lock().unwrap().scan_port)
    }

    pub fn state(&self) -> ConnState {
        *self.inner.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    /// Protocol generation advertised by the server, once connected.
    pub fn server_version(&self) -> Option<u32> {
        self.inner.shared.lock().unwrap().server_version
    }

    pub fn simulation_mode(&self) -> bool {
        self.inner.shared.lock().unwrap().simulation_mode
    }

    pub(crate) fn state_watch(&self) -> watch::Receiver<ConnState> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribe to a connection signal (`connected`, `disconnected`,
    /// `error`).
    pub fn subscribe(&self, signal: &str, slot: &Arc<Slot>, mode: DispatchMode) -> Subscription {
        dispatcher::connect(self.inner.sender, signal, slot, mode)
    }

    /// Block until the connection is established.
    pub async fn wait_connection(&self, timeout: Option<Duration>) -> Result<(), SpecError> {
        crate::wait::wait_connection(self, timeout).await
    }

    /// Subscribe `slot` to updates of the named channel, creating the
    /// channel (and the server registration, link permitting) on first
    /// use. The parent's cached value, if any, is replayed to the new
    /// subscriber right away.
    pub fn register_channel(
        &self,
        name: &str,
        slot: &Arc<Slot>,
        registration: Registration,
        mode: DispatchMode,
    ) -> Arc<SpecChannel> {
        let (chan, created) = {
            let mut sh = self.inner.shared.lock().unwrap();
            match sh.channels.get(name) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let chan = Arc::new(SpecChannel::new(
                        Arc::downgrade(&self.inner),
                        name,
                        registration,
                    ));
                    sh.channels.insert(name.to_string(), chan.clone());
                    (chan, true)
                }
            }
        };

        if created {
            if chan.is_leaf() {
                // Sub-key channels share the registration of their
                // server-visible parent and get fed through it.
                let weak_child = Arc::downgrade(&chan);
                let forward: Arc<Slot> = Arc::new(move |args| {
                    if let (Some(child), Some(value)) = (weak_child.upgrade(), args.first()) {
                        child.update(value.clone(), false, false);
                    }
                });
                self.register_channel(
                    chan.server_name(),
                    &forward,
                    Registration::DoReg,
                    DispatchMode::UpdateValue,
                );
                chan.set_forward_slot(forward);
                chan.mark_registered();
            }
            if self.is_connected() {
                chan.attach_live();
            }
        }

        dispatcher::connect(chan.sender_id(), "valueChanged", slot, mode);

        let cached = {
            let sh = self.inner.shared.lock().unwrap();
            sh.channels
                .get(chan.server_name())
                .and_then(|parent| parent.value())
        };
        if let Some(value) = cached {
            chan.update(value, false, true);
        }
        chan
    }

    /// Withdraw the named channel's registration and drop it from the
    /// registry.
    pub fn unregister_channel(&self, name: &str) {
        let chan = self.inner.shared.lock().unwrap().channels.remove(name);
        if let Some(chan) = chan {
            chan.unregister();
        }
    }

    /// The registered channel of that name, or a fresh transient
    /// read/write handle that is never registered. Keep a reference to a
    /// transient channel for as long as it is needed.
    pub fn get_channel(&self, name: &str) -> Arc<SpecChannel> {
        if let Some(chan) = self.inner.shared.lock().unwrap().channels.get(name) {
            return chan.clone();
        }
        Arc::new(SpecChannel::new(
            Arc::downgrade(&self.inner),
            name,
            Registration::DontReg,
        ))
    }

    /// Run a command without caring about the outcome.
    pub fn send_command(&self, command: &str) -> Result<(), SpecError> {
        self.inner.ensure_connected()?;
        let vers = self.server_version();
        self.inner.enqueue(Message::cmd(command, vers).encode(), None)
    }

    /// Run a command and obtain a future for its reply.
    pub fn send_command_with_reply(&self, command: &str) -> Result<ReplyFuture, SpecError> {
        self.inner
            .send_with_reply(|sn, vers| Message::cmd_with_return(sn, command, vers), None)
    }

    /// Call a server function (protocol generation 3 and later).
    pub fn send_function(&self, name: &str, args: &[SpecData]) -> Result<(), SpecError> {
        self.inner.ensure_connected()?;
        let vers = self.inner.require_func_support()?;
        let call = func_call(name, args);
        self.inner
            .enqueue(Message::func(call, Some(vers)).encode(), None)
    }

    /// Call a server function and obtain a future for its reply
    /// (protocol generation 3 and later).
    pub fn send_function_with_reply(
        &self,
        name: &str,
        args: &[SpecData],
    ) -> Result<ReplyFuture, SpecError> {
        self.inner.require_func_support()?;
        let call = func_call(name, args);
        self.inner
            .send_with_reply(move |sn, vers| Message::func_with_return(sn, call, vers), None)
    }

    pub(crate) fn command_with_reply(
        &self,
        form: CommandForm,
        callback: Option<ReplyCallback>,
    ) -> Result<ReplyFuture, SpecError> {
        match form {
            CommandForm::Text(text) => self
                .inner
                .send_with_reply(move |sn, vers| Message::cmd_with_return(sn, &text, vers), callback),
            CommandForm::Call(call) => {
                self.inner.require_func_support()?;
                self.inner
                    .send_with_reply(move |sn, vers| Message::func_with_return(sn, call, vers), callback)
            }
        }
    }

    /// Ask for the current value of a channel.
    pub fn read_channel(&self, name: &str) -> Result<ReplyFuture, SpecError> {
        self.inner.send_chan_read(name)
    }

    /// Write a channel value. With `wait` the call returns only once the
    /// outgoing buffer has been drained to the socket.
    pub async fn write_channel(
        &self,
        name: &str,
        value: SpecData,
        wait: bool,
    ) -> Result<(), SpecError> {
        self.inner.send_chan_send(name, value, wait).await
    }

    /// Fire-and-forget channel write, callable from signal slots.
    pub fn write_channel_nowait(&self, name: &str, value: SpecData) -> Result<(), SpecError> {
        self.inner.send_chan_send_nowait(name, value)
    }

    /// Ask the server for update events on a channel.
    pub fn register(&self, name: &str) -> Result<(), SpecError> {
        self.inner.send_register_frame(name)
    }

    /// Withdraw a server-side channel registration.
    pub fn unregister(&self, name: &str) -> Result<(), SpecError> {
        self.inner.send_unregister_frame(name)
    }

    /// Abort whatever the server is doing for us.
    pub fn abort(&self) -> Result<(), SpecError> {
        self.inner.ensure_connected()?;
        let vers = self.server_version();
        self.inner.enqueue(Message::abort(vers).encode(), None)
    }

    /// Abort and only return once the frame is on the wire.
    pub async fn abort_wait(&self) -> Result<(), SpecError> {
        self.inner.ensure_connected()?;
        let vers = self.server_version();
        let (tx, rx) = oneshot::channel();
        self.inner.enqueue(Message::abort(vers).encode(), Some(tx))?;
        rx.await.map_err(|_| SpecError::Disconnected)
    }

    /// Tell the server we are going away.
    pub fn close_link(&self) -> Result<(), SpecError> {
        self.inner.ensure_connected()?;
        let vers = self.server_version();
        self.inner.enqueue(Message::close(vers).encode(), None)
    }

    /// Re-send the handshake greeting. Permitted as soon as a socket
    /// exists, connected or not.
    pub fn send_hello(&self) -> Result<(), SpecError> {
        let vers = self.server_version();
        self.inner.enqueue(Message::hello(vers).encode(), None)
    }

    /// Drop the link. The dial task reconnects as long as handles
    /// remain.
    pub fn disconnect(&self) {
        self.inner.handle_close();
    }
}

impl std::fmt::Display for SpecConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<connection to {}>", self.inner.address)
    }
}

/// A fully formed command, one per protocol generation.
pub(crate) enum CommandForm {
    Text(String),
    Call(Vec<SpecData>),
}

fn func_call(name: &str, args: &[SpecData]) -> Vec<SpecData> {
    let mut call = Vec::with_capacity(args.len() + 1);
    call.push(SpecData::Str(name.to_string()));
    call.extend_from_slice(args);
    call
}

impl ConnectionInner {
    fn ensure_connected(&self) -> Result<(), SpecError> {
        if *self.state_tx.borrow() == ConnState::Connected {
            Ok(())
        } else {
            Err(SpecError::NotConnected)
        }
    }

    fn require_func_support(&self) -> Result<u32, SpecError> {
        match self.shared.lock().unwrap().server_version {
            Some(v) if v >= 3 => Ok(v),
            Some(v) => Err(SpecError::Protocol {
                code: 0,
                message: format!("server speaks protocol {v}; function calls need version 3"),
            }),
            None => Err(SpecError::NotConnected),
        }
    }

    fn enqueue(&self, bytes: Vec<u8>, drained: Option<oneshot::Sender<()>>) -> Result<(), SpecError> {
        let sh = self.shared.lock().unwrap();
        let out = sh.outgoing.as_ref().ok_or(SpecError::NotConnected)?;
        out.send(Outgoing { bytes, drained })
            .map_err(|_| SpecError::NotConnected)
    }

    /// Allocate the serial number and park the future in the pending
    /// table before the frame enters the send queue.
    fn send_with_reply<F>(
        &self,
        build: F,
        callback: Option<ReplyCallback>,
    ) -> Result<ReplyFuture, SpecError>
    where
        F: FnOnce(u32, Option<u32>) -> Message,
    {
        let mut sh = self.shared.lock().unwrap();
        if *self.state_tx.borrow() != ConnState::Connected {
            return Err(SpecError::NotConnected);
        }
        sh.next_sn = sh.next_sn.wrapping_add(1).max(1);
        let sn = sh.next_sn;
        let vers = sh.server_version;
        let (tx, rx) = oneshot::channel();
        sh.replies.insert(sn, PendingReply::new(tx, callback));
        let bytes = build(sn, vers).encode();
        let sent = sh
            .outgoing
            .as_ref()
            .map(|out| out.send(Outgoing { bytes, drained: None }).is_ok())
            .unwrap_or(false);
        if !sent {
            sh.replies.remove(&sn);
            return Err(SpecError::NotConnected);
        }
        Ok(ReplyFuture::new(sn, rx))
    }

    pub(crate) fn send_chan_read(&self, name: &str) -> Result<ReplyFuture, SpecError> {
        let name = name.to_string();
        self.send_with_reply(move |sn, vers| Message::chan_read(sn, &name, vers), None)
    }

    pub(crate) async fn send_chan_send(
        &self,
        name: &str,
        value: SpecData,
        wait: bool,
    ) -> Result<(), SpecError> {
        self.ensure_connected()?;
        let vers = self.shared.lock().unwrap().server_version;
        let bytes = Message::chan_send(name, value, vers).encode();
        if wait {
            let (tx, rx) = oneshot::channel();
            self.enqueue(bytes, Some(tx))?;
            rx.await.map_err(|_| SpecError::Disconnected)
        } else {
            self.enqueue(bytes, None)
        }
    }

    pub(crate) fn send_chan_send_nowait(&self, name: &str, value: SpecData) -> Result<(), SpecError> {
        self.ensure_connected()?;
        let vers = self.shared.lock().unwrap().server_version;
        self.enqueue(Message::chan_send(name, value, vers).encode(), None)
    }

    pub(crate) fn send_register_frame(&self, name: &str) -> Result<(), SpecError> {
        self.ensure_connected()?;
        let vers = self.shared.lock().unwrap().server_version;
        self.enqueue(Message::register(name, vers).encode(), None)
    }

    pub(crate) fn send_unregister_frame(&self, name: &str) -> Result<(), SpecError> {
        self.ensure_connected()?;
        let vers = self.shared.lock().unwrap().server_version;
        self.enqueue(Message::unregister(name, vers).encode(), None)
    }

    fn identity_ok(&self, advertised: &str) -> bool {
        match &self.scan_name {
            Some(wanted) => advertised == wanted,
            None => true,
        }
    }

    fn advance_scan_port(&self) {
        let mut sh = self.shared.lock().unwrap();
        sh.scan_port = if sh.scan_port >= MAX_SCAN_PORT {
            MIN_SCAN_PORT
        } else {
            sh.scan_port + 1
        };
    }

    fn set_connected(&self) {
        let prev = self.state_tx.send_replace(ConnState::Connected);
        if prev != ConnState::Connected {
            info!("connected to {}", self.address);
            let channels: Vec<_> = self.shared.lock().unwrap().channels.values().cloned().collect();
            for chan in &channels {
                chan.on_connected();
            }
            dispatcher::emit(self.sender, "connected", &[]);
        }
    }

    /// Tear-down shared by EOF, errors and explicit disconnects: fail
    /// every outstanding reply, reset every channel, signal observers.
    pub(crate) fn handle_close(&self) {
        let (replies, channels) = {
            let mut sh = self.shared.lock().unwrap();
            sh.outgoing = None;
            sh.server_version = None;
            let replies = std::mem::take(&mut sh.replies);
            let channels: Vec<_> = sh.channels.values().cloned().collect();
            (replies, channels)
        };
        for (_, pending) in replies {
            pending.complete(Err(SpecError::Disconnected));
        }
        for chan in &channels {
            chan.on_disconnected();
        }
        let prev = self.state_tx.send_replace(ConnState::Disconnected);
        if prev == ConnState::Connected {
            info!("disconnected from {}", self.address);
            dispatcher::emit(self.sender, "disconnected", &[]);
        }
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        dispatcher::remove_sender(self.sender);
    }
}

enum LinkEnd {
    Closed,
    Failed,
    IdentityMismatch,
}

/// Dial until the connection object is released, re-dialling after every
/// teardown. In scan mode each failed attempt or identity mismatch steps
/// the cursor through [MIN_SCAN_PORT, MAX_SCAN_PORT], wrapping around.
async fn dial_loop(weak: Weak<ConnectionInner>) {
    loop {
        let (host, port) = {
            let Some(inner) = weak.upgrade() else { return };
            let port = match inner.fixed_port {
                Some(p) => p,
                None => {
                    inner.state_tx.send_replace(ConnState::PortScanning);
                    inner.shared.lock().unwrap().scan_port
                }
            };
            (inner.host.clone(), port)
        };

        match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect((host.as_str(), port))).await {
            Ok(Ok(stream)) => {
                debug!("link up to {host}:{port}");
                let end = run_link(&weak, stream).await;
                let Some(inner) = weak.upgrade() else { return };
                inner.handle_close();
                if matches!(end, LinkEnd::IdentityMismatch) {
                    inner.advance_scan_port();
                }
            }
            _ => {
                let Some(inner) = weak.upgrade() else { return };
                if inner.fixed_port.is_none() {
                    inner.advance_scan_port();
                }
            }
        }
        tokio::time::sleep(SCAN_RETRY_SLEEP).await;
    }
}

/// One established socket: greet, then shuttle frames until the link
/// dies or the connection object is released.
async fn run_link(weak: &Weak<ConnectionInner>, mut stream: TcpStream) -> LinkEnd {
    let (tx, mut rx) = mpsc::unbounded_channel();
    {
        let Some(inner) = weak.upgrade() else { return LinkEnd::Closed };
        inner.shared.lock().unwrap().outgoing = Some(tx);
        inner.state_tx.send_replace(ConnState::WaitingForHello);
        if inner.enqueue(Message::hello(None).encode(), None).is_err() {
            return LinkEnd::Failed;
        }
    }

    let mut buf: Vec<u8> = Vec::with_capacity(8192);
    let mut chunk = [0u8; 4096];
    loop {
        tokio::select! {
            out = rx.recv() => match out {
                Some(out) => {
                    // TODO: keep servicing reads while a large write is in
                    // flight.
                    if stream.write_all(&out.bytes).await.is_err() {
                        return LinkEnd::Failed;
                    }
                    if stream.flush().await.is_err() {
                        return LinkEnd::Failed;
                    }
                    if let Some(done) = out.drained {
                        let _ = done.send(());
                    }
                }
                None => return LinkEnd::Closed,
            },
            read = stream.read(&mut chunk) => match read {
                Ok(0) => return LinkEnd::Closed,
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    loop {
                        match Message::decode(&buf) {
                            Ok(None) => break,
                            Ok(Some((msg, used))) => {
                                // Consume first: trouble with one frame must
                                // not lose the rest of the buffer.
                                buf.drain(..used);
                                let Some(inner) = weak.upgrade() else {
                                    return LinkEnd::Closed;
                                };
                                if !dispatch_frame(&inner, msg) {
                                    return LinkEnd::IdentityMismatch;
                                }
                            }
                            Err(e) => {
                                warn!("dropping link to {}: {e}", host_of(weak));
                                return LinkEnd::Failed;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("read error on link to {}: {e}", host_of(weak));
                    return LinkEnd::Failed;
                }
            },
        }
    }
}

fn host_of(weak: &Weak<ConnectionInner>) -> String {
    weak.upgrade()
        .map(|i| i.address.clone())
        .unwrap_or_else(|| "<released>".to_string())
}

/// React to one inbound frame. Returns false when a HELLO_REPLY failed
/// the identity check and the link must be abandoned.
fn dispatch_frame(inner: &Arc<ConnectionInner>, msg: Message) -> bool {
    match msg.cmd {
        Opcode::Reply if msg.sn > 0 => {
            let pending = inner.shared.lock().unwrap().replies.remove(&msg.sn);
            match pending {
                Some(pending) => {
                    let result = if msg.kind == DataType::Error {
                        Err(SpecError::Protocol {
                            code: msg.err,
                            message: msg.data.as_text(),
                        })
                    } else {
                        Ok(msg.data)
                    };
                    pending.complete(result);
                }
                None => warn!("reply for unknown serial {}", msg.sn),
            }
        }
        Opcode::Event => {
            let chan = inner.shared.lock().unwrap().channels.get(&msg.name).cloned();
            match chan {
                Some(chan) => chan.update(msg.data, msg.flags & message::DELETED != 0, false),
                None => trace!("event for unregistered channel {}", msg.name),
            }
        }
        Opcode::HelloReply => {
            if inner.identity_ok(&msg.name) {
                inner.shared.lock().unwrap().server_version = Some(msg.vers);
                inner.set_connected();
            } else {
                debug!(
                    "peer identifies as '{}', wanted '{}'",
                    msg.name,
                    inner.scan_name.as_deref().unwrap_or("")
                );
                return false;
            }
        }
        other => trace!("no client-side reaction to {other:?}"),
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_forms() {
        assert_eq!(
            parse_address("lid00a:6510"),
            ("lid00a".to_string(), Some(6510), None)
        );
        assert_eq!(
            parse_address("lid00a:fourc"),
            ("lid00a".to_string(), None, Some("fourc".to_string()))
        );
        assert_eq!(parse_address("lid00a"), ("lid00a".to_string(), Some(6789), None));
    }

    #[test]
    fn scan_cursor_wraps() {
        let conn = SpecConnection::create("h:somename");
        for _ in 0..(MAX_SCAN_PORT - MIN_SCAN_PORT) {
            conn.inner.advance_scan_port();
        }
        assert_eq!(conn.port(), MAX_SCAN_PORT);
        conn.inner.advance_scan_port();
        assert_eq!(conn.port(), MIN_SCAN_PORT);
    }
}
