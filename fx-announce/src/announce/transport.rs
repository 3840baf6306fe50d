use crate::announce::{AnnounceError, AnnouncerConfig, Fetch, Result, TtlCache};
use async_trait::async_trait;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use derive_more::Display;
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::io;
use std::io::{Cursor, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time;
use tokio_util::sync::CancellationToken;

/// The size of the receive buffer of the listener.
const MAX_DATAGRAM_SIZE: usize = 16 * 1024;
/// The wait time of the listener after a transient read failure.
const TRANSIENT_ERROR_BACKOFF: Duration = Duration::from_secs(1);
/// The byte length of a response header, the action followed by the transaction id.
const RESPONSE_HEADER_LEN: usize = 8;

/// The action code of a UDP tracker message.
#[repr(u32)]
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq)]
pub enum Action {
    #[display("connect")]
    Connect = 0,
    #[display("announce")]
    Announce = 1,
    #[display("scrape")]
    Scrape = 2,
    #[display("error")]
    Error = 3,
}

impl TryFrom<u32> for Action {
    type Error = AnnounceError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Action::Connect),
            1 => Ok(Action::Announce),
            2 => Ok(Action::Scrape),
            3 => Ok(Action::Error),
            _ => Err(AnnounceError::Parse(format!("unknown action {}", value))),
        }
    }
}

/// A datagram received from a UDP tracker, correlated by its transaction id.
#[derive(Debug, Clone, PartialEq)]
pub struct UdpResponse {
    pub action: Action,
    pub transaction_id: u32,
    /// The message specific bytes following the header.
    pub payload: Vec<u8>,
}

impl UdpResponse {
    /// Parse the fixed response header of the given datagram.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < RESPONSE_HEADER_LEN {
            return Err(AnnounceError::Parse(format!(
                "expected at least {} header bytes, got {}",
                RESPONSE_HEADER_LEN,
                bytes.len()
            )));
        }

        let mut cursor = Cursor::new(bytes);
        let action = Action::try_from(cursor.read_u32::<BigEndian>()?)?;
        let transaction_id = cursor.read_u32::<BigEndian>()?;

        Ok(Self {
            action,
            transaction_id,
            payload: bytes[RESPONSE_HEADER_LEN..].to_vec(),
        })
    }
}

/// Provides the connection id which should be written in the header of an outgoing request.
/// The source is consulted again before every retransmission.
#[async_trait]
pub trait ConnectionIdSource: Send + Sync {
    async fn connection_id(&self, addr: &SocketAddr, cancel: &CancellationToken) -> Result<u64>;
}

#[async_trait]
impl ConnectionIdSource for u64 {
    async fn connection_id(&self, _: &SocketAddr, _: &CancellationToken) -> Result<u64> {
        Ok(*self)
    }
}

#[async_trait]
impl<F> ConnectionIdSource for TtlCache<SocketAddr, u64, F>
where
    F: Fetch<SocketAddr, u64>,
{
    async fn connection_id(&self, addr: &SocketAddr, cancel: &CancellationToken) -> Result<u64> {
        self.get(addr, cancel).await
    }
}

/// The state of a single outbound UDP request.
#[derive(Debug, PartialEq)]
pub enum RequestState {
    /// The request datagram is being written for the given zero-based attempt.
    Sending { attempt: u32 },
    /// The request has been written and the response of the given attempt is awaited.
    AwaitingResponse { attempt: u32 },
    /// The previous attempt timed out, the request will be sent again as the given attempt.
    Retrying { attempt: u32 },
    Succeeded(UdpResponse),
    TimedOut,
    Failed(AnnounceError),
}

impl RequestState {
    /// Returns true when the request has reached a final state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Succeeded(_) | RequestState::TimedOut | RequestState::Failed(_)
        )
    }
}

/// The events which drive a [RequestState].
#[derive(Debug)]
pub enum RequestEvent {
    /// The request datagram has been written to the socket.
    Sent,
    /// A response with the request's transaction id has been received.
    Received(UdpResponse),
    /// The wait time of the current attempt has elapsed.
    Elapsed,
    /// The retry wait has finished and the request should be written again.
    Retransmit,
    Cancelled,
    /// The request failed because of the given error.
    Error(AnnounceError),
}

/// Compute the next state of a request for the given event.
/// Attempts `0..=max_retransmits` are made before the request is considered timed out.
///
/// Final states never change, and events which don't apply to the current state are ignored.
pub fn transition(state: RequestState, event: RequestEvent, max_retransmits: u32) -> RequestState {
    if state.is_terminal() {
        return state;
    }

    match (state, event) {
        (_, RequestEvent::Cancelled) => RequestState::Failed(AnnounceError::Cancelled),
        (_, RequestEvent::Error(e)) => RequestState::Failed(e),
        (RequestState::Sending { attempt }, RequestEvent::Sent) => {
            RequestState::AwaitingResponse { attempt }
        }
        (RequestState::AwaitingResponse { .. }, RequestEvent::Received(response)) => {
            if response.action == Action::Error {
                let message = String::from_utf8_lossy(&response.payload).to_string();
                RequestState::Failed(AnnounceError::TrackerFailure(message))
            } else {
                RequestState::Succeeded(response)
            }
        }
        (RequestState::AwaitingResponse { attempt }, RequestEvent::Elapsed) => {
            if attempt >= max_retransmits {
                RequestState::TimedOut
            } else {
                RequestState::Retrying {
                    attempt: attempt + 1,
                }
            }
        }
        (RequestState::Retrying { attempt }, RequestEvent::Retransmit) => {
            RequestState::Sending { attempt }
        }
        (state, event) => {
            trace!("Ignoring request event {:?} in state {:?}", event, state);
            state
        }
    }
}

/// The shared UDP socket of the announcer.
///
/// A single listener task reads all incoming datagrams and hands them to the request which
/// registered the datagram's transaction id. Any number of requests can be in flight at the same
/// time. The listener is stopped when the parent cancellation token is cancelled, or when the
/// transport is dropped.
#[derive(Display)]
#[display("{}", inner)]
pub struct UdpTransport {
    inner: Arc<TransportContext>,
}

impl UdpTransport {
    /// Bind a new UDP transport on the given local address and start its listener.
    ///
    /// # Arguments
    ///
    /// * `addr` - The local address to bind to, use port `0` for an ephemeral port.
    /// * `config` - The configuration which provides the retransmission timings.
    /// * `parent` - The token which stops the listener, and fails all requests, once cancelled.
    pub async fn bind(
        addr: SocketAddr,
        config: AnnouncerConfig,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let addr = socket.local_addr()?;
        let inner = Arc::new(TransportContext {
            addr,
            socket,
            pending: Default::default(),
            fatal: Default::default(),
            config,
            cancellation_token: parent.child_token(),
        });

        let inner_main_loop = inner.clone();
        tokio::spawn(async move { inner_main_loop.start().await });

        debug!("Udp transport {} has been started", inner);
        Ok(Self { inner })
    }

    /// Get the local address on which the transport is bound.
    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    /// Send a request to the given tracker address and wait for its response.
    ///
    /// The request is retransmitted with an exponential backoff until a response is received,
    /// or until all attempts have been used.
    ///
    /// # Returns
    ///
    /// It returns the tracker response when one has been received.
    /// It returns [AnnounceError::TrackerFailure] when the tracker responded with an error message,
    /// or [AnnounceError::Timeout] when the tracker didn't respond at all.
    pub async fn send_request<C>(
        &self,
        addr: SocketAddr,
        action: Action,
        connection_id: &C,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> Result<UdpResponse>
    where
        C: ConnectionIdSource + ?Sized,
    {
        if let Some(e) = self.inner.fatal.get() {
            return Err(e);
        }
        if cancel.is_cancelled() || self.inner.cancellation_token.is_cancelled() {
            return Err(AnnounceError::Cancelled);
        }

        let mut request = self.inner.register();
        let max_retransmits = self.inner.config.max_retransmits;
        let mut state = RequestState::Sending { attempt: 0 };

        loop {
            let event = match &state {
                RequestState::Sending { attempt } => {
                    trace!(
                        "Udp transport {} is sending {} request {} (attempt {}) to {}",
                        self,
                        action,
                        request.transaction_id,
                        attempt,
                        addr
                    );
                    self.send(addr, action, connection_id, &request, payload, cancel)
                        .await
                }
                RequestState::AwaitingResponse { attempt } => {
                    self.await_response(&mut request, *attempt, cancel).await
                }
                RequestState::Retrying { attempt } => {
                    debug!(
                        "Udp transport {} is retransmitting {} request {} to {} (attempt {})",
                        self, action, request.transaction_id, addr, attempt
                    );
                    RequestEvent::Retransmit
                }
                RequestState::Succeeded(_) | RequestState::TimedOut | RequestState::Failed(_) => {
                    break;
                }
            };

            state = transition(state, event, max_retransmits);
        }

        match state {
            RequestState::Succeeded(response) => Ok(response),
            RequestState::Failed(e) => Err(e),
            _ => {
                debug!(
                    "Udp transport {} {} request {} to {} timed out",
                    self, action, request.transaction_id, addr
                );
                Err(AnnounceError::Timeout)
            }
        }
    }

    async fn send<C>(
        &self,
        addr: SocketAddr,
        action: Action,
        connection_id: &C,
        request: &PendingRequest<'_>,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> RequestEvent
    where
        C: ConnectionIdSource + ?Sized,
    {
        let connection_id = match connection_id.connection_id(&addr, cancel).await {
            Ok(e) => e,
            Err(AnnounceError::Cancelled) => return RequestEvent::Cancelled,
            Err(e) => return RequestEvent::Error(e),
        };
        let bytes = match encode_request(connection_id, action, request.transaction_id, payload) {
            Ok(e) => e,
            Err(e) => return RequestEvent::Error(AnnounceError::Io(e)),
        };

        select! {
            _ = cancel.cancelled() => RequestEvent::Cancelled,
            _ = self.inner.cancellation_token.cancelled() => RequestEvent::Cancelled,
            result = self.inner.socket.send_to(&bytes, addr) => match result {
                Ok(_) => RequestEvent::Sent,
                Err(e) => RequestEvent::Error(AnnounceError::Io(e)),
            },
        }
    }

    async fn await_response(
        &self,
        request: &mut PendingRequest<'_>,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> RequestEvent {
        let wait = self.inner.config.retransmit_timeout_for(attempt);

        select! {
            _ = cancel.cancelled() => RequestEvent::Cancelled,
            _ = self.inner.cancellation_token.cancelled() => RequestEvent::Cancelled,
            _ = self.inner.fatal.cancelled() => RequestEvent::Error(self.inner.fatal_error()),
            _ = time::sleep(wait) => RequestEvent::Elapsed,
            response = request.receiver.recv() => match response {
                Some(response) => RequestEvent::Received(response),
                None => RequestEvent::Error(self.inner.fatal_error()),
            },
        }
    }

    #[cfg(test)]
    fn context(&self) -> &Arc<TransportContext> {
        &self.inner
    }
}

impl Debug for UdpTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("addr", &self.inner.addr)
            .finish()
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        trace!("Udp transport {} is being dropped", self);
        self.inner.cancellation_token.cancel();
    }
}

/// Write the request header followed by the given payload.
fn encode_request(
    connection_id: u64,
    action: Action,
    transaction_id: u32,
    payload: &[u8],
) -> io::Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(16 + payload.len());

    buffer.write_u64::<BigEndian>(connection_id)?;
    buffer.write_u32::<BigEndian>(action as u32)?;
    buffer.write_u32::<BigEndian>(transaction_id)?;
    buffer.write_all(payload)?;

    Ok(buffer)
}

#[derive(Debug, Display)]
#[display("{}", addr)]
struct TransportContext {
    addr: SocketAddr,
    socket: UdpSocket,
    /// The response senders of the in-flight requests, by transaction id
    pending: Mutex<HashMap<u32, mpsc::Sender<UdpResponse>>>,
    fatal: StickyError,
    config: AnnouncerConfig,
    cancellation_token: CancellationToken,
}

impl TransportContext {
    /// Run the listener of the transport until it's cancelled or the socket fails.
    async fn start(&self) {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            select! {
                _ = self.cancellation_token.cancelled() => break,
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, addr)) => self.handle_datagram(&buffer[..len], addr),
                        Err(e) if is_transient(&e) => {
                            debug!("Udp transport {} failed to read datagram, retrying, {}", self, e);
                            select! {
                                _ = self.cancellation_token.cancelled() => break,
                                _ = time::sleep(TRANSIENT_ERROR_BACKOFF) => {},
                            }
                        }
                        Err(e) => {
                            warn!("Udp transport {} socket failed, {}", self, e);
                            self.fatal.set(e);
                            break;
                        }
                    }
                }
            }
        }

        debug!("Udp transport {} listener ended", self);
    }

    fn handle_datagram(&self, bytes: &[u8], addr: SocketAddr) {
        let response = match UdpResponse::parse(bytes) {
            Ok(e) => e,
            Err(e) => {
                warn!(
                    "Udp transport {} discarded datagram (len {}) from {}, {}",
                    self,
                    bytes.len(),
                    addr,
                    e
                );
                return;
            }
        };

        trace!(
            "Udp transport {} received {} response {} (len {}) from {}",
            self,
            response.action,
            response.transaction_id,
            bytes.len(),
            addr
        );
        let pending = self.lock_pending();
        if let Some(sender) = pending.get(&response.transaction_id) {
            match sender.try_send(response) {
                Ok(_) => {}
                Err(TrySendError::Full(response)) => trace!(
                    "Udp transport {} dropped response {}, waiter is busy",
                    self,
                    response.transaction_id
                ),
                Err(TrySendError::Closed(response)) => trace!(
                    "Udp transport {} dropped response {}, waiter is gone",
                    self,
                    response.transaction_id
                ),
            }
        } else {
            trace!(
                "Udp transport {} received unknown transaction id {}",
                self,
                response.transaction_id
            );
        }
    }

    /// Register a new in-flight request under a transaction id which is not in use.
    fn register(&self) -> PendingRequest<'_> {
        let mut pending = self.lock_pending();
        let (sender, receiver) = mpsc::channel(1);

        let transaction_id = loop {
            let id = rand::random::<u32>();
            if !pending.contains_key(&id) {
                break id;
            }
        };
        pending.insert(transaction_id, sender);

        PendingRequest {
            transaction_id,
            receiver,
            context: self,
        }
    }

    fn fatal_error(&self) -> AnnounceError {
        self.fatal.get().unwrap_or_else(|| {
            AnnounceError::Fatal(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "udp transport listener has stopped",
            ))
        })
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<u32, mpsc::Sender<UdpResponse>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Returns true when the read error doesn't indicate a broken socket.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
    )
}

/// An in-flight request which owns a transaction id of the transport.
/// The transaction id is released when the request is dropped.
#[derive(Debug)]
struct PendingRequest<'a> {
    transaction_id: u32,
    receiver: mpsc::Receiver<UdpResponse>,
    context: &'a TransportContext,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.context.lock_pending().remove(&self.transaction_id);
    }
}

/// The first fatal error of the transport.
/// Once set, the error is permanent and every waiting request is notified.
#[derive(Debug, Default)]
struct StickyError {
    error: Mutex<Option<(io::ErrorKind, String)>>,
    signal: CancellationToken,
}

impl StickyError {
    /// Store the given error if no error has been stored yet.
    /// It returns true when the error has been stored.
    fn set(&self, e: io::Error) -> bool {
        let mut error = self.error.lock().unwrap_or_else(PoisonError::into_inner);
        if error.is_some() {
            return false;
        }

        *error = Some((e.kind(), e.to_string()));
        self.signal.cancel();
        true
    }

    fn get(&self) -> Option<AnnounceError> {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|(kind, message)| AnnounceError::Fatal(io::Error::new(*kind, message.clone())))
    }

    /// Wait for the error to be set.
    async fn cancelled(&self) {
        self.signal.cancelled().await
    }
}
