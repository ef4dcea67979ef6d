//! Connectionless frame transmission
//!
//! A frame is pushed to the destination with [`send_all`], which keeps offering
//! the unsent tail until the transport has accepted every byte. [`Transmitter`]
//! owns the outbound channel and decides what happens after a fatal error.

use serde::{Deserialize, Serialize};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Largest UDP payload over IPv4
pub const MAX_UDP_PAYLOAD: usize = 65_507;

const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum SendError {
    #[error("send to {dest} failed: {source}")]
    Fatal {
        dest: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to open socket: {0}")]
    Connect(#[source] io::Error),
}

/// An unconnected datagram channel
pub trait DatagramSocket {
    fn send_to(&mut self, buf: &[u8], dest: SocketAddr) -> io::Result<usize>;
}

impl DatagramSocket for UdpSocket {
    fn send_to(&mut self, buf: &[u8], dest: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, dest)
    }
}

/// Opens datagram channels, initially and after a fatal error
pub trait Connect {
    type Socket: DatagramSocket;

    fn connect(&mut self) -> io::Result<Self::Socket>;
}

/// Binds an IPv4 UDP socket on all interfaces
#[derive(Debug, Clone)]
pub struct UdpConnector {
    local_port: u16,
    nonblocking: bool,
}

impl UdpConnector {
    pub fn new(local_port: u16, nonblocking: bool) -> Self {
        Self {
            local_port,
            nonblocking,
        }
    }
}

impl Connect for UdpConnector {
    type Socket = UdpSocket;

    fn connect(&mut self) -> io::Result<UdpSocket> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.local_port))?;
        socket.set_nonblocking(self.nonblocking)?;
        debug!(local = %socket.local_addr()?, nonblocking = %self.nonblocking, "UDP socket bound");
        Ok(socket)
    }
}

/// Result of one successful [`send_all`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendReport {
    pub bytes: usize,
    pub datagrams: u32,
    pub retries: u32,
}

impl SendReport {
    // Busy retries are unbounded, so the counters saturate
    fn retried(&mut self) {
        self.retries = self.retries.saturating_add(1);
    }

    fn accepted(&mut self, bytes: usize) {
        self.bytes += bytes;
        self.datagrams = self.datagrams.saturating_add(1);
    }
}

/// Busy transport, try again
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Sends `payload` to `dest`, at most `max_datagram` bytes per send, until the
/// transport has accepted all of it.
///
/// Short sends advance the offset; transient errors and zero-byte sends are
/// retried without limit. Any other error is returned as is.
pub fn send_all<S: DatagramSocket + ?Sized>(
    socket: &mut S,
    dest: SocketAddr,
    payload: &[u8],
    max_datagram: usize,
) -> io::Result<SendReport> {
    let max_datagram = max_datagram.max(1);
    let mut report = SendReport::default();

    while report.bytes < payload.len() {
        let end = payload.len().min(report.bytes.saturating_add(max_datagram));

        match socket.send_to(&payload[report.bytes..end], dest) {
            Ok(0) => {
                report.retried();
                thread::yield_now();
            }
            Ok(n) => report.accepted(n.min(end - report.bytes)),
            Err(e) if is_transient(&e) => {
                report.retried();
                thread::yield_now();
            }
            Err(e) => return Err(e),
        }
    }

    Ok(report)
}

/// What the loop does once the channel has failed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SendFailurePolicy {
    /// Close the channel and keep capturing; later frames are dropped
    #[default]
    DropFrames,
    /// Close the channel, then reopen it with bounded exponential backoff
    Reconnect,
    /// Stop capturing
    Abort,
}

#[derive(Debug, Clone)]
pub struct TransmitterOptions {
    pub max_datagram_size: usize,
    pub policy: SendFailurePolicy,
    pub reconnect_attempts: u32,
    pub reconnect_backoff: Duration,
}

impl Default for TransmitterOptions {
    fn default() -> Self {
        Self {
            max_datagram_size: MAX_UDP_PAYLOAD,
            policy: SendFailurePolicy::default(),
            reconnect_attempts: 5,
            reconnect_backoff: Duration::from_millis(500),
        }
    }
}

/// Outcome of handing one frame to the [`Transmitter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transmission {
    Sent {
        report: SendReport,
        reconnected: bool,
    },
    /// The channel is closed, the frame was not sent
    Dropped,
}

#[derive(Debug, Default)]
struct Reconnect {
    attempts: u32,
    not_before: Option<Instant>,
    exhausted: bool,
}

/// Sends frames to one fixed destination over a channel it owns
pub struct Transmitter<C: Connect> {
    connector: C,
    socket: Option<C::Socket>,
    dest: SocketAddr,
    options: TransmitterOptions,
    reconnect: Reconnect,
}

impl<C: Connect> std::fmt::Debug for Transmitter<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transmitter")
            .field("dest", &self.dest)
            .field("open", &self.socket.is_some())
            .field("options", &self.options)
            .field("reconnect", &self.reconnect)
            .finish_non_exhaustive()
    }
}

impl<C: Connect> Transmitter<C> {
    /// Opens the channel
    pub fn connect(
        mut connector: C,
        dest: SocketAddr,
        options: TransmitterOptions,
    ) -> Result<Self, SendError> {
        let socket = connector.connect().map_err(SendError::Connect)?;

        info!(
            dest = %dest,
            max_datagram = %options.max_datagram_size,
            policy = ?options.policy,
            "Transmitter ready"
        );

        Ok(Self {
            connector,
            socket: Some(socket),
            dest,
            options,
            reconnect: Reconnect::default(),
        })
    }

    pub fn destination(&self) -> SocketAddr {
        self.dest
    }

    pub fn policy(&self) -> SendFailurePolicy {
        self.options.policy
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    /// Drops the channel; frames are dropped until it is reopened
    pub fn close(&mut self) {
        if self.socket.take().is_some() {
            info!(dest = %self.dest, "Transmission channel closed");
        }
    }

    /// Sends one frame payload.
    ///
    /// A fatal error closes the channel before it is returned.
    pub fn transmit(&mut self, payload: &[u8]) -> Result<Transmission, SendError> {
        let reconnected = self.reopen_if_due();

        let Some(socket) = self.socket.as_mut() else {
            debug!(bytes = %payload.len(), "Channel closed, dropping frame");
            return Ok(Transmission::Dropped);
        };

        match send_all(socket, self.dest, payload, self.options.max_datagram_size) {
            Ok(report) => {
                self.reconnect.attempts = 0;
                Ok(Transmission::Sent {
                    report,
                    reconnected,
                })
            }
            Err(source) => {
                error!(dest = %self.dest, error = %source, "sendto error");
                self.close();
                self.schedule_reconnect();
                Err(SendError::Fatal {
                    dest: self.dest,
                    source,
                })
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.options.policy != SendFailurePolicy::Reconnect || self.reconnect.exhausted {
            return;
        }

        let exponent = self.reconnect.attempts.min(16);
        let backoff = self
            .options
            .reconnect_backoff
            .saturating_mul(1u32 << exponent)
            .min(MAX_RECONNECT_BACKOFF);
        self.reconnect.not_before = Some(Instant::now() + backoff);
        debug!(backoff_ms = %backoff.as_millis(), "Reconnect scheduled");
    }

    fn reopen_if_due(&mut self) -> bool {
        if self.socket.is_some()
            || self.options.policy != SendFailurePolicy::Reconnect
            || self.reconnect.exhausted
        {
            return false;
        }

        if let Some(not_before) = self.reconnect.not_before {
            if Instant::now() < not_before {
                return false;
            }
        }

        if self.reconnect.attempts >= self.options.reconnect_attempts {
            warn!(
                dest = %self.dest,
                attempts = %self.reconnect.attempts,
                "Giving up on reconnecting, frames will be dropped"
            );
            self.reconnect.exhausted = true;
            return false;
        }

        self.reconnect.attempts += 1;

        match self.connector.connect() {
            Ok(socket) => {
                info!(
                    dest = %self.dest,
                    attempt = %self.reconnect.attempts,
                    "Transmission channel reopened"
                );
                self.socket = Some(socket);
                true
            }
            Err(e) => {
                warn!(
                    error = %e,
                    attempt = %self.reconnect.attempts,
                    "Failed to reopen transmission channel"
                );
                self.schedule_reconnect();
                false
            }
        }
    }
}
