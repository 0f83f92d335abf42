use std::{
    io,
    net::{SocketAddr, ToSocketAddrs, UdpSocket},
    time::{Duration, Instant},
};

use crate::{MotionAlarmError, Result};

/// Best-effort, fire-and-forget message channel for motion alerts.
pub trait EventTransport {
    fn send(&mut self, payload: &[u8]) -> io::Result<()>;

    /// Releases the underlying channel. Later sends fail.
    fn close(&mut self) {}
}

/// Datagram transport to a fixed listener. The socket is non-blocking so a
/// send never stalls the frame loop.
#[derive(Debug)]
pub struct UdpTransport {
    socket: Option<UdpSocket>,
    target: SocketAddr,
}

impl UdpTransport {
    pub fn connect(target: &str) -> Result<Self> {
        let target = target
            .to_socket_addrs()
            .map_err(|err| MotionAlarmError::msg(format!("invalid event target `{target}`: {err}")))?
            .next()
            .ok_or_else(|| MotionAlarmError::msg(format!("event target `{target}` did not resolve")))?;

        let bind: SocketAddr = if target.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind)?;
        socket.set_nonblocking(true)?;
        socket.connect(target)?;

        Ok(Self {
            socket: Some(socket),
            target,
        })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

impl EventTransport for UdpTransport {
    fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        match &self.socket {
            Some(socket) => socket.send(payload).map(|_| ()),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "event transport closed",
            )),
        }
    }

    fn close(&mut self) {
        self.socket = None;
    }
}

/// Rate limiter in front of an [`EventTransport`].
///
/// Two accepted sends are never closer than the cooldown; the first send
/// after startup is always accepted.
#[derive(Debug, Clone)]
pub struct EventThrottle {
    cooldown: Duration,
    last_sent: Option<Instant>,
    accepted: u64,
}

impl EventThrottle {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_sent: None,
            accepted: 0,
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn last_sent(&self) -> Option<Instant> {
        self.last_sent
    }

    /// Number of sends accepted so far.
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Sends `message` if the cooldown has elapsed. A failed send still
    /// counts as sent.
    pub fn try_emit<T: EventTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        message: &[u8],
        now: Instant,
    ) -> bool {
        if let Some(last) = self.last_sent {
            if now.saturating_duration_since(last) < self.cooldown {
                return false;
            }
        }

        if let Err(err) = transport.send(message) {
            tracing::debug!(error = %err, "motion event send failed; ignoring");
        }
        self.last_sent = Some(now);
        self.accepted += 1;
        true
    }
}
