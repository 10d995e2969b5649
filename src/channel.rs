//! One bound UDP socket per link.
//!
//! The channel owns the datagram socket, the default target address, and
//! the `last_sent`/`last_received` activity clocks the PaceMaker reads.
//! Datagram sends are atomic at the transport layer, so any task may send
//! through a shared channel; receiving is single-owner (the link's receive
//! task).

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;

use crate::error::LinkError;
use crate::messages::{self, Envelope};

/// Send/receive endpoint for one link.
pub struct UdpChannel {
    socket: UdpSocket,
    target: SocketAddr,
    /// Origin for the activity clocks below.
    epoch: Instant,
    /// Milliseconds since `epoch` of the most recent send.
    last_sent_ms: AtomicU64,
    /// Milliseconds since `epoch` of the most recent receive.
    last_received_ms: AtomicU64,
}

impl UdpChannel {
    /// Bind a local endpoint and aim it at `target`.
    pub async fn bind(local: SocketAddr, target: SocketAddr) -> Result<Self, LinkError> {
        let socket = UdpSocket::bind(local).await.map_err(LinkError::SocketBind)?;
        Ok(Self {
            socket,
            target,
            epoch: Instant::now(),
            last_sent_ms: AtomicU64::new(0),
            last_received_ms: AtomicU64::new(0),
        })
    }

    /// The bound local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// The default remote target.
    pub fn target(&self) -> SocketAddr {
        self.target
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Encode and transmit to the default target.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), LinkError> {
        self.send_to(envelope, self.target).await
    }

    /// Encode and transmit to an explicit destination.
    pub async fn send_to(&self, envelope: &Envelope, dest: SocketAddr) -> Result<(), LinkError> {
        let bytes = messages::encode(envelope)?;
        self.socket.send_to(&bytes, dest).await.map_err(LinkError::Transport)?;
        self.last_sent_ms.store(self.now_ms(), Ordering::Relaxed);
        Ok(())
    }

    /// Receive one datagram, recording the arrival time.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let (len, from) = self.socket.recv_from(buf).await?;
        self.last_received_ms.store(self.now_ms(), Ordering::Relaxed);
        Ok((len, from))
    }

    /// Time since the most recent send (or channel creation).
    pub fn since_last_sent(&self) -> Duration {
        let last = self.last_sent_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }

    /// Time since the most recent receive (or channel creation).
    pub fn since_last_received(&self) -> Duration {
        let last = self.last_received_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }
}

impl std::fmt::Debug for UdpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpChannel")
            .field("local", &self.socket.local_addr().ok())
            .field("target", &self.target)
            .finish()
    }
}
