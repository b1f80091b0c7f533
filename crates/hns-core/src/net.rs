//! Datagram output and clock helpers shared by the relay and the switch.
//!
//! Protocol cores never own a socket. They hand finished datagrams to a
//! `DatagramSink`, which lets the runtimes plug in a tokio socket and tests
//! plug in a `RecordingSink`.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

/// Anything that can put a datagram on the wire without blocking.
pub trait DatagramSink: Send + Sync {
    fn send_datagram(&self, datagram: &[u8], to: SocketAddr) -> io::Result<()>;
}

impl DatagramSink for tokio::net::UdpSocket {
    fn send_datagram(&self, datagram: &[u8], to: SocketAddr) -> io::Result<()> {
        self.try_send_to(datagram, to).map(|_| ())
    }
}

/// Send and log on failure. A failed send abandons the datagram.
pub fn send_or_log(sink: &dyn DatagramSink, datagram: &[u8], to: SocketAddr) -> bool {
    match sink.send_datagram(datagram, to) {
        Ok(()) => {
            tracing::trace!(%to, len = datagram.len(), "datagram sent");
            true
        }
        Err(e) => {
            tracing::warn!(error = %e, %to, "datagram send failed");
            false
        }
    }
}

/// Captures every datagram instead of sending it.
#[derive(Debug, Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything recorded so far.
    pub fn take(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of recorded datagrams addressed to `to`.
    pub fn count_to(&self, to: SocketAddr) -> usize {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(addr, _)| *addr == to)
            .count()
    }
}

impl DatagramSink for RecordingSink {
    fn send_datagram(&self, datagram: &[u8], to: SocketAddr) -> io::Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((to, datagram.to_vec()));
        Ok(())
    }
}

/// Local IP the OS routes through to reach `toward`. Connecting a UDP
/// socket only selects a route; nothing is sent.
pub fn route_source_ip(toward: SocketAddr) -> io::Result<IpAddr> {
    let any: IpAddr = if toward.is_ipv4() {
        Ipv4Addr::UNSPECIFIED.into()
    } else {
        Ipv6Addr::UNSPECIFIED.into()
    };
    let socket = std::net::UdpSocket::bind((any, 0))?;
    socket.connect(toward)?;
    Ok(socket.local_addr()?.ip())
}

/// Wall-clock milliseconds since the Unix epoch. Used for on-wire timestamps.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_counts_per_destination() {
        let sink = RecordingSink::new();
        let a: SocketAddr = "127.0.0.1:1000".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:2000".parse().unwrap();
        assert!(send_or_log(&sink, b"x", a));
        assert!(send_or_log(&sink, b"y", a));
        assert!(send_or_log(&sink, b"z", b));
        assert_eq!(sink.count_to(a), 2);
        assert_eq!(sink.count_to(b), 1);
        assert_eq!(sink.take().len(), 3);
        assert!(sink.is_empty());
    }

    #[test]
    fn loopback_routes_through_loopback() {
        let ip = route_source_ip("127.0.0.1:9".parse().unwrap()).unwrap();
        assert!(ip.is_loopback());
    }

    #[test]
    fn unix_millis_is_after_2020() {
        assert!(unix_millis() > 1_577_836_800_000);
    }
}
