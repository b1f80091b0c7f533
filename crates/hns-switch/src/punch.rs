//! Hole punching: knock datagrams and the widening port sweep.
//!
//! Knocks are single-byte datagrams sent to exact candidate addresses. They
//! only exist to open a NAT mapping; receivers drop them because they are
//! shorter than a header.
//!
//! The port sweep targets NATs that allocate a fresh external port per
//! destination. Each round the window around every candidate grows by
//! `step` ports on both sides, up to `max_offset`, and every port in
//! `[base - window, base + window]` gets a ping. The window goes back to
//! zero once a direct session connects.

use std::net::SocketAddr;

/// The datagram sent by `knock`.
pub const KNOCK: [u8; 1] = [0];

/// Per-host sweep state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortSweep {
    window: u16,
}

impl PortSweep {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn window(&self) -> u16 {
        self.window
    }

    /// Grow the window by `step`, capped at `max_offset`. Returns the new window.
    pub fn advance(&mut self, step: u16, max_offset: u16) -> u16 {
        self.window = self.window.saturating_add(step).min(max_offset);
        self.window
    }

    pub fn reset(&mut self) {
        self.window = 0;
    }
}

/// Every address in `[base - window, base + window]`, clamped to valid
/// ports, nearest ports first.
pub fn sweep_targets(base: SocketAddr, window: u16) -> Vec<SocketAddr> {
    let port = base.port();
    let mut out = Vec::with_capacity(2 * usize::from(window) + 1);
    out.push(base);
    for offset in 1..=window {
        if let Some(up) = port.checked_add(offset) {
            out.push(SocketAddr::new(base.ip(), up));
        }
        match port.checked_sub(offset) {
            Some(down) if down > 0 => out.push(SocketAddr::new(base.ip(), down)),
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([198, 51, 100, 20], port))
    }

    #[test]
    fn window_grows_by_step_and_caps() {
        let mut sweep = PortSweep::new();
        assert_eq!(sweep.window(), 0);
        assert_eq!(sweep.advance(2, 5), 2);
        assert_eq!(sweep.advance(2, 5), 4);
        assert_eq!(sweep.advance(2, 5), 5);
        assert_eq!(sweep.advance(2, 5), 5);
        sweep.reset();
        assert_eq!(sweep.window(), 0);
    }

    #[test]
    fn targets_cover_symmetric_window() {
        let targets = sweep_targets(addr(40000), 2);
        assert_eq!(
            targets,
            vec![addr(40000), addr(40001), addr(39999), addr(40002), addr(39998)]
        );
    }

    #[test]
    fn zero_window_is_just_the_base() {
        assert_eq!(sweep_targets(addr(5000), 0), vec![addr(5000)]);
    }

    #[test]
    fn targets_clamp_at_port_edges() {
        let high = sweep_targets(addr(65534), 3);
        assert!(high.iter().all(|a| a.port() >= 65531));
        assert_eq!(high.len(), 5);

        let low = sweep_targets(addr(2), 3);
        assert!(low.iter().all(|a| a.port() > 0));
        assert_eq!(low.len(), 5);
    }
}
