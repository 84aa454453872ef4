// SPDX-FileCopyrightText: © 2025 RtmpKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Per-connection and per-stream byte/Kbps accounting.
//!
//! Ported from `examples/original_source/protocol_kbps.cpp`: four fixed
//! sliding windows (30s/1m/5m/60m), each resampled on demand rather than by
//! a background timer. [`NetworkDelta`] and [`EphemeralDelta`] let many byte
//! sources (a socket's cumulative counters, an explicit add-only counter)
//! feed one aggregated [`Kbps`].

use std::time::{Duration, Instant};

/// One of the four fixed sampling windows tracked by [`Kbps`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Window {
    Secs30,
    Min1,
    Min5,
    Min60,
}

impl Window {
    const ALL: [Self; 4] = [Self::Secs30, Self::Min1, Self::Min5, Self::Min60];

    const fn duration(self) -> Duration {
        match self {
            Self::Secs30 => Duration::from_secs(30),
            Self::Min1 => Duration::from_secs(60),
            Self::Min5 => Duration::from_secs(5 * 60),
            Self::Min60 => Duration::from_secs(60 * 60),
        }
    }
}

/// State for one sliding window: the byte/time baseline it was last reset
/// from, and the kbps value computed as of that reset.
#[derive(Debug, Clone, Copy)]
struct RateSample {
    window_start: Instant,
    window_start_bytes: u64,
    current_rate_kbps: i32,
}

impl RateSample {
    fn new(now: Instant, bytes: u64) -> Self {
        Self { window_start: now, window_start_bytes: bytes, current_rate_kbps: 0 }
    }

    /// Resamples if `window` has elapsed since the last reset; otherwise
    /// returns the held-over rate from the last reset.
    fn sample(&mut self, window: Duration, now: Instant, total_bytes: u64) -> i32 {
        let elapsed = now.duration_since(self.window_start);
        if elapsed >= window {
            let elapsed_ms = elapsed.as_millis().max(1) as u64;
            let delta_bytes = total_bytes.saturating_sub(self.window_start_bytes);
            self.current_rate_kbps = ((delta_bytes * 8) / elapsed_ms) as i32;
            self.window_start = now;
            self.window_start_bytes = total_bytes;
        }
        self.current_rate_kbps
    }
}

/// Cumulative byte counters plus the four sliding-window samples, for one
/// direction (send or recv).
#[derive(Debug, Clone)]
struct Direction {
    total_bytes: u64,
    samples: [RateSample; 4],
}

impl Direction {
    fn new(now: Instant) -> Self {
        Self { total_bytes: 0, samples: [RateSample::new(now, 0); 4] }
    }

    fn add(&mut self, bytes: u64) {
        self.total_bytes += bytes;
    }

    fn kbps(&mut self, window: Window, now: Instant) -> i32 {
        let idx = Window::ALL.iter().position(|w| *w == window).expect("exhaustive Window::ALL");
        self.samples[idx].sample(window.duration(), now, self.total_bytes)
    }
}

/// A per-connection or per-stream send/recv Kbps accumulator sampling four
/// fixed windows on demand (no background thread).
#[derive(Debug, Clone)]
pub struct Kbps {
    send: Direction,
    recv: Direction,
}

impl Kbps {
    #[must_use]
    pub fn new() -> Self {
        let now = Instant::now();
        Self { send: Direction::new(now), recv: Direction::new(now) }
    }

    pub fn add_send(&mut self, bytes: u64) {
        self.send.add(bytes);
    }

    pub fn add_recv(&mut self, bytes: u64) {
        self.recv.add(bytes);
    }

    #[must_use]
    pub fn send_bytes(&self) -> u64 {
        self.send.total_bytes
    }

    #[must_use]
    pub fn recv_bytes(&self) -> u64 {
        self.recv.total_bytes
    }

    pub fn send_kbps(&mut self, window: Window) -> i32 {
        self.send.kbps(window, Instant::now())
    }

    pub fn recv_kbps(&mut self, window: Window) -> i32 {
        self.recv.kbps(window, Instant::now())
    }
}

impl Default for Kbps {
    fn default() -> Self {
        Self::new()
    }
}

/// Wraps a transport's cumulative send/recv counters and produces
/// `(in_delta, out_delta)` on sample, so a `Kbps` can be fed without the
/// transport itself knowing about windows.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkDelta {
    last_in: u64,
    last_out: u64,
}

impl NetworkDelta {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Given the transport's current cumulative `(in, out)` totals, returns
    /// the `(in_delta, out_delta)` since the last call and updates the
    /// baseline. A transport switch (the totals reset lower than the
    /// baseline) is treated as a fresh baseline rather than a negative delta.
    pub fn sample(&mut self, cumulative_in: u64, cumulative_out: u64) -> (u64, u64) {
        let in_delta = cumulative_in.checked_sub(self.last_in).unwrap_or(cumulative_in);
        let out_delta = cumulative_out.checked_sub(self.last_out).unwrap_or(cumulative_out);
        self.last_in = cumulative_in;
        self.last_out = cumulative_out;
        (in_delta, out_delta)
    }
}

/// An explicit add-only counter drained on `remark`, for byte sources with
/// no natural cumulative counter of their own (e.g. bytes written by an
/// HTTP egress transmuxer).
#[derive(Debug, Clone, Copy, Default)]
pub struct EphemeralDelta {
    pending: u64,
}

impl EphemeralDelta {
    pub fn add(&mut self, bytes: u64) {
        self.pending += bytes;
    }

    /// Drains and returns the accumulated bytes since the last remark.
    pub fn remark(&mut self) -> u64 {
        std::mem::take(&mut self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kbps_holds_until_window_elapses() {
        let mut k = Kbps::new();
        k.add_recv(1000);
        // Window hasn't elapsed yet: rate stays at its initial 0.
        assert_eq!(k.recv_kbps(Window::Secs30), 0);
    }

    #[test]
    fn test_network_delta_basic() {
        let mut d = NetworkDelta::new();
        assert_eq!(d.sample(100, 50), (100, 50));
        assert_eq!(d.sample(150, 80), (50, 30));
    }

    #[test]
    fn test_network_delta_switch_resets_baseline() {
        let mut d = NetworkDelta::new();
        let _ = d.sample(1000, 1000);
        // Transport switched; new transport starts its own counters lower.
        let (in_delta, out_delta) = d.sample(10, 5);
        assert_eq!((in_delta, out_delta), (10, 5));
    }

    #[test]
    fn test_ephemeral_delta_remark_drains() {
        let mut e = EphemeralDelta::default();
        e.add(10);
        e.add(5);
        assert_eq!(e.remark(), 15);
        assert_eq!(e.remark(), 0);
    }

    #[test]
    fn test_cumulative_totals_track_all_adds() {
        let mut k = Kbps::new();
        k.add_send(10);
        k.add_send(20);
        k.add_recv(5);
        assert_eq!(k.send_bytes(), 30);
        assert_eq!(k.recv_bytes(), 5);
    }
}
