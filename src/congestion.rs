//! Brutal congestion control.
//!
//! Instead of inferring capacity from loss, the sender paces at a reference
//! rate that is known up front (configured or negotiated with the server).
//! Loss is sampled over a sliding window of one-second slots:
//!
//! - with too few samples, loss is treated as link noise and ignored
//! - while the loss ratio stays within [`LOSS_TOLERANCE`] the rate is raised
//!   by `1 / ack_rate` so the delivered goodput still reaches the reference
//! - once sustained loss exceeds the tolerance the rate backs off below the
//!   reference, proportionally to the ack rate

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use quinn_proto::congestion::{Controller, ControllerFactory};
use quinn_proto::RttEstimator;

/// Number of one-second sampling slots.
pub const SLOT_COUNT: usize = 5;

/// Below this many samples the ack rate is assumed to be 1.0.
pub const MIN_SAMPLE_COUNT: u64 = 50;

/// Loss ratio that is still considered link noise.
pub const LOSS_TOLERANCE: f64 = 0.2;

/// Smallest congestion window ever reported, in bytes.
pub const MIN_WINDOW: u64 = 10240;

/// RTT assumed before the first sample arrives.
pub const INITIAL_RTT: Duration = Duration::from_millis(100);

/// Shared reference bandwidth, in bytes per second.
///
/// quinn fixes the controller when the connection is created, so the
/// negotiated rate is delivered through this handle after the handshake.
#[derive(Debug, Clone, Default)]
pub struct BandwidthHandle(Arc<AtomicU64>);

impl BandwidthHandle {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self(Arc::new(AtomicU64::new(bytes_per_sec)))
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, bytes_per_sec: u64) {
        self.0.store(bytes_per_sec, Ordering::Relaxed);
    }
}

/// Converts bits per second to bytes per second.
pub fn bps_to_bytes(bps: u64) -> u64 {
    bps / 8
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    /// Second (since controller epoch) this slot currently holds.
    second: u64,
    acked: u64,
    lost: u64,
}

/// Loss/ack bookkeeping and rate computation, independent of quinn's types.
#[derive(Debug, Clone)]
pub struct BrutalState {
    epoch: Instant,
    slots: [Slot; SLOT_COUNT],
    smoothed_rtt: Option<Duration>,
    in_flight: u64,
}

impl BrutalState {
    pub fn new(now: Instant) -> Self {
        Self {
            epoch: now,
            slots: [Slot::default(); SLOT_COUNT],
            smoothed_rtt: None,
            in_flight: 0,
        }
    }

    fn second(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_secs()
    }

    fn slot_mut(&mut self, now: Instant) -> &mut Slot {
        let second = self.second(now);
        let slot = &mut self.slots[(second % SLOT_COUNT as u64) as usize];
        if slot.second != second {
            *slot = Slot {
                second,
                ..Slot::default()
            };
        }
        slot
    }

    pub fn record_ack(&mut self, now: Instant, packets: u64) {
        self.slot_mut(now).acked += packets;
    }

    pub fn record_loss(&mut self, now: Instant, packets: u64) {
        self.slot_mut(now).lost += packets;
    }

    pub fn set_rtt(&mut self, rtt: Duration) {
        self.smoothed_rtt = Some(rtt);
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.smoothed_rtt
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight
    }

    /// Fraction of packets acknowledged over the live slots.
    pub fn ack_rate(&self, now: Instant) -> f64 {
        let current = self.second(now);
        let (acked, lost) = self
            .slots
            .iter()
            .filter(|s| current.saturating_sub(s.second) < SLOT_COUNT as u64)
            .fold((0u64, 0u64), |(a, l), s| (a + s.acked, l + s.lost));

        let total = acked + lost;
        if total < MIN_SAMPLE_COUNT {
            return 1.0;
        }
        acked as f64 / total as f64
    }

    /// Pacing rate in bytes per second for a reference rate `reference`.
    pub fn pacing_rate(&self, now: Instant, reference: u64) -> u64 {
        let ack_rate = self.ack_rate(now);
        let loss = 1.0 - ack_rate;
        let rate = if loss > LOSS_TOLERANCE {
            reference as f64 * ack_rate / (1.0 - LOSS_TOLERANCE)
        } else {
            reference as f64 / ack_rate
        };
        rate as u64
    }

    /// Congestion window in bytes for a reference rate `reference`.
    ///
    /// quinn derives its send pace from `window / srtt`, so the window is
    /// exactly one pacing-rate-sized bandwidth-delay product.
    pub fn window(&self, now: Instant, reference: u64) -> u64 {
        let rtt = self.smoothed_rtt.unwrap_or(INITIAL_RTT);
        let rate = self.pacing_rate(now, reference) as f64;
        let window = (rate * rtt.as_secs_f64()) as u64;
        window.max(MIN_WINDOW)
    }
}

/// quinn congestion controller driven by [`BrutalState`].
#[derive(Debug, Clone)]
pub struct BrutalController {
    bandwidth: BandwidthHandle,
    state: BrutalState,
    mtu: u16,
    // quinn queries `window()` without a timestamp.
    last_event: Instant,
}

impl BrutalController {
    pub fn new(bandwidth: BandwidthHandle, now: Instant, mtu: u16) -> Self {
        Self {
            bandwidth,
            state: BrutalState::new(now),
            mtu,
            last_event: now,
        }
    }

    pub fn state(&self) -> &BrutalState {
        &self.state
    }

    /// Current pacing rate in bytes per second.
    pub fn pacing_rate(&self) -> u64 {
        self.state.pacing_rate(self.last_event, self.bandwidth.get())
    }

    fn packets(&self, bytes: u64) -> u64 {
        bytes.div_ceil(u64::from(self.mtu.max(1))).max(1)
    }
}

impl Controller for BrutalController {
    fn on_sent(&mut self, now: Instant, bytes: u64, _last_packet_number: u64) {
        self.last_event = now;
        self.state.in_flight += bytes;
    }

    fn on_ack(
        &mut self,
        now: Instant,
        _sent: Instant,
        _bytes: u64,
        _app_limited: bool,
        rtt: &RttEstimator,
    ) {
        self.last_event = now;
        self.state.set_rtt(rtt.get());
        self.state.record_ack(now, 1);
    }

    fn on_end_acks(
        &mut self,
        now: Instant,
        in_flight: u64,
        _app_limited: bool,
        _largest_packet_num_acked: Option<u64>,
    ) {
        self.last_event = now;
        self.state.in_flight = in_flight;
    }

    fn on_congestion_event(
        &mut self,
        now: Instant,
        _sent: Instant,
        _is_persistent_congestion: bool,
        lost_bytes: u64,
    ) {
        self.last_event = now;
        let packets = self.packets(lost_bytes);
        self.state.record_loss(now, packets);
        self.state.in_flight = self.state.in_flight.saturating_sub(lost_bytes);
        tracing::trace!(
            lost_bytes,
            ack_rate = self.state.ack_rate(now),
            "congestion event"
        );
    }

    fn on_mtu_update(&mut self, new_mtu: u16) {
        self.mtu = new_mtu;
    }

    fn window(&self) -> u64 {
        self.state.window(self.last_event, self.bandwidth.get())
    }

    fn clone_box(&self) -> Box<dyn Controller> {
        Box::new(self.clone())
    }

    fn initial_window(&self) -> u64 {
        BrutalState::new(self.last_event).window(self.last_event, self.bandwidth.get())
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Builds a [`BrutalController`] per connection, all sharing one bandwidth handle.
#[derive(Debug, Clone, Default)]
pub struct BrutalConfig {
    bandwidth: BandwidthHandle,
}

impl BrutalConfig {
    pub fn new(bandwidth: BandwidthHandle) -> Self {
        Self { bandwidth }
    }

    pub fn bandwidth(&self) -> &BandwidthHandle {
        &self.bandwidth
    }
}

impl ControllerFactory for BrutalConfig {
    fn build(self: Arc<Self>, now: Instant, current_mtu: u16) -> Box<dyn Controller> {
        Box::new(BrutalController::new(
            self.bandwidth.clone(),
            now,
            current_mtu,
        ))
    }
}

/// Strategy for creating the congestion controller of a session.
///
/// The factory receives the shared bandwidth handle that the client seeds
/// with the claimed rate and later with the negotiated one.
pub trait CongestionFactory: Send + Sync {
    fn controller_factory(
        &self,
        bandwidth: BandwidthHandle,
    ) -> Arc<dyn ControllerFactory + Send + Sync>;
}

/// Default factory: the Brutal controller.
#[derive(Debug, Clone, Copy, Default)]
pub struct Brutal;

impl CongestionFactory for Brutal {
    fn controller_factory(
        &self,
        bandwidth: BandwidthHandle,
    ) -> Arc<dyn ControllerFactory + Send + Sync> {
        Arc::new(BrutalConfig::new(bandwidth))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REFERENCE: u64 = 12_500_000; // 100 Mbps

    #[test]
    fn test_no_loss_paces_at_reference() {
        let now = Instant::now();
        let mut state = BrutalState::new(now);
        state.record_ack(now, 1000);
        assert_eq!(state.pacing_rate(now, REFERENCE), REFERENCE);
    }

    #[test]
    fn test_isolated_loss_is_ignored() {
        let now = Instant::now();
        let mut state = BrutalState::new(now);
        // Fewer samples than the minimum: even 100% loss is noise.
        state.record_loss(now, 10);
        assert_eq!(state.ack_rate(now), 1.0);
        assert_eq!(state.pacing_rate(now, REFERENCE), REFERENCE);
    }

    #[test]
    fn test_loss_within_tolerance_does_not_drop_below_reference() {
        let now = Instant::now();
        let mut state = BrutalState::new(now);
        state.record_ack(now, 900);
        state.record_loss(now, 100);
        let rate = state.pacing_rate(now, REFERENCE);
        assert!(rate >= REFERENCE, "rate {} below reference", rate);
        // 10% loss is compensated: R / 0.9
        assert!(rate <= REFERENCE * 12 / 10);
    }

    #[test]
    fn test_sustained_loss_reduces_rate() {
        let start = Instant::now();
        let mut state = BrutalState::new(start);
        for sec in 0..SLOT_COUNT as u64 {
            let t = start + Duration::from_secs(sec);
            state.record_ack(t, 50);
            state.record_loss(t, 50);
        }
        let now = start + Duration::from_secs(SLOT_COUNT as u64 - 1);
        assert!(state.ack_rate(now) < 1.0 - LOSS_TOLERANCE);
        assert!(state.pacing_rate(now, REFERENCE) < REFERENCE);
    }

    #[test]
    fn test_old_slots_expire() {
        let start = Instant::now();
        let mut state = BrutalState::new(start);
        state.record_ack(start, 10);
        state.record_loss(start, 200);
        let later = start + Duration::from_secs(SLOT_COUNT as u64 + 1);
        state.record_ack(later, 100);
        assert_eq!(state.ack_rate(later), 1.0);
        assert_eq!(state.pacing_rate(later, REFERENCE), REFERENCE);
    }

    #[test]
    fn test_window_follows_rtt() {
        let now = Instant::now();
        let mut state = BrutalState::new(now);
        state.set_rtt(Duration::from_millis(50));
        let window = state.window(now, REFERENCE);
        let expected = (REFERENCE as f64 * 0.05) as u64;
        assert_eq!(window, expected);
    }

    #[test]
    fn test_window_over_rtt_matches_pacing_rate() {
        let start = Instant::now();
        let mut state = BrutalState::new(start);
        let rtt = Duration::from_millis(200);
        state.set_rtt(rtt);

        let check = |state: &BrutalState, now: Instant| {
            let pacing = state.pacing_rate(now, REFERENCE) as f64;
            let sent = state.window(now, REFERENCE) as f64 / rtt.as_secs_f64();
            let ratio = sent / pacing;
            assert!((0.99..=1.01).contains(&ratio), "window/rtt is {ratio:.2}x pacing");
        };

        check(&state, start);

        // Loss within tolerance raises the pacing rate; the window follows.
        state.record_ack(start, 900);
        state.record_loss(start, 100);
        assert!(state.pacing_rate(start, REFERENCE) > REFERENCE);
        check(&state, start);

        // Sustained loss backs off; the window follows down.
        state.record_loss(start, 2000);
        assert!(state.pacing_rate(start, REFERENCE) < REFERENCE);
        check(&state, start);
    }

    #[test]
    fn test_window_floor() {
        let now = Instant::now();
        let state = BrutalState::new(now);
        assert_eq!(state.window(now, 0), MIN_WINDOW);
    }

    #[test]
    fn test_controller_isolated_loss_keeps_window() {
        let now = Instant::now();
        let bandwidth = BandwidthHandle::new(REFERENCE);
        let mut controller = BrutalController::new(bandwidth, now, 1200);
        let before = controller.window();
        for _ in 0..3 {
            controller.on_congestion_event(now, now, false, 1200);
        }
        assert_eq!(controller.window(), before);
        assert_eq!(controller.pacing_rate(), REFERENCE);
    }

    #[test]
    fn test_controller_tracks_in_flight() {
        let now = Instant::now();
        let mut controller = BrutalController::new(BandwidthHandle::new(REFERENCE), now, 1200);
        controller.on_sent(now, 1200, 1);
        controller.on_sent(now, 1200, 2);
        assert_eq!(controller.state().in_flight(), 2400);
        controller.on_congestion_event(now, now, false, 1200);
        assert_eq!(controller.state().in_flight(), 1200);
        controller.on_end_acks(now, 0, false, Some(2));
        assert_eq!(controller.state().in_flight(), 0);
    }

    #[test]
    fn test_bandwidth_handle_reseeds_controller() {
        let now = Instant::now();
        let bandwidth = BandwidthHandle::new(1_000_000);
        let factory = Arc::new(BrutalConfig::new(bandwidth.clone()));
        let controller = factory.build(now, 1200);
        let before = controller.window();
        bandwidth.set(10_000_000);
        assert!(controller.window() > before);
    }

    #[test]
    fn test_bps_to_bytes() {
        assert_eq!(bps_to_bytes(100_000_000), 12_500_000);
    }
}
