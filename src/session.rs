//! Session state machine for one BMS connection.
//!
//! A [`Monitor`] owns exactly one device connection at a time and drives
//! the scan, connect, wake, periodic-read, reconnect lifecycle on a single
//! recurring timer. Consumers subscribe to an outbound event stream;
//! status queries receive immutable snapshots. The session task is the
//! only writer of the session state.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::client::BmsClient;
use crate::error::Result;
use crate::protocol::RegisterMap;
use crate::reading::Reading;
use crate::transport::BleTransport;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Capacity of the outbound event channel. Slow subscribers lag rather
/// than growing an unbounded listener queue.
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum SessionPhase {
    Disconnected,
    Connecting,
    Connected,
    Waking,
    Reading,
    Reconnecting,
    Error,
}

impl SessionPhase {
    pub const fn is_connected(&self) -> bool {
        matches!(
            self,
            SessionPhase::Connected | SessionPhase::Waking | SessionPhase::Reading
        )
    }
}

/// Read/error counters for the lifetime of the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SessionStats {
    pub read_count: u64,
    pub error_count: u64,
}

impl SessionStats {
    /// Percentage of read cycles that produced a reading.
    pub fn success_rate(&self) -> f64 {
        let total = self.read_count + self.error_count;
        if total == 0 {
            return 0.0;
        }
        self.read_count as f64 / total as f64 * 100.0
    }
}

/// Immutable snapshot of the session state.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SessionStatus {
    pub phase: SessionPhase,
    pub read_count: u64,
    pub error_count: u64,
    pub last_read_at: Option<DateTime<Utc>>,
    pub device_address: Option<String>,
}

impl SessionStatus {
    fn idle() -> Self {
        Self {
            phase: SessionPhase::Disconnected,
            read_count: 0,
            error_count: 0,
            last_read_at: None,
            device_address: None,
        }
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            read_count: self.read_count,
            error_count: self.error_count,
        }
    }
}

/// The single outbound event stream of the session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// One successful decode per read cycle.
    Reading(Reading),
    /// Fired on every phase transition.
    PhaseChanged(SessionStatus),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// MAC address of the BMS.
    pub address: String,
    /// SOC register; firmware variants place it differently.
    pub soc_register: u16,
    /// Period of the read loop.
    pub read_interval: Duration,
    /// Wait window for a response to one command.
    pub response_timeout: Duration,
    /// Wait window for the throwaway wake-up read.
    pub wake_timeout: Duration,
    /// Direct connect timeout.
    pub connect_timeout: Duration,
    /// Bounded wait for the scan fallback.
    pub scan_timeout: Duration,
    /// Bound on whole connect-sequence attempts.
    pub connect_attempts: u8,
    /// Delay between connect attempts.
    pub connect_retry_delay: Duration,
    /// Consecutive failed cycles that force a reconnect.
    pub max_consecutive_errors: u32,
    /// Reconnect when the success ratio over the recent window drops
    /// below this.
    pub min_success_ratio: f64,
    /// Size of the rolling outcome window.
    pub outcome_window: usize,
}

impl SessionConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            soc_register: RegisterMap::DEFAULT_SOC_REGISTER,
            read_interval: Duration::from_secs(30),
            response_timeout: Duration::from_secs(4),
            wake_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
            scan_timeout: Duration::from_secs(15),
            connect_attempts: 3,
            connect_retry_delay: Duration::from_secs(2),
            max_consecutive_errors: 5,
            min_success_ratio: 0.5,
            outcome_window: 10,
        }
    }
}

/// Handle to a running session.
///
/// Dropping the handle stops the session; [`Monitor::shutdown`] stops it
/// and reports how the worker ended.
pub struct Monitor {
    events: broadcast::Sender<SessionEvent>,
    status: watch::Receiver<SessionStatus>,
    stop: watch::Sender<bool>,
    worker: JoinHandle<Result<()>>,
}

impl Monitor {
    /// Start a session over the given transport. The transport is the only
    /// capability the session needs; it is injected here, never looked up.
    pub fn spawn<T>(transport: T, config: SessionConfig) -> Self
    where
        T: BleTransport + 'static,
    {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (status_tx, status_rx) = watch::channel(SessionStatus::idle());
        let (stop_tx, stop_rx) = watch::channel(false);
        let session = Session {
            client: BmsClient::new(transport, config.clone()),
            config,
            events: events.clone(),
            status: status_tx,
            stop: stop_rx,
            consecutive_errors: 0,
            outcomes: VecDeque::new(),
        };
        let worker = tokio::spawn(session.run());
        Self {
            events,
            status: status_rx,
            stop: stop_tx,
            worker,
        }
    }

    /// Subscribe to readings and phase transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Immutable snapshot of the current session state.
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().phase.is_connected()
    }

    pub fn stats(&self) -> SessionStats {
        self.status.borrow().stats()
    }

    /// Stop the session and wait for teardown. Safe to call in any state;
    /// an in-flight read is discarded, not delivered. The returned error
    /// is the worker's terminal failure, if it had one.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.stop.send(true);
        match self.worker.await {
            Ok(outcome) => outcome,
            Err(err) => {
                log::error!("Session worker failed: {err}");
                Ok(())
            }
        }
    }
}

struct Session<T> {
    client: BmsClient<T>,
    config: SessionConfig,
    events: broadcast::Sender<SessionEvent>,
    status: watch::Sender<SessionStatus>,
    stop: watch::Receiver<bool>,
    consecutive_errors: u32,
    outcomes: VecDeque<bool>,
}

/// Resolves once shutdown is requested or the handle is gone.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

impl<T: BleTransport> Session<T> {
    async fn run(mut self) -> Result<()> {
        let mut stop = self.stop.clone();

        tokio::select! {
            biased;
            _ = stop_requested(&mut stop) => {
                self.teardown().await;
                return Ok(());
            }
            outcome = self.establish() => {
                if let Err(err) = outcome {
                    log::error!("Session failed to establish: {err}");
                    self.set_phase(SessionPhase::Error);
                    return Err(err);
                }
            }
        }

        let mut ticker = tokio::time::interval(self.config.read_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => {
                    self.teardown().await;
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => {
                    // The cycle future is dropped here: a read completing
                    // after cancellation is discarded, not delivered.
                    self.teardown().await;
                    return Ok(());
                }
                _ = self.cycle() => {}
            }

            if self.needs_reconnect() {
                tokio::select! {
                    biased;
                    _ = stop_requested(&mut stop) => {
                        self.teardown().await;
                        return Ok(());
                    }
                    outcome = self.reconnect() => {
                        if let Err(err) = outcome {
                            log::error!("Reconnect failed: {err}");
                            self.set_phase(SessionPhase::Error);
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    /// Connect, verify, subscribe, wake. Shared by startup and reconnect.
    async fn establish(&mut self) -> Result<()> {
        self.set_phase(SessionPhase::Connecting);
        self.client.connect().await?;
        self.set_phase(SessionPhase::Connected);
        self.set_phase(SessionPhase::Waking);
        self.client.wake().await;
        self.set_phase(SessionPhase::Reading);
        self.consecutive_errors = 0;
        self.outcomes.clear();
        Ok(())
    }

    /// One read cycle. Failures are absorbed: the tick produces no reading
    /// and only the error accounting escalates.
    async fn cycle(&mut self) {
        match self.client.read_snapshot().await {
            Ok(snapshot) => {
                self.consecutive_errors = 0;
                self.push_outcome(true);
                self.update_status(|status| {
                    status.read_count += 1;
                    status.last_read_at = Some(snapshot.captured_at);
                });
                log::debug!(
                    "Read ok: {:.1}V {:.1}A soc={:?}",
                    snapshot.total_voltage_v,
                    snapshot.current_a,
                    snapshot.soc_percent
                );
                let _ = self.events.send(SessionEvent::Reading(snapshot));
            }
            Err(err) => {
                log::warn!("Read cycle failed: {err}");
                self.consecutive_errors += 1;
                self.push_outcome(false);
                self.update_status(|status| status.error_count += 1);
            }
        }
    }

    fn push_outcome(&mut self, success: bool) {
        if self.outcomes.len() == self.config.outcome_window {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(success);
    }

    fn needs_reconnect(&self) -> bool {
        if self.consecutive_errors > self.config.max_consecutive_errors {
            return true;
        }
        if self.outcomes.len() >= self.config.outcome_window {
            let successes = self.outcomes.iter().filter(|ok| **ok).count();
            let ratio = successes as f64 / self.outcomes.len() as f64;
            return ratio < self.config.min_success_ratio;
        }
        false
    }

    async fn reconnect(&mut self) -> Result<()> {
        log::warn!(
            "Error threshold crossed ({} consecutive), reconnecting",
            self.consecutive_errors
        );
        self.set_phase(SessionPhase::Reconnecting);
        self.client.disconnect().await;
        self.establish().await
    }

    async fn teardown(&mut self) {
        self.client.disconnect().await;
        self.set_phase(SessionPhase::Disconnected);
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        if self.status.borrow().phase == phase {
            return;
        }
        let mut snapshot = self.status.borrow().clone();
        snapshot.phase = phase;
        snapshot.device_address = match phase {
            SessionPhase::Disconnected => None,
            _ => Some(self.config.address.clone()),
        };
        log::debug!("Session phase -> {phase:?}");
        self.status.send_replace(snapshot.clone());
        let _ = self.events.send(SessionEvent::PhaseChanged(snapshot));
    }

    fn update_status(&mut self, apply: impl FnOnce(&mut SessionStatus)) {
        let mut snapshot = self.status.borrow().clone();
        apply(&mut snapshot);
        self.status.send_replace(snapshot);
    }
}
