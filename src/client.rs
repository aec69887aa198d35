//! Request/response client for the D2 protocol.
//!
//! [`BmsClient`] owns the transport and implements the half-duplex exchange
//! discipline: one command in flight, stale notifications drained before
//! every write, echoes filtered before parsing, fragments reassembled
//! within a single cycle only.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::protocol::{self, FrameError, ParsedFrame, ReadRequest, RegisterMap};
use crate::reading::{self, CurrentDirection, DecodeError, Reading, MAX_CELLS, MAX_TEMPERATURE_SENSORS};
use crate::session::SessionConfig;
use crate::transport::{BleTransport, TransportError};

pub struct BmsClient<T> {
    transport: T,
    config: SessionConfig,
    registers: RegisterMap,
    notifications: Option<mpsc::Receiver<Vec<u8>>>,
}

impl<T: BleTransport> BmsClient<T> {
    pub fn new(transport: T, config: SessionConfig) -> Self {
        let registers = RegisterMap::with_soc_register(config.soc_register);
        Self {
            transport,
            config,
            registers,
            notifications: None,
        }
    }

    pub fn registers(&self) -> &RegisterMap {
        &self.registers
    }

    /// Run the whole connect sequence: direct connect, scan fallback,
    /// notification subscription. Retried with a fixed delay up to the
    /// configured attempt bound; an unsupported device aborts immediately.
    pub async fn connect(&mut self) -> Result<()> {
        let mut last_error: Option<TransportError> = None;
        for attempt in 1..=self.config.connect_attempts {
            log::info!(
                "Connecting to BMS {} ({attempt}/{})",
                self.config.address,
                self.config.connect_attempts
            );
            match self.try_connect_once().await {
                Ok(()) => {
                    log::info!("BMS connected");
                    return Ok(());
                }
                Err(err) => {
                    log::warn!("Connect attempt {attempt} failed: {err}");
                    let fatal = err.is_fatal();
                    last_error = Some(err);
                    if fatal {
                        break;
                    }
                    if attempt < self.config.connect_attempts {
                        tokio::time::sleep(self.config.connect_retry_delay).await;
                    }
                }
            }
        }
        Err(Error::ConnectFailed {
            attempts: self.config.connect_attempts,
            source: last_error.unwrap_or(TransportError::NotConnected),
        })
    }

    async fn try_connect_once(&mut self) -> std::result::Result<(), TransportError> {
        if let Err(err) = self.transport.connect(self.config.connect_timeout).await {
            if err.is_fatal() {
                return Err(err);
            }
            log::debug!("Direct connect failed ({err}), falling back to scan");
            self.transport.scan_connect(self.config.scan_timeout).await?;
        }
        let receiver = self.transport.subscribe().await?;
        self.notifications = Some(receiver);
        Ok(())
    }

    /// The BMS sleeps when idle and swallows the first command after
    /// waking. Send a throwaway single-register read and ignore the
    /// outcome before starting real reads.
    pub async fn wake(&mut self) {
        let request = ReadRequest::new(self.registers.total_voltage, 1);
        match self.exchange(&request, self.config.wake_timeout).await {
            Ok(_) => log::debug!("Wake-up read answered"),
            Err(err) => log::debug!("Wake-up read ignored: {err}"),
        }
    }

    /// One full telemetry snapshot. The large-range read is the default
    /// policy (one round trip); individual registers are the fallback.
    pub async fn read_snapshot(&mut self) -> Result<Reading> {
        match self.read_full_range().await {
            Ok(reading) => Ok(reading),
            Err(Error::Transport(err)) => Err(Error::Transport(err)),
            Err(err) => {
                log::debug!("Large-range read failed ({err}), trying individual registers");
                self.read_individual().await
            }
        }
    }

    async fn read_full_range(&mut self) -> Result<Reading> {
        let frame = self
            .exchange(&ReadRequest::full_range(), self.config.response_timeout)
            .await?;
        let mut snapshot = reading::decode_full_range(&frame.payload, &self.registers, frame.crc_ok)?;
        snapshot.fill_soc_estimate();
        Ok(snapshot)
    }

    /// Fallback strategy: single reads of pack voltage, current,
    /// temperatures and SOC. Cell voltages are skipped here; a partial
    /// reading is preferable to none.
    async fn read_individual(&mut self) -> Result<Reading> {
        let total_voltage_v = self.read_total_voltage().await?;
        let (current_a, current_direction) = self.read_current().await?;
        let temperatures_c = self.read_temperatures().await.unwrap_or_default();
        let soc_percent = match self.read_soc().await {
            Ok(soc) => soc,
            Err(_) => None,
        };
        let mut snapshot = Reading {
            total_voltage_v,
            current_a,
            current_direction,
            cell_voltages_v: Vec::new(),
            temperatures_c,
            soc_percent,
            soc_estimated: false,
            crc_valid: true,
            captured_at: Utc::now(),
        };
        snapshot.fill_soc_estimate();
        Ok(snapshot)
    }

    pub async fn read_total_voltage(&mut self) -> Result<f32> {
        let raw = self.read_single_register(self.registers.total_voltage).await?;
        if raw == 0 {
            return Err(DecodeError::MissingTotalVoltage.into());
        }
        Ok(reading::decode_total_voltage(raw))
    }

    pub async fn read_current(&mut self) -> Result<(f32, CurrentDirection)> {
        let raw = self.read_single_register(self.registers.current).await?;
        Ok(reading::decode_current(raw))
    }

    /// SOC from the configured register; `None` when the register holds
    /// nothing plausible.
    pub async fn read_soc(&mut self) -> Result<Option<f32>> {
        let raw = self.read_single_register(self.registers.soc).await?;
        Ok(reading::decode_soc(raw))
    }

    pub async fn read_cell_voltages(&mut self) -> Result<Vec<f32>> {
        let request = ReadRequest::new(self.registers.cell_voltage_base, MAX_CELLS as u16);
        let frame = self.exchange(&request, self.config.response_timeout).await?;
        Ok(reading::decode_cell_voltages_payload(&frame.payload))
    }

    pub async fn read_temperatures(&mut self) -> Result<Vec<f32>> {
        let request = ReadRequest::new(
            self.registers.temperature_base,
            MAX_TEMPERATURE_SENSORS as u16,
        );
        let frame = self.exchange(&request, self.config.response_timeout).await?;
        Ok(reading::decode_temperatures_payload(&frame.payload))
    }

    async fn read_single_register(&mut self, register: u16) -> Result<u16> {
        let request = ReadRequest::new(register, 1);
        let frame = self.exchange(&request, self.config.response_timeout).await?;
        reading::first_word(&frame.payload)
            .ok_or(Error::Decode(DecodeError::ShortPayload { register }))
    }

    /// Half-duplex exchange: drain stale notifications, write the request,
    /// then collect notifications until a frame parses or the deadline
    /// passes. Echoed commands never reach the parser, and the reassembly
    /// buffer lives for this cycle only.
    async fn exchange(&mut self, request: &ReadRequest, wait: Duration) -> Result<ParsedFrame> {
        let command = request.encode();
        let receiver = self.notifications.as_mut().ok_or(Error::NotConnected)?;
        while receiver.try_recv().is_ok() {}

        log::trace!("TX: {command:02X?}");
        self.transport.write_command(&command).await?;

        let receiver = self.notifications.as_mut().ok_or(Error::NotConnected)?;
        let deadline = Instant::now() + wait;
        let mut buffer: Vec<u8> = Vec::new();
        loop {
            let chunk = match tokio::time::timeout_at(deadline, receiver.recv()).await {
                Err(_) => return Err(Error::ResponseTimeout(wait)),
                Ok(None) => return Err(Error::Transport(TransportError::NotConnected)),
                Ok(Some(chunk)) => chunk,
            };
            log::trace!("RX: {chunk:02X?}");
            if request.is_echo(&chunk) {
                log::trace!("Discarding echoed command");
                continue;
            }
            buffer.extend_from_slice(&chunk);
            match protocol::parse_response(&buffer) {
                Ok(frame) => {
                    if !frame.crc_ok {
                        return Err(Error::Frame(FrameError::CrcMismatch));
                    }
                    return Ok(frame);
                }
                // More fragments may still be in flight.
                Err(err) if err.is_incomplete() => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Drop the subscription and close the transport. Never fails.
    pub async fn disconnect(&mut self) {
        self.notifications = None;
        self.transport.close().await;
        log::info!("BMS disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::crc16;
    use crate::session::SessionConfig;
    use crate::testutil::{captured_payload, default_responder, encode_frame, MockTransport};

    fn test_config() -> SessionConfig {
        let mut config = SessionConfig::new("41:18:12:01:37:71");
        config.response_timeout = Duration::from_millis(200);
        config.wake_timeout = Duration::from_millis(100);
        config
    }

    async fn connected_client(transport: MockTransport) -> BmsClient<MockTransport> {
        let mut client = BmsClient::new(transport, test_config());
        client.connect().await.unwrap();
        client
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_over_fragmented_notifications() {
        // A 129-byte response split into MTU-sized chunks must reassemble.
        let responder = Box::new(|command: &[u8]| {
            let start = u16::from_be_bytes([command[2], command[3]]);
            if start != 0x0000 {
                return vec![];
            }
            let frame = encode_frame(&captured_payload(&RegisterMap::default()));
            frame.chunks(20).map(|chunk| chunk.to_vec()).collect()
        });
        let mut client = connected_client(MockTransport::new(responder)).await;
        let snapshot = client.read_full_range().await.unwrap();
        assert!((snapshot.total_voltage_v - 26.5).abs() < 1e-4);
        assert_eq!(snapshot.cell_voltages_v.len(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn echo_alone_never_produces_a_frame() {
        // The transport loops the command back and nothing else.
        let responder = Box::new(|command: &[u8]| vec![command.to_vec()]);
        let mut client = connected_client(MockTransport::new(responder)).await;
        match client.read_full_range().await {
            Err(Error::ResponseTimeout(_)) => {}
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn echo_before_response_is_skipped() {
        let responder = Box::new(|command: &[u8]| {
            let start = u16::from_be_bytes([command[2], command[3]]);
            if start != 0x0000 {
                return vec![];
            }
            vec![
                command.to_vec(),
                encode_frame(&captured_payload(&RegisterMap::default())),
            ]
        });
        let mut client = connected_client(MockTransport::new(responder)).await;
        let snapshot = client.read_full_range().await.unwrap();
        assert_eq!(snapshot.soc_percent, Some(75.5));
    }

    #[tokio::test(start_paused = true)]
    async fn corrupt_crc_is_rejected() {
        let responder = Box::new(|command: &[u8]| {
            let start = u16::from_be_bytes([command[2], command[3]]);
            if start != 0x0000 {
                return vec![];
            }
            let mut frame = encode_frame(&captured_payload(&RegisterMap::default()));
            let last = frame.len() - 1;
            frame[last] ^= 0xFF;
            vec![frame]
        });
        let mut client = connected_client(MockTransport::new(responder)).await;
        match client.read_full_range().await {
            Err(Error::Frame(FrameError::CrcMismatch)) => {}
            other => panic!("expected CRC mismatch, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_falls_back_to_individual_registers() {
        // Answer single-register reads only; the large-range read times out.
        let mut base = default_responder();
        let responder = Box::new(move |command: &[u8]| {
            let count = u16::from_be_bytes([command[4], command[5]]);
            if count > 4 {
                return vec![];
            }
            base(command)
        });
        let mut client = connected_client(MockTransport::new(responder)).await;
        let snapshot = client.read_snapshot().await.unwrap();
        assert!((snapshot.total_voltage_v - 26.5).abs() < 1e-4);
        assert_eq!(snapshot.current_direction, CurrentDirection::Idle);
        assert!(snapshot.cell_voltages_v.is_empty());
        assert_eq!(snapshot.temperatures_c.len(), 4);
        assert_eq!(snapshot.soc_percent, Some(75.5));
        assert!(!snapshot.soc_estimated);
    }

    #[tokio::test(start_paused = true)]
    async fn wake_request_reads_total_voltage_once() {
        let mut client = connected_client(MockTransport::answering_all()).await;
        client.wake().await;
        let writes = client.transport.writes.lock().unwrap().clone();
        assert_eq!(writes.len(), 1);
        let expected = ReadRequest::new(RegisterMap::default().total_voltage, 1).encode();
        assert_eq!(writes[0], expected);
        // The wake frame carries a valid CRC like any other request.
        assert_eq!(
            crc16(&writes[0][..6]).to_le_bytes().as_slice(),
            &writes[0][6..]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_attempts_surface_connect_failed() {
        let mut transport = MockTransport::answering_all();
        transport.connect_failures = 8;
        transport.scan_succeeds = false;
        let mut client = BmsClient::new(transport, test_config());
        match client.connect().await {
            Err(Error::ConnectFailed { attempts: 3, .. }) => {}
            other => panic!("expected ConnectFailed, got {other:?}"),
        }
        assert_eq!(
            client.transport.connects.load(std::sync::atomic::Ordering::SeqCst),
            3
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unsupported_device_is_not_retried() {
        let mut transport = MockTransport::answering_all();
        transport.unsupported = true;
        let mut client = BmsClient::new(transport, test_config());
        match client.connect().await {
            Err(Error::ConnectFailed {
                source: TransportError::UnsupportedDevice(_),
                ..
            }) => {}
            other => panic!("expected unsupported device, got {other:?}"),
        }
        assert_eq!(
            client.transport.connects.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn scan_fallback_connects_after_direct_failure() {
        let mut transport = MockTransport::answering_all();
        transport.connect_failures = 1;
        transport.scan_succeeds = true;
        let mut client = BmsClient::new(transport, test_config());
        client.connect().await.unwrap();
        assert_eq!(
            client.transport.scans.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }
}
