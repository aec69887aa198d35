//! Scripted transport and frame builders shared by the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::protocol::{crc16, RegisterMap, DEVICE_ADDRESS, FUNCTION_READ};
use crate::transport::{BleTransport, TransportError, NOTIFY_CHARACTERISTIC_UUID};

/// Maps a written command to the notification buffers it provokes.
pub(crate) type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

/// Wrap a payload in a valid response frame.
pub(crate) fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![DEVICE_ADDRESS, FUNCTION_READ, payload.len() as u8];
    frame.extend_from_slice(payload);
    let crc = crc16(&frame);
    frame.push(crc as u8);
    frame.push((crc >> 8) as u8);
    frame
}

/// Register image of the captured validation scenario: 8S pack at 26.5 V,
/// four sensors near 24 degrees, idle current, SOC register at 75.5 %.
pub(crate) fn captured_payload(registers: &RegisterMap) -> Vec<u8> {
    fn put_word(payload: &mut [u8], register: u16, value: u16) {
        let pos = register as usize * 2;
        payload[pos..pos + 2].copy_from_slice(&value.to_be_bytes());
    }

    let mut payload = vec![0u8; 124];
    let cells = [3312u16, 3318, 3321, 3310, 3315, 3322, 3308, 3319];
    for (slot, raw) in cells.iter().enumerate() {
        put_word(&mut payload, registers.cell_voltage_base + slot as u16, *raw);
    }
    for (sensor, raw) in [2971u16, 2969, 2973, 2968].iter().enumerate() {
        put_word(&mut payload, registers.temperature_base + sensor as u16, *raw);
    }
    put_word(&mut payload, registers.total_voltage, 265);
    put_word(&mut payload, registers.current, 30000);
    put_word(&mut payload, registers.soc, 755);
    payload
}

/// Responder that answers any read request with the matching slice of the
/// captured register image.
pub(crate) fn default_responder() -> Responder {
    Box::new(|command: &[u8]| {
        let start = u16::from_be_bytes([command[2], command[3]]);
        let count = u16::from_be_bytes([command[4], command[5]]);
        let full = captured_payload(&RegisterMap::default());
        let begin = start as usize * 2;
        let end = (begin + count as usize * 2).min(full.len());
        if begin >= full.len() {
            return vec![];
        }
        vec![encode_frame(&full[begin..end])]
    })
}

/// A transport driven entirely by a responder script.
pub(crate) struct MockTransport {
    responder: Responder,
    sender: Option<mpsc::Sender<Vec<u8>>>,
    /// Number of direct connect attempts that fail before one succeeds.
    pub connect_failures: usize,
    /// Whether the scan fallback finds the device.
    pub scan_succeeds: bool,
    /// Simulate a device without the notify characteristic.
    pub unsupported: bool,
    pub writes: Arc<Mutex<Vec<Vec<u8>>>>,
    pub connects: Arc<AtomicUsize>,
    pub scans: Arc<AtomicUsize>,
    pub closes: Arc<AtomicUsize>,
}

impl MockTransport {
    pub fn new(responder: Responder) -> Self {
        Self {
            responder,
            sender: None,
            connect_failures: 0,
            scan_succeeds: false,
            unsupported: false,
            writes: Arc::new(Mutex::new(Vec::new())),
            connects: Arc::new(AtomicUsize::new(0)),
            scans: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Transport that answers every request from the captured image.
    pub fn answering_all() -> Self {
        Self::new(default_responder())
    }
}

#[async_trait]
impl BleTransport for MockTransport {
    async fn connect(&mut self, timeout: Duration) -> std::result::Result<(), TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.unsupported {
            return Err(TransportError::UnsupportedDevice(NOTIFY_CHARACTERISTIC_UUID));
        }
        if self.connect_failures > 0 {
            self.connect_failures -= 1;
            return Err(TransportError::ConnectTimeout(timeout));
        }
        Ok(())
    }

    async fn scan_connect(&mut self, _timeout: Duration) -> std::result::Result<(), TransportError> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        if self.unsupported {
            return Err(TransportError::UnsupportedDevice(NOTIFY_CHARACTERISTIC_UUID));
        }
        if self.scan_succeeds {
            Ok(())
        } else {
            Err(TransportError::DeviceNotFound("mock".into()))
        }
    }

    async fn write_command(&mut self, payload: &[u8]) -> std::result::Result<(), TransportError> {
        self.writes.lock().unwrap().push(payload.to_vec());
        let replies = (self.responder)(payload);
        if let Some(sender) = &self.sender {
            for reply in replies {
                let _ = sender.try_send(reply);
            }
        }
        Ok(())
    }

    async fn subscribe(&mut self) -> std::result::Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        let (sender, receiver) = mpsc::channel(64);
        self.sender = Some(sender);
        Ok(receiver)
    }

    async fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.sender = None;
    }
}
