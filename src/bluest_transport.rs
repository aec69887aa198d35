//! BLE backend built on the `bluest` crate.
//!
//! Connect-by-address is not portable across BLE stacks, so the first
//! connection always goes through [`BleTransport::scan_connect`]: the
//! scan matches the advertised address where the platform exposes one and
//! falls back to the `DL-` name prefix Daly units advertise. The resolved
//! device handle is remembered, which gives later reconnects a direct
//! fast path.

use std::time::Duration;

use async_trait::async_trait;
use bluest::{Adapter, Characteristic, Device, Uuid};
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::transport::{
    BleTransport, TransportError, NOTIFY_CHARACTERISTIC_UUID, SERVICE_UUID,
    WRITE_CHARACTERISTIC_UUID,
};

const SERVICE: Uuid = Uuid::from_u128(0x0000fff0_0000_1000_8000_00805f9b34fb);
const WRITE_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000fff2_0000_1000_8000_00805f9b34fb);
const NOTIFY_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000fff1_0000_1000_8000_00805f9b34fb);

/// Daly units advertise names like "DL-411812013771".
const DALY_NAME_PREFIX: &str = "DL-";

/// Capacity of the notification channel handed to the session.
const NOTIFICATION_CHANNEL_CAPACITY: usize = 64;

/// A device seen during a scan.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub id: String,
    pub name: String,
    pub rssi: Option<i16>,
}

pub struct BluestTransport {
    address: String,
    adapter: Option<Adapter>,
    device: Option<Device>,
    write_char: Option<Characteristic>,
    notify_char: Option<Characteristic>,
    pump: Option<JoinHandle<()>>,
}

impl BluestTransport {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            adapter: None,
            device: None,
            write_char: None,
            notify_char: None,
            pump: None,
        }
    }

    async fn adapter(&mut self) -> std::result::Result<Adapter, TransportError> {
        if let Some(adapter) = &self.adapter {
            return Ok(adapter.clone());
        }
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| TransportError::Backend("no default bluetooth adapter".into()))?;
        adapter
            .wait_available()
            .await
            .map_err(TransportError::backend)?;
        self.adapter = Some(adapter.clone());
        Ok(adapter)
    }

    /// Discover the fff0 service and both characteristics; a device
    /// missing either one cannot speak the protocol.
    async fn resolve_characteristics(
        &mut self,
        device: &Device,
    ) -> std::result::Result<(), TransportError> {
        let service = device
            .discover_services_with_uuid(SERVICE)
            .await
            .map_err(TransportError::backend)?
            .first()
            .cloned()
            .ok_or(TransportError::UnsupportedDevice(SERVICE_UUID))?;
        let write_char = service
            .discover_characteristics_with_uuid(WRITE_CHARACTERISTIC)
            .await
            .map_err(TransportError::backend)?
            .first()
            .cloned()
            .ok_or(TransportError::UnsupportedDevice(WRITE_CHARACTERISTIC_UUID))?;
        let notify_char = service
            .discover_characteristics_with_uuid(NOTIFY_CHARACTERISTIC)
            .await
            .map_err(TransportError::backend)?
            .first()
            .cloned()
            .ok_or(TransportError::UnsupportedDevice(NOTIFY_CHARACTERISTIC_UUID))?;
        self.write_char = Some(write_char);
        self.notify_char = Some(notify_char);
        self.device = Some(device.clone());
        Ok(())
    }
}

/// Case-insensitive address match against a platform device id. BlueZ ids
/// embed the MAC with underscores, other platforms use opaque ids and the
/// name-prefix fallback applies instead.
fn matches_address(id: &str, address: &str) -> bool {
    if address.is_empty() {
        return false;
    }
    let id = id.to_uppercase().replace('_', ":");
    id.contains(&address.to_uppercase())
}

async fn find_device(
    adapter: &Adapter,
    address: &str,
) -> std::result::Result<Device, TransportError> {
    let mut scan = adapter.scan(&[]).await.map_err(TransportError::backend)?;
    log::debug!("Scanning for BMS {address}");
    while let Some(found) = scan.next().await {
        let id = found.device.id().to_string();
        let name = found.device.name_async().await.unwrap_or_default();
        log::trace!("Scan candidate: {name:?} <{id}> rssi={:?}", found.rssi);
        if matches_address(&id, address) || name.trim().starts_with(DALY_NAME_PREFIX) {
            log::info!("Found BMS candidate {name:?} <{id}>");
            return Ok(found.device);
        }
    }
    Err(TransportError::DeviceNotFound(address.to_string()))
}

#[async_trait]
impl BleTransport for BluestTransport {
    async fn connect(&mut self, timeout: Duration) -> std::result::Result<(), TransportError> {
        let adapter = self.adapter().await?;
        let device = match &self.device {
            Some(device) => device.clone(),
            // No portable direct connect by address before the first scan;
            // the session falls back to scan_connect.
            None => return Err(TransportError::DeviceNotFound(self.address.clone())),
        };
        if !device.is_connected().await {
            tokio::time::timeout(timeout, adapter.connect_device(&device))
                .await
                .map_err(|_| TransportError::ConnectTimeout(timeout))?
                .map_err(TransportError::backend)?;
        }
        self.resolve_characteristics(&device).await
    }

    async fn scan_connect(&mut self, timeout: Duration) -> std::result::Result<(), TransportError> {
        let adapter = self.adapter().await?;
        let address = self.address.clone();
        let device = tokio::time::timeout(timeout, async {
            let device = find_device(&adapter, &address).await?;
            adapter
                .connect_device(&device)
                .await
                .map_err(TransportError::backend)?;
            Ok::<Device, TransportError>(device)
        })
        .await
        .map_err(|_| TransportError::DeviceNotFound(address.clone()))??;
        self.resolve_characteristics(&device).await
    }

    async fn write_command(&mut self, payload: &[u8]) -> std::result::Result<(), TransportError> {
        match &self.write_char {
            Some(characteristic) => characteristic
                .write_without_response(payload)
                .await
                .map_err(TransportError::backend),
            None => Err(TransportError::NotConnected),
        }
    }

    async fn subscribe(&mut self) -> std::result::Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        let notify_char = match &self.notify_char {
            Some(characteristic) => characteristic.clone(),
            None => return Err(TransportError::NotConnected),
        };
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        let (sender, receiver) = mpsc::channel(NOTIFICATION_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        // The notify stream borrows the characteristic, so the pump task
        // owns a clone of it and forwards buffers in arrival order.
        let pump = tokio::spawn(async move {
            let mut stream = match notify_char.notify().await {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(TransportError::backend(err)));
                    return;
                }
            };
            while let Some(item) = stream.next().await {
                match item {
                    Ok(data) => {
                        log::trace!("Notification: {data:02X?}");
                        if sender.send(data).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        log::warn!("Notification stream error: {err}");
                        break;
                    }
                }
            }
            log::debug!("Notification pump stopped");
        });
        ready_rx
            .await
            .map_err(|_| TransportError::NotConnected)??;
        self.pump = Some(pump);
        Ok(receiver)
    }

    async fn close(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.write_char = None;
        self.notify_char = None;
        if let (Some(adapter), Some(device)) = (&self.adapter, &self.device) {
            if device.is_connected().await {
                if let Err(err) = adapter.disconnect_device(device).await {
                    log::warn!("Disconnect failed: {err}");
                }
            }
        }
        // The device handle is kept so a later connect can skip the scan.
    }
}

/// Broad scan listing every advertising device once, for the CLI scan
/// command. Daly units show up with a `DL-` name prefix.
pub async fn discover_devices(
    timeout: Duration,
) -> std::result::Result<Vec<DiscoveredDevice>, TransportError> {
    let adapter = Adapter::default()
        .await
        .ok_or_else(|| TransportError::Backend("no default bluetooth adapter".into()))?;
    adapter
        .wait_available()
        .await
        .map_err(TransportError::backend)?;
    let mut scan = adapter.scan(&[]).await.map_err(TransportError::backend)?;
    let deadline = tokio::time::Instant::now() + timeout;
    let mut seen: Vec<DiscoveredDevice> = Vec::new();
    loop {
        match tokio::time::timeout_at(deadline, scan.next()).await {
            Err(_) | Ok(None) => break,
            Ok(Some(found)) => {
                let id = found.device.id().to_string();
                if seen.iter().any(|device| device.id == id) {
                    continue;
                }
                let name = found.device.name_async().await.unwrap_or_default();
                seen.push(DiscoveredDevice {
                    id,
                    name,
                    rssi: found.rssi,
                });
            }
        }
    }
    Ok(seen)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_matching_normalizes_platform_ids() {
        // BlueZ path-style id.
        assert!(matches_address(
            "/org/bluez/hci0/dev_41_18_12_01_37_71",
            "41:18:12:01:37:71"
        ));
        assert!(!matches_address(
            "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF",
            "41:18:12:01:37:71"
        ));
        // Opaque ids never match an address; the name prefix covers those.
        assert!(!matches_address("6e3f1b2c-0000", "41:18:12:01:37:71"));
        assert!(!matches_address("anything", ""));
    }
}
