//! Bluetooth LE sensors through `btleplug`.
//!
//! Only compiled with the `ble` feature. Peripherals found during
//! [`BleScanner::discover`] are cached by address so that
//! [`BleScanner::connect`] can reuse them.

use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use btleplug::api::{
    Central as _, Characteristic, Manager as _, Peripheral as _, ScanFilter, ValueNotification,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::{Stream, StreamExt};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::LinkError;
use crate::sensor::{Advertisement, Notification, SensorLink, SensorScanner};

type NotificationStream = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

fn bt_err(target: &str) -> impl Fn(btleplug::Error) -> LinkError + '_ {
    move |e| LinkError::Bluetooth {
        target: target.to_owned(),
        reason: e.to_string(),
    }
}

// ── Scanner ─────────────────────────────────────────────────────────

/// Scanner bound to the first Bluetooth adapter on the host.
pub struct BleScanner {
    adapter: Adapter,
    seen: HashMap<String, Peripheral>,
}

impl BleScanner {
    pub async fn new() -> Result<Self, LinkError> {
        let manager = Manager::new().await.map_err(bt_err("<adapter>"))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(bt_err("<adapter>"))?
            .into_iter()
            .next()
            .ok_or(LinkError::NoAdapter)?;

        Ok(Self {
            adapter,
            seen: HashMap::new(),
        })
    }
}

impl SensorScanner for BleScanner {
    type Link = BleLink;

    async fn discover(
        &mut self,
        window: Duration,
        name_filter: &str,
    ) -> Result<Vec<Advertisement>, LinkError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(bt_err("<adapter>"))?;
        tokio::time::sleep(window).await;
        if let Err(e) = self.adapter.stop_scan().await {
            warn!(error = %e, "failed to stop BLE scan (non-fatal)");
        }

        let mut found = Vec::new();
        for peripheral in self
            .adapter
            .peripherals()
            .await
            .map_err(bt_err("<adapter>"))?
        {
            let address = peripheral.address().to_string();
            let Ok(Some(props)) = peripheral.properties().await else {
                continue;
            };
            let Some(name) = props.local_name else {
                continue;
            };
            if !name.contains(name_filter) {
                continue;
            }
            debug!(%address, %name, "sensor advertised");
            found.push(Advertisement {
                address: address.clone(),
                name,
            });
            self.seen.insert(address, peripheral);
        }

        Ok(found)
    }

    async fn connect(&mut self, advertisement: &Advertisement) -> Result<BleLink, LinkError> {
        let address = advertisement.address.as_str();
        let peripheral = self
            .seen
            .get(address)
            .cloned()
            .ok_or_else(|| LinkError::Open {
                target: address.to_owned(),
                reason: "peripheral was not seen during the last scan".into(),
            })?;

        peripheral.connect().await.map_err(bt_err(address))?;
        peripheral
            .discover_services()
            .await
            .map_err(bt_err(address))?;
        let notifications = peripheral.notifications().await.map_err(bt_err(address))?;

        Ok(BleLink {
            address: address.to_owned(),
            name: advertisement.name.clone(),
            peripheral,
            notifications,
        })
    }
}

// ── Link ────────────────────────────────────────────────────────────

/// A connected `btleplug` peripheral.
pub struct BleLink {
    address: String,
    name: String,
    peripheral: Peripheral,
    notifications: NotificationStream,
}

impl BleLink {
    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, LinkError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| LinkError::MissingCharacteristic {
                target: self.address.clone(),
                uuid,
            })
    }
}

impl SensorLink for BleLink {
    fn address(&self) -> &str {
        &self.address
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&mut self, characteristic: Uuid, payload: &[u8]) -> Result<(), LinkError> {
        let ch = self.characteristic(characteristic)?;
        self.peripheral
            .write(&ch, payload, WriteType::WithResponse)
            .await
            .map_err(bt_err(&self.address))
    }

    async fn subscribe(&mut self, characteristic: Uuid) -> Result<(), LinkError> {
        let ch = self.characteristic(characteristic)?;
        self.peripheral
            .subscribe(&ch)
            .await
            .map_err(bt_err(&self.address))
    }

    async fn unsubscribe(&mut self, characteristic: Uuid) -> Result<(), LinkError> {
        let ch = self.characteristic(characteristic)?;
        self.peripheral
            .unsubscribe(&ch)
            .await
            .map_err(bt_err(&self.address))
    }

    async fn next_notification(&mut self) -> Option<Notification> {
        let n = self.notifications.next().await?;
        Some(Notification::new(n.uuid, n.value))
    }

    async fn disconnect(&mut self) -> Result<(), LinkError> {
        self.peripheral
            .disconnect()
            .await
            .map_err(bt_err(&self.address))
    }
}
