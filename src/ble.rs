//! Routing of GATT notifications into the pipeline.
//!
//! Connection setup and subscription stay with the transport. This module
//! only recognizes the characteristics that carry telemetry and turns their
//! notifications into [`Inbound`] messages.

use bytes::Bytes;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::{pipeline::Inbound, types::FrameKind};

#[cfg(feature = "ble")]
use btleplug::{
    api::{Peripheral as _, ValueNotification},
    platform::Peripheral,
};
#[cfg(feature = "ble")]
use futures::stream::{Stream, StreamExt};

/// Bluetooth base UUID, `0000xxxx-0000-1000-8000-00805F9B34FB`
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// Expand a 16-bit SIG-assigned number to its full UUID
#[must_use]
#[allow(clippy::cast_lossless)]
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// The 16-bit assigned number of `uuid`, if it derives from the base UUID
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn short_uuid(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    if value & !(0xFFFF_u128 << 96) == BLUETOOTH_BASE_UUID {
        Some((value >> 96) as u16)
    } else {
        None
    }
}

/// Full UUID of the characteristic that carries `kind`
#[must_use]
pub const fn characteristic_uuid(kind: FrameKind) -> Uuid {
    uuid_from_u16(kind.characteristic())
}

/// Frame kind carried by a characteristic
///
/// Returns `None` for every characteristic that is not telemetry, such as
/// the FTMS control point or machine status.
#[must_use]
pub fn frame_kind_for(uuid: &Uuid) -> Option<FrameKind> {
    short_uuid(uuid).and_then(FrameKind::from_characteristic)
}

/// Turn one notification into a pipeline message
#[must_use]
pub fn route_notification(uuid: &Uuid, value: &[u8], at: Instant) -> Option<Inbound> {
    let Some(kind) = frame_kind_for(uuid) else {
        trace!("Ignoring notification from {uuid}");
        return None;
    };
    Some(Inbound::Frame {
        kind,
        data: Bytes::copy_from_slice(value),
        at,
    })
}

/// Forward telemetry notifications from a btleplug stream
///
/// Runs until the stream ends or the pipeline hangs up. Returns the number
/// of frames forwarded.
#[cfg(feature = "ble")]
pub async fn route_notifications<S>(
    mut notifications: S,
    sender: mpsc::UnboundedSender<Inbound>,
) -> usize
where
    S: Stream<Item = ValueNotification> + Unpin,
{
    let mut forwarded = 0;
    while let Some(notification) = notifications.next().await {
        let Some(message) =
            route_notification(&notification.uuid, &notification.value, Instant::now())
        else {
            continue;
        };
        if sender.send(message).is_err() {
            debug!("Pipeline closed, stopping notification routing");
            break;
        }
        forwarded += 1;
    }
    debug!("Notification stream finished after {forwarded} frames");
    forwarded
}

/// Forward every telemetry notification of an already subscribed peripheral
///
/// # Errors
///
/// Returns [`crate::BridgeError::Ble`] if the notification stream cannot be
/// opened.
#[cfg(feature = "ble")]
pub async fn forward_notifications(
    peripheral: &Peripheral,
    sender: mpsc::UnboundedSender<Inbound>,
) -> crate::Result<usize> {
    let notifications = peripheral.notifications().await?;
    Ok(route_notifications(notifications, sender).await)
}

/// Forward already-extracted `(characteristic, value)` pairs
///
/// Used by transports that do not go through btleplug, and by replay tools.
pub async fn route_values<S>(mut values: S, sender: mpsc::UnboundedSender<Inbound>) -> usize
where
    S: futures::Stream<Item = (Uuid, Vec<u8>)> + Unpin,
{
    use futures::StreamExt as _;

    let mut forwarded = 0;
    while let Some((uuid, value)) = values.next().await {
        if let Some(message) = route_notification(&uuid, &value, Instant::now()) {
            if sender.send(message).is_err() {
                break;
            }
            forwarded += 1;
        }
    }
    debug!("Value stream finished after {forwarded} frames");
    forwarded
}
