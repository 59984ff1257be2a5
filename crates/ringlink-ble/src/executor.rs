//! Ring command executor over the vendor UART service

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Characteristic, Peripheral as _, ValueNotification, WriteType};
use btleplug::platform::Peripheral;
use futures::stream::{Stream, StreamExt};
use ringlink_core::{CommandExecutor, CommandOutcome, DeviceCommand, DeviceRequest};
use tokio::time::timeout;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::BleRadioError;
use crate::protocol::{command_frame, decode_frame, encode_frame, RESPONSE_ERROR_FLAG};
use crate::radio::BtleplugRadio;

/// Executes engine commands as request/response frame exchanges
///
/// Each command is written to the write characteristic and answered by one frame
/// on the notify characteristic echoing its opcode. Commands in a batch run in
/// order; the first failure ends the batch.
pub struct BtleplugExecutor {
    radio: Arc<BtleplugRadio>,
}

impl BtleplugExecutor {
    pub fn new(radio: Arc<BtleplugRadio>) -> Self {
        Self { radio }
    }

    async fn run(&self, request: &DeviceRequest) -> Result<Vec<u8>, BleRadioError> {
        let config = self.radio.config();
        let peripheral = self.radio.peripheral(request.link)?;
        let write = characteristic(&peripheral, config.write_characteristic)?;
        let notify = characteristic(&peripheral, config.notify_characteristic)?;

        // Take the stream before subscribing so no early response is missed
        let mut notifications = peripheral.notifications().await?;
        peripheral.subscribe(&notify).await?;

        let mut responses = Vec::new();
        for command in &request.commands {
            let payload = exchange(
                &peripheral,
                &write,
                notify.uuid,
                &mut notifications,
                command,
                config.response_timeout,
            )
            .await?;
            responses.extend_from_slice(&payload);
        }

        if let Err(e) = peripheral.unsubscribe(&notify).await {
            debug!("Unsubscribe after request {} failed: {}", request.id, e);
        }
        Ok(responses)
    }
}

fn characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic, BleRadioError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or_else(|| BleRadioError::CharacteristicNotFound {
            characteristic: uuid.to_string(),
        })
}

async fn exchange<S>(
    peripheral: &Peripheral,
    write: &Characteristic,
    notify_uuid: Uuid,
    notifications: &mut S,
    command: &DeviceCommand,
    response_timeout: Duration,
) -> Result<Vec<u8>, BleRadioError>
where
    S: Stream<Item = ValueNotification> + Unpin,
{
    let (opcode, payload) = command_frame(command)?;
    let frame = encode_frame(opcode, &payload)?;
    trace!("-> {}", hex::encode(frame));
    peripheral
        .write(write, &frame, WriteType::WithResponse)
        .await?;

    let wait = async {
        while let Some(notification) = notifications.next().await {
            if notification.uuid != notify_uuid {
                continue;
            }
            trace!("<- {}", hex::encode(&notification.value));
            match decode_frame(&notification.value) {
                Some((op, body)) if op == opcode => return Ok(body.to_vec()),
                Some((op, _)) if op == opcode | RESPONSE_ERROR_FLAG => {
                    return Err(BleRadioError::Rejected { opcode })
                }
                // Unsolicited frames (step counts, battery pushes) interleave with responses
                Some(_) => continue,
                None => warn!("Dropping malformed frame of {} bytes", notification.value.len()),
            }
        }
        Err(BleRadioError::NotificationStreamEnded)
    };

    timeout(response_timeout, wait)
        .await
        .map_err(|_| BleRadioError::ResponseTimeout)?
}

#[async_trait]
impl CommandExecutor for BtleplugExecutor {
    async fn execute(&self, request: DeviceRequest) -> CommandOutcome {
        debug!(
            "Executing request {} with {} command(s) on {}",
            request.id,
            request.commands.len(),
            request.link
        );
        match self.run(&request).await {
            Ok(responses) => CommandOutcome::Success(responses),
            Err(BleRadioError::ResponseTimeout) => CommandOutcome::Timeout,
            Err(e) => {
                warn!("Request {} failed: {}", request.id, e);
                CommandOutcome::Failure(e.status())
            }
        }
    }
}
