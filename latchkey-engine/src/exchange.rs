//! Credential Exchange Coordinator - one `set_wifi` command, one resolution

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use latchkey_ble::Channel;
use latchkey_proto::{Ack, Command};

use crate::ProvisioningError;

/// Identifies one `send` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Accepted,
    Rejected(String),
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExchangeState {
    Idle,
    AwaitingAck { id: ExchangeId, deadline: Instant },
}

/// Correlates a credential push with the device's acknowledgment.
///
/// Whichever of ack and deadline is handled first resolves the exchange and
/// puts the coordinator back to idle, so the other becomes a no-op.
#[derive(Debug)]
pub struct ExchangeCoordinator {
    state: ExchangeState,
    window: Duration,
    next_id: u64,
}

impl ExchangeCoordinator {
    pub fn new(window: Duration) -> Self {
        Self { state: ExchangeState::Idle, window, next_id: 0 }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Write a `set_wifi` command and start the acknowledgment deadline
    pub async fn send<C: Channel>(
        &mut self,
        channel: &C,
        ssid: &str,
        password: &str,
    ) -> Result<ExchangeId, ProvisioningError> {
        if self.is_pending() {
            return Err(ProvisioningError::ExchangeInProgress);
        }

        let frame = Command::SetWifi {
            ssid: ssid.to_string(),
            password: password.to_string(),
        }
        .to_frame()?;

        channel.write(&frame).await?;

        let id = ExchangeId(self.next_id);
        self.next_id += 1;
        let deadline = Instant::now() + self.window;
        self.state = ExchangeState::AwaitingAck { id, deadline };
        info!(ssid, window_secs = self.window.as_secs(), "credentials sent");
        Ok(id)
    }

    /// Resolve the pending exchange with an ack; `None` if nothing is pending
    pub fn on_ack(&mut self, ack: &Ack) -> Option<(ExchangeId, Resolution)> {
        let ExchangeState::AwaitingAck { id, .. } = self.state else {
            debug!(result = %ack.result, "ignoring ack with no exchange pending");
            return None;
        };
        self.state = ExchangeState::Idle;

        let resolution = if ack.is_ok() {
            Resolution::Accepted
        } else {
            let message = ack
                .message
                .clone()
                .unwrap_or_else(|| format!("device answered {:?}", ack.result));
            warn!(%message, "device rejected credentials");
            Resolution::Rejected(message)
        };
        Some((id, resolution))
    }

    /// Resolve the pending exchange as timed out if its deadline has passed
    pub fn on_deadline(&mut self, now: Instant) -> Option<(ExchangeId, Resolution)> {
        match self.state {
            ExchangeState::AwaitingAck { id, deadline } if now >= deadline => {
                self.state = ExchangeState::Idle;
                warn!(window_secs = self.window.as_secs(), "no acknowledgment before deadline");
                Some((id, Resolution::TimedOut))
            }
            _ => None,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            ExchangeState::AwaitingAck { deadline, .. } => Some(deadline),
            ExchangeState::Idle => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, ExchangeState::AwaitingAck { .. })
    }

    /// Drop the pending exchange without resolving it
    pub fn cancel(&mut self) -> bool {
        let pending = self.is_pending();
        self.state = ExchangeState::Idle;
        pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use latchkey_ble::mock::MockTransport;
    use latchkey_ble::{DeviceInfo, Transport, TransportError};
    use serde_json::json;
    use uuid::Uuid;

    const WINDOW: Duration = Duration::from_secs(15);

    async fn channel() -> (MockTransport, latchkey_ble::mock::MockChannel) {
        let device = DeviceInfo { id: "AA".into(), name: "Latchkey-1".into(), rssi: None };
        let transport = MockTransport::new(vec![device.clone()]);
        let link = transport.connect(&device).await.unwrap();
        let channel = transport.open_channel(&link, Uuid::nil(), Uuid::nil()).await.unwrap();
        (transport, channel)
    }

    #[tokio::test(start_paused = true)]
    async fn ack_then_deadline_resolves_once() {
        let (transport, channel) = channel().await;
        let mut exchange = ExchangeCoordinator::new(WINDOW);

        let id = exchange.send(&channel, "Home", "x").await.unwrap();
        assert_eq!(
            transport.commands(),
            vec![json!({"action": "set_wifi", "ssid": "Home", "password": "x"})]
        );

        assert_eq!(exchange.on_ack(&Ack::ok()), Some((id, Resolution::Accepted)));
        tokio::time::advance(WINDOW * 2).await;
        assert_eq!(exchange.on_deadline(Instant::now()), None);
        assert!(!exchange.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_then_ack_resolves_once() {
        let (_transport, channel) = channel().await;
        let mut exchange = ExchangeCoordinator::new(WINDOW);

        let id = exchange.send(&channel, "Home", "x").await.unwrap();
        assert_eq!(exchange.on_deadline(Instant::now()), None, "deadline not reached yet");

        tokio::time::advance(WINDOW).await;
        assert_eq!(exchange.on_deadline(Instant::now()), Some((id, Resolution::TimedOut)));
        assert_eq!(exchange.on_ack(&Ack::ok()), None);
    }

    #[tokio::test]
    async fn second_send_is_rejected() {
        let (transport, channel) = channel().await;
        let mut exchange = ExchangeCoordinator::new(WINDOW);

        exchange.send(&channel, "Home", "x").await.unwrap();
        let err = exchange.send(&channel, "Office", "y").await.unwrap_err();
        assert!(matches!(err, ProvisioningError::ExchangeInProgress));
        assert_eq!(transport.commands().len(), 1);
    }

    #[tokio::test]
    async fn error_ack_carries_device_message() {
        let (_transport, channel) = channel().await;
        let mut exchange = ExchangeCoordinator::new(WINDOW);

        let id = exchange.send(&channel, "Home", "x").await.unwrap();
        assert_eq!(
            exchange.on_ack(&Ack::error("wrong password")),
            Some((id, Resolution::Rejected("wrong password".into())))
        );
    }

    #[tokio::test]
    async fn failed_write_stays_idle() {
        let (transport, channel) = channel().await;
        transport.fail_writes(true);
        let mut exchange = ExchangeCoordinator::new(WINDOW);

        let err = exchange.send(&channel, "Home", "x").await.unwrap_err();
        assert!(matches!(err, ProvisioningError::Transport(TransportError::Write(_))));
        assert!(!exchange.is_pending());
        assert_eq!(exchange.deadline(), None);
    }

    #[tokio::test]
    async fn late_ack_after_cancel_is_ignored() {
        let (_transport, channel) = channel().await;
        let mut exchange = ExchangeCoordinator::new(WINDOW);

        exchange.send(&channel, "Home", "x").await.unwrap();
        assert!(exchange.cancel());
        assert_eq!(exchange.on_ack(&Ack::ok()), None);
        assert!(!exchange.cancel());
    }
}
