//! In-memory transport for exercising the engine without a radio
//!
//! A [`MockTransport`] plays the lock: commands written to its channel are
//! decoded and handed to an optional responder, whose replies come back as
//! notifications. Tests can also push notifications directly, drop the link,
//! or make any step fail.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::StreamExt;
use futures::channel::mpsc;
use serde_json::Value;
use uuid::Uuid;

use latchkey_proto::FrameDecoder;

use crate::{Channel, DeviceInfo, DiscoveryFilter, Notifications, Transport, TransportError};

type Responder = Box<dyn FnMut(&Value) -> Vec<Vec<u8>> + Send>;

#[derive(Default)]
struct MockState {
    devices: Vec<DeviceInfo>,
    connected: Option<String>,
    subscriber: Option<mpsc::UnboundedSender<Vec<u8>>>,
    decoder: FrameDecoder,
    commands: Vec<Value>,
    responder: Option<Responder>,
    fail_connect: bool,
    fail_channel: bool,
    fail_writes: bool,
    connect_delay: Option<Duration>,
    channel_delay: Option<Duration>,
    connects: usize,
    disconnects: usize,
    unsubscribes: usize,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        let transport = Self::default();
        transport.lock().devices = devices;
        transport
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock transport state poisoned")
    }

    /// Reply to each decoded command with the returned notification payloads
    pub fn respond_with(&self, responder: impl FnMut(&Value) -> Vec<Vec<u8>> + Send + 'static) {
        self.lock().responder = Some(Box::new(responder));
    }

    /// Deliver one notification; false if nobody is subscribed
    pub fn notify(&self, bytes: &[u8]) -> bool {
        match &self.lock().subscriber {
            Some(tx) => tx.unbounded_send(bytes.to_vec()).is_ok(),
            None => false,
        }
    }

    /// Simulate the device going out of range: the notification stream ends
    pub fn drop_link(&self) {
        let mut state = self.lock();
        state.subscriber = None;
        state.connected = None;
    }

    pub fn fail_connect(&self, fail: bool) {
        self.lock().fail_connect = fail;
    }

    pub fn fail_channel(&self, fail: bool) {
        self.lock().fail_channel = fail;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.lock().connect_delay = Some(delay);
    }

    /// Delay service discovery after the link is up
    pub fn set_channel_delay(&self, delay: Duration) {
        self.lock().channel_delay = Some(delay);
    }

    /// Every command the device has decoded so far
    pub fn commands(&self) -> Vec<Value> {
        self.lock().commands.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected.is_some()
    }

    pub fn is_subscribed(&self) -> bool {
        self.lock().subscriber.is_some()
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    pub fn disconnect_count(&self) -> usize {
        self.lock().disconnects
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.lock().unsubscribes
    }
}

impl Transport for MockTransport {
    type Link = String;
    type Channel = MockChannel;

    async fn discover(&self, filter: &DiscoveryFilter) -> Result<Vec<DeviceInfo>, TransportError> {
        let state = self.lock();
        Ok(state.devices.iter().filter(|d| filter.accepts(d)).cloned().collect())
    }

    async fn connect(&self, device: &DeviceInfo) -> Result<String, TransportError> {
        let delay = self.lock().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        state.connects += 1;
        if state.fail_connect {
            return Err(TransportError::Connection {
                device: device.id.clone(),
                reason: "simulated connect failure".into(),
            });
        }
        if !state.devices.iter().any(|d| d.id == device.id) {
            return Err(TransportError::DeviceNotFound(device.id.clone()));
        }
        state.connected = Some(device.id.clone());
        Ok(device.id.clone())
    }

    async fn open_channel(
        &self,
        link: &String,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> Result<MockChannel, TransportError> {
        let delay = self.lock().channel_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.lock();
        if state.fail_channel {
            return Err(TransportError::Channel("simulated missing characteristic".into()));
        }
        if state.connected.as_deref() != Some(link.as_str()) {
            return Err(TransportError::LinkLost);
        }
        Ok(MockChannel { state: self.state.clone() })
    }

    async fn disconnect(&self, _link: &String) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.disconnects += 1;
        state.connected = None;
        state.subscriber = None;
        Ok(())
    }
}

pub struct MockChannel {
    state: Arc<Mutex<MockState>>,
}

impl MockChannel {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock transport state poisoned")
    }
}

impl Channel for MockChannel {
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.fail_writes {
            return Err(TransportError::Write("simulated write failure".into()));
        }
        if state.connected.is_none() {
            return Err(TransportError::LinkLost);
        }

        let commands: Vec<Value> = state.decoder.feed(bytes).collect();
        for command in commands {
            let replies = match state.responder.as_mut() {
                Some(responder) => responder(&command),
                None => Vec::new(),
            };
            if let Some(tx) = &state.subscriber {
                for reply in replies {
                    let _ = tx.unbounded_send(reply);
                }
            }
            state.commands.push(command);
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<Notifications, TransportError> {
        let (tx, rx) = mpsc::unbounded();
        self.lock().subscriber = Some(tx);
        Ok(rx.boxed())
    }

    async fn unsubscribe(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.unsubscribes += 1;
        state.subscriber = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use latchkey_proto::{Command, encode};
    use serde_json::json;

    fn lock_device() -> DeviceInfo {
        DeviceInfo { id: "AA:BB".into(), name: "Latchkey-1".into(), rssi: Some(-40) }
    }

    #[tokio::test]
    async fn responder_replies_arrive_as_notifications() {
        let transport = MockTransport::new(vec![lock_device()]);
        transport.respond_with(|cmd| {
            assert_eq!(cmd["action"], "scan_wifi");
            vec![encode(&json!({"type": "scan_finished"})).unwrap()]
        });

        let link = transport.connect(&lock_device()).await.unwrap();
        let channel = transport
            .open_channel(&link, Uuid::nil(), Uuid::nil())
            .await
            .unwrap();
        let mut notifications = channel.subscribe().await.unwrap();

        // split the command across two writes like a small MTU would
        let frame = Command::ScanWifi.to_frame().unwrap();
        let (a, b) = frame.split_at(4);
        channel.write(a).await.unwrap();
        assert!(transport.commands().is_empty());
        channel.write(b).await.unwrap();

        assert_eq!(transport.commands(), vec![json!({"action": "scan_wifi"})]);
        let reply = notifications.next().await.unwrap();
        assert_eq!(reply, encode(&json!({"type": "scan_finished"})).unwrap());
    }

    #[tokio::test]
    async fn drop_link_ends_notification_stream() {
        let transport = MockTransport::new(vec![lock_device()]);
        let link = transport.connect(&lock_device()).await.unwrap();
        let channel = transport
            .open_channel(&link, Uuid::nil(), Uuid::nil())
            .await
            .unwrap();
        let mut notifications = channel.subscribe().await.unwrap();

        transport.drop_link();
        assert!(notifications.next().await.is_none());
        assert!(matches!(channel.write(b"x").await, Err(TransportError::LinkLost)));
    }
}
