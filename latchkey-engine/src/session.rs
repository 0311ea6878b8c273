//! Provisioning State Machine
//!
//! [`start_session`] splits a session into a cloneable [`SessionHandle`] for
//! the UI and a [`SessionDriver`] that owns the transport, the control
//! channel and every piece of mutable state. The driver runs one loop that
//! takes UI requests, device notifications and timer expiries in turn, so no
//! two transitions ever overlap.
//!
//! While the driver is waiting on the radio or the remote store it keeps
//! reading requests: anything but a teardown is answered with
//! [`ProvisioningError::Busy`], and a teardown cancels the call.

use std::future::{Future, pending};

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use latchkey_ble::{Channel, DeviceInfo, Notifications, Transport, TransportError};
use latchkey_proto::{Command, DeviceMessage, FrameDecoder, NetworkReport};

use crate::exchange::{ExchangeCoordinator, Resolution};
use crate::reconcile::{RemoteStore, SaveOutcome, reconcile};
use crate::scan::{NetworkObservation, ScanAggregator};
use crate::state::{ConfigDraft, ConnectionState, ControlLink, ProvisioningState, Snapshot};
use crate::{EngineConfig, LockId, ProvisioningError};

use ProvisioningState::*;

const REQUEST_QUEUE: usize = 16;

type Reply<T> = oneshot::Sender<Result<T, ProvisioningError>>;

fn answer<T>(reply: Reply<T>, result: Result<T, ProvisioningError>) {
    // the caller may have given up waiting
    let _ = reply.send(result);
}

enum Request {
    Discover(Reply<Vec<DeviceInfo>>),
    SelectDevice { device_id: String, reply: Reply<()> },
    Connect { device_id: String, reply: Reply<()> },
    RequestScan(Reply<Vec<NetworkObservation>>),
    SubmitCredentials { ssid: String, password: String, reply: Reply<SaveOutcome> },
    ChooseNetwork { ssid: String, reply: Reply<()> },
    SetRadioName { name: Option<String>, reply: Reply<()> },
    ClearNetworks(Reply<()>),
    RetrySave(Reply<SaveOutcome>),
    Teardown(oneshot::Sender<()>),
}

impl Request {
    fn reject(self, err: ProvisioningError) {
        match self {
            Request::Discover(reply) => answer(reply, Err(err)),
            Request::SelectDevice { reply, .. } => answer(reply, Err(err)),
            Request::Connect { reply, .. } => answer(reply, Err(err)),
            Request::RequestScan(reply) => answer(reply, Err(err)),
            Request::SubmitCredentials { reply, .. } => answer(reply, Err(err)),
            Request::ChooseNetwork { reply, .. } => answer(reply, Err(err)),
            Request::SetRadioName { reply, .. } => answer(reply, Err(err)),
            Request::ClearNetworks(reply) => answer(reply, Err(err)),
            Request::RetrySave(reply) => answer(reply, Err(err)),
            Request::Teardown(done) => {
                let _ = done.send(());
            }
        }
    }
}

/// UI side of a provisioning session
#[derive(Clone)]
pub struct SessionHandle {
    lock_id: LockId,
    requests: mpsc::Sender<Request>,
    snapshots: watch::Receiver<Snapshot>,
}

impl SessionHandle {
    pub fn lock_id(&self) -> LockId {
        self.lock_id
    }

    async fn call<T>(
        &self,
        request: impl FnOnce(Reply<T>) -> Request,
    ) -> Result<T, ProvisioningError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(request(tx))
            .await
            .map_err(|_| ProvisioningError::SessionClosed)?;
        rx.await.map_err(|_| ProvisioningError::SessionClosed)?
    }

    /// Look for nearby devices
    pub async fn discover(&self) -> Result<Vec<DeviceInfo>, ProvisioningError> {
        self.call(Request::Discover).await
    }

    /// Pick a discovered device without connecting yet
    pub async fn select_device(&self, device_id: &str) -> Result<(), ProvisioningError> {
        let device_id = device_id.to_string();
        self.call(|reply| Request::SelectDevice { device_id, reply }).await
    }

    /// Select a discovered device and open its control channel
    pub async fn connect(&self, device_id: &str) -> Result<(), ProvisioningError> {
        let device_id = device_id.to_string();
        self.call(|reply| Request::Connect { device_id, reply }).await
    }

    /// Ask the lock for nearby networks; resolves when the scan finishes or
    /// its window elapses, with whatever was collected
    pub async fn request_scan(&self) -> Result<Vec<NetworkObservation>, ProvisioningError> {
        self.call(Request::RequestScan).await
    }

    /// Push credentials to the lock; on acknowledgment the configuration is
    /// saved remotely before this resolves
    pub async fn submit_credentials(
        &self,
        ssid: &str,
        password: &str,
    ) -> Result<SaveOutcome, ProvisioningError> {
        let (ssid, password) = (ssid.to_string(), password.to_string());
        self.call(|reply| Request::SubmitCredentials { ssid, password, reply }).await
    }

    /// Use a network from the last scan as the draft SSID
    pub async fn choose_network(&self, ssid: &str) -> Result<(), ProvisioningError> {
        let ssid = ssid.to_string();
        self.call(|reply| Request::ChooseNetwork { ssid, reply }).await
    }

    pub async fn set_radio_name(&self, name: Option<&str>) -> Result<(), ProvisioningError> {
        let name = name.map(str::to_string);
        self.call(|reply| Request::SetRadioName { name, reply }).await
    }

    pub async fn clear_networks(&self) -> Result<(), ProvisioningError> {
        self.call(Request::ClearNetworks).await
    }

    /// Save the last acknowledged configuration again without touching the
    /// device
    pub async fn retry_save(&self) -> Result<SaveOutcome, ProvisioningError> {
        self.call(Request::RetrySave).await
    }

    /// Cancel timers, unsubscribe and disconnect. Safe to call repeatedly.
    pub async fn teardown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.requests.send(Request::Teardown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.clone()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshots.borrow().clone()
    }
}

/// Validate the lock id and create a session. Nothing touches the transport
/// until the driver runs.
pub fn start_session<T: Transport, S: RemoteStore>(
    lock_id: &str,
    transport: T,
    store: S,
    config: EngineConfig,
) -> Result<(SessionHandle, SessionDriver<T, S>), ProvisioningError> {
    let lock_id = LockId::parse(lock_id)?;
    let (requests_tx, requests) = mpsc::channel(REQUEST_QUEUE);
    let (snapshots, snapshots_rx) = watch::channel(Snapshot::default());

    let handle = SessionHandle { lock_id, requests: requests_tx, snapshots: snapshots_rx };
    let driver = SessionDriver {
        lock_id,
        transport,
        store,
        exchange: ExchangeCoordinator::new(config.ack_timeout),
        config,
        requests,
        snapshots,
        state: Disconnected,
        devices: Vec::new(),
        link: None,
        active: None,
        half_open: None,
        notifications: None,
        decoder: FrameDecoder::new(),
        scan: ScanAggregator::new(),
        scan_deadline: None,
        scan_reply: None,
        exchange_reply: None,
        sent: None,
        draft: ConfigDraft::default(),
        unsaved: None,
        status: "idle".to_string(),
        error: None,
    };
    Ok((handle, driver))
}

struct Active<T: Transport> {
    link: T::Link,
    channel: T::Channel,
}

enum Event {
    Request(Request),
    Notification(Vec<u8>),
    LinkLost,
    ScanDeadline,
    AckDeadline,
    Closed,
}

/// A teardown arrived while a call was in flight
struct Interrupted(oneshot::Sender<()>);

/// Run `op` while answering every request except teardown with `Busy`
async fn exclusive<F: Future>(
    requests: &mut mpsc::Receiver<Request>,
    op: F,
) -> Result<F::Output, Interrupted> {
    tokio::pin!(op);
    let mut open = true;
    loop {
        tokio::select! {
            biased;
            output = &mut op => return Ok(output),
            request = requests.recv(), if open => match request {
                Some(Request::Teardown(done)) => return Err(Interrupted(done)),
                Some(request) => {
                    debug!("rejecting request while busy");
                    request.reject(ProvisioningError::Busy);
                }
                None => open = false,
            },
        }
    }
}

async fn next_notification(stream: &mut Option<Notifications>) -> Option<Vec<u8>> {
    match stream {
        Some(stream) => stream.next().await,
        None => pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

/// Owner of one provisioning session
pub struct SessionDriver<T: Transport, S: RemoteStore> {
    lock_id: LockId,
    transport: T,
    store: S,
    config: EngineConfig,
    requests: mpsc::Receiver<Request>,
    snapshots: watch::Sender<Snapshot>,

    state: ProvisioningState,
    devices: Vec<DeviceInfo>,
    link: Option<ControlLink>,
    active: Option<Active<T>>,
    /// Connected link whose control channel is still being opened
    half_open: Option<T::Link>,
    notifications: Option<Notifications>,
    decoder: FrameDecoder,

    scan: ScanAggregator,
    scan_deadline: Option<Instant>,
    scan_reply: Option<Reply<Vec<NetworkObservation>>>,

    exchange: ExchangeCoordinator,
    exchange_reply: Option<Reply<SaveOutcome>>,
    /// Draft written to the device by the pending exchange
    sent: Option<ConfigDraft>,
    draft: ConfigDraft,
    /// Acknowledged by the device, not yet saved remotely
    unsaved: Option<ConfigDraft>,

    status: String,
    error: Option<String>,
}

impl<T: Transport, S: RemoteStore> SessionDriver<T, S> {
    /// Serve the session until every handle is dropped
    pub async fn run(mut self) {
        info!(lock = %self.lock_id, "provisioning session started");
        self.publish();

        loop {
            let scan_deadline = self.scan_deadline;
            let ack_deadline = self.exchange.deadline();

            let event = tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => Event::Request(request),
                    None => Event::Closed,
                },
                bytes = next_notification(&mut self.notifications) => match bytes {
                    Some(bytes) => Event::Notification(bytes),
                    None => Event::LinkLost,
                },
                () = wait_until(scan_deadline) => Event::ScanDeadline,
                () = wait_until(ack_deadline) => Event::AckDeadline,
            };

            match event {
                Event::Request(request) => self.handle(request).await,
                Event::Notification(bytes) => self.on_notification(&bytes).await,
                Event::LinkLost => self.on_link_lost().await,
                Event::ScanDeadline => self.on_scan_deadline(),
                Event::AckDeadline => self.on_ack_deadline().await,
                Event::Closed => {
                    self.teardown_with(|| ProvisioningError::SessionClosed).await;
                    break;
                }
            }
            self.publish();
        }

        info!(lock = %self.lock_id, "provisioning session ended");
    }

    async fn handle(&mut self, request: Request) {
        match request {
            Request::Discover(reply) => {
                let result = self.discover().await;
                answer(reply, result);
            }
            Request::SelectDevice { device_id, reply } => {
                let result = self.select_device(&device_id).map(|_| ());
                answer(reply, result);
            }
            Request::Connect { device_id, reply } => {
                let result = self.connect(&device_id).await;
                answer(reply, result);
            }
            Request::RequestScan(reply) => self.request_scan(reply).await,
            Request::SubmitCredentials { ssid, password, reply } => {
                self.submit_credentials(ssid, password, reply).await
            }
            Request::ChooseNetwork { ssid, reply } => {
                let result = self.choose_network(ssid);
                answer(reply, result);
            }
            Request::SetRadioName { name, reply } => {
                self.draft.radio_name = name
                    .map(|n| n.trim().to_string())
                    .filter(|n| !n.is_empty());
                answer(reply, Ok(()));
            }
            Request::ClearNetworks(reply) => {
                self.scan.clear();
                answer(reply, Ok(()));
            }
            Request::RetrySave(reply) => {
                let result = if self.unsaved.is_some() {
                    self.begin("retrying save");
                    self.save().await
                } else {
                    Err(ProvisioningError::NothingToSave)
                };
                answer(reply, result);
            }
            Request::Teardown(done) => {
                self.teardown_with(|| ProvisioningError::Cancelled).await;
                let _ = done.send(());
            }
        }
    }

    // ---------------------------------------------------------------------
    // Operator actions
    // ---------------------------------------------------------------------

    async fn discover(&mut self) -> Result<Vec<DeviceInfo>, ProvisioningError> {
        if !matches!(self.state, Disconnected | Discovered) {
            return Err(self.invalid("discover devices"));
        }
        self.begin("discovering devices");

        let op = self.transport.discover(&self.config.discovery);
        match exclusive(&mut self.requests, op).await {
            Err(interrupted) => {
                self.interrupted(interrupted).await;
                Err(ProvisioningError::Cancelled)
            }
            Ok(Ok(devices)) => {
                info!(count = devices.len(), "discovery finished");
                self.status = format!("found {} device(s)", devices.len());
                self.devices = devices.clone();
                Ok(devices)
            }
            Ok(Err(e)) => Err(self.failed("discovery failed", e.into())),
        }
    }

    fn select_device(&mut self, device_id: &str) -> Result<DeviceInfo, ProvisioningError> {
        if !matches!(self.state, Disconnected | Discovered) {
            return Err(self.invalid("select a device"));
        }
        let device = self
            .devices
            .iter()
            .find(|d| d.id == device_id)
            .cloned()
            .ok_or_else(|| ProvisioningError::UnknownDevice(device_id.to_string()))?;

        self.link = Some(ControlLink::new(&device));
        self.status = format!("selected {}", device.name);
        self.set_state(Discovered);
        Ok(device)
    }

    async fn connect(&mut self, device_id: &str) -> Result<(), ProvisioningError> {
        if !matches!(self.state, Disconnected | Discovered) {
            return Err(self.invalid("connect"));
        }
        let device = self.select_device(device_id)?;
        let name = device.name.clone();

        self.set_link_state(ConnectionState::Connecting);
        self.set_state(Connecting);
        self.begin(format!("connecting to {name}"));

        let op = self.transport.connect(&device);
        let link = match exclusive(&mut self.requests, op).await {
            Err(interrupted) => {
                self.interrupted(interrupted).await;
                return Err(ProvisioningError::Cancelled);
            }
            Ok(Err(e)) => return Err(self.connect_failed(&name, e)),
            Ok(Ok(link)) => link,
        };
        // owned by the driver from here so a teardown can release it
        let link = &*self.half_open.insert(link);

        let transport = &self.transport;
        let service = self.config.service_uuid;
        let characteristic = self.config.characteristic_uuid;
        let op = async move {
            let channel = transport.open_channel(link, service, characteristic).await?;
            let notifications = channel.subscribe().await?;
            Ok::<_, TransportError>((channel, notifications))
        };

        match exclusive(&mut self.requests, op).await {
            Err(interrupted) => {
                self.interrupted(interrupted).await;
                Err(ProvisioningError::Cancelled)
            }
            Ok(Ok((channel, notifications))) => {
                let Some(link) = self.half_open.take() else {
                    return Err(self.invalid("connect"));
                };
                self.active = Some(Active { link, channel });
                self.notifications = Some(notifications);
                self.decoder.clear();
                self.set_link_state(ConnectionState::Connected);
                self.set_state(Connected);
                self.status = format!("connected to {name}");
                Ok(())
            }
            Ok(Err(e)) => {
                if let Some(link) = self.half_open.take() {
                    if let Err(e) = self.transport.disconnect(&link).await {
                        warn!(error = %e, "disconnect after failed channel open");
                    }
                }
                Err(self.connect_failed(&name, e))
            }
        }
    }

    fn connect_failed(&mut self, name: &str, err: TransportError) -> ProvisioningError {
        self.set_link_state(ConnectionState::Failed);
        self.set_state(Disconnected);
        self.failed(&format!("could not connect to {name}"), err.into())
    }

    async fn request_scan(&mut self, reply: Reply<Vec<NetworkObservation>>) {
        match self.state {
            Connected => {}
            ScanRequested | AwaitingAck => return answer(reply, Err(ProvisioningError::Busy)),
            _ => return answer(reply, Err(self.invalid("scan for networks"))),
        }
        if self.active.is_none() {
            return answer(reply, Err(self.invalid("scan for networks")));
        }
        let frame = match Command::ScanWifi.to_frame() {
            Ok(frame) => frame,
            Err(e) => return answer(reply, Err(e.into())),
        };

        self.scan.begin();
        self.set_state(ScanRequested);
        self.begin("requesting network scan");

        let Some(active) = self.active.as_ref() else {
            return answer(reply, Err(self.invalid("scan for networks")));
        };
        match exclusive(&mut self.requests, active.channel.write(&frame)).await {
            Err(interrupted) => {
                self.interrupted(interrupted).await;
                answer(reply, Err(ProvisioningError::Cancelled));
            }
            Ok(Ok(())) => {
                self.scan_deadline = Some(Instant::now() + self.config.scan_timeout);
                self.scan_reply = Some(reply);
                self.status = "scanning for networks".to_string();
            }
            Ok(Err(e)) => {
                self.set_state(Connected);
                let err = self.failed("scan request failed", e.into());
                answer(reply, Err(err));
            }
        }
    }

    async fn submit_credentials(
        &mut self,
        ssid: String,
        password: String,
        reply: Reply<SaveOutcome>,
    ) {
        match self.state {
            Connected => {}
            AwaitingAck => return answer(reply, Err(ProvisioningError::ExchangeInProgress)),
            ScanRequested => return answer(reply, Err(ProvisioningError::Busy)),
            _ => return answer(reply, Err(self.invalid("send credentials"))),
        }
        if ssid.trim().is_empty() {
            return answer(reply, Err(ProvisioningError::EmptySsid));
        }

        self.draft.ssid = ssid;
        self.draft.password = password;
        let sent = self.draft.clone();
        self.set_state(AwaitingAck);
        self.begin(format!("sending credentials for {}", sent.ssid));

        let Some(active) = self.active.as_ref() else {
            return answer(reply, Err(self.invalid("send credentials")));
        };
        let op = self.exchange.send(&active.channel, &sent.ssid, &sent.password);
        match exclusive(&mut self.requests, op).await {
            Err(interrupted) => {
                self.interrupted(interrupted).await;
                answer(reply, Err(ProvisioningError::Cancelled));
            }
            Ok(Ok(_)) => {
                self.sent = Some(sent);
                self.exchange_reply = Some(reply);
                self.status = "waiting for the device to acknowledge".to_string();
            }
            Ok(Err(e)) => {
                self.set_state(Connected);
                let err = self.failed("could not send credentials", e);
                answer(reply, Err(err));
            }
        }
    }

    fn choose_network(&mut self, ssid: String) -> Result<(), ProvisioningError> {
        if !self.scan.contains(&ssid) {
            return Err(ProvisioningError::UnknownNetwork(ssid));
        }
        self.status = format!("selected network {ssid}");
        self.draft.ssid = ssid;
        Ok(())
    }

    async fn save(&mut self) -> Result<SaveOutcome, ProvisioningError> {
        let Some(draft) = self.unsaved.clone() else {
            return Err(ProvisioningError::NothingToSave);
        };

        let op = reconcile(&self.store, &self.lock_id, &draft);
        match exclusive(&mut self.requests, op).await {
            Err(interrupted) => {
                self.interrupted(interrupted).await;
                Err(ProvisioningError::Cancelled)
            }
            Ok(Ok(outcome)) => {
                self.unsaved = None;
                self.status = match outcome {
                    SaveOutcome::Created => "configuration saved",
                    SaveOutcome::Updated => "configuration updated",
                }
                .to_string();
                Ok(outcome)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "saving acknowledged configuration failed");
                Err(self.failed(
                    "device configured, but server save failed",
                    ProvisioningError::Persistence(e),
                ))
            }
        }
    }

    // ---------------------------------------------------------------------
    // Device events and timers
    // ---------------------------------------------------------------------

    async fn on_notification(&mut self, bytes: &[u8]) {
        let messages: Vec<DeviceMessage> = self
            .decoder
            .feed(bytes)
            .filter_map(|value| match DeviceMessage::from_value(value) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(error = %e, "dropping device message");
                    None
                }
            })
            .collect();

        for message in messages {
            if self.active.is_none() {
                break;
            }
            debug!(kind = message.kind(), "device message");
            match message {
                DeviceMessage::ScanResult(networks) => self.on_scan_result(&networks),
                DeviceMessage::ScanFinished => self.on_scan_finished(),
                DeviceMessage::Ack(ack) => {
                    if let Some((_, resolution)) = self.exchange.on_ack(&ack) {
                        self.resolve(resolution).await;
                    }
                }
                DeviceMessage::Unknown(value) => debug!(%value, "ignoring unknown device message"),
            }
            self.publish();
        }
    }

    fn on_scan_result(&mut self, networks: &[NetworkReport]) {
        let changed = self.scan.merge(networks);
        debug!(reported = networks.len(), changed, "scan results merged");
        if self.state == ScanRequested {
            self.status = format!("scanning, {} network(s) so far", self.scan.len());
        }
    }

    fn on_scan_finished(&mut self) {
        if self.state == ScanRequested {
            let status = format!("found {} network(s)", self.scan.len());
            self.finish_scan(status);
        } else {
            debug!("scan finished with no scan pending");
            self.scan.finish();
        }
    }

    fn on_scan_deadline(&mut self) {
        let expired = self.scan_deadline.is_some_and(|d| Instant::now() >= d);
        if expired && self.state == ScanRequested {
            warn!(collected = self.scan.len(), "scan window elapsed");
            self.finish_scan("scan timed out, showing partial results".to_string());
        }
        self.scan_deadline = None;
    }

    fn finish_scan(&mut self, status: String) {
        self.scan.finish();
        self.scan_deadline = None;
        self.set_state(Connected);
        self.status = status;
        if let Some(reply) = self.scan_reply.take() {
            answer(reply, Ok(self.scan.networks()));
        }
    }

    async fn on_ack_deadline(&mut self) {
        if let Some((_, resolution)) = self.exchange.on_deadline(Instant::now()) {
            self.resolve(resolution).await;
        }
    }

    async fn resolve(&mut self, resolution: Resolution) {
        let reply = self.exchange_reply.take();
        let sent = self.sent.take();
        self.set_state(Connected);

        let result = match resolution {
            Resolution::Accepted => {
                info!("device accepted the configuration");
                self.unsaved = sent;
                self.status = "device accepted the configuration, saving".to_string();
                self.publish();
                self.save().await
            }
            Resolution::Rejected(message) => Err(self.failed(
                "device rejected the configuration",
                ProvisioningError::DeviceRejected(message),
            )),
            Resolution::TimedOut => {
                let window = self.exchange.window();
                Err(self.failed(
                    "no acknowledgment from the device",
                    ProvisioningError::ExchangeTimeout(window),
                ))
            }
        };

        if let Some(reply) = reply {
            answer(reply, result);
        }
    }

    async fn on_link_lost(&mut self) {
        warn!("notification stream ended, link lost");
        self.teardown_with(|| TransportError::LinkLost.into()).await;
        self.status = "connection lost".to_string();
        self.error = Some(TransportError::LinkLost.to_string());
    }

    // ---------------------------------------------------------------------
    // Teardown
    // ---------------------------------------------------------------------

    async fn interrupted(&mut self, Interrupted(done): Interrupted) {
        info!("teardown requested while a call was in flight");
        self.teardown_with(|| ProvisioningError::Cancelled).await;
        let _ = done.send(());
    }

    /// Cancel timers, fail waiters, unsubscribe, then disconnect
    async fn teardown_with(&mut self, cause: impl Fn() -> ProvisioningError) {
        self.scan_deadline = None;
        if self.exchange.cancel() {
            debug!("pending credential exchange cancelled");
        }
        self.sent = None;
        if let Some(reply) = self.scan_reply.take() {
            answer(reply, Err(cause()));
        }
        if let Some(reply) = self.exchange_reply.take() {
            answer(reply, Err(cause()));
        }

        self.notifications = None;
        if let Some(active) = self.active.take() {
            if let Err(e) = active.channel.unsubscribe().await {
                warn!(error = %e, "unsubscribe failed");
            }
            if let Err(e) = self.transport.disconnect(&active.link).await {
                warn!(error = %e, "disconnect failed");
            }
        }
        if let Some(link) = self.half_open.take() {
            if let Err(e) = self.transport.disconnect(&link).await {
                warn!(error = %e, "disconnect of half-open link failed");
            }
        }
        self.decoder.clear();
        self.link = None;

        if self.state != Disconnected {
            self.set_state(Disconnected);
            self.status = "disconnected".to_string();
        }
    }

    // ---------------------------------------------------------------------
    // Bookkeeping
    // ---------------------------------------------------------------------

    fn set_state(&mut self, next: ProvisioningState) {
        if self.state != next {
            info!(from = ?self.state, to = ?next, "session state");
            self.state = next;
        }
    }

    fn set_link_state(&mut self, connection_state: ConnectionState) {
        if let Some(link) = self.link.as_mut() {
            link.connection_state = connection_state;
        }
    }

    /// An accepted action starts: new status, previous error cleared
    fn begin(&mut self, status: impl Into<String>) {
        self.status = status.into();
        self.error = None;
        self.publish();
    }

    fn failed(&mut self, status: &str, err: ProvisioningError) -> ProvisioningError {
        warn!(error = %err, "{status}");
        self.status = status.to_string();
        self.error = Some(err.to_string());
        err
    }

    fn invalid(&self, operation: &'static str) -> ProvisioningError {
        ProvisioningError::InvalidState { operation, state: self.state }
    }

    fn publish(&self) {
        self.snapshots.send_replace(Snapshot {
            state: self.state,
            link: self.link.clone(),
            devices: self.devices.clone(),
            networks: self.scan.networks(),
            scan_complete: self.scan.is_finished(),
            draft_ssid: self.draft.ssid.clone(),
            radio_name: self.draft.radio_name.clone(),
            unsaved: self.unsaved.is_some(),
            status_message: self.status.clone(),
            error: self.error.clone(),
        });
    }
}
