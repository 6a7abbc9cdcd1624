//! Bridge Service Module
//!
//! Main service that coordinates discovery, connection, command traffic
//! and the report pipeline for the two controller halves.
//!
//! ```text
//! notification ──► classify ─┬─ reply ──► CommandQueue::handle_reply
//!                            └─ input ──► decode ──► fusion ──► mapper ──► VirtualPad
//! ```

use crate::domain::fusion::{ControllerFusion, FusionUpdate};
use crate::domain::mapper::OutputMapper;
use crate::domain::models::{
    BridgeEvent, ConnectionStatus, EndpointId, IdentityHint, MessageSeverity, PadSnapshot,
    StatusMessage,
};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::commands::{CommandQueue, QueueTiming};
use crate::infrastructure::bluetooth::protocol::{self, InboundFrame};
use crate::infrastructure::bluetooth::transport::{FrameWriter, Transport, TransportEvent};
use crate::infrastructure::virtual_pad::VirtualPad;
use anyhow::Result;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Runtime configuration for the bridge
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub timing: QueueTiming,
    pub solo_tolerance: u16,
    /// Player slot shown on the indicator lights, 1-4
    pub player_indicator: u8,
    pub read_factory_calibration: bool,
    /// `None` disables the keep-alive frame
    pub keep_alive_interval: Option<Duration>,
    pub reconnect_delay: Duration,
    pub raw_data_logging: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl BridgeConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            timing: QueueTiming {
                min_spacing: settings.commands.min_spacing(),
                ack_timeout: settings.commands.ack_timeout(),
                retry_limit: settings.commands.retry_limit,
            },
            solo_tolerance: settings.solo_deviation_tolerance,
            player_indicator: settings.player_indicator,
            read_factory_calibration: settings.read_factory_calibration,
            keep_alive_interval: (settings.keep_alive_interval_ms > 0)
                .then(|| Duration::from_millis(settings.keep_alive_interval_ms)),
            reconnect_delay: Duration::from_millis(settings.reconnect_delay_ms),
            raw_data_logging: settings.debug_raw_data_logging,
        }
    }
}

/// Main service tying the transport to the fusion pipeline
pub struct BridgeService<T: Transport> {
    transport: Arc<T>,
    commands: Arc<CommandQueue>,
    fusion: ControllerFusion,
    mapper: RwLock<OutputMapper>,
    pad: Arc<dyn VirtualPad>,
    event_sender: mpsc::UnboundedSender<BridgeEvent>,
    config: BridgeConfig,
}

impl<T: Transport> BridgeService<T> {
    pub fn new(
        transport: Arc<T>,
        pad: Arc<dyn VirtualPad>,
        event_sender: mpsc::UnboundedSender<BridgeEvent>,
        config: BridgeConfig,
    ) -> Self {
        let writer: Arc<dyn FrameWriter> = transport.clone();
        Self {
            commands: Arc::new(CommandQueue::new(writer, config.timing)),
            fusion: ControllerFusion::new(config.solo_tolerance),
            mapper: RwLock::new(OutputMapper::default()),
            transport,
            pad,
            event_sender,
            config,
        }
    }

    pub fn commands(&self) -> &Arc<CommandQueue> {
        &self.commands
    }

    pub fn fusion(&self) -> &ControllerFusion {
        &self.fusion
    }

    pub fn mapper(&self) -> OutputMapper {
        *self.mapper.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn send_log(&self, message: impl Into<String>, severity: MessageSeverity) {
        let _ = self.event_sender.send(BridgeEvent::LogMessage(StatusMessage {
            message: message.into(),
            severity,
        }));
    }

    fn send_status(&self, status: ConnectionStatus) {
        let _ = self.event_sender.send(BridgeEvent::ConnectionStatus(status));
    }

    fn publish(&self, update: &FusionUpdate) {
        if update.resolution.changed {
            let roles = update
                .resolution
                .assignments
                .iter()
                .map(|(id, a)| (id.clone(), a.role))
                .collect();
            let _ = self.event_sender.send(BridgeEvent::RolesChanged(roles));
        }
        if update.degraded_changed {
            if update.resolution.degraded {
                self.send_log(
                    "Could not tell the halves apart yet",
                    MessageSeverity::Warning,
                );
            }
            let _ = self
                .event_sender
                .send(BridgeEvent::DegradedRoles(update.resolution.degraded));
        }
    }

    /// Handle one raw notification from an endpoint.
    ///
    /// Returns the snapshot pushed to the pad, or `None` if the bytes were a
    /// command reply or could not be decoded.
    pub fn on_raw_report(&self, endpoint: &EndpointId, bytes: &[u8]) -> Option<PadSnapshot> {
        if self.config.raw_data_logging {
            trace!("Raw from {}: {:02X?}", endpoint, bytes);
        }

        let payload = match protocol::classify(bytes) {
            InboundFrame::Reply(reply) => {
                self.commands.handle_reply(reply);
                return None;
            }
            InboundFrame::Input(payload) => payload,
        };

        let report = match protocol::decode_input_report(payload) {
            Ok(report) => report,
            Err(e) => {
                debug!("Dropping report from {}: {}", endpoint, e);
                return None;
            }
        };

        let update = self.fusion.ingest(endpoint, &report);
        self.publish(&update);
        Some(self.emit(&update))
    }

    fn emit(&self, update: &FusionUpdate) -> PadSnapshot {
        let snapshot = self.mapper().map(&update.fused);
        if let Err(e) = self.pad.submit(&snapshot) {
            warn!("Virtual pad rejected output: {}", e);
        }
        let _ = self.event_sender.send(BridgeEvent::Output(snapshot));
        snapshot
    }

    pub fn on_connected(&self, endpoint: &EndpointId, hint: Option<IdentityHint>) {
        let hint = hint.or_else(|| self.transport.identity_hint(endpoint));
        info!("Endpoint {} connected ({:?})", endpoint, hint);
        let update = self.fusion.connect(endpoint, hint);
        self.publish(&update);
        self.send_log(format!("{} connected", endpoint), MessageSeverity::Success);
        self.send_status(ConnectionStatus::Connected);
    }

    pub fn on_identity(&self, endpoint: &EndpointId, hint: IdentityHint) {
        debug!("Identity for {}: {:?}", endpoint, hint);
        let update = self.fusion.identify(endpoint, hint);
        self.publish(&update);
    }

    pub fn on_disconnect(&self, endpoint: &EndpointId) {
        let Some(update) = self.fusion.disconnect(endpoint) else {
            debug!("Disconnect for unknown endpoint {}", endpoint);
            return;
        };
        self.publish(&update);
        self.emit(&update);
        self.send_log(format!("{} disconnected", endpoint), MessageSeverity::Info);
        if self.fusion.endpoint_count() == 0 {
            self.send_status(ConnectionStatus::Disconnected);
        }
    }

    /// Drop every endpoint, abort queued commands and forget installed
    /// calibration.
    ///
    /// Used when the transport stops reporting disconnects reliably.
    pub fn force_clear(&self) {
        self.fusion.force_clear();
        self.commands.cancel();
        *self.mapper.write().unwrap_or_else(PoisonError::into_inner) = OutputMapper::default();
        let snapshot = self.mapper().map(&self.fusion.snapshot());
        if let Err(e) = self.pad.submit(&snapshot) {
            warn!("Virtual pad rejected output: {}", e);
        }
        let _ = self.event_sender.send(BridgeEvent::Output(snapshot));
    }

    /// Connect-time commands: player indicator, then factory calibration.
    ///
    /// Failures are logged; the endpoint stays usable with defaults.
    pub async fn configure_endpoint(&self, endpoint: &EndpointId) {
        if let Err(e) = self
            .commands
            .set_player_indicator(endpoint, self.config.player_indicator)
            .await
        {
            warn!("Player indicator for {} failed: {}", endpoint, e);
        }

        if !self.config.read_factory_calibration {
            return;
        }
        match self.commands.read_stick_calibration(endpoint).await {
            Ok(block) => {
                let installed = self
                    .mapper
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .install_factory(&block);
                info!(
                    "Installed factory calibration from {} ({} stick(s))",
                    endpoint, installed
                );
            }
            Err(e) => {
                warn!(
                    "Factory calibration read from {} failed, using defaults: {}",
                    endpoint, e
                );
            }
        }
    }

    async fn keep_alive_all(&self) {
        for endpoint in self.fusion.endpoints() {
            if let Err(e) = self.commands.keep_alive(&endpoint).await {
                debug!("Keep-alive to {} failed: {}", endpoint, e);
            }
        }
    }

    /// Outer discovery loop. Runs until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        info!("Bridge service started");
        while !cancel.is_cancelled() {
            self.send_status(ConnectionStatus::Connecting);
            let cycle = cancel.child_token();
            self.run_cycle(&cycle).await;
            cycle.cancel();
            self.force_clear();

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
        info!("Bridge service stopped");
        Ok(())
    }

    async fn run_cycle(self: &Arc<Self>, cycle: &CancellationToken) {
        let mut events = self.transport.subscribe();

        let endpoints = tokio::select! {
            _ = cycle.cancelled() => return,
            result = self.transport.scan() => result,
        };
        let endpoints = match endpoints {
            Ok(endpoints) => endpoints,
            Err(e) => {
                warn!("Scan failed: {:#}", e);
                self.send_log(format!("Scan failed: {}", e), MessageSeverity::Error);
                return;
            }
        };
        if endpoints.is_empty() {
            debug!("No controller halves found");
            return;
        }

        let mut connected = 0;
        for endpoint in &endpoints {
            match self.transport.connect(endpoint).await {
                Ok(()) => connected += 1,
                Err(e) => warn!("Connect to {} failed: {:#}", endpoint, e),
            }
        }
        if connected == 0 {
            self.send_status(ConnectionStatus::Error);
            return;
        }

        if let Some(interval) = self.config.keep_alive_interval {
            tokio::spawn(self.clone().keep_alive_loop(interval, cycle.clone()));
        }

        loop {
            let event = tokio::select! {
                _ = cycle.cancelled() => return,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                info!("Transport event stream closed");
                return;
            };
            self.handle_event(event, cycle);
            if self.fusion.endpoint_count() == 0 {
                info!("All endpoints gone, restarting discovery");
                return;
            }
        }
    }

    fn handle_event(self: &Arc<Self>, event: TransportEvent, cycle: &CancellationToken) {
        match event {
            TransportEvent::Connected { endpoint, hint } => {
                self.on_connected(&endpoint, hint);
                let service = self.clone();
                let cycle = cycle.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cycle.cancelled() => {}
                        _ = service.configure_endpoint(&endpoint) => {}
                    }
                });
            }
            TransportEvent::Identity { endpoint, hint } => self.on_identity(&endpoint, hint),
            TransportEvent::Notification { endpoint, payload } => {
                self.on_raw_report(&endpoint, &payload);
            }
            TransportEvent::Disconnected { endpoint } => self.on_disconnect(&endpoint),
        }
    }

    async fn keep_alive_loop(self: Arc<Self>, period: Duration, cycle: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cycle.cancelled() => return,
                _ = ticker.tick() => self.keep_alive_all().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::buttons::{Button, ButtonSet};
    use crate::domain::mapper::{
        FactoryStick, FactoryStickBlock, PadButtons, StickCalibration, OUTPUT_MAX,
    };
    use crate::domain::models::{Role, STICK_NEUTRAL};
    use crate::infrastructure::bluetooth::protocol::{
        build_reply_frame, frame_sequence, pack_stick_pair, STICK_UNUSED_SENTINEL,
    };
    use crate::infrastructure::virtual_pad::TracingPad;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockTransport {
        writes: Mutex<Vec<(EndpointId, Vec<u8>)>>,
        forward: Mutex<Option<mpsc::UnboundedSender<(EndpointId, Vec<u8>)>>>,
        scans: Mutex<VecDeque<Vec<EndpointId>>>,
        scripts: Mutex<VecDeque<Vec<TransportEvent>>>,
    }

    impl FrameWriter for MockTransport {
        fn write(&self, endpoint: &EndpointId, bytes: &[u8]) -> bool {
            self.writes
                .lock()
                .unwrap()
                .push((endpoint.clone(), bytes.to_vec()));
            if let Some(forward) = self.forward.lock().unwrap().as_ref() {
                let _ = forward.send((endpoint.clone(), bytes.to_vec()));
            }
            true
        }
    }

    impl Transport for MockTransport {
        async fn scan(&self) -> Result<Vec<EndpointId>> {
            Ok(self.scans.lock().unwrap().pop_front().unwrap_or_default())
        }

        async fn connect(&self, _endpoint: &EndpointId) -> Result<()> {
            Ok(())
        }

        fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
            let (tx, rx) = mpsc::unbounded_channel();
            for event in self.scripts.lock().unwrap().pop_front().unwrap_or_default() {
                let _ = tx.send(event);
            }
            rx
        }

        fn identity_hint(&self, _endpoint: &EndpointId) -> Option<IdentityHint> {
            None
        }
    }

    type Harness = (
        Arc<BridgeService<MockTransport>>,
        Arc<MockTransport>,
        Arc<TracingPad>,
        mpsc::UnboundedReceiver<BridgeEvent>,
    );

    fn harness(config: BridgeConfig) -> Harness {
        let transport = Arc::new(MockTransport::default());
        let pad = Arc::new(TracingPad::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Arc::new(BridgeService::new(
            transport.clone(),
            pad.clone(),
            tx,
            config,
        ));
        (service, transport, pad, rx)
    }

    fn input(buttons: &[Button], left: (u16, u16), right: (u16, u16)) -> Vec<u8> {
        let bits = buttons.iter().copied().collect::<ButtonSet>().bits();
        let mut bytes = vec![0u8; protocol::INPUT_REPORT_LEN + 1];
        bytes[0] = protocol::NOTIFICATION_PREFIX;
        let body = &mut bytes[1..];
        body[protocol::BUTTONS_OFFSET..protocol::BUTTONS_OFFSET + 4]
            .copy_from_slice(&bits.to_le_bytes());
        let s = protocol::STICKS_OFFSET;
        body[s..s + 3].copy_from_slice(&pack_stick_pair(left.0, left.1));
        body[s + 3..s + 6].copy_from_slice(&pack_stick_pair(right.0, right.1));
        bytes
    }

    const UNUSED: (u16, u16) = (STICK_UNUSED_SENTINEL, STICK_UNUSED_SENTINEL);
    const CENTER: (u16, u16) = (STICK_NEUTRAL, STICK_NEUTRAL);

    fn drain(rx: &mut mpsc::UnboundedReceiver<BridgeEvent>) -> Vec<BridgeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_two_halves_fuse_into_one_pad() {
        let (service, _, pad, mut rx) = harness(BridgeConfig::default());
        let left = EndpointId::from("a");
        let right = EndpointId::from("b");
        service.on_connected(&left, Some(IdentityHint::new("Joy-Con 2 (L)", None)));
        service.on_connected(&right, Some(IdentityHint::new("Joy-Con 2 (R)", None)));

        service.on_raw_report(&left, &input(&[Button::Zl], (1998 + 1251, 1998), UNUSED));
        let snapshot = service
            .on_raw_report(&right, &input(&[Button::A], UNUSED, CENTER))
            .unwrap();

        assert_eq!(snapshot.left_axis_x, OUTPUT_MAX);
        assert_eq!(snapshot.right_axis_x, 0);
        assert_eq!(snapshot.left_trigger, 255);
        assert!(snapshot.buttons.contains(PadButtons::EAST));
        assert_eq!(pad.last(), Some(snapshot));

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            BridgeEvent::RolesChanged(roles) if roles.contains(&(right.clone(), Role::Right))
        )));
        assert!(matches!(events.last(), Some(BridgeEvent::Output(s)) if *s == snapshot));
    }

    #[tokio::test]
    async fn test_undecodable_report_is_dropped() {
        let (service, _, pad, mut rx) = harness(BridgeConfig::default());
        let id = EndpointId::from("a");
        service.on_connected(&id, None);
        drain(&mut rx);

        assert!(service.on_raw_report(&id, &[0xA1, 0x00, 0x01]).is_none());
        assert!(pad.last().is_none());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_degraded_flag_is_published() {
        let (service, _, _, mut rx) = harness(BridgeConfig::default());
        let a = EndpointId::from("a");
        let b = EndpointId::from("b");
        service.on_connected(&a, None);
        service.on_connected(&b, None);
        service.on_raw_report(&a, &input(&[], CENTER, CENTER));

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, BridgeEvent::DegradedRoles(true))));

        // Sentinels settle the sides.
        service.on_raw_report(&a, &input(&[], CENTER, UNUSED));
        service.on_raw_report(&b, &input(&[], UNUSED, CENTER));
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, BridgeEvent::DegradedRoles(false))));
        assert_eq!(service.fusion().role_of(&b), Some(Role::Right));
    }

    #[tokio::test]
    async fn test_last_disconnect_reports_status_and_releases_buttons() {
        let (service, _, pad, mut rx) = harness(BridgeConfig::default());
        let id = EndpointId::from("a");
        service.on_connected(&id, Some(IdentityHint::new("Joy-Con 2 (R)", None)));
        service.on_raw_report(&id, &input(&[Button::Zr], UNUSED, CENTER));
        assert_eq!(pad.last().unwrap().right_trigger, 255);

        service.on_disconnect(&id);
        assert_eq!(pad.last(), Some(PadSnapshot::default()));
        let events = drain(&mut rx);
        assert!(matches!(
            events.last(),
            Some(BridgeEvent::ConnectionStatus(ConnectionStatus::Disconnected))
        ));

        // A second disconnect for the same endpoint is a no-op.
        service.on_disconnect(&id);
        assert!(drain(&mut rx).is_empty());
    }

    fn right_stick_block(center: u16) -> FactoryStickBlock {
        let blank = FactoryStick {
            center: (0xFFF, 0xFFF),
            above: (0xFFF, 0xFFF),
            below: (0xFFF, 0xFFF),
        };
        FactoryStickBlock {
            left: blank,
            right: FactoryStick {
                center: (center, center),
                above: (1200, 1200),
                below: (1200, 1200),
            },
        }
    }

    #[tokio::test]
    async fn test_force_clear_resets_everything() {
        let (service, _, pad, _rx) = harness(BridgeConfig::default());
        let id = EndpointId::from("a");
        service.on_connected(&id, None);
        service.on_raw_report(&id, &input(&[Button::B], CENTER, UNUSED));
        service
            .mapper
            .write()
            .unwrap()
            .install_factory(&right_stick_block(2400));

        service.force_clear();
        assert_eq!(service.fusion().endpoint_count(), 0);
        assert_eq!(service.commands().pending_len(), 0);
        assert_eq!(service.mapper(), OutputMapper::default());
        assert_eq!(pad.last(), Some(PadSnapshot::default()));
    }

    #[tokio::test]
    async fn test_solo_right_half_uses_its_own_calibration() {
        let (service, _, _, _rx) = harness(BridgeConfig::default());
        service
            .mapper
            .write()
            .unwrap()
            .install_factory(&right_stick_block(2400));

        let id = EndpointId::from("r");
        service.on_connected(&id, Some(IdentityHint::new("Joy-Con 2 (R)", None)));
        let snapshot = service
            .on_raw_report(&id, &input(&[], UNUSED, (2400, 2400)))
            .unwrap();
        assert_eq!(service.fusion().role_of(&id), Some(Role::Solo));
        assert_eq!((snapshot.left_axis_x, snapshot.left_axis_y), (0, 0));

        let snapshot = service
            .on_raw_report(&id, &input(&[], UNUSED, (2400 + 1200, 2400)))
            .unwrap();
        assert_eq!(snapshot.left_axis_x, OUTPUT_MAX);
        assert_eq!((snapshot.right_axis_x, snapshot.right_axis_y), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_configure_installs_factory_calibration() {
        let (service, transport, _, _rx) = harness(BridgeConfig::default());
        let (tx, mut frames) = mpsc::unbounded_channel();
        *transport.forward.lock().unwrap() = Some(tx);

        let mut block = protocol::flash_read_args(0x603D, 18).to_vec();
        for pair in [
            (1200, 1200),
            (2048, 2048),
            (1100, 1100),
            (0xFFF, 0xFFF),
            (0xFFF, 0xFFF),
            (0xFFF, 0xFFF),
        ] {
            block.extend(pack_stick_pair(pair.0, pair.1));
        }

        // Fake firmware answering through the normal notification path.
        {
            let service = service.clone();
            tokio::spawn(async move {
                while let Some((endpoint, frame)) = frames.recv().await {
                    if let Some((sub, seq)) = frame_sequence(&frame) {
                        let data = if sub == protocol::subcommand::FLASH_READ {
                            block.clone()
                        } else {
                            Vec::new()
                        };
                        service.on_raw_report(&endpoint, &build_reply_frame(seq, true, sub, &data));
                    }
                }
            });
        }

        let id = EndpointId::from("a");
        service.on_connected(&id, Some(IdentityHint::new("Joy-Con 2 (L)", None)));
        service.configure_endpoint(&id).await;

        let mapper = service.mapper();
        assert_eq!(mapper.left.x.center, 2048);
        assert_eq!(mapper.left.x.positive_half, 1200);
        assert_eq!(mapper.right, StickCalibration::default());

        let subcommands: Vec<u8> = transport
            .writes
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(_, f)| frame_sequence(f).map(|(sub, _)| sub))
            .collect();
        assert_eq!(
            subcommands,
            vec![
                protocol::subcommand::SET_PLAYER_INDICATOR,
                protocol::subcommand::FLASH_READ
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_cycles_until_cancelled() {
        let config = BridgeConfig {
            keep_alive_interval: None,
            read_factory_calibration: false,
            ..BridgeConfig::default()
        };
        let (service, transport, pad, mut rx) = harness(config);
        let id = EndpointId::from("a");
        transport.scans.lock().unwrap().push_back(vec![id.clone()]);
        transport.scripts.lock().unwrap().push_back(vec![
            TransportEvent::Connected {
                endpoint: id.clone(),
                hint: Some(IdentityHint::new("Joy-Con 2 (L)", None)),
            },
            TransportEvent::Notification {
                endpoint: id.clone(),
                payload: input(&[Button::Up], CENTER, UNUSED),
            },
            TransportEvent::Disconnected {
                endpoint: id.clone(),
            },
        ]);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(service.clone().run(cancel.clone()));

        let mut saw_dpad = false;
        while let Some(event) = rx.recv().await {
            match event {
                BridgeEvent::Output(s) if s.buttons.contains(PadButtons::DPAD_UP) => saw_dpad = true,
                BridgeEvent::ConnectionStatus(ConnectionStatus::Disconnected) => break,
                _ => {}
            }
        }
        assert!(saw_dpad);

        // Next cycle finds nothing and waits; cancellation ends the loop.
        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(service.fusion().endpoint_count(), 0);
        assert_eq!(pad.last(), Some(PadSnapshot::default()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_frames_reach_connected_endpoints() {
        let config = BridgeConfig {
            keep_alive_interval: Some(Duration::from_millis(500)),
            ..BridgeConfig::default()
        };
        let (service, transport, _, _rx) = harness(config);
        let id = EndpointId::from("a");
        service.on_connected(&id, None);

        let cycle = CancellationToken::new();
        let task = tokio::spawn(
            service
                .clone()
                .keep_alive_loop(Duration::from_millis(500), cycle.clone()),
        );
        tokio::time::sleep(Duration::from_millis(1100)).await;
        cycle.cancel();
        task.await.unwrap();

        let rumbles = transport
            .writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, f)| f[0] == protocol::FRAME_RUMBLE)
            .count();
        assert_eq!(rumbles, 2);
    }
}
