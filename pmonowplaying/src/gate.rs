//! Subscription gate between the host channel and the native receiver.
//!
//! The gate watches the listener count of one [`EventChannel`]. Crossing from
//! idle (no listener) to active issues a native `start`, dropping back to zero
//! issues `stop`. Status objects pushed by the native side are cached in a
//! [`MetadataSnapshot`] and re-broadcast on the channel.
//!
//! Native calls are queued to a single worker task so that a `stop` is never
//! executed before the `start` it follows. Each start opens a new generation;
//! status pushes carry the generation of the session that produced them, which
//! lets the gate drop deliveries arriving after the session was stopped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::bridge::{BridgeAction, NativeBridge, StatusFeed};
use crate::channel::EventChannel;
use crate::errors::NowPlayingError;
use crate::locks::{lock, read, write};
use crate::snapshot::{MetadataSnapshot, status_object};

pub const DEFAULT_CHANNEL: &str = "spotifyPluginStatus";
pub const DEFAULT_SERVICE: &str = "SpotifyPlugin";
pub const DEFAULT_START_TIMEOUT_MS: u64 = 0;

/// Gate settings, usually obtained from [`crate::Config::gate_config`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Host channel key the listeners attach to.
    pub channel: String,
    /// Native service addressed by `start`/`stop`.
    pub service: String,
    /// Drop status pushes from a session that is no longer the active one.
    ///
    /// When set, stopping a session also aborts its status pump. When unset,
    /// the pump keeps draining until the bridge closes the feed.
    pub drop_stale_status: bool,
    /// Maximum wait for the `start` acknowledgement, `0` (default) waits forever.
    ///
    /// A start that times out is reported as [`NowPlayingError::StartTimeout`]
    /// and its session is lost: an acknowledgement arriving later is discarded
    /// with its feed, and no metadata flows until the listeners drop to zero
    /// and a new start is issued. With `0`, a start that never resolves holds
    /// back the commands queued after it, the following `stop` included.
    pub start_timeout_ms: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            channel: DEFAULT_CHANNEL.to_string(),
            service: DEFAULT_SERVICE.to_string(),
            drop_stale_status: true,
            start_timeout_ms: DEFAULT_START_TIMEOUT_MS,
        }
    }
}

impl GateConfig {
    fn start_timeout(&self) -> Option<Duration> {
        (self.start_timeout_ms > 0).then(|| Duration::from_millis(self.start_timeout_ms))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// No listener, native receiver stopped (or being stopped).
    Idle,
    /// At least one listener, native receiver started for `generation`.
    Active { generation: u64 },
}

impl GateState {
    pub fn is_active(&self) -> bool {
        matches!(self, GateState::Active { .. })
    }
}

/// Counters kept by the gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateStats {
    /// `start` requests issued.
    pub starts: u64,
    /// `stop` requests issued.
    pub stops: u64,
    /// Status objects cached and broadcast.
    pub broadcasts: u64,
    /// Empty or malformed payloads ignored.
    pub ignored: u64,
    /// Payloads dropped because their session was stopped.
    pub stale_dropped: u64,
    pub start_failures: u64,
}

enum Command {
    Start { generation: u64 },
    Stop { generation: u64 },
    Flush(oneshot::Sender<()>),
}

struct Control {
    state: GateState,
    generation: u64,
    stats: GateStats,
    last_error: Option<NowPlayingError>,
}

struct GateInner {
    config: GateConfig,
    bridge: Arc<dyn NativeBridge>,
    channel: Arc<dyn EventChannel>,
    control: Mutex<Control>,
    snapshot: RwLock<MetadataSnapshot>,
    commands: mpsc::UnboundedSender<Command>,
    pumps: Mutex<HashMap<u64, AbortHandle>>,
    runtime: Handle,
}

impl GateInner {
    fn on_handler_count_changed(&self) {
        let command = {
            let mut control = lock(&self.control);
            let count = self.channel.handler_count();
            match (control.state, count) {
                (GateState::Idle, count) if count > 0 => {
                    if count != 1 {
                        warn!(
                            channel = %self.channel.name(),
                            count,
                            "Listeners attached while idle without a 0 -> 1 notification"
                        );
                    }
                    control.generation += 1;
                    let generation = control.generation;
                    control.state = GateState::Active { generation };
                    control.stats.starts += 1;
                    Some(Command::Start { generation })
                }
                (GateState::Active { generation }, 0) => {
                    control.state = GateState::Idle;
                    control.stats.stops += 1;
                    Some(Command::Stop { generation })
                }
                (state, count) => {
                    debug!(channel = %self.channel.name(), ?state, count, "Handler count changed, no transition");
                    None
                }
            }
        };

        if let Some(command) = command {
            self.send(command);
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!(service = %self.config.service, "Gate worker is gone, dropping native command");
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        lock(&self.control).state == GateState::Active { generation }
    }

    fn deliver(&self, generation: u64, payload: Option<Value>) {
        if self.config.drop_stale_status && !self.is_current(generation) {
            lock(&self.control).stats.stale_dropped += 1;
            debug!(generation, "Dropping status pushed by a stopped session");
            return;
        }
        self.on_status(payload);
    }

    fn on_status(&self, payload: Option<Value>) {
        let snapshot = match status_object(payload.as_ref()) {
            Some(status) => MetadataSnapshot::from_status(status),
            None => {
                lock(&self.control).stats.ignored += 1;
                debug!(channel = %self.channel.name(), "Ignoring empty status payload");
                return;
            }
        };
        let Some(payload) = payload else {
            return;
        };

        *write(&self.snapshot) = snapshot;
        self.channel.broadcast(&payload);
        lock(&self.control).stats.broadcasts += 1;
    }

    fn on_error(&self, err: &NowPlayingError) {
        error!(service = %self.config.service, error = %err, "Error initializing native metadata listener");
        let mut control = lock(&self.control);
        if err.is_start_failure() {
            control.stats.start_failures += 1;
        }
        control.last_error = Some(err.clone());
    }

    async fn execute_start(self: &Arc<Self>, generation: u64) {
        let service = self.config.service.as_str();
        info!(service, generation, action = %BridgeAction::Start, "Starting native metadata listener");

        let started = match self.config.start_timeout() {
            Some(timeout) => match tokio::time::timeout(timeout, self.bridge.start(service)).await {
                Ok(result) => result,
                Err(_) => Err(NowPlayingError::StartTimeout {
                    service: service.to_string(),
                    timeout_ms: self.config.start_timeout_ms,
                }),
            },
            None => self.bridge.start(service).await,
        };

        match started {
            Ok(feed) => self.spawn_pump(generation, feed),
            Err(err) if err.is_start_failure() => self.on_error(&err),
            Err(NowPlayingError::Native(reason)) => {
                self.on_error(&NowPlayingError::start_failed(service, &reason))
            }
            Err(err) => self.on_error(&NowPlayingError::start_failed(service, &err.to_string())),
        }
    }

    fn release_pump(&self, generation: u64) {
        if !self.config.drop_stale_status {
            return;
        }
        // Tout ce que la pompe livrerait encore serait jeté
        if let Some(pump) = lock(&self.pumps).remove(&generation) {
            pump.abort();
        }
    }

    fn spawn_pump(self: &Arc<Self>, generation: u64, mut feed: StatusFeed) {
        let gate = Arc::downgrade(self);
        let mut pumps = lock(&self.pumps);
        let handle = self.runtime.spawn(async move {
            while let Some(payload) = feed.recv().await {
                let Some(inner) = gate.upgrade() else {
                    return;
                };
                inner.deliver(generation, payload);
            }
            debug!(generation, "Native status feed closed");
            if let Some(inner) = gate.upgrade() {
                lock(&inner.pumps).remove(&generation);
            }
        });
        pumps.insert(generation, handle.abort_handle());
    }
}

impl Drop for GateInner {
    fn drop(&mut self) {
        let pumps = self.pumps.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        for (_, pump) in pumps.drain() {
            pump.abort();
        }

        let control = self.control.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let GateState::Active { generation } = control.state {
            control.state = GateState::Idle;
            debug!(service = %self.config.service, generation, "Gate dropped while active, releasing native receiver");
            let _ = self.commands.send(Command::Stop { generation });
        }
    }
}

async fn stop_native(bridge: &dyn NativeBridge, service: &str, generation: u64) {
    info!(service, generation, action = %BridgeAction::Stop, "Stopping native metadata listener");

    // Pas de taxonomie d'erreur pour stop : on trace et on continue
    if let Err(err) = bridge.stop(service).await {
        let err = match err {
            NowPlayingError::Native(reason) => NowPlayingError::stop_failed(service, &reason),
            other => other,
        };
        warn!(service, generation, error = %err, "Native stop failed");
    }
}

/// Executes native commands in order.
///
/// The worker keeps its own handle on the bridge so that the `stop` commands
/// still queued when the gate is dropped, including the one queued by the drop
/// itself, reach the native side. Pending starts are skipped.
async fn run_worker(
    gate: Weak<GateInner>,
    bridge: Arc<dyn NativeBridge>,
    service: String,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Start { generation } => match gate.upgrade() {
                Some(inner) => inner.execute_start(generation).await,
                None => debug!(service = %service, generation, "Gate dropped, skipping native start"),
            },
            Command::Stop { generation } => {
                if let Some(inner) = gate.upgrade() {
                    inner.release_pump(generation);
                }
                stop_native(bridge.as_ref(), &service, generation).await;
            }
            Command::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!(service = %service, "Gate worker terminated");
}

/// Reference-counted start/stop gate for the native "now playing" receiver.
///
/// Cloning is cheap; all clones drive the same gate. Dropping the last clone
/// while active aborts the status pumps and still sends the native `stop`,
/// without waiting for it. Use [`NowPlayingGate::shutdown`] to wait for the
/// receiver to be stopped.
#[derive(Clone)]
pub struct NowPlayingGate {
    inner: Arc<GateInner>,
}

impl NowPlayingGate {
    /// Builds the gate and installs its count hook on `channel`.
    ///
    /// Must be called from within a tokio runtime: native calls and status
    /// pumps run as tasks on it. Listeners already attached to the channel
    /// trigger an immediate start.
    pub fn new(
        config: GateConfig,
        bridge: Arc<dyn NativeBridge>,
        channel: Arc<dyn EventChannel>,
    ) -> Result<Self, NowPlayingError> {
        let runtime =
            Handle::try_current().map_err(|err| NowPlayingError::NoRuntime(err.to_string()))?;

        if config.channel != channel.name() {
            warn!(
                configured = %config.channel,
                actual = %channel.name(),
                "Gate configured for another channel name"
            );
        }

        let (tx, rx) = mpsc::unbounded_channel::<Command>();
        let inner = Arc::new(GateInner {
            config,
            bridge,
            channel: channel.clone(),
            control: Mutex::new(Control {
                state: GateState::Idle,
                generation: 0,
                stats: GateStats::default(),
                last_error: None,
            }),
            snapshot: RwLock::new(MetadataSnapshot::default()),
            commands: tx,
            pumps: Mutex::new(HashMap::new()),
            runtime: runtime.clone(),
        });

        runtime.spawn(run_worker(
            Arc::downgrade(&inner),
            inner.bridge.clone(),
            inner.config.service.clone(),
            rx,
        ));

        let weak = Arc::downgrade(&inner);
        channel.on_handler_count_change(Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_handler_count_changed();
            }
        }));

        inner.on_handler_count_changed();
        Ok(Self { inner })
    }

    /// Re-evaluates the listener count and issues `start`/`stop` on a boundary crossing.
    pub fn on_handler_count_changed(&self) {
        self.inner.on_handler_count_changed();
    }

    /// Caches and broadcasts a status payload. Empty payloads are ignored.
    pub fn on_status(&self, payload: Option<Value>) {
        self.inner.on_status(payload);
    }

    /// Reports a native failure. Never retries and never touches the gate state.
    pub fn on_error(&self, err: &NowPlayingError) {
        self.inner.on_error(err);
    }

    pub fn snapshot(&self) -> MetadataSnapshot {
        read(&self.inner.snapshot).clone()
    }

    pub fn artist(&self) -> Option<String> {
        self.snapshot().artist
    }

    pub fn album(&self) -> Option<String> {
        self.snapshot().album
    }

    pub fn track(&self) -> Option<String> {
        self.snapshot().track
    }

    pub fn id(&self) -> Option<String> {
        self.snapshot().id
    }

    pub fn state(&self) -> GateState {
        lock(&self.inner.control).state
    }

    pub fn stats(&self) -> GateStats {
        lock(&self.inner.control).stats
    }

    pub fn last_error(&self) -> Option<NowPlayingError> {
        lock(&self.inner.control).last_error.clone()
    }

    pub fn config(&self) -> &GateConfig {
        &self.inner.config
    }

    /// Waits until every native command queued so far has been executed.
    pub async fn flush(&self) -> Result<(), NowPlayingError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .commands
            .send(Command::Flush(tx))
            .map_err(|_| NowPlayingError::QueueClosed)?;
        rx.await.map_err(|_| NowPlayingError::QueueClosed)
    }

    /// Stops an active native receiver regardless of the listener count and
    /// aborts the status pumps.
    ///
    /// A later count change starts the receiver again.
    pub async fn shutdown(&self) -> Result<(), NowPlayingError> {
        let command = {
            let mut control = lock(&self.inner.control);
            match control.state {
                GateState::Active { generation } => {
                    control.state = GateState::Idle;
                    control.stats.stops += 1;
                    Some(Command::Stop { generation })
                }
                GateState::Idle => None,
            }
        };
        if let Some(command) = command {
            self.inner.send(command);
        }
        self.flush().await?;

        for (_, pump) in lock(&self.inner.pumps).drain() {
            pump.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingBridge {
        calls: Mutex<Vec<BridgeAction>>,
        feeds: Mutex<Vec<mpsc::UnboundedSender<Option<Value>>>>,
        fail_start: Option<String>,
        start_delay: Option<Duration>,
    }

    impl RecordingBridge {
        fn failing(reason: &str) -> Self {
            Self {
                fail_start: Some(reason.to_string()),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<BridgeAction> {
            self.calls.lock().unwrap().clone()
        }

        fn feed(&self, index: usize) -> mpsc::UnboundedSender<Option<Value>> {
            self.feeds.lock().unwrap()[index].clone()
        }
    }

    #[async_trait]
    impl NativeBridge for RecordingBridge {
        async fn start(&self, _service: &str) -> Result<StatusFeed, NowPlayingError> {
            self.calls.lock().unwrap().push(BridgeAction::Start);
            if let Some(delay) = self.start_delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(reason) = &self.fail_start {
                return Err(NowPlayingError::native(reason));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            self.feeds.lock().unwrap().push(tx);
            Ok(rx)
        }

        async fn stop(&self, _service: &str) -> Result<(), NowPlayingError> {
            self.calls.lock().unwrap().push(BridgeAction::Stop);
            Ok(())
        }
    }

    struct HangingBridge;

    #[async_trait]
    impl NativeBridge for HangingBridge {
        async fn start(&self, _service: &str) -> Result<StatusFeed, NowPlayingError> {
            std::future::pending().await
        }

        async fn stop(&self, _service: &str) -> Result<(), NowPlayingError> {
            Ok(())
        }
    }

    /// Canal piloté à la main : le test fixe le nombre d'abonnés.
    #[derive(Default)]
    struct ManualChannel {
        count: AtomicUsize,
        broadcasts: Mutex<Vec<Value>>,
        hook: Mutex<Option<crate::channel::CountHook>>,
    }

    impl ManualChannel {
        fn set_count(&self, count: usize) {
            self.count.store(count, Ordering::SeqCst);
            self.notify();
        }

        fn notify(&self) {
            let hook = self.hook.lock().unwrap().clone();
            if let Some(hook) = hook {
                hook();
            }
        }

        fn broadcasts(&self) -> Vec<Value> {
            self.broadcasts.lock().unwrap().clone()
        }
    }

    impl EventChannel for ManualChannel {
        fn name(&self) -> &str {
            DEFAULT_CHANNEL
        }

        fn handler_count(&self) -> usize {
            self.count.load(Ordering::SeqCst)
        }

        fn broadcast(&self, payload: &Value) {
            self.broadcasts.lock().unwrap().push(payload.clone());
        }

        fn on_handler_count_change(&self, hook: crate::channel::CountHook) {
            *self.hook.lock().unwrap() = Some(hook);
        }
    }

    fn create_gate(
        config: GateConfig,
        bridge: RecordingBridge,
    ) -> (NowPlayingGate, Arc<RecordingBridge>, Arc<ManualChannel>) {
        let bridge = Arc::new(bridge);
        let channel = Arc::new(ManualChannel::default());
        let gate = NowPlayingGate::new(config, bridge.clone(), channel.clone()).unwrap();
        (gate, bridge, channel)
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_start_on_first_listener_stop_on_last() {
        let (gate, bridge, channel) = create_gate(GateConfig::default(), RecordingBridge::default());

        channel.set_count(1);
        gate.flush().await.unwrap();
        assert_eq!(bridge.calls(), vec![BridgeAction::Start]);
        assert_eq!(gate.state(), GateState::Active { generation: 1 });

        channel.set_count(2);
        channel.set_count(1);
        gate.flush().await.unwrap();
        assert_eq!(bridge.calls(), vec![BridgeAction::Start]);

        channel.set_count(0);
        gate.flush().await.unwrap();
        assert_eq!(bridge.calls(), vec![BridgeAction::Start, BridgeAction::Stop]);
        assert_eq!(gate.state(), GateState::Idle);

        let stats = gate.stats();
        assert_eq!(stats.starts, 1);
        assert_eq!(stats.stops, 1);
    }

    #[tokio::test]
    async fn test_redundant_notification_does_not_restart() {
        let (gate, bridge, channel) = create_gate(GateConfig::default(), RecordingBridge::default());

        channel.set_count(1);
        channel.notify();
        gate.on_handler_count_changed();
        gate.flush().await.unwrap();

        assert_eq!(bridge.calls(), vec![BridgeAction::Start]);
    }

    #[tokio::test]
    async fn test_redundant_idle_notification_does_not_stop() {
        let (gate, bridge, channel) = create_gate(GateConfig::default(), RecordingBridge::default());

        channel.set_count(0);
        channel.notify();
        gate.flush().await.unwrap();

        assert!(bridge.calls().is_empty());
        assert_eq!(gate.state(), GateState::Idle);
    }

    #[tokio::test]
    async fn test_missed_notification_still_starts() {
        let (gate, bridge, channel) = create_gate(GateConfig::default(), RecordingBridge::default());

        channel.set_count(2);
        gate.flush().await.unwrap();

        assert_eq!(bridge.calls(), vec![BridgeAction::Start]);
        assert!(gate.state().is_active());
    }

    #[tokio::test]
    async fn test_each_active_run_opens_a_generation() {
        let (gate, bridge, channel) = create_gate(GateConfig::default(), RecordingBridge::default());

        for _ in 0..3 {
            channel.set_count(1);
            channel.set_count(0);
        }
        channel.set_count(1);
        gate.flush().await.unwrap();

        assert_eq!(gate.state(), GateState::Active { generation: 4 });
        assert_eq!(
            bridge.calls(),
            vec![
                BridgeAction::Start,
                BridgeAction::Stop,
                BridgeAction::Start,
                BridgeAction::Stop,
                BridgeAction::Start,
                BridgeAction::Stop,
                BridgeAction::Start,
            ]
        );
    }

    #[tokio::test]
    async fn test_status_updates_snapshot_and_broadcasts() {
        let (gate, _bridge, channel) = create_gate(GateConfig::default(), RecordingBridge::default());

        let payload = json!({"artist": "A", "album": "B", "track": "C", "id": "1"});
        gate.on_status(Some(payload.clone()));

        assert_eq!(gate.artist().as_deref(), Some("A"));
        assert_eq!(gate.album().as_deref(), Some("B"));
        assert_eq!(gate.track().as_deref(), Some("C"));
        assert_eq!(gate.id().as_deref(), Some("1"));
        assert_eq!(channel.broadcasts(), vec![payload]);
        assert_eq!(gate.stats().broadcasts, 1);
    }

    #[tokio::test]
    async fn test_status_overwrites_wholesale() {
        let (gate, _bridge, _channel) = create_gate(GateConfig::default(), RecordingBridge::default());

        gate.on_status(Some(json!({"artist": "A", "album": "B", "track": "C", "id": "1"})));
        gate.on_status(Some(json!({"track": "D"})));

        assert_eq!(
            gate.snapshot(),
            MetadataSnapshot {
                track: Some("D".to_string()),
                ..Default::default()
            }
        );
    }

    #[tokio::test]
    async fn test_empty_status_is_noise() {
        let (gate, _bridge, channel) = create_gate(GateConfig::default(), RecordingBridge::default());

        gate.on_status(Some(json!({"artist": "A"})));
        gate.on_status(None);
        gate.on_status(Some(json!({})));
        gate.on_status(Some(Value::Null));

        assert_eq!(channel.broadcasts().len(), 1);
        assert_eq!(gate.artist().as_deref(), Some("A"));
        assert_eq!(gate.stats().ignored, 3);
    }

    #[tokio::test]
    async fn test_start_failure_is_reported_only() {
        let (gate, bridge, channel) = create_gate(
            GateConfig::default(),
            RecordingBridge::failing("device unavailable"),
        );

        channel.set_count(1);
        gate.flush().await.unwrap();

        assert_eq!(
            gate.last_error(),
            Some(NowPlayingError::start_failed(DEFAULT_SERVICE, "device unavailable"))
        );
        assert_eq!(gate.stats().start_failures, 1);
        assert!(gate.snapshot().is_empty());
        // Pas de relance automatique, l'état reste actif
        assert!(gate.state().is_active());
        assert_eq!(bridge.calls(), vec![BridgeAction::Start]);

        channel.set_count(0);
        gate.flush().await.unwrap();
        assert_eq!(bridge.calls(), vec![BridgeAction::Start, BridgeAction::Stop]);
    }

    #[tokio::test]
    async fn test_start_timeout_is_a_start_failure() {
        let channel = Arc::new(ManualChannel::default());
        let config = GateConfig {
            start_timeout_ms: 20,
            ..Default::default()
        };
        let gate = NowPlayingGate::new(config, Arc::new(HangingBridge), channel.clone()).unwrap();

        channel.set_count(1);
        gate.flush().await.unwrap();

        assert_eq!(
            gate.last_error(),
            Some(NowPlayingError::StartTimeout {
                service: DEFAULT_SERVICE.to_string(),
                timeout_ms: 20
            })
        );
        assert_eq!(gate.stats().start_failures, 1);
    }

    #[tokio::test]
    async fn test_feed_pushes_are_broadcast() {
        let (gate, bridge, channel) = create_gate(GateConfig::default(), RecordingBridge::default());

        channel.set_count(1);
        gate.flush().await.unwrap();

        let feed = bridge.feed(0);
        feed.send(Some(json!({"artist": "A", "track": "C"}))).unwrap();
        feed.send(Some(json!({}))).unwrap();

        wait_until(|| gate.stats().ignored == 1).await;
        assert_eq!(channel.broadcasts().len(), 1);
        assert_eq!(gate.track().as_deref(), Some("C"));
    }

    #[tokio::test]
    async fn test_late_status_discarded_after_stop() {
        let (gate, bridge, channel) = create_gate(GateConfig::default(), RecordingBridge::default());

        channel.set_count(1);
        gate.flush().await.unwrap();
        let feed = bridge.feed(0);

        channel.set_count(0);
        gate.flush().await.unwrap();

        // La pompe de la session arrêtée est abandonnée avec son flux
        wait_until(|| feed.is_closed()).await;
        assert!(feed.send(Some(json!({"artist": "Late"}))).is_err());

        assert!(channel.broadcasts().is_empty());
        assert!(gate.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_late_status_from_previous_session_dropped() {
        let (gate, _bridge, channel) = create_gate(GateConfig::default(), RecordingBridge::default());

        channel.set_count(1);
        channel.set_count(0);
        channel.set_count(1);
        assert_eq!(gate.state(), GateState::Active { generation: 2 });

        // Livraisons en vol pendant que le stop de la session 1 attend son tour
        gate.inner.deliver(1, Some(json!({"artist": "Old"})));
        gate.inner.deliver(2, Some(json!({"artist": "New"})));

        assert_eq!(gate.stats().stale_dropped, 1);
        assert_eq!(gate.stats().broadcasts, 1);
        assert_eq!(channel.broadcasts(), vec![json!({"artist": "New"})]);
        assert_eq!(gate.artist().as_deref(), Some("New"));
    }

    #[tokio::test]
    async fn test_stopped_sessions_release_their_pumps() {
        let (gate, bridge, channel) = create_gate(GateConfig::default(), RecordingBridge::default());

        for _ in 0..50 {
            channel.set_count(1);
            channel.set_count(0);
        }
        gate.flush().await.unwrap();

        assert_eq!(gate.state(), GateState::Idle);
        assert!(lock(&gate.inner.pumps).is_empty());
        assert_eq!(bridge.calls().len(), 100);
        // Le bridge garde ses émetteurs, seule la pompe côté gate a été abandonnée
        wait_until(|| bridge.feeds.lock().unwrap().iter().all(|feed| feed.is_closed())).await;
    }

    #[tokio::test]
    async fn test_active_session_keeps_its_pump() {
        let (gate, _bridge, channel) = create_gate(GateConfig::default(), RecordingBridge::default());

        channel.set_count(1);
        channel.set_count(0);
        channel.set_count(1);
        gate.flush().await.unwrap();

        let pumps: Vec<u64> = lock(&gate.inner.pumps).keys().copied().collect();
        assert_eq!(pumps, vec![2]);
    }

    #[tokio::test]
    async fn test_late_status_kept_when_not_dropping_stale() {
        let config = GateConfig {
            drop_stale_status: false,
            ..Default::default()
        };
        let (gate, bridge, channel) = create_gate(config, RecordingBridge::default());

        channel.set_count(1);
        gate.flush().await.unwrap();
        let feed = bridge.feed(0);
        channel.set_count(0);
        gate.flush().await.unwrap();

        let payload = json!({"artist": "Late", "id": "9"});
        feed.send(Some(payload.clone())).unwrap();
        wait_until(|| gate.stats().broadcasts == 1).await;

        assert_eq!(channel.broadcasts(), vec![payload]);
        assert_eq!(gate.artist().as_deref(), Some("Late"));
        assert_eq!(gate.stats().stale_dropped, 0);
    }

    #[tokio::test]
    async fn test_existing_listeners_start_on_construction() {
        let bridge = Arc::new(RecordingBridge::default());
        let channel = Arc::new(ManualChannel::default());
        channel.count.store(1, Ordering::SeqCst);

        let gate = NowPlayingGate::new(GateConfig::default(), bridge.clone(), channel).unwrap();
        gate.flush().await.unwrap();

        assert_eq!(bridge.calls(), vec![BridgeAction::Start]);
    }

    #[tokio::test]
    async fn test_shutdown_stops_active_receiver() {
        let (gate, bridge, channel) = create_gate(GateConfig::default(), RecordingBridge::default());

        channel.set_count(1);
        gate.shutdown().await.unwrap();

        assert_eq!(bridge.calls(), vec![BridgeAction::Start, BridgeAction::Stop]);
        assert_eq!(gate.state(), GateState::Idle);

        // Idle : shutdown ne relance pas de stop
        gate.shutdown().await.unwrap();
        assert_eq!(bridge.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_dropping_active_gate_stops_receiver() {
        let (gate, bridge, channel) = create_gate(GateConfig::default(), RecordingBridge::default());

        channel.set_count(1);
        gate.flush().await.unwrap();
        let feed = bridge.feed(0);

        drop(gate);

        wait_until(|| bridge.calls() == vec![BridgeAction::Start, BridgeAction::Stop]).await;
        wait_until(|| feed.is_closed()).await;

        // Plus de gate : le hook du canal ne fait plus rien
        channel.set_count(0);
        channel.set_count(1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bridge.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_stop_queued_before_drop_still_reaches_bridge() {
        let (gate, bridge, channel) = create_gate(GateConfig::default(), RecordingBridge::default());

        channel.set_count(1);
        gate.flush().await.unwrap();
        channel.set_count(0);
        drop(gate);

        wait_until(|| bridge.calls() == vec![BridgeAction::Start, BridgeAction::Stop]).await;
    }

    #[tokio::test]
    async fn test_dropping_idle_gate_sends_nothing() {
        let (gate, bridge, channel) = create_gate(GateConfig::default(), RecordingBridge::default());

        channel.set_count(1);
        gate.shutdown().await.unwrap();
        drop(gate);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bridge.calls(), vec![BridgeAction::Start, BridgeAction::Stop]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_config_waits_for_slow_start() {
        let bridge = RecordingBridge {
            start_delay: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        let (gate, bridge, channel) = create_gate(GateConfig::default(), bridge);

        channel.set_count(1);
        gate.flush().await.unwrap();

        assert!(gate.last_error().is_none());
        assert_eq!(gate.stats().start_failures, 0);
        assert_eq!(lock(&gate.inner.pumps).len(), 1);

        bridge.feed(0).send(Some(json!({"track": "Genesis"}))).unwrap();
        wait_until(|| gate.stats().broadcasts == 1).await;
        assert_eq!(gate.track().as_deref(), Some("Genesis"));
    }

    #[test]
    fn test_new_requires_runtime() {
        let result = NowPlayingGate::new(
            GateConfig::default(),
            Arc::new(RecordingBridge::default()),
            Arc::new(ManualChannel::default()),
        );
        assert!(matches!(result, Err(NowPlayingError::NoRuntime(_))));
    }

    #[test]
    fn test_start_timeout_zero_waits_forever() {
        let config = GateConfig {
            start_timeout_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.start_timeout(), None);
        assert_eq!(GateConfig::default().start_timeout_ms, DEFAULT_START_TIMEOUT_MS);
        assert_eq!(GateConfig::default().start_timeout(), None);

        let bounded = GateConfig {
            start_timeout_ms: 1500,
            ..Default::default()
        };
        assert_eq!(bounded.start_timeout(), Some(Duration::from_millis(1500)));
    }
}
