//! Feed connector: push-preferred, poll-fallback rate subscription

use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, FuturesUnordered};
use futures_util::StreamExt;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use aurum_core::{
    ConnectionState, FallbackMode, FeedConfig, FeedError, FeedResult, RateSnapshot,
};

use crate::parse::{parse_push_message, parse_rate_table, PushMessage};
use crate::purity::PurityLadder;

/// Raw text messages from an open push channel. The stream ends when the
/// channel closes; an `Err` item means the channel failed.
pub type MessageStream = BoxStream<'static, FeedResult<String>>;

/// Push side of the rate feed (WebSocket in production)
#[async_trait::async_trait]
pub trait PushChannel: Send + Sync {
    async fn open(&self, url: &str) -> FeedResult<MessageStream>;
}

/// Pull side of the rate feed (HTTP GET in production)
#[async_trait::async_trait]
pub trait RateSource: Send + Sync {
    async fn fetch(&self, url: &str) -> FeedResult<String>;
}

/// What the connector forwards to its owner
#[derive(Debug, Clone)]
pub enum FeedEvent {
    State(ConnectionState),
    Snapshot(RateSnapshot),
}

#[derive(Debug, Clone, Copy)]
enum Control {
    Reconnect,
}

enum Exit {
    /// Push channel lost or never opened; fall back to polling
    Degrade,
    /// Caller asked for a fresh push attempt
    Reconnect,
    /// Owner went away
    Shutdown,
}

/// One running subscription to a rate feed.
///
/// Created already running by [`FeedConnector::spawn`]; [`FeedConnector::stop`]
/// cancels the task and any in-flight request or timer. Dropping the connector
/// aborts the task as well.
pub struct FeedConnector {
    name: String,
    state: Arc<RwLock<ConnectionState>>,
    control_tx: mpsc::Sender<Control>,
    handle: Option<JoinHandle<()>>,
}

impl FeedConnector {
    pub fn spawn(
        config: FeedConfig,
        push: Arc<dyn PushChannel>,
        source: Arc<dyn RateSource>,
        events: mpsc::Sender<FeedEvent>,
    ) -> Self {
        let (control_tx, control_rx) = mpsc::channel(4);
        let state = Arc::new(RwLock::new(ConnectionState::Disconnected));
        let ladder = config.purity.as_ref().and_then(PurityLadder::new);
        let name = config.name.clone();

        let task = ConnectorTask {
            config,
            clock: StampClock::new(),
            push,
            source,
            ladder,
            state: Arc::clone(&state),
            events,
        };
        let handle = tokio::spawn(task.run(control_rx));

        Self {
            name,
            state,
            control_tx,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Retry the push channel, e.g. after the feed was degraded to polling
    pub fn force_reconnect(&self) -> bool {
        self.control_tx.try_send(Control::Reconnect).is_ok()
    }

    /// Cancel the connector and wait until its task, channel and timer are gone
    pub async fn stop(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }

        let previous = std::mem::replace(&mut *self.state.write(), ConnectionState::Disconnected);
        if previous != ConnectionState::Disconnected {
            info!(feed = %self.name, from = %previous, to = %ConnectionState::Disconnected, "Connection state changed");
        }
    }
}

impl Drop for FeedConnector {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Capture stamps that never go backwards and never repeat, so arrival
/// order is decidable even when the wall clock is coarse.
#[derive(Debug)]
struct StampClock {
    last: parking_lot::Mutex<Option<DateTime<Utc>>>,
}

impl StampClock {
    fn new() -> Self {
        Self {
            last: parking_lot::Mutex::new(None),
        }
    }

    fn next(&self) -> DateTime<Utc> {
        let mut last = self.last.lock();
        let now = Utc::now();
        let stamp = match *last {
            Some(prev) if now <= prev => prev + chrono::Duration::microseconds(1),
            _ => now,
        };
        *last = Some(stamp);
        stamp
    }
}

struct ConnectorTask {
    config: FeedConfig,
    clock: StampClock,
    push: Arc<dyn PushChannel>,
    source: Arc<dyn RateSource>,
    ladder: Option<PurityLadder>,
    state: Arc<RwLock<ConnectionState>>,
    events: mpsc::Sender<FeedEvent>,
}

impl ConnectorTask {
    async fn run(self, mut control_rx: mpsc::Receiver<Control>) {
        loop {
            if !self.transition(ConnectionState::Connecting).await {
                return;
            }

            match self.connect_and_listen(&mut control_rx).await {
                Exit::Degrade => {}
                Exit::Reconnect => continue,
                Exit::Shutdown => return,
            }

            if !self.transition(ConnectionState::Degraded(FallbackMode::Polling)).await {
                return;
            }

            match self.poll(&mut control_rx).await {
                Exit::Reconnect | Exit::Degrade => continue,
                Exit::Shutdown => return,
            }
        }
    }

    async fn connect_and_listen(&self, control_rx: &mut mpsc::Receiver<Control>) -> Exit {
        let Some(url) = self.config.push_url.as_deref() else {
            debug!(feed = %self.config.name, "No push channel configured");
            return Exit::Degrade;
        };

        info!(feed = %self.config.name, url, "Opening push channel");

        let stream = match timeout(self.config.connect_timeout(), self.push.open(url)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(feed = %self.config.name, error = %e, "Push channel failed to open");
                return Exit::Degrade;
            }
            Err(_) => {
                warn!(
                    feed = %self.config.name,
                    timeout_ms = self.config.connect_timeout_ms,
                    "Push channel open timed out"
                );
                return Exit::Degrade;
            }
        };

        if !self.transition(ConnectionState::Live).await {
            return Exit::Shutdown;
        }

        self.listen(stream, control_rx).await
    }

    async fn listen(&self, mut stream: MessageStream, control_rx: &mut mpsc::Receiver<Control>) -> Exit {
        let mut inflight = FuturesUnordered::new();
        // initial load; pushes only carry changes from here on
        inflight.push(self.fetch_snapshot());

        // re-arms the initial load until this run has delivered rates
        let interval = self.config.poll_interval();
        let mut retry = tokio::time::interval_at(Instant::now() + interval, interval);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut loaded = false;

        loop {
            tokio::select! {
                msg = stream.next() => match msg {
                    Some(Ok(text)) => {
                        let received_at = self.clock.next();
                        match parse_push_message(&text, &self.config.default_rate_key) {
                            Ok(PushMessage::Table(table)) => match table.into_snapshot(received_at) {
                                Ok(snapshot) => {
                                    if !self.emit(snapshot).await {
                                        return Exit::Shutdown;
                                    }
                                    loaded = true;
                                }
                                Err(e) => warn!(feed = %self.config.name, error = %e, "Discarding invalid pushed rate table"),
                            },
                            Ok(PushMessage::Refresh) => {
                                debug!(feed = %self.config.name, "Change notification, fetching rates");
                                inflight.push(self.fetch_snapshot());
                            }
                            Ok(PushMessage::Ignored) => {}
                            Err(e) => warn!(feed = %self.config.name, error = %e, "Discarding malformed push payload"),
                        }
                    }
                    Some(Err(e)) => {
                        warn!(feed = %self.config.name, error = %e, "Push channel error");
                        return Exit::Degrade;
                    }
                    None => {
                        info!(feed = %self.config.name, "Push channel closed");
                        return Exit::Degrade;
                    }
                },
                Some(result) = inflight.next(), if !inflight.is_empty() => match result {
                    Ok(snapshot) => {
                        if !self.emit(snapshot).await {
                            return Exit::Shutdown;
                        }
                        loaded = true;
                    }
                    Err(e) => warn!(feed = %self.config.name, error = %e, "Rate fetch failed"),
                },
                _ = retry.tick(), if !loaded && inflight.is_empty() => {
                    debug!(feed = %self.config.name, "No rates yet on this connection, fetching again");
                    inflight.push(self.fetch_snapshot());
                }
                ctrl = control_rx.recv() => match ctrl {
                    Some(Control::Reconnect) => {
                        info!(feed = %self.config.name, "Reconnect requested");
                        return Exit::Reconnect;
                    }
                    None => return Exit::Shutdown,
                },
            }
        }
    }

    async fn poll(&self, control_rx: &mut mpsc::Receiver<Control>) -> Exit {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut inflight = FuturesUnordered::new();

        info!(
            feed = %self.config.name,
            interval_secs = self.config.poll_interval_secs,
            "Polling for rates"
        );

        loop {
            tokio::select! {
                _ = ticker.tick(), if inflight.is_empty() => inflight.push(self.fetch_snapshot()),
                Some(result) = inflight.next(), if !inflight.is_empty() => match result {
                    Ok(snapshot) => {
                        if !self.emit(snapshot).await {
                            return Exit::Shutdown;
                        }
                    }
                    Err(e) => warn!(feed = %self.config.name, error = %e, "Poll failed, retrying next interval"),
                },
                ctrl = control_rx.recv() => match ctrl {
                    Some(Control::Reconnect) => {
                        info!(feed = %self.config.name, "Reconnect requested");
                        return Exit::Reconnect;
                    }
                    None => return Exit::Shutdown,
                },
            }
        }
    }

    /// Pull the rate table. Stamped with the time the request was issued so
    /// a slow response cannot overwrite a newer pushed table.
    async fn fetch_snapshot(&self) -> FeedResult<RateSnapshot> {
        let issued_at = self.clock.next();
        let body = timeout(
            self.config.request_timeout(),
            self.source.fetch(&self.config.poll_url),
        )
        .await
        .map_err(|_| FeedError::Timeout(self.config.request_timeout_ms))??;

        parse_rate_table(&body, &self.config.default_rate_key)?.into_snapshot(issued_at)
    }

    async fn emit(&self, snapshot: RateSnapshot) -> bool {
        let snapshot = match &self.ladder {
            Some(ladder) => ladder.apply(snapshot),
            None => snapshot,
        };
        self.events.send(FeedEvent::Snapshot(snapshot)).await.is_ok()
    }

    /// Record and forward a state change; false once the owner is gone
    async fn transition(&self, to: ConnectionState) -> bool {
        let from = std::mem::replace(&mut *self.state.write(), to);
        if from == to {
            return true;
        }

        info!(feed = %self.config.name, from = %from, to = %to, "Connection state changed");
        self.events.send(FeedEvent::State(to)).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aurum_core::RateKey;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_stream::wrappers::ReceiverStream;

    struct ScriptedSource {
        bodies: parking_lot::Mutex<Vec<FeedResult<String>>>,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(bodies: Vec<FeedResult<String>>) -> Arc<Self> {
            Arc::new(Self {
                bodies: parking_lot::Mutex::new(bodies),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl RateSource for ScriptedSource {
        async fn fetch(&self, _url: &str) -> FeedResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut bodies = self.bodies.lock();
            if bodies.len() > 1 {
                bodies.remove(0)
            } else {
                match bodies.first() {
                    Some(Ok(body)) => Ok(body.clone()),
                    _ => Err(FeedError::Http("503 Service Unavailable".into())),
                }
            }
        }
    }

    /// Accepts every request and never answers
    #[derive(Default)]
    struct HangingSource {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl RateSource for HangingSource {
        async fn fetch(&self, _url: &str) -> FeedResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    /// Hands out one pre-made stream, then refuses
    struct OneShotPush {
        stream: parking_lot::Mutex<Option<MessageStream>>,
    }

    #[async_trait::async_trait]
    impl PushChannel for OneShotPush {
        async fn open(&self, _url: &str) -> FeedResult<MessageStream> {
            self.stream
                .lock()
                .take()
                .ok_or_else(|| FeedError::ConnectionFailed("refused".into()))
        }
    }

    struct HangingPush;

    #[async_trait::async_trait]
    impl PushChannel for HangingPush {
        async fn open(&self, _url: &str) -> FeedResult<MessageStream> {
            std::future::pending().await
        }
    }

    fn config() -> FeedConfig {
        FeedConfig {
            poll_url: "http://rates.test/today".into(),
            ..FeedConfig::default()
        }
    }

    async fn next_snapshot(rx: &mut mpsc::Receiver<FeedEvent>) -> RateSnapshot {
        loop {
            match rx.recv().await.expect("connector ended") {
                FeedEvent::Snapshot(s) => return s,
                FeedEvent::State(_) => {}
            }
        }
    }

    async fn next_state(rx: &mut mpsc::Receiver<FeedEvent>) -> ConnectionState {
        loop {
            match rx.recv().await.expect("connector ended") {
                FeedEvent::State(s) => return s,
                FeedEvent::Snapshot(_) => {}
            }
        }
    }

    #[test]
    fn test_stamp_clock_strictly_increases() {
        let clock = StampClock::new();
        let stamps: Vec<_> = (0..1000).map(|_| clock.next()).collect();
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_push_url_polls_on_interval() {
        let source = ScriptedSource::new(vec![Ok(r#"{"data": {"TodayGoldPricePerGram": 7150}}"#.into())]);
        let (tx, mut rx) = mpsc::channel(16);
        let connector = FeedConnector::spawn(config(), Arc::new(HangingPush), source.clone(), tx);

        assert_eq!(next_state(&mut rx).await, ConnectionState::Connecting);
        assert_eq!(
            next_state(&mut rx).await,
            ConnectionState::Degraded(FallbackMode::Polling)
        );
        let snap = next_snapshot(&mut rx).await;
        assert_eq!(snap.rate(&RateKey::new("24K")), Some(dec!(7150)));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(source.calls(), 3);

        connector.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_timeout_degrades() {
        let source = ScriptedSource::new(vec![Ok(r#"{"key": "22K", "price": 6600}"#.into())]);
        let (tx, mut rx) = mpsc::channel(16);
        let connector = FeedConnector::spawn(
            config().with_push_url("ws://rates.test/ws"),
            Arc::new(HangingPush),
            source,
            tx,
        );

        assert_eq!(next_state(&mut rx).await, ConnectionState::Connecting);
        assert_eq!(
            next_state(&mut rx).await,
            ConnectionState::Degraded(FallbackMode::Polling)
        );
        assert!(connector.state().is_degraded());
        connector.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_then_channel_close_degrades() {
        let (msg_tx, msg_rx) = mpsc::channel::<FeedResult<String>>(8);
        let push = OneShotPush {
            stream: parking_lot::Mutex::new(Some(ReceiverStream::new(msg_rx).boxed())),
        };
        let source = ScriptedSource::new(vec![Ok(r#"{"key": "24K", "price": 7000}"#.into())]);
        let (tx, mut rx) = mpsc::channel(16);
        let connector = FeedConnector::spawn(
            config().with_push_url("ws://rates.test/ws"),
            Arc::new(push),
            source,
            tx,
        );

        assert_eq!(next_state(&mut rx).await, ConnectionState::Connecting);
        assert_eq!(next_state(&mut rx).await, ConnectionState::Live);
        // initial load over the pull side
        assert_eq!(next_snapshot(&mut rx).await.rate(&RateKey::new("24K")), Some(dec!(7000)));

        msg_tx.send(Ok("{not json".into())).await.unwrap();
        msg_tx
            .send(Ok(r#"{"type": "rates", "data": [{"key": "24K", "price": 7100}]}"#.into()))
            .await
            .unwrap();
        // malformed payload was skipped, the connection stayed up
        assert_eq!(next_snapshot(&mut rx).await.rate(&RateKey::new("24K")), Some(dec!(7100)));
        assert!(connector.state().is_live());

        drop(msg_tx);
        assert_eq!(
            next_state(&mut rx).await,
            ConnectionState::Degraded(FallbackMode::Polling)
        );
        connector.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_failures_keep_loop_alive() {
        let source = ScriptedSource::new(vec![
            Err(FeedError::Http("502 Bad Gateway".into())),
            Ok("garbage".into()),
            Ok(r#"[{"key": "18K", "pricePerUnit": 5400}]"#.into()),
        ]);
        let (tx, mut rx) = mpsc::channel(16);
        let connector = FeedConnector::spawn(config(), Arc::new(HangingPush), source.clone(), tx);

        let snap = next_snapshot(&mut rx).await;
        assert_eq!(snap.rate(&RateKey::new("18K")), Some(dec!(5400)));
        assert_eq!(source.calls(), 3);
        connector.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_reconnect_from_polling() {
        let (_msg_tx, msg_rx) = mpsc::channel::<FeedResult<String>>(8);
        let push = Arc::new(OneShotPush {
            stream: parking_lot::Mutex::new(None),
        });
        let source = ScriptedSource::new(vec![Ok(r#"{"key": "24K", "price": 7000}"#.into())]);
        let (tx, mut rx) = mpsc::channel(16);
        let connector = FeedConnector::spawn(
            config().with_push_url("ws://rates.test/ws"),
            push.clone(),
            source,
            tx,
        );

        assert_eq!(next_state(&mut rx).await, ConnectionState::Connecting);
        assert_eq!(
            next_state(&mut rx).await,
            ConnectionState::Degraded(FallbackMode::Polling)
        );

        *push.stream.lock() = Some(ReceiverStream::new(msg_rx).boxed());
        assert!(connector.force_reconnect());
        assert_eq!(next_state(&mut rx).await, ConnectionState::Connecting);
        assert_eq!(next_state(&mut rx).await, ConnectionState::Live);
        connector.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_purity_ladder_applied_before_forwarding() {
        let mut cfg = config();
        cfg.purity = Some(aurum_core::PurityLadderConfig::default());
        let source = ScriptedSource::new(vec![Ok(r#"{"TodayGoldPricePerGram": 7200}"#.into())]);
        let (tx, mut rx) = mpsc::channel(16);
        let connector = FeedConnector::spawn(cfg, Arc::new(HangingPush), source, tx);

        let snap = next_snapshot(&mut rx).await;
        assert_eq!(snap.rate(&RateKey::new("22K")), Some(dec!(6600)));
        connector.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_polling() {
        let source = ScriptedSource::new(vec![Ok(r#"{"key": "24K", "price": 7000}"#.into())]);
        let (tx, mut rx) = mpsc::channel(16);
        let connector = FeedConnector::spawn(config(), Arc::new(HangingPush), source.clone(), tx);

        next_snapshot(&mut rx).await;
        connector.stop().await;
        let calls = source.calls();

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(source.calls(), calls);
        // task gone, sender dropped
        while let Ok(event) = rx.try_recv() {
            let _ = event;
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_initial_load_retries_while_live() {
        let (_msg_tx, msg_rx) = mpsc::channel::<FeedResult<String>>(8);
        let push = OneShotPush {
            stream: parking_lot::Mutex::new(Some(ReceiverStream::new(msg_rx).boxed())),
        };
        let source = ScriptedSource::new(vec![
            Err(FeedError::Http("503 Service Unavailable".into())),
            Ok(r#"{"key": "22K", "price": 6000}"#.into()),
        ]);
        let (tx, mut rx) = mpsc::channel(16);
        let connector = FeedConnector::spawn(
            config().with_push_url("ws://rates.test/ws"),
            Arc::new(push),
            source.clone(),
            tx,
        );

        assert_eq!(next_state(&mut rx).await, ConnectionState::Connecting);
        assert_eq!(next_state(&mut rx).await, ConnectionState::Live);

        // channel stays silent; the pull side is retried on the poll interval
        let snap = next_snapshot(&mut rx).await;
        assert_eq!(snap.rate(&RateKey::new("22K")), Some(dec!(6000)));
        assert_eq!(source.calls(), 2);
        assert!(connector.state().is_live());

        // loaded, so no further pulls while the channel is up
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(source.calls(), 2);
        connector.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_notification_fetches_rates() {
        let (msg_tx, msg_rx) = mpsc::channel::<FeedResult<String>>(8);
        let push = OneShotPush {
            stream: parking_lot::Mutex::new(Some(ReceiverStream::new(msg_rx).boxed())),
        };
        let source = ScriptedSource::new(vec![
            Ok(r#"{"key": "24K", "price": 7000}"#.into()),
            Ok(r#"{"key": "24K", "price": 7080}"#.into()),
        ]);
        let (tx, mut rx) = mpsc::channel(16);
        let connector = FeedConnector::spawn(
            config().with_push_url("ws://rates.test/ws"),
            Arc::new(push),
            source.clone(),
            tx,
        );

        assert_eq!(next_snapshot(&mut rx).await.rate(&RateKey::new("24K")), Some(dec!(7000)));
        assert_eq!(source.calls(), 1);

        msg_tx.send(Ok(r#"{"type": "priceUpdated"}"#.into())).await.unwrap();
        assert_eq!(next_snapshot(&mut rx).await.rate(&RateKey::new("24K")), Some(dec!(7080)));
        assert_eq!(source.calls(), 2);
        assert!(connector.state().is_live());
        connector.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_reconnect_while_poll_request_hangs() {
        let (_msg_tx, msg_rx) = mpsc::channel::<FeedResult<String>>(8);
        let push = Arc::new(OneShotPush {
            stream: parking_lot::Mutex::new(None),
        });
        let source = Arc::new(HangingSource::default());
        let (tx, mut rx) = mpsc::channel(16);
        let connector = FeedConnector::spawn(
            config().with_push_url("ws://rates.test/ws"),
            push.clone(),
            source.clone(),
            tx,
        );

        assert_eq!(next_state(&mut rx).await, ConnectionState::Connecting);
        assert_eq!(
            next_state(&mut rx).await,
            ConnectionState::Degraded(FallbackMode::Polling)
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        *push.stream.lock() = Some(ReceiverStream::new(msg_rx).boxed());
        assert!(connector.force_reconnect());
        // well inside the 10s request timeout
        let state = tokio::time::timeout(Duration::from_secs(1), next_state(&mut rx))
            .await
            .expect("reconnect waited on the pending poll request");
        assert_eq!(state, ConnectionState::Connecting);
        assert_eq!(next_state(&mut rx).await, ConnectionState::Live);
        connector.stop().await;
    }
}
