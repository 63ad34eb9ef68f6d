//! In-memory feed collaborators for engine tests

#![allow(dead_code)]

use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use aurum_core::{EngineConfig, FeedError, FeedResult};
use aurum_price_feed::{MessageStream, PushChannel, RateSource};

pub const PUSH_URL: &str = "ws://feed.test/rates";

/// Resource counters shared by the fakes
#[derive(Debug, Default)]
pub struct Gauges {
    pub opened: AtomicUsize,
    pub open_now: AtomicUsize,
    pub peak_open: AtomicUsize,
    pub fetches: AtomicUsize,
}

impl Gauges {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn open_now(&self) -> usize {
        self.open_now.load(Ordering::SeqCst)
    }

    /// Most push channels ever open at once
    pub fn peak_open(&self) -> usize {
        self.peak_open.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

struct StreamGuard(Arc<Gauges>);

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.open_now.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Push channel backed by unbounded channels; the test writes into the most
/// recently opened one.
pub struct FakePush {
    gauges: Arc<Gauges>,
    failures_left: AtomicUsize,
    senders: Mutex<Vec<mpsc::UnboundedSender<FeedResult<String>>>>,
}

impl FakePush {
    pub fn new(gauges: Arc<Gauges>) -> Self {
        Self {
            gauges,
            failures_left: AtomicUsize::new(0),
            senders: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next `n` open attempts
    pub fn failing(self, n: usize) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    pub fn send(&self, text: &str) {
        let senders = self.senders.lock();
        let tx = senders.last().expect("no push channel opened");
        let _ = tx.send(Ok(text.to_string()));
    }
}

#[async_trait::async_trait]
impl PushChannel for FakePush {
    async fn open(&self, _url: &str) -> FeedResult<MessageStream> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(FeedError::ConnectionFailed("refused".into()));
        }

        self.gauges.opened.fetch_add(1, Ordering::SeqCst);
        let now = self.gauges.open_now.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauges.peak_open.fetch_max(now, Ordering::SeqCst);

        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().push(tx);

        let guard = StreamGuard(Arc::clone(&self.gauges));
        Ok(UnboundedReceiverStream::new(rx)
            .map(move |msg| {
                let _ = &guard;
                msg
            })
            .boxed())
    }
}

#[derive(Debug, Clone)]
pub enum Reply {
    Body(String),
    Slow(Duration, String),
    Fail,
}

/// Rate source answering from a script, then repeating a fallback reply
pub struct FakeSource {
    gauges: Arc<Gauges>,
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
}

impl FakeSource {
    pub fn new(gauges: Arc<Gauges>, fallback: Reply) -> Self {
        Self {
            gauges,
            script: Mutex::new(VecDeque::new()),
            fallback,
        }
    }

    pub fn then(self, reply: Reply) -> Self {
        self.script.lock().push_back(reply);
        self
    }
}

#[async_trait::async_trait]
impl RateSource for FakeSource {
    async fn fetch(&self, _url: &str) -> FeedResult<String> {
        self.gauges.fetches.fetch_add(1, Ordering::SeqCst);
        let reply = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match reply {
            Reply::Body(body) => Ok(body),
            Reply::Slow(delay, body) => {
                tokio::time::sleep(delay).await;
                Ok(body)
            }
            Reply::Fail => Err(FeedError::Http("503 Service Unavailable".into())),
        }
    }
}

pub fn table(key: &str, price: u32) -> String {
    format!(r#"[{{"key":"{}","pricePerUnit":{}}}]"#, key, price)
}

pub fn poll_only() -> EngineConfig {
    EngineConfig::default()
}

pub fn with_push() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.feed = config.feed.with_push_url(PUSH_URL);
    config
}

/// Let the runtime make progress until `cond` holds
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
