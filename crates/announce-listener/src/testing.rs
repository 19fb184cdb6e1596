//! In-memory transport for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use crate::Error;
use crate::protocol::PING;
use crate::transport::{
    RequestSocket, SubscriberReader, SubscriberSocket, SubscriberWriter, Transport,
};

/// Scriptable broker stand-in. Replies immediately unless a reply is unset,
/// in which case the request waits forever (callers time out).
pub(crate) struct MockTransport {
    publisher: Mutex<Option<mpsc::UnboundedSender<String>>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    requests: Arc<Mutex<Vec<String>>>,
    ping_reply: Arc<Mutex<Option<String>>>,
    announce_reply: Arc<Mutex<Option<String>>>,
    fail_connect: AtomicBool,
    hang_connect: AtomicBool,
    fail_subscribe: Arc<AtomicBool>,
    hang_subscribe: Arc<AtomicBool>,
    slow_close: Arc<AtomicBool>,
    subscribers_opened: AtomicUsize,
    subscribers_closed: Arc<AtomicUsize>,
    request_sockets_closed: Arc<AtomicUsize>,
}

impl MockTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            publisher: Mutex::new(None),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
            ping_reply: Arc::new(Mutex::new(Some("pong".to_string()))),
            announce_reply: Arc::new(Mutex::new(Some("ok".to_string()))),
            fail_connect: AtomicBool::new(false),
            hang_connect: AtomicBool::new(false),
            fail_subscribe: Arc::new(AtomicBool::new(false)),
            hang_subscribe: Arc::new(AtomicBool::new(false)),
            slow_close: Arc::new(AtomicBool::new(false)),
            subscribers_opened: AtomicUsize::new(0),
            subscribers_closed: Arc::new(AtomicUsize::new(0)),
            request_sockets_closed: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub(crate) fn set_ping_reply(&self, reply: Option<&str>) {
        *self.ping_reply.lock().unwrap() = reply.map(str::to_string);
    }

    pub(crate) fn set_announce_reply(&self, reply: Option<&str>) {
        *self.announce_reply.lock().unwrap() = reply.map(str::to_string);
    }

    pub(crate) fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_hang_connect(&self, hang: bool) {
        self.hang_connect.store(hang, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_hang_subscribe(&self, hang: bool) {
        self.hang_subscribe.store(hang, Ordering::SeqCst);
    }

    /// Make subscriber close yield to the scheduler before completing.
    pub(crate) fn set_slow_close(&self, slow: bool) {
        self.slow_close.store(slow, Ordering::SeqCst);
    }

    /// Deliver a topic frame followed by a payload frame to the subscriber.
    pub(crate) fn publish(&self, topic: &str, message: &str) {
        let guard = self.publisher.lock().unwrap();
        let tx = guard.as_ref().expect("no subscriber connected");
        tx.send(topic.to_string()).unwrap();
        tx.send(message.to_string()).unwrap();
    }

    /// Drop the publishing side so the subscriber's next read fails.
    pub(crate) fn break_subscriber(&self) {
        self.publisher.lock().unwrap().take();
    }

    pub(crate) fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub(crate) fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn pings(&self) -> usize {
        self.requests().iter().filter(|r| *r == PING).count()
    }

    pub(crate) fn subscribers_opened(&self) -> usize {
        self.subscribers_opened.load(Ordering::SeqCst)
    }

    pub(crate) fn subscribers_closed(&self) -> usize {
        self.subscribers_closed.load(Ordering::SeqCst)
    }

    pub(crate) fn request_sockets_closed(&self) -> usize {
        self.request_sockets_closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn subscriber(&self, _endpoint: &Url) -> Result<SubscriberSocket, Error> {
        if self.hang_connect.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::Connect("connection refused".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.publisher.lock().unwrap() = Some(tx);
        self.subscribers_opened.fetch_add(1, Ordering::SeqCst);
        Ok(SubscriberSocket {
            reader: Box::new(MockReader { rx }),
            writer: Box::new(MockWriter {
                subscriptions: self.subscriptions.clone(),
                fail_subscribe: self.fail_subscribe.clone(),
                hang_subscribe: self.hang_subscribe.clone(),
                slow_close: self.slow_close.clone(),
                closed: self.subscribers_closed.clone(),
            }),
        })
    }

    async fn request(&self, _endpoint: &Url) -> Result<Box<dyn RequestSocket>, Error> {
        Ok(Box::new(MockRequest {
            requests: self.requests.clone(),
            ping_reply: self.ping_reply.clone(),
            announce_reply: self.announce_reply.clone(),
            closed: self.request_sockets_closed.clone(),
            sent: None,
        }))
    }
}

struct MockReader {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl SubscriberReader for MockReader {
    async fn recv(&mut self) -> Result<String, Error> {
        self.rx.recv().await.ok_or(Error::Closed)
    }
}

struct MockWriter {
    subscriptions: Arc<Mutex<Vec<String>>>,
    fail_subscribe: Arc<AtomicBool>,
    hang_subscribe: Arc<AtomicBool>,
    slow_close: Arc<AtomicBool>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl SubscriberWriter for MockWriter {
    async fn subscribe(&mut self, topic: &str) -> Result<(), Error> {
        if self.hang_subscribe.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(Error::Subscribe("socket is gone".to_string()));
        }
        self.subscriptions.lock().unwrap().push(topic.to_string());
        Ok(())
    }

    async fn close(&mut self) {
        if self.slow_close.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockRequest {
    requests: Arc<Mutex<Vec<String>>>,
    ping_reply: Arc<Mutex<Option<String>>>,
    announce_reply: Arc<Mutex<Option<String>>>,
    closed: Arc<AtomicUsize>,
    sent: Option<String>,
}

#[async_trait]
impl RequestSocket for MockRequest {
    async fn send(&mut self, payload: &str) -> Result<(), Error> {
        self.requests.lock().unwrap().push(payload.to_string());
        self.sent = Some(payload.to_string());
        Ok(())
    }

    async fn recv(&mut self) -> Result<String, Error> {
        let reply = if self.sent.as_deref() == Some(PING) {
            self.ping_reply.lock().unwrap().clone()
        } else {
            self.announce_reply.lock().unwrap().clone()
        };
        match reply {
            Some(reply) => Ok(reply),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}
