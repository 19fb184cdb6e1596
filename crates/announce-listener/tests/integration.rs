use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use announce_listener::protocol::Command;
use announce_listener::{
    Announcement, ChannelSink, DisconnectReason, Event, Events, Listener, ListenerConfig,
    ManualClock, TimingConfig, WebSocketTransport,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

type WsStream = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;
type WsSink = SplitSink<WsStream, tungstenite::Message>;

const EVENT_WAIT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct BrokerState {
    subscribers: tokio::sync::Mutex<Vec<WsSink>>,
    subscriptions: Mutex<Vec<String>>,
    commands: Mutex<Vec<Command>>,
    pings: AtomicUsize,
    silent_pings: AtomicBool,
}

/// Broker stand-in: control socket on `port`, publish socket on `port + 1`.
struct MockBroker {
    port: u16,
    state: Arc<BrokerState>,
}

impl MockBroker {
    async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let (control, publish) = bind_port_pair().await?;
        let port = control.local_addr()?.port();
        let state = Arc::new(BrokerState::default());
        tokio::spawn(serve_control(control, state.clone()));
        tokio::spawn(serve_publish(publish, state.clone()));
        Ok(Self { port, state })
    }

    fn address(&self) -> String {
        format!("tcp://127.0.0.1:{}", self.port)
    }

    fn stop_answering_pings(&self) {
        self.state.silent_pings.store(true, Ordering::SeqCst);
    }

    fn pings(&self) -> usize {
        self.state.pings.load(Ordering::SeqCst)
    }

    fn subscriptions(&self) -> Vec<String> {
        self.state.subscriptions.lock().unwrap().clone()
    }

    fn announcements(&self) -> Vec<Announcement> {
        self.state
            .commands
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                Command::Announce(a) => Some(a.clone()),
                _ => None,
            })
            .collect()
    }

    /// Send a topic frame and a payload frame to every subscriber.
    async fn publish(&self, topic: &str, message: &str) -> Result<(), Box<dyn std::error::Error>> {
        let mut subscribers = self.state.subscribers.lock().await;
        for sink in subscribers.iter_mut() {
            sink.send(tungstenite::Message::Text(topic.into())).await?;
            sink.send(tungstenite::Message::Text(message.into())).await?;
        }
        Ok(())
    }

    async fn wait_for_subscription(&self, topic: &str) {
        let wait = async {
            while !self.subscriptions().iter().any(|t| t == topic) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(EVENT_WAIT, wait)
            .await
            .expect("subscription never arrived");
    }
}

async fn bind_port_pair() -> std::io::Result<(TcpListener, TcpListener)> {
    let mut last_err = None;
    for _ in 0..20 {
        let control = TcpListener::bind("127.0.0.1:0").await?;
        let port = control.local_addr()?.port();
        let Some(next) = port.checked_add(1) else {
            continue;
        };
        match TcpListener::bind(("127.0.0.1", next)).await {
            Ok(publish) => return Ok((control, publish)),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| std::io::Error::other("no free port pair")))
}

async fn serve_control(listener: TcpListener, state: Arc<BrokerState>) {
    while let Ok((tcp, _)) = listener.accept().await {
        let state = state.clone();
        tokio::spawn(async move {
            let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await else {
                return;
            };
            while let Some(Ok(frame)) = ws.next().await {
                let tungstenite::Message::Text(text) = frame else {
                    continue;
                };
                let Some(command) = Command::parse(text.as_str()) else {
                    continue;
                };
                let reply = match &command {
                    Command::Ping => {
                        state.pings.fetch_add(1, Ordering::SeqCst);
                        (!state.silent_pings.load(Ordering::SeqCst)).then_some("pong")
                    }
                    Command::Announce(_) => Some("ok"),
                    Command::Subscribe(_) => None,
                };
                state.commands.lock().unwrap().push(command);
                if let Some(reply) = reply {
                    let _ = ws.send(tungstenite::Message::Text(reply.into())).await;
                }
            }
        });
    }
}

async fn serve_publish(listener: TcpListener, state: Arc<BrokerState>) {
    while let Ok((tcp, _)) = listener.accept().await {
        let Ok(ws) = tokio_tungstenite::accept_async(tcp).await else {
            continue;
        };
        let (sink, mut stream) = ws.split();
        state.subscribers.lock().await.push(sink);
        let state = state.clone();
        tokio::spawn(async move {
            while let Some(Ok(frame)) = stream.next().await {
                let tungstenite::Message::Text(text) = frame else {
                    continue;
                };
                if let Some(Command::Subscribe(topic)) = Command::parse(text.as_str()) {
                    state.subscriptions.lock().unwrap().push(topic);
                }
            }
        });
    }
}

/// Short waits so idle ticks take a fraction of a second.
fn fast_timing(heartbeat_units: u32) -> TimingConfig {
    TimingConfig {
        topic_timeout: Duration::from_millis(200),
        payload_timeout: Duration::from_millis(100),
        request_timeout: Duration::from_millis(500),
        connect_timeout: Duration::from_secs(5),
        heartbeat_units,
        ..TimingConfig::default()
    }
}

fn start_listener(broker: &MockBroker, timing: TimingConfig) -> (Listener, Events) {
    let config = ListenerConfig::new(&broker.address())
        .unwrap()
        .with_topic("proj1")
        .with_timing(timing);
    let (sink, events) = ChannelSink::new();
    let listener = Listener::new(config, Arc::new(sink)).unwrap();
    listener.connect();
    (listener, events)
}

async fn next_event(events: &mut Events) -> Event {
    tokio::time::timeout(EVENT_WAIT, events.next())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn receives_announcement_over_websocket() {
    let broker = MockBroker::start().await.unwrap();
    let (listener, mut events) = start_listener(&broker, fast_timing(300));

    assert_eq!(next_event(&mut events).await, Event::Connected);
    broker.wait_for_subscription("proj1").await;

    broker.publish("proj1", "rev42").await.unwrap();

    assert_eq!(
        next_event(&mut events).await,
        Event::Announcement(Announcement::new("proj1", "rev42").unwrap())
    );
    listener.dispose().await;
}

#[tokio::test]
async fn late_topic_is_subscribed_live() {
    let broker = MockBroker::start().await.unwrap();
    let (listener, mut events) = start_listener(&broker, fast_timing(300));
    assert_eq!(next_event(&mut events).await, Event::Connected);

    listener.also_listen_to("proj2").await;
    broker.wait_for_subscription("proj2").await;
    broker.publish("proj2", "rev7").await.unwrap();

    assert_eq!(
        next_event(&mut events).await,
        Event::Announcement(Announcement::new("proj2", "rev7").unwrap())
    );
    listener.dispose().await;
}

#[tokio::test]
async fn heartbeat_keeps_connection_alive() {
    let broker = MockBroker::start().await.unwrap();
    let (listener, mut events) = start_listener(&broker, fast_timing(12));
    assert_eq!(next_event(&mut events).await, Event::Connected);

    let wait = async {
        while broker.pings() < 2 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };
    tokio::time::timeout(EVENT_WAIT, wait).await.unwrap();

    assert!(listener.is_connected());
    assert_eq!(events.try_next(), None);
    listener.dispose().await;
}

#[tokio::test]
async fn unanswered_ping_disconnects() {
    let broker = MockBroker::start().await.unwrap();
    broker.stop_answering_pings();
    let (listener, mut events) = start_listener(&broker, fast_timing(6));
    assert_eq!(next_event(&mut events).await, Event::Connected);

    assert_eq!(
        next_event(&mut events).await,
        Event::Disconnected {
            reason: DisconnectReason::TimeOut,
            message: "Ping timeout".to_string(),
        }
    );
    assert!(!listener.is_connected());
    listener.dispose().await;
}

#[tokio::test]
async fn announce_reaches_broker() {
    let broker = MockBroker::start().await.unwrap();
    let (listener, mut events) = start_listener(&broker, fast_timing(300));
    assert_eq!(next_event(&mut events).await, Event::Connected);

    let announcement = Announcement::new("proj1", "rev43").unwrap();
    listener.announce(announcement.clone()).await;

    assert_eq!(broker.announcements(), vec![announcement]);
    assert!(listener.is_connected());
    listener.dispose().await;
}

#[tokio::test]
async fn wall_clock_jump_is_reported_as_sleep() {
    let broker = MockBroker::start().await.unwrap();
    let config = ListenerConfig::new(&broker.address())
        .unwrap()
        .with_timing(fast_timing(300));
    let clock = Arc::new(ManualClock::default());
    let (sink, mut events) = ChannelSink::new();
    let listener = Listener::with_transport(
        config,
        Arc::new(sink),
        Arc::new(WebSocketTransport),
        clock.clone(),
    )
    .unwrap();
    listener.connect();
    assert_eq!(next_event(&mut events).await, Event::Connected);

    clock.advance(Duration::from_secs(3600));

    assert_eq!(
        next_event(&mut events).await,
        Event::Disconnected {
            reason: DisconnectReason::SystemSleep,
            message: "Ping timeout".to_string(),
        }
    );
    assert_eq!(broker.pings(), 0);
    listener.dispose().await;
}

#[tokio::test]
async fn unreachable_broker_reports_timeout() {
    // Reserve a port, then free it so nothing is listening.
    let port = {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().unwrap().port()
    };
    let config = ListenerConfig::new(&format!("tcp://127.0.0.1:{}", port.saturating_sub(1)))
        .unwrap()
        .with_timing(fast_timing(300));
    let (sink, mut events) = ChannelSink::new();
    let listener = Listener::new(config, Arc::new(sink)).unwrap();
    listener.connect();

    match next_event(&mut events).await {
        Event::Disconnected { reason, message } => {
            assert_eq!(reason, DisconnectReason::TimeOut);
            assert!(message.starts_with("connect failed"), "got {message}");
        }
        other => panic!("expected Disconnected, got {other:?}"),
    }
    listener.dispose().await;
}

#[tokio::test]
async fn stop_reports_requested_once() {
    let broker = MockBroker::start().await.unwrap();
    let (listener, mut events) = start_listener(&broker, fast_timing(300));
    assert_eq!(next_event(&mut events).await, Event::Connected);

    listener.stop().await;
    listener.stop().await;

    assert_eq!(
        next_event(&mut events).await,
        Event::Disconnected {
            reason: DisconnectReason::Requested,
            message: "Disconnect requested".to_string(),
        }
    );
    assert_eq!(events.try_next(), None);

    listener.connect();
    assert_eq!(next_event(&mut events).await, Event::Connected);
    listener.dispose().await;
}
