//! Manager scenarios driven by a scripted provider and loopback TCP
//! services standing in for real machines.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};

use jumpgate::manager::{
    ChannelHandle, ChannelOpenRequest, ChannelStream, Manager, RejectReason,
};
use jumpgate::providers::{Machine, Provider};

/// Lifecycle trace shared with the scripted provider.
#[derive(Default)]
struct Trace {
    starts: usize,
    stops: usize,
    deltas: Vec<i8>,
    held_translates: usize,
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Trace>>);

impl Recorder {
    fn starts(&self) -> usize {
        self.0.lock().unwrap().starts
    }

    fn stops(&self) -> usize {
        self.0.lock().unwrap().stops
    }

    fn deltas(&self) -> Vec<i8> {
        self.0.lock().unwrap().deltas.clone()
    }

    fn push_delta(&self, delta: i8) {
        self.0.lock().unwrap().deltas.push(delta);
    }

    fn held_translates(&self) -> usize {
        self.0.lock().unwrap().held_translates
    }
}

/// Scripted provider: "provisions" instantly, forwards to a fixed host and
/// records lifecycle events for assertions.
struct ScriptedProvider {
    shared: bool,
    reachable: bool,
    host: String,
    linger: Duration,
    recorder: Recorder,
}

impl ScriptedProvider {
    fn new(recorder: Recorder) -> Self {
        Self {
            shared: true,
            reachable: true,
            host: "127.0.0.1".to_string(),
            linger: Duration::ZERO,
            recorder,
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn is_shared(&self) -> bool {
        self.shared
    }

    async fn run_machine(&self, mut mach: Machine) {
        self.recorder.0.lock().unwrap().starts += 1;
        if self.reachable {
            self.message_loop(&mut mach).await;
        }
        self.recorder.0.lock().unwrap().stops += 1;
    }
}

impl ScriptedProvider {
    async fn message_loop(&self, mach: &mut Machine) {
        let Some(first) = mach.mod_active.recv().await else {
            return;
        };
        self.recorder.push_delta(first);
        let mut active = i32::from(first);

        loop {
            while active > 0 {
                tokio::select! {
                    delta = mach.mod_active.recv() => match delta {
                        Some(delta) => {
                            self.recorder.push_delta(delta);
                            active += i32::from(delta);
                        }
                        None => return,
                    },
                    request = mach.translate.recv() => match request {
                        Some(request) => {
                            let addr = format!("{}:{}", self.host, request.port);
                            let _ = request.reply.send(Some(addr));
                        }
                        None => return,
                    },
                    _ = mach.stop.recv() => return,
                }
            }
            tokio::select! {
                delta = mach.mod_active.recv() => match delta {
                    Some(delta) => {
                        self.recorder.push_delta(delta);
                        active += i32::from(delta);
                    }
                    None => return,
                },
                _ = mach.stop.recv() => return,
                _ = sleep(self.linger) => return,
            }
        }
    }
}

/// Provider that takes a translate request but never answers it, keeping
/// the reply pending until the machine is stopped.
struct StallingProvider {
    recorder: Recorder,
}

#[async_trait]
impl Provider for StallingProvider {
    fn is_shared(&self) -> bool {
        true
    }

    async fn run_machine(&self, mut mach: Machine) {
        self.recorder.0.lock().unwrap().starts += 1;
        let _ = mach.mod_active.recv().await;
        let held = mach.translate.recv().await;
        if held.is_some() {
            self.recorder.0.lock().unwrap().held_translates += 1;
        }
        let _ = mach.stop.recv().await;
        // Returning drops the held request and its reply sender.
        drop(held);
        self.recorder.0.lock().unwrap().stops += 1;
    }
}

#[derive(Debug)]
enum Outcome {
    Accepted,
    Rejected(RejectReason, String),
}

/// In-memory stand-in for an SSH channel: one side goes to the proxy, the
/// other stays with the test as "the client".
struct TestChannel {
    stream: DuplexStream,
    outcome: oneshot::Sender<Outcome>,
}

#[async_trait]
impl ChannelHandle for TestChannel {
    async fn accept(self: Box<Self>) -> anyhow::Result<Box<dyn ChannelStream>> {
        let _ = self.outcome.send(Outcome::Accepted);
        Ok(Box::new(self.stream))
    }

    async fn reject(self: Box<Self>, reason: RejectReason, message: &str) {
        let _ = self
            .outcome
            .send(Outcome::Rejected(reason, message.to_string()));
    }
}

async fn open_channel(
    manager: &Manager,
    target: &str,
    port: u16,
) -> (DuplexStream, oneshot::Receiver<Outcome>) {
    let (server_side, client_side) = tokio::io::duplex(64 * 1024);
    let (outcome_tx, outcome_rx) = oneshot::channel();
    manager
        .submit_channel(ChannelOpenRequest {
            target: target.to_string(),
            port,
            channel: Box::new(TestChannel {
                stream: server_side,
                outcome: outcome_tx,
            }),
        })
        .await;
    (client_side, outcome_rx)
}

fn manager_with(provider: ScriptedProvider) -> Manager {
    let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
    providers.insert("t1".to_string(), Arc::new(provider));
    Manager::new(providers)
}

/// Loopback echo service standing in for the backing machine.
async fn echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut read, mut write) = socket.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    port
}

async fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let end = tokio::time::Instant::now() + deadline;
    while tokio::time::Instant::now() < end {
        if cond() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    cond()
}

async fn expect_echo(client: &mut DuplexStream, payload: &[u8]) {
    client.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, payload);
}

#[tokio::test]
async fn shared_target_reuses_one_machine() {
    let port = echo_server().await;
    let recorder = Recorder::default();
    let manager = manager_with(ScriptedProvider::new(recorder.clone()));

    let (mut client_a, outcome_a) = open_channel(&manager, "t1", port).await;
    let (mut client_b, outcome_b) = open_channel(&manager, "t1", port).await;

    assert!(matches!(outcome_a.await.unwrap(), Outcome::Accepted));
    assert!(matches!(outcome_b.await.unwrap(), Outcome::Accepted));

    expect_echo(&mut client_a, b"ping-a").await;
    expect_echo(&mut client_b, b"ping-b").await;
    assert_eq!(recorder.starts(), 1);

    drop(client_a);
    drop(client_b);

    assert!(wait_until(Duration::from_secs(2), || recorder.stops() == 1).await);

    // Both channels were counted in and out, and they overlapped.
    let deltas = recorder.deltas();
    assert_eq!(deltas.iter().map(|d| i32::from(*d)).sum::<i32>(), 0);
    let mut level = 0;
    let mut peak = 0;
    for delta in &deltas {
        level += i32::from(*delta);
        peak = peak.max(level);
    }
    assert_eq!(peak, 2);

    manager.stop().await;
}

#[tokio::test]
async fn non_shared_target_starts_one_machine_per_channel() {
    let port = echo_server().await;
    let recorder = Recorder::default();
    let manager = manager_with(ScriptedProvider {
        shared: false,
        ..ScriptedProvider::new(recorder.clone())
    });

    let (mut client_a, outcome_a) = open_channel(&manager, "t1", port).await;
    let (mut client_b, outcome_b) = open_channel(&manager, "t1", port).await;

    assert!(matches!(outcome_a.await.unwrap(), Outcome::Accepted));
    assert!(matches!(outcome_b.await.unwrap(), Outcome::Accepted));

    expect_echo(&mut client_a, b"ping-a").await;
    expect_echo(&mut client_b, b"ping-b").await;
    assert_eq!(recorder.starts(), 2);

    drop(client_a);
    drop(client_b);

    assert!(wait_until(Duration::from_secs(2), || recorder.stops() == 2).await);
    manager.stop().await;
}

#[tokio::test]
async fn linger_keeps_machine_for_next_channel() {
    let port = echo_server().await;
    let recorder = Recorder::default();
    let manager = manager_with(ScriptedProvider {
        linger: Duration::from_secs(1),
        ..ScriptedProvider::new(recorder.clone())
    });

    let (mut client, outcome) = open_channel(&manager, "t1", port).await;
    assert!(matches!(outcome.await.unwrap(), Outcome::Accepted));
    expect_echo(&mut client, b"first").await;
    drop(client);

    sleep(Duration::from_millis(300)).await;

    // Reopened inside the linger window: the same machine serves it.
    let (mut client, outcome) = open_channel(&manager, "t1", port).await;
    assert!(matches!(outcome.await.unwrap(), Outcome::Accepted));
    expect_echo(&mut client, b"second").await;
    assert_eq!(recorder.starts(), 1);
    assert_eq!(recorder.stops(), 0);
    drop(client);

    assert!(wait_until(Duration::from_secs(3), || recorder.stops() == 1).await);
    assert_eq!(recorder.starts(), 1);
    manager.stop().await;
}

#[tokio::test]
async fn linger_expiry_stops_idle_machine() {
    let port = echo_server().await;
    let recorder = Recorder::default();
    let manager = manager_with(ScriptedProvider {
        linger: Duration::from_millis(300),
        ..ScriptedProvider::new(recorder.clone())
    });

    let (mut client, outcome) = open_channel(&manager, "t1", port).await;
    assert!(matches!(outcome.await.unwrap(), Outcome::Accepted));
    expect_echo(&mut client, b"once").await;
    drop(client);

    assert!(wait_until(Duration::from_secs(2), || recorder.stops() == 1).await);
    assert_eq!(recorder.starts(), 1);
    manager.stop().await;
}

#[tokio::test]
async fn unreachable_machine_rejects_channel() {
    let recorder = Recorder::default();
    let manager = manager_with(ScriptedProvider {
        reachable: false,
        ..ScriptedProvider::new(recorder.clone())
    });

    let (_client, outcome) = open_channel(&manager, "t1", 22).await;
    match outcome.await.unwrap() {
        Outcome::Rejected(RejectReason::ConnectionFailed, _) => {}
        other => panic!("expected connection failure, got {other:?}"),
    }

    assert!(wait_until(Duration::from_secs(2), || recorder.stops() == 1).await);
    assert_eq!(recorder.starts(), 1);

    // The dead machine is gone from the registry, so shutdown is immediate.
    manager.stop().await;
}

#[tokio::test]
async fn machine_exit_with_pending_translate_rejects_channel() {
    let recorder = Recorder::default();
    let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
    providers.insert(
        "t1".to_string(),
        Arc::new(StallingProvider {
            recorder: recorder.clone(),
        }),
    );
    let manager = Manager::new(providers);

    let (_client, outcome) = open_channel(&manager, "t1", 22).await;
    assert!(wait_until(Duration::from_secs(2), || recorder.held_translates() == 1).await);

    // Take the machine down while the translate is still unanswered. The
    // dropped reply is what the waiting channel observes.
    manager.stop().await;
    assert_eq!(recorder.stops(), 1);

    match timeout(Duration::from_secs(2), outcome)
        .await
        .expect("channel still waiting on a dead machine")
        .unwrap()
    {
        Outcome::Rejected(RejectReason::ConnectionFailed, message) => {
            assert_eq!(message, "service not available");
        }
        other => panic!("expected connection failure, got {other:?}"),
    }
    // The rejection is the channel task's last act before its paired
    // decrement, so resolving here means nothing is left blocked on the
    // dead machine's channels.
}

#[tokio::test]
async fn unknown_target_rejects_channel() {
    let recorder = Recorder::default();
    let manager = manager_with(ScriptedProvider::new(recorder.clone()));

    let (_client, outcome) = open_channel(&manager, "nope", 22).await;
    match outcome.await.unwrap() {
        Outcome::Rejected(RejectReason::ConnectionFailed, message) => {
            assert_eq!(message, "unknown remote address");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(recorder.starts(), 0);
    manager.stop().await;
}

#[tokio::test]
async fn graceful_shutdown_stops_machines_and_rejects_new_channels() {
    let port = echo_server().await;
    let recorder = Recorder::default();
    let manager = manager_with(ScriptedProvider {
        linger: Duration::from_secs(30),
        ..ScriptedProvider::new(recorder.clone())
    });

    let (mut client, outcome) = open_channel(&manager, "t1", port).await;
    assert!(matches!(outcome.await.unwrap(), Outcome::Accepted));
    expect_echo(&mut client, b"live").await;

    // Stop with the channel still active: the machine must go down anyway.
    manager.stop().await;
    assert_eq!(recorder.stops(), 1);

    let (_late, outcome) = open_channel(&manager, "t1", port).await;
    match outcome.await.unwrap() {
        Outcome::Rejected(RejectReason::Prohibited, message) => {
            assert!(message.contains("shutting down"));
        }
        other => panic!("expected prohibited rejection, got {other:?}"),
    }

    drop(client);
}

#[tokio::test]
async fn client_half_close_preserves_return_data() {
    // A service that only answers after it has seen the client's EOF.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let (mut read, mut write) = socket.split();
        let mut request = Vec::new();
        read.read_to_end(&mut request).await.unwrap();
        write.write_all(&request).await.unwrap();
        write.shutdown().await.unwrap();
    });

    let recorder = Recorder::default();
    let manager = manager_with(ScriptedProvider::new(recorder.clone()));

    let (mut client, outcome) = open_channel(&manager, "t1", port).await;
    assert!(matches!(outcome.await.unwrap(), Outcome::Accepted));

    client.write_all(b"half-close").await.unwrap();
    client.shutdown().await.unwrap();

    // The write side is closed but the read side must still deliver the
    // response.
    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    assert_eq!(response, b"half-close");

    drop(client);
    manager.stop().await;
}
