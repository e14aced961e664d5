//! Central manager for machines and channel dispatch.
//!
//! Handles:
//! - Routing direct-tcpip channel opens to the right machine
//! - Starting machines through providers, reusing shared ones
//! - Connecting accepted channels to TCP ports on the machine
//! - Graceful shutdown of every running machine

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::providers::{Machine, Provider, TranslateRequest};

/// Failure category reported when a channel open is refused, mirroring the
/// RFC 4254 channel-open failure reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Administratively refused, e.g. while shutting down.
    Prohibited,
    /// The target could not be reached.
    ConnectionFailed,
}

/// Byte stream of an accepted channel.
pub trait ChannelStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ChannelStream for T {}

/// One pending direct-tcpip channel open.
///
/// Abstracts the SSH transport so the manager and its channel tasks can be
/// driven by tests; the production implementation wraps a russh channel.
/// Both methods resolve quickly and must not block on peer I/O.
#[async_trait]
pub trait ChannelHandle: Send + 'static {
    /// Confirm the open and expose the channel as a byte stream.
    async fn accept(self: Box<Self>) -> Result<Box<dyn ChannelStream>>;

    /// Refuse the open.
    async fn reject(self: Box<Self>, reason: RejectReason, message: &str);
}

/// A direct-tcpip channel open, as parsed by the SSH transport.
pub struct ChannelOpenRequest {
    /// Remote address requested by the client, used verbatim as the target
    /// lookup key.
    pub target: String,
    /// Remote port requested by the client.
    pub port: u16,
    /// The channel awaiting a decision.
    pub channel: Box<dyn ChannelHandle>,
}

enum Event {
    ChannelOpen(ChannelOpenRequest),
    MachineStopped(MachineId),
    Stop(oneshot::Sender<()>),
}

type MachineId = u64;

/// Sender halves of a machine's control channels, shared by the manager
/// and the channel tasks feeding that machine.
#[derive(Clone)]
struct MachineHandles {
    mod_active: mpsc::Sender<i8>,
    translate: mpsc::Sender<TranslateRequest>,
    stop: mpsc::Sender<()>,
}

/// A running machine from the manager's point of view.
struct MachineRecord {
    target: String,
    /// Snapshot of `is_shared` at creation time; decides registry placement.
    shared: bool,
    handles: MachineHandles,
}

/// Central coordinator owning the set of running machines.
///
/// All state lives in a single event-loop task; the public methods enqueue
/// messages for it (the agent pattern). This gives the manager a total
/// order over channel arrivals, machine terminations and stop requests
/// without any locks.
pub struct Manager {
    events: mpsc::Sender<Event>,
}

impl Manager {
    /// Create a manager for the given targets and start its event loop.
    ///
    /// Ownership of the providers transfers to the manager: provider
    /// methods are called from the event-loop task from here on.
    pub fn new(providers: HashMap<String, Arc<dyn Provider>>) -> Self {
        let (events, receiver) = mpsc::channel(32);
        let state = ManagerState {
            events: events.clone(),
            providers,
            machines: HashMap::new(),
            shared_machines: HashMap::new(),
            next_machine_id: 0,
            stopping: false,
            stop_waiters: Vec::new(),
        };
        tokio::spawn(state.run(receiver));
        Self { events }
    }

    /// Hand an authenticated channel open to the manager for processing.
    ///
    /// The manager starts the target machine if necessary and connects the
    /// channel to the requested TCP port on it. Rejections are delivered
    /// through the channel handle.
    pub async fn submit_channel(&self, request: ChannelOpenRequest) {
        if let Err(mpsc::error::SendError(event)) =
            self.events.send(Event::ChannelOpen(request)).await
        {
            // The event loop only goes away after shutdown completes.
            if let Event::ChannelOpen(request) = event {
                request
                    .channel
                    .reject(RejectReason::Prohibited, "this server is shutting down")
                    .await;
            }
        }
    }

    /// Shut down every machine and wait for them to finish.
    ///
    /// Channel opens arriving after the stop message are rejected.
    /// Concurrent callers are all woken once shutdown completes.
    pub async fn stop(&self) {
        let (reply, done) = oneshot::channel();
        if self.events.send(Event::Stop(reply)).await.is_ok() {
            let _ = done.await;
        }
    }
}

struct ManagerState {
    events: mpsc::Sender<Event>,
    providers: HashMap<String, Arc<dyn Provider>>,
    /// Every running machine.
    machines: HashMap<MachineId, MachineRecord>,
    /// Running machines of shared providers, by target address.
    shared_machines: HashMap<String, MachineId>,
    next_machine_id: MachineId,
    stopping: bool,
    stop_waiters: Vec<oneshot::Sender<()>>,
}

impl ManagerState {
    async fn run(mut self, mut events: mpsc::Receiver<Event>) {
        while !(self.stopping && self.machines.is_empty()) {
            let Some(event) = events.recv().await else {
                break;
            };
            match event {
                Event::ChannelOpen(request) => self.handle_channel_open(request).await,
                Event::MachineStopped(id) => self.handle_machine_stopped(id),
                Event::Stop(reply) => self.handle_stop(reply),
            }
        }
        for waiter in self.stop_waiters {
            let _ = waiter.send(());
        }
    }

    async fn handle_channel_open(&mut self, request: ChannelOpenRequest) {
        if self.stopping {
            request
                .channel
                .reject(RejectReason::Prohibited, "this server is shutting down")
                .await;
            return;
        }

        let provider = match self.providers.get(&request.target) {
            Some(provider) => provider.clone(),
            None => {
                request
                    .channel
                    .reject(RejectReason::ConnectionFailed, "unknown remote address")
                    .await;
                return;
            }
        };

        // Reuse a shared machine if one is running, otherwise start one.
        let shared = provider.is_shared();
        let existing = if shared {
            self.shared_machines.get(&request.target).copied()
        } else {
            None
        };
        let handles = match existing {
            Some(id) => self.machines[&id].handles.clone(),
            None => self.start_machine(request.target.clone(), shared, provider),
        };

        // Connection setup blocks until the machine is ready; keep it off
        // the event loop.
        tokio::spawn(connect_channel(
            request.channel,
            handles,
            request.target,
            request.port,
        ));
    }

    fn start_machine(
        &mut self,
        target: String,
        shared: bool,
        provider: Arc<dyn Provider>,
    ) -> MachineHandles {
        let (mod_active_tx, mod_active_rx) = mpsc::channel(1);
        let (translate_tx, translate_rx) = mpsc::channel(1);
        // Capacity 1 so the stop broadcast never blocks the event loop.
        let (stop_tx, stop_rx) = mpsc::channel(1);

        let machine = Machine {
            mod_active: mod_active_rx,
            translate: translate_rx,
            stop: stop_rx,
        };
        let handles = MachineHandles {
            mod_active: mod_active_tx,
            translate: translate_tx,
            stop: stop_tx,
        };

        let id = self.next_machine_id;
        self.next_machine_id += 1;

        info!("Starting machine for target '{}'", target);
        let events = self.events.clone();
        tokio::spawn(async move {
            provider.run_machine(machine).await;
            let _ = events.send(Event::MachineStopped(id)).await;
        });

        self.machines.insert(
            id,
            MachineRecord {
                target: target.clone(),
                shared,
                handles: handles.clone(),
            },
        );
        if shared {
            self.shared_machines.insert(target, id);
        }
        handles
    }

    fn handle_machine_stopped(&mut self, id: MachineId) {
        let Some(record) = self.machines.remove(&id) else {
            return;
        };
        info!("Stopped machine for target '{}'", record.target);
        if record.shared && self.shared_machines.get(&record.target) == Some(&id) {
            self.shared_machines.remove(&record.target);
        }
        // Channel tasks that raced us hold their own sender clones. Their
        // sends fail cleanly now that the receiver halves are gone, so no
        // draining is needed here.
    }

    fn handle_stop(&mut self, reply: oneshot::Sender<()>) {
        if !self.stopping {
            self.stopping = true;
            for record in self.machines.values() {
                // try_send: a full buffer already carries a pending stop.
                let _ = record.handles.stop.try_send(());
            }
        }
        self.stop_waiters.push(reply);
    }
}

/// Connect one SSH channel to a TCP port on a machine.
///
/// Runs on a dedicated task per channel, so it is free to block.
async fn connect_channel(
    channel: Box<dyn ChannelHandle>,
    machine: MachineHandles,
    target: String,
    port: u16,
) {
    // Tell the provider about the connection before anything else. The
    // decrement below matches it on every exit path.
    if machine.mod_active.send(1).await.is_err() {
        // The machine stopped before we got going.
        channel
            .reject(RejectReason::ConnectionFailed, "service not available")
            .await;
        return;
    }

    proxy_channel(channel, &machine, &target, port).await;

    let _ = machine.mod_active.send(-1).await;
}

async fn proxy_channel(
    channel: Box<dyn ChannelHandle>,
    machine: &MachineHandles,
    target: &str,
    port: u16,
) {
    // Ask the provider for the real address. Providers hold the reply back
    // until the machine passes its reachability probe, so this also waits
    // out machine startup.
    let (reply_tx, reply_rx) = oneshot::channel();
    let request = TranslateRequest {
        addr: target.to_string(),
        port,
        reply: reply_tx,
    };
    if machine.translate.send(request).await.is_err() {
        channel
            .reject(RejectReason::ConnectionFailed, "service not available")
            .await;
        return;
    }
    let addr = match reply_rx.await {
        Ok(Some(addr)) => addr,
        // No reply usually means the request raced machine shutdown; the
        // provider may also refuse outright.
        Ok(None) | Err(_) => {
            channel
                .reject(RejectReason::ConnectionFailed, "service not available")
                .await;
            return;
        }
    };

    let mut remote = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(err) => {
            channel
                .reject(RejectReason::ConnectionFailed, &err.to_string())
                .await;
            return;
        }
    };

    let mut client = match channel.accept().await {
        Ok(stream) => stream,
        Err(err) => {
            debug!("Channel for target '{}' went away before accept: {}", target, err);
            return;
        }
    };

    // copy_bidirectional half-closes each write side as the opposite read
    // side hits EOF and returns once both directions finish, keeping
    // unidirectional shutdown visible end to end.
    match tokio::io::copy_bidirectional(&mut client, &mut remote).await {
        Ok((sent, received)) => {
            debug!(
                "Channel to {} closed ({} bytes out, {} bytes in)",
                addr, sent, received
            );
        }
        Err(err) => debug!("Channel to {} ended: {}", addr, err),
    }
}
