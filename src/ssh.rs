//! SSH server front end built on russh.
//!
//! Handles:
//! - Public key authentication for the fixed `jump` user
//! - Adapting direct-tcpip channel opens into manager requests
//! - Refusing every other channel type

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use russh::keys::{PrivateKey, PublicKey, PublicKeyBase64};
use russh::server::{Auth, Handler, Msg, Session};
use russh::Channel;
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::manager::{ChannelHandle, ChannelOpenRequest, ChannelStream, Manager, RejectReason};

/// Immutable pieces shared by every connection.
pub struct Server {
    config: Arc<russh::server::Config>,
    authorized_key: [u8; 32],
    manager: Arc<Manager>,
}

impl Server {
    pub fn new(host_key: PrivateKey, authorized_key: [u8; 32], manager: Arc<Manager>) -> Self {
        let config = Arc::new(russh::server::Config {
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            keys: vec![host_key],
            ..Default::default()
        });
        Self {
            config,
            authorized_key,
            manager,
        }
    }
}

/// Accept connections forever and run an SSH session on each.
pub async fn serve(listener: TcpListener, server: Arc<Server>) -> Result<()> {
    loop {
        let (stream, peer_addr) = listener
            .accept()
            .await
            .context("Failed to accept connection")?;
        let server = server.clone();
        tokio::spawn(async move {
            let handler = ConnectionHandler {
                server: server.clone(),
                peer_addr,
            };
            match russh::server::run_stream(server.config.clone(), stream, handler).await {
                Ok(session) => {
                    if let Err(err) = session.await {
                        debug!("{} session ended: {}", peer_addr, err);
                    }
                }
                Err(err) => {
                    info!("{} handshake failed: {}", peer_addr, err);
                }
            }
        });
    }
}

/// Per-connection handler state.
struct ConnectionHandler {
    server: Arc<Server>,
    peer_addr: SocketAddr,
}

impl ConnectionHandler {
    fn key_is_authorized(&self, user: &str, key: &PublicKey) -> bool {
        if user != "jump" {
            return false;
        }
        let digest: [u8; 32] = Sha256::digest(key.public_key_bytes()).into();
        constant_time_eq(&digest, &self.server.authorized_key)
    }
}

/// Compare two digests without short-circuiting on the first mismatch.
fn constant_time_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self.key_is_authorized(user, key) {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        if self.key_is_authorized(user, key) {
            info!("{} publickey auth success for user '{}'", self.peer_addr, user);
            Ok(Auth::Accept)
        } else {
            info!("{} publickey auth rejected for user '{}'", self.peer_addr, user);
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    /// Only direct-tcpip channels are served; everything else is refused.
    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("{} refused session channel", self.peer_addr);
        Ok(false)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let (verdict, decision) = oneshot::channel();
        let handle = Box::new(SshChannelHandle {
            channel,
            verdict,
            target: host_to_connect.to_string(),
        });
        self.server
            .manager
            .submit_channel(ChannelOpenRequest {
                target: host_to_connect.to_string(),
                port: port_to_connect as u16,
                channel: handle,
            })
            .await;

        // Resolves when the proxy task has dialled the machine or given up,
        // so the client sees the open fail rather than an instant close.
        // While a machine is booting, further opens on this connection wait
        // their turn behind this one.
        Ok(decision.await.unwrap_or(false))
    }
}

/// The production channel handle: a russh channel plus the verdict slot the
/// connection handler is waiting on.
struct SshChannelHandle {
    channel: Channel<Msg>,
    verdict: oneshot::Sender<bool>,
    target: String,
}

#[async_trait]
impl ChannelHandle for SshChannelHandle {
    async fn accept(self: Box<Self>) -> Result<Box<dyn ChannelStream>> {
        self.verdict
            .send(true)
            .map_err(|_| anyhow!("session is gone"))?;
        Ok(Box::new(self.channel.into_stream()))
    }

    async fn reject(self: Box<Self>, reason: RejectReason, message: &str) {
        info!(
            "Rejecting channel for '{}' ({:?}): {}",
            self.target, reason, message
        );
        let _ = self.verdict.send(false);
    }
}
