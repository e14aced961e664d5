//! Docker container targets.
//!
//! Provisions one container per machine through the local Docker daemon,
//! waits for the forwarded service to accept TCP connections, then serves
//! address translation until activity ceases or a stop arrives.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, InspectContainerOptions, RemoveContainerOptionsBuilder,
    StartContainerOptions, StopContainerOptionsBuilder,
};
use bollard::Docker;
use chrono::Utc;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{info, warn};

use crate::config::{parse_duration, Diagnostics};

use super::{message_loop, Machine, Provider};

/// Bound on every individual Docker API call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One reachability probe per interval, for at most `PROBE_ATTEMPTS` tries.
const PROBE_INTERVAL: Duration = Duration::from_secs(3);
const PROBE_ATTEMPTS: u32 = 40;

/// Network containers are attached to; address resolution reads the
/// endpoint the daemon reports for it.
const NETWORK_MODE: &str = "bridge";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TargetOptions {
    /// Image to run.
    image: String,
    /// Dialable address override; defaults to the container's bridge IP.
    addr: Option<String>,
    /// Port probed for reachability before channels are served.
    check_port: Option<u16>,
    /// Whether concurrent connections share one container.
    shared: Option<bool>,
    /// Idle grace period before a shared container is stopped.
    linger: Option<String>,
    /// Extra environment variables, as `NAME=value` entries.
    #[serde(default)]
    env: Vec<String>,
}

pub struct DockerProvider {
    target: String,
    docker: Docker,
    image: String,
    addr: Option<String>,
    check_port: u16,
    shared: bool,
    linger: Duration,
    env: Vec<String>,
}

/// Container data the run loop needs after provisioning.
struct StartedContainer {
    id: String,
    addr: String,
}

pub fn new_provider(target: &str, options: &toml::Table) -> (Option<Arc<dyn Provider>>, Diagnostics) {
    let mut diags = Diagnostics::new();

    let options: TargetOptions = match options.clone().try_into() {
        Ok(options) => options,
        Err(err) => {
            diags.error("Invalid docker target", format!("Target '{target}': {err}"));
            return (None, diags);
        }
    };

    let shared = options.shared.unwrap_or(true);
    let mut linger = Duration::ZERO;
    match &options.linger {
        Some(value) if shared => match parse_duration(value) {
            Ok(parsed) => linger = parsed,
            Err(err) => {
                diags.error(
                    "Invalid duration for 'linger' field",
                    format!("Target '{target}': {err}"),
                );
            }
        },
        Some(_) => {
            diags.warning(
                "Field 'linger' was ignored",
                format!("Target '{target}': 'linger' has no effect when 'shared = false'"),
            );
        }
        None => {}
    }

    let docker = match Docker::connect_with_local_defaults() {
        Ok(docker) => docker,
        Err(err) => {
            diags.error(
                "Cannot connect to Docker",
                format!("Target '{target}': {err}"),
            );
            return (None, diags);
        }
    };

    if diags.has_errors() {
        return (None, diags);
    }

    let provider = DockerProvider {
        target: target.to_string(),
        docker,
        image: options.image,
        addr: options.addr,
        check_port: options.check_port.unwrap_or(22),
        shared,
        linger,
        env: options.env,
    };
    (Some(Arc::new(provider)), diags)
}

#[async_trait]
impl Provider for DockerProvider {
    fn is_shared(&self) -> bool {
        self.shared
    }

    async fn run_machine(&self, mut mach: Machine) {
        // Teardown only runs for a container that actually started.
        let container = match self.start_container().await {
            Ok(container) => container,
            Err(err) => {
                warn!(
                    "Failed to start container for target '{}': {:#}",
                    self.target, err
                );
                return;
            }
        };

        if self.probe(&container.addr, &mut mach).await {
            message_loop(&mut mach, &container.addr, self.linger).await;
        }

        if let Err(err) = self.remove_container(&container.id).await {
            warn!(
                "Failed to remove container for target '{}': {:#}",
                self.target, err
            );
        } else {
            info!("Removed container for target '{}'", self.target);
        }
    }
}

impl DockerProvider {
    async fn start_container(&self) -> Result<StartedContainer> {
        let labels: HashMap<String, String> = HashMap::from([
            ("jumpgate.managed".to_string(), "true".to_string()),
            ("jumpgate.target".to_string(), self.target.clone()),
            ("jumpgate.started_at".to_string(), Utc::now().to_rfc3339()),
        ]);

        let body = ContainerCreateBody {
            image: Some(self.image.clone()),
            env: Some(self.env.clone()),
            labels: Some(labels),
            host_config: Some(HostConfig {
                network_mode: Some(NETWORK_MODE.to_string()),
                // Init process for proper signal handling inside the image.
                init: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };

        // No explicit name: the daemon assigns one, which avoids collisions
        // between concurrent machines for the same target.
        let options = CreateContainerOptionsBuilder::new().build();
        let created = timeout(
            REQUEST_TIMEOUT,
            self.docker.create_container(Some(options), body),
        )
        .await
        .map_err(|_| anyhow!("create container timed out"))?
        .context("Failed to create container")?;
        let id = created.id;

        if let Err(err) = timeout(
            REQUEST_TIMEOUT,
            self.docker.start_container(&id, None::<StartContainerOptions>),
        )
        .await
        .map_err(|_| anyhow!("start container timed out"))
        .and_then(|result| result.context("Failed to start container"))
        {
            // Do not leave the created container behind.
            self.roll_back(&id).await;
            return Err(err);
        }

        let addr = match &self.addr {
            Some(addr) => addr.clone(),
            None => match self.container_ip(&id).await {
                Ok(ip) => ip,
                Err(err) => {
                    self.roll_back(&id).await;
                    return Err(err);
                }
            },
        };

        info!(
            "Started container {} for target '{}'",
            &id[..12.min(id.len())],
            self.target
        );
        Ok(StartedContainer { id, addr })
    }

    /// Remove a container whose startup went wrong.
    ///
    /// Failures are logged like regular teardown failures so an aborted
    /// start never disappears without a trace.
    async fn roll_back(&self, id: &str) {
        if let Err(err) = self.remove_container(id).await {
            warn!(
                "Failed to remove container for target '{}' after startup failure: {:#}",
                self.target, err
            );
        }
    }

    /// Resolve the container's address on the network it was attached to.
    async fn container_ip(&self, id: &str) -> Result<String> {
        let info = timeout(
            REQUEST_TIMEOUT,
            self.docker.inspect_container(id, None::<InspectContainerOptions>),
        )
        .await
        .map_err(|_| anyhow!("inspect container timed out"))?
        .context("Failed to inspect container")?;

        let mut networks = info
            .network_settings
            .and_then(|settings| settings.networks)
            .unwrap_or_default();

        // The endpoint of the network we asked for is authoritative. Some
        // daemons report the address on a differently-named endpoint, so
        // fall back to any network that carries one.
        if let Some(ip) = networks
            .remove(NETWORK_MODE)
            .and_then(|endpoint| endpoint.ip_address)
            .filter(|ip| !ip.is_empty())
        {
            return Ok(ip);
        }
        networks
            .into_values()
            .filter_map(|endpoint| endpoint.ip_address)
            .find(|ip| !ip.is_empty())
            .ok_or_else(|| anyhow!("container reports no IP address"))
    }

    /// Dial the forwarded port at a fixed cadence until it accepts.
    ///
    /// A stop received while waiting cuts the probe short.
    async fn probe(&self, addr: &str, mach: &mut Machine) -> bool {
        let check_addr = format!("{}:{}", addr, self.check_port);
        for _ in 0..PROBE_ATTEMPTS {
            let attempt_started = Instant::now();
            if let Ok(Ok(_)) = timeout(PROBE_INTERVAL, TcpStream::connect(&check_addr)).await {
                info!("Connectivity test succeeded for target '{}'", self.target);
                return true;
            }
            tokio::select! {
                _ = mach.stop.recv() => return false,
                _ = sleep_until(attempt_started + PROBE_INTERVAL) => {}
            }
        }
        warn!(
            "Connectivity test failed for target '{}' on {}",
            self.target, check_addr
        );
        false
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let stop_options = StopContainerOptionsBuilder::new().t(10).build();
        match timeout(
            REQUEST_TIMEOUT,
            self.docker.stop_container(id, Some(stop_options)),
        )
        .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            })) => {
                // Already gone; nothing left to remove.
                return Ok(());
            }
            Ok(Err(err)) => return Err(err).context("Failed to stop container"),
            Err(_) => return Err(anyhow!("stop container timed out")),
        }

        let remove_options = RemoveContainerOptionsBuilder::new().force(true).v(true).build();
        match timeout(
            REQUEST_TIMEOUT,
            self.docker.remove_container(id, Some(remove_options)),
        )
        .await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            })) => Ok(()),
            Ok(Err(err)) => Err(err).context("Failed to remove container"),
            Err(_) => Err(anyhow!("remove container timed out")),
        }
    }
}
