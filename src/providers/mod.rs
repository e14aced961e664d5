//! Provider contract between the manager and the concrete target types.
//!
//! A provider owns the full lifecycle of one kind of backing machine:
//! starting it, verifying connectivity, translating client-requested
//! addresses while it runs, and tearing it down again.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::config::Diagnostics;

pub mod docker;
pub mod forward;

/// A request to translate the client-supplied virtual address and port into
/// a dialable `host:port` TCP address.
///
/// Providers must not reply until the machine has passed its reachability
/// probe. Replying `None` (or dropping the sender) tells the requesting
/// channel that the machine is not available.
pub struct TranslateRequest {
    /// Address the SSH client asked for, passed through verbatim.
    pub addr: String,
    /// TCP port the SSH client asked for.
    pub port: u16,
    /// Where the translated address is sent.
    pub reply: oneshot::Sender<Option<String>>,
}

/// Control surface of one running machine, handed to the provider.
///
/// The manager and its channel tasks hold the sender halves. `mod_active`
/// carries signed activity deltas: +1 when a forwarded connection opens and
/// -1 when it closes. `stop` is a capacity-1 signal meaning "shut down now".
pub struct Machine {
    pub mod_active: mpsc::Receiver<i8>,
    pub translate: mpsc::Receiver<TranslateRequest>,
    pub stop: mpsc::Receiver<()>,
}

/// A configured target type.
///
/// Implementations encapsulate parsed `[[target]]` configuration and are
/// created by the factory registered for their type name.
#[async_trait]
pub trait Provider: Send + Sync + 'static {
    /// Whether concurrent connections to the same target share one machine.
    ///
    /// Called on the manager event loop, so it must not block.
    fn is_shared(&self) -> bool;

    /// Own the machine for its entire lifetime.
    ///
    /// Runs on a dedicated task, so it is free to block. The typical shape
    /// is: provision the backing resource, wait for connectivity, service
    /// the machine channels until activity ceases or a stop arrives, then
    /// tear the resource down. The machine must be stopped by the time this
    /// returns.
    async fn run_machine(&self, mach: Machine);
}

/// Builds a provider from the `[[target]]` fields left over after `addr`
/// and `type` are consumed. Problems are reported as diagnostics; warnings
/// may accompany a successfully built provider.
pub type Factory = fn(target: &str, options: &toml::Table) -> (Option<Arc<dyn Provider>>, Diagnostics);

/// The process-wide registry of provider factories by type name.
pub fn factories() -> &'static HashMap<&'static str, Factory> {
    static FACTORIES: OnceLock<HashMap<&'static str, Factory>> = OnceLock::new();
    FACTORIES.get_or_init(|| {
        let mut map = HashMap::new();
        register(&mut map, "forward", forward::new_provider as Factory);
        register(&mut map, "docker", docker::new_provider as Factory);
        map
    })
}

fn register(map: &mut HashMap<&'static str, Factory>, id: &'static str, factory: Factory) {
    if map.insert(id, factory).is_some() {
        panic!("provider type '{id}' registered twice");
    }
}

/// Service the machine channels for a machine reachable at `host`.
///
/// Translate requests are answered with `host:port`, keeping the port the
/// client asked for. Returns when a stop arrives, or when the activity
/// counter has stayed at zero for the linger duration. A zero linger makes
/// an idle machine exit immediately.
pub async fn message_loop(mach: &mut Machine, host: &str, linger: Duration) {
    // The first delta bootstraps the counter; a machine only exists because
    // a channel is already on its way to it.
    let Some(first) = mach.mod_active.recv().await else {
        return;
    };
    let mut active = i32::from(first);

    loop {
        while active > 0 {
            tokio::select! {
                delta = mach.mod_active.recv() => match delta {
                    Some(delta) => active += i32::from(delta),
                    None => return,
                },
                request = mach.translate.recv() => match request {
                    Some(request) => {
                        let addr = format!("{host}:{}", request.port);
                        let _ = request.reply.send(Some(addr));
                    }
                    None => return,
                },
                _ = mach.stop.recv() => return,
            }
        }

        // Idle. Give new connections a chance to arrive before giving up;
        // a stop still wins over the linger timer.
        tokio::select! {
            delta = mach.mod_active.recv() => match delta {
                Some(delta) => active += i32::from(delta),
                None => return,
            },
            _ = mach.stop.recv() => return,
            _ = tokio::time::sleep(linger) => return,
        }
    }
}
