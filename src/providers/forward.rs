//! Static forward targets.
//!
//! A degenerate provider with no backing resource: every connection is
//! forwarded to a fixed host, and the shared machine never stops until the
//! server shuts down. It exists so static forwards go through the same
//! dispatch path as real machines.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::Diagnostics;

use super::{Machine, Provider};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TargetOptions {
    /// Host connections are forwarded to.
    to: String,
}

pub struct ForwardProvider {
    to: String,
}

pub fn new_provider(target: &str, options: &toml::Table) -> (Option<Arc<dyn Provider>>, Diagnostics) {
    let mut diags = Diagnostics::new();
    match options.clone().try_into::<TargetOptions>() {
        Ok(parsed) => (Some(Arc::new(ForwardProvider { to: parsed.to })), diags),
        Err(err) => {
            diags.error(
                "Invalid forward target",
                format!("Target '{target}': {err}"),
            );
            (None, diags)
        }
    }
}

#[async_trait]
impl Provider for ForwardProvider {
    fn is_shared(&self) -> bool {
        true
    }

    async fn run_machine(&self, mut mach: Machine) {
        // Nothing to start or probe; answer translations until told to quit.
        loop {
            tokio::select! {
                delta = mach.mod_active.recv() => {
                    if delta.is_none() {
                        return;
                    }
                }
                request = mach.translate.recv() => match request {
                    Some(request) => {
                        let addr = format!("{}:{}", self.to, request.port);
                        let _ = request.reply.send(Some(addr));
                    }
                    None => return,
                },
                _ = mach.stop.recv() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_target_options() {
        let mut options = toml::Table::new();
        options.insert("to".into(), toml::Value::String("192.0.2.10".into()));

        let (provider, diags) = new_provider("fixed", &options);
        assert!(!diags.has_errors());
        assert!(provider.unwrap().is_shared());
    }

    #[test]
    fn rejects_unknown_fields() {
        let mut options = toml::Table::new();
        options.insert("to".into(), toml::Value::String("192.0.2.10".into()));
        options.insert("linger".into(), toml::Value::String("5s".into()));

        let (provider, diags) = new_provider("fixed", &options);
        assert!(provider.is_none());
        assert!(diags.has_errors());
    }
}
