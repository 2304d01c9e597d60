#[macro_use]
extern crate log;

use anyhow::Context;
use kube::Client;
use opentelemetry::global;
use prometheus::Registry;
use prometheus_exporter::{meter_provider, start_prometheus_metrics_server};
use registry::KindRegistry;
use std::{collections::HashSet, net::SocketAddr, sync::Arc, time::Duration};
use store::{KubeStore, ObjectStore};

mod application_controller;
mod backoff;
mod controllers;
mod errors;
mod ownership;
mod prometheus_exporter;
mod registry;
mod status;
mod store;
mod synchronizer;
#[cfg(test)]
mod testing;
mod utils;

/// The K8s field manager name, also the value of the `app.kubernetes.io/managed-by` label.
const MANAGER: &'static str = "skiperator";

#[derive(Clone, Debug)]
struct Configuration {
    /// Namespaces to watch, `None` for all namespaces.
    watch_namespaces: Option<HashSet<String>>,
    /// Deadline of a single reconciliation.
    reconcile_timeout: Duration,
    /// Requeue delay after a successful reconciliation.
    resync_interval: Duration,
    backoff_initial: Duration,
    backoff_max: Duration,
    metrics_addr: SocketAddr,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            watch_namespaces: None,
            reconcile_timeout: Duration::from_secs(30),
            resync_interval: Duration::from_secs(3600),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
        }
    }
}

impl Configuration {
    pub fn from_env() -> anyhow::Result<Self> {
        fn normalize(hs: HashSet<String>) -> Option<HashSet<String>> {
            if hs.is_empty() || hs.contains("*") || hs.contains("") {
                None
            } else {
                Some(hs)
            }
        }
        let defaults = Self::default();
        let watch_namespaces: Option<HashSet<String>> = env_var("WATCH_NAMESPACES")
            .map(|v| normalize(v.split(",").map(|v| v.trim().to_string()).collect()))
            .flatten();
        if let Some(namespaces) = &watch_namespaces {
            let namespaces: Vec<&str> = namespaces.iter().map(|v| v.as_str()).collect();
            info!(
                "Controllers are watching Applications in namespaces: {}",
                namespaces.join(",")
            );
        } else {
            info!("Controllers are watching Applications in all namespaces");
        }
        let metrics_addr = env_var("METRICS_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0".to_string());
        let metrics_port = env_var("METRICS_LISTEN_PORT").unwrap_or_else(|| "9000".to_string());
        let metrics_addr = format!("{}:{}", metrics_addr, metrics_port)
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid metrics address {}:{}", metrics_addr, metrics_port))?;
        Ok(Configuration {
            watch_namespaces,
            reconcile_timeout: env_seconds("RECONCILE_TIMEOUT_SECONDS", defaults.reconcile_timeout)?,
            resync_interval: env_seconds("RESYNC_INTERVAL_SECONDS", defaults.resync_interval)?,
            backoff_initial: env_seconds("BACKOFF_INITIAL_SECONDS", defaults.backoff_initial)?,
            backoff_max: env_seconds("BACKOFF_MAX_SECONDS", defaults.backoff_max)?,
            metrics_addr,
        })
    }

    pub fn is_watched(&self, namespace: &str) -> bool {
        self.watch_namespaces
            .as_ref()
            .map_or(true, |v| v.contains(namespace))
    }

    /// The namespace to watch if exactly one is configured, so the watches can be
    /// namespaced instead of cluster wide.
    pub fn single_watch_namespace(&self) -> Option<&str> {
        let mut tmp = self.watch_namespaces.iter().flatten();
        if let (Some(ns), None) = (tmp.next(), tmp.next()) {
            Some(ns.as_str())
        } else {
            None
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_seconds(name: &str, default: Duration) -> anyhow::Result<Duration> {
    match env_var(name) {
        Some(v) => Ok(Duration::from_secs(v.parse::<u64>().with_context(|| {
            format!("{} must be a number of seconds, got {:?}", name, v)
        })?)),
        None => Ok(default),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let _ = rustls::crypto::ring::default_provider().install_default();
    let configuration = Configuration::from_env()?;

    let registry = Registry::new();
    global::set_meter_provider(meter_provider(&registry)?);
    let prometheus_metrics_exporter =
        start_prometheus_metrics_server(configuration.metrics_addr, registry);

    let client = Client::try_default().await?;
    let kinds = KindRegistry::new();
    let missing = kinds.verify(&client).await;
    if missing > 0 {
        warn!("{} of {} kinds are not served by the API server", missing, kinds.len());
    }
    let kinds = Arc::new(kinds);
    let store: Arc<dyn ObjectStore> = Arc::new(KubeStore::new(client.clone()));
    let controllers = controllers::start_all(&configuration, &kinds, &store, &client)?;
    info!("start controllers ...");
    tokio::select! {
       _ = futures::future::join_all(controllers) => (),
       r = prometheus_metrics_exporter => r?,
    };
    Ok(())
}
