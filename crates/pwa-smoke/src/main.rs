//! PWA Smoke Harness
//!
//! Drives the offline cache agent against a live origin: registers it,
//! replays a list of GET requests through the host container and prints a
//! JSON summary of where each response came from.
//!
//! ```bash
//! pwa-smoke --scope http://localhost:8000/ --request smart_home_app.html \
//!     --request /unknown.png --snapshot caches.json --perf-output perf.json
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use pwa_common::{init_logging, LogConfig, LogFormat};
use pwa_net::{LoaderConfig, Request, ResourceLoader};
use pwa_sw::{
    AgentConfig, CacheStorage, Client, ClientMatchOptions, Clients, OfflineCacheAgent,
    ServiceWorkerContainer, ServiceWorkerEvent,
};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Timing collector for tracking operation durations.
#[derive(Default)]
struct PerfTiming {
    timings: HashMap<&'static str, Vec<Duration>>,
}

impl PerfTiming {
    fn record(&mut self, operation: &'static str, duration: Duration) {
        self.timings.entry(operation).or_default().push(duration);
    }

    fn summary(&self) -> serde_json::Value {
        let mut summary = serde_json::Map::new();

        for (op, durations) in &self.timings {
            if durations.is_empty() {
                continue;
            }

            let count = durations.len();
            let millis: Vec<f64> = durations.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
            let total_ms: f64 = millis.iter().sum();
            let min_ms = millis.iter().copied().fold(f64::INFINITY, f64::min);
            let max_ms = millis.iter().copied().fold(f64::NEG_INFINITY, f64::max);

            summary.insert(
                op.to_string(),
                json!({
                    "count": count,
                    "total_ms": round2(total_ms),
                    "avg_ms": round2(total_ms / count as f64),
                    "min_ms": round2(min_ms),
                    "max_ms": round2(max_ms),
                }),
            );
        }

        serde_json::Value::Object(summary)
    }
}

fn round2(ms: f64) -> f64 {
    (ms * 100.0).round() / 100.0
}

/// Parse command line arguments
#[derive(Debug, Default)]
struct Args {
    config: Option<String>,
    scope: Option<String>,
    requests: Vec<String>,
    snapshot: Option<String>,
    perf_output: Option<String>,
    log_format: LogFormat,
    warnings: Vec<String>,
}

impl Args {
    fn parse() -> Self {
        Self::parse_from(std::env::args().skip(1))
    }

    fn parse_from(args: impl IntoIterator<Item = String>) -> Self {
        let mut parsed = Self::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => parsed.config = args.next(),
                "--scope" => parsed.scope = args.next(),
                "--request" => parsed.requests.extend(args.next()),
                "--snapshot" => parsed.snapshot = args.next(),
                "--perf-output" => parsed.perf_output = args.next(),
                "--log-format" => match args.next() {
                    Some(name) => match LogFormat::from_name(&name) {
                        Some(format) => parsed.log_format = format,
                        None => parsed
                            .warnings
                            .push(format!("ignoring unknown log format {}", name)),
                    },
                    None => parsed.warnings.push("--log-format needs a value".to_string()),
                },
                other => parsed
                    .warnings
                    .push(format!("ignoring unknown argument {}", other)),
            }
        }

        parsed
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    for warning in &args.warnings {
        eprintln!("Warning: {}", warning);
    }
    init_logging(LogConfig::default().with_format(args.log_format))?;

    let mut config = match args.config {
        Some(ref path) => AgentConfig::load(path)?,
        None => AgentConfig::default(),
    };
    if let Some(ref scope) = args.scope {
        config.scope = scope.clone();
    }
    config.validate()?;
    let scope = config.scope_url()?;
    info!(scope = %scope, cache = %config.cache_name, "Starting smoke run");

    let storage = match args.snapshot {
        Some(ref path) if std::path::Path::new(path).exists() => {
            CacheStorage::load(path).await?
        }
        _ => CacheStorage::new(),
    };
    let caches = storage.shared();
    let network = Arc::new(ResourceLoader::new(LoaderConfig::default())?);
    // One open page at the scope root, so activation has something to claim.
    let mut registry = Clients::new();
    registry.add(Client::window(scope.clone()));
    let clients = Arc::new(RwLock::new(registry));

    let requests = if args.requests.is_empty() {
        config.manifest.clone()
    } else {
        args.requests.clone()
    };

    let agent = Arc::new(OfflineCacheAgent::new(
        config.clone(),
        caches.clone(),
        network.clone(),
        clients.clone(),
    )?);
    let (container, mut events) = ServiceWorkerContainer::new(network, clients);
    let mut perf = PerfTiming::default();

    let started = Instant::now();
    let install = container.register(agent).await;
    perf.record("register", started.elapsed());
    if let Err(ref e) = install {
        error!(error = %e, "Registration failed");
    }
    let controlled = container
        .match_clients(&ClientMatchOptions::default())
        .await?;
    if controlled.is_empty() {
        warn!(scope = %scope, "No page is controlled");
    }

    let mut results = Vec::with_capacity(requests.len());
    for path in &requests {
        let url = scope
            .join(path)
            .with_context(|| format!("invalid request path {}", path))?;
        let started = Instant::now();
        let outcome = container.handle_fetch(Request::get(url.clone())).await;
        let elapsed = started.elapsed();

        let result = match outcome {
            Ok(response) => {
                let source = if response.from_cache { "cache" } else { "network" };
                let operation = if response.from_cache {
                    "fetch_cache"
                } else {
                    "fetch_network"
                };
                perf.record(operation, elapsed);
                json!({
                    "url": url.as_str(),
                    "status": response.status.as_u16(),
                    "status_text": response.status_text(),
                    "content_type": response.content_type().map(|m| m.to_string()),
                    "source": source,
                    "bytes": response.body.len(),
                })
            }
            Err(e) => {
                perf.record("fetch_failed", elapsed);
                json!({ "url": url.as_str(), "error": e.to_string() })
            }
        };
        results.push(result);
    }

    let mut event_counts: HashMap<&'static str, usize> = HashMap::new();
    while let Ok(event) = events.try_recv() {
        let kind = match event {
            ServiceWorkerEvent::StateChange { .. } => "state_change",
            ServiceWorkerEvent::UpdateFound { .. } => "update_found",
            ServiceWorkerEvent::CacheDeleted { .. } => "cache_deleted",
            ServiceWorkerEvent::ControllerChange { .. } => "controller_change",
        };
        *event_counts.entry(kind).or_default() += 1;
    }

    let summary = json!({
        "cache_name": config.cache_name,
        "installed": install.is_ok(),
        "install_error": install.as_ref().err().map(|e| e.to_string()),
        "controlled_clients": controlled.len(),
        "requests": results,
        "events": event_counts,
        "timings": perf.summary(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if let Some(ref path) = args.perf_output {
        std::fs::write(path, serde_json::to_string_pretty(&perf.summary())?)
            .with_context(|| format!("cannot write {}", path))?;
    }

    if let Some(ref path) = args.snapshot {
        caches.read().await.save(path).await?;
        info!(path = %path, "Cache storage snapshot written");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Args {
        Args::parse_from(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_parse_flags() {
        let parsed = args(&[
            "--scope",
            "http://localhost:8000/",
            "--request",
            "smart_home_app.html",
            "--request",
            "/unknown.png",
            "--log-format",
            "json",
        ]);

        assert_eq!(parsed.scope.as_deref(), Some("http://localhost:8000/"));
        assert_eq!(parsed.requests, vec!["smart_home_app.html", "/unknown.png"]);
        assert_eq!(parsed.log_format, LogFormat::Json);
        assert!(parsed.warnings.is_empty());
    }

    #[test]
    fn test_unknown_log_format_warns() {
        let parsed = args(&["--log-format", "loud"]);

        assert_eq!(parsed.log_format, LogFormat::default());
        assert_eq!(parsed.warnings, vec!["ignoring unknown log format loud"]);
    }

    #[test]
    fn test_unknown_argument_warns() {
        let parsed = args(&["--verbose", "--log-format"]);

        assert_eq!(parsed.warnings.len(), 2);
        assert!(parsed.warnings[0].contains("--verbose"));
    }
}
