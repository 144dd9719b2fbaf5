//! Background probes that keep `Backend::is_healthy` current.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::context::Request;
use crate::expr::Scheme;
use crate::pipeline::Fetch;
use crate::registry::{Backend, ProbeConfig, Registry};

/// The last `window` probe results for one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthWindow {
    window: usize,
    threshold: usize,
    results: VecDeque<bool>,
}

impl HealthWindow {
    /// Starts with `initial` successes already recorded.
    pub fn new(probe: &ProbeConfig) -> Self {
        let window = probe.window.max(1) as usize;
        let mut results = VecDeque::with_capacity(window);
        results.extend(std::iter::repeat(true).take((probe.initial as usize).min(window)));
        Self {
            window,
            threshold: probe.threshold as usize,
            results,
        }
    }

    /// Records one probe result and returns the resulting health.
    pub fn record(&mut self, ok: bool) -> bool {
        if self.results.len() == self.window {
            self.results.pop_front();
        }
        self.results.push_back(ok);
        self.is_healthy()
    }

    pub fn successes(&self) -> usize {
        self.results.iter().filter(|ok| **ok).count()
    }

    pub fn is_healthy(&self) -> bool {
        self.successes() >= self.threshold
    }
}

/// The request a probe sends.
pub fn probe_request(probe: &ProbeConfig) -> Request {
    let mut request = Request {
        method: probe.request.method.to_string(),
        url: probe.request.path.clone(),
        proto: match probe.request.scheme {
            Scheme::Http10 => "HTTP/1.0",
            Scheme::Http11 => "HTTP/1.1",
        }
        .to_string(),
        ..Request::default()
    };
    for (name, value) in &probe.request.headers {
        request.headers.add(name, value.as_str());
    }
    request
}

/// Sends one probe. Any failure, or a status other than the expected one,
/// counts as unhealthy.
pub async fn check(fetcher: &dyn Fetch, backend: Arc<Backend>, probe: &ProbeConfig) -> bool {
    let request = probe_request(probe);
    match tokio::time::timeout(probe.timeout, fetcher.fetch(backend, request)).await {
        Ok(Ok(response)) => response.status == probe.expected_response,
        _ => false,
    }
}

pub struct HealthChecker {
    registry: Arc<Registry>,
    fetcher: Arc<dyn Fetch>,
}

impl HealthChecker {
    pub fn new(registry: Arc<Registry>, fetcher: Arc<dyn Fetch>) -> Self {
        Self { registry, fetcher }
    }

    /// Starts one task per probed backend, then keeps watching the registry:
    /// a probe attached later starts a task of its own and replaces any task
    /// already running for that backend. Everything stops once `shutdown`
    /// turns true.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let fetcher = Arc::clone(&self.fetcher);
        let mut added = registry.watch_probes();
        let mut shutdown_rx = shutdown.clone();

        tokio::spawn(async move {
            let mut tasks: HashMap<String, JoinHandle<()>> = HashMap::new();
            let start = |name: &str, tasks: &mut HashMap<String, JoinHandle<()>>| {
                let probe = match registry.get_backend(name).and_then(|b| b.probe.clone()) {
                    Some(probe) => probe,
                    None => return,
                };
                let task = tokio::spawn(run_probe(
                    Arc::clone(&registry),
                    Arc::clone(&fetcher),
                    name.to_string(),
                    probe,
                    shutdown.clone(),
                ));
                if let Some(previous) = tasks.insert(name.to_string(), task) {
                    previous.abort();
                }
            };

            for backend in registry.backends() {
                start(&backend.name, &mut tasks);
            }
            eprintln!("started {} health probe(s)", tasks.len());

            loop {
                tokio::select! {
                    name = added.recv() => match name {
                        Some(name) => start(&name, &mut tasks),
                        None => break,
                    },
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            for (_, task) in tasks {
                task.abort();
            }
        })
    }
}

async fn run_probe(
    registry: Arc<Registry>,
    fetcher: Arc<dyn Fetch>,
    name: String,
    probe: ProbeConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut window = HealthWindow::new(&probe);
    registry.set_healthy(&name, window.is_healthy());
    let mut interval = tokio::time::interval(probe.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
                continue;
            }
        }

        let backend = match registry.get_backend(&name) {
            Some(backend) => backend,
            None => return,
        };
        let was_healthy = backend.is_healthy();
        let ok = check(fetcher.as_ref(), backend, &probe).await;
        let healthy = window.record(ok);
        registry.set_healthy(&name, healthy);
        if healthy != was_healthy {
            eprintln!(
                "backend {} is now {} ({}/{} probes ok)",
                name,
                if healthy { "healthy" } else { "sick" },
                window.successes(),
                probe.window
            );
        }
    }
}
