//! Controller registration and lifecycle.

use std::sync::Arc;

use anyhow::Context;
use keel_core::{Gvk, Object, ObjectStore, Registry, Selector, StoreResult};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backoff::default_limiter;
use crate::config::ControllerConfig;
use crate::queue::WorkQueue;
use crate::watch::{Keys, Mapper, Multiplexer, Source, WatchSettings};
use crate::worker::run_worker;
use crate::Reconciler;

/// A primary kind, the secondary kinds that feed it, and its reconciler.
pub struct Controller {
    name: String,
    primary: Gvk,
    namespace: Option<String>,
    selector: Selector,
    owned: Vec<Gvk>,
    watches: Vec<Source>,
    reconciler: Arc<dyn Reconciler>,
    config: ControllerConfig,
}

impl Controller {
    pub fn new(name: &str, primary: Gvk, reconciler: impl Reconciler) -> Self {
        Self::with_reconciler(name, primary, Arc::new(reconciler))
    }

    pub fn with_reconciler(name: &str, primary: Gvk, reconciler: Arc<dyn Reconciler>) -> Self {
        Self {
            name: name.to_string(),
            primary,
            namespace: None,
            selector: Selector::everything(),
            owned: Vec::new(),
            watches: Vec::new(),
            reconciler,
            config: ControllerConfig::default(),
        }
    }

    /// Reconcile the controlling primary when an object of `gvk` changes.
    pub fn owns(mut self, gvk: Gvk) -> Self {
        self.owned.push(gvk);
        self
    }

    /// Watch `gvk` and route its events through `map`.
    pub fn watches<F>(self, gvk: Gvk, map: F) -> Self
    where
        F: Fn(&Object) -> Keys + Send + Sync + 'static,
    {
        self.watches_source(Source::new(gvk, Mapper::Custom(Arc::new(map))))
    }

    pub fn watches_source(mut self, source: Source) -> Self {
        self.watches.push(source);
        self
    }

    /// Restrict every source to one namespace.
    pub fn namespace(mut self, ns: &str) -> Self {
        self.namespace = Some(ns.to_string());
        self
    }

    /// Only primaries matching `selector`.
    pub fn selector(mut self, selector: Selector) -> Self {
        self.selector = selector;
        self
    }

    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(&self) -> &str { &self.name }

    /// Every kind the controller touches must be registered.
    pub fn validate(&self, registry: &Registry) -> StoreResult<()> {
        registry.resolve(&self.primary)?;
        for gvk in self.owned.iter().chain(self.watches.iter().map(|s| &s.gvk)) {
            registry.resolve(gvk)?;
        }
        Ok(())
    }

    fn sources(&self, registry: &Registry) -> StoreResult<Vec<Source>> {
        let primary = registry.resolve(&self.primary)?;
        let mut out = vec![Source {
            gvk: self.primary.clone(),
            namespace: self.namespace.clone().filter(|_| primary.namespaced),
            selector: self.selector.clone(),
            mapper: Mapper::Primary,
        }];
        for gvk in &self.owned {
            let mut s = Source::new(gvk.clone(), Mapper::ControllerOwner { owner: self.primary.clone(), namespaced: primary.namespaced });
            s.namespace = self.namespace.clone();
            out.push(s);
        }
        for w in &self.watches {
            let mut s = w.clone();
            if s.namespace.is_none() {
                s.namespace = self.namespace.clone();
            }
            out.push(s);
        }
        Ok(out)
    }

    /// Run until `shutdown` fires. Watches stop first, then the queue, then
    /// workers finish what they already hold.
    pub async fn run(self, store: Arc<dyn ObjectStore>, registry: &Registry, shutdown: CancellationToken) -> StoreResult<()> {
        self.validate(registry)?;
        let sources = self.sources(registry)?;
        let Controller { name, primary, reconciler, config, .. } = self;

        let limiter = default_limiter(config.backoff_base, config.backoff_max, config.qps, config.burst);
        let queue = Arc::new(WorkQueue::new(&name, Box::new(limiter)));
        let settings = WatchSettings {
            resync: config.resync,
            backoff_max: config.watch_backoff_max,
            failure_threshold: config.watch_failure_threshold,
        };
        info!(controller = %name, primary = %primary, sources = sources.len(), workers = config.workers, "controller starting");

        let watch_stop = shutdown.child_token();
        let muxes: Vec<JoinHandle<()>> = sources
            .into_iter()
            .map(|s| tokio::spawn(Multiplexer::new(&name, s, store.clone(), queue.clone(), settings.clone()).run(watch_stop.clone())))
            .collect();
        let label: Arc<str> = Arc::from(name.as_str());
        let workers: Vec<JoinHandle<()>> = (0..config.workers.max(1))
            .map(|i| tokio::spawn(run_worker(i, label.clone(), queue.clone(), reconciler.clone(), config.reconcile_timeout)))
            .collect();

        shutdown.cancelled().await;
        info!(controller = %name, queued = queue.len(), in_flight = queue.in_flight(), "controller stopping");
        watch_stop.cancel();
        for m in muxes {
            if let Err(e) = m.await {
                warn!(controller = %name, error = %e, "watch task failed");
            }
        }
        queue.shut_down();
        for w in workers {
            if let Err(e) = w.await {
                warn!(controller = %name, error = %e, "worker task failed");
            }
        }
        info!(controller = %name, "controller stopped");
        Ok(())
    }
}

/// Runs a set of controllers against one store and registry.
pub struct Manager {
    store: Arc<dyn ObjectStore>,
    registry: Arc<Registry>,
    controllers: Vec<Controller>,
}

impl Manager {
    pub fn new(store: Arc<dyn ObjectStore>, registry: Registry) -> Self {
        Self { store, registry: Arc::new(registry), controllers: Vec::new() }
    }

    pub fn add(mut self, controller: Controller) -> Self {
        self.controllers.push(controller);
        self
    }

    pub fn registry(&self) -> &Registry { &self.registry }

    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        for c in &self.controllers {
            c.validate(&self.registry).with_context(|| format!("controller {}", c.name()))?;
        }
        let mut handles = Vec::with_capacity(self.controllers.len());
        for c in self.controllers {
            let name = c.name().to_string();
            let store = self.store.clone();
            let registry = self.registry.clone();
            let sd = shutdown.clone();
            handles.push((name, tokio::spawn(async move { c.run(store, &registry, sd).await })));
        }
        for (name, h) in handles {
            h.await.with_context(|| format!("controller {} task", name))?.with_context(|| format!("controller {}", name))?;
        }
        Ok(())
    }
}
