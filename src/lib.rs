pub mod config;
pub mod downstream;
pub mod logging;
pub mod plugins;
pub mod protocol;
pub mod registry;
pub mod server;

use std::future::Future;
use std::sync::Arc;

use config::RouterConfig;
use downstream::DownstreamManager;
use plugins::builtin::{loader_tools, router_tools};
use plugins::{DynamicLoader, PluginCatalog};
use registry::{CapabilityKind, Registry};
use server::{RouterServer, ServerError};

/// The assembled router: registry, downstream manager and plugin loader
/// sharing one capability table.
pub struct Router {
    registry: Arc<Registry>,
    downstream: Arc<DownstreamManager>,
    loader: Arc<DynamicLoader>,
}

impl Router {
    /// Build the components and register the built-in management tools.
    /// Nothing is loaded or connected yet.
    pub fn new(config: &RouterConfig) -> Self {
        let registry = Arc::new(Registry::new());
        let downstream = Arc::new(DownstreamManager::new(
            Arc::clone(&registry),
            config.downstream.clone(),
        ));
        let loader = Arc::new(DynamicLoader::new(
            Arc::clone(&registry),
            Arc::clone(&downstream),
            PluginCatalog::builtin(),
            &config.plugins,
        ));

        registry.register_all(router_tools(&registry, &downstream).into_values());
        registry.register_all(loader_tools(&loader).into_values());

        Self {
            registry,
            downstream,
            loader,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn downstream(&self) -> &Arc<DownstreamManager> {
        &self.downstream
    }

    pub fn loader(&self) -> &Arc<DynamicLoader> {
        &self.loader
    }

    /// Initial plugin load plus the downstreams named in the config.
    ///
    /// Individual failures are logged and skipped; the router still starts.
    pub async fn start(&self, config: &RouterConfig) {
        self.loader.load_components();

        for (name, command) in &config.local {
            if let Err(e) = self.downstream.connect_local(name, command).await {
                tracing::error!(downstream = %name, error = %e, "configured local downstream failed");
            }
        }
        for (name, service) in &config.services {
            if let Err(e) = self
                .downstream
                .connect_service(name, &service.host, service.port)
                .await
            {
                tracing::error!(downstream = %name, error = %e, "configured service failed");
            }
        }

        tracing::info!(
            tools = self.registry.list(CapabilityKind::Tool).len(),
            resources = self.registry.list(CapabilityKind::Resource).len(),
            agents = self.registry.list(CapabilityKind::Agent).len(),
            "router ready"
        );
    }

    /// Disconnect every downstream. Containers are removed.
    pub async fn shutdown(&self) {
        self.downstream.disconnect_all().await;
    }
}

/// Run the router until `shutdown` resolves.
///
/// Only a bind failure is fatal. Downstreams are disconnected before
/// returning, whether serving ended normally or not.
pub async fn run(config: RouterConfig, shutdown: impl Future<Output = ()>) -> Result<(), ServerError> {
    let bind_addr = config.bind_addr();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %bind_addr,
        tools_dir = %config.plugins.tools_dir.display(),
        resources_dir = %config.plugins.resources_dir.display(),
        agents_dir = %config.plugins.agents_dir.display(),
        pid = std::process::id(),
        "=== caprouter starting ==="
    );

    let router = Router::new(&config);
    router.start(&config).await;

    let server = match RouterServer::bind(&bind_addr, Arc::clone(router.registry())).await {
        Ok(server) => server,
        Err(e) => {
            router.shutdown().await;
            return Err(e);
        }
    };

    let watcher = config
        .plugins
        .hot_reload
        .then(|| router.loader().watch(config.plugins.reload_interval()));

    let served = server.serve_until(shutdown).await;

    if let Some(watcher) = watcher {
        watcher.abort();
    }
    router.shutdown().await;
    tracing::info!("=== caprouter stopped ===");
    served
}
