use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use nodelease::{
    CoordinationStore, IdGenerator, NodeAssignment, NodeLeaseAllocator, RenewalTask, StoreError,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cli::{Cli, Commands};
use crate::config::DaemonConfig;
use crate::server::{self, HealthState};
use crate::store::{self, UnreachableStore};

/// A process that holds a node id and can mint TSIDs with it.
#[derive(Debug)]
pub struct Node {
    pub allocator: Arc<NodeLeaseAllocator>,
    pub assignment: NodeAssignment,
    pub generator: Arc<IdGenerator>,
}

/// Resolve the configured store into something the allocator can use.
///
/// An unreachable store is not fatal here: the allocator sees the failure on
/// its first claim and applies the degraded-mode policy.
async fn coordination_store(config: &DaemonConfig) -> Result<Option<Arc<dyn CoordinationStore>>> {
    match store::connect(config.store.endpoint.as_deref()).await {
        Ok(store) => Ok(store),
        Err(StoreError::Unreachable(reason)) => {
            warn!("Coordination store unreachable at startup: {reason}");
            Ok(Some(Arc::new(UnreachableStore::new(reason))))
        }
        Err(e) => Err(e).context("Failed to set up coordination store"),
    }
}

/// Acquire a node id and install it into a fresh [`IdGenerator`].
pub async fn bootstrap(config: &DaemonConfig) -> Result<Node> {
    let allocator = match coordination_store(config).await? {
        Some(store) => NodeLeaseAllocator::new(config.lease.clone(), store)?,
        None => NodeLeaseAllocator::without_store(config.lease.clone())?,
    };
    let allocator = Arc::new(allocator);

    let assignment = allocator
        .acquire()
        .await
        .context("TSID node allocation failed")?;

    let generator = Arc::new(IdGenerator::new());
    generator.install(&assignment)?;

    Ok(Node {
        allocator,
        assignment,
        generator,
    })
}

/// Keep the lease alive and serve `/health` until `shutdown` fires.
///
/// The lease is not released on the way out; it lapses after its TTL.
pub async fn serve(node: Node, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
    let renewal = RenewalTask::new(node.allocator.clone(), node.assignment.clone())
        .spawn(shutdown.child_token());

    let state = HealthState {
        allocator: node.allocator.clone(),
        generator: node.generator.clone(),
    };
    let served = server::serve(listener, state, shutdown.child_token()).await;

    // The server may have stopped on its own; make sure renewal follows
    shutdown.cancel();
    renewal.shutdown().await;

    match &node.assignment.lease_key {
        Some(key) => info!("Stopped; lease {key} left to expire"),
        None => info!("Stopped"),
    }
    served.context("Health endpoint failed")
}

async fn run(config: DaemonConfig, listen: SocketAddr) -> Result<()> {
    let node = bootstrap(&config).await?;
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind health endpoint on {listen}"))?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal.cancel();
    });

    serve(node, listener, shutdown).await
}

/// Resolves on Ctrl-C, or on SIGTERM where there is one.
async fn wait_for_shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Unable to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Unable to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => info!("Received interrupt, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}

async fn generate(config: DaemonConfig, count: usize, numeric: bool) -> Result<()> {
    // A one-shot lease in a shared store would hold a slot for a whole TTL
    if !store::is_process_local(config.store.endpoint.as_deref()) {
        bail!(
            "`generate` only runs against memory:// or without a store (--allow-degraded); \
             a lease in a shared store would stay taken for {}s after this command exits",
            config.lease.ttl_secs
        );
    }
    let node = bootstrap(&config).await?;
    for _ in 0..count {
        let id = node.generator.next_id()?;
        if numeric {
            println!("{}", id.as_u64());
        } else {
            println!("{id}");
        }
    }
    Ok(())
}

async fn slots(config: DaemonConfig) -> Result<()> {
    let store = store::connect(config.store.endpoint.as_deref())
        .await
        .context("Failed to connect to coordination store")?
        .context("No coordination store configured; pass --store or set store.endpoint")?;

    let mut held = 0;
    for slot in 0..config.lease.max_node {
        let key = config.lease.key_for(slot);
        let Some(holder) = store.get(&key).await? else {
            continue;
        };
        held += 1;
        match store.ttl(&key).await? {
            Some(ttl) if ttl != std::time::Duration::MAX => {
                println!("{slot:>4}  {holder}  expires in {}s", ttl.as_secs());
            }
            Some(_) => println!("{slot:>4}  {holder}  no expiry"),
            // Lapsed between the two reads
            None => held -= 1,
        }
    }
    println!("{held}/{} slots leased", config.lease.max_node);
    Ok(())
}

/// Entry point behind `main`: load configuration and dispatch the subcommand.
pub async fn execute(cli: Cli) -> Result<()> {
    let mut config = DaemonConfig::load(cli.config.as_deref())?;
    config.apply_cli(&cli);

    match cli.command {
        Commands::Run { listen } => {
            let listen = listen.unwrap_or(config.health.listen);
            run(config, listen).await
        }
        Commands::Generate { count, numeric } => generate(config, count, numeric).await,
        Commands::Slots => slots(config).await,
    }
}
