//! Standalone gateway-core runner: loads configuration, wires a
//! backend per enabled chain, and spawns the listener and confirmation
//! tracker tasks.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use whiteflag_gateway_core::backend::{BackendStatus, BitcoinBackend, ChainBackend};
use whiteflag_gateway_core::confirmation::ConfirmationTracker;
use whiteflag_gateway_core::config::GatewayConfig;
use whiteflag_gateway_core::events::EventSinks;
use whiteflag_gateway_core::listener::BlockListener;
use whiteflag_gateway_core::logging;
use whiteflag_gateway_core::rpc::{RpcClient, RpcClientConfig, RpcTransport};
use whiteflag_gateway_core::state::InMemoryChainStateStore;

#[derive(Parser, Debug)]
#[command(name = "gatewayd", about = "Whiteflag protocol gateway core engine")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(long, default_value = "gateway.toml")]
    config: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = GatewayConfig::load(&args.config)?;

    logging::init(config.log_level.as_deref().unwrap_or("info"));

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(config))
}

async fn run(config: GatewayConfig) -> anyhow::Result<()> {
    let store: Arc<dyn whiteflag_gateway_core::state::ChainStateStore> =
        Arc::new(InMemoryChainStateStore::new());

    let (receive_tx, mut receive_rx) = tokio::sync::mpsc::channel(256);
    let (processed_tx, processed_rx) = tokio::sync::mpsc::channel(256);
    let (updated_tx, mut updated_rx) = tokio::sync::mpsc::channel(256);
    let events = EventSinks {
        receive: receive_tx,
        processed: processed_tx,
        updated: updated_tx,
    };

    let mut backends: HashMap<String, Arc<dyn ChainBackend>> = HashMap::new();
    let mut listener_handles = Vec::new();

    for chain in &config.chains {
        let rpc: Arc<dyn RpcTransport> = Arc::new(RpcClient::new(RpcClientConfig {
            protocol: chain.rpc.protocol.clone(),
            host: chain.rpc.host.clone(),
            port: chain.rpc.port,
            path: chain.rpc.path.clone(),
            username: chain.rpc.username.clone(),
            password: chain.rpc.password.clone(),
            timeout_ms: chain.rpc.timeout_ms,
        }));

        let status = if chain.enabled {
            BackendStatus::Enabled
        } else {
            BackendStatus::Disabled
        };

        let backend = Arc::new(BitcoinBackend::new(
            chain.name.clone(),
            chain.network,
            status,
            store.clone(),
            rpc.clone(),
            chain.transaction_fee,
            chain.trace_raw_transaction,
        ));

        if chain.create_account
            && store
                .get_chain(&chain.name, whiteflag_gateway_core::state::ChainParameters {
                    chain: whiteflag_gateway_core::state::model::NetworkKind::Regtest,
                    rpc_url: String::new(),
                })
                .accounts
                .is_empty()
        {
            match backend.account_manager().create(None) {
                Ok(account) => info!(chain = %chain.name, address = %account.address, "auto-created account"),
                Err(e) => error!(chain = %chain.name, error = %e, "failed to auto-create account"),
            }
        }

        if chain.enabled {
            let listener_config: whiteflag_gateway_core::listener::ListenerConfig =
                chain.listener.clone().into();
            let account_manager = Arc::new(whiteflag_gateway_core::account::AccountManager::new(
                chain.name.clone(),
                chain.network,
                store.clone(),
                rpc.clone(),
            ));
            let listener = BlockListener::new(
                chain.name.clone(),
                chain.network,
                listener_config,
                store.clone(),
                rpc.clone(),
                account_manager,
                events.clone(),
            );
            let chain_name = chain.name.clone();
            listener_handles.push(tokio::spawn(async move {
                if let Err(e) = listener.run().await {
                    error!(chain = %chain_name, error = %e, "listener exited");
                }
            }));
        }

        backends.insert(chain.name.clone(), backend);
    }

    let tracker = ConfirmationTracker::new(
        config.confirmation.clone().into(),
        store.clone(),
        backends.clone(),
        events.clone(),
    );
    let tracker_handle = tokio::spawn(async move { tracker.run(processed_rx).await });

    let drain_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(metaheader) = receive_rx.recv() => {
                    info!(tx = %metaheader.transaction_hash, "message received");
                }
                Some(update) = updated_rx.recv() => {
                    info!(tx = %update.transaction_hash, depth = update.block_depth, confirmed = update.confirmed, "message updated");
                }
                else => break,
            }
        }
    });

    let _dispatcher = whiteflag_gateway_core::dispatcher::Dispatcher::new(backends);

    tracker_handle.await?;
    for handle in listener_handles {
        handle.await?;
    }
    drain_handle.await?;

    Ok(())
}
