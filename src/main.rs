use std::sync::Arc;

use anyhow::{anyhow, Context};
use raftnode::{
    cluster::ClusterDirectory,
    config::Config,
    network::{serve, TcpTransport},
    raft::{types::NodeId, RaftNode},
    storage::{FileLogStorage, FileStateStorage},
    util::RaftError,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args: Vec<String> = std::env::args().collect();
    let config_path = parse_arg(&args, "--config", "RAFTNODE_CONFIG")
        .ok_or_else(|| anyhow!("missing --config=PATH (or RAFTNODE_CONFIG)"))?;
    let node_id: NodeId = parse_arg(&args, "--id", "RAFTNODE_ID")
        .ok_or_else(|| anyhow!("missing --id=N (or RAFTNODE_ID)"))?
        .parse()
        .context("node id must be an unsigned integer")?;

    let config = Config::load(&config_path)
        .and_then(|config| config.with_node_id(node_id))
        .with_context(|| format!("loading {}", config_path))?;

    let local = config
        .local_server()
        .cloned()
        .ok_or_else(|| anyhow!("node {} has no server entry", node_id))?;

    tracing::info!(
        node_id,
        address = %local.address(),
        peers = config.servers.len() - 1,
        "Starting raft node"
    );

    let data_dir = config.raft.data_dir.join(format!("node-{}", node_id));
    let log_storage = FileLogStorage::new(data_dir.clone()).context("opening log storage")?;
    let state_storage = FileStateStorage::new(data_dir).context("opening state storage")?;

    let cluster = Arc::new(ClusterDirectory::from_peers(config.peers()));
    let (node, mut applied) = RaftNode::new(
        config.raft.clone(),
        cluster,
        Arc::new(TcpTransport::new()),
        Box::new(log_storage),
        Box::new(state_storage),
    )?;
    let node = Arc::new(node);
    let shutdown = node.shutdown_token();

    let listener = TcpListener::bind(local.address())
        .await
        .with_context(|| format!("binding {}", local.address()))?;
    let server = tokio::spawn(serve(listener, node.clone(), shutdown.clone()));

    let driver = {
        let node = node.clone();
        tokio::spawn(async move { node.run().await })
    };

    tokio::spawn(async move {
        while let Some(entry) = applied.recv().await {
            tracing::info!(
                index = entry.index,
                term = entry.entry.term,
                data = %String::from_utf8_lossy(&entry.entry.data),
                "Applied entry"
            );
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl-C, shutting down");
                break;
            }
            line = lines.next_line() => {
                match line? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => match node.submit(line.into_bytes()).await {
                        Ok(index) => tracing::info!(index, "Submitted command"),
                        Err(RaftError::NotLeader(leader)) => {
                            tracing::warn!(leader = ?leader, "Not the leader, command dropped")
                        }
                        Err(e) => tracing::error!(error = %e, "Submit failed"),
                    },
                    // Stdin closed; keep serving until interrupted
                    None => {
                        tokio::signal::ctrl_c().await?;
                        break;
                    }
                }
            }
        }
    }

    node.shutdown();
    driver.await?;
    server.await??;
    Ok(())
}

/// `--name=value` from the command line, falling back to an environment
/// variable
fn parse_arg(args: &[String], name: &str, env: &str) -> Option<String> {
    let prefix = format!("{}=", name);
    args.iter()
        .find_map(|arg| arg.strip_prefix(&prefix).map(str::to_string))
        .or_else(|| std::env::var(env).ok())
}
