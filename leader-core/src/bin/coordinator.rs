//! Leader coordinator demo
//!
//! Starts several coordinators against one in-process election, submits a
//! cluster-singleton job from every node, and hands leadership over at a
//! fixed interval by resigning and re-joining the current leader.

use leader_core::{Coordinator, CoordinatorConfig, LeaderError, MemoryBackend};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting leader coordinator demo");

    let config = CoordinatorConfig::from_env()?;
    let node_count: usize = env_or("LEADER_NODES", 3);
    let round_interval = Duration::from_millis(env_or("LEADER_ROUND_INTERVAL_MS", 1000));
    let handover_interval = Duration::from_secs(env_or("LEADER_HANDOVER_SECS", 10));

    let backend = MemoryBackend::new();
    let mut coordinators = Vec::with_capacity(node_count);
    for _ in 0..node_count {
        let coordinator = Arc::new(Coordinator::new(config.clone())?);
        coordinator.initialize(&backend).await?;
        coordinators.push(coordinator);
    }

    let shutdown = CancellationToken::new();
    let rounds = Arc::new(AtomicU64::new(0));

    // Every node submits the same job; only the leader runs it.
    for coordinator in &coordinators {
        let coordinator = coordinator.clone();
        let rounds = rounds.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let rounds = rounds.clone();
                let submitted = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    result = coordinator.run(move |token: CancellationToken| async move {
                        tokio::select! {
                            _ = token.cancelled() => Err(LeaderError::Cancelled),
                            _ = tokio::time::sleep(Duration::from_millis(100)) => {
                                let round = rounds.fetch_add(1, Ordering::SeqCst) + 1;
                                info!("Maintenance round {} complete", round);
                                Ok(())
                            }
                        }
                    }) => result,
                };

                match submitted {
                    Ok(()) => {}
                    Err(LeaderError::NotInitialized) | Err(LeaderError::ShuttingDown) => {}
                    Err(e) if e.is_cancelled() => warn!("Round cancelled by leadership change"),
                    Err(e) => error!("Round failed: {}", e),
                }

                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(round_interval) => {}
                }
            }
        });
    }

    // Periodically move leadership to the next node in line.
    let handover = {
        let coordinators = coordinators.clone();
        let backend = backend.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(handover_interval) => {}
                }

                for coordinator in &coordinators {
                    if !coordinator.is_leader().await {
                        continue;
                    }
                    info!("Handing over leadership");
                    if let Err(e) = coordinator.resign().await {
                        warn!("Resign failed: {}", e);
                    }
                    if let Err(e) = coordinator.initialize(&backend).await {
                        error!("Failed to rejoin election: {}", e);
                    }
                    break;
                }
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    shutdown.cancel();
    let _ = handover.await;

    for coordinator in &coordinators {
        if let Ok(status) = coordinator.status().await {
            info!(
                "Node {} performed {} rounds",
                status.node_name, status.work_performed
            );
        }
        if let Err(e) = coordinator.resign().await {
            warn!("Resign failed: {}", e);
        }
    }

    info!("Completed {} rounds", rounds.load(Ordering::SeqCst));
    Ok(())
}
