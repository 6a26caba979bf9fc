use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};

use super::directory::Peer;
use crate::raft::types::NodeId;
use crate::util::errors::{RaftError, Result};

/// One peer's outcome in a fan-out round
#[derive(Debug)]
pub struct PeerReply<T> {
    pub peer: Peer,
    pub result: Result<T>,
}

/// Start one call per peer. The calls run concurrently and each is bounded
/// by `rpc_timeout`; a timeout shows up as `RaftError::Timeout` for that
/// peer only. Replies are yielded in completion order, and dropping the
/// stream cancels whatever is still in flight.
pub fn fan_out<F, Fut, T>(
    peers: Vec<Peer>,
    rpc_timeout: Duration,
    call: F,
) -> FuturesUnordered<BoxFuture<'static, PeerReply<T>>>
where
    F: Fn(&Peer) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    peers
        .into_iter()
        .map(|peer| {
            let call = call(&peer);
            async move {
                let result = match tokio::time::timeout(rpc_timeout, call).await {
                    Ok(result) => result,
                    Err(_) => Err(RaftError::Timeout(peer.address())),
                };
                PeerReply { peer, result }
            }
            .boxed()
        })
        .collect()
}

/// Wait for every reply of a fan-out round, keyed by peer id
pub async fn collect<T>(
    mut replies: FuturesUnordered<BoxFuture<'static, PeerReply<T>>>,
) -> HashMap<NodeId, Result<T>> {
    let mut results = HashMap::with_capacity(replies.len());
    while let Some(reply) = replies.next().await {
        results.insert(reply.peer.id, reply.result);
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Server;
    use tokio::time::Instant;

    fn peers(n: u64) -> Vec<Peer> {
        (1..=n)
            .map(|id| Peer::new(id, Server::new("127.0.0.1", format!("{}", 7000 + id))))
            .collect()
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let replies = fan_out(peers(3), Duration::from_millis(200), |peer| {
            let id = peer.id;
            async move {
                if id == 2 {
                    Err(RaftError::NetworkError("connection refused".to_string()))
                } else {
                    Ok(id * 10)
                }
            }
        });

        let results = collect(replies).await;
        assert_eq!(results.len(), 3);
        assert_eq!(*results[&1].as_ref().unwrap(), 10);
        assert!(results[&2].is_err());
        assert_eq!(*results[&3].as_ref().unwrap(), 30);
    }

    #[tokio::test]
    async fn test_slow_peer_times_out_without_blocking_others() {
        let started = Instant::now();
        let mut replies = fan_out(peers(3), Duration::from_millis(50), |peer| {
            let id = peer.id;
            async move {
                if id == 3 {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
                Ok(id)
            }
        });

        let first = replies.next().await.unwrap();
        assert!(first.result.is_ok());

        let results = collect(replies).await;
        assert!(matches!(results[&3], Err(RaftError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_empty_peer_set() {
        let replies = fan_out(Vec::new(), Duration::from_millis(10), |_peer| async { Ok(()) });
        assert!(collect(replies).await.is_empty());
    }
}
