//! Async test helpers.

use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

/// How long [`settle`] waits for spawned tasks to drain.
pub const SETTLE_DELAY: Duration = Duration::from_millis(25);

/// Installs a `tracing` subscriber honouring `RUST_LOG`. Idempotent.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Lets dispatchers, forwarders and in-flight RPCs run to quiescence.
pub async fn settle() {
    tokio::time::sleep(SETTLE_DELAY).await;
}

/// Returns every event currently buffered in `rx`.
pub fn drain<E: Clone>(rx: &mut broadcast::Receiver<E>) -> Vec<E> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_tracing_is_idempotent() {
        init_tracing();
        init_tracing();
    }

    #[test]
    fn drain_collects_buffered_events() {
        let (tx, mut rx) = broadcast::channel(4);
        tx.send(1).unwrap();
        tx.send(2).unwrap();

        assert_eq!(drain(&mut rx), vec![1, 2]);
        assert!(drain(&mut rx).is_empty());
    }
}
