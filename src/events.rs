//! Event log drain shared by the coordinator and peer binaries.

use std::fmt::Debug;
use tokio::sync::broadcast::Receiver;
use tokio::sync::broadcast::error::RecvError;
use tracing::Level;

/// What a drained event stream delivered before it closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventLogSummary {
    pub logged: u64,
    pub missed: u64,
}

/// Logs every event until the sender side closes. Events dropped because the
/// receiver fell behind are counted and skipped.
pub async fn log_events<E: Debug + Clone>(
    mut events: Receiver<E>,
    label: &str,
    level: Level,
) -> EventLogSummary {
    let mut summary = EventLogSummary::default();
    loop {
        match events.recv().await {
            Ok(event) => {
                summary.logged += 1;
                if level == Level::INFO {
                    tracing::info!("{} event: {:?}", label, event);
                } else {
                    tracing::debug!("{} event: {:?}", label, event);
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                summary.missed += skipped;
                tracing::warn!("{} event log fell behind; {} event(s) skipped", label, skipped);
            }
            Err(RecvError::Closed) => return summary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast;

    #[tokio::test]
    async fn test_lagging_log_keeps_draining() {
        // ARRANGE: capacity 2, five events queued before the drain starts
        let (tx, rx) = broadcast::channel(2);
        for n in 0..5u32 {
            tx.send(n).unwrap();
        }
        drop(tx);

        // ACT
        let summary = log_events(rx, "Test", Level::DEBUG).await;

        // ASSERT
        assert_eq!(summary, EventLogSummary { logged: 2, missed: 3 });
    }
}
