use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::state::{FetchEvent, WindowConfig, WindowDelta, WindowState};

const ENABLE_LOGS: bool = false;

use crate::log_debug;

/// Window stage of a feed: folds fetch events into window deltas and forwards
/// them, in arrival order, to the tile cache.
pub async fn window_loop(
    mut events: mpsc::Receiver<FetchEvent>,
    deltas: mpsc::Sender<WindowDelta>,
    config: WindowConfig,
    cancel_token: CancellationToken,
) {
    let mut state = WindowState::new();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };

                let (next, delta) = state.advance(&event, &config);
                log_debug!(
                    "window pivot {} -> {} requests, {} pages in memory",
                    delta.pivot,
                    delta.requests.len(),
                    next.in_memory.len()
                );
                state = next;

                if deltas.send(delta).await.is_err() {
                    break;
                }
            }
            _ = cancel_token.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContentKind, Query};
    use crate::window::TileRequest;

    #[tokio::test]
    async fn forwards_one_delta_per_event_in_order() {
        let (event_tx, event_rx) = mpsc::channel(4);
        let (delta_tx, mut delta_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(window_loop(
            event_rx,
            delta_tx,
            WindowConfig::default(),
            cancel.clone(),
        ));

        let query = Query::new(ContentKind::Projects);
        event_tx.send(FetchEvent::Reset(query.clone())).await.unwrap();
        event_tx
            .send(FetchEvent::LoadMore(query.with_offset(6)))
            .await
            .unwrap();

        let first = delta_rx.recv().await.unwrap();
        assert!(first.reset);
        assert_eq!(first.requests[0], TileRequest::On(query.clone()));

        let second = delta_rx.recv().await.unwrap();
        assert!(!second.reset);
        assert_eq!(second.pivot.offset, 6);

        drop(event_tx);
        task.await.unwrap();
    }
}
