//! Coordinator worker pool draining the bounded transition event queue.

use std::sync::Arc;

use crate::transit::ServerAddr;
use crate::utils::StripeKvError;

use async_trait::async_trait;

use futures::future;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Second half of a transition, run by a worker.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct StateTransitEvent {
    pub server: ServerAddr,

    /// `true` for the failure path, `false` for recovery.
    pub start: bool,

    /// Skip waiting for client acks.
    pub forced: bool,
}

#[async_trait]
pub(crate) trait EventHandler: Send + Sync + 'static {
    async fn handle_transit_event(
        &self,
        event: StateTransitEvent,
        rx_term: &mut watch::Receiver<bool>,
    );
}

/// Creates the bounded event queue.
pub(crate) fn event_queue(
    capacity: usize,
) -> (
    mpsc::Sender<StateTransitEvent>,
    mpsc::Receiver<StateTransitEvent>,
) {
    mpsc::channel(capacity.max(1))
}

/// Inserts all events, sleeping `retry` whenever the queue is full.
pub(crate) async fn insert_repeated_events(
    tx_event: &mpsc::Sender<StateTransitEvent>,
    events: Vec<StateTransitEvent>,
    retry: Duration,
) -> Result<(), StripeKvError> {
    for mut event in events {
        loop {
            match tx_event.try_send(event) {
                Ok(()) => break,
                Err(mpsc::error::TrySendError::Full(ev)) => {
                    pf_trace!("event queue full, retrying {:?}", ev);
                    event = ev;
                    time::sleep(retry).await;
                }
                Err(mpsc::error::TrySendError::Closed(ev)) => {
                    return logged_err!("event queue closed, dropped {:?}", ev);
                }
            }
        }
    }
    Ok(())
}

/// Pool of workers sharing one queue receiver.
pub(crate) struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `workers` worker tasks.
    pub(crate) fn spawn<H: EventHandler>(
        workers: usize,
        handler: Arc<H>,
        rx_event: mpsc::Receiver<StateTransitEvent>,
        rx_term: watch::Receiver<bool>,
    ) -> Self {
        let rx_event = Arc::new(Mutex::new(rx_event));
        let handles = (0..workers.max(1))
            .map(|id| {
                tokio::spawn(Self::worker_thread(
                    id,
                    handler.clone(),
                    rx_event.clone(),
                    rx_term.clone(),
                ))
            })
            .collect();
        WorkerPool { handles }
    }

    /// Waits for all workers to exit.
    pub(crate) async fn join(self) {
        for result in future::join_all(self.handles).await {
            if let Err(e) = result {
                pf_error!("worker join error: {}", e);
            }
        }
    }

    async fn worker_thread<H: EventHandler>(
        id: usize,
        handler: Arc<H>,
        rx_event: Arc<Mutex<mpsc::Receiver<StateTransitEvent>>>,
        mut rx_term: watch::Receiver<bool>,
    ) {
        pf_debug!("transit worker {} spawned", id);
        loop {
            let event = tokio::select! {
                event = async { rx_event.lock().await.recv().await } => event,
                _ = rx_term.changed() => break,
            };
            match event {
                Some(event) => {
                    pf_trace!("worker {} handling {:?}", id, event);
                    handler.handle_transit_event(event, &mut rx_term).await;
                }
                None => break,
            }
            if *rx_term.borrow() {
                break;
            }
        }
        pf_debug!("transit worker {} exitted", id);
    }
}
