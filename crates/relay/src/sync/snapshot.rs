// Debounced durable snapshots of live grids.
//
// Every registered document gets one flush worker. The grid observer nudges
// the worker on each mutation; the worker waits for a quiet period with no
// further mutations and then rewrites the document's cells from the grid in
// one store transaction. Workers are independent, so a failing document
// never delays another.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info_span, warn, Instrument};
use yrs::Subscription;

use crate::store::{CellOp, CellStore, CellWrite};
use crate::sync::grid::{read_matrix, TableGrid};
use crate::sync::session::SharedAwareness;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushSignal {
    Changed,
    Shutdown,
}

struct FlushEntry {
    signals: mpsc::UnboundedSender<FlushSignal>,
    worker: JoinHandle<()>,
    // Held for its drop: releasing it detaches the grid observer.
    subscription: Subscription,
}

/// Owns the per-document flush workers.
pub struct SnapshotWriter {
    store: CellStore,
    quiet_period: Duration,
    entries: Mutex<HashMap<String, FlushEntry>>,
}

impl SnapshotWriter {
    pub fn new(store: CellStore, quiet_period: Duration) -> Self {
        Self { store, quiet_period, entries: Mutex::new(HashMap::new()) }
    }

    /// Start watching `doc_id`'s grid. A previous registration for the same
    /// document is torn down first.
    pub async fn register(&self, doc_id: &str, awareness: SharedAwareness) {
        if self.teardown(doc_id).await {
            warn!(doc_id = %doc_id, "replaced an existing flush registration");
        }

        let (signals, receiver) = mpsc::unbounded_channel();
        let subscription = {
            let awareness = awareness.lock().await;
            let observer_signals = signals.clone();
            TableGrid::new(awareness.doc()).subscribe_deep(move || {
                let _ = observer_signals.send(FlushSignal::Changed);
            })
        };

        let worker = tokio::spawn(
            run_flush_worker(
                doc_id.to_string(),
                awareness,
                self.store.clone(),
                self.quiet_period,
                receiver,
            )
            .instrument(info_span!("relay.sync.flush_worker", doc_id = %doc_id)),
        );

        self.entries
            .lock()
            .await
            .insert(doc_id.to_string(), FlushEntry { signals, worker, subscription });
    }

    #[cfg(test)]
    pub(crate) async fn is_registered(&self, doc_id: &str) -> bool {
        self.entries.lock().await.contains_key(doc_id)
    }

    /// Detach the observer, cancel the pending deadline, and run a final flush
    /// if the grid changed since the last successful one. Returns `false` when
    /// nothing was registered.
    pub async fn teardown(&self, doc_id: &str) -> bool {
        let Some(entry) = self.entries.lock().await.remove(doc_id) else {
            return false;
        };

        drop(entry.subscription);
        let _ = entry.signals.send(FlushSignal::Shutdown);
        if let Err(join_error) = entry.worker.await {
            error!(doc_id = %doc_id, error = %join_error, "flush worker terminated abnormally");
        }
        true
    }

    pub async fn teardown_all(&self) {
        let doc_ids = self.entries.lock().await.keys().cloned().collect::<Vec<_>>();
        for doc_id in doc_ids {
            self.teardown(&doc_id).await;
        }
    }
}

async fn run_flush_worker(
    doc_id: String,
    awareness: SharedAwareness,
    store: CellStore,
    quiet_period: Duration,
    mut signals: mpsc::UnboundedReceiver<FlushSignal>,
) {
    let mut deadline: Option<Instant> = None;
    let mut unflushed = false;

    loop {
        let signal = match deadline {
            Some(at) => tokio::select! {
                signal = signals.recv() => signal,
                () = sleep_until(at) => {
                    deadline = None;
                    unflushed = !flush_now(&doc_id, &awareness, &store).await;
                    continue;
                }
            },
            None => signals.recv().await,
        };

        match signal {
            Some(FlushSignal::Changed) => {
                unflushed = true;
                deadline = Some(Instant::now() + quiet_period);
            }
            Some(FlushSignal::Shutdown) | None => {
                if unflushed {
                    flush_now(&doc_id, &awareness, &store).await;
                }
                break;
            }
        }
    }
}

/// Flush the current grid. Failures are logged and reported as `false`; the
/// next mutation schedules another attempt.
async fn flush_now(doc_id: &str, awareness: &SharedAwareness, store: &CellStore) -> bool {
    let matrix = {
        let awareness = awareness.lock().await;
        read_matrix(awareness.doc())
    };

    match persist_snapshot(store, doc_id, &matrix).await {
        Ok(cells) => {
            debug!(doc_id = %doc_id, rows = matrix.len(), cells, "flushed grid snapshot");
            true
        }
        Err(error) => {
            error!(doc_id = %doc_id, error = ?error, "failed to flush grid snapshot");
            false
        }
    }
}

/// Statements that make the durable cells of a document equal `matrix`: one
/// upsert per cell followed by pruning of every position outside it.
pub fn snapshot_ops(matrix: &[Vec<String>]) -> Vec<CellOp> {
    let mut ops = Vec::new();
    let mut positions = Vec::new();

    for (row, cells) in matrix.iter().enumerate() {
        let Ok(row) = i32::try_from(row) else {
            break;
        };
        for (col, value) in cells.iter().enumerate() {
            let Ok(col) = i32::try_from(col) else {
                break;
            };
            ops.push(CellOp::Upsert(CellWrite::new(row, col, value.clone())));
            positions.push((row, col));
        }
    }

    ops.push(CellOp::RetainOnly(positions));
    ops
}

/// Replace the durable cells of `doc_id` with `matrix` atomically. Returns the
/// number of cells written.
pub async fn persist_snapshot(
    store: &CellStore,
    doc_id: &str,
    matrix: &[Vec<String>],
) -> Result<usize> {
    let ops = snapshot_ops(matrix);
    let cells = ops.len().saturating_sub(1);
    store.run_atomically(doc_id, ops).await?;
    Ok(cells)
}
