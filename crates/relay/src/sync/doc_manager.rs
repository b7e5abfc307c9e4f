use std::collections::{hash_map::Entry, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};
use yrs::Doc;

use crate::store::{CellStore, CellWrite};
use crate::sync::hydrate::{hydrate_if_empty, HydrationOutcome};
use crate::sync::session::DocumentSession;
use crate::sync::snapshot::SnapshotWriter;

enum Slot {
    Open { session: Arc<DocumentSession>, subscribers: usize },
    /// A store write is in flight for a document with no live session: its
    /// final flush, or a direct cell write. Flips to `true` once the slot is
    /// gone.
    Settling(watch::Receiver<bool>),
}

/// Registry of live documents keyed by document id.
///
/// A document is loaded (and hydrated) on its first subscriber and torn down
/// after its last one leaves. Anyone arriving while the document is settling
/// waits for the store write to land first, so a fresh load always reflects
/// it and a final flush can never overwrite a later cell write.
pub struct DocManager {
    slots: RwLock<HashMap<String, Slot>>,
    store: CellStore,
    writer: SnapshotWriter,
}

impl DocManager {
    pub fn new(store: CellStore, flush_quiet_period: Duration) -> Self {
        let writer = SnapshotWriter::new(store.clone(), flush_quiet_period);
        Self { slots: RwLock::new(HashMap::new()), store, writer }
    }

    /// Attach one subscriber to `doc_id`, loading the document if needed.
    pub async fn subscribe(&self, doc_id: &str) -> Arc<DocumentSession> {
        loop {
            if let Some(session) = self.join_open(doc_id).await {
                return session;
            }

            let doc = Doc::new();
            match hydrate_if_empty(&self.store, doc_id, &doc).await {
                Ok(HydrationOutcome::Hydrated { rows, cols, cells }) => {
                    info!(doc_id = %doc_id, rows, cols, cells, "hydrated document from store");
                }
                Ok(HydrationOutcome::AlreadyPopulated) => {}
                Err(error) => {
                    warn!(doc_id = %doc_id, error = %error, "hydration failed; opening document without durable state");
                }
            }

            let mut slots = self.slots.write().await;
            match slots.entry(doc_id.to_string()) {
                Entry::Occupied(mut occupied) => match occupied.get_mut() {
                    Slot::Open { session, subscribers } => {
                        *subscribers += 1;
                        return Arc::clone(session);
                    }
                    // A store write started while we were hydrating; reload after it.
                    Slot::Settling(_) => continue,
                },
                Entry::Vacant(vacant) => {
                    let session = Arc::new(DocumentSession::new(doc_id, doc));
                    self.writer.register(doc_id, session.awareness()).await;
                    vacant.insert(Slot::Open { session: Arc::clone(&session), subscribers: 1 });
                    debug!(doc_id = %doc_id, "document session opened");
                    return session;
                }
            }
        }
    }

    /// Join an already open session, waiting out any store write in progress.
    /// Returns `None` when the document has to be loaded.
    async fn join_open(&self, doc_id: &str) -> Option<Arc<DocumentSession>> {
        loop {
            let settling = {
                let mut slots = self.slots.write().await;
                match slots.get_mut(doc_id) {
                    Some(Slot::Open { session, subscribers }) => {
                        *subscribers += 1;
                        return Some(Arc::clone(session));
                    }
                    Some(Slot::Settling(settled)) => settled.clone(),
                    None => return None,
                }
            };
            self.wait_settled(doc_id, settling).await;
        }
    }

    async fn wait_settled(&self, doc_id: &str, mut settling: watch::Receiver<bool>) {
        if settling.wait_for(|settled| *settled).await.is_err() {
            // The writer went away without finishing; drop its stale slot.
            let mut slots = self.slots.write().await;
            if matches!(slots.get(doc_id), Some(Slot::Settling(rx)) if rx.same_channel(&settling))
            {
                slots.remove(doc_id);
            }
        }
    }

    async fn finish_settling(&self, doc_id: &str, settled: watch::Sender<bool>) {
        {
            let mut slots = self.slots.write().await;
            if matches!(slots.get(doc_id), Some(Slot::Settling(_))) {
                slots.remove(doc_id);
            }
        }
        let _ = settled.send(true);
    }

    /// Detach one subscriber. The last one out flushes and unloads the
    /// document. Returns `false` when the document was not open.
    pub async fn unsubscribe(&self, doc_id: &str) -> bool {
        let settled = {
            let mut slots = self.slots.write().await;
            let Some(Slot::Open { subscribers, .. }) = slots.get_mut(doc_id) else {
                return false;
            };
            *subscribers = subscribers.saturating_sub(1);
            if *subscribers > 0 {
                return true;
            }

            let (settled, settling) = watch::channel(false);
            slots.insert(doc_id.to_string(), Slot::Settling(settling));
            settled
        };

        self.writer.teardown(doc_id).await;
        self.finish_settling(doc_id, settled).await;
        debug!(doc_id = %doc_id, "document session closed");
        true
    }

    /// Set one cell of `doc_id` from outside the replication channel.
    ///
    /// An open document takes the write in its live grid and persists it with
    /// the next flush. Otherwise the cell goes straight to the store while new
    /// subscribers are held back, so hydration sees it.
    pub async fn write_cell(&self, doc_id: &str, row: u32, col: u32, value: &str) -> Result<()> {
        let cell = CellWrite::new(
            i32::try_from(row).context("row index out of range")?,
            i32::try_from(col).context("column index out of range")?,
            value,
        );

        loop {
            let settling = {
                let mut slots = self.slots.write().await;
                match slots.get(doc_id) {
                    // Applied under the registry lock so a concurrent last
                    // unsubscribe cannot flush before the edit lands.
                    Some(Slot::Open { session, .. }) => {
                        return session.write_cell(row, col, value).await;
                    }
                    Some(Slot::Settling(settled)) => settled.clone(),
                    None => {
                        let (settled, settling) = watch::channel(false);
                        slots.insert(doc_id.to_string(), Slot::Settling(settling));
                        drop(slots);

                        let written = self.store.upsert_cell(doc_id, cell).await;
                        self.finish_settling(doc_id, settled).await;
                        return written;
                    }
                }
            };
            self.wait_settled(doc_id, settling).await;
        }
    }

    /// The live session for `doc_id`, if one is open. Does not subscribe.
    pub async fn session(&self, doc_id: &str) -> Option<Arc<DocumentSession>> {
        match self.slots.read().await.get(doc_id) {
            Some(Slot::Open { session, .. }) => Some(Arc::clone(session)),
            _ => None,
        }
    }

    #[cfg(test)]
    pub(crate) async fn subscriber_count(&self, doc_id: &str) -> usize {
        match self.slots.read().await.get(doc_id) {
            Some(Slot::Open { subscribers, .. }) => *subscribers,
            _ => 0,
        }
    }

    #[cfg(test)]
    pub(crate) async fn open_documents(&self) -> usize {
        self.slots.read().await.len()
    }

    /// Tear down every open document regardless of subscribers and wait for
    /// every final flush, including ones already under way. Used on shutdown.
    pub async fn close_all(&self) {
        let open = {
            let mut slots = self.slots.write().await;
            let mut open = Vec::new();
            for (doc_id, slot) in slots.iter_mut() {
                if let Slot::Open { subscribers, .. } = slot {
                    *subscribers = 1;
                    open.push(doc_id.clone());
                }
            }
            open
        };

        if !open.is_empty() {
            info!(documents = open.len(), "closing open documents");
        }
        for doc_id in open {
            self.unsubscribe(&doc_id).await;
        }

        // Teardowns started elsewhere, or racing the ones above.
        let settling = {
            let slots = self.slots.read().await;
            slots
                .iter()
                .filter_map(|(doc_id, slot)| match slot {
                    Slot::Settling(settled) => Some((doc_id.clone(), settled.clone())),
                    Slot::Open { .. } => None,
                })
                .collect::<Vec<_>>()
        };
        for (doc_id, settled) in settling {
            self.wait_settled(&doc_id, settled).await;
        }
        self.writer.teardown_all().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use gridsync_common::types::NewDocument;
    use tokio::task::JoinHandle;

    use super::DocManager;
    use crate::store::{CellStore, CellWrite};
    use crate::sync::session::DocumentSession;

    const QUIET: Duration = Duration::from_millis(250);

    async fn manager_with(cells: &[(i32, i32, &str)]) -> (Arc<DocManager>, CellStore) {
        let store = CellStore::memory();
        store
            .create_document_with_id(
                "t1",
                &NewDocument { rows: Some(2), cols: Some(2), ..NewDocument::default() },
            )
            .await
            .expect("document should be created");
        for (row, col, value) in cells {
            store.upsert_cell("t1", CellWrite::new(*row, *col, *value)).await.expect("seed cell");
        }
        (Arc::new(DocManager::new(store.clone(), QUIET)), store)
    }

    async fn durable(store: &CellStore) -> Vec<(i32, i32, String)> {
        store
            .list_cells("t1")
            .await
            .expect("list should succeed")
            .into_iter()
            .map(|cell| (cell.row_index, cell.col_index, cell.value))
            .collect()
    }

    #[tokio::test]
    async fn subscribers_share_one_session() {
        let (manager, _) = manager_with(&[(0, 0, "x")]).await;

        let first = manager.subscribe("t1").await;
        let second = manager.subscribe("t1").await;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.subscriber_count("t1").await, 2);
        assert_eq!(first.read_matrix().await, vec![vec!["x", ""], vec!["", ""]]);
    }

    #[tokio::test]
    async fn concurrent_first_subscribers_end_up_on_one_session() {
        let (manager, _) = manager_with(&[(0, 0, "x"), (1, 1, "y")]).await;

        let (left, right) = tokio::join!(manager.subscribe("t1"), manager.subscribe("t1"));

        assert!(Arc::ptr_eq(&left, &right));
        assert_eq!(left.read_matrix().await.len(), 2);
        assert_eq!(manager.subscriber_count("t1").await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn edit_then_last_unsubscribe_persists_and_reload_sees_it() {
        let (manager, store) = manager_with(&[(0, 0, "x"), (1, 1, "y")]).await;

        let session = manager.subscribe("t1").await;
        session.write_cell(0, 1, "z").await.expect("write should apply");
        tokio::time::sleep(QUIET * 2).await;
        assert_eq!(
            durable(&store).await,
            vec![
                (0, 0, "x".to_string()),
                (0, 1, "z".to_string()),
                (1, 0, String::new()),
                (1, 1, "y".to_string()),
            ]
        );

        assert!(manager.unsubscribe("t1").await);
        assert_eq!(manager.open_documents().await, 0);

        let reopened = manager.subscribe("t1").await;
        assert!(!Arc::ptr_eq(&session, &reopened));
        assert_eq!(reopened.read_matrix().await, vec![vec!["x", "z"], vec!["", "y"]]);
    }

    #[tokio::test(start_paused = true)]
    async fn last_unsubscribe_flushes_before_quiet_period_ends() {
        let (manager, store) = manager_with(&[]).await;

        let session = manager.subscribe("t1").await;
        session.write_cell(0, 0, "late").await.expect("write should apply");
        manager.unsubscribe("t1").await;

        assert!(durable(&store).await.contains(&(0, 0, "late".to_string())));
    }

    #[tokio::test]
    async fn unsubscribe_keeps_session_while_others_remain() {
        let (manager, _) = manager_with(&[]).await;
        manager.subscribe("t1").await;
        manager.subscribe("t1").await;

        assert!(manager.unsubscribe("t1").await);
        assert!(manager.session("t1").await.is_some());
        assert!(manager.unsubscribe("t1").await);
        assert!(manager.session("t1").await.is_none());
        assert!(!manager.unsubscribe("t1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn close_all_flushes_every_open_document() {
        let (manager, store) = manager_with(&[]).await;
        let session = manager.subscribe("t1").await;
        manager.subscribe("t1").await;
        session.write_cell(0, 0, "bye").await.expect("write should apply");

        manager.close_all().await;

        assert_eq!(manager.open_documents().await, 0);
        assert!(durable(&store).await.contains(&(0, 0, "bye".to_string())));
    }

    /// Park the grid lock so the next final flush cannot finish, then start
    /// the last unsubscribe and wait until the document is settling.
    async fn stall_teardown(
        manager: &Arc<DocManager>,
        session: &DocumentSession,
    ) -> (tokio::sync::OwnedMutexGuard<yrs::sync::Awareness>, JoinHandle<bool>) {
        let held = session.awareness().lock_owned().await;
        let closing = tokio::spawn({
            let manager = Arc::clone(manager);
            async move { manager.unsubscribe("t1").await }
        });
        while manager.session("t1").await.is_some() {
            tokio::task::yield_now().await;
        }
        (held, closing)
    }

    #[tokio::test]
    async fn cell_write_during_final_flush_survives_it() {
        let (manager, store) = manager_with(&[]).await;
        let session = manager.subscribe("t1").await;
        session.write_cell(0, 0, "live").await.expect("write should apply");

        let (held, closing) = stall_teardown(&manager, &session).await;
        let writing = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.write_cell("t1", 5, 5, "far").await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!writing.is_finished());
        assert!(durable(&store).await.is_empty());

        drop(held);
        assert!(closing.await.expect("unsubscribe should not panic"));
        writing.await.expect("write should not panic").expect("write should land");

        let cells = durable(&store).await;
        assert!(cells.contains(&(0, 0, "live".to_string())));
        assert!(cells.contains(&(5, 5, "far".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn cell_write_reaches_live_grid_or_store() {
        let (manager, store) = manager_with(&[]).await;

        manager.write_cell("t1", 1, 0, "cold").await.expect("store write");
        assert_eq!(durable(&store).await, vec![(1, 0, "cold".to_string())]);
        assert_eq!(manager.open_documents().await, 0);

        let session = manager.subscribe("t1").await;
        manager.write_cell("t1", 0, 1, "warm").await.expect("live write");
        assert_eq!(session.read_matrix().await, vec![vec!["", "warm"], vec!["cold", ""]]);
        assert_eq!(durable(&store).await, vec![(1, 0, "cold".to_string())]);
    }

    #[tokio::test]
    async fn close_all_waits_for_teardown_already_running() {
        let (manager, store) = manager_with(&[]).await;
        let session = manager.subscribe("t1").await;
        session.write_cell(0, 0, "bye").await.expect("write should apply");

        let (held, closing) = stall_teardown(&manager, &session).await;
        let shutdown = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.close_all().await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!shutdown.is_finished());

        drop(held);
        shutdown.await.expect("close_all should not panic");
        assert!(durable(&store).await.contains(&(0, 0, "bye".to_string())));
        assert!(closing.await.expect("unsubscribe should not panic"));
    }
}
