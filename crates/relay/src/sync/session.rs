// One live replicated document and the y-sync plumbing shared by its peers.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use anyhow::{Context, Result};
use tokio::sync::{broadcast, Mutex};
use tracing::debug;
use yrs::encoding::read::Cursor;
use yrs::sync::{Awareness, DefaultProtocol, Message, MessageReader, Protocol, SyncMessage};
use yrs::updates::decoder::{Decode, DecoderV1};
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, Transact, Update};

use crate::sync::grid::{read_matrix, TableGrid};

const UPDATE_BUFFER_SIZE: usize = 256;

/// Origin id used for edits made by the relay itself rather than a peer.
pub const SERVER_ORIGIN: u64 = 0;

pub type SharedAwareness = Arc<Mutex<Awareness>>;

pub struct DocumentSession {
    doc_id: String,
    awareness: SharedAwareness,
    updates_tx: broadcast::Sender<(u64, Vec<u8>)>,
    next_client_id: AtomicU64,
}

impl DocumentSession {
    pub fn new(doc_id: impl Into<String>, doc: Doc) -> Self {
        let (updates_tx, _) = broadcast::channel(UPDATE_BUFFER_SIZE);
        Self {
            doc_id: doc_id.into(),
            awareness: Arc::new(Mutex::new(Awareness::new(doc))),
            updates_tx,
            next_client_id: AtomicU64::new(SERVER_ORIGIN + 1),
        }
    }

    pub fn awareness(&self) -> SharedAwareness {
        Arc::clone(&self.awareness)
    }

    pub fn next_client_id(&self) -> u64 {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<(u64, Vec<u8>)> {
        self.updates_tx.subscribe()
    }

    pub async fn read_matrix(&self) -> Vec<Vec<String>> {
        let awareness = self.awareness.lock().await;
        read_matrix(awareness.doc())
    }

    /// Decode a y-sync frame from `client_id`, apply it, and fan document
    /// updates and presence changes out to the other peers. Returns the frames to send back.
    pub async fn process_incoming_binary(
        &self,
        client_id: u64,
        payload: &[u8],
    ) -> Result<Vec<Vec<u8>>> {
        let protocol = DefaultProtocol;
        let mut responses = Vec::new();
        let mut broadcast_updates = Vec::new();

        {
            let awareness = self.awareness.lock().await;
            let mut decoder = DecoderV1::new(Cursor::new(payload));
            let mut reader = MessageReader::new(&mut decoder);

            while let Some(next_message) = reader.next() {
                let message = next_message.context("failed to decode y-sync message")?;
                match message {
                    Message::Sync(SyncMessage::SyncStep1(state_vector)) => {
                        if let Some(response) = protocol
                            .handle_sync_step1(&awareness, state_vector)
                            .context("failed to process sync step 1")?
                        {
                            responses.push(response.encode_v1());
                        }

                        let server_sv = awareness.doc().transact().state_vector();
                        responses
                            .push(Message::Sync(SyncMessage::SyncStep1(server_sv)).encode_v1());
                    }
                    Message::Sync(SyncMessage::SyncStep2(update)) => {
                        let decoded = Update::decode_v1(&update)
                            .context("failed to decode sync step 2 update")?;
                        protocol
                            .handle_sync_step2(&awareness, decoded)
                            .context("failed to process sync step 2")?;
                        broadcast_updates
                            .push(Message::Sync(SyncMessage::Update(update)).encode_v1());
                    }
                    Message::Sync(SyncMessage::Update(update)) => {
                        let decoded = Update::decode_v1(&update)
                            .context("failed to decode incremental update")?;
                        protocol
                            .handle_update(&awareness, decoded)
                            .context("failed to process incremental update")?;
                        broadcast_updates
                            .push(Message::Sync(SyncMessage::Update(update)).encode_v1());
                    }
                    Message::Awareness(update) => {
                        let Some(summary) = awareness
                            .apply_update_summary(update)
                            .context("failed to apply awareness update")?
                        else {
                            continue;
                        };
                        let changed_clients = summary.all_changes();
                        if changed_clients.is_empty() {
                            continue;
                        }
                        let rebroadcast = awareness
                            .update_with_clients(changed_clients)
                            .context("failed to encode awareness rebroadcast")?;
                        broadcast_updates.push(Message::Awareness(rebroadcast).encode_v1());
                    }
                    other => {
                        if let Some(response) = protocol
                            .handle_message(&awareness, other)
                            .context("failed to process y-sync message")?
                        {
                            responses.push(response.encode_v1());
                        }
                    }
                }
            }
        }

        for update in broadcast_updates {
            let _ = self.updates_tx.send((client_id, update));
        }

        Ok(responses)
    }

    /// Set one cell from outside the replication channel, growing the grid as
    /// needed, and push the resulting update to every connected peer.
    pub async fn write_cell(&self, row: u32, col: u32, value: &str) -> Result<()> {
        let update = {
            let awareness = self.awareness.lock().await;
            let doc = awareness.doc();
            let grid = TableGrid::new(doc);
            let mut txn = doc.transact_mut();
            grid.ensure_shape(&mut txn, row.saturating_add(1), 0)?;
            grid.pad_row(&mut txn, row, col)?;
            grid.replace_cell_at(&mut txn, row, col, value)?;
            txn.encode_update_v1()
        };

        debug!(doc_id = %self.doc_id, row, col, "applied server-side cell write");
        let _ = self
            .updates_tx
            .send((SERVER_ORIGIN, Message::Sync(SyncMessage::Update(update)).encode_v1()));
        Ok(())
    }
}
