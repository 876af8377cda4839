//! Deletes the pieces of objects removed on chain, one block window per task.

use crate::error::{SpError, SpResult};
use crate::interfaces::{DeletedObject, MetadataDb, PieceStore};
use crate::manager::Manager;
use crate::piece::{ec_piece_key, segment_piece_key};
use crate::task::{Task, TaskKind};
use std::sync::Arc;
use strata_protocol::{ObjectId, RedundancyType};
use tracing::{debug, info, warn};

pub struct GcDriver {
    manager: Arc<Manager>,
    store: Arc<dyn PieceStore>,
    metadb: Arc<dyn MetadataDb>,
    operator_address: String,
}

impl GcDriver {
    pub fn new(
        manager: Arc<Manager>,
        store: Arc<dyn PieceStore>,
        metadb: Arc<dyn MetadataDb>,
        operator_address: impl Into<String>,
    ) -> Self {
        Self {
            manager,
            store,
            metadb,
            operator_address: operator_address.into(),
        }
    }

    /// Runs one gc-object window, recording progress in `task` as objects are
    /// cleaned. Stops early when the manager cancels the task.
    pub async fn run(&self, task: &mut Task) -> SpResult<()> {
        let TaskKind::GcObject(window) = &task.kind else {
            return Err(SpError::DanglingTaskPointer);
        };
        let (start, end) = (window.start_block, window.end_block);
        let resume = (window.current_block, window.last_deleted_object_id);
        let deleted = self.metadb.list_deleted_objects(start, end).await?;
        if deleted.end_block < end {
            return Err(SpError::InvalidParameters(format!(
                "metadata synced to block {} behind gc window end {end}",
                deleted.end_block
            )));
        }

        let mut cleaned = 0usize;
        for object in deleted.objects {
            let id = object.object_info.id;
            if resume.1 != ObjectId::default() && (object.delete_block, id) <= resume {
                continue;
            }
            self.delete_object(&object).await;
            cleaned += 1;
            if let TaskKind::GcObject(progress) = &mut task.kind {
                progress.current_block = object.delete_block;
                progress.last_deleted_object_id = id;
            }
            if self.manager.report_gc_object_progress(task) {
                info!(key = %task.key, object_id = %id, "Gc object task canceled, stopping");
                return Ok(());
            }
        }
        info!(start_block = start, end_block = end, cleaned, "Finished gc object window");
        Ok(())
    }

    /// Piece deletion is best effort; a missing piece is not an error.
    async fn delete_object(&self, object: &DeletedObject) {
        let info = &object.object_info;
        let segments = object.storage_params.segment_count(info.payload_size);
        let mut keys: Vec<String> = (0..segments).map(|seg| segment_piece_key(info.id, seg)).collect();
        if info.redundancy_type == RedundancyType::ErasureCode {
            for (idx, address) in info.secondary_sp_addresses.iter().enumerate() {
                if !address.eq_ignore_ascii_case(&self.operator_address) {
                    continue;
                }
                let Ok(idx) = u32::try_from(idx) else {
                    continue;
                };
                keys.extend((0..segments).map(|seg| ec_piece_key(info.id, idx, seg)));
            }
        }
        for key in &keys {
            if let Err(err) = self.store.delete_piece(key).await {
                warn!(key = %key, error = %err, "Failed to delete piece");
            }
        }
        debug!(object_id = %info.id, pieces = keys.len(), "Deleted object pieces");
    }
}
