//! Metadata store on sled trees. Values are bincode encoded.

use crate::error::{SpError, SpResult};
use crate::interfaces::{
    DeletedObject, DeletedObjects, JobRecord, JobState, MetadataDb, ObjectIntegrity,
};
use crate::task::now_secs;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::Tree;
use strata_protocol::{ObjectId, ObjectInfo, StorageParams, StorageProvider};
use tracing::debug;

const JOB_TREE: &str = "jobs";
const OBJECT_TREE: &str = "objects";
const INTEGRITY_TREE: &str = "integrity";
const SP_TREE: &str = "sps";
const DELETED_TREE: &str = "deleted";
const META_TREE: &str = "meta";
const STORAGE_PARAMS_KEY: &[u8] = b"storage_params";
const SYNCED_BLOCK_KEY: &[u8] = b"synced_block";

#[derive(Clone)]
pub struct SledMetadataDb {
    jobs: Tree,
    objects: Tree,
    integrity: Tree,
    sps: Tree,
    deleted: Tree,
    meta: Tree,
}

fn get<T: DeserializeOwned>(tree: &Tree, key: impl AsRef<[u8]>) -> SpResult<Option<T>> {
    match tree.get(key)? {
        Some(raw) => Ok(Some(bincode::deserialize(&raw)?)),
        None => Ok(None),
    }
}

fn put<T: Serialize>(tree: &Tree, key: impl AsRef<[u8]>, value: &T) -> SpResult<()> {
    tree.insert(key.as_ref(), bincode::serialize(value)?)?;
    Ok(())
}

fn integrity_key(object_id: ObjectId, replicate_idx: i32) -> Vec<u8> {
    let mut key = object_id.to_be_bytes().to_vec();
    key.extend_from_slice(&replicate_idx.to_be_bytes());
    key
}

fn deleted_key(block: u64, object_id: ObjectId) -> Vec<u8> {
    let mut key = block.to_be_bytes().to_vec();
    key.extend_from_slice(&object_id.to_be_bytes());
    key
}

impl SledMetadataDb {
    pub fn open(db: &sled::Db) -> SpResult<Self> {
        Ok(Self {
            jobs: db.open_tree(JOB_TREE)?,
            objects: db.open_tree(OBJECT_TREE)?,
            integrity: db.open_tree(INTEGRITY_TREE)?,
            sps: db.open_tree(SP_TREE)?,
            deleted: db.open_tree(DELETED_TREE)?,
            meta: db.open_tree(META_TREE)?,
        })
    }

    /// Records that `object` was deleted on chain at `block`.
    pub fn mark_object_deleted(&self, deleted: &DeletedObject) -> SpResult<()> {
        put(
            &self.deleted,
            deleted_key(deleted.delete_block, deleted.object_info.id),
            deleted,
        )
    }

    /// Highest block whose deletions are recorded.
    pub fn set_synced_block(&self, block: u64) -> SpResult<()> {
        put(&self.meta, SYNCED_BLOCK_KEY, &block)
    }

    pub fn synced_block(&self) -> SpResult<u64> {
        Ok(get(&self.meta, SYNCED_BLOCK_KEY)?.unwrap_or(0))
    }
}

#[async_trait]
impl MetadataDb for SledMetadataDb {
    async fn create_upload_job(&self, object: &ObjectInfo) -> SpResult<()> {
        let now = now_secs();
        let record = JobRecord {
            object_id: object.id,
            state: JobState::UploadObjectDoing,
            create_time: now,
            update_time: now,
        };
        put(&self.jobs, object.id.to_be_bytes(), &record)?;
        put(&self.objects, object.id.to_be_bytes(), object)
    }

    async fn update_job_state(&self, object_id: ObjectId, state: JobState) -> SpResult<()> {
        let key = object_id.to_be_bytes();
        let mut record: JobRecord = get(&self.jobs, key)?
            .ok_or_else(|| SpError::RecordNotFound(format!("job {object_id}")))?;
        record.state = state;
        record.update_time = now_secs();
        debug!(object_id = %object_id, state = state.as_str(), "Updated job state");
        put(&self.jobs, key, &record)
    }

    async fn get_job(&self, object_id: ObjectId) -> SpResult<JobRecord> {
        get(&self.jobs, object_id.to_be_bytes())?
            .ok_or_else(|| SpError::RecordNotFound(format!("job {object_id}")))
    }

    async fn set_object_info(&self, object: &ObjectInfo) -> SpResult<()> {
        put(&self.objects, object.id.to_be_bytes(), object)
    }

    async fn get_object_info(&self, object_id: ObjectId) -> SpResult<ObjectInfo> {
        get(&self.objects, object_id.to_be_bytes())?
            .ok_or_else(|| SpError::RecordNotFound(format!("object {object_id}")))
    }

    async fn set_object_integrity(&self, integrity: &ObjectIntegrity) -> SpResult<()> {
        put(
            &self.integrity,
            integrity_key(integrity.object_id, integrity.replicate_idx),
            integrity,
        )
    }

    async fn get_object_integrity(&self, object_id: ObjectId, replicate_idx: i32) -> SpResult<ObjectIntegrity> {
        get(&self.integrity, integrity_key(object_id, replicate_idx))?.ok_or_else(|| {
            SpError::RecordNotFound(format!("integrity {object_id}/{replicate_idx}"))
        })
    }

    async fn update_all_sp(&self, sps: &[StorageProvider]) -> SpResult<()> {
        self.sps.clear()?;
        for sp in sps {
            put(&self.sps, sp.operator_address.to_lowercase(), sp)?;
        }
        Ok(())
    }

    async fn get_sp_by_address(&self, operator_address: &str) -> SpResult<StorageProvider> {
        get(&self.sps, operator_address.to_lowercase())?
            .ok_or_else(|| SpError::RecordNotFound(format!("sp {operator_address}")))
    }

    async fn get_storage_params(&self) -> SpResult<StorageParams> {
        get(&self.meta, STORAGE_PARAMS_KEY)?
            .ok_or_else(|| SpError::RecordNotFound("storage params".into()))
    }

    async fn set_storage_params(&self, params: &StorageParams) -> SpResult<()> {
        put(&self.meta, STORAGE_PARAMS_KEY, params)
    }

    async fn list_deleted_objects(&self, start_block: u64, end_block: u64) -> SpResult<DeletedObjects> {
        let synced = self.synced_block()?;
        let upper = end_block.min(synced);
        let mut objects = Vec::new();
        if start_block <= upper {
            let from = deleted_key(start_block, ObjectId::default());
            let to = deleted_key(upper, ObjectId::from_be_bytes([0xff; 32]));
            for entry in self.deleted.range(from..=to) {
                let (_, raw) = entry?;
                objects.push(bincode::deserialize(&raw)?);
            }
        }
        Ok(DeletedObjects {
            objects,
            end_block: synced,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> SledMetadataDb {
        let db = sled::Config::new().temporary(true).open().expect("db");
        SledMetadataDb::open(&db).expect("metadb")
    }

    fn object(id: u64) -> ObjectInfo {
        ObjectInfo {
            id: ObjectId::from(id),
            bucket_name: "bucket".into(),
            object_name: format!("object-{id}"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn job_lifecycle() {
        let db = db();
        assert!(matches!(
            db.update_job_state(ObjectId::from(1), JobState::UploadObjectDone).await,
            Err(SpError::RecordNotFound(_))
        ));
        db.create_upload_job(&object(1)).await.expect("create");
        db.update_job_state(ObjectId::from(1), JobState::ReplicateObjectDoing)
            .await
            .expect("update");
        let job = db.get_job(ObjectId::from(1)).await.expect("job");
        assert_eq!(job.state, JobState::ReplicateObjectDoing);
        assert_eq!(
            db.get_object_info(ObjectId::from(1)).await.expect("object").object_name,
            "object-1"
        );
    }

    #[tokio::test]
    async fn sps_are_replaced_and_case_insensitive() {
        let db = db();
        let sp = |addr: &str| StorageProvider {
            operator_address: addr.into(),
            ..Default::default()
        };
        db.update_all_sp(&[sp("0xAB"), sp("0xcd")]).await.expect("update");
        assert!(db.get_sp_by_address("0xab").await.is_ok());
        db.update_all_sp(&[sp("0xcd")]).await.expect("update");
        assert!(db.get_sp_by_address("0xab").await.is_err());
        assert!(db.get_sp_by_address("0xCD").await.is_ok());
    }

    #[tokio::test]
    async fn deleted_objects_window_stops_at_synced_block() {
        let db = db();
        for (id, block) in [(1, 5), (2, 10), (3, 20)] {
            db.mark_object_deleted(&DeletedObject {
                object_info: object(id),
                storage_params: StorageParams::default(),
                delete_block: block,
            })
            .expect("mark");
        }
        db.set_synced_block(15).expect("sync");
        let listed = db.list_deleted_objects(1, 30).await.expect("list");
        assert_eq!(listed.end_block, 15);
        let ids: Vec<ObjectId> = listed.objects.iter().map(|o| o.object_info.id).collect();
        assert_eq!(ids, vec![ObjectId::from(1), ObjectId::from(2)]);

        let integrity = ObjectIntegrity {
            object_id: ObjectId::from(1),
            replicate_idx: 2,
            checksums: vec![vec![1]],
            integrity_hash: vec![2],
            signature: vec![3],
        };
        db.set_object_integrity(&integrity).await.expect("set");
        assert_eq!(
            db.get_object_integrity(ObjectId::from(1), 2).await.expect("get"),
            integrity
        );
        assert!(db.get_object_integrity(ObjectId::from(1), -1).await.is_err());
    }
}
