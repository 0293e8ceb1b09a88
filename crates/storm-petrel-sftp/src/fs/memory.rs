//! In-memory object store
//!
//! Backing store for tests and for exercising the object backend without an
//! S3 endpoint. Implements the same contract as a real driver, including
//! multipart uploads that stay invisible until completed.

use super::object::{ObjectInfo, ObjectStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    uploads: Mutex<HashMap<String, HashMap<u32, Vec<u8>>>>,
    upload_seq: AtomicU64,
}

struct StoredObject {
    data: Vec<u8>,
    last_modified: u32,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw contents of an object, for assertions in tests.
    pub async fn contents(&self, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .await
            .get(key)
            .map(|o| o.data.clone())
    }

    /// Number of multipart uploads currently in flight.
    pub async fn pending_uploads(&self) -> usize {
        self.uploads.lock().await.len()
    }

    fn now() -> u32 {
        Utc::now().timestamp().max(0) as u32
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>> {
        Ok(self.objects.lock().await.get(key).map(|o| ObjectInfo {
            key: key.to_string(),
            size: o.data.len() as u64,
            last_modified: Some(o.last_modified),
        }))
    }

    async fn get_range(&self, key: &str, offset: u64, len: u64) -> Result<Vec<u8>> {
        let objects = self.objects.lock().await;
        let object = objects
            .get(key)
            .ok_or_else(|| Error::not_found(key))?;
        let start = (offset as usize).min(object.data.len());
        let end = (offset + len).min(object.data.len() as u64) as usize;
        Ok(object.data[start..end].to_vec())
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.objects.lock().await.insert(
            key.to_string(),
            StoredObject {
                data,
                last_modified: Self::now(),
            },
        );
        Ok(())
    }

    async fn create_multipart(&self, _key: &str) -> Result<String> {
        let id = format!("upload-{}", self.upload_seq.fetch_add(1, Ordering::Relaxed));
        self.uploads.lock().await.insert(id.clone(), HashMap::new());
        Ok(id)
    }

    async fn upload_part(
        &self,
        _key: &str,
        upload_id: &str,
        part_number: u32,
        data: Vec<u8>,
    ) -> Result<String> {
        let mut uploads = self.uploads.lock().await;
        let parts = uploads
            .get_mut(upload_id)
            .ok_or_else(|| Error::Storage(format!("unknown upload id {:?}", upload_id)))?;
        parts.insert(part_number, data);
        Ok(format!("etag-{}", part_number))
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<(u32, String)>,
    ) -> Result<()> {
        let staged = self
            .uploads
            .lock()
            .await
            .remove(upload_id)
            .ok_or_else(|| Error::Storage(format!("unknown upload id {:?}", upload_id)))?;

        let mut data = Vec::new();
        for (number, _etag) in parts {
            let part = staged
                .get(&number)
                .ok_or_else(|| Error::Storage(format!("missing part {}", number)))?;
            data.extend_from_slice(part);
        }
        self.put(key, data).await
    }

    async fn abort_multipart(&self, _key: &str, upload_id: &str) -> Result<()> {
        self.uploads.lock().await.remove(upload_id);
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let data = {
            let objects = self.objects.lock().await;
            objects
                .get(from)
                .map(|o| o.data.clone())
                .ok_or_else(|| Error::not_found(from))?
        };
        self.put(to, data).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects
            .lock()
            .await
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(key))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        Ok(self
            .objects
            .lock()
            .await
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, o)| ObjectInfo {
                key: key.clone(),
                size: o.data.len() as u64,
                last_modified: Some(o.last_modified),
            })
            .collect())
    }
}
