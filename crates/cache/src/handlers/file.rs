//! Filesystem handler: objects are copied into a shared directory and
//! located by absolute path.

use super::{ExternalObjectHandler, FILE_HANDLER};
use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use strata_core::ObjectId;
use strata_storage::{ObjectStore, ObjectStoreExt};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub struct FileHandler {
    dir: PathBuf,
}

impl FileHandler {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    async fn absolute_dir(&self) -> CacheResult<PathBuf> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| transport(format!("creating {}: {e}", self.dir.display())))?;
        fs::canonicalize(&self.dir)
            .await
            .map_err(|e| transport(format!("resolving {}: {e}", self.dir.display())))
    }
}

fn transport(message: impl ToString) -> CacheError {
    CacheError::transport(FILE_HANDLER, message)
}

#[async_trait]
impl ExternalObjectHandler for FileHandler {
    async fn upload_objects(
        &self,
        ids: &[ObjectId],
        source: &dyn ObjectStore,
    ) -> CacheResult<Vec<String>> {
        let dir = self.absolute_dir().await?;
        let mut urls = Vec::with_capacity(ids.len());

        for id in ids {
            let data = source
                .get_object(id)
                .await
                .map_err(|e| transport(format!("reading {id}: {e}")))?;

            let path = dir.join(id.as_str());
            let temp_path = dir.join(format!(".{id}.tmp.{}", Uuid::new_v4()));
            let write = async {
                let mut file = fs::File::create(&temp_path).await?;
                file.write_all(&data).await?;
                file.sync_all().await?;
                fs::rename(&temp_path, &path).await
            };
            if let Err(e) = write.await {
                let _ = fs::remove_file(&temp_path).await;
                return Err(transport(format!("writing {}: {e}", path.display())));
            }

            tracing::debug!(object_id = %id, path = %path.display(), "Uploaded object to file");
            urls.push(path.to_string_lossy().into_owned());
        }

        Ok(urls)
    }

    async fn download_objects(
        &self,
        objects: &[(ObjectId, String)],
        target: &dyn ObjectStore,
    ) -> CacheResult<()> {
        for (id, url) in objects {
            let data = fs::read(url)
                .await
                .map_err(|e| transport(format!("reading {url}: {e}")))?;
            target.put_object(id, Bytes::from(data)).await?;
            tracing::debug!(object_id = %id, path = %url, "Downloaded object from file");
        }
        Ok(())
    }
}
