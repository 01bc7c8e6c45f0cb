//! Moving objects between this cache, external locations and peer stores.

use crate::error::{CacheError, CacheResult};
use crate::manager::ObjectCacheManager;
use futures::{StreamExt, TryStreamExt, stream};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use strata_core::{ObjectId, ObjectLocation, ObjectMeta, PEER_HANDLER};
use strata_metadata::{MetadataStore, ObjectRepo};
use strata_metadata::repos::cache::sorted_unique;
use strata_storage::{ObjectStore, ObjectStoreExt};

/// Concurrent object copies per peer transfer.
const PEER_TRANSFER_CONCURRENCY: usize = 8;

/// Another metadata store and object store pair, such as an upstream
/// repository, that objects can be copied to or from directly.
#[derive(Clone)]
pub struct Remote {
    pub name: String,
    pub metadata: Arc<dyn MetadataStore>,
    pub objects: Arc<dyn ObjectStore>,
}

impl Remote {
    pub fn new(
        name: impl Into<String>,
        metadata: Arc<dyn MetadataStore>,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            name: name.into(),
            metadata,
            objects,
        }
    }
}

impl std::fmt::Debug for Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remote").field("name", &self.name).finish()
    }
}

impl ObjectCacheManager {
    /// Fetch objects that are not stored locally.
    ///
    /// Each object is taken from its first external location whose handler
    /// is registered. Objects without one are copied from `source`. Returns
    /// the ids that were transferred; ids that could not be found anywhere
    /// are simply absent from the result.
    pub async fn download_objects(
        &self,
        source: Option<&Remote>,
        ids: &[ObjectId],
        locations: &[ObjectLocation],
    ) -> CacheResult<Vec<ObjectId>> {
        let mut wanted = Vec::new();
        for id in sorted_unique(ids) {
            if !self.objects.has_object(&id).await? {
                wanted.push(id);
            }
        }
        if wanted.is_empty() {
            return Ok(Vec::new());
        }
        let wanted_set: HashSet<&ObjectId> = wanted.iter().collect();

        let mut by_handler: BTreeMap<&str, Vec<(ObjectId, String)>> = BTreeMap::new();
        let mut located: HashSet<&ObjectId> = HashSet::new();
        for location in locations {
            if !wanted_set.contains(&location.object_id) || located.contains(&location.object_id) {
                continue;
            }
            if !self.handlers.contains(&location.protocol) {
                tracing::debug!(
                    object_id = %location.object_id,
                    protocol = %location.protocol,
                    "No handler registered for location"
                );
                continue;
            }
            located.insert(&location.object_id);
            by_handler
                .entry(location.protocol.as_str())
                .or_default()
                .push((location.object_id.clone(), location.location.clone()));
        }

        let mut fetched = Vec::with_capacity(wanted.len());
        for (name, batch) in &by_handler {
            let handler = self.handlers.get(name)?;
            tracing::info!(handler = %name, count = batch.len(), "Downloading objects from external locations");
            handler.download_objects(batch, self.objects.as_ref()).await?;
            fetched.extend(batch.iter().map(|(id, _)| id.clone()));
        }

        let from_peer: Vec<ObjectId> = wanted
            .iter()
            .filter(|id| !located.contains(*id))
            .cloned()
            .collect();
        if !from_peer.is_empty() {
            match source {
                Some(remote) => {
                    tracing::info!(remote = %remote.name, count = from_peer.len(), "Copying objects from peer");
                    fetched.extend(
                        copy_objects(
                            remote.objects.as_ref(),
                            self.objects.as_ref(),
                            &from_peer,
                            &remote.name,
                        )
                        .await?,
                    );
                }
                None => {
                    tracing::warn!(
                        count = from_peer.len(),
                        "Objects have no usable location and no upstream"
                    );
                }
            }
        }

        fetched.sort();
        Ok(fetched)
    }

    /// Push local objects the target does not know yet.
    ///
    /// With the peer handler the bytes are copied into `target`'s object
    /// store and no location is returned. Any other handler uploads the
    /// objects and returns their new locations for the caller to register.
    /// Either way the object metadata is copied into `target`.
    pub async fn upload_objects(
        &self,
        target: &Remote,
        ids: &[ObjectId],
        handler_name: &str,
    ) -> CacheResult<Vec<ObjectLocation>> {
        let ids = sorted_unique(ids);
        let existing = target.metadata.get_object_meta(&ids).await?;
        let new: Vec<ObjectId> = ids
            .into_iter()
            .filter(|id| !existing.contains_key(id))
            .collect();
        if new.is_empty() {
            tracing::debug!(remote = %target.name, "Target already has every object");
            return Ok(Vec::new());
        }

        let (uploaded, locations) = if handler_name == PEER_HANDLER {
            let copied = copy_objects(
                self.objects.as_ref(),
                target.objects.as_ref(),
                &new,
                &target.name,
            )
            .await?;
            (copied, Vec::new())
        } else {
            let handler = self.handlers.get(handler_name)?;
            let urls = handler.upload_objects(&new, self.objects.as_ref()).await?;
            let locations = locations_for(&new, urls, handler_name)?;
            (new, locations)
        };

        let mut metas = self.metadata.get_object_meta(&uploaded).await?;
        let metas: Vec<ObjectMeta> = uploaded.iter().filter_map(|id| metas.remove(id)).collect();
        target.metadata.upsert_objects(&metas).await?;

        tracing::info!(
            remote = %target.name,
            handler = handler_name,
            uploaded = uploaded.len(),
            "Uploaded objects"
        );
        Ok(locations)
    }
}

/// Pair uploaded ids with the URLs a handler returned for them.
pub(crate) fn locations_for(
    ids: &[ObjectId],
    urls: Vec<String>,
    handler_name: &str,
) -> CacheResult<Vec<ObjectLocation>> {
    if urls.len() != ids.len() {
        return Err(CacheError::transport(
            handler_name,
            format!("returned {} locations for {} objects", urls.len(), ids.len()),
        ));
    }
    Ok(ids
        .iter()
        .zip(urls)
        .map(|(id, location)| ObjectLocation {
            object_id: id.clone(),
            location,
            protocol: handler_name.to_string(),
        })
        .collect())
}

/// Copy objects between stores. Objects absent from `from` are skipped with
/// a warning. Returns the ids that were copied, sorted.
async fn copy_objects(
    from: &dyn ObjectStore,
    to: &dyn ObjectStore,
    ids: &[ObjectId],
    peer: &str,
) -> CacheResult<Vec<ObjectId>> {
    let copied: Vec<Option<ObjectId>> = stream::iter(ids.iter().cloned())
        .map(|id| copy_object(from, to, id, peer))
        .buffer_unordered(PEER_TRANSFER_CONCURRENCY)
        .try_collect()
        .await?;

    let mut copied: Vec<ObjectId> = copied.into_iter().flatten().collect();
    copied.sort();
    Ok(copied)
}

async fn copy_object(
    from: &dyn ObjectStore,
    to: &dyn ObjectStore,
    id: ObjectId,
    peer: &str,
) -> CacheResult<Option<ObjectId>> {
    match from.get_object(&id).await {
        Ok(data) => {
            to.put_object(&id, data).await?;
            Ok(Some(id))
        }
        Err(e) if e.is_not_found() => {
            tracing::warn!(object_id = %id, peer = %peer, "Object missing from source store");
            Ok(None)
        }
        Err(e) => Err(CacheError::transport(
            PEER_HANDLER,
            format!("{peer}: {id}: {e}"),
        )),
    }
}
