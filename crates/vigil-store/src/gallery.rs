//! Known-faces gallery cache.

use crate::db::{Store, StoreError};
use std::sync::{Arc, RwLock};
use vigil_core::KnownFace;

/// Process-wide, read-mostly snapshot of the known-encodings gallery.
///
/// Recognition workers read the snapshot concurrently; the ingestion loop
/// invalidates it after promoting a registration. The snapshot is an
/// `Arc<Vec<_>>` swapped whole; readers holding an old `Arc` keep a
/// consistent view and never observe a partially updated set.
pub struct FaceGallery {
    snapshot: RwLock<Option<Arc<Vec<KnownFace>>>>,
}

impl Default for FaceGallery {
    fn default() -> Self {
        Self::new()
    }
}

impl FaceGallery {
    pub fn new() -> Self {
        Self { snapshot: RwLock::new(None) }
    }

    /// Return the current snapshot, loading from the store on first use or
    /// after an invalidation.
    pub fn get_or_load(&self, store: &Store) -> Result<Arc<Vec<KnownFace>>, StoreError> {
        if let Some(snapshot) = self.snapshot.read().expect("gallery lock poisoned").as_ref() {
            return Ok(Arc::clone(snapshot));
        }

        let mut guard = self.snapshot.write().expect("gallery lock poisoned");
        // Another worker may have loaded while we waited for the write lock.
        if let Some(snapshot) = guard.as_ref() {
            return Ok(Arc::clone(snapshot));
        }
        let faces = Arc::new(store.known_faces()?);
        tracing::info!(count = faces.len(), "loaded known-faces gallery");
        *guard = Some(Arc::clone(&faces));
        Ok(faces)
    }

    /// Drop the cached snapshot; the next reader reloads from the store.
    pub fn invalidate(&self) {
        *self.snapshot.write().expect("gallery lock poisoned") = None;
        tracing::debug!("known-faces gallery invalidated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::{PendingRegistration, SCHEMA_VERSION};

    fn reg(guest_id: &str) -> PendingRegistration {
        PendingRegistration {
            schema_version: SCHEMA_VERSION,
            guest_id: guest_id.into(),
            name: None,
            guest_type: None,
            bed_no: None,
            confirmed: true,
            face_encodings: vec![
                (0..32).map(|i| i as f32).collect(),
                (0..32).map(|i| (i + 1) as f32).collect(),
            ],
        }
    }

    #[test]
    fn test_snapshot_reloads_after_invalidate() {
        let store = Store::open_in_memory().unwrap();
        let gallery = FaceGallery::new();

        assert!(gallery.get_or_load(&store).unwrap().is_empty());

        store.promote_guest(&reg("g1")).unwrap();
        store.set_guest_status("g1", "active").unwrap();

        // Cached snapshot is stale until invalidated.
        assert!(gallery.get_or_load(&store).unwrap().is_empty());
        gallery.invalidate();
        assert_eq!(gallery.get_or_load(&store).unwrap().len(), 2);
    }

    #[test]
    fn test_old_snapshot_stays_consistent() {
        let store = Store::open_in_memory().unwrap();
        let gallery = FaceGallery::new();
        let old = gallery.get_or_load(&store).unwrap();

        store.promote_guest(&reg("g1")).unwrap();
        store.set_guest_status("g1", "active").unwrap();
        gallery.invalidate();
        let new = gallery.get_or_load(&store).unwrap();

        assert!(old.is_empty());
        assert_eq!(new.len(), 2);
    }
}
