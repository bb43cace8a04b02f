//! Canonical record persistence: lock records, overlay records and the
//! lock id high-water mark.

use chronolock_index::keys;
use chronolock_store::KvStore;
use chronolock_types::{Lock, LockId, LockupError, OverlayKey, Result, SyntheticLock};

pub fn get_lock(store: &impl KvStore, id: LockId) -> Result<Option<Lock>> {
    store
        .get(&keys::lock_key(id))
        .map(|bytes| serde_json::from_slice(&bytes).map_err(LockupError::from))
        .transpose()
}

/// # Errors
/// `LockNotFound` if no record exists.
pub fn load_lock(store: &impl KvStore, id: LockId) -> Result<Lock> {
    get_lock(store, id)?.ok_or(LockupError::LockNotFound(id))
}

pub fn put_lock(store: &mut impl KvStore, lock: &Lock) -> Result<()> {
    store.set(&keys::lock_key(lock.id), &serde_json::to_vec(lock)?);
    Ok(())
}

pub fn delete_lock(store: &mut impl KvStore, id: LockId) {
    store.delete(&keys::lock_key(id));
}

/// Every lock record in id order.
pub fn all_locks(store: &impl KvStore) -> Result<Vec<Lock>> {
    store
        .prefix_scan(&[keys::LOCK_PREFIX])
        .into_iter()
        .map(|(_, bytes)| serde_json::from_slice(&bytes).map_err(LockupError::from))
        .collect()
}

/// Highest id ever assigned, zero before the first lock.
pub fn last_lock_id(store: &impl KvStore) -> Result<LockId> {
    match store.get(keys::LAST_LOCK_ID_KEY) {
        None => Ok(LockId(0)),
        Some(bytes) => {
            let arr: [u8; 8] =
                bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| LockupError::InternalInconsistency {
                        reason: format!("last lock id has {} bytes", bytes.len()),
                    })?;
            Ok(LockId::from_be_bytes(arr))
        }
    }
}

/// Assign the next id and persist it as the new high-water mark.
pub fn next_lock_id(store: &mut impl KvStore) -> Result<LockId> {
    let id = last_lock_id(store)?.next()?;
    store.set(keys::LAST_LOCK_ID_KEY, &id.to_be_bytes());
    Ok(id)
}

// ---------------------------------------------------------------------------
// Overlays
// ---------------------------------------------------------------------------

pub fn get_overlay(store: &impl KvStore, key: &OverlayKey) -> Result<Option<SyntheticLock>> {
    store
        .get(&keys::overlay_key(key))
        .map(|bytes| serde_json::from_slice(&bytes).map_err(LockupError::from))
        .transpose()
}

/// # Errors
/// `OverlayNotFound` if no record exists.
pub fn load_overlay(store: &impl KvStore, key: &OverlayKey) -> Result<SyntheticLock> {
    get_overlay(store, key)?.ok_or_else(|| LockupError::OverlayNotFound(key.clone()))
}

pub fn put_overlay(store: &mut impl KvStore, overlay: &SyntheticLock) -> Result<()> {
    store.set(
        &keys::overlay_key(&overlay.key()),
        &serde_json::to_vec(overlay)?,
    );
    Ok(())
}

pub fn delete_overlay(store: &mut impl KvStore, key: &OverlayKey) {
    store.delete(&keys::overlay_key(key));
}

/// Overlays on one lock, ordered by synthetic denom.
pub fn overlays_of_lock(store: &impl KvStore, lock_id: LockId) -> Result<Vec<SyntheticLock>> {
    decode_overlays(store.prefix_scan(&keys::overlays_of_lock_prefix(lock_id)))
}

pub fn has_overlays(store: &impl KvStore, lock_id: LockId) -> bool {
    !store
        .prefix_scan(&keys::overlays_of_lock_prefix(lock_id))
        .is_empty()
}

/// Every overlay, ordered by lock id then synthetic denom.
pub fn all_overlays(store: &impl KvStore) -> Result<Vec<SyntheticLock>> {
    decode_overlays(store.prefix_scan(&[keys::OVERLAY_PREFIX]))
}

fn decode_overlays(pairs: Vec<(Vec<u8>, Vec<u8>)>) -> Result<Vec<SyntheticLock>> {
    pairs
        .into_iter()
        .map(|(key, bytes)| {
            let overlay: SyntheticLock = serde_json::from_slice(&bytes)?;
            if keys::decode_overlay_key(&key)? != overlay.key() {
                return Err(LockupError::InternalInconsistency {
                    reason: format!("overlay {} stored under a foreign key", overlay.key()),
                });
            }
            Ok(overlay)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chronolock_store::MemStore;
    use chronolock_types::{Coins, Owner};

    use super::*;

    #[test]
    fn ids_start_at_one_and_persist() {
        let mut store = MemStore::new();
        assert_eq!(last_lock_id(&store).unwrap(), LockId(0));
        assert_eq!(next_lock_id(&mut store).unwrap(), LockId(1));
        assert_eq!(next_lock_id(&mut store).unwrap(), LockId(2));
        assert_eq!(last_lock_id(&store).unwrap(), LockId(2));
    }

    #[test]
    fn lock_records_roundtrip() {
        let mut store = MemStore::new();
        let lock = Lock::new(
            LockId(4),
            Owner::dummy(1),
            Duration::from_secs(10),
            Coins::dummy(5, "stake"),
        );
        put_lock(&mut store, &lock).unwrap();
        assert_eq!(load_lock(&store, LockId(4)).unwrap(), lock);
        assert!(matches!(
            load_lock(&store, LockId(5)),
            Err(LockupError::LockNotFound(LockId(5)))
        ));
        assert_eq!(all_locks(&store).unwrap(), vec![lock]);
        delete_lock(&mut store, LockId(4));
        assert!(get_lock(&store, LockId(4)).unwrap().is_none());
    }

    #[test]
    fn overlays_are_grouped_by_lock() {
        let mut store = MemStore::new();
        let mk = |id, denom: &str| SyntheticLock {
            underlying_lock_id: LockId(id),
            synth_denom: denom.into(),
            end_time: None,
            duration: Duration::from_secs(1),
        };
        // Lock 1 and lock 256 differ only in the high byte of the id.
        put_overlay(&mut store, &mk(1, "stake/b")).unwrap();
        put_overlay(&mut store, &mk(1, "stake/a")).unwrap();
        put_overlay(&mut store, &mk(256, "stake/a")).unwrap();

        let of_one = overlays_of_lock(&store, LockId(1)).unwrap();
        assert_eq!(
            of_one.iter().map(|o| o.synth_denom.as_str()).collect::<Vec<_>>(),
            vec!["stake/a", "stake/b"]
        );
        assert!(has_overlays(&store, LockId(256)));
        assert!(!has_overlays(&store, LockId(2)));
        assert_eq!(all_overlays(&store).unwrap().len(), 3);
    }
}
