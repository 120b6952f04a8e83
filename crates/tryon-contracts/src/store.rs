use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};

use crate::garment::GarmentAsset;

/// Result of an idempotent insert. A losing concurrent writer gets back the
/// winner's record so all callers converge on one asset.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOutcome {
    Inserted(GarmentAsset),
    AlreadyPresent(GarmentAsset),
}

impl StoreOutcome {
    pub fn asset(&self) -> &GarmentAsset {
        match self {
            Self::Inserted(asset) | Self::AlreadyPresent(asset) => asset,
        }
    }

    pub fn was_inserted(&self) -> bool {
        matches!(self, Self::Inserted(_))
    }
}

/// Reservation handed out while one caller performs extraction for a hash.
/// Dropping it (on success or failure) releases the hash for other callers.
#[derive(Debug)]
pub struct ExtractionSlot {
    hash: String,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Drop for ExtractionSlot {
    fn drop(&mut self) {
        if let Ok(mut set) = self.in_flight.lock() {
            set.remove(&self.hash);
        }
    }
}

/// Durable store of garment assets keyed by content hash, backed by a single
/// JSON object file. Writes re-read the on-disk map and only add keys that
/// are still missing, so the first writer wins and later identical writers
/// observe its record. Assets are never deleted.
#[derive(Debug, Clone)]
pub struct GarmentStore {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl GarmentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, hash: &str) -> Option<GarmentAsset> {
        let on_disk = read_json_object(&self.path)?;
        let value = on_disk.get(hash)?;
        serde_json::from_value(value.clone()).ok()
    }

    /// The whole read-check-write runs under the store lock so writers for
    /// different hashes never interleave and drop each other's records.
    pub fn insert_if_absent(&self, asset: GarmentAsset) -> anyhow::Result<StoreOutcome> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("garment store lock poisoned"))?;
        let mut on_disk = read_json_object(&self.path).unwrap_or_default();
        if let Some(existing) = on_disk
            .get(&asset.content_hash)
            .and_then(|value| serde_json::from_value::<GarmentAsset>(value.clone()).ok())
        {
            return Ok(StoreOutcome::AlreadyPresent(existing));
        }
        on_disk.insert(
            asset.content_hash.clone(),
            serde_json::to_value(&asset)?,
        );
        write_json_object(&self.path, &on_disk)?;
        Ok(StoreOutcome::Inserted(asset))
    }

    /// Try to reserve extraction work for a hash. Returns `None` when another
    /// caller in this process is already extracting the same content; the
    /// caller should wait and re-check `get`.
    pub fn reserve_extraction(&self, hash: &str) -> Option<ExtractionSlot> {
        let mut set = self.in_flight.lock().ok()?;
        if !set.insert(hash.to_string()) {
            return None;
        }
        Some(ExtractionSlot {
            hash: hash.to_string(),
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    pub fn len(&self) -> usize {
        read_json_object(&self.path).map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}

/// Write via a sibling temp file and an atomic rename so a reader never
/// observes a torn store file.
fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(format!(".{}.tmp", std::process::id()));
    let tmp = PathBuf::from(tmp);
    std::fs::write(
        &tmp,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{GarmentStore, StoreOutcome};
    use crate::garment::{GarmentAsset, GarmentAttributes};

    fn asset(hash: &str, clean: &str) -> GarmentAsset {
        GarmentAsset::new(
            hash,
            clean,
            "blobs/source.png",
            GarmentAttributes::default(),
            true,
        )
    }

    #[test]
    fn insert_then_get() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = GarmentStore::new(temp.path().join("garments.json"));
        let outcome = store.insert_if_absent(asset("aaa", "blobs/aaa.png"))?;
        assert!(outcome.was_inserted());
        assert_eq!(store.get("aaa").map(|a| a.clean_image_ref), Some("blobs/aaa.png".to_string()));
        Ok(())
    }

    #[test]
    fn second_writer_observes_first_record() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("garments.json");
        let store_a = GarmentStore::new(&path);
        let store_b = GarmentStore::new(&path);

        store_a.insert_if_absent(asset("aaa", "blobs/first.png"))?;
        let second = store_b.insert_if_absent(asset("aaa", "blobs/second.png"))?;

        assert!(!second.was_inserted());
        assert_eq!(second.asset().clean_image_ref, "blobs/first.png");
        assert_eq!(store_a.get("aaa").map(|a| a.clean_image_ref), Some("blobs/first.png".to_string()));
        Ok(())
    }

    #[test]
    fn distinct_hashes_coexist() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("garments.json");
        let store_a = GarmentStore::new(&path);
        let store_b = GarmentStore::new(&path);

        store_a.insert_if_absent(asset("aaa", "blobs/aaa.png"))?;
        store_b.insert_if_absent(asset("bbb", "blobs/bbb.png"))?;
        store_a.insert_if_absent(asset("ccc", "blobs/ccc.png"))?;

        let reloaded = GarmentStore::new(path);
        assert_eq!(reloaded.len(), 3);
        assert!(reloaded.get("bbb").is_some());
        Ok(())
    }

    #[test]
    fn concurrent_writers_for_distinct_hashes_lose_no_records() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = GarmentStore::new(temp.path().join("garments.json"));

        let mut handles = Vec::new();
        for thread_id in 0..4 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || -> anyhow::Result<()> {
                for item in 0..50 {
                    let hash = format!("{thread_id}-{item}");
                    let clean = format!("blobs/{hash}.png");
                    store.insert_if_absent(asset(&hash, &clean))?;
                }
                Ok(())
            }));
        }
        for handle in handles {
            handle.join().expect("writer thread panicked")?;
        }

        assert_eq!(store.len(), 200);
        for thread_id in 0..4 {
            for item in 0..50 {
                let hash = format!("{thread_id}-{item}");
                assert!(store.get(&hash).is_some(), "record {hash} was lost");
            }
        }
        Ok(())
    }

    #[test]
    fn reservation_is_exclusive_until_dropped() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = GarmentStore::new(temp.path().join("garments.json"));

        let slot = store.reserve_extraction("aaa");
        assert!(slot.is_some());
        assert!(store.reserve_extraction("aaa").is_none());
        assert!(store.reserve_extraction("bbb").is_some());

        drop(slot);
        assert!(store.reserve_extraction("aaa").is_some());
        Ok(())
    }

    #[test]
    fn concurrent_clones_share_inflight_guard() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = GarmentStore::new(temp.path().join("garments.json"));
        let clone = store.clone();

        let _slot = store.reserve_extraction("aaa");
        assert!(clone.reserve_extraction("aaa").is_none());
        Ok(())
    }
}
