//! Database schema versioning
//!
//! Stamps fresh databases with the current layout version and refuses to
//! open databases written by a newer release.

use rocksdb::{IteratorMode, DB};

use crate::error::{MemoryError, Result};

/// Database version stored in metadata
pub(crate) const DB_VERSION_KEY: &[u8] = b"_db_version";
pub(crate) const CURRENT_VERSION: u32 = 1;

/// Check the stored layout version, stamping it if absent
pub fn ensure_schema(db: &DB) -> Result<u32> {
    let stored = match db.get(DB_VERSION_KEY)? {
        Some(bytes) => {
            let bytes_slice: &[u8] = bytes.as_ref();
            let version_bytes: [u8; 4] = bytes_slice
                .try_into()
                .map_err(|_| MemoryError::config("invalid database version format"))?;
            Some(u32::from_le_bytes(version_bytes))
        }
        None => None,
    };

    match stored {
        Some(version) if version > CURRENT_VERSION => Err(MemoryError::config(format!(
            "database version {} is newer than supported version {}",
            version, CURRENT_VERSION
        ))),
        Some(version) => {
            tracing::debug!(version, "database schema up to date");
            Ok(version)
        }
        None => {
            let has_data = db.iterator(IteratorMode::Start).next().is_some();
            if has_data {
                tracing::warn!(
                    "database has data but no version key; assuming v{}",
                    CURRENT_VERSION
                );
            }
            db.put(DB_VERSION_KEY, CURRENT_VERSION.to_le_bytes())?;
            db.flush()?;
            tracing::info!(version = CURRENT_VERSION, "stamped database schema version");
            Ok(CURRENT_VERSION)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rocksdb::Options;
    use tempfile::TempDir;

    fn open(path: &std::path::Path) -> DB {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        DB::open(&opts, path).unwrap()
    }

    #[test]
    fn test_fresh_database_is_stamped() {
        let temp_dir = TempDir::new().unwrap();
        let db = open(temp_dir.path());
        assert_eq!(ensure_schema(&db).unwrap(), CURRENT_VERSION);

        let version_bytes = db.get(DB_VERSION_KEY).unwrap().unwrap();
        let version = u32::from_le_bytes(version_bytes.as_slice().try_into().unwrap());
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_newer_database_is_refused() {
        let temp_dir = TempDir::new().unwrap();
        let db = open(temp_dir.path());
        db.put(DB_VERSION_KEY, (CURRENT_VERSION + 1).to_le_bytes())
            .unwrap();
        assert!(matches!(ensure_schema(&db), Err(MemoryError::Config(_))));
    }
}
