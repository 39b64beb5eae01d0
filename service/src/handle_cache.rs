//! Persistent GATT handle cache using heed (LMDB).
//!
//! Handles discovered on a device are stored under its address so that a
//! later session can hand them to the orchestrator and skip discovery for
//! those services.

use std::{
   borrow::Cow,
   path::{Path, PathBuf},
   sync::Arc,
};

use bluer::Address;
use heed::{Database, Env, EnvOpenOptions, types::SerdeBincode};
use log::debug;
use thiserror::Error;

use crate::cap::subclient::DeviceHandles;

/// Errors that can occur in handle cache operations.
#[derive(Error, Debug)]
pub enum Error {
   #[error("Failed to create handle cache directory: {0}")]
   CreateDirectory(#[from] std::io::Error),

   #[error("Failed to open heed environment: {0}")]
   OpenEnvironment(heed::Error),

   #[error("Database transaction error: {0}")]
   Transaction(heed::Error),

   #[error("Database operation error: {0}")]
   DatabaseOperation(heed::Error),

   #[error("Could not find local data directory")]
   DataDirectoryNotFound,
}

pub type Result<T> = std::result::Result<T, Error>;

struct KeyCodec;

impl<'a> heed::BytesEncode<'a> for KeyCodec {
   type EItem = Address;
   fn bytes_encode(item: &'a Self::EItem) -> std::result::Result<Cow<'a, [u8]>, heed::BoxedError> {
      Ok(Cow::Borrowed(&item.0))
   }
}

impl<'a> heed::BytesDecode<'a> for KeyCodec {
   type DItem = Address;
   fn bytes_decode(bytes: &'a [u8]) -> std::result::Result<Self::DItem, heed::BoxedError> {
      let Ok(s) = bytes.try_into() else {
         return Err(heed::BoxedError::from(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Invalid address",
         )));
      };
      Ok(Address(s))
   }
}

#[derive(Debug)]
struct Db {
   env: Env,
   /// MAC address -> handles
   devices: Database<KeyCodec, SerdeBincode<DeviceHandles>>,
}

/// Thread-safe handle to the cache database.
#[derive(Clone, Debug)]
pub struct HandleCache {
   db: Arc<Db>,
}

impl HandleCache {
   /// Opens the cache at its default location.
   pub fn open() -> Result<Self> {
      Self::open_at(&Self::db_path()?)
   }

   /// Opens or creates the cache under `path`.
   pub fn open_at(path: &Path) -> Result<Self> {
      std::fs::create_dir_all(path)?;

      let env = unsafe {
         EnvOpenOptions::new()
            .map_size(4 * 1024 * 1024)
            .max_dbs(1)
            .open(path)
            .map_err(Error::OpenEnvironment)?
      };

      let mut wtxn = env.write_txn().map_err(Error::Transaction)?;
      let devices = env
         .create_database(&mut wtxn, Some("handles"))
         .map_err(Error::DatabaseOperation)?;
      wtxn.commit().map_err(Error::Transaction)?;

      Ok(Self {
         db: Arc::new(Db { env, devices }),
      })
   }

   fn db_path() -> Result<PathBuf> {
      if let Ok(path) = std::env::var("CAPD_CACHE_PATH") {
         return Ok(PathBuf::from(path));
      }

      // ~/.local/share/capd/handles.db
      let base = dirs::data_local_dir().ok_or(Error::DataDirectoryNotFound)?;
      Ok(base.join("capd").join("handles.db"))
   }

   pub fn get(&self, address: Address) -> Result<Option<DeviceHandles>> {
      let rtxn = self.db.env.read_txn().map_err(Error::Transaction)?;
      self
         .db
         .devices
         .get(&rtxn, &address)
         .map_err(Error::DatabaseOperation)
   }

   /// Merges `handles` into whatever is stored for `address`.
   pub fn put(&self, address: Address, handles: &DeviceHandles) -> Result<()> {
      let mut wtxn = self.db.env.write_txn().map_err(Error::Transaction)?;
      let mut merged = self
         .db
         .devices
         .get(&wtxn, &address)
         .map_err(Error::DatabaseOperation)?
         .unwrap_or_default();
      merged.bap = handles.bap.clone().or(merged.bap);
      merged.csip = handles.csip.or(merged.csip);
      merged.vcp = handles.vcp.or(merged.vcp);
      merged.micp = handles.micp.or(merged.micp);
      merged.bass = handles.bass.clone().or(merged.bass);

      self
         .db
         .devices
         .put(&mut wtxn, &address, &merged)
         .map_err(Error::DatabaseOperation)?;
      wtxn.commit().map_err(Error::Transaction)?;
      debug!("Cached handles for {address}");
      Ok(())
   }

   /// Forgets `address`; returns whether anything was stored.
   pub fn remove(&self, address: Address) -> Result<bool> {
      let mut wtxn = self.db.env.write_txn().map_err(Error::Transaction)?;
      let removed = self
         .db
         .devices
         .delete(&mut wtxn, &address)
         .map_err(Error::DatabaseOperation)?;
      wtxn.commit().map_err(Error::Transaction)?;
      Ok(removed)
   }
}

#[cfg(test)]
mod tests {
   use tempfile::TempDir;

   use super::*;
   use crate::cap::subclient::{CsipHandles, VcpHandles};

   const TEST_ADDRESS: Address = Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

   fn create_test_db() -> Result<(HandleCache, TempDir)> {
      let temp_dir = TempDir::new().unwrap();
      let cache = HandleCache::open_at(&temp_dir.path().join("handles.db"))?;
      Ok((cache, temp_dir))
   }

   #[test]
   fn test_missing_device() -> Result<()> {
      let (cache, _dir) = create_test_db()?;
      assert_eq!(cache.get(TEST_ADDRESS)?, None);
      assert!(!cache.remove(TEST_ADDRESS)?);
      Ok(())
   }

   #[test]
   fn test_put_merges_services() -> Result<()> {
      let (cache, _dir) = create_test_db()?;
      let vcp = VcpHandles {
         service: 0x30,
         state: 0x32,
         control_point: 0x35,
         flags: 0x37,
      };
      cache.put(
         TEST_ADDRESS,
         &DeviceHandles {
            vcp: Some(vcp),
            ..Default::default()
         },
      )?;
      let csip = CsipHandles {
         service: 0x40,
         size: 0x42,
         lock: 0x44,
         rank: 0x46,
      };
      cache.put(
         TEST_ADDRESS,
         &DeviceHandles {
            csip: Some(csip),
            ..Default::default()
         },
      )?;

      let stored = cache.get(TEST_ADDRESS)?.unwrap();
      assert_eq!(stored.vcp, Some(vcp));
      assert_eq!(stored.csip, Some(csip));
      assert!(stored.bap.is_none());
      Ok(())
   }

   #[test]
   fn test_remove() -> Result<()> {
      let (cache, _dir) = create_test_db()?;
      cache.put(
         TEST_ADDRESS,
         &DeviceHandles {
            micp: Some(Default::default()),
            ..Default::default()
         },
      )?;
      assert!(cache.remove(TEST_ADDRESS)?);
      assert_eq!(cache.get(TEST_ADDRESS)?, None);
      Ok(())
   }
}
