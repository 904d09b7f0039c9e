use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::{Column, KeyValueStore, StoreError, WriteBatch, WriteOp};

const ALL_COLUMNS: [Column; 3] = [Column::Objects, Column::Utxo, Column::Meta];

/// In-memory backend for tests and `--backend memory` runs.
#[derive(Debug)]
pub struct MemoryStore {
    columns: Mutex<HashMap<Column, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let mut columns = HashMap::new();
        for column in ALL_COLUMNS {
            columns.insert(column, BTreeMap::new());
        }
        Self {
            columns: Mutex::new(columns),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_err() -> StoreError {
    StoreError::Backend("memory store lock poisoned".to_string())
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let columns = self.columns.lock().map_err(|_| lock_err())?;
        Ok(columns
            .get(&column)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut columns = self.columns.lock().map_err(|_| lock_err())?;
        columns
            .entry(column)
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut columns = self.columns.lock().map_err(|_| lock_err())?;
        if let Some(entries) = columns.get_mut(&column) {
            entries.remove(key);
        }
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut columns = self.columns.lock().map_err(|_| lock_err())?;
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    columns
                        .entry(*column)
                        .or_default()
                        .insert(key.as_slice().to_vec(), value.clone());
                }
                WriteOp::Delete { column, key } => {
                    if let Some(entries) = columns.get_mut(column) {
                        entries.remove(key.as_slice());
                    }
                }
            }
        }
        Ok(())
    }
}
