use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, ensure, Context, Result};
use log::debug;

use super::MatrixStorage;
use crate::real;

/// Bytes a cached cell costs: two indices and a value.
pub const ENTRY_SIZE: usize = 16;

/// Largest `row * col` product that fits in a cache of `mem_gb` gigabytes.
///
/// Frequent words have small indices, so cells with a small index product
/// are the dense ones. With `n` rows kept, the number of cells with
/// `row * col < n` is about `n (ln n + 0.1544)`; solve that for the cell
/// budget by fixed-point iteration.
pub fn max_product(mem_gb: real, entry_size: usize) -> u64 {
    let rlimit = 0.85 * mem_gb * (1u64 << 30) as real / entry_size as real;
    let mut n: real = 1e5;
    for _ in 0..1000 {
        if (rlimit - n * (n.ln() + 0.1544313298)).abs() <= 1e-3 {
            break;
        }
        n = rlimit / (n.ln() + 0.1544313298);
    }
    // Budgets of a few cells do not converge; cache nothing.
    if n.is_finite() {
        n.max(0.0) as u64
    } else {
        0
    }
}

fn cache_key(row: u32, col: u32) -> [u8; 16] {
    // Big-endian so the store iterates in (row, col) order.
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&(row as u64).to_be_bytes());
    key[8..].copy_from_slice(&(col as u64).to_be_bytes());
    key
}

fn key_pair(key: &[u8]) -> Result<(u32, u32)> {
    ensure!(key.len() == 16, "bad key length {} in key-value store", key.len());
    let row = u64::from_be_bytes(key[..8].try_into()?);
    let col = u64::from_be_bytes(key[8..].try_into()?);
    Ok((u32::try_from(row)?, u32::try_from(col)?))
}

fn cache_value(bytes: &[u8]) -> Result<real> {
    let bytes: [u8; 8] = bytes
        .try_into()
        .map_err(|_| anyhow!("bad value length {} in key-value store", bytes.len()))?;
    Ok(real::from_le_bytes(bytes))
}

/// Cells with `row * col < max_product` live in memory; all others live in
/// an on-disk ordered key-value store.
pub struct CachedMatrix {
    initial_value: real,
    max_product: u64,
    cache: HashMap<(u32, u32), real>,
    db: sled::Db,
    read_only: bool,
}

impl CachedMatrix {
    /// Opens (and empties) the store at `kv_path`, or a temporary store
    /// removed on drop.
    pub fn open(kv_path: Option<&Path>, initial_value: real, max_product: u64) -> Result<Self> {
        let kv = match kv_path {
            Some(path) => sled::Config::new().path(path),
            None => sled::Config::new().temporary(true),
        };
        let db = kv.open().context("error opening key-value store")?;
        db.clear().context("error clearing key-value store")?;
        Ok(CachedMatrix {
            initial_value,
            max_product,
            cache: HashMap::new(),
            db,
            read_only: false,
        })
    }

    fn in_cache(&self, row: u32, col: u32) -> bool {
        (row as u64) * (col as u64) < self.max_product
    }

    /// Cells held in memory and in the store.
    fn cell_counts(&self) -> (usize, usize) {
        (self.cache.len(), self.db.len())
    }
}

impl MatrixStorage for CachedMatrix {
    fn get(&self, row: u32, col: u32) -> Result<real> {
        if self.in_cache(row, col) {
            return Ok(self
                .cache
                .get(&(row, col))
                .copied()
                .unwrap_or(self.initial_value));
        }
        match self
            .db
            .get(cache_key(row, col))
            .context("error reading key-value store")?
        {
            Some(v) => cache_value(&v),
            None => Ok(self.initial_value),
        }
    }

    fn set(&mut self, row: u32, col: u32, v: real) -> Result<()> {
        ensure!(!self.read_only, "cooc storage was reopened read-only");
        if self.in_cache(row, col) {
            self.cache.insert((row, col), v);
        } else {
            self.db
                .insert(cache_key(row, col), &v.to_le_bytes()[..])
                .context("error writing key-value store")?;
        }
        Ok(())
    }

    fn transform(&mut self, f: &mut dyn FnMut(u32, u32, real) -> real) -> Result<()> {
        ensure!(!self.read_only, "cooc storage was reopened read-only");
        for (&(row, col), v) in self.cache.iter_mut() {
            *v = f(row, col, *v);
        }
        let mut batch = sled::Batch::default();
        for item in self.db.iter() {
            let (k, v) = item.context("error reading key-value store")?;
            let (row, col) = key_pair(&k)?;
            let x = f(row, col, cache_value(&v)?);
            batch.insert(k, &x.to_le_bytes()[..]);
        }
        self.db
            .apply_batch(batch)
            .context("error writing key-value store")?;
        Ok(())
    }

    fn reopen_read_only(&mut self) -> Result<()> {
        let (cached, stored) = self.cell_counts();
        debug!("cooc cells: {cached} cached, {stored} in key-value store");
        self.db.flush().context("error flushing key-value store")?;
        self.read_only = true;
        Ok(())
    }
}
