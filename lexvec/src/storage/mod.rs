//! Sparse co-occurrence matrix backends.

use anyhow::Result;
use log::info;

use crate::config::{Config, StorageKind};
use crate::real;

mod cached;
mod dict;

pub use cached::{max_product, CachedMatrix};
pub use dict::DictMatrix;

/// A sparse `rows x cols` matrix of reals. Cells never set read as the
/// backend's initial value.
pub trait MatrixStorage: Send + Sync {
    fn get(&self, row: u32, col: u32) -> Result<real>;

    fn set(&mut self, row: u32, col: u32, v: real) -> Result<()>;

    fn add(&mut self, row: u32, col: u32, v: real) -> Result<()> {
        let x = self.get(row, col)?;
        self.set(row, col, x + v)
    }

    /// Replaces every stored cell with `f(row, col, value)`.
    fn transform(&mut self, f: &mut dyn FnMut(u32, u32, real) -> real) -> Result<()>;

    /// Called once counting is done. Later `set`s may fail.
    fn reopen_read_only(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Creates the backend chosen by `--storage` for a matrix with `rows` word rows.
pub fn open(config: &Config, rows: u32) -> Result<Box<dyn MatrixStorage>> {
    Ok(match config.storage {
        StorageKind::Dict => {
            info!("using dict cooc storage");
            Box::new(DictMatrix::new(0.0, rows))
        }
        StorageKind::Cached => {
            let max_product = max_product(config.cache_mem, cached::ENTRY_SIZE);
            info!("using cached cooc storage, max product {max_product}");
            Box::new(CachedMatrix::open(
                config.kv_path.as_deref(),
                0.0,
                max_product,
            )?)
        }
    })
}
