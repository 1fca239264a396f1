use std::collections::HashMap;

use anyhow::Result;

use super::MatrixStorage;
use crate::real;

/// One hash map per row. Memory grows with the number of non-empty cells.
pub struct DictMatrix {
    initial_value: real,
    mem: Vec<HashMap<u32, real>>,
}

impl DictMatrix {
    pub fn new(initial_value: real, rows: u32) -> Self {
        DictMatrix {
            initial_value,
            mem: (0..rows).map(|_| HashMap::new()).collect(),
        }
    }

    /// Number of stored cells.
    pub fn len(&self) -> usize {
        self.mem.iter().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MatrixStorage for DictMatrix {
    fn get(&self, row: u32, col: u32) -> Result<real> {
        Ok(self.mem[row as usize]
            .get(&col)
            .copied()
            .unwrap_or(self.initial_value))
    }

    fn set(&mut self, row: u32, col: u32, v: real) -> Result<()> {
        self.mem[row as usize].insert(col, v);
        Ok(())
    }

    fn transform(&mut self, f: &mut dyn FnMut(u32, u32, real) -> real) -> Result<()> {
        for (i, row) in self.mem.iter_mut().enumerate() {
            for (&j, v) in row.iter_mut() {
                *v = f(i as u32, j, *v);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_set_add() {
        let mut m = DictMatrix::new(0.5, 3);
        assert_eq!(m.get(2, 100).unwrap(), 0.5);
        m.set(2, 100, 3.0).unwrap();
        m.add(2, 100, 1.0).unwrap();
        m.add(0, 7, 1.0).unwrap();
        assert_eq!(m.get(2, 100).unwrap(), 4.0);
        assert_eq!(m.get(0, 7).unwrap(), 1.5);
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn transform_visits_stored_cells() {
        let mut m = DictMatrix::new(0.0, 2);
        m.set(0, 1, 2.0).unwrap();
        m.set(1, 0, 3.0).unwrap();
        let mut seen = vec![];
        m.transform(&mut |i, j, v| {
            seen.push((i, j, v));
            v * 10.0
        })
        .unwrap();
        seen.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(seen, vec![(0, 1, 2.0), (1, 0, 3.0)]);
        assert_eq!(m.get(1, 0).unwrap(), 30.0);
        assert_eq!(m.get(1, 1).unwrap(), 0.0);
    }
}
