//! Fixed-width binary records, and a k-way merge over sorted streams of them.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::{ErrorKind, Read, Write};
use std::mem;

use anyhow::{bail, Context, Result};
use bytemuck::Pod;

/// A plain-old-data record stored on disk with little-endian fields.
pub trait Record: Pod {
    /// Swaps every field between native and little-endian byte order.
    /// A no-op on little-endian targets.
    fn swap_le(self) -> Self;
}

fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        match r.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(k) => n += k,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("error reading record"),
        }
    }
    Ok(n)
}

/// Reads one record; `None` at a clean end of stream.
pub fn read_record<T: Record, R: Read>(r: &mut R) -> Result<Option<T>> {
    let mut rec = T::zeroed();
    let n = read_full(r, bytemuck::bytes_of_mut(&mut rec))?;
    if n == 0 {
        return Ok(None);
    }
    if n < mem::size_of::<T>() {
        bail!("truncated record: {n} of {} bytes", mem::size_of::<T>());
    }
    Ok(Some(rec.swap_le()))
}

pub fn write_records<T: Record, W: Write>(w: &mut W, records: &[T]) -> Result<()> {
    #[cfg(target_endian = "little")]
    w.write_all(bytemuck::cast_slice(records))
        .context("error writing records")?;
    #[cfg(not(target_endian = "little"))]
    for &rec in records {
        w.write_all(bytemuck::bytes_of(&rec.swap_le()))
            .context("error writing records")?;
    }
    Ok(())
}

/// Merges streams that are each sorted by `key` into one sorted stream.
///
/// Equal keys come out in order of stream index, so the output order is
/// fully determined by the inputs.
pub struct KWayMerge<T, K, R, F> {
    readers: Vec<R>,
    heads: Vec<T>,
    heap: BinaryHeap<Reverse<(K, usize)>>,
    key: F,
}

impl<T, K, R, F> KWayMerge<T, K, R, F>
where
    T: Record,
    K: Ord,
    R: Read,
    F: Fn(&T) -> K,
{
    pub fn new(mut readers: Vec<R>, key: F) -> Result<Self> {
        let mut heads = Vec::with_capacity(readers.len());
        let mut heap = BinaryHeap::with_capacity(readers.len());
        for (i, r) in readers.iter_mut().enumerate() {
            match read_record::<T, R>(r)? {
                Some(rec) => {
                    heap.push(Reverse((key(&rec), i)));
                    heads.push(rec);
                }
                None => heads.push(T::zeroed()),
            }
        }
        Ok(KWayMerge {
            readers,
            heads,
            heap,
            key,
        })
    }

    pub fn key(&self, rec: &T) -> K {
        (self.key)(rec)
    }

    /// The smallest remaining record and the index of the stream it came from.
    pub fn pop(&mut self) -> Result<Option<(T, usize)>> {
        let Some(Reverse((_, i))) = self.heap.pop() else {
            return Ok(None);
        };
        let rec = self.heads[i];
        if let Some(next) = read_record::<T, R>(&mut self.readers[i])? {
            self.heap.push(Reverse(((self.key)(&next), i)));
            self.heads[i] = next;
        }
        Ok(Some((rec, i)))
    }
}

/// Merges sorted streams and folds runs of records with equal keys into one
/// with `coalesce` before handing them to `emit`. Returns the number of
/// records read, or the first error from `coalesce` or `emit`.
pub fn merge_coalesce<T, K, R, F, C, E>(
    readers: Vec<R>,
    key: F,
    mut coalesce: C,
    mut emit: E,
) -> Result<u64>
where
    T: Record,
    K: Ord,
    R: Read,
    F: Fn(&T) -> K,
    C: FnMut(&mut T, &T) -> Result<()>,
    E: FnMut(T) -> Result<()>,
{
    let mut merge = KWayMerge::new(readers, key)?;
    let mut pending: Option<T> = None;
    let mut records_read = 0;
    while let Some((rec, _)) = merge.pop()? {
        records_read += 1;
        if let Some(p) = pending.as_mut() {
            if merge.key(p) == merge.key(&rec) {
                coalesce(p, &rec)?;
                continue;
            }
        }
        if let Some(p) = pending.replace(rec) {
            emit(p)?;
        }
    }
    if let Some(p) = pending {
        emit(p)?;
    }
    Ok(records_read)
}

#[cfg(test)]
mod tests {
    use bytemuck::{Pod, Zeroable};

    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
    #[repr(C)]
    struct Pair {
        key: u32,
        value: u32,
    }

    impl Record for Pair {
        fn swap_le(self) -> Self {
            Pair {
                key: u32::from_le(self.key),
                value: u32::from_le(self.value),
            }
        }
    }

    fn stream(pairs: &[(u32, u32)]) -> Vec<u8> {
        let recs = pairs
            .iter()
            .map(|&(key, value)| Pair { key, value })
            .collect::<Vec<_>>();
        let mut out = vec![];
        write_records(&mut out, &recs).unwrap();
        out
    }

    #[test]
    fn records_are_little_endian() {
        let bytes = stream(&[(1, 0x0203)]);
        assert_eq!(bytes, vec![1, 0, 0, 0, 3, 2, 0, 0]);
        let mut r = &bytes[..];
        assert_eq!(
            read_record::<Pair, _>(&mut r).unwrap(),
            Some(Pair { key: 1, value: 0x0203 })
        );
        assert_eq!(read_record::<Pair, _>(&mut r).unwrap(), None);
    }

    #[test]
    fn truncated_record_is_an_error() {
        let bytes = [1u8, 0, 0, 0, 5];
        assert!(read_record::<Pair, _>(&mut &bytes[..]).is_err());
    }

    #[test]
    fn merge_orders_and_breaks_ties_by_stream() {
        let a = stream(&[(1, 10), (4, 10)]);
        let b = stream(&[]);
        let c = stream(&[(1, 30), (2, 30), (4, 30)]);
        let mut merge =
            KWayMerge::new(vec![&a[..], &b[..], &c[..]], |p: &Pair| p.key).unwrap();
        let mut out = vec![];
        while let Some((p, i)) = merge.pop().unwrap() {
            out.push((p.key, i));
        }
        assert_eq!(out, vec![(1, 0), (1, 2), (2, 2), (4, 0), (4, 2)]);
    }

    #[test]
    fn coalesce_equal_keys_across_streams() {
        let a = stream(&[(1, 3), (5, 1)]);
        let b = stream(&[(1, 4), (2, 2)]);
        let mut out = vec![];
        let n = merge_coalesce(
            vec![&a[..], &b[..]],
            |p: &Pair| p.key,
            |acc, p| {
                acc.value += p.value;
                Ok(())
            },
            |p| {
                out.push((p.key, p.value));
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(n, 4);
        assert_eq!(out, vec![(1, 7), (2, 2), (5, 1)]);
    }
}
