//! Cauchy Reed-Solomon erasure codec over GF(256).
//!
//! A codec for `d` data shards and `p` parity shards computes each parity
//! shard as a linear combination of the data shards, with coefficients drawn
//! from a normalized Cauchy matrix:
//!
//! ```text
//!   c_ij = (y_j + x_0) / (x_i + y_j)
//! ```
//!
//! where `y_j = j` labels data columns, `x_i = d + i` labels parity rows and
//! `x_0 = d`. Every square submatrix of a Cauchy matrix is invertible, so
//! any `d` of the `d + p` shards suffice to rebuild the rest.

use crate::gf::{mul_mem, mul_mem_inplace, muladd_mem, xor_mem, Gf256};
use crate::Error;

/// One row of a codeword handed to [`Codec::reconstruct`].
#[derive(Debug)]
pub struct ShardMut<'a> {
    /// Payload region; equal length across the block.
    pub data: &'a mut [u8],
    /// True when the region holds bytes received off the wire. A data row
    /// with `present = false` is a zero-filled destination to rebuild into.
    pub present: bool,
}

/// Erasure codec for a fixed (data, parity) geometry.
#[derive(Debug, Clone)]
pub struct Codec {
    data_shards: usize,
    parity_shards: usize,
}

impl Codec {
    /// Create a codec for `data_shards` + `parity_shards` shard blocks.
    ///
    /// Shard counts must be non-zero and sum to at most 256 (the field has
    /// only 256 distinct row/column labels).
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self, Error> {
        if data_shards == 0 || parity_shards == 0 || data_shards + parity_shards > 256 {
            return Err(Error::InvalidParams);
        }
        Ok(Self {
            data_shards,
            parity_shards,
        })
    }

    /// Number of data shards per block.
    #[inline]
    pub fn data_shards(&self) -> usize {
        self.data_shards
    }

    /// Number of parity shards per block.
    #[inline]
    pub fn parity_shards(&self) -> usize {
        self.parity_shards
    }

    /// Matrix coefficient for parity row `i`, data column `j`.
    #[inline]
    fn coeff(&self, i: usize, j: usize) -> Gf256 {
        let x_0 = Gf256(self.data_shards as u8);
        let x_i = Gf256((self.data_shards + i) as u8);
        let y_j = Gf256(j as u8);
        (y_j + x_0) / (x_i + y_j)
    }

    /// Fill `parity` from `data`.
    ///
    /// All shards must share one length. The first parity row reduces to a
    /// plain XOR of the data shards (the normalization makes row zero all
    /// ones), so it goes through the wide XOR path.
    pub fn encode(&self, data: &[&[u8]], parity: &mut [&mut [u8]]) -> Result<(), Error> {
        if data.len() != self.data_shards || parity.len() != self.parity_shards {
            return Err(Error::InvalidParams);
        }

        for (i, row) in parity.iter_mut().enumerate() {
            if i == 0 {
                mul_mem(row, data[0], Gf256(1));
                for d in &data[1..] {
                    xor_mem(row, d);
                }
                continue;
            }
            mul_mem(row, data[0], self.coeff(i, 0));
            for (j, d) in data.iter().enumerate().skip(1) {
                muladd_mem(row, d, self.coeff(i, j));
            }
        }
        Ok(())
    }

    /// Rebuild the missing data rows of one block in place.
    ///
    /// `shards` holds `data_shards + parity_shards` rows in block order.
    /// Absent parity rows may be `None`; absent data rows must supply a
    /// zero-filled buffer of the block length with `present = false`. Fails
    /// with [`Error::InsufficientShards`] when fewer present parity rows
    /// exist than missing data rows.
    pub fn reconstruct(&self, shards: &mut [Option<ShardMut<'_>>]) -> Result<(), Error> {
        let d = self.data_shards;
        if shards.len() != d + self.parity_shards {
            return Err(Error::InvalidParams);
        }

        let missing: Vec<usize> = (0..d)
            .filter(|&j| !matches!(&shards[j], Some(s) if s.present))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        let m = missing.len();

        let (data_rows, parity_rows) = shards.split_at_mut(d);

        // Pick the first m present parity rows to serve as equations.
        let picked: Vec<usize> = parity_rows
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match s {
                Some(sh) if sh.present => Some(i),
                _ => None,
            })
            .take(m)
            .collect();
        if picked.len() < m {
            return Err(Error::InsufficientShards);
        }

        // Eliminate the known data contributions from each equation, leaving
        //   sum over missing j of c(i, j) * data[j]
        // in the parity row.
        for &pi in &picked {
            for (j, row) in data_rows.iter().enumerate() {
                if let Some(sh) = row {
                    if sh.present {
                        if let Some(eq) = &mut parity_rows[pi] {
                            muladd_mem(eq.data, &*sh.data, self.coeff(pi, j));
                        }
                    }
                }
            }
        }

        // Solve the m x m Cauchy subsystem by Gauss-Jordan elimination.
        // `order[k]` maps equation k to its parity slot; row swaps permute
        // the map rather than the buffers.
        let mut matrix: Vec<Vec<u8>> = picked
            .iter()
            .map(|&pi| missing.iter().map(|&j| self.coeff(pi, j).0).collect())
            .collect();
        let mut order: Vec<usize> = (0..m).collect();

        for col in 0..m {
            let pivot = (col..m)
                .find(|&r| matrix[r][col] != 0)
                .ok_or(Error::InsufficientShards)?;
            matrix.swap(col, pivot);
            order.swap(col, pivot);

            let inv = Gf256(1) / Gf256(matrix[col][col]);
            for v in matrix[col].iter_mut() {
                *v = (Gf256(*v) * inv).0;
            }
            if let Some(eq) = &mut parity_rows[picked[order[col]]] {
                mul_mem_inplace(eq.data, inv);
            }

            let pivot_row = matrix[col].clone();
            for r in 0..m {
                if r == col || matrix[r][col] == 0 {
                    continue;
                }
                let factor = Gf256(matrix[r][col]);
                for c in 0..m {
                    matrix[r][c] ^= (Gf256(pivot_row[c]) * factor).0;
                }
                let (dst, src) = pair_mut(parity_rows, picked[order[r]], picked[order[col]]);
                if let (Some(dst), Some(src)) = (dst, src) {
                    muladd_mem(dst.data, &*src.data, factor);
                }
            }
        }

        // Equation k now holds the bytes of missing data row `missing[k]`.
        for (k, &j) in missing.iter().enumerate() {
            if let (Some(dst), Some(src)) = (&mut data_rows[j], &parity_rows[picked[order[k]]]) {
                dst.data.copy_from_slice(&*src.data);
                dst.present = true;
            }
        }
        Ok(())
    }
}

/// Disjoint mutable references to two elements of one slice.
fn pair_mut<T>(v: &mut [T], i: usize, j: usize) -> (&mut T, &mut T) {
    debug_assert_ne!(i, j);
    if i < j {
        let (a, b) = v.split_at_mut(j);
        (&mut a[i], &mut b[0])
    } else {
        let (a, b) = v.split_at_mut(i);
        (&mut b[0], &mut a[j])
    }
}
