//! Image-to-column gather tables.
//!
//! A table turns a stride-1 convolution over a zero-padded `(C, H, W)` input
//! into a matrix product. The gather index of output position `r` and column
//! `c` (one `(channel, kernel_row, kernel_col)` triple) is
//! `rows[r] + columns[c]`, an offset into the padded input laid out
//! row-major as `(C, H + 2*pad, W + 2*pad)`.

use anyhow::{anyhow, bail, Result};
use ndarray::Array2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableGeometry {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub kernel: usize,
    pub pad: usize,
}

impl TableGeometry {
    pub fn padded_height(&self) -> usize {
        self.height + 2 * self.pad
    }

    pub fn padded_width(&self) -> usize {
        self.width + 2 * self.pad
    }

    pub fn out_height(&self) -> usize {
        self.padded_height() + 1 - self.kernel
    }

    pub fn out_width(&self) -> usize {
        self.padded_width() + 1 - self.kernel
    }

    pub fn column_count(&self) -> usize {
        self.channels * self.kernel * self.kernel
    }

    pub fn row_count(&self) -> usize {
        self.out_height() * self.out_width()
    }

    /// Number of elements in the padded input the table indexes into.
    pub fn padded_len(&self) -> usize {
        self.channels * self.padded_height() * self.padded_width()
    }

    /// `[channels, height, width, kernel, pad]`, the on-disk encoding.
    pub fn to_array(&self) -> [i64; 5] {
        [
            self.channels as i64,
            self.height as i64,
            self.width as i64,
            self.kernel as i64,
            self.pad as i64,
        ]
    }

    pub fn from_slice(values: &[i64]) -> Result<Self> {
        let [channels, height, width, kernel, pad] = values else {
            bail!("geometry must have 5 entries, found {}", values.len());
        };
        let field = |v: i64, what: &str| -> Result<usize> {
            usize::try_from(v).map_err(|_| anyhow!("geometry {what} must be non-negative, found {v}"))
        };
        let geometry = Self {
            channels: field(*channels, "channels")?,
            height: field(*height, "height")?,
            width: field(*width, "width")?,
            kernel: field(*kernel, "kernel")?,
            pad: field(*pad, "pad")?,
        };
        geometry.check()?;
        Ok(geometry)
    }

    /// After this passes, every size accessor above is free of overflow.
    fn check(&self) -> Result<()> {
        if self.channels == 0 || self.kernel == 0 {
            bail!("geometry has zero channels or kernel: {self:?}");
        }
        let overflow = || anyhow!("geometry {self:?} overflows the address space");
        let padded = |extent: usize| {
            self.pad
                .checked_mul(2)
                .and_then(|p| p.checked_add(extent))
                .ok_or_else(overflow)
        };
        let (padded_height, padded_width) = (padded(self.height)?, padded(self.width)?);
        if padded_height < self.kernel || padded_width < self.kernel {
            bail!("kernel {} does not fit the padded input {self:?}", self.kernel);
        }
        let out_height = padded_height - self.kernel + 1;
        let out_width = padded_width - self.kernel + 1;
        out_height.checked_mul(out_width).ok_or_else(overflow)?;
        self.kernel
            .checked_mul(self.kernel)
            .and_then(|k2| k2.checked_mul(self.channels))
            .ok_or_else(overflow)?;
        padded_height
            .checked_mul(padded_width)
            .and_then(|plane| plane.checked_mul(self.channels))
            .ok_or_else(overflow)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexTable {
    geometry: TableGeometry,
    columns: Vec<usize>,
    rows: Vec<usize>,
}

impl IndexTable {
    pub fn build(geometry: TableGeometry) -> Result<Self> {
        geometry.check()?;
        let k = geometry.kernel;
        let plane = geometry.padded_height() * geometry.padded_width();
        let stride = geometry.padded_width();

        let mut columns = Vec::with_capacity(geometry.column_count());
        for c in 0..geometry.channels {
            for ky in 0..k {
                for kx in 0..k {
                    columns.push(c * plane + ky * stride + kx);
                }
            }
        }

        let mut rows = Vec::with_capacity(geometry.row_count());
        for oy in 0..geometry.out_height() {
            for ox in 0..geometry.out_width() {
                rows.push(oy * stride + ox);
            }
        }

        Ok(Self {
            geometry,
            columns,
            rows,
        })
    }

    /// Validate a table read from disk; every gather must stay inside the
    /// padded input.
    pub fn from_raw(geometry: TableGeometry, columns: &[i64], rows: &[i64]) -> Result<Self> {
        geometry.check()?;
        if columns.len() != geometry.column_count() {
            bail!(
                "expected {} column offsets, found {}",
                geometry.column_count(),
                columns.len()
            );
        }
        if rows.len() != geometry.row_count() {
            bail!(
                "expected {} row offsets, found {}",
                geometry.row_count(),
                rows.len()
            );
        }
        let to_offsets = |values: &[i64], what: &str| -> Result<Vec<usize>> {
            values
                .iter()
                .map(|&v| {
                    usize::try_from(v).map_err(|_| anyhow!("negative {what} offset {v}"))
                })
                .collect()
        };
        let columns = to_offsets(columns, "column")?;
        let rows = to_offsets(rows, "row")?;

        let max_col = columns.iter().copied().max().unwrap_or(0);
        let max_row = rows.iter().copied().max().unwrap_or(0);
        let reach = max_col.saturating_add(max_row);
        if reach >= geometry.padded_len() {
            bail!(
                "gather offset {reach} exceeds padded input of {} elements",
                geometry.padded_len()
            );
        }

        Ok(Self {
            geometry,
            columns,
            rows,
        })
    }

    pub fn geometry(&self) -> &TableGeometry {
        &self.geometry
    }

    pub fn columns(&self) -> &[usize] {
        &self.columns
    }

    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    /// Gather output positions `start..end` into a `(end - start, columns)`
    /// matrix.
    pub fn gather(&self, padded: &[f32], start: usize, end: usize) -> Array2<f32> {
        let mut matrix = Array2::<f32>::zeros((end - start, self.columns.len()));
        for (mut row, &base) in matrix.rows_mut().into_iter().zip(&self.rows[start..end]) {
            for (dst, &offset) in row.iter_mut().zip(&self.columns) {
                *dst = padded[base + offset];
            }
        }
        matrix
    }

    pub(crate) fn columns_i64(&self) -> Vec<i64> {
        self.columns.iter().map(|&v| v as i64).collect()
    }

    pub(crate) fn rows_i64(&self) -> Vec<i64> {
        self.rows.iter().map(|&v| v as i64).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(channels: usize, height: usize, width: usize) -> TableGeometry {
        TableGeometry {
            channels,
            height,
            width,
            kernel: 3,
            pad: 1,
        }
    }

    #[test]
    fn same_padding_preserves_spatial_size() {
        let g = geometry(2, 5, 7);
        assert_eq!(g.out_height(), 5);
        assert_eq!(g.out_width(), 7);
        assert_eq!(g.column_count(), 18);
        assert_eq!(g.row_count(), 35);
        assert_eq!(g.padded_len(), 2 * 7 * 9);
    }

    #[test]
    fn build_encodes_channel_row_column_offsets() {
        let table = IndexTable::build(geometry(2, 4, 4)).expect("table");
        // padded plane is 6x6
        assert_eq!(table.columns()[0], 0);
        assert_eq!(table.columns()[1], 1);
        assert_eq!(table.columns()[3], 6);
        assert_eq!(table.columns()[9], 36);
        assert_eq!(table.rows()[5], 6 + 1);
        assert_eq!(table.rows()[5] + table.columns()[4], 7 + 7);
        assert_eq!(table.columns().len(), 18);
    }

    #[test]
    fn gather_reads_zero_border_for_edge_positions() {
        let g = TableGeometry {
            channels: 1,
            height: 2,
            width: 2,
            kernel: 3,
            pad: 1,
        };
        let table = IndexTable::build(g).expect("table");
        // padded 4x4 with the 2x2 image [[1,2],[3,4]] in the middle
        let padded = vec![
            0.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, 2.0, 0.0, //
            0.0, 3.0, 4.0, 0.0, //
            0.0, 0.0, 0.0, 0.0,
        ];
        let matrix = table.gather(&padded, 0, 4);
        assert_eq!(matrix.dim(), (4, 9));
        assert_eq!(
            matrix.row(0).to_vec(),
            vec![0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 0.0, 3.0, 4.0]
        );
        assert_eq!(
            matrix.row(3).to_vec(),
            vec![1.0, 2.0, 0.0, 3.0, 4.0, 0.0, 0.0, 0.0, 0.0]
        );
    }

    #[test]
    fn from_raw_accepts_built_tables() {
        let table = IndexTable::build(geometry(3, 6, 5)).expect("table");
        let restored = IndexTable::from_raw(
            *table.geometry(),
            &table.columns_i64(),
            &table.rows_i64(),
        )
        .expect("restore");
        assert_eq!(restored, table);
    }

    #[test]
    fn from_raw_rejects_out_of_bounds_offsets() {
        let g = geometry(1, 3, 3);
        let table = IndexTable::build(g).expect("table");
        let mut rows = table.rows_i64();
        *rows.last_mut().expect("rows") = 1_000;
        let err = IndexTable::from_raw(g, &table.columns_i64(), &rows).unwrap_err();
        assert!(err.to_string().contains("exceeds padded input"));
    }

    #[test]
    fn from_raw_rejects_wrong_lengths_and_negatives() {
        let g = geometry(1, 3, 3);
        let table = IndexTable::build(g).expect("table");
        assert!(IndexTable::from_raw(g, &table.columns_i64()[1..], &table.rows_i64()).is_err());
        let mut columns = table.columns_i64();
        columns[0] = -1;
        assert!(IndexTable::from_raw(g, &columns, &table.rows_i64()).is_err());
    }

    #[test]
    fn geometry_roundtrips_through_array_encoding() {
        let g = geometry(64, 2020, 2020);
        assert_eq!(TableGeometry::from_slice(&g.to_array()).expect("geometry"), g);
        assert!(TableGeometry::from_slice(&[1, 2, 3]).is_err());
        assert!(TableGeometry::from_slice(&[1, 2, 3, -3, 1]).is_err());
    }

    #[test]
    fn hostile_geometry_is_an_error_not_a_panic() {
        let huge = i64::MAX;
        for values in [
            [1, 4, 4, 3, huge],
            [1, huge, 4, 3, 1],
            [huge, huge, huge, 3, 1],
            [1, 4, 4, huge, 1],
        ] {
            assert!(TableGeometry::from_slice(&values).is_err(), "{values:?}");
        }
        let err = TableGeometry::from_slice(&[1, 2, 3, 3, -1]).unwrap_err();
        assert!(err.to_string().contains("pad must be non-negative"));
    }

    #[test]
    fn from_raw_rejects_offsets_that_overflow_when_summed() {
        let g = geometry(1, 3, 3);
        let table = IndexTable::build(g).expect("table");
        let mut rows = table.rows_i64();
        let mut columns = table.columns_i64();
        rows[0] = i64::MAX;
        columns[0] = i64::MAX;
        let err = IndexTable::from_raw(g, &columns, &rows).unwrap_err();
        assert!(err.to_string().contains("exceeds padded input"));
    }
}
