//! Binary matrix and vector files.
//!
//! Layout (all integers 32-bit big-endian):
//!
//! ```text
//! matrix: cookie=1211216 rows cols nnz | row lengths[rows] | column indices[nnz] | values[nnz]
//! vector: cookie=1211214 n             | values[n]
//! ```
//!
//! Values are big-endian `f64` or `f32` depending on [`NumericKind`].
//! [`load_dist_block_matrix`] reads a whole matrix on every process and keeps the
//! locally owned rows, padding the matrix with unit diagonal rows when its size
//! is not a multiple of the block size.

use crate::core::traits::{InsertMode, Scalar};
use crate::error::KError;
use crate::matrix::{DistBlockMatrix, Layout, Prealloc};
use crate::parallel::Comm;
use crate::utils::events::Event;
use std::io::{Read, Write};
use tracing::debug;

pub const MAT_FILE_COOKIE: i32 = 1_211_216;
pub const VEC_FILE_COOKIE: i32 = 1_211_214;

/// Largest element count reserved up front from a header; longer arrays grow as they are read.
const MAX_PREALLOC: usize = 1 << 16;

/// On-disk scalar width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NumericKind {
    #[default]
    F64,
    F32,
}

/// A matrix in compressed-row form, as stored on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct CsrImage<T> {
    pub rows: usize,
    pub cols: usize,
    pub row_lengths: Vec<usize>,
    pub col_indices: Vec<usize>,
    pub values: Vec<T>,
}

impl<T: Scalar> CsrImage<T> {
    pub fn nnz(&self) -> usize {
        self.col_indices.len()
    }

    /// Offsets of each row into `col_indices`/`values`, `rows + 1` entries.
    pub fn row_starts(&self) -> Vec<usize> {
        let mut starts = Vec::with_capacity(self.rows + 1);
        let mut acc = 0;
        starts.push(0);
        for &len in &self.row_lengths {
            acc += len;
            starts.push(acc);
        }
        starts
    }

    fn validate(&self) -> Result<(), KError> {
        if self.row_lengths.len() != self.rows {
            return Err(format_err(format!("{} row lengths for {} rows", self.row_lengths.len(), self.rows)));
        }
        let total: usize = self.row_lengths.iter().sum();
        if total != self.nnz() || self.values.len() != self.nnz() {
            return Err(format_err(format!(
                "row lengths sum to {total}, {} column indices, {} values",
                self.nnz(),
                self.values.len()
            )));
        }
        if let Some(&bad) = self.col_indices.iter().find(|&&c| c >= self.cols) {
            return Err(format_err(format!("column index {bad} beyond {} columns", self.cols)));
        }
        Ok(())
    }

    /// Append unit diagonal rows until the size is a multiple of `bs`.
    /// Returns the number of rows added.
    pub fn pad_to_block_size(&mut self, bs: usize) -> usize {
        let bs = bs.max(1);
        let extra = (bs - self.rows % bs) % bs;
        for k in 0..extra {
            self.row_lengths.push(1);
            self.col_indices.push(self.cols + k);
            self.values.push(T::one());
        }
        self.rows += extra;
        self.cols += extra;
        extra
    }
}

fn format_err(msg: impl Into<String>) -> KError {
    KError::Format(msg.into())
}

fn read_i32<R: Read>(r: &mut R) -> Result<i32, KError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_be_bytes(buf))
}

fn read_count<R: Read>(r: &mut R, what: &str) -> Result<usize, KError> {
    let v = read_i32(r)?;
    usize::try_from(v).map_err(|_| format_err(format!("negative {what}: {v}")))
}

fn read_counts<R: Read>(r: &mut R, n: usize, what: &str) -> Result<Vec<usize>, KError> {
    let mut out = Vec::with_capacity(n.min(MAX_PREALLOC));
    for _ in 0..n {
        out.push(read_count(r, what)?);
    }
    Ok(out)
}

fn read_scalars<T: Scalar, R: Read>(r: &mut R, n: usize, kind: NumericKind) -> Result<Vec<T>, KError> {
    let mut out = Vec::with_capacity(n.min(MAX_PREALLOC));
    for _ in 0..n {
        let v = match kind {
            NumericKind::F64 => {
                let mut buf = [0u8; 8];
                r.read_exact(&mut buf)?;
                f64::from_be_bytes(buf)
            }
            NumericKind::F32 => {
                let mut buf = [0u8; 4];
                r.read_exact(&mut buf)?;
                f64::from(f32::from_be_bytes(buf))
            }
        };
        out.push(T::from_wire(v));
    }
    Ok(out)
}

fn write_i32<W: Write>(w: &mut W, v: usize) -> Result<(), KError> {
    let v = i32::try_from(v).map_err(|_| format_err(format!("{v} does not fit a 32-bit integer")))?;
    w.write_all(&v.to_be_bytes())?;
    Ok(())
}

fn write_scalars<T: Scalar, W: Write>(w: &mut W, values: &[T], kind: NumericKind) -> Result<(), KError> {
    for &v in values {
        match kind {
            NumericKind::F64 => w.write_all(&v.to_wire().to_be_bytes())?,
            NumericKind::F32 => w.write_all(&(v.to_wire() as f32).to_be_bytes())?,
        }
    }
    Ok(())
}

fn expect_cookie<R: Read>(r: &mut R, cookie: i32, what: &str) -> Result<(), KError> {
    let found = read_i32(r)?;
    if found != cookie {
        return Err(format_err(format!("not a {what} file (cookie {found}, expected {cookie})")));
    }
    Ok(())
}

pub fn read_matrix<T: Scalar, R: Read>(r: &mut R, kind: NumericKind) -> Result<CsrImage<T>, KError> {
    expect_cookie(r, MAT_FILE_COOKIE, "matrix")?;
    let rows = read_count(r, "row count")?;
    let cols = read_count(r, "column count")?;
    let nnz = read_count(r, "nonzero count")?;
    let row_lengths = read_counts(r, rows, "row length")?;
    let col_indices = read_counts(r, nnz, "column index")?;
    let values = read_scalars(r, nnz, kind)?;
    let image = CsrImage { rows, cols, row_lengths, col_indices, values };
    image.validate()?;
    Ok(image)
}

pub fn write_matrix<T: Scalar, W: Write>(w: &mut W, image: &CsrImage<T>, kind: NumericKind) -> Result<(), KError> {
    image.validate()?;
    w.write_all(&MAT_FILE_COOKIE.to_be_bytes())?;
    for v in [image.rows, image.cols, image.nnz()] {
        write_i32(w, v)?;
    }
    for &len in &image.row_lengths {
        write_i32(w, len)?;
    }
    for &c in &image.col_indices {
        write_i32(w, c)?;
    }
    write_scalars(w, &image.values, kind)
}

pub fn read_vector<T: Scalar, R: Read>(r: &mut R, kind: NumericKind) -> Result<Vec<T>, KError> {
    expect_cookie(r, VEC_FILE_COOKIE, "vector")?;
    let n = read_count(r, "vector length")?;
    read_scalars(r, n, kind)
}

pub fn write_vector<T: Scalar, W: Write>(w: &mut W, values: &[T], kind: NumericKind) -> Result<(), KError> {
    w.write_all(&VEC_FILE_COOKIE.to_be_bytes())?;
    write_i32(w, values.len())?;
    write_scalars(w, values, kind)
}

/// Read a whole vector and keep the entries of `layout`'s local range,
/// padding with zeros up to the layout's global size.
pub fn load_local_vector<T: Scalar, R: Read>(r: &mut R, kind: NumericKind, layout: &Layout) -> Result<Vec<T>, KError> {
    let mut all = read_vector::<T, R>(r, kind)?;
    if all.len() > layout.global_size() {
        return Err(KError::DimensionMismatch { expected: layout.global_size(), got: all.len() });
    }
    all.resize(layout.global_size(), T::zero());
    Ok(all[layout.point_range()].to_vec())
}

/// Load a square matrix into a [`DistBlockMatrix`] with block size `bs` (collective).
///
/// Every process reads the full stream and inserts its own rows; the stores
/// are preallocated exactly from the row structure.
pub fn load_dist_block_matrix<T: Scalar, C: Comm, R: Read>(
    r: &mut R,
    kind: NumericKind,
    comm: C,
    bs: usize,
) -> Result<DistBlockMatrix<T, C>, KError> {
    let _span = Event::MatLoad.span().entered();
    let mut image = read_matrix::<T, R>(r, kind)?;
    if image.rows != image.cols {
        return Err(format_err(format!("can only load square matrices, got {}x{}", image.rows, image.cols)));
    }
    let bs = bs.max(1);
    let extra = image.pad_to_block_size(bs);
    if extra > 0 && comm.rank() == 0 {
        debug!(extra, bs, "padding loaded matrix to match block size");
    }

    let n = image.rows;
    let mut mat = DistBlockMatrix::new(comm, bs, n, n)?;
    let rows = mat.row_layout().clone();
    let cols = mat.col_layout().clone();
    let starts = image.row_starts();

    // distinct block columns per local block row, split by ownership
    let mut d_nz = Vec::with_capacity(rows.local_blocks());
    let mut o_nz = Vec::with_capacity(rows.local_blocks());
    for brow in rows.start()..rows.end() {
        let mut bcols: Vec<usize> = (brow * bs..(brow + 1) * bs)
            .flat_map(|row| image.col_indices[starts[row]..starts[row + 1]].iter().map(|&c| c / bs))
            .collect();
        bcols.sort_unstable();
        bcols.dedup();
        let diag = bcols.iter().filter(|&&bc| cols.owns_block(bc)).count();
        d_nz.push(diag);
        o_nz.push(bcols.len() - diag);
    }
    mat.preallocate(Prealloc::PerRow(d_nz), Prealloc::PerRow(o_nz))?;

    for row in rows.point_range() {
        let span = starts[row]..starts[row + 1];
        if span.is_empty() {
            continue;
        }
        mat.set_values(&[row], &image.col_indices[span.clone()], &image.values[span], InsertMode::Insert)?;
    }
    mat.assemble()?;
    Ok(mat)
}
