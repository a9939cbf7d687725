//! Distributed block-sparse matrix (row-block partitioned, diagonal/off-diagonal split).
//!
//! Every process owns a contiguous range of block rows. Its slice is stored as
//! two [`BlockStore`]s: `diag` holds the columns of the process's own column
//! range (local numbering), `offdiag` everything else. Until the first assembly
//! the off-diagonal columns are global block columns; assembly renumbers them
//! to `0..garray.len()` and builds the [`ScatterPlan`] that gathers the remote
//! operand entries needed by `offdiag`.
//!
//! Entries for rows owned elsewhere go to a stash and travel to their owner
//! during [`assembly_begin`](DistBlockMatrix::assembly_begin) /
//! [`assembly_end`](DistBlockMatrix::assembly_end). Both calls are collective.
//!
//! Inserting a new off-diagonal column into an assembled matrix reverts
//! `offdiag` to global numbering ("disassembly"); the next assembly rebuilds
//! the numbering and the scatter plan on every process.

use super::block_store::{BlockStore, NewNonzeroPolicy};
use super::hash_index::DEFAULT_HASH_FACTOR;
use super::layout::Layout;
use super::scatter::ScatterPlan;
use super::stash::{Stash, StashExchange};
use crate::config::options::Options;
use crate::core::traits::{InsertMode, LinearOperator, MatAssembly, Scalar};
use crate::error::KError;
use crate::parallel::{Comm, ReduceOp, Tag, TagKind};
use crate::utils::events::Event;
use bitflags::bitflags;
use std::cell::{OnceCell, RefCell};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Default diagonal / off-diagonal block capacity per block row.
const DEFAULT_DIAG_NZ: usize = 5;
const DEFAULT_OFFDIAG_NZ: usize = 2;

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
    pub struct MatOption: u32 {
        /// New nonzero locations are an error.
        const NO_NEW_NONZERO_LOCATIONS     = 0b0001;
        /// New nonzero locations are silently dropped.
        const IGNORE_NEW_NONZERO_LOCATIONS = 0b0010;
        /// Entries for rows owned elsewhere are dropped instead of stashed.
        const IGNORE_OFF_PROC_ENTRIES      = 0b0100;
        /// Build hash indices at assembly end for fast re-insertion.
        const USE_HASH_TABLE               = 0b1000;
    }
}

bitflags! {
    /// Insert modes as reduced over all processes.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct InsertModeBits: u32 {
        const INSERT = 0b01;
        const ADD    = 0b10;
    }
}

impl From<InsertMode> for InsertModeBits {
    fn from(mode: InsertMode) -> Self {
        match mode {
            InsertMode::Insert => Self::INSERT,
            InsertMode::Add => Self::ADD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyState {
    Unassembled,
    StashExchanged,
    Assembled,
}

/// Block capacity hint for one of the local stores.
#[derive(Debug, Clone)]
pub enum Prealloc {
    Uniform(usize),
    /// One entry per locally owned block row.
    PerRow(Vec<usize>),
}

/// Storage and communication statistics of the local part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MatInfo {
    pub diag_blocks: usize,
    pub offdiag_blocks: usize,
    pub allocated_blocks: usize,
    pub reallocations: usize,
    pub stash_entries: usize,
    pub block_stash_entries: usize,
    pub stash_reallocations: usize,
    pub ghost_block_columns: usize,
}

/// Matrix norms computed by [`DistBlockMatrix::norm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatNorm {
    Frobenius,
    /// Largest absolute column sum.
    One,
    /// Largest absolute row sum.
    Infinity,
}

pub struct DistBlockMatrix<T, C: Comm> {
    comm: C,
    bs: usize,
    rows: Layout,
    cols: Layout,
    diag: BlockStore<T>,
    offdiag: BlockStore<T>,
    /// Global block column → compact off-diagonal index, built on first use.
    colmap: OnceCell<HashMap<usize, usize>>,
    /// Compact off-diagonal index → global block column, ascending.
    garray: Vec<usize>,
    scatter: Option<ScatterPlan>,
    ghost: RefCell<Vec<T>>,
    stash: Stash<T>,
    bstash: Stash<T>,
    insert_mode: Option<InsertMode>,
    state: AssemblyState,
    /// `offdiag` is in compact numbering and `scatter` is valid.
    was_assembled: bool,
    options: MatOption,
    hash_factor: f64,
    exchange: Option<(StashExchange, StashExchange)>,
    assembly_seq: u32,
    zero_rows_seq: u32,
}

impl<T: Scalar, C: Comm> DistBlockMatrix<T, C> {
    /// `m × n` matrix (point sizes, multiples of `bs`) with an even row and column split.
    pub fn new(comm: C, bs: usize, m: usize, n: usize) -> Result<Self, KError> {
        let bs = bs.max(1);
        for (what, len) in [("global rows", m), ("global columns", n)] {
            if len % bs != 0 {
                return Err(KError::InvalidOption { key: what.into(), value: format!("{len} not divisible by block size {bs}") });
            }
        }
        let rows = Layout::split(m / bs, bs, comm.size(), comm.rank());
        let cols = Layout::split(n / bs, bs, comm.size(), comm.rank());
        Ok(Self::with_layouts(comm, rows, cols))
    }

    /// Every process passes its own number of rows and columns (collective).
    pub fn with_local_sizes(comm: C, bs: usize, local_m: usize, local_n: usize) -> Result<Self, KError> {
        let bs = bs.max(1);
        if local_m % bs != 0 || local_n % bs != 0 {
            return Err(KError::InvalidOption {
                key: "local size".into(),
                value: format!("{local_m}x{local_n} not divisible by block size {bs}"),
            });
        }
        let rows = Layout::from_local(&comm, local_m / bs, bs)?;
        let cols = Layout::from_local(&comm, local_n / bs, bs)?;
        Ok(Self::with_layouts(comm, rows, cols))
    }

    /// Square `n × n` matrix configured from `mat_*` options.
    pub fn from_options(comm: C, n: usize, opts: &Options) -> Result<Self, KError> {
        let bs: usize = opts.get_or("mat_block_size", 1)?;
        let mut mat = Self::new(comm, bs, n, n)?;
        mat.set_hash_factor(opts.get_or("mat_hash_table_factor", DEFAULT_HASH_FACTOR)?);
        for (key, flag) in [
            ("mat_use_hash_table", MatOption::USE_HASH_TABLE),
            ("mat_ignore_off_proc_entries", MatOption::IGNORE_OFF_PROC_ENTRIES),
            ("mat_no_new_nonzero_locations", MatOption::NO_NEW_NONZERO_LOCATIONS),
        ] {
            if opts.get_flag(key)? {
                mat.set_option(flag, true);
            }
        }
        Ok(mat)
    }

    fn with_layouts(comm: C, rows: Layout, cols: Layout) -> Self {
        let bs = rows.block_size();
        let mbs = rows.local_blocks();
        Self {
            diag: BlockStore::new(mbs, cols.local_blocks(), bs, DEFAULT_DIAG_NZ),
            offdiag: BlockStore::new(mbs, cols.global_blocks(), bs, DEFAULT_OFFDIAG_NZ),
            comm,
            bs,
            rows,
            cols,
            colmap: OnceCell::new(),
            garray: Vec::new(),
            scatter: None,
            ghost: RefCell::new(Vec::new()),
            stash: Stash::new(1, 0),
            bstash: Stash::new(bs * bs, 0),
            insert_mode: None,
            state: AssemblyState::Unassembled,
            was_assembled: false,
            options: MatOption::empty(),
            hash_factor: DEFAULT_HASH_FACTOR,
            exchange: None,
            assembly_seq: 0,
            zero_rows_seq: 0,
        }
    }

    /// Reserve block capacity in both stores. Discards all entries.
    pub fn preallocate(&mut self, d: Prealloc, o: Prealloc) -> Result<(), KError> {
        let mbs = self.rows.local_blocks();
        let caps = |p: Prealloc| -> Result<Vec<usize>, KError> {
            match p {
                Prealloc::Uniform(nz) => Ok(vec![nz; mbs]),
                Prealloc::PerRow(v) if v.len() == mbs => Ok(v),
                Prealloc::PerRow(v) => Err(KError::DimensionMismatch { expected: mbs, got: v.len() }),
            }
        };
        self.diag = BlockStore::with_row_capacity(self.cols.local_blocks(), self.bs, &caps(d)?);
        self.offdiag = BlockStore::with_row_capacity(self.cols.global_blocks(), self.bs, &caps(o)?);
        self.garray.clear();
        self.colmap = OnceCell::new();
        self.scatter = None;
        self.was_assembled = false;
        self.state = AssemblyState::Unassembled;
        self.apply_policy();
        Ok(())
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    pub fn block_size(&self) -> usize {
        self.bs
    }

    pub fn row_layout(&self) -> &Layout {
        &self.rows
    }

    pub fn col_layout(&self) -> &Layout {
        &self.cols
    }

    pub fn state(&self) -> AssemblyState {
        self.state
    }

    pub fn is_assembled(&self) -> bool {
        self.state == AssemblyState::Assembled
    }

    /// Global block columns referenced by the off-diagonal store (valid after assembly).
    pub fn garray(&self) -> &[usize] {
        &self.garray
    }

    pub fn diag_store(&self) -> &BlockStore<T> {
        &self.diag
    }

    pub fn offdiag_store(&self) -> &BlockStore<T> {
        &self.offdiag
    }

    pub fn options(&self) -> MatOption {
        self.options
    }

    pub fn set_option(&mut self, flags: MatOption, on: bool) {
        self.options.set(flags, on);
        self.apply_policy();
    }

    /// Hash table capacity as a multiple of the nonzero block count.
    pub fn set_hash_factor(&mut self, factor: f64) {
        self.hash_factor = if factor >= 1.0 { factor } else { DEFAULT_HASH_FACTOR };
    }

    fn apply_policy(&mut self) {
        let policy = if self.options.contains(MatOption::NO_NEW_NONZERO_LOCATIONS) {
            NewNonzeroPolicy::Error
        } else if self.options.contains(MatOption::IGNORE_NEW_NONZERO_LOCATIONS) {
            NewNonzeroPolicy::Ignore
        } else {
            NewNonzeroPolicy::Allow
        };
        self.diag.set_policy(policy);
        self.offdiag.set_policy(policy);
    }

    pub fn info(&self) -> MatInfo {
        MatInfo {
            diag_blocks: self.diag.nonzero_blocks(),
            offdiag_blocks: self.offdiag.nonzero_blocks(),
            allocated_blocks: self.diag.allocated_blocks() + self.offdiag.allocated_blocks(),
            reallocations: self.diag.reallocations() + self.offdiag.reallocations(),
            stash_entries: self.stash.len(),
            block_stash_entries: self.bstash.len(),
            stash_reallocations: self.stash.reallocations() + self.bstash.reallocations(),
            ghost_block_columns: self.garray.len(),
        }
    }

    fn begin_insertion(&mut self, mode: InsertMode) -> Result<(), KError> {
        match self.state {
            AssemblyState::StashExchanged => return Err(KError::WrongState("values set between assembly begin and end")),
            AssemblyState::Assembled => self.state = AssemblyState::Unassembled,
            AssemblyState::Unassembled => {}
        }
        match self.insert_mode {
            Some(m) if m != mode => Err(KError::MixedInsertModes),
            _ => {
                self.insert_mode = Some(mode);
                Ok(())
            }
        }
    }

    fn check_global(&self, row: usize, col: usize) -> Result<(), KError> {
        if row >= self.rows.global_size() {
            return Err(KError::OutOfRange { what: "row", index: row, bound: self.rows.global_size() });
        }
        if col >= self.cols.global_size() {
            return Err(KError::OutOfRange { what: "column", index: col, bound: self.cols.global_size() });
        }
        Ok(())
    }

    fn compact_col(&self, bcol: usize) -> Option<usize> {
        let colmap = self
            .colmap
            .get_or_init(|| self.garray.iter().enumerate().map(|(k, &g)| (g, k)).collect());
        colmap.get(&bcol).copied()
    }

    /// Off-diagonal store column for a global block column; `None` drops the value.
    fn offdiag_block_col(&mut self, grow: usize, bcol: usize) -> Result<Option<usize>, KError> {
        if !self.was_assembled {
            return Ok(Some(bcol));
        }
        if let Some(k) = self.compact_col(bcol) {
            return Ok(Some(k));
        }
        match self.offdiag.policy() {
            NewNonzeroPolicy::Allow => {
                self.disassemble();
                Ok(Some(bcol))
            }
            NewNonzeroPolicy::Ignore => Ok(None),
            NewNonzeroPolicy::Error => Err(KError::NewNonzeroDisallowed { row: grow, col: bcol * self.bs }),
        }
    }

    /// Revert `offdiag` to global block columns and drop the scatter plan.
    fn disassemble(&mut self) {
        if !self.was_assembled {
            return;
        }
        let garray = std::mem::take(&mut self.garray);
        self.offdiag.remap_columns(|k| garray[k], self.cols.global_blocks());
        self.colmap = OnceCell::new();
        self.scatter = None;
        self.ghost.borrow_mut().clear();
        self.was_assembled = false;
        warn!(
            rank = self.comm.rank(),
            ghost_columns = garray.len(),
            "off-diagonal structure changed after assembly; matrix disassembled, scatter will be rebuilt"
        );
    }

    /// Store one row of point values into the local stores.
    fn insert_local_row(&mut self, row: usize, cols: &[usize], vals: &[T], mode: InsertMode) -> Result<(), KError> {
        let bs = self.bs;
        if !self.rows.owns_block(row / bs) {
            return Err(KError::OutOfRange { what: "local row", index: row, bound: self.rows.end() * bs });
        }
        let lrow = row - self.rows.start() * bs;
        let cstart = self.cols.start() * bs;
        for (&col, &v) in cols.iter().zip(vals) {
            self.check_global(row, col)?;
            let bcol = col / bs;
            if self.cols.owns_block(bcol) {
                self.diag
                    .set_value(lrow, col - cstart, v, mode)
                    .map_err(|e| relabel(e, row, col))?;
            } else if let Some(k) = self.offdiag_block_col(row, bcol)? {
                self.offdiag
                    .set_value(lrow, k * bs + col % bs, v, mode)
                    .map_err(|e| relabel(e, row, col))?;
            }
        }
        Ok(())
    }

    /// Store one block row of `bs × bs` blocks into the local stores.
    fn insert_local_block_row(&mut self, brow: usize, bcols: &[usize], blocks: &[T], mode: InsertMode) -> Result<(), KError> {
        let bs = self.bs;
        let bs2 = bs * bs;
        if !self.rows.owns_block(brow) {
            return Err(KError::OutOfRange { what: "local block row", index: brow, bound: self.rows.end() });
        }
        let lbrow = brow - self.rows.start();
        for (j, &bcol) in bcols.iter().enumerate() {
            self.check_global(brow * bs, bcol * bs)?;
            let block = &blocks[j * bs2..(j + 1) * bs2];
            if self.cols.owns_block(bcol) {
                self.diag
                    .set_block(lbrow, bcol - self.cols.start(), block, mode)
                    .map_err(|e| relabel(e, brow * bs, bcol * bs))?;
            } else if let Some(k) = self.offdiag_block_col(brow * bs, bcol)? {
                self.offdiag
                    .set_block(lbrow, k, block, mode)
                    .map_err(|e| relabel(e, brow * bs, bcol * bs))?;
            }
        }
        Ok(())
    }

    /// Insert a row-oriented `rows.len() × cols.len()` patch (global point indices).
    ///
    /// Rows owned by another process are stashed until the next assembly.
    pub fn set_values(&mut self, rows: &[usize], cols: &[usize], values: &[T], mode: InsertMode) -> Result<(), KError> {
        let _span = Event::MatSetValues.span().entered();
        let n = cols.len();
        if values.len() != rows.len() * n {
            return Err(KError::DimensionMismatch { expected: rows.len() * n, got: values.len() });
        }
        self.begin_insertion(mode)?;
        for (i, &row) in rows.iter().enumerate() {
            let vals = &values[i * n..(i + 1) * n];
            if row >= self.rows.global_size() {
                return Err(KError::OutOfRange { what: "row", index: row, bound: self.rows.global_size() });
            }
            if self.rows.owns_block(row / self.bs) {
                self.insert_local_row(row, cols, vals, mode)?;
            } else if !self.options.contains(MatOption::IGNORE_OFF_PROC_ENTRIES) {
                for (&col, &v) in cols.iter().zip(vals) {
                    self.check_global(row, col)?;
                    self.stash.push(row, col, &[v])?;
                }
            }
        }
        Ok(())
    }

    /// Insert whole blocks (global block indices).
    ///
    /// `values` holds `brows.len() × bcols.len()` blocks one after another,
    /// each `bs × bs` row-major.
    pub fn set_values_blocked(&mut self, brows: &[usize], bcols: &[usize], values: &[T], mode: InsertMode) -> Result<(), KError> {
        let _span = Event::MatSetValues.span().entered();
        let bs2 = self.bs * self.bs;
        let row_len = bcols.len() * bs2;
        if values.len() != brows.len() * row_len {
            return Err(KError::DimensionMismatch { expected: brows.len() * row_len, got: values.len() });
        }
        self.begin_insertion(mode)?;
        for (i, &brow) in brows.iter().enumerate() {
            let blocks = &values[i * row_len..(i + 1) * row_len];
            if brow >= self.rows.global_blocks() {
                return Err(KError::OutOfRange { what: "block row", index: brow, bound: self.rows.global_blocks() });
            }
            if self.rows.owns_block(brow) {
                self.insert_local_block_row(brow, bcols, blocks, mode)?;
            } else if !self.options.contains(MatOption::IGNORE_OFF_PROC_ENTRIES) {
                for (j, &bcol) in bcols.iter().enumerate() {
                    self.check_global(brow * self.bs, bcol * self.bs)?;
                    self.bstash.push(brow, bcol, &blocks[j * bs2..(j + 1) * bs2])?;
                }
            }
        }
        Ok(())
    }

    /// Read a row-oriented patch. Only locally owned rows can be read.
    pub fn get_values(&self, rows: &[usize], cols: &[usize], values: &mut [T]) -> Result<(), KError> {
        let n = cols.len();
        if values.len() != rows.len() * n {
            return Err(KError::DimensionMismatch { expected: rows.len() * n, got: values.len() });
        }
        let bs = self.bs;
        for (i, &row) in rows.iter().enumerate() {
            if row < self.rows.global_size() && !self.rows.owns_block(row / bs) {
                return Err(KError::Unsupported("reading values of rows owned by another process"));
            }
            let lrow = row.saturating_sub(self.rows.start() * bs);
            for (j, &col) in cols.iter().enumerate() {
                self.check_global(row, col)?;
                let bcol = col / bs;
                values[i * n + j] = if self.cols.owns_block(bcol) {
                    self.diag.get_value(lrow, col - self.cols.start() * bs)?
                } else if self.was_assembled {
                    match self.compact_col(bcol) {
                        Some(k) => self.offdiag.get_value(lrow, k * bs + col % bs)?,
                        None => T::zero(),
                    }
                } else {
                    self.offdiag.get_value(lrow, col)?
                };
            }
        }
        Ok(())
    }

    /// Agree on the insert mode and start shipping stashed entries (collective).
    pub fn assembly_begin(&mut self) -> Result<(), KError> {
        let _span = Event::MatAssemblyBegin.span().entered();
        if self.state == AssemblyState::StashExchanged {
            return Err(KError::WrongState("assembly already begun"));
        }
        self.state = AssemblyState::StashExchanged;
        if self.options.contains(MatOption::IGNORE_OFF_PROC_ENTRIES) {
            return Ok(());
        }
        let mine = self.insert_mode.map_or(0, |m| InsertModeBits::from(m).bits());
        let agreed = InsertModeBits::from_bits_truncate(self.comm.all_reduce_bor(mine)?);
        if agreed.is_all() {
            return Err(KError::MixedInsertModes);
        }
        self.insert_mode = if agreed.contains(InsertModeBits::ADD) {
            Some(InsertMode::Add)
        } else if agreed.contains(InsertModeBits::INSERT) {
            Some(InsertMode::Insert)
        } else {
            None
        };

        let seq = self.assembly_seq;
        self.assembly_seq = self.assembly_seq.wrapping_add(1);
        let bs = self.bs;
        let rows = &self.rows;
        let point = self
            .stash
            .scatter_begin(&self.comm, Tag::new(TagKind::Stash, seq), |r| rows.owner_of_block(r / bs))?;
        let block = self
            .bstash
            .scatter_begin(&self.comm, Tag::new(TagKind::BlockStash, seq), |br| rows.owner_of_block(br))?;
        self.exchange = Some((point, block));
        Ok(())
    }

    /// Receive stashed entries, compact, and (re)build the multiply plan (collective).
    pub fn assembly_end(&mut self) -> Result<(), KError> {
        let _span = Event::MatAssemblyEnd.span().entered();
        if self.state != AssemblyState::StashExchanged {
            return Err(KError::WrongState("assembly_end without assembly_begin"));
        }
        if let Some((mut point, mut block)) = self.exchange.take() {
            let mode = self.insert_mode.unwrap_or(InsertMode::Insert);
            while let Some(msg) = point.next_message::<C, T>(&self.comm)? {
                for (row, run) in msg.row_runs() {
                    self.insert_local_row(row, &msg.cols[run.clone()], msg.values(run), mode)?;
                }
            }
            while let Some(msg) = block.next_message::<C, T>(&self.comm)? {
                for (brow, run) in msg.row_runs() {
                    self.insert_local_block_row(brow, &msg.cols[run.clone()], msg.values(run), mode)?;
                }
            }
            point.finish(&self.comm)?;
            block.finish(&self.comm)?;
        }

        self.diag.compact();
        // a process that disassembled forces everyone to rebuild the scatter plan
        let all_assembled = self.comm.all_reduce_and(self.was_assembled)?;
        if self.was_assembled && !all_assembled {
            self.disassemble();
        }
        if !self.was_assembled {
            self.set_up_multiply()?;
        }
        self.offdiag.compact();
        if self.options.contains(MatOption::USE_HASH_TABLE) {
            self.diag.build_hash(self.hash_factor);
            self.offdiag.build_hash(self.hash_factor);
        }
        self.insert_mode = None;
        self.state = AssemblyState::Assembled;
        debug!(
            rank = self.comm.rank(),
            diag_blocks = self.diag.nonzero_blocks(),
            offdiag_blocks = self.offdiag.nonzero_blocks(),
            ghosts = self.garray.len(),
            reallocs = self.diag.reallocations() + self.offdiag.reallocations(),
            "assembly complete"
        );
        Ok(())
    }

    pub fn assemble(&mut self) -> Result<(), KError> {
        self.assembly_begin()?;
        self.assembly_end()
    }

    /// Renumber off-diagonal columns compactly and build the scatter plan (collective).
    fn set_up_multiply(&mut self) -> Result<(), KError> {
        let garray = self.offdiag.used_columns();
        self.offdiag
            .remap_columns(|g| garray.partition_point(|&c| c < g), garray.len());
        let plan = ScatterPlan::build(&self.comm, &garray, &self.cols, self.assembly_seq)?;
        self.ghost = RefCell::new(vec![T::zero(); plan.ghost_len()]);
        self.garray = garray;
        self.colmap = OnceCell::new();
        self.scatter = Some(plan);
        self.was_assembled = true;
        Ok(())
    }

    fn plan(&self) -> Result<&ScatterPlan, KError> {
        if self.state != AssemblyState::Assembled {
            return Err(KError::WrongState("matrix is not assembled"));
        }
        self.scatter.as_ref().ok_or(KError::WrongState("matrix has no scatter plan"))
    }

    fn check_lengths(&self, x: usize, xlen: usize, y: usize, ylen: usize) -> Result<(), KError> {
        if xlen != x {
            return Err(KError::DimensionMismatch { expected: x, got: xlen });
        }
        if ylen != y {
            return Err(KError::DimensionMismatch { expected: y, got: ylen });
        }
        Ok(())
    }

    /// y ← A x (collective). The remote gather overlaps the diagonal product.
    pub fn multiply(&self, x: &[T], y: &mut [T]) -> Result<(), KError> {
        let _span = Event::MatMult.span().entered();
        self.check_lengths(self.cols.local_size(), x.len(), self.rows.local_size(), y.len())?;
        let plan = self.plan()?;
        let handle = plan.gather_begin(&self.comm, x)?;
        y.fill(T::zero());
        self.diag.mult_add_into(x, y);
        let mut ghost = self.ghost.borrow_mut();
        plan.gather_end(&self.comm, handle, &mut ghost)?;
        self.offdiag.mult_add_into(&ghost, y);
        Ok(())
    }

    /// z ← y + A x (collective).
    pub fn multiply_add(&self, x: &[T], y: &[T], z: &mut [T]) -> Result<(), KError> {
        let _span = Event::MatMultAdd.span().entered();
        self.check_lengths(self.cols.local_size(), x.len(), self.rows.local_size(), y.len())?;
        if z.len() != y.len() {
            return Err(KError::DimensionMismatch { expected: y.len(), got: z.len() });
        }
        let plan = self.plan()?;
        let handle = plan.gather_begin(&self.comm, x)?;
        z.copy_from_slice(y);
        self.diag.mult_add_into(x, z);
        let mut ghost = self.ghost.borrow_mut();
        plan.gather_end(&self.comm, handle, &mut ghost)?;
        self.offdiag.mult_add_into(&ghost, z);
        Ok(())
    }

    /// y ← Aᵀ x (collective). Off-diagonal contributions are sent back to their owners.
    pub fn multiply_transpose(&self, x: &[T], y: &mut [T]) -> Result<(), KError> {
        let _span = Event::MatMultTranspose.span().entered();
        self.check_lengths(self.rows.local_size(), x.len(), self.cols.local_size(), y.len())?;
        let plan = self.plan()?;
        let mut ghost = self.ghost.borrow_mut();
        ghost.fill(T::zero());
        self.offdiag.mult_transpose_add_into(x, &mut ghost);
        let handle = plan.reverse_add_begin(&self.comm, &ghost)?;
        y.fill(T::zero());
        self.diag.mult_transpose_add_into(x, y);
        plan.reverse_add_end(&self.comm, handle, y)
    }

    /// Locally owned part of the main diagonal. Needs matching row and column layouts.
    pub fn diagonal(&self, d: &mut [T]) -> Result<(), KError> {
        if self.rows != self.cols {
            return Err(KError::Unsupported("diagonal of a matrix with different row and column layouts"));
        }
        if d.len() != self.rows.local_size() {
            return Err(KError::DimensionMismatch { expected: self.rows.local_size(), got: d.len() });
        }
        self.diag.diagonal_into(d);
        Ok(())
    }

    /// Zero every stored value, keeping the structure and the scatter plan.
    pub fn zero_entries(&mut self) {
        self.diag.zero_entries();
        self.offdiag.zero_entries();
    }

    /// Global block column of an off-diagonal store column.
    fn offdiag_global(&self, k: usize) -> usize {
        if self.was_assembled { self.garray[k] } else { k }
    }

    /// One locally owned point row as `(global columns, values)`, sorted by column.
    ///
    /// Every entry of a stored block is returned, explicit zeros included.
    pub fn get_row(&self, row: usize) -> Result<(Vec<usize>, Vec<T>), KError> {
        let bs = self.bs;
        if row >= self.rows.global_size() {
            return Err(KError::OutOfRange { what: "row", index: row, bound: self.rows.global_size() });
        }
        if !self.rows.owns_block(row / bs) {
            return Err(KError::Unsupported("getting rows owned by another process"));
        }
        let lrow = row - self.rows.start() * bs;
        let cstart = self.cols.start() * bs;
        let off: Vec<(usize, T)> = self
            .offdiag
            .row_entries(lrow)
            .map(|(c, v)| (self.offdiag_global(c / bs) * bs + c % bs, v))
            .collect();
        // off-diagonal columns left of the own range come first
        let split = off.partition_point(|&(c, _)| c < cstart);
        let entries = off[..split]
            .iter()
            .copied()
            .chain(self.diag.row_entries(lrow).map(|(c, v)| (c + cstart, v)))
            .chain(off[split..].iter().copied());
        Ok(entries.unzip())
    }

    /// A ← a·A
    pub fn scale(&mut self, a: T) {
        let _span = Event::MatScale.span().entered();
        self.diag.scale(a);
        self.offdiag.scale(a);
    }

    /// A ← diag(l)·A·diag(r); either side may be skipped (collective when `r` is given).
    ///
    /// `l` has the local row length, `r` the local column length.
    pub fn diagonal_scale(&mut self, l: Option<&[T]>, r: Option<&[T]>) -> Result<(), KError> {
        let _span = Event::MatDiagonalScale.span().entered();
        if self.state != AssemblyState::Assembled {
            return Err(KError::WrongState("matrix is not assembled"));
        }
        if let Some(l) = l {
            if l.len() != self.rows.local_size() {
                return Err(KError::DimensionMismatch { expected: self.rows.local_size(), got: l.len() });
            }
            self.diag.scale_rows(l);
            self.offdiag.scale_rows(l);
        }
        if let Some(r) = r {
            if r.len() != self.cols.local_size() {
                return Err(KError::DimensionMismatch { expected: self.cols.local_size(), got: r.len() });
            }
            let plan = self.scatter.as_ref().ok_or(KError::WrongState("matrix has no scatter plan"))?;
            let handle = plan.gather_begin(&self.comm, r)?;
            self.diag.scale_columns(r);
            let mut ghost = vec![T::zero(); plan.ghost_len()];
            plan.gather_end(&self.comm, handle, &mut ghost)?;
            self.offdiag.scale_columns(&ghost);
        }
        Ok(())
    }

    /// Matrix norm (collective).
    pub fn norm(&self, kind: MatNorm) -> Result<T, KError> {
        let _span = Event::MatNorm.span().entered();
        if self.state != AssemblyState::Assembled {
            return Err(KError::WrongState("matrix is not assembled"));
        }
        let bs = self.bs;
        let cstart = self.cols.start() * bs;
        let local_rows = 0..self.rows.local_size();
        let this = self;
        let entries = move |lrow: usize| {
            this.diag
                .row_entries(lrow)
                .map(move |(c, v)| (c + cstart, v.to_wire()))
                .chain(
                    this.offdiag
                        .row_entries(lrow)
                        .map(move |(c, v)| (this.offdiag_global(c / bs) * bs + c % bs, v.to_wire())),
                )
        };
        let value = match kind {
            MatNorm::Frobenius => {
                let local: f64 = local_rows.flat_map(entries).map(|(_, v)| v * v).sum();
                self.comm.all_reduce_sum(local)?.sqrt()
            }
            MatNorm::Infinity => {
                let local = local_rows
                    .map(|lrow| entries(lrow).map(|(_, v)| v.abs()).sum::<f64>())
                    .fold(0.0, f64::max);
                self.comm.all_reduce_f64(&[local], ReduceOp::Max)?[0]
            }
            MatNorm::One => {
                let mut sums = vec![0.0; self.cols.global_size()];
                for (c, v) in local_rows.flat_map(entries) {
                    sums[c] += v.abs();
                }
                let sums = self.comm.all_reduce_f64(&sums, ReduceOp::Sum)?;
                sums.into_iter().fold(0.0, f64::max)
            }
        };
        Ok(T::from_wire(value))
    }

    /// Largest absolute value of every local row and the global column where it
    /// first occurs; `None` for rows without stored blocks.
    pub fn row_max_abs(&self, v: &mut [T]) -> Result<Vec<Option<usize>>, KError> {
        let local = self.rows.local_size();
        if v.len() != local {
            return Err(KError::DimensionMismatch { expected: local, got: v.len() });
        }
        let rstart = self.rows.start() * self.bs;
        let mut at = Vec::with_capacity(local);
        for (lrow, out) in v.iter_mut().enumerate() {
            let (cols, vals) = self.get_row(rstart + lrow)?;
            let mut best: (T, Option<usize>) = (T::zero(), None);
            for (c, x) in cols.into_iter().zip(vals) {
                if best.1.is_none() || x.abs() > best.0 {
                    best = (x.abs(), Some(c));
                }
            }
            *out = best.0;
            at.push(best.1);
        }
        Ok(at)
    }

    /// Zero the given global rows, keeping the structure (collective).
    ///
    /// Rows may belong to any process and are forwarded to their owners. With
    /// `diag = Some(d)` the diagonal entry of every zeroed row is set to `d`.
    pub fn zero_rows(&mut self, rows: &[usize], diag: Option<T>) -> Result<(), KError> {
        let _span = Event::MatZeroRows.span().entered();
        if self.state != AssemblyState::Assembled {
            return Err(KError::WrongState("matrix is not assembled"));
        }
        if diag.is_some() && self.rows != self.cols {
            return Err(KError::Unsupported("setting the diagonal of a matrix with different row and column layouts"));
        }
        let bs = self.bs;
        let mut mine = Vec::new();
        let mut remote = Stash::new(1, 0);
        for &row in rows {
            if row >= self.rows.global_size() {
                return Err(KError::OutOfRange { what: "row", index: row, bound: self.rows.global_size() });
            }
            if self.rows.owns_block(row / bs) {
                mine.push(row);
            } else {
                remote.push(row, row, &[T::zero()])?;
            }
        }

        let seq = self.zero_rows_seq;
        self.zero_rows_seq = self.zero_rows_seq.wrapping_add(1);
        let layout = &self.rows;
        let mut exchange =
            remote.scatter_begin(&self.comm, Tag::new(TagKind::ZeroRows, seq), |r| layout.owner_of_block(r / bs))?;
        while let Some(msg) = exchange.next_message::<C, T>(&self.comm)? {
            mine.extend_from_slice(&msg.rows);
        }
        exchange.finish(&self.comm)?;

        let rstart = self.rows.start() * bs;
        for &row in &mine {
            let lrow = row - rstart;
            self.diag.zero_row(lrow)?;
            self.offdiag.zero_row(lrow)?;
            if let Some(d) = diag {
                self.diag
                    .set_value(lrow, lrow, d, InsertMode::Insert)
                    .map_err(|e| relabel(e, row, row))?;
            }
        }
        debug!(rank = self.comm.rank(), zeroed = mine.len(), "rows zeroed");
        Ok(())
    }
}

/// Report a rejected insertion in global indices.
fn relabel(e: KError, row: usize, col: usize) -> KError {
    match e {
        KError::NewNonzeroDisallowed { .. } => KError::NewNonzeroDisallowed { row, col },
        other => other,
    }
}

impl<T: Scalar, C: Comm> LinearOperator<T> for DistBlockMatrix<T, C> {
    fn local_rows(&self) -> usize {
        self.rows.local_size()
    }

    fn local_cols(&self) -> usize {
        self.cols.local_size()
    }

    fn mult(&self, x: &[T], y: &mut [T]) -> Result<(), KError> {
        self.multiply(x, y)
    }

    fn mult_transpose(&self, x: &[T], y: &mut [T]) -> Result<(), KError> {
        self.multiply_transpose(x, y)
    }

    fn mult_add(&self, x: &[T], y: &[T], z: &mut [T]) -> Result<(), KError> {
        self.multiply_add(x, y, z)
    }

    fn diagonal(&self, d: &mut [T]) -> Result<(), KError> {
        DistBlockMatrix::diagonal(self, d)
    }
}

impl<T: Scalar, C: Comm> MatAssembly<T> for DistBlockMatrix<T, C> {
    fn set_values(&mut self, rows: &[usize], cols: &[usize], values: &[T], mode: InsertMode) -> Result<(), KError> {
        DistBlockMatrix::set_values(self, rows, cols, values, mode)
    }

    fn get_values(&self, rows: &[usize], cols: &[usize], values: &mut [T]) -> Result<(), KError> {
        DistBlockMatrix::get_values(self, rows, cols, values)
    }

    fn assembly_begin(&mut self) -> Result<(), KError> {
        DistBlockMatrix::assembly_begin(self)
    }

    fn assembly_end(&mut self) -> Result<(), KError> {
        DistBlockMatrix::assembly_end(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::{SerialComm, ThreadWorld};

    #[test]
    fn serial_assembly_has_no_ghosts() {
        let mut a = DistBlockMatrix::<f64, _>::new(SerialComm::new(), 2, 4, 4).unwrap();
        a.set_values(&[0, 1], &[0, 3], &[1.0, 2.0, 3.0, 4.0], InsertMode::Insert).unwrap();
        a.set_values_blocked(&[1], &[1], &[5.0, 0.0, 0.0, 6.0], InsertMode::Insert).unwrap();
        a.assemble().unwrap();
        assert!(a.garray().is_empty());
        let mut y = [0.0; 4];
        a.multiply(&[1.0, 1.0, 1.0, 1.0], &mut y).unwrap();
        assert_eq!(y, [3.0, 7.0, 5.0, 6.0]);
        let mut v = [0.0; 2];
        a.get_values(&[3], &[2, 3], &mut v).unwrap();
        assert_eq!(v, [0.0, 6.0]);
    }

    #[test]
    fn get_row_returns_whole_blocks() {
        let mut a = DistBlockMatrix::<f64, _>::new(SerialComm::new(), 2, 4, 4).unwrap();
        a.set_values(&[0], &[3, 0], &[2.0, 1.0], InsertMode::Insert).unwrap();
        a.assemble().unwrap();
        assert_eq!(a.get_row(0).unwrap(), (vec![0, 1, 2, 3], vec![1.0, 0.0, 0.0, 2.0]));
        assert_eq!(a.get_row(2).unwrap(), (vec![], vec![]));
    }

    #[test]
    fn set_values_between_begin_and_end_is_rejected() {
        let mut a = DistBlockMatrix::<f64, _>::new(SerialComm::new(), 1, 2, 2).unwrap();
        a.set_values(&[0], &[0], &[1.0], InsertMode::Insert).unwrap();
        a.assembly_begin().unwrap();
        assert!(matches!(
            a.set_values(&[1], &[1], &[1.0], InsertMode::Insert),
            Err(KError::WrongState(_))
        ));
        a.assembly_end().unwrap();
        assert!(matches!(a.assembly_end(), Err(KError::WrongState(_))));
    }

    #[test]
    fn multiply_before_assembly_fails() {
        let a = DistBlockMatrix::<f64, _>::new(SerialComm::new(), 1, 2, 2).unwrap();
        let mut y = [0.0; 2];
        assert!(matches!(a.multiply(&[1.0, 1.0], &mut y), Err(KError::WrongState(_))));
    }

    #[test]
    fn block_stash_reaches_owner() {
        let out = ThreadWorld::run(2, |comm| {
            let rank = comm.rank();
            let mut a = DistBlockMatrix::<f64, _>::new(comm, 2, 4, 4).unwrap();
            // each rank writes the diagonal block of the other rank
            let other = 1 - rank;
            a.set_values_blocked(&[other], &[other], &[1.0, 2.0, 3.0, 4.0], InsertMode::Add).unwrap();
            a.assemble().unwrap();
            let r0 = 2 * rank;
            let mut v = [0.0; 4];
            a.get_values(&[r0, r0 + 1], &[r0, r0 + 1], &mut v).unwrap();
            v
        });
        assert_eq!(out[0], [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(out[1], [1.0, 2.0, 3.0, 4.0]);
    }
}
