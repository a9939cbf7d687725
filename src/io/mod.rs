//! File formats.

pub mod binary;

pub use binary::{CsrImage, NumericKind, load_dist_block_matrix, read_matrix, read_vector, write_matrix, write_vector};
