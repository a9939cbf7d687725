//! Tests for the core operator and inner-product layer: dense matrix-vector
//! products through `LinearOperator`, the serial and distributed inner
//! products, and the flop accounting of the level-1 kernels.

use approx::assert_abs_diff_eq;
use faer::Mat;
use kryst_baij::core::kernels;
use kryst_baij::core::traits::{InnerProduct, LinearOperator};
use kryst_baij::core::wrappers::DistributedInnerProduct;
use kryst_baij::error::KError;
use kryst_baij::parallel::{Comm, ThreadWorld};
use kryst_baij::utils::events::{flops, reset_flops};
use rand::Rng;

/// Test matrix-vector multiplication for a small random dense matrix.
///
/// Builds a random 5x5 matrix and vector, multiplies through the operator
/// trait, and checks the result against a manual computation.
#[test]
fn matvec_random_small() {
    let n = 5;
    let mut rng = rand::thread_rng();
    let vals: Vec<f64> = (0..n * n).map(|_| rng.r#gen()).collect();
    // column-major, like faer
    let a = Mat::from_fn(n, n, |i, j| vals[j * n + i]);
    let x: Vec<f64> = (0..n).map(|_| rng.r#gen()).collect();
    let mut y = vec![0.0; n];
    a.mult(&x, &mut y).unwrap();

    for i in 0..n {
        let expected = (0..n).map(|j| vals[j * n + i] * x[j]).sum::<f64>();
        assert_abs_diff_eq!(y[i], expected, epsilon = 1e-12);
    }
}

/// `mult_add` defaults to multiply-then-add and leaves `y` untouched.
#[test]
fn mult_add_and_diagonal() {
    let a = Mat::<f64>::from_fn(3, 3, |i, j| (3 * i + j) as f64);
    let x = [1.0, 0.0, -1.0];
    let y = [10.0, 20.0, 30.0];
    let mut z = [0.0; 3];
    a.mult_add(&x, &y, &mut z).unwrap();
    assert_eq!(z, [8.0, 18.0, 28.0]);
    assert_eq!(y, [10.0, 20.0, 30.0]);

    let mut d = [0.0; 3];
    LinearOperator::diagonal(&a, &mut d).unwrap();
    assert_eq!(d, [0.0, 4.0, 8.0]);
}

#[test]
fn rectangular_operator_checks_lengths() {
    let a = Mat::<f64>::from_fn(2, 3, |i, j| (i + j) as f64);
    assert_eq!(a.local_rows(), 2);
    assert_eq!(a.local_cols(), 3);
    let mut y = [0.0; 2];
    assert!(matches!(
        a.mult(&[1.0, 1.0], &mut y),
        Err(KError::DimensionMismatch { expected: 3, got: 2 })
    ));
    let mut yt = [0.0; 3];
    a.mult_transpose(&[1.0, 1.0], &mut yt).unwrap();
    assert_eq!(yt, [1.0, 3.0, 5.0]);
}

/// Dot product and Euclidean norm of the serial inner product.
#[test]
fn dot_and_norm() {
    let x = vec![1.0, 2.0, 3.0];
    let y = vec![4.0, -5.0, 6.0];
    let ip = ();
    let dot = ip.dot(&x, &y).unwrap();
    assert_abs_diff_eq!(dot, 1.0 * 4.0 + 2.0 * (-5.0) + 3.0 * 6.0, epsilon = 1e-12);
    let norm_x = ip.norm(&x).unwrap();
    let expected_norm = (1.0f64.powi(2) + 2.0f64.powi(2) + 3.0f64.powi(2)).sqrt();
    assert_abs_diff_eq!(norm_x, expected_norm, epsilon = 1e-12);
    assert!(ip.dot(&x, &y[..2]).is_err());
}

/// Each rank holds a slice of a global vector; every rank sees the global value.
#[test]
fn distributed_dot_matches_global() {
    let n = 10;
    let x: Vec<f64> = (0..n).map(|i| i as f64 + 1.0).collect();
    let y: Vec<f64> = (0..n).map(|i| if i % 2 == 0 { 1.0 } else { -0.5 }).collect();
    let expected = kernels::dot(&x, &y);
    let expected_norm = kernels::dot(&x, &x).sqrt();

    let out = ThreadWorld::run(3, |comm| {
        // uneven split: 4, 3, 3
        let start = [0, 4, 7][comm.rank()];
        let end = [4, 7, 10][comm.rank()];
        let ip = DistributedInnerProduct::new(&comm);
        let d = ip.dot(&x[start..end], &y[start..end]).unwrap();
        let nrm = ip.norm(&x[start..end]).unwrap();
        (d, nrm)
    });
    for (d, nrm) in out {
        assert_abs_diff_eq!(d, expected, epsilon = 1e-12);
        assert_abs_diff_eq!(nrm, expected_norm, epsilon = 1e-12);
    }
}

#[test]
fn kernels_charge_flops() {
    reset_flops();
    let x = vec![1.0f64; 8];
    let mut y = vec![2.0f64; 8];
    kernels::axpy(0.5, &x, &mut y);
    kernels::aypx(2.0, &x, &mut y);
    kernels::scale(0.5, &mut y);
    assert_abs_diff_eq!(flops(), (2 * 8 + 2 * 8 + 8) as f64);
    // y = (1 + 2 * 2.5) / 2
    assert!(y.iter().all(|&v| v == 3.0));

    let a = Mat::<f64>::identity(4, 4);
    reset_flops();
    let mut z = [0.0; 4];
    a.mult(&[1.0, 2.0, 3.0, 4.0], &mut z).unwrap();
    assert_abs_diff_eq!(flops(), 32.0);
}
