//! Tests for the Krylov methods against direct solves, on dense operators and
//! on the distributed block matrix.
//!
//! Besides plain convergence this covers the shared solver machinery:
//! breakdown detection, norm/side validation, transposed solves, right
//! preconditioning, monitors and residual history, and configuration by name.

use approx::assert_abs_diff_eq;
use faer::Mat;
use faer::linalg::solvers::SolveCore;
use kryst_baij::config::options::Options;
use kryst_baij::context::KspContext;
use kryst_baij::core::traits::{InsertMode, LinearOperator};
use kryst_baij::core::wrappers::DistributedInnerProduct;
use kryst_baij::error::KError;
use kryst_baij::matrix::DistBlockMatrix;
use kryst_baij::parallel::{Comm, ThreadWorld};
use kryst_baij::preconditioner::{Jacobi, PcSide, Preconditioner};
use kryst_baij::solver::{BiCg, BiCgStab, Cgs, Chebyshev, Cr, KrylovMethod, KspMethod, KspRegistry};
use kryst_baij::utils::convergence::{ConvergedReason, NormType, Tolerances};
use rand::Rng;
use std::cell::RefCell;

/// Random diagonally dominant (nonsymmetric) matrix and right-hand side.
fn random_nonsym(n: usize) -> (Mat<f64>, Vec<f64>) {
    let mut rng = rand::thread_rng();
    let data: Vec<f64> = (0..n * n).map(|_| rng.r#gen()).collect();
    let a = Mat::from_fn(n, n, |i, j| data[j * n + i] + if i == j { n as f64 } else { 0.0 });
    let b: Vec<f64> = (0..n).map(|_| rng.r#gen()).collect();
    (a, b)
}

/// Random symmetric positive definite matrix `Mᵀ M + I` and right-hand side.
fn random_spd(n: usize) -> (Mat<f64>, Vec<f64>) {
    let mut rng = rand::thread_rng();
    let data: Vec<f64> = (0..n * n).map(|_| rng.r#gen()).collect();
    let m = Mat::from_fn(n, n, |i, j| data[j * n + i]);
    let m_t = m.transpose();
    let a = &m_t * &m + Mat::<f64>::identity(n, n);
    let b: Vec<f64> = (0..n).map(|_| rng.r#gen()).collect();
    (a, b)
}

/// 1-D Laplacian `tridiag(-1, 2, -1)` and its extreme eigenvalues.
fn laplacian(n: usize) -> (Mat<f64>, f64, f64) {
    let a = Mat::from_fn(n, n, |i, j| match i.abs_diff(j) {
        0 => 2.0,
        1 => -1.0,
        _ => 0.0,
    });
    let h = std::f64::consts::PI / (n + 1) as f64;
    let lmin = 2.0 - 2.0 * h.cos();
    let lmax = 2.0 - 2.0 * (n as f64 * h).cos();
    (a, lmin, lmax)
}

fn direct_solve(a: &Mat<f64>, b: &[f64]) -> Vec<f64> {
    let n = b.len();
    let mut x = b.to_vec();
    let lu = faer::linalg::solvers::FullPivLu::new(a.as_ref());
    let x_mat = faer::MatMut::from_column_major_slice_mut(&mut x, n, 1);
    lu.solve_in_place_with_conj(faer::Conj::No, x_mat);
    x
}

fn assert_close(x: &[f64], expected: &[f64], eps: f64) {
    for (xi, ei) in x.iter().zip(expected) {
        assert_abs_diff_eq!(*xi, *ei, epsilon = eps);
    }
}

/// 90° rotation `[[0, -1], [1, 0]]`: orthogonal to its input, so every
/// bi-orthogonality measure built from `r` and `B r` vanishes.
struct Rotation;

impl Preconditioner<f64> for Rotation {
    fn apply(&self, x: &[f64], y: &mut [f64]) -> Result<(), KError> {
        y[0] = -x[1];
        y[1] = x[0];
        Ok(())
    }

    fn apply_transpose(&self, x: &[f64], y: &mut [f64]) -> Result<(), KError> {
        y[0] = x[1];
        y[1] = -x[0];
        Ok(())
    }
}

fn solve_dense(a: &Mat<f64>, b: &[f64], method: KrylovMethod<f64>) -> (Vec<f64>, ConvergedReason) {
    let mut x = vec![0.0; b.len()];
    let mut ksp = KspContext::new();
    ksp.set_operators(a).set_type(method).set_tolerances(1e-10, 1e-50, 1e5, 500);
    let stats = ksp.solve(b, &mut x).unwrap();
    (x, stats.reason)
}

#[test]
fn nonsymmetric_methods_match_direct_solve() {
    let n = 10;
    let (a, b) = random_nonsym(n);
    let x_direct = direct_solve(&a, &b);
    for method in [KrylovMethod::<f64>::from(BiCg::new()), Cgs::new().into(), BiCgStab::new().into()] {
        let name = method.name();
        let (x, reason) = solve_dense(&a, &b, method);
        assert!(reason.is_converged(), "{name}: {reason:?}");
        assert_close(&x, &x_direct, 1e-6);
    }
}

#[test]
fn cr_matches_direct_solve_on_spd() {
    let n = 10;
    let (a, b) = random_spd(n);
    let (x, reason) = solve_dense(&a, &b, Cr::new().into());
    assert!(reason.is_converged(), "{reason:?}");
    assert_close(&x, &direct_solve(&a, &b), 1e-6);
}

#[test]
fn chebyshev_with_exact_bounds_converges() {
    let n = 10;
    let (a, lmin, lmax) = laplacian(n);
    let b = vec![1.0; n];
    let (x, reason) = solve_dense(&a, &b, Chebyshev::new(0.95 * lmin, 1.05 * lmax).into());
    assert!(reason.is_converged(), "{reason:?}");
    assert_close(&x, &direct_solve(&a, &b), 1e-5);
}

#[test]
fn chebyshev_rejects_equal_bounds_at_setup() {
    let a = Mat::<f64>::identity(3, 3);
    let mut ksp = KspContext::new();
    ksp.set_operators(&a).set_type(Chebyshev::new(1.0, 1.0));
    assert!(matches!(ksp.set_up(), Err(KError::InvalidEigenvalueBounds { .. })));
    let mut x = vec![0.0; 3];
    assert!(ksp.solve(&[1.0, 1.0, 1.0], &mut x).is_err());
}

#[test]
fn zero_biorthogonality_is_a_breakdown_at_iteration_zero() {
    let a = Mat::<f64>::identity(2, 2);
    let b = [1.0, 0.0];
    for method in [KrylovMethod::<f64>::from(BiCg::new()), BiCgStab::new().into(), Cr::new().into()] {
        let name = method.name();
        let mut x = vec![0.0; 2];
        let mut ksp = KspContext::new();
        ksp.set_operators(&a).set_pc(Rotation).set_type(method);
        let stats = ksp.solve(&b, &mut x).unwrap();
        assert_eq!(stats.reason, ConvergedReason::DivergedBreakdown, "{name}");
        assert_eq!(stats.iterations, 0, "{name}");
        assert!(x.iter().all(|v| v.is_finite()));
    }
}

#[test]
fn unsupported_norm_and_side_are_fatal() {
    let a = Mat::<f64>::identity(2, 2);
    let mut x = vec![0.0; 2];

    let mut ksp = KspContext::new();
    ksp.set_operators(&a).set_type(BiCg::new()).set_norm_type(NormType::Natural);
    assert!(matches!(
        ksp.solve(&[1.0, 1.0], &mut x),
        Err(KError::UnsupportedNormType { method: "bicg", .. })
    ));
    // the method survives the failed solve
    ksp.set_norm_type(NormType::Unpreconditioned);
    assert!(ksp.solve(&[1.0, 1.0], &mut x).unwrap().converged);

    let mut ksp = KspContext::new();
    ksp.set_operators(&a).set_type(Cr::new()).set_pc_side(PcSide::Right);
    assert!(matches!(ksp.set_up(), Err(KError::UnsupportedPcSide { method: "cr", side: PcSide::Right })));

    let mut ksp = KspContext::new();
    ksp.set_operators(&a).set_type(Chebyshev::<f64>::default()).set_pc_side(PcSide::Right);
    assert!(ksp.solve(&[1.0, 1.0], &mut x).is_err());
}

#[test]
fn transpose_solve_targets_transposed_system() {
    let n = 8;
    let (a, b) = random_nonsym(n);
    for method in [KrylovMethod::<f64>::from(BiCgStab::new()), BiCg::new().into(), Cgs::new().into()] {
        let name = method.name();
        let mut x = vec![0.0; n];
        let mut ksp = KspContext::new();
        ksp.set_operators(&a)
            .set_type(method)
            .set_transpose_solve(true)
            .set_tolerances(1e-12, 1e-50, 1e5, 200);
        assert!(ksp.solve(&b, &mut x).unwrap().converged, "{name}");
        let mut atx = vec![0.0; n];
        a.mult_transpose(&x, &mut atx).unwrap();
        assert_close(&atx, &b, 1e-8);
    }
}

#[test]
fn right_preconditioning_with_nonzero_guess() {
    let n = 10;
    let (a, b) = random_nonsym(n);
    let x_direct = direct_solve(&a, &b);
    for method in [KrylovMethod::<f64>::from(BiCgStab::new()), Cgs::new().into()] {
        let name = method.name();
        let mut x = vec![0.25; n];
        let mut ksp = KspContext::new();
        ksp.set_operators(&a)
            .set_pc(Jacobi::new())
            .set_pc_side(PcSide::Right)
            .set_type(method)
            .set_initial_guess_nonzero(true)
            .set_tolerances(1e-11, 1e-50, 1e5, 200);
        let stats = ksp.solve(&b, &mut x).unwrap();
        assert!(stats.converged, "{name}: {stats:?}");
        assert_eq!(ksp.norm_type(), NormType::Unpreconditioned);
        assert_close(&x, &x_direct, 1e-7);
    }
}

#[test]
fn exact_initial_guess_converges_immediately() {
    let (a, b) = random_nonsym(6);
    let mut x = direct_solve(&a, &b);
    let mut r = vec![0.0; 6];
    a.mult(&x, &mut r).unwrap();
    let mut ksp = KspContext::new();
    ksp.set_operators(&a)
        .set_type(BiCgStab::new())
        .set_initial_guess_nonzero(true)
        .set_tolerances(1e-8, 1e-6, 1e5, 50);
    let stats = ksp.solve(&r, &mut x).unwrap();
    assert_eq!(stats.iterations, 0);
    assert_eq!(stats.reason, ConvergedReason::ConvergedAtol);
}

#[test]
fn monitors_see_every_recorded_residual() {
    let (a, b) = random_spd(8);
    let seen = RefCell::new(Vec::new());
    let mut ksp = KspContext::new();
    ksp.set_operators(&a)
        .set_type(Cr::new())
        .set_residual_history(100, true)
        .add_monitor(|its, rnorm| seen.borrow_mut().push((its, rnorm)));
    let mut x = vec![0.0; 8];
    let stats = ksp.solve(&b, &mut x).unwrap();

    let seen = seen.borrow();
    assert_eq!(seen.len(), stats.iterations + 1);
    assert_eq!(ksp.residual_history().len(), seen.len());
    for (k, (&(its, rnorm), &h)) in seen.iter().zip(ksp.residual_history()).enumerate() {
        assert_eq!(its, k);
        assert_eq!(rnorm, h);
    }
    assert_eq!(stats.final_residual, ksp.residual_norm());
}

#[test]
fn history_is_bounded_and_optionally_kept() {
    let (a, b) = random_nonsym(10);
    let mut ksp = KspContext::new();
    ksp.set_operators(&a).set_type(BiCg::new()).set_residual_history(2, false);
    let mut x = vec![0.0; 10];
    ksp.solve(&b, &mut x).unwrap();
    assert_eq!(ksp.residual_history().len(), 2);
    x.fill(0.0);
    ksp.solve(&b, &mut x).unwrap();
    assert_eq!(ksp.residual_history().len(), 2);
}

#[test]
fn norm_none_runs_the_requested_iterations() {
    let (a, b) = random_nonsym(10);
    let mut ksp = KspContext::new();
    ksp.set_operators(&a)
        .set_type(BiCgStab::new())
        .set_norm_type(NormType::None)
        .set_tolerances(1e-8, 1e-50, 1e5, 4);
    let mut x = vec![0.0; 10];
    let stats = ksp.solve(&b, &mut x).unwrap();
    assert_eq!(stats.iterations, 4);
    assert_eq!(stats.reason, ConvergedReason::ConvergedIts);
}

#[test]
fn iteration_limit_and_custom_test() {
    let (a, lmin, lmax) = laplacian(30);
    let b = vec![1.0; 30];
    let mut ksp = KspContext::new();
    ksp.set_operators(&a)
        .set_type(Chebyshev::new(lmin, lmax))
        .set_tolerances(1e-12, 1e-50, 1e5, 3);
    let mut x = vec![0.0; 30];
    let stats = ksp.solve(&b, &mut x).unwrap();
    assert_eq!(stats.reason, ConvergedReason::DivergedIts);
    assert_eq!(stats.iterations, 3);
    // the final residual is recorded even though the test never ran on it
    assert_eq!(ksp.residual_history().len(), 4);

    let mut ksp = KspContext::new();
    ksp.set_operators(&a)
        .set_type(Cr::new())
        .set_convergence_test(|its: usize, _rnorm: f64, _tol: &Tolerances<f64>| {
            if its == 2 { ConvergedReason::ConvergedRtol } else { ConvergedReason::Iterating }
        });
    x.fill(0.0);
    let stats = ksp.solve(&b, &mut x).unwrap();
    assert_eq!(stats.iterations, 2);
    assert!(stats.converged);
}

#[test]
fn configured_by_name_from_options() {
    let (a, lmin, lmax) = laplacian(12);
    let b = vec![1.0; 12];
    // Jacobi halves the spectrum of tridiag(-1, 2, -1)
    let (emin, emax) = (0.45 * lmin, 0.55 * lmax);
    let bounds = format!("{emin},{emax}");
    let opts = Options::from_args([
        "-ksp_type",
        "chebyshev",
        "-ksp_chebyshev_eigenvalues",
        bounds.as_str(),
        "-ksp_rtol",
        "1e-11",
        "-ksp_max_it",
        "1000",
        "-pc_type",
        "jacobi",
    ]);
    let registry = KspRegistry::<f64>::default();
    let mut ksp = KspContext::new();
    ksp.set_operators(&a).set_from_options(&opts, &registry).unwrap();
    match ksp.method() {
        Some(KrylovMethod::Chebyshev(cheb)) => assert_eq!(cheb.eigenvalues(), (emin, emax)),
        other => panic!("expected chebyshev, got {other:?}"),
    }
    assert_eq!(ksp.tolerances().max_it, 1000);
    let mut x = vec![0.0; 12];
    assert!(ksp.solve(&b, &mut x).unwrap().converged);
    assert_close(&x, &direct_solve(&a, &b), 1e-6);

    let bad = Options::from_args(["-ksp_type", "gmres"]);
    assert!(matches!(
        ksp.set_from_options(&bad, &registry),
        Err(KError::UnknownType { kind: "ksp", .. })
    ));
    let bad = Options::from_args(["-ksp_norm_type", "energy"]);
    assert!(matches!(ksp.set_from_options(&bad, &registry), Err(KError::InvalidOption { .. })));
}

/// Nonsymmetric, diagonally dominant block tridiagonal matrix; `b = A·1`.
fn dist_system<C: Comm>(comm: C, bs: usize, n: usize) -> (DistBlockMatrix<f64, C>, Vec<f64>) {
    let mut a = DistBlockMatrix::new(comm, bs, n, n).unwrap();
    let range = a.row_layout().point_range();
    let mut b = Vec::with_capacity(range.len());
    for i in range {
        let mut cols = vec![i];
        let mut vals = vec![4.0];
        if i > 0 {
            cols.push(i - 1);
            vals.push(-1.0);
        }
        if i + 1 < n {
            cols.push(i + 1);
            vals.push(-1.0);
        }
        if i + bs < n {
            cols.push(i + bs);
            vals.push(0.25);
        }
        b.push(vals.iter().sum());
        a.set_values(&[i], &cols, &vals, InsertMode::Insert).unwrap();
    }
    a.assemble().unwrap();
    (a, b)
}

#[test]
fn distributed_solves_agree_across_ranks() {
    let out = ThreadWorld::run(3, |comm| {
        let (a, b) = dist_system(comm, 2, 18);
        let mut results = Vec::new();
        for method in [
            KrylovMethod::<f64>::from(BiCg::new()),
            Cgs::new().into(),
            BiCgStab::new().into(),
        ] {
            let name = method.name();
            let mut x = vec![0.0; b.len()];
            let mut ksp = KspContext::new();
            ksp.set_operators(&a)
                .set_inner_product(DistributedInnerProduct::new(a.comm()))
                .set_pc(Jacobi::new())
                .set_type(method)
                .set_tolerances(1e-10, 1e-50, 1e5, 500);
            let stats = ksp.solve(&b, &mut x).unwrap();
            results.push((name, stats.converged, stats.iterations, x));
        }
        results
    });
    for k in 0..out[0].len() {
        let (name, _, its, _) = &out[0][k];
        for rank in &out {
            let (_, converged, rank_its, x) = &rank[k];
            assert!(*converged, "{name}");
            assert_eq!(rank_its, its, "{name}: ranks took different paths");
            assert_close(x, &vec![1.0; x.len()], 1e-7);
        }
    }
}

#[test]
fn distributed_symmetric_solves() {
    let out = ThreadWorld::run(2, |comm| {
        let n = 16;
        let mut a = DistBlockMatrix::<f64, _>::new(comm, 2, n, n).unwrap();
        let range = a.row_layout().point_range();
        for i in range.clone() {
            a.set_values(&[i], &[i], &[3.0], InsertMode::Add).unwrap();
            if i + 1 < n {
                // both halves of the symmetric pair, (i+1, i) is often remote
                a.set_values(&[i, i + 1], &[i + 1, i], &[-1.0, 0.0, 0.0, -1.0], InsertMode::Add).unwrap();
            }
        }
        a.assemble().unwrap();
        let b = vec![1.0; range.len()];
        // spectrum of tridiag(-1, 3, -1) lies in (1, 5)
        let mut worst = 0.0f64;
        for (method, norm) in [
            (KrylovMethod::<f64>::from(Cr::new()), NormType::Natural),
            (Chebyshev::new(1.0, 5.0).into(), NormType::Unpreconditioned),
        ] {
            let mut x = vec![0.0; range.len()];
            let mut ksp = KspContext::new();
            ksp.set_operators(&a)
                .set_inner_product(DistributedInnerProduct::new(a.comm()))
                .set_type(method)
                .set_norm_type(norm)
                .set_tolerances(1e-10, 1e-50, 1e5, 200);
            let stats = ksp.solve(&b, &mut x).unwrap();
            assert!(stats.converged, "{stats:?}");
            let mut r = vec![0.0; range.len()];
            a.multiply(&x, &mut r).unwrap();
            worst = r.iter().zip(&b).map(|(ri, bi)| (ri - bi).abs()).fold(worst, f64::max);
        }
        worst
    });
    for err in out {
        assert!(err < 1e-7, "residual {err}");
    }
}
