use kryst_baij::context::KspContext;
use kryst_baij::core::traits::InsertMode;
use kryst_baij::core::wrappers::DistributedInnerProduct;
use kryst_baij::matrix::{DistBlockMatrix, MatNorm};
use kryst_baij::parallel::{Comm, ThreadWorld};
use kryst_baij::preconditioner::Jacobi;
use kryst_baij::solver::BiCgStab;

fn main() {
    let n = 64;
    let bs = 2;
    let ranks = 2;

    let results = ThreadWorld::run(ranks, |comm| {
        let rank = comm.rank();
        let mut a = DistBlockMatrix::<f64, _>::new(comm, bs, n, n).unwrap();

        // 1D Laplacian with a small convection term: tridiag(-1.1, 2, -0.9)
        let range = a.row_layout().point_range();
        for i in range.clone() {
            let mut cols = vec![i];
            let mut vals = vec![2.0];
            if i > 0 {
                cols.push(i - 1);
                vals.push(-1.1);
            }
            if i + 1 < n {
                cols.push(i + 1);
                vals.push(-0.9);
            }
            a.set_values(&[i], &cols, &vals, InsertMode::Insert).unwrap();
        }
        a.assemble().unwrap();
        let norm = a.norm(MatNorm::Infinity).unwrap();

        // right-hand side for the exact solution x = 1
        let ones = vec![1.0; range.len()];
        let mut b = vec![0.0; range.len()];
        a.multiply(&ones, &mut b).unwrap();

        let mut x = vec![0.0; range.len()];
        let mut ksp = KspContext::new();
        ksp.set_operators(&a)
            .set_inner_product(DistributedInnerProduct::new(a.comm()))
            .set_pc(Jacobi::new())
            .set_type(BiCgStab::new())
            .set_tolerances(1e-10, 1e-50, 1e5, 500);
        let stats = ksp.solve(&b, &mut x).unwrap();
        let err = x.iter().map(|v| (v - 1.0).abs()).fold(0.0, f64::max);
        (rank, norm, stats, err, a.garray().to_vec())
    });

    for (rank, norm, stats, err, ghosts) in results {
        println!("rank {rank}: ||A||_inf = {norm}, ghost block columns = {ghosts:?}");
        println!("rank {rank}: stats = {stats:?}, max error = {err:e}");
    }
}
