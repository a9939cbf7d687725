//! BLAS-1 style micro-kernels on local slices.
//!
//! Every kernel charges its floating-point work to the per-process counter in
//! [`crate::utils::events`]. Naming follows the usual level-1 conventions:
//!
//! | kernel  | effect              |
//! |---------|---------------------|
//! | `axpy`  | y ← y + αx          |
//! | `aypx`  | y ← x + αy          |
//! | `waxpy` | w ← αx + y          |
//! | `scale` | x ← αx              |

use crate::core::traits::Scalar;
use crate::utils::events::add_flops;

/// Local dot product xᵀy.
pub fn dot<T: Scalar>(x: &[T], y: &[T]) -> T {
    debug_assert_eq!(x.len(), y.len(), "Vectors must have the same length");
    add_flops(2 * x.len());
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;
        x.par_iter()
            .zip(y.par_iter())
            .map(|(&xi, &yi)| xi * yi)
            .reduce(T::zero, |acc, v| acc + v)
    }
    #[cfg(not(feature = "rayon"))]
    {
        x.iter()
            .zip(y)
            .map(|(&xi, &yi)| xi * yi)
            .fold(T::zero(), |acc, v| acc + v)
    }
}

/// y ← y + αx
pub fn axpy<T: Scalar>(alpha: T, x: &[T], y: &mut [T]) {
    debug_assert_eq!(x.len(), y.len());
    add_flops(2 * x.len());
    for (yi, &xi) in y.iter_mut().zip(x) {
        *yi = *yi + alpha * xi;
    }
}

/// y ← x + αy
pub fn aypx<T: Scalar>(alpha: T, x: &[T], y: &mut [T]) {
    debug_assert_eq!(x.len(), y.len());
    add_flops(2 * x.len());
    for (yi, &xi) in y.iter_mut().zip(x) {
        *yi = xi + alpha * *yi;
    }
}

/// w ← αx + y
pub fn waxpy<T: Scalar>(alpha: T, x: &[T], y: &[T], w: &mut [T]) {
    debug_assert_eq!(x.len(), y.len());
    debug_assert_eq!(x.len(), w.len());
    add_flops(2 * x.len());
    for ((wi, &xi), &yi) in w.iter_mut().zip(x).zip(y) {
        *wi = alpha * xi + yi;
    }
}

/// x ← αx
pub fn scale<T: Scalar>(alpha: T, x: &mut [T]) {
    add_flops(x.len());
    for xi in x.iter_mut() {
        *xi = alpha * *xi;
    }
}

/// y ← x
pub fn copy<T: Scalar>(x: &[T], y: &mut [T]) {
    y.copy_from_slice(x);
}

/// x ← α
pub fn set<T: Scalar>(alpha: T, x: &mut [T]) {
    x.fill(alpha);
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn level_one_kernels() {
        let x = vec![1.0, 2.0, 3.0];
        let mut y = vec![1.0, 1.0, 1.0];
        assert_abs_diff_eq!(dot(&x, &y), 6.0);

        axpy(2.0, &x, &mut y);
        assert_eq!(y, vec![3.0, 5.0, 7.0]);

        aypx(0.5, &x, &mut y);
        assert_eq!(y, vec![2.5, 4.5, 6.5]);

        let mut w = vec![0.0; 3];
        waxpy(-1.0, &x, &y, &mut w);
        assert_eq!(w, vec![1.5, 2.5, 3.5]);

        scale(2.0, &mut w);
        assert_eq!(w, vec![3.0, 5.0, 7.0]);

        copy(&x, &mut w);
        assert_eq!(w, x);
        set(0.0, &mut w);
        assert!(w.iter().all(|&v| v == 0.0));
    }
}
