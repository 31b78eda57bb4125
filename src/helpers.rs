//! Conversions and checks shared by the module tests.

use crate::{CsMat, Factor, Options, WorkVector};
use sprs::TriMat;

pub(crate) fn csc_from_rows(rows: &[Vec<f64>]) -> CsMat {
    let num_rows = rows.len();
    let num_cols = rows[0].len();
    let mut mat = TriMat::new((num_rows, num_cols));
    for (r, row) in rows.iter().enumerate() {
        assert_eq!(row.len(), num_cols);
        for (c, &val) in row.iter().enumerate() {
            if val != 0.0 {
                mat.add_triplet(r, c, val);
            }
        }
    }
    mat.to_csc()
}

pub(crate) fn factor_from_rows(rows: &[Vec<f64>], basic: &[usize]) -> Factor {
    Factor::new(csc_from_rows(rows), basic, Options::default())
}

pub(crate) fn vec_from(values: &[f64]) -> WorkVector {
    let mut v = WorkVector::new(values.len());
    v.set(
        values
            .iter()
            .enumerate()
            .filter(|(_, &val)| val != 0.0)
            .map(|(i, val)| (i, val)),
    );
    v
}

/// Max-norm of B·x − b, with the columns of B read through the factor's
/// basic-variable list.
pub(crate) fn basis_residual(factor: &Factor, x: &WorkVector, b: &[f64]) -> f64 {
    let m = factor.num_row();
    let mut acc: Vec<f64> = b.iter().map(|&v| -v).collect();
    for row in 0..m {
        let xv = x.array[row];
        if xv == 0.0 {
            continue;
        }
        let var = factor.basic()[row];
        if var < factor.num_col() {
            for (r, &a) in factor.matrix().outer_view(var).unwrap().iter() {
                acc[r] += a * xv;
            }
        } else {
            acc[var - factor.num_col()] += xv;
        }
    }
    acc.iter().fold(0.0f64, |mx, v| mx.max(v.abs()))
}

/// Max-norm of Bᵀ·y − c for the same basis reading.
pub(crate) fn basis_residual_transpose(factor: &Factor, y: &WorkVector, c: &[f64]) -> f64 {
    let m = factor.num_row();
    let mut worst = 0.0f64;
    for row in 0..m {
        let var = factor.basic()[row];
        let mut dot = 0.0;
        if var < factor.num_col() {
            for (r, &a) in factor.matrix().outer_view(var).unwrap().iter() {
                dot += a * y.array[r];
            }
        } else {
            dot = y.array[var - factor.num_col()];
        }
        worst = worst.max((dot - c[row]).abs());
    }
    worst
}
