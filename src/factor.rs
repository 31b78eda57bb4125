use crate::ordering::order_colamd;
use crate::solve::ReachMarker;
use crate::vector::WorkVector;
use crate::{CsMat, Error, NIL, TINY, ZERO};

/// Tunables for the factorization and update engine.
#[derive(Clone, Debug)]
pub struct Options {
    /// Relative pivot acceptance: a candidate may pivot only if its
    /// magnitude reaches this fraction of the column maximum.
    pub pivot_threshold: f64,
    /// Absolute floor below which a candidate never pivots.
    pub pivot_tolerance: f64,
    /// Forrest-Tomlin updates applied before a refactorization is advised.
    pub update_limit: usize,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            pivot_threshold: 0.1,
            pivot_tolerance: 1e-10,
            update_limit: 5000,
        }
    }
}

/// The factored basis: permutations, L in column and row form, U in column
/// and row form with embedded free space, pivot lookup tables, and the
/// product-form row etas accumulated since the last [`build`].
///
/// [`build`] pivots row by row and then permutes the basic-variable list so
/// that the variable in slot i is the one whose column pivoted on row i.
/// From that point on basis position and row index coincide: FTRAN input
/// and output, BTRAN input and output, and the `row_out` of an update are
/// all row-indexed.
///
/// [`build`]: Factor::build
pub struct Factor {
    pub(crate) num_row: usize,
    pub(crate) num_col: usize,
    a: CsMat,
    pub(crate) basic: Vec<usize>,
    pub(crate) opts: Options,

    // L minus its unit diagonal, by column and by row. Row and column
    // slots follow the pivot sequence; entries hold original row indices.
    pub(crate) l_pivot_index: Vec<usize>,
    pub(crate) l_pivot_lookup: Vec<usize>,
    pub(crate) l_start: Vec<usize>,
    pub(crate) l_index: Vec<usize>,
    pub(crate) l_value: Vec<f64>,
    pub(crate) lr_start: Vec<usize>,
    pub(crate) lr_index: Vec<usize>,
    pub(crate) lr_value: Vec<f64>,

    // U pivots in slot order, including slots appended by updates.
    // A NIL pivot row marks a deleted slot; every traversal skips it.
    pub(crate) u_pivot_index: Vec<usize>,
    pub(crate) u_pivot_value: Vec<f64>,
    pub(crate) u_pivot_lookup: Vec<usize>,

    // U by columns: slot i lives in u_index[u_start[i]..u_lastp[i]],
    // with slack up to u_start[i + 1].
    pub(crate) u_start: Vec<usize>,
    pub(crate) u_lastp: Vec<usize>,
    pub(crate) u_index: Vec<usize>,
    pub(crate) u_value: Vec<f64>,

    // U by rows, with per-row free space so updates can append in place.
    pub(crate) ur_start: Vec<usize>,
    pub(crate) ur_lastp: Vec<usize>,
    pub(crate) ur_space: Vec<usize>,
    pub(crate) ur_index: Vec<usize>,
    pub(crate) ur_value: Vec<f64>,

    // product-form row etas since the last build
    pub(crate) pf_pivot_index: Vec<usize>,
    pub(crate) pf_start: Vec<usize>,
    pub(crate) pf_index: Vec<usize>,
    pub(crate) pf_value: Vec<f64>,

    pub(crate) u_total_entries: usize,
    pub(crate) u_merit: usize,

    pub(crate) marker: ReachMarker,
}

impl Factor {
    /// Creates an engine for the m-row constraint matrix `a` (compressed
    /// columns) and the given basic-variable list. An entry of `basic`
    /// below `a.cols()` selects a structural column of A; `a.cols() + r`
    /// selects the logical (unit) column of row r.
    pub fn new(a: CsMat, basic: &[usize], opts: Options) -> Factor {
        assert!(a.is_csc());
        let num_row = a.rows();
        let num_col = a.cols();
        assert_eq!(basic.len(), num_row);
        for &var in basic {
            assert!(var < num_col + num_row);
        }

        Factor {
            num_row,
            num_col,
            a,
            basic: basic.to_vec(),
            opts,
            l_pivot_index: vec![],
            l_pivot_lookup: vec![],
            l_start: vec![0],
            l_index: vec![],
            l_value: vec![],
            lr_start: vec![],
            lr_index: vec![],
            lr_value: vec![],
            u_pivot_index: vec![],
            u_pivot_value: vec![],
            u_pivot_lookup: vec![],
            u_start: vec![0],
            u_lastp: vec![],
            u_index: vec![],
            u_value: vec![],
            ur_start: vec![],
            ur_lastp: vec![],
            ur_space: vec![],
            ur_index: vec![],
            ur_value: vec![],
            pf_pivot_index: vec![],
            pf_start: vec![0],
            pf_index: vec![],
            pf_value: vec![],
            u_total_entries: 0,
            u_merit: 0,
            marker: ReachMarker::new(num_row),
        }
    }

    pub fn num_row(&self) -> usize {
        self.num_row
    }

    pub fn num_col(&self) -> usize {
        self.num_col
    }

    pub fn matrix(&self) -> &CsMat {
        &self.a
    }

    /// The basic-variable list, row-indexed after [`Factor::build`].
    pub fn basic(&self) -> &[usize] {
        &self.basic
    }

    /// Number of Forrest-Tomlin updates applied since the last build.
    pub fn update_count(&self) -> usize {
        self.pf_pivot_index.len()
    }

    /// Running count of live U and eta entries, the quantity the refactor
    /// merit bound is tested against.
    pub fn entry_count(&self) -> usize {
        self.u_total_entries
    }

    /// Factorizes the current basis from scratch, discarding any
    /// accumulated updates.
    ///
    /// Left-looking sparse LU: columns are preordered by approximate
    /// minimum degree, each column is solved against the pivots chosen so
    /// far (with a DFS to predict fill), and the pivot row is picked by
    /// threshold partial pivoting with a fewest-entries tie-break.
    ///
    /// Columns yielding no acceptable pivot are dropped: the unpivoted
    /// rows receive unit pivots, their `basic` slots are set to the rows'
    /// logical variables, and the count is reported as
    /// [`Error::RankDeficient`]. The store is consistent either way.
    pub fn build(&mut self) -> Result<(), Error> {
        let m = self.num_row;

        // gather the basis columns, skipping explicitly stored zeros
        let mut b_start = Vec::with_capacity(m + 1);
        let mut b_index = vec![];
        let mut b_value = vec![];
        b_start.push(0);
        for &var in &self.basic {
            if var < self.num_col {
                for (row, &val) in self.a.outer_view(var).unwrap().iter() {
                    if val != 0.0 {
                        b_index.push(row);
                        b_value.push(val);
                    }
                }
            } else {
                b_index.push(var - self.num_col);
                b_value.push(1.0);
            }
            b_start.push(b_index.len());
        }

        trace!("build: factorizing basis, nnz {}", b_index.len());

        let col_perm = order_colamd(m, &b_start, &b_index);

        let mut row_entries = vec![0usize; m];
        for &r in &b_index {
            row_entries[r] += 1;
        }

        // growing factors; L holds multipliers without the unit diagonal
        let mut lower_start = vec![0usize];
        let mut lower_index: Vec<usize> = vec![];
        let mut lower_value: Vec<f64> = vec![];
        let mut upper_start = vec![0usize];
        let mut upper_index: Vec<usize> = vec![];
        let mut upper_value: Vec<f64> = vec![];
        let mut pivot_value: Vec<f64> = vec![];
        let mut pivot_var: Vec<usize> = vec![];

        let mut new2orig_row: Vec<usize> = (0..m).collect();
        let mut orig2new_row: Vec<usize> = new2orig_row.clone();
        let mut n_pivots = 0usize;

        let mut rhs = WorkVector::new(m);

        for ord in 0..m {
            let b_col = col_perm.new2orig[ord];
            rhs.clear();

            // scatter the part of the column lying in already-pivoted rows
            for k in b_start[b_col]..b_start[b_col + 1] {
                let row = b_index[k];
                if orig2new_row[row] < n_pivots {
                    rhs.array[row] = b_value[k];
                    rhs.index.push(row);
                }
            }

            // predict the fill of the partial solve, then eliminate in
            // topological order
            {
                let marker = &mut self.marker;
                let lower_start = &lower_start;
                let lower_index = &lower_index;
                let orig2new = &orig2new_row;
                marker.run(
                    &rhs.index,
                    |r| {
                        let i = orig2new[r];
                        &lower_index[lower_start[i]..lower_start[i + 1]]
                    },
                    |r| orig2new[r] < n_pivots,
                );
            }
            rhs.index.clear();
            rhs.index.extend_from_slice(&self.marker.result);

            for idx in (0..self.marker.result.len()).rev() {
                let orig_i = self.marker.result[idx];
                let x_val = rhs.array[orig_i];
                let new_i = orig2new_row[orig_i];
                for k in lower_start[new_i]..lower_start[new_i + 1] {
                    let orig_r = lower_index[k];
                    let new_r = orig2new_row[orig_r];
                    if new_r < n_pivots && new_r > new_i {
                        rhs.array[orig_r] -= x_val * lower_value[k];
                    }
                }
            }

            let upper_count = rhs.index.len();

            // scatter the rest of the column
            for k in b_start[b_col]..b_start[b_col + 1] {
                let row = b_index[k];
                if orig2new_row[row] >= n_pivots {
                    rhs.array[row] = b_value[k];
                    rhs.index.push(row);
                }
            }

            // push the finished upper part down into the unpivoted rows
            for i in 0..upper_count {
                let u_row = rhs.index[i];
                let u_coeff = rhs.array[u_row];
                if u_coeff == 0.0 {
                    continue;
                }
                let new_u = orig2new_row[u_row];
                for k in lower_start[new_u]..lower_start[new_u + 1] {
                    let row = lower_index[k];
                    if orig2new_row[row] >= n_pivots {
                        if rhs.array[row] == 0.0 {
                            rhs.index.push(row);
                        }
                        rhs.array[row] -= lower_value[k] * u_coeff;
                        if rhs.array[row] == 0.0 {
                            rhs.array[row] = ZERO;
                        }
                    }
                }
            }
            rhs.count = rhs.index.len();

            // threshold pivoting; among eligible rows the one with the
            // fewest entries in the basis wins
            let mut max_abs = 0.0f64;
            for &row in &rhs.index[upper_count..] {
                max_abs = max_abs.max(rhs.array[row].abs());
            }

            let mut pivot_i = None;
            if max_abs >= self.opts.pivot_tolerance {
                let accept = (self.opts.pivot_threshold * max_abs).max(self.opts.pivot_tolerance);
                let mut best_entries = usize::MAX;
                for i in upper_count..rhs.index.len() {
                    let row = rhs.index[i];
                    if rhs.array[row].abs() >= accept && row_entries[row] < best_entries {
                        pivot_i = Some(i);
                        best_entries = row_entries[row];
                    }
                }
            }

            let pivot_i = match pivot_i {
                Some(i) => i,
                None => continue, // no acceptable pivot; column dropped
            };

            let pivot_row = rhs.index[pivot_i];
            let pivot_val = rhs.array[pivot_row];

            {
                let orig_here = new2orig_row[n_pivots];
                let pivot_pos = orig2new_row[pivot_row];
                new2orig_row.swap(n_pivots, pivot_pos);
                orig2new_row.swap(orig_here, pivot_row);
            }

            for i in 0..upper_count {
                let row = rhs.index[i];
                let coeff = rhs.array[row];
                if coeff != 0.0 {
                    upper_index.push(row);
                    upper_value.push(coeff);
                }
            }
            upper_start.push(upper_index.len());
            pivot_value.push(pivot_val);
            pivot_var.push(self.basic[b_col]);

            for i in upper_count..rhs.index.len() {
                if i == pivot_i {
                    continue;
                }
                let row = rhs.index[i];
                let val = rhs.array[row];
                if val.abs() <= TINY {
                    continue;
                }
                lower_index.push(row);
                lower_value.push(val / pivot_val);
            }
            lower_start.push(lower_index.len());
            n_pivots += 1;
        }

        // unit pivots for any rows left unpivoted
        let deficiency = m - n_pivots;
        for pos in n_pivots..m {
            let row = new2orig_row[pos];
            upper_start.push(upper_index.len());
            pivot_value.push(1.0);
            pivot_var.push(self.num_col + row);
            lower_start.push(lower_index.len());
        }

        let l_nnz = lower_index.len();
        let u_nnz = upper_index.len();

        // install L
        self.l_pivot_index = new2orig_row;
        self.l_pivot_lookup = orig2new_row;
        self.l_start = lower_start;
        self.l_index = lower_index;
        self.l_value = lower_value;

        // row copy of L by counting transpose; slot i collects the entries
        // of original row l_pivot_index[i], indexed by the source column's
        // pivot row
        let mut lr_start = vec![0usize; m + 1];
        for &row in &self.l_index {
            lr_start[self.l_pivot_lookup[row] + 1] += 1;
        }
        for i in 1..=m {
            lr_start[i] += lr_start[i - 1];
        }
        let mut lr_cursor = lr_start.clone();
        let mut lr_index = vec![0usize; l_nnz];
        let mut lr_value = vec![0.0f64; l_nnz];
        for i in 0..m {
            let col_row = self.l_pivot_index[i];
            for k in self.l_start[i]..self.l_start[i + 1] {
                let slot = self.l_pivot_lookup[self.l_index[k]];
                lr_index[lr_cursor[slot]] = col_row;
                lr_value[lr_cursor[slot]] = self.l_value[k];
                lr_cursor[slot] += 1;
            }
        }
        self.lr_start = lr_start;
        self.lr_index = lr_index;
        self.lr_value = lr_value;

        // install U; columns are tight at build time
        self.u_start = upper_start;
        self.u_lastp = self.u_start[1..].to_vec();
        self.u_index = upper_index;
        self.u_value = upper_value;
        self.u_pivot_index = self.l_pivot_index.clone();
        self.u_pivot_value = pivot_value;
        self.u_pivot_lookup = vec![NIL; m];
        for (i, &row) in self.u_pivot_index.iter().enumerate() {
            self.u_pivot_lookup[row] = i;
        }

        // row copy of U, tight as well: every row starts with no free space
        let mut ur_counts = vec![0usize; m];
        for &row in &self.u_index {
            ur_counts[self.u_pivot_lookup[row]] += 1;
        }
        let mut ur_start = vec![0usize; m];
        let mut acc = 0;
        for i in 0..m {
            ur_start[i] = acc;
            acc += ur_counts[i];
        }
        let mut ur_cursor = ur_start.clone();
        let mut ur_index = vec![0usize; u_nnz];
        let mut ur_value = vec![0.0f64; u_nnz];
        for i in 0..m {
            let col_row = self.u_pivot_index[i];
            for k in self.u_start[i]..self.u_lastp[i] {
                let slot = self.u_pivot_lookup[self.u_index[k]];
                ur_index[ur_cursor[slot]] = col_row;
                ur_value[ur_cursor[slot]] = self.u_value[k];
                ur_cursor[slot] += 1;
            }
        }
        self.ur_start = ur_start;
        self.ur_lastp = ur_cursor;
        self.ur_space = vec![0; m];
        self.ur_index = ur_index;
        self.ur_value = ur_value;

        // the basic variable that pivoted on row i moves to slot i
        let mut reordered = vec![0usize; m];
        for i in 0..m {
            reordered[self.u_pivot_index[i]] = pivot_var[i];
        }
        self.basic = reordered;

        self.pf_pivot_index.clear();
        self.pf_start.clear();
        self.pf_start.push(0);
        self.pf_index.clear();
        self.pf_value.clear();

        self.u_total_entries = u_nnz + m;
        self.u_merit = m + 3 * (l_nnz + u_nnz) / 2;

        trace!("build: done, L nnz {}, U nnz {}", l_nnz, u_nnz);

        #[cfg(debug_assertions)]
        self.assert_consistent();

        if deficiency > 0 {
            debug!(
                "build: {} columns rejected, unit pivots substituted",
                deficiency
            );
            return Err(Error::RankDeficient(deficiency));
        }
        Ok(())
    }

    /// Structural self-check: pivot lookups, tombstone discipline, the
    /// agreement of the column and row views of U, and eta-file bounds.
    pub(crate) fn assert_consistent(&self) {
        let m = self.num_row;
        let slots = self.u_pivot_index.len();
        assert_eq!(self.u_start.len(), slots + 1);
        assert_eq!(self.u_lastp.len(), slots);
        assert_eq!(self.u_pivot_value.len(), slots);
        assert_eq!(self.ur_start.len(), slots);
        assert_eq!(self.ur_lastp.len(), slots);
        assert_eq!(self.ur_space.len(), slots);

        let mut live = vec![false; m];
        for i in 0..slots {
            let row = self.u_pivot_index[i];
            if row == NIL {
                assert_eq!(self.u_start[i], self.u_lastp[i]);
                assert_eq!(self.ur_start[i], self.ur_lastp[i]);
                assert_eq!(self.ur_space[i], 0);
                continue;
            }
            assert!(!live[row], "two live pivots for row {}", row);
            live[row] = true;
            assert_eq!(self.u_pivot_lookup[row], i);
            assert!(self.u_start[i] <= self.u_lastp[i]);
            assert!(self.u_lastp[i] <= self.u_start[i + 1]);
            assert!(self.ur_start[i] <= self.ur_lastp[i]);
            assert!(self.ur_lastp[i] + self.ur_space[i] <= self.ur_index.len());
        }
        assert!(live.iter().all(|&x| x), "row without a live pivot");

        let mut col_view = vec![];
        let mut row_view = vec![];
        for i in 0..slots {
            if self.u_pivot_index[i] == NIL {
                continue;
            }
            for k in self.u_start[i]..self.u_lastp[i] {
                col_view.push((self.u_pivot_lookup[self.u_index[k]], i, self.u_value[k].to_bits()));
            }
            for k in self.ur_start[i]..self.ur_lastp[i] {
                row_view.push((i, self.u_pivot_lookup[self.ur_index[k]], self.ur_value[k].to_bits()));
            }
        }
        col_view.sort_unstable();
        row_view.sort_unstable();
        assert_eq!(col_view, row_view, "column and row views of U disagree");

        assert_eq!(self.pf_start.len(), self.pf_pivot_index.len() + 1);
        assert_eq!(self.pf_start[0], 0);
        assert_eq!(*self.pf_start.last().unwrap(), self.pf_index.len());
        for w in self.pf_start.windows(2) {
            assert!(w[0] <= w[1]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helpers::{basis_residual, basis_residual_transpose, factor_from_rows, vec_from};
    use crate::Error;
    use rand::prelude::*;

    #[test]
    fn identity_basis_solves_exactly() {
        // S1
        let mut factor = factor_from_rows(&[vec![1.0, 0.0], vec![0.0, 1.0]], &[0, 1]);
        factor.build().unwrap();
        factor.assert_consistent();

        let mut rhs = vec_from(&[3.0, 5.0]);
        factor.ftran(&mut rhs, 1.0);
        assert_eq!(&rhs.array, &[3.0, 5.0]);

        let mut rhs = vec_from(&[3.0, 5.0]);
        factor.btran(&mut rhs, 1.0);
        assert_eq!(&rhs.array, &[3.0, 5.0]);
    }

    #[test]
    fn permuted_basis_solves_per_variable() {
        // S2: B is the permutation sending (x0, x1, x2) to (x1, x0, x2)
        let mut factor = factor_from_rows(
            &[
                vec![0.0, 1.0, 0.0],
                vec![1.0, 0.0, 0.0],
                vec![0.0, 0.0, 1.0],
            ],
            &[0, 1, 2],
        );
        factor.build().unwrap();

        let mut rhs = vec_from(&[1.0, 2.0, 3.0]);
        factor.ftran(&mut rhs, 1.0);

        // solution values keyed by variable: x0 = 2, x1 = 1, x2 = 3
        let mut by_var: Vec<(usize, f64)> = factor
            .basic()
            .iter()
            .enumerate()
            .map(|(row, &var)| (var, rhs.array[row]))
            .collect();
        by_var.sort_by_key(|&(var, _)| var);
        assert_eq!(by_var, vec![(0, 2.0), (1, 1.0), (2, 3.0)]);
    }

    #[test]
    fn basic_columns_ftran_to_unit_vectors() {
        let rows = [
            vec![2.0, 1.0, 0.0, 0.5],
            vec![0.0, 3.0, 1.0, 0.0],
            vec![1.0, 0.0, 4.0, 0.0],
            vec![0.0, 1.0, 0.0, 2.0],
        ];
        let mut factor = factor_from_rows(&rows, &[0, 1, 2, 3]);
        factor.build().unwrap();

        for row in 0..4 {
            let var = factor.basic()[row];
            let mut rhs = crate::WorkVector::new(4);
            rhs.add_scaled_column(factor.matrix(), var, 1.0);
            factor.ftran(&mut rhs, 1.0);
            for r in 0..4 {
                let want = if r == row { 1.0 } else { 0.0 };
                assert!((rhs.array[r] - want).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn logical_columns_are_accepted() {
        let rows = [vec![2.0, 1.0], vec![1.0, 1.0]];
        // one structural column, one slack
        let mut factor = factor_from_rows(&rows, &[0, 2 + 1]);
        factor.build().unwrap();
        factor.assert_consistent();

        let b = [4.0, 7.0];
        let mut rhs = vec_from(&b);
        factor.ftran(&mut rhs, 1.0);
        assert!(basis_residual(&factor, &rhs, &b) < 1e-12);
    }

    #[test]
    fn zero_column_reports_rank_deficiency() {
        // S6
        let rows = [vec![1.0, 0.0], vec![1.0, 0.0]];
        let mut factor = factor_from_rows(&rows, &[0, 1]);
        match factor.build() {
            Err(Error::RankDeficient(count)) => assert_eq!(count, 1),
            other => panic!("expected rank deficiency, got {:?}", other),
        }
        factor.assert_consistent();

        // the patched store is still usable; the dead slot became a logical
        let logicals = factor.basic().iter().filter(|&&v| v >= 2).count();
        assert_eq!(logicals, 1);
        let b = [3.0, 4.0];
        let mut rhs = vec_from(&b);
        factor.ftran(&mut rhs, 1.0);
        assert!(basis_residual(&factor, &rhs, &b) < 1e-12);
    }

    #[test]
    fn random_bases_have_small_residuals() {
        let mut rng = rand_pcg::Pcg64::seed_from_u64(12345);

        for &size in &[5usize, 10, 25] {
            for _ in 0..8 {
                let mut rows = vec![vec![0.0; size]; size];
                for r in 0..size {
                    rows[r][r] = rng.gen_range(0.5, 2.0);
                    for c in 0..size {
                        if r != c && rng.gen_range(0, 4) == 0 {
                            rows[r][c] = rng.gen_range(-1.0, 1.0);
                        }
                    }
                }
                let basic: Vec<usize> = (0..size).collect();
                let mut factor = factor_from_rows(&rows, &basic);
                factor.build().unwrap();
                factor.assert_consistent();

                let b: Vec<f64> = (0..size).map(|_| rng.gen_range(-1.0, 1.0)).collect();

                let mut x = vec_from(&b);
                factor.ftran(&mut x, 1.0);
                assert!(basis_residual(&factor, &x, &b) < 1e-6);

                let mut y = vec_from(&b);
                factor.btran(&mut y, 1.0);
                assert!(basis_residual_transpose(&factor, &y, &b) < 1e-6);
            }
        }
    }

    #[test]
    fn rebuild_after_updates_resets_the_eta_file() {
        let rows = [
            vec![1.0, 0.0, 0.0, 1.0],
            vec![1.0, 1.0, 0.0, 0.0],
            vec![0.0, 0.0, 1.0, 1.0],
        ];
        let mut factor = factor_from_rows(&rows, &[0, 1, 2]);
        factor.build().unwrap();

        let mut aq = crate::WorkVector::new(3);
        aq.add_scaled_column(factor.matrix(), 3, 1.0);
        factor.ftran(&mut aq, 1.0);
        let row_out = (0..3)
            .max_by(|&a, &b| {
                aq.array[a].abs().partial_cmp(&aq.array[b].abs()).unwrap()
            })
            .unwrap();
        let mut ep = crate::WorkVector::new(3);
        ep.set(std::iter::once((row_out, &1.0)));
        factor.btran(&mut ep, 1.0);
        factor.update(&aq, &ep, row_out, 3).unwrap();
        assert_eq!(factor.update_count(), 1);

        factor.build().unwrap();
        assert_eq!(factor.update_count(), 0);
        factor.assert_consistent();

        let b = [1.0, -2.0, 0.5];
        let mut x = vec_from(&b);
        factor.ftran(&mut x, 1.0);
        assert!(basis_residual(&factor, &x, &b) < 1e-10);
    }
}
