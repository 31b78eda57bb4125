use crate::factor::Factor;
use crate::vector::WorkVector;
use crate::{
    HYPER_BTRAN_L, HYPER_BTRAN_U, HYPER_CANCEL, HYPER_FTRAN_L, HYPER_FTRAN_U, NIL, TINY, ZERO,
};

/// Iterative DFS over a triangular adjacency, recording every node
/// reachable from the seed set in postorder. Iterating the result in
/// reverse yields a topological order, so a scatter-style solve can
/// process each node after all of its contributors.
///
/// One instance is shared by the factorization and all hyper-sparse
/// solves; `run` resets whatever the previous run marked.
#[derive(Clone, Debug)]
pub(crate) struct ReachMarker {
    stack: Vec<(usize, usize)>,
    marked: Vec<bool>,
    pub(crate) result: Vec<usize>,
}

impl ReachMarker {
    pub(crate) fn new(n: usize) -> ReachMarker {
        ReachMarker {
            stack: Vec::with_capacity(n),
            marked: vec![false; n],
            result: vec![],
        }
    }

    /// `children` is only consulted for nodes that pass `filter`.
    pub(crate) fn run<'a>(
        &mut self,
        seeds: &[usize],
        children: impl Fn(usize) -> &'a [usize],
        filter: impl Fn(usize) -> bool,
    ) {
        for &i in &self.result {
            self.marked[i] = false;
        }
        self.result.clear();

        for &seed in seeds {
            if self.marked[seed] || !filter(seed) {
                continue;
            }
            self.marked[seed] = true;
            self.stack.push((seed, 0));

            'descend: while let Some(&(node, next_child)) = self.stack.last() {
                let kids = children(node);
                let mut i = next_child;
                while i < kids.len() {
                    let kid = kids[i];
                    i += 1;
                    if !self.marked[kid] && filter(kid) {
                        self.marked[kid] = true;
                        self.stack.last_mut().unwrap().1 = i;
                        self.stack.push((kid, 0));
                        continue 'descend;
                    }
                }
                self.result.push(node);
                self.stack.pop();
            }
        }
    }
}

impl Factor {
    /// Solves B·x = r, overwriting `rhs` with x. `expected_density` is the
    /// caller's running average for this operation (see
    /// [`crate::running_density`]); it steers the hyper-sparse/dense
    /// choice together with the instantaneous density.
    ///
    /// Midway through the upper solve the vector is packed, so on return
    /// the pack holds the partial result that [`Factor::update`] expects
    /// for the entering column.
    pub fn ftran(&mut self, rhs: &mut WorkVector, expected_density: f64) {
        debug_assert_eq!(rhs.len(), self.num_row);
        self.ftran_l(rhs, expected_density);
        self.ftran_u(rhs, expected_density);
    }

    /// Solves Bᵀ·x = r, overwriting `rhs` with x. On return the pack holds
    /// the partial result that [`Factor::update`] expects for the leaving
    /// row.
    pub fn btran(&mut self, rhs: &mut WorkVector, expected_density: f64) {
        debug_assert_eq!(rhs.len(), self.num_row);
        self.btran_u(rhs, expected_density);
        self.btran_l(rhs, expected_density);
    }

    fn ftran_l(&mut self, rhs: &mut WorkVector, expected_density: f64) {
        let m = self.num_row;
        let current_density = rhs.count as f64 / m as f64;
        if current_density > HYPER_CANCEL || expected_density > HYPER_FTRAN_L {
            rhs.synthetic_tick += m as f64;
            rhs.index.clear();
            for i in 0..m {
                let pivot_row = self.l_pivot_index[i];
                let x = rhs.array[pivot_row];
                if x.abs() > TINY {
                    rhs.index.push(pivot_row);
                    for k in self.l_start[i]..self.l_start[i + 1] {
                        rhs.array[self.l_index[k]] -= x * self.l_value[k];
                    }
                } else {
                    rhs.array[pivot_row] = 0.0;
                }
            }
            rhs.count = rhs.index.len();
        } else {
            self.ftran_l_hyper(rhs);
        }
    }

    fn ftran_l_hyper(&mut self, rhs: &mut WorkVector) {
        let marker = &mut self.marker;
        let lookup = &self.l_pivot_lookup;
        let starts = &self.l_start;
        let index = &self.l_index;
        let values = &self.l_value;
        marker.run(
            &rhs.index,
            |r| &index[starts[lookup[r]]..starts[lookup[r] + 1]],
            |_| true,
        );

        rhs.index.clear();
        let mut work = 0usize;
        for i in (0..marker.result.len()).rev() {
            let row = marker.result[i];
            let x = rhs.array[row];
            if x.abs() > TINY {
                rhs.index.push(row);
                let slot = lookup[row];
                for k in starts[slot]..starts[slot + 1] {
                    rhs.array[index[k]] -= x * values[k];
                }
                work += starts[slot + 1] - starts[slot];
            } else {
                rhs.array[row] = 0.0;
            }
        }
        rhs.count = rhs.index.len();
        rhs.synthetic_tick += marker.result.len() as f64 * 20.0 + work as f64 * 10.0;
    }

    fn ftran_u(&mut self, rhs: &mut WorkVector, expected_density: f64) {
        // eta file first; the pack taken here is the partial result the
        // updater appends to U
        self.ftran_ft(rhs);
        rhs.tight();
        rhs.pack();

        let m = self.num_row;
        let slots = self.u_pivot_index.len();
        let current_density = rhs.count as f64 / m as f64;
        if current_density > HYPER_CANCEL || expected_density > HYPER_FTRAN_U {
            let mut ext_work = 0usize;
            rhs.synthetic_tick += m as f64;
            rhs.index.clear();
            for i in (0..slots).rev() {
                let pivot_row = self.u_pivot_index[i];
                if pivot_row == NIL {
                    continue;
                }
                let x = rhs.array[pivot_row];
                if x.abs() > TINY {
                    let x = x / self.u_pivot_value[i];
                    rhs.index.push(pivot_row);
                    rhs.array[pivot_row] = x;
                    let (start, end) = (self.u_start[i], self.u_lastp[i]);
                    if i >= m {
                        ext_work += end - start;
                    }
                    for k in start..end {
                        rhs.array[self.u_index[k]] -= x * self.u_value[k];
                    }
                } else {
                    rhs.array[pivot_row] = 0.0;
                }
            }
            rhs.count = rhs.index.len();
            rhs.synthetic_tick += ext_work as f64 * 15.0 + (slots - m) as f64 * 10.0;
        } else {
            self.ftran_u_hyper(rhs);
        }
    }

    fn ftran_u_hyper(&mut self, rhs: &mut WorkVector) {
        let m = self.num_row;
        let marker = &mut self.marker;
        let lookup = &self.u_pivot_lookup;
        let starts = &self.u_start;
        let lastp = &self.u_lastp;
        let index = &self.u_index;
        let values = &self.u_value;
        let pivot_value = &self.u_pivot_value;
        marker.run(
            &rhs.index,
            |r| &index[starts[lookup[r]]..lastp[lookup[r]]],
            |_| true,
        );

        rhs.index.clear();
        let mut work = 0usize;
        let mut ext_work = 0usize;
        for i in (0..marker.result.len()).rev() {
            let row = marker.result[i];
            let x = rhs.array[row];
            if x.abs() > TINY {
                let slot = lookup[row];
                let x = x / pivot_value[slot];
                rhs.index.push(row);
                rhs.array[row] = x;
                let (start, end) = (starts[slot], lastp[slot]);
                if slot >= m {
                    ext_work += end - start;
                }
                for k in start..end {
                    rhs.array[index[k]] -= x * values[k];
                }
                work += end - start;
            } else {
                rhs.array[row] = 0.0;
            }
        }
        rhs.count = rhs.index.len();
        rhs.synthetic_tick += marker.result.len() as f64 * 20.0 + work as f64 * 10.0;
        rhs.synthetic_tick +=
            ext_work as f64 * 15.0 + (self.u_pivot_index.len() - m) as f64 * 10.0;
    }

    fn btran_u(&mut self, rhs: &mut WorkVector, expected_density: f64) {
        let m = self.num_row;
        let slots = self.u_pivot_index.len();
        let current_density = rhs.count as f64 / m as f64;
        if current_density > HYPER_CANCEL || expected_density > HYPER_BTRAN_U {
            let mut ext_work = 0usize;
            rhs.synthetic_tick += m as f64;
            rhs.index.clear();
            for i in 0..slots {
                let pivot_row = self.u_pivot_index[i];
                if pivot_row == NIL {
                    continue;
                }
                let x = rhs.array[pivot_row];
                if x.abs() > TINY {
                    let x = x / self.u_pivot_value[i];
                    rhs.index.push(pivot_row);
                    rhs.array[pivot_row] = x;
                    let (start, end) = (self.ur_start[i], self.ur_lastp[i]);
                    if i >= m {
                        ext_work += end - start;
                    }
                    for k in start..end {
                        rhs.array[self.ur_index[k]] -= x * self.ur_value[k];
                    }
                } else {
                    rhs.array[pivot_row] = 0.0;
                }
            }
            rhs.count = rhs.index.len();
            rhs.synthetic_tick += ext_work as f64 * 15.0 + (slots - m) as f64 * 10.0;
        } else {
            self.btran_u_hyper(rhs);
        }

        // the pack taken here is the partial result the updater turns into
        // the next row eta
        rhs.tight();
        rhs.pack();
        self.btran_ft(rhs);
        rhs.tight();
    }

    fn btran_u_hyper(&mut self, rhs: &mut WorkVector) {
        let m = self.num_row;
        let marker = &mut self.marker;
        let lookup = &self.u_pivot_lookup;
        let starts = &self.ur_start;
        let lastp = &self.ur_lastp;
        let index = &self.ur_index;
        let values = &self.ur_value;
        let pivot_value = &self.u_pivot_value;
        marker.run(
            &rhs.index,
            |r| &index[starts[lookup[r]]..lastp[lookup[r]]],
            |_| true,
        );

        rhs.index.clear();
        let mut work = 0usize;
        let mut ext_work = 0usize;
        for i in (0..marker.result.len()).rev() {
            let row = marker.result[i];
            let x = rhs.array[row];
            if x.abs() > TINY {
                let slot = lookup[row];
                let x = x / pivot_value[slot];
                rhs.index.push(row);
                rhs.array[row] = x;
                let (start, end) = (starts[slot], lastp[slot]);
                if slot >= m {
                    ext_work += end - start;
                }
                for k in start..end {
                    rhs.array[index[k]] -= x * values[k];
                }
                work += end - start;
            } else {
                rhs.array[row] = 0.0;
            }
        }
        rhs.count = rhs.index.len();
        rhs.synthetic_tick += marker.result.len() as f64 * 20.0 + work as f64 * 10.0;
        rhs.synthetic_tick +=
            ext_work as f64 * 15.0 + (self.u_pivot_index.len() - m) as f64 * 10.0;
    }

    fn btran_l(&mut self, rhs: &mut WorkVector, expected_density: f64) {
        let m = self.num_row;
        let current_density = rhs.count as f64 / m as f64;
        if current_density > HYPER_CANCEL || expected_density > HYPER_BTRAN_L {
            rhs.synthetic_tick += m as f64;
            rhs.index.clear();
            for i in (0..m).rev() {
                let pivot_row = self.l_pivot_index[i];
                let x = rhs.array[pivot_row];
                if x.abs() > TINY {
                    rhs.index.push(pivot_row);
                    for k in self.lr_start[i]..self.lr_start[i + 1] {
                        rhs.array[self.lr_index[k]] -= x * self.lr_value[k];
                    }
                } else {
                    rhs.array[pivot_row] = 0.0;
                }
            }
            rhs.count = rhs.index.len();
        } else {
            self.btran_l_hyper(rhs);
        }
    }

    fn btran_l_hyper(&mut self, rhs: &mut WorkVector) {
        let marker = &mut self.marker;
        let lookup = &self.l_pivot_lookup;
        let starts = &self.lr_start;
        let index = &self.lr_index;
        let values = &self.lr_value;
        marker.run(
            &rhs.index,
            |r| &index[starts[lookup[r]]..starts[lookup[r] + 1]],
            |_| true,
        );

        rhs.index.clear();
        let mut work = 0usize;
        for i in (0..marker.result.len()).rev() {
            let row = marker.result[i];
            let x = rhs.array[row];
            if x.abs() > TINY {
                rhs.index.push(row);
                let slot = lookup[row];
                for k in starts[slot]..starts[slot + 1] {
                    rhs.array[index[k]] -= x * values[k];
                }
                work += starts[slot + 1] - starts[slot];
            } else {
                rhs.array[row] = 0.0;
            }
        }
        rhs.count = rhs.index.len();
        rhs.synthetic_tick += marker.result.len() as f64 * 20.0 + work as f64 * 10.0;
    }

    /// Forward pass over the row-eta file. Each eta replaces the value at
    /// its pivot row by `v₀ − Σ vⱼ·etaⱼ`; a position that was zero before
    /// and after contributes nothing and stays unrecorded.
    fn ftran_ft(&mut self, rhs: &mut WorkVector) {
        let eta_count = self.pf_pivot_index.len();
        if eta_count == 0 {
            return;
        }
        for i in 0..eta_count {
            let row = self.pf_pivot_index[i];
            let value0 = rhs.array[row];
            let mut value1 = value0;
            for k in self.pf_start[i]..self.pf_start[i + 1] {
                value1 -= rhs.array[self.pf_index[k]] * self.pf_value[k];
            }
            if value0 != 0.0 || value1 != 0.0 {
                if value0 == 0.0 {
                    rhs.index.push(row);
                }
                rhs.array[row] = if value1.abs() < TINY { ZERO } else { value1 };
            }
        }
        rhs.count = rhs.index.len();

        let entries = self.pf_start[eta_count];
        rhs.synthetic_tick += eta_count as f64 * 20.0 + entries as f64 * 5.0;
        if entries / (eta_count + 1) < 5 {
            rhs.synthetic_tick += entries as f64 * 5.0;
        }
    }

    /// Backward pass over the row-eta file, scattering each pivot value
    /// into its eta's positions.
    fn btran_ft(&mut self, rhs: &mut WorkVector) {
        let eta_count = self.pf_pivot_index.len();
        let mut work = 0usize;
        for i in (0..eta_count).rev() {
            let x = rhs.array[self.pf_pivot_index[i]];
            if x != 0.0 {
                for k in self.pf_start[i]..self.pf_start[i + 1] {
                    let row = self.pf_index[k];
                    let value0 = rhs.array[row];
                    let value1 = value0 - x * self.pf_value[k];
                    if value0 == 0.0 {
                        rhs.index.push(row);
                    }
                    rhs.array[row] = if value1.abs() < TINY { ZERO } else { value1 };
                }
                work += self.pf_start[i + 1] - self.pf_start[i];
            }
        }
        rhs.count = rhs.index.len();
        rhs.synthetic_tick += work as f64 * 15.0 + eta_count as f64 * 10.0;
    }
}

#[cfg(test)]
mod tests {
    use crate::helpers::{factor_from_rows, vec_from};
    use crate::WorkVector;

    #[test]
    fn hyper_and_dense_paths_agree() {
        use rand::prelude::*;
        let mut rng = rand_pcg::Pcg64::seed_from_u64(7);

        let size = 60;
        let mut rows = vec![vec![0.0; size]; size];
        for r in 0..size {
            rows[r][r] = rng.gen_range(1.0, 2.0);
            for c in 0..size {
                if r != c && rng.gen_range(0, 6) == 0 {
                    rows[r][c] = rng.gen_range(-1.0, 1.0);
                }
            }
        }
        let basic: Vec<usize> = (0..size).collect();
        let mut factor = factor_from_rows(&rows, &basic);
        factor.build().unwrap();

        let mut sparse_rhs = WorkVector::new(size);
        sparse_rhs.set([(3usize, &1.0f64), (17, &-0.5)].iter().cloned());

        let mut dense_solved = sparse_rhs.clone();
        factor.ftran(&mut dense_solved, 1.0);
        let mut hyper_solved = sparse_rhs.clone();
        factor.ftran(&mut hyper_solved, 0.0);
        for i in 0..size {
            assert!((dense_solved.array[i] - hyper_solved.array[i]).abs() < 1e-12);
        }

        let mut dense_solved = sparse_rhs.clone();
        factor.btran(&mut dense_solved, 1.0);
        let mut hyper_solved = sparse_rhs;
        factor.btran(&mut hyper_solved, 0.0);
        for i in 0..size {
            assert!((dense_solved.array[i] - hyper_solved.array[i]).abs() < 1e-12);
        }
    }

    #[test]
    fn single_nonzero_rhs_stays_hyper_sparse() {
        // S4: the work counter exposes which branch ran
        let m = 1000;
        let mut rows = vec![vec![0.0; m]; m];
        for i in 0..m {
            rows[i][i] = 1.0;
        }
        let basic: Vec<usize> = (0..m).collect();
        let mut factor = factor_from_rows(&rows, &basic);
        factor.build().unwrap();

        let mut rhs = WorkVector::new(m);
        rhs.set(std::iter::once((500usize, &2.0f64)));
        factor.ftran(&mut rhs, 0.0);
        assert_eq!(rhs.array[500], 2.0);
        assert!(rhs.synthetic_tick < m as f64);

        let mut rhs = WorkVector::new(m);
        rhs.set(std::iter::once((500usize, &2.0f64)));
        factor.ftran(&mut rhs, 1.0);
        assert!(rhs.synthetic_tick >= m as f64);
    }

    #[test]
    fn btran_of_unit_vector_gives_inverse_row() {
        let rows = [vec![2.0, 0.0], vec![1.0, 4.0]];
        let mut factor = factor_from_rows(&rows, &[0, 1]);
        factor.build().unwrap();

        // row 0 of B^{-1} for B = [[2,0],[1,4]] is (0.5, 0)
        let mut rhs = vec_from(&[1.0, 0.0]);
        factor.btran(&mut rhs, 1.0);
        assert!((rhs.array[0] - 0.5).abs() < 1e-12);
        assert!(rhs.array[1].abs() < 1e-12);
    }
}
