use crate::factor::Factor;
use crate::vector::WorkVector;
use crate::{Error, UpdateHint, NIL, TINY};

impl Factor {
    /// Replaces the basic column pivoting on `row_out` by the column of
    /// `var_in`, patching U, its row mirror, and the eta file in place.
    ///
    /// `aq` must be the [`Factor::ftran`] output for the entering column
    /// and `ep` the [`Factor::btran`] output for the unit vector of
    /// `row_out`; both solves leave the partial results this method needs
    /// in the pack arrays. On success `basic[row_out]` becomes `var_in`.
    ///
    /// Returns [`Error::Numerical`] without touching the store when the
    /// replacement pivot is too small to be trusted; the caller must then
    /// refactorize.
    pub fn update(
        &mut self,
        aq: &WorkVector,
        ep: &WorkVector,
        row_out: usize,
        var_in: usize,
    ) -> Result<UpdateHint, Error> {
        debug_assert!(row_out < self.num_row);
        debug_assert!(var_in < self.num_col + self.num_row);

        let p_logic = self.u_pivot_lookup[row_out];
        let pivot = self.u_pivot_value[p_logic];
        let alpha = aq.array[row_out];
        let new_pivot = pivot * alpha;
        if alpha.abs() <= TINY
            || !new_pivot.is_finite()
            || new_pivot.abs() <= self.opts.pivot_tolerance
        {
            return Err(Error::Numerical);
        }

        // sizes of the outgoing pivot's row and column, for the entry
        // accounting at the end; neither range changes below
        let dead_row_len = self.ur_lastp[p_logic] - self.ur_start[p_logic];
        let dead_col_len = self.u_lastp[p_logic] - self.u_start[p_logic];

        self.u_pivot_index[p_logic] = NIL;

        // delete the pivotal row from the column view: in every column
        // holding an entry of row_out, swap that entry with the column's
        // last live entry and shrink the live range
        for k in self.ur_start[p_logic]..self.ur_lastp[p_logic] {
            let i_logic = self.u_pivot_lookup[self.ur_index[k]];
            self.u_lastp[i_logic] -= 1;
            let last = self.u_lastp[i_logic];
            let mut find = self.u_start[i_logic];
            while find < last && self.u_index[find] != row_out {
                find += 1;
            }
            self.u_index[find] = self.u_index[last];
            self.u_value[find] = self.u_value[last];
        }

        // delete the pivotal column from the row view, symmetrically; the
        // freed slot becomes usable space at the row's tail
        for k in self.u_start[p_logic]..self.u_lastp[p_logic] {
            let i_logic = self.u_pivot_lookup[self.u_index[k]];
            self.ur_lastp[i_logic] -= 1;
            self.ur_space[i_logic] += 1;
            let last = self.ur_lastp[i_logic];
            let mut find = self.ur_start[i_logic];
            while find < last && self.ur_index[find] != row_out {
                find += 1;
            }
            self.ur_index[find] = self.ur_index[last];
            self.ur_value[find] = self.ur_value[last];
        }

        // append the entering column (its partial-solve pack, minus the
        // pivot position) as the newest column of U
        debug_assert_eq!(*self.u_start.last().unwrap(), self.u_index.len());
        let new_start = self.u_index.len();
        for i in 0..aq.pack_count {
            let row = aq.pack_index[i];
            if row != row_out {
                self.u_index.push(row);
                self.u_value.push(aq.pack_value[i]);
            }
        }
        let new_end = self.u_index.len();
        self.u_start.push(new_end);
        self.u_lastp.push(new_end);
        self.u_total_entries += new_end - new_start + 1;

        // mirror the new column into the row view, row by row; a full row
        // is relocated to the tail of the backing arrays with fresh
        // headroom, leaving its neighbours in place
        for k in new_start..new_end {
            let row = self.u_index[k];
            let i_logic = self.u_pivot_lookup[row];
            if self.ur_space[i_logic] == 0 {
                let start = self.ur_start[i_logic];
                let count = self.ur_lastp[i_logic] - start;
                let space = (count as f64 * 1.1).ceil() as usize + 5;
                let moved_to = self.ur_index.len();
                self.ur_index.resize(moved_to + space, 0);
                self.ur_value.resize(moved_to + space, 0.0);
                self.ur_index.copy_within(start..start + count, moved_to);
                self.ur_value.copy_within(start..start + count, moved_to);
                self.ur_start[i_logic] = moved_to;
                self.ur_lastp[i_logic] = moved_to + count;
                self.ur_space[i_logic] = space - count;
            }
            self.ur_space[i_logic] -= 1;
            let put = self.ur_lastp[i_logic];
            self.ur_lastp[i_logic] += 1;
            self.ur_index[put] = row_out;
            self.ur_value[put] = self.u_value[k];
        }

        // the new pivot's row slot starts empty and inherits the dead
        // row's region as free space
        let dead_start = self.ur_start[p_logic];
        let dead_space = self.ur_space[p_logic];
        self.ur_start.push(dead_start);
        self.ur_lastp.push(dead_start);
        self.ur_space.push(dead_space + dead_row_len);

        self.u_pivot_lookup[row_out] = self.u_pivot_index.len();
        self.u_pivot_index.push(row_out);
        self.u_pivot_value.push(new_pivot);

        // turn the leaving row's partial BTRAN result into a row eta
        for i in 0..ep.pack_count {
            let row = ep.pack_index[i];
            if row != row_out {
                self.pf_index.push(row);
                self.pf_value.push(-ep.pack_value[i] * pivot);
            }
        }
        self.u_total_entries += self.pf_index.len() - *self.pf_start.last().unwrap();
        self.pf_pivot_index.push(row_out);
        self.pf_start.push(self.pf_index.len());

        self.u_total_entries -= dead_col_len + dead_row_len;

        // tombstoned slots keep empty ranges
        self.u_lastp[p_logic] = self.u_start[p_logic];
        self.ur_lastp[p_logic] = self.ur_start[p_logic];
        self.ur_space[p_logic] = 0;

        self.basic[row_out] = var_in;

        #[cfg(debug_assertions)]
        self.assert_consistent();

        if self.pf_pivot_index.len() >= self.opts.update_limit
            || self.u_total_entries > self.u_merit
        {
            debug!(
                "update: refactorization advised after {} updates, {} live entries",
                self.pf_pivot_index.len(),
                self.u_total_entries
            );
            Ok(UpdateHint::UpdateLimitReached)
        } else {
            Ok(UpdateHint::Ok)
        }
    }
}
