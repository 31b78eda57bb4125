/// A permutation in both directions.
#[derive(Clone, Debug)]
pub(crate) struct Perm {
    pub orig2new: Vec<usize>,
    pub new2orig: Vec<usize>,
}

/// Columns keyed by approximate degree, kept in doubly linked lists per
/// score so that removal and re-insertion are O(1).
#[derive(Debug)]
struct ScoreQueue {
    head: Vec<Option<usize>>,
    prev: Vec<usize>,
    next: Vec<usize>,
    min_score: usize,
}

impl ScoreQueue {
    fn new(num_cols: usize, max_score: usize) -> ScoreQueue {
        ScoreQueue {
            head: vec![None; max_score],
            prev: vec![0; num_cols],
            next: vec![0; num_cols],
            min_score: max_score,
        }
    }

    fn pop_min(&mut self) -> Option<usize> {
        let col = loop {
            if self.min_score >= self.head.len() {
                return None;
            }
            if let Some(col) = self.head[self.min_score] {
                break col;
            }
            self.min_score += 1;
        };
        self.remove(col, self.min_score);
        Some(col)
    }

    fn add(&mut self, col: usize, score: usize) {
        self.min_score = std::cmp::min(self.min_score, score);
        if let Some(head) = self.head[score] {
            self.prev[col] = self.prev[head];
            self.next[col] = head;
            self.next[self.prev[head]] = col;
            self.prev[head] = col;
        } else {
            self.prev[col] = col;
            self.next[col] = col;
            self.head[score] = Some(col);
        }
    }

    fn remove(&mut self, col: usize, score: usize) {
        if self.next[col] == col {
            self.head[score] = None;
        } else {
            self.next[self.prev[col]] = self.next[col];
            self.prev[self.next[col]] = self.prev[col];
            if self.head[score].unwrap() == col {
                self.head[score] = Some(self.next[col]);
            }
        }
    }
}

/// Approximate-minimum-degree column ordering (COLAMD flavour) over a set
/// of columns given in compressed form: column c occupies
/// `col_rows[col_start[c]..col_start[c + 1]]`. Empty columns are ordered
/// first and otherwise ignored; the factorization rejects them later.
pub(crate) fn order_colamd(num_rows: usize, col_start: &[usize], col_rows: &[usize]) -> Perm {
    let num_cols = col_start.len() - 1;

    let mut row_cols: Vec<Vec<usize>> = vec![vec![]; num_rows];
    let mut cols: Vec<Vec<usize>> = Vec::with_capacity(num_cols);
    let mut score: Vec<usize> = vec![0; num_cols];

    let mut queue = ScoreQueue::new(num_cols, std::cmp::max(num_cols, 1));

    for c in 0..num_cols {
        let rows = &col_rows[col_start[c]..col_start[c + 1]];
        cols.push(rows.to_vec());
        for &r in rows {
            row_cols[r].push(c);
        }
    }

    for c in 0..num_cols {
        let mut s = 0;
        for &r in &cols[c] {
            s += row_cols[r].len() - 1;
        }
        score[c] = std::cmp::min(s, num_cols - 1);
        queue.add(c, score[c]);
    }

    let mut new2orig = Vec::with_capacity(num_cols);

    // per-iteration scratch
    let mut seen_col = vec![false; num_cols];
    let mut absorbed = vec![false; num_rows];
    let mut diff = vec![0usize; num_rows];
    let mut touched_rows = vec![];
    let mut in_diff = vec![false; num_rows];

    while new2orig.len() < num_cols {
        let pivot_c = queue.pop_min().unwrap();
        new2orig.push(pivot_c);

        for &r in &cols[pivot_c] {
            absorbed[r] = true;
        }

        // union of the pivot column's rows, minus the pivot column itself
        let mut pivot_row = {
            let mut res = vec![];
            for &r in &cols[pivot_c] {
                for &c in &row_cols[r] {
                    if c != pivot_c && !seen_col[c] {
                        seen_col[c] = true;
                        res.push(c);
                    }
                }
                row_cols[r].clear();
            }
            for &c in &res {
                seen_col[c] = false;
            }
            res
        };

        let mut absorbed_rows = std::mem::replace(&mut cols[pivot_c], vec![]);

        // count, per remaining row, how many pivot-row columns still hit
        // it; a row hit by all of them adds nothing and is absorbed too
        for &c in &pivot_row {
            for &r in &cols[c] {
                if absorbed[r] {
                    continue;
                }
                if !in_diff[r] {
                    in_diff[r] = true;
                    touched_rows.push(r);
                    diff[r] = row_cols[r].len();
                }
                diff[r] -= 1;
                if diff[r] == 0 {
                    absorbed_rows.push(r);
                    absorbed[r] = true;
                    row_cols[r].clear();
                }
            }
        }

        for &c in &pivot_row {
            let mut i = 0;
            while i < cols[c].len() {
                if absorbed[cols[c][i]] {
                    cols[c].swap_remove(i);
                } else {
                    i += 1;
                }
            }
        }

        for &r in &absorbed_rows {
            absorbed[r] = false;
        }

        // columns whose remaining rows are all shared with the pivot row
        // cause no further fill and can be ordered immediately
        {
            let mut i = 0;
            while i < pivot_row.len() {
                let c = pivot_row[i];
                queue.remove(c, score[c]);

                let mut d = 0;
                for &r in &cols[c] {
                    d += diff[r];
                }

                if d == 0 {
                    new2orig.push(c);
                    pivot_row.swap_remove(i);
                    cols[c].clear();
                } else {
                    score[c] = d;
                    i += 1;
                }
            }
        }

        for &r in &touched_rows {
            diff[r] = 0;
            in_diff[r] = false;
        }
        touched_rows.clear();

        // fold the eliminated rows into a single representative row and
        // refresh the scores of the surviving pivot-row columns
        if let Some(&pivot_r) = absorbed_rows.first() {
            let pivot_row_len = pivot_row.len();
            row_cols[pivot_r] = pivot_row;
            for &c in &row_cols[pivot_r] {
                cols[c].push(pivot_r);
                score[c] = std::cmp::min(score[c] + pivot_row_len - 1, num_cols - 1);
                queue.add(c, score[c]);
            }
        }
    }

    let mut orig2new = vec![0; num_cols];
    for (new, &orig) in new2orig.iter().enumerate() {
        orig2new[orig] = new;
    }

    Perm { orig2new, new2orig }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_sparsest_first() {
        // four basis columns over four rows:
        //   c0 = rows {0,1,2,3}, c1 = {2}, c2 = {0,1}, c3 = {1,2,3}
        let col_start = [0, 4, 5, 7, 10];
        let col_rows = [0, 1, 2, 3, 2, 0, 1, 1, 2, 3];
        let perm = order_colamd(4, &col_start, &col_rows);
        assert_eq!(&perm.new2orig, &[1, 3, 0, 2]);
        assert_eq!(&perm.orig2new, &[2, 0, 3, 1]);
    }

    #[test]
    fn empty_column_is_ordered_without_panic() {
        let col_start = [0, 0, 1, 2];
        let col_rows = [0, 1];
        let perm = order_colamd(2, &col_start, &col_rows);
        assert_eq!(&perm.new2orig, &[0, 1, 2]);
    }
}
