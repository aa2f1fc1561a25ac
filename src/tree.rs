//! Space-partitioning tree for Barnes-Hut repulsion estimates.
//!
//! A cell splits into `2^d` equally sized children (a quadtree in 2D, an
//! octree in 3D). Every cell tracks how many points it holds and their centre
//! of mass, so a distant cell can stand in for all of its points when the
//! repulsive force on a single point is estimated.
//!
//! Cells live in a flat arena; the `2^d` children of a cell are stored
//! consecutively and referenced by the index of the first one.

use ndarray::ArrayView2;

/// Largest supported embedding dimensionality.
pub const MAX_DIMS: usize = 3;

/// Depth at which distinct but nearly identical points share a leaf.
const MAX_DEPTH: usize = 48;

#[derive(Debug, Clone)]
struct Cell {
    center: [f64; MAX_DIMS],
    half_width: [f64; MAX_DIMS],
    center_of_mass: [f64; MAX_DIMS],
    mass: usize,
    /// Points held by a leaf; more than one only for coincident points
    points: Vec<usize>,
    first_child: Option<usize>,
}

impl Cell {
    fn new(center: [f64; MAX_DIMS], half_width: [f64; MAX_DIMS]) -> Self {
        Self {
            center,
            half_width,
            center_of_mass: [0.0; MAX_DIMS],
            mass: 0,
            points: Vec::new(),
            first_child: None,
        }
    }
}

/// Barnes-Hut tree over the rows of an embedding.
#[derive(Debug, Clone)]
pub struct SpaceTree<'a> {
    y: ArrayView2<'a, f64>,
    dims: usize,
    cells: Vec<Cell>,
}

impl<'a> SpaceTree<'a> {
    /// Builds a tree containing every row of `y`.
    ///
    /// # Panics
    /// * If `y` has more than [`MAX_DIMS`] columns
    #[must_use]
    pub fn build(y: ArrayView2<'a, f64>) -> Self {
        let (n, dims) = y.dim();
        assert!(dims <= MAX_DIMS, "embedding has {dims} dimensions");

        let mut center = [0.0; MAX_DIMS];
        let mut half_width = [0.0; MAX_DIMS];
        if n > 0 {
            #[allow(clippy::cast_precision_loss)]
            let count = n as f64;
            for d in 0..dims {
                let column = y.column(d);
                let mean = column.sum() / count;
                let spread = column.iter().map(|v| (v - mean).abs()).fold(0.0, f64::max);
                center[d] = mean;
                half_width[d] = spread + 1e-5;
            }
        }

        let mut tree = Self {
            y,
            dims,
            cells: vec![Cell::new(center, half_width)],
        };

        for i in 0..n {
            tree.insert(0, i, 0);
        }

        tree
    }

    fn point(&self, i: usize) -> [f64; MAX_DIMS] {
        let mut p = [0.0; MAX_DIMS];
        for d in 0..self.dims {
            p[d] = self.y[[i, d]];
        }
        p
    }

    /// Index of the child of `cell` whose orthant contains `p`.
    fn child_for(&self, cell: usize, p: &[f64; MAX_DIMS]) -> usize {
        let c = &self.cells[cell];
        let offset = (0..self.dims)
            .filter(|&d| p[d] > c.center[d])
            .fold(0, |acc, d| acc | (1 << d));
        c.first_child.map_or(cell, |first| first + offset)
    }

    fn insert(&mut self, cell: usize, i: usize, depth: usize) {
        let p = self.point(i);

        {
            let c = &mut self.cells[cell];
            c.mass += 1;
            #[allow(clippy::cast_precision_loss)]
            let mass = c.mass as f64;
            for d in 0..self.dims {
                c.center_of_mass[d] += (p[d] - c.center_of_mass[d]) / mass;
            }
        }

        if self.cells[cell].first_child.is_some() {
            let child = self.child_for(cell, &p);
            self.insert(child, i, depth + 1);
            return;
        }

        let coincident = self.cells[cell]
            .points
            .first()
            .map_or(true, |&q| self.point(q) == p);
        if coincident || depth >= MAX_DEPTH {
            self.cells[cell].points.push(i);
            return;
        }

        self.subdivide(cell);
        let displaced = std::mem::take(&mut self.cells[cell].points);
        for q in displaced.into_iter().chain(std::iter::once(i)) {
            let child = self.child_for(cell, &self.point(q));
            self.insert(child, q, depth + 1);
        }
    }

    fn subdivide(&mut self, cell: usize) {
        let first = self.cells.len();
        let (center, half_width) = {
            let c = &self.cells[cell];
            (c.center, c.half_width)
        };

        for offset in 0..(1 << self.dims) {
            let mut child_center = [0.0; MAX_DIMS];
            let mut child_half_width = [0.0; MAX_DIMS];
            for d in 0..self.dims {
                child_half_width[d] = half_width[d] / 2.0;
                child_center[d] = if offset & (1 << d) == 0 {
                    center[d] - child_half_width[d]
                } else {
                    center[d] + child_half_width[d]
                };
            }
            self.cells.push(Cell::new(child_center, child_half_width));
        }

        self.cells[cell].first_child = Some(first);
    }

    /// Estimates the unnormalized repulsive force on point `i`.
    ///
    /// A cell is summarized by its centre of mass when it is a leaf or when
    /// its largest half-width divided by its distance to the point is below
    /// `theta`; otherwise its children are visited. `theta = 0` visits every
    /// leaf and gives the exact sum. Cells on the path to point `i` are
    /// summarized without `i`'s own mass.
    ///
    /// # Returns
    /// A tuple containing:
    /// * The force `sum_j q_ij^2 (y_i - y_j)`, first `d` entries used
    /// * The kernel mass `sum_j q_ij` with `q_ij = 1 / (1 + |y_i - y_j|^2)`
    #[must_use]
    pub fn repulsion(&self, i: usize, theta: f64) -> ([f64; MAX_DIMS], f64) {
        let p = self.point(i);
        let mut force = [0.0; MAX_DIMS];
        let mut sum_q = 0.0;
        self.visit(0, &p, true, theta, &mut force, &mut sum_q);
        (force, sum_q)
    }

    fn visit(
        &self,
        cell: usize,
        p: &[f64; MAX_DIMS],
        holds_point: bool,
        theta: f64,
        force: &mut [f64; MAX_DIMS],
        sum_q: &mut f64,
    ) {
        let c = &self.cells[cell];
        let mass = c.mass - usize::from(holds_point);
        if mass == 0 {
            return;
        }

        #[allow(clippy::cast_precision_loss)]
        let (total, rest) = (c.mass as f64, mass as f64);
        let mut diff = [0.0; MAX_DIMS];
        let mut sq_dist = 0.0;
        for d in 0..self.dims {
            let center_of_mass = if holds_point {
                (c.center_of_mass[d] * total - p[d]) / rest
            } else {
                c.center_of_mass[d]
            };
            diff[d] = p[d] - center_of_mass;
            sq_dist += diff[d] * diff[d];
        }

        let max_width = c.half_width[..self.dims].iter().copied().fold(0.0, f64::max);

        match c.first_child {
            Some(first) if max_width >= theta * sq_dist.sqrt() => {
                let path = holds_point.then(|| self.child_for(cell, p));
                for child in first..first + (1 << self.dims) {
                    self.visit(child, p, path == Some(child), theta, force, sum_q);
                }
            }
            _ => {
                let q = 1.0 / (1.0 + sq_dist);
                *sum_q += rest * q;
                let mult = rest * q * q;
                for d in 0..self.dims {
                    force[d] += mult * diff[d];
                }
            }
        }
    }

    /// Number of points in the tree.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells[0].mass
    }

    /// Whether the tree holds no points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn exact_repulsion(y: &Array2<f64>, i: usize) -> ([f64; MAX_DIMS], f64) {
        let mut force = [0.0; MAX_DIMS];
        let mut sum_q = 0.0;
        for j in 0..y.nrows() {
            if j == i {
                continue;
            }
            let diff: Vec<f64> = (0..y.ncols()).map(|d| y[[i, d]] - y[[j, d]]).collect();
            let q = 1.0 / (1.0 + diff.iter().map(|v| v * v).sum::<f64>());
            sum_q += q;
            for (d, v) in diff.iter().enumerate() {
                force[d] += q * q * v;
            }
        }
        (force, sum_q)
    }

    #[test]
    fn test_mass_and_center() {
        let y = array![[0.0, 0.0], [2.0, 0.0], [0.0, 2.0], [2.0, 2.0]];
        let tree = SpaceTree::build(y.view());

        assert_eq!(tree.len(), 4);
        assert_abs_diff_eq!(tree.cells[0].center_of_mass[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(tree.cells[0].center_of_mass[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_zero_theta_is_exact() {
        for dims in [2, 3] {
            let mut rng = SmallRng::seed_from_u64(7);
            let y = Array2::random_using((60, dims), Uniform::new(-5.0, 5.0), &mut rng);
            let tree = SpaceTree::build(y.view());

            for i in 0..y.nrows() {
                let (force, sum_q) = tree.repulsion(i, 0.0);
                let (expected_force, expected_sum_q) = exact_repulsion(&y, i);
                assert_abs_diff_eq!(sum_q, expected_sum_q, epsilon = 1e-10);
                for d in 0..dims {
                    assert_abs_diff_eq!(force[d], expected_force[d], epsilon = 1e-10);
                }
            }
        }
    }

    /// Worst relative error of the per-point kernel mass and of its total.
    fn approximation_error(dims: usize, theta: f64) -> (f64, f64) {
        let mut rng = SmallRng::seed_from_u64(11);
        let y = Array2::random_using((300, dims), Uniform::new(-20.0, 20.0), &mut rng);
        let tree = SpaceTree::build(y.view());

        let mut worst: f64 = 0.0;
        let (mut total, mut expected_total) = (0.0, 0.0);
        for i in (0..y.nrows()).step_by(17) {
            let (_, sum_q) = tree.repulsion(i, theta);
            let (_, expected_sum_q) = exact_repulsion(&y, i);
            worst = worst.max((sum_q - expected_sum_q).abs() / expected_sum_q);
            total += sum_q;
            expected_total += expected_sum_q;
        }
        (worst, (total - expected_total).abs() / expected_total)
    }

    #[test]
    fn test_approximation_is_close() {
        // Summarizing a cell at its centre of mass underestimates nearby
        // kernel mass; at theta 0.5 single points stay within about 15% and
        // the total within about 6% on uniform data
        for dims in [2, 3] {
            let (worst, total) = approximation_error(dims, 0.5);
            assert!(worst < 0.25, "dims {dims}: point error {worst}");
            assert!(total < 0.1, "dims {dims}: total error {total}");

            let (worst, _) = approximation_error(dims, 0.2);
            assert!(worst < 0.03, "dims {dims}: point error {worst}");
        }
    }

    #[test]
    fn test_summarized_cell_excludes_own_mass() {
        let y = array![[0.0, 0.0], [2.0, 0.0], [0.0, 2.0], [2.0, 2.0]];
        let tree = SpaceTree::build(y.view());

        // The root is summarized at once; the other three points have their
        // centre of mass at (4/3, 4/3)
        let (force, sum_q) = tree.repulsion(0, 10.0);
        assert_abs_diff_eq!(sum_q, 27.0 / 41.0, epsilon = 1e-12);
        assert_abs_diff_eq!(force[0], -324.0 / 1681.0, epsilon = 1e-12);
        assert_abs_diff_eq!(force[1], -324.0 / 1681.0, epsilon = 1e-12);
    }

    #[test]
    fn test_coincident_points() {
        let y = array![[1.0, 1.0], [1.0, 1.0], [1.0, 1.0], [4.0, 5.0]];
        let tree = SpaceTree::build(y.view());
        assert_eq!(tree.len(), 4);

        // Two coincident partners each contribute q = 1 and no force
        let (force, sum_q) = tree.repulsion(0, 0.0);
        let (expected_force, expected_sum_q) = exact_repulsion(&y, 0);
        assert_abs_diff_eq!(sum_q, expected_sum_q, epsilon = 1e-12);
        assert_abs_diff_eq!(force[0], expected_force[0], epsilon = 1e-12);
        assert_abs_diff_eq!(force[1], expected_force[1], epsilon = 1e-12);
    }

    #[test]
    fn test_empty_and_single() {
        let empty = Array2::<f64>::zeros((0, 2));
        assert!(SpaceTree::build(empty.view()).is_empty());

        let single = array![[3.0, -1.0, 2.0]];
        let tree = SpaceTree::build(single.view());
        assert_eq!(tree.repulsion(0, 0.5), ([0.0; MAX_DIMS], 0.0));
    }
}
