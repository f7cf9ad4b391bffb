use serde::{Deserialize, Serialize};

/// Piecewise linear interpolant on a sorted grid.
///
/// Outside the grid the first or last segment is extended linearly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearInterp {
    x_grid: Vec<f64>,
    y_vals: Vec<f64>,
}

impl LinearInterp {
    /// The grid must be strictly increasing, with at least two points,
    /// and as long as the values.
    pub fn new(x_grid: Vec<f64>, y_vals: Vec<f64>) -> Option<Self> {
        if x_grid.len() < 2 || x_grid.len() != y_vals.len() {
            return None;
        }
        if x_grid.windows(2).any(|pair| pair[0] >= pair[1]) {
            return None;
        }
        Some(Self { x_grid, y_vals })
    }

    pub fn eval(&self, x: f64) -> f64 {
        let n = self.x_grid.len();
        // Index of the left end of the segment holding `x`.
        let i_seg = self
            .x_grid
            .partition_point(|&xi| xi <= x)
            .saturating_sub(1)
            .min(n - 2);

        let (x0, x1) = (self.x_grid[i_seg], self.x_grid[i_seg + 1]);
        let (y0, y1) = (self.y_vals[i_seg], self.y_vals[i_seg + 1]);
        y0 + (y1 - y0) * (x - x0) / (x1 - x0)
    }

    pub fn y_vals(&self) -> &[f64] {
        &self.y_vals
    }
}

/// `n` evenly spaced points from `start` to `stop` inclusive.
pub fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn interpolates_and_extrapolates() {
        let interp = LinearInterp::new(vec![0.0, 1.0, 2.0], vec![0.0, 2.0, 3.0]).unwrap();
        assert_relative_eq!(interp.eval(0.5), 1.0);
        assert_relative_eq!(interp.eval(1.0), 2.0);
        assert_relative_eq!(interp.eval(1.5), 2.5);
        assert_relative_eq!(interp.eval(-1.0), -2.0);
        assert_relative_eq!(interp.eval(3.0), 4.0);
    }

    #[test]
    fn rejects_bad_grids() {
        assert!(LinearInterp::new(vec![0.0], vec![1.0]).is_none());
        assert!(LinearInterp::new(vec![0.0, 0.0], vec![1.0, 2.0]).is_none());
        assert!(LinearInterp::new(vec![0.0, 1.0], vec![1.0]).is_none());
    }

    #[test]
    fn linspace_endpoints() {
        let grid = linspace(0.0001, 0.9999, 51);
        assert_eq!(grid.len(), 51);
        assert_relative_eq!(grid[0], 0.0001);
        assert_relative_eq!(grid[50], 0.9999, epsilon = 1e-12);
    }
}
