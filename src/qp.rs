//! Convex quadratic programs and the solver seam.
//!
//! Problems are stated as
//!
//! ```text
//! minimize    ½ xᵗPx + qᵗx
//! subject to  Aₑx  = bₑ
//!             Aᵢx ≤ bᵢ
//! ```
//!
//! and handed to a [`QpSolver`]. The default backend is Clarabel.

use crate::error::{BalancerError, Result};
use crate::types::SolveStatus;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Sparse linear row: `(column, coefficient)` pairs.
pub type SparseRow = Vec<(usize, f64)>;

/// A convex QP over `n` variables.
#[derive(Debug, Clone, PartialEq)]
pub struct QuadraticProgram {
    n: usize,
    /// Dense symmetric `n × n` quadratic term.
    p: Vec<Vec<f64>>,
    q: Vec<f64>,
    equalities: Vec<(SparseRow, f64)>,
    inequalities: Vec<(SparseRow, f64)>,
}

impl QuadraticProgram {
    /// Empty program over `n` variables (zero objective, no constraints).
    pub fn new(n: usize) -> Self {
        Self {
            n,
            p: vec![vec![0.0; n]; n],
            q: vec![0.0; n],
            equalities: Vec::new(),
            inequalities: Vec::new(),
        }
    }

    pub fn num_vars(&self) -> usize {
        self.n
    }

    pub fn num_constraints(&self) -> usize {
        self.equalities.len() + self.inequalities.len()
    }

    /// Add `value` to `P[i][j]` and `P[j][i]` (once on the diagonal).
    pub fn add_quadratic(&mut self, i: usize, j: usize, value: f64) {
        self.p[i][j] += value;
        if i != j {
            self.p[j][i] += value;
        }
    }

    pub fn set_linear(&mut self, i: usize, value: f64) {
        self.q[i] = value;
    }

    /// `Σ coef·x = rhs`
    pub fn add_equality(&mut self, row: SparseRow, rhs: f64) {
        self.equalities.push((row, rhs));
    }

    /// `Σ coef·x ≤ rhs`
    pub fn add_inequality(&mut self, row: SparseRow, rhs: f64) {
        self.inequalities.push((row, rhs));
    }

    /// `x_i ≥ lower`
    pub fn add_lower_bound(&mut self, i: usize, lower: f64) {
        self.add_inequality(vec![(i, -1.0)], -lower);
    }

    /// `x_i ≤ upper`
    pub fn add_upper_bound(&mut self, i: usize, upper: f64) {
        self.add_inequality(vec![(i, 1.0)], upper);
    }

    pub fn quadratic(&self) -> &[Vec<f64>] {
        &self.p
    }

    pub fn linear(&self) -> &[f64] {
        &self.q
    }

    pub fn equalities(&self) -> &[(SparseRow, f64)] {
        &self.equalities
    }

    pub fn inequalities(&self) -> &[(SparseRow, f64)] {
        &self.inequalities
    }

    /// Objective value at `x`.
    pub fn objective(&self, x: &[f64]) -> f64 {
        let mut quad = 0.0;
        for i in 0..self.n {
            for j in 0..self.n {
                quad += x[i] * self.p[i][j] * x[j];
            }
        }
        0.5 * quad + self.q.iter().zip(x).map(|(q, x)| q * x).sum::<f64>()
    }

    fn validate(&self) -> Result<()> {
        if self.n == 0 {
            return Err(BalancerError::InvalidInput(
                "quadratic program has no variables".to_string(),
            ));
        }
        let rows = self.equalities.iter().chain(self.inequalities.iter());
        for (row, rhs) in rows {
            if !rhs.is_finite() {
                return Err(BalancerError::InvalidInput(format!(
                    "non-finite constraint bound {}",
                    rhs
                )));
            }
            for &(col, coef) in row {
                if col >= self.n {
                    return Err(BalancerError::DimensionMismatch {
                        expected: self.n,
                        actual: col + 1,
                    });
                }
                if !coef.is_finite() {
                    return Err(BalancerError::InvalidInput(format!(
                        "non-finite constraint coefficient {}",
                        coef
                    )));
                }
            }
        }
        if self.p.iter().flatten().chain(self.q.iter()).any(|v| !v.is_finite()) {
            return Err(BalancerError::InvalidInput(
                "non-finite objective coefficient".to_string(),
            ));
        }
        Ok(())
    }
}

/// Primal solution of a QP.
#[derive(Debug, Clone, PartialEq)]
pub struct QpSolution {
    pub x: Vec<f64>,
    pub status: SolveStatus,
    pub objective: f64,
}

/// Backend capable of solving a [`QuadraticProgram`].
///
/// Non-optimal outcomes are reported through [`QpSolution::status`];
/// `Err` is reserved for malformed problems or backend setup failures.
pub trait QpSolver: Send + Sync {
    fn solve(&self, problem: &QuadraticProgram) -> Result<QpSolution>;
}

/// Solver limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverSettings {
    /// Maximum interior-point iterations.
    #[serde(default = "default_max_iter")]
    pub max_iter: u32,
    /// Wall-clock limit in seconds.
    #[serde(default = "default_time_limit")]
    pub time_limit_secs: f64,
    #[serde(default)]
    pub verbose: bool,
}

fn default_max_iter() -> u32 {
    200
}

fn default_time_limit() -> f64 {
    10.0
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            max_iter: default_max_iter(),
            time_limit_secs: default_time_limit(),
            verbose: false,
        }
    }
}

/// Interior-point solver backed by Clarabel.
#[derive(Debug, Clone, Default)]
pub struct ClarabelSolver {
    pub settings: SolverSettings,
}

impl ClarabelSolver {
    pub fn new(settings: SolverSettings) -> Self {
        Self { settings }
    }
}

/// Column-major (CSC) arrays for a row-oriented sparse matrix.
fn to_csc(
    rows: usize,
    cols: usize,
    entries: impl Iterator<Item = (usize, usize, f64)>,
) -> (Vec<usize>, Vec<usize>, Vec<f64>) {
    let mut by_col: Vec<Vec<(usize, f64)>> = vec![Vec::new(); cols];
    for (r, c, v) in entries {
        debug_assert!(r < rows);
        if v != 0.0 {
            by_col[c].push((r, v));
        }
    }
    let mut colptr = vec![0];
    let mut rowval = Vec::new();
    let mut nzval = Vec::new();
    for mut col in by_col {
        col.sort_by_key(|(r, _)| *r);
        // merge duplicate entries in the same cell
        let mut merged: Vec<(usize, f64)> = Vec::with_capacity(col.len());
        for (r, v) in col {
            match merged.last_mut() {
                Some((lr, lv)) if *lr == r => *lv += v,
                _ => merged.push((r, v)),
            }
        }
        for (r, v) in merged {
            rowval.push(r);
            nzval.push(v);
        }
        colptr.push(rowval.len());
    }
    (colptr, rowval, nzval)
}

impl QpSolver for ClarabelSolver {
    fn solve(&self, problem: &QuadraticProgram) -> Result<QpSolution> {
        use clarabel::algebra::*;
        use clarabel::solver::*;

        problem.validate()?;
        let n = problem.n;

        // Clarabel reads only the upper triangle of P
        let (p_ptr, p_idx, p_val) = to_csc(
            n,
            n,
            (0..n).flat_map(|j| (0..=j).map(move |i| (i, j))).map(|(i, j)| (i, j, problem.p[i][j])),
        );
        let p = CscMatrix::new(n, n, p_ptr, p_idx, p_val);

        let n_eq = problem.equalities.len();
        let n_ineq = problem.inequalities.len();
        let m = n_eq + n_ineq;
        let entries = problem
            .equalities
            .iter()
            .chain(problem.inequalities.iter())
            .enumerate()
            .flat_map(|(r, (row, _))| row.iter().map(move |&(c, v)| (r, c, v)));
        let (a_ptr, a_idx, a_val) = to_csc(m, n, entries);
        let a = CscMatrix::new(m, n, a_ptr, a_idx, a_val);

        let b: Vec<f64> = problem
            .equalities
            .iter()
            .chain(problem.inequalities.iter())
            .map(|(_, rhs)| *rhs)
            .collect();

        let mut cones = Vec::new();
        if n_eq > 0 {
            cones.push(ZeroConeT(n_eq));
        }
        if n_ineq > 0 {
            cones.push(NonnegativeConeT(n_ineq));
        }

        let settings = DefaultSettingsBuilder::default()
            .max_iter(self.settings.max_iter)
            .time_limit(self.settings.time_limit_secs)
            .verbose(self.settings.verbose)
            .build()
            .map_err(|e| BalancerError::Optimization(format!("Failed to build settings: {}", e)))?;

        let mut solver = DefaultSolver::new(&p, &problem.q, &a, &b, &cones, settings);

        solver.solve();

        let status = match solver.solution.status {
            SolverStatus::Solved => SolveStatus::Optimal,
            SolverStatus::AlmostSolved => SolveStatus::NearOptimal,
            SolverStatus::PrimalInfeasible
            | SolverStatus::DualInfeasible
            | SolverStatus::AlmostPrimalInfeasible
            | SolverStatus::AlmostDualInfeasible => SolveStatus::Infeasible,
            SolverStatus::MaxIterations => SolveStatus::IterationLimit,
            SolverStatus::MaxTime => SolveStatus::TimeLimit,
            SolverStatus::NumericalError | SolverStatus::InsufficientProgress => {
                SolveStatus::NumericalError
            }
            _ => SolveStatus::Error,
        };

        debug!(
            "QP solved: n={}, m={}, status={:?}, iterations={}",
            n, m, solver.solution.status, solver.solution.iterations
        );

        Ok(QpSolution {
            x: solver.solution.x.clone(),
            status,
            objective: solver.solution.obj_val,
        })
    }
}
