#![allow(dead_code)]

use log::{debug, info};

use crate::lp::solver::SolverError;

use super::lagrangean::TreeDecomposition;

// Subgradient ascent over the tree decomposition with Polyak's step size
// and an estimated optimum. Before `tree_decomposition_begin` iterations the
// ordinary message passing pass runs instead.
pub struct SubgradientAscent {
    decomposition: TreeDecomposition,
    best_lower_bound: f64,
}

impl SubgradientAscent {
    pub fn new(decomposition: TreeDecomposition) -> Self {
        SubgradientAscent {
            decomposition,
            best_lower_bound: f64::NEG_INFINITY,
        }
    }

    pub fn decomposition(&self) -> &TreeDecomposition {
        &self.decomposition
    }

    pub fn decomposition_mut(&mut self) -> &mut TreeDecomposition {
        &mut self.decomposition
    }

    pub fn best_lower_bound(&self) -> f64 {
        self.best_lower_bound
    }

    pub fn compute_pass(&mut self, iteration: usize) -> Result<f64, SolverError> {
        if iteration < self.decomposition.tree_decomposition_begin() {
            self.decomposition.lp_mut().compute_pass(iteration);
            return Ok(self.decomposition.lp().lower_bound());
        }
        if !self.decomposition.constructed() {
            self.decomposition.construct()?;
        }
        Ok(self.optimize_step(iteration))
    }

    // One ascent step: solve every tree, assemble the global subgradient,
    // and move the multipliers by the Polyak step length.
    fn optimize_step(&mut self, iteration: usize) -> f64 {
        let mut subgradient = vec![0.; self.decomposition.global_len()];
        let mut current_lower_bound = 0.;
        for index in 0..self.decomposition.num_trees() {
            current_lower_bound += self.decomposition.solve_tree(index);
            self.decomposition.tree_subgradient(index, &mut subgradient);
        }
        self.best_lower_bound = self.best_lower_bound.max(current_lower_bound);

        debug_assert!(subgradient
            .iter()
            .all(|entry| *entry == 0. || *entry == 1. || *entry == -1.));
        let norm = subgradient.iter().map(|entry| entry.abs()).sum::<f64>();
        if norm == 0. {
            debug!("all trees agree, subgradient vanished");
            return current_lower_bound;
        }

        let step_size = (self.best_lower_bound - current_lower_bound
            + subgradient.len() as f64)
            / ((10. + iteration as f64) * norm);
        info!(
            "subgradient step {} with one-norm {} at iteration {}",
            step_size, norm, iteration
        );
        self.decomposition.add_weights(&subgradient, step_size);
        current_lower_bound
    }
}

// The proximal bundle / Frank-Wolfe bridge. The decomposition acts as the
// oracle; concrete bundle solvers are external and drive it through the
// three callbacks below.
pub trait BundleOracle {
    fn num_terms(&self) -> usize;
    fn global_dim(&self) -> usize;
    fn mapping(&self, term: usize) -> &[usize];

    // Adds the weights to the term, solves it, and returns its optimal cost
    // together with an opaque primal snapshot; the weights are removed again
    // before returning.
    fn max_fn(&mut self, term: usize, local_weights: &[f64]) -> (f64, Vec<u64>);

    // Converts a primal snapshot into the term's local subgradient
    fn copy_fn(&mut self, term: usize, primal: &[u64]) -> Vec<f64>;

    // Inner product of the term's primal indicator with the local weights
    fn dot_product_fn(&mut self, term: usize, primal: &[u64], local_weights: &[f64]) -> f64;
}

pub trait BundleSolver {
    // One descent step; returns the certified lower bound of this step
    fn descent_step(&mut self, oracle: &mut dyn BundleOracle) -> Result<f64, SolverError>;
}

impl BundleOracle for TreeDecomposition {
    fn num_terms(&self) -> usize {
        self.num_trees()
    }

    fn global_dim(&self) -> usize {
        self.global_len()
    }

    fn mapping(&self, term: usize) -> &[usize] {
        self.trees()[term].mapping()
    }

    fn max_fn(&mut self, term: usize, local_weights: &[f64]) -> (f64, Vec<u64>) {
        self.add_tree_weights(term, local_weights, 1.);
        let value = self.solve_tree(term);
        let primal = self.save_tree_primal(term);
        self.add_tree_weights(term, local_weights, -1.);
        (value, primal)
    }

    fn copy_fn(&mut self, term: usize, primal: &[u64]) -> Vec<f64> {
        self.load_tree_primal(term, primal);
        self.tree_local_subgradient(term)
    }

    fn dot_product_fn(&mut self, term: usize, primal: &[u64], local_weights: &[f64]) -> f64 {
        self.load_tree_primal(term, primal);
        self.tree_dot_product(term, local_weights)
    }
}

// Runs an external bundle solver over the decomposition; the certified
// bound only ever increases.
pub struct BundleDescent<B: BundleSolver> {
    decomposition: TreeDecomposition,
    bundle: B,
    lower_bound: f64,
}

impl<B: BundleSolver> BundleDescent<B> {
    pub fn new(decomposition: TreeDecomposition, bundle: B) -> Self {
        BundleDescent {
            decomposition,
            bundle,
            lower_bound: f64::NEG_INFINITY,
        }
    }

    pub fn decomposition(&self) -> &TreeDecomposition {
        &self.decomposition
    }

    pub fn lower_bound(&self) -> f64 {
        self.lower_bound
    }

    pub fn compute_pass(&mut self, iteration: usize) -> Result<f64, SolverError> {
        if iteration < self.decomposition.tree_decomposition_begin() {
            self.decomposition.lp_mut().compute_pass(iteration);
            return Ok(self.decomposition.lp().lower_bound());
        }
        if !self.decomposition.constructed() {
            self.decomposition.construct()?;
        }
        let cost = self.bundle.descent_step(&mut self.decomposition)?;
        self.lower_bound = self.lower_bound.max(cost);
        Ok(self.lower_bound)
    }
}
