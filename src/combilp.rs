#![allow(dead_code)]

use log::{debug, info};

use crate::{
    lp::{scheduler::Lp, solver::SolverError},
    FactorId, EPS,
};

// External ILP solver over a growing subset of the factors. The solver owns
// the subset; `dirty` reports whether the subset grew since the last solve,
// which doubles as the convergence signal of the combiLP loop.
pub trait ExternalIlpSolver {
    fn add_factor(&mut self, factor: FactorId);
    fn has_factor(&self, factor: FactorId) -> bool;
    fn factor_count(&self) -> usize;
    fn dirty(&self) -> bool;

    // Solves the subproblem over the admitted factors and the messages among
    // them, and writes the optimal primal into those factors
    fn solve(&mut self, lp: &mut Lp) -> Result<bool, SolverError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RegionState {
    Lp,
    Active,
    Ilp,
}

// Iteratively partitions the factors into an LP-frozen region and an
// externally solved ILP region, growing the latter until the rounded primal
// agrees with the dual bound.
pub struct CombiLp<S: ExternalIlpSolver> {
    lp: Lp,
    solver: S,
    eps: f64,
    rounds: usize,
}

impl<S: ExternalIlpSolver> CombiLp<S> {
    pub fn new(lp: Lp, solver: S) -> Self {
        CombiLp {
            lp,
            solver,
            eps: EPS,
            rounds: 0,
        }
    }

    pub fn lp(&self) -> &Lp {
        &self.lp
    }

    pub fn lp_mut(&mut self) -> &mut Lp {
        &mut self.lp
    }

    pub fn solver(&self) -> &S {
        &self.solver
    }

    pub fn rounds(&self) -> usize {
        self.rounds
    }

    pub fn into_lp(self) -> Lp {
        self.lp
    }

    // Admits locally non-optimal Active factors and the endpoints of
    // primal-inconsistent messages, restores the frozen LP-region primal
    // from the archive, then reclassifies every factor.
    fn update_partition(&mut self, states: &mut [RegionState], archive: &[Vec<u64>]) {
        for factor in 0..self.lp.num_factors() {
            match states[factor] {
                RegionState::Lp => {
                    self.lp.factor_mut(factor).load_primal(archive[factor].clone());
                }
                RegionState::Active => {
                    let container = self.lp.factor(factor);
                    if container.lower_bound() < container.evaluate_primal() - self.eps {
                        self.solver.add_factor(factor);
                    }
                }
                RegionState::Ilp => {}
            }
        }

        for message in self.lp.messages() {
            if !message.check_primal_consistency(self.lp.factors()) {
                for endpoint in [message.left(), message.right()] {
                    if states[endpoint] == RegionState::Active {
                        self.solver.add_factor(endpoint);
                    }
                }
            }
        }

        for (factor, state) in states.iter_mut().enumerate() {
            *state = if self.solver.has_factor(factor) {
                RegionState::Ilp
            } else {
                RegionState::Lp
            };
        }
        for message in self.lp.messages() {
            let (left, right) = (message.left(), message.right());
            match (states[left], states[right]) {
                (RegionState::Lp, RegionState::Ilp) => states[left] = RegionState::Active,
                (RegionState::Ilp, RegionState::Lp) => states[right] = RegionState::Active,
                _ => {}
            }
        }

        let (mut lp_count, mut active_count, mut ilp_count) = (0, 0, 0);
        for state in states.iter() {
            match state {
                RegionState::Lp => lp_count += 1,
                RegionState::Active => active_count += 1,
                RegionState::Ilp => ilp_count += 1,
            }
        }
        debug!(
            "partition: lp={} active={} ilp={}",
            lp_count, active_count, ilp_count
        );
    }

    // The ILP solver may only have mutated Active and ILP factors; the
    // LP-region primal must match the round-start archive.
    fn lp_region_unchanged(&mut self, states: &[RegionState], archive: &[Vec<u64>]) -> bool {
        for factor in 0..self.lp.num_factors() {
            if states[factor] == RegionState::Lp
                && self.lp.factor_mut(factor).save_primal() != archive[factor]
            {
                return false;
            }
        }
        true
    }

    // Runs combiLP rounds until the external region stops growing. Returns
    // the final lower and upper bounds; on convergence they agree within
    // epsilon. Expects the LP to be optimized with a rounded primal.
    pub fn run(&mut self) -> Result<(f64, f64), SolverError> {
        let num_factors = self.lp.num_factors();
        let mut states = vec![RegionState::Active; num_factors];
        let archive: Vec<Vec<u64>> = (0..num_factors)
            .map(|factor| self.lp.factor_mut(factor).save_primal())
            .collect();

        self.update_partition(&mut states, &archive);
        let mut lower_bound = self.lp.lower_bound();
        let mut upper_bound = self.lp.evaluate_primal();

        while self.solver.dirty() {
            debug_assert!(self.lp_region_unchanged(&states, &archive));

            // bridging factors with at most two messages pull their
            // neighbors in, reducing the number of rounds
            let before = self.solver.factor_count();
            for factor in 0..num_factors {
                if !self.solver.has_factor(factor) || self.lp.factor(factor).adjacent_len() > 2 {
                    continue;
                }
                for adj in self.lp.factor(factor).adjacent().to_vec() {
                    let neighbor = self.lp.message(adj.message).other_endpoint(adj.chirality);
                    self.solver.add_factor(neighbor);
                }
            }
            debug!(
                "added {} bridging factors",
                self.solver.factor_count() - before
            );

            // reparametrize the border: push LP-side slack into the ILP side
            {
                let solver = &self.solver;
                let (factors, messages) = self.lp.stores_mut();
                for message in messages {
                    let left_in = solver.has_factor(message.left());
                    let right_in = solver.has_factor(message.right());
                    if left_in && !right_in {
                        message.send_to_left(factors, 1.);
                    } else if !left_in && right_in {
                        message.send_to_right(factors, 1.);
                    }
                }
            }

            self.rounds += 1;
            info!(
                "combiLP round {}: {} of {} factors in the external region",
                self.rounds,
                self.solver.factor_count(),
                num_factors
            );

            let solved = self.solver.solve(&mut self.lp)?;
            if !solved {
                return Err(SolverError::ExternalSolver(
                    "the ILP subproblem could not be solved".into(),
                ));
            }

            lower_bound = self.lp.lower_bound();

            // propagate the external primal outward through the messages
            for factor in 0..num_factors {
                if self.solver.has_factor(factor) {
                    self.lp.propagate_primal(factor);
                }
            }

            upper_bound = self.lp.evaluate_primal();
            debug_assert!(lower_bound <= upper_bound + self.eps);
            info!(
                "combiLP bounds: lower {} upper {}",
                lower_bound, upper_bound
            );

            self.update_partition(&mut states, &archive);
        }

        Ok((lower_bound, upper_bound))
    }
}
