#![allow(dead_code)]

use std::time::{Duration, Instant};

use log::info;

use crate::EPS;

use super::{omega::RepamMode, scheduler::Lp};

// Control record returned by a visitor once per iteration; it steers the
// outer solve loop without the loop knowing the stopping policy.
#[derive(Clone, Copy, Debug)]
pub struct LpControl {
    pub end: bool,
    pub error: bool,
    pub compute_primal: bool,
    pub compute_lower_bound: bool,
    pub tighten: bool,
    pub tighten_constraints: usize,
    pub repam_mode: RepamMode,
}

impl LpControl {
    pub fn new(repam_mode: RepamMode) -> Self {
        LpControl {
            end: false,
            error: false,
            compute_primal: false,
            compute_lower_bound: false,
            tighten: false,
            tighten_constraints: 0,
            repam_mode,
        }
    }
}

// Drives the outer iteration loop: called before the first iteration and
// after every iteration with the current bounds.
pub trait Visitor {
    fn begin(&mut self, lp: &Lp) -> LpControl;
    fn visit(&mut self, previous: LpControl, lower_bound: f64, best_primal: f64) -> LpControl;
    fn end(&mut self, _lower_bound: f64, _best_primal: f64) {}
}

// Stores options to the message passing solver
#[derive(Clone, Debug)]
pub struct SolverOptions {
    max_iterations: usize,  // maximum number of iterations
    time_max: Duration,     // maximum allowed time limit
    eps: f64,               // precision for tracking lower bound improvement
    compute_solution_period: usize, // iterations between primal recomputations
    lower_bound_period: usize, // iterations between lower bound evaluations
    repam_mode: RepamMode,
}

impl SolverOptions {
    pub fn default() -> Self {
        SolverOptions {
            max_iterations: 1000,
            time_max: Duration::new(20 * 60, 0),
            eps: EPS,
            compute_solution_period: 5,
            lower_bound_period: 1,
            repam_mode: RepamMode::Anisotropic,
        }
    }

    pub fn set_max_iterations(&mut self, value: usize) -> &mut Self {
        self.max_iterations = value;
        self
    }

    pub fn set_time_max(&mut self, value: Duration) -> &mut Self {
        self.time_max = value;
        self
    }

    pub fn set_eps(&mut self, value: f64) -> &mut Self {
        self.eps = value;
        self
    }

    pub fn set_compute_solution_period(&mut self, value: usize) -> &mut Self {
        self.compute_solution_period = value;
        self
    }

    pub fn set_lower_bound_period(&mut self, value: usize) -> &mut Self {
        self.lower_bound_period = value;
        self
    }

    pub fn set_repam_mode(&mut self, value: RepamMode) -> &mut Self {
        self.repam_mode = value;
        self
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub fn time_max(&self) -> Duration {
        self.time_max
    }

    pub fn eps(&self) -> f64 {
        self.eps
    }

    pub fn compute_solution_period(&self) -> usize {
        self.compute_solution_period
    }

    pub fn lower_bound_period(&self) -> usize {
        self.lower_bound_period
    }

    pub fn repam_mode(&self) -> RepamMode {
        self.repam_mode
    }
}

// The standard visitor: iteration cap, wall clock limit, minimum lower
// bound improvement, and periodic primal/lower bound computation.
pub struct StandardVisitor {
    options: SolverOptions,
    iteration: usize,
    start_time: Option<Instant>,
    previous_lower_bound: f64,
}

impl StandardVisitor {
    pub fn new(options: SolverOptions) -> Self {
        StandardVisitor {
            options,
            iteration: 0,
            start_time: None,
            previous_lower_bound: f64::NEG_INFINITY,
        }
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    fn control(&self) -> LpControl {
        let mut control = LpControl::new(self.options.repam_mode());
        let period = self.options.compute_solution_period();
        control.compute_primal = period > 0
            && (self.iteration % period == 0 || self.iteration + 1 == self.options.max_iterations());
        let lb_period = self.options.lower_bound_period();
        control.compute_lower_bound = lb_period > 0 && self.iteration % lb_period == 0;
        control
    }
}

impl Visitor for StandardVisitor {
    fn begin(&mut self, _lp: &Lp) -> LpControl {
        self.start_time = Some(Instant::now());
        self.iteration = 0;
        self.previous_lower_bound = f64::NEG_INFINITY;
        self.control()
    }

    fn visit(&mut self, previous: LpControl, lower_bound: f64, best_primal: f64) -> LpControl {
        let elapsed = self
            .start_time
            .expect("visit called before begin")
            .elapsed();
        info!(
            "iteration {}: lower bound {}, best primal {}, elapsed {:?}",
            self.iteration, lower_bound, best_primal, elapsed
        );

        self.iteration += 1;
        let mut control = self.control();

        if self.iteration >= self.options.max_iterations() {
            info!("maximum number of iterations reached");
            control.end = true;
        }
        if elapsed >= self.options.time_max() {
            info!("time limit reached");
            control.end = true;
        }
        if previous.compute_lower_bound {
            if self.iteration > 1 && lower_bound < self.previous_lower_bound + self.options.eps() {
                info!("lower bound improved less than epsilon");
                control.end = true;
            }
            self.previous_lower_bound = lower_bound;
        }
        // a final primal rounding before the loop ends
        if control.end {
            control.compute_primal = self.options.compute_solution_period() > 0;
        }
        control
    }

    fn end(&mut self, lower_bound: f64, best_primal: f64) {
        let elapsed = self
            .start_time
            .map(|start| start.elapsed())
            .unwrap_or_default();
        info!(
            "finished after {} iterations: lower bound {}, best primal {}, elapsed {:?}",
            self.iteration, lower_bound, best_primal, elapsed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visitor_stops_at_iteration_cap() {
        let mut options = SolverOptions::default();
        options.set_max_iterations(3).set_eps(0.);
        let mut visitor = StandardVisitor::new(options);

        let lp = Lp::new();
        let mut control = visitor.begin(&lp);
        let mut iterations = 0;
        while !control.end {
            control = visitor.visit(control, iterations as f64, f64::INFINITY);
            iterations += 1;
            assert!(iterations <= 3);
        }
        assert_eq!(iterations, 3);
    }

    #[test]
    fn visitor_stops_on_stalled_lower_bound() {
        let mut options = SolverOptions::default();
        options.set_max_iterations(100).set_eps(1e-6);
        let mut visitor = StandardVisitor::new(options);

        let lp = Lp::new();
        let mut control = visitor.begin(&lp);
        let mut iterations = 0;
        while !control.end {
            // the lower bound never improves
            control = visitor.visit(control, 1., f64::INFINITY);
            iterations += 1;
        }
        assert!(iterations < 100);
    }

    #[test]
    fn primal_period_marks_iterations() {
        let mut options = SolverOptions::default();
        options.set_max_iterations(10).set_compute_solution_period(3).set_eps(0.);
        let mut visitor = StandardVisitor::new(options);

        let lp = Lp::new();
        let control = visitor.begin(&lp);
        // iteration 0 always computes a primal with period 3
        assert!(control.compute_primal);
        let control = visitor.visit(control, 0., f64::INFINITY);
        assert!(!control.compute_primal);
    }
}
