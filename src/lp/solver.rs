#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use log::{debug, error, info};
use thiserror::Error;

use super::{
    omega::RepamMode,
    scheduler::{Lp, ReparametrizationType},
    visitor::{LpControl, SolverOptions, Visitor},
};

/// Errors surfaced by the solve loop and the external-solver bridges.
#[derive(Debug, Error)]
pub enum SolverError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("external solver failure: {0}")]
    ExternalSolver(String),
}

// Message passing solver with interleaved primal rounding: iterations
// requested by the visitor run forward and backward primal passes and
// register the rounded solution, all others run plain passes.
pub struct MpRoundingSolver<V: Visitor> {
    lp: Lp,
    visitor: V,
    iteration: usize,
    lower_bound: f64,
    best_primal_cost: f64,
    best_primal: Option<Vec<u64>>,
}

impl<V: Visitor> MpRoundingSolver<V> {
    pub fn new(lp: Lp, visitor: V) -> Self {
        MpRoundingSolver {
            lp,
            visitor,
            iteration: 0,
            lower_bound: f64::NEG_INFINITY,
            best_primal_cost: f64::INFINITY,
            best_primal: None,
        }
    }

    pub fn lp(&self) -> &Lp {
        &self.lp
    }

    pub fn lp_mut(&mut self) -> &mut Lp {
        &mut self.lp
    }

    pub fn lower_bound(&self) -> f64 {
        self.lower_bound
    }

    pub fn best_primal_cost(&self) -> f64 {
        self.best_primal_cost
    }

    // The primal snapshot of the best registered solution, as one archive
    // per factor in factor order
    pub fn best_primal(&self) -> Option<&[u64]> {
        self.best_primal.as_deref()
    }

    // Evaluates the current primal and snapshots it when it beats the best
    fn register_primal(&mut self) {
        let cost = self.lp.evaluate_primal();
        debug!("register primal cost {}", cost);
        if cost.is_finite() && cost < self.best_primal_cost {
            self.best_primal_cost = cost;
            let mut snapshot = Vec::new();
            for factor in self.lp.factors_mut() {
                snapshot.extend(factor.save_primal());
            }
            self.best_primal = Some(snapshot);
        }
    }

    fn iterate(&mut self, control: LpControl) {
        if control.compute_primal {
            self.lp.compute_forward_pass_and_primal(self.iteration);
            self.register_primal();
            self.lp.compute_backward_pass_and_primal(self.iteration);
            self.register_primal();
        } else {
            self.lp.compute_pass(self.iteration);
        }
    }

    pub fn solve(&mut self) -> Result<f64, SolverError> {
        self.lp.begin()?;
        let mut control = self.visitor.begin(&self.lp);
        while !control.end && !control.error {
            self.lp.set_reparametrization(control.repam_mode);
            self.iterate(control);
            if control.compute_lower_bound {
                self.lower_bound = self.lp.lower_bound();
                assert!(self.lower_bound.is_finite());
            }
            control = self
                .visitor
                .visit(control, self.lower_bound, self.best_primal_cost);
            self.iteration += 1;
        }
        if control.error {
            return Err(SolverError::ExternalSolver(
                "visitor reported an error".into(),
            ));
        }

        // run the final primal rounding the visitor may have requested
        if control.compute_primal {
            self.lp.set_reparametrization(control.repam_mode);
            self.iterate(control);
        }
        self.lower_bound = self.lp.lower_bound();
        self.register_primal();
        self.visitor.end(self.lower_bound, self.best_primal_cost);
        Ok(self.best_primal_cost)
    }

    // Runs the solver and maps the outcome to a process exit code
    pub fn run(&mut self) -> i32 {
        match self.solve() {
            Ok(best) => {
                info!("solve finished with best primal {}", best);
                0
            }
            Err(err) => {
                error!("solve failed: {}", err);
                1
            }
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum RepamModeArg {
    Anisotropic,
    Anisotropic2,
    Uniform,
    DampedUniform,
    Mixed,
}

impl From<RepamModeArg> for RepamMode {
    fn from(value: RepamModeArg) -> Self {
        match value {
            RepamModeArg::Anisotropic => RepamMode::Anisotropic,
            RepamModeArg::Anisotropic2 => RepamMode::Anisotropic2,
            RepamModeArg::Uniform => RepamMode::Uniform,
            RepamModeArg::DampedUniform => RepamMode::DampedUniform,
            RepamModeArg::Mixed => RepamMode::Mixed,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum ReparametrizationTypeArg {
    Shared,
    Residual,
}

impl From<ReparametrizationTypeArg> for ReparametrizationType {
    fn from(value: ReparametrizationTypeArg) -> Self {
        match value {
            ReparametrizationTypeArg::Shared => ReparametrizationType::Shared,
            ReparametrizationTypeArg::Residual => ReparametrizationType::Residual,
        }
    }
}

/// Command line surface shared by application drivers. Applications embed
/// these arguments, construct their problem, and hand the options to the
/// solver.
#[derive(Parser, Clone, Debug)]
#[clap(about = "Dual block-coordinate ascent message passing solver")]
pub struct SolverArgs {
    /// file from which to read the problem instance
    #[clap(short = 'i', long = "inputFile")]
    pub input_file: Option<PathBuf>,

    /// file to write the solution
    #[clap(short = 'o', long = "outputFile")]
    pub output_file: Option<PathBuf>,

    /// verbosity level: 0 = silent, 1 = runtime information, 2 = diagnostics
    #[clap(short = 'v', long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=2))]
    pub verbosity: u8,

    /// maximum number of message passing iterations
    #[clap(long = "maxIter", default_value_t = 1000)]
    pub max_iter: usize,

    /// wall clock limit in seconds
    #[clap(long = "timeoutSecs", default_value_t = 20 * 60)]
    pub timeout_secs: u64,

    /// omega weight policy
    #[clap(long = "reparametrizationMode", value_enum, default_value_t = RepamModeArg::Anisotropic)]
    pub reparametrization_mode: RepamModeArg,

    /// message sending type
    #[clap(long = "reparametrizationType", value_enum, default_value_t = ReparametrizationTypeArg::Shared)]
    pub reparametrization_type: ReparametrizationTypeArg,

    /// inverse weight for the proximal term of the bundle solver
    #[clap(long = "proximalWeight", default_value_t = 1.0)]
    pub proximal_weight: f64,

    /// iteration at which tree decomposition optimization starts
    #[clap(long = "treeDecompositionBegin", default_value_t = 0)]
    pub tree_decomposition_begin: usize,
}

impl SolverArgs {
    pub fn to_options(&self) -> SolverOptions {
        let mut options = SolverOptions::default();
        options
            .set_max_iterations(self.max_iter)
            .set_time_max(Duration::from_secs(self.timeout_secs))
            .set_repam_mode(self.reparametrization_mode.into());
        options
    }
}
