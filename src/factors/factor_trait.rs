#![allow(dead_code)]

use std::any::Any;
use std::fmt::Debug;

use crate::archive::{DualArchive, PrimalArchive};

// Interface for user factors. A factor owns a dual state (its reparametrized
// cost table) and a primal state (a tentative labeling of its variables).
// Message operators access the concrete factor type through `as_any`.
pub trait Factor: Debug {
    fn clone_boxed(&self) -> Box<dyn Factor>;

    // Returns the minimum of the current dual state
    fn lower_bound(&self) -> f64;

    // Performs local dual maintenance before sending messages; most factors need none
    fn maximize_potential(&mut self) {}

    // Completes the primal labeling, keeping entries that are already labeled
    fn compute_primal(&mut self);

    // Returns the cost of the current primal, or infinity if it is incomplete
    fn evaluate_primal(&self) -> f64;

    // Resets the primal to fully unlabeled
    fn init_primal(&mut self);

    // Whether the factor participates in primal rounding
    fn computes_primal(&self) -> bool {
        true
    }

    fn serialize_dual(&mut self, archive: &mut DualArchive);
    fn serialize_primal(&mut self, archive: &mut PrimalArchive);

    // Scales the dual state by 1/value; used when a factor is cloned across trees
    fn divide(&mut self, value: f64);

    // Adds `sign` at the primal's coordinate in the dual layout
    fn subgradient(&self, weights: &mut [f64], sign: f64);

    // Reads the weight at the primal's coordinate in the dual layout
    fn dot_product(&self, weights: &[f64]) -> f64;

    // Number of entries in the dual layout
    fn dual_size(&mut self) -> usize {
        let mut archive = DualArchive::size();
        self.serialize_dual(&mut archive);
        archive.count()
    }

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}
