#![allow(dead_code)]

use crate::factors::{dense_factor::DenseFactor, factor_trait::Factor};

use super::message_trait::MessageOp;

// Couples one variable of the left factor to one variable of the right
// factor. Sending computes the sender's min-marginal over the shared
// variable and moves that slack across the message; primal propagation and
// consistency equate the two labels.
#[derive(Clone, Debug)]
pub struct CouplingMessage {
    left_var: usize,
    right_var: usize,
}

impl CouplingMessage {
    pub fn new(left_var: usize, right_var: usize) -> Self {
        CouplingMessage { left_var, right_var }
    }

    // Couples the single variable of two unary factors
    pub fn unary() -> Self {
        CouplingMessage::new(0, 0)
    }

    fn dense(factor: &dyn Factor) -> &DenseFactor {
        factor
            .as_any()
            .downcast_ref::<DenseFactor>()
            .expect("coupling messages connect dense factors")
    }

    fn dense_mut(factor: &mut dyn Factor) -> &mut DenseFactor {
        factor
            .as_any_mut()
            .downcast_mut::<DenseFactor>()
            .expect("coupling messages connect dense factors")
    }
}

impl MessageOp for CouplingMessage {
    fn send_to_left(
        &self,
        source: Option<&dyn Factor>,
        left: &mut dyn Factor,
        right: &mut dyn Factor,
        omega: f64,
    ) {
        let delta = Self::dense(source.unwrap_or(&*right)).min_marginals(self.right_var);
        Self::dense_mut(left).reparam(self.left_var, &delta, omega);
        Self::dense_mut(right).reparam(self.right_var, &delta, -omega);
    }

    fn send_to_right(
        &self,
        source: Option<&dyn Factor>,
        left: &mut dyn Factor,
        right: &mut dyn Factor,
        omega: f64,
    ) {
        let delta = Self::dense(source.unwrap_or(&*left)).min_marginals(self.left_var);
        Self::dense_mut(right).reparam(self.right_var, &delta, omega);
        Self::dense_mut(left).reparam(self.left_var, &delta, -omega);
    }

    fn receive_restricted_from_right(&self, right: &dyn Factor, left: &mut dyn Factor) {
        let delta = Self::dense(right).min_marginals_restricted(self.right_var);
        Self::dense_mut(left).reparam(self.left_var, &delta, 1.);
    }

    fn receive_restricted_from_left(&self, left: &dyn Factor, right: &mut dyn Factor) {
        let delta = Self::dense(left).min_marginals_restricted(self.left_var);
        Self::dense_mut(right).reparam(self.right_var, &delta, 1.);
    }

    fn check_primal_consistency(&self, left: &dyn Factor, right: &dyn Factor) -> bool {
        let left_label = Self::dense(left).primal_at(self.left_var);
        let right_label = Self::dense(right).primal_at(self.right_var);
        match (left_label, right_label) {
            (Some(left_label), Some(right_label)) => left_label == right_label,
            _ => false,
        }
    }

    fn propagate_primal_left_to_right(&self, left: &dyn Factor, right: &mut dyn Factor) -> bool {
        let Some(label) = Self::dense(left).primal_at(self.left_var) else {
            return false;
        };
        let right = Self::dense_mut(right);
        if right.primal_at(self.right_var) == Some(label) {
            return false;
        }
        right.set_primal(self.right_var, label);
        true
    }

    fn propagate_primal_right_to_left(&self, right: &dyn Factor, left: &mut dyn Factor) -> bool {
        let Some(label) = Self::dense(right).primal_at(self.right_var) else {
            return false;
        };
        let left = Self::dense_mut(left);
        if left.primal_at(self.left_var) == Some(label) {
            return false;
        }
        left.set_primal(self.left_var, label);
        true
    }
}
