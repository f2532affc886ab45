#![allow(dead_code)]

use log::debug;

use crate::{
    messages::message_trait::{MessageOp, PassingSchedule},
    Chirality, FactorId, EPS,
};

use super::factor_container::{factor_pair_mut, FactorContainer};

// Wraps a message operator together with its two endpoint factors and its
// passing schedule. All per-iteration state lives in the endpoint factors;
// the container only mediates transfers between them.
pub struct MessageContainer {
    left: FactorId,
    right: FactorId,
    schedule: PassingSchedule,
    op: Box<dyn MessageOp>,
}

impl MessageContainer {
    pub fn new(
        left: FactorId,
        right: FactorId,
        schedule: PassingSchedule,
        op: Box<dyn MessageOp>,
    ) -> Self {
        assert_ne!(left, right, "a message must connect two distinct factors");
        MessageContainer {
            left,
            right,
            schedule,
            op,
        }
    }

    pub fn left(&self) -> FactorId {
        self.left
    }

    pub fn right(&self) -> FactorId {
        self.right
    }

    pub fn endpoint(&self, chirality: Chirality) -> FactorId {
        match chirality {
            Chirality::Left => self.left,
            Chirality::Right => self.right,
        }
    }

    pub fn other_endpoint(&self, chirality: Chirality) -> FactorId {
        match chirality {
            Chirality::Left => self.right,
            Chirality::Right => self.left,
        }
    }

    pub(crate) fn set_endpoint(&mut self, chirality: Chirality, factor: FactorId) {
        match chirality {
            Chirality::Left => self.left = factor,
            Chirality::Right => self.right = factor,
        }
    }

    pub fn schedule(&self) -> PassingSchedule {
        self.schedule
    }

    pub fn sends_to_left(&self) -> bool {
        self.schedule.sends_to_left()
    }

    pub fn sends_to_right(&self) -> bool {
        self.schedule.sends_to_right()
    }

    pub fn receives_from_left(&self) -> bool {
        self.schedule.receives_from_left()
    }

    pub fn receives_from_right(&self) -> bool {
        self.schedule.receives_from_right()
    }

    pub fn op(&self) -> &dyn MessageOp {
        &*self.op
    }

    // Sends from the live right factor toward the left factor. A full send
    // (omega = 1) realizes a receive at the left factor.
    pub fn send_to_left(&self, factors: &mut [FactorContainer], omega: f64) {
        let (left, right) = factor_pair_mut(factors, self.left, self.right);
        #[cfg(debug_assertions)]
        let before = left.lower_bound() + right.lower_bound();
        self.op
            .send_to_left(None, left.factor_mut(), right.factor_mut(), omega);
        #[cfg(debug_assertions)]
        {
            let after = left.lower_bound() + right.lower_bound();
            debug_assert!(
                after >= before - EPS,
                "message send decreased the joint lower bound: {before} -> {after}"
            );
        }
    }

    pub fn send_to_right(&self, factors: &mut [FactorContainer], omega: f64) {
        let (left, right) = factor_pair_mut(factors, self.left, self.right);
        #[cfg(debug_assertions)]
        let before = left.lower_bound() + right.lower_bound();
        self.op
            .send_to_right(None, left.factor_mut(), right.factor_mut(), omega);
        #[cfg(debug_assertions)]
        {
            let after = left.lower_bound() + right.lower_bound();
            debug_assert!(
                after >= before - EPS,
                "message send decreased the joint lower bound: {before} -> {after}"
            );
        }
    }

    // A receive is a full-weight send toward the receiving endpoint
    pub fn receive_from_right(&self, factors: &mut [FactorContainer]) {
        self.send_to_left(factors, 1.);
    }

    pub fn receive_from_left(&self, factors: &mut [FactorContainer]) {
        self.send_to_right(factors, 1.);
    }

    // Snapshot variants: deltas are read from `source`, a frozen copy of the
    // sending factor, while both live endpoints are reparametrized.
    pub fn send_to_left_from(
        &self,
        source: &dyn crate::factors::factor_trait::Factor,
        factors: &mut [FactorContainer],
        omega: f64,
    ) {
        let (left, right) = factor_pair_mut(factors, self.left, self.right);
        self.op
            .send_to_left(Some(source), left.factor_mut(), right.factor_mut(), omega);
    }

    pub fn send_to_right_from(
        &self,
        source: &dyn crate::factors::factor_trait::Factor,
        factors: &mut [FactorContainer],
        omega: f64,
    ) {
        let (left, right) = factor_pair_mut(factors, self.left, self.right);
        self.op
            .send_to_right(Some(source), left.factor_mut(), right.factor_mut(), omega);
    }

    // Restricted receives reparametrize the receiving side only; the sender
    // gets its primal conditionally initialized first, since the restriction
    // reads it.
    pub fn receive_restricted_to_left(&self, factors: &mut [FactorContainer], timestamp: u64) {
        let (left, right) = factor_pair_mut(factors, self.left, self.right);
        right.conditionally_init_primal(timestamp);
        self.op
            .receive_restricted_from_right(right.factor(), left.factor_mut());
    }

    pub fn receive_restricted_to_right(&self, factors: &mut [FactorContainer], timestamp: u64) {
        let (left, right) = factor_pair_mut(factors, self.left, self.right);
        left.conditionally_init_primal(timestamp);
        self.op
            .receive_restricted_from_left(left.factor(), right.factor_mut());
    }

    pub fn check_primal_consistency(&self, factors: &[FactorContainer]) -> bool {
        self.op
            .check_primal_consistency(factors[self.left].factor(), factors[self.right].factor())
    }

    // Writes the left primal into the right factor; returns whether it changed
    pub fn propagate_primal_left_to_right(
        &self,
        factors: &mut [FactorContainer],
        timestamp: u64,
    ) -> bool {
        let (left, right) = factor_pair_mut(factors, self.left, self.right);
        right.conditionally_init_primal(timestamp);
        self.op
            .propagate_primal_left_to_right(left.factor(), right.factor_mut())
    }

    pub fn propagate_primal_right_to_left(
        &self,
        factors: &mut [FactorContainer],
        timestamp: u64,
    ) -> bool {
        let (left, right) = factor_pair_mut(factors, self.left, self.right);
        left.conditionally_init_primal(timestamp);
        self.op
            .propagate_primal_right_to_left(right.factor(), left.factor_mut())
    }

    // Tree traversal: pushes the full message toward the root-ward endpoint,
    // initializing the leaf-ward factor's primal on the way up.
    pub fn send_up(&self, factors: &mut [FactorContainer], root_ward: Chirality) {
        debug!(
            "send_up across {} -> {} with root-ward {:?}",
            self.left, self.right, root_ward
        );
        match root_ward {
            Chirality::Right => {
                factors[self.left].factor_mut().init_primal();
                self.send_to_right(factors, 1.);
            }
            Chirality::Left => {
                factors[self.right].factor_mut().init_primal();
                self.send_to_left(factors, 1.);
            }
        }
    }

    // Tree traversal: copies the root-ward primal into the leaf-ward factor
    // and lets the leaf-ward factor complete its remaining labels.
    pub fn propagate_down(&self, factors: &mut [FactorContainer], root_ward: Chirality) {
        match root_ward {
            Chirality::Right => {
                let (left, right) = factor_pair_mut(factors, self.left, self.right);
                self.op
                    .propagate_primal_right_to_left(right.factor(), left.factor_mut());
                left.factor_mut().compute_primal();
            }
            Chirality::Left => {
                let (left, right) = factor_pair_mut(factors, self.left, self.right);
                self.op
                    .propagate_primal_left_to_right(left.factor(), right.factor_mut());
                right.factor_mut().compute_primal();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        factors::dense_factor::DenseFactor, messages::coupling_message::CouplingMessage,
    };

    use super::*;

    fn containers(left: Vec<f64>, right: Vec<f64>) -> Vec<FactorContainer> {
        vec![
            FactorContainer::new(Box::new(DenseFactor::unary(left))),
            FactorContainer::new(Box::new(DenseFactor::unary(right))),
        ]
    }

    #[test]
    fn full_send_is_a_receive() {
        let mut factors = containers(vec![3., 1.], vec![0., 2.]);
        let message = MessageContainer::new(
            0,
            1,
            PassingSchedule::Full,
            Box::new(CouplingMessage::unary()),
        );

        message.send_to_left(&mut factors, 1.);
        // left [3,1] absorbs the right min-marginals [0,2]; right is zeroed
        assert_eq!(factors[0].lower_bound(), 3.);
        assert_eq!(factors[1].lower_bound(), 0.);
    }

    #[test]
    fn restricted_receive_leaves_sender_untouched() {
        let mut factors = containers(vec![0., 0.], vec![5., 7.]);
        let message = MessageContainer::new(
            0,
            1,
            PassingSchedule::Full,
            Box::new(CouplingMessage::unary()),
        );

        message.receive_restricted_to_left(&mut factors, 1);
        assert_eq!(factors[1].lower_bound(), 5.);
    }
}
