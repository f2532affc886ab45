#![allow(dead_code)]

use std::fmt::Debug;

use crate::factors::factor_trait::Factor;

// A message's passing schedule decides which sends and receives the factor
// containers execute for it during a pass. The message itself never stores
// per-iteration data; every reparametrization is folded into its endpoint
// factors immediately.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassingSchedule {
    // receive toward the left factor, send toward the right factor
    OnlyLeft,
    // receive toward the right factor, send toward the left factor
    OnlyRight,
    // send and receive in both directions
    Full,
    // send in both directions, never receive
    OnlySend,
}

impl PassingSchedule {
    pub fn sends_to_left(&self) -> bool {
        matches!(
            self,
            PassingSchedule::OnlyRight | PassingSchedule::Full | PassingSchedule::OnlySend
        )
    }

    pub fn sends_to_right(&self) -> bool {
        matches!(
            self,
            PassingSchedule::OnlyLeft | PassingSchedule::Full | PassingSchedule::OnlySend
        )
    }

    pub fn receives_from_left(&self) -> bool {
        matches!(self, PassingSchedule::OnlyRight | PassingSchedule::Full)
    }

    pub fn receives_from_right(&self) -> bool {
        matches!(self, PassingSchedule::OnlyLeft | PassingSchedule::Full)
    }
}

// Interface for message operators. An operator describes how shared
// structure is read out of one endpoint and folded into the other; the
// containers drive when and with which weight that happens.
//
// The sign convention: `send_to_left` computes a delta at the right factor
// and applies `+omega * delta` to the left factor and `-omega * delta` to
// the right factor; `send_to_right` is symmetric.
//
// `source` carries a frozen copy of the sending factor when the caller uses
// the shared-snapshot discipline; `None` means the live sender is the
// source.
pub trait MessageOp: Debug {
    fn send_to_left(
        &self,
        source: Option<&dyn Factor>,
        left: &mut dyn Factor,
        right: &mut dyn Factor,
        omega: f64,
    );

    fn send_to_right(
        &self,
        source: Option<&dyn Factor>,
        left: &mut dyn Factor,
        right: &mut dyn Factor,
        omega: f64,
    );

    // Reparametrizes only the receiving side, restricted by the sender's
    // current primal. Callers bracket this in a save/restore of the
    // receiver's dual state.
    fn receive_restricted_from_right(&self, right: &dyn Factor, left: &mut dyn Factor);
    fn receive_restricted_from_left(&self, left: &dyn Factor, right: &mut dyn Factor);

    fn can_receive_restricted(&self) -> bool {
        true
    }

    // Whether the two endpoint primals agree through this message
    fn check_primal_consistency(&self, left: &dyn Factor, right: &dyn Factor) -> bool;

    // Writes the sender's primal into the receiver; returns whether the
    // receiver's primal changed
    fn propagate_primal_left_to_right(&self, left: &dyn Factor, right: &mut dyn Factor) -> bool;
    fn propagate_primal_right_to_left(&self, right: &dyn Factor, left: &mut dyn Factor) -> bool;

    fn can_propagate_primal(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_capability_table() {
        let only_left = PassingSchedule::OnlyLeft;
        assert!(only_left.sends_to_right() && only_left.receives_from_right());
        assert!(!only_left.sends_to_left() && !only_left.receives_from_left());

        let only_right = PassingSchedule::OnlyRight;
        assert!(only_right.sends_to_left() && only_right.receives_from_left());
        assert!(!only_right.sends_to_right() && !only_right.receives_from_right());

        let full = PassingSchedule::Full;
        assert!(full.sends_to_left() && full.sends_to_right());
        assert!(full.receives_from_left() && full.receives_from_right());

        let only_send = PassingSchedule::OnlySend;
        assert!(only_send.sends_to_left() && only_send.sends_to_right());
        assert!(!only_send.receives_from_left() && !only_send.receives_from_right());
    }
}
