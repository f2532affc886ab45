#![allow(dead_code)]

use bitvec::prelude::LocalBits;
use bitvec::vec::BitVec;
use log::debug;

use crate::{data_structures::jagged_arrays::JaggedArray2, FactorId, EPS};

use super::{
    factor_container::{is_update_eligible, sends_over, FactorContainer},
    message_container::MessageContainer,
};

// How outgoing-message slack is apportioned during a pass. Every policy
// produces one weight row per factor in the update ordering, one entry per
// send-eligible adjacent message, with row sums bounded by one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RepamMode {
    Anisotropic,
    Anisotropic2,
    Uniform,
    DampedUniform,
    Mixed,
}

pub type FactorMask = BitVec<usize, LocalBits>;

// Position of every masked-in factor within the given ordering
fn ordering_positions(num_factors: usize, ordering: &[FactorId]) -> Vec<usize> {
    let mut positions = vec![usize::MAX; num_factors];
    for (position, factor) in ordering.iter().enumerate() {
        positions[*factor] = position;
    }
    positions
}

// Row lengths of the omega table: one row per update-eligible factor in
// ordering order, sized by its send-eligible message count
fn omega_row_lengths(
    factors: &[FactorContainer],
    messages: &[MessageContainer],
    ordering: &[FactorId],
) -> Vec<usize> {
    ordering
        .iter()
        .filter(|factor| is_update_eligible(factors, messages, **factor))
        .map(|factor| factors[*factor].send_message_count(messages))
        .collect()
}

fn debug_check_budget(omega: &JaggedArray2<f64>) {
    for row in omega.rows() {
        debug_assert!(row.iter().all(|weight| *weight >= 0.));
        debug_assert!(row.iter().sum::<f64>() <= 1. + EPS);
    }
}

// Uniform(leave) weights: a factor with k send-eligible messages gives each
// of them 1/(k + leave_weight). Messages whose counterparty is masked out
// get weight zero.
pub fn compute_uniform_weights(
    factors: &[FactorContainer],
    messages: &[MessageContainer],
    ordering: &[FactorId],
    mask: &FactorMask,
    leave_weight: f64,
) -> JaggedArray2<f64> {
    assert!((0. ..=1.).contains(&leave_weight));
    let mut omega = JaggedArray2::from_row_lengths(&omega_row_lengths(factors, messages, ordering));

    let mut row = 0;
    for &factor in ordering {
        if !is_update_eligible(factors, messages, factor) {
            continue;
        }
        // count send-eligible messages with an active counterparty
        let mut active_sends = 0usize;
        for adj in factors[factor].adjacent() {
            let message = &messages[adj.message];
            if sends_over(message, adj.chirality) && mask[message.other_endpoint(adj.chirality)] {
                active_sends += 1;
            }
        }

        let mut slot = 0;
        for adj in factors[factor].adjacent() {
            let message = &messages[adj.message];
            if !sends_over(message, adj.chirality) {
                continue;
            }
            if mask[message.other_endpoint(adj.chirality)] && active_sends > 0 {
                omega.set([row, slot], 1. / (active_sends as f64 + leave_weight));
            }
            slot += 1;
        }
        row += 1;
    }

    debug_check_budget(&omega);
    omega
}

// Anisotropic weights: mass is pushed toward factors that will still be
// visited in the current pass. For factor i, counting only messages with
// both endpoints masked in:
//   L_i   last position of any factor receiving a message from i,
//   ns_i  send-eligible outgoing messages of i,
//   nsl_i those with counterparty later in the order or L_j beyond i,
//   nr_i  receivers of i's messages strictly later in the order.
// An outgoing message from i to j gets 1/(nr_i + max(nsl_i, ns_i - nsl_i))
// when i < j or L_j > i, and zero otherwise.
pub fn compute_anisotropic_weights(
    factors: &[FactorContainer],
    messages: &[MessageContainer],
    ordering: &[FactorId],
    mask: &FactorMask,
) -> JaggedArray2<f64> {
    let num_factors = factors.len();
    let positions = ordering_positions(num_factors, ordering);
    let num_positions = ordering.len();

    let mut last_receiving = vec![0usize; num_positions];
    let mut receivers_later = vec![0usize; num_positions];
    for message in messages {
        if !(mask[message.left()] && mask[message.right()]) {
            continue;
        }
        let left_position = positions[message.left()];
        let right_position = positions[message.right()];

        // "receives from left" means the right factor receives i's message
        if message.receives_from_left() {
            if left_position < right_position {
                receivers_later[left_position] += 1;
            }
            last_receiving[left_position] = last_receiving[left_position].max(right_position);
        }
        if message.receives_from_right() {
            if right_position < left_position {
                receivers_later[right_position] += 1;
            }
            last_receiving[right_position] = last_receiving[right_position].max(left_position);
        }
    }

    let mut sends = vec![0usize; num_positions];
    let mut sends_later = vec![0usize; num_positions];
    for message in messages {
        if !(mask[message.left()] && mask[message.right()]) {
            continue;
        }
        let left_position = positions[message.left()];
        let right_position = positions[message.right()];

        if message.sends_to_right() {
            sends[left_position] += 1;
            if left_position < right_position || last_receiving[right_position] > left_position {
                sends_later[left_position] += 1;
            }
        }
        if message.sends_to_left() {
            sends[right_position] += 1;
            if right_position < left_position || last_receiving[left_position] > right_position {
                sends_later[right_position] += 1;
            }
        }
    }

    let mut omega = JaggedArray2::from_row_lengths(&omega_row_lengths(factors, messages, ordering));
    let mut row = 0;
    for &factor in ordering {
        if !is_update_eligible(factors, messages, factor) {
            continue;
        }
        let position = positions[factor];
        let mut slot = 0;
        for adj in factors[factor].adjacent() {
            let message = &messages[adj.message];
            if !sends_over(message, adj.chirality) {
                continue;
            }
            let counterparty = message.other_endpoint(adj.chirality);
            // the mask is a hard prerequisite for the positional condition
            if mask[factor] && mask[counterparty] {
                let counter_position = positions[counterparty];
                if position < counter_position || last_receiving[counter_position] > position {
                    let denominator = receivers_later[position]
                        + sends_later[position].max(sends[position] - sends_later[position]);
                    omega.set([row, slot], 1. / denominator as f64);
                }
            }
            slot += 1;
        }
        row += 1;
    }

    debug_check_budget(&omega);
    omega
}

// Simplified anisotropic variant: only messages whose counterparty comes
// later in the order carry weight, shared equally among them.
pub fn compute_anisotropic2_weights(
    factors: &[FactorContainer],
    messages: &[MessageContainer],
    ordering: &[FactorId],
    mask: &FactorMask,
) -> JaggedArray2<f64> {
    let positions = ordering_positions(factors.len(), ordering);
    let mut sends_later = vec![0usize; ordering.len()];
    for message in messages {
        if !(mask[message.left()] && mask[message.right()]) {
            continue;
        }
        let left_position = positions[message.left()];
        let right_position = positions[message.right()];
        if message.sends_to_right() && left_position < right_position {
            sends_later[left_position] += 1;
        }
        if message.sends_to_left() && right_position < left_position {
            sends_later[right_position] += 1;
        }
    }

    let mut omega = JaggedArray2::from_row_lengths(&omega_row_lengths(factors, messages, ordering));
    let mut row = 0;
    for &factor in ordering {
        if !is_update_eligible(factors, messages, factor) {
            continue;
        }
        let position = positions[factor];
        let mut slot = 0;
        for adj in factors[factor].adjacent() {
            let message = &messages[adj.message];
            if !sends_over(message, adj.chirality) {
                continue;
            }
            let counterparty = message.other_endpoint(adj.chirality);
            if mask[counterparty] && position < positions[counterparty] {
                omega.set([row, slot], 1. / sends_later[position] as f64);
            }
            slot += 1;
        }
        row += 1;
    }

    debug_check_budget(&omega);
    omega
}

// Mixed weights: the elementwise average of anisotropic and damped uniform
pub fn compute_mixed_weights(
    anisotropic: &JaggedArray2<f64>,
    damped_uniform: &JaggedArray2<f64>,
) -> JaggedArray2<f64> {
    assert_eq!(anisotropic.len(), damped_uniform.len());
    let mut omega = anisotropic.clone();
    for row in 0..omega.len() {
        assert_eq!(anisotropic.inner_len(row), damped_uniform.inner_len(row));
        for slot in 0..omega.inner_len(row) {
            let averaged = 0.5 * (anisotropic[[row, slot]] + damped_uniform[[row, slot]]);
            omega.set([row, slot], averaged);
        }
    }
    debug!("mixed omega table recomputed over {} rows", omega.len());
    debug_check_budget(&omega);
    omega
}

#[cfg(test)]
mod tests {
    use crate::{
        factors::dense_factor::DenseFactor,
        messages::{coupling_message::CouplingMessage, message_trait::PassingSchedule},
        Chirality,
    };

    use super::*;

    // chain of `n` unary factors with full coupling messages between
    // consecutive factors
    fn chain(n: usize) -> (Vec<FactorContainer>, Vec<MessageContainer>) {
        let mut factors: Vec<FactorContainer> = (0..n)
            .map(|_| FactorContainer::new(Box::new(DenseFactor::unary(vec![0., 0.]))))
            .collect();
        let mut messages = Vec::new();
        for left in 0..n - 1 {
            factors[left].push_adjacent(messages.len(), Chirality::Left);
            factors[left + 1].push_adjacent(messages.len(), Chirality::Right);
            messages.push(MessageContainer::new(
                left,
                left + 1,
                PassingSchedule::Full,
                Box::new(CouplingMessage::unary()),
            ));
        }
        (factors, messages)
    }

    fn full_mask(n: usize) -> FactorMask {
        FactorMask::repeat(true, n)
    }

    #[test]
    fn uniform_weights_split_evenly() {
        let (factors, messages) = chain(3);
        let ordering = vec![0, 1, 2];
        let omega =
            compute_uniform_weights(&factors, &messages, &ordering, &full_mask(3), 0.);

        assert_eq!(omega.row(0), &[1.]);
        assert_eq!(omega.row(1), &[0.5, 0.5]);
        assert_eq!(omega.row(2), &[1.]);
    }

    #[test]
    fn damped_uniform_leaves_slack_in_sender() {
        let (factors, messages) = chain(3);
        let ordering = vec![0, 1, 2];
        let omega =
            compute_uniform_weights(&factors, &messages, &ordering, &full_mask(3), 1.);

        assert_eq!(omega.row(0), &[0.5]);
        assert_eq!(omega.row(1), &[1. / 3., 1. / 3.]);
        assert!(omega.rows().all(|row| row.iter().sum::<f64>() < 1.));
    }

    #[test]
    fn uniform_weights_zero_out_masked_counterparties() {
        let (factors, messages) = chain(3);
        let ordering = vec![0, 1];
        let mut mask = full_mask(3);
        mask.set(2, false);
        let omega = compute_uniform_weights(&factors, &messages, &ordering, &mask, 0.);

        // the middle factor still has two slots, only one of them active
        assert_eq!(omega.row(1), &[1., 0.]);
    }

    #[test]
    fn anisotropic_weights_push_forward_on_chain() {
        let (factors, messages) = chain(3);
        let ordering = vec![0, 1, 2];
        let omega =
            compute_anisotropic_weights(&factors, &messages, &ordering, &full_mask(3));

        // factor 0: one receiver later, one send later: 1/(1 + 1)
        assert_eq!(omega.row(0), &[0.5]);
        // factor 1: the backward message still carries weight because factor
        // 0 keeps receiving from position 1 (L_0 = 1 > 1 is false) -- the
        // backward slot is zero, the forward slot gets 1/(1 + 1)
        assert_eq!(omega.row(1), &[0., 0.5]);
        // the last factor sends nothing forward
        assert_eq!(omega.row(2), &[0.]);
    }

    #[test]
    fn anisotropic2_weights_on_chain() {
        let (factors, messages) = chain(4);
        let ordering = vec![0, 1, 2, 3];
        let omega =
            compute_anisotropic2_weights(&factors, &messages, &ordering, &full_mask(4));

        assert_eq!(omega.row(0), &[1.]);
        assert_eq!(omega.row(1), &[0., 1.]);
        assert_eq!(omega.row(2), &[0., 1.]);
        assert_eq!(omega.row(3), &[0.]);
    }

    #[test]
    fn mixed_weights_average_the_policies() {
        let (factors, messages) = chain(3);
        let ordering = vec![0, 1, 2];
        let mask = full_mask(3);
        let anisotropic = compute_anisotropic_weights(&factors, &messages, &ordering, &mask);
        let damped = compute_uniform_weights(&factors, &messages, &ordering, &mask, 1.);
        let mixed = compute_mixed_weights(&anisotropic, &damped);

        assert_eq!(mixed.row(0), &[0.5 * (0.5 + 0.5)]);
        assert_eq!(mixed.row(1), &[0.5 * (1. / 3.), 0.5 * (0.5 + 1. / 3.)]);
    }

    #[test]
    fn omega_budget_holds_on_a_clique() {
        // three factors, fully connected
        let mut factors: Vec<FactorContainer> = (0..3)
            .map(|_| FactorContainer::new(Box::new(DenseFactor::unary(vec![0., 0.]))))
            .collect();
        let mut messages = Vec::new();
        for left in 0..3 {
            for right in left + 1..3 {
                factors[left].push_adjacent(messages.len(), Chirality::Left);
                factors[right].push_adjacent(messages.len(), Chirality::Right);
                messages.push(MessageContainer::new(
                    left,
                    right,
                    PassingSchedule::Full,
                    Box::new(CouplingMessage::unary()),
                ));
            }
        }
        let ordering = vec![0, 1, 2];
        let mask = full_mask(3);

        for omega in [
            compute_uniform_weights(&factors, &messages, &ordering, &mask, 0.),
            compute_uniform_weights(&factors, &messages, &ordering, &mask, 1.),
            compute_anisotropic_weights(&factors, &messages, &ordering, &mask),
            compute_anisotropic2_weights(&factors, &messages, &ordering, &mask),
        ] {
            for row in omega.rows() {
                assert!(row.iter().all(|weight| *weight >= 0.));
                assert!(row.iter().sum::<f64>() <= 1. + EPS);
            }
        }
    }
}
