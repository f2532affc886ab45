#![allow(dead_code)]

use log::debug;

use crate::{
    archive::{DualArchive, PrimalArchive},
    factors::factor_trait::Factor,
    Chirality, FactorId, MessageId, EPS,
};

use super::message_container::MessageContainer;

// One adjacency slot of a factor: the message and which endpoint of it this
// factor is.
#[derive(Clone, Copy, Debug)]
pub struct AdjacentMessage {
    pub message: MessageId,
    pub chirality: Chirality,
}

// Owns a user factor together with its primal timestamp and its adjacency
// list. Messages are recorded in insertion order; the omega slot order of
// every weight policy follows this list filtered to send-eligible entries.
pub struct FactorContainer {
    factor: Box<dyn Factor>,
    adjacent: Vec<AdjacentMessage>,
    primal_timestamp: u64,
}

impl FactorContainer {
    pub fn new(factor: Box<dyn Factor>) -> Self {
        FactorContainer {
            factor,
            adjacent: Vec::new(),
            primal_timestamp: 0,
        }
    }

    pub fn factor(&self) -> &dyn Factor {
        &*self.factor
    }

    pub fn factor_mut(&mut self) -> &mut dyn Factor {
        &mut *self.factor
    }

    pub fn adjacent(&self) -> &[AdjacentMessage] {
        &self.adjacent
    }

    pub fn adjacent_len(&self) -> usize {
        self.adjacent.len()
    }

    pub fn adjacent_at(&self, index: usize) -> AdjacentMessage {
        self.adjacent[index]
    }

    pub(crate) fn push_adjacent(&mut self, message: MessageId, chirality: Chirality) {
        self.adjacent.push(AdjacentMessage { message, chirality });
    }

    pub(crate) fn remove_adjacent(&mut self, message: MessageId, chirality: Chirality) {
        let position = self
            .adjacent
            .iter()
            .position(|adj| adj.message == message && adj.chirality == chirality)
            .expect("message is not adjacent to this factor");
        self.adjacent.remove(position);
    }

    // Clones the factor state into a fresh container with no adjacency
    pub fn clone_container(&self) -> FactorContainer {
        FactorContainer::new(self.factor.clone_boxed())
    }

    pub fn lower_bound(&self) -> f64 {
        self.factor.lower_bound()
    }

    pub fn evaluate_primal(&self) -> f64 {
        self.factor.evaluate_primal()
    }

    pub fn init_primal(&mut self) {
        self.factor.init_primal();
    }

    pub fn primal_timestamp(&self) -> u64 {
        self.primal_timestamp
    }

    pub(crate) fn set_primal_timestamp(&mut self, timestamp: u64) {
        self.primal_timestamp = timestamp;
    }

    // Resets the primal only if this factor has not been touched at the
    // given timestamp yet
    pub fn conditionally_init_primal(&mut self, timestamp: u64) {
        if timestamp > self.primal_timestamp {
            self.primal_timestamp = timestamp;
            self.factor.init_primal();
        }
    }

    pub fn serialize_dual(&mut self, archive: &mut DualArchive) {
        self.factor.serialize_dual(archive);
    }

    pub fn serialize_primal(&mut self, archive: &mut PrimalArchive) {
        self.factor.serialize_primal(archive);
    }

    pub fn dual_size(&mut self) -> usize {
        self.factor.dual_size()
    }

    pub fn save_dual(&mut self) -> Vec<f64> {
        let mut archive = DualArchive::save();
        self.factor.serialize_dual(&mut archive);
        archive.into_data()
    }

    pub fn load_dual(&mut self, data: Vec<f64>) {
        let mut archive = DualArchive::load(data);
        self.factor.serialize_dual(&mut archive);
    }

    pub fn save_primal(&mut self) -> Vec<u64> {
        let mut archive = PrimalArchive::save();
        self.factor.serialize_primal(&mut archive);
        archive.into_data()
    }

    pub fn load_primal(&mut self, data: Vec<u64>) {
        let mut archive = PrimalArchive::load(data);
        self.factor.serialize_primal(&mut archive);
    }

    pub fn divide(&mut self, value: f64) {
        self.factor.divide(value);
    }

    pub fn subgradient(&self, weights: &mut [f64], sign: f64) {
        self.factor.subgradient(weights, sign);
    }

    pub fn dot_product(&self, weights: &[f64]) -> f64 {
        self.factor.dot_product(weights)
    }

    pub fn computes_primal(&self) -> bool {
        self.factor.computes_primal()
    }

    // Number of omega slots this factor consumes in a pass
    pub fn send_message_count(&self, messages: &[MessageContainer]) -> usize {
        self.adjacent
            .iter()
            .filter(|adj| sends_over(&messages[adj.message], adj.chirality))
            .count()
    }

    pub fn receive_message_count(&self, messages: &[MessageContainer]) -> usize {
        self.adjacent
            .iter()
            .filter(|adj| receives_over(&messages[adj.message], adj.chirality))
            .count()
    }
}

// Whether the factor on the given side of the message sends over it
pub fn sends_over(message: &MessageContainer, chirality: Chirality) -> bool {
    match chirality {
        Chirality::Left => message.sends_to_right(),
        Chirality::Right => message.sends_to_left(),
    }
}

// Whether the factor on the given side of the message receives over it
pub fn receives_over(message: &MessageContainer, chirality: Chirality) -> bool {
    match chirality {
        Chirality::Left => message.receives_from_right(),
        Chirality::Right => message.receives_from_left(),
    }
}

// A factor belongs to the update ordering iff its update does any work:
// it exchanges at least one message or it computes a primal.
pub fn is_update_eligible(
    factors: &[FactorContainer],
    messages: &[MessageContainer],
    factor: FactorId,
) -> bool {
    factors[factor].computes_primal()
        || factors[factor].adjacent().iter().any(|adj| {
            let message = &messages[adj.message];
            sends_over(message, adj.chirality) || receives_over(message, adj.chirality)
        })
}

// Splits two distinct factors out of the store for simultaneous mutation
pub fn factor_pair_mut(
    factors: &mut [FactorContainer],
    a: FactorId,
    b: FactorId,
) -> (&mut FactorContainer, &mut FactorContainer) {
    assert_ne!(a, b, "cannot split a factor against itself");
    if a < b {
        let (head, tail) = factors.split_at_mut(b);
        (&mut head[a], &mut tail[0])
    } else {
        let (head, tail) = factors.split_at_mut(a);
        let (first, second) = (&mut tail[0], &mut head[b]);
        (first, second)
    }
}

// Receives all incoming messages of the factor per the passing schedule
pub fn receive_messages(
    factors: &mut [FactorContainer],
    messages: &[MessageContainer],
    factor: FactorId,
) {
    for index in 0..factors[factor].adjacent_len() {
        let adj = factors[factor].adjacent_at(index);
        let message = &messages[adj.message];
        match adj.chirality {
            Chirality::Left if message.receives_from_right() => {
                message.receive_from_right(factors);
            }
            Chirality::Right if message.receives_from_left() => {
                message.receive_from_left(factors);
            }
            _ => {}
        }
    }
}

// Sends outgoing messages under the shared discipline: all deltas are read
// from one snapshot of the sender taken before the first send.
fn send_messages(
    factors: &mut [FactorContainer],
    messages: &[MessageContainer],
    factor: FactorId,
    omega: &[f64],
) {
    let send_count = factors[factor].send_message_count(messages);
    assert_eq!(
        omega.len(),
        send_count,
        "omega row length must match the send-eligible message count"
    );
    if send_count == 0 {
        return;
    }

    if send_count == 1 {
        // a single send may read from the live factor
        let mut slot = 0;
        for index in 0..factors[factor].adjacent_len() {
            let adj = factors[factor].adjacent_at(index);
            let message = &messages[adj.message];
            if !sends_over(message, adj.chirality) {
                continue;
            }
            let weight = omega[slot];
            slot += 1;
            if weight > 0. {
                match adj.chirality {
                    Chirality::Left => message.send_to_right(factors, weight),
                    Chirality::Right => message.send_to_left(factors, weight),
                }
            }
        }
        return;
    }

    let snapshot = factors[factor].factor().clone_boxed();
    let mut slot = 0;
    for index in 0..factors[factor].adjacent_len() {
        let adj = factors[factor].adjacent_at(index);
        let message = &messages[adj.message];
        if !sends_over(message, adj.chirality) {
            continue;
        }
        let weight = omega[slot];
        slot += 1;
        if weight > 0. {
            match adj.chirality {
                Chirality::Left => message.send_to_right_from(&*snapshot, factors, weight),
                Chirality::Right => message.send_to_left_from(&*snapshot, factors, weight),
            }
        }
    }
    debug_assert_eq!(slot, omega.len());
}

// Sends outgoing messages sequentially against the live dual state; the
// omega budget accumulated so far is passed to each send, so later sends
// reuse the slack freed by earlier ones.
fn send_messages_residual(
    factors: &mut [FactorContainer],
    messages: &[MessageContainer],
    factor: FactorId,
    omega: &[f64],
) {
    let mut residual_omega = 0.;
    let mut slot = 0;
    for index in 0..factors[factor].adjacent_len() {
        let adj = factors[factor].adjacent_at(index);
        let message = &messages[adj.message];
        if !sends_over(message, adj.chirality) {
            continue;
        }
        let weight = omega[slot];
        slot += 1;
        if weight != 0. {
            residual_omega += weight;
            debug_assert!(residual_omega <= 1. + EPS);
            match adj.chirality {
                Chirality::Left => message.send_to_right(factors, residual_omega),
                Chirality::Right => message.send_to_left(factors, residual_omega),
            }
        }
    }
    assert_eq!(slot, omega.len());
}

fn assert_omega_row(omega: &[f64]) {
    debug_assert!(omega.iter().all(|weight| *weight >= 0.));
    debug_assert!(omega.iter().sum::<f64>() <= 1. + EPS);
}

// Receive incoming messages, locally maximize, then push slack outward
// weighted by omega. The sum of lower bounds over this factor and its
// neighbors never decreases.
pub fn update(
    factors: &mut [FactorContainer],
    messages: &[MessageContainer],
    factor: FactorId,
    omega: &[f64],
) {
    assert_omega_row(omega);
    receive_messages(factors, messages, factor);
    factors[factor].factor_mut().maximize_potential();
    send_messages(factors, messages, factor, omega);
}

// Update variant with the residual send discipline
pub fn update_residual(
    factors: &mut [FactorContainer],
    messages: &[MessageContainer],
    factor: FactorId,
    omega: &[f64],
) {
    assert_omega_row(omega);
    receive_messages(factors, messages, factor);
    factors[factor].factor_mut().maximize_potential();
    send_messages_residual(factors, messages, factor, omega);
}

// Receives restricted views from all restricted-capable neighbors into this
// factor. Callers bracket this in a save/load of the factor's dual state.
fn receive_restricted_messages(
    factors: &mut [FactorContainer],
    messages: &[MessageContainer],
    factor: FactorId,
    timestamp: u64,
) {
    for index in 0..factors[factor].adjacent_len() {
        let adj = factors[factor].adjacent_at(index);
        let message = &messages[adj.message];
        if !message.op().can_receive_restricted() {
            continue;
        }
        match adj.chirality {
            Chirality::Left => message.receive_restricted_to_left(factors, timestamp),
            Chirality::Right => message.receive_restricted_to_right(factors, timestamp),
        }
    }
}

fn has_restricted_receive(
    factors: &[FactorContainer],
    messages: &[MessageContainer],
    factor: FactorId,
) -> bool {
    factors[factor]
        .adjacent()
        .iter()
        .any(|adj| messages[adj.message].op().can_receive_restricted())
}

// Like `update`, but also computes this factor's primal. The primal is
// conditionally re-initialized per the iteration timestamp, computed against
// a restricted view of the neighbors inside a save/restore bracket of the
// dual state, and propagated onward afterwards.
pub fn update_with_primal(
    factors: &mut [FactorContainer],
    messages: &[MessageContainer],
    factor: FactorId,
    omega: &[f64],
    timestamp: u64,
) {
    assert!(timestamp > 0, "timestamp 0 is reserved for fresh factors");
    assert_omega_row(omega);
    factors[factor].conditionally_init_primal(timestamp);

    if !factors[factor].computes_primal() {
        update(factors, messages, factor, omega);
        return;
    }

    factors[factor].set_primal_timestamp(timestamp);
    if has_restricted_receive(factors, messages, factor) {
        debug!("restricted primal bracket for factor {}", factor);
        let saved_dual = factors[factor].save_dual();
        receive_restricted_messages(factors, messages, factor, timestamp);
        factors[factor].factor_mut().compute_primal();
        factors[factor].load_dual(saved_dual);

        receive_messages(factors, messages, factor);
        factors[factor].factor_mut().maximize_potential();
        send_messages(factors, messages, factor, omega);
    } else {
        receive_messages(factors, messages, factor);
        factors[factor].factor_mut().compute_primal();
        send_messages(factors, messages, factor, omega);
    }

    propagate_primal(factors, messages, factor);
}

// Writes this factor's primal into every primal-capable neighbor and
// recurses into neighbors whose primal actually changed.
pub fn propagate_primal(
    factors: &mut [FactorContainer],
    messages: &[MessageContainer],
    factor: FactorId,
) {
    let timestamp = factors[factor].primal_timestamp();
    for index in 0..factors[factor].adjacent_len() {
        let adj = factors[factor].adjacent_at(index);
        let message = &messages[adj.message];
        if !message.op().can_propagate_primal() {
            continue;
        }
        match adj.chirality {
            Chirality::Left => {
                if message.propagate_primal_left_to_right(factors, timestamp) {
                    propagate_primal(factors, messages, message.right());
                }
            }
            Chirality::Right => {
                if message.propagate_primal_right_to_left(factors, timestamp) {
                    propagate_primal(factors, messages, message.left());
                }
            }
        }
    }
}
