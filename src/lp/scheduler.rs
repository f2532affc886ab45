#![allow(dead_code)]

use log::{debug, info};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::{
    data_structures::jagged_arrays::JaggedArray2,
    factors::factor_trait::Factor,
    messages::message_trait::{MessageOp, PassingSchedule},
    Chirality, FactorId, MessageId, EPS,
};

use super::{
    factor_container::{
        self, is_update_eligible, FactorContainer,
    },
    message_container::MessageContainer,
    omega::{
        compute_anisotropic2_weights, compute_anisotropic_weights, compute_mixed_weights,
        compute_uniform_weights, FactorMask, RepamMode,
    },
    solver::SolverError,
};

// Whether outgoing messages of a factor read their deltas from a shared
// snapshot of the sender, or sequentially from the live sender with an
// accumulating omega budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReparametrizationType {
    Shared,
    Residual,
}

#[derive(Clone, Copy)]
enum Direction {
    Forward,
    Backward,
}

struct OmegaCache {
    valid: bool,
    forward: JaggedArray2<f64>,
    backward: JaggedArray2<f64>,
}

impl OmegaCache {
    fn new() -> Self {
        OmegaCache {
            valid: false,
            forward: JaggedArray2::new(),
            backward: JaggedArray2::new(),
        }
    }
}

// The message-passing core. Owns all factors and messages, the forward and
// backward pass relations, the cached orderings and omega tables, and the
// additive constant of the objective.
pub struct Lp {
    factors: Vec<FactorContainer>,
    messages: Vec<MessageContainer>,

    forward_relations: Vec<(FactorId, FactorId)>,
    backward_relations: Vec<(FactorId, FactorId)>,
    factor_mask: FactorMask,

    ordering_valid: bool,
    forward_ordering: Vec<FactorId>,
    backward_ordering: Vec<FactorId>,
    forward_update_ordering: Vec<FactorId>,
    backward_update_ordering: Vec<FactorId>,

    omega_anisotropic: OmegaCache,
    omega_anisotropic2: OmegaCache,
    omega_uniform: OmegaCache,
    omega_damped_uniform: OmegaCache,
    omega_mixed: OmegaCache,

    repam_mode: Option<RepamMode>,
    repam_type: ReparametrizationType,
    constant: f64,
}

impl Lp {
    pub fn new() -> Self {
        Lp {
            factors: Vec::new(),
            messages: Vec::new(),
            forward_relations: Vec::new(),
            backward_relations: Vec::new(),
            factor_mask: FactorMask::new(),
            ordering_valid: false,
            forward_ordering: Vec::new(),
            backward_ordering: Vec::new(),
            forward_update_ordering: Vec::new(),
            backward_update_ordering: Vec::new(),
            omega_anisotropic: OmegaCache::new(),
            omega_anisotropic2: OmegaCache::new(),
            omega_uniform: OmegaCache::new(),
            omega_damped_uniform: OmegaCache::new(),
            omega_mixed: OmegaCache::new(),
            repam_mode: None,
            repam_type: ReparametrizationType::Shared,
            constant: 0.,
        }
    }

    pub fn add_factor(&mut self, factor: Box<dyn Factor>) -> FactorId {
        self.set_flags_dirty();
        self.factors.push(FactorContainer::new(factor));
        self.factor_mask.push(true);
        self.factors.len() - 1
    }

    // Registers a message between two existing factors; the message is
    // appended to both adjacency lists in insertion order.
    pub fn add_message(
        &mut self,
        left: FactorId,
        right: FactorId,
        schedule: PassingSchedule,
        op: Box<dyn MessageOp>,
    ) -> MessageId {
        assert!(left < self.factors.len() && right < self.factors.len());
        self.set_flags_dirty();
        let message = self.messages.len();
        self.factors[left].push_adjacent(message, Chirality::Left);
        self.factors[right].push_adjacent(message, Chirality::Right);
        self.messages
            .push(MessageContainer::new(left, right, schedule, op));
        message
    }

    // Declares that `before` is updated before `after` on the forward pass
    // and after it on the backward pass
    pub fn add_relation(&mut self, before: FactorId, after: FactorId) {
        self.add_forward_relation(before, after);
        self.add_backward_relation(after, before);
    }

    pub fn add_forward_relation(&mut self, before: FactorId, after: FactorId) {
        assert_ne!(before, after);
        self.set_flags_dirty();
        self.forward_relations.push((before, after));
    }

    pub fn add_backward_relation(&mut self, before: FactorId, after: FactorId) {
        assert_ne!(before, after);
        self.set_flags_dirty();
        self.backward_relations.push((before, after));
    }

    pub fn set_reparametrization(&mut self, mode: RepamMode) {
        self.repam_mode = Some(mode);
    }

    pub fn reparametrization(&self) -> Option<RepamMode> {
        self.repam_mode
    }

    pub fn set_reparametrization_type(&mut self, repam_type: ReparametrizationType) {
        self.repam_type = repam_type;
    }

    pub fn set_factor_mask(&mut self, mask: FactorMask) {
        assert_eq!(mask.len(), self.factors.len());
        self.set_flags_dirty();
        self.factor_mask = mask;
    }

    pub fn factor_mask(&self) -> &FactorMask {
        &self.factor_mask
    }

    pub(crate) fn set_factor_active(&mut self, factor: FactorId, active: bool) {
        self.set_flags_dirty();
        self.factor_mask.set(factor, active);
    }

    pub fn add_to_constant(&mut self, value: f64) {
        self.constant += value;
    }

    pub fn constant(&self) -> f64 {
        self.constant
    }

    pub fn num_factors(&self) -> usize {
        self.factors.len()
    }

    pub fn num_messages(&self) -> usize {
        self.messages.len()
    }

    pub fn factors(&self) -> &[FactorContainer] {
        &self.factors
    }

    pub fn factors_mut(&mut self) -> &mut [FactorContainer] {
        &mut self.factors
    }

    pub fn messages(&self) -> &[MessageContainer] {
        &self.messages
    }

    pub fn factor(&self, factor: FactorId) -> &FactorContainer {
        &self.factors[factor]
    }

    pub fn factor_mut(&mut self, factor: FactorId) -> &mut FactorContainer {
        &mut self.factors[factor]
    }

    pub fn message(&self, message: MessageId) -> &MessageContainer {
        &self.messages[message]
    }

    // Mutable access to factor and message stores at once, for callers that
    // drive container-level operations themselves
    pub fn stores_mut(&mut self) -> (&mut [FactorContainer], &[MessageContainer]) {
        (&mut self.factors, &self.messages)
    }

    pub fn divide_factor(&mut self, factor: FactorId, value: f64) {
        self.factors[factor].divide(value);
    }

    // Appends a clone of the given factor's state; the clone starts with an
    // empty adjacency list and is active.
    pub(crate) fn push_clone(&mut self, of: FactorId) -> FactorId {
        self.set_flags_dirty();
        let clone = self.factors[of].clone_container();
        self.factors.push(clone);
        self.factor_mask.push(true);
        self.factors.len() - 1
    }

    // Moves one endpoint of a message to another factor, keeping the
    // adjacency lists in step. Used when shared factors are cloned per tree.
    pub(crate) fn reseat_message_endpoint(
        &mut self,
        message: MessageId,
        chirality: Chirality,
        factor: FactorId,
    ) {
        let old = self.messages[message].endpoint(chirality);
        if old == factor {
            return;
        }
        self.set_flags_dirty();
        self.factors[old].remove_adjacent(message, chirality);
        self.messages[message].set_endpoint(chirality, factor);
        self.factors[factor].push_adjacent(message, chirality);
    }

    fn set_flags_dirty(&mut self) {
        self.ordering_valid = false;
        self.omega_anisotropic.valid = false;
        self.omega_anisotropic2.valid = false;
        self.omega_uniform.valid = false;
        self.omega_damped_uniform.valid = false;
        self.omega_mixed.valid = false;
    }

    // Validates the configuration; surfaced at solve start
    pub fn begin(&mut self) -> Result<(), SolverError> {
        if self.factors.is_empty() {
            return Err(SolverError::InvalidConfig("no factors were added".into()));
        }
        for relations in [&self.forward_relations, &self.backward_relations] {
            let graph = self.relation_graph(relations);
            if toposort(&graph, None).is_err() {
                return Err(SolverError::InvalidConfig(
                    "factor relations contain a cycle".into(),
                ));
            }
        }
        self.sort_factors();
        Ok(())
    }

    fn relation_graph(&self, relations: &[(FactorId, FactorId)]) -> DiGraph<(), (), usize> {
        let mut graph =
            DiGraph::<(), (), usize>::with_capacity(self.factors.len(), relations.len());
        for _ in 0..self.factors.len() {
            graph.add_node(());
        }
        for (before, after) in relations {
            if self.factor_mask[*before] && self.factor_mask[*after] {
                graph.add_edge(NodeIndex::new(*before), NodeIndex::new(*after), ());
            }
        }
        graph
    }

    fn sorted_ordering(
        &self,
        relations: &[(FactorId, FactorId)],
    ) -> (Vec<FactorId>, Vec<FactorId>) {
        let graph = self.relation_graph(relations);
        let sorted = toposort(&graph, None).expect("factor relations must form a DAG");
        let ordering: Vec<FactorId> = sorted
            .into_iter()
            .map(|node| node.index())
            .filter(|factor| self.factor_mask[*factor])
            .collect();
        let update_ordering = ordering
            .iter()
            .copied()
            .filter(|factor| is_update_eligible(&self.factors, &self.messages, *factor))
            .collect();
        (ordering, update_ordering)
    }

    // Computes the forward and backward topological orderings plus the
    // update orderings that drop no-op factors
    fn sort_factors(&mut self) {
        if self.ordering_valid {
            return;
        }
        self.ordering_valid = true;

        let (ordering, update_ordering) = self.sorted_ordering(&self.forward_relations);
        self.forward_ordering = ordering;
        self.forward_update_ordering = update_ordering;

        let (ordering, update_ordering) = self.sorted_ordering(&self.backward_relations);
        self.backward_ordering = ordering;
        self.backward_update_ordering = update_ordering;

        debug!(
            "sorted {} active factors, {} forward updates, {} backward updates",
            self.forward_ordering.len(),
            self.forward_update_ordering.len(),
            self.backward_update_ordering.len()
        );
    }

    pub fn forward_ordering(&mut self) -> &[FactorId] {
        self.sort_factors();
        &self.forward_ordering
    }

    pub fn backward_ordering(&mut self) -> &[FactorId] {
        self.sort_factors();
        &self.backward_ordering
    }

    pub fn forward_update_ordering(&mut self) -> &[FactorId] {
        self.sort_factors();
        &self.forward_update_ordering
    }

    pub fn backward_update_ordering(&mut self) -> &[FactorId] {
        self.sort_factors();
        &self.backward_update_ordering
    }

    fn ensure_anisotropic(&mut self) {
        if self.omega_anisotropic.valid {
            return;
        }
        self.omega_anisotropic.forward = compute_anisotropic_weights(
            &self.factors,
            &self.messages,
            &self.forward_ordering,
            &self.factor_mask,
        );
        self.omega_anisotropic.backward = compute_anisotropic_weights(
            &self.factors,
            &self.messages,
            &self.backward_ordering,
            &self.factor_mask,
        );
        self.omega_anisotropic.valid = true;
    }

    fn ensure_anisotropic2(&mut self) {
        if self.omega_anisotropic2.valid {
            return;
        }
        self.omega_anisotropic2.forward = compute_anisotropic2_weights(
            &self.factors,
            &self.messages,
            &self.forward_ordering,
            &self.factor_mask,
        );
        self.omega_anisotropic2.backward = compute_anisotropic2_weights(
            &self.factors,
            &self.messages,
            &self.backward_ordering,
            &self.factor_mask,
        );
        self.omega_anisotropic2.valid = true;
    }

    fn ensure_uniform(&mut self) {
        if self.omega_uniform.valid {
            return;
        }
        self.omega_uniform.forward = compute_uniform_weights(
            &self.factors,
            &self.messages,
            &self.forward_ordering,
            &self.factor_mask,
            0.,
        );
        self.omega_uniform.backward = compute_uniform_weights(
            &self.factors,
            &self.messages,
            &self.backward_ordering,
            &self.factor_mask,
            0.,
        );
        self.omega_uniform.valid = true;
    }

    fn ensure_damped_uniform(&mut self) {
        if self.omega_damped_uniform.valid {
            return;
        }
        self.omega_damped_uniform.forward = compute_uniform_weights(
            &self.factors,
            &self.messages,
            &self.forward_ordering,
            &self.factor_mask,
            1.,
        );
        self.omega_damped_uniform.backward = compute_uniform_weights(
            &self.factors,
            &self.messages,
            &self.backward_ordering,
            &self.factor_mask,
            1.,
        );
        self.omega_damped_uniform.valid = true;
    }

    // The mixed cache owns a single validity flag and refreshes both of its
    // inputs whenever it is stale, so independently invalidated sub-policies
    // cannot leave it behind.
    fn ensure_mixed(&mut self) {
        if self.omega_mixed.valid {
            return;
        }
        self.ensure_anisotropic();
        self.ensure_damped_uniform();
        self.omega_mixed.forward = compute_mixed_weights(
            &self.omega_anisotropic.forward,
            &self.omega_damped_uniform.forward,
        );
        self.omega_mixed.backward = compute_mixed_weights(
            &self.omega_anisotropic.backward,
            &self.omega_damped_uniform.backward,
        );
        self.omega_mixed.valid = true;
    }

    fn ensure_omega(&mut self) {
        self.sort_factors();
        match self.repam_mode.expect("reparametrization mode not set") {
            RepamMode::Anisotropic => self.ensure_anisotropic(),
            RepamMode::Anisotropic2 => self.ensure_anisotropic2(),
            RepamMode::Uniform => self.ensure_uniform(),
            RepamMode::DampedUniform => self.ensure_damped_uniform(),
            RepamMode::Mixed => self.ensure_mixed(),
        }
    }

    // Read access to the current omega tables, mainly for tests and
    // diagnostics
    pub fn omega_tables(&mut self) -> (&JaggedArray2<f64>, &JaggedArray2<f64>) {
        self.ensure_omega();
        let cache = match self.repam_mode.unwrap() {
            RepamMode::Anisotropic => &self.omega_anisotropic,
            RepamMode::Anisotropic2 => &self.omega_anisotropic2,
            RepamMode::Uniform => &self.omega_uniform,
            RepamMode::DampedUniform => &self.omega_damped_uniform,
            RepamMode::Mixed => &self.omega_mixed,
        };
        (&cache.forward, &cache.backward)
    }

    fn pass(&mut self, direction: Direction, timestamp: Option<u64>) {
        self.ensure_omega();
        let repam_type = self.repam_type;
        let mode = self.repam_mode.expect("reparametrization mode not set");
        let Lp {
            factors,
            messages,
            forward_update_ordering,
            backward_update_ordering,
            omega_anisotropic,
            omega_anisotropic2,
            omega_uniform,
            omega_damped_uniform,
            omega_mixed,
            ..
        } = self;
        let cache = match mode {
            RepamMode::Anisotropic => omega_anisotropic,
            RepamMode::Anisotropic2 => omega_anisotropic2,
            RepamMode::Uniform => omega_uniform,
            RepamMode::DampedUniform => omega_damped_uniform,
            RepamMode::Mixed => omega_mixed,
        };
        let (ordering, omega): (&[FactorId], &JaggedArray2<f64>) = match direction {
            Direction::Forward => (forward_update_ordering, &cache.forward),
            Direction::Backward => (backward_update_ordering, &cache.backward),
        };
        assert_eq!(ordering.len(), omega.len());

        for (row, &factor) in ordering.iter().enumerate() {
            let weights = omega.row(row);
            match timestamp {
                Some(timestamp) => {
                    factor_container::update_with_primal(factors, messages, factor, weights, timestamp)
                }
                None => match repam_type {
                    ReparametrizationType::Shared => {
                        factor_container::update(factors, messages, factor, weights)
                    }
                    ReparametrizationType::Residual => {
                        factor_container::update_residual(factors, messages, factor, weights)
                    }
                },
            }
        }
    }

    pub fn compute_forward_pass(&mut self) {
        self.pass(Direction::Forward, None);
    }

    pub fn compute_backward_pass(&mut self) {
        self.pass(Direction::Backward, None);
    }

    pub fn compute_pass(&mut self, iteration: usize) {
        debug!("compute_pass iteration {}", iteration);
        self.compute_forward_pass();
        self.compute_backward_pass();
    }

    // Primal-computing passes; the timestamps 2k+1 and 2k+2 guarantee at
    // most one primal initialization per factor and direction
    pub fn compute_forward_pass_and_primal(&mut self, iteration: usize) {
        self.pass(Direction::Forward, Some(2 * iteration as u64 + 1));
    }

    pub fn compute_backward_pass_and_primal(&mut self, iteration: usize) {
        self.pass(Direction::Backward, Some(2 * iteration as u64 + 2));
    }

    pub fn compute_pass_and_primal(&mut self, iteration: usize) {
        self.compute_forward_pass_and_primal(iteration);
        self.compute_backward_pass_and_primal(iteration);
    }

    pub fn lower_bound(&self) -> f64 {
        let mut bound = self.constant;
        for factor in &self.factors {
            bound += factor.lower_bound();
            debug_assert!(bound.is_finite());
        }
        bound
    }

    pub fn check_primal_consistency(&self) -> bool {
        let consistent = self
            .messages
            .iter()
            .all(|message| message.check_primal_consistency(&self.factors));
        debug!("primal solution consistent: {}", consistent);
        consistent
    }

    pub fn evaluate_primal(&self) -> f64 {
        if !self.check_primal_consistency() {
            return f64::INFINITY;
        }
        let mut cost = self.constant;
        for factor in &self.factors {
            debug_assert!(factor.lower_bound() <= factor.evaluate_primal() + EPS);
            cost += factor.evaluate_primal();
        }
        cost
    }

    pub fn propagate_primal(&mut self, factor: FactorId) {
        factor_container::propagate_primal(&mut self.factors, &self.messages, factor);
    }

    // Marks factors that are locally non-optimal or incident to a
    // primal-inconsistent message, then widens the marked region by the
    // given number of message-adjacency rounds
    pub fn get_inconsistent_mask(&self, fatten_rounds: usize) -> FactorMask {
        let mut mask = FactorMask::repeat(false, self.factors.len());

        for (index, factor) in self.factors.iter().enumerate() {
            if factor.lower_bound() < factor.evaluate_primal() - EPS {
                mask.set(index, true);
            }
        }

        for message in &self.messages {
            if !message.check_primal_consistency(&self.factors) {
                mask.set(message.left(), true);
                mask.set(message.right(), true);
            }
        }

        for _ in 0..fatten_rounds {
            for message in &self.messages {
                if mask[message.left()] || mask[message.right()] {
                    mask.set(message.left(), true);
                    mask.set(message.right(), true);
                }
            }
        }

        let marked = mask.count_ones();
        info!(
            "inconsistent factors: {} of {}",
            marked,
            self.factors.len()
        );
        mask
    }

    // Restricts further optimization to the factors marked inconsistent
    pub fn reduce_optimization_factors(&mut self) {
        let mask = self.get_inconsistent_mask(1);
        self.set_factor_mask(mask);
    }

    // For the data-parallel mode: a factor needs a synchronized update iff
    // one of its distance-two neighbors falls into a different worker's
    // contiguous range of the update ordering.
    fn synchronization_for(&self, ordering: &[FactorId], workers: usize) -> Vec<bool> {
        assert!(workers > 0);
        let n = ordering.len();
        let mut worker_of = vec![usize::MAX; self.factors.len()];
        for worker in 0..workers {
            let start = worker * n / workers;
            let end = (worker + 1) * n / workers;
            for &factor in &ordering[start..end] {
                worker_of[factor] = worker;
            }
        }

        let mut conflict = vec![false; self.factors.len()];
        for (factor, container) in self.factors.iter().enumerate() {
            let mut previous = worker_of[factor];
            for adj in container.adjacent() {
                let other = self.messages[adj.message].other_endpoint(adj.chirality);
                let worker = worker_of[other];
                if worker != usize::MAX {
                    if previous != usize::MAX && worker != previous {
                        conflict[factor] = true;
                    }
                    previous = worker;
                }
            }
        }

        ordering
            .iter()
            .map(|&factor| {
                conflict[factor]
                    || self.factors[factor].adjacent().iter().any(|adj| {
                        conflict[self.messages[adj.message].other_endpoint(adj.chirality)]
                    })
            })
            .collect()
    }

    pub fn compute_synchronization(&mut self, workers: usize) -> (Vec<bool>, Vec<bool>) {
        self.sort_factors();
        let forward = self.synchronization_for(&self.forward_update_ordering, workers);
        let backward = self.synchronization_for(&self.backward_update_ordering, workers);
        (forward, backward)
    }
}

impl Default for Lp {
    fn default() -> Self {
        Lp::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc};

    use approx::assert_abs_diff_eq;

    use crate::{
        archive::{DualArchive, PrimalArchive},
        factors::dense_factor::DenseFactor,
        messages::coupling_message::CouplingMessage,
    };

    use super::*;

    fn unary(costs: Vec<f64>) -> Box<dyn Factor> {
        Box::new(DenseFactor::unary(costs))
    }

    fn coupling() -> Box<dyn MessageOp> {
        Box::new(CouplingMessage::unary())
    }

    // two unary factors tied by one coupling message
    fn chain_lp() -> Lp {
        let mut lp = Lp::new();
        let a = lp.add_factor(unary(vec![3., 1.]));
        let b = lp.add_factor(unary(vec![0., 2.]));
        lp.add_message(a, b, PassingSchedule::Full, coupling());
        lp.add_relation(a, b);
        lp
    }

    // three unary factors on a frustrated cycle
    fn triangle_lp() -> Lp {
        let mut lp = Lp::new();
        let a = lp.add_factor(unary(vec![0., 1.]));
        let b = lp.add_factor(unary(vec![1., 0.]));
        let c = lp.add_factor(unary(vec![0., 1.]));
        lp.add_message(a, b, PassingSchedule::Full, coupling());
        lp.add_message(b, c, PassingSchedule::Full, coupling());
        lp.add_message(a, c, PassingSchedule::Full, coupling());
        lp.add_relation(a, b);
        lp.add_relation(b, c);
        lp.add_relation(a, c);
        lp
    }

    #[test]
    fn chain_forward_pass_reaches_coupled_optimum() {
        let mut lp = chain_lp();
        lp.set_reparametrization(RepamMode::Uniform);
        assert_eq!(lp.lower_bound(), 1.);

        lp.compute_forward_pass();
        // the coupled optimum min(3 + 0, 1 + 2) is collected in one sweep
        assert_abs_diff_eq!(lp.lower_bound(), 3., epsilon = EPS);
    }

    #[test]
    fn chain_primal_rounding_matches_lower_bound() {
        let mut lp = chain_lp();
        lp.set_reparametrization(RepamMode::Uniform);
        lp.compute_pass_and_primal(0);

        assert!(lp.check_primal_consistency());
        assert_abs_diff_eq!(lp.evaluate_primal(), lp.lower_bound(), epsilon = EPS);
        assert_abs_diff_eq!(lp.evaluate_primal(), 3., epsilon = EPS);
    }

    #[test]
    fn monotone_dual_over_iterations() {
        for mode in [
            RepamMode::Anisotropic,
            RepamMode::Anisotropic2,
            RepamMode::Uniform,
            RepamMode::DampedUniform,
            RepamMode::Mixed,
        ] {
            let mut lp = triangle_lp();
            lp.set_reparametrization(mode);
            let mut previous = lp.lower_bound();
            for iteration in 0..10 {
                lp.compute_pass(iteration);
                let current = lp.lower_bound();
                assert!(
                    current >= previous - EPS,
                    "{mode:?} decreased the bound: {previous} -> {current}"
                );
                previous = current;
            }
        }
    }

    #[test]
    fn triangle_frustrated_cycle_converges() {
        for mode in [RepamMode::Uniform, RepamMode::Anisotropic] {
            let mut lp = triangle_lp();
            lp.set_reparametrization(mode);
            for iteration in 0..20 {
                lp.compute_pass_and_primal(iteration);
            }
            assert_abs_diff_eq!(lp.lower_bound(), 1., epsilon = 1e-6);
            assert!(lp.check_primal_consistency());
            assert_abs_diff_eq!(lp.evaluate_primal(), 1., epsilon = 1e-6);
        }
    }

    #[test]
    fn residual_passes_stay_monotone() {
        let mut lp = triangle_lp();
        lp.set_reparametrization(RepamMode::Uniform);
        lp.set_reparametrization_type(ReparametrizationType::Residual);
        let mut previous = lp.lower_bound();
        for iteration in 0..10 {
            lp.compute_pass(iteration);
            let current = lp.lower_bound();
            assert!(current >= previous - EPS);
            previous = current;
        }
        assert_abs_diff_eq!(lp.lower_bound(), 1., epsilon = 1e-6);
    }

    #[test]
    fn topological_orderings_respect_relations() {
        let mut lp = Lp::new();
        let factors: Vec<_> = (0..5).map(|_| lp.add_factor(unary(vec![0., 0.]))).collect();
        lp.add_relation(factors[3], factors[1]);
        lp.add_relation(factors[1], factors[4]);
        lp.add_relation(factors[3], factors[0]);

        let forward = lp.forward_ordering().to_vec();
        let position = |ordering: &[FactorId], f: FactorId| {
            ordering.iter().position(|x| *x == f).unwrap()
        };
        assert!(position(&forward, 3) < position(&forward, 1));
        assert!(position(&forward, 1) < position(&forward, 4));
        assert!(position(&forward, 3) < position(&forward, 0));

        let backward = lp.backward_ordering().to_vec();
        assert!(position(&backward, 4) < position(&backward, 1));
        assert!(position(&backward, 1) < position(&backward, 3));
    }

    #[test]
    fn cyclic_relations_are_a_configuration_error() {
        let mut lp = Lp::new();
        let a = lp.add_factor(unary(vec![0.]));
        let b = lp.add_factor(unary(vec![0.]));
        lp.add_forward_relation(a, b);
        lp.add_forward_relation(b, a);
        assert!(matches!(lp.begin(), Err(SolverError::InvalidConfig(_))));
    }

    #[test]
    fn additive_constant_enters_both_bounds() {
        let mut lp = chain_lp();
        lp.set_reparametrization(RepamMode::Uniform);
        lp.add_to_constant(10.);
        lp.compute_pass_and_primal(0);
        assert_abs_diff_eq!(lp.lower_bound(), 13., epsilon = EPS);
        assert_abs_diff_eq!(lp.evaluate_primal(), 13., epsilon = EPS);
    }

    // counts primal initializations; carries no messages
    #[derive(Clone, Debug)]
    struct CountingFactor {
        cost: f64,
        labeled: bool,
        init_count: Rc<Cell<usize>>,
    }

    impl Factor for CountingFactor {
        fn clone_boxed(&self) -> Box<dyn Factor> {
            Box::new(self.clone())
        }

        fn lower_bound(&self) -> f64 {
            self.cost
        }

        fn compute_primal(&mut self) {
            self.labeled = true;
        }

        fn evaluate_primal(&self) -> f64 {
            if self.labeled {
                self.cost
            } else {
                f64::INFINITY
            }
        }

        fn init_primal(&mut self) {
            self.labeled = false;
            self.init_count.set(self.init_count.get() + 1);
        }

        fn serialize_dual(&mut self, archive: &mut DualArchive) {
            archive.entry(&mut self.cost);
        }

        fn serialize_primal(&mut self, _archive: &mut PrimalArchive) {}

        fn divide(&mut self, value: f64) {
            self.cost /= value;
        }

        fn subgradient(&self, _weights: &mut [f64], _sign: f64) {}

        fn dot_product(&self, _weights: &[f64]) -> f64 {
            0.
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }
    }

    #[test]
    fn primal_initialized_once_per_pass_direction() {
        let mut lp = Lp::new();
        let counters: Vec<Rc<Cell<usize>>> = (0..3).map(|_| Rc::new(Cell::new(0))).collect();
        for counter in &counters {
            lp.add_factor(Box::new(CountingFactor {
                cost: 0.,
                labeled: false,
                init_count: Rc::clone(counter),
            }));
        }
        lp.add_relation(0, 1);
        lp.add_relation(1, 2);
        lp.set_reparametrization(RepamMode::Uniform);

        lp.compute_forward_pass_and_primal(0);
        for counter in &counters {
            assert_eq!(counter.get(), 1);
        }

        lp.compute_forward_pass_and_primal(1);
        for counter in &counters {
            assert_eq!(counter.get(), 2);
        }
    }

    #[test]
    fn pass_and_primal_stamps_every_factor() {
        let mut lp = chain_lp();
        lp.set_reparametrization(RepamMode::Uniform);
        lp.compute_forward_pass_and_primal(0);
        for factor in lp.factors() {
            assert_eq!(factor.primal_timestamp(), 1);
        }
        lp.compute_backward_pass_and_primal(0);
        for factor in lp.factors() {
            assert_eq!(factor.primal_timestamp(), 2);
        }
    }

    #[test]
    fn inconsistent_mask_fattens_across_messages() {
        let mut lp = triangle_lp();
        lp.set_reparametrization(RepamMode::Uniform);
        lp.compute_pass(0);
        // no primal computed: every factor evaluates to infinity
        let mask = lp.get_inconsistent_mask(0);
        assert_eq!(mask.count_ones(), 3);

        // a consistent rounded primal clears the mask
        let mut lp = triangle_lp();
        lp.set_reparametrization(RepamMode::Uniform);
        for iteration in 0..20 {
            lp.compute_pass_and_primal(iteration);
        }
        let mask = lp.get_inconsistent_mask(1);
        assert_eq!(mask.count_ones(), 0);
    }

    #[test]
    fn synchronization_mask_marks_worker_borders() {
        let mut lp = Lp::new();
        let factors: Vec<_> = (0..6)
            .map(|_| lp.add_factor(unary(vec![0., 0.])))
            .collect();
        for window in factors.windows(2) {
            lp.add_message(window[0], window[1], PassingSchedule::Full, coupling());
            lp.add_relation(window[0], window[1]);
        }

        let (forward, _backward) = lp.compute_synchronization(2);
        assert_eq!(forward, vec![false, true, true, true, true, false]);

        // a single worker needs no synchronization at all
        let (forward, backward) = lp.compute_synchronization(1);
        assert!(forward.iter().all(|sync| !sync));
        assert!(backward.iter().all(|sync| !sync));
    }

    #[test]
    fn masked_factors_drop_out_of_orderings() {
        let mut lp = triangle_lp();
        let mut mask = FactorMask::repeat(true, 3);
        mask.set(2, false);
        lp.set_factor_mask(mask);
        assert_eq!(lp.forward_ordering().to_vec(), vec![0, 1]);
    }

    #[test]
    fn omega_tables_match_update_orderings() {
        let mut lp = triangle_lp();
        lp.set_reparametrization(RepamMode::Mixed);
        let update_len = lp.forward_update_ordering().len();
        let (forward, backward) = lp.omega_tables();
        assert_eq!(forward.len(), update_len);
        assert_eq!(backward.len(), update_len);
        for table in [forward, backward] {
            for row in table.rows() {
                assert!(row.iter().sum::<f64>() <= 1. + EPS);
            }
        }
    }
}
