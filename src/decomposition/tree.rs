#![allow(dead_code)]

use log::debug;

use crate::{
    lp::{factor_container::FactorContainer, message_container::MessageContainer},
    Chirality, FactorId, MessageId, EPS,
};

// One edge of a factor tree: the message and which of its endpoints lies
// nearer the root.
#[derive(Clone, Copy, Debug)]
pub struct TreeMessage {
    pub message: MessageId,
    pub chirality: Chirality,
}

// An ordered list of messages forming a rooted tree over factors. Iterating
// the list sends messages strictly from the leaves toward the root, so a
// single upward sweep followed by a downward primal propagation solves the
// tree exactly.
#[derive(Clone, Debug, Default)]
pub struct FactorTree {
    tree_messages: Vec<TreeMessage>,
    factors: Vec<FactorId>,
}

impl FactorTree {
    pub fn new() -> Self {
        FactorTree {
            tree_messages: Vec::new(),
            factors: Vec::new(),
        }
    }

    // Adds a message on the leaf-to-root path; `chirality` names the
    // endpoint nearer the root
    pub fn add_message(&mut self, message: MessageId, chirality: Chirality) {
        self.tree_messages.push(TreeMessage { message, chirality });
    }

    pub fn messages(&self) -> &[TreeMessage] {
        &self.tree_messages
    }

    pub fn factors(&self) -> &[FactorId] {
        &self.factors
    }

    pub(crate) fn replace_factor(&mut self, from: FactorId, to: FactorId) {
        for factor in self.factors.iter_mut() {
            if *factor == from {
                *factor = to;
            }
        }
    }

    // Collects the distinct endpoint factors of the tree messages
    pub fn init(&mut self, messages: &[MessageContainer]) {
        let mut factors = Vec::new();
        for tree_message in &self.tree_messages {
            let message = &messages[tree_message.message];
            for factor in [message.left(), message.right()] {
                if !factors.contains(&factor) {
                    factors.push(factor);
                }
            }
        }
        factors.sort_unstable();
        assert_eq!(
            factors.len(),
            self.tree_messages.len() + 1,
            "tree messages must span a tree"
        );
        self.factors = factors;
    }

    pub fn root(&self, messages: &[MessageContainer]) -> FactorId {
        let last = self
            .tree_messages
            .last()
            .expect("a tree holds at least one message");
        messages[last.message].endpoint(last.chirality)
    }

    // Checks that the messages form a connected rooted tree and are ordered
    // from the leaves upward
    pub fn is_valid(&self, messages: &[MessageContainer]) -> bool {
        if self.factors.is_empty() || self.factors.len() != self.tree_messages.len() + 1 {
            return false;
        }
        let local_index = |factor: FactorId| self.factors.iter().position(|f| *f == factor);

        // every message points from its leaf-ward to its root-ward factor;
        // the root is the unique factor that is never leaf-ward
        let mut is_leaf_ward = vec![false; self.factors.len()];
        let mut component = (0..self.factors.len()).collect::<Vec<_>>();
        fn find(component: &mut [usize], mut index: usize) -> usize {
            while component[index] != index {
                component[index] = component[component[index]];
                index = component[index];
            }
            index
        }

        for tree_message in &self.tree_messages {
            let message = &messages[tree_message.message];
            let root_ward = message.endpoint(tree_message.chirality);
            let leaf_ward = message.other_endpoint(tree_message.chirality);
            let (Some(root_ward), Some(leaf_ward)) =
                (local_index(root_ward), local_index(leaf_ward))
            else {
                return false;
            };
            is_leaf_ward[leaf_ward] = true;

            let root_a = find(&mut component, root_ward);
            let root_b = find(&mut component, leaf_ward);
            if root_a == root_b {
                // a cycle
                return false;
            }
            component[root_a] = root_b;
        }

        // connectivity and a unique root
        let roots = is_leaf_ward.iter().filter(|leaf| !**leaf).count();
        if roots != 1 {
            return false;
        }
        let representative = find(&mut component, 0);
        if (0..self.factors.len()).any(|index| find(&mut component, index) != representative) {
            return false;
        }

        // bottom-up ordering: a factor acts as sender only before its own
        // message toward the root was sent
        let mut sent = vec![false; self.factors.len()];
        for tree_message in &self.tree_messages {
            let message = &messages[tree_message.message];
            let root_ward = local_index(message.endpoint(tree_message.chirality)).unwrap();
            let leaf_ward = local_index(message.other_endpoint(tree_message.chirality)).unwrap();
            if sent[root_ward] {
                return false;
            }
            sent[leaf_ward] = true;
        }
        true
    }

    // Solves the tree: an upward sweep concentrates all slack at the root,
    // the root rounds its primal, and the downward sweep propagates the
    // optimal labeling back to the leaves. Returns the tree's primal cost,
    // which matches its lower bound.
    pub fn solve(&self, factors: &mut [FactorContainer], messages: &[MessageContainer]) -> f64 {
        assert_eq!(
            self.factors.len(),
            self.tree_messages.len() + 1,
            "call init before solve"
        );

        for tree_message in &self.tree_messages {
            messages[tree_message.message].send_up(factors, tree_message.chirality);
        }

        let root = self.root(messages);
        factors[root].factor_mut().init_primal();
        factors[root].factor_mut().compute_primal();
        let mut value = factors[root].evaluate_primal();

        for tree_message in self.tree_messages.iter().rev() {
            let message = &messages[tree_message.message];
            message.propagate_down(factors, tree_message.chirality);
            let leaf_ward = message.other_endpoint(tree_message.chirality);
            value += factors[leaf_ward].evaluate_primal();
        }

        debug!("tree solved with primal cost {}", value);
        debug_assert!(self.primal_consistent(factors, messages));
        debug_assert!((self.lower_bound(factors) - self.primal_cost(factors)).abs() <= EPS);
        debug_assert!((value - self.primal_cost(factors)).abs() <= EPS);
        value
    }

    pub fn primal_consistent(
        &self,
        factors: &[FactorContainer],
        messages: &[MessageContainer],
    ) -> bool {
        self.tree_messages
            .iter()
            .all(|tree_message| messages[tree_message.message].check_primal_consistency(factors))
    }

    pub fn primal_cost(&self, factors: &[FactorContainer]) -> f64 {
        self.factors
            .iter()
            .map(|factor| factors[*factor].evaluate_primal())
            .sum()
    }

    pub fn lower_bound(&self, factors: &[FactorContainer]) -> f64 {
        self.factors
            .iter()
            .map(|factor| factors[*factor].lower_bound())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use crate::{
        factors::dense_factor::DenseFactor,
        messages::{coupling_message::CouplingMessage, message_trait::PassingSchedule},
    };

    use super::*;

    fn unary_container(costs: Vec<f64>) -> FactorContainer {
        FactorContainer::new(Box::new(DenseFactor::unary(costs)))
    }

    fn coupling(left: FactorId, right: FactorId) -> MessageContainer {
        MessageContainer::new(
            left,
            right,
            PassingSchedule::Full,
            Box::new(CouplingMessage::unary()),
        )
    }

    // chain 0 - 1 - 2 rooted at factor 2
    fn chain_tree() -> (Vec<FactorContainer>, Vec<MessageContainer>, FactorTree) {
        let mut factors = vec![
            unary_container(vec![2., 5.]),
            unary_container(vec![0., 1.]),
            unary_container(vec![3., 0.]),
        ];
        let messages = vec![coupling(0, 1), coupling(1, 2)];
        factors[0].push_adjacent(0, Chirality::Left);
        factors[1].push_adjacent(0, Chirality::Right);
        factors[1].push_adjacent(1, Chirality::Left);
        factors[2].push_adjacent(1, Chirality::Right);

        let mut tree = FactorTree::new();
        tree.add_message(0, Chirality::Right);
        tree.add_message(1, Chirality::Right);
        tree.init(&messages);
        (factors, messages, tree)
    }

    #[test]
    fn chain_tree_is_valid() {
        let (_factors, messages, tree) = chain_tree();
        assert!(tree.is_valid(&messages));
        assert_eq!(tree.root(&messages), 2);
        assert_eq!(tree.factors(), &[0, 1, 2]);
    }

    #[test]
    fn top_down_ordering_is_rejected() {
        let (_factors, messages, _tree) = chain_tree();
        let mut tree = FactorTree::new();
        // root-ward message first: not a bottom-up arrangement
        tree.add_message(1, Chirality::Right);
        tree.add_message(0, Chirality::Right);
        tree.init(&messages);
        assert!(!tree.is_valid(&messages));
    }

    #[test]
    fn cyclic_messages_are_rejected() {
        let mut factors = vec![
            unary_container(vec![0., 0.]),
            unary_container(vec![0., 0.]),
        ];
        let messages = vec![coupling(0, 1), coupling(0, 1)];
        factors[0].push_adjacent(0, Chirality::Left);
        factors[1].push_adjacent(0, Chirality::Right);
        factors[0].push_adjacent(1, Chirality::Left);
        factors[1].push_adjacent(1, Chirality::Right);

        let mut tree = FactorTree::new();
        tree.add_message(0, Chirality::Right);
        tree.add_message(1, Chirality::Left);
        // two messages over two factors cannot span a tree
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            tree.init(&messages);
        }));
        assert!(result.is_err());
    }

    #[test]
    fn tree_solve_matches_lower_bound() {
        let (mut factors, messages, tree) = chain_tree();
        let value = tree.solve(&mut factors, &messages);

        // min over a common label: min(2+0+3, 5+1+0) = 5
        assert_abs_diff_eq!(value, 5., epsilon = EPS);
        assert_abs_diff_eq!(tree.lower_bound(&factors), 5., epsilon = EPS);
        assert_abs_diff_eq!(tree.primal_cost(&factors), 5., epsilon = EPS);
        assert!(tree.primal_consistent(&factors, &messages));
    }

    #[test]
    fn tree_rooted_at_the_left_end() {
        let mut factors = vec![
            unary_container(vec![2., 5.]),
            unary_container(vec![0., 1.]),
        ];
        let messages = vec![coupling(0, 1)];
        factors[0].push_adjacent(0, Chirality::Left);
        factors[1].push_adjacent(0, Chirality::Right);

        let mut tree = FactorTree::new();
        tree.add_message(0, Chirality::Left);
        tree.init(&messages);
        assert!(tree.is_valid(&messages));
        assert_eq!(tree.root(&messages), 0);

        let value = tree.solve(&mut factors, &messages);
        assert_abs_diff_eq!(value, 2., epsilon = EPS);
    }
}
