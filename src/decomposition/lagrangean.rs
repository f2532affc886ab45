#![allow(dead_code)]

use std::collections::BTreeMap;

use log::{debug, info};

use crate::{
    archive::DualArchive,
    lp::{factor_container::FactorContainer, scheduler::Lp, solver::SolverError},
    Chirality, FactorId, EPS,
};

use super::tree::FactorTree;

// Coordinate layout of the multipliers coupling the clones of a shared
// factor. All four layouts expose the same mapping/serialize/subgradient
// surface; they differ only in how many global coordinates a group takes
// and which clone touches which block with which sign.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CouplingLayout {
    // one multiplier vector per pair of clones
    Quadratic,
    // one distinguished clone carries k-1 positive copies, the others one
    // negative copy each
    Star,
    // one vector per clone, constrained to sum to zero across the group
    ZeroSum,
    // one vector shared by the whole group
    Fwmap,
}

impl CouplingLayout {
    // total number of global coordinates taken by a group of k clones with
    // the given per-clone dual length
    fn joint_len(&self, clone_count: usize, dual_len: usize) -> usize {
        match self {
            CouplingLayout::Quadratic => clone_count * (clone_count - 1) / 2 * dual_len,
            CouplingLayout::Star => (clone_count - 1) * dual_len,
            CouplingLayout::ZeroSum => clone_count * dual_len,
            CouplingLayout::Fwmap => dual_len,
        }
    }
}

// index of the multiplier block of the clone pair (i, j), i < j
fn pair_block(i: usize, j: usize, clone_count: usize) -> usize {
    assert!(i < j && j < clone_count);
    i * clone_count - i * (i + 1) / 2 + (j - i - 1)
}

// A clone of a shared factor together with its slice of the global
// Lagrangean vector. `position` is the clone's index within its group.
#[derive(Clone, Debug)]
pub struct LagrangeanFactor {
    factor: FactorId,
    layout: CouplingLayout,
    dual_len: usize,
    global_offset: usize,
    local_offset: usize,
    position: usize,
    clone_count: usize,
}

impl LagrangeanFactor {
    fn new(
        factor: FactorId,
        layout: CouplingLayout,
        dual_len: usize,
        group_offset: usize,
        position: usize,
        clone_count: usize,
    ) -> Self {
        let global_offset = match layout {
            CouplingLayout::Quadratic | CouplingLayout::Fwmap => group_offset,
            CouplingLayout::Star => {
                if position == 0 {
                    group_offset
                } else {
                    group_offset + (position - 1) * dual_len
                }
            }
            CouplingLayout::ZeroSum => group_offset + position * dual_len,
        };
        LagrangeanFactor {
            factor,
            layout,
            dual_len,
            global_offset,
            local_offset: 0,
            position,
            clone_count,
        }
    }

    pub fn factor(&self) -> FactorId {
        self.factor
    }

    pub fn dual_len(&self) -> usize {
        self.dual_len
    }

    // The global block offsets this clone touches, with the sign it applies
    fn blocks(&self) -> Vec<(usize, f64)> {
        match self.layout {
            CouplingLayout::Fwmap | CouplingLayout::ZeroSum => vec![(self.global_offset, 1.)],
            CouplingLayout::Star => {
                if self.position == 0 {
                    (0..self.clone_count - 1)
                        .map(|block| (self.global_offset + block * self.dual_len, 1.))
                        .collect()
                } else {
                    vec![(self.global_offset, -1.)]
                }
            }
            CouplingLayout::Quadratic => {
                let mut blocks = Vec::with_capacity(self.clone_count - 1);
                for other in 0..self.position {
                    let block = pair_block(other, self.position, self.clone_count);
                    blocks.push((self.global_offset + block * self.dual_len, 1.));
                }
                for other in self.position + 1..self.clone_count {
                    let block = pair_block(self.position, other, self.clone_count);
                    blocks.push((self.global_offset + block * self.dual_len, -1.));
                }
                blocks
            }
        }
    }

    // Appends this clone's coordinate slots to the tree's mapping vector
    pub fn add_to_mapping(&mut self, mapping: &mut Vec<usize>) {
        self.local_offset = mapping.len();
        for (block_offset, _sign) in self.blocks() {
            for entry in 0..self.dual_len {
                mapping.push(block_offset + entry);
            }
        }
    }

    pub fn local_len(&self) -> usize {
        self.blocks().len() * self.dual_len
    }

    // Adds `scale * w` into the clone's dual state, block by block with the
    // layout's signs
    pub fn serialize_lagrangean(
        &self,
        factors: &mut [FactorContainer],
        local_weights: &[f64],
        scale: f64,
    ) {
        let mut cursor = self.local_offset;
        for (_block_offset, sign) in self.blocks() {
            let chunk = local_weights[cursor..cursor + self.dual_len].to_vec();
            cursor += self.dual_len;
            let mut archive = DualArchive::scaled_add(chunk, sign * scale);
            factors[self.factor].serialize_dual(&mut archive);
        }
    }

    // Writes the clone's current primal as a signed indicator into the local
    // coordinates
    pub fn copy_subgradient(&self, factors: &[FactorContainer], local: &mut [f64]) {
        let mut cursor = self.local_offset;
        for (_block_offset, sign) in self.blocks() {
            factors[self.factor].subgradient(&mut local[cursor..cursor + self.dual_len], sign);
            cursor += self.dual_len;
        }
    }

    pub fn dot_product(&self, factors: &[FactorContainer], local_weights: &[f64]) -> f64 {
        let mut value = 0.;
        let mut cursor = self.local_offset;
        for (_block_offset, sign) in self.blocks() {
            value +=
                sign * factors[self.factor].dot_product(&local_weights[cursor..cursor + self.dual_len]);
            cursor += self.dual_len;
        }
        value
    }
}

// A factor tree extended by the Lagrangean clones living in it and the
// mapping from its local multiplier coordinates to global ones.
#[derive(Clone, Debug, Default)]
pub struct LagrangeanTree {
    pub tree: FactorTree,
    lagrangean_factors: Vec<LagrangeanFactor>,
    original_factors: Vec<FactorId>,
    mapping: Vec<usize>,
}

impl LagrangeanTree {
    fn new(tree: FactorTree) -> Self {
        LagrangeanTree {
            tree,
            lagrangean_factors: Vec::new(),
            original_factors: Vec::new(),
            mapping: Vec::new(),
        }
    }

    pub fn mapping(&self) -> &[usize] {
        &self.mapping
    }

    pub fn lagrangean_factors(&self) -> &[LagrangeanFactor] {
        &self.lagrangean_factors
    }

    pub fn dual_len(&self) -> usize {
        self.mapping.len()
    }

    // Adds `scale * w` (in local coordinates) into the clones' dual states
    pub fn add_weights(&self, factors: &mut [FactorContainer], local_weights: &[f64], scale: f64) {
        assert_eq!(local_weights.len(), self.mapping.len());
        for lagrangean in &self.lagrangean_factors {
            lagrangean.serialize_lagrangean(factors, local_weights, scale);
        }
    }

    // Accumulates this tree's subgradient into the global vector
    pub fn compute_mapped_subgradient(&self, factors: &[FactorContainer], global: &mut [f64]) {
        let mut local = vec![0.; self.mapping.len()];
        for lagrangean in &self.lagrangean_factors {
            lagrangean.copy_subgradient(factors, &mut local);
        }
        for (slot, coordinate) in self.mapping.iter().enumerate() {
            global[*coordinate] += local[slot];
        }
    }

    pub fn dot_product(&self, factors: &[FactorContainer], local_weights: &[f64]) -> f64 {
        self.lagrangean_factors
            .iter()
            .map(|lagrangean| lagrangean.dot_product(factors, local_weights))
            .sum()
    }

    // Snapshot of the clones' primal labels, one archive per clone
    pub fn save_primal(&self, factors: &mut [FactorContainer]) -> Vec<u64> {
        let mut snapshot = Vec::new();
        for lagrangean in &self.lagrangean_factors {
            snapshot.extend(factors[lagrangean.factor].save_primal());
        }
        snapshot
    }

    pub fn load_primal(&self, factors: &mut [FactorContainer], snapshot: &[u64]) {
        let mut cursor = 0;
        for lagrangean in &self.lagrangean_factors {
            let len = {
                let mut archive = crate::archive::PrimalArchive::size();
                factors[lagrangean.factor].serialize_primal(&mut archive);
                archive.count()
            };
            factors[lagrangean.factor].load_primal(snapshot[cursor..cursor + len].to_vec());
            cursor += len;
        }
        assert_eq!(cursor, snapshot.len());
    }
}

// Partitions the factors of an LP into trees, clones factors shared between
// trees, and maintains the global Lagrangean vector coupling the clones.
pub struct TreeDecomposition {
    lp: Lp,
    trees: Vec<LagrangeanTree>,
    layout: CouplingLayout,
    global_len: usize,
    constructed: bool,
    tree_decomposition_begin: usize,
}

impl TreeDecomposition {
    pub fn new(lp: Lp, layout: CouplingLayout) -> Self {
        TreeDecomposition {
            lp,
            trees: Vec::new(),
            layout,
            global_len: 0,
            constructed: false,
            tree_decomposition_begin: 0,
        }
    }

    pub fn with_begin_iteration(mut self, iteration: usize) -> Self {
        self.tree_decomposition_begin = iteration;
        self
    }

    pub fn lp(&self) -> &Lp {
        &self.lp
    }

    pub fn lp_mut(&mut self) -> &mut Lp {
        &mut self.lp
    }

    pub fn layout(&self) -> CouplingLayout {
        self.layout
    }

    pub fn trees(&self) -> &[LagrangeanTree] {
        &self.trees
    }

    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn global_len(&self) -> usize {
        self.global_len
    }

    pub fn constructed(&self) -> bool {
        self.constructed
    }

    pub fn tree_decomposition_begin(&self) -> usize {
        self.tree_decomposition_begin
    }

    pub fn add_tree(&mut self, tree: FactorTree) {
        assert!(!self.constructed, "trees must be added before construction");
        self.trees.push(LagrangeanTree::new(tree));
    }

    // Finds factors shared between trees, clones them, divides their cost by
    // the occurrence count, reseats the tree messages onto the clones, and
    // assigns every clone its slice of the global Lagrangean vector.
    pub fn construct(&mut self) -> Result<(), SolverError> {
        assert!(!self.constructed);
        for tree in self.trees.iter_mut() {
            tree.tree.init(self.lp.messages());
            debug_assert!(tree.tree.is_valid(self.lp.messages()));
        }

        // occurrence count per factor, in factor order
        let mut occurrences: BTreeMap<FactorId, Vec<usize>> = BTreeMap::new();
        for (tree_index, tree) in self.trees.iter().enumerate() {
            for &factor in tree.tree.factors() {
                occurrences.entry(factor).or_default().push(tree_index);
            }
        }

        for factor in 0..self.lp.num_factors() {
            if self.lp.factor_mask()[factor] && !occurrences.contains_key(&factor) {
                return Err(SolverError::InvalidConfig(format!(
                    "factor {factor} is not covered by any tree"
                )));
            }
        }

        self.global_len = 0;
        for (&factor, tree_indices) in &occurrences {
            let clone_count = tree_indices.len();
            if clone_count < 2 {
                continue;
            }

            self.lp.divide_factor(factor, clone_count as f64);
            let dual_len = self.lp.factor_mut(factor).dual_size();
            let joint_len = self.layout.joint_len(clone_count, dual_len);

            for (position, &tree_index) in tree_indices.iter().enumerate() {
                let clone = self.lp.push_clone(factor);
                // reseat every tree message touching the original onto the clone
                for tree_message in self.trees[tree_index].tree.messages().to_vec() {
                    for chirality in [Chirality::Left, Chirality::Right] {
                        if self.lp.message(tree_message.message).endpoint(chirality) == factor {
                            self.lp
                                .reseat_message_endpoint(tree_message.message, chirality, clone);
                        }
                    }
                }
                self.trees[tree_index].tree.replace_factor(factor, clone);
                self.trees[tree_index]
                    .lagrangean_factors
                    .push(LagrangeanFactor::new(
                        clone,
                        self.layout,
                        dual_len,
                        self.global_len,
                        position,
                        clone_count,
                    ));
                self.trees[tree_index].original_factors.push(factor);
            }

            self.lp.set_factor_active(factor, false);
            debug!(
                "factor {} shared by {} trees takes {} Lagrangean coordinates",
                factor, clone_count, joint_len
            );
            self.global_len += joint_len;
        }

        for tree in self.trees.iter_mut() {
            let mut mapping = Vec::new();
            for lagrangean in tree.lagrangean_factors.iter_mut() {
                lagrangean.add_to_mapping(&mut mapping);
            }
            tree.mapping = mapping;
        }

        if !self.mapping_valid() {
            return Err(SolverError::InvalidConfig(
                "Lagrangean mapping does not cover the global vector correctly".into(),
            ));
        }

        self.constructed = true;
        info!(
            "decomposition constructed: {} trees, {} Lagrangean coordinates",
            self.trees.len(),
            self.global_len
        );
        Ok(())
    }

    // Every global coordinate must be referenced the number of times its
    // layout dictates: twice with opposite signs for Quadratic and Star,
    // once per clone slice for ZeroSum, once per clone for Fwmap.
    pub fn mapping_valid(&self) -> bool {
        let mut counts = vec![0usize; self.global_len];
        for tree in &self.trees {
            for &coordinate in tree.mapping() {
                if coordinate >= self.global_len {
                    return false;
                }
                counts[coordinate] += 1;
            }
        }
        match self.layout {
            CouplingLayout::Quadratic | CouplingLayout::Star => {
                counts.iter().all(|count| *count == 2)
            }
            CouplingLayout::ZeroSum => counts.iter().all(|count| *count == 1),
            CouplingLayout::Fwmap => counts.iter().all(|count| *count >= 2),
        }
    }

    pub fn solve_tree(&mut self, index: usize) -> f64 {
        let (factors, messages) = self.lp.stores_mut();
        self.trees[index].tree.solve(factors, messages)
    }

    pub fn tree_subgradient(&self, index: usize, global: &mut [f64]) {
        self.trees[index].compute_mapped_subgradient(self.lp.factors(), global);
    }

    // Adds `scale * w` (global coordinates) into every tree's clones
    pub fn add_weights(&mut self, global_weights: &[f64], scale: f64) {
        assert_eq!(global_weights.len(), self.global_len);
        for index in 0..self.trees.len() {
            let local: Vec<f64> = self.trees[index]
                .mapping()
                .iter()
                .map(|&coordinate| global_weights[coordinate])
                .collect();
            let (factors, _messages) = self.lp.stores_mut();
            self.trees[index].add_weights(factors, &local, scale);
        }
    }

    pub fn add_tree_weights(&mut self, index: usize, local_weights: &[f64], scale: f64) {
        let (factors, _messages) = self.lp.stores_mut();
        self.trees[index].add_weights(factors, local_weights, scale);
    }

    pub fn save_tree_primal(&mut self, index: usize) -> Vec<u64> {
        self.trees[index].save_primal(self.lp.factors_mut())
    }

    pub fn load_tree_primal(&mut self, index: usize, snapshot: &[u64]) {
        self.trees[index].load_primal(self.lp.factors_mut(), snapshot);
    }

    // This tree's subgradient in its local coordinates
    pub fn tree_local_subgradient(&self, index: usize) -> Vec<f64> {
        let mut local = vec![0.; self.trees[index].dual_len()];
        for lagrangean in self.trees[index].lagrangean_factors() {
            lagrangean.copy_subgradient(self.lp.factors(), &mut local);
        }
        local
    }

    pub fn tree_dot_product(&self, index: usize, local_weights: &[f64]) -> f64 {
        self.trees[index].dot_product(self.lp.factors(), local_weights)
    }

    // The decomposition lower bound: the sum of tree bounds once the
    // decomposition is constructed, the flat bound before that
    pub fn lower_bound(&self) -> f64 {
        if !self.constructed {
            return self.lp.lower_bound();
        }
        let mut bound = self.lp.constant();
        for tree in &self.trees {
            bound += tree.tree.lower_bound(self.lp.factors());
        }
        bound
    }

    // The summed Lagrangean contributions of all clones of a shared factor
    // cancel; equivalently, solving all trees on agreeing primals yields a
    // zero subgradient.
    pub fn subgradient_norm(&self, global: &[f64]) -> f64 {
        global.iter().map(|entry| entry.abs()).sum()
    }

    pub fn check_tree_agreement(&self) -> bool {
        let mut global = vec![0.; self.global_len];
        for tree in &self.trees {
            tree.compute_mapped_subgradient(self.lp.factors(), &mut global);
        }
        self.subgradient_norm(&global) <= EPS
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        factors::dense_factor::DenseFactor,
        lp::{omega::RepamMode, scheduler::Lp},
        messages::{coupling_message::CouplingMessage, message_trait::PassingSchedule},
    };

    use super::*;

    // factor F shared between two two-factor trees
    fn shared_factor_lp() -> (Lp, FactorTree, FactorTree) {
        let mut lp = Lp::new();
        let f = lp.add_factor(Box::new(DenseFactor::unary(vec![0., 4.])));
        let g1 = lp.add_factor(Box::new(DenseFactor::unary(vec![3., 0.])));
        let g2 = lp.add_factor(Box::new(DenseFactor::unary(vec![2., 0.])));
        let m1 = lp.add_message(f, g1, PassingSchedule::Full, Box::new(CouplingMessage::unary()));
        let m2 = lp.add_message(f, g2, PassingSchedule::Full, Box::new(CouplingMessage::unary()));
        lp.set_reparametrization(RepamMode::Uniform);

        let mut t1 = FactorTree::new();
        t1.add_message(m1, Chirality::Right);
        let mut t2 = FactorTree::new();
        t2.add_message(m2, Chirality::Right);
        (lp, t1, t2)
    }

    fn build(layout: CouplingLayout) -> TreeDecomposition {
        let (lp, t1, t2) = shared_factor_lp();
        let mut decomposition = TreeDecomposition::new(lp, layout);
        decomposition.add_tree(t1);
        decomposition.add_tree(t2);
        decomposition.construct().unwrap();
        decomposition
    }

    #[test]
    fn shared_factor_is_cloned_and_divided() {
        let decomposition = build(CouplingLayout::Quadratic);
        let lp = decomposition.lp();

        // two clones were appended, the original is masked out
        assert_eq!(lp.num_factors(), 5);
        assert!(!lp.factor_mask()[0]);
        for clone in [3, 4] {
            let dense = lp
                .factor(clone)
                .factor()
                .as_any()
                .downcast_ref::<DenseFactor>()
                .unwrap();
            assert_eq!(dense.costs(), &[0., 2.]);
        }

        // the tree messages now end at the clones, not at the original
        assert_ne!(lp.message(0).left(), 0);
        assert_ne!(lp.message(1).left(), 0);
        assert_ne!(lp.message(0).left(), lp.message(1).left());
    }

    #[test]
    fn quadratic_mapping_covers_every_coordinate_twice() {
        let decomposition = build(CouplingLayout::Quadratic);
        assert_eq!(decomposition.global_len(), 2);
        assert!(decomposition.mapping_valid());
        for tree in decomposition.trees() {
            assert_eq!(tree.mapping(), &[0, 1]);
        }
    }

    #[test]
    fn star_mapping_covers_every_coordinate_twice() {
        let decomposition = build(CouplingLayout::Star);
        assert_eq!(decomposition.global_len(), 2);
        assert!(decomposition.mapping_valid());
    }

    #[test]
    fn zero_sum_gives_every_clone_its_own_slice() {
        let decomposition = build(CouplingLayout::ZeroSum);
        assert_eq!(decomposition.global_len(), 4);
        assert!(decomposition.mapping_valid());
        assert_eq!(decomposition.trees()[0].mapping(), &[0, 1]);
        assert_eq!(decomposition.trees()[1].mapping(), &[2, 3]);
    }

    #[test]
    fn fwmap_shares_one_vector_across_clones() {
        let decomposition = build(CouplingLayout::Fwmap);
        assert_eq!(decomposition.global_len(), 2);
        assert!(decomposition.mapping_valid());
        assert_eq!(decomposition.trees()[0].mapping(), &[0, 1]);
        assert_eq!(decomposition.trees()[1].mapping(), &[0, 1]);
    }

    #[test]
    fn quadratic_weights_cancel_across_clones() {
        let mut decomposition = build(CouplingLayout::Quadratic);
        decomposition.add_weights(&[1., -2.], 0.5);

        let lp = decomposition.lp();
        let clone_costs: Vec<Vec<f64>> = [3, 4]
            .iter()
            .map(|&clone| {
                lp.factor(clone)
                    .factor()
                    .as_any()
                    .downcast_ref::<DenseFactor>()
                    .unwrap()
                    .costs()
                    .to_vec()
            })
            .collect();
        // opposite signs: the summed clone tables stay [0, 4]
        for entry in 0..2 {
            let total = clone_costs[0][entry] + clone_costs[1][entry];
            assert!((total - [0., 4.][entry]).abs() < 1e-12);
        }
        assert_ne!(clone_costs[0], clone_costs[1]);
    }

    #[test]
    fn uncovered_factors_are_a_configuration_error() {
        let (mut lp, t1, _t2) = shared_factor_lp();
        lp.set_reparametrization(RepamMode::Uniform);
        let mut decomposition = TreeDecomposition::new(lp, CouplingLayout::Quadratic);
        decomposition.add_tree(t1);
        assert!(matches!(
            decomposition.construct(),
            Err(SolverError::InvalidConfig(_))
        ));
    }

    #[test]
    fn tree_solve_after_construction_reaches_tree_optima() {
        let mut decomposition = build(CouplingLayout::Quadratic);
        let value_1 = decomposition.solve_tree(0);
        let value_2 = decomposition.solve_tree(1);
        // each tree holds half of F: min(3 + 0, 0 + 2) and min(2 + 0, 0 + 2)
        assert!((value_1 - 2.).abs() < 1e-12);
        assert!((value_2 - 2.).abs() < 1e-12);
        assert!((decomposition.lower_bound() - 4.).abs() < 1e-12);
    }
}
