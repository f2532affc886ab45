#![allow(dead_code)]

use std::any::Any;

use crate::archive::{DualArchive, PrimalArchive};

use super::factor_trait::Factor;

// A factor over one or more discrete variables with an explicitly stored
// cost table. The table is flat and row-major with the last variable
// iterating fastest. The primal holds one optional label per variable.
#[derive(Clone, Debug)]
pub struct DenseFactor {
    domain_sizes: Vec<usize>,
    costs: Vec<f64>,
    primal: Vec<Option<usize>>,
}

impl DenseFactor {
    pub fn new(domain_sizes: Vec<usize>, costs: Vec<f64>) -> Self {
        assert!(!domain_sizes.is_empty(), "factor must cover at least one variable");
        assert_eq!(
            domain_sizes.iter().product::<usize>(),
            costs.len(),
            "cost table length must match the product of domain sizes"
        );
        let arity = domain_sizes.len();
        DenseFactor {
            domain_sizes,
            costs,
            primal: vec![None; arity],
        }
    }

    // Creates a factor over a single variable
    pub fn unary(costs: Vec<f64>) -> Self {
        let domain = costs.len();
        DenseFactor::new(vec![domain], costs)
    }

    pub fn arity(&self) -> usize {
        self.domain_sizes.len()
    }

    pub fn domain_size(&self, position: usize) -> usize {
        self.domain_sizes[position]
    }

    pub fn costs(&self) -> &[f64] {
        &self.costs
    }

    pub fn primal_at(&self, position: usize) -> Option<usize> {
        self.primal[position]
    }

    pub fn set_primal(&mut self, position: usize, label: usize) {
        assert!(label < self.domain_sizes[position]);
        self.primal[position] = Some(label);
    }

    // stride of each variable position in the flat table
    fn strides(&self) -> Vec<usize> {
        let arity = self.arity();
        let mut strides = vec![1; arity];
        for position in (0..arity.saturating_sub(1)).rev() {
            strides[position] = strides[position + 1] * self.domain_sizes[position + 1];
        }
        strides
    }

    fn label_of(&self, entry: usize, position: usize, strides: &[usize]) -> usize {
        (entry / strides[position]) % self.domain_sizes[position]
    }

    fn linear_index(&self) -> Option<usize> {
        let strides = self.strides();
        let mut index = 0;
        for (position, label) in self.primal.iter().enumerate() {
            index += (*label)? * strides[position];
        }
        Some(index)
    }

    // Minimum over the table for each label of the given variable
    pub fn min_marginals(&self, position: usize) -> Vec<f64> {
        let strides = self.strides();
        let mut marginals = vec![f64::INFINITY; self.domain_sizes[position]];
        for (entry, cost) in self.costs.iter().enumerate() {
            let label = self.label_of(entry, position, &strides);
            if *cost < marginals[label] {
                marginals[label] = *cost;
            }
        }
        marginals
    }

    // Like min_marginals, but only over entries consistent with the current
    // primal labels; inconsistent labels keep an infinite marginal
    pub fn min_marginals_restricted(&self, position: usize) -> Vec<f64> {
        let strides = self.strides();
        let mut marginals = vec![f64::INFINITY; self.domain_sizes[position]];
        'entries: for (entry, cost) in self.costs.iter().enumerate() {
            for (other, label) in self.primal.iter().enumerate() {
                if let Some(label) = label {
                    if self.label_of(entry, other, &strides) != *label {
                        continue 'entries;
                    }
                }
            }
            let label = self.label_of(entry, position, &strides);
            if *cost < marginals[label] {
                marginals[label] = *cost;
            }
        }
        marginals
    }

    // Adds `scale * deltas[label]` to every entry whose label of the given
    // variable is `label`
    pub fn reparam(&mut self, position: usize, deltas: &[f64], scale: f64) {
        assert_eq!(deltas.len(), self.domain_sizes[position]);
        let strides = self.strides();
        for entry in 0..self.costs.len() {
            let label = (entry / strides[position]) % self.domain_sizes[position];
            self.costs[entry] += scale * deltas[label];
        }
    }
}

impl Factor for DenseFactor {
    fn clone_boxed(&self) -> Box<dyn Factor> {
        Box::new(self.clone())
    }

    fn lower_bound(&self) -> f64 {
        self.costs
            .iter()
            .fold(f64::INFINITY, |min, cost| min.min(*cost))
    }

    fn compute_primal(&mut self) {
        if self.primal.iter().all(|label| label.is_some()) {
            return;
        }

        // pick the cheapest entry consistent with the labels fixed so far
        let strides = self.strides();
        let mut best_entry = None;
        let mut best_cost = f64::INFINITY;
        'entries: for (entry, cost) in self.costs.iter().enumerate() {
            for (position, label) in self.primal.iter().enumerate() {
                if let Some(label) = label {
                    if self.label_of(entry, position, &strides) != *label {
                        continue 'entries;
                    }
                }
            }
            if best_entry.is_none() || *cost < best_cost {
                best_entry = Some(entry);
                best_cost = *cost;
            }
        }

        let entry = best_entry.expect("fixed primal labels admit no table entry");
        let labels: Vec<usize> = (0..self.arity())
            .map(|position| self.label_of(entry, position, &strides))
            .collect();
        for (position, label) in labels.into_iter().enumerate() {
            self.primal[position] = Some(label);
        }
    }

    fn evaluate_primal(&self) -> f64 {
        match self.linear_index() {
            Some(entry) => self.costs[entry],
            None => f64::INFINITY,
        }
    }

    fn init_primal(&mut self) {
        for label in self.primal.iter_mut() {
            *label = None;
        }
    }

    fn serialize_dual(&mut self, archive: &mut DualArchive) {
        archive.slice(&mut self.costs);
    }

    fn serialize_primal(&mut self, archive: &mut PrimalArchive) {
        for label in self.primal.iter_mut() {
            archive.label(label);
        }
    }

    fn divide(&mut self, value: f64) {
        assert!(value > 0.);
        for cost in self.costs.iter_mut() {
            *cost /= value;
        }
    }

    fn subgradient(&self, weights: &mut [f64], sign: f64) {
        if let Some(entry) = self.linear_index() {
            weights[entry] += sign;
        }
    }

    fn dot_product(&self, weights: &[f64]) -> f64 {
        match self.linear_index() {
            Some(entry) => weights[entry],
            None => 0.,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairwise_example() -> DenseFactor {
        // variables of sizes 2 and 3; entry (a, b) has cost 3a + b
        DenseFactor::new(vec![2, 3], vec![0., 1., 2., 3., 4., 5.])
    }

    #[test]
    fn min_marginals_per_variable() {
        let factor = pairwise_example();
        assert_eq!(factor.min_marginals(0), vec![0., 3.]);
        assert_eq!(factor.min_marginals(1), vec![0., 1., 2.]);
    }

    #[test]
    fn restricted_min_marginals_honor_labels() {
        let mut factor = pairwise_example();
        factor.set_primal(0, 1);
        assert_eq!(factor.min_marginals_restricted(1), vec![3., 4., 5.]);
        // the restricted marginal of the labeled variable keeps only its label
        let own = factor.min_marginals_restricted(0);
        assert_eq!(own[1], 3.);
        assert!(own[0].is_infinite());
    }

    #[test]
    fn reparam_shifts_matching_entries() {
        let mut factor = pairwise_example();
        factor.reparam(0, &[10., 20.], 1.);
        assert_eq!(factor.costs(), &[10., 11., 12., 23., 24., 25.]);
        factor.reparam(1, &[1., 0., 0.], -1.);
        assert_eq!(factor.costs(), &[9., 11., 12., 22., 24., 25.]);
    }

    #[test]
    fn compute_primal_keeps_fixed_labels() {
        let mut factor = pairwise_example();
        factor.set_primal(0, 1);
        factor.compute_primal();
        assert_eq!(factor.primal_at(0), Some(1));
        assert_eq!(factor.primal_at(1), Some(0));
        assert_eq!(factor.evaluate_primal(), 3.);
    }

    #[test]
    fn evaluate_primal_incomplete_is_infinite() {
        let mut factor = pairwise_example();
        assert!(factor.evaluate_primal().is_infinite());
        factor.set_primal(0, 0);
        assert!(factor.evaluate_primal().is_infinite());
    }

    #[test]
    fn subgradient_and_dot_product_use_dual_layout() {
        let mut factor = pairwise_example();
        factor.set_primal(0, 1);
        factor.set_primal(1, 2);
        let mut weights = vec![0.; 6];
        factor.subgradient(&mut weights, -1.);
        assert_eq!(weights, vec![0., 0., 0., 0., 0., -1.]);
        assert_eq!(factor.dot_product(&[0., 0., 0., 0., 0., 7.]), 7.);
    }

    #[test]
    fn dual_size_matches_table() {
        let mut factor = pairwise_example();
        assert_eq!(factor.dual_size(), 6);
    }
}
