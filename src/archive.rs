#![allow(dead_code)]

// Archives implement a uniform visitor over a factor's dual or primal state.
// A factor serializes its state in a fixed order; the archive mode decides
// whether the visit counts entries, saves them, restores them, or adds a
// scaled weight vector into them. The visit order must not depend on the
// mode, so that a buffer produced by `Save` can be consumed by `Load`.

/// Visitor over the dual state (a packed sequence of f64 entries).
pub enum DualArchive {
    /// Counts visited entries without touching them.
    Size(usize),
    /// Appends every visited entry to the buffer.
    Save(Vec<f64>),
    /// Overwrites every visited entry from the buffer.
    Load { data: Vec<f64>, cursor: usize },
    /// Adds `scale * weights[i]` to the i-th visited entry.
    ScaledAdd {
        weights: Vec<f64>,
        scale: f64,
        cursor: usize,
    },
}

impl DualArchive {
    pub fn size() -> Self {
        DualArchive::Size(0)
    }

    pub fn save() -> Self {
        DualArchive::Save(Vec::new())
    }

    pub fn load(data: Vec<f64>) -> Self {
        DualArchive::Load { data, cursor: 0 }
    }

    pub fn scaled_add(weights: Vec<f64>, scale: f64) -> Self {
        DualArchive::ScaledAdd {
            weights,
            scale,
            cursor: 0,
        }
    }

    // Visits a single dual entry
    pub fn entry(&mut self, value: &mut f64) {
        match self {
            DualArchive::Size(count) => *count += 1,
            DualArchive::Save(buffer) => buffer.push(*value),
            DualArchive::Load { data, cursor } => {
                *value = data[*cursor];
                *cursor += 1;
            }
            DualArchive::ScaledAdd {
                weights,
                scale,
                cursor,
            } => {
                *value += *scale * weights[*cursor];
                *cursor += 1;
            }
        }
    }

    // Visits a contiguous run of dual entries
    pub fn slice(&mut self, values: &mut [f64]) {
        for value in values.iter_mut() {
            self.entry(value);
        }
    }

    // Number of entries visited (Size mode) or stored (Save mode)
    pub fn count(&self) -> usize {
        match self {
            DualArchive::Size(count) => *count,
            DualArchive::Save(buffer) => buffer.len(),
            DualArchive::Load { data, .. } => data.len(),
            DualArchive::ScaledAdd { weights, .. } => weights.len(),
        }
    }

    pub fn into_data(self) -> Vec<f64> {
        match self {
            DualArchive::Save(buffer) => buffer,
            DualArchive::Load { data, .. } => data,
            DualArchive::ScaledAdd { weights, .. } => weights,
            DualArchive::Size(_) => Vec::new(),
        }
    }
}

// Reserved word encoding an unlabeled primal entry
const UNLABELED: u64 = u64::MAX;

/// Visitor over the primal state (a packed sequence of label words).
pub enum PrimalArchive {
    Size(usize),
    Save(Vec<u64>),
    Load { data: Vec<u64>, cursor: usize },
}

impl PrimalArchive {
    pub fn size() -> Self {
        PrimalArchive::Size(0)
    }

    pub fn save() -> Self {
        PrimalArchive::Save(Vec::new())
    }

    pub fn load(data: Vec<u64>) -> Self {
        PrimalArchive::Load { data, cursor: 0 }
    }

    // Visits a single optional label
    pub fn label(&mut self, value: &mut Option<usize>) {
        match self {
            PrimalArchive::Size(count) => *count += 1,
            PrimalArchive::Save(buffer) => buffer.push(match value {
                Some(label) => *label as u64,
                None => UNLABELED,
            }),
            PrimalArchive::Load { data, cursor } => {
                let word = data[*cursor];
                *cursor += 1;
                *value = match word {
                    UNLABELED => None,
                    label => Some(label as usize),
                };
            }
        }
    }

    pub fn count(&self) -> usize {
        match self {
            PrimalArchive::Size(count) => *count,
            PrimalArchive::Save(buffer) => buffer.len(),
            PrimalArchive::Load { data, .. } => data.len(),
        }
    }

    pub fn into_data(self) -> Vec<u64> {
        match self {
            PrimalArchive::Save(buffer) => buffer,
            PrimalArchive::Load { data, .. } => data,
            PrimalArchive::Size(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dual_save_load_roundtrip() {
        let mut state = vec![1.5, -2., 0.];

        let mut save = DualArchive::save();
        save.slice(&mut state);
        let buffer = save.into_data();
        assert_eq!(buffer, vec![1.5, -2., 0.]);

        state = vec![0.; 3];
        let mut load = DualArchive::load(buffer);
        load.slice(&mut state);
        assert_eq!(state, vec![1.5, -2., 0.]);
    }

    #[test]
    fn dual_size_counts_layout() {
        let mut state = vec![0.; 5];
        let mut size = DualArchive::size();
        size.slice(&mut state);
        assert_eq!(size.count(), 5);
    }

    #[test]
    fn dual_scaled_add() {
        let mut state = vec![1., 2., 3.];
        let mut archive = DualArchive::scaled_add(vec![1., 0., -1.], 2.);
        archive.slice(&mut state);
        assert_eq!(state, vec![3., 2., 1.]);
    }

    #[test]
    fn primal_roundtrip_preserves_unlabeled() {
        let mut labels = vec![Some(3), None, Some(0)];

        let mut save = PrimalArchive::save();
        for label in labels.iter_mut() {
            save.label(label);
        }
        let buffer = save.into_data();

        labels = vec![None; 3];
        let mut load = PrimalArchive::load(buffer);
        for label in labels.iter_mut() {
            load.label(label);
        }
        assert_eq!(labels, vec![Some(3), None, Some(0)]);
    }
}
