pub mod data_structures {
    pub mod jagged_arrays;
}

pub mod archive;

pub mod factors {
    pub mod dense_factor;
    pub mod factor_trait;
}

pub mod messages {
    pub mod coupling_message;
    pub mod message_trait;
}

pub mod lp {
    pub mod factor_container;
    pub mod message_container;
    pub mod omega;
    pub mod scheduler;
    pub mod solver;
    pub mod visitor;
}

pub mod decomposition {
    pub mod lagrangean;
    pub mod optimizer;
    pub mod tree;
}

pub mod combilp;

/// Index of a factor container inside the scheduler's factor store.
pub type FactorId = usize;

/// Index of a message container inside the scheduler's message store.
pub type MessageId = usize;

// Which endpoint of a message a statement refers to. A message always runs
// from its left factor to its right factor; in tree context the chirality
// names the root-ward endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Chirality {
    Left,
    Right,
}

/// Tolerance used in lower-bound comparisons throughout the crate.
pub const EPS: f64 = 1e-8;
