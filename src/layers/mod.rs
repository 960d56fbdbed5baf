//! Dense building blocks for the Q-value models.

pub mod dense;

pub use dense::DenseLayer;
