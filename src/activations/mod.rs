//! # Activation Functions
//!
//! Element-wise non-linearities used by the dense layers of the Q-value models.
//! Hidden layers default to ReLU; the output layer of a Q network is always
//! linear so that Q-values are unbounded.

pub mod functions;

pub use functions::Activation;
