//! Loss functions used by the masked Q-learning update.

pub mod functions;

pub use functions::HuberLoss;
