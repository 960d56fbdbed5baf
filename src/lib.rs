//! # hdqn - Hierarchical Deep Q-Learning for Lane-Change Driving
//!
//! An upper DQN chooses one of three maneuvers (left, straight, right) from the full
//! observation. Each maneuver owns a low-level DQN that sees a maneuver-specific projection
//! of the observation and picks a continuous control from a discretised grid. All four
//! agents share one step clock and are trained together by [`HierarchicalAgent::fit`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hdqn::builders::HierarchyBuilder;
//! use hdqn::config::{FitOptions, HrlConfig};
//! use hdqn::optimizer::{Adam, OptimizerWrapper};
//! # use hdqn::environment::{EnvStep, Environment};
//! # use hdqn::types::HierarchicalAction;
//! # use ndarray::Array2;
//! # struct Road;
//! # impl Environment for Road {
//! #     fn reset(&mut self, _: &[f32]) -> hdqn::Result<Array2<f32>> { Ok(Array2::zeros((10, 56))) }
//! #     fn step(&mut self, _: &HierarchicalAction) -> hdqn::Result<EnvStep> {
//! #         Ok(EnvStep::new(Array2::zeros((10, 56)), 0.0, false))
//! #     }
//! #     fn encoded_observation(&self) -> Array2<f32> { Array2::zeros((10, 56)) }
//! # }
//!
//! let config = HrlConfig::from_json_file("hrl.json").unwrap_or_default();
//! let mut agent = HierarchyBuilder::new(config)
//!     .optimizer(OptimizerWrapper::Adam(Adam::default()))
//!     .build()?;
//!
//! let mut env = Road;
//! let history = agent.fit(&mut env, &FitOptions::default(), Default::default())?;
//! agent.save_weights("runs/agent.bin")?;
//! println!("trained {} episodes", history.episodes());
//! # Ok::<(), hdqn::HrlError>(())
//! ```
//!
//! ## Module Organization
//!
//! - [`agent`] - DQN core, the maneuver sub-agents and the hierarchical coordinator
//! - [`builders`] - Building a full hierarchy from configuration
//! - [`callbacks`] - Training/test hooks, loggers and the episode history
//! - [`config`] - Serde configuration for agents and runs
//! - [`environment`] - Environment seam and episode start sampling
//! - [`memory`] - Windowed sequential replay memory
//! - [`model`] - Q-networks (plain and dueling) on top of [`network`]
//! - [`policy`] - Action selection from Q-values
//! - [`processor`] - Observation whitening and control scaling
//! - [`routing`] - Maneuver-specific observation projection

pub mod activations;
pub mod agent;
pub mod builders;
pub mod callbacks;
pub mod config;
pub mod environment;
pub mod error;
pub mod layers;
pub mod loss;
pub mod memory;
pub mod model;
pub mod network;
pub mod optimizer;
pub mod policy;
pub mod processor;
pub mod routing;
pub mod types;

#[cfg(test)]
mod tests;

pub use agent::{ControlAgent, HierarchicalAgent, SubAgent};
pub use error::{HrlError, Result};
pub use types::{HierarchicalAction, Maneuver, ManeuverSet};
