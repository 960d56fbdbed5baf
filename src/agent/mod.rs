//! # Agents
//!
//! The hierarchy is three layers of the same DQN machinery:
//!
//! - [`DqnCore`]: online/target model pair, masked Huber loss, target updates
//! - [`ControlAgent`]: a DQN over a discretised control grid, one per maneuver
//! - [`HierarchicalAgent`]: the upper DQN choosing a maneuver and delegating to the
//!   matching sub-agent
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use hdqn::builders::HierarchyBuilder;
//! use hdqn::config::HrlConfig;
//! use hdqn::optimizer::{Adam, OptimizerWrapper};
//!
//! let config = HrlConfig::default();
//! let mut agent = HierarchyBuilder::new(config)
//!     .optimizer(OptimizerWrapper::Adam(Adam::default()))
//!     .build()
//!     .unwrap();
//! assert!(agent.is_compiled());
//! agent.set_training(false);
//! ```

pub mod control;
pub mod core;
pub mod hierarchical;
pub mod persistence;
pub mod targets;

pub use self::control::{ControlAgent, ControlGrid, SubAgent};
pub use self::core::{BatchMetrics, DqnCore};
pub use self::hierarchical::{FitHooks, HierarchicalAgent};
pub use self::targets::TargetModelUpdate;
