//! Shared value types: maneuvers, hierarchical actions, the step clock and the
//! cancellation token used by the training loop.

use std::fmt;
use std::ops::{Index, IndexMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ndarray::Array1;
use serde::{Serialize, Deserialize};

use crate::error::{HrlError, Result};

/// One of the three high-level driving maneuvers chosen by the upper policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Maneuver {
    Left,
    Straight,
    Right,
}

impl Maneuver {
    pub const ALL: [Maneuver; 3] = [Maneuver::Left, Maneuver::Straight, Maneuver::Right];
    pub const COUNT: usize = 3;

    /// Index of the maneuver in the upper Q-vector.
    pub fn index(self) -> usize {
        match self {
            Maneuver::Left => 0,
            Maneuver::Straight => 1,
            Maneuver::Right => 2,
        }
    }

    pub fn from_index(index: usize) -> Result<Self> {
        Maneuver::ALL
            .get(index)
            .copied()
            .ok_or(HrlError::InvalidAction { action: index, max_actions: Maneuver::COUNT })
    }

    pub fn name(self) -> &'static str {
        match self {
            Maneuver::Left => "left",
            Maneuver::Straight => "straight",
            Maneuver::Right => "right",
        }
    }

    /// One-hot tag appended to the projected observation rows.
    pub fn one_hot(self) -> [f32; 3] {
        let mut tag = [0.0; 3];
        tag[self.index()] = 1.0;
        tag
    }
}

impl fmt::Display for Maneuver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fixed-size mapping from each maneuver to a value, indexed by [`Maneuver`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManeuverSet<T> {
    pub left: T,
    pub straight: T,
    pub right: T,
}

impl<T> ManeuverSet<T> {
    pub fn new(left: T, straight: T, right: T) -> Self {
        ManeuverSet { left, straight, right }
    }

    pub fn from_fn<F: FnMut(Maneuver) -> T>(mut f: F) -> Self {
        ManeuverSet {
            left: f(Maneuver::Left),
            straight: f(Maneuver::Straight),
            right: f(Maneuver::Right),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Maneuver, &T)> {
        [(Maneuver::Left, &self.left), (Maneuver::Straight, &self.straight), (Maneuver::Right, &self.right)].into_iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Maneuver, &mut T)> {
        [
            (Maneuver::Left, &mut self.left),
            (Maneuver::Straight, &mut self.straight),
            (Maneuver::Right, &mut self.right),
        ]
        .into_iter()
    }

    pub fn map<U, F: FnMut(Maneuver, &T) -> U>(&self, mut f: F) -> ManeuverSet<U> {
        ManeuverSet {
            left: f(Maneuver::Left, &self.left),
            straight: f(Maneuver::Straight, &self.straight),
            right: f(Maneuver::Right, &self.right),
        }
    }
}

impl<T> Index<Maneuver> for ManeuverSet<T> {
    type Output = T;

    fn index(&self, maneuver: Maneuver) -> &T {
        match maneuver {
            Maneuver::Left => &self.left,
            Maneuver::Straight => &self.straight,
            Maneuver::Right => &self.right,
        }
    }
}

impl<T> IndexMut<Maneuver> for ManeuverSet<T> {
    fn index_mut(&mut self, maneuver: Maneuver) -> &mut T {
        match maneuver {
            Maneuver::Left => &mut self.left,
            Maneuver::Straight => &mut self.straight,
            Maneuver::Right => &mut self.right,
        }
    }
}

/// Output of the hierarchical agent: the chosen maneuver plus the continuous control
/// produced by that maneuver's sub-agent (e.g. `[goal_delta_x, acceleration]`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HierarchicalAction {
    pub maneuver: Maneuver,
    pub control: Array1<f32>,
}

impl HierarchicalAction {
    pub fn new(maneuver: Maneuver, control: Array1<f32>) -> Self {
        HierarchicalAction { maneuver, control }
    }

    /// Flat `[maneuver_index, control...]` encoding.
    pub fn to_vec(&self) -> Vec<f32> {
        std::iter::once(self.maneuver.index() as f32)
            .chain(self.control.iter().copied())
            .collect()
    }
}

/// Single step counter shared by the upper agent and all sub-agents.
///
/// Owned by the coordinator; sub-agents only ever read it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepClock {
    step: u64,
}

impl StepClock {
    pub fn new() -> Self {
        StepClock { step: 0 }
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn tick(&mut self) {
        self.step += 1;
    }

    pub fn reset(&mut self) {
        self.step = 0;
    }
}

/// Cooperative cancellation flag checked by the training loop between steps.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_maneuver_index_round_trip() {
        for m in Maneuver::ALL {
            assert_eq!(Maneuver::from_index(m.index()).unwrap(), m);
        }
        assert!(matches!(
            Maneuver::from_index(3),
            Err(HrlError::InvalidAction { action: 3, max_actions: 3 })
        ));
    }

    #[test]
    fn test_one_hot() {
        assert_eq!(Maneuver::Left.one_hot(), [1.0, 0.0, 0.0]);
        assert_eq!(Maneuver::Straight.one_hot(), [0.0, 1.0, 0.0]);
        assert_eq!(Maneuver::Right.one_hot(), [0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_maneuver_set_indexing() {
        let mut set = ManeuverSet::new(1, 2, 3);
        set[Maneuver::Right] += 10;
        assert_eq!(set[Maneuver::Right], 13);
        let names: Vec<_> = set.iter().map(|(m, _)| m.name()).collect();
        assert_eq!(names, vec!["left", "straight", "right"]);
    }

    #[test]
    fn test_action_encoding() {
        let action = HierarchicalAction::new(Maneuver::Right, array![0.5, -1.0]);
        assert_eq!(action.to_vec(), vec![2.0, 0.5, -1.0]);
    }

    #[test]
    fn test_clock_and_token() {
        let mut clock = StepClock::new();
        clock.tick();
        clock.tick();
        assert_eq!(clock.step(), 2);
        clock.reset();
        assert_eq!(clock.step(), 0);

        let token = CancellationToken::new();
        let shared = token.clone();
        shared.cancel();
        assert!(token.is_cancelled());
    }
}
