//! Maneuver-specific feature projection.
//!
//! The raw observation is a `(timesteps, base_width)` matrix. Each sub-agent sees a fixed
//! selection of its columns followed by a one-hot maneuver tag. With the default layout:
//!
//! | maneuver | columns | width |
//! |---|---|---|
//! | left | `[0:30] ++ [-8:] ++ (1,0,0)` | 41 |
//! | straight | `[0:56] ++ (0,1,0)` | 59 |
//! | right | `[18:56] ++ (0,0,1)` | 41 |
//!
//! The same projection is used when acting and when storing experience, so a sub-agent's
//! memory only ever holds rows of its own width.

use std::ops::Range;

use ndarray::{concatenate, Array2, ArrayView2, Axis, s};
use serde::{Serialize, Deserialize};

use crate::error::{HrlError, Result};
use crate::types::{Maneuver, ManeuverSet};

/// Half-open column range. Negative bounds count from the end of the row; `end: None`
/// runs to the last column.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColumnSlice {
    pub start: i64,
    pub end: Option<i64>,
}

impl ColumnSlice {
    pub fn new(start: i64, end: Option<i64>) -> Self {
        ColumnSlice { start, end }
    }

    fn resolve(&self, width: usize) -> Result<Range<usize>> {
        let w = width as i64;
        let absolute = |bound: i64| if bound < 0 { w + bound } else { bound };
        let start = absolute(self.start);
        let end = self.end.map(absolute).unwrap_or(w);
        if start < 0 || end > w || start >= end {
            return Err(HrlError::invalid_parameter(
                "layout".to_string(),
                format!("slice {:?} is empty or out of range for {} columns", self, width),
            ));
        }
        Ok(start as usize..end as usize)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ObservationLayout {
    /// Columns of the raw observation.
    pub base_width: usize,
    /// Rows of the raw observation.
    pub timesteps: usize,
    pub slices: ManeuverSet<Vec<ColumnSlice>>,
}

impl Default for ObservationLayout {
    fn default() -> Self {
        ObservationLayout {
            base_width: 56,
            timesteps: 10,
            slices: ManeuverSet::new(
                vec![ColumnSlice::new(0, Some(30)), ColumnSlice::new(-8, None)],
                vec![ColumnSlice::new(0, None)],
                vec![ColumnSlice::new(18, None)],
            ),
        }
    }
}

/// Projects raw observations into the input space of each sub-agent.
#[derive(Clone, Debug)]
pub struct ManeuverRouter {
    layout: ObservationLayout,
    ranges: ManeuverSet<Vec<Range<usize>>>,
}

impl ManeuverRouter {
    pub fn new(layout: ObservationLayout) -> Result<Self> {
        let mut ranges = ManeuverSet::new(Vec::new(), Vec::new(), Vec::new());
        for (maneuver, slices) in layout.slices.iter() {
            if slices.is_empty() {
                return Err(HrlError::invalid_parameter(
                    "layout".to_string(),
                    format!("no columns selected for maneuver '{}'", maneuver),
                ));
            }
            ranges[maneuver] = slices
                .iter()
                .map(|slice| slice.resolve(layout.base_width))
                .collect::<Result<Vec<_>>>()?;
        }
        Ok(ManeuverRouter { layout, ranges })
    }

    pub fn layout(&self) -> &ObservationLayout {
        &self.layout
    }

    pub fn base_width(&self) -> usize {
        self.layout.base_width
    }

    /// Width of the projected observation for `maneuver`, one-hot tag included.
    pub fn width(&self, maneuver: Maneuver) -> usize {
        self.ranges[maneuver].iter().map(|r| r.len()).sum::<usize>() + Maneuver::COUNT
    }

    /// Select the maneuver's columns and append its one-hot tag to every row.
    pub fn project(&self, maneuver: Maneuver, observation: ArrayView2<f32>) -> Result<Array2<f32>> {
        if observation.ncols() != self.layout.base_width {
            return Err(HrlError::dimension_mismatch(
                format!("{} observation columns", self.layout.base_width),
                format!("{} observation columns", observation.ncols()),
            ));
        }

        let rows = observation.nrows();
        let tag = Array2::from_shape_fn((rows, Maneuver::COUNT), |(_, j)| maneuver.one_hot()[j]);
        let mut parts: Vec<ArrayView2<f32>> = self.ranges[maneuver]
            .iter()
            .map(|r| observation.slice(s![.., r.clone()]))
            .collect();
        parts.push(tag.view());

        let projected = concatenate(Axis(1), &parts)
            .map_err(|e| HrlError::Training(format!("projection failed: {}", e)))?;
        if projected.ncols() != self.width(maneuver) {
            return Err(HrlError::dimension_mismatch(
                format!("{} projected columns", self.width(maneuver)),
                format!("{} projected columns", projected.ncols()),
            ));
        }
        Ok(projected)
    }
}
