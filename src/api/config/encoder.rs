// Copyright (c) 2020-2025, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use arg_enum_proc_macro::ArgEnum;
use itertools::*;
use num_derive::*;

use crate::api::Rational;
use crate::serialize::{Deserialize, Serialize};
use v_frame::pixel::ChromaSampling;

use std::fmt;

/// Deepest supported temporal hierarchy, mini-GOPs of 32 pictures.
pub const MAX_HIERARCHICAL_LEVELS: u8 = 5;
/// Upper bound on the size of each reference list.
pub const MAX_REFERENCES: usize = 4;
// Leaves room for the auto intra period math.
pub(crate) const MAX_INTRA_PERIOD: i64 = i32::MAX as i64;

/// Order in which a mini-GOP is coded and what its pictures may reference.
#[derive(
  ArgEnum,
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  FromPrimitive,
  Serialize,
  Deserialize,
)]
#[repr(C)]
pub enum PredStructure {
  /// Display order coding, list0 only.
  #[arg_enum(alias = "ldp")]
  LowDelayP,
  /// Display order coding, list1 mirrors list0.
  #[arg_enum(alias = "ldb")]
  LowDelayB,
  /// Hierarchical B-pyramid with future references.
  #[arg_enum(alias = "ra")]
  RandomAccess,
}

impl Default for PredStructure {
  fn default() -> Self {
    PredStructure::RandomAccess
  }
}

impl PredStructure {
  /// Whether pictures leave the encoder in display order.
  pub const fn is_low_delay(self) -> bool {
    !matches!(self, PredStructure::RandomAccess)
  }
}

/// Kind of periodic intra refresh.
#[derive(
  ArgEnum,
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  FromPrimitive,
  Serialize,
  Deserialize,
)]
#[repr(C)]
pub enum IntraRefresh {
  /// IDR pictures, every older reference is dropped.
  Closed,
  /// Intra pictures that keep the older references usable.
  Open,
}

impl Default for IntraRefresh {
  fn default() -> Self {
    IntraRefresh::Closed
  }
}

/// Encoder settings which impact the scheduling decisions.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "serialize", serde(default))]
pub struct EncoderConfig {
  // input format
  /// Width of the pictures in pixels.
  pub width: usize,
  /// Height of the pictures in pixels.
  pub height: usize,
  /// Video time base.
  pub time_base: Rational,
  /// Bit depth.
  pub bit_depth: usize,
  /// Chroma subsampling.
  pub chroma_sampling: ChromaSampling,

  // prediction structure
  /// Pictures between two intra refreshes.
  ///
  /// `-1` only codes the leading IDR, `-2` derives the period from the
  /// frame rate and `0` codes every picture as intra.
  pub intra_period: i64,
  /// Kind of the periodic intra refreshes.
  pub intra_refresh: IntraRefresh,
  /// Prediction structure of the mini-GOPs.
  pub pred_structure: PredStructure,
  /// Depth of the temporal hierarchy, a mini-GOP holds `2^levels` pictures.
  pub hierarchical_levels: u8,
  /// Code the base layer as P pictures instead of generalized B.
  pub base_layer_switch_mode: bool,
  /// Maximum number of pictures in each reference list.
  pub reference_count: usize,
}

/// Default preset for EncoderConfig: it is a balance between latency and
/// coding efficiency. See [`with_speed_preset()`].
///
/// [`with_speed_preset()`]: struct.EncoderConfig.html#method.with_speed_preset
impl Default for EncoderConfig {
  fn default() -> Self {
    const DEFAULT_SPEED: usize = 6;
    Self::with_speed_preset(DEFAULT_SPEED)
  }
}

impl EncoderConfig {
  /// This is a preset which provides default settings according to a speed
  /// value in the specific range 0-10. Slower presets use deeper
  /// hierarchies and more references. If the input value is greater than
  /// 10, it will result in the same settings as 10.
  pub fn with_speed_preset(speed: usize) -> Self {
    let (hierarchical_levels, reference_count) = match speed {
      0..=1 => (5, 4),
      2..=3 => (4, 3),
      4..=7 => (3, 2),
      8..=9 => (2, 2),
      _ => (2, 1),
    };

    EncoderConfig {
      width: 640,
      height: 480,
      time_base: Rational { num: 1, den: 30 },
      bit_depth: 8,
      chroma_sampling: ChromaSampling::Cs420,

      intra_period: -2,
      intra_refresh: IntraRefresh::Closed,
      pred_structure: PredStructure::RandomAccess,
      hierarchical_levels,
      base_layer_switch_mode: false,
      reference_count,
    }
  }

  /// Display order coding for conversational use.
  pub fn low_latency(mut self, b_pictures: bool) -> Self {
    self.pred_structure = if b_pictures {
      PredStructure::LowDelayB
    } else {
      PredStructure::LowDelayP
    };
    self
  }

  /// Returns the video frame rate computed from [`time_base`].
  ///
  /// [`time_base`]: #structfield.time_base
  pub fn frame_rate(&self) -> f64 {
    Rational::from_reciprocal(self.time_base).as_f64()
  }

  /// Number of pictures in a full mini-GOP.
  #[inline]
  pub const fn mini_gop_size(&self) -> usize {
    1 << self.hierarchical_levels
  }

  /// Pictures between two periodic intra refreshes, `None` when only the
  /// first picture is intra.
  pub fn intra_interval(&self) -> Option<u64> {
    match self.intra_period {
      -1 => None,
      -2 => {
        let n = self.mini_gop_size() as u64;
        let fps = self.frame_rate().round().max(1.) as u64;
        Some(((fps + n) / n) * n - 1)
      }
      p if p >= 0 => Some(p as u64),
      _ => None,
    }
  }

  /// Bounds of the queues and tables sized from this configuration.
  pub(crate) fn limits(&self) -> Limits {
    let mini_gop = self.mini_gop_size();
    let reference_table = (mini_gop + 1) * (self.reference_count + 1);
    Limits {
      mini_gop,
      backlog: 2 * mini_gop,
      reference_table,
      pool: reference_table + mini_gop,
    }
  }
}

/// Capacities derived from the encoder configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Limits {
  /// Reorder queue slots.
  pub mini_gop: usize,
  /// Pictures accepted but not yet handed out, in either order.
  pub backlog: usize,
  pub reference_table: usize,
  pub pool: usize,
}

impl fmt::Display for EncoderConfig {
  fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
    let pairs = [
      ("pred_structure", self.pred_structure.to_string()),
      ("hierarchical_levels", self.hierarchical_levels.to_string()),
      ("intra_period", self.intra_period.to_string()),
      ("intra_refresh", self.intra_refresh.to_string()),
      ("reference_count", self.reference_count.to_string()),
      ("base_layer_switch_mode", self.base_layer_switch_mode.to_string()),
    ];
    write!(
      f,
      "{}",
      pairs.iter().map(|pair| format!("{}={}", pair.0, pair.1)).join(" ")
    )
  }
}
