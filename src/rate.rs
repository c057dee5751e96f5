// Copyright (c) 2019-2025, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use crate::api::{
  EncoderConfig, RateControlConfig, RateControlError, RateControlMode,
  SchedulerError, MAX_QP,
};
use crate::decision::PictureDescriptor;
use crate::serialize::{Deserialize, Serialize};

use std::collections::BTreeMap;
use std::str::FromStr;

// Share of an inter picture's budget given to an intra picture.
const INTRA_BOOST: f64 = 4.0;

// Quantizer steps below the base quantizer for intra pictures.
const INTRA_QP_OFFSET: f64 = 3.0;

// Largest correction the feedback law may apply on top of the base
//  quantizer, in quantizer steps.
const MAX_STEP: f64 = 12.0;

// Feedback gains, in quantizer steps per unit of relative error.
// The rate term reacts to the running overshoot of the whole stream, the VBV
//  term to how far the buffer drifted from half full.
const CBR_GAINS: (f64, f64) = (6.0, 12.0);
const VBR_GAINS: (f64, f64) = (4.0, 4.0);

/// Identifies a rate control interval: one temporal layer of one mini-GOP,
/// or the intra picture leading it.
#[derive(
  Clone,
  Copy,
  Debug,
  Default,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Hash,
  Serialize,
  Deserialize,
)]
pub struct IntervalKey {
  /// Mini-GOP index.
  pub mini_gop: u64,
  /// Temporal layer.
  pub temporal_layer: u8,
  /// Interval of an intra picture.
  pub intra: bool,
}

/// Bit budget shared by the pictures of one interval.
#[derive(Clone, Debug, PartialEq)]
pub struct RateControlInterval {
  key: IntervalKey,
  // Pictures expected to report into this interval.
  count: usize,
  // Bits allotted to the whole interval.
  budget: f64,
  // Bits reported so far.
  consumed: u64,
  reported: usize,
  min_qp: u8,
  max_qp: u8,
  // VBV occupancy when the interval opened.
  vbv_snapshot: i64,
}

impl RateControlInterval {
  /// The interval key.
  pub const fn key(&self) -> IntervalKey {
    self.key
  }

  /// Pictures expected in the interval.
  pub const fn count(&self) -> usize {
    self.count
  }

  /// Bits allotted to the interval.
  pub fn budget_bits(&self) -> f64 {
    self.budget
  }

  /// Bits allotted to each of its pictures.
  pub fn picture_budget_bits(&self) -> f64 {
    self.budget / self.count.max(1) as f64
  }

  /// Bits reported so far.
  pub const fn consumed_bits(&self) -> u64 {
    self.consumed
  }

  /// Pictures reported so far.
  pub const fn reported(&self) -> usize {
    self.reported
  }

  /// Quantizer bounds of the interval.
  pub const fn qp_bounds(&self) -> (u8, u8) {
    (self.min_qp, self.max_qp)
  }

  /// VBV occupancy when the interval opened, in bits.
  pub const fn vbv_snapshot(&self) -> i64 {
    self.vbv_snapshot
  }
}

/// Picks the quantizer of every picture and tracks the produced bits.
pub struct RateControlCoordinator {
  mode: RateControlMode,
  // Constant quantizer, or the starting point of the feedback law.
  qp: u8,
  min_qp: u8,
  max_qp: u8,
  use_qp_file: bool,
  // Depth of the temporal hierarchy.
  levels: u8,
  // The target average bits per picture.
  bits_per_picture: f64,
  // Weight normaliser so that a full mini-GOP spends its share on average.
  layer_norm: f64,
  // Bits entering the VBV per picture.
  vbv_fill: f64,
  // Fraction of a bit not yet credited to the VBV.
  vbv_carry: f64,
  vbv_size: i64,
  vbv_initial: i64,
  // Current VBV occupancy in bits.
  vbv_occupancy: i64,
  // Stream totals, used by the rate term of the feedback law.
  consumed: u64,
  expected: f64,
  intervals: BTreeMap<IntervalKey, RateControlInterval>,
  opened: u64,
  closed: u64,
}

impl RateControlCoordinator {
  /// Sets up rate control for a stream.
  pub fn new(enc: &EncoderConfig, rc: &RateControlConfig) -> Self {
    let frame_rate = enc.frame_rate();
    let bits_per_picture = rc.target_bit_rate as f64 / frame_rate;
    let levels = enc.hierarchical_levels;
    let full = (1u64 << levels) as f64;
    let raw_total = full
      + if levels > 0 {
        levels as f64 * (1u64 << (levels - 1)) as f64
      } else {
        0.
      };
    let vbv_size = rc.vbv_size() as i64;
    let vbv_initial = vbv_size / 2;

    RateControlCoordinator {
      mode: rc.rate_control_mode,
      qp: rc.qp,
      min_qp: rc.min_qp_allowed,
      max_qp: rc.max_qp_allowed,
      use_qp_file: rc.use_qp_file,
      levels,
      bits_per_picture,
      layer_norm: full / raw_total,
      vbv_fill: rc.vbv_rate() as f64 / frame_rate,
      vbv_carry: 0.,
      vbv_size,
      vbv_initial,
      vbv_occupancy: vbv_initial,
      consumed: 0,
      expected: 0.,
      intervals: BTreeMap::new(),
      opened: 0,
      closed: 0,
    }
  }

  /// The target average bits per picture.
  pub fn bits_per_picture(&self) -> f64 {
    self.bits_per_picture
  }

  /// Current VBV occupancy in bits.
  pub const fn vbv_occupancy(&self) -> i64 {
    self.vbv_occupancy
  }

  /// The open interval for `key`, if any.
  pub fn interval(&self, key: &IntervalKey) -> Option<&RateControlInterval> {
    self.intervals.get(key)
  }

  /// Number of intervals still open.
  pub fn open_intervals(&self) -> usize {
    self.intervals.len()
  }

  /// Intervals opened and closed over the stream.
  pub const fn interval_counts(&self) -> (u64, u64) {
    (self.opened, self.closed)
  }

  /// Share of the per-picture budget given to a picture of this interval.
  pub fn weight(&self, key: &IntervalKey) -> f64 {
    if key.intra {
      INTRA_BOOST
    } else {
      let depth = self.levels.saturating_sub(key.temporal_layer);
      (1u64 << depth) as f64 * self.layer_norm
    }
  }

  /// Opens the interval of `key` for `picture_count` pictures.
  ///
  /// Opening an interval that is already open keeps the first one.
  pub fn open_interval(&mut self, key: IntervalKey, picture_count: usize) {
    if self.intervals.contains_key(&key) {
      return;
    }
    let count = picture_count.max(1);
    let budget = count as f64 * self.bits_per_picture * self.weight(&key);
    log::debug!(
      "opened rate control interval {:?} for {} pictures, {:.0} bits",
      key,
      count,
      budget
    );
    self.intervals.insert(
      key,
      RateControlInterval {
        key,
        count,
        budget,
        consumed: 0,
        reported: 0,
        min_qp: self.min_qp,
        max_qp: self.max_qp,
        vbv_snapshot: self.vbv_occupancy,
      },
    );
    self.opened += 1;
  }

  /// Shrinks the interval of `key` to the `picture_count` pictures it
  /// actually holds, closing it if they all reported.
  ///
  /// Used when a refresh or the end of the stream cuts a mini-GOP short.
  /// The per-picture budget is kept.
  pub fn truncate_interval(
    &mut self, key: IntervalKey, picture_count: usize,
  ) {
    let Some(interval) = self.intervals.get_mut(&key) else { return };
    let count = picture_count.max(1);
    if count >= interval.count {
      return;
    }
    log::debug!(
      "rate control interval {:?} cut from {} to {} pictures",
      key,
      interval.count,
      count
    );
    interval.budget = interval.picture_budget_bits() * count as f64;
    interval.count = count;
    if interval.reported >= interval.count {
      self.close(&key);
    }
  }

  fn layer_offset(key: &IntervalKey) -> f64 {
    if key.intra {
      -INTRA_QP_OFFSET
    } else {
      key.temporal_layer as f64
    }
  }

  /// Chooses the quantizer of a picture.
  ///
  /// In constant quantizer mode this is the configured quantizer, or the
  /// one supplied with the picture when `use_qp_file` is set. Every mode
  /// clips to `[min_qp_allowed, max_qp_allowed]`.
  ///
  /// # Errors
  ///
  /// Returns `RateControlIntervalMissing` if the interval of the picture
  /// was never opened or is already closed.
  pub fn qp_for_picture(
    &self, d: &PictureDescriptor,
  ) -> Result<u8, SchedulerError> {
    let interval = self.intervals.get(&d.interval).ok_or(
      SchedulerError::RateControlIntervalMissing {
        mini_gop: d.interval.mini_gop,
        temporal_layer: d.interval.temporal_layer,
      },
    )?;

    let (min, max) = interval.qp_bounds();
    let (k_rate, k_vbv) = match self.mode {
      RateControlMode::ConstantQp => {
        let forced = d.qp_override.filter(|_| self.use_qp_file);
        return Ok(forced.unwrap_or(self.qp).min(max.min(MAX_QP)).max(min));
      }
      RateControlMode::Vbr => VBR_GAINS,
      RateControlMode::Cbr => CBR_GAINS,
    };

    let deviation = (self.consumed as f64 - self.expected)
      / self.expected.max(self.bits_per_picture);
    let vbv_error = (self.vbv_initial - self.vbv_occupancy) as f64
      / self.vbv_size.max(1) as f64;
    let delta =
      (k_rate * deviation + k_vbv * vbv_error).clamp(-MAX_STEP, MAX_STEP);
    let qp = self.qp as f64 + Self::layer_offset(&d.interval) + delta;

    Ok(qp.round().clamp(min as f64, max as f64) as u8)
  }

  /// Accounts for a coded picture and closes its interval once complete.
  ///
  /// # Errors
  ///
  /// Returns `RateControlIntervalMissing` if the interval of the picture is
  /// not open.
  pub fn report_encoded(
    &mut self, d: &PictureDescriptor, byte_count: usize, qp: u8,
  ) -> Result<(), SchedulerError> {
    let key = d.interval;
    let interval = self.intervals.get_mut(&key).ok_or(
      SchedulerError::RateControlIntervalMissing {
        mini_gop: key.mini_gop,
        temporal_layer: key.temporal_layer,
      },
    )?;

    let bits = byte_count as u64 * 8;
    interval.consumed += bits;
    interval.reported += 1;
    self.consumed += bits;
    self.expected += interval.picture_budget_bits();
    let fill = self.vbv_fill + self.vbv_carry;
    let credited = fill.floor();
    self.vbv_carry = fill - credited;
    self.vbv_occupancy = (self.vbv_occupancy + credited as i64 - bits as i64)
      .clamp(0, self.vbv_size);
    log::trace!(
      "picture {} reported {} bits at qp {}, vbv {}",
      d.poc,
      bits,
      qp,
      self.vbv_occupancy
    );

    if interval.reported >= interval.count {
      self.close(&key);
    }
    Ok(())
  }

  fn close(&mut self, key: &IntervalKey) {
    if let Some(interval) = self.intervals.remove(key) {
      log::debug!(
        "closed rate control interval {:?}: {} of {:.0} bits over {}/{} pictures",
        key,
        interval.consumed,
        interval.budget,
        interval.reported,
        interval.count
      );
      self.closed += 1;
    }
  }

  /// Closes the intervals a truncated mini-GOP left open.
  pub fn end_of_stream(&mut self) -> usize {
    let keys: Vec<IntervalKey> = self.intervals.keys().copied().collect();
    for key in &keys {
      self.close(key);
    }
    keys.len()
  }
}

/// Per-picture quantizers read from a text file.
///
/// One entry per line in display order. `-1` or an empty line keeps rate
/// control in charge, `#` starts a comment and lines holding only a comment
/// are skipped.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QpFile {
  qps: Vec<Option<u8>>,
}

impl QpFile {
  /// Parses the contents of a QP file.
  ///
  /// # Errors
  ///
  /// Returns an error for entries that are not quantizers.
  pub fn parse(text: &str) -> Result<Self, RateControlError> {
    let mut qps = Vec::new();
    for (i, line) in text.lines().enumerate() {
      let (entry, comment) = match line.split_once('#') {
        Some((entry, _)) => (entry.trim(), true),
        None => (line.trim(), false),
      };
      if entry.is_empty() {
        if !comment {
          qps.push(None);
        }
        continue;
      }
      let qp: i64 = entry.parse().map_err(|_| RateControlError::InvalidEntry {
        line: i + 1,
        text: entry.to_string(),
      })?;
      qps.push(match qp {
        -1 => None,
        0..=63 => Some(qp as u8),
        _ => {
          return Err(RateControlError::OutOfRange {
            line: i + 1,
            qp,
            max: MAX_QP,
          })
        }
      });
    }
    Ok(QpFile { qps })
  }

  /// The quantizer forced on picture `poc`.
  pub fn qp(&self, poc: u64) -> Option<u8> {
    self.qps.get(poc as usize).copied().flatten()
  }

  /// Number of entries.
  pub fn len(&self) -> usize {
    self.qps.len()
  }

  /// Whether the file has no entries.
  pub fn is_empty(&self) -> bool {
    self.qps.is_empty()
  }
}

impl FromStr for QpFile {
  type Err = RateControlError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    QpFile::parse(s)
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::api::{PictureType, PredStructure, Rational};
  use arrayvec::ArrayVec;

  fn descriptor(poc: u64, key: IntervalKey) -> PictureDescriptor {
    PictureDescriptor {
      id: poc,
      poc,
      pts: poc,
      picture_type: PictureType::P,
      temporal_layer: key.temporal_layer,
      structure: PredStructure::LowDelayP,
      mini_gop: key.mini_gop,
      mini_gop_position: 0,
      list0: ArrayVec::new(),
      list1: ArrayVec::new(),
      dependents: Vec::new(),
      interval: key,
      interval_len: 1,
      qp_override: None,
      ref_slots: ArrayVec::new(),
    }
  }

  fn flat_config() -> EncoderConfig {
    let mut enc = EncoderConfig::default();
    enc.hierarchical_levels = 0;
    enc.time_base = Rational::new(1, 30);
    enc
  }

  #[test]
  fn constant_qp_ignores_the_buffer() {
    let enc = flat_config();
    let rc = RateControlConfig::new().with_qp(30);
    let mut rate = RateControlCoordinator::new(&enc, &rc);
    for poc in 0..20 {
      let key = IntervalKey { mini_gop: poc, ..Default::default() };
      rate.open_interval(key, 1);
      let d = descriptor(poc, key);
      assert_eq!(rate.qp_for_picture(&d), Ok(30));
      rate.report_encoded(&d, 1 << 20, 30).unwrap();
    }
    assert_eq!(rate.open_intervals(), 0);
  }

  #[test]
  fn qp_file_overrides_constant_qp() {
    let enc = flat_config();
    let rc = RateControlConfig::new().with_qp(30).with_qp_file(true);
    let mut rate = RateControlCoordinator::new(&enc, &rc);
    let key = IntervalKey::default();
    rate.open_interval(key, 1);
    let mut d = descriptor(0, key);
    d.qp_override = Some(22);
    assert_eq!(rate.qp_for_picture(&d), Ok(22));
  }

  #[test]
  fn cbr_raises_qp_after_overshoot() {
    let enc = flat_config();
    let rc = RateControlConfig::new()
      .with_qp(30)
      .with_bitrate(RateControlMode::Cbr, 1_000_000);
    let mut rate = RateControlCoordinator::new(&enc, &rc);
    assert_eq!((rate.bits_per_picture() / 8.) as u64, 4166);

    let first = IntervalKey::default();
    rate.open_interval(first, 1);
    let initial = rate.qp_for_picture(&descriptor(0, first)).unwrap();
    assert_eq!(initial, 30);

    let budget_bytes = (rate.bits_per_picture() / 8.) as usize;
    let mut last = initial;
    for poc in 0..10 {
      let key = IntervalKey { mini_gop: poc, ..Default::default() };
      rate.open_interval(key, 1);
      let d = descriptor(poc, key);
      last = rate.qp_for_picture(&d).unwrap();
      rate.report_encoded(&d, 2 * budget_bytes, last).unwrap();
    }
    let key = IntervalKey { mini_gop: 10, ..Default::default() };
    rate.open_interval(key, 1);
    let next = rate.qp_for_picture(&descriptor(10, key)).unwrap();
    assert!(next > initial);
    assert!(next >= last);
    assert!(next <= rc.max_qp_allowed);
  }

  #[test]
  fn cbr_is_clipped_at_the_maximum() {
    let enc = flat_config();
    let rc = RateControlConfig::new()
      .with_qp(30)
      .with_qp_range(10, 34)
      .with_bitrate(RateControlMode::Cbr, 1_000_000);
    let mut rate = RateControlCoordinator::new(&enc, &rc);
    for poc in 0..30 {
      let key = IntervalKey { mini_gop: poc, ..Default::default() };
      rate.open_interval(key, 1);
      let d = descriptor(poc, key);
      let qp = rate.qp_for_picture(&d).unwrap();
      assert!(qp <= 34);
      rate.report_encoded(&d, 50_000, qp).unwrap();
    }
    let key = IntervalKey { mini_gop: 30, ..Default::default() };
    rate.open_interval(key, 1);
    assert_eq!(rate.qp_for_picture(&descriptor(30, key)), Ok(34));
  }

  #[test]
  fn vbr_lowers_qp_on_undershoot() {
    let enc = flat_config();
    let rc = RateControlConfig::new()
      .with_qp(30)
      .with_bitrate(RateControlMode::Vbr, 1_000_000);
    let mut rate = RateControlCoordinator::new(&enc, &rc);
    for poc in 0..10 {
      let key = IntervalKey { mini_gop: poc, ..Default::default() };
      rate.open_interval(key, 1);
      let d = descriptor(poc, key);
      let qp = rate.qp_for_picture(&d).unwrap();
      rate.report_encoded(&d, 100, qp).unwrap();
    }
    let key = IntervalKey { mini_gop: 10, ..Default::default() };
    rate.open_interval(key, 1);
    assert!(rate.qp_for_picture(&descriptor(10, key)).unwrap() < 30);
  }

  #[test]
  fn missing_interval() {
    let enc = flat_config();
    let rate =
      RateControlCoordinator::new(&enc, &RateControlConfig::new());
    let key = IntervalKey { mini_gop: 3, temporal_layer: 1, intra: false };
    assert_eq!(
      rate.qp_for_picture(&descriptor(0, key)),
      Err(SchedulerError::RateControlIntervalMissing {
        mini_gop: 3,
        temporal_layer: 1
      })
    );
  }

  #[test]
  fn base_layer_gets_the_largest_share() {
    let mut enc = EncoderConfig::default();
    enc.hierarchical_levels = 3;
    let rc = RateControlConfig::new()
      .with_bitrate(RateControlMode::Vbr, 2_000_000);
    let rate = RateControlCoordinator::new(&enc, &rc);
    let w = |layer| {
      rate.weight(&IntervalKey {
        mini_gop: 0,
        temporal_layer: layer,
        intra: false,
      })
    };
    assert!(w(0) > w(1) && w(1) > w(2) && w(2) > w(3));
    // one base picture and 2^(l-1) pictures per upper layer
    let total = w(0) + w(1) + 2. * w(2) + 4. * w(3);
    assert!((total - 8.).abs() < 1e-9);
  }

  #[test]
  fn intervals_close_when_complete() {
    let enc = flat_config();
    let mut rate =
      RateControlCoordinator::new(&enc, &RateControlConfig::new());
    let key = IntervalKey { mini_gop: 0, temporal_layer: 2, intra: false };
    rate.open_interval(key, 2);
    rate.report_encoded(&descriptor(1, key), 10, 32).unwrap();
    assert_eq!(rate.interval(&key).map(|i| i.reported()), Some(1));
    rate.report_encoded(&descriptor(2, key), 10, 32).unwrap();
    assert!(rate.interval(&key).is_none());

    rate.open_interval(key, 4);
    assert_eq!(rate.end_of_stream(), 1);
    assert_eq!(rate.interval_counts(), (2, 2));
  }

  #[test]
  fn constant_qp_stays_in_range() {
    let enc = flat_config();
    let rc = RateControlConfig::new()
      .with_qp(30)
      .with_qp_range(10, 40)
      .with_qp_file(true);
    let mut rate = RateControlCoordinator::new(&enc, &rc);
    let key = IntervalKey::default();
    rate.open_interval(key, 1);
    let mut d = descriptor(0, key);
    assert_eq!(rate.qp_for_picture(&d), Ok(30));
    d.qp_override = Some(5);
    assert_eq!(rate.qp_for_picture(&d), Ok(10));
    d.qp_override = Some(50);
    assert_eq!(rate.qp_for_picture(&d), Ok(40));
  }

  #[test]
  fn vbv_keeps_fractional_bits() {
    let enc = flat_config();
    let rc = RateControlConfig::new()
      .with_bitrate(RateControlMode::Cbr, 1_000_000)
      .with_vbv(1_000_000, 10_000_000);
    let mut rate = RateControlCoordinator::new(&enc, &rc);
    let initial = rate.vbv_occupancy();
    // 33328 bits out against 33333.3 in, per picture
    for poc in 0..90 {
      let key = IntervalKey { mini_gop: poc, ..Default::default() };
      rate.open_interval(key, 1);
      rate.report_encoded(&descriptor(poc, key), 4166, 30).unwrap();
    }
    let drift = rate.vbv_occupancy() - initial;
    assert!((drift - 480).abs() <= 1, "occupancy moved by {}", drift);
  }

  #[test]
  fn truncated_intervals_close() {
    let enc = flat_config();
    let rc = RateControlConfig::new()
      .with_bitrate(RateControlMode::Vbr, 1_000_000);
    let mut rate = RateControlCoordinator::new(&enc, &rc);
    let key = IntervalKey { mini_gop: 0, temporal_layer: 3, intra: false };
    rate.open_interval(key, 4);
    let per_picture = rate.interval(&key).unwrap().picture_budget_bits();
    rate.report_encoded(&descriptor(1, key), 10, 32).unwrap();

    rate.truncate_interval(key, 2);
    let interval = rate.interval(&key).unwrap();
    assert_eq!(interval.count(), 2);
    assert!((interval.budget_bits() - 2. * per_picture).abs() < 1e-6);
    rate.report_encoded(&descriptor(2, key), 10, 32).unwrap();
    assert_eq!(rate.open_intervals(), 0);

    // every picture of the cut interval already reported
    let next = IntervalKey { mini_gop: 1, ..key };
    rate.open_interval(next, 4);
    rate.report_encoded(&descriptor(3, next), 10, 32).unwrap();
    rate.truncate_interval(next, 1);
    assert!(rate.interval(&next).is_none());

    // unknown or already closed intervals are left alone
    rate.truncate_interval(key, 1);
    assert_eq!(rate.interval_counts(), (2, 2));
    assert_eq!(rate.end_of_stream(), 0);
  }

  #[test]
  fn parse_qp_file() {
    let file = QpFile::parse("# header\n30\n-1\n\n22 # forced\n").unwrap();
    assert_eq!(file.len(), 4);
    assert_eq!(file.qp(0), Some(30));
    assert_eq!(file.qp(1), None);
    assert_eq!(file.qp(2), None);
    assert_eq!(file.qp(3), Some(22));
    assert_eq!(file.qp(9), None);

    assert_eq!(
      "30\nabc".parse::<QpFile>(),
      Err(RateControlError::InvalidEntry { line: 2, text: "abc".into() })
    );
    assert_eq!(
      QpFile::parse("64"),
      Err(RateControlError::OutOfRange { line: 1, qp: 64, max: 63 })
    );
  }
}
