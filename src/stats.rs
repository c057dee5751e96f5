// Copyright (c) 2019-2025, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use crate::api::PictureType;
use crate::decision::PictureDescriptor;
use crate::pool::PoolStats;
use crate::reference::ReferenceStats;

use std::collections::BTreeMap;
use std::ops::{Add, AddAssign};

/// Totals of a group of coded pictures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PictureTotals {
  /// Pictures coded.
  pub count: usize,
  /// Bytes produced.
  pub bytes: u64,
  /// Sum of the quantizers used.
  pub qp_sum: u64,
}

impl PictureTotals {
  fn record(&mut self, byte_count: usize, qp: u8) {
    self.count += 1;
    self.bytes += byte_count as u64;
    self.qp_sum += qp as u64;
  }

  /// Mean quantizer, 0 when empty.
  pub fn avg_qp(&self) -> f64 {
    if self.count == 0 {
      return 0.;
    }
    self.qp_sum as f64 / self.count as f64
  }

  /// Mean picture size in bytes, 0 when empty.
  pub fn avg_size(&self) -> f64 {
    if self.count == 0 {
      return 0.;
    }
    self.bytes as f64 / self.count as f64
  }
}

impl AddAssign<&Self> for PictureTotals {
  fn add_assign(&mut self, rhs: &PictureTotals) {
    self.count += rhs.count;
    self.bytes += rhs.bytes;
    self.qp_sum += rhs.qp_sum;
  }
}

/// Statistics of an encode, gathered as pictures are reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodeStats {
  /// Totals per picture type, indexed in [`PictureType::ALL`] order.
  pub by_type: [PictureTotals; 5],
  /// Totals per temporal layer.
  pub by_layer: BTreeMap<u8, PictureTotals>,
  /// Reference table counters.
  pub reference: ReferenceStats,
  /// Buffer pool counters.
  pub pool: PoolStats,
  /// Rate control intervals closed at end of stream before all their
  /// pictures reported.
  pub stale_intervals: usize,
}

impl EncodeStats {
  pub(crate) fn record(
    &mut self, d: &PictureDescriptor, byte_count: usize, qp: u8,
  ) {
    self.by_type[d.picture_type as usize].record(byte_count, qp);
    self
      .by_layer
      .entry(d.temporal_layer)
      .or_default()
      .record(byte_count, qp);
  }

  /// Totals of one picture type.
  pub fn get(&self, picture_type: PictureType) -> &PictureTotals {
    &self.by_type[picture_type as usize]
  }

  /// Totals over every picture.
  pub fn total(&self) -> PictureTotals {
    let mut total = PictureTotals::default();
    for t in &self.by_type {
      total += t;
    }
    total
  }

  /// Average bitrate in bits per second at `frame_rate`.
  pub fn bitrate(&self, frame_rate: f64) -> u64 {
    let total = self.total();
    if total.count == 0 {
      return 0;
    }
    let bits = total.bytes as f64 * 8.;
    (bits * frame_rate / total.count as f64).round() as u64
  }
}

impl Add<&Self> for EncodeStats {
  type Output = Self;

  fn add(self, rhs: &EncodeStats) -> Self::Output {
    let mut lhs = self;
    lhs += rhs;
    lhs
  }
}

impl AddAssign<&Self> for EncodeStats {
  fn add_assign(&mut self, rhs: &EncodeStats) {
    self.by_type.iter_mut().zip(rhs.by_type.iter()).for_each(|(l, r)| {
      *l += r;
    });
    rhs.by_layer.iter().for_each(|(&k, v)| {
      *self.by_layer.entry(k).or_default() += v;
    });

    let (l, r) = (&mut self.reference, &rhs.reference);
    l.admitted += r.admitted;
    l.released += r.released;
    l.forced += r.forced;
    l.amended += r.amended;
    l.truncated += r.truncated;
    l.unbalanced += r.unbalanced;
    l.peak = l.peak.max(r.peak);

    self.pool.acquired += rhs.pool.acquired;
    self.pool.returned += rhs.pool.returned;
    self.pool.peak = self.pool.peak.max(rhs.pool.peak);

    self.stale_intervals += rhs.stale_intervals;
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::api::PredStructure;
  use crate::rate::IntervalKey;
  use arrayvec::ArrayVec;

  fn descriptor(picture_type: PictureType, layer: u8) -> PictureDescriptor {
    PictureDescriptor {
      id: 0,
      poc: 0,
      pts: 0,
      picture_type,
      temporal_layer: layer,
      structure: PredStructure::RandomAccess,
      mini_gop: 0,
      mini_gop_position: 0,
      list0: ArrayVec::new(),
      list1: ArrayVec::new(),
      dependents: Vec::new(),
      interval: IntervalKey::default(),
      interval_len: 1,
      qp_override: None,
      ref_slots: ArrayVec::new(),
    }
  }

  #[test]
  fn totals_by_type_and_layer() {
    let mut stats = EncodeStats::default();
    stats.record(&descriptor(PictureType::IDR, 0), 1000, 20);
    stats.record(&descriptor(PictureType::B, 1), 300, 33);
    stats.record(&descriptor(PictureType::NON_REF, 2), 100, 34);
    stats.record(&descriptor(PictureType::NON_REF, 2), 120, 36);

    assert_eq!(stats.get(PictureType::IDR).count, 1);
    assert_eq!(stats.get(PictureType::NON_REF).bytes, 220);
    assert!((stats.get(PictureType::NON_REF).avg_qp() - 35.).abs() < 1e-9);
    assert!(stats.get(PictureType::P).avg_size().abs() < 1e-9);
    assert_eq!(stats.by_layer[&2].count, 2);

    let total = stats.total();
    assert_eq!(total.count, 4);
    assert_eq!(total.bytes, 1520);
    // 380 bytes per picture at 10 pictures per second
    assert_eq!(stats.bitrate(10.), 30400);
  }

  #[test]
  fn channels_add_up() {
    let mut a = EncodeStats::default();
    a.record(&descriptor(PictureType::P, 0), 10, 30);
    a.reference.peak = 3;
    a.pool.acquired = 4;
    let mut b = EncodeStats::default();
    b.record(&descriptor(PictureType::P, 0), 30, 32);
    b.reference.peak = 5;
    b.pool.acquired = 2;

    let sum = a + &b;
    assert_eq!(sum.get(PictureType::P).count, 2);
    assert_eq!(sum.get(PictureType::P).bytes, 40);
    assert_eq!(sum.by_layer[&0].qp_sum, 62);
    assert_eq!(sum.reference.peak, 5);
    assert_eq!(sum.pool.acquired, 6);
  }
}
