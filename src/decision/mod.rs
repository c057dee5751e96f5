// Copyright (c) 2019-2025, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Picture decision: reordering of display order input into mini-GOPs.

pub(crate) mod structure;

use arrayvec::ArrayVec;

use crate::api::{
  EncoderConfig, IntraRefresh, PictureType, PredStructure, SchedulerError,
  MAX_REFERENCES,
};
use crate::rate::IntervalKey;
use crate::reference::RefId;

use self::structure::*;

use std::collections::BTreeMap;
use std::ops::Range;

/// What the decision engine needs to know about an input picture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PictureInput {
  /// Presentation timestamp.
  pub pts: u64,
  /// Start a new scene with an IDR.
  pub scene_cut: bool,
  /// Forced quantizer.
  pub qp: Option<u8>,
}

/// Scheduling decisions for one picture.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PictureDescriptor {
  /// Decode order index.
  pub id: u64,
  /// Display order index.
  pub poc: u64,
  /// Presentation timestamp.
  pub pts: u64,
  /// Type of the picture.
  pub picture_type: PictureType,
  /// Temporal layer, 0 is the base layer.
  pub temporal_layer: u8,
  /// Prediction structure the picture was laid out with.
  pub structure: PredStructure,
  /// Index of the mini-GOP.
  pub mini_gop: u64,
  /// Position within the mini-GOP.
  pub mini_gop_position: usize,
  /// Past references, nearest first.
  pub list0: ArrayVec<u64, MAX_REFERENCES>,
  /// Future references (random access) or a mirror of list0 (low delay B).
  pub list1: ArrayVec<u64, MAX_REFERENCES>,
  /// Pictures expected to reference this one, ascending.
  pub dependents: Vec<u64>,
  /// Rate control interval of the picture.
  pub interval: IntervalKey,
  /// Number of pictures sharing the interval.
  pub interval_len: usize,
  /// Quantizer forced by a QP file.
  pub qp_override: Option<u8>,
  /// Reference entries held by this picture, filled at admission.
  pub(crate) ref_slots: ArrayVec<RefId, { 2 * MAX_REFERENCES }>,
}

impl PictureDescriptor {
  /// Every referenced POC, list0 first, without repetition.
  pub fn references(&self) -> impl Iterator<Item = u64> + '_ {
    self.list0.iter().copied().chain(
      self.list1.iter().copied().filter(move |poc| !self.list0.contains(poc)),
    )
  }

  /// Whether `poc` appears in either list.
  pub fn refers_to(&self, poc: u64) -> bool {
    self.list0.contains(&poc) || self.list1.contains(&poc)
  }
}

struct Window {
  index: u64,
  start: u64,
  /// Expected length, shorter than a mini-GOP before a scheduled refresh.
  len: usize,
  leading: Option<Refresh>,
  bases: BaseHistory,
  filled: usize,
  emitted: usize,
  /// Pictures emitted per rate control interval.
  intervals: BTreeMap<IntervalKey, usize>,
}

/// Turns display order input into coding order descriptors.
pub struct PictureDecisionEngine {
  structure: Box<dyn PredictionStructure>,
  levels: u8,
  size: usize,
  reference_count: usize,
  base_layer_p: bool,
  intra_interval: Option<u64>,
  intra_refresh: Refresh,

  slots: Box<[Option<PictureInput>]>,
  boundary: Option<(u64, PictureInput, Refresh)>,
  window: Option<Window>,
  history: BaseHistory,
  last_refresh: u64,

  next_poc: u64,
  next_id: u64,
  next_window: u64,
  eos: bool,
  // Intervals of windows cut short, with the pictures they got.
  truncated: Vec<(IntervalKey, usize)>,
}

impl PictureDecisionEngine {
  /// Creates an engine for the given prediction structure.
  pub fn new(enc: &EncoderConfig) -> Self {
    let size = enc.mini_gop_size();
    PictureDecisionEngine {
      structure: for_tag(enc.pred_structure),
      levels: enc.hierarchical_levels,
      size,
      reference_count: enc.reference_count,
      base_layer_p: enc.base_layer_switch_mode,
      intra_interval: enc.intra_interval(),
      intra_refresh: match enc.intra_refresh {
        IntraRefresh::Closed => Refresh::Closed,
        IntraRefresh::Open => Refresh::Open,
      },
      slots: vec![None; size].into_boxed_slice(),
      boundary: None,
      window: None,
      history: BaseHistory::default(),
      last_refresh: 0,
      next_poc: 0,
      next_id: 0,
      next_window: 0,
      eos: false,
      truncated: Vec::new(),
    }
  }

  /// Pictures in a full mini-GOP.
  pub const fn mini_gop_size(&self) -> usize {
    self.size
  }

  /// Pictures accepted so far.
  pub const fn accepted(&self) -> u64 {
    self.next_poc
  }

  /// Descriptors handed out so far.
  pub const fn emitted(&self) -> u64 {
    self.next_id
  }

  /// Pictures accepted but not yet decided.
  pub const fn pending(&self) -> u64 {
    self.next_poc - self.next_id
  }

  /// POC of the last accepted picture.
  pub fn last_poc(&self) -> Option<u64> {
    self.next_poc.checked_sub(1)
  }

  /// Whether the end of the input was signalled.
  pub const fn is_flushing(&self) -> bool {
    self.eos
  }

  fn scheduled(&self, last_refresh: u64, poc: u64) -> bool {
    match self.intra_interval {
      Some(period) => poc > last_refresh && poc - last_refresh > period,
      None => false,
    }
  }

  fn window_len(&self, start: u64, last_refresh: u64) -> usize {
    match self.intra_interval {
      Some(period) => {
        let next = last_refresh + period + 1;
        if next > start {
          self.size.min((next - start) as usize)
        } else {
          self.size
        }
      }
      None => self.size,
    }
  }

  /// Drops the current window, keeping track of the intervals it left
  /// incomplete.
  fn retire_window(&mut self) {
    let Some(w) = self.window.take() else { return };
    if w.emitted < w.len {
      log::debug!(
        "mini-GOP {} cut after {} of {} pictures",
        w.index,
        w.emitted,
        w.len
      );
      self.truncated.extend(w.intervals);
    }
  }

  /// Rate control intervals of the mini-GOPs cut short since the last
  /// call, with the number of pictures each one actually holds.
  pub fn take_truncated(&mut self) -> Vec<(IntervalKey, usize)> {
    std::mem::take(&mut self.truncated)
  }

  fn open_window(&mut self, start: u64, leading: Option<Refresh>) {
    debug_assert!(self.slots.iter().all(Option::is_none));
    self.retire_window();
    let last_refresh =
      if leading.is_some() { start } else { self.last_refresh };
    self.window = Some(Window {
      index: self.next_window,
      start,
      len: self.window_len(start, last_refresh),
      leading,
      bases: self.history.clone(),
      filled: 0,
      emitted: 0,
      intervals: BTreeMap::new(),
    });
    self.next_window += 1;
  }

  fn fill(
    &mut self, poc: u64, input: PictureInput,
  ) -> Result<(), SchedulerError> {
    let overflow = SchedulerError::QueueOverflow { poc, capacity: self.size };
    let w = self.window.as_mut().ok_or(overflow)?;
    let slot = (poc - w.start) as usize;
    if slot >= w.len || slot != w.filled {
      return Err(overflow);
    }
    self.slots[slot] = Some(input);
    w.filled += 1;
    Ok(())
  }

  /// Admits the next picture in display order and returns its POC.
  ///
  /// # Errors
  ///
  /// Returns `QueueOverflow` if the current mini-GOP cannot take the
  /// picture because it was not decided yet.
  pub fn accept(
    &mut self, input: PictureInput,
  ) -> Result<u64, SchedulerError> {
    let poc = self.next_poc;
    let refresh = if poc == 0 || input.scene_cut {
      Some(Refresh::Closed)
    } else if self.scheduled(self.last_refresh, poc) {
      Some(self.intra_refresh)
    } else {
      None
    };

    let idle = self.window.as_ref().map_or(true, |w| w.filled == w.emitted);
    match refresh {
      Some(kind) if idle && self.boundary.is_none() => {
        self.open_window(poc, Some(kind));
        self.fill(poc, input)?;
        self.last_refresh = poc;
      }
      Some(kind) if self.boundary.is_none() => {
        self.boundary = Some((poc, input, kind));
        self.last_refresh = poc;
      }
      Some(_) => {
        return Err(SchedulerError::QueueOverflow { poc, capacity: self.size })
      }
      None => {
        if self.boundary.is_some() {
          return Err(SchedulerError::QueueOverflow {
            poc,
            capacity: self.size,
          });
        }
        if self.window.as_ref().map_or(true, |w| w.emitted == w.len) {
          self.open_window(poc, None);
        }
        self.fill(poc, input)?;
      }
    }

    log::trace!("accepted picture {} (refresh {:?})", poc, refresh);
    self.next_poc += 1;
    Ok(poc)
  }

  /// Signals that no more pictures will be accepted.
  pub fn end_of_stream(&mut self) {
    self.eos = true;
  }

  fn layout(&self, w: &Window, len: usize) -> Vec<PlannedPicture> {
    self.structure.emission_order(&MiniGop {
      start: w.start,
      len,
      size: self.size,
      levels: self.levels,
      leading: w.leading,
      bases: &w.bases,
      reference_count: self.reference_count,
      base_layer_p: self.base_layer_p,
    })
  }

  /// Picks the next batch of pictures that can leave the reorder queue.
  fn next_unit(&mut self) -> Option<(Vec<PlannedPicture>, Range<usize>)> {
    loop {
      let w = self.window.as_ref()?;
      if w.emitted < w.filled {
        let cut = self.boundary.is_some() || self.eos;
        return if w.emitted == 0
          && w.leading.is_some()
          && self.structure.reorders()
        {
          Some((self.layout(w, 1), 0..1))
        } else if !self.structure.reorders() {
          Some((self.layout(w, w.len), w.emitted..w.filled))
        } else if w.filled == w.len {
          Some((self.layout(w, w.len), w.emitted..w.len))
        } else if cut {
          Some((self.layout(w, w.filled), w.emitted..w.filled))
        } else {
          None
        };
      }

      let complete = w.emitted == w.len;
      if let Some((poc, input, kind)) = self.boundary.take() {
        self.open_window(poc, Some(kind));
        if self.fill(poc, input).is_err() {
          // a fresh window always has room for its leading picture
          debug_assert!(false);
        }
        continue;
      }
      if complete || self.eos {
        self.retire_window();
      }
      return None;
    }
  }

  /// Lays out what the engine expects to code after the emitted pictures.
  fn simulate(&self) -> Vec<PlannedPicture> {
    let mut future = Vec::new();
    let mut last_refresh = self.last_refresh;
    let mut bases;
    let mut start;
    let mut leading = None;

    if let Some(w) = &self.window {
      let cut = self.boundary.is_some() || self.eos;
      let len = if cut { w.filled } else { w.len };
      bases = w.bases.clone();
      for p in self.layout(w, len) {
        bases.record(&p, self.reference_count);
        if p.slot >= w.emitted {
          future.push(p);
        }
      }
      if self.eos {
        return future;
      }
      start = w.start + len as u64;
      if let Some((poc, _, kind)) = &self.boundary {
        start = *poc;
        leading = Some(*kind);
      }
    } else {
      if self.eos {
        return future;
      }
      bases = self.history.clone();
      start = self.next_poc;
    }

    for _ in 0..=self.reference_count {
      if leading.is_none() {
        if start == 0 {
          leading = Some(Refresh::Closed);
        } else if self.scheduled(last_refresh, start) {
          leading = Some(self.intra_refresh);
        }
      }
      if leading.is_some() {
        last_refresh = start;
      }
      let len = self.window_len(start, last_refresh);
      let snapshot = bases.clone();
      let g = MiniGop {
        start,
        len,
        size: self.size,
        levels: self.levels,
        leading,
        bases: &snapshot,
        reference_count: self.reference_count,
        base_layer_p: self.base_layer_p,
      };
      for p in self.structure.emission_order(&g) {
        bases.record(&p, self.reference_count);
        future.push(p);
      }
      start += len as u64;
      leading = None;
    }
    future
  }

  /// Pops every descriptor that can be coded now, in coding order.
  pub fn decide(&mut self) -> Vec<PictureDescriptor> {
    let mut out = Vec::new();
    while let Some((layout, range)) = self.next_unit() {
      self.emit(&layout, range, &mut out);
    }
    out
  }

  fn emit(
    &mut self, layout: &[PlannedPicture], range: Range<usize>,
    out: &mut Vec<PictureDescriptor>,
  ) {
    let unit: Vec<&PlannedPicture> =
      layout.iter().filter(|p| range.contains(&p.slot)).collect();
    let mut inputs = Vec::with_capacity(unit.len());
    for p in &unit {
      debug_assert!(self.slots[p.slot].is_some());
      inputs.push(self.slots[p.slot].take().unwrap_or_default());
      self.history.record(p, self.reference_count);
    }
    let index = match self.window.as_mut() {
      Some(w) => {
        w.emitted = range.end;
        w.index
      }
      None => return,
    };

    let future = self.simulate();
    for (i, (p, input)) in unit.iter().zip(inputs).enumerate() {
      let mut dependents: Vec<u64> = unit[i + 1..]
        .iter()
        .copied()
        .chain(future.iter())
        .filter(|q| q.references(p.poc))
        .map(|q| q.poc)
        .collect();
      dependents.sort_unstable();

      let picture_type = match p.intra {
        Some(Refresh::Closed) => PictureType::IDR,
        Some(Refresh::Open) => PictureType::I,
        None if dependents.is_empty() => PictureType::NON_REF,
        None if p.list1.is_empty() => PictureType::P,
        None => PictureType::B,
      };
      let intra = p.intra.is_some();
      let interval_len = layout
        .iter()
        .filter(|q| q.layer == p.layer && q.intra.is_some() == intra)
        .count();

      let d = PictureDescriptor {
        id: self.next_id,
        poc: p.poc,
        pts: input.pts,
        picture_type,
        temporal_layer: p.layer,
        structure: self.structure.tag(),
        mini_gop: index,
        mini_gop_position: p.slot,
        list0: p.list0.clone(),
        list1: p.list1.clone(),
        dependents,
        interval: IntervalKey {
          mini_gop: index,
          temporal_layer: p.layer,
          intra,
        },
        interval_len,
        qp_override: input.qp,
        ref_slots: ArrayVec::new(),
      };
      log::debug!(
        "decided picture {} as {} (id {}, layer {}, list0 {:?}, list1 {:?})",
        d.poc,
        d.picture_type,
        d.id,
        d.temporal_layer,
        &d.list0[..],
        &d.list1[..]
      );
      if let Some(w) = self.window.as_mut() {
        *w.intervals.entry(d.interval).or_default() += 1;
      }
      self.next_id += 1;
      out.push(d);
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use quickcheck::quickcheck;

  fn config(
    levels: u8, structure: PredStructure, intra_period: i64,
  ) -> EncoderConfig {
    let mut enc = EncoderConfig::default();
    enc.hierarchical_levels = levels;
    enc.pred_structure = structure;
    enc.intra_period = intra_period;
    enc.reference_count = 2;
    enc
  }

  fn run(
    enc: &EncoderConfig, count: u64, cuts: &[u64],
  ) -> Vec<PictureDescriptor> {
    let mut engine = PictureDecisionEngine::new(enc);
    let mut out = Vec::new();
    for poc in 0..count {
      let input = PictureInput {
        pts: poc,
        scene_cut: cuts.contains(&poc),
        qp: None,
      };
      assert_eq!(engine.accept(input), Ok(poc));
      out.extend(engine.decide());
    }
    engine.end_of_stream();
    out.extend(engine.decide());
    assert_eq!(engine.pending(), 0);
    out
  }

  fn pocs(out: &[PictureDescriptor]) -> Vec<u64> {
    out.iter().map(|d| d.poc).collect()
  }

  #[test]
  fn nine_pictures_at_depth_two() {
    let enc = config(2, PredStructure::RandomAccess, -1);
    let out = run(&enc, 9, &[]);
    assert_eq!(pocs(&out), vec![0, 3, 1, 2, 7, 5, 4, 6, 8]);
    assert_eq!(out[0].picture_type, PictureType::IDR);
    assert_eq!(out[3].picture_type, PictureType::NON_REF);

    let last = &out[8];
    assert_eq!(last.temporal_layer, 0);
    assert_eq!(&last.list0[..], &[7]);
    assert_eq!(last.interval_len, 1);

    let ids: Vec<u64> = out.iter().map(|d| d.id).collect();
    assert_eq!(ids, (0..9).collect::<Vec<_>>());
  }

  #[test]
  fn three_pictures_into_a_window_of_four() {
    let enc = config(2, PredStructure::RandomAccess, -1);
    let out = run(&enc, 3, &[]);
    assert_eq!(pocs(&out), vec![0, 1, 2]);
    assert_eq!(&out[2].list0[..], &[1, 0]);
  }

  #[test]
  fn flat_structure_has_no_latency() {
    for structure in
      [PredStructure::RandomAccess, PredStructure::LowDelayP]
    {
      let enc = config(0, structure, -1);
      let mut engine = PictureDecisionEngine::new(&enc);
      for poc in 0..6 {
        engine.accept(PictureInput::default()).unwrap();
        let out = engine.decide();
        assert_eq!(pocs(&out), vec![poc]);
        if poc > 0 {
          assert_eq!(out[0].list0[0], poc - 1);
          assert_eq!(out[0].temporal_layer, 0);
        }
      }
    }
  }

  #[test]
  fn low_delay_emits_immediately() {
    let enc = config(2, PredStructure::LowDelayB, -1);
    let mut engine = PictureDecisionEngine::new(&enc);
    for poc in 0..10 {
      engine.accept(PictureInput::default()).unwrap();
      let out = engine.decide();
      assert_eq!(out.len(), 1);
      assert_eq!(out[0].poc, poc);
      if poc > 0 {
        assert_eq!(out[0].list0, out[0].list1);
      }
    }
  }

  #[test]
  fn periodic_refresh() {
    let enc = config(2, PredStructure::RandomAccess, 5);
    let out = run(&enc, 14, &[]);
    let intra: Vec<u64> = out
      .iter()
      .filter(|d| d.picture_type.is_intra())
      .map(|d| d.poc)
      .collect();
    assert_eq!(intra, vec![0, 6, 12]);
    // 4 and 5 are cut off before the refresh at 6
    assert_eq!(pocs(&out)[..7], [0, 3, 1, 2, 4, 5, 6]);
  }

  #[test]
  fn open_refresh_keeps_references() {
    let mut enc = config(2, PredStructure::RandomAccess, 3);
    enc.intra_refresh = IntraRefresh::Open;
    let out = run(&enc, 12, &[]);
    let i = out.iter().find(|d| d.poc == 4).unwrap();
    assert_eq!(i.picture_type, PictureType::I);
    let closing = out.iter().find(|d| d.poc == 7).unwrap();
    assert_eq!(&closing.list0[..], &[4, 3]);
  }

  #[test]
  fn scene_cut_forces_idr() {
    let enc = config(2, PredStructure::RandomAccess, -1);
    let out = run(&enc, 10, &[6]);
    assert_eq!(pocs(&out), vec![0, 3, 1, 2, 4, 5, 6, 9, 7, 8]);
    let idr = out.iter().find(|d| d.poc == 6).unwrap();
    assert_eq!(idr.picture_type, PictureType::IDR);
    let after = out.iter().find(|d| d.poc == 9).unwrap();
    assert_eq!(&after.list0[..], &[6]);
  }

  #[test]
  fn dependents_cover_the_actual_references() {
    let enc = config(3, PredStructure::RandomAccess, 16);
    // the last mini-GOP closes on picture 58
    let out = run(&enc, 59, &[]);
    let last = out.iter().map(|d| d.poc).max().unwrap();
    for d in &out {
      for r in d.references() {
        let reference = out.iter().find(|x| x.poc == r).unwrap();
        assert!(
          reference.dependents.contains(&d.poc),
          "{} missing from the dependents of {}",
          d.poc,
          r
        );
      }
      for &dep in &d.dependents {
        if dep <= last {
          let dependent = out.iter().find(|x| x.poc == dep).unwrap();
          assert!(dependent.refers_to(d.poc));
        }
      }
    }
  }

  #[test]
  fn cut_windows_report_their_intervals() {
    let enc = config(3, PredStructure::LowDelayP, -1);
    let mut engine = PictureDecisionEngine::new(&enc);
    let mut out = Vec::new();
    for poc in 0..4 {
      let input = PictureInput { pts: poc, scene_cut: poc == 3, qp: None };
      engine.accept(input).unwrap();
      out.extend(engine.decide());
    }
    assert_eq!(pocs(&out), vec![0, 1, 2, 3]);
    assert!(out[..3].iter().any(|d| d.interval_len > 1));

    let mut expected = BTreeMap::new();
    for d in out.iter().filter(|d| d.mini_gop == 0) {
      *expected.entry(d.interval).or_insert(0) += 1;
    }
    let expected: Vec<_> = expected.into_iter().collect();
    assert_eq!(engine.take_truncated(), expected);
    assert!(engine.take_truncated().is_empty());

    // the end of the stream cuts the window of the last scene
    engine.end_of_stream();
    assert!(engine.decide().is_empty());
    assert_eq!(engine.take_truncated(), vec![(out[3].interval, 1)]);
  }

  #[test]
  fn full_windows_are_not_reported() {
    let enc = config(2, PredStructure::LowDelayB, -1);
    let mut engine = PictureDecisionEngine::new(&enc);
    for poc in 0..8 {
      engine.accept(PictureInput::default()).unwrap();
      assert_eq!(pocs(&engine.decide()), vec![poc]);
      assert!(engine.take_truncated().is_empty());
    }
  }

  #[test]
  fn overflow_without_decide() {
    let enc = config(1, PredStructure::RandomAccess, -1);
    let mut engine = PictureDecisionEngine::new(&enc);
    engine.accept(PictureInput::default()).unwrap();
    engine.accept(PictureInput::default()).unwrap();
    assert_eq!(
      engine.accept(PictureInput::default()),
      Err(SchedulerError::QueueOverflow { poc: 2, capacity: 2 })
    );
  }

  fn structure_from(seed: u8) -> PredStructure {
    match seed % 3 {
      0 => PredStructure::RandomAccess,
      1 => PredStructure::LowDelayP,
      _ => PredStructure::LowDelayB,
    }
  }

  quickcheck! {
    fn emitted_equals_accepted(
      levels: u8, seed: u8, count: u16, period: i8, cut: u8
    ) -> bool {
      let levels = levels % (crate::api::MAX_HIERARCHICAL_LEVELS + 1);
      let period = (period as i64 % 40).max(-2);
      let enc = config(levels, structure_from(seed), period);
      let count = (count % 200) as u64;
      let out = run(&enc, count, &[cut as u64]);
      let mut seen = pocs(&out);
      seen.sort_unstable();
      seen == (0..count).collect::<Vec<_>>()
    }

    fn references_precede_in_coding_order(
      levels: u8, seed: u8, count: u16, period: i8
    ) -> bool {
      let levels = levels % (crate::api::MAX_HIERARCHICAL_LEVELS + 1);
      let period = (period as i64 % 40).max(-2);
      let enc = config(levels, structure_from(seed), period);
      let out = run(&enc, (count % 200) as u64, &[]);
      out.iter().enumerate().all(|(i, d)| {
        d.references().all(|r| out[..i].iter().any(|x| x.poc == r))
      })
    }
  }
}
