// Copyright (c) 2019-2025, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use arrayvec::ArrayVec;

use crate::api::{PredStructure, MAX_REFERENCES};

pub(crate) type RefPocs = ArrayVec<u64, MAX_REFERENCES>;

/// Kind of intra refresh leading a window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Refresh {
  /// IDR, the base history restarts.
  Closed,
  /// Intra picture, the base history is kept.
  Open,
}

/// A picture placed by a prediction structure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct PlannedPicture {
  pub poc: u64,
  /// Position within the mini-GOP.
  pub slot: usize,
  pub layer: u8,
  pub intra: Option<Refresh>,
  pub list0: RefPocs,
  pub list1: RefPocs,
  /// Joins the base-layer history once coded.
  pub base: bool,
}

impl PlannedPicture {
  fn intra(poc: u64, refresh: Refresh) -> Self {
    PlannedPicture {
      poc,
      slot: 0,
      layer: 0,
      intra: Some(refresh),
      list0: RefPocs::new(),
      list1: RefPocs::new(),
      base: true,
    }
  }

  #[inline]
  pub fn references(&self, poc: u64) -> bool {
    self.list0.contains(&poc) || self.list1.contains(&poc)
  }
}

/// Most recent base-layer pictures, nearest first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct BaseHistory {
  pocs: RefPocs,
}

impl BaseHistory {
  pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
    self.pocs.iter().copied()
  }

  pub fn anchor(&self) -> Option<u64> {
    self.pocs.first().copied()
  }

  fn push(&mut self, poc: u64, limit: usize) {
    let limit = limit.clamp(1, MAX_REFERENCES);
    while self.pocs.len() >= limit {
      self.pocs.pop();
    }
    self.pocs.insert(0, poc);
  }

  /// Applies the effect of coding `p`.
  pub fn record(&mut self, p: &PlannedPicture, limit: usize) {
    match p.intra {
      Some(Refresh::Closed) => {
        self.pocs.clear();
        self.push(p.poc, limit);
      }
      Some(Refresh::Open) => self.push(p.poc, limit),
      None if p.base => self.push(p.poc, limit),
      None => {}
    }
  }
}

/// One mini-GOP window to lay out.
#[derive(Clone, Copy, Debug)]
pub(crate) struct MiniGop<'a> {
  /// POC of slot 0.
  pub start: u64,
  /// Slots to lay out, less than `size` when the window is cut short.
  pub len: usize,
  /// Slots of a full window.
  pub size: usize,
  pub levels: u8,
  pub leading: Option<Refresh>,
  /// Base history when the window opened.
  pub bases: &'a BaseHistory,
  pub reference_count: usize,
  /// Base layer coded as P.
  pub base_layer_p: bool,
}

impl MiniGop<'_> {
  fn is_full(&self) -> bool {
    self.len == self.size
  }

  fn slot(&self, poc: u64) -> usize {
    (poc - self.start) as usize
  }
}

/// Picks the nearest `count` candidates before `poc`, descending.
pub(crate) fn nearest_past(
  poc: u64, candidates: impl Iterator<Item = u64>, count: usize,
) -> RefPocs {
  let mut past: Vec<u64> = candidates.filter(|&c| c < poc).collect();
  past.sort_unstable_by(|a, b| b.cmp(a));
  past.dedup();
  past.into_iter().take(count.min(MAX_REFERENCES)).collect()
}

/// Picks the nearest `count` candidates after `poc`, ascending.
pub(crate) fn nearest_future(
  poc: u64, candidates: impl Iterator<Item = u64>, count: usize,
) -> RefPocs {
  let mut future: Vec<u64> = candidates.filter(|&c| c > poc).collect();
  future.sort_unstable();
  future.dedup();
  future.into_iter().take(count.min(MAX_REFERENCES)).collect()
}

/// Coding order of a mini-GOP and the references of its pictures.
pub(crate) trait PredictionStructure: Send + Sync {
  fn tag(&self) -> PredStructure;

  /// Whether a window is held back until it is complete.
  fn reorders(&self) -> bool;

  /// Lays out `mini_gop` in coding order. Truncated windows are laid out
  /// the way they are flushed.
  fn emission_order(&self, mini_gop: &MiniGop<'_>) -> Vec<PlannedPicture>;
}

pub(crate) fn for_tag(tag: PredStructure) -> Box<dyn PredictionStructure> {
  match tag {
    PredStructure::RandomAccess => Box::new(RandomAccess),
    PredStructure::LowDelayP => Box::new(LowDelay { b: false }),
    PredStructure::LowDelayB => Box::new(LowDelay { b: true }),
  }
}

/// Leading intra picture, if any, recorded into `history`.
fn lead(
  g: &MiniGop<'_>, history: &mut BaseHistory, out: &mut Vec<PlannedPicture>,
) -> bool {
  if let Some(refresh) = g.leading {
    let p = PlannedPicture::intra(g.start, refresh);
    history.record(&p, g.reference_count);
    out.push(p);
    true
  } else {
    false
  }
}

/// Display order flush of a truncated window, anchored on the last base
/// picture.
fn partial_order(g: &MiniGop<'_>) -> Vec<PlannedPicture> {
  let mut out = Vec::with_capacity(g.len);
  let mut history = g.bases.clone();
  let first = if lead(g, &mut history, &mut out) { 1 } else { 0 };
  let anchor = history.anchor();
  let mut chain = Vec::with_capacity(g.len);

  for slot in first..g.len {
    let poc = g.start + slot as u64;
    let list0 = nearest_past(
      poc,
      chain.iter().copied().chain(anchor),
      g.reference_count,
    );
    let list1 = if g.base_layer_p { RefPocs::new() } else { list0.clone() };
    out.push(PlannedPicture {
      poc,
      slot,
      layer: 0,
      intra: None,
      list0,
      list1,
      base: false,
    });
    chain.push(poc);
  }
  out
}

/// Hierarchical B-pyramid.
pub(crate) struct RandomAccess;

impl RandomAccess {
  fn bisect(
    g: &MiniGop<'_>, lo: u64, hi: u64, layer: u8, history: &BaseHistory,
    coded: &mut Vec<u64>, out: &mut Vec<PlannedPicture>,
  ) {
    let mid = lo + (hi - lo) / 2;
    if mid == lo {
      return;
    }
    let past = history.iter().chain(coded.iter().copied());
    let list0 = nearest_past(mid, past, g.reference_count);
    let list1 =
      nearest_future(mid, coded.iter().copied(), g.reference_count);
    out.push(PlannedPicture {
      poc: mid,
      slot: g.slot(mid),
      layer,
      intra: None,
      list0,
      list1,
      base: false,
    });
    if mid - lo > 1 || hi - mid > 1 {
      coded.push(mid);
    }
    Self::bisect(g, lo, mid, layer + 1, history, coded, out);
    Self::bisect(g, mid, hi, layer + 1, history, coded, out);
  }
}

impl PredictionStructure for RandomAccess {
  fn tag(&self) -> PredStructure {
    PredStructure::RandomAccess
  }

  fn reorders(&self) -> bool {
    true
  }

  fn emission_order(&self, g: &MiniGop<'_>) -> Vec<PlannedPicture> {
    if !g.is_full() {
      return partial_order(g);
    }

    let mut out = Vec::with_capacity(g.len);
    let mut history = g.bases.clone();
    let lo = if lead(g, &mut history, &mut out) {
      g.start
    } else {
      // the previous window closed on the picture right before this one
      history.anchor().unwrap_or(g.start.saturating_sub(1))
    };
    let hi = g.start + g.len as u64 - 1;
    if hi <= lo {
      return out;
    }

    let list0 = nearest_past(hi, history.iter(), g.reference_count);
    let list1 = if g.base_layer_p { RefPocs::new() } else { list0.clone() };
    out.push(PlannedPicture {
      poc: hi,
      slot: g.slot(hi),
      layer: 0,
      intra: None,
      list0,
      list1,
      base: true,
    });

    let mut coded = vec![hi];
    Self::bisect(g, lo, hi, 1, &history, &mut coded, &mut out);
    out
  }
}

/// Display order coding with a hierarchical-P layer assignment.
pub(crate) struct LowDelay {
  /// list1 mirrors list0.
  pub b: bool,
}

impl PredictionStructure for LowDelay {
  fn tag(&self) -> PredStructure {
    if self.b {
      PredStructure::LowDelayB
    } else {
      PredStructure::LowDelayP
    }
  }

  fn reorders(&self) -> bool {
    false
  }

  fn emission_order(&self, g: &MiniGop<'_>) -> Vec<PlannedPicture> {
    let mut out = Vec::with_capacity(g.len);
    let mut history = g.bases.clone();
    let mut window: Vec<(u64, u8)> = Vec::with_capacity(g.len);

    if lead(g, &mut history, &mut out) {
      window.push((g.start, 0));
    }

    for slot in out.len()..g.len {
      let poc = g.start + slot as u64;
      if slot == 0 {
        let list0 = nearest_past(poc, history.iter(), g.reference_count);
        let list1 = if self.b && !g.base_layer_p {
          list0.clone()
        } else {
          RefPocs::new()
        };
        let p = PlannedPicture {
          poc,
          slot,
          layer: 0,
          intra: None,
          list0,
          list1,
          base: true,
        };
        history.record(&p, g.reference_count);
        window.push((poc, 0));
        out.push(p);
        continue;
      }

      let layer = g.levels - slot.trailing_zeros() as u8;
      let lower = window.iter().filter(|&&(_, l)| l < layer).map(|&(c, _)| c);
      let list0 =
        nearest_past(poc, lower.chain(history.iter()), g.reference_count);
      let list1 = if self.b { list0.clone() } else { RefPocs::new() };
      window.push((poc, layer));
      out.push(PlannedPicture {
        poc,
        slot,
        layer,
        intra: None,
        list0,
        list1,
        base: false,
      });
    }
    out
  }
}

#[cfg(test)]
mod test {
  use super::*;

  fn history(pocs: &[u64]) -> BaseHistory {
    let mut h = BaseHistory::default();
    for &poc in pocs.iter().rev() {
      h.push(poc, MAX_REFERENCES);
    }
    h
  }

  fn window(
    start: u64, len: usize, levels: u8, leading: Option<Refresh>,
    bases: &BaseHistory,
  ) -> MiniGop<'_> {
    MiniGop {
      start,
      len,
      size: 1 << levels,
      levels,
      leading,
      bases,
      reference_count: 2,
      base_layer_p: false,
    }
  }

  #[test]
  fn pyramid_after_idr() {
    let bases = BaseHistory::default();
    let g = window(0, 4, 2, Some(Refresh::Closed), &bases);
    let order = RandomAccess.emission_order(&g);
    let pocs: Vec<_> = order.iter().map(|p| p.poc).collect();
    assert_eq!(pocs, vec![0, 3, 1, 2]);
    let layers: Vec<_> = order.iter().map(|p| p.layer).collect();
    assert_eq!(layers, vec![0, 0, 1, 2]);

    assert_eq!(&order[1].list0[..], &[0]);
    assert_eq!(&order[1].list1[..], &[0]);
    assert_eq!(&order[2].list0[..], &[0]);
    assert_eq!(&order[2].list1[..], &[3]);
    assert_eq!(&order[3].list0[..], &[1, 0]);
    assert_eq!(&order[3].list1[..], &[3]);
  }

  #[test]
  fn pyramid_of_eight() {
    let bases = history(&[7, 3]);
    let g = window(8, 8, 3, None, &bases);
    let order = RandomAccess.emission_order(&g);
    let pocs: Vec<_> = order.iter().map(|p| p.poc).collect();
    assert_eq!(pocs, vec![15, 11, 9, 8, 10, 13, 12, 14]);
    let layers: Vec<_> = order.iter().map(|p| p.layer).collect();
    assert_eq!(layers, vec![0, 1, 2, 3, 3, 2, 3, 3]);
    assert_eq!(&order[0].list0[..], &[7, 3]);
    // 12 sits between 11 and 13
    assert_eq!(&order[6].list0[..], &[11, 9]);
    assert_eq!(&order[6].list1[..], &[13, 15]);
  }

  #[test]
  fn base_layer_p_has_no_list1() {
    let bases = history(&[3]);
    let mut g = window(4, 4, 2, None, &bases);
    g.base_layer_p = true;
    let order = RandomAccess.emission_order(&g);
    assert_eq!(order[0].poc, 7);
    assert!(order[0].list1.is_empty());
    assert!(!order[1].list1.is_empty());
  }

  #[test]
  fn partial_flush_is_display_order() {
    let bases = history(&[7, 3]);
    let g = window(8, 3, 2, None, &bases);
    let order = RandomAccess.emission_order(&g);
    let pocs: Vec<_> = order.iter().map(|p| p.poc).collect();
    assert_eq!(pocs, vec![8, 9, 10]);
    assert!(order.iter().all(|p| p.layer == 0));
    assert_eq!(&order[0].list0[..], &[7]);
    assert_eq!(&order[2].list0[..], &[9, 8]);
  }

  #[test]
  fn low_delay_layers() {
    let bases = BaseHistory::default();
    let g = window(0, 4, 2, Some(Refresh::Closed), &bases);
    let order = LowDelay { b: false }.emission_order(&g);
    let layers: Vec<_> = order.iter().map(|p| p.layer).collect();
    assert_eq!(layers, vec![0, 2, 1, 2]);
    assert_eq!(&order[1].list0[..], &[0]);
    assert_eq!(&order[2].list0[..], &[0]);
    // slot 3 may use slot 2, a lower layer
    assert_eq!(&order[3].list0[..], &[2, 0]);
    assert!(order.iter().all(|p| p.list1.is_empty()));

    let b = LowDelay { b: true }.emission_order(&g);
    assert!(b.iter().skip(1).all(|p| p.list0 == p.list1));
  }

  #[test]
  fn flat_structure_references_the_previous_picture() {
    let bases = history(&[4, 3]);
    let g = window(5, 1, 0, None, &bases);
    let ra = RandomAccess.emission_order(&g);
    assert_eq!(ra.len(), 1);
    assert_eq!(ra[0].poc, 5);
    assert_eq!(&ra[0].list0[..], &[4, 3]);
    let ld = LowDelay { b: false }.emission_order(&g);
    assert_eq!(ld[0].poc, 5);
    assert_eq!(&ld[0].list0[..], &[4, 3]);
  }

  #[test]
  fn history_keeps_the_nearest() {
    let mut h = BaseHistory::default();
    let base = |poc| PlannedPicture {
      poc,
      slot: 0,
      layer: 0,
      intra: None,
      list0: RefPocs::new(),
      list1: RefPocs::new(),
      base: true,
    };
    for poc in 0..5 {
      h.record(&base(poc), 2);
    }
    assert_eq!(h.iter().collect::<Vec<_>>(), vec![4, 3]);
    h.record(&PlannedPicture::intra(5, Refresh::Open), 2);
    assert_eq!(h.iter().collect::<Vec<_>>(), vec![5, 4]);
    h.record(&PlannedPicture::intra(6, Refresh::Closed), 2);
    assert_eq!(h.iter().collect::<Vec<_>>(), vec![6]);
  }
}
