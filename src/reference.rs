// Copyright (c) 2018-2025, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use arrayvec::ArrayVec;

use crate::api::{
  EncoderConfig, PictureType, Resource, SchedulerError, MAX_REFERENCES,
};
use crate::decision::PictureDescriptor;
use crate::pool::{PictureBuffer, PictureBufferPool};

use v_frame::pixel::Pixel;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Stable handle of a reference entry.
///
/// Handles of released entries never resolve again, even when their slot is
/// reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RefId {
  slot: u32,
  generation: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Ledger {
  admitted: usize,
  added: usize,
  retracted: usize,
  decremented: usize,
}

impl Ledger {
  fn is_balanced(&self) -> bool {
    self.decremented + self.retracted == self.admitted + self.added
  }
}

struct Entry<T: Pixel> {
  poc: u64,
  temporal_layer: u8,
  dependents: BTreeSet<u64>,
  reconstructed: bool,
  buffer: Arc<PictureBuffer<T>>,
  ledger: Ledger,
}

struct Slot<T: Pixel> {
  generation: u32,
  entry: Option<Entry<T>>,
}

/// Counters of a [`ReferenceScheduler`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReferenceStats {
  /// Entries created.
  pub admitted: u64,
  /// Entries released, forced ones included.
  pub released: u64,
  /// Entries released while dependents were still recorded.
  pub forced: u64,
  /// Dependents added or retracted after admission.
  pub amended: u64,
  /// Dependents dropped because the stream ended first.
  pub truncated: u64,
  /// Entries whose ledger did not balance on release.
  pub unbalanced: u64,
  /// Most entries live at the same time.
  pub peak: usize,
}

/// A resolved reference.
#[derive(Debug)]
pub struct ReferencePicture<T: Pixel> {
  /// Handle of the entry.
  pub id: RefId,
  /// Display order index.
  pub poc: u64,
  /// Temporal layer.
  pub temporal_layer: u8,
  /// The reconstruction.
  pub buffer: Arc<PictureBuffer<T>>,
}

/// Reference lists of one picture.
#[derive(Debug)]
pub struct ReferenceLists<T: Pixel> {
  /// Past references, nearest first.
  pub list0: ArrayVec<ReferencePicture<T>, MAX_REFERENCES>,
  /// Future references, nearest first.
  pub list1: ArrayVec<ReferencePicture<T>, MAX_REFERENCES>,
}

impl<T: Pixel> Default for ReferenceLists<T> {
  fn default() -> Self {
    ReferenceLists { list0: ArrayVec::new(), list1: ArrayVec::new() }
  }
}

impl<T: Pixel> ReferenceLists<T> {
  /// list0 then list1.
  pub fn iter(&self) -> impl Iterator<Item = &ReferencePicture<T>> {
    self.list0.iter().chain(self.list1.iter())
  }

  /// Whether the picture is intra coded.
  pub fn is_empty(&self) -> bool {
    self.list0.is_empty() && self.list1.is_empty()
  }
}

/// Owns the reference entries and their reconstruction buffers.
pub struct ReferenceScheduler<T: Pixel> {
  slots: Vec<Slot<T>>,
  free: Vec<usize>,
  by_poc: BTreeMap<u64, RefId>,
  // Entries each admitted, not yet encoded picture was counted in.
  inflight: BTreeMap<u64, ArrayVec<RefId, { 2 * MAX_REFERENCES }>>,
  pool: PictureBufferPool<T>,
  stats: ReferenceStats,
}

impl<T: Pixel> ReferenceScheduler<T> {
  /// Creates a table of `capacity` entries drawing buffers from `pool`.
  pub fn new(capacity: usize, pool: PictureBufferPool<T>) -> Self {
    ReferenceScheduler {
      slots: (0..capacity)
        .map(|_| Slot { generation: 0, entry: None })
        .collect(),
      free: (0..capacity).rev().collect(),
      by_poc: BTreeMap::new(),
      inflight: BTreeMap::new(),
      pool,
      stats: ReferenceStats::default(),
    }
  }

  /// A table and pool sized for `enc`.
  pub fn for_config(enc: &EncoderConfig) -> Self {
    Self::new(
      enc.limits().reference_table,
      PictureBufferPool::for_config(enc),
    )
  }

  /// Counters.
  pub const fn stats(&self) -> ReferenceStats {
    self.stats
  }

  /// The buffer pool.
  pub const fn pool(&self) -> &PictureBufferPool<T> {
    &self.pool
  }

  /// Live entries.
  pub fn len(&self) -> usize {
    self.by_poc.len()
  }

  /// Whether no entry is live.
  pub fn is_empty(&self) -> bool {
    self.by_poc.is_empty()
  }

  /// Pictures admitted and not reported yet.
  pub fn inflight(&self) -> usize {
    self.inflight.len()
  }

  /// Number of recorded dependents of the entry of `poc`.
  pub fn dependent_count(&self, poc: u64) -> Option<usize> {
    self.entry_by_poc(poc).map(|e| e.dependents.len())
  }

  /// Whether the reconstruction of `poc` is complete.
  pub fn is_reconstructed(&self, poc: u64) -> bool {
    self.entry_by_poc(poc).map_or(false, |e| e.reconstructed)
  }

  /// Buffer receiving the reconstruction of `poc`.
  pub fn reconstruction(&self, poc: u64) -> Option<Arc<PictureBuffer<T>>> {
    self.entry_by_poc(poc).map(|e| e.buffer.clone())
  }

  fn entry(&self, id: RefId) -> Option<&Entry<T>> {
    let slot = self.slots.get(id.slot as usize)?;
    if slot.generation != id.generation {
      return None;
    }
    slot.entry.as_ref()
  }

  fn entry_mut(&mut self, id: RefId) -> Option<&mut Entry<T>> {
    let slot = self.slots.get_mut(id.slot as usize)?;
    if slot.generation != id.generation {
      return None;
    }
    slot.entry.as_mut()
  }

  fn entry_by_poc(&self, poc: u64) -> Option<&Entry<T>> {
    self.by_poc.get(&poc).and_then(|&id| self.entry(id))
  }

  fn release(&mut self, id: RefId) {
    let slot = &mut self.slots[id.slot as usize];
    if slot.generation != id.generation {
      return;
    }
    let Some(entry) = slot.entry.take() else {
      return;
    };
    slot.generation = slot.generation.wrapping_add(1);
    self.free.push(id.slot as usize);
    self.by_poc.remove(&entry.poc);
    self.stats.released += 1;
    if !entry.ledger.is_balanced() {
      self.stats.unbalanced += 1;
      log::warn!(
        "reference {} released with an unbalanced ledger {:?}",
        entry.poc,
        entry.ledger
      );
    }
    log::trace!("released reference {}", entry.poc);
  }

  /// Removes the dependents selected by `retract` from every entry and
  /// releases the entries left without dependents.
  fn retract_where(
    &mut self, mut retract: impl FnMut(&Entry<T>, u64) -> bool,
  ) -> u64 {
    let mut total = 0;
    let ids: Vec<RefId> = self.by_poc.values().copied().collect();
    for id in ids {
      let Some(entry) = self.entry_mut(id) else {
        continue;
      };
      let gone: Vec<u64> = entry
        .dependents
        .iter()
        .copied()
        .filter(|&poc| retract(entry, poc))
        .collect();
      if gone.is_empty() {
        continue;
      }
      for poc in &gone {
        entry.dependents.remove(poc);
      }
      entry.ledger.retracted += gone.len();
      log::debug!(
        "retracted dependents {:?} of reference {}",
        gone,
        entry.poc
      );
      total += gone.len() as u64;
      if entry.dependents.is_empty() {
        self.release(id);
      }
    }
    total
  }

  /// Records a decided picture.
  ///
  /// The dependents planned by earlier decisions are reconciled against the
  /// actual references of `d`, then an entry is created for `d` if anything
  /// is expected to reference it.
  ///
  /// # Errors
  ///
  /// Returns `ReferenceNotFound` if `d` references a picture without an
  /// entry and `ResourceExhausted` if the table or the pool is full.
  pub fn admit(
    &mut self, d: &mut PictureDescriptor,
  ) -> Result<(), SchedulerError> {
    let poc = d.poc;
    if d.picture_type == PictureType::IDR {
      let retracted = self.retract_where(|_, dep| dep >= poc);
      self.stats.amended += retracted;
    }
    let refs: ArrayVec<u64, { 2 * MAX_REFERENCES }> =
      d.references().collect();
    let retracted =
      self.retract_where(|e, dep| dep == poc && !refs.contains(&e.poc));
    self.stats.amended += retracted;

    d.ref_slots.clear();
    for &r in &refs {
      let id = *self
        .by_poc
        .get(&r)
        .ok_or(SchedulerError::ReferenceNotFound { poc, reference: r })?;
      let entry = self
        .entry_mut(id)
        .ok_or(SchedulerError::ReferenceNotFound { poc, reference: r })?;
      if entry.dependents.insert(poc) {
        entry.ledger.added += 1;
        self.stats.amended += 1;
        log::debug!("added unplanned dependent {} to reference {}", poc, r);
      }
      d.ref_slots.push(id);
    }
    self.inflight.insert(poc, d.ref_slots.clone());

    if d.dependents.is_empty() {
      return Ok(());
    }

    let slot = self
      .free
      .pop()
      .ok_or(SchedulerError::ResourceExhausted(Resource::ReferenceTable))?;
    let buffer = match self.pool.acquire() {
      Ok(buffer) => buffer,
      Err(e) => {
        self.free.push(slot);
        return Err(e);
      }
    };
    let dependents: BTreeSet<u64> = d.dependents.iter().copied().collect();
    let ledger = Ledger { admitted: dependents.len(), ..Default::default() };
    let id =
      RefId { slot: slot as u32, generation: self.slots[slot].generation };
    self.slots[slot].entry = Some(Entry {
      poc,
      temporal_layer: d.temporal_layer,
      dependents,
      reconstructed: false,
      buffer,
      ledger,
    });
    self.by_poc.insert(poc, id);
    self.stats.admitted += 1;
    self.stats.peak = self.stats.peak.max(self.by_poc.len());
    log::trace!(
      "admitted reference {} with dependents {:?}",
      poc,
      &d.dependents
    );
    Ok(())
  }

  /// Resolves the reference lists of `d`.
  ///
  /// # Errors
  ///
  /// Returns `ReferenceNotFound` if a reference has no live entry or does
  /// not list `d` as a dependent.
  pub fn build_ref_lists(
    &self, d: &PictureDescriptor,
  ) -> Result<ReferenceLists<T>, SchedulerError> {
    let resolve = |r: u64| -> Result<ReferencePicture<T>, SchedulerError> {
      let missing =
        SchedulerError::ReferenceNotFound { poc: d.poc, reference: r };
      let id = *self.by_poc.get(&r).ok_or(missing)?;
      let entry = self.entry(id).ok_or(missing)?;
      if !entry.dependents.contains(&d.poc) {
        return Err(missing);
      }
      Ok(ReferencePicture {
        id,
        poc: r,
        temporal_layer: entry.temporal_layer,
        buffer: entry.buffer.clone(),
      })
    };

    let mut lists = ReferenceLists::default();
    for &r in &d.list0 {
      lists.list0.push(resolve(r)?);
    }
    for &r in &d.list1 {
      lists.list1.push(resolve(r)?);
    }
    Ok(lists)
  }

  /// Records that `poc` was encoded and its reconstruction is complete.
  ///
  /// # Errors
  ///
  /// Returns `DependentCountUnderflow` if `poc` was not admitted or is no
  /// longer a dependent of an entry it was counted in.
  pub fn on_picture_encoded(
    &mut self, poc: u64,
  ) -> Result<(), SchedulerError> {
    let unknown =
      SchedulerError::DependentCountUnderflow { poc, reference: None };
    let held = self.inflight.remove(&poc).ok_or(unknown)?;

    for id in held {
      let entry = self.entry_mut(id).ok_or(unknown)?;
      if !entry.dependents.remove(&poc) {
        return Err(SchedulerError::DependentCountUnderflow {
          poc,
          reference: Some(entry.poc),
        });
      }
      entry.ledger.decremented += 1;
      if entry.dependents.is_empty() {
        self.release(id);
      }
    }

    if let Some(&id) = self.by_poc.get(&poc) {
      if let Some(entry) = self.entry_mut(id) {
        entry.reconstructed = true;
      }
    }
    Ok(())
  }

  /// Drops the dependents planned after the last picture of the stream.
  pub fn end_of_stream(&mut self, last_poc: Option<u64>) {
    let retracted = match last_poc {
      Some(last) => self.retract_where(|_, poc| poc > last),
      None => self.retract_where(|_, _| true),
    };
    self.stats.truncated += retracted;
  }

  /// Releases every entry regardless of its dependents.
  ///
  /// Returns the number of entries released.
  pub fn force_release_all(&mut self) -> usize {
    if !self.inflight.is_empty() {
      log::warn!(
        "{} pictures were never reported encoded",
        self.inflight.len()
      );
      self.inflight.clear();
    }
    let ids: Vec<RefId> = self.by_poc.values().copied().collect();
    for &id in &ids {
      if let Some(entry) = self.entry_mut(id) {
        let left = entry.dependents.len();
        if left > 0 {
          log::warn!(
            "forcing release of reference {} with {} dependents {:?}",
            entry.poc,
            left,
            entry.dependents
          );
          entry.ledger.retracted += left;
          entry.dependents.clear();
          self.stats.forced += 1;
        }
      }
      self.release(id);
    }
    ids.len()
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::api::PredStructure;
  use crate::decision::{PictureDecisionEngine, PictureInput};
  use crate::rate::IntervalKey;
  use quickcheck::quickcheck;
  use rand::{Rng, SeedableRng};
  use rand_chacha::ChaCha8Rng;
  use v_frame::pixel::ChromaSampling;

  fn scheduler(capacity: usize) -> ReferenceScheduler<u8> {
    let pool = PictureBufferPool::new(16, 16, ChromaSampling::Cs420, capacity);
    ReferenceScheduler::new(capacity, pool)
  }

  fn descriptor(
    poc: u64, picture_type: PictureType, list0: &[u64], dependents: &[u64],
  ) -> PictureDescriptor {
    PictureDescriptor {
      id: poc,
      poc,
      pts: poc,
      picture_type,
      temporal_layer: 0,
      structure: PredStructure::LowDelayP,
      mini_gop: poc,
      mini_gop_position: 0,
      list0: list0.iter().copied().collect(),
      list1: ArrayVec::new(),
      dependents: dependents.to_vec(),
      interval: IntervalKey::default(),
      interval_len: 1,
      qp_override: None,
      ref_slots: ArrayVec::new(),
    }
  }

  #[test]
  fn two_descendants_share_a_reference() {
    let mut refs = scheduler(4);
    let mut i = descriptor(0, PictureType::IDR, &[], &[1, 2]);
    let mut a = descriptor(1, PictureType::NON_REF, &[0], &[]);
    let mut b = descriptor(2, PictureType::NON_REF, &[0], &[]);
    refs.admit(&mut i).unwrap();
    refs.admit(&mut a).unwrap();
    refs.admit(&mut b).unwrap();
    refs.on_picture_encoded(0).unwrap();

    let la = refs.build_ref_lists(&a).unwrap();
    let lb = refs.build_ref_lists(&b).unwrap();
    assert_eq!(la.list0[0].buffer.index(), lb.list0[0].buffer.index());
    assert_eq!(refs.dependent_count(0), Some(2));

    refs.on_picture_encoded(1).unwrap();
    assert_eq!(refs.dependent_count(0), Some(1));
    refs.on_picture_encoded(2).unwrap();
    assert_eq!(refs.dependent_count(0), None);
    // the lists still hold the buffer
    assert_eq!(refs.pool().available(), 3);
    drop(la);
    drop(lb);
    assert_eq!(refs.pool().available(), 4);

    let stats = refs.stats();
    assert_eq!(stats.admitted, 1);
    assert_eq!(stats.released, 1);
    assert_eq!(stats.amended, 0);
    assert_eq!(stats.unbalanced, 0);
  }

  #[test]
  fn unknown_picture_underflows() {
    let mut refs = scheduler(2);
    assert_eq!(
      refs.on_picture_encoded(7),
      Err(SchedulerError::DependentCountUnderflow { poc: 7, reference: None })
    );
    let mut i = descriptor(0, PictureType::IDR, &[], &[1]);
    refs.admit(&mut i).unwrap();
    refs.on_picture_encoded(0).unwrap();
    assert!(refs.on_picture_encoded(0).is_err());
  }

  #[test]
  fn missing_reference() {
    let mut refs = scheduler(2);
    let mut p = descriptor(3, PictureType::P, &[2], &[]);
    assert_eq!(
      refs.admit(&mut p),
      Err(SchedulerError::ReferenceNotFound { poc: 3, reference: 2 })
    );
  }

  #[test]
  fn table_exhaustion() {
    let pool = PictureBufferPool::new(16, 16, ChromaSampling::Cs420, 4);
    let mut refs = ReferenceScheduler::<u8>::new(1, pool);
    refs.admit(&mut descriptor(0, PictureType::IDR, &[], &[1])).unwrap();
    assert_eq!(
      refs.admit(&mut descriptor(1, PictureType::P, &[0], &[2])),
      Err(SchedulerError::ResourceExhausted(Resource::ReferenceTable))
    );

    let pool = PictureBufferPool::new(16, 16, ChromaSampling::Cs420, 0);
    let mut refs = ReferenceScheduler::<u8>::new(1, pool);
    assert_eq!(
      refs.admit(&mut descriptor(0, PictureType::IDR, &[], &[1])),
      Err(SchedulerError::ResourceExhausted(Resource::BufferPool))
    );
  }

  #[test]
  fn idr_retracts_later_dependents() {
    let mut refs = scheduler(4);
    refs.admit(&mut descriptor(0, PictureType::IDR, &[], &[1, 2, 3])).unwrap();
    refs.admit(&mut descriptor(1, PictureType::P, &[0], &[])).unwrap();
    refs.admit(&mut descriptor(2, PictureType::IDR, &[], &[3])).unwrap();
    assert_eq!(refs.dependent_count(0), Some(1));
    refs.on_picture_encoded(0).unwrap();
    refs.on_picture_encoded(1).unwrap();
    assert_eq!(refs.dependent_count(0), None);
    assert_eq!(refs.stats().amended, 2);
    assert_eq!(refs.stats().unbalanced, 0);
  }

  #[test]
  fn unplanned_reference_is_added() {
    let mut refs = scheduler(4);
    refs.admit(&mut descriptor(0, PictureType::IDR, &[], &[1])).unwrap();
    refs.admit(&mut descriptor(1, PictureType::P, &[0], &[2])).unwrap();
    // 2 was planned on 1 only
    let mut d = descriptor(2, PictureType::P, &[1, 0], &[]);
    refs.admit(&mut d).unwrap();
    assert_eq!(d.ref_slots.len(), 2);
    assert_eq!(refs.stats().amended, 1);
    for poc in 0..3 {
      refs.on_picture_encoded(poc).unwrap();
    }
    assert!(refs.is_empty());
    assert_eq!(refs.stats().unbalanced, 0);
  }

  #[test]
  fn forced_release_is_counted() {
    let mut refs = scheduler(2);
    refs.admit(&mut descriptor(0, PictureType::IDR, &[], &[1, 2])).unwrap();
    assert_eq!(refs.force_release_all(), 1);
    assert!(refs.is_empty());
    assert_eq!(refs.stats().forced, 1);
    assert_eq!(refs.pool().available(), 2);
  }

  fn drive(
    levels: u8, structure: PredStructure, period: i64, count: u64,
    cuts: &[u64], seed: u64,
  ) -> ReferenceStats {
    let mut enc = EncoderConfig::default();
    enc.width = 16;
    enc.height = 16;
    enc.hierarchical_levels = levels;
    enc.pred_structure = structure;
    enc.intra_period = period;
    let size = enc.mini_gop_size();
    let mut engine = PictureDecisionEngine::new(&enc);
    let mut refs = ReferenceScheduler::<u8>::for_config(&enc);
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut pending: Vec<PictureDescriptor> = Vec::new();

    let mut step = |decided: Vec<PictureDescriptor>,
                    refs: &mut ReferenceScheduler<u8>,
                    pending: &mut Vec<PictureDescriptor>| {
      for mut d in decided {
        refs.admit(&mut d).unwrap();
        refs.build_ref_lists(&d).unwrap();
        pending.push(d);
      }
      // report a random prefix, in coding order, keeping at most a
      // mini-GOP in flight
      let least = pending.len().saturating_sub(size);
      let n = rng.gen_range(least..=pending.len());
      for d in pending.drain(..n) {
        refs.on_picture_encoded(d.poc).unwrap();
      }
    };

    for poc in 0..count {
      let input =
        PictureInput { pts: poc, scene_cut: cuts.contains(&poc), qp: None };
      engine.accept(input).unwrap();
      step(engine.decide(), &mut refs, &mut pending);
    }
    engine.end_of_stream();
    let tail = engine.decide();
    refs.end_of_stream(engine.last_poc());
    step(tail, &mut refs, &mut pending);
    for d in pending.drain(..) {
      refs.on_picture_encoded(d.poc).unwrap();
    }
    assert!(refs.is_empty(), "{} entries stranded", refs.len());
    assert_eq!(refs.pool().available(), refs.pool().capacity());
    refs.stats()
  }

  #[test]
  fn three_pictures_leave_nothing_behind() {
    let stats = drive(2, PredStructure::RandomAccess, -1, 3, &[], 0);
    assert_eq!(stats.forced, 0);
    assert_eq!(stats.unbalanced, 0);
  }

  #[test]
  fn steady_stream_needs_no_amendment() {
    for structure in [
      PredStructure::RandomAccess,
      PredStructure::LowDelayP,
      PredStructure::LowDelayB,
    ] {
      // 48 pictures at depth 3 end on a mini-GOP boundary
      let stats = drive(3, structure, 15, 48, &[], 1);
      assert_eq!(stats.amended, 0, "{:?}", structure);
      assert_eq!(stats.unbalanced, 0);
    }
  }

  quickcheck! {
    fn ledger_balances(
      levels: u8, seed: u64, count: u16, period: i8, cut: u8
    ) -> bool {
      let structure = match seed % 3 {
        0 => PredStructure::RandomAccess,
        1 => PredStructure::LowDelayP,
        _ => PredStructure::LowDelayB,
      };
      let levels = levels % 6;
      let period = (period as i64 % 40).max(-2);
      let stats = drive(
        levels, structure, period, (count % 150) as u64, &[cut as u64], seed,
      );
      stats.unbalanced == 0 && stats.forced == 0
        && stats.admitted == stats.released
    }
  }
}
