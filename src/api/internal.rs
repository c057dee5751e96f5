// Copyright (c) 2018-2025, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.
#![deny(missing_docs)]

use crate::api::config::{EncoderConfig, Limits, RateControlConfig};
use crate::api::util::*;
use crate::decision::{PictureDecisionEngine, PictureDescriptor, PictureInput};
use crate::rate::RateControlCoordinator;
use crate::reference::ReferenceScheduler;
use crate::stats::EncodeStats;

use v_frame::frame::Frame;
use v_frame::pixel::Pixel;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// Source samples and user data of an accepted picture.
struct SourcePicture<T: Pixel> {
  frame: Arc<Frame<T>>,
  opaque: Option<Opaque>,
}

/// Wires the decision engine, the reference scheduler and rate control
/// together.
pub(crate) struct ContextInner<T: Pixel> {
  pub(crate) config: EncoderConfig,
  limits: Limits,
  engine: PictureDecisionEngine,
  refs: ReferenceScheduler<T>,
  rate: RateControlCoordinator,
  /// Accepted pictures by POC, until their job is handed out.
  frame_q: BTreeMap<u64, SourcePicture<T>>,
  /// Admitted descriptors in coding order.
  coding_q: VecDeque<PictureDescriptor>,
  /// Descriptors of the jobs handed out, by decode order id.
  inflight: BTreeMap<u64, PictureDescriptor>,
  failure: Option<SchedulerError>,
  finished: bool,
  stats: EncodeStats,
}

impl<T: Pixel> ContextInner<T> {
  pub fn new(enc: &EncoderConfig, rc: &RateControlConfig) -> Self {
    ContextInner {
      config: *enc,
      limits: enc.limits(),
      engine: PictureDecisionEngine::new(enc),
      refs: ReferenceScheduler::for_config(enc),
      rate: RateControlCoordinator::new(enc, rc),
      frame_q: BTreeMap::new(),
      coding_q: VecDeque::new(),
      inflight: BTreeMap::new(),
      failure: None,
      finished: false,
      stats: EncodeStats::default(),
    }
  }

  /// Pictures accepted and not reported yet.
  pub(crate) fn backlog(&self) -> usize {
    self.engine.pending() as usize + self.coding_q.len() + self.inflight.len()
  }

  pub(crate) const fn limits(&self) -> &Limits {
    &self.limits
  }

  /// Jobs handed out and not reported yet.
  pub(crate) fn inflight(&self) -> usize {
    self.inflight.len()
  }

  pub(crate) const fn is_finished(&self) -> bool {
    self.finished
  }

  #[cfg(test)]
  pub(crate) fn open_intervals(&self) -> usize {
    self.rate.open_intervals()
  }

  pub(crate) fn stats(&self) -> EncodeStats {
    let mut stats = self.stats.clone();
    stats.reference = self.refs.stats();
    stats.pool = self.refs.pool().stats();
    stats
  }

  /// Logs `err` and makes it the sticky state of the context.
  pub(crate) fn fail(&mut self, err: SchedulerError) -> EncoderStatus {
    log::error!("[{:#06x}] {}", err.code(), err);
    let err = *self.failure.get_or_insert(err);
    EncoderStatus::Failure(err)
  }

  fn check(&self) -> Result<(), EncoderStatus> {
    match self.failure {
      Some(err) => Err(EncoderStatus::Failure(err)),
      None => Ok(()),
    }
  }

  /// Accepts the next picture in display order, `None` ends the stream.
  pub fn send_picture(
    &mut self, frame: Option<Arc<Frame<T>>>, params: Option<PictureParameters>,
  ) -> Result<(), EncoderStatus> {
    self.check()?;

    let Some(frame) = frame else {
      self.engine.end_of_stream();
      return self.admit_decided().map_err(|e| self.fail(e));
    };

    if self.engine.is_flushing() || self.backlog() >= self.limits.backlog {
      return Err(EncoderStatus::EnoughData);
    }

    let params = params.unwrap_or_default();
    let input = PictureInput {
      pts: params.pts.unwrap_or_else(|| self.engine.accepted()),
      scene_cut: params.scene_cut,
      qp: params.qp,
    };
    let poc = self.engine.accept(input).map_err(|e| self.fail(e))?;
    self
      .frame_q
      .insert(poc, SourcePicture { frame, opaque: params.opaque });

    self.admit_decided().map_err(|e| self.fail(e))
  }

  /// Admits every descriptor the engine can decide now.
  fn admit_decided(&mut self) -> Result<(), SchedulerError> {
    for mut d in self.engine.decide() {
      self.refs.admit(&mut d)?;
      self.rate.open_interval(d.interval, d.interval_len);
      log::debug!(
        "picture {}: {} in mini-GOP {} layer {}, list0 {:?} list1 {:?}",
        d.poc,
        d.picture_type,
        d.mini_gop,
        d.temporal_layer,
        d.list0,
        d.list1
      );
      self.coding_q.push_back(d);
    }
    for (key, count) in self.engine.take_truncated() {
      self.rate.truncate_interval(key, count);
    }
    if self.engine.is_flushing() {
      self.refs.end_of_stream(self.engine.last_poc());
    }
    Ok(())
  }

  /// Hands out the next job in coding order.
  ///
  /// Returns `NotReady` while a reference of the next picture has not been
  /// reported encoded.
  pub fn receive_job(&mut self) -> Result<EncodeJob<T>, EncoderStatus> {
    self.check()?;

    // A reference without an entry is left to fail in `build_ref_lists`.
    let ready = match self.coding_q.front() {
      Some(d) => d.references().all(|r| {
        self.refs.dependent_count(r).is_none() || self.refs.is_reconstructed(r)
      }),
      None => return Err(self.idle_status()),
    };
    if !ready {
      return Err(EncoderStatus::NotReady);
    }

    let d = self.coding_q.pop_front().ok_or(EncoderStatus::NeedMoreData)?;
    self.dispatch(d).map_err(|e| self.fail(e))
  }

  fn dispatch(
    &mut self, d: PictureDescriptor,
  ) -> Result<EncodeJob<T>, SchedulerError> {
    let references = self.refs.build_ref_lists(&d)?;
    let qp = self.rate.qp_for_picture(&d)?;
    // the source stands in for the picture's own entry
    let missing =
      SchedulerError::ReferenceNotFound { poc: d.poc, reference: d.poc };
    let source = self.frame_q.remove(&d.poc).ok_or(missing)?;
    let reconstruction = self.refs.reconstruction(d.poc);

    log::trace!("dispatching picture {} at qp {}", d.poc, qp);
    self.inflight.insert(d.id, d.clone());

    Ok(EncodeJob {
      descriptor: d,
      source: source.frame,
      references,
      qp,
      reconstruction,
      opaque: source.opaque,
    })
  }

  fn idle_status(&mut self) -> EncoderStatus {
    if !self.engine.is_flushing() {
      return EncoderStatus::NeedMoreData;
    }
    if !self.inflight.is_empty() {
      return EncoderStatus::NotReady;
    }
    if !self.finished {
      self.finish();
    }
    EncoderStatus::LimitReached
  }

  fn finish(&mut self) {
    self.stats.stale_intervals = self.rate.end_of_stream();
    let forced = self.refs.force_release_all();
    if forced > 0 {
      log::debug!("released {} references left at end of stream", forced);
    }
    self.frame_q.clear();
    self.finished = true;
  }

  /// Closes the loop for a coded picture.
  pub fn report_encoded(
    &mut self, feedback: PictureFeedback,
  ) -> Result<CodedPicture, EncoderStatus> {
    self.check()?;
    self.complete(feedback).map_err(|e| self.fail(e))
  }

  fn complete(
    &mut self, feedback: PictureFeedback,
  ) -> Result<CodedPicture, SchedulerError> {
    let PictureFeedback { id, byte_count, qp } = feedback;
    let unknown =
      SchedulerError::DependentCountUnderflow { poc: id, reference: None };
    let d = self.inflight.remove(&id).ok_or(unknown)?;

    self.rate.report_encoded(&d, byte_count, qp)?;
    self.refs.on_picture_encoded(d.poc)?;
    self.stats.record(&d, byte_count, qp);

    Ok(CodedPicture {
      id: d.id,
      poc: d.poc,
      pts: d.pts,
      picture_type: d.picture_type,
      temporal_layer: d.temporal_layer,
      qp,
      byte_count,
      list0: d.list0.to_vec(),
      list1: d.list1.to_vec(),
      opaque: None,
    })
  }
}
