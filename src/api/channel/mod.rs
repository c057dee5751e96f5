// Copyright (c) 2018-2025, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.
#![allow(missing_docs)]

use crate::api::config::*;
use crate::api::internal::ContextInner;
use crate::api::util::*;

use crossbeam::channel::*;
use rayon::ThreadPool;
use v_frame::pixel::Pixel;

use std::collections::BTreeMap;
use std::sync::Arc;

mod data;
pub use data::{
  ChannelOutcome, CodedReceiver, PictureInput, PictureSender, RecvError,
  SendError, TryRecvError, TrySendError, VideoDataChannel,
};

/// What a worker hands back for a job.
type WorkerReport =
  Result<(PictureFeedback, Option<Opaque>), (u64, EncodeError)>;

impl Config {
  fn new_thread_pool(&self) -> Result<ThreadPool, InvalidConfig> {
    let threads = self.workers() + 1;
    rayon::ThreadPoolBuilder::new()
      .num_threads(threads)
      .thread_name(|idx| format!("picsched-{}", idx))
      .build()
      .map_err(|e| {
        log::error!("{}", e);
        InvalidConfig::ThreadPoolUnavailable(threads)
      })
  }

  /// Create a scheduling channel running `encoder` on its workers
  ///
  /// Every worker owns a clone of `encoder`. Each call creates an
  /// independent channel with its own threads and state, so a failure
  /// only halts the channel it happens in.
  ///
  /// Drop the `PictureSender<T>` endpoint to flush the channel.
  ///
  /// # Errors
  ///
  /// - Returns `InvalidConfig` if the configuration is invalid or the
  ///   thread pool cannot be started.
  pub fn new_channel<T, E>(
    &self, encoder: E,
  ) -> Result<VideoDataChannel<T>, InvalidConfig>
  where
    T: Pixel,
    E: PictureEncoder<T> + Clone + 'static,
  {
    let inner = self.new_inner::<T>()?;
    let pool = self.new_thread_pool()?;
    let workers = self.workers();
    let limits = *inner.limits();

    let (send_picture, receive_picture) = bounded(limits.backlog);
    let (send_job, receive_job) = bounded::<EncodeJob<T>>(workers);
    let (send_report, receive_report) = unbounded::<WorkerReport>();
    let (send_coded, receive_coded) = unbounded();
    let (send_outcome, receive_outcome) = bounded(1);

    let config = Arc::new(self.enc);
    let channel = (
      PictureSender::new(send_picture, config),
      CodedReceiver { receiver: receive_coded, outcome: receive_outcome },
    );

    for _ in 0..workers {
      let jobs = receive_job.clone();
      let reports = send_report.clone();
      let mut encoder = encoder.clone();
      pool.spawn(move || {
        for mut job in jobs.iter() {
          let report = match encoder.encode(&job) {
            Ok(feedback) => Ok((feedback, job.opaque.take())),
            Err(e) => Err((job.descriptor.id, e)),
          };
          // the references go back before the feedback is seen
          drop(job);
          if reports.send(report).is_err() {
            break;
          }
        }
      });
    }
    drop(receive_job);
    drop(send_report);

    let mut coordinator = Coordinator {
      inner,
      input: receive_picture,
      input_open: true,
      jobs: send_job,
      reports: receive_report,
      output: send_coded,
      reorder: BTreeMap::new(),
      next_id: 0,
    };
    pool.spawn(move || {
      let outcome = match coordinator.run() {
        Ok(()) => Ok(coordinator.inner.stats()),
        Err(e) => Err(e),
      };
      // stop the workers before reporting
      drop(coordinator);
      let _ = send_outcome.send(outcome);
    });

    Ok(channel)
  }
}

/// Owns the scheduling state of a channel and feeds its workers.
struct Coordinator<T: Pixel> {
  inner: ContextInner<T>,
  input: Receiver<PictureInput<T>>,
  input_open: bool,
  jobs: Sender<EncodeJob<T>>,
  reports: Receiver<WorkerReport>,
  output: Sender<CodedPicture>,
  /// Coded pictures waiting for an earlier one, by id.
  reorder: BTreeMap<u64, CodedPicture>,
  next_id: u64,
}

impl<T: Pixel> Coordinator<T> {
  fn run(&mut self) -> Result<(), EncoderStatus> {
    let reports = self.reports.clone();
    loop {
      self.dispatch()?;
      if self.inner.is_finished() {
        return Ok(());
      }

      let accepting = self.input_open
        && self.inner.backlog() < self.inner.limits().backlog;
      let input = if accepting { self.input.clone() } else { never() };

      select! {
        recv(reports) -> msg => match msg {
          Ok(report) => self.complete(report)?,
          Err(_) => {
            let id = self.next_id;
            return Err(self.inner.fail(SchedulerError::EncodeFailed { id }));
          }
        },
        recv(input) -> msg => match msg {
          Ok((Some(picture), params)) => {
            self.inner.send_picture(Some(picture), params)?
          }
          Ok((None, _)) | Err(_) => {
            log::debug!("end of stream");
            self.input_open = false;
            self.inner.send_picture(None, None)?;
          }
        },
      }
    }
  }

  /// Hands out every job that can run now.
  fn dispatch(&mut self) -> Result<(), EncoderStatus> {
    loop {
      match self.inner.receive_job() {
        Ok(job) => {
          let id = job.descriptor.id;
          if self.jobs.send(job).is_err() {
            return Err(self.inner.fail(SchedulerError::EncodeFailed { id }));
          }
        }
        Err(EncoderStatus::NeedMoreData)
        | Err(EncoderStatus::NotReady)
        | Err(EncoderStatus::LimitReached) => return Ok(()),
        Err(e) => return Err(e),
      }
    }
  }

  fn complete(&mut self, report: WorkerReport) -> Result<(), EncoderStatus> {
    let (feedback, opaque) = match report {
      Ok(done) => done,
      Err((id, err)) => {
        log::error!("picture {}: {}", id, err);
        return Err(self.inner.fail(SchedulerError::EncodeFailed { id }));
      }
    };
    let mut coded = self.inner.report_encoded(feedback)?;
    coded.opaque = opaque;
    self.reorder.insert(coded.id, coded);

    while let Some(coded) = self.reorder.remove(&self.next_id) {
      // the receiver may be gone already
      let _ = self.output.send(coded);
      self.next_id += 1;
    }
    Ok(())
  }
}
