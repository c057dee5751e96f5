// Copyright (c) 2018-2025, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.
#![deny(missing_docs)]

use crate::api::config::*;
use crate::api::internal::*;
use crate::api::util::*;
use crate::stats::EncodeStats;

use v_frame::frame::Frame;
use v_frame::pixel::Pixel;

use std::sync::Arc;

/// The scheduler context.
///
/// Contains the scheduling state of one stream.
pub struct Context<T: Pixel> {
  pub(crate) inner: ContextInner<T>,
  pub(crate) config: Config,
  pub(crate) is_flushing: bool,
}

impl<T: Pixel> Context<T> {
  /// Allocates and returns a new picture.
  ///
  /// # Examples
  ///
  /// ```
  /// use picsched::prelude::*;
  ///
  /// # fn main() -> Result<(), InvalidConfig> {
  /// let cfg = Config::default();
  /// let ctx: Context<u8> = cfg.new_context()?;
  /// let picture = ctx.new_picture();
  /// # Ok(())
  /// # }
  /// ```
  #[inline]
  pub fn new_picture(&self) -> Frame<T> {
    let enc = &self.config.enc;
    Frame::new_with_padding(enc.width, enc.height, enc.chroma_sampling, 0)
  }

  /// Sends the next picture in display order.
  ///
  /// The picture goes through the reorder queue and every descriptor it
  /// completes is admitted to the reference table.
  ///
  /// Passing `None` is equivalent to calling [`flush`].
  ///
  /// # Errors
  ///
  /// Returns [`EncoderStatus::EnoughData`] after a flush, or while twice a
  /// mini-GOP of pictures wait to be received and reported. Scheduling
  /// errors are returned as [`EncoderStatus::Failure`].
  ///
  /// # Examples
  ///
  /// ```
  /// use picsched::prelude::*;
  ///
  /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
  /// let cfg = Config::default();
  /// let mut ctx: Context<u8> = cfg.new_context()?;
  /// let p1 = ctx.new_picture();
  /// let p2 = p1.clone();
  /// let info = PictureParameters { scene_cut: true, ..Default::default() };
  ///
  /// // Send the plain samples
  /// ctx.send_picture(p1)?;
  /// // Send the samples and the per-picture parameters
  /// ctx.send_picture((p2, info))?;
  /// // Flush, it is equivalent to a call to `flush()`
  /// ctx.send_picture(None)?;
  /// # Ok(())
  /// # }
  /// ```
  ///
  /// [`flush`]: #method.flush
  #[inline]
  pub fn send_picture<P>(&mut self, picture: P) -> Result<(), EncoderStatus>
  where
    P: IntoPicture<T>,
  {
    let (picture, params) = picture.into();

    if picture.is_none() {
      if self.is_flushing {
        return Ok(());
      }
      self.is_flushing = true;
    } else if self.is_flushing {
      return Err(EncoderStatus::EnoughData);
    }

    self.inner.send_picture(picture, params)
  }

  /// Returns the next job in coding order.
  ///
  /// # Errors
  ///
  /// - [`EncoderStatus::NeedMoreData`] while the current mini-GOP fills.
  /// - [`EncoderStatus::NotReady`] until the references of the next
  ///   picture are reported with [`report_encoded`].
  /// - [`EncoderStatus::LimitReached`] once every picture of a flushed
  ///   stream has been handed out and reported.
  /// - [`EncoderStatus::Failure`] on a scheduling error.
  ///
  /// # Examples
  ///
  /// ```
  /// use picsched::prelude::*;
  ///
  /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
  /// let enc = EncoderConfig { width: 16, height: 16, ..Default::default() };
  /// let cfg = Config::new().with_encoder_config(enc);
  /// let mut ctx: Context<u8> = cfg.new_context()?;
  /// for _ in 0..3 {
  ///   ctx.send_picture(ctx.new_picture())?;
  /// }
  /// ctx.flush();
  ///
  /// loop {
  ///   match ctx.receive_job() {
  ///     Ok(job) => {
  ///       // Hand the job to the encode stages, then close the loop.
  ///       let coded = ctx.report_encoded(job.feedback(1000, job.qp))?;
  ///       println!("{}", coded);
  ///     }
  ///     Err(EncoderStatus::LimitReached) => break,
  ///     Err(err) => Err(err)?,
  ///   }
  /// }
  /// # Ok(())
  /// # }
  /// ```
  ///
  /// [`report_encoded`]: #method.report_encoded
  #[inline]
  pub fn receive_job(&mut self) -> Result<EncodeJob<T>, EncoderStatus> {
    self.inner.receive_job()
  }

  /// Reports the outcome of a job.
  ///
  /// Rate control accounts for the bytes and the references of the picture
  /// lose it as a dependent.
  ///
  /// # Errors
  ///
  /// Returns [`EncoderStatus::Failure`] for an unknown job or a broken
  /// reference ledger.
  #[inline]
  pub fn report_encoded(
    &mut self, feedback: PictureFeedback,
  ) -> Result<CodedPicture, EncoderStatus> {
    self.inner.report_encoded(feedback)
  }

  /// Runs every job available now through `encoder`.
  ///
  /// Returns the coded pictures in coding order and stops when the
  /// scheduler needs more pictures or the stream is over.
  ///
  /// # Errors
  ///
  /// A failing `encoder` turns into `Failure(EncodeFailed)`.
  pub fn encode_with<E: PictureEncoder<T>>(
    &mut self, encoder: &mut E,
  ) -> Result<Vec<CodedPicture>, EncoderStatus> {
    let mut coded = Vec::new();
    loop {
      let mut job = match self.receive_job() {
        Ok(job) => job,
        Err(EncoderStatus::NeedMoreData)
        | Err(EncoderStatus::NotReady)
        | Err(EncoderStatus::LimitReached) => return Ok(coded),
        Err(err) => return Err(err),
      };
      let feedback = match encoder.encode(&job) {
        Ok(feedback) => feedback,
        Err(err) => {
          log::error!("picture {}: {}", job.descriptor.poc, err);
          let id = job.descriptor.id;
          return Err(self.inner.fail(SchedulerError::EncodeFailed { id }));
        }
      };
      let mut picture = self.report_encoded(feedback)?;
      picture.opaque = job.opaque.take();
      coded.push(picture);
    }
  }

  /// Flushes the scheduler.
  ///
  /// Flushing signals the end of the stream: the partial mini-GOP is
  /// decided and no more pictures are accepted. A failure raised while
  /// deciding the tail is returned by the next call.
  #[inline]
  pub fn flush(&mut self) {
    let _ = self.send_picture(None::<Arc<Frame<T>>>);
  }

  /// Statistics of the pictures reported so far.
  #[inline]
  pub fn stats(&self) -> EncodeStats {
    self.inner.stats()
  }

  /// The configuration of the context.
  #[inline]
  pub const fn config(&self) -> &Config {
    &self.config
  }
}
