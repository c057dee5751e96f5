// Copyright (c) 2018-2025, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use crate::api::config::EncoderConfig;
use crate::api::util::*;
use crate::stats::EncodeStats;

use crossbeam::channel::{Receiver, Sender};
use thiserror::Error;
use v_frame::frame::Frame;
use v_frame::pixel::Pixel;

use std::fmt;
use std::sync::Arc;

/// An error returned from the `send` methods.
///
/// The message could not be sent because the channel is disconnected.
///
/// The error contains the message so it can be recovered.
#[derive(PartialEq, Eq, Clone, Copy, Error)]
#[error("sending on a disconnected channel")]
pub struct SendError<T>(pub T);

/// An error returned from the `try_send` methods.
///
/// The error contains the message being sent so it can be recovered.
#[derive(PartialEq, Eq, Clone, Copy, Error)]
pub enum TrySendError<T> {
  /// The message could not be sent because the channel is full.
  #[error("sending on a full channel")]
  Full(T),

  /// The message could not be sent because the channel is disconnected.
  #[error("sending on a disconnected channel")]
  Disconnected(T),
}

impl<T> fmt::Debug for SendError<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad("SendError { .. }")
  }
}

impl<T> fmt::Debug for TrySendError<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TrySendError::Full(_) => f.pad("Full(..)"),
      TrySendError::Disconnected(_) => f.pad("Disconnected(..)"),
    }
  }
}

/// An error returned from the `recv` methods.
///
/// A message could not be received because the channel is empty and
/// disconnected.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Error)]
#[error("receiving on an empty and disconnected channel")]
pub struct RecvError;

/// An error returned from the `try_recv` methods.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Error)]
pub enum TryRecvError {
  /// A message could not be received because the channel is empty.
  #[error("receiving on an empty channel")]
  Empty,

  /// The message could not be received because the channel is empty and
  /// disconnected.
  #[error("receiving on an empty and disconnected channel")]
  Disconnected,
}

impl<T> SendError<T> {
  fn from(value: crossbeam::channel::SendError<T>) -> Self {
    Self(value.0)
  }
}

impl<T> TrySendError<T> {
  fn from(value: crossbeam::channel::TrySendError<T>) -> Self {
    use crossbeam::channel::TrySendError::*;
    match value {
      Full(v) => TrySendError::Full(v),
      Disconnected(v) => TrySendError::Disconnected(v),
    }
  }
}

impl RecvError {
  fn from(_: crossbeam::channel::RecvError) -> Self {
    RecvError
  }
}

impl TryRecvError {
  fn from(value: crossbeam::channel::TryRecvError) -> Self {
    use crossbeam::channel::TryRecvError::*;
    match value {
      Empty => TryRecvError::Empty,
      Disconnected => TryRecvError::Disconnected,
    }
  }
}

/// A picture and its parameters, `None` ends the stream.
pub type PictureInput<T> = (Option<Arc<Frame<T>>>, Option<PictureParameters>);

/// How a channel ended.
pub type ChannelOutcome = Result<EncodeStats, EncoderStatus>;

/// Endpoint to send pictures
pub struct PictureSender<T: Pixel> {
  sender: Sender<PictureInput<T>>,
  config: Arc<EncoderConfig>,
}

// Proxy the crossbeam Sender
impl<T: Pixel> PictureSender<T> {
  pub(crate) fn new(
    sender: Sender<PictureInput<T>>, config: Arc<EncoderConfig>,
  ) -> PictureSender<T> {
    Self { sender, config }
  }

  /// # Errors
  ///
  /// - `TrySendError::Full` if the message could not be sent because the
  ///   channel is full.
  /// - `TrySendError::Disconnected` if the message could not be sent
  ///   because the channel is disconnected.
  pub fn try_send<P: IntoPicture<T>>(
    &mut self, picture: P,
  ) -> Result<(), TrySendError<PictureInput<T>>> {
    self.sender.try_send(picture.into()).map_err(TrySendError::from)
  }

  /// Blocks while the input queue is full.
  ///
  /// # Errors
  ///
  /// - `SendError` if the message could not be sent because the channel is
  ///   disconnected, which happens once the channel failed.
  pub fn send<P: IntoPicture<T>>(
    &mut self, picture: P,
  ) -> Result<(), SendError<PictureInput<T>>> {
    self.sender.send(picture.into()).map_err(SendError::from)
  }

  pub fn len(&self) -> usize {
    self.sender.len()
  }

  pub fn is_empty(&self) -> bool {
    self.sender.is_empty()
  }

  /// Capacity of the input queue.
  pub fn capacity(&self) -> Option<usize> {
    self.sender.capacity()
  }
}

// Picture factory
impl<T: Pixel> PictureSender<T> {
  /// Helper to create a new picture with the current encoder configuration
  #[inline]
  pub fn new_picture(&self) -> Frame<T> {
    Frame::new_with_padding(
      self.config.width,
      self.config.height,
      self.config.chroma_sampling,
      0,
    )
  }
}

/// Endpoint to receive coded pictures, in coding order
pub struct CodedReceiver {
  pub(crate) receiver: Receiver<CodedPicture>,
  pub(crate) outcome: Receiver<ChannelOutcome>,
}

impl CodedReceiver {
  /// Attempts to receive a coded picture without blocking.
  ///
  /// # Errors
  ///
  /// - `TryRecvError::Empty` if the channel is currently empty.
  /// - `TryRecvError::Disconnected` if the channel is empty and has been
  ///   disconnected.
  pub fn try_recv(&self) -> Result<CodedPicture, TryRecvError> {
    self.receiver.try_recv().map_err(TryRecvError::from)
  }

  /// Blocks the current thread until a coded picture is received or the
  /// channel is empty and disconnected.
  ///
  /// # Errors
  ///
  /// - `RecvError` if the channel is empty and has been disconnected, at
  ///   the end of the stream or after a failure. [`finish`] tells the two
  ///   apart.
  ///
  /// [`finish`]: #method.finish
  pub fn recv(&self) -> Result<CodedPicture, RecvError> {
    self.receiver.recv().map_err(RecvError::from)
  }

  pub fn len(&self) -> usize {
    self.receiver.len()
  }

  pub fn is_empty(&self) -> bool {
    self.receiver.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = CodedPicture> + '_ {
    self.receiver.iter()
  }

  /// Waits for the channel to stop and returns its statistics.
  ///
  /// Coded pictures still queued are dropped.
  ///
  /// # Errors
  ///
  /// Returns the `Failure` that halted the channel, or `LimitReached` if
  /// it stopped without a report.
  pub fn finish(self) -> ChannelOutcome {
    drop(self.receiver);
    self.outcome.recv().unwrap_or(Err(EncoderStatus::LimitReached))
  }
}

/// A channel modeling a scheduling process
pub type VideoDataChannel<T> = (PictureSender<T>, CodedReceiver);
