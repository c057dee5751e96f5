// Copyright (c) 2018-2025, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.
#![deny(missing_docs)]

use crate::decision::PictureDescriptor;
use crate::pool::PictureBuffer;
use crate::reference::ReferenceLists;
use crate::serialize::{Deserialize, Serialize};

use v_frame::frame::Frame;
use v_frame::pixel::Pixel;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use thiserror::*;

/// Opaque type to be passed from a picture to its coded output
#[derive(Debug)]
pub struct Opaque(Box<dyn Any + Send + Sync>);

impl Opaque {
  /// Wrap a type in the opaque struct
  pub fn new<T: Any + Send + Sync>(t: T) -> Self {
    Opaque(Box::new(t) as Box<dyn Any + Send + Sync>)
  }

  /// Attempt to downcast the opaque to a concrete type.
  ///
  /// # Errors
  ///
  /// Returns `Err(Self)` if the value could not be downcast to `T`.
  pub fn downcast<T: Any + Send + Sync>(self) -> Result<Box<T>, Opaque> {
    if self.0.is::<T>() {
      self.0.downcast::<T>().map_err(Opaque)
    } else {
      Err(self)
    }
  }
}

/// A rational number.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct Rational {
  /// Numerator.
  pub num: u64,
  /// Denominator.
  pub den: u64,
}

impl Rational {
  /// Creates a rational number from the given numerator and denominator.
  pub const fn new(num: u64, den: u64) -> Self {
    Rational { num, den }
  }

  /// Returns a rational number that is the reciprocal of the given one.
  pub const fn from_reciprocal(reciprocal: Self) -> Self {
    Rational { num: reciprocal.den, den: reciprocal.num }
  }

  /// Returns the rational number as a floating-point number.
  pub fn as_f64(self) -> f64 {
    self.num as f64 / self.den as f64
  }
}

#[cfg(feature = "serialize")]
impl serde::Serialize for Rational {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: serde::Serializer,
  {
    (self.num, self.den).serialize(serializer)
  }
}

#[cfg(feature = "serialize")]
impl<'a> serde::Deserialize<'a> for Rational {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: serde::Deserializer<'a>,
  {
    let (num, den) = serde::Deserialize::deserialize(deserializer)?;

    Ok(Rational::new(num, den))
  }
}

/// Possible types of a picture.
#[allow(non_camel_case_types)]
#[derive(
  Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Copy, Hash, Serialize,
  Deserialize,
)]
#[repr(C)]
pub enum PictureType {
  /// Instantaneous decoder refresh, every older reference is dropped.
  IDR,
  /// Intra picture that keeps the older references alive.
  I,
  /// Predicted from list0 only.
  P,
  /// Predicted from list0 and list1.
  B,
  /// Inter picture nothing else refers to.
  NON_REF,
}

impl PictureType {
  /// All the picture types, in the order they are reported.
  pub const ALL: [PictureType; 5] = [
    PictureType::IDR,
    PictureType::I,
    PictureType::P,
    PictureType::B,
    PictureType::NON_REF,
  ];

  /// Returns whether the picture only uses intra prediction
  #[inline]
  pub fn is_intra(self) -> bool {
    self == PictureType::IDR || self == PictureType::I
  }

  /// Returns whether other pictures may predict from this one
  #[inline]
  pub fn is_reference(self) -> bool {
    self != PictureType::NON_REF
  }
}

impl fmt::Display for PictureType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    use self::PictureType::*;
    match self {
      IDR => write!(f, "IDR picture"),
      I => write!(f, "Intra picture"),
      P => write!(f, "P picture"),
      B => write!(f, "B picture"),
      NON_REF => write!(f, "Non-reference picture"),
    }
  }
}

/// A bounded resource the scheduler ran out of.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Resource {
  /// The reference table has no free slot.
  ReferenceTable,
  /// The picture buffer pool has no free buffer.
  BufferPool,
}

impl fmt::Display for Resource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Resource::ReferenceTable => write!(f, "reference table"),
      Resource::BufferPool => write!(f, "picture buffer pool"),
    }
  }
}

/// Fatal scheduling errors.
///
/// All of them halt the channel they happen on; nothing is retried.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum SchedulerError {
  /// The reorder queue could not take another picture.
  #[error("reorder queue overflow on picture {poc} (capacity {capacity})")]
  QueueOverflow {
    /// Display order index of the rejected picture.
    poc: u64,
    /// Capacity of the reorder queue.
    capacity: usize,
  },
  /// A dependent was removed that had never been recorded.
  #[error("dependent count underflow on picture {poc}")]
  DependentCountUnderflow {
    /// Display order index of the reporting picture.
    poc: u64,
    /// Reference entry that did not expect the decrement, if known.
    reference: Option<u64>,
  },
  /// A picture asked for a reference that is not live.
  #[error("no reference match found for picture {poc} (reference {reference})")]
  ReferenceNotFound {
    /// Display order index of the referencing picture.
    poc: u64,
    /// Display order index of the missing reference.
    reference: u64,
  },
  /// Rate control was queried for an interval that was never opened.
  #[error(
    "rate control interval missing (mini-GOP {mini_gop}, layer {temporal_layer})"
  )]
  RateControlIntervalMissing {
    /// Mini-GOP index.
    mini_gop: u64,
    /// Temporal layer.
    temporal_layer: u8,
  },
  /// A bounded resource is full.
  #[error("{0} exhausted")]
  ResourceExhausted(Resource),
  /// The downstream encoder reported a failure.
  #[error("downstream encode of picture {id} failed")]
  EncodeFailed {
    /// Decode order id of the picture.
    id: u64,
  },
}

impl SchedulerError {
  /// Numeric code used when logging the error.
  pub const fn code(&self) -> u32 {
    use self::SchedulerError::*;
    match self {
      QueueOverflow { .. } => 0x2001,
      DependentCountUnderflow { .. } => 0x2002,
      ReferenceNotFound { .. } => 0x2003,
      RateControlIntervalMissing { .. } => 0x2004,
      ResourceExhausted(_) => 0x2005,
      EncodeFailed { .. } => 0x2006,
    }
  }
}

/// Status that can be returned by [`Context`] functions.
///
/// [`Context`]: struct.Context.html
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum EncoderStatus {
  /// The scheduler needs more pictures to produce the next job.
  ///
  /// May be emitted by [`Context::receive_job()`] while a mini-GOP is still
  /// being filled.
  ///
  /// [`Context::receive_job()`]: struct.Context.html#method.receive_job
  #[error("need more data")]
  NeedMoreData,
  /// There are enough pictures in the queue.
  ///
  /// May be emitted by [`Context::send_picture()`] after a flush, or when the
  /// coding-order backlog is full and jobs must be received first.
  ///
  /// [`Context::send_picture()`]: struct.Context.html#method.send_picture
  #[error("enough data")]
  EnoughData,
  /// Every picture has been scheduled and reported.
  #[error("limit reached")]
  LimitReached,
  /// The next job waits for the reconstruction of one of its references.
  #[error("not ready")]
  NotReady,
  /// Fatal scheduling error; the context cannot be used anymore.
  #[error("failure: {0}")]
  Failure(#[from] SchedulerError),
}

/// Per-picture parameters supplied alongside the samples.
#[derive(Debug, Default)]
pub struct PictureParameters {
  /// Presentation timestamp, defaults to the input index.
  pub pts: Option<u64>,
  /// Quantizer read from a QP file, used when `use_qp_file` is set.
  pub qp: Option<u8>,
  /// An external detector found a scene cut at this picture.
  pub scene_cut: bool,
  /// Optional user-provided opaque data
  pub opaque: Option<Opaque>,
}

/// Work item handed to the downstream encode stages.
///
/// Jobs are produced in coding order. The reference lists keep the
/// reconstructions they point at alive until the job is dropped.
#[derive(Debug)]
pub struct EncodeJob<T: Pixel> {
  /// The scheduling decisions for this picture.
  pub descriptor: PictureDescriptor,
  /// Source samples.
  pub source: Arc<Frame<T>>,
  /// Reference pictures, list0 then list1.
  pub references: ReferenceLists<T>,
  /// Target quantizer.
  pub qp: u8,
  /// Buffer the reconstruction must be written to, for reference pictures.
  pub reconstruction: Option<Arc<PictureBuffer<T>>>,
  /// Optional user-provided opaque data
  pub opaque: Option<Opaque>,
}

impl<T: Pixel> EncodeJob<T> {
  /// Builds the feedback record for this job.
  pub fn feedback(&self, byte_count: usize, qp: u8) -> PictureFeedback {
    PictureFeedback { id: self.descriptor.id, byte_count, qp }
  }
}

/// Post-encode statistics reported back to the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PictureFeedback {
  /// Decode order id of the picture.
  pub id: u64,
  /// Bytes produced by the entropy coder.
  pub byte_count: usize,
  /// Quantizer actually used.
  pub qp: u8,
}

/// A picture that went through the whole loop.
#[derive(Debug, Serialize, Deserialize)]
pub struct CodedPicture {
  /// Decode order id.
  pub id: u64,
  /// Display order index.
  pub poc: u64,
  /// Presentation timestamp.
  pub pts: u64,
  /// Type of the picture.
  pub picture_type: PictureType,
  /// Temporal layer.
  pub temporal_layer: u8,
  /// Quantizer used.
  pub qp: u8,
  /// Number of bytes produced.
  pub byte_count: usize,
  /// Display order indices of list0.
  pub list0: Vec<u64>,
  /// Display order indices of list1.
  pub list1: Vec<u64>,
  /// Optional user-provided opaque data
  #[cfg_attr(feature = "serialize", serde(skip))]
  pub opaque: Option<Opaque>,
}

impl PartialEq for CodedPicture {
  fn eq(&self, other: &Self) -> bool {
    self.id == other.id
      && self.poc == other.poc
      && self.picture_type == other.picture_type
      && self.qp == other.qp
      && self.byte_count == other.byte_count
  }
}

impl fmt::Display for CodedPicture {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "Picture {} - {} - layer {} - qp {} - {} bytes",
      self.poc,
      self.picture_type,
      self.temporal_layer,
      self.qp,
      self.byte_count
    )
  }
}

/// Types which can be converted into pictures.
///
/// This trait is used in [`Context::send_picture`] to allow for passing in
/// pictures with optional parameters and optionally wrapped in `Arc`.
///
/// [`Context::send_picture`]: struct.Context.html#method.send_picture
pub trait IntoPicture<T: Pixel> {
  /// Converts the type into a tuple of picture and parameters.
  fn into(self) -> (Option<Arc<Frame<T>>>, Option<PictureParameters>);
}

impl<T: Pixel> IntoPicture<T> for Option<Arc<Frame<T>>> {
  fn into(self) -> (Option<Arc<Frame<T>>>, Option<PictureParameters>) {
    (self, None)
  }
}

impl<T: Pixel> IntoPicture<T> for Arc<Frame<T>> {
  fn into(self) -> (Option<Arc<Frame<T>>>, Option<PictureParameters>) {
    (Some(self), None)
  }
}

impl<T: Pixel> IntoPicture<T> for (Arc<Frame<T>>, PictureParameters) {
  fn into(self) -> (Option<Arc<Frame<T>>>, Option<PictureParameters>) {
    (Some(self.0), Some(self.1))
  }
}

impl<T: Pixel> IntoPicture<T> for (Arc<Frame<T>>, Option<PictureParameters>) {
  fn into(self) -> (Option<Arc<Frame<T>>>, Option<PictureParameters>) {
    (Some(self.0), self.1)
  }
}

impl<T: Pixel> IntoPicture<T> for Frame<T> {
  fn into(self) -> (Option<Arc<Frame<T>>>, Option<PictureParameters>) {
    (Some(Arc::new(self)), None)
  }
}

impl<T: Pixel> IntoPicture<T> for (Frame<T>, PictureParameters) {
  fn into(self) -> (Option<Arc<Frame<T>>>, Option<PictureParameters>) {
    (Some(Arc::new(self.0)), Some(self.1))
  }
}

impl<T: Pixel> IntoPicture<T> for (Frame<T>, Option<PictureParameters>) {
  fn into(self) -> (Option<Arc<Frame<T>>>, Option<PictureParameters>) {
    (Some(Arc::new(self.0)), self.1)
  }
}

/// The downstream encode stages.
///
/// Implementors run motion estimation, mode decision and entropy coding for
/// one picture and report how many bytes came out. When the job carries a
/// reconstruction buffer it must be filled before returning: pictures that
/// reference it are only dispatched afterwards.
pub trait PictureEncoder<T: Pixel>: Send {
  /// Encodes one picture.
  ///
  /// # Errors
  ///
  /// Returns `EncodeError` if the picture could not be encoded; the channel
  /// is halted.
  fn encode(
    &mut self, job: &EncodeJob<T>,
  ) -> Result<PictureFeedback, EncodeError>;
}

/// Error returned by a [`PictureEncoder`].
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("{0}")]
pub struct EncodeError(pub String);
