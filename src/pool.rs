// Copyright (c) 2018-2025, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use crate::api::{EncoderConfig, Resource, SchedulerError};

use v_frame::frame::Frame;
use v_frame::pixel::{ChromaSampling, Pixel};

use std::fmt;
use std::sync::{
  Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

// Border kept around reconstructions for motion compensation.
const LUMA_PADDING: usize = 64;

struct Shared<T: Pixel> {
  frames: Box<[RwLock<Frame<T>>]>,
  free: Mutex<Vec<usize>>,
  stats: Mutex<PoolStats>,
}

/// Usage counters of a [`PictureBufferPool`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
  /// Buffers handed out.
  pub acquired: u64,
  /// Buffers given back.
  pub returned: u64,
  /// Most buffers out at the same time.
  pub peak: usize,
}

/// Fixed set of reconstruction buffers allocated up front.
pub struct PictureBufferPool<T: Pixel> {
  shared: Arc<Shared<T>>,
}

impl<T: Pixel> Clone for PictureBufferPool<T> {
  fn clone(&self) -> Self {
    PictureBufferPool { shared: self.shared.clone() }
  }
}

/// A reconstruction buffer on loan from a [`PictureBufferPool`].
///
/// It goes back to the pool when the last handle is dropped.
pub struct PictureBuffer<T: Pixel> {
  index: usize,
  shared: Arc<Shared<T>>,
}

impl<T: Pixel> fmt::Debug for PictureBuffer<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PictureBuffer").field("index", &self.index).finish()
  }
}

impl<T: Pixel> PictureBuffer<T> {
  /// Position of the buffer in its pool.
  pub const fn index(&self) -> usize {
    self.index
  }

  /// Shared access to the samples.
  pub fn read(&self) -> RwLockReadGuard<'_, Frame<T>> {
    self.shared.frames[self.index]
      .read()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Exclusive access to the samples, for the stage writing the
  /// reconstruction.
  pub fn write(&self) -> RwLockWriteGuard<'_, Frame<T>> {
    self.shared.frames[self.index]
      .write()
      .unwrap_or_else(PoisonError::into_inner)
  }
}

impl<T: Pixel> Drop for PictureBuffer<T> {
  fn drop(&mut self) {
    let mut free =
      self.shared.free.lock().unwrap_or_else(PoisonError::into_inner);
    debug_assert!(!free.contains(&self.index));
    free.push(self.index);
    drop(free);
    let mut stats =
      self.shared.stats.lock().unwrap_or_else(PoisonError::into_inner);
    stats.returned += 1;
    log::trace!("buffer {} returned to the pool", self.index);
  }
}

impl<T: Pixel> PictureBufferPool<T> {
  /// Allocates `capacity` buffers of the given geometry.
  pub fn new(
    width: usize, height: usize, chroma_sampling: ChromaSampling,
    capacity: usize,
  ) -> Self {
    let frames: Vec<RwLock<Frame<T>>> = (0..capacity)
      .map(|_| {
        RwLock::new(Frame::new_with_padding(
          width,
          height,
          chroma_sampling,
          LUMA_PADDING,
        ))
      })
      .collect();
    PictureBufferPool {
      shared: Arc::new(Shared {
        frames: frames.into_boxed_slice(),
        free: Mutex::new((0..capacity).rev().collect()),
        stats: Mutex::new(PoolStats::default()),
      }),
    }
  }

  /// A pool sized for the reference table of `enc`.
  pub fn for_config(enc: &EncoderConfig) -> Self {
    Self::new(enc.width, enc.height, enc.chroma_sampling, enc.limits().pool)
  }

  /// Total number of buffers.
  pub fn capacity(&self) -> usize {
    self.shared.frames.len()
  }

  /// Buffers currently free.
  pub fn available(&self) -> usize {
    self.shared.free.lock().unwrap_or_else(PoisonError::into_inner).len()
  }

  /// Usage counters.
  pub fn stats(&self) -> PoolStats {
    *self.shared.stats.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Takes a free buffer.
  ///
  /// # Errors
  ///
  /// Returns `ResourceExhausted` if every buffer is in use.
  pub fn acquire(&self) -> Result<Arc<PictureBuffer<T>>, SchedulerError> {
    let mut free =
      self.shared.free.lock().unwrap_or_else(PoisonError::into_inner);
    let index = free
      .pop()
      .ok_or(SchedulerError::ResourceExhausted(Resource::BufferPool))?;
    let out = self.capacity() - free.len();
    drop(free);

    let mut stats =
      self.shared.stats.lock().unwrap_or_else(PoisonError::into_inner);
    stats.acquired += 1;
    stats.peak = stats.peak.max(out);
    log::trace!("buffer {} taken from the pool", index);

    Ok(Arc::new(PictureBuffer { index, shared: self.shared.clone() }))
  }
}
