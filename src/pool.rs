// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Pooled buffers.
//!
//! Spectra travel from the delay-correction tasklets to the correlation
//! tasklet in fixed-size buffers drawn from a per-worker pool. The pool is
//! single-threaded; a [`Pooled`] handle returns its buffer on drop. The cap
//! bounds how far the delay stage can run ahead of the correlation stage
//! within one worker.

use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

use thiserror::Error;

#[derive(Debug)]
struct PoolInner<T> {
    free: Vec<Vec<T>>,
    buffer_len: usize,
    outstanding: usize,
    max_buffers: usize,
}

/// A single-threaded pool of equally sized buffers.
#[derive(Debug)]
pub(crate) struct Pool<T> {
    inner: Rc<RefCell<PoolInner<T>>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Pool {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Default + Clone> Pool<T> {
    pub(crate) fn new(buffer_len: usize, max_buffers: usize) -> Pool<T> {
        Pool {
            inner: Rc::new(RefCell::new(PoolInner {
                free: Vec::new(),
                buffer_len,
                outstanding: 0,
                max_buffers,
            })),
        }
    }

    /// A zeroed buffer of the pool's length.
    pub(crate) fn acquire(&self) -> Result<Pooled<T>, PoolError> {
        let mut inner = self.inner.borrow_mut();
        if inner.outstanding >= inner.max_buffers {
            return Err(PoolError::Exhausted {
                max_buffers: inner.max_buffers,
            });
        }
        let mut buf = match inner.free.pop() {
            Some(mut buf) => {
                buf.iter_mut().for_each(|x| *x = T::default());
                buf
            }
            None => Vec::new(),
        };
        buf.resize(inner.buffer_len, T::default());
        inner.outstanding += 1;
        drop(inner);
        Ok(Pooled {
            buf,
            pool: Rc::clone(&self.inner),
        })
    }

    #[cfg(test)]
    fn outstanding(&self) -> usize {
        self.inner.borrow().outstanding
    }
}

/// A buffer on loan from a [`Pool`]; hands itself back when dropped.
#[derive(Debug)]
pub(crate) struct Pooled<T> {
    buf: Vec<T>,
    pool: Rc<RefCell<PoolInner<T>>>,
}

impl<T> Deref for Pooled<T> {
    type Target = [T];
    fn deref(&self) -> &[T] {
        &self.buf
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        &mut self.buf
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        let mut inner = self.pool.borrow_mut();
        inner.outstanding -= 1;
        inner.free.push(std::mem::take(&mut self.buf));
    }
}

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Buffer pool exhausted ({max_buffers} buffers outstanding)")]
    Exhausted { max_buffers: usize },
}
