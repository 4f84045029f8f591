// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! First-error-wins fault channel shared by a stage's threads.
//!
//! Any thread may [`FaultChannel::raise`] an error; only the first one is
//! kept. Raising drops the channel's trip sender, which wakes every
//! thread blocked in [`FaultChannel::wait_on`] at once. Waiters check for
//! a stored error before blocking, so a fault raised before the wait is
//! seen without racing the queue.

use crate::TransferError;
use crossbeam::channel::{self, Receiver, Sender};
use std::sync::{Mutex, OnceLock};

/// Holds at most one fatal error and wakes all waiters when it is set.
#[derive(Debug)]
pub struct FaultChannel {
    error: OnceLock<TransferError>,
    trip: Mutex<Option<Sender<()>>>,
    tripped: Receiver<()>,
}

impl Default for FaultChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultChannel {
    pub fn new() -> Self {
        let (tx, rx) = channel::bounded(0);
        Self {
            error: OnceLock::new(),
            trip: Mutex::new(Some(tx)),
            tripped: rx,
        }
    }

    /// Records `error` if none is recorded yet and wakes every waiter.
    ///
    /// Returns `true` if this call stored the error.
    pub fn raise(&self, error: TransferError) -> bool {
        let first = self.error.set(error).is_ok();
        if let Ok(mut trip) = self.trip.lock() {
            trip.take();
        }
        first
    }

    /// The recorded error, if any.
    pub fn error(&self) -> Option<&TransferError> {
        self.error.get()
    }

    pub fn is_raised(&self) -> bool {
        self.error.get().is_some()
    }

    /// Blocks on `queue` until a message arrives or a fault is raised.
    pub fn wait_on<T>(&self, queue: &Receiver<T>) -> Result<T, TransferError> {
        if let Some(e) = self.error() {
            return Err(e.clone());
        }
        crossbeam::select! {
            recv(queue) -> msg => msg.map_err(|_| {
                TransferError::Disconnected("transfer queue closed".into())
            }),
            recv(self.tripped) -> _ => Err(self.current()),
        }
    }

    fn current(&self) -> TransferError {
        self.error()
            .cloned()
            .unwrap_or_else(|| TransferError::Aborted("fault channel closed".into()))
    }
}
