// Copyright 2024 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    fmt,
    future::Future,
    ops::Deref,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::{Mutex, MutexGuard};
use tracing::trace;

use super::CryptoEngine;

/// A strictly ordered, mutually exclusive queue in front of a
/// [`CryptoEngine`].
///
/// Every unit of work that touches the engine takes a ticket. Tickets are
/// served one at a time in the order they were requested, since the tokio
/// mutex underneath is fair. A caller only waits for the units queued before
/// it; once its ticket is dropped the next one is served.
pub struct CryptoRequestQueue {
    engine: Arc<dyn CryptoEngine>,
    turn: Mutex<()>,
    next_ticket: AtomicU64,
}

impl fmt::Debug for CryptoRequestQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoRequestQueue")
            .field("engine", &self.engine)
            .field("next_ticket", &self.next_ticket)
            .finish_non_exhaustive()
    }
}

impl CryptoRequestQueue {
    pub fn new(engine: Arc<dyn CryptoEngine>) -> Self {
        Self { engine, turn: Mutex::new(()), next_ticket: AtomicU64::new(0) }
    }

    /// Wait for our turn and get exclusive access to the engine until the
    /// returned ticket is dropped.
    pub async fn acquire(&self) -> CryptoTicket<'_> {
        let number = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        trace!(ticket = number, "Waiting for the crypto engine");

        let guard = self.turn.lock().await;
        trace!(ticket = number, "Got access to the crypto engine");

        CryptoTicket { _guard: guard, engine: self.engine.as_ref(), number }
    }

    /// Run one unit of work with exclusive access to the engine, propagating
    /// its result.
    pub async fn run<F, Fut, T>(&self, unit: F) -> T
    where
        F: FnOnce(Arc<dyn CryptoEngine>) -> Fut,
        Fut: Future<Output = T>,
    {
        let _ticket = self.acquire().await;
        unit(self.engine.clone()).await
    }
}

/// Exclusive access to the engine, see [`CryptoRequestQueue::acquire`].
pub struct CryptoTicket<'a> {
    _guard: MutexGuard<'a, ()>,
    engine: &'a (dyn CryptoEngine + 'static),
    number: u64,
}

impl CryptoTicket<'_> {
    /// The position of this ticket in the queue.
    pub fn number(&self) -> u64 {
        self.number
    }
}

impl fmt::Debug for CryptoTicket<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoTicket").field("number", &self.number).finish_non_exhaustive()
    }
}

impl Deref for CryptoTicket<'_> {
    type Target = dyn CryptoEngine;

    fn deref(&self) -> &Self::Target {
        self.engine
    }
}

impl Drop for CryptoTicket<'_> {
    fn drop(&mut self) {
        trace!(ticket = self.number, "Released the crypto engine");
    }
}
