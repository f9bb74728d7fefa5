//! Cooperative cancellation for background loops and request-scoped calls.
//!
//! Background loops (deleter, sweeper, secret updater, key refreshers) park
//! on a token between iterations and interpret cancellation as "shut down
//! after the current iteration". Request paths check the token at suspension
//! points and bail out with [`crate::error::Error::Cancelled`].

use std::sync::Arc;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};

/// A cheaply cloneable cancellation token.
///
/// Cloning shares the underlying flag; cancelling any clone wakes every
/// waiter promptly.
#[derive(Clone, Default)]
pub struct Cancellation {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: Mutex<bool>,
    cond: Condvar,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the token, waking all sleepers.
    pub fn cancel(&self) {
        let mut flag = self.inner.cancelled.lock().unwrap();
        *flag = true;
        self.inner.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock().unwrap()
    }

    /// Bail out with [`Error::Cancelled`] if the token has been cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration` or until cancelled, whichever comes first.
    /// Returns `false` if the sleep was interrupted by cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        let flag = self.inner.cancelled.lock().unwrap();
        if *flag {
            return false;
        }
        let (flag, _timeout) = self
            .inner
            .cond
            .wait_timeout_while(flag, duration, |cancelled| !*cancelled)
            .unwrap();
        !*flag
    }
}
