//! The per-response emission deadline.
//!
//! One wall-clock deadline may be armed per process at a time (the original
//! implementation hangs this on the process's single SIGALRM slot). Arming is
//! guarded by an atomic; the deadline itself is checked cooperatively between
//! variables during emission, and the builder injects a serialized error into
//! the open stream when it has passed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dap_types::DapError;

static SLOT_ARMED: AtomicBool = AtomicBool::new(false);

/// An armed (or disabled) response deadline. Dropping it frees the process's
/// timeout slot.
#[derive(Debug)]
pub struct TimeoutController {
    expires_at: Option<Instant>,
}

impl TimeoutController {
    /// Arm the deadline. A timeout of zero disables it entirely (and does not
    /// occupy the slot). Only one response per process may hold an armed
    /// deadline.
    pub fn establish(timeout_seconds: u32) -> Result<Self, DapError> {
        if timeout_seconds == 0 {
            return Ok(Self { expires_at: None });
        }

        if SLOT_ARMED
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DapError::Internal(
                "another response already holds the timeout slot".to_owned(),
            ));
        }

        Ok(Self {
            expires_at: Some(Instant::now() + Duration::from_secs(u64::from(timeout_seconds))),
        })
    }

    pub fn expired(&self) -> bool {
        self.expires_at
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Fail with [`DapError::Timeout`] once the deadline has passed.
    pub fn check(&self) -> Result<(), DapError> {
        if self.expired() {
            Err(DapError::Timeout)
        } else {
            Ok(())
        }
    }
}

impl Drop for TimeoutController {
    fn drop(&mut self) {
        if self.expires_at.is_some() {
            SLOT_ARMED.store(false, Ordering::Release);
        }
    }
}
