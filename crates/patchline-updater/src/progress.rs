//! Progress reporting and cooperative cancellation.
//!
//! Long-running operations report into a [`ProgressReporter`] and poll it
//! for cancellation at file and chunk granularity. Cancellation is advisory:
//! an operation that observes it stops at the next check, removes anything
//! it partially wrote, and returns [`Outcome::Cancelled`].
//!
//! [`ChildProgress`] lets one transfer report into a slice of an aggregate
//! counter. The aggregate's maximum is set once to the sum of all child
//! maximums and children never rescale it.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

/// Result of an operation that may be canceled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The operation ran to completion
    Completed(T),
    /// The operation observed cancellation and stopped cleanly
    Cancelled,
}

impl<T> Outcome<T> {
    /// Whether the operation was canceled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Convert into an `Option`, dropping the cancellation marker.
    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::Cancelled => None,
        }
    }
}

/// Progress and cancellation sink consumed by transfers.
///
/// One writer (the active transfer) and one reader (the caller) share it,
/// so implementations use interior mutability.
pub trait ProgressReporter: Send + Sync {
    /// Describe the current step.
    fn set_caption(&self, caption: &str);

    /// Current progress value.
    fn progress(&self) -> i64;

    /// Set the current progress value.
    fn set_progress(&self, value: i64);

    /// Declared maximum.
    fn maximum(&self) -> i64;

    /// Declare the maximum.
    fn set_maximum(&self, value: i64);

    /// Whether the caller asked to stop.
    fn was_canceled(&self) -> bool;

    /// Whether the caller is currently allowed to cancel.
    fn can_cancel(&self) -> bool;

    /// Allow or forbid cancellation.
    fn set_can_cancel(&self, value: bool);
}

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a token that has not been canceled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Thread-safe progress counter backed by atomics.
///
/// Cancellation requests made through the [`CancelToken`] are ignored while
/// `can_cancel` is false.
#[derive(Debug)]
pub struct ProgressCounter {
    caption: Mutex<String>,
    progress: AtomicI64,
    maximum: AtomicI64,
    can_cancel: AtomicBool,
    token: CancelToken,
}

impl ProgressCounter {
    /// Create a counter with its own cancellation token.
    pub fn new() -> Self {
        Self::with_token(CancelToken::new())
    }

    /// Create a counter observing an existing cancellation token.
    pub fn with_token(token: CancelToken) -> Self {
        Self {
            caption: Mutex::new(String::new()),
            progress: AtomicI64::new(0),
            maximum: AtomicI64::new(0),
            can_cancel: AtomicBool::new(true),
            token,
        }
    }

    /// The token that cancels operations reporting into this counter.
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Current caption.
    pub fn caption(&self) -> String {
        self.caption
            .lock()
            .map(|caption| caption.clone())
            .unwrap_or_default()
    }

    /// Progress as a percentage (0.0 to 100.0).
    pub fn percentage(&self) -> f64 {
        let maximum = self.maximum();
        if maximum <= 0 {
            0.0
        } else {
            (self.progress() as f64 / maximum as f64) * 100.0
        }
    }
}

impl Default for ProgressCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for ProgressCounter {
    fn set_caption(&self, caption: &str) {
        if let Ok(mut current) = self.caption.lock() {
            *current = caption.to_owned();
        }
    }

    fn progress(&self) -> i64 {
        self.progress.load(Ordering::SeqCst)
    }

    fn set_progress(&self, value: i64) {
        self.progress.store(value, Ordering::SeqCst);
    }

    fn maximum(&self) -> i64 {
        self.maximum.load(Ordering::SeqCst)
    }

    fn set_maximum(&self, value: i64) {
        self.maximum.store(value, Ordering::SeqCst);
    }

    fn was_canceled(&self) -> bool {
        self.can_cancel.load(Ordering::SeqCst) && self.token.is_cancelled()
    }

    fn can_cancel(&self) -> bool {
        self.can_cancel.load(Ordering::SeqCst)
    }

    fn set_can_cancel(&self, value: bool) {
        self.can_cancel.store(value, Ordering::SeqCst);
    }
}

/// A window onto a parent reporter covering `[base, base + maximum]`.
///
/// Progress written to the child lands in the parent offset by `base` and
/// clamped to the child's own maximum. Setting the child's maximum never
/// touches the parent's.
pub struct ChildProgress<'a> {
    parent: &'a dyn ProgressReporter,
    base: i64,
    maximum: AtomicI64,
}

impl<'a> ChildProgress<'a> {
    /// Create a child starting at `base` with room for `maximum` units.
    pub fn new(parent: &'a dyn ProgressReporter, base: i64, maximum: i64) -> Self {
        Self {
            parent,
            base,
            maximum: AtomicI64::new(maximum),
        }
    }

    /// Offset of this child within the parent.
    pub fn base(&self) -> i64 {
        self.base
    }
}

impl ProgressReporter for ChildProgress<'_> {
    fn set_caption(&self, caption: &str) {
        self.parent.set_caption(caption);
    }

    fn progress(&self) -> i64 {
        (self.parent.progress() - self.base).clamp(0, self.maximum().max(0))
    }

    fn set_progress(&self, value: i64) {
        let clamped = value.clamp(0, self.maximum().max(0));
        self.parent.set_progress(self.base + clamped);
    }

    fn maximum(&self) -> i64 {
        self.maximum.load(Ordering::SeqCst)
    }

    fn set_maximum(&self, value: i64) {
        self.maximum.store(value, Ordering::SeqCst);
    }

    fn was_canceled(&self) -> bool {
        self.parent.was_canceled()
    }

    fn can_cancel(&self) -> bool {
        self.parent.can_cancel()
    }

    fn set_can_cancel(&self, value: bool) {
        self.parent.set_can_cancel(value);
    }
}

/// Reporter that records nothing and never cancels.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn set_caption(&self, _caption: &str) {}

    fn progress(&self) -> i64 {
        0
    }

    fn set_progress(&self, _value: i64) {}

    fn maximum(&self) -> i64 {
        0
    }

    fn set_maximum(&self, _value: i64) {}

    fn was_canceled(&self) -> bool {
        false
    }

    fn can_cancel(&self) -> bool {
        false
    }

    fn set_can_cancel(&self, _value: bool) {}
}
