//! Background discussion watch and the halt signal it raises.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::api::WikiReadApi;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    OpenDiscussion { title: String },
    MonitorFailed { title: String, message: String },
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenDiscussion { title } => {
                write!(f, "open discussion found on [[{title}]]")
            }
            Self::MonitorFailed { title, message } => {
                write!(f, "discussion check for [[{title}]] failed: {message}")
            }
        }
    }
}

/// Shared stop flag. The first reason to trip it wins; it never resets.
#[derive(Debug, Clone, Default)]
pub struct HaltToken {
    inner: Arc<Latch<HaltReason>>,
}

impl HaltToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the token was already tripped.
    pub fn trip(&self, reason: HaltReason) -> bool {
        self.inner.set(reason)
    }

    pub fn is_halted(&self) -> bool {
        self.inner.get().is_some()
    }

    pub fn reason(&self) -> Option<HaltReason> {
        self.inner.get()
    }
}

#[derive(Debug)]
struct Latch<T> {
    value: Mutex<Option<T>>,
    changed: Condvar,
}

impl<T> Default for Latch<T> {
    fn default() -> Self {
        Self {
            value: Mutex::new(None),
            changed: Condvar::new(),
        }
    }
}

impl<T: Clone> Latch<T> {
    fn set(&self, value: T) -> bool {
        let mut guard = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_some() {
            return false;
        }
        *guard = Some(value);
        self.changed.notify_all();
        true
    }

    fn get(&self) -> Option<T> {
        self.value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Block up to `timeout`; `true` when the latch is (or becomes) set.
    fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        while guard.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = self
                .changed
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

/// How the polling thread ended. While the thread is alive the monitor is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// An open discussion was found; the run was halted.
    Tripped,
    /// The check itself failed; the run was halted.
    Failed,
    /// Stopped by its owner after the run finished.
    Stopped,
}

/// Handle to the watch started by [`spawn_discussion_monitor`].
#[derive(Debug)]
pub struct DiscussionMonitor {
    stop: Arc<Latch<()>>,
    worker: Worker,
}

#[derive(Debug)]
enum Worker {
    Polling(JoinHandle<MonitorState>),
    /// The first check already halted the run; no thread was started.
    Settled(MonitorState),
}

impl DiscussionMonitor {
    pub fn is_finished(&self) -> bool {
        match &self.worker {
            Worker::Polling(handle) => handle.is_finished(),
            Worker::Settled(_) => true,
        }
    }

    /// Ask the thread to exit at its next wait and return how it ended.
    pub fn stop(self) -> MonitorState {
        self.stop.set(());
        match self.worker {
            Worker::Polling(handle) => handle.join().unwrap_or(MonitorState::Failed),
            Worker::Settled(state) => state,
        }
    }
}

/// Run one discussion check, tripping `halt` on an open thread or a failed
/// check. Returns the final state when the check halted the run.
pub fn check_discussions<A: WikiReadApi>(
    api: &mut A,
    title: &str,
    halt: &HaltToken,
) -> Option<MonitorState> {
    match api.has_open_discussion(title) {
        Ok(true) => {
            tracing::warn!(title = %title, "open discussion found; halting edits");
            halt.trip(HaltReason::OpenDiscussion {
                title: title.to_string(),
            });
            Some(MonitorState::Tripped)
        }
        Ok(false) => {
            tracing::debug!(title = %title, "no open discussion");
            None
        }
        Err(error) => {
            tracing::error!(title = %title, error = %error, "discussion check failed; halting edits");
            halt.trip(HaltReason::MonitorFailed {
                title: title.to_string(),
                message: error.to_string(),
            });
            Some(MonitorState::Failed)
        }
    }
}

/// Check `title` once on the calling thread, then keep polling it every
/// `interval` on a dedicated thread until `halt` trips or the monitor is
/// stopped. A discussion that is already open halts the run before this
/// returns.
pub fn spawn_discussion_monitor<A>(
    mut api: A,
    title: String,
    interval: Duration,
    halt: HaltToken,
) -> Result<DiscussionMonitor>
where
    A: WikiReadApi + Send + 'static,
{
    let stop = Arc::new(Latch::<()>::default());
    if let Some(state) = check_discussions(&mut api, &title, &halt) {
        return Ok(DiscussionMonitor {
            stop,
            worker: Worker::Settled(state),
        });
    }

    let thread_stop = Arc::clone(&stop);
    let handle = thread::Builder::new()
        .name("discussion-monitor".to_string())
        .spawn(move || {
            loop {
                if thread_stop.wait_timeout(interval) {
                    return MonitorState::Stopped;
                }
                if let Some(state) = check_discussions(&mut api, &title, &halt) {
                    return state;
                }
            }
        })
        .context("failed to spawn discussion monitor thread")?;

    Ok(DiscussionMonitor {
        stop,
        worker: Worker::Polling(handle),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use super::{HaltReason, HaltToken, MonitorState, spawn_discussion_monitor};
    use crate::api::{ApiError, BacklinkEntry, PageSnapshot, WikiReadApi};

    /// Replays scripted poll results, then keeps answering "closed".
    struct ScriptedDiscussions {
        polls: Arc<Mutex<VecDeque<Result<bool, ApiError>>>>,
        count: Arc<Mutex<usize>>,
    }

    impl WikiReadApi for ScriptedDiscussions {
        fn fetch_backlinks(
            &mut self,
            _title: &str,
            _namespace: &str,
        ) -> Result<Vec<BacklinkEntry>, ApiError> {
            Ok(Vec::new())
        }

        fn fetch_page(&mut self, title: &str) -> Result<PageSnapshot, ApiError> {
            Err(ApiError::PermissionDenied {
                title: title.to_string(),
                message: "not used".to_string(),
            })
        }

        fn has_open_discussion(&mut self, _title: &str) -> Result<bool, ApiError> {
            *self.count.lock().expect("count") += 1;
            self.polls
                .lock()
                .expect("polls")
                .pop_front()
                .unwrap_or(Ok(false))
        }

        fn request_count(&self) -> usize {
            *self.count.lock().expect("count")
        }
    }

    fn scripted(polls: Vec<Result<bool, ApiError>>) -> (ScriptedDiscussions, Arc<Mutex<usize>>) {
        let count = Arc::new(Mutex::new(0));
        (
            ScriptedDiscussions {
                polls: Arc::new(Mutex::new(polls.into())),
                count: Arc::clone(&count),
            },
            count,
        )
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn token_keeps_first_reason() {
        let halt = HaltToken::new();
        assert!(!halt.is_halted());
        assert!(halt.trip(HaltReason::OpenDiscussion {
            title: "A".to_string()
        }));
        assert!(!halt.trip(HaltReason::MonitorFailed {
            title: "A".to_string(),
            message: "later".to_string(),
        }));
        let observer = halt.clone();
        assert!(observer.is_halted());
        assert_eq!(
            observer.reason(),
            Some(HaltReason::OpenDiscussion {
                title: "A".to_string()
            })
        );
    }

    #[test]
    fn open_discussion_halts_before_spawn_returns() {
        let (api, count) = scripted(vec![Ok(true)]);
        let halt = HaltToken::new();
        let monitor = spawn_discussion_monitor(
            api,
            "봇:작업".to_string(),
            Duration::from_secs(3600),
            halt.clone(),
        )
        .expect("spawn");

        assert!(halt.is_halted());
        assert_eq!(*count.lock().expect("count"), 1);
        assert!(monitor.is_finished());
        assert_eq!(monitor.stop(), MonitorState::Tripped);
    }

    #[test]
    fn trips_after_discussion_opens() {
        let (api, count) = scripted(vec![Ok(false), Ok(false), Ok(true)]);
        let halt = HaltToken::new();
        let monitor = spawn_discussion_monitor(
            api,
            "봇:작업".to_string(),
            Duration::from_millis(1),
            halt.clone(),
        )
        .expect("spawn");

        wait_until(|| monitor.is_finished());
        assert_eq!(monitor.stop(), MonitorState::Tripped);
        assert_eq!(*count.lock().expect("count"), 3);
        assert_eq!(
            halt.reason(),
            Some(HaltReason::OpenDiscussion {
                title: "봇:작업".to_string()
            })
        );
    }

    #[test]
    fn failed_check_halts_the_run() {
        let (api, _count) = scripted(vec![Err(ApiError::HttpStatus {
            url: "http://wiki/api/discuss/A".to_string(),
            status: 502,
            message: "bad gateway".to_string(),
        })]);
        let halt = HaltToken::new();
        let monitor =
            spawn_discussion_monitor(api, "A".to_string(), Duration::from_millis(1), halt.clone())
                .expect("spawn");

        wait_until(|| monitor.is_finished());
        assert_eq!(monitor.stop(), MonitorState::Failed);
        match halt.reason() {
            Some(HaltReason::MonitorFailed { title, message }) => {
                assert_eq!(title, "A");
                assert!(message.contains("502"));
            }
            other => panic!("unexpected halt reason: {other:?}"),
        }
    }

    #[test]
    fn stop_interrupts_a_long_interval() {
        let (api, count) = scripted(Vec::new());
        let halt = HaltToken::new();
        let monitor = spawn_discussion_monitor(
            api,
            "A".to_string(),
            Duration::from_secs(3600),
            halt.clone(),
        )
        .expect("spawn");

        wait_until(|| *count.lock().expect("count") == 1);
        assert!(!monitor.is_finished());
        let started = Instant::now();
        assert_eq!(monitor.stop(), MonitorState::Stopped);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!halt.is_halted());
    }
}
