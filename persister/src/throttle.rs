use futures::future::BoxFuture;
use parking_lot::{Mutex, MutexGuard};
use std::fmt::{self, Debug, Display};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, warn};

type Task<A, E> = Box<dyn Fn(A) -> BoxFuture<'static, Result<(), E>> + Send + Sync>;
type ErrorHook<E> = Box<dyn Fn(E) + Send + Sync>;

/// Rate limiter for an asynchronous task.
///
/// `call` never waits for the task. If the task is idle and `interval` has passed since
/// the previous run finished, it starts right away; otherwise the argument is parked in a
/// single pending slot (overwriting whatever was parked before) and one deferred run is
/// scheduled for when the current run has finished and the interval has elapsed. The
/// deferred run always takes the newest parked argument.
///
/// Runs of the same throttle never overlap. Task errors go to the error hook and do not
/// affect later calls; a panicking task also releases the throttle.
pub struct AsyncThrottle<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    inner: Arc<Inner<A, E>>,
}

struct Inner<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    interval: Duration,
    task: Task<A, E>,
    on_error: ErrorHook<E>,
    state: Mutex<State<A>>,
    idle: Notify,
}

struct State<A> {
    running: bool,
    scheduled: bool,
    pending: Option<A>,
    last_finished: Option<Instant>,
}

impl<A, E> AsyncThrottle<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    /// Wrap `task`, logging its errors
    pub fn new<F, Fut>(interval: Duration, task: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display,
    {
        Self::with_error_hook(interval, task, |err: E| {
            warn!("Throttled task failed: {}", err);
        })
    }

    /// Wrap `task`, handing every error it returns to `on_error`
    pub fn with_error_hook<F, Fut, H>(interval: Duration, task: F, on_error: H) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        H: Fn(E) + Send + Sync + 'static,
    {
        let task: Task<A, E> =
            Box::new(move |arg: A| -> BoxFuture<'static, Result<(), E>> { Box::pin(task(arg)) });

        Self {
            inner: Arc::new(Inner {
                interval,
                task,
                on_error: Box::new(on_error),
                state: Mutex::new(State {
                    running: false,
                    scheduled: false,
                    pending: None,
                    last_finished: None,
                }),
                idle: Notify::new(),
            }),
        }
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    /// Run the task with `arg` now, or park `arg` for the next permitted run.
    ///
    /// Must be called from within a tokio runtime for the task to make progress. Outside
    /// one the argument stays parked until the next call or `until_idle` made inside a
    /// runtime.
    pub fn call(&self, arg: A) {
        let mut state = self.inner.state.lock();

        if state.running || state.scheduled {
            debug!("Throttle busy, parking latest argument");
            state.pending = Some(arg);
            return;
        }

        match Handle::try_current() {
            Ok(handle) => Inner::dispatch(&self.inner, state, &handle, arg),
            Err(err) => {
                error!("Throttled call issued outside a tokio runtime: {}", err);
                state.pending = Some(arg);
            }
        }
    }

    /// No run in flight, none scheduled and nothing parked
    pub fn is_idle(&self) -> bool {
        self.inner.state.lock().is_idle()
    }

    /// Wait until every call made so far has been run or superseded
    pub async fn until_idle(&self) {
        self.resume_parked();

        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed
            notified.as_mut().enable();

            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Start an argument left parked by a call made outside any runtime
    fn resume_parked(&self) {
        let mut state = self.inner.state.lock();
        if state.running || state.scheduled {
            return;
        }
        let Some(arg) = state.pending.take() else {
            return;
        };

        match Handle::try_current() {
            Ok(handle) => {
                debug!("Resuming argument parked outside a runtime");
                Inner::dispatch(&self.inner, state, &handle, arg);
            }
            Err(_) => state.pending = Some(arg),
        }
    }
}

impl<A> State<A> {
    fn is_idle(&self) -> bool {
        !self.running && !self.scheduled && self.pending.is_none()
    }
}

impl<A, E> Inner<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    /// Time left before another run may start, if any
    fn cooldown(&self, state: &State<A>) -> Option<Duration> {
        let elapsed = state.last_finished?.elapsed();
        (elapsed < self.interval).then(|| self.interval - elapsed)
    }

    /// Start `arg` or defer it past the cooldown. The caller has checked that nothing is
    /// running or scheduled.
    fn dispatch(this: &Arc<Self>, mut state: MutexGuard<'_, State<A>>, handle: &Handle, arg: A) {
        match this.cooldown(&state) {
            Some(wait) => {
                debug!("Throttle cooling down, deferring by {:?}", wait);
                state.pending = Some(arg);
                state.scheduled = true;
                drop(state);
                Inner::schedule(this, handle, wait);
            }
            None => {
                // Anything stranded earlier is older than `arg`
                state.pending = None;
                state.running = true;
                drop(state);
                Inner::start(this, handle, arg);
            }
        }
    }

    fn schedule(this: &Arc<Self>, handle: &Handle, wait: Duration) {
        let inner = Arc::clone(this);
        let timer_handle = handle.clone();
        handle.spawn(async move {
            sleep(wait).await;
            Inner::fire(&inner, &timer_handle);
        });
    }

    fn fire(this: &Arc<Self>, handle: &Handle) {
        let mut state = this.state.lock();
        state.scheduled = false;

        // The finishing run reschedules on its own
        if state.running {
            return;
        }

        match state.pending.take() {
            Some(arg) => {
                state.running = true;
                drop(state);
                Inner::start(this, handle, arg);
            }
            None => {
                drop(state);
                this.idle.notify_waiters();
            }
        }
    }

    fn start(this: &Arc<Self>, handle: &Handle, arg: A) {
        let release = Release {
            inner: Arc::clone(this),
            handle: handle.clone(),
        };

        handle.spawn(async move {
            if let Err(err) = (release.inner.task)(arg).await {
                (release.inner.on_error)(err);
            }
            drop(release);
        });
    }

    fn finish(this: &Arc<Self>, handle: &Handle) {
        let mut state = this.state.lock();
        state.running = false;
        state.last_finished = Some(Instant::now());

        if state.pending.is_some() {
            state.scheduled = true;
            drop(state);
            Inner::schedule(this, handle, this.interval);
        } else {
            drop(state);
            this.idle.notify_waiters();
        }
    }
}

/// Clears the running flag when a run ends, including by panic
struct Release<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    inner: Arc<Inner<A, E>>,
    handle: Handle,
}

impl<A, E> Drop for Release<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    fn drop(&mut self) {
        Inner::finish(&self.inner, &self.handle);
    }
}

impl<A, E> Clone for AsyncThrottle<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, E> Debug for AsyncThrottle<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("AsyncThrottle")
            .field("interval", &self.inner.interval)
            .field("running", &state.running)
            .field("scheduled", &state.scheduled)
            .field("pending", &state.pending.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Log = Arc<Mutex<Vec<(u32, u128)>>>;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    /// Throttle that records (argument, millis since creation) at the start of each run
    fn recording(interval: Duration, work: Duration, log: Log) -> AsyncThrottle<u32, String> {
        let origin = Instant::now();
        AsyncThrottle::new(interval, move |n: u32| {
            let log = Arc::clone(&log);
            async move {
                log.lock().push((n, origin.elapsed().as_millis()));
                sleep(work).await;
                Ok(())
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_call_runs_immediately() {
        let log = Log::default();
        let throttle = recording(ms(1000), ms(10), log.clone());

        throttle.call(1);
        throttle.until_idle().await;

        assert_eq!(*log.lock(), vec![(1, 0)]);
        assert!(throttle.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_to_latest() {
        let log = Log::default();
        let throttle = recording(ms(1000), ms(10), log.clone());

        for n in 1..=5 {
            throttle.call(n);
        }
        throttle.until_idle().await;

        // First call runs right away, 2..=4 are superseded, 5 runs once the
        // first run finished (t=10) and the interval elapsed
        assert_eq!(*log.lock(), vec![(1, 0), (5, 1010)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_out_interval_after_completion() {
        let log = Log::default();
        let throttle = recording(ms(1000), ms(10), log.clone());

        throttle.call(1);
        throttle.until_idle().await;

        // Too soon after the first run finished
        throttle.call(2);
        throttle.until_idle().await;

        // Long after: runs immediately again
        sleep(ms(2000)).await;
        throttle.call(3);
        throttle.until_idle().await;

        assert_eq!(*log.lock(), vec![(1, 0), (2, 1010), (3, 3020)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_run_uses_latest_argument_at_fire_time() {
        let log = Log::default();
        let throttle = recording(ms(1000), ms(10), log.clone());

        throttle.call(1);
        throttle.call(2);
        // 2 is parked; the deferred run is only scheduled once run 1 finishes at t=10
        sleep(ms(500)).await;
        throttle.call(3);
        throttle.until_idle().await;

        assert_eq!(*log.lock(), vec![(1, 0), (3, 1010)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_still_collapses() {
        let log = Log::default();
        let throttle = recording(Duration::ZERO, ms(10), log.clone());

        throttle.call(1);
        throttle.call(2);
        throttle.call(3);
        throttle.until_idle().await;

        assert_eq!(*log.lock(), vec![(1, 0), (3, 10)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_never_overlap() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));

        let throttle = {
            let (active, peak, runs) = (active.clone(), peak.clone(), runs.clone());
            AsyncThrottle::new(Duration::ZERO, move |_: u32| {
                let (active, peak, runs) = (active.clone(), peak.clone(), runs.clone());
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    runs.fetch_add(1, Ordering::SeqCst);
                    sleep(ms(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<(), String>(())
                }
            })
        };

        for n in 0..20 {
            throttle.call(n);
            if n % 3 == 0 {
                sleep(ms(2)).await;
            }
        }
        throttle.until_idle().await;

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(runs.load(Ordering::SeqCst) < 20);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_call_releases_throttle() {
        let log = Log::default();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let origin = Instant::now();

        let throttle = {
            let (log, errors) = (log.clone(), errors.clone());
            AsyncThrottle::with_error_hook(
                ms(100),
                move |n: u32| {
                    let log = log.clone();
                    async move {
                        log.lock().push((n, origin.elapsed().as_millis()));
                        if n == 1 {
                            return Err(format!("boom {}", n));
                        }
                        Ok(())
                    }
                },
                move |err: String| errors.lock().push(err),
            )
        };

        throttle.call(1);
        throttle.until_idle().await;
        throttle.call(2);
        throttle.until_idle().await;

        assert_eq!(*errors.lock(), vec!["boom 1".to_string()]);
        assert_eq!(*log.lock(), vec![(1, 0), (2, 100)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_call_releases_throttle() {
        let log = Log::default();
        let throttle = {
            let log = log.clone();
            AsyncThrottle::new(ms(50), move |n: u32| {
                let log = log.clone();
                async move {
                    if n == 1 {
                        panic!("task blew up");
                    }
                    log.lock().push((n, 0));
                    Ok::<(), String>(())
                }
            })
        };

        throttle.call(1);
        throttle.until_idle().await;
        throttle.call(2);
        throttle.until_idle().await;

        assert_eq!(*log.lock(), vec![(2, 0)]);
        assert!(throttle.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_reporting() {
        let log = Log::default();
        let throttle = recording(ms(100), ms(10), log.clone());
        assert!(throttle.is_idle());

        throttle.call(1);
        throttle.call(2);
        assert!(!throttle.is_idle());

        throttle.until_idle().await;
        assert!(throttle.is_idle());
        assert_eq!(throttle.interval(), ms(100));
    }

    fn args(log: &Log) -> Vec<u32> {
        log.lock().iter().map(|(n, _)| *n).collect()
    }

    fn paused_runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap()
    }

    #[test]
    fn test_call_outside_runtime_resumes_on_until_idle() {
        let log = Log::default();
        let throttle = recording(ms(1000), ms(10), log.clone());

        throttle.call(1);
        assert!(!throttle.is_idle());

        paused_runtime().block_on(async {
            let drained = tokio::time::timeout(ms(5000), throttle.until_idle()).await;
            assert!(drained.is_ok());
        });

        assert_eq!(args(&log), vec![1]);
        assert!(throttle.is_idle());
    }

    #[test]
    fn test_call_inside_runtime_supersedes_stranded_argument() {
        let log = Log::default();
        let throttle = recording(ms(1000), ms(10), log.clone());

        throttle.call(1);

        paused_runtime().block_on(async {
            throttle.call(2);
            throttle.until_idle().await;
        });

        assert_eq!(args(&log), vec![2]);
    }
}
