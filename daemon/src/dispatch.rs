//! The dispatch loop: the single consumer of the event queue.
//!
//! Each event is matched against the [`PathRegistry`]; for every matching rule
//! the rule's commands run in order on the loop's own task, so a slow command
//! delays the events queued behind it. A failing command is logged and ends
//! that rule's command list for that event only. The loop itself keeps going.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;

use crate::event::FileEvent;
use crate::exec::CommandRunner;
use crate::registry::PathRegistry;

/// Lifecycle phase of the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting on the event queue.
    Idle,
    /// Running commands for an event.
    Processing,
    /// Shutdown requested; in-flight work is finishing.
    Draining,
    Stopped,
}

/// Process-wide state shared by the dispatch loop and the shutdown path.
///
/// `shutting_down` flips to `true` exactly once. `in_flight` counts events
/// currently being processed; waiters on [`DaemonState::wait_idle`] are woken
/// when it returns to zero.
#[derive(Debug, Default)]
pub struct DaemonState {
    shutting_down: AtomicBool,
    stopped: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl DaemonState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Returns `true` only for the call that actually flipped the flag.
    fn begin_shutdown(&self) -> bool {
        !self.shutting_down.swap(true, Ordering::SeqCst)
    }

    fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> Phase {
        if self.stopped.load(Ordering::SeqCst) {
            Phase::Stopped
        } else if self.is_shutting_down() {
            Phase::Draining
        } else if self.in_flight() > 0 {
            Phase::Processing
        } else {
            Phase::Idle
        }
    }

    fn begin_work(self: &Arc<Self>) -> WorkGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        WorkGuard { state: Arc::clone(self) }
    }

    /// Resolves once no event is being processed.
    pub async fn wait_idle(&self) {
        loop {
            // Registered before the check so a concurrent notify_waiters is not missed.
            let notified = self.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Decrements the outstanding-work counter when dropped.
struct WorkGuard {
    state: Arc<DaemonState>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        if self.state.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.state.idle.notify_waiters();
        }
    }
}

/// Counters reported when the loop stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    /// Events pulled from the queue.
    pub events: u64,
    /// Events dropped because their path could not be stat'ed.
    pub skipped: u64,
    pub commands_run: u64,
    pub commands_failed: u64,
}

/// Handle to a running dispatch loop.
pub struct DispatchHandle {
    state: Arc<DaemonState>,
    /// Setting this to `true` wakes the loop out of its queue receive.
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<DispatchStats>,
}

impl DispatchHandle {
    pub fn state(&self) -> &Arc<DaemonState> {
        &self.state
    }

    /// Stops the loop from pulling further events. Work already in flight
    /// is not interrupted.
    pub fn request_shutdown(&self) {
        if self.state.begin_shutdown() {
            tracing::info!("Dispatch shutdown requested");
        }
        let _ = self.stop_tx.send(true);
    }

    /// Waits for in-flight work to drain and the loop to exit.
    pub async fn await_shutdown(self) -> DispatchStats {
        self.state.wait_idle().await;
        let stats = match self.task.await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::error!(error = %e, "Dispatch task ended abnormally");
                DispatchStats::default()
            }
        };
        self.state.mark_stopped();
        stats
    }
}

/// Spawns the dispatch loop over `events`.
pub fn start<R: CommandRunner>(
    registry: Arc<PathRegistry>,
    events: mpsc::Receiver<FileEvent>,
    runner: R,
) -> DispatchHandle {
    let state = Arc::new(DaemonState::new());
    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(run(registry, events, runner, Arc::clone(&state), stop_rx));
    DispatchHandle { state, stop_tx, task }
}

async fn run<R: CommandRunner>(
    registry: Arc<PathRegistry>,
    mut events: mpsc::Receiver<FileEvent>,
    runner: R,
    state: Arc<DaemonState>,
    mut stop_rx: watch::Receiver<bool>,
) -> DispatchStats {
    let mut stats = DispatchStats::default();

    loop {
        // An event already pulled when shutdown lands is still processed.
        if state.is_shutting_down() {
            break;
        }

        let event = tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            received = events.recv() => match received {
                Some(event) => event,
                None => break,
            },
        };

        let _guard = state.begin_work();
        stats.events += 1;
        dispatch_event(&registry, &runner, &event, &mut stats).await;
    }

    tracing::info!(
        events = stats.events,
        skipped = stats.skipped,
        commands_run = stats.commands_run,
        commands_failed = stats.commands_failed,
        "Dispatch loop stopped"
    );
    stats
}

async fn dispatch_event<R: CommandRunner>(
    registry: &PathRegistry,
    runner: &R,
    event: &FileEvent,
    stats: &mut DispatchStats,
) {
    let changed = event.path.display();

    if let Err(e) = tokio::fs::metadata(&event.path).await {
        tracing::error!(
            changed = %changed,
            error = %e,
            "Can't stat file or directory via event from watcher"
        );
        stats.skipped += 1;
        return;
    }

    let mut matched = false;
    for rule in registry.matching(&event.path) {
        matched = true;
        let monitored = rule.path.display();

        for line in &rule.commands {
            let outcome = runner.run(&rule.invocation(line)).await;
            stats.commands_run += 1;

            match &outcome.failure {
                Some(failure) => {
                    stats.commands_failed += 1;
                    tracing::error!(
                        monitored = %monitored,
                        changed = %changed,
                        command = %line,
                        output = %outcome.output,
                        error = %failure,
                        "Run command"
                    );
                    break;
                }
                None => tracing::info!(
                    monitored = %monitored,
                    changed = %changed,
                    command = %line,
                    output = %outcome.output,
                    "Run command"
                ),
            }
        }
    }

    if !matched {
        tracing::debug!(changed = %changed, kind = ?event.kind, "No watch rule matched event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::FileEventKind;
    use crate::exec::{CommandFailure, CommandOutcome, Invocation};
    use crate::registry::{PathMatch, WatchRule};
    use crate::tokenizer::bin_and_args;
    use std::future::Future;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Records every invocation; lines listed in `failing` report a spawn failure.
    #[derive(Clone, Default)]
    struct RecordingRunner {
        calls: Arc<Mutex<Vec<Invocation>>>,
        failing: Vec<String>,
    }

    impl RecordingRunner {
        fn failing(lines: &[&str]) -> Self {
            Self {
                calls: Arc::default(),
                failing: lines.iter().map(|s| s.to_string()).collect(),
            }
        }

        fn lines(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|i| i.line.clone()).collect()
        }
    }

    impl CommandRunner for RecordingRunner {
        fn run(&self, invocation: &Invocation) -> impl Future<Output = CommandOutcome> + Send {
            self.calls.lock().unwrap().push(invocation.clone());
            let fails = self.failing.contains(&invocation.line);
            async move {
                if fails {
                    CommandOutcome {
                        output: "boom".to_string(),
                        failure: Some(CommandFailure::Spawn {
                            program: "x".to_string(),
                            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
                        }),
                    }
                } else {
                    CommandOutcome { output: "ok".to_string(), failure: None }
                }
            }
        }
    }

    /// Blocks every run until the test adds permits, announcing each start.
    #[derive(Clone)]
    struct GatedRunner {
        gate: Arc<Semaphore>,
        started: mpsc::UnboundedSender<String>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl CommandRunner for GatedRunner {
        fn run(&self, invocation: &Invocation) -> impl Future<Output = CommandOutcome> + Send {
            let runner = self.clone();
            let line = invocation.line.clone();
            async move {
                runner.calls.lock().unwrap().push(line.clone());
                let _ = runner.started.send(line);
                let _permit = runner.gate.acquire().await;
                CommandOutcome { output: String::new(), failure: None }
            }
        }
    }

    fn commands(lines: &[&str]) -> Vec<String> {
        lines.iter().map(|s| s.to_string()).collect()
    }

    fn registry(rules: Vec<WatchRule>) -> Arc<PathRegistry> {
        let mut registry = PathRegistry::new(PathMatch::Prefix);
        for rule in rules {
            registry.insert(rule);
        }
        Arc::new(registry)
    }

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"x").unwrap();
        path
    }

    fn close_write(path: PathBuf) -> FileEvent {
        FileEvent { path, kind: FileEventKind::CloseWrite }
    }

    // ── DaemonState ───────────────────────────────────────────────────────────

    #[test]
    fn new_state_is_idle() {
        let state = DaemonState::new();
        assert_eq!(state.phase(), Phase::Idle);
        assert!(!state.is_shutting_down());
        assert_eq!(state.in_flight(), 0);
    }

    #[test]
    fn shutdown_flag_flips_once() {
        let state = DaemonState::new();
        assert!(state.begin_shutdown());
        assert!(!state.begin_shutdown());
        assert!(state.is_shutting_down());
        assert_eq!(state.phase(), Phase::Draining);
    }

    #[test]
    fn work_guard_tracks_in_flight() {
        let state = Arc::new(DaemonState::new());
        let a = state.begin_work();
        let b = state.begin_work();
        assert_eq!(state.in_flight(), 2);
        assert_eq!(state.phase(), Phase::Processing);
        drop(a);
        drop(b);
        assert_eq!(state.in_flight(), 0);
        assert_eq!(state.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn wait_idle_returns_immediately_without_work() {
        let state = DaemonState::new();
        tokio::time::timeout(Duration::from_secs(1), state.wait_idle())
            .await
            .expect("wait_idle should not block");
    }

    #[tokio::test]
    async fn wait_idle_wakes_when_last_guard_drops() {
        let state = Arc::new(DaemonState::new());
        let guard = state.begin_work();

        let waiter = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.wait_idle().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    // ── dispatch ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn matching_event_runs_command_once() {
        let dir = tempfile::tempdir().unwrap();
        let file = touch(dir.path(), "file.txt");
        let runner = RecordingRunner::default();
        let (tx, rx) = mpsc::channel(1);
        let handle = start(
            registry(vec![WatchRule::new(dir.path(), false, commands(&["echo hi"]))]),
            rx,
            runner.clone(),
        );

        tx.send(close_write(file)).await.unwrap();
        drop(tx);
        let stats = handle.await_shutdown().await;

        let calls = runner.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        let (program, args) = bin_and_args(&calls[0].line);
        assert_eq!(program, "echo");
        assert_eq!(args, vec!["hi".to_string()]);
        assert_eq!(stats.events, 1);
        assert_eq!(stats.commands_run, 1);
    }

    #[tokio::test]
    async fn commands_run_in_configured_order_for_every_matching_rule() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let file = touch(&sub, "f");
        let runner = RecordingRunner::default();
        let (tx, rx) = mpsc::channel(1);
        let handle = start(
            registry(vec![
                WatchRule::new(dir.path(), true, commands(&["a1", "a2"])),
                WatchRule::new(&sub, false, commands(&["b1"])),
            ]),
            rx,
            runner.clone(),
        );

        tx.send(close_write(file)).await.unwrap();
        drop(tx);
        handle.await_shutdown().await;

        assert_eq!(runner.lines(), commands(&["a1", "a2", "b1"]));
    }

    #[tokio::test]
    async fn failing_command_stops_its_rule_but_not_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let first = touch(&sub, "first");
        let second = touch(&sub, "second");
        let runner = RecordingRunner::failing(&["bad"]);
        let (tx, rx) = mpsc::channel(1);
        let handle = start(
            registry(vec![
                WatchRule::new(dir.path(), true, commands(&["bad", "never"])),
                WatchRule::new(&sub, false, commands(&["other"])),
            ]),
            rx,
            runner.clone(),
        );

        tx.send(close_write(first)).await.unwrap();
        tx.send(close_write(second)).await.unwrap();
        drop(tx);
        let stats = handle.await_shutdown().await;

        assert_eq!(runner.lines(), commands(&["bad", "other", "bad", "other"]));
        assert_eq!(stats.events, 2);
        assert_eq!(stats.commands_failed, 2);
        assert_eq!(stats.commands_run, 4);
    }

    #[tokio::test]
    async fn unmatched_event_runs_nothing() {
        let watched = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let file = touch(elsewhere.path(), "f");
        let runner = RecordingRunner::default();
        let (tx, rx) = mpsc::channel(1);
        let handle = start(
            registry(vec![WatchRule::new(watched.path(), true, commands(&["x"]))]),
            rx,
            runner.clone(),
        );

        tx.send(close_write(file)).await.unwrap();
        drop(tx);
        let stats = handle.await_shutdown().await;

        assert!(runner.lines().is_empty());
        assert_eq!(stats.events, 1);
    }

    #[tokio::test]
    async fn vanished_path_is_skipped_and_processing_continues() {
        let dir = tempfile::tempdir().unwrap();
        let present = touch(dir.path(), "present");
        let runner = RecordingRunner::default();
        let (tx, rx) = mpsc::channel(1);
        let handle = start(
            registry(vec![WatchRule::new(dir.path(), false, commands(&["x"]))]),
            rx,
            runner.clone(),
        );

        tx.send(close_write(dir.path().join("gone"))).await.unwrap();
        tx.send(close_write(present)).await.unwrap();
        drop(tx);
        let stats = handle.await_shutdown().await;

        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.events, 2);
        assert_eq!(runner.lines(), commands(&["x"]));
    }

    #[tokio::test]
    async fn rule_settings_reach_the_runner() {
        let dir = tempfile::tempdir().unwrap();
        let file = touch(dir.path(), "f");
        let mut rule = WatchRule::new(dir.path(), false, commands(&["ls"]));
        rule.shell = Some("/bin/sh".to_string());
        rule.timeout = Some(Duration::from_secs(9));
        let runner = RecordingRunner::default();
        let (tx, rx) = mpsc::channel(1);
        let handle = start(registry(vec![rule]), rx, runner.clone());

        tx.send(close_write(file)).await.unwrap();
        drop(tx);
        handle.await_shutdown().await;

        let calls = runner.calls.lock().unwrap().clone();
        assert_eq!(calls[0].shell.as_deref(), Some("/bin/sh"));
        assert_eq!(calls[0].timeout, Some(Duration::from_secs(9)));
    }

    // ── shutdown ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn shutdown_finishes_in_flight_event_and_pulls_no_more() {
        let dir = tempfile::tempdir().unwrap();
        let first = touch(dir.path(), "first");
        let second = touch(dir.path(), "second");
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let runner = GatedRunner {
            gate: Arc::new(Semaphore::new(0)),
            started: started_tx,
            calls: Arc::default(),
        };
        let (tx, rx) = mpsc::channel(1);
        let handle = start(
            registry(vec![WatchRule::new(dir.path(), false, commands(&["slow"]))]),
            rx,
            runner.clone(),
        );

        tx.send(close_write(first)).await.unwrap();
        started_rx.recv().await.unwrap();
        assert_eq!(handle.state().phase(), Phase::Processing);

        handle.request_shutdown();
        assert_eq!(handle.state().phase(), Phase::Draining);
        // Queued behind the in-flight event; must never be pulled.
        tx.send(close_write(second)).await.unwrap();

        runner.gate.add_permits(10);
        let state = Arc::clone(handle.state());
        let stats = tokio::time::timeout(Duration::from_secs(5), handle.await_shutdown())
            .await
            .expect("shutdown should complete");

        assert_eq!(stats.events, 1);
        assert_eq!(runner.calls.lock().unwrap().len(), 1);
        assert_eq!(state.in_flight(), 0);
        assert_eq!(state.phase(), Phase::Stopped);
    }

    #[tokio::test]
    async fn shutdown_wakes_a_loop_blocked_on_an_empty_queue() {
        let (_tx, rx) = mpsc::channel::<FileEvent>(1);
        let handle = start(registry(Vec::new()), rx, RecordingRunner::default());
        tokio::task::yield_now().await;

        handle.request_shutdown();
        let stats = tokio::time::timeout(Duration::from_secs(5), handle.await_shutdown())
            .await
            .expect("idle loop should stop");
        assert_eq!(stats, DispatchStats::default());
    }
}
