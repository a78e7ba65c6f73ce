//! Debounced grammar review of the editing surface.
//!
//! State machine (one actor task owns it):
//! ```text
//!          change              timer fires             result
//!   Idle ─────────► Pending ───────────────► Checking ─────────► Idle
//!    ▲               │  ▲ change: re-arm         │  change: arm rearm deadline
//!    │  too short    │  └──────────┘             │  rearm fires: skipped
//!    └───────────────┘                           └─ rearm still ahead ─► Pending
//! ```
//!
//! - Bursts of changes collapse into one check, `debounce` after the last.
//! - Never two checks in flight. A timer that fires while checking is
//!   skipped; a change made during a check is re-armed once it completes
//!   if its deadline has not passed yet.
//! - Text shorter than `min_chars` (trimmed) clears the issues, no request.
//! - Success replaces the issues wholesale and re-marks the surface;
//!   failure keeps the previous issues and records `last_error`.

use std::sync::Arc;
use std::time::Duration;

use quire_core::{EditingSurface, ListenerHandle, Marker};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::ai::AssistError;
use crate::grammar::{GrammarChecker, GrammarIssue};

/// Review cycle configuration.
#[derive(Debug, Clone)]
pub struct ReviewConfig {
    /// Quiet period after the last change
    pub debounce: Duration,
    /// Minimum trimmed length, in characters, worth checking
    pub min_chars: usize,
    pub enabled: bool,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1500),
            min_chars: 5,
            enabled: true,
        }
    }
}

/// Observable phase of the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewPhase {
    Idle,
    Pending,
    Checking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Pending { deadline: Instant },
    Checking { rearm: Option<Instant> },
}

impl Phase {
    fn observable(self) -> ReviewPhase {
        match self {
            Phase::Idle => ReviewPhase::Idle,
            Phase::Pending { .. } => ReviewPhase::Pending,
            Phase::Checking { .. } => ReviewPhase::Checking,
        }
    }

    fn timer(self) -> Option<Instant> {
        match self {
            Phase::Idle => None,
            Phase::Pending { deadline } => Some(deadline),
            Phase::Checking { rearm } => rearm,
        }
    }
}

#[derive(Debug)]
enum Command {
    Changed,
    CheckNow,
    SetEnabled(bool),
    Toggle,
    Shutdown,
}

type CheckResult = Result<Vec<GrammarIssue>, AssistError>;

struct Observables {
    issues: watch::Sender<Vec<GrammarIssue>>,
    phase: watch::Sender<ReviewPhase>,
    last_error: watch::Sender<Option<String>>,
    enabled: watch::Sender<bool>,
    completed: watch::Sender<u64>,
}

/// Handle to a running review cycle.
pub struct ReviewCycle {
    commands: mpsc::UnboundedSender<Command>,
    issues: watch::Receiver<Vec<GrammarIssue>>,
    phase: watch::Receiver<ReviewPhase>,
    last_error: watch::Receiver<Option<String>>,
    enabled: watch::Receiver<bool>,
    completed: watch::Receiver<u64>,
    task: Option<JoinHandle<()>>,
}

impl ReviewCycle {
    /// Start reviewing `surface`. Subscribes to its change events.
    pub fn start(
        surface: Arc<dyn EditingSurface>,
        checker: GrammarChecker,
        config: ReviewConfig,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let observables = Observables {
            issues: watch::Sender::new(Vec::new()),
            phase: watch::Sender::new(ReviewPhase::Idle),
            last_error: watch::Sender::new(None),
            enabled: watch::Sender::new(config.enabled),
            completed: watch::Sender::new(0),
        };

        let issues = observables.issues.subscribe();
        let phase = observables.phase.subscribe();
        let last_error = observables.last_error.subscribe();
        let enabled = observables.enabled.subscribe();
        let completed = observables.completed.subscribe();

        let changes = commands.clone();
        let listener = surface.on_change(Box::new(move || {
            let _ = changes.send(Command::Changed);
        }));

        let actor = ReviewActor {
            surface,
            listener,
            checker,
            enabled: config.enabled,
            config,
            phase: Phase::Idle,
            inflight: None,
            observables,
        };
        let task = tokio::spawn(actor.run(rx));

        Self {
            commands,
            issues,
            phase,
            last_error,
            enabled,
            completed,
            task: Some(task),
        }
    }

    /// Report a content change (the surface listener does this too).
    pub fn notify_changed(&self) {
        let _ = self.commands.send(Command::Changed);
    }

    /// Cancel the pending timer and check immediately, unless a check is
    /// already in flight.
    pub fn check_now(&self) {
        let _ = self.commands.send(Command::CheckNow);
    }

    pub fn set_enabled(&self, enabled: bool) {
        let _ = self.commands.send(Command::SetEnabled(enabled));
    }

    pub fn toggle(&self) {
        let _ = self.commands.send(Command::Toggle);
    }

    pub fn issues(&self) -> Vec<GrammarIssue> {
        self.issues.borrow().clone()
    }

    pub fn phase(&self) -> ReviewPhase {
        *self.phase.borrow()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.borrow().clone()
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.borrow()
    }

    /// Number of checks that reached the collaborator and returned.
    pub fn completed_checks(&self) -> u64 {
        *self.completed.borrow()
    }

    pub fn subscribe_issues(&self) -> watch::Receiver<Vec<GrammarIssue>> {
        self.issues.clone()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<ReviewPhase> {
        self.phase.clone()
    }

    /// Stop the actor. Pending timers are dropped, an in-flight request is
    /// aborted and the change listener is removed from the surface.
    pub async fn shutdown(mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ReviewCycle {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

struct ReviewActor {
    surface: Arc<dyn EditingSurface>,
    listener: ListenerHandle,
    checker: GrammarChecker,
    config: ReviewConfig,
    enabled: bool,
    phase: Phase,
    inflight: Option<JoinHandle<CheckResult>>,
    observables: Observables,
}

impl ReviewActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let timer = self.phase.timer();
            tokio::select! {
                command = commands.recv() => match command {
                    None | Some(Command::Shutdown) => break,
                    Some(command) => self.handle(command),
                },
                _ = wait_until(timer) => self.timer_fired(),
                result = join_inflight(&mut self.inflight) => {
                    self.inflight = None;
                    self.complete(result);
                }
            }
        }
        if let Some(inflight) = self.inflight.take() {
            inflight.abort();
        }
        self.surface.off_change(self.listener);
        log::debug!("Review cycle stopped");
    }

    fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
        self.observables.phase.send_replace(phase.observable());
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Changed => {
                if !self.enabled {
                    return;
                }
                let deadline = Instant::now() + self.config.debounce;
                match self.phase {
                    Phase::Idle | Phase::Pending { .. } => self.set_phase(Phase::Pending { deadline }),
                    Phase::Checking { .. } => self.set_phase(Phase::Checking { rearm: Some(deadline) }),
                }
            }
            Command::CheckNow => {
                if !self.enabled {
                    return;
                }
                match self.phase {
                    Phase::Checking { .. } => {
                        log::debug!("Review skipped: check already in flight");
                        self.set_phase(Phase::Checking { rearm: None });
                    }
                    Phase::Idle | Phase::Pending { .. } => self.begin_check(),
                }
            }
            Command::SetEnabled(enabled) => self.set_enabled(enabled),
            Command::Toggle => self.set_enabled(!self.enabled),
            Command::Shutdown => {}
        }
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        self.observables.enabled.send_replace(enabled);
        log::info!("Auto review {}", if enabled { "enabled" } else { "disabled" });
        if enabled {
            return;
        }
        // An in-flight check runs to completion; its result is discarded.
        let phase = match self.phase {
            Phase::Checking { .. } => Phase::Checking { rearm: None },
            Phase::Idle | Phase::Pending { .. } => Phase::Idle,
        };
        self.set_phase(phase);
        self.clear_issues();
    }

    fn timer_fired(&mut self) {
        match self.phase {
            Phase::Pending { .. } => self.begin_check(),
            Phase::Checking { .. } => {
                log::debug!("Review skipped: check already in flight");
                self.set_phase(Phase::Checking { rearm: None });
            }
            Phase::Idle => {}
        }
    }

    fn begin_check(&mut self) {
        let text = self.surface.plain_text();
        if text.trim().chars().count() < self.config.min_chars {
            log::debug!("Review skipped: text below {} characters", self.config.min_chars);
            self.set_phase(Phase::Idle);
            self.clear_issues();
            return;
        }

        self.set_phase(Phase::Checking { rearm: None });
        let checker = self.checker.clone();
        self.inflight = Some(tokio::spawn(async move { checker.check_text(&text).await }));
    }

    fn complete(&mut self, result: CheckResult) {
        self.observables.completed.send_modify(|n| *n += 1);
        if !self.enabled {
            log::debug!("Review result discarded: auto review disabled");
            self.set_phase(Phase::Idle);
            return;
        }

        match result {
            Ok(issues) => {
                self.surface.clear_markers(Marker::Underline);
                for issue in &issues {
                    if let Err(e) = self.surface.mark_span(issue.span(), Marker::Underline) {
                        log::warn!("Could not mark {:?}: {e}", issue.span());
                    }
                }
                log::debug!("Review found {} issues", issues.len());
                self.observables.issues.send_replace(issues);
                self.observables.last_error.send_replace(None);
            }
            Err(e) => {
                log::error!("Review failed: {e}");
                self.observables.last_error.send_replace(Some(e.to_string()));
            }
        }

        let next = match self.phase {
            Phase::Checking { rearm: Some(deadline) } if deadline > Instant::now() => {
                Phase::Pending { deadline }
            }
            _ => Phase::Idle,
        };
        self.set_phase(next);
    }

    fn clear_issues(&mut self) {
        self.surface.clear_markers(Marker::Underline);
        self.observables.issues.send_replace(Vec::new());
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn join_inflight(inflight: &mut Option<JoinHandle<CheckResult>>) -> CheckResult {
    match inflight {
        Some(handle) => handle.await.unwrap_or_else(|e| {
            log::error!("Review task failed: {e}");
            Err(AssistError::Unavailable)
        }),
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::TextTransform;
    use async_trait::async_trait;
    use quire_core::{ChangeListener, SurfaceError, TextSpan};
    use std::sync::atomic::AtomicU64;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const ONE_ISSUE: &str = r#"```json
{"issues":[{"type":"spelling","position":{"start":0,"end":5},"original":"Helo,","suggestion":"Hello,","reason":"typo","severity":"low"}]}
```"#;

    #[derive(Default)]
    struct FakeSurface {
        text: Mutex<String>,
        next_listener: AtomicU64,
        listeners: Mutex<Vec<(ListenerHandle, ChangeListener)>>,
        markers: Mutex<Vec<TextSpan>>,
    }

    impl FakeSurface {
        fn edit(&self, text: &str) {
            *self.text.lock().unwrap() = text.to_string();
            for (_, listener) in self.listeners.lock().unwrap().iter() {
                listener();
            }
        }
    }

    impl EditingSurface for FakeSurface {
        fn plain_text(&self) -> String {
            self.text.lock().unwrap().clone()
        }

        fn on_change(&self, listener: ChangeListener) -> ListenerHandle {
            let handle = ListenerHandle(self.next_listener.fetch_add(1, Ordering::Relaxed));
            self.listeners.lock().unwrap().push((handle, listener));
            handle
        }

        fn off_change(&self, handle: ListenerHandle) {
            self.listeners.lock().unwrap().retain(|(h, _)| *h != handle);
        }

        fn mark_span(&self, span: TextSpan, _marker: Marker) -> Result<(), SurfaceError> {
            self.markers.lock().unwrap().push(span);
            Ok(())
        }

        fn clear_markers(&self, _marker: Marker) {
            self.markers.lock().unwrap().clear();
        }
    }

    /// Scripted collaborator: pops replies in order, repeats the last one.
    struct ScriptedTransform {
        replies: Mutex<Vec<CheckReply>>,
        latency: Duration,
        calls: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    #[derive(Clone)]
    enum CheckReply {
        Text(&'static str),
        Fail,
    }

    impl ScriptedTransform {
        fn new(latency: Duration, replies: Vec<CheckReply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies),
                latency,
                calls: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TextTransform for ScriptedTransform {
        async fn transform(&self, _prompt: &str) -> Result<String, AssistError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            let reply = {
                let mut replies = self.replies.lock().unwrap();
                if replies.len() > 1 { replies.remove(0) } else { replies[0].clone() }
            };
            match reply {
                CheckReply::Text(text) => Ok(text.to_string()),
                CheckReply::Fail => Err(AssistError::Unavailable),
            }
        }
    }

    fn start(
        transform: Arc<ScriptedTransform>,
        config: ReviewConfig,
    ) -> (Arc<FakeSurface>, ReviewCycle) {
        let surface = Arc::new(FakeSurface::default());
        let review = ReviewCycle::start(surface.clone(), GrammarChecker::new(transform), config);
        (surface, review)
    }

    async fn advance(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_into_one_check() {
        let transform = ScriptedTransform::new(Duration::ZERO, vec![CheckReply::Text(ONE_ISSUE)]);
        let (surface, review) = start(transform.clone(), ReviewConfig::default());

        surface.edit("Helo, world");
        advance(200).await;
        surface.edit("Helo, world!");
        advance(200).await;
        surface.edit("Helo, world!!");
        assert_eq!(review.phase(), ReviewPhase::Pending);

        // t = 400; the check is due at t = 1900.
        advance(1499).await;
        assert_eq!(transform.calls(), 0);

        advance(2).await;
        assert_eq!(transform.calls(), 1);
        advance(3000).await;
        assert_eq!(transform.calls(), 1);
        assert_eq!(review.completed_checks(), 1);
        assert_eq!(review.issues().len(), 1);
        assert_eq!(review.phase(), ReviewPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_issues_marked_on_surface() {
        let transform = ScriptedTransform::new(Duration::ZERO, vec![CheckReply::Text(ONE_ISSUE)]);
        let (surface, review) = start(transform, ReviewConfig::default());

        surface.edit("Helo, world");
        advance(2000).await;
        assert_eq!(*surface.markers.lock().unwrap(), vec![TextSpan::new(0, 5)]);
        assert_eq!(review.issues()[0].suggestion, "Hello,");
        assert!(review.last_error().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_while_checking_never_overlaps() {
        let transform = ScriptedTransform::new(
            Duration::from_millis(1000),
            vec![CheckReply::Text(ONE_ISSUE)],
        );
        let (surface, review) = start(transform.clone(), ReviewConfig::default());

        surface.edit("Helo, world");
        advance(1600).await; // check running from t = 1500 to 2500
        assert_eq!(review.phase(), ReviewPhase::Checking);

        surface.edit("Helo, world again"); // re-armed for t = 3100
        advance(500).await;
        assert_eq!(transform.calls(), 1);

        advance(3000).await;
        assert_eq!(transform.calls(), 2);
        assert_eq!(transform.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(review.phase(), ReviewPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_firing_during_check_is_skipped() {
        let transform = ScriptedTransform::new(
            Duration::from_millis(3000),
            vec![CheckReply::Text(ONE_ISSUE)],
        );
        let (surface, review) = start(transform.clone(), ReviewConfig::default());

        surface.edit("Helo, world");
        advance(2000).await; // check running from t = 1500 to 4500
        surface.edit("Helo, world again"); // timer due t = 3500, still checking
        advance(5000).await;

        assert_eq!(transform.calls(), 1);
        assert_eq!(review.completed_checks(), 1);
        assert_eq!(review.phase(), ReviewPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_text_never_checked() {
        let transform = ScriptedTransform::new(Duration::ZERO, vec![CheckReply::Text(ONE_ISSUE)]);
        let (surface, review) = start(transform.clone(), ReviewConfig::default());

        surface.edit("abc");
        advance(5000).await;
        assert_eq!(transform.calls(), 0);
        assert!(review.issues().is_empty());

        surface.edit("   abcd   ");
        advance(5000).await;
        assert_eq!(transform.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_text_clears_previous_issues() {
        let transform = ScriptedTransform::new(Duration::ZERO, vec![CheckReply::Text(ONE_ISSUE)]);
        let (surface, review) = start(transform, ReviewConfig::default());

        surface.edit("Helo, world");
        advance(2000).await;
        assert_eq!(review.issues().len(), 1);

        surface.edit("Hi");
        advance(2000).await;
        assert!(review.issues().is_empty());
        assert!(surface.markers.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_keeps_previous_issues() {
        let transform = ScriptedTransform::new(
            Duration::ZERO,
            vec![CheckReply::Text(ONE_ISSUE), CheckReply::Fail],
        );
        let (surface, review) = start(transform.clone(), ReviewConfig::default());

        surface.edit("Helo, world");
        advance(2000).await;
        let before = review.issues();
        assert_eq!(before.len(), 1);

        surface.edit("Helo, world, again");
        advance(2000).await;
        assert_eq!(transform.calls(), 2);
        assert_eq!(review.issues(), before);
        assert_eq!(review.last_error().as_deref(), Some("AI unavailable"));
        assert_eq!(review.phase(), ReviewPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_json_reply_clears_to_empty() {
        let transform = ScriptedTransform::new(
            Duration::ZERO,
            vec![CheckReply::Text(ONE_ISSUE), CheckReply::Text("I found no problems.")],
        );
        let (surface, review) = start(transform, ReviewConfig::default());

        surface.edit("Helo, world");
        advance(2000).await;
        surface.edit("Hello, world");
        advance(2000).await;
        assert!(review.issues().is_empty());
        assert!(review.last_error().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_now_cancels_pending_timer() {
        let transform = ScriptedTransform::new(Duration::ZERO, vec![CheckReply::Text(ONE_ISSUE)]);
        let (surface, review) = start(transform.clone(), ReviewConfig::default());

        surface.edit("Helo, world");
        advance(100).await;
        review.check_now();
        advance(10).await;
        assert_eq!(transform.calls(), 1);

        advance(3000).await;
        assert_eq!(transform.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_now_while_checking_is_skipped() {
        let transform = ScriptedTransform::new(
            Duration::from_millis(1000),
            vec![CheckReply::Text(ONE_ISSUE)],
        );
        let (surface, review) = start(transform.clone(), ReviewConfig::default());

        surface.edit("Helo, world");
        advance(1600).await;
        review.check_now();
        advance(3000).await;
        assert_eq!(transform.calls(), 1);
        assert_eq!(transform.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_off_clears_and_ignores_changes() {
        let transform = ScriptedTransform::new(Duration::ZERO, vec![CheckReply::Text(ONE_ISSUE)]);
        let (surface, review) = start(transform.clone(), ReviewConfig::default());

        surface.edit("Helo, world");
        advance(2000).await;
        assert_eq!(review.issues().len(), 1);

        review.toggle();
        surface.edit("Helo, world, more");
        advance(3000).await;
        assert!(!review.is_enabled());
        assert!(review.issues().is_empty());
        assert!(surface.markers.lock().unwrap().is_empty());
        assert_eq!(transform.calls(), 1);

        review.set_enabled(true);
        surface.edit("Helo, world, more!");
        advance(2000).await;
        assert_eq!(transform.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_during_check_discards_result() {
        let transform = ScriptedTransform::new(
            Duration::from_millis(1000),
            vec![CheckReply::Text(ONE_ISSUE)],
        );
        let (surface, review) = start(transform.clone(), ReviewConfig::default());

        surface.edit("Helo, world");
        advance(1600).await;
        review.set_enabled(false);
        advance(2000).await;

        assert_eq!(transform.calls(), 1);
        assert_eq!(review.completed_checks(), 1);
        assert!(review.issues().is_empty());
        assert!(surface.markers.lock().unwrap().is_empty());
        assert_eq!(review.phase(), ReviewPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_from_start() {
        let transform = ScriptedTransform::new(Duration::ZERO, vec![CheckReply::Text(ONE_ISSUE)]);
        let config = ReviewConfig { enabled: false, ..ReviewConfig::default() };
        let (surface, review) = start(transform.clone(), config);

        surface.edit("Helo, world");
        review.check_now();
        advance(3000).await;
        assert_eq!(transform.calls(), 0);
        review.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_removes_change_listener() {
        let transform = ScriptedTransform::new(Duration::ZERO, vec![CheckReply::Text(ONE_ISSUE)]);
        let (surface, review) = start(transform.clone(), ReviewConfig::default());
        assert_eq!(surface.listeners.lock().unwrap().len(), 1);

        review.shutdown().await;
        assert!(surface.listeners.lock().unwrap().is_empty());

        surface.edit("Helo, world");
        advance(3000).await;
        assert_eq!(transform.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_cycle_removes_change_listener() {
        let transform = ScriptedTransform::new(Duration::ZERO, vec![]);
        let (surface, review) = start(transform, ReviewConfig::default());

        drop(review);
        advance(10).await;
        assert!(surface.listeners.lock().unwrap().is_empty());
    }
}
