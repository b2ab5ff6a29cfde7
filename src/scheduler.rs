#![forbid(unsafe_code)]

// Virtual users and the tick scheduler that drives them. Each user owns
// one identity and one session for its whole lifetime; ticks run on a
// small worker pool over a due-time queue, so the reconnection rate is
// bounded by the tick cadence rather than a busy loop. The real I/O
// concurrency lives on the background loop, not here.

use crate::allocator::IdentityAllocator;
use crate::config::Config;
use crate::runtime::IoRuntime;
use crate::session::ConnectionSession;
use crate::stats::StatsRecorder;
use rand::Rng;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// How a user exercises the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserKind {
    /// Connect once, hold the connection, reconnect on a tick whenever it
    /// has dropped. Message delivery is push-driven in the meantime.
    Steady,
    /// Hold briefly, then tear down and immediately reconnect on each
    /// tick, exercising connection admission under churn.
    Churn,
}

/// One simulated subscriber.
pub struct VirtualUser {
    kind: UserKind,
    identity: u64,
    cfg: Arc<Config>,
    tls: Option<Arc<rustls::ClientConfig>>,
    recorder: Arc<StatsRecorder>,
    session: Option<ConnectionSession>,
}

impl VirtualUser {
    fn new(
        kind: UserKind,
        identity: u64,
        cfg: Arc<Config>,
        tls: Option<Arc<rustls::ClientConfig>>,
        recorder: Arc<StatsRecorder>,
    ) -> Self {
        Self {
            kind,
            identity,
            cfg,
            tls,
            recorder,
            session: None,
        }
    }

    fn fresh_session(&self) -> ConnectionSession {
        ConnectionSession::new(&self.cfg, self.tls.clone(), self.identity, self.recorder.clone())
    }

    /// One scheduling tick.
    pub fn tick(&mut self, rt: &IoRuntime) {
        match self.kind {
            UserKind::Steady => {
                if self.session.as_ref().is_some_and(|s| s.is_connected()) {
                    return;
                }
                // Tear down anything half-open before trying again with a
                // fresh session on the same identity.
                if let Some(mut session) = self.session.take() {
                    info!(client_id = %session.client_id(), "reconnecting");
                    session.disconnect();
                }
                let mut session = self.fresh_session();
                session.connect(rt);
                self.session = Some(session);
            }
            UserKind::Churn => {
                if let Some(mut session) = self.session.take() {
                    debug!(client_id = %session.client_id(), "churn teardown");
                    session.disconnect();
                }
                let mut session = self.fresh_session();
                session.connect(rt);
                self.session = Some(session);
            }
        }
    }

    pub fn stop(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.disconnect();
        }
    }

    pub fn identity(&self) -> u64 {
        self.identity
    }

    pub fn kind(&self) -> UserKind {
        self.kind
    }

    /// Inter-tick wait range: think-time for steady users, hold time for
    /// churn users.
    fn wait_range(&self) -> (Duration, Duration) {
        match self.kind {
            UserKind::Steady => (self.cfg.wait_min, self.cfg.wait_max),
            UserKind::Churn => (self.cfg.churn_hold_min, self.cfg.churn_hold_max),
        }
    }
}

/// Drives every virtual user of this worker process.
pub struct Scheduler {
    cfg: Arc<Config>,
    rt: Arc<IoRuntime>,
    users: Vec<Mutex<VirtualUser>>,
    queue: Mutex<BinaryHeap<Reverse<(Instant, usize)>>>,
    due: Condvar,
    stopping: AtomicBool,
}

impl Scheduler {
    pub fn new(
        cfg: Arc<Config>,
        rt: Arc<IoRuntime>,
        allocator: &IdentityAllocator,
        tls: Option<Arc<rustls::ClientConfig>>,
        recorder: Arc<StatsRecorder>,
    ) -> Self {
        let mut users = Vec::with_capacity(cfg.users_per_worker + cfg.churn_users);
        for _ in 0..cfg.users_per_worker {
            users.push(Mutex::new(VirtualUser::new(
                UserKind::Steady,
                allocator.next(),
                cfg.clone(),
                tls.clone(),
                recorder.clone(),
            )));
        }
        for _ in 0..cfg.churn_users {
            users.push(Mutex::new(VirtualUser::new(
                UserKind::Churn,
                allocator.next(),
                cfg.clone(),
                tls.clone(),
                recorder.clone(),
            )));
        }

        Self {
            cfg,
            rt,
            users,
            queue: Mutex::new(BinaryHeap::new()),
            due: Condvar::new(),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Run every user for `duration`, then stop and tear all sessions
    /// down. Initial ticks are staggered across the ramp-up window.
    pub fn run(&self, duration: Duration) {
        if self.users.is_empty() {
            return;
        }

        {
            let mut queue = self.queue.lock().expect("tick queue poisoned");
            let start = Instant::now();
            let count = self.users.len() as u32;
            for (idx, _) in self.users.iter().enumerate() {
                let offset = self.cfg.ramp_up * idx as u32 / count;
                queue.push(Reverse((start + offset, idx)));
            }
        }

        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .min(8);
        info!(
            users = self.users.len(),
            workers,
            duration_secs = duration.as_secs(),
            "scheduler starting"
        );

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| self.worker_loop());
            }

            std::thread::sleep(duration);
            self.stopping.store(true, Ordering::Release);
            // Taking the lock orders the flag against sleeping workers.
            drop(self.queue.lock().expect("tick queue poisoned"));
            self.due.notify_all();
        });

        for user in &self.users {
            user.lock().expect("user poisoned").stop();
        }
        info!("scheduler stopped");
    }

    fn worker_loop(&self) {
        let mut rng = rand::thread_rng();
        loop {
            let idx = {
                let mut queue = self.queue.lock().expect("tick queue poisoned");
                loop {
                    if self.stopping.load(Ordering::Acquire) {
                        return;
                    }
                    match queue.peek() {
                        Some(&Reverse((due, idx))) => {
                            let now = Instant::now();
                            if due <= now {
                                queue.pop();
                                break idx;
                            }
                            let (guard, _) = self
                                .due
                                .wait_timeout(queue, due - now)
                                .expect("tick queue poisoned");
                            queue = guard;
                        }
                        None => {
                            queue = self.due.wait(queue).expect("tick queue poisoned");
                        }
                    }
                }
            };

            self.users[idx]
                .lock()
                .expect("user poisoned")
                .tick(&self.rt);

            if self.stopping.load(Ordering::Acquire) {
                return;
            }

            let (min, max) = self.users[idx].lock().expect("user poisoned").wait_range();
            let wait = random_duration(&mut rng, min, max);
            let mut queue = self.queue.lock().expect("tick queue poisoned");
            queue.push(Reverse((Instant::now() + wait, idx)));
            self.due.notify_one();
        }
    }
}

fn random_duration(rng: &mut impl Rng, min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let ms = rng.gen_range(min.as_millis() as u64..=max.as_millis() as u64);
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::WorkerPartition;
    use crate::config::ProtocolStack;
    use crate::mqtt::testutil::{Behavior, FakeBroker};

    fn test_config(port: u16) -> Config {
        Config {
            broker: "127.0.0.1".to_string(),
            port,
            users_per_worker: 3,
            churn_users: 1,
            connect_timeout: Duration::from_millis(800),
            wait_min: Duration::from_secs(30),
            wait_max: Duration::from_secs(60),
            churn_hold_min: Duration::from_millis(150),
            churn_hold_max: Duration::from_millis(300),
            stack: ProtocolStack::Bridged,
            ..Config::default()
        }
    }

    #[test]
    fn drives_steady_and_churn_users() {
        let broker = FakeBroker::spawn(Behavior::Serve {
            connack_code: 0,
            publishes: Vec::new(),
        });
        let cfg = Arc::new(test_config(broker.port()));
        let rt = Arc::new(IoRuntime::start().unwrap());
        let allocator = IdentityAllocator::new(WorkerPartition {
            index: 0,
            count: 1,
            pool_size: 100,
            start: 1,
        });
        let recorder = Arc::new(StatsRecorder::new());

        let scheduler = Scheduler::new(
            cfg,
            rt.clone(),
            &allocator,
            None,
            recorder.clone(),
        );
        assert_eq!(scheduler.user_count(), 4);
        assert_eq!(allocator.allocated(), 4);

        scheduler.run(Duration::from_secs(2));

        let stats = recorder.snapshot();
        // Three steady users connect once; the churn user reconnects on
        // every tick of its short hold cycle.
        assert!(stats.attempts >= 5, "attempts = {}", stats.attempts);
        assert_eq!(stats.failures, 0);
        assert_eq!(stats.attempts, stats.successes);
        assert_eq!(broker.connections(), stats.attempts);
        rt.shutdown();
    }

    #[test]
    fn steady_users_retry_when_the_broker_refuses() {
        let broker = FakeBroker::spawn(Behavior::Serve {
            connack_code: 3,
            publishes: Vec::new(),
        });
        let mut cfg = test_config(broker.port());
        cfg.users_per_worker = 1;
        cfg.churn_users = 0;
        // Short think-time so the retry lands inside the test window.
        cfg.wait_min = Duration::from_millis(200);
        cfg.wait_max = Duration::from_millis(300);

        let rt = Arc::new(IoRuntime::start().unwrap());
        let allocator = IdentityAllocator::new(WorkerPartition {
            index: 0,
            count: 1,
            pool_size: 100,
            start: 1,
        });
        let recorder = Arc::new(StatsRecorder::new());
        let scheduler = Scheduler::new(Arc::new(cfg), rt.clone(), &allocator, None, recorder.clone());

        scheduler.run(Duration::from_secs(1));

        let stats = recorder.snapshot();
        assert!(stats.attempts >= 2, "attempts = {}", stats.attempts);
        assert_eq!(stats.successes, 0);
        assert_eq!(stats.failures, stats.attempts);
        // Server-unavailable refusals are not auth failures.
        assert_eq!(stats.auth_failures, 0);
        rt.shutdown();
    }
}
