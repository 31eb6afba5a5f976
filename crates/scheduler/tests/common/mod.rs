//! Shared fixtures: a local HTTP target and scheduler wiring over the
//! in-process storage backend.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{any, post};
use axum::Router;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use watchpost_core::config::SchedulerConfig;
use watchpost_core::Job;
use watchpost_notify::{available_strategies, AlertDispatcher};
use watchpost_scheduler::{Callbacks, HttpExecutor, Scheduler, SchedulerMonitor, SchedulerState};
use watchpost_storage::{MemoryBackend, MemoryStorage};

pub const EVERY_SECOND: &str = "* * * * * *";
pub const YEARLY: &str = "0 0 1 1 *";

#[derive(Default)]
struct Recorded {
    /// `updated` query parameter of each call to `/test`.
    test_calls: Vec<Option<String>>,
    alerts: Vec<String>,
}

/// Local HTTP server standing in for job and alert endpoints.
#[derive(Clone)]
pub struct Target {
    pub base: String,
    recorded: Arc<Mutex<Recorded>>,
}

impl Target {
    pub async fn spawn() -> Self {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let app = Router::new()
            .route("/test", any(test_endpoint))
            .route("/fail", any(|| async { (StatusCode::SERVICE_UNAVAILABLE, "down") }))
            .route("/alert", post(alert_endpoint))
            .with_state(recorded.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            base: format!("http://{addr}"),
            recorded,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub fn test_calls(&self) -> Vec<Option<String>> {
        self.recorded.lock().unwrap().test_calls.clone()
    }

    pub fn alerts(&self) -> Vec<String> {
        self.recorded.lock().unwrap().alerts.clone()
    }
}

async fn test_endpoint(
    State(recorded): State<Arc<Mutex<Recorded>>>,
    Query(params): Query<HashMap<String, String>>,
) -> &'static str {
    recorded
        .lock()
        .unwrap()
        .test_calls
        .push(params.get("updated").cloned());
    "ok"
}

async fn alert_endpoint(State(recorded): State<Arc<Mutex<Recorded>>>, body: String) -> StatusCode {
    recorded.lock().unwrap().alerts.push(body);
    StatusCode::OK
}

pub fn seed(backend: &MemoryBackend, count: usize, cron: &str, endpoint: &str) -> Vec<Job> {
    (0..count)
        .map(|i| {
            let job = Job::new(format!("job-{i}"), cron, "GET", endpoint);
            backend.insert(job.clone());
            job
        })
        .collect()
}

pub fn config(max_jobs: usize, dump_path: PathBuf) -> SchedulerConfig {
    SchedulerConfig {
        app_name: "node-a".into(),
        max_jobs,
        poll_interval: Duration::from_millis(200),
        drain_grace: Duration::from_secs(2),
        http_timeout: Duration::from_secs(5),
        dump_path,
    }
}

/// Callbacks the worker binary uses: real HTTP calls, write-back and alerts.
pub fn standard_callbacks(storage: Arc<MemoryStorage>) -> Callbacks {
    let alerts = AlertDispatcher::new(available_strategies(Duration::from_secs(5)), &["http".into()]);
    Callbacks::standard(
        Arc::new(HttpExecutor::new(Duration::from_secs(5)).unwrap()),
        storage,
        Arc::new(alerts),
    )
}

pub struct RunningScheduler {
    pub monitor: SchedulerMonitor,
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<i32>,
}

impl RunningScheduler {
    pub async fn start(config: SchedulerConfig, storage: Arc<MemoryStorage>, callbacks: Callbacks) -> Self {
        let scheduler = Scheduler::new(config, storage, callbacks);
        let monitor = scheduler.monitor();
        let (stop, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(scheduler.start(async move {
            let _ = stop_rx.await;
        }));
        tokio::time::timeout(Duration::from_secs(5), monitor.wait_for(SchedulerState::Running))
            .await
            .expect("scheduler did not reach Running");
        Self {
            monitor,
            stop: Some(stop),
            handle,
        }
    }

    /// Deliver the shutdown signal and return the exit code.
    pub async fn shutdown(mut self) -> i32 {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("scheduler did not stop")
            .unwrap()
    }
}
