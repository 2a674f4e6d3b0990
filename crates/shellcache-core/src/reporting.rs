//! Structured sink for failures nobody else handles.
//!
//! Panics, failed background tasks and forced session evictions all end up
//! here instead of being silently dropped.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::error;

/// Where a report came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportSource {
    Panic,
    BackgroundTask,
    Request,
    Storage,
    Worker,
}

impl ReportSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportSource::Panic => "panic",
            ReportSource::BackgroundTask => "background_task",
            ReportSource::Request => "request",
            ReportSource::Storage => "storage",
            ReportSource::Worker => "worker",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: ReportSource,
    pub message: String,
    pub context: Option<String>,
    pub at: DateTime<Utc>,
}

impl ErrorReport {
    pub fn new(source: ReportSource, message: impl Into<String>) -> Self {
        Self {
            source,
            message: message.into(),
            context: None,
            at: Utc::now(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

pub trait ErrorReporter: Send + Sync {
    fn report(&self, report: ErrorReport);
}

pub type SharedReporter = Arc<dyn ErrorReporter>;

/// Emits every report as a structured `error!` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, report: ErrorReport) {
        error!(
            source = report.source.as_str(),
            context = report.context.as_deref().unwrap_or(""),
            at = %report.at,
            "{}",
            report.message
        );
    }
}

/// Keeps reports in memory. Useful for tests and for surfacing a summary.
#[derive(Debug, Default, Clone)]
pub struct CollectingReporter {
    reports: Arc<Mutex<Vec<ErrorReport>>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<ErrorReport> {
        self.reports
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl ErrorReporter for CollectingReporter {
    fn report(&self, report: ErrorReport) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.push(report);
        }
    }
}

pub fn tracing_reporter() -> SharedReporter {
    Arc::new(TracingReporter)
}

/// Route panics through `reporter` before the default hook runs.
pub fn install_panic_hook(reporter: SharedReporter) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let mut report = ErrorReport::new(ReportSource::Panic, panic_message(info.payload()));
        if let Some(location) = info.location() {
            report = report.with_context(location.to_string());
        }
        reporter.report(report);
        previous(info);
    }));
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

/// Spawn a fallible task; an error or a panic is reported instead of lost.
/// The task runs inside the returned handle, so aborting the handle stops
/// the work itself.
pub fn spawn_reported<F, E>(
    reporter: SharedReporter,
    context: &'static str,
    task: F,
) -> JoinHandle<()>
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    tokio::spawn(async move {
        match AssertUnwindSafe(task).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => reporter.report(
                ErrorReport::new(ReportSource::BackgroundTask, e.to_string()).with_context(context),
            ),
            Err(payload) => reporter.report(
                ErrorReport::new(ReportSource::Panic, panic_message(payload.as_ref())).with_context(context),
            ),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_reported_captures_error() {
        let reporter = CollectingReporter::new();
        let handle = spawn_reported(Arc::new(reporter.clone()), "refresh", async {
            Err::<(), _>("backend down")
        });
        handle.await.expect("reporter task failed");

        let reports = reporter.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].source, ReportSource::BackgroundTask);
        assert_eq!(reports[0].message, "backend down");
        assert_eq!(reports[0].context.as_deref(), Some("refresh"));
    }

    #[tokio::test]
    async fn test_spawn_reported_captures_panic() {
        let reporter = CollectingReporter::new();
        let handle = spawn_reported(Arc::new(reporter.clone()), "panicky", async {
            if true {
                panic!("kaboom");
            }
            Ok::<(), String>(())
        });
        handle.await.expect("reporter task failed");

        let reports = reporter.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].source, ReportSource::Panic);
        assert_eq!(reports[0].message, "kaboom");
    }

    #[tokio::test]
    async fn test_spawn_reported_success_is_silent() {
        let reporter = CollectingReporter::new();
        spawn_reported(Arc::new(reporter.clone()), "ok", async { Ok::<(), String>(()) })
            .await
            .expect("reporter task failed");
        assert!(reporter.reports().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborting_handle_stops_the_task() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let reporter = CollectingReporter::new();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let handle = spawn_reported(Arc::new(reporter.clone()), "slow", async move {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            flag.store(true, Ordering::SeqCst);
            Ok::<(), String>(())
        });

        tokio::task::yield_now().await;
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());

        tokio::time::sleep(std::time::Duration::from_secs(120)).await;
        assert!(!finished.load(Ordering::SeqCst));
        assert!(reporter.reports().is_empty());
    }
}
