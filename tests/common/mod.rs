//! Shared helpers for the integration suites.
#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use relayd::dispatcher::Dispatcher;
use relayd::filter::{
    FilterStatus, ListenerFilter, ListenerFilterContext, ListenerFilterFactory,
};
use relayd::limit::Resource;
use relayd::listener::ConnectionHandler;
use relayd::network::DynamicMetadata;
use relayd::telemetry::Metrics;

/// Poll `condition` until it holds or a 5s deadline passes.
pub async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Hold the condition for a little while and assert it never becomes true.
pub async fn assert_never(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(200);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            panic!("{what} happened but should not have");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A connection handler bound to the test runtime, as one worker would own.
pub fn new_handler(index: usize, metrics: &Arc<Metrics>, global: Resource) -> Arc<ConnectionHandler> {
    let dispatcher = Dispatcher::new(format!("worker_{index}"), Some(index));
    ConnectionHandler::new(dispatcher, Some(index), metrics.clone(), global)
}

/// Wrap a filter constructor as a factory.
pub fn filter_factory<F, T>(f: F) -> Arc<dyn ListenerFilterFactory>
where
    F: Fn() -> T + Send + Sync + 'static,
    T: ListenerFilter + 'static,
{
    Arc::new(move || -> Box<dyn ListenerFilter> { Box::new(f()) })
}

/// Counts invocations, continues immediately.
pub struct CountingFilter {
    pub calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ListenerFilter for CountingFilter {
    async fn on_accept(
        &mut self,
        _cx: &mut ListenerFilterContext<'_>,
    ) -> io::Result<FilterStatus> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(FilterStatus::Continue)
    }
}

/// Suspends and never resumes; only a timeout can move the chain on.
pub struct SuspendForeverFilter;

#[async_trait]
impl ListenerFilter for SuspendForeverFilter {
    async fn on_accept(
        &mut self,
        _cx: &mut ListenerFilterContext<'_>,
    ) -> io::Result<FilterStatus> {
        Ok(FilterStatus::StopIteration)
    }
}

/// Suspends, then resumes from a spawned task after `delay`.
pub struct ResumeLaterFilter {
    pub delay: Duration,
    pub success: bool,
}

#[async_trait]
impl ListenerFilter for ResumeLaterFilter {
    async fn on_accept(
        &mut self,
        cx: &mut ListenerFilterContext<'_>,
    ) -> io::Result<FilterStatus> {
        let resumer = cx.resumer();
        let delay = self.delay;
        let success = self.success;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            resumer.continue_filter_chain(success);
        });
        Ok(FilterStatus::StopIteration)
    }
}

/// Resumes from inside `on_accept` before suspending: the re-entrancy shape
/// the pipeline must tolerate.
pub struct InlineResumeFilter;

#[async_trait]
impl ListenerFilter for InlineResumeFilter {
    async fn on_accept(
        &mut self,
        cx: &mut ListenerFilterContext<'_>,
    ) -> io::Result<FilterStatus> {
        cx.resumer().continue_filter_chain(true);
        Ok(FilterStatus::StopIteration)
    }
}

/// Refuses the connection through `continue_filter_chain(false)`.
pub struct RefuseFilter;

#[async_trait]
impl ListenerFilter for RefuseFilter {
    async fn on_accept(
        &mut self,
        cx: &mut ListenerFilterContext<'_>,
    ) -> io::Result<FilterStatus> {
        cx.resumer().continue_filter_chain(false);
        Ok(FilterStatus::StopIteration)
    }
}

/// Merges a metadata value and continues.
pub struct SetMetadataFilter {
    pub namespace: &'static str,
    pub value: serde_json::Value,
}

#[async_trait]
impl ListenerFilter for SetMetadataFilter {
    async fn on_accept(
        &mut self,
        cx: &mut ListenerFilterContext<'_>,
    ) -> io::Result<FilterStatus> {
        cx.set_dynamic_metadata(self.namespace, self.value.clone());
        Ok(FilterStatus::Continue)
    }
}

/// Copies the metadata it observes into a shared sink.
pub struct CaptureMetadataFilter {
    pub sink: Arc<Mutex<Option<DynamicMetadata>>>,
}

#[async_trait]
impl ListenerFilter for CaptureMetadataFilter {
    async fn on_accept(
        &mut self,
        cx: &mut ListenerFilterContext<'_>,
    ) -> io::Result<FilterStatus> {
        *self.sink.lock().unwrap() = Some(cx.dynamic_metadata().clone());
        Ok(FilterStatus::Continue)
    }
}
