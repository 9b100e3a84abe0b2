//! Concurrent execution of one batch of tool calls.
//!
//! A model turn may request several tools at once. They run concurrently
//! with at most `max_workers` in flight, and the outcomes come back in the
//! order the calls were issued no matter which finished first. Failures and
//! panics are already folded into error text by
//! [`ToolRegistry::dispatch`], so one bad call never affects its siblings.

use super::config::DispatchConfig;
use crate::tools::core::ToolRegistry;
use crate::ToolCall;
use futures::StreamExt;
use std::time::Instant;
use tracing::debug;

pub use crate::ToolOutcome;

async fn run_one(registry: &ToolRegistry, call: &ToolCall) -> ToolOutcome {
    let outcome = registry.dispatch(&call.name, &call.arguments).await;
    ToolOutcome::new(call, outcome.result, outcome.is_error)
}

/// Execute `calls` through `registry`, returning one outcome per call in
/// input order.
///
/// Zero or one call runs inline. Larger batches run with
/// `min(max_workers, calls.len())` concurrent workers unless
/// `config.sequential` is set. Tools are never retried.
pub async fn dispatch_tool_calls(
    registry: &ToolRegistry,
    calls: &[ToolCall],
    config: &DispatchConfig,
) -> Vec<ToolOutcome> {
    if calls.len() <= 1 || config.sequential {
        let mut outcomes = Vec::with_capacity(calls.len());
        for call in calls {
            outcomes.push(run_one(registry, call).await);
        }
        return outcomes;
    }

    let workers = config.max_workers.max(1).min(calls.len());
    let start = Instant::now();
    let jobs: Vec<_> = calls
        .iter()
        .enumerate()
        .map(|(index, call)| async move { (index, run_one(registry, call).await) })
        .collect();
    let finished: Vec<(usize, ToolOutcome)> = futures::stream::iter(jobs)
        .buffer_unordered(workers)
        .collect()
        .await;

    let mut slots: Vec<Option<ToolOutcome>> = vec![None; calls.len()];
    for (index, outcome) in finished {
        slots[index] = Some(outcome);
    }
    debug!(
        "Dispatched {} tool call(s) on {workers} worker(s) in {:?}",
        calls.len(),
        start.elapsed()
    );
    slots.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolError;
    use crate::tools::core::FnTool;
    use crate::ToolDef;
    use schemars::JsonSchema;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Deserialize, JsonSchema)]
    struct NapArgs {
        label: String,
        ms: u64,
        #[serde(default)]
        fail: bool,
    }

    /// Sleeps `ms`, then echoes `label` (or fails with it). Tracks the peak
    /// number of naps running at once.
    fn nap_registry(peak: Arc<AtomicUsize>) -> ToolRegistry {
        let running = Arc::new(AtomicUsize::new(0));
        ToolRegistry::new().with(FnTool::new(
            ToolDef::from_schema::<NapArgs>("nap", "Sleep then echo"),
            move |args: NapArgs| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(args.ms)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    if args.fail {
                        Err(ToolError::msg(format!("{} broke", args.label)))
                    } else {
                        Ok(args.label)
                    }
                }
            },
        ))
    }

    fn nap(id: &str, ms: u64, fail: bool) -> ToolCall {
        ToolCall::new(id, "nap", json!({"label": id, "ms": ms, "fail": fail}))
    }

    #[tokio::test(start_paused = true)]
    async fn preserves_order_despite_delays_and_failures() {
        let registry = nap_registry(Arc::new(AtomicUsize::new(0)));
        let calls = vec![
            nap("a", 300, false),
            nap("b", 10, true),
            nap("c", 200, false),
            nap("d", 0, true),
            nap("e", 50, false),
        ];
        let outcomes = dispatch_tool_calls(&registry, &calls, &DispatchConfig::default()).await;

        let ids: Vec<&str> = outcomes.iter().map(|o| o.call_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d", "e"]);
        assert_eq!(outcomes[0].result, "a");
        assert!(outcomes[1].is_error);
        assert!(outcomes[1].result.contains("b broke"));
        assert!(!outcomes[2].is_error);
        assert!(outcomes[3].is_error);
        assert_eq!(outcomes[4].result, "e");

        let stats = registry.stats("nap").unwrap();
        assert_eq!(stats.call_count, 5);
        assert_eq!(stats.error_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_bounded_by_workers() {
        let peak = Arc::new(AtomicUsize::new(0));
        let registry = nap_registry(peak.clone());
        let calls: Vec<ToolCall> = (0..6).map(|i| nap(&format!("n{i}"), 100, false)).collect();

        let config = DispatchConfig::default().with_max_workers(2);
        let outcomes = dispatch_tool_calls(&registry, &calls, &config).await;
        assert_eq!(outcomes.len(), 6);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn batches_actually_overlap() {
        let registry = nap_registry(Arc::new(AtomicUsize::new(0)));
        let calls = vec![nap("a", 1000, false), nap("b", 1000, false)];
        let start = tokio::time::Instant::now();
        dispatch_tool_calls(&registry, &calls, &DispatchConfig::default()).await;
        assert!(start.elapsed() < Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_runs_one_at_a_time() {
        let peak = Arc::new(AtomicUsize::new(0));
        let registry = nap_registry(peak.clone());
        let calls = vec![nap("a", 30, false), nap("b", 10, false), nap("c", 20, false)];
        let config = DispatchConfig::default().with_sequential(true);
        let outcomes = dispatch_tool_calls(&registry, &calls, &config).await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        let results: Vec<&str> = outcomes.iter().map(|o| o.result.as_str()).collect();
        assert_eq!(results, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn unknown_tool_in_batch_is_an_error_result() {
        let registry = nap_registry(Arc::new(AtomicUsize::new(0)));
        let calls = vec![
            nap("a", 0, false),
            ToolCall::new("ghost", "nope", json!({})),
        ];
        let outcomes = dispatch_tool_calls(&registry, &calls, &DispatchConfig::default()).await;
        assert_eq!(outcomes[1].name, "nope");
        assert!(outcomes[1].is_error);
        assert!(outcomes[1].result.contains("unknown tool 'nope'"));
    }

    #[tokio::test]
    async fn empty_batch() {
        let registry = ToolRegistry::new();
        assert!(
            dispatch_tool_calls(&registry, &[], &DispatchConfig::default())
                .await
                .is_empty()
        );
    }

    #[derive(Deserialize, JsonSchema)]
    struct NoArgs {}

    /// Panics in the handler itself, before any future is built.
    fn tripwire() -> FnTool {
        FnTool::new(
            ToolDef::from_schema::<NoArgs>("tripwire", "Panics immediately"),
            |_: NoArgs| -> std::future::Ready<Result<String, ToolError>> {
                let slots = [1, 2, 3];
                let index = std::hint::black_box(7);
                std::future::ready(Ok(slots[index].to_string()))
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn eager_panic_is_isolated_within_the_batch() {
        let registry = nap_registry(Arc::new(AtomicUsize::new(0))).with(tripwire());
        let calls = vec![
            nap("a", 20, false),
            ToolCall::new("t", "tripwire", json!({})),
            nap("c", 5, false),
        ];
        let outcomes = dispatch_tool_calls(&registry, &calls, &DispatchConfig::default()).await;

        let ids: Vec<&str> = outcomes.iter().map(|o| o.call_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "t", "c"]);
        assert_eq!(outcomes[0].result, "a");
        assert!(outcomes[1].is_error);
        assert!(outcomes[1].result.contains("index out of bounds"), "{}", outcomes[1].result);
        assert_eq!(outcomes[2].result, "c");
        assert_eq!(registry.stats("tripwire").unwrap().error_count, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dispatch_runs_inside_a_spawned_task() {
        let registry = Arc::new(nap_registry(Arc::new(AtomicUsize::new(0))));
        let calls = vec![nap("a", 5, false), nap("b", 1, false)];
        let handle = tokio::spawn({
            let registry = registry.clone();
            async move { dispatch_tool_calls(&registry, &calls, &DispatchConfig::default()).await }
        });
        let outcomes = handle.await.unwrap();
        let results: Vec<&str> = outcomes.iter().map(|o| o.result.as_str()).collect();
        assert_eq!(results, vec!["a", "b"]);
    }
}
