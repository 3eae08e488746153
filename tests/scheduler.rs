use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::json;
use stageloom::agent::{ProjectHeader, StageContext};
use stageloom::artifact::{Artifact, ArtifactSet};
use stageloom::orchestrator::{CancelToken, StageError};
use stageloom::pipeline::CacheConfig;
use stageloom::scheduler::{Scheduler, StageExecutor, StageOutcome};
use stageloom::stage::StageId;

fn batch_entry(name: &str) -> (StageId, StageContext) {
    let stage = StageId::named(name);
    let ctx = StageContext {
        stage: stage.clone(),
        agent_role: name.to_string(),
        attempt: 1,
        project: ProjectHeader {
            project_id: "p".into(),
            name: "demo".into(),
            description: "d".into(),
            version: 0,
        },
        upstream: FxHashMap::default(),
        feedback: Vec::new(),
        model_config: json!({}),
    };
    (stage, ctx)
}

/// Completes after a per-stage delay; "bad-*" stages fail instead.
struct DelayedExecutor {
    calls: AtomicUsize,
}

#[async_trait]
impl StageExecutor for DelayedExecutor {
    async fn run_stage(&self, ctx: StageContext) -> StageOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let name = ctx.stage.name().unwrap_or_default().to_string();
        // Later dispatch positions finish sooner, to stress result ordering.
        let delay = match name.as_str() {
            "first" => 60,
            "second" => 30,
            _ => 5,
        };
        tokio::time::sleep(Duration::from_millis(delay)).await;
        if name.starts_with("bad") {
            StageOutcome::Failed {
                error: StageError::MissingArtifacts {
                    stage: ctx.stage,
                    missing: vec!["expected".into()],
                },
            }
        } else {
            StageOutcome::Completed {
                artifacts: ArtifactSet::new().with(Artifact::new(name, json!("done"))),
                attempts: 1,
                from_cache: false,
            }
        }
    }
}

#[tokio::test]
async fn outcomes_are_dispatch_ordered_despite_completion_order() {
    let scheduler = Scheduler::new(4);
    let executor: Arc<dyn StageExecutor> = Arc::new(DelayedExecutor {
        calls: AtomicUsize::new(0),
    });

    let result = scheduler
        .run_round(
            vec![
                batch_entry("first"),
                batch_entry("second"),
                batch_entry("third"),
            ],
            executor,
            &CancelToken::new(),
        )
        .await
        .unwrap();

    let order: Vec<_> = result
        .outcomes
        .iter()
        .map(|(stage, _)| stage.clone())
        .collect();
    assert_eq!(
        order,
        vec![
            StageId::named("first"),
            StageId::named("second"),
            StageId::named("third")
        ]
    );
}

#[tokio::test]
async fn failed_stage_leaves_siblings_settled() {
    let scheduler = Scheduler::new(4);
    let executor: Arc<dyn StageExecutor> = Arc::new(DelayedExecutor {
        calls: AtomicUsize::new(0),
    });

    let result = scheduler
        .run_round(
            vec![
                batch_entry("alpha"),
                batch_entry("bad-beta"),
                batch_entry("gamma"),
            ],
            executor,
            &CancelToken::new(),
        )
        .await
        .unwrap();

    assert!(result.outcomes[0].1.is_completed());
    assert!(matches!(
        result.outcomes[1].1,
        StageOutcome::Failed {
            error: StageError::MissingArtifacts { .. }
        }
    ));
    assert!(result.outcomes[2].1.is_completed());
}

#[tokio::test]
async fn cache_entries_expire_after_ttl() {
    let scheduler = Scheduler::with_cache(
        2,
        &CacheConfig {
            capacity: std::num::NonZeroUsize::new(8).unwrap(),
            ttl: Duration::from_millis(40),
        },
    );
    let executor = Arc::new(DelayedExecutor {
        calls: AtomicUsize::new(0),
    });

    for _ in 0..2 {
        scheduler
            .run_round(
                vec![batch_entry("third")],
                Arc::clone(&executor) as Arc<dyn StageExecutor>,
                &CancelToken::new(),
            )
            .await
            .unwrap();
    }
    // Second round was a hit.
    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(60)).await;
    scheduler
        .run_round(
            vec![batch_entry("third")],
            Arc::clone(&executor) as Arc<dyn StageExecutor>,
            &CancelToken::new(),
        )
        .await
        .unwrap();
    // TTL elapsed, executor ran again.
    assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
    assert_eq!(scheduler.cache_stats().hits, 1);
}
