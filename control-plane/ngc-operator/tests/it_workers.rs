// Worker pool driving the real dispatcher over two memory clusters.

use std::time::Duration;

use ngc_operator::controller::planner::inference_stack::POOL_API_VERSION;
use ngc_operator::controller::queue::{Backoff, WorkQueue};
use ngc_operator::controller::workers::WorkerPool;
use ngc_operator::controller::DeclaredKind;

mod common;
use common::{child, harness, seed, stack_spec};

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn pool_converges_keys_on_every_cluster() {
    let h = harness(&["east", "west"]).await;
    let east = h.cluster("east");
    let west = h.cluster("west");
    let mut spec = stack_spec(1);
    spec["servingBackend"] = serde_json::json!("nope");
    let keys = [
        seed(&east, "east", DeclaredKind::InferenceStack, "llama", stack_spec(1)),
        seed(&west, "west", DeclaredKind::InferenceStack, "mistral", stack_spec(2)),
        seed(&west, "west", DeclaredKind::InferenceStack, "broken", spec),
    ];

    let queue = WorkQueue::new(Backoff {
        base: Duration::from_millis(5),
        max: Duration::from_millis(50),
    });
    for k in &keys {
        queue.add(k.clone());
    }
    let pool = WorkerPool {
        queue: queue.clone(),
        dispatcher: h.dispatcher.clone(),
        metrics: h.metrics.clone(),
        workers: 4,
        unreachable_retry: Duration::from_millis(50),
    };
    let handle = tokio::spawn(pool.run());

    let converged = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if child(&east, POOL_API_VERSION, "InferencePool", "llama-pool").is_some()
                && child(&west, POOL_API_VERSION, "InferencePool", "mistral-pool").is_some()
                && h.metrics.reconcile_total.with_label_values(&["InferenceStack", "validation"]).get() >= 1
                && h.metrics.reconcile_total.with_label_values(&["InferenceStack", "ok"]).get() >= 2
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(converged.is_ok(), "workers did not converge");

    // Successful keys resync later; the invalid one is forgotten.
    assert_eq!(queue.failures(&keys[2]), 0);

    queue.shutdown();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("pool stops after shutdown")
        .unwrap();
}
