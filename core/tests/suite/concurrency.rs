use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use gather_core::CoordinatorConfig;
use gather_core::SearchError;
use gather_core::phase::ExecutorState;
use gather_protocol::FailureClass;
use gather_protocol::SearchPhaseName;
use gather_protocol::SearchRequest;
use gather_test_support::FakeDoc;
use gather_test_support::InMemoryCluster;
use gather_test_support::disconnected;
use gather_test_support::hit_keys;
use gather_test_support::shard;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

fn slow_cluster(shards: u32, nodes: &[&str], delay: Duration) -> InMemoryCluster {
    let mut cluster = InMemoryCluster::new();
    for index in 0..shards {
        cluster.add_shard(
            "logs",
            index,
            nodes,
            vec![FakeDoc::scored(index, index as f32)],
        );
    }
    for node in nodes {
        cluster.delay_node(node, delay);
    }
    cluster
}

#[tokio::test(start_paused = true)]
async fn fan_out_respects_the_request_cap() {
    let cluster = Arc::new(slow_cluster(8, &["n1"], Duration::from_millis(10)));
    let request = SearchRequest::new(["logs"])
        .with_window(0, 8)
        .with_max_concurrent_shard_requests(3);

    let response = cluster
        .coordinator(CoordinatorConfig::default())
        .execute(&request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(response.hits.len(), 8);
    assert_eq!(cluster.max_in_flight(), 3);
    assert_eq!(cluster.max_in_flight_per_shard(), 1);
}

#[tokio::test(start_paused = true)]
async fn fan_out_defaults_to_the_configured_cap() {
    let cluster = Arc::new(slow_cluster(10, &["n1"], Duration::from_millis(10)));
    let config = CoordinatorConfig {
        max_concurrent_shard_requests: 4,
        ..CoordinatorConfig::default()
    };

    cluster
        .coordinator(config)
        .execute(&SearchRequest::new(["logs"]), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(cluster.max_in_flight(), 4);
}

#[tokio::test(start_paused = true)]
async fn retries_never_overlap_on_one_ordinal() {
    let mut cluster = slow_cluster(6, &["n1", "n2"], Duration::from_millis(5));
    for index in 0..6 {
        cluster.fail(&shard("logs", index), "n1", disconnected("n1"));
    }
    let cluster = Arc::new(cluster);

    let response = cluster
        .coordinator(CoordinatorConfig::default())
        .execute(&SearchRequest::new(["logs"]), &CancellationToken::new())
        .await
        .unwrap();

    assert!(response.failures.is_empty());
    assert_eq!(response.hits.len(), 6);
    assert_eq!(cluster.max_in_flight_per_shard(), 1);
    assert_eq!(cluster.phase_requests(SearchPhaseName::Query).len(), 12);
}

#[tokio::test(start_paused = true)]
async fn slow_fetch_is_recorded_as_timed_out() {
    let mut cluster = InMemoryCluster::new();
    cluster
        .add_shard("logs", 0, &["fast"], vec![FakeDoc::scored(1, 2.0)])
        .add_shard("logs", 1, &["slow"], vec![FakeDoc::scored(2, 1.0)])
        .delay_phase("slow", SearchPhaseName::Fetch, Duration::from_secs(60));
    let cluster = Arc::new(cluster);

    let request = SearchRequest::new(["logs"]).with_timeout_ms(100);
    let response = cluster
        .coordinator(CoordinatorConfig::default())
        .execute(&request, &CancellationToken::new())
        .await
        .unwrap();

    assert!(response.timed_out);
    assert_eq!(hit_keys(&response), vec![(shard("logs", 0), 1)]);
    assert_eq!(response.failures.len(), 1);
    assert_eq!(response.failures[0].shard_id, shard("logs", 1));
    assert_eq!(response.failures[0].classification, FailureClass::TimedOut);
    assert_eq!(response.failures[0].phase, SearchPhaseName::Fetch);
}

#[tokio::test(start_paused = true)]
async fn slow_query_shard_still_yields_the_fast_shards_hits() {
    let mut cluster = InMemoryCluster::new();
    cluster
        .add_shard("logs", 0, &["fast"], vec![FakeDoc::scored(1, 2.0)])
        .add_shard("logs", 1, &["slow"], vec![FakeDoc::scored(2, 3.0)])
        .delay_phase("slow", SearchPhaseName::Query, Duration::from_secs(60));
    let cluster = Arc::new(cluster);

    let request = SearchRequest::new(["logs"]).with_timeout_ms(100);
    let response = cluster
        .coordinator(CoordinatorConfig::default())
        .execute(&request, &CancellationToken::new())
        .await
        .unwrap();

    assert!(response.timed_out);
    assert_eq!(hit_keys(&response), vec![(shard("logs", 0), 1)]);
    assert_eq!(response.failures.len(), 1);
    let failure = &response.failures[0];
    assert_eq!(failure.shard_id, shard("logs", 1));
    assert_eq!(failure.phase, SearchPhaseName::Query);
    assert_eq!(failure.classification, FailureClass::TimedOut);
    assert_eq!(
        failure.target.as_ref().map(|target| target.node_id.as_str()),
        Some("slow")
    );
    assert_eq!(cluster.phase_requests(SearchPhaseName::Fetch).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn undispatched_fetch_keeps_its_pinned_copy_on_timeout() {
    let mut cluster = InMemoryCluster::new();
    cluster
        .add_shard("logs", 0, &["n1"], vec![FakeDoc::scored(0, 3.0)])
        .add_shard("logs", 1, &["slow"], vec![FakeDoc::scored(1, 2.0)])
        .add_shard("logs", 2, &["n1"], vec![FakeDoc::scored(2, 1.0)])
        .delay_phase("slow", SearchPhaseName::Fetch, Duration::from_secs(60));
    let cluster = Arc::new(cluster);
    let config = CoordinatorConfig {
        follow_up_grace_ms: 500,
        ..CoordinatorConfig::default()
    };

    let request = SearchRequest::new(["logs"])
        .with_timeout_ms(100)
        .with_max_concurrent_shard_requests(1);
    let response = cluster
        .coordinator(config)
        .execute(&request, &CancellationToken::new())
        .await
        .unwrap();

    assert!(response.timed_out);
    assert_eq!(hit_keys(&response), vec![(shard("logs", 0), 0)]);
    // The third fetch never left the queue.
    assert_eq!(cluster.phase_requests(SearchPhaseName::Fetch).len(), 2);
    let queued = response
        .failures
        .iter()
        .find(|failure| failure.shard_id == shard("logs", 2))
        .unwrap();
    assert_eq!(queued.phase, SearchPhaseName::Fetch);
    assert_eq!(queued.classification, FailureClass::TimedOut);
    assert_eq!(
        queued.target.as_ref().map(|target| target.node_id.as_str()),
        Some("n1")
    );
    assert_eq!(response.failures.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn deadline_before_any_query_result_is_fatal() {
    let cluster = Arc::new(slow_cluster(3, &["n1"], Duration::from_secs(60)));
    let config = CoordinatorConfig {
        default_timeout_ms: Some(250),
        ..CoordinatorConfig::default()
    };

    let (result, trace) = cluster
        .coordinator(config)
        .execute_traced(&SearchRequest::new(["logs"]), &CancellationToken::new())
        .await;

    assert_matches!(
        result,
        Err(SearchError::TimedOut {
            phase: SearchPhaseName::Query
        })
    );
    assert_eq!(
        trace.last().map(|transition| transition.to),
        Some(ExecutorState::Failed)
    );
    assert_eq!(cluster.max_in_flight(), 3);
}

#[tokio::test(start_paused = true)]
async fn cancellation_discards_partial_results() {
    let cluster = Arc::new(slow_cluster(3, &["n1"], Duration::from_secs(5)));
    let coordinator = cluster.coordinator(CoordinatorConfig::default());
    let token = CancellationToken::new();
    let request = SearchRequest::new(["logs"]);

    let canceller = {
        let token = token.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
            token.cancel();
        }
    };
    let ((result, trace), ()) =
        tokio::join!(coordinator.execute_traced(&request, &token), canceller);

    assert_matches!(result, Err(SearchError::Cancelled));
    assert_eq!(
        trace.last().map(|transition| transition.to),
        Some(ExecutorState::Failed)
    );
    assert!(cluster.fetch_requests().is_empty());
}

#[tokio::test]
async fn cancelled_token_prevents_any_shard_request() {
    let cluster = Arc::new(slow_cluster(2, &["n1"], Duration::ZERO));
    let token = CancellationToken::new();
    token.cancel();

    let err = cluster
        .coordinator(CoordinatorConfig::default())
        .execute(&SearchRequest::new(["logs"]), &token)
        .await
        .unwrap_err();

    assert_matches!(err, SearchError::Cancelled);
    assert!(cluster.requests().is_empty());
}
