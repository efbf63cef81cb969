use std::sync::Arc;

use gather_core::CoordinatorConfig;
use gather_protocol::KeepAlive;
use gather_protocol::SearchRequest;
use gather_protocol::SortField;
use gather_protocol::SortValue;
use gather_test_support::FakeDoc;
use gather_test_support::InMemoryCluster;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

fn scroll_cluster() -> Arc<InMemoryCluster> {
    let mut cluster = InMemoryCluster::new();
    cluster
        .add_shard(
            "logs",
            0,
            &["n1"],
            vec![
                FakeDoc::sorted(0, vec![SortValue::Long(1)]),
                FakeDoc::sorted(1, vec![SortValue::Long(2)]),
            ],
        )
        .add_shard(
            "logs",
            1,
            &["n2"],
            vec![FakeDoc::sorted(0, vec![SortValue::Long(7)])],
        );
    Arc::new(cluster)
}

#[tokio::test]
async fn scroll_keeps_every_context_open() {
    let cluster = scroll_cluster();
    let request = SearchRequest::new(["logs"])
        .with_sort(vec![SortField::asc("ts")])
        .with_window(0, 2)
        .with_keep_alive(KeepAlive::Scroll {
            keep_alive_ms: 60_000,
        });

    let response = cluster
        .coordinator(CoordinatorConfig::default())
        .execute(&request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(response.hits.len(), 2);
    assert!(cluster.released().is_empty());
    assert_eq!(cluster.open_contexts(), 2);
    assert!(cluster.fetch_requests().iter().all(|fetch| fetch.keep_context));

    let continuation = response.continuation.unwrap();
    let mut nodes: Vec<String> = continuation
        .contexts
        .iter()
        .map(|context| context.target.node_id.to_string())
        .collect();
    nodes.sort();
    assert_eq!(nodes, vec!["n1".to_string(), "n2".to_string()]);

    // Pruning would drop documents a later page needs.
    assert!(
        cluster
            .query_requests()
            .iter()
            .all(|query| query.bottom_sort_values.is_none() && query.keep_alive.is_some())
    );
}

#[tokio::test]
async fn plain_search_has_no_continuation() {
    let cluster = scroll_cluster();
    let response = cluster
        .coordinator(CoordinatorConfig::default())
        .execute(&SearchRequest::new(["logs"]), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(response.continuation, None);
    assert_eq!(cluster.open_contexts(), 0);
}
