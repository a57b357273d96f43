mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::*;
use raptor_tree::llm::provider::ErrorKind;
use raptor_tree::summarize::fallback_summary;
use raptor_tree::{BuildResult, Chunk, RaptorError};

fn assert_layer_invariants(result: &BuildResult) {
    let mut expected_start = 0;
    for (level, layer) in result.layers.iter().enumerate() {
        assert_eq!(layer.level, level);
        assert_eq!(layer.start, expected_start, "layers must be contiguous");
        assert!(layer.end > layer.start);
        for node in &result.nodes[layer.start..layer.end] {
            assert_eq!(node.level, level);
            assert_eq!(node.vector.len(), DIM);
        }
        expected_start = layer.end;
    }
    assert_eq!(expected_start, result.nodes.len());

    let summarized: usize = result.assignments.iter().map(|a| a.n_clusters).sum();
    assert_eq!(result.original_count + summarized, result.nodes.len());
    assert_eq!(result.levels_built, result.layers.len() - 1);
    assert_eq!(result.assignments.len(), result.levels_built);

    for (assignment, pair) in result.assignments.iter().zip(result.layers.windows(2)) {
        assert_eq!(assignment.labels.len(), pair[0].len());
        assert_eq!(assignment.n_clusters, pair[1].len());
        assert!(assignment.labels.iter().all(|&l| l < assignment.n_clusters));
    }
}

fn healthy_registry(config: &raptor_tree::config::AppConfig) -> raptor_tree::llm::registry::ProviderRegistry {
    registry(
        config,
        vec![
            StubEmbedder::new("key-a", EmbedBehaviour::Ok),
            StubEmbedder::new("key-b", EmbedBehaviour::Ok),
        ],
        StubCompleter::new(CompleteBehaviour::Echo),
    )
}

#[tokio::test]
async fn zero_or_one_chunk_builds_nothing() {
    let config = test_config();
    let registry = healthy_registry(&config);

    let empty = registry.tree_builder().build(Vec::new()).await.unwrap();
    assert_eq!(empty.levels_built, 0);
    assert!(empty.nodes.is_empty());

    let one = registry.tree_builder().build(topic_chunks(1)).await.unwrap();
    assert_eq!(one.levels_built, 0);
    assert_eq!(one.nodes.len(), 1);
    assert_eq!(one.original_count, 1);
}

#[tokio::test]
async fn two_chunks_make_one_root() {
    let config = test_config();
    let registry = healthy_registry(&config);
    let result = registry.tree_builder().build(topic_chunks(2)).await.unwrap();

    assert_eq!(result.nodes.len(), 3);
    assert_eq!(result.levels_built, 1);
    assert_eq!(result.top_layer().len(), 1);
    assert!(result.top_layer()[0].content.starts_with("Summary of 2 passages"));
    assert_layer_invariants(&result);
}

#[tokio::test]
async fn forty_chunks_converge_to_single_root() {
    let config = test_config();
    let registry = healthy_registry(&config);
    let lines = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = Arc::clone(&lines);
    let builder = registry
        .tree_builder()
        .with_progress(Arc::new(move |line: &str| sink.lock().unwrap().push(line.to_string())));

    let result = builder.build(topic_chunks(40)).await.unwrap();

    assert_eq!(result.original_count, 40);
    assert_eq!(result.top_layer().len(), 1);
    assert!(result.levels_built >= 1 && result.levels_built <= 10);
    assert!(result.assignments[0].n_clusters <= 7);
    assert_layer_invariants(&result);

    let lines = lines.lock().unwrap();
    assert_eq!(lines.len(), result.levels_built);
    assert!(lines[0].starts_with("Layer 1: 40 → "));
}

#[tokio::test]
async fn identical_input_builds_identical_tree() {
    let config = test_config();
    let first = healthy_registry(&config)
        .tree_builder()
        .build(topic_chunks(24))
        .await
        .unwrap();
    let second = healthy_registry(&config)
        .tree_builder()
        .build(topic_chunks(24))
        .await
        .unwrap();

    assert_eq!(first.assignments, second.assignments);
    assert_eq!(first.layers, second.layers);
    let contents = |r: &BuildResult| r.nodes.iter().map(|n| n.content.clone()).collect::<Vec<_>>();
    assert_eq!(contents(&first), contents(&second));
}

#[tokio::test]
async fn level_cap_stops_without_error() {
    let mut config = test_config();
    config.raptor.max_levels = 1;
    let registry = healthy_registry(&config);
    let result = registry.tree_builder().build(topic_chunks(20)).await.unwrap();

    assert_eq!(result.levels_built, 1);
    assert_layer_invariants(&result);
}

#[tokio::test]
async fn failing_summarizer_falls_back_and_completes() {
    let config = test_config();
    let completer = StubCompleter::new(CompleteBehaviour::AlwaysFail);
    let registry = registry(
        &config,
        vec![
            StubEmbedder::new("key-a", EmbedBehaviour::Ok),
            StubEmbedder::new("key-b", EmbedBehaviour::Ok),
        ],
        completer.clone(),
    );
    let chunks = topic_chunks(12);
    let result = registry.tree_builder().build(chunks.clone()).await.unwrap();

    assert_layer_invariants(&result);
    assert_eq!(result.top_layer().len(), 1);
    for node in &result.nodes[result.original_count..] {
        assert!(node.content.ends_with("..."), "not a fallback: {}", node.content);
    }

    // First-layer fallbacks are built from the member chunk texts.
    let level0 = &result.assignments[0];
    let first_cluster: Vec<String> = level0
        .labels
        .iter()
        .enumerate()
        .filter(|(_, label)| **label == 0)
        .map(|(pos, _)| chunks[pos].content.clone())
        .collect();
    assert_eq!(result.nodes[result.original_count].content, fallback_summary(&first_cluster));
    assert!(completer.calls() >= 3);
}

#[tokio::test]
async fn rejected_completion_key_fails_the_build() {
    let config = test_config();
    let completer = StubCompleter::new(CompleteBehaviour::Rejected);
    let registry = registry(
        &config,
        vec![
            StubEmbedder::new("key-a", EmbedBehaviour::Ok),
            StubEmbedder::new("key-b", EmbedBehaviour::Ok),
        ],
        completer.clone(),
    );

    let err = registry.tree_builder().build(topic_chunks(6)).await.unwrap_err();
    match err {
        RaptorError::Completion(inner) => assert_eq!(inner.kind(), ErrorKind::Authentication),
        other => panic!("unexpected error: {other}"),
    }
    // Not retried: one call per cluster of the first layer at most.
    assert!(completer.calls() <= 6);
}

#[tokio::test]
async fn invalid_chunks_are_skipped() {
    let config = test_config();
    let registry = healthy_registry(&config);
    let mut chunks = topic_chunks(3);
    chunks.push(Chunk {
        content: String::new(),
        vector: vec![1.0; DIM],
    });
    chunks.push(Chunk {
        content: "no vector".into(),
        vector: Vec::new(),
    });

    let result = registry.tree_builder().build(chunks).await.unwrap();
    assert_eq!(result.original_count, 3);
    assert_layer_invariants(&result);
}

#[tokio::test]
async fn build_timeout_fails_whole_build() {
    let mut config = test_config();
    config.raptor.build_timeout_secs = Some(1);
    let registry = registry(
        &config,
        vec![
            StubEmbedder::new("key-a", EmbedBehaviour::Ok),
            StubEmbedder::new("key-b", EmbedBehaviour::Ok),
        ],
        StubCompleter::new(CompleteBehaviour::Slow(Duration::from_secs(5))),
    );

    let err = registry.tree_builder().build(topic_chunks(2)).await.unwrap_err();
    assert!(matches!(err, RaptorError::Timeout(_)));
}
