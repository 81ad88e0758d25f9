
use podbridge::process::factory::{ATTEMPT_LABEL_KEY, JOB_LABEL_KEY, WORKER_MARKER_KEY};
use podbridge::WorkerError;
use test_harness::{launch_request, test_factory, FakeCluster};

#[tokio::test]
async fn source_and_destination_get_distinct_names_and_ports() {
    let cluster = FakeCluster::new();
    let (factory, pool) = test_factory(&cluster, &[9300, 9301, 9302, 9303]);

    let source = factory
        .create(launch_request("sync", "airbyte/source-postgres", false))
        .await
        .unwrap();
    let destination = factory
        .create(launch_request("sync", "airbyte/destination-s3", true))
        .await
        .unwrap();

    assert_ne!(source.name(), destination.name());

    // Each workload got its own pair; nothing is shared.
    assert_eq!(pool.available(), 0);

    source.kill().await;
    destination.kill().await;
    assert_eq!(pool.available(), 4);
}

#[tokio::test]
async fn exhausted_pool_fails_create_without_cluster_object() {
    let cluster = FakeCluster::new();
    let (factory, pool) = test_factory(&cluster, &[9310]);

    let err = factory
        .create(launch_request("sync", "airbyte/source-postgres", false))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::PortsExhausted));

    // The first taken port was given back; no workload was submitted.
    assert_eq!(pool.available(), 1);
    assert_eq!(cluster.create_count(), 0);
}

#[tokio::test]
async fn rejected_submission_releases_both_ports() {
    let cluster = FakeCluster::new();
    let (factory, pool) = test_factory(&cluster, &[9320, 9321]);
    cluster.fail_next_create();

    let err = factory
        .create(launch_request("sync", "airbyte/source-postgres", false))
        .await
        .unwrap_err();
    // Submission failures surface as cluster errors, not generic startup
    // failures.
    assert!(matches!(err, WorkerError::Cluster(_)));

    assert_eq!(pool.available(), 2);
    assert!(cluster.workload_names().is_empty());
}

#[tokio::test]
async fn submitted_spec_carries_reserved_labels() {
    let cluster = FakeCluster::new();
    let (factory, _pool) = test_factory(&cluster, &[9330, 9331]);

    let mut request = launch_request("sync", "airbyte/source-postgres", false);
    request
        .custom_labels
        .insert(JOB_LABEL_KEY.to_string(), "spoofed".to_string());
    request
        .custom_labels
        .insert("team".to_string(), "ingest".to_string());

    let process = factory.create(request).await.unwrap();
    let spec = cluster.spec(process.name()).unwrap();

    assert_eq!(spec.labels.get(JOB_LABEL_KEY).map(String::as_str), Some("42"));
    assert_eq!(spec.labels.get(ATTEMPT_LABEL_KEY).map(String::as_str), Some("1"));
    assert!(spec.labels.contains_key(WORKER_MARKER_KEY));
    assert_eq!(spec.labels.get("team").map(String::as_str), Some("ingest"));

    process.kill().await;
}

#[tokio::test]
async fn stdin_handle_absent_when_not_requested() {
    let cluster = FakeCluster::new();
    let (factory, _pool) = test_factory(&cluster, &[9340, 9341]);

    let process = factory
        .create(launch_request("sync", "airbyte/source-postgres", false))
        .await
        .unwrap();

    assert!(process.take_stdin().is_none());
    assert!(process.take_stdout().is_some());
    assert!(process.take_stderr().is_some());

    process.kill().await;
}

#[tokio::test]
async fn missing_entrypoint_is_a_configuration_error() {
    let cluster = FakeCluster::new();
    let (factory, pool) = test_factory(&cluster, &[9360, 9361]);

    let mut request = launch_request("sync", "airbyte/source-postgres", false);
    request.entrypoint = "  ".to_string();

    let err = factory.create(request).await.unwrap_err();
    assert!(matches!(err, WorkerError::Configuration(_)));
    // Rejected before any resource was touched.
    assert_eq!(pool.available(), 2);
    assert_eq!(cluster.create_count(), 0);
}

#[tokio::test]
async fn workload_name_respects_length_ceiling() {
    let cluster = FakeCluster::new();
    let (factory, _pool) = test_factory(&cluster, &[9350, 9351]);

    let mut request = launch_request("sync", "airbyte/source-a-very-long-connector-image-name", false);
    request.job_id = "0123456789-0123456789-0123456789-0123456789".to_string();

    let process = factory.create(request).await.unwrap();
    assert!(process.name().len() <= 63);

    process.kill().await;
}
