/// Integration tests for trace ingestion.
use pdsim_core::trace::{self, SyntheticTrace};
use pdsim_core::TraceRequest;
use std::path::PathBuf;

fn workspace_file(rel: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..").join(rel)
}

#[test]
fn test_load_example_trace() {
    let path = workspace_file("traces/example_trace.jsonl");
    if !path.exists() {
        return;
    }
    let requests = trace::load_trace(&path, "compact_jsonl").unwrap();
    assert!(!requests.is_empty());
    for i in 1..requests.len() {
        assert!(requests[i].arrival_ns >= requests[i - 1].arrival_ns);
    }
}

#[test]
fn test_example_trace_runs_with_example_config() {
    let config_path = workspace_file("configs/example.toml");
    let trace_path = workspace_file("traces/example_trace.jsonl");
    if !config_path.exists() || !trace_path.exists() {
        return;
    }
    let config = pdsim_core::SimConfig::from_file(&config_path).unwrap();
    let requests = trace::load_trace(&trace_path, &config.trace.format).unwrap();
    let total = requests.len();
    let report = pdsim_core::run_simulation_blocking(config, requests).unwrap();
    assert_eq!(report.completed_requests, total);
}

#[test]
fn test_write_and_read_trace() {
    let tmp_path = std::env::temp_dir().join("pdsim_test_trace.jsonl");
    let requests = vec![
        TraceRequest::new(0, 256),
        TraceRequest::new(100, 512),
        TraceRequest::new(100, 3),
    ];

    trace::write_compact_jsonl_file(&requests, &tmp_path).unwrap();
    let loaded = trace::load_trace(&tmp_path, "compact_jsonl").unwrap();
    assert_eq!(loaded, requests);

    let _ = std::fs::remove_file(&tmp_path);
}

#[test]
fn test_requests_json_file() {
    let tmp_path = std::env::temp_dir().join("pdsim_test_requests.json");
    std::fs::write(
        &tmp_path,
        r#"{"count": 3, "seq_len": 128, "arrival": [0, 1000]}"#,
    )
    .unwrap();

    let loaded = trace::load_trace(&tmp_path, "requests_json").unwrap();
    assert_eq!(
        loaded,
        vec![
            TraceRequest::new(0, 128),
            TraceRequest::new(1000, 128),
            TraceRequest::new(1000, 128),
        ]
    );

    let _ = std::fs::remove_file(&tmp_path);
}

#[test]
fn test_missing_file_is_io_error() {
    let err = trace::load_trace(
        std::path::Path::new("/nonexistent/pdsim/trace.jsonl"),
        "compact_jsonl",
    )
    .unwrap_err();
    assert!(matches!(err, trace::TraceError::Io(_)));
}

#[test]
fn test_synthetic_trace_round_trips_through_file() {
    let tmp_path = std::env::temp_dir().join("pdsim_test_synthetic.jsonl");
    let requests = SyntheticTrace {
        count: 50,
        seed: 7,
        ..Default::default()
    }
    .generate();

    trace::write_compact_jsonl_file(&requests, &tmp_path).unwrap();
    let loaded = trace::load_trace(&tmp_path, "jsonl").unwrap();
    assert_eq!(loaded, requests);

    let _ = std::fs::remove_file(&tmp_path);
}
