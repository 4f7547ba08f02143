//! Integration tests for the scan-and-download pipeline.
//!
//! The end-to-end tests run the real metadata source and HTTP transfer
//! against a wiremock server; the rest inject fake scanners and transfers
//! to control timing.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scandl_core::checkpoint::Checkpoint;
use scandl_core::{
    Input, ItemFlags, Outcome, Pipeline, PipelineConfig, Scanner, Transfer, TransferContext,
    WorkItem,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ==================== Fakes ====================

/// Finds every id except the listed ones.
struct FakeScanner {
    missing: HashSet<u64>,
}

#[async_trait]
impl Scanner for FakeScanner {
    async fn scan(&self, item: &mut WorkItem) -> Outcome {
        if self.missing.contains(&item.id()) {
            return Outcome::NotFound;
        }
        item.info.link = Some(format!("https://cdn.example.com/{}.mp4", item.id()));
        item.info.filename = Some(format!("{}.mp4", item.id()));
        Outcome::Success
    }
}

/// Writes the destination file, then either finishes or waits for
/// cancellation when `hang` is set.
struct FileTransfer {
    hang: bool,
}

#[async_trait]
impl Transfer for FileTransfer {
    async fn transfer(&self, item: &mut WorkItem, ctx: &TransferContext) -> Outcome {
        let Some(dest) = item.destination_in(&ctx.output_dir) else {
            return Outcome::Skipped;
        };
        fs::write(&dest, b"partial").unwrap();
        item.add_flags(ItemFlags::CREATED_THIS_RUN);
        item.tracker().set_destination(&dest);
        if self.hang {
            ctx.cancel.cancelled().await;
            return Outcome::RetriesExhausted;
        }
        Outcome::Success
    }
}

fn base_config(output: &TempDir) -> PipelineConfig {
    PipelineConfig {
        output_dir: output.path().to_path_buf(),
        ..PipelineConfig::default()
    }
}

// ==================== End-to-end over HTTP ====================

async fn mount_catalog(server: &MockServer, ids: &[u64], missing: u64) {
    for &id in ids {
        let metadata_path = format!("/items/{id}");
        if id == missing {
            Mock::given(method("GET"))
                .and(path(metadata_path))
                .respond_with(ResponseTemplate::new(404))
                .mount(server)
                .await;
            continue;
        }
        let body = serde_json::json!({
            "title": format!("clip {id}"),
            "duration": 30,
            "tags": ["demo"],
            "files": [
                {"quality": "480p", "url": format!("{}/media/{id}-480.mp4", server.uri())},
                {"quality": "720p", "url": format!("{}/media/{id}-720.mp4", server.uri())},
            ],
        });
        Mock::given(method("GET"))
            .and(path(metadata_path))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/media/{id}-720.mp4")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(format!("media {id}")))
            .expect(1)
            .mount(server)
            .await;
    }
}

#[tokio::test]
async fn test_range_with_one_missing_id() {
    let server = MockServer::start().await;
    mount_catalog(&server, &[100, 101, 102, 103, 104], 102).await;
    let output = TempDir::new().unwrap();
    let checkpoint = output.path().join("run.resume");

    let config = PipelineConfig {
        metadata_url: Some(format!("{}/items/{{id}}", server.uri())),
        checkpoint: Some(checkpoint.clone()),
        sidecar: true,
        ..base_config(&output)
    };
    let report = Pipeline::new(
        Input::Range {
            start: 100,
            end: Some(104),
        },
        config,
        CancellationToken::new(),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.downloaded, 4);
    assert_eq!(report.not_found, 1);
    assert!(report.failed_ids.is_empty());
    assert_eq!(report.outstanding, 0);
    assert_eq!(report.sidecars, 4);
    assert!(report.is_clean());
    assert!(!checkpoint.exists(), "clean run removes its checkpoint");

    let media = output.path().join("100_clip_100_720p.mp4");
    assert_eq!(fs::read_to_string(&media).unwrap(), "media 100");
    assert!(output.path().join("100_clip_100_720p.mp4.json").exists());
    assert!(!output.path().join("100_clip_100_720p.mp4.part").exists());
    assert!(!output.path().join("102_clip_102_720p.mp4").exists());
}

#[tokio::test]
async fn test_second_run_finds_existing_files() {
    let server = MockServer::start().await;
    mount_catalog(&server, &[7, 8], 0).await;
    let output = TempDir::new().unwrap();
    let config = PipelineConfig {
        metadata_url: Some(format!("{}/items/{{id}}", server.uri())),
        ..base_config(&output)
    };
    let input = || Input::Range {
        start: 7,
        end: Some(8),
    };

    let first = Pipeline::new(input(), config.clone(), CancellationToken::new())
        .run()
        .await
        .unwrap();
    assert_eq!(first.downloaded, 2);

    // media mocks expect exactly one hit each
    let second = Pipeline::new(input(), config, CancellationToken::new())
        .run()
        .await
        .unwrap();
    assert_eq!(second.downloaded, 0);
    assert_eq!(second.already_existed, 2);
}

#[tokio::test]
async fn test_quality_ceiling_selects_lower_rendition() {
    let server = MockServer::start().await;
    let body = serde_json::json!({
        "files": [
            {"quality": "480p", "url": format!("{}/media/9-480.mp4", server.uri())},
            {"quality": "1080p", "url": format!("{}/media/9-1080.mp4", server.uri())},
        ],
    });
    Mock::given(method("GET"))
        .and(path("/items/9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/media/9-480.mp4"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes("small"))
        .expect(1)
        .mount(&server)
        .await;
    let output = TempDir::new().unwrap();

    let config = PipelineConfig {
        metadata_url: Some(format!("{}/items/{{id}}", server.uri())),
        quality: "720p".parse().unwrap(),
        ..base_config(&output)
    };
    let report = Pipeline::new(Input::Ids(vec![9]), config, CancellationToken::new())
        .run()
        .await
        .unwrap();

    assert_eq!(report.downloaded, 1);
    assert!(output.path().join("9_480p.mp4").exists());
}

// ==================== Injected collaborators ====================

#[tokio::test]
async fn test_fake_range_counts() {
    let output = TempDir::new().unwrap();
    let report = Pipeline::new(
        Input::Range {
            start: 100,
            end: Some(104),
        },
        base_config(&output),
        CancellationToken::new(),
    )
    .with_scanner(Arc::new(FakeScanner {
        missing: HashSet::from([102]),
    }))
    .with_transfer(Arc::new(FileTransfer { hang: false }))
    .run()
    .await
    .unwrap();

    assert_eq!(report.scanned, 4);
    assert_eq!(report.downloaded, 4);
    assert_eq!(report.not_found, 1);
    assert!(report.failed_ids.is_empty());
    assert_eq!(report.outstanding, 0);
}

#[tokio::test]
async fn test_lookahead_stops_after_trailing_misses() {
    let output = TempDir::new().unwrap();
    let config = PipelineConfig {
        lookahead: 3,
        ..base_config(&output)
    };
    let report = Pipeline::new(
        Input::Range {
            start: 1,
            end: None,
        },
        config,
        CancellationToken::new(),
    )
    .with_scanner(Arc::new(FakeScanner {
        missing: (3..100).collect(),
    }))
    .with_transfer(Arc::new(FileTransfer { hang: false }))
    .run()
    .await
    .unwrap();

    assert_eq!(report.downloaded, 2);
    assert_eq!(report.not_found, 3);
}

#[tokio::test]
async fn test_preloaded_items_skip_scan() {
    let output = TempDir::new().unwrap();
    fs::write(output.path().join("2.mp4"), b"old").unwrap();
    let items = (1..=3)
        .map(|id| {
            let mut item = WorkItem::new(id);
            item.info.filename = Some(format!("{id}.mp4"));
            item.info.link = Some(format!("https://cdn.example.com/{id}.mp4"));
            item
        })
        .collect();

    let report = Pipeline::new(Input::Items(items), base_config(&output), CancellationToken::new())
        .with_transfer(Arc::new(FileTransfer { hang: false }))
        .run()
        .await
        .unwrap();

    assert_eq!(report.scanned, 0);
    assert_eq!(report.downloaded, 2);
    assert_eq!(report.already_existed, 1);
    assert_eq!(fs::read(output.path().join("2.mp4")).unwrap(), b"old");
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_deletes_partial_and_checkpoints() {
    let output = TempDir::new().unwrap();
    let checkpoint: PathBuf = output.path().join("run.resume");
    let cancel = CancellationToken::new();
    let config = PipelineConfig {
        concurrency: 1,
        checkpoint: Some(checkpoint.clone()),
        throttle_kbps: 64.0,
        ..base_config(&output)
    };

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.cancel();
    });
    let report = Pipeline::new(
        Input::Range {
            start: 1,
            end: Some(3),
        },
        config,
        cancel,
    )
    .with_scanner(Arc::new(FakeScanner {
        missing: HashSet::new(),
    }))
    .with_transfer(Arc::new(FileTransfer { hang: true }))
    .run()
    .await
    .unwrap();

    assert!(report.interrupted);
    assert_eq!(report.downloaded, 0);
    assert_eq!(report.outstanding, 3);
    assert!(!output.path().join("1.mp4").exists(), "partial file removed");

    let saved = Checkpoint::read(&checkpoint).unwrap();
    assert_eq!(saved.ids(), [1, 2, 3]);
    let output_arg = output.path().display().to_string();
    assert_eq!(
        saved.args(),
        [
            "--end",
            "3",
            "--output",
            output_arg.as_str(),
            "--concurrency",
            "1",
            "--throttle",
            "64",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_keeps_partial_when_asked() {
    let output = TempDir::new().unwrap();
    let cancel = CancellationToken::new();
    let config = PipelineConfig {
        concurrency: 1,
        keep_unfinished: true,
        ..base_config(&output)
    };

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.cancel();
    });
    let report = Pipeline::new(Input::Ids(vec![4, 5]), config, cancel)
        .with_scanner(Arc::new(FakeScanner {
            missing: HashSet::new(),
        }))
        .with_transfer(Arc::new(FileTransfer { hang: true }))
        .run()
        .await
        .unwrap();

    assert!(report.interrupted);
    assert!(output.path().join("4.mp4").exists());
}
