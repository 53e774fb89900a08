//! End-to-end ingestion against a SQLite scene store on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use scene_ingest::{
    BoundingBox, CaptureSettings, ContinuousSource, Detection, DetectionFilter, DetectorBackend,
    DetectorFactory, ErrorKind, IngestConfig, IngestPipeline, IngestRequest, IngestService,
    PipelineState, SceneFilter, SceneMetadata, SceneStore, SourceDescriptor, SqliteSceneStore,
    StubBackend, Termination,
};

fn detection(label: &str, confidence: f64, corners: [f64; 4]) -> Detection {
    let [x_min, y_min, x_max, y_max] = corners;
    Detection::new(
        label,
        confidence,
        BoundingBox::new(x_min, y_min, x_max, y_max).expect("valid box"),
    )
    .expect("valid detection")
}

fn object() -> Detection {
    detection("object", 0.9, [30.0, 30.0, 70.0, 70.0])
}

fn stub_factory(detections: Vec<Detection>) -> DetectorFactory {
    Arc::new(move || -> anyhow::Result<Box<dyn DetectorBackend>> {
        Ok(Box::new(StubBackend::returning(detections.clone())))
    })
}

fn config_in(dir: &TempDir) -> IngestConfig {
    let mut config = IngestConfig::with_db_path(dir.path().join("scenes.db").to_string_lossy());
    config.busy_timeout = Duration::from_secs(10);
    config
}

fn open_store(config: &IngestConfig) -> SqliteSceneStore {
    SqliteSceneStore::open(&config.db_path, config.busy_timeout).expect("open store")
}

/// 100x100 PNG with one filled rectangle at [30, 30, 70, 70].
fn write_rectangle_png(dir: &Path) -> PathBuf {
    let img = image::RgbImage::from_fn(100, 100, |x, y| {
        if (30..70).contains(&x) && (30..70).contains(&y) {
            image::Rgb([220, 40, 40])
        } else {
            image::Rgb([255, 255, 255])
        }
    });
    let path = dir.join("rectangle.png");
    img.save(&path).expect("write png");
    path
}

#[test]
fn image_scenario_persists_one_scene_and_one_detection() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let config = config_in(&dir);
    let path = write_rectangle_png(dir.path());
    let service = IngestService::new(config.clone(), stub_factory(vec![object()]));

    let response = service.ingest_image(
        &path.to_string_lossy(),
        Some("image/png"),
        SceneMetadata::default(),
    )?;

    assert_eq!(response.detections.len(), 1);
    let stored = &response.detections[0];
    assert_eq!(stored.scene_id, response.scene_id);
    assert_eq!(stored.detection.label(), "object");
    assert_eq!(stored.detection.confidence(), 0.9);
    assert_eq!(stored.detection.bbox().as_array(), [30.0, 30.0, 70.0, 70.0]);

    let store = open_store(&config);
    let scenes = store.list_scenes(&SceneFilter::default())?;
    assert_eq!(scenes.len(), 1);
    assert_eq!(scenes[0].id, response.scene_id);
    assert_eq!(scenes[0].camera_id, "image_upload");
    assert_eq!(scenes[0].resolution.as_deref(), Some("100x100"));
    assert_eq!(scenes[0].media_path, path.to_string_lossy());
    assert_eq!(store.list_detections(&DetectionFilter::default())?.len(), 1);

    let json = serde_json::to_value(&response)?;
    assert_eq!(json["detections"][0]["class"], "object");
    assert_eq!(json["detections"][0]["x_max"], 70.0);
    Ok(())
}

#[test]
fn image_ignores_duration_and_reads_one_frame() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let config = config_in(&dir);
    let path = write_rectangle_png(dir.path());
    let request = IngestRequest::new(SourceDescriptor::from_path(&path.to_string_lossy())?)
        .with_duration(600);

    let mut store = open_store(&config);
    let mut detector = StubBackend::new();
    let started = Instant::now();
    let summary = IngestPipeline::new(&mut store, &mut detector, &config.capture).run(&request)?;

    assert_eq!(summary.termination, Termination::SingleFrame);
    assert_eq!(summary.frames_processed, 1);
    assert_eq!(detector.calls(), 1);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(store.list_scenes(&SceneFilter::default())?.len(), 1);
    Ok(())
}

#[test]
fn truncated_image_fails_at_open_without_scene() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let config = config_in(&dir);
    let noisy = image::RgbImage::from_fn(64, 64, |x, y| {
        image::Rgb([(x * 31 + y * 17) as u8, (x * y) as u8, (x ^ y) as u8])
    });
    let full = dir.path().join("full.png");
    noisy.save(&full)?;
    let bytes = std::fs::read(&full)?;
    let truncated = dir.path().join("truncated.png");
    std::fs::write(&truncated, &bytes[..bytes.len() / 2])?;

    let service = IngestService::new(config.clone(), stub_factory(vec![object()]));
    let err = service
        .ingest_image(&truncated.to_string_lossy(), None, SceneMetadata::default())
        .expect_err("truncated image must not decode");
    assert_eq!(err.kind(), ErrorKind::SourceUnavailable);
    assert_eq!(err.phase, PipelineState::Opening);
    assert!(!err.is_partial());
    assert_eq!(err.scene_id, None);

    let store = open_store(&config);
    assert!(store.list_scenes(&SceneFilter::default())?.is_empty());
    assert!(store.list_detections(&DetectionFilter::default())?.is_empty());
    Ok(())
}

#[test]
fn continuous_camera_stops_within_duration_bound() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let mut config = config_in(&dir);
    config.capture.camera.device = "stub://webcam?width=32&height=24".to_string();
    let service = IngestService::new(config.clone(), stub_factory(Vec::new()));

    let started = Instant::now();
    let response =
        service.ingest_continuous(ContinuousSource::Camera, 1, SceneMetadata::default())?;
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(1));
    // One frame period at the default 10 fps plus generous scheduling slack.
    assert!(elapsed < Duration::from_secs(3), "ran for {:?}", elapsed);
    assert_eq!(response.message, "Webcam detection completed for 1 seconds");

    let store = open_store(&config);
    let scene = store.get_scene(response.scene_id)?.expect("scene exists");
    assert_eq!(scene.camera_id, "webcam");
    assert_eq!(scene.resolution.as_deref(), Some("32x24"));
    assert!(scene.media_path.starts_with("webcam_stream_"));
    assert_eq!(store.count_detections(response.scene_id)?, 0);
    Ok(())
}

#[test]
fn stream_response_names_the_stream() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let config = config_in(&dir);
    let service = IngestService::new(config.clone(), stub_factory(vec![object()]));
    let response = service.ingest_continuous(
        ContinuousSource::Stream {
            url: "stub://gate?fps=50&fail_after=5&width=16&height=16".to_string(),
        },
        10,
        SceneMetadata {
            camera_id: Some("gate_cam".to_string()),
            ..SceneMetadata::default()
        },
    )?;
    assert_eq!(response.message, "RTSP stream detection completed for 10 seconds");

    let store = open_store(&config);
    let scene = store.get_scene(response.scene_id)?.expect("scene exists");
    assert_eq!(scene.camera_id, "gate_cam");
    assert_eq!(
        scene.media_path,
        "stub://gate?fps=50&fail_after=5&width=16&height=16"
    );
    assert_eq!(store.count_detections(response.scene_id)?, 5);
    Ok(())
}

#[test]
fn unreachable_stream_creates_no_scene() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let mut config = config_in(&dir);
    config.capture.stream.connect_timeout_ms = 500;
    let service = IngestService::new(config.clone(), stub_factory(Vec::new()));

    let err = service
        .ingest_continuous(
            ContinuousSource::Stream {
                url: "rtsp://127.0.0.1:1/live".to_string(),
            },
            5,
            SceneMetadata::default(),
        )
        .expect_err("nothing listens on port 1");
    assert_eq!(err.kind(), ErrorKind::SourceUnavailable);
    assert_eq!(err.phase, PipelineState::Opening);
    assert!(!err.is_partial());

    let store = open_store(&config);
    assert!(store.list_scenes(&SceneFilter::default())?.is_empty());
    Ok(())
}

#[test]
fn validation_failures_touch_nothing() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let config = config_in(&dir);
    let service = IngestService::new(config.clone(), stub_factory(Vec::new()));

    let zero_duration = service
        .ingest_continuous(ContinuousSource::Camera, 0, SceneMetadata::default())
        .expect_err("zero duration");
    let bad_url = service
        .ingest_continuous(
            ContinuousSource::Stream {
                url: "ftp://camera/feed".to_string(),
            },
            5,
            SceneMetadata::default(),
        )
        .expect_err("unsupported scheme");
    let bad_type = service
        .ingest_image("photo.png", Some("image/gif"), SceneMetadata::default())
        .expect_err("disallowed content type");
    let wrong_kind = service
        .ingest_video("photo.png", None, SceneMetadata::default())
        .expect_err("image passed to video ingestion");

    for err in [zero_duration, bad_url, bad_type, wrong_kind] {
        assert!(err.is_validation(), "{}", err);
        assert_eq!(err.phase, PipelineState::Init);
    }
    assert!(!Path::new(&config.db_path).exists());
    Ok(())
}

#[test]
fn video_reports_total_detections() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let config = config_in(&dir);
    let service = IngestService::new(
        config.clone(),
        stub_factory(vec![object(), detection("person", 0.6, [1.0, 2.0, 10.0, 20.0])]),
    );
    let response = service.ingest_video(
        "stub://clip.mp4?frames=4&width=16&height=16",
        Some("video/mp4"),
        SceneMetadata::default(),
    )?;
    assert_eq!(response.total_detections, 8);

    let store = open_store(&config);
    let people = store.list_detections(&DetectionFilter {
        class_label: Some("person".to_string()),
        ..DetectionFilter::default()
    })?;
    assert_eq!(people.len(), 4);
    Ok(())
}

#[test]
fn failed_batch_leaves_earlier_batches_and_no_partial_rows() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let config = config_in(&dir);
    let mut store = open_store(&config);

    // Fault injection: a second connection installs a trigger that aborts one insert.
    let conn = rusqlite::Connection::open(&config.db_path)?;
    conn.execute_batch(
        "CREATE TRIGGER fail_poison BEFORE INSERT ON detections \
         WHEN NEW.class = 'poison' \
         BEGIN SELECT RAISE(ABORT, 'injected fault'); END;",
    )?;
    drop(conn);

    let request =
        IngestRequest::new(SourceDescriptor::from_path("stub://clip.mp4?frames=5&width=8&height=8")?);
    let mut detector = StubBackend::scripted(vec![
        vec![object()],
        vec![detection("car", 0.7, [0.0, 0.0, 4.0, 4.0])],
        vec![
            detection("bike", 0.8, [1.0, 1.0, 2.0, 2.0]),
            detection("poison", 0.5, [1.0, 1.0, 2.0, 2.0]),
            detection("bus", 0.8, [1.0, 1.0, 2.0, 2.0]),
        ],
        vec![object()],
    ]);
    let err = IngestPipeline::new(&mut store, &mut detector, &config.capture)
        .run(&request)
        .expect_err("third batch aborts");

    assert_eq!(err.kind(), ErrorKind::Storage);
    assert_eq!(err.phase, PipelineState::Streaming);
    assert_eq!(err.persisted_detections, 2);
    let scene_id = err.scene_id.expect("scene was created");

    let labels: Vec<String> = store
        .scene_detections(scene_id)?
        .iter()
        .map(|d| d.detection.label().to_string())
        .collect();
    assert_eq!(labels, vec!["object", "car"]);
    assert_eq!(detector.calls(), 3);
    Ok(())
}

#[test]
fn concurrent_handles_write_to_one_database() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let config = config_in(&dir);
    // Create the schema once before the writers race.
    drop(open_store(&config));

    let mut handles = Vec::new();
    for worker in 0..8 {
        let config = config.clone();
        handles.push(std::thread::spawn(move || -> anyhow::Result<Vec<i64>> {
            let mut store = SqliteSceneStore::open(&config.db_path, config.busy_timeout)?;
            let mut ids = Vec::new();
            for clip in 0..10 {
                let scene = scene_ingest::NewScene::new(
                    format!("cam_{}", worker),
                    format!("clip_{}_{}.mp4", worker, clip),
                );
                let id = store.create_scene(&scene)?;
                store.append_detections(id, &[object(), object()])?;
                ids.push(id);
            }
            Ok(ids)
        }));
    }

    let mut all_ids = Vec::new();
    for handle in handles {
        let ids = handle
            .join()
            .map_err(|_| anyhow::anyhow!("writer thread panicked"))??;
        all_ids.extend(ids);
    }
    all_ids.sort_unstable();
    all_ids.dedup();
    assert_eq!(all_ids.len(), 80);

    let store = open_store(&config);
    assert_eq!(store.list_scenes(&SceneFilter::default())?.len(), 80);
    assert_eq!(store.list_detections(&DetectionFilter::default())?.len(), 160);
    for id in all_ids {
        assert_eq!(store.count_detections(id)?, 2);
    }
    Ok(())
}

#[test]
fn schema_enforces_references_and_cascade() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let config = config_in(&dir);
    let mut store = open_store(&config);
    let scene_id = store.create_scene(&scene_ingest::NewScene::new("webcam", "tag"))?;
    store.append_detections(scene_id, &[object(), object()])?;

    let conn = rusqlite::Connection::open(&config.db_path)?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    let orphan = conn.execute(
        "INSERT INTO detections(scene_id, class, confidence, x_min, y_min, x_max, y_max) \
         VALUES (?1, 'object', 0.5, 0, 0, 1, 1)",
        rusqlite::params![scene_id + 1000],
    );
    assert!(orphan.is_err(), "orphan insert must be rejected");

    let inverted = conn.execute(
        "INSERT INTO detections(scene_id, class, confidence, x_min, y_min, x_max, y_max) \
         VALUES (?1, 'object', 0.5, 5, 0, 1, 1)",
        rusqlite::params![scene_id],
    );
    assert!(inverted.is_err(), "inverted box must be rejected");

    conn.execute("DELETE FROM scenes WHERE id = ?1", rusqlite::params![scene_id])?;
    assert_eq!(store.count_detections(scene_id)?, 0);
    Ok(())
}
