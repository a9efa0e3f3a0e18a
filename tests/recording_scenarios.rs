use anyhow::Result;
use chunkcam_lib::{
    CameraId, CameraRegistry, Chunk, Dimensions, RecorderError, RecorderSettings, SessionController,
    SessionOutcome, SessionPhase, SyntheticCamera,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use tempfile::{tempdir, TempDir};

struct Harness {
    controller: SessionController,
    cameras: BTreeMap<CameraId, Arc<SyntheticCamera>>,
    uploaded: Arc<Mutex<Vec<Chunk>>>,
    root: PathBuf,
    _dir: TempDir,
}

struct CameraSpec {
    id: CameraId,
    depth_capable: bool,
    delivers_depth: bool,
    declared: Option<Dimensions>,
}

impl CameraSpec {
    fn color(id: CameraId) -> Self {
        Self {
            id,
            depth_capable: false,
            delivers_depth: false,
            declared: None,
        }
    }

    fn depth(id: CameraId) -> Self {
        Self {
            id,
            depth_capable: true,
            delivers_depth: true,
            declared: None,
        }
    }
}

fn harness(specs: Vec<CameraSpec>, configure: impl FnOnce(&mut RecorderSettings)) -> Harness {
    let dir = tempdir().unwrap();
    let root = dir.path().join("chunks");

    let mut settings = RecorderSettings {
        temp_root: root.clone(),
        chunk_duration_secs: 0.4,
        join_timeout_secs: 5.0,
        ..RecorderSettings::default()
    };
    settings.depth_camera_ids = specs.iter().filter(|s| s.depth_capable).map(|s| s.id).collect();
    configure(&mut settings);

    let registry = CameraRegistry::new(settings.depth_camera_ids.clone());
    let mut cameras = BTreeMap::new();
    for spec in specs {
        let mut camera = SyntheticCamera::new(spec.id, 32, 24, 30);
        if spec.delivers_depth {
            camera = camera.with_depth();
        }
        let camera = Arc::new(camera);
        registry.initialize_camera(spec.id, camera.clone(), spec.declared);
        cameras.insert(spec.id, camera);
    }

    let controller = SessionController::new(settings, registry).unwrap();
    let uploaded = Arc::new(Mutex::new(Vec::new()));
    let sink = uploaded.clone();
    controller.set_uploader(Arc::new(move |chunk: Chunk| -> Result<()> {
        sink.lock().unwrap().push(chunk);
        Ok(())
    }));

    Harness {
        controller,
        cameras,
        uploaded,
        root,
        _dir: dir,
    }
}

impl Harness {
    async fn record_for(&self, duration: Duration) -> String {
        let session_id = self
            .controller
            .start_session("patient-7", None, Some("balance".into()))
            .await
            .unwrap();
        assert!(self.controller.start_recording().await.unwrap());
        tokio::time::sleep(duration).await;
        session_id
    }

    async fn wait_for_uploads(&self, count: usize) -> Vec<Chunk> {
        for _ in 0..200 {
            if self.uploaded.lock().unwrap().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.uploaded.lock().unwrap().clone()
    }

    fn camera_dir(&self, camera_id: CameraId) -> PathBuf {
        self.root.join(format!("camera_{camera_id}"))
    }
}

fn sequences(chunks: &[Chunk], camera_id: CameraId) -> Vec<u64> {
    let mut seqs: Vec<u64> = chunks
        .iter()
        .filter(|c| c.camera_id == camera_id)
        .map(|c| c.sequence_number)
        .collect();
    seqs.sort_unstable();
    seqs
}

fn npy_header(path: &Path) -> String {
    let bytes = std::fs::read(path).unwrap();
    String::from_utf8_lossy(&bytes[..bytes.len().min(128)]).into_owned()
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_mid_window_yields_full_windows_plus_drained_tail() {
    let h = harness(vec![CameraSpec::color(0), CameraSpec::color(1)], |_| {});
    let session_id = h.record_for(Duration::from_millis(1000)).await;

    let tail = h.controller.stop_recording().await.unwrap();
    assert_eq!(tail.len(), 2);
    for chunk in &tail {
        assert_eq!(chunk.sequence_number, 2);
        assert!(chunk.duration_seconds < 0.4, "tail lasted {}", chunk.duration_seconds);
        assert!(chunk.frames_written > 0);
    }

    let uploaded = h.wait_for_uploads(6).await;
    for camera_id in [0, 1] {
        assert_eq!(sequences(&uploaded, camera_id), vec![0, 1, 2]);
    }
    for chunk in uploaded.iter().filter(|c| c.sequence_number < 2) {
        assert!(chunk.duration_seconds >= 0.35, "window lasted {}", chunk.duration_seconds);
        assert_eq!(chunk.session_id, session_id);
        assert_eq!(chunk.patient_id, "patient-7");
        assert_eq!(chunk.test_type.as_deref(), Some("balance"));
        assert!(chunk.color_file_path.exists());
        assert_eq!(
            chunk.color_file_path,
            h.camera_dir(chunk.camera_id).join(format!("{}.mp4", chunk.sequence_number))
        );
    }

    let snapshot = h.controller.snapshot().await;
    assert_eq!(snapshot.phase, SessionPhase::Idle);
    assert_eq!(snapshot.last_outcome, Some(SessionOutcome::Stopped));
    assert_eq!(snapshot.chunks_dispatched, 6);
    assert!(!h.cameras[&0].is_recording());
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_mid_window_leaves_no_chunks_or_files() {
    let h = harness(vec![CameraSpec::color(0), CameraSpec::depth(1)], |s| {
        s.chunk_duration_secs = 2.0;
    });
    h.record_for(Duration::from_millis(1000)).await;
    assert!(h.camera_dir(0).join("0.mp4").exists());

    assert!(h.controller.cancel_recording().await.unwrap());
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(h.uploaded.lock().unwrap().is_empty());
    assert!(!h.camera_dir(0).exists());
    assert!(!h.camera_dir(1).exists());

    let snapshot = h.controller.snapshot().await;
    assert!(!snapshot.has_session());
    assert_eq!(snapshot.last_outcome, Some(SessionOutcome::Cancelled));
    assert_eq!(snapshot.chunks_dispatched, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn second_session_conflicts_without_touching_the_first() {
    let h = harness(vec![CameraSpec::color(0)], |_| {});
    let first = h.record_for(Duration::from_millis(100)).await;

    let err = h
        .controller
        .start_session("someone-else", Some("other".into()), None)
        .await
        .unwrap_err();
    match err {
        RecorderError::SessionConflict { active_session_id } => assert_eq!(active_session_id, first),
        other => panic!("expected a session conflict, got {other}"),
    }

    let snapshot = h.controller.snapshot().await;
    assert_eq!(snapshot.session_id.as_deref(), Some(first.as_str()));
    assert_eq!(snapshot.patient_id.as_deref(), Some("patient-7"));
    assert!(snapshot.recording);
    assert!(h.camera_dir(0).exists());

    h.controller.cancel_recording().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_camera_still_closes_wall_clock_chunks() {
    let silent = CameraSpec {
        declared: Some(Dimensions::new(32, 24)),
        ..CameraSpec::color(1)
    };
    let h = harness(vec![CameraSpec::color(0), silent], |s| {
        s.chunk_duration_secs = 0.3;
    });
    h.cameras[&1].set_blackout(true);
    h.record_for(Duration::from_millis(750)).await;
    h.controller.stop_recording().await.unwrap();

    let uploaded = h.wait_for_uploads(6).await;
    assert_eq!(sequences(&uploaded, 1), vec![0, 1, 2]);
    for chunk in uploaded.iter().filter(|c| c.camera_id == 1 && c.sequence_number < 2) {
        assert_eq!(chunk.frames_written, 0);
        assert!(chunk.duration_seconds >= 0.25, "window lasted {}", chunk.duration_seconds);
        assert!(chunk.color_file_size_bytes > 0);
    }
    assert!(uploaded
        .iter()
        .filter(|c| c.camera_id == 0)
        .all(|c| c.frames_written > 0));
}

#[tokio::test(flavor = "multi_thread")]
async fn depth_cameras_only_produce_paired_chunks() {
    let no_depth_stream = CameraSpec {
        delivers_depth: false,
        ..CameraSpec::depth(2)
    };
    let h = harness(vec![CameraSpec::depth(1), no_depth_stream, CameraSpec::color(3)], |s| {
        s.chunk_duration_secs = 0.3;
    });
    h.record_for(Duration::from_millis(450)).await;
    h.controller.stop_recording().await.unwrap();

    let uploaded = h.wait_for_uploads(6).await;
    for chunk in &uploaded {
        if chunk.camera_id == 3 {
            assert!(!chunk.has_depth());
            continue;
        }

        let depth_path = chunk.depth_file_path.as_ref().expect("depth chunk without depth artifact");
        assert!(chunk.color_file_path.exists());
        assert!(depth_path.exists());
        assert_eq!(
            depth_path,
            &h.camera_dir(chunk.camera_id).join(format!("{}_depth.npy", chunk.sequence_number))
        );
        let header = npy_header(depth_path);
        assert!(
            header.contains(&format!("'shape': ({}, 24, 32)", chunk.frames_written)),
            "color and depth counts differ: {header}"
        );
    }

    // Color arrives but depth never does, so every frame is dropped.
    assert!(uploaded
        .iter()
        .filter(|c| c.camera_id == 2)
        .all(|c| c.frames_written == 0));
    assert!(uploaded
        .iter()
        .filter(|c| c.camera_id == 1)
        .any(|c| c.frames_written > 0));
}

#[tokio::test(flavor = "multi_thread")]
async fn failure_cancel_mid_recording_clears_the_session() {
    let h = harness(vec![CameraSpec::color(0), CameraSpec::color(1)], |_| {});
    h.record_for(Duration::from_millis(300)).await;

    h.controller.cancel_current_session().await.unwrap();

    let snapshot = h.controller.snapshot().await;
    assert!(!snapshot.has_session());
    assert!(!snapshot.recording);
    assert_eq!(snapshot.phase, SessionPhase::Idle);
    assert_eq!(snapshot.open_writers, 0);
    assert!(snapshot.next_sequence.is_empty());
    assert_eq!(snapshot.last_outcome, Some(SessionOutcome::CancelledByFailure));
    assert!(!h.camera_dir(0).exists());

    // The session can be started again afterwards.
    h.controller.start_session("patient-7", None, None).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_stop_and_failure_cancel_tear_down_once() {
    let h = harness(vec![CameraSpec::color(0), CameraSpec::depth(1)], |_| {});
    h.record_for(Duration::from_millis(500)).await;

    let stopper = h.controller.clone();
    let canceller = h.controller.clone();
    let (stopped, cancelled) = tokio::join!(
        tokio::spawn(async move { stopper.stop_recording().await }),
        tokio::spawn(async move { canceller.cancel_current_session().await }),
    );
    let tail = stopped.unwrap().unwrap();
    cancelled.unwrap().unwrap();

    let snapshot = h.controller.snapshot().await;
    assert_eq!(snapshot.phase, SessionPhase::Idle);
    assert!(!snapshot.has_session());
    assert_eq!(snapshot.open_writers, 0);

    if tail.is_empty() {
        assert_eq!(snapshot.last_outcome, Some(SessionOutcome::CancelledByFailure));
    } else {
        // Stop finished first; the cancel found nothing left to do.
        assert_eq!(snapshot.last_outcome, Some(SessionOutcome::Stopped));
        assert!(tail.iter().all(|c| c.color_file_path.exists()));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn uploader_can_report_camera_failure() {
    let h = harness(vec![CameraSpec::color(0)], |s| {
        s.chunk_duration_secs = 0.2;
    });
    let hook = h.controller.failure_hook();
    let seen = Arc::new(Mutex::new(0u32));
    let counter = seen.clone();
    h.controller.set_uploader(Arc::new(move |chunk: Chunk| -> Result<()> {
        *counter.lock().unwrap() += 1;
        hook.trigger(format!("server rejected camera {} chunk", chunk.camera_id));
        Ok(())
    }));

    h.record_for(Duration::from_millis(300)).await;
    for _ in 0..100 {
        if !h.controller.snapshot().await.has_session() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let snapshot = h.controller.snapshot().await;
    assert!(!snapshot.has_session());
    assert!(!snapshot.recording);
    assert_eq!(snapshot.last_outcome, Some(SessionOutcome::CancelledByFailure));
    assert!(*seen.lock().unwrap() >= 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn crashed_loop_restarts_without_gaps() {
    let h = harness(vec![CameraSpec::color(0), CameraSpec::color(1)], |s| {
        s.chunk_duration_secs = 0.3;
        s.max_loop_restarts = 2;
    });
    h.cameras[&0].panic_on_fetch(12);
    h.record_for(Duration::from_millis(1000)).await;

    let snapshot = h.controller.snapshot().await;
    assert_eq!(snapshot.phase, SessionPhase::Recording);

    let tail = h.controller.stop_recording().await.unwrap();
    assert!(!tail.is_empty());
    let uploaded = h.wait_for_uploads(2).await;
    for camera_id in [0, 1] {
        let seqs = sequences(&uploaded, camera_id);
        let expected: Vec<u64> = (0..seqs.len() as u64).collect();
        assert_eq!(seqs, expected);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_restart_budget_marks_session_failed() {
    let h = harness(vec![CameraSpec::color(0)], |s| {
        s.chunk_duration_secs = 0.3;
        s.max_loop_restarts = 0;
    });
    h.cameras[&0].panic_on_fetch(3);
    let session_id = h.record_for(Duration::from_millis(100)).await;

    let mut snapshot = h.controller.snapshot().await;
    for _ in 0..100 {
        if snapshot.phase == SessionPhase::Failed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        snapshot = h.controller.snapshot().await;
    }
    assert_eq!(snapshot.phase, SessionPhase::Failed);
    assert!(!snapshot.recording);
    assert_eq!(snapshot.session_id.as_deref(), Some(session_id.as_str()));
    assert_eq!(snapshot.open_writers, 0);
    assert!(!h.cameras[&0].is_recording());

    // Recording may be retried within the same session.
    assert!(h.controller.start_recording().await.unwrap());
    tokio::time::sleep(Duration::from_millis(400)).await;
    let tail = h.controller.stop_recording().await.unwrap();
    assert_eq!(tail.len(), 1);

    let uploaded = h.wait_for_uploads(2).await;
    assert_eq!(sequences(&uploaded, 0), vec![0, 1]);
    assert_eq!(
        h.controller.snapshot().await.last_outcome,
        Some(SessionOutcome::Stopped)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn stopping_a_failed_session_records_failure() {
    let h = harness(vec![CameraSpec::color(0)], |s| {
        s.max_loop_restarts = 0;
    });
    h.cameras[&0].panic_on_fetch(2);
    h.record_for(Duration::from_millis(100)).await;

    for _ in 0..100 {
        if h.controller.snapshot().await.phase == SessionPhase::Failed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(h.controller.stop_recording().await.unwrap().is_empty());
    let snapshot = h.controller.snapshot().await;
    assert_eq!(snapshot.phase, SessionPhase::Idle);
    assert_eq!(snapshot.last_outcome, Some(SessionOutcome::Failed));
}

#[tokio::test(flavor = "multi_thread")]
async fn uninitialized_cameras_are_ignored() {
    let h = harness(vec![CameraSpec::color(0), CameraSpec::color(1)], |_| {});
    h.cameras[&1].set_initialized(false);
    h.record_for(Duration::from_millis(200)).await;

    let tail = h.controller.stop_recording().await.unwrap();
    let cameras: BTreeSet<CameraId> = tail.iter().map(|c| c.camera_id).collect();
    assert_eq!(cameras, BTreeSet::from([0]));
    assert!(!h.camera_dir(1).exists());
}
