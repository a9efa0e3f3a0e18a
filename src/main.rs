use anyhow::{bail, Context, Result};
use chunkcam_lib::{
    init_logging, CameraRegistry, Chunk, RecorderSettings, SessionController, SyntheticCamera,
};
use log::info;
use std::{collections::BTreeSet, path::PathBuf, sync::Arc, time::Duration};

struct Args {
    settings: Option<PathBuf>,
    cameras: u32,
    depth_cameras: u32,
    seconds: f64,
    patient_id: String,
    test_type: Option<String>,
}

impl Args {
    fn parse() -> Result<Self> {
        let mut args = Args {
            settings: None,
            cameras: 2,
            depth_cameras: 0,
            seconds: 12.0,
            patient_id: "demo-patient".to_string(),
            test_type: None,
        };

        let mut iter = std::env::args().skip(1);
        while let Some(flag) = iter.next() {
            let mut value = || iter.next().with_context(|| format!("{flag} needs a value"));
            match flag.as_str() {
                "--settings" => args.settings = Some(PathBuf::from(value()?)),
                "--cameras" => args.cameras = value()?.parse().context("--cameras")?,
                "--depth" => args.depth_cameras = value()?.parse().context("--depth")?,
                "--seconds" => args.seconds = value()?.parse().context("--seconds")?,
                "--patient" => args.patient_id = value()?,
                "--test-type" => args.test_type = Some(value()?),
                other => bail!(
                    "unknown argument {other}\n\
                     usage: chunkcam [--settings FILE] [--cameras N] [--depth N] \
                     [--seconds S] [--patient ID] [--test-type NAME]"
                ),
            }
        }

        if args.cameras == 0 {
            bail!("--cameras must be at least 1");
        }
        if !(args.seconds.is_finite() && args.seconds > 0.0) {
            bail!("--seconds must be positive");
        }
        Ok(args)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = Args::parse()?;

    let mut settings = RecorderSettings::load(args.settings.as_deref())?;
    // The last `--depth` cameras deliver depth.
    let first_depth = args.cameras.saturating_sub(args.depth_cameras);
    settings.depth_camera_ids.extend(first_depth..args.cameras);

    let registry = CameraRegistry::new(settings.depth_camera_ids.clone());
    let depth_ids: BTreeSet<_> = settings.depth_camera_ids.clone();
    for camera_id in 0..args.cameras {
        let mut camera =
            SyntheticCamera::new(camera_id, 640, 480, 30).with_latency(Duration::from_millis(5));
        if depth_ids.contains(&camera_id) {
            camera = camera.with_depth();
        }
        registry.initialize_camera(camera_id, Arc::new(camera), None);
    }

    info!(
        "chunkcam writing {}s chunks from {} cameras under {}",
        settings.chunk_duration_secs,
        args.cameras,
        settings.temp_root.display()
    );

    let controller = SessionController::new(settings, registry)?;
    controller.set_uploader(Arc::new(|chunk: Chunk| -> Result<()> {
        info!(
            "chunk ready: {}",
            serde_json::to_string(&chunk).context("failed to serialize chunk")?
        );
        Ok(())
    }));

    let session_id = controller
        .start_session(args.patient_id.clone(), None, args.test_type.clone())
        .await?;
    controller.start_recording().await?;

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs_f64(args.seconds)) => {
            info!("recording window elapsed, stopping session {session_id}");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, stopping session {session_id}");
        }
    }

    let final_chunks = controller.stop_recording().await?;
    let snapshot = controller.snapshot().await;
    info!(
        "session {session_id} finished with {} drained chunks, {} dispatched in total",
        final_chunks.len(),
        snapshot.chunks_dispatched
    );
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    // Let in-flight upload tasks log before the runtime shuts down.
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}
