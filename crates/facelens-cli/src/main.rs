use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facelens_core::live::{FrameAnnotator, DEFAULT_JPEG_QUALITY};
use facelens_core::{
    BoxStyle, Color, Config, DetectionModel, DotStyle, EncodeOptions, FaceCache, FaceEncoding,
    FaceService, ImageInput, LandmarkModel, LandmarkOptions, LocateOptions, OnnxBackend,
    OutputFormat, DEFAULT_TOLERANCE,
};
use facelens_hw::Camera;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "facelens", about = "FaceLens face detection and recognition demo")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Outline every face in an image
    Detect {
        /// Input image (defaults to the configured example image)
        image: Option<PathBuf>,
        #[arg(short, long, default_value = "faces.png")]
        output: PathBuf,
        #[arg(long, default_value_t = 1)]
        upsample: u32,
        /// Detector network: hog (light) or cnn (heavy)
        #[arg(long, default_value = "hog")]
        model: DetectionModel,
        /// Outline color as "r,g,b"
        #[arg(long, default_value = "0,255,0")]
        color: Color,
        #[arg(long, default_value_t = 3)]
        thickness: u32,
    },
    /// Draw facial landmarks
    Landmarks {
        image: Option<PathBuf>,
        #[arg(short, long, default_value = "landmarks.png")]
        output: PathBuf,
        /// Landmark model: large (68 points) or small (5 points)
        #[arg(long, default_value = "large")]
        model: LandmarkModel,
    },
    /// Print face locations as JSON
    Locate {
        image: Option<PathBuf>,
        /// Use the cascade detector; prints (x, y, width, height)
        #[arg(long)]
        fast: bool,
        #[arg(long, default_value_t = 1)]
        upsample: u32,
        #[arg(long, default_value = "hog")]
        model: DetectionModel,
    },
    /// Print face encodings as JSON
    Encode {
        image: Option<PathBuf>,
        #[arg(long, default_value_t = 1)]
        jitters: u32,
        #[arg(long, default_value = "small")]
        model: LandmarkModel,
    },
    /// Compare a candidate encoding against known encodings
    Compare {
        /// JSON file with known encodings
        known: PathBuf,
        /// JSON file with the candidate encoding (the first one is used)
        candidate: PathBuf,
        #[arg(long, default_value_t = DEFAULT_TOLERANCE)]
        tolerance: f32,
    },
    /// Annotate camera frames and write them as JPEG files
    Live {
        /// Camera device (defaults to the configured device)
        #[arg(long)]
        device: Option<String>,
        /// Number of frames; 0 runs until interrupted
        #[arg(long, default_value_t = 30)]
        frames: usize,
        #[arg(long, default_value = "frames")]
        output_dir: PathBuf,
    },
    /// Capture and annotate a single camera frame
    Snapshot {
        #[arg(long)]
        device: Option<String>,
        #[arg(short, long, default_value = "snapshot.jpg")]
        output: PathBuf,
    },
    /// List available cameras
    Devices,
    /// Show facelensd status
    Status,
}

#[derive(Serialize)]
struct Comparison {
    matches: Vec<bool>,
    distances: Vec<f32>,
}

#[zbus::proxy(
    interface = "org.facelens.Demo1",
    default_service = "org.facelens.Demo1",
    default_path = "/org/facelens/Demo1"
)]
trait Demo {
    fn status(&self) -> zbus::Result<String>;
}

fn build_service(config: &Config) -> FaceService<OnnxBackend> {
    FaceService::new(
        OnnxBackend::new(config.model_paths()),
        Arc::new(FaceCache::new(config.cache_capacity)),
    )
}

fn open_image(config: &Config, image: Option<PathBuf>) -> Result<ImageInput> {
    let path = image.unwrap_or_else(|| config.example_image.clone());
    ImageInput::open(&path).with_context(|| format!("failed to open {}", path.display()))
}

fn read_encodings(path: &Path) -> Result<Vec<FaceEncoding>> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    if let Ok(many) = serde_json::from_str::<Vec<FaceEncoding>>(&text) {
        return Ok(many);
    }
    let one: FaceEncoding = serde_json::from_str(&text)
        .with_context(|| format!("{} holds no face encodings", path.display()))?;
    Ok(vec![one])
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Detect {
            image,
            output,
            upsample,
            model,
            color,
            thickness,
        } => {
            let input = open_image(&config, image)?;
            let service = build_service(&config);
            let annotated = service.draw_face_boxes(
                Some(&input),
                LocateOptions { upsample_count: upsample, model },
                BoxStyle { color, thickness },
                OutputFormat::Image,
            )?;
            if annotated.faces == 0 {
                println!("No faces found");
            } else {
                println!("Found {} face(s)", annotated.faces);
            }
            annotated.rendered.into_image().save(&output)?;
            println!("Wrote {}", output.display());
        }
        Commands::Landmarks { image, output, model } => {
            let input = open_image(&config, image)?;
            let service = build_service(&config);
            let annotated = service.draw_face_landmarks(
                Some(&input),
                &LandmarkOptions { known_locations: None, model },
                DotStyle::LANDMARK_VIEW,
                OutputFormat::Image,
            )?;
            if annotated.faces == 0 {
                println!("No faces found");
            }
            annotated.rendered.into_image().save(&output)?;
            println!("Wrote {}", output.display());
        }
        Commands::Locate {
            image,
            fast,
            upsample,
            model,
        } => {
            let input = open_image(&config, image)?;
            let service = build_service(&config);
            if fast {
                print_json(&service.locate_faces_fast(Some(&input))?)?;
            } else {
                let options = LocateOptions { upsample_count: upsample, model };
                print_json(&service.locate_faces(Some(&input), options)?)?;
            }
        }
        Commands::Encode { image, jitters, model } => {
            let input = open_image(&config, image)?;
            let service = build_service(&config);
            let options = EncodeOptions { known_locations: None, jitter_count: jitters, model };
            print_json(&service.encode_faces(Some(&input), &options)?)?;
        }
        Commands::Compare {
            known,
            candidate,
            tolerance,
        } => {
            let known = read_encodings(&known)?;
            let Some(candidate) = read_encodings(&candidate)?.into_iter().next() else {
                bail!("candidate file holds no encodings");
            };
            let service = build_service(&config);
            print_json(&Comparison {
                matches: service.compare_encodings(&known, &candidate, tolerance)?,
                distances: service.encoding_distances(&known, &candidate)?,
            })?;
        }
        Commands::Live {
            device,
            frames,
            output_dir,
        } => {
            let device = device.unwrap_or_else(|| config.camera_device.clone());
            let camera = Camera::open(&device)?;
            std::fs::create_dir_all(&output_dir)
                .with_context(|| format!("failed to create {}", output_dir.display()))?;

            // Live frames are never repeated; skip memoization.
            let service = FaceService::new(
                OnnxBackend::new(config.model_paths()),
                Arc::new(FaceCache::disabled()),
            );
            let annotator = FrameAnnotator::new(&service);
            let count = (frames > 0).then_some(frames);

            let written = camera.frames(count, |frame| -> Result<()> {
                let sequence = frame.sequence;
                let jpeg = annotator.annotate_to_jpeg(&frame.into_pixel_array()?)?;
                let path = output_dir.join(format!("frame_{sequence:06}.jpg"));
                std::fs::write(&path, jpeg)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                tracing::debug!(path = %path.display(), "wrote annotated frame");
                Ok(())
            })?;
            println!("Wrote {written} frame(s) to {}", output_dir.display());
        }
        Commands::Snapshot { device, output } => {
            let device = device.unwrap_or_else(|| config.camera_device.clone());
            let camera = Camera::open(&device)?;
            let frame = camera.capture_frame()?;
            let service = FaceService::new(
                OnnxBackend::new(config.model_paths()),
                Arc::new(FaceCache::disabled()),
            );
            let annotated = FrameAnnotator::new(&service).annotate(&frame.into_pixel_array()?)?;
            println!("Found {} face(s)", annotated.faces.len());
            let jpeg = facelens_core::live::encode_jpeg(&annotated.frame, DEFAULT_JPEG_QUALITY)?;
            std::fs::write(&output, jpeg)
                .with_context(|| format!("failed to write {}", output.display()))?;
            println!("Wrote {}", output.display());
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No video capture devices found");
            }
            for d in devices {
                println!("{}\t{} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
        }
        Commands::Status => {
            let connection = zbus::Connection::session()
                .await
                .context("failed to connect to the session bus")?;
            let proxy = DemoProxy::new(&connection).await?;
            let status = proxy.status().await.context("facelensd not reachable")?;
            println!("{status}");
        }
    }

    Ok(())
}
