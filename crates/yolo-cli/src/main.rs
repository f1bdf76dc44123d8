use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use yolo_rs::{Dataset, Decoder, DetectorConfig};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Preset {
    /// YOLOv2, single 13x13 head, Pascal VOC
    V2,
    /// YOLOv3, 52/26/13 heads, Pascal VOC
    V3,
}

#[derive(Parser)]
#[command(name = "yolo-eval")]
#[command(about = "Decode raw YOLO head outputs and compute per-class AP and mAP against ground truth")]
struct Cli {
    /// Path to ground truth JSON file
    #[arg(long)]
    gt: PathBuf,

    /// Path to raw detector output JSON file
    #[arg(long)]
    outputs: PathBuf,

    /// Detector configuration JSON file (overrides --preset)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Built-in detector configuration
    #[arg(long, value_enum, default_value = "v3")]
    preset: Preset,

    /// NMS IoU threshold
    #[arg(long)]
    nms_iou: Option<f32>,

    /// Objectness threshold
    #[arg(long)]
    objectness: Option<f32>,

    /// Best class probability threshold
    #[arg(long)]
    class_prob: Option<f32>,

    /// Score (objectness x class probability) threshold
    #[arg(long)]
    score: Option<f32>,

    /// IoU needed for a detection to match ground truth
    #[arg(long)]
    match_iou: Option<f32>,

    /// Match against annotation boxes directly instead of decoding them
    /// through targets first
    #[arg(long)]
    raw_gt: bool,

    /// Print the decoded detections of every image
    #[arg(long)]
    dump: bool,

    /// More logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => {
            info!("loading detector config from {:?}", path);
            DetectorConfig::from_json_file(path)?
        }
        None => match cli.preset {
            Preset::V2 => DetectorConfig::yolo_v2_voc(),
            Preset::V3 => DetectorConfig::yolo_v3_voc(),
        },
    };

    let t = &mut config.thresholds;
    if let Some(v) = cli.nms_iou {
        t.nms_iou = v;
    }
    if let Some(v) = cli.objectness {
        t.objectness = v;
    }
    if let Some(v) = cli.class_prob {
        t.class_prob = v;
    }
    if let Some(v) = cli.score {
        t.score = v;
    }
    if let Some(v) = cli.match_iou {
        t.match_iou = v;
    }

    let decoder = Decoder::new(config)?;

    info!("loading ground truth from {:?}", cli.gt);
    info!("loading detector outputs from {:?}", cli.outputs);
    let dataset = Dataset::new(&cli.gt, &cli.outputs)?;

    if cli.dump {
        for (img_id, dets) in dataset.detections(&decoder)? {
            println!("image {}: {} detections", img_id, dets.len());
            for d in &dets {
                println!(
                    "  {:<12} {:.3} [{:.1}, {:.1}, {:.1}, {:.1}]",
                    d.class_name, d.score, d.bbox.x1, d.bbox.y1, d.bbox.x2, d.bbox.y2
                );
            }
        }
    }

    info!("evaluating");
    let summary = dataset.evaluate(&decoder, !cli.raw_gt)?;
    summary.summarize();

    // Print machine-readable stats line: per-class AP (-1 without ground truth), then mAP
    let mut stats: Vec<String> = summary
        .classes
        .iter()
        .map(|c| format!("{:.15}", c.ap.unwrap_or(-1.0)))
        .collect();
    stats.push(format!("{:.15}", summary.map));
    println!("stats: [{}]", stats.join(", "));

    Ok(())
}
