//! scenes - inspect and edit the scene store

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use scene_ingest::{
    BoundingBox, DetectionFilter, DetectionUpdate, IngestConfig, SceneFilter, SceneUpdate,
    SqliteSceneStore, StoreError,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the scene database (overrides config and SCENE_INGEST_DB_PATH).
    #[arg(long)]
    db_path: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List scenes, oldest first.
    List {
        /// RFC 3339 lower bound on capture time.
        #[arg(long)]
        since: Option<String>,
        /// RFC 3339 upper bound on capture time.
        #[arg(long)]
        until: Option<String>,
        #[arg(long)]
        camera_id: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show one scene with its detections.
    Show { id: i64 },
    /// List detections.
    Detections {
        #[arg(long)]
        scene_id: Option<i64>,
        #[arg(long = "class")]
        class_label: Option<String>,
        #[arg(long)]
        min_confidence: Option<f64>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Update scene metadata.
    Update {
        id: i64,
        #[arg(long)]
        resolution: Option<String>,
        #[arg(long, allow_hyphen_values = true)]
        latitude: Option<f64>,
        #[arg(long, allow_hyphen_values = true)]
        longitude: Option<f64>,
    },
    /// Delete a scene and all of its detections.
    Delete { id: i64 },
    /// Update one detection.
    UpdateDetection {
        id: i64,
        #[arg(long = "class")]
        class_label: Option<String>,
        #[arg(long)]
        confidence: Option<f64>,
        /// x_min,y_min,x_max,y_max
        #[arg(long, value_delimiter = ',', num_args = 4, allow_hyphen_values = true)]
        bbox: Option<Vec<f64>>,
    },
    /// Delete one detection.
    DeleteDetection { id: i64 },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = IngestConfig::load()?;
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }
    let mut store = SqliteSceneStore::open(&config.db_path, config.busy_timeout)
        .with_context(|| format!("open scene store {}", config.db_path))?;

    match args.command {
        Command::List {
            since,
            until,
            camera_id,
            limit,
        } => {
            let filter = SceneFilter {
                since: since.as_deref().map(parse_time).transpose()?,
                until: until.as_deref().map(parse_time).transpose()?,
                camera_id,
                limit,
            };
            print_json(&store.list_scenes(&filter)?)?;
        }
        Command::Show { id } => {
            let scene = store
                .get_scene(id)?
                .ok_or(StoreError::MissingScene(id))?;
            let detections = store.scene_detections(id)?;
            print_json(&serde_json::json!({
                "scene": scene,
                "detections": detections,
            }))?;
        }
        Command::Detections {
            scene_id,
            class_label,
            min_confidence,
            limit,
        } => {
            let filter = DetectionFilter {
                scene_id,
                class_label,
                min_confidence,
                limit,
            };
            print_json(&store.list_detections(&filter)?)?;
        }
        Command::Update {
            id,
            resolution,
            latitude,
            longitude,
        } => {
            let update = SceneUpdate {
                resolution,
                latitude,
                longitude,
            };
            if !store.update_scene(id, &update)? {
                return Err(StoreError::MissingScene(id).into());
            }
            log::info!("updated scene {}", id);
        }
        Command::Delete { id } => {
            if !store.delete_scene(id)? {
                return Err(StoreError::MissingScene(id).into());
            }
        }
        Command::UpdateDetection {
            id,
            class_label,
            confidence,
            bbox,
        } => {
            let bbox = match bbox.as_deref() {
                Some([x_min, y_min, x_max, y_max]) => {
                    Some(BoundingBox::new(*x_min, *y_min, *x_max, *y_max)?)
                }
                Some(other) => {
                    return Err(anyhow!("--bbox takes 4 values, got {}", other.len()));
                }
                None => None,
            };
            let update = DetectionUpdate {
                label: class_label,
                confidence,
                bbox,
            };
            if update.is_empty() {
                return Err(anyhow!("nothing to update"));
            }
            if !store.update_detection(id, &update)? {
                return Err(StoreError::MissingDetection(id).into());
            }
            log::info!("updated detection {}", id);
        }
        Command::DeleteDetection { id } => {
            if !store.delete_detection(id)? {
                return Err(StoreError::MissingDetection(id).into());
            }
            log::info!("deleted detection {}", id);
        }
    }
    Ok(())
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid timestamp '{}'", raw))?
        .with_timezone(&Utc))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
