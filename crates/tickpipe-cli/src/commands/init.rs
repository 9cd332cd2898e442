use std::fs;
use std::path::Path;

use serde_json::{json, Value};
use tickpipe_core::config::{PipelineConfig, StorageBackend, SAMPLE_CONFIG};
use tickpipe_warehouse::{Warehouse, WarehouseError};

use crate::cli::InitArgs;
use crate::commands::CommandOutput;
use crate::error::CliError;

pub async fn run(args: &InitArgs, path: &Path) -> Result<CommandOutput, CliError> {
    if path.exists() && !args.force {
        return Err(CliError::Usage(format!(
            "config '{}' already exists, pass --force to overwrite",
            path.display()
        )));
    }
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, SAMPLE_CONFIG)?;
    tracing::info!(path = %path.display(), "wrote sample config");

    let config = PipelineConfig::load(path)?;
    let warehouse = match config.storage.backend {
        StorageBackend::Memory => Value::Null,
        StorageBackend::Duckdb => {
            let warehouse_config = config.storage.warehouse_config();
            let (db_path, versions) = tokio::task::spawn_blocking(move || {
                let warehouse = Warehouse::open(warehouse_config)?;
                let versions = warehouse.schema_versions()?;
                Ok::<_, WarehouseError>((warehouse.db_path().display().to_string(), versions))
            })
            .await??;
            json!({ "db_path": db_path, "schema_versions": versions })
        }
    };

    Ok(CommandOutput::data(json!({
        "config": path.display().to_string(),
        "warehouse": warehouse,
    })))
}
