use anyhow::{bail, Context, Result};
use itertools::Itertools;
use log::{info, warn};

use crate::housekeeper::InMemoryHousekeeper;
use crate::opts::Opts;
use crate::post_processing::{any_failed, PostProcessor, RunStatus};
use crate::store::InMemoryStatusDb;

/// Post-process the flow cell named in the opts, or every flow cell in the flow cells directory.
pub fn run(opts: Opts) -> Result<(), anyhow::Error> {
    let mut store = match &opts.status_db {
        Some(path) => InMemoryStatusDb::open(path)
            .with_context(|| format!("Failed to open the status database {:?}", path))?,
        None => {
            warn!("No status database given, results will not be persisted");
            InMemoryStatusDb::new()
        }
    };
    let mut housekeeper = match &opts.housekeeper_db {
        Some(path) => InMemoryHousekeeper::open(path)
            .with_context(|| format!("Failed to open Housekeeper {:?}", path))?,
        None => {
            warn!("No Housekeeper given, results will not be persisted");
            InMemoryHousekeeper::new()
        }
    };

    let mut processor =
        PostProcessor::new(&mut store, &mut housekeeper, opts.as_post_processing_config());

    if let Some(flow_cell_dir) = opts.flow_cell_dir() {
        processor
            .post_process_flow_cell(&flow_cell_dir)
            .with_context(|| format!("Failed to post-process flow cell {:?}", flow_cell_dir))?;
        return Ok(());
    }

    let outcomes = processor.post_process_all(&opts.flow_cells_dir)?;
    let counts = outcomes
        .iter()
        .map(|o| match o.status {
            RunStatus::Completed => "completed",
            RunStatus::Skipped(_) => "skipped",
            RunStatus::Failed(_) => "failed",
        })
        .counts();
    info!(
        "Post-processed {} flow cells: {} completed, {} skipped, {} failed",
        outcomes.len(),
        counts.get("completed").unwrap_or(&0),
        counts.get("skipped").unwrap_or(&0),
        counts.get("failed").unwrap_or(&0)
    );

    if any_failed(&outcomes) {
        let failed = outcomes
            .iter()
            .filter(|o| matches!(o.status, RunStatus::Failed(_)))
            .map(|o| o.flow_cell_name.as_str())
            .join(", ");
        bail!("Post-processing failed for flow cells: {}", failed);
    }
    Ok(())
}
