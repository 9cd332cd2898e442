use serde_json::json;
use tickpipe_core::ledger::GapInterval;
use tickpipe_core::PipelineStorage;

use crate::cli::GapsArgs;
use crate::commands::CommandOutput;
use crate::error::CliError;

pub async fn run(args: &GapsArgs, storage: &PipelineStorage) -> Result<CommandOutput, CliError> {
    let snapshots = storage.ledger.load_all().await?;
    let mut gaps: Vec<GapInterval> = snapshots
        .into_iter()
        .flat_map(|snapshot| snapshot.gaps)
        .filter(GapInterval::is_open)
        .filter(|gap| {
            args.symbol
                .as_deref()
                .map_or(true, |symbol| gap.instrument.symbol.as_str().eq_ignore_ascii_case(symbol))
        })
        .collect();
    gaps.sort_by(|left, right| {
        left.instrument
            .cmp(&right.instrument)
            .then_with(|| left.start.cmp(&right.start))
    });

    Ok(CommandOutput::data(json!({ "count": gaps.len(), "gaps": gaps })))
}
