mod config;
mod simulation;

use std::{env, path::PathBuf};

use log::info;

use config::RunConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = match env::args().nth(1).map(PathBuf::from) {
        Some(path) => RunConfig::from_file(&path)?,
        None => RunConfig::default(),
    };
    config.validate()?;

    info!(
        workers = config.workers,
        steps = config.steps,
        freeze_step = config.optimizer.freeze_step;
        "starting simulation"
    );

    for report in simulation::run(config).await? {
        info!(
            rank = report.rank,
            initial_loss = report.initial_loss,
            final_loss = report.final_loss;
            "finished in the {:?} phase", report.phase
        );
    }

    Ok(())
}
