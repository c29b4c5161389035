mod cli;

use cli::{Cli, Launcher};
use log::{error, info};

use grayscott_mpi::store::{FileStore, Persistence};
use grayscott_mpi::transport::{LocalUniverse, ShmUniverse};
use grayscott_mpi::{Result, RunSummary, Settings, Simulation, World};

/// Everything one rank does: set up, initialize or restart, run, shut down.
fn run_rank(settings: &Settings, world: World) -> Result<RunSummary> {
    let rank = world.rank();
    let size = world.size();
    let mut sim = Simulation::new(settings.clone(), world)?;

    if settings.restart {
        let mut input = FileStore::open(&settings.restart_input)?;
        sim.restart(&mut input)?;
    } else {
        let mut rng = sim.seed_rng();
        sim.init(&mut rng);
    }

    // Tags this run's files so leftovers of an earlier run are never read back.
    let sequence = sim.world().broadcast(&rand::random::<u64>(), 0)?;
    let mut output = match settings.plotgap {
        0 => None,
        _ => Some(FileStore::create(&settings.output, rank, size, sequence)?),
    };
    let mut checkpoints = match settings.checkpoint {
        true => Some(FileStore::create(&settings.checkpoint_output, rank, size, sequence)?),
        false => None,
    };

    let summary = sim.run(
        output.as_mut().map(|s| s as &mut dyn Persistence),
        checkpoints.as_mut().map(|s| s as &mut dyn Persistence),
    )?;
    sim.finalize()?;
    Ok(summary)
}

fn launch(cli: &Cli, settings: &Settings) -> Result<Option<RunSummary>> {
    match cli.launcher {
        Launcher::Threads => {
            let results = LocalUniverse::run(cli.ranks, |world| run_rank(settings, world))?;
            let summaries = results.into_iter().collect::<Result<Vec<_>>>()?;
            Ok(summaries.into_iter().next())
        }
        Launcher::Processes => {
            let world = ShmUniverse::init(cli.ranks)?;
            let rank = world.rank();
            let summary = run_rank(settings, world)?;
            Ok((rank == 0).then_some(summary))
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::from_args();
    let result = cli.settings().and_then(|settings| launch(&cli, &settings));
    match result {
        Ok(Some(summary)) => info!(
            "Finished steps {}..{}: {} outputs, {} checkpoints, U sum {:.6e}, V sum {:.6e}",
            summary.start_step,
            summary.end_step,
            summary.outputs,
            summary.checkpoints,
            summary.u.sum,
            summary.v.sum
        ),
        Ok(None) => {}
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    }
}
