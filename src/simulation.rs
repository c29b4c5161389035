//! The per-rank driver: decomposition, initial state, the time loop, and
//! periodic output and checkpoints.

use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::checkpoint::{restore_latest, Checkpointer};
use crate::decomposition::{local_extents, Decomposition, ProcessTopology};
use crate::error::Result;
use crate::field::{Field, FieldStore};
use crate::halo::HaloExchange;
use crate::settings::Settings;
use crate::stepper::{Parameters, Stepper};
use crate::store::Persistence;
use crate::world::World;

/// Global sum, minimum and maximum of one field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Diagnostics {
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub start_step: u64,
    pub end_step: u64,
    pub outputs: usize,
    pub checkpoints: usize,
    pub u: Diagnostics,
    pub v: Diagnostics,
}

/// One rank's share of a Gray-Scott run.
pub struct Simulation {
    settings: Settings,
    world: World,
    topology: ProcessTopology,
    fields: FieldStore,
    halo: HaloExchange,
    stepper: Stepper,
    step: u64,
}

impl Simulation {
    /// Validates `settings` and lays out this rank's subdomain.
    ///
    /// Nothing is computed yet; fields start zeroed until [`init`](Self::init)
    /// or [`restart`](Self::restart).
    pub fn new(settings: Settings, world: World) -> Result<Self> {
        settings.validate()?;
        let decomposition = Decomposition::new(
            settings.l,
            world.size(),
            settings.process_grid(),
            settings.boundary,
        )?;
        let topology = decomposition.topology(world.rank())?;
        let domain = local_extents(settings.l, topology.coords, topology.dims)?;
        let halo = HaloExchange::new(&world, &topology)?;

        if world.rank() == 0 {
            settings.warn();
            let [npx, npy, npz] = topology.dims;
            info!(
                "Gray-Scott L={} on {} ranks ({npx}x{npy}x{npz}), {:?} boundaries",
                settings.l,
                world.size(),
                settings.boundary
            );
        }
        debug!(
            "Rank {} at {:?} owns {:?} from {:?}",
            world.rank(),
            topology.coords,
            domain.size,
            domain.offset
        );

        Ok(Self {
            stepper: Stepper::new(Parameters::from(&settings)),
            fields: FieldStore::new(domain),
            settings,
            world,
            topology,
            halo,
            step: 0,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn topology(&self) -> &ProcessTopology {
        &self.topology
    }

    pub fn fields(&self) -> &FieldStore {
        &self.fields
    }

    pub fn fields_mut(&mut self) -> &mut FieldStore {
        &mut self.fields
    }

    /// Steps completed so far, including those before a restart.
    pub fn step(&self) -> u64 {
        self.step
    }

    /// This rank's private generator: seeded from `seed + rank` when a seed
    /// is configured, from OS entropy otherwise.
    pub fn seed_rng(&self) -> StdRng {
        match self.settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(self.world.rank() as u64)),
            None => StdRng::from_entropy(),
        }
    }

    /// Writes the initial condition and resets the step counter.
    pub fn init<R: Rng>(&mut self, rng: &mut R) {
        self.fields.seed(&self.settings, rng);
        self.step = 0;
    }

    /// Resumes from the last snapshot in `store`.
    pub fn restart(&mut self, store: &mut dyn Persistence) -> Result<()> {
        let restored = restore_latest(store, self.fields.domain())?;
        self.fields.replace(restored.u, restored.v);
        self.step = restored.step;
        // Nobody starts writing until every rank has read.
        self.world.barrier()?;
        if self.world.rank() == 0 {
            info!("Restarting from step {}", self.step);
        }
        Ok(())
    }

    /// One timestep: fill ghosts of U and V, then sweep.
    pub fn iterate(&mut self) -> Result<()> {
        self.halo.exchange_all(&self.world, &mut self.fields)?;
        self.stepper.step(&mut self.fields);
        self.step += 1;
        Ok(())
    }

    /// Global diagnostics of U and V. Every rank must call this together.
    pub fn diagnostics(&self) -> Result<(Diagnostics, Diagnostics)> {
        let u = self.reduce(&self.fields.u)?;
        let v = self.reduce(&self.fields.v)?;
        Ok((u, v))
    }

    fn reduce(&self, field: &Field) -> Result<Diagnostics> {
        let (min, max) = field.interior_min_max();
        Ok(Diagnostics {
            sum: self.world.all_reduce_sum(field.interior_sum())?,
            min: self.world.all_reduce_min(min)?,
            max: self.world.all_reduce_max(max)?,
        })
    }

    /// Iterates from the current step to `settings.steps`.
    ///
    /// Every `plotgap` steps U and V go to `output` and global diagnostics
    /// are logged; every `checkpoint_freq` steps a snapshot goes to
    /// `checkpoints` when checkpointing is enabled.
    pub fn run(
        &mut self,
        mut output: Option<&mut dyn Persistence>,
        mut checkpoints: Option<&mut dyn Persistence>,
    ) -> Result<RunSummary> {
        let domain = *self.fields.domain();
        let output_writer = match output.as_deref_mut() {
            Some(store) => Some(Checkpointer::new(store, &domain)?),
            None => None,
        };
        let checkpoint_writer = match checkpoints.as_deref_mut() {
            Some(store) if self.settings.checkpoint => Some(Checkpointer::new(store, &domain)?),
            _ => None,
        };

        let start_step = self.step;
        let mut outputs = 0;
        let mut written = 0;
        while self.step < self.settings.steps {
            self.iterate()?;

            if self.settings.plotgap > 0 && self.step % self.settings.plotgap == 0 {
                let (u, v) = self.diagnostics()?;
                if self.world.rank() == 0 {
                    info!(
                        "Step {:6}: U sum {:.6e} [{:.4}, {:.4}], V sum {:.6e} [{:.4}, {:.4}]",
                        self.step, u.sum, u.min, u.max, v.sum, v.min, v.max
                    );
                }
                if let (Some(writer), Some(store)) = (&output_writer, output.as_deref_mut()) {
                    writer.checkpoint(store, &self.fields.u, &self.fields.v, self.step)?;
                    outputs += 1;
                }
            }

            if self.step % self.settings.checkpoint_freq.max(1) == 0 {
                if let (Some(writer), Some(store)) =
                    (&checkpoint_writer, checkpoints.as_deref_mut())
                {
                    writer.checkpoint(store, &self.fields.u, &self.fields.v, self.step)?;
                    written += 1;
                    if self.world.rank() == 0 {
                        info!("Checkpoint at step {}", self.step);
                    }
                }
            }
        }

        if let Some(store) = output {
            store.close()?;
        }
        if let Some(store) = checkpoints {
            store.close()?;
        }

        let (u, v) = self.diagnostics()?;
        Ok(RunSummary {
            start_step,
            end_step: self.step,
            outputs,
            checkpoints: written,
            u,
            v,
        })
    }

    /// Shuts down communication; call once per rank after the last run.
    pub fn finalize(self) -> Result<()> {
        self.world.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::store::MemoryStore;
    use crate::transport::LocalUniverse;

    fn small() -> Settings {
        Settings {
            l: 6,
            steps: 4,
            plotgap: 2,
            noise: 0.0,
            seed: Some(5),
            ..Settings::default()
        }
    }

    #[test]
    fn invalid_settings_fail_before_anything_runs() {
        let got = LocalUniverse::run(1, |world| {
            let settings = Settings {
                l: 0,
                ..small()
            };
            Simulation::new(settings, world).map(|_| ())
        })
        .unwrap();
        assert!(matches!(got[0], Err(Error::InvalidConfiguration(_))));
    }

    #[test]
    fn requested_grid_must_match_rank_count() {
        let got = LocalUniverse::run(2, |world| {
            let settings = Settings {
                npx: 3,
                npy: 1,
                npz: 1,
                ..small()
            };
            Simulation::new(settings, world).map(|_| ())
        })
        .unwrap();
        assert!(got.iter().all(|r| r.is_err()));
    }

    #[test]
    fn run_counts_outputs_and_checkpoints() {
        let output = MemoryStore::new(2);
        let checkpoints = MemoryStore::new(2);
        let got = LocalUniverse::run(2, |world| {
            let settings = Settings {
                checkpoint: true,
                checkpoint_freq: 3,
                ..small()
            };
            let rank = world.rank();
            let mut sim = Simulation::new(settings, world).unwrap();
            let mut rng = sim.seed_rng();
            sim.init(&mut rng);
            let mut out = output.writer(rank);
            let mut ckpt = checkpoints.writer(rank);
            sim.run(Some(&mut out), Some(&mut ckpt)).unwrap()
        })
        .unwrap();

        for summary in &got {
            assert_eq!((summary.start_step, summary.end_step), (0, 4));
            assert_eq!(summary.outputs, 2);
            assert_eq!(summary.checkpoints, 1);
            assert_eq!(summary.u.sum, 216.0);
            assert_eq!((summary.v.min, summary.v.max), (0.0, 0.0));
        }
        assert_eq!(output.steps(), 2);
        assert_eq!(checkpoints.steps(), 1);
    }

    #[test]
    fn restart_resumes_at_the_saved_step() {
        let store = MemoryStore::new(1);
        LocalUniverse::run(1, |world| {
            let settings = Settings {
                noise: 0.3,
                ..small()
            };
            let mut sim = Simulation::new(settings, world).unwrap();
            let mut rng = sim.seed_rng();
            sim.init(&mut rng);
            sim.iterate().unwrap();
            let domain = *sim.fields().domain();
            let fields = sim.fields();
            let mut w = store.writer(0);
            crate::checkpoint::checkpoint(&mut w, &domain, &fields.u, &fields.v, sim.step())
                .unwrap();
        })
        .unwrap();

        let got = LocalUniverse::run(1, |world| {
            let mut sim = Simulation::new(small(), world).unwrap();
            sim.restart(&mut store.reader()).unwrap();
            let resumed_at = sim.step();
            let summary = sim.run(None, None).unwrap();
            (resumed_at, summary.start_step, summary.end_step)
        })
        .unwrap();
        assert_eq!(got[0], (1, 1, 4));
    }
}
