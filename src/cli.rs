use std::path::PathBuf;

use clap::Parser;
use clap::ValueEnum;

use grayscott_mpi::{Result, Settings};

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Distributed 3-D Gray-Scott reaction-diffusion simulation"
)]
pub struct Cli {
    /// JSON settings file; missing keys take their defaults
    pub settings: Option<PathBuf>,

    // Run shape
    #[arg(long, default_value = "1")]
    pub ranks: usize,
    #[arg(long, value_enum, default_value = "threads")]
    pub launcher: Launcher,

    // Overrides of the settings file
    #[arg(long)]
    pub steps: Option<u64>,
    #[arg(long)]
    pub size: Option<usize>,
    #[arg(long)]
    pub seed: Option<u64>,
    #[arg(long)]
    pub npx: Option<usize>,
    #[arg(long)]
    pub npy: Option<usize>,
    #[arg(long)]
    pub npz: Option<usize>,
}

impl Cli {
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Settings from the file (or defaults) with command-line overrides applied.
    pub fn settings(&self) -> Result<Settings> {
        let mut settings = match &self.settings {
            Some(path) => Settings::from_file(path)?,
            None => Settings::default(),
        };
        if let Some(steps) = self.steps {
            settings.steps = steps;
        }
        if let Some(size) = self.size {
            settings.l = size;
        }
        if self.seed.is_some() {
            settings.seed = self.seed;
        }
        settings.npx = self.npx.unwrap_or(settings.npx);
        settings.npy = self.npy.unwrap_or(settings.npy);
        settings.npz = self.npz.unwrap_or(settings.npz);
        Ok(settings)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Launcher {
    /// Every rank is a thread of this process
    Threads,
    /// Every rank is a separate process sharing a memory segment
    Processes,
}
