//! A distributed 3-D Gray-Scott reaction-diffusion engine.
//!
//! The global L³ grid is split over a 3-D grid of ranks. Each rank owns a
//! rectangular block padded with one ghost layer, exchanges the six faces of
//! that block with its neighbors every timestep, and advances U and V with a
//! forward-Euler 7-point stencil. Snapshots are written in global coordinates
//! so a run can be restarted on a different number of ranks.
//!
//! # Features
//!
//! - **Domain Decomposition**: balanced 3-D factorization of the rank count, per-rank extents and face neighbors
//! - **Halo Exchange**: whole-face send/receive between neighbors, periodic or zero-flux outer boundaries
//! - **Stencil Stepper**: data-parallel sweep over z-planes with double-buffered fields
//! - **Checkpoint/Restart**: ghost-free snapshots through a selection-based persistence interface
//! - **Message Passing**: ranks as threads of one process or as separate processes over shared memory
//!
//! # Quick Start
//!
//! ```rust
//! use grayscott_mpi::{Settings, Simulation};
//! use grayscott_mpi::transport::LocalUniverse;
//!
//! let settings = Settings {
//!     l: 8,
//!     steps: 10,
//!     plotgap: 5,
//!     seed: Some(1),
//!     ..Settings::default()
//! };
//!
//! // Two ranks, each on its own thread
//! let summaries = LocalUniverse::run(2, |world| {
//!     let mut sim = Simulation::new(settings.clone(), world).unwrap();
//!     let mut rng = sim.seed_rng();
//!     sim.init(&mut rng);
//!     sim.run(None, None).unwrap()
//! })
//! .unwrap();
//!
//! assert_eq!(summaries[0].end_step, 10);
//! assert_eq!(summaries[0].u, summaries[1].u);
//! ```
//!
//! # Architecture
//!
//! [`World`] carries rank identity, point-to-point messages and collectives
//! on top of a [`transport::Transport`]. [`transport::LocalUniverse`] runs all
//! ranks in one process; [`transport::ShmUniverse`] re-launches the current
//! executable once per rank and passes messages through a POSIX shared memory
//! segment with one slot per ordered rank pair.
//!
//! # Error Handling
//!
//! All operations return a `Result` with the variants of [`Error`].
//! Configuration errors surface before any computation; communication errors
//! abort the run; persistence errors affect only the snapshot at hand.

pub mod checkpoint;
pub mod decomposition;
pub mod error;
pub mod field;
pub mod halo;
pub mod settings;
pub mod simulation;
pub mod stepper;
pub mod store;
pub mod transport;
pub mod world;

pub use decomposition::{Decomposition, LocalDomain, ProcessTopology};
pub use error::{Error, Result};
pub use field::{Field, FieldStore};
pub use settings::{Boundary, Settings};
pub use simulation::{RunSummary, Simulation};
pub use world::World;
