//! Run parameters.
//!
//! Settings are read once at startup, validated, and then shared read-only
//! by every component. Key names follow the JSON settings files the
//! Gray-Scott tutorial runs have always used (`L`, `Du`, `F`, `plotgap`, ...).

use std::path::Path;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// What lies beyond the outer faces of the global domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Boundary {
    /// Faces wrap around; every rank has six neighbors.
    #[default]
    Periodic,
    /// Outer faces have no neighbor and carry no normal flux.
    ZeroFlux,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Edge length of the cubic global grid (L³ cells).
    #[serde(rename = "L")]
    pub l: usize,
    #[serde(rename = "Du")]
    pub du: f64,
    #[serde(rename = "Dv")]
    pub dv: f64,
    #[serde(rename = "F")]
    pub f: f64,
    pub k: f64,
    pub dt: f64,
    /// Grid spacing; the Laplacian is divided by dx².
    pub dx: f64,
    pub steps: u64,
    /// Output interval in steps (0 disables output).
    pub plotgap: u64,
    /// Amplitude of the initial perturbation.
    pub noise: f64,
    pub output: String,
    pub checkpoint: bool,
    pub checkpoint_freq: u64,
    pub checkpoint_output: String,
    pub restart: bool,
    pub restart_input: String,
    // Requested process grid; 0 lets the decomposition choose.
    pub npx: usize,
    pub npy: usize,
    pub npz: usize,
    pub seed: Option<u64>,
    pub boundary: Boundary,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            l: 128,
            du: 0.2,
            dv: 0.1,
            f: 0.02,
            k: 0.048,
            dt: 1.0,
            dx: 1.0,
            steps: 20000,
            plotgap: 200,
            noise: 0.1,
            output: "gs-output".to_string(),
            checkpoint: false,
            checkpoint_freq: 2000,
            checkpoint_output: "gs-checkpoint".to_string(),
            restart: false,
            restart_input: "gs-checkpoint".to_string(),
            npx: 0,
            npy: 0,
            npz: 0,
            seed: None,
            boundary: Boundary::Periodic,
        }
    }
}

impl Settings {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot read settings {}: {e}", path.display()))
        })?;
        Self::from_json(&text)
    }

    /// Requested process-grid shape, zeros meaning "choose for me".
    pub fn process_grid(&self) -> [usize; 3] {
        [self.npx, self.npy, self.npz]
    }

    pub fn validate(&self) -> Result<()> {
        if self.l == 0 {
            return Err(Error::config("L must be > 0"));
        }
        if self.steps == 0 {
            return Err(Error::config("steps must be > 0"));
        }
        if !(self.du > 0.0) || !(self.dv > 0.0) {
            return Err(Error::config("Diffusion rates must be > 0"));
        }
        if !(self.f >= 0.0) {
            return Err(Error::config("Feed rate must be >= 0"));
        }
        if !(self.k >= 0.0) {
            return Err(Error::config("Kill rate must be >= 0"));
        }
        if !(self.dt > 0.0) {
            return Err(Error::config("Time step must be > 0"));
        }
        if !(self.dx > 0.0) {
            return Err(Error::config("Grid spacing must be > 0"));
        }
        if !(self.noise >= 0.0) {
            return Err(Error::config("Noise amplitude must be >= 0"));
        }
        if self.checkpoint && self.checkpoint_freq == 0 {
            return Err(Error::config(
                "checkpoint_freq must be > 0 when checkpointing is enabled",
            ));
        }
        Ok(())
    }

    /// Largest dt for which forward Euler on the 7-point stencil is stable.
    pub fn max_stable_dt(&self) -> f64 {
        self.dx * self.dx / (6.0 * self.du.max(self.dv))
    }

    /// Logs legal but suspicious parameter choices.
    pub fn warn(&self) {
        let max_dt = self.max_stable_dt();
        if self.dt > max_dt {
            warn!(
                "Time step {} exceeds the explicit stability bound {:.4}; fields may grow without bound",
                self.dt, max_dt
            );
        }
        if self.du <= self.dv {
            warn!("Du should typically be greater than Dv for pattern formation");
        }
        if self.f > 0.1 || self.k > 0.1 {
            warn!("F and k values above 0.1 might not produce typical Turing patterns");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let settings = Settings::from_json(r#"{ "L": 64, "Du": 0.16, "boundary": "zero_flux" }"#)
            .unwrap();
        assert_eq!(settings.l, 64);
        assert_eq!(settings.du, 0.16);
        assert_eq!(settings.dv, Settings::default().dv);
        assert_eq!(settings.boundary, Boundary::ZeroFlux);
        assert_eq!(settings.seed, None);
        assert_eq!(settings.process_grid(), [0, 0, 0]);
    }

    #[test]
    fn original_key_names_are_accepted() {
        let settings = Settings::from_json(
            r#"{
                "L": 32, "Du": 0.2, "Dv": 0.1, "F": 0.01, "k": 0.05, "dt": 2.0,
                "plotgap": 10, "steps": 100, "noise": 0.01, "output": "gs.bp",
                "checkpoint": true, "checkpoint_freq": 50,
                "checkpoint_output": "ckpt.bp", "restart": false,
                "restart_input": "ckpt.bp"
            }"#,
        )
        .unwrap();
        assert_eq!(settings.f, 0.01);
        assert_eq!(settings.plotgap, 10);
        assert!(settings.checkpoint);
        assert_eq!(settings.checkpoint_output, "ckpt.bp");
        settings.validate().unwrap();
    }

    #[test]
    fn validate_rejects_non_physical_parameters() {
        let bad = [
            Settings {
                l: 0,
                ..Settings::default()
            },
            Settings {
                du: 0.0,
                ..Settings::default()
            },
            Settings {
                dv: -1.0,
                ..Settings::default()
            },
            Settings {
                f: -0.1,
                ..Settings::default()
            },
            Settings {
                k: f64::NAN,
                ..Settings::default()
            },
            Settings {
                dt: 0.0,
                ..Settings::default()
            },
            Settings {
                dx: 0.0,
                ..Settings::default()
            },
            Settings {
                noise: -0.5,
                ..Settings::default()
            },
            Settings {
                checkpoint: true,
                checkpoint_freq: 0,
                ..Settings::default()
            },
        ];
        for settings in bad {
            assert!(
                matches!(settings.validate(), Err(Error::InvalidConfiguration(_))),
                "{settings:?} should be rejected"
            );
        }
    }

    #[test]
    fn zero_reaction_is_valid() {
        let settings = Settings {
            f: 0.0,
            k: 0.0,
            ..Settings::default()
        };
        settings.validate().unwrap();
    }

    #[test]
    fn stability_bound_uses_fastest_diffusion() {
        let settings = Settings {
            du: 0.25,
            dv: 0.1,
            dx: 1.0,
            ..Settings::default()
        };
        assert!((settings.max_stable_dt() - 1.0 / 1.5).abs() < 1e-12);
    }
}
