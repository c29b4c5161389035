//! Forward-Euler Gray-Scott update on the interior of one rank.
//!
//! ```text
//! U' = U + dt·(Du·∇²U − U·V² + F·(1 − U))
//! V' = V + dt·(Dv·∇²V + U·V² − (F + k)·V)
//! ```
//!
//! ∇² is the 7-point stencil divided by dx². Reads come only from the current
//! buffers, writes go only to the "next" buffers, and the two are swapped
//! once the whole interior is done. No clamping: values may leave [0, 1].

use rayon::prelude::*;

use crate::field::{Field, FieldStore};
use crate::settings::Settings;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Parameters {
    pub du: f64, // diffusion rate of u
    pub dv: f64, // diffusion rate of v
    pub f: f64,  // feed rate
    pub k: f64,  // kill rate
    pub dt: f64,
    pub dx: f64,
}

impl From<&Settings> for Parameters {
    fn from(s: &Settings) -> Self {
        Self {
            du: s.du,
            dv: s.dv,
            f: s.f,
            k: s.k,
            dt: s.dt,
            dx: s.dx,
        }
    }
}

#[inline(always)]
pub fn reaction_u(u: f64, v: f64, f: f64) -> f64 {
    -u * v * v + f * (1.0 - u)
}

#[inline(always)]
pub fn reaction_v(u: f64, v: f64, f: f64, k: f64) -> f64 {
    u * v * v - (f + k) * v
}

#[inline(always)]
fn stencil(data: &[f64], i: usize, sy: usize, sz: usize) -> f64 {
    data[i - 1] + data[i + 1] + data[i - sy] + data[i + sy] + data[i - sz] + data[i + sz]
        - 6.0 * data[i]
}

/// Discrete Laplacian of `field` at padded interior coordinates.
pub fn laplacian(field: &Field, x: usize, y: usize, z: usize, dx: f64) -> f64 {
    let i = field.index(x, y, z);
    stencil(field.data(), i, field.stride_y(), field.stride_z()) / (dx * dx)
}

#[derive(Debug, Clone)]
pub struct Stepper {
    params: Parameters,
}

impl Stepper {
    pub fn new(params: Parameters) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &Parameters {
        &self.params
    }

    /// Advances U and V by one timestep.
    ///
    /// Ghost cells of the current buffers must already hold neighbor values.
    /// Planes of constant z are computed in parallel.
    pub fn step(&self, fields: &mut FieldStore) {
        let Parameters { du, dv, f, k, dt, dx } = self.params;
        let inv_dx2 = 1.0 / (dx * dx);

        let FieldStore {
            u,
            v,
            u_next,
            v_next,
            ..
        } = &mut *fields;
        let [sx, sy, sz] = u.size();
        let stride_y = u.stride_y();
        let stride_z = u.stride_z();
        let (u_in, v_in) = (u.data(), v.data());

        u_next
            .data_mut()
            .par_chunks_mut(stride_z)
            .zip(v_next.data_mut().par_chunks_mut(stride_z))
            .enumerate()
            .filter(|(z, _)| (1..=sz).contains(z))
            .for_each(|(z, (u_plane, v_plane))| {
                for y in 1..=sy {
                    for x in 1..=sx {
                        let i = x + y * stride_y + z * stride_z;
                        let uc = u_in[i];
                        let vc = v_in[i];
                        let lap_u = stencil(u_in, i, stride_y, stride_z) * inv_dx2;
                        let lap_v = stencil(v_in, i, stride_y, stride_z) * inv_dx2;
                        let j = x + y * stride_y;
                        u_plane[j] = uc + dt * (du * lap_u + reaction_u(uc, vc, f));
                        v_plane[j] = vc + dt * (dv * lap_v + reaction_v(uc, vc, f, k));
                    }
                }
            });

        fields.swap();
    }
}
