//! Filter construction and dispatch.
//!
//! [`PtexFilter`] is the public entry point: pick a kernel family, then
//! call [`eval`](PtexFilter::eval) with a face id, a centre `(u, v)` and a
//! footprint `(uw, vw)` in normalised face coordinates. Quad meshes run
//! the separable engine; triangle meshes always run the elliptical
//! Gaussian.

use crate::kernel::{KMAX, SeparableKernel};
use crate::separable::{self, KernelBuilder};
use crate::triangle::{self, TriangleOptions};
use ptex_core::Res;
use ptex_io::PtexReader;

/// A reusable, thread-safe filter.
pub struct PtexFilter {
    kind: FilterKind,
}

enum FilterKind {
    Mitchell(MitchellBuilder),
    Box(BoxBuilder),
    Triangle(TriangleOptions),
}

impl PtexFilter {
    /// Mitchell-Netravali filter; `sharpness` 0 is smoothest, 1 sharpest.
    pub fn mitchell(sharpness: f32) -> PtexFilter {
        PtexFilter { kind: FilterKind::Mitchell(MitchellBuilder::new(sharpness)) }
    }

    /// Exact-footprint box filter.
    pub fn box_filter() -> PtexFilter {
        PtexFilter { kind: FilterKind::Box(BoxBuilder) }
    }

    /// Elliptical Gaussian filter for triangle meshes. On quad meshes this
    /// behaves as a box filter.
    pub fn triangle(options: TriangleOptions) -> PtexFilter {
        PtexFilter { kind: FilterKind::Triangle(options) }
    }

    /// Accumulates into `result` a filtered sample of channels
    /// `[first_chan, first_chan + nchannels)` around `(u, v)` with
    /// footprint `(uw, vw)`, all in normalised face coordinates.
    #[allow(clippy::too_many_arguments)]
    pub fn eval(
        &self,
        result: &mut [f32],
        first_chan: usize,
        nchannels: usize,
        tx: &PtexReader,
        faceid: i32,
        u: f32,
        v: f32,
        uw: f32,
        vw: f32,
    ) {
        if tx.mesh_type() == ptex_core::MeshType::Triangle {
            let opts = match &self.kind {
                FilterKind::Triangle(o) => *o,
                _ => TriangleOptions::default(),
            };
            triangle::eval(opts, result, first_chan, nchannels, tx, faceid, u, v, uw, vw);
            return;
        }
        match &self.kind {
            FilterKind::Mitchell(b) => {
                separable::eval(b, result, first_chan, nchannels, tx, faceid, u, v, uw, vw)
            }
            FilterKind::Box(_) | FilterKind::Triangle(_) => {
                separable::eval(&BoxBuilder, result, first_chan, nchannels, tx, faceid, u, v, uw, vw)
            }
        }
    }
}

/// Mitchell-Netravali cubic, evaluated at texel centres.
struct MitchellBuilder {
    /// Piecewise cubic coefficients for the current sharpness.
    c: [f64; 7],
}

impl MitchellBuilder {
    fn new(sharpness: f32) -> MitchellBuilder {
        // B = 1 - sharpness, C = (1 - B) / 2:
        // |x| < 1: 1/6 ((12-9B-6C) x^3 + (-18+12B+6C) x^2 + (6-2B))
        // |x| < 2: 1/6 ((-B-6C) x^3 + (6B+30C) x^2 + (-12B-48C) x + (8B+24C))
        let b = 1.0 - sharpness as f64;
        MitchellBuilder {
            c: [
                1.5 - b,
                1.5 * b - 2.5,
                1.0 - (1.0 / 3.0) * b,
                (1.0 / 3.0) * b - 0.5,
                2.5 - 1.5 * b,
                2.0 * b - 4.0,
                2.0 - (2.0 / 3.0) * b,
            ],
        }
    }

    fn k(&self, x: f64) -> f64 {
        let x = x.abs();
        let c = &self.c;
        if x < 1.0 {
            (c[0] * x + c[1]) * x * x + c[2]
        } else if x < 2.0 {
            ((c[3] * x + c[4]) * x + c[5]) * x + c[6]
        } else {
            0.0
        }
    }

    fn compute_weights(&self, kernel: &mut [f64], x1: f64, step: f64, size: usize) {
        for (i, w) in kernel.iter_mut().take(size).enumerate() {
            *w = self.k(x1 + i as f64 * step);
        }
    }
}

impl KernelBuilder for MitchellBuilder {
    fn build(&self, u: f32, v: f32, uw: f32, vw: f32, face_res: Res, is_subface: bool) -> SeparableKernel {
        // no narrower than a texel, no wider than the subface-safe limit
        let minw = if is_subface { 0.25f32 } else { 0.125 };
        let uw = uw.max(1.0 / face_res.u() as f32).min(minw) as f64;
        let vw = vw.max(1.0 / face_res.v() as f32).min(minw) as f64;

        let ureslog2 = (1.0 / uw).log2().ceil() as i8;
        let vreslog2 = (1.0 / vw).log2().ceil() as i8;
        let mut k = SeparableKernel { res: Res::new(ureslog2, vreslog2), ..Default::default() };

        // to pixel coordinates
        let upix = u as f64 * k.res.u() as f64 - 0.5;
        let vpix = v as f64 * k.res.v() as f64 - 0.5;
        let uwpix = uw * k.res.u() as f64;
        let vwpix = vw * k.res.v() as f64;

        // integer extent: mitchell support is 4 units for a 1 unit period
        let u1 = (upix - 2.0 * uwpix).ceil() as i32;
        let u2 = (upix + 2.0 * uwpix).ceil() as i32;
        let v1 = (vpix - 2.0 * vwpix).ceil() as i32;
        let v2 = (vpix + 2.0 * vwpix).ceil() as i32;
        k.u = u1;
        k.v = v1;
        k.uw = (u2 - u1).min(KMAX as i32);
        k.vw = (v2 - v1).min(KMAX as i32);

        self.compute_weights(&mut k.ku, (u1 as f64 - upix) / uwpix, 1.0 / uwpix, k.uw as usize);
        self.compute_weights(&mut k.kv, (v1 as f64 - vpix) / vwpix, 1.0 / vwpix, k.vw as usize);
        k
    }
}

/// Box filter: exact fractional coverage, one to three weights per axis.
struct BoxBuilder;

fn box_weights(kernel: &mut [f64], size: usize, f1: f64, f2: f64) {
    if size == 1 {
        kernel[0] = f1 + f2 - 1.0;
    } else {
        kernel[0] = f1;
        for w in kernel.iter_mut().take(size - 1).skip(1) {
            *w = 1.0;
        }
        kernel[size - 1] = f2;
    }
}

impl KernelBuilder for BoxBuilder {
    fn build(&self, u: f32, v: f32, uw: f32, vw: f32, face_res: Res, _is_subface: bool) -> SeparableKernel {
        // clamp width to [one texel, full face]
        let uw = (uw.min(1.0).max(1.0 / face_res.u() as f32)) as f64;
        let vw = (vw.min(1.0).max(1.0 / face_res.v() as f32)) as f64;

        let ureslog2 = (1.0 / uw).log2().ceil() as i8;
        let vreslog2 = (1.0 / vw).log2().ceil() as i8;
        let mut k = SeparableKernel { res: Res::new(ureslog2, vreslog2), ..Default::default() };

        let up = u as f64 * k.res.u() as f64;
        let vp = v as f64 * k.res.v() as f64;
        let uwp = uw * k.res.u() as f64;
        let vwp = vw * k.res.v() as f64;

        // box support is 1 unit for a 1 unit period
        let u1 = up - 0.5 * uwp;
        let u2 = up + 0.5 * uwp;
        let v1 = vp - 0.5 * vwp;
        let v2 = vp + 0.5 * vwp;
        let u1f = u1.floor();
        let u2c = u2.ceil();
        let v1f = v1.floor();
        let v2c = v2.ceil();
        k.u = u1f as i32;
        k.v = v1f as i32;
        k.uw = (u2c - u1f) as i32;
        k.vw = (v2c - v1f) as i32;

        box_weights(&mut k.ku, k.uw as usize, 1.0 - (u1 - u1f), 1.0 - (u2c - u2));
        box_weights(&mut k.kv, k.vw as usize, 1.0 - (v1 - v1f), 1.0 - (v2c - v2));
        k
    }
}
