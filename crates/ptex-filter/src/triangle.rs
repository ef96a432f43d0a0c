//! Elliptical Gaussian filtering for triangle meshes.
//!
//! Triangle faces pack two triangles into one square image. The filter
//! builds an elliptical Gaussian from the two filter gradients in the
//! affine triangle basis, clamps its minor axis by a maximum eccentricity
//! and a one-texel minimum, picks the resolution matching the minor
//! radius, and evaluates `exp(-2Q)` over the texels inside the `Q < 1`
//! contour using two iterators, one per triangle orientation. Pieces that
//! overhang a barycentric edge are carried to the neighbour when one
//! exists. Tiled triangle data is not supported and is skipped.

use ptex_core::pixel::{self, Scalar};
use ptex_core::{DataType, FaceInfo, Res};
use ptex_io::PtexReader;
use smallvec::SmallVec;
use tracing::warn;

/// Options for the triangle filter.
#[derive(Debug, Clone, Copy)]
pub struct TriangleOptions {
    /// Filter width multiplier on the supplied gradients.
    pub width: f32,
    /// Additional blur in normalised coordinates.
    pub blur: f32,
}

impl Default for TriangleOptions {
    fn default() -> Self {
        TriangleOptions { width: 1.0, blur: 0.0 }
    }
}

/// Maximum ellipse eccentricity before the minor axis is blurred up.
const MAX_ECC: f64 = 10.0;

/// Elliptical Gaussian kernel in normalised barycentric coordinates.
#[derive(Debug, Clone)]
struct TriangleKernel {
    res: Res,
    u: f64,
    v: f64,
    u1: f64,
    v1: f64,
    w1: f64,
    u2: f64,
    v2: f64,
    w2: f64,
    a: f64,
    b: f64,
    c: f64,
}

impl TriangleKernel {
    /// Splits off the piece past u = 0 for the neighbour across edge 2.
    fn split_u(&mut self) -> TriangleKernel {
        let mut ka = self.clone();
        self.u1 = 0.0;
        ka.u2 = 1.0;
        ka
    }

    /// Splits off the piece past v = 0 for the neighbour across edge 0.
    fn split_v(&mut self) -> TriangleKernel {
        let mut ka = self.clone();
        self.v1 = 0.0;
        ka.v2 = 1.0;
        ka
    }

    /// Splits off the piece past w = 0 for the neighbour across edge 1.
    fn split_w(&mut self) -> TriangleKernel {
        let mut ka = self.clone();
        self.w1 = 0.0;
        ka.w2 = 1.0;
        ka
    }

    /// Clamps the kernel res down to the face res (coefficients are
    /// resolution-independent).
    fn clamp_res(&mut self, fres: Res) {
        self.res.ulog2 = self.res.ulog2.min(fres.ulog2);
        self.res.vlog2 = self.res.ulog2;
    }

    /// Clamps the extent to the valid barycentric domain.
    fn clamp_extent(&mut self) {
        self.u1 = self.u1.max(0.0);
        self.v1 = self.v1.max(0.0);
        self.w1 = self.w1.max(0.0);
        self.u2 = self.u2.min(1.0 - (self.v1 + self.w1));
        self.v2 = self.v2.min(1.0 - (self.w1 + self.u1));
        self.w2 = self.w2.min(1.0 - (self.u1 + self.v1));
    }

    /// Builds the even- and odd-triangle texel iterators.
    fn get_iterators(&self) -> (TriangleIter, TriangleIter) {
        let resu = self.res.u() as i32;
        let scale = resu as f64;

        // normalise the coefficients for texel units so the cutoff contour
        // is Q = 1
        let f = self.a * self.c - 0.25 * self.b * self.b;
        let finv = 1.0 / (scale * scale * f);
        let ak = self.a * finv;
        let bk = self.b * finv;
        let ck = self.c * finv;

        let t = |x: f64| (x * scale - 1.0 / 3.0).ceil() as i32;

        let ke = TriangleIter {
            rowlen: resu,
            u: self.u * scale - 1.0 / 3.0,
            v: self.v * scale - 1.0 / 3.0,
            u1: t(self.u1),
            v1: t(self.v1),
            w1: t(self.w1),
            u2: t(self.u2),
            v2: t(self.v2),
            w2: t(self.w2),
            a: ak,
            b: bk,
            c: ck,
        };

        // the odd triangles live in the flipped frame: u' = 1-v, v' = 1-u,
        // w' = -w
        let ko = TriangleIter {
            rowlen: resu,
            u: (1.0 - self.v) * scale - 1.0 / 3.0,
            v: (1.0 - self.u) * scale - 1.0 / 3.0,
            u1: t(1.0 - self.v2),
            v1: t(1.0 - self.u2),
            w1: t(-self.w2),
            u2: t(1.0 - self.v1),
            v2: t(1.0 - self.u1),
            w2: t(-self.w1),
            a: ck,
            b: bk,
            c: ak,
        };
        (ke, ko)
    }
}

/// One triangle orientation's texel iterator.
struct TriangleIter {
    rowlen: i32,
    u: f64,
    v: f64,
    u1: i32,
    v1: i32,
    w1: i32,
    u2: i32,
    v2: i32,
    w2: i32,
    a: f64,
    b: f64,
    c: f64,
}

impl TriangleIter {
    fn valid(&self) -> bool {
        self.u2 > self.u1 && self.v2 > self.v1 && self.w2 > self.w1
    }

    /// Row-clipped texel range for row `vi`.
    fn row_range(&self, vi: i32) -> (i32, i32) {
        let rl = self.rowlen - vi;
        let x1 = self.u1.max(rl - self.w2).max(0);
        let x2 = self.u2.min(rl - self.w1).min(self.rowlen);
        (x1, x2)
    }

    /// Accumulates weighted texels; returns the accumulated weight.
    fn apply(&self, dst: &mut [f64], data: &[u8], offset: usize, dt: DataType, nchan: usize, ntxchan: usize) -> f64 {
        match dt {
            DataType::UInt8 => self.apply_impl::<u8>(dst, data, offset, nchan, ntxchan),
            DataType::UInt16 => self.apply_impl::<u16>(dst, data, offset, nchan, ntxchan),
            DataType::Half => self.apply_impl::<half::f16>(dst, data, offset, nchan, ntxchan),
            DataType::Float => self.apply_impl::<f32>(dst, data, offset, nchan, ntxchan),
        }
    }

    fn apply_impl<T: Scalar>(&self, dst: &mut [f64], data: &[u8], offset: usize, nchan: usize, ntxchan: usize) -> f64 {
        let es = T::BYTES;
        let mut weight = 0.0;
        let ddq = 2.0 * self.a;
        for vi in self.v1.max(0)..self.v2.min(self.rowlen) {
            let (x1, x2) = self.row_range(vi);
            if x2 <= x1 {
                continue;
            }
            let du = x1 as f64 - self.u;
            let dv = vi as f64 - self.v;
            let mut dq = self.a * (2.0 * du + 1.0) + self.b * dv;
            let mut q = self.a * du * du + (self.b * du + self.c * dv) * dv;
            let mut p = ((vi * self.rowlen + x1) as usize) * ntxchan * es + offset;
            for _ in x1..x2 {
                if q < 1.0 {
                    let w = (-2.0 * q).exp();
                    weight += w;
                    for ch in 0..nchan {
                        dst[ch] += w * T::read(&data[p + ch * es..]).to_f32() as f64;
                    }
                }
                q += dq;
                dq += ddq;
                p += ntxchan * es;
            }
        }
        weight
    }

    /// The total weight the iterator would apply.
    fn weight(&self) -> f64 {
        let mut weight = 0.0;
        let ddq = 2.0 * self.a;
        for vi in self.v1.max(0)..self.v2.min(self.rowlen) {
            let (x1, x2) = self.row_range(vi);
            if x2 <= x1 {
                continue;
            }
            let du = x1 as f64 - self.u;
            let dv = vi as f64 - self.v;
            let mut dq = self.a * (2.0 * du + 1.0) + self.b * dv;
            let mut q = self.a * du * du + (self.b * du + self.c * dv) * dv;
            for _ in x1..x2 {
                if q < 1.0 {
                    weight += (-2.0 * q).exp();
                }
                q += dq;
                dq += ddq;
            }
        }
        weight
    }
}

struct EvalCtx<'a> {
    tx: &'a PtexReader,
    dt: DataType,
    nchan: usize,
    ntxchan: usize,
    first_chan_offset: usize,
    result: SmallVec<[f64; 4]>,
    weight: f64,
}

/// Runs one triangle filter evaluation.
pub(crate) fn eval(
    opts: TriangleOptions,
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
    result[..nchannels].fill(0.0);
    if nchannels == 0 || faceid < 0 || faceid as usize >= tx.num_faces() {
        return;
    }
    let ntxchan = tx.num_channels();
    let nchan = nchannels.min(ntxchan.saturating_sub(first_chan));
    if nchan == 0 {
        return;
    }
    let dt = tx.data_type();
    let first_chan_offset = first_chan * dt.size();

    let fi = tx.get_face_info(faceid);
    if fi.is_neighborhood_constant() {
        if let Some(data) = tx.get_data_at(faceid, Res::new(0, 0)) {
            if let Some(bytes) = data.data() {
                pixel::convert_to_float(result, &bytes[first_chan_offset..], dt, nchan);
            }
        }
        return;
    }

    let u = u.clamp(0.0, 1.0);
    let v = v.clamp(0.0, 1.0);
    let k = build_kernel(u, v, uw, 0.0, 0.0, vw, opts.width, opts.blur, fi.res);

    let mut ctx = EvalCtx {
        tx,
        dt,
        nchan,
        ntxchan,
        first_chan_offset,
        result: SmallVec::from_elem(0.0, nchan),
        weight: 0.0,
    };
    split_and_apply(&mut ctx, k, faceid, &fi);

    if ctx.weight == 0.0 {
        return;
    }
    let scale = 1.0 / (ctx.weight * dt.one_value());
    for (out, acc) in result.iter_mut().zip(ctx.result.iter()) {
        *out = (acc * scale) as f32;
    }
}

#[allow(clippy::too_many_arguments)]
fn build_kernel(u: f32, v: f32, uw1: f32, vw1: f32, uw2: f32, vw2: f32, width: f32, blur: f32, face_res: Res) -> TriangleKernel {
    let (u, v) = (u as f64, v as f64);
    let (uw1, vw1, uw2, vw2) = (uw1 as f64, vw1 as f64, uw2 as f64, vw2 as f64);

    // ellipse coefficients: A*du^2 + B*du*dv + C*dv^2 = F, F = A*C - B^2/4
    let scale = (width as f64) * (width as f64) * 0.25;
    let a = (vw1 * vw1 + vw2 * vw2) * scale;
    let b = -2.0 * (uw1 * vw1 + uw2 * vw2) * scale;
    let c = (uw1 * uw1 + uw2 * uw2) * scale;

    // convert to the cartesian domain
    let ac = 0.75 * a;
    let bc = 0.8660254037844386 * (b - a); // sqrt(3)/2
    let cc = 0.25 * a - 0.5 * b + c;

    // blur required to cap eccentricity
    let x = ((ac - cc) * (ac - cc) + bc * bc).sqrt();
    let ecc_ratio = (MAX_ECC * MAX_ECC + 1.0) / (MAX_ECC * MAX_ECC - 1.0);
    let b_e = 0.5 * (ecc_ratio * x - (ac + cc));

    // blur required to keep the ellipse at least a texel wide
    let b_t = {
        let t = 0.5 / face_res.u() as f64;
        t * t
    };

    // requested blur
    let b_b = 0.25 * (blur as f64) * (blur as f64);
    let blur_amt = b_b.max(b_e).max(b_t);
    let ac = ac + blur_amt;
    let cc = cc + blur_amt;

    // minor radius picks the resolution
    let x = ((ac - cc) * (ac - cc) + bc * bc).sqrt();
    let m = (2.0 * (ac * cc - 0.25 * bc * bc) / (ac + cc + x)).sqrt();
    let reslog2 = ((0.5 / m).log2().ceil() as i8).clamp(0, face_res.ulog2);

    // back to the triangular domain
    let a = (4.0 / 3.0) * ac;
    let b = 1.1547005383792515 * bc + a; // 2/sqrt(3)
    let c = -0.25 * a + 0.5 * b + cc;

    // extents of the Q = F contour
    let uw = c.sqrt();
    let vw = a.sqrt();
    let ww = (a - b + c).sqrt();
    let w = 1.0 - u - v;

    TriangleKernel {
        res: Res::new(reslog2, reslog2),
        u,
        v,
        u1: u - uw,
        v1: v - vw,
        w1: w - ww,
        u2: u + uw,
        v2: v + vw,
        w2: w + ww,
        a,
        b,
        c,
    }
}

fn split_and_apply(ctx: &mut EvalCtx, mut k: TriangleKernel, faceid: i32, f: &FaceInfo) {
    // carry overhanging pieces to the neighbours that exist
    if k.u1 < 0.0 && f.adjface(2) >= 0 {
        let ka = k.split_u();
        apply_across_edge(ctx, ka, f, 2);
    }
    if k.v1 < 0.0 && f.adjface(0) >= 0 {
        let ka = k.split_v();
        apply_across_edge(ctx, ka, f, 0);
    }
    if k.w1 < 0.0 && f.adjface(1) >= 0 {
        let ka = k.split_w();
        apply_across_edge(ctx, ka, f, 1);
    }
    apply(ctx, k, faceid, f);
}

fn apply_across_edge(ctx: &mut EvalCtx, mut k: TriangleKernel, f: &FaceInfo, eid: usize) {
    let afid = f.adjface(eid);
    let af = ctx.tx.get_face_info(afid);
    // the kernel keeps the source orientation; the extent clamp in apply
    // limits it to the neighbour's nearest texels
    k.clamp_res(af.res);
    apply(ctx, k, afid, &af);
}

fn apply(ctx: &mut EvalCtx, mut k: TriangleKernel, faceid: i32, f: &FaceInfo) {
    if f.res.ulog2 < k.res.ulog2 {
        k.clamp_res(f.res);
    }
    k.clamp_extent();

    let Some(dh) = ctx.tx.get_data_at(faceid, k.res) else { return };
    if dh.is_tiled() {
        warn!("tiled triangle face data is not supported; skipping");
        return;
    }
    let Some(data) = dh.data() else { return };
    let (ke, ko) = k.get_iterators();

    if dh.is_constant() {
        let mut w = 0.0;
        if ke.valid() {
            w += ke.weight();
        }
        if ko.valid() {
            w += ko.weight();
        }
        if w > 0.0 {
            accumulate_const(ctx, data, w);
            ctx.weight += w;
        }
    } else {
        if ke.valid() {
            ctx.weight += ke.apply(&mut ctx.result, data, ctx.first_chan_offset, ctx.dt, ctx.nchan, ctx.ntxchan);
        }
        if ko.valid() {
            ctx.weight += ko.apply(&mut ctx.result, data, ctx.first_chan_offset, ctx.dt, ctx.nchan, ctx.ntxchan);
        }
    }
}

fn accumulate_const(ctx: &mut EvalCtx, pixel: &[u8], weight: f64) {
    let es = ctx.dt.size();
    for c in 0..ctx.nchan {
        let off = ctx.first_chan_offset + c * es;
        let v = match ctx.dt {
            DataType::UInt8 => u8::read(&pixel[off..]).to_f32(),
            DataType::UInt16 => u16::read(&pixel[off..]).to_f32(),
            DataType::Half => half::f16::read(&pixel[off..]).to_f32(),
            DataType::Float => f32::read(&pixel[off..]),
        };
        ctx.result[c] += weight * v as f64;
    }
}
