//! Separable filter engine for quad meshes.
//!
//! One evaluation builds a kernel in the face's texel frame and then walks
//! it across the mesh: the kernel overlaps at most one u edge and one v
//! edge, each overhanging piece is split off and carried into the
//! neighbour (rotated into its frame, adjusted across face/subface
//! boundaries), and pieces with no neighbour fold back into the border
//! texels. Corner pieces only survive when the corner vertex is regular
//! (valence 4); at extraordinary vertices the corner weight is discarded
//! and debited from the normalisation term.

use crate::kernel::SeparableKernel;
use ptex_core::pixel;
use ptex_core::{DataType, FaceInfo, Res};
use ptex_io::PtexReader;
use smallvec::SmallVec;

/// Builds the initial kernel for one evaluation.
pub(crate) trait KernelBuilder {
    /// Produces a kernel for a filter footprint centred at `(u, v)` with
    /// widths `(uw, vw)` in normalised face coordinates.
    fn build(&self, u: f32, v: f32, uw: f32, vw: f32, face_res: Res, is_subface: bool) -> SeparableKernel;
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

/// Runs one separable filter evaluation.
pub(crate) fn eval(
    builder: &dyn KernelBuilder,
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

    let u = u.clamp(0.0, 1.0);
    let v = v.clamp(0.0, 1.0);

    let fi = tx.get_face_info(faceid);

    // a constant neighbourhood short-circuits the whole walk
    if fi.is_neighborhood_constant() {
        if let Some(data) = tx.get_data_at(faceid, Res::new(0, 0)) {
            if let Some(bytes) = data.data() {
                pixel::convert_to_float(result, &bytes[first_chan_offset..], dt, nchan);
            }
        }
        return;
    }

    let k = builder.build(u, v, uw, vw, fi.res, fi.is_subface());
    if k.uw <= 0 || k.vw <= 0 {
        return;
    }

    let mut ctx = EvalCtx {
        tx,
        dt,
        nchan,
        ntxchan,
        first_chan_offset,
        result: SmallVec::from_elem(0.0, nchan),
        weight: k.weight(),
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

fn split_and_apply(ctx: &mut EvalCtx, mut k: SeparableKernel, faceid: i32, f: &FaceInfo) {
    // the kernel can overlap at most one edge per axis
    let u_high = k.u > 0;
    let v_high = k.v > 0;
    let mut u_split = if u_high { k.u + k.uw > k.res.u() as i32 } else { k.u < 0 };
    let mut v_split = if v_high { k.v + k.vw > k.res.v() as i32 } else { k.v < 0 };

    if !u_split && !v_split {
        apply(ctx, k, faceid, f);
        return;
    }

    // locate the neighbours; missing ones fold back into the border texel
    let mut ueid = 0usize;
    let mut veid = 0usize;
    let mut ufid = -1i32;
    let mut vfid = -1i32;
    let mut uf = FaceInfo::default();
    let mut vf = FaceInfo::default();
    if u_split {
        ueid = if u_high { 1 } else { 3 }; // right or left
        ufid = f.adjface(ueid);
        if ufid >= 0 {
            uf = ctx.tx.get_face_info(ufid);
        } else {
            if u_high {
                k.merge_r();
            } else {
                k.merge_l();
            }
            u_split = false;
        }
    }
    if v_split {
        veid = if v_high { 2 } else { 0 }; // top or bottom
        vfid = f.adjface(veid);
        if vfid >= 0 {
            vf = ctx.tx.get_face_info(vfid);
        } else {
            if v_high {
                k.merge_t();
            } else {
                k.merge_b();
            }
            v_split = false;
        }
    }

    if u_split {
        let mut ku = if u_high { k.split_r() } else { k.split_l() };

        let mut regular_corner = false;
        if v_split {
            regular_corner = is_corner_regular(ctx, faceid, u_high, v_high);
            if !regular_corner {
                // extraordinary vertex: drop the corner piece and debit its
                // weight so normalisation stays correct
                let kc = if v_high { ku.split_t() } else { ku.split_b() };
                ctx.weight -= kc.weight();
            }
        }
        apply_across_edge(ctx, ku, faceid, f, ueid, ufid, &uf, regular_corner);
    }

    if v_split {
        let kv = if v_high { k.split_t() } else { k.split_b() };
        apply_across_edge(ctx, kv, faceid, f, veid, vfid, &vf, false);
    }

    apply(ctx, k, faceid, f);
}

#[allow(clippy::too_many_arguments)]
fn apply_across_edge(
    ctx: &mut EvalCtx,
    mut k: SeparableKernel,
    faceid: i32,
    f: &FaceInfo,
    eid: usize,
    afid: i32,
    af: &FaceInfo,
    regular_corner: bool,
) {
    let aeid = f.adjedge(eid) as usize;
    let ms = f.is_subface();
    let ns = af.is_subface();
    let mut resplit = regular_corner;

    if ms != ns {
        if !ms && ns {
            // main face into subface: halve the kernel frame and shift into
            // the subface's quadrant
            if k.res.ulog2 > 0 && k.res.vlog2 > 0 {
                k.res.ulog2 -= 1;
                k.res.vlog2 -= 1;
                match eid {
                    0 => k.v -= k.res.v() as i32,
                    1 => {}
                    2 => k.u -= k.res.u() as i32,
                    _ => {
                        k.u -= k.res.u() as i32;
                        k.v -= k.res.v() as i32;
                    }
                }
                resplit = true;
            }
        } else {
            // subface into main face; the shift depends on whether we are
            // the primary subface (the one the main face points back at)
            let primary = af.adjface(aeid) == faceid;
            match (eid + 4 - primary as usize) & 3 {
                0 => k.v += k.res.v() as i32,
                1 => {}
                2 => k.u += k.res.u() as i32,
                _ => {
                    k.u += k.res.u() as i32;
                    k.v += k.res.v() as i32;
                }
            }
            k.res.ulog2 += 1;
            k.res.vlog2 += 1;
        }
    }

    // align the kernel axes with the neighbour's
    k.rotate(eid as i32 - aeid as i32 + 2);

    // resplit when entering a subface or crossing a regular corner, since
    // the kernel may still overrun the new face
    if resplit {
        split_and_apply(ctx, k, afid, af);
    } else {
        apply(ctx, k, afid, af);
    }
}

fn apply(ctx: &mut EvalCtx, mut k: SeparableKernel, faceid: i32, f: &FaceInfo) {
    if k.uw <= 0 || k.vw <= 0 {
        return;
    }
    debug_assert!(k.u >= 0 && k.u < k.res.u() as i32);
    debug_assert!(k.v >= 0 && k.v < k.res.v() as i32);

    // match the kernel res to the face data
    while k.res.ulog2 > f.res.ulog2 {
        k.downres_u();
    }
    while k.res.vlog2 > f.res.vlog2 {
        k.downres_v();
    }

    let Some(dh) = ctx.tx.get_data_at(faceid, k.res) else { return };

    if dh.is_constant() {
        k.apply_const(&mut ctx.result, dh.data().unwrap(), ctx.first_chan_offset, ctx.dt, ctx.nchan);
    } else if dh.is_tiled() {
        let tileres = dh.tile_res();
        let tileresu = tileres.u() as i32;
        let tileresv = tileres.v() as i32;
        let ntilesu = (k.res.u() / tileres.u()) as i32;

        let mut v = k.v;
        let mut vw_rem = k.vw;
        while vw_rem > 0 {
            let tilev = v / tileresv;
            let kt_v = v % tileresv;
            let kt_vw = vw_rem.min(tileresv - kt_v);
            let mut u = k.u;
            let mut uw_rem = k.uw;
            while uw_rem > 0 {
                let tileu = u / tileresu;
                let kt_u = u % tileresu;
                let kt_uw = uw_rem.min(tileresu - kt_u);

                let mut kt = SeparableKernel {
                    res: tileres,
                    u: kt_u,
                    v: kt_v,
                    uw: kt_uw,
                    vw: kt_vw,
                    ..Default::default()
                };
                kt.ku[..kt_uw as usize]
                    .copy_from_slice(&k.ku[(u - k.u) as usize..(u - k.u + kt_uw) as usize]);
                kt.kv[..kt_vw as usize]
                    .copy_from_slice(&k.kv[(v - k.v) as usize..(v - k.v + kt_vw) as usize]);

                if let Some(th) = dh.get_tile((tilev * ntilesu + tileu) as usize) {
                    if th.is_constant() {
                        kt.apply_const(&mut ctx.result, th.data().unwrap(), ctx.first_chan_offset, ctx.dt, ctx.nchan);
                    } else {
                        kt.apply(
                            &mut ctx.result,
                            th.data().unwrap(),
                            ctx.first_chan_offset,
                            ctx.dt,
                            ctx.nchan,
                            ctx.ntxchan,
                        );
                    }
                }
                uw_rem -= kt_uw;
                u += kt_uw;
            }
            vw_rem -= kt_vw;
            v += kt_vw;
        }
    } else {
        k.apply(&mut ctx.result, dh.data().unwrap(), ctx.first_chan_offset, ctx.dt, ctx.nchan, ctx.ntxchan);
    }
}

/// Walks the four faces around the corner vertex clockwise; the corner is
/// regular when the loop has valence 4 and returns to the start.
fn is_corner_regular(ctx: &EvalCtx, faceid: i32, u_high: bool, v_high: bool) -> bool {
    let mut fid = faceid;
    // corner id: LL=0, LR=1, UR=2, UL=3
    let mut eid = ((v_high as usize) << 1) | (u_high ^ v_high) as usize;
    let mut prev_was_subface = false;
    let mut prev_fid = 0i32;

    for _ in 0..4 {
        let f = ctx.tx.get_face_info(fid);
        let is_subface = f.is_subface();
        if prev_was_subface && !is_subface {
            // stepping from a subface up to a main face
            if f.adjface((eid + 3) % 4) == prev_fid {
                // that subface was primary, so this is an interior T corner
                return true;
            }
        }
        prev_was_subface = is_subface;
        prev_fid = fid;

        fid = f.adjface(eid);
        if fid < 0 {
            return false; // hit a mesh boundary
        }
        eid = (f.adjedge(eid) as usize + 1) % 4;
    }

    fid == faceid
}
