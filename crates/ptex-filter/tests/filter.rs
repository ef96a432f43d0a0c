//! Filter behavior over real texture files: range sanity, constant
//! preservation, seam continuity and the corner walk.

use approx::assert_relative_eq;
use ptex_core::pixel;
use ptex_core::{DataType, FaceInfo, MeshType, Res};
use ptex_filter::{PtexFilter, TriangleOptions};
use ptex_io::{PtexReader, PtexWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn face_pixels(res: Res, dt: DataType, nchan: usize) -> Vec<u8> {
    let ures = res.u();
    let vres = res.v();
    let ps = dt.size() * nchan;
    let mut out = vec![0u8; ures * vres * ps];
    let mut chans = vec![0.0f32; nchan];
    for vi in 0..vres {
        for ui in 0..ures {
            chans[0] = ui as f32 / (ures.max(2) - 1) as f32;
            if nchan > 1 {
                chans[1] = vi as f32 / (vres.max(2) - 1) as f32;
            }
            if nchan > 2 {
                chans[2] = ((ui ^ vi) & 1) as f32;
            }
            let off = (vi * ures + ui) * ps;
            pixel::convert_from_float(&mut out[off..off + ps], &chans, dt, nchan);
        }
    }
    out
}

/// Nine isolated faces with mixed resolutions (no adjacency).
fn write_nine_face_file(path: &Path) {
    let resolutions = [
        Res::new(8, 7),
        Res::new(2, 1),
        Res::new(3, 1),
        Res::new(4, 5),
        Res::new(9, 8),
        Res::new(4, 2),
        Res::new(6, 2),
        Res::new(4, 7),
        Res::new(2, 1),
    ];
    let mut w = PtexWriter::open(path, MeshType::Quad, DataType::UInt16, 3, -1, resolutions.len(), true).unwrap();
    for (i, &res) in resolutions.iter().enumerate() {
        let data = face_pixels(res, DataType::UInt16, 3);
        assert!(w.write_face(i as i32, &FaceInfo::new(res), &data, 0));
    }
    w.close().unwrap();
}

/// A 2x2 grid of faces sharing one interior vertex; constant colours.
///
/// Layout (face ids):
/// ```text
///   2 3
///   0 1
/// ```
fn write_quad_grid(path: &Path, values: [[f32; 3]; 4], res: Res) {
    // neighbour ids per face edge [bottom, right, top, left]
    let adjfaces = [
        [-1, 1, 2, -1],
        [-1, -1, 3, 0],
        [0, 3, -1, -1],
        [1, -1, -1, 2],
    ];
    // grid-aligned faces see the shared edge from the opposite side
    let adjedges = [[0u8, 3, 0, 1], [0, 3, 0, 1], [2, 3, 0, 1], [2, 3, 0, 1]];

    let mut w = PtexWriter::open(path, MeshType::Quad, DataType::Float, 3, -1, 4, true).unwrap();
    for i in 0..4 {
        let info = FaceInfo::with_adjacency(res, adjfaces[i], adjedges[i], false);
        let mut pixel_bytes = vec![0u8; 12];
        pixel::convert_from_float(&mut pixel_bytes, &values[i], DataType::Float, 3);
        assert!(w.write_constant_face(i as i32, &info, &pixel_bytes));
    }
    w.close().unwrap();
}

fn open(path: &PathBuf) -> Arc<PtexReader> {
    PtexReader::open(path, false).unwrap()
}

#[test]
fn mitchell_range_and_monotonicity() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nine.ptx");
    write_nine_face_file(&path);
    let tx = open(&path);

    let filter = PtexFilter::mitchell(1.0);
    for faceid in 0..9 {
        let mut prev_u = f32::NEG_INFINITY;
        for step in 0..=8 {
            let u = step as f32 * 0.125;
            let mut prev_v = f32::NEG_INFINITY;
            for vstep in 0..=8 {
                let v = vstep as f32 * 0.125;
                let mut out = [0.0f32; 3];
                filter.eval(&mut out, 0, 3, &tx, faceid, u, v, 1.0, 1.0);
                for (c, val) in out.iter().enumerate() {
                    assert!(val.is_finite(), "face {faceid} ({u},{v}) chan {c}");
                }
                // the gradient channels stay in range; the checkerboard may
                // ring slightly since mitchell has negative lobes
                assert!((-0.05..=1.05).contains(&out[0]), "face {faceid} ({u},{v}) u-grad {}", out[0]);
                assert!((-0.05..=1.05).contains(&out[1]), "face {faceid} ({u},{v}) v-grad {}", out[1]);
                assert!((-0.25..=1.25).contains(&out[2]), "face {faceid} ({u},{v}) checker {}", out[2]);
                // the v-gradient channel is non-decreasing down a column
                assert!(out[1] >= prev_v - 2e-3, "face {faceid} u={u} v={v}");
                prev_v = out[1];
            }
            // the u-gradient channel is non-decreasing along each row
            let mut out = [0.0f32; 3];
            filter.eval(&mut out, 0, 3, &tx, faceid, u, 0.5, 1.0, 1.0);
            assert!(out[0] >= prev_u - 2e-3, "face {faceid} u={u}");
            prev_u = out[0];
        }
    }
}

#[test]
fn constant_neighbourhood_preserved_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("const.ptx");
    let value = [0.3f32, 0.6, 0.9];
    write_quad_grid(&path, [value; 4], Res::new(4, 4));
    let tx = open(&path);

    for filter in [PtexFilter::mitchell(0.5), PtexFilter::box_filter()] {
        for &(u, v, uw) in &[(0.0f32, 0.0f32, 1.0f32), (0.5, 0.5, 0.25), (1.0, 1.0, 0.03), (0.99, 0.01, 0.4)] {
            for faceid in 0..4 {
                let mut out = [0.0f32; 3];
                filter.eval(&mut out, 0, 3, &tx, faceid, u, v, uw, uw);
                for c in 0..3 {
                    assert!(
                        (out[c] - value[c]).abs() < 1e-5,
                        "face {faceid} ({u},{v}) chan {c}: {} vs {}",
                        out[c],
                        value[c]
                    );
                }
            }
        }
    }
}

#[test]
fn corner_walk_averages_four_faces() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grid.ptx");
    let values = [
        [0.1f32, 0.0, 0.0],
        [0.3, 0.0, 0.0],
        [0.5, 0.0, 0.0],
        [0.9, 0.0, 0.0],
    ];
    let res = Res::new(3, 3);
    write_quad_grid(&path, values, res);
    let tx = open(&path);

    // box footprint of exactly one texel centred on the shared vertex of
    // face 0: a quarter texel lands on each face around the vertex
    let filter = PtexFilter::box_filter();
    let mut out = [0.0f32; 3];
    filter.eval(&mut out, 0, 3, &tx, 0, 1.0, 1.0, 1.0 / 8.0, 1.0 / 8.0);

    let expected = (values[0][0] + values[1][0] + values[2][0] + values[3][0]) / 4.0;
    assert_relative_eq!(out[0], expected, epsilon = 1e-5);
}

#[test]
fn boundary_corner_folds_back() {
    // at an outer corner of the grid there are no neighbours: the whole
    // kernel folds back onto the local face
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grid.ptx");
    let values = [
        [0.2f32, 0.0, 0.0],
        [0.4, 0.0, 0.0],
        [0.6, 0.0, 0.0],
        [0.8, 0.0, 0.0],
    ];
    write_quad_grid(&path, values, Res::new(3, 3));
    let tx = open(&path);

    let filter = PtexFilter::box_filter();
    let mut out = [0.0f32; 3];
    filter.eval(&mut out, 0, 3, &tx, 0, 0.0, 0.0, 1.0 / 8.0, 1.0 / 8.0);
    assert_relative_eq!(out[0], values[0][0], epsilon = 1e-5);
}

#[test]
fn seam_continuity_across_matching_faces() {
    // two faces with a continuous horizontal ramp across their shared
    // vertical edge; filtering must not jump at the seam
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("seam.ptx");
    let res = Res::new(5, 5);
    let n = res.u();

    let mut w = PtexWriter::open(&path, MeshType::Quad, DataType::Float, 1, -1, 2, true).unwrap();
    // face 0 ramps 0..0.5, face 1 ramps 0.5..1, continuous at the seam
    for face in 0..2 {
        let mut data = vec![0u8; res.size() * 4];
        for vi in 0..n {
            for ui in 0..n {
                let global = (face * n + ui) as f32 + 0.5;
                let val = global / (2 * n) as f32;
                data[(vi * n + ui) * 4..][..4].copy_from_slice(&val.to_le_bytes());
            }
        }
        let adjfaces = if face == 0 { [-1, 1, -1, -1] } else { [-1, -1, -1, 0] };
        let adjedges = if face == 0 { [0u8, 3, 0, 0] } else { [0, 0, 0, 1] };
        let info = FaceInfo::with_adjacency(res, adjfaces, adjedges, false);
        assert!(w.write_face(face as i32, &info, &data, 0));
    }
    w.close().unwrap();
    let tx = open(&path);

    let filter = PtexFilter::mitchell(1.0);
    let width = 0.1f32;
    let eps = 0.002f32;

    // sample a dense line crossing the seam; adjacent samples must differ
    // by no more than the local ramp slope allows
    let mut samples = Vec::new();
    for i in 0..=40 {
        let t = i as f32 / 40.0; // global u in [0, 1]
        let (face, u) = if t < 0.5 { (0, t * 2.0) } else { (1, (t - 0.5) * 2.0) };
        let mut out = [0.0f32];
        filter.eval(&mut out, 0, 1, &tx, face, u.clamp(0.0, 1.0), 0.5, width, width);
        samples.push(out[0]);
    }
    for pair in samples.windows(2) {
        let jump = (pair[1] - pair[0]).abs();
        assert!(jump < 0.05 + eps, "seam jump {jump}");
    }

    // and symmetric probes right at the seam agree closely
    let mut left = [0.0f32];
    let mut right = [0.0f32];
    filter.eval(&mut left, 0, 1, &tx, 0, 0.999, 0.5, width, width);
    filter.eval(&mut right, 0, 1, &tx, 1, 0.001, 0.5, width, width);
    assert!((left[0] - right[0]).abs() < 0.01, "{} vs {}", left[0], right[0]);
}

#[test]
fn triangle_mesh_constant_preserved() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tri.ptx");
    let res = Res::new(4, 4);

    let mut w = PtexWriter::open(&path, MeshType::Triangle, DataType::Float, 1, -1, 2, true).unwrap();
    let pixel_bytes = 0.7f32.to_le_bytes();
    // two triangles sharing their hypotenuse
    let info0 = FaceInfo::with_adjacency(res, [-1, 1, -1, -1], [0, 1, 0, 0], false);
    let info1 = FaceInfo::with_adjacency(res, [-1, 0, -1, -1], [0, 1, 0, 0], false);
    assert!(w.write_constant_face(0, &info0, &pixel_bytes));
    assert!(w.write_constant_face(1, &info1, &pixel_bytes));
    w.close().unwrap();
    let tx = open(&path);

    let filter = PtexFilter::triangle(TriangleOptions::default());
    for &(u, v) in &[(0.2f32, 0.2f32), (0.1, 0.8), (0.8, 0.1), (0.33, 0.33)] {
        let mut out = [0.0f32];
        filter.eval(&mut out, 0, 1, &tx, 0, u, v, 0.1, 0.1);
        assert!((out[0] - 0.7).abs() < 1e-5, "({u},{v}) -> {}", out[0]);
    }
}

#[test]
fn triangle_mesh_gradient_in_range() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trig.ptx");
    let res = Res::new(5, 5);
    let data = face_pixels(res, DataType::Float, 1);

    let mut w = PtexWriter::open(&path, MeshType::Triangle, DataType::Float, 1, -1, 1, true).unwrap();
    assert!(w.write_face(0, &FaceInfo::new(res), &data, 0));
    w.close().unwrap();
    let tx = open(&path);

    let filter = PtexFilter::triangle(TriangleOptions::default());
    for i in 0..8 {
        for j in 0..(8 - i) {
            let u = i as f32 / 8.0 + 0.05;
            let v = j as f32 / 8.0 + 0.05;
            let mut out = [0.0f32];
            filter.eval(&mut out, 0, 1, &tx, 0, u, v, 0.05, 0.05);
            assert!(out[0].is_finite());
            assert!((-0.05..=1.05).contains(&out[0]), "({u},{v}) -> {}", out[0]);
        }
    }
}

#[test]
fn filter_rejects_bad_face_ids() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("one.ptx");
    write_quad_grid(&path, [[0.5, 0.5, 0.5]; 4], Res::new(2, 2));
    let tx = open(&path);

    let filter = PtexFilter::mitchell(1.0);
    let mut out = [9.0f32; 3];
    filter.eval(&mut out, 0, 3, &tx, -1, 0.5, 0.5, 0.1, 0.1);
    assert_eq!(out, [0.0; 3]);
    let mut out = [9.0f32; 3];
    filter.eval(&mut out, 0, 3, &tx, 99, 0.5, 0.5, 0.1, 0.1);
    assert_eq!(out, [0.0; 3]);
}
