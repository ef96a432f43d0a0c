//! End-to-end write/read coverage: a multi-face mesh with mipmaps,
//! metadata, and both edit modes.

use ptex_core::pixel;
use ptex_core::{DataType, FaceInfo, MeshType, Res};
use ptex_io::{PtexReader, PtexWriter};
use std::path::Path;

/// The nine face resolutions used throughout.
fn face_resolutions() -> Vec<Res> {
    vec![
        Res::new(8, 7),
        Res::new(2, 1),
        Res::new(3, 1),
        Res::new(4, 5),
        Res::new(9, 8),
        Res::new(4, 2),
        Res::new(6, 2),
        Res::new(4, 7),
        Res::new(2, 1),
    ]
}

/// Fills a face image with (u gradient, v gradient, checkerboard).
fn face_pixels(res: Res, dt: DataType, nchan: usize) -> Vec<u8> {
    let ures = res.u();
    let vres = res.v();
    let mut out = vec![0u8; ures * vres * dt.size() * nchan];
    let ps = dt.size() * nchan;
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

fn write_nine_face_file(path: &Path, dt: DataType) {
    let resolutions = face_resolutions();
    let mut w = PtexWriter::open(path, MeshType::Quad, dt, 3, -1, resolutions.len(), true).unwrap();
    for (i, &res) in resolutions.iter().enumerate() {
        let data = face_pixels(res, dt, 3);
        assert!(w.write_face(i as i32, &FaceInfo::new(res), &data, 0), "face {i} write failed");
    }
    w.write_meta_string("hello", "goodbye");
    w.write_meta_f64("flarf", &[1.1, 2.2, 3.3]);
    w.write_meta_i16("flarfi", &[2, 4, 6, 8]);
    w.close().unwrap();
}

#[test]
fn construct_round_trip_and_edit() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nine.ptx");
    let dt = DataType::UInt16;
    write_nine_face_file(&path, dt);

    // --- top level and stored reductions ---
    let r = PtexReader::open(&path, false).unwrap();
    assert_eq!(r.mesh_type(), MeshType::Quad);
    assert_eq!(r.data_type(), dt);
    assert_eq!(r.num_channels(), 3);
    assert_eq!(r.alpha_channel(), -1);
    assert_eq!(r.num_faces(), 9);
    assert!(r.has_mip_maps());
    assert!(!r.has_edits());

    let ps = r.pixel_size();
    for (i, &res) in face_resolutions().iter().enumerate() {
        let info = r.get_face_info(i as i32);
        assert_eq!(info.res, res, "face {i} res");

        let expected = face_pixels(res, dt, 3);
        let mut actual = vec![0u8; expected.len()];
        r.get_data_into(i as i32, &mut actual, 0);
        assert_eq!(actual, expected, "face {i} top level");

        // stored mipmap levels must match sequential 2:1 reductions
        let max_level = (res.ulog2.min(res.vlog2) - 2).max(0);
        let mut reduced = expected;
        let mut rres = res;
        for level in 1..=max_level {
            let newres = Res::new(rres.ulog2 - 1, rres.vlog2 - 1);
            let mut next = vec![0u8; newres.size() * ps];
            pixel::reduce(&reduced, rres.u() * ps, rres.u(), rres.v(), &mut next, newres.u() * ps, dt, 3);
            reduced = next;
            rres = newres;

            let mut actual = vec![0u8; reduced.len()];
            r.get_data_into_at(i as i32, &mut actual, 0, rres);
            assert_eq!(actual, reduced, "face {i} level {level}");
        }
    }

    // --- metadata ---
    let meta = r.get_meta_data().unwrap();
    assert_eq!(meta.get_string("hello").as_deref(), Some("goodbye"));
    assert_eq!(meta.get_f64("flarf"), Some(vec![1.1, 2.2, 3.3]));
    assert_eq!(meta.get_i16("flarfi"), Some(vec![2, 4, 6, 8]));
    assert_eq!(meta.get_string("absent"), None);
    drop(meta);
    drop(r);

    // --- incremental edit: metadata overwrite ---
    {
        let mut w = PtexWriter::edit(&path, true, MeshType::Quad, dt, 3, -1, 9, true).unwrap();
        w.write_meta_string("hello", "ciao");
        w.write_meta_f64("yahoo", &[1.0, 2.0, 0.0]);
        w.close().unwrap();
    }
    {
        let r = PtexReader::open(&path, false).unwrap();
        assert!(r.has_edits());
        let meta = r.get_meta_data().unwrap();
        assert_eq!(meta.get_string("hello").as_deref(), Some("ciao"));
        assert_eq!(meta.get_f64("yahoo"), Some(vec![1.0, 2.0, 0.0]));
        // untouched keys survive
        assert_eq!(meta.get_i16("flarfi"), Some(vec![2, 4, 6, 8]));
    }

    // --- incremental edit: face override ---
    {
        let mut w = PtexWriter::edit(&path, true, MeshType::Quad, dt, 3, -1, 9, true).unwrap();
        let res = Res::new(2, 2);
        let data = face_pixels(res, dt, 3);
        assert!(w.write_face(2, &FaceInfo::new(res), &data, 0));
        w.close().unwrap();
    }
    {
        let r = PtexReader::open(&path, false).unwrap();
        let info = r.get_face_info(2);
        assert_eq!(info.res, Res::new(2, 2));
        assert!(info.has_edits());
        let expected = face_pixels(Res::new(2, 2), dt, 3);
        let mut actual = vec![0u8; expected.len()];
        r.get_data_into(2, &mut actual, 0);
        assert_eq!(actual, expected, "edited face data");
    }

    // --- full rewrite: consolidate and replace face 1 with a constant ---
    {
        let mut w = PtexWriter::edit(&path, false, MeshType::Quad, dt, 3, -1, 9, true).unwrap();
        let mut pixel_bytes = vec![0u8; 6];
        pixel::convert_from_float(&mut pixel_bytes, &[0.25, 0.5, 0.75], dt, 3);
        assert!(w.write_constant_face(1, &FaceInfo::new(Res::new(7, 8)), &pixel_bytes));
        w.close().unwrap();
    }
    {
        let r = PtexReader::open(&path, false).unwrap();
        assert!(!r.has_edits(), "consolidation clears the edit suffix");

        let info = r.get_face_info(1);
        assert_eq!(info.res, Res::new(7, 8));
        assert!(info.is_constant());
        let d = r.get_data(1).unwrap();
        assert!(d.is_constant());
        let mut want = vec![0u8; 6];
        pixel::convert_from_float(&mut want, &[0.25, 0.5, 0.75], dt, 3);
        assert_eq!(d.data().unwrap(), &want[..]);

        // the incremental face edit survives consolidation
        let expected = face_pixels(Res::new(2, 2), dt, 3);
        let mut actual = vec![0u8; expected.len()];
        r.get_data_into(2, &mut actual, 0);
        assert_eq!(actual, expected);

        // so does the metadata state
        let meta = r.get_meta_data().unwrap();
        assert_eq!(meta.get_string("hello").as_deref(), Some("ciao"));
        assert_eq!(meta.get_f64("flarf"), Some(vec![1.1, 2.2, 3.3]));

        // untouched faces still read back
        let expected = face_pixels(Res::new(8, 7), dt, 3);
        let mut actual = vec![0u8; expected.len()];
        r.get_data_into(0, &mut actual, 0);
        assert_eq!(actual, expected);
    }
}

#[test]
fn round_trip_all_data_types() {
    let dir = tempfile::tempdir().unwrap();
    for dt in [DataType::UInt8, DataType::UInt16, DataType::Half, DataType::Float] {
        let path = dir.path().join(format!("t_{}.ptx", dt.name()));
        let res = Res::new(4, 3);
        let data = face_pixels(res, dt, 3);

        let mut w = PtexWriter::open(&path, MeshType::Quad, dt, 3, -1, 2, true).unwrap();
        assert!(w.write_face(0, &FaceInfo::new(res), &data, 0));
        let mut cpix = vec![0u8; dt.size() * 3];
        pixel::convert_from_float(&mut cpix, &[0.5, 0.25, 1.0], dt, 3);
        assert!(w.write_constant_face(1, &FaceInfo::new(Res::new(3, 3)), &cpix));
        w.close().unwrap();

        let r = PtexReader::open(&path, false).unwrap();
        assert_eq!(r.data_type(), dt, "{}", dt.name());
        let mut actual = vec![0u8; data.len()];
        r.get_data_into(0, &mut actual, 0);
        assert_eq!(actual, data, "packed face, {}", dt.name());

        let d = r.get_data(1).unwrap();
        assert!(d.is_constant());
        assert_eq!(d.data().unwrap(), &cpix[..], "constant face, {}", dt.name());
    }
}

#[test]
fn round_trip_triangle_mesh() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tri.ptx");
    let dt = DataType::Float;
    let res = Res::new(4, 4);
    let data = face_pixels(res, dt, 1);

    let mut w = PtexWriter::open(&path, MeshType::Triangle, dt, 1, -1, 2, true).unwrap();
    assert!(w.write_face(0, &FaceInfo::new(res), &data, 0));
    assert!(w.write_face(1, &FaceInfo::new(res), &data, 0));
    // non-square triangle faces are rejected
    assert!(!w.write_face(0, &FaceInfo::new(Res::new(4, 3)), &data, 0));
    assert!(w.close().is_err(), "rejected face poisons the writer");

    // redo cleanly
    let mut w = PtexWriter::open(&path, MeshType::Triangle, dt, 1, -1, 2, true).unwrap();
    assert!(w.write_face(0, &FaceInfo::new(res), &data, 0));
    assert!(w.write_face(1, &FaceInfo::new(res), &data, 0));
    w.close().unwrap();

    let r = PtexReader::open(&path, false).unwrap();
    assert_eq!(r.mesh_type(), MeshType::Triangle);
    let mut actual = vec![0u8; data.len()];
    r.get_data_into(0, &mut actual, 0);
    assert_eq!(actual, data);

    // triangle reductions are stored and symmetric
    let ps = r.pixel_size();
    let rres = Res::new(3, 3);
    let mut expected = vec![0u8; rres.size() * ps];
    pixel::reduce_tri(&data, res.u() * ps, res.u(), res.v(), &mut expected, rres.u() * ps, dt, 1);
    let mut actual = vec![0u8; expected.len()];
    r.get_data_into_at(0, &mut actual, 0, rres);
    assert_eq!(actual, expected);
}

#[test]
fn premultiply_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("alpha.ptx");
    let dt = DataType::UInt8;
    let res = Res::new(2, 2);
    // 2 channels, alpha in channel 1, alpha = 128 everywhere, colour ramp
    let mut data = vec![0u8; res.size() * 2];
    for (i, px) in data.chunks_exact_mut(2).enumerate() {
        px[0] = (i * 16) as u8;
        px[1] = 128;
    }

    let mut w = PtexWriter::open(&path, MeshType::Quad, dt, 2, 1, 1, false).unwrap();
    assert!(w.write_face(0, &FaceInfo::new(res), &data, 0));
    w.close().unwrap();

    // plain read returns the stored (unassociated) values
    let plain = PtexReader::open(&path, false).unwrap();
    let mut stored = vec![0u8; data.len()];
    plain.get_data_into(0, &mut stored, 0);
    assert_eq!(stored, data);

    // premultiplied read scales colour by alpha
    let premult = PtexReader::open(&path, true).unwrap();
    let mut scaled = vec![0u8; data.len()];
    premult.get_data_into(0, &mut scaled, 0);
    let mut expected = data.clone();
    pixel::mult_alpha(&mut expected, res.size(), dt, 2, 1);
    assert_eq!(scaled, expected);
}

#[test]
fn large_metadata_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("meta.ptx");
    let dt = DataType::UInt8;

    let big: Vec<f64> = (0..400).map(|i| i as f64 * 0.5).collect(); // 3200 bytes
    let small = [7i32, 8, 9];

    let mut w = PtexWriter::open(&path, MeshType::Quad, dt, 1, -1, 1, false).unwrap();
    let res = Res::new(1, 1);
    let data = face_pixels(res, dt, 1);
    assert!(w.write_face(0, &FaceInfo::new(res), &data, 0));
    w.write_meta_f64("samples", &big);
    w.write_meta_i32("tiny", &small);
    w.close().unwrap();

    let r = PtexReader::open(&path, false).unwrap();
    let meta = r.get_meta_data().unwrap();
    assert_eq!(meta.get_i32("tiny"), Some(small.to_vec()));
    // the large value loads lazily and matches byte for byte
    assert_eq!(meta.get_f64("samples"), Some(big.clone()));
    // and again from the now-cached body
    assert_eq!(meta.get_f64("samples"), Some(big));
}

#[test]
fn tiled_faces_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("big.ptx");
    let dt = DataType::UInt16;
    // 512 x 512 x 3 u16 = 1.5 MB, well past the tile threshold
    let res = Res::new(9, 9);
    let data = face_pixels(res, dt, 3);

    let mut w = PtexWriter::open(&path, MeshType::Quad, dt, 3, -1, 1, true).unwrap();
    assert!(w.write_face(0, &FaceInfo::new(res), &data, 0));
    w.close().unwrap();

    let r = PtexReader::open(&path, false).unwrap();
    let d = r.get_data(0).unwrap();
    assert!(d.is_tiled(), "face of this size should be tiled");
    assert!(d.num_tiles() > 1);
    assert!(d.tile_res().covers(Res::new(0, 0)));

    // whole-face assembly matches
    let mut actual = vec![0u8; data.len()];
    r.get_data_into(0, &mut actual, 0);
    assert_eq!(actual, data);

    // pixel probes through the tile grid
    let ps = r.pixel_size();
    let mut pix = vec![0u8; ps];
    for (u, v) in [(0usize, 0usize), (511, 0), (0, 511), (511, 511), (200, 300)] {
        d.get_pixel(u, v, &mut pix);
        let off = (v * res.u() + u) * ps;
        assert_eq!(&pix[..], &data[off..off + ps], "pixel ({u},{v})");
    }

    // an anisotropic reduction of a tiled face stays tiled along the
    // unreduced axis
    let half_u = Res::new(8, 9);
    let dh = r.get_data_at(0, half_u).unwrap();
    assert!(dh.is_tiled());
    let mut reduced = vec![0u8; half_u.size() * ps];
    r.get_data_into_at(0, &mut reduced, 0, half_u);
    let mut expected = vec![0u8; half_u.size() * ps];
    pixel::reduce_u(&data, res.u() * ps, res.u(), res.v(), &mut expected, half_u.u() * ps, dt, 3);
    assert_eq!(reduced, expected);
}

#[test]
fn corrupt_and_missing_files() {
    let dir = tempfile::tempdir().unwrap();

    let missing = dir.path().join("missing.ptx");
    assert!(PtexReader::open(&missing, false).is_err());

    let bad = dir.path().join("bad.ptx");
    std::fs::write(&bad, b"this is not a texture file at all").unwrap();
    let err = PtexReader::open(&bad, false).unwrap_err();
    assert!(err.to_string().contains("not a ptex file"), "{err}");

    // truncated file: valid magic, nothing else
    let trunc = dir.path().join("trunc.ptx");
    std::fs::write(&trunc, b"Ptex").unwrap();
    assert!(PtexReader::open(&trunc, false).is_err());
}

#[test]
fn out_of_range_requests() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("small.ptx");
    let dt = DataType::Float;
    let res = Res::new(2, 2);
    let data = face_pixels(res, dt, 3);

    let mut w = PtexWriter::open(&path, MeshType::Quad, dt, 3, -1, 1, false).unwrap();
    assert!(w.write_face(0, &FaceInfo::new(res), &data, 0));
    w.close().unwrap();

    let r = PtexReader::open(&path, false).unwrap();
    assert!(r.get_data(-1).is_none());
    assert!(r.get_data(1).is_none());
    // enlargement requests are refused without poisoning the reader
    assert!(r.get_data_at(0, Res::new(5, 5)).is_none());
    assert!(r.ok());

    // reading more channels than stored zero-fills the rest
    let mut out = [-1.0f32; 5];
    r.get_pixel(0, 0, 0, &mut out, 0, 5);
    assert_eq!(out[3], 0.0);
    assert_eq!(out[4], 0.0);
    assert!(out[0] >= 0.0);

    // a first-channel offset past the channel count zero-fills everything
    let mut out = [-1.0f32; 3];
    r.get_pixel(0, 1, 1, &mut out, 3, 3);
    assert_eq!(out, [0.0; 3]);
}
