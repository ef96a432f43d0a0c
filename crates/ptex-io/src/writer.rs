//! Texture file writer.
//!
//! Two modes share the block encoders here. The main writer builds a whole
//! file: face blocks and raw 2:1 reductions spool to an anonymous temp
//! file, the mipmap pyramid is generated at close by re-reducing the
//! spooled data in rfaceid order, and the result is assembled into
//! `<path>.new` and renamed over the target. The incremental writer appends
//! edit records to an existing file without touching its body; its records
//! are stored uncompressed since the next full save consolidates them.
//!
//! Both modes hold the advisory lock file for the output path from open to
//! close.

use crate::format::{self, EditFaceDataHeader, EditMetaDataHeader, EditType, Encoding, ExtHeader, FaceDataHeader, Header, LevelInfo};
use crate::lockfile::LockFile;
use crate::metadata;
use crate::reader::PtexReader;
use byteorder::{LittleEndian, WriteBytesExt};
use ptex_core::pixel;
use ptex_core::{BorderMode, DataType, FaceInfo, MeshType, MetaDataType, PtexError, Res, Result};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// zlib level for full saves.
const COMPRESS_LEVEL: u32 = 6;

/// zlib level for appended edits (stored, to be consolidated later).
const STORE_LEVEL: u32 = 0;

struct MetaEntry {
    mdt: MetaDataType,
    data: Vec<u8>,
}

/// State shared by both writer modes.
struct WriterBase {
    path: PathBuf,
    header: Header,
    ext_header: ExtHeader,
    pixel_size: usize,
    compress_level: u32,
    tile_spool: File,
    metadata: BTreeMap<String, MetaEntry>,
    error: Option<String>,
    _lock: LockFile,
}

impl WriterBase {
    fn new(
        path: &Path,
        lock: LockFile,
        mesh_type: MeshType,
        data_type: DataType,
        nchannels: usize,
        alphachan: i32,
        nfaces: usize,
        compress_level: u32,
    ) -> Result<WriterBase> {
        let header = Header {
            meshtype: mesh_type as u32,
            datatype: data_type as u32,
            alphachan,
            nchannels: nchannels as u16,
            nlevels: 0,
            nfaces: nfaces as u32,
            extheadersize: format::EXT_HEADER_SIZE as u32,
            ..Default::default()
        };
        Ok(WriterBase {
            path: path.to_path_buf(),
            pixel_size: header.pixel_size(),
            header,
            ext_header: ExtHeader::default(),
            compress_level,
            tile_spool: tempfile::tempfile()?,
            metadata: BTreeMap::new(),
            error: None,
            _lock: lock,
        })
    }

    fn set_error(&mut self, msg: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(msg.into());
        }
    }

    fn ok(&self) -> bool {
        self.error.is_none()
    }

    fn add_meta(&mut self, key: &str, mdt: MetaDataType, data: Vec<u8>) {
        if key.is_empty() || key.len() > 254 {
            self.set_error(format!("invalid metadata key: {key:?}"));
            return;
        }
        self.metadata.insert(key.to_string(), MetaEntry { mdt, data });
    }

    fn data_type(&self) -> DataType {
        self.header.data_type().unwrap_or_default()
    }

    fn nchan(&self) -> usize {
        self.header.nchannels as usize
    }

    /// Writes one constant face block and returns its header.
    fn write_const_face_block(&self, fp: &mut dyn Write, pixel: &[u8]) -> Result<FaceDataHeader> {
        fp.write_all(&pixel[..self.pixel_size])?;
        Ok(FaceDataHeader::new(self.pixel_size as u32, Encoding::Constant))
    }

    /// Deinterleaves, difference-codes and deflates one face image.
    fn write_face_block(&self, fp: &mut dyn Write, data: &[u8], stride: usize, res: Res) -> Result<FaceDataHeader> {
        let dt = self.data_type();
        let ures = res.u();
        let vres = res.v();
        let mut planar = vec![0u8; ures * vres * self.pixel_size];
        pixel::deinterleave(data, stride, ures, vres, &mut planar, ures * dt.size(), dt, self.nchan());

        let diff = matches!(dt, DataType::UInt8 | DataType::UInt16);
        if diff {
            pixel::encode_difference(&mut planar, dt);
        }
        let zipped = format::deflate(&planar, self.compress_level);
        fp.write_all(&zipped)?;
        Ok(FaceDataHeader::new(
            zipped.len() as u32,
            if diff { Encoding::DiffZipped } else { Encoding::Zipped },
        ))
    }

    /// Picks a tile resolution so tiles stay near the target tile size.
    fn calc_tile_res(&self, faceres: Res) -> Res {
        let facesize = faceres.size() * self.pixel_size;
        let q = (facesize / format::TILE_SIZE) as u32;
        if q < 2 {
            return faceres;
        }
        let ntileslog2 = q.ilog2() as i8;
        // solve tile_ulog2 + tile_vlog2 = ulog2 + vlog2 - ntileslog2 with a
        // roughly square tile no larger than the face
        let n = faceres.ulog2 + faceres.vlog2 - ntileslog2;
        let ulog2 = ((n + 1) / 2).min(faceres.ulog2);
        let vlog2 = (n - ulog2).min(faceres.vlog2);
        Res::new(ulog2, vlog2)
    }

    /// Writes one face, tiling it when the payload is large.
    fn write_face_data<F: Write + Seek>(
        &mut self,
        fp: &mut F,
        data: &[u8],
        stride: usize,
        res: Res,
    ) -> Result<FaceDataHeader> {
        let tileres = if self.header.mesh_type() == Some(MeshType::Triangle) {
            // triangle faces are never tiled
            res
        } else {
            self.calc_tile_res(res)
        };
        let ntilesu = res.ntiles_u(tileres);
        let ntilesv = res.ntiles_v(tileres);
        let ntiles = ntilesu * ntilesv;
        if ntiles == 1 {
            return self.write_face_block(fp, data, stride, res);
        }

        // spool tiles, then the compressed tile header, then assemble
        self.tile_spool.seek(SeekFrom::Start(0))?;
        self.tile_spool.set_len(0)?;
        let mut tile_headers = Vec::with_capacity(ntiles);
        let tile_ustride = tileres.u() * self.pixel_size;
        let mut datasize = 0u64;
        for tv in 0..ntilesv {
            for tu in 0..ntilesu {
                let off = tv * tileres.v() * stride + tu * tile_ustride;
                let tile = &data[off..];
                let tdh = if pixel::is_constant(tile, stride, tileres.u(), tileres.v(), self.pixel_size) {
                    self.write_const_face_block(&mut &self.tile_spool, tile)?
                } else {
                    self.write_face_block(&mut &self.tile_spool, tile, stride, tileres)?
                };
                datasize += tdh.blocksize() as u64;
                tile_headers.push(tdh);
            }
        }
        let header_zip = format::deflate(&format::face_data_headers_bytes(&tile_headers), self.compress_level);
        (&self.tile_spool).write_all(&header_zip)?;

        let mut total = 0u64;
        fp.write_u16::<LittleEndian>(tileres.to_u16())?;
        fp.write_u32::<LittleEndian>(header_zip.len() as u32)?;
        total += 6;
        total += copy_block(fp, &mut self.tile_spool, datasize, header_zip.len() as u64)?;
        total += copy_block(fp, &mut self.tile_spool, 0, datasize)?;
        Ok(FaceDataHeader::new(total as u32, Encoding::Tiled))
    }

    /// Writes the raw 2:1 reduction of an image (uncompressed, spool only).
    fn write_reduction<F: Write>(&self, fp: &mut F, data: &[u8], stride: usize, res: Res) -> Result<()> {
        let newres = Res::new(res.ulog2 - 1, res.vlog2 - 1);
        let mut buff = vec![0u8; newres.size() * self.pixel_size];
        let dstride = newres.u() * self.pixel_size;
        let reducefn: pixel::ReduceFn = if self.header.mesh_type() == Some(MeshType::Triangle) {
            pixel::reduce_tri
        } else {
            pixel::reduce
        };
        reducefn(data, stride, res.u(), res.v(), &mut buff, dstride, self.data_type(), self.nchan());
        fp.write_all(&buff)?;
        Ok(())
    }

    /// Serialises all metadata entries no larger than `limit` into one
    /// block; returns `(memsize, zip)`.
    fn small_meta_block(&self, limit: usize) -> (u32, Vec<u8>) {
        let mut block = Vec::new();
        for (key, e) in &self.metadata {
            if e.data.len() <= limit {
                metadata::encode_entry(&mut block, key, e.mdt, &e.data);
            }
        }
        if block.is_empty() {
            return (0, Vec::new());
        }
        let zip = format::deflate(&block, self.compress_level);
        (block.len() as u32, zip)
    }
}

/// Writer handle; see [`PtexWriter::open`] and [`PtexWriter::edit`].
pub struct PtexWriter {
    kind: WriterKind,
}

enum WriterKind {
    Main(MainWriter),
    Incr(IncrWriter),
}

impl PtexWriter {
    /// Creates a new texture file (replacing any existing one at close).
    pub fn open(
        path: impl AsRef<Path>,
        mesh_type: MeshType,
        data_type: DataType,
        nchannels: usize,
        alphachan: i32,
        nfaces: usize,
        genmipmaps: bool,
    ) -> Result<PtexWriter> {
        let path = path.as_ref();
        check_format(mesh_type, nchannels, alphachan)?;
        let lock = LockFile::acquire(path)?;
        let main = MainWriter::new(path, lock, mesh_type, data_type, nchannels, alphachan, nfaces, genmipmaps, true)?;
        Ok(PtexWriter { kind: WriterKind::Main(main) })
    }

    /// Edits an existing file. With `incremental` set the changes are
    /// appended as edit records; otherwise the file is consolidated and
    /// fully rewritten. A missing file falls back to a fresh create.
    pub fn edit(
        path: impl AsRef<Path>,
        incremental: bool,
        mesh_type: MeshType,
        data_type: DataType,
        nchannels: usize,
        alphachan: i32,
        nfaces: usize,
        genmipmaps: bool,
    ) -> Result<PtexWriter> {
        let path = path.as_ref();
        check_format(mesh_type, nchannels, alphachan)?;
        let lock = LockFile::acquire(path)?;
        let exists = path.exists();
        if incremental && exists {
            let incr = IncrWriter::new(path, lock, mesh_type, data_type, nchannels, alphachan, nfaces)?;
            return Ok(PtexWriter { kind: WriterKind::Incr(incr) });
        }
        let main = MainWriter::new(path, lock, mesh_type, data_type, nchannels, alphachan, nfaces, genmipmaps, !exists)?;
        Ok(PtexWriter { kind: WriterKind::Main(main) })
    }

    /// Records border modes in the extended header.
    pub fn set_border_modes(&mut self, u: BorderMode, v: BorderMode) {
        let base = self.base_mut();
        base.ext_header.ubordermode = u as u32;
        base.ext_header.vbordermode = v as u32;
    }

    /// Writes or overwrites a string metadata value.
    pub fn write_meta_string(&mut self, key: &str, value: &str) {
        let mut data = value.as_bytes().to_vec();
        data.push(0);
        self.base_mut().add_meta(key, MetaDataType::String, data);
    }

    /// Writes or overwrites an i8 array metadata value.
    pub fn write_meta_i8(&mut self, key: &str, value: &[i8]) {
        let data = value.iter().map(|&v| v as u8).collect();
        self.base_mut().add_meta(key, MetaDataType::Int8, data);
    }

    /// Writes or overwrites an i16 array metadata value.
    pub fn write_meta_i16(&mut self, key: &str, value: &[i16]) {
        let data = value.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.base_mut().add_meta(key, MetaDataType::Int16, data);
    }

    /// Writes or overwrites an i32 array metadata value.
    pub fn write_meta_i32(&mut self, key: &str, value: &[i32]) {
        let data = value.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.base_mut().add_meta(key, MetaDataType::Int32, data);
    }

    /// Writes or overwrites an f32 array metadata value.
    pub fn write_meta_f32(&mut self, key: &str, value: &[f32]) {
        let data = value.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.base_mut().add_meta(key, MetaDataType::Float, data);
    }

    /// Writes or overwrites an f64 array metadata value.
    pub fn write_meta_f64(&mut self, key: &str, value: &[f64]) {
        let data = value.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.base_mut().add_meta(key, MetaDataType::Double, data);
    }

    /// Writes a face image. `stride` is the source row length in bytes
    /// (0 = packed). Returns false after any writer error.
    pub fn write_face(&mut self, faceid: i32, info: &FaceInfo, data: &[u8], stride: usize) -> bool {
        match &mut self.kind {
            WriterKind::Main(w) => w.write_face(faceid, info, data, stride),
            WriterKind::Incr(w) => w.write_face(faceid, info, data, stride),
        }
    }

    /// Writes a single-valued face.
    pub fn write_constant_face(&mut self, faceid: i32, info: &FaceInfo, pixel: &[u8]) -> bool {
        match &mut self.kind {
            WriterKind::Main(w) => w.write_constant_face(faceid, info, pixel),
            WriterKind::Incr(w) => w.write_constant_face(faceid, info, pixel),
        }
    }

    /// Finishes the file. Any error recorded during writing surfaces here.
    pub fn close(self) -> Result<()> {
        match self.kind {
            WriterKind::Main(w) => w.close(),
            WriterKind::Incr(w) => w.close(),
        }
    }

    fn base_mut(&mut self) -> &mut WriterBase {
        match &mut self.kind {
            WriterKind::Main(w) => &mut w.base,
            WriterKind::Incr(w) => &mut w.base,
        }
    }
}

fn check_format(_mesh_type: MeshType, nchannels: usize, alphachan: i32) -> Result<()> {
    if cfg!(target_endian = "big") {
        return Err(PtexError::BigEndianHost);
    }
    if nchannels == 0 || nchannels > u16::MAX as usize {
        return Err(PtexError::InvalidArgument("invalid number of channels".into()));
    }
    if alphachan != -1 && (alphachan < 0 || alphachan as usize >= nchannels) {
        return Err(PtexError::InvalidArgument("invalid alpha channel".into()));
    }
    Ok(())
}

struct LevelRec {
    pos: Vec<u64>,
    fdh: Vec<FaceDataHeader>,
}

impl LevelRec {
    fn sized(n: usize) -> LevelRec {
        LevelRec { pos: vec![0; n], fdh: vec![FaceDataHeader::default(); n] }
    }
}

struct MainWriter {
    base: WriterBase,
    spool: File,
    new_path: PathBuf,
    genmipmaps: bool,
    has_new_data: bool,
    face_info: Vec<FaceInfo>,
    const_data: Vec<u8>,
    levels: Vec<LevelRec>,
    rpos: Vec<u64>,
    reader: Option<Arc<PtexReader>>,
}

/// Marks a face slot not yet written.
const UNWRITTEN: u8 = u8::MAX;

impl MainWriter {
    #[allow(clippy::too_many_arguments)]
    fn new(
        path: &Path,
        lock: LockFile,
        mesh_type: MeshType,
        data_type: DataType,
        nchannels: usize,
        alphachan: i32,
        nfaces: usize,
        genmipmaps: bool,
        newfile: bool,
    ) -> Result<MainWriter> {
        let base = WriterBase::new(path, lock, mesh_type, data_type, nchannels, alphachan, nfaces, COMPRESS_LEVEL)?;

        let mut face_info = vec![FaceInfo::default(); nfaces];
        for f in &mut face_info {
            f.flags = UNWRITTEN;
        }

        let mut w = MainWriter {
            spool: tempfile::tempfile()?,
            new_path: with_suffix(path, ".new"),
            genmipmaps,
            has_new_data: false,
            face_info,
            const_data: vec![0u8; nfaces * base.pixel_size],
            levels: vec![LevelRec::sized(nfaces)],
            rpos: vec![0; nfaces],
            reader: None,
            base,
        };

        if !newfile {
            // consolidating an existing file: carry its metadata forward and
            // pick up any edits
            let reader = PtexReader::open(path, false)?;
            if reader.mesh_type() != mesh_type
                || reader.data_type() != data_type
                || reader.num_channels() != nchannels
                || reader.alpha_channel() != alphachan
                || reader.num_faces() != nfaces
            {
                return Err(PtexError::InvalidArgument(
                    "header doesn't match existing file, conversions not currently supported".into(),
                ));
            }
            if let Some(meta) = reader.get_meta_data() {
                let keys: Vec<(String, MetaDataType)> =
                    meta.keys().map(|(k, t)| (k.to_string(), t)).collect();
                for (key, mdt) in keys {
                    if let Some(bytes) = meta.get_bytes(&key) {
                        w.base.add_meta(&key, mdt, bytes);
                    }
                }
            }
            w.base.ext_header.ubordermode = reader.u_border_mode() as u32;
            w.base.ext_header.vbordermode = reader.v_border_mode() as u32;
            w.has_new_data = reader.has_edits();
            w.reader = Some(reader);
        }
        Ok(w)
    }

    fn valid_face(&mut self, faceid: i32, info: &FaceInfo) -> bool {
        if !self.base.ok() {
            return false;
        }
        if faceid < 0 || faceid as usize >= self.face_info.len() {
            self.base.set_error("faceid out of range");
            return false;
        }
        if self.base.header.mesh_type() == Some(MeshType::Triangle) && info.res.ulog2 != info.res.vlog2 {
            self.base.set_error("triangle faces must have ulog2 == vlog2");
            return false;
        }
        true
    }

    fn write_face(&mut self, faceid: i32, info: &FaceInfo, data: &[u8], stride: usize) -> bool {
        if !self.valid_face(faceid, info) {
            return false;
        }
        let stride = if stride == 0 { info.res.u() * self.base.pixel_size } else { stride };

        if pixel::is_constant(data, stride, info.res.u(), info.res.v(), self.base.pixel_size) {
            return self.write_constant_face(faceid, info, data);
        }
        let faceid = faceid as usize;

        let mut f = *info;
        f.flags = info.flags & FaceInfo::FLAG_SUBFACE;
        self.face_info[faceid] = f;

        let res = f.res;
        let pos = match self.spool.seek(SeekFrom::End(0)) {
            Ok(p) => p,
            Err(e) => {
                self.base.set_error(e.to_string());
                return false;
            }
        };
        self.levels[0].pos[faceid] = pos;
        let fdh = {
            let mut spool = match self.spool.try_clone() {
                Ok(s) => s,
                Err(e) => {
                    self.base.set_error(e.to_string());
                    return false;
                }
            };
            match self.base.write_face_data(&mut spool, data, stride, res) {
                Ok(h) => h,
                Err(e) => {
                    self.base.set_error(e.to_string());
                    return false;
                }
            }
        };
        self.levels[0].fdh[faceid] = fdh;

        // premultiply before reducing so the pyramid and the const value
        // are filtered in premultiplied space
        let mut premult;
        let (rdata, rstride) = if self.base.header.has_alpha() {
            let rowlen = res.u() * self.base.pixel_size;
            premult = vec![0u8; rowlen * res.v()];
            pixel::copy(data, stride, &mut premult, rowlen, res.v(), rowlen);
            pixel::mult_alpha(
                &mut premult,
                res.size(),
                self.base.data_type(),
                self.base.nchan(),
                self.base.header.alphachan as usize,
            );
            (&premult[..], rowlen)
        } else {
            (data, stride)
        };

        let result = if self.genmipmaps
            && res.ulog2 > format::MIN_REDUCTION_LOG2
            && res.vlog2 > format::MIN_REDUCTION_LOG2
        {
            self.spool
                .seek(SeekFrom::End(0))
                .map_err(PtexError::from)
                .and_then(|p| {
                    self.rpos[faceid] = p;
                    let mut spool = self.spool.try_clone()?;
                    self.base.write_reduction(&mut spool, rdata, rstride, res)
                })
        } else {
            self.store_const_value(faceid, rdata, rstride, res);
            Ok(())
        };
        if let Err(e) = result {
            self.base.set_error(e.to_string());
            return false;
        }
        self.has_new_data = true;
        true
    }

    fn write_constant_face(&mut self, faceid: i32, info: &FaceInfo, pixel: &[u8]) -> bool {
        if !self.valid_face(faceid, info) {
            return false;
        }
        let faceid = faceid as usize;
        let mut f = *info;
        f.flags = FaceInfo::FLAG_CONSTANT | (info.flags & FaceInfo::FLAG_SUBFACE);
        self.face_info[faceid] = f;
        let ps = self.base.pixel_size;
        self.const_data[faceid * ps..(faceid + 1) * ps].copy_from_slice(&pixel[..ps]);
        self.has_new_data = true;
        true
    }

    /// Stores a face's average value in the const-data block.
    fn store_const_value(&mut self, faceid: usize, data: &[u8], stride: usize, res: Res) {
        let ps = self.base.pixel_size;
        let dt = self.base.data_type();
        let nchan = self.base.nchan();
        let dst = &mut self.const_data[faceid * ps..(faceid + 1) * ps];
        pixel::average(data, stride, res.u(), res.v(), dst, dt, nchan);
        if self.base.header.has_alpha() {
            pixel::div_alpha(dst, 1, dt, nchan, self.base.header.alphachan as usize);
        }
    }

    fn close(mut self) -> Result<()> {
        if self.base.ok() {
            if let Err(e) = self.finish() {
                self.base.set_error(e.to_string());
            }
        }
        if let Some(msg) = self.base.error.take() {
            let _ = std::fs::remove_file(&self.new_path);
            return Err(PtexError::WriteFailed(msg));
        }
        if self.has_new_data {
            if let Err(e) = std::fs::rename(&self.new_path, &self.base.path) {
                let _ = std::fs::remove_file(&self.new_path);
                return Err(PtexError::WriteFailed(format!(
                    "can't write to ptex file {}: {e}",
                    self.base.path.display()
                )));
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if !self.has_new_data {
            return Ok(());
        }

        // carry forward faces not rewritten in this session
        if let Some(reader) = self.reader.take() {
            for i in 0..self.face_info.len() {
                if self.face_info[i].flags != UNWRITTEN {
                    continue;
                }
                let info = reader.get_face_info(i as i32);
                if info.is_constant() {
                    match reader.get_data(i as i32) {
                        Some(d) => {
                            let pixel = d.data().unwrap().to_vec();
                            self.write_constant_face(i as i32, &info, &pixel);
                        }
                        None => return Err(PtexError::corrupt("can't read existing face")),
                    }
                } else {
                    let size = info.res.size() * self.base.pixel_size;
                    let mut buf = vec![0u8; size];
                    reader.get_data_into(i as i32, &mut buf, 0);
                    if !reader.ok() {
                        return Err(PtexError::corrupt("can't read existing face"));
                    }
                    self.write_face(i as i32, &info, &buf, 0);
                }
            }
            if !self.base.ok() {
                return Err(PtexError::WriteFailed(self.base.error.clone().unwrap_or_default()));
            }
        } else {
            // unwritten faces become constant black
            for f in &mut self.face_info {
                if f.flags == UNWRITTEN {
                    f.flags = FaceInfo::FLAG_CONSTANT;
                }
            }
        }

        if self.genmipmaps {
            self.generate_reductions()?;
        }

        self.base.header.nlevels = self.levels.len() as u16;

        let file = File::create(&self.new_path)?;
        let mut out = BufWriter::new(file);

        // blank header and ext header, rewritten at the end
        out.write_all(&vec![0u8; format::HEADER_SIZE + format::EXT_HEADER_SIZE])?;

        // face info
        let mut fi_bytes = Vec::with_capacity(self.face_info.len() * format::FACE_INFO_SIZE);
        for f in &self.face_info {
            format::write_face_info(&mut fi_bytes, f)?;
        }
        let fi_zip = format::deflate(&fi_bytes, self.base.compress_level);
        out.write_all(&fi_zip)?;
        self.base.header.faceinfosize = fi_zip.len() as u32;

        // const data
        let cd_zip = format::deflate(&self.const_data, self.base.compress_level);
        out.write_all(&cd_zip)?;
        self.base.header.constdatasize = cd_zip.len() as u32;

        // blank level info, rewritten once level sizes are known
        let level_info_pos = out.stream_position()?;
        out.write_all(&vec![0u8; format::LEVEL_INFO_SIZE * self.levels.len()])?;
        self.base.header.levelinfosize = (format::LEVEL_INFO_SIZE * self.levels.len()) as u32;

        // level data
        let mut level_info = Vec::with_capacity(self.levels.len());
        self.base.header.leveldatasize = 0;
        for level in &self.levels {
            let hdr_zip = format::deflate(&format::face_data_headers_bytes(&level.fdh), self.base.compress_level);
            out.write_all(&hdr_zip)?;
            let mut info = LevelInfo {
                leveldatasize: hdr_zip.len() as u64,
                levelheadersize: hdr_zip.len() as u32,
                nfaces: level.fdh.len() as u32,
            };
            for (i, fdh) in level.fdh.iter().enumerate() {
                if fdh.encoding() == Encoding::Constant {
                    // level-0 constant faces live in the const-data block
                    continue;
                }
                info.leveldatasize += copy_block(&mut out, &mut self.spool, level.pos[i], fdh.blocksize() as u64)?;
            }
            self.base.header.leveldatasize += info.leveldatasize;
            level_info.push(info);
        }

        // metadata: small entries in one block, large ones split out
        let (memsize, zip) = self.base.small_meta_block(format::METADATA_INLINE_THRESHOLD);
        self.base.ext_header.metadatamemsize = memsize;
        self.base.ext_header.metadatazipsize = zip.len() as u32;
        out.write_all(&zip)?;

        let mut lmd_headers = Vec::new();
        let mut lmd_bodies: Vec<Vec<u8>> = Vec::new();
        for (key, e) in &self.base.metadata {
            if e.data.len() > format::METADATA_INLINE_THRESHOLD {
                let body = format::deflate(&e.data, self.base.compress_level);
                metadata::encode_large_header(&mut lmd_headers, key, e.mdt, e.data.len() as u32, body.len() as u32);
                lmd_bodies.push(body);
            }
        }
        if lmd_headers.is_empty() {
            self.base.ext_header.lmdheadermemsize = 0;
            self.base.ext_header.lmdheaderzipsize = 0;
            self.base.ext_header.lmddatasize = 0;
        } else {
            let hdr_zip = format::deflate(&lmd_headers, self.base.compress_level);
            self.base.ext_header.lmdheadermemsize = lmd_headers.len() as u32;
            self.base.ext_header.lmdheaderzipsize = hdr_zip.len() as u32;
            out.write_all(&hdr_zip)?;
            let mut total = 0u64;
            for body in &lmd_bodies {
                out.write_all(body)?;
                total += body.len() as u64;
            }
            self.base.ext_header.lmddatasize = total;
        }

        // rewrite level info and headers now that sizes are final
        out.seek(SeekFrom::Start(level_info_pos))?;
        for info in &level_info {
            info.write(&mut out)?;
        }
        out.seek(SeekFrom::Start(0))?;
        self.base.header.write(&mut out)?;
        self.base.ext_header.write(&mut out)?;
        out.flush()?;
        debug!(path = %self.base.path.display(), nlevels = self.levels.len(), "ptex file assembled");
        Ok(())
    }

    /// Builds the mipmap pyramid from the spooled level-1 reductions.
    fn generate_reductions(&mut self) -> Result<()> {
        let nfaces = self.face_info.len();
        let (_, faceids_r) = pixel::gen_rfaceids(&self.face_info);

        // size the levels: level L keeps the rfaceid prefix whose smaller
        // dimension still exceeds the cutoff
        let mut cutoff = format::MIN_REDUCTION_LOG2;
        for rfaceid in (0..nfaces).rev() {
            let f = &self.face_info[faceids_r[rfaceid] as usize];
            let min = if f.is_constant() { 1 } else { f.res.ulog2.min(f.res.vlog2) };
            while min > cutoff {
                self.levels.push(LevelRec::sized(rfaceid + 1));
                cutoff += 1;
            }
        }

        let ps = self.base.pixel_size;
        let nlevels = self.levels.len();
        for li in 1..nlevels {
            let level_size = self.levels[li].fdh.len();
            let next_size = if li + 1 < nlevels { self.levels[li + 1].fdh.len() } else { 0 };
            for rfaceid in 0..level_size {
                let faceid = faceids_r[rfaceid] as usize;
                let mut res = self.face_info[faceid].res;
                res.ulog2 -= li as i8;
                res.vlog2 -= li as i8;
                let stride = res.u() * ps;
                let size = res.size() * ps;

                // read back the reduction written by the previous pass
                let mut buff = vec![0u8; size];
                self.spool.seek(SeekFrom::Start(self.rpos[faceid]))?;
                self.spool.read_exact(&mut buff)?;

                let pos = self.spool.seek(SeekFrom::End(0))?;
                self.levels[li].pos[rfaceid] = pos;
                let fdh = {
                    let mut spool = self.spool.try_clone()?;
                    self.base.write_face_data(&mut spool, &buff, stride, res)?
                };
                self.levels[li].fdh[rfaceid] = fdh;

                if rfaceid < next_size {
                    // write the next reduction in place (it shrinks, so it
                    // fits in the same spool region)
                    self.spool.seek(SeekFrom::Start(self.rpos[faceid]))?;
                    let mut spool = self.spool.try_clone()?;
                    self.base.write_reduction(&mut spool, &buff, stride, res)?;
                } else {
                    self.store_const_value(faceid, &buff, stride, res);
                }
            }
        }
        self.spool.seek(SeekFrom::End(0))?;
        Ok(())
    }
}

struct IncrWriter {
    base: WriterBase,
    file: File,
}

impl IncrWriter {
    fn new(
        path: &Path,
        lock: LockFile,
        mesh_type: MeshType,
        data_type: DataType,
        nchannels: usize,
        alphachan: i32,
        nfaces: usize,
    ) -> Result<IncrWriter> {
        // confirm the existing header matches before appending
        let existing = PtexReader::open(path, false)?;
        if existing.mesh_type() != mesh_type
            || existing.data_type() != data_type
            || existing.num_channels() != nchannels
            || existing.alpha_channel() != alphachan
            || existing.num_faces() != nfaces
        {
            return Err(PtexError::InvalidArgument(
                "header doesn't match existing file, conversions not currently supported".into(),
            ));
        }
        drop(existing);

        let mut file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
        file.seek(SeekFrom::End(0))?;
        let base = WriterBase::new(path, lock, mesh_type, data_type, nchannels, alphachan, nfaces, STORE_LEVEL)?;
        Ok(IncrWriter { base, file })
    }

    fn write_face(&mut self, faceid: i32, info: &FaceInfo, data: &[u8], stride: usize) -> bool {
        if !self.base.ok() {
            return false;
        }
        if faceid < 0 || faceid as usize >= self.base.header.nfaces as usize {
            return false;
        }
        let stride = if stride == 0 { info.res.u() * self.base.pixel_size } else { stride };
        if pixel::is_constant(data, stride, info.res.u(), info.res.v(), self.base.pixel_size) {
            return self.write_constant_face(faceid, info, data);
        }

        if let Err(e) = self.write_face_record(faceid, info, data, stride) {
            self.base.set_error(e.to_string());
            return false;
        }
        true
    }

    fn write_face_record(&mut self, faceid: i32, info: &FaceInfo, data: &[u8], stride: usize) -> Result<()> {
        let ps = self.base.pixel_size;
        let dt = self.base.data_type();
        let nchan = self.base.nchan();
        let res = info.res;

        // the record stores the face's average as its constant value
        let mut constval = vec![0u8; ps];
        if self.base.header.has_alpha() {
            let rowlen = res.u() * ps;
            let mut temp = vec![0u8; rowlen * res.v()];
            pixel::copy(data, stride, &mut temp, rowlen, res.v(), rowlen);
            pixel::mult_alpha(&mut temp, res.size(), dt, nchan, self.base.header.alphachan as usize);
            pixel::average(&temp, rowlen, res.u(), res.v(), &mut constval, dt, nchan);
            pixel::div_alpha(&mut constval, 1, dt, nchan, self.base.header.alphachan as usize);
        } else {
            pixel::average(data, stride, res.u(), res.v(), &mut constval, dt, nchan);
        }

        // reserve the record header, write the payload, then back-patch
        let record_pos = self.file.seek(SeekFrom::End(0))?;
        let reserved = 5 + format::EDIT_FACE_DATA_HEADER_SIZE;
        self.file.write_all(&vec![0u8; reserved])?;
        self.file.write_all(&constval)?;
        let fdh = {
            let mut file = self.file.try_clone()?;
            self.base.write_face_data(&mut file, data, stride, res)?
        };

        let mut f = *info;
        f.flags = info.flags & FaceInfo::FLAG_SUBFACE;
        let efdh = EditFaceDataHeader { faceid: faceid as u32, faceinfo: f, fdh };
        let editsize = (format::EDIT_FACE_DATA_HEADER_SIZE + ps) as u32 + fdh.blocksize();

        self.file.seek(SeekFrom::Start(record_pos))?;
        self.file.write_u8(EditType::FaceData as u8)?;
        self.file.write_u32::<LittleEndian>(editsize)?;
        efdh.write(&mut self.file)?;
        self.file.seek(SeekFrom::End(0))?;
        Ok(())
    }

    fn write_constant_face(&mut self, faceid: i32, info: &FaceInfo, pixel: &[u8]) -> bool {
        if !self.base.ok() {
            return false;
        }
        if faceid < 0 || faceid as usize >= self.base.header.nfaces as usize {
            return false;
        }
        let ps = self.base.pixel_size;
        let mut f = *info;
        f.flags = FaceInfo::FLAG_CONSTANT | (info.flags & FaceInfo::FLAG_SUBFACE);
        let efdh = EditFaceDataHeader {
            faceid: faceid as u32,
            faceinfo: f,
            fdh: FaceDataHeader::new(0, Encoding::Constant),
        };
        let editsize = (format::EDIT_FACE_DATA_HEADER_SIZE + ps) as u32;

        let result = (|| -> Result<()> {
            self.file.seek(SeekFrom::End(0))?;
            self.file.write_u8(EditType::FaceData as u8)?;
            self.file.write_u32::<LittleEndian>(editsize)?;
            efdh.write(&mut self.file)?;
            self.file.write_all(&pixel[..ps])?;
            Ok(())
        })();
        if let Err(e) = result {
            self.base.set_error(e.to_string());
            return false;
        }
        true
    }

    fn close(mut self) -> Result<()> {
        if self.base.ok() && !self.base.metadata.is_empty() {
            // metadata goes out as one appended edit record
            let (memsize, zip) = self.base.small_meta_block(usize::MAX);
            let emdh = EditMetaDataHeader {
                metadatazipsize: zip.len() as u32,
                metadatamemsize: memsize,
            };
            let result = (|| -> Result<()> {
                self.file.seek(SeekFrom::End(0))?;
                self.file.write_u8(EditType::MetaData as u8)?;
                self.file
                    .write_u32::<LittleEndian>(format::EDIT_META_DATA_HEADER_SIZE as u32 + zip.len() as u32)?;
                emdh.write(&mut self.file)?;
                self.file.write_all(&zip)?;
                self.file.flush()?;
                Ok(())
            })();
            if let Err(e) = result {
                self.base.set_error(e.to_string());
            }
        }
        match self.base.error.take() {
            Some(msg) => Err(PtexError::WriteFailed(msg)),
            None => Ok(()),
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

/// Copies `size` bytes from `src` at `pos` to `dst` in chunks.
fn copy_block<W: Write>(dst: &mut W, src: &mut File, pos: u64, size: u64) -> Result<u64> {
    src.seek(SeekFrom::Start(pos))?;
    let mut remain = size;
    let mut buf = vec![0u8; format::BLOCK_SIZE];
    while remain > 0 {
        let n = remain.min(format::BLOCK_SIZE as u64) as usize;
        src.read_exact(&mut buf[..n])?;
        dst.write_all(&buf[..n])?;
        remain -= n as u64;
    }
    Ok(size)
}
