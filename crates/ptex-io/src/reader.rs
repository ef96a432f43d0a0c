//! Random-access texture reader.
//!
//! Opening a file eagerly reads the headers, the per-face info, the
//! per-face constant pixels and the appended edit records; everything else
//! (mipmap levels, face blocks, tiles, metadata) loads lazily under the
//! per-reader read lock and is published once. Reductions that are neither
//! the top resolution nor a stored level are synthesized on demand and
//! memoised per reader.
//!
//! Any I/O or decode failure puts the reader into a sticky failed state;
//! later data requests return `None` without retrying.

use crate::cache::PtexCache;
use crate::facedata::{DataSlot, FaceBody, FaceData, TileSource, TiledFace};
use crate::format::{self, EditFaceDataHeader, EditMetaDataHeader, EditType, Encoding, ExtHeader, FaceDataHeader, Header, LevelInfo};
use crate::handler::{DefaultInputHandler, InputHandler, InputSource};
use crate::metadata::{LargeMeta, MetaData};
use byteorder::{ByteOrder, LittleEndian};
use ptex_core::pixel;
use ptex_core::{BorderMode, DataType, FaceInfo, MeshType, PtexError, Res, Result};
use std::any::Any;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use tracing::warn;

/// File handle plus current position, guarded by the per-reader read lock.
pub(crate) struct ReaderIo {
    src: Option<Box<dyn InputSource>>,
    pos: u64,
}

impl ReaderIo {
    fn seek(&mut self, pos: u64) -> Result<()> {
        if pos != self.pos {
            self.src
                .as_mut()
                .ok_or_else(|| PtexError::corrupt("file handle closed"))?
                .seek(pos)?;
            self.pos = pos;
        }
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.src
            .as_mut()
            .ok_or_else(|| PtexError::corrupt("file handle closed"))?
            .read_exact(buf)
            .map_err(|_| PtexError::corrupt("read failed (EOF)"))?;
        self.pos += buf.len() as u64;
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read_exact(&mut b)?;
        Ok(b[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        let mut b = [0u8; 2];
        self.read_exact(&mut b)?;
        Ok(LittleEndian::read_u16(&b))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b)?;
        Ok(LittleEndian::read_u32(&b))
    }

    fn read_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Reads and inflates a zlib block of `zipsize` bytes, expecting
    /// `memsize` bytes out.
    fn read_zip(&mut self, zipsize: usize, memsize: usize) -> Result<Vec<u8>> {
        let zip = self.read_vec(zipsize)?;
        format::inflate(&zip, memsize)
    }
}

/// One mipmap level: face block headers, offsets and lazily-filled faces.
pub(crate) struct Level {
    fdh: Vec<FaceDataHeader>,
    offsets: Vec<u64>,
    faces: Vec<DataSlot>,
}

struct FaceEdit {
    pos: u64,
    faceid: usize,
    fdh: FaceDataHeader,
}

struct MetaEdit {
    pos: u64,
    zipsize: u32,
    memsize: u32,
}

/// An open per-face texture file.
///
/// Cheap accessors never touch the file; data requests may read and decode
/// lazily. All methods are thread-safe.
pub struct PtexReader {
    self_ref: Weak<PtexReader>,
    cache: Weak<PtexCache>,
    premultiply: bool,
    path: PathBuf,
    handler: Arc<dyn InputHandler>,

    header: Header,
    ext_header: ExtHeader,
    pixel_size: usize,

    faceinfo_pos: u64,
    constdata_pos: u64,
    levelinfo_pos: u64,
    leveldata_pos: u64,
    metadata_pos: u64,
    lmdheader_pos: u64,
    lmddata_pos: u64,
    editdata_pos: u64,

    face_info: Vec<FaceInfo>,
    rfaceids: Vec<u32>,
    const_data: Vec<u8>,
    level_info: Vec<LevelInfo>,
    level_pos: Vec<u64>,
    has_edits: bool,
    face_edits: Vec<FaceEdit>,
    meta_edits: Vec<MetaEdit>,

    io: Mutex<ReaderIo>,
    handle_is_open: AtomicBool,
    levels: Vec<OnceLock<Arc<Level>>>,
    metadata: OnceLock<Arc<MetaData>>,
    reductions: RwLock<HashMap<(u32, Res), Arc<FaceData>>>,
    error: OnceLock<String>,
}

impl std::fmt::Debug for PtexReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtexReader").field("path", &self.path).finish()
    }
}

impl PtexReader {
    /// Opens a texture file outside any cache.
    pub fn open(path: impl AsRef<Path>, premultiply: bool) -> Result<Arc<PtexReader>> {
        Self::open_with(path.as_ref(), premultiply, Arc::new(DefaultInputHandler), Weak::new())
    }

    /// Opens a texture file with a custom I/O handler.
    pub fn open_with_handler(
        path: impl AsRef<Path>,
        premultiply: bool,
        handler: Arc<dyn InputHandler>,
    ) -> Result<Arc<PtexReader>> {
        Self::open_with(path.as_ref(), premultiply, handler, Weak::new())
    }

    pub(crate) fn open_with(
        path: &Path,
        premultiply: bool,
        handler: Arc<dyn InputHandler>,
        cache: Weak<PtexCache>,
    ) -> Result<Arc<PtexReader>> {
        if cfg!(target_endian = "big") {
            return Err(PtexError::BigEndianHost);
        }

        let src = handler
            .open(path)
            .map_err(|_| PtexError::FileNotFound { path: path.to_path_buf() })?;
        let mut io = ReaderIo { src: Some(src), pos: 0 };

        // header
        let magic = io.read_u32().map_err(|_| PtexError::BadMagic { path: path.to_path_buf() })?;
        if magic != format::MAGIC {
            return Err(PtexError::BadMagic { path: path.to_path_buf() });
        }
        let version = io.read_u32()?;
        if version != format::VERSION {
            return Err(PtexError::UnsupportedVersion { version, path: path.to_path_buf() });
        }
        let body = io.read_vec(format::HEADER_SIZE - 8)?;
        let header = Header::read_body(&mut &body[..])?;
        header
            .mesh_type()
            .ok_or_else(|| PtexError::corrupt("invalid mesh type"))?;
        header
            .data_type()
            .ok_or_else(|| PtexError::corrupt("invalid data type"))?;
        if header.nchannels == 0 {
            return Err(PtexError::corrupt("zero channels"));
        }
        let pixel_size = header.pixel_size();
        let nfaces = header.nfaces as usize;

        // extended header, tolerant of shorter and longer layouts
        let ehs = header.extheadersize as usize;
        let ext_header = if ehs == 0 {
            ExtHeader::default()
        } else {
            let eh = ExtHeader::read(&mut io_reader(&mut io, ehs.min(format::EXT_HEADER_SIZE))?, ehs)?;
            if ehs > format::EXT_HEADER_SIZE {
                io.seek((format::HEADER_SIZE + ehs) as u64)?;
            }
            eh
        };

        // section positions, left to right
        let mut pos = (format::HEADER_SIZE + ehs) as u64;
        let faceinfo_pos = pos;
        pos += header.faceinfosize as u64;
        let constdata_pos = pos;
        pos += header.constdatasize as u64;
        let levelinfo_pos = pos;
        pos += header.levelinfosize as u64;
        let leveldata_pos = pos;
        pos += header.leveldatasize;
        let metadata_pos = pos;
        pos += ext_header.metadatazipsize as u64;
        let lmdheader_pos = pos;
        pos += ext_header.lmdheaderzipsize as u64;
        let lmddata_pos = pos;
        pos += ext_header.lmddatasize;
        let editdata_pos = pos;

        // face info
        io.seek(faceinfo_pos)?;
        let fi_bytes = io.read_zip(header.faceinfosize as usize, nfaces * format::FACE_INFO_SIZE)?;
        let mut face_info = Vec::with_capacity(nfaces);
        {
            let mut b = &fi_bytes[..];
            for _ in 0..nfaces {
                face_info.push(format::read_face_info(&mut b)?);
            }
        }

        // reduction ordering is derived from the pre-edit face info; edited
        // faces never use the stored levels
        let (rfaceids, _faceids_r) = pixel::gen_rfaceids(&face_info);

        // constant pixels
        io.seek(constdata_pos)?;
        let mut const_data = io.read_zip(header.constdatasize as usize, pixel_size * nfaces)?;
        if premultiply && header.has_alpha() {
            pixel::mult_alpha(
                &mut const_data,
                nfaces,
                header.data_type().unwrap(),
                header.nchannels as usize,
                header.alphachan as usize,
            );
        }

        // level info
        let nlevels = header.nlevels as usize;
        io.seek(levelinfo_pos)?;
        let li_bytes = io.read_vec(nlevels * format::LEVEL_INFO_SIZE)?;
        let mut level_info = Vec::with_capacity(nlevels);
        {
            let mut b = &li_bytes[..];
            for _ in 0..nlevels {
                level_info.push(LevelInfo::read(&mut b)?);
            }
        }
        let mut level_pos = Vec::with_capacity(nlevels);
        let mut lp = leveldata_pos;
        for li in &level_info {
            level_pos.push(lp);
            lp += li.leveldatasize;
        }

        // edit records
        let mut has_edits = false;
        let mut face_edits = Vec::new();
        let mut meta_edits = Vec::new();
        let dt = header.data_type().unwrap();
        let mut epos = editdata_pos;
        loop {
            if io.seek(epos).is_err() {
                break;
            }
            let Ok(edittype) = io.read_u8() else { break };
            let Ok(editsize) = io.read_u32() else { break };
            if editsize == 0 {
                break;
            }
            has_edits = true;
            let body_pos = epos + 5;
            match EditType::from_u8(edittype) {
                Some(EditType::FaceData) => {
                    let hdr_bytes = io.read_vec(format::EDIT_FACE_DATA_HEADER_SIZE)?;
                    let efdh = EditFaceDataHeader::read(&mut &hdr_bytes[..])?;
                    let faceid = efdh.faceid as usize;
                    if faceid < nfaces {
                        let mut f = efdh.faceinfo;
                        f.flags |= FaceInfo::FLAG_HAS_EDITS;
                        face_info[faceid] = f;
                        // const value is stored inline right after the header
                        let cpix = io.read_vec(pixel_size)?;
                        const_data[faceid * pixel_size..(faceid + 1) * pixel_size].copy_from_slice(&cpix);
                        if premultiply && header.has_alpha() {
                            pixel::mult_alpha(
                                &mut const_data[faceid * pixel_size..(faceid + 1) * pixel_size],
                                1,
                                dt,
                                header.nchannels as usize,
                                header.alphachan as usize,
                            );
                        }
                        if !f.is_constant() {
                            face_edits.push(FaceEdit { pos: io.pos, faceid, fdh: efdh.fdh });
                        }
                    }
                }
                Some(EditType::MetaData) => {
                    let hdr_bytes = io.read_vec(format::EDIT_META_DATA_HEADER_SIZE)?;
                    let emdh = EditMetaDataHeader::read(&mut &hdr_bytes[..])?;
                    meta_edits.push(MetaEdit {
                        pos: io.pos,
                        zipsize: emdh.metadatazipsize,
                        memsize: emdh.metadatamemsize,
                    });
                }
                None => {}
            }
            epos = body_pos + editsize as u64;
        }

        let reader = Arc::new_cyclic(|w| PtexReader {
            self_ref: w.clone(),
            cache,
            premultiply,
            path: path.to_path_buf(),
            handler,
            header,
            ext_header,
            pixel_size,
            faceinfo_pos,
            constdata_pos,
            levelinfo_pos,
            leveldata_pos,
            metadata_pos,
            lmdheader_pos,
            lmddata_pos,
            editdata_pos,
            face_info,
            rfaceids,
            const_data,
            level_info,
            level_pos,
            has_edits,
            face_edits,
            meta_edits,
            io: Mutex::new(io),
            handle_is_open: AtomicBool::new(true),
            levels: (0..nlevels).map(|_| OnceLock::new()).collect(),
            metadata: OnceLock::new(),
            reductions: RwLock::new(HashMap::new()),
            error: OnceLock::new(),
        });
        if let Some(c) = reader.cache.upgrade() {
            c.note_file_opened(&reader);
        }
        Ok(reader)
    }

    // --- cheap accessors ---

    /// Path the texture was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mesh type.
    pub fn mesh_type(&self) -> MeshType {
        self.header.mesh_type().unwrap_or_default()
    }

    /// Per-channel data type.
    pub fn data_type(&self) -> DataType {
        self.header.data_type().unwrap_or_default()
    }

    /// Alpha channel index, -1 when there is none.
    pub fn alpha_channel(&self) -> i32 {
        self.header.alphachan
    }

    /// Channels per pixel.
    pub fn num_channels(&self) -> usize {
        self.header.nchannels as usize
    }

    /// Number of faces.
    pub fn num_faces(&self) -> usize {
        self.header.nfaces as usize
    }

    /// True if edit records were appended to the file.
    pub fn has_edits(&self) -> bool {
        self.has_edits
    }

    /// True if the file stores reduction levels beyond the top level.
    pub fn has_mip_maps(&self) -> bool {
        self.header.nlevels > 1
    }

    /// Number of stored levels.
    pub fn num_levels(&self) -> usize {
        self.header.nlevels as usize
    }

    /// Border behavior in u.
    pub fn u_border_mode(&self) -> BorderMode {
        self.ext_header.u_border_mode()
    }

    /// Border behavior in v.
    pub fn v_border_mode(&self) -> BorderMode {
        self.ext_header.v_border_mode()
    }

    /// Bytes per pixel.
    pub fn pixel_size(&self) -> usize {
        self.pixel_size
    }

    /// True if the reader was asked to premultiply alpha.
    pub fn premultiply(&self) -> bool {
        self.premultiply
    }

    /// Per-face info. Out-of-range ids return a default record.
    pub fn get_face_info(&self, faceid: i32) -> FaceInfo {
        self.face_info
            .get(faceid.max(0) as usize)
            .copied()
            .unwrap_or_default()
    }

    /// True until the first I/O or decode failure.
    pub fn ok(&self) -> bool {
        self.error.get().is_none()
    }

    /// The sticky error message, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.error.get().map(|s| s.as_str())
    }

    pub(crate) fn note_error(&self, e: PtexError) {
        warn!(path = %self.path.display(), error = %e, "ptex reader error");
        let _ = self.error.set(format!("{e} PtexFile: {}", self.path.display()));
    }

    pub(crate) fn cache_key(&self) -> usize {
        self.self_ref.as_ptr() as usize
    }

    pub(crate) fn handle_open(&self) -> bool {
        self.handle_is_open.load(Ordering::Acquire)
    }

    /// Closes the file handle; data requests reopen it lazily.
    pub(crate) fn close_handle(&self) {
        let mut io = self.io.lock().unwrap();
        if io.src.take().is_some() && self.handle_is_open.swap(false, Ordering::AcqRel) {
            if let Some(c) = self.cache.upgrade() {
                c.note_file_closed();
            }
        }
    }

    /// Reopens the handle after a cache close, verifying the header has not
    /// changed underneath us.
    fn ensure_open(&self, io: &mut ReaderIo) -> Result<()> {
        if io.src.is_some() {
            return Ok(());
        }
        let src = self
            .handler
            .open(&self.path)
            .map_err(|_| PtexError::corrupt("can't reopen"))?;
        io.src = Some(src);
        io.pos = 0;

        let magic = io.read_u32()?;
        let version = io.read_u32()?;
        let body = io.read_vec(format::HEADER_SIZE - 8)?;
        let header = Header::read_body(&mut &body[..])?;
        let ehs = self.header.extheadersize as usize;
        let ext = if ehs == 0 {
            ExtHeader::default()
        } else {
            ExtHeader::read(&mut io_reader(io, ehs.min(format::EXT_HEADER_SIZE))?, ehs)?
        };
        if magic != format::MAGIC || version != format::VERSION || header != self.header || ext != self.ext_header {
            io.src = None;
            return Err(PtexError::HeaderMismatch { path: self.path.clone() });
        }

        if !self.handle_is_open.swap(true, Ordering::AcqRel) {
            if let Some(c) = self.cache.upgrade() {
                if let Some(me) = self.self_ref.upgrade() {
                    c.note_file_opened(&me);
                }
            }
        }
        Ok(())
    }

    // --- cache integration ---

    pub(crate) fn register_data(&self, body: FaceBody) -> Arc<FaceData> {
        let arc = Arc::new(FaceData::new(body));
        if let Some(c) = self.cache.upgrade() {
            let item: Arc<dyn Any + Send + Sync> = arc.clone();
            let id = c.track_data(item, arc.byte_size(), self.cache_key());
            arc.set_cache_id(id);
        }
        arc
    }

    pub(crate) fn touch(&self, f: &FaceData) {
        if let Some(c) = self.cache.upgrade() {
            let id = f.cache_id();
            if id != 0 {
                c.touch_data(id);
            }
        }
    }

    pub(crate) fn touch_large_meta(&self, m: &LargeMeta) {
        if let Some(c) = self.cache.upgrade() {
            let id = m.cache_id();
            if id != 0 {
                c.touch_data(id);
            }
        }
    }

    fn balance(&self) {
        if let Some(c) = self.cache.upgrade() {
            c.enforce_file_budget(self.cache_key());
        }
    }

    // --- lazy loading ---

    fn get_level(&self, levelid: usize) -> Result<Arc<Level>> {
        if let Some(l) = self.levels[levelid].get() {
            return Ok(l.clone());
        }
        let mut io = self.io.lock().unwrap();
        if let Some(l) = self.levels[levelid].get() {
            return Ok(l.clone());
        }
        let level = self.read_level(&mut io, levelid)?;
        let _ = self.levels[levelid].set(Arc::new(level));
        Ok(self.levels[levelid].get().unwrap().clone())
    }

    fn read_level(&self, io: &mut ReaderIo, levelid: usize) -> Result<Level> {
        self.ensure_open(io)?;
        let li = &self.level_info[levelid];
        let nfaces = li.nfaces as usize;
        io.seek(self.level_pos[levelid])?;
        let zip = io.read_vec(li.levelheadersize as usize)?;
        let mut fdh = format::read_face_data_headers(&zip, nfaces)?;

        let mut offsets = Vec::with_capacity(nfaces);
        let mut pos = io.pos;
        for h in &fdh {
            offsets.push(pos);
            pos += h.blocksize() as u64;
        }

        // level 0 picks up appended face edits
        if levelid == 0 {
            for e in &self.face_edits {
                if e.faceid < fdh.len() {
                    fdh[e.faceid] = e.fdh;
                    offsets[e.faceid] = e.pos;
                }
            }
        }

        Ok(Level {
            fdh,
            offsets,
            faces: (0..nfaces).map(|_| DataSlot::new()).collect(),
        })
    }

    /// Reads one face (or tile) block at `pos`.
    pub(crate) fn read_face_data(&self, pos: u64, fdh: FaceDataHeader, res: Res, levelid: usize) -> Result<FaceBody> {
        let mut io = self.io.lock().unwrap();
        self.ensure_open(&mut io)?;
        io.seek(pos)?;

        let dt = self.data_type();
        let nchan = self.num_channels();
        let premult = levelid == 0 && self.premultiply && self.header.has_alpha();

        match fdh.encoding() {
            Encoding::Constant => {
                let mut pixel = io.read_vec(self.pixel_size)?;
                if premult {
                    pixel::mult_alpha(&mut pixel, 1, dt, nchan, self.header.alphachan as usize);
                }
                Ok(FaceBody::Constant { pixel: pixel.into() })
            }
            Encoding::Tiled => {
                let tileres = Res::from_u16(io.read_u16()?);
                let tileheadersize = io.read_u32()?;
                if tileres.ulog2 < 0
                    || tileres.vlog2 < 0
                    || tileres.ulog2 > res.ulog2
                    || tileres.vlog2 > res.vlog2
                {
                    return Err(PtexError::corrupt("invalid tile resolution"));
                }
                let ntiles = res.ntiles(tileres);
                let zip = io.read_vec(tileheadersize as usize)?;
                let fdh = format::read_face_data_headers(&zip, ntiles)?;
                let mut offsets = Vec::with_capacity(ntiles);
                let mut p = io.pos;
                for h in &fdh {
                    offsets.push(p);
                    p += h.blocksize() as u64;
                }
                Ok(FaceBody::Tiled(TiledFace {
                    res,
                    tileres,
                    ntilesu: res.ntiles_u(tileres),
                    ntilesv: res.ntiles_v(tileres),
                    dt,
                    nchan,
                    pixel_size: self.pixel_size,
                    tiles: (0..ntiles).map(|_| DataSlot::new()).collect(),
                    reader: self.self_ref.clone(),
                    source: TileSource::File { level_id: levelid, fdh, offsets },
                }))
            }
            Encoding::Zipped | Encoding::DiffZipped => {
                let npixels = res.size();
                let unpacked = npixels * self.pixel_size;
                let mut planar = io.read_zip(fdh.blocksize() as usize, unpacked)?;
                if fdh.encoding() == Encoding::DiffZipped {
                    pixel::decode_difference(&mut planar, dt);
                }
                let mut data = vec![0u8; unpacked];
                pixel::interleave(
                    &planar,
                    res.u() * dt.size(),
                    res.u(),
                    res.v(),
                    &mut data,
                    res.u() * self.pixel_size,
                    dt,
                    nchan,
                );
                if premult {
                    pixel::mult_alpha(&mut data, npixels, dt, nchan, self.header.alphachan as usize);
                }
                Ok(FaceBody::Packed { res, pixel_size: self.pixel_size, data: data.into() })
            }
        }
    }

    fn get_face(&self, levelid: usize, level: &Level, faceid: usize, res: Res) -> Result<Arc<FaceData>> {
        let slot = &level.faces[faceid];
        let mut guard = slot.lock();
        if let Some(f) = guard.upgrade() {
            self.touch(&f);
            return Ok(f);
        }
        let body = self.read_face_data(level.offsets[faceid], level.fdh[faceid], res, levelid)?;
        let arc = self.register_data(body);
        *guard = Arc::downgrade(&arc);
        Ok(arc)
    }

    fn const_face(&self, faceid: usize) -> Arc<FaceData> {
        let pixel = &self.const_data[faceid * self.pixel_size..(faceid + 1) * self.pixel_size];
        Arc::new(FaceData::constant(pixel.into()))
    }

    // --- data access ---

    /// Full-resolution data handle for a face.
    pub fn get_data(&self, faceid: i32) -> Option<Arc<FaceData>> {
        if !self.ok() || faceid < 0 || faceid as usize >= self.num_faces() {
            return None;
        }
        let faceid = faceid as usize;
        let fi = self.face_info[faceid];
        let result = if fi.is_constant() || fi.res.is_unit() {
            Some(self.const_face(faceid))
        } else {
            match self.get_level(0).and_then(|l| self.get_face(0, &l, faceid, fi.res)) {
                Ok(f) => Some(f),
                Err(e) => {
                    self.note_error(e);
                    None
                }
            }
        };
        self.balance();
        result
    }

    /// Data handle for a face at the given resolution, synthesizing a
    /// reduction when the file stores none.
    pub fn get_data_at(&self, faceid: i32, res: Res) -> Option<Arc<FaceData>> {
        if !self.ok() || faceid < 0 || faceid as usize >= self.num_faces() {
            return None;
        }
        let result = self.get_data_at_inner(faceid as usize, res);
        self.balance();
        result
    }

    fn get_data_at_inner(&self, faceid: usize, res: Res) -> Option<Arc<FaceData>> {
        let fi = self.face_info[faceid];
        if (fi.is_constant() && res.ulog2 >= 0 && res.vlog2 >= 0) || (res.ulog2 == 0 && res.vlog2 == 0) {
            return Some(self.const_face(faceid));
        }

        let redu = fi.res.ulog2 as i32 - res.ulog2 as i32;
        let redv = fi.res.vlog2 as i32 - res.vlog2 as i32;

        if redu == 0 && redv == 0 {
            // full res
            return match self.get_level(0).and_then(|l| self.get_face(0, &l, faceid, res)) {
                Ok(f) => Some(f),
                Err(e) => {
                    self.note_error(e);
                    None
                }
            };
        }

        if redu == redv && !fi.has_edits() && res.ulog2 >= 0 && res.vlog2 >= 0 {
            // symmetric reduction, maybe stored on disk
            let levelid = redu as usize;
            if levelid < self.levels.len() {
                let rfaceid = self.rfaceids[faceid] as usize;
                if rfaceid < self.level_info[levelid].nfaces as usize {
                    return match self
                        .get_level(levelid)
                        .and_then(|l| self.get_face(levelid, &l, rfaceid, res))
                    {
                        Ok(f) => Some(f),
                        Err(e) => {
                            self.note_error(e);
                            None
                        }
                    };
                }
            }
        }

        // dynamic reduction
        let key = (faceid as u32, res);
        if let Some(f) = self.reductions.read().unwrap().get(&key) {
            return Some(f.clone());
        }

        if res.ulog2 < 0 || res.vlog2 < 0 {
            warn!("reductions below one pixel are not supported");
            return None;
        }
        if redu < 0 || redv < 0 {
            warn!("enlargements are not supported");
            return None;
        }

        let me = self.self_ref.upgrade()?;
        let body = if self.mesh_type() == MeshType::Triangle {
            if redu != redv {
                warn!("anisotropic reductions are not supported for triangle meshes");
                return None;
            }
            let src = self.get_data_at_inner(faceid, Res::new(res.ulog2 + 1, res.vlog2 + 1))?;
            src.reduce(&me, res, pixel::reduce_tri)
        } else {
            // reduce along the axis with the greater remaining delta,
            // alternating for symmetric reductions to stay isotropic
            let blendu = if redu == redv { res.ulog2 & 1 == 1 } else { redu > redv };
            if blendu {
                let src = self.get_data_at_inner(faceid, Res::new(res.ulog2 + 1, res.vlog2))?;
                src.reduce(&me, res, pixel::reduce_u)
            } else {
                let src = self.get_data_at_inner(faceid, Res::new(res.ulog2, res.vlog2 + 1))?;
                src.reduce(&me, res, pixel::reduce_v)
            }
        };
        let body = match body {
            Ok(b) => b,
            Err(e) => {
                self.note_error(e);
                return None;
            }
        };

        // first inserter wins; a racing duplicate is dropped
        let arc = Arc::new(FaceData::new(body));
        let winner = {
            let mut map = self.reductions.write().unwrap();
            map.entry(key).or_insert_with(|| arc).clone()
        };
        Some(winner)
    }

    /// Copies a face's pixels into `buffer` at its full resolution.
    /// `stride` is the destination row length in bytes (0 = packed).
    pub fn get_data_into(&self, faceid: i32, buffer: &mut [u8], stride: usize) {
        if !self.ok() || faceid < 0 || faceid as usize >= self.num_faces() {
            return;
        }
        let res = self.face_info[faceid as usize].res;
        self.get_data_into_at(faceid, buffer, stride, res);
    }

    /// Copies a face's pixels into `buffer` at the given resolution.
    pub fn get_data_into_at(&self, faceid: i32, buffer: &mut [u8], stride: usize, res: Res) {
        if !self.ok() {
            return;
        }
        let rowlen = self.pixel_size * res.u();
        let stride = if stride == 0 { rowlen } else { stride };

        let Some(d) = self.get_data_at(faceid, res) else { return };
        if d.is_constant() {
            pixel::fill(d.data().unwrap(), buffer, stride, res.u(), res.v(), self.pixel_size);
        } else if d.is_tiled() {
            let tileres = d.tile_res();
            let ntilesu = res.ntiles_u(tileres);
            let ntilesv = res.ntiles_v(tileres);
            let tilerowlen = self.pixel_size * tileres.u();
            let mut tile = 0;
            for i in 0..ntilesv {
                for j in 0..ntilesu {
                    let Some(t) = d.get_tile(tile) else { return };
                    tile += 1;
                    let off = i * tileres.v() * stride + j * tilerowlen;
                    let dst = &mut buffer[off..];
                    if t.is_constant() {
                        pixel::fill(t.data().unwrap(), dst, stride, tileres.u(), tileres.v(), self.pixel_size);
                    } else {
                        pixel::copy(t.data().unwrap(), tilerowlen, dst, stride, tileres.v(), tilerowlen);
                    }
                }
            }
        } else {
            pixel::copy(d.data().unwrap(), rowlen, buffer, stride, res.v(), rowlen);
        }
    }

    /// Reads one pixel at the face's full resolution into float channels.
    pub fn get_pixel(&self, faceid: i32, u: usize, v: usize, result: &mut [f32], firstchan: usize, nchannels: usize) {
        result[..nchannels].fill(0.0);
        let nchan = nchannels.min(self.num_channels().saturating_sub(firstchan));
        if nchan == 0 {
            return;
        }
        let Some(data) = self.get_data(faceid) else { return };
        self.pixel_to_float(&data, u, v, result, firstchan, nchan);
    }

    /// Reads one pixel at the given resolution into float channels.
    pub fn get_pixel_at(
        &self,
        faceid: i32,
        u: usize,
        v: usize,
        result: &mut [f32],
        firstchan: usize,
        nchannels: usize,
        res: Res,
    ) {
        result[..nchannels].fill(0.0);
        let nchan = nchannels.min(self.num_channels().saturating_sub(firstchan));
        if nchan == 0 {
            return;
        }
        let Some(data) = self.get_data_at(faceid, res) else { return };
        self.pixel_to_float(&data, u, v, result, firstchan, nchan);
    }

    fn pixel_to_float(&self, data: &FaceData, u: usize, v: usize, result: &mut [f32], firstchan: usize, nchan: usize) {
        let mut pixel = vec![0u8; self.pixel_size];
        data.get_pixel(u, v, &mut pixel);
        let off = self.data_type().size() * firstchan;
        pixel::convert_to_float(result, &pixel[off..], self.data_type(), nchan);
    }

    // --- metadata ---

    /// The texture's metadata, loading it on first access.
    pub fn get_meta_data(&self) -> Option<Arc<MetaData>> {
        if let Some(m) = self.metadata.get() {
            return Some(m.clone());
        }
        if !self.ok() {
            return None;
        }
        let mut io = self.io.lock().unwrap();
        if let Some(m) = self.metadata.get() {
            return Some(m.clone());
        }
        match self.read_meta_data(&mut io) {
            Ok(meta) => {
                let _ = self.metadata.set(Arc::new(meta));
                self.metadata.get().cloned()
            }
            Err(e) => {
                self.note_error(e);
                None
            }
        }
    }

    fn read_meta_data(&self, io: &mut ReaderIo) -> Result<MetaData> {
        let mut meta = MetaData::new(self.self_ref.clone());
        if self.ext_header.metadatamemsize > 0 {
            self.ensure_open(io)?;
            io.seek(self.metadata_pos)?;
            let bytes = io.read_zip(
                self.ext_header.metadatazipsize as usize,
                self.ext_header.metadatamemsize as usize,
            )?;
            meta.parse_block(&bytes);
        }
        if self.ext_header.lmdheadermemsize > 0 {
            self.ensure_open(io)?;
            io.seek(self.lmdheader_pos)?;
            let bytes = io.read_zip(
                self.ext_header.lmdheaderzipsize as usize,
                self.ext_header.lmdheadermemsize as usize,
            )?;
            meta.parse_large_headers(&bytes, self.lmddata_pos);
        }
        for e in &self.meta_edits {
            self.ensure_open(io)?;
            io.seek(e.pos)?;
            let bytes = io.read_zip(e.zipsize as usize, e.memsize as usize)?;
            meta.parse_block(&bytes);
        }
        Ok(meta)
    }

    /// Loads one large-metadata body.
    pub(crate) fn read_large_meta(&self, pos: u64, zipsize: u32, memsize: u32) -> Option<Arc<LargeMeta>> {
        if !self.ok() {
            return None;
        }
        let mut io = self.io.lock().unwrap();
        let bytes = self
            .ensure_open(&mut io)
            .and_then(|_| io.seek(pos))
            .and_then(|_| io.read_zip(zipsize as usize, memsize as usize));
        drop(io);
        match bytes {
            Ok(bytes) => {
                let large = Arc::new(LargeMeta { bytes, cache_id: Default::default() });
                if let Some(c) = self.cache.upgrade() {
                    let item: Arc<dyn Any + Send + Sync> = large.clone();
                    let id = c.track_data(item, memsize as usize, self.cache_key());
                    large.cache_id.store(id, Ordering::Release);
                }
                Some(large)
            }
            Err(e) => {
                self.note_error(e);
                None
            }
        }
    }
}

impl Drop for PtexReader {
    fn drop(&mut self) {
        if self.handle_is_open.swap(false, Ordering::AcqRel) {
            if let Some(c) = self.cache.upgrade() {
                c.note_file_closed();
            }
        }
    }
}

/// Reads `len` bytes through the io layer and returns them as an owned
/// cursor for the fixed-layout parsers.
fn io_reader(io: &mut ReaderIo, len: usize) -> Result<std::io::Cursor<Vec<u8>>> {
    Ok(std::io::Cursor::new(io.read_vec(len)?))
}
