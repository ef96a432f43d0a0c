//! Decoded per-face data.
//!
//! A face handle is one of three shapes: a single constant pixel, a packed
//! image at some resolution, or a tiled grid whose tiles are themselves
//! constant or packed and load lazily. Tiled handles come in two flavours
//! sharing one representation: tiles backed by file blocks, and tiles backed
//! by a 2:1 reduction of a parent tiled face (so reductions of tiled faces
//! stay lazy along the non-reduced axis).

use crate::format::FaceDataHeader;
use crate::reader::PtexReader;
use ptex_core::pixel::{self, ReduceFn};
use ptex_core::{DataType, MeshType, PtexError, Res, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// A lazily-filled child slot. The strong reference to the child lives in
/// the cache; the slot only remembers it weakly.
pub(crate) struct DataSlot(Mutex<Weak<FaceData>>);

impl DataSlot {
    pub(crate) fn new() -> Self {
        DataSlot(Mutex::new(Weak::new()))
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, Weak<FaceData>> {
        self.0.lock().unwrap()
    }
}

/// Handle to one face's pixels at one resolution.
pub struct FaceData {
    pub(crate) body: FaceBody,
    pub(crate) cache_id: AtomicU64,
}

pub(crate) enum FaceBody {
    Constant { pixel: Box<[u8]> },
    Packed { res: Res, pixel_size: usize, data: Box<[u8]> },
    Tiled(TiledFace),
}

pub(crate) struct TiledFace {
    pub res: Res,
    pub tileres: Res,
    pub ntilesu: usize,
    pub ntilesv: usize,
    pub dt: DataType,
    pub nchan: usize,
    pub pixel_size: usize,
    pub tiles: Vec<DataSlot>,
    pub reader: Weak<PtexReader>,
    pub source: TileSource,
}

pub(crate) enum TileSource {
    /// Tiles stored in the file.
    File { level_id: usize, fdh: Vec<FaceDataHeader>, offsets: Vec<u64> },
    /// Tiles synthesized by reducing a parent tiled face.
    Reduced { parent: Arc<FaceData>, reducefn: ReduceFn },
}

impl FaceData {
    pub(crate) fn new(body: FaceBody) -> Self {
        FaceData { body, cache_id: AtomicU64::new(0) }
    }

    pub(crate) fn constant(pixel: Box<[u8]>) -> Self {
        FaceData::new(FaceBody::Constant { pixel })
    }

    pub(crate) fn cache_id(&self) -> u64 {
        self.cache_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_cache_id(&self, id: u64) {
        self.cache_id.store(id, Ordering::Release);
    }

    /// Approximate resident size for cache accounting.
    pub(crate) fn byte_size(&self) -> usize {
        match &self.body {
            FaceBody::Constant { pixel } => pixel.len(),
            FaceBody::Packed { data, .. } => data.len(),
            FaceBody::Tiled(t) => t.tiles.len() * 32 + std::mem::size_of::<TiledFace>(),
        }
    }

    /// True if the face is a single pixel value.
    pub fn is_constant(&self) -> bool {
        matches!(self.body, FaceBody::Constant { .. })
    }

    /// True if the face is a tile grid.
    pub fn is_tiled(&self) -> bool {
        matches!(self.body, FaceBody::Tiled(_))
    }

    /// Resolution of this handle's pixels.
    pub fn res(&self) -> Res {
        match &self.body {
            FaceBody::Constant { .. } => Res::new(0, 0),
            FaceBody::Packed { res, .. } => *res,
            FaceBody::Tiled(t) => t.res,
        }
    }

    /// Tile resolution; equals [`res`](Self::res) for non-tiled faces.
    pub fn tile_res(&self) -> Res {
        match &self.body {
            FaceBody::Constant { .. } => Res::new(0, 0),
            FaceBody::Packed { res, .. } => *res,
            FaceBody::Tiled(t) => t.tileres,
        }
    }

    /// Number of tiles (1 for non-tiled faces).
    pub fn num_tiles(&self) -> usize {
        match &self.body {
            FaceBody::Tiled(t) => t.ntilesu * t.ntilesv,
            _ => 1,
        }
    }

    /// Raw pixel bytes; `None` for tiled faces (fetch tiles instead).
    pub fn data(&self) -> Option<&[u8]> {
        match &self.body {
            FaceBody::Constant { pixel } => Some(pixel),
            FaceBody::Packed { data, .. } => Some(data),
            FaceBody::Tiled(_) => None,
        }
    }

    /// Copies the pixel at (u, v) into `result`.
    pub fn get_pixel(&self, u: usize, v: usize, result: &mut [u8]) {
        match &self.body {
            FaceBody::Constant { pixel } => {
                result[..pixel.len()].copy_from_slice(pixel);
            }
            FaceBody::Packed { res, pixel_size, data } => {
                let off = (v * res.u() + u) * pixel_size;
                result[..*pixel_size].copy_from_slice(&data[off..off + pixel_size]);
            }
            FaceBody::Tiled(t) => {
                let tileu = u >> t.tileres.ulog2 as u32;
                let tilev = v >> t.tileres.vlog2 as u32;
                if let Some(tile) = self.get_tile(tilev * t.ntilesu + tileu) {
                    tile.get_pixel(u - (tileu << t.tileres.ulog2 as u32), v - (tilev << t.tileres.vlog2 as u32), result);
                }
            }
        }
    }

    /// Fetches one tile of a tiled face, loading or synthesizing it on
    /// demand. Returns `None` for non-tiled faces or on read failure.
    pub fn get_tile(&self, tile: usize) -> Option<Arc<FaceData>> {
        match &self.body {
            FaceBody::Tiled(t) => t.get_tile(tile),
            _ => None,
        }
    }

    /// Produces a reduced copy of this face at `newres`.
    pub(crate) fn reduce(
        self: &Arc<Self>,
        reader: &Arc<PtexReader>,
        newres: Res,
        reducefn: ReduceFn,
    ) -> Result<FaceBody> {
        match &self.body {
            FaceBody::Constant { pixel } => {
                // a separate constant handle, same value
                Ok(FaceBody::Constant { pixel: pixel.clone() })
            }
            FaceBody::Packed { res, pixel_size, data } => {
                let mut out = vec![0u8; newres.size() * pixel_size];
                reducefn(
                    data,
                    pixel_size * res.u(),
                    res.u(),
                    res.v(),
                    &mut out,
                    pixel_size * newres.u(),
                    reader.data_type(),
                    reader.num_channels(),
                );
                Ok(FaceBody::Packed { res: newres, pixel_size: *pixel_size, data: out.into() })
            }
            FaceBody::Tiled(t) => t.reduce(self, reader, newres, reducefn),
        }
    }
}

impl TiledFace {
    fn get_tile(&self, tile: usize) -> Option<Arc<FaceData>> {
        let reader = self.reader.upgrade()?;
        let slot = self.tiles.get(tile)?;
        let mut guard = slot.lock();
        if let Some(f) = guard.upgrade() {
            reader.touch(&f);
            return Some(f);
        }
        let body = match &self.source {
            TileSource::File { level_id, fdh, offsets } => {
                match reader.read_face_data(offsets[tile], fdh[tile], self.tileres, *level_id) {
                    Ok(b) => b,
                    Err(e) => {
                        reader.note_error(e);
                        return None;
                    }
                }
            }
            TileSource::Reduced { parent, reducefn } => {
                match self.reduce_tile(parent, *reducefn, tile) {
                    Ok(b) => b,
                    Err(e) => {
                        reader.note_error(e);
                        return None;
                    }
                }
            }
        };
        let arc = reader.register_data(body);
        *guard = Arc::downgrade(&arc);
        Some(arc)
    }

    /// Synthesizes one tile of a reduced tiled face from the parent's
    /// tiles.
    fn reduce_tile(&self, parent: &Arc<FaceData>, reducefn: ReduceFn, tile: usize) -> Result<FaceBody> {
        let FaceBody::Tiled(p) = &parent.body else {
            return Err(PtexError::corrupt("tiled reduction parent is not tiled"));
        };
        // parent tiles covered by this tile
        let nu = p.ntilesu / self.ntilesu;
        let nv = p.ntilesv / self.ntilesv;
        let tileu0 = (tile % self.ntilesu) * nu;
        let tilev0 = (tile / self.ntilesu) * nv;

        let mut ptiles = Vec::with_capacity(nu * nv);
        for r in 0..nv {
            for c in 0..nu {
                let idx = (tilev0 + r) * p.ntilesu + (tileu0 + c);
                let t = parent
                    .get_tile(idx)
                    .ok_or_else(|| PtexError::corrupt("tile read failed during reduction"))?;
                ptiles.push(t);
            }
        }

        if let Some(pixel) = all_constant(&ptiles, self.pixel_size) {
            return Ok(FaceBody::Constant { pixel });
        }

        // reduce each parent tile into its region of a packed tile
        let mut out = vec![0u8; self.tileres.size() * self.pixel_size];
        let sstride = p.tileres.u() * self.pixel_size;
        let dstride = self.tileres.u() * self.pixel_size;
        let sub_u = self.tileres.u() / nu;
        let sub_v = self.tileres.v() / nv;
        for r in 0..nv {
            for c in 0..nu {
                let t = &ptiles[r * nu + c];
                let off = r * sub_v * dstride + c * sub_u * self.pixel_size;
                let dst = &mut out[off..];
                match t.data() {
                    Some(src) if t.is_constant() => {
                        pixel::fill(src, dst, dstride, sub_u, sub_v, self.pixel_size);
                    }
                    Some(src) => {
                        reducefn(src, sstride, p.tileres.u(), p.tileres.v(), dst, dstride, self.dt, self.nchan);
                    }
                    None => return Err(PtexError::corrupt("nested tiled tile")),
                }
            }
        }
        Ok(FaceBody::Packed { res: self.tileres, pixel_size: self.pixel_size, data: out.into() })
    }

    /// Whole-face reduction of a tiled face.
    fn reduce(
        &self,
        parent: &Arc<FaceData>,
        reader: &Arc<PtexReader>,
        newres: Res,
        reducefn: ReduceFn,
    ) -> Result<FaceBody> {
        let is_triangle = reader.mesh_type() == MeshType::Triangle;

        // propagate the tile res so later reductions along the other axis
        // stay lazy; triangle reductions are never tiled
        let mut newtileres = if is_triangle { newres } else { self.tileres };
        newtileres.clamp_to(newres);

        let newntiles = newres.ntiles(newtileres);
        if newntiles > 1 {
            let ntilesu = newres.ntiles_u(newtileres);
            let ntilesv = newres.ntiles_v(newtileres);
            return Ok(FaceBody::Tiled(TiledFace {
                res: newres,
                tileres: newtileres,
                ntilesu,
                ntilesv,
                dt: self.dt,
                nchan: self.nchan,
                pixel_size: self.pixel_size,
                tiles: (0..newntiles).map(|_| DataSlot::new()).collect(),
                reader: self.reader.clone(),
                source: TileSource::Reduced { parent: parent.clone(), reducefn },
            }));
        }

        // collapse to a single face
        let ntiles = self.ntilesu * self.ntilesv;
        let mut tiles = Vec::with_capacity(ntiles);
        for i in 0..ntiles {
            tiles.push(
                parent
                    .get_tile(i)
                    .ok_or_else(|| PtexError::corrupt("tile read failed during reduction"))?,
            );
        }

        if let Some(pixel) = all_constant(&tiles, self.pixel_size) {
            return Ok(FaceBody::Constant { pixel });
        }

        if is_triangle {
            // reassemble the full image; the triangle kernel does not work
            // tile by tile
            let sstride = self.pixel_size * self.tileres.u();
            let full_stride = sstride * self.ntilesu;
            let mut full = vec![0u8; self.res.size() * self.pixel_size];
            for (i, t) in tiles.iter().enumerate() {
                let r = i / self.ntilesu;
                let c = i % self.ntilesu;
                let off = r * self.tileres.v() * full_stride + c * sstride;
                let dst = &mut full[off..];
                match t.data() {
                    Some(src) if t.is_constant() => {
                        pixel::fill(src, dst, full_stride, self.tileres.u(), self.tileres.v(), self.pixel_size)
                    }
                    Some(src) => pixel::copy(src, sstride, dst, full_stride, self.tileres.v(), sstride),
                    None => return Err(PtexError::corrupt("nested tiled tile")),
                }
            }
            let mut out = vec![0u8; newres.size() * self.pixel_size];
            reducefn(
                &full,
                self.pixel_size * self.res.u(),
                self.res.u(),
                self.res.v(),
                &mut out,
                self.pixel_size * newres.u(),
                self.dt,
                self.nchan,
            );
            return Ok(FaceBody::Packed { res: newres, pixel_size: self.pixel_size, data: out.into() });
        }

        // reduce tile by tile into a packed face
        let mut out = vec![0u8; newres.size() * self.pixel_size];
        let sstride = self.pixel_size * self.tileres.u();
        let dstride = self.pixel_size * newres.u();
        let sub_u = newres.u() / self.ntilesu;
        let sub_v = newres.v() / self.ntilesv;
        for (i, t) in tiles.iter().enumerate() {
            let r = i / self.ntilesu;
            let c = i % self.ntilesu;
            let off = r * sub_v * dstride + c * sub_u * self.pixel_size;
            let dst = &mut out[off..];
            match t.data() {
                Some(src) if t.is_constant() => {
                    pixel::fill(src, dst, dstride, sub_u, sub_v, self.pixel_size)
                }
                Some(src) => reducefn(src, sstride, self.tileres.u(), self.tileres.v(), dst, dstride, self.dt, self.nchan),
                None => return Err(PtexError::corrupt("nested tiled tile")),
            }
        }
        Ok(FaceBody::Packed { res: newres, pixel_size: self.pixel_size, data: out.into() })
    }
}

/// If every tile is constant with one shared value, returns that pixel.
fn all_constant(tiles: &[Arc<FaceData>], pixel_size: usize) -> Option<Box<[u8]>> {
    let first = tiles.first()?;
    if !first.is_constant() {
        return None;
    }
    let pixel = first.data()?;
    for t in &tiles[1..] {
        if !t.is_constant() || t.data()? != pixel {
            return None;
        }
    }
    Some(pixel[..pixel_size].into())
}
