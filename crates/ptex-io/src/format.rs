//! On-disk format descriptors.
//!
//! The format is little-endian throughout. The fixed-layout records here are
//! serialised field by field with [`byteorder`]; their byte sizes are part
//! of the format and asserted in tests.
//!
//! ```text
//! [Header 52 bytes]
//! [ExtHeader 32 bytes (may be absent)]
//! [FaceInfo x nfaces, zlib]
//! [const pixel x nfaces, zlib]
//! [LevelInfo x nlevels]
//! [per level: zlib(FaceDataHeader x nfaces_in_level), face blocks]
//! [metadata, zlib]
//! [large metadata headers, zlib]
//! [large metadata bodies, zlib each]
//! [edit records to EOF]
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ptex_core::{BorderMode, DataType, FaceInfo, MeshType, PtexError, Res, Result};
use std::io::{Read, Write};

/// File magic: `'P' | 't'<<8 | 'e'<<16 | 'x'<<24`.
pub const MAGIC: u32 = 0x7865_7450;

/// Format version written and accepted.
pub const VERSION: u32 = 1;

/// Size of [`Header`] on disk.
pub const HEADER_SIZE: usize = 52;

/// Size of [`ExtHeader`] on disk.
pub const EXT_HEADER_SIZE: usize = 32;

/// Size of [`LevelInfo`] on disk.
pub const LEVEL_INFO_SIZE: usize = 16;

/// Size of a [`FaceInfo`] record on disk.
pub const FACE_INFO_SIZE: usize = 20;

/// Size of a [`FaceDataHeader`] on disk.
pub const FACE_DATA_HEADER_SIZE: usize = 4;

/// Size of an [`EditFaceDataHeader`] on disk.
pub const EDIT_FACE_DATA_HEADER_SIZE: usize = 4 + FACE_INFO_SIZE + FACE_DATA_HEADER_SIZE;

/// Size of an [`EditMetaDataHeader`] on disk.
pub const EDIT_META_DATA_HEADER_SIZE: usize = 8;

/// Target block size for chunked file I/O.
pub const BLOCK_SIZE: usize = 16384;

/// Faces whose uncompressed payload exceeds this many bytes are tiled.
pub const TILE_SIZE: usize = 65536;

/// Reductions stop once the smaller log2 dimension reaches this value.
pub const MIN_REDUCTION_LOG2: i8 = 2;

/// Metadata values larger than this are stored as lazily-read large
/// metadata.
pub const METADATA_INLINE_THRESHOLD: usize = 1024;

/// Main file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    /// Mesh type discriminant.
    pub meshtype: u32,
    /// Data type discriminant.
    pub datatype: u32,
    /// Alpha channel index, -1 when there is none.
    pub alphachan: i32,
    /// Channels per pixel.
    pub nchannels: u16,
    /// Stored mipmap level count (level 0 included).
    pub nlevels: u16,
    /// Face count.
    pub nfaces: u32,
    /// Size of the extended header that follows.
    pub extheadersize: u32,
    /// Compressed size of the face-info block.
    pub faceinfosize: u32,
    /// Compressed size of the const-data block.
    pub constdatasize: u32,
    /// Size of the level-info array.
    pub levelinfosize: u32,
    /// Total size of all level data.
    pub leveldatasize: u64,
}

impl Header {
    /// Bytes per pixel.
    #[inline]
    pub fn pixel_size(&self) -> usize {
        self.data_type().map(|dt| dt.size()).unwrap_or(0) * self.nchannels as usize
    }

    /// Decoded mesh type.
    #[inline]
    pub fn mesh_type(&self) -> Option<MeshType> {
        MeshType::from_u32(self.meshtype)
    }

    /// Decoded data type.
    #[inline]
    pub fn data_type(&self) -> Option<DataType> {
        DataType::from_u32(self.datatype)
    }

    /// True if the alpha channel index addresses a real channel.
    #[inline]
    pub fn has_alpha(&self) -> bool {
        self.alphachan >= 0 && (self.alphachan as u16) < self.nchannels
    }

    /// Reads the header, excluding the leading magic and version words.
    pub fn read_body<R: Read>(r: &mut R) -> Result<Self> {
        Ok(Header {
            meshtype: r.read_u32::<LittleEndian>()?,
            datatype: r.read_u32::<LittleEndian>()?,
            alphachan: r.read_i32::<LittleEndian>()?,
            nchannels: r.read_u16::<LittleEndian>()?,
            nlevels: r.read_u16::<LittleEndian>()?,
            nfaces: r.read_u32::<LittleEndian>()?,
            extheadersize: r.read_u32::<LittleEndian>()?,
            faceinfosize: r.read_u32::<LittleEndian>()?,
            constdatasize: r.read_u32::<LittleEndian>()?,
            levelinfosize: r.read_u32::<LittleEndian>()?,
            leveldatasize: r.read_u64::<LittleEndian>()?,
        })
    }

    /// Writes the full header including magic and version.
    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u32::<LittleEndian>(MAGIC)?;
        w.write_u32::<LittleEndian>(VERSION)?;
        w.write_u32::<LittleEndian>(self.meshtype)?;
        w.write_u32::<LittleEndian>(self.datatype)?;
        w.write_i32::<LittleEndian>(self.alphachan)?;
        w.write_u16::<LittleEndian>(self.nchannels)?;
        w.write_u16::<LittleEndian>(self.nlevels)?;
        w.write_u32::<LittleEndian>(self.nfaces)?;
        w.write_u32::<LittleEndian>(self.extheadersize)?;
        w.write_u32::<LittleEndian>(self.faceinfosize)?;
        w.write_u32::<LittleEndian>(self.constdatasize)?;
        w.write_u32::<LittleEndian>(self.levelinfosize)?;
        w.write_u64::<LittleEndian>(self.leveldatasize)?;
        Ok(())
    }
}

/// Extended header.
///
/// A zero `extheadersize` in the [`Header`] means all fields default: clamp
/// border modes, no metadata, no large metadata, edits scanned to EOF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtHeader {
    /// Border behavior in u.
    pub ubordermode: u32,
    /// Border behavior in v.
    pub vbordermode: u32,
    /// Compressed size of the small-metadata block.
    pub metadatazipsize: u32,
    /// Uncompressed size of the small-metadata block.
    pub metadatamemsize: u32,
    /// Compressed size of the large-metadata header block.
    pub lmdheaderzipsize: u32,
    /// Uncompressed size of the large-metadata header block.
    pub lmdheadermemsize: u32,
    /// Total compressed size of all large-metadata bodies.
    pub lmddatasize: u64,
}

impl ExtHeader {
    /// Decoded u border mode.
    #[inline]
    pub fn u_border_mode(&self) -> BorderMode {
        BorderMode::from_u32(self.ubordermode)
    }

    /// Decoded v border mode.
    #[inline]
    pub fn v_border_mode(&self) -> BorderMode {
        BorderMode::from_u32(self.vbordermode)
    }

    /// Reads up to `size` bytes of extended header, zero-filling the rest.
    pub fn read<R: Read>(r: &mut R, size: usize) -> Result<Self> {
        let mut buf = vec![0u8; size.min(EXT_HEADER_SIZE)];
        r.read_exact(&mut buf)?;
        buf.resize(EXT_HEADER_SIZE, 0);
        let mut b = &buf[..];
        Ok(ExtHeader {
            ubordermode: b.read_u32::<LittleEndian>()?,
            vbordermode: b.read_u32::<LittleEndian>()?,
            metadatazipsize: b.read_u32::<LittleEndian>()?,
            metadatamemsize: b.read_u32::<LittleEndian>()?,
            lmdheaderzipsize: b.read_u32::<LittleEndian>()?,
            lmdheadermemsize: b.read_u32::<LittleEndian>()?,
            lmddatasize: b.read_u64::<LittleEndian>()?,
        })
    }

    /// Writes the full extended header.
    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u32::<LittleEndian>(self.ubordermode)?;
        w.write_u32::<LittleEndian>(self.vbordermode)?;
        w.write_u32::<LittleEndian>(self.metadatazipsize)?;
        w.write_u32::<LittleEndian>(self.metadatamemsize)?;
        w.write_u32::<LittleEndian>(self.lmdheaderzipsize)?;
        w.write_u32::<LittleEndian>(self.lmdheadermemsize)?;
        w.write_u64::<LittleEndian>(self.lmddatasize)?;
        Ok(())
    }
}

/// Per-level record in the level-info array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LevelInfo {
    /// Total size of this level's data (header zip + face blocks).
    pub leveldatasize: u64,
    /// Compressed size of the face-data header array.
    pub levelheadersize: u32,
    /// Number of faces stored in this level.
    pub nfaces: u32,
}

impl LevelInfo {
    /// Reads one record.
    pub fn read<R: Read>(r: &mut R) -> Result<Self> {
        Ok(LevelInfo {
            leveldatasize: r.read_u64::<LittleEndian>()?,
            levelheadersize: r.read_u32::<LittleEndian>()?,
            nfaces: r.read_u32::<LittleEndian>()?,
        })
    }

    /// Writes one record.
    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u64::<LittleEndian>(self.leveldatasize)?;
        w.write_u32::<LittleEndian>(self.levelheadersize)?;
        w.write_u32::<LittleEndian>(self.nfaces)?;
        Ok(())
    }
}

/// Storage encoding of a face data block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// One pixel value.
    #[default]
    Constant = 0,
    /// zlib-compressed planar data.
    Zipped = 1,
    /// Difference-coded then zlib-compressed planar data.
    DiffZipped = 2,
    /// A grid of independently encoded tiles.
    Tiled = 3,
}

impl Encoding {
    fn from_bits(v: u32) -> Self {
        match v & 3 {
            0 => Encoding::Constant,
            1 => Encoding::Zipped,
            2 => Encoding::DiffZipped,
            _ => Encoding::Tiled,
        }
    }
}

/// Block size and encoding packed into one u32
/// (bits 0..29 = blocksize, bits 30..31 = encoding).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FaceDataHeader(pub u32);

impl FaceDataHeader {
    /// Packs a block size and encoding.
    #[inline]
    pub fn new(blocksize: u32, encoding: Encoding) -> Self {
        FaceDataHeader((blocksize & 0x3fff_ffff) | ((encoding as u32) << 30))
    }

    /// Stored block size in bytes.
    #[inline]
    pub fn blocksize(self) -> u32 {
        self.0 & 0x3fff_ffff
    }

    /// Stored encoding.
    #[inline]
    pub fn encoding(self) -> Encoding {
        Encoding::from_bits(self.0 >> 30)
    }
}

/// Reads a zlib-compressed array of face data headers.
pub fn read_face_data_headers(zip: &[u8], nfaces: usize) -> Result<Vec<FaceDataHeader>> {
    let bytes = inflate(zip, nfaces * FACE_DATA_HEADER_SIZE)?;
    let mut out = Vec::with_capacity(nfaces);
    let mut b = &bytes[..];
    for _ in 0..nfaces {
        out.push(FaceDataHeader(b.read_u32::<LittleEndian>()?));
    }
    Ok(out)
}

/// Serialises face data headers to their raw little-endian form.
pub fn face_data_headers_bytes(fdh: &[FaceDataHeader]) -> Vec<u8> {
    let mut out = Vec::with_capacity(fdh.len() * FACE_DATA_HEADER_SIZE);
    for h in fdh {
        out.extend_from_slice(&h.0.to_le_bytes());
    }
    out
}

/// Appended record kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditType {
    /// Face data override.
    FaceData = 0,
    /// Additional metadata block.
    MetaData = 1,
}

impl EditType {
    /// Decodes a stored edit type.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(EditType::FaceData),
            1 => Some(EditType::MetaData),
            _ => None,
        }
    }
}

/// Header of a face-data edit record.
#[derive(Debug, Clone, Copy)]
pub struct EditFaceDataHeader {
    /// Face being overridden.
    pub faceid: u32,
    /// Replacement face info.
    pub faceinfo: FaceInfo,
    /// Header of the face block that follows the const pixel.
    pub fdh: FaceDataHeader,
}

impl EditFaceDataHeader {
    /// Reads one record header.
    pub fn read<R: Read>(r: &mut R) -> Result<Self> {
        Ok(EditFaceDataHeader {
            faceid: r.read_u32::<LittleEndian>()?,
            faceinfo: read_face_info(r)?,
            fdh: FaceDataHeader(r.read_u32::<LittleEndian>()?),
        })
    }

    /// Writes one record header.
    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u32::<LittleEndian>(self.faceid)?;
        write_face_info(w, &self.faceinfo)?;
        w.write_u32::<LittleEndian>(self.fdh.0)?;
        Ok(())
    }
}

/// Header of a metadata edit record.
#[derive(Debug, Clone, Copy)]
pub struct EditMetaDataHeader {
    /// Compressed size of the metadata block.
    pub metadatazipsize: u32,
    /// Uncompressed size of the metadata block.
    pub metadatamemsize: u32,
}

impl EditMetaDataHeader {
    /// Reads one record header.
    pub fn read<R: Read>(r: &mut R) -> Result<Self> {
        Ok(EditMetaDataHeader {
            metadatazipsize: r.read_u32::<LittleEndian>()?,
            metadatamemsize: r.read_u32::<LittleEndian>()?,
        })
    }

    /// Writes one record header.
    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u32::<LittleEndian>(self.metadatazipsize)?;
        w.write_u32::<LittleEndian>(self.metadatamemsize)?;
        Ok(())
    }
}

/// Reads one [`FaceInfo`] record.
pub fn read_face_info<R: Read>(r: &mut R) -> Result<FaceInfo> {
    let res = Res::from_u16(r.read_u16::<LittleEndian>()?);
    let adjedges = r.read_u8()?;
    let flags = r.read_u8()?;
    let mut adjfaces = [0i32; 4];
    for a in adjfaces.iter_mut() {
        *a = r.read_i32::<LittleEndian>()?;
    }
    Ok(FaceInfo { res, adjedges, flags, adjfaces })
}

/// Writes one [`FaceInfo`] record.
pub fn write_face_info<W: Write>(w: &mut W, f: &FaceInfo) -> Result<()> {
    w.write_u16::<LittleEndian>(f.res.to_u16())?;
    w.write_u8(f.adjedges)?;
    w.write_u8(f.flags)?;
    for a in f.adjfaces {
        w.write_i32::<LittleEndian>(a)?;
    }
    Ok(())
}

/// Inflates a zlib block, requiring exactly `unzip_size` output bytes.
pub fn inflate(zip: &[u8], unzip_size: usize) -> Result<Vec<u8>> {
    use flate2::read::ZlibDecoder;
    let mut out = Vec::with_capacity(unzip_size);
    let mut dec = ZlibDecoder::new(zip);
    dec.read_to_end(&mut out).map_err(|e| PtexError::corrupt(format!("unzip failed: {e}")))?;
    if out.len() != unzip_size {
        return Err(PtexError::corrupt(format!(
            "unzip size mismatch: expected {unzip_size}, got {}",
            out.len()
        )));
    }
    Ok(out)
}

/// Deflates a block with zlib. `level` 0 stores uncompressed zlib framing
/// (used for incremental edits).
pub fn deflate(data: &[u8], level: u32) -> Vec<u8> {
    use flate2::Compression;
    use flate2::write::ZlibEncoder;
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::new(level));
    // writing to a Vec cannot fail
    enc.write_all(data).expect("zlib encode to memory");
    enc.finish().expect("zlib finish to memory")
}
