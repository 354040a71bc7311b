//! Firmware container parsing and block data access.
//!
//! A container is a fixed 32-byte file header, `num_blocks` block header
//! records of 76 bytes each, and the raw block data regions at their
//! declared file offsets. All multi-byte fields are little-endian except
//! the 16-byte service UUID, which is stored big-endian.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use thiserror::Error;
use uuid::Uuid;

/// Magic number at the start of every firmware container.
pub const MAGIC: u32 = 0x55A322BF;
/// File header length in bytes.
pub const HEADER_LEN: usize = 32;
/// Block header record length in bytes.
pub const BLOCK_HEADER_LEN: usize = 76;
/// Initialization vector length.
pub const IV_LEN: usize = 16;
/// SHA-256 digest length.
pub const DIGEST_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum FirmwareError {
    #[error("bad magic: expected {MAGIC:#010X}, found {0:#010X}")]
    BadMagic(u32),
    #[error("zero blocks in container")]
    ZeroBlocks,
    #[error("declared block lengths overflow the container size")]
    TooLarge,
    #[error("short read on {0}")]
    ShortRead(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One block of the firmware image: a contiguous region of target memory
/// plus the location of its source bytes in the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Destination memory address.
    pub addr: u32,
    /// Payload byte count, not including padding.
    pub length: u32,
    /// Trailing padding bytes appended to the payload.
    pub extra: u8,
    /// Byte offset in the container where this block's data begins.
    pub file_offset: u32,
    pub init_vector: [u8; IV_LEN],
    pub digest: [u8; DIGEST_LEN],
}

impl BlockHeader {
    /// Total bytes transferred for this block (`length + extra`).
    pub fn payload_len(&self) -> u32 {
        self.length + self.extra as u32
    }

    fn from_bytes(buf: &[u8; BLOCK_HEADER_LEN]) -> Self {
        let mut init_vector = [0u8; IV_LEN];
        init_vector.copy_from_slice(&buf[16..16 + IV_LEN]);
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&buf[32..32 + DIGEST_LEN]);
        BlockHeader {
            addr: get_u32(buf, 0),
            length: get_u32(buf, 4),
            file_offset: get_u32(buf, 8),
            extra: buf[12],
            init_vector,
            digest,
        }
    }
}

/// Parsed description of a firmware container, immutable after parse.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    pub version_major: u16,
    pub version_minor: u16,
    /// Service UUID of the device's bootloader.
    pub service_uuid: Uuid,
    /// Minimum destination address over all blocks.
    pub base_addr: u32,
    /// Sum of `length + extra` over all blocks.
    pub total_bytes: u32,
    /// Blocks in file order, which is also transfer order.
    pub blocks: Vec<BlockHeader>,
}

impl FirmwareImage {
    pub fn num_blocks(&self) -> u16 {
        self.blocks.len() as u16
    }
}

/// Parse a firmware container. The read handle is not kept open; block
/// data access goes through [`FirmwareFile`] afterwards.
pub fn parse(path: &Path) -> Result<FirmwareImage, FirmwareError> {
    let mut file = File::open(path)?;

    let mut header = [0u8; HEADER_LEN];
    read_record(&mut file, &mut header, "file header")?;
    let magic = get_u32(&header, 0);
    if magic != MAGIC {
        return Err(FirmwareError::BadMagic(magic));
    }
    let version_major = get_u16(&header, 4);
    let version_minor = get_u16(&header, 6);
    let num_blocks = get_u16(&header, 8);
    if num_blocks == 0 {
        return Err(FirmwareError::ZeroBlocks);
    }
    // The service UUID is the one big-endian field in the file.
    let mut uuid_bytes = [0u8; 16];
    uuid_bytes.copy_from_slice(&header[16..32]);
    let service_uuid = Uuid::from_bytes(uuid_bytes);

    let mut blocks = Vec::with_capacity(num_blocks as usize);
    let mut base_addr = u32::MAX;
    let mut total_bytes: u32 = 0;
    for _ in 0..num_blocks {
        let mut record = [0u8; BLOCK_HEADER_LEN];
        read_record(&mut file, &mut record, "block header")?;
        let block = BlockHeader::from_bytes(&record);
        total_bytes = block
            .length
            .checked_add(block.extra as u32)
            .and_then(|len| total_bytes.checked_add(len))
            .ok_or(FirmwareError::TooLarge)?;
        base_addr = base_addr.min(block.addr);
        blocks.push(block);
    }

    Ok(FirmwareImage {
        version_major,
        version_minor,
        service_uuid,
        base_addr,
        total_bytes,
        blocks,
    })
}

/// A parsed container plus a lazily-opened handle for block data reads.
/// The handle is opened on the first block start and dropped by
/// [`FirmwareFile::close`].
pub struct FirmwareFile {
    path: PathBuf,
    image: FirmwareImage,
    handle: Option<File>,
}

impl FirmwareFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FirmwareError> {
        let path = path.as_ref().to_path_buf();
        let image = parse(&path)?;
        Ok(FirmwareFile {
            path,
            image,
            handle: None,
        })
    }

    pub fn image(&self) -> &FirmwareImage {
        &self.image
    }

    /// Begin a block transfer: open the handle if needed and position a
    /// cursor at the block's data start.
    pub fn start_block(&mut self, header: &BlockHeader) -> Result<BlockCursor<'_>, FirmwareError> {
        if self.handle.is_none() {
            self.handle = Some(File::open(&self.path)?);
        }
        let file = self.handle.as_mut().unwrap();
        let mut cursor = BlockCursor {
            file,
            start: header.file_offset as u64,
            len: header.payload_len(),
            position: 0,
        };
        cursor.seek(0)?;
        Ok(cursor)
    }

    /// Release the data handle. Idempotent.
    pub fn close(&mut self) {
        self.handle = None;
    }
}

/// Bounded, seekable reader over one block's data region.
pub struct BlockCursor<'a> {
    file: &'a mut File,
    start: u64,
    len: u32,
    position: u32,
}

impl BlockCursor<'_> {
    /// Seek to `pos`, relative to the block's data start. Positions
    /// past the block's end are rejected.
    pub fn seek(&mut self, pos: u32) -> io::Result<()> {
        if pos > self.len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek past end of block",
            ));
        }
        self.file.seek(SeekFrom::Start(self.start + pos as u64))?;
        self.position = pos;
        Ok(())
    }

    /// Read into `buf`, never past the block's end. Returns 0 at end of
    /// block; a short read only happens on the final read.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = (self.len - self.position) as usize;
        let n = buf.len().min(remaining);
        if n == 0 {
            return Ok(0);
        }
        self.file.read_exact(&mut buf[..n])?;
        self.position += n as u32;
        Ok(n)
    }
}

fn read_record<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    what: &'static str,
) -> Result<(), FirmwareError> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => FirmwareError::ShortRead(what),
        _ => FirmwareError::Io(e),
    })
}

fn get_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn get_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}
