//! FWPKG firmware package format.
//!
//! FWPKG is the vendor container format carrying a LoaderBoot image and
//! one or more application images together with their burn metadata.
//!
//! ## Format Overview
//!
//! ```text
//! +------------------+
//! |   Header (12B)   |  magic(4) + crc(2) + count(2) + length(4)
//! +------------------+
//! |  BinInfo[0] 52B  |  name[32] + offset(4) + length(4)
//! +------------------+       + burn_addr(4) + burn_size(4) + type(4)
//! |       ...        |
//! +------------------+
//! |  BinInfo[n] 52B  |
//! +------------------+
//! |   Image Data     |  referenced by each entry's offset/length
//! +------------------+
//! ```
//!
//! All integers are little-endian. The stored CRC16-XMODEM covers bytes
//! `[6 .. 12 + 52*count)`, i.e. everything after the magic and crc fields
//! through the last entry record.

use crate::error::{Error, Result};
use crate::protocol::crc::crc16_xmodem;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::Path;

/// FWPKG magic number (stored little-endian).
pub const FWPKG_MAGIC: u32 = 0xEFBE_ADDF;

/// Maximum number of entries in a FWPKG.
pub const MAX_ENTRIES: usize = 16;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 12;

/// BinInfo size in bytes.
/// name\[32\] + offset(4) + length(4) + burn_addr(4) + burn_size(4) + type(4)
pub const BIN_INFO_SIZE: usize = 52;

/// Name field size.
pub const NAME_SIZE: usize = 32;

/// Image kind carried in an entry's `type` field.
///
/// Values other than 0 and 1 are reserved by the vendor tooling; they are
/// carried through unchanged and burned like applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    /// LoaderBoot (first-stage loader, runs in RAM).
    Loader,
    /// Application image burned to flash.
    App,
    /// Reserved kind, treated like an application.
    Other(u32),
}

impl From<u32> for ImageKind {
    fn from(value: u32) -> Self {
        match value {
            0 => Self::Loader,
            1 => Self::App,
            v => Self::Other(v),
        }
    }
}

impl ImageKind {
    /// Returns the on-file numeric value of this kind.
    #[must_use]
    pub fn as_u32(self) -> u32 {
        match self {
            Self::Loader => 0,
            Self::App => 1,
            Self::Other(v) => v,
        }
    }
}

/// FWPKG file header.
#[derive(Debug, Clone)]
pub struct FwpkgHeader {
    /// Magic number (0xEFBEADDF).
    pub magic: u32,
    /// CRC16-XMODEM over bytes `[6 .. 12 + 52*count)`.
    pub crc: u16,
    /// Number of entries.
    pub count: u16,
    /// Total firmware size (informational).
    pub length: u32,
}

impl FwpkgHeader {
    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let magic = reader.read_u32::<LittleEndian>()?;
        let crc = reader.read_u16::<LittleEndian>()?;
        let count = reader.read_u16::<LittleEndian>()?;
        let length = reader.read_u32::<LittleEndian>()?;

        Ok(Self {
            magic,
            crc,
            count,
            length,
        })
    }

    /// Serialize the header back to its 12-byte on-file form.
    #[must_use]
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.write_u32::<LittleEndian>(self.magic).unwrap();
        buf.write_u16::<LittleEndian>(self.crc).unwrap();
        buf.write_u16::<LittleEndian>(self.count).unwrap();
        buf.write_u32::<LittleEndian>(self.length).unwrap();
        buf
    }
}

/// FWPKG entry metadata.
#[derive(Debug, Clone)]
pub struct BinInfo {
    /// Image name (at most 31 bytes on file, NUL-padded).
    pub name: String,
    /// Offset of the image bytes within the FWPKG file.
    pub offset: u32,
    /// Image length in bytes.
    pub length: u32,
    /// Destination flash address.
    pub burn_addr: u32,
    /// Burn size (informational, may exceed length due to alignment).
    pub burn_size: u32,
    /// Image kind.
    pub kind: ImageKind,
}

impl BinInfo {
    fn read_from<R: Read>(reader: &mut R, index: usize) -> Result<Self> {
        let mut name_bytes = [0u8; NAME_SIZE];
        reader.read_exact(&mut name_bytes)?;

        // Bytes up to the first NUL; a full 32-byte name has none to strip.
        let name_end = name_bytes.iter().position(|&c| c == 0).unwrap_or(NAME_SIZE);
        let name = std::str::from_utf8(&name_bytes[..name_end])
            .map_err(|_| Error::NameEncoding { index })?
            .to_string();

        let offset = reader.read_u32::<LittleEndian>()?;
        let length = reader.read_u32::<LittleEndian>()?;
        let burn_addr = reader.read_u32::<LittleEndian>()?;
        let burn_size = reader.read_u32::<LittleEndian>()?;
        let kind = reader.read_u32::<LittleEndian>()?.into();

        Ok(Self {
            name,
            offset,
            length,
            burn_addr,
            burn_size,
            kind,
        })
    }

    /// Serialize the entry back to its 52-byte on-file form.
    #[must_use]
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(BIN_INFO_SIZE);
        let mut name_bytes = [0u8; NAME_SIZE];
        let n = self.name.len().min(NAME_SIZE);
        name_bytes[..n].copy_from_slice(&self.name.as_bytes()[..n]);
        buf.extend_from_slice(&name_bytes);
        buf.write_u32::<LittleEndian>(self.offset).unwrap();
        buf.write_u32::<LittleEndian>(self.length).unwrap();
        buf.write_u32::<LittleEndian>(self.burn_addr).unwrap();
        buf.write_u32::<LittleEndian>(self.burn_size).unwrap();
        buf.write_u32::<LittleEndian>(self.kind.as_u32()).unwrap();
        buf
    }

    /// Check if this is the LoaderBoot entry.
    #[must_use]
    pub fn is_loader(&self) -> bool {
        self.kind == ImageKind::Loader
    }
}

/// Parsed FWPKG firmware package.
pub struct Fwpkg {
    /// File header.
    pub header: FwpkgHeader,
    /// Entry metadata, in declaration order.
    pub bins: Vec<BinInfo>,
    /// Raw file data.
    data: Vec<u8>,
}

impl Fwpkg {
    /// Load a FWPKG from a file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading FWPKG from: {}", path.display());

        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;

        Self::from_bytes(data)
    }

    /// Parse and validate a FWPKG from raw bytes.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::HeaderTruncated);
        }

        let mut cursor = Cursor::new(&data);
        let header = FwpkgHeader::read_from(&mut cursor)?;

        if header.magic != FWPKG_MAGIC {
            return Err(Error::BadMagic {
                found: header.magic,
            });
        }
        if header.count as usize > MAX_ENTRIES {
            return Err(Error::TooManyEntries {
                count: header.count,
            });
        }

        debug!(
            "FWPKG header: {} entries, {} bytes total",
            header.count, header.length
        );

        let bin_count = header.count as usize;
        let mut bins = Vec::with_capacity(bin_count);
        for i in 0..bin_count {
            if data.len() < HEADER_SIZE + (i + 1) * BIN_INFO_SIZE {
                return Err(Error::EntryTruncated { index: i });
            }
            let bin = BinInfo::read_from(&mut cursor, i)?;
            debug!(
                "  [{}] {} @ {:#010X}, {} bytes -> {:#010X} ({:?})",
                i, bin.name, bin.offset, bin.length, bin.burn_addr, bin.kind
            );
            bins.push(bin);
        }

        // CRC covers everything after magic(4) + crc(2) through the last entry.
        let crc_end = HEADER_SIZE + bin_count * BIN_INFO_SIZE;
        let actual = crc16_xmodem(&data[6..crc_end]);
        if actual != header.crc {
            return Err(Error::CrcMismatch {
                expected: header.crc,
                actual,
            });
        }
        debug!("FWPKG CRC verified: {:#06X}", header.crc);

        Ok(Self { header, bins, data })
    }

    /// Get the LoaderBoot entry, if present.
    #[must_use]
    pub fn loader(&self) -> Option<&BinInfo> {
        self.bins.iter().find(|b| b.is_loader())
    }

    /// Get the application entries (`type == 1`) in declaration order.
    pub fn apps(&self) -> impl Iterator<Item = &BinInfo> {
        self.bins.iter().filter(|b| b.kind == ImageKind::App)
    }

    /// Get every non-loader entry in declaration order.
    ///
    /// Reserved kinds are burned like applications, so the flashing
    /// sequence iterates these rather than [`Fwpkg::apps`].
    pub fn burnable_bins(&self) -> impl Iterator<Item = &BinInfo> {
        self.bins.iter().filter(|b| !b.is_loader())
    }

    /// Get the raw image bytes for an entry.
    pub fn bin_data(&self, bin: &BinInfo) -> Result<&[u8]> {
        let start = bin.offset as usize;
        let end = start.saturating_add(bin.length as usize);
        if end > self.data.len() {
            let index = self
                .bins
                .iter()
                .position(|b| std::ptr::eq(b, bin))
                .unwrap_or(0);
            return Err(Error::EntryTruncated { index });
        }
        Ok(&self.data[start..end])
    }

    /// Total number of entries.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.bins.len()
    }

    /// Re-serialize the header and entry table byte-exactly.
    #[must_use]
    pub fn metadata_bytes(&self) -> Vec<u8> {
        let mut buf = self.header.to_bytes();
        for bin in &self.bins {
            buf.extend_from_slice(&bin.to_bytes());
        }
        buf
    }
}

impl std::fmt::Debug for Fwpkg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fwpkg")
            .field("header", &self.header)
            .field("bins", &self.bins)
            .field("data_len", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a package from entry tuples `(name, offset, length, addr, size, kind)`
    /// plus trailing payload bytes, with a correct stored CRC.
    fn build_package(entries: &[(&str, u32, u32, u32, u32, u32)], payload: &[u8]) -> Vec<u8> {
        let bins: Vec<BinInfo> = entries
            .iter()
            .map(|&(name, offset, length, burn_addr, burn_size, kind)| BinInfo {
                name: name.to_string(),
                offset,
                length,
                burn_addr,
                burn_size,
                kind: kind.into(),
            })
            .collect();

        let mut body = Vec::new();
        for bin in &bins {
            body.extend_from_slice(&bin.to_bytes());
        }

        let total = (HEADER_SIZE + body.len() + payload.len()) as u32;
        let mut crc_region = Vec::new();
        crc_region.extend_from_slice(&(entries.len() as u16).to_le_bytes());
        crc_region.extend_from_slice(&total.to_le_bytes());
        crc_region.extend_from_slice(&body);

        let header = FwpkgHeader {
            magic: FWPKG_MAGIC,
            crc: crc16_xmodem(&crc_region),
            count: entries.len() as u16,
            length: total,
        };

        let mut pkg = header.to_bytes();
        pkg.extend_from_slice(&body);
        pkg.extend_from_slice(payload);
        pkg
    }

    #[test]
    fn test_parse_single_loader_entry() {
        let pkg = build_package(&[("loader", 64, 0, 0, 0, 0)], &[]);
        assert_eq!(pkg.len(), 64);

        let fwpkg = Fwpkg::from_bytes(pkg).unwrap();
        assert_eq!(fwpkg.entry_count(), 1);
        let loader = fwpkg.loader().unwrap();
        assert_eq!(loader.name, "loader");
        assert_eq!(loader.offset, 64);
        assert!(fwpkg.apps().next().is_none());
    }

    #[test]
    fn test_parse_known_crc() {
        // The golden 64-byte single-entry package carries CRC 0x1939.
        let pkg = build_package(&[("loader", 64, 0, 0, 0, 0)], &[]);
        let fwpkg = Fwpkg::from_bytes(pkg).unwrap();
        assert_eq!(fwpkg.header.crc, 0x1939);
    }

    #[test]
    fn test_reject_header_truncated() {
        assert!(matches!(
            Fwpkg::from_bytes(vec![0u8; 11]),
            Err(Error::HeaderTruncated)
        ));
    }

    #[test]
    fn test_reject_bad_magic() {
        let mut pkg = build_package(&[("loader", 64, 0, 0, 0, 0)], &[]);
        pkg[0] = 0xDE;
        assert!(matches!(
            Fwpkg::from_bytes(pkg),
            Err(Error::BadMagic { found: 0xEFBE_ADDE })
        ));
    }

    #[test]
    fn test_reject_too_many_entries() {
        let mut pkg = build_package(&[("loader", 64, 0, 0, 0, 0)], &[]);
        pkg[6..8].copy_from_slice(&17u16.to_le_bytes());
        assert!(matches!(
            Fwpkg::from_bytes(pkg),
            Err(Error::TooManyEntries { count: 17 })
        ));
    }

    #[test]
    fn test_reject_entry_truncated() {
        let pkg = build_package(
            &[("loader", 116, 0, 0, 0, 0), ("app", 116, 0, 0x800000, 0, 1)],
            &[],
        );
        let truncated = pkg[..HEADER_SIZE + BIN_INFO_SIZE + 10].to_vec();
        assert!(matches!(
            Fwpkg::from_bytes(truncated),
            Err(Error::EntryTruncated { index: 1 })
        ));
    }

    #[test]
    fn test_reject_crc_mismatch() {
        let mut pkg = build_package(&[("loader", 64, 0, 0, 0, 0)], &[]);
        // Corrupt a name byte without updating the stored CRC.
        pkg[HEADER_SIZE] = b'x';
        assert!(matches!(
            Fwpkg::from_bytes(pkg),
            Err(Error::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_reject_invalid_name_encoding() {
        let mut pkg = build_package(&[("loader", 64, 0, 0, 0, 0)], &[]);
        // 0xFF is never valid UTF-8; keep it before the NUL terminator.
        pkg[HEADER_SIZE] = 0xFF;
        // Recompute the CRC so the name check is what fails.
        let crc = crc16_xmodem(&pkg[6..HEADER_SIZE + BIN_INFO_SIZE]);
        pkg[4..6].copy_from_slice(&crc.to_le_bytes());
        assert!(matches!(
            Fwpkg::from_bytes(pkg),
            Err(Error::NameEncoding { index: 0 })
        ));
    }

    #[test]
    fn test_metadata_round_trip() {
        let pkg = build_package(
            &[
                ("loaderboot", 116, 4, 0, 4, 0),
                ("app", 120, 8, 0x230000, 8, 1),
            ],
            &[0xAA; 12],
        );
        let fwpkg = Fwpkg::from_bytes(pkg.clone()).unwrap();
        let meta_len = HEADER_SIZE + 2 * BIN_INFO_SIZE;
        assert_eq!(fwpkg.metadata_bytes(), pkg[..meta_len].to_vec());
    }

    #[test]
    fn test_bin_data_slicing() {
        let payload = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];
        let pkg = build_package(
            &[
                ("loaderboot", 116, 2, 0, 2, 0),
                ("app", 118, 4, 0x230000, 4, 1),
            ],
            &payload,
        );
        let fwpkg = Fwpkg::from_bytes(pkg).unwrap();
        assert_eq!(fwpkg.bin_data(fwpkg.loader().unwrap()).unwrap(), &[0x11, 0x22]);
        let app = fwpkg.apps().next().unwrap();
        assert_eq!(fwpkg.bin_data(app).unwrap(), &[0x33, 0x44, 0x55, 0x66]);
    }

    #[test]
    fn test_bin_data_out_of_bounds() {
        let pkg = build_package(&[("loader", 64, 4, 0, 4, 0)], &[]);
        let fwpkg = Fwpkg::from_bytes(pkg).unwrap();
        let loader = fwpkg.loader().unwrap();
        assert!(matches!(
            fwpkg.bin_data(loader),
            Err(Error::EntryTruncated { index: 0 })
        ));
    }

    #[test]
    fn test_reserved_kind_is_burnable() {
        let pkg = build_package(
            &[
                ("loaderboot", 168, 0, 0, 0, 0),
                ("nv", 168, 0, 0x400000, 0, 2),
                ("app", 168, 0, 0x230000, 0, 1),
            ],
            &[],
        );
        let fwpkg = Fwpkg::from_bytes(pkg).unwrap();
        // apps() is strict about kind 1...
        assert_eq!(fwpkg.apps().count(), 1);
        // ...while the burn sequence carries reserved kinds through.
        let burnable: Vec<_> = fwpkg.burnable_bins().map(|b| b.name.as_str()).collect();
        assert_eq!(burnable, ["nv", "app"]);
        assert_eq!(fwpkg.bins[1].kind, ImageKind::Other(2));
        assert_eq!(fwpkg.bins[1].kind.as_u32(), 2);
    }

    #[test]
    fn test_image_kind_from_u32() {
        assert_eq!(ImageKind::from(0), ImageKind::Loader);
        assert_eq!(ImageKind::from(1), ImageKind::App);
        assert_eq!(ImageKind::from(7), ImageKind::Other(7));
    }
}
