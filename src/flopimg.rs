// Floppy disk image file management. Whatever the source file format, the
// authoritative in-memory state is the raw MFM track buffer; the source
// format is only rebuilt from it when a dirty image is synced back.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::{info, warn};

use crate::error::HostError;

/// Raw byte length of one track side.
pub const TRACK_BYTES: usize = 6250;
/// Highest supported track count.
pub const MAXTRACK: usize = 85;
pub const SECTOR_BYTES: usize = 512;

/// Source file format of a floppy image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// Flat dump of the raw MFM cells (.mfm).
    RawMfm,
    /// Flat concatenation of 512-byte sectors (.st).
    SectorImage,
    /// Per-track RLE-packed sector image (.msa).
    CompressedSectorImage,
}

const fn build_crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut w = (i as u16) << 8;
        let mut j = 0;
        while j < 8 {
            w = (w << 1) ^ (0x1021 & (w >> 15).wrapping_neg());
            j += 1;
        }
        table[i] = w;
        i += 1;
    }
    table
}

static CRC16_TABLE: [u16; 256] = build_crc16_table();

/// CCITT CRC-16 as used in MFM address marks and data fields: polynomial
/// 0x1021, initial value 0xCDB4 (the A1 A1 A1 sync run already folded in).
pub fn crc16(buf: &[u8]) -> u16 {
    let mut crc = 0xcdb4u16;
    for &b in buf {
        crc = CRC16_TABLE[(crc >> 8 ^ b as u16) as usize] ^ (crc << 8);
    }
    crc
}

fn read_le16(p: &[u8]) -> u16 {
    u16::from_le_bytes([p[0], p[1]])
}

fn read_be16(p: &[u8]) -> u16 {
    u16::from_be_bytes([p[0], p[1]])
}

/// Find the next 00 00 00 A1 A1 A1 sync preamble at or after `from`.
fn find_preamble(track: &[u8], from: usize) -> Option<usize> {
    const HEAD: [u8; 6] = [0, 0, 0, 0xa1, 0xa1, 0xa1];
    if track.len() < HEAD.len() {
        return None;
    }
    (from..track.len() - HEAD.len()).find(|&i| track[i..i + HEAD.len()] == HEAD)
}

/// Locate the 512-byte payload of `sector` on a raw track. Returns the
/// payload offset within the track.
pub fn find_sector(track: &[u8], tr: u8, side: u8, sector: u8) -> Option<usize> {
    let mut p = 0;
    loop {
        p = find_preamble(track, p)?;
        if track[p + 6] != 0xfe || track[p + 7] != tr || track[p + 8] != side {
            warn!("wrong ID address mark");
            return None;
        }
        let hit = track[p + 9] == sector;
        p += 11;
        p = find_preamble(track, p)?;
        if track[p + 6] != 0xfb {
            warn!("wrong data address mark");
            return None;
        }
        if p + 7 + SECTOR_BYTES + 2 > track.len() {
            return None;
        }
        if hit {
            return Some(p + 7);
        }
        p += 521;
    }
}

/// Gap widths for one track, by sectors per track.
fn gap_table(nsectors: usize) -> (usize, usize, usize, usize) {
    match nsectors {
        11 => (10, 3, 1, 14),
        10 => (60, 12, 40, 50),
        _ => (60, 12, 40, 664),
    }
}

/// Angular order of logical sectors on one track, stepping by `interleave`.
fn sector_order(nsectors: usize, interleave: usize, sec_shift: usize) -> Vec<u8> {
    let mut order = vec![0u8; nsectors];
    let mut written = 0u32;
    let mut sec_no = sec_shift;
    for i in 0..nsectors {
        order[sec_no] = i as u8;
        written |= 1 << sec_no;
        sec_no = (sec_no + interleave) % nsectors;
        if i + 1 < nsectors {
            while written & (1 << sec_no) != 0 {
                sec_no = if sec_no + 1 < nsectors { sec_no + 1 } else { 0 };
            }
        }
    }
    order
}

pub struct FlopImg {
    file: std::fs::File,
    format: ImageFormat,
    read_only: bool,
    dirty: bool,
    buf: Vec<u8>,
    ntracks: usize,
    nsides: usize,
    nsectors: usize,
    image_size: u64,
}

impl FlopImg {
    /// Open a floppy image file; the format is determined by the file name
    /// extension. `skew` and `interleave` control the sector layout
    /// synthesized for structured formats.
    pub fn open<P: AsRef<Path>>(
        path: P,
        read_only: bool,
        skew: usize,
        interleave: usize,
    ) -> Result<FlopImg, HostError> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        let format = match ext.as_deref() {
            Some("mfm") => ImageFormat::RawMfm,
            Some("st") => ImageFormat::SectorImage,
            Some("msa") => ImageFormat::CompressedSectorImage,
            _ => return Err(HostError::UnknownImageFormat(path.display().to_string())),
        };
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)
            .map_err(|e| HostError::ImageOpen { path: path.display().to_string(), source: e })?;
        let mut img = FlopImg {
            file,
            format,
            read_only,
            dirty: false,
            buf: vec![0u8; TRACK_BYTES * 2 * MAXTRACK],
            ntracks: 0,
            nsides: 0,
            nsectors: 0,
            image_size: 0,
        };
        match format {
            ImageFormat::RawMfm => img.load_mfm()?,
            _ => img.load_sectors(skew, interleave)?,
        }
        Ok(img)
    }

    pub fn geometry(&self) -> (usize, usize, usize) {
        (self.ntracks, self.nsides, self.nsectors)
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Raw bytes of one track side.
    pub fn track(&self, track: usize, side: usize) -> &[u8] {
        let base = (track * self.nsides + side) * TRACK_BYTES;
        &self.buf[base..base + TRACK_BYTES]
    }

    /// Mutable track access, growing the recorded geometry if the fabric
    /// seeks beyond it (a reformat in progress).
    pub fn track_mut(&mut self, track: usize, side: usize) -> &mut [u8] {
        if track >= self.ntracks {
            self.ntracks = track + 1;
        }
        if side >= self.nsides {
            self.nsides = side + 1;
        }
        let base = (track * self.nsides + side) * TRACK_BYTES;
        &mut self.buf[base..base + TRACK_BYTES]
    }

    /// Mark the raw buffer as modified; the source file is rewritten on the
    /// next sync.
    pub fn mark_dirty(&mut self) {
        if !self.read_only {
            self.dirty = true;
        }
    }

    fn load_mfm(&mut self) -> Result<(), HostError> {
        let size = (self.file.metadata()?.len() as usize).min(self.buf.len());
        if size == 0 {
            return Ok(());
        }
        self.file.read_exact(&mut self.buf[..size])?;
        let mut have_header = false;
        if let Some(p) = find_sector(&self.buf[..TRACK_BYTES], 0, 0, 1) {
            let boot = &self.buf[p..p + SECTOR_BYTES];
            let sectors = read_le16(&boot[0x18..]) as usize;
            let sides = read_le16(&boot[0x1a..]) as usize;
            if (9..=11).contains(&sectors) && (1..=2).contains(&sides) {
                self.nsectors = sectors;
                self.nsides = sides;
                self.ntracks = read_le16(&boot[0x13..]) as usize / (sectors * sides);
                have_header = true;
            }
        }
        if !have_header {
            if size > TRACK_BYTES * 100 {
                self.nsides = 2;
                self.ntracks = size / (TRACK_BYTES * 2);
            } else {
                self.nsides = 1;
                self.ntracks = size / TRACK_BYTES;
            }
        }
        Ok(())
    }

    /// Derive a plausible geometry from the file size alone, preferring
    /// two-sided and 9-sector layouts.
    fn guess_size(&mut self) -> Result<(), HostError> {
        if self.image_size % SECTOR_BYTES as u64 != 0 {
            return Err(HostError::BadGeometry);
        }
        let size = self.image_size;
        for tracks in (1..=MAXTRACK as u64).rev() {
            for sectors in 9..=11u64 {
                if size % tracks != 0 {
                    continue;
                }
                if size % (tracks * sectors * 2 * SECTOR_BYTES as u64) == 0 {
                    self.ntracks = tracks as usize;
                    self.nsides = 2;
                    self.nsectors = sectors as usize;
                    info!(tracks, sides = 2, sectors, "geometry guessed");
                    return Ok(());
                }
                if size % (tracks * sectors * SECTOR_BYTES as u64) == 0 {
                    self.ntracks = tracks as usize;
                    self.nsides = 1;
                    self.nsectors = sectors as usize;
                    info!(tracks, sides = 1, sectors, "geometry guessed");
                    return Ok(());
                }
            }
        }
        Err(HostError::BadGeometry)
    }

    fn load_sectors(&mut self, skew: usize, mut interleave: usize) -> Result<(), HostError> {
        self.image_size = self.file.seek(SeekFrom::End(0))?;
        self.file.seek(SeekFrom::Start(0))?;

        if self.format == ImageFormat::SectorImage {
            let mut boot = [0u8; 32];
            self.file.read_exact(&mut boot)?;
            self.file.seek(SeekFrom::Start(0))?;

            self.nsectors = read_le16(&boot[0x18..]) as usize;
            self.nsides = read_le16(&boot[0x1a..]) as usize;
            let total = read_le16(&boot[0x13..]) as usize;
            let per_track = self.nsectors * self.nsides;
            self.ntracks = if per_track > 0 { total / per_track } else { 0 };
            info!(
                tracks = self.ntracks,
                sides = self.nsides,
                sectors = self.nsectors,
                "sector image"
            );

            let bps = read_le16(&boot[0x0b..]);
            if bps != SECTOR_BYTES as u16 {
                warn!(bps, "invalid sector size");
                self.guess_size()?;
            }
            if !(9..=11).contains(&self.nsectors) {
                warn!(sectors = self.nsectors, "unsupported number of sectors per track");
                self.guess_size()?;
            }
            if self.ntracks > MAXTRACK || self.ntracks == 0 {
                warn!(tracks = self.ntracks, "unsupported number of tracks");
                self.guess_size()?;
            }
        } else {
            let mut header = [0u8; 10];
            self.file.read_exact(&mut header)?;
            if read_be16(&header) != 0x0e0f {
                return Err(HostError::BadImageHeader);
            }
            self.nsectors = read_be16(&header[2..]) as usize;
            self.nsides = read_be16(&header[4..]) as usize + 1;
            let start_track = read_be16(&header[6..]);
            if start_track != 0 {
                return Err(HostError::PartialImage(start_track));
            }
            self.ntracks = read_be16(&header[8..]) as usize + 1;
            info!(
                tracks = self.ntracks,
                sides = self.nsides,
                sectors = self.nsectors,
                "compressed sector image"
            );
        }

        let (gap1, gap2, gap4, gap5) = gap_table(self.nsectors);

        if interleave == 0 {
            interleave = 1;
        }
        if interleave == 1 && self.nsectors == 11 {
            interleave = 2;
        }

        let nsectors = self.nsectors;
        let nsides = self.nsides;
        let ntracks = self.ntracks;
        let mut sec_shift = 1usize;
        let mut payload = vec![0u8; SECTOR_BYTES * 11];

        for track in 0..ntracks {
            let order = sector_order(nsectors, interleave, sec_shift);
            sec_shift = (sec_shift + skew) % nsectors;

            for side in 0..nsides {
                self.read_track_payload(&mut payload[..SECTOR_BYTES * nsectors])?;

                let trk = {
                    let base = (track * nsides + side) * TRACK_BYTES;
                    &mut self.buf[base..base + TRACK_BYTES]
                };
                let mut p = 0;
                for _ in 0..gap1 {
                    trk[p] = 0x4e;
                    p += 1;
                }
                for sector in 0..nsectors {
                    let sec_no = order[sector] as usize;
                    for _ in 0..gap2 {
                        trk[p] = 0x00;
                        p += 1;
                    }
                    for _ in 0..3 {
                        trk[p] = 0xa1;
                        p += 1;
                    }
                    trk[p] = 0xfe;
                    trk[p + 1] = track as u8;
                    trk[p + 2] = side as u8;
                    trk[p + 3] = sec_no as u8 + 1;
                    trk[p + 4] = 2;
                    let crc = crc16(&trk[p..p + 5]);
                    trk[p + 5] = (crc >> 8) as u8;
                    trk[p + 6] = crc as u8;
                    p += 7;
                    for _ in 0..22 {
                        trk[p] = 0x4e;
                        p += 1;
                    }
                    for _ in 0..12 {
                        trk[p] = 0x00;
                        p += 1;
                    }
                    for _ in 0..3 {
                        trk[p] = 0xa1;
                        p += 1;
                    }
                    trk[p] = 0xfb;
                    trk[p + 1..p + 1 + SECTOR_BYTES]
                        .copy_from_slice(&payload[sec_no * SECTOR_BYTES..(sec_no + 1) * SECTOR_BYTES]);
                    let crc = crc16(&trk[p..p + 1 + SECTOR_BYTES]);
                    p += 1 + SECTOR_BYTES;
                    trk[p] = (crc >> 8) as u8;
                    trk[p + 1] = crc as u8;
                    p += 2;
                    for _ in 0..gap4 {
                        trk[p] = 0x4e;
                        p += 1;
                    }
                }
                for _ in 0..gap5 {
                    trk[p] = 0x4e;
                    p += 1;
                }
                if p != TRACK_BYTES {
                    warn!(track, side, bytes = p, "track format error");
                }
            }
        }
        Ok(())
    }

    /// Read one track worth of sector payloads from the source file,
    /// expanding the RLE packing for compressed images.
    fn read_track_payload(&mut self, dest: &mut [u8]) -> Result<(), HostError> {
        if self.format == ImageFormat::SectorImage {
            self.file.read_exact(dest)?;
            return Ok(());
        }
        let mut lenbuf = [0u8; 2];
        self.file.read_exact(&mut lenbuf)?;
        let datalen = read_be16(&lenbuf) as usize;
        if datalen == dest.len() {
            // uncompressed track
            self.file.read_exact(dest)?;
            return Ok(());
        }
        let mut packed = vec![0u8; datalen];
        self.file.read_exact(&mut packed)?;
        let mut src = 0;
        let mut out = 0;
        while out < dest.len() {
            let b = *packed.get(src).ok_or(HostError::BadImageHeader)?;
            src += 1;
            if b == 0xe5 {
                let v = *packed.get(src).ok_or(HostError::BadImageHeader)?;
                if src + 3 > packed.len() {
                    return Err(HostError::BadImageHeader);
                }
                let length = read_be16(&packed[src + 1..src + 3]) as usize;
                src += 3;
                if out + length > dest.len() {
                    return Err(HostError::BadImageHeader);
                }
                for d in &mut dest[out..out + length] {
                    *d = v;
                }
                out += length;
            } else {
                dest[out] = b;
                out += 1;
            }
        }
        Ok(())
    }

    /// Geometry as recorded in the boot sector of the raw buffer; used on
    /// writeback in case the disk was reformatted by the guest.
    fn boot_geometry(&self) -> Option<(usize, usize, usize)> {
        let p = find_sector(self.track(0, 0), 0, 0, 1)?;
        let boot = &self.track(0, 0)[p..p + SECTOR_BYTES];
        let sectors = read_le16(&boot[0x18..]) as usize;
        let sides = read_le16(&boot[0x1a..]) as usize;
        if sectors == 0 || sides == 0 {
            return None;
        }
        let tracks = read_le16(&boot[0x13..]) as usize / (sectors * sides);
        Some((tracks, sides, sectors))
    }

    fn save_mfm(&mut self) -> Result<(), HostError> {
        self.file.seek(SeekFrom::Start(0))?;
        let len = TRACK_BYTES * self.nsides * self.ntracks;
        self.file.write_all(&self.buf[..len])?;
        Ok(())
    }

    fn save_st(&mut self) -> Result<(), HostError> {
        let (ntracks, nsides, nsectors) = match self.boot_geometry() {
            Some(g) => g,
            None => {
                warn!("sector not found");
                return Ok(());
            }
        };
        self.file.seek(SeekFrom::Start(0))?;
        for track in 0..ntracks {
            for side in 0..nsides {
                let base = (track * self.nsides + side) * TRACK_BYTES;
                for sector in 0..nsectors {
                    let trk = &self.buf[base..base + TRACK_BYTES];
                    match find_sector(trk, track as u8, side as u8, sector as u8 + 1) {
                        Some(p) => self.file.write_all(&trk[p..p + SECTOR_BYTES])?,
                        None => {
                            warn!(track, side, sector, "sector not found");
                            return Ok(());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn save_msa(&mut self) -> Result<(), HostError> {
        let (ntracks, nsides, nsectors) = match self.boot_geometry() {
            Some(g) => g,
            None => {
                warn!("sector not found");
                return Ok(());
            }
        };
        self.file.seek(SeekFrom::Start(0))?;
        let mut header = [0u8; 10];
        header[0] = 0x0e;
        header[1] = 0x0f;
        header[2..4].copy_from_slice(&(nsectors as u16).to_be_bytes());
        header[4..6].copy_from_slice(&(nsides as u16 - 1).to_be_bytes());
        header[6..8].copy_from_slice(&0u16.to_be_bytes());
        header[8..10].copy_from_slice(&(ntracks as u16 - 1).to_be_bytes());
        self.file.write_all(&header)?;
        let mut length = 10u64;

        let mut trbuf = vec![0u8; nsectors * SECTOR_BYTES];
        for track in 0..ntracks {
            for side in 0..nsides {
                let base = (track * self.nsides + side) * TRACK_BYTES;
                let trk = &self.buf[base..base + TRACK_BYTES];
                for sector in 0..nsectors {
                    match find_sector(trk, track as u8, side as u8, sector as u8 + 1) {
                        Some(p) => trbuf[sector * SECTOR_BYTES..(sector + 1) * SECTOR_BYTES]
                            .copy_from_slice(&trk[p..p + SECTOR_BYTES]),
                        None => {
                            warn!(track, side, sector, "sector not found");
                            return Ok(());
                        }
                    }
                }
                match msa_pack(&trbuf) {
                    Some(packed) => {
                        self.file.write_all(&(packed.len() as u16).to_be_bytes())?;
                        self.file.write_all(&packed)?;
                        length += 2 + packed.len() as u64;
                    }
                    None => {
                        // compression failed, write uncompressed
                        self.file.write_all(&(trbuf.len() as u16).to_be_bytes())?;
                        self.file.write_all(&trbuf)?;
                        length += 2 + trbuf.len() as u64;
                    }
                }
            }
        }
        self.file.set_len(length)?;
        Ok(())
    }

    /// Rebuild the source file from the raw buffer if it was modified.
    pub fn sync(&mut self) -> Result<(), HostError> {
        if !self.dirty {
            return Ok(());
        }
        match self.format {
            ImageFormat::RawMfm => self.save_mfm()?,
            ImageFormat::SectorImage => self.save_st()?,
            ImageFormat::CompressedSectorImage => self.save_msa()?,
        }
        self.dirty = false;
        Ok(())
    }
}

impl Drop for FlopImg {
    fn drop(&mut self) {
        if let Err(e) = self.sync() {
            warn!("floppy image sync on close failed: {}", e);
        }
    }
}

/// RLE-pack one track of sector data. The escape byte 0xE5 introduces a
/// (value, 16-bit count) run; a lone 0xE5 in the input must itself be run
/// encoded. Returns `None` unless the packed form is strictly shorter.
pub fn msa_pack(src: &[u8]) -> Option<Vec<u8>> {
    let mut dest = Vec::with_capacity(src.len());
    let mut p = 0;
    while p < src.len() {
        let pkv = src[p];
        let start = p;
        p += 1;
        while p < src.len() && src[p] == pkv {
            p += 1;
        }
        let n = p - start;
        if (n > 4 || pkv == 0xe5) && dest.len() + 4 < src.len() {
            dest.push(0xe5);
            dest.push(pkv);
            dest.extend_from_slice(&(n as u16).to_be_bytes());
        } else if dest.len() + n < src.len() {
            dest.resize(dest.len() + n, pkv);
        } else {
            return None;
        }
    }
    Some(dest)
}

/// Expand one RLE-packed track. Used by tests and by the loader above.
pub fn msa_unpack(packed: &[u8], expanded_len: usize) -> Result<Vec<u8>, HostError> {
    let mut dest = Vec::with_capacity(expanded_len);
    let mut src = 0;
    while dest.len() < expanded_len {
        let b = *packed.get(src).ok_or(HostError::BadImageHeader)?;
        src += 1;
        if b == 0xe5 {
            let v = *packed.get(src).ok_or(HostError::BadImageHeader)?;
            if src + 3 > packed.len() {
                return Err(HostError::BadImageHeader);
            }
            let length = read_be16(&packed[src + 1..src + 3]) as usize;
            src += 3;
            if dest.len() + length > expanded_len {
                return Err(HostError::BadImageHeader);
            }
            dest.resize(dest.len() + length, v);
        } else {
            dest.push(b);
        }
    }
    Ok(dest)
}
