//! Motion-JPEG MP4 muxer.
//!
//! Each frame is JPEG-compressed and streamed straight into the `mdat` box
//! while recording; the sample tables are only known at the end, so `moov`
//! is appended after `mdat` when the file is finished.
//!
//! ```text
//! ftyp
//! mdat (64-bit size, patched on finish)
//! moov
//!   mvhd
//!   trak
//!     tkhd
//!     mdia
//!       mdhd / hdlr
//!       minf
//!         vmhd / dinf
//!         stbl (stsd[mp4v+esds], stts, stsc, stsz, co64)
//! ```

use anyhow::{ensure, Context, Result};
use image::{codecs::jpeg::JpegEncoder, RgbImage};
use std::{
    fs::File,
    io::{BufWriter, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use crate::camera::Dimensions;

/// Media timescale (ticks per second).
const TIMESCALE: u32 = 90_000;
/// Movie header timescale, milliseconds.
const MOVIE_TIMESCALE: u32 = 1_000;
/// MPEG-4 Systems object type for JPEG.
const OBJECT_TYPE_JPEG: u8 = 0x6C;
const IDENTITY_MATRIX: [u32; 9] = [0x00010000, 0, 0, 0, 0x00010000, 0, 0, 0, 0x40000000];

pub struct MjpegMp4Writer {
    file: BufWriter<File>,
    path: PathBuf,
    dimensions: Dimensions,
    sample_delta: u32,
    quality: u8,
    /// Offset of the `mdat` box header.
    mdat_start: u64,
    /// Offset of the first sample byte.
    data_start: u64,
    sample_sizes: Vec<u32>,
    payload_bytes: u64,
    scratch: Vec<u8>,
}

impl MjpegMp4Writer {
    pub fn create(path: &Path, dimensions: Dimensions, fps: u32, quality: u8) -> Result<Self> {
        ensure!(
            dimensions.width > 0 && dimensions.height > 0,
            "cannot open a {}x{} video stream",
            dimensions.width,
            dimensions.height
        );
        ensure!(
            dimensions.width <= u16::MAX as u32 && dimensions.height <= u16::MAX as u32,
            "{}x{} exceeds the sample entry size limit",
            dimensions.width,
            dimensions.height
        );

        let file = File::create(path)
            .with_context(|| format!("failed to create video file {}", path.display()))?;
        let mut file = BufWriter::new(file);

        let mut header = Vec::new();
        write_ftyp(&mut header);
        let mdat_start = header.len() as u64;
        // size = 1 selects the 64-bit largesize that follows the type.
        header.extend_from_slice(&1u32.to_be_bytes());
        header.extend_from_slice(b"mdat");
        header.extend_from_slice(&0u64.to_be_bytes());
        let data_start = header.len() as u64;

        file.write_all(&header)
            .with_context(|| format!("failed to write header to {}", path.display()))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            dimensions,
            sample_delta: TIMESCALE / fps.clamp(1, TIMESCALE),
            quality,
            mdat_start,
            data_start,
            sample_sizes: Vec::new(),
            payload_bytes: 0,
            scratch: Vec::new(),
        })
    }

    pub fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    pub fn frame_count(&self) -> usize {
        self.sample_sizes.len()
    }

    pub fn write_frame(&mut self, image: &RgbImage) -> Result<()> {
        let frame_dims = Dimensions::of(image);
        ensure!(
            frame_dims == self.dimensions,
            "frame is {}x{}, stream was opened at {}x{}",
            frame_dims.width,
            frame_dims.height,
            self.dimensions.width,
            self.dimensions.height
        );

        self.scratch.clear();
        JpegEncoder::new_with_quality(&mut self.scratch, self.quality)
            .encode_image(image)
            .context("jpeg encoding failed")?;

        let size = u32::try_from(self.scratch.len()).context("encoded frame exceeds 4 GiB")?;
        self.file
            .write_all(&self.scratch)
            .with_context(|| format!("failed to append frame to {}", self.path.display()))?;
        self.sample_sizes.push(size);
        self.payload_bytes += size as u64;
        Ok(())
    }

    /// Patch the `mdat` size, append `moov` and close the file.
    /// Returns the final file size in bytes.
    pub fn finish(mut self) -> Result<u64> {
        let mdat_size = 16 + self.payload_bytes;
        self.file.seek(SeekFrom::Start(self.mdat_start + 8))?;
        self.file.write_all(&mdat_size.to_be_bytes())?;
        self.file.seek(SeekFrom::End(0))?;

        let mut moov = Vec::new();
        self.write_moov(&mut moov);
        self.file
            .write_all(&moov)
            .with_context(|| format!("failed to write moov to {}", self.path.display()))?;

        let file = self
            .file
            .into_inner()
            .map_err(|err| err.into_error())
            .context("failed to flush video file")?;
        file.sync_all()?;
        Ok(file.metadata()?.len())
    }

    fn media_duration(&self) -> u64 {
        self.sample_sizes.len() as u64 * self.sample_delta as u64
    }

    fn movie_duration(&self) -> u32 {
        (self.media_duration() * MOVIE_TIMESCALE as u64 / TIMESCALE as u64) as u32
    }

    fn write_moov(&self, buf: &mut Vec<u8>) {
        let mut content = Vec::new();
        self.write_mvhd(&mut content);
        self.write_trak(&mut content);
        write_box(buf, b"moov", &content);
    }

    fn write_mvhd(&self, buf: &mut Vec<u8>) {
        let mut content = Vec::new();
        content.extend_from_slice(&0u32.to_be_bytes()); // creation time
        content.extend_from_slice(&0u32.to_be_bytes()); // modification time
        content.extend_from_slice(&MOVIE_TIMESCALE.to_be_bytes());
        content.extend_from_slice(&self.movie_duration().to_be_bytes());
        content.extend_from_slice(&0x00010000u32.to_be_bytes()); // rate 1.0
        content.extend_from_slice(&0x0100u16.to_be_bytes()); // volume 1.0
        content.extend_from_slice(&[0; 10]); // reserved
        for m in &IDENTITY_MATRIX {
            content.extend_from_slice(&m.to_be_bytes());
        }
        content.extend_from_slice(&[0; 24]); // pre_defined
        content.extend_from_slice(&2u32.to_be_bytes()); // next_track_id
        write_full_box(buf, b"mvhd", 0, 0, &content);
    }

    fn write_trak(&self, buf: &mut Vec<u8>) {
        let mut content = Vec::new();
        self.write_tkhd(&mut content);
        self.write_mdia(&mut content);
        write_box(buf, b"trak", &content);
    }

    fn write_tkhd(&self, buf: &mut Vec<u8>) {
        let mut content = Vec::new();
        content.extend_from_slice(&0u32.to_be_bytes()); // creation time
        content.extend_from_slice(&0u32.to_be_bytes()); // modification time
        content.extend_from_slice(&1u32.to_be_bytes()); // track id
        content.extend_from_slice(&0u32.to_be_bytes()); // reserved
        content.extend_from_slice(&self.movie_duration().to_be_bytes());
        content.extend_from_slice(&[0; 8]); // reserved
        content.extend_from_slice(&0i16.to_be_bytes()); // layer
        content.extend_from_slice(&0i16.to_be_bytes()); // alternate_group
        content.extend_from_slice(&0i16.to_be_bytes()); // volume
        content.extend_from_slice(&0u16.to_be_bytes()); // reserved
        for m in &IDENTITY_MATRIX {
            content.extend_from_slice(&m.to_be_bytes());
        }
        content.extend_from_slice(&(self.dimensions.width << 16).to_be_bytes());
        content.extend_from_slice(&(self.dimensions.height << 16).to_be_bytes());
        // enabled | in movie
        write_full_box(buf, b"tkhd", 0, 3, &content);
    }

    fn write_mdia(&self, buf: &mut Vec<u8>) {
        let mut content = Vec::new();

        let mut mdhd = Vec::new();
        mdhd.extend_from_slice(&0u32.to_be_bytes()); // creation time
        mdhd.extend_from_slice(&0u32.to_be_bytes()); // modification time
        mdhd.extend_from_slice(&TIMESCALE.to_be_bytes());
        mdhd.extend_from_slice(&(self.media_duration() as u32).to_be_bytes());
        mdhd.extend_from_slice(&0x55c4u16.to_be_bytes()); // language (und)
        mdhd.extend_from_slice(&0u16.to_be_bytes());
        write_full_box(&mut content, b"mdhd", 0, 0, &mdhd);

        let mut hdlr = Vec::new();
        hdlr.extend_from_slice(&0u32.to_be_bytes()); // pre_defined
        hdlr.extend_from_slice(b"vide");
        hdlr.extend_from_slice(&[0; 12]);
        hdlr.extend_from_slice(b"VideoHandler\0");
        write_full_box(&mut content, b"hdlr", 0, 0, &hdlr);

        self.write_minf(&mut content);
        write_box(buf, b"mdia", &content);
    }

    fn write_minf(&self, buf: &mut Vec<u8>) {
        let mut content = Vec::new();

        let mut vmhd = Vec::new();
        vmhd.extend_from_slice(&0u16.to_be_bytes()); // graphics_mode
        vmhd.extend_from_slice(&[0; 6]); // opcolor
        write_full_box(&mut content, b"vmhd", 0, 1, &vmhd);

        let mut url = Vec::new();
        write_full_box(&mut url, b"url ", 0, 1, &[]); // self-contained
        let mut dref = Vec::new();
        dref.extend_from_slice(&1u32.to_be_bytes());
        dref.extend_from_slice(&url);
        let mut dinf = Vec::new();
        write_full_box(&mut dinf, b"dref", 0, 0, &dref);
        write_box(&mut content, b"dinf", &dinf);

        self.write_stbl(&mut content);
        write_box(buf, b"minf", &content);
    }

    fn write_stbl(&self, buf: &mut Vec<u8>) {
        let count = self.sample_sizes.len() as u32;
        let mut content = Vec::new();

        let mut stsd = Vec::new();
        stsd.extend_from_slice(&1u32.to_be_bytes());
        self.write_mp4v(&mut stsd);
        write_full_box(&mut content, b"stsd", 0, 0, &stsd);

        let mut stts = Vec::new();
        if count > 0 {
            stts.extend_from_slice(&1u32.to_be_bytes());
            stts.extend_from_slice(&count.to_be_bytes());
            stts.extend_from_slice(&self.sample_delta.to_be_bytes());
        } else {
            stts.extend_from_slice(&0u32.to_be_bytes());
        }
        write_full_box(&mut content, b"stts", 0, 0, &stts);

        // All samples live in a single chunk.
        let mut stsc = Vec::new();
        if count > 0 {
            stsc.extend_from_slice(&1u32.to_be_bytes());
            stsc.extend_from_slice(&1u32.to_be_bytes()); // first_chunk
            stsc.extend_from_slice(&count.to_be_bytes()); // samples_per_chunk
            stsc.extend_from_slice(&1u32.to_be_bytes()); // sample_description_index
        } else {
            stsc.extend_from_slice(&0u32.to_be_bytes());
        }
        write_full_box(&mut content, b"stsc", 0, 0, &stsc);

        let mut stsz = Vec::with_capacity(8 + self.sample_sizes.len() * 4);
        stsz.extend_from_slice(&0u32.to_be_bytes()); // sizes vary
        stsz.extend_from_slice(&count.to_be_bytes());
        for size in &self.sample_sizes {
            stsz.extend_from_slice(&size.to_be_bytes());
        }
        write_full_box(&mut content, b"stsz", 0, 0, &stsz);

        let mut co64 = Vec::new();
        if count > 0 {
            co64.extend_from_slice(&1u32.to_be_bytes());
            co64.extend_from_slice(&self.data_start.to_be_bytes());
        } else {
            co64.extend_from_slice(&0u32.to_be_bytes());
        }
        write_full_box(&mut content, b"co64", 0, 0, &co64);

        write_box(buf, b"stbl", &content);
    }

    fn write_mp4v(&self, buf: &mut Vec<u8>) {
        let mut content = Vec::new();
        content.extend_from_slice(&[0; 6]); // reserved
        content.extend_from_slice(&1u16.to_be_bytes()); // data_reference_index
        content.extend_from_slice(&[0; 16]); // pre_defined + reserved
        content.extend_from_slice(&(self.dimensions.width as u16).to_be_bytes());
        content.extend_from_slice(&(self.dimensions.height as u16).to_be_bytes());
        content.extend_from_slice(&0x00480000u32.to_be_bytes()); // 72 dpi
        content.extend_from_slice(&0x00480000u32.to_be_bytes());
        content.extend_from_slice(&0u32.to_be_bytes()); // reserved
        content.extend_from_slice(&1u16.to_be_bytes()); // frame_count

        let mut compressor = [0u8; 32];
        let name = b"Motion JPEG";
        compressor[0] = name.len() as u8;
        compressor[1..=name.len()].copy_from_slice(name);
        content.extend_from_slice(&compressor);

        content.extend_from_slice(&0x0018u16.to_be_bytes()); // depth
        content.extend_from_slice(&(-1i16).to_be_bytes()); // pre_defined

        let mut esds = Vec::new();
        write_es_descriptor(&mut esds);
        write_full_box(&mut content, b"esds", 0, 0, &esds);

        write_box(buf, b"mp4v", &content);
    }
}

fn write_ftyp(buf: &mut Vec<u8>) {
    let mut content = Vec::new();
    content.extend_from_slice(b"isom"); // major brand
    content.extend_from_slice(&0x200u32.to_be_bytes()); // minor version
    for brand in [b"isom", b"iso2", b"mp41"] {
        content.extend_from_slice(brand);
    }
    write_box(buf, b"ftyp", &content);
}

fn write_es_descriptor(buf: &mut Vec<u8>) {
    let mut decoder_config = Vec::new();
    decoder_config.push(OBJECT_TYPE_JPEG);
    decoder_config.push((0x04 << 2) | 1); // visual stream, upstream = 0, reserved = 1
    decoder_config.extend_from_slice(&[0; 3]); // bufferSizeDB
    decoder_config.extend_from_slice(&0u32.to_be_bytes()); // maxBitrate
    decoder_config.extend_from_slice(&0u32.to_be_bytes()); // avgBitrate

    let mut es = Vec::new();
    es.extend_from_slice(&1u16.to_be_bytes()); // ES_ID
    es.push(0); // flags
    write_descriptor(&mut es, 0x04, &decoder_config);
    write_descriptor(&mut es, 0x06, &[0x02]); // SLConfig, predefined MP4

    write_descriptor(buf, 0x03, &es);
}

fn write_descriptor(buf: &mut Vec<u8>, tag: u8, payload: &[u8]) {
    buf.push(tag);
    buf.push(payload.len() as u8);
    buf.extend_from_slice(payload);
}

fn write_box(buf: &mut Vec<u8>, fourcc: &[u8; 4], content: &[u8]) {
    let size = 8 + content.len();
    buf.extend_from_slice(&(size as u32).to_be_bytes());
    buf.extend_from_slice(fourcc);
    buf.extend_from_slice(content);
}

fn write_full_box(buf: &mut Vec<u8>, fourcc: &[u8; 4], version: u8, flags: u32, content: &[u8]) {
    let size = 12 + content.len();
    buf.extend_from_slice(&(size as u32).to_be_bytes());
    buf.extend_from_slice(fourcc);
    buf.push(version);
    buf.extend_from_slice(&flags.to_be_bytes()[1..]);
    buf.extend_from_slice(content);
}
