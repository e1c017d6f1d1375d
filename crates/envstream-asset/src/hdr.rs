//! Radiance HDR (.hdr) 解码器
//!
//! 支持 new-style RLE 与平铺扫描线，RGBE -> 线性 RGBA32F。
//! 解码过程按已读取字节数 / 总字节数汇报进度，不按扫描线。

use crate::error::DecodeError;
use rayon::prelude::*;
use std::io::{self, BufRead, BufReader, Read};

/// 输出的每个像素通道数 (RGBA，alpha 恒为 1)
pub const CHANNELS: usize = 4;

/// 单边最大像素数
pub const MAX_DIMENSION: u32 = 1 << 15;
/// 总像素数上限，防止损坏的头部导致超大分配
const MAX_PIXELS: u64 = 1 << 28;

const MAX_HEADER_LINE: usize = 4096;
const MAX_HEADER_LINES: usize = 256;

/// new-style RLE 只对这个范围内的宽度有效
const MIN_RLE_WIDTH: usize = 8;
const MAX_RLE_WIDTH: usize = 0x7fff;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecoderOptions {
    /// 两次进度汇报之间的最小增量
    pub progress_step: f32,
    /// 每次从数据源读取的字节数
    pub read_chunk_size: usize,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        Self {
            progress_step: 0.01,
            read_chunk_size: 64 * 1024,
        }
    }
}

/// 解码结果：行优先、自上而下的线性 RGBA32F
#[derive(Debug, Clone, PartialEq)]
pub struct HdrImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<f32>,
}

impl HdrImage {
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn data_size_bytes(&self) -> usize {
        self.pixels.len() * size_of::<f32>()
    }
}

/// HDR 解码器
///
/// 持有跨次解码复用的扫描线缓冲，因此每个解码线程拥有自己的实例。
/// 解码是 all-or-nothing 的：只有最后一条扫描线解析成功后才会构造 [`HdrImage`]。
#[derive(Debug, Default)]
pub struct HdrDecoder {
    options: DecoderOptions,
    planes: Vec<u8>,
}

impl HdrDecoder {
    pub fn new(options: DecoderOptions) -> Self {
        Self {
            options,
            planes: Vec::new(),
        }
    }

    pub fn options(&self) -> DecoderOptions {
        self.options
    }

    /// 流式解码
    ///
    /// `on_progress` 依次收到非递减的进度值：开始时 0.0，之后每增长 `progress_step` 汇报一次，
    /// 成功时以 1.0 结束。失败时不会收到 1.0。
    pub fn decode<R: Read>(
        &mut self,
        reader: R,
        total_len: Option<u64>,
        mut on_progress: impl FnMut(f32),
    ) -> Result<HdrImage, DecodeError> {
        let _span = profile_span!("HdrDecoder::decode");

        on_progress(0.0);
        let counter = ProgressReader::new(reader, total_len, self.options.progress_step, &mut on_progress);
        let mut reader = BufReader::with_capacity(self.options.read_chunk_size.max(1), counter);

        let (width, height) = parse_header(&mut reader)?;
        let rgbe = self.read_scanlines(&mut reader, width as usize, height as usize)?;
        reader.into_inner().finish();

        let pixels = rgbe_to_rgba(&rgbe, width as usize);
        Ok(HdrImage { width, height, pixels })
    }

    /// 一次性解码内存中的数据，不汇报进度
    pub fn decode_bytes(&mut self, bytes: &[u8]) -> Result<HdrImage, DecodeError> {
        self.decode(bytes, Some(bytes.len() as u64), |_| {})
    }

    fn read_scanlines<R: Read>(
        &mut self,
        reader: &mut R,
        width: usize,
        height: usize,
    ) -> Result<Vec<[u8; 4]>, DecodeError> {
        let mut rgbe = vec![[0u8; 4]; width * height];
        for (row, line) in rgbe.chunks_exact_mut(width).enumerate() {
            self.read_scanline(reader, line, row)?;
        }
        Ok(rgbe)
    }

    fn read_scanline<R: Read>(&mut self, reader: &mut R, line: &mut [[u8; 4]], row: usize) -> Result<(), DecodeError> {
        let width = line.len();
        if !(MIN_RLE_WIDTH..=MAX_RLE_WIDTH).contains(&width) {
            return read_flat(reader, line, None, row);
        }

        let mut head = [0u8; 4];
        read_exact(reader, &mut head, row)?;
        if head[0] != 2 || head[1] != 2 || head[2] & 0x80 != 0 {
            return read_flat(reader, line, Some(head), row);
        }

        let encoded_width = ((head[2] as usize) << 8) | head[3] as usize;
        if encoded_width != width {
            return Err(DecodeError::new(format!(
                "scanline {row} encodes width {encoded_width}, expected {width}"
            )));
        }
        self.read_rle(reader, line, row)
    }

    /// new-style RLE: 四个通道依次编码，每个通道由 run / literal 段组成
    fn read_rle<R: Read>(&mut self, reader: &mut R, line: &mut [[u8; 4]], row: usize) -> Result<(), DecodeError> {
        let width = line.len();
        self.planes.resize(width * 4, 0);

        for plane in self.planes.chunks_exact_mut(width) {
            let mut pos = 0;
            while pos < width {
                let mut code = [0u8; 1];
                read_exact(reader, &mut code, row)?;
                let count = code[0] as usize;

                if count > 128 {
                    let run = count - 128;
                    if pos + run > width {
                        return Err(DecodeError::new(format!("RLE run exceeds width at scanline {row}")));
                    }
                    let mut value = [0u8; 1];
                    read_exact(reader, &mut value, row)?;
                    plane[pos..pos + run].fill(value[0]);
                    pos += run;
                } else {
                    if count == 0 || pos + count > width {
                        return Err(DecodeError::new(format!("bad literal run of {count} at scanline {row}")));
                    }
                    read_exact(reader, &mut plane[pos..pos + count], row)?;
                    pos += count;
                }
            }
        }

        let (r, rest) = self.planes.split_at(width);
        let (g, rest) = rest.split_at(width);
        let (b, e) = rest.split_at(width);
        for (x, pixel) in line.iter_mut().enumerate() {
            *pixel = [r[x], g[x], b[x], e[x]];
        }
        Ok(())
    }
}

/// 平铺扫描线；`first` 为已经读出的第一个像素
fn read_flat<R: Read>(
    reader: &mut R,
    line: &mut [[u8; 4]],
    first: Option<[u8; 4]>,
    row: usize,
) -> Result<(), DecodeError> {
    let rest = match first {
        Some(pixel) => {
            line[0] = pixel;
            &mut line[1..]
        }
        None => line,
    };
    read_exact(reader, rest.as_flattened_mut(), row)
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8], row: usize) -> Result<(), DecodeError> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => DecodeError::new(format!("truncated pixel data at scanline {row}")),
        _ => DecodeError::new(format!("read error at scanline {row}: {e}")),
    })
}

/// 解析头部，返回 (width, height)
fn parse_header<R: BufRead>(reader: &mut R) -> Result<(u32, u32), DecodeError> {
    let mut buf = Vec::with_capacity(128);

    let magic = read_header_line(reader, &mut buf)?.ok_or_else(|| DecodeError::new("empty file"))?;
    if !magic.starts_with("#?RADIANCE") && !magic.starts_with("#?RGBE") {
        return Err(DecodeError::new("missing #?RADIANCE magic"));
    }

    let mut format_found = false;
    for _ in 0..MAX_HEADER_LINES {
        let line = read_header_line(reader, &mut buf)?.ok_or_else(|| DecodeError::new("truncated header"))?;
        if line.is_empty() {
            if !format_found {
                return Err(DecodeError::new("header has no FORMAT line"));
            }
            let resolution =
                read_header_line(reader, &mut buf)?.ok_or_else(|| DecodeError::new("missing resolution line"))?;
            return parse_resolution(&resolution);
        }

        if let Some(format) = line.strip_prefix("FORMAT=") {
            if format != "32-bit_rle_rgbe" {
                return Err(DecodeError::new(format!("unsupported format {format}")));
            }
            format_found = true;
        }
    }

    Err(DecodeError::new("header is too long"))
}

/// 读取一行头部，去掉首尾空白；EOF 时返回 None
fn read_header_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> Result<Option<String>, DecodeError> {
    buf.clear();
    let n = reader
        .take(MAX_HEADER_LINE as u64 + 1)
        .read_until(b'\n', buf)
        .map_err(|e| DecodeError::new(format!("failed to read header: {e}")))?;
    if n == 0 {
        return Ok(None);
    }
    if buf.len() > MAX_HEADER_LINE {
        return Err(DecodeError::new("header line is too long"));
    }
    Ok(Some(String::from_utf8_lossy(buf).trim().to_string()))
}

/// 只支持标准的 `-Y height +X width` 方向
fn parse_resolution(line: &str) -> Result<(u32, u32), DecodeError> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let ["-Y", height, "+X", width] = parts.as_slice() else {
        return Err(DecodeError::new(format!("unsupported resolution line {line:?}")));
    };

    let height: u32 = height
        .parse()
        .map_err(|_| DecodeError::new(format!("invalid height {height:?}")))?;
    let width: u32 = width
        .parse()
        .map_err(|_| DecodeError::new(format!("invalid width {width:?}")))?;

    if width == 0 || height == 0 {
        return Err(DecodeError::new("image dimensions cannot be zero"));
    }
    if width > MAX_DIMENSION || height > MAX_DIMENSION || width as u64 * height as u64 > MAX_PIXELS {
        return Err(DecodeError::new(format!("image of {width}x{height} is too large")));
    }
    Ok((width, height))
}

/// RGBE -> 线性 RGBA32F，按行并行
fn rgbe_to_rgba(rgbe: &[[u8; 4]], width: usize) -> Vec<f32> {
    let _span = profile_span!("rgbe_to_rgba");

    let mut pixels = vec![0.0f32; rgbe.len() * CHANNELS];
    pixels
        .par_chunks_mut(width * CHANNELS)
        .zip(rgbe.par_chunks(width))
        .for_each(|(out, src)| {
            for (texel, &[r, g, b, e]) in out.chunks_exact_mut(CHANNELS).zip(src) {
                let [r, g, b] = rgbe_to_linear(r, g, b, e);
                texel.copy_from_slice(&[r, g, b, 1.0]);
            }
        });
    pixels
}

/// 共享指数：v = m * 2^(e - 136)，e == 0 表示黑色
#[inline]
pub fn rgbe_to_linear(r: u8, g: u8, b: u8, e: u8) -> [f32; 3] {
    if e == 0 {
        return [0.0; 3];
    }
    let scale = 2.0f32.powi(e as i32 - 136);
    [r as f32 * scale, g as f32 * scale, b as f32 * scale]
}

/// 统计已读取字节数的 reader，按步长向 sink 汇报进度
struct ProgressReader<R, S: FnMut(f32)> {
    inner: R,
    bytes_read: u64,
    total_len: Option<u64>,
    step: f32,
    last_reported: f32,
    sink: S,
}

impl<R, S: FnMut(f32)> ProgressReader<R, S> {
    fn new(inner: R, total_len: Option<u64>, step: f32, sink: S) -> Self {
        Self {
            inner,
            bytes_read: 0,
            total_len,
            step,
            last_reported: 0.0,
            sink,
        }
    }

    /// 解码成功后补上最后的 1.0
    fn finish(mut self) {
        if self.last_reported < 1.0 {
            (self.sink)(1.0);
        }
    }
}

impl<R: Read, S: FnMut(f32)> Read for ProgressReader<R, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.bytes_read += n as u64;

        if let Some(total) = self.total_len
            && total > 0
        {
            // 1.0 只由 finish 在解码成功后发出
            let fraction = (self.bytes_read as f64 / total as f64) as f32;
            if fraction < 1.0 && fraction - self.last_reported >= self.step {
                self.last_reported = fraction;
                (self.sink)(fraction);
            }
        }
        Ok(n)
    }
}
