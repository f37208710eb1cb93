use std::f32::consts::PI;

use super::{BgrImage, WatermarkCodec};
use crate::{PlumeError, Result};

const BLOCK: usize = 4;

type Block = [[f32; BLOCK]; BLOCK];

/// Frequency-domain watermark: one-level Haar DWT, 4x4 DCT blocks on the approximation band.
///
/// Each block carries one payload bit in the magnitude of its strongest AC coefficient, quantised
/// with the plane's scale. Bits repeat across blocks and are recovered by majority vote, which
/// keeps the mark readable after mild recompression.
#[derive(Debug, Clone, PartialEq)]
pub struct DwtDctCodec {
    /// Quantisation step per Y, U, V plane. Zero leaves the plane untouched.
    scales: [f32; 3],
}

impl Default for DwtDctCodec {
    fn default() -> Self {
        Self {
            scales: [0.0, 36.0, 36.0],
        }
    }
}

impl DwtDctCodec {
    pub fn with_scales(scales: [f32; 3]) -> Self {
        Self { scales }
    }

    fn check_capacity(&self, image: &BgrImage, bits: usize) -> Result<(usize, usize)> {
        let blocks_x = image.width() / 2 / BLOCK;
        let blocks_y = image.height() / 2 / BLOCK;
        if bits == 0 {
            return Err(PlumeError::Watermark("empty watermark payload".into()));
        }
        if blocks_x * blocks_y < bits {
            return Err(PlumeError::Watermark(format!(
                "a {}x{} image holds {} blocks, payload needs {bits}",
                image.width(),
                image.height(),
                blocks_x * blocks_y
            )));
        }
        Ok((blocks_x, blocks_y))
    }
}

impl WatermarkCodec for DwtDctCodec {
    fn encode(&self, image: BgrImage, payload: &[u8]) -> Result<BgrImage> {
        let bits = payload_bits(payload);
        let (blocks_x, blocks_y) = self.check_capacity(&image, bits.len())?;
        let (width, height) = (image.width(), image.height());
        let mut planes = bgr_to_yuv(&image);

        for (plane, &scale) in planes.iter_mut().zip(&self.scales) {
            if scale <= 0.0 {
                continue;
            }
            let ll_width = width / 2;
            let ll = haar_approximation(plane, width, height);
            let mut marked = ll.clone();
            for by in 0..blocks_y {
                for bx in 0..blocks_x {
                    let num = by * blocks_x + bx;
                    let mut block = dct(&read_block(&ll, ll_width, bx, by));
                    embed_bit(&mut block, bits[num % bits.len()], scale);
                    write_block(&mut marked, ll_width, bx, by, &idct(&block));
                }
            }
            // Only the approximation band changed; each of its coefficients feeds its 2x2
            // pixel square with weight 1/2.
            for y in 0..blocks_y * BLOCK {
                for x in 0..blocks_x * BLOCK {
                    let delta = (marked[y * ll_width + x] - ll[y * ll_width + x]) / 2.0;
                    for (dy, dx) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
                        plane[(2 * y + dy) * width + 2 * x + dx] += delta;
                    }
                }
            }
        }

        BgrImage::new(width, height, yuv_to_bgr(&planes))
    }

    fn decode(&self, image: &BgrImage, payload_len: usize) -> Result<Vec<u8>> {
        let bit_count = payload_len * 8;
        let (blocks_x, blocks_y) = self.check_capacity(image, bit_count)?;
        let (width, height) = (image.width(), image.height());
        let planes = bgr_to_yuv(image);
        let mut ones = vec![0u32; bit_count];
        let mut votes = vec![0u32; bit_count];

        for (plane, &scale) in planes.iter().zip(&self.scales) {
            if scale <= 0.0 {
                continue;
            }
            let ll = haar_approximation(plane, width, height);
            for by in 0..blocks_y {
                for bx in 0..blocks_x {
                    let num = (by * blocks_x + bx) % bit_count;
                    let block = dct(&read_block(&ll, width / 2, bx, by));
                    votes[num] += 1;
                    if extract_bit(&block, scale) {
                        ones[num] += 1;
                    }
                }
            }
        }

        let bits: Vec<bool> = ones
            .iter()
            .zip(&votes)
            .map(|(&one, &total)| 2 * one > total)
            .collect();
        Ok(bits
            .chunks(8)
            .map(|byte| byte.iter().fold(0u8, |acc, &bit| (acc << 1) | u8::from(bit)))
            .collect())
    }
}

fn payload_bits(payload: &[u8]) -> Vec<bool> {
    payload
        .iter()
        .flat_map(|byte| (0..8).rev().map(move |i| (byte >> i) & 1 == 1))
        .collect()
}

fn bgr_to_yuv(image: &BgrImage) -> [Vec<f32>; 3] {
    let pixels = image.width() * image.height();
    let mut planes = [
        Vec::with_capacity(pixels),
        Vec::with_capacity(pixels),
        Vec::with_capacity(pixels),
    ];
    for px in image.as_raw().chunks_exact(3) {
        let (b, g, r) = (f32::from(px[0]), f32::from(px[1]), f32::from(px[2]));
        let y = 0.299 * r + 0.587 * g + 0.114 * b;
        planes[0].push(y);
        planes[1].push(0.492 * (b - y) + 128.0);
        planes[2].push(0.877 * (r - y) + 128.0);
    }
    planes
}

fn yuv_to_bgr(planes: &[Vec<f32>; 3]) -> Vec<u8> {
    let to_u8 = |v: f32| v.round().clamp(0.0, 255.0) as u8;
    let mut data = Vec::with_capacity(planes[0].len() * 3);
    for ((&y, &u), &v) in planes[0].iter().zip(&planes[1]).zip(&planes[2]) {
        let r = y + (v - 128.0) / 0.877;
        let b = y + (u - 128.0) / 0.492;
        let g = (y - 0.299 * r - 0.114 * b) / 0.587;
        data.extend([to_u8(b), to_u8(g), to_u8(r)]);
    }
    data
}

/// Orthonormal Haar approximation band, `(width / 2) x (height / 2)`.
fn haar_approximation(plane: &[f32], width: usize, height: usize) -> Vec<f32> {
    let (ll_width, ll_height) = (width / 2, height / 2);
    let mut ll = Vec::with_capacity(ll_width * ll_height);
    for y in 0..ll_height {
        for x in 0..ll_width {
            let top = (2 * y) * width + 2 * x;
            let bottom = top + width;
            ll.push((plane[top] + plane[top + 1] + plane[bottom] + plane[bottom + 1]) / 2.0);
        }
    }
    ll
}

fn read_block(band: &[f32], stride: usize, bx: usize, by: usize) -> Block {
    let mut block = [[0.0; BLOCK]; BLOCK];
    for (i, row) in block.iter_mut().enumerate() {
        let start = (by * BLOCK + i) * stride + bx * BLOCK;
        row.copy_from_slice(&band[start..start + BLOCK]);
    }
    block
}

fn write_block(band: &mut [f32], stride: usize, bx: usize, by: usize, block: &Block) {
    for (i, row) in block.iter().enumerate() {
        let start = (by * BLOCK + i) * stride + bx * BLOCK;
        band[start..start + BLOCK].copy_from_slice(row);
    }
}

fn dct_basis() -> Block {
    let mut basis = [[0.0; BLOCK]; BLOCK];
    for (k, row) in basis.iter_mut().enumerate() {
        let alpha = if k == 0 {
            (1.0 / BLOCK as f32).sqrt()
        } else {
            (2.0 / BLOCK as f32).sqrt()
        };
        for (n, v) in row.iter_mut().enumerate() {
            *v = alpha * (PI * (2 * n + 1) as f32 * k as f32 / (2 * BLOCK) as f32).cos();
        }
    }
    basis
}

/// `a * b`, or `a^T * b` when `transpose_a` is set.
fn matmul(a: &Block, b: &Block, transpose_a: bool) -> Block {
    let mut out = [[0.0; BLOCK]; BLOCK];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, v) in row.iter_mut().enumerate() {
            *v = (0..BLOCK)
                .map(|k| {
                    let lhs = if transpose_a { a[k][i] } else { a[i][k] };
                    lhs * b[k][j]
                })
                .sum();
        }
    }
    out
}

fn transpose(a: &Block) -> Block {
    let mut out = [[0.0; BLOCK]; BLOCK];
    for (i, row) in a.iter().enumerate() {
        for (j, v) in row.iter().enumerate() {
            out[j][i] = *v;
        }
    }
    out
}

fn dct(block: &Block) -> Block {
    let c = dct_basis();
    matmul(&matmul(&c, block, false), &transpose(&c), false)
}

fn idct(block: &Block) -> Block {
    let c = dct_basis();
    matmul(&matmul(&c, block, true), &c, false)
}

/// Index of the largest-magnitude AC coefficient, first one on ties.
fn strongest_ac(block: &Block) -> (usize, usize) {
    let mut best = (0, 1);
    for pos in 1..BLOCK * BLOCK {
        let (i, j) = (pos / BLOCK, pos % BLOCK);
        if block[i][j].abs() > block[best.0][best.1].abs() {
            best = (i, j);
        }
    }
    best
}

fn embed_bit(block: &mut Block, bit: bool, scale: f32) {
    let (i, j) = strongest_ac(block);
    let value = block[i][j];
    let offset = if bit { 0.75 } else { 0.25 };
    let magnitude = ((value.abs() / scale).floor() + offset) * scale;
    block[i][j] = if value >= 0.0 { magnitude } else { -magnitude };
}

fn extract_bit(block: &Block, scale: f32) -> bool {
    let (i, j) = strongest_ac(block);
    block[i][j].abs() % scale > 0.5 * scale
}
