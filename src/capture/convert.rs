//! Pixel layout conversions done on the camera callback thread
//!
//! None of these allocate: they write into a caller-provided buffer, which
//! on the hot path is a pooled frame buffer.

use super::frame::PixelFormat;

/// Three-plane YUV 4:2:0 image with tightly packed planes.
#[derive(Debug, Clone, Copy)]
pub struct Yuv420Planes<'a> {
    pub y: &'a [u8],
    pub u: &'a [u8],
    pub v: &'a [u8],
    pub width: usize,
    pub height: usize,
}

/// Size of a camera preview buffer for `width`×`height` NV21 frames.
///
/// Rounded up to whole bytes plus one spare byte, which some camera stacks
/// write past the nominal frame end.
pub fn nv21_buffer_len(width: u32, height: u32) -> usize {
    let bits = width as u64 * height as u64 * PixelFormat::Nv21.bits_per_pixel() as u64;
    (bits.div_ceil(8) + 1) as usize
}

/// Exact number of bytes an NV21 frame of this size occupies.
pub fn nv21_frame_len(width: usize, height: usize) -> usize {
    width * height + 2 * (width / 2) * (height / 2)
}

/// Packs planar YUV 4:2:0 into NV21 (Y plane, then interleaved V/U).
///
/// Returns the number of bytes written, or `None` if `dst` is too small or
/// a plane is shorter than the geometry says.
pub fn yuv420_to_nv21(planes: &Yuv420Planes<'_>, dst: &mut [u8]) -> Option<usize> {
    let luma = planes.width * planes.height;
    let chroma = (planes.width / 2) * (planes.height / 2);
    let total = luma + 2 * chroma;

    if dst.len() < total
        || planes.y.len() < luma
        || planes.u.len() < chroma
        || planes.v.len() < chroma
    {
        return None;
    }

    dst[..luma].copy_from_slice(&planes.y[..luma]);
    let vu = &mut dst[luma..total];
    for (i, pair) in vu.chunks_exact_mut(2).enumerate() {
        pair[0] = planes.v[i];
        pair[1] = planes.u[i];
    }
    Some(total)
}

/// Output size of [`quarter_nv21`].
pub fn quarter_len(width: usize, height: usize) -> usize {
    (width / 4) * (height / 4) * 3 / 2
}

/// Shrinks an NV21 frame to a quarter of its width and height.
///
/// Keeps every fourth luma sample of every fourth row. The chroma part of
/// the output is left zeroed; text detection only reads luma.
pub fn quarter_nv21(src: &[u8], width: usize, height: usize, dst: &mut [u8]) -> Option<usize> {
    let (out_w, out_h) = (width / 4, height / 4);
    let total = quarter_len(width, height);
    if dst.len() < total || src.len() < width * height {
        return None;
    }

    let mut i = 0;
    for row in 0..out_h {
        let line = &src[row * 4 * width..];
        for col in 0..out_w {
            dst[i] = line[col * 4];
            i += 1;
        }
    }
    dst[i..total].fill(0);
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_len_covers_frame() {
        assert_eq!(nv21_buffer_len(1024, 768), 1024 * 768 * 3 / 2 + 1);
        assert!(nv21_buffer_len(5, 3) >= nv21_frame_len(5, 3));
    }

    #[test]
    fn planar_to_nv21_interleaves_v_first() {
        let y = [1u8; 16];
        let u = [2u8, 3, 4, 5];
        let v = [6u8, 7, 8, 9];
        let planes = Yuv420Planes {
            y: &y,
            u: &u,
            v: &v,
            width: 4,
            height: 4,
        };
        let mut dst = [0u8; 32];
        let written = yuv420_to_nv21(&planes, &mut dst).unwrap();
        assert_eq!(written, 24);
        assert_eq!(&dst[..16], &[1; 16]);
        assert_eq!(&dst[16..24], &[6, 2, 7, 3, 8, 4, 9, 5]);
    }

    #[test]
    fn planar_to_nv21_rejects_short_destination() {
        let y = [0u8; 16];
        let c = [0u8; 4];
        let planes = Yuv420Planes {
            y: &y,
            u: &c,
            v: &c,
            width: 4,
            height: 4,
        };
        assert!(yuv420_to_nv21(&planes, &mut [0u8; 23]).is_none());
    }

    #[test]
    fn quarter_samples_every_fourth_pixel() {
        let (w, h) = (8, 8);
        let mut src = vec![0u8; nv21_frame_len(w, h)];
        for y in 0..h {
            for x in 0..w {
                src[y * w + x] = (y * 10 + x) as u8;
            }
        }
        let mut dst = vec![0xAA; quarter_len(w, h)];
        assert_eq!(quarter_nv21(&src, w, h, &mut dst), Some(6));
        assert_eq!(&dst[..4], &[0, 4, 40, 44]);
        assert_eq!(&dst[4..], &[0, 0]);
    }
}
