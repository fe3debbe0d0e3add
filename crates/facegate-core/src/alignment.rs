//! Face alignment for the recognizer.
//!
//! Maps the five detected landmarks onto the InsightFace reference layout
//! with a least-squares similarity transform (scale, rotation, translation)
//! and resamples the face into a 112×112 RGB crop.

use image::{Rgb, RgbImage};

/// Reference landmark positions inside a 112×112 ArcFace crop:
/// left eye, right eye, nose tip, left mouth corner, right mouth corner.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

/// Side length of the aligned crop, matching the ArcFace input.
pub const ALIGNED_SIZE: usize = 112;

/// Least-squares similarity transform taking `src` points onto `dst`.
///
/// Unknowns are `[a, b, tx, ty]` with each pair contributing
/// `a*sx - b*sy + tx = dx` and `b*sx + a*sy + ty = dy`. The result is the
/// row-major 2×3 matrix `[a, -b, tx, b, a, ty]`.
fn estimate_similarity_transform(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> [f32; 6] {
    let mut normal = [[0.0f32; 5]; 4];

    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
        let rows = [([sx, -sy, 1.0, 0.0], dx), ([sy, sx, 0.0, 1.0], dy)];
        for (coeffs, rhs) in rows {
            for (j, row) in normal.iter_mut().enumerate() {
                for k in 0..4 {
                    row[k] += coeffs[j] * coeffs[k];
                }
                row[4] += coeffs[j] * rhs;
            }
        }
    }

    let [a, b, tx, ty] = solve_augmented(normal);
    [a, -b, tx, b, a, ty]
}

/// Solve a 4×4 system given as an augmented `[A | y]` matrix using
/// Gauss-Jordan elimination with partial pivoting.
///
/// A singular system yields the unit-scale transform `[1, 0, 0, 0]`.
fn solve_augmented(mut m: [[f32; 5]; 4]) -> [f32; 4] {
    for col in 0..4 {
        let pivot_row = (col..4)
            .max_by(|&i, &j| m[i][col].abs().total_cmp(&m[j][col].abs()))
            .unwrap_or(col);
        m.swap(col, pivot_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return [1.0, 0.0, 0.0, 0.0];
        }
        for v in m[col].iter_mut() {
            *v /= pivot;
        }

        let pivot_vals = m[col];
        for (row, vals) in m.iter_mut().enumerate() {
            if row == col {
                continue;
            }
            let factor = vals[col];
            for (v, p) in vals.iter_mut().zip(pivot_vals.iter()) {
                *v -= factor * p;
            }
        }
    }

    [m[0][4], m[1][4], m[2][4], m[3][4]]
}

/// Apply a 2×3 affine warp to produce a square RGB crop.
///
/// Uses bilinear interpolation per channel. Out-of-bounds pixels are filled
/// with 0 (black).
fn warp_affine(image: &RgbImage, matrix: &[f32; 6], out_size: usize) -> RgbImage {
    let [scale_cos, _, shift_x, scale_sin, _, shift_y] = *matrix;
    let side = out_size as u32;

    // The forward map is a rotation-scale [[c, -s], [s, c]]; its inverse is
    // the transpose divided by c² + s².
    let norm = scale_cos * scale_cos + scale_sin * scale_sin;
    if norm.abs() < 1e-12 {
        return RgbImage::new(side, side);
    }
    let (inv_c, inv_s) = (scale_cos / norm, scale_sin / norm);

    let (w, h) = (image.width() as i32, image.height() as i32);
    let texel = |x: i32, y: i32| -> [f32; 3] {
        if (0..w).contains(&x) && (0..h).contains(&y) {
            let p = image.get_pixel(x as u32, y as u32);
            [p[0] as f32, p[1] as f32, p[2] as f32]
        } else {
            [0.0; 3]
        }
    };

    RgbImage::from_fn(side, side, |ox, oy| {
        let (rx, ry) = (ox as f32 - shift_x, oy as f32 - shift_y);
        let src_x = inv_c * rx + inv_s * ry;
        let src_y = inv_c * ry - inv_s * rx;

        let (left, top) = (src_x.floor(), src_y.floor());
        let (wx, wy) = (src_x - left, src_y - top);
        let (left, top) = (left as i32, top as i32);

        let corners = [
            (texel(left, top), (1.0 - wx) * (1.0 - wy)),
            (texel(left + 1, top), wx * (1.0 - wy)),
            (texel(left, top + 1), (1.0 - wx) * wy),
            (texel(left + 1, top + 1), wx * wy),
        ];
        Rgb(std::array::from_fn(|c| {
            let v: f32 = corners.iter().map(|(px, weight)| px[c] * weight).sum();
            v.round().clamp(0.0, 255.0) as u8
        }))
    })
}

/// Align a detected face to a canonical 112×112 RGB crop.
///
/// Computes the similarity transform from the five detected landmarks to
/// the ArcFace reference positions and warps the face region into place.
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5]) -> RgbImage {
    let matrix = estimate_similarity_transform(landmarks, &REFERENCE_LANDMARKS_112);
    warp_affine(image, &matrix, ALIGNED_SIZE)
}
