//! Separable convolution kernel.
//!
//! A kernel is a footprint `(u, v, uw, vw)` in texel units at some
//! resolution plus per-axis weight vectors. The filter engine reshapes it
//! as it walks the mesh: pieces that overhang an edge are split off and
//! carried to the neighbour (or merged back into the edge texel when there
//! is none), rotated to the neighbour's frame, and reduced 2:1 until the
//! kernel matches the data actually resident for a face.

use ptex_core::pixel::Scalar;
use ptex_core::{DataType, Res};

/// Maximum per-axis kernel width.
pub const KMAX: usize = 10;

/// Separable kernel with weights `ku[0..uw]`, `kv[0..vw]`.
#[derive(Debug, Clone, Default)]
pub struct SeparableKernel {
    /// Resolution the footprint is expressed in.
    pub res: Res,
    /// First texel in u (may be negative before splitting).
    pub u: i32,
    /// First texel in v.
    pub v: i32,
    /// Width in u.
    pub uw: i32,
    /// Width in v.
    pub vw: i32,
    /// Weights along u.
    pub ku: [f64; KMAX],
    /// Weights along v.
    pub kv: [f64; KMAX],
}

fn accumulate(k: &[f64]) -> f64 {
    k.iter().sum()
}

impl SeparableKernel {
    /// Total kernel weight (product of the axis sums).
    pub fn weight(&self) -> f64 {
        accumulate(&self.ku[..self.uw as usize]) * accumulate(&self.kv[..self.vw as usize])
    }

    fn take_u(&self, start: usize, n: usize) -> [f64; KMAX] {
        let mut out = [0.0; KMAX];
        out[..n].copy_from_slice(&self.ku[start..start + n]);
        out
    }

    fn take_v(&self, start: usize, n: usize) -> [f64; KMAX] {
        let mut out = [0.0; KMAX];
        out[..n].copy_from_slice(&self.kv[start..start + n]);
        out
    }

    fn drop_u_front(&mut self, n: usize) {
        let uw = self.uw as usize;
        self.ku.copy_within(n..uw, 0);
        self.uw -= n as i32;
    }

    fn drop_v_front(&mut self, n: usize) {
        let vw = self.vw as usize;
        self.kv.copy_within(n..vw, 0);
        self.vw -= n as i32;
    }

    /// Folds the part hanging past u = 0 into the first texel.
    pub fn merge_l(&mut self) {
        let w = (-self.u) as usize;
        self.ku[w] += accumulate(&self.ku[..w]);
        self.drop_u_front(w);
        self.u = 0;
    }

    /// Folds the part hanging past u = res.u() into the last texel.
    pub fn merge_r(&mut self) {
        let w = (self.u + self.uw - self.res.u() as i32) as usize;
        let n = self.uw as usize - w;
        self.ku[n - 1] += accumulate(&self.ku[n..self.uw as usize]);
        self.uw = n as i32;
    }

    /// Folds the part hanging past v = 0 into the first texel.
    pub fn merge_b(&mut self) {
        let w = (-self.v) as usize;
        self.kv[w] += accumulate(&self.kv[..w]);
        self.drop_v_front(w);
        self.v = 0;
    }

    /// Folds the part hanging past v = res.v() into the last texel.
    pub fn merge_t(&mut self) {
        let w = (self.v + self.vw - self.res.v() as i32) as usize;
        let n = self.vw as usize - w;
        self.kv[n - 1] += accumulate(&self.kv[n..self.vw as usize]);
        self.vw = n as i32;
    }

    /// Splits off the piece past u = 0, expressed in the left neighbour's
    /// frame.
    pub fn split_l(&mut self) -> SeparableKernel {
        let w = -self.u;
        if w < self.uw {
            let k = SeparableKernel {
                res: self.res,
                u: self.res.u() as i32 - w,
                v: self.v,
                uw: w,
                vw: self.vw,
                ku: self.take_u(0, w as usize),
                kv: self.kv,
            };
            self.u = 0;
            self.drop_u_front(w as usize);
            k
        } else {
            // the whole kernel hangs over
            let mut k = self.clone();
            k.u += self.res.u() as i32;
            self.u = 0;
            self.uw = 0;
            k
        }
    }

    /// Splits off the piece past u = res.u().
    pub fn split_r(&mut self) -> SeparableKernel {
        let w = self.u + self.uw - self.res.u() as i32;
        if w < self.uw {
            let k = SeparableKernel {
                res: self.res,
                u: 0,
                v: self.v,
                uw: w,
                vw: self.vw,
                ku: self.take_u((self.uw - w) as usize, w as usize),
                kv: self.kv,
            };
            self.uw -= w;
            k
        } else {
            let mut k = self.clone();
            k.u -= self.res.u() as i32;
            self.u = 0;
            self.uw = 0;
            k
        }
    }

    /// Splits off the piece past v = 0.
    pub fn split_b(&mut self) -> SeparableKernel {
        let w = -self.v;
        if w < self.vw {
            let k = SeparableKernel {
                res: self.res,
                u: self.u,
                v: self.res.v() as i32 - w,
                uw: self.uw,
                vw: w,
                ku: self.ku,
                kv: self.take_v(0, w as usize),
            };
            self.v = 0;
            self.drop_v_front(w as usize);
            k
        } else {
            let mut k = self.clone();
            k.v += self.res.v() as i32;
            self.v = 0;
            self.vw = 0;
            k
        }
    }

    /// Splits off the piece past v = res.v().
    pub fn split_t(&mut self) -> SeparableKernel {
        let w = self.v + self.vw - self.res.v() as i32;
        if w < self.vw {
            let k = SeparableKernel {
                res: self.res,
                u: self.u,
                v: 0,
                uw: self.uw,
                vw: w,
                ku: self.ku,
                kv: self.take_v((self.vw - w) as usize, w as usize),
            };
            self.vw -= w;
            k
        } else {
            let mut k = self.clone();
            k.v -= self.res.v() as i32;
            self.v = 0;
            self.vw = 0;
            k
        }
    }

    fn flip_u(&mut self) {
        self.u = self.res.u() as i32 - self.u - self.uw;
        self.ku[..self.uw as usize].reverse();
    }

    fn flip_v(&mut self) {
        self.v = self.res.v() as i32 - self.v - self.vw;
        self.kv[..self.vw as usize].reverse();
    }

    fn swap_uv(&mut self) {
        self.res = self.res.swapped_uv();
        std::mem::swap(&mut self.u, &mut self.v);
        std::mem::swap(&mut self.uw, &mut self.vw);
        std::mem::swap(&mut self.ku, &mut self.kv);
    }

    /// Rotates the kernel `rot` quarter turns counter-clockwise.
    pub fn rotate(&mut self, rot: i32) {
        match rot & 3 {
            1 => {
                self.flip_u();
                self.swap_uv();
            }
            2 => {
                self.flip_u();
                self.flip_v();
            }
            3 => {
                self.flip_v();
                self.swap_uv();
            }
            _ => {}
        }
    }

    /// Reduces the kernel 2:1 in u, preserving the integrated weight.
    pub fn downres_u(&mut self) {
        let mut src = 0usize;
        let mut dst = 0usize;
        let mut w = self.uw as usize;

        // an odd leading sample stays as is
        if self.u & 1 == 1 {
            dst += 1;
            src += 1;
            w -= 1;
        }
        for _ in 0..w / 2 {
            self.ku[dst] = self.ku[src] + self.ku[src + 1];
            dst += 1;
            src += 2;
        }
        if w & 1 == 1 {
            self.ku[dst] = self.ku[src];
            dst += 1;
        }
        self.u /= 2;
        self.uw = dst as i32;
        self.res.ulog2 -= 1;
    }

    /// Reduces the kernel 2:1 in v.
    pub fn downres_v(&mut self) {
        let mut src = 0usize;
        let mut dst = 0usize;
        let mut w = self.vw as usize;

        if self.v & 1 == 1 {
            dst += 1;
            src += 1;
            w -= 1;
        }
        for _ in 0..w / 2 {
            self.kv[dst] = self.kv[src] + self.kv[src + 1];
            dst += 1;
            src += 2;
        }
        if w & 1 == 1 {
            self.kv[dst] = self.kv[src];
            dst += 1;
        }
        self.v /= 2;
        self.vw = dst as i32;
        self.res.vlog2 -= 1;
    }

    /// Accumulates `weight * texel` over the footprint into `dst`.
    ///
    /// `data` is a packed image at the kernel's res with `ntxchan` channels;
    /// `offset` is the byte offset of the first requested channel within a
    /// pixel.
    pub fn apply(&self, dst: &mut [f64], data: &[u8], offset: usize, dt: DataType, nchan: usize, ntxchan: usize) {
        match dt {
            DataType::UInt8 => self.apply_impl::<u8>(dst, data, offset, nchan, ntxchan),
            DataType::UInt16 => self.apply_impl::<u16>(dst, data, offset, nchan, ntxchan),
            DataType::Half => self.apply_impl::<half::f16>(dst, data, offset, nchan, ntxchan),
            DataType::Float => self.apply_impl::<f32>(dst, data, offset, nchan, ntxchan),
        }
    }

    fn apply_impl<T: Scalar>(&self, dst: &mut [f64], data: &[u8], offset: usize, nchan: usize, ntxchan: usize) {
        let es = T::BYTES;
        let resu = self.res.u();
        for vi in 0..self.vw as usize {
            let vweight = self.kv[vi];
            let row = ((self.v as usize + vi) * resu + self.u as usize) * ntxchan;
            for ui in 0..self.uw as usize {
                let w = vweight * self.ku[ui];
                let p = (row + ui * ntxchan) * es + offset;
                for c in 0..nchan {
                    dst[c] += w * T::read(&data[p + c * es..]).to_f32() as f64;
                }
            }
        }
    }

    /// Accumulates the kernel's total weight times a constant pixel.
    pub fn apply_const(&self, dst: &mut [f64], pixel: &[u8], offset: usize, dt: DataType, nchan: usize) {
        let w = self.weight();
        match dt {
            DataType::UInt8 => apply_const_impl::<u8>(w, dst, pixel, offset, nchan),
            DataType::UInt16 => apply_const_impl::<u16>(w, dst, pixel, offset, nchan),
            DataType::Half => apply_const_impl::<half::f16>(w, dst, pixel, offset, nchan),
            DataType::Float => apply_const_impl::<f32>(w, dst, pixel, offset, nchan),
        }
    }
}

fn apply_const_impl<T: Scalar>(weight: f64, dst: &mut [f64], pixel: &[u8], offset: usize, nchan: usize) {
    let es = T::BYTES;
    for c in 0..nchan {
        dst[c] += weight * T::read(&pixel[offset + c * es..]).to_f32() as f64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel(res: Res, u: i32, v: i32, ku: &[f64], kv: &[f64]) -> SeparableKernel {
        let mut k = SeparableKernel { res, u, v, uw: ku.len() as i32, vw: kv.len() as i32, ..Default::default() };
        k.ku[..ku.len()].copy_from_slice(ku);
        k.kv[..kv.len()].copy_from_slice(kv);
        k
    }

    #[test]
    fn weight_is_product_of_sums() {
        let k = kernel(Res::new(2, 2), 0, 0, &[1.0, 2.0], &[0.5, 0.5, 1.0]);
        assert_eq!(k.weight(), 3.0 * 2.0);
    }

    #[test]
    fn split_left_preserves_weight() {
        let mut k = kernel(Res::new(2, 2), -1, 0, &[0.25, 0.5, 0.25], &[1.0]);
        let total = k.weight();
        let piece = k.split_l();
        assert_eq!(k.u, 0);
        assert_eq!(k.uw, 2);
        assert_eq!(piece.uw, 1);
        assert_eq!(piece.u, 3); // left neighbour's last texel
        assert!((k.weight() + piece.weight() - total).abs() < 1e-12);
    }

    #[test]
    fn split_right_preserves_weight() {
        let mut k = kernel(Res::new(2, 2), 2, 0, &[0.25, 0.5, 0.25], &[1.0]);
        let total = k.weight();
        let piece = k.split_r();
        assert_eq!(k.uw, 2);
        assert_eq!(piece.u, 0);
        assert_eq!(piece.uw, 1);
        assert!((k.weight() + piece.weight() - total).abs() < 1e-12);
    }

    #[test]
    fn merge_folds_weight_into_edge() {
        let mut k = kernel(Res::new(2, 2), -1, 0, &[0.25, 0.5, 0.25], &[1.0]);
        let total = k.weight();
        k.merge_l();
        assert_eq!(k.u, 0);
        assert_eq!(k.uw, 2);
        assert!((k.weight() - total).abs() < 1e-12);
        assert!((k.ku[0] - 0.75).abs() < 1e-12);
    }

    #[test]
    fn rotation_round_trips() {
        let k0 = kernel(Res::new(3, 2), 1, 0, &[0.1, 0.2, 0.7], &[0.4, 0.6]);
        let mut k = k0.clone();
        for _ in 0..4 {
            k.rotate(1);
        }
        assert_eq!(k.res, k0.res);
        assert_eq!((k.u, k.v, k.uw, k.vw), (k0.u, k0.v, k0.uw, k0.vw));
        assert_eq!(&k.ku[..3], &k0.ku[..3]);
        assert_eq!(&k.kv[..2], &k0.kv[..2]);
    }

    #[test]
    fn rotate_two_is_double_flip() {
        let mut k = kernel(Res::new(2, 2), 0, 1, &[0.3, 0.7], &[1.0]);
        k.rotate(2);
        assert_eq!(k.u, 2); // res.u() - u - uw
        assert_eq!(k.v, 2); // res.v() - v - vw
        assert_eq!(&k.ku[..2], &[0.7, 0.3]);
    }

    #[test]
    fn downres_preserves_weight() {
        let mut k = kernel(Res::new(3, 3), 2, 0, &[0.1, 0.2, 0.3, 0.4], &[1.0]);
        let total = k.weight();
        k.downres_u();
        assert_eq!(k.res.ulog2, 2);
        assert_eq!(k.u, 1);
        assert_eq!(k.uw, 2);
        assert!((k.weight() - total).abs() < 1e-12);
    }

    #[test]
    fn downres_odd_phase() {
        let mut k = kernel(Res::new(3, 3), 1, 0, &[0.5, 0.25, 0.25], &[1.0]);
        let total = k.weight();
        k.downres_u();
        // leading odd sample is kept, the remaining pair collapses
        assert_eq!(k.u, 0);
        assert_eq!(k.uw, 2);
        assert!((k.weight() - total).abs() < 1e-12);
    }

    #[test]
    fn apply_accumulates() {
        // 2x2 single channel u8 image: 10 20 / 30 40
        let data = [10u8, 20, 30, 40];
        let k = kernel(Res::new(1, 1), 0, 0, &[0.5, 0.5], &[0.5, 0.5]);
        let mut acc = [0.0f64];
        k.apply(&mut acc, &data, 0, DataType::UInt8, 1, 1);
        assert!((acc[0] - 25.0).abs() < 1e-12);
    }

    #[test]
    fn apply_const_scales_by_weight() {
        let k = kernel(Res::new(1, 1), 0, 0, &[0.5, 0.25], &[1.0]);
        let pixel = [100u8, 200];
        let mut acc = [0.0f64; 2];
        k.apply_const(&mut acc, &pixel, 0, DataType::UInt8, 2);
        assert!((acc[0] - 75.0).abs() < 1e-12);
        assert!((acc[1] - 150.0).abs() < 1e-12);
    }
}
