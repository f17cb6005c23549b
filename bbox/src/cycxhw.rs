use super::{Rect, TLBR};
use crate::common::*;

/// Bounding box in CyCxHW format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CyCxHW<T> {
    pub(crate) cy: T,
    pub(crate) cx: T,
    pub(crate) h: T,
    pub(crate) w: T,
}

impl<T> CyCxHW<T> {
    pub fn try_cast<V>(self) -> Option<CyCxHW<V>>
    where
        T: ToPrimitive,
        V: NumCast,
    {
        Some(CyCxHW {
            cy: V::from(self.cy)?,
            cx: V::from(self.cx)?,
            h: V::from(self.h)?,
            w: V::from(self.w)?,
        })
    }

    pub fn cast<V>(self) -> CyCxHW<V>
    where
        T: ToPrimitive,
        V: NumCast,
    {
        self.try_cast().unwrap()
    }
}

impl<T> CyCxHW<T>
where
    T: Float,
{
    /// Refine the box by regression deltas `(dy, dx, log(dh), log(dw))`.
    ///
    /// The center moves by the delta times the box size, and the size is
    /// scaled by the exponential of the log-size delta.
    pub fn apply_deltas(&self, deltas: &BoxDelta<T>) -> Self {
        let Self { cy, cx, h, w } = *self;
        let BoxDelta { dy, dx, dh, dw } = *deltas;
        Self {
            cy: cy + dy * h,
            cx: cx + dx * w,
            h: h * dh.exp(),
            w: w * dw.exp(),
        }
    }

    /// Compute the deltas that refine this box into the target box.
    pub fn deltas_to(&self, target: &Self) -> BoxDelta<T> {
        BoxDelta {
            dy: (target.cy - self.cy) / self.h,
            dx: (target.cx - self.cx) / self.w,
            dh: (target.h / self.h).ln(),
            dw: (target.w / self.w).ln(),
        }
    }
}

/// Bounding box regression deltas in `(dy, dx, log(dh), log(dw))` order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxDelta<T> {
    pub dy: T,
    pub dx: T,
    pub dh: T,
    pub dw: T,
}

impl<T> BoxDelta<T>
where
    T: Float,
{
    pub fn zeros() -> Self {
        let zero = T::zero();
        Self {
            dy: zero,
            dx: zero,
            dh: zero,
            dw: zero,
        }
    }

    pub fn to_array(&self) -> [T; 4] {
        [self.dy, self.dx, self.dh, self.dw]
    }

    /// Divide each component by the per-coordinate standard deviation.
    pub fn normalize(&self, std_dev: [T; 4]) -> Self {
        let [sy, sx, sh, sw] = std_dev;
        Self {
            dy: self.dy / sy,
            dx: self.dx / sx,
            dh: self.dh / sh,
            dw: self.dw / sw,
        }
    }
}

impl<T> Rect for CyCxHW<T>
where
    T: Copy + Num + PartialOrd,
{
    type Type = T;

    fn t(&self) -> Self::Type {
        let two = T::one() + T::one();
        self.cy - self.h / two
    }

    fn l(&self) -> Self::Type {
        let two = T::one() + T::one();
        self.cx - self.w / two
    }

    fn b(&self) -> Self::Type {
        let two = T::one() + T::one();
        self.cy + self.h / two
    }

    fn r(&self) -> Self::Type {
        let two = T::one() + T::one();
        self.cx + self.w / two
    }

    fn cy(&self) -> Self::Type {
        self.cy
    }

    fn cx(&self) -> Self::Type {
        self.cx
    }

    fn h(&self) -> Self::Type {
        self.h
    }

    fn w(&self) -> Self::Type {
        self.w
    }

    fn try_from_tlbr(tlbr: [T; 4]) -> Result<Self> {
        let [t, l, b, r] = tlbr;
        let zero = T::zero();
        let two = T::one() + T::one();
        let h = b - t;
        let w = r - l;
        let cy = t + h / two;
        let cx = l + w / two;
        ensure!(
            h >= zero && w >= zero,
            "box height and width must be non-negative"
        );

        Ok(Self { cy, cx, h, w })
    }

    fn try_from_cycxhw(cycxhw: [T; 4]) -> Result<Self> {
        let [cy, cx, h, w] = cycxhw;
        let zero = T::zero();
        ensure!(
            h >= zero && w >= zero,
            "box height and width must be non-negative"
        );

        Ok(Self { cy, cx, h, w })
    }
}

impl<T> From<TLBR<T>> for CyCxHW<T>
where
    T: Copy + Num,
{
    fn from(from: TLBR<T>) -> Self {
        Self::from(&from)
    }
}

impl<T> From<&TLBR<T>> for CyCxHW<T>
where
    T: Copy + Num,
{
    fn from(from: &TLBR<T>) -> Self {
        let two = T::one() + T::one();
        let TLBR { t, l, b, r, .. } = *from;
        let h = b - t;
        let w = r - l;
        let cy = t + h / two;
        let cx = l + w / two;
        Self { cy, cx, h, w }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RectNum;
    use approx::assert_abs_diff_eq;

    #[test]
    fn zero_deltas_keep_box() {
        let anchor = TLBR::from_tlbr([0.1, 0.2, 0.5, 0.6]).to_cycxhw();
        let refined = TLBR::from(anchor.apply_deltas(&BoxDelta::zeros()));
        let [t, l, b, r] = refined.tlbr();
        assert_abs_diff_eq!(t, 0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(l, 0.2, epsilon = 1e-12);
        assert_abs_diff_eq!(b, 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(r, 0.6, epsilon = 1e-12);
    }

    #[test]
    fn encoded_deltas_recover_target() {
        let anchor = CyCxHW::from_cycxhw([0.5, 0.5, 0.2, 0.4]);
        let target = CyCxHW::from_cycxhw([0.55, 0.4, 0.3, 0.2]);
        let deltas = anchor.deltas_to(&target);
        let recovered = anchor.apply_deltas(&deltas);
        assert_abs_diff_eq!(recovered.cy(), 0.55, epsilon = 1e-12);
        assert_abs_diff_eq!(recovered.cx(), 0.4, epsilon = 1e-12);
        assert_abs_diff_eq!(recovered.h(), 0.3, epsilon = 1e-12);
        assert_abs_diff_eq!(recovered.w(), 0.2, epsilon = 1e-12);
    }
}
