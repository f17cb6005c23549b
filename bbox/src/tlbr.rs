use super::{CyCxHW, Rect};
use crate::common::*;

/// Bounding box in TLBR format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TLBR<T> {
    pub(crate) t: T,
    pub(crate) l: T,
    pub(crate) b: T,
    pub(crate) r: T,
}

impl<T> TLBR<T> {
    pub fn try_cast<V>(self) -> Option<TLBR<V>>
    where
        T: ToPrimitive,
        V: NumCast,
    {
        Some(TLBR {
            t: V::from(self.t)?,
            l: V::from(self.l)?,
            b: V::from(self.b)?,
            r: V::from(self.r)?,
        })
    }

    pub fn cast<V>(self) -> TLBR<V>
    where
        T: ToPrimitive,
        V: NumCast,
    {
        self.try_cast().unwrap()
    }
}

impl<T> TLBR<T>
where
    T: Float,
{
    /// The unit window `(0, 0, 1, 1)` in normalized coordinates.
    pub fn unit_window() -> Self {
        let zero = T::zero();
        let one = T::one();
        Self {
            t: zero,
            l: zero,
            b: one,
            r: one,
        }
    }

    /// Clamp each coordinate into the window.
    pub fn clip_to(&self, window: &Self) -> Self {
        let clamp = |value: T, lower: T, upper: T| value.min(upper).max(lower);
        Self {
            t: clamp(self.t, window.t, window.b),
            l: clamp(self.l, window.l, window.r),
            b: clamp(self.b, window.t, window.b),
            r: clamp(self.r, window.l, window.r),
        }
    }

    /// Convert pixel coordinates to normalized coordinates for an image of
    /// the given size.
    ///
    /// The bottom-right corner is exclusive in pixel space, hence the
    /// `(0, 0, 1, 1)` shift.
    pub fn normalize(&self, image_h: T, image_w: T) -> Self {
        let one = T::one();
        let scale_h = image_h - one;
        let scale_w = image_w - one;
        Self {
            t: self.t / scale_h,
            l: self.l / scale_w,
            b: (self.b - one) / scale_h,
            r: (self.r - one) / scale_w,
        }
    }

    /// The inverse of [normalize](TLBR::normalize), rounded to whole pixels.
    pub fn denormalize(&self, image_h: T, image_w: T) -> Self {
        let one = T::one();
        let scale_h = image_h - one;
        let scale_w = image_w - one;
        Self {
            t: (self.t * scale_h).round(),
            l: (self.l * scale_w).round(),
            b: (self.b * scale_h + one).round(),
            r: (self.r * scale_w + one).round(),
        }
    }

    /// Map a normalized box onto the cells of a `map_h × map_w` grid.
    ///
    /// The top-left corner is floored and the bottom-right corner is
    /// ceiled, so any box with positive extent covers at least one cell.
    pub fn to_grid_cells(&self, map_h: T, map_w: T) -> TLBR<i64> {
        let cell = |value: T| value.to_i64().unwrap_or(0);
        TLBR {
            t: cell((self.t * map_h).floor()),
            l: cell((self.l * map_w).floor()),
            b: cell((self.b * map_h).ceil()),
            r: cell((self.r * map_w).ceil()),
        }
    }
}

impl<T> Rect for TLBR<T>
where
    T: Copy + Num + PartialOrd,
{
    type Type = T;

    fn t(&self) -> Self::Type {
        self.t
    }

    fn l(&self) -> Self::Type {
        self.l
    }

    fn b(&self) -> Self::Type {
        self.b
    }

    fn r(&self) -> Self::Type {
        self.r
    }

    fn cy(&self) -> Self::Type {
        let one = T::one();
        let two = one + one;
        self.t + self.h() / two
    }

    fn cx(&self) -> Self::Type {
        let one = T::one();
        let two = one + one;
        self.l + self.w() / two
    }

    fn h(&self) -> Self::Type {
        self.b - self.t
    }

    fn w(&self) -> Self::Type {
        self.r - self.l
    }

    fn try_from_cycxhw(cycxhw: [Self::Type; 4]) -> Result<Self> {
        let [cy, cx, h, w] = cycxhw;
        let zero = T::zero();
        ensure!(h >= zero && w >= zero, "h and w must be non-negative");

        let two = T::one() + T::one();
        let t = cy - h / two;
        let b = cy + h / two;
        let l = cx - w / two;
        let r = cx + w / two;

        Ok(Self { t, l, b, r })
    }

    fn try_from_tlbr(tlbr: [Self::Type; 4]) -> Result<Self> {
        let [t, l, b, r] = tlbr;
        ensure!(b >= t && r >= l, "b >= t and r >= l must hold");

        Ok(Self { t, l, b, r })
    }
}

impl<T> From<CyCxHW<T>> for TLBR<T>
where
    T: Copy + Num,
{
    fn from(from: CyCxHW<T>) -> Self {
        Self::from(&from)
    }
}

impl<T> From<&CyCxHW<T>> for TLBR<T>
where
    T: Copy + Num,
{
    fn from(from: &CyCxHW<T>) -> Self {
        let two = T::one() + T::one();
        let CyCxHW { cy, cx, h, w, .. } = *from;
        let t = cy - h / two;
        let l = cx - w / two;
        let b = cy + h / two;
        let r = cx + w / two;
        Self { t, l, b, r }
    }
}
