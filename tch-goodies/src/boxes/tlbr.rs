use super::cycxhw::CyCxHWTensor;
use crate::common::*;
use bbox::{prelude::*, TLBR};

/// Checked tensor of batched box parameters in TLBR format.
#[derive(Debug, TensorLike, Getters)]
pub struct TlbrTensor {
    /// The top parameter in shape `[num, 1]`.
    #[get = "pub"]
    pub(crate) t: Tensor,
    /// The left parameter in shape `[num, 1]`.
    #[get = "pub"]
    pub(crate) l: Tensor,
    /// The bottom parameter in shape `[num, 1]`.
    #[get = "pub"]
    pub(crate) b: Tensor,
    /// The right parameter in shape `[num, 1]`.
    #[get = "pub"]
    pub(crate) r: Tensor,
}

impl TlbrTensor {
    /// Split a packed `[num, 4]` tensor into box parameters.
    pub fn from_packed(boxes: &Tensor) -> Result<Self> {
        let (_num, num_coords) = boxes.size2()?;
        ensure!(
            num_coords == 4,
            "expect a [num, 4] box tensor, but get shape {:?}",
            boxes.size()
        );
        Ok(Self {
            t: boxes.i((.., 0..1)),
            l: boxes.i((.., 1..2)),
            b: boxes.i((.., 2..3)),
            r: boxes.i((.., 3..4)),
        })
    }

    /// Pack the box parameters into a `[num, 4]` tensor.
    pub fn to_packed(&self) -> Tensor {
        let Self { t, l, b, r } = self;
        Tensor::cat(&[t, l, b, r], 1)
    }

    pub fn num_samples(&self) -> i64 {
        let (num, _) = self.t.size2().unwrap();
        num
    }

    pub fn device(&self) -> Device {
        self.t.device()
    }

    pub fn index_select(&self, indexes: &Tensor) -> Self {
        let Self { t, l, b, r } = self;
        Self {
            t: t.index_select(0, indexes),
            l: l.index_select(0, indexes),
            b: b.index_select(0, indexes),
            r: r.index_select(0, indexes),
        }
    }

    pub fn h(&self) -> Tensor {
        &self.b - &self.t
    }

    pub fn w(&self) -> Tensor {
        &self.r - &self.l
    }

    pub fn area(&self) -> Tensor {
        self.h() * self.w()
    }

    /// Clamp the boxes into a `[t, l, b, r]` window.
    pub fn clip_to_window(&self, window: [f64; 4]) -> Self {
        let [wt, wl, wb, wr] = window;
        let Self { t, l, b, r } = self;
        Self {
            t: t.clamp(wt, wb),
            l: l.clamp(wl, wr),
            b: b.clamp(wt, wb),
            r: r.clamp(wl, wr),
        }
    }

    /// Compute the pairwise IoU matrix in shape `[num_self, num_other]`.
    pub fn iou_matrix(&self, other: &Self) -> Tensor {
        let row = |tensor: &Tensor| tensor.view([1, -1]);

        let max_t = self.t.maximum(&row(&other.t));
        let max_l = self.l.maximum(&row(&other.l));
        let min_b = self.b.minimum(&row(&other.b));
        let min_r = self.r.minimum(&row(&other.r));

        let inter_h = (min_b - max_t).clamp_min(0.0);
        let inter_w = (min_r - max_l).clamp_min(0.0);
        let inter_area = inter_h * inter_w;

        let union_area = self.area() + row(&other.area()) - &inter_area;
        inter_area / union_area.clamp_min(f64::EPSILON)
    }

    pub fn to_cycxhw(&self) -> CyCxHWTensor {
        CyCxHWTensor::from(self)
    }

    /// Copy the boxes to host memory as scalar rectangles.
    pub fn to_rects(&self) -> Vec<TLBR<f32>> {
        let column = |tensor: &Tensor| Vec::<f32>::from(&tensor.view([-1]).to_kind(Kind::Float));
        izip!(
            column(&self.t),
            column(&self.l),
            column(&self.b),
            column(&self.r)
        )
        .map(|(t, l, b, r)| {
            // clipped or regressed boxes may be inverted by rounding
            TLBR::from_tlbr([t, l, b.max(t), r.max(l)])
        })
        .collect()
    }
}

impl From<&CyCxHWTensor> for TlbrTensor {
    fn from(from: &CyCxHWTensor) -> Self {
        let CyCxHWTensor { cy, cx, h, w } = from;
        let t = cy - h / 2.0;
        let l = cx - w / 2.0;
        let b = &t + h;
        let r = &l + w;
        Self { t, l, b, r }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn iou_matrix_matches_scalar_iou() -> Result<()> {
        let lhs = Tensor::of_slice(&[0.0f32, 0.0, 1.0, 1.0, 0.0, 0.0, 0.5, 0.5]).view([2, 4]);
        let rhs = Tensor::of_slice(&[0.0f32, 0.5, 1.0, 1.5]).view([1, 4]);
        let lhs = TlbrTensor::from_packed(&lhs)?;
        let rhs = TlbrTensor::from_packed(&rhs)?;

        let ious = lhs.iou_matrix(&rhs);
        assert_eq!(ious.size(), vec![2, 1]);
        assert_abs_diff_eq!(ious.double_value(&[0, 0]), 1.0 / 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(ious.double_value(&[1, 0]), 0.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn clip_bounds_coordinates() -> Result<()> {
        let boxes = Tensor::of_slice(&[-0.2f32, 0.3, 1.4, 0.9]).view([1, 4]);
        let clipped = TlbrTensor::from_packed(&boxes)?
            .clip_to_window([0.0, 0.0, 1.0, 1.0])
            .to_packed();
        let values = Vec::<f32>::from(&clipped.view([-1]));
        assert_eq!(values, vec![0.0, 0.3, 1.0, 0.9]);
        Ok(())
    }
}
