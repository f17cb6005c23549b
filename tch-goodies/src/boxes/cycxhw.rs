use super::tlbr::TlbrTensor;
use crate::common::*;

/// Tensor of batched box parameters in center-size format.
#[derive(Debug, TensorLike, Getters)]
pub struct CyCxHWTensor {
    #[get = "pub"]
    pub(crate) cy: Tensor,
    #[get = "pub"]
    pub(crate) cx: Tensor,
    #[get = "pub"]
    pub(crate) h: Tensor,
    #[get = "pub"]
    pub(crate) w: Tensor,
}

impl CyCxHWTensor {
    /// Refine boxes by `[num, 4]` deltas in `(dy, dx, log(dh), log(dw))` order.
    pub fn apply_deltas(&self, deltas: &Tensor) -> Result<Self> {
        let (num, num_coords) = deltas.size2()?;
        ensure!(
            num_coords == 4 && num == self.cy.size()[0],
            "expect [{}, 4] deltas, but get shape {:?}",
            self.cy.size()[0],
            deltas.size()
        );

        let Self { cy, cx, h, w } = self;
        let dy = deltas.i((.., 0..1));
        let dx = deltas.i((.., 1..2));
        let dh = deltas.i((.., 2..3));
        let dw = deltas.i((.., 3..4));

        Ok(Self {
            cy: cy + dy * h,
            cx: cx + dx * w,
            h: h * dh.exp(),
            w: w * dw.exp(),
        })
    }

    /// Compute `[num, 4]` deltas that refine these boxes into the targets.
    pub fn deltas_to(&self, target: &Self) -> Tensor {
        let dy = (&target.cy - &self.cy) / &self.h;
        let dx = (&target.cx - &self.cx) / &self.w;
        let dh = (&target.h / &self.h).log();
        let dw = (&target.w / &self.w).log();
        Tensor::cat(&[dy, dx, dh, dw], 1)
    }

    pub fn to_tlbr(&self) -> TlbrTensor {
        TlbrTensor::from(self)
    }
}

impl From<&TlbrTensor> for CyCxHWTensor {
    fn from(from: &TlbrTensor) -> Self {
        let h = from.h();
        let w = from.w();
        let cy = &from.t + &h * 0.5;
        let cx = &from.l + &w * 0.5;
        Self { cy, cx, h, w }
    }
}
