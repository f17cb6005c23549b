use crate::common::*;

/// Nearest-neighbor up-sampling of `[batch, channels, height, width]` maps
/// by an integer factor.
#[derive(Debug, Clone)]
pub struct UpSample2D {
    scale: i64,
}

impl UpSample2D {
    pub fn new(scale: i64) -> Result<Self> {
        ensure!(scale > 0, "scale must be positive, but get {}", scale);
        Ok(Self { scale })
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let (_b, _c, in_h, in_w) = input.size4()?;
        let out_h = in_h * self.scale;
        let out_w = in_w * self.scale;
        Ok(input.f_upsample_nearest2d(&[out_h, out_w], None, None)?)
    }
}
