//! Multi-scale, multi-ratio anchor generation.

use crate::{common::*, config::MimicConfig};

/// Generate pixel anchors of one scale over a `shape` feature grid.
///
/// Anchors are ordered by row, then column, then ratio, which matches the
/// channel layout of the RPN head.
pub fn generate_anchors(
    scale: f64,
    ratios: &[f64],
    shape: [i64; 2],
    feature_stride: i64,
    anchor_stride: i64,
) -> Vec<TLBR<f32>> {
    let [grid_h, grid_w] = shape;
    let sizes: Vec<_> = ratios
        .iter()
        .map(|&ratio| (scale / ratio.sqrt(), scale * ratio.sqrt()))
        .collect();

    let rows = (0..grid_h).step_by(anchor_stride as usize);
    let cols = (0..grid_w).step_by(anchor_stride as usize);

    rows.flat_map(|row| cols.clone().map(move |col| (row, col)))
        .flat_map(|(row, col)| {
            let cy = (row * feature_stride) as f64;
            let cx = (col * feature_stride) as f64;
            sizes.iter().map(move |&(h, w)| {
                TLBR::from_tlbr([cy - h / 2.0, cx - w / 2.0, cy + h / 2.0, cx + w / 2.0]).cast()
            })
        })
        .collect()
}

/// Anchors of all pyramid levels, concatenated from the finest level.
#[derive(Debug, Clone)]
pub struct PyramidAnchors {
    image_hw: [i64; 2],
    pixel_anchors: Vec<TLBR<f32>>,
}

impl PyramidAnchors {
    pub fn new(
        image_hw: [i64; 2],
        scales: &[f64],
        ratios: &[f64],
        feature_shapes: &[[i64; 2]],
        feature_strides: &[i64],
        anchor_stride: i64,
    ) -> Result<Self> {
        ensure!(
            !scales.is_empty() && !ratios.is_empty(),
            "anchor scales and ratios must not be empty"
        );
        ensure!(
            scales.len() == feature_shapes.len() && scales.len() == feature_strides.len(),
            "scales, feature shapes and feature strides must have the same length"
        );
        ensure!(anchor_stride > 0, "anchor_stride must be positive");

        let pixel_anchors = izip!(scales, feature_shapes, feature_strides)
            .flat_map(|(&scale, &shape, &stride)| {
                generate_anchors(scale, ratios, shape, stride, anchor_stride)
            })
            .collect();

        Ok(Self {
            image_hw,
            pixel_anchors,
        })
    }

    pub fn from_config(config: &MimicConfig) -> Result<Self> {
        let scales: Vec<_> = config.rpn_anchor_scales.iter().map(|s| s.raw()).collect();
        let ratios: Vec<_> = config.rpn_anchor_ratios.iter().map(|r| r.raw()).collect();
        Self::new(
            config.image_hw(),
            &scales,
            &ratios,
            &config.backbone_shapes(),
            &config.backbone_strides,
            config.rpn_anchor_stride,
        )
    }

    pub fn len(&self) -> usize {
        self.pixel_anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixel_anchors.is_empty()
    }

    /// Anchors in image pixel coordinates.
    pub fn pixel_anchors(&self) -> &[TLBR<f32>] {
        &self.pixel_anchors
    }

    /// Anchors in normalized coordinates as a `[num_anchors, 4]` tensor.
    pub fn to_normalized_tensor(&self, device: Device) -> Tensor {
        let [image_h, image_w] = self.image_hw;
        let values: Vec<f32> = self
            .pixel_anchors
            .iter()
            .flat_map(|anchor| anchor.normalize(image_h as f32, image_w as f32).tlbr())
            .collect();
        Tensor::of_slice(&values)
            .view([-1, 4])
            .set_requires_grad(false)
            .to_device(device)
    }
}
