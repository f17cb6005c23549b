//! Model and loss configuration.

use crate::common::*;

/// Strides of pyramid levels P2 to P6 produced by the ResNet+FPN.
pub const PYRAMID_STRIDES: [i64; 5] = [4, 8, 16, 32, 64];

/// The residual network depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Architecture {
    #[serde(rename = "resnet50")]
    ResNet50,
    #[serde(rename = "resnet101")]
    ResNet101,
}

impl Architecture {
    /// Number of identity blocks following the first block of stage 4.
    pub fn stage4_identity_blocks(&self) -> usize {
        match self {
            Self::ResNet50 => 5,
            Self::ResNet101 => 22,
        }
    }
}

/// Scalar weights applied to each named loss.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LossWeights {
    pub rpn_class_loss: R64,
    pub rpn_bbox_loss: R64,
    pub rpn_mimic_loss: R64,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            rpn_class_loss: r64(1.0),
            rpn_bbox_loss: r64(1.0),
            rpn_mimic_loss: r64(1.0),
        }
    }
}

/// The mimic training model configuration.
///
/// Omitted fields take the values of the standard Mask R-CNN setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MimicConfig {
    /// The frozen teacher backbone.
    pub teacher_backbone: Architecture,
    /// The trainable student backbone.
    pub student_backbone: Architecture,
    /// Divides the filter count of every student backbone convolution.
    pub student_width_divisor: usize,
    /// Number of images per batch.
    pub batch_size: usize,
    /// Run student batch norm in training mode during training steps.
    /// When disabled, the student uses its running statistics.
    pub train_bn: bool,
    /// Input image shape in `[height, width, channels]`.
    pub image_shape: [i64; 3],
    /// Strides of pyramid levels P2 to P6 relative to the input image.
    pub backbone_strides: Vec<i64>,
    /// Channel depth of every pyramid level.
    pub top_down_pyramid_size: i64,
    /// Anchor side lengths in pixels, one per pyramid level.
    pub rpn_anchor_scales: Vec<R64>,
    /// Anchor width-to-height ratios shared by all levels.
    pub rpn_anchor_ratios: Vec<R64>,
    /// Anchor placement stride in feature map cells.
    pub rpn_anchor_stride: i64,
    /// IoU threshold of non-maximum suppression on proposals.
    pub rpn_nms_threshold: R64,
    /// Number of anchors sampled per image for the RPN losses.
    pub rpn_train_anchors_per_image: usize,
    /// Standard deviation divisor of RPN box deltas.
    pub rpn_bbox_std_dev: [R64; 4],
    /// Number of top scoring anchors kept before non-maximum suppression.
    pub pre_nms_limit: i64,
    pub post_nms_rois_training: i64,
    pub post_nms_rois_inference: i64,
    /// Number of sampled ROIs per image fed to the mimic loss.
    pub train_rois_per_image: i64,
    /// Fraction of positive ROIs among the sampled ROIs.
    pub roi_positive_ratio: R64,
    /// Standard deviation divisor of detection target deltas.
    pub bbox_std_dev: [R64; 4],
    /// Output size of mask targets.
    pub mask_shape: [i64; 2],
    pub weight_decay: R64,
    pub loss_weights: LossWeights,
}

impl Default for MimicConfig {
    fn default() -> Self {
        Self {
            teacher_backbone: Architecture::ResNet101,
            student_backbone: Architecture::ResNet50,
            student_width_divisor: 1,
            batch_size: 2,
            train_bn: true,
            image_shape: [1024, 1024, 3],
            backbone_strides: PYRAMID_STRIDES.to_vec(),
            top_down_pyramid_size: 256,
            rpn_anchor_scales: [32.0, 64.0, 128.0, 256.0, 512.0]
                .into_iter()
                .map(r64)
                .collect(),
            rpn_anchor_ratios: [0.5, 1.0, 2.0].into_iter().map(r64).collect(),
            rpn_anchor_stride: 1,
            rpn_nms_threshold: r64(0.7),
            rpn_train_anchors_per_image: 256,
            rpn_bbox_std_dev: [r64(0.1), r64(0.1), r64(0.2), r64(0.2)],
            pre_nms_limit: 6000,
            post_nms_rois_training: 2000,
            post_nms_rois_inference: 1000,
            train_rois_per_image: 200,
            roi_positive_ratio: r64(0.33),
            bbox_std_dev: [r64(0.1), r64(0.1), r64(0.2), r64(0.2)],
            mask_shape: [28, 28],
            weight_decay: r64(0.0001),
            loss_weights: LossWeights::default(),
        }
    }
}

impl MimicConfig {
    /// Check the configuration before any network is built.
    pub fn validate(&self) -> Result<()> {
        let Self {
            student_width_divisor,
            batch_size,
            image_shape: [height, width, channels],
            ref backbone_strides,
            top_down_pyramid_size,
            ref rpn_anchor_scales,
            ref rpn_anchor_ratios,
            rpn_anchor_stride,
            rpn_nms_threshold,
            rpn_train_anchors_per_image,
            pre_nms_limit,
            post_nms_rois_training,
            post_nms_rois_inference,
            train_rois_per_image,
            roi_positive_ratio,
            mask_shape: [mask_h, mask_w],
            weight_decay,
            ref loss_weights,
            ..
        } = *self;

        ensure!(
            height > 0 && width > 0 && height % 64 == 0 && width % 64 == 0,
            "image size must be divisible by 2 at least 6 times, for example, \
             256, 320, 384, 448, 512, but get {}x{}",
            height,
            width
        );
        ensure!(channels > 0, "image channels must be positive");
        ensure!(batch_size > 0, "batch_size must be positive");
        ensure!(
            student_width_divisor > 0 && 64 % student_width_divisor == 0,
            "student_width_divisor must divide 64, but get {}",
            student_width_divisor
        );
        ensure!(
            backbone_strides[..] == PYRAMID_STRIDES[..],
            "backbone_strides must be {:?} to match the ResNet+FPN levels P2 to P6, but get {:?}",
            PYRAMID_STRIDES,
            backbone_strides
        );
        ensure!(
            top_down_pyramid_size > 0,
            "top_down_pyramid_size must be positive"
        );
        ensure!(
            !rpn_anchor_scales.is_empty() && !rpn_anchor_ratios.is_empty(),
            "anchor scales and ratios must not be empty"
        );
        ensure!(
            rpn_anchor_scales.len() == backbone_strides.len(),
            "the number of anchor scales ({}) must match the number of backbone strides ({})",
            rpn_anchor_scales.len(),
            backbone_strides.len()
        );
        ensure!(
            rpn_anchor_scales
                .iter()
                .chain(rpn_anchor_ratios)
                .all(|value| value.raw() > 0.0),
            "anchor scales and ratios must be positive"
        );
        ensure!(rpn_anchor_stride > 0, "rpn_anchor_stride must be positive");
        ensure!(
            (0.0..=1.0).contains(&rpn_nms_threshold.raw()),
            "rpn_nms_threshold must be in range [0, 1]"
        );
        ensure!(
            rpn_train_anchors_per_image > 0,
            "rpn_train_anchors_per_image must be positive"
        );
        ensure!(pre_nms_limit > 0, "pre_nms_limit must be positive");
        ensure!(
            post_nms_rois_training > 0 && post_nms_rois_inference > 0,
            "proposal count must be positive"
        );
        ensure!(
            train_rois_per_image > 0,
            "train_rois_per_image must be positive"
        );
        ensure!(
            roi_positive_ratio.raw() > 0.0 && roi_positive_ratio.raw() <= 1.0,
            "roi_positive_ratio must be in range (0, 1]"
        );
        ensure!(mask_h > 0 && mask_w > 0, "mask_shape must be positive");
        ensure!(weight_decay.raw() >= 0.0, "weight_decay must be non-negative");
        ensure!(
            [
                loss_weights.rpn_class_loss,
                loss_weights.rpn_bbox_loss,
                loss_weights.rpn_mimic_loss
            ]
            .iter()
            .all(|weight| weight.raw() >= 0.0),
            "loss weights must be non-negative"
        );

        Ok(())
    }

    pub fn image_hw(&self) -> [i64; 2] {
        let [h, w, _c] = self.image_shape;
        [h, w]
    }

    pub fn anchors_per_location(&self) -> i64 {
        self.rpn_anchor_ratios.len() as i64
    }

    pub fn rpn_bbox_std_dev(&self) -> [f64; 4] {
        self.rpn_bbox_std_dev.map(|value| value.raw())
    }

    pub fn bbox_std_dev(&self) -> [f64; 4] {
        self.bbox_std_dev.map(|value| value.raw())
    }

    /// Spatial size of each pyramid level, rounded up.
    pub fn backbone_shapes(&self) -> Vec<[i64; 2]> {
        let [height, width] = self.image_hw();
        self.backbone_strides
            .iter()
            .map(|&stride| [(height + stride - 1) / stride, (width + stride - 1) / stride])
            .collect()
    }
}
