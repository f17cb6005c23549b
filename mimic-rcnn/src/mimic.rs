//! Proposal-level feature mimicking loss.

use crate::{batch::batch_slice, common::*, image_meta::ImageMeta};

/// Reference ROI size of the canonical level 4, from ImageNet pre-training.
pub const CANONICAL_ROI_SIZE: f64 = 224.0;

/// Pyramid levels compared by the mimic loss.
pub const MIMIC_LEVELS: [i64; 4] = [2, 3, 4, 5];

fn round_half_even(value: f64) -> f64 {
    if (value - value.trunc()).abs() == 0.5 {
        2.0 * (value / 2.0).round()
    } else {
        value.round()
    }
}

/// Pyramid level of a normalized box of height `h` and width `w`.
///
/// `level = clamp(4 + round(log2(sqrt(h * w) / (224 / sqrt(image_area)))), 2, 5)`.
/// Boxes without area land on level 2.
pub fn pyramid_level_of(h: f64, w: f64, image_area: f64) -> i64 {
    let size = (h * w).max(0.0).sqrt();
    let level = 4.0 + round_half_even((size / (CANONICAL_ROI_SIZE / image_area.sqrt())).log2());
    // max() drops NaN
    level.max(2.0).min(5.0) as i64
}

/// Assign `[batch, num_rois, 4]` normalized boxes to pyramid levels.
///
/// Returns a `[batch, num_rois]` int64 tensor with values in `2..=5`.
pub fn assign_pyramid_levels(boxes: &Tensor, image_hw: [i64; 2]) -> Result<Tensor> {
    let (_batch_size, _num_rois, num_coords) = boxes.size3()?;
    ensure!(num_coords == 4, "expect boxes in shape [batch, num_rois, 4]");
    let [image_h, image_w] = image_hw;
    let image_area = (image_h * image_w) as f64;

    let levels = tch::no_grad(|| {
        let h = boxes.select(2, 2) - boxes.select(2, 0);
        let w = boxes.select(2, 3) - boxes.select(2, 1);
        let size = (h * w).to_kind(Kind::Double).clamp_min(0.0).sqrt();
        // round() is half to even
        ((size / (CANONICAL_ROI_SIZE / image_area.sqrt())).log2().round() + 4.0)
            .clamp(2.0, 5.0)
            .to_kind(Kind::Int64)
    });
    Ok(levels)
}

#[derive(Debug, Clone)]
pub struct FeatureTransformerInit {
    pub depth: usize,
    /// The depth of the pyramid being mimicked.
    pub target_depth: usize,
}

impl FeatureTransformerInit {
    pub fn build<'p>(self, path: impl Borrow<nn::Path<'p>>) -> Result<FeatureTransformer> {
        let Self {
            depth,
            target_depth,
        } = self;
        ensure!(
            depth == target_depth,
            "transformer depth {} does not match the mimicked pyramid depth {}",
            depth,
            target_depth
        );

        let conv = ConvBn2DInit {
            relu: false,
            batch_norm: None,
            ..ConvBn2DInit::new(depth, target_depth, 3)
        }
        .build(path.borrow() / "conv");
        Ok(FeatureTransformer { conv })
    }
}

/// Linear 3x3 convolution mapping student features into the teacher space.
///
/// One instance is shared by all pyramid levels.
#[derive(Debug)]
pub struct FeatureTransformer {
    conv: ConvBn2D,
}

impl FeatureTransformer {
    pub fn forward_t(&self, input: &Tensor, train: bool) -> Tensor {
        self.conv.forward_t(input, train)
    }
}

impl WeightDecay for FeatureTransformer {
    fn decayed_params(&self) -> Vec<Tensor> {
        self.conv.decayed_params()
    }
}

/// The mimic loss with per-level statistics.
#[derive(Debug, TensorLike)]
pub struct MimicLossOutput {
    /// Normalized loss, a scalar.
    pub loss: Tensor,
    /// Accumulated squared difference means of levels P2 to P5.
    pub level_totals: Vec<Tensor>,
    /// Number of non-empty crops of levels P2 to P5.
    #[tensor_like(copy)]
    pub level_counts: [usize; 4],
}

#[derive(Debug, Clone)]
pub struct MimicLossInit {
    pub batch_size: i64,
    pub rois_per_image: i64,
    /// Strides of levels P2 to P5.
    pub backbone_strides: [i64; 4],
}

impl MimicLossInit {
    pub fn build(self) -> Result<MimicLoss> {
        let Self {
            batch_size,
            rois_per_image,
            backbone_strides,
        } = self;
        ensure!(batch_size > 0, "batch_size must be positive");
        ensure!(rois_per_image > 0, "rois_per_image must be positive");
        ensure!(
            backbone_strides.iter().all(|&stride| stride > 0),
            "backbone strides must be positive"
        );

        Ok(MimicLoss {
            batch_size,
            rois_per_image,
            backbone_strides,
            l2_loss: L2Loss::new(Reduction::Mean),
        })
    }
}

/// Compares transformed student maps against teacher maps inside ROIs.
///
/// Each ROI is routed to one pyramid level by its size. On that level the
/// ROI region is cut from the student and teacher maps of its source image
/// and the mean squared difference is accumulated. Empty crops, including
/// the zero boxes padding the ROI list, add nothing. The sum over levels
/// and images is divided by `2 × batch_size × rois_per_image`.
#[derive(Debug, Clone, CopyGetters)]
pub struct MimicLoss {
    #[getset(get_copy = "pub")]
    batch_size: i64,
    #[getset(get_copy = "pub")]
    rois_per_image: i64,
    backbone_strides: [i64; 4],
    l2_loss: L2Loss,
}

impl MimicLoss {
    fn capacity(&self) -> i64 {
        self.batch_size * self.rois_per_image
    }

    /// `student` and `teacher` hold levels P2 to P5 in shape
    /// `[batch, channels, height, width]`. `rois` is
    /// `[batch, rois_per_image, 4]` in normalized coordinates.
    pub fn forward(
        &self,
        student: &[&Tensor],
        teacher: &[&Tensor],
        rois: &Tensor,
        image_metas: &[ImageMeta],
    ) -> Result<MimicLossOutput> {
        let num_levels = MIMIC_LEVELS.len();
        ensure!(
            student.len() == num_levels && teacher.len() == num_levels,
            "expect {} student and teacher levels, but get {} and {}",
            num_levels,
            student.len(),
            teacher.len()
        );
        ensure!(
            rois.size() == vec![self.batch_size, self.rois_per_image, 4],
            "expect rois in shape [{}, {}, 4], but get {:?}",
            self.batch_size,
            self.rois_per_image,
            rois.size()
        );
        for (student_map, teacher_map) in student.iter().zip(teacher) {
            let (batch_size, _c, _h, _w) = student_map.size4()?;
            ensure!(
                batch_size == self.batch_size,
                "expect batch size {}, but get {}",
                self.batch_size,
                batch_size
            );
            ensure!(
                student_map.size() == teacher_map.size(),
                "student map shape {:?} does not match teacher map shape {:?}",
                student_map.size(),
                teacher_map.size()
            );
        }

        // levels are computed from the shape of the first image
        let image_hw = image_metas
            .first()
            .ok_or_else(|| format_err!("image meta is missing"))?
            .image_hw();
        let roi_levels = assign_pyramid_levels(rois, image_hw)?;

        let inputs: Vec<&Tensor> = chain!(
            student.iter().copied(),
            teacher.iter().copied(),
            [rois, &roi_levels]
        )
        .collect();
        let mut per_image = batch_slice(
            &inputs,
            |slices| {
                let (student, rest) = slices.split_at(num_levels);
                let (teacher, rest) = rest.split_at(num_levels);
                self.image_loss(student, teacher, &rest[0], &rest[1], image_hw)
            },
            self.batch_size,
        )?;

        // the last output holds the crop counts in shape [batch, 4]
        let counts = per_image
            .pop()
            .ok_or_else(|| format_err!("crop counts are missing"))?;
        let counts = Vec::<i64>::from(&counts.sum_dim_intlist(&[0], false, Kind::Int64));
        let mut level_counts = [0; 4];
        for (slot, count) in level_counts.iter_mut().zip(counts) {
            *slot = count as usize;
        }

        let level_totals: Vec<_> = per_image
            .iter()
            .map(|totals| totals.sum(Kind::Float))
            .collect();
        let loss = Tensor::f_sum_tensors(&level_totals)? / (2.0 * self.capacity() as f64);

        Ok(MimicLossOutput {
            loss,
            level_totals,
            level_counts,
        })
    }

    /// Per-level squared difference totals of one image, followed by the
    /// crop counts per level.
    fn image_loss(
        &self,
        student: &[Tensor],
        teacher: &[Tensor],
        rois: &Tensor,
        roi_levels: &Tensor,
        image_hw: [i64; 2],
    ) -> Result<Vec<Tensor>> {
        let [image_h, image_w] = image_hw;
        let rects = TlbrTensor::from_packed(rois)?.to_rects();
        let roi_levels = Vec::<i64>::from(roi_levels);

        let device = rois.device();
        let mut totals: Vec<_> = MIMIC_LEVELS
            .iter()
            .map(|_| Tensor::zeros(&[], (Kind::Float, device)))
            .collect();
        let mut counts = [0i64; 4];

        for (rect, level) in rects.iter().zip(roi_levels) {
            let index = (level - MIMIC_LEVELS[0]) as usize;
            let (student_map, teacher_map) = (&student[index], &teacher[index]);
            let (_c, map_h, map_w) = student_map.size3()?;
            let stride = self.backbone_strides[index];
            let grid_h = image_h as f32 / stride as f32;
            let grid_w = image_w as f32 / stride as f32;

            let [t, l, b, r] = rect.to_grid_cells(grid_h, grid_w).tlbr();
            let (t, l) = (t.clamp(0, map_h), l.clamp(0, map_w));
            let (b, r) = (b.clamp(t, map_h), r.clamp(l, map_w));
            let (crop_h, crop_w) = (b - t, r - l);

            // empty crops, padding included, add nothing
            if crop_h == 0 || crop_w == 0 {
                continue;
            }

            let crop = |map: &Tensor| map.narrow(1, t, crop_h).narrow(2, l, crop_w);
            let diff = self
                .l2_loss
                .forward(&crop(student_map), &crop(teacher_map))?;
            totals[index] = &totals[index] + diff;
            counts[index] += 1;
        }

        totals.push(Tensor::of_slice(&counts).to_device(device));
        Ok(totals)
    }
}
