//! Teacher and student networks wired into one training model.

use crate::{
    anchors::PyramidAnchors,
    backbone::{ResNet, ResNetInit},
    batch::batch_slice,
    common::*,
    config::{Architecture, MimicConfig},
    fpn::{Fpn, FpnInit, PyramidOutput},
    image_meta::ImageMeta,
    mimic::{FeatureTransformer, FeatureTransformerInit, MimicLoss, MimicLossInit, MimicLossOutput},
    proposal::{ProposalLayer, ProposalLayerInit},
    rpn::{RpnHead, RpnHeadInit, RpnOutput},
    target::{DetectionTargetAssigner, DetectionTargets, ProposalTargetSamplerInit},
};
use tch_modules::l2_regularization;

pub use inputs::*;
pub use losses::*;
pub use networks::*;

/// Whether the model carries ground truth and losses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Training,
    Inference,
}

mod networks {
    use super::*;

    /// The frozen teacher ResNet+FPN.
    ///
    /// It owns a private variable store whose variables never require
    /// gradients, so no optimizer built from the student store can see them.
    #[derive(Debug)]
    pub struct TeacherNetwork {
        vs: nn::VarStore,
        resnet: ResNet,
        fpn: Fpn,
    }

    impl TeacherNetwork {
        pub fn new(
            architecture: Architecture,
            in_channels: usize,
            pyramid_depth: i64,
            device: Device,
        ) -> Result<Self> {
            ensure!(in_channels > 0, "input channels must be positive");
            ensure!(pyramid_depth > 0, "pyramid depth must be positive");
            let mut vs = nn::VarStore::new(device);
            let (resnet, fpn) = {
                let root = vs.root();
                let resnet = ResNetInit {
                    in_c: in_channels,
                    ..ResNetInit::new(architecture)
                }
                .build(&root / "resnet")?;
                let [_, c2, c3, c4, c5] = resnet.out_channels();
                let fpn = FpnInit {
                    in_channels: [c2, c3, c4, c5],
                    depth: pyramid_depth as usize,
                    with_p6: false,
                }
                .build(&root / "fpn")?;
                (resnet, fpn)
            };
            vs.freeze();

            Ok(Self { vs, resnet, fpn })
        }

        /// Load pretrained weights. Variables absent from the file keep
        /// their initial values.
        pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
            let path = path.as_ref();
            let missing = self
                .vs
                .load_partial(path)
                .with_context(|| format!("unable to load teacher weights from {}", path.display()))?;
            if !missing.is_empty() {
                warn!(
                    "{} teacher variables are missing in {}",
                    missing.len(),
                    path.display()
                );
            }
            self.vs.freeze();
            info!("teacher weights loaded from {}", path.display());
            Ok(())
        }

        pub fn var_store(&self) -> &nn::VarStore {
            &self.vs
        }

        pub fn device(&self) -> Device {
            self.vs.device()
        }

        pub fn depth(&self) -> i64 {
            self.fpn.depth()
        }

        pub fn in_channels(&self) -> usize {
            self.resnet.in_channels()
        }

        /// Pyramid levels P2 to P5 computed without gradient and with
        /// batch norm in inference mode.
        pub fn forward(&self, images: &Tensor) -> Result<PyramidOutput> {
            tch::no_grad(|| -> Result<_> {
                let features = self.resnet.forward_t(images, false)?;
                self.fpn.forward_t(&features, false)
            })
        }
    }

    /// Student activations of one pass.
    #[derive(Debug, TensorLike)]
    pub struct StudentOutput {
        pub pyramid: PyramidOutput,
        pub rpn: RpnOutput,
    }

    /// The trainable student ResNet+FPN with its RPN head and the feature
    /// transformer used for mimicking.
    #[derive(Debug)]
    pub struct StudentNetwork {
        resnet: ResNet,
        fpn: Fpn,
        rpn_head: RpnHead,
        transformer: FeatureTransformer,
    }

    impl StudentNetwork {
        pub fn new<'p>(
            path: impl Borrow<nn::Path<'p>>,
            config: &MimicConfig,
            teacher_depth: i64,
        ) -> Result<Self> {
            let path = path.borrow();
            let depth = config.top_down_pyramid_size as usize;

            let resnet = ResNetInit {
                architecture: config.student_backbone,
                in_c: config.image_shape[2] as usize,
                width_divisor: config.student_width_divisor,
            }
            .build(path / "resnet")?;
            let [_, c2, c3, c4, c5] = resnet.out_channels();
            let fpn = FpnInit {
                in_channels: [c2, c3, c4, c5],
                depth,
                with_p6: true,
            }
            .build(path / "fpn")?;
            let rpn_head = RpnHeadInit::new(
                depth,
                config.anchors_per_location() as usize,
                config.rpn_anchor_stride as usize,
            )
            .build(path / "rpn")?;
            let transformer = FeatureTransformerInit {
                depth,
                target_depth: teacher_depth as usize,
            }
            .build(path / "transformer")?;

            Ok(Self {
                resnet,
                fpn,
                rpn_head,
                transformer,
            })
        }

        pub fn forward_t(&self, images: &Tensor, train: bool) -> Result<StudentOutput> {
            let features = self.resnet.forward_t(images, train)?;
            let pyramid = self.fpn.forward_t(&features, train)?;
            let rpn = self.rpn_head.forward_levels(&pyramid.rpn_levels(), train)?;
            Ok(StudentOutput { pyramid, rpn })
        }

        /// Map levels P2 to P5 into the teacher feature space.
        pub fn transform(&self, pyramid: &PyramidOutput, train: bool) -> Vec<Tensor> {
            pyramid
                .mimic_levels()
                .iter()
                .map(|level| self.transformer.forward_t(level, train))
                .collect()
        }
    }

    impl WeightDecay for StudentNetwork {
        fn decayed_params(&self) -> Vec<Tensor> {
            chain!(
                self.resnet.decayed_params(),
                self.fpn.decayed_params(),
                self.rpn_head.decayed_params(),
                self.transformer.decayed_params()
            )
            .collect()
        }
    }
}

mod inputs {
    use super::*;

    /// A training batch.
    #[derive(Debug, TensorLike)]
    pub struct TrainingInput {
        /// Images in shape `[batch, channels, height, width]`.
        pub images: Tensor,
        #[tensor_like(clone)]
        pub image_metas: Vec<ImageMeta>,
        /// Anchor labels in `{-1, 0, 1}`, in shape `[batch, num_anchors]`.
        pub rpn_match: Tensor,
        /// Deltas of positive anchors in shape `[batch, num_train_anchors, 4]`.
        pub rpn_bbox: Tensor,
        /// Class ids in shape `[batch, max_gt]`. Zero marks padding.
        pub gt_class_ids: Tensor,
        /// Pixel boxes in shape `[batch, max_gt, 4]`.
        pub gt_boxes: Tensor,
        /// Full-image masks in shape `[batch, max_gt, height, width]`.
        pub gt_masks: Option<Tensor>,
    }

    /// Sampled detection targets of a batch.
    #[derive(Debug, TensorLike)]
    pub struct BatchTargets {
        /// `[batch, rois, 4]`
        pub rois: Tensor,
        /// `[batch, rois]`
        pub class_ids: Tensor,
        /// `[batch, rois, 4]`
        pub deltas: Tensor,
        /// `[batch, rois, mask_h, mask_w]`
        pub masks: Option<Tensor>,
    }

    #[derive(Debug, TensorLike)]
    pub struct TrainingOutput {
        pub rpn: RpnOutput,
        /// `[batch, post_nms_rois_training, 4]`
        pub proposals: Tensor,
        pub targets: BatchTargets,
        pub mimic: MimicLossOutput,
        pub losses: MimicLosses,
    }

    #[derive(Debug, TensorLike)]
    pub struct InferenceOutput {
        pub rpn: RpnOutput,
        /// `[batch, proposal_count, 4]`
        pub proposals: Tensor,
    }
}

mod losses {
    use super::*;

    /// Raw and weighted losses of one training step.
    #[derive(Debug, TensorLike)]
    pub struct MimicLosses {
        pub rpn_class_loss: Tensor,
        pub rpn_bbox_loss: Tensor,
        pub rpn_mimic_loss: Tensor,
        pub weighted_rpn_class_loss: Tensor,
        pub weighted_rpn_bbox_loss: Tensor,
        pub weighted_rpn_mimic_loss: Tensor,
        pub weight_decay: Tensor,
        /// Sum of the weighted losses and weight decay.
        pub total_loss: Tensor,
    }

    impl MimicLosses {
        /// Average each loss over a non-empty list of steps.
        pub fn mean(steps: &[MimicLosses]) -> Result<Self> {
            ensure!(!steps.is_empty(), "cannot average an empty list of losses");
            let mean = |select: fn(&MimicLosses) -> &Tensor| -> Result<Tensor> {
                let values: Vec<&Tensor> = steps.iter().map(select).collect();
                Ok(Tensor::f_stack(&values, 0)?.f_mean(Kind::Float)?)
            };

            Ok(Self {
                rpn_class_loss: mean(|losses| &losses.rpn_class_loss)?,
                rpn_bbox_loss: mean(|losses| &losses.rpn_bbox_loss)?,
                rpn_mimic_loss: mean(|losses| &losses.rpn_mimic_loss)?,
                weighted_rpn_class_loss: mean(|losses| &losses.weighted_rpn_class_loss)?,
                weighted_rpn_bbox_loss: mean(|losses| &losses.weighted_rpn_bbox_loss)?,
                weighted_rpn_mimic_loss: mean(|losses| &losses.weighted_rpn_mimic_loss)?,
                weight_decay: mean(|losses| &losses.weight_decay)?,
                total_loss: mean(|losses| &losses.total_loss)?,
            })
        }
    }

    /// Cross entropy of anchor logits over labelled anchors.
    ///
    /// Anchors with match 0 are ignored. Returns zero when no anchor is
    /// labelled.
    pub fn rpn_class_loss(rpn_match: &Tensor, class_logits: &Tensor) -> Result<Tensor> {
        let (batch_size, num_anchors) = rpn_match.size2()?;
        ensure!(
            class_logits.size() == vec![batch_size, num_anchors, 2],
            "expect [{}, {}, 2] logits, but get shape {:?}",
            batch_size,
            num_anchors,
            class_logits.size()
        );

        let rpn_match = rpn_match.view([-1]);
        let index = rpn_match.ne(0).nonzero().view([-1]);
        let labels = rpn_match.eq(1).to_kind(Kind::Int64).index_select(0, &index);
        let logits = class_logits.view([-1, 2]).index_select(0, &index);

        CrossEntropyLoss::new(Reduction::Mean).forward(&logits, &labels)
    }

    /// Smooth L1 loss of positive anchor deltas.
    ///
    /// Targets of each image are packed at the front of `target_bbox` in
    /// anchor order. Returns zero when no anchor is positive.
    pub fn rpn_bbox_loss(
        target_bbox: &Tensor,
        rpn_match: &Tensor,
        rpn_deltas: &Tensor,
    ) -> Result<Tensor> {
        let (batch_size, num_anchors) = rpn_match.size2()?;
        let (target_batch_size, num_targets, _) = target_bbox.size3()?;
        ensure!(
            target_batch_size == batch_size,
            "batch size mismatch between targets and matches"
        );
        ensure!(
            rpn_deltas.size() == vec![batch_size, num_anchors, 4],
            "expect [{}, {}, 4] deltas, but get shape {:?}",
            batch_size,
            num_anchors,
            rpn_deltas.size()
        );

        let positive = rpn_match.eq(1);
        let index = positive.view([-1]).nonzero().view([-1]);
        let predictions = rpn_deltas.view([-1, 4]).index_select(0, &index);

        let counts = Vec::<i64>::from(&positive.sum_dim_intlist(&[1], false, Kind::Int64));
        let targets: Vec<_> = counts
            .iter()
            .enumerate()
            .map(|(image, &count)| -> Result<_> {
                ensure!(
                    count <= num_targets,
                    "image {} has {} positive anchors but only {} target deltas",
                    image,
                    count,
                    num_targets
                );
                Ok(target_bbox.get(image as i64).narrow(0, 0, count))
            })
            .collect::<Result<_>>()?;
        let targets = Tensor::f_cat(&targets, 0)?;

        SmoothL1Loss::new(Reduction::Mean).forward(&predictions, &targets)
    }
}

#[derive(Debug, Clone)]
pub struct MimicModelInit {
    pub config: MimicConfig,
    pub mode: Mode,
}

impl MimicModelInit {
    /// Build the model with student variables under `path`.
    ///
    /// Training mode requires the teacher network. Inference mode builds
    /// only the student detection path.
    pub fn build<'p>(
        self,
        path: impl Borrow<nn::Path<'p>>,
        teacher: Option<TeacherNetwork>,
    ) -> Result<MimicModel> {
        let path = path.borrow();
        let Self { config, mode } = self;
        config.validate()?;

        let teacher = match (mode, teacher) {
            (Mode::Training, None) => bail!("training mode requires a teacher network"),
            (Mode::Training, Some(teacher)) => {
                ensure!(
                    teacher.device() == path.device(),
                    "teacher is on {:?} but student is on {:?}",
                    teacher.device(),
                    path.device()
                );
                ensure!(
                    teacher.in_channels() as i64 == config.image_shape[2],
                    "teacher expects {} input channels, but images have {}",
                    teacher.in_channels(),
                    config.image_shape[2]
                );
                Some(teacher)
            }
            (Mode::Inference, Some(_)) => {
                warn!("the teacher network is not used in inference mode");
                None
            }
            (Mode::Inference, None) => None,
        };
        let teacher_depth = teacher
            .as_ref()
            .map(|teacher| teacher.depth())
            .unwrap_or(config.top_down_pyramid_size);

        let student = StudentNetwork::new(path, &config, teacher_depth)?;
        let anchors = PyramidAnchors::from_config(&config)?.to_normalized_tensor(path.device());

        let proposal_count = match mode {
            Mode::Training => config.post_nms_rois_training,
            Mode::Inference => config.post_nms_rois_inference,
        };
        let proposal_layer = ProposalLayerInit {
            proposal_count,
            nms_threshold: config.rpn_nms_threshold.raw(),
            pre_nms_limit: config.pre_nms_limit,
            rpn_bbox_std_dev: config.rpn_bbox_std_dev(),
        }
        .build()?;

        let target_assigner = ProposalTargetSamplerInit::from_config(&config).build()?;
        let [s2, s3, s4, s5, _] = <[i64; 5]>::try_from(config.backbone_strides.as_slice())?;
        let mimic_loss = MimicLossInit {
            batch_size: config.batch_size as i64,
            rois_per_image: config.train_rois_per_image,
            backbone_strides: [s2, s3, s4, s5],
        }
        .build()?;

        info!(
            "mimic model built in {:?} mode with {} anchors",
            mode,
            anchors.size()[0]
        );

        Ok(MimicModel {
            config,
            mode,
            student,
            teacher,
            anchors,
            proposal_layer,
            target_assigner: Box::new(target_assigner),
            mimic_loss,
            device: path.device(),
        })
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct MimicModel {
    config: MimicConfig,
    mode: Mode,
    student: StudentNetwork,
    teacher: Option<TeacherNetwork>,
    #[derivative(Debug = "ignore")]
    anchors: Tensor,
    proposal_layer: ProposalLayer,
    target_assigner: Box<dyn DetectionTargetAssigner>,
    mimic_loss: MimicLoss,
    device: Device,
}

impl MimicModel {
    pub fn config(&self) -> &MimicConfig {
        &self.config
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn student(&self) -> &StudentNetwork {
        &self.student
    }

    pub fn teacher(&self) -> Option<&TeacherNetwork> {
        self.teacher.as_ref()
    }

    /// Normalized anchors in shape `[num_anchors, 4]`.
    pub fn anchors(&self) -> &Tensor {
        &self.anchors
    }

    /// Replace the detection target assigner.
    pub fn with_target_assigner<A>(mut self, assigner: A) -> Self
    where
        A: 'static + DetectionTargetAssigner,
    {
        self.target_assigner = Box::new(assigner);
        self
    }

    /// L2 penalty over student parameters, batch norm excluded.
    pub fn weight_decay(&self) -> Tensor {
        l2_regularization(
            &self.student.decayed_params(),
            self.config.weight_decay.raw(),
            self.device,
        )
    }

    fn check_images(&self, images: &Tensor) -> Result<i64> {
        let (batch_size, channels, height, width) = images.size4()?;
        let [expect_h, expect_w, expect_c] = self.config.image_shape;
        ensure!(
            [height, width, channels] == [expect_h, expect_w, expect_c],
            "expect images of shape [_, {}, {}, {}], but get {:?}",
            expect_c,
            expect_h,
            expect_w,
            images.size()
        );
        Ok(batch_size)
    }

    /// Normalize `[batch, num, 4]` pixel boxes into the unit window.
    fn normalize_boxes(&self, boxes: &Tensor) -> Tensor {
        let [height, width] = self.config.image_hw();
        let (scale_h, scale_w) = ((height - 1) as f64, (width - 1) as f64);
        let shift = Tensor::of_slice(&[0f32, 0.0, 1.0, 1.0]).to_device(boxes.device());
        let scale = Tensor::of_slice(&[scale_h, scale_w, scale_h, scale_w])
            .to_kind(Kind::Float)
            .to_device(boxes.device());
        (boxes.to_kind(Kind::Float) - shift) / scale
    }

    /// Student RPN outputs and proposals.
    pub fn forward_inference(&self, images: &Tensor) -> Result<InferenceOutput> {
        self.check_images(images)?;
        let student = self.student.forward_t(images, false)?;
        let proposals =
            self.proposal_layer
                .forward(&student.rpn.probs, &student.rpn.deltas, &self.anchors)?;
        Ok(InferenceOutput {
            rpn: student.rpn,
            proposals,
        })
    }

    /// Run the teacher and the student and compute all losses.
    pub fn forward_train(&self, input: &TrainingInput) -> Result<TrainingOutput> {
        self.forward_losses(input, self.config.train_bn)
    }

    /// Compute the training losses without gradients.
    ///
    /// Student batch norm uses its running statistics, which are left untouched.
    pub fn forward_validation(&self, input: &TrainingInput) -> Result<TrainingOutput> {
        tch::no_grad(|| self.forward_losses(input, false))
    }

    fn forward_losses(&self, input: &TrainingInput, train_bn: bool) -> Result<TrainingOutput> {
        ensure!(
            self.mode == Mode::Training,
            "the model is not built in training mode"
        );
        let teacher = self
            .teacher
            .as_ref()
            .ok_or_else(|| format_err!("the teacher network is missing"))?;

        let TrainingInput {
            images,
            image_metas,
            rpn_match,
            rpn_bbox,
            gt_class_ids,
            gt_boxes,
            gt_masks,
        } = input;
        let batch_size = self.check_images(images)?;
        ensure!(
            batch_size == self.config.batch_size as i64,
            "expect batch size {}, but get {}",
            self.config.batch_size,
            batch_size
        );
        ensure!(
            image_metas.len() as i64 == batch_size,
            "expect {} image metas, but get {}",
            batch_size,
            image_metas.len()
        );

        let teacher_pyramid = teacher.forward(images)?;
        let student = self.student.forward_t(images, train_bn)?;
        let StudentOutput { pyramid, rpn } = student;

        let proposals = self
            .proposal_layer
            .forward(&rpn.probs, &rpn.deltas, &self.anchors)?;

        // sampled ROIs feed the mimic loss, not the raw proposals
        let targets = {
            let gt_boxes = self.normalize_boxes(gt_boxes);
            let mut inputs = vec![&proposals, gt_class_ids, &gt_boxes];
            inputs.extend(gt_masks.as_ref());

            let mut outputs = batch_slice(
                &inputs,
                |slices| {
                    let targets = self.target_assigner.assign(
                        &slices[0],
                        &slices[1],
                        &slices[2],
                        slices.get(3),
                    )?;
                    let DetectionTargets {
                        rois,
                        class_ids,
                        deltas,
                        masks,
                    } = targets;
                    Ok(chain!([rois, class_ids, deltas], masks).collect())
                },
                batch_size,
            )?
            .into_iter();

            let mut next = || {
                outputs
                    .next()
                    .ok_or_else(|| format_err!("detection targets are incomplete"))
            };
            BatchTargets {
                rois: next()?,
                class_ids: next()?,
                deltas: next()?,
                masks: gt_masks.as_ref().map(|_| next()).transpose()?,
            }
        };

        let transformed = self.student.transform(&pyramid, train_bn);
        let mimic = self.mimic_loss.forward(
            &transformed.iter().collect::<Vec<_>>(),
            &teacher_pyramid.mimic_levels(),
            &targets.rois,
            image_metas,
        )?;

        let rpn_class_loss = losses::rpn_class_loss(rpn_match, &rpn.class_logits)?;
        let rpn_bbox_loss = losses::rpn_bbox_loss(rpn_bbox, rpn_match, &rpn.deltas)?;
        let rpn_mimic_loss = mimic.loss.shallow_clone();

        let weights = &self.config.loss_weights;
        let weighted_rpn_class_loss = &rpn_class_loss * weights.rpn_class_loss.raw();
        let weighted_rpn_bbox_loss = &rpn_bbox_loss * weights.rpn_bbox_loss.raw();
        let weighted_rpn_mimic_loss = &rpn_mimic_loss * weights.rpn_mimic_loss.raw();
        let weight_decay = self.weight_decay();
        let total_loss = &weighted_rpn_class_loss
            + &weighted_rpn_bbox_loss
            + &weighted_rpn_mimic_loss
            + &weight_decay;

        Ok(TrainingOutput {
            rpn,
            proposals,
            targets,
            mimic,
            losses: MimicLosses {
                rpn_class_loss,
                rpn_bbox_loss,
                rpn_mimic_loss,
                weighted_rpn_class_loss,
                weighted_rpn_bbox_loss,
                weighted_rpn_mimic_loss,
                weight_decay,
                total_loss,
            },
        })
    }
}
