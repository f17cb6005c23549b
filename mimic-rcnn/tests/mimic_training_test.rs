use anyhow::Result;
use bbox::{prelude::*, TLBR};
use mimic_rcnn::{
    Architecture, ImageMeta, MimicConfig, MimicLossInit, MimicModel, MimicModelInit, Mode,
    PyramidAnchors, RpnTargetBuilder, StudentNetwork, TeacherNetwork, TrainingInput,
};
use noisy_float::prelude::*;
use rand::prelude::*;
use tch::{nn, Device, Kind, Tensor};

fn refs(maps: &[Tensor]) -> Vec<&Tensor> {
    maps.iter().collect()
}

/// Copy every variable of `to` from the same-named variable of `from`.
fn copy_variables(from: &nn::VarStore, to: &nn::VarStore) {
    let source = from.variables();
    tch::no_grad(|| {
        for (name, mut var) in to.variables() {
            var.copy_(&source[&name]);
        }
    });
}

/// Make the student feature transformer an identity mapping.
fn make_transformer_identity(vs: &nn::VarStore, depth: i64) {
    let variables = vs.variables();
    tch::no_grad(|| {
        let mut weight = variables["transformer/conv/conv/weight"].shallow_clone();
        let _ = weight.zero_();
        let _ = variables["transformer/conv/conv/bias"].shallow_clone().zero_();
        for channel in 0..depth {
            let _ = weight.get(channel).get(channel).get(1).get(1).fill_(1.0);
        }
    });
}

/// Zero the RPN regressor so that proposals are the anchors themselves.
fn zero_rpn_deltas(vs: &nn::VarStore) {
    let variables = vs.variables();
    tch::no_grad(|| {
        for name in ["rpn/bbox_pred/conv/weight", "rpn/bbox_pred/conv/bias"] {
            let _ = variables[name].shallow_clone().zero_();
        }
    });
}

fn small_config() -> MimicConfig {
    MimicConfig {
        teacher_backbone: Architecture::ResNet50,
        student_backbone: Architecture::ResNet50,
        student_width_divisor: 4,
        batch_size: 2,
        image_shape: [64, 64, 3],
        top_down_pyramid_size: 32,
        rpn_anchor_scales: [8.0, 16.0, 32.0, 64.0, 128.0]
            .into_iter()
            .map(r64)
            .collect(),
        rpn_train_anchors_per_image: 64,
        pre_nms_limit: 300,
        post_nms_rois_training: 100,
        post_nms_rois_inference: 50,
        train_rois_per_image: 32,
        mask_shape: [14, 14],
        ..Default::default()
    }
}

fn training_input(config: &MimicConfig) -> Result<TrainingInput> {
    let [height, width] = config.image_hw();
    let batch_size = config.batch_size as i64;
    let anchors = PyramidAnchors::from_config(config)?;
    let builder = RpnTargetBuilder::from_config(config);
    let mut rng = StdRng::seed_from_u64(7);

    // the first image has one object, the second has none
    let gt_class_ids = [[1i64, 0], [0, 0]];
    let gt_boxes = [
        [[8f32, 12.0, 40.0, 36.0], [0.0; 4]],
        [[0.0; 4], [0.0; 4]],
    ];

    let (rpn_match, rpn_bbox): (Vec<_>, Vec<_>) = gt_class_ids
        .iter()
        .zip(&gt_boxes)
        .map(|(class_ids, boxes)| -> Result<_> {
            let rects: Vec<_> = boxes.iter().map(|&tlbr| TLBR::from_tlbr(tlbr)).collect();
            let targets =
                builder.build_rpn_targets(anchors.pixel_anchors(), class_ids, &rects, &mut rng)?;
            Ok(targets.to_tensors())
        })
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .unzip();

    let gt_masks = Tensor::zeros(&[batch_size, 2, height, width], (Kind::Float, Device::Cpu));
    let _ = gt_masks.get(0).get(0).narrow(0, 8, 32).narrow(1, 12, 24).fill_(1.0);

    let flat_boxes: Vec<f32> = gt_boxes.iter().flatten().flatten().copied().collect();

    let channels = config.image_shape[2];
    Ok(TrainingInput {
        images: Tensor::rand(
            &[batch_size, channels, height, width],
            (Kind::Float, Device::Cpu),
        ),
        image_metas: (0..batch_size)
            .map(|id| ImageMeta::unscaled(id, config.image_shape))
            .collect(),
        rpn_match: Tensor::stack(&rpn_match, 0),
        rpn_bbox: Tensor::stack(&rpn_bbox, 0),
        gt_class_ids: Tensor::of_slice(&gt_class_ids.concat()).view([batch_size, 2]),
        gt_boxes: Tensor::of_slice(&flat_boxes).view([batch_size, 2, 4]),
        gt_masks: Some(gt_masks),
    })
}

/// A batch where `boxes[i]` holds the class 1 pixel boxes of image `i`.
fn labeled_input(
    config: &MimicConfig,
    images: &Tensor,
    boxes: &[Vec<[f32; 4]>],
) -> Result<TrainingInput> {
    let batch_size = boxes.len() as i64;
    let max_gt = boxes.iter().map(Vec::len).max().unwrap_or(0).max(1);
    let anchors = PyramidAnchors::from_config(config)?;
    let builder = RpnTargetBuilder::from_config(config);
    let mut rng = StdRng::seed_from_u64(3);

    let mut class_ids = vec![];
    let mut flat_boxes = vec![];
    let mut rpn_match = vec![];
    let mut rpn_bbox = vec![];
    for image_boxes in boxes {
        let mut ids = vec![1i64; image_boxes.len()];
        let mut rects: Vec<_> = image_boxes.iter().map(|&tlbr| TLBR::from_tlbr(tlbr)).collect();
        ids.resize(max_gt, 0);
        rects.resize(max_gt, TLBR::from_tlbr([0.0; 4]));

        let (matches, deltas) = builder
            .build_rpn_targets(anchors.pixel_anchors(), &ids, &rects, &mut rng)?
            .to_tensors();
        rpn_match.push(matches);
        rpn_bbox.push(deltas);
        flat_boxes.extend(rects.iter().flat_map(|rect| rect.tlbr()));
        class_ids.extend(ids);
    }

    Ok(TrainingInput {
        images: images.shallow_clone(),
        image_metas: (0..batch_size)
            .map(|id| ImageMeta::unscaled(id, config.image_shape))
            .collect(),
        rpn_match: Tensor::stack(&rpn_match, 0),
        rpn_bbox: Tensor::stack(&rpn_bbox, 0),
        gt_class_ids: Tensor::of_slice(&class_ids).view([batch_size, max_gt as i64]),
        gt_boxes: Tensor::of_slice(&flat_boxes).view([batch_size, max_gt as i64, 4]),
        gt_masks: None,
    })
}

#[test]
fn training_step_produces_finite_losses() -> Result<()> {
    let config = small_config();
    let vs = nn::VarStore::new(Device::Cpu);
    let teacher = TeacherNetwork::new(
        config.teacher_backbone,
        config.image_shape[2] as usize,
        config.top_down_pyramid_size,
        Device::Cpu,
    )?;
    let model = MimicModelInit {
        config: config.clone(),
        mode: Mode::Training,
    }
    .build(&vs.root(), Some(teacher))?;

    let input = training_input(&config)?;
    let output = model.forward_train(&input)?;
    let losses = &output.losses;

    for loss in [
        &losses.rpn_class_loss,
        &losses.rpn_bbox_loss,
        &losses.rpn_mimic_loss,
        &losses.weight_decay,
        &losses.total_loss,
    ] {
        let value = f64::from(loss);
        assert!(value.is_finite() && value >= 0.0);
    }
    assert_eq!(output.proposals.size(), vec![2, 100, 4]);
    assert_eq!(output.targets.rois.size(), vec![2, 32, 4]);
    assert_eq!(
        output.targets.masks.as_ref().map(|masks| masks.size()),
        Some(vec![2, 32, 14, 14])
    );

    // the image without objects gets no targets
    assert_eq!(f64::from(output.targets.rois.get(1).abs().sum(Kind::Float)), 0.0);
    assert_eq!(
        i64::from(output.targets.class_ids.get(1).abs().sum(Kind::Int64)),
        0
    );

    losses.total_loss.backward();
    let teacher = model.teacher().expect("teacher is present in training mode");
    assert!(teacher
        .var_store()
        .variables()
        .values()
        .all(|var| !var.grad().defined()));
    assert!(vs
        .trainable_variables()
        .iter()
        .any(|var| var.grad().defined()));

    Ok(())
}

#[test]
fn inference_skips_the_teacher() -> Result<()> {
    let config = small_config();
    let vs = nn::VarStore::new(Device::Cpu);
    let model = MimicModelInit {
        config: config.clone(),
        mode: Mode::Inference,
    }
    .build(&vs.root(), None)?;
    assert!(model.teacher().is_none());

    let images = Tensor::rand(&[1, 3, 64, 64], (Kind::Float, Device::Cpu));
    let output = model.forward_inference(&images)?;
    assert_eq!(output.proposals.size(), vec![1, 50, 4]);
    assert!(model
        .forward_train(&training_input(&config)?)
        .is_err());
    Ok(())
}

#[test]
fn training_without_teacher_is_rejected() {
    let vs = nn::VarStore::new(Device::Cpu);
    let result = MimicModelInit {
        config: small_config(),
        mode: Mode::Training,
    }
    .build(&vs.root(), None);
    assert!(result.is_err());
}

#[test]
fn image_size_not_divisible_by_64_is_rejected() {
    let vs = nn::VarStore::new(Device::Cpu);
    let result = MimicModelInit {
        config: MimicConfig {
            image_shape: [250, 250, 3],
            ..small_config()
        },
        mode: Mode::Inference,
    }
    .build(&vs.root(), None);
    assert!(result.is_err());
}

#[test]
fn student_with_teacher_weights_mimics_perfectly() -> Result<()> {
    let config = MimicConfig {
        student_width_divisor: 1,
        batch_size: 1,
        image_shape: [256, 256, 3],
        ..small_config()
    };
    let teacher = TeacherNetwork::new(Architecture::ResNet50, 3, 32, Device::Cpu)?;
    let vs = nn::VarStore::new(Device::Cpu);
    let student = StudentNetwork::new(&vs.root(), &config, teacher.depth())?;

    // share backbone and pyramid weights, and make the transformer an identity
    copy_variables(&vs, teacher.var_store());
    make_transformer_identity(&vs, 32);

    let images = Tensor::rand(&[1, 3, 256, 256], (Kind::Float, Device::Cpu));
    let teacher_pyramid = teacher.forward(&images)?;
    let student_output = student.forward_t(&images, false)?;
    let transformed = student.transform(&student_output.pyramid, false);

    // four quadrants of the image
    let rois = Tensor::of_slice(&[
        0f32, 0.0, 0.5, 0.5, 0.0, 0.5, 0.5, 1.0, 0.5, 0.0, 1.0, 0.5, 0.5, 0.5, 1.0, 1.0,
    ])
    .view([1, 4, 4]);
    let loss_fn = MimicLossInit {
        batch_size: 1,
        rois_per_image: 4,
        backbone_strides: [4, 8, 16, 32],
    }
    .build()?;
    let output = loss_fn.forward(
        &refs(&transformed),
        &teacher_pyramid.mimic_levels(),
        &rois,
        &[ImageMeta::unscaled(0, config.image_shape)],
    )?;

    assert_eq!(output.level_counts.iter().sum::<usize>(), 4);
    assert!(f64::from(&output.loss).abs() < 1e-8);
    Ok(())
}

#[test]
fn mimic_loss_is_invariant_to_batch_order() -> Result<()> {
    let loss_fn = MimicLossInit {
        batch_size: 2,
        rois_per_image: 2,
        backbone_strides: [4, 8, 16, 32],
    }
    .build()?;
    let maps = |seed: i64| -> Vec<Tensor> {
        tch::manual_seed(seed);
        [16, 8, 4, 2]
            .iter()
            .map(|&size| Tensor::randn(&[2, 4, size, size], (Kind::Float, Device::Cpu)))
            .collect()
    };
    let student = maps(1);
    let teacher = maps(2);
    let rois = Tensor::of_slice(&[
        0f32, 0.0, 0.5, 0.5, 0.1, 0.2, 0.3, 0.9, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0,
    ])
    .view([2, 2, 4]);
    let metas = [
        ImageMeta::unscaled(0, [64, 64, 3]),
        ImageMeta::unscaled(1, [64, 64, 3]),
    ];

    let swap = Tensor::of_slice(&[1i64, 0]);
    let flip = |maps: &[Tensor]| -> Vec<Tensor> {
        maps.iter().map(|map| map.index_select(0, &swap)).collect()
    };

    let forward = loss_fn.forward(&refs(&student), &refs(&teacher), &rois, &metas)?;
    let (student_flip, teacher_flip) = (flip(&student), flip(&teacher));
    let backward = loss_fn.forward(
        &refs(&student_flip),
        &refs(&teacher_flip),
        &rois.index_select(0, &swap),
        &metas,
    )?;

    let (lhs, rhs) = (f64::from(&forward.loss), f64::from(&backward.loss));
    assert!(lhs > 0.0);
    assert!((lhs - rhs).abs() < 1e-5);
    Ok(())
}

#[test]
fn teacher_channels_must_match_images() -> Result<()> {
    let config = MimicConfig {
        image_shape: [64, 64, 1],
        ..small_config()
    };

    let vs = nn::VarStore::new(Device::Cpu);
    let teacher = TeacherNetwork::new(Architecture::ResNet50, 3, 32, Device::Cpu)?;
    let result = MimicModelInit {
        config: config.clone(),
        mode: Mode::Training,
    }
    .build(&vs.root(), Some(teacher));
    assert!(result.is_err());

    // a single channel teacher trains on single channel images
    let vs = nn::VarStore::new(Device::Cpu);
    let teacher = TeacherNetwork::new(Architecture::ResNet50, 1, 32, Device::Cpu)?;
    let model = MimicModelInit {
        config: config.clone(),
        mode: Mode::Training,
    }
    .build(&vs.root(), Some(teacher))?;
    let output = model.forward_train(&training_input(&config)?)?;
    assert!(f64::from(&output.losses.total_loss).is_finite());
    Ok(())
}

#[test]
fn identical_networks_mimic_perfectly_end_to_end() -> Result<()> {
    // every anchor becomes a proposal, so the anchor on the
    // top-left quadrant is always sampled as a positive ROI
    let config = MimicConfig {
        student_width_divisor: 1,
        batch_size: 1,
        train_bn: false,
        image_shape: [256, 256, 3],
        rpn_anchor_ratios: vec![r64(1.0)],
        pre_nms_limit: 10000,
        post_nms_rois_training: 6000,
        ..small_config()
    };
    let teacher = TeacherNetwork::new(Architecture::ResNet50, 3, 32, Device::Cpu)?;
    let vs = nn::VarStore::new(Device::Cpu);
    let model = MimicModelInit {
        config: config.clone(),
        mode: Mode::Training,
    }
    .build(&vs.root(), Some(teacher))?;

    let teacher = model.teacher().expect("teacher is present in training mode");
    copy_variables(&vs, teacher.var_store());
    make_transformer_identity(&vs, 32);
    zero_rpn_deltas(&vs);

    let images = Tensor::rand(&[1, 3, 256, 256], (Kind::Float, Device::Cpu));
    let input = labeled_input(&config, &images, &[vec![[0.0, 0.0, 128.0, 128.0]]])?;
    let output = model.forward_train(&input)?;

    assert!(output.mimic.level_counts.iter().sum::<usize>() > 0);
    assert!(f64::from(&output.losses.rpn_mimic_loss).abs() < 1e-8);
    Ok(())
}

#[test]
fn image_without_objects_adds_no_mimic_loss() -> Result<()> {
    let base = MimicConfig {
        train_bn: false,
        pre_nms_limit: 2000,
        post_nms_rois_training: 1100,
        ..small_config()
    };
    let build = |batch_size: usize| -> Result<(nn::VarStore, MimicModel)> {
        let config = MimicConfig {
            batch_size,
            ..base.clone()
        };
        let teacher = TeacherNetwork::new(Architecture::ResNet50, 3, 32, Device::Cpu)?;
        let vs = nn::VarStore::new(Device::Cpu);
        let model = MimicModelInit {
            config,
            mode: Mode::Training,
        }
        .build(&vs.root(), Some(teacher))?;
        Ok((vs, model))
    };

    // two models with the same weights, one per batch size
    let (single_vs, single) = build(1)?;
    let (pair_vs, pair) = build(2)?;
    zero_rpn_deltas(&single_vs);
    copy_variables(&single_vs, &pair_vs);
    copy_variables(
        single.teacher().expect("teacher is present").var_store(),
        pair.teacher().expect("teacher is present").var_store(),
    );

    let labeled = Tensor::rand(&[1, 3, 64, 64], (Kind::Float, Device::Cpu));
    let empty = Tensor::rand(&[1, 3, 64, 64], (Kind::Float, Device::Cpu));
    let boxes = vec![[0.0, 0.0, 32.0, 32.0]];

    let single_input = labeled_input(single.config(), &labeled, &[boxes.clone()])?;
    let pair_input = labeled_input(
        pair.config(),
        &Tensor::cat(&[&labeled, &empty], 0),
        &[boxes, vec![]],
    )?;

    tch::manual_seed(5);
    let single_output = single.forward_train(&single_input)?;
    tch::manual_seed(5);
    let pair_output = pair.forward_train(&pair_input)?;

    assert_eq!(single_output.mimic.level_counts, pair_output.mimic.level_counts);

    // undo the 2 x batch x rois normalization
    let rois = base.train_rois_per_image as f64;
    let single_total = f64::from(&single_output.losses.rpn_mimic_loss) * 2.0 * rois;
    let pair_total = f64::from(&pair_output.losses.rpn_mimic_loss) * 4.0 * rois;
    assert!(single_total > 0.0);
    assert!((single_total - pair_total).abs() <= 1e-5 * single_total);
    Ok(())
}
