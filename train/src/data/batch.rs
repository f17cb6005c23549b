use super::{resize_image, transform_box, CsvDataset, ImageRecord, ResizedImage};
use crate::{common::*, config::DatasetConfig};

/// The record that is accepted by training worker.
#[derive(Debug, TensorLike)]
pub struct TrainingRecord {
    pub epoch: usize,
    pub step: usize,
    pub input: TrainingInput,
}

/// One image ready to be batched.
#[derive(Debug)]
pub struct PreparedImage {
    pub image: Tensor,
    pub meta: ImageMeta,
    /// Class ids of kept boxes, negative for crowds.
    pub class_ids: Vec<i64>,
    /// Boxes in network input pixels.
    pub boxes: Vec<TLBR<f32>>,
    /// `[num_anchors]`
    pub rpn_match: Tensor,
    /// `[rpn_train_anchors_per_image, 4]`
    pub rpn_bbox: Tensor,
}

/// Turns image records into training inputs.
#[derive(Debug)]
pub struct BatchBuilder {
    image_shape: [i64; 3],
    mean_pixel: [f64; 3],
    max_gt_instances: usize,
    anchors: PyramidAnchors,
    rpn_targets: RpnTargetBuilder,
}

impl BatchBuilder {
    pub fn new(model: &MimicConfig, dataset: &DatasetConfig) -> Result<Self> {
        ensure!(
            dataset.max_gt_instances > 0,
            "max_gt_instances must be positive"
        );
        Ok(Self {
            image_shape: model.image_shape,
            mean_pixel: dataset.mean_pixel.map(|value| value.raw()),
            max_gt_instances: dataset.max_gt_instances,
            anchors: PyramidAnchors::from_config(model)?,
            rpn_targets: RpnTargetBuilder::from_config(model),
        })
    }

    /// Load the image file of the record and prepare it.
    pub fn load_image<R>(&self, record: &ImageRecord, rng: &mut R) -> Result<PreparedImage>
    where
        R: Rng,
    {
        let image = vision::image::load(&record.path)
            .with_context(|| format!("unable to load image '{}'", record.path.display()))?;
        self.prepare_image(record, &image, rng)
    }

    /// Resize a `[channels, height, width]` u8 image and label its anchors.
    ///
    /// Boxes vanishing after resizing are dropped, and at most
    /// `max_gt_instances` boxes are kept at random.
    pub fn prepare_image<R>(
        &self,
        record: &ImageRecord,
        image: &Tensor,
        rng: &mut R,
    ) -> Result<PreparedImage>
    where
        R: Rng,
    {
        let ResizedImage { image, meta } =
            resize_image(record.image_id, image, self.image_shape, self.mean_pixel)?;

        let mut labels: Vec<_> = record
            .boxes
            .iter()
            .map(|label| (label.class_id, transform_box(&label.tlbr, &meta)))
            .filter(|(_, tlbr)| !tlbr.is_degenerate())
            .collect();
        if labels.len() > self.max_gt_instances {
            labels = labels
                .choose_multiple(rng, self.max_gt_instances)
                .copied()
                .collect();
        }
        let (class_ids, boxes): (Vec<_>, Vec<_>) = labels.into_iter().unzip();

        let (rpn_match, rpn_bbox) = self
            .rpn_targets
            .build_rpn_targets(self.anchors.pixel_anchors(), &class_ids, &boxes, rng)?
            .to_tensors();

        Ok(PreparedImage {
            image,
            meta,
            class_ids,
            boxes,
            rpn_match,
            rpn_bbox,
        })
    }

    /// Stack prepared images, padding ground truth with class id 0.
    pub fn collate(&self, images: Vec<PreparedImage>) -> Result<TrainingInput> {
        ensure!(!images.is_empty(), "cannot collate an empty batch");
        let batch_size = images.len() as i64;
        let max_gt = images
            .iter()
            .map(|image| image.class_ids.len())
            .max()
            .unwrap_or(0)
            .max(1);

        let mut class_ids = vec![0i64; images.len() * max_gt];
        let mut boxes = vec![0f32; images.len() * max_gt * 4];
        for (index, image) in images.iter().enumerate() {
            let offset = index * max_gt;
            class_ids[offset..(offset + image.class_ids.len())].copy_from_slice(&image.class_ids);
            for (slot, rect) in image.boxes.iter().enumerate() {
                let begin = (offset + slot) * 4;
                boxes[begin..(begin + 4)].copy_from_slice(&rect.tlbr());
            }
        }

        let mut image_tensors = vec![];
        let mut image_metas = vec![];
        let mut rpn_match = vec![];
        let mut rpn_bbox = vec![];
        for prepared in images {
            image_tensors.push(prepared.image);
            image_metas.push(prepared.meta);
            rpn_match.push(prepared.rpn_match);
            rpn_bbox.push(prepared.rpn_bbox);
        }

        Ok(TrainingInput {
            images: Tensor::f_stack(&image_tensors, 0)?,
            image_metas,
            rpn_match: Tensor::f_stack(&rpn_match, 0)?,
            rpn_bbox: Tensor::f_stack(&rpn_bbox, 0)?,
            gt_class_ids: Tensor::of_slice(&class_ids).view([batch_size, max_gt as i64]),
            gt_boxes: Tensor::of_slice(&boxes).view([batch_size, max_gt as i64, 4]),
            gt_masks: None,
        })
    }
}

/// Feed batches to a worker until the epochs run out or the receiver is
/// dropped.
///
/// Images are visited in file order unless `shuffle` is set.
pub async fn produce_batches(
    dataset: Arc<CsvDataset>,
    builder: Arc<BatchBuilder>,
    batch_size: usize,
    epochs: Option<usize>,
    shuffle: bool,
    seed: u64,
    data_tx: mpsc::Sender<TrainingRecord>,
) -> Result<()> {
    let num_records = dataset.records.len();
    ensure!(
        num_records >= batch_size,
        "the dataset has {} images, fewer than the batch size {}",
        num_records,
        batch_size
    );

    let mut rng = StdRng::seed_from_u64(seed);
    let mut step = 0;
    let epochs: Box<dyn Iterator<Item = usize> + Send> = match epochs {
        Some(epochs) => Box::new(0..epochs),
        None => Box::new(0..),
    };

    for epoch in epochs {
        let mut order: Vec<usize> = (0..num_records).collect();
        if shuffle {
            order.shuffle(&mut rng);
        }

        // the last incomplete batch is dropped
        for chunk in order.chunks_exact(batch_size) {
            let records: Vec<_> = chunk
                .iter()
                .map(|&index| dataset.records[index].clone())
                .collect();
            let builder = builder.clone();
            let batch_seed: u64 = rng.gen();

            let input = tokio::task::spawn_blocking(move || -> Result<_> {
                let mut rng = StdRng::seed_from_u64(batch_seed);
                let images: Vec<_> = records
                    .iter()
                    .map(|record| builder.load_image(record, &mut rng))
                    .try_collect()?;
                builder.collate(images)
            })
            .await??;

            let record = TrainingRecord { epoch, step, input };
            if data_tx.send(record).await.is_err() {
                info!("batch receiver is closed");
                return Ok(());
            }
            step += 1;
        }
    }

    info!("all epochs are produced");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::LabeledBox;

    fn dataset_config() -> DatasetConfig {
        DatasetConfig {
            image_dir: PathBuf::from("images"),
            label_file: PathBuf::from("label.csv"),
            classes_file: PathBuf::from("classes.txt"),
            mean_pixel: [r64(0.0); 3],
            max_gt_instances: 2,
            seed: 0,
            validation: None,
        }
    }

    fn model_config() -> MimicConfig {
        MimicConfig {
            batch_size: 2,
            image_shape: [64, 64, 3],
            rpn_anchor_scales: [8.0, 16.0, 32.0, 64.0, 128.0]
                .into_iter()
                .map(r64)
                .collect(),
            rpn_train_anchors_per_image: 32,
            ..Default::default()
        }
    }

    #[test]
    fn batch_pads_ground_truth() -> Result<()> {
        let model = model_config();
        let builder = BatchBuilder::new(&model, &dataset_config())?;
        let mut rng = StdRng::seed_from_u64(3);
        let image = Tensor::zeros(&[3, 32, 32], (Kind::Uint8, Device::Cpu));

        let labeled = ImageRecord {
            image_id: 0,
            path: PathBuf::from("a.jpg"),
            boxes: vec![
                LabeledBox {
                    class_id: 1,
                    tlbr: TLBR::from_tlbr([0.0, 0.0, 16.0, 16.0]),
                },
                LabeledBox {
                    class_id: 2,
                    tlbr: TLBR::from_tlbr([8.0, 8.0, 8.0, 20.0]),
                },
            ],
        };
        let empty = ImageRecord {
            image_id: 1,
            path: PathBuf::from("b.jpg"),
            boxes: vec![],
        };

        let images = vec![
            builder.prepare_image(&labeled, &image, &mut rng)?,
            builder.prepare_image(&empty, &image, &mut rng)?,
        ];
        // the zero-height box is dropped
        assert_eq!(images[0].class_ids, vec![1]);
        assert_eq!(images[0].boxes[0].tlbr(), [0.0, 0.0, 32.0, 32.0]);

        let input = builder.collate(images)?;
        let num_anchors = PyramidAnchors::from_config(&model)?.len() as i64;
        assert_eq!(input.images.size(), vec![2, 3, 64, 64]);
        assert_eq!(input.rpn_match.size(), vec![2, num_anchors]);
        assert_eq!(input.rpn_bbox.size(), vec![2, 32, 4]);
        assert_eq!(Vec::<i64>::from(&input.gt_class_ids.view([-1])), vec![1, 0]);
        assert_eq!(input.gt_boxes.size(), vec![2, 1, 4]);
        assert_eq!(input.image_metas[1].image_id, 1);
        assert!(input.gt_masks.is_none());

        // the image without boxes has no positive anchors
        assert_eq!(
            i64::from(&input.rpn_match.get(1).eq(1).sum(Kind::Int64)),
            0
        );
        Ok(())
    }
}
