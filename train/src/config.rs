//! Training program configuration format.

use crate::common::*;

pub use dataset::*;
pub use training::*;

/// The main training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Network and loss options shared by the teacher and the student.
    pub model: MimicConfig,
    pub teacher: TeacherConfig,
    pub dataset: DatasetConfig,
    pub logging: LoggingConfig,
    pub training: TrainingConfig,
}

impl Config {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let text = std::fs::read_to_string(path)?;
        let config: Self = json5::from_str(&text)?;
        config.model.validate()?;
        Ok(config)
    }
}

/// The frozen teacher options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeacherConfig {
    /// Pretrained teacher weights. Variables are matched by name.
    pub weights_file: PathBuf,
}

/// Data logging options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub dir: PathBuf,
    /// Log the number of mimicked regions per pyramid level.
    #[serde(default)]
    pub enable_level_stat: bool,
}

mod dataset {
    use super::*;

    /// CSV dataset options.
    ///
    /// Each label row holds `image_file`, `class_name` and a pixel box
    /// `t`, `l`, `b`, `r`, with an optional `crowd` flag.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct DatasetConfig {
        pub image_dir: PathBuf,
        pub label_file: PathBuf,
        pub classes_file: PathBuf,
        /// Per-channel mean subtracted from RGB pixels.
        #[serde(default = "default_mean_pixel")]
        pub mean_pixel: [R64; 3],
        /// Ground truth boxes kept per image.
        #[serde(default = "default_max_gt_instances")]
        pub max_gt_instances: usize,
        /// Seed of image shuffling and anchor sampling.
        #[serde(default)]
        pub seed: u64,
        /// Held-out images evaluated during training.
        #[serde(default)]
        pub validation: Option<ValidationConfig>,
    }

    impl DatasetConfig {
        /// The validation dataset options, sharing classes and preprocessing
        /// with the training set.
        pub fn validation_dataset(&self) -> Option<DatasetConfig> {
            let ValidationConfig {
                image_dir,
                label_file,
                ..
            } = self.validation.as_ref()?;
            Some(DatasetConfig {
                image_dir: image_dir.clone(),
                label_file: label_file.clone(),
                validation: None,
                ..self.clone()
            })
        }
    }

    /// Periodic loss evaluation on a held-out CSV dataset.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ValidationConfig {
        pub image_dir: PathBuf,
        pub label_file: PathBuf,
        /// Number of batches averaged per evaluation.
        pub steps: NonZeroUsize,
        /// Evaluate once per this number of training steps.
        pub interval_steps: NonZeroUsize,
    }

    fn default_mean_pixel() -> [R64; 3] {
        [r64(123.7), r64(116.8), r64(103.9)]
    }

    fn default_max_gt_instances() -> usize {
        100
    }
}

mod training {
    use super::*;

    /// The training options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct TrainingConfig {
        /// If enabled, it overrides the initial training step.
        pub override_initial_step: Option<usize>,
        /// Learning rate scheduling strategy.
        pub lr_schedule: LearningRateSchedule,
        /// The momentum parameter for optimizer.
        pub momentum: R64,
        /// Gradients are rescaled when their global norm exceeds this value.
        pub clip_grad_norm: Option<R64>,
        /// Stop after this number of epochs if set.
        pub epochs: Option<NonZeroUsize>,
        /// If set, it saves a checkpoint file per this steps.
        pub save_checkpoint_steps: Option<NonZeroUsize>,
        /// Checkpoint file loading method.
        pub load_checkpoint: LoadCheckpoint,
        /// The training device, CPU by default.
        #[serde(with = "tch_serde::serde_device", default = "default_device")]
        pub device: Device,
    }

    fn default_device() -> Device {
        Device::Cpu
    }

    /// The learning rate scheduling strategy.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum LearningRateSchedule {
        /// Use constant learning rate.
        Constant { lr: R64 },
        /// Use specific learning rate at specified steps.
        StepWise { steps: Vec<(usize, R64)> },
    }

    /// Checkpoint file loading method.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum LoadCheckpoint {
        /// Disable checkpoint file loading.
        Disabled,
        /// Load the most recent checkpoint file.
        FromRecent,
        /// Load the checkpoint file at specified path.
        FromFile { file: PathBuf },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_json5_config() -> Result<()> {
        let text = r#"{
            model: {
                batch_size: 1,
                image_shape: [512, 512, 3],
            },
            teacher: { weights_file: "teacher.ot" },
            dataset: {
                image_dir: "images",
                label_file: "label.csv",
                classes_file: "classes.txt",
            },
            logging: { dir: "logs" },
            training: {
                lr_schedule: { type: "Constant", lr: 0.001 },
                momentum: 0.9,
                clip_grad_norm: 5.0,
                load_checkpoint: { type: "Disabled" },
            },
        }"#;
        let config: Config = json5::from_str(text)?;
        config.model.validate()?;

        assert_eq!(config.model.image_shape, [512, 512, 3]);
        assert_eq!(config.model.batch_size, 1);
        assert_eq!(config.dataset.max_gt_instances, 100);
        assert_eq!(config.training.device, Device::Cpu);
        assert!(matches!(
            config.training.load_checkpoint,
            LoadCheckpoint::Disabled
        ));
        Ok(())
    }

    #[test]
    fn validation_shares_training_classes() -> Result<()> {
        let text = r#"{
            image_dir: "train",
            label_file: "train.csv",
            classes_file: "classes.txt",
            seed: 5,
            validation: {
                image_dir: "val",
                label_file: "val.csv",
                steps: 4,
                interval_steps: 100,
            },
        }"#;
        let config: DatasetConfig = json5::from_str(text)?;
        let validation = config.validation.as_ref().expect("validation is configured");
        assert_eq!(validation.steps.get(), 4);
        assert_eq!(validation.interval_steps.get(), 100);

        let dataset = config.validation_dataset().expect("validation is configured");
        assert_eq!(dataset.image_dir, PathBuf::from("val"));
        assert_eq!(dataset.label_file, PathBuf::from("val.csv"));
        assert_eq!(dataset.classes_file, PathBuf::from("classes.txt"));
        assert_eq!(dataset.seed, 5);
        assert!(dataset.validation.is_none());

        let text = r#"{ image_dir: "train", label_file: "train.csv", classes_file: "classes.txt" }"#;
        let config: DatasetConfig = json5::from_str(text)?;
        assert!(config.validation_dataset().is_none());
        Ok(())
    }
}
