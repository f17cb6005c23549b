use crate::{common::*, config::ValidationConfig, data::TrainingRecord};

/// Averaged losses of one evaluation.
#[derive(Debug)]
pub struct ValidationOutput {
    pub losses: MimicLosses,
    /// Mimicked regions per level, summed over the evaluated batches.
    pub level_counts: [usize; 4],
}

/// Evaluates the model on held-out batches every few training steps.
#[derive(Debug)]
pub struct Validator {
    data_rx: mpsc::Receiver<TrainingRecord>,
    steps: usize,
    interval_steps: usize,
    device: Device,
}

impl Validator {
    pub fn new(
        config: &ValidationConfig,
        data_rx: mpsc::Receiver<TrainingRecord>,
        device: Device,
    ) -> Self {
        Self {
            data_rx,
            steps: config.steps.get(),
            interval_steps: config.interval_steps.get(),
            device,
        }
    }

    pub fn is_due(&self, training_step: usize) -> bool {
        training_step % self.interval_steps == 0
    }

    /// Compute losses of the next `steps` batches without gradients.
    pub fn run(&mut self, model: &MimicModel) -> Result<ValidationOutput> {
        let mut steps = vec![];
        let mut level_counts = [0; 4];

        for _ in 0..self.steps {
            let record = self
                .data_rx
                .blocking_recv()
                .ok_or_else(|| format_err!("validation data is exhausted"))?;
            let TrainingRecord { input, .. } = record.to_device(self.device);
            let output = model.forward_validation(&input)?;

            for (sum, count) in level_counts.iter_mut().zip(output.mimic.level_counts) {
                *sum += count;
            }
            steps.push(output.losses);
        }

        Ok(ValidationOutput {
            losses: MimicLosses::mean(&steps)?,
            level_counts,
        })
    }
}
