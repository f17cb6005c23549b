//! Data logging toolkit.

use crate::{
    common::*,
    config::{Config, LoggingConfig},
    utils::RateCounter,
};
use async_std::{fs::File, io::BufWriter};

pub use logging_message::*;
pub use logging_worker::*;

mod logging_worker {
    use super::*;

    /// The data logging worker.
    #[derive(Debug)]
    pub struct LoggingWorker {
        config: Arc<Config>,
        event_writer: EventWriter<BufWriter<File>>,
        rate_counter: RateCounter,
        rx: broadcast::Receiver<LoggingMessage>,
    }

    impl LoggingWorker {
        /// Create a data logging worker.
        async fn new(
            config: Arc<Config>,
            logging_dir: Arc<Path>,
            rx: broadcast::Receiver<LoggingMessage>,
        ) -> Result<Self> {
            // prepare dirs
            let event_dir = logging_dir.join("events");
            let event_path_prefix = event_dir
                .join("mimic-rcnn")
                .into_os_string()
                .into_string()
                .map_err(|path| format_err!("non-UTF-8 event path {:?}", path))?;

            tokio::fs::create_dir_all(&event_dir).await?;

            let event_writer = EventWriterInit::default()
                .from_prefix_async(event_path_prefix, None)
                .await?;
            let rate_counter = RateCounter::with_second_interval();

            Ok(Self {
                config,
                event_writer,
                rate_counter,
                rx,
            })
        }

        /// Start the data logging worker.
        async fn start(mut self) -> Result<()> {
            loop {
                let LoggingMessage { tag, kind } = match self.rx.recv().await {
                    Ok(msg) => msg,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("logger skipped {} messages", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                self.rate_counter.add(1.0);

                match kind {
                    LoggingMessageKind::TrainingOutput(msg) => {
                        self.log_training_output(&tag, msg).await?;
                    }
                }

                if let Some(rate) = self.rate_counter.rate() {
                    info!("processed {:.2} events/s", rate);
                }
            }

            Ok(())
        }

        async fn log_training_output(&mut self, tag: &str, msg: TrainingOutputLog) -> Result<()> {
            let LoggingConfig {
                enable_level_stat, ..
            } = self.config.logging;
            let TrainingOutputLog {
                step,
                lr,
                losses,
                level_counts,
            } = msg;
            let step = step as i64;

            let scalars: Vec<(String, f32)> = {
                let MimicLosses {
                    rpn_class_loss,
                    rpn_bbox_loss,
                    rpn_mimic_loss,
                    weighted_rpn_class_loss,
                    weighted_rpn_bbox_loss,
                    weighted_rpn_mimic_loss,
                    weight_decay,
                    total_loss,
                } = losses;

                let losses = [
                    ("rpn_class_loss", rpn_class_loss),
                    ("rpn_bbox_loss", rpn_bbox_loss),
                    ("rpn_mimic_loss", rpn_mimic_loss),
                    ("weighted_rpn_class_loss", weighted_rpn_class_loss),
                    ("weighted_rpn_bbox_loss", weighted_rpn_bbox_loss),
                    ("weighted_rpn_mimic_loss", weighted_rpn_mimic_loss),
                    ("weight_decay", weight_decay),
                    ("total_loss", total_loss),
                ]
                .into_iter()
                .map(|(name, loss)| (format!("{}/loss/{}", tag, name), f32::from(&loss)));

                let params = iter::once((format!("{}/params/learning_rate", tag), lr.raw() as f32));

                let levels = level_counts
                    .into_iter()
                    .enumerate()
                    .filter(|_| enable_level_stat)
                    .map(|(index, count)| {
                        (format!("{}/stat/mimic_rois_p{}", tag, index + 2), count as f32)
                    });

                params.chain(losses).chain(levels).collect()
            };

            for (name, value) in scalars {
                self.event_writer
                    .write_scalar_async(name, step, value)
                    .await?;
            }

            Ok(())
        }
    }

    /// Run the logging worker until all senders are dropped.
    pub async fn logging_worker(
        config: Arc<Config>,
        logging_dir: Arc<Path>,
        rx: broadcast::Receiver<LoggingMessage>,
    ) -> Result<()> {
        LoggingWorker::new(config, logging_dir, rx)
            .await?
            .start()
            .await
    }
}

mod logging_message {
    use super::*;

    /// The message type that is accepted by the data logger.
    #[derive(Debug, Clone)]
    pub struct LoggingMessage {
        pub tag: Cow<'static, str>,
        pub kind: LoggingMessageKind,
    }

    impl LoggingMessage {
        pub fn new_training_output<S>(tag: S, msg: TrainingOutputLog) -> Self
        where
            S: Into<Cow<'static, str>>,
        {
            Self {
                tag: tag.into(),
                kind: LoggingMessageKind::TrainingOutput(msg),
            }
        }
    }

    #[derive(Debug, TensorLike)]
    pub enum LoggingMessageKind {
        TrainingOutput(TrainingOutputLog),
    }

    impl Clone for LoggingMessageKind {
        fn clone(&self) -> Self {
            self.shallow_clone()
        }
    }

    /// Losses of one training step.
    #[derive(Debug, TensorLike)]
    pub struct TrainingOutputLog {
        pub step: usize,
        #[tensor_like(clone)]
        pub lr: R64,
        pub losses: MimicLosses,
        #[tensor_like(copy)]
        pub level_counts: [usize; 4],
    }

    impl Clone for TrainingOutputLog {
        fn clone(&self) -> Self {
            self.shallow_clone()
        }
    }
}
