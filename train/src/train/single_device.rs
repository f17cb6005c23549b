use crate::{
    common::*,
    config::{Config, LoadCheckpoint, TrainingConfig},
    data::TrainingRecord,
    logging::{LoggingMessage, TrainingOutputLog},
    train::{ValidationOutput, Validator},
    utils::{self, LrScheduler, RateCounter},
};

/// Start the training worker on a single device.
///
/// The teacher is loaded from its weights file and frozen. Only the
/// student variable store is optimized and saved. Validation batches, if
/// any, are evaluated every `interval_steps` and logged under the
/// `validation` tag.
pub fn single_device_training_worker(
    config: Arc<Config>,
    checkpoint_dir: Arc<Path>,
    mut data_rx: mpsc::Receiver<TrainingRecord>,
    validation_rx: Option<mpsc::Receiver<TrainingRecord>>,
    logging_tx: broadcast::Sender<LoggingMessage>,
) -> Result<()> {
    let Config {
        model: ref model_config,
        ref teacher,
        ref dataset,
        training:
            TrainingConfig {
                override_initial_step,
                ref lr_schedule,
                momentum,
                clip_grad_norm,
                save_checkpoint_steps,
                ref load_checkpoint,
                device,
                ..
            },
        ..
    } = *config;
    info!("use single device {:?}", device);

    // init model
    info!("initializing model");
    const DUMMY_LR: f64 = 1.0;

    let mut teacher_network = TeacherNetwork::new(
        model_config.teacher_backbone,
        model_config.image_shape[2] as usize,
        model_config.top_down_pyramid_size,
        device,
    )?;
    teacher_network.load(&teacher.weights_file)?;

    let mut vs = nn::VarStore::new(device);
    let root = vs.root();
    let model = MimicModelInit {
        config: model_config.clone(),
        mode: Mode::Training,
    }
    .build(&root / "student", Some(teacher_network))?;
    let mut training_step_tensor = root.zeros_no_train("training_step", &[]);

    // weight decay is part of the loss
    let mut optimizer = nn::Sgd {
        momentum: momentum.raw(),
        dampening: 0.0,
        wd: 0.0,
        nesterov: false,
    }
    .build(&vs, DUMMY_LR)?;

    let save_checkpoint_steps = save_checkpoint_steps.map(|steps| steps.get());
    let mut validator = match (&dataset.validation, validation_rx) {
        (Some(validation), Some(rx)) => Some(Validator::new(validation, rx, device)),
        _ => None,
    };

    // load checkpoint
    let init_training_step = {
        utils::try_load_checkpoint(&mut vs, &config.logging.dir, load_checkpoint)?;

        match override_initial_step {
            Some(init_step) => {
                tch::no_grad(|| training_step_tensor.copy_(&Tensor::from(init_step as f32)));
                init_step
            }
            None => match load_checkpoint {
                LoadCheckpoint::Disabled => 0,
                _ => f32::from(&training_step_tensor) as usize + 1,
            },
        }
    };

    // training
    info!("start training");
    let mut training_step = init_training_step;
    let mut rate_counter = RateCounter::with_second_interval();
    let mut lr_scheduler = LrScheduler::new(lr_schedule, init_training_step)?;
    let mut last_loss = None;
    optimizer.set_lr(lr_scheduler.next());

    while let Some(record) = data_rx.blocking_recv() {
        let TrainingRecord {
            epoch,
            step: _record_step,
            input,
        } = record.to_device(device);

        let output = model.forward_train(&input)?;
        let losses = output.losses;
        let total_loss = f64::from(&losses.total_loss);
        ensure!(
            total_loss.is_finite(),
            "the loss becomes {} at step {}",
            total_loss,
            training_step
        );
        last_loss = Some(total_loss);

        match clip_grad_norm {
            Some(max_norm) => {
                optimizer.backward_step_clip_norm(&losses.total_loss, max_norm.raw())
            }
            None => optimizer.backward_step(&losses.total_loss),
        }

        // print message
        rate_counter.add(1.0);
        let rate_msg = match rate_counter.rate() {
            Some(batch_rate) => format!("\t{:.2} batches/s", batch_rate),
            None => String::new(),
        };
        info!(
            "epoch: {}\tstep: {}\tlr: {:.5}\tloss: {:.5}{}",
            epoch,
            training_step,
            lr_scheduler.lr(),
            total_loss,
            rate_msg
        );

        // save checkpoint
        if let Some(0) = save_checkpoint_steps.map(|steps| training_step % steps) {
            let path = utils::save_checkpoint(&vs, &checkpoint_dir, training_step, total_loss)?;
            info!("checkpoint saved to {}", path.display());
        }

        // send to logger
        logging_tx
            .send(LoggingMessage::new_training_output(
                "training-output",
                TrainingOutputLog {
                    step: training_step,
                    lr: r64(lr_scheduler.lr()),
                    losses: losses.shallow_clone(),
                    level_counts: output.mimic.level_counts,
                },
            ))
            .map_err(|_err| format_err!("cannot send message to logger"))?;

        // evaluate held-out batches
        if let Some(validator) = validator.as_mut().filter(|val| val.is_due(training_step)) {
            let ValidationOutput {
                losses,
                level_counts,
            } = validator.run(&model)?;
            info!(
                "step: {}\tvalidation loss: {:.5}",
                training_step,
                f64::from(&losses.total_loss)
            );

            logging_tx
                .send(LoggingMessage::new_training_output(
                    "validation",
                    TrainingOutputLog {
                        step: training_step,
                        lr: r64(lr_scheduler.lr()),
                        losses,
                        level_counts,
                    },
                ))
                .map_err(|_err| format_err!("cannot send message to logger"))?;
        }

        // update lr
        optimizer.set_lr(lr_scheduler.next());

        // update training step
        training_step += 1;
        tch::no_grad(|| training_step_tensor.copy_(&Tensor::from(training_step as f32)));
    }

    info!("training data is exhausted");
    if let Some(loss) = last_loss {
        let path = utils::save_checkpoint(&vs, &checkpoint_dir, training_step, loss)?;
        info!("final checkpoint saved to {}", path.display());
    }

    Ok(())
}
