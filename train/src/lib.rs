//! The training program of the mimic detector.

pub mod common;
pub mod config;
pub mod data;
pub mod logging;
pub mod train;
pub mod utils;

use crate::{
    common::*,
    data::{BatchBuilder, CsvDataset},
};

/// The entry of training program.
pub async fn start(config: Arc<config::Config>) -> Result<()> {
    let start_time = Local::now();
    let logging_dir: Arc<Path> = {
        let dir = config
            .logging
            .dir
            .join(format!("{}", start_time.format(utils::FILE_STRFTIME)));
        dir.into_boxed_path().into()
    };
    let checkpoint_dir: Arc<Path> = logging_dir.join("checkpoints").into_boxed_path().into();

    // create dirs and save config
    {
        tokio::fs::create_dir_all(&*logging_dir).await?;
        tokio::fs::create_dir_all(&*checkpoint_dir).await?;
        let path = logging_dir.join("config.json5");
        let text = serde_json::to_string_pretty(&*config)?;
        tokio::fs::write(&path, text).await?;
    }

    // create channels
    let (logging_tx, logging_rx) = broadcast::channel(2);
    let (data_tx, data_rx) = mpsc::channel(2);

    // load dataset
    info!("loading dataset");
    let dataset = Arc::new(CsvDataset::load(&config.dataset).await?);
    let builder = Arc::new(BatchBuilder::new(&config.model, &config.dataset)?);

    // start logger
    let logging_future = logging::logging_worker(config.clone(), logging_dir.clone(), logging_rx);

    // feeding worker
    let training_data_future = tokio::task::spawn(data::produce_batches(
        dataset,
        builder.clone(),
        config.model.batch_size,
        config.training.epochs.map(|epochs| epochs.get()),
        true,
        config.dataset.seed,
        data_tx,
    ))
    .map(|result| Fallible::Ok(result??));

    // validation batches cycle in file order until the worker stops
    let (validation_rx, validation_data_future) = match config.dataset.validation_dataset() {
        Some(dataset_config) => {
            let dataset = Arc::new(CsvDataset::load(&dataset_config).await?);
            let (tx, rx) = mpsc::channel(2);
            let future = tokio::task::spawn(data::produce_batches(
                dataset,
                builder.clone(),
                config.model.batch_size,
                None,
                false,
                config.dataset.seed,
                tx,
            ))
            .map(|result| Fallible::Ok(result??))
            .boxed();
            (Some(rx), future)
        }
        None => (None, future::ok::<_, Error>(()).boxed()),
    };

    // training worker
    let training_worker_future = {
        let config = config.clone();
        tokio::task::spawn_blocking(move || {
            train::single_device_training_worker(
                config,
                checkpoint_dir,
                data_rx,
                validation_rx,
                logging_tx,
            )
        })
        .map(|result| Fallible::Ok(result??))
    };

    futures::try_join!(
        training_data_future,
        validation_data_future,
        training_worker_future,
        logging_future
    )?;

    Ok(())
}
