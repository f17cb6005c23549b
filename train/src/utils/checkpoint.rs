use crate::{common::*, config::LoadCheckpoint};
use regex::Regex;

pub const FILE_STRFTIME: &str = "%Y-%m-%d-%H-%M-%S.%3f%z";

/// Checkpoint file name made of the save time, the step and the loss.
pub fn checkpoint_filename(time: &DateTime<Local>, training_step: usize, loss: f64) -> String {
    format!(
        "{}_{:06}_{:08.5}.ckpt",
        time.format(FILE_STRFTIME),
        training_step,
        loss
    )
}

/// Save student parameters to a checkpoint file.
pub fn save_checkpoint(
    vs: &nn::VarStore,
    checkpoint_dir: &Path,
    training_step: usize,
    loss: f64,
) -> Result<PathBuf> {
    let filename = checkpoint_filename(&Local::now(), training_step, loss);
    let path = checkpoint_dir.join(filename);
    vs.save(&path)?;
    Ok(path)
}

/// Pick the most recently saved checkpoint among the files.
pub fn most_recent_checkpoint<I>(paths: I) -> Result<Option<PathBuf>>
where
    I: IntoIterator<Item = PathBuf>,
{
    let checkpoint_filename_regex =
        Regex::new(r"^(\d{4}-\d{2}-\d{2}-\d{2}-\d{2}-\d{2}\.\d{3}[+-]\d{4})_\d{6}_\d+\.\d+\.ckpt$")?;

    let recent = paths
        .into_iter()
        .filter_map(|path| {
            let file_name = path.file_name()?.to_str()?;
            let captures = checkpoint_filename_regex.captures(file_name)?;
            let datetime_str = captures.get(1)?.as_str();
            let datetime = DateTime::parse_from_str(datetime_str, FILE_STRFTIME).ok()?;
            Some((path, datetime))
        })
        .max_by_key(|(_path, datetime)| *datetime)
        .map(|(path, _datetime)| path);

    Ok(recent)
}

/// Load parameters from a diretory with specified checkpoint loading method.
///
/// Returns the loaded file if any.
pub fn try_load_checkpoint(
    vs: &mut nn::VarStore,
    logging_dir: &Path,
    load_checkpoint: &LoadCheckpoint,
) -> Result<Option<PathBuf>> {
    let path = match load_checkpoint {
        LoadCheckpoint::Disabled => {
            info!("checkpoint loading is disabled");
            None
        }
        LoadCheckpoint::FromRecent => {
            let paths: Vec<_> =
                glob::glob(&format!("{}/*/checkpoints/*.ckpt", logging_dir.display()))?
                    .try_collect()?;
            let checkpoint_file = most_recent_checkpoint(paths)?;

            if checkpoint_file.is_none() {
                warn!("no checkpoint file found");
            }

            checkpoint_file
        }
        LoadCheckpoint::FromFile { file } => {
            if file.is_file() {
                Some(file.to_owned())
            } else {
                warn!("{} is not a file", file.display());
                None
            }
        }
    };

    if let Some(path) = &path {
        info!("load checkpoint file {}", path.display());
        let missing = vs.load_partial(path)?;
        if !missing.is_empty() {
            warn!("{} variables are missing in the checkpoint", missing.len());
        }
    }

    Ok(path)
}
