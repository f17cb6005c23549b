use crate::{common::*, config::DatasetConfig};

/// A labelled box of an image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabeledBox {
    /// One-based class index, negated for crowd regions.
    pub class_id: i64,
    /// Box in source image pixels.
    pub tlbr: TLBR<f32>,
}

/// An image file with its boxes.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    pub image_id: i64,
    pub path: PathBuf,
    pub boxes: Vec<LabeledBox>,
}

/// A row of the label file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CsvSample {
    pub image_file: PathBuf,
    pub class_name: String,
    pub t: R64,
    pub l: R64,
    pub b: R64,
    pub r: R64,
    #[serde(default)]
    pub crowd: bool,
}

/// Images and boxes listed in a CSV label file.
#[derive(Debug, Clone)]
pub struct CsvDataset {
    pub classes: IndexSet<String>,
    pub records: Vec<ImageRecord>,
}

impl CsvDataset {
    pub async fn load(config: &DatasetConfig) -> Result<Self> {
        let DatasetConfig {
            ref image_dir,
            ref label_file,
            ref classes_file,
            ..
        } = *config;

        let classes = load_classes_file(classes_file).await?;
        let samples = {
            let image_dir = image_dir.to_owned();
            let label_file = label_file.to_owned();
            tokio::task::spawn_blocking(move || load_csv_samples(image_dir, label_file)).await??
        };
        let records = group_samples(&classes, samples)?;
        info!(
            "loaded {} images with {} classes from {}",
            records.len(),
            classes.len(),
            label_file.display()
        );

        Ok(Self { classes, records })
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }
}

pub async fn load_classes_file(path: impl AsRef<Path>) -> Result<IndexSet<String>> {
    let path = path.as_ref();
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("unable to read '{}'", path.display()))?;
    let lines: Vec<_> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    let classes: IndexSet<_> = lines.iter().map(|&line| line.to_owned()).collect();
    ensure!(
        lines.len() == classes.len(),
        "duplicated class names found in '{}'",
        path.display()
    );
    ensure!(
        !classes.is_empty(),
        "no classes found in '{}'",
        path.display()
    );
    Ok(classes)
}

pub fn load_csv_samples(
    image_dir: impl AsRef<Path>,
    label_file: impl AsRef<Path>,
) -> Result<Vec<CsvSample>> {
    let image_dir = image_dir.as_ref();
    let label_file = label_file.as_ref();

    let samples: Vec<CsvSample> = csv::ReaderBuilder::new()
        .has_headers(true)
        .comment(Some(b'#'))
        .from_path(label_file)?
        .deserialize()
        .try_collect()?;

    samples
        .into_iter()
        .map(|sample| {
            let image_file = image_dir.join(&sample.image_file);
            ensure!(
                image_file.is_file(),
                "the image file '{}' does not exist",
                image_file.display()
            );
            Ok(CsvSample {
                image_file,
                ..sample
            })
        })
        .try_collect()
}

/// Group rows by image file, keeping the file order of first appearance.
pub fn group_samples(classes: &IndexSet<String>, samples: Vec<CsvSample>) -> Result<Vec<ImageRecord>> {
    let mut groups: IndexMap<PathBuf, Vec<LabeledBox>> = IndexMap::new();

    for sample in samples {
        let CsvSample {
            image_file,
            class_name,
            t,
            l,
            b,
            r,
            crowd,
        } = sample;
        let class_index = classes
            .get_index_of(class_name.as_str())
            .ok_or_else(|| format_err!("unknown class name '{}'", class_name))?;
        let class_id = class_index as i64 + 1;
        let tlbr = TLBR::try_from_tlbr([t, l, b, r].map(|value| value.raw() as f32))
            .with_context(|| format!("invalid box in '{}'", image_file.display()))?;

        groups.entry(image_file).or_default().push(LabeledBox {
            class_id: if crowd { -class_id } else { class_id },
            tlbr,
        });
    }

    let records = groups
        .into_iter()
        .enumerate()
        .map(|(image_id, (path, boxes))| ImageRecord {
            image_id: image_id as i64,
            path,
            boxes,
        })
        .collect();
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_are_grouped_per_image() -> Result<()> {
        let classes: IndexSet<String> = ["car", "person"].iter().map(|&s| s.to_owned()).collect();
        let sample = |file: &str, class_name: &str, crowd: bool| CsvSample {
            image_file: PathBuf::from(file),
            class_name: class_name.to_owned(),
            t: r64(1.0),
            l: r64(2.0),
            b: r64(10.0),
            r: r64(20.0),
            crowd,
        };
        let records = group_samples(
            &classes,
            vec![
                sample("b.jpg", "person", false),
                sample("a.jpg", "car", false),
                sample("b.jpg", "car", true),
            ],
        )?;

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].path, PathBuf::from("b.jpg"));
        let class_ids: Vec<_> = records[0].boxes.iter().map(|bbox| bbox.class_id).collect();
        assert_eq!(class_ids, vec![2, -1]);
        assert_eq!(records[1].boxes[0].class_id, 1);

        assert!(group_samples(&classes, vec![sample("c.jpg", "dog", false)]).is_err());
        Ok(())
    }
}
