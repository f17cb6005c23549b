use crate::common::*;

/// Number of values in an encoded image meta row.
pub const IMAGE_META_SIZE: i64 = 12;

/// Per-image resize bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMeta {
    pub image_id: i64,
    /// `[height, width, channels]` before resizing.
    pub original_image_shape: [i64; 3],
    /// `[height, width, channels]` fed to the network.
    pub image_shape: [i64; 3],
    /// `[y1, x1, y2, x2]` pixel window of the real image inside the padded input.
    pub window: [i64; 4],
    pub scale: f64,
}

impl ImageMeta {
    /// Meta of an image that is fed without resizing.
    pub fn unscaled(image_id: i64, image_shape: [i64; 3]) -> Self {
        let [height, width, _] = image_shape;
        Self {
            image_id,
            original_image_shape: image_shape,
            image_shape,
            window: [0, 0, height, width],
            scale: 1.0,
        }
    }

    pub fn image_hw(&self) -> [i64; 2] {
        let [height, width, _] = self.image_shape;
        [height, width]
    }

    /// Encode a batch of metas as a `[batch, IMAGE_META_SIZE]` tensor.
    pub fn encode_batch(metas: &[ImageMeta]) -> Tensor {
        let values: Vec<f32> = metas
            .iter()
            .flat_map(|meta| {
                let Self {
                    image_id,
                    original_image_shape,
                    image_shape,
                    window,
                    scale,
                } = meta;
                chain!(
                    iter::once(*image_id),
                    original_image_shape.iter().copied(),
                    image_shape.iter().copied(),
                    window.iter().copied()
                )
                .map(|value| value as f32)
                .chain(iter::once(*scale as f32))
                .collect::<Vec<_>>()
            })
            .collect();
        Tensor::of_slice(&values).view([-1, IMAGE_META_SIZE])
    }

    /// Decode a `[batch, IMAGE_META_SIZE]` tensor.
    pub fn decode_batch(encoded: &Tensor) -> Result<Vec<ImageMeta>> {
        let (_batch_size, size) = encoded.size2()?;
        ensure!(
            size == IMAGE_META_SIZE,
            "expect {} meta values per image, but get {}",
            IMAGE_META_SIZE,
            size
        );
        let values = Vec::<f32>::from(&encoded.to_kind(Kind::Float).view([-1]));
        let metas = values
            .chunks(IMAGE_META_SIZE as usize)
            .map(|row| {
                let int = |index: usize| row[index].round() as i64;
                ImageMeta {
                    image_id: int(0),
                    original_image_shape: [int(1), int(2), int(3)],
                    image_shape: [int(4), int(5), int(6)],
                    window: [int(7), int(8), int(9), int(10)],
                    scale: row[11] as f64,
                }
            })
            .collect();
        Ok(metas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_survives_encoding() -> Result<()> {
        let metas = vec![
            ImageMeta::unscaled(7, [256, 320, 3]),
            ImageMeta {
                image_id: 8,
                original_image_shape: [480, 640, 3],
                image_shape: [256, 320, 3],
                window: [8, 0, 248, 320],
                scale: 0.5,
            },
        ];
        let encoded = ImageMeta::encode_batch(&metas);
        assert_eq!(encoded.size(), vec![2, IMAGE_META_SIZE]);
        assert_eq!(ImageMeta::decode_batch(&encoded)?, metas);
        Ok(())
    }
}
