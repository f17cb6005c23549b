use crate::common::*;

/// An image resized into the network input with its bookkeeping.
#[derive(Debug)]
pub struct ResizedImage {
    /// Float image in shape `[channels, height, width]`, mean subtracted.
    pub image: Tensor,
    pub meta: ImageMeta,
}

/// Scale that fits an `h × w` image into the target size without cropping.
pub fn fit_scale(source_hw: [i64; 2], target_hw: [i64; 2]) -> f64 {
    let [source_h, source_w] = source_hw;
    let [target_h, target_w] = target_hw;
    (target_h as f64 / source_h as f64).min(target_w as f64 / source_w as f64)
}

/// Resize a `[channels, height, width]` u8 image to fit the target size
/// preserving the aspect ratio, then center it on a zero canvas.
///
/// The returned meta records the pixel window of the image on the canvas.
pub fn resize_image(
    image_id: i64,
    image: &Tensor,
    target_shape: [i64; 3],
    mean_pixel: [f64; 3],
) -> Result<ResizedImage> {
    let (channels, height, width) = image.size3()?;
    let [target_h, target_w, target_c] = target_shape;
    ensure!(
        channels == target_c,
        "expect {} channels, but get {}",
        target_c,
        channels
    );
    ensure!(height > 0 && width > 0, "empty image");

    let scale = fit_scale([height, width], [target_h, target_w]);
    let new_h = ((height as f64 * scale).round() as i64).clamp(1, target_h);
    let new_w = ((width as f64 * scale).round() as i64).clamp(1, target_w);
    let resized = if [new_h, new_w] == [height, width] {
        image.shallow_clone()
    } else {
        vision::image::resize(image, new_w, new_h)?
    };

    let top = (target_h - new_h) / 2;
    let left = (target_w - new_w) / 2;
    let mean = Tensor::of_slice(&mean_pixel[..channels.min(3) as usize])
        .to_kind(Kind::Float)
        .view([-1, 1, 1]);
    let molded = resized.to_kind(Kind::Float) - mean;

    let canvas = Tensor::zeros(&[channels, target_h, target_w], (Kind::Float, Device::Cpu));
    canvas
        .narrow(1, top, new_h)
        .narrow(2, left, new_w)
        .copy_(&molded);

    Ok(ResizedImage {
        image: canvas,
        meta: ImageMeta {
            image_id,
            original_image_shape: [height, width, channels],
            image_shape: target_shape,
            window: [top, left, top + new_h, left + new_w],
            scale,
        },
    })
}

/// Map a source pixel box onto the canvas described by the meta.
pub fn transform_box(tlbr: &TLBR<f32>, meta: &ImageMeta) -> TLBR<f32> {
    let scale = meta.scale as f32;
    let [top, left, _, _] = meta.window;
    let [t, l, b, r] = tlbr.tlbr();
    TLBR::from_tlbr([
        t * scale + top as f32,
        l * scale + left as f32,
        b * scale + top as f32,
        r * scale + left as f32,
    ])
}
