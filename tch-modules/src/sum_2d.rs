use crate::common::*;

/// Element-wise sum of equally shaped `[batch, channels, height, width]` maps.
#[derive(Debug, Default)]
pub struct Sum2D {
    _private: [u8; 0],
}

impl Sum2D {
    pub fn new() -> Self {
        Self { _private: [] }
    }

    pub fn forward(
        &self,
        tensors: impl IntoIterator<Item = impl Borrow<Tensor>>,
    ) -> Result<Tensor> {
        let mut iter = tensors.into_iter();
        let first = iter
            .next()
            .ok_or_else(|| format_err!("empty input is not allowed"))?;
        let first: &Tensor = first.borrow();
        first.size4()?;
        let shape = first.size();

        iter.try_fold(first.shallow_clone(), |acc, tensor| {
            let tensor: &Tensor = tensor.borrow();
            ensure!(
                tensor.size() == shape,
                "shape mismatch: expect {:?}, but get {:?}",
                shape,
                tensor.size()
            );
            Ok(acc.f_add(tensor)?)
        })
    }
}
