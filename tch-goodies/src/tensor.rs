use crate::common::*;

pub trait TensorExt {
    fn is_empty(&self) -> bool;

    fn f_sum_tensors<T>(tensors: impl IntoIterator<Item = T>) -> Result<Tensor>
    where
        T: Borrow<Tensor>,
    {
        let mut iter = tensors.into_iter();
        let first = iter
            .next()
            .ok_or_else(|| format_err!("the input iterator must not be empty"))?
            .borrow()
            .shallow_clone();
        let sum = iter.try_fold(first, |lhs, rhs| lhs.f_add(rhs.borrow()))?;
        Ok(sum)
    }

    fn sum_tensors<T>(tensors: impl IntoIterator<Item = T>) -> Tensor
    where
        T: Borrow<Tensor>,
    {
        Self::f_sum_tensors(tensors).unwrap()
    }

    /// Zero-pad or truncate dimension 0 to exactly `len` entries.
    fn f_pad_rows(&self, len: i64) -> Result<Tensor>;

    fn pad_rows(&self, len: i64) -> Tensor {
        self.f_pad_rows(len).unwrap()
    }
}

impl TensorExt for Tensor {
    fn is_empty(&self) -> bool {
        self.numel() == 0
    }

    fn f_pad_rows(&self, len: i64) -> Result<Tensor> {
        ensure!(len >= 0, "length must be non-negative");
        let shape = self.size();
        let rows = *shape
            .first()
            .ok_or_else(|| format_err!("cannot pad a zero-dimensional tensor"))?;

        let output = if rows >= len {
            self.f_narrow(0, 0, len)?
        } else {
            let mut pad_shape = shape.clone();
            pad_shape[0] = len - rows;
            let padding = Tensor::f_zeros(&pad_shape, (self.kind(), self.device()))?;
            Tensor::f_cat(&[self, &padding], 0)?
        };
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_rows_extends_and_truncates() {
        let rows = Tensor::ones(&[3, 4], (Kind::Float, Device::Cpu));
        assert_eq!(rows.pad_rows(5).size(), vec![5, 4]);
        assert_eq!(rows.pad_rows(2).size(), vec![2, 4]);
        assert_eq!(f64::from(rows.pad_rows(5).sum(Kind::Float)), 12.0);
    }
}
