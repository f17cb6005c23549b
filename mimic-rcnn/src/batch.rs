use crate::common::*;

/// Apply `f` to each batch index of `inputs` and re-stack the results.
///
/// Every input must share the leading batch dimension of `batch_size`.
/// `f` receives the per-image slices in input order and returns a fixed
/// number of outputs. Each output position is stacked along a new leading
/// dimension in batch order.
pub fn batch_slice<F>(inputs: &[&Tensor], mut f: F, batch_size: i64) -> Result<Vec<Tensor>>
where
    F: FnMut(&[Tensor]) -> Result<Vec<Tensor>>,
{
    ensure!(batch_size > 0, "batch_size must be positive");
    ensure!(!inputs.is_empty(), "at least one input is required");
    for input in inputs {
        let leading = input.size().first().copied();
        ensure!(
            leading == Some(batch_size),
            "expect batch dimension {}, but get shape {:?}",
            batch_size,
            input.size()
        );
    }

    let per_item: Vec<Vec<Tensor>> = (0..batch_size)
        .map(|index| {
            let slices: Vec<_> = inputs.iter().map(|input| input.select(0, index)).collect();
            f(&slices)
        })
        .try_collect()?;

    let num_outputs = per_item[0].len();
    ensure!(
        per_item.iter().all(|outputs| outputs.len() == num_outputs),
        "the number of outputs differs across batch items"
    );

    let stacked: Vec<_> = (0..num_outputs)
        .map(|position| {
            let tensors: Vec<_> = per_item.iter().map(|outputs| &outputs[position]).collect();
            Tensor::f_stack(&tensors, 0)
        })
        .try_collect()?;
    Ok(stacked)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_slice_preserves_order() -> Result<()> {
        let values = Tensor::arange(6, (Kind::Float, Device::Cpu)).view([3, 2]);
        let offsets = Tensor::of_slice(&[10.0f32, 20.0, 30.0]);

        let outputs = batch_slice(
            &[&values, &offsets],
            |slices| Ok(vec![&slices[0] + &slices[1], slices[0].sum(Kind::Float)]),
            3,
        )?;

        assert_eq!(outputs.len(), 2);
        assert_eq!(
            Vec::<f32>::from(&outputs[0].view([-1])),
            vec![10.0, 11.0, 22.0, 23.0, 34.0, 35.0]
        );
        assert_eq!(Vec::<f32>::from(&outputs[1]), vec![1.0, 5.0, 9.0]);
        Ok(())
    }

    #[test]
    fn mismatched_batch_size_is_rejected() {
        let values = Tensor::zeros(&[2, 4], (Kind::Float, Device::Cpu));
        let result = batch_slice(&[&values], |slices| Ok(slices.iter().map(Tensor::shallow_clone).collect()), 3);
        assert!(result.is_err());
    }
}
