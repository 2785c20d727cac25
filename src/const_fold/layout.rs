use crate::const_fold::{FoldArgs, FoldError, FoldInterpreter, from_iter, with_typed_array};
use half::{bf16, f16};
use ndarray::{Axis, IxDyn};
use onnx_fuse_graph::{ConstTensor, DType};

pub(super) fn register(interpreter: &mut FoldInterpreter) {
    interpreter.register("Identity", eval_identity);
    interpreter.register("Reshape", eval_reshape);
    interpreter.register("Transpose", eval_transpose);
    interpreter.register("Gather", eval_gather);
    interpreter.register("Shape", eval_shape);
    interpreter.register("Unsqueeze", eval_unsqueeze);
    interpreter.register("Squeeze", eval_squeeze);
    interpreter.register("Cast", eval_cast);
}

fn normalize_axis(axis: i64, rank: usize) -> Result<usize, FoldError> {
    let normalized = if axis < 0 { axis + rank as i64 } else { axis };
    if normalized < 0 || normalized >= rank as i64 {
        return Err(FoldError::Invalid(format!("axis {axis} out of range for rank {rank}")));
    }
    Ok(normalized as usize)
}

fn with_shape(tensor: &ConstTensor, shape: Vec<usize>) -> Result<ConstTensor, FoldError> {
    Ok(ConstTensor::new(tensor.dtype(), shape, tensor.data().to_vec())?)
}

fn eval_identity(args: &FoldArgs) -> Result<ConstTensor, FoldError> {
    Ok(args.tensor(0)?.clone())
}

fn eval_reshape(args: &FoldArgs) -> Result<ConstTensor, FoldError> {
    let data = args.tensor(0)?;
    let requested = args.typed(1)?.to_i64_vec();
    let allow_zero = args.attr_int("allowzero", 0) != 0;

    let mut shape = Vec::with_capacity(requested.len());
    let mut inferred = None;
    for (i, dim) in requested.iter().enumerate() {
        match *dim {
            0 if !allow_zero => {
                let copied = data
                    .shape()
                    .get(i)
                    .ok_or_else(|| FoldError::Invalid(format!("reshape copies missing dimension {i}")))?;
                shape.push(*copied);
            }
            -1 if inferred.is_none() => {
                inferred = Some(i);
                shape.push(1);
            }
            x if x >= 0 => shape.push(x as usize),
            x => return Err(FoldError::Invalid(format!("invalid reshape dimension {x}"))),
        }
    }
    let element_count = |shape: &[usize]| {
        shape
            .iter()
            .try_fold(1usize, |acc, dim| acc.checked_mul(*dim))
            .ok_or_else(|| FoldError::Invalid(format!("reshape target {requested:?} is too large")))
    };
    if let Some(i) = inferred {
        let known = element_count(&shape)?;
        if known == 0 || data.numel() % known != 0 {
            return Err(FoldError::Invalid(format!(
                "cannot infer dimension {i} of {requested:?} for {} elements",
                data.numel()
            )));
        }
        shape[i] = data.numel() / known;
    }
    if element_count(&shape)? != data.numel() {
        return Err(FoldError::Invalid(format!(
            "cannot reshape {:?} into {shape:?}",
            data.shape()
        )));
    }
    with_shape(data, shape)
}

fn eval_transpose(args: &FoldArgs) -> Result<ConstTensor, FoldError> {
    let data = args.typed(0)?;
    let rank = data.shape().len();
    let perm: Vec<usize> = match args.attr_ints("perm") {
        Some(perm) => perm
            .iter()
            .map(|x| normalize_axis(*x, rank))
            .collect::<Result<_, _>>()?,
        None => (0..rank).rev().collect(),
    };
    let mut seen = vec![false; rank];
    for axis in &perm {
        if seen[*axis] {
            return Err(FoldError::InvalidAttribute("perm".to_string()));
        }
        seen[*axis] = true;
    }
    if perm.len() != rank {
        return Err(FoldError::InvalidAttribute("perm".to_string()));
    }
    with_typed_array!(data, |a| {
        let permuted = a.permuted_axes(IxDyn(&perm));
        let shape = permuted.shape().to_vec();
        from_iter(permuted.iter().copied(), shape)
    })
}

fn eval_gather(args: &FoldArgs) -> Result<ConstTensor, FoldError> {
    let data = args.typed(0)?;
    let indices = args.typed(1)?;
    if !matches!(indices.dtype(), DType::I64 | DType::I32) {
        return Err(FoldError::TypeMismatch {
            index: 1,
            expected: DType::I64,
            found: indices.dtype(),
        });
    }
    let rank = data.shape().len();
    let axis = normalize_axis(args.attr_int("axis", 0), rank)?;
    let dim = data.shape()[axis] as i64;
    let positions = indices
        .to_i64_vec()
        .into_iter()
        .map(|x| {
            let i = if x < 0 { x + dim } else { x };
            if i < 0 || i >= dim {
                Err(FoldError::Invalid(format!("gather index {x} out of range for {dim}")))
            } else {
                Ok(i as usize)
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut shape = data.shape()[..axis].to_vec();
    shape.extend_from_slice(indices.shape());
    shape.extend_from_slice(&data.shape()[axis + 1..]);
    // Selecting along `axis` yields [pre, n, post]; its logical order equals the
    // row-major order of [pre, indices..., post].
    with_typed_array!(data, |a| {
        let selected = a.select(Axis(axis), &positions);
        from_iter(selected.iter().copied(), shape)
    })
}

fn eval_shape(args: &FoldArgs) -> Result<ConstTensor, FoldError> {
    let shape = args.static_shape(0)?;
    let rank = shape.len() as i64;
    let clamp = |x: i64| {
        let x = if x < 0 { x + rank } else { x };
        x.clamp(0, rank) as usize
    };
    let start = clamp(args.attr_int("start", 0));
    let end = clamp(args.attr_int("end", rank));
    let dims: Vec<i64> = if start < end {
        shape[start..end].iter().map(|x| *x as i64).collect()
    } else {
        vec![]
    };
    let len = dims.len();
    from_iter(dims.into_iter(), vec![len])
}

fn eval_unsqueeze(args: &FoldArgs) -> Result<ConstTensor, FoldError> {
    let data = args.tensor(0)?;
    let axes = args
        .ints_from_input_or_attr(1, "axes")?
        .ok_or(FoldError::MissingArgument(1))?;
    let out_rank = data.shape().len() + axes.len();
    let mut axes = axes
        .into_iter()
        .map(|x| normalize_axis(x, out_rank))
        .collect::<Result<Vec<_>, _>>()?;
    axes.sort_unstable();
    axes.dedup();
    if axes.len() + data.shape().len() != out_rank {
        return Err(FoldError::InvalidAttribute("axes".to_string()));
    }
    let mut source = data.shape().iter();
    let shape = (0..out_rank)
        .map(|i| if axes.contains(&i) { 1 } else { source.next().copied().unwrap_or(1) })
        .collect();
    with_shape(data, shape)
}

fn eval_squeeze(args: &FoldArgs) -> Result<ConstTensor, FoldError> {
    let data = args.tensor(0)?;
    let rank = data.shape().len();
    let shape = match args.ints_from_input_or_attr(1, "axes")? {
        Some(axes) => {
            let axes = axes
                .into_iter()
                .map(|x| normalize_axis(x, rank))
                .collect::<Result<Vec<_>, _>>()?;
            if let Some(axis) = axes.iter().find(|x| data.shape()[**x] != 1) {
                return Err(FoldError::Invalid(format!("cannot squeeze axis {axis} of {:?}", data.shape())));
            }
            data.shape()
                .iter()
                .enumerate()
                .filter(|(i, _)| !axes.contains(i))
                .map(|(_, x)| *x)
                .collect()
        }
        None => data.shape().iter().copied().filter(|x| *x != 1).collect(),
    };
    with_shape(data, shape)
}

fn eval_cast(args: &FoldArgs) -> Result<ConstTensor, FoldError> {
    let data = args.typed(0)?;
    let to = DType::from_onnx_code(args.require_attr_int("to")? as i32)
        .map_err(|_| FoldError::InvalidAttribute("to".to_string()))?;
    let shape = data.shape().to_vec();
    if to.is_float() {
        let values = data.to_f64_vec().into_iter();
        return match to {
            DType::F64 => from_iter(values, shape),
            DType::F32 => from_iter(values.map(|x| x as f32), shape),
            DType::F16 => from_iter(values.map(f16::from_f64), shape),
            DType::BF16 => from_iter(values.map(bf16::from_f64), shape),
            other => Err(FoldError::Invalid(format!("unsupported cast target {other}"))),
        };
    }
    let values: Vec<i64> = if data.dtype().is_float() {
        data.to_f64_vec().into_iter().map(|x| x as i64).collect()
    } else {
        data.to_i64_vec()
    };
    let values = values.into_iter();
    match to {
        DType::U64 => from_iter(values.map(|x| x as u64), shape),
        DType::I64 => from_iter(values, shape),
        DType::U32 => from_iter(values.map(|x| x as u32), shape),
        DType::I32 => from_iter(values.map(|x| x as i32), shape),
        DType::U16 => from_iter(values.map(|x| x as u16), shape),
        DType::I16 => from_iter(values.map(|x| x as i16), shape),
        DType::U8 => from_iter(values.map(|x| x as u8), shape),
        DType::I8 => from_iter(values.map(|x| x as i8), shape),
        DType::BOOL => from_iter(values.map(|x| x != 0), shape),
        other => Err(FoldError::Invalid(format!("unsupported cast target {other}"))),
    }
}
