use crate::const_fold::{FoldArgs, FoldError, FoldInterpreter, from_iter};
use crate::pattern::OpKey;
use ndarray::ArrayD;
use onnx_fuse_graph::{ConstTensor, DType};

/// Vendor domain of `FixNeuron`, the fixed-point quantize/dequantize marker.
pub const FIX_NEURON_DOMAIN: &str = "com.xilinx";

pub(super) fn register(interpreter: &mut FoldInterpreter) {
    interpreter.register("QuantizeLinear", eval_quantize_linear);
    interpreter.register("DequantizeLinear", eval_dequantize_linear);
    interpreter.register(OpKey::new(FIX_NEURON_DOMAIN, "FixNeuron"), eval_fix_neuron);
}

/// Per-tensor or per-axis parameter lookup.
struct AxisParams<T> {
    values: Vec<T>,
    axis: usize,
}

impl<T: Copy> AxisParams<T> {
    fn new(values: Vec<T>, axis: i64, shape: &[usize], name: &str) -> Result<Self, FoldError> {
        if values.len() <= 1 {
            return Ok(Self { values, axis: 0 });
        }
        let rank = shape.len() as i64;
        let axis = if axis < 0 { axis + rank } else { axis };
        if axis < 0 || axis >= rank || shape[axis as usize] != values.len() {
            return Err(FoldError::Invalid(format!(
                "{name} has {} values, which matches no axis {axis} of {shape:?}",
                values.len()
            )));
        }
        Ok(Self {
            values,
            axis: axis as usize,
        })
    }

    fn at(&self, index: &ndarray::IxDyn, default: T) -> T {
        match self.values.len() {
            0 => default,
            1 => self.values[0],
            _ => self.values[index[self.axis]],
        }
    }
}

fn quantize_range(dtype: DType) -> Result<(f32, f32), FoldError> {
    match dtype {
        DType::U8 => Ok((0.0, 255.0)),
        DType::I8 => Ok((-128.0, 127.0)),
        DType::U16 => Ok((0.0, 65535.0)),
        DType::I16 => Ok((-32768.0, 32767.0)),
        other => Err(FoldError::Invalid(format!("unsupported quantized type {other}"))),
    }
}

/// `saturate(round_half_even(x / scale) + zero_point)`
fn eval_quantize_linear(args: &FoldArgs) -> Result<ConstTensor, FoldError> {
    let x: ArrayD<f32> = args.required(0)?;
    let scale = args.required::<f32>(1)?;
    let out_dtype = args.dtype(2).unwrap_or(DType::U8);
    let (lo, hi) = quantize_range(out_dtype)?;
    let zero_points: Vec<i64> = match args.optional_tensor(2) {
        Some(_) => args.typed(2)?.to_i64_vec(),
        None => vec![],
    };
    let axis = args.attr_int("axis", 1);
    let scale = AxisParams::new(scale.iter().copied().collect(), axis, x.shape(), "scale")?;
    let zero_points = AxisParams::new(zero_points, axis, x.shape(), "zero point")?;
    if scale.values.is_empty() {
        return Err(FoldError::Invalid("scale is empty".to_string()));
    }

    let quantized: Vec<f32> = x
        .indexed_iter()
        .map(|(index, value)| {
            let q = (value / scale.at(&index, 1.0)).round_ties_even() + zero_points.at(&index, 0) as f32;
            q.clamp(lo, hi)
        })
        .collect();
    let shape = x.shape().to_vec();
    let values = quantized.into_iter();
    match out_dtype {
        DType::U8 => from_iter(values.map(|x| x as u8), shape),
        DType::I8 => from_iter(values.map(|x| x as i8), shape),
        DType::U16 => from_iter(values.map(|x| x as u16), shape),
        _ => from_iter(values.map(|x| x as i16), shape),
    }
}

/// `(x - zero_point) * scale`
fn eval_dequantize_linear(args: &FoldArgs) -> Result<ConstTensor, FoldError> {
    let x = args.typed(0)?;
    if !matches!(x.dtype(), DType::U8 | DType::I8 | DType::U16 | DType::I16 | DType::I32) {
        return Err(FoldError::Invalid(format!("unsupported quantized type {}", x.dtype())));
    }
    if let Some(found) = args.dtype(2).filter(|d| *d != x.dtype()) {
        return Err(FoldError::TypeMismatch {
            index: 2,
            expected: x.dtype(),
            found,
        });
    }
    let scale = args.required::<f32>(1)?;
    let zero_points: Vec<i64> = match args.optional_tensor(2) {
        Some(_) => args.typed(2)?.to_i64_vec(),
        None => vec![],
    };
    let axis = args.attr_int("axis", 1);
    let shape = x.shape().to_vec();
    let scale = AxisParams::new(scale.iter().copied().collect(), axis, &shape, "scale")?;
    let zero_points = AxisParams::new(zero_points, axis, &shape, "zero point")?;

    let values = ArrayD::from_shape_vec(ndarray::IxDyn(&shape), x.to_i64_vec())?;
    let out = values
        .indexed_iter()
        .map(|(index, value)| (value - zero_points.at(&index, 0)) as f32 * scale.at(&index, 1.0))
        .collect::<Vec<_>>();
    from_iter(out.into_iter(), shape)
}

/// Fixed-point round trip: `clamp(round_half_even(x * 2^fp)) / 2^fp`.
fn eval_fix_neuron(args: &FoldArgs) -> Result<ConstTensor, FoldError> {
    let x = args.required::<f32>(0)?;
    let fix_point = args.require_attr_int("fix_point")?;
    let bit_width = args.attr_int("bit_width", 8);
    if !(2..=32).contains(&bit_width) {
        return Err(FoldError::InvalidAttribute("bit_width".to_string()));
    }
    let signed = args.attr_int("if_signed", 1) != 0;
    let (lo, hi) = if signed {
        (-(2f64.powi(bit_width as i32 - 1)), 2f64.powi(bit_width as i32 - 1) - 1.0)
    } else {
        (0.0, 2f64.powi(bit_width as i32) - 1.0)
    };
    let step = 2f64.powi(fix_point as i32);
    let shape = x.shape().to_vec();
    let values = x
        .iter()
        .map(|v| ((*v as f64 * step).round_ties_even().clamp(lo, hi) / step) as f32);
    from_iter(values, shape)
}

#[cfg(test)]
mod tests {
    use super::*;
    use onnx_fuse_graph::{Attribute, Node};

    fn args<'a>(node: &'a Node, inputs: Vec<Option<ConstTensor>>) -> FoldArgs<'a> {
        let infos = vec![None; inputs.len()];
        FoldArgs::new(node, inputs, infos)
    }

    #[test]
    fn quantize_rounds_half_to_even() {
        let node = Node::new("QuantizeLinear");
        let out = eval_quantize_linear(&args(
            &node,
            vec![
                Some(ConstTensor::from_vec(vec![0.25f32, 0.75, 1.0, 200.0], vec![4]).unwrap()),
                Some(ConstTensor::scalar(0.5f32)),
                Some(ConstTensor::scalar(0u8)),
            ],
        ))
        .unwrap();
        assert_eq!(out.dtype(), DType::U8);
        assert_eq!(out.to_vec::<u8>().unwrap(), vec![0, 2, 2, 255]);
    }

    #[test]
    fn per_axis_dequantize() {
        let node = Node::new("DequantizeLinear").with_attribute("axis", Attribute::Int(0));
        let out = eval_dequantize_linear(&args(
            &node,
            vec![
                Some(ConstTensor::from_vec(vec![10i8, 10, 10, 10], vec![2, 2]).unwrap()),
                Some(ConstTensor::from_vec(vec![1.0f32, 0.5], vec![2]).unwrap()),
                Some(ConstTensor::from_vec(vec![0i8, 2], vec![2]).unwrap()),
            ],
        ))
        .unwrap();
        assert_eq!(out.to_vec::<f32>().unwrap(), vec![10.0, 10.0, 4.0, 4.0]);
    }

    #[test]
    fn fix_neuron_saturates() {
        let node = Node::new("FixNeuron")
            .in_domain(FIX_NEURON_DOMAIN)
            .with_attribute("fix_point", Attribute::Int(2));
        let out = eval_fix_neuron(&args(
            &node,
            vec![Some(ConstTensor::from_vec(vec![0.3f32, 100.0, -100.0], vec![3]).unwrap())],
        ))
        .unwrap();
        assert_eq!(out.to_vec::<f32>().unwrap(), vec![0.25, 31.75, -32.0]);
    }

    #[test]
    fn fix_neuron_requires_fix_point() {
        let node = Node::new("FixNeuron").in_domain(FIX_NEURON_DOMAIN);
        let result = eval_fix_neuron(&args(
            &node,
            vec![Some(ConstTensor::from_vec(vec![0.3f32], vec![1]).unwrap())],
        ));
        assert!(matches!(result, Err(FoldError::InvalidAttribute(_))));
    }
}
