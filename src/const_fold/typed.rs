use crate::const_fold::FoldError;
use half::{bf16, f16};
use ndarray::{ArrayD, IxDyn};
use onnx_fuse_graph::{Attribute, ConstTensor, DType, DTypeOfPrimitive, Node, TensorInfo, checked_byte_len};

/// Dense ndarray view of a literal, one variant per element type.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedArray {
    F64(ArrayD<f64>),
    F32(ArrayD<f32>),
    BF16(ArrayD<bf16>),
    F16(ArrayD<f16>),
    U64(ArrayD<u64>),
    I64(ArrayD<i64>),
    U32(ArrayD<u32>),
    I32(ArrayD<i32>),
    U16(ArrayD<u16>),
    I16(ArrayD<i16>),
    U8(ArrayD<u8>),
    I8(ArrayD<i8>),
    BOOL(ArrayD<bool>),
}

/// Evaluates `$body` with `$a` bound to the inner array of whichever variant
/// `$value` holds. Every arm must produce the same type.
macro_rules! with_typed_array {
    ($value:expr, |$a:ident| $body:expr) => {
        match $value {
            $crate::const_fold::TypedArray::F64($a) => $body,
            $crate::const_fold::TypedArray::F32($a) => $body,
            $crate::const_fold::TypedArray::BF16($a) => $body,
            $crate::const_fold::TypedArray::F16($a) => $body,
            $crate::const_fold::TypedArray::U64($a) => $body,
            $crate::const_fold::TypedArray::I64($a) => $body,
            $crate::const_fold::TypedArray::U32($a) => $body,
            $crate::const_fold::TypedArray::I32($a) => $body,
            $crate::const_fold::TypedArray::U16($a) => $body,
            $crate::const_fold::TypedArray::I16($a) => $body,
            $crate::const_fold::TypedArray::U8($a) => $body,
            $crate::const_fold::TypedArray::I8($a) => $body,
            $crate::const_fold::TypedArray::BOOL($a) => $body,
        }
    };
}
pub(crate) use with_typed_array;

pub fn to_array<T: DTypeOfPrimitive>(tensor: &ConstTensor) -> Result<ArrayD<T>, FoldError> {
    let values = tensor.to_vec::<T>()?;
    Ok(ArrayD::from_shape_vec(IxDyn(tensor.shape()), values)?)
}

/// Packs `array` in logical (row-major) order regardless of its memory layout.
pub fn from_array<T: DTypeOfPrimitive>(array: &ArrayD<T>) -> Result<ConstTensor, FoldError> {
    from_iter(array.iter().copied(), array.shape().to_vec())
}

pub fn from_iter<T: DTypeOfPrimitive>(
    values: impl Iterator<Item = T>,
    shape: Vec<usize>,
) -> Result<ConstTensor, FoldError> {
    let mut data = Vec::with_capacity(checked_byte_len(T::DTYPE, &shape).unwrap_or(0));
    for value in values {
        value.write_le(&mut data);
    }
    Ok(ConstTensor::new(T::DTYPE, shape, data)?)
}

impl TypedArray {
    pub fn from_tensor(tensor: &ConstTensor) -> Result<Self, FoldError> {
        Ok(match tensor.dtype() {
            DType::F64 => Self::F64(to_array(tensor)?),
            DType::F32 => Self::F32(to_array(tensor)?),
            DType::BF16 => Self::BF16(to_array(tensor)?),
            DType::F16 => Self::F16(to_array(tensor)?),
            DType::U64 => Self::U64(to_array(tensor)?),
            DType::I64 => Self::I64(to_array(tensor)?),
            DType::U32 => Self::U32(to_array(tensor)?),
            DType::I32 => Self::I32(to_array(tensor)?),
            DType::U16 => Self::U16(to_array(tensor)?),
            DType::I16 => Self::I16(to_array(tensor)?),
            DType::U8 => Self::U8(to_array(tensor)?),
            DType::I8 => Self::I8(to_array(tensor)?),
            DType::BOOL => Self::BOOL(to_array(tensor)?),
        })
    }

    pub fn dtype(&self) -> DType {
        match self {
            Self::F64(_) => DType::F64,
            Self::F32(_) => DType::F32,
            Self::BF16(_) => DType::BF16,
            Self::F16(_) => DType::F16,
            Self::U64(_) => DType::U64,
            Self::I64(_) => DType::I64,
            Self::U32(_) => DType::U32,
            Self::I32(_) => DType::I32,
            Self::U16(_) => DType::U16,
            Self::I16(_) => DType::I16,
            Self::U8(_) => DType::U8,
            Self::I8(_) => DType::I8,
            Self::BOOL(_) => DType::BOOL,
        }
    }

    pub fn shape(&self) -> &[usize] {
        with_typed_array!(self, |a| a.shape())
    }

    pub fn to_tensor(&self) -> Result<ConstTensor, FoldError> {
        with_typed_array!(self, |a| from_array(a))
    }

    /// Elements widened to f64, in logical order.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            Self::F64(a) => a.iter().copied().collect(),
            Self::F32(a) => a.iter().map(|x| *x as f64).collect(),
            Self::BF16(a) => a.iter().map(|x| x.to_f64()).collect(),
            Self::F16(a) => a.iter().map(|x| x.to_f64()).collect(),
            Self::U64(a) => a.iter().map(|x| *x as f64).collect(),
            Self::I64(a) => a.iter().map(|x| *x as f64).collect(),
            Self::U32(a) => a.iter().map(|x| *x as f64).collect(),
            Self::I32(a) => a.iter().map(|x| *x as f64).collect(),
            Self::U16(a) => a.iter().map(|x| *x as f64).collect(),
            Self::I16(a) => a.iter().map(|x| *x as f64).collect(),
            Self::U8(a) => a.iter().map(|x| *x as f64).collect(),
            Self::I8(a) => a.iter().map(|x| *x as f64).collect(),
            Self::BOOL(a) => a.iter().map(|x| if *x { 1.0 } else { 0.0 }).collect(),
        }
    }

    /// Elements as i64, in logical order. Floats truncate toward zero.
    pub fn to_i64_vec(&self) -> Vec<i64> {
        match self {
            Self::U64(a) => a.iter().map(|x| *x as i64).collect(),
            Self::I64(a) => a.iter().copied().collect(),
            Self::U32(a) => a.iter().map(|x| *x as i64).collect(),
            Self::I32(a) => a.iter().map(|x| *x as i64).collect(),
            Self::U16(a) => a.iter().map(|x| *x as i64).collect(),
            Self::I16(a) => a.iter().map(|x| *x as i64).collect(),
            Self::U8(a) => a.iter().map(|x| *x as i64).collect(),
            Self::I8(a) => a.iter().map(|x| *x as i64).collect(),
            Self::BOOL(a) => a.iter().map(|x| *x as i64).collect(),
            _ => self.to_f64_vec().into_iter().map(|x| x as i64).collect(),
        }
    }
}

/// Inputs of one node under evaluation.
///
/// `inputs[i]` is `None` for an absent optional input, and for the data input of
/// shape-only operators, whose static shape is in `infos[i]` instead.
#[derive(Debug)]
pub struct FoldArgs<'a> {
    node: &'a Node,
    inputs: Vec<Option<ConstTensor>>,
    infos: Vec<Option<TensorInfo>>,
}

impl<'a> FoldArgs<'a> {
    pub fn new(node: &'a Node, inputs: Vec<Option<ConstTensor>>, infos: Vec<Option<TensorInfo>>) -> Self {
        Self { node, inputs, infos }
    }

    pub fn node(&self) -> &Node {
        self.node
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn dtype(&self, index: usize) -> Option<DType> {
        self.inputs.get(index)?.as_ref().map(|x| x.dtype())
    }

    pub fn tensor(&self, index: usize) -> Result<&ConstTensor, FoldError> {
        self.inputs
            .get(index)
            .and_then(|x| x.as_ref())
            .ok_or(FoldError::MissingArgument(index))
    }

    pub fn optional_tensor(&self, index: usize) -> Option<&ConstTensor> {
        self.inputs.get(index).and_then(|x| x.as_ref())
    }

    pub fn typed(&self, index: usize) -> Result<TypedArray, FoldError> {
        TypedArray::from_tensor(self.tensor(index)?)
    }

    /// Argument `index` as an array of `T`; fails if it is absent or of another type.
    pub fn required<T: DTypeOfPrimitive>(&self, index: usize) -> Result<ArrayD<T>, FoldError> {
        let tensor = self.tensor(index)?;
        if tensor.dtype() != T::DTYPE {
            return Err(FoldError::TypeMismatch {
                index,
                expected: T::DTYPE,
                found: tensor.dtype(),
            });
        }
        to_array(tensor)
    }

    /// Like [`Self::required`], but an absent argument yields `None`.
    pub fn optional<T: DTypeOfPrimitive>(&self, index: usize) -> Result<Option<ArrayD<T>>, FoldError> {
        match self.optional_tensor(index) {
            Some(_) => self.required(index).map(Some),
            None => Ok(None),
        }
    }

    pub fn static_shape(&self, index: usize) -> Result<Vec<usize>, FoldError> {
        if let Some(tensor) = self.optional_tensor(index) {
            return Ok(tensor.shape().to_vec());
        }
        self.infos
            .get(index)
            .and_then(|x| x.as_ref())
            .and_then(|x| x.static_shape())
            .ok_or(FoldError::DynamicShape(index))
    }

    pub fn attr_int(&self, name: &str, default: i64) -> i64 {
        self.node.attribute_int(name).unwrap_or(default)
    }

    pub fn attr_ints(&self, name: &str) -> Option<&[i64]> {
        self.node.attribute_ints(name)
    }

    pub fn require_attr_int(&self, name: &str) -> Result<i64, FoldError> {
        match self.node.attribute(name) {
            Some(Attribute::Int(x)) => Ok(*x),
            _ => Err(FoldError::InvalidAttribute(name.to_string())),
        }
    }

    /// Integer list from input `index` when present, else from attribute `attr`.
    pub fn ints_from_input_or_attr(&self, index: usize, attr: &str) -> Result<Option<Vec<i64>>, FoldError> {
        if self.optional_tensor(index).is_some() {
            return Ok(Some(self.typed(index)?.to_i64_vec()));
        }
        Ok(self.attr_ints(attr).map(<[i64]>::to_vec))
    }
}
