use crate::dtype::{DType, DTypeError, DTypeOfPrimitive};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum TensorError {
    #[error("Tensor data holds {actual} bytes but shape {shape:?} of {dtype} needs {expected}")]
    SizeMismatch {
        dtype: DType,
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },
    #[error("Shape {0:?} is too large to address")]
    ShapeOverflow(Vec<usize>),
    #[error(transparent)]
    DTypeError(#[from] DTypeError),
}

/// Byte length of a `dtype` tensor with `shape`, or `None` if it overflows `usize`.
pub fn checked_byte_len(dtype: DType, shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(dtype.size(), |acc, dim| acc.checked_mul(*dim))
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    Known(usize),
    Unknown(String),
}

impl Dimension {
    pub fn as_known(&self) -> Option<usize> {
        match self {
            Dimension::Known(x) => Some(*x),
            Dimension::Unknown(_) => None,
        }
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dimension::Known(x) => write!(f, "{x}"),
            Dimension::Unknown(name) => write!(f, "?{name}"),
        }
    }
}

/// Shape and element type of a named edge, as far as they are known.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TensorInfo {
    pub dtype: Option<DType>,
    pub shape: Option<Vec<Dimension>>,
}

impl TensorInfo {
    pub fn new(dtype: DType, shape: &[usize]) -> Self {
        Self {
            dtype: Some(dtype),
            shape: Some(shape.iter().map(|x| Dimension::Known(*x)).collect()),
        }
    }

    pub fn with_dimensions(dtype: Option<DType>, shape: Vec<Dimension>) -> Self {
        Self {
            dtype,
            shape: Some(shape),
        }
    }

    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn is_static(&self) -> bool {
        match &self.shape {
            Some(shape) => shape.iter().all(|x| x.as_known().is_some()),
            None => false,
        }
    }

    pub fn static_shape(&self) -> Option<Vec<usize>> {
        self.shape
            .as_ref()?
            .iter()
            .map(Dimension::as_known)
            .collect()
    }

    /// Stable textual form used by fingerprints, e.g. `Float32[1,?N,4]`.
    pub fn describe(&self) -> String {
        let dtype = self
            .dtype
            .map(|x| x.to_string())
            .unwrap_or_else(|| "?".to_string());
        match &self.shape {
            Some(shape) => {
                let dims: Vec<String> = shape.iter().map(|x| x.to_string()).collect();
                format!("{dtype}[{}]", dims.join(","))
            }
            None => format!("{dtype}[?]"),
        }
    }
}

/// Literal tensor data held in little-endian byte order.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConstTensor {
    dtype: DType,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl ConstTensor {
    pub fn new(dtype: DType, shape: Vec<usize>, data: Vec<u8>) -> Result<Self, TensorError> {
        let Some(expected) = checked_byte_len(dtype, &shape) else {
            return Err(TensorError::ShapeOverflow(shape));
        };
        if expected != data.len() {
            return Err(TensorError::SizeMismatch {
                dtype,
                shape,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { dtype, shape, data })
    }

    pub fn from_vec<T: DTypeOfPrimitive>(values: Vec<T>, shape: Vec<usize>) -> Result<Self, TensorError> {
        let mut data = Vec::with_capacity(values.len() * T::DTYPE.size());
        for v in &values {
            v.write_le(&mut data);
        }
        Self::new(T::DTYPE, shape, data)
    }

    pub fn scalar<T: DTypeOfPrimitive>(value: T) -> Self {
        let mut data = Vec::with_capacity(T::DTYPE.size());
        value.write_le(&mut data);
        Self {
            dtype: T::DTYPE,
            shape: vec![],
            data,
        }
    }

    pub fn to_vec<T: DTypeOfPrimitive>(&self) -> Result<Vec<T>, TensorError> {
        if self.dtype != T::DTYPE {
            return Err(DTypeError::Mismatch {
                expected: T::DTYPE,
                found: self.dtype,
            }
            .into());
        }
        Ok(self
            .data
            .chunks_exact(self.dtype.size())
            .map(T::read_le)
            .collect())
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn info(&self) -> TensorInfo {
        TensorInfo::new(self.dtype, &self.shape)
    }
}
