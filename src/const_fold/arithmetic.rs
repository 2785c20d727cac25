use crate::const_fold::{FoldArgs, FoldError, FoldInterpreter, TypedArray, from_iter};
use half::{bf16, f16};
use ndarray::{ArrayD, IxDyn, Zip};
use num_traits::{CheckedDiv, WrappingAdd, WrappingMul, WrappingNeg, WrappingSub, Zero};
use onnx_fuse_graph::{ConstTensor, DTypeOfPrimitive};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Element arithmetic as ONNX runtimes compute it: IEEE for floats, two's
/// complement wrap-around for integers. `None` marks an undefined result.
trait FoldArith: DTypeOfPrimitive {
    fn binary(op: BinaryOp, x: Self, y: Self) -> Option<Self>;
    fn negate(self) -> Self;
}

macro_rules! float_arith {
    ($($t:ty),*) => {$(
        impl FoldArith for $t {
            fn binary(op: BinaryOp, x: Self, y: Self) -> Option<Self> {
                Some(match op {
                    BinaryOp::Add => x + y,
                    BinaryOp::Sub => x - y,
                    BinaryOp::Mul => x * y,
                    BinaryOp::Div => x / y,
                })
            }

            fn negate(self) -> Self {
                -self
            }
        }
    )*};
}

float_arith!(f64, f32, f16, bf16);

fn wrapping_binary<T>(op: BinaryOp, x: T, y: T) -> Option<T>
where
    T: WrappingAdd + WrappingSub + WrappingMul + WrappingNeg + CheckedDiv + Zero,
{
    match op {
        BinaryOp::Add => Some(x.wrapping_add(&y)),
        BinaryOp::Sub => Some(x.wrapping_sub(&y)),
        BinaryOp::Mul => Some(x.wrapping_mul(&y)),
        BinaryOp::Div if y.is_zero() => None,
        // Only MIN / -1 is left to overflow, and it wraps to MIN.
        BinaryOp::Div => Some(x.checked_div(&y).unwrap_or_else(|| x.wrapping_neg())),
    }
}

macro_rules! int_arith {
    ($($t:ty),*) => {$(
        impl FoldArith for $t {
            fn binary(op: BinaryOp, x: Self, y: Self) -> Option<Self> {
                wrapping_binary(op, x, y)
            }

            fn negate(self) -> Self {
                self.wrapping_neg()
            }
        }
    )*};
}

int_arith!(i64, i32, i16, i8);

pub(super) fn register(interpreter: &mut FoldInterpreter) {
    interpreter.register("Add", |args| eval_binary(args, BinaryOp::Add));
    interpreter.register("Sub", |args| eval_binary(args, BinaryOp::Sub));
    interpreter.register("Mul", |args| eval_binary(args, BinaryOp::Mul));
    interpreter.register("Div", |args| eval_binary(args, BinaryOp::Div));
    interpreter.register("Neg", eval_neg);
}

pub(crate) fn broadcast_shape(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let pad = |s: &[usize], i: usize| if i < rank - s.len() { 1 } else { s[i - (rank - s.len())] };
    (0..rank)
        .map(|i| match (pad(a, i), pad(b, i)) {
            (x, y) if x == y => Some(x),
            (1, y) => Some(y),
            (x, 1) => Some(x),
            _ => None,
        })
        .collect()
}

/// Applies `f` elementwise under numpy-style broadcasting.
pub(crate) fn broadcast_zip<T: Copy, U>(
    a: &ArrayD<T>,
    b: &ArrayD<T>,
    f: impl Fn(T, T) -> U,
) -> Result<ArrayD<U>, FoldError> {
    let shape = broadcast_shape(a.shape(), b.shape()).ok_or_else(|| {
        FoldError::Invalid(format!("shapes {:?} and {:?} do not broadcast", a.shape(), b.shape()))
    })?;
    let (Some(a), Some(b)) = (a.broadcast(IxDyn(&shape)), b.broadcast(IxDyn(&shape))) else {
        return Err(FoldError::Invalid(format!("cannot broadcast to {shape:?}")));
    };
    Ok(Zip::from(a).and(b).map_collect(|x, y| f(*x, *y)))
}

fn binary<T: FoldArith>(a: &ArrayD<T>, b: &ArrayD<T>, op: BinaryOp) -> Result<ConstTensor, FoldError> {
    let out = broadcast_zip(a, b, |x, y| T::binary(op, x, y))?;
    let shape = out.shape().to_vec();
    let values = out
        .iter()
        .copied()
        .collect::<Option<Vec<T>>>()
        .ok_or_else(|| FoldError::Invalid("integer division by zero".to_string()))?;
    from_iter(values.into_iter(), shape)
}

fn eval_binary(args: &FoldArgs, op: BinaryOp) -> Result<ConstTensor, FoldError> {
    match (args.typed(0)?, args.typed(1)?) {
        (TypedArray::F64(a), TypedArray::F64(b)) => binary(&a, &b, op),
        (TypedArray::F32(a), TypedArray::F32(b)) => binary(&a, &b, op),
        (TypedArray::F16(a), TypedArray::F16(b)) => binary(&a, &b, op),
        (TypedArray::BF16(a), TypedArray::BF16(b)) => binary(&a, &b, op),
        (TypedArray::I64(a), TypedArray::I64(b)) => binary(&a, &b, op),
        (TypedArray::I32(a), TypedArray::I32(b)) => binary(&a, &b, op),
        (a, b) if a.dtype() == b.dtype() => Err(FoldError::Invalid(format!("{op} is not folded for {}", a.dtype()))),
        (a, b) => Err(FoldError::TypeMismatch {
            index: 1,
            expected: a.dtype(),
            found: b.dtype(),
        }),
    }
}

fn negate<T: FoldArith>(a: &ArrayD<T>) -> Result<ConstTensor, FoldError> {
    let shape = a.shape().to_vec();
    from_iter(a.iter().copied().map(T::negate), shape)
}

fn eval_neg(args: &FoldArgs) -> Result<ConstTensor, FoldError> {
    match args.typed(0)? {
        TypedArray::F64(a) => negate(&a),
        TypedArray::F32(a) => negate(&a),
        TypedArray::F16(a) => negate(&a),
        TypedArray::BF16(a) => negate(&a),
        TypedArray::I64(a) => negate(&a),
        TypedArray::I32(a) => negate(&a),
        TypedArray::I16(a) => negate(&a),
        TypedArray::I8(a) => negate(&a),
        other => Err(FoldError::Invalid(format!("Neg is not folded for {}", other.dtype()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_shapes() {
        assert_eq!(broadcast_shape(&[2, 3], &[3]), Some(vec![2, 3]));
        assert_eq!(broadcast_shape(&[], &[4]), Some(vec![4]));
        assert_eq!(broadcast_shape(&[2, 3], &[2]), None);
    }

    #[test]
    fn broadcast_add() {
        let a = ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![1.0f32, 2.0, 3.0, 4.0]).unwrap();
        let b = ArrayD::from_shape_vec(IxDyn(&[2]), vec![10.0f32, 20.0]).unwrap();
        let out = binary(&a, &b, BinaryOp::Add).unwrap();
        assert_eq!(out.shape(), &[2, 2]);
        assert_eq!(out.to_vec::<f32>().unwrap(), vec![11.0, 22.0, 13.0, 24.0]);
    }

    #[test]
    fn integer_division_by_zero_is_rejected() {
        let a = ArrayD::from_shape_vec(IxDyn(&[1]), vec![4i64]).unwrap();
        let b = ArrayD::from_shape_vec(IxDyn(&[1]), vec![0i64]).unwrap();
        assert!(binary(&a, &b, BinaryOp::Div).is_err());
    }

    #[test]
    fn integer_overflow_wraps() {
        let a = ArrayD::from_shape_vec(IxDyn(&[2]), vec![i32::MAX, i32::MIN]).unwrap();
        let b = ArrayD::from_shape_vec(IxDyn(&[2]), vec![1i32, 1]).unwrap();
        let sum = binary(&a, &b, BinaryOp::Add).unwrap();
        assert_eq!(sum.to_vec::<i32>().unwrap(), vec![i32::MIN, i32::MIN + 1]);
        let difference = binary(&a, &b, BinaryOp::Sub).unwrap();
        assert_eq!(difference.to_vec::<i32>().unwrap(), vec![i32::MAX - 1, i32::MAX]);

        let a = ArrayD::from_shape_vec(IxDyn(&[2]), vec![i64::MIN, 7]).unwrap();
        let b = ArrayD::from_shape_vec(IxDyn(&[2]), vec![-1i64, -2]).unwrap();
        let quotient = binary(&a, &b, BinaryOp::Div).unwrap();
        assert_eq!(quotient.to_vec::<i64>().unwrap(), vec![i64::MIN, -3]);
    }

    #[test]
    fn negating_minimum_wraps() {
        let a = ArrayD::from_shape_vec(IxDyn(&[2]), vec![i8::MIN, 5]).unwrap();
        let out = negate(&a).unwrap();
        assert_eq!(out.to_vec::<i8>().unwrap(), vec![i8::MIN, -5]);
    }
}
