use std::fmt::{Debug, Display};

use num::cast::AsPrimitive;
use serde::{Deserialize, Serialize};

/// Element types a dataset can be stored as.
///
/// The serialized names follow the zarr v3 data type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
}

impl DataType {
    pub fn size_bytes(&self) -> usize {
        match self {
            DataType::UInt8 | DataType::Int8 => 1,
            DataType::UInt16 | DataType::Int16 => 2,
            DataType::UInt32 | DataType::Int32 | DataType::Float32 => 4,
            DataType::UInt64 | DataType::Int64 | DataType::Float64 => 8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataType::UInt8 => "uint8",
            DataType::UInt16 => "uint16",
            DataType::UInt32 => "uint32",
            DataType::UInt64 => "uint64",
            DataType::Int8 => "int8",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
        }
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A pixel type that frames can be made of.
///
/// Reductions go through a wider `Accumulator` so that summing a block of
/// values can never overflow the storage type: integers are summed as `i128`
/// and rounded half-to-even when dividing, floats are summed as `f64` through
/// [`FloatSum`].
pub trait PixelType: Copy + Default + PartialEq + Debug + Send + Sync + 'static {
    const DATA_TYPE: DataType;

    type Accumulator: Copy + Default;

    fn accumulate(acc: Self::Accumulator, value: Self) -> Self::Accumulator;

    /// Turn the sum of `count` values into their mean.
    fn finish(acc: Self::Accumulator, count: u32) -> Self;
}

/// Integer division `sum / count`, rounding ties to the even quotient.
///
/// `count` must be positive.
pub fn div_round_half_even(sum: i128, count: i128) -> i128 {
    let quotient = sum.div_euclid(count);
    let twice_remainder = 2 * sum.rem_euclid(count);
    if twice_remainder > count || (twice_remainder == count && quotient % 2 != 0) {
        quotient + 1
    } else {
        quotient
    }
}

macro_rules! integer_pixel_type {
    ($($t:ty => $dt:ident),* $(,)?) => {
        $(
            impl PixelType for $t {
                const DATA_TYPE: DataType = DataType::$dt;

                type Accumulator = i128;

                #[inline]
                fn accumulate(acc: i128, value: Self) -> i128 {
                    acc + AsPrimitive::<i128>::as_(value)
                }

                #[inline]
                fn finish(acc: i128, count: u32) -> Self {
                    // the mean of in-range values is itself in range
                    div_round_half_even(acc, count as i128).as_()
                }
            }
        )*
    };
}

/// Float sum that survives blocks of values close to `f64::MAX`.
///
/// Next to the plain sum, a copy scaled by `2^-32` is kept. Scaling by a power
/// of two is exact for normal values, so the scaled sum is used only when the
/// plain one overflowed and the result is the same as an exact division.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FloatSum {
    sum: f64,
    scaled: f64,
}

impl FloatSum {
    const SCALE: f64 = 1.0 / 4_294_967_296.0;

    #[inline]
    pub fn add(self, value: f64) -> Self {
        Self {
            sum: self.sum + value,
            scaled: self.scaled + value * Self::SCALE,
        }
    }

    #[inline]
    pub fn mean(self, count: u32) -> f64 {
        let count = count as f64;
        if self.sum.is_infinite() && self.scaled.is_finite() {
            (self.scaled / count) / Self::SCALE
        } else {
            self.sum / count
        }
    }
}

macro_rules! float_pixel_type {
    ($($t:ty => $dt:ident),* $(,)?) => {
        $(
            impl PixelType for $t {
                const DATA_TYPE: DataType = DataType::$dt;

                type Accumulator = FloatSum;

                #[inline]
                fn accumulate(acc: FloatSum, value: Self) -> FloatSum {
                    acc.add(AsPrimitive::<f64>::as_(value))
                }

                #[inline]
                fn finish(acc: FloatSum, count: u32) -> Self {
                    acc.mean(count).as_()
                }
            }
        )*
    };
}

integer_pixel_type!(
    u8 => UInt8,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64,
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
);

float_pixel_type!(f32 => Float32, f64 => Float64);

/// Mean of all `values`, or `None` if there are none.
pub fn mean<T: PixelType>(values: impl IntoIterator<Item = T>) -> Option<T> {
    let mut count = 0u32;
    let acc = values.into_iter().fold(T::Accumulator::default(), |acc, v| {
        count += 1;
        T::accumulate(acc, v)
    });
    (count > 0).then(|| T::finish(acc, count))
}
