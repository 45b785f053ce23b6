//! The closed element-type system (§3, §4.3) and its promotion lattice.

use std::fmt;

use strum::EnumIter;

/// An element type of an input, output, or intermediate value.
///
/// `Auto` is a pseudo-type accepted only at the API boundary (`compile`'s
/// requested output dtype); it never appears on a resolved `Node`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter)]
pub enum DType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Complex64,
    Complex128,
    /// Fixed item-size UCS-4 cells, null-padded. `item_size` is the number
    /// of 4-byte code points per cell and is carried alongside the dtype
    /// wherever string values flow (see [`crate::variable::Variable`]).
    String,
    /// Accepted only as a requested output dtype; resolves to the inferred
    /// dtype of the compiled expression.
    Auto,
}

impl DType {
    /// Byte size of one element of this type, or `None` for `String`
    /// (whose size depends on `item_size`) and `Auto` (unresolved).
    pub const fn byte_size(self) -> Option<usize> {
        use DType::*;
        Some(match self {
            Bool | Int8 | UInt8 => 1,
            Int16 | UInt16 => 2,
            Int32 | UInt32 | Float32 => 4,
            Int64 | UInt64 | Float64 | Complex64 => 8,
            Complex128 => 16,
            String | Auto => return None,
        })
    }

    pub const fn is_integer(self) -> bool {
        use DType::*;
        matches!(
            self,
            Int8 | Int16 | Int32 | Int64 | UInt8 | UInt16 | UInt32 | UInt64
        )
    }

    pub const fn is_signed(self) -> bool {
        use DType::*;
        matches!(self, Int8 | Int16 | Int32 | Int64 | Float32 | Float64 | Complex64 | Complex128)
    }

    pub const fn is_float(self) -> bool {
        matches!(self, DType::Float32 | DType::Float64)
    }

    pub const fn is_complex(self) -> bool {
        matches!(self, DType::Complex64 | DType::Complex128)
    }

    pub const fn is_numeric(self) -> bool {
        self.is_integer() || self.is_float() || self.is_complex() || matches!(self, DType::Bool)
    }

    /// Integer/float bit width, used by the promotion lattice; `0` for
    /// types without a meaningful width (bool, string, complex uses its
    /// real-component width doubled in `byte_size`).
    const fn numeric_rank(self) -> u32 {
        use DType::*;
        match self {
            Bool => 0,
            Int8 | UInt8 => 8,
            Int16 | UInt16 => 16,
            Int32 | UInt32 => 32,
            Int64 | UInt64 => 64,
            Float32 => 32,
            Float64 => 64,
            Complex64 => 32,
            Complex128 => 64,
            String | Auto => 0,
        }
    }

    /// Symmetric pairwise promotion per §3. Returns `None` when the pair
    /// cannot be promoted (e.g. either side is `String` paired with a
    /// numeric, or `Auto` on either side).
    pub fn promote(self, other: Self) -> Option<Self> {
        use DType::*;
        if self == other {
            return Some(self);
        }
        if self == Auto || other == Auto {
            return None;
        }
        if self == String || other == String {
            return None;
        }

        // Bool promotes with any numeric to that numeric.
        if self == Bool {
            return Some(other);
        }
        if other == Bool {
            return Some(self);
        }

        // Complex absorbs a real partner into the matching-width complex.
        if self.is_complex() || other.is_complex() {
            let (complex, real) = if self.is_complex() { (self, other) } else { (other, self) };
            if real.is_complex() {
                return Some(if complex.numeric_rank() >= real.numeric_rank() { complex } else { real });
            }
            // real is an int or float; widen to the wider-width matching complex.
            let real_float_equiv = real.float_equivalent_width();
            return Some(if real_float_equiv >= complex.numeric_rank() && real_float_equiv > 32 {
                Complex128
            } else {
                complex
            });
        }

        // Two floats: widest wins.
        if self.is_float() && other.is_float() {
            return Some(if self.numeric_rank() >= other.numeric_rank() { self } else { other });
        }

        // Integer <-> float.
        if self.is_float() != other.is_float() {
            let (float, int) = if self.is_float() { (self, other) } else { (other, self) };
            let needed = int.float_equivalent_width().max(float.numeric_rank());
            return Some(if needed > 32 { Float64 } else { Float32 });
        }

        // Two integers.
        debug_assert!(self.is_integer() && other.is_integer());
        if self.is_signed() == other.is_signed() {
            return Some(if self.numeric_rank() >= other.numeric_rank() { self } else { other });
        }
        // Mixed signedness: a signed integer wide enough for both (NumPy rule).
        let (signed, unsigned) = if self.is_signed() { (self, other) } else { (other, self) };
        let needed_rank = unsigned.numeric_rank().max(signed.numeric_rank());
        Some(if unsigned.numeric_rank() >= signed.numeric_rank() {
            // Unsigned width >= signed width: need a wider signed type, capped at 64.
            Self::signed_of_width((needed_rank * 2).min(64))
        } else {
            signed
        })
    }

    /// The float width an integer of this width promotes to when paired
    /// with a float, per §3: int64/uint64 with float32 -> float64.
    const fn float_equivalent_width(self) -> u32 {
        if self.is_float() {
            return self.numeric_rank();
        }
        // Integers up to 32 bits fit float32's mantissa region per the
        // engine's rule; 64-bit integers force float64.
        if self.numeric_rank() > 32 { 64 } else { 32 }
    }

    const fn signed_of_width(width: u32) -> Self {
        match width {
            0..=8 => DType::Int8,
            9..=16 => DType::Int16,
            17..=32 => DType::Int32,
            _ => DType::Int64,
        }
    }

    /// Output dtype for `sum`/`prod` reductions (§3).
    pub const fn reduce_sum_prod_dtype(self) -> Option<Self> {
        use DType::*;
        Some(match self {
            Bool => Int64,
            Int8 | Int16 | Int32 | Int64 => Int64,
            UInt8 | UInt16 | UInt32 | UInt64 => UInt64,
            Float32 | Float64 => self,
            Complex64 | Complex128 => self,
            String | Auto => return None,
        })
    }

    /// Output dtype for `min`/`max` reductions: identity (element dtype),
    /// rejected for complex.
    pub const fn reduce_minmax_dtype(self) -> Option<Self> {
        if self.is_complex() {
            None
        } else if matches!(self, DType::String | DType::Auto) {
            None
        } else {
            Some(self)
        }
    }

    /// `any`/`all` always produce `Bool`.
    pub const fn reduce_any_all_dtype(self) -> Option<Self> {
        if matches!(self, DType::String | DType::Auto) { None } else { Some(DType::Bool) }
    }

    /// Whether a cast from `self` to `target` is permitted (§4.3): numeric
    /// <-> numeric/bool, never string <-> numeric.
    pub const fn castable_to(self, target: Self) -> bool {
        if self as u8 == target as u8 {
            return true;
        }
        match (self, target) {
            (DType::String, _) | (_, DType::String) => false,
            (DType::Auto, _) | (_, DType::Auto) => false,
            _ => true,
        }
    }

    /// The float dtype a transcendental argument is promoted to: integers
    /// go to `Float64`; `Float32` stays `Float32`; other floats stay.
    pub const fn transcendental_float(self) -> Option<Self> {
        if self.is_integer() || matches!(self, DType::Bool) {
            Some(DType::Float64)
        } else if self.is_float() {
            Some(self)
        } else {
            None
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::Bool => "bool",
            DType::Int8 => "int8",
            DType::Int16 => "int16",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::UInt8 => "uint8",
            DType::UInt16 => "uint16",
            DType::UInt32 => "uint32",
            DType::UInt64 => "uint64",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
            DType::Complex64 => "complex64",
            DType::Complex128 => "complex128",
            DType::String => "string",
            DType::Auto => "auto",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    fn non_string_types() -> Vec<DType> {
        DType::iter().filter(|d| *d != DType::String && *d != DType::Auto).collect()
    }

    #[test]
    fn promotion_is_commutative() {
        let types = non_string_types();
        for &a in &types {
            for &b in &types {
                assert_eq!(a.promote(b), b.promote(a), "promote({a}, {b}) not commutative");
            }
        }
    }

    #[test]
    fn promotion_is_total_over_non_string() {
        for &a in &non_string_types() {
            for &b in &non_string_types() {
                assert!(a.promote(b).is_some(), "promote({a}, {b}) undefined");
            }
        }
    }

    #[test]
    fn string_never_promotes_with_numeric() {
        for &a in &non_string_types() {
            assert_eq!(DType::String.promote(a), None);
        }
    }

    #[test]
    fn bool_promotes_to_partner() {
        assert_eq!(DType::Bool.promote(DType::Int32), Some(DType::Int32));
        assert_eq!(DType::Float64.promote(DType::Bool), Some(DType::Float64));
    }

    #[test]
    fn mixed_signedness_widens() {
        assert_eq!(DType::Int32.promote(DType::UInt32), Some(DType::Int64));
        assert_eq!(DType::Int64.promote(DType::UInt64), Some(DType::Int64));
    }

    #[test]
    fn int_float_widening_rule() {
        assert_eq!(DType::Int64.promote(DType::Float32), Some(DType::Float64));
        assert_eq!(DType::Int16.promote(DType::Float32), Some(DType::Float32));
    }

    #[test]
    fn reduction_output_dtypes() {
        assert_eq!(DType::Int32.reduce_sum_prod_dtype(), Some(DType::Int64));
        assert_eq!(DType::UInt32.reduce_sum_prod_dtype(), Some(DType::UInt64));
        assert_eq!(DType::Bool.reduce_sum_prod_dtype(), Some(DType::Int64));
        assert_eq!(DType::Complex128.reduce_minmax_dtype(), None);
        assert_eq!(DType::Bool.reduce_any_all_dtype(), Some(DType::Bool));
    }
}
