//! Bit-level conversions between f32 and IEEE 754 binary16.
//!
//! Synthesized constant payloads are frequently fp16. Until `f16` lands in
//! the standard library (rust-lang/rust#116909) the conversions are done by
//! hand on the raw bit patterns.

/// Convert an f32 value to f16 bits, rounding to nearest-even.
pub fn f32_to_f16(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xFF) as i32;
    let man = bits & 0x007F_FFFF;

    if exp == 0xFF {
        // Infinity or NaN. Keep the mantissa MSB set for NaN.
        let nan = if man != 0 {
            0x0200 | (man >> 13) as u16
        } else {
            0
        };
        return sign | 0x7C00 | nan;
    }

    let half_exp = exp - 127 + 15;
    if half_exp >= 0x1F {
        // Too large for f16, clamp to infinity.
        return sign | 0x7C00;
    }
    if half_exp <= 0 {
        if half_exp < -10 {
            // Smaller than the smallest subnormal, flush to signed zero.
            return sign;
        }
        // Subnormal result. Restore the hidden bit and shift into place.
        let man = man | 0x0080_0000;
        let shift = (14 - half_exp) as u32;
        let half_man = (man >> shift) as u16;
        let round_bit = 1u32 << (shift - 1);
        if (man & round_bit) != 0 && (man & (3 * round_bit - 1)) != 0 {
            return sign | (half_man + 1);
        }
        return sign | half_man;
    }

    let half = sign | ((half_exp as u16) << 10) | (man >> 13) as u16;
    let round_bit = 0x1000u32;
    if (man & round_bit) != 0 && (man & (3 * round_bit - 1)) != 0 {
        half + 1
    } else {
        half
    }
}

/// Convert f16 bits to an f32 value.
pub fn f16_to_f32(bits: u16) -> f32 {
    let sign = ((bits & 0x8000) as u32) << 16;
    let exp = ((bits >> 10) & 0x1F) as u32;
    let man = (bits & 0x03FF) as u32;

    match exp {
        0 if man == 0 => f32::from_bits(sign),
        0 => {
            // Subnormal, re-normalize for the wider exponent range.
            let top = 31 - man.leading_zeros();
            let exp32 = (top + 103) << 23;
            let man32 = (man << (23 - top)) & 0x007F_FFFF;
            f32::from_bits(sign | exp32 | man32)
        }
        0x1F => {
            let nan = if man != 0 {
                0x0040_0000 | (man << 13)
            } else {
                0
            };
            f32::from_bits(sign | 0x7F80_0000 | nan)
        }
        _ => f32::from_bits(sign | ((exp + 112) << 23) | (man << 13)),
    }
}

#[cfg(test)]
mod tests {
    use super::{f16_to_f32, f32_to_f16};

    #[test]
    fn test_round_trip_exact_values() {
        // Values exactly representable in f16 survive a round trip.
        let values = [
            0.0f32, -0.0, 1.0, -1.0, 0.5, 0.25, 0.0625, 2.0, 65504.0, -65504.0,
        ];
        for &v in &values {
            let round_tripped = f16_to_f32(f32_to_f16(v));
            assert_eq!(round_tripped.to_bits(), v.to_bits(), "value {}", v);
        }
    }

    #[test]
    fn test_rounding() {
        // 1/9 is not representable, but the f16 nearest neighbor is within
        // half an ulp (~2^-13 at this magnitude).
        let v = 1.0f32 / 9.0;
        let err = (f16_to_f32(f32_to_f16(v)) - v).abs();
        assert!(err <= v * (1.0 / 2048.0));
    }

    #[test]
    fn test_overflow_and_underflow() {
        assert_eq!(f16_to_f32(f32_to_f16(1e9)), f32::INFINITY);
        assert_eq!(f16_to_f32(f32_to_f16(-1e9)), f32::NEG_INFINITY);
        assert_eq!(f16_to_f32(f32_to_f16(1e-10)), 0.0);
    }

    #[test]
    fn test_subnormals() {
        // Smallest f16 subnormal is 2^-24.
        let tiny = 2.0f32.powi(-24);
        assert_eq!(f16_to_f32(f32_to_f16(tiny)), tiny);
        // Largest subnormal.
        let sub = 2.0f32.powi(-14) - 2.0f32.powi(-24);
        assert_eq!(f16_to_f32(f32_to_f16(sub)), sub);
    }

    #[test]
    fn test_nan() {
        assert!(f16_to_f32(f32_to_f16(f32::NAN)).is_nan());
    }
}
