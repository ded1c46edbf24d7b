//! The host-visible `Value` representation: a 16-byte union that backs
//! literal folding, `@ret` storage, and argument-frame slots.

/// A 16-byte, 16-byte-aligned value holding up to four 32-bit ints, four
/// 32-bit floats, or two 64-bit doubles. Width-3/4 `double` vectors occupy
/// two consecutive `Value` slots (see [`Wide`]).
#[derive(Clone, Copy)]
#[repr(C, align(16))]
pub union Value {
    pub i32x4: [i32; 4],
    pub u32x4: [u32; 4],
    pub f32x4: [f32; 4],
    pub f64x2: [f64; 2],
    pub bytes: [u8; 16],
}

impl Value {
    pub const ZERO: Value = Value { bytes: [0; 16] };

    pub fn from_i32(v: i32) -> Value {
        Value { i32x4: [v, 0, 0, 0] }
    }

    pub fn from_f32(v: f32) -> Value {
        Value { f32x4: [v, 0.0, 0.0, 0.0] }
    }

    pub fn from_f64(v: f64) -> Value {
        Value { f64x2: [v, 0.0] }
    }

    pub fn from_bool(v: bool) -> Value {
        Value::from_i32(v as i32)
    }

    pub fn i32_lane(&self, lane: usize) -> i32 {
        unsafe { self.i32x4[lane] }
    }

    pub fn f32_lane(&self, lane: usize) -> f32 {
        unsafe { self.f32x4[lane] }
    }

    pub fn f64_lane(&self, lane: usize) -> f64 {
        unsafe { self.f64x2[lane] }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // We don't know the intended scalar kind here, so print all
        // interpretations; callers that know the type format through the
        // typed accessors instead.
        unsafe { write!(f, "Value({:?})", self.bytes) }
    }
}

/// A pair of consecutive 16-byte [`Value`] slots, used for width-3/4
/// `double` vectors (32 bytes total).
#[derive(Clone, Copy, Debug)]
pub struct Wide(pub Value, pub Value);

impl Wide {
    pub fn from_f64x4(v: [f64; 4]) -> Wide {
        Wide(Value { f64x2: [v[0], v[1]] }, Value { f64x2: [v[2], v[3]] })
    }
}
