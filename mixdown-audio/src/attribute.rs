//! Voice attributes - tagged values shared between control and mixer threads

use crate::error::AudioError;
use std::sync::atomic::{AtomicU32, Ordering};

/// Lowest playback rate multiplier
pub const MIN_RATE: f32 = 0.25;
/// Highest playback rate multiplier
pub const MAX_RATE: f32 = 4.0;

/// Attribute selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeKind {
    /// Gain multiplier, 0.0 or more (float)
    Volume,
    /// Playback speed multiplier in `MIN_RATE..=MAX_RATE`, drives the
    /// resampler (float)
    Rate,
    /// Keep pitch constant while rate changes (bool)
    PitchCorrection,
    /// Stereo balance, -1.0 (left) to 1.0 (right) (float)
    Pan,
    /// Restart from the beginning when the source runs out (bool)
    Looping,
}

impl AttributeKind {
    /// Whether this attribute carries a float (as opposed to a bool)
    pub fn is_float(self) -> bool {
        matches!(
            self,
            AttributeKind::Volume | AttributeKind::Rate | AttributeKind::Pan
        )
    }
}

impl TryFrom<u32> for AttributeKind {
    type Error = AudioError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(AttributeKind::Volume),
            1 => Ok(AttributeKind::Rate),
            2 => Ok(AttributeKind::PitchCorrection),
            3 => Ok(AttributeKind::Pan),
            4 => Ok(AttributeKind::Looping),
            _ => Err(AudioError::invalid_argument(format!(
                "unknown attribute code {code}"
            ))),
        }
    }
}

/// Attribute payload
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AttributeValue {
    Float(f32),
    Bool(bool),
}

impl AttributeValue {
    pub fn as_float(self) -> Option<f32> {
        match self {
            AttributeValue::Float(v) => Some(v),
            AttributeValue::Bool(_) => None,
        }
    }

    pub fn as_bool(self) -> Option<bool> {
        match self {
            AttributeValue::Bool(v) => Some(v),
            AttributeValue::Float(_) => None,
        }
    }
}

/// Check that `value` carries the tag `kind` expects and lies in the
/// attribute's legal range. Accepted values are returned unchanged.
pub fn validate(kind: AttributeKind, value: AttributeValue) -> Result<AttributeValue, AudioError> {
    match (kind, value) {
        (AttributeKind::PitchCorrection | AttributeKind::Looping, AttributeValue::Bool(_)) => {
            Ok(value)
        }
        (AttributeKind::Volume | AttributeKind::Rate | AttributeKind::Pan, AttributeValue::Float(v)) => {
            if !v.is_finite() {
                return Err(AudioError::invalid_argument(format!(
                    "{kind:?} must be finite, got {v}"
                )));
            }
            let (low, high) = match kind {
                AttributeKind::Volume => (0.0, f32::INFINITY),
                AttributeKind::Rate => (MIN_RATE, MAX_RATE),
                _ => (-1.0, 1.0),
            };
            if !(low..=high).contains(&v) {
                return Err(AudioError::invalid_argument(format!(
                    "{kind:?} must be in {low}..={high}, got {v}"
                )));
            }
            Ok(value)
        }
        _ => Err(AudioError::invalid_argument(format!(
            "invalid type for {kind:?}: {value:?}"
        ))),
    }
}

/// f32 stored as bits in an `AtomicU32`
#[derive(Debug)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    #[inline]
    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_mismatch_rejected() {
        let err = validate(AttributeKind::Looping, AttributeValue::Float(1.0)).unwrap_err();
        assert!(matches!(err, AudioError::InvalidArgument(_)));

        let err = validate(AttributeKind::Volume, AttributeValue::Bool(true)).unwrap_err();
        assert!(matches!(err, AudioError::InvalidArgument(_)));
    }

    #[test]
    fn test_out_of_range_rejected() {
        for (kind, v) in [
            (AttributeKind::Pan, 3.0),
            (AttributeKind::Rate, 10.0),
            (AttributeKind::Rate, 0.1),
            (AttributeKind::Rate, 0.0),
            (AttributeKind::Volume, -1.0),
            (AttributeKind::Volume, f32::NAN),
        ] {
            let err = validate(kind, AttributeValue::Float(v)).unwrap_err();
            assert!(matches!(err, AudioError::InvalidArgument(_)), "{kind:?} {v}");
        }
    }

    #[test]
    fn test_in_range_kept_exactly() {
        for (kind, v) in [
            (AttributeKind::Rate, MAX_RATE),
            (AttributeKind::Rate, MIN_RATE),
            (AttributeKind::Rate, 1.37),
            (AttributeKind::Volume, 3.5),
            (AttributeKind::Pan, -1.0),
        ] {
            assert_eq!(
                validate(kind, AttributeValue::Float(v)).unwrap(),
                AttributeValue::Float(v)
            );
        }
    }

    #[test]
    fn test_raw_codes() {
        assert_eq!(AttributeKind::try_from(3).unwrap(), AttributeKind::Pan);
        assert!(AttributeKind::try_from(9).is_err());
    }

    #[test]
    fn test_atomic_f32() {
        let a = AtomicF32::new(0.5);
        assert_eq!(a.load(), 0.5);
        a.store(-2.25);
        assert_eq!(a.load(), -2.25);
    }
}
