//! Typed operator attributes and instance-over-default resolution.
//!
//! An [`AttrMap`] is immutable once built and cheap to clone. Kernels and gradient
//! functions never read a single map directly; they go through [`ComposedAttrMap`], which
//! consults the instance map first and the operator definition's defaults second.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{OpError, Result};
use crate::tensor::Shape;

/// One attribute value from the closed set supported by operator definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttrValue {
    Bool(bool),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    String(String),
    Shape(Shape),
    List(Vec<AttrValue>),
}

impl AttrValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            AttrValue::Bool(_) => "bool",
            AttrValue::I32(_) => "i32",
            AttrValue::I64(_) => "i64",
            AttrValue::F32(_) => "f32",
            AttrValue::F64(_) => "f64",
            AttrValue::String(_) => "string",
            AttrValue::Shape(_) => "shape",
            AttrValue::List(_) => "list",
        }
    }
}

/// Conversion from a stored [`AttrValue`] into a concrete Rust type.
///
/// No implicit widening happens: an `i32` attribute read as `i64` is a type mismatch.
pub trait FromAttrValue: Sized {
    const TYPE_NAME: &'static str;

    fn from_attr_value(value: &AttrValue) -> Option<Self>;
}

macro_rules! impl_attr_scalar {
    ($ty:ty, $variant:ident, $name:literal) => {
        impl FromAttrValue for $ty {
            const TYPE_NAME: &'static str = $name;

            fn from_attr_value(value: &AttrValue) -> Option<Self> {
                match value {
                    AttrValue::$variant(inner) => Some(inner.clone()),
                    _ => None,
                }
            }
        }

        impl From<$ty> for AttrValue {
            fn from(value: $ty) -> Self {
                AttrValue::$variant(value)
            }
        }
    };
}

impl_attr_scalar!(bool, Bool, "bool");
impl_attr_scalar!(i32, I32, "i32");
impl_attr_scalar!(i64, I64, "i64");
impl_attr_scalar!(f32, F32, "f32");
impl_attr_scalar!(f64, F64, "f64");
impl_attr_scalar!(String, String, "string");
impl_attr_scalar!(Shape, Shape, "shape");

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::String(value.to_string())
    }
}

impl<T: FromAttrValue> FromAttrValue for Vec<T> {
    const TYPE_NAME: &'static str = "list";

    fn from_attr_value(value: &AttrValue) -> Option<Self> {
        match value {
            AttrValue::List(items) => items.iter().map(T::from_attr_value).collect(),
            _ => None,
        }
    }
}

impl<T: Into<AttrValue>> From<Vec<T>> for AttrValue {
    fn from(values: Vec<T>) -> Self {
        AttrValue::List(values.into_iter().map(Into::into).collect())
    }
}

fn cast_attr<T: FromAttrValue>(name: &str, value: &AttrValue) -> Result<T> {
    T::from_attr_value(value).ok_or_else(|| OpError::AttrTypeMismatch {
        name: name.to_string(),
        expected: T::TYPE_NAME,
        actual: value.type_name(),
    })
}

/// Content hash of an attribute map, used to detect attribute changes between invocations.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttrFingerprint([u8; 32]);

impl fmt::Debug for AttrFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Immutable name → value mapping.
#[derive(Clone, Default, PartialEq)]
pub struct AttrMap {
    entries: Arc<BTreeMap<String, AttrValue>>,
}

impl AttrMap {
    pub fn new() -> Self {
        AttrMap::default()
    }

    pub fn builder() -> AttrMapBuilder {
        AttrMapBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Typed lookup against this map alone.
    pub fn get_attr<T: FromAttrValue>(&self, name: &str) -> Result<T> {
        let value = self.get(name).ok_or_else(|| OpError::AttrNotFound {
            name: name.to_string(),
        })?;
        cast_attr(name, value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Returns a new map holding every entry of `self` shadowed by the entries of `overrides`.
    pub fn merged_with(&self, overrides: &AttrMap) -> AttrMap {
        if overrides.is_empty() {
            return self.clone();
        }
        let mut entries = (*self.entries).clone();
        for (name, value) in overrides.entries.iter() {
            entries.insert(name.clone(), value.clone());
        }
        AttrMap {
            entries: Arc::new(entries),
        }
    }

    /// Hashes every `(name, value)` pair in name order, floats by their exact bit pattern.
    pub fn fingerprint(&self) -> AttrFingerprint {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"opcore:attr-map:v2");
        hasher.update(&(self.entries.len() as u64).to_le_bytes());
        for (name, value) in self.entries.iter() {
            hash_bytes(&mut hasher, name.as_bytes());
            hash_attr_value(&mut hasher, value);
        }
        AttrFingerprint(*hasher.finalize().as_bytes())
    }
}

fn hash_bytes(hasher: &mut blake3::Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn hash_attr_value(hasher: &mut blake3::Hasher, value: &AttrValue) {
    match value {
        AttrValue::Bool(v) => {
            hasher.update(&[0, u8::from(*v)]);
        }
        AttrValue::I32(v) => {
            hasher.update(&[1]);
            hasher.update(&v.to_le_bytes());
        }
        AttrValue::I64(v) => {
            hasher.update(&[2]);
            hasher.update(&v.to_le_bytes());
        }
        AttrValue::F32(v) => {
            hasher.update(&[3]);
            hasher.update(&v.to_bits().to_le_bytes());
        }
        AttrValue::F64(v) => {
            hasher.update(&[4]);
            hasher.update(&v.to_bits().to_le_bytes());
        }
        AttrValue::String(v) => {
            hasher.update(&[5]);
            hash_bytes(hasher, v.as_bytes());
        }
        AttrValue::Shape(shape) => {
            hasher.update(&[6]);
            hasher.update(&(shape.rank() as u64).to_le_bytes());
            for dim in shape.dims() {
                hasher.update(&(*dim as u64).to_le_bytes());
            }
        }
        AttrValue::List(items) => {
            hasher.update(&[7]);
            hasher.update(&(items.len() as u64).to_le_bytes());
            for item in items {
                hash_attr_value(hasher, item);
            }
        }
    }
}

impl fmt::Debug for AttrMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.iter()).finish()
    }
}

impl<K: Into<String>, V: Into<AttrValue>> FromIterator<(K, V)> for AttrMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let entries = iter
            .into_iter()
            .map(|(name, value)| (name.into(), value.into()))
            .collect();
        AttrMap {
            entries: Arc::new(entries),
        }
    }
}

#[derive(Default)]
pub struct AttrMapBuilder {
    entries: BTreeMap<String, AttrValue>,
}

impl AttrMapBuilder {
    pub fn set(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.entries.insert(name.into(), value.into());
        self
    }

    pub fn build(self) -> AttrMap {
        AttrMap {
            entries: Arc::new(self.entries),
        }
    }
}

/// Two-level view: instance attributes shadow definition defaults.
#[derive(Clone, Copy)]
pub struct ComposedAttrMap<'a> {
    instance: &'a AttrMap,
    defaults: &'a AttrMap,
}

impl<'a> ComposedAttrMap<'a> {
    pub fn new(instance: &'a AttrMap, defaults: &'a AttrMap) -> Self {
        ComposedAttrMap { instance, defaults }
    }

    pub fn get(&self, name: &str) -> Option<&'a AttrValue> {
        self.instance.get(name).or_else(|| self.defaults.get(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn get_attr<T: FromAttrValue>(&self, name: &str) -> Result<T> {
        let value = self.get(name).ok_or_else(|| OpError::AttrNotFound {
            name: name.to_string(),
        })?;
        cast_attr(name, value)
    }

    pub fn instance(&self) -> &'a AttrMap {
        self.instance
    }

    pub fn defaults(&self) -> &'a AttrMap {
        self.defaults
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_shadows_defaults() {
        let defaults = AttrMap::builder().set("a", 1i32).set("b", 2i32).build();
        let instance = AttrMap::builder().set("a", 5i32).build();
        let composed = ComposedAttrMap::new(&instance, &defaults);

        assert_eq!(composed.get_attr::<i32>("a").unwrap(), 5);
        assert_eq!(composed.get_attr::<i32>("b").unwrap(), 2);
        assert_eq!(
            composed.get_attr::<i32>("c").unwrap_err(),
            OpError::AttrNotFound { name: "c".into() }
        );
    }

    #[test]
    fn type_mismatch_names_both_types() {
        let attrs = AttrMap::builder().set("diagonal", 1i32).build();
        let err = attrs.get_attr::<i64>("diagonal").unwrap_err();
        assert_eq!(
            err,
            OpError::AttrTypeMismatch {
                name: "diagonal".into(),
                expected: "i64",
                actual: "i32",
            }
        );
    }

    #[test]
    fn lists_convert_elementwise() {
        let attrs = AttrMap::builder()
            .set("perm", vec![2i64, 0, 1])
            .set("mixed", AttrValue::List(vec![1i64.into(), "x".into()]))
            .build();
        assert_eq!(attrs.get_attr::<Vec<i64>>("perm").unwrap(), vec![2, 0, 1]);
        assert!(attrs.get_attr::<Vec<i64>>("mixed").is_err());
    }

    #[test]
    fn fingerprint_tracks_content_not_identity() {
        let first = AttrMap::builder().set("scale", 0.5f32).set("axis", 1i32).build();
        let second: AttrMap = [("axis", AttrValue::I32(1)), ("scale", AttrValue::F32(0.5))]
            .into_iter()
            .collect();
        assert_eq!(first.fingerprint(), second.fingerprint());

        let changed = first.merged_with(&AttrMap::builder().set("scale", 0.25f32).build());
        assert_ne!(first.fingerprint(), changed.fingerprint());
        assert_eq!(changed.get_attr::<i32>("axis").unwrap(), 1);
    }

    #[test]
    fn fingerprint_separates_non_finite_and_typed_values() {
        let single = |value: AttrValue| AttrMap::builder().set("v", value).build().fingerprint();
        let distinct = [
            (AttrValue::F32(f32::NEG_INFINITY), AttrValue::F32(f32::INFINITY)),
            (AttrValue::F32(f32::NAN), AttrValue::F32(f32::INFINITY)),
            (AttrValue::F32(-0.0), AttrValue::F32(0.0)),
            (AttrValue::F64(f64::NEG_INFINITY), AttrValue::F64(f64::INFINITY)),
            (AttrValue::F64(f64::NAN), AttrValue::F64(f64::NEG_INFINITY)),
            (AttrValue::F64(-0.0), AttrValue::F64(0.0)),
            (AttrValue::I32(1), AttrValue::I64(1)),
            (AttrValue::F32(1.0), AttrValue::F64(1.0)),
            (AttrValue::I32(1), AttrValue::List(vec![AttrValue::I32(1)])),
            (AttrValue::I32(1), AttrValue::String("1".into())),
        ];
        for (left, right) in distinct {
            assert_ne!(single(left.clone()), single(right.clone()), "{left:?} vs {right:?}");
        }
        assert_eq!(single(AttrValue::F32(f32::NAN)), single(AttrValue::F32(f32::NAN)));

        let split = AttrMap::builder().set("ab", "c").build();
        let joined = AttrMap::builder().set("a", "bc").build();
        assert_ne!(split.fingerprint(), joined.fingerprint());
    }
}
