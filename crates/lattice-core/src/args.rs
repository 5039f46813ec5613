//! Immutable channel argument maps
//!
//! A `ChannelArgs` is a persistent key-value map: every mutation returns a
//! new map and readers never lock. Values are integers, shared strings, or
//! typed pointers carrying a comparison vtable. Equality and ordering are
//! value-based throughout; pointer values that declare themselves "raw"
//! compare by identity and do not own their pointee.

use crate::constants::RESERVED_ARG_PREFIX;
use std::any::Any;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Comparison dispatch for owned pointer values
///
/// One static instance per pointee type; two pointer values compare
/// value-wise only when they share a vtable, otherwise they order by
/// vtable identity so the total order stays consistent.
pub struct PointerVtable {
    pub type_name: &'static str,
    pub cmp: fn(&(dyn Any + Send + Sync), &(dyn Any + Send + Sync)) -> CmpOrdering,
}

/// `PointerVtable::cmp` implementation comparing pointees by value
pub fn cmp_by_value<T: Any + Ord>(
    a: &(dyn Any + Send + Sync),
    b: &(dyn Any + Send + Sync),
) -> CmpOrdering {
    match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
        (Some(x), Some(y)) => x.cmp(y),
        // unreachable when both sides share the vtable
        _ => CmpOrdering::Equal,
    }
}

/// `PointerVtable::cmp` implementation comparing pointees by address
pub fn cmp_by_identity(
    a: &(dyn Any + Send + Sync),
    b: &(dyn Any + Send + Sync),
) -> CmpOrdering {
    let pa = a as *const _ as *const () as usize;
    let pb = b as *const _ as *const () as usize;
    pa.cmp(&pb)
}

#[derive(Clone)]
enum PointerKind {
    Owned {
        value: Arc<dyn Any + Send + Sync>,
        vtable: &'static PointerVtable,
    },
    /// Identity-only pointer; the map does not own the pointee
    Raw(usize),
}

/// A pointer-valued channel argument
#[derive(Clone)]
pub struct ArgPointer {
    kind: PointerKind,
}

impl ArgPointer {
    pub fn owned<T: Any + Send + Sync>(value: Arc<T>, vtable: &'static PointerVtable) -> Self {
        ArgPointer {
            kind: PointerKind::Owned {
                value,
                vtable,
            },
        }
    }

    pub fn raw(addr: usize) -> Self {
        ArgPointer {
            kind: PointerKind::Raw(addr),
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match &self.kind {
            PointerKind::Owned { value, .. } => value.downcast_ref::<T>(),
            PointerKind::Raw(_) => None,
        }
    }

    pub fn downcast_arc<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match &self.kind {
            PointerKind::Owned { value, .. } => value.clone().downcast::<T>().ok(),
            PointerKind::Raw(_) => None,
        }
    }

    pub fn raw_addr(&self) -> Option<usize> {
        match self.kind {
            PointerKind::Raw(addr) => Some(addr),
            PointerKind::Owned { .. } => None,
        }
    }

    fn cmp_pointer(&self, other: &ArgPointer) -> CmpOrdering {
        match (&self.kind, &other.kind) {
            (
                PointerKind::Owned { value: a, vtable: va },
                PointerKind::Owned { value: b, vtable: vb },
            ) => {
                if std::ptr::eq(*va, *vb) {
                    (va.cmp)(a.as_ref(), b.as_ref())
                } else {
                    va.type_name
                        .cmp(vb.type_name)
                        .then((*va as *const PointerVtable as usize).cmp(&(*vb as *const PointerVtable as usize)))
                }
            }
            (PointerKind::Raw(a), PointerKind::Raw(b)) => a.cmp(b),
            (PointerKind::Owned { .. }, PointerKind::Raw(_)) => CmpOrdering::Less,
            (PointerKind::Raw(_), PointerKind::Owned { .. }) => CmpOrdering::Greater,
        }
    }
}

impl fmt::Debug for ArgPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            PointerKind::Owned { vtable, .. } => write!(f, "Pointer<{}>", vtable.type_name),
            PointerKind::Raw(addr) => write!(f, "RawPointer({:#x})", addr),
        }
    }
}

/// A single channel argument value
#[derive(Clone, Debug)]
pub enum ArgValue {
    Int(i64),
    Str(Arc<str>),
    Pointer(ArgPointer),
}

impl ArgValue {
    fn rank(&self) -> u8 {
        match self {
            ArgValue::Int(_) => 0,
            ArgValue::Str(_) => 1,
            ArgValue::Pointer(_) => 2,
        }
    }
}

impl PartialEq for ArgValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for ArgValue {}

impl PartialOrd for ArgValue {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ArgValue {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        match (self, other) {
            (ArgValue::Int(a), ArgValue::Int(b)) => a.cmp(b),
            (ArgValue::Str(a), ArgValue::Str(b)) => a.as_ref().cmp(b.as_ref()),
            (ArgValue::Pointer(a), ArgValue::Pointer(b)) => a.cmp_pointer(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl From<i64> for ArgValue {
    fn from(v: i64) -> Self {
        ArgValue::Int(v)
    }
}

impl From<i32> for ArgValue {
    fn from(v: i32) -> Self {
        ArgValue::Int(i64::from(v))
    }
}

impl From<bool> for ArgValue {
    fn from(v: bool) -> Self {
        ArgValue::Int(i64::from(v))
    }
}

impl From<&str> for ArgValue {
    fn from(v: &str) -> Self {
        ArgValue::Str(Arc::from(v))
    }
}

impl From<String> for ArgValue {
    fn from(v: String) -> Self {
        ArgValue::Str(Arc::from(v))
    }
}

impl From<Arc<str>> for ArgValue {
    fn from(v: Arc<str>) -> Self {
        ArgValue::Str(v)
    }
}

impl From<ArgPointer> for ArgValue {
    fn from(v: ArgPointer) -> Self {
        ArgValue::Pointer(v)
    }
}

/// An immutable channel argument map
#[derive(Clone, Default)]
pub struct ChannelArgs {
    map: BTreeMap<Arc<str>, ArgValue>,
}

impl ChannelArgs {
    pub fn new() -> Self {
        ChannelArgs {
            map: BTreeMap::new(),
        }
    }

    /// Return a new map with `key` bound to `value`
    pub fn set(&self, key: impl Into<Arc<str>>, value: impl Into<ArgValue>) -> ChannelArgs {
        let mut map = self.map.clone();
        map.insert(key.into(), value.into());
        ChannelArgs { map }
    }

    /// Like [`set`](ChannelArgs::set) but keeps an existing binding
    pub fn set_if_unset(
        &self,
        key: impl Into<Arc<str>>,
        value: impl Into<ArgValue>,
    ) -> ChannelArgs {
        let key = key.into();
        if self.map.contains_key(&key) {
            self.clone()
        } else {
            self.set(key, value)
        }
    }

    /// Return a new map without `key`
    pub fn remove(&self, key: &str) -> ChannelArgs {
        let mut map = self.map.clone();
        map.remove(key);
        ChannelArgs { map }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&ArgValue> {
        self.map.get(key)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.map.get(key) {
            Some(ArgValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.map.get(key) {
            Some(ArgValue::Str(v)) => Some(v.as_ref()),
            _ => None,
        }
    }

    /// Integer argument interpreted as a flag; non-integer values and
    /// missing keys yield the default
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.map.get(key) {
            Some(ArgValue::Int(v)) => *v != 0,
            _ => default,
        }
    }

    pub fn get_pointer_ref<T: Any>(&self, key: &str) -> Option<&T> {
        match self.map.get(key) {
            Some(ArgValue::Pointer(p)) => p.downcast_ref::<T>(),
            _ => None,
        }
    }

    pub fn get_pointer_arc<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        match self.map.get(key) {
            Some(ArgValue::Pointer(p)) => p.downcast_arc::<T>(),
            _ => None,
        }
    }

    /// Merge with `other`; this map's entries win on key conflicts
    ///
    /// Both maps are immutable snapshots, so the union is deterministic.
    pub fn union_with(&self, other: &ChannelArgs) -> ChannelArgs {
        let mut map = other.map.clone();
        for (k, v) in &self.map {
            map.insert(k.clone(), v.clone());
        }
        ChannelArgs { map }
    }

    /// Strip keys under the reserved internal prefix
    ///
    /// Runs before channel args become user-visible; internal plumbing
    /// (the transport pointer, for one) never leaks out.
    pub fn precondition(&self) -> ChannelArgs {
        let map = self
            .map
            .iter()
            .filter(|(k, _)| !k.starts_with(RESERVED_ARG_PREFIX))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        ChannelArgs { map }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArgValue)> {
        self.map.iter().map(|(k, v)| (k.as_ref(), v))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl PartialEq for ChannelArgs {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for ChannelArgs {}

impl PartialOrd for ChannelArgs {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChannelArgs {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        let mut a = self.map.iter();
        let mut b = other.map.iter();
        loop {
            match (a.next(), b.next()) {
                (None, None) => return CmpOrdering::Equal,
                (None, Some(_)) => return CmpOrdering::Less,
                (Some(_), None) => return CmpOrdering::Greater,
                (Some((ka, va)), Some((kb, vb))) => {
                    let ord = ka.as_ref().cmp(kb.as_ref()).then_with(|| va.cmp(vb));
                    if ord != CmpOrdering::Equal {
                        return ord;
                    }
                }
            }
        }
    }
}

impl fmt::Debug for ChannelArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.map.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get() {
        let args = ChannelArgs::new().set("k1", 1i64).set("k2", "x");
        assert_eq!(args.get_int("k1"), Some(1));
        assert_eq!(args.get_str("k2"), Some("x"));
        assert_eq!(args.get_int("missing"), None);
    }

    #[test]
    fn test_set_is_persistent() {
        let a = ChannelArgs::new().set("k", 1i64);
        let b = a.set("k", 2i64);
        assert_eq!(a.get_int("k"), Some(1));
        assert_eq!(b.get_int("k"), Some(2));
    }

    #[test]
    fn test_set_if_unset() {
        let a = ChannelArgs::new().set("k", 1i64);
        let b = a.set_if_unset("k", 2i64).set_if_unset("j", 3i64);
        assert_eq!(b.get_int("k"), Some(1));
        assert_eq!(b.get_int("j"), Some(3));
    }

    #[test]
    fn test_union_with_receiver_wins() {
        let a = ChannelArgs::new().set("k1", 1i64).set("k2", "x");
        let b = ChannelArgs::new().set("k2", "y").set("k3", 2i64);

        let ab = a.union_with(&b);
        assert_eq!(ab.get_int("k1"), Some(1));
        assert_eq!(ab.get_str("k2"), Some("x"));
        assert_eq!(ab.get_int("k3"), Some(2));

        let ba = b.union_with(&a);
        assert_eq!(ba.get_int("k1"), Some(1));
        assert_eq!(ba.get_str("k2"), Some("y"));
        assert_eq!(ba.get_int("k3"), Some(2));
    }

    #[test]
    fn test_union_with_matches_reference() {
        // Reference semantics: iteratively set_if_unset each entry of
        // `other` into `self`.
        fn reference_union(a: &ChannelArgs, b: &ChannelArgs) -> ChannelArgs {
            let mut out = a.clone();
            for (k, v) in b.iter() {
                out = out.set_if_unset(k, v.clone());
            }
            out
        }

        // Deterministic pseudo-random key/value streams
        let mut seed = 0x2545_f491u64;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };
        for _ in 0..50 {
            let mut a = ChannelArgs::new();
            let mut b = ChannelArgs::new();
            for _ in 0..8 {
                let k = format!("k{}", next() % 12);
                if next() % 2 == 0 {
                    a = a.set(k, (next() % 100) as i64);
                } else {
                    b = b.set(k, format!("v{}", next() % 100));
                }
            }
            assert_eq!(a.union_with(&b), reference_union(&a, &b));
        }
    }

    #[test]
    fn test_union_commutative_on_disjoint_keys() {
        let a = ChannelArgs::new().set("a", 1i64);
        let b = ChannelArgs::new().set("b", 2i64);
        assert_eq!(a.union_with(&b), b.union_with(&a));
    }

    #[test]
    fn test_value_based_equality() {
        let a = ChannelArgs::new().set("k", "v").set("n", 3i64);
        let b = ChannelArgs::new().set("n", 3i64).set("k", "v");
        assert_eq!(a, b);
        let c = b.set("n", 4i64);
        assert_ne!(a, c);
        assert!(a < c);
    }

    #[test]
    fn test_owned_pointer_compares_by_value() {
        static VT: PointerVtable = PointerVtable {
            type_name: "test_config",
            cmp: cmp_by_value::<u32>,
        };
        let p1 = ArgPointer::owned(Arc::new(7u32), &VT);
        let p2 = ArgPointer::owned(Arc::new(7u32), &VT);
        let a = ChannelArgs::new().set("p", p1);
        let b = ChannelArgs::new().set("p", p2);
        assert_eq!(a, b);
        assert_eq!(a.get_pointer_ref::<u32>("p"), Some(&7));
    }

    #[test]
    fn test_raw_pointer_compares_by_identity() {
        let x = 1u8;
        let y = 1u8;
        let a = ChannelArgs::new().set("p", ArgPointer::raw(&x as *const u8 as usize));
        let b = ChannelArgs::new().set("p", ArgPointer::raw(&y as *const u8 as usize));
        let a2 = ChannelArgs::new().set("p", ArgPointer::raw(&x as *const u8 as usize));
        assert_ne!(a, b);
        assert_eq!(a, a2);
    }

    #[test]
    fn test_precondition_strips_internal_keys() {
        let args = ChannelArgs::new()
            .set("user.option", 1i64)
            .set("lattice.internal.transport", ArgPointer::raw(0xdead));
        let cleaned = args.precondition();
        assert!(cleaned.contains("user.option"));
        assert!(!cleaned.contains("lattice.internal.transport"));
    }

    #[test]
    fn test_remove() {
        let a = ChannelArgs::new().set("k", 1i64);
        let b = a.remove("k");
        assert!(a.contains("k"));
        assert!(!b.contains("k"));
    }

    #[test]
    fn test_get_bool_flag_semantics() {
        let args = ChannelArgs::new().set("on", 1i64).set("off", 0i64).set("s", "x");
        assert!(args.get_bool("on", false));
        assert!(!args.get_bool("off", true));
        assert!(args.get_bool("missing", true));
        assert!(!args.get_bool("missing", false));
        assert!(args.get_bool("s", true));
    }
}
