//! String interning for identifiers and short literals.
//!
//! Name-shaped strings (attribute names, variable names, module names, the
//! dunder vocabulary) are stored once per interpreter and referenced by
//! [`StringId`]. This keeps `Value` small, makes name comparison an integer
//! compare, and lets code objects refer to names without owning them.
//!
//! StringIds are laid out in three bands:
//! * `0..128` — single-character strings for the 128 ASCII characters
//! * `1000..1000+count(StaticStrings)` — names known at compile time
//! * `10_000..` — strings interned at runtime, per interpreter

use std::sync::LazyLock;

use ahash::AHashMap;
use strum::{EnumString, FromRepr, IntoStaticStr};

/// Index into the interner's storage.
///
/// `u32` keeps `Value` and code-object tables small; ~4 billion unique
/// names is far more than any program needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct StringId(u32);

const STATIC_STRING_ID_OFFSET: u32 = 1000;
const RUNTIME_STRING_ID_OFFSET: u32 = 10_000;

impl StringId {
    /// Reconstructs a StringId from a bytecode operand.
    ///
    /// The caller is responsible for the index being valid for the
    /// interner that produced it.
    #[inline]
    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw index, for embedding in bytecode operands.
    #[inline]
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Returns the id of a single-character ASCII string.
    #[must_use]
    pub fn from_ascii(byte: u8) -> Self {
        debug_assert!(byte < 128);
        Self(u32::from(byte))
    }
}

impl From<StaticStrings> for StringId {
    fn from(s: StaticStrings) -> Self {
        Self(STATIC_STRING_ID_OFFSET + s as u32)
    }
}

/// The 128 single-character ASCII strings, leaked once for `'static` access.
static ASCII_STRS: LazyLock<[&'static str; 128]> = LazyLock::new(|| {
    std::array::from_fn(|i| {
        let s = char::from(u8::try_from(i).expect("index in u8 range")).to_string();
        &*Box::leak(s.into_boxed_str())
    })
});

/// Names known at compile time; never hit the runtime interner.
///
/// The `#[repr(u16)]` discriminant doubles as the offset within the static
/// band, so converting to/from [`StringId`] is arithmetic only.
#[repr(u16)]
#[derive(Debug, Clone, Copy, FromRepr, EnumString, IntoStaticStr, PartialEq, Eq, Hash)]
#[strum(serialize_all = "snake_case")]
pub enum StaticStrings {
    #[strum(serialize = "")]
    EmptyString,
    #[strum(serialize = "<module>")]
    Module,
    #[strum(serialize = "<lambda>")]
    Lambda,
    #[strum(serialize = "<listcomp>")]
    ListComp,
    #[strum(serialize = "<genexpr>")]
    GenExpr,

    // Dunder vocabulary used by the engine itself.
    #[strum(serialize = "__init__")]
    DunderInit,
    #[strum(serialize = "__new__")]
    DunderNew,
    #[strum(serialize = "__call__")]
    DunderCall,
    #[strum(serialize = "__name__")]
    DunderName,
    #[strum(serialize = "__dict__")]
    DunderDict,
    #[strum(serialize = "__bases__")]
    DunderBases,
    #[strum(serialize = "__mro__")]
    DunderMro,
    #[strum(serialize = "__class__")]
    DunderClass,
    #[strum(serialize = "__slots__")]
    DunderSlots,
    #[strum(serialize = "__doc__")]
    DunderDoc,
    #[strum(serialize = "__module__")]
    DunderModule,
    #[strum(serialize = "__package__")]
    DunderPackage,
    #[strum(serialize = "__repr__")]
    DunderRepr,
    #[strum(serialize = "__str__")]
    DunderStr,
    #[strum(serialize = "__bool__")]
    DunderBool,
    #[strum(serialize = "__len__")]
    DunderLen,
    #[strum(serialize = "__hash__")]
    DunderHash,
    #[strum(serialize = "__eq__")]
    DunderEq,
    #[strum(serialize = "__ne__")]
    DunderNe,
    #[strum(serialize = "__lt__")]
    DunderLt,
    #[strum(serialize = "__le__")]
    DunderLe,
    #[strum(serialize = "__gt__")]
    DunderGt,
    #[strum(serialize = "__ge__")]
    DunderGe,
    #[strum(serialize = "__add__")]
    DunderAdd,
    #[strum(serialize = "__radd__")]
    DunderRadd,
    #[strum(serialize = "__sub__")]
    DunderSub,
    #[strum(serialize = "__rsub__")]
    DunderRsub,
    #[strum(serialize = "__mul__")]
    DunderMul,
    #[strum(serialize = "__rmul__")]
    DunderRmul,
    #[strum(serialize = "__truediv__")]
    DunderTruediv,
    #[strum(serialize = "__rtruediv__")]
    DunderRtruediv,
    #[strum(serialize = "__floordiv__")]
    DunderFloordiv,
    #[strum(serialize = "__mod__")]
    DunderMod,
    #[strum(serialize = "__pow__")]
    DunderPow,
    #[strum(serialize = "__neg__")]
    DunderNeg,
    #[strum(serialize = "__iter__")]
    DunderIter,
    #[strum(serialize = "__next__")]
    DunderNext,
    #[strum(serialize = "__getitem__")]
    DunderGetitem,
    #[strum(serialize = "__setitem__")]
    DunderSetitem,
    #[strum(serialize = "__delitem__")]
    DunderDelitem,
    #[strum(serialize = "__contains__")]
    DunderContains,
    #[strum(serialize = "__enter__")]
    DunderEnter,
    #[strum(serialize = "__exit__")]
    DunderExit,
    #[strum(serialize = "__getattr__")]
    DunderGetattr,
    #[strum(serialize = "__match_args__")]
    DunderMatchArgs,
    #[strum(serialize = "__main__")]
    DunderMain,
    #[strum(serialize = "__builtins__")]
    DunderBuiltins,
    #[strum(serialize = "__file__")]
    DunderFile,
    #[strum(serialize = "__all__")]
    DunderAll,

    // Generator / exception protocol names.
    Send,
    Throw,
    Close,
    Args,
    Value,
    #[strum(serialize = "add_note")]
    AddNote,
    #[strum(serialize = "with_traceback")]
    WithTraceback,

    // Names the kernel looks up on objects.
    Object,
    Type,
    #[strum(serialize = "self")]
    SelfArg,
    Keys,
    Get,
    Items,
    Append,
}

impl StaticStrings {
    const COUNT: u32 = Self::Append as u32 + 1;

    /// Resolves a static string to its text.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

/// Per-interpreter string interner.
///
/// Lookup of the two fixed bands needs no state; the runtime band is a
/// vector plus a dedup map. Double-checked insertion is unnecessary here
/// because the interner is owned by a single interpreter; only the static
/// bands are process-global (and immutable).
#[derive(Debug, Default)]
pub struct Interns {
    strings: Vec<Box<str>>,
    lookup: AHashMap<Box<str>, StringId>,
}

impl Interns {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a string, returning its id.
    ///
    /// Single ASCII characters and static names resolve to the fixed bands
    /// without touching the runtime table.
    pub fn intern(&mut self, s: &str) -> StringId {
        if s.len() == 1 {
            let byte = s.as_bytes()[0];
            if byte < 128 {
                return StringId::from_ascii(byte);
            }
        }
        if let Ok(fixed) = s.parse::<StaticStrings>() {
            return fixed.into();
        }
        if let Some(&id) = self.lookup.get(s) {
            return id;
        }
        let id = StringId(RUNTIME_STRING_ID_OFFSET + u32::try_from(self.strings.len()).expect("interner overflow"));
        let boxed: Box<str> = s.into();
        self.strings.push(boxed.clone());
        self.lookup.insert(boxed, id);
        id
    }

    /// Resolves an id back to its text.
    ///
    /// # Panics
    /// Panics on an id from a different interner.
    #[must_use]
    pub fn get_str(&self, id: StringId) -> &str {
        let raw = id.0;
        if raw < 128 {
            return ASCII_STRS[raw as usize];
        }
        if raw >= RUNTIME_STRING_ID_OFFSET {
            return &self.strings[(raw - RUNTIME_STRING_ID_OFFSET) as usize];
        }
        debug_assert!(raw >= STATIC_STRING_ID_OFFSET && raw - STATIC_STRING_ID_OFFSET < StaticStrings::COUNT);
        StaticStrings::from_repr((raw - STATIC_STRING_ID_OFFSET) as u16)
            .expect("StringId outside all interner bands")
            .as_str()
    }

    /// Number of runtime-interned strings (static bands excluded).
    #[must_use]
    pub fn runtime_count(&self) -> usize {
        self.strings.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_band_needs_no_table() {
        let mut interns = Interns::new();
        let a = interns.intern("a");
        assert_eq!(a, StringId::from_ascii(b'a'));
        assert_eq!(interns.get_str(a), "a");
        assert_eq!(interns.runtime_count(), 0);
    }

    #[test]
    fn static_band_round_trips() {
        let mut interns = Interns::new();
        let id = interns.intern("__init__");
        assert_eq!(id, StringId::from(StaticStrings::DunderInit));
        assert_eq!(interns.get_str(id), "__init__");
        assert_eq!(interns.runtime_count(), 0);
    }

    #[test]
    fn runtime_band_dedups() {
        let mut interns = Interns::new();
        let first = interns.intern("spam_eggs");
        let second = interns.intern("spam_eggs");
        assert_eq!(first, second);
        assert_eq!(interns.get_str(first), "spam_eggs");
        assert_eq!(interns.runtime_count(), 1);
    }
}
