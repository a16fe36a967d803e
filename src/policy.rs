use std::collections::HashSet;
use std::fmt;

use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::Deserialize;

/// Which namespace a module name belongs to.
///
/// Classification is decided by the host runtime's builtin registry
/// (see `resolver::BuiltinRegistry`), never by this policy: a name
/// classified as builtin is only ever checked against the builtin
/// allow-set, and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleClass {
    /// Built-in host facility (e.g. "fs", "process").
    Builtin,
    /// External package installed alongside the sandbox.
    External,
}

/// An allowlist of module names, or the `"*"` wildcard admitting all.
///
/// Membership is exact and case-sensitive. In the TOML config this
/// deserializes from either a list of names or the string `"*"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowSet {
    /// Every name of this classification is permitted.
    Wildcard,
    /// Only the listed names are permitted.
    Explicit(HashSet<String>),
}

impl AllowSet {
    /// An allow-set that admits every name.
    pub fn wildcard() -> Self {
        AllowSet::Wildcard
    }

    /// An allow-set admitting exactly the given names.
    pub fn explicit<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AllowSet::Explicit(names.into_iter().map(Into::into).collect())
    }

    /// An allow-set that rejects every name.
    pub fn empty() -> Self {
        AllowSet::Explicit(HashSet::new())
    }

    /// Checks whether `name` is admitted by this allow-set.
    pub fn permits(&self, name: &str) -> bool {
        match self {
            AllowSet::Wildcard => true,
            AllowSet::Explicit(names) => names.contains(name),
        }
    }
}

impl Default for AllowSet {
    /// Deny-all: an absent allow-set admits nothing.
    fn default() -> Self {
        AllowSet::empty()
    }
}

impl<'de> Deserialize<'de> for AllowSet {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct AllowSetVisitor;

        impl<'de> Visitor<'de> for AllowSetVisitor {
            type Value = AllowSet;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a list of module names or the string \"*\"")
            }

            fn visit_str<E>(self, value: &str) -> Result<AllowSet, E>
            where
                E: de::Error,
            {
                if value == "*" {
                    Ok(AllowSet::Wildcard)
                } else {
                    Err(E::custom(format!(
                        "expected \"*\" or a list of module names, got \"{value}\""
                    )))
                }
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<AllowSet, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut names = HashSet::new();
                while let Some(name) = seq.next_element::<String>()? {
                    names.insert(name);
                }
                Ok(AllowSet::Explicit(names))
            }
        }

        deserializer.deserialize_any(AllowSetVisitor)
    }
}

/// Immutable admission policy for the capability gate.
///
/// Supplied once per sandbox instance at resolver construction and
/// never mutated afterward. Both allow-sets default to deny-all.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SandboxPolicy {
    /// Built-in host facilities untrusted code may load.
    #[serde(default)]
    pub allowed_builtin_modules: AllowSet,
    /// External packages untrusted code may load.
    #[serde(default)]
    pub allowed_external_modules: AllowSet,
}

impl SandboxPolicy {
    /// Checks admission of `name` against the allow-set matching its
    /// classification. The other allow-set is never consulted.
    pub fn admits(&self, class: ModuleClass, name: &str) -> bool {
        match class {
            ModuleClass::Builtin => self.allowed_builtin_modules.permits(name),
            ModuleClass::External => self.allowed_external_modules.permits(name),
        }
    }
}
