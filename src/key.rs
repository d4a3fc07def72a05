//! Resource identity: argument values and the interned `(path, args)` key.

use std::fmt;

use serde::ser::SerializeSeq;
use serde::{Serialize, Serializer};

/// A single argument of a resource instance.
///
/// Integers are stored as `i64`. Types that always fit convert with
/// [`From`]; `u64`, `usize` and `isize` convert with [`TryFrom`] and fail
/// when the value is out of range.
///
/// Resource identity is structural: two keys are equal when their paths and
/// normalized argument sequences are equal, regardless of where the values
/// came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(untagged)]
pub enum Arg {
    /// An integer argument.
    Int(i64),
    /// A string argument, also the normalized form of every [`PathKey`].
    Str(String),
}

impl Arg {
    /// Normalize a domain type into an argument through its stable path key.
    pub fn key<K: PathKey + ?Sized>(key: &K) -> Self {
        Arg::Str(key.path_key())
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Int(n) => write!(f, "{n}"),
            Arg::Str(s) => f.write_str(s),
        }
    }
}

/// Types that can be used as resource arguments by converting to a stable
/// string key.
///
/// The key must be stable: equal values must produce equal keys, otherwise
/// the same resource instance will be built more than once.
pub trait PathKey {
    /// The normalized key for this value.
    fn path_key(&self) -> String;
}

macro_rules! impl_int_arg {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Arg {
                fn from(n: $ty) -> Self {
                    Arg::Int(i64::from(n))
                }
            }
        )*
    };
}

impl_int_arg!(i8, i16, i32, i64, u8, u16, u32);

macro_rules! impl_try_int_arg {
    ($($ty:ty),*) => {
        $(
            impl TryFrom<$ty> for Arg {
                type Error = std::num::TryFromIntError;

                fn try_from(n: $ty) -> Result<Self, Self::Error> {
                    i64::try_from(n).map(Arg::Int)
                }
            }
        )*
    };
}

impl_try_int_arg!(u64, usize, isize);

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg::Str(s.to_owned())
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Arg::Str(s)
    }
}

impl From<&String> for Arg {
    fn from(s: &String) -> Self {
        Arg::Str(s.clone())
    }
}

/// Conversion into the argument sequence of a resource lookup.
///
/// Implemented for `()`, tuples of up to four `Into<Arg>` values, `Vec<Arg>`
/// and `&[Arg]`, so lookups read as `resources.get::<T>("/path", (1, "x"))`.
pub trait IntoArgs {
    /// Convert into a normalized argument vector.
    fn into_args(self) -> Vec<Arg>;
}

impl IntoArgs for () {
    fn into_args(self) -> Vec<Arg> {
        Vec::new()
    }
}

impl IntoArgs for Vec<Arg> {
    fn into_args(self) -> Vec<Arg> {
        self
    }
}

impl IntoArgs for &[Arg] {
    fn into_args(self) -> Vec<Arg> {
        self.to_vec()
    }
}

macro_rules! impl_tuple_args {
    ($($name:ident),+) => {
        impl<$($name: Into<Arg>),+> IntoArgs for ($($name,)+) {
            #[allow(non_snake_case)]
            fn into_args(self) -> Vec<Arg> {
                let ($($name,)+) = self;
                vec![$($name.into()),+]
            }
        }
    };
}

impl_tuple_args!(A);
impl_tuple_args!(A, B);
impl_tuple_args!(A, B, C);
impl_tuple_args!(A, B, C, D);

/// The identity of one resource instance: a registered path plus its
/// argument tuple.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    path: String,
    args: Vec<Arg>,
}

impl ResourceKey {
    /// Create a key from a path and its arguments.
    pub fn new(path: impl Into<String>, args: impl IntoArgs) -> Self {
        Self {
            path: path.into(),
            args: args.into_args(),
        }
    }

    /// The registered path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The argument tuple.
    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    /// The JSON rendering `["/path",arg,...]` used in logs and audits.
    pub fn debug_name(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{self:?}"))
    }
}

impl Serialize for ResourceKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.args.len() + 1))?;
        seq.serialize_element(&self.path)?;
        for arg in &self.args {
            seq.serialize_element(arg)?;
        }
        seq.end()
    }
}

impl fmt::Debug for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)?;
        for arg in &self.args {
            write!(f, "/{arg}")?;
        }
        Ok(())
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.debug_name())
    }
}
