//! Macros for defining typed ID types.

/// Macro to define a typed, store-assigned ID with a specific prefix.
///
/// This generates a newtype wrapper around a positive `i64` with:
/// - A `PREFIX` constant
/// - `new()` to wrap a raw value (rejecting zero and negatives)
/// - `parse()` accepting either `{prefix}_{n}` or a bare `n`
/// - `Display` (prefixed) and `FromStr` implementations
/// - `Serialize` and `Deserialize` as the raw integer
/// - `Ord`, `Hash`, and other standard traits
///
/// # Example
///
/// ```ignore
/// define_id!(NodeId, "node");
///
/// let id = NodeId::new(7)?;
/// assert_eq!(id.to_string(), "node_7");
/// let parsed: NodeId = "node_7".parse()?;
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        /// A typed ID for this record type.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(i64);

        impl $name {
            /// The prefix for this ID type.
            pub const PREFIX: &'static str = $prefix;

            /// The first ID a store hands out.
            pub const FIRST: Self = Self(1);

            /// The ID a store hands out after this one.
            #[must_use]
            pub const fn next(&self) -> Self {
                Self(self.0 + 1)
            }

            /// Wraps a raw store-assigned value.
            pub fn new(value: i64) -> Result<Self, $crate::IdError> {
                if value <= 0 {
                    return Err($crate::IdError::InvalidNumber(value.to_string()));
                }
                Ok(Self(value))
            }

            /// Returns the raw value.
            #[must_use]
            pub const fn value(&self) -> i64 {
                self.0
            }

            /// Parses an ID from a string.
            ///
            /// Accepts `{prefix}_{n}` or a bare `n` (the form stored in
            /// free-form attribute maps).
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                let s = s.trim();
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }

                let digits = match s.split_once('_') {
                    Some((prefix, rest)) => {
                        if prefix != Self::PREFIX {
                            return Err($crate::IdError::InvalidPrefix {
                                expected: Self::PREFIX,
                                actual: prefix.to_string(),
                            });
                        }
                        rest
                    }
                    None => s,
                };

                let value = digits
                    .parse::<i64>()
                    .map_err(|_| $crate::IdError::InvalidNumber(digits.to_string()))?;

                Self::new(value)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}_{}", Self::PREFIX, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<i64> for $name {
            type Error = $crate::IdError;

            fn try_from(value: i64) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_i64(self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let value = i64::deserialize(deserializer)?;
                Self::new(value).map_err(serde::de::Error::custom)
            }
        }
    };
}
