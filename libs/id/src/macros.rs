//! Macros for defining typed identifier types.

/// Maximum identifier length accepted by [`define_id!`] types.
pub const MAX_ID_LEN: usize = 255;

/// Validate a raw identifier string.
#[doc(hidden)]
pub fn validate(s: &str) -> Result<(), crate::IdError> {
    if s.is_empty() {
        return Err(crate::IdError::Empty);
    }

    if s.len() > MAX_ID_LEN {
        return Err(crate::IdError::TooLong {
            len: s.len(),
            max: MAX_ID_LEN,
        });
    }

    if let Some((position, character)) = s
        .char_indices()
        .find(|(_, c)| c.is_whitespace() || c.is_control())
    {
        return Err(crate::IdError::InvalidCharacter {
            character,
            position,
        });
    }

    Ok(())
}

/// Macro to define a typed, string-backed identifier.
///
/// This generates a newtype wrapper around `String` with:
/// - `parse()` to validate and wrap a raw string
/// - `as_str()` to borrow the raw value
/// - `Display` and `FromStr` implementations
/// - `Serialize`/`Deserialize` in the protocol's `{"value": "..."}` shape
/// - `Ord`, `Hash`, and other standard traits
///
/// A second form takes a prefix and additionally generates `generate()`,
/// which mints a fresh `{prefix}_{ulid}` identifier.
///
/// # Example
///
/// ```ignore
/// define_id!(AgentId);
/// define_id!(TaskId, "task");
///
/// let agent: AgentId = "S0".parse()?;
/// let task = TaskId::generate();
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident) => {
        /// A typed identifier for this resource type.
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            /// Parses an identifier from a string.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                $crate::__validate(s)?;
                Ok(Self(s.to_string()))
            }

            /// Returns the raw identifier value.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consumes the identifier, returning the raw value.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                use serde::ser::SerializeStruct;

                let mut state = serializer.serialize_struct(stringify!($name), 1)?;
                state.serialize_field("value", &self.0)?;
                state.end()
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                #[derive(serde::Deserialize)]
                struct Wire {
                    value: String,
                }

                let wire = Wire::deserialize(deserializer)?;
                Self::parse(&wire.value).map_err(serde::de::Error::custom)
            }
        }
    };

    ($name:ident, $prefix:literal) => {
        $crate::define_id!($name);

        impl $name {
            /// The prefix used by identifiers minted with `generate()`.
            pub const PREFIX: &'static str = $prefix;

            /// Mints a fresh identifier of the form `{prefix}_{ulid}`.
            #[must_use]
            pub fn generate() -> Self {
                Self(format!("{}_{}", Self::PREFIX, $crate::Ulid::new()))
            }
        }
    };
}
