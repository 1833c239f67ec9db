//! Newtype IDs for type-safe entity references.
//!
//! Every row in the hosted backend is keyed by a UUID. The `define_id!` macro
//! wraps those UUIDs so a notification ID can never be passed where a user ID
//! is expected.

/// Macro to define a type-safe UUID wrapper.
///
/// Creates a newtype wrapper around [`uuid::Uuid`] with:
/// - `Serialize`/`Deserialize` with `#[serde(transparent)]`
/// - `Debug`, `Clone`, `Copy`, `PartialEq`, `Eq`, `Hash`
/// - Conversion methods: `new()`, `random()`, `as_uuid()`
/// - `Display` and `FromStr` using the hyphenated UUID form
///
/// # Example
///
/// ```rust
/// # use tutorial_portal_core::define_id;
/// define_id!(LessonId);
/// define_id!(CourseId);
///
/// let lesson = LessonId::random();
/// let parsed: LessonId = lesson.to_string().parse().unwrap();
/// assert_eq!(lesson, parsed);
///
/// // These are different types, so this won't compile:
/// // let _: CourseId = lesson;
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident) => {
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            ::serde::Serialize,
            ::serde::Deserialize
        )]
        #[serde(transparent)]
        pub struct $name(::uuid::Uuid);

        impl $name {
            /// Wrap an existing UUID.
            #[must_use]
            pub const fn new(id: ::uuid::Uuid) -> Self {
                Self(id)
            }

            /// Generate a fresh random (v4) ID.
            #[must_use]
            pub fn random() -> Self {
                Self(::uuid::Uuid::new_v4())
            }

            /// Get the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> ::uuid::Uuid {
                self.0
            }
        }

        impl ::core::fmt::Display for $name {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl ::core::str::FromStr for $name {
            type Err = ::uuid::Error;

            fn from_str(s: &str) -> ::core::result::Result<Self, Self::Err> {
                ::uuid::Uuid::parse_str(s).map(Self)
            }
        }

        impl From<::uuid::Uuid> for $name {
            fn from(id: ::uuid::Uuid) -> Self {
                Self(id)
            }
        }

        impl From<$name> for ::uuid::Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

// Backend row identifiers
define_id!(UserId);
define_id!(NotificationId);
define_id!(VideoId);
define_id!(CommentId);

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_hyphenated_uuid() {
        let raw = uuid::Uuid::parse_str("6f1c2a9e-3b7d-4c1e-9a55-0d2e8f4b7c11").unwrap();
        let id = UserId::new(raw);
        assert_eq!(id.to_string(), "6f1c2a9e-3b7d-4c1e-9a55-0d2e8f4b7c11");
    }

    #[test]
    fn test_from_str_rejects_garbage() {
        assert!("not-a-uuid".parse::<NotificationId>().is_err());
    }

    #[test]
    fn test_serde_is_transparent() {
        let id = VideoId::random();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: VideoId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
