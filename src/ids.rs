//! ULID-backed identifiers for requests and scheduled tasks.

use std::fmt;

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
        pub struct $name(pub ulid::Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(ulid::Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

ulid_id!(
    /// Identifies the inbound request a detached context was copied from.
    RequestId
);

ulid_id!(
    /// Identifies one scheduled unit of work across its log lines and reports.
    TaskId
);

impl RequestId {
    /// Parse a caller-supplied `x-request-id` value. Anything but a ULID is ignored.
    #[must_use]
    pub fn from_header(value: &str) -> Option<Self> {
        ulid::Ulid::from_string(value.trim()).ok().map(Self)
    }
}
