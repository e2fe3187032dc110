//! Label conversions for string-backed enums
//!
//! Device kinds and log formats travel as lower-case labels in config files
//! and on the wire. [`impl_label_conversions!`](crate::impl_label_conversions)
//! derives `Display` and a case-insensitive `FromStr` from one mapping.
//!
//! ```rust
//! use cloudbridge_domain::impl_label_conversions;
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq)]
//! pub enum LinkState {
//!     Online,
//!     Offline,
//! }
//!
//! impl_label_conversions!(LinkState {
//!     Online => "online",
//!     Offline => "offline",
//! });
//!
//! assert_eq!("ONLINE".parse::<LinkState>(), Ok(LinkState::Online));
//! ```

/// `Display` writes the label; `FromStr` lower-cases the input before
/// matching and names the enum in its error.
#[macro_export]
macro_rules! impl_label_conversions {
    ($enum_name:ident { $($variant:ident => $str:expr),+ $(,)? }) => {
        impl std::fmt::Display for $enum_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $(Self::$variant => write!(f, $str),)+
                }
            }
        }

        impl std::str::FromStr for $enum_name {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s.to_lowercase().as_str() {
                    $($str => Ok(Self::$variant),)+
                    _ => Err(format!("Invalid {}: {}", stringify!($enum_name), s)),
                }
            }
        }
    };
}
