//! Error annotation shared across roost crates.
//!
//! Library crates keep their own structured error enums instead of a
//! catch-all type. The one piece of shared machinery is [`Annotate`]: a
//! crate error implements [`FromMessage`], and any fallible expression can
//! then be tagged with `.annotate("...")`, folding the source error's text
//! into the crate's error type. The target type is inferred from the `?`
//! site, so call sites stay free of `map_err` boilerplate without pulling
//! `anyhow` into library code.

use std::fmt;

/// Implemented by crate error types that can absorb a plain message
/// (typically into their internal-error variant).
pub trait FromMessage: Sized {
    fn from_message(message: String) -> Self;
}

/// Context tagging for `Result` and `Option`, targeting any
/// [`FromMessage`] error.
pub trait Annotate<T, E> {
    /// Tag a failure with fixed context.
    fn annotate(self, context: impl fmt::Display) -> Result<T, E>;

    /// Tag a failure with lazily built context.
    fn annotate_with<C, F>(self, build: F) -> Result<T, E>
    where
        C: fmt::Display,
        F: FnOnce() -> C;
}

impl<T, S, E> Annotate<T, E> for Result<T, S>
where
    S: fmt::Display,
    E: FromMessage,
{
    fn annotate(self, context: impl fmt::Display) -> Result<T, E> {
        self.map_err(|source| E::from_message(format!("{context}: {source}")))
    }

    fn annotate_with<C, F>(self, build: F) -> Result<T, E>
    where
        C: fmt::Display,
        F: FnOnce() -> C,
    {
        self.map_err(|source| E::from_message(format!("{}: {source}", build())))
    }
}

impl<T, E> Annotate<T, E> for Option<T>
where
    E: FromMessage,
{
    fn annotate(self, context: impl fmt::Display) -> Result<T, E> {
        self.ok_or_else(|| E::from_message(context.to_string()))
    }

    fn annotate_with<C, F>(self, build: F) -> Result<T, E>
    where
        C: fmt::Display,
        F: FnOnce() -> C,
    {
        self.ok_or_else(|| E::from_message(build().to_string()))
    }
}
