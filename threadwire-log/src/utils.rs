use std::error::Error;
use std::fmt;

/// Logs an error to the configured logger or `stderr` if not yet configured.
///
/// Prefer to use [`threadwire_log::error`](crate::error) over this function whenever possible.
/// This function is intended to be used during startup, where initializing the logger may fail or
/// when errors need to be logged before the logger has been initialized.
///
/// # Example
///
/// ```
/// use std::error::Error;
///
/// if let Err(error) = std::env::var("FOO") {
///     let error: Box<dyn Error> = Box::new(error);
///     threadwire_log::ensure_error(&error);
/// }
/// ```
#[allow(clippy::print_stderr)]
pub fn ensure_error<E: AsRef<dyn Error>>(error: E) {
    if tracing::enabled!(tracing::Level::ERROR) {
        tracing::error!("{}", LogError(error.as_ref()));
    } else {
        eprintln!("error: {}", LogError(error.as_ref()));
    }
}

/// A wrapper around an [`Error`] that prints its causes.
///
/// By default every cause goes on its own line. The alternate format (`{:#}`) joins them on a
/// single line, separated by colons.
///
/// # Example
///
/// ```
/// use threadwire_log::LogError;
///
/// if let Err(error) = std::env::var("FOO") {
///     threadwire_log::error!("env failed: {}", LogError(&error));
/// }
/// ```
pub struct LogError<'a, E: Error + ?Sized>(pub &'a E);

impl<E: Error + ?Sized> fmt::Display for LogError<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;

        let separator = if f.alternate() { ": " } else { "\n  caused by: " };
        let mut source = self.0.source();
        while let Some(s) = source {
            write!(f, "{separator}{s}")?;
            source = s.source();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("outer")]
    struct Outer(#[source] std::io::Error);

    #[test]
    fn test_log_error_prints_causes() {
        let error = Outer(std::io::Error::other("inner"));
        assert_eq!(LogError(&error).to_string(), "outer\n  caused by: inner");
    }

    #[test]
    fn test_log_error_alternate_single_line() {
        let error = Outer(std::io::Error::other("inner"));
        assert_eq!(format!("{:#}", LogError(&error)), "outer: inner");
    }

    #[test]
    fn test_ensure_error_accepts_boxed_errors() {
        let error: Box<dyn Error> = Box::new(Outer(std::io::Error::other("inner")));
        ensure_error(&error);
    }
}
