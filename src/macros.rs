/// Constructs an event at the trace level if `trace-more` is enabled.
///
/// The hot paths of the driver (ring transfers, per-record dispatch) use this
/// instead of [`tracing::trace!`] so they cost nothing in regular builds.
#[cfg(feature = "trace-more")]
macro_rules! trace {
    ($($arg:tt)+) => (::tracing::trace!($($arg)+));
}
/// Constructs an event at the trace level if `trace-more` is enabled.
#[cfg(not(feature = "trace-more"))]
macro_rules! trace {
    ($($arg:tt)+) => { () };
}
pub(crate) use trace;
