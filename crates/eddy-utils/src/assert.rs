/// A reactor invariant did not hold: a readiness event for an fd the
/// poller never mapped, a timerfd tick that could not be read, an
/// eventfd that failed to signal. Debug builds panic on the spot so the
/// bug surfaces in development; release builds log the violation via
/// `tracing::error!` and let the loop keep serving its remaining
/// connections.
#[macro_export]
macro_rules! safe_panic {
    ($($arg:tt)*) => {
        if cfg!(debug_assertions) {
            panic!($($arg)*);
        } else {
            tracing::error!($($arg)*);
        }
    };
}

/// Checks a cheap loop-state invariant (connection status transitions,
/// buffer bookkeeping around user callbacks). On failure it escalates
/// through [`safe_panic!`]: fatal in debug builds, a logged error in
/// release builds. The condition is evaluated in both.
#[macro_export]
macro_rules! safe_assert {
    ($cond:expr $(,)?) => {
        if !$cond {
            $crate::safe_panic!("invariant violated: {}", stringify!($cond));
        }
    };

    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::safe_panic!($($arg)+);
        }
    };
}
