/// Crate-wide assertion on protocol invariants. Funnels every invariant
/// check through one macro so failures can be routed to a single place.
macro_rules! chert_assert {
    ($cond:expr $(, $($arg:tt)+)?) => {
        assert!($cond $(, $($arg)+)?)
    };
}

pub(crate) use chert_assert;

/// Debug-build-only variant of [`chert_assert!`].
macro_rules! chert_debug_assert {
    ($cond:expr $(, $($arg:tt)+)?) => {
        debug_assert!($cond $(, $($arg)+)?)
    };
}

pub(crate) use chert_debug_assert;

/// Assert that a type implements both Send and Sync at compile time.
/// Usage: assert_send_sync!(MyType);
/// Usage: assert_send_sync!(Type1, Type2, Type3);
macro_rules! assert_send_sync {
    ($($t:ty),+ $(,)?) => {
        #[cfg(test)]
        $(const _: () = {
            const fn _assert_send<T: ?Sized + Send>() {}
            const fn _assert_sync<T: ?Sized + Sync>() {}
            _assert_send::<$t>();
            _assert_sync::<$t>();
        };)+
    };
}

pub(crate) use assert_send_sync;
