use std::{
    any::Any,
    cell::Cell,
    future::Future,
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll},
};

use crossbeam_utils::sync::{Parker, Unparker};
use futures_util::{pin_mut, task::ArcWake};

// ===============================================================================================
// Misc
// ===============================================================================================
pub(crate) fn update_cell<T: Sized + Default, F: FnOnce(&mut T)>(v: &Cell<T>, f: F) {
    let mut vv = v.take();
    f(&mut vv);
    v.set(vv);
}

/// Locks a mutex, recovering the data if another thread panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ===============================================================================================
// Environment
// ===============================================================================================
#[doc(hidden)]
pub(crate) fn read_env(name: &str, default: &str) -> String {
    match std::env::var(name) {
        Ok(value) => value,
        Err(_) => default.to_string(),
    }
}

/// Reads and parses an optional environment variable. Unset or blank variables yield `None`.
pub(crate) fn parse_env<T>(name: &str) -> Result<Option<T>, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let value = read_env(name, "");
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }

    value
        .parse::<T>()
        .map(Some)
        .map_err(|e| format!("cannot parse environment variable {}={:?}: {}", name, value, e))
}

// ===============================================================================================
// Futures
// ===============================================================================================
/// Extension trait for efficiently blocking on a future.
#[doc(hidden)]
pub trait Join: Future {
    fn join(self) -> <Self as Future>::Output;
}

impl<F: Future> Join for F {
    fn join(self) -> <Self as Future>::Output {
        struct ThreadWaker(Unparker);

        impl ArcWake for ThreadWaker {
            fn wake_by_ref(arc_self: &Arc<Self>) {
                arc_self.0.unpark();
            }
        }

        let parker = Parker::new();
        let waker = futures_util::task::waker(Arc::new(ThreadWaker(parker.unparker().clone())));
        let mut context = Context::from_waker(&waker);

        let future = self;
        pin_mut!(future);

        loop {
            match future.as_mut().poll(&mut context) {
                Poll::Ready(output) => return output,
                Poll::Pending => parker.park(),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::{parse_env, update_cell, Join};
    use std::{cell::Cell, time::Duration};

    #[test]
    fn join_waits_for_a_value_sent_from_another_thread() {
        let (sender, receiver) = tokio::sync::oneshot::channel::<u32>();

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            let _ = sender.send(42);
        });

        assert_eq!(receiver.join(), Ok(42));
    }

    #[test]
    fn update_cell_modifies_in_place() {
        let cell = Cell::new(vec![1]);
        update_cell(&cell, |v| v.push(2));
        assert_eq!(cell.take(), vec![1, 2]);
    }

    #[test]
    fn parse_env_reports_unset_and_invalid_values() {
        std::env::remove_var("HTTPSTUB_UTIL_TEST_UNSET");
        assert_eq!(parse_env::<u16>("HTTPSTUB_UTIL_TEST_UNSET"), Ok(None));

        std::env::set_var("HTTPSTUB_UTIL_TEST_PORT", " 8080 ");
        assert_eq!(parse_env::<u16>("HTTPSTUB_UTIL_TEST_PORT"), Ok(Some(8080)));

        std::env::set_var("HTTPSTUB_UTIL_TEST_BAD", "eighty");
        let err = parse_env::<u16>("HTTPSTUB_UTIL_TEST_BAD").unwrap_err();
        assert!(err.contains("HTTPSTUB_UTIL_TEST_BAD"));
    }
}
