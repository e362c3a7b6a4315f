//! Backtrace capture for panicking scenario code.
//!
//! A chained panic hook stashes the backtrace in a thread-local; the task
//! that caught the unwind reads it back on the same thread, in the same poll.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic;
use std::sync::Once;

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

thread_local! {
    static LAST_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static INSTALL: Once = Once::new();

pub(crate) fn install_hook() {
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let trace = Backtrace::force_capture().to_string();
            LAST_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            previous(info);
        }));
    });
}

fn take_backtrace() -> Option<String> {
    LAST_BACKTRACE.with(|slot| slot.borrow_mut().take())
}

fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// A caught panic: its message and, when the hook saw it, a backtrace.
#[derive(Debug, Clone)]
pub struct Caught {
    pub message: String,
    pub backtrace: Option<String>,
}

/// Poll `fut` to completion, converting a panic into [`Caught`].
pub(crate) async fn catch<F, T>(fut: F) -> Result<T, Caught>
where
    F: Future<Output = T>,
{
    install_hook();
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(value) => Ok(value),
        Err(payload) => Err(Caught {
            message: payload_message(payload.as_ref()),
            backtrace: take_backtrace(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn catches_panic_with_backtrace() {
        let caught = catch(async {
            if true {
                panic!("boom at step 3");
            }
        })
        .await
        .unwrap_err();
        assert_eq!(caught.message, "boom at step 3");
        assert!(caught.backtrace.is_some());
    }

    #[tokio::test]
    async fn passes_values_through() {
        assert_eq!(catch(async { 7 }).await.unwrap(), 7);
    }
}
