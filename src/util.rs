use anyhow::anyhow;
use sentry_core::protocol::SpanStatus;
use std::any::Any;

/// Try to figure out what's in the box, and format it if we can.
///
/// The error type we get from `panic::catch_unwind` is poorly documented, but
/// panic payloads are "commonly but not always" a `&'static str` or `String`,
/// so we try both of those and give up otherwise.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send + 'static)) -> anyhow::Error {
    if let Some(x) = info.downcast_ref::<&'static str>() {
        anyhow!("job panicked: {x}")
    } else if let Some(x) = info.downcast_ref::<String>() {
        anyhow!("job panicked: {x}")
    } else {
        anyhow!("job panicked")
    }
}

/// Run `callback` inside a sentry transaction named after the job module.
pub(crate) async fn with_sentry_transaction<F, R, E>(
    transaction_name: &str,
    callback: F,
) -> Result<R, E>
where
    F: AsyncFnOnce() -> Result<R, E>,
{
    let tx_ctx = sentry_core::TransactionContext::new(transaction_name, "rihanna.perform");
    let tx = sentry_core::start_transaction(tx_ctx);

    let result = callback().await;

    tx.set_status(match result.is_ok() {
        true => SpanStatus::Ok,
        false => SpanStatus::UnknownError,
    });
    tx.finish();

    result
}
