/// Sends an update to every subscriber of a `broadcast` channel.
///
/// Having no subscribers is not an error for a library, nobody may be listening yet.
#[macro_export]
macro_rules! broadcast {
    ($tx:expr, $data:expr) => {
        if $tx.send($data.into()).is_err() {
            tracing::trace!("No subscribers for broadcast update");
        }
    };
    ($tx:expr, $data:expr, $err_msg:expr) => {
        if $tx.send($data.into()).is_err() {
            tracing::trace!($err_msg);
        }
    };
}
