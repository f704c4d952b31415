//! Streaming chunk bodies that report transport progress.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use driveup_upload::TransferObserver;
use futures_util::Stream;
use futures_util::stream;

/// Size of the slices handed to the transport.
pub const SLICE_SIZE: usize = 64 * 1024;

/// Splits `data` into slices, reporting the cumulative count as each slice
/// is pulled. A `Break` from the observer fails the stream and sets
/// `aborted`.
pub(crate) fn observed_slices(
    data: Bytes,
    observer: Arc<dyn TransferObserver>,
    aborted: Arc<AtomicBool>,
) -> impl Stream<Item = Result<Bytes, io::Error>> + Send + 'static {
    let len = data.len();
    let mut sent: u64 = 0;
    stream::iter((0..len).step_by(SLICE_SIZE).map(move |start| {
        let slice = data.slice(start..(start + SLICE_SIZE).min(len));
        sent += slice.len() as u64;
        if observer.bytes_sent(sent).is_break() {
            aborted.store(true, Ordering::SeqCst);
            return Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "chunk upload aborted by observer",
            ));
        }
        Ok(slice)
    }))
}
