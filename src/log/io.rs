//! I/O helpers for bridging the async device from synchronous paths.

use std::io;

use tokio::runtime::RuntimeFlavor;

/// Executor for device I/O from a dedicated thread.
///
/// Captures the ambient Tokio runtime when one exists, otherwise owns a
/// small runtime of its own (the flush worker path).
pub(crate) struct IoExecutor {
    handle: Option<tokio::runtime::Handle>,
    runtime: Option<tokio::runtime::Runtime>,
}

impl IoExecutor {
    pub(crate) fn new() -> io::Result<Self> {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => Ok(Self {
                handle: Some(handle),
                runtime: None,
            }),
            Err(_) => Ok(Self {
                handle: None,
                runtime: Some(
                    tokio::runtime::Builder::new_current_thread()
                        .enable_time()
                        .build()?,
                ),
            }),
        }
    }

    pub(crate) fn block_on<T>(
        &self,
        fut: impl std::future::Future<Output = io::Result<T>>,
    ) -> io::Result<T> {
        if let Some(handle) = &self.handle {
            if tokio::runtime::Handle::try_current().is_ok() {
                return match handle.runtime_flavor() {
                    RuntimeFlavor::MultiThread => {
                        tokio::task::block_in_place(|| handle.block_on(fut))
                    }
                    RuntimeFlavor::CurrentThread => Err(io::Error::other(
                        "blocking log I/O is not supported on a current-thread Tokio runtime",
                    )),
                    _ => Err(io::Error::other(
                        "unsupported Tokio runtime flavor for blocking log I/O",
                    )),
                };
            }
            return handle.block_on(fut);
        }
        if let Some(runtime) = &self.runtime {
            return runtime.block_on(fut);
        }
        Err(io::Error::other("missing runtime handle"))
    }
}

/// One-shot blocking wait on a device future, for open/restore paths.
pub(crate) fn block_on_device<T>(
    fut: impl std::future::Future<Output = io::Result<T>>,
) -> io::Result<T> {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => match handle.runtime_flavor() {
            RuntimeFlavor::MultiThread => tokio::task::block_in_place(|| handle.block_on(fut)),
            RuntimeFlavor::CurrentThread => Err(io::Error::other(
                "blocking log I/O is not supported on a current-thread Tokio runtime",
            )),
            _ => Err(io::Error::other(
                "unsupported Tokio runtime flavor for blocking log I/O",
            )),
        },
        Err(_) => {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()?;
            rt.block_on(fut)
        }
    }
}
