use std::future::Future;

pub struct Runtime;

pub type JoinHandle<T> = ::async_std::task::JoinHandle<T>;

pub fn init(_num_threads: usize) -> Result<Runtime, ()> {
    // `async-std`'s executor is a lazily-initialized global; there is
    // nothing to build ahead of time, unlike the `tokio` backend.
    Ok(Runtime)
}

pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    ::async_std::task::spawn(future)
}
