#![allow(clippy::needless_doctest_main)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables, unused_imports))
))]

//! Entry-point macros for arbor, modeled on tokio-macros.

mod entry;
mod parse;

/// Runs the async function as the entry task of a fresh
/// [`Scheduler`](../arbor/runtime/struct.Scheduler.html).
///
/// The scheduler runs until the entry task and every non-transient task it
/// spawned have finished, then closes. A failure of the entry task panics
/// with the error.
///
/// # Function arguments
///
/// The function may take a single argument, which receives the entry task's
/// own `Task` handle. It is the parent of everything the body spawns.
///
/// ```no_run
/// #[arbor::main]
/// async fn main(task: arbor::Task) {
///     let child = task.spawn(|_| async { Ok(40) });
///     println!("{:?}", child.wait(&task).await);
/// }
/// ```
///
/// Equivalent code not using `#[arbor::main]`
///
/// ```no_run
/// fn main() {
///     arbor::runtime::Builder::new()
///         .try_build()
///         .unwrap()
///         .block_on(|task| async move {
///             let child = task.spawn(|_| async { Ok(40) });
///             println!("{:?}", child.wait(&task).await);
///             Ok(())
///         })
///         .unwrap()
/// }
/// ```
///
/// # Options
///
/// - `selector = "poll" | "park"` picks the readiness backend, `poll` by
///   default. `park` has no descriptor support and only sleeps until the next
///   timer or a cross-thread wakeup.
/// - `ready_capacity = N` presizes the ready queue.
///
/// ```no_run
/// #[arbor::main(selector = "park", ready_capacity = 64)]
/// async fn main() {
///     println!("Hello world");
/// }
/// ```
#[proc_macro_attribute]
pub fn main(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::main(args.into(), item.into()).into()
}

/// Like [`main`](macro@main), for tests. Each test gets its own scheduler.
///
/// The test may return a `Result`, it is handed back to the test harness
/// as is.
///
/// ```no_run
/// use std::time::Duration;
///
/// #[arbor::test]
/// async fn my_test(task: arbor::Task) -> Result<(), arbor::Error> {
///     arbor::time::sleep(&task, Duration::from_millis(1)).await?;
///     Ok(())
/// }
/// ```
///
/// Equivalent code not using `#[arbor::test]`
///
/// ```no_run
/// use std::time::Duration;
///
/// #[test]
/// fn my_test() -> Result<(), arbor::Error> {
///     arbor::runtime::Builder::new()
///         .try_build()
///         .unwrap()
///         .block_on(|task| async move {
///             Ok(arbor::time::sleep(&task, Duration::from_millis(1)).await)
///         })
///         .unwrap()
/// }
/// ```
#[proc_macro_attribute]
pub fn test(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::test(args.into(), item.into()).into()
}
